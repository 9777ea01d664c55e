//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、モデル構成、学習スケジュール、タイル設定などをJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::MlMapError;

/// 計算デバイスの種類
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    #[default]
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// 特徴ベクトルの作り方
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    /// 切り出した画素をRGBごとに並べて正規化
    #[default]
    Raw,
    /// 学習済み分類器の上位K個の確率
    Pretrained,
}

impl std::fmt::Display for ExtractionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractionMode::Raw => write!(f, "raw"),
            ExtractionMode::Pretrained => write!(f, "pretrained"),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// 入力特徴ベクトル長
    pub input_size: usize,
    /// 隠れ層のユニット数（3層）
    pub hidden_sizes: [usize; 3],
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            input_size: 3000,
            hidden_sizes: [64, 32, 16],
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// 初期学習率
    pub initial_learning_rate: f64,
    /// 学習率の減衰率
    pub decay_rate: f64,
    /// 何ステップごとに減衰させるか
    pub decay_steps: usize,
    /// 1フレームあたりのステップ数（最後のステップのみ損失を読み出す）
    pub steps_per_tick: usize,
    /// 1回の学習で実行する総ステップ数
    pub max_steps: usize,
    /// バッチサイズ（未指定なら学習データ全体）
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// ランダムシード
    pub seed: u64,
    /// フレーム間隔（ミリ秒）
    pub frame_interval_ms: u64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            initial_learning_rate: 0.042,
            decay_rate: 0.85,
            decay_steps: 42,
            steps_per_tick: 5,
            max_steps: 50,
            batch_size: None,
            seed: 42,
            frame_interval_ms: 16,
        }
    }
}

/// タイル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileSettings {
    /// 作業ズームレベル（保存データのスキーマの一部）
    pub zoom: u32,
    /// タイル取得の再試行回数
    pub fetch_retries: u32,
    /// タイル画像のディレクトリ `{z}/{x}/{y}.png`
    #[serde(default)]
    pub tile_dir: Option<String>,
    /// 1件の注釈で扱うタイル数の上限
    #[serde(default = "default_max_tiles")]
    pub max_tiles_per_annotation: usize,
}

fn default_max_tiles() -> usize {
    64
}

impl Default for TileSettings {
    fn default() -> Self {
        Self {
            zoom: 17,
            fetch_retries: 2,
            tile_dir: None,
            max_tiles_per_annotation: default_max_tiles(),
        }
    }
}

/// 特徴抽出設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionSettings {
    /// 特徴ベクトルの作り方
    pub mode: ExtractionMode,
    /// 新しく作る特徴抽出器の入力サイズ（読み込んだ抽出器は自身のサイズを使う）
    pub canonical_size: u32,
    /// 学習済み分類器の重みファイル（tar.gz）
    #[serde(default)]
    pub extractor_path: Option<String>,
    /// 1件の注釈あたりに追加するノイズ付きコピー数
    #[serde(default)]
    pub noise_copies: usize,
    /// ノイズの振幅
    #[serde(default = "default_noise_amplitude")]
    pub noise_amplitude: f32,
}

fn default_noise_amplitude() -> f32 {
    0.02
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            mode: ExtractionMode::Raw,
            canonical_size: 227,
            extractor_path: None,
            noise_copies: 0,
            noise_amplitude: default_noise_amplitude(),
        }
    }
}

/// 学習データ保存設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// 学習データの保存先
    pub store_path: String,
    /// 特徴ベクトルも保存するか（falseならラベルのみ保存し、再読み込み時にタイルから再抽出）
    pub persist_features: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            store_path: "training_data.json".to_string(),
            persist_features: true,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// モデル設定
    pub model: ModelSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// タイル設定
    pub tiles: TileSettings,
    /// 特徴抽出設定
    pub extraction: ExtractionSettings,
    /// 学習データ保存設定
    pub storage: StorageSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("mlmap.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// 指定パスから設定を読み込む、存在しない場合はデフォルト設定を返す
    pub fn load_or_default_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// デフォルトパスから設定を読み込む
    pub fn load_or_default() -> Self {
        Self::load_or_default_from(Self::default_path())
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 設定値の整合性を検証
    pub fn validate(&self) -> Result<(), MlMapError> {
        let t = &self.training;
        if self.model.input_size == 0 {
            return Err(MlMapError::Config("input_size は1以上が必要です".to_string()));
        }
        if self.model.hidden_sizes.iter().any(|&h| h == 0) {
            return Err(MlMapError::Config("hidden_sizes に0は指定できません".to_string()));
        }
        if t.steps_per_tick == 0 || t.max_steps == 0 || t.decay_steps == 0 {
            return Err(MlMapError::Config(
                "steps_per_tick / max_steps / decay_steps は1以上が必要です".to_string(),
            ));
        }
        if !(t.decay_rate > 0.0 && t.decay_rate <= 1.0) {
            return Err(MlMapError::Config(format!("decay_rate は (0, 1] の範囲: {}", t.decay_rate)));
        }
        if !(t.initial_learning_rate.is_finite() && t.initial_learning_rate > 0.0) {
            return Err(MlMapError::Config(format!(
                "initial_learning_rate が不正です: {}",
                t.initial_learning_rate
            )));
        }
        if t.batch_size == Some(0) {
            return Err(MlMapError::Config("batch_size に0は指定できません".to_string()));
        }
        if self.tiles.max_tiles_per_annotation == 0 {
            return Err(MlMapError::Config("max_tiles_per_annotation は1以上が必要です".to_string()));
        }
        if self.tiles.zoom > 24 {
            return Err(MlMapError::Config(format!("zoom が大きすぎます: {}", self.tiles.zoom)));
        }
        if self.extraction.mode == ExtractionMode::Pretrained && self.extraction.canonical_size == 0 {
            return Err(MlMapError::Config("canonical_size は1以上が必要です".to_string()));
        }
        if self.extraction.mode == ExtractionMode::Raw && self.model.input_size % 3 != 0 {
            warn!(
                "input_size ({}) が3の倍数ではありません。末尾はゼロ埋めされます",
                self.model.input_size
            );
        }
        Ok(())
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== アプリケーション設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!("入力サイズ: {}", self.model.input_size);
        println!("隠れ層: {:?}", self.model.hidden_sizes);
        println!("\n--- トレーニング設定 ---");
        println!("初期学習率: {}", self.training.initial_learning_rate);
        println!(
            "減衰: {}ステップごとに x{}",
            self.training.decay_steps, self.training.decay_rate
        );
        println!("ステップ数: {} (1フレーム {}ステップ)", self.training.max_steps, self.training.steps_per_tick);
        match self.training.batch_size {
            Some(size) => println!("バッチサイズ: {}", size),
            None => println!("バッチサイズ: 学習データ全体"),
        }
        println!("シード: {}", self.training.seed);
        println!("\n--- タイル設定 ---");
        println!("ズーム: {}", self.tiles.zoom);
        println!("再試行回数: {}", self.tiles.fetch_retries);
        println!("注釈あたりのタイル上限: {}", self.tiles.max_tiles_per_annotation);
        if let Some(ref dir) = self.tiles.tile_dir {
            println!("タイルディレクトリ: {}", dir);
        }
        println!("\n--- 特徴抽出 ---");
        println!("モード: {}", self.extraction.mode);
        if self.extraction.mode == ExtractionMode::Pretrained {
            println!("正規化サイズ: {}x{}", self.extraction.canonical_size, self.extraction.canonical_size);
        }
        println!("保存先: {}", self.storage.store_path);
        println!("========================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.model.input_size, 3000);
        assert_eq!(config.model.hidden_sizes, [64, 32, 16]);
        assert_eq!(config.training.max_steps, 50);
        assert_eq!(config.training.steps_per_tick, 5);
        assert_eq!(config.tiles.zoom, 17);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: AppConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.device_type, deserialized.device_type);
        assert_eq!(config.model.input_size, deserialized.model.input_size);
        assert_eq!(deserialized.extraction.mode, ExtractionMode::Raw);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mlmap.json");
        let mut config = AppConfig::default();
        config.training.batch_size = Some(8);
        config.extraction.mode = ExtractionMode::Pretrained;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.training.batch_size, Some(8));
        assert_eq!(loaded.extraction.mode, ExtractionMode::Pretrained);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.training.decay_rate = 1.5;
        assert!(matches!(config.validate(), Err(MlMapError::Config(_))));

        let mut config = AppConfig::default();
        config.training.batch_size = Some(0);
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.training.steps_per_tick = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }
}
