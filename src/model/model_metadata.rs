//! モデルメタデータの定義
//!
//! tar.gz形式でモデルと共に保存され、読み込み時のモデル構築に使われます。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::config::ExtractionMode;

/// アーカイブに保存されたモデルの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// 特徴ベクトルからスコアを出す全結合ネットワーク
    Classifier,
    /// 学習済み特徴抽出器（CNN）
    Extractor,
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelKind::Classifier => write!(f, "classifier"),
            ModelKind::Extractor => write!(f, "extractor"),
        }
    }
}

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub kind: ModelKind,

    /// 分類器の入力特徴ベクトル長
    #[serde(default)]
    pub input_size: usize,

    /// 分類器の隠れ層
    #[serde(default)]
    pub hidden_sizes: Vec<usize>,

    /// 特徴抽出器の出力クラス数
    #[serde(default)]
    pub num_classes: usize,

    /// 特徴抽出器の入力画像サイズ（正方形）
    #[serde(default)]
    pub canonical_size: u32,

    /// 学習時の特徴の作り方
    #[serde(default)]
    pub extraction_mode: ExtractionMode,

    /// 学習データの作業ズーム
    #[serde(default)]
    pub zoom: u32,

    /// 学習データ件数
    #[serde(default)]
    pub num_examples: usize,

    /// 累計学習ステップ数
    #[serde(default)]
    pub steps: usize,

    /// モデルの保存時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 分類器のメタデータ
    pub fn classifier(
        input_size: usize,
        hidden_sizes: &[usize],
        extraction_mode: ExtractionMode,
        zoom: u32,
        num_examples: usize,
        steps: usize,
    ) -> Self {
        Self {
            kind: ModelKind::Classifier,
            input_size,
            hidden_sizes: hidden_sizes.to_vec(),
            num_classes: 0,
            canonical_size: 0,
            extraction_mode,
            zoom,
            num_examples,
            steps,
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// 特徴抽出器のメタデータ
    pub fn extractor(num_classes: usize, canonical_size: u32) -> Self {
        Self {
            kind: ModelKind::Extractor,
            input_size: 0,
            hidden_sizes: Vec::new(),
            num_classes,
            canonical_size,
            extraction_mode: ExtractionMode::Pretrained,
            zoom: 0,
            num_examples: 0,
            steps: 0,
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// 分類器の隠れ層を3層の配列として取り出す
    pub fn hidden_layers(&self) -> Result<[usize; 3]> {
        <[usize; 3]>::try_from(self.hidden_sizes.as_slice())
            .map_err(|_| anyhow::anyhow!("隠れ層は3層である必要があります: {:?}", self.hidden_sizes))
    }

    /// 想定した種類のモデルかどうか確認
    pub fn expect_kind(&self, kind: ModelKind) -> Result<()> {
        if self.kind != kind {
            anyhow::bail!("モデルの種類が違います: {} (期待: {})", self.kind, kind);
        }
        Ok(())
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifier_metadata_json() {
        let metadata = ModelMetadata::classifier(3000, &[64, 32, 16], ExtractionMode::Raw, 17, 4, 50);
        let json = metadata.to_json_string().unwrap();
        assert!(json.contains("\"kind\": \"classifier\""));

        let parsed = ModelMetadata::from_json_string(&json).unwrap();
        assert_eq!(parsed.hidden_layers().unwrap(), [64, 32, 16]);
        assert_eq!(parsed.zoom, 17);
        assert!(parsed.expect_kind(ModelKind::Classifier).is_ok());
        assert!(parsed.expect_kind(ModelKind::Extractor).is_err());
    }

    #[test]
    fn test_extractor_has_no_hidden_layers() {
        let metadata = ModelMetadata::extractor(10, 32);
        assert!(metadata.hidden_layers().is_err());
        assert_eq!(metadata.extraction_mode, ExtractionMode::Pretrained);
    }
}
