//! 注釈から学習・推論までをまとめるセッション
//!
//! 設定、学習データ、永続化、分類器、特徴抽出器のゲートを1つのセッションが所有します。
//!
//! ## 注釈の流れ
//! 1. 矩形を覆うタイルを求める（作業ズーム固定）
//! 2. 各タイルの切り出し範囲を計算し、空ならスキップ
//! 3. タイルを並行に取得し、完了した順に特徴を抽出
//! 4. 学習データに追加し、永続化層にも書き込む

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use burn::tensor::backend::AutodiffBackend;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::dataset::{ExampleStore, PersistedExample, TrainingPersistence};
use crate::error::{MlMapError, Result};
use crate::extraction::{jitter, ExtractorGate, PatchExtractor, PretrainedExtractor};
use crate::geo::{covering_tiles, tile_crop};
use crate::ml::{run_training, scan_grid, Candidate, Ticker, Trainer, TrainingReport};
use crate::model::config::{AppConfig, ExtractionMode};
use crate::tiles::{fetch_with_retry, TileRaster, TileSource};
use crate::types::{CropRect, GeoBBox, Label, TileCoord, TrainingKey};

/// 注釈1件の処理結果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnotationReport {
    /// 矩形を覆うタイル数
    pub tiles: usize,
    /// 追加した学習データ数（ノイズ付きコピーは含まない）
    pub added: usize,
    /// 切り出し範囲が空でスキップしたタイル数
    pub skipped_degenerate: usize,
    /// 取得に失敗したタイル
    pub failed_tiles: Vec<TileCoord>,
}

/// 保存データ読み込みの結果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoreReport {
    /// 保存済みの特徴をそのまま使った件数
    pub loaded: usize,
    /// タイルから再抽出した件数
    pub reextracted: usize,
    /// 読み込めなかった件数
    pub skipped: usize,
}

/// 学習セッション
pub struct Session<B: AutodiffBackend> {
    config: AppConfig,
    extractor: PatchExtractor,
    store: ExampleStore,
    persistence: Box<dyn TrainingPersistence>,
    trainer: Trainer<B>,
    gate: ExtractorGate,
    rng: StdRng,
}

impl<B: AutodiffBackend> Session<B> {
    pub fn new(
        config: AppConfig,
        persistence: Box<dyn TrainingPersistence>,
        gate: ExtractorGate,
        device: B::Device,
    ) -> Result<Self> {
        config.validate()?;

        let extractor = PatchExtractor::new(config.extraction.mode, config.model.input_size);
        let store = ExampleStore::new(config.model.input_size);
        let trainer = Trainer::new(config.model.clone(), config.training.clone(), device);
        let rng = StdRng::seed_from_u64(config.training.seed);

        Ok(Self {
            config,
            extractor,
            store,
            persistence,
            trainer,
            gate,
            rng,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &ExampleStore {
        &self.store
    }

    pub fn persistence(&self) -> &dyn TrainingPersistence {
        self.persistence.as_ref()
    }

    pub fn trainer(&self) -> &Trainer<B> {
        &self.trainer
    }

    pub fn gate(&self) -> &ExtractorGate {
        &self.gate
    }

    fn zoom(&self) -> u32 {
        self.config.tiles.zoom
    }

    /// 特徴抽出器モードなら準備完了まで待つ
    async fn pretrained_for_annotation(&self) -> Result<Option<Arc<dyn PretrainedExtractor>>> {
        match self.config.extraction.mode {
            ExtractionMode::Raw => Ok(None),
            ExtractionMode::Pretrained => self.gate.wait_ready().await.map(Some),
        }
    }

    /// 特徴抽出器モードで準備ができていなければ即座に失敗する
    fn pretrained_now(&self) -> Result<Option<Arc<dyn PretrainedExtractor>>> {
        match self.config.extraction.mode {
            ExtractionMode::Raw => Ok(None),
            ExtractionMode::Pretrained => self.gate.get().map(Some),
        }
    }

    /// 永続化してから学習データに追加する（ノイズ付きコピーは学習データにだけ追加）
    ///
    /// 保存に失敗した場合は学習データを変更しない。
    fn add_example(&mut self, key: TrainingKey, features: Vec<f32>, label: Label) -> Result<()> {
        if features.len() != self.store.input_size() {
            return Err(MlMapError::FeatureLength {
                expected: self.store.input_size(),
                actual: features.len(),
            });
        }
        let persisted = PersistedExample {
            label,
            features: self.config.storage.persist_features.then(|| features.clone()),
        };
        self.persistence.put(&key, persisted)?;
        self.append_with_copies(key, features, label)
    }

    /// 同じキーの学習データ（コピーを含む）を置き換える
    fn append_with_copies(&mut self, key: TrainingKey, features: Vec<f32>, label: Label) -> Result<()> {
        let replaced = self.store.remove(&key);
        if replaced > 0 {
            debug!("既存の学習データを置き換えます: {}件", replaced);
        }
        let amplitude = self.config.extraction.noise_amplitude;
        for _ in 0..self.config.extraction.noise_copies {
            let noisy = jitter(&features, amplitude, &mut self.rng);
            self.store.append(key, noisy, label)?;
        }
        self.store.append(key, features, label)
    }

    /// 矩形に注釈を付けて学習データを作る
    ///
    /// タイルは並行に取得し、完了した順に追加する。取得に失敗したタイルは警告を出してスキップする。
    pub async fn annotate<S: TileSource>(
        &mut self,
        bbox: GeoBBox,
        label: Label,
        source: Arc<S>,
    ) -> Result<AnnotationReport> {
        let pretrained = self.pretrained_for_annotation().await?;
        let range = covering_tiles(&bbox, self.zoom());
        let max_tiles = self.config.tiles.max_tiles_per_annotation;
        if range.len() > max_tiles {
            return Err(MlMapError::Config(format!(
                "矩形が広すぎます: {}枚のタイル (上限 {}枚)",
                range.len(),
                max_tiles
            )));
        }
        let retries = self.config.tiles.fetch_retries;

        let mut report = AnnotationReport {
            tiles: range.len(),
            ..AnnotationReport::default()
        };

        let mut tasks = JoinSet::new();
        for coord in range.iter() {
            let crop = tile_crop(&bbox, coord);
            if crop.is_empty() {
                debug!("切り出し範囲が空のためスキップします: {}", coord);
                report.skipped_degenerate += 1;
                continue;
            }
            let source = Arc::clone(&source);
            tasks.spawn(async move {
                let fetched = fetch_with_retry(source.as_ref(), coord, retries).await;
                (coord, crop, fetched)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (coord, crop, fetched) = joined.map_err(|e| MlMapError::Task(e.to_string()))?;
            let raster = match fetched {
                Ok(raster) => raster,
                Err(e) => {
                    warn!("タイル {} の学習データを作れませんでした: {}", coord, e);
                    report.failed_tiles.push(coord);
                    continue;
                }
            };

            let features = self.extractor.extract(&raster, &crop, pretrained.as_deref())?;
            self.add_example(TrainingKey::new(bbox, coord.x, coord.y), features, label)?;
            report.added += 1;
        }

        info!(
            "注釈を追加しました ({}): {}件追加, 空 {}件, 失敗 {}件 (合計 {}件)",
            label,
            report.added,
            report.skipped_degenerate,
            report.failed_tiles.len(),
            self.store.len()
        );
        Ok(report)
    }

    /// 注釈を削除する
    ///
    /// 削除済みの学習データがすでに分類器に与えた影響は取り消さない。
    pub fn remove_annotation(&mut self, bbox: &GeoBBox) -> Result<usize> {
        let removed = self.store.remove_bbox(bbox);
        let deleted = self.persistence.delete_bbox(bbox)?;
        info!("注釈を削除しました: 学習データ {}件, 保存データ {}件", removed, deleted);
        Ok(removed)
    }

    /// すべての学習データを削除する
    pub fn clear(&mut self) -> Result<()> {
        self.trainer.stop();
        self.store.clear();
        self.persistence.clear()?;
        info!("学習データをすべて削除しました");
        Ok(())
    }

    /// 保存データから学習データを復元する
    ///
    /// 特徴が保存されていないデータはタイルから再抽出する。
    pub async fn restore<S: TileSource>(&mut self, source: &S) -> Result<RestoreReport> {
        let entries = self.persistence.get_all()?;
        let mut report = RestoreReport::default();
        let input_size = self.config.model.input_size;
        let retries = self.config.tiles.fetch_retries;
        let mut pretrained = None;

        for (key, entry) in entries {
            if let Some(features) = entry.features.filter(|f| f.len() == input_size) {
                self.append_with_copies(key, features, entry.label)?;
                report.loaded += 1;
                continue;
            }

            let coord = TileCoord::new(key.x, key.y, self.zoom());
            let crop = tile_crop(&key.bbox, coord);
            if crop.is_empty() {
                report.skipped += 1;
                continue;
            }
            let raster = match fetch_with_retry(source, coord, retries).await {
                Ok(raster) => raster,
                Err(e) => {
                    warn!("保存データを再抽出できませんでした ({}): {}", coord, e);
                    report.skipped += 1;
                    continue;
                }
            };
            if pretrained.is_none() {
                pretrained = self.pretrained_for_annotation().await?;
            }
            let features = self.extractor.extract(&raster, &crop, pretrained.as_deref())?;
            self.append_with_copies(key, features, entry.label)?;
            report.reextracted += 1;
        }

        info!(
            "学習データを復元しました: 読み込み {}件, 再抽出 {}件, スキップ {}件",
            report.loaded, report.reextracted, report.skipped
        );
        Ok(report)
    }

    /// 学習を実行する（フレームごとにtickを進める）
    pub async fn train<T: Ticker>(&mut self, ticker: &mut T, cancel: &AtomicBool) -> Result<TrainingReport> {
        self.trainer.begin(&self.store, &mut self.rng)?;
        run_training(&mut self.trainer, ticker, cancel).await
    }

    /// 特徴ベクトルを採点する
    pub fn predict(&self, features: &[f32]) -> Result<f32> {
        self.trainer.predict(features)
    }

    /// タイル画像の一部を採点する
    pub fn predict_patch(&self, raster: &TileRaster, crop: &CropRect) -> Result<f32> {
        let pretrained = self.pretrained_now()?;
        let features = self.extractor.extract(raster, crop, pretrained.as_deref())?;
        self.trainer.predict(&features)
    }

    /// タイル全体を4x4の格子で走査する
    pub fn scan_tile(&self, raster: &TileRaster, coord: TileCoord) -> Result<Vec<Candidate>> {
        let pretrained = self.pretrained_now()?;
        scan_grid(raster, coord, |crop| {
            let features = self.extractor.extract(raster, crop, pretrained.as_deref())?;
            self.trainer.predict(&features)
        })
    }

    /// 分類器を保存する
    pub fn save_model(&self, path: &Path) -> anyhow::Result<()> {
        self.trainer.save(
            path,
            self.config.extraction.mode,
            self.zoom(),
            self.store.len(),
        )
    }
}
