//! モデル推論機能

use std::path::Path;

use anyhow::Result;
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use tracing::info;

use crate::error::MlMapError;
use crate::extraction::{PatchExtractor, PretrainedExtractor};
use crate::geo::crop_to_bbox;
use crate::ml::ml_model::{ClassifierConfig, TileClassifier};
use crate::model::{load_model_with_metadata, ModelKind, ModelMetadata};
use crate::tiles::TileRaster;
use crate::types::{CropRect, GeoBBox, TileCoord};

/// タイル走査の分割数（一辺）
pub const SCAN_GRID: u32 = 4;

/// タイル走査で見つかった候補
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub crop: CropRect,
    pub bbox: GeoBBox,
    pub score: f32,
}

/// タイルを4x4の格子に分け、各セルを採点してスコアの高い順に返す
pub fn scan_grid<F>(raster: &TileRaster, coord: TileCoord, mut score: F) -> crate::error::Result<Vec<Candidate>>
where
    F: FnMut(&CropRect) -> crate::error::Result<f32>,
{
    let cell_w = raster.width() / SCAN_GRID;
    let cell_h = raster.height() / SCAN_GRID;
    if cell_w == 0 || cell_h == 0 {
        return Ok(Vec::new());
    }

    let mut candidates = Vec::with_capacity((SCAN_GRID * SCAN_GRID) as usize);
    for row in 0..SCAN_GRID {
        for col in 0..SCAN_GRID {
            let crop = CropRect::new(col * cell_w, row * cell_h, (col + 1) * cell_w, (row + 1) * cell_h);
            let value = score(&crop)?;
            candidates.push(Candidate {
                crop,
                bbox: crop_to_bbox(&crop, coord),
                score: value,
            });
        }
    }

    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    Ok(candidates)
}

/// 保存済みの分類器による推論エンジン
pub struct InferenceEngine<B: Backend> {
    model: TileClassifier<B>,
    metadata: ModelMetadata,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(model_path: P, device: B::Device) -> Result<Self> {
        let (metadata, model_binary) = load_model_with_metadata(model_path.as_ref())?;
        metadata.expect_kind(ModelKind::Classifier)?;

        let model = ClassifierConfig::new(metadata.input_size, metadata.hidden_layers()?).init::<B>(&device);

        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = Recorder::<B>::load(&recorder, model_binary, &device)
            .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;
        let model = model.load_record(record);

        info!(
            "分類器を読み込みました: {} (入力 {}, {}件で学習)",
            model_path.as_ref().display(),
            metadata.input_size,
            metadata.num_examples
        );

        Ok(Self { model, metadata, device })
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn input_size(&self) -> usize {
        self.metadata.input_size
    }

    /// 特徴ベクトル1件を採点
    pub fn predict(&self, features: &[f32]) -> crate::error::Result<f32> {
        if features.len() != self.input_size() {
            return Err(MlMapError::FeatureLength {
                expected: self.input_size(),
                actual: features.len(),
            });
        }
        let scores = self.model.score(features, self.input_size(), &self.device)?;
        scores
            .first()
            .copied()
            .ok_or_else(|| MlMapError::Tensor("推論結果が空です".to_string()))
    }

    /// 複数件をまとめて採点
    pub fn predict_batch(&self, rows: &[Vec<f32>]) -> crate::error::Result<Vec<f32>> {
        let mut flat = Vec::with_capacity(rows.len() * self.input_size());
        for row in rows {
            if row.len() != self.input_size() {
                return Err(MlMapError::FeatureLength {
                    expected: self.input_size(),
                    actual: row.len(),
                });
            }
            flat.extend_from_slice(row);
        }
        if flat.is_empty() {
            return Ok(Vec::new());
        }
        self.model.score(&flat, self.input_size(), &self.device)
    }

    /// タイル全体を走査する
    pub fn scan_tile(
        &self,
        extractor: &PatchExtractor,
        raster: &TileRaster,
        coord: TileCoord,
        pretrained: Option<&dyn PretrainedExtractor>,
    ) -> crate::error::Result<Vec<Candidate>> {
        scan_grid(raster, coord, |crop| {
            let features = extractor.extract(raster, crop, pretrained)?;
            self.predict(&features)
        })
    }
}
