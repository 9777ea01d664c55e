//! CNNによる学習済み特徴抽出器
//!
//! 重みは凍結して推論のみに使います。モデルは推論時にロックして共有します。

use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, Tensor},
};
use image::RgbImage;
use tracing::info;

use crate::error::{MlMapError, Result};
use crate::extraction::PretrainedExtractor;
use crate::ml::ml_model::{normalize_image, tensor_to_vec, ExtractorCnn, ExtractorCnnConfig};
use crate::model::{load_model_with_metadata, save_model_with_metadata, ModelKind, ModelMetadata};

/// CNN特徴抽出器
pub struct CnnFeatureExtractor<B: Backend> {
    model: Mutex<ExtractorCnn<B>>,
    num_classes: usize,
    canonical_size: u32,
    device: B::Device,
}

impl<B: Backend> CnnFeatureExtractor<B> {
    /// 初期化済みの重みで作成
    pub fn new(num_classes: usize, canonical_size: u32, device: B::Device) -> Result<Self> {
        let model = ExtractorCnnConfig::new(num_classes)
            .with_image_size(canonical_size as usize)
            .init::<B>(&device)?;
        Ok(Self {
            model: Mutex::new(model),
            num_classes,
            canonical_size,
            device,
        })
    }

    /// tar.gzから重みを読み込む
    pub fn load<P: AsRef<Path>>(path: P, device: B::Device) -> anyhow::Result<Self> {
        let (metadata, binary) = load_model_with_metadata(path.as_ref())?;
        metadata.expect_kind(ModelKind::Extractor)?;

        let extractor = Self::new(metadata.num_classes, metadata.canonical_size, device)?;
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = Recorder::<B>::load(&recorder, binary, &extractor.device)
            .map_err(|e| anyhow::anyhow!("特徴抽出器の重みの読み込みエラー: {:?}", e))?;

        let model = extractor.model.into_inner().map_err(|_| anyhow::anyhow!("モデルのロックが壊れています"))?;
        info!(
            "特徴抽出器を読み込みました: {} ({}クラス, {}x{})",
            path.as_ref().display(),
            metadata.num_classes,
            metadata.canonical_size,
            metadata.canonical_size
        );
        Ok(Self {
            model: Mutex::new(model.load_record(record)),
            ..extractor
        })
    }

    /// 重みとメタデータをtar.gzで保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let model = self
            .model
            .lock()
            .map_err(|_| anyhow::anyhow!("モデルのロックが壊れています"))?
            .clone();
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let binary = Recorder::<B>::record(&recorder, model.into_record(), ())
            .map_err(|e| anyhow::anyhow!("特徴抽出器の重みの書き出しエラー: {:?}", e))?;

        let metadata = ModelMetadata::extractor(self.num_classes, self.canonical_size);
        save_model_with_metadata(path.as_ref(), &metadata, &binary)
            .with_context(|| format!("特徴抽出器の保存に失敗しました: {}", path.as_ref().display()))
    }
}

impl<B: Backend> PretrainedExtractor for CnnFeatureExtractor<B> {
    fn infer(&self, image: &RgbImage) -> Result<Vec<f32>> {
        let size = self.canonical_size;
        if image.dimensions() != (size, size) {
            return Err(MlMapError::Config(format!(
                "画像サイズが不正です: {}x{} (期待: {}x{})",
                image.width(),
                image.height(),
                size,
                size
            )));
        }

        let data = normalize_image(image);
        let s = size as usize;
        let images = Tensor::<B, 1>::from_floats(data.as_slice(), &self.device).reshape([1, 3, s, s]);

        let model = self
            .model
            .lock()
            .map_err(|_| MlMapError::Tensor("モデルのロックが壊れています".to_string()))?;
        tensor_to_vec(model.probabilities(images))
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn canonical_size(&self) -> u32 {
        self.canonical_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::CpuBackend;
    use burn_ndarray::NdArrayDevice;

    #[test]
    fn test_infer_returns_distribution() {
        let extractor = CnnFeatureExtractor::<CpuBackend>::new(7, 24, NdArrayDevice::Cpu).unwrap();
        let probs = extractor.infer(&RgbImage::from_pixel(24, 24, image::Rgb([90, 120, 30]))).unwrap();
        assert_eq!(probs.len(), 7);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-4);
        assert!(extractor.infer(&RgbImage::new(23, 24)).is_err());
    }

    #[test]
    fn test_archive_round_trip_keeps_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("extractor.tar.gz");
        let extractor = CnnFeatureExtractor::<CpuBackend>::new(4, 20, NdArrayDevice::Cpu).unwrap();
        extractor.save(&path).unwrap();

        let loaded = CnnFeatureExtractor::<CpuBackend>::load(&path, NdArrayDevice::Cpu).unwrap();
        assert_eq!(loaded.num_classes(), 4);
        assert_eq!(loaded.canonical_size(), 20);

        let img = RgbImage::from_fn(20, 20, |x, y| image::Rgb([(x * 10) as u8, (y * 10) as u8, 50]));
        let before = extractor.infer(&img).unwrap();
        let after = loaded.infer(&img).unwrap();
        for (a, b) in before.iter().zip(after.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }
}
