//! タイル画像から特徴ベクトルを作る
//!
//! ## 画素モード
//! - 切り出し範囲をR/G/Bの3平面に分け（アルファは捨てる）、各平面を行優先で平坦化
//! - 各平面を `input_size / 3` に切り詰め・ゼロ埋めして `[R..., G..., B...]` の順に連結
//! - 全体を `input_size` までゼロ埋めし、255で割って [0, 1] に正規化
//!
//! ## 学習済み分類器モード
//! - 切り出し範囲を抽出器の入力サイズ (`PretrainedExtractor::canonical_size`) の正方形にリサイズ
//! - 分類器の確率を降順に並べ、上位 `input_size` 個を特徴とする

use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};

use crate::error::{MlMapError, Result};
use crate::extraction::feature_extractor::PretrainedExtractor;
use crate::model::config::ExtractionMode;
use crate::tiles::TileRaster;
use crate::types::CropRect;

/// 特徴抽出器
#[derive(Debug, Clone)]
pub struct PatchExtractor {
    mode: ExtractionMode,
    input_size: usize,
}

impl PatchExtractor {
    pub fn new(mode: ExtractionMode, input_size: usize) -> Self {
        Self { mode, input_size }
    }

    pub fn mode(&self) -> ExtractionMode {
        self.mode
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// 特徴ベクトルを作る
    ///
    /// 学習済み分類器モードでは `extractor` が必要。空の切り出し範囲は呼び出し側でスキップすること。
    pub fn extract(
        &self,
        raster: &TileRaster,
        crop: &CropRect,
        extractor: Option<&dyn PretrainedExtractor>,
    ) -> Result<Vec<f32>> {
        match self.mode {
            ExtractionMode::Raw => Ok(extract_raw(raster, crop, self.input_size)),
            ExtractionMode::Pretrained => {
                let extractor = extractor.ok_or(MlMapError::ExtractorNotReady)?;
                extract_pretrained(raster, crop, self.input_size, extractor)
            }
        }
    }
}

/// 長さを合わせる（長ければ切り詰め、短ければゼロ埋め）
fn fit_to_len(mut values: Vec<f32>, len: usize) -> Vec<f32> {
    values.resize(len, 0.0);
    values
}

/// 画素モードの特徴ベクトル
pub fn extract_raw(raster: &TileRaster, crop: &CropRect, input_size: usize) -> Vec<f32> {
    let crop = crop.clamp_to(raster.width(), raster.height());
    let plane_len = input_size / 3;
    let pixel_count = (crop.width() * crop.height()) as usize;

    let mut red = Vec::with_capacity(pixel_count);
    let mut green = Vec::with_capacity(pixel_count);
    let mut blue = Vec::with_capacity(pixel_count);

    let img = raster.image();
    for y in crop.min_y..crop.max_y {
        for x in crop.min_x..crop.max_x {
            let pixel = img.get_pixel(x, y);
            red.push(pixel[0] as f32 / 255.0);
            green.push(pixel[1] as f32 / 255.0);
            blue.push(pixel[2] as f32 / 255.0);
        }
    }

    let mut features = Vec::with_capacity(input_size);
    features.extend(fit_to_len(red, plane_len));
    features.extend(fit_to_len(green, plane_len));
    features.extend(fit_to_len(blue, plane_len));
    fit_to_len(features, input_size)
}

/// 切り出し範囲をRGB画像として取り出す
pub fn crop_rgb(raster: &TileRaster, crop: &CropRect) -> RgbImage {
    let crop = crop.clamp_to(raster.width(), raster.height());
    let sub = imageops::crop_imm(raster.image(), crop.min_x, crop.min_y, crop.width(), crop.height()).to_image();
    DynamicImage::ImageRgba8(sub).to_rgb8()
}

/// 学習済み分類器モードの特徴ベクトル
pub fn extract_pretrained(
    raster: &TileRaster,
    crop: &CropRect,
    input_size: usize,
    extractor: &dyn PretrainedExtractor,
) -> Result<Vec<f32>> {
    let patch = crop_rgb(raster, crop);
    let canonical_size = extractor.canonical_size();
    let canonical = imageops::resize(&patch, canonical_size, canonical_size, FilterType::Triangle);

    let mut probabilities = extractor.infer(&canonical)?;
    probabilities.sort_by(|a, b| b.total_cmp(a));
    Ok(fit_to_len(probabilities, input_size))
}
