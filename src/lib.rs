//! mlmap: 地図上の注釈からタイル画像の学習データを作り、分類器を増分学習する
//!
//! - `geo`: スリッピータイルの座標計算
//! - `tiles`: タイル画像の取得
//! - `extraction`: 特徴ベクトルの抽出
//! - `dataset`: 学習データの保持と永続化
//! - `ml`: 分類器の学習と推論（`ml` フィーチャ）
//! - `session`: 上記をまとめたセッション（`ml` フィーチャ）

pub mod types;
pub mod error;
pub mod logging;

pub mod geo;
pub mod tiles;
pub mod extraction;
pub mod dataset;
pub mod model;
#[cfg(feature = "ml")]
pub mod ml;
#[cfg(feature = "ml")]
pub mod session;

pub use error::{MlMapError, Result};
pub use types::{CropRect, Example, GeoBBox, Label, TileCoord, TrainingKey, TrainingState};

#[cfg(feature = "ml")]
pub use session::{AnnotationReport, RestoreReport, Session};
