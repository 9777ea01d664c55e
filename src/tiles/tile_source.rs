//! タイル画像の取得
//!
//! タイル取得は非同期で行い、複数タイルは完了順に処理されます。
//! ネットワーク取得は対象外のため、ここではディレクトリとメモリ上の実装のみ提供します。

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;

use image::RgbaImage;
use tracing::{debug, warn};

use crate::error::{MlMapError, Result};
use crate::types::TileCoord;

/// デコード済みのタイル画像（RGBA、行優先）
#[derive(Debug, Clone)]
pub struct TileRaster {
    image: RgbaImage,
}

impl TileRaster {
    pub fn new(image: RgbaImage) -> Self {
        Self { image }
    }

    /// 生のRGBAバイト列から作成（サイズ不一致ならNone）
    pub fn from_rgba(width: u32, height: u32, bytes: Vec<u8>) -> Option<Self> {
        RgbaImage::from_raw(width, height, bytes).map(Self::new)
    }

    /// 単色画像
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        Self::new(RgbaImage::from_pixel(width, height, image::Rgba(rgba)))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }
}

/// タイル画像の取得元
pub trait TileSource: Send + Sync + 'static {
    /// タイルを取得してデコードする
    fn fetch(&self, coord: TileCoord) -> impl Future<Output = Result<TileRaster>> + Send;
}

/// 一時的な失敗に備えて回数制限付きで再試行する
pub async fn fetch_with_retry<S: TileSource>(source: &S, coord: TileCoord, retries: u32) -> Result<TileRaster> {
    let mut attempt = 0;
    loop {
        match source.fetch(coord).await {
            Ok(raster) => return Ok(raster),
            Err(e) if attempt < retries => {
                attempt += 1;
                debug!("タイル取得を再試行します ({}回目): {}", attempt, e);
            }
            Err(e) => {
                warn!("タイル取得に失敗しました: {}", e);
                return Err(e);
            }
        }
    }
}

/// `{root}/{z}/{x}/{y}.png` 形式のディレクトリから読み込む
#[derive(Debug, Clone)]
pub struct DirectoryTileSource {
    root: PathBuf,
}

impl DirectoryTileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn tile_path(&self, coord: TileCoord) -> PathBuf {
        self.root
            .join(coord.z.to_string())
            .join(coord.x.to_string())
            .join(format!("{}.png", coord.y))
    }
}

impl TileSource for DirectoryTileSource {
    async fn fetch(&self, coord: TileCoord) -> Result<TileRaster> {
        let path = self.tile_path(coord);
        let bytes = tokio::fs::read(&path).await.map_err(|e| MlMapError::TileFetch {
            coord,
            message: format!("{}: {}", path.display(), e),
        })?;

        let image = image::load_from_memory(&bytes).map_err(|e| MlMapError::TileFetch {
            coord,
            message: format!("デコード失敗 {}: {}", path.display(), e),
        })?;

        Ok(TileRaster::new(image.to_rgba8()))
    }
}

/// メモリ上のタイル（テストやキャッシュ済みデータ用）
#[derive(Debug, Clone, Default)]
pub struct MemoryTileSource {
    tiles: HashMap<TileCoord, TileRaster>,
}

impl MemoryTileSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, coord: TileCoord, raster: TileRaster) {
        self.tiles.insert(coord, raster);
    }

    pub fn with_tile(mut self, coord: TileCoord, raster: TileRaster) -> Self {
        self.insert(coord, raster);
        self
    }
}

impl TileSource for MemoryTileSource {
    async fn fetch(&self, coord: TileCoord) -> Result<TileRaster> {
        self.tiles.get(&coord).cloned().ok_or_else(|| MlMapError::TileFetch {
            coord,
            message: "タイルが存在しません".to_string(),
        })
    }
}
