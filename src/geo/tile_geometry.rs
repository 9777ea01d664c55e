//! スリッピータイルの座標計算
//!
//! 地理座標の矩形とタイル座標から、タイル画像内の切り出し範囲を求めます。
//!
//! ## 計算方法
//! - タイル自身の範囲: Web Mercatorの逆変換（タイルサイズ256）
//! - タイル内ピクセル: タイル範囲に対する経度・緯度の線形補間
//!   - `x = 256 * (lon - west) / (east - west)`
//!   - `y = 256 * (north - lat) / (north - south)`
//! - どちらも `[0, 256]` に収めてから切り捨て

use std::f64::consts::PI;

use crate::types::{CropRect, GeoBBox, TileCoord};

/// タイルの一辺のピクセル数
pub const TILE_SIZE: u32 = 256;

fn tiles_per_axis(z: u32) -> f64 {
    2f64.powi(z as i32)
}

fn tile_lon(x: f64, n: f64) -> f64 {
    x / n * 360.0 - 180.0
}

fn tile_lat(y: f64, n: f64) -> f64 {
    (PI * (1.0 - 2.0 * y / n)).sinh().atan().to_degrees()
}

/// タイルの地理的な範囲を求める
pub fn tile_bbox(coord: TileCoord) -> GeoBBox {
    let n = tiles_per_axis(coord.z);
    let x = coord.x as f64;
    let y = coord.y as f64;
    GeoBBox::new(
        tile_lon(x, n),
        tile_lat(y + 1.0, n),
        tile_lon(x + 1.0, n),
        tile_lat(y, n),
    )
}

/// 地理座標をタイル内のピクセル座標に変換
pub fn tile_px(lat: f64, lon: f64, tile: &GeoBBox) -> (u32, u32) {
    let size = TILE_SIZE as f64;
    let x = size * (lon - tile.min_lon) / (tile.max_lon - tile.min_lon);
    let y = size * (tile.max_lat - lat) / (tile.max_lat - tile.min_lat);
    (x.clamp(0.0, size) as u32, y.clamp(0.0, size) as u32)
}

/// 矩形とタイルの重なりをタイル内ピクセル範囲で求める
///
/// 矩形がタイルの外にある場合は幅か高さが0の範囲になる。
pub fn tile_crop(bbox: &GeoBBox, coord: TileCoord) -> CropRect {
    let tile = tile_bbox(coord);
    // 左上 (max_lat, min_lon) と右下 (min_lat, max_lon)
    let (min_x, min_y) = tile_px(bbox.max_lat, bbox.min_lon, &tile);
    let (max_x, max_y) = tile_px(bbox.min_lat, bbox.max_lon, &tile);
    CropRect::new(min_x, min_y, max_x, max_y)
}

/// 切り出し範囲を地理座標に戻す（走査結果の報告用）
pub fn crop_to_bbox(crop: &CropRect, coord: TileCoord) -> GeoBBox {
    let tile = tile_bbox(coord);
    let size = TILE_SIZE as f64;
    let lon = |px: u32| tile.min_lon + (tile.max_lon - tile.min_lon) * px as f64 / size;
    let lat = |py: u32| tile.max_lat - (tile.max_lat - tile.min_lat) * py as f64 / size;
    GeoBBox::new(lon(crop.min_x), lat(crop.max_y), lon(crop.max_x), lat(crop.min_y))
}

/// ズームレベル全体でのピクセル座標（整数に丸める）
fn global_px(lon: f64, lat: f64, z: u32) -> (f64, f64) {
    let world = TILE_SIZE as f64 * tiles_per_axis(z);
    let x = world * (lon + 180.0) / 360.0;
    // 極付近で発散しないように制限
    let sin = lat.to_radians().sin().clamp(-0.9999, 0.9999);
    let y = world * (0.5 - 0.25 * ((1.0 + sin) / (1.0 - sin)).ln() / PI);
    (x.round().clamp(0.0, world), y.round().clamp(0.0, world))
}

/// 矩形を覆うタイル範囲（両端を含む）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
    pub z: u32,
}

impl TileRange {
    /// 範囲内のタイル数
    pub fn len(&self) -> usize {
        let width = (self.max_x - self.min_x) as usize + 1;
        let height = (self.max_y - self.min_y) as usize + 1;
        width * height
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 行優先でタイル座標を列挙
    pub fn iter(&self) -> impl Iterator<Item = TileCoord> + '_ {
        (self.min_y..=self.max_y)
            .flat_map(move |y| (self.min_x..=self.max_x).map(move |x| TileCoord::new(x, y, self.z)))
    }
}

/// 矩形を覆うタイル範囲を求める
///
/// 右端・下端は1ピクセル内側で判定するため、タイル境界ちょうどの矩形は
/// そのタイルだけを覆う。
pub fn covering_tiles(bbox: &GeoBBox, z: u32) -> TileRange {
    let size = TILE_SIZE as f64;
    let (ll_x, ll_y) = global_px(bbox.min_lon, bbox.min_lat, z);
    let (ur_x, ur_y) = global_px(bbox.max_lon, bbox.max_lat, z);

    let xs = [(ll_x / size).floor(), ((ur_x - 1.0) / size).floor()];
    let ys = [(ur_y / size).floor(), ((ll_y - 1.0) / size).floor()];

    let max_index = tiles_per_axis(z) - 1.0;
    let to_index = |v: f64| v.clamp(0.0, max_index) as u32;

    TileRange {
        min_x: to_index(xs[0].min(xs[1])),
        min_y: to_index(ys[0].min(ys[1])),
        max_x: to_index(xs[0].max(xs[1])),
        max_y: to_index(ys[0].max(ys[1])),
        z,
    }
}
