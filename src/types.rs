use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// 地理座標の矩形 `[min_lon, min_lat, max_lon, max_lat]`
///
/// 値で比較・ハッシュされるため、学習データのキーとしてそのまま使用できる。
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct GeoBBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl GeoBBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self { min_lon, min_lat, max_lon, max_lat }
    }

    pub fn to_array(&self) -> [f64; 4] {
        [self.min_lon, self.min_lat, self.max_lon, self.max_lat]
    }
}

impl From<[f64; 4]> for GeoBBox {
    fn from(v: [f64; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<GeoBBox> for [f64; 4] {
    fn from(b: GeoBBox) -> Self {
        b.to_array()
    }
}

// ビット列で比較する（-0.0 と 0.0 は別キー扱い）
impl PartialEq for GeoBBox {
    fn eq(&self, other: &Self) -> bool {
        self.to_array()
            .iter()
            .zip(other.to_array().iter())
            .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

impl Eq for GeoBBox {}

impl Hash for GeoBBox {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for v in self.to_array() {
            v.to_bits().hash(state);
        }
    }
}

/// スリッピータイル座標
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl TileCoord {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }
}

impl std::fmt::Display for TileCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// タイル画像内のピクセル矩形（max側は含まない）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl CropRect {
    pub fn new(min_x: u32, min_y: u32, max_x: u32, max_y: u32) -> Self {
        Self { min_x, min_y, max_x, max_y }
    }

    pub fn width(&self) -> u32 {
        self.max_x.saturating_sub(self.min_x)
    }

    pub fn height(&self) -> u32 {
        self.max_y.saturating_sub(self.min_y)
    }

    /// 幅か高さが0なら、このタイルからは学習データを作らない
    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// 画像サイズに収まるように切り詰める
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        Self {
            min_x: self.min_x.min(width),
            min_y: self.min_y.min(height),
            max_x: self.max_x.min(width),
            max_y: self.max_y.min(height),
        }
    }
}

/// 2値ラベル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Label {
    NotAirplane,
    Airplane,
}

impl Label {
    /// 学習ターゲット値
    pub fn target(&self) -> f32 {
        match self {
            Label::NotAirplane => 0.0,
            Label::Airplane => 1.0,
        }
    }
}

impl From<Label> for u8 {
    fn from(label: Label) -> Self {
        match label {
            Label::NotAirplane => 0,
            Label::Airplane => 1,
        }
    }
}

impl TryFrom<u8> for Label {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Label::NotAirplane),
            1 => Ok(Label::Airplane),
            other => Err(format!("ラベルは0か1である必要があります: {}", other)),
        }
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Label::NotAirplane => write!(f, "not airplane"),
            Label::Airplane => write!(f, "airplane"),
        }
    }
}

/// 永続化キー `{bbox, x, y}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrainingKey {
    pub bbox: GeoBBox,
    pub x: u32,
    pub y: u32,
}

impl TrainingKey {
    pub fn new(bbox: GeoBBox, x: u32, y: u32) -> Self {
        Self { bbox, x, y }
    }

    /// 永続化層で使う文字列キー（シリアライズ形式で比較される）
    pub fn storage_key(&self) -> String {
        // 数値配列と整数のみなので失敗しない
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// 学習データ1件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub key: TrainingKey,
    pub features: Vec<f32>,
    pub label: Label,
}

/// 学習ループの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingState {
    Idle,    // 待機中
    Running, // 学習中（フレームごとにtickが進む）
}
