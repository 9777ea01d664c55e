pub mod tile_geometry;

pub use tile_geometry::{covering_tiles, crop_to_bbox, tile_bbox, tile_crop, tile_px, TileRange, TILE_SIZE};
