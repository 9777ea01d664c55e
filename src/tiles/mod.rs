pub mod tile_source;

pub use tile_source::{fetch_with_retry, DirectoryTileSource, MemoryTileSource, TileRaster, TileSource};
