pub mod config;
pub mod model_metadata;
pub mod model_storage;

pub use config::{AppConfig, DeviceType, ExtractionMode, ExtractionSettings, ModelSettings, StorageSettings, TileSettings, TrainingSettings};
pub use model_metadata::{ModelKind, ModelMetadata};
pub use model_storage::{archive_path, load_metadata, load_model_binary, load_model_with_metadata, print_metadata_info, save_model_with_metadata};
