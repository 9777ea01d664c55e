pub mod extractor_cnn;
pub mod inference;
pub mod lr_schedule;
pub mod ml_model;
pub mod scheduler;
pub mod training;

/// CPUバックエンド
pub type CpuBackend = burn_ndarray::NdArray<f32>;
/// CPUバックエンド（学習用）
pub type CpuTrainBackend = burn_autodiff::Autodiff<CpuBackend>;
/// WGPUバックエンド
pub type GpuBackend = burn::backend::Wgpu;
/// WGPUバックエンド（学習用）
pub type GpuTrainBackend = burn_autodiff::Autodiff<GpuBackend>;

pub use extractor_cnn::CnnFeatureExtractor;
pub use inference::{scan_grid, Candidate, InferenceEngine, SCAN_GRID};
pub use lr_schedule::StepDecaySchedule;
pub use ml_model::{ClassifierConfig, ExtractorCnn, ExtractorCnnConfig, TileClassifier};
pub use scheduler::{cancel_flag, run_training, CancelFlag, IntervalTicker, ManualTicker, Ticker, TrainingReport};
pub use training::{TickReport, Trainer};
