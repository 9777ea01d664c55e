pub mod augment;
pub mod feature_extractor;
pub mod patch_extractor;

pub use augment::jitter;
pub use feature_extractor::{ExtractorGate, PretrainedExtractor};
pub use patch_extractor::{crop_rgb, extract_pretrained, extract_raw, PatchExtractor};
