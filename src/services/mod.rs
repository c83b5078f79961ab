pub mod classification;
pub mod detection;
pub mod fetcher;
pub mod ocr;
pub mod onnx_builder; // Shared ONNX session builder and session pool
pub mod provisioning;

// Re-export commonly used services
pub use classification::{build_classifier, KeywordClassifier, LabelSet, LlmBannerClassifier, TextClassifier};
pub use detection::{OnnxRegionDetector, RegionDetector};
pub use fetcher::{HttpImageFetcher, ImageFetcher};
pub use ocr::{OcrTextExtractor, TextExtractor};
pub use provisioning::ModelProvisioner;
