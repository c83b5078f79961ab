pub mod config;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use config::Config;
pub use errors::{
    ClassificationError, ConfigError, DetectionError, ExtractionError, FetchError,
    ProvisioningError, RegionFailure, UrlFailure,
};
pub use types::{
    AnalyzeRequest, AnalyzeResponse, BannerRecord, BoundingBox, Classification, ExtractedText,
    Region, SharedImage, UrlStage,
};
