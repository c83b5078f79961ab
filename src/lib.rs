// Library exports for the banner analysis service

pub mod core;
pub mod middleware;
pub mod orchestration;
pub mod server;
pub mod services;
pub mod utils;

// Re-export commonly used types and functions
pub use core::{
    config::Config,
    errors::{
        ClassificationError, ConfigError, DetectionError, ExtractionError, FetchError,
        ProvisioningError,
    },
    types::{AnalyzeRequest, AnalyzeResponse, BannerRecord, BoundingBox, Classification, Region, SharedImage},
};

pub use middleware::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

pub use orchestration::{aggregate, BannerPipeline};

pub use server::{router, AppState};

pub use services::{
    build_classifier, HttpImageFetcher, ImageFetcher, ModelProvisioner, OcrTextExtractor,
    OnnxRegionDetector, RegionDetector, TextClassifier, TextExtractor,
};

pub use utils::{load_image_from_memory_async, Metrics};
