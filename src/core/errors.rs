// Error types for every pipeline stage
//
// All stage errors are local: they degrade a URL or a region, never a request.

use thiserror::Error;

/// Image fetch errors (scoped to one URL)
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid image URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Timed out fetching {url}")]
    Timeout { url: String },

    #[error("Request to {url} failed: {message}")]
    FetchFailed { url: String, message: String },

    #[error("HTTP {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Image at {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: usize },

    #[error("Could not decode image from {url}: {message}")]
    DecodeFailed { url: String, message: String },
}

impl FetchError {
    /// Whether a retry at the orchestrator level can change the outcome
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout { .. } | FetchError::FetchFailed { .. } => true,
            FetchError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            FetchError::InvalidUrl { .. }
            | FetchError::TooLarge { .. }
            | FetchError::DecodeFailed { .. } => false,
        }
    }

    /// Short label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::DecodeFailed { .. } => "decode_failed",
            _ => "fetch_failed",
        }
    }
}

/// Region detection errors (model-internal, distinct from "zero regions")
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("ONNX inference failed: {0}")]
    InferenceFailed(#[from] ort::Error),

    #[error("Unexpected detector output shape {0:?}")]
    UnexpectedOutput(Vec<i64>),

    #[error("Invalid image dimensions: {width}x{height}")]
    InvalidImageSize { width: u32, height: u32 },

    #[error("Detection worker failed: {0}")]
    WorkerFailed(String),
}

/// Text extraction errors (scoped to one region)
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Region {x},{y} {w}x{h} is outside the {image_width}x{image_height} image")]
    RegionOutOfBounds {
        x: u32,
        y: u32,
        w: u32,
        h: u32,
        image_width: u32,
        image_height: u32,
    },

    #[error("OCR inference failed: {0}")]
    InferenceFailed(#[from] ort::Error),

    #[error("Unexpected OCR output shape {0:?}")]
    UnexpectedOutput(Vec<usize>),

    #[error("OCR worker failed: {0}")]
    WorkerFailed(String),
}

/// Text classification errors (scoped to one region)
#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("Classifier request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Classifier returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Invalid classifier response: {0}")]
    InvalidResponse(String),

    #[error("Classifier returned label '{0}' which is not in the configured label set")]
    UnknownLabel(String),

    #[error("Classifier circuit is open, skipping request")]
    CircuitOpen,
}

/// Why a single region was dropped from a URL's result
#[derive(Debug, Error)]
pub enum RegionFailure {
    #[error("extraction failed for region {index}: {source}")]
    Extraction {
        index: usize,
        #[source]
        source: ExtractionError,
    },
}

/// Why a URL contributed no banners
#[derive(Debug, Error)]
pub enum UrlFailure {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("detection failed: {0}")]
    Detection(#[from] DetectionError),
}

/// Model provisioning errors (startup only)
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("Model file {path} is missing and MODEL_BASE_URL is not set")]
    Missing { path: String },

    #[error("Failed to download {url}: {message}")]
    DownloadFailed { url: String, message: String },

    #[error("Model download from {url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Confidence threshold must be in [0.0, 1.0], got {0}")]
    InvalidConfidenceThreshold(f32),

    #[error("IoU threshold must be in [0.0, 1.0], got {0}")]
    InvalidIoUThreshold(f32),

    #[error("Invalid detection config: {0}")]
    InvalidDetectionConfig(String),

    #[error("Invalid classifier config: {0}")]
    InvalidClassifierConfig(String),

    #[error("Invalid fetch config: {0}")]
    InvalidFetchConfig(String),

    #[error("{name} must be > 0, got {value}")]
    InvalidLimit { name: &'static str, value: usize },

    #[error("Invalid URL in {name}: {value}")]
    InvalidUrl { name: &'static str, value: String },
}

pub type FetchResult<T> = Result<T, FetchError>;
pub type DetectionResult<T> = Result<T, DetectionError>;
pub type ExtractionResult<T> = Result<T, ExtractionError>;
pub type ClassificationResult<T> = Result<T, ClassificationError>;
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_fetch_errors() {
        let url = "https://x/a.png".to_string();
        assert!(FetchError::Timeout { url: url.clone() }.is_transient());
        assert!(FetchError::HttpStatus { url: url.clone(), status: 503 }.is_transient());
        assert!(FetchError::HttpStatus { url: url.clone(), status: 429 }.is_transient());
        assert!(!FetchError::HttpStatus { url: url.clone(), status: 404 }.is_transient());
        assert!(!FetchError::DecodeFailed { url: url.clone(), message: "bad".into() }.is_transient());
        assert!(!FetchError::InvalidUrl { url, reason: "scheme".into() }.is_transient());
    }

    #[test]
    fn test_fetch_error_kind() {
        let url = "https://x/a.png".to_string();
        assert_eq!(FetchError::Timeout { url: url.clone() }.kind(), "fetch_failed");
        assert_eq!(
            FetchError::DecodeFailed { url, message: "corrupt".into() }.kind(),
            "decode_failed"
        );
    }
}
