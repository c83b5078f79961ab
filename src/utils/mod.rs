pub mod image_ops;
pub mod metrics;

// Re-export commonly used items
pub use image_ops::{crop_region, load_image_from_memory_async, rgb_to_chw_tensor};
pub use metrics::{FailureKind, Metrics, MetricsSnapshot, Stage};
