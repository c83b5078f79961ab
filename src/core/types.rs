// Request, response and pipeline data types

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Decoded image shared between pipeline stages of one URL
pub type SharedImage = Arc<DynamicImage>;

/// Inbound analyze request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    pub report_id: i64,
    pub image_urls: Vec<String>,
}

/// Analyze response; `banner_list` is `null` when no banner was found
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalyzeResponse {
    pub report_id: i64,
    pub banner_list: Option<Vec<BannerRecord>>,
}

/// Axis-aligned box in pixel coordinates of the source image
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    pub fn area(&self) -> u64 {
        self.w as u64 * self.h as u64
    }

    /// True when the box is non-empty and lies fully inside a `width`x`height` image
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.w > 0
            && self.h > 0
            && (self.x as u64 + self.w as u64) <= width as u64
            && (self.y as u64 + self.h as u64) <= height as u64
    }
}

/// Candidate banner area proposed by the detector
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Region {
    pub bounding_box: BoundingBox,
    pub confidence: f32,
}

/// Text recognized inside a region
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedText {
    pub region: Region,
    pub text: String,
}

/// Label assigned to a piece of text
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Classification {
    pub label: String,
    pub confidence: f32,
}

impl Classification {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// One banner returned to the caller
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BannerRecord {
    pub region: Region,
    pub text: String,
    pub label: String,
    pub label_confidence: f32,
}

impl BannerRecord {
    pub fn from_parts(extracted: ExtractedText, classification: Classification) -> Self {
        Self {
            region: extracted.region,
            text: extracted.text,
            label: classification.label,
            label_confidence: classification.confidence,
        }
    }
}

/// Per-URL processing stage, used for logs and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlStage {
    Fetching,
    Detecting,
    Extracting,
    Classifying,
    Done,
    Failed,
}

impl UrlStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrlStage::Fetching => "fetching",
            UrlStage::Detecting => "detecting",
            UrlStage::Extracting => "extracting",
            UrlStage::Classifying => "classifying",
            UrlStage::Done => "done",
            UrlStage::Failed => "failed",
        }
    }
}

impl std::fmt::Display for UrlStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_banner_list_serializes_as_null() {
        let response = AnalyzeResponse {
            report_id: 7,
            banner_list: None,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json, serde_json::json!({"report_id": 7, "banner_list": null}));
    }

    #[test]
    fn test_banner_record_wire_shape() {
        let record = BannerRecord {
            region: Region {
                bounding_box: BoundingBox::new(10, 20, 200, 50),
                confidence: 0.5,
            },
            text: "SALE 50%".to_string(),
            label: "ad".to_string(),
            label_confidence: 0.25,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["region"]["bounding_box"]["w"], 200);
        assert_eq!(json["text"], "SALE 50%");
        assert_eq!(json["label"], "ad");
    }

    #[test]
    fn test_request_requires_fields() {
        assert!(serde_json::from_str::<AnalyzeRequest>(r#"{"report_id": 1}"#).is_err());
        let req: AnalyzeRequest =
            serde_json::from_str(r#"{"report_id": 1, "image_urls": []}"#).unwrap();
        assert!(req.image_urls.is_empty());
    }

    #[test]
    fn test_bounding_box_fits_within() {
        assert!(BoundingBox::new(0, 0, 10, 10).fits_within(10, 10));
        assert!(!BoundingBox::new(5, 0, 10, 10).fits_within(10, 10));
        assert!(!BoundingBox::new(0, 0, 0, 10).fits_within(10, 10));
        assert!(!BoundingBox::new(u32::MAX, 0, 2, 2).fits_within(10, 10));
    }

    #[test]
    fn test_classification_clamps_confidence() {
        assert_eq!(Classification::new("ad", 1.7).confidence, 1.0);
        assert_eq!(Classification::new("ad", -0.2).confidence, 0.0);
    }
}
