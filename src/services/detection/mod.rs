use anyhow::Result;
use async_trait::async_trait;
use image::DynamicImage;
use ndarray::Array4;
use ort::value::Value;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace};

use crate::core::config::Config;
use crate::core::errors::{DetectionError, DetectionResult};
use crate::core::types::{BoundingBox, Region, SharedImage};
use crate::services::onnx_builder::{build_session_with_acceleration, read_model_bytes, OnnxSessionPool};
use crate::utils::image_ops::rgb_to_chw_tensor;

/// Proposes candidate banner regions in an image.
///
/// Zero regions is a valid result; an `Err` means the model itself failed.
#[async_trait]
pub trait RegionDetector: Send + Sync {
    async fn detect(&self, image: &SharedImage) -> DetectionResult<Vec<Region>>;
}

/// Post-processing parameters for raw detector output
#[derive(Debug, Clone, Copy)]
pub struct DecodeParams {
    pub min_confidence: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

/// YOLO-style banner detector backed by a pool of ONNX sessions
pub struct OnnxRegionDetector {
    inner: Arc<DetectorInner>,
}

struct DetectorInner {
    pool: OnnxSessionPool,
    input_name: String,
    output_name: String,
    target_size: u32,
    params: DecodeParams,
    device_type: String,
}

impl OnnxRegionDetector {
    /// Load the detector model and fill the session pool.
    ///
    /// Blocking; call from `spawn_blocking` or before the runtime starts serving.
    pub fn load(config: &Config) -> Result<Self> {
        let model_path = config.detector_model_path();
        let model_bytes = read_model_bytes(&model_path)?;
        let backend = config.detection.inference_backend.as_deref();
        let pool_size = config.onnx_pool_size();

        debug!("Creating detection session pool with {} sessions", pool_size);
        let (device_type, first) = build_session_with_acceleration(&model_bytes, "detector", backend)?;

        let input_name = first
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| anyhow::anyhow!("detector model declares no inputs"))?;
        let output_name = first
            .outputs
            .first()
            .map(|output| output.name.clone())
            .ok_or_else(|| anyhow::anyhow!("detector model declares no outputs"))?;

        let mut sessions = vec![first];
        for i in 1..pool_size {
            trace!("Creating session {} of {}", i + 1, pool_size);
            let (_, session) = build_session_with_acceleration(&model_bytes, "detector", backend)?;
            sessions.push(session);
        }

        info!("✓ Detection: {} ({} sessions)", device_type, pool_size);

        Ok(Self {
            inner: Arc::new(DetectorInner {
                pool: OnnxSessionPool::new(sessions),
                input_name,
                output_name,
                target_size: config.target_size(),
                params: DecodeParams {
                    min_confidence: config.min_confidence(),
                    iou_threshold: config.iou_threshold(),
                    max_detections: config.detection.max_detections,
                },
                device_type,
            }),
        })
    }

    pub fn device_type(&self) -> &str {
        &self.inner.device_type
    }
}

#[async_trait]
impl RegionDetector for OnnxRegionDetector {
    async fn detect(&self, image: &SharedImage) -> DetectionResult<Vec<Region>> {
        if image.width() == 0 || image.height() == 0 {
            return Err(DetectionError::InvalidImageSize {
                width: image.width(),
                height: image.height(),
            });
        }

        let inner = Arc::clone(&self.inner);
        let image = Arc::clone(image);
        tokio::task::spawn_blocking(move || inner.run(&image))
            .await
            .map_err(|e| DetectionError::WorkerFailed(e.to_string()))?
    }
}

impl DetectorInner {
    fn run(&self, img: &DynamicImage) -> DetectionResult<Vec<Region>> {
        let detection_start = Instant::now();
        let input = Value::from_array(self.preprocess_image(img))?;

        let (shape, data) = {
            let mut session = self
                .pool
                .acquire()
                .ok_or_else(|| DetectionError::WorkerFailed("session pool closed".to_string()))?;
            let outputs = session.run(ort::inputs![self.input_name.as_str() => input])?;
            let (shape, data) = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;
            (shape.to_vec(), data.to_vec())
        };
        debug!(
            "✓ Detector inference on {} in {:.2}ms",
            self.device_type,
            detection_start.elapsed().as_secs_f64() * 1000.0
        );

        let scale_x = img.width() as f32 / self.target_size as f32;
        let scale_y = img.height() as f32 / self.target_size as f32;
        let regions = decode_yolo_output(
            &data,
            &shape,
            (scale_x, scale_y),
            (img.width(), img.height()),
            &self.params,
        )?;

        debug!(
            "✅ [DETECTION] {} regions in {:.2}ms",
            regions.len(),
            detection_start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(regions)
    }

    fn preprocess_image(&self, img: &DynamicImage) -> Array4<f32> {
        trace!(
            "Preprocessing image: {}x{} → {}x{}",
            img.width(),
            img.height(),
            self.target_size,
            self.target_size
        );
        let resized = img.resize_exact(
            self.target_size,
            self.target_size,
            image::imageops::FilterType::Triangle,
        );
        rgb_to_chw_tensor(&resized.to_rgb8())
    }
}

/// Decode a `[1, 4 + classes, anchors]` YOLO output into regions.
///
/// Boxes are `(cx, cy, w, h)` in model input pixels; `scale` maps them back
/// to the source image, where they are clamped to `image_size`. The result is
/// NMS-filtered and ordered by descending confidence.
pub fn decode_yolo_output(
    data: &[f32],
    shape: &[i64],
    scale: (f32, f32),
    image_size: (u32, u32),
    params: &DecodeParams,
) -> DetectionResult<Vec<Region>> {
    if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 || shape[2] < 0 {
        return Err(DetectionError::UnexpectedOutput(shape.to_vec()));
    }
    let channels = shape[1] as usize;
    let anchors = shape[2] as usize;
    if data.len() != channels * anchors {
        return Err(DetectionError::UnexpectedOutput(shape.to_vec()));
    }

    let (scale_x, scale_y) = scale;
    let (img_w, img_h) = image_size;
    let at = |c: usize, i: usize| data[c * anchors + i];

    let mut candidates = Vec::new();
    for i in 0..anchors {
        let score = (4..channels)
            .map(|c| at(c, i))
            .fold(f32::NEG_INFINITY, f32::max);
        if !score.is_finite() || score < params.min_confidence {
            continue;
        }

        let (cx, cy, w, h) = (at(0, i), at(1, i), at(2, i), at(3, i));
        let x1 = ((cx - w / 2.0) * scale_x).clamp(0.0, img_w as f32).floor() as u32;
        let y1 = ((cy - h / 2.0) * scale_y).clamp(0.0, img_h as f32).floor() as u32;
        let x2 = ((cx + w / 2.0) * scale_x).clamp(0.0, img_w as f32).ceil() as u32;
        let y2 = ((cy + h / 2.0) * scale_y).clamp(0.0, img_h as f32).ceil() as u32;

        if x2 <= x1 || y2 <= y1 {
            continue;
        }

        candidates.push(Region {
            bounding_box: BoundingBox::new(x1, y1, x2 - x1, y2 - y1),
            confidence: score.min(1.0),
        });
    }

    trace!("{} candidates above confidence {:.2}", candidates.len(), params.min_confidence);

    let mut kept = nms(candidates, params.iou_threshold);
    kept.truncate(params.max_detections);
    Ok(kept)
}

fn calculate_iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x) as u64;
    let y1 = a.y.max(b.y) as u64;
    let x2 = (a.x as u64 + a.w as u64).min(b.x as u64 + b.w as u64);
    let y2 = (a.y as u64 + a.h as u64).min(b.y as u64 + b.h as u64);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let intersection = ((x2 - x1) * (y2 - y1)) as f32;
    let union = a.area() as f32 + b.area() as f32 - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Greedy non-maximum suppression; output is sorted by descending confidence
fn nms(detections: Vec<Region>, iou_threshold: f32) -> Vec<Region> {
    if detections.is_empty() {
        return vec![];
    }

    let mut sorted = detections;
    // Stable sort keeps model order among equal scores
    sorted.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal));

    let mut keep = Vec::new();
    let mut suppressed = vec![false; sorted.len()];

    for i in 0..sorted.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(sorted[i]);

        for j in (i + 1)..sorted.len() {
            if !suppressed[j] {
                let iou = calculate_iou(&sorted[i].bounding_box, &sorted[j].bounding_box);
                if iou > iou_threshold {
                    suppressed[j] = true;
                    trace!("NMS: suppressed detection {} (IoU={:.3} with {})", j, iou, i);
                }
            }
        }
    }

    debug!("NMS: kept {}/{} detections", keep.len(), sorted.len());
    keep
}
