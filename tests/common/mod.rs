//! Shared fixtures: an in-process image server and scripted model stand-ins

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{http::StatusCode, routing::get, Router};
use banner_analyzer::core::config::{ClassifierConfig, FetchConfig, PipelineConfig};
use banner_analyzer::core::errors::{
    ClassificationError, ClassificationResult, DetectionError, DetectionResult, ExtractionError,
    ExtractionResult,
};
use banner_analyzer::core::types::{BoundingBox, Classification, Region, SharedImage};
use banner_analyzer::services::{
    HttpImageFetcher, KeywordClassifier, LabelSet, RegionDetector, TextClassifier, TextExtractor,
};
use banner_analyzer::{BannerPipeline, Config, Metrics};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use parking_lot::Mutex;
use std::future::Future;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Width in pixels of each scripted region
pub const REGION_WIDTH: u32 = 10;

/// PNG whose width encodes how many regions the scripted detector reports
pub fn png_with_regions(regions: u32) -> Vec<u8> {
    let width = (regions * REGION_WIDTH).max(1);
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, 16, Rgb([240, 240, 240])));
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

/// Serve `/regions/{n}.png` images, a 404 and a non-image body
pub async fn spawn_image_server() -> String {
    let router = Router::new()
        .route("/none.png", get(|| async { png_with_regions(0) }))
        .route("/one.png", get(|| async { png_with_regions(1) }))
        .route("/two.png", get(|| async { png_with_regions(2) }))
        .route("/three.png", get(|| async { png_with_regions(3) }))
        .route("/five.png", get(|| async { png_with_regions(5) }))
        .route("/missing.png", get(|| async { StatusCode::NOT_FOUND }))
        .route("/garbage.png", get(|| async { b"<html>oops</html>".to_vec() }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

/// A URL on a port nobody listens on
pub fn unreachable_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}/banner.png", addr)
}

/// Reports one region per `REGION_WIDTH` columns, left to right.
///
/// Images exactly 50 px wide make it fail, so tests can exercise detector errors.
pub struct ScriptedDetector;

#[async_trait]
impl RegionDetector for ScriptedDetector {
    async fn detect(&self, image: &SharedImage) -> DetectionResult<Vec<Region>> {
        if image.width() == 5 * REGION_WIDTH {
            return Err(DetectionError::WorkerFailed("scripted failure".to_string()));
        }
        let count = image.width() / REGION_WIDTH;
        Ok((0..count)
            .map(|i| Region {
                bounding_box: BoundingBox::new(i * REGION_WIDTH, 0, REGION_WIDTH, image.height()),
                confidence: 0.9 - i as f32 * 0.1,
            })
            .collect())
    }
}

/// Counts model calls in flight and remembers the peak
#[derive(Default)]
pub struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    pub async fn track<F: Future>(&self, call: F) -> F::Output {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let output = call.await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        output
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// `ScriptedDetector` that first sleeps `ms_per_px` per pixel of image width.
///
/// Widths are recorded in completion order.
pub struct SlowDetector {
    pub ms_per_px: u64,
    pub in_flight: Arc<InFlight>,
    pub finished: Mutex<Vec<u32>>,
}

impl SlowDetector {
    pub fn new(ms_per_px: u64, in_flight: Arc<InFlight>) -> Self {
        Self {
            ms_per_px,
            in_flight,
            finished: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl RegionDetector for SlowDetector {
    async fn detect(&self, image: &SharedImage) -> DetectionResult<Vec<Region>> {
        let delay = Duration::from_millis(self.ms_per_px * image.width() as u64);
        self.in_flight.track(tokio::time::sleep(delay)).await;
        self.finished.lock().push(image.width());
        ScriptedDetector.detect(image).await
    }
}

/// `ScriptedExtractor` whose calls take a few milliseconds and are tracked
pub struct TrackedExtractor {
    pub inner: ScriptedExtractor,
    pub in_flight: Arc<InFlight>,
}

#[async_trait]
impl TextExtractor for TrackedExtractor {
    async fn extract(&self, image: &SharedImage, region: &Region) -> ExtractionResult<String> {
        self.in_flight
            .track(async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                self.inner.extract(image, region).await
            })
            .await
    }
}

/// Returns `texts[i]` for the i-th region; `"!extract"` makes extraction fail
pub struct ScriptedExtractor {
    pub texts: Vec<String>,
}

impl ScriptedExtractor {
    pub fn new(texts: &[&str]) -> Self {
        Self {
            texts: texts.iter().map(|t| t.to_string()).collect(),
        }
    }
}

#[async_trait]
impl TextExtractor for ScriptedExtractor {
    async fn extract(&self, image: &SharedImage, region: &Region) -> ExtractionResult<String> {
        let index = (region.bounding_box.x / REGION_WIDTH) as usize;
        match self.texts.get(index).map(String::as_str) {
            Some("!extract") => Err(ExtractionError::RegionOutOfBounds {
                x: region.bounding_box.x,
                y: region.bounding_box.y,
                w: region.bounding_box.w,
                h: region.bounding_box.h,
                image_width: image.width(),
                image_height: image.height(),
            }),
            Some(text) => Ok(text.to_string()),
            None => Ok(String::new()),
        }
    }
}

/// Keyword rules, except text containing "BOOM" fails to classify
pub struct ScriptedClassifier {
    inner: KeywordClassifier,
}

#[async_trait]
impl TextClassifier for ScriptedClassifier {
    fn labels(&self) -> &LabelSet {
        self.inner.labels()
    }

    async fn classify_text(&self, text: &str) -> ClassificationResult<Classification> {
        if text.contains("BOOM") {
            return Err(ClassificationError::InvalidResponse("scripted failure".to_string()));
        }
        self.inner.classify_text(text).await
    }
}

pub fn test_config() -> Config {
    Config::from_lookup(|key| match key {
        "CLASSIFIER_BACKEND" => Some("keyword".to_string()),
        _ => None,
    })
    .unwrap()
}

pub fn fetch_config() -> FetchConfig {
    FetchConfig {
        timeout_secs: 5,
        connect_timeout_secs: 2,
        max_bytes: 1024 * 1024,
        max_redirects: 2,
        user_agent: "banner-analyzer-tests".to_string(),
    }
}

pub fn classifier_config() -> ClassifierConfig {
    test_config().classifier
}

pub fn pipeline_with(texts: &[&str]) -> BannerPipeline {
    pipeline_from(
        Arc::new(ScriptedDetector),
        Arc::new(ScriptedExtractor::new(texts)),
        2,
    )
}

pub fn pipeline_from(
    detector: Arc<dyn RegionDetector>,
    extractor: Arc<dyn TextExtractor>,
    max_concurrent_inferences: usize,
) -> BannerPipeline {
    let classifier = ScriptedClassifier {
        inner: KeywordClassifier::from_config(&classifier_config()),
    };
    BannerPipeline::new(
        Arc::new(HttpImageFetcher::new(&fetch_config()).unwrap()),
        detector,
        extractor,
        Arc::new(classifier),
        PipelineConfig {
            max_concurrent_urls: 4,
            max_concurrent_inferences,
            fetch_max_retries: 0,
            fetch_retry_backoff_ms: 1,
        },
        Metrics::new(),
    )
}
