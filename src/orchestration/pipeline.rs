// Banner pipeline: fetch → detect → (extract → classify)* per URL,
// then aggregate across the request

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, instrument, warn};

use super::aggregator::aggregate;
use crate::core::config::{Config, PipelineConfig};
use crate::core::errors::{DetectionError, FetchError, RegionFailure, UrlFailure};
use crate::core::types::{
    AnalyzeRequest, AnalyzeResponse, BannerRecord, ExtractedText, Region, SharedImage, UrlStage,
};
use crate::services::classification::{build_classifier, TextClassifier};
use crate::services::detection::{OnnxRegionDetector, RegionDetector};
use crate::services::fetcher::{HttpImageFetcher, ImageFetcher};
use crate::services::ocr::{OcrTextExtractor, TextExtractor};
use crate::services::provisioning::ModelProvisioner;
use crate::utils::metrics::{FailureKind, Metrics, Stage};

/// Runs the per-URL pipeline over shared, read-only model handles
pub struct BannerPipeline {
    fetcher: Arc<dyn ImageFetcher>,
    detector: Arc<dyn RegionDetector>,
    extractor: Arc<dyn TextExtractor>,
    classifier: Arc<dyn TextClassifier>,
    config: PipelineConfig,
    inference_permits: Arc<Semaphore>,
    metrics: Metrics,
    backend_type: String,
}

impl BannerPipeline {
    pub fn new(
        fetcher: Arc<dyn ImageFetcher>,
        detector: Arc<dyn RegionDetector>,
        extractor: Arc<dyn TextExtractor>,
        classifier: Arc<dyn TextClassifier>,
        config: PipelineConfig,
        metrics: Metrics,
    ) -> Self {
        let inference_permits = Arc::new(Semaphore::new(config.max_concurrent_inferences));
        info!(
            "✓ Pipeline ready (urls in flight: {}, inference permits: {})",
            config.max_concurrent_urls, config.max_concurrent_inferences
        );

        Self {
            fetcher,
            detector,
            extractor,
            classifier,
            config,
            inference_permits,
            metrics,
            backend_type: "external".to_string(),
        }
    }

    /// Provision model files, load every model and wire up the pipeline.
    ///
    /// Blocking model loads run on the blocking pool.
    #[instrument(skip(config, metrics))]
    pub async fn from_config(config: Arc<Config>, metrics: Metrics) -> Result<Self> {
        info!("Provisioning models in {}...", config.model_dir().display());
        ModelProvisioner::new(&config.provisioning)?
            .ensure_models(&config.required_model_files())
            .await?;

        info!("Initializing services...");
        let detector_config = Arc::clone(&config);
        let detector = tokio::task::spawn_blocking(move || OnnxRegionDetector::load(&detector_config))
            .await
            .context("Detector loading task panicked")??;
        let ocr_config = Arc::clone(&config);
        let extractor = tokio::task::spawn_blocking(move || OcrTextExtractor::load(&ocr_config))
            .await
            .context("OCR loading task panicked")??;

        let classifier = build_classifier(&config.classifier)?;
        let fetcher = HttpImageFetcher::new(&config.fetch)?;
        let backend_type = detector.device_type().to_string();

        let mut pipeline = Self::new(
            Arc::new(fetcher),
            Arc::new(detector),
            Arc::new(extractor),
            classifier,
            config.pipeline.clone(),
            metrics,
        );
        pipeline.backend_type = backend_type;
        Ok(pipeline)
    }

    /// Backend the detector runs on (e.g. "CUDA", "TensorRT", "CPU")
    pub fn backend_type(&self) -> &str {
        &self.backend_type
    }

    pub fn classifier(&self) -> &Arc<dyn TextClassifier> {
        &self.classifier
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Analyze every URL of a request and aggregate the banners.
    ///
    /// URLs run concurrently up to `max_concurrent_urls`; results are
    /// collected in submission order. Never fails.
    #[instrument(skip(self, request), fields(report_id = request.report_id, urls = request.image_urls.len()))]
    pub async fn process_request(&self, request: AnalyzeRequest) -> AnalyzeResponse {
        let start = Instant::now();
        let num_urls = request.image_urls.len();

        let per_url: Vec<(String, Vec<BannerRecord>)> = stream::iter(request.image_urls)
            .map(|url| async move {
                let records = self.process(&url).await;
                (url, records)
            })
            .buffered(self.config.max_concurrent_urls)
            .collect()
            .await;

        let banner_list = aggregate(per_url);
        let elapsed = start.elapsed();
        self.metrics.record_request(num_urls, elapsed);

        info!(
            "Analyzed {} urls → {} banners in {:.2}ms",
            num_urls,
            banner_list.as_ref().map_or(0, Vec::len),
            elapsed.as_secs_f64() * 1000.0
        );

        AnalyzeResponse {
            report_id: request.report_id,
            banner_list,
        }
    }

    /// Analyze one image URL. Failures are logged and yield an empty list.
    #[instrument(skip(self, url), fields(url = %url))]
    pub async fn process(&self, url: &str) -> Vec<BannerRecord> {
        match self.try_process(url).await {
            Ok(records) => {
                debug!(stage = %UrlStage::Done, banners = records.len(), "url finished");
                records
            }
            Err(failure) => {
                let (stage, kind) = match &failure {
                    UrlFailure::Fetch(e) => (UrlStage::Fetching, e.kind()),
                    UrlFailure::Detection(_) => (UrlStage::Detecting, "detection_failed"),
                };
                warn!(stage = %stage, kind, error = %failure, "url {} failed", UrlStage::Failed);
                self.metrics.record_url_failed();
                Vec::new()
            }
        }
    }

    async fn try_process(&self, url: &str) -> Result<Vec<BannerRecord>, UrlFailure> {
        debug!(stage = %UrlStage::Fetching, "fetching image");
        let image = self.fetch_with_retry(url).await?;
        Ok(self.process_image(&image).await?)
    }

    async fn fetch_with_retry(&self, url: &str) -> Result<SharedImage, FetchError> {
        let mut attempt = 0;
        loop {
            let start = Instant::now();
            let result = self.fetcher.fetch(url).await;
            self.metrics.record_duration(Stage::Fetch, start.elapsed());

            match result {
                Ok(image) => return Ok(image),
                Err(e) if e.is_transient() && attempt < self.config.fetch_max_retries => {
                    let delay = retry_delay(self.config.fetch_retry_backoff_ms, attempt);
                    attempt += 1;
                    warn!(
                        "Fetch attempt {} failed ({}), retrying in {}ms",
                        attempt,
                        e,
                        delay.as_millis()
                    );
                    self.metrics.record_fetch_retry();
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.metrics.record_failure(match e {
                        FetchError::DecodeFailed { .. } => FailureKind::Decode,
                        _ => FailureKind::Fetch,
                    });
                    return Err(e);
                }
            }
        }
    }

    /// Run detection, extraction and classification on a decoded image.
    ///
    /// Records come out in detector order. Regions whose text cannot be
    /// extracted are dropped; only a detector failure is an error.
    pub async fn process_image(&self, image: &SharedImage) -> Result<Vec<BannerRecord>, DetectionError> {
        debug!(stage = %UrlStage::Detecting, "{}x{}", image.width(), image.height());
        let regions = {
            let _permit = self.inference_permit().await;
            let start = Instant::now();
            let detected = self.detector.detect(image).await;
            self.metrics.record_duration(Stage::Detect, start.elapsed());
            detected.map_err(|e| {
                self.metrics.record_failure(FailureKind::Detection);
                e
            })?
        };
        self.metrics.record_regions_detected(regions.len());
        debug!("{} regions detected", regions.len());

        let mut records = Vec::with_capacity(regions.len());
        for (index, region) in regions.into_iter().enumerate() {
            match self.process_region(image, index, region).await {
                Ok(record) => records.push(record),
                Err(failure) => {
                    warn!(stage = %UrlStage::Extracting, region = index, "dropping region: {}", failure);
                    self.metrics.record_failure(FailureKind::Extraction);
                }
            }
        }

        Ok(records)
    }

    async fn process_region(
        &self,
        image: &SharedImage,
        index: usize,
        region: Region,
    ) -> Result<BannerRecord, RegionFailure> {
        let text = {
            let _permit = self.inference_permit().await;
            let start = Instant::now();
            let text = self.extractor.extract(image, &region).await;
            self.metrics.record_duration(Stage::Extract, start.elapsed());
            text.map_err(|source| RegionFailure::Extraction { index, source })?
        };

        let labels = self.classifier.labels();
        let classification = if text.trim().is_empty() {
            labels.empty_text()
        } else {
            let _permit = self.inference_permit().await;
            let start = Instant::now();
            let result = self.classifier.classify(&text).await;
            self.metrics.record_duration(Stage::Classify, start.elapsed());

            result.unwrap_or_else(|e| {
                warn!(stage = %UrlStage::Classifying, region = index, "classification failed: {}", e);
                self.metrics.record_failure(FailureKind::Classification);
                labels.failure()
            })
        };

        self.metrics.record_banner(&classification.label);
        Ok(BannerRecord::from_parts(ExtractedText { region, text }, classification))
    }

    /// `None` only if the semaphore was closed, which never happens while the pipeline lives
    async fn inference_permit(&self) -> Option<SemaphorePermit<'_>> {
        self.inference_permits.acquire().await.ok()
    }
}

/// Exponential backoff: base, 2×base, 4×base, ...
fn retry_delay(base_ms: u64, attempt: u32) -> Duration {
    Duration::from_millis(base_ms.saturating_mul(1u64 << attempt.min(16)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::{ClassificationResult, DetectionResult, ExtractionResult, FetchResult};
    use crate::core::types::{BoundingBox, Classification};
    use crate::services::classification::LabelSet;
    use async_trait::async_trait;
    use image::{DynamicImage, RgbImage};
    use parking_lot::Mutex;

    /// Fails with the queued errors, then serves a blank image
    struct FlakyFetcher {
        errors: Mutex<Vec<FetchError>>,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl ImageFetcher for FlakyFetcher {
        async fn fetch(&self, _url: &str) -> FetchResult<SharedImage> {
            *self.calls.lock() += 1;
            match self.errors.lock().pop() {
                Some(e) => Err(e),
                None => Ok(Arc::new(DynamicImage::ImageRgb8(RgbImage::new(20, 20)))),
            }
        }
    }

    struct OneRegion;

    #[async_trait]
    impl RegionDetector for OneRegion {
        async fn detect(&self, _image: &SharedImage) -> DetectionResult<Vec<Region>> {
            Ok(vec![Region {
                bounding_box: BoundingBox::new(0, 0, 10, 10),
                confidence: 0.8,
            }])
        }
    }

    struct FixedText;

    #[async_trait]
    impl TextExtractor for FixedText {
        async fn extract(&self, _image: &SharedImage, _region: &Region) -> ExtractionResult<String> {
            Ok("OPEN".to_string())
        }
    }

    struct AlwaysInfo(LabelSet);

    #[async_trait]
    impl TextClassifier for AlwaysInfo {
        fn labels(&self) -> &LabelSet {
            &self.0
        }

        async fn classify_text(&self, _text: &str) -> ClassificationResult<Classification> {
            Ok(Classification::new("informational", 0.6))
        }
    }

    fn pipeline(errors: Vec<FetchError>, max_retries: u32) -> (BannerPipeline, Arc<FlakyFetcher>) {
        let fetcher = Arc::new(FlakyFetcher {
            errors: Mutex::new(errors),
            calls: Mutex::new(0),
        });
        let labels = LabelSet::new(vec!["informational".into()], "unclassified", "unknown");
        let pipeline = BannerPipeline::new(
            fetcher.clone(),
            Arc::new(OneRegion),
            Arc::new(FixedText),
            Arc::new(AlwaysInfo(labels)),
            PipelineConfig {
                max_concurrent_urls: 2,
                max_concurrent_inferences: 2,
                fetch_max_retries: max_retries,
                fetch_retry_backoff_ms: 1,
            },
            Metrics::new(),
        );
        (pipeline, fetcher)
    }

    #[test]
    fn test_retry_delay_doubles() {
        assert_eq!(retry_delay(200, 0), Duration::from_millis(200));
        assert_eq!(retry_delay(200, 1), Duration::from_millis(400));
        assert_eq!(retry_delay(200, 3), Duration::from_millis(1600));
    }

    #[tokio::test]
    async fn test_transient_fetch_error_is_retried() {
        let url = "http://cdn.test/a.png".to_string();
        let (pipeline, fetcher) = pipeline(vec![FetchError::Timeout { url: url.clone() }], 1);

        let records = pipeline.process(&url).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].label, "informational");
        assert_eq!(*fetcher.calls.lock(), 2);
        assert_eq!(pipeline.metrics().snapshot().fetch_retries, 1);
    }

    #[tokio::test]
    async fn test_permanent_fetch_error_is_not_retried() {
        let url = "http://cdn.test/a.png".to_string();
        let (pipeline, fetcher) = pipeline(
            vec![FetchError::HttpStatus {
                url: url.clone(),
                status: 404,
            }],
            3,
        );

        assert!(pipeline.process(&url).await.is_empty());
        assert_eq!(*fetcher.calls.lock(), 1);

        let snapshot = pipeline.metrics().snapshot();
        assert_eq!(snapshot.fetch_failures, 1);
        assert_eq!(snapshot.urls_failed, 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let url = "http://cdn.test/a.png".to_string();
        let errors = (0..5).map(|_| FetchError::Timeout { url: url.clone() }).collect();
        let (pipeline, fetcher) = pipeline(errors, 2);

        assert!(pipeline.process(&url).await.is_empty());
        assert_eq!(*fetcher.calls.lock(), 3);
    }
}
