use crate::core::errors::ConfigError;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::Level;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
}

/// Image fetch configuration
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_bytes: usize,
    pub max_redirects: usize,
    pub user_agent: String,
}

/// Region detector configuration
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub model_file: String,
    /// Boxes below this score never leave the detector
    pub min_confidence: f32,
    pub iou_threshold: f32,
    pub target_size: u32,
    pub max_detections: usize,
    pub inference_backend: Option<String>,
    /// Number of ONNX sessions in the detector pool
    pub onnx_pool_size: usize,
}

/// Text extractor configuration
#[derive(Debug, Clone)]
pub struct OcrConfig {
    pub model_file: String,
    pub vocab_file: String,
    pub target_height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierBackend {
    /// Fine-tuned LLM behind an OpenAI-compatible endpoint
    Llm,
    /// Local keyword rules
    Keyword,
}

impl FromStr for ClassifierBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "llm" => Ok(ClassifierBackend::Llm),
            "keyword" | "keywords" => Ok(ClassifierBackend::Keyword),
            other => Err(ConfigError::InvalidClassifierConfig(format!(
                "unknown CLASSIFIER_BACKEND '{}', expected 'llm' or 'keyword'",
                other
            ))),
        }
    }
}

/// Text classifier configuration
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub backend: ClassifierBackend,
    pub labels: Vec<String>,
    /// Label for empty text
    pub default_label: String,
    /// Label emitted when classification fails
    pub failure_label: String,
    /// Label for text that matches no keyword (keyword backend)
    pub no_match_label: Option<String>,
    pub keywords: Vec<(String, Vec<String>)>,
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub circuit_failure_threshold: usize,
    pub circuit_timeout_secs: u64,
}

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_concurrent_urls: usize,
    /// Cap on in-flight model calls across all requests
    pub max_concurrent_inferences: usize,
    pub fetch_max_retries: u32,
    pub fetch_retry_backoff_ms: u64,
}

/// Model provisioning configuration
#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    pub model_dir: PathBuf,
    pub model_base_url: Option<String>,
    pub download_timeout_secs: u64,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub fetch: FetchConfig,
    pub detection: DetectionConfig,
    pub ocr: OcrConfig,
    pub classifier: ClassifierConfig,
    pub pipeline: PipelineConfig,
    pub provisioning: ProvisioningConfig,
}

const DEFAULT_LABELS: &str = "ad,informational,warning,irrelevant";
const DEFAULT_KEYWORDS: &str = "ad=sale|할인|세일|특가|이벤트|event|쿠폰|coupon|무료|free|%;\
informational=안내|공지|notice|운영시간|hours|info|문의;\
warning=경고|주의|금지|warning|caution|danger|위험";

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::from_lookup(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from an arbitrary key lookup (environment, map in tests)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

        let log_level = get("LOG_LEVEL")
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(Level::INFO);

        let labels = split_list(&get("CLASSIFIER_LABELS").unwrap_or_else(|| DEFAULT_LABELS.to_string()));
        let keywords = parse_keywords(&get("CLASSIFIER_KEYWORDS").unwrap_or_else(|| DEFAULT_KEYWORDS.to_string()));
        let backend = get("CLASSIFIER_BACKEND")
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or(ClassifierBackend::Llm);

        Ok(Self {
            server: ServerConfig {
                port: get("SERVER_PORT").and_then(|s| s.parse().ok()).unwrap_or(8000),
                host: get("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                log_level,
            },
            fetch: FetchConfig {
                timeout_secs: get("FETCH_TIMEOUT_SECONDS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(15),
                connect_timeout_secs: get("FETCH_CONNECT_TIMEOUT_SECONDS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
                max_bytes: get("FETCH_MAX_BYTES")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(20 * 1024 * 1024),
                max_redirects: get("FETCH_MAX_REDIRECTS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
                user_agent: get("FETCH_USER_AGENT")
                    .unwrap_or_else(|| format!("banner-analyzer/{}", env!("CARGO_PKG_VERSION"))),
            },
            detection: DetectionConfig {
                model_file: get("DETECTOR_MODEL_FILE").unwrap_or_else(|| "detector.onnx".to_string()),
                min_confidence: get("DETECTION_MIN_CONFIDENCE")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.4),
                iou_threshold: get("DETECTION_IOU_THRESHOLD")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.45),
                target_size: get("DETECTION_TARGET_SIZE")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(640),
                max_detections: get("DETECTION_MAX_DETECTIONS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(100),
                inference_backend: get("INFERENCE_BACKEND").map(|s| s.to_uppercase()),
                onnx_pool_size: get("ONNX_POOL_SIZE")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(|| {
                        // Half the cores, at least 2
                        std::cmp::max(num_cpus::get() / 2, 2)
                    }),
            },
            ocr: OcrConfig {
                model_file: get("OCR_MODEL_FILE").unwrap_or_else(|| "ocr.onnx".to_string()),
                vocab_file: get("OCR_VOCAB_FILE").unwrap_or_else(|| "ocr_vocab.txt".to_string()),
                target_height: get("OCR_TARGET_HEIGHT")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(48),
            },
            classifier: ClassifierConfig {
                backend,
                labels,
                default_label: get("CLASSIFIER_DEFAULT_LABEL").unwrap_or_else(|| "unclassified".to_string()),
                failure_label: get("CLASSIFIER_FAILURE_LABEL").unwrap_or_else(|| "unknown".to_string()),
                no_match_label: get("CLASSIFIER_NO_MATCH_LABEL"),
                keywords,
                endpoint: get("CLASSIFIER_ENDPOINT")
                    .unwrap_or_else(|| "http://127.0.0.1:8001/v1/chat/completions".to_string()),
                model: get("CLASSIFIER_MODEL").unwrap_or_else(|| "banner-text-classifier".to_string()),
                api_key: get("CLASSIFIER_API_KEY"),
                timeout_secs: get("CLASSIFIER_TIMEOUT_SECONDS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
                circuit_failure_threshold: get("CLASSIFIER_CIRCUIT_FAILURES")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
                circuit_timeout_secs: get("CLASSIFIER_CIRCUIT_TIMEOUT_SECONDS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            },
            pipeline: PipelineConfig {
                max_concurrent_urls: get("MAX_CONCURRENT_URLS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(8),
                max_concurrent_inferences: get("MAX_CONCURRENT_INFERENCES")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(num_cpus::get),
                fetch_max_retries: get("FETCH_MAX_RETRIES")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1),
                fetch_retry_backoff_ms: get("FETCH_RETRY_BACKOFF_MS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(200),
            },
            provisioning: ProvisioningConfig {
                model_dir: PathBuf::from(get("MODEL_DIR").unwrap_or_else(|| "models".to_string())),
                model_base_url: get("MODEL_BASE_URL"),
                download_timeout_secs: get("MODEL_DOWNLOAD_TIMEOUT_SECONDS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(600),
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.detection.min_confidence) {
            return Err(ConfigError::InvalidConfidenceThreshold(self.detection.min_confidence));
        }

        if !(0.0..=1.0).contains(&self.detection.iou_threshold) {
            return Err(ConfigError::InvalidIoUThreshold(self.detection.iou_threshold));
        }

        if !(320..=2048).contains(&self.detection.target_size) || self.detection.target_size % 32 != 0 {
            return Err(ConfigError::InvalidDetectionConfig(format!(
                "target_size must be a multiple of 32 between 320 and 2048, got {}",
                self.detection.target_size
            )));
        }

        if !(16..=128).contains(&self.ocr.target_height) {
            return Err(ConfigError::InvalidDetectionConfig(format!(
                "ocr target_height must be between 16 and 128, got {}",
                self.ocr.target_height
            )));
        }

        for (name, value) in [
            ("DETECTION_MAX_DETECTIONS", self.detection.max_detections),
            ("ONNX_POOL_SIZE", self.detection.onnx_pool_size),
            ("MAX_CONCURRENT_URLS", self.pipeline.max_concurrent_urls),
            ("MAX_CONCURRENT_INFERENCES", self.pipeline.max_concurrent_inferences),
            ("FETCH_MAX_BYTES", self.fetch.max_bytes),
            ("CLASSIFIER_CIRCUIT_FAILURES", self.classifier.circuit_failure_threshold),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidLimit { name, value });
            }
        }

        if self.fetch.timeout_secs == 0 {
            return Err(ConfigError::InvalidFetchConfig(
                "FETCH_TIMEOUT_SECONDS must be > 0".to_string(),
            ));
        }

        self.validate_classifier()?;

        if let Some(ref base) = self.provisioning.model_base_url {
            if url::Url::parse(base).is_err() {
                return Err(ConfigError::InvalidUrl {
                    name: "MODEL_BASE_URL",
                    value: base.clone(),
                });
            }
        }

        Ok(())
    }

    fn validate_classifier(&self) -> Result<(), ConfigError> {
        let classifier = &self.classifier;

        if classifier.labels.is_empty() {
            return Err(ConfigError::InvalidClassifierConfig(
                "CLASSIFIER_LABELS must name at least one label".to_string(),
            ));
        }

        for (i, label) in classifier.labels.iter().enumerate() {
            if classifier.labels[..i].contains(label) {
                return Err(ConfigError::InvalidClassifierConfig(format!(
                    "duplicate label '{}' in CLASSIFIER_LABELS",
                    label
                )));
            }
        }

        if let Some(ref label) = classifier.no_match_label {
            if !classifier.labels.contains(label) {
                return Err(ConfigError::InvalidClassifierConfig(format!(
                    "CLASSIFIER_NO_MATCH_LABEL '{}' is not in CLASSIFIER_LABELS",
                    label
                )));
            }
        }

        if classifier.backend == ClassifierBackend::Keyword {
            for (label, _) in &classifier.keywords {
                if !classifier.labels.contains(label) {
                    return Err(ConfigError::InvalidClassifierConfig(format!(
                        "keyword rules reference unknown label '{}'",
                        label
                    )));
                }
            }
        }

        if classifier.backend == ClassifierBackend::Llm && url::Url::parse(&classifier.endpoint).is_err() {
            return Err(ConfigError::InvalidUrl {
                name: "CLASSIFIER_ENDPOINT",
                value: classifier.endpoint.clone(),
            });
        }

        Ok(())
    }

    pub fn server_port(&self) -> u16 {
        self.server.port
    }

    pub fn server_host(&self) -> &str {
        &self.server.host
    }

    pub fn log_level(&self) -> Level {
        self.server.log_level
    }

    pub fn min_confidence(&self) -> f32 {
        self.detection.min_confidence
    }

    pub fn iou_threshold(&self) -> f32 {
        self.detection.iou_threshold
    }

    pub fn target_size(&self) -> u32 {
        self.detection.target_size
    }

    pub fn onnx_pool_size(&self) -> usize {
        self.detection.onnx_pool_size
    }

    pub fn model_dir(&self) -> &std::path::Path {
        &self.provisioning.model_dir
    }

    pub fn detector_model_path(&self) -> PathBuf {
        self.provisioning.model_dir.join(&self.detection.model_file)
    }

    pub fn ocr_model_path(&self) -> PathBuf {
        self.provisioning.model_dir.join(&self.ocr.model_file)
    }

    pub fn ocr_vocab_path(&self) -> PathBuf {
        self.provisioning.model_dir.join(&self.ocr.vocab_file)
    }

    /// Files that must exist in the model directory before models load
    pub fn required_model_files(&self) -> Vec<String> {
        vec![
            self.detection.model_file.clone(),
            self.ocr.model_file.clone(),
            self.ocr.vocab_file.clone(),
        ]
    }

    pub fn max_concurrent_urls(&self) -> usize {
        self.pipeline.max_concurrent_urls
    }

    pub fn max_concurrent_inferences(&self) -> usize {
        self.pipeline.max_concurrent_inferences
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `label=kw1|kw2;label2=kw3` keyword rules. Keywords are lowercased.
fn parse_keywords(raw: &str) -> Vec<(String, Vec<String>)> {
    raw.split(';')
        .filter_map(|rule| {
            let (label, words) = rule.split_once('=')?;
            let label = label.trim();
            if label.is_empty() {
                return None;
            }
            let words: Vec<String> = words
                .split('|')
                .map(|w| w.trim().to_lowercase())
                .filter(|w| !w.is_empty())
                .collect();
            Some((label.to_string(), words))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let config = Config::from_lookup(|key| map.get(key).cloned())?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.server_port(), 8000);
        assert_eq!(config.classifier.labels, vec!["ad", "informational", "warning", "irrelevant"]);
        assert_eq!(config.classifier.default_label, "unclassified");
        assert_eq!(config.classifier.failure_label, "unknown");
        assert_eq!(config.classifier.backend, ClassifierBackend::Llm);
        assert_eq!(config.detector_model_path(), PathBuf::from("models/detector.onnx"));
        assert_eq!(config.pipeline.fetch_max_retries, 1);
    }

    #[test]
    fn test_rejects_out_of_range_confidence() {
        let err = config_from(&[("DETECTION_MIN_CONFIDENCE", "1.5")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfidenceThreshold(_)));
    }

    #[test]
    fn test_rejects_zero_limits() {
        let err = config_from(&[("MAX_CONCURRENT_INFERENCES", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLimit { name: "MAX_CONCURRENT_INFERENCES", .. }));
    }

    #[test]
    fn test_rejects_duplicate_labels() {
        let err = config_from(&[("CLASSIFIER_LABELS", "ad,ad")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidClassifierConfig(_)));
    }

    #[test]
    fn test_keyword_rules_must_use_known_labels() {
        let err = config_from(&[
            ("CLASSIFIER_BACKEND", "keyword"),
            ("CLASSIFIER_LABELS", "ad,irrelevant"),
            ("CLASSIFIER_KEYWORDS", "promo=sale"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidClassifierConfig(_)));
    }

    #[test]
    fn test_unknown_backend() {
        assert!(config_from(&[("CLASSIFIER_BACKEND", "bert")]).is_err());
    }

    #[test]
    fn test_parse_keywords() {
        let rules = parse_keywords("ad=SALE| 할인 ;warning=caution;;=orphan");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0], ("ad".to_string(), vec!["sale".to_string(), "할인".to_string()]));
        assert_eq!(rules[1].0, "warning");
    }
}
