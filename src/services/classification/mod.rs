// Text classification: assigns one configured label to recognized banner text

pub mod keyword;
pub mod labels;
pub mod llm;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::core::config::{ClassifierBackend, ClassifierConfig};
use crate::core::errors::ClassificationResult;
use crate::core::types::Classification;
use crate::middleware::CircuitBreakerStats;

pub use keyword::KeywordClassifier;
pub use labels::LabelSet;
pub use llm::LlmBannerClassifier;

/// Assigns a label and confidence to recognized text
#[async_trait]
pub trait TextClassifier: Send + Sync {
    /// Label vocabulary, including the empty-text and failure outcomes
    fn labels(&self) -> &LabelSet;

    /// Health of the remote endpoint, for backends that have one
    fn circuit_stats(&self) -> Option<CircuitBreakerStats> {
        None
    }

    /// Backend classification of text that has content
    async fn classify_text(&self, text: &str) -> ClassificationResult<Classification>;

    /// Classify `text`. Empty or whitespace-only text gets the default label
    /// with confidence 0.0 and never reaches the backend.
    async fn classify(&self, text: &str) -> ClassificationResult<Classification> {
        if text.trim().is_empty() {
            return Ok(self.labels().empty_text());
        }
        self.classify_text(text).await
    }
}

/// Build the classifier selected by `CLASSIFIER_BACKEND`
pub fn build_classifier(config: &ClassifierConfig) -> anyhow::Result<Arc<dyn TextClassifier>> {
    let classifier: Arc<dyn TextClassifier> = match config.backend {
        ClassifierBackend::Llm => {
            info!("✓ Classifier: LLM at {} (model {})", config.endpoint, config.model);
            Arc::new(LlmBannerClassifier::new(config)?)
        }
        ClassifierBackend::Keyword => {
            info!("✓ Classifier: keyword rules ({} labels)", config.keywords.len());
            Arc::new(KeywordClassifier::from_config(config))
        }
    };
    Ok(classifier)
}
