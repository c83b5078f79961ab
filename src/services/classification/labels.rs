use crate::core::config::ClassifierConfig;
use crate::core::types::Classification;

/// Configured label vocabulary plus the two reserved outcomes
#[derive(Debug, Clone)]
pub struct LabelSet {
    labels: Vec<String>,
    default_label: String,
    failure_label: String,
}

impl LabelSet {
    pub fn new(labels: Vec<String>, default_label: impl Into<String>, failure_label: impl Into<String>) -> Self {
        Self {
            labels,
            default_label: default_label.into(),
            failure_label: failure_label.into(),
        }
    }

    pub fn from_config(config: &ClassifierConfig) -> Self {
        Self::new(
            config.labels.clone(),
            config.default_label.clone(),
            config.failure_label.clone(),
        )
    }

    pub fn names(&self) -> &[String] {
        &self.labels
    }

    pub fn contains(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Result for text with no content; the model is never asked
    pub fn empty_text(&self) -> Classification {
        Classification::new(self.default_label.clone(), 0.0)
    }

    /// Result emitted when classification of non-empty text fails
    pub fn failure(&self) -> Classification {
        Classification::new(self.failure_label.clone(), 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_outcomes() {
        let labels = LabelSet::new(vec!["ad".into(), "warning".into()], "unclassified", "unknown");
        assert!(labels.contains("ad"));
        assert!(!labels.contains("unknown"));
        assert_eq!(labels.empty_text(), Classification::new("unclassified", 0.0));
        assert_eq!(labels.failure(), Classification::new("unknown", 0.0));
    }
}
