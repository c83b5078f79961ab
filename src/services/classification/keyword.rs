// Deterministic keyword classifier

use async_trait::async_trait;
use tracing::trace;

use super::labels::LabelSet;
use super::TextClassifier;
use crate::core::config::ClassifierConfig;
use crate::core::errors::ClassificationResult;
use crate::core::types::Classification;

/// Scores each label by how many of its keywords occur in the text.
///
/// The label with most matches wins (ties go to the rule listed first) and
/// confidence is its share of all matches. Text matching nothing gets the
/// no-match label with confidence 0.0.
pub struct KeywordClassifier {
    labels: LabelSet,
    rules: Vec<(String, Vec<String>)>,
    no_match_label: String,
}

impl KeywordClassifier {
    pub fn new(labels: LabelSet, rules: Vec<(String, Vec<String>)>, no_match_label: String) -> Self {
        Self {
            labels,
            rules,
            no_match_label,
        }
    }

    pub fn from_config(config: &ClassifierConfig) -> Self {
        let labels = LabelSet::from_config(config);
        let no_match_label = config
            .no_match_label
            .clone()
            .or_else(|| config.labels.last().cloned())
            .unwrap_or_else(|| config.default_label.clone());
        Self::new(labels, config.keywords.clone(), no_match_label)
    }

    fn score(&self, text: &str) -> Classification {
        let lowered = text.to_lowercase();

        let mut best: Option<(&str, usize)> = None;
        let mut total = 0;
        for (label, keywords) in &self.rules {
            let matches = keywords.iter().filter(|kw| lowered.contains(kw.as_str())).count();
            total += matches;
            if matches > best.map_or(0, |(_, n)| n) {
                best = Some((label.as_str(), matches));
            }
        }

        match best {
            Some((label, matches)) => {
                trace!("keyword match: {} ({}/{})", label, matches, total);
                Classification::new(label, matches as f32 / total as f32)
            }
            None => Classification::new(self.no_match_label.clone(), 0.0),
        }
    }
}

#[async_trait]
impl TextClassifier for KeywordClassifier {
    fn labels(&self) -> &LabelSet {
        &self.labels
    }

    async fn classify_text(&self, text: &str) -> ClassificationResult<Classification> {
        Ok(self.score(text))
    }
}
