// Text extraction: CTC text-line recognizer over a cropped banner region

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::DynamicImage;
use ndarray::Array1;
use ort::{session::Session, value::Value};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::core::config::Config;
use crate::core::errors::{ExtractionError, ExtractionResult};
use crate::core::types::{Region, SharedImage};
use crate::services::onnx_builder::{build_session_with_acceleration, read_model_bytes};
use crate::utils::image_ops::{crop_region, rgb_to_chw_tensor};

const MIN_WIDTH: u32 = 10;
const MAX_WIDTH: u32 = 4096;
const BLANK_INDEX: usize = 0;

/// Recognizes the text inside one region of an image.
///
/// An empty string is a valid result (region with no legible text).
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, image: &SharedImage, region: &Region) -> ExtractionResult<String>;
}

/// ONNX CTC recognizer
pub struct OcrTextExtractor {
    inner: Arc<OcrInner>,
}

struct OcrInner {
    session: Mutex<Session>,
    input_name: String,
    /// Some recognizers take the sequence length as a second input
    seq_len_input: Option<String>,
    vocab: Vec<String>,
    target_height: u32,
}

impl OcrTextExtractor {
    /// Load the recognizer model and vocabulary. Blocking.
    pub fn load(config: &Config) -> Result<Self> {
        let model_path = config.ocr_model_path();
        let vocab_path = config.ocr_vocab_path();

        info!("Loading OCR model from disk: {}", model_path.display());
        let model_bytes = read_model_bytes(&model_path)?;
        let (device_type, session) = build_session_with_acceleration(
            &model_bytes,
            "ocr",
            config.detection.inference_backend.as_deref(),
        )?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .context("OCR model declares no inputs")?;
        let seq_len_input = session.inputs.get(1).map(|input| input.name.clone());

        let vocab = load_vocabulary(&vocab_path)?;
        info!(
            "✓ OCR: {} (vocab_size={}, blank_index={})",
            device_type,
            vocab.len(),
            BLANK_INDEX
        );

        Ok(Self {
            inner: Arc::new(OcrInner {
                session: Mutex::new(session),
                input_name,
                seq_len_input,
                vocab,
                target_height: config.ocr.target_height,
            }),
        })
    }
}

#[async_trait]
impl TextExtractor for OcrTextExtractor {
    async fn extract(&self, image: &SharedImage, region: &Region) -> ExtractionResult<String> {
        let bbox = region.bounding_box;
        if !bbox.fits_within(image.width(), image.height()) {
            return Err(ExtractionError::RegionOutOfBounds {
                x: bbox.x,
                y: bbox.y,
                w: bbox.w,
                h: bbox.h,
                image_width: image.width(),
                image_height: image.height(),
            });
        }

        let inner = Arc::clone(&self.inner);
        let image = Arc::clone(image);
        tokio::task::spawn_blocking(move || {
            let crop = crop_region(&image, &bbox);
            inner.recognize(&crop)
        })
        .await
        .map_err(|e| ExtractionError::WorkerFailed(e.to_string()))?
    }
}

impl OcrInner {
    fn recognize(&self, crop: &DynamicImage) -> ExtractionResult<String> {
        let new_w = scaled_width(crop.width(), crop.height(), self.target_height);
        let resized = crop.resize_exact(new_w, self.target_height, image::imageops::FilterType::Lanczos3);
        let data_value = Value::from_array(rgb_to_chw_tensor(&resized.to_rgb8()))?;

        let (dims, logits) = {
            let mut session = self.session.lock();
            let outputs = match self.seq_len_input {
                Some(ref seq_name) => {
                    // Recognizer stride is 4 pixels per timestep
                    let seq_lengths = Value::from_array(Array1::from_vec(vec![(new_w / 4) as i32]))?;
                    session.run(ort::inputs![
                        self.input_name.as_str() => data_value,
                        seq_name.as_str() => seq_lengths
                    ])?
                }
                None => session.run(ort::inputs![self.input_name.as_str() => data_value])?,
            };

            let (shape, logits) = outputs[0].try_extract_tensor::<f32>()?;
            let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
            (dims, logits.to_vec())
        };

        let (seq_len, vocab_size) = logits_layout(&dims)?;
        if logits.len() < seq_len * vocab_size {
            return Err(ExtractionError::UnexpectedOutput(dims));
        }

        let text = ctc_greedy_decode(&logits, seq_len, vocab_size, &self.vocab);
        let text = text.trim().to_string();
        debug!("OCR result: '{}'", text);
        Ok(text)
    }
}

fn scaled_width(width: u32, height: u32, target_height: u32) -> u32 {
    let scaled = width as u64 * target_height as u64 / height.max(1) as u64;
    (scaled.min(MAX_WIDTH as u64) as u32).max(MIN_WIDTH)
}

/// `(timesteps, classes)` for `[1, T, V]`, `[T, 1, V]` or `[T, V]` logits
fn logits_layout(dims: &[usize]) -> ExtractionResult<(usize, usize)> {
    match *dims {
        [1, t, v] => Ok((t, v)),
        [t, 1, v] => Ok((t, v)),
        [t, v] => Ok((t, v)),
        _ => Err(ExtractionError::UnexpectedOutput(dims.to_vec())),
    }
}

/// Load the vocabulary: line `i` is the token for class `i`; class 0 is the CTC blank
fn load_vocabulary(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read vocabulary file {}", path.display()))?;
    let vocab = parse_vocabulary(&content);
    if vocab.len() < 2 {
        anyhow::bail!("Vocabulary {} has no tokens besides the blank", path.display());
    }
    debug!("Loaded {} vocabulary entries", vocab.len());
    Ok(vocab)
}

fn parse_vocabulary(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| {
            let token = line.trim_end_matches('\r');
            if token == "<space>" {
                " ".to_string()
            } else {
                token.to_string()
            }
        })
        .collect()
}

/// CTC greedy decode: argmax per timestep, collapse repeats, drop blanks
fn ctc_greedy_decode(logits: &[f32], seq_len: usize, vocab_size: usize, vocab: &[String]) -> String {
    let mut text = String::new();
    let mut prev_idx: Option<usize> = None;

    for t in 0..seq_len {
        let step = &logits[t * vocab_size..(t + 1) * vocab_size];
        let mut best_idx = BLANK_INDEX;
        let mut best_val = f32::NEG_INFINITY;
        for (i, &val) in step.iter().enumerate() {
            if val > best_val {
                best_val = val;
                best_idx = i;
            }
        }

        if best_idx != BLANK_INDEX && Some(best_idx) != prev_idx {
            match vocab.get(best_idx) {
                Some(token) => text.push_str(token),
                None => trace!("CTC index {} outside vocabulary", best_idx),
            }
        }
        prev_idx = Some(best_idx);
    }

    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> Vec<String> {
        parse_vocabulary("<blank>\nS\nA\nL\nE\n<space>\n5\n0\n%\n세\n일")
    }

    /// One-hot logits for a sequence of class indices
    fn one_hot(indices: &[usize], vocab_size: usize) -> Vec<f32> {
        let mut logits = vec![0.0; indices.len() * vocab_size];
        for (t, &idx) in indices.iter().enumerate() {
            logits[t * vocab_size + idx] = 1.0;
        }
        logits
    }

    #[test]
    fn test_parse_vocabulary() {
        let vocab = vocab();
        assert_eq!(vocab.len(), 11);
        assert_eq!(vocab[0], "<blank>");
        assert_eq!(vocab[5], " ");
        assert_eq!(vocab[9], "세");

        let crlf = parse_vocabulary("<blank>\r\na\r\n");
        assert_eq!(crlf, vec!["<blank>", "a"]);
    }

    #[test]
    fn test_ctc_collapses_repeats_and_blanks() {
        let vocab = vocab();
        // S S A <b> L E E <space> 5 0 0 <b> 0 %
        let seq = [1, 1, 2, 0, 3, 4, 4, 5, 6, 7, 7, 0, 7, 8];
        let logits = one_hot(&seq, vocab.len());
        let text = ctc_greedy_decode(&logits, seq.len(), vocab.len(), &vocab);
        assert_eq!(text, "SALE 500%");
    }

    #[test]
    fn test_ctc_all_blank_is_empty() {
        let vocab = vocab();
        let logits = one_hot(&[0, 0, 0], vocab.len());
        assert_eq!(ctc_greedy_decode(&logits, 3, vocab.len(), &vocab), "");
    }

    #[test]
    fn test_ctc_skips_out_of_vocab_index() {
        let vocab = vec!["<blank>".to_string(), "a".to_string()];
        // Model has one more class than the vocabulary file
        let logits = one_hot(&[1, 2, 1], 3);
        assert_eq!(ctc_greedy_decode(&logits, 3, 3, &vocab), "aa");
    }

    #[test]
    fn test_logits_layout() {
        assert_eq!(logits_layout(&[1, 20, 11]).unwrap(), (20, 11));
        assert_eq!(logits_layout(&[20, 1, 11]).unwrap(), (20, 11));
        assert_eq!(logits_layout(&[20, 11]).unwrap(), (20, 11));
        assert!(matches!(
            logits_layout(&[1, 2, 3, 4]),
            Err(ExtractionError::UnexpectedOutput(_))
        ));
    }

    #[test]
    fn test_scaled_width_keeps_aspect() {
        assert_eq!(scaled_width(200, 50, 48), 192);
        assert_eq!(scaled_width(2, 100, 48), MIN_WIDTH);
        assert_eq!(scaled_width(100_000, 10, 48), MAX_WIDTH);
    }

    #[test]
    fn test_load_vocabulary_rejects_blank_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.txt");
        std::fs::write(&path, "<blank>\n").unwrap();
        assert!(load_vocabulary(&path).is_err());

        std::fs::write(&path, "<blank>\na\nb\n").unwrap();
        assert_eq!(load_vocabulary(&path).unwrap().len(), 3);
    }
}
