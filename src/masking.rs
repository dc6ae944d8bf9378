//! Anchor token masking for the masked-language-modeling objective.

use crate::tokenizer::SpanTokenizer;
use anyhow::{bail, Result};
use rand::Rng;
use std::ops::Range;

/// Label of positions that do not contribute to the masked-LM loss
pub const IGNORE_LABEL: i64 = -100;

/// Fraction of anchor tokens selected for prediction when none is configured
pub const DEFAULT_MLM_PROBABILITY: f64 = 0.15;

/// Selects tokens for prediction and corrupts them.
///
/// Each token is selected with `probability`. A selected token becomes the mask token 80% of
/// the time, a random content token 10% of the time and is left unchanged otherwise; its
/// original id becomes the label.
#[derive(Debug, Clone)]
pub struct TokenMasker {
    probability: f64,
    mask_id: u32,
    random_ids: Range<u32>,
}

impl TokenMasker {
    pub fn new(probability: f64, tokenizer: &SpanTokenizer) -> Result<Self> {
        if !(probability > 0.0 && probability < 1.0) {
            bail!("mlm_probability must be in (0, 1), got {probability}");
        }
        let Some(mask_id) = tokenizer.mask_id() else {
            bail!("masked_language_modeling needs a tokenizer with a <mask> or [MASK] token");
        };
        let random_ids = tokenizer.content_id_range();
        if random_ids.is_empty() {
            bail!("Tokenizer has no content ids to sample replacements from");
        }
        Ok(Self {
            probability,
            mask_id,
            random_ids,
        })
    }

    /// Corrupted copy of `ids` and one label per position
    pub fn mask<R: Rng + ?Sized>(&self, ids: &[u32], rng: &mut R) -> (Vec<u32>, Vec<i64>) {
        let mut masked = Vec::with_capacity(ids.len());
        let mut labels = Vec::with_capacity(ids.len());
        for &id in ids {
            if !rng.gen_bool(self.probability) {
                masked.push(id);
                labels.push(IGNORE_LABEL);
                continue;
            }
            labels.push(id as i64);
            let roll: f64 = rng.gen();
            masked.push(if roll < 0.8 {
                self.mask_id
            } else if roll < 0.9 {
                rng.gen_range(self.random_ids.clone())
            } else {
                id
            });
        }
        (masked, labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::{WhitespaceTokenizerConfig, MASK_ID};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tokenizer() -> SpanTokenizer {
        SpanTokenizer::whitespace(WhitespaceTokenizerConfig {
            vocab_size: 100,
            ..WhitespaceTokenizerConfig::default()
        })
    }

    #[test]
    fn test_mask_labels_selected_positions() {
        let masker = TokenMasker::new(0.5, &tokenizer()).unwrap();
        let ids = vec![42u32; 2000];
        let (masked, labels) = masker.mask(&ids, &mut StdRng::seed_from_u64(3));

        assert_eq!(masked.len(), ids.len());
        assert_eq!(labels.len(), ids.len());
        let selected = labels.iter().filter(|&&l| l != IGNORE_LABEL).count();
        assert!((800..1200).contains(&selected), "selected {selected}");

        let mut mask_tokens = 0;
        for (&token, &label) in masked.iter().zip(&labels) {
            if label == IGNORE_LABEL {
                assert_eq!(token, 42);
            } else {
                assert_eq!(label, 42);
                assert!(token == MASK_ID || (5..100).contains(&token));
                if token == MASK_ID {
                    mask_tokens += 1;
                }
            }
        }
        // Roughly 80% of the selected tokens become the mask token
        assert!(mask_tokens * 10 > selected * 7);
        assert!(mask_tokens * 10 < selected * 9);
    }

    #[test]
    fn test_mask_is_reproducible() {
        let masker = TokenMasker::new(DEFAULT_MLM_PROBABILITY, &tokenizer()).unwrap();
        let ids: Vec<u32> = (5..60).collect();
        let first = masker.mask(&ids, &mut StdRng::seed_from_u64(11));
        let second = masker.mask(&ids, &mut StdRng::seed_from_u64(11));
        assert_eq!(first, second);
    }

    #[test]
    fn test_invalid_probability_rejected() {
        assert!(TokenMasker::new(0.0, &tokenizer()).is_err());
        assert!(TokenMasker::new(1.0, &tokenizer()).is_err());
    }
}
