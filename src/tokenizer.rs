use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use xxhash_rust::xxh64::xxh64;

/// Default maximum sequence length, special tokens included
pub const DEFAULT_MAX_LENGTH: usize = 512;

/// Reserved ids of the whitespace tokenizer
pub const PAD_ID: u32 = 0;
pub const BOS_ID: u32 = 1;
pub const EOS_ID: u32 = 2;
pub const UNK_ID: u32 = 3;
pub const MASK_ID: u32 = 4;
const NUM_RESERVED: u32 = 5;
/// Seed of the word hash; changing it remaps every whitespace vocabulary id
const WORD_HASH_SEED: u64 = 0;
/// The whitespace tokenizer wraps every span in BOS/EOS
pub const WHITESPACE_SPECIAL_TOKENS: usize = 2;

fn default_max_length() -> usize {
    DEFAULT_MAX_LENGTH
}

fn default_vocab_size() -> usize {
    30_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhitespaceTokenizerConfig {
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default)]
    pub lowercase: bool,
}

impl Default for WhitespaceTokenizerConfig {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            max_length: DEFAULT_MAX_LENGTH,
            lowercase: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PretrainedTokenizerConfig {
    /// Directory containing `tokenizer.json`, or the path of the file itself
    pub model_name: String,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
}

/// Tokenizer section of the dataset reader
#[derive(Debug, Clone, PartialEq)]
pub enum TokenizerConfig {
    Whitespace(WhitespaceTokenizerConfig),
    PretrainedTransformer(PretrainedTokenizerConfig),
}

impl TokenizerConfig {
    pub fn max_length(&self) -> usize {
        match self {
            TokenizerConfig::Whitespace(c) => c.max_length,
            TokenizerConfig::PretrainedTransformer(c) => c.max_length,
        }
    }

    pub fn init(&self) -> Result<SpanTokenizer> {
        match self {
            TokenizerConfig::Whitespace(c) => Ok(SpanTokenizer::whitespace(c.clone())),
            TokenizerConfig::PretrainedTransformer(c) => {
                SpanTokenizer::from_pretrained(&c.model_name, c.max_length)
            }
        }
    }
}

#[derive(Clone)]
enum Backing {
    Whitespace {
        vocab_size: usize,
        lowercase: bool,
    },
    Pretrained {
        tokenizer: Box<Tokenizer>,
        prefix: Vec<u32>,
        suffix: Vec<u32>,
        pad_id: u32,
        mask_id: Option<u32>,
    },
}

/// Tokenizer used both to measure spans and to encode them for the encoder.
///
/// Spans are sampled over the content ids returned by [`SpanTokenizer::tokenize`]; the special
/// tokens are only added by [`SpanTokenizer::wrap`], so a span of `max_span_len` tokens becomes a
/// sequence of `max_span_len + num_special_tokens()` ids.
#[derive(Clone)]
pub struct SpanTokenizer {
    backing: Backing,
    max_length: usize,
}

impl std::fmt::Debug for SpanTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.backing {
            Backing::Whitespace { .. } => "whitespace",
            Backing::Pretrained { .. } => "pretrained_transformer",
        };
        f.debug_struct("SpanTokenizer")
            .field("kind", &kind)
            .field("vocab_size", &self.vocab_size())
            .field("max_length", &self.max_length)
            .finish()
    }
}

impl SpanTokenizer {
    pub fn whitespace(config: WhitespaceTokenizerConfig) -> Self {
        Self {
            backing: Backing::Whitespace {
                vocab_size: config.vocab_size.max(NUM_RESERVED as usize + 1),
                lowercase: config.lowercase,
            },
            max_length: config.max_length,
        }
    }

    /// Load a Hugging Face `tokenizer.json` from `model_name` (a file or a directory holding one).
    pub fn from_pretrained(model_name: &str, max_length: usize) -> Result<Self> {
        let path = resolve_tokenizer_file(Path::new(model_name));
        if !path.exists() {
            anyhow::bail!(
                "Tokenizer file not found: {} (transformer_model must point at a local tokenizer.json or its directory)",
                path.display()
            );
        }
        let tokenizer = Tokenizer::from_file(&path)
            .map_err(|e| anyhow!("Failed to load tokenizer {}: {}", path.display(), e))?;
        Self::from_tokenizer(tokenizer, max_length)
            .with_context(|| format!("Failed to inspect tokenizer {}", path.display()))
    }

    /// Wrap an already loaded Hugging Face tokenizer.
    pub fn from_tokenizer(mut tokenizer: Tokenizer, max_length: usize) -> Result<Self> {
        // Whole documents are tokenized before sampling, so the file's truncation must not apply
        tokenizer
            .with_truncation(None)
            .map_err(|e| anyhow!("Failed to disable truncation: {}", e))?;
        let (prefix, suffix) = special_token_layout(&tokenizer)?;
        let pad_id = tokenizer
            .get_padding()
            .map(|p| p.pad_id)
            .or_else(|| ["<pad>", "[PAD]"].iter().find_map(|t| tokenizer.token_to_id(t)))
            .unwrap_or(0);
        let mask_id = ["<mask>", "[MASK]"]
            .iter()
            .find_map(|t| tokenizer.token_to_id(t));

        tracing::debug!(
            "Loaded tokenizer with {} tokens ({} prefix / {} suffix special tokens)",
            tokenizer.get_vocab_size(true),
            prefix.len(),
            suffix.len()
        );

        Ok(Self {
            backing: Backing::Pretrained {
                tokenizer: Box::new(tokenizer),
                prefix,
                suffix,
                pad_id,
                mask_id,
            },
            max_length,
        })
    }

    /// Content ids of `text`, without special tokens
    pub fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        match &self.backing {
            Backing::Whitespace {
                vocab_size,
                lowercase,
            } => Ok(text
                .split_whitespace()
                .map(|word| {
                    if *lowercase {
                        hash_word(&word.to_lowercase(), *vocab_size)
                    } else {
                        hash_word(word, *vocab_size)
                    }
                })
                .collect()),
            Backing::Pretrained { tokenizer, .. } => {
                let encoding = tokenizer
                    .encode(text, false)
                    .map_err(|e| anyhow!("Tokenization failed: {}", e))?;
                Ok(encoding.get_ids().to_vec())
            }
        }
    }

    fn special_tokens(&self) -> (&[u32], &[u32]) {
        match &self.backing {
            Backing::Whitespace { .. } => (&[BOS_ID], &[EOS_ID]),
            Backing::Pretrained { prefix, suffix, .. } => (prefix, suffix),
        }
    }

    /// Surround span ids with the tokenizer's special tokens
    pub fn wrap(&self, span: &[u32]) -> Vec<u32> {
        let (prefix, suffix) = self.special_tokens();
        let mut ids = Vec::with_capacity(prefix.len() + span.len() + suffix.len());
        ids.extend_from_slice(prefix);
        ids.extend_from_slice(span);
        ids.extend_from_slice(suffix);
        ids
    }

    /// Align per-token labels of a span with its [`SpanTokenizer::wrap`]ped ids, giving the
    /// special tokens the `ignore` label
    pub fn wrap_labels(&self, labels: &[i64], ignore: i64) -> Vec<i64> {
        let (prefix, suffix) = self.special_tokens();
        let mut wrapped = vec![ignore; prefix.len()];
        wrapped.extend_from_slice(labels);
        wrapped.extend(std::iter::repeat(ignore).take(suffix.len()));
        wrapped
    }

    /// Text of content ids. The whitespace tokenizer hashes words, so it cannot decode.
    pub fn decode(&self, ids: &[u32]) -> Result<Option<String>> {
        match &self.backing {
            Backing::Whitespace { .. } => Ok(None),
            Backing::Pretrained { tokenizer, .. } => tokenizer
                .decode(ids, true)
                .map(Some)
                .map_err(|e| anyhow!("Decoding failed: {}", e)),
        }
    }

    /// Number of ids [`SpanTokenizer::wrap`] adds around a span
    pub fn num_special_tokens(&self) -> usize {
        match &self.backing {
            Backing::Whitespace { .. } => WHITESPACE_SPECIAL_TOKENS,
            Backing::Pretrained { prefix, suffix, .. } => prefix.len() + suffix.len(),
        }
    }

    pub fn pad_id(&self) -> u32 {
        match &self.backing {
            Backing::Whitespace { .. } => PAD_ID,
            Backing::Pretrained { pad_id, .. } => *pad_id,
        }
    }

    /// Id of the mask token, if the vocabulary has one
    pub fn mask_id(&self) -> Option<u32> {
        match &self.backing {
            Backing::Whitespace { .. } => Some(MASK_ID),
            Backing::Pretrained { mask_id, .. } => *mask_id,
        }
    }

    /// Ids that can stand in for a word when a token is randomly replaced
    pub fn content_id_range(&self) -> Range<u32> {
        match &self.backing {
            Backing::Whitespace { vocab_size, .. } => NUM_RESERVED..*vocab_size as u32,
            Backing::Pretrained { tokenizer, .. } => 0..tokenizer.get_vocab_size(true) as u32,
        }
    }

    /// Get vocabulary size
    pub fn vocab_size(&self) -> usize {
        match &self.backing {
            Backing::Whitespace { vocab_size, .. } => *vocab_size,
            Backing::Pretrained { tokenizer, .. } => tokenizer.get_vocab_size(true),
        }
    }

    /// Get max sequence length
    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

fn resolve_tokenizer_file(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join("tokenizer.json")
    } else {
        path.to_path_buf()
    }
}

/// Hash a word into the non-reserved part of the vocabulary.
///
/// XXH64 output is fixed by its specification, so ids stored in checkpoints stay valid
/// across toolchains.
fn hash_word(word: &str, vocab_size: usize) -> u32 {
    let buckets = vocab_size as u64 - NUM_RESERVED as u64;
    NUM_RESERVED + (xxh64(word.as_bytes(), WORD_HASH_SEED) % buckets) as u32
}

/// Special ids the post-processor places before and after a single sequence.
fn special_token_layout(tokenizer: &Tokenizer) -> Result<(Vec<u32>, Vec<u32>)> {
    const SAMPLE_TEXT: &str = "hello world";
    let plain = tokenizer
        .encode(SAMPLE_TEXT, false)
        .map_err(|e| anyhow!("Tokenization failed: {}", e))?;
    let with_special = tokenizer
        .encode(SAMPLE_TEXT, true)
        .map_err(|e| anyhow!("Tokenization failed: {}", e))?;
    let plain = plain.get_ids();
    let with_special = with_special.get_ids();

    let offset = (0..=with_special.len().saturating_sub(plain.len()))
        .find(|&i| with_special[i..].starts_with(plain));

    match offset {
        Some(i) => Ok((
            with_special[..i].to_vec(),
            with_special[i + plain.len()..].to_vec(),
        )),
        None => {
            // Post-processor rewrote the content; count what an empty input produces instead
            let empty = tokenizer
                .encode("", true)
                .map_err(|e| anyhow!("Tokenization failed: {}", e))?;
            Ok((empty.get_ids().to_vec(), Vec::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const WORD_LEVEL_JSON: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": {
            "type": "TemplateProcessing",
            "single": [
                {"SpecialToken": {"id": "<s>", "type_id": 0}},
                {"Sequence": {"id": "A", "type_id": 0}},
                {"SpecialToken": {"id": "</s>", "type_id": 0}}
            ],
            "pair": [
                {"SpecialToken": {"id": "<s>", "type_id": 0}},
                {"Sequence": {"id": "A", "type_id": 0}},
                {"SpecialToken": {"id": "</s>", "type_id": 0}},
                {"Sequence": {"id": "B", "type_id": 0}},
                {"SpecialToken": {"id": "</s>", "type_id": 0}}
            ],
            "special_tokens": {
                "<s>": {"id": "<s>", "ids": [1], "tokens": ["<s>"]},
                "</s>": {"id": "</s>", "ids": [2], "tokens": ["</s>"]}
            }
        },
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"<pad>": 0, "<s>": 1, "</s>": 2, "<unk>": 3, "hello": 4, "world": 5, "span": 6},
            "unk_token": "<unk>"
        }
    }"#;

    fn word_level_tokenizer() -> Tokenizer {
        Tokenizer::from_str(WORD_LEVEL_JSON).unwrap()
    }

    #[test]
    fn test_whitespace_tokenizer() {
        let tokenizer = SpanTokenizer::whitespace(WhitespaceTokenizerConfig::default());
        let ids = tokenizer.tokenize("the cat  sat on\tthe mat").unwrap();
        assert_eq!(ids.len(), 6);
        assert_eq!(ids[0], ids[4]);
        assert!(ids.iter().all(|&id| id >= NUM_RESERVED && (id as usize) < 30_000));

        assert_eq!(tokenizer.num_special_tokens(), 2);
        assert_eq!(tokenizer.wrap(&ids[..2]), vec![BOS_ID, ids[0], ids[1], EOS_ID]);
        assert_eq!(tokenizer.decode(&ids).unwrap(), None);
    }

    #[test]
    fn test_word_hash_is_fixed() {
        // XXH64 of the empty input with seed 0 is 17241709254077376921
        assert_eq!(hash_word("", 1000 + NUM_RESERVED as usize), NUM_RESERVED + 921);

        let a = SpanTokenizer::whitespace(WhitespaceTokenizerConfig::default());
        let b = SpanTokenizer::whitespace(WhitespaceTokenizerConfig::default());
        assert_eq!(a.tokenize("stable ids").unwrap(), b.tokenize("stable ids").unwrap());
    }

    #[test]
    fn test_wrap_labels_and_mask_ids() -> Result<()> {
        let whitespace = SpanTokenizer::whitespace(WhitespaceTokenizerConfig::default());
        assert_eq!(whitespace.wrap_labels(&[7, -100], -100), vec![-100, 7, -100, -100]);
        assert_eq!(whitespace.mask_id(), Some(MASK_ID));
        assert_eq!(whitespace.content_id_range(), NUM_RESERVED..30_000);

        let pretrained = SpanTokenizer::from_tokenizer(word_level_tokenizer(), 16)?;
        assert_eq!(pretrained.wrap_labels(&[4], -1), vec![-1, 4, -1]);
        assert_eq!(pretrained.mask_id(), None);
        Ok(())
    }

    #[test]
    fn test_whitespace_lowercase() {
        let tokenizer = SpanTokenizer::whitespace(WhitespaceTokenizerConfig {
            lowercase: true,
            ..WhitespaceTokenizerConfig::default()
        });
        let ids = tokenizer.tokenize("Hello HELLO hello").unwrap();
        assert!(ids.iter().all(|&id| id == ids[0]));
    }

    #[test]
    fn test_pretrained_special_token_layout() -> Result<()> {
        let tokenizer = SpanTokenizer::from_tokenizer(word_level_tokenizer(), 16)?;
        assert_eq!(tokenizer.num_special_tokens(), 2);

        let ids = tokenizer.tokenize("hello span world")?;
        assert_eq!(ids, vec![4, 6, 5]);
        assert_eq!(tokenizer.wrap(&ids), vec![1, 4, 6, 5, 2]);
        assert_eq!(tokenizer.pad_id(), 0);
        assert_eq!(tokenizer.vocab_size(), 7);
        assert_eq!(tokenizer.decode(&[4, 5])?, Some("hello world".to_string()));
        Ok(())
    }

    #[test]
    fn test_from_pretrained_directory() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("tokenizer.json"), WORD_LEVEL_JSON)?;

        let tokenizer = SpanTokenizer::from_pretrained(&dir.path().to_string_lossy(), 32)?;
        assert_eq!(tokenizer.max_length(), 32);
        assert_eq!(tokenizer.tokenize("world hello")?, vec![5, 4]);
        Ok(())
    }

    #[test]
    fn test_missing_tokenizer_file() {
        let err = SpanTokenizer::from_pretrained("/definitely/not/here", 512).unwrap_err();
        assert!(err.to_string().contains("Tokenizer file not found"));
    }
}
