use crate::masking::{TokenMasker, IGNORE_LABEL};
use crate::sampler::{AnchorPositives, SpanSampler};
use crate::tokenizer::SpanTokenizer;
use anyhow::{Context, Result};
use burn::data::dataset::Dataset;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Tokenized training documents read from a line-delimited corpus file.
///
/// Documents shorter than the sampler's `min_span_len` are dropped while reading, so every
/// document kept here can always produce a full set of anchors and positives.
#[derive(Debug, Clone, Default)]
pub struct TokenizedCorpus {
    pub documents: Vec<Vec<u32>>,
    pub stats: CorpusStats,
}

impl TokenizedCorpus {
    /// Read one document per non-empty line of `path`
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        tokenizer: &SpanTokenizer,
        min_tokens: usize,
        max_instances: Option<usize>,
    ) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("Failed to open training data {}", path_ref.display()))?;

        let mut corpus = Self::default();
        for (line_number, line) in BufReader::new(file).lines().enumerate() {
            if max_instances.is_some_and(|max| corpus.documents.len() >= max) {
                break;
            }
            let line = line.with_context(|| {
                format!("Failed to read line {} of {}", line_number + 1, path_ref.display())
            })?;
            corpus.push_text(&line, tokenizer, min_tokens)?;
        }

        tracing::info!(
            "Loaded {} documents from {} ({} skipped as shorter than {} tokens)",
            corpus.documents.len(),
            path_ref.display(),
            corpus.stats.skipped_short,
            min_tokens
        );

        Ok(corpus)
    }

    /// Build a corpus from in-memory texts
    pub fn from_texts<S: AsRef<str>>(
        texts: &[S],
        tokenizer: &SpanTokenizer,
        min_tokens: usize,
    ) -> Result<Self> {
        let mut corpus = Self::default();
        for text in texts {
            corpus.push_text(text.as_ref(), tokenizer, min_tokens)?;
        }
        Ok(corpus)
    }

    fn push_text(
        &mut self,
        text: &str,
        tokenizer: &SpanTokenizer,
        min_tokens: usize,
    ) -> Result<()> {
        if text.trim().is_empty() {
            self.stats.skipped_empty += 1;
            return Ok(());
        }
        let ids = tokenizer.tokenize(text)?;
        if ids.len() < min_tokens {
            tracing::debug!(
                "Skipping document with {} tokens (min_span_len is {})",
                ids.len(),
                min_tokens
            );
            self.stats.skipped_short += 1;
            return Ok(());
        }
        self.stats.record(ids.len());
        self.documents.push(ids);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// Statistics about a corpus
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorpusStats {
    pub documents: usize,
    pub skipped_short: usize,
    pub skipped_empty: usize,
    pub total_tokens: usize,
    pub min_tokens: usize,
    pub max_tokens: usize,
}

impl CorpusStats {
    fn record(&mut self, num_tokens: usize) {
        self.min_tokens = if self.documents == 0 {
            num_tokens
        } else {
            self.min_tokens.min(num_tokens)
        };
        self.max_tokens = self.max_tokens.max(num_tokens);
        self.total_tokens += num_tokens;
        self.documents += 1;
    }

    pub fn mean_tokens(&self) -> f64 {
        if self.documents == 0 {
            0.0
        } else {
            self.total_tokens as f64 / self.documents as f64
        }
    }

    /// Print formatted statistics
    pub fn print(&self) {
        println!("Corpus Statistics:");
        println!("  Documents: {}", self.documents);
        println!(
            "  Tokens per document: min {} / mean {:.1} / max {}",
            self.min_tokens,
            self.mean_tokens(),
            self.max_tokens
        );
        println!("  Skipped (too short): {}", self.skipped_short);
        println!("  Skipped (empty): {}", self.skipped_empty);
    }
}

/// Anchors and positives of one document, already wrapped in special tokens
#[derive(Debug, Clone, PartialEq)]
pub struct ContrastiveItem {
    pub index: usize,
    pub anchors: Vec<Vec<u32>>,
    /// `positives[a]` holds the positives of `anchors[a]`
    pub positives: Vec<Vec<Vec<u32>>>,
    /// Masked-LM targets aligned with `anchors`, set when masking is enabled
    pub anchor_labels: Option<Vec<Vec<i64>>>,
}

const ITEM_STREAM: u64 = 0;
const ORDER_STREAM: u64 = 1;
const MASKING_STREAM: u64 = 2;

/// Generator seeded from up to four values, e.g. `[seed, epoch, index, stream]`
pub fn seeded_rng(parts: &[u64]) -> StdRng {
    let mut seed = <StdRng as SeedableRng>::Seed::default();
    for (chunk, part) in seed.chunks_mut(8).zip(parts) {
        chunk.copy_from_slice(&part.to_le_bytes());
    }
    StdRng::from_seed(seed)
}

/// Shared epoch counter; changing it re-seeds every document's span sampling.
#[derive(Debug, Clone, Default)]
pub struct EpochHandle(Arc<AtomicUsize>);

impl EpochHandle {
    pub fn set(&self, epoch: usize) {
        self.0.store(epoch, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Burn dataset sampling fresh spans for a document each time it is read.
///
/// Randomness for document `index` comes from `(seed, epoch, index)` only, so items are
/// reproducible and independent of worker scheduling.
pub struct ContrastiveDataset {
    corpus: Arc<TokenizedCorpus>,
    sampler: Arc<SpanSampler>,
    tokenizer: SpanTokenizer,
    masker: Option<TokenMasker>,
    seed: u64,
    epoch: EpochHandle,
}

impl ContrastiveDataset {
    pub fn new(
        corpus: TokenizedCorpus,
        sampler: SpanSampler,
        tokenizer: SpanTokenizer,
        seed: u64,
    ) -> Self {
        Self {
            corpus: Arc::new(corpus),
            sampler: Arc::new(sampler),
            tokenizer,
            masker: None,
            seed,
            epoch: EpochHandle::default(),
        }
    }

    /// Mask the anchors of every item and attach their masked-LM labels
    pub fn with_masking(mut self, masker: TokenMasker) -> Self {
        self.masker = Some(masker);
        self
    }

    pub fn epoch_handle(&self) -> EpochHandle {
        self.epoch.clone()
    }

    pub fn sampler(&self) -> &SpanSampler {
        &self.sampler
    }

    fn item_rng(&self, index: usize, stream: u64) -> StdRng {
        seeded_rng(&[self.seed, self.epoch.get() as u64, index as u64, stream])
    }

    /// Span positions sampled for document `index` in the current epoch
    pub fn sample_spans(&self, index: usize) -> Option<Vec<AnchorPositives>> {
        let document = self.corpus.documents.get(index)?;
        let mut rng = self.item_rng(index, ITEM_STREAM);
        self.sampler.sample(document.len(), &mut rng)
    }
}

impl Dataset<ContrastiveItem> for ContrastiveDataset {
    fn get(&self, index: usize) -> Option<ContrastiveItem> {
        let document = self.corpus.documents.get(index)?;
        let samples = self.sample_spans(index)?;

        let mut anchors = Vec::with_capacity(samples.len());
        let mut positives = Vec::with_capacity(samples.len());
        let mut labels = self.masker.as_ref().map(|_| Vec::with_capacity(samples.len()));
        let mut mask_rng = self.item_rng(index, MASKING_STREAM);
        for sample in samples {
            let anchor = sample.anchor.slice(document);
            match (&self.masker, labels.as_mut()) {
                (Some(masker), Some(labels)) => {
                    let (masked, anchor_labels) = masker.mask(anchor, &mut mask_rng);
                    anchors.push(self.tokenizer.wrap(&masked));
                    labels.push(self.tokenizer.wrap_labels(&anchor_labels, IGNORE_LABEL));
                }
                _ => anchors.push(self.tokenizer.wrap(anchor)),
            }
            positives.push(
                sample
                    .positives
                    .iter()
                    .map(|span| self.tokenizer.wrap(span.slice(document)))
                    .collect(),
            );
        }

        Some(ContrastiveItem {
            index,
            anchors,
            positives,
            anchor_labels: labels,
        })
    }

    fn len(&self) -> usize {
        self.corpus.len()
    }
}

/// Item order for one epoch: optionally shuffled, then cut to the `items_used` consumed.
///
/// The cut happens after the shuffle so `drop_last` leaves out different items each epoch.
pub fn epoch_indices(
    num_items: usize,
    items_used: usize,
    shuffle: bool,
    seed: u64,
    epoch: usize,
) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..num_items).collect();
    if shuffle {
        indices.shuffle(&mut seeded_rng(&[seed, epoch as u64, 0, ORDER_STREAM]));
    }
    indices.truncate(items_used);
    indices
}

/// View of a shared dataset through an index list
pub struct EpochSubset<D> {
    dataset: Arc<D>,
    indices: Vec<usize>,
}

impl<D> EpochSubset<D> {
    pub fn new(dataset: Arc<D>, indices: Vec<usize>) -> Self {
        Self { dataset, indices }
    }
}

impl<D: Dataset<ContrastiveItem>> Dataset<ContrastiveItem> for EpochSubset<D> {
    fn get(&self, index: usize) -> Option<ContrastiveItem> {
        self.dataset.get(*self.indices.get(index)?)
    }

    fn len(&self) -> usize {
        self.indices.len()
    }
}

/// Number of batches and of items actually consumed for one epoch
pub fn batch_plan(num_items: usize, batch_size: usize, drop_last: bool) -> (usize, usize) {
    if batch_size == 0 {
        return (0, 0);
    }
    let full = num_items / batch_size;
    if drop_last || num_items % batch_size == 0 {
        (full, full * batch_size)
    } else {
        (full + 1, num_items)
    }
}
