//! Anchor/positive span sampling.
//!
//! Every training document yields `num_anchors` anchor spans and, for each anchor,
//! `num_positives` positive spans drawn from the same document. Spans are token index
//! ranges; the caller slices its own token buffer with [`Span::slice`].

use crate::error::SamplerError;
use rand::Rng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// A contiguous token range `[start, start + len)` inside a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub len: usize,
}

impl Span {
    pub fn new(start: usize, len: usize) -> Self {
        Self { start, len }
    }

    /// Exclusive end index
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    pub fn contains(&self, other: &Span) -> bool {
        self.start <= other.start && other.end() <= self.end()
    }

    /// Borrow the tokens covered by this span
    pub fn slice<'a, T>(&self, tokens: &'a [T]) -> &'a [T] {
        &tokens[self.start..self.end()]
    }
}

/// One anchor and the positives sampled around it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorPositives {
    pub anchor: Span,
    pub positives: Vec<Span>,
}

/// Where positives are placed relative to their anchor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    /// Positives may overlap, border or be contained in the anchor
    #[default]
    Overlapping,
    /// Positives always lie inside the anchor
    Subsuming,
    /// Positives always border the anchor's start or end
    Adjacent,
}

/// How span lengths are drawn from `[min_span_len, max_span_len]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanLengthDistribution {
    /// Every admissible length is equally likely
    #[default]
    Uniform,
    /// Anchors skew long (Beta(4, 2)), positives skew short (Beta(2, 4))
    Beta,
}

/// Sampler parameters as they appear in the dataset reader section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanSamplerConfig {
    #[serde(default = "default_num_spans")]
    pub num_anchors: usize,
    #[serde(default = "default_num_spans")]
    pub num_positives: usize,
    pub min_span_len: usize,
    pub max_span_len: usize,
    #[serde(default)]
    pub sampling_strategy: SamplingStrategy,
    #[serde(default)]
    pub span_length_distribution: SpanLengthDistribution,
}

fn default_num_spans() -> usize {
    2
}

impl Default for SpanSamplerConfig {
    fn default() -> Self {
        Self {
            num_anchors: 2,
            num_positives: 2,
            min_span_len: 32,
            max_span_len: 510,
            sampling_strategy: SamplingStrategy::default(),
            span_length_distribution: SpanLengthDistribution::default(),
        }
    }
}

#[derive(Clone, Copy)]
enum Role {
    Anchor,
    Positive,
}

/// Samples anchor and positive spans from tokenized documents.
///
/// The sampler holds no per-call state, so one instance can be shared across data loader
/// workers. Results depend only on the document length and the RNG passed in.
#[derive(Debug)]
pub struct SpanSampler {
    config: SpanSamplerConfig,
    anchor_beta: Beta<f64>,
    positive_beta: Beta<f64>,
    adjacent_warned: AtomicBool,
}

impl SpanSampler {
    pub fn new(config: SpanSamplerConfig) -> Result<Self, SamplerError> {
        if config.min_span_len == 0 {
            return Err(SamplerError::ZeroMinSpanLen);
        }
        if config.min_span_len > config.max_span_len {
            return Err(SamplerError::InvertedBounds {
                min: config.min_span_len,
                max: config.max_span_len,
            });
        }
        if config.num_anchors == 0 || config.num_positives == 0 {
            return Err(SamplerError::ZeroSpanCount {
                anchors: config.num_anchors,
                positives: config.num_positives,
            });
        }
        let anchor_beta =
            Beta::new(4.0, 2.0).map_err(|e| SamplerError::Distribution(e.to_string()))?;
        let positive_beta =
            Beta::new(2.0, 4.0).map_err(|e| SamplerError::Distribution(e.to_string()))?;

        Ok(Self {
            config,
            anchor_beta,
            positive_beta,
            adjacent_warned: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SpanSamplerConfig {
        &self.config
    }

    /// Number of spans (anchors plus positives) produced per document
    pub fn spans_per_document(&self) -> usize {
        self.config.num_anchors * (1 + self.config.num_positives)
    }

    /// Sample anchors and positives for a document of `num_tokens` tokens.
    ///
    /// Returns `None` when the document is shorter than `min_span_len`; such documents
    /// are skipped rather than treated as errors.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        num_tokens: usize,
        rng: &mut R,
    ) -> Option<Vec<AnchorPositives>> {
        let min = self.config.min_span_len;
        if num_tokens < min {
            return None;
        }
        let max = self.config.max_span_len.min(num_tokens);

        let anchors = self.sample_anchors(num_tokens, min, max, rng);
        let samples = anchors
            .into_iter()
            .map(|anchor| {
                let positives = (0..self.config.num_positives)
                    .map(|_| self.sample_positive(anchor, num_tokens, min, max, rng))
                    .collect();
                AnchorPositives { anchor, positives }
            })
            .collect();

        Some(samples)
    }

    fn sample_anchors<R: Rng + ?Sized>(
        &self,
        num_tokens: usize,
        min: usize,
        max: usize,
        rng: &mut R,
    ) -> Vec<Span> {
        let count = self.config.num_anchors;
        let segment = num_tokens / count;

        // Give each anchor its own segment of the document when they all fit, so anchors
        // never overlap. Otherwise fall back to drawing from the whole document.
        if count > 1 && segment >= min {
            (0..count)
                .map(|i| {
                    let seg_start = i * segment;
                    let seg_end = if i + 1 == count {
                        num_tokens
                    } else {
                        seg_start + segment
                    };
                    let len =
                        self.sample_length(min, max.min(seg_end - seg_start), Role::Anchor, rng);
                    let start = rng.gen_range(seg_start..=seg_end - len);
                    Span::new(start, len)
                })
                .collect()
        } else {
            (0..count)
                .map(|_| {
                    let len = self.sample_length(min, max, Role::Anchor, rng);
                    let start = rng.gen_range(0..=num_tokens - len);
                    Span::new(start, len)
                })
                .collect()
        }
    }

    fn sample_positive<R: Rng + ?Sized>(
        &self,
        anchor: Span,
        num_tokens: usize,
        min: usize,
        max: usize,
        rng: &mut R,
    ) -> Span {
        match self.config.sampling_strategy {
            SamplingStrategy::Overlapping => {
                self.overlapping_positive(anchor, num_tokens, min, max, rng)
            }
            SamplingStrategy::Subsuming => {
                let len = self.sample_length(min, max.min(anchor.len), Role::Positive, rng);
                let start = rng.gen_range(anchor.start..=anchor.end() - len);
                Span::new(start, len)
            }
            SamplingStrategy::Adjacent => {
                let room_before = anchor.start;
                let room_after = num_tokens - anchor.end();
                let cap = max.min(room_before.max(room_after));
                if cap < min {
                    if !self.adjacent_warned.swap(true, Ordering::Relaxed) {
                        tracing::warn!(
                            "No room for an adjacent positive of at least {} tokens around anchor {:?} \
                             in a {}-token document; sampling an overlapping positive instead. \
                             This message will not be displayed again.",
                            min,
                            anchor,
                            num_tokens
                        );
                    }
                    return self.overlapping_positive(anchor, num_tokens, min, max, rng);
                }

                let len = self.sample_length(min, cap, Role::Positive, rng);
                let mut starts = Vec::with_capacity(2);
                if room_before >= len {
                    starts.push(anchor.start - len);
                }
                if room_after >= len {
                    starts.push(anchor.end());
                }
                // len <= max(room_before, room_after), so at least one side fits
                let start = starts[rng.gen_range(0..starts.len())];
                Span::new(start, len)
            }
        }
    }

    fn overlapping_positive<R: Rng + ?Sized>(
        &self,
        anchor: Span,
        num_tokens: usize,
        min: usize,
        max: usize,
        rng: &mut R,
    ) -> Span {
        let len = self.sample_length(min, max, Role::Positive, rng);
        let lo = anchor.start.saturating_sub(len);
        let hi = anchor.end().min(num_tokens - len);
        Span::new(rng.gen_range(lo..=hi), len)
    }

    fn sample_length<R: Rng + ?Sized>(
        &self,
        min: usize,
        max: usize,
        role: Role,
        rng: &mut R,
    ) -> usize {
        if max <= min {
            return min;
        }
        match self.config.span_length_distribution {
            SpanLengthDistribution::Uniform => rng.gen_range(min..=max),
            SpanLengthDistribution::Beta => {
                let draw = match role {
                    Role::Anchor => self.anchor_beta.sample(rng),
                    Role::Positive => self.positive_beta.sample(rng),
                };
                let len = min + (draw * (max - min) as f64) as usize;
                len.clamp(min, max)
            }
        }
    }
}
