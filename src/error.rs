//! Error types for configuration, span sampling and the contrastive loss.

use thiserror::Error;

/// Errors raised while loading, merging or validating a pretraining configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The `type` tag of a polymorphic section is not registered.
    #[error("Unknown {kind} type '{tag}' (available: {available})")]
    UnknownType {
        /// Section kind, e.g. "loss" or "optimizer"
        kind: &'static str,
        /// Tag found in the document
        tag: String,
        /// Comma separated list of registered tags
        available: String,
    },

    /// A polymorphic section has no `type` tag.
    #[error("Missing 'type' tag in {kind} section")]
    MissingType {
        /// Section kind
        kind: &'static str,
    },

    /// A registered strategy requires a parameter the section does not provide.
    #[error("{kind} '{tag}' requires parameter '{parameter}'")]
    MissingParameter {
        /// Section kind
        kind: &'static str,
        /// Strategy tag
        tag: String,
        /// Name of the missing parameter
        parameter: &'static str,
    },

    /// A parameter is present but its value is out of range or inconsistent.
    #[error("Invalid parameter: {message}")]
    InvalidParameter {
        /// Description of what's wrong
        message: String,
    },

    /// Spans plus the tokenizer's special tokens would not fit in `max_length`.
    #[error(
        "max_span_len ({max_span_len}) + {special_tokens} special tokens exceeds tokenizer max_length ({max_length}); \
         reduce max_span_len to at most {}", max_length.saturating_sub(*special_tokens)
    )]
    SpanExceedsTokenizerLength {
        /// Configured maximum span length
        max_span_len: usize,
        /// Slots reserved by the tokenizer for special tokens
        special_tokens: usize,
        /// Tokenizer maximum sequence length
        max_length: usize,
    },

    /// No backbone identifier could be resolved from the document or the environment.
    #[error("No transformer_model set in the config and ${env_var} is not set")]
    UnresolvedTransformerModel {
        /// Environment variable that was consulted
        env_var: &'static str,
    },

    /// The overrides argument is not a JSON object.
    #[error("Overrides must be a JSON object, got: {0}")]
    InvalidOverrides(String),

    /// Serde failed to map a section onto its typed representation.
    #[error("Failed to parse {section}: {source}")]
    Parse {
        /// Section being parsed
        section: String,
        /// Underlying serde error
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    /// Create an InvalidParameter error.
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Create a Parse error for the named section.
    pub fn parse(section: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Parse {
            section: section.into(),
            source,
        }
    }
}

/// Errors raised when the span sampler is constructed with inconsistent bounds.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SamplerError {
    #[error("min_span_len must be at least 1")]
    ZeroMinSpanLen,

    #[error("min_span_len ({min}) must be less than or equal to max_span_len ({max})")]
    InvertedBounds { min: usize, max: usize },

    #[error("num_anchors and num_positives must both be at least 1 (got {anchors} and {positives})")]
    ZeroSpanCount { anchors: usize, positives: usize },

    #[error("invalid span length distribution: {0}")]
    Distribution(String),
}

/// Errors raised by the NT-Xent loss.
#[derive(Debug, Error, PartialEq)]
pub enum LossError {
    #[error("temperature must be > 0, got {0}")]
    NonPositiveTemperature(f32),

    #[error("expected {expected} labels for the embedding batch, got {actual}")]
    LabelCountMismatch { expected: usize, actual: usize },

    #[error("embedding {index} (label {label}) has no positive in the batch")]
    NoPositive { index: usize, label: usize },

    #[error("anchors ({anchors}) and positives ({positives}) must have the same row count")]
    PairCountMismatch { anchors: usize, positives: usize },
}
