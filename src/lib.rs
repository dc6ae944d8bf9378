#![recursion_limit = "256"]

pub mod batcher;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod embedding;
pub mod error;
pub mod launcher;
pub mod losses;
pub mod masking;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod preprocess;
pub mod registry;
pub mod sampler;
pub mod summary;
pub mod tokenizer;
pub mod training;

pub use config::{PretrainConfig, TransformerModelPrecedence, TRANSFORMER_MODEL_ENV};
pub use data::{ContrastiveDataset, ContrastiveItem, TokenizedCorpus};
pub use embedding::SpanEmbedder;
pub use error::{ConfigError, LossError, SamplerError};
pub use losses::{LossConfig, NtXentLoss};
pub use masking::TokenMasker;
pub use model::{ContrastiveEncoder, EncoderConfig};
pub use sampler::{AnchorPositives, Span, SpanSampler, SpanSamplerConfig};
pub use tokenizer::SpanTokenizer;
pub use training::{train, train_on, TrainOptions, TrainOutcome};
