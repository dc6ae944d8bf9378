//! Pretraining configuration: JSON document + overrides → validated, typed configuration.
//!
//! The document keeps the layout of the original experiment files: a dataset reader with a
//! nested tokenizer, a model section with a nested loss, a data loader, and a trainer with
//! optimizer, scheduler and checkpointer sections. Polymorphic sections carry a `type` tag and
//! are resolved through [`Registry`] instances.

use crate::error::ConfigError;
use crate::losses::LossConfig;
use crate::masking::DEFAULT_MLM_PROBABILITY;
use crate::model::{EncoderConfig, EncoderSettings};
use crate::optim::{LearningRateScheduler, OptimizerConfig, SlantedTriangularParams, WarmupParams};
use crate::registry::{from_section, section_type, Registry};
use crate::sampler::{SpanSampler, SpanSamplerConfig};
use crate::tokenizer::{
    PretrainedTokenizerConfig, SpanTokenizer, TokenizerConfig, WhitespaceTokenizerConfig,
    WHITESPACE_SPECIAL_TOKENS,
};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Environment variable holding the backbone identifier
pub const TRANSFORMER_MODEL_ENV: &str = "TRANSFORMER_MODEL";

/// Which source wins when both the document and the environment name a backbone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformerModelPrecedence {
    #[default]
    Environment,
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformerModelSource {
    Environment,
    Config,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTransformerModel {
    pub name: String,
    pub source: TransformerModelSource,
}

/// Pick the backbone identifier from the document value and the environment value.
///
/// Empty strings count as unset. When both are set and disagree the loser is reported with a
/// warning rather than dropped silently.
pub fn resolve_transformer_model(
    from_config: Option<&str>,
    from_env: Option<&str>,
    precedence: TransformerModelPrecedence,
) -> Option<ResolvedTransformerModel> {
    let from_config = from_config.map(str::trim).filter(|s| !s.is_empty());
    let from_env = from_env.map(str::trim).filter(|s| !s.is_empty());

    let config = from_config.map(|name| ResolvedTransformerModel {
        name: name.to_string(),
        source: TransformerModelSource::Config,
    });
    let env = from_env.map(|name| ResolvedTransformerModel {
        name: name.to_string(),
        source: TransformerModelSource::Environment,
    });

    match (config, env) {
        (Some(config), Some(env)) => {
            let (winner, loser) = match precedence {
                TransformerModelPrecedence::Environment => (env, config),
                TransformerModelPrecedence::Config => (config, env),
            };
            if winner.name != loser.name {
                tracing::warn!(
                    "transformer_model is '{}' in the config but ${} is '{}'; using '{}' (transformer_model_precedence = {:?})",
                    from_config.unwrap_or_default(),
                    TRANSFORMER_MODEL_ENV,
                    from_env.unwrap_or_default(),
                    winner.name,
                    precedence
                );
            }
            Some(winner)
        }
        (config, env) => config.or(env),
    }
}

/// Vocabulary strategy. Token ids come straight from the tokenizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VocabularyConfig {
    Empty,
}

/// Dataset reader: span sampling over tokenized documents
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetReaderConfig {
    pub sampler: SpanSamplerConfig,
    pub tokenizer: TokenizerConfig,
    pub max_instances: Option<usize>,
}

/// Encoder plus its training objective
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub encoder: EncoderSettings,
    pub loss: LossConfig,
    /// Adds a masked-LM loss on the anchors to the contrastive loss
    pub masked_language_modeling: bool,
    pub mlm_probability: f64,
}

impl ModelConfig {
    /// Encoder configuration sized for `tokenizer`
    pub fn encoder_config(&self, tokenizer: &SpanTokenizer) -> EncoderConfig {
        self.encoder
            .to_config(tokenizer.vocab_size(), tokenizer.max_length())
            .with_masked_language_modeling(self.masked_language_modeling)
    }
}

fn default_one() -> usize {
    1
}

fn default_true() -> bool {
    true
}

/// Data loader batching policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataLoaderConfig {
    #[serde(default = "default_one")]
    pub batch_size: usize,
    #[serde(default = "default_one")]
    pub num_workers: usize,
    #[serde(default = "default_true")]
    pub drop_last: bool,
    #[serde(default = "default_true")]
    pub shuffle: bool,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            num_workers: 1,
            drop_last: true,
            shuffle: true,
        }
    }
}

/// Optimizer, schedule and checkpoint policy
#[derive(Debug, Clone, PartialEq)]
pub struct TrainerConfig {
    pub num_epochs: usize,
    pub grad_norm: Option<f32>,
    pub seed: u64,
    pub optimizer: OptimizerConfig,
    pub learning_rate_scheduler: LearningRateScheduler,
    pub num_serialized_models_to_keep: usize,
}

/// Fully resolved pretraining configuration
#[derive(Debug, Clone)]
pub struct PretrainConfig {
    pub train_data_path: Option<PathBuf>,
    pub transformer_model: Option<ResolvedTransformerModel>,
    pub vocabulary: VocabularyConfig,
    pub dataset_reader: DatasetReaderConfig,
    pub model: ModelConfig,
    pub data_loader: DataLoaderConfig,
    pub trainer: TrainerConfig,
    document: Value,
}

#[derive(Deserialize)]
struct RawDocument {
    #[serde(default)]
    train_data_path: Option<PathBuf>,
    #[serde(default)]
    transformer_model: Option<String>,
    #[serde(default)]
    transformer_model_precedence: TransformerModelPrecedence,
    #[serde(default = "empty_vocabulary")]
    vocabulary: Value,
    dataset_reader: Value,
    model: Value,
    #[serde(default)]
    data_loader: DataLoaderConfig,
    trainer: Value,
}

fn empty_vocabulary() -> Value {
    serde_json::json!({"type": "empty"})
}

#[derive(Deserialize)]
struct RawDatasetReader {
    #[serde(flatten)]
    sampler: SpanSamplerConfig,
    tokenizer: Value,
    #[serde(default)]
    max_instances: Option<usize>,
}

#[derive(Deserialize)]
struct RawModel {
    #[serde(flatten)]
    encoder: EncoderSettings,
    loss: Value,
    #[serde(default)]
    masked_language_modeling: bool,
    #[serde(default = "default_mlm_probability")]
    mlm_probability: f64,
}

fn default_mlm_probability() -> f64 {
    DEFAULT_MLM_PROBABILITY
}

fn default_grad_norm() -> Option<f32> {
    Some(1.0)
}

fn default_seed() -> u64 {
    42
}

#[derive(Deserialize, Default)]
struct CheckpointerSection {
    #[serde(default = "default_one")]
    num_serialized_models_to_keep: usize,
}

#[derive(Deserialize)]
struct RawTrainer {
    #[serde(default = "default_one")]
    num_epochs: usize,
    #[serde(default = "default_grad_norm")]
    grad_norm: Option<f32>,
    #[serde(default = "default_seed")]
    seed: u64,
    optimizer: Value,
    #[serde(default)]
    learning_rate_scheduler: Option<Value>,
    #[serde(default)]
    checkpointer: CheckpointerSection,
}

pub fn vocabulary_registry() -> Registry<VocabularyConfig> {
    Registry::new("vocabulary").register("empty", &[], |_| Ok(VocabularyConfig::Empty))
}

pub fn tokenizer_registry() -> Registry<TokenizerConfig> {
    Registry::new("tokenizer")
        .register("whitespace", &[], |section| {
            from_section::<WhitespaceTokenizerConfig>("tokenizer", section)
                .map(TokenizerConfig::Whitespace)
        })
        .register("pretrained_transformer", &["model_name"], |section| {
            from_section::<PretrainedTokenizerConfig>("tokenizer", section)
                .map(TokenizerConfig::PretrainedTransformer)
        })
}

pub fn dataset_reader_registry() -> Registry<DatasetReaderConfig> {
    Registry::new("dataset_reader").register(
        "contrastive",
        &["min_span_len", "max_span_len", "tokenizer"],
        |section| {
            let raw: RawDatasetReader = from_section("dataset_reader", section)?;
            SpanSampler::new(raw.sampler.clone())
                .map_err(|e| ConfigError::invalid_parameter(e.to_string()))?;
            Ok(DatasetReaderConfig {
                sampler: raw.sampler,
                tokenizer: tokenizer_registry().build(&raw.tokenizer)?,
                max_instances: raw.max_instances,
            })
        },
    )
}

pub fn loss_registry() -> Registry<LossConfig> {
    Registry::new("loss").register("nt_xent", &[], |section| {
        let loss: LossConfig =
            serde_json::from_value(section.clone()).map_err(|e| ConfigError::parse("loss", e))?;
        loss.init()
            .map_err(|e| ConfigError::invalid_parameter(e.to_string()))?;
        Ok(loss)
    })
}

pub fn model_registry() -> Registry<ModelConfig> {
    Registry::new("model").register("contrastive_text_encoder", &["loss"], |section| {
        let raw: RawModel = from_section("model", section)?;
        if raw.masked_language_modeling && !(raw.mlm_probability > 0.0 && raw.mlm_probability < 1.0)
        {
            return Err(ConfigError::invalid_parameter(format!(
                "model.mlm_probability must be in (0, 1), got {}",
                raw.mlm_probability
            )));
        }
        Ok(ModelConfig {
            encoder: raw.encoder,
            loss: loss_registry().build(&raw.loss)?,
            masked_language_modeling: raw.masked_language_modeling,
            mlm_probability: raw.mlm_probability,
        })
    })
}

pub fn optimizer_registry() -> Registry<OptimizerConfig> {
    fn adamw(section: &Value) -> Result<OptimizerConfig, ConfigError> {
        let config: OptimizerConfig = from_section("optimizer", section)?;
        config.validate()?;
        Ok(config)
    }
    Registry::new("optimizer")
        .register("adamw", &["lr"], adamw)
        .register("huggingface_adamw", &["lr"], adamw)
}

pub fn scheduler_registry() -> Registry<LearningRateScheduler> {
    fn validated(
        scheduler: LearningRateScheduler,
    ) -> Result<LearningRateScheduler, ConfigError> {
        scheduler.validate()?;
        Ok(scheduler)
    }
    Registry::new("learning_rate_scheduler")
        .register("constant", &[], |_| Ok(LearningRateScheduler::Constant))
        .register("linear_with_warmup", &["warmup_steps"], |section| {
            let p: WarmupParams = from_section("learning_rate_scheduler", section)?;
            validated(LearningRateScheduler::LinearWithWarmup {
                warmup_steps: p.warmup_steps,
            })
        })
        .register("slanted_triangular", &[], |section| {
            let p: SlantedTriangularParams = from_section("learning_rate_scheduler", section)?;
            validated(LearningRateScheduler::SlantedTriangular {
                cut_frac: p.cut_frac,
                ratio: p.ratio,
            })
        })
        .register("cosine", &[], |section| {
            let p: WarmupParams = from_section("learning_rate_scheduler", section)?;
            validated(LearningRateScheduler::Cosine {
                warmup_steps: p.warmup_steps,
                min_lr_ratio: p.min_lr_ratio,
            })
        })
}

/// Parse the `--overrides` argument. An empty string means no overrides.
pub fn parse_overrides(raw: &str) -> Result<Value, ConfigError> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| ConfigError::InvalidOverrides(format!("{raw} ({e})")))?;
    if !value.is_object() {
        return Err(ConfigError::InvalidOverrides(value.to_string()));
    }
    Ok(value)
}

/// Deep-merge `overrides` into `base`.
///
/// Keys may be dotted paths (`"trainer.optimizer.lr"`); objects merge recursively, anything
/// else replaces the value at that path.
pub fn merge_overrides(base: &mut Value, overrides: &Value) -> Result<(), ConfigError> {
    let entries = overrides
        .as_object()
        .ok_or_else(|| ConfigError::InvalidOverrides(overrides.to_string()))?;

    for (key, value) in entries {
        let mut target = &mut *base;
        let mut parts = key.split('.').peekable();
        while let Some(part) = parts.next() {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            let Value::Object(map) = target else {
                unreachable!("target was just made an object")
            };
            if parts.peek().is_none() {
                match map.get_mut(part) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_overrides(existing, value)?;
                    }
                    _ => {
                        map.insert(part.to_string(), value.clone());
                    }
                }
                break;
            }
            target = map
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
    }
    Ok(())
}

/// Read a JSON config file and merge `overrides` into it, without validating
pub fn load_document<P: AsRef<Path>>(path: P, overrides: Option<&str>) -> anyhow::Result<Value> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let mut document: Value = serde_json::from_str(&text)
        .with_context(|| format!("Config {} is not valid JSON", path.display()))?;

    if let Some(raw) = overrides {
        merge_overrides(&mut document, &parse_overrides(raw)?)?;
    }
    Ok(document)
}

impl PretrainConfig {
    /// Load a configuration file, apply `overrides` and resolve the backbone from the process
    /// environment.
    pub fn load<P: AsRef<Path>>(path: P, overrides: Option<&str>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let document = load_document(path, overrides)?;
        let config = Self::from_document(document, |key| std::env::var(key).ok())
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Resolve and validate an already merged document. `env` looks up environment variables.
    pub fn from_document<F>(mut document: Value, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw: RawDocument = serde_json::from_value(document.clone())
            .map_err(|e| ConfigError::parse("config", e))?;

        let env_value = env(TRANSFORMER_MODEL_ENV);
        let transformer_model = resolve_transformer_model(
            raw.transformer_model.as_deref(),
            env_value.as_deref(),
            raw.transformer_model_precedence,
        );

        let mut dataset_reader_section = raw.dataset_reader;
        inject_transformer_model(&mut dataset_reader_section, transformer_model.as_ref())?;

        let vocabulary = vocabulary_registry().build(&raw.vocabulary)?;
        let dataset_reader = dataset_reader_registry().build(&dataset_reader_section)?;
        let model = model_registry().build(&raw.model)?;
        let trainer = parse_trainer(&raw.trainer)?;
        let data_loader = raw.data_loader;

        if data_loader.batch_size == 0 {
            return Err(ConfigError::invalid_parameter(
                "data_loader.batch_size must be at least 1",
            ));
        }
        if data_loader.num_workers == 0 {
            return Err(ConfigError::invalid_parameter(
                "data_loader.num_workers must be at least 1",
            ));
        }
        if model.encoder.n_heads == 0 || model.encoder.d_model % model.encoder.n_heads != 0 {
            return Err(ConfigError::invalid_parameter(format!(
                "model.d_model ({}) must be divisible by model.n_heads ({})",
                model.encoder.d_model, model.encoder.n_heads
            )));
        }
        let max_length = dataset_reader.tokenizer.max_length();
        if let Some(positions) = model.encoder.max_position_embeddings {
            if positions < max_length {
                return Err(ConfigError::invalid_parameter(format!(
                    "model.max_position_embeddings ({positions}) is smaller than tokenizer max_length ({max_length})"
                )));
            }
        }

        // Record what was actually used so the saved config reproduces this run
        if let (Value::Object(map), Some(resolved)) = (&mut document, &transformer_model) {
            map.insert("transformer_model".to_string(), Value::String(resolved.name.clone()));
            map.insert("dataset_reader".to_string(), dataset_reader_section);
        }

        let config = Self {
            train_data_path: raw.train_data_path,
            transformer_model,
            vocabulary,
            dataset_reader,
            model,
            data_loader,
            trainer,
            document,
        };

        if let TokenizerConfig::Whitespace(_) = config.dataset_reader.tokenizer {
            config.check_span_fit(WHITESPACE_SPECIAL_TOKENS)?;
        }

        Ok(config)
    }

    /// Check that a span of `max_span_len` tokens plus `num_special_tokens` fits in the
    /// tokenizer's `max_length`.
    pub fn check_span_fit(&self, num_special_tokens: usize) -> Result<(), ConfigError> {
        let max_span_len = self.dataset_reader.sampler.max_span_len;
        let max_length = self.dataset_reader.tokenizer.max_length();
        if max_span_len + num_special_tokens > max_length {
            return Err(ConfigError::SpanExceedsTokenizerLength {
                max_span_len,
                special_tokens: num_special_tokens,
                max_length,
            });
        }
        Ok(())
    }

    /// The merged document with resolved values filled in
    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Write the resolved document as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(&self.document)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write config {}", path.display()))
    }
}

/// Fill `tokenizer.model_name` of a pretrained tokenizer from the resolved backbone.
fn inject_transformer_model(
    dataset_reader: &mut Value,
    resolved: Option<&ResolvedTransformerModel>,
) -> Result<(), ConfigError> {
    let Some(tokenizer) = dataset_reader.get_mut("tokenizer") else {
        return Ok(());
    };
    if section_type(tokenizer) != Some("pretrained_transformer") {
        return Ok(());
    }

    let explicit = tokenizer
        .get("model_name")
        .and_then(Value::as_str)
        .map(str::to_string);

    match (explicit, resolved) {
        (Some(explicit), Some(resolved)) => {
            if explicit != resolved.name {
                tracing::warn!(
                    "dataset_reader.tokenizer.model_name '{}' differs from the resolved transformer_model '{}'; the tokenizer keeps its explicit model_name",
                    explicit,
                    resolved.name
                );
            }
        }
        (Some(_), None) => {}
        (None, Some(resolved)) => {
            if let Value::Object(map) = tokenizer {
                map.insert("model_name".to_string(), Value::String(resolved.name.clone()));
            }
        }
        (None, None) => {
            return Err(ConfigError::UnresolvedTransformerModel {
                env_var: TRANSFORMER_MODEL_ENV,
            })
        }
    }
    Ok(())
}

fn parse_trainer(section: &Value) -> Result<TrainerConfig, ConfigError> {
    let raw: RawTrainer =
        serde_json::from_value(section.clone()).map_err(|e| ConfigError::parse("trainer", e))?;

    if raw.num_epochs == 0 {
        return Err(ConfigError::invalid_parameter("trainer.num_epochs must be at least 1"));
    }
    if let Some(grad_norm) = raw.grad_norm {
        if !(grad_norm > 0.0) {
            return Err(ConfigError::invalid_parameter(format!(
                "trainer.grad_norm must be > 0, got {grad_norm}"
            )));
        }
    }

    let learning_rate_scheduler = match &raw.learning_rate_scheduler {
        Some(section) if !section.is_null() => scheduler_registry().build(section)?,
        _ => LearningRateScheduler::Constant,
    };

    Ok(TrainerConfig {
        num_epochs: raw.num_epochs,
        grad_norm: raw.grad_norm,
        seed: raw.seed,
        optimizer: optimizer_registry().build(&raw.optimizer)?,
        learning_rate_scheduler,
        num_serialized_models_to_keep: raw.checkpointer.num_serialized_models_to_keep,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::{SamplingStrategy, SpanLengthDistribution};
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn document() -> Value {
        json!({
            "transformer_model": "distilroberta-base",
            "vocabulary": {"type": "empty"},
            "train_data_path": null,
            "dataset_reader": {
                "type": "contrastive",
                "num_anchors": 2,
                "num_positives": 2,
                "max_span_len": 510,
                "min_span_len": 32,
                "tokenizer": {"type": "whitespace", "max_length": 512}
            },
            "model": {
                "type": "contrastive_text_encoder",
                "d_model": 64,
                "n_heads": 4,
                "loss": {"type": "nt_xent", "temperature": 0.05}
            },
            "data_loader": {"batch_size": 1, "num_workers": 1, "drop_last": true},
            "trainer": {
                "optimizer": {
                    "type": "huggingface_adamw",
                    "lr": 5e-5,
                    "eps": 1e-6,
                    "weight_decay": 0.1,
                    "parameter_groups": [[["bias", "LayerNorm\\.weight"], {"weight_decay": 0}]]
                },
                "num_epochs": 1,
                "checkpointer": {"num_serialized_models_to_keep": 1},
                "grad_norm": 1.0,
                "learning_rate_scheduler": {"type": "slanted_triangular"}
            }
        })
    }

    #[test]
    fn test_full_document() {
        let config = PretrainConfig::from_document(document(), no_env).unwrap();

        assert_eq!(config.vocabulary, VocabularyConfig::Empty);
        let sampler = &config.dataset_reader.sampler;
        assert_eq!((sampler.num_anchors, sampler.num_positives), (2, 2));
        assert_eq!((sampler.min_span_len, sampler.max_span_len), (32, 510));
        assert_eq!(sampler.sampling_strategy, SamplingStrategy::Overlapping);
        assert_eq!(sampler.span_length_distribution, SpanLengthDistribution::Uniform);
        assert_eq!(config.dataset_reader.tokenizer.max_length(), 512);
        assert_eq!(config.model.loss, LossConfig::NtXent { temperature: 0.05 });
        assert_eq!(config.model.encoder.d_model, 64);
        assert_eq!(config.data_loader, DataLoaderConfig::default());
        assert_eq!(config.trainer.optimizer.lr, 5e-5);
        assert_eq!(config.trainer.optimizer.parameter_groups[0].1.weight_decay, Some(0.0));
        assert_eq!(config.trainer.grad_norm, Some(1.0));
        assert_eq!(config.trainer.num_serialized_models_to_keep, 1);
        assert_eq!(
            config.trainer.learning_rate_scheduler,
            LearningRateScheduler::slanted_triangular()
        );
        assert_eq!(
            config.transformer_model.unwrap().source,
            TransformerModelSource::Config
        );
    }

    #[test]
    fn test_overrides_set_train_data_path() {
        let mut doc = document();
        let overrides = parse_overrides(r#"{"train_data_path": "data/wiki.txt"}"#).unwrap();
        merge_overrides(&mut doc, &overrides).unwrap();

        let config = PretrainConfig::from_document(doc, no_env).unwrap();
        assert_eq!(config.train_data_path, Some(PathBuf::from("data/wiki.txt")));
    }

    #[test]
    fn test_dotted_and_nested_overrides() {
        let mut doc = document();
        let overrides = parse_overrides(
            r#"{
                "trainer.num_epochs": 3,
                "dataset_reader": {"tokenizer": {"max_length": 600}},
                "data_loader.batch_size": 4
            }"#,
        )
        .unwrap();
        merge_overrides(&mut doc, &overrides).unwrap();

        assert_eq!(doc["trainer"]["num_epochs"], json!(3));
        // Nested merge keeps sibling keys
        assert_eq!(doc["dataset_reader"]["tokenizer"]["type"], json!("whitespace"));
        assert_eq!(doc["dataset_reader"]["tokenizer"]["max_length"], json!(600));
        assert_eq!(doc["dataset_reader"]["min_span_len"], json!(32));
        assert_eq!(doc["data_loader"]["batch_size"], json!(4));
        assert_eq!(doc["data_loader"]["drop_last"], json!(true));
    }

    #[test]
    fn test_invalid_overrides() {
        assert!(matches!(
            parse_overrides("[1, 2]"),
            Err(ConfigError::InvalidOverrides(_))
        ));
        assert!(matches!(
            parse_overrides("{not json"),
            Err(ConfigError::InvalidOverrides(_))
        ));
        assert_eq!(parse_overrides("  ").unwrap(), json!({}));
    }

    #[test]
    fn test_precedence_environment_wins_by_default() {
        let resolved = resolve_transformer_model(
            Some("distilroberta-base"),
            Some("roberta-large"),
            TransformerModelPrecedence::Environment,
        )
        .unwrap();
        assert_eq!(resolved.name, "roberta-large");
        assert_eq!(resolved.source, TransformerModelSource::Environment);
    }

    #[test]
    fn test_precedence_config_wins_when_requested() {
        let resolved = resolve_transformer_model(
            Some("distilroberta-base"),
            Some("roberta-large"),
            TransformerModelPrecedence::Config,
        )
        .unwrap();
        assert_eq!(resolved.name, "distilroberta-base");
        assert_eq!(resolved.source, TransformerModelSource::Config);
    }

    #[test]
    fn test_single_source_and_empty_values() {
        let env_only =
            resolve_transformer_model(None, Some("bert"), TransformerModelPrecedence::Config)
                .unwrap();
        assert_eq!(env_only.source, TransformerModelSource::Environment);

        let config_only = resolve_transformer_model(
            Some("bert"),
            Some(""),
            TransformerModelPrecedence::Environment,
        )
        .unwrap();
        assert_eq!(config_only.source, TransformerModelSource::Config);

        assert!(resolve_transformer_model(Some(" "), None, TransformerModelPrecedence::Environment)
            .is_none());
    }

    #[test]
    fn test_environment_fills_pretrained_tokenizer() {
        let mut doc = document();
        doc["dataset_reader"]["tokenizer"] =
            json!({"type": "pretrained_transformer", "max_length": 512});
        let config = PretrainConfig::from_document(doc, |key| {
            (key == TRANSFORMER_MODEL_ENV).then(|| "models/roberta".to_string())
        })
        .unwrap();

        match &config.dataset_reader.tokenizer {
            TokenizerConfig::PretrainedTransformer(t) => assert_eq!(t.model_name, "models/roberta"),
            other => panic!("unexpected tokenizer {other:?}"),
        }
        // The saved document records the resolved value
        assert_eq!(config.document()["transformer_model"], json!("models/roberta"));
        assert_eq!(
            config.document()["dataset_reader"]["tokenizer"]["model_name"],
            json!("models/roberta")
        );
    }

    #[test]
    fn test_unresolved_transformer_model() {
        let mut doc = document();
        doc.as_object_mut().unwrap().remove("transformer_model");
        doc["dataset_reader"]["tokenizer"] = json!({"type": "pretrained_transformer"});
        let err = PretrainConfig::from_document(doc, no_env).unwrap_err();
        assert!(matches!(err, ConfigError::UnresolvedTransformerModel { .. }));
    }

    #[test]
    fn test_span_overflow_is_config_error() {
        let mut doc = document();
        doc["dataset_reader"]["max_span_len"] = json!(512);
        let err = PretrainConfig::from_document(doc, no_env).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::SpanExceedsTokenizerLength {
                max_span_len: 512,
                special_tokens: 2,
                max_length: 512
            }
        ));

        let config = PretrainConfig::from_document(document(), no_env).unwrap();
        assert!(config.check_span_fit(2).is_ok());
        assert!(config.check_span_fit(3).is_err());
    }

    #[test]
    fn test_unknown_loss_and_missing_parameters() {
        let mut doc = document();
        doc["model"]["loss"] = json!({"type": "triplet_margin"});
        let err = PretrainConfig::from_document(doc, no_env).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownType { kind: "loss", .. }));

        let mut doc = document();
        doc["trainer"]["optimizer"].as_object_mut().unwrap().remove("lr");
        let err = PretrainConfig::from_document(doc, no_env).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingParameter {
                kind: "optimizer",
                parameter: "lr",
                ..
            }
        ));

        let mut doc = document();
        doc["dataset_reader"].as_object_mut().unwrap().remove("min_span_len");
        let err = PretrainConfig::from_document(doc, no_env).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingParameter {
                parameter: "min_span_len",
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut doc = document();
        doc["model"]["loss"]["temperature"] = json!(0.0);
        assert!(matches!(
            PretrainConfig::from_document(doc, no_env),
            Err(ConfigError::InvalidParameter { .. })
        ));

        let mut doc = document();
        doc["data_loader"]["batch_size"] = json!(0);
        assert!(PretrainConfig::from_document(doc, no_env).is_err());

        let mut doc = document();
        doc["model"]["n_heads"] = json!(5);
        assert!(PretrainConfig::from_document(doc, no_env).is_err());
    }

    #[test]
    fn test_masked_language_modeling_flag() {
        let config = PretrainConfig::from_document(document(), no_env).unwrap();
        assert!(!config.model.masked_language_modeling);
        assert_eq!(config.model.mlm_probability, DEFAULT_MLM_PROBABILITY);

        let mut doc = document();
        doc["model"]["masked_language_modeling"] = json!(true);
        doc["model"]["mlm_probability"] = json!(0.2);
        let config = PretrainConfig::from_document(doc, no_env).unwrap();
        assert!(config.model.masked_language_modeling);
        assert_eq!(config.model.mlm_probability, 0.2);

        let tokenizer = SpanTokenizer::whitespace(WhitespaceTokenizerConfig::default());
        let encoder = config.model.encoder_config(&tokenizer);
        assert!(encoder.masked_language_modeling);
        assert_eq!(encoder.vocab_size, tokenizer.vocab_size());

        let mut doc = document();
        doc["model"]["masked_language_modeling"] = json!(true);
        doc["model"]["mlm_probability"] = json!(1.5);
        assert!(matches!(
            PretrainConfig::from_document(doc, no_env),
            Err(ConfigError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_scheduler_defaults_to_constant() {
        let mut doc = document();
        doc["trainer"].as_object_mut().unwrap().remove("learning_rate_scheduler");
        let config = PretrainConfig::from_document(doc, no_env).unwrap();
        assert_eq!(config.trainer.learning_rate_scheduler, LearningRateScheduler::Constant);
    }

    #[test]
    fn test_load_and_save_round_trip() -> anyhow::Result<()> {
        let mut file = NamedTempFile::new()?;
        write!(file, "{}", document())?;
        file.flush()?;

        let config = PretrainConfig::load(file.path(), Some(r#"{"trainer.seed": 7}"#))?;
        assert_eq!(config.trainer.seed, 7);

        let saved = NamedTempFile::new()?;
        config.save(saved.path())?;
        let text = std::fs::read_to_string(saved.path())?;
        let reloaded: Value = serde_json::from_str(&text)?;
        assert_eq!(reloaded["trainer"]["seed"], json!(7));
        Ok(())
    }
}
