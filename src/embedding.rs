use crate::batcher::TokenBatch;
use crate::checkpoint::CheckpointManager;
use crate::config::{load_document, PretrainConfig};
use crate::model::ContrastiveEncoder;
use crate::tokenizer::SpanTokenizer;
use crate::training::CONFIG_FILE;
use anyhow::{anyhow, bail, Result};
use burn::prelude::*;
use std::path::Path;

/// Trained encoder restored from a serialization directory, ready to embed text.
pub struct SpanEmbedder<B: Backend> {
    model: ContrastiveEncoder<B>,
    tokenizer: SpanTokenizer,
    device: B::Device,
}

impl<B: Backend> SpanEmbedder<B> {
    /// Load `model_epoch_{epoch}` from `dir`, using the last completed epoch when `epoch` is
    /// `None`. The architecture comes from the `config.json` saved next to the checkpoints.
    pub fn from_serialization_dir<P: AsRef<Path>>(
        dir: P,
        epoch: Option<usize>,
        device: B::Device,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            bail!("Serialization directory {} does not exist", dir.display());
        }

        // The saved document already records the resolved backbone
        let document = load_document(dir.join(CONFIG_FILE), None)?;
        let config = PretrainConfig::from_document(document, |_| None)?;
        let tokenizer = config.dataset_reader.tokenizer.init()?;
        let encoder_config = config.model.encoder_config(&tokenizer);

        let checkpoints = CheckpointManager::new(dir, 0)?;
        let epoch = match epoch {
            Some(epoch) => epoch,
            None => checkpoints.load_state()?.epoch,
        };
        eprintln!("📂 Loading model from: {}", checkpoints.model_stem(epoch).display());

        let model = checkpoints.load_model(
            ContrastiveEncoder::new(&encoder_config, &device),
            epoch,
            &device,
        )?;
        tracing::info!(
            "Loaded epoch {} encoder ({} parameters)",
            epoch,
            model.num_params()
        );

        Ok(Self {
            model,
            tokenizer,
            device,
        })
    }

    /// One embedding per text.
    ///
    /// Texts longer than the tokenizer's `max_length` are truncated. `projected` selects the
    /// output of the projection head instead of the pooled encoder states.
    pub fn embed_texts<S: AsRef<str>>(
        &self,
        texts: &[S],
        projected: bool,
    ) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let max_content = self
            .tokenizer
            .max_length()
            .saturating_sub(self.tokenizer.num_special_tokens());

        let mut sequences = Vec::with_capacity(texts.len());
        for text in texts {
            let mut ids = self.tokenizer.tokenize(text.as_ref())?;
            if ids.len() > max_content {
                tracing::debug!("Truncating {} tokens to {}", ids.len(), max_content);
                ids.truncate(max_content);
            }
            sequences.push(self.tokenizer.wrap(&ids));
        }

        let batch =
            TokenBatch::<B>::from_sequences(&sequences, self.tokenizer.pad_id(), &self.device);
        let embeddings = if projected {
            self.model.encode(batch.token_ids, batch.attention_mask)
        } else {
            self.model.embed(batch.token_ids, batch.attention_mask)
        };

        let [_, dim] = embeddings.dims();
        let values = embeddings
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow!("Cannot read embeddings: {:?}", e))?;
        Ok(values.chunks(dim).map(<[f32]>::to_vec).collect())
    }
}
