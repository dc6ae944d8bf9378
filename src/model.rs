use burn::module::{list_param_ids, ParamId};
use burn::nn::{
    Dropout, DropoutConfig, Embedding, EmbeddingConfig, Initializer, LayerNorm, LayerNormConfig,
    Linear, LinearConfig,
};
use burn::prelude::*;
use burn::tensor::activation;
use serde::{Deserialize, Serialize};

/// Configuration for the span encoder
#[derive(Config, Debug)]
pub struct EncoderConfig {
    pub vocab_size: usize,
    pub max_position_embeddings: usize,
    #[config(default = 256)]
    pub d_model: usize,
    #[config(default = 4)]
    pub n_heads: usize,
    #[config(default = 4)]
    pub n_layers: usize,
    #[config(default = 1024)]
    pub d_ff: usize,
    #[config(default = 0.1)]
    pub dropout: f64,
    /// Optional projection head applied after pooling
    pub projection_dim: Option<usize>,
    /// Adds a token prediction head over the vocabulary
    #[config(default = false)]
    pub masked_language_modeling: bool,
}

fn default_d_model() -> usize {
    256
}
fn default_n_heads() -> usize {
    4
}
fn default_n_layers() -> usize {
    4
}
fn default_d_ff() -> usize {
    1024
}
fn default_dropout() -> f64 {
    0.1
}

/// Encoder hyper-parameters as written in the model section.
///
/// The vocabulary size comes from the tokenizer and the position table defaults to the
/// tokenizer's `max_length`, so neither has to be repeated here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderSettings {
    #[serde(default = "default_d_model")]
    pub d_model: usize,
    #[serde(default = "default_n_heads")]
    pub n_heads: usize,
    #[serde(default = "default_n_layers")]
    pub n_layers: usize,
    #[serde(default = "default_d_ff")]
    pub d_ff: usize,
    #[serde(default = "default_dropout")]
    pub dropout: f64,
    #[serde(default)]
    pub max_position_embeddings: Option<usize>,
    #[serde(default)]
    pub projection_dim: Option<usize>,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            d_model: default_d_model(),
            n_heads: default_n_heads(),
            n_layers: default_n_layers(),
            d_ff: default_d_ff(),
            dropout: default_dropout(),
            max_position_embeddings: None,
            projection_dim: None,
        }
    }
}

impl EncoderSettings {
    pub fn to_config(&self, vocab_size: usize, max_length: usize) -> EncoderConfig {
        EncoderConfig::new(
            vocab_size,
            self.max_position_embeddings.unwrap_or(max_length),
        )
        .with_d_model(self.d_model)
        .with_n_heads(self.n_heads)
        .with_n_layers(self.n_layers)
        .with_d_ff(self.d_ff)
        .with_dropout(self.dropout)
        .with_projection_dim(self.projection_dim)
    }
}

fn normal(std: f64) -> Initializer {
    Initializer::Normal { mean: 0.0, std }
}

fn linear<B: Backend>(d_in: usize, d_out: usize, device: &B::Device) -> Linear<B> {
    LinearConfig::new(d_in, d_out)
        .with_initializer(normal(0.02))
        .init(device)
}

/// Append `weight`/`bias` style names for the parameters of one leaf module
fn push_named<B: Backend, M: Module<B>>(
    out: &mut Vec<(String, ParamId)>,
    prefix: &str,
    module: &M,
) {
    for (id, leaf) in list_param_ids(module).into_iter().zip(["weight", "bias"]) {
        out.push((format!("{prefix}.{leaf}"), id));
    }
}

/// Multi-head self attention with a padding mask
#[derive(Module, Debug)]
pub struct SelfAttention<B: Backend> {
    query: Linear<B>,
    key: Linear<B>,
    value: Linear<B>,
    output: Linear<B>,
    dropout: Dropout,
    n_heads: usize,
    d_head: usize,
}

impl<B: Backend> SelfAttention<B> {
    pub fn new(config: &EncoderConfig, device: &B::Device) -> Self {
        let d = config.d_model;
        Self {
            query: linear(d, d, device),
            key: linear(d, d, device),
            value: linear(d, d, device),
            output: linear(d, d, device),
            dropout: DropoutConfig::new(config.dropout).init(),
            n_heads: config.n_heads,
            d_head: d / config.n_heads,
        }
    }

    /// `x`: [batch, seq, d_model]; `mask_bias`: [batch, heads, seq, seq] additive bias
    pub fn forward(&self, x: Tensor<B, 3>, mask_bias: Tensor<B, 4>) -> Tensor<B, 3> {
        let [n, l, d] = x.dims();
        let heads = |t: Tensor<B, 3>| t.reshape([n, l, self.n_heads, self.d_head]).swap_dims(1, 2);

        let q = heads(self.query.forward(x.clone()));
        let k = heads(self.key.forward(x.clone()));
        let v = heads(self.value.forward(x));

        let scores = q
            .matmul(k.swap_dims(2, 3))
            .div_scalar((self.d_head as f32).sqrt())
            + mask_bias;
        let weights = self.dropout.forward(activation::softmax(scores, 3));

        let context = weights.matmul(v).swap_dims(1, 2).reshape([n, l, d]);
        self.output.forward(context)
    }

    fn named_parameters(&self, prefix: &str, out: &mut Vec<(String, ParamId)>) {
        push_named(out, &format!("{prefix}.query"), &self.query);
        push_named(out, &format!("{prefix}.key"), &self.key);
        push_named(out, &format!("{prefix}.value"), &self.value);
        push_named(out, &format!("{prefix}.output.dense"), &self.output);
    }
}

/// Feed-forward network used in encoder blocks
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    linear_1: Linear<B>,
    linear_2: Linear<B>,
    dropout: Dropout,
}

impl<B: Backend> Mlp<B> {
    pub fn new(config: &EncoderConfig, device: &B::Device) -> Self {
        Self {
            linear_1: linear(config.d_model, config.d_ff, device),
            linear_2: linear(config.d_ff, config.d_model, device),
            dropout: DropoutConfig::new(config.dropout).init(),
        }
    }

    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let x = self.linear_1.forward(x);
        let x = activation::gelu(x);
        let x = self.linear_2.forward(x);
        self.dropout.forward(x)
    }
}

/// Pre-norm encoder block: attention and feed-forward, each with a residual connection
#[derive(Module, Debug)]
pub struct EncoderBlock<B: Backend> {
    attention: SelfAttention<B>,
    mlp: Mlp<B>,
    norm_1: LayerNorm<B>,
    norm_2: LayerNorm<B>,
    dropout: Dropout,
}

impl<B: Backend> EncoderBlock<B> {
    pub fn new(config: &EncoderConfig, device: &B::Device) -> Self {
        Self {
            attention: SelfAttention::new(config, device),
            mlp: Mlp::new(config, device),
            norm_1: LayerNormConfig::new(config.d_model).init(device),
            norm_2: LayerNormConfig::new(config.d_model).init(device),
            dropout: DropoutConfig::new(config.dropout).init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>, mask_bias: Tensor<B, 4>) -> Tensor<B, 3> {
        let attended = self
            .attention
            .forward(self.norm_1.forward(x.clone()), mask_bias);
        let x = x + self.dropout.forward(attended);

        let fed_forward = self.mlp.forward(self.norm_2.forward(x.clone()));
        x + fed_forward
    }

    fn named_parameters(&self, prefix: &str, out: &mut Vec<(String, ParamId)>) {
        self.attention
            .named_parameters(&format!("{prefix}.attention"), out);
        push_named(out, &format!("{prefix}.attention.LayerNorm"), &self.norm_1);
        push_named(out, &format!("{prefix}.intermediate.dense"), &self.mlp.linear_1);
        push_named(out, &format!("{prefix}.output.dense"), &self.mlp.linear_2);
        push_named(out, &format!("{prefix}.output.LayerNorm"), &self.norm_2);
    }
}

/// Transformer encoder producing one embedding per span
#[derive(Module, Debug)]
pub struct ContrastiveEncoder<B: Backend> {
    token_embedding: Embedding<B>,
    position_embedding: Embedding<B>,
    blocks: Vec<EncoderBlock<B>>,
    ln_f: LayerNorm<B>,
    projection: Option<Linear<B>>,
    lm_head: Option<Linear<B>>,
    dropout: Dropout,
    n_heads: usize,
}

impl<B: Backend> ContrastiveEncoder<B> {
    pub fn new(config: &EncoderConfig, device: &B::Device) -> Self {
        let token_embedding = EmbeddingConfig::new(config.vocab_size, config.d_model)
            .with_initializer(normal(0.02))
            .init(device);
        let position_embedding =
            EmbeddingConfig::new(config.max_position_embeddings, config.d_model)
                .with_initializer(normal(0.01))
                .init(device);

        let blocks = (0..config.n_layers)
            .map(|_| EncoderBlock::new(config, device))
            .collect();

        Self {
            token_embedding,
            position_embedding,
            blocks,
            ln_f: LayerNormConfig::new(config.d_model).init(device),
            projection: config
                .projection_dim
                .map(|dim| linear(config.d_model, dim, device)),
            lm_head: config
                .masked_language_modeling
                .then(|| linear(config.d_model, config.vocab_size, device)),
            dropout: DropoutConfig::new(config.dropout).init(),
            n_heads: config.n_heads,
        }
    }

    /// Contextual token states, [batch, seq, d_model].
    ///
    /// `attention_mask` is 1.0 for real tokens and 0.0 for padding.
    pub fn forward(
        &self,
        token_ids: Tensor<B, 2, Int>,
        attention_mask: Tensor<B, 2>,
    ) -> Tensor<B, 3> {
        let [n, l] = token_ids.dims();
        let device = token_ids.device();

        let positions = Tensor::<B, 1, Int>::arange(0..l as i64, &device)
            .unsqueeze_dim::<2>(0)
            .repeat_dim(0, n);
        let mut x =
            self.token_embedding.forward(token_ids) + self.position_embedding.forward(positions);
        x = self.dropout.forward(x);

        // Padding keys get a large negative score before the softmax
        let mask_bias = attention_mask
            .sub_scalar(1.0)
            .mul_scalar(1e4)
            .reshape([n, 1, 1, l])
            .repeat_dim(1, self.n_heads)
            .repeat_dim(2, l);

        for block in &self.blocks {
            x = block.forward(x, mask_bias.clone());
        }

        self.ln_f.forward(x)
    }

    /// Masked mean over the sequence, [batch, d_model]
    pub fn pool(&self, hidden: Tensor<B, 3>, attention_mask: Tensor<B, 2>) -> Tensor<B, 2> {
        let [n, l, d] = hidden.dims();
        let mask = attention_mask.reshape([n, l, 1]).repeat_dim(2, d);

        let summed = (hidden * mask.clone()).sum_dim(1).reshape([n, d]);
        let counts = mask.sum_dim(1).reshape([n, d]).clamp_min(1e-9);
        summed / counts
    }

    /// Projection head if configured, identity otherwise
    pub fn project(&self, pooled: Tensor<B, 2>) -> Tensor<B, 2> {
        match &self.projection {
            Some(projection) => projection.forward(pooled),
            None => pooled,
        }
    }

    /// Pooled span embeddings before the projection head, [batch, d_model]
    pub fn embed(
        &self,
        token_ids: Tensor<B, 2, Int>,
        attention_mask: Tensor<B, 2, Int>,
    ) -> Tensor<B, 2> {
        let mask = attention_mask.float();
        let hidden = self.forward(token_ids, mask.clone());
        self.pool(hidden, mask)
    }

    /// Span embeddings fed to the contrastive loss, [batch, embedding_dim]
    pub fn encode(
        &self,
        token_ids: Tensor<B, 2, Int>,
        attention_mask: Tensor<B, 2, Int>,
    ) -> Tensor<B, 2> {
        self.project(self.embed(token_ids, attention_mask))
    }

    /// Vocabulary logits per token, [batch, seq, vocab]; `None` without a prediction head
    pub fn mlm_logits(&self, hidden: Tensor<B, 3>) -> Option<Tensor<B, 3>> {
        self.lm_head.as_ref().map(|head| head.forward(hidden))
    }

    /// Every trainable parameter with a dotted, layer-qualified name
    pub fn named_parameters(&self) -> Vec<(String, ParamId)> {
        let mut out = Vec::new();
        push_named(&mut out, "embeddings.word_embeddings", &self.token_embedding);
        push_named(&mut out, "embeddings.position_embeddings", &self.position_embedding);
        for (i, block) in self.blocks.iter().enumerate() {
            block.named_parameters(&format!("blocks.{i}"), &mut out);
        }
        push_named(&mut out, "LayerNorm", &self.ln_f);
        if let Some(projection) = &self.projection {
            push_named(&mut out, "projection", projection);
        }
        if let Some(lm_head) = &self.lm_head {
            push_named(&mut out, "lm_head.dense", lm_head);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::{ElementConversion, TensorData};

    type TestBackend = NdArray;

    fn small_config() -> EncoderConfig {
        EncoderConfig::new(50, 16)
            .with_d_model(8)
            .with_n_heads(2)
            .with_n_layers(2)
            .with_d_ff(16)
            .with_dropout(0.0)
    }

    fn ids(rows: Vec<i64>, shape: [usize; 2]) -> Tensor<TestBackend, 2, Int> {
        Tensor::from_data(TensorData::new(rows, shape), &Default::default())
    }

    #[test]
    fn test_forward_shapes() {
        let device = Default::default();
        let model = ContrastiveEncoder::<TestBackend>::new(&small_config(), &device);

        let token_ids = ids(vec![1, 5, 6, 2, 1, 7, 2, 0], [2, 4]);
        let mask = ids(vec![1, 1, 1, 1, 1, 1, 1, 0], [2, 4]);

        let hidden = model.forward(token_ids.clone(), mask.clone().float());
        assert_eq!(hidden.dims(), [2, 4, 8]);
        assert_eq!(model.encode(token_ids, mask).dims(), [2, 8]);
    }

    #[test]
    fn test_projection_head_changes_output_dim() {
        let device = Default::default();
        let config = small_config().with_projection_dim(Some(4));
        let model = ContrastiveEncoder::<TestBackend>::new(&config, &device);
        let token_ids = ids(vec![1, 5, 2], [1, 3]);
        let mask = ids(vec![1, 1, 1], [1, 3]);

        assert_eq!(model.encode(token_ids.clone(), mask.clone()).dims(), [1, 4]);
        assert_eq!(model.embed(token_ids, mask).dims(), [1, 8]);
    }

    #[test]
    fn test_mlm_head_predicts_over_vocabulary() {
        let device = Default::default();
        let plain = ContrastiveEncoder::<TestBackend>::new(&small_config(), &device);
        let config = small_config().with_masked_language_modeling(true);
        let model = ContrastiveEncoder::<TestBackend>::new(&config, &device);

        let hidden = model.forward(ids(vec![1, 5, 6, 2], [1, 4]), Tensor::ones([1, 4], &device));
        assert!(plain.mlm_logits(hidden.clone()).is_none());
        assert_eq!(model.mlm_logits(hidden).unwrap().dims(), [1, 4, 50]);

        let names: Vec<String> = model.named_parameters().into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&"lm_head.dense.weight".to_string()));
        assert_eq!(names.len(), list_param_ids(&model).len());
    }

    #[test]
    fn test_padding_does_not_change_embedding() {
        let device = Default::default();
        let model = ContrastiveEncoder::<TestBackend>::new(&small_config(), &device);

        let short = model.encode(ids(vec![1, 5, 6, 2], [1, 4]), ids(vec![1, 1, 1, 1], [1, 4]));
        let padded = model.encode(
            ids(vec![1, 5, 6, 2, 0, 0], [1, 6]),
            ids(vec![1, 1, 1, 1, 0, 0], [1, 6]),
        );

        let diff: f32 = (short - padded).abs().max().into_scalar().elem();
        assert!(diff < 1e-4, "padding leaked into the embedding: {diff}");
    }

    #[test]
    fn test_named_parameters_cover_model() {
        let device = Default::default();
        let model = ContrastiveEncoder::<TestBackend>::new(&small_config(), &device);
        let named = model.named_parameters();

        assert_eq!(named.len(), list_param_ids(&model).len());
        let names: Vec<&str> = named.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"embeddings.word_embeddings.weight"));
        assert!(names.contains(&"blocks.0.attention.query.bias"));
        assert!(names.contains(&"blocks.1.attention.LayerNorm.weight"));
        assert!(names.contains(&"blocks.1.output.LayerNorm.bias"));
        assert!(names.contains(&"LayerNorm.weight"));
    }

    #[test]
    fn test_settings_fill_vocab_and_positions() {
        let settings: EncoderSettings = serde_json::from_str(r#"{"d_model": 64}"#).unwrap();
        let config = settings.to_config(1000, 512);
        assert_eq!(config.vocab_size, 1000);
        assert_eq!(config.max_position_embeddings, 512);
        assert_eq!(config.d_model, 64);
        assert_eq!(config.n_heads, 4);
        assert_eq!(config.projection_dim, None);
    }
}
