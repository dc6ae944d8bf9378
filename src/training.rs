use crate::batcher::{ContrastiveBatch, ContrastiveBatcher};
use crate::checkpoint::{CheckpointManager, TrainingState};
use crate::config::PretrainConfig;
use crate::data::{
    batch_plan, epoch_indices, ContrastiveDataset, ContrastiveItem, EpochSubset, TokenizedCorpus,
};
use crate::error::LossError;
use crate::losses::{masked_lm_loss, NtXentLoss};
use crate::masking::TokenMasker;
use crate::metrics::{EpochMetrics, LossTracker, MetricsLogger};
use crate::model::ContrastiveEncoder;
use crate::sampler::SpanSampler;
use crate::summary::print_training_summary;
use anyhow::{bail, Context, Result};
use burn::data::dataloader::DataLoaderBuilder;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub type WgpuAutodiffBackend = burn::backend::Autodiff<burn::backend::Wgpu>;
pub type CpuAutodiffBackend = burn::backend::Autodiff<burn::backend::NdArray>;

pub const CONFIG_FILE: &str = "config.json";

/// Compute device for training
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DeviceKind {
    #[default]
    Wgpu,
    Cpu,
}

/// Run options that come from the command line rather than the config document
#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub serialization_dir: PathBuf,
    pub device: DeviceKind,
    /// Overrides `trainer.seed`
    pub seed: Option<u64>,
    /// Set to request a graceful stop after the current batch
    pub interrupt: Arc<AtomicBool>,
}

impl TrainOptions {
    pub fn new<P: Into<PathBuf>>(serialization_dir: P) -> Self {
        Self {
            serialization_dir: serialization_dir.into(),
            device: DeviceKind::default(),
            seed: None,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// What a finished (or interrupted) run produced
#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub history: Vec<EpochMetrics>,
    pub global_step: usize,
    pub interrupted: bool,
}

/// Remove previous artifacts and start from an empty serialization directory
pub fn create_serialization_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)
            .with_context(|| format!("Failed to clear {}", dir.display()))?;
    }
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))
}

/// NT-Xent loss of one batch: anchors against the mean of their positives' embeddings.
///
/// When the batch carries anchor labels and the model has a prediction head, the masked-LM
/// loss on the anchors is added.
pub fn batch_loss<B: Backend>(
    model: &ContrastiveEncoder<B>,
    loss: &NtXentLoss,
    batch: ContrastiveBatch<B>,
) -> Result<Tensor<B, 1>, LossError> {
    let num_positives = batch.num_positives;
    let anchor_mask = batch.anchors.attention_mask.float();
    let hidden = model.forward(batch.anchors.token_ids, anchor_mask.clone());
    let mlm_loss = batch.anchor_labels.and_then(|labels| {
        model
            .mlm_logits(hidden.clone())
            .map(|logits| masked_lm_loss(logits, labels))
    });
    let anchors = model.project(model.pool(hidden, anchor_mask));
    let positives = model.encode(batch.positives.token_ids, batch.positives.attention_mask);

    let [num_anchors, dim] = anchors.dims();
    let [num_positive_rows, _] = positives.dims();
    if num_positives == 0 || num_positive_rows != num_anchors * num_positives {
        return Err(LossError::PairCountMismatch {
            anchors: num_anchors,
            positives: num_positive_rows,
        });
    }

    let pooled = positives
        .reshape([num_anchors, num_positives, dim])
        .mean_dim(1)
        .reshape([num_anchors, dim]);
    let contrastive = loss.forward_pairs(anchors, pooled)?;
    Ok(match mlm_loss {
        Some(mlm_loss) => contrastive + mlm_loss,
        None => contrastive,
    })
}

/// Train on the device selected in `options`
pub fn train(config: &PretrainConfig, options: &TrainOptions) -> Result<TrainOutcome> {
    match options.device {
        DeviceKind::Wgpu => {
            let device = burn::backend::wgpu::WgpuDevice::default();
            tracing::info!("Using WGPU device: {:?}", device);
            train_on::<WgpuAutodiffBackend>(config, options, device)
        }
        DeviceKind::Cpu => {
            tracing::info!("Using NdArray CPU backend");
            train_on::<CpuAutodiffBackend>(config, options, Default::default())
        }
    }
}

/// Full training run on backend `B`.
///
/// Validates the tokenizer, span lengths and corpus, then clears the serialization directory,
/// writes the resolved config and runs `trainer.num_epochs` epochs, checkpointing after each.
pub fn train_on<B: AutodiffBackend>(
    config: &PretrainConfig,
    options: &TrainOptions,
    device: B::Device,
) -> Result<TrainOutcome> {
    let dir = options.serialization_dir.as_path();
    let train_data_path = config
        .train_data_path
        .as_ref()
        .context("train_data_path is not set; add it to the config or pass it in --overrides")?;

    let seed = options.seed.unwrap_or(config.trainer.seed);
    B::seed(seed);

    let reader = &config.dataset_reader;
    let tokenizer = reader.tokenizer.init()?;
    config.check_span_fit(tokenizer.num_special_tokens())?;
    let sampler = SpanSampler::new(reader.sampler.clone())?;
    let masker = if config.model.masked_language_modeling {
        Some(TokenMasker::new(config.model.mlm_probability, &tokenizer)?)
    } else {
        None
    };

    let corpus = TokenizedCorpus::from_file(
        train_data_path,
        &tokenizer,
        reader.sampler.min_span_len,
        reader.max_instances,
    )?;
    corpus.stats.print();

    let loader_config = &config.data_loader;
    let (num_batches, items_used) =
        batch_plan(corpus.len(), loader_config.batch_size, loader_config.drop_last);
    if num_batches == 0 {
        bail!(
            "{} usable documents in {} do not fill a single batch of {}",
            corpus.len(),
            train_data_path.display(),
            loader_config.batch_size
        );
    }
    if items_used < corpus.len() {
        tracing::info!(
            "drop_last: using {} of {} documents per epoch",
            items_used,
            corpus.len()
        );
    }

    create_serialization_dir(dir)?;
    config.save(dir.join(CONFIG_FILE))?;

    let pad_id = tokenizer.pad_id();
    let encoder_config = config.model.encoder_config(&tokenizer);
    let anchors_per_batch = loader_config.batch_size * reader.sampler.num_anchors;
    let num_documents = corpus.len();

    let mut dataset = ContrastiveDataset::new(corpus, sampler, tokenizer, seed);
    if let Some(masker) = masker {
        dataset = dataset.with_masking(masker);
    }
    let epoch_handle = dataset.epoch_handle();
    let dataset = Arc::new(dataset);

    let mut model: ContrastiveEncoder<B> = ContrastiveEncoder::new(&encoder_config, &device);
    tracing::info!(
        "Encoder ready: {} layers, d_model={}, {} parameters",
        encoder_config.n_layers,
        encoder_config.d_model,
        model.num_params()
    );

    let trainer = &config.trainer;
    let mut optimizer = trainer
        .optimizer
        .init::<B, ContrastiveEncoder<B>>(&model.named_parameters(), trainer.grad_norm)?;
    let loss_fn = config.model.loss.init()?;
    let scheduler = &trainer.learning_rate_scheduler;
    let base_lr = trainer.optimizer.lr;
    let total_steps = num_batches * trainer.num_epochs;

    let mut checkpoints = CheckpointManager::new(dir, trainer.num_serialized_models_to_keep)?;
    let metrics_logger = MetricsLogger::new(dir)?;

    println!("\n🔥 Starting Contrastive Pretraining");
    println!("==========================================");
    println!("📊 Batches per epoch: {}", num_batches);
    println!("🔄 Epochs: {}", trainer.num_epochs);
    println!(
        "📦 Batch Size: {} documents ({} anchors)",
        loader_config.batch_size, anchors_per_batch
    );
    println!("🎯 Learning Rate: {} ({:?})", base_lr, scheduler);
    println!("🌡️  Temperature: {}", loss_fn.temperature());
    if config.model.masked_language_modeling {
        println!("🎭 Masked LM: p={}", config.model.mlm_probability);
    }
    println!("💾 Serialization dir: {}", dir.display());
    println!();

    let mut history = Vec::new();
    let mut global_step = 0;
    let mut learning_rate = base_lr;
    let mut interrupted = false;

    for epoch in 1..=trainer.num_epochs {
        epoch_handle.set(epoch - 1);
        let indices = epoch_indices(
            num_documents,
            items_used,
            loader_config.shuffle,
            seed,
            epoch - 1,
        );
        let loader = DataLoaderBuilder::<B, ContrastiveItem, ContrastiveBatch<B>>::new(
            ContrastiveBatcher::new(pad_id),
        )
        .batch_size(loader_config.batch_size)
        .num_workers(loader_config.num_workers)
        .set_device(device.clone())
        .build(EpochSubset::new(Arc::clone(&dataset), indices));
        let started = Instant::now();
        let mut tracker = LossTracker::default();

        let progress_bar = ProgressBar::new(num_batches as u64);
        if let Ok(style) = ProgressStyle::with_template(
            "🏋️ Epoch {prefix} [{bar:40.cyan/blue}] {pos}/{len} batches | {msg}",
        ) {
            progress_bar.set_style(style.progress_chars("#>-"));
        }
        progress_bar.set_prefix(format!("{epoch}/{}", trainer.num_epochs));

        for batch in loader.iter() {
            learning_rate = scheduler.get_learning_rate(global_step, base_lr, total_steps);

            let loss = batch_loss(&model, &loss_fn, batch)?;
            let loss_value: f64 = loss.clone().into_scalar().elem::<f64>();
            if !loss_value.is_finite() {
                progress_bar.abandon();
                bail!(
                    "Loss became {} at epoch {}, step {}",
                    loss_value,
                    epoch,
                    global_step + 1
                );
            }

            let grads = loss.backward();
            model = optimizer.step(learning_rate, model, grads);

            global_step += 1;
            tracker.update(loss_value);
            progress_bar.set_message(format!(
                "loss {:.4} | lr {:.2e}",
                tracker.mean(),
                learning_rate
            ));
            progress_bar.inc(1);
            tracing::debug!("step {} loss {:.5}", global_step, loss_value);

            if options.interrupt.load(Ordering::SeqCst) {
                interrupted = true;
                break;
            }
        }
        progress_bar.finish_and_clear();

        if tracker.count() == 0 {
            tracing::warn!("Epoch {} produced no batches", epoch);
            break;
        }

        let metrics = tracker.finish(epoch, learning_rate, started.elapsed().as_secs_f64());
        println!(
            "Epoch {:>3}/{} | loss={:.4} | lr={:.2e} | {:.1}s",
            epoch, trainer.num_epochs, metrics.train_loss, learning_rate, metrics.elapsed_secs
        );
        metrics_logger.log(&metrics)?;
        checkpoints.save_model(
            &model,
            &TrainingState {
                epoch,
                global_step,
                learning_rate,
                train_loss: metrics.train_loss,
                interrupted,
            },
        )?;
        history.push(metrics);

        if interrupted {
            tracing::warn!("Stopping after epoch {} on interrupt", epoch);
            break;
        }
    }

    println!("\n✅ Training Complete!");
    print_training_summary(&history, 2 * anchors_per_batch, interrupted);
    println!("💾 Checkpoints in: {}", dir.display());

    Ok(TrainOutcome {
        history,
        global_step,
        interrupted,
    })
}
