#![recursion_limit = "256"]

use anyhow::{bail, Context, Result};
use burn::prelude::Backend;
use burn_contrastive_pretrain::config::{
    load_document, parse_overrides, PretrainConfig, TRANSFORMER_MODEL_ENV,
};
use burn_contrastive_pretrain::embedding::SpanEmbedder;
use burn_contrastive_pretrain::launcher::{submit, LaunchPlan, ResourceRequest};
use burn_contrastive_pretrain::preprocess::{preprocess, InputEncoding, PreprocessOptions};
use burn_contrastive_pretrain::sampler::SpanSampler;
use burn_contrastive_pretrain::training::{train, DeviceKind, TrainOptions};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::atomic::Ordering;

/// Contrastive span pretraining CLI
///
/// Trains a sentence encoder by pulling together spans sampled from the same document and
/// pushing apart spans from different documents (NT-Xent), using the Burn deep learning
/// framework.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train an encoder from a JSON configuration
    Train {
        /// Path to the configuration file
        config: PathBuf,

        /// Directory for checkpoints, metrics and the resolved config (cleared first)
        #[arg(short, long)]
        serialization_dir: PathBuf,

        /// JSON object merged into the configuration, e.g. '{"train_data_path": "train.txt"}'
        #[arg(short, long)]
        overrides: Option<String>,

        /// Compute device
        #[arg(long, value_enum, default_value_t = DeviceKind::Wgpu)]
        device: DeviceKind,

        /// Random seed (default: trainer.seed from the config)
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Render a SLURM job script for a training run and optionally submit it
    Launch {
        /// Path to the configuration file
        config: PathBuf,

        /// Serialization directory passed to the trainer
        #[arg(short, long)]
        serialization_dir: PathBuf,

        /// Training corpus, passed as the train_data_path override
        #[arg(short, long)]
        train_data_path: Option<PathBuf>,

        /// Additional JSON overrides
        #[arg(short, long)]
        overrides: Option<String>,

        /// Backbone exported as TRANSFORMER_MODEL in the job
        #[arg(long)]
        transformer_model: Option<String>,

        /// Job name
        #[arg(long, default_value = "contrastive-pretrain")]
        job_name: String,

        /// CPUs per task
        #[arg(long, default_value = "4")]
        cpus: usize,

        /// GPUs for the job
        #[arg(long, default_value = "1")]
        gpus: usize,

        /// Wall-clock limit (HH:MM:SS)
        #[arg(long, default_value = "01:00:00")]
        time: String,

        /// Memory request
        #[arg(long, default_value = "32G")]
        mem: String,

        /// Scheduler partition
        #[arg(long)]
        partition: Option<String>,

        /// Shell line run before training (repeatable), e.g. 'source activate declutr'
        #[arg(long = "activate")]
        activation: Vec<String>,

        /// Directory for the scheduler's stdout/stderr files
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Trainer executable used in the script
        #[arg(long, default_value = "contrastive-pretrain")]
        trainer: String,

        /// Where to write the job script
        #[arg(long, default_value = "pretrain.slurm")]
        script_out: PathBuf,

        /// Submit the script with sbatch after writing it
        #[arg(long)]
        submit: bool,
    },
    /// Clean a CSV corpus into one document per line
    Preprocess {
        /// Input CSV file
        #[arg(short, long)]
        input: PathBuf,

        /// Output text file
        #[arg(short, long)]
        output: PathBuf,

        /// Zero-based column holding the document text
        #[arg(long, default_value = "1")]
        column: usize,

        /// Treat the first row as data instead of a header
        #[arg(long)]
        no_headers: bool,

        /// Input text encoding
        #[arg(long, value_enum, default_value_t = InputEncoding::Utf8)]
        encoding: InputEncoding,

        /// Lowercase documents
        #[arg(long)]
        lowercase: bool,

        /// Keep only documents with at least this many tokens
        #[arg(long)]
        min_length: Option<usize>,

        /// Stop after this many documents
        #[arg(long)]
        max_instances: Option<usize>,

        /// tokenizer.json used to count tokens (default: whitespace)
        #[arg(long)]
        tokenizer: Option<PathBuf>,
    },
    /// Show the anchor and positive spans sampled from documents
    Sample {
        /// Path to the configuration file
        config: PathBuf,

        /// JSON overrides
        #[arg(short, long)]
        overrides: Option<String>,

        /// Document text
        #[arg(long, conflicts_with = "input")]
        text: Option<String>,

        /// Line-delimited corpus file
        #[arg(long)]
        input: Option<PathBuf>,

        /// Number of documents to sample from the input file
        #[arg(long, default_value = "1")]
        num_documents: usize,

        /// Random seed
        #[arg(long, default_value = "42")]
        seed: u64,
    },
    /// Embed texts with a trained checkpoint, printing one JSON object per line
    Embed {
        /// Serialization directory of a training run
        serialization_dir: PathBuf,

        /// Checkpoint epoch (default: the last completed epoch)
        #[arg(long)]
        epoch: Option<usize>,

        /// Text to embed (repeatable)
        #[arg(long)]
        text: Vec<String>,

        /// Line-delimited file of texts to embed
        #[arg(long)]
        input: Option<PathBuf>,

        /// Compute device
        #[arg(long, value_enum, default_value_t = DeviceKind::Wgpu)]
        device: DeviceKind,

        /// Output the projection head instead of the pooled encoder states
        #[arg(long)]
        projected: bool,
    },
}

fn run_train(
    config_path: &PathBuf,
    serialization_dir: &PathBuf,
    overrides: Option<&str>,
    device: DeviceKind,
    seed: Option<u64>,
) -> Result<()> {
    let config = PretrainConfig::load(config_path, overrides)?;
    if let Some(model) = &config.transformer_model {
        tracing::info!("Using transformer_model '{}' (from {:?})", model.name, model.source);
    }

    let mut options = TrainOptions::new(serialization_dir);
    options.device = device;
    options.seed = seed;

    let interrupt = options.interrupt.clone();
    ctrlc::set_handler(move || {
        println!("\n🛑 Graceful shutdown requested (Ctrl+C), stopping after this batch...");
        interrupt.store(true, Ordering::SeqCst);
    })
    .context("Error setting Ctrl-C handler")?;

    let outcome = train(&config, &options)?;
    if outcome.interrupted {
        println!("🛑 Stopped early after {} steps", outcome.global_step);
    } else {
        println!("\n🎉 Training completed in {} steps!", outcome.global_step);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_launch(
    config_path: PathBuf,
    serialization_dir: PathBuf,
    train_data_path: Option<PathBuf>,
    overrides: Option<String>,
    transformer_model: Option<String>,
    resources: ResourceRequest,
    activation: Vec<String>,
    log_dir: Option<PathBuf>,
    trainer: String,
    script_out: PathBuf,
    submit_job: bool,
) -> Result<()> {
    let mut plan = LaunchPlan::new(&config_path, serialization_dir);
    if let Some(raw) = overrides.as_deref() {
        if let Value::Object(map) = parse_overrides(raw)? {
            for (key, value) in map {
                plan = plan.with_override(&key, value);
            }
        }
    }
    if let Some(path) = train_data_path {
        plan = plan.with_train_data_path(path);
    }
    plan.resources = resources;
    plan.activation = activation;
    plan.log_dir = log_dir;
    plan.trainer = trainer;
    plan.transformer_model = transformer_model;

    // Validate the config the job will see before handing it to the scheduler
    let overrides_json = serde_json::to_string(&plan.overrides)?;
    let document = load_document(&config_path, Some(&overrides_json))?;
    let job_model = plan.transformer_model.clone();
    PretrainConfig::from_document(document, |key| {
        if key == TRANSFORMER_MODEL_ENV {
            job_model.clone().or_else(|| std::env::var(key).ok())
        } else {
            std::env::var(key).ok()
        }
    })
    .with_context(|| format!("Invalid config {}", config_path.display()))?;

    let script = plan.write(&script_out)?;
    println!("📝 Job script written to {}", script_out.display());
    println!("{script}");

    if submit_job {
        let job_id = submit(&script_out)?;
        println!("🚀 Submitted batch job {job_id}");
    }
    Ok(())
}

fn run_sample(
    config_path: &PathBuf,
    overrides: Option<&str>,
    text: Option<String>,
    input: Option<PathBuf>,
    num_documents: usize,
    seed: u64,
) -> Result<()> {
    let config = PretrainConfig::load(config_path, overrides)?;
    let tokenizer = config.dataset_reader.tokenizer.init()?;
    config.check_span_fit(tokenizer.num_special_tokens())?;
    let sampler = SpanSampler::new(config.dataset_reader.sampler.clone())?;

    let documents = match (text, input) {
        (Some(text), _) => vec![text],
        (None, Some(path)) => {
            let file = std::fs::File::open(&path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            BufReader::new(file)
                .lines()
                .filter(|line| line.as_ref().map_or(true, |l| !l.trim().is_empty()))
                .take(num_documents)
                .collect::<std::io::Result<Vec<_>>>()?
        }
        (None, None) => bail!("Pass either --text or --input"),
    };

    let mut rng = StdRng::seed_from_u64(seed);
    for (index, document) in documents.iter().enumerate() {
        let ids = tokenizer.tokenize(document)?;
        let words: Vec<&str> = document.split_whitespace().collect();
        println!("\n📄 Document {} ({} tokens)", index + 1, ids.len());

        let Some(samples) = sampler.sample(ids.len(), &mut rng) else {
            println!(
                "   ⏭️  Skipped: shorter than min_span_len ({})",
                sampler.config().min_span_len
            );
            continue;
        };

        let preview = |start: usize, len: usize| -> Result<String> {
            let text = match tokenizer.decode(&ids[start..start + len])? {
                Some(text) => text,
                None => words[start..start + len].join(" "),
            };
            Ok(truncate(&text, 80))
        };

        for (a, sample) in samples.iter().enumerate() {
            println!(
                "   ⚓ Anchor {} [{}..{}) len {}: {}",
                a + 1,
                sample.anchor.start,
                sample.anchor.end(),
                sample.anchor.len,
                preview(sample.anchor.start, sample.anchor.len)?
            );
            for (p, positive) in sample.positives.iter().enumerate() {
                println!(
                    "      ➕ Positive {} [{}..{}) len {}: {}",
                    p + 1,
                    positive.start,
                    positive.end(),
                    positive.len,
                    preview(positive.start, positive.len)?
                );
            }
        }
    }
    Ok(())
}

fn embed_and_print<B: Backend>(
    serialization_dir: &PathBuf,
    epoch: Option<usize>,
    texts: &[String],
    projected: bool,
    device: B::Device,
) -> Result<()> {
    let embedder = SpanEmbedder::<B>::from_serialization_dir(serialization_dir, epoch, device)?;
    let embeddings = embedder.embed_texts(texts, projected)?;
    for (text, embedding) in texts.iter().zip(embeddings) {
        let line = serde_json::json!({"text": text, "embedding": embedding});
        println!("{}", serde_json::to_string(&line)?);
    }
    Ok(())
}

fn run_embed(
    serialization_dir: &PathBuf,
    epoch: Option<usize>,
    mut texts: Vec<String>,
    input: Option<PathBuf>,
    device: DeviceKind,
    projected: bool,
) -> Result<()> {
    if let Some(path) = input {
        let file = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if !line.trim().is_empty() {
                texts.push(line);
            }
        }
    }
    if texts.is_empty() {
        bail!("Pass at least one --text or an --input file");
    }
    eprintln!("🔢 Embedding {} texts", texts.len());

    match device {
        DeviceKind::Wgpu => embed_and_print::<burn::backend::Wgpu>(
            serialization_dir,
            epoch,
            &texts,
            projected,
            burn::backend::wgpu::WgpuDevice::default(),
        ),
        DeviceKind::Cpu => embed_and_print::<burn::backend::NdArray>(
            serialization_dir,
            epoch,
            &texts,
            projected,
            Default::default(),
        ),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars).collect();
        format!("{head}…")
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("burn_contrastive_pretrain=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            config,
            serialization_dir,
            overrides,
            device,
            seed,
        } => run_train(&config, &serialization_dir, overrides.as_deref(), device, seed),
        Commands::Launch {
            config,
            serialization_dir,
            train_data_path,
            overrides,
            transformer_model,
            job_name,
            cpus,
            gpus,
            time,
            mem,
            partition,
            activation,
            log_dir,
            trainer,
            script_out,
            submit,
        } => run_launch(
            config,
            serialization_dir,
            train_data_path,
            overrides,
            transformer_model,
            ResourceRequest {
                job_name,
                ntasks: 1,
                cpus_per_task: cpus,
                gpus,
                time,
                memory: mem,
                partition,
            },
            activation,
            log_dir,
            trainer,
            script_out,
            submit,
        ),
        Commands::Preprocess {
            input,
            output,
            column,
            no_headers,
            encoding,
            lowercase,
            min_length,
            max_instances,
            tokenizer,
        } => {
            println!("🧹 Preprocessing {} → {}", input.display(), output.display());
            let mut options = PreprocessOptions::new(input, output);
            options.column = column;
            options.has_headers = !no_headers;
            options.encoding = encoding;
            options.lowercase = lowercase;
            options.min_length = min_length;
            options.max_instances = max_instances;
            options.tokenizer = tokenizer;
            let stats = preprocess(&options)?;
            stats.print();
            println!("✅ Done");
            Ok(())
        }
        Commands::Sample {
            config,
            overrides,
            text,
            input,
            num_documents,
            seed,
        } => run_sample(&config, overrides.as_deref(), text, input, num_documents, seed),
        Commands::Embed {
            serialization_dir,
            epoch,
            text,
            input,
            device,
            projected,
        } => run_embed(&serialization_dir, epoch, text, input, device, projected),
    }
}
