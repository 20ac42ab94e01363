//! sae-interp CLI: train sparse autoencoders over embeddings and interpret their features

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sae_interp::{
    default_registry_path, extract, select_device, train, ExtractConfig, ExtractRequest,
    FeatureCount, HttpInterpreter, LrSchedule, PromptType, RunConfig, SelectionPolicy,
    TrainRequest,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "sae-interp")]
#[command(about = "Sparse autoencoder training and feature interpretation")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Force CPU mode
    #[arg(long, global = true)]
    cpu: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Train an SAE on an embedding matrix and write a checkpoint
    Train(TrainArgs),
    /// Index a trained SAE over a corpus and interpret its features
    Extract(ExtractArgs),
}

#[derive(Args)]
struct TrainArgs {
    /// Run name, prefix of the checkpoint directory
    #[arg(long, default_value = "final_one")]
    run_name: String,

    /// Name of the model that produced the embeddings (recorded only)
    #[arg(long)]
    model_name: Option<String>,

    /// Embedding matrix (.npy or .safetensors)
    #[arg(long)]
    embeddings_file: PathBuf,

    /// Texts aligned with the embedding rows (.json or .txt)
    #[arg(long)]
    sentences_file: Option<PathBuf>,

    #[arg(long, default_value_t = 512)]
    batch_size: usize,

    /// Embedding dimension D
    #[arg(long, default_value_t = 768)]
    dimensions: usize,

    #[arg(long, default_value_t = 1.0)]
    sparsity_alpha: f64,

    #[arg(long, default_value_t = 1e-5)]
    lr: f64,

    #[arg(long, default_value_t = 1)]
    num_epochs: usize,

    #[arg(long, default_value_t = 1.0)]
    sparsity_scale: f64,

    /// Explicit latent width F (overrides --expansion)
    #[arg(long)]
    features: Option<usize>,

    /// Latent width as a multiple of D
    #[arg(long, default_value_t = 8)]
    expansion: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Linear warmup steps followed by cosine decay (0 = constant lr)
    #[arg(long, default_value_t = 0)]
    warmup_steps: usize,

    /// Also write a checkpoint after every epoch
    #[arg(long)]
    checkpoint_every_epoch: bool,

    /// Refuse batch sizes whose estimated footprint exceeds this many MiB
    #[arg(long)]
    memory_budget_mb: Option<u64>,

    /// Parent directory for run checkpoints
    #[arg(short, long, default_value = "training_sae/saes")]
    output_dir: PathBuf,
}

#[derive(Args)]
struct ExtractArgs {
    /// Checkpoint directory written by `train`
    #[arg(long)]
    checkpoint: PathBuf,

    /// Embedding matrix (.npy or .safetensors)
    #[arg(long)]
    embeddings_file: PathBuf,

    /// Texts aligned with the embedding rows (.json or .txt)
    #[arg(long)]
    sentences_file: Option<PathBuf>,

    /// Registry JSON to create or merge into [default: <checkpoint>/feature_registry.json]
    #[arg(long)]
    registry: Option<PathBuf>,

    /// Maximum number of features sent to the interpreter
    #[arg(long, default_value_t = 100)]
    max_features: usize,

    /// Top-activating examples kept per feature
    #[arg(long, default_value_t = 50)]
    k: usize,

    /// Zero-activation examples kept per feature
    #[arg(long, default_value_t = 20)]
    contrast_k: usize,

    /// plain, contrastive or structured
    #[arg(long, default_value = "structured")]
    prompt_type: PromptType,

    #[arg(long, default_value = "gpt-4o-mini")]
    interpreter_model: String,

    /// registry, max_activation or density
    #[arg(long, default_value = "registry")]
    selection: SelectionPolicy,

    /// Do not re-request features that already have an explanation
    #[arg(long)]
    skip_explained: bool,

    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Per-call timeout in seconds
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    #[arg(long, default_value_t = 2)]
    max_retries: u32,

    /// Score structured explanations against top and contrast examples
    #[arg(long)]
    score: bool,

    #[arg(long, default_value_t = 1024)]
    index_batch_size: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Command::Train(args) => run_train(args, cli.cpu),
        Command::Extract(args) => run_extract(args, cli.cpu),
    }
}

fn run_train(args: TrainArgs, cpu: bool) -> Result<()> {
    let features = match args.features {
        Some(n) => FeatureCount::Count(n),
        None => FeatureCount::Multiplier(args.expansion),
    };
    let lr_schedule = if args.warmup_steps > 0 {
        LrSchedule::WarmupCosine {
            warmup_steps: args.warmup_steps,
            min_lr_ratio: 0.1,
        }
    } else {
        LrSchedule::Constant
    };
    let config = RunConfig {
        run_name: args.run_name,
        model_name: args.model_name,
        embedding_dimension: args.dimensions,
        features,
        sparsity_alpha: args.sparsity_alpha,
        sparsity_scale: args.sparsity_scale,
        batch_size: args.batch_size,
        learning_rate: args.lr,
        epoch_count: args.num_epochs,
        seed: args.seed,
        lr_schedule,
        checkpoint_every_epoch: args.checkpoint_every_epoch,
        memory_budget_bytes: args.memory_budget_mb.map(mib_to_bytes),
        ..Default::default()
    };

    println!("=== sae-interp: train ===");
    println!("Run:        {}", config.run_name);
    println!("Embeddings: {}", args.embeddings_file.display());
    println!("Output:     {}", args.output_dir.display());
    if cpu {
        println!("Mode:       CPU (forced)");
    }

    let device = select_device(cpu);
    let request = TrainRequest {
        config,
        embeddings_path: args.embeddings_file,
        texts_path: args.sentences_file,
        output_dir: args.output_dir,
    };
    let report = train(&request, &device).context("training failed")?;

    println!("\n=== Results ===");
    if let Some(loss) = report.final_loss {
        println!(
            "Final loss: {:.6} (recon {:.6}, sparsity {:.6})",
            loss.total, loss.reconstruction, loss.sparsity
        );
    }
    println!(
        "Dead features: {} / {}",
        report.dead_features, report.n_features
    );
    println!("Checkpoint: {}", report.checkpoint.display());

    let report_path = report.checkpoint.join("train_report.json");
    std::fs::write(&report_path, serde_json::to_string_pretty(&report)?)?;
    info!("Report saved to {}", report_path.display());
    Ok(())
}

/// MiB to bytes, clamped at `u64::MAX`.
fn mib_to_bytes(mb: u64) -> u64 {
    mb.saturating_mul(1024 * 1024)
}

fn run_extract(args: ExtractArgs, cpu: bool) -> Result<()> {
    let config = ExtractConfig {
        max_features: args.max_features,
        top_k: args.k,
        contrast_k: args.contrast_k,
        prompt_type: args.prompt_type,
        interpreter_model: args.interpreter_model,
        selection: args.selection,
        skip_explained: args.skip_explained,
        max_concurrency: args.concurrency,
        call_timeout: Duration::from_secs(args.timeout_secs),
        max_retries: args.max_retries,
        score_interpretations: args.score,
        index_batch_size: args.index_batch_size,
        seed: args.seed,
        ..Default::default()
    };
    let registry_path = args
        .registry
        .unwrap_or_else(|| default_registry_path(&args.checkpoint));

    println!("=== sae-interp: extract ===");
    println!("Checkpoint:  {}", args.checkpoint.display());
    println!("Registry:    {}", registry_path.display());
    println!("Interpreter: {} ({})", config.interpreter_model, config.prompt_type);

    let device = select_device(cpu);
    let interpreter = Arc::new(HttpInterpreter::from_env(config.interpreter_model.clone())?);
    let request = ExtractRequest {
        config,
        checkpoint_dir: args.checkpoint,
        embeddings_path: args.embeddings_file,
        texts_path: args.sentences_file,
        registry_path,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let report = runtime
        .block_on(extract(&request, interpreter, &device))
        .context("extraction failed")?;

    println!("\n=== Results ===");
    let s = report.interpretation;
    println!(
        "Selected {}: {} explained, {} failed, {} without examples",
        s.selected, s.succeeded, s.failed, s.no_examples
    );
    let r = report.registry;
    println!(
        "Registry: {} features ({} explained, {} dead)",
        r.total, r.explained, r.dead
    );
    println!("Saved to {}", report.registry_path.display());
    Ok(())
}
