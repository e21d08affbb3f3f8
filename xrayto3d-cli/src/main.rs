//! xrayto3d CLI: train, evaluate and benchmark biplanar X-ray to 3D reconstruction models.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Experiment harness for biplanar X-ray to 3D bone shape reconstruction
#[derive(Parser, Debug)]
#[command(name = "xrayto3d", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Train a model (or run a one-batch smoke test with --debug)
    Train(TrainCli),
    /// Run inference from a checkpoint and write per-case metrics
    Evaluate(EvaluateCli),
    /// Print the LaTeX benchmark table for an anatomy
    Benchmark(BenchmarkCli),
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug)]
pub struct TrainCli {
    /// Training manifest CSV (its path determines the anatomy)
    #[arg(long)]
    pub trainpaths: PathBuf,
    /// Validation manifest CSV
    #[arg(long)]
    pub valpaths: PathBuf,
    #[arg(long)]
    pub model_name: String,
    #[arg(long, default_value = "DiceLoss")]
    pub loss: String,
    #[arg(long, default_value_t = 2e-4)]
    pub lr: f64,
    #[arg(long, default_value_t = 100)]
    pub epochs: usize,
    /// Maximum optimizer steps; negative for no limit
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub steps: i64,
    #[arg(long, default_value_t = 64)]
    pub size: usize,
    /// Voxel spacing in mm
    #[arg(long, default_value_t = 1.5)]
    pub res: f64,
    #[arg(long, default_value_t = 4)]
    pub batch_size: usize,
    #[arg(long, default_value_t = 4)]
    pub num_workers: usize,
    #[arg(long, default_value = "gpu")]
    pub accelerator: String,
    /// Defaults to 16 on GPU 0, 32 otherwise
    #[arg(long)]
    pub precision: Option<u8>,
    #[arg(long, default_value_t = 0)]
    pub gpu: usize,
    /// Tracking project (defaults to tracking.project)
    #[arg(long)]
    pub project: Option<String>,
    #[arg(long, num_args = 0..)]
    pub tags: Vec<String>,
    #[arg(long)]
    pub debug: bool,
    /// Monitored checkpoints to keep; negative keeps all
    #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
    pub top_k_checkpoints: i64,
    #[arg(long, default_value_t = 1.0)]
    pub lambda_bce: f64,
    #[arg(long, default_value_t = 1.0)]
    pub lambda_dice: f64,
    #[arg(long)]
    pub dropout: bool,
    #[arg(long)]
    pub make_sparse: bool,
    /// Autoencoder checkpoint (required for TLPredictor)
    #[arg(long)]
    pub load_autoencoder_from: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
pub struct EvaluateCli {
    #[arg(long)]
    pub testpaths: PathBuf,
    #[arg(long)]
    pub model_name: String,
    /// Checkpoint file or checkpoint directory (latest is used)
    #[arg(long)]
    pub ckpt_path: PathBuf,
    #[arg(long)]
    pub res: f64,
    #[arg(long)]
    pub load_autoencoder_from: Option<PathBuf>,
    /// Surface tolerance in mm (defaults to evaluation.nsd_tolerance)
    #[arg(long)]
    pub nsd_tolerance: Option<f64>,
    #[arg(long)]
    pub image_size: usize,
    /// Defaults to `<ckpt_dir>/../evaluation`
    #[arg(long)]
    pub output_path: Option<PathBuf>,
    #[arg(long, default_value_t = 2)]
    pub batch_size: usize,
    #[arg(long, default_value_t = 20)]
    pub num_workers: usize,
    #[arg(long, default_value = "gpu")]
    pub accelerator: String,
    /// Always 16 on GPU 0; defaults to 32 otherwise
    #[arg(long)]
    pub precision: Option<u8>,
    #[arg(long, default_value_t = 0)]
    pub gpu: usize,
}

#[derive(clap::Args, Debug)]
pub struct BenchmarkCli {
    #[arg(long)]
    pub anatomy: String,
    /// Report the domain-shift evaluation instead of the in-domain one
    #[arg(long)]
    pub domain_shift: bool,
    #[arg(long)]
    pub domain_shift_dataset: Option<String>,
    #[arg(long, num_args = 0..)]
    pub tags: Vec<String>,
    /// Write `{model: mean DSC}` under paths.metadata_dir
    #[arg(long)]
    pub save_json: bool,
}

#[derive(clap::Subcommand, Debug)]
pub enum ConfigAction {
    /// Create a default configuration file
    Init,
    /// Show current configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("org", "xrayto3d", "xrayto3d")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "xrayto3d.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace).await
}
