use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "simcheck")]
#[command(about = "Source-similarity analysis for student submissions", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Ingest a directory of submissions and run the analysis pipeline
    Analyze(AnalyzeArgs),
    /// Show a run's status, progress, and top-scoring pairs
    ShowRun(ShowRunArgs),
    /// Print configuration values
    PrintConfig,
    /// Truncate all database tables
    TruncateDb,
}

#[derive(Debug, Args)]
pub struct AnalyzeArgs {
    /// Directory containing one subdirectory per submission
    pub root: PathBuf,

    /// Collection to file the dataset under
    #[arg(long, default_value = "default")]
    pub collection: String,

    /// Dataset name; defaults to the directory name plus a timestamp
    #[arg(long)]
    pub dataset: Option<String>,

    /// k-gram length for fingerprinting
    #[arg(long)]
    pub k: Option<usize>,

    /// Winnowing window size
    #[arg(long)]
    pub w: Option<usize>,

    /// Weight of the fingerprint score in the final score
    #[arg(long)]
    pub fingerprint_weight: Option<f64>,

    /// Weight of the structural score in the final score
    #[arg(long)]
    pub ast_weight: Option<f64>,

    /// Fail the run on the first per-file or per-pair error
    #[arg(long)]
    pub strict: bool,

    /// Number of top pairs to print after the run
    #[arg(long, default_value_t = 20)]
    pub top: usize,
}

#[derive(Debug, Args)]
pub struct ShowRunArgs {
    /// Run id returned by `analyze`
    pub run_id: i64,

    /// Number of top pairs to print
    #[arg(long, default_value_t = 20)]
    pub top: usize,
}
