use super::app_config::LogLevel;
use clap::Parser;
use std::path::PathBuf;

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(
    name = "wheels",
    version,
    about = "Load images through a memory and disk cache pipeline",
    long_about = None
)]
pub struct CliArgs {
    /// Configuration file path.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[arg(long, value_name = "PATH")]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Storage cache directory.
    #[arg(long, value_name = "PATH")]
    pub cache_dir: Option<PathBuf>,

    /// Share of the memory baseline given to the memory cache (0.1-0.8).
    #[arg(long)]
    pub memory_fraction: Option<f32>,

    /// Storage cache budget in bytes.
    #[arg(long)]
    pub storage_max_bytes: Option<u64>,

    /// Disable the storage cache.
    #[arg(long)]
    pub no_storage: bool,

    /// Show images without cross-fading.
    #[arg(long)]
    pub no_fade: bool,

    /// Clear both caches before loading.
    #[arg(long)]
    pub clear: bool,

    /// Image files to load.
    #[arg(value_name = "FILE")]
    pub files: Vec<PathBuf>,
}
