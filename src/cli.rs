use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "songmap",
    version,
    about = "Map songbook table-of-contents entries to PDF page ranges"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Inventory(InventoryArgs),
    Resolve(ResolveArgs),
    Batch(BatchArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct InventoryArgs {
    #[arg(long)]
    pub books_dir: PathBuf,

    #[arg(long)]
    pub manifest_path: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ResolveArgs {
    #[arg(long)]
    pub pdf: PathBuf,

    #[arg(long)]
    pub toc: PathBuf,

    #[arg(long)]
    pub output: Option<PathBuf>,

    #[arg(long, default_value = ".cache/songmap")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub dpi: Option<u32>,

    /// Answer from a recorded reply file instead of running the classifier.
    #[arg(long)]
    pub replay: Option<PathBuf>,

    /// Skip the pdfinfo probe.
    #[arg(long)]
    pub total_pages: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct BatchArgs {
    #[arg(long)]
    pub books_dir: PathBuf,

    #[arg(long)]
    pub jobs: Option<usize>,

    #[arg(long, default_value = ".cache/songmap")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/songmap")]
    pub cache_root: PathBuf,
}
