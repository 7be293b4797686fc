use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "nectar",
    about = "An embedded semantic document store with a stdio control protocol"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress everything below warnings
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the line-oriented JSON control protocol on stdin/stdout
    Serve,
    /// Crawl a directory and ingest every supported file
    Pull(PullArgs),
    /// Search stored entries with a text query
    Find(FindArgs),
    /// Show data directory and collection statistics
    Status(StatusArgs),
}

#[derive(Debug, Parser)]
pub struct PullArgs {
    /// Directory to crawl
    pub dir: PathBuf,
}

#[derive(Debug, Parser)]
pub struct FindArgs {
    /// Query text
    pub query: String,

    /// Maximum number of results
    #[arg(short = 'n', long, default_value_t = 10)]
    pub count: usize,

    /// Emit results as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Emit status as JSON
    #[arg(long)]
    pub json: bool,
}
