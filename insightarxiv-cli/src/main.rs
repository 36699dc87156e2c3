//! InsightArxiv CLI: offline proxy, month loader, parsing worker, search and
//! database builder for the arXiv paper feed.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// InsightArxiv: a monthly arXiv feed with AI-generated Chinese summaries
#[derive(Parser, Debug)]
#[command(name = "insightarxiv", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Run the offline cache proxy
    Serve {
        /// Listen host (overrides offline.host)
        #[arg(long)]
        host: Option<String>,
        /// Listen port (overrides offline.port)
        #[arg(short, long)]
        port: Option<u16>,
        /// Upstream origin to fetch from (defaults to data.base_url)
        #[arg(long)]
        upstream: Option<String>,
        /// Persist caches to this directory
        #[arg(long)]
        persist_dir: Option<PathBuf>,
    },
    /// List the months in the manifest
    Months,
    /// Load one month through the incremental loader
    Load {
        /// Month key, YYYY-MM
        month: String,
        /// Stream the file line by line, as on a slow connection
        #[arg(long)]
        stream: bool,
        /// Number of papers to print
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },
    /// Parse one month with the background worker, printing its events
    Parse {
        /// Month key, YYYY-MM
        month: String,
        /// Base batch size for this job
        #[arg(long)]
        batch_size: Option<usize>,
        /// Print batch events with their papers
        #[arg(long)]
        full: bool,
    },
    /// Search the newest months
    Search {
        /// Query; every word must match
        query: String,
        /// Number of newest months to search
        #[arg(short, long, default_value = "3")]
        months: usize,
        /// Restrict to these categories (repeatable)
        #[arg(short, long)]
        category: Vec<String>,
        /// Number of results to print
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Build month files, manifest and indexes from AI-enhanced records
    Build {
        /// Directory holding *_AI_enhanced_Chinese.jsonl files
        #[arg(short, long, default_value = "data")]
        input: PathBuf,
        /// Output root (defaults to the workspace)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Keep search terms found in at least this many papers
        #[arg(long, default_value = "3")]
        min_frequency: usize,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
pub enum ConfigAction {
    /// Create a default configuration file in the workspace
    Init,
    /// Show the current configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "insightarxiv", "insightarxiv")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "insightarxiv.log");
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
