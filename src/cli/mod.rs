//! CLI command definitions and parsing
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "segvec",
    version,
    about = "Semantic vector indexing and search for chat conversation segments",
    long_about = "segvec embeds conversation segments into per-group HNSW indexes, keeps a SQLite \
                  metadata shadow of every stored vector and answers similarity queries with \
                  ranked, paginated results."
)]
pub struct Cli {
    /// Global config file path (defaults to ~/.config/segvec/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show engine health and persisted index files
    Status,

    /// Check that the ANN library can build an index
    Health,

    /// Show segment and vector statistics
    Stats,

    /// Remove invalid index records, orphan vectors and unreferenced files
    Cleanup,

    /// Vectorize pending segments of every group
    Rebuild,

    /// Vectorize pending segments of one group
    Vectorize {
        /// Group (chat) id
        #[arg(allow_negative_numbers = true)]
        group: i64,
    },

    /// Search a group's conversation segments
    Search {
        /// Group (chat) id
        #[arg(allow_negative_numbers = true)]
        group: i64,

        /// Search query text
        query: String,

        /// Number of ranked results to skip
        #[arg(long, default_value = "0")]
        skip: usize,

        /// Maximum number of results to return
        #[arg(short, long, default_value = "10")]
        take: usize,

        /// Show results in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Validate configuration file
    Validate {
        /// Path to config file (defaults to standard location)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Initialize default configuration
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
