//! Command-line interface definition for `prag`.
//!
//! ```sh
//! prag init
//! prag ask "What's your name?"
//! prag ask "Where do you work?" --json
//! prag search "notice period" -k 5
//! prag warm --rebuild
//! prag interactive
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, propagate_version = true, color = clap::ColorChoice::Auto)]
pub struct Cli {
    /// Configuration file. Defaults to `<config_dir>/config.yaml`.
    #[arg(long, short = 'c', env = "PRAG_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a default configuration and prompt template into the config directory.
    Init {
        /// Overwrite existing files.
        #[arg(long)]
        force: bool,
    },

    /// Answer one question from the knowledge base.
    #[clap(name = "ask", alias = "a")]
    Ask {
        question: String,

        /// Print the answer payload as JSON.
        #[arg(long)]
        json: bool,

        /// Timestamp (ms since epoch) to stamp the answer with instead of the current time.
        #[arg(long)]
        timestamp: Option<i64>,
    },

    /// Show which records a question retrieves, without generating an answer.
    #[clap(name = "search", alias = "s")]
    Search {
        question: String,

        /// Number of records to retrieve.
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// Populate the embedding cache and report what was done.
    Warm {
        /// Discard the cache and embed every record again.
        #[arg(long)]
        rebuild: bool,
    },

    /// Ask questions line by line until EOF or `exit`.
    #[clap(name = "interactive", alias = "i")]
    Interactive,
}
