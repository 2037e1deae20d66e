pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::domain::{DownloaderKind, EntryStatus};

#[derive(Parser)]
#[command(name = "freshet")]
#[command(about = "Poll RSS/Atom feeds and download new enclosures", long_about = None)]
pub struct Cli {
    /// Configuration file (default: ~/.config/freshet/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the scheduler until interrupted
    Run,
    /// Poll one feed now and wait for its downloads
    Poll {
        /// Feed name as configured
        feed: String,
    },
    /// Show feed status
    Feeds,
    /// List entries
    Entries {
        /// Only entries of this feed
        #[arg(long)]
        feed: Option<String>,

        /// pending, downloading, completed, failed or skipped
        #[arg(long)]
        status: Option<EntryStatus>,

        /// Case-insensitive title substring
        #[arg(long)]
        title: Option<String>,

        #[arg(short, long, default_value_t = 50)]
        limit: usize,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Download an entry again with a fresh retry budget
    Retry {
        /// Entry id as shown by `entries`
        entry_id: i64,

        /// http, aria2 or qbittorrent (default: the feed's downloader)
        #[arg(long)]
        downloader: Option<DownloaderKind>,
    },
    /// Validate the configuration and print a summary
    CheckConfig,
}
