use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use freshet::app::AppContext;
use freshet::cli::commands::{self, EntryFilter};
use freshet::cli::{Cli, Commands};
use freshet::config::{Config, ConfigStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::default_config_path()?,
    };
    let config = Arc::new(ConfigStore::open(&config_path)?);

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.get().log.level.to_ascii_lowercase()));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    if let Commands::CheckConfig = cli.command {
        commands::check_config(&config)?;
        return Ok(());
    }

    let ctx = AppContext::new(config)?;
    ctx.scheduler.sync_config(&ctx.config.get())?;

    match cli.command {
        Commands::Run => {
            commands::run(&ctx).await?;
        }
        Commands::Poll { feed } => {
            commands::poll(&ctx, &feed).await?;
        }
        Commands::Feeds => {
            commands::list_feeds(&ctx)?;
        }
        Commands::Entries {
            feed,
            status,
            title,
            limit,
            offset,
            json,
        } => {
            let filter = EntryFilter {
                feed,
                status,
                title,
                limit,
                offset,
            };
            commands::list_entries(&ctx, filter, json)?;
        }
        Commands::Retry {
            entry_id,
            downloader,
        } => {
            commands::retry(&ctx, entry_id, downloader).await?;
        }
        Commands::CheckConfig => {}
    }

    Ok(())
}
