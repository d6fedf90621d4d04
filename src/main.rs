use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use listing_sync::config::Config;
use listing_sync::feed::RetsClient;
use listing_sync::layout::DataLayout;
use listing_sync::models::{PropertyGroup, PropertyType};
use listing_sync::service::SyncService;

#[derive(Parser)]
#[command(name = "listing-sync", about = "Keeps local listing tables in step with a RETS feed")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build the schema and table of a property group, then load it.
    Setup {
        /// ResidentialAndCondoProperty or CommercialProperty
        group: PropertyGroup,
        #[arg(long, default_value_t = 24)]
        hours: u32,
    },
    /// Apply listing changes from the last few hours.
    Update {
        #[arg(required = true)]
        types: Vec<PropertyType>,
        #[arg(long, default_value_t = 1)]
        hours: u32,
    },
    /// Remove listings that are no longer active.
    Delete {
        #[arg(required = true)]
        types: Vec<PropertyType>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = Config::from_env()?;

    let client = RetsClient::new(cfg.endpoints.clone()).context("creating feed client")?;
    let mut service = SyncService::new(
        Arc::new(client),
        cfg.data_credentials.clone(),
        cfg.active_credentials.clone(),
        DataLayout::new(&cfg.data_dir),
    );
    if let Some(url) = &cfg.database_url {
        service = service.with_database_url(url);
    }

    let result = match cli.command {
        Command::Setup { group, hours } => service.setup(group, hours).await.map(|s| s.len()),
        Command::Update { types, hours } => service.run_updates(&types, hours).await.map(|s| s.len()),
        Command::Delete { types } => service.reconcile_stale_listings(&types).await.map(|s| s.len()),
    };

    if let Err(e) = service.close().await {
        error!(error = %e, "feed logout failed");
    }

    let processed = result?;
    info!(processed, "DONE");
    Ok(())
}
