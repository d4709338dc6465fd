use models::{CliApp, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod aggregates;
mod analysis;
mod cli;
mod config;
mod database;
mod error;
mod mailchimp;
mod mailer;
mod models;
mod report;
mod stats;

use config::{load_config, Config};
use database::create_db_pool;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // The subscriber goes up first so the config fallback warning is seen.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("list_benchmarks=info".parse().unwrap())
                .add_directive("hyper=warn".parse().unwrap()),
        )
        .init();

    let config = match load_config("config.yml").await {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load config.yml: {}. Using defaults.", e);
            Config::default()
        }
    };

    tokio::fs::create_dir_all(&config.output.directory).await?;

    info!("Initializing database...");
    let db_pool = create_db_pool("data/benchmarks.db").await?;

    let app = CliApp::new(config, db_pool).await?;

    tokio::select! {
        result = app.run() => {
            result?;
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    Ok(())
}
