use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod session;

#[derive(Parser, Debug)]
#[command(about = "Drive a related-list binder against an in-memory record store")]
struct Args {
    /// Settings file; missing files fall back to defaults.
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// quote-line-items-with-flow, opportunity-quotes or quote-line-item-table
    #[arg(long)]
    preset: Option<String>,
    #[arg(long)]
    parent_id: Option<String>,
    #[arg(long)]
    seed_rows: Option<usize>,
    #[arg(long)]
    link_base_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings = config::load_settings(&args.config);
    if let Some(v) = args.preset {
        settings.preset = v;
    }
    if let Some(v) = args.parent_id {
        settings.parent_id = v;
    }
    if let Some(v) = args.seed_rows {
        settings.seed_rows = v;
    }
    if let Some(v) = args.link_base_url {
        settings.link_base_url = Some(v);
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let binder_config = settings.binder_config()?;
    info!(
        preset = %settings.preset,
        parent_id = %settings.parent_id,
        "starting demo session"
    );
    session::run(&settings, binder_config).await
}
