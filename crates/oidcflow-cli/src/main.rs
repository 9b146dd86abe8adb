mod cli;
mod commands;
mod navigator;
mod observability;
mod output;
mod settings;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use oidcflow::{FlowOrchestrator, JsonFileStorage, OidcClient, ReqwestTransport};
use tracing::debug;

use cli::{Cli, Commands};
use navigator::ConsoleNavigator;
use output::print_error;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let format = cli.format.unwrap_or_default();

    let settings = settings::load(&cli.config)?;
    observability::init_tracing(&settings.logging.level);

    let store = settings::store_path(cli.store.as_deref())?;
    debug!(store = %store.display(), "Opening session store");
    let storage = JsonFileStorage::open(&store)
        .with_context(|| format!("Cannot open session store {}", store.display()))?;

    let timeout = settings
        .clients
        .iter()
        .map(|c| c.request_timeout)
        .max()
        .unwrap_or_default();
    let transport = ReqwestTransport::new(timeout).context("Cannot create HTTP client")?;

    let client = OidcClient::builder(Arc::new(ConsoleNavigator))
        .settings(&settings)
        .transport(Arc::new(transport))
        .storage(Arc::new(storage))
        .build()?;

    let config_id = cli.config_id.as_deref();
    match &cli.command {
        Commands::Login(args) => commands::login(select(&client, config_id)?, args).await?,
        Commands::Callback(args) => {
            commands::callback(select(&client, config_id)?, &args.url, format).await?;
        }
        Commands::Refresh => commands::refresh(select(&client, config_id)?, format).await?,
        Commands::Status => commands::status(&client, format).await?,
        Commands::Userinfo => commands::userinfo(select(&client, config_id)?, format).await?,
        Commands::Logout(args) => commands::logout(select(&client, config_id)?, args).await?,
        Commands::Monitor(args) => {
            commands::monitor(&client, select(&client, config_id)?, args, format).await?;
        }
    }

    Ok(())
}

fn select<'a>(client: &'a OidcClient, config_id: Option<&str>) -> Result<&'a Arc<FlowOrchestrator>> {
    client
        .get_or_single(config_id)
        .context("Select a configuration with --config-id")
}
