//! Entity agent.
//!
//! Runs the entity store on its own: discovers the host's identity and service names through the instance metadata
//! service, and keeps them fresh until told to stop.

#![deny(warnings)]
#![deny(missing_docs)]

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use entity_config::{ConfigurationLoader, GenericConfiguration};
use entity_error::{ErrorContext as _, GenericError};
use entity_store::{config::EntityStoreConfiguration, metadata::ImdsMetadataProvider, EntityStore};
use tokio::{
    select,
    signal::unix::{signal, SignalKind},
};
use tracing::{error, info};

mod logging;
use self::logging::{fatal_and_exit, initialize_logging, LoggingConfiguration};

const DEFAULT_CONFIG_PATH: &str = "/etc/entity-agent/entity-agent.yaml";
const ENVIRONMENT_PREFIX: &str = "ENTITY";

#[derive(Parser)]
#[command(about = "Entity attribution agent")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let configuration = load_configuration(cli.config)
        .unwrap_or_else(|e| fatal_and_exit(format!("failed to load configuration: {}", e)));

    let logging_config = LoggingConfiguration::from_configuration(&configuration)
        .unwrap_or_else(|e| fatal_and_exit(format!("failed to load logging configuration: {}", e)));
    if let Err(e) = initialize_logging(logging_config) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
    }

    match run(&configuration).await {
        Ok(()) => info!("Entity agent stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

fn load_configuration(path: PathBuf) -> Result<GenericConfiguration, GenericError> {
    let configuration = ConfigurationLoader::default()
        .try_from_yaml(path)
        .from_environment(ENVIRONMENT_PREFIX)?
        .into_generic();
    Ok(configuration)
}

async fn run(configuration: &GenericConfiguration) -> Result<(), GenericError> {
    let store_config = EntityStoreConfiguration::from_configuration(configuration)
        .error_context("Failed to load entity store configuration.")?;
    info!(mode = %store_config.mode(), "Entity agent starting...");

    let metadata_provider = ImdsMetadataProvider::from_configuration(store_config.imds())
        .error_context("Failed to build instance metadata client.")?;
    let store = EntityStore::new(store_config, Arc::new(metadata_provider))?;
    store.start().error_context("Failed to start entity store.")?;

    wait_for_shutdown_signal().await?;

    store.shutdown().await;
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<(), GenericError> {
    let mut sigint_handler = signal(SignalKind::interrupt()).error_context("Failed to set up SIGINT handler.")?;
    let mut sigterm_handler = signal(SignalKind::terminate()).error_context("Failed to set up SIGTERM handler.")?;

    select! {
        _ = sigint_handler.recv() => info!("Received SIGINT, shutting down..."),
        _ = sigterm_handler.recv() => info!("Received SIGTERM, shutting down..."),
    }

    Ok(())
}
