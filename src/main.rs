use log::{error, info};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use metric_api::{
    catalog::Discoverer,
    config::{Config, EngineConfig, WarehouseConfig},
    credentials::{self, ProvisionedProfile, WarehouseProfile},
    engine::{process::ProcessEngine, EngineContext},
    query::Resolver,
    refresh::RefreshOutcome,
    server::AppState,
    ApiServer, CatalogState,
};

const DEFAULT_PROFILE: &str = "mapi";
const DEFAULT_TARGET: &str = "default";

/// Writes a generated connection profile when warehouse credentials are configured.
fn provision_profile(
    engine_config: &EngineConfig,
    warehouse_config: &WarehouseConfig,
) -> Result<Option<ProvisionedProfile>, credentials::CredentialError> {
    let Some(warehouse_type) = &warehouse_config.warehouse_type else {
        return Ok(None);
    };
    let warehouse = WarehouseProfile {
        warehouse_type: warehouse_type.clone(),
        credentials: warehouse_config.credential_pairs(),
    };
    let profile_name = engine_config.profile.as_deref().unwrap_or(DEFAULT_PROFILE);
    let target = engine_config.target.as_deref().unwrap_or(DEFAULT_TARGET);
    credentials::provision(profile_name, target, &warehouse).map(Some)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = Config::new().map_err(|e| {
        error!("Failed to initialize config: {}", e);
        e
    })?;

    let engine_config = EngineConfig::new().map_err(|e| {
        error!("Failed to initialize engine config: {}", e);
        e
    })?;

    let warehouse_config = WarehouseConfig::new().map_err(|e| {
        error!("Failed to initialize warehouse config: {}", e);
        e
    })?;

    // Held until shutdown, dropping it deletes the profile directory.
    let provisioned = provision_profile(&engine_config, &warehouse_config).map_err(|e| {
        error!("Failed to provision connection profile: {}", e);
        e
    })?;

    let mut profile = engine_config.connection_profile();
    let mut context = EngineContext::new(engine_config.command.clone())
        .with_working_dir(engine_config.project_dir.clone().map(PathBuf::from));
    if let Some(provisioned) = &provisioned {
        profile.profile = Some(
            engine_config
                .profile
                .clone()
                .unwrap_or_else(|| DEFAULT_PROFILE.to_string()),
        );
        profile.target = Some(
            engine_config
                .target
                .clone()
                .unwrap_or_else(|| DEFAULT_TARGET.to_string()),
        );
        profile.profiles_dir = Some(provisioned.path().to_path_buf());
        context = context.with_env(provisioned.env().clone());
    }
    let context = context.with_profile(profile);
    info!("Engine context: {:?}", context);

    let engine = Arc::new(ProcessEngine::new(engine_config.timeout()));
    let catalog = Arc::new(CatalogState::new(
        Discoverer::new(engine.clone(), context.clone()),
        Resolver::new(engine, context),
    ));

    match catalog.refresh().await {
        RefreshOutcome::Refreshed { metrics, .. } => {
            info!("Initial discovery found {} metrics", metrics)
        }
        RefreshOutcome::Retained { .. } => {
            error!("Initial discovery failed, typed queries are unavailable until a refresh succeeds")
        }
    }

    if config.refresh_interval_secs > 0 {
        catalog
            .clone()
            .spawn_periodic_refresh(Duration::from_secs(config.refresh_interval_secs));
    }

    let server = ApiServer::new(config, AppState::new(catalog));

    if let Err(e) = server.run().await {
        error!("Server encountered an error: {}", e);
        drop(provisioned);
        process::exit(1);
    }

    Ok(())
}
