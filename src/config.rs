use std::collections::BTreeMap;
use std::time::Duration;

use envconfig::Envconfig;
use log::debug;

use crate::engine::ConnectionProfile;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "SERVER_HOST", default = "127.0.0.1")]
    pub server_host: String,

    #[envconfig(from = "SERVER_PORT", default = "8080")]
    pub server_port: u16,

    /// Seconds between background catalog refreshes, 0 disables them.
    #[envconfig(from = "REFRESH_INTERVAL_SECS", default = "0")]
    pub refresh_interval_secs: u64,

    #[envconfig(from = "CORS_ORIGINS")]
    pub cors_origins: Option<String>,
}

impl Config {
    pub fn new() -> Result<Self, envconfig::Error> {
        let config = Self::init_from_env()?;
        debug!(
            "Config loaded: server_host={}, server_port={}, refresh_interval_secs={}, cors_origins={:?}",
            config.server_host, config.server_port, config.refresh_interval_secs, config.cors_origins
        );
        Ok(config)
    }
}

#[derive(Envconfig, Clone)]
pub struct EngineConfig {
    #[envconfig(from = "ENGINE_COMMAND", default = "dbt")]
    pub command: String,

    #[envconfig(from = "ENGINE_PROJECT_DIR")]
    pub project_dir: Option<String>,

    #[envconfig(from = "ENGINE_TARGET")]
    pub target: Option<String>,

    #[envconfig(from = "ENGINE_PROFILE")]
    pub profile: Option<String>,

    #[envconfig(from = "ENGINE_PROFILES_DIR")]
    pub profiles_dir: Option<String>,

    #[envconfig(from = "ENGINE_TIMEOUT_SECS", default = "300")]
    pub timeout_secs: u64,
}

impl EngineConfig {
    pub fn new() -> Result<Self, envconfig::Error> {
        let config = Self::init_from_env()?;
        debug!(
            "EngineConfig loaded: command={}, project_dir={:?}, target={:?}, profile={:?}, profiles_dir={:?}, timeout_secs={}",
            config.command,
            config.project_dir,
            config.target,
            config.profile,
            config.profiles_dir,
            config.timeout_secs
        );
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connection_profile(&self) -> ConnectionProfile {
        ConnectionProfile {
            target: self.target.clone(),
            profile: self.profile.clone(),
            profiles_dir: self.profiles_dir.clone().map(Into::into),
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct WarehouseConfig {
    #[envconfig(from = "WAREHOUSE_TYPE")]
    pub warehouse_type: Option<String>,

    #[envconfig(from = "WAREHOUSE_CREDENTIALS", default = "")]
    pub credentials: String,
}

impl WarehouseConfig {
    pub fn new() -> Result<Self, envconfig::Error> {
        let config = Self::init_from_env()?;
        // Only the keys are logged, never the values.
        debug!(
            "WarehouseConfig loaded: warehouse_type={:?}, credential_keys={:?}",
            config.warehouse_type,
            config.credential_pairs().keys().collect::<Vec<_>>()
        );
        Ok(config)
    }

    /// Parses `key=value;key=value` into a map. Malformed pairs are dropped.
    pub fn credential_pairs(&self) -> BTreeMap<String, String> {
        self.credentials
            .split(';')
            .filter_map(|pair| {
                let (key, value) = pair.split_once('=')?;
                let key = key.trim();
                if key.is_empty() {
                    None
                } else {
                    Some((key.to_string(), value.to_string()))
                }
            })
            .collect()
    }
}
