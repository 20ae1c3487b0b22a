//! Connection profile provisioning for the engine.
//!
//! The profile file only references secrets through `env_var` placeholders.
//! The values themselves travel to the engine as environment overrides.

use log::info;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tempfile::TempDir;
use thiserror::Error;

/// Prefix of the environment variables carrying credential values.
pub const ENV_PREFIX: &str = "MAPI_";

pub const PROFILE_FILE: &str = "profiles.yml";

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Failed to write connection profile: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode connection profile: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid credential key: {0:?}")]
    InvalidKey(String),

    #[error("Credential keys {first:?} and {second:?} both map to {var}")]
    DuplicateKey {
        first: String,
        second: String,
        var: String,
    },
}

/// Warehouse type plus the credential mapping for it.
#[derive(Clone)]
pub struct WarehouseProfile {
    pub warehouse_type: String,
    pub credentials: BTreeMap<String, String>,
}

impl fmt::Debug for WarehouseProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WarehouseProfile")
            .field("warehouse_type", &self.warehouse_type)
            .field("credentials", &self.credentials.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A written profile directory. The directory is removed when this is dropped.
pub struct ProvisionedProfile {
    dir: TempDir,
    env: BTreeMap<String, String>,
}

impl ProvisionedProfile {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Environment overrides to hand to every engine call.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }
}

impl fmt::Debug for ProvisionedProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionedProfile")
            .field("dir", &self.dir.path())
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// `password` -> `MAPI_PASSWORD`, `private-key` -> `MAPI_PRIVATE_KEY`.
pub fn env_var_name(key: &str) -> Result<String, CredentialError> {
    if key.is_empty() {
        return Err(CredentialError::InvalidKey(key.to_string()));
    }
    let mut name = String::from(ENV_PREFIX);
    for ch in key.chars() {
        if ch.is_ascii_alphanumeric() {
            name.push(ch.to_ascii_uppercase());
        } else if ch == '_' || ch == '-' || ch == '.' {
            name.push('_');
        } else {
            return Err(CredentialError::InvalidKey(key.to_string()));
        }
    }
    Ok(name)
}

/// Renders the profile document with placeholders for every credential.
pub fn render_profile(
    profile_name: &str,
    target: &str,
    warehouse: &WarehouseProfile,
) -> Result<(String, BTreeMap<String, String>), CredentialError> {
    let mut output = Mapping::new();
    output.insert("type".into(), warehouse.warehouse_type.clone().into());

    let mut env = BTreeMap::new();
    let mut owners: BTreeMap<String, &str> = BTreeMap::new();
    for (key, secret) in &warehouse.credentials {
        let var = env_var_name(key)?;
        if let Some(first) = owners.insert(var.clone(), key.as_str()) {
            return Err(CredentialError::DuplicateKey {
                first: first.to_string(),
                second: key.clone(),
                var,
            });
        }
        output.insert(
            key.clone().into(),
            Value::String(format!("{{{{ env_var('{}') }}}}", var)),
        );
        env.insert(var, secret.clone());
    }

    let mut outputs = Mapping::new();
    outputs.insert(target.into(), Value::Mapping(output));

    let mut profile = Mapping::new();
    profile.insert("target".into(), target.into());
    profile.insert("outputs".into(), Value::Mapping(outputs));

    let mut document = Mapping::new();
    document.insert(profile_name.into(), Value::Mapping(profile));

    Ok((serde_yaml::to_string(&document)?, env))
}

/// Writes `profiles.yml` into a fresh private directory.
pub fn provision(
    profile_name: &str,
    target: &str,
    warehouse: &WarehouseProfile,
) -> Result<ProvisionedProfile, CredentialError> {
    let (document, env) = render_profile(profile_name, target, warehouse)?;
    let dir = tempfile::Builder::new().prefix("mapi-profile-").tempdir()?;
    let file = dir.path().join(PROFILE_FILE);
    std::fs::write(&file, document)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700))?;
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o600))?;
    }

    info!(
        "Provisioned {} profile {} (target {}) in {}",
        warehouse.warehouse_type,
        profile_name,
        target,
        dir.path().display()
    );
    Ok(ProvisionedProfile { dir, env })
}
