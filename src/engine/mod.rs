pub mod process;

pub use process::ProcessEngine;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// One call of the external engine.
///
/// Arguments are kept as a discrete vector and handed to the OS as-is, so
/// caller-supplied metric names and filter values are never interpreted by a
/// shell.
#[derive(Clone, Default)]
pub struct EngineInvocation {
    pub program: String,
    pub args: Vec<String>,
    /// Added on top of the ambient environment of the service.
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

// Environment overrides carry warehouse secrets, only their keys are printed.
impl fmt::Debug for EngineInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineInvocation")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("working_dir", &self.working_dir)
            .finish()
    }
}

/// Executes the external computation engine and returns its standard output.
#[async_trait]
pub trait EngineInvoker: Send + Sync {
    async fn invoke(&self, invocation: EngineInvocation) -> Result<String, EngineError>;
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to start engine command '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Engine exited with code {}: {output}", display_code(.exit_code))]
    Execution {
        exit_code: Option<i32>,
        output: String,
    },

    #[error("Engine did not finish within {after:?}")]
    Timeout { after: Duration },

    #[error("Engine I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine produced output that is not valid UTF-8")]
    InvalidOutput,
}

fn display_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
}

/// Connection profile flags shared by discovery and execution calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionProfile {
    pub target: Option<String>,
    pub profile: Option<String>,
    pub profiles_dir: Option<PathBuf>,
}

impl ConnectionProfile {
    pub fn flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if let Some(target) = &self.target {
            flags.push("--target".to_string());
            flags.push(target.clone());
        }
        if let Some(profile) = &self.profile {
            flags.push("--profile".to_string());
            flags.push(profile.clone());
        }
        if let Some(dir) = &self.profiles_dir {
            flags.push("--profiles-dir".to_string());
            flags.push(dir.to_string_lossy().into_owned());
        }
        flags
    }
}

/// Everything needed to address the engine: which program, where to run it,
/// the connection profile and the credential-bearing environment.
#[derive(Clone, Default)]
pub struct EngineContext {
    pub program: String,
    pub working_dir: Option<PathBuf>,
    pub profile: ConnectionProfile,
    pub env: BTreeMap<String, String>,
}

impl EngineContext {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn with_working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    pub fn with_profile(mut self, profile: ConnectionProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Builds an invocation of `args` followed by the profile flags.
    pub fn invocation(&self, mut args: Vec<String>) -> EngineInvocation {
        args.extend(self.profile.flags());
        EngineInvocation {
            program: self.program.clone(),
            args,
            env: self.env.clone(),
            working_dir: self.working_dir.clone(),
        }
    }
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("program", &self.program)
            .field("working_dir", &self.working_dir)
            .field("profile", &self.profile)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .finish()
    }
}
