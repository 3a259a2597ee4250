use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_LOCK_LEASE_SECS: u64 = 300;

/// Persisted defaults; CLI flags override per invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub state_path: Option<PathBuf>,
    pub workspace_path: Option<PathBuf>,
    pub concurrency: Option<usize>,
    pub lock_lease_secs: Option<u64>,
}

impl Config {
    pub fn load() -> Result<Self> {
        confy::load("converge", None).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn state_path(&self, flag: Option<PathBuf>) -> PathBuf {
        flag.or_else(|| self.state_path.clone())
            .unwrap_or_else(default_state_path)
    }

    /// Where the local provider materializes documents: next to the state
    /// file unless configured otherwise.
    pub fn workspace_path(&self, state_path: &std::path::Path) -> PathBuf {
        self.workspace_path.clone().unwrap_or_else(|| {
            state_path
                .parent()
                .map(|p| p.join("workspace"))
                .unwrap_or_else(|| PathBuf::from("workspace"))
        })
    }

    pub fn concurrency(&self, flag: Option<usize>) -> usize {
        flag.or(self.concurrency).unwrap_or(DEFAULT_CONCURRENCY)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs.unwrap_or(DEFAULT_LOCK_LEASE_SECS))
    }
}

fn default_state_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "converge")
        .map(|dirs| dirs.data_dir().join("state.json"))
        .unwrap_or_else(|| PathBuf::from("converge.state.json"))
}
