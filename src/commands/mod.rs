pub mod apply;
pub mod destroy;
pub mod plan;
pub mod unlock;

use crate::config::Config;
use crate::execution::Engine;
use crate::loader::ProviderConfig;
use crate::provider::ProviderRegistry;
use crate::providers::local::LocalProvider;
use crate::state::StateStore;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Options shared by every command, resolved from config file plus flags.
pub struct CommandContext {
    pub config: Config,
    pub state_path: PathBuf,
}

impl CommandContext {
    pub fn new(config: Config, state_flag: Option<PathBuf>) -> Self {
        let state_path = config.state_path(state_flag);
        Self { config, state_path }
    }

    pub fn store(&self) -> StateStore {
        StateStore::new(&self.state_path, self.config.lock_lease())
    }

    /// One local provider per configured type, plus a policy-free fallback
    /// for types the document does not configure.
    pub fn registry(&self, provider_config: &BTreeMap<String, ProviderConfig>) -> ProviderRegistry {
        let workspace = self.config.workspace_path(&self.state_path);
        let mut registry = ProviderRegistry::new();
        for (kind, config) in provider_config {
            registry.register(Arc::new(LocalProvider::from_config(
                kind,
                &workspace,
                config,
            )));
        }
        registry.set_fallback(Arc::new(LocalProvider::new("local", &workspace)));
        registry
    }

    pub fn engine(
        &self,
        provider_config: &BTreeMap<String, ProviderConfig>,
        concurrency: Option<usize>,
    ) -> Engine {
        Engine::new(
            self.registry(provider_config),
            self.store(),
            self.config.concurrency(concurrency),
        )
    }
}
