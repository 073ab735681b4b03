pub mod http;

use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use palimpsest_agents::AgentDeps;
use palimpsest_cache::ArchiveCache;
use palimpsest_core::{ConfigStore, PassthroughEnhancer, ReferenceData};
use palimpsest_providers::{BudgetLedger, ModelInvoker, ProviderRegistry};

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: ConfigStore,
    pub cache: ArchiveCache,
    pub deps: AgentDeps,
}

impl AppState {
    /// Wire the engine up from a state directory: config file, budget
    /// ledger, provider registry, cache, and the default collaborators.
    pub async fn from_state_dir(state_dir: &Path) -> anyhow::Result<Self> {
        let config_store = ConfigStore::new(state_dir.join("config.json")).await?;
        let config = config_store.get().await;

        let registry = ProviderRegistry::new(&config.providers_config());
        let ledger = BudgetLedger::new(config.daily_budget_usd, config.model_rates.clone());
        let invoker = Arc::new(ModelInvoker::new(registry, ledger));
        let cache = ArchiveCache::new(config.cache_entries);

        let deps = AgentDeps {
            invoker,
            enhancer: Arc::new(PassthroughEnhancer),
            reference: Arc::new(ReferenceData::default()),
            config,
        };

        Ok(Self {
            config: config_store,
            cache,
            deps,
        })
    }

    /// Assembly seam for tests and embedders that bring their own
    /// collaborators.
    pub fn with_parts(config: ConfigStore, cache: ArchiveCache, deps: AgentDeps) -> Self {
        Self {
            config,
            cache,
            deps,
        }
    }
}

pub async fn serve(addr: std::net::SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("listening on http://{addr}");
    axum::serve(listener, http::router(state)).await?;
    Ok(())
}
