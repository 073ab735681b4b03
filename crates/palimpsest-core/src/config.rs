use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

use palimpsest_providers::{ProviderEndpointConfig, ProvidersConfig};
use palimpsest_types::AgentRole;

/// Per-role model assignment and resource budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleBudgetConfig {
    pub model: String,
    pub deadline_secs: u64,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_daily_budget")]
    pub daily_budget_usd: f64,
    #[serde(default = "default_cache_entries")]
    pub cache_entries: usize,
    #[serde(default = "default_role_budgets")]
    pub roles: HashMap<AgentRole, RoleBudgetConfig>,
    /// USD per token, keyed by model id; doubles as the registered model set.
    #[serde(default = "default_model_rates")]
    pub model_rates: HashMap<String, f64>,
    #[serde(default = "default_provider_endpoints")]
    pub providers: HashMap<String, ProviderEndpointConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            daily_budget_usd: default_daily_budget(),
            cache_entries: default_cache_entries(),
            roles: default_role_budgets(),
            model_rates: default_model_rates(),
            providers: default_provider_endpoints(),
        }
    }
}

impl EngineConfig {
    /// Budget for one role, falling back to the built-in default when a
    /// config file omits the role.
    pub fn role(&self, role: AgentRole) -> RoleBudgetConfig {
        self.roles.get(&role).cloned().unwrap_or_else(|| {
            default_role_budgets()
                .remove(&role)
                .unwrap_or(RoleBudgetConfig {
                    model: "claude-3-5-haiku-latest".to_string(),
                    deadline_secs: 20,
                    max_tokens: 500,
                })
        })
    }

    pub fn providers_config(&self) -> ProvidersConfig {
        ProvidersConfig {
            providers: self.providers.clone(),
        }
    }

    /// Environment overrides, applied after the file layer.
    pub fn apply_env(&mut self) {
        if let Some(cap) = env_parse::<f64>("PALIMPSEST_DAILY_BUDGET_USD") {
            self.daily_budget_usd = cap;
        }
        if let Some(entries) = env_parse::<usize>("PALIMPSEST_CACHE_ENTRIES") {
            self.cache_entries = entries;
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn default_daily_budget() -> f64 {
    5.0
}

fn default_cache_entries() -> usize {
    256
}

fn default_role_budgets() -> HashMap<AgentRole, RoleBudgetConfig> {
    let mut roles = HashMap::new();
    // OCR dominates the Scanner's wall-clock, hence the longer deadline.
    roles.insert(
        AgentRole::Scanner,
        RoleBudgetConfig {
            model: "claude-3-5-sonnet-latest".to_string(),
            deadline_secs: 30,
            max_tokens: 700,
        },
    );
    roles.insert(
        AgentRole::Linguist,
        RoleBudgetConfig {
            model: "claude-3-5-haiku-latest".to_string(),
            deadline_secs: 20,
            max_tokens: 500,
        },
    );
    roles.insert(
        AgentRole::Historian,
        RoleBudgetConfig {
            model: "claude-3-5-haiku-latest".to_string(),
            deadline_secs: 25,
            max_tokens: 500,
        },
    );
    roles.insert(
        AgentRole::Validator,
        RoleBudgetConfig {
            model: "claude-3-5-haiku-latest".to_string(),
            deadline_secs: 20,
            max_tokens: 400,
        },
    );
    roles.insert(
        AgentRole::RepairAdvisor,
        RoleBudgetConfig {
            model: "claude-3-5-haiku-latest".to_string(),
            deadline_secs: 20,
            max_tokens: 500,
        },
    );
    roles
}

fn default_model_rates() -> HashMap<String, f64> {
    let mut rates = HashMap::new();
    rates.insert("claude-3-5-sonnet-latest".to_string(), 0.000009);
    rates.insert("claude-3-5-haiku-latest".to_string(), 0.0000015);
    rates.insert("gpt-4o-mini".to_string(), 0.0000006);
    rates
}

fn default_provider_endpoints() -> HashMap<String, ProviderEndpointConfig> {
    let mut providers = HashMap::new();
    providers.insert("anthropic".to_string(), ProviderEndpointConfig::default());
    providers
}

/// JSON-file-backed configuration with an in-memory working copy.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    current: Arc<RwLock<EngineConfig>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut config = match fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => EngineConfig::default(),
        };
        config.apply_env();

        let store = Self {
            path,
            current: Arc::new(RwLock::new(config)),
        };
        store.persist().await?;
        Ok(store)
    }

    pub async fn get(&self) -> EngineConfig {
        self.current.read().await.clone()
    }

    pub async fn update(
        &self,
        f: impl FnOnce(&mut EngineConfig),
    ) -> anyhow::Result<EngineConfig> {
        let updated = {
            let mut config = self.current.write().await;
            f(&mut config);
            config.clone()
        };
        self.persist().await?;
        Ok(updated)
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let config = self.current.read().await.clone();
        let raw = serde_json::to_string_pretty(&config)?;
        fs::write(&self.path, raw).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn role_defaults_cover_all_five_roles() {
        let config = EngineConfig::default();
        for role in AgentRole::ALL {
            let budget = config.role(role);
            assert!(budget.deadline_secs >= 20);
            assert!(budget.max_tokens > 0);
            assert!(config.model_rates.contains_key(&budget.model));
        }
        assert_eq!(config.role(AgentRole::Scanner).deadline_secs, 30);
    }

    #[tokio::test]
    async fn store_round_trips_through_disk() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");

        let store = ConfigStore::new(&path).await.unwrap();
        store
            .update(|c| c.daily_budget_usd = 12.5)
            .await
            .unwrap();

        let reopened = ConfigStore::new(&path).await.unwrap();
        assert_eq!(reopened.get().await.daily_budget_usd, 12.5);
    }

    #[tokio::test]
    async fn corrupt_file_falls_back_to_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let store = ConfigStore::new(&path).await.unwrap();
        assert_eq!(store.get().await.cache_entries, default_cache_entries());
    }

    #[test]
    fn role_map_survives_json_round_trip() {
        let config = EngineConfig::default();
        let raw = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            back.role(AgentRole::Historian).deadline_secs,
            config.role(AgentRole::Historian).deadline_secs
        );
    }
}
