pub mod historian;
pub mod linguist;
pub mod repair_advisor;
pub mod scanner;
mod support;
pub mod validator;

pub use historian::HistorianAgent;
pub use linguist::LinguistAgent;
pub use repair_advisor::RepairAdvisorAgent;
pub use scanner::ScannerAgent;
pub use validator::ValidatorAgent;

use std::sync::Arc;

use palimpsest_core::{EngineConfig, ImageEnhancer, ReferenceData, RestorationAgent};
use palimpsest_providers::ModelInvoker;
use palimpsest_types::AgentRole;

/// Everything the worker roster is built from.
#[derive(Clone)]
pub struct AgentDeps {
    pub invoker: Arc<ModelInvoker>,
    pub enhancer: Arc<dyn ImageEnhancer>,
    pub reference: Arc<ReferenceData>,
    pub config: EngineConfig,
}

/// The fixed five-agent roster in pipeline order.
pub fn build_roster(deps: &AgentDeps) -> Vec<Arc<dyn RestorationAgent>> {
    vec![
        Arc::new(ScannerAgent::new(
            deps.invoker.clone(),
            deps.enhancer.clone(),
            deps.config.role(AgentRole::Scanner),
        )),
        Arc::new(LinguistAgent::new(
            deps.invoker.clone(),
            deps.reference.clone(),
            deps.config.role(AgentRole::Linguist),
        )),
        Arc::new(HistorianAgent::new(
            deps.invoker.clone(),
            deps.reference.clone(),
            deps.config.role(AgentRole::Historian),
        )),
        Arc::new(ValidatorAgent::new(
            deps.invoker.clone(),
            deps.config.role(AgentRole::Validator),
        )),
        Arc::new(RepairAdvisorAgent::new(
            deps.invoker.clone(),
            deps.reference.clone(),
            deps.config.role(AgentRole::RepairAdvisor),
        )),
    ]
}
