use arc_swap::ArcSwap;
use std::sync::Arc;

use crate::config::PolicyConfig;
use crate::error::Result;
use crate::proxy::cooldown::CooldownController;
use crate::proxy::rotation::{create_ranker, CandidateRanker};
use crate::proxy::scoring::Scorer;

/// A validated policy with the components built from it
pub struct PolicyEngine {
    pub config: PolicyConfig,
    pub scorer: Scorer,
    pub cooldown: CooldownController,
    pub ranker: Box<dyn CandidateRanker>,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            scorer: Scorer::from_policy(&config),
            cooldown: CooldownController::from_policy(&config),
            ranker: create_ranker(config.ranking),
            config,
        })
    }
}

impl std::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("config", &self.config)
            .field("ranker", &self.ranker.strategy_name())
            .finish()
    }
}

/// Policy shared by the scheduler and the feedback path, swappable at runtime
pub type SharedPolicy = Arc<ArcSwap<PolicyEngine>>;

pub fn shared(engine: PolicyEngine) -> SharedPolicy {
    Arc::new(ArcSwap::from_pointee(engine))
}
