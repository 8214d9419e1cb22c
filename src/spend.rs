use crate::{
    config::{SpendConfig, SpendTierConfig},
    model::{Amount, TrustTier},
    trust::TrustProfile,
};
use serde::Serialize;
use tracing::info;

/// Ordered `tier -> max_amount` table. Read-only after startup.
#[derive(Debug, Clone)]
pub struct SpendPolicy {
    tiers: Vec<SpendTierConfig>,
}

impl SpendPolicy {
    pub fn new(mut tiers: Vec<SpendTierConfig>) -> Self {
        tiers.sort_by_key(|t| t.tier);
        Self { tiers }
    }

    pub fn from_config(config: &SpendConfig) -> Self {
        Self::new(config.tiers.clone())
    }

    /// Lowest tier whose limit covers `amount`, or `None` if no tier does.
    pub fn required_tier(&self, amount: Amount) -> Option<TrustTier> {
        self.tiers
            .iter()
            .find(|t| t.max_amount.map_or(true, |max| amount <= max))
            .map(|t| t.tier)
    }

    /// Effective limit for an agent at `tier`; `None` means unlimited.
    ///
    /// Tiers above the highest configured entry inherit its limit.
    pub fn limit_for(&self, tier: TrustTier) -> Option<Amount> {
        self.tiers
            .iter()
            .rev()
            .find(|t| t.tier <= tier)
            .map_or(Some(Amount::ZERO), |t| t.max_amount)
    }

    pub fn tiers(&self) -> &[SpendTierConfig] {
        &self.tiers
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum SpendDecision {
    Allowed,
    Denied { required_tier: Option<TrustTier> },
}

impl SpendDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, SpendDecision::Allowed)
    }
}

#[derive(Debug, Clone)]
pub struct SpendGate {
    policy: SpendPolicy,
}

impl SpendGate {
    pub fn new(policy: SpendPolicy) -> Self {
        Self { policy }
    }

    pub fn from_config(config: &SpendConfig) -> Self {
        Self::new(SpendPolicy::from_config(config))
    }

    pub fn policy(&self) -> &SpendPolicy {
        &self.policy
    }

    pub fn authorize(&self, amount: Amount, profile: &TrustProfile) -> SpendDecision {
        let decision = match self.policy.required_tier(amount) {
            Some(required) if profile.tier >= required => SpendDecision::Allowed,
            required_tier => SpendDecision::Denied { required_tier },
        };
        info!(
            agent_id = %profile.agent_id,
            tier = %profile.tier,
            amount = %amount,
            decision = ?decision,
            "Spend authorization"
        );
        decision
    }
}
