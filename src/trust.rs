use crate::{
    config::TrustConfig,
    error::SignalError,
    model::TrustTier,
    registry::KeyRegistry,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Registry,
    Reputation,
    Biometric,
    Allowlist,
}

impl SignalKind {
    fn label(&self) -> &'static str {
        match self {
            SignalKind::Registry => "registry",
            SignalKind::Reputation => "reputation",
            SignalKind::Biometric => "biometric",
            SignalKind::Allowlist => "allowlist",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Flag(bool),
    Score(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustSignal {
    pub source: SignalKind,
    pub value: SignalValue,
    pub observed_at: DateTime<Utc>,
    pub ttl_seconds: i64,
}

impl TrustSignal {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.observed_at + Duration::seconds(self.ttl_seconds)
    }
}

/// Immutable result of one trust computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustProfile {
    pub agent_id: String,
    pub tier: TrustTier,
    pub contributing_signals: Vec<TrustSignal>,
    pub computed_at: DateTime<Utc>,
}

impl TrustProfile {
    /// Compact `source=value` list used for the outbound trust header.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        for kind in [
            SignalKind::Registry,
            SignalKind::Reputation,
            SignalKind::Biometric,
            SignalKind::Allowlist,
        ] {
            let value = self
                .contributing_signals
                .iter()
                .find(|s| s.source == kind)
                .map(|s| match (kind, s.value) {
                    (SignalKind::Registry, SignalValue::Flag(true)) => "active".to_string(),
                    (SignalKind::Registry, SignalValue::Flag(false)) => "inactive".to_string(),
                    (_, SignalValue::Flag(flag)) => flag.to_string(),
                    (_, SignalValue::Score(score)) => score.to_string(),
                });
            match value {
                Some(value) => parts.push(format!("{}={}", kind.label(), value)),
                None if kind != SignalKind::Allowlist => parts.push(format!("{}=absent", kind.label())),
                None => {}
            }
        }
        parts.join(";")
    }

    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        now - self.computed_at
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TierPolicy {
    pub reputation_threshold: u64,
}

/// Highest tier whose cumulative preconditions the live signals satisfy.
///
/// Each precondition asks whether *any* live signal from a source meets it,
/// so adding a signal can only satisfy more preconditions.
pub fn compute_tier(signals: &[TrustSignal], policy: &TierPolicy, now: DateTime<Utc>) -> TrustTier {
    let live = |kind: SignalKind, test: &dyn Fn(SignalValue) -> bool| {
        signals
            .iter()
            .any(|s| s.source == kind && s.is_live_at(now) && test(s.value))
    };
    let flag = |v: SignalValue| matches!(v, SignalValue::Flag(true));

    let registered = live(SignalKind::Registry, &flag);
    let reputable = registered
        && live(SignalKind::Reputation, &|v| {
            matches!(v, SignalValue::Score(score) if score >= policy.reputation_threshold)
        });
    let verified = reputable && live(SignalKind::Biometric, &flag);
    let allowlisted = registered && live(SignalKind::Allowlist, &flag);

    if allowlisted {
        TrustTier::ALLOWLISTED
    } else if verified {
        TrustTier::VERIFIED
    } else if reputable {
        TrustTier::REPUTABLE
    } else if registered {
        TrustTier::REGISTERED
    } else {
        TrustTier::UNKNOWN
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub value: SignalValue,
    pub observed_at: DateTime<Utc>,
}

/// External source of one kind of trust signal.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SignalProvider: Send + Sync {
    fn kind(&self) -> SignalKind;

    /// `Ok(None)` means the source has nothing to say about the agent.
    async fn fetch(&self, agent_id: &str) -> Result<Option<Observation>, SignalError>;
}

#[derive(Debug, Deserialize)]
struct ReputationRecord {
    #[serde(default)]
    claimed: bool,
    #[serde(default)]
    karma: u64,
    observed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct BiometricRecord {
    #[serde(default)]
    verified: bool,
    observed_at: Option<DateTime<Utc>>,
}

/// Signal source reached over HTTP at `GET {url}/agents/{agent_id}`.
///
/// Reputation sources answer `{"claimed": true, "karma": 150}`; an unclaimed
/// profile carries no reputation. Biometric sources answer `{"verified": true}`.
pub struct HttpSignalProvider {
    kind: SignalKind,
    endpoint: String,
    client: Client,
}

impl HttpSignalProvider {
    pub fn reputation(endpoint: &str) -> Self {
        Self::new(SignalKind::Reputation, endpoint)
    }

    pub fn biometric(endpoint: &str) -> Self {
        Self::new(SignalKind::Biometric, endpoint)
    }

    fn new(kind: SignalKind, endpoint: &str) -> Self {
        Self {
            kind,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl SignalProvider for HttpSignalProvider {
    fn kind(&self) -> SignalKind {
        self.kind
    }

    async fn fetch(&self, agent_id: &str) -> Result<Option<Observation>, SignalError> {
        let response = self
            .client
            .get(format!("{}/agents/{}", self.endpoint, agent_id))
            .send()
            .await
            .map_err(|e| SignalError::Unavailable(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(SignalError::Unavailable(format!("source returned {}", response.status())));
        }

        let now = Utc::now();
        match self.kind {
            SignalKind::Reputation => {
                let record: ReputationRecord = response
                    .json()
                    .await
                    .map_err(|e| SignalError::Unavailable(e.to_string()))?;
                Ok(record.claimed.then(|| Observation {
                    value: SignalValue::Score(record.karma),
                    observed_at: record.observed_at.unwrap_or(now),
                }))
            }
            _ => {
                let record: BiometricRecord = response
                    .json()
                    .await
                    .map_err(|e| SignalError::Unavailable(e.to_string()))?;
                Ok(Some(Observation {
                    value: SignalValue::Flag(record.verified),
                    observed_at: record.observed_at.unwrap_or(now),
                }))
            }
        }
    }
}

/// Merges registry, reputation, biometric and allowlist signals into a tier.
///
/// Signal failures never fail the computation; they leave the signal absent.
pub struct TrustAggregator {
    registry: Arc<dyn KeyRegistry>,
    providers: Vec<Arc<dyn SignalProvider>>,
    allowlist: HashSet<String>,
    policy: TierPolicy,
    signal_timeout: std::time::Duration,
    signal_ttl: Duration,
    profile_ttl: Duration,
    checkout_max_staleness: Duration,
    profiles: DashMap<String, Arc<TrustProfile>>,
}

impl TrustAggregator {
    pub fn new(
        registry: Arc<dyn KeyRegistry>,
        providers: Vec<Arc<dyn SignalProvider>>,
        config: &TrustConfig,
    ) -> Self {
        Self {
            registry,
            providers,
            allowlist: config.allowlist.iter().cloned().collect(),
            policy: TierPolicy {
                reputation_threshold: config.reputation_threshold,
            },
            signal_timeout: std::time::Duration::from_millis(config.signal_timeout_ms),
            signal_ttl: Duration::seconds(config.signal_ttl_seconds),
            profile_ttl: Duration::seconds(config.profile_cache_ttl_seconds),
            checkout_max_staleness: Duration::seconds(config.checkout_max_staleness_seconds),
            profiles: DashMap::new(),
        }
    }

    /// Builds the aggregator with HTTP providers for every configured source URL.
    pub fn from_config(registry: Arc<dyn KeyRegistry>, config: &TrustConfig) -> Self {
        let mut providers: Vec<Arc<dyn SignalProvider>> = Vec::new();
        if let Some(url) = &config.reputation_url {
            providers.push(Arc::new(HttpSignalProvider::reputation(url)));
        }
        if let Some(url) = &config.biometric_url {
            providers.push(Arc::new(HttpSignalProvider::biometric(url)));
        }
        Self::new(registry, providers, config)
    }

    /// Profile for ordinary requests; served from cache within the profile TTL.
    pub async fn profile(&self, agent_id: &str) -> Arc<TrustProfile> {
        self.profile_within(agent_id, self.profile_ttl).await
    }

    /// Profile for a spend decision; recomputed if older than the checkout staleness bound.
    pub async fn profile_for_checkout(&self, agent_id: &str) -> Arc<TrustProfile> {
        self.profile_within(agent_id, self.checkout_max_staleness).await
    }

    async fn profile_within(&self, agent_id: &str, max_age: Duration) -> Arc<TrustProfile> {
        let now = Utc::now();
        if let Some(cached) = self.profiles.get(agent_id) {
            if cached.age_at(now) < max_age {
                return cached.value().clone();
            }
        }
        let profile = Arc::new(self.compute(agent_id).await);
        self.store(profile.clone());
        profile
    }

    /// Fans out to every source, each under its own timeout.
    pub async fn compute(&self, agent_id: &str) -> TrustProfile {
        let now = Utc::now();

        let registry = self.registry_signal(agent_id, now);
        let external = join_all(self.providers.iter().map(|p| self.provider_signal(p.clone(), agent_id)));
        let (registry, external) = tokio::join!(registry, external);

        let mut signals: Vec<TrustSignal> = registry.into_iter().chain(external.into_iter().flatten()).collect();
        if self.allowlist.contains(agent_id) {
            signals.push(TrustSignal {
                source: SignalKind::Allowlist,
                value: SignalValue::Flag(true),
                observed_at: now,
                ttl_seconds: self.signal_ttl.num_seconds(),
            });
        }
        signals.retain(|s| s.is_live_at(now));

        let tier = compute_tier(&signals, &self.policy, now);
        let profile = TrustProfile {
            agent_id: agent_id.to_string(),
            tier,
            contributing_signals: signals,
            computed_at: now,
        };
        info!(agent_id, tier = %profile.tier, signals = %profile.summary(), "Trust profile computed");
        profile
    }

    async fn registry_signal(&self, agent_id: &str, now: DateTime<Utc>) -> Option<TrustSignal> {
        match tokio::time::timeout(self.signal_timeout, self.registry.lookup(agent_id)).await {
            Ok(Ok(Some(identity))) => Some(TrustSignal {
                source: SignalKind::Registry,
                value: SignalValue::Flag(identity.is_active()),
                observed_at: now,
                ttl_seconds: self.signal_ttl.num_seconds(),
            }),
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                warn!(agent_id, error = %e, "Registry signal unavailable");
                None
            }
            Err(_) => {
                warn!(agent_id, "Registry signal timed out");
                None
            }
        }
    }

    async fn provider_signal(&self, provider: Arc<dyn SignalProvider>, agent_id: &str) -> Option<TrustSignal> {
        let kind = provider.kind();
        match tokio::time::timeout(self.signal_timeout, provider.fetch(agent_id)).await {
            Ok(Ok(Some(observation))) => Some(TrustSignal {
                source: kind,
                value: observation.value,
                observed_at: observation.observed_at,
                ttl_seconds: self.signal_ttl.num_seconds(),
            }),
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                warn!(agent_id, source = kind.label(), error = %e, "Trust signal unavailable");
                None
            }
            Err(_) => {
                warn!(agent_id, source = kind.label(), "Trust signal timed out");
                None
            }
        }
    }

    /// Last writer wins, but never replaces a newer computation with an older one.
    fn store(&self, profile: Arc<TrustProfile>) {
        self.profiles
            .entry(profile.agent_id.clone())
            .and_modify(|existing| {
                if profile.computed_at >= existing.computed_at {
                    *existing = profile.clone();
                }
            })
            .or_insert_with(|| profile.clone());
    }

    pub fn purge_expired(&self) {
        let now = Utc::now();
        self.profiles.retain(|_, profile| profile.age_at(now) < self.profile_ttl);
        debug!(cached = self.profiles.len(), "Trust profile cache purged");
    }
}
