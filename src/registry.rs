use crate::{
    config::RegistryConfig,
    error::RegistryError,
    model::AgentIdentity,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use tracing::{debug, warn};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyRegistry: Send + Sync {
    /// `Ok(None)` means the registry has no record of `key_id`.
    async fn lookup(&self, key_id: &str) -> Result<Option<AgentIdentity>, RegistryError>;
}

/// Registry service reached over HTTP at `GET {url}/keys/{key_id}`.
pub struct HttpKeyRegistry {
    endpoint: String,
    client: Client,
}

impl HttpKeyRegistry {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl KeyRegistry for HttpKeyRegistry {
    async fn lookup(&self, key_id: &str) -> Result<Option<AgentIdentity>, RegistryError> {
        let response = self
            .client
            .get(format!("{}/keys/{}", self.endpoint, key_id))
            .send()
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let identity: AgentIdentity = response
                    .json()
                    .await
                    .map_err(|e| RegistryError::InvalidRecord(e.to_string()))?;
                if identity.key_id != key_id {
                    return Err(RegistryError::InvalidRecord(format!(
                        "registry answered for {} when asked for {}",
                        identity.key_id, key_id
                    )));
                }
                Ok(Some(identity))
            }
            status => Err(RegistryError::Unavailable(format!("registry returned {}", status))),
        }
    }
}

/// Registry backed by a local map. Serves configured static keys and tests.
#[derive(Default)]
pub struct InMemoryKeyRegistry {
    keys: DashMap<String, AgentIdentity>,
}

impl InMemoryKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keys(keys: impl IntoIterator<Item = AgentIdentity>) -> Self {
        let registry = Self::new();
        for identity in keys {
            registry.insert(identity);
        }
        registry
    }

    pub fn insert(&self, identity: AgentIdentity) {
        self.keys.insert(identity.key_id.clone(), identity);
    }

    pub fn set_status(&self, key_id: &str, status: crate::model::RegistrationStatus) {
        if let Some(mut identity) = self.keys.get_mut(key_id) {
            identity.registration_status = status;
        }
    }
}

#[async_trait]
impl KeyRegistry for InMemoryKeyRegistry {
    async fn lookup(&self, key_id: &str) -> Result<Option<AgentIdentity>, RegistryError> {
        Ok(self.keys.get(key_id).map(|entry| entry.value().clone()))
    }
}

struct CachedIdentity {
    identity: AgentIdentity,
    fetched_at: DateTime<Utc>,
}

/// Read-through cache. Misses and failed lookups are not cached.
pub struct CachedKeyRegistry {
    inner: Arc<dyn KeyRegistry>,
    cache: DashMap<String, CachedIdentity>,
    ttl: Duration,
    lookup_timeout: std::time::Duration,
}

impl CachedKeyRegistry {
    pub fn new(inner: Arc<dyn KeyRegistry>, ttl: Duration, lookup_timeout: std::time::Duration) -> Self {
        Self {
            inner,
            cache: DashMap::new(),
            ttl,
            lookup_timeout,
        }
    }

    pub fn from_config(config: &RegistryConfig) -> Self {
        let inner: Arc<dyn KeyRegistry> = if config.static_keys.is_empty() {
            Arc::new(HttpKeyRegistry::new(config.url.clone()))
        } else {
            Arc::new(InMemoryKeyRegistry::with_keys(config.static_keys.clone()))
        };
        Self::new(
            inner,
            Duration::seconds(config.cache_ttl_seconds),
            std::time::Duration::from_millis(config.lookup_timeout_ms),
        )
    }

    pub fn invalidate(&self, key_id: &str) {
        self.cache.remove(key_id);
    }

    pub fn purge_expired(&self) {
        let now = Utc::now();
        self.cache.retain(|_, cached| now - cached.fetched_at < self.ttl);
    }
}

#[async_trait]
impl KeyRegistry for CachedKeyRegistry {
    async fn lookup(&self, key_id: &str) -> Result<Option<AgentIdentity>, RegistryError> {
        let now = Utc::now();
        if let Some(cached) = self.cache.get(key_id) {
            if now - cached.fetched_at < self.ttl {
                return Ok(Some(cached.identity.clone()));
            }
        }

        let fetched = match tokio::time::timeout(self.lookup_timeout, self.inner.lookup(key_id)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(key_id, "Registry lookup timed out");
                return Err(RegistryError::Timeout);
            }
        };

        match fetched {
            Ok(Some(identity)) => {
                debug!(key_id, status = ?identity.registration_status, "Registry record cached");
                self.cache.insert(
                    key_id.to_string(),
                    CachedIdentity {
                        identity: identity.clone(),
                        fetched_at: now,
                    },
                );
                Ok(Some(identity))
            }
            Ok(None) => {
                self.cache.remove(key_id);
                Ok(None)
            }
            Err(e) => {
                warn!(key_id, error = %e, "Registry lookup failed");
                Err(e)
            }
        }
    }
}
