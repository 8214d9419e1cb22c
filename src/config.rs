use crate::error::{GatewayError, Result};
use crate::model::{AgentIdentity, Amount, Network, TrustTier};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub registry: RegistryConfig,
    pub signature: SignatureConfig,
    pub trust: TrustConfig,
    pub spend: SpendConfig,
    pub settlement: SettlementConfig,
    pub merchant: MerchantConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// How long a proof submission waits for a terminal settlement before
    /// answering 202 with the session id.
    pub settlement_wait_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub url: String,
    pub lookup_timeout_ms: u64,
    pub cache_ttl_seconds: i64,
    /// Keys served locally instead of from the registry service.
    pub static_keys: Vec<AgentIdentity>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct SignatureConfig {
    pub clock_skew_seconds: i64,
    pub nonce_cache_ttl_ceiling_seconds: i64,
    pub max_signature_lifetime_seconds: i64,
    pub browse_components: Vec<String>,
    pub payment_components: Vec<String>,
    /// Headers a payment signature must cover whenever the request carries them.
    pub payment_bound_headers: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct TrustConfig {
    pub reputation_url: Option<String>,
    pub biometric_url: Option<String>,
    pub reputation_threshold: u64,
    pub signal_timeout_ms: u64,
    pub signal_ttl_seconds: i64,
    pub profile_cache_ttl_seconds: i64,
    pub checkout_max_staleness_seconds: i64,
    pub allowlist: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct SpendConfig {
    pub tiers: Vec<SpendTierConfig>,
}

#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
pub struct SpendTierConfig {
    pub tier: TrustTier,
    pub name: String,
    /// Absent means unlimited.
    #[serde(default)]
    pub max_amount: Option<Amount>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct SettlementConfig {
    pub facilitator_url: String,
    /// Transaction status service for facilitators that settle asynchronously.
    /// Without it a pending submission ends as `timed_out`.
    pub status_url: Option<String>,
    pub max_timeout_seconds: u64,
    pub asset: String,
    pub networks: Vec<NetworkConfig>,
    pub requirement_ttl_seconds: i64,
    pub session_ttl_seconds: i64,
    pub request_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub poll_attempts: u32,
    pub max_backoff_ms: u64,
    pub archive_retention_seconds: i64,
    pub sweep_interval_seconds: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
pub struct NetworkConfig {
    pub network: Network,
    pub recipient_address: String,
    /// Token contract or mint; defaults to USDC on the network.
    #[serde(default)]
    pub asset_address: Option<String>,
    /// Sponsoring fee payer advertised to Solana payers.
    #[serde(default)]
    pub fee_payer: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct MerchantConfig {
    pub upstream_url: String,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            settlement_wait_ms: 30_000,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9001".to_string(),
            lookup_timeout_ms: 2_000,
            cache_ttl_seconds: 60,
            static_keys: Vec::new(),
        }
    }
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            clock_skew_seconds: 30,
            nonce_cache_ttl_ceiling_seconds: 600,
            max_signature_lifetime_seconds: 480,
            browse_components: vec![
                "@method".to_string(),
                "@authority".to_string(),
                "@path".to_string(),
            ],
            payment_components: vec![
                "@method".to_string(),
                "@authority".to_string(),
                "@path".to_string(),
                "content-digest".to_string(),
            ],
            payment_bound_headers: vec!["x-payment".to_string(), "x-payment-network".to_string()],
        }
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            reputation_url: None,
            biometric_url: None,
            reputation_threshold: 100,
            signal_timeout_ms: 1_500,
            signal_ttl_seconds: 300,
            profile_cache_ttl_seconds: 60,
            checkout_max_staleness_seconds: 10,
            allowlist: Vec::new(),
        }
    }
}

impl Default for SpendConfig {
    fn default() -> Self {
        let tier = |tier: TrustTier, name: &str, cents: u64| SpendTierConfig {
            tier,
            name: name.to_string(),
            max_amount: Some(Amount::from_cents(cents)),
        };
        Self {
            tiers: vec![
                tier(TrustTier::UNKNOWN, "unknown", 0),
                tier(TrustTier::REGISTERED, "registered", 500),
                tier(TrustTier::REPUTABLE, "reputable", 2_000),
                tier(TrustTier::VERIFIED, "verified", 200_000),
            ],
        }
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            facilitator_url: "https://x402.org/facilitator".to_string(),
            status_url: None,
            max_timeout_seconds: 300,
            asset: "USDC".to_string(),
            networks: vec![
                NetworkConfig {
                    network: Network::SolanaDevnet,
                    recipient_address: "4zHkvLcPUeNDkR4swKoYHjbDhgoNPMxB3x1Ve3cqhvAe".to_string(),
                    asset_address: None,
                    fee_payer: None,
                },
                NetworkConfig {
                    network: Network::BaseSepolia,
                    recipient_address: "0xEF78657456C6618a299309E880ee99502C6F6B8f".to_string(),
                    asset_address: None,
                    fee_payer: None,
                },
            ],
            requirement_ttl_seconds: 120,
            session_ttl_seconds: 900,
            request_timeout_ms: 10_000,
            poll_interval_ms: 500,
            poll_attempts: 10,
            max_backoff_ms: 8_000,
            archive_retention_seconds: 3_600,
            sweep_interval_seconds: 15,
        }
    }
}

impl Default for MerchantConfig {
    fn default() -> Self {
        Self {
            upstream_url: "http://localhost:8000".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://trustgate.db".to_string(),
            max_connections: 5,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: Some("json".to_string()),
        }
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("Failed to read config file: {}", e)))?;

        let config: AppConfig = toml::from_str(&config_str)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config file: {}", e)))?;

        Ok(config)
    }

    pub fn load_with_env_overrides<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;

        if let Ok(url) = std::env::var("TRUSTGATE_REGISTRY_URL") {
            config.registry.url = url;
        }

        if let Ok(url) = std::env::var("TRUSTGATE_FACILITATOR_URL") {
            config.settlement.facilitator_url = url;
        }

        if let Ok(url) = std::env::var("TRUSTGATE_SETTLEMENT_STATUS_URL") {
            config.settlement.status_url = Some(url);
        }

        if let Ok(url) = std::env::var("TRUSTGATE_MERCHANT_URL") {
            config.merchant.upstream_url = url;
        }

        if let Ok(url) = std::env::var("TRUSTGATE_DATABASE_URL") {
            config.database.url = url;
        }

        if let Ok(log_level) = std::env::var("RUST_LOG") {
            config.logging.level = log_level;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(GatewayError::Config("Server port cannot be 0".to_string()));
        }

        if self.registry.url.is_empty() && self.registry.static_keys.is_empty() {
            return Err(GatewayError::Config(
                "Either a registry URL or static keys must be configured".to_string(),
            ));
        }

        if self.signature.clock_skew_seconds < 0 {
            return Err(GatewayError::Config("Clock skew cannot be negative".to_string()));
        }

        if self.signature.nonce_cache_ttl_ceiling_seconds
            < self.signature.max_signature_lifetime_seconds + self.signature.clock_skew_seconds
        {
            return Err(GatewayError::Config(
                "Nonce cache TTL ceiling must cover the maximum signature lifetime plus skew"
                    .to_string(),
            ));
        }

        for component in ["@method", "@authority", "@path"] {
            if !self.signature.payment_components.iter().any(|c| c == component) {
                return Err(GatewayError::Config(format!(
                    "Payment signatures must cover {}",
                    component
                )));
            }
        }

        self.validate_spend_tiers()?;
        self.validate_settlement()?;

        if self.merchant.upstream_url.is_empty() {
            return Err(GatewayError::Config("Merchant upstream URL cannot be empty".to_string()));
        }

        if self.database.url.is_empty() {
            return Err(GatewayError::Config("Database URL cannot be empty".to_string()));
        }

        Ok(())
    }

    fn validate_spend_tiers(&self) -> Result<()> {
        let tiers = &self.spend.tiers;
        if tiers.is_empty() {
            return Err(GatewayError::Config("Spend policy needs at least one tier".to_string()));
        }

        for pair in tiers.windows(2) {
            let (lower, upper) = (&pair[0], &pair[1]);
            if upper.tier <= lower.tier {
                return Err(GatewayError::Config(format!(
                    "Spend tiers must be strictly increasing (tier {} after tier {})",
                    upper.tier, lower.tier
                )));
            }
            match (lower.max_amount, upper.max_amount) {
                (None, _) => {
                    return Err(GatewayError::Config(format!(
                        "Only the highest tier may be unlimited (tier {})",
                        lower.tier
                    )));
                }
                (Some(low), Some(high)) if high < low => {
                    return Err(GatewayError::Config(format!(
                        "Tier {} limit is lower than tier {} limit",
                        upper.tier, lower.tier
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn validate_settlement(&self) -> Result<()> {
        let settlement = &self.settlement;
        if settlement.networks.is_empty() {
            return Err(GatewayError::Config("At least one settlement network is required".to_string()));
        }

        let mut seen = HashSet::new();
        for entry in &settlement.networks {
            if entry.recipient_address.is_empty() {
                return Err(GatewayError::Config(format!(
                    "Recipient address missing for {}",
                    entry.network
                )));
            }
            if !seen.insert(entry.network) {
                return Err(GatewayError::Config(format!("Duplicate network {}", entry.network)));
            }
        }

        if settlement.requirement_ttl_seconds <= 0 {
            return Err(GatewayError::Config("Requirement TTL must be positive".to_string()));
        }

        if settlement.session_ttl_seconds < settlement.requirement_ttl_seconds {
            return Err(GatewayError::Config(
                "Session TTL cannot be shorter than the requirement TTL".to_string(),
            ));
        }

        if settlement.max_timeout_seconds == 0 {
            return Err(GatewayError::Config("Settlement max timeout must be positive".to_string()));
        }

        if settlement.poll_attempts == 0 {
            return Err(GatewayError::Config("Settlement poll attempts must be > 0".to_string()));
        }

        Ok(())
    }

    pub fn get_server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn recipient_for(&self, network: Network) -> Option<&str> {
        self.settlement
            .networks
            .iter()
            .find(|n| n.network == network)
            .map(|n| n.recipient_address.as_str())
    }
}

pub fn create_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let default_config = AppConfig::default();
    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| GatewayError::Config(format!("Failed to serialize default config: {}", e)))?;

    std::fs::write(path, toml_str)
        .map_err(|e| GatewayError::Config(format!("Failed to write default config file: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.spend.tiers.len(), 4);
        assert_eq!(config.settlement.requirement_ttl_seconds, 120);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.spend.tiers.swap(1, 2);
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.spend.tiers[1].max_amount = None;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        let dup = config.settlement.networks[0].clone();
        config.settlement.networks.push(dup);
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.signature.payment_components.retain(|c| c != "@authority");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unlimited_top_tier_is_valid() {
        let mut config = AppConfig::default();
        config.spend.tiers.push(SpendTierConfig {
            tier: TrustTier::ALLOWLISTED,
            name: "allowlisted".to_string(),
            max_amount: None,
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_file_creation() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        create_default_config_file(path).unwrap();
        assert!(path.exists());

        let loaded_config = AppConfig::load(path).unwrap();
        assert_eq!(loaded_config.server.port, 8080);
        assert_eq!(loaded_config.spend.tiers, AppConfig::default().spend.tiers);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(
            temp_file.path(),
            r#"
[server]
port = 9090

[[spend.tiers]]
tier = 0
name = "unknown"
max_amount = "0"

[[spend.tiers]]
tier = 1
name = "registered"
max_amount = "10.00"

[[spend.tiers]]
tier = 5
name = "unlimited"
"#,
        )
        .unwrap();

        let config = AppConfig::load(temp_file.path()).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.spend.tiers[1].max_amount, Some(Amount::from_cents(1000)));
        assert_eq!(config.spend.tiers[2].max_amount, None);
        assert!(config.validate().is_ok());
    }
}
