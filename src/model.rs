use crate::error::{GatewayError, PaymentError, Result};
use base64::{engine::general_purpose, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Decimal places carried by every supported asset (USDC).
pub const ASSET_DECIMALS: u32 = 6;
const ATOMIC_PER_UNIT: u64 = 1_000_000;

/// Monetary amount in atomic asset units (1 USDC = 1_000_000).
///
/// Serialized as a decimal string such as `"5.01"` so configuration files and
/// wire bodies stay human readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_atomic(units: u64) -> Self {
        Amount(units)
    }

    pub fn from_cents(cents: u64) -> Self {
        Amount(cents.saturating_mul(ATOMIC_PER_UNIT / 100))
    }

    pub fn atomic(&self) -> u64 {
        self.0
    }
}

impl FromStr for Amount {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix('$').unwrap_or(trimmed);
        let invalid = || GatewayError::InvalidInput(format!("invalid amount: {:?}", s));

        let (whole, frac) = match trimmed.split_once('.') {
            Some((w, f)) => (w, f),
            None => (trimmed, ""),
        };
        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        if frac.len() > ASSET_DECIMALS as usize || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let whole: u64 = whole.parse().map_err(|_| invalid())?;
        let mut frac_units: u64 = 0;
        if !frac.is_empty() {
            let padded = format!("{:0<width$}", frac, width = ASSET_DECIMALS as usize);
            frac_units = padded.parse().map_err(|_| invalid())?;
        }

        whole
            .checked_mul(ATOMIC_PER_UNIT)
            .and_then(|w| w.checked_add(frac_units))
            .map(Amount)
            .ok_or_else(invalid)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / ATOMIC_PER_UNIT;
        let frac = format!("{:06}", self.0 % ATOMIC_PER_UNIT);
        let mut frac = frac.trim_end_matches('0').to_string();
        while frac.len() < 2 {
            frac.push('0');
        }
        write!(f, "{}.{}", whole, frac)
    }
}

impl TryFrom<String> for Amount {
    type Error = GatewayError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Amount> for String {
    fn from(amount: Amount) -> Self {
        amount.to_string()
    }
}

/// Ordinal trust rank. Higher is more trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrustTier(pub u8);

impl TrustTier {
    pub const UNKNOWN: TrustTier = TrustTier(0);
    pub const REGISTERED: TrustTier = TrustTier(1);
    pub const REPUTABLE: TrustTier = TrustTier(2);
    pub const VERIFIED: TrustTier = TrustTier(3);
    pub const ALLOWLISTED: TrustTier = TrustTier(4);

    pub fn name(&self) -> &'static str {
        match self.0 {
            0 => "unknown",
            1 => "registered",
            2 => "reputable",
            3 => "verified",
            4 => "allowlisted",
            _ => "custom",
        }
    }
}

impl fmt::Display for TrustTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkFamily {
    Svm,
    Evm,
}

/// Settlement networks, identified on the wire by their CAIP-2 id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Network {
    SolanaMainnet,
    SolanaDevnet,
    BaseMainnet,
    BaseSepolia,
}

impl Network {
    pub const ALL: [Network; 4] = [
        Network::SolanaMainnet,
        Network::SolanaDevnet,
        Network::BaseMainnet,
        Network::BaseSepolia,
    ];

    pub fn caip2(&self) -> &'static str {
        match self {
            Network::SolanaMainnet => "solana:5eykt4UsFv8P8NJdTREpY1vzqKqZKvdp",
            Network::SolanaDevnet => "solana:EtWTRABZaYq6iMfeYKouRu166VU2xqa1",
            Network::BaseMainnet => "eip155:8453",
            Network::BaseSepolia => "eip155:84532",
        }
    }

    pub fn family(&self) -> NetworkFamily {
        match self {
            Network::SolanaMainnet | Network::SolanaDevnet => NetworkFamily::Svm,
            Network::BaseMainnet | Network::BaseSepolia => NetworkFamily::Evm,
        }
    }

    /// USDC contract (EVM) or mint (SVM).
    pub fn usdc_address(&self) -> &'static str {
        match self {
            Network::SolanaMainnet => "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
            Network::SolanaDevnet => "4zMMC9srt5Ri5X14GAgXhaHii3GnPAEERYPJgZJDncDU",
            Network::BaseMainnet => "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
            Network::BaseSepolia => "0x036CbD53842c5426634e7929541eC2318f3dCF7e",
        }
    }

    /// EIP-712 domain name and version of the USDC contract.
    pub fn usdc_eip712_domain(&self) -> Option<(&'static str, &'static str)> {
        match self {
            Network::BaseMainnet => Some(("USD Coin", "2")),
            Network::BaseSepolia => Some(("USDC", "2")),
            Network::SolanaMainnet | Network::SolanaDevnet => None,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.caip2())
    }
}

impl FromStr for Network {
    type Err = PaymentError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Network::ALL
            .iter()
            .copied()
            .find(|n| n.caip2() == s)
            .ok_or_else(|| PaymentError::UnsupportedNetwork(s.to_string()))
    }
}

impl TryFrom<String> for Network {
    type Error = PaymentError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Network> for String {
    fn from(network: Network) -> Self {
        network.caip2().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationStatus {
    Active,
    Revoked,
    Unknown,
}

/// Registry record for an agent signing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub key_id: String,
    /// Base64-encoded raw Ed25519 public key.
    pub public_key: String,
    pub registration_status: RegistrationStatus,
}

impl AgentIdentity {
    pub fn is_active(&self) -> bool {
        self.registration_status == RegistrationStatus::Active
    }
}

/// Terms a client must satisfy before a gated resource is released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequirement {
    pub amount: Amount,
    pub asset: String,
    pub network: Network,
    pub recipient_address: String,
    pub nonce: String,
    pub expires_at: DateTime<Utc>,
}

impl PaymentRequirement {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn to_header(&self) -> Result<String> {
        Ok(general_purpose::STANDARD.encode(serde_json::to_vec(self)?))
    }
}

/// Signed payment submitted by the client against a requirement.
///
/// `payload` is the network-specific signed transfer, opaque to the gateway
/// and passed through to the facilitator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentProof {
    pub nonce: String,
    pub amount: Amount,
    pub asset: String,
    pub network: Network,
    #[serde(default)]
    pub payer: Option<String>,
    pub payload: serde_json::Value,
}

impl PaymentProof {
    pub fn decode_header(value: &str) -> Result<Self> {
        let bytes = general_purpose::STANDARD.decode(value.trim())?;
        serde_json::from_slice(&bytes)
            .map_err(|e| PaymentError::InvalidProof(e.to_string()).into())
    }

    pub fn to_header(&self) -> Result<String> {
        Ok(general_purpose::STANDARD.encode(serde_json::to_vec(self)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementOutcome {
    Confirmed,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementResult {
    pub tx_reference: Option<String>,
    pub network: Network,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub outcome: SettlementOutcome,
    #[serde(default)]
    pub reason: Option<String>,
}

impl SettlementResult {
    pub fn is_confirmed(&self) -> bool {
        self.outcome == SettlementOutcome::Confirmed
    }

    pub fn to_header(&self) -> Result<String> {
        Ok(general_purpose::STANDARD.encode(serde_json::to_vec(self)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amount_parsing() {
        assert_eq!("5".parse::<Amount>().unwrap(), Amount::from_atomic(5_000_000));
        assert_eq!("$5.01".parse::<Amount>().unwrap(), Amount::from_cents(501));
        assert_eq!("0.000001".parse::<Amount>().unwrap(), Amount::from_atomic(1));
        assert!("5.0000001".parse::<Amount>().is_err());
        assert!("-1".parse::<Amount>().is_err());
        assert!("abc".parse::<Amount>().is_err());
        assert!(".5".parse::<Amount>().is_err());
    }

    #[test]
    fn test_amount_display() {
        assert_eq!(Amount::from_cents(500).to_string(), "5.00");
        assert_eq!(Amount::from_cents(2001).to_string(), "20.01");
        assert_eq!(Amount::from_atomic(1).to_string(), "0.000001");
    }

    #[test]
    fn test_amount_serde_as_string() {
        let json = serde_json::to_string(&Amount::from_cents(1250)).unwrap();
        assert_eq!(json, "\"12.50\"");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Amount::from_cents(1250));
    }

    #[test]
    fn test_network_caip2() {
        assert_eq!("eip155:8453".parse::<Network>().unwrap(), Network::BaseMainnet);
        assert_eq!(Network::SolanaDevnet.family(), NetworkFamily::Svm);
        assert!("eip155:1".parse::<Network>().is_err());
        let json = serde_json::to_string(&Network::BaseSepolia).unwrap();
        assert_eq!(json, "\"eip155:84532\"");
    }

    #[test]
    fn test_proof_header_decoding() {
        let proof = PaymentProof {
            nonce: "abc".to_string(),
            amount: Amount::from_cents(100),
            asset: "USDC".to_string(),
            network: Network::BaseSepolia,
            payer: None,
            payload: serde_json::json!({"signature": "0x00"}),
        };
        let header = proof.to_header().unwrap();
        assert_eq!(PaymentProof::decode_header(&header).unwrap(), proof);
        assert!(PaymentProof::decode_header("not base64!").is_err());
    }
}
