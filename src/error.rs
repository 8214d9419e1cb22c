use crate::model::TrustTier;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Signature rejected: {0}")]
    Signature(#[from] SignatureError),

    #[error("Spend denied: amount exceeds limit for tier {current}")]
    SpendDenied {
        current: TrustTier,
        required: Option<TrustTier>,
    },

    #[error("Payment protocol error: {0}")]
    Payment(#[from] PaymentError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Merchant upstream error: {0}")]
    Upstream(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Archive conflict: {0}")]
    ArchiveConflict(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Failures of per-request signature verification. Never retried by the gateway.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    #[error("unknown or inactive key: {0}")]
    UnknownKey(String),

    #[error("signature does not match request")]
    SignatureMismatch,

    #[error("signature outside its validity window")]
    Expired,

    #[error("nonce already used for this key")]
    Replayed,

    #[error("covered components do not satisfy operation: {0}")]
    ScopeMismatch(String),
}

impl SignatureError {
    /// Reason code reported to the agent alongside the 401.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SignatureError::MalformedSignature(_) | SignatureError::SignatureMismatch => {
                "bad_signature"
            }
            SignatureError::UnknownKey(_) => "unknown_key",
            SignatureError::Expired => "expired",
            SignatureError::Replayed => "replayed",
            SignatureError::ScopeMismatch(_) => "scope_mismatch",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("registry lookup timed out")]
    Timeout,

    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("invalid registry record: {0}")]
    InvalidRecord(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    #[error("signal source timed out")]
    Timeout,

    #[error("signal source unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaymentError {
    #[error("payment requirement expired")]
    RequirementExpired,

    #[error("payment requirement superseded by a newer one")]
    RequirementSuperseded,

    #[error("payment proof does not match requirement: {0}")]
    RequirementMismatch(String),

    #[error("invalid payment proof: {0}")]
    InvalidProof(String),

    #[error("checkout session not found: {0}")]
    SessionNotFound(String),

    #[error("checkout session expired")]
    SessionExpired,

    #[error("no payment requirement issued for this session")]
    NoRequirement,

    #[error("network not supported: {0}")]
    UnsupportedNetwork(String),
}

impl PaymentError {
    pub fn code(&self) -> &'static str {
        match self {
            PaymentError::RequirementExpired => "requirement_expired",
            PaymentError::RequirementSuperseded => "requirement_superseded",
            PaymentError::RequirementMismatch(_) => "requirement_mismatch",
            PaymentError::InvalidProof(_) => "invalid_proof",
            PaymentError::SessionNotFound(_) => "session_not_found",
            PaymentError::SessionExpired => "session_expired",
            PaymentError::NoRequirement => "no_requirement",
            PaymentError::UnsupportedNetwork(_) => "unsupported_network",
        }
    }

    /// Whether a fresh requirement lets the agent recover.
    pub fn needs_reissue(&self) -> bool {
        matches!(
            self,
            PaymentError::RequirementExpired
                | PaymentError::RequirementSuperseded
                | PaymentError::NoRequirement
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettlementError {
    #[error("facilitator rejected payment: {0}")]
    Rejected(String),

    #[error("facilitator unreachable: {0}")]
    Transport(String),

    #[error("no settlement rail for network {0}")]
    NoRail(String),
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Io(err.to_string())
    }
}

impl From<base64::DecodeError> for GatewayError {
    fn from(err: base64::DecodeError) -> Self {
        GatewayError::InvalidInput(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        assert_eq!(SignatureError::SignatureMismatch.reason_code(), "bad_signature");
        assert_eq!(
            SignatureError::MalformedSignature("x".into()).reason_code(),
            "bad_signature"
        );
        assert_eq!(SignatureError::UnknownKey("k".into()).reason_code(), "unknown_key");
        assert_eq!(SignatureError::Expired.reason_code(), "expired");
        assert_eq!(SignatureError::Replayed.reason_code(), "replayed");
        assert_eq!(
            SignatureError::ScopeMismatch("content-digest".into()).reason_code(),
            "scope_mismatch"
        );
    }
}
