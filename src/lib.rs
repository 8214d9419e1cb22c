//! # TrustGate
//!
//! A gateway that sits in front of a merchant and decides what an AI agent
//! may do there.
//!
//! ## Architecture
//!
//! - **Signature**: RFC 9421 HTTP message signatures with Ed25519 and a replay cache
//! - **Registry**: agent key lookup with a TTL cache in front of the registry service
//! - **Trust**: registry, reputation, biometric and allowlist signals merged into a tier
//! - **Spend**: per-tier spend limits for checkout
//! - **Negotiator**: x402 payment requirement, proof and settlement state machine
//! - **Settlement**: x402 facilitator rails per network and reconciliation of timed-out settlements
//! - **Gateway**: Axum router wiring all of the above in front of the merchant

pub mod config;
pub mod database;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod merchant;
pub mod model;
pub mod negotiator;
pub mod registry;
pub mod settlement;
pub mod signature;
pub mod spend;
pub mod trust;

pub use config::AppConfig;
pub use error::{GatewayError, Result};
pub use gateway::{router, AppState};
pub use model::{Amount, Network, PaymentProof, PaymentRequirement, SettlementResult, TrustTier};
pub use negotiator::{CheckoutSession, PaymentNegotiator, SessionState};
pub use signature::{Operation, RequestParts, RequestSigner, SignatureVerifier};
pub use spend::{SpendDecision, SpendGate};
pub use trust::{TrustAggregator, TrustProfile};
