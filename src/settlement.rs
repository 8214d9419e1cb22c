use crate::{
    config::{NetworkConfig, SettlementConfig},
    database::SessionArchive,
    error::{PaymentError, Result, SettlementError},
    model::{Network, NetworkFamily, PaymentProof, PaymentRequirement, SettlementOutcome, SettlementResult},
};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum RailStatus {
    Pending,
    Confirmed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub tx_reference: String,
    pub status: RailStatus,
}

#[async_trait]
pub trait SettlementRail: Send + Sync {
    fn network(&self) -> Network;

    /// `Err(Rejected)` is definitive; `Err(Transport)` leaves the outcome unknown.
    async fn submit(
        &self,
        requirement: &PaymentRequirement,
        proof: &PaymentProof,
    ) -> std::result::Result<Submission, SettlementError>;

    async fn status(&self, tx_reference: &str) -> std::result::Result<RailStatus, SettlementError>;
}

/// Solana proofs carry a serialized `transaction`; Base proofs carry an
/// EIP-3009 `authorization` and its `signature`.
pub fn validate_payload(
    requirement: &PaymentRequirement,
    proof: &PaymentProof,
) -> std::result::Result<(), PaymentError> {
    let payload = &proof.payload;
    match requirement.network.family() {
        NetworkFamily::Svm => {
            let tx = payload.get("transaction").and_then(|v| v.as_str()).unwrap_or_default();
            if tx.is_empty() {
                return Err(PaymentError::InvalidProof(
                    "solana payload requires a serialized transaction".to_string(),
                ));
            }
        }
        NetworkFamily::Evm => {
            let signature = payload.get("signature").and_then(|v| v.as_str()).unwrap_or_default();
            if !signature.starts_with("0x") {
                return Err(PaymentError::InvalidProof(
                    "evm payload requires a hex signature".to_string(),
                ));
            }
            let authorization = payload.get("authorization").ok_or_else(|| {
                PaymentError::InvalidProof("evm payload requires an authorization".to_string())
            })?;
            let to = authorization.get("to").and_then(|v| v.as_str()).unwrap_or_default();
            if !to.eq_ignore_ascii_case(&requirement.recipient_address) {
                return Err(PaymentError::RequirementMismatch(format!(
                    "authorization pays {} instead of {}",
                    to, requirement.recipient_address
                )));
            }
            let value = authorization.get("value").and_then(|v| v.as_str()).unwrap_or_default();
            if value != requirement.amount.atomic().to_string() {
                return Err(PaymentError::RequirementMismatch(format!(
                    "authorization value {} does not equal {}",
                    value,
                    requirement.amount.atomic()
                )));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequirements<'a> {
    scheme: &'static str,
    network: &'static str,
    amount: String,
    asset: &'a str,
    pay_to: &'a str,
    max_timeout_seconds: u64,
    extra: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WirePayload<'a> {
    x402_version: u8,
    accepted: &'a WireRequirements<'a>,
    payload: &'a serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SettleRequest<'a> {
    x402_version: u8,
    payment_payload: WirePayload<'a>,
    payment_requirements: &'a WireRequirements<'a>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettleResponse {
    success: bool,
    #[serde(default)]
    error_reason: Option<String>,
    #[serde(default)]
    payer: Option<String>,
    #[serde(default)]
    transaction: Option<String>,
    #[serde(default)]
    network: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TransactionStatusResponse {
    status: String,
    #[serde(default)]
    reason: Option<String>,
}

const X402_VERSION: u8 = 2;

/// Rail that delegates one network to an x402 facilitator at `POST {url}/settle`.
///
/// A facilitator settles synchronously. Status lookups go to the optional
/// `GET {status_url}/{caip2}/{tx}` service; without one they fail as transport errors.
pub struct FacilitatorRail {
    network: Network,
    endpoint: String,
    status_endpoint: Option<String>,
    asset_address: String,
    extra: serde_json::Value,
    max_timeout_seconds: u64,
    client: Client,
}

impl FacilitatorRail {
    pub fn new(network: &NetworkConfig, settlement: &SettlementConfig, client: Client) -> Self {
        let extra = match (network.network.usdc_eip712_domain(), &network.fee_payer) {
            (Some((name, version)), _) => json!({"name": name, "version": version}),
            (None, Some(fee_payer)) => json!({"feePayer": fee_payer}),
            (None, None) => json!({}),
        };
        Self {
            network: network.network,
            endpoint: settlement.facilitator_url.trim_end_matches('/').to_string(),
            status_endpoint: settlement
                .status_url
                .as_deref()
                .map(|url| url.trim_end_matches('/').to_string()),
            asset_address: network
                .asset_address
                .clone()
                .unwrap_or_else(|| network.network.usdc_address().to_string()),
            extra,
            max_timeout_seconds: settlement.max_timeout_seconds,
            client,
        }
    }

    fn wire_requirements<'a>(&'a self, requirement: &'a PaymentRequirement) -> WireRequirements<'a> {
        WireRequirements {
            scheme: "exact",
            network: requirement.network.caip2(),
            amount: requirement.amount.atomic().to_string(),
            asset: &self.asset_address,
            pay_to: &requirement.recipient_address,
            max_timeout_seconds: self.max_timeout_seconds,
            extra: self.extra.clone(),
        }
    }

    fn parse_status(status: &str, reason: Option<String>) -> RailStatus {
        match status {
            "confirmed" | "settled" | "success" => RailStatus::Confirmed,
            "failed" | "rejected" | "reverted" => {
                RailStatus::Failed(reason.unwrap_or_else(|| status.to_string()))
            }
            _ => RailStatus::Pending,
        }
    }
}

#[async_trait]
impl SettlementRail for FacilitatorRail {
    fn network(&self) -> Network {
        self.network
    }

    async fn submit(
        &self,
        requirement: &PaymentRequirement,
        proof: &PaymentProof,
    ) -> std::result::Result<Submission, SettlementError> {
        let accepted = self.wire_requirements(requirement);
        let response = self
            .client
            .post(format!("{}/settle", self.endpoint))
            .json(&SettleRequest {
                x402_version: X402_VERSION,
                payment_payload: WirePayload {
                    x402_version: X402_VERSION,
                    accepted: &accepted,
                    payload: &proof.payload,
                },
                payment_requirements: &accepted,
            })
            .send()
            .await
            .map_err(|e| SettlementError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(SettlementError::Transport(format!("facilitator returned {}", status)));
        }

        let body: SettleResponse = response
            .json()
            .await
            .map_err(|e| SettlementError::Transport(e.to_string()))?;

        if body.network.as_deref().is_some_and(|n| n != self.network.caip2()) {
            warn!(expected = %self.network, reported = ?body.network, "Facilitator settled on another network");
        }

        let tx_reference = body.transaction.filter(|tx| !tx.is_empty());
        if !body.success {
            let reason = body
                .error_reason
                .unwrap_or_else(|| format!("facilitator returned {}", status));
            return match tx_reference {
                // Broadcast but reverted.
                Some(tx_reference) => Ok(Submission {
                    tx_reference,
                    status: RailStatus::Failed(reason),
                }),
                None => Err(SettlementError::Rejected(reason)),
            };
        }

        let tx_reference = tx_reference.ok_or_else(|| {
            SettlementError::Transport("facilitator accepted payment without a transaction".to_string())
        })?;
        debug!(network = %self.network, tx = %tx_reference, payer = ?body.payer, "Facilitator settled payment");
        Ok(Submission {
            tx_reference,
            status: RailStatus::Confirmed,
        })
    }

    async fn status(&self, tx_reference: &str) -> std::result::Result<RailStatus, SettlementError> {
        let endpoint = self.status_endpoint.as_deref().ok_or_else(|| {
            SettlementError::Transport(format!("no status service configured for {}", self.network))
        })?;
        let response = self
            .client
            .get(format!("{}/{}/{}", endpoint, self.network.caip2(), tx_reference))
            .send()
            .await
            .map_err(|e| SettlementError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SettlementError::Transport(format!(
                "status lookup returned {}",
                response.status()
            )));
        }

        let body: TransactionStatusResponse = response
            .json()
            .await
            .map_err(|e| SettlementError::Transport(e.to_string()))?;
        Ok(Self::parse_status(&body.status, body.reason))
    }
}

/// Seam between the negotiator and whatever settles payments.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Settler: Send + Sync {
    /// Settles on the requirement's network. Never fails; errors become outcomes.
    async fn settle(&self, requirement: &PaymentRequirement, proof: &PaymentProof) -> SettlementResult;
}

#[derive(Debug, Clone, Copy)]
pub struct PollSchedule {
    pub interval: Duration,
    pub attempts: u32,
    pub max_backoff: Duration,
}

impl PollSchedule {
    pub fn from_config(config: &SettlementConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.poll_interval_ms),
            attempts: config.poll_attempts,
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// `interval * 2^attempt`, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.interval.saturating_mul(factor).min(self.max_backoff)
    }
}

pub struct SettlementClient {
    rails: HashMap<Network, Arc<dyn SettlementRail>>,
    schedule: PollSchedule,
}

impl SettlementClient {
    pub fn new(rails: Vec<Arc<dyn SettlementRail>>, schedule: PollSchedule) -> Self {
        Self {
            rails: rails.into_iter().map(|rail| (rail.network(), rail)).collect(),
            schedule,
        }
    }

    pub fn from_config(config: &SettlementConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        let rails = config
            .networks
            .iter()
            .map(|n| {
                Arc::new(FacilitatorRail::new(n, config, client.clone())) as Arc<dyn SettlementRail>
            })
            .collect();
        Ok(Self::new(rails, PollSchedule::from_config(config)))
    }

    pub fn supports(&self, network: Network) -> bool {
        self.rails.contains_key(&network)
    }

    fn rail(&self, network: Network) -> std::result::Result<&Arc<dyn SettlementRail>, SettlementError> {
        self.rails
            .get(&network)
            .ok_or_else(|| SettlementError::NoRail(network.to_string()))
    }

    pub async fn settle(
        &self,
        requirement: &PaymentRequirement,
        proof: &PaymentProof,
        network: Network,
    ) -> SettlementResult {
        let rail = match self.rail(network) {
            Ok(rail) => rail,
            Err(e) => return failed(network, None, e.to_string()),
        };

        info!(network = %network, nonce = %requirement.nonce, amount = %requirement.amount, "Submitting settlement");
        let submission = match rail.submit(requirement, proof).await {
            Ok(submission) => submission,
            Err(SettlementError::Transport(reason)) => {
                warn!(network = %network, %reason, "Settlement submission outcome unknown");
                return timed_out(network, None, reason);
            }
            Err(e) => {
                warn!(network = %network, error = %e, "Settlement rejected");
                return failed(network, None, e.to_string());
            }
        };

        match submission.status {
            RailStatus::Confirmed => confirmed(network, submission.tx_reference),
            RailStatus::Failed(reason) => failed(network, Some(submission.tx_reference), reason),
            RailStatus::Pending => self.poll(rail.as_ref(), submission.tx_reference).await,
        }
    }

    async fn poll(&self, rail: &dyn SettlementRail, tx_reference: String) -> SettlementResult {
        let network = rail.network();
        for attempt in 0..self.schedule.attempts {
            tokio::time::sleep(self.schedule.delay(attempt)).await;
            match rail.status(&tx_reference).await {
                Ok(RailStatus::Confirmed) => return confirmed(network, tx_reference),
                Ok(RailStatus::Failed(reason)) => return failed(network, Some(tx_reference), reason),
                Ok(RailStatus::Pending) => {
                    debug!(network = %network, tx = %tx_reference, attempt, "Settlement pending");
                }
                Err(e) => {
                    debug!(network = %network, tx = %tx_reference, attempt, error = %e, "Status poll failed");
                }
            }
        }
        warn!(network = %network, tx = %tx_reference, "Settlement polling exhausted");
        timed_out(
            network,
            Some(tx_reference),
            format!("no terminal status after {} polls", self.schedule.attempts),
        )
    }

    /// Single status check for reconciliation.
    pub async fn resolve(&self, network: Network, tx_reference: &str) -> SettlementResult {
        let rail = match self.rail(network) {
            Ok(rail) => rail,
            Err(e) => return timed_out(network, Some(tx_reference.to_string()), e.to_string()),
        };
        match rail.status(tx_reference).await {
            Ok(RailStatus::Confirmed) => confirmed(network, tx_reference.to_string()),
            Ok(RailStatus::Failed(reason)) => failed(network, Some(tx_reference.to_string()), reason),
            Ok(RailStatus::Pending) => {
                timed_out(network, Some(tx_reference.to_string()), "still pending".to_string())
            }
            Err(e) => timed_out(network, Some(tx_reference.to_string()), e.to_string()),
        }
    }
}

#[async_trait]
impl Settler for SettlementClient {
    async fn settle(&self, requirement: &PaymentRequirement, proof: &PaymentProof) -> SettlementResult {
        SettlementClient::settle(self, requirement, proof, requirement.network).await
    }
}

fn confirmed(network: Network, tx_reference: String) -> SettlementResult {
    info!(network = %network, tx = %tx_reference, "Settlement confirmed");
    SettlementResult {
        tx_reference: Some(tx_reference),
        network,
        confirmed_at: Some(Utc::now()),
        outcome: SettlementOutcome::Confirmed,
        reason: None,
    }
}

fn failed(network: Network, tx_reference: Option<String>, reason: String) -> SettlementResult {
    SettlementResult {
        tx_reference,
        network,
        confirmed_at: None,
        outcome: SettlementOutcome::Failed,
        reason: Some(reason),
    }
}

fn timed_out(network: Network, tx_reference: Option<String>, reason: String) -> SettlementResult {
    SettlementResult {
        tx_reference,
        network,
        confirmed_at: None,
        outcome: SettlementOutcome::TimedOut,
        reason: Some(reason),
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub examined: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub unresolved: usize,
}

/// The archived session keeps its failed state; late outcomes are recorded beside it.
pub async fn reconcile(archive: &SessionArchive, client: &SettlementClient) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();
    for pending in archive.timed_out_settlements().await? {
        report.examined += 1;
        let result = client.resolve(pending.network, &pending.tx_reference).await;
        match result.outcome {
            SettlementOutcome::Confirmed => report.confirmed += 1,
            SettlementOutcome::Failed => report.failed += 1,
            SettlementOutcome::TimedOut => {
                report.unresolved += 1;
                continue;
            }
        }
        info!(
            session_id = %pending.session_id,
            tx = %pending.tx_reference,
            outcome = ?result.outcome,
            "Settlement reconciled"
        );
        archive.record_reconciliation(&pending, &result).await?;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Amount;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Rail that replays a fixed script of submit and status answers.
    struct ScriptedRail {
        network: Network,
        submit: Mutex<Option<std::result::Result<Submission, SettlementError>>>,
        statuses: Mutex<VecDeque<std::result::Result<RailStatus, SettlementError>>>,
        polls: AtomicUsize,
    }

    impl ScriptedRail {
        fn new(
            network: Network,
            submit: std::result::Result<Submission, SettlementError>,
            statuses: Vec<std::result::Result<RailStatus, SettlementError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                network,
                submit: Mutex::new(Some(submit)),
                statuses: Mutex::new(statuses.into()),
                polls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SettlementRail for ScriptedRail {
        fn network(&self) -> Network {
            self.network
        }

        async fn submit(
            &self,
            _requirement: &PaymentRequirement,
            _proof: &PaymentProof,
        ) -> std::result::Result<Submission, SettlementError> {
            self.submit
                .lock()
                .take()
                .unwrap_or_else(|| Err(SettlementError::Rejected("submitted twice".to_string())))
        }

        async fn status(&self, _tx_reference: &str) -> std::result::Result<RailStatus, SettlementError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            self.statuses.lock().pop_front().unwrap_or(Ok(RailStatus::Pending))
        }
    }

    fn schedule(attempts: u32) -> PollSchedule {
        PollSchedule {
            interval: Duration::from_millis(1),
            attempts,
            max_backoff: Duration::from_millis(4),
        }
    }

    fn requirement(network: Network) -> PaymentRequirement {
        PaymentRequirement {
            amount: Amount::from_cents(500),
            asset: "USDC".to_string(),
            network,
            recipient_address: "0xEF78657456C6618a299309E880ee99502C6F6B8f".to_string(),
            nonce: "n1".to_string(),
            expires_at: Utc::now() + chrono::Duration::seconds(120),
        }
    }

    fn proof(network: Network, payload: serde_json::Value) -> PaymentProof {
        PaymentProof {
            nonce: "n1".to_string(),
            amount: Amount::from_cents(500),
            asset: "USDC".to_string(),
            network,
            payer: None,
            payload,
        }
    }

    fn pending(tx: &str) -> std::result::Result<Submission, SettlementError> {
        Ok(Submission {
            tx_reference: tx.to_string(),
            status: RailStatus::Pending,
        })
    }

    #[test]
    fn test_backoff_is_capped() {
        let schedule = PollSchedule {
            interval: Duration::from_millis(500),
            attempts: 10,
            max_backoff: Duration::from_millis(8_000),
        };
        assert_eq!(schedule.delay(0), Duration::from_millis(500));
        assert_eq!(schedule.delay(3), Duration::from_millis(4_000));
        assert_eq!(schedule.delay(5), Duration::from_millis(8_000));
        assert_eq!(schedule.delay(40), Duration::from_millis(8_000));
    }

    #[tokio::test]
    async fn test_pending_then_confirmed() {
        let rail = ScriptedRail::new(
            Network::BaseSepolia,
            pending("0xabc"),
            vec![Ok(RailStatus::Pending), Err(SettlementError::Transport("reset".into())), Ok(RailStatus::Confirmed)],
        );
        let client = SettlementClient::new(vec![rail.clone()], schedule(5));

        let req = requirement(Network::BaseSepolia);
        let result = client.settle(&req, &proof(Network::BaseSepolia, serde_json::json!({})), Network::BaseSepolia).await;

        assert!(result.is_confirmed());
        assert_eq!(result.tx_reference.as_deref(), Some("0xabc"));
        assert!(result.confirmed_at.is_some());
        assert_eq!(rail.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_polling_is_timed_out() {
        let rail = ScriptedRail::new(Network::SolanaDevnet, pending("5sig"), Vec::new());
        let client = SettlementClient::new(vec![rail.clone()], schedule(3));

        let req = requirement(Network::SolanaDevnet);
        let result = client.settle(&req, &proof(Network::SolanaDevnet, serde_json::json!({})), Network::SolanaDevnet).await;

        assert_eq!(result.outcome, SettlementOutcome::TimedOut);
        assert_eq!(result.tx_reference.as_deref(), Some("5sig"));
        assert_eq!(rail.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejection_and_unknown_submission() {
        let rejected = ScriptedRail::new(
            Network::BaseSepolia,
            Err(SettlementError::Rejected("insufficient_funds".into())),
            Vec::new(),
        );
        let unreachable = ScriptedRail::new(
            Network::SolanaDevnet,
            Err(SettlementError::Transport("connection reset".into())),
            Vec::new(),
        );
        let client = SettlementClient::new(vec![rejected, unreachable], schedule(3));

        let base = requirement(Network::BaseSepolia);
        let result = client.settle(&base, &proof(Network::BaseSepolia, serde_json::json!({})), Network::BaseSepolia).await;
        assert_eq!(result.outcome, SettlementOutcome::Failed);

        let sol = requirement(Network::SolanaDevnet);
        let result = client.settle(&sol, &proof(Network::SolanaDevnet, serde_json::json!({})), Network::SolanaDevnet).await;
        assert_eq!(result.outcome, SettlementOutcome::TimedOut);
        assert!(result.tx_reference.is_none());
    }

    #[tokio::test]
    async fn test_network_without_rail_fails() {
        let client = SettlementClient::new(Vec::new(), schedule(1));
        let req = requirement(Network::BaseMainnet);
        let result = client.settle(&req, &proof(Network::BaseMainnet, serde_json::json!({})), Network::BaseMainnet).await;
        assert_eq!(result.outcome, SettlementOutcome::Failed);
        assert!(!client.supports(Network::BaseMainnet));
    }

    #[tokio::test]
    async fn test_resolve_late_confirmation() {
        let rail = ScriptedRail::new(
            Network::BaseSepolia,
            pending("0xabc"),
            vec![Ok(RailStatus::Pending), Ok(RailStatus::Confirmed)],
        );
        let client = SettlementClient::new(vec![rail], schedule(1));

        assert_eq!(client.resolve(Network::BaseSepolia, "0xabc").await.outcome, SettlementOutcome::TimedOut);
        assert!(client.resolve(Network::BaseSepolia, "0xabc").await.is_confirmed());
    }

    #[test]
    fn test_payload_validation() {
        let base = requirement(Network::BaseSepolia);
        let good = serde_json::json!({
            "signature": "0x1234",
            "authorization": {
                "from": "0x0000000000000000000000000000000000000001",
                "to": "0xef78657456c6618a299309e880ee99502c6f6b8f",
                "value": "5000000",
            }
        });
        assert!(validate_payload(&base, &proof(Network::BaseSepolia, good)).is_ok());

        let wrong_value = serde_json::json!({
            "signature": "0x1234",
            "authorization": {"to": "0xEF78657456C6618a299309E880ee99502C6F6B8f", "value": "1"}
        });
        assert!(matches!(
            validate_payload(&base, &proof(Network::BaseSepolia, wrong_value)),
            Err(PaymentError::RequirementMismatch(_))
        ));

        let sol = requirement(Network::SolanaDevnet);
        assert!(validate_payload(&sol, &proof(Network::SolanaDevnet, serde_json::json!({"transaction": "AQAB"}))).is_ok());
        assert!(matches!(
            validate_payload(&sol, &proof(Network::SolanaDevnet, serde_json::json!({}))),
            Err(PaymentError::InvalidProof(_))
        ));
    }

    fn facilitator(network: Network) -> FacilitatorRail {
        let settlement = SettlementConfig::default();
        let entry = NetworkConfig {
            network,
            recipient_address: "0xEF78657456C6618a299309E880ee99502C6F6B8f".to_string(),
            asset_address: None,
            fee_payer: Some("2wKupLR9q6wXYppw8Gr2NvWxKBUqm4PPJKkQfoxHDBg4".to_string()),
        };
        FacilitatorRail::new(&entry, &settlement, Client::new())
    }

    #[test]
    fn test_settle_body_uses_x402_wire_shape() {
        let rail = facilitator(Network::BaseSepolia);
        let req = requirement(Network::BaseSepolia);
        let payload = serde_json::json!({"signature": "0x1234", "authorization": {"value": "5000000"}});
        let accepted = rail.wire_requirements(&req);
        let body = serde_json::to_value(SettleRequest {
            x402_version: X402_VERSION,
            payment_payload: WirePayload {
                x402_version: X402_VERSION,
                accepted: &accepted,
                payload: &payload,
            },
            payment_requirements: &accepted,
        })
        .unwrap();

        let expected = serde_json::json!({
            "scheme": "exact",
            "network": "eip155:84532",
            "amount": "5000000",
            "asset": "0x036CbD53842c5426634e7929541eC2318f3dCF7e",
            "payTo": "0xEF78657456C6618a299309E880ee99502C6F6B8f",
            "maxTimeoutSeconds": 300,
            "extra": {"name": "USDC", "version": "2"},
        });
        assert_eq!(body["x402Version"], 2);
        assert_eq!(body["paymentRequirements"], expected);
        assert_eq!(body["paymentPayload"]["x402Version"], 2);
        assert_eq!(body["paymentPayload"]["accepted"], expected);
        assert_eq!(body["paymentPayload"]["payload"], payload);
        assert!(body["paymentPayload"].get("nonce").is_none());
    }

    #[test]
    fn test_solana_requirements_advertise_fee_payer() {
        let rail = facilitator(Network::SolanaDevnet);
        let req = requirement(Network::SolanaDevnet);
        let wire = serde_json::to_value(rail.wire_requirements(&req)).unwrap();
        assert_eq!(wire["network"], "solana:EtWTRABZaYq6iMfeYKouRu166VU2xqa1");
        assert_eq!(wire["asset"], "4zMMC9srt5Ri5X14GAgXhaHii3GnPAEERYPJgZJDncDU");
        assert_eq!(wire["extra"]["feePayer"], "2wKupLR9q6wXYppw8Gr2NvWxKBUqm4PPJKkQfoxHDBg4");
    }

    #[tokio::test]
    async fn test_status_lookup_needs_a_status_service() {
        let rail = facilitator(Network::BaseSepolia);
        assert!(matches!(rail.status("0xabc").await, Err(SettlementError::Transport(_))));

        let client = SettlementClient::new(vec![Arc::new(rail)], schedule(1));
        let result = client.resolve(Network::BaseSepolia, "0xabc").await;
        assert_eq!(result.outcome, SettlementOutcome::TimedOut);
    }

    #[test]
    fn test_facilitator_status_parsing() {
        assert_eq!(FacilitatorRail::parse_status("confirmed", None), RailStatus::Confirmed);
        assert_eq!(FacilitatorRail::parse_status("pending", None), RailStatus::Pending);
        assert_eq!(
            FacilitatorRail::parse_status("failed", Some("reverted".into())),
            RailStatus::Failed("reverted".to_string())
        );
    }
}
