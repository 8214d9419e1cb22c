//! Checkout session state machine.
//!
//! ```text
//! NONE -> REQUIREMENT_ISSUED -> PROOF_RECEIVED -> SETTLING -> CONFIRMED
//!                                                          \-> FAILED
//! NONE | REQUIREMENT_ISSUED | PROOF_RECEIVED -> EXPIRED (session outer TTL)
//! ```

use crate::{
    config::{NetworkConfig, SettlementConfig},
    database::SessionArchive,
    error::{PaymentError, Result},
    model::{Amount, Network, PaymentProof, PaymentRequirement, SettlementResult},
    settlement::{validate_payload, Settler},
    trust::TrustProfile,
};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    None,
    RequirementIssued,
    ProofReceived,
    Settling,
    Confirmed,
    Failed,
    Expired,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Confirmed | SessionState::Failed | SessionState::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::None => "NONE",
            SessionState::RequirementIssued => "REQUIREMENT_ISSUED",
            SessionState::ProofReceived => "PROOF_RECEIVED",
            SessionState::Settling => "SETTLING",
            SessionState::Confirmed => "CONFIRMED",
            SessionState::Failed => "FAILED",
            SessionState::Expired => "EXPIRED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub session_id: String,
    /// Unique per attempt, including attempts of a cart id that was evicted and reused.
    pub instance_id: Uuid,
    /// Starts at 1; a new attempt begins after a FAILED or EXPIRED one.
    pub attempt: u32,
    pub agent_id: String,
    pub amount: Amount,
    pub asset: String,
    pub candidate_networks: Vec<Network>,
    pub state: SessionState,
    pub trust_profile_at_authorization: Option<TrustProfile>,
    pub payment_requirement: Option<PaymentRequirement>,
    #[serde(default)]
    pub superseded_nonces: Vec<String>,
    pub payment_proof: Option<PaymentProof>,
    pub settlement_result: Option<SettlementResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CheckoutSession {
    pub fn new(
        session_id: String,
        agent_id: String,
        amount: Amount,
        asset: String,
        candidate_networks: Vec<Network>,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            instance_id: Uuid::new_v4(),
            attempt: 1,
            agent_id,
            amount,
            asset,
            candidate_networks,
            state: SessionState::None,
            trust_profile_at_authorization: None,
            payment_requirement: None,
            superseded_nonces: Vec::new(),
            payment_proof: None,
            settlement_result: None,
            created_at: now,
            updated_at: now,
            expires_at,
        }
    }

    fn transition(&mut self, to: SessionState, now: DateTime<Utc>) {
        info!(
            session_id = %self.session_id,
            attempt = self.attempt,
            from = self.state.as_str(),
            to = to.as_str(),
            "Checkout state transition"
        );
        self.state = to;
        self.updated_at = now;
    }

    fn proof_matches(&self, proof: &PaymentProof) -> bool {
        self.payment_proof.as_ref().map(|p| p.nonce == proof.nonce).unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub enum ProofAck {
    Completed(CheckoutSession),
    /// Settlement outlasted the wait.
    Pending(CheckoutSession),
}

impl ProofAck {
    pub fn session(&self) -> &CheckoutSession {
        match self {
            ProofAck::Completed(session) | ProofAck::Pending(session) => session,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub evicted: Vec<Uuid>,
}

struct SessionSlot {
    session: Mutex<CheckoutSession>,
    /// `None` until the current attempt ends.
    outcome: watch::Sender<Option<CheckoutSession>>,
}

impl SessionSlot {
    fn new(session: CheckoutSession) -> Arc<Self> {
        let (outcome, _) = watch::channel(None);
        Arc::new(Self {
            session: Mutex::new(session),
            outcome,
        })
    }
}

pub struct PaymentNegotiator {
    sessions: DashMap<String, Arc<SessionSlot>>,
    settler: Arc<dyn Settler>,
    archive: Option<Arc<SessionArchive>>,
    networks: Vec<NetworkConfig>,
    asset: String,
    requirement_ttl: Duration,
    session_ttl: Duration,
    retention: Duration,
    settlement_wait: std::time::Duration,
}

impl PaymentNegotiator {
    pub fn new(
        settler: Arc<dyn Settler>,
        archive: Option<Arc<SessionArchive>>,
        config: &SettlementConfig,
        settlement_wait: std::time::Duration,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            settler,
            archive,
            networks: config.networks.clone(),
            asset: config.asset.clone(),
            requirement_ttl: Duration::seconds(config.requirement_ttl_seconds),
            session_ttl: Duration::seconds(config.session_ttl_seconds),
            retention: Duration::seconds(config.archive_retention_seconds),
            settlement_wait,
        }
    }

    pub fn networks(&self) -> Vec<Network> {
        self.networks.iter().map(|n| n.network).collect()
    }

    fn slot(&self, session_id: &str) -> Option<Arc<SessionSlot>> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    /// Issues nothing once a proof has been accepted.
    pub async fn require_payment(
        &self,
        session_id: &str,
        profile: &TrustProfile,
        amount: Amount,
        network_hint: Option<Network>,
    ) -> Result<CheckoutSession> {
        self.require_payment_at(session_id, profile, amount, network_hint, Utc::now())
            .await
    }

    pub async fn require_payment_at(
        &self,
        session_id: &str,
        profile: &TrustProfile,
        amount: Amount,
        network_hint: Option<Network>,
        now: DateTime<Utc>,
    ) -> Result<CheckoutSession> {
        let network = self.select_network(network_hint)?;
        let first_attempt = match &self.archive {
            Some(archive) if self.slot(session_id).is_none() => {
                archive.latest_attempt(session_id).await?.map_or(1, |a| a + 1)
            }
            _ => 1,
        };
        let slot = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                let mut session = CheckoutSession::new(
                    session_id.to_string(),
                    profile.agent_id.clone(),
                    amount,
                    self.asset.clone(),
                    self.networks(),
                    now,
                    now + self.session_ttl,
                );
                session.attempt = first_attempt;
                SessionSlot::new(session)
            })
            .value()
            .clone();

        let mut expired = None;
        let snapshot = {
            let mut session = slot.session.lock();

            if session.agent_id != profile.agent_id {
                return Err(PaymentError::SessionNotFound(session_id.to_string()).into());
            }

            if !session.state.is_terminal() && session.state != SessionState::Settling && now > session.expires_at {
                session.transition(SessionState::Expired, now);
                expired = Some(session.clone());
            }

            let state = session.state;
            match state {
                SessionState::ProofReceived | SessionState::Settling | SessionState::Confirmed => {
                    return Ok(session.clone());
                }
                SessionState::Failed | SessionState::Expired => {
                    let attempt = session.attempt + 1;
                    *session = CheckoutSession::new(
                        session_id.to_string(),
                        profile.agent_id.clone(),
                        amount,
                        self.asset.clone(),
                        self.networks(),
                        now,
                        now + self.session_ttl,
                    );
                    session.attempt = attempt;
                    slot.outcome.send_replace(None);
                    debug!(session_id, attempt, "Starting new checkout attempt");
                }
                SessionState::None | SessionState::RequirementIssued => {}
            }

            let reusable = session.payment_requirement.as_ref().is_some_and(|r| {
                !r.is_expired_at(now) && r.amount == amount && network_hint.map_or(true, |n| n == r.network)
            });
            if !reusable {
                self.issue_requirement(&mut session, amount, network, now);
            }
            session.trust_profile_at_authorization = Some(profile.clone());
            session.clone()
        };

        if let Some(expired) = expired {
            self.archive(expired);
        }
        Ok(snapshot)
    }

    fn select_network(&self, hint: Option<Network>) -> Result<Network> {
        match hint {
            Some(network) if self.networks.iter().any(|n| n.network == network) => Ok(network),
            Some(network) => Err(PaymentError::UnsupportedNetwork(network.to_string()).into()),
            None => self
                .networks
                .first()
                .map(|n| n.network)
                .ok_or_else(|| PaymentError::UnsupportedNetwork("none configured".to_string()).into()),
        }
    }

    // Caller holds the session lock.
    fn issue_requirement(&self, session: &mut CheckoutSession, amount: Amount, network: Network, now: DateTime<Utc>) {
        let recipient_address = self
            .networks
            .iter()
            .find(|n| n.network == network)
            .map(|n| n.recipient_address.clone())
            .unwrap_or_default();

        if let Some(previous) = session.payment_requirement.take() {
            session.superseded_nonces.push(previous.nonce);
        }
        let requirement = PaymentRequirement {
            amount,
            asset: self.asset.clone(),
            network,
            recipient_address,
            nonce: generate_nonce(),
            expires_at: (now + self.requirement_ttl).min(session.expires_at),
        };
        info!(
            session_id = %session.session_id,
            nonce = %requirement.nonce,
            network = %network,
            amount = %amount,
            expires_at = %requirement.expires_at,
            "Payment requirement issued"
        );
        session.amount = amount;
        session.payment_requirement = Some(requirement);
        if session.state == SessionState::None {
            session.transition(SessionState::RequirementIssued, now);
        } else {
            session.updated_at = now;
        }
    }

    /// Duplicate submissions of the accepted proof wait on the same outcome.
    pub async fn submit_proof(&self, session_id: &str, agent_id: &str, proof: PaymentProof) -> Result<ProofAck> {
        self.submit_proof_at(session_id, agent_id, proof, Utc::now()).await
    }

    pub async fn submit_proof_at(
        &self,
        session_id: &str,
        agent_id: &str,
        proof: PaymentProof,
        now: DateTime<Utc>,
    ) -> Result<ProofAck> {
        let slot = self
            .slot(session_id)
            .ok_or_else(|| PaymentError::SessionNotFound(session_id.to_string()))?;

        let mut expired = None;
        let dispatch = {
            let mut session = slot.session.lock();

            if session.agent_id != agent_id {
                return Err(PaymentError::SessionNotFound(session_id.to_string()).into());
            }

            let state = session.state;
            match state {
                SessionState::ProofReceived | SessionState::Settling if session.proof_matches(&proof) => None,
                SessionState::Confirmed | SessionState::Failed if session.proof_matches(&proof) => {
                    return Ok(ProofAck::Completed(session.clone()));
                }
                SessionState::ProofReceived | SessionState::Settling => {
                    return Err(PaymentError::RequirementMismatch(
                        "another proof is already settling for this session".to_string(),
                    )
                    .into());
                }
                SessionState::Confirmed => return Ok(ProofAck::Completed(session.clone())),
                SessionState::Failed => return Err(PaymentError::RequirementSuperseded.into()),
                SessionState::Expired => return Err(PaymentError::SessionExpired.into()),
                SessionState::None => return Err(PaymentError::NoRequirement.into()),
                SessionState::RequirementIssued if now > session.expires_at => {
                    session.transition(SessionState::Expired, now);
                    expired = Some(session.clone());
                    None
                }
                SessionState::RequirementIssued => {
                    let requirement = session
                        .payment_requirement
                        .clone()
                        .ok_or(PaymentError::NoRequirement)?;
                    check_proof(&session, &requirement, &proof, now)?;

                    session.payment_proof = Some(proof.clone());
                    session.transition(SessionState::ProofReceived, now);
                    session.transition(SessionState::Settling, now);
                    Some((requirement, proof))
                }
            }
        };

        if let Some(expired) = expired {
            slot.outcome.send_replace(Some(expired.clone()));
            self.archive(expired);
            return Err(PaymentError::SessionExpired.into());
        }

        if let Some((requirement, proof)) = dispatch {
            self.dispatch_settlement(slot.clone(), requirement, proof);
        }

        Ok(self.await_outcome(&slot).await)
    }

    fn dispatch_settlement(&self, slot: Arc<SessionSlot>, requirement: PaymentRequirement, proof: PaymentProof) {
        let settler = self.settler.clone();
        let archive = self.archive.clone();
        tokio::spawn(async move {
            let result = settler.settle(&requirement, &proof).await;
            let snapshot = {
                let mut session = slot.session.lock();
                let to = if result.is_confirmed() {
                    SessionState::Confirmed
                } else {
                    SessionState::Failed
                };
                session.settlement_result = Some(result);
                session.transition(to, Utc::now());
                session.clone()
            };
            if let Some(archive) = archive {
                if let Err(e) = archive.archive_session(&snapshot).await {
                    error!(session_id = %snapshot.session_id, attempt = snapshot.attempt, error = %e, "Failed to archive session");
                }
            }
            slot.outcome.send_replace(Some(snapshot));
        });
    }

    async fn await_outcome(&self, slot: &SessionSlot) -> ProofAck {
        let mut outcome = slot.outcome.subscribe();
        let waited = tokio::time::timeout(self.settlement_wait, outcome.wait_for(|o| o.is_some())).await;
        match waited {
            Ok(Ok(terminal)) => match terminal.clone() {
                Some(session) => ProofAck::Completed(session),
                None => ProofAck::Pending(slot.session.lock().clone()),
            },
            _ => ProofAck::Pending(slot.session.lock().clone()),
        }
    }

    /// Current snapshot, falling back to the archive after eviction.
    pub async fn status(&self, session_id: &str) -> Result<Option<CheckoutSession>> {
        if let Some(slot) = self.slot(session_id) {
            return Ok(Some(slot.session.lock().clone()));
        }
        match &self.archive {
            Some(archive) => Ok(archive.get_session(session_id).await?.map(|a| a.session)),
            None => Ok(None),
        }
    }

    /// `SETTLING` is never expired; it always runs to a settlement outcome.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut expired = Vec::new();
        let mut report = SweepReport::default();

        self.sessions.retain(|_, slot| {
            let mut session = slot.session.lock();
            let state = session.state;
            match state {
                SessionState::None | SessionState::RequirementIssued | SessionState::ProofReceived
                    if now > session.expires_at =>
                {
                    session.transition(SessionState::Expired, now);
                    let snapshot = session.clone();
                    slot.outcome.send_replace(Some(snapshot.clone()));
                    expired.push(snapshot);
                    true
                }
                state if state.is_terminal() && now - session.updated_at > self.retention => {
                    report.evicted.push(session.instance_id);
                    false
                }
                _ => true,
            }
        });

        report.expired = expired.len();
        if let Some(archive) = &self.archive {
            for session in &expired {
                if let Err(e) = archive.archive_session(session).await {
                    error!(session_id = %session.session_id, attempt = session.attempt, error = %e, "Failed to archive expired session");
                }
            }
        }
        if report.expired > 0 || !report.evicted.is_empty() {
            info!(expired = report.expired, evicted = report.evicted.len(), "Checkout sessions swept");
        }
        report
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn archive(&self, session: CheckoutSession) {
        if let Some(archive) = self.archive.clone() {
            tokio::spawn(async move {
                if let Err(e) = archive.archive_session(&session).await {
                    error!(session_id = %session.session_id, attempt = session.attempt, error = %e, "Failed to archive session");
                }
            });
        }
    }
}

fn check_proof(
    session: &CheckoutSession,
    requirement: &PaymentRequirement,
    proof: &PaymentProof,
    now: DateTime<Utc>,
) -> std::result::Result<(), PaymentError> {
    if session.superseded_nonces.iter().any(|n| *n == proof.nonce) {
        return Err(PaymentError::RequirementSuperseded);
    }
    if proof.nonce != requirement.nonce {
        return Err(PaymentError::RequirementMismatch("unknown requirement nonce".to_string()));
    }
    if requirement.is_expired_at(now) {
        return Err(PaymentError::RequirementExpired);
    }
    if proof.amount != requirement.amount {
        return Err(PaymentError::RequirementMismatch(format!(
            "amount {} does not equal {}",
            proof.amount, requirement.amount
        )));
    }
    if proof.asset != requirement.asset {
        return Err(PaymentError::RequirementMismatch(format!(
            "asset {} does not equal {}",
            proof.asset, requirement.asset
        )));
    }
    if proof.network != requirement.network {
        return Err(PaymentError::RequirementMismatch(format!(
            "network {} does not equal {}",
            proof.network, requirement.network
        )));
    }
    validate_payload(requirement, proof)
}

fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::model::{SettlementOutcome, TrustTier};
    use crate::settlement::MockSettler;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSettler {
        calls: AtomicUsize,
        delay: std::time::Duration,
        outcome: SettlementOutcome,
    }

    #[async_trait::async_trait]
    impl Settler for CountingSettler {
        async fn settle(&self, requirement: &PaymentRequirement, _proof: &PaymentProof) -> SettlementResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            SettlementResult {
                tx_reference: Some("0xabc".to_string()),
                network: requirement.network,
                confirmed_at: (self.outcome == SettlementOutcome::Confirmed).then(Utc::now),
                outcome: self.outcome,
                reason: None,
            }
        }
    }

    fn counting(outcome: SettlementOutcome, delay_ms: u64) -> Arc<CountingSettler> {
        Arc::new(CountingSettler {
            calls: AtomicUsize::new(0),
            delay: std::time::Duration::from_millis(delay_ms),
            outcome,
        })
    }

    fn negotiator(settler: Arc<dyn Settler>, wait_ms: u64) -> PaymentNegotiator {
        PaymentNegotiator::new(
            settler,
            None,
            &SettlementConfig::default(),
            std::time::Duration::from_millis(wait_ms),
        )
    }

    fn profile() -> TrustProfile {
        TrustProfile {
            agent_id: "agent-1".to_string(),
            tier: TrustTier::REGISTERED,
            contributing_signals: Vec::new(),
            computed_at: Utc::now(),
        }
    }

    fn proof_for(requirement: &PaymentRequirement) -> PaymentProof {
        PaymentProof {
            nonce: requirement.nonce.clone(),
            amount: requirement.amount,
            asset: requirement.asset.clone(),
            network: requirement.network,
            payer: Some("payer".to_string()),
            payload: serde_json::json!({"transaction": "AQABAgMEBQ=="}),
        }
    }

    fn requirement_of(session: &CheckoutSession) -> PaymentRequirement {
        session.payment_requirement.clone().unwrap()
    }

    #[tokio::test]
    async fn test_requirement_is_reused_until_expiry() {
        let negotiator = negotiator(counting(SettlementOutcome::Confirmed, 0), 1_000);
        let t = Utc::now();

        let first = negotiator
            .require_payment_at("cart-1", &profile(), Amount::from_cents(500), None, t)
            .await
            .unwrap();
        assert_eq!(first.state, SessionState::RequirementIssued);
        let req = requirement_of(&first);
        assert_eq!(req.network, Network::SolanaDevnet);
        assert_eq!(req.expires_at, t + Duration::seconds(120));
        assert_eq!(req.nonce.len(), 32);

        let again = negotiator
            .require_payment_at("cart-1", &profile(), Amount::from_cents(500), None, t + Duration::seconds(10))
            .await
            .unwrap();
        assert_eq!(requirement_of(&again).nonce, req.nonce);

        let reissued = negotiator
            .require_payment_at("cart-1", &profile(), Amount::from_cents(500), None, t + Duration::seconds(121))
            .await
            .unwrap();
        assert_ne!(requirement_of(&reissued).nonce, req.nonce);
        assert_eq!(reissued.superseded_nonces, vec![req.nonce]);
    }

    #[tokio::test]
    async fn test_network_hint() {
        let negotiator = negotiator(counting(SettlementOutcome::Confirmed, 0), 1_000);
        let session = negotiator
            .require_payment("cart-1", &profile(), Amount::from_cents(500), Some(Network::BaseSepolia))
            .await
            .unwrap();
        let req = requirement_of(&session);
        assert_eq!(req.network, Network::BaseSepolia);
        assert_eq!(req.recipient_address, "0xEF78657456C6618a299309E880ee99502C6F6B8f");

        let err = negotiator
            .require_payment("cart-2", &profile(), Amount::from_cents(500), Some(Network::BaseMainnet))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Payment(PaymentError::UnsupportedNetwork(_))));
    }

    #[tokio::test]
    async fn test_expired_requirement_keeps_session_open() {
        let settler = counting(SettlementOutcome::Confirmed, 0);
        let negotiator = negotiator(settler.clone(), 1_000);
        let t = Utc::now();

        let session = negotiator
            .require_payment_at("cart-1", &profile(), Amount::from_cents(500), None, t)
            .await
            .unwrap();
        let stale = proof_for(&requirement_of(&session));

        let err = negotiator
            .submit_proof_at("cart-1", "agent-1", stale.clone(), t + Duration::seconds(130))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Payment(PaymentError::RequirementExpired)));

        let status = negotiator.status("cart-1").await.unwrap().unwrap();
        assert_eq!(status.state, SessionState::RequirementIssued);

        let fresh = negotiator
            .require_payment_at("cart-1", &profile(), Amount::from_cents(500), None, t + Duration::seconds(131))
            .await
            .unwrap();
        assert_eq!(fresh.state, SessionState::RequirementIssued);
        assert_ne!(requirement_of(&fresh).nonce, stale.nonce);

        let err = negotiator
            .submit_proof_at("cart-1", "agent-1", stale, t + Duration::seconds(132))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Payment(PaymentError::RequirementSuperseded)));
        assert_eq!(settler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_mismatched_proof_is_rejected_without_transition() {
        let negotiator = negotiator(counting(SettlementOutcome::Confirmed, 0), 1_000);
        let session = negotiator
            .require_payment("cart-1", &profile(), Amount::from_cents(500), None)
            .await
            .unwrap();

        let mut cheap = proof_for(&requirement_of(&session));
        cheap.amount = Amount::from_cents(499);
        let err = negotiator.submit_proof("cart-1", "agent-1", cheap).await.unwrap_err();
        assert!(matches!(err, GatewayError::Payment(PaymentError::RequirementMismatch(_))));

        let mut empty = proof_for(&requirement_of(&session));
        empty.payload = serde_json::json!({});
        let err = negotiator.submit_proof("cart-1", "agent-1", empty).await.unwrap_err();
        assert!(matches!(err, GatewayError::Payment(PaymentError::InvalidProof(_))));

        let err = negotiator
            .submit_proof("cart-1", "agent-2", proof_for(&requirement_of(&session)))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Payment(PaymentError::SessionNotFound(_))));

        let status = negotiator.status("cart-1").await.unwrap().unwrap();
        assert_eq!(status.state, SessionState::RequirementIssued);
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_settle_once() {
        let settler = counting(SettlementOutcome::Confirmed, 50);
        let negotiator = Arc::new(negotiator(settler.clone(), 5_000));
        let session = negotiator
            .require_payment("cart-1", &profile(), Amount::from_cents(500), None)
            .await
            .unwrap();
        let proof = proof_for(&requirement_of(&session));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let negotiator = negotiator.clone();
            let proof = proof.clone();
            handles.push(tokio::spawn(async move {
                negotiator.submit_proof("cart-1", "agent-1", proof).await
            }));
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                ProofAck::Completed(session) => outcomes.push(session),
                ProofAck::Pending(_) => panic!("settlement should finish within the wait"),
            }
        }

        assert_eq!(settler.calls.load(Ordering::SeqCst), 1);
        assert!(outcomes.iter().all(|s| s.state == SessionState::Confirmed));
        assert!(outcomes.windows(2).all(|w| w[0].settlement_result == w[1].settlement_result));

        let replay = negotiator.submit_proof("cart-1", "agent-1", proof).await.unwrap();
        assert!(matches!(replay, ProofAck::Completed(ref s) if s.state == SessionState::Confirmed));
        assert_eq!(settler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_settlement_returns_pending_then_completes() {
        let settler = counting(SettlementOutcome::Confirmed, 200);
        let negotiator = negotiator(settler.clone(), 10);
        let session = negotiator
            .require_payment("cart-1", &profile(), Amount::from_cents(500), None)
            .await
            .unwrap();
        let proof = proof_for(&requirement_of(&session));

        let ack = negotiator.submit_proof("cart-1", "agent-1", proof.clone()).await.unwrap();
        assert!(matches!(ack, ProofAck::Pending(ref s) if s.state == SessionState::Settling));

        // The caller leaving does not cancel settlement.
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
        let status = negotiator.status("cart-1").await.unwrap().unwrap();
        assert_eq!(status.state, SessionState::Confirmed);
        assert_eq!(settler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timed_out_settlement_fails_session_and_allows_new_attempt() {
        let mut settler = MockSettler::new();
        settler.expect_settle().times(1).returning(|requirement, _| SettlementResult {
            tx_reference: Some("0xabc".to_string()),
            network: requirement.network,
            confirmed_at: None,
            outcome: SettlementOutcome::TimedOut,
            reason: Some("no terminal status after 10 polls".to_string()),
        });
        let negotiator = negotiator(Arc::new(settler), 1_000);

        let session = negotiator
            .require_payment("cart-1", &profile(), Amount::from_cents(500), None)
            .await
            .unwrap();
        let proof = proof_for(&requirement_of(&session));

        let ack = negotiator.submit_proof("cart-1", "agent-1", proof.clone()).await.unwrap();
        let failed = ack.session();
        assert_eq!(failed.state, SessionState::Failed);
        assert_eq!(
            failed.settlement_result.as_ref().map(|r| r.outcome),
            Some(SettlementOutcome::TimedOut)
        );

        let retry = negotiator
            .require_payment("cart-1", &profile(), Amount::from_cents(500), None)
            .await
            .unwrap();
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.state, SessionState::RequirementIssued);
        assert!(retry.settlement_result.is_none());
    }

    #[tokio::test]
    async fn test_sweep_expires_and_evicts() {
        let settler = counting(SettlementOutcome::Confirmed, 0);
        let negotiator = negotiator(settler, 1_000);
        let t = Utc::now();

        negotiator
            .require_payment_at("idle", &profile(), Amount::from_cents(500), None, t)
            .await
            .unwrap();
        let paid = negotiator
            .require_payment_at("paid", &profile(), Amount::from_cents(500), None, t)
            .await
            .unwrap();
        negotiator
            .submit_proof_at("paid", "agent-1", proof_for(&requirement_of(&paid)), t)
            .await
            .unwrap();

        let report = negotiator.sweep(t + Duration::seconds(901)).await;
        assert_eq!(report.expired, 1);
        let idle = negotiator.status("idle").await.unwrap().unwrap();
        assert_eq!(idle.state, SessionState::Expired);

        let report = negotiator.sweep(Utc::now() + Duration::seconds(5_000)).await;
        assert_eq!(report.evicted.len(), 2);
        assert!(negotiator.is_empty());
        assert!(negotiator.status("paid").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_attempts_continue_from_archive_after_eviction() {
        let dir = tempfile::TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("archive.db").display());
        let archive = Arc::new(SessionArchive::new(&url, 1).await.unwrap());

        let mut settler = MockSettler::new();
        let mut seq = mockall::Sequence::new();
        settler
            .expect_settle()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|requirement, _| SettlementResult {
                tx_reference: Some("0xtx1".to_string()),
                network: requirement.network,
                confirmed_at: Some(Utc::now()),
                outcome: SettlementOutcome::Confirmed,
                reason: None,
            });
        settler
            .expect_settle()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|requirement, _| SettlementResult {
                tx_reference: Some("0xtx2".to_string()),
                network: requirement.network,
                confirmed_at: None,
                outcome: SettlementOutcome::TimedOut,
                reason: Some("no terminal status".to_string()),
            });
        let negotiator = PaymentNegotiator::new(
            Arc::new(settler),
            Some(archive.clone()),
            &SettlementConfig::default(),
            std::time::Duration::from_secs(1),
        );

        let first = negotiator
            .require_payment("cart-500", &profile(), Amount::from_cents(500), None)
            .await
            .unwrap();
        assert_eq!(first.attempt, 1);
        let ack = negotiator
            .submit_proof("cart-500", "agent-1", proof_for(&requirement_of(&first)))
            .await
            .unwrap();
        assert_eq!(ack.session().state, SessionState::Confirmed);

        let report = negotiator.sweep(Utc::now() + Duration::seconds(5_000)).await;
        assert_eq!(report.evicted, vec![first.instance_id]);

        let second = negotiator
            .require_payment("cart-500", &profile(), Amount::from_cents(500), None)
            .await
            .unwrap();
        assert_eq!(second.attempt, 2);
        assert_ne!(second.instance_id, first.instance_id);
        let ack = negotiator
            .submit_proof("cart-500", "agent-1", proof_for(&requirement_of(&second)))
            .await
            .unwrap();
        assert_eq!(ack.session().state, SessionState::Failed);

        let pending = archive.timed_out_settlements().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempt, 2);
        assert_eq!(pending[0].tx_reference, "0xtx2");
    }
}
