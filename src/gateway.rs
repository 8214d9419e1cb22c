//! HTTP surface of the gateway. Every route except `/health` requires a
//! verified agent signature.

use crate::{
    config::AppConfig,
    database::SessionArchive,
    error::{GatewayError, PaymentError, Result},
    merchant::{apply_trust_headers, ForwardRequest, ForwardResponse, HttpMerchant, Merchant},
    model::{Amount, Network, PaymentProof, PaymentRequirement, SettlementResult},
    negotiator::{CheckoutSession, PaymentNegotiator, ProofAck, SessionState},
    registry::CachedKeyRegistry,
    settlement::{SettlementClient, Settler},
    signature::{Operation, RequestParts, SignatureVerifier},
    spend::{SpendDecision, SpendGate},
    trust::{TrustAggregator, TrustProfile},
};
use axum::{
    body::{Body, Bytes},
    extract::{Path, Request, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::{sync::OnceCell, task::JoinHandle};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const PAYMENT_REQUIRED_HEADER: &str = "payment-required";
pub const PAYMENT_HEADER: &str = "x-payment";
pub const PAYMENT_RESPONSE_HEADER: &str = "x-payment-response";
pub const PAYMENT_NETWORK_HEADER: &str = "x-payment-network";

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Verified caller identity and the trust profile computed for this request.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub key_id: String,
    pub profile: Arc<TrustProfile>,
}

/// Merchant response for a confirmed attempt, produced at most once.
type Fulfilment = Arc<OnceCell<ForwardResponse>>;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<CachedKeyRegistry>,
    pub verifier: Arc<SignatureVerifier>,
    pub trust: Arc<TrustAggregator>,
    pub spend: Arc<SpendGate>,
    pub negotiator: Arc<PaymentNegotiator>,
    pub merchant: Arc<dyn Merchant>,
    fulfilments: Arc<DashMap<Uuid, Fulfilment>>,
}

impl AppState {
    pub fn new(
        config: &AppConfig,
        registry: Arc<CachedKeyRegistry>,
        trust: TrustAggregator,
        settler: Arc<dyn Settler>,
        archive: Option<Arc<SessionArchive>>,
        merchant: Arc<dyn Merchant>,
    ) -> Self {
        Self {
            verifier: Arc::new(SignatureVerifier::new(registry.clone(), &config.signature)),
            registry,
            trust: Arc::new(trust),
            spend: Arc::new(SpendGate::from_config(&config.spend)),
            negotiator: Arc::new(PaymentNegotiator::new(
                settler,
                archive,
                &config.settlement,
                std::time::Duration::from_millis(config.server.settlement_wait_ms),
            )),
            merchant,
            fulfilments: Arc::new(DashMap::new()),
        }
    }

    /// Wires every component to its configured HTTP collaborator.
    pub fn from_config(config: &AppConfig, archive: Option<Arc<SessionArchive>>) -> Result<Self> {
        let registry = Arc::new(CachedKeyRegistry::from_config(&config.registry));
        let trust = TrustAggregator::from_config(registry.clone(), &config.trust);
        let settler = Arc::new(SettlementClient::from_config(&config.settlement)?);
        let merchant = Arc::new(HttpMerchant::from_config(&config.merchant)?);
        Ok(Self::new(config, registry, trust, settler, archive, merchant))
    }

    /// Fulfilments go in the same pass that evicts their session.
    pub async fn sweep(&self, now: DateTime<Utc>) {
        let replays = self.verifier.replay_cache().purge_expired(now);
        self.trust.purge_expired();
        self.registry.purge_expired();
        let sessions = self.negotiator.sweep(now).await;
        for instance_id in &sessions.evicted {
            self.fulfilments.remove(instance_id);
        }
        tracing::debug!(
            replays_purged = replays,
            sessions_expired = sessions.expired,
            sessions_evicted = sessions.evicted.len(),
            "Gateway sweep complete"
        );
    }
}

/// Runs [`AppState::sweep`] on a fixed interval until the runtime shuts down.
pub fn spawn_sweeper(state: AppState, every: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            state.sweep(Utc::now()).await;
        }
    })
}

pub fn router(state: AppState) -> Router {
    let checkout = Router::new()
        .route("/api/cart/:session_id/x402/pay", post(checkout_pay))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_payment_signature));

    let status = Router::new()
        .route("/api/cart/:session_id/x402/status", get(checkout_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_browse_signature));

    Router::new()
        .route("/health", get(health_check))
        .merge(checkout)
        .merge(status)
        .fallback(forward_browse)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({"status": "healthy"}))
}

async fn require_browse_signature(State(state): State<AppState>, request: Request, next: Next) -> Response {
    match authenticate(&state, request, Operation::Browse).await {
        Ok((request, _)) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}

async fn require_payment_signature(State(state): State<AppState>, request: Request, next: Next) -> Response {
    match authenticate(&state, request, Operation::Payment).await {
        Ok((request, _)) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}

/// Verifies the signature, computes trust, and re-attaches the buffered body.
///
/// Payment operations always get a profile within the checkout staleness bound.
async fn authenticate(state: &AppState, request: Request, operation: Operation) -> Result<(Request, AgentContext)> {
    let (mut parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| GatewayError::InvalidInput(format!("unreadable body: {}", e)))?;

    let signed = signed_parts(&parts, &body);
    let verified = match state.verifier.verify(&signed, operation).await {
        Ok(verified) => verified,
        Err(e) => {
            warn!(path = %parts.uri.path(), reason = e.reason_code(), error = %e, "Signature rejected");
            return Err(e.into());
        }
    };

    let profile = match operation {
        Operation::Browse => state.trust.profile(&verified.key_id).await,
        Operation::Payment => state.trust.profile_for_checkout(&verified.key_id).await,
    };
    let agent = AgentContext {
        key_id: verified.key_id,
        profile,
    };
    parts.extensions.insert(agent.clone());
    Ok((Request::from_parts(parts, Body::from(body)), agent))
}

fn signed_parts(parts: &Parts, body: &Bytes) -> RequestParts {
    let authority = parts
        .headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| parts.uri.authority().map(|a| a.as_str()))
        .unwrap_or_default();

    let mut signed = RequestParts::new(parts.method.as_str(), authority, parts.uri.path()).with_body(body.to_vec());
    for (name, value) in parts.headers.iter() {
        if let Ok(value) = value.to_str() {
            signed = signed.with_header(name.as_str(), value);
        }
    }
    signed
}

fn forward_request(parts: &Parts, body: Bytes, agent: &AgentContext) -> Result<ForwardRequest> {
    let mut headers = parts.headers.clone();
    apply_trust_headers(&mut headers, &agent.key_id, &agent.profile)?;
    Ok(ForwardRequest {
        method: parts.method.clone(),
        path_and_query: parts
            .uri
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| parts.uri.path().to_string()),
        headers,
        body,
    })
}

fn into_response(forwarded: ForwardResponse) -> Response {
    let mut response = Response::new(Body::from(forwarded.body));
    *response.status_mut() = forwarded.status;
    *response.headers_mut() = forwarded.headers;
    response
}

async fn forward_browse(State(state): State<AppState>, request: Request) -> Result<Response> {
    let (request, agent) = authenticate(&state, request, Operation::Browse).await?;
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| GatewayError::InvalidInput(e.to_string()))?;

    let forwarded = state.merchant.forward(forward_request(&parts, body, &agent)?).await?;
    Ok(into_response(forwarded))
}

async fn checkout_pay(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    request: Request,
) -> Result<Response> {
    let (parts, body) = request.into_parts();
    let agent = parts
        .extensions
        .get::<AgentContext>()
        .cloned()
        .ok_or_else(|| GatewayError::Config("checkout route mounted without signature layer".to_string()))?;
    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| GatewayError::InvalidInput(e.to_string()))?;
    let forward = forward_request(&parts, body, &agent)?;

    let proof = match parts.headers.get(PAYMENT_HEADER) {
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|e| PaymentError::InvalidProof(e.to_string()))?;
            Some(PaymentProof::decode_header(value).map_err(|e| PaymentError::InvalidProof(e.to_string()))?)
        }
        None => None,
    };

    let Some(proof) = proof else {
        return require_payment(&state, &session_id, &agent, &parts.headers, forward, None).await;
    };

    match state.negotiator.submit_proof(&session_id, &agent.key_id, proof).await {
        Ok(ProofAck::Completed(session)) => settled(&state, session, forward).await,
        Ok(ProofAck::Pending(session)) => Ok(accepted(&session)),
        Err(GatewayError::Payment(e)) if e.needs_reissue() => {
            info!(session_id = %session_id, reason = e.code(), "Reissuing payment requirement");
            require_payment(&state, &session_id, &agent, &parts.headers, forward, Some(e.code())).await
        }
        Err(e) => Err(e),
    }
}

/// Answers an unpaid checkout: spend gate first, then the live requirement.
async fn require_payment(
    state: &AppState,
    session_id: &str,
    agent: &AgentContext,
    headers: &HeaderMap,
    forward: ForwardRequest,
    reason: Option<&str>,
) -> Result<Response> {
    if let Some(existing) = state.negotiator.status(session_id).await? {
        if existing.agent_id == agent.key_id {
            match existing.state {
                SessionState::Confirmed => return settled(state, existing, forward).await,
                SessionState::ProofReceived | SessionState::Settling => return Ok(accepted(&existing)),
                _ => {}
            }
        }
    }

    let network_hint = match headers.get(PAYMENT_NETWORK_HEADER).and_then(|v| v.to_str().ok()) {
        Some(value) => Some(value.parse::<Network>()?),
        None => None,
    };

    let amount: Amount = state.merchant.cart_total(session_id).await?;
    if let SpendDecision::Denied { required_tier } = state.spend.authorize(amount, &agent.profile) {
        return Err(GatewayError::SpendDenied {
            current: agent.profile.tier,
            required: required_tier,
        });
    }

    let session = state
        .negotiator
        .require_payment(session_id, &agent.profile, amount, network_hint)
        .await?;
    match session.state {
        SessionState::RequirementIssued => payment_required(&session, reason),
        SessionState::ProofReceived | SessionState::Settling => Ok(accepted(&session)),
        SessionState::Confirmed => settled(state, session, forward).await,
        other => Err(GatewayError::Config(format!(
            "negotiator returned {} for a payment requirement",
            other.as_str()
        ))),
    }
}

/// Terminal outcome of a submitted proof.
async fn settled(state: &AppState, session: CheckoutSession, forward: ForwardRequest) -> Result<Response> {
    if session.state == SessionState::Expired {
        return Err(PaymentError::SessionExpired.into());
    }
    let result = session
        .settlement_result
        .clone()
        .ok_or_else(|| GatewayError::Config("terminal session without settlement result".to_string()))?;

    match session.state {
        SessionState::Confirmed => {
            let receipt = result.to_header()?;
            let forwarded = fulfil(state, &session, forward).await?;
            let mut response = into_response(forwarded);
            response
                .headers_mut()
                .insert(PAYMENT_RESPONSE_HEADER, header_value(&receipt)?);
            Ok(response)
        }
        _ => Ok(settlement_failed(&session, &result)),
    }
}

/// Forwards a confirmed checkout to the merchant exactly once per attempt.
///
/// Concurrent and repeated submissions share the first successful response;
/// a failed forward is retried by the next submission.
async fn fulfil(state: &AppState, session: &CheckoutSession, forward: ForwardRequest) -> Result<ForwardResponse> {
    let cell = state
        .fulfilments
        .entry(session.instance_id)
        .or_insert_with(|| Arc::new(OnceCell::new()))
        .value()
        .clone();

    let forwarded = cell
        .get_or_try_init(|| async {
            info!(session_id = %session.session_id, attempt = session.attempt, "Forwarding paid checkout");
            state.merchant.forward(forward).await
        })
        .await
        .map_err(|e| {
            error!(session_id = %session.session_id, error = %e, "Paid checkout could not be forwarded");
            e
        })?;
    Ok(forwarded.clone())
}

#[derive(Debug, Serialize)]
struct SessionView<'a> {
    session_id: &'a str,
    attempt: u32,
    state: SessionState,
    amount: Amount,
    asset: &'a str,
    payment_requirement: Option<&'a PaymentRequirement>,
    settlement_result: Option<&'a SettlementResult>,
    expires_at: DateTime<Utc>,
    status_url: String,
}

impl<'a> From<&'a CheckoutSession> for SessionView<'a> {
    fn from(session: &'a CheckoutSession) -> Self {
        Self {
            session_id: &session.session_id,
            attempt: session.attempt,
            state: session.state,
            amount: session.amount,
            asset: &session.asset,
            payment_requirement: session.payment_requirement.as_ref(),
            settlement_result: session.settlement_result.as_ref(),
            expires_at: session.expires_at,
            status_url: format!("/api/cart/{}/x402/status", session.session_id),
        }
    }
}

fn payment_required(session: &CheckoutSession, reason: Option<&str>) -> Result<Response> {
    let requirement = session
        .payment_requirement
        .as_ref()
        .ok_or(PaymentError::NoRequirement)?;
    let encoded = requirement.to_header()?;

    let body = json!({
        "error": reason.unwrap_or("payment_required"),
        "session": SessionView::from(session),
        "payment_requirement": requirement,
    });
    let mut response = (StatusCode::PAYMENT_REQUIRED, Json(body)).into_response();
    response
        .headers_mut()
        .insert(PAYMENT_REQUIRED_HEADER, header_value(&encoded)?);
    Ok(response)
}

fn accepted(session: &CheckoutSession) -> Response {
    (StatusCode::ACCEPTED, Json(json!({"session": SessionView::from(session)}))).into_response()
}

fn settlement_failed(session: &CheckoutSession, result: &SettlementResult) -> Response {
    let body = json!({
        "error": "settlement_failed",
        "outcome": result.outcome,
        "reason": result.reason,
        "session": SessionView::from(session),
    });
    (StatusCode::PAYMENT_REQUIRED, Json(body)).into_response()
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| GatewayError::Serialization(e.to_string()))
}

async fn checkout_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    request: Request,
) -> Result<Response> {
    let agent = request
        .extensions()
        .get::<AgentContext>()
        .cloned()
        .ok_or_else(|| GatewayError::Config("status route mounted without signature layer".to_string()))?;

    match state.negotiator.status(&session_id).await? {
        Some(session) if session.agent_id == agent.key_id => {
            Ok(Json(json!({"session": SessionView::from(&session)})).into_response())
        }
        _ => Err(PaymentError::SessionNotFound(session_id).into()),
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            GatewayError::Signature(e) => (
                StatusCode::UNAUTHORIZED,
                json!({"error": e.reason_code(), "detail": e.to_string()}),
            ),
            GatewayError::SpendDenied { current, required } => (
                StatusCode::FORBIDDEN,
                json!({
                    "error": "spend_limit_exceeded",
                    "current_tier": current,
                    "required_tier": required,
                }),
            ),
            GatewayError::Payment(e) => {
                let status = match e {
                    PaymentError::SessionNotFound(_) => StatusCode::NOT_FOUND,
                    PaymentError::SessionExpired => StatusCode::GONE,
                    PaymentError::UnsupportedNetwork(_) => StatusCode::BAD_REQUEST,
                    _ => StatusCode::PAYMENT_REQUIRED,
                };
                (status, json!({"error": e.code(), "detail": e.to_string()}))
            }
            GatewayError::InvalidInput(detail) => {
                (StatusCode::BAD_REQUEST, json!({"error": "invalid_input", "detail": detail}))
            }
            GatewayError::Upstream(_) | GatewayError::Network(_) | GatewayError::Settlement(_) => {
                (StatusCode::BAD_GATEWAY, json!({"error": "upstream_unavailable"}))
            }
            GatewayError::Registry(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, json!({"error": "registry_unavailable"}))
            }
            GatewayError::Config(_)
            | GatewayError::Database(_)
            | GatewayError::ArchiveConflict(_)
            | GatewayError::Serialization(_)
            | GatewayError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, json!({"error": "internal_error"})),
        };

        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "Request failed");
        }
        (status, Json(body)).into_response()
    }
}
