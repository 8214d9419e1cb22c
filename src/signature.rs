use crate::{
    config::SignatureConfig,
    error::SignatureError,
    model::AgentIdentity,
    registry::KeyRegistry,
};
use base64::{engine::general_purpose, Engine};
use chrono::{DateTime, Duration, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub const SIGNATURE_INPUT_HEADER: &str = "signature-input";
pub const SIGNATURE_HEADER: &str = "signature";
pub const CONTENT_DIGEST_HEADER: &str = "content-digest";

/// What the request is trying to do. Each operation has its own set of
/// components the signature must cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Browse,
    Payment,
}

impl Operation {
    pub fn tag(&self) -> &'static str {
        match self {
            Operation::Browse => "agent-browser-auth",
            Operation::Payment => "agent-payer-auth",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureAlgorithm {
    Ed25519,
}

impl SignatureAlgorithm {
    fn parse(value: &str) -> Result<Self, SignatureError> {
        match value {
            "ed25519" => Ok(SignatureAlgorithm::Ed25519),
            other => Err(SignatureError::MalformedSignature(format!(
                "unsupported algorithm {}",
                other
            ))),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            SignatureAlgorithm::Ed25519 => "ed25519",
        }
    }
}

/// The parts of an inbound request a signature can cover.
#[derive(Debug, Clone, Default)]
pub struct RequestParts {
    pub method: String,
    pub authority: String,
    pub path: String,
    /// Header names are stored lowercased.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl RequestParts {
    pub fn new(method: &str, authority: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            authority: authority.to_string(),
            path: path.to_string(),
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Parsed `Signature-Input` / `Signature` pair. Lives for one verification.
#[derive(Debug, Clone)]
pub struct SignatureEnvelope {
    pub label: String,
    pub covered_components: Vec<String>,
    pub created: i64,
    pub expires: i64,
    pub nonce: String,
    pub key_id: String,
    pub algorithm: SignatureAlgorithm,
    pub tag: Option<String>,
    pub signature_bytes: Vec<u8>,
    /// Value of `@signature-params` exactly as received.
    signature_params: String,
}

impl SignatureEnvelope {
    pub fn from_request(request: &RequestParts) -> Result<Self, SignatureError> {
        let input = request
            .header(SIGNATURE_INPUT_HEADER)
            .ok_or_else(|| SignatureError::MalformedSignature("missing Signature-Input".into()))?;
        let signature = request
            .header(SIGNATURE_HEADER)
            .ok_or_else(|| SignatureError::MalformedSignature("missing Signature".into()))?;
        Self::parse(input, signature)
    }

    pub fn parse(signature_input: &str, signature: &str) -> Result<Self, SignatureError> {
        let malformed = |msg: &str| SignatureError::MalformedSignature(msg.to_string());

        let member = first_member(signature_input);
        let (label, params) = member
            .split_once('=')
            .ok_or_else(|| malformed("Signature-Input has no label"))?;
        let label = label.trim().to_string();
        let params = params.trim();

        let inner = params
            .strip_prefix('(')
            .ok_or_else(|| malformed("component list must start with '('"))?;
        let close = inner
            .find(')')
            .ok_or_else(|| malformed("unterminated component list"))?;

        let mut covered_components = Vec::new();
        for item in inner[..close].split_whitespace() {
            let name = unquote(item)
                .ok_or_else(|| malformed("component names must be quoted"))?
                .to_ascii_lowercase();
            if covered_components.contains(&name) {
                return Err(malformed("duplicate covered component"));
            }
            covered_components.push(name);
        }

        let mut created = None;
        let mut expires = None;
        let mut nonce = None;
        let mut key_id = None;
        let mut algorithm = SignatureAlgorithm::Ed25519;
        let mut tag = None;

        for param in inner[close + 1..].split(';').filter(|p| !p.trim().is_empty()) {
            let (name, value) = param
                .trim()
                .split_once('=')
                .ok_or_else(|| malformed("signature parameter without value"))?;
            match name {
                "created" => created = Some(parse_int(value)?),
                "expires" => expires = Some(parse_int(value)?),
                "nonce" => nonce = Some(unquote(value).ok_or_else(|| malformed("nonce must be quoted"))?),
                "keyid" => key_id = Some(unquote(value).ok_or_else(|| malformed("keyid must be quoted"))?),
                "alg" => {
                    let alg = unquote(value).ok_or_else(|| malformed("alg must be quoted"))?;
                    algorithm = SignatureAlgorithm::parse(&alg)?;
                }
                "tag" => tag = Some(unquote(value).ok_or_else(|| malformed("tag must be quoted"))?),
                // Unrecognised parameters are still covered through @signature-params.
                _ => {}
            }
        }

        let signature_bytes = signature_value(signature, &label)?;

        Ok(Self {
            covered_components,
            created: created.ok_or_else(|| malformed("missing created"))?,
            expires: expires.ok_or_else(|| malformed("missing expires"))?,
            nonce: nonce
                .filter(|n| !n.is_empty())
                .ok_or_else(|| malformed("missing nonce"))?,
            key_id: key_id
                .filter(|k| !k.is_empty())
                .ok_or_else(|| malformed("missing keyid"))?,
            algorithm,
            tag,
            signature_bytes,
            signature_params: params.to_string(),
            label,
        })
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.created, 0)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.expires, 0)
    }

    pub fn covers(&self, component: &str) -> bool {
        self.covered_components.iter().any(|c| c == component)
    }
}

// Commas inside quotes or parentheses do not split members.
fn first_member(value: &str) -> &str {
    let mut depth = 0usize;
    let mut quoted = false;
    for (i, ch) in value.char_indices() {
        match ch {
            '"' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => depth = depth.saturating_sub(1),
            ',' if !quoted && depth == 0 => return value[..i].trim(),
            _ => {}
        }
    }
    value.trim()
}

fn unquote(value: &str) -> Option<String> {
    value
        .trim()
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .map(str::to_string)
}

fn parse_int(value: &str) -> Result<i64, SignatureError> {
    value
        .trim()
        .parse()
        .map_err(|_| SignatureError::MalformedSignature(format!("invalid integer {}", value)))
}

fn signature_value(header: &str, label: &str) -> Result<Vec<u8>, SignatureError> {
    for member in header.split(',') {
        let Some((name, value)) = member.trim().split_once('=') else {
            continue;
        };
        if name.trim() != label {
            continue;
        }
        let encoded = value
            .trim()
            .strip_prefix(':')
            .and_then(|v| v.strip_suffix(':'))
            .ok_or_else(|| SignatureError::MalformedSignature("signature must be a byte sequence".into()))?;
        return general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| SignatureError::MalformedSignature(format!("signature is not base64: {}", e)));
    }
    Err(SignatureError::MalformedSignature(format!(
        "no signature for label {}",
        label
    )))
}

/// Builds the canonical signature base for `components` over `request`.
pub fn signature_base(
    request: &RequestParts,
    components: &[String],
    signature_params: &str,
) -> Result<String, SignatureError> {
    let mut base = String::new();
    for component in components {
        let value = match component.as_str() {
            "@method" => request.method.to_ascii_uppercase(),
            "@authority" => request.authority.to_ascii_lowercase(),
            "@path" => request.path.clone(),
            derived if derived.starts_with('@') => {
                return Err(SignatureError::MalformedSignature(format!(
                    "unsupported derived component {}",
                    derived
                )));
            }
            header => request
                .header(header)
                .map(|v| v.trim().to_string())
                .ok_or_else(|| {
                    SignatureError::MalformedSignature(format!("covered header {} is absent", header))
                })?,
        };
        base.push_str(&format!("\"{}\": {}\n", component, value));
    }
    base.push_str(&format!("\"@signature-params\": {}", signature_params));
    Ok(base)
}

/// `sha-256=:<base64>:` digest of a request body.
pub fn content_digest(body: &[u8]) -> String {
    format!("sha-256=:{}:", general_purpose::STANDARD.encode(Sha256::digest(body)))
}

/// Single-use nonce records keyed by `(key_id, nonce)`. Test-and-insert runs
/// under the shard write lock.
#[derive(Default)]
pub struct ReplayCache {
    records: DashMap<(String, String), DateTime<Utc>>,
}

impl ReplayCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if a live record already exists for this nonce.
    pub fn check_and_insert(
        &self,
        key_id: &str,
        nonce: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        match self.records.entry((key_id.to_string(), nonce.to_string())) {
            Entry::Occupied(mut existing) => {
                if *existing.get() > now {
                    return false;
                }
                existing.insert(expires_at);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(expires_at);
                true
            }
        }
    }

    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, expires_at| *expires_at > now);
        before - self.records.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Verified {
    pub key_id: String,
    pub identity: AgentIdentity,
}

pub struct SignatureVerifier {
    registry: Arc<dyn KeyRegistry>,
    replay: ReplayCache,
    clock_skew: Duration,
    replay_ttl_ceiling: Duration,
    max_lifetime: Duration,
    browse_components: Vec<String>,
    payment_components: Vec<String>,
    payment_bound_headers: Vec<String>,
}

impl SignatureVerifier {
    pub fn new(registry: Arc<dyn KeyRegistry>, config: &SignatureConfig) -> Self {
        let lower = |v: &Vec<String>| v.iter().map(|c| c.to_ascii_lowercase()).collect();
        Self {
            registry,
            replay: ReplayCache::new(),
            clock_skew: Duration::seconds(config.clock_skew_seconds),
            replay_ttl_ceiling: Duration::seconds(config.nonce_cache_ttl_ceiling_seconds),
            max_lifetime: Duration::seconds(config.max_signature_lifetime_seconds),
            browse_components: lower(&config.browse_components),
            payment_components: lower(&config.payment_components),
            payment_bound_headers: lower(&config.payment_bound_headers),
        }
    }

    pub fn replay_cache(&self) -> &ReplayCache {
        &self.replay
    }

    pub fn required_components(&self, operation: Operation) -> &[String] {
        match operation {
            Operation::Browse => &self.browse_components,
            Operation::Payment => &self.payment_components,
        }
    }

    pub async fn verify(&self, request: &RequestParts, operation: Operation) -> Result<Verified, SignatureError> {
        self.verify_at(request, operation, Utc::now()).await
    }

    pub async fn verify_at(
        &self,
        request: &RequestParts,
        operation: Operation,
        now: DateTime<Utc>,
    ) -> Result<Verified, SignatureError> {
        let envelope = SignatureEnvelope::from_request(request)?;
        self.check_scope(&envelope, operation, request)?;
        let base = signature_base(request, &envelope.covered_components, &envelope.signature_params)?;
        let expires_at = self.check_freshness(&envelope, now)?;

        let identity = self.resolve_key(&envelope.key_id).await?;
        verify_signature(&identity, &envelope, base.as_bytes())?;

        if envelope.covers(CONTENT_DIGEST_HEADER) {
            let declared = request.header(CONTENT_DIGEST_HEADER).unwrap_or_default().trim();
            if declared != content_digest(&request.body) {
                return Err(SignatureError::SignatureMismatch);
            }
        }

        let record_until = std::cmp::min(expires_at + self.clock_skew, now + self.replay_ttl_ceiling);
        if !self
            .replay
            .check_and_insert(&envelope.key_id, &envelope.nonce, record_until, now)
        {
            return Err(SignatureError::Replayed);
        }

        debug!(key_id = %envelope.key_id, ?operation, "Request signature verified");
        Ok(Verified {
            key_id: envelope.key_id,
            identity,
        })
    }

    fn check_scope(
        &self,
        envelope: &SignatureEnvelope,
        operation: Operation,
        request: &RequestParts,
    ) -> Result<(), SignatureError> {
        if let Some(missing) = self
            .required_components(operation)
            .iter()
            .find(|required| !envelope.covers(required))
        {
            return Err(SignatureError::ScopeMismatch(format!("{} not covered", missing)));
        }

        if operation == Operation::Payment {
            if let Some(unbound) = self
                .payment_bound_headers
                .iter()
                .find(|header| request.header(header).is_some() && !envelope.covers(header))
            {
                return Err(SignatureError::ScopeMismatch(format!("{} present but not covered", unbound)));
            }
        }

        match envelope.tag.as_deref() {
            Some(tag) if tag != operation.tag() => Err(SignatureError::ScopeMismatch(format!(
                "tag {} does not match {}",
                tag,
                operation.tag()
            ))),
            _ => Ok(()),
        }
    }

    fn check_freshness(&self, envelope: &SignatureEnvelope, now: DateTime<Utc>) -> Result<DateTime<Utc>, SignatureError> {
        let (Some(created), Some(expires)) = (envelope.created_at(), envelope.expires_at()) else {
            return Err(SignatureError::MalformedSignature("timestamp out of range".into()));
        };
        if expires < created || expires - created > self.max_lifetime {
            return Err(SignatureError::Expired);
        }
        if created > now + self.clock_skew || now > expires + self.clock_skew {
            return Err(SignatureError::Expired);
        }
        Ok(expires)
    }

    async fn resolve_key(&self, key_id: &str) -> Result<AgentIdentity, SignatureError> {
        match self.registry.lookup(key_id).await {
            Ok(Some(identity)) if identity.is_active() => Ok(identity),
            Ok(Some(_)) => Err(SignatureError::UnknownKey(format!("{} is not active", key_id))),
            Ok(None) => Err(SignatureError::UnknownKey(key_id.to_string())),
            Err(e) => Err(SignatureError::UnknownKey(format!("{}: {}", key_id, e))),
        }
    }
}

fn verify_signature(
    identity: &AgentIdentity,
    envelope: &SignatureEnvelope,
    base: &[u8],
) -> Result<(), SignatureError> {
    match envelope.algorithm {
        SignatureAlgorithm::Ed25519 => {
            let key_bytes: [u8; 32] = general_purpose::STANDARD
                .decode(&identity.public_key)
                .ok()
                .and_then(|bytes| bytes.try_into().ok())
                .ok_or_else(|| SignatureError::UnknownKey(format!("{} has an invalid public key", identity.key_id)))?;
            let key = VerifyingKey::from_bytes(&key_bytes)
                .map_err(|_| SignatureError::UnknownKey(format!("{} has an invalid public key", identity.key_id)))?;
            let signature = Signature::from_slice(&envelope.signature_bytes)
                .map_err(|_| SignatureError::MalformedSignature("signature must be 64 bytes".into()))?;
            key.verify_strict(base, &signature)
                .map_err(|_| SignatureError::SignatureMismatch)
        }
    }
}

/// Header pair produced by [`RequestSigner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub signature_input: String,
    pub signature: String,
}

/// Agent-side signer producing headers the verifier accepts.
pub struct RequestSigner {
    signing_key: SigningKey,
    key_id: String,
    label: String,
}

impl RequestSigner {
    pub fn new(signing_key: SigningKey, key_id: impl Into<String>) -> Self {
        Self {
            signing_key,
            key_id: key_id.into(),
            label: "sig1".to_string(),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Base64 raw public key, the form the registry stores.
    pub fn public_key_base64(&self) -> String {
        general_purpose::STANDARD.encode(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(
        &self,
        request: &RequestParts,
        components: &[&str],
        operation: Operation,
        created: i64,
        expires: i64,
        nonce: &str,
    ) -> Result<SignedHeaders, SignatureError> {
        let list = components
            .iter()
            .map(|c| format!("\"{}\"", c))
            .collect::<Vec<_>>()
            .join(" ");
        let params = format!(
            "({});created={};expires={};keyid=\"{}\";alg=\"{}\";nonce=\"{}\";tag=\"{}\"",
            list,
            created,
            expires,
            self.key_id,
            SignatureAlgorithm::Ed25519.as_str(),
            nonce,
            operation.tag()
        );
        let components: Vec<String> = components.iter().map(|c| c.to_string()).collect();
        let base = signature_base(request, &components, &params)?;
        let signature = self.signing_key.sign(base.as_bytes());

        Ok(SignedHeaders {
            signature_input: format!("{}={}", self.label, params),
            signature: format!(
                "{}=:{}:",
                self.label,
                general_purpose::STANDARD.encode(signature.to_bytes())
            ),
        })
    }

    pub fn sign_into(
        &self,
        request: RequestParts,
        components: &[&str],
        operation: Operation,
        created: i64,
        expires: i64,
        nonce: &str,
    ) -> Result<RequestParts, SignatureError> {
        let headers = self.sign(&request, components, operation, created, expires, nonce)?;
        Ok(request
            .with_header(SIGNATURE_INPUT_HEADER, &headers.signature_input)
            .with_header(SIGNATURE_HEADER, &headers.signature))
    }
}
