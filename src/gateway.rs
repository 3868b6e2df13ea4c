//! Gateway front (C9) — the HTTP server and request orchestrator.
//!
//! Ties every other component together: catalog alias resolution, session
//! pinning, the scorer, the selector, provider dispatch with fallback, SSE
//! heartbeat/streaming synthesis, dedup caching, and usage emission. This is
//! the module [`crate::router`] used to own in the teacher tree; the pipeline
//! itself is new (§4.6), but the shared-state shape — an atomically-swappable
//! config behind a lock, cheap to clone out for the duration of a request —
//! is carried over unchanged.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{Catalog, Family, Tier, AUTO_MODEL_ID};
use crate::config::Config;
use crate::dedup::{CachedResponse, DedupOutcome, Deduplicator};
use crate::error::GatewayError;
use crate::providers::{ProviderResponse, Registry};
use crate::sanitize::{sanitize_tool_ids, strip_thinking_tokens};
use crate::scorer::Scorer;
use crate::selector::{self, SelectionRequest};
use crate::session::{extract_session_id, SessionStore};
use crate::traffic::{TrafficEntry, TrafficLog};
use crate::usage::{UsageEmitter, UsageEvent};

/// Bodies larger than this are rejected with `413` before JSON parsing.
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Shared application state injected into every handler via [`axum::extract::State`].
pub struct GatewayState {
    config_lock: RwLock<Arc<Config>>,
    catalog: Catalog,
    registry: Registry,
    /// Provider id → the family it serves, used to pick a provider for a
    /// chosen model without threading config through every call site.
    provider_family: HashMap<String, Family>,
    scorer_lock: RwLock<Arc<Scorer>>,
    sessions: SessionStore,
    dedup: Deduplicator,
    usage: UsageEmitter,
    /// Shared pooled client for the `/v1/*` passthrough path — the fallback
    /// loop's own per-provider clients live inside `registry` instead.
    passthrough_client: reqwest::Client,
    pub traffic: Arc<TrafficLog>,
    pub started_at: Instant,
    /// Stable identity string surfaced on `/health`. Not configurable — a
    /// fresh id per process start is enough to distinguish restarts in logs.
    identity: String,
}

impl GatewayState {
    pub fn new(config: Arc<Config>, catalog: Catalog, traffic: Arc<TrafficLog>) -> anyhow::Result<Self> {
        let (registry, provider_family) = build_registry(&config)?;
        let scorer = Scorer::new(&config.routing.scoring);
        let sessions = SessionStore::new(
            Duration::from_secs(config.session.ttl_secs),
            config.session.capacity,
        );
        let dedup = Deduplicator::new(Duration::from_secs(config.dedup.ttl_secs));
        let usage = UsageEmitter::new(config.usage.directory.clone());

        Ok(Self {
            config_lock: RwLock::new(config),
            catalog,
            registry,
            provider_family,
            scorer_lock: RwLock::new(Arc::new(scorer)),
            sessions,
            dedup,
            usage,
            passthrough_client: reqwest::Client::new(),
            traffic,
            started_at: Instant::now(),
            identity: Uuid::new_v4().to_string(),
        })
    }

    pub fn config(&self) -> Arc<Config> {
        self.config_lock.read().expect("config lock poisoned").clone()
    }

    fn scorer(&self) -> Arc<Scorer> {
        self.scorer_lock.read().expect("scorer lock poisoned").clone()
    }

    /// Atomically replace the live config and rebuild the scorer from its
    /// (possibly changed) scoring keyword sets. Called only by the hot-reload
    /// background task. The registry and session store are not rebuilt —
    /// provider credentials and live session pins are not expected to change
    /// on a config reload; restart to pick those up.
    pub fn replace_config(&self, new: Arc<Config>) {
        let scorer = Scorer::new(&new.routing.scoring);
        *self.scorer_lock.write().expect("scorer lock poisoned") = Arc::new(scorer);
        *self.config_lock.write().expect("config lock poisoned") = new;
    }

    /// Sweep expired session pins and dedup entries. Driven by a periodic
    /// background task (see `main::sweep_task`), not the request path.
    pub fn sweep_expired(&self) {
        let sessions_removed = self.sessions.sweep_expired();
        let dedup_removed = self.dedup.sweep_expired();
        if sessions_removed > 0 || dedup_removed > 0 {
            debug!(sessions_removed, dedup_removed, "swept expired entries");
        }
    }

    fn provider_for_family(&self, family: Family) -> Option<&crate::providers::ProviderClient> {
        self.provider_id_for_family(family).and_then(|id| self.registry.get(&id))
    }

    fn provider_id_for_family(&self, family: Family) -> Option<String> {
        self.registry.by_priority().into_iter().find(|id| self.provider_family.get(id) == Some(&family))
    }
}

fn build_registry(config: &Config) -> anyhow::Result<(Registry, HashMap<String, Family>)> {
    let mut registry = Registry::new();
    let mut provider_family = HashMap::new();
    for p in &config.providers {
        let client = crate::providers::ProviderClient::new(p)?;
        registry.register(p.id.clone(), p.priority, client)?;
        provider_family.insert(p.id.clone(), p.family);
    }
    Ok((registry, provider_family))
}

/// Build the axum router. `/health` and `/v1/models` never touch providers;
/// `/v1/chat/completions` runs the full pipeline in [`chat_completions`].
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(crate::api::metrics::metrics))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .fallback(forward_or_404)
        .with_state(state)
}

#[derive(Deserialize)]
struct HealthQuery {
    #[serde(default)]
    full: bool,
}

/// `GET /health` — must answer in well under 50ms; never calls a provider
/// unless `?full=true` is given, and even then bounds the wait.
async fn health(State(state): State<Arc<GatewayState>>, Query(q): Query<HealthQuery>) -> impl IntoResponse {
    if !q.full {
        return Json(json!({ "status": "ok", "identity": state.identity })).into_response();
    }

    let providers = tokio::time::timeout(Duration::from_secs(2), state.registry.health_check_all())
        .await
        .unwrap_or_default();

    Json(json!({
        "status": "ok",
        "identity": state.identity,
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "providers": providers,
    }))
    .into_response()
}

/// `GET /stats` — usage aggregation from the in-memory traffic ring buffer.
async fn stats(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(state.traffic.stats().await)
}

/// `GET /v1/models` — the catalog, excluding the synthetic `auto` entry, in
/// the upstream `list` envelope. Served locally, no upstream call.
async fn list_models(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let data: Vec<Value> = state
        .catalog
        .listable()
        .into_iter()
        .map(|m| {
            json!({
                "id": m.id,
                "object": "model",
                "owned_by": m.family.to_string(),
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

/// Anything else under `/v1` is forwarded transparently to the
/// highest-priority configured provider; anything outside `/v1` is a 404.
async fn forward_or_404(State(state): State<Arc<GatewayState>>, req: axum::extract::Request) -> Response {
    if !req.uri().path().starts_with("/v1") {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": { "message": "not found", "type": "not_found" } })))
            .into_response();
    }

    let cfg = state.config();
    let Some(primary) = cfg.providers.iter().max_by_key(|p| p.priority) else {
        return (StatusCode::BAD_GATEWAY, Json(json!({ "error": { "message": "no provider configured", "type": "provider_error" } })))
            .into_response();
    };

    let method = req.method().clone();
    let path_and_query = req.uri().path_and_query().map(|p| p.as_str()).unwrap_or("/").to_string();
    let body = match axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, Json(json!({ "error": { "message": "request body too large", "type": "invalid_request" } })))
                .into_response()
        }
    };

    let url = format!("{}{path_and_query}", primary.base_url.trim_end_matches('/'));
    let mut builder = state.passthrough_client.request(method, &url).body(body.to_vec());
    if let Some(key) = primary.api_key() {
        builder = builder.bearer_auth(key);
    }

    match builder.send().await {
        Ok(resp) => {
            let status = resp.status();
            let bytes = resp.bytes().await.unwrap_or_default();
            (StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY), bytes.to_vec()).into_response()
        }
        Err(e) => (StatusCode::BAD_GATEWAY, Json(json!({ "error": { "message": e.to_string(), "type": "provider_error" } })))
            .into_response(),
    }
}

/// RAII guard over the dedup in-flight entry and (for streaming requests) the
/// heartbeat task. A client disconnect drops the handler future before either
/// `finish_complete`/`finish_release` runs, so `Drop` releases the in-flight
/// entry and stops the heartbeat automatically — no explicit disconnect
/// detection needed.
struct RequestGuard {
    dedup: Deduplicator,
    key: String,
    done: bool,
}

impl RequestGuard {
    fn new(dedup: Deduplicator, key: String) -> Self {
        Self { dedup, key, done: false }
    }

    fn finish_complete(&mut self, response: CachedResponse) {
        self.dedup.complete(&self.key, response);
        self.done = true;
    }

    fn finish_release(&mut self) {
        self.dedup.release(&self.key);
        self.done = true;
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if !self.done {
            self.dedup.release(&self.key);
        }
    }
}

/// `POST /v1/chat/completions` — the main pipeline (§4.6).
async fn chat_completions(State(state): State<Arc<GatewayState>>, headers: HeaderMap, body: Body) -> Response {
    let t0 = Instant::now();

    // Step 1: bounded body read.
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => return (StatusCode::PAYLOAD_TOO_LARGE, Json(json!({ "error": { "message": "request body too large", "type": "invalid_request" } }))).into_response(),
    };

    // Step 2: dedup check.
    let dedup_key = Deduplicator::key_for(&bytes);
    match state.dedup.check(&dedup_key).await {
        DedupOutcome::Replay(cached) | DedupOutcome::Coalesced(cached) => {
            return response_from_cached(&cached);
        }
        DedupOutcome::Proceed => {}
    }
    let mut guard = RequestGuard::new(state.dedup.clone(), dedup_key.clone());

    // Step 3: parse JSON.
    let mut body_json: Value = match serde_json::from_slice(&bytes) {
        Ok(v) => v,
        Err(e) => {
            guard.finish_release();
            return GatewayError::InvalidRequest(format!("invalid JSON: {e}")).into_response();
        }
    };

    let cfg = state.config();
    let request_timeout = Duration::from_millis(cfg.proxy.request_timeout_ms);

    match tokio::time::timeout(request_timeout, run_pipeline(&state, &cfg, &mut guard, headers, &mut body_json, t0)).await {
        Ok(response) => response,
        Err(_) => {
            guard.finish_release();
            GatewayError::DeadlineExceeded.into_response()
        }
    }
}

fn response_from_cached(cached: &CachedResponse) -> Response {
    let mut builder = Response::builder().status(cached.status);
    for (name, value) in cached.sanitized_headers() {
        builder = builder.header(name, value);
    }
    builder.body(Body::from(cached.body.clone())).unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Flatten a message's `content` field to plain text for scoring purposes.
/// Handles both the plain-string wire shape and the multimodal array shape
/// (`[{type:"text", text:"..."}, {type:"image_url", ...}, ...]`) — only
/// `text`-typed blocks contribute; image/file blocks are counted as present
/// but contentless, since the scorer only reasons about text length/content.
fn content_to_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

fn last_user_message(messages: &[Value]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
        .and_then(|m| m.get("content"))
        .map(content_to_text)
        .unwrap_or_default()
}

fn first_system_message(messages: &[Value]) -> Option<String> {
    messages
        .iter()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("system"))
        .and_then(|m| m.get("content"))
        .map(content_to_text)
}

/// Four characters per token is a common rough estimate for English text;
/// good enough for the large-context override and nothing else depends on
/// precision here (true tokenization is out of scope, per the scoring design).
fn approx_token_count(bytes: &[u8]) -> u64 {
    (bytes.len() as u64) / 4
}

/// Prepend a placeholder user message if the first non-system message isn't
/// from the user — required by providers (Anthropic) whose API rejects a
/// leading assistant/tool message.
fn normalize_leading_message(body: &mut Value) {
    let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) else { return };
    let first_non_system = messages.iter().find(|m| m.get("role").and_then(Value::as_str) != Some("system"));
    let needs_placeholder = match first_non_system {
        Some(m) => m.get("role").and_then(Value::as_str) != Some("user"),
        None => false,
    };
    if needs_placeholder {
        let insert_at = messages.iter().position(|m| m.get("role").and_then(Value::as_str) != Some("system")).unwrap_or(messages.len());
        messages.insert(insert_at, json!({ "role": "user", "content": "(continuing conversation)" }));
    }
}

struct RoutingDecision {
    model: String,
    method: &'static str,
    tier: Tier,
}

#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    state: &Arc<GatewayState>,
    cfg: &Arc<Config>,
    guard: &mut RequestGuard,
    headers: HeaderMap,
    body_json: &mut Value,
    t0: Instant,
) -> Response {
    // Step 4: force stream=false upstream; remember what the client asked for.
    let client_wants_streaming = body_json.get("stream").and_then(Value::as_bool).unwrap_or(false);
    if let Some(obj) = body_json.as_object_mut() {
        obj.insert("stream".into(), Value::Bool(false));
    }

    // Step 5: resolve model id.
    let raw_model = body_json.get("model").and_then(Value::as_str).unwrap_or("").to_string();
    let logical = raw_model.trim().to_ascii_lowercase();
    let must_route = logical.is_empty() || logical == AUTO_MODEL_ID;
    if !must_route {
        let resolved = state.catalog.resolve_alias(&logical);
        if let Some(obj) = body_json.as_object_mut() {
            obj.insert("model".into(), Value::String(resolved));
        }
    }

    let messages: Vec<Value> = body_json.get("messages").and_then(Value::as_array).cloned().unwrap_or_default();
    let requires_tools = body_json
        .get("tools")
        .and_then(Value::as_array)
        .map(|t| !t.is_empty())
        .unwrap_or(false);

    let header_pairs: Vec<(&str, &str)> = headers.iter().filter_map(|(k, v)| v.to_str().ok().map(|s| (k.as_str(), s))).collect();
    let session_id = extract_session_id(header_pairs);

    // Step 6: routing decision.
    let (chain_seed, method, tier) = if must_route {
        let pinned = session_id.as_ref().and_then(|sid| state.sessions.get_pinned(sid));
        if let Some(pinned_model) = pinned {
            (vec![pinned_model], "session", Tier::Medium)
        } else {
            let approx_tokens = approx_token_count(prompt_bytes(&messages).as_bytes());
            let scorer = state.scorer();
            let scored = scorer.score(&last_user_message(&messages), first_system_message(&messages).as_deref(), approx_tokens);
            let tier = scored.tier.unwrap_or(Tier::Medium);

            let mut chain: Vec<String> = cfg
                .routing
                .tiers
                .get(&tier)
                .map(|r| {
                    let mut v = vec![r.primary.clone()];
                    v.extend(r.fallbacks.iter().cloned());
                    v
                })
                .unwrap_or_default();
            if chain.is_empty() {
                if let Some(lr) = &cfg.fallback.last_resort_model {
                    chain.push(lr.clone());
                }
            }
            if let (Some(sid), Some(first)) = (&session_id, chain.first()) {
                state.sessions.pin(sid.clone(), first.clone());
            }
            (chain, "rules", tier)
        }
    } else {
        let model = body_json.get("model").and_then(Value::as_str).unwrap_or("").to_string();
        (vec![model], "override", Tier::Medium)
    };

    if chain_seed.iter().all(|m| m.is_empty()) {
        guard.finish_release();
        return GatewayError::InvalidRequest("no route configured for this request".to_string()).into_response();
    }

    // Step 7 applies per-attempt below (depends on the candidate's family).
    // Step 8: sanitize tool identifiers once, before dispatch.
    *body_json = sanitize_tool_ids(body_json.take());

    // Step 9: candidate chain via the selector.
    let selection = selector::select(
        &state.catalog,
        &chain_seed,
        &SelectionRequest {
            tier,
            pinned_model: None,
            requires_tools,
            min_context_tokens: 0,
            max_fallback_attempts: cfg.fallback.max_attempts,
        },
    );
    for dropped in &selection.dropped_unknown {
        warn!(model = %dropped, "dropped unknown model id from candidate chain");
    }

    let primary_candidate = selection.chain.first().cloned().unwrap_or_default();
    let decision_slot = RoutingDecision { model: primary_candidate, method, tier };

    if client_wants_streaming {
        run_streaming(state, cfg, guard, body_json, &selection.chain, decision_slot, t0).await
    } else {
        run_buffered(state, cfg, guard, body_json, &selection.chain, decision_slot, t0).await
    }
}

fn prompt_bytes(messages: &[Value]) -> String {
    messages.iter().filter_map(|m| m.get("content")).map(content_to_text).collect::<Vec<_>>().join(" ")
}

/// Outcome of driving the fallback loop against a single attempt body.
enum AttemptOutcome {
    Success { model: String, status: u16, headers: Vec<(String, String)>, value: Value, attempts: u32 },
    Exhausted { status: u16, message: String, attempts: u32 },
}

async fn fallback_loop(state: &Arc<GatewayState>, body_template: &Value, chain: &[String]) -> AttemptOutcome {
    let mut last = (502u16, "no candidate models available".to_string());
    let mut attempts = 0u32;

    for (idx, model_id) in chain.iter().enumerate() {
        let Some(model) = state.catalog.get(model_id) else { continue };
        let mut attempt = body_template.clone();
        if let Some(obj) = attempt.as_object_mut() {
            obj.insert("model".into(), json!(model_id));
            obj.insert("stream".into(), json!(false));
        }
        if model.family == Family::Anthropic {
            normalize_leading_message(&mut attempt);
        }

        let Some(provider) = state.provider_for_family(model.family) else {
            last = (502, format!("no provider configured for family `{}`", model.family));
            continue;
        };

        attempts += 1;
        debug!(model = %model_id, attempt = idx + 1, "dispatching");
        match provider.chat_completions(attempt).await {
            ProviderResponse::Success(success) => {
                return AttemptOutcome::Success {
                    model: model_id.clone(),
                    status: success.status,
                    headers: success.headers,
                    value: success.value,
                    attempts,
                };
            }
            ProviderResponse::Error { retryable, message, .. } => {
                last = (extract_status(&message), message);
                let is_last = idx + 1 == chain.len();
                if !retryable || is_last {
                    break;
                }
            }
        }
    }

    AttemptOutcome::Exhausted { status: last.0, message: last.1, attempts }
}

fn extract_status(message: &str) -> u16 {
    if let Some(pos) = message.find("HTTP ") {
        let tail = &message[pos + 5..];
        let digits: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(code) = digits.parse::<u16>() {
            return code;
        }
    }
    502
}

async fn run_buffered(
    state: &Arc<GatewayState>,
    cfg: &Arc<Config>,
    guard: &mut RequestGuard,
    body_json: &Value,
    chain: &[String],
    decision: RoutingDecision,
    t0: Instant,
) -> Response {
    let outcome = fallback_loop(state, body_json, chain).await;
    let latency_ms = t0.elapsed().as_millis() as u64;

    match outcome {
        AttemptOutcome::Success { model, status, headers, value, attempts } => {
            let method = if model == decision.model || decision.method != "rules" { decision.method } else { "fallback" };
            record_success(state, cfg, &model, decision.tier, method, latency_ms, attempts);

            let body_bytes = serde_json::to_vec(&value).unwrap_or_default();
            let cached = CachedResponse { status, headers, body: body_bytes };
            let sanitized_headers = cached.sanitized_headers();
            let response_status = StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK);
            let response_body = cached.body.clone();
            guard.finish_complete(cached);

            let mut builder = Response::builder().status(response_status);
            for (name, header_value) in &sanitized_headers {
                builder = builder.header(name.as_str(), header_value.as_str());
            }
            builder
                .body(Body::from(response_body))
                .unwrap_or_else(|_| (response_status, Json(value)).into_response())
        }
        AttemptOutcome::Exhausted { status, message, attempts } => {
            record_failure(state, decision.tier, latency_ms, attempts, &message);
            let err = GatewayError::AllAttemptsFailed { status, message };
            let body = err.body_json();
            let bytes = serde_json::to_vec(&body).unwrap_or_default();
            guard.finish_complete(CachedResponse { status: err.status_code().as_u16(), headers: vec![], body: bytes });
            err.into_response()
        }
    }
}

async fn run_streaming(
    state: &Arc<GatewayState>,
    cfg: &Arc<Config>,
    guard: &mut RequestGuard,
    body_json: &Value,
    chain: &[String],
    decision: RoutingDecision,
    t0: Instant,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<axum::body::Bytes, std::io::Error>>(16);

    // Step 10: heartbeat timer. Sends are serialized on the channel itself —
    // a heartbeat and a data frame can never interleave mid-frame because
    // each send carries one complete frame.
    let heartbeat_tx = tx.clone();
    let interval_ms = cfg.heartbeat.interval_ms;
    let heartbeat = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        ticker.tick().await; // first tick fires immediately; consume it
        loop {
            ticker.tick().await;
            if heartbeat_tx.send(Ok(axum::body::Bytes::from_static(b": heartbeat\n\n"))).await.is_err() {
                break;
            }
        }
    });
    let state = Arc::clone(state);
    let cfg = Arc::clone(cfg);
    let body_json = body_json.clone();
    let chain = chain.to_vec();
    let decision_tier = decision.tier;
    let decision_method = decision.method;
    let decision_model = decision.model.clone();
    let producer_tx = tx.clone();

    let producer = tokio::spawn(async move {
        let outcome = fallback_loop(&state, &body_json, &chain).await;
        let latency_ms = t0.elapsed().as_millis() as u64;

        let events: Vec<axum::body::Bytes> = match outcome {
            AttemptOutcome::Success { model, value, attempts, .. } => {
                let method = if model == decision_model || decision_method != "rules" { decision_method } else { "fallback" };
                record_success(&state, &cfg, &model, decision_tier, method, latency_ms, attempts);
                synthesize_sse(&model, &value)
            }
            AttemptOutcome::Exhausted { status, message, attempts } => {
                record_failure(&state, decision_tier, latency_ms, attempts, &message);
                let err = json!({ "error": { "message": message, "type": "provider_error", "status": status } });
                vec![
                    axum::body::Bytes::from(format!("data: {err}\n\n")),
                    axum::body::Bytes::from_static(b"data: [DONE]\n\n"),
                ]
            }
        };

        for event in events {
            if producer_tx.send(Ok(event)).await.is_err() {
                break;
            }
        }

        // Stop the heartbeat now that every data frame (including [DONE]) has
        // been queued — otherwise it would keep ticking for the life of the
        // channel, which only closes when the client disconnects.
        heartbeat.abort();
    });

    // SSE output isn't byte-cacheable through the same path as a buffered JSON
    // body, so the dedup entry is released rather than completed — a retry of
    // the same request proceeds as a fresh one instead of replaying a stream.
    guard.finish_release();
    tokio::spawn(async move {
        let _ = producer.await;
    });

    let stream = ReceiverStream::new(rx);
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Step 13 (streaming branch): three event families per choice, synthesized
/// from a single buffered upstream response.
fn synthesize_sse(model: &str, value: &Value) -> Vec<axum::body::Bytes> {
    let id = value.get("id").and_then(Value::as_str).map(String::from).unwrap_or_else(|| format!("chatcmpl-{}", Uuid::new_v4()));
    let created = value.get("created").and_then(Value::as_i64).unwrap_or(0);

    let content = value.pointer("/choices/0/message/content").and_then(Value::as_str).unwrap_or("");
    let stripped = strip_thinking_tokens(content);
    let tool_calls = value.pointer("/choices/0/message/tool_calls").cloned();
    let finish_reason = value.pointer("/choices/0/finish_reason").and_then(Value::as_str).unwrap_or("stop");

    let header = |delta: Value, finish: Option<&str>| {
        json!({
            "id": id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [{ "index": 0, "delta": delta, "finish_reason": finish }],
        })
    };

    let mut events = Vec::new();
    events.push(axum::body::Bytes::from(format!("data: {}\n\n", header(json!({ "role": "assistant" }), None))));
    events.push(axum::body::Bytes::from(format!("data: {}\n\n", header(json!({ "content": stripped }), None))));
    if let Some(calls) = tool_calls {
        events.push(axum::body::Bytes::from(format!("data: {}\n\n", header(json!({ "tool_calls": calls }), None))));
    }
    events.push(axum::body::Bytes::from(format!("data: {}\n\n", header(json!({}), Some(finish_reason)))));
    events.push(axum::body::Bytes::from_static(b"data: [DONE]\n\n"));
    events
}

fn record_success(state: &Arc<GatewayState>, cfg: &Arc<Config>, model: &str, tier: Tier, method: &str, latency_ms: u64, attempts: u32) {
    let (cost_estimate, baseline_cost) = estimate_costs(&state.catalog, model, cfg);
    let savings = (baseline_cost - cost_estimate).max(0.0);

    let provider_id = state
        .catalog
        .get(model)
        .and_then(|m| state.provider_id_for_family(m.family))
        .unwrap_or_else(|| "unknown".to_string());

    info!(tier = %tier, model, method, latency_ms, attempts, "request completed");

    state.traffic.push(
        TrafficEntry::new(tier.as_str().to_string(), model.to_string(), provider_id, latency_ms, true)
            .with_method(method)
            .with_fallback_attempts(attempts)
            .with_costs(cost_estimate, baseline_cost),
    );

    let emitter = state.usage.clone();
    let event = UsageEvent {
        timestamp: chrono::Utc::now(),
        model: model.to_string(),
        tier,
        cost_estimate,
        baseline_cost,
        savings,
        latency_ms,
        fallback_attempts: attempts,
    };
    tokio::spawn(async move { emitter.emit(event).await });
}

fn record_failure(state: &Arc<GatewayState>, tier: Tier, latency_ms: u64, attempts: u32, message: &str) {
    warn!(tier = %tier, attempts, error = message, "request failed after exhausting fallback chain");

    state.traffic.push(
        TrafficEntry::new(tier.as_str().to_string(), "none".to_string(), "none".to_string(), latency_ms, false)
            .with_fallback_attempts(attempts)
            .with_error(message),
    );
}

/// Rough cost comparison: the served model's price against the REASONING
/// tier's primary model, as a stand-in for "what this would have cost on the
/// most expensive tier". Usage savings are informational, not billed.
fn estimate_costs(catalog: &Catalog, model_id: &str, cfg: &Config) -> (f64, f64) {
    let cost = catalog.get(model_id).map(|m| m.input_price_per_million + m.output_price_per_million).unwrap_or(0.0);
    let baseline = cfg
        .routing
        .tiers
        .get(&Tier::Reasoning)
        .and_then(|r| catalog.get(&r.primary))
        .map(|m| m.input_price_per_million + m.output_price_per_million)
        .unwrap_or(cost);
    (cost, baseline)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_leading_message_inserts_placeholder_before_assistant_lead() {
        let mut body = json!({
            "messages": [
                { "role": "system", "content": "be terse" },
                { "role": "assistant", "content": "continuing..." },
            ]
        });
        normalize_leading_message(&mut body);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[2]["role"], "assistant");
    }

    #[test]
    fn normalize_leading_message_is_noop_when_user_already_leads() {
        let mut body = json!({
            "messages": [
                { "role": "system", "content": "be terse" },
                { "role": "user", "content": "hi" },
            ]
        });
        let before = body.clone();
        normalize_leading_message(&mut body);
        assert_eq!(body, before);
    }

    #[test]
    fn extract_status_parses_embedded_http_code() {
        assert_eq!(extract_status("backend returned HTTP 429: slow down"), 429);
        assert_eq!(extract_status("connection refused"), 502);
    }

    #[test]
    fn approx_token_count_scales_with_length() {
        assert!(approx_token_count(b"hello world") < approx_token_count(&vec![b'a'; 4000]));
    }

    #[test]
    fn last_user_message_finds_most_recent_user_turn() {
        let messages = vec![
            json!({ "role": "user", "content": "first" }),
            json!({ "role": "assistant", "content": "reply" }),
            json!({ "role": "user", "content": "second" }),
        ];
        assert_eq!(last_user_message(&messages), "second");
    }

    #[test]
    fn last_user_message_extracts_text_blocks_from_multimodal_content() {
        let messages = vec![json!({
            "role": "user",
            "content": [
                { "type": "text", "text": "describe this image in detail" },
                { "type": "image_url", "image_url": { "url": "data:image/png;base64,..." } },
            ],
        })];
        assert_eq!(last_user_message(&messages), "describe this image in detail");
    }

    #[test]
    fn synthesize_sse_emits_role_content_and_done_events() {
        let value = json!({
            "id": "chatcmpl-abc",
            "created": 1234,
            "choices": [{ "message": { "content": "hello" }, "finish_reason": "stop" }],
        });
        let events = synthesize_sse("test/model", &value);
        let joined: String = events.iter().map(|b| String::from_utf8_lossy(b).to_string()).collect();
        assert!(joined.contains("\"role\":\"assistant\""));
        assert!(joined.contains("hello"));
        assert!(joined.ends_with("data: [DONE]\n\n"));
    }
}
