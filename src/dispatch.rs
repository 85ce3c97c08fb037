use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::{atomic::Ordering, Arc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ProviderConfig;
use crate::errors::{RelayError, UpstreamError, UpstreamErrorKind};
use crate::health::HealthPolicy;
use crate::limits;
use crate::provider::{self, ChunkStream, SseScanner, UsageReport};
use crate::router::{self, RouteCandidate, RoutingPlan};
use crate::state::{AppState, RegistrySnapshot};
use crate::usage::UsageDelta;

const PROVIDER_HEADER: &str = "x-provider-id";

// ----------------------
// Handlers
// ----------------------

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    dispatch(state, None, headers, body).await
}

/// Path form of direct-provider selection; identical to the header form.
pub async fn chat_completions_for(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    dispatch(state, Some(provider), headers, body).await
}

async fn dispatch(
    state: Arc<AppState>,
    path_provider: Option<String>,
    headers: HeaderMap,
    body: Value,
) -> Response {
    state.total_requests.fetch_add(1, Ordering::Relaxed);

    let model = match body.get("model").and_then(Value::as_str) {
        Some(m) => m.to_string(),
        None => {
            return RelayError::InvalidRequest("missing required field: model".to_string())
                .into_response()
        }
    };
    if !body.get("messages").map(Value::is_array).unwrap_or(false) {
        return RelayError::InvalidRequest("missing required field: messages".to_string())
            .into_response();
    }
    let streaming = body.get("stream").and_then(Value::as_bool).unwrap_or(false);

    let header_provider = headers
        .get(PROVIDER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let explicit = path_provider.or(header_provider);

    // The incoming bearer token is captured for audit, never inspected.
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    let dispatch_id = Uuid::new_v4();
    debug!(
        id = %dispatch_id,
        model = %model,
        explicit = explicit.as_deref().unwrap_or("-"),
        stream = streaming,
        bearer = bearer.as_deref().unwrap_or("-"),
        "dispatching request"
    );

    // One snapshot for the whole request, however long it runs.
    let snapshot = state.registry.snapshot();
    let plan = match router::route(
        &snapshot,
        &state.counters,
        &state.health,
        &model,
        explicit.as_deref(),
    ) {
        Ok(plan) => plan,
        Err(e) => return e.into_response(),
    };
    debug!(
        id = %dispatch_id,
        via = plan.virtual_id.as_deref().unwrap_or("-"),
        candidates = plan.candidates.len(),
        "routing plan resolved"
    );

    if streaming {
        run_streaming(state, snapshot, plan, body).await
    } else {
        run_unary(state, snapshot, plan, body).await
    }
}

// ----------------------
// Unary path
// ----------------------

async fn run_unary(
    state: Arc<AppState>,
    snapshot: Arc<RegistrySnapshot>,
    plan: RoutingPlan,
    payload: Value,
) -> Response {
    let mut last_err: Option<UpstreamError> = None;

    for candidate in &plan.candidates {
        // State may have shifted since routing; check again.
        if let Err(reason) =
            router::check_candidate(&snapshot, &state.counters, &state.health, candidate)
        {
            debug!(provider = %candidate.provider.id, "candidate no longer eligible: {:?}", reason);
            continue;
        }

        match provider::send_unary(&state.client, &candidate.provider, &payload).await {
            Ok((body, usage)) => {
                record_success(&state, &snapshot, candidate, &usage);
                return (StatusCode::OK, Json(body)).into_response();
            }
            Err(e) if e.kind == UpstreamErrorKind::Request => {
                // The upstream judged the request itself malformed; another
                // provider would say the same.
                record_failure(&state, candidate);
                warn!(provider = %candidate.provider.id, "upstream rejected request: {}", e);
                return upstream_request_error(&candidate.provider.id, &e);
            }
            Err(e) => {
                record_failure(&state, candidate);
                note_provider_failure(&state, &candidate.provider, &e);
                warn!(provider = %candidate.provider.id, "attempt failed ({}): {}", e.kind.as_str(), e);
                last_err = Some(e);
            }
        }
    }

    RelayError::UpstreamExhausted(
        last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no candidate could be attempted".to_string()),
    )
    .into_response()
}

// ----------------------
// Streaming path
// ----------------------

async fn run_streaming(
    state: Arc<AppState>,
    snapshot: Arc<RegistrySnapshot>,
    plan: RoutingPlan,
    payload: Value,
) -> Response {
    let input_chars = provider::request_chars(&payload);
    let mut last_err: Option<UpstreamError> = None;

    for candidate in &plan.candidates {
        if let Err(reason) =
            router::check_candidate(&snapshot, &state.counters, &state.health, candidate)
        {
            debug!(provider = %candidate.provider.id, "candidate no longer eligible: {:?}", reason);
            continue;
        }

        let mut upstream =
            match provider::open_stream(&state.client, &candidate.provider, &payload).await {
                Ok(s) => s,
                Err(e) if e.kind == UpstreamErrorKind::Request => {
                    record_failure(&state, candidate);
                    warn!(provider = %candidate.provider.id, "upstream rejected request: {}", e);
                    return upstream_request_error(&candidate.provider.id, &e);
                }
                Err(e) => {
                    record_failure(&state, candidate);
                    note_provider_failure(&state, &candidate.provider, &e);
                    last_err = Some(e);
                    continue;
                }
            };

        // Anything that goes wrong before the first chunk still fails over.
        // The first chunk locks this candidate in for good.
        match upstream.next().await {
            Some(Ok(first)) => {
                let accounting = StreamAccounting::new(
                    state.clone(),
                    snapshot.clone(),
                    candidate.clone(),
                    input_chars,
                );
                return forward_stream(first, upstream, accounting);
            }
            Some(Err(e)) => {
                record_failure(&state, candidate);
                note_provider_failure(&state, &candidate.provider, &e);
                last_err = Some(e);
            }
            None => {
                let e = UpstreamError::transient("upstream closed before any data");
                record_failure(&state, candidate);
                note_provider_failure(&state, &candidate.provider, &e);
                last_err = Some(e);
            }
        }
    }

    RelayError::UpstreamExhausted(
        last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no candidate could be attempted".to_string()),
    )
    .into_response()
}

fn forward_stream(
    first: Bytes,
    mut upstream: ChunkStream,
    mut accounting: StreamAccounting,
) -> Response {
    let body = async_stream::stream! {
        accounting.scan(&first);
        yield Ok::<Bytes, std::convert::Infallible>(first);
        while let Some(item) = upstream.next().await {
            match item {
                Ok(chunk) => {
                    accounting.scan(&chunk);
                    yield Ok(chunk);
                }
                Err(e) => {
                    // Past the first chunk the only possible signal to the
                    // client is truncation.
                    warn!("stream interrupted after first chunk: {}", e);
                    accounting.mark_failed(e.to_string());
                    break;
                }
            }
        }
        accounting.mark_clean();
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body))
        .unwrap_or_else(|e| RelayError::Internal(e.to_string()).into_response())
}

#[derive(Debug, PartialEq)]
enum StreamOutcome {
    InFlight,
    Clean,
    Failed(String),
}

/// Owns usage attribution for one locked-in streaming attempt. Attribution
/// runs on drop so every exit records exactly once: clean close, mid-stream
/// upstream failure, and client disconnect (partial usage observed so far).
struct StreamAccounting {
    state: Arc<AppState>,
    snapshot: Arc<RegistrySnapshot>,
    candidate: RouteCandidate,
    scanner: SseScanner,
    input_chars: usize,
    outcome: StreamOutcome,
}

impl StreamAccounting {
    fn new(
        state: Arc<AppState>,
        snapshot: Arc<RegistrySnapshot>,
        candidate: RouteCandidate,
        input_chars: usize,
    ) -> Self {
        Self {
            state,
            snapshot,
            candidate,
            scanner: SseScanner::default(),
            input_chars,
            outcome: StreamOutcome::InFlight,
        }
    }

    fn scan(&mut self, chunk: &[u8]) {
        self.scanner.feed(chunk);
    }

    fn mark_failed(&mut self, message: String) {
        self.outcome = StreamOutcome::Failed(message);
    }

    fn mark_clean(&mut self) {
        if self.outcome == StreamOutcome::InFlight {
            self.outcome = StreamOutcome::Clean;
        }
    }
}

impl Drop for StreamAccounting {
    fn drop(&mut self) {
        let usage = match self.scanner.usage {
            Some((input, output)) => UsageReport {
                input_tokens: input,
                output_tokens: output,
                estimated: false,
            },
            None => UsageReport {
                input_tokens: provider::estimate_tokens(self.input_chars),
                output_tokens: provider::estimate_tokens(self.scanner.content_chars),
                estimated: true,
            },
        };
        let cost = self
            .candidate
            .provider
            .cost
            .as_ref()
            .map(|c| c.cost_of(usage.input_tokens, usage.output_tokens))
            .unwrap_or(0.0);
        let delta = UsageDelta {
            requests: 1,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            errors: matches!(self.outcome, StreamOutcome::Failed(_)) as u64,
            cost,
        };
        for scope in self.candidate.scopes.all() {
            self.state.counters.record(scope, &delta);
        }

        // Counters land before the health transition within one request.
        match &self.outcome {
            StreamOutcome::Clean => self.state.health.on_success(&self.candidate.provider.id),
            StreamOutcome::Failed(message) => {
                let policy = HealthPolicy::from(&*self.candidate.provider);
                self.state
                    .health
                    .on_failure(&self.candidate.provider.id, &policy, message);
            }
            StreamOutcome::InFlight => {
                debug!(
                    provider = %self.candidate.provider.id,
                    "client disconnected mid-stream; partial usage recorded"
                );
            }
        }

        post_flight_check(&self.state, &self.snapshot, &self.candidate);
    }
}

// ----------------------
// Attribution helpers
// ----------------------

fn record_success(
    state: &AppState,
    snapshot: &RegistrySnapshot,
    candidate: &RouteCandidate,
    usage: &UsageReport,
) {
    let cost = candidate
        .provider
        .cost
        .as_ref()
        .map(|c| c.cost_of(usage.input_tokens, usage.output_tokens))
        .unwrap_or(0.0);
    if usage.estimated {
        debug!(provider = %candidate.provider.id, "upstream omitted usage; recording character estimate");
    }
    let delta = UsageDelta::success(usage.input_tokens, usage.output_tokens, cost);
    for scope in candidate.scopes.all() {
        state.counters.record(scope, &delta);
    }
    // Counters land before the health transition within one request.
    state.health.on_success(&candidate.provider.id);
    post_flight_check(state, snapshot, candidate);
}

fn record_failure(state: &AppState, candidate: &RouteCandidate) {
    let delta = UsageDelta::failure();
    for scope in candidate.scopes.all() {
        state.counters.record(scope, &delta);
    }
}

fn note_provider_failure(state: &AppState, provider: &ProviderConfig, err: &UpstreamError) {
    let policy = HealthPolicy::from(provider);
    match err.kind {
        // Auth rejections will not self-repair; cool down immediately.
        UpstreamErrorKind::Auth => {
            state
                .health
                .force_cooling(&provider.id, &policy, None, &err.message)
        }
        UpstreamErrorKind::RateLimited => {
            state
                .health
                .force_cooling(&provider.id, &policy, err.retry_after, &err.message)
        }
        _ => state.health.on_failure(&provider.id, &policy, &err.message),
    }
}

/// A completed request may push a hard token limit over its threshold. The
/// in-flight request is never rolled back; the provider cools down instead
/// so nothing further is routed to it.
fn post_flight_check(state: &AppState, snapshot: &RegistrySnapshot, candidate: &RouteCandidate) {
    let scope = &candidate.scopes.member;
    let scope_limits = snapshot.limits_for(scope);
    if scope_limits.is_empty() {
        return;
    }
    let totals = state.counters.snapshot(scope);
    let breaches = limits::hard_token_breaches(&totals, scope_limits);
    if let Some(first) = breaches.first() {
        let policy = HealthPolicy::from(&*candidate.provider);
        state.health.force_cooling(
            &candidate.provider.id,
            &policy,
            None,
            &format!("hard limit crossed: {}", first),
        );
    }
}

fn upstream_request_error(provider_id: &str, err: &UpstreamError) -> Response {
    let status = err
        .status
        .and_then(|s| StatusCode::from_u16(s).ok())
        .unwrap_or(StatusCode::BAD_REQUEST);
    let body = json!({
        "error": {
            "message": format!("upstream {} rejected the request: {}", provider_id, err.message),
            "type": "upstream_rejected",
        }
    });
    (status, Json(body)).into_response()
}
