use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::{header::AUTHORIZATION, Client};
use serde_json::Value;
use std::{collections::HashMap, pin::Pin, time::Duration};
use tokio::time::sleep;
use tracing::debug;

use crate::config::{ProviderConfig, ProviderKind};
use crate::errors::{UpstreamError, UpstreamErrorKind};

/// Token accounting for one completed request. `estimated` marks values
/// derived from character counts because the upstream omitted usage data.
#[derive(Clone, Copy, Debug)]
pub struct UsageReport {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated: bool,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>>;

// ----------------------
// Send contract
// ----------------------

/// One request, full response body plus a usage report.
pub async fn send_unary(
    client: &Client,
    provider: &ProviderConfig,
    payload: &Value,
) -> Result<(Value, UsageReport), UpstreamError> {
    match &provider.kind {
        ProviderKind::Http { retry_count, .. } => {
            let attempts = 1 + *retry_count as usize;
            let mut last: Option<UpstreamError> = None;
            for attempt in 0..attempts {
                if attempt > 0 {
                    sleep(Duration::from_millis(250 * attempt as u64)).await;
                }
                match http_unary(client, provider, payload).await {
                    Ok(ok) => return Ok(ok),
                    Err(e) if e.kind == UpstreamErrorKind::Transient && attempt + 1 < attempts => {
                        debug!(provider = %provider.id, attempt, "transient upstream error, retrying: {}", e);
                        last = Some(e);
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(last.unwrap_or_else(|| UpstreamError::transient("retries exhausted")))
        }
        ProviderKind::Local { .. } => Err(local_unavailable(provider)),
    }
}

/// One request, raw upstream bytes as they arrive. The status line has
/// already been checked when this returns; failures after that point come
/// through the stream itself and must not trigger a retry.
pub async fn open_stream(
    client: &Client,
    provider: &ProviderConfig,
    payload: &Value,
) -> Result<ChunkStream, UpstreamError> {
    match &provider.kind {
        ProviderKind::Http { .. } => http_stream(client, provider, payload).await,
        ProviderKind::Local { .. } => Err(local_unavailable(provider)),
    }
}

fn local_unavailable(provider: &ProviderConfig) -> UpstreamError {
    // TODO: spawn `command` with the serialized request on stdin, read one
    // JSON response from stdout, terminate on timeout, and cap concurrent
    // spawns per provider.
    UpstreamError::transient(format!(
        "local provider {} cannot execute requests yet",
        provider.id
    ))
}

// ----------------------
// HTTP upstream
// ----------------------

fn completions_url(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim_end_matches('/'))
}

fn build_post(
    client: &Client,
    base_url: &str,
    auth_header: &Option<String>,
    extra_headers: &HashMap<String, String>,
    timeout_ms: u64,
) -> reqwest::RequestBuilder {
    let mut req = client
        .post(completions_url(base_url))
        .timeout(Duration::from_millis(timeout_ms.max(1_000)));
    if let Some(auth) = auth_header {
        req = req.header(AUTHORIZATION, auth);
    }
    for (name, value) in extra_headers {
        req = req.header(name.as_str(), value.as_str());
    }
    req
}

fn network_error(e: reqwest::Error) -> UpstreamError {
    if e.is_timeout() {
        UpstreamError::timeout()
    } else if e.is_connect() {
        UpstreamError::transient(format!("connection failed: {}", e))
    } else {
        UpstreamError::transient(format!("request failed: {}", e))
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}

async fn http_unary(
    client: &Client,
    provider: &ProviderConfig,
    payload: &Value,
) -> Result<(Value, UsageReport), UpstreamError> {
    let ProviderKind::Http {
        base_url,
        auth_header,
        extra_headers,
        timeout_ms,
        ..
    } = &provider.kind
    else {
        return Err(UpstreamError::transient("not an http provider"));
    };

    let resp = build_post(client, base_url, auth_header, extra_headers, *timeout_ms)
        .json(payload)
        .send()
        .await
        .map_err(network_error)?;

    let status = resp.status();
    let retry_after = parse_retry_after(resp.headers());
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(UpstreamError::from_status(status.as_u16(), &body, retry_after));
    }

    let body: Value = resp
        .json()
        .await
        .map_err(|e| UpstreamError::transient(format!("bad upstream json: {}", e)))?;
    let usage = usage_from_body(&body, payload);
    Ok((body, usage))
}

async fn http_stream(
    client: &Client,
    provider: &ProviderConfig,
    payload: &Value,
) -> Result<ChunkStream, UpstreamError> {
    let ProviderKind::Http {
        base_url,
        auth_header,
        extra_headers,
        timeout_ms,
        ..
    } = &provider.kind
    else {
        return Err(UpstreamError::transient("not an http provider"));
    };

    let resp = build_post(client, base_url, auth_header, extra_headers, *timeout_ms)
        .json(payload)
        .send()
        .await
        .map_err(network_error)?;

    let status = resp.status();
    let retry_after = parse_retry_after(resp.headers());
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(UpstreamError::from_status(status.as_u16(), &body, retry_after));
    }

    let stream = resp.bytes_stream().map(|item| {
        item.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::timeout()
            } else {
                UpstreamError::transient(format!("stream interrupted: {}", e))
            }
        })
    });
    Ok(Box::pin(stream))
}

// ----------------------
// Usage extraction
// ----------------------

/// Roughly one token per four characters when the upstream reports nothing.
pub fn estimate_tokens(chars: usize) -> u64 {
    ((chars + 3) / 4) as u64
}

pub fn extract_usage(body: &Value) -> Option<(u64, u64)> {
    let usage = body.get("usage")?;
    let input = usage.get("prompt_tokens").and_then(Value::as_u64)?;
    let output = usage
        .get("completion_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Some((input, output))
}

/// Character count of the request's message contents, for estimation.
pub fn request_chars(payload: &Value) -> usize {
    let Some(messages) = payload.get("messages").and_then(Value::as_array) else {
        return 0;
    };
    messages
        .iter()
        .map(|m| match m.get("content") {
            Some(Value::String(s)) => s.chars().count(),
            Some(Value::Array(parts)) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .map(|t| t.chars().count())
                .sum(),
            _ => 0,
        })
        .sum()
}

fn response_chars(body: &Value) -> usize {
    let Some(choices) = body.get("choices").and_then(Value::as_array) else {
        return 0;
    };
    choices
        .iter()
        .filter_map(|c| {
            c.get("message")
                .and_then(|m| m.get("content"))
                .and_then(Value::as_str)
        })
        .map(|t| t.chars().count())
        .sum()
}

fn usage_from_body(body: &Value, payload: &Value) -> UsageReport {
    match extract_usage(body) {
        Some((input, output)) => UsageReport {
            input_tokens: input,
            output_tokens: output,
            estimated: false,
        },
        None => UsageReport {
            input_tokens: estimate_tokens(request_chars(payload)),
            output_tokens: estimate_tokens(response_chars(body)),
            estimated: true,
        },
    }
}

// ----------------------
// SSE scanning
// ----------------------

/// Incremental scan of forwarded server-sent events. The bytes pass through
/// untouched; this only taps each `data:` payload for a usage report and
/// accumulates delta-content length for the estimation fallback.
#[derive(Default)]
pub struct SseScanner {
    buf: String,
    pub usage: Option<(u64, u64)>,
    pub content_chars: usize,
    pub saw_done: bool,
}

impl SseScanner {
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        while let Some(pos) = self.buf.find("\n\n") {
            let event: String = self.buf.drain(..pos + 2).collect();
            self.scan_event(&event);
        }
    }

    fn scan_event(&mut self, event: &str) {
        for line in event.lines() {
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                self.saw_done = true;
                continue;
            }
            let Ok(v) = serde_json::from_str::<Value>(data) else {
                continue;
            };
            if let Some(u) = extract_usage(&v) {
                self.usage = Some(u);
            }
            if let Some(choices) = v.get("choices").and_then(Value::as_array) {
                for c in choices {
                    if let Some(text) = c
                        .get("delta")
                        .and_then(|d| d.get("content"))
                        .and_then(Value::as_str)
                    {
                        self.content_chars += text.chars().count();
                    }
                }
            }
        }
    }
}
