//! Per-request dispatch pipeline.
//!
//! Resolve the virtual model to a pool, walk the selector's candidate
//! sequence, translate to each provider's wire format, call upstream with
//! the pool timeout governing time-to-first-byte, and fail over on error.
//! Streaming responses are piped through the translator state machines;
//! once a byte has reached the client no further retry is possible.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{AttemptError, GatewayError};
use crate::health::{cooldown_secs_for, EndpointHealth};
use crate::logsink::{LogEntry, LogSink};
use crate::registry::{ApiFormat, PoolConfig, PoolTag, Registry};
use crate::selector::{Candidate, Selector};
use crate::translate::{
    chat_response_to_messages, chat_to_messages, messages_response_to_chat, messages_to_chat,
    AnthropicToOpenAi, OpenAiToAnthropic, SseBuffer,
};
use crate::wire::{ChatRequest, MessagesRequest};

/// What the client gets back: a JSON body or an SSE byte stream, already in
/// the client's wire format.
pub enum DispatchReply {
    Json(Value),
    Stream(BoxStream<'static, Result<Bytes, std::io::Error>>),
}

impl std::fmt::Debug for DispatchReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchReply::Json(v) => f.debug_tuple("Json").field(v).finish(),
            DispatchReply::Stream(_) => f.debug_tuple("Stream").field(&"..").finish(),
        }
    }
}

/// Inbound request, one variant per client path.
#[derive(Debug)]
enum Inbound {
    OpenAi(ChatRequest),
    Anthropic(MessagesRequest),
}

impl Inbound {
    fn model(&self) -> &str {
        match self {
            Inbound::OpenAi(req) => &req.model,
            Inbound::Anthropic(req) => &req.model,
        }
    }

    fn stream(&self) -> bool {
        match self {
            Inbound::OpenAi(req) => req.stream.unwrap_or(false),
            Inbound::Anthropic(req) => req.stream.unwrap_or(false),
        }
    }
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    health: Arc<EndpointHealth>,
    selector: Selector,
    sink: LogSink,
    http: reqwest::Client,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        health: Arc<EndpointHealth>,
        sink: LogSink,
        http: reqwest::Client,
    ) -> Self {
        Self {
            registry,
            health,
            selector: Selector::new(),
            sink,
            http,
        }
    }

    /// Entry point for both client paths.
    pub async fn dispatch(
        &self,
        client_format: ApiFormat,
        body: Value,
    ) -> Result<DispatchReply, GatewayError> {
        let inbound = parse_inbound(client_format, body)?;
        let requested_model = inbound.model().to_string();
        let pool = self
            .registry
            .resolve_virtual_model(&requested_model)
            .ok_or_else(|| GatewayError::UnknownModel(requested_model.clone()))?;

        let pool_config = self.registry.pool_config(pool);
        let groups = self.registry.pool_snapshot(pool);
        if groups.is_empty() {
            return Err(GatewayError::PoolEmpty(pool));
        }

        let now = Utc::now();
        let candidates = {
            let mut rng = rand::thread_rng();
            self.selector
                .candidates(pool, &groups, &self.health, now, &mut rng)
        };

        let budget = pool_config
            .max_retries
            .map(|n| n as usize)
            .unwrap_or(usize::MAX)
            .min(candidates.len());

        let streaming = inbound.stream();
        let mut failures: Vec<(String, String)> = Vec::new();
        let mut translation_error: Option<GatewayError> = None;
        // Translated bodies, built lazily per candidate wire format. A failed
        // conversion is cached too: it only eliminates the candidates that
        // need that format, never the rest of the pool, and does not consume
        // an attempt or touch endpoint health.
        let mut bodies: HashMap<ApiFormat, Result<Value, String>> = HashMap::new();
        let mut attempts = 0usize;

        for candidate in &candidates {
            if attempts >= budget {
                break;
            }

            let format = candidate.provider.api_format;
            let translated = bodies.entry(format).or_insert_with(|| {
                build_upstream_body(&inbound, format).map_err(|e| match e {
                    GatewayError::Translation(message) => message,
                    other => other.to_string(),
                })
            });
            let mut body = match translated {
                Ok(value) => value.clone(),
                Err(message) => {
                    debug!(
                        provider = %candidate.provider.name,
                        format = %format,
                        error = %message,
                        "Candidate skipped, request not expressible in its wire format"
                    );
                    if translation_error.is_none() {
                        translation_error = Some(GatewayError::Translation(message.clone()));
                    }
                    continue;
                }
            };
            body["model"] = json!(candidate.endpoint.upstream_model);

            debug!(
                pool = %pool,
                provider = %candidate.provider.name,
                model = %candidate.endpoint.upstream_model,
                degraded = candidate.degraded,
                "Trying candidate"
            );

            attempts += 1;
            let started = Instant::now();
            let result = self
                .attempt(
                    client_format,
                    candidate,
                    pool,
                    &requested_model,
                    &pool_config,
                    body,
                    streaming,
                )
                .await;
            let latency_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok((reply, tokens)) => {
                    self.record_success(candidate, pool, &requested_model, latency_ms, tokens);
                    return Ok(reply);
                }
                Err(err) => {
                    let cooldown = cooldown_secs_for(&err, pool_config.cooldown_secs);
                    warn!(
                        pool = %pool,
                        provider = %candidate.provider.name,
                        model = %candidate.endpoint.upstream_model,
                        error = %err,
                        cooldown_secs = cooldown,
                        "Candidate failed, trying next"
                    );
                    self.record_failure(candidate, pool, &requested_model, latency_ms, &err, cooldown);
                    failures.push((candidate.provider.name.clone(), err.to_string()));
                }
            }
        }

        // Nothing reached an upstream and at least one candidate was
        // untranslatable: the request itself is at fault, not the pool.
        if failures.is_empty() {
            if let Some(err) = translation_error {
                return Err(err);
            }
        }

        let summary = failure_summary(&failures);
        self.sink.record(LogEntry {
            id: 0,
            pool,
            requested_model,
            actual_model: String::new(),
            provider_name: "-".to_string(),
            success: false,
            http_status: None,
            error: Some(summary.clone()),
            latency_ms: 0,
            input_tokens: None,
            output_tokens: None,
            created_at: Utc::now(),
        });
        Err(GatewayError::AllCandidatesFailed {
            pool,
            attempts: failures.len(),
            summary,
        })
    }

    /// One upstream attempt. Returns only after the response is complete
    /// (non-streaming) or the first event is in hand (streaming).
    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        client_format: ApiFormat,
        candidate: &Candidate,
        pool: PoolTag,
        requested_model: &str,
        pool_config: &PoolConfig,
        body: Value,
        streaming: bool,
    ) -> Result<(DispatchReply, Option<(u64, u64)>), AttemptError> {
        let provider = &candidate.provider;
        let upstream_format = provider.api_format;
        let url = upstream_url(upstream_format, &provider.base_url);

        // A zero timeout would fail every request instantly; treat it as an
        // hour instead.
        let timeout_secs = if pool_config.timeout_secs == 0 {
            3600
        } else {
            pool_config.timeout_secs
        };
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(timeout_secs);

        let mut request = self.http.post(&url).json(&body);
        request = match upstream_format {
            ApiFormat::OpenAi => {
                request.header("Authorization", format!("Bearer {}", provider.api_key))
            }
            ApiFormat::Anthropic => request
                .header("x-api-key", &provider.api_key)
                .header("anthropic-version", "2023-06-01"),
        };

        let response = tokio::time::timeout_at(deadline, request.send())
            .await
            .map_err(|_| AttemptError::Timeout(timeout_secs))?
            .map_err(|e| AttemptError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AttemptError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        if !streaming {
            let raw = response
                .bytes()
                .await
                .map_err(|e| AttemptError::Transport(e.to_string()))?;
            let (value, tokens) = translate_response_body(upstream_format, client_format, &raw)?;
            return Ok((DispatchReply::Json(value), tokens));
        }

        // Streaming: the pool timeout keeps governing until the first
        // translated event is in hand, then stops applying.
        let mut upstream = response.bytes_stream();
        let mut sse = SseBuffer::new();
        let mut bridge = StreamBridge::new(
            upstream_format,
            client_format,
            &candidate.endpoint.upstream_model,
        );

        let first_frames = tokio::time::timeout_at(
            deadline,
            read_first_frames(&mut upstream, &mut sse, &mut bridge),
        )
        .await
        .map_err(|_| AttemptError::Timeout(timeout_secs))??;

        // Past this point the attempt is committed: a disconnect guard logs
        // status 499 if the client goes away before the stream completes.
        let mut guard = DisconnectGuard::new(
            self.sink.clone(),
            disconnect_entry(candidate, pool, requested_model),
        );

        let stream = async_stream::stream! {
            for frame in first_frames {
                yield Ok::<_, std::io::Error>(frame);
            }
            loop {
                match upstream.next().await {
                    Some(Ok(chunk)) => match bridge.feed(&chunk, &mut sse) {
                        Ok(frames) => {
                            for frame in frames {
                                yield Ok(frame);
                            }
                        }
                        Err(message) => {
                            warn!(error = %message, "Upstream stream error after first event");
                            yield Ok(sse_error_frame(client_format, &message));
                            guard.complete();
                            break;
                        }
                    },
                    Some(Err(e)) => {
                        warn!(error = %e, "Upstream stream transport error after first event");
                        yield Ok(sse_error_frame(client_format, &e.to_string()));
                        guard.complete();
                        break;
                    }
                    None => {
                        for frame in bridge.eof() {
                            yield Ok(frame);
                        }
                        guard.complete();
                        break;
                    }
                }
            }
        };

        Ok((DispatchReply::Stream(stream.boxed()), None))
    }

    fn record_success(
        &self,
        candidate: &Candidate,
        pool: PoolTag,
        requested_model: &str,
        latency_ms: u64,
        tokens: Option<(u64, u64)>,
    ) {
        let now = Utc::now();
        let state = self.health.mark_success(
            candidate.endpoint.id,
            candidate.provider.id,
            latency_ms,
            now,
        );
        self.sink.flush_endpoint(candidate.endpoint.id, state);
        self.sink.flush_provider(
            candidate.provider.id,
            self.health.provider_counters(candidate.provider.id),
        );
        self.sink.record(LogEntry {
            id: 0,
            pool,
            requested_model: requested_model.to_string(),
            actual_model: candidate.endpoint.upstream_model.clone(),
            provider_name: candidate.provider.name.clone(),
            success: true,
            http_status: Some(200),
            error: None,
            latency_ms,
            input_tokens: tokens.map(|(i, _)| i),
            output_tokens: tokens.map(|(_, o)| o),
            created_at: now,
        });
    }

    fn record_failure(
        &self,
        candidate: &Candidate,
        pool: PoolTag,
        requested_model: &str,
        latency_ms: u64,
        err: &AttemptError,
        cooldown_secs: u64,
    ) {
        let now = Utc::now();
        let state = self.health.mark_failure(
            candidate.endpoint.id,
            candidate.provider.id,
            err.to_string(),
            cooldown_secs,
            now,
        );
        self.sink.flush_endpoint(candidate.endpoint.id, state);
        self.sink.flush_provider(
            candidate.provider.id,
            self.health.provider_counters(candidate.provider.id),
        );
        self.sink.record(LogEntry {
            id: 0,
            pool,
            requested_model: requested_model.to_string(),
            actual_model: candidate.endpoint.upstream_model.clone(),
            provider_name: candidate.provider.name.clone(),
            success: false,
            http_status: err.status(),
            error: Some(err.to_string()),
            latency_ms,
            input_tokens: None,
            output_tokens: None,
            created_at: now,
        });
    }
}

fn parse_inbound(format: ApiFormat, body: Value) -> Result<Inbound, GatewayError> {
    let result = match format {
        ApiFormat::OpenAi => serde_json::from_value(body).map(Inbound::OpenAi),
        ApiFormat::Anthropic => serde_json::from_value(body).map(Inbound::Anthropic),
    };
    result.map_err(|e| GatewayError::Translation(format!("invalid request body: {}", e)))
}

/// Serialise the inbound request in `target` format, model left for the
/// per-candidate rewrite. A request the target format cannot express is a
/// `Translation` error; the dispatch loop skips only the candidates that
/// speak that format.
fn build_upstream_body(inbound: &Inbound, target: ApiFormat) -> Result<Value, GatewayError> {
    let value = match (inbound, target) {
        (Inbound::OpenAi(req), ApiFormat::OpenAi) => serde_json::to_value(req),
        (Inbound::Anthropic(req), ApiFormat::Anthropic) => serde_json::to_value(req),
        (Inbound::OpenAi(req), ApiFormat::Anthropic) => {
            serde_json::to_value(chat_to_messages(req.clone(), "")?)
        }
        (Inbound::Anthropic(req), ApiFormat::OpenAi) => {
            serde_json::to_value(messages_to_chat(req.clone(), "")?)
        }
    };
    value.map_err(|e| GatewayError::Translation(e.to_string()))
}

/// Canonical upstream URL per wire format. An Anthropic base already ending
/// in `/v1` is not doubled.
fn upstream_url(format: ApiFormat, base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    match format {
        ApiFormat::OpenAi => format!("{}/chat/completions", base),
        ApiFormat::Anthropic => {
            if base.ends_with("/v1") {
                format!("{}/messages", base)
            } else {
                format!("{}/v1/messages", base)
            }
        }
    }
}

/// Translate a complete upstream response body into the client format,
/// returning the body and `(input, output)` token counts when present.
fn translate_response_body(
    upstream: ApiFormat,
    client: ApiFormat,
    raw: &[u8],
) -> Result<(Value, Option<(u64, u64)>), AttemptError> {
    let malformed = |e: &dyn std::fmt::Display| AttemptError::Malformed(e.to_string());
    match (upstream, client) {
        (ApiFormat::Anthropic, ApiFormat::OpenAi) => {
            let resp: crate::wire::MessagesResponse =
                serde_json::from_slice(raw).map_err(|e| malformed(&e))?;
            let tokens = Some((resp.usage.input_tokens, resp.usage.output_tokens));
            let value =
                serde_json::to_value(messages_response_to_chat(resp)).map_err(|e| malformed(&e))?;
            Ok((value, tokens))
        }
        (ApiFormat::OpenAi, ApiFormat::Anthropic) => {
            let resp: crate::wire::ChatResponse =
                serde_json::from_slice(raw).map_err(|e| malformed(&e))?;
            let tokens = resp
                .usage
                .as_ref()
                .map(|u| (u.prompt_tokens, u.completion_tokens));
            let converted = chat_response_to_messages(resp).map_err(|e| malformed(&e))?;
            let value = serde_json::to_value(converted).map_err(|e| malformed(&e))?;
            Ok((value, tokens))
        }
        _ => {
            let value: Value = serde_json::from_slice(raw).map_err(|e| malformed(&e))?;
            let usage = &value["usage"];
            let tokens = match upstream {
                ApiFormat::OpenAi => usage["prompt_tokens"]
                    .as_u64()
                    .map(|p| (p, usage["completion_tokens"].as_u64().unwrap_or(0))),
                ApiFormat::Anthropic => usage["input_tokens"]
                    .as_u64()
                    .map(|i| (i, usage["output_tokens"].as_u64().unwrap_or(0))),
            };
            Ok((value, tokens))
        }
    }
}

/// Streaming translation: passthrough when formats match, otherwise one of
/// the two state machines.
enum StreamBridge {
    Passthrough,
    ToOpenAi(AnthropicToOpenAi),
    ToAnthropic(OpenAiToAnthropic),
}

impl StreamBridge {
    fn new(upstream: ApiFormat, client: ApiFormat, model: &str) -> Self {
        match (upstream, client) {
            (ApiFormat::Anthropic, ApiFormat::OpenAi) => {
                StreamBridge::ToOpenAi(AnthropicToOpenAi::new(model))
            }
            (ApiFormat::OpenAi, ApiFormat::Anthropic) => {
                StreamBridge::ToAnthropic(OpenAiToAnthropic::new(model))
            }
            _ => StreamBridge::Passthrough,
        }
    }

    fn feed(&mut self, chunk: &Bytes, sse: &mut SseBuffer) -> Result<Vec<Bytes>, String> {
        match self {
            StreamBridge::Passthrough => {
                if chunk.is_empty() {
                    Ok(Vec::new())
                } else {
                    Ok(vec![chunk.clone()])
                }
            }
            StreamBridge::ToOpenAi(machine) => {
                let mut frames = Vec::new();
                for payload in sse.push(chunk) {
                    frames.extend(machine.on_payload(&payload)?);
                }
                Ok(frames.into_iter().map(Bytes::from).collect())
            }
            StreamBridge::ToAnthropic(machine) => {
                let mut frames = Vec::new();
                for payload in sse.push(chunk) {
                    frames.extend(machine.on_payload(&payload)?);
                }
                Ok(frames.into_iter().map(Bytes::from).collect())
            }
        }
    }

    fn eof(&mut self) -> Vec<Bytes> {
        match self {
            StreamBridge::Passthrough => Vec::new(),
            StreamBridge::ToOpenAi(machine) => machine.eof().into_iter().map(Bytes::from).collect(),
            StreamBridge::ToAnthropic(machine) => {
                machine.eof().into_iter().map(Bytes::from).collect()
            }
        }
    }
}

async fn read_first_frames(
    upstream: &mut (impl futures::Stream<Item = reqwest::Result<Bytes>> + Unpin),
    sse: &mut SseBuffer,
    bridge: &mut StreamBridge,
) -> Result<Vec<Bytes>, AttemptError> {
    loop {
        match upstream.next().await {
            Some(Ok(chunk)) => {
                let frames = bridge.feed(&chunk, sse).map_err(AttemptError::Malformed)?;
                if !frames.is_empty() {
                    return Ok(frames);
                }
            }
            Some(Err(e)) => return Err(AttemptError::Transport(e.to_string())),
            None => {
                return Err(AttemptError::Malformed(
                    "stream ended before first event".into(),
                ))
            }
        }
    }
}

fn sse_error_frame(client_format: ApiFormat, message: &str) -> Bytes {
    let frame = match client_format {
        ApiFormat::OpenAi => format!(
            "data: {}\n\n",
            json!({"error": {"message": message, "type": "upstream_error"}})
        ),
        ApiFormat::Anthropic => format!(
            "event: error\ndata: {}\n\n",
            json!({"type": "error", "error": {"type": "upstream_error", "message": message}})
        ),
    };
    Bytes::from(frame)
}

fn failure_summary(failures: &[(String, String)]) -> String {
    if failures.is_empty() {
        return "no selectable endpoints".to_string();
    }
    // Last error per provider, first-seen provider order.
    let mut order: Vec<&str> = Vec::new();
    let mut last: HashMap<&str, &str> = HashMap::new();
    for (provider, error) in failures {
        if !last.contains_key(provider.as_str()) {
            order.push(provider.as_str());
        }
        last.insert(provider.as_str(), error.as_str());
    }
    order
        .iter()
        .map(|p| format!("{}: {}", p, last[p]))
        .collect::<Vec<_>>()
        .join("; ")
}

fn disconnect_entry(candidate: &Candidate, pool: PoolTag, requested_model: &str) -> LogEntry {
    LogEntry {
        id: 0,
        pool,
        requested_model: requested_model.to_string(),
        actual_model: candidate.endpoint.upstream_model.clone(),
        provider_name: candidate.provider.name.clone(),
        success: false,
        http_status: Some(499),
        error: Some("client disconnected mid-stream".to_string()),
        latency_ms: 0,
        input_tokens: None,
        output_tokens: None,
        created_at: Utc::now(),
    }
}

/// Logs a 499 entry when dropped before `complete`, i.e. when the client
/// went away while the stream was still live. Dropping the enclosing stream
/// also drops the upstream body, which aborts the upstream request.
struct DisconnectGuard {
    sink: LogSink,
    entry: Option<LogEntry>,
}

impl DisconnectGuard {
    fn new(sink: LogSink, entry: LogEntry) -> Self {
        Self {
            sink,
            entry: Some(entry),
        }
    }

    fn complete(&mut self) {
        self.entry = None;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.sink.record(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_url_shapes() {
        assert_eq!(
            upstream_url(ApiFormat::OpenAi, "https://api.openai.com/v1"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            upstream_url(ApiFormat::OpenAi, "https://api.groq.com/openai/v1/"),
            "https://api.groq.com/openai/v1/chat/completions"
        );
        assert_eq!(
            upstream_url(ApiFormat::Anthropic, "https://api.anthropic.com"),
            "https://api.anthropic.com/v1/messages"
        );
        // A base already ending in /v1 is not doubled.
        assert_eq!(
            upstream_url(ApiFormat::Anthropic, "https://api.anthropic.com/v1"),
            "https://api.anthropic.com/v1/messages"
        );
    }

    #[test]
    fn test_failure_summary_keeps_last_error_per_provider() {
        let failures = vec![
            ("p1".to_string(), "HTTP 500".to_string()),
            ("p2".to_string(), "timeout".to_string()),
            ("p1".to_string(), "HTTP 503".to_string()),
        ];
        let summary = failure_summary(&failures);
        assert_eq!(summary, "p1: HTTP 503; p2: timeout");
    }

    #[test]
    fn test_parse_inbound_rejects_garbage() {
        let err = parse_inbound(ApiFormat::OpenAi, json!({"messages": "nope"})).unwrap_err();
        assert!(matches!(err, GatewayError::Translation(_)));
    }

    #[test]
    fn test_build_upstream_body_cross_format() {
        let inbound = parse_inbound(
            ApiFormat::OpenAi,
            json!({"model": "sonnet", "messages": [{"role": "user", "content": "hi"}]}),
        )
        .unwrap();
        let body = build_upstream_body(&inbound, ApiFormat::Anthropic).unwrap();
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["messages"][0]["role"], "user");
    }
}
