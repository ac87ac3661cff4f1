//! Append-only attempt log and health persistence, fed through a
//! single-writer queue so the dispatch hot path never waits on disk I/O.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::health::{EndpointState, ProviderCounters};
use crate::registry::PoolTag;
use crate::store::Store;

/// Soft cap on retained log entries; oldest are evicted past it.
pub const DEFAULT_LOG_CAP: usize = 10_000;

/// One dispatch attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    /// Assigned by the store; zero before persistence.
    #[serde(default)]
    pub id: i64,
    pub pool: PoolTag,

    /// Virtual model the client asked for.
    pub requested_model: String,

    /// Upstream model actually dispatched (empty for aggregate entries).
    pub actual_model: String,

    pub provider_name: String,
    pub success: bool,
    pub http_status: Option<u16>,
    pub error: Option<String>,
    pub latency_ms: u64,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// Messages accepted by the writer task.
pub enum SinkMessage {
    Attempt(LogEntry),
    EndpointHealth {
        endpoint_id: i64,
        state: EndpointState,
    },
    ProviderCounters {
        provider_id: i64,
        counters: ProviderCounters,
    },
}

/// Cloneable producer handle. Sends never block and never fail the dispatch
/// path; a closed writer only drops the message.
#[derive(Clone)]
pub struct LogSink {
    tx: mpsc::UnboundedSender<SinkMessage>,
}

impl LogSink {
    /// Producer plus raw receiver, for tests that inspect the queue.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SinkMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Producer wired to a spawned writer task that applies messages to the
    /// store in arrival order.
    pub fn spawn_writer(store: Arc<Store>, cap: usize) -> (Self, tokio::task::JoinHandle<()>) {
        let (sink, mut rx) = Self::channel();
        let handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let result = match msg {
                    SinkMessage::Attempt(entry) => store.append_log(&entry, cap).await,
                    SinkMessage::EndpointHealth { endpoint_id, state } => {
                        store.update_endpoint_health(endpoint_id, &state).await
                    }
                    SinkMessage::ProviderCounters {
                        provider_id,
                        counters,
                    } => store.update_provider_counters(provider_id, &counters).await,
                };
                if let Err(e) = result {
                    warn!(error = %e, "Log writer failed to persist message");
                }
            }
        });
        (sink, handle)
    }

    pub fn record(&self, entry: LogEntry) {
        let _ = self.tx.send(SinkMessage::Attempt(entry));
    }

    pub fn flush_endpoint(&self, endpoint_id: i64, state: EndpointState) {
        let _ = self
            .tx
            .send(SinkMessage::EndpointHealth { endpoint_id, state });
    }

    pub fn flush_provider(&self, provider_id: i64, counters: ProviderCounters) {
        let _ = self
            .tx
            .send(SinkMessage::ProviderCounters {
                provider_id,
                counters,
            });
    }
}
