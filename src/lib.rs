//! # llm-api-pool
//!
//! LLM API gateway that multiplexes client traffic across many upstream
//! providers. Clients address three virtual models (by default `haiku`,
//! `sonnet`, `opus`); the gateway routes each request to a concrete
//! `(provider, model)` endpoint chosen from the matching pool.
//!
//! ## Features
//!
//! - **Two-level selection**: round-robin across providers in a pool,
//!   weighted random across each provider's endpoints
//! - **Automatic failover**: per-request candidate sequence, cooling failed
//!   endpoints and retrying the next one transparently
//! - **Health tracking**: cooldown state, soft rate gates, counters and
//!   exponentially smoothed latency per endpoint
//! - **Format bridging**: either client wire format (OpenAI chat
//!   completions or Anthropic messages) to either upstream format,
//!   including streaming event conversion
//! - **Admin API**: provider/endpoint/pool CRUD, stats, attempt log
//!
//! ## Example
//!
//! ```rust,no_run
//! use llm_api_pool::{api, config::Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     api::serve(config).await
//! }
//! ```

pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod logsink;
pub mod registry;
pub mod selector;
pub mod stats;
pub mod store;
pub mod translate;
pub mod wire;

pub use config::Config;
pub use dispatch::{DispatchReply, Dispatcher};
pub use error::{AttemptError, GatewayError};
pub use health::{EndpointHealth, EndpointState, ProviderCounters};
pub use logsink::{LogEntry, LogSink};
pub use registry::{ApiFormat, Endpoint, PoolConfig, PoolTag, Provider, Registry};
pub use selector::{Candidate, Selector};
pub use stats::GatewayStats;
pub use store::{LogFilter, Store};
