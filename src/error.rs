//! Error types for the gateway.

use thiserror::Error;

use crate::registry::PoolTag;

/// Errors surfaced to the client by the dispatch pipeline.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Virtual model name does not match any pool mapping.
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// The pool has no endpoints at all.
    #[error("Pool '{0}' has no endpoints")]
    PoolEmpty(PoolTag),

    /// The pool had endpoints but every candidate failed.
    #[error("All {attempts} candidate(s) in pool '{pool}' failed: {summary}")]
    AllCandidatesFailed {
        pool: PoolTag,
        attempts: usize,
        summary: String,
    },

    /// The request cannot be expressed in the target wire format.
    #[error("Translation error: {0}")]
    Translation(String),

    /// Persistence failure outside the dispatch hot path.
    #[error("Store error: {0}")]
    Store(String),
}

impl From<rusqlite::Error> for GatewayError {
    fn from(err: rusqlite::Error) -> Self {
        GatewayError::Store(err.to_string())
    }
}

/// Failure of a single upstream attempt, classified for cooldown purposes.
#[derive(Error, Debug)]
pub enum AttemptError {
    /// Connection refused, DNS, TLS, read/write.
    #[error("upstream transport error: {0}")]
    Transport(String),

    /// Pool timeout exceeded before the first response byte.
    #[error("upstream timeout after {0}s")]
    Timeout(u64),

    /// Non-2xx upstream response.
    #[error("upstream returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Unparseable body, or a stream that died before its first event.
    #[error("malformed upstream response: {0}")]
    Malformed(String),
}

impl AttemptError {
    /// HTTP status associated with the failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            AttemptError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the failure warrants the full pool cooldown.
    ///
    /// Transport errors, timeouts, 5xx and the retriable-ish 4xx statuses
    /// (401/403/408/425/429) take the full cooldown. Other 4xx responses and
    /// malformed bodies are client-correctable, so they only get the short
    /// cooldown; the same goes for explicit insufficient-credit rejections,
    /// which would otherwise poison a pool until an operator intervenes.
    pub fn wants_full_cooldown(&self) -> bool {
        match self {
            AttemptError::Transport(_) | AttemptError::Timeout(_) => true,
            AttemptError::Malformed(_) => false,
            AttemptError::Http { status, body } => match status {
                401 | 403 | 408 | 425 | 429 => !is_insufficient_credit(body),
                500..=599 => true,
                _ => false,
            },
        }
    }
}

/// Detect provider "out of credit" rejections from the response body.
fn is_insufficient_credit(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("insufficient_quota")
        || lower.contains("insufficient credit")
        || lower.contains("credit balance is too low")
}
