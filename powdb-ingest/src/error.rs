//! Error types for powdb-ingest
//!
//! Source-level failures are captured per source and reported in the run
//! manifest; only configuration errors and a total outage are fatal.

use crate::types::SourceId;
use thiserror::Error;

/// Maximum number of raw-response bytes kept for diagnostics
pub const SNIPPET_LEN: usize = 512;

/// Errors raised by source adapters, the normalizer and the audit resolver
#[derive(Debug, Error)]
pub enum SourceError {
    /// Transport/network failure or server-side error (retryable)
    #[error("Source '{source_id}' unavailable: {message}")]
    SourceUnavailable { source_id: SourceId, message: String },

    /// Source refused the query (malformed, oversized, not found)
    #[error("Source '{source_id}' rejected query (status {status:?}): {message}")]
    SourceQueryRejected {
        source_id: SourceId,
        status: Option<u16>,
        message: String,
    },

    /// Response did not match the expected schema
    #[error("Source '{source_id}' returned unparseable response: {message} (body starts: {snippet:?})")]
    SourceResponseUnparseable {
        source_id: SourceId,
        message: String,
        snippet: String,
    },

    /// Source id is not configured
    #[error("Unknown source: {0}")]
    UnknownSource(SourceId),

    /// Source does not expose change history
    #[error("Source '{0}' does not support change history")]
    HistoryUnsupported(SourceId),
}

impl SourceError {
    /// Only transport failures are worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::SourceUnavailable { .. })
    }

    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            SourceError::SourceUnavailable { .. } => "source_unavailable",
            SourceError::SourceQueryRejected { .. } => "source_query_rejected",
            SourceError::SourceResponseUnparseable { .. } => "source_response_unparseable",
            SourceError::UnknownSource(_) => "unknown_source",
            SourceError::HistoryUnsupported(_) => "history_unsupported",
        }
    }

    /// Build an unparseable-response error keeping a bounded body snippet
    pub fn unparseable(source_id: &SourceId, message: impl Into<String>, body: &str) -> Self {
        SourceError::SourceResponseUnparseable {
            source_id: source_id.clone(),
            message: message.into(),
            snippet: snippet(body),
        }
    }
}

/// Truncate a response body for diagnostics on a char boundary
pub fn snippet(body: &str) -> String {
    if body.len() <= SNIPPET_LEN {
        return body.to_string();
    }
    let mut end = SNIPPET_LEN;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}

/// Fatal pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration invalid (fatal at startup)
    #[error(transparent)]
    Config(#[from] powdb_common::Error),

    /// Source wiring error at startup
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Every configured source failed; nothing to merge
    #[error("All {} sources failed: {}", .0.len(), summarize(.0))]
    AllSourcesFailed(Vec<(SourceId, String)>),
}

fn summarize(failures: &[(SourceId, String)]) -> String {
    failures
        .iter()
        .map(|(id, msg)| format!("{}: {}", id, msg))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for source operations
pub type SourceResult<T> = Result<T, SourceError>;
