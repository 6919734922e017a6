//! Source adapters
//!
//! One adapter per source type. Each builds a source-native query, executes
//! it and decodes the response into [`RawRecord`]s. Adapters are independent
//! and run concurrently; one failing never blocks another.
//!
//! # Adapters
//! - **overpass** - geospatial tag service (OpenStreetMap via Overpass QL)
//! - **sparql** - linked-data knowledge base (SPARQL JSON results)
//!
//! Degraded results (truncation, unsupported geometry, skipped records) are
//! reported as [`SourceWarning`]s, never dropped silently.

pub mod http;
pub mod overpass;
pub mod sparql;

use crate::config::{PipelineConfig, SourceConfig};
use crate::error::SourceResult;
use crate::types::{ElementKind, RawRecord, SourceId, SourceKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub use overpass::OverpassAdapter;
pub use sparql::SparqlAdapter;

/// Non-fatal condition observed while fetching
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceWarning {
    /// Multi-point geometries are not resolved to entities yet
    UnsupportedGeometry { kind: ElementKind, count: usize },
    /// Result set appears cut off by a limit
    Truncated { limit: usize, received: usize },
    /// Individual records that could not be decoded
    MalformedRecords { count: usize },
    /// Free-text remark returned by the server
    ServerRemark { remark: String },
}

impl fmt::Display for SourceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedGeometry { kind, count } => {
                write!(f, "{} {}(s) not handled, attribute coverage incomplete", count, kind)
            }
            Self::Truncated { limit, received } => {
                write!(f, "result set truncated ({} received, limit {})", received, limit)
            }
            Self::MalformedRecords { count } => write!(f, "{} malformed record(s) skipped", count),
            Self::ServerRemark { remark } => write!(f, "server remark: {}", remark),
        }
    }
}

/// Decoded records plus everything the caller needs to judge completeness
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub records: Vec<RawRecord>,
    pub warnings: Vec<SourceWarning>,
    /// Raw response size
    pub bytes: u64,
}

impl FetchOutcome {
    pub fn is_truncated(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, SourceWarning::Truncated { .. }))
    }
}

/// Fetches raw records from one configured source
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &SourceId;

    fn kind(&self) -> SourceKind;

    /// Build, execute and decode the configured query
    async fn fetch(&self) -> SourceResult<FetchOutcome>;
}

/// Build one adapter per configured source
pub fn build_adapters(config: &PipelineConfig) -> SourceResult<Vec<Arc<dyn SourceAdapter>>> {
    config
        .sources
        .iter()
        .map(|source| -> SourceResult<Arc<dyn SourceAdapter>> {
            Ok(match source {
                SourceConfig::Overpass(c) => Arc::new(OverpassAdapter::new(c.clone())?),
                SourceConfig::Sparql(c) => Arc::new(SparqlAdapter::new(c.clone())?),
            })
        })
        .collect()
}
