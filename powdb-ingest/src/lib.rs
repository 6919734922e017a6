//! # powdb-ingest
//!
//! Places-of-worship aggregation pipeline: queries heterogeneous public
//! sources, normalizes their records into one canonical entity model and
//! merges matching entities across sources with per-value provenance.
//!
//! # Stages
//! 1. [`sources`] - build, execute and decode source-native queries
//! 2. [`extract`] - map raw tags/variables onto semantic attributes
//! 3. [`normalize`] - raw record → source-scoped [`types::Entity`]
//! 4. [`merge`] - cluster and reconcile into [`types::MergedEntity`]
//! 5. [`audit`] - optional change-history lookups for flagged entities
//!
//! [`pipeline::Pipeline`] wires the stages together.

pub mod audit;
pub mod config;
pub mod error;
pub mod extract;
pub mod merge;
pub mod normalize;
pub mod pipeline;
pub mod sources;
pub mod summary;
pub mod types;

pub use config::PipelineConfig;
pub use error::{PipelineError, SourceError, SourceResult};
pub use merge::MergeEngine;
pub use normalize::{Normalizer, SourceRegistry};
pub use pipeline::{Pipeline, PipelineOutput, SourceReport, SourceStatus};
