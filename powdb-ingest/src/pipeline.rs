//! Pipeline orchestration
//!
//! Fan-out fetch (one task per source) → normalize → merge barrier →
//! optional audit. A failing source is recorded in the manifest and never
//! blocks the others; only a total outage fails the run.

use crate::audit::{AuditPolicy, AuditReport, AuditResolver};
use crate::config::{MergeConfig, PipelineConfig};
use crate::error::{PipelineError, SourceError};
use crate::merge::MergeEngine;
use crate::normalize::{Normalizer, SourceRegistry};
use crate::sources::{build_adapters, FetchOutcome, SourceAdapter, SourceWarning};
use crate::summary::AttributeSummary;
use crate::types::{Entity, MergedEntity, SourceId, SourceKind};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Per-source fetch status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Success,
    /// Data returned, but with warnings (truncation, skipped records, ...)
    Partial,
    Failed,
}

/// Error recorded for a failed source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub code: String,
    pub message: String,
}

impl From<&SourceError> for SourceFailure {
    fn from(e: &SourceError) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

/// Manifest entry for one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source: SourceId,
    pub kind: SourceKind,
    pub status: SourceStatus,
    pub records_fetched: usize,
    pub entities_normalized: usize,
    pub bytes: u64,
    pub warnings: Vec<SourceWarning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SourceFailure>,
}

/// Complete result of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub merged: Vec<MergedEntity>,
    pub manifest: Vec<SourceReport>,
    pub summary: AttributeSummary,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audits: Vec<AuditReport>,
}

impl PipelineOutput {
    /// True when every source succeeded without warnings
    pub fn is_complete(&self) -> bool {
        self.manifest
            .iter()
            .all(|r| r.status == SourceStatus::Success)
    }

    pub fn report(&self, source: &SourceId) -> Option<&SourceReport> {
        self.manifest.iter().find(|r| &r.source == source)
    }
}

/// Configured pipeline, reusable across runs
pub struct Pipeline {
    adapters: Vec<Arc<dyn SourceAdapter>>,
    normalizer: Normalizer,
    merge: MergeEngine,
    audit: Option<(AuditResolver, AuditPolicy)>,
}

impl Pipeline {
    /// Wire adapters to a registry; every adapter's source must be registered
    pub fn new(
        adapters: Vec<Arc<dyn SourceAdapter>>,
        registry: SourceRegistry,
        merge: &MergeConfig,
    ) -> Result<Self, PipelineError> {
        if let Some(unknown) = adapters.iter().find(|a| !registry.contains(a.source_id())) {
            return Err(SourceError::UnknownSource(unknown.source_id().clone()).into());
        }

        Ok(Self {
            adapters,
            normalizer: Normalizer::new(Arc::new(registry)),
            merge: MergeEngine::new(merge),
            audit: None,
        })
    }

    /// Validate the configuration and build every component
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;

        let adapters = build_adapters(config)?;
        let registry = SourceRegistry::from_configs(&config.sources);
        let pipeline = Self::new(adapters, registry, &config.merge)?;

        if config.audit.enabled {
            let resolver = AuditResolver::from_config(config)?;
            Ok(pipeline.with_audit(resolver, AuditPolicy::from_config(&config.audit)))
        } else {
            Ok(pipeline)
        }
    }

    pub fn with_audit(mut self, resolver: AuditResolver, policy: AuditPolicy) -> Self {
        self.audit = Some((resolver, policy));
        self
    }

    pub fn source_count(&self) -> usize {
        self.adapters.len()
    }

    /// Run fetch, normalize, merge and (when enabled) audit
    pub async fn run(&self) -> Result<PipelineOutput, PipelineError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(run_id = %run_id, sources = self.adapters.len(), "Pipeline run starting");

        let fetches = self.adapters.iter().map(|adapter| {
            let adapter = Arc::clone(adapter);
            async move {
                let result = adapter.fetch().await;
                (adapter.source_id().clone(), adapter.kind(), result)
            }
        });
        let results = join_all(fetches).await;

        let mut entities: Vec<Entity> = Vec::new();
        let mut manifest: Vec<SourceReport> = Vec::with_capacity(results.len());
        let mut failures: Vec<(SourceId, String)> = Vec::new();

        for (source, kind, result) in results {
            match result {
                Ok(outcome) => {
                    let report = self.normalize_source(&source, kind, outcome, &mut entities);
                    manifest.push(report);
                }
                Err(e) => {
                    error!(source = %source, error = %e, "Source failed");
                    failures.push((source.clone(), e.to_string()));
                    manifest.push(SourceReport {
                        source,
                        kind,
                        status: SourceStatus::Failed,
                        records_fetched: 0,
                        entities_normalized: 0,
                        bytes: 0,
                        warnings: Vec::new(),
                        error: Some(SourceFailure::from(&e)),
                    });
                }
            }
        }

        if !self.adapters.is_empty() && failures.len() == self.adapters.len() {
            return Err(PipelineError::AllSourcesFailed(failures));
        }

        let summary = AttributeSummary::from_entities(&entities);
        let merged = self.merge.merge(&entities);

        let audits = match &self.audit {
            Some((resolver, policy)) => resolver.resolve_flagged(&merged, &entities, policy).await,
            None => Vec::new(),
        };

        let output = PipelineOutput {
            run_id,
            started_at,
            finished_at: Utc::now(),
            merged,
            manifest,
            summary,
            audits,
        };

        info!(
            run_id = %run_id,
            entities = entities.len(),
            merged = output.merged.len(),
            failed_sources = failures.len(),
            complete = output.is_complete(),
            "Pipeline run finished"
        );

        Ok(output)
    }

    fn normalize_source(
        &self,
        source: &SourceId,
        kind: SourceKind,
        outcome: FetchOutcome,
        entities: &mut Vec<Entity>,
    ) -> SourceReport {
        let FetchOutcome {
            records,
            mut warnings,
            bytes,
        } = outcome;

        let records_fetched = records.len();
        let mut normalized = 0usize;
        let mut rejected = 0usize;

        for record in records {
            match self.normalizer.normalize(record, source) {
                Ok(entity) => {
                    entities.push(entity);
                    normalized += 1;
                }
                Err(e) => {
                    warn!(source = %source, error = %e, "Record not normalized");
                    rejected += 1;
                }
            }
        }

        if rejected > 0 {
            warnings.push(SourceWarning::MalformedRecords { count: rejected });
        }

        info!(
            source = %source,
            records = records_fetched,
            entities = normalized,
            warnings = warnings.len(),
            "Source normalized"
        );

        SourceReport {
            source: source.clone(),
            kind,
            status: if warnings.is_empty() {
                SourceStatus::Success
            } else {
                SourceStatus::Partial
            },
            records_fetched,
            entities_normalized: normalized,
            bytes,
            warnings,
            error: None,
        }
    }
}
