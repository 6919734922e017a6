//! Audit resolver
//!
//! On-demand change-history lookups for entities selected by an explicit
//! [`AuditPolicy`]. History lookups cost one request per entity (plus one per
//! changeset), so they are never run over the full result set.
//!
//! Lookups run with bounded concurrency and a per-entity timeout; a failed or
//! timed-out lookup degrades to an outcome in the report and never aborts the
//! pipeline.

use crate::config::{AuditConfig, FlagRule, OverpassConfig, PipelineConfig, QueryLimits, SourceConfig};
use crate::error::{SourceError, SourceResult};
use crate::extract::TagExtractor;
use crate::sources::http::HttpTransport;
use crate::types::{
    AttributeKey, ElementKind, Entity, EntityId, MergedEntity, Position, ProvenanceRecord, SourceId,
    TaggedElement,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// ============================================================================
// History providers
// ============================================================================

/// Source capable of returning the edit history of one of its entities
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    fn source_id(&self) -> &SourceId;

    /// Ordered (oldest first) edit history of `entity`
    async fn history(&self, entity: &Entity) -> SourceResult<Vec<ProvenanceRecord>>;
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    elements: Vec<HistoryElement>,
}

#[derive(Debug, Deserialize)]
struct HistoryElement {
    #[serde(rename = "type")]
    kind: ElementKind,
    id: i64,
    version: u32,
    timestamp: DateTime<Utc>,
    changeset: u64,
    user: Option<String>,
    uid: Option<u64>,
    lat: Option<f64>,
    lon: Option<f64>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ChangesetResponse {
    changeset: Option<ChangesetBody>,
    #[serde(default)]
    elements: Vec<ChangesetBody>,
}

#[derive(Debug, Deserialize)]
struct ChangesetBody {
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

impl ChangesetResponse {
    fn comment(self) -> Option<String> {
        self.changeset
            .into_iter()
            .chain(self.elements)
            .find_map(|c| c.tags.get("comment").cloned())
    }
}

/// OpenStreetMap API 0.6 history client
pub struct OsmHistoryClient {
    source_id: SourceId,
    base_url: String,
    transport: HttpTransport,
    extractor: TagExtractor,
    include_changesets: bool,
}

impl OsmHistoryClient {
    pub fn new(
        source_id: SourceId,
        base_url: &str,
        limits: &QueryLimits,
        extractor: TagExtractor,
        include_changesets: bool,
    ) -> SourceResult<Self> {
        Ok(Self {
            transport: HttpTransport::new(source_id.clone(), limits)?,
            source_id,
            base_url: base_url.trim_end_matches('/').to_string(),
            extractor,
            include_changesets,
        })
    }

    /// Client for an Overpass source, if it has a history endpoint
    pub fn from_source(source: &OverpassConfig, audit: &AuditConfig) -> SourceResult<Option<Self>> {
        let Some(base_url) = source.history_base() else {
            return Ok(None);
        };

        let limits = QueryLimits {
            timeout_secs: audit.timeout_secs,
            max_results: 1,
            requests_per_second: source.requests_per_second,
            max_attempts: source.max_attempts,
        };
        Self::new(
            source.id.clone(),
            base_url,
            &limits,
            TagExtractor::new(source.attributes.clone()),
            audit.include_changesets,
        )
        .map(Some)
    }

    /// Override the first retry delay
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.transport = self.transport.with_initial_backoff(backoff);
        self
    }

    fn element_path(&self, entity: &Entity) -> SourceResult<String> {
        let parsed = entity
            .id
            .native_id
            .split_once('/')
            .and_then(|(kind, id)| {
                let id: i64 = id.parse().ok()?;
                matches!(kind, "node" | "way" | "relation").then(|| format!("{}/{}", kind, id))
            });

        parsed.ok_or_else(|| SourceError::SourceQueryRejected {
            source_id: self.source_id.clone(),
            status: None,
            message: format!("'{}' is not an OSM element id", entity.id.native_id),
        })
    }

    async fn changeset_comment(&self, changeset: u64) -> Option<String> {
        let url = format!("{}/changeset/{}.json", self.base_url, changeset);
        let result = self.transport.send(|client| client.get(&url)).await;

        match result {
            Ok(body) => match serde_json::from_str::<ChangesetResponse>(&body.text) {
                Ok(response) => response.comment(),
                Err(e) => {
                    warn!(source = %self.source_id, changeset, error = %e, "Unparseable changeset");
                    None
                }
            },
            Err(e) => {
                warn!(source = %self.source_id, changeset, error = %e, "Changeset lookup failed");
                None
            }
        }
    }

    fn to_record(&self, element: HistoryElement) -> ProvenanceRecord {
        let position = match (element.lat, element.lon) {
            (Some(lat), Some(lon)) => Some(Position::new(lat, lon)).filter(|p| p.is_valid()),
            _ => None,
        };
        let tagged = TaggedElement {
            kind: element.kind,
            id: element.id,
            position,
            tags: element.tags.into_iter().collect(),
            version: Some(element.version),
            changeset: Some(element.changeset),
            timestamp: Some(element.timestamp.to_rfc3339()),
            user: element.user.clone(),
        };

        ProvenanceRecord {
            version: element.version,
            timestamp: element.timestamp,
            changeset: element.changeset,
            editor: element.user,
            editor_uid: element.uid,
            comment: None,
            attributes: self.extractor.extract_tags(&tagged),
            position,
        }
    }
}

#[async_trait]
impl HistoryProvider for OsmHistoryClient {
    fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    async fn history(&self, entity: &Entity) -> SourceResult<Vec<ProvenanceRecord>> {
        let url = format!("{}/{}/history.json", self.base_url, self.element_path(entity)?);
        let body = self.transport.send(|client| client.get(&url)).await?;

        let response: HistoryResponse = serde_json::from_str(&body.text)
            .map_err(|e| SourceError::unparseable(&self.source_id, e.to_string(), &body.text))?;

        let mut records: Vec<ProvenanceRecord> = response
            .elements
            .into_iter()
            .map(|element| self.to_record(element))
            .collect();
        records.sort_by_key(|r| r.version);

        if self.include_changesets {
            let changesets: BTreeSet<u64> = records.iter().map(|r| r.changeset).collect();
            let mut comments: HashMap<u64, String> = HashMap::new();
            for changeset in changesets {
                if let Some(comment) = self.changeset_comment(changeset).await {
                    comments.insert(changeset, comment);
                }
            }
            for record in &mut records {
                record.comment = comments.get(&record.changeset).cloned();
            }
        }

        debug!(entity = %entity.id, versions = records.len(), "History resolved");
        Ok(records)
    }
}

// ============================================================================
// Selection policy
// ============================================================================

/// Why a merged entity was selected for auditing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AuditReason {
    FlaggedAttribute { key: AttributeKey, value: String },
    ConflictingValues { keys: Vec<AttributeKey> },
}

/// Merged entity selected for auditing
#[derive(Debug, Clone)]
pub struct AuditCandidate<'a> {
    pub merged: &'a MergedEntity,
    pub reasons: Vec<AuditReason>,
}

/// Decides which merged entities warrant a history lookup
#[derive(Debug, Clone)]
pub struct AuditPolicy {
    flags: Vec<FlagRule>,
    flag_conflicts: bool,
    max_entities: usize,
}

impl AuditPolicy {
    pub fn new(flags: Vec<FlagRule>, flag_conflicts: bool, max_entities: usize) -> Self {
        Self {
            flags,
            flag_conflicts,
            max_entities,
        }
    }

    pub fn from_config(config: &AuditConfig) -> Self {
        Self::new(config.flags.clone(), config.flag_conflicts, config.max_entities)
    }

    /// Reasons to audit one merged entity (empty when none apply)
    pub fn reasons(&self, merged: &MergedEntity) -> Vec<AuditReason> {
        let mut reasons: Vec<AuditReason> = self
            .flags
            .iter()
            .filter(|rule| {
                merged
                    .values(rule.key)
                    .any(|a| a.value.eq_ignore_ascii_case(&rule.value))
            })
            .map(|rule| AuditReason::FlaggedAttribute {
                key: rule.key,
                value: rule.value.clone(),
            })
            .collect();

        if self.flag_conflicts {
            let keys = merged.conflicting_keys();
            if !keys.is_empty() {
                reasons.push(AuditReason::ConflictingValues { keys });
            }
        }

        reasons
    }

    /// Select candidates in result order, capped at `max_entities`
    pub fn select<'a>(&self, merged: &'a [MergedEntity]) -> Vec<AuditCandidate<'a>> {
        let candidates: Vec<AuditCandidate<'a>> = merged
            .iter()
            .filter_map(|m| {
                let reasons = self.reasons(m);
                (!reasons.is_empty()).then_some(AuditCandidate { merged: m, reasons })
            })
            .collect();

        if candidates.len() > self.max_entities {
            info!(
                flagged = candidates.len(),
                limit = self.max_entities,
                "Audit selection capped"
            );
        }

        candidates.into_iter().take(self.max_entities).collect()
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// Result of one history lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    Resolved { history: Vec<ProvenanceRecord> },
    /// Source exposes no change history
    Unsupported,
    TimedOut,
    Unavailable { message: String },
}

/// Audit result for one member entity of a selected merged entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub entity: EntityId,
    pub reasons: Vec<AuditReason>,
    pub outcome: AuditOutcome,
}

/// Routes history lookups to the provider of each entity's source
pub struct AuditResolver {
    providers: HashMap<SourceId, Arc<dyn HistoryProvider>>,
    concurrency: usize,
    timeout: Duration,
}

impl AuditResolver {
    pub fn new(concurrency: usize, timeout: Duration) -> Self {
        Self {
            providers: HashMap::new(),
            concurrency: concurrency.max(1),
            timeout,
        }
    }

    /// Resolver with a history client for every Overpass source that has one
    pub fn from_config(config: &PipelineConfig) -> SourceResult<Self> {
        let mut resolver = Self::new(config.audit.concurrency, config.audit.timeout());
        for source in &config.sources {
            if let SourceConfig::Overpass(overpass) = source {
                if let Some(client) = OsmHistoryClient::from_source(overpass, &config.audit)? {
                    resolver.register(Arc::new(client));
                }
            }
        }
        Ok(resolver)
    }

    pub fn register(&mut self, provider: Arc<dyn HistoryProvider>) {
        self.providers.insert(provider.source_id().clone(), provider);
    }

    pub fn supports(&self, source: &SourceId) -> bool {
        self.providers.contains_key(source)
    }

    /// Edit history of one entity
    pub async fn history(&self, entity: &Entity) -> SourceResult<Vec<ProvenanceRecord>> {
        let provider = self
            .providers
            .get(entity.source())
            .ok_or_else(|| SourceError::HistoryUnsupported(entity.source().clone()))?;
        provider.history(entity).await
    }

    /// Look up one entity, degrading every failure into an outcome
    pub async fn audit(&self, entity: &Entity) -> AuditOutcome {
        match tokio::time::timeout(self.timeout, self.history(entity)).await {
            Ok(Ok(history)) => AuditOutcome::Resolved { history },
            Ok(Err(SourceError::HistoryUnsupported(_))) => AuditOutcome::Unsupported,
            Ok(Err(e)) => {
                warn!(entity = %entity.id, error = %e, "History unavailable");
                AuditOutcome::Unavailable {
                    message: e.to_string(),
                }
            }
            Err(_) => {
                warn!(
                    entity = %entity.id,
                    timeout_secs = self.timeout.as_secs(),
                    "History lookup timed out"
                );
                AuditOutcome::TimedOut
            }
        }
    }

    /// Audit every member of the merged entities selected by `policy`
    ///
    /// Reports are sorted by entity id.
    pub async fn resolve_flagged(
        &self,
        merged: &[MergedEntity],
        entities: &[Entity],
        policy: &AuditPolicy,
    ) -> Vec<AuditReport> {
        let by_id: HashMap<&EntityId, &Entity> = entities.iter().map(|e| (&e.id, e)).collect();

        let mut seen: BTreeSet<&EntityId> = BTreeSet::new();
        let mut tasks: Vec<(&Entity, Vec<AuditReason>)> = Vec::new();
        for candidate in policy.select(merged) {
            for member in &candidate.merged.members {
                if !seen.insert(member) {
                    continue;
                }
                if let Some(&entity) = by_id.get(member) {
                    tasks.push((entity, candidate.reasons.clone()));
                }
            }
        }

        info!(
            entities = tasks.len(),
            concurrency = self.concurrency,
            "Resolving audit histories"
        );

        let mut reports: Vec<AuditReport> = stream::iter(tasks)
            .map(|(entity, reasons)| async move {
                AuditReport {
                    entity: entity.id.clone(),
                    reasons,
                    outcome: self.audit(entity).await,
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        reports.sort_by(|a, b| a.entity.cmp(&b.entity));
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_osm_attributes;
    use crate::types::{Attribute, MergedAttribute};
    use httpmock::prelude::*;
    use serde_json::json;

    fn node_entity(id: i64) -> Entity {
        Entity {
            id: EntityId::new(SourceId::from("osm"), format!("node/{}", id)),
            position: Some(Position::new(-38.0, 175.3)),
            attributes: vec![Attribute::new(AttributeKey::Religion, "maori")],
            raw: None,
        }
    }

    fn limits() -> QueryLimits {
        QueryLimits {
            timeout_secs: 5,
            max_results: 1,
            requests_per_second: 100,
            max_attempts: 1,
        }
    }

    fn client(base_url: &str, include_changesets: bool) -> OsmHistoryClient {
        OsmHistoryClient::new(
            SourceId::from("osm"),
            base_url,
            &limits(),
            TagExtractor::new(default_osm_attributes()),
            include_changesets,
        )
        .unwrap()
    }

    fn merged_with(attrs: Vec<(AttributeKey, &str)>, members: Vec<EntityId>) -> MergedEntity {
        MergedEntity {
            members: members.clone(),
            positions: vec![],
            attributes: attrs
                .into_iter()
                .map(|(key, value)| MergedAttribute {
                    key,
                    value: value.to_string(),
                    provenance: members.iter().cloned().collect(),
                })
                .collect(),
            confidence: 1.0,
        }
    }

    /// Provider that never answers in time
    struct StalledProvider;

    #[async_trait]
    impl HistoryProvider for StalledProvider {
        fn source_id(&self) -> &SourceId {
            static ID: std::sync::OnceLock<SourceId> = std::sync::OnceLock::new();
            ID.get_or_init(|| SourceId::from("osm"))
        }

        async fn history(&self, _entity: &Entity) -> SourceResult<Vec<ProvenanceRecord>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_history_with_changeset_comments() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/0.6/node/42/history.json");
                then.status(200).json_body(json!({
                    "elements": [
                        {"type": "node", "id": 42, "version": 2, "timestamp": "2021-06-01T09:30:00Z",
                         "changeset": 200, "user": "kiwi_mapper", "uid": 7, "lat": -38.0, "lon": 175.3,
                         "tags": {"amenity": "place_of_worship", "religion": "christian;maori"}},
                        {"type": "node", "id": 42, "version": 1, "timestamp": "2019-02-11T21:00:00Z",
                         "changeset": 100, "user": "first", "uid": 3, "lat": -38.0, "lon": 175.3,
                         "tags": {"amenity": "place_of_worship"}}
                    ]
                }));
            })
            .await;
        let changeset_mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/0.6/changeset/200.json");
                then.status(200).json_body(json!({
                    "changeset": {"id": 200, "tags": {"comment": "Add religion from survey"}}
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/0.6/changeset/100.json");
                then.status(500);
            })
            .await;

        let history = client(&server.url("/api/0.6/"), true)
            .history(&node_entity(42))
            .await
            .unwrap();

        changeset_mock.assert_async().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version, 1);
        assert_eq!(history[0].comment, None);
        assert_eq!(history[1].editor.as_deref(), Some("kiwi_mapper"));
        assert_eq!(history[1].comment.as_deref(), Some("Add religion from survey"));
        assert!(history[1]
            .attributes
            .contains(&Attribute::new(AttributeKey::Religion, "maori")));
    }

    #[tokio::test]
    async fn test_history_without_changesets_makes_one_request() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/node/5/history.json");
                then.status(200).json_body(json!({"elements": [
                    {"type": "node", "id": 5, "version": 1, "timestamp": "2020-01-01T00:00:00Z",
                     "changeset": 1, "tags": {}}
                ]}));
            })
            .await;

        let history = client(&server.base_url(), false)
            .history(&node_entity(5))
            .await
            .unwrap();
        mock.assert_calls_async(1).await;
        assert_eq!(history[0].editor, None);
        assert!(history[0].attributes.is_empty());
    }

    #[tokio::test]
    async fn test_missing_element_rejected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/node/9/history.json");
                then.status(404);
            })
            .await;

        let err = client(&server.base_url(), false)
            .history(&node_entity(9))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SourceError::SourceQueryRejected {
                status: Some(404),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_non_osm_id_rejected_without_request() {
        let entity = Entity {
            id: EntityId::new(SourceId::from("osm"), "bogus"),
            position: None,
            attributes: vec![],
            raw: None,
        };
        let err = client("http://127.0.0.1:9", false)
            .history(&entity)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::SourceQueryRejected { status: None, .. }));
    }

    #[test]
    fn test_empty_history_endpoint_builds_no_client() {
        let source = OverpassConfig {
            history_endpoint: Some("  ".to_string()),
            ..Default::default()
        };
        let client = OsmHistoryClient::from_source(&source, &AuditConfig::default()).unwrap();
        assert!(client.is_none());

        let client = OsmHistoryClient::from_source(&OverpassConfig::default(), &AuditConfig::default()).unwrap();
        assert!(client.is_some());
    }

    #[tokio::test]
    async fn test_history_unsupported_for_linked_data() {
        let resolver = AuditResolver::from_config(&PipelineConfig::default()).unwrap();
        let entity = Entity {
            id: EntityId::new(SourceId::from("dbpedia"), "http://dbpedia.org/resource/X"),
            position: None,
            attributes: vec![],
            raw: None,
        };

        assert!(resolver.supports(&SourceId::from("osm")));
        let err = resolver.history(&entity).await.unwrap_err();
        assert!(matches!(err, SourceError::HistoryUnsupported(ref id) if id.as_str() == "dbpedia"));
        assert_eq!(resolver.audit(&entity).await, AuditOutcome::Unsupported);
    }

    #[tokio::test]
    async fn test_timeout_degrades() {
        let mut resolver = AuditResolver::new(2, Duration::from_millis(50));
        resolver.register(Arc::new(StalledProvider));
        assert_eq!(resolver.audit(&node_entity(1)).await, AuditOutcome::TimedOut);
    }

    #[test]
    fn test_policy_flags_rule_and_conflicts() {
        let a = EntityId::new(SourceId::from("osm"), "node/1");
        let b = EntityId::new(SourceId::from("dbpedia"), "X");

        let flagged = merged_with(vec![(AttributeKey::Religion, "Maori")], vec![a.clone()]);
        let mut conflicting = merged_with(vec![(AttributeKey::Name, "St Mary")], vec![a.clone(), b.clone()]);
        conflicting.attributes.push(MergedAttribute {
            key: AttributeKey::Name,
            value: "St Mary's".to_string(),
            provenance: [b.clone()].into_iter().collect(),
        });
        let plain = merged_with(vec![(AttributeKey::Religion, "christian")], vec![b]);

        let policy = AuditPolicy::from_config(&AuditConfig::default());
        let all = [flagged, conflicting, plain];
        let selected = policy.select(&all);

        assert_eq!(selected.len(), 2);
        assert_eq!(
            selected[0].reasons,
            vec![AuditReason::FlaggedAttribute {
                key: AttributeKey::Religion,
                value: "maori".to_string()
            }]
        );
        assert_eq!(
            selected[1].reasons,
            vec![AuditReason::ConflictingValues {
                keys: vec![AttributeKey::Name]
            }]
        );

        let capped = AuditPolicy::new(vec![], true, 0);
        assert!(capped.select(&all).is_empty());
    }

    #[tokio::test]
    async fn test_resolve_flagged_reports_every_member() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/node/1/history.json");
                then.status(200).json_body(json!({"elements": [
                    {"type": "node", "id": 1, "version": 1, "timestamp": "2020-01-01T00:00:00Z",
                     "changeset": 1, "tags": {"religion": "maori"}}
                ]}));
            })
            .await;

        let osm_entity = node_entity(1);
        let dbpedia_entity = Entity {
            id: EntityId::new(SourceId::from("dbpedia"), "X"),
            position: None,
            attributes: vec![Attribute::new(AttributeKey::Religion, "maori")],
            raw: None,
        };
        let merged = vec![merged_with(
            vec![(AttributeKey::Religion, "maori")],
            vec![dbpedia_entity.id.clone(), osm_entity.id.clone()],
        )];

        let mut resolver = AuditResolver::new(4, Duration::from_secs(5));
        resolver.register(Arc::new(client(&server.base_url(), false)));

        let reports = resolver
            .resolve_flagged(
                &merged,
                &[osm_entity, dbpedia_entity],
                &AuditPolicy::from_config(&AuditConfig::default()),
            )
            .await;

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].entity.source.as_str(), "dbpedia");
        assert_eq!(reports[0].outcome, AuditOutcome::Unsupported);
        assert!(matches!(
            reports[1].outcome,
            AuditOutcome::Resolved { ref history } if history.len() == 1
        ));
    }
}
