//! Entity normalizer
//!
//! Turns a source-native [`RawRecord`] into a canonical [`Entity`] scoped to
//! its source. Never fails on missing attributes; only an unregistered source
//! (or a record the source could not have produced) is an error.

use crate::config::SourceConfig;
use crate::error::{SourceError, SourceResult};
use crate::extract::TagExtractor;
use crate::types::{Entity, EntityId, Position, RawRecord, SourceId, SourceKind};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Result-set variables carrying WGS84 coordinates
pub const LAT_VAR: &str = "lat";
pub const LON_VAR: &str = "long";

/// Registered source with its extraction table
#[derive(Debug, Clone)]
struct RegisteredSource {
    kind: SourceKind,
    extractor: TagExtractor,
}

/// Configured sources known to the normalizer
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    sources: HashMap<SourceId, RegisteredSource>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the configured sources
    pub fn from_configs(configs: &[SourceConfig]) -> Self {
        let mut registry = Self::new();
        for config in configs {
            registry.register(
                config.id().clone(),
                config.kind(),
                TagExtractor::new(config.attributes().to_vec()),
            );
        }
        registry
    }

    pub fn register(&mut self, id: SourceId, kind: SourceKind, extractor: TagExtractor) {
        self.sources
            .insert(id, RegisteredSource { kind, extractor });
    }

    pub fn kind(&self, id: &SourceId) -> Option<SourceKind> {
        self.sources.get(id).map(|s| s.kind)
    }

    pub fn extractor(&self, id: &SourceId) -> Option<&TagExtractor> {
        self.sources.get(id).map(|s| &s.extractor)
    }

    pub fn contains(&self, id: &SourceId) -> bool {
        self.sources.contains_key(id)
    }
}

/// Converts raw records into canonical entities
#[derive(Debug, Clone)]
pub struct Normalizer {
    registry: Arc<SourceRegistry>,
    keep_raw: bool,
}

impl Normalizer {
    pub fn new(registry: Arc<SourceRegistry>) -> Self {
        Self {
            registry,
            keep_raw: true,
        }
    }

    /// Drop raw records after normalization instead of keeping them
    pub fn without_raw(mut self) -> Self {
        self.keep_raw = false;
        self
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Normalize one raw record from `source_id`
    pub fn normalize(&self, record: RawRecord, source_id: &SourceId) -> SourceResult<Entity> {
        let source = self
            .registry
            .sources
            .get(source_id)
            .ok_or_else(|| SourceError::UnknownSource(source_id.clone()))?;

        if record.source_kind() != source.kind {
            // A record shape the configured source cannot produce
            return Err(SourceError::UnknownSource(source_id.clone()));
        }

        let attributes = source.extractor.extract(&record);
        let position = record_position(&record);
        let id = EntityId::new(source_id.clone(), record.native_id());

        debug!(
            entity = %id,
            attributes = attributes.len(),
            positioned = position.is_some(),
            "Normalized record"
        );

        Ok(Entity {
            id,
            position,
            attributes,
            raw: self.keep_raw.then(|| Arc::new(record)),
        })
    }
}

/// Position carried by a record, if present and valid
pub fn record_position(record: &RawRecord) -> Option<Position> {
    let position = match record {
        RawRecord::Element(element) => element.position,
        RawRecord::Binding(row) => {
            let lat = row.get(LAT_VAR)?.value.trim().parse::<f64>().ok()?;
            let lon = row.get(LON_VAR)?.value.trim().parse::<f64>().ok()?;
            Some(Position::new(lat, lon))
        }
    }?;

    position.is_valid().then_some(position)
}
