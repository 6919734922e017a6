//! Aggregation summary over normalized entities
//!
//! Built in one explicit pass over the immutable entity list after
//! normalization (religion tallies and similar counts).

use crate::types::{AttributeKey, Entity, SourceId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-source counts and per-key value tallies
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeSummary {
    pub entities: usize,
    pub by_source: BTreeMap<SourceId, usize>,
    /// Value counts for repeatable (categorical) keys
    pub tallies: BTreeMap<AttributeKey, BTreeMap<String, usize>>,
    pub without_position: usize,
    pub without_name: usize,
}

impl AttributeSummary {
    pub fn from_entities(entities: &[Entity]) -> Self {
        let mut summary = Self {
            entities: entities.len(),
            ..Default::default()
        };

        for entity in entities {
            *summary.by_source.entry(entity.source().clone()).or_default() += 1;

            if entity.position.is_none() {
                summary.without_position += 1;
            }
            if !entity.has_name() {
                summary.without_name += 1;
            }

            for attribute in entity.attributes.iter().filter(|a| a.key.is_repeatable()) {
                *summary
                    .tallies
                    .entry(attribute.key)
                    .or_default()
                    .entry(attribute.value.clone())
                    .or_default() += 1;
            }
        }

        summary
    }

    /// Value → count for one key
    pub fn tally(&self, key: AttributeKey) -> Option<&BTreeMap<String, usize>> {
        self.tallies.get(&key)
    }
}
