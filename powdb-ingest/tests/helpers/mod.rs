//! Shared builders for integration tests

#![allow(dead_code)]

use powdb_ingest::config::{MergeConfig, OverpassConfig, PipelineConfig, SourceConfig, SparqlConfig};
use powdb_ingest::types::{Attribute, AttributeKey, Entity, EntityId, MergedEntity, Position, SourceId};
use serde_json::json;

pub const ST_MARYS: Position = Position {
    lat: -41.2789,
    lon: 174.7755,
};

pub fn entity(
    source: &str,
    native_id: &str,
    position: Option<Position>,
    attrs: &[(AttributeKey, &str)],
) -> Entity {
    Entity {
        id: EntityId::new(SourceId::from(source), native_id),
        position,
        attributes: attrs.iter().map(|(k, v)| Attribute::new(*k, *v)).collect(),
        raw: None,
    }
}

pub fn merge_config(tolerance_m: f64, name_threshold: f64) -> MergeConfig {
    MergeConfig {
        tolerance_m,
        name_threshold,
    }
}

/// Cluster containing `id`
pub fn cluster_of<'a>(merged: &'a [MergedEntity], id: &EntityId) -> &'a MergedEntity {
    merged
        .iter()
        .find(|m| m.members.contains(id))
        .unwrap_or_else(|| panic!("{} missing from merge output", id))
}

/// Overpass + SPARQL config pointed at mock endpoints
pub fn mock_config(overpass_url: String, sparql_url: String) -> PipelineConfig {
    PipelineConfig {
        sources: vec![
            SourceConfig::Overpass(OverpassConfig {
                endpoint: overpass_url,
                history_endpoint: None,
                requests_per_second: 100,
                max_attempts: 1,
                ..Default::default()
            }),
            SourceConfig::Sparql(SparqlConfig {
                endpoint: sparql_url,
                requests_per_second: 100,
                max_attempts: 1,
                ..Default::default()
            }),
        ],
        ..Default::default()
    }
}

pub fn overpass_body(elements: serde_json::Value) -> serde_json::Value {
    json!({ "version": 0.6, "generator": "Overpass API", "elements": elements })
}

pub fn sparql_body(rows: serde_json::Value) -> serde_json::Value {
    json!({
        "head": { "vars": ["building", "label", "country", "location", "locationCountry",
                           "address", "religion", "denomination", "lat", "long"] },
        "results": { "distinct": false, "ordered": true, "bindings": rows }
    })
}

pub fn literal(value: &str) -> serde_json::Value {
    json!({ "type": "literal", "xml:lang": "en", "value": value })
}

pub fn decimal(value: f64) -> serde_json::Value {
    json!({
        "type": "typed-literal",
        "datatype": "http://www.w3.org/2001/XMLSchema#float",
        "value": value.to_string()
    })
}

pub fn resource(value: &str) -> serde_json::Value {
    json!({ "type": "uri", "value": value })
}
