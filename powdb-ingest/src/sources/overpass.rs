//! Overpass adapter (geospatial tag source)
//!
//! Submits an Overpass QL filter query as a form POST (`data=<query>`) and
//! decodes the JSON `elements` array. Nodes become raw records; ways and
//! relations are only counted.

use super::http::HttpTransport;
use super::{FetchOutcome, SourceAdapter, SourceWarning};
use crate::config::{OverpassConfig, Region, SourceConfig, TagFilter};
use crate::error::{SourceError, SourceResult};
use crate::types::{ElementKind, Position, RawRecord, SourceId, SourceKind, TaggedElement};
use async_trait::async_trait;
use powdb_common::human_size::format_bytes;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

const AREA_SET: &str = "searchArea";

/// Remark fragments Overpass uses when a query was cut short
const TRUNCATION_REMARKS: &[&str] = &["timed out", "timeout", "out of memory", "maxsize"];

/// Build the Overpass QL query for a source configuration
///
/// # Examples
/// ```
/// use powdb_ingest::config::OverpassConfig;
/// use powdb_ingest::sources::overpass::build_query;
///
/// let query = build_query(&OverpassConfig::default());
/// assert!(query.starts_with("[out:json][timeout:180];"));
/// assert!(query.contains(r#"node["amenity"="place_of_worship"](area.searchArea);"#));
/// ```
pub fn build_query(config: &OverpassConfig) -> String {
    let mut query = format!("[out:json][timeout:{}]", config.timeout_secs);
    if let Some(max_size) = config.max_size_bytes {
        query.push_str(&format!("[maxsize:{}]", max_size));
    }
    query.push_str(";\n");

    let scope = match &config.region {
        Region::Area { area } => {
            query.push_str(&format!(
                "area[\"ISO3166-1\"=\"{}\"][admin_level=2]->.{};\n",
                escape(area),
                AREA_SET
            ));
            format!("(area.{})", AREA_SET)
        }
        Region::BoundingBox {
            south,
            west,
            north,
            east,
        } => format!("({},{},{},{})", south, west, north, east),
    };

    query.push_str("(\n");
    for filter in &config.filters {
        for element in ["node", "way", "relation"] {
            query.push_str(&format!("  {}{}{};\n", element, selector(filter), scope));
        }
    }
    query.push_str(");\n");
    query.push_str(&format!("out body {};", config.max_results));
    query
}

fn selector(filter: &TagFilter) -> String {
    format!("[\"{}\"=\"{}\"]", escape(&filter.key), escape(&filter.value))
}

/// Escape a value for an Overpass QL string literal
fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

// ============================================================================
// Response decoding
// ============================================================================

#[derive(Debug, Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    elements: Vec<serde_json::Value>,
    #[serde(default)]
    remark: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OverpassElement {
    #[serde(rename = "type")]
    kind: ElementKind,
    id: i64,
    lat: Option<f64>,
    lon: Option<f64>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    version: Option<u32>,
    changeset: Option<u64>,
    timestamp: Option<String>,
    user: Option<String>,
}

impl OverpassElement {
    fn into_tagged(self) -> TaggedElement {
        let position = match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some(Position::new(lat, lon)),
            _ => None,
        };
        TaggedElement {
            kind: self.kind,
            id: self.id,
            position,
            tags: self.tags.into_iter().collect(),
            version: self.version,
            changeset: self.changeset,
            timestamp: self.timestamp,
            user: self.user,
        }
    }
}

/// Decode an Overpass JSON document
///
/// Fails only when the document as a whole does not match the schema;
/// individual bad elements are skipped and counted.
pub fn decode_response(
    source_id: &SourceId,
    body: &str,
    max_results: usize,
) -> SourceResult<FetchOutcome> {
    let response: OverpassResponse = serde_json::from_str(body)
        .map_err(|e| SourceError::unparseable(source_id, e.to_string(), body))?;

    let received = response.elements.len();
    let mut records = Vec::new();
    let mut ways = 0usize;
    let mut relations = 0usize;
    let mut malformed = 0usize;

    for value in response.elements {
        let element = match serde_json::from_value::<OverpassElement>(value) {
            Ok(element) => element,
            Err(_) => {
                malformed += 1;
                continue;
            }
        };

        match element.kind {
            ElementKind::Node => {
                let tagged = element.into_tagged();
                match tagged.position {
                    Some(position) if position.is_valid() => {
                        records.push(RawRecord::Element(tagged))
                    }
                    _ => malformed += 1,
                }
            }
            ElementKind::Way => ways += 1,
            ElementKind::Relation => relations += 1,
        }
    }

    let mut warnings = Vec::new();

    if ways > 0 {
        warn!(source = %source_id, "Ways are not currently handled, yet {} were found", ways);
        warnings.push(SourceWarning::UnsupportedGeometry {
            kind: ElementKind::Way,
            count: ways,
        });
    }
    if relations > 0 {
        warn!(
            source = %source_id,
            "Relations are not currently handled, yet {} were found", relations
        );
        warnings.push(SourceWarning::UnsupportedGeometry {
            kind: ElementKind::Relation,
            count: relations,
        });
    }
    if malformed > 0 {
        warn!(source = %source_id, count = malformed, "Skipped malformed elements");
        warnings.push(SourceWarning::MalformedRecords { count: malformed });
    }

    let mut truncated = received >= max_results;
    if let Some(remark) = response.remark {
        let lower = remark.to_lowercase();
        truncated |= TRUNCATION_REMARKS.iter().any(|r| lower.contains(r));
        warn!(source = %source_id, remark = %remark, "Server remark");
        warnings.push(SourceWarning::ServerRemark { remark });
    }
    if truncated {
        warn!(
            source = %source_id,
            received,
            limit = max_results,
            "Result set appears truncated"
        );
        warnings.push(SourceWarning::Truncated {
            limit: max_results,
            received,
        });
    }

    Ok(FetchOutcome {
        records,
        warnings,
        bytes: body.len() as u64,
    })
}

// ============================================================================
// Adapter
// ============================================================================

/// Geospatial tag source adapter
pub struct OverpassAdapter {
    config: OverpassConfig,
    query: String,
    transport: HttpTransport,
}

impl OverpassAdapter {
    pub fn new(config: OverpassConfig) -> SourceResult<Self> {
        let limits = SourceConfig::Overpass(config.clone()).limits();
        let transport = HttpTransport::new(config.id.clone(), &limits)?;
        Ok(Self {
            query: build_query(&config),
            config,
            transport,
        })
    }

    /// Override the first retry delay
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.transport = self.transport.with_initial_backoff(backoff);
        self
    }

    pub fn query(&self) -> &str {
        &self.query
    }
}

#[async_trait]
impl SourceAdapter for OverpassAdapter {
    fn source_id(&self) -> &SourceId {
        &self.config.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Overpass
    }

    async fn fetch(&self) -> SourceResult<FetchOutcome> {
        info!(source = %self.config.id, endpoint = %self.config.endpoint, "Querying Overpass");

        let endpoint = self.config.endpoint.as_str();
        let query = self.query.as_str();
        let body = self
            .transport
            .send(|client| client.post(endpoint).form(&[("data", query)]))
            .await?;

        info!(
            source = %self.config.id,
            "Received {} in {:.1}s",
            format_bytes(body.bytes()),
            body.elapsed.as_secs_f64()
        );

        let outcome = decode_response(&self.config.id, &body.text, self.config.max_results)?;
        info!(
            source = %self.config.id,
            records = outcome.records.len(),
            warnings = outcome.warnings.len(),
            "Decoded Overpass response"
        );
        Ok(outcome)
    }
}
