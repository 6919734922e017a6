//! SPARQL adapter (linked-data source)
//!
//! Issues a SELECT query over the standard SPARQL protocol (GET with
//! URL-encoded parameters) and decodes the JSON result set. Every row is one
//! raw record; the subject column is its native id.

use super::http::HttpTransport;
use super::{FetchOutcome, SourceAdapter, SourceWarning};
use crate::config::{SourceConfig, SparqlConfig};
use crate::error::{SourceError, SourceResult};
use crate::types::{BindingRow, BindingValue, RawRecord, SourceId, SourceKind};
use async_trait::async_trait;
use powdb_common::human_size::format_bytes;
use reqwest::Url;
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};

/// Result-set variable holding the subject resource
pub const SUBJECT_VAR: &str = "building";

const PREFIXES: &str = "\
PREFIX dbo: <http://dbpedia.org/ontology/>
PREFIX dbp: <http://dbpedia.org/property/>
PREFIX rdfs: <http://www.w3.org/2000/01/rdf-schema#>
PREFIX geo: <http://www.w3.org/2003/01/geo/wgs84_pos#>";

/// Build the SELECT query for a source configuration
pub fn build_query(config: &SparqlConfig) -> String {
    let label_filter = config
        .label_language
        .as_deref()
        .map(|lang| format!(" FILTER(langMatches(lang(?label), \"{}\"))", escape_literal(lang)))
        .unwrap_or_default();

    let mut lines = vec![
        PREFIXES.to_string(),
        "SELECT ?building ?label ?country ?location ?locationCountry ?address ?religion ?denomination ?lat ?long".to_string(),
        "WHERE {".to_string(),
        format!("  ?building a {} .", config.type_filter),
        format!("  OPTIONAL {{ ?building rdfs:label ?label .{} }}", label_filter),
        "  OPTIONAL { ?building dbo:country ?country }".to_string(),
        "  OPTIONAL {".to_string(),
        "    ?building dbo:location ?location .".to_string(),
        "    OPTIONAL { ?location dbo:country ?locationCountry }".to_string(),
        "  }".to_string(),
        "  OPTIONAL { ?building dbo:address ?address }".to_string(),
        "  OPTIONAL { ?building dbo:religion ?religion }".to_string(),
        "  OPTIONAL { ?building dbp:denomination ?denomination }".to_string(),
        "  OPTIONAL { ?building geo:lat ?lat . ?building geo:long ?long }".to_string(),
    ];

    if let Some(text) = config.text.as_deref().filter(|t| !t.trim().is_empty()) {
        lines.push(format!(
            "  FILTER(CONTAINS(LCASE(STR(?label)), \"{}\"))",
            escape_literal(&text.trim().to_lowercase())
        ));
    }

    lines.push("}".to_string());
    lines.push(format!("LIMIT {} OFFSET {}", config.max_results, config.offset));
    lines.join("\n")
}

/// Escape text for a double-quoted SPARQL string literal
///
/// # Examples
/// ```
/// use powdb_ingest::sources::sparql::escape_literal;
///
/// assert_eq!(escape_literal(r#"St "Mary""#), r#"St \"Mary\""#);
/// ```
pub fn escape_literal(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Full request URL with the protocol parameters
pub fn build_url(config: &SparqlConfig, query: &str) -> SourceResult<Url> {
    let trimmed = query
        .lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n");
    let timeout_ms = (config.timeout_secs * 1000).to_string();

    Url::parse_with_params(
        &config.endpoint,
        &[
            ("default-graph-uri", config.default_graph.as_str()),
            ("query", trimmed.as_str()),
            ("format", "application/json"),
            ("timeout", timeout_ms.as_str()),
            ("signal_void", "on"),
            ("signal_unconnected", "on"),
        ],
    )
    .map_err(|e| SourceError::SourceQueryRejected {
        source_id: config.id.clone(),
        status: None,
        message: format!("Invalid endpoint '{}': {}", config.endpoint, e),
    })
}

// ============================================================================
// Response decoding
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct SparqlHead {
    #[serde(default)]
    vars: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SparqlResults {
    bindings: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct SparqlResponse {
    #[serde(default)]
    head: SparqlHead,
    results: SparqlResults,
}

#[derive(Debug, Deserialize)]
struct SparqlTerm {
    #[serde(rename = "type")]
    kind: String,
    value: String,
    #[serde(rename = "xml:lang")]
    lang: Option<String>,
    datatype: Option<String>,
}

impl From<SparqlTerm> for BindingValue {
    fn from(term: SparqlTerm) -> Self {
        BindingValue {
            kind: term.kind,
            value: term.value,
            lang: term.lang,
            datatype: term.datatype,
        }
    }
}

/// Decode one result row; `None` when it is malformed
fn decode_row(vars: &[String], value: serde_json::Value) -> Option<BindingRow> {
    let serde_json::Value::Object(map) = value else {
        return None;
    };

    let mut terms: Vec<(String, BindingValue)> = Vec::with_capacity(map.len());
    for (name, raw) in map {
        let term: SparqlTerm = serde_json::from_value(raw).ok()?;
        terms.push((name, term.into()));
    }

    // Declared variable order first, undeclared columns after
    terms.sort_by_key(|(name, _)| {
        vars.iter()
            .position(|v| v == name)
            .unwrap_or(vars.len())
    });

    let subject = terms
        .iter()
        .find(|(name, _)| name == SUBJECT_VAR)
        .map(|(_, term)| term.value.clone())
        .filter(|s| !s.is_empty())?;

    Some(BindingRow {
        subject,
        columns: terms,
    })
}

/// Decode a SPARQL JSON result document
pub fn decode_response(
    source_id: &SourceId,
    body: &str,
    max_results: usize,
) -> SourceResult<FetchOutcome> {
    let response: SparqlResponse = serde_json::from_str(body)
        .map_err(|e| SourceError::unparseable(source_id, e.to_string(), body))?;

    let received = response.results.bindings.len();
    let vars = response.head.vars;
    let mut records = Vec::with_capacity(received);
    let mut malformed = 0usize;

    for value in response.results.bindings {
        match decode_row(&vars, value) {
            Some(row) => records.push(RawRecord::Binding(row)),
            None => malformed += 1,
        }
    }

    let mut warnings = Vec::new();
    if malformed > 0 {
        warn!(source = %source_id, count = malformed, "Skipped malformed result rows");
        warnings.push(SourceWarning::MalformedRecords { count: malformed });
    }
    if received >= max_results {
        warn!(
            source = %source_id,
            received,
            limit = max_results,
            "Result set reached the row limit, page with a larger offset"
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

/// Linked-data source adapter
pub struct SparqlAdapter {
    config: SparqlConfig,
    url: Url,
    transport: HttpTransport,
}

impl SparqlAdapter {
    pub fn new(config: SparqlConfig) -> SourceResult<Self> {
        let url = build_url(&config, &build_query(&config))?;
        let limits = SourceConfig::Sparql(config.clone()).limits();
        let transport = HttpTransport::new(config.id.clone(), &limits)?;
        Ok(Self {
            config,
            url,
            transport,
        })
    }

    /// Override the first retry delay
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.transport = self.transport.with_initial_backoff(backoff);
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl SourceAdapter for SparqlAdapter {
    fn source_id(&self) -> &SourceId {
        &self.config.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Sparql
    }

    async fn fetch(&self) -> SourceResult<FetchOutcome> {
        info!(source = %self.config.id, endpoint = %self.config.endpoint, "Querying SPARQL endpoint");

        let url = self.url.clone();
        let body = self
            .transport
            .send(|client| client.get(url.clone()))
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
            "Decoded result set"
        );
        Ok(outcome)
    }
}
