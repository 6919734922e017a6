//! Pipeline configuration
//!
//! Loaded from TOML (see [`powdb_common::config`] for file resolution).
//! Every field has a built-in default; an empty document yields the
//! New Zealand Overpass + DBpedia setup.

use crate::types::{AttributeKey, SourceId, SourceKind};
use powdb_common::config::{load_toml, resolve_config_path, ConfigOrigin, CONFIG_ENV_VAR};
use powdb_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Config file name under the platform config directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Top-level pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub merge: MergeConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default = "default_sources")]
    pub sources: Vec<SourceConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            merge: MergeConfig::default(),
            audit: AuditConfig::default(),
            sources: default_sources(),
        }
    }
}

impl PipelineConfig {
    /// Resolve, load and validate the configuration
    ///
    /// `cli_arg` wins over `POWDB_CONFIG`, which wins over the user config
    /// directory; with none of them present the built-in defaults apply.
    pub fn load(cli_arg: Option<&Path>) -> Result<(Self, ConfigOrigin)> {
        let origin = resolve_config_path(cli_arg, CONFIG_ENV_VAR, CONFIG_FILE_NAME);
        let config: Self = load_toml(&origin)?;
        config.validate()?;
        Ok((config, origin))
    }

    /// Startup validation; any failure is fatal
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(Error::Config("At least one source must be configured".into()));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            let id = source.id();
            if id.as_str().trim().is_empty() {
                return Err(Error::Config("Source id must not be empty".into()));
            }
            if !seen.insert(id.clone()) {
                return Err(Error::Config(format!("Duplicate source id '{}'", id)));
            }
            if source.limits().max_results == 0 {
                return Err(Error::Config(format!(
                    "Source '{}': max_results must be positive",
                    id
                )));
            }
            if let SourceConfig::Overpass(overpass) = source {
                if overpass.filters.is_empty() {
                    return Err(Error::Config(format!(
                        "Source '{}': at least one category filter is required",
                        id
                    )));
                }
                overpass.region.validate(id)?;
            }
        }

        self.merge.validate()?;
        self.audit.validate()?;
        Ok(())
    }

    /// Look up a source by id
    pub fn source(&self, id: &SourceId) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.id() == id)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

// ============================================================================
// Merge
// ============================================================================

/// Merge engine thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Maximum distance (metres) for two positioned entities to match
    #[serde(default = "default_tolerance_m")]
    pub tolerance_m: f64,

    /// Minimum normalized name similarity (0.0-1.0) when both entities are named
    #[serde(default = "default_name_threshold")]
    pub name_threshold: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            tolerance_m: default_tolerance_m(),
            name_threshold: default_name_threshold(),
        }
    }
}

impl MergeConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.tolerance_m.is_finite() && self.tolerance_m > 0.0) {
            return Err(Error::Config(format!(
                "merge.tolerance_m must be a positive distance, got {}",
                self.tolerance_m
            )));
        }
        if !(0.0..=1.0).contains(&self.name_threshold) {
            return Err(Error::Config(format!(
                "merge.name_threshold must be within 0.0-1.0, got {}",
                self.name_threshold
            )));
        }
        Ok(())
    }
}

fn default_tolerance_m() -> f64 {
    150.0
}

fn default_name_threshold() -> f64 {
    0.8
}

// ============================================================================
// Audit
// ============================================================================

/// Attribute rule that flags an entity for a history lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagRule {
    pub key: AttributeKey,
    pub value: String,
}

/// Audit resolver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Concurrent history lookups
    #[serde(default = "default_audit_concurrency")]
    pub concurrency: usize,

    /// Per-entity lookup timeout
    #[serde(default = "default_audit_timeout_secs")]
    pub timeout_secs: u64,

    /// Fetch changeset details (comment) for each history entry
    #[serde(default = "default_true")]
    pub include_changesets: bool,

    /// Upper bound on audited merged entities per run
    #[serde(default = "default_audit_max_entities")]
    pub max_entities: usize,

    /// Flag merged entities with several values for a single-valued key
    #[serde(default = "default_true")]
    pub flag_conflicts: bool,

    #[serde(default = "default_flag_rules", rename = "flag")]
    pub flags: Vec<FlagRule>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            concurrency: default_audit_concurrency(),
            timeout_secs: default_audit_timeout_secs(),
            include_changesets: true,
            max_entities: default_audit_max_entities(),
            flag_conflicts: true,
            flags: default_flag_rules(),
        }
    }
}

impl AuditConfig {
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Config("audit.concurrency must be at least 1".into()));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config("audit.timeout_secs must be at least 1".into()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_audit_concurrency() -> usize {
    4
}

fn default_audit_timeout_secs() -> u64 {
    30
}

fn default_audit_max_entities() -> usize {
    25
}

fn default_true() -> bool {
    true
}

fn default_flag_rules() -> Vec<FlagRule> {
    vec![FlagRule {
        key: AttributeKey::Religion,
        value: "maori".to_string(),
    }]
}

// ============================================================================
// Sources
// ============================================================================

/// Raw tag/variable name → semantic key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeMapping {
    pub raw: String,
    pub key: AttributeKey,
}

impl AttributeMapping {
    pub fn new(raw: &str, key: AttributeKey) -> Self {
        Self {
            raw: raw.to_string(),
            key,
        }
    }
}

/// Size/time limits and transport behaviour shared by all sources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLimits {
    /// Server-side query timeout
    pub timeout_secs: u64,
    /// Maximum result rows/elements requested
    pub max_results: usize,
    /// Request rate towards the endpoint
    pub requests_per_second: u32,
    /// Attempts for retryable failures (including the first)
    pub max_attempts: u32,
}

impl QueryLimits {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// One configured source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Overpass(OverpassConfig),
    Sparql(SparqlConfig),
}

impl SourceConfig {
    pub fn id(&self) -> &SourceId {
        match self {
            SourceConfig::Overpass(c) => &c.id,
            SourceConfig::Sparql(c) => &c.id,
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            SourceConfig::Overpass(_) => SourceKind::Overpass,
            SourceConfig::Sparql(_) => SourceKind::Sparql,
        }
    }

    pub fn attributes(&self) -> &[AttributeMapping] {
        match self {
            SourceConfig::Overpass(c) => &c.attributes,
            SourceConfig::Sparql(c) => &c.attributes,
        }
    }

    pub fn limits(&self) -> QueryLimits {
        match self {
            SourceConfig::Overpass(c) => QueryLimits {
                timeout_secs: c.timeout_secs,
                max_results: c.max_results,
                requests_per_second: c.requests_per_second,
                max_attempts: c.max_attempts,
            },
            SourceConfig::Sparql(c) => QueryLimits {
                timeout_secs: c.timeout_secs,
                max_results: c.max_results,
                requests_per_second: c.requests_per_second,
                max_attempts: c.max_attempts,
            },
        }
    }
}

/// Region an Overpass query is bound to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Region {
    /// Country area by ISO 3166-1 code
    Area { area: String },
    /// Bounding box in degrees
    BoundingBox {
        south: f64,
        west: f64,
        north: f64,
        east: f64,
    },
}

impl Region {
    fn validate(&self, id: &SourceId) -> Result<()> {
        match self {
            Region::Area { area } if area.trim().is_empty() => Err(Error::Config(format!(
                "Source '{}': region area code must not be empty",
                id
            ))),
            Region::BoundingBox {
                south,
                west,
                north,
                east,
            } if !(south < north && west < east) => Err(Error::Config(format!(
                "Source '{}': bounding box must have south < north and west < east",
                id
            ))),
            _ => Ok(()),
        }
    }
}

/// Tag equality filter, e.g. `amenity = place_of_worship`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagFilter {
    pub key: String,
    pub value: String,
}

impl TagFilter {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

/// Geospatial tag source settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverpassConfig {
    pub id: SourceId,

    #[serde(default = "default_overpass_endpoint")]
    pub endpoint: String,

    /// OSM API base used for history lookups; an empty string disables auditing
    #[serde(default = "default_history_endpoint")]
    pub history_endpoint: Option<String>,

    #[serde(default = "default_region")]
    pub region: Region,

    #[serde(default = "default_filters")]
    pub filters: Vec<TagFilter>,

    #[serde(default = "default_overpass_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// Overpass `[maxsize:]` memory limit in bytes
    #[serde(default)]
    pub max_size_bytes: Option<u64>,

    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_osm_attributes")]
    pub attributes: Vec<AttributeMapping>,
}

impl OverpassConfig {
    /// History API base, if auditing is enabled for this source
    pub fn history_base(&self) -> Option<&str> {
        self.history_endpoint
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

impl Default for OverpassConfig {
    fn default() -> Self {
        Self {
            id: SourceId::from("osm"),
            endpoint: default_overpass_endpoint(),
            history_endpoint: default_history_endpoint(),
            region: default_region(),
            filters: default_filters(),
            timeout_secs: default_overpass_timeout_secs(),
            max_results: default_max_results(),
            max_size_bytes: None,
            requests_per_second: default_requests_per_second(),
            max_attempts: default_max_attempts(),
            attributes: default_osm_attributes(),
        }
    }
}

/// Linked-data source settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparqlConfig {
    pub id: SourceId,

    #[serde(default = "default_sparql_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_graph")]
    pub default_graph: String,

    /// RDF class the subjects must belong to
    #[serde(default = "default_type_filter")]
    pub type_filter: String,

    /// Optional case-insensitive label substring
    #[serde(default)]
    pub text: Option<String>,

    #[serde(default = "default_label_language")]
    pub label_language: Option<String>,

    #[serde(default = "default_sparql_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// Result offset for paging
    #[serde(default)]
    pub offset: usize,

    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_dbpedia_attributes")]
    pub attributes: Vec<AttributeMapping>,
}

impl Default for SparqlConfig {
    fn default() -> Self {
        Self {
            id: SourceId::from("dbpedia"),
            endpoint: default_sparql_endpoint(),
            default_graph: default_graph(),
            type_filter: default_type_filter(),
            text: None,
            label_language: default_label_language(),
            timeout_secs: default_sparql_timeout_secs(),
            max_results: default_max_results(),
            offset: 0,
            requests_per_second: default_requests_per_second(),
            max_attempts: default_max_attempts(),
            attributes: default_dbpedia_attributes(),
        }
    }
}

fn default_sources() -> Vec<SourceConfig> {
    vec![
        SourceConfig::Overpass(OverpassConfig::default()),
        SourceConfig::Sparql(SparqlConfig::default()),
    ]
}

fn default_overpass_endpoint() -> String {
    "https://overpass-api.de/api/interpreter".to_string()
}

fn default_history_endpoint() -> Option<String> {
    Some("https://api.openstreetmap.org/api/0.6".to_string())
}

fn default_region() -> Region {
    Region::Area {
        area: "NZ".to_string(),
    }
}

fn default_filters() -> Vec<TagFilter> {
    vec![TagFilter::new("amenity", "place_of_worship")]
}

fn default_overpass_timeout_secs() -> u64 {
    180
}

fn default_sparql_endpoint() -> String {
    "https://dbpedia.org/sparql".to_string()
}

fn default_graph() -> String {
    "http://dbpedia.org".to_string()
}

fn default_type_filter() -> String {
    "dbo:ReligiousBuilding".to_string()
}

fn default_label_language() -> Option<String> {
    Some("en".to_string())
}

fn default_sparql_timeout_secs() -> u64 {
    30
}

fn default_max_results() -> usize {
    10_000
}

fn default_requests_per_second() -> u32 {
    1
}

fn default_max_attempts() -> u32 {
    3
}

/// Recognized OSM tags, in priority order for single-valued keys
pub fn default_osm_attributes() -> Vec<AttributeMapping> {
    use AttributeKey::*;
    vec![
        AttributeMapping::new("name", Name),
        AttributeMapping::new("name:en", Name),
        AttributeMapping::new("name:mi", Name),
        AttributeMapping::new("official_name", Name),
        AttributeMapping::new("amenity", Category),
        AttributeMapping::new("religion", Religion),
        AttributeMapping::new("denomination", Denomination),
        AttributeMapping::new("building", Building),
        AttributeMapping::new("historic", Historic),
        AttributeMapping::new("addr:country", Country),
        AttributeMapping::new("addr:full", Address),
        AttributeMapping::new("website", Website),
        AttributeMapping::new("wikidata", Wikidata),
        AttributeMapping::new("start_date", StartDate),
        AttributeMapping::new("heritage", Heritage),
    ]
}

/// Result-set variables of the default DBpedia query
pub fn default_dbpedia_attributes() -> Vec<AttributeMapping> {
    use AttributeKey::*;
    vec![
        AttributeMapping::new("label", Name),
        AttributeMapping::new("religion", Religion),
        AttributeMapping::new("denomination", Denomination),
        AttributeMapping::new("country", Country),
        AttributeMapping::new("locationCountry", Country),
        AttributeMapping::new("location", Location),
        AttributeMapping::new("address", Address),
    ]
}
