//! Core data model for the ingest pipeline
//!
//! Explicit contracts between the pipeline stages:
//! - **Source adapters** produce [`RawRecord`]s
//! - **Extractor + normalizer** turn them into [`Entity`]s
//! - **Merge engine** combines entities into [`MergedEntity`]s
//! - **Audit resolver** produces [`ProvenanceRecord`]s on demand

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Source Identity
// ============================================================================

/// Configured source identifier (e.g. "osm", "dbpedia")
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Type of external system behind a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Geospatial tag service (Overpass interpreter over OpenStreetMap)
    Overpass,
    /// Linked-data knowledge base (SPARQL endpoint, e.g. DBpedia)
    Sparql,
}

impl SourceKind {
    /// Whether entities from this kind of source carry an edit history
    pub fn supports_history(self) -> bool {
        match self {
            Self::Overpass => true,
            Self::Sparql => false,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overpass => write!(f, "overpass"),
            Self::Sparql => write!(f, "sparql"),
        }
    }
}

// ============================================================================
// Raw Records (source-native)
// ============================================================================

/// WGS84 coordinate pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
}

impl Position {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Latitude in [-90, 90], longitude in [-180, 180], both finite
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// OSM geometry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Node,
    Way,
    Relation,
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node => write!(f, "node"),
            Self::Way => write!(f, "way"),
            Self::Relation => write!(f, "relation"),
        }
    }
}

/// Tagged map element as returned by the geospatial source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedElement {
    pub kind: ElementKind,
    pub id: i64,
    pub position: Option<Position>,
    /// Ordered key → value tags
    pub tags: Vec<(String, String)>,
    pub version: Option<u32>,
    pub changeset: Option<u64>,
    pub timestamp: Option<String>,
    pub user: Option<String>,
}

impl TaggedElement {
    /// First value for a raw tag key
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Single RDF term in a result row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingValue {
    /// "uri", "literal", "typed-literal" or "bnode"
    pub kind: String,
    pub value: String,
    pub lang: Option<String>,
    pub datatype: Option<String>,
}

/// One row of a linked-data result set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingRow {
    /// Subject resource (value of the subject column)
    pub subject: String,
    /// Named columns in result-set variable order
    pub columns: Vec<(String, BindingValue)>,
}

impl BindingRow {
    pub fn get(&self, var: &str) -> Option<&BindingValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == var)
            .map(|(_, v)| v)
    }
}

/// Source-native record, immutable once fetched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawRecord {
    Element(TaggedElement),
    Binding(BindingRow),
}

impl RawRecord {
    /// Identifier of the record inside its source
    pub fn native_id(&self) -> String {
        match self {
            RawRecord::Element(e) => format!("{}/{}", e.kind, e.id),
            RawRecord::Binding(row) => row.subject.clone(),
        }
    }

    /// Kind of source able to produce this record
    pub fn source_kind(&self) -> SourceKind {
        match self {
            RawRecord::Element(_) => SourceKind::Overpass,
            RawRecord::Binding(_) => SourceKind::Sparql,
        }
    }
}

// ============================================================================
// Attributes
// ============================================================================

/// Recognized semantic vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKey {
    Name,
    Category,
    Religion,
    Denomination,
    Building,
    Historic,
    Country,
    Location,
    Address,
    Website,
    Wikidata,
    StartDate,
    Heritage,
}

impl AttributeKey {
    /// Keys for which one record may legitimately carry several values
    pub fn is_repeatable(self) -> bool {
        matches!(
            self,
            Self::Category
                | Self::Religion
                | Self::Denomination
                | Self::Building
                | Self::Historic
                | Self::Country
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Category => "category",
            Self::Religion => "religion",
            Self::Denomination => "denomination",
            Self::Building => "building",
            Self::Historic => "historic",
            Self::Country => "country",
            Self::Location => "location",
            Self::Address => "address",
            Self::Website => "website",
            Self::Wikidata => "wikidata",
            Self::StartDate => "start_date",
            Self::Heritage => "heritage",
        }
    }
}

impl fmt::Display for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Semantic key/value pair extracted from raw tags
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Attribute {
    pub key: AttributeKey,
    pub value: String,
}

impl Attribute {
    pub fn new(key: AttributeKey, value: impl Into<String>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }
}

// ============================================================================
// Entities
// ============================================================================

/// Canonical identifier scoped to the originating source
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId {
    pub source: SourceId,
    pub native_id: String,
}

impl EntityId {
    pub fn new(source: SourceId, native_id: impl Into<String>) -> Self {
        Self {
            source,
            native_id: native_id.into(),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.native_id)
    }
}

/// Canonical single-source place-of-worship candidate
///
/// Immutable after normalization; the merge engine only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub position: Option<Position>,
    pub attributes: Vec<Attribute>,
    /// Raw record kept for traceability
    #[serde(skip)]
    pub raw: Option<Arc<RawRecord>>,
}

impl Entity {
    pub fn source(&self) -> &SourceId {
        &self.id.source
    }

    /// All values for a semantic key, in extraction order
    pub fn values(&self, key: AttributeKey) -> impl Iterator<Item = &str> + '_ {
        self.attributes
            .iter()
            .filter(move |a| a.key == key)
            .map(|a| a.value.as_str())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.values(AttributeKey::Name)
    }

    pub fn has_name(&self) -> bool {
        self.names().next().is_some()
    }
}

/// Attribute value in a merged entity with its contributors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedAttribute {
    pub key: AttributeKey,
    pub value: String,
    /// Entities that contributed this exact value
    pub provenance: BTreeSet<EntityId>,
}

impl MergedAttribute {
    /// Distinct sources behind this value
    pub fn sources(&self) -> BTreeSet<&SourceId> {
        self.provenance.iter().map(|id| &id.source).collect()
    }
}

/// Position reported by one member of a merged entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcedPosition {
    pub entity: EntityId,
    pub position: Position,
}

/// One or more entities believed to denote the same place
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedEntity {
    /// Member entity ids, sorted
    pub members: Vec<EntityId>,
    /// Every member position; disagreeing positions are all kept
    pub positions: Vec<SourcedPosition>,
    /// Merged attributes sorted by (key, value); conflicting values retained
    pub attributes: Vec<MergedAttribute>,
    /// Maximum pairwise similarity within the cluster (1.0 for singletons)
    pub confidence: f64,
}

impl MergedEntity {
    /// Distinct sources contributing to this entity
    pub fn sources(&self) -> BTreeSet<&SourceId> {
        self.members.iter().map(|id| &id.source).collect()
    }

    pub fn is_multi_source(&self) -> bool {
        self.sources().len() > 1
    }

    pub fn values(&self, key: AttributeKey) -> impl Iterator<Item = &MergedAttribute> + '_ {
        self.attributes.iter().filter(move |a| a.key == key)
    }

    /// Merged attribute for an exact key/value pair
    pub fn attribute(&self, key: AttributeKey, value: &str) -> Option<&MergedAttribute> {
        self.attributes
            .iter()
            .find(|a| a.key == key && a.value == value)
    }

    /// Non-repeatable keys that ended up with more than one value
    pub fn conflicting_keys(&self) -> Vec<AttributeKey> {
        let mut keys: Vec<AttributeKey> = Vec::new();
        for attr in &self.attributes {
            if attr.key.is_repeatable() || keys.contains(&attr.key) {
                continue;
            }
            if self.values(attr.key).count() > 1 {
                keys.push(attr.key);
            }
        }
        keys
    }
}

// ============================================================================
// Provenance (audit output)
// ============================================================================

/// One historical edit of an audited entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub changeset: u64,
    pub editor: Option<String>,
    pub editor_uid: Option<u64>,
    /// Changeset comment, when changeset details were requested
    pub comment: Option<String>,
    /// Recognized attributes as of this version
    pub attributes: Vec<Attribute>,
    pub position: Option<Position>,
}
