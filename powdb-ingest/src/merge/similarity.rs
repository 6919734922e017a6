//! Pairwise similarity between entities
//!
//! Two criteria, each applicable only when both entities carry the data:
//! geographic proximity (haversine distance within a tolerance radius) and
//! name similarity (normalized Levenshtein over normalized names). A pair is a
//! merge candidate only when every applicable criterion passes; its score is
//! the mean of the applicable component scores.

use crate::config::MergeConfig;
use crate::types::{Entity, Position};

/// Mean Earth radius in metres (IUGG)
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Great-circle distance in metres
///
/// # Examples
/// ```
/// use powdb_ingest::merge::similarity::haversine_m;
/// use powdb_ingest::types::Position;
///
/// let p = Position::new(-36.8485, 174.7633);
/// assert_eq!(haversine_m(p, p), 0.0);
/// ```
pub fn haversine_m(a: Position, b: Position) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Canonical form used for name comparison
///
/// Lowercase, apostrophes dropped, other punctuation turned into spaces,
/// whitespace collapsed.
///
/// # Examples
/// ```
/// use powdb_ingest::merge::similarity::normalize_name;
///
/// assert_eq!(normalize_name("St. Mary's  Church"), "st marys church");
/// assert_eq!(normalize_name("Hāto Hōhepa"), "hāto hōhepa");
/// ```
pub fn normalize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '\'' | '\u{2019}' | '`'))
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Best normalized-name similarity across both entities' names
pub fn name_similarity(a: &Entity, b: &Entity) -> Option<f64> {
    let names_b: Vec<String> = b.names().map(normalize_name).collect();

    a.names()
        .map(normalize_name)
        .flat_map(|na| {
            names_b
                .iter()
                .map(move |nb| strsim::normalized_levenshtein(&na, nb))
                .collect::<Vec<_>>()
        })
        .fold(None, |best: Option<f64>, s| {
            Some(best.map_or(s, |b| b.max(s)))
        })
}

/// Component scores of an entity pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairScore {
    /// Distance in metres when both entities are positioned
    pub distance_m: Option<f64>,
    /// Best name similarity when both entities are named
    pub name: Option<f64>,
}

/// Accepted match between two entities
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairMatch {
    /// Mean of the applicable component scores
    pub score: f64,
    /// Name similarity, when both entities are named
    pub name: Option<f64>,
}

impl PairMatch {
    /// Ordering key for clustering: name similarity first, then score
    ///
    /// Pairs without a name comparison rank with exact name matches, so a
    /// stricter name threshold only ever removes a tail of the ordering.
    pub fn rank(&self) -> (f64, f64) {
        (self.name.unwrap_or(1.0), self.score)
    }
}

/// Scores pairs of entities against the merge thresholds
#[derive(Debug, Clone)]
pub struct SimilarityScorer {
    tolerance_m: f64,
    name_threshold: f64,
}

impl SimilarityScorer {
    pub fn new(config: &MergeConfig) -> Self {
        Self {
            tolerance_m: config.tolerance_m,
            name_threshold: config.name_threshold,
        }
    }

    /// Raw component scores without threshold checks
    pub fn components(&self, a: &Entity, b: &Entity) -> PairScore {
        PairScore {
            distance_m: match (a.position, b.position) {
                (Some(pa), Some(pb)) => Some(haversine_m(pa, pb)),
                _ => None,
            },
            name: name_similarity(a, b),
        }
    }

    /// Combined similarity, or `None` when the pair cannot match
    ///
    /// The same entity id (one subject reported in several rows) always
    /// matches with 1.0.
    pub fn score(&self, a: &Entity, b: &Entity) -> Option<f64> {
        self.pair(a, b).map(|m| m.score)
    }

    /// Full match details, or `None` when the pair cannot match
    pub fn pair(&self, a: &Entity, b: &Entity) -> Option<PairMatch> {
        if a.id == b.id {
            return Some(PairMatch {
                score: 1.0,
                name: None,
            });
        }

        let components = self.components(a, b);
        let mut scores: Vec<f64> = Vec::with_capacity(2);

        if let Some(distance) = components.distance_m {
            if distance > self.tolerance_m {
                return None;
            }
            scores.push(1.0 - distance / self.tolerance_m);
        }

        if let Some(name) = components.name {
            if name < self.name_threshold {
                return None;
            }
            scores.push(name);
        }

        if scores.is_empty() {
            // Neither criterion applies: no basis for a match
            return None;
        }

        Some(PairMatch {
            score: scores.iter().sum::<f64>() / scores.len() as f64,
            name: components.name,
        })
    }

    /// Whether two positions may belong to the same place
    pub fn within_tolerance(&self, a: Position, b: Position) -> bool {
        haversine_m(a, b) <= self.tolerance_m
    }
}
