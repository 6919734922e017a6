//! Merge engine
//!
//! Groups canonical entities from all sources into clusters believed to
//! denote the same place, then reconciles each cluster into a
//! [`MergedEntity`] with per-value provenance.
//!
//! # Clustering
//! Every matching pair is a link. Links are applied strongest first, ranked
//! by name similarity and then by combined score, and links of exactly equal
//! rank are applied together as one group. Inside a group, the clusters a
//! set of links would connect are joined only when:
//! - every two of those clusters are directly linked in the group (an entity
//!   equally close to two clusters that are not linked to each other stays
//!   separate), and
//! - no two positioned members of the joined cluster lie farther apart than
//!   the tolerance radius (a member without coordinates cannot bridge two
//!   distant places).
//!
//! Raising the name threshold only drops a tail of the ranked links, so the
//! clusters at a stricter threshold always split those at a looser one. The
//! result does not depend on input order.
//!
//! # Reconciliation
//! Identical values collapse into one value with combined provenance;
//! differing values for the same key are all retained. No value is ever
//! chosen over another.

pub mod similarity;

use crate::config::MergeConfig;
use crate::types::{AttributeKey, Entity, EntityId, MergedAttribute, MergedEntity, SourcedPosition};
use similarity::{PairMatch, SimilarityScorer};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Cross-source entity merger
#[derive(Debug, Clone)]
pub struct MergeEngine {
    scorer: SimilarityScorer,
}

/// Matching pair of entities, by index into the ordered entity list
#[derive(Debug, Clone, Copy)]
struct Link {
    a: usize,
    b: usize,
    matched: PairMatch,
}

/// Disjoint sets of entity indices with their member lists
#[derive(Debug)]
struct Clusters {
    parent: Vec<usize>,
    members: Vec<Vec<usize>>,
}

impl Clusters {
    fn singletons(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            members: (0..n).map(|i| vec![i]).collect(),
        }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn join(&mut self, into: usize, from: usize) {
        let moved = std::mem::take(&mut self.members[from]);
        self.members[into].extend(moved);
        self.parent[from] = into;
    }

    /// Member lists of every cluster, roots in ascending order
    fn into_groups(self) -> Vec<Vec<usize>> {
        self.members.into_iter().filter(|m| !m.is_empty()).collect()
    }
}

impl MergeEngine {
    pub fn new(config: &MergeConfig) -> Self {
        Self {
            scorer: SimilarityScorer::new(config),
        }
    }

    pub fn scorer(&self) -> &SimilarityScorer {
        &self.scorer
    }

    /// Merge all entities into provenance-tagged results
    ///
    /// Inputs are only read; every result is a new value. Output is sorted by
    /// member ids.
    pub fn merge(&self, entities: &[Entity]) -> Vec<MergedEntity> {
        let mut ordered: Vec<&Entity> = entities.iter().collect();
        ordered.sort_by(|a, b| canonical_order(a, b));

        let clusters = self.cluster(&ordered);

        let mut merged: Vec<MergedEntity> = clusters
            .iter()
            .map(|members| self.reconcile(&ordered, members))
            .collect();
        merged.sort_by(|a, b| a.members.cmp(&b.members));

        let multi_source = merged.iter().filter(|m| m.is_multi_source()).count();
        info!(
            entities = entities.len(),
            clusters = merged.len(),
            multi_source,
            "Merge complete"
        );

        merged
    }

    /// Every matching pair, strongest rank first
    fn links(&self, ordered: &[&Entity]) -> Vec<Link> {
        let mut links = Vec::new();
        for (a, left) in ordered.iter().enumerate() {
            for (offset, right) in ordered[a + 1..].iter().enumerate() {
                if let Some(matched) = self.scorer.pair(left, right) {
                    links.push(Link {
                        a,
                        b: a + 1 + offset,
                        matched,
                    });
                }
            }
        }

        links.sort_by(|x, y| {
            let (xn, xs) = x.matched.rank();
            let (yn, ys) = y.matched.rank();
            yn.total_cmp(&xn)
                .then_with(|| ys.total_cmp(&xs))
                .then_with(|| (x.a, x.b).cmp(&(y.a, y.b)))
        });
        links
    }

    fn cluster(&self, ordered: &[&Entity]) -> Vec<Vec<usize>> {
        let links = self.links(ordered);
        let mut clusters = Clusters::singletons(ordered.len());

        for group in links.chunk_by(|x, y| x.matched.rank() == y.matched.rank()) {
            self.apply_group(ordered, group, &mut clusters);
        }

        clusters.into_groups()
    }

    /// Join the clusters connected by one group of equally ranked links
    fn apply_group(&self, ordered: &[&Entity], group: &[Link], clusters: &mut Clusters) {
        let mut adjacent: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        for link in group {
            let (ra, rb) = (clusters.find(link.a), clusters.find(link.b));
            if ra != rb {
                adjacent.entry(ra).or_default().insert(rb);
                adjacent.entry(rb).or_default().insert(ra);
            }
        }

        let mut visited: BTreeSet<usize> = BTreeSet::new();
        let roots: Vec<usize> = adjacent.keys().copied().collect();
        for root in roots {
            if !visited.insert(root) {
                continue;
            }

            let mut component = vec![root];
            let mut next = 0;
            while next < component.len() {
                let current = component[next];
                for &neighbour in &adjacent[&current] {
                    if visited.insert(neighbour) {
                        component.push(neighbour);
                    }
                }
                next += 1;
            }

            let fully_linked = component
                .iter()
                .all(|r| adjacent[r].len() == component.len() - 1);
            if !fully_linked {
                debug!(
                    clusters = component.len(),
                    "Equal links to unrelated clusters, keeping separate"
                );
                continue;
            }
            if !self.compatible(ordered, clusters, &component) {
                debug!(
                    clusters = component.len(),
                    "Members too far apart, keeping separate"
                );
                continue;
            }

            let into = component[0];
            for &from in &component[1..] {
                clusters.join(into, from);
            }
        }
    }

    /// No two positioned members of the joined clusters exceed the tolerance
    fn compatible(&self, ordered: &[&Entity], clusters: &Clusters, roots: &[usize]) -> bool {
        let positions: Vec<_> = roots
            .iter()
            .flat_map(|&r| clusters.members[r].iter())
            .filter_map(|&i| ordered[i].position)
            .collect();

        positions.iter().enumerate().all(|(i, &a)| {
            positions[i + 1..]
                .iter()
                .all(|&b| self.scorer.within_tolerance(a, b))
        })
    }

    fn reconcile(&self, ordered: &[&Entity], cluster: &[usize]) -> MergedEntity {
        let members: Vec<&Entity> = cluster.iter().map(|&i| ordered[i]).collect();

        let mut values: BTreeMap<(AttributeKey, String), BTreeSet<EntityId>> =
            BTreeMap::new();
        for entity in &members {
            for attribute in &entity.attributes {
                values
                    .entry((attribute.key, attribute.value.clone()))
                    .or_default()
                    .insert(entity.id.clone());
            }
        }

        let attributes = values
            .into_iter()
            .map(|((key, value), provenance)| MergedAttribute {
                key,
                value,
                provenance,
            })
            .collect();

        let positions = members
            .iter()
            .filter_map(|e| {
                e.position.map(|position| SourcedPosition {
                    entity: e.id.clone(),
                    position,
                })
            })
            .collect();

        let mut ids: Vec<EntityId> = members.iter().map(|e| e.id.clone()).collect();
        ids.sort();

        MergedEntity {
            members: ids,
            positions,
            attributes,
            confidence: self.confidence(&members),
        }
    }

    /// Maximum pairwise similarity; 1.0 for a singleton
    fn confidence(&self, members: &[&Entity]) -> f64 {
        if members.len() < 2 {
            return 1.0;
        }

        let mut best = 0.0_f64;
        for (i, a) in members.iter().enumerate() {
            for b in &members[i + 1..] {
                if let Some(score) = self.scorer.score(a, b) {
                    best = best.max(score);
                }
            }
        }
        best
    }
}

/// Total order over entities: id, then attributes, then position
fn canonical_order(a: &Entity, b: &Entity) -> Ordering {
    a.id.cmp(&b.id)
        .then_with(|| a.attributes.cmp(&b.attributes))
        .then_with(|| match (a.position, b.position) {
            (Some(pa), Some(pb)) => pa
                .lat
                .total_cmp(&pb.lat)
                .then_with(|| pa.lon.total_cmp(&pb.lon)),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
}
