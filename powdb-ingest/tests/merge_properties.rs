//! Merge engine properties and scenarios
//!
//! Exercised through the public API only: idempotence, order independence,
//! provenance completeness, clustering monotonicity and the reference
//! scenarios (same church in two sources, same name 50 km apart).

mod helpers;

use helpers::{cluster_of, entity, merge_config, ST_MARYS};
use powdb_ingest::config::MergeConfig;
use powdb_ingest::types::{AttributeKey, Entity, MergedEntity, Position};
use powdb_ingest::MergeEngine;
use std::collections::{BTreeSet, HashMap};

/// Member set of the cluster holding each entity, keyed by entity id
fn clusters_by_member(merged: &[MergedEntity]) -> HashMap<String, BTreeSet<String>> {
    merged
        .iter()
        .flat_map(|m| {
            let members: BTreeSet<String> = m.members.iter().map(|id| id.to_string()).collect();
            m.members
                .iter()
                .map(move |id| (id.to_string(), members.clone()))
        })
        .collect()
}

/// Every cluster at each stricter threshold lies inside one looser cluster
fn assert_monotone(entities: &[Entity], tolerance_m: f64, thresholds: &[f64]) {
    let runs: Vec<HashMap<String, BTreeSet<String>>> = thresholds
        .iter()
        .map(|&t| clusters_by_member(&MergeEngine::new(&merge_config(tolerance_m, t)).merge(entities)))
        .collect();

    for (i, pair) in runs.windows(2).enumerate() {
        for (id, stricter) in &pair[1] {
            let looser = &pair[0][id];
            assert!(
                stricter.is_subset(looser),
                "{} at threshold {}: {:?} not within {:?} at {}",
                id,
                thresholds[i + 1],
                stricter,
                looser,
                thresholds[i]
            );
        }
    }
}

fn sample_entities() -> Vec<Entity> {
    let cathedral = Position::new(-43.5309, 172.6371);
    vec![
        entity(
            "osm",
            "node/101",
            Some(ST_MARYS),
            &[
                (AttributeKey::Name, "St Mary's Church"),
                (AttributeKey::Religion, "christian"),
            ],
        ),
        entity(
            "dbpedia",
            "http://dbpedia.org/resource/St_Mary's_Church",
            Some(ST_MARYS),
            &[
                (AttributeKey::Name, "St Mary's Church"),
                (AttributeKey::Religion, "christian"),
                (AttributeKey::Denomination, "catholic"),
            ],
        ),
        entity(
            "osm",
            "node/202",
            Some(cathedral),
            &[
                (AttributeKey::Name, "ChristChurch Cathedral"),
                (AttributeKey::Denomination, "anglican"),
            ],
        ),
        entity(
            "dbpedia",
            "http://dbpedia.org/resource/ChristChurch_Cathedral",
            None,
            &[(AttributeKey::Name, "ChristChurch Cathedral")],
        ),
        entity("osm", "node/303", None, &[(AttributeKey::Religion, "buddhist")]),
    ]
}

fn as_set(merged: &[MergedEntity]) -> Vec<String> {
    let mut out: Vec<String> = merged
        .iter()
        .map(|m| serde_json::to_string(m).unwrap())
        .collect();
    out.sort();
    out
}

// ================================================================================================
// Scenarios
// ================================================================================================

#[test]
fn same_church_in_two_sources_merges_with_provenance() {
    let entities = sample_entities();
    let engine = MergeEngine::new(&MergeConfig::default());
    let merged = engine.merge(&entities[..2]);

    assert_eq!(merged.len(), 1);
    let church = &merged[0];
    assert!(church.is_multi_source());
    assert!(church.confidence >= MergeConfig::default().name_threshold);

    let religion = church.attribute(AttributeKey::Religion, "christian").unwrap();
    let religion_sources: Vec<_> = religion.sources().into_iter().map(|s| s.as_str()).collect();
    assert_eq!(religion_sources, vec!["dbpedia", "osm"]);

    let denomination = church.attribute(AttributeKey::Denomination, "catholic").unwrap();
    let denomination_sources: Vec<_> =
        denomination.sources().into_iter().map(|s| s.as_str()).collect();
    assert_eq!(denomination_sources, vec!["dbpedia"]);

    assert_eq!(church.values(AttributeKey::Name).count(), 1);
}

#[test]
fn identical_names_fifty_km_apart_stay_separate() {
    let a = entity("osm", "node/1", Some(Position::new(-41.0, 175.0)), &[(AttributeKey::Name, "Union Church")]);
    let b = entity("osm", "node/2", Some(Position::new(-41.45, 175.0)), &[(AttributeKey::Name, "Union Church")]);

    let merged = MergeEngine::new(&MergeConfig::default()).merge(&[a, b]);
    assert_eq!(merged.len(), 2);
    assert!(merged.iter().all(|m| m.members.len() == 1 && m.confidence == 1.0));
}

#[test]
fn unpositioned_record_does_not_join_places_fifty_km_apart() {
    let a = entity("osm", "node/1", Some(Position::new(-41.0, 175.0)), &[(AttributeKey::Name, "St Mary's Church")]);
    let b = entity("osm", "node/2", Some(Position::new(-41.45, 175.0)), &[(AttributeKey::Name, "St Mary's Church")]);
    let row = entity(
        "dbpedia",
        "http://dbpedia.org/resource/St_Mary's_Church",
        None,
        &[(AttributeKey::Name, "St Mary's Church")],
    );

    let merged = MergeEngine::new(&MergeConfig::default()).merge(&[a.clone(), row, b.clone()]);
    assert_ne!(cluster_of(&merged, &a.id), cluster_of(&merged, &b.id));
    for m in &merged {
        assert!(m.positions.len() <= 1, "{:?} spans both places", m.members);
    }
}

#[test]
fn unpositioned_unnamed_entity_is_singleton() {
    let entities = sample_entities();
    let merged = MergeEngine::new(&MergeConfig::default()).merge(&entities);

    let bare = cluster_of(&merged, &entities[4].id);
    assert_eq!(bare.members.len(), 1);
    let provenance = &bare.attribute(AttributeKey::Religion, "buddhist").unwrap().provenance;
    assert_eq!(provenance.iter().collect::<Vec<_>>(), vec![&entities[4].id]);
}

#[test]
fn name_only_match_across_sources() {
    // Linked-data record lacks coordinates; the name alone links it
    let entities = sample_entities();
    let merged = MergeEngine::new(&MergeConfig::default()).merge(&entities);

    let cathedral = cluster_of(&merged, &entities[2].id);
    assert!(cathedral.members.contains(&entities[3].id));
    assert_eq!(cathedral.positions.len(), 1);
    assert_eq!(merged.len(), 3);
}

// ================================================================================================
// Properties
// ================================================================================================

#[test]
fn merge_is_idempotent_and_order_independent() {
    let engine = MergeEngine::new(&MergeConfig::default());
    let entities = sample_entities();

    let first = engine.merge(&entities);
    let second = engine.merge(&entities);
    assert_eq!(as_set(&first), as_set(&second));

    let mut reversed = entities.clone();
    reversed.reverse();
    assert_eq!(as_set(&first), as_set(&engine.merge(&reversed)));

    let mut rotated = entities;
    rotated.rotate_left(2);
    assert_eq!(first, engine.merge(&rotated));
}

#[test]
fn merge_never_drops_a_value() {
    let entities = sample_entities();
    let merged = MergeEngine::new(&MergeConfig::default()).merge(&entities);

    let input: BTreeSet<(AttributeKey, String)> = entities
        .iter()
        .flat_map(|e| e.attributes.iter().map(|a| (a.key, a.value.clone())))
        .collect();
    let output: BTreeSet<(AttributeKey, String)> = merged
        .iter()
        .flat_map(|m| m.attributes.iter().map(|a| (a.key, a.value.clone())))
        .collect();
    assert_eq!(input, output);

    for m in &merged {
        for attribute in &m.attributes {
            assert!(!attribute.provenance.is_empty());
            for contributor in &attribute.provenance {
                assert!(m.members.contains(contributor));
                let source_entity = entities.iter().find(|e| &e.id == contributor).unwrap();
                assert!(source_entity
                    .values(attribute.key)
                    .any(|v| v == attribute.value));
            }
        }
    }

    let member_count: usize = merged.iter().map(|m| m.members.len()).sum();
    assert_eq!(member_count, entities.len());
}

#[test]
fn stricter_threshold_never_grows_a_cluster() {
    let names = [
        "St Mary's Church",
        "St Marys Church",
        "St Mary Church",
        "Saint Mary Church",
        "St Mary's Catholic Church",
    ];
    let entities: Vec<Entity> = names
        .iter()
        .enumerate()
        .map(|(i, name)| entity("osm", &format!("node/{}", i + 1), Some(ST_MARYS), &[(AttributeKey::Name, *name)]))
        .collect();

    let thresholds = [0.5, 0.6, 0.7, 0.8, 0.85, 0.9, 0.95, 1.0];
    assert_monotone(&entities, 150.0, &thresholds);

    let loosest = clusters_by_member(&MergeEngine::new(&merge_config(150.0, 0.5)).merge(&entities));
    let strictest = clusters_by_member(&MergeEngine::new(&merge_config(150.0, 1.0)).merge(&entities));
    assert_eq!(loosest["osm/node/1"].len(), 5);
    assert_eq!(strictest["osm/node/1"].len(), 2);
}

#[test]
fn stricter_threshold_splits_clusters_across_positions() {
    // 20-letter names: C is 3 edits from A, B is 2 edits from C and 5 from A.
    // B sits 30 m north of the others; D shares C's name without a position.
    let a = "a".repeat(20);
    let c = format!("bbb{}", "a".repeat(17));
    let b = format!("bbbbb{}", "a".repeat(15));
    let north = Position::new(ST_MARYS.lat + 30.0 / 111_195.0, ST_MARYS.lon);

    let entities = vec![
        entity("osm", "node/1", Some(ST_MARYS), &[(AttributeKey::Name, &a)]),
        entity("osm", "node/2", Some(north), &[(AttributeKey::Name, &b)]),
        entity("osm", "node/3", Some(ST_MARYS), &[(AttributeKey::Name, &c)]),
        entity("dbpedia", "node/4", None, &[(AttributeKey::Name, &c)]),
    ];

    assert_monotone(&entities, 150.0, &[0.7, 0.8, 0.85, 0.88, 0.9, 0.95, 1.0]);

    let at = |t: f64| clusters_by_member(&MergeEngine::new(&merge_config(150.0, t)).merge(&entities));
    assert_eq!(at(0.8)["osm/node/2"].len(), 4);
    assert_eq!(at(0.88)["osm/node/1"].len(), 1);
    assert_eq!(at(0.88)["osm/node/2"].len(), 3);
    assert_eq!(at(0.95)["osm/node/3"].len(), 2);
}

#[test]
fn stricter_threshold_never_grows_a_cluster_on_mixed_data() {
    let names = [
        "St Mary's Church",
        "St Mary Church",
        "Saint Mary's",
        "St Marys Anglican Church",
        "Wesley Church",
        "Wesley Methodist Church",
    ];
    let offsets_m = [0.0, 40.0, 90.0, 140.0, 2_000.0];

    let mut entities = Vec::new();
    for (i, name) in names.iter().enumerate() {
        for (j, offset) in offsets_m.iter().enumerate() {
            if (i + j) % 2 == 1 {
                continue;
            }
            let position = Position::new(ST_MARYS.lat + offset / 111_195.0, ST_MARYS.lon);
            entities.push(entity("osm", &format!("node/{}{}", i, j), Some(position), &[(AttributeKey::Name, *name)]));
        }
        entities.push(entity("dbpedia", &format!("row/{}", i), None, &[(AttributeKey::Name, *name)]));
    }

    let thresholds = [0.3, 0.5, 0.6, 0.7, 0.75, 0.8, 0.85, 0.9, 0.95, 1.0];
    assert_monotone(&entities, 150.0, &thresholds);
    assert_monotone(&entities, 60.0, &thresholds);
}

#[test]
fn tolerance_bounds_cluster_extent() {
    let base = Position::new(-36.8485, 174.7633);
    let entities: Vec<Entity> = (0..4)
        .map(|i| {
            let position = Position::new(base.lat + 0.0004 * i as f64, base.lon);
            entity("osm", &format!("node/{}", i), Some(position), &[(AttributeKey::Name, "Mosque")])
        })
        .collect();

    let loose = MergeEngine::new(&merge_config(500.0, 0.8)).merge(&entities);
    let tight = MergeEngine::new(&merge_config(10.0, 0.8)).merge(&entities);

    assert_eq!(loose.len(), 1);
    assert_eq!(tight.len(), 4);
}
