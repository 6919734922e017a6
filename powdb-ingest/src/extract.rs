//! Tag/attribute extractor
//!
//! The single place where untyped source strings are mapped into the
//! recognized [`AttributeKey`] vocabulary. Pure and deterministic: no I/O,
//! unknown tags are ignored, and an empty result is valid.

use crate::config::AttributeMapping;
use crate::types::{Attribute, AttributeKey, BindingRow, RawRecord, TaggedElement};

/// OSM multi-value separator (`religion=christian;maori`)
const MULTI_VALUE_SEPARATOR: char = ';';

/// Maps raw tags or result-set variables onto semantic attributes
///
/// Mapping order matters for single-valued keys: the first mapping that
/// yields a value wins (e.g. `name` before `name:en`).
#[derive(Debug, Clone)]
pub struct TagExtractor {
    mappings: Vec<AttributeMapping>,
}

impl TagExtractor {
    pub fn new(mappings: Vec<AttributeMapping>) -> Self {
        Self { mappings }
    }

    pub fn mappings(&self) -> &[AttributeMapping] {
        &self.mappings
    }

    /// Extract recognized attributes from a raw record
    pub fn extract(&self, record: &RawRecord) -> Vec<Attribute> {
        match record {
            RawRecord::Element(element) => self.extract_tags(element),
            RawRecord::Binding(row) => self.extract_bindings(row),
        }
    }

    /// Tag-collection sources: repeatable keys collect every value,
    /// including `;`-separated multi-values
    pub fn extract_tags(&self, element: &TaggedElement) -> Vec<Attribute> {
        self.collect(|raw_key| {
            element
                .tags
                .iter()
                .filter(|(k, _)| k == raw_key)
                .map(|(_, v)| v.as_str())
                .collect()
        }, true)
    }

    /// Binding-set sources: variable names map through the same table
    pub fn extract_bindings(&self, row: &BindingRow) -> Vec<Attribute> {
        self.collect(|raw_key| {
            row.columns
                .iter()
                .filter(|(name, _)| name == raw_key)
                .map(|(_, v)| v.value.as_str())
                .collect()
        }, false)
    }

    fn collect<'a, F>(&self, lookup: F, split_multi: bool) -> Vec<Attribute>
    where
        F: Fn(&str) -> Vec<&'a str>,
    {
        let mut attributes: Vec<Attribute> = Vec::new();

        for mapping in &self.mappings {
            let key = mapping.key;
            if !key.is_repeatable() && attributes.iter().any(|a| a.key == key) {
                continue;
            }

            for raw_value in lookup(&mapping.raw) {
                for value in split_values(raw_value, key, split_multi) {
                    push_unique(&mut attributes, key, value);
                    if !key.is_repeatable() {
                        break;
                    }
                }
                if !key.is_repeatable() && attributes.iter().any(|a| a.key == key) {
                    break;
                }
            }
        }

        attributes
    }
}

/// Trimmed non-empty values; repeatable tag values split on `;`
fn split_values(raw: &str, key: AttributeKey, split_multi: bool) -> Vec<&str> {
    if split_multi && key.is_repeatable() {
        raw.split(MULTI_VALUE_SEPARATOR)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect()
    } else {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            Vec::new()
        } else {
            vec![trimmed]
        }
    }
}

fn push_unique(attributes: &mut Vec<Attribute>, key: AttributeKey, value: &str) {
    if !attributes.iter().any(|a| a.key == key && a.value == value) {
        attributes.push(Attribute::new(key, value));
    }
}
