//! Label to tag mapping registry
//!
//! Built once per process from configuration and shared read-only with every
//! pass. Parsers receive it through the graph builder.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::kind::EntityKind;

/// One mapping rule: a label (optionally with a fixed value) on an entity kind
/// (or on any kind) assigns a tag
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagMapping {
    /// Entity kind the rule applies to; `None` matches every labelled kind
    #[serde(default)]
    pub kind: Option<EntityKind>,
    /// Label name
    pub label: String,
    /// Label value; `None` matches any value
    #[serde(default)]
    pub value: Option<String>,
    /// Tag assigned when the rule matches. `{value}` is replaced with the label value.
    pub tag: String,
}

impl TagMapping {
    fn tag_for(&self, kind: EntityKind, labels: &BTreeMap<String, String>) -> Option<String> {
        if self.kind.is_some_and(|k| k != kind) {
            return None;
        }
        let value = labels.get(&self.label)?;
        if self.value.as_ref().is_some_and(|v| v != value) {
            return None;
        }
        Some(self.tag.replace("{value}", value))
    }
}

/// Read-mostly registry of tag mappings
#[derive(Clone, Debug, Default)]
pub struct TagMapper {
    mappings: Vec<TagMapping>,
}

impl TagMapper {
    /// Build a registry from mapping rules
    pub fn new(mappings: Vec<TagMapping>) -> Self {
        Self { mappings }
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    /// True when no rules are configured
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Tags that apply to an entity with the given labels
    pub fn tags_for(
        &self,
        kind: EntityKind,
        labels: &BTreeMap<String, String>,
    ) -> BTreeSet<String> {
        self.mappings
            .iter()
            .filter_map(|m| m.tag_for(kind, labels))
            .collect()
    }
}
