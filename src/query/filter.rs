use crate::models::LabelMap;
use crate::store::{Field, Term};

/// Label-equality filters and group-by keys shared by every dashboard query.
///
/// A filter on a key the event does not carry never matches; it is not a
/// wildcard. Filters come in as a [`LabelMap`], so a repeated key has already
/// been resolved in favour of the later value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterSet {
    filters: LabelMap,
    group_by: Vec<String>,
}

impl FilterSet {
    pub fn new(filters: &LabelMap, group_by: &[String]) -> Self {
        let mut keys: Vec<String> = Vec::with_capacity(group_by.len());
        for key in group_by {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        Self {
            filters: filters.clone(),
            group_by: keys,
        }
    }

    pub fn filters(&self) -> &LabelMap {
        &self.filters
    }

    /// Predicate terms for the store, one per filter key.
    pub fn terms(&self) -> Vec<Term> {
        self.filters
            .iter()
            .map(|(key, value)| Term::Eq(Field::label(key), value.to_string()))
            .collect()
    }

    /// Same semantics as [`FilterSet::terms`], evaluated against one event's labels.
    pub fn matches(&self, labels: &LabelMap) -> bool {
        self.filters
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }

    pub fn group_fields(&self) -> Vec<Field> {
        self.group_by.iter().map(|key| Field::label(key)).collect()
    }

    pub fn group_keys(&self) -> GroupKeys {
        GroupKeys {
            keys: self.group_by.clone(),
        }
    }
}

/// Maps label values onto the composite grouping key, in group-by order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupKeys {
    keys: Vec<String>,
}

impl GroupKeys {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Absent labels become `""` so every key has the same arity.
    pub fn key_for(&self, labels: &LabelMap) -> Vec<String> {
        self.keys
            .iter()
            .map(|key| labels.get(key).unwrap_or("").to_string())
            .collect()
    }

    pub fn labels_for(&self, values: &[String]) -> LabelMap {
        self.keys
            .iter()
            .enumerate()
            .map(|(idx, key)| (key.clone(), values.get(idx).cloned().unwrap_or_default()))
            .collect()
    }
}
