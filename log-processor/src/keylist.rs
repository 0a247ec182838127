use std::collections::{BTreeMap, BTreeSet};

/// Raw fields an output field is computed from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingTarget {
    Single(String),
    /// Values of every raw field in the set are summed
    Set(BTreeSet<String>),
}

impl MappingTarget {
    pub fn raw_fields(&self) -> impl Iterator<Item = &str> {
        let fields: Vec<&str> = match self {
            MappingTarget::Single(field) => vec![field.as_str()],
            MappingTarget::Set(fields) => fields.iter().map(String::as_str).collect(),
        };
        fields.into_iter()
    }

    fn into_set(self) -> BTreeSet<String> {
        match self {
            MappingTarget::Single(field) => BTreeSet::from([field]),
            MappingTarget::Set(fields) => fields,
        }
    }

    /// Union of both targets, a single field being treated as a one-element set.
    /// An empty set carries no mapping yet and is simply replaced.
    fn merge(self, other: MappingTarget) -> MappingTarget {
        match self {
            MappingTarget::Set(fields) if fields.is_empty() => other,
            existing => {
                let mut fields = existing.into_set();
                fields.extend(other.into_set());
                MappingTarget::Set(fields)
            }
        }
    }
}

/// Public output field name to the raw fields it is computed from.
///
/// Output fields iterate in lexicographic order, which is also the column order of
/// the CSV output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeylistMapping {
    fields: BTreeMap<String, MappingTarget>,
}

impl KeylistMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(mut self, output: impl Into<String>, raw: impl Into<String>) -> Self {
        self.fields
            .insert(output.into(), MappingTarget::Single(raw.into()));
        self
    }

    /// Add `raw` to the set feeding `output`, creating it if needed
    pub fn add_to_set(&mut self, output: &str, raw: impl Into<String>) {
        let raw = raw.into();
        match self.fields.get_mut(output) {
            Some(MappingTarget::Set(fields)) => {
                fields.insert(raw);
            }
            Some(MappingTarget::Single(existing)) => {
                let fields = BTreeSet::from([existing.clone(), raw]);
                self.fields
                    .insert(output.to_string(), MappingTarget::Set(fields));
            }
            None => {
                self.fields
                    .insert(output.to_string(), MappingTarget::Set(BTreeSet::from([raw])));
            }
        }
    }

    /// Fold another plugin's mapping into this one. Fields declared by both end up
    /// mapped to the union of their raw fields.
    pub fn merge(&mut self, other: KeylistMapping) {
        for (output, target) in other.fields {
            let merged = match self.fields.remove(&output) {
                Some(existing) => existing.merge(target),
                None => target,
            };
            self.fields.insert(output, merged);
        }
    }

    pub fn get(&self, output: &str) -> Option<&MappingTarget> {
        self.fields.get(output)
    }

    pub fn contains(&self, output: &str) -> bool {
        self.fields.contains_key(output)
    }

    pub fn output_fields(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MappingTarget)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
