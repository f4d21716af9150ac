// Name-keyed resource registry
//
// Insertion never overwrites: a second value under an existing name is
// rejected and the original entry stays put.

use super::error::{ComputeError, ResourceKind};
use std::collections::HashMap;

/// Outcome of [`Registry::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    Inserted,
    AlreadyExists,
}

pub struct Registry<T> {
    kind: ResourceKind,
    entries: HashMap<String, T>,
}

impl<T> Registry<T> {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            entries: HashMap::new(),
        }
    }

    /// Insert `value` under `name`; the value is dropped if the name is taken.
    pub fn insert(&mut self, name: impl Into<String>, value: T) -> Insertion {
        use std::collections::hash_map::Entry;

        match self.entries.entry(name.into()) {
            Entry::Occupied(_) => Insertion::AlreadyExists,
            Entry::Vacant(slot) => {
                slot.insert(value);
                Insertion::Inserted
            }
        }
    }

    /// Swap the value under an existing name, returning the old one.
    pub fn replace(&mut self, name: &str, value: T) -> Option<T> {
        self.entries
            .get_mut(name)
            .map(|slot| std::mem::replace(slot, value))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.entries.get(name)
    }

    /// Lookup that turns absence into a `MissingResource` error.
    pub fn require(&self, name: &str) -> Result<&T, ComputeError> {
        self.entries.get(name).ok_or_else(|| self.missing(name))
    }

    pub fn remove(&mut self, name: &str) -> Option<T> {
        self.entries.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.values_mut()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn missing(&self, name: &str) -> ComputeError {
        ComputeError::MissingResource {
            kind: self.kind,
            name: name.to_string(),
        }
    }

    pub(crate) fn duplicate(&self, name: &str) -> ComputeError {
        ComputeError::DuplicateName {
            kind: self.kind,
            name: name.to_string(),
        }
    }
}
