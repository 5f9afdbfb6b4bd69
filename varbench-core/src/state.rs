//! Thread-safe variation assignment.
//!
//! `VariationState` is an explicit context object passed into the executor
//! and enhancer calls. It holds the active variation groups for a run and
//! hands out variations in rotation, serialized per group name. Replacing
//! the configuration is not safe concurrently with trial execution: set the
//! groups, then freeze.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Map;
use tracing::warn;

use crate::error::Error;
use crate::variation::{Combination, Variation, VariationGroup};

#[derive(Debug)]
struct GroupEntry {
    candidates: Vec<Variation>,
    counter: Mutex<u64>,
}

impl GroupEntry {
    fn new(candidates: Vec<Variation>) -> Self {
        Self {
            candidates,
            counter: Mutex::new(0),
        }
    }
}

#[derive(Debug, Default)]
pub struct VariationState {
    active: bool,
    /// Group names in declaration order.
    order: Vec<String>,
    groups: HashMap<String, GroupEntry>,
}

impl Clone for VariationState {
    fn clone(&self) -> Self {
        let groups = self
            .groups
            .iter()
            .map(|(name, entry)| {
                let counter = entry.counter.lock().map(|c| *c).unwrap_or_else(|e| {
                    warn!(group = %name, "variation counter lock poisoned, resetting");
                    *e.into_inner()
                });
                (
                    name.clone(),
                    GroupEntry {
                        candidates: entry.candidates.clone(),
                        counter: Mutex::new(counter),
                    },
                )
            })
            .collect();
        Self {
            active: self.active,
            order: self.order.clone(),
            groups,
        }
    }
}

impl VariationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether variation substitution is underway at all. When inactive,
    /// `next_variation` always returns `None` and callers fall back to their
    /// literal text.
    pub fn active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// Replaces the active configuration. Counters reset to zero.
    pub fn set_groups(&mut self, groups: Vec<VariationGroup>) {
        self.order = groups.iter().map(|g| g.name.clone()).collect();
        self.groups = groups
            .into_iter()
            .map(|g| (g.name, GroupEntry::new(g.candidates)))
            .collect();
    }

    /// Pins one variation per group named in `combination`, leaving other
    /// groups untouched. The executor calls this on a per-task clone.
    pub fn select_combination(&mut self, combination: &Combination) -> Result<(), Error> {
        for (name, value) in combination.iter() {
            let entry = GroupEntry::new(vec![Variation::from_value(value.clone())?]);
            if !self.groups.contains_key(name) {
                self.order.push(name.clone());
            }
            self.groups.insert(name.clone(), entry);
        }
        Ok(())
    }

    /// Returns the next variation for `name` in cyclic rotation.
    ///
    /// The counter read-increment is serialized by a per-name lock, so under
    /// concurrent callers no counter value is ever observed twice; which
    /// caller receives which value is decided by lock acquisition order only.
    pub fn next_variation(&self, name: &str) -> Option<Variation> {
        if !self.active {
            return None;
        }
        let entry = self.groups.get(name)?;
        if entry.candidates.is_empty() {
            return None;
        }
        let mut counter = match entry.counter.lock() {
            Ok(counter) => counter,
            Err(poisoned) => poisoned.into_inner(),
        };
        let index = (*counter % entry.candidates.len() as u64) as usize;
        *counter += 1;
        Some(entry.candidates[index].clone())
    }

    /// Full cross product of all groups' candidates, in group-declaration
    /// order. Empty if any group has no candidates.
    pub fn enumerate_combinations(&self) -> Vec<Combination> {
        let mut partials: Vec<Map<String, serde_json::Value>> = vec![Map::new()];
        for name in &self.order {
            let Some(entry) = self.groups.get(name) else {
                continue;
            };
            let mut next = Vec::with_capacity(partials.len() * entry.candidates.len());
            for partial in &partials {
                for candidate in &entry.candidates {
                    let mut extended = partial.clone();
                    extended.insert(name.clone(), candidate.instantiated_value.clone());
                    next.push(extended);
                }
            }
            partials = next;
        }
        if self.order.is_empty() {
            return Vec::new();
        }
        partials.into_iter().map(Combination::new).collect()
    }

    pub fn group_names(&self) -> &[String] {
        &self.order
    }
}
