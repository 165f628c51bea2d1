use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use warren_internals::{QueueName, WarrenError};

type Patterns = BTreeMap<String, BTreeSet<QueueName>>;

/// Bindings of a single exchange, indexed by pattern.
///
/// Identical bindings collapse into one entry, so binding twice is a no-op.
/// Lookups return sets of queue names, which is what gives a publish its
/// at-most-once-per-queue delivery when several patterns match.
#[derive(Default)]
pub struct BindingTable {
    patterns: RwLock<Patterns>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Patterns>, WarrenError> {
        self.patterns
            .read()
            .map_err(|_| WarrenError::InternalError("Binding table lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Patterns>, WarrenError> {
        self.patterns
            .write()
            .map_err(|_| WarrenError::InternalError("Binding table lock poisoned".to_string()))
    }

    /// Returns `true` if the binding did not exist yet.
    pub fn bind(&self, queue: &str, pattern: &str) -> Result<bool, WarrenError> {
        Ok(self
            .write()?
            .entry(pattern.to_string())
            .or_default()
            .insert(queue.to_string()))
    }

    /// Returns `true` if the binding existed.
    pub fn unbind(&self, queue: &str, pattern: &str) -> Result<bool, WarrenError> {
        let mut patterns = self.write()?;
        let Some(queues) = patterns.get_mut(pattern) else {
            return Ok(false);
        };
        let removed = queues.remove(queue);
        if queues.is_empty() {
            patterns.remove(pattern);
        }
        Ok(removed)
    }

    /// Drops every binding of `queue`, returning the patterns it was bound with.
    pub fn remove_queue(&self, queue: &str) -> Result<Vec<String>, WarrenError> {
        let mut patterns = self.write()?;
        let mut removed = Vec::new();
        patterns.retain(|pattern, queues| {
            if queues.remove(queue) {
                removed.push(pattern.clone());
            }
            !queues.is_empty()
        });
        Ok(removed)
    }

    pub fn contains(&self, queue: &str, pattern: &str) -> Result<bool, WarrenError> {
        Ok(self
            .read()?
            .get(pattern)
            .is_some_and(|queues| queues.contains(queue)))
    }

    /// Every `(queue, pattern)` pair, ordered by pattern then queue.
    pub fn bindings(&self) -> Result<Vec<(QueueName, String)>, WarrenError> {
        Ok(self
            .read()?
            .iter()
            .flat_map(|(pattern, queues)| queues.iter().map(|q| (q.clone(), pattern.clone())))
            .collect())
    }

    /// Every bound queue regardless of pattern.
    pub fn all_queues(&self) -> Result<BTreeSet<QueueName>, WarrenError> {
        Ok(self.read()?.values().flatten().cloned().collect())
    }

    /// Queues bound with exactly `pattern`.
    pub fn queues_for_pattern(&self, pattern: &str) -> Result<BTreeSet<QueueName>, WarrenError> {
        Ok(self.read()?.get(pattern).cloned().unwrap_or_default())
    }

    /// Queues with at least one pattern accepted by `matches`.
    pub fn queues_matching(
        &self,
        matches: impl Fn(&str) -> bool,
    ) -> Result<BTreeSet<QueueName>, WarrenError> {
        Ok(self
            .read()?
            .iter()
            .filter(|(pattern, _)| matches(pattern))
            .flat_map(|(_, queues)| queues.iter().cloned())
            .collect())
    }

    pub fn len(&self) -> usize {
        self.read()
            .map(|p| p.values().map(BTreeSet::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
