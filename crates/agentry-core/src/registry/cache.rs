//! Bounded LRU of live agent instances.
//!
//! Entries remember which definition they were built from; a lookup only
//! hits when that definition is still the registered one (`Arc::ptr_eq`).
//! Stale entries are dropped on sight.
//!
//! `clear` starts a new generation. Builders read the generation before they
//! resolve tools and only insert if it has not moved, so an instance built
//! against replaced tool handles never lands after the clear.

use std::collections::HashMap;
use std::sync::Arc;

use agentry_state::AgentDefinition;

use crate::factory::AgentInstance;

struct Entry {
    instance: Arc<AgentInstance>,
    last_used: u64,
}

pub(crate) struct LruCache {
    capacity: usize,
    entries: HashMap<String, Entry>,
    clock: u64,
    generation: u64,
}

impl LruCache {
    /// `capacity == 0` disables caching.
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            clock: 0,
            generation: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Instance for `definition`, if one built from exactly it is cached.
    pub(crate) fn get(&mut self, definition: &Arc<AgentDefinition>) -> Option<Arc<AgentInstance>> {
        let now = self.tick();
        let name = definition.name.as_str();
        let entry = self.entries.get_mut(name)?;
        if Arc::ptr_eq(entry.instance.definition(), definition) {
            entry.last_used = now;
            return Some(entry.instance.clone());
        }
        self.entries.remove(name);
        None
    }

    /// Insert, evicting the least recently used entry when full.
    /// Returns the name of the evicted agent, if any.
    pub(crate) fn insert(&mut self, instance: Arc<AgentInstance>) -> Option<String> {
        if self.capacity == 0 {
            return None;
        }
        let now = self.tick();
        let name = instance.definition().name.clone();

        let mut evicted = None;
        if !self.entries.contains_key(&name) && self.entries.len() >= self.capacity {
            evicted = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(name, _)| name.clone());
            if let Some(victim) = &evicted {
                self.entries.remove(victim);
            }
        }

        self.entries.insert(
            name,
            Entry {
                instance,
                last_used: now,
            },
        );
        evicted
    }

    pub(crate) fn invalidate(&mut self, name: &str) -> usize {
        usize::from(self.entries.remove(name).is_some())
    }

    /// Drop every entry and start a new generation.
    pub(crate) fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        self.generation += 1;
        n
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
