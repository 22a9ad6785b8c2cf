//! Arena of document index generations.
//!
//! Each full reindex builds a new generation next to the current one and
//! publishes it with a single pointer swap. Requests pin the generation
//! they started on through a [`GenerationGuard`]; a superseded generation
//! is reclaimed only after its last guard is dropped.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use manual_assist_core::store::VectorIndex;

struct Slot {
    index: Arc<dyn VectorIndex>,
    readers: usize,
    retired: bool,
}

#[derive(Default)]
struct Arena {
    current: Option<u64>,
    next_id: u64,
    slots: BTreeMap<u64, Slot>,
}

fn lock(arena: &Mutex<Arena>) -> MutexGuard<'_, Arena> {
    arena.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of live document index generations.
#[derive(Clone, Default)]
pub struct IndexGenerations {
    arena: Arc<Mutex<Arena>>,
}

/// Pins one generation for the duration of a request.
pub struct GenerationGuard {
    id: u64,
    index: Arc<dyn VectorIndex>,
    arena: Arc<Mutex<Arena>>,
}

impl GenerationGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn index(&self) -> &dyn VectorIndex {
        self.index.as_ref()
    }
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        let mut arena = lock(&self.arena);
        if let Some(slot) = arena.slots.get_mut(&self.id) {
            slot.readers = slot.readers.saturating_sub(1);
        }
    }
}

impl IndexGenerations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an existing generation (e.g. loaded at startup) as current.
    pub fn install(&self, id: u64, index: Arc<dyn VectorIndex>) {
        let mut arena = lock(&self.arena);
        arena.next_id = arena.next_id.max(id + 1);
        Self::swap_in(&mut arena, id, index);
    }

    /// Reserve an ID for a generation about to be built.
    ///
    /// IDs are strictly increasing; `floor` lets callers skip IDs already
    /// used in persistent storage.
    pub fn begin_build(&self, floor: u64) -> u64 {
        let mut arena = lock(&self.arena);
        let id = arena.next_id.max(floor);
        arena.next_id = id + 1;
        id
    }

    /// Make a fully built generation current. Returns the superseded ID.
    pub fn publish(&self, id: u64, index: Arc<dyn VectorIndex>) -> Option<u64> {
        let mut arena = lock(&self.arena);
        Self::swap_in(&mut arena, id, index)
    }

    fn swap_in(arena: &mut Arena, id: u64, index: Arc<dyn VectorIndex>) -> Option<u64> {
        let previous = arena.current.replace(id);
        arena.slots.insert(
            id,
            Slot {
                index,
                readers: 0,
                retired: false,
            },
        );
        if let Some(prev) = previous.filter(|p| *p != id) {
            if let Some(slot) = arena.slots.get_mut(&prev) {
                slot.retired = true;
            }
            return Some(prev);
        }
        None
    }

    pub fn current_id(&self) -> Option<u64> {
        lock(&self.arena).current
    }

    /// Pin the current generation.
    pub fn snapshot(&self) -> Option<GenerationGuard> {
        let mut arena = lock(&self.arena);
        let id = arena.current?;
        let slot = arena.slots.get_mut(&id)?;
        slot.readers += 1;
        Some(GenerationGuard {
            id,
            index: slot.index.clone(),
            arena: self.arena.clone(),
        })
    }

    /// Remove and return retired generations that no request still pins.
    pub fn take_reclaimable(&self) -> Vec<(u64, Arc<dyn VectorIndex>)> {
        let mut arena = lock(&self.arena);
        let ids: Vec<u64> = arena
            .slots
            .iter()
            .filter(|(_, s)| s.retired && s.readers == 0)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| arena.slots.remove(&id).map(|s| (id, s.index)))
            .collect()
    }

    pub fn readers(&self, id: u64) -> usize {
        lock(&self.arena)
            .slots
            .get(&id)
            .map(|s| s.readers)
            .unwrap_or(0)
    }

    /// IDs of generations still held in the arena, oldest first.
    pub fn live_ids(&self) -> Vec<u64> {
        lock(&self.arena).slots.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manual_assist_core::models::ModelIdentity;
    use manual_assist_core::store::memory::InMemoryIndex;

    fn index() -> Arc<dyn VectorIndex> {
        Arc::new(InMemoryIndex::new(ModelIdentity::new("t", 2)))
    }

    #[test]
    fn test_snapshot_before_install_is_none() {
        let gens = IndexGenerations::new();
        assert!(gens.snapshot().is_none());
    }

    #[test]
    fn test_snapshot_pins_generation() {
        let gens = IndexGenerations::new();
        gens.install(1, index());
        let guard = gens.snapshot().unwrap();
        assert_eq!(guard.id(), 1);
        assert_eq!(gens.readers(1), 1);
        drop(guard);
        assert_eq!(gens.readers(1), 0);
    }

    #[test]
    fn test_publish_defers_reclaim_until_readers_leave() {
        let gens = IndexGenerations::new();
        gens.install(1, index());
        let old_reader = gens.snapshot().unwrap();

        let next = gens.begin_build(0);
        assert_eq!(next, 2);
        assert_eq!(gens.publish(next, index()), Some(1));
        assert_eq!(gens.current_id(), Some(2));

        // the in-flight reader still sees generation 1
        assert_eq!(old_reader.id(), 1);
        assert!(gens.take_reclaimable().is_empty());

        drop(old_reader);
        let reclaimed: Vec<u64> = gens.take_reclaimable().into_iter().map(|(id, _)| id).collect();
        assert_eq!(reclaimed, vec![1]);
        assert_eq!(gens.live_ids(), vec![2]);
    }

    #[test]
    fn test_begin_build_respects_floor() {
        let gens = IndexGenerations::new();
        assert_eq!(gens.begin_build(7), 7);
        assert_eq!(gens.begin_build(0), 8);
    }

    #[test]
    fn test_current_generation_never_reclaimed() {
        let gens = IndexGenerations::new();
        gens.install(3, index());
        assert!(gens.take_reclaimable().is_empty());
        assert_eq!(gens.live_ids(), vec![3]);
    }
}
