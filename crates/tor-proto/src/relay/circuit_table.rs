//! Lookup table mapping `(channel, circuit-id)` to a relay circuit entry.
//!
//! A relay keeps exactly one live circuit per `(channel, circuit-id)` pair.
//! Unlike [`crate::channel::circmap`], which maps circuit IDs to circuits
//! *within* a single channel's reactor, this table is the process-wide index
//! used by [`crate::relay::dispatch`] to find the circuit a newly arrived
//! cell belongs to, and by the memory governor and statistics code to
//! iterate over every live relay circuit regardless of which channel it
//! sits on.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use tor_cell::chancell::CircId;

use crate::channel::UniqId as ChannelUniqId;

/// Key identifying a circuit endpoint: the channel it arrived on, and its
/// circuit ID on that channel.
///
/// A relay circuit has two such keys (one per half-circuit); the table
/// holds a separate entry, pointing at the same circuit, for each.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) struct CircuitKey {
    /// The channel the circuit-id is scoped to.
    channel: ChannelUniqId,
    /// The circuit-id on that channel.
    circ_id: CircId,
}

impl CircuitKey {
    /// Construct a new lookup key.
    pub(crate) fn new(channel: ChannelUniqId, circ_id: CircId) -> Self {
        Self { channel, circ_id }
    }

    /// The circuit-id half of this key.
    pub(crate) fn circ_id(&self) -> CircId {
        self.circ_id
    }

    /// The channel half of this key.
    pub(crate) fn channel(&self) -> ChannelUniqId {
        self.channel
    }
}

/// A two-way lookup of relay circuits by `(channel, circuit-id)`.
///
/// `T` is the handle type used to reach a circuit's reactor (a control
/// sender, typically); this table only does bookkeeping; it never itself
/// routes a cell.
pub(crate) struct CircuitTable<T> {
    /// The actual map.
    ///
    /// Each live circuit is reachable under one entry per half-circuit it
    /// owns: a relay circuit has a `p_*` entry and an `n_*` entry, both
    /// pointing at the same handle.
    entries: HashMap<CircuitKey, T>,
}

impl<T> Default for CircuitTable<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> CircuitTable<T> {
    /// Create an empty table.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert a new entry for `key`.
    ///
    /// Fails (returning the handle that was not inserted) if the key is
    /// already occupied: per spec, at most one live circuit entry may exist
    /// for any `(channel, circuit-id)` pair.
    pub(crate) fn insert(&mut self, key: CircuitKey, handle: T) -> Result<(), T> {
        match self.entries.entry(key) {
            Entry::Occupied(_) => Err(handle),
            Entry::Vacant(v) => {
                v.insert(handle);
                Ok(())
            }
        }
    }

    /// Look up the circuit handle for `key`.
    pub(crate) fn get(&self, key: &CircuitKey) -> Option<&T> {
        self.entries.get(key)
    }

    /// Look up a mutable reference to the circuit handle for `key`.
    pub(crate) fn get_mut(&mut self, key: &CircuitKey) -> Option<&mut T> {
        self.entries.get_mut(key)
    }

    /// Remove and return the entry for `key`, if any.
    ///
    /// Used when a half-circuit is detached on `DESTROY` (see
    /// [`crate::relay::dispatch`]): the `p`- or `n`-side key is removed
    /// from the table before the circuit itself is marked for close, so
    /// that no cell arriving afterwards can be routed to it.
    pub(crate) fn remove(&mut self, key: &CircuitKey) -> Option<T> {
        self.entries.remove(key)
    }

    /// True if `key` is already in use.
    pub(crate) fn contains(&self, key: &CircuitKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Iterate over every live entry, for statistics and memory-governor
    /// sweeps.
    ///
    /// Because each circuit may be reachable under two keys, this can
    /// yield the same circuit's handle twice; callers that need distinct
    /// circuits (e.g. the OOM victim search) must dedupe on something
    /// circuit-identifying in `T`.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (&CircuitKey, &T)> {
        self.entries.iter()
    }

    /// Number of table entries (not distinct circuits; see [`Self::iter`]).
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn key(chan: ChannelUniqId, id: u32) -> CircuitKey {
        CircuitKey::new(chan, CircId::new(id).unwrap())
    }

    #[test]
    fn insert_and_lookup() {
        let mut t: CircuitTable<&'static str> = CircuitTable::new();
        let k = key(ChannelUniqId::new(), 42);
        assert!(t.insert(k, "circuit-a").is_ok());
        assert_eq!(t.get(&k), Some(&"circuit-a"));
    }

    #[test]
    fn duplicate_insert_fails() {
        let mut t: CircuitTable<&'static str> = CircuitTable::new();
        let k = key(ChannelUniqId::new(), 42);
        t.insert(k, "circuit-a").unwrap();
        assert_eq!(t.insert(k, "circuit-b"), Err("circuit-b"));
        // the original entry is untouched
        assert_eq!(t.get(&k), Some(&"circuit-a"));
    }

    #[test]
    fn remove_detaches_half_circuit() {
        let mut t: CircuitTable<&'static str> = CircuitTable::new();
        let chan_p = ChannelUniqId::new();
        let chan_n = ChannelUniqId::new();
        let p = key(chan_p, 10);
        let n = key(chan_n, 11);
        t.insert(p, "circuit-a").unwrap();
        t.insert(n, "circuit-a").unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(t.remove(&p), Some("circuit-a"));
        assert!(!t.contains(&p));
        // the other half is unaffected until it, too, is explicitly removed
        assert!(t.contains(&n));
    }
}
