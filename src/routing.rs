// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The shared routing table: an ordered map from local port to a
//! protocol-specific forwarding entry. Both `TcpForwarder` and
//! `UdpForwarder` hold one of these behind a `parking_lot::Mutex`, consulted
//! by the control plane (`add_entry`/`remove_entry`) and read by the
//! accept/worker loop on each iteration.

use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Ordered by local port, not insertion order; iteration order therefore
/// doesn't reflect call history, which the design doesn't require.
pub struct RoutingTable<T> {
    entries: Mutex<BTreeMap<u16, T>>,
}

impl<T> RoutingTable<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Inserts `entry` under `local_port` unless one is already present, in
    /// which case this is a silent no-op: the duplicate-port call neither
    /// replaces the existing entry nor reports an error.
    ///
    /// Returns whether an entry was inserted.
    pub fn insert_if_absent(&self, local_port: u16, entry: T) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&local_port) {
            return false;
        }
        entries.insert(local_port, entry);
        true
    }

    /// Removes and returns the entry for `local_port`, if any.
    pub fn remove(&self, local_port: u16) -> Option<T> {
        self.entries.lock().remove(&local_port)
    }

    pub fn contains(&self, local_port: u16) -> bool {
        self.entries.lock().contains_key(&local_port)
    }

    pub fn get_cloned(&self, local_port: u16) -> Option<T>
    where
        T: Clone,
    {
        self.entries.lock().get(&local_port).cloned()
    }

    pub fn for_each(&self, mut f: impl FnMut(u16, &T)) {
        let entries = self.entries.lock();
        for (port, entry) in entries.iter() {
            f(*port, entry);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) -> Vec<T> {
        self.entries.lock().drain().map(|(_, entry)| entry).collect()
    }
}

impl<T> Default for RoutingTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_port_insert_is_a_silent_noop() {
        let table = RoutingTable::new();
        assert!(table.insert_if_absent(8080, "first"));
        assert!(!table.insert_if_absent(8080, "second"));
        assert_eq!(table.get_cloned(8080), Some("first"));
    }

    #[test]
    fn remove_then_rebind_succeeds() {
        let table = RoutingTable::new();
        assert!(table.insert_if_absent(9000, 1u32));
        assert_eq!(table.remove(9000), Some(1));
        assert!(table.insert_if_absent(9000, 2u32));
        assert_eq!(table.get_cloned(9000), Some(2));
    }
}
