//! Connection registry - maps live connection identifiers to socket write halves.
//!
//! Shared by three task families:
//! - the acceptor inserts on accept
//! - ingress looks up the target of each command
//! - the egress task of a connection removes its own entry when it ends
//!
//! Backed by DashMap, so no lock is ever held across an await point.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

use crate::bridge::protocol::ConnId;

/// Write side of an accepted connection.
pub type PeerWriter = Arc<Mutex<OwnedWriteHalf>>;

pub struct ConnectionRegistry<C = PeerWriter> {
    conns: DashMap<ConnId, C>,
}

impl<C: Clone> ConnectionRegistry<C> {
    pub fn new() -> Self {
        Self {
            conns: DashMap::new(),
        }
    }

    /// Insert or replace. Returns the previous handle, if any.
    pub fn put(&self, id: ConnId, conn: C) -> Option<C> {
        self.conns.insert(id, conn)
    }

    /// Insert under `base`, or under the first vacant `base-N` when `base` is taken.
    ///
    /// Check and insert happen under the same shard lock, so two concurrent
    /// registrations never end up with the same identifier.
    pub fn register(&self, base: &ConnId, conn: C) -> ConnId {
        let mut candidate = base.clone();
        let mut n = 0;
        loop {
            match self.conns.entry(candidate) {
                Entry::Vacant(slot) => {
                    let id = slot.key().clone();
                    slot.insert(conn);
                    return id;
                }
                Entry::Occupied(_) => {
                    n += 1;
                    candidate = base.with_suffix(n);
                }
            }
        }
    }

    /// Returns a clone of the handle; the map itself is never borrowed past the call.
    pub fn get(&self, id: &ConnId) -> Option<C> {
        self.conns.get(id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: &ConnId) -> Option<C> {
        self.conns.remove(id).map(|(_, conn)| conn)
    }

    pub fn contains(&self, id: &ConnId) -> bool {
        self.conns.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

impl<C: Clone> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}
