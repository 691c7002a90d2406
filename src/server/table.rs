//! The connection table: every live connection and when it was accepted.
//!
//! Owned by the I/O thread, so no locking. The table is the single owner of
//! every [`Connection`]; the readiness set only ever holds the connection's
//! id, which is also the table key. Ids are monotonically increasing and
//! never reused, so a stale readiness event cannot alias a newer connection.

use crate::conn::Connection;
use crate::poll::Token;
use std::collections::HashMap;
use std::time::SystemTime;

/// A table slot: the connection plus its acceptance timestamp, which the
/// lame-connection reaper and the stats document read.
pub(crate) struct TableEntry {
    pub conn: Connection,
    pub accepted_at: SystemTime,
}

pub(crate) struct ConnTable {
    entries: HashMap<u64, TableEntry>,
    next_id: u64,
}

impl ConnTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: Token::FIRST_CONNECTION,
        }
    }

    /// Hands out the next connection id.
    pub fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, id: u64, conn: Connection, accepted_at: SystemTime) {
        self.entries.insert(id, TableEntry { conn, accepted_at });
    }

    pub fn remove(&mut self, id: u64) -> Option<TableEntry> {
        self.entries.remove(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut TableEntry> {
        self.entries.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &TableEntry)> {
        self.entries.iter()
    }

    /// Snapshot of the live ids, for passes that destroy while iterating.
    pub fn ids(&self) -> Vec<u64> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
