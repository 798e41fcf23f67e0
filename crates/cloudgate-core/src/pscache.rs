use crate::types::PreparedStatementInfo;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, error};

/// Ids assigned by both clusters to one prepared statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedEntry {
    origin_id: Bytes,
    target_id: Bytes,
    statement_info: PreparedStatementInfo,
}

impl PreparedEntry {
    pub fn new(origin_id: Bytes, target_id: Bytes, statement_info: PreparedStatementInfo) -> Self {
        Self {
            origin_id,
            target_id,
            statement_info,
        }
    }

    pub fn origin_id(&self) -> &Bytes {
        &self.origin_id
    }

    pub fn target_id(&self) -> &Bytes {
        &self.target_id
    }

    pub fn statement_info(&self) -> &PreparedStatementInfo {
        &self.statement_info
    }
}

impl fmt::Display for PreparedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PreparedEntry{{origin_id={}, target_id={}, info={:?}}}",
            hex::encode(&self.origin_id),
            hex::encode(&self.target_id),
            self.statement_info
        )
    }
}

#[derive(Debug, Default)]
struct CacheMaps {
    entries: HashMap<Bytes, PreparedEntry>,
    by_target: HashMap<Bytes, Bytes>,
}

/// Bidirectional origin/target prepared id store shared by every client
/// connection of the proxy.
///
/// Both maps sit behind a single lock so readers never observe one map
/// updated without the other.
#[derive(Debug, Default)]
pub struct PreparedStatementCache {
    maps: RwLock<CacheMaps>,
}

impl PreparedStatementCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the entry for `origin_id`. A reverse mapping left
    /// behind by a previous target id of the same origin id is removed.
    pub fn store(&self, origin_id: Bytes, target_id: Bytes, statement_info: PreparedStatementInfo) {
        let entry = PreparedEntry::new(origin_id.clone(), target_id.clone(), statement_info);
        debug!("storing prepared statement cache entry: {entry}");

        let mut maps = self.maps.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = maps.entries.insert(origin_id.clone(), entry) {
            if previous.target_id != target_id
                && maps.by_target.get(&previous.target_id) == Some(&origin_id)
            {
                maps.by_target.remove(&previous.target_id);
            }
        }
        maps.by_target.insert(target_id, origin_id);
    }

    pub fn get(&self, origin_id: &[u8]) -> Option<PreparedEntry> {
        let maps = self.maps.read().unwrap_or_else(PoisonError::into_inner);
        maps.entries.get(origin_id).cloned()
    }

    pub fn get_by_target_prepared_id(&self, target_id: &[u8]) -> Option<PreparedEntry> {
        let maps = self.maps.read().unwrap_or_else(PoisonError::into_inner);
        let origin_id = maps.by_target.get(target_id)?;
        match maps.entries.get(origin_id) {
            Some(entry) if entry.target_id.as_ref() == target_id => Some(entry.clone()),
            Some(entry) => {
                error!(
                    origin_id = %hex::encode(origin_id),
                    target_id = %hex::encode(target_id),
                    stored_target_id = %hex::encode(&entry.target_id),
                    "reverse index points at an entry with a different target id, this is most likely a bug"
                );
                None
            }
            None => {
                error!(
                    origin_id = %hex::encode(origin_id),
                    target_id = %hex::encode(target_id),
                    "reverse index names an origin id missing from the cache, this is most likely a bug"
                );
                None
            }
        }
    }

    pub fn size(&self) -> usize {
        self.maps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    #[cfg(test)]
    pub(crate) fn insert_reverse_only(&self, target_id: Bytes, origin_id: Bytes) {
        self.maps
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .by_target
            .insert(target_id, origin_id);
    }
}
