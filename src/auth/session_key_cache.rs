use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::auth::checksum::SessionKey;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CacheEntry {
    pub session_key: SessionKey,
    pub principal: String,
    /// seconds since the epoch
    pub expires: u64,
}

/// Session keys of tickets that were verified before, so that further notices presenting the
///  same ticket skip the expensive ticket verification.
///
/// NB: Entries are purged only by [SessionKeyCache::sweep], never on access.
pub struct SessionKeyCache {
    entries: FxHashMap<Bytes, CacheEntry>,
    max_entries: usize,
}

impl SessionKeyCache {
    pub fn new(max_entries: usize) -> SessionKeyCache {
        SessionKeyCache {
            entries: Default::default(),
            max_entries,
        }
    }

    pub fn get(&self, ticket: &[u8]) -> Option<&CacheEntry> {
        self.entries.get(ticket)
    }

    /// Fails if the cache is full. Replacing an existing entry always works.
    pub fn insert(&mut self, ticket: Bytes, entry: CacheEntry) -> anyhow::Result<()> {
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&ticket) {
            bail!("session key cache is full ({} entries)", self.max_entries);
        }
        self.entries.insert(ticket, entry);
        Ok(())
    }

    /// evicts all entries that expired at `now`, returning the number of evicted entries
    pub fn sweep(&mut self, now: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires > now);
        let evicted = before - self.entries.len();
        debug!(evicted, remaining=self.entries.len(), "swept session key cache");
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
