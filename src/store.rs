use crate::error::{Error, Result};
use crate::utils::current_timestamp;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Expiring key-value operations shared by the admission gate and the audit
/// log. The store is the sole synchronization point between concurrent
/// requests; callers hold no locks of their own.
pub trait KvStore: Send + Sync {
    /// Current counter value, or None when absent or expired.
    fn counter(&self, key: &str) -> Option<u64>;
    /// Create or replace a counter with a fresh TTL.
    fn set_counter(&self, key: &str, value: u64, ttl: Duration);
    /// Increment without touching the existing expiry, so a fixed window
    /// stays anchored to its first request. An absent or expired counter is
    /// recreated at 1 with `create_ttl`, covering the race where the entry
    /// expires between the caller's read and the increment.
    fn increment(&self, key: &str, create_ttl: Duration) -> u64;
    fn remove_counter(&self, key: &str);

    fn put_marker(&self, key: &str, value: serde_json::Value, ttl: Duration) -> Result<()>;
    fn has_marker(&self, key: &str) -> Result<bool>;
    fn remove_marker(&self, key: &str) -> Result<()>;

    /// Push to the head of a bounded list, evicting from the tail past
    /// `cap`, and refresh the list TTL.
    fn list_push_front(&self, key: &str, value: String, cap: usize, ttl: Duration) -> Result<()>;
    /// Inclusive range from the head, Redis LRANGE style.
    fn list_range(&self, key: &str, start: usize, stop: usize) -> Result<Vec<String>>;
    fn list_len(&self, key: &str) -> Result<usize>;

    fn score_add(&self, set: &str, member: &str, score: i64) -> Result<()>;
    /// Members with `min <= score <= max`, highest score first, at most
    /// `limit` rows.
    fn score_rev_range(&self, set: &str, max: i64, min: i64, limit: usize)
        -> Result<Vec<(String, i64)>>;
}

#[derive(Debug, Clone)]
struct CounterEntry {
    value: u64,
    expires_at: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MarkerRecord {
    expires_at: Option<i64>,
    value: serde_json::Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ListRecord {
    expires_at: Option<i64>,
    items: Vec<String>,
}

const MARKERS_TREE: &[u8] = b"markers";
const LISTS_TREE: &[u8] = b"lists";

/// Store backing: sled for data that must survive restarts (blacklist
/// markers, audit lists, activity scores), an in-process map for the
/// short-lived counters.
#[derive(Clone)]
pub struct Store {
    db: sled::Db,
    counters: std::sync::Arc<DashMap<String, CounterEntry>>,
}

impl Store {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)
            .map_err(|e| Error::Store(format!("Failed to open database: {}", e)))?;

        Ok(Self {
            db,
            counters: std::sync::Arc::new(DashMap::new()),
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| Error::Store(format!("Failed to flush database: {}", e)))?;
        Ok(())
    }

    fn tree(&self, name: &[u8]) -> Result<sled::Tree> {
        self.db
            .open_tree(name)
            .map_err(|e| Error::Store(format!("Failed to open tree: {}", e)))
    }

    fn scores_tree(&self, set: &str) -> Result<sled::Tree> {
        self.tree(format!("scores_{}", set).as_bytes())
    }

    fn expired(expires_at: Option<i64>) -> bool {
        matches!(expires_at, Some(at) if at <= current_timestamp())
    }

    fn read_list(tree: &sled::Tree, key: &str) -> Result<Option<ListRecord>> {
        let Some(raw) = tree
            .get(key.as_bytes())
            .map_err(|e| Error::Store(format!("Failed to read list: {}", e)))?
        else {
            return Ok(None);
        };

        let record: ListRecord = serde_json::from_slice(&raw)
            .map_err(|e| Error::Store(format!("Failed to decode list: {}", e)))?;

        if Self::expired(record.expires_at) {
            return Ok(None);
        }

        Ok(Some(record))
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

impl KvStore for Store {
    fn counter(&self, key: &str) -> Option<u64> {
        if let Some(entry) = self.counters.get(key) {
            if !Self::expired(entry.expires_at) {
                return Some(entry.value);
            }
        } else {
            return None;
        }
        self.counters.remove(key);
        None
    }

    fn set_counter(&self, key: &str, value: u64, ttl: Duration) {
        self.counters.insert(
            key.to_string(),
            CounterEntry {
                value,
                expires_at: Some(current_timestamp() + ttl.as_secs() as i64),
            },
        );
    }

    fn increment(&self, key: &str, create_ttl: Duration) -> u64 {
        let fresh_expiry = Some(current_timestamp() + create_ttl.as_secs() as i64);
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert(CounterEntry {
                value: 0,
                expires_at: fresh_expiry,
            });
        if Self::expired(entry.expires_at) {
            entry.value = 0;
            entry.expires_at = fresh_expiry;
        }
        entry.value += 1;
        entry.value
    }

    fn remove_counter(&self, key: &str) {
        self.counters.remove(key);
    }

    fn put_marker(&self, key: &str, value: serde_json::Value, ttl: Duration) -> Result<()> {
        let record = MarkerRecord {
            expires_at: Some(current_timestamp() + ttl.as_secs() as i64),
            value,
        };
        let raw = serde_json::to_vec(&record)
            .map_err(|e| Error::Store(format!("Failed to encode marker: {}", e)))?;

        self.tree(MARKERS_TREE)?
            .insert(key.as_bytes(), raw)
            .map_err(|e| Error::Store(format!("Failed to write marker: {}", e)))?;
        Ok(())
    }

    fn has_marker(&self, key: &str) -> Result<bool> {
        let tree = self.tree(MARKERS_TREE)?;
        let Some(raw) = tree
            .get(key.as_bytes())
            .map_err(|e| Error::Store(format!("Failed to read marker: {}", e)))?
        else {
            return Ok(false);
        };

        let record: MarkerRecord = serde_json::from_slice(&raw)
            .map_err(|e| Error::Store(format!("Failed to decode marker: {}", e)))?;

        if Self::expired(record.expires_at) {
            tree.remove(key.as_bytes())
                .map_err(|e| Error::Store(format!("Failed to drop marker: {}", e)))?;
            return Ok(false);
        }

        Ok(true)
    }

    fn remove_marker(&self, key: &str) -> Result<()> {
        self.tree(MARKERS_TREE)?
            .remove(key.as_bytes())
            .map_err(|e| Error::Store(format!("Failed to remove marker: {}", e)))?;
        Ok(())
    }

    fn list_push_front(&self, key: &str, value: String, cap: usize, ttl: Duration) -> Result<()> {
        let tree = self.tree(LISTS_TREE)?;
        let expires_at = Some(current_timestamp() + ttl.as_secs() as i64);

        // Compare-and-swap loop so concurrent pushes to the same key never
        // lose an entry; expired or undecodable records start fresh
        tree.update_and_fetch(key.as_bytes(), |old| {
            let mut record = old
                .and_then(|raw| serde_json::from_slice::<ListRecord>(raw).ok())
                .filter(|r| !Self::expired(r.expires_at))
                .unwrap_or_default();

            record.items.insert(0, value.clone());
            record.items.truncate(cap);
            record.expires_at = expires_at;
            serde_json::to_vec(&record).ok()
        })
        .map_err(|e| Error::Store(format!("Failed to write list: {}", e)))?;
        Ok(())
    }

    fn list_range(&self, key: &str, start: usize, stop: usize) -> Result<Vec<String>> {
        let tree = self.tree(LISTS_TREE)?;
        let Some(record) = Self::read_list(&tree, key)? else {
            return Ok(Vec::new());
        };

        if start >= record.items.len() {
            return Ok(Vec::new());
        }
        let stop = stop.min(record.items.len() - 1);
        Ok(record.items[start..=stop].to_vec())
    }

    fn list_len(&self, key: &str) -> Result<usize> {
        let tree = self.tree(LISTS_TREE)?;
        Ok(Self::read_list(&tree, key)?.map_or(0, |r| r.items.len()))
    }

    fn score_add(&self, set: &str, member: &str, score: i64) -> Result<()> {
        self.scores_tree(set)?
            .insert(member.as_bytes(), &score.to_be_bytes())
            .map_err(|e| Error::Store(format!("Failed to write score: {}", e)))?;
        Ok(())
    }

    fn score_rev_range(
        &self,
        set: &str,
        max: i64,
        min: i64,
        limit: usize,
    ) -> Result<Vec<(String, i64)>> {
        let tree = self.scores_tree(set)?;
        let mut rows = Vec::new();

        for item in tree.iter() {
            let (key, value) = item
                .map_err(|e| Error::Store(format!("Failed to iterate scores: {}", e)))?;
            let member = String::from_utf8_lossy(&key).to_string();
            let bytes: [u8; 8] = value
                .as_ref()
                .try_into()
                .map_err(|_| Error::Store("Malformed score value".to_string()))?;
            let score = i64::from_be_bytes(bytes);
            if score >= min && score <= max {
                rows.push((member, score));
            }
        }

        rows.sort_by(|a, b| b.1.cmp(&a.1));
        rows.truncate(limit);
        Ok(rows)
    }
}
