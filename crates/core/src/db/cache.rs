//! Optional query-result cache.
//!
//! Byte-hash keyed on the statement's canonical form, invalidated per table
//! on any DML touching that table and flushed wholesale on rollback. Only
//! auto-commit SELECTs consult it.

use ahash::RandomState;
use micadb_types::Row;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};

#[derive(Clone)]
pub struct CachedResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

pub struct QueryCache {
    hasher: RandomState,
    entries: HashMap<u64, CachedResult>,
    by_table: HashMap<String, Vec<u64>>,
    capacity: usize,
}

impl QueryCache {
    pub fn new(capacity: usize) -> Self {
        QueryCache {
            hasher: RandomState::new(),
            entries: HashMap::new(),
            by_table: HashMap::new(),
            capacity,
        }
    }

    pub fn key(&self, text: &str) -> u64 {
        let mut h = self.hasher.build_hasher();
        text.as_bytes().hash(&mut h);
        h.finish()
    }

    pub fn get(&self, key: u64) -> Option<&CachedResult> {
        self.entries.get(&key)
    }

    /// Store a result together with the tables it read from.
    pub fn put(&mut self, key: u64, tables: &[String], result: CachedResult) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            // Full: drop everything rather than tracking recency.
            self.clear();
        }
        for t in tables {
            self.by_table.entry(t.to_ascii_lowercase()).or_default().push(key);
        }
        self.entries.insert(key, result);
    }

    pub fn invalidate_table(&mut self, table: &str) {
        if let Some(keys) = self.by_table.remove(&table.to_ascii_lowercase()) {
            for k in keys {
                self.entries.remove(&k);
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_table.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use micadb_types::Value;

    fn result(n: i64) -> CachedResult {
        CachedResult {
            columns: vec!["x".into()],
            rows: vec![vec![Value::int(n)]],
        }
    }

    #[test]
    fn hit_and_per_table_invalidation() {
        let mut cache = QueryCache::new(16);
        let k1 = cache.key("SELECT * FROM a");
        let k2 = cache.key("SELECT * FROM b");
        cache.put(k1, &["a".to_string()], result(1));
        cache.put(k2, &["b".to_string()], result(2));

        assert!(cache.get(k1).is_some());
        cache.invalidate_table("A");
        assert!(cache.get(k1).is_none());
        assert!(cache.get(k2).is_some());
    }

    #[test]
    fn distinct_statements_get_distinct_keys() {
        let cache = QueryCache::new(4);
        assert_ne!(cache.key("SELECT 1"), cache.key("SELECT 2"));
    }
}
