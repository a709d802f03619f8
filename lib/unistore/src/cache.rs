//! Two-level result cache in front of point reads.
//!
//! L1 is a networked key/value service reached through `CacheClient`; L2 is
//! an optional per-table bounded in-process cache probed first. The cache is
//! a performance optimization, not a consistency mechanism: last writer for
//! a key wins.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::debug;

use crate::driver::Row;

/// The cache transport contract: a key/value service with TTL.
#[async_trait]
pub trait CacheClient: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>);
    async fn del(&self, keys: &[String]);
}

/// In-process stand-in for the networked cache, used when no transport is
/// configured and by tests.
#[derive(Default)]
pub struct LocalCacheClient {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl LocalCacheClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheClient for LocalCacheClient {
    async fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((_, Some(expires))) if *expires <= Instant::now() => {
                entries.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }

    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) {
        let expires = ttl.map(|t| Instant::now() + t);
        self.entries.lock().insert(key.to_string(), (value, expires));
    }

    async fn del(&self, keys: &[String]) {
        let mut entries = self.entries.lock();
        for key in keys {
            entries.remove(key);
        }
    }
}

/// Per-table L2 sizing.
#[derive(Debug, Clone, Copy)]
pub struct L2Config {
    pub capacity: u64,
    pub ttl: Duration,
}

/// Cache policy configuration.
#[derive(Clone)]
pub struct CacheConfig {
    /// Key prefix; keys are `prefix:table:key1:key2:...`.
    pub prefix: String,
    pub default_ttl: Duration,
    pub table_ttl: HashMap<String, Duration>,
    /// Tables with read-through caching enabled for point reads.
    pub tables: HashSet<String>,
    /// Tables with an L2 in-process cache enabled.
    pub l2_tables: HashMap<String, L2Config>,
    /// Tables whose invalidation completes before the mutating call returns.
    pub sync_tables: HashSet<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            prefix: "db".to_string(),
            default_ttl: Duration::from_secs(300),
            table_ttl: HashMap::new(),
            tables: HashSet::new(),
            l2_tables: HashMap::new(),
            sync_tables: HashSet::new(),
        }
    }
}

/// A secondary named cache key: table + name + derived column values.
#[derive(Debug, Clone)]
struct SecondaryKey {
    name: String,
    columns: Vec<String>,
}

pub struct TwoLevelCache {
    l1: Box<dyn CacheClient>,
    l2: RwLock<HashMap<String, moka::sync::Cache<String, String>>>,
    config: CacheConfig,
    secondary: RwLock<HashMap<String, Vec<SecondaryKey>>>,
}

impl TwoLevelCache {
    pub fn new(l1: Box<dyn CacheClient>, config: CacheConfig) -> Self {
        let l2 = config
            .l2_tables
            .iter()
            .map(|(table, cfg)| {
                let cache = moka::sync::Cache::builder()
                    .max_capacity(cfg.capacity)
                    .time_to_live(cfg.ttl)
                    .build();
                (table.clone(), cache)
            })
            .collect();
        TwoLevelCache {
            l1,
            l2: RwLock::new(l2),
            config,
            secondary: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Register a secondary named key for ad-hoc cached lookups; mutating
    /// ops delete it alongside the primary-key entry.
    pub fn register_secondary(
        &self,
        table: impl Into<String>,
        name: impl Into<String>,
        columns: Vec<String>,
    ) {
        self.secondary
            .write()
            .entry(table.into())
            .or_default()
            .push(SecondaryKey {
                name: name.into(),
                columns,
            });
    }

    /// Derive `prefix:table:key1:key2:...` from the row's key values.
    /// Absence of any key value yields no cache key at all.
    pub fn cache_key(&self, table: &str, row: &Row, keys: &[String]) -> Option<String> {
        if keys.is_empty() {
            return None;
        }
        let mut parts = vec![self.config.prefix.clone(), table.to_string()];
        for key in keys {
            parts.push(scalar(row.get(key))?);
        }
        Some(parts.join(":"))
    }

    pub fn ttl(&self, table: &str) -> Duration {
        self.config
            .table_ttl
            .get(table)
            .copied()
            .unwrap_or(self.config.default_ttl)
    }

    pub fn is_sync(&self, table: &str) -> bool {
        self.config.sync_tables.contains(table)
    }

    /// Probe L2 then L1; an L1 hit populates L2.
    pub async fn get(&self, table: &str, key: &str) -> Option<Row> {
        if let Some(l2) = self.l2.read().get(table) {
            if let Some(hit) = l2.get(key) {
                debug!(table, key, level = 2, "cache hit");
                return parse(&hit);
            }
        }
        let hit = self.l1.get(key).await?;
        debug!(table, key, level = 1, "cache hit");
        if let Some(l2) = self.l2.read().get(table) {
            l2.insert(key.to_string(), hit.clone());
        }
        parse(&hit)
    }

    /// Populate both levels after a read-through miss.
    pub async fn put(&self, table: &str, key: &str, row: &Row, ttl: Option<Duration>) {
        let Ok(serialized) = serde_json::to_string(row) else {
            return;
        };
        if let Some(l2) = self.l2.read().get(table) {
            l2.insert(key.to_string(), serialized.clone());
        }
        let ttl = ttl.unwrap_or_else(|| self.ttl(table));
        self.l1.put(key, serialized, Some(ttl)).await;
    }

    /// All cache keys a mutation of this row touches: the primary key entry
    /// plus every registered secondary key.
    pub fn keys_for(&self, table: &str, row: &Row, keys: &[String]) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(primary) = self.cache_key(table, row, keys) {
            out.push(primary);
        }
        if let Some(secondaries) = self.secondary.read().get(table) {
            for sec in secondaries {
                let mut parts = vec![
                    self.config.prefix.clone(),
                    table.to_string(),
                    sec.name.clone(),
                ];
                let mut complete = true;
                for column in &sec.columns {
                    match scalar(row.get(column)) {
                        Some(value) => parts.push(value),
                        None => {
                            complete = false;
                            break;
                        }
                    }
                }
                if complete {
                    out.push(parts.join(":"));
                }
            }
        }
        out
    }

    /// Delete the given keys from both levels.
    pub async fn invalidate(&self, table: &str, cache_keys: &[String]) {
        if cache_keys.is_empty() {
            return;
        }
        if let Some(l2) = self.l2.read().get(table) {
            for key in cache_keys {
                l2.invalidate(key);
            }
        }
        self.l1.del(cache_keys).await;
        debug!(table, count = cache_keys.len(), "cache invalidated");
    }
}

fn scalar(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    }
}

fn parse(serialized: &str) -> Option<Row> {
    serde_json::from_str::<Value>(serialized)
        .ok()
        .and_then(|v| match v {
            Value::Object(row) => Some(row),
            _ => None,
        })
}
