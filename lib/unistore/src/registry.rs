//! Pool registry and table routing.
//!
//! Maps table names and explicit overrides to a concrete backend pool.
//! Unconfigured backends degrade to the no-op "none" pool, which returns
//! empty results and never errors.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::driver::{Connection, Driver, Request};
use crate::error::DbError;
use crate::options::QueryOptions;
use crate::pool::{PoolOptions, ResourcePool};
use crate::schema::Table;

pub const NONE_POOL: &str = "none";

/// Backend policy flags and defaults, per pool.
#[derive(Debug, Clone, Default)]
pub struct ConfigOptions {
    /// Coerce values to column types during preparation.
    pub strict_types: bool,
    /// Backend has no native JSON type; drivers serialize json columns.
    pub no_json: bool,
    /// Backend-wide default read/write capacity, units per second.
    pub default_read_capacity: f64,
    pub default_write_capacity: f64,
}

/// Per-table read/write throughput limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableCapacity {
    pub read: f64,
    pub write: f64,
}

/// Configuration for one named pool.
#[derive(Debug, Clone, Default)]
pub struct PoolConfig {
    pub url: String,
    pub options: PoolOptions,
    pub config: ConfigOptions,
    pub capacity: HashMap<String, TableCapacity>,
}

/// A named, configured connection manager bound to one backend.
pub struct DbPool {
    pub name: String,
    pub driver: Arc<dyn Driver>,
    pub pool: Arc<ResourcePool>,
    config: RwLock<PoolConfig>,
    /// Per-table metadata introspected from the live backend.
    meta: RwLock<HashMap<String, Table>>,
    reaper: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DbPool {
    pub fn new(name: impl Into<String>, driver: Arc<dyn Driver>, config: PoolConfig) -> Arc<Self> {
        let pool = Arc::new(ResourcePool::new(Arc::clone(&driver), config.options.clone()));
        Arc::new(DbPool {
            name: name.into(),
            driver,
            pool,
            config: RwLock::new(config),
            meta: RwLock::new(HashMap::new()),
            reaper: parking_lot::Mutex::new(None),
        })
    }

    pub fn config(&self) -> PoolConfig {
        self.config.read().clone()
    }

    pub fn url(&self) -> String {
        self.config.read().url.clone()
    }

    /// Per-table capacity, falling back to the backend-wide default.
    pub fn table_capacity(&self, table: &str) -> TableCapacity {
        let config = self.config.read();
        config.capacity.get(table).copied().unwrap_or(TableCapacity {
            read: config.config.default_read_capacity,
            write: config.config.default_write_capacity,
        })
    }

    pub fn strict_types(&self) -> bool {
        self.config.read().config.strict_types
    }

    /// Cached introspected metadata for a table, if any.
    pub fn table_meta(&self, table: &str) -> Option<Table> {
        self.meta.read().get(table).cloned()
    }

    /// Introspect the live backend and cache per-table metadata.
    pub async fn cache_columns(&self) -> Result<(), DbError> {
        let mut conn = self.pool.acquire().await?;
        let result = self.driver.cache_columns(conn.as_mut()).await;
        self.pool.release(conn).await;
        let tables = result?;
        if !tables.is_empty() {
            *self.meta.write() = tables;
        }
        Ok(())
    }

    pub fn start_reaper(self: &Arc<Self>) {
        let handle = self.pool.start_reaper();
        if let Some(old) = self.reaper.lock().replace(handle) {
            old.abort();
        }
    }

    pub async fn shutdown(&self, deadline: Option<std::time::Duration>) {
        if let Some(reaper) = self.reaper.lock().take() {
            reaper.abort();
        }
        self.pool.shutdown(deadline).await;
    }
}

/// Silent empty backend for unconfigured pools.
struct NoneDriver;

struct NoneConnection;

impl Connection for NoneConnection {
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[async_trait]
impl Driver for NoneDriver {
    fn kind(&self) -> &'static str {
        "none"
    }

    async fn open(&self) -> Result<Box<dyn Connection>, DbError> {
        Ok(Box::new(NoneConnection))
    }

    async fn close(&self, _conn: Box<dyn Connection>) {}

    async fn query(&self, _conn: &mut dyn Connection, req: &mut Request) -> Result<(), DbError> {
        req.rows.clear();
        Ok(())
    }
}

/// Registry of configured pools plus the table router.
pub struct PoolRegistry {
    pools: RwLock<HashMap<String, Arc<DbPool>>>,
    default_pool: RwLock<String>,
    /// Table-name patterns pinned to a named pool, checked before overrides.
    restricted: RwLock<Vec<(String, String)>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        let registry = PoolRegistry {
            pools: RwLock::new(HashMap::new()),
            default_pool: RwLock::new(NONE_POOL.to_string()),
            restricted: RwLock::new(Vec::new()),
        };
        let none = DbPool::new(NONE_POOL, Arc::new(NoneDriver), PoolConfig::default());
        registry.pools.write().insert(NONE_POOL.to_string(), none);
        registry
    }

    pub fn set_default(&self, name: impl Into<String>) {
        *self.default_pool.write() = name.into();
    }

    /// Pin tables matching `pattern` ('*' wildcard) to a named pool,
    /// regardless of caller overrides.
    pub fn restrict(&self, pattern: impl Into<String>, pool: impl Into<String>) {
        self.restricted.write().push((pattern.into(), pool.into()));
    }

    /// Install or reconfigure a pool. Reconfiguring with the same backend
    /// URL preserves open connections; a changed URL installs the new pool
    /// first and retires the old one afterwards.
    pub fn configure(
        &self,
        name: impl Into<String>,
        driver: Arc<dyn Driver>,
        config: PoolConfig,
    ) -> Arc<DbPool> {
        let name = name.into();
        let (pool, retired) = {
            let mut pools = self.pools.write();
            if let Some(existing) = pools.get(&name) {
                if existing.url() == config.url {
                    *existing.config.write() = config;
                    return Arc::clone(existing);
                }
            }
            let pool = DbPool::new(name.clone(), driver, config);
            let old = pools.insert(name.clone(), Arc::clone(&pool));
            (pool, old)
        };
        if let Some(old) = retired {
            warn!(pool = %name, "retiring pool after backend URL change");
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { old.shutdown(None).await });
            }
        }
        pool
    }

    pub fn pool_by_name(&self, name: &str) -> Arc<DbPool> {
        let pools = self.pools.read();
        match pools.get(name) {
            Some(pool) => Arc::clone(pool),
            None => {
                debug!(pool = %name, "unknown pool, routing to none");
                Arc::clone(&pools[NONE_POOL])
            }
        }
    }

    /// Resolve the pool for a table: restricted patterns first, then the
    /// caller's override, then the process default, falling back to "none".
    pub fn get_pool(&self, table: &str, options: &QueryOptions) -> Arc<DbPool> {
        for (pattern, pool) in self.restricted.read().iter() {
            if glob_match(pattern, table) {
                return self.pool_by_name(pool);
            }
        }
        if let Some(name) = &options.pool {
            return self.pool_by_name(name);
        }
        let default = self.default_pool.read().clone();
        self.pool_by_name(&default)
    }

    pub fn pool_names(&self) -> Vec<String> {
        self.pools.read().keys().cloned().collect()
    }

    pub async fn shutdown(&self, deadline: Option<std::time::Duration>) {
        let pools: Vec<Arc<DbPool>> = self.pools.read().values().cloned().collect();
        for pool in pools {
            pool.shutdown(deadline).await;
        }
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal '*' wildcard matcher for table routing patterns.
fn glob_match(pattern: &str, text: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == text,
        Some((head, tail)) => {
            if !text.starts_with(head) {
                return false;
            }
            let rest = &text[head.len()..];
            if tail.is_empty() {
                true
            } else {
                // Try every suffix position for the remainder.
                (0..=rest.len()).any(|i| glob_match(tail, &rest[i..]))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matching() {
        assert!(glob_match("users", "users"));
        assert!(glob_match("bk_*", "bk_messages"));
        assert!(glob_match("*_log", "audit_log"));
        assert!(glob_match("*", "anything"));
        assert!(!glob_match("bk_*", "messages"));
    }

    #[tokio::test]
    async fn router_resolution_order() {
        let registry = PoolRegistry::new();
        let primary = registry.configure(
            "primary",
            Arc::new(NoneDriver),
            PoolConfig {
                url: "memory://primary".into(),
                ..PoolConfig::default()
            },
        );
        let logs = registry.configure(
            "logs",
            Arc::new(NoneDriver),
            PoolConfig {
                url: "memory://logs".into(),
                ..PoolConfig::default()
            },
        );
        registry.set_default("primary");
        registry.restrict("audit_*", "logs");

        let opts = QueryOptions::new();
        assert_eq!(registry.get_pool("users", &opts).name, primary.name);
        // Restricted pattern wins even over an explicit override
        let opts = QueryOptions::new().pool("primary");
        assert_eq!(registry.get_pool("audit_log", &opts).name, logs.name);
        // Unknown override degrades to none
        let opts = QueryOptions::new().pool("missing");
        assert_eq!(registry.get_pool("users", &opts).name, NONE_POOL);
    }

    #[tokio::test]
    async fn reconfigure_same_url_keeps_pool() {
        let registry = PoolRegistry::new();
        let config = PoolConfig {
            url: "memory://a".into(),
            ..PoolConfig::default()
        };
        let first = registry.configure("main", Arc::new(NoneDriver), config.clone());
        let second = registry.configure("main", Arc::new(NoneDriver), config);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn none_pool_returns_empty_results() {
        let registry = PoolRegistry::new();
        let pool = registry.pool_by_name("not-configured");
        assert_eq!(pool.name, NONE_POOL);
        let mut conn = pool.pool.acquire().await.unwrap();
        let mut req = Request::new(
            crate::driver::Op::Select,
            "users",
            crate::driver::Payload::None,
            QueryOptions::new(),
        );
        pool.driver.query(conn.as_mut(), &mut req).await.unwrap();
        pool.pool.release(conn).await;
        assert!(req.rows.is_empty());
    }
}
