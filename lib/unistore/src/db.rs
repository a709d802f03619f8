//! The database facade: one uniform verb set over every configured backend.
//!
//! Construct with [`Db::builder`], call [`Db::open`] to start pool
//! maintenance and introspection, and [`Db::close`] to shut down. All
//! registries live inside this object; nothing is ambient global state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use regex::Regex;
use tracing::warn;

use crate::cache::{CacheClient, CacheConfig, LocalCacheClient, TwoLevelCache};
use crate::capacity::Capacity;
use crate::column::{ColumnDef, ColumnType};
use crate::driver::{Driver, Info, Op, Payload, Row};
use crate::error::DbError;
use crate::hooks::{Hook, HookRegistry};
use crate::options::QueryOptions;
use crate::pool::PoolStats;
use crate::registry::{PoolConfig, PoolRegistry};

/// One item of a bulk operation.
#[derive(Debug, Clone)]
pub struct BulkRequest {
    pub op: Op,
    pub table: String,
    pub obj: Row,
    pub options: Option<QueryOptions>,
}

/// Per-item outcome of a bulk operation.
#[derive(Debug)]
pub struct BulkResult {
    pub op: Op,
    pub table: String,
    pub error: Option<DbError>,
}

pub struct Db {
    pub(crate) schema: crate::schema::SchemaRegistry,
    pub(crate) pools: PoolRegistry,
    pub(crate) cache: Arc<TwoLevelCache>,
    pub(crate) hooks: HookRegistry,
    pub(crate) custom_columns: RwLock<Vec<(Regex, ColumnType)>>,
}

/// Builder for [`Db`]; collects pools, routing, schema, and cache policy.
pub struct DbBuilder {
    pools: Vec<(String, Arc<dyn Driver>, PoolConfig)>,
    default_pool: Option<String>,
    restricted: Vec<(String, String)>,
    cache_client: Option<Box<dyn CacheClient>>,
    cache_config: CacheConfig,
    tables: HashMap<String, HashMap<String, ColumnDef>>,
}

impl DbBuilder {
    pub fn pool(
        mut self,
        name: impl Into<String>,
        driver: Arc<dyn Driver>,
        config: PoolConfig,
    ) -> Self {
        self.pools.push((name.into(), driver, config));
        self
    }

    pub fn default_pool(mut self, name: impl Into<String>) -> Self {
        self.default_pool = Some(name.into());
        self
    }

    /// Pin tables matching `pattern` to a named pool, overriding callers.
    pub fn restrict(mut self, pattern: impl Into<String>, pool: impl Into<String>) -> Self {
        self.restricted.push((pattern.into(), pool.into()));
        self
    }

    pub fn cache(mut self, client: Box<dyn CacheClient>, config: CacheConfig) -> Self {
        self.cache_client = Some(client);
        self.cache_config = config;
        self
    }

    pub fn tables(mut self, defs: HashMap<String, HashMap<String, ColumnDef>>) -> Self {
        for (table, columns) in defs {
            self.tables.entry(table).or_default().extend(columns);
        }
        self
    }

    pub fn build(self) -> Db {
        let pools = PoolRegistry::new();
        let mut first_pool = None;
        for (name, driver, config) in self.pools {
            first_pool.get_or_insert_with(|| name.clone());
            pools.configure(name, driver, config);
        }
        if let Some(default) = self.default_pool.or(first_pool) {
            pools.set_default(default);
        }
        for (pattern, pool) in self.restricted {
            pools.restrict(pattern, pool);
        }
        let client = self
            .cache_client
            .unwrap_or_else(|| Box::new(LocalCacheClient::new()));
        let db = Db {
            schema: crate::schema::SchemaRegistry::new(),
            pools,
            cache: Arc::new(TwoLevelCache::new(client, self.cache_config)),
            hooks: HookRegistry::new(),
            custom_columns: RwLock::new(Vec::new()),
        };
        if !self.tables.is_empty() {
            db.schema.describe_tables(self.tables);
        }
        db
    }
}

impl Db {
    pub fn builder() -> DbBuilder {
        DbBuilder {
            pools: Vec::new(),
            default_pool: None,
            restricted: Vec::new(),
            cache_client: None,
            cache_config: CacheConfig::default(),
            tables: HashMap::new(),
        }
    }

    /// Start pool maintenance and introspect live backend schemas.
    pub async fn open(&self) -> Result<(), DbError> {
        for name in self.pools.pool_names() {
            let pool = self.pools.pool_by_name(&name);
            pool.start_reaper();
            if let Err(err) = pool.cache_columns().await {
                warn!(pool = %name, error = %err, "schema introspection failed");
            }
        }
        Ok(())
    }

    /// Shut down every pool, waiting up to `deadline` for busy connections.
    pub async fn close(&self, deadline: Option<Duration>) {
        self.pools.shutdown(deadline).await;
    }

    // Registration surface

    /// Merge table definitions into the schema registry.
    pub fn describe_tables(&self, defs: HashMap<String, HashMap<String, ColumnDef>>) {
        self.schema.describe_tables(defs);
    }

    /// Admit input properties matching `pattern` as columns of `ctype`.
    pub fn register_custom_column(&self, pattern: &str, ctype: ColumnType) -> Result<(), DbError> {
        let regex = Regex::new(pattern).map_err(|err| DbError::Validation {
            table: String::new(),
            column: pattern.to_string(),
            message: err.to_string(),
        })?;
        self.custom_columns.write().push((regex, ctype));
        Ok(())
    }

    pub fn register_pre_hook(&self, table: impl Into<String>, hook: Hook) {
        self.hooks.register_pre(table, hook);
    }

    pub fn register_post_hook(&self, table: impl Into<String>, hook: Hook) {
        self.hooks.register_post(table, hook);
    }

    /// Best named index for a set of query columns, by longest contiguous
    /// prefix match.
    pub fn index_for_keys(&self, table: &str, columns: &[&str]) -> Option<String> {
        self.schema.index_for_keys(table, columns)
    }

    /// Register a secondary named cache key for a table.
    pub fn register_cache_key(
        &self,
        table: impl Into<String>,
        name: impl Into<String>,
        columns: Vec<String>,
    ) {
        self.cache.register_secondary(table, name, columns);
    }

    /// Build a throttle from the larger of an explicit override, the
    /// table's configured capacity, and the backend-wide default. `None`
    /// means throttling is disabled for this table.
    pub fn get_capacity(&self, table: &str, op: Op, options: &QueryOptions) -> Option<Arc<Capacity>> {
        let pool = self.pools.get_pool(table, options);
        let configured = pool.table_capacity(table);
        let base = if op.is_write() {
            configured.write
        } else {
            configured.read
        };
        let rate = options.capacity.map_or(base, |explicit| explicit.max(base));
        if rate <= 0.0 {
            return None;
        }
        let factor = options.factor.unwrap_or(1.0).clamp(f64::MIN_POSITIVE, 1.0);
        Some(Arc::new(Capacity::new(rate * factor, rate)))
    }

    pub fn pool_stats(&self, name: &str) -> PoolStats {
        self.pools.pool_by_name(name).pool.stats()
    }

    // Verbs

    /// Point read by primary key. Resolves to `None` when no row matches.
    pub async fn get(
        &self,
        table: &str,
        obj: Row,
        options: QueryOptions,
    ) -> Result<Option<Row>, DbError> {
        let req = self.prepare(Op::Get, table, Payload::Row(obj), options);
        match self.run(req).await {
            Ok((mut rows, _info)) => Ok(if rows.is_empty() {
                None
            } else {
                Some(rows.swap_remove(0))
            }),
            Err(DbError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn select(
        &self,
        table: &str,
        obj: Row,
        options: QueryOptions,
    ) -> Result<(Vec<Row>, Info), DbError> {
        let req = self.prepare(Op::Select, table, Payload::Row(obj), options);
        self.run(req).await
    }

    /// Select against a named secondary index.
    pub async fn search(
        &self,
        table: &str,
        obj: Row,
        options: QueryOptions,
    ) -> Result<(Vec<Row>, Info), DbError> {
        let req = self.prepare(Op::Search, table, Payload::Row(obj), options);
        self.run(req).await
    }

    /// Retrieve a set of rows by primary key.
    pub async fn list(
        &self,
        table: &str,
        rows: Vec<Row>,
        options: QueryOptions,
    ) -> Result<Vec<Row>, DbError> {
        let req = self.prepare(Op::List, table, Payload::Rows(rows), options);
        let (rows, _info) = self.run(req).await?;
        Ok(rows)
    }

    pub async fn exists(&self, table: &str, obj: Row, options: QueryOptions) -> Result<bool, DbError> {
        Ok(self.get(table, obj, options).await?.is_some())
    }

    /// First matching row of a select, if any.
    pub async fn first(
        &self,
        table: &str,
        obj: Row,
        options: QueryOptions,
    ) -> Result<Option<Row>, DbError> {
        let (mut rows, _info) = self.select(table, obj, options.count(1)).await?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.swap_remove(0))
        })
    }

    /// Insert; fails with `AlreadyExists` if the primary key is taken.
    pub async fn add(&self, table: &str, obj: Row, options: QueryOptions) -> Result<Info, DbError> {
        self.mutate(Op::Add, table, obj, options).await
    }

    /// Insert or replace.
    pub async fn put(&self, table: &str, obj: Row, options: QueryOptions) -> Result<Info, DbError> {
        self.mutate(Op::Put, table, obj, options).await
    }

    /// Update an existing row by primary key.
    pub async fn update(
        &self,
        table: &str,
        obj: Row,
        options: QueryOptions,
    ) -> Result<Info, DbError> {
        self.mutate(Op::Update, table, obj, options).await
    }

    /// Atomically add the given deltas to counter columns.
    pub async fn incr(&self, table: &str, obj: Row, options: QueryOptions) -> Result<Info, DbError> {
        self.mutate(Op::Incr, table, obj, options).await
    }

    /// Delete by primary key.
    pub async fn del(&self, table: &str, obj: Row, options: QueryOptions) -> Result<Info, DbError> {
        self.mutate(Op::Del, table, obj, options).await
    }

    async fn mutate(
        &self,
        op: Op,
        table: &str,
        obj: Row,
        options: QueryOptions,
    ) -> Result<Info, DbError> {
        let req = self.prepare(op, table, Payload::Row(obj), options);
        let (_rows, info) = self.run(req).await?;
        Ok(info)
    }

    /// Run a batch of sub-requests, collecting per-item errors without
    /// aborting the batch.
    pub async fn bulk(&self, items: Vec<BulkRequest>) -> Vec<BulkResult> {
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            let options = item.options.unwrap_or_default();
            let req = self.prepare(item.op, &item.table, Payload::Row(item.obj), options);
            let error = self.run(req).await.err();
            results.push(BulkResult {
                op: item.op,
                table: item.table,
                error,
            });
        }
        results
    }

    /// Create the table on its routed backend from the registry definition.
    pub async fn create_table(&self, table: &str, options: QueryOptions) -> Result<Info, DbError> {
        let obj = self.table_definition(table)?;
        let req = self.prepare(Op::Create, table, Payload::Row(obj), options);
        let (_rows, info) = self.run(req).await?;
        Ok(info)
    }

    /// Apply schema changes for columns added since creation.
    pub async fn upgrade_table(&self, table: &str, options: QueryOptions) -> Result<Info, DbError> {
        let obj = self.table_definition(table)?;
        let req = self.prepare(Op::Upgrade, table, Payload::Row(obj), options);
        let (_rows, info) = self.run(req).await?;
        Ok(info)
    }

    pub async fn drop_table(&self, table: &str, options: QueryOptions) -> Result<Info, DbError> {
        let req = self.prepare(Op::Drop, table, Payload::None, options);
        let (_rows, info) = self.run(req).await?;
        Ok(info)
    }

    /// Serialize the registry's column definitions for a DDL request.
    fn table_definition(&self, table: &str) -> Result<Row, DbError> {
        let def = self.schema.table(table).ok_or_else(|| DbError::Validation {
            table: table.to_string(),
            column: String::new(),
            message: "table is not described".to_string(),
        })?;
        let mut obj = Row::new();
        for (name, col) in &def.columns {
            obj.insert(name.clone(), serde_json::to_value(col)?);
        }
        Ok(obj)
    }
}
