//! Execution and result pipeline.
//!
//! Drives acquire -> driver.query -> release, normalizes errors through the
//! driver, retries capacity rejections, and on success runs the result
//! stage: cache invalidation/population, row conversion, post-hooks, and
//! caller callbacks. Results are always a list, even on suppressed errors.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error};

use crate::db::Db;
use crate::driver::{Info, Op, Payload, Request, Row};
use crate::error::DbError;
use crate::join::unjoin_columns;
use crate::prepare::coerce;
use crate::registry::DbPool;

impl Db {
    /// Execute a prepared request and deliver normalized rows plus info.
    pub(crate) async fn run(&self, mut req: Request) -> Result<(Vec<Row>, Info), DbError> {
        let pool = self.pools.pool_by_name(&req.pool);
        let started = Instant::now();

        if let Some(err) = req.error.take() {
            return self.fail(&req, err);
        }
        if req.done {
            return Ok((Vec::new(), std::mem::take(&mut req.info)));
        }

        // Read-through cache for point reads.
        let cache_key = self.read_cache_key(&pool, &req);
        if let Some(key) = &cache_key {
            if let Some(row) = self.cache.get(&req.table, key).await {
                let mut rows = vec![row];
                self.result_rows(&pool, &req, &mut rows);
                let info = Info {
                    count: rows.len() as u64,
                    ..Info::default()
                };
                return Ok((rows, info));
            }
        }

        match self.execute(&pool, &mut req).await {
            Ok(()) => {}
            Err(err) => return self.fail(&req, err),
        }

        if req.op.is_write() {
            self.invalidate_written(&pool, &req).await;
        }

        let mut rows = std::mem::take(&mut req.rows);

        // Populate both cache levels after a read-through miss, before any
        // per-request shaping. Hooks, projection, and visibility run on the
        // hit path too, so the shared entry stays the raw backend row.
        if let (Some(key), Some(first)) = (&cache_key, rows.first()) {
            self.cache
                .put(&req.table, key, first, req.options.cache_ttl)
                .await;
        }

        self.result_rows(&pool, &req, &mut rows);

        let mut info = std::mem::take(&mut req.info);
        if info.count == 0 {
            info.count = rows.len() as u64;
        }
        debug!(
            op = req.op.name(),
            table = %req.table,
            pool = %req.pool,
            rows = rows.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "query finished"
        );
        Ok((rows, info))
    }

    /// Acquire, query, release; retry capacity rejections only.
    async fn execute(&self, pool: &Arc<DbPool>, req: &mut Request) -> Result<(), DbError> {
        let mut attempt = 0u32;
        loop {
            // A rejected attempt may already have produced partial output.
            req.rows.clear();
            req.info = Info::default();
            let mut conn = pool.pool.acquire().await?;
            let result = pool.driver.query(conn.as_mut(), req).await;
            // The connection goes back on success and failure alike.
            pool.pool.release(conn).await;
            match result {
                Ok(()) => {
                    req.info.next_token = pool.driver.next_token(req);
                    return Ok(());
                }
                Err(err) => {
                    let err = pool
                        .driver
                        .convert_error(&req.table, req.op, err, &req.options);
                    if matches!(err, DbError::CapacityExceeded(_))
                        && attempt < req.options.retry_count
                    {
                        attempt += 1;
                        debug!(
                            op = req.op.name(),
                            table = %req.table,
                            attempt,
                            "capacity exceeded, retrying"
                        );
                        tokio::time::sleep(req.options.retry_delay).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Normalized failure path: log with request context, then either
    /// suppress per caller policy or surface the error.
    fn fail(&self, req: &Request, err: DbError) -> Result<(Vec<Row>, Info), DbError> {
        if err.is_quiet() {
            debug!(
                op = req.op.name(),
                table = %req.table,
                pool = %req.pool,
                code = err.code(),
                error = %err,
                "query failed"
            );
        } else {
            error!(
                op = req.op.name(),
                table = %req.table,
                pool = %req.pool,
                code = err.code(),
                error = %err,
                "query failed"
            );
        }
        if req.options.ignore_error.matches(&err) {
            return Ok((Vec::new(), Info::default()));
        }
        Err(err)
    }

    /// Cache key for a point read, when resolvable. Missing key values
    /// bypass caching entirely.
    fn read_cache_key(&self, pool: &Arc<DbPool>, req: &Request) -> Option<String> {
        if req.options.no_cache {
            return None;
        }
        let enabled = match req.op {
            Op::Get => {
                req.options.cached || self.cache.config().tables.contains(&req.table)
            }
            Op::Select => req.options.cached,
            _ => false,
        };
        if !enabled {
            return None;
        }
        if let Some(key) = &req.options.cache_key {
            return Some(key.clone());
        }
        let row = req.obj.row()?;
        // Pool-introspected key metadata counts too, not just described
        // tables.
        let (_columns, keys) = self.effective_schema(pool, &req.table);
        self.cache.cache_key(&req.table, row, &keys)
    }

    /// Delete every cache key touched by a mutation, synchronously for
    /// tables on the cache-sync list, fire-and-forget otherwise.
    async fn invalidate_written(&self, pool: &Arc<DbPool>, req: &Request) {
        let row = match &req.obj {
            Payload::Row(row) => row,
            _ => return,
        };
        let (_columns, keys) = self.effective_schema(pool, &req.table);
        let cache_keys = self.cache.keys_for(&req.table, row, &keys);
        if cache_keys.is_empty() {
            return;
        }
        if self.cache.is_sync(&req.table) {
            self.cache.invalidate(&req.table, &cache_keys).await;
        } else {
            let cache = Arc::clone(&self.cache);
            let table = req.table.clone();
            tokio::spawn(async move {
                cache.invalidate(&table, &cache_keys).await;
            });
        }
    }

    /// Row post-processing: dedupe, semantic-type conversion, un-joining,
    /// defaulting, visibility, post-hooks, caller callbacks, projection.
    fn result_rows(&self, pool: &Arc<DbPool>, req: &Request, rows: &mut Vec<Row>) {
        if !req.op.is_read() {
            return;
        }
        let (columns, _keys) = self.effective_schema(pool, &req.table);

        if let Some(unique) = &req.options.unique {
            let mut seen = HashSet::new();
            rows.retain(|row| match row.get(unique) {
                Some(value) => seen.insert(value.to_string()),
                None => true,
            });
        }

        rows.retain_mut(|row| {
            unjoin_columns(row, &columns);
            for (name, col) in &columns {
                if col.is_writeonly() || (col.is_restricted() && !req.options.admin) {
                    row.remove(name);
                    continue;
                }
                match row.get_mut(name) {
                    Some(value) => coerce(value, col.semantic_type()),
                    None => {
                        if let Some(default) = &col.value {
                            row.insert(name.clone(), default.clone());
                        }
                    }
                }
            }
            if self.hooks.run_post(req.op, &req.table, row) == crate::hooks::HookAction::Drop {
                return false;
            }
            if let Some(filter) = &req.options.filter {
                if !filter(row) {
                    return false;
                }
            }
            if let Some(transform) = &req.options.transform {
                transform(row);
            }
            true
        });

        if let Some(select) = &req.options.select {
            for row in rows.iter_mut() {
                row.retain(|name, _| select.iter().any(|s| s == name));
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Connection;
    use crate::driver::Driver;
    use crate::options::QueryOptions;
    use crate::registry::PoolConfig;
    use serde_json::json;
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct NullConn;

    impl Connection for NullConn {
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    /// Emits a row then gets throttled on the first attempt, succeeds after.
    struct FlakyDriver {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Driver for FlakyDriver {
        fn kind(&self) -> &'static str {
            "flaky"
        }

        async fn open(&self) -> Result<Box<dyn Connection>, DbError> {
            Ok(Box::new(NullConn))
        }

        async fn close(&self, _conn: Box<dyn Connection>) {}

        async fn query(
            &self,
            _conn: &mut dyn Connection,
            req: &mut Request,
        ) -> Result<(), DbError> {
            let mut row = Row::new();
            row.insert("id".to_string(), json!("u1"));
            req.rows.push(row);
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(DbError::CapacityExceeded("throttled".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn retry_discards_partial_attempt_output() {
        let driver = Arc::new(FlakyDriver {
            calls: AtomicUsize::new(0),
        });
        let db = Db::builder()
            .pool("main", driver.clone(), PoolConfig::default())
            .build();

        let (rows, info) = db
            .select(
                "users",
                Row::new(),
                QueryOptions::new().retries(1, Duration::ZERO),
            )
            .await
            .unwrap();
        assert_eq!(driver.calls.load(Ordering::SeqCst), 2);
        assert_eq!(rows.len(), 1);
        assert_eq!(info.count, 1);
    }
}
