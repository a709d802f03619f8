//! In-process reference backend.
//!
//! Tables are ordered maps keyed by the concatenated primary key, shared
//! across connections behind a lock. Useful for tests and as the smallest
//! complete example of the driver contract: it supports every verb,
//! conditional writes, counter increments, and key-ordered pagination.

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use unistore::{
    ColumnDef, Connection, DbError, Driver, FilterOp, Op, Payload, QueryOptions, Request, Row,
    Table,
};

const KEY_SEPARATOR: &str = "|";

#[derive(Debug, Default)]
struct TableState {
    keys: Vec<String>,
    rows: BTreeMap<String, Row>,
}

#[derive(Debug, Default)]
struct Store {
    tables: HashMap<String, TableState>,
    /// Key lists for tables that were described but never created.
    described: HashMap<String, Vec<String>>,
}

/// Backend driver storing every table in process memory.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    store: Arc<RwLock<Store>>,
}

struct MemoryConnection {
    store: Arc<RwLock<Store>>,
}

impl Connection for MemoryConnection {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the primary-key columns for a table ahead of any create
    /// request. Keys arriving later via a create overwrite these.
    pub fn describe(&self, table: impl Into<String>, keys: Vec<String>) {
        self.store.write().described.insert(table.into(), keys);
    }

    /// Number of rows currently stored for `table`.
    pub fn len(&self, table: &str) -> usize {
        self.store
            .read()
            .tables
            .get(table)
            .map_or(0, |state| state.rows.len())
    }

    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }
}

/// The concatenated primary key for a row, `None` when a component is
/// missing or empty.
fn row_key(keys: &[String], row: &Row) -> Option<String> {
    let mut parts = Vec::with_capacity(keys.len());
    for key in keys {
        let part = match row.get(key) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => return None,
        };
        parts.push(part);
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(KEY_SEPARATOR))
    }
}

/// Loose scalar ordering: numbers numerically, everything else as strings.
fn compare(left: &Value, right: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return l.partial_cmp(&r).unwrap_or(Ordering::Equal);
    }
    let l = match left {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let r = match right {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    l.cmp(&r)
}

fn matches_condition(actual: Option<&Value>, op: FilterOp, wanted: &Value) -> bool {
    use std::cmp::Ordering;
    let Some(actual) = actual else {
        return op == FilterOp::Ne;
    };
    match op {
        FilterOp::Eq => actual == wanted,
        FilterOp::Ne => actual != wanted,
        FilterOp::Gt => compare(actual, wanted) == Ordering::Greater,
        FilterOp::Ge => compare(actual, wanted) != Ordering::Less,
        FilterOp::Lt => compare(actual, wanted) == Ordering::Less,
        FilterOp::Le => compare(actual, wanted) != Ordering::Greater,
        FilterOp::BeginsWith => match (actual, wanted) {
            (Value::String(a), Value::String(w)) => a.starts_with(w.as_str()),
            _ => false,
        },
        FilterOp::Between => match wanted.as_array() {
            Some(range) if range.len() == 2 => {
                compare(actual, &range[0]) != Ordering::Less
                    && compare(actual, &range[1]) != Ordering::Greater
            }
            _ => false,
        },
        FilterOp::In => match wanted.as_array() {
            Some(values) => values.iter().any(|v| v == actual),
            None => actual == wanted,
        },
    }
}

fn matches_query(row: &Row, query: &Row, options: &QueryOptions) -> bool {
    query.iter().all(|(column, wanted)| {
        let op = options.ops.get(column).copied().unwrap_or_default();
        matches_condition(row.get(column), op, wanted)
    })
}

/// Primary-key column names derived from a create payload of serialized
/// column definitions.
fn keys_from_definition(obj: &Row) -> Result<Vec<String>, DbError> {
    let mut ordered: Vec<(u32, String)> = Vec::new();
    for (name, raw) in obj {
        let col: ColumnDef = serde_json::from_value(raw.clone())?;
        if let Some(position) = col.primary {
            ordered.push((position, name.clone()));
        }
    }
    ordered.sort();
    Ok(ordered.into_iter().map(|(_, name)| name).collect())
}

impl MemoryDriver {
    fn table_keys(&self, store: &Store, table: &str) -> Result<Vec<String>, DbError> {
        if let Some(state) = store.tables.get(table) {
            return Ok(state.keys.clone());
        }
        if let Some(keys) = store.described.get(table) {
            return Ok(keys.clone());
        }
        Err(DbError::Validation {
            table: table.to_string(),
            column: String::new(),
            message: "unknown table".to_string(),
        })
    }

    fn write_key(&self, store: &Store, req: &Request) -> Result<String, DbError> {
        let keys = self.table_keys(store, &req.table)?;
        let row = req.obj.row().ok_or_else(|| DbError::Validation {
            table: req.table.clone(),
            column: String::new(),
            message: "row payload required".to_string(),
        })?;
        row_key(&keys, row).ok_or_else(|| DbError::Validation {
            table: req.table.clone(),
            column: keys.join(KEY_SEPARATOR),
            message: "incomplete primary key".to_string(),
        })
    }

    fn select(&self, req: &mut Request) -> Result<(), DbError> {
        let store = self.store.read();
        let Some(state) = store.tables.get(&req.table) else {
            return Ok(());
        };
        let query = req.obj.row().cloned().unwrap_or_default();
        let page = req.options.count.map(|c| c.max(1) as usize);
        let start = req.options.start.clone();

        let mut matched: Vec<(&String, &Row)> = Vec::new();
        let forward: Box<dyn Iterator<Item = (&String, &Row)>> = if req.options.desc {
            Box::new(state.rows.iter().rev())
        } else {
            Box::new(state.rows.iter())
        };
        let mut exhausted = true;
        for (key, row) in forward {
            // Resume strictly past the continuation token.
            if let Some(token) = &start {
                let passed = if req.options.desc {
                    key.as_str() < token.as_str()
                } else {
                    key.as_str() > token.as_str()
                };
                if !passed {
                    continue;
                }
            }
            if !matches_query(row, &query, &req.options) {
                continue;
            }
            if page.is_some_and(|p| matched.len() >= p) {
                exhausted = false;
                break;
            }
            matched.push((key, row));
        }

        if !exhausted {
            req.info.next_token = matched.last().map(|(key, _)| (*key).clone());
        }
        req.rows = matched.into_iter().map(|(_, row)| row.clone()).collect();
        req.info.count = req.rows.len() as u64;
        Ok(())
    }

    fn get(&self, req: &mut Request) -> Result<(), DbError> {
        let store = self.store.read();
        let key = self.write_key(&store, req)?;
        if let Some(state) = store.tables.get(&req.table) {
            if let Some(row) = state.rows.get(&key) {
                req.rows.push(row.clone());
            }
        }
        req.info.count = req.rows.len() as u64;
        Ok(())
    }

    fn list(&self, req: &mut Request) -> Result<(), DbError> {
        let store = self.store.read();
        let keys = self.table_keys(&store, &req.table)?;
        let Some(state) = store.tables.get(&req.table) else {
            return Ok(());
        };
        if let Payload::Rows(rows) = &req.obj {
            for item in rows {
                if let Some(key) = row_key(&keys, item) {
                    if let Some(row) = state.rows.get(&key) {
                        req.rows.push(row.clone());
                    }
                }
            }
        }
        req.info.count = req.rows.len() as u64;
        Ok(())
    }

    fn write(&self, req: &mut Request) -> Result<(), DbError> {
        let mut store = self.store.write();
        let key = self.write_key(&store, req)?;
        let keys = self.table_keys(&store, &req.table)?;
        let state = store
            .tables
            .entry(req.table.clone())
            .or_insert_with(|| TableState {
                keys,
                rows: BTreeMap::new(),
            });
        let row = req.obj.row().cloned().unwrap_or_default();

        match req.op {
            Op::Add => {
                if state.rows.contains_key(&key) {
                    return Err(DbError::AlreadyExists(format!("{}[{key}]", req.table)));
                }
                state.rows.insert(key, row);
                req.info.affected_rows = 1;
            }
            Op::Put => {
                state.rows.insert(key, row);
                req.info.affected_rows = 1;
            }
            Op::Update => {
                let Some(current) = state.rows.get_mut(&key) else {
                    return Err(DbError::NotFound(format!("{}[{key}]", req.table)));
                };
                check_expected(&req.table, current, req.options.expected.as_ref())?;
                for (column, value) in row {
                    current.insert(column, value);
                }
                req.info.affected_rows = 1;
            }
            Op::Incr => {
                let current = state.rows.entry(key.clone()).or_default();
                check_expected(&req.table, current, req.options.expected.as_ref())?;
                for (column, delta) in row {
                    if state.keys.contains(&column) {
                        current.insert(column, delta);
                        continue;
                    }
                    let sum = current.get(&column).and_then(Value::as_f64).unwrap_or(0.0)
                        + delta.as_f64().unwrap_or(0.0);
                    let value = serde_json::Number::from_f64(sum)
                        .map(Value::Number)
                        .unwrap_or(Value::Null);
                    current.insert(column, value);
                }
                req.info.affected_rows = 1;
            }
            Op::Del => {
                // Deleting an absent row is not an error.
                req.info.affected_rows = u64::from(state.rows.remove(&key).is_some());
            }
            _ => {}
        }
        Ok(())
    }

    fn ddl(&self, req: &mut Request) -> Result<(), DbError> {
        let mut store = self.store.write();
        match req.op {
            Op::Create | Op::Upgrade => {
                let keys = match req.obj.row() {
                    Some(obj) => keys_from_definition(obj)?,
                    None => self.table_keys(&store, &req.table)?,
                };
                match store.tables.get_mut(&req.table) {
                    Some(state) => state.keys = keys,
                    None => {
                        store.tables.insert(
                            req.table.clone(),
                            TableState {
                                keys,
                                rows: BTreeMap::new(),
                            },
                        );
                        req.info.affected_rows = 1;
                    }
                }
            }
            Op::Drop => {
                req.info.affected_rows = u64::from(store.tables.remove(&req.table).is_some());
            }
            _ => {}
        }
        Ok(())
    }
}

fn check_expected(table: &str, current: &Row, expected: Option<&Row>) -> Result<(), DbError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    for (column, value) in expected {
        if current.get(column) != Some(value) {
            return Err(DbError::ConditionalCheckFailed(format!(
                "{table}.{column} does not match"
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl Driver for MemoryDriver {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn open(&self) -> Result<Box<dyn Connection>, DbError> {
        Ok(Box::new(MemoryConnection {
            store: Arc::clone(&self.store),
        }))
    }

    async fn close(&self, conn: Box<dyn Connection>) {
        drop(conn);
    }

    async fn query(&self, _conn: &mut dyn Connection, req: &mut Request) -> Result<(), DbError> {
        match req.op {
            Op::Get => self.get(req),
            Op::Select | Op::Search => self.select(req),
            Op::List => self.list(req),
            Op::Add | Op::Put | Op::Update | Op::Incr | Op::Del => self.write(req),
            Op::Create | Op::Upgrade | Op::Drop => self.ddl(req),
            Op::Bulk => Ok(()),
        }
    }

    async fn cache_columns(
        &self,
        _conn: &mut dyn Connection,
    ) -> Result<HashMap<String, Table>, DbError> {
        let store = self.store.read();
        let mut tables = HashMap::new();
        let materialized = store
            .tables
            .iter()
            .map(|(name, state)| (name, &state.keys));
        let declared = store
            .described
            .iter()
            .filter(|(name, _)| !store.tables.contains_key(*name));
        for (name, keys) in materialized.chain(declared) {
            let mut columns = HashMap::new();
            for (position, key) in keys.iter().enumerate() {
                columns.insert(
                    key.clone(),
                    ColumnDef::default().primary(position as u32),
                );
            }
            tables.insert(
                name.clone(),
                Table {
                    columns,
                    keys: keys.clone(),
                    indexes: BTreeMap::new(),
                },
            );
        }
        Ok(tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn request(op: Op, table: &str, obj: Payload, options: QueryOptions) -> Request {
        Request::new(op, table, obj, options)
    }

    async fn run(driver: &MemoryDriver, req: &mut Request) -> Result<(), DbError> {
        let mut conn = driver.open().await?;
        driver.query(conn.as_mut(), req).await
    }

    #[tokio::test]
    async fn add_then_get_round_trip() {
        let driver = MemoryDriver::new();
        driver.describe("users", vec!["id".to_string()]);

        let mut add = request(
            Op::Add,
            "users",
            Payload::Row(row(&[("id", json!("u1")), ("name", json!("ada"))])),
            QueryOptions::new(),
        );
        run(&driver, &mut add).await.unwrap();
        assert_eq!(add.info.affected_rows, 1);

        let mut get = request(
            Op::Get,
            "users",
            Payload::Row(row(&[("id", json!("u1"))])),
            QueryOptions::new(),
        );
        run(&driver, &mut get).await.unwrap();
        assert_eq!(get.rows.len(), 1);
        assert_eq!(get.rows[0].get("name"), Some(&json!("ada")));
    }

    #[tokio::test]
    async fn add_duplicate_fails() {
        let driver = MemoryDriver::new();
        driver.describe("users", vec!["id".to_string()]);
        let obj = row(&[("id", json!("u1"))]);

        let mut first = request(Op::Add, "users", Payload::Row(obj.clone()), QueryOptions::new());
        run(&driver, &mut first).await.unwrap();
        let mut second = request(Op::Add, "users", Payload::Row(obj), QueryOptions::new());
        let err = run(&driver, &mut second).await.unwrap_err();
        assert!(matches!(err, DbError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn update_missing_row_is_not_found() {
        let driver = MemoryDriver::new();
        driver.describe("users", vec!["id".to_string()]);
        let mut update = request(
            Op::Update,
            "users",
            Payload::Row(row(&[("id", json!("ghost")), ("name", json!("x"))])),
            QueryOptions::new(),
        );
        let err = run(&driver, &mut update).await.unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));
    }

    #[tokio::test]
    async fn conditional_update_checks_expected_values() {
        let driver = MemoryDriver::new();
        driver.describe("users", vec!["id".to_string()]);
        let mut add = request(
            Op::Add,
            "users",
            Payload::Row(row(&[("id", json!("u1")), ("state", json!("new"))])),
            QueryOptions::new(),
        );
        run(&driver, &mut add).await.unwrap();

        let mut options = QueryOptions::new();
        options.expected = Some(row(&[("state", json!("active"))]));
        let mut update = request(
            Op::Update,
            "users",
            Payload::Row(row(&[("id", json!("u1")), ("state", json!("closed"))])),
            options,
        );
        let err = run(&driver, &mut update).await.unwrap_err();
        assert!(matches!(err, DbError::ConditionalCheckFailed(_)));

        let mut options = QueryOptions::new();
        options.expected = Some(row(&[("state", json!("new"))]));
        let mut update = request(
            Op::Update,
            "users",
            Payload::Row(row(&[("id", json!("u1")), ("state", json!("closed"))])),
            options,
        );
        run(&driver, &mut update).await.unwrap();
        assert_eq!(update.info.affected_rows, 1);
    }

    #[tokio::test]
    async fn incr_accumulates_and_creates() {
        let driver = MemoryDriver::new();
        driver.describe("stats", vec!["id".to_string()]);

        for _ in 0..3 {
            let mut incr = request(
                Op::Incr,
                "stats",
                Payload::Row(row(&[("id", json!("hits")), ("total", json!(2))])),
                QueryOptions::new(),
            );
            run(&driver, &mut incr).await.unwrap();
        }

        let mut get = request(
            Op::Get,
            "stats",
            Payload::Row(row(&[("id", json!("hits"))])),
            QueryOptions::new(),
        );
        run(&driver, &mut get).await.unwrap();
        assert_eq!(get.rows[0].get("total").and_then(Value::as_f64), Some(6.0));
    }

    #[tokio::test]
    async fn select_filters_and_paginates() {
        let driver = MemoryDriver::new();
        driver.describe("events", vec!["id".to_string()]);
        for i in 0..5 {
            let mut add = request(
                Op::Add,
                "events",
                Payload::Row(row(&[
                    ("id", json!(format!("e{i}"))),
                    ("kind", json!(if i % 2 == 0 { "tick" } else { "tock" })),
                    ("seq", json!(i)),
                ])),
                QueryOptions::new(),
            );
            run(&driver, &mut add).await.unwrap();
        }

        // Filtered read, no pagination.
        let mut select = request(
            Op::Select,
            "events",
            Payload::Row(row(&[("kind", json!("tick"))])),
            QueryOptions::new(),
        );
        run(&driver, &mut select).await.unwrap();
        assert_eq!(select.rows.len(), 3);
        assert!(select.info.next_token.is_none());

        // Two-row pages walk the whole table.
        let mut options = QueryOptions::new();
        options.count = Some(2);
        let mut page = request(Op::Select, "events", Payload::Row(Row::new()), options);
        run(&driver, &mut page).await.unwrap();
        assert_eq!(page.rows.len(), 2);
        let token = page.info.next_token.clone().unwrap();
        assert_eq!(token, "e1");

        let mut options = QueryOptions::new();
        options.count = Some(2);
        options.start = Some(token);
        let mut next = request(Op::Select, "events", Payload::Row(Row::new()), options);
        run(&driver, &mut next).await.unwrap();
        assert_eq!(next.rows[0].get("id"), Some(&json!("e2")));
    }

    #[tokio::test]
    async fn select_supports_comparison_operators() {
        let driver = MemoryDriver::new();
        driver.describe("events", vec!["id".to_string()]);
        for i in 0..4 {
            let mut add = request(
                Op::Add,
                "events",
                Payload::Row(row(&[("id", json!(format!("e{i}"))), ("seq", json!(i))])),
                QueryOptions::new(),
            );
            run(&driver, &mut add).await.unwrap();
        }

        let mut options = QueryOptions::new();
        options.ops.insert("seq".to_string(), FilterOp::Ge);
        let mut select = request(
            Op::Select,
            "events",
            Payload::Row(row(&[("seq", json!(2))])),
            options,
        );
        run(&driver, &mut select).await.unwrap();
        assert_eq!(select.rows.len(), 2);

        let mut options = QueryOptions::new();
        options.ops.insert("id".to_string(), FilterOp::In);
        let mut select = request(
            Op::Select,
            "events",
            Payload::Row(row(&[("id", json!(["e0", "e3"]))])),
            options,
        );
        run(&driver, &mut select).await.unwrap();
        assert_eq!(select.rows.len(), 2);

        let mut options = QueryOptions::new();
        options.ops.insert("id".to_string(), FilterOp::BeginsWith);
        let mut select = request(
            Op::Select,
            "events",
            Payload::Row(row(&[("id", json!("e"))])),
            options,
        );
        run(&driver, &mut select).await.unwrap();
        assert_eq!(select.rows.len(), 4);
    }

    #[tokio::test]
    async fn descending_pagination() {
        let driver = MemoryDriver::new();
        driver.describe("events", vec!["id".to_string()]);
        for i in 0..3 {
            let mut add = request(
                Op::Add,
                "events",
                Payload::Row(row(&[("id", json!(format!("e{i}")))])),
                QueryOptions::new(),
            );
            run(&driver, &mut add).await.unwrap();
        }

        let mut options = QueryOptions::new();
        options.desc = true;
        options.count = Some(2);
        let mut page = request(Op::Select, "events", Payload::Row(Row::new()), options);
        run(&driver, &mut page).await.unwrap();
        assert_eq!(page.rows[0].get("id"), Some(&json!("e2")));
        let token = page.info.next_token.clone().unwrap();

        let mut options = QueryOptions::new();
        options.desc = true;
        options.start = Some(token);
        let mut next = request(Op::Select, "events", Payload::Row(Row::new()), options);
        run(&driver, &mut next).await.unwrap();
        assert_eq!(next.rows.len(), 1);
        assert_eq!(next.rows[0].get("id"), Some(&json!("e0")));
    }

    #[tokio::test]
    async fn list_returns_known_rows_only() {
        let driver = MemoryDriver::new();
        driver.describe("users", vec!["id".to_string()]);
        let mut add = request(
            Op::Add,
            "users",
            Payload::Row(row(&[("id", json!("u1"))])),
            QueryOptions::new(),
        );
        run(&driver, &mut add).await.unwrap();

        let mut list = request(
            Op::List,
            "users",
            Payload::Rows(vec![
                row(&[("id", json!("u1"))]),
                row(&[("id", json!("missing"))]),
            ]),
            QueryOptions::new(),
        );
        run(&driver, &mut list).await.unwrap();
        assert_eq!(list.rows.len(), 1);
    }

    #[tokio::test]
    async fn create_derives_keys_and_drop_removes() {
        let driver = MemoryDriver::new();
        let mut definition = Row::new();
        definition.insert(
            "tenant".to_string(),
            serde_json::to_value(ColumnDef::default().primary(0)).unwrap(),
        );
        definition.insert(
            "id".to_string(),
            serde_json::to_value(ColumnDef::default().primary(1)).unwrap(),
        );
        let mut create = request(Op::Create, "docs", Payload::Row(definition), QueryOptions::new());
        run(&driver, &mut create).await.unwrap();

        let mut add = request(
            Op::Add,
            "docs",
            Payload::Row(row(&[("tenant", json!("t1")), ("id", json!("d1"))])),
            QueryOptions::new(),
        );
        run(&driver, &mut add).await.unwrap();
        assert_eq!(driver.len("docs"), 1);

        let mut drop = request(Op::Drop, "docs", Payload::None, QueryOptions::new());
        run(&driver, &mut drop).await.unwrap();
        assert_eq!(drop.info.affected_rows, 1);
        assert!(driver.is_empty("docs"));
    }

    #[tokio::test]
    async fn unknown_table_write_is_a_validation_error() {
        let driver = MemoryDriver::new();
        let mut add = request(
            Op::Add,
            "nowhere",
            Payload::Row(row(&[("id", json!("x"))])),
            QueryOptions::new(),
        );
        let err = run(&driver, &mut add).await.unwrap_err();
        assert!(matches!(err, DbError::Validation { .. }));
    }
}
