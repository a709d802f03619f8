//! The backend driver contract and the request/info shapes that cross it.

use std::any::Any;
use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::DbError;
use crate::options::QueryOptions;
use crate::schema::Table;

/// A row is a dynamic JSON object.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Operation verbs routed through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    Select,
    Search,
    List,
    Add,
    Put,
    Update,
    Incr,
    Del,
    Bulk,
    Create,
    Upgrade,
    Drop,
}

impl Op {
    /// Mutating operations trigger cache invalidation.
    pub fn is_write(self) -> bool {
        matches!(self, Op::Add | Op::Put | Op::Update | Op::Incr | Op::Del)
    }

    pub fn is_insert(self) -> bool {
        matches!(self, Op::Add | Op::Put)
    }

    pub fn is_update(self) -> bool {
        matches!(self, Op::Update | Op::Incr)
    }

    pub fn is_read(self) -> bool {
        matches!(self, Op::Get | Op::Select | Op::Search | Op::List)
    }

    pub fn name(self) -> &'static str {
        match self {
            Op::Get => "get",
            Op::Select => "select",
            Op::Search => "search",
            Op::List => "list",
            Op::Add => "add",
            Op::Put => "put",
            Op::Update => "update",
            Op::Incr => "incr",
            Op::Del => "del",
            Op::Bulk => "bulk",
            Op::Create => "create",
            Op::Upgrade => "upgrade",
            Op::Drop => "drop",
        }
    }
}

/// Input payload of a request, normalized by the preparer.
#[derive(Debug, Clone, Default)]
pub enum Payload {
    #[default]
    None,
    Row(Row),
    Rows(Vec<Row>),
    /// Raw backend text, passed through untouched.
    Text(String),
}

impl Payload {
    pub fn row(&self) -> Option<&Row> {
        match self {
            Payload::Row(row) => Some(row),
            _ => None,
        }
    }

    pub fn row_mut(&mut self) -> Option<&mut Row> {
        match self {
            Payload::Row(row) => Some(row),
            _ => None,
        }
    }

    pub fn rows_mut(&mut self) -> Option<&mut Vec<Row>> {
        match self {
            Payload::Rows(rows) => Some(rows),
            _ => None,
        }
    }
}

/// Result metadata attached to every executed request.
#[derive(Debug, Clone, Default)]
pub struct Info {
    pub affected_rows: u64,
    pub inserted_oid: Option<String>,
    pub next_token: Option<String>,
    pub consumed_capacity: f64,
    pub count: u64,
}

/// One prepared operation, created fresh per call and discarded after the
/// result is delivered.
#[derive(Debug)]
pub struct Request {
    pub op: Op,
    /// Resolved table name (drivers may alias).
    pub table: String,
    pub obj: Payload,
    pub options: QueryOptions,
    /// Backend-native query text, built by `Driver::prepare`.
    pub text: String,
    /// Bound values accompanying `text`.
    pub values: Vec<serde_json::Value>,
    pub rows: Vec<Row>,
    pub info: Info,
    /// Error captured during preparation; short-circuits execution.
    pub error: Option<DbError>,
    /// Preparation decided there is nothing to do (e.g. a hook dropped the
    /// row); execution resolves to an empty success.
    pub done: bool,
    pub(crate) pool: String,
}

impl Request {
    pub fn new(op: Op, table: impl Into<String>, obj: Payload, options: QueryOptions) -> Self {
        Request {
            op,
            table: table.into(),
            obj,
            options,
            text: String::new(),
            values: Vec::new(),
            rows: Vec::new(),
            info: Info::default(),
            error: None,
            done: false,
            pool: String::new(),
        }
    }
}

/// Opaque backend connection handle managed by the resource pool.
pub trait Connection: Send + Any {
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// The fixed contract every backend implements.
///
/// The core calls these in a fixed order: `resolve_table` and `prepare_row`/
/// `prepare` during preparation, then `open`/`query`/`close` through the
/// pool, `convert_error` on failure, `next_token` after paged reads, and
/// `cache_columns` once at pool setup to introspect the live schema.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Short backend type tag, for logs and routing diagnostics.
    fn kind(&self) -> &'static str;

    async fn open(&self) -> Result<Box<dyn Connection>, DbError>;

    async fn close(&self, conn: Box<dyn Connection>);

    /// Execute the request on the connection, filling `rows` and `info`.
    async fn query(&self, conn: &mut dyn Connection, req: &mut Request) -> Result<(), DbError>;

    /// Build backend-native query text/params in place on the request.
    fn prepare(&self, _req: &mut Request) -> Result<(), DbError> {
        Ok(())
    }

    /// Backend-specific row pre-pass for native-type quirks.
    fn prepare_row(&self, _req: &mut Request) {}

    /// Drivers may alias tables.
    fn resolve_table(
        &self,
        _op: Op,
        table: &str,
        _obj: &Payload,
        _options: &QueryOptions,
    ) -> String {
        table.to_string()
    }

    /// Continuation token for the page just fetched, `None` when exhausted.
    fn next_token(&self, req: &Request) -> Option<String> {
        req.info.next_token.clone()
    }

    /// Introspect the live backend for per-table column/key/index metadata.
    async fn cache_columns(
        &self,
        _conn: &mut dyn Connection,
    ) -> Result<HashMap<String, Table>, DbError> {
        Ok(HashMap::new())
    }

    /// Normalize a backend-native error.
    fn convert_error(
        &self,
        _table: &str,
        _op: Op,
        err: DbError,
        _options: &QueryOptions,
    ) -> DbError {
        err
    }

    /// Backend-specific value coercion for wire encoding.
    fn bind_value(
        &self,
        _req: &Request,
        _name: &str,
        value: serde_json::Value,
    ) -> serde_json::Value {
        value
    }
}
