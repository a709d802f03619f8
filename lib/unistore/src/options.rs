//! Per-call options: an explicit struct with every recognized knob.
//!
//! Unknown option names are a compile-time error by construction. Builder
//! methods chain, so call sites read like the operation they configure.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::driver::Row;
use crate::error::IgnoreError;

/// Per-column comparison operator for select/search requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterOp {
    #[default]
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    BeginsWith,
    /// Two-element range, inclusive.
    Between,
    In,
}

impl FilterOp {
    /// Operators whose right-hand side is a list.
    pub fn takes_list(self) -> bool {
        matches!(self, FilterOp::Between | FilterOp::In)
    }

    /// Range/prefix operators constrain partial column joins.
    pub fn is_ordering(self) -> bool {
        matches!(
            self,
            FilterOp::Gt | FilterOp::Ge | FilterOp::Lt | FilterOp::Le | FilterOp::BeginsWith
        )
    }
}

/// Caller-supplied row filter; returning false excludes the row.
pub type RowFilter = Arc<dyn Fn(&Row) -> bool + Send + Sync>;
/// Caller-supplied row transform, applied after filtering.
pub type RowTransform = Arc<dyn Fn(&mut Row) + Send + Sync>;

/// Explicit per-call policy for one operation.
#[derive(Clone, Default)]
pub struct QueryOptions {
    /// Route to a named pool instead of the default.
    pub pool: Option<String>,
    /// Per-column comparison operators for select/search.
    pub ops: HashMap<String, FilterOp>,
    /// Projection: keep only these columns in the result.
    pub select: Option<Vec<String>>,
    /// Page size for paged reads.
    pub count: Option<u64>,
    /// Continuation token to resume a paged read.
    pub start: Option<String>,
    /// Named index to read from.
    pub sort: Option<String>,
    pub desc: bool,
    /// Overall row limit for scans.
    pub limit: Option<u64>,
    /// Admit properties not present in the schema.
    pub no_columns: bool,
    /// Override the pool's strict-types policy.
    pub strict_types: Option<bool>,
    /// Caller may read/write secure and admin columns.
    pub admin: bool,
    /// Calling user id, filled into `uid` columns on insert.
    pub user_id: Option<String>,
    /// Expected values for a conditional write.
    pub expected: Option<Row>,
    pub ignore_error: IgnoreError,
    /// Retries for capacity-exceeded errors only.
    pub retry_count: u32,
    pub retry_delay: Duration,
    /// Explicit capacity override, units per interval.
    pub capacity: Option<f64>,
    /// Scales the working rate against the burst ceiling, (0,1].
    pub factor: Option<f64>,
    /// Read through the cache on select when a key is resolvable.
    pub cached: bool,
    /// Explicit cache key override.
    pub cache_key: Option<String>,
    pub cache_ttl: Option<Duration>,
    /// Bypass the cache entirely.
    pub no_cache: bool,
    /// Deduplicate result rows by this column.
    pub unique: Option<String>,
    pub filter: Option<RowFilter>,
    pub transform: Option<RowTransform>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool(mut self, name: impl Into<String>) -> Self {
        self.pool = Some(name.into());
        self
    }

    pub fn op(mut self, column: impl Into<String>, op: FilterOp) -> Self {
        self.ops.insert(column.into(), op);
        self
    }

    pub fn select(mut self, columns: Vec<String>) -> Self {
        self.select = Some(columns);
        self
    }

    pub fn count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    pub fn start(mut self, token: impl Into<String>) -> Self {
        self.start = Some(token.into());
        self
    }

    pub fn sort(mut self, index: impl Into<String>) -> Self {
        self.sort = Some(index.into());
        self
    }

    pub fn desc(mut self) -> Self {
        self.desc = true;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn admin(mut self) -> Self {
        self.admin = true;
        self
    }

    pub fn user_id(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    pub fn expected(mut self, expected: Row) -> Self {
        self.expected = Some(expected);
        self
    }

    pub fn ignore_error(mut self, ignore: IgnoreError) -> Self {
        self.ignore_error = ignore;
        self
    }

    pub fn retries(mut self, count: u32, delay: Duration) -> Self {
        self.retry_count = count;
        self.retry_delay = delay;
        self
    }

    pub fn cached(mut self) -> Self {
        self.cached = true;
        self
    }

    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.no_cache = true;
        self
    }

    pub fn unique(mut self, column: impl Into<String>) -> Self {
        self.unique = Some(column.into());
        self
    }

    pub fn filter(mut self, filter: RowFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn transform(mut self, transform: RowTransform) -> Self {
        self.transform = Some(transform);
        self
    }
}

impl fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("pool", &self.pool)
            .field("ops", &self.ops)
            .field("select", &self.select)
            .field("count", &self.count)
            .field("start", &self.start)
            .field("sort", &self.sort)
            .field("desc", &self.desc)
            .field("limit", &self.limit)
            .field("no_columns", &self.no_columns)
            .field("strict_types", &self.strict_types)
            .field("admin", &self.admin)
            .field("cached", &self.cached)
            .field("no_cache", &self.no_cache)
            .finish_non_exhaustive()
    }
}
