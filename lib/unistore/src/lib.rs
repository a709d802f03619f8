//! Unistore - Uniform CRUD/query middleware over heterogeneous storage backends.
//!
//! This crate exposes one verb set (get/select/add/put/update/incr/del and
//! friends) over any backend that implements the [`Driver`] contract. Rows
//! are dynamic JSON objects; behavior is driven by a declarative column
//! schema rather than per-backend types.
//!
//! # Core Concepts
//!
//! - **Schema registry**: per-table [`ColumnDef`]s merged attribute by
//!   attribute, driving validation, generation, joining, and visibility.
//! - **Pool registry**: named [`DbPool`]s routed by table pattern, caller
//!   override, or default, with a built-in `none` sink.
//! - **Pipeline**: every call flows prepare -> execute -> result, with a
//!   two-level cache and per-table capacity throttles along the way.
//!
//! # Entry Point
//!
//! Build a [`Db`] with [`Db::builder`], register drivers and table
//! definitions, then call the verbs. Backends live in sibling crates that
//! implement [`Driver`].

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

mod cache;
mod capacity;
mod column;
mod db;
mod driver;
mod error;
mod exec;
mod hooks;
mod join;
mod options;
mod pool;
mod prepare;
mod registry;
mod scan;
mod schema;

pub use cache::{CacheClient, CacheConfig, L2Config, LocalCacheClient, TwoLevelCache};
pub use capacity::{Capacity, TokenBucket};
pub use column::{ColumnDef, ColumnType};
pub use db::{BulkRequest, BulkResult, Db, DbBuilder};
pub use driver::{Connection, Driver, Info, Op, Payload, Request, Row};
pub use error::{DbError, IgnoreError};
pub use hooks::{Hook, HookAction, HookRegistry, WILDCARD};
pub use join::{join_columns, unjoin_columns};
pub use options::{FilterOp, QueryOptions, RowFilter, RowTransform};
pub use pool::{PoolOptions, PoolStats, ResourcePool};
pub use registry::{
    ConfigOptions, DbPool, NONE_POOL, PoolConfig, PoolRegistry, TableCapacity,
};
pub use scan::{ScanConsumer, ScanMode};
pub use schema::{SchemaRegistry, Table};
