//! Paginated scanning: repeatedly drives select requests, feeding rows to a
//! consumer while honoring capacity throttling and a concurrency bound.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::debug;

use crate::db::Db;
use crate::driver::{Op, Payload, Row};
use crate::error::DbError;
use crate::options::QueryOptions;

/// How scan pages are delivered to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// One row at a time, sequentially.
    Rows,
    /// The whole page at once.
    Batch,
    /// Rows in parallel, at most this many in flight.
    Concurrent(usize),
}

/// Receives scan output. An error aborts the scan and propagates.
#[async_trait]
pub trait ScanConsumer: Send + Sync {
    async fn row(&self, _row: Row) -> Result<(), DbError> {
        Ok(())
    }

    async fn batch(&self, rows: Vec<Row>) -> Result<(), DbError> {
        for row in rows {
            self.row(row).await?;
        }
        Ok(())
    }
}

impl Db {
    /// Page through `table`, feeding rows to `consumer` until the
    /// continuation token runs out, the row limit is reached, or the
    /// consumer fails. Returns the number of rows delivered.
    pub async fn scan(
        &self,
        table: &str,
        query: Row,
        options: QueryOptions,
        mode: ScanMode,
        consumer: Arc<dyn ScanConsumer>,
    ) -> Result<u64, DbError> {
        let capacity = self.get_capacity(table, Op::Select, &options);
        let limit = options.limit;
        let mut token = options.start.clone();
        let mut delivered: u64 = 0;
        let op = if options.sort.is_some() {
            Op::Search
        } else {
            Op::Select
        };

        loop {
            let mut page_options = options.clone();
            page_options.start = token.take();
            page_options.limit = None;
            let req = self.prepare(op, table, Payload::Row(query.clone()), page_options);
            let (mut rows, info) = self.run(req).await?;

            if let Some(limit) = limit {
                let remaining = limit.saturating_sub(delivered);
                rows.truncate(remaining as usize);
            }
            let page_len = rows.len() as u64;

            match mode {
                ScanMode::Batch => consumer.batch(rows).await?,
                ScanMode::Rows => {
                    for row in rows {
                        consumer.row(row).await?;
                    }
                }
                ScanMode::Concurrent(bound) => {
                    deliver_concurrent(&consumer, rows, bound.max(1)).await?;
                }
            }
            delivered += page_len;

            token = info.next_token;
            if token.is_none() || limit.is_some_and(|l| delivered >= l) {
                break;
            }
            if let Some(capacity) = &capacity {
                // Pace by rows read; every page costs at least one unit.
                capacity.check(page_len.max(1) as f64).await;
            }
        }
        debug!(table, rows = delivered, "scan finished");
        Ok(delivered)
    }
}

/// Feed rows to the consumer with at most `bound` in flight.
async fn deliver_concurrent(
    consumer: &Arc<dyn ScanConsumer>,
    rows: Vec<Row>,
    bound: usize,
) -> Result<(), DbError> {
    let mut tasks: JoinSet<Result<(), DbError>> = JoinSet::new();
    let mut failed = None;
    for row in rows {
        while tasks.len() >= bound {
            if let Some(result) = tasks.join_next().await {
                collect(result, &mut failed);
            }
        }
        if failed.is_some() {
            break;
        }
        let consumer = Arc::clone(consumer);
        tasks.spawn(async move { consumer.row(row).await });
    }
    while let Some(result) = tasks.join_next().await {
        collect(result, &mut failed);
    }
    match failed {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn collect(
    result: Result<Result<(), DbError>, tokio::task::JoinError>,
    failed: &mut Option<DbError>,
) {
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(join) => Err(DbError::DriverError(format!("scan consumer panicked: {join}"))),
    };
    if let Err(err) = outcome {
        failed.get_or_insert(err);
    }
}
