//! Merged table definitions: columns, primary keys, secondary indexes.
//!
//! The registry is consulted on every single-row operation, so lookups hand
//! out `Arc<Table>` snapshots under a read lock; `describe_tables` is the
//! only writer and recomputes derived key/index lists for the tables it
//! touches.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::column::ColumnDef;

/// A table definition with derived key and index lists.
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub columns: HashMap<String, ColumnDef>,
    /// Primary-key columns, ordered by each column's `primary` value.
    pub keys: Vec<String>,
    /// Index name to ordered column list.
    pub indexes: BTreeMap<String, Vec<String>>,
}

impl Table {
    /// Recompute the derived key and index lists from the column set.
    ///
    /// Ordering is by the declared `primary`/index position, with the column
    /// name as tie-breaker so repeated computation is stable.
    fn recompute(&mut self) {
        let mut keys: Vec<(u32, &String)> = self
            .columns
            .iter()
            .filter_map(|(name, col)| col.primary.map(|p| (p, name)))
            .collect();
        keys.sort();
        self.keys = keys.into_iter().map(|(_, name)| name.clone()).collect();

        let mut indexes: BTreeMap<String, Vec<(u32, String)>> = BTreeMap::new();
        for (name, col) in &self.columns {
            for (index, order) in &col.indexes {
                indexes
                    .entry(index.clone())
                    .or_default()
                    .push((*order, name.clone()));
            }
        }
        self.indexes = indexes
            .into_iter()
            .map(|(index, mut cols)| {
                cols.sort();
                (index, cols.into_iter().map(|(_, name)| name).collect())
            })
            .collect();
    }
}

/// Process-scoped registry of merged table definitions.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    tables: RwLock<HashMap<String, Arc<Table>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge column definitions into the registry.
    ///
    /// Columns redefined by multiple contributors merge per attribute (last
    /// writer wins); derived keys and indexes are recomputed for every
    /// affected table.
    pub fn describe_tables(&self, defs: HashMap<String, HashMap<String, ColumnDef>>) {
        let mut tables = self.tables.write();
        for (table, columns) in defs {
            let entry = tables.entry(table).or_default();
            let mut updated = Table::clone(entry);
            for (name, def) in columns {
                updated.columns.entry(name).or_default().merge(&def);
            }
            updated.recompute();
            *entry = Arc::new(updated);
        }
    }

    /// Snapshot of a table definition, `None` if unknown.
    pub fn table(&self, table: &str) -> Option<Arc<Table>> {
        self.tables.read().get(table).cloned()
    }

    /// Column definitions for a table, empty if unknown.
    pub fn columns(&self, table: &str) -> HashMap<String, ColumnDef> {
        self.table(table)
            .map(|t| t.columns.clone())
            .unwrap_or_default()
    }

    /// Ordered primary-key column list, empty if unknown.
    pub fn keys(&self, table: &str) -> Vec<String> {
        self.table(table).map(|t| t.keys.clone()).unwrap_or_default()
    }

    /// Index name to ordered column list, empty if unknown.
    pub fn indexes(&self, table: &str) -> BTreeMap<String, Vec<String>> {
        self.table(table)
            .map(|t| t.indexes.clone())
            .unwrap_or_default()
    }

    /// Select the index whose ordered column list has the longest
    /// left-to-right contiguous prefix present in `keys`; ties break toward
    /// the index with the most matched columns overall.
    pub fn index_for_keys(&self, table: &str, keys: &[&str]) -> Option<String> {
        let table = self.table(table)?;
        let mut best: Option<(usize, usize, &String)> = None;
        for (name, cols) in &table.indexes {
            let prefix = cols
                .iter()
                .take_while(|c| keys.contains(&c.as_str()))
                .count();
            if prefix == 0 {
                continue;
            }
            let matched = cols.iter().filter(|c| keys.contains(&c.as_str())).count();
            let candidate = (prefix, matched, name);
            if best.map_or(true, |b| (candidate.0, candidate.1) > (b.0, b.1)) {
                best = Some(candidate);
            }
        }
        best.map(|(_, _, name)| name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::ColumnType;

    fn describe(registry: &SchemaRegistry, table: &str, cols: Vec<(&str, ColumnDef)>) {
        let mut defs = HashMap::new();
        defs.insert(
            table.to_string(),
            cols.into_iter().map(|(n, c)| (n.to_string(), c)).collect(),
        );
        registry.describe_tables(defs);
    }

    #[test]
    fn primary_keys_ordered_by_attribute_value() {
        let registry = SchemaRegistry::new();
        describe(
            &registry,
            "messages",
            vec![
                // Declared out of order on purpose
                ("mtime", ColumnDef::typed(ColumnType::Date).primary(2)),
                ("id", ColumnDef::typed(ColumnType::Uuid).primary(1)),
                ("body", ColumnDef::default()),
            ],
        );
        assert_eq!(registry.keys("messages"), vec!["id", "mtime"]);

        // Repeating the description with no new columns keeps ordering stable
        describe(
            &registry,
            "messages",
            vec![("body", ColumnDef::default())],
        );
        assert_eq!(registry.keys("messages"), vec!["id", "mtime"]);
    }

    #[test]
    fn merging_contributors_accumulates_columns() {
        let registry = SchemaRegistry::new();
        describe(&registry, "users", vec![("id", ColumnDef::default().primary(1))]);
        describe(&registry, "users", vec![("name", ColumnDef::default())]);
        let columns = registry.columns("users");
        assert_eq!(columns.len(), 2);
        assert_eq!(registry.keys("users"), vec!["id"]);
    }

    #[test]
    fn unknown_table_is_empty_not_an_error() {
        let registry = SchemaRegistry::new();
        assert!(registry.columns("missing").is_empty());
        assert!(registry.keys("missing").is_empty());
        assert!(registry.indexes("missing").is_empty());
        assert_eq!(registry.index_for_keys("missing", &["id"]), None);
    }

    #[test]
    fn index_selection_prefers_longest_contiguous_prefix() {
        let registry = SchemaRegistry::new();
        describe(
            &registry,
            "orders",
            vec![
                ("id", ColumnDef::default().primary(1).index("a", 1).index("b", 1)),
                ("status", ColumnDef::default().index("a", 2).index("b", 3)),
                ("name", ColumnDef::default().index("b", 2)),
                ("city", ColumnDef::default()),
            ],
        );
        // a: [id, status], b: [id, name, status]
        assert_eq!(
            registry.index_for_keys("orders", &["id", "name", "status"]),
            Some("b".to_string())
        );
        // No index has city; both match only id, tie breaks on matched count
        // (equal), then keeps the first seen
        assert_eq!(
            registry.index_for_keys("orders", &["id", "city"]),
            Some("a".to_string())
        );
        assert_eq!(registry.index_for_keys("orders", &["city"]), None);
    }
}
