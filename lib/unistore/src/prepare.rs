//! Query preparer and row-transformation engine.
//!
//! `prepare` turns a verb + table + object + options into a normalized
//! `Request`: it resolves the pool, lets the driver alias the table, then
//! runs the operation-specific column pass (pre-hooks, custom-column
//! admission, visibility filtering, type coercion, validation, generated
//! values, post-processing, column joins).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use serde_json::{Value, json};

use crate::column::{ColumnDef, ColumnType};
use crate::db::Db;
use crate::driver::{Op, Payload, Request, Row};
use crate::error::DbError;
use crate::hooks::HookAction;
use crate::join::join_columns;
use crate::options::QueryOptions;
use crate::registry::DbPool;

impl Db {
    /// Build a prepared request for the pipeline. Preparation failures are
    /// captured on the request and short-circuit execution.
    pub(crate) fn prepare(
        &self,
        op: Op,
        table: &str,
        obj: Payload,
        options: QueryOptions,
    ) -> Request {
        let pool = self.pools.get_pool(table, &options);
        let resolved = pool.driver.resolve_table(op, table, &obj, &options);
        let mut req = Request::new(op, resolved, obj, options);
        req.pool = pool.name.clone();
        if let Err(err) = self.prepare_row(&pool, &mut req) {
            req.error = Some(err);
            return req;
        }
        if !req.done {
            pool.driver.prepare_row(&mut req);
            if let Err(err) = pool.driver.prepare(&mut req) {
                req.error = Some(err);
            }
        }
        req
    }

    fn prepare_row(&self, pool: &Arc<DbPool>, req: &mut Request) -> Result<(), DbError> {
        // Raw backend text passes through untouched.
        if matches!(req.obj, Payload::Text(_)) {
            return Ok(());
        }
        match req.op {
            Op::Create | Op::Upgrade | Op::Drop | Op::Bulk => return Ok(()),
            _ => {}
        }

        let (columns, keys) = self.effective_schema(pool, &req.table);
        let strict = req
            .options
            .strict_types
            .unwrap_or_else(|| pool.strict_types());

        match req.op {
            Op::List => return self.prepare_list(req, &columns, &keys),
            _ => {}
        }

        // Single-row operations from here on.
        let mut row = match std::mem::take(&mut req.obj) {
            Payload::Row(row) => row,
            Payload::None => Row::new(),
            Payload::Rows(_) => {
                return Err(DbError::Validation {
                    table: req.table.clone(),
                    column: String::new(),
                    message: format!("{} expects a single object", req.op.name()),
                });
            }
            Payload::Text(_) => unreachable!(),
        };

        if self.hooks.run_pre(req.op, &req.table, &mut row) == HookAction::Drop {
            req.done = true;
            return Ok(());
        }

        let columns = self.admit_custom(&row, columns);
        let original = row.clone();

        let result = match req.op {
            Op::Add | Op::Put | Op::Update | Op::Incr => {
                self.prepare_mutation(req, &mut row, &original, &columns, strict)
            }
            Op::Del => {
                self.filter_present(req, &mut row, &columns, strict, false);
                join_columns(&mut row, &original, &columns, &req.options.ops);
                Ok(())
            }
            Op::Get | Op::Select | Op::Search => {
                self.prepare_select(req, &mut row, &original, &columns, &keys, strict)
            }
            _ => Ok(()),
        };
        req.obj = Payload::Row(row);
        result
    }

    /// Schema columns merged with introspected pool metadata.
    pub(crate) fn effective_schema(
        &self,
        pool: &Arc<DbPool>,
        table: &str,
    ) -> (HashMap<String, ColumnDef>, Vec<String>) {
        if let Some(table_def) = self.schema.table(table) {
            return (table_def.columns.clone(), table_def.keys.clone());
        }
        if let Some(meta) = pool.table_meta(table) {
            return (meta.columns, meta.keys);
        }
        (HashMap::new(), Vec::new())
    }

    /// Admit input properties not in the schema through the custom-column
    /// pattern table.
    fn admit_custom(
        &self,
        row: &Row,
        mut columns: HashMap<String, ColumnDef>,
    ) -> HashMap<String, ColumnDef> {
        let patterns = self.custom_columns.read();
        if patterns.is_empty() {
            return columns;
        }
        for name in row.keys() {
            if columns.contains_key(name) || name.starts_with('$') {
                continue;
            }
            if let Some((_, ctype)) = patterns.iter().find(|(re, _)| re.is_match(name)) {
                columns.insert(name.clone(), ColumnDef::typed(*ctype));
            }
        }
        columns
    }

    /// Shared present-property filter: visibility, type coercion, length,
    /// allowed values, not-empty substitution.
    fn filter_present(
        &self,
        req: &Request,
        row: &mut Row,
        columns: &HashMap<String, ColumnDef>,
        strict: bool,
        validate: bool,
    ) {
        let names: Vec<String> = row.keys().cloned().collect();
        for name in names {
            if name.starts_with('$') {
                continue;
            }
            let Some(col) = columns.get(&name) else {
                if !req.options.no_columns {
                    row.remove(&name);
                }
                continue;
            };
            if col.is_hidden() || (col.is_restricted() && !req.options.admin) {
                row.remove(&name);
                continue;
            }
            if strict {
                if let Some(value) = row.get_mut(&name) {
                    coerce(value, col.semantic_type());
                }
            }
            if !validate {
                continue;
            }
            if let Some(max) = col.max_length {
                if let Some(Value::String(s)) = row.get_mut(&name) {
                    if s.chars().count() > max {
                        *s = s.chars().take(max).collect();
                    }
                }
            }
            if let Some(allowed) = &col.values {
                if let Some(value) = row.get(&name) {
                    if !allowed.contains(value) {
                        row.remove(&name);
                        continue;
                    }
                }
            }
            if col.not_empty.unwrap_or(false) && is_empty(row.get(&name)) {
                match &col.value {
                    Some(default) => {
                        row.insert(name.clone(), default.clone());
                    }
                    None => {
                        row.remove(&name);
                    }
                }
            }
        }
    }

    /// Update-family pass: add/put/update/incr.
    fn prepare_mutation(
        &self,
        req: &Request,
        row: &mut Row,
        original: &Row,
        columns: &HashMap<String, ColumnDef>,
        strict: bool,
    ) -> Result<(), DbError> {
        self.filter_present(req, row, columns, strict, true);

        for (name, col) in columns {
            // readonly columns are written once at insert; writeonly only on
            // update.
            if req.op.is_update() && col.is_readonly() {
                row.remove(name);
                continue;
            }
            if req.op.is_insert() && col.is_writeonly() {
                row.remove(name);
                continue;
            }

            let present = row.get(name).is_some_and(|v| !v.is_null());
            if !present {
                if req.op.is_insert() {
                    if let Some(generated) = generate(col, &req.options) {
                        row.insert(name.clone(), generated);
                    } else if let Some(default) = &col.value {
                        row.insert(name.clone(), default.clone());
                    } else if col.is_counter() {
                        row.insert(name.clone(), json!(0));
                    }
                } else if col.now.unwrap_or(false) {
                    // Modification timestamps refresh on update too.
                    row.insert(name.clone(), json!(Utc::now().timestamp_millis()));
                }
            }

            if req.op == Op::Add
                && col.not_empty.unwrap_or(false)
                && is_empty(row.get(name))
            {
                return Err(DbError::Validation {
                    table: req.table.clone(),
                    column: name.clone(),
                    message: "required column missing".to_string(),
                });
            }

            if let Some(value) = row.get_mut(name) {
                postprocess(value, col);
            }
        }

        join_columns(row, original, columns, &req.options.ops);
        Ok(())
    }

    /// Select/search/get pass: filter to known columns, coerce, expand
    /// list-typed operators, join composite lookup keys.
    fn prepare_select(
        &self,
        req: &mut Request,
        row: &mut Row,
        original: &Row,
        columns: &HashMap<String, ColumnDef>,
        keys: &[String],
        strict: bool,
    ) -> Result<(), DbError> {
        self.filter_present(req, row, columns, strict, false);

        for (name, op) in &req.options.ops {
            if !op.takes_list() {
                continue;
            }
            if let Some(value) = row.get_mut(name) {
                if !value.is_array() {
                    let scalar = value.take();
                    *value = Value::Array(vec![scalar]);
                }
            }
        }

        join_columns(row, original, columns, &req.options.ops);

        if req.op == Op::Get {
            for key in keys {
                if is_empty(row.get(key)) {
                    return Err(DbError::Validation {
                        table: req.table.clone(),
                        column: key.clone(),
                        message: "required key column missing".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// List pass: keep only typed primary-key columns, drop incomplete rows.
    fn prepare_list(
        &self,
        req: &mut Request,
        columns: &HashMap<String, ColumnDef>,
        keys: &[String],
    ) -> Result<(), DbError> {
        let rows = match std::mem::take(&mut req.obj) {
            Payload::Rows(rows) => rows,
            Payload::Row(row) => vec![row],
            _ => Vec::new(),
        };
        if keys.is_empty() {
            req.obj = Payload::Rows(Vec::new());
            req.done = true;
            return Ok(());
        }
        let mut prepared = Vec::with_capacity(rows.len());
        'rows: for row in rows {
            let mut key_row = Row::new();
            for key in keys {
                let Some(mut value) = row.get(key).cloned() else {
                    continue 'rows;
                };
                if let Some(col) = columns.get(key) {
                    coerce(&mut value, col.semantic_type());
                }
                if value.is_null() {
                    continue 'rows;
                }
                key_row.insert(key.clone(), value);
            }
            prepared.push(key_row);
        }
        if prepared.is_empty() {
            req.done = true;
        }
        req.obj = Payload::Rows(prepared);
        Ok(())
    }
}

fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        _ => false,
    }
}

/// Generated-value policy, insert only. Explicit caller values always win;
/// the caller checked absence before calling.
fn generate(col: &ColumnDef, options: &QueryOptions) -> Option<Value> {
    match col.semantic_type() {
        ColumnType::Uuid => return Some(json!(uuid::Uuid::new_v4().simple().to_string())),
        ColumnType::Tuid => {
            let suffix: u16 = rand::random();
            return Some(json!(format!(
                "{:012x}{:04x}",
                Utc::now().timestamp_millis(),
                suffix
            )));
        }
        ColumnType::Sid => {
            let id: String = rand::thread_rng()
                .sample_iter(rand::distributions::Alphanumeric)
                .take(8)
                .map(char::from)
                .collect();
            return Some(json!(id.to_lowercase()));
        }
        _ => {}
    }
    if col.uid.unwrap_or(false) {
        return options.user_id.as_ref().map(|id| json!(id));
    }
    if col.now.unwrap_or(false) {
        return Some(json!(Utc::now().timestamp_millis()));
    }
    if let Some(ttl) = col.ttl {
        return Some(json!(Utc::now().timestamp() + ttl as i64));
    }
    if col.random.unwrap_or(false) {
        return Some(json!(rand::random::<f64>()));
    }
    None
}

/// Numeric and string post-processing for a present value.
fn postprocess(value: &mut Value, col: &ColumnDef) {
    if let Some(number) = value.as_f64() {
        let mut number = number;
        if let Some(multiplier) = col.multiplier {
            number *= multiplier;
        }
        if let Some(increment) = col.increment {
            number += increment;
        }
        if let Some(decimals) = col.decimals {
            let scale = 10f64.powi(decimals as i32);
            number = (number * scale).round() / scale;
        }
        if col.multiplier.is_some() || col.increment.is_some() || col.decimals.is_some() {
            if number.fract() == 0.0 && matches!(col.semantic_type(), ColumnType::Counter) {
                *value = json!(number as i64);
            } else {
                *value = json!(number);
            }
        }
        return;
    }
    if let Value::String(s) = value {
        if let Some(strip) = &col.strip {
            s.retain(|c| !strip.contains(c));
        }
        if col.trim.unwrap_or(false) {
            *s = s.trim().to_string();
        }
        if let Some(word) = col.word {
            *s = s
                .split_whitespace()
                .nth(word)
                .unwrap_or_default()
                .to_string();
        }
        if col.lower.unwrap_or(false) {
            *s = s.to_lowercase();
        } else if col.upper.unwrap_or(false) {
            *s = s.to_uppercase();
        }
    }
}

/// Coerce a value to the column's semantic type. Unconvertible values are
/// left alone; the driver has the final say at bind time.
pub(crate) fn coerce(value: &mut Value, ctype: ColumnType) {
    match ctype {
        ColumnType::Text | ColumnType::Uuid | ColumnType::Tuid | ColumnType::Sid => {
            match value {
                Value::Number(n) => *value = Value::String(n.to_string()),
                Value::Bool(b) => *value = Value::String(b.to_string()),
                _ => {}
            }
        }
        ColumnType::Number | ColumnType::Counter => match value {
            Value::String(s) => {
                if let Ok(n) = s.parse::<i64>() {
                    *value = json!(n);
                } else if let Ok(n) = s.parse::<f64>() {
                    *value = json!(n);
                }
            }
            Value::Bool(b) => *value = json!(if *b { 1 } else { 0 }),
            _ => {}
        },
        ColumnType::Bool => match value {
            Value::String(s) => {
                let truthy = matches!(s.as_str(), "true" | "1" | "yes");
                *value = Value::Bool(truthy);
            }
            Value::Number(n) => *value = Value::Bool(n.as_f64().unwrap_or(0.0) != 0.0),
            _ => {}
        },
        ColumnType::Date => {
            if let Value::String(s) = value {
                if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(s) {
                    *value = json!(parsed.timestamp_millis());
                } else if let Ok(n) = s.parse::<i64>() {
                    *value = json!(n);
                }
            }
        }
        ColumnType::List | ColumnType::Set => {
            if !value.is_array() {
                let scalar = value.take();
                *value = Value::Array(vec![scalar]);
            }
        }
        ColumnType::Json | ColumnType::GeoPoint => {}
    }
}
