//! Composite-value assembly: join and unjoin of sibling columns.
//!
//! A column declared with `join: [a, b, ...]` is synthesized by
//! concatenating the original (pre-preparation) values of its constituents
//! with a separator. Reads split the composite back apart, into the `unjoin`
//! list when one is declared, otherwise into the `join` constituents.
//!
//! Partial-join policy, pinned by the tests below:
//! - default: truncate at the first missing constituent;
//! - `join_strict`: skip the join unless every constituent is present;
//! - `join_all`: join whatever is present, collapsing holes;
//! - under a range/prefix operator, a hole anywhere but the trailing
//!   position voids the join entirely.

use std::collections::HashMap;

use serde_json::Value;

use crate::column::ColumnDef;
use crate::driver::Row;
use crate::options::FilterOp;

/// Stringify a constituent value; non-scalar and empty values are holes.
fn piece(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    }
}

fn assemble(col: &ColumnDef, pieces: &[Option<String>], ordered: bool) -> Option<String> {
    let strict = col.join_strict.unwrap_or(false);
    let all = col.join_all.unwrap_or(false);

    if strict && pieces.iter().any(Option::is_none) {
        return None;
    }
    if ordered {
        // A hole followed by a present piece voids the join.
        let last_present = pieces.iter().rposition(Option::is_some)?;
        if pieces[..last_present].iter().any(Option::is_none) {
            return None;
        }
    }

    let values: Vec<&String> = if all {
        pieces.iter().flatten().collect()
    } else {
        pieces
            .iter()
            .take_while(|p| p.is_some())
            .flatten()
            .collect()
    };
    if values.is_empty() {
        return None;
    }
    Some(
        values
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(col.separator()),
    )
}

/// Synthesize every join column of `columns` into `row`, reading constituent
/// values from `original` (the row as the caller supplied it).
pub fn join_columns(
    row: &mut Row,
    original: &Row,
    columns: &HashMap<String, ColumnDef>,
    ops: &HashMap<String, FilterOp>,
) {
    for (name, col) in columns {
        let Some(parts) = &col.join else { continue };
        if parts.is_empty() {
            continue;
        }
        let separator = col.separator();
        let force = col.join_force.unwrap_or(false);
        if col.join_ifempty.unwrap_or(false) {
            if let Some(Value::String(existing)) = row.get(name) {
                if !existing.is_empty() {
                    continue;
                }
            }
        }
        if !force {
            // An existing value that already looks joined is left alone.
            if let Some(Value::String(existing)) = row.get(name) {
                if existing.contains(separator) {
                    continue;
                }
            }
        }
        let ordered = ops.get(name).is_some_and(|op| op.is_ordering());
        let pieces: Vec<Option<String>> = parts.iter().map(|p| piece(original.get(p))).collect();
        if let Some(joined) = assemble(col, &pieces, ordered) {
            row.insert(name.clone(), Value::String(joined));
        }
    }
}

/// Split every composite column of `columns` back into its named siblings.
/// An explicit `unjoin` list wins; a column that only declares `join` splits
/// back into the same constituents. The synthetic column is removed unless
/// marked to keep.
pub fn unjoin_columns(row: &mut Row, columns: &HashMap<String, ColumnDef>) {
    for (name, col) in columns {
        let Some(parts) = col.unjoin.as_ref().or(col.join.as_ref()) else {
            continue;
        };
        if parts.is_empty() {
            continue;
        }
        let Some(Value::String(joined)) = row.get(name) else {
            continue;
        };
        let pieces: Vec<String> = joined
            .split(col.separator())
            .map(str::to_string)
            .collect();
        for (part, value) in parts.iter().zip(pieces) {
            row.insert(part.clone(), Value::String(value));
        }
        if !col.keep_joined.unwrap_or(false) {
            row.remove(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn columns(col: ColumnDef) -> HashMap<String, ColumnDef> {
        let mut map = HashMap::new();
        map.insert("key".to_string(), col);
        map
    }

    fn join_col() -> ColumnDef {
        ColumnDef::default().joined(vec!["type".into(), "id".into()])
    }

    fn row(entries: &[(&str, serde_json::Value)]) -> Row {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn join_then_unjoin_round_trips() {
        for separator in ["|", ":", "#"] {
            let mut col = join_col();
            col.separator = Some(separator.to_string());

            let original = row(&[("type", json!("msg")), ("id", json!("42"))]);
            let mut prepared = original.clone();
            join_columns(&mut prepared, &original, &columns(col.clone()), &HashMap::new());
            assert_eq!(
                prepared.get("key"),
                Some(&json!(format!("msg{separator}42")))
            );

            let mut col = col;
            col.unjoin = Some(vec!["type".into(), "id".into()]);
            let mut result = row(&[("key", prepared["key"].clone())]);
            unjoin_columns(&mut result, &columns(col));
            assert_eq!(result.get("type"), Some(&json!("msg")));
            assert_eq!(result.get("id"), Some(&json!("42")));
            assert!(!result.contains_key("key"));
        }
    }

    #[test]
    fn default_truncates_at_first_hole() {
        let col = ColumnDef::default().joined(vec!["a".into(), "b".into(), "c".into()]);
        let original = row(&[("a", json!("1")), ("c", json!("3"))]);
        let mut prepared = original.clone();
        join_columns(&mut prepared, &original, &columns(col), &HashMap::new());
        assert_eq!(prepared.get("key"), Some(&json!("1")));
    }

    #[test]
    fn strict_requires_all_constituents() {
        let mut col = join_col();
        col.join_strict = Some(true);
        let original = row(&[("type", json!("msg"))]);
        let mut prepared = original.clone();
        join_columns(&mut prepared, &original, &columns(col), &HashMap::new());
        assert!(!prepared.contains_key("key"));
    }

    #[test]
    fn join_all_collapses_holes() {
        let mut col = ColumnDef::default().joined(vec!["a".into(), "b".into(), "c".into()]);
        col.join_all = Some(true);
        let original = row(&[("a", json!("1")), ("c", json!("3"))]);
        let mut prepared = original.clone();
        join_columns(&mut prepared, &original, &columns(col), &HashMap::new());
        assert_eq!(prepared.get("key"), Some(&json!("1|3")));
    }

    #[test]
    fn ordering_operator_voids_non_trailing_hole() {
        let col = ColumnDef::default().joined(vec!["a".into(), "b".into(), "c".into()]);
        let mut ops = HashMap::new();
        ops.insert("key".to_string(), FilterOp::BeginsWith);

        // Trailing hole truncates
        let original = row(&[("a", json!("1")), ("b", json!("2"))]);
        let mut prepared = original.clone();
        join_columns(&mut prepared, &original, &columns(col.clone()), &ops);
        assert_eq!(prepared.get("key"), Some(&json!("1|2")));

        // Hole before a present piece voids the join
        let original = row(&[("a", json!("1")), ("c", json!("3"))]);
        let mut prepared = original.clone();
        join_columns(&mut prepared, &original, &columns(col), &ops);
        assert!(!prepared.contains_key("key"));
    }

    #[test]
    fn existing_joined_value_kept_unless_forced() {
        let col = join_col();
        let original = row(&[
            ("key", json!("old|7")),
            ("type", json!("new")),
            ("id", json!("8")),
        ]);
        let mut prepared = original.clone();
        join_columns(&mut prepared, &original, &columns(col.clone()), &HashMap::new());
        assert_eq!(prepared.get("key"), Some(&json!("old|7")));

        let mut forced = col;
        forced.join_force = Some(true);
        let mut prepared = original.clone();
        join_columns(&mut prepared, &original, &columns(forced), &HashMap::new());
        assert_eq!(prepared.get("key"), Some(&json!("new|8")));
    }

    #[test]
    fn ifempty_skips_populated_column() {
        let mut col = join_col();
        col.join_ifempty = Some(true);
        let original = row(&[
            ("key", json!("set")),
            ("type", json!("msg")),
            ("id", json!("42")),
        ]);
        let mut prepared = original.clone();
        join_columns(&mut prepared, &original, &columns(col), &HashMap::new());
        assert_eq!(prepared.get("key"), Some(&json!("set")));
    }

    #[test]
    fn join_declared_column_unjoins_by_default() {
        let mut result = row(&[("key", json!("msg|42"))]);
        unjoin_columns(&mut result, &columns(join_col()));
        assert_eq!(result.get("type"), Some(&json!("msg")));
        assert_eq!(result.get("id"), Some(&json!("42")));
        assert!(!result.contains_key("key"));
    }

    #[test]
    fn keep_joined_preserves_synthetic_column() {
        let mut col = ColumnDef::default();
        col.unjoin = Some(vec!["type".into(), "id".into()]);
        col.keep_joined = Some(true);
        let mut result = row(&[("key", json!("msg|42"))]);
        unjoin_columns(&mut result, &columns(col));
        assert_eq!(result.get("type"), Some(&json!("msg")));
        assert!(result.contains_key("key"));
    }
}
