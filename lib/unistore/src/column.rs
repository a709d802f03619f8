//! Column definitions and the per-attribute merge rule.
//!
//! Columns are merged, never replaced: redefining a column overlays the
//! attributes it sets and leaves the rest alone. Every attribute is an
//! explicit field so that adding one is a compile-time-visible change,
//! never a silent deep-merge of arbitrary keys.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Semantic column type tag.
///
/// Drivers translate these to backend-native types; the row pipeline uses
/// them for coercion and for generated values (uuid/tuid/sid are generated
/// on insert when absent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    #[default]
    Text,
    Number,
    Counter,
    Bool,
    /// Stored as epoch milliseconds.
    Date,
    /// Generated 32-char lowercase hex identifier.
    Uuid,
    /// Time-ordered identifier: hex millis plus random suffix.
    Tuid,
    /// Short random alphanumeric identifier.
    Sid,
    Json,
    List,
    Set,
    GeoPoint,
}

/// Per-table, per-field column definition.
///
/// Mergeable attributes are `Option`: a later `describe_tables` call wins
/// per attribute it sets, and absence never clears an earlier setting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnDef {
    #[serde(rename = "type")]
    pub ctype: Option<ColumnType>,
    /// Participates in the primary key; the value is the sort position.
    pub primary: Option<u32>,
    /// Named secondary indexes this column participates in, with position.
    pub indexes: BTreeMap<String, u32>,

    // Composite-value assembly (see join module)
    pub join: Option<Vec<String>>,
    pub unjoin: Option<Vec<String>>,
    pub separator: Option<String>,
    pub join_ifempty: Option<bool>,
    pub join_strict: Option<bool>,
    pub join_all: Option<bool>,
    pub join_force: Option<bool>,
    /// Keep the synthetic column in results after unjoin.
    pub keep_joined: Option<bool>,

    // Generated-value policy
    /// Fill with epoch millis on insert and update when absent.
    pub now: Option<bool>,
    pub random: Option<bool>,
    /// Expiry column: filled with now + ttl seconds on insert.
    pub ttl: Option<u64>,
    /// Default value filled on insert when the column is absent.
    pub value: Option<Value>,
    /// Fill with the calling user id on insert.
    pub uid: Option<bool>,

    // Visibility and mutability policy
    pub public: Option<bool>,
    pub secure: Option<bool>,
    pub admin: Option<bool>,
    pub readonly: Option<bool>,
    pub writeonly: Option<bool>,
    pub hidden: Option<bool>,

    // Validation
    pub max_length: Option<usize>,
    pub not_empty: Option<bool>,
    /// Allowed-values list; other values are dropped.
    pub values: Option<Vec<Value>>,

    // Numeric post-processing
    pub multiplier: Option<f64>,
    pub increment: Option<f64>,
    pub decimals: Option<u32>,

    // String post-processing
    pub trim: Option<bool>,
    pub lower: Option<bool>,
    pub upper: Option<bool>,
    /// Characters to remove.
    pub strip: Option<String>,
    /// Extract the nth whitespace-separated word (0-based).
    pub word: Option<usize>,
}

macro_rules! overlay {
    ($self:ident, $other:ident, $($field:ident),+ $(,)?) => {
        $(if $other.$field.is_some() {
            $self.$field = $other.$field.clone();
        })+
    };
}

impl ColumnDef {
    pub fn typed(ctype: ColumnType) -> Self {
        ColumnDef {
            ctype: Some(ctype),
            ..Default::default()
        }
    }

    pub fn primary(mut self, order: u32) -> Self {
        self.primary = Some(order);
        self
    }

    pub fn index(mut self, name: impl Into<String>, order: u32) -> Self {
        self.indexes.insert(name.into(), order);
        self
    }

    pub fn joined(mut self, columns: Vec<String>) -> Self {
        self.join = Some(columns);
        self
    }

    /// Overlay `other` onto `self`, attribute by attribute.
    pub fn merge(&mut self, other: &ColumnDef) {
        overlay!(
            self, other, ctype, primary, join, unjoin, separator, join_ifempty, join_strict,
            join_all, join_force, keep_joined, now, random, ttl, value, uid, public,
            secure, admin, readonly, writeonly, hidden, max_length, not_empty, values, multiplier,
            increment, decimals, trim, lower, upper, strip, word,
        );
        for (name, order) in &other.indexes {
            self.indexes.insert(name.clone(), *order);
        }
    }

    pub fn semantic_type(&self) -> ColumnType {
        self.ctype.unwrap_or_default()
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden.unwrap_or(false)
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly.unwrap_or(false)
    }

    pub fn is_writeonly(&self) -> bool {
        self.writeonly.unwrap_or(false)
    }

    /// Columns only an admin caller may read or write.
    pub fn is_restricted(&self) -> bool {
        self.secure.unwrap_or(false) || self.admin.unwrap_or(false)
    }

    pub fn is_counter(&self) -> bool {
        self.semantic_type() == ColumnType::Counter
    }

    pub fn separator(&self) -> &str {
        self.separator.as_deref().unwrap_or("|")
    }
}
