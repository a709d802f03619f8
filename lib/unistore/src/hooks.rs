//! Pre- and post-processing hooks, per table plus the "*" wildcard.
//!
//! Pre-hooks run during row preparation and may edit properties or drop the
//! row; post-hooks run on result rows and may exclude them. Hooks run in
//! registration order, table-specific before wildcard.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::driver::{Op, Row};

pub const WILDCARD: &str = "*";

/// Hook verdict for the row it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    Keep,
    Drop,
}

pub type Hook = Arc<dyn Fn(Op, &str, &mut Row) -> HookAction + Send + Sync>;

#[derive(Default)]
pub struct HookRegistry {
    pre: RwLock<HashMap<String, Vec<Hook>>>,
    post: RwLock<HashMap<String, Vec<Hook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_pre(&self, table: impl Into<String>, hook: Hook) {
        self.pre.write().entry(table.into()).or_default().push(hook);
    }

    pub fn register_post(&self, table: impl Into<String>, hook: Hook) {
        self.post.write().entry(table.into()).or_default().push(hook);
    }

    pub fn run_pre(&self, op: Op, table: &str, row: &mut Row) -> HookAction {
        Self::run(&self.pre, op, table, row)
    }

    pub fn run_post(&self, op: Op, table: &str, row: &mut Row) -> HookAction {
        Self::run(&self.post, op, table, row)
    }

    fn run(
        hooks: &RwLock<HashMap<String, Vec<Hook>>>,
        op: Op,
        table: &str,
        row: &mut Row,
    ) -> HookAction {
        let hooks = hooks.read();
        for scope in [table, WILDCARD] {
            if let Some(list) = hooks.get(scope) {
                for hook in list {
                    if hook(op, table, row) == HookAction::Drop {
                        return HookAction::Drop;
                    }
                }
            }
        }
        HookAction::Keep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hooks_run_in_registration_order_table_first() {
        let registry = HookRegistry::new();
        registry.register_pre(
            "users",
            Arc::new(|_, _, row: &mut Row| {
                row.insert("first".into(), json!(1));
                HookAction::Keep
            }),
        );
        registry.register_pre(
            WILDCARD,
            Arc::new(|_, _, row: &mut Row| {
                // Wildcard sees the table hook's edit
                assert!(row.contains_key("first"));
                row.insert("second".into(), json!(2));
                HookAction::Keep
            }),
        );

        let mut row = Row::new();
        assert_eq!(registry.run_pre(Op::Put, "users", &mut row), HookAction::Keep);
        assert!(row.contains_key("second"));
    }

    #[test]
    fn drop_short_circuits() {
        let registry = HookRegistry::new();
        registry.register_pre("users", Arc::new(|_, _, _: &mut Row| HookAction::Drop));
        registry.register_pre(
            "users",
            Arc::new(|_, _, _: &mut Row| {
                unreachable!("must not run after a drop")
            }),
        );
        let mut row = Row::new();
        assert_eq!(registry.run_pre(Op::Put, "users", &mut row), HookAction::Drop);
    }
}
