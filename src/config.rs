//! Compiler configuration
//!
//! Knobs consulted by the compile passes. A [`CompileConfig`] is owned by the
//! compile context and never changes while a statement is being compiled.

use std::collections::BTreeMap;

/// Default depth limit for expression trees.
pub const DEFAULT_MAX_EXPR_DEPTH: u32 = 1000;

/// Default number of column cache slots.
pub const DEFAULT_COLUMN_CACHE_SIZE: usize = 10;

/// Current value of a `?N` parameter, known when the statement is
/// compiled again after a rebind
#[derive(Debug, Clone, PartialEq)]
pub enum BoundValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// Per-compilation configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileConfig {
    /// Maximum expression tree height (0 disables the check)
    pub max_expr_depth: u32,
    /// Number of (cursor, column) -> register cache slots
    pub column_cache_size: usize,
    /// Collations under which `col LIKE 'prefix%'` may become a range.
    /// The empty string stands for "no collation".
    pub like_collations: Vec<String>,
    /// LIKE compares case sensitively
    pub case_sensitive_like: bool,
    /// Merge FROM-clause subqueries into their parent
    pub enable_flattener: bool,
    /// Copy outer WHERE terms into FROM-clause subqueries
    pub enable_push_down: bool,
    /// Implement the first FROM subquery as a co-routine
    pub enable_coroutines: bool,
    /// Hoist constant expressions into the init block
    pub enable_factor_constants: bool,
    /// `SELECT count(*) FROM t` uses the table cardinality directly
    pub enable_count_fast_path: bool,
    /// Single min()/max() aggregate asks for an ordered scan
    pub enable_min_max_hint: bool,
    /// Rewrite `x=A OR x=B` into `x IN (A,B)`
    pub enable_or_to_in: bool,
    /// Rewrite `x LIKE 'abc%'` into a range
    pub enable_like_opt: bool,
    /// Attach comments to emitted instructions
    pub emit_comments: bool,
    /// Parameter values visible to the compiler, by parameter index
    pub bound_values: BTreeMap<i32, BoundValue>,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            max_expr_depth: DEFAULT_MAX_EXPR_DEPTH,
            column_cache_size: DEFAULT_COLUMN_CACHE_SIZE,
            like_collations: vec![
                "binary".to_string(),
                "unicode_ci".to_string(),
                String::new(),
            ],
            case_sensitive_like: false,
            enable_flattener: true,
            enable_push_down: true,
            enable_coroutines: true,
            enable_factor_constants: true,
            enable_count_fast_path: true,
            enable_min_max_hint: true,
            enable_or_to_in: true,
            enable_like_opt: true,
            emit_comments: true,
            bound_values: BTreeMap::new(),
        }
    }
}

impl CompileConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Is `coll` (None for "no collation") eligible for the LIKE range rewrite?
    pub fn like_collation_allowed(&self, coll: Option<&str>) -> bool {
        let name = coll.unwrap_or("");
        self.like_collations
            .iter()
            .any(|c| c.eq_ignore_ascii_case(name))
    }

    /// Text bound to parameter `index`, if any
    pub fn bound_text(&self, index: i32) -> Option<&str> {
        match self.bound_values.get(&index) {
            Some(BoundValue::Text(text)) => Some(text),
            _ => None,
        }
    }
}
