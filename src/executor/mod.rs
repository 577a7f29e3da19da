//! Query compilation: expressions, WHERE analysis and SELECT

pub mod expr;
pub mod parse;
pub mod select;
pub mod where_clause;
pub mod where_expr;
pub mod wherecode;

pub use parse::Parse;
pub use select::{sql_select, SelectDest, SelectDestKind};
pub use where_clause::{WhereClause, WhereTerm, WhereTermFlags};
pub use wherecode::{where_begin, where_end, WhereInfo};
