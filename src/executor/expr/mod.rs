//! Expression analysis and code generation

pub mod analyze;
pub mod cache;
pub mod codegen;
pub mod collate;
pub mod in_op;
pub mod types;

pub use codegen::CodeListFlags;
pub use collate::{binary_compare_coll, expr_coll, ExprColl};
pub use in_op::{InIndex, InIndexFlags, InIndexKind};
pub use types::expr_type;
