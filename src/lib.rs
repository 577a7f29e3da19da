//! rustql-select - SELECT compiler for a register-based virtual machine
//!
//! Takes resolved SELECT trees and produces VDBE programs: expression code
//! generation with a column cache, WHERE-clause analysis, subquery
//! flattening, aggregate and compound-select code generation.

pub mod config;
pub mod error;
pub mod executor;
pub mod functions;
pub mod parser;
pub mod schema;
pub mod types;
pub mod vdbe;

// Re-export main public types
pub use config::{BoundValue, CompileConfig};
pub use error::{Error, ErrorCode, Result};
pub use executor::parse::Parse;
pub use executor::select::{compile_select, sql_select, SelectDest, SelectDestKind};
pub use vdbe::builder::Program;
