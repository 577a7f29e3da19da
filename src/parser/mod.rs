//! Resolved syntax trees handed to the compiler, and walkers over them

pub mod ast;
pub mod walker;
