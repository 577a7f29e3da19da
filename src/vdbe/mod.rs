//! Virtual Database Engine (VDBE) program representation

pub mod builder;
pub mod ops;

pub use builder::{ColumnMeta, Program, VdbeBuilder};
pub use ops::{cmp_flags, KeyInfo, KeyPart, Opcode, VdbeOp, P4};
