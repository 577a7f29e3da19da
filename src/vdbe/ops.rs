//! VDBE Opcodes and Instructions
//!
//! The instruction set emitted by the compiler. Execution semantics belong
//! to the virtual machine; the comments here only describe operand usage.

use std::fmt;
use std::sync::Arc;

use crate::schema::{collation::collation_name, CollId, COLL_NONE};
use crate::types::{FieldType, SortOrder};

// ============================================================================
// Opcode Definitions
// ============================================================================

/// VDBE opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // ========================================================================
    // Control Flow
    // ========================================================================
    /// Do nothing
    Noop = 0,

    /// Program entry: jump to P2 (the constant initialization block)
    Init,

    /// Stop. P1 is the status, non-zero with a diagnostic set by SetDiag
    Halt,

    /// Record diagnostic P4 for a following Halt
    SetDiag,

    /// Unconditional jump to P2
    Goto,

    /// Store return address in r[P1], jump to P2
    Gosub,

    /// Jump to the address held in r[P1]
    Return,

    /// Set up co-routine: r[P1] = P3 - 1, jump to P2
    InitCoroutine,

    /// End of a co-routine: jump back to the caller of the last Yield
    EndCoroutine,

    /// Swap PC with r[P1]; on co-routine end jump to P2
    Yield,

    /// Fall through the first time, jump to P2 afterwards
    Once,

    /// Jump to P2 if r[P1] is true
    If,

    /// Jump to P2 if r[P1] is false
    IfNot,

    /// If r[P1] > 0 then r[P1] -= P3 and jump to P2
    IfPos,

    /// If r[P1] != 0, decrement it and jump to P2
    IfNotZero,

    /// Decrement r[P1], jump to P2 when it reaches zero
    DecrJumpZero,

    /// r[P2] = r[P1] + max(r[P3], 0), or -1 when r[P1] <= 0
    OffsetLimit,

    /// Make r[P1] an integer or jump to P2
    MustBeInt,

    /// Jump to P1, P2 or P3 when the last Compare was <, = or >
    Jump,

    /// Compare r[P1..P1+P3) with r[P2..P2+P3) using key P4
    Compare,

    /// Set the column permutation P4 for the next Compare
    Permutation,

    // ========================================================================
    // Register Operations
    // ========================================================================
    /// r[P2..=P3] = NULL. With P1 set the NULLs never compare equal, even
    /// under NULLEQ
    Null,

    /// r[P2] = P1
    Integer,

    /// r[P2] = P4 (64-bit integer)
    Int64,

    /// r[P2] = P4 (real)
    Real,

    /// r[P2] = P4 (string)
    String8,

    /// r[P2] = P4 (blob)
    Blob,

    /// r[P2] = boolean P1
    Bool,

    /// r[P2] = bound parameter P1
    Variable,

    /// Move r[P1..P1+P3) to r[P2..P2+P3)
    Move,

    /// Copy r[P1..=P1+P3] to r[P2..=P2+P3]
    Copy,

    /// Shallow copy r[P1] to r[P2]
    SCopy,

    /// Integer copy of r[P1] to r[P2]
    IntCopy,

    /// Output row r[P1..P1+P2)
    ResultRow,

    /// Apply types P4 to r[P1..P1+P2)
    ApplyType,

    /// Cast r[P1] to type P2
    Cast,

    // ========================================================================
    // Arithmetic and Logic
    // ========================================================================
    /// r[P3] = r[P2] + r[P1]
    Add,
    /// r[P3] = r[P2] - r[P1]
    Subtract,
    /// r[P3] = r[P2] * r[P1]
    Multiply,
    /// r[P3] = r[P2] / r[P1]
    Divide,
    /// r[P3] = r[P2] % r[P1]
    Remainder,
    /// r[P3] = r[P2] || r[P1]
    Concat,
    /// r[P3] = r[P1] & r[P2]
    BitAnd,
    /// r[P3] = r[P1] | r[P2]
    BitOr,
    /// r[P3] = r[P2] << r[P1]
    ShiftLeft,
    /// r[P3] = r[P2] >> r[P1]
    ShiftRight,
    /// r[P2] = ~r[P1]
    BitNot,
    /// r[P2] = NOT r[P1]
    Not,
    /// r[P3] = r[P1] AND r[P2]
    And,
    /// r[P3] = r[P1] OR r[P2]
    Or,

    // ========================================================================
    // Comparison
    // ========================================================================
    /// Jump to P2 (or store into r[P2]) if r[P3] == r[P1]
    Eq,
    /// r[P3] != r[P1]
    Ne,
    /// r[P3] < r[P1]
    Lt,
    /// r[P3] <= r[P1]
    Le,
    /// r[P3] > r[P1]
    Gt,
    /// r[P3] >= r[P1]
    Ge,
    /// Jump to P2 if the previous comparison was not equal
    ElseNotEq,
    /// Jump to P2 if r[P1] is NULL
    IsNull,
    /// Jump to P2 if r[P1] is not NULL
    NotNull,

    // ========================================================================
    // Functions
    // ========================================================================
    /// Collation P4 applies to the next Function or AggStep
    CollSeq,
    /// r[P3] = function P4(r[P2..P2+P1))
    Function,
    /// Aggregate step: accumulator r[P3], arguments r[P2..P2+P1)
    AggStep,
    /// Finalize accumulator r[P1] of function P4 with P2 arguments
    AggFinal,

    // ========================================================================
    // Cursors
    // ========================================================================
    /// Open cursor P1 on index P2 of space P4
    OpenRead,
    /// Open ephemeral table P1 with P2 columns and key P4
    OpenEphemeral,
    /// Open cursor P1 over the single record held in r[P2], P3 columns
    OpenPseudo,
    /// Open sorter P1 with P2 columns and key P4
    SorterOpen,
    /// Close cursor P1
    Close,
    /// Position P1 at its first entry, jump to P2 if empty
    Rewind,
    /// Advance P1, jump to P2 if more entries
    Next,
    /// Step P1 backwards, jump to P2 if more entries
    Prev,
    /// Position P1 at its last entry, jump to P2 if empty
    Last,
    /// Sort P1 and rewind, jump to P2 if empty
    Sort,
    /// r[P3] = column P2 of cursor P1
    Column,
    /// r[P3] = record of r[P1..P1+P2) with types P4
    MakeRecord,
    /// Insert record r[P2] into cursor P1
    IdxInsert,
    /// Delete key r[P2..P2+P3) from cursor P1
    IdxDelete,
    /// Jump to P2 if key r[P3] (P4 columns) is in cursor P1
    Found,
    /// Jump to P2 if key r[P3] (P4 columns) is not in cursor P1
    NotFound,
    /// Insert record r[P2] into sorter P1
    SorterInsert,
    /// Remove every entry of sorter or ephemeral cursor P1
    ResetSorter,
    /// Sort sorter P1, jump to P2 if empty
    SorterSort,
    /// Advance sorter P1, jump to P2 if more entries
    SorterNext,
    /// r[P2] = current sorter record of P1; invalidate pseudo cursor P3
    SorterData,
    /// r[P2] = next sequence number of cursor P1
    Sequence,
    /// Jump to P2 if the sequence counter of cursor P1 is zero, then
    /// increment it
    SequenceTest,
    /// r[P2] = next id for ephemeral table P1
    NextIdEphemeral,
    /// r[P2] = current record of cursor P1
    RowData,
    /// Delete the current entry of cursor P1
    Delete,
    /// r[P2] = number of entries of cursor P1
    Count,
    /// Set cursor P1 to a row of all NULLs
    NullRow,
}

impl Opcode {
    /// Is P2 a jump target?
    pub fn is_jump(&self) -> bool {
        matches!(
            self,
            Opcode::Init
                | Opcode::Goto
                | Opcode::Gosub
                | Opcode::InitCoroutine
                | Opcode::Yield
                | Opcode::Once
                | Opcode::If
                | Opcode::IfNot
                | Opcode::IfPos
                | Opcode::IfNotZero
                | Opcode::DecrJumpZero
                | Opcode::MustBeInt
                | Opcode::Jump
                | Opcode::Eq
                | Opcode::Ne
                | Opcode::Lt
                | Opcode::Le
                | Opcode::Gt
                | Opcode::Ge
                | Opcode::ElseNotEq
                | Opcode::IsNull
                | Opcode::NotNull
                | Opcode::Rewind
                | Opcode::Next
                | Opcode::Prev
                | Opcode::Last
                | Opcode::Sort
                | Opcode::Found
                | Opcode::NotFound
                | Opcode::SorterSort
                | Opcode::SorterNext
                | Opcode::SequenceTest
        )
    }

    /// Is P1 a cursor number?
    pub fn uses_cursor(&self) -> bool {
        matches!(
            self,
            Opcode::OpenRead
                | Opcode::OpenEphemeral
                | Opcode::OpenPseudo
                | Opcode::SorterOpen
                | Opcode::Close
                | Opcode::Rewind
                | Opcode::Next
                | Opcode::Prev
                | Opcode::Last
                | Opcode::Sort
                | Opcode::Column
                | Opcode::IdxInsert
                | Opcode::IdxDelete
                | Opcode::Found
                | Opcode::NotFound
                | Opcode::SorterInsert
                | Opcode::SorterSort
                | Opcode::SorterNext
                | Opcode::SorterData
                | Opcode::ResetSorter
                | Opcode::Sequence
                | Opcode::SequenceTest
                | Opcode::NextIdEphemeral
                | Opcode::RowData
                | Opcode::Delete
                | Opcode::Count
                | Opcode::NullRow
        )
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge
        )
    }

    /// Get the opcode name
    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Noop => "Noop",
            Opcode::Init => "Init",
            Opcode::Halt => "Halt",
            Opcode::SetDiag => "SetDiag",
            Opcode::Goto => "Goto",
            Opcode::Gosub => "Gosub",
            Opcode::Return => "Return",
            Opcode::InitCoroutine => "InitCoroutine",
            Opcode::EndCoroutine => "EndCoroutine",
            Opcode::Yield => "Yield",
            Opcode::Once => "Once",
            Opcode::If => "If",
            Opcode::IfNot => "IfNot",
            Opcode::IfPos => "IfPos",
            Opcode::IfNotZero => "IfNotZero",
            Opcode::DecrJumpZero => "DecrJumpZero",
            Opcode::OffsetLimit => "OffsetLimit",
            Opcode::MustBeInt => "MustBeInt",
            Opcode::Jump => "Jump",
            Opcode::Compare => "Compare",
            Opcode::Permutation => "Permutation",
            Opcode::Null => "Null",
            Opcode::Integer => "Integer",
            Opcode::Int64 => "Int64",
            Opcode::Real => "Real",
            Opcode::String8 => "String8",
            Opcode::Blob => "Blob",
            Opcode::Bool => "Bool",
            Opcode::Variable => "Variable",
            Opcode::Move => "Move",
            Opcode::Copy => "Copy",
            Opcode::SCopy => "SCopy",
            Opcode::IntCopy => "IntCopy",
            Opcode::ResultRow => "ResultRow",
            Opcode::ApplyType => "ApplyType",
            Opcode::Cast => "Cast",
            Opcode::Add => "Add",
            Opcode::Subtract => "Subtract",
            Opcode::Multiply => "Multiply",
            Opcode::Divide => "Divide",
            Opcode::Remainder => "Remainder",
            Opcode::Concat => "Concat",
            Opcode::BitAnd => "BitAnd",
            Opcode::BitOr => "BitOr",
            Opcode::ShiftLeft => "ShiftLeft",
            Opcode::ShiftRight => "ShiftRight",
            Opcode::BitNot => "BitNot",
            Opcode::Not => "Not",
            Opcode::And => "And",
            Opcode::Or => "Or",
            Opcode::Eq => "Eq",
            Opcode::Ne => "Ne",
            Opcode::Lt => "Lt",
            Opcode::Le => "Le",
            Opcode::Gt => "Gt",
            Opcode::Ge => "Ge",
            Opcode::ElseNotEq => "ElseNotEq",
            Opcode::IsNull => "IsNull",
            Opcode::NotNull => "NotNull",
            Opcode::CollSeq => "CollSeq",
            Opcode::Function => "Function",
            Opcode::AggStep => "AggStep",
            Opcode::AggFinal => "AggFinal",
            Opcode::OpenRead => "OpenRead",
            Opcode::OpenEphemeral => "OpenEphemeral",
            Opcode::OpenPseudo => "OpenPseudo",
            Opcode::SorterOpen => "SorterOpen",
            Opcode::Close => "Close",
            Opcode::Rewind => "Rewind",
            Opcode::Next => "Next",
            Opcode::Prev => "Prev",
            Opcode::Last => "Last",
            Opcode::Sort => "Sort",
            Opcode::Column => "Column",
            Opcode::MakeRecord => "MakeRecord",
            Opcode::IdxInsert => "IdxInsert",
            Opcode::IdxDelete => "IdxDelete",
            Opcode::Found => "Found",
            Opcode::NotFound => "NotFound",
            Opcode::SorterInsert => "SorterInsert",
            Opcode::SorterSort => "SorterSort",
            Opcode::SorterNext => "SorterNext",
            Opcode::SorterData => "SorterData",
            Opcode::Sequence => "Sequence",
            Opcode::SequenceTest => "SequenceTest",
            Opcode::ResetSorter => "ResetSorter",
            Opcode::NextIdEphemeral => "NextIdEphemeral",
            Opcode::RowData => "RowData",
            Opcode::Delete => "Delete",
            Opcode::Count => "Count",
            Opcode::NullRow => "NullRow",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ============================================================================
// Key Info
// ============================================================================

/// One part of a comparison key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPart {
    pub coll_id: CollId,
    pub sort_order: SortOrder,
    pub field_type: FieldType,
}

impl Default for KeyPart {
    fn default() -> Self {
        Self {
            coll_id: COLL_NONE,
            sort_order: SortOrder::Asc,
            field_type: FieldType::Scalar,
        }
    }
}

/// Key comparison descriptor shared by sorters, ephemeral tables and
/// Compare instructions
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyInfo {
    pub parts: Vec<KeyPart>,
}

impl KeyInfo {
    pub fn new(n_fields: usize) -> Self {
        Self {
            parts: vec![KeyPart::default(); n_fields],
        }
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Copy with one more trailing ascending part (e.g. a sequence column)
    pub fn with_extra(&self, n_extra: usize) -> KeyInfo {
        let mut k = self.clone();
        k.parts
            .extend(std::iter::repeat(KeyPart::default()).take(n_extra));
        k
    }
}

// ============================================================================
// P4 Operand
// ============================================================================

/// P4 operand - holds data wider than an integer
#[derive(Debug, Clone, PartialEq, Default)]
pub enum P4 {
    #[default]
    Unused,
    Int64(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    /// Collation for comparisons
    Collation(CollId),
    /// Function name and number of arguments
    FuncDef(String, usize),
    KeyInfo(Arc<KeyInfo>),
    /// Field types for MakeRecord/ApplyType
    Types(Vec<FieldType>),
    /// Column permutation
    IntArray(Vec<u32>),
    /// Space name for OpenRead
    Table(String),
}

impl P4 {
    pub fn is_unused(&self) -> bool {
        matches!(self, P4::Unused)
    }
}

impl fmt::Display for P4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            P4::Unused => Ok(()),
            P4::Int64(i) => write!(f, "{}", i),
            P4::Real(r) => write!(f, "{}", r),
            P4::Text(s) => write!(f, "'{}'", s),
            P4::Blob(b) => write!(f, "x'{}'", hex::encode(b)),
            P4::Collation(id) => {
                let name = collation_name(*id).unwrap_or_else(|| "none".to_string());
                write!(f, "collseq({})", name)
            }
            P4::FuncDef(name, argc) => write!(f, "{}({})", name, argc),
            P4::KeyInfo(k) => {
                write!(f, "k({}", k.parts.len())?;
                for part in &k.parts {
                    let name = collation_name(part.coll_id).unwrap_or_default();
                    let dir = if part.sort_order.is_desc() { "-" } else { "" };
                    write!(f, ",{}{}", dir, name)?;
                }
                write!(f, ")")
            }
            P4::Types(types) => {
                let names: Vec<&str> = types.iter().map(|t| t.name()).collect();
                write!(f, "{}", names.join(","))
            }
            P4::IntArray(a) => write!(f, "[{} ints]", a.len()),
            P4::Table(t) => write!(f, "space<{}>", t),
        }
    }
}

// ============================================================================
// VDBE Instruction
// ============================================================================

/// A single VDBE instruction
#[derive(Debug, Clone, PartialEq)]
pub struct VdbeOp {
    pub opcode: Opcode,
    pub p1: i32,
    pub p2: i32,
    pub p3: i32,
    pub p4: P4,
    pub p5: u16,
    /// Explain comment
    pub comment: Option<String>,
}

impl VdbeOp {
    pub fn new(opcode: Opcode, p1: i32, p2: i32, p3: i32) -> Self {
        Self {
            opcode,
            p1,
            p2,
            p3,
            p4: P4::Unused,
            p5: 0,
            comment: None,
        }
    }

    pub fn with_p4(opcode: Opcode, p1: i32, p2: i32, p3: i32, p4: P4) -> Self {
        Self {
            p4,
            ..Self::new(opcode, p1, p2, p3)
        }
    }
}

impl fmt::Display for VdbeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<14} {:>4} {:>4} {:>4}",
            self.opcode.name(),
            self.p1,
            self.p2,
            self.p3
        )?;
        if !self.p4.is_unused() {
            write!(f, "  {}", self.p4)?;
        }
        if self.p5 != 0 {
            write!(f, "  p5={:#x}", self.p5)?;
        }
        if let Some(ref comment) = self.comment {
            write!(f, "  ; {}", comment)?;
        }
        Ok(())
    }
}

// ============================================================================
// Comparison Flags (P5)
// ============================================================================

/// Flag bits of P5 for comparison instructions. The low nibble holds the
/// comparison type code.
pub mod cmp_flags {
    /// Field type mask
    pub const TYPE_MASK: u16 = 0x0F;
    /// Jump if either operand is NULL
    pub const JUMPIFNULL: u16 = 0x10;
    /// Store the result into r[P2] instead of jumping
    pub const STOREP2: u16 = 0x20;
    /// Keep a NULL result when storing
    pub const KEEPNULL: u16 = 0x40;
    /// NULL values compare equal
    pub const NULLEQ: u16 = 0x80;
    /// Compare uses the permutation set by the previous Permutation
    pub const PERMUTE: u16 = 0x01;
}

/// Flag bits of P5 for Column
pub mod opflags {
    /// Only the length of the value is read
    pub const LENGTHARG: u16 = 0x40;
    /// Only the type of the value is read
    pub const TYPEOFARG: u16 = 0x80;
}
