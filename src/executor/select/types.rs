//! Types shared by the SELECT compilation passes

use std::sync::Arc;

use crate::parser::ast::ExprList;
use crate::types::{Cursor, FieldType, Reg};
use crate::vdbe::ops::KeyInfo;

// ============================================================================
// Select Destination
// ============================================================================

/// How the rows of a SELECT are disposed of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectDestKind {
    /// Store each row as a key in ephemeral index `parm`
    Union,
    /// Remove each row from ephemeral index `parm`
    Except,
    /// Set register `parm` to true if any row is produced
    Exists,
    /// Throw the rows away
    Discard,
    /// Emit a result row
    #[default]
    Output,
    /// Store the first row in registers `sdst..sdst+n_sdst`
    Mem,
    /// Store single-column rows as keys of ephemeral index `parm`, typed
    /// with `dest_type`
    Set,
    /// Open ephemeral table `parm` and store the rows in it
    EphemTab,
    /// Yield each row from the co-routine whose return register is `parm`
    Coroutine,
    /// Store the rows in the already open ephemeral table `parm`
    Table,
    /// Append the rows to queue `parm` in arrival order
    Fifo,
    /// As `Fifo`, skipping rows already seen by the index at `parm + 1`
    DistFifo,
    /// Insert the rows into queue `parm` keyed by `order_by`
    Queue,
    /// As `Queue`, skipping rows already seen by the index at `parm + 1`
    DistQueue,
}

impl SelectDestKind {
    /// Row order does not matter for this destination
    pub fn ignores_order(&self) -> bool {
        matches!(
            self,
            SelectDestKind::Union
                | SelectDestKind::Except
                | SelectDestKind::Exists
                | SelectDestKind::Discard
        )
    }
}

/// Destination of a SELECT's result rows
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectDest {
    pub kind: SelectDestKind,
    /// Cursor or register, depending on `kind`
    pub parm: i32,
    /// First register of the result block, 0 until allocated
    pub sdst: Reg,
    /// Number of registers in the result block
    pub n_sdst: i32,
    /// Types applied to `Set` keys
    pub dest_type: Vec<FieldType>,
    /// Key of a `Queue`/`DistQueue` destination, every term resolved to a
    /// result column
    pub order_by: Option<ExprList>,
}

impl SelectDest {
    pub fn new(kind: SelectDestKind, parm: i32) -> Self {
        SelectDest {
            kind,
            parm,
            ..Default::default()
        }
    }

    pub fn output() -> Self {
        SelectDest::new(SelectDestKind::Output, 0)
    }
}

// ============================================================================
// Sorting and DISTINCT state
// ============================================================================

/// How DISTINCT is enforced for a simple select
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistinctKind {
    /// No DISTINCT processing needed
    #[default]
    Noop,
    /// The scan already produces unique rows
    Unique,
    /// Rows arrive ordered; compare with the previous row only
    Ordered,
    /// Remember every row in an ephemeral index
    Unordered,
}

/// DISTINCT bookkeeping of one select
#[derive(Debug, Clone, Default)]
pub struct DistinctCtx {
    /// DISTINCT keyword present
    pub is_distinct: bool,
    pub kind: DistinctKind,
    /// Cursor of the dedup index
    pub cursor: Cursor,
    /// Address of the OpenEphemeral for `cursor`
    pub addr_open: Option<i32>,
}

/// ORDER BY or GROUP BY buffering state
#[derive(Debug, Clone, Default)]
pub struct SortCtx {
    pub order_by: ExprList,
    /// Leading ORDER BY terms already satisfied by the scan
    pub n_ob_sat: usize,
    /// Sorter or ordered-index cursor
    pub cursor: Cursor,
    /// Return register of the block-output subroutine
    pub reg_return: Reg,
    /// Start label of the block-output subroutine, 0 when unused
    pub label_bk_out: i32,
    /// Address of the SorterOpen/OpenEphemeral
    pub addr_open: Option<i32>,
    /// Jump here when the LIMIT is reached
    pub label_done: i32,
    /// Use a sorter rather than an ordered ephemeral index
    pub use_sorter: bool,
    /// Key descriptor patched into the open instruction
    pub key_info: Option<Arc<KeyInfo>>,
}

impl SortCtx {
    pub fn is_empty(&self) -> bool {
        self.order_by.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dest_kinds_ignoring_order() {
        assert!(SelectDestKind::Union.ignores_order());
        assert!(SelectDestKind::Exists.ignores_order());
        assert!(!SelectDestKind::Output.ignores_order());
        assert!(!SelectDestKind::Set.ignores_order());
    }

    #[test]
    fn test_default_dest_is_output() {
        let dest = SelectDest::output();
        assert_eq!(dest.kind, SelectDestKind::Output);
        assert_eq!(dest.sdst, 0);
        assert!(dest.dest_type.is_empty());
    }
}
