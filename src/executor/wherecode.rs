//! Nested-loop code for a FROM clause
//!
//! [`where_begin`] opens one loop per FROM item, outermost first, and codes
//! each WHERE term at the innermost loop whose cursors it needs. The body
//! of the innermost loop is whatever the caller emits between
//! `where_begin` and [`where_end`].
//!
//! Access paths are deliberately simple: a full scan of the table, or of
//! one of its indexes when that index delivers the rows in the order the
//! caller asked for. A loop over a subquery reads its ephemeral table or
//! resumes its co-routine.

use std::sync::Arc;

use bitflags::bitflags;
use tracing::{debug, instrument, Level};

use crate::error::Result;
use crate::executor::expr::analyze::expr_and;
use crate::executor::parse::Parse;
use crate::executor::select::DistinctKind;
use crate::executor::where_clause::{MaskSet, WhereClause, WhereTermFlags};
use crate::executor::where_expr::{analyze_where_clause, AnalyzeCtx};
use crate::parser::ast::{BinaryOp, Expr, ExprList, SrcItem, SrcItemFlags, SrcList};
use crate::schema::{Index, Table};
use crate::types::{Bitmask, Cursor, Reg, ALLBITS};
use crate::vdbe::ops::{cmp_flags, Opcode, P4};

bitflags! {
    /// What the caller wants from the loops
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct WhereFlags: u16 {
        /// `order_by` is min()'s argument: one row in ascending order
        const ORDERBY_MIN = 0x0001;
        /// `order_by` is max()'s argument: one row in descending order
        const ORDERBY_MAX = 0x0002;
        /// `order_by` is a GROUP BY list
        const GROUPBY = 0x0004;
        /// Report how DISTINCT over `distinct_set` can be enforced
        const WANT_DISTINCT = 0x0008;
    }
}

/// One loop of the nest
#[derive(Debug, Clone)]
pub struct WhereLevel {
    pub cursor: Cursor,
    /// Index scanned, `None` for a subquery
    pub index: Option<Arc<Index>>,
    /// Instruction that advances the loop
    next_op: Opcode,
    /// Start of the loop body
    addr_body: i32,
    /// Where a LEFT JOIN re-enters the body with a NULL row
    addr_first: i32,
    /// Jump here to advance this loop
    label_cont: i32,
    /// Jump here when this loop is exhausted
    label_brk: i32,
    /// LEFT JOIN match flag, 0 for inner loops
    reg_left_join: Reg,
    /// First result register when the item is a co-routine, 0 otherwise
    reg_result: Reg,
}

/// State shared between [`where_begin`] and [`where_end`]
#[derive(Debug)]
pub struct WhereInfo {
    pub wc: WhereClause,
    pub masks: MaskSet,
    pub levels: Vec<WhereLevel>,
    break_label: i32,
    n_ob_sat: usize,
    distinct: DistinctKind,
    single_row: bool,
}

impl WhereInfo {
    /// Jump here to skip to the next row of the innermost loop
    pub fn continue_label(&self) -> i32 {
        self.levels
            .last()
            .map_or(self.break_label, |l| l.label_cont)
    }

    /// Jump here to leave every loop
    pub fn break_label(&self) -> i32 {
        self.break_label
    }

    /// Number of leading ORDER BY (or GROUP BY) terms the scan delivers in
    /// order
    pub fn n_ob_sat(&self) -> usize {
        self.n_ob_sat
    }

    pub fn is_ordered(&self) -> bool {
        self.n_ob_sat > 0
    }

    pub fn distinct(&self) -> DistinctKind {
        self.distinct
    }

    /// min()/max() found its value in the first row: leave after one row
    pub fn min_max_single_row(&self) -> bool {
        self.single_row
    }
}

/// Cursors of the FROM items, in loop order
fn build_masks(src: &SrcList) -> MaskSet {
    let mut masks = MaskSet::new();
    for item in &src.items {
        masks.create_mask(item.cursor);
    }
    masks
}

/// Table columns of `list` on `cursor`, or None if any item is something
/// else. The second value is true when every item is descending.
fn plain_columns(list: &ExprList, cursor: Cursor) -> Option<(Vec<usize>, bool)> {
    let mut columns = Vec::with_capacity(list.len());
    let mut n_desc = 0;
    for item in &list.items {
        let col = item.expr.as_column()?;
        if col.cursor != cursor {
            return None;
        }
        columns.push(col.column);
        if item.sort_order.is_desc() {
            n_desc += 1;
        }
    }
    if n_desc != 0 && n_desc != columns.len() {
        return None;
    }
    Some((columns, n_desc != 0))
}

/// Index whose leading key parts are `columns`, in this order
fn index_in_order<'a>(table: &'a Table, columns: &[usize]) -> Option<&'a Arc<Index>> {
    table.indexes.iter().find(|idx| {
        idx.columns.len() >= columns.len()
            && idx
                .columns
                .iter()
                .zip(columns)
                .all(|(part, &col)| part.column == col && !part.sort_order.is_desc())
    })
}

/// The rows of `table` are unique over `columns`: a unique index covers a
/// subset of them and none of its columns holds NULL
fn columns_are_unique(table: &Table, columns: &[usize]) -> bool {
    table.indexes.iter().any(|idx| {
        idx.unique
            && idx.columns.iter().all(|part| {
                columns.contains(&part.column)
                    && table
                        .column(part.column)
                        .is_some_and(|c| !c.is_nullable)
            })
    })
}

/// Scan chosen for a single-table FROM clause
#[derive(Debug, Default)]
struct ScanChoice {
    index: Option<Arc<Index>>,
    desc: bool,
    n_ob_sat: usize,
    single_row: bool,
    /// Column whose NULLs min() must skip
    skip_null: Option<usize>,
    distinct: DistinctKind,
}

fn choose_scan(
    item: &SrcItem,
    order_by: Option<&ExprList>,
    distinct_set: Option<&ExprList>,
    flags: WhereFlags,
) -> ScanChoice {
    let mut choice = ScanChoice::default();
    let scans_table = item.select.is_none() && !item.fg.contains(SrcItemFlags::RECURSIVE);
    let Some(table) = item.table.as_ref().filter(|_| scans_table) else {
        if flags.contains(WhereFlags::WANT_DISTINCT) {
            choice.distinct = DistinctKind::Unordered;
        }
        return choice;
    };
    if let Some((columns, desc)) = order_by.and_then(|l| plain_columns(l, item.cursor)) {
        if let Some(idx) = index_in_order(table, &columns) {
            choice.index = Some(Arc::clone(idx));
            if flags.intersects(WhereFlags::ORDERBY_MIN | WhereFlags::ORDERBY_MAX) {
                choice.single_row = true;
                choice.desc = flags.contains(WhereFlags::ORDERBY_MAX);
                if !choice.desc {
                    choice.skip_null = columns.first().copied();
                }
            } else {
                // a GROUP BY is satisfied in either direction
                choice.desc = desc && !flags.contains(WhereFlags::GROUPBY);
                choice.n_ob_sat = columns.len();
            }
        }
    }
    if flags.contains(WhereFlags::WANT_DISTINCT) {
        choice.distinct = match distinct_set.and_then(|l| plain_columns(l, item.cursor)) {
            Some((columns, _)) if columns_are_unique(table, &columns) => DistinctKind::Unique,
            Some((columns, _)) => {
                let sorted_by_index = choice.index.as_ref().is_some_and(|idx| {
                    idx.columns.len() >= columns.len()
                        && idx.columns[..columns.len()]
                            .iter()
                            .all(|p| columns.contains(&p.column))
                });
                if sorted_by_index && !choice.single_row {
                    DistinctKind::Ordered
                } else if order_by.is_none() && !choice.single_row {
                    match index_in_order(table, &columns) {
                        Some(idx) => {
                            choice.index = Some(Arc::clone(idx));
                            DistinctKind::Ordered
                        }
                        None => DistinctKind::Unordered,
                    }
                } else {
                    DistinctKind::Unordered
                }
            }
            None => DistinctKind::Unordered,
        };
    }
    choice
}

/// Code every term of `wc` that can be evaluated once the cursors outside
/// `not_ready` are positioned. With `on_terms` only ON-clause terms are
/// taken, otherwise only the others.
fn code_ready_terms(
    parse: &mut Parse,
    wc: &mut WhereClause,
    not_ready: Bitmask,
    on_terms: bool,
    dest: i32,
) -> Result<()> {
    for idx in 0..wc.len() {
        let term = &wc.terms[idx];
        if term.has_flag(WhereTermFlags::VIRTUAL | WhereTermFlags::CODED)
            || term.prereq_all & not_ready != 0
            || term.expr.is_from_join() != on_terms
        {
            continue;
        }
        let expr = term.expr.clone();
        parse.expr_if_false(&expr, dest, cmp_flags::JUMPIFNULL)?;
        wc.terms[idx].flags |= WhereTermFlags::CODED;
    }
    Ok(())
}

/// Open the loops over `src`. `where_expr` is filtered inside the loops;
/// `order_by` is the order the caller would like the rows in (an ORDER BY,
/// a GROUP BY or a min()/max() argument, according to `flags`).
#[instrument(skip_all, level = Level::DEBUG)]
pub fn where_begin(
    parse: &mut Parse,
    src: &SrcList,
    where_expr: Option<&Expr>,
    order_by: Option<&ExprList>,
    distinct_set: Option<&ExprList>,
    flags: WhereFlags,
) -> Result<WhereInfo> {
    let masks = build_masks(src);
    let mut filter = where_expr.cloned();
    for item in &src.items {
        if let Some(on) = &item.on {
            let mut on = (**on).clone();
            if item.is_left_join() && !on.is_from_join() {
                on.set_join(item.cursor);
            }
            filter = expr_and(filter, Some(on));
        }
    }
    let mut wc = match &filter {
        Some(expr) => {
            let ctx = AnalyzeCtx {
                masks: &masks,
                config: &parse.config,
            };
            analyze_where_clause(&ctx, expr)?
        }
        None => WhereClause::new(BinaryOp::And),
    };

    let break_label = parse.make_label();
    let mut winfo = WhereInfo {
        wc: WhereClause::new(wc.op),
        masks,
        levels: Vec::with_capacity(src.len()),
        break_label,
        n_ob_sat: 0,
        distinct: DistinctKind::Noop,
        single_row: false,
    };

    // terms that depend on no cursor are checked once, before any loop
    code_ready_terms(parse, &mut wc, ALLBITS, false, break_label)?;

    let choice = match src.items.as_slice() {
        [item] => choose_scan(item, order_by, distinct_set, flags),
        _ => ScanChoice {
            distinct: if flags.contains(WhereFlags::WANT_DISTINCT) {
                DistinctKind::Unordered
            } else {
                DistinctKind::Noop
            },
            ..ScanChoice::default()
        },
    };
    debug!(
        index = choice.index.as_ref().map(|i| i.name.as_str()),
        n_ob_sat = choice.n_ob_sat,
        distinct = ?choice.distinct,
        single_row = choice.single_row,
        "access path"
    );

    let mut not_ready: Bitmask = src
        .items
        .iter()
        .fold(0, |m, item| m | winfo.masks.get_mask(item.cursor));
    for (i, item) in src.items.iter().enumerate() {
        let label_cont = parse.make_label();
        let label_brk = parse.make_label();
        let index = if i == 0 { choice.index.clone() } else { None };
        let mut reg_left_join = 0;
        if item.is_left_join() {
            reg_left_join = parse.alloc_reg();
            parse.vdbe.add_op2(Opcode::Integer, 0, reg_left_join);
            parse.vdbe.comment(format!("init LEFT JOIN no-match flag for {}", item.name()));
        }

        let (next_op, addr_body) = if item.fg.contains(SrcItemFlags::VIA_COROUTINE) {
            let addr = parse
                .vdbe
                .add_op2(Opcode::Yield, item.reg_return, label_brk);
            parse.vdbe.comment(format!("next row of {}", item.name()));
            (Opcode::Goto, addr)
        } else if item.fg.contains(SrcItemFlags::RECURSIVE) {
            // the single current row already sits in a pseudo cursor
            (Opcode::Noop, parse.vdbe.current_addr())
        } else {
            if item.select.is_none() {
                if let Some(table) = &item.table {
                    let index_no = index.as_ref().map_or(0, |idx| idx.index_no as i32);
                    parse.vdbe.add_op4(
                        Opcode::OpenRead,
                        item.cursor,
                        index_no,
                        0,
                        P4::Table(table.name.clone()),
                    );
                    parse.vdbe.comment(item.name().to_string());
                }
            }
            let desc = i == 0 && choice.desc;
            let (first_op, next_op) = if desc {
                (Opcode::Last, Opcode::Prev)
            } else {
                (Opcode::Rewind, Opcode::Next)
            };
            parse.vdbe.add_op2(first_op, item.cursor, label_brk);
            (next_op, parse.vdbe.current_addr())
        };
        parse.cache_clear();

        not_ready &= !winfo.masks.get_mask(item.cursor);
        if i == 0 {
            if let Some(column) = choice.skip_null {
                let reg = parse.get_temp_reg();
                let r = parse.expr_code_get_column(item.cursor, column, reg, 0);
                parse.vdbe.add_op2(Opcode::IsNull, r, label_cont);
                parse.release_temp_reg(reg);
            }
        }
        code_ready_terms(parse, &mut wc, not_ready, true, label_cont)?;
        let addr_first = parse.vdbe.current_addr();
        if reg_left_join != 0 {
            parse.vdbe.add_op2(Opcode::Integer, 1, reg_left_join);
            parse.vdbe.comment(format!("record LEFT JOIN hit for {}", item.name()));
        }
        code_ready_terms(parse, &mut wc, not_ready, false, label_cont)?;

        winfo.levels.push(WhereLevel {
            cursor: item.cursor,
            index,
            next_op,
            addr_body,
            addr_first,
            label_cont,
            label_brk,
            reg_left_join,
            reg_result: if item.fg.contains(SrcItemFlags::VIA_COROUTINE) {
                item.reg_result
            } else {
                0
            },
        });
    }

    winfo.n_ob_sat = choice.n_ob_sat;
    winfo.distinct = choice.distinct;
    winfo.single_row = choice.single_row;
    winfo.wc = wc;
    Ok(winfo)
}

/// Rows of a co-routine live in registers, not behind a cursor: rewrite
/// every Column read of `cursor` emitted since `start` into a Copy from
/// `reg_result`.
fn translate_column_to_copy(parse: &mut Parse, start: i32, cursor: Cursor, reg_result: Reg) {
    let end = parse.vdbe.current_addr();
    for addr in start..end {
        if let Some(op) = parse.vdbe.op_at_mut(addr) {
            if op.opcode == Opcode::Column && op.p1 == cursor {
                op.opcode = Opcode::Copy;
                op.p1 = reg_result + op.p2;
                op.p2 = op.p3;
                op.p3 = 0;
            }
        }
    }
}

/// Close the loops opened by [`where_begin`], innermost first
pub fn where_end(parse: &mut Parse, winfo: WhereInfo) -> Result<()> {
    parse.cache_clear();
    for level in winfo.levels.iter().rev() {
        if level.reg_result != 0 {
            translate_column_to_copy(parse, level.addr_body, level.cursor, level.reg_result);
        }
        parse.resolve_label(level.label_cont);
        match level.next_op {
            Opcode::Goto => parse.vdbe.add_op2(Opcode::Goto, 0, level.addr_body),
            Opcode::Noop => parse.vdbe.current_addr(),
            op => parse.vdbe.add_op2(op, level.cursor, level.addr_body),
        };
        parse.resolve_label(level.label_brk);
        if level.reg_left_join != 0 {
            let addr = parse.vdbe.add_op(Opcode::IfPos, level.reg_left_join, 0, 1);
            parse.vdbe.add_op1(Opcode::NullRow, level.cursor);
            parse.vdbe.add_op2(Opcode::Goto, 0, level.addr_first);
            parse.vdbe.jump_here(addr);
        }
    }
    parse.resolve_label(winfo.break_label);
    Ok(())
}
