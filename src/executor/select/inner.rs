//! Row disposal: the body of the inner loop, the ORDER BY sorter and the
//! LIMIT/OFFSET counters

use std::sync::Arc;

use tracing::trace;

use crate::error::{Error, ErrorCode, Result};
use crate::executor::expr::codegen::CodeListFlags;
use crate::executor::expr::collate::expr_coll;
use crate::executor::expr::types::expr_type;
use crate::executor::parse::Parse;
use crate::executor::select::aggregate::code_distinct;
use crate::executor::select::types::{
    DistinctCtx, DistinctKind, SelectDest, SelectDestKind, SortCtx,
};
use crate::parser::ast::{Expr, ExprFlags, ExprKind, ExprList, Select, SelectFlags};
use crate::schema::collation::collation_name;
use crate::types::{Cursor, FieldType, Reg, SortOrder};
use crate::vdbe::builder::ColumnMeta;
use crate::vdbe::ops::{cmp_flags, KeyInfo, KeyPart, Opcode, P4};

/// Key descriptor for the items of `list` from `start` on, followed by
/// `n_extra` default parts
pub(crate) fn key_info_from_expr_list(
    list: &ExprList,
    start: usize,
    n_extra: usize,
) -> Result<KeyInfo> {
    let mut parts = Vec::with_capacity(list.len().saturating_sub(start) + n_extra);
    for item in list.items.iter().skip(start) {
        parts.push(KeyPart {
            coll_id: expr_coll(&item.expr)?.id,
            sort_order: item.sort_order,
            field_type: FieldType::Scalar,
        });
    }
    Ok(KeyInfo { parts }.with_extra(n_extra))
}

/// Skip the current row while the OFFSET counter is positive
pub(crate) fn code_offset(parse: &mut Parse, i_offset: Reg, i_continue: i32) {
    if i_offset > 0 {
        parse.vdbe.add_op(Opcode::IfPos, i_offset, i_continue, 1);
        parse.vdbe.comment("OFFSET");
    }
}

/// Halt with `message` at run time
fn code_halt(parse: &mut Parse, message: &str) {
    parse
        .vdbe
        .add_op4(Opcode::SetDiag, 0, 0, 0, P4::Text(message.to_string()));
    parse.vdbe.add_op1(Opcode::Halt, -1);
}

/// Evaluate LIMIT and OFFSET into counter registers. A LIMIT of zero
/// jumps straight to `i_break`. Does nothing when the counters already
/// exist.
pub(crate) fn compute_limit_registers(parse: &mut Parse, p: &mut Select, i_break: i32) -> Result<()> {
    if p.i_limit != 0 {
        return Ok(());
    }
    parse.cache_clear();
    let Some(limit) = p.limit.clone() else {
        return Ok(());
    };
    let has_collate = |e: &Expr| e.has_flag(ExprFlags::COLLATE);
    if has_collate(&limit) || p.offset.as_deref().is_some_and(has_collate) {
        return Err(parse.set_error(Error::with_message(
            ErrorCode::Syntax,
            "Syntax error near 'COLLATE'",
        )));
    }

    let i_limit = parse.alloc_reg();
    p.i_limit = i_limit;
    let positive = parse.make_label();
    let halt = parse.make_label();
    parse.expr_code(&limit, i_limit)?;
    parse.vdbe.add_op2(Opcode::MustBeInt, i_limit, halt);
    let r1 = parse.get_temp_reg();
    parse.vdbe.add_op2(Opcode::Integer, 0, r1);
    parse.vdbe.add_op(Opcode::Ge, r1, positive, i_limit);
    parse.resolve_label(halt);
    code_halt(parse, "Only positive integers are allowed in the LIMIT clause");
    parse.resolve_label(positive);
    parse.vdbe.comment("LIMIT counter");
    parse.vdbe.add_op(Opcode::Eq, r1, i_break, i_limit);
    parse.release_temp_reg(r1);

    if p.has_flag(SelectFlags::SINGLE_ROW) {
        if limit.has_flag(ExprFlags::SYSTEM) {
            // two rows are enough to detect a scalar subquery returning more
            // than one
            parse.vdbe.add_op2(Opcode::Integer, 2, i_limit);
        } else {
            let r1 = parse.get_temp_reg();
            parse.vdbe.add_op2(Opcode::Integer, 1, r1);
            let no_err = parse.make_label();
            parse.vdbe.add_op(Opcode::Eq, i_limit, no_err, r1);
            code_halt(parse, "Expression subquery could be limited only with 1");
            parse.resolve_label(no_err);
            parse.release_temp_reg(r1);
            p.flags.remove(SelectFlags::SINGLE_ROW);
        }
    }

    if let Some(offset) = p.offset.clone() {
        let positive = parse.make_label();
        let error = parse.make_label();
        let i_offset = parse.alloc_reg();
        p.i_offset = i_offset;
        // LIMIT+OFFSET
        parse.alloc_reg();
        parse.expr_code(&offset, i_offset)?;
        parse.vdbe.add_op2(Opcode::MustBeInt, i_offset, error);
        let r1 = parse.get_temp_reg();
        parse.vdbe.add_op2(Opcode::Integer, 0, r1);
        parse.vdbe.add_op(Opcode::Ge, r1, positive, i_offset);
        parse.resolve_label(error);
        code_halt(parse, "Only positive integers are allowed in the OFFSET clause");
        parse.resolve_label(positive);
        parse.release_temp_reg(r1);
        parse.vdbe.comment("OFFSET counter");
        parse
            .vdbe
            .add_op(Opcode::OffsetLimit, i_limit, i_offset + 1, i_offset);
        parse.vdbe.comment("LIMIT+OFFSET");
    }
    Ok(())
}

/// Halt if the scalar subquery whose LIMIT counter is `limit_reg` produced
/// a second row
pub(crate) fn code_raise_on_multiple_rows(parse: &mut Parse, limit_reg: Reg, end: i32) {
    let r1 = parse.get_temp_reg();
    parse.vdbe.add_op2(Opcode::Integer, 0, r1);
    parse.vdbe.add_op(Opcode::Ne, r1, end, limit_reg);
    code_halt(parse, "Expression subquery returned more than 1 row");
    parse.release_temp_reg(r1);
}

/// Store a finished result row (`n_data` registers at `reg_data`) into the
/// ORDER BY sorter. `n_prefix` registers right before `reg_data` are free
/// for the sort key. ORDER BY terms referring to result columns are copied
/// from `reg_orig` when it is non-zero.
fn push_onto_sorter(
    parse: &mut Parse,
    sort: &mut SortCtx,
    p: &Select,
    reg_data: Reg,
    reg_orig: Reg,
    n_data: i32,
    n_prefix: i32,
) -> Result<()> {
    let b_seq = i32::from(!sort.use_sorter);
    let n_expr = sort.order_by.len() as i32;
    let n_base = n_expr + b_seq + n_data;
    let n_ob_sat = sort.n_ob_sat as i32;
    let reg_record = parse.alloc_reg();
    let reg_base = if n_prefix > 0 {
        reg_data - n_expr - b_seq
    } else {
        parse.alloc_regs(n_base)
    };
    let i_limit = if p.i_offset != 0 {
        p.i_offset + 1
    } else {
        p.i_limit
    };

    let mut flags = CodeListFlags::DUP;
    if reg_orig != 0 {
        flags |= CodeListFlags::REF;
    }
    let order_by = sort.order_by.clone();
    parse.expr_code_expr_list(&order_by, reg_base, reg_orig, flags)?;
    if b_seq != 0 {
        parse
            .vdbe
            .add_op2(Opcode::Sequence, sort.cursor, reg_base + n_expr);
    }
    if n_prefix == 0 && n_data > 0 {
        parse.expr_code_move(reg_data, reg_base + n_expr + b_seq, n_data);
    }
    parse
        .vdbe
        .add_op(Opcode::MakeRecord, reg_base + n_ob_sat, n_base - n_ob_sat, reg_record);

    if n_ob_sat > 0 {
        // rows arrive sorted on the first n_ob_sat terms: sort and flush one
        // block of equal prefixes at a time
        let reg_prev_key = parse.alloc_regs(n_ob_sat);
        let addr_first = if b_seq != 0 {
            let r1 = parse.get_temp_reg();
            parse.vdbe.add_op2(Opcode::Integer, 0, r1);
            let addr = parse.vdbe.add_op(Opcode::Eq, r1, 0, reg_base + n_expr);
            parse.release_temp_reg(r1);
            addr
        } else {
            parse.vdbe.add_op2(Opcode::SequenceTest, sort.cursor, 0)
        };
        let mut prefix_key = key_info_from_expr_list(&order_by, 0, 0)?;
        prefix_key.parts.truncate(sort.n_ob_sat);
        for part in &mut prefix_key.parts {
            part.sort_order = SortOrder::Asc;
        }
        parse.vdbe.add_op4(
            Opcode::Compare,
            reg_prev_key,
            reg_base,
            n_ob_sat,
            P4::KeyInfo(Arc::new(prefix_key)),
        );
        let rest_key = Arc::new(key_info_from_expr_list(
            &order_by,
            sort.n_ob_sat,
            b_seq as usize,
        )?);
        if let Some(addr_open) = sort.addr_open {
            parse.vdbe.change_p2(addr_open, n_base - n_ob_sat);
            parse.vdbe.change_p4(addr_open, P4::KeyInfo(rest_key.clone()));
        }
        sort.key_info = Some(rest_key);
        let addr_jmp = parse.vdbe.current_addr();
        parse
            .vdbe
            .add_op(Opcode::Jump, addr_jmp + 1, 0, addr_jmp + 1);
        sort.label_bk_out = parse.make_label();
        sort.reg_return = parse.alloc_reg();
        parse
            .vdbe
            .add_op2(Opcode::Gosub, sort.reg_return, sort.label_bk_out);
        parse.vdbe.add_op1(Opcode::ResetSorter, sort.cursor);
        if i_limit != 0 {
            let r1 = parse.get_temp_reg();
            parse.vdbe.add_op2(Opcode::Integer, 0, r1);
            parse.vdbe.add_op(Opcode::Eq, r1, sort.label_done, i_limit);
            parse.release_temp_reg(r1);
        }
        parse.vdbe.jump_here(addr_first);
        parse.expr_code_move(reg_base, reg_prev_key, n_ob_sat);
        parse.vdbe.jump_here(addr_jmp);
    }

    if sort.use_sorter {
        parse
            .vdbe
            .add_op2(Opcode::SorterInsert, sort.cursor, reg_record);
        return Ok(());
    }
    parse.vdbe.add_op2(Opcode::IdxInsert, sort.cursor, reg_record);
    if i_limit != 0 {
        // keep no more than LIMIT+OFFSET entries: once full, drop the
        // greatest after each insert
        let addr = parse.vdbe.add_op2(Opcode::IfNotZero, i_limit, 0);
        parse.vdbe.add_op2(Opcode::Last, sort.cursor, 0);
        parse.vdbe.add_op1(Opcode::Delete, sort.cursor);
        parse.vdbe.jump_here(addr);
    }
    Ok(())
}

/// Code the inner loop body of `p`: compute the result row (or read it from
/// `src_tab` when that is not negative), apply DISTINCT and OFFSET, then
/// hand the row to `dest` or to the ORDER BY sorter.
#[allow(clippy::too_many_arguments)]
pub(crate) fn select_inner_loop(
    parse: &mut Parse,
    p: &mut Select,
    src_tab: Cursor,
    mut sort: Option<&mut SortCtx>,
    distinct: Option<&mut DistinctCtx>,
    dest: &mut SelectDest,
    i_continue: i32,
    i_break: i32,
) -> Result<()> {
    if sort.as_ref().is_some_and(|s| s.is_empty()) {
        sort = None;
    }
    let distinct_kind = distinct.as_ref().map_or(DistinctKind::Noop, |d| d.kind);
    let has_distinct = distinct_kind != DistinctKind::Noop;
    if sort.is_none() && !has_distinct {
        code_offset(parse, p.i_offset, i_continue);
    }

    let mut n_result_col = p.elist.len() as i32;
    let mut n_prefix = 0;
    if dest.sdst == 0 {
        if let Some(s) = sort.as_ref() {
            n_prefix = s.order_by.len() as i32 + i32::from(!s.use_sorter);
            parse.alloc_regs(n_prefix);
        }
        dest.sdst = parse.alloc_regs(n_result_col);
    } else if dest.sdst + n_result_col > parse.n_mem {
        parse.alloc_regs(n_result_col);
    }
    dest.n_sdst = n_result_col;
    let reg_result = dest.sdst;
    let mut reg_orig = reg_result;

    if src_tab >= 0 {
        for i in 0..n_result_col {
            parse
                .vdbe
                .add_op(Opcode::Column, src_tab, i, reg_result + i);
        }
    } else if dest.kind != SelectDestKind::Exists {
        let mut flags = if matches!(
            dest.kind,
            SelectDestKind::Mem | SelectDestKind::Output | SelectDestKind::Coroutine
        ) {
            CodeListFlags::DUP
        } else {
            CodeListFlags::empty()
        };
        if let Some(s) = sort.as_mut() {
            if !has_distinct
                && !matches!(dest.kind, SelectDestKind::EphemTab | SelectDestKind::Table)
            {
                // result columns repeated in the ORDER BY are stored only
                // once, as part of the sort key
                flags |= CodeListFlags::OMITREF | CodeListFlags::REF;
                let mut excess = 0;
                for i in s.n_ob_sat..s.order_by.len() {
                    let j = s.order_by.items[i].order_by_col as usize;
                    if j == 0 {
                        continue;
                    }
                    excess += 1;
                    if let Some(item) = p.elist.items.get_mut(j - 1) {
                        item.order_by_col = (i + 1 - s.n_ob_sat) as u16;
                    }
                }
                if let Some(addr) = s.addr_open {
                    let p2 = parse.vdbe.op_at(addr).map_or(0, |op| op.p2);
                    parse.vdbe.change_p2(addr, p2 - excess);
                }
                reg_orig = 0;
            }
        }
        let elist = p.elist.clone();
        n_result_col = parse.expr_code_expr_list(&elist, reg_result, 0, flags)? as i32;
    }

    if let Some(d) = distinct {
        match d.kind {
            DistinctKind::Ordered => {
                let reg_prev = parse.alloc_regs(n_result_col);
                if let Some(addr) = d.addr_open {
                    if let Some(op) = parse.vdbe.op_at_mut(addr) {
                        op.opcode = Opcode::Null;
                        op.p1 = 1;
                        op.p2 = reg_prev;
                        op.p3 = reg_prev + n_result_col - 1;
                        op.p4 = P4::Unused;
                    }
                }
                let i_jump = parse.vdbe.current_addr() + n_result_col;
                for i in 0..n_result_col {
                    let coll = expr_coll(&p.elist.items[i as usize].expr)?;
                    let (op, target) = if i < n_result_col - 1 {
                        (Opcode::Ne, i_jump)
                    } else {
                        (Opcode::Eq, i_continue)
                    };
                    parse.vdbe.add_op4(
                        op,
                        reg_result + i,
                        target,
                        reg_prev + i,
                        P4::Collation(coll.id),
                    );
                    parse.vdbe.change_p5(cmp_flags::NULLEQ);
                }
                parse
                    .vdbe
                    .add_op(Opcode::Copy, reg_result, reg_prev, n_result_col - 1);
            }
            DistinctKind::Unique => {
                if let Some(addr) = d.addr_open {
                    parse.vdbe.change_to_noop(addr);
                }
            }
            DistinctKind::Unordered => {
                code_distinct(parse, d.cursor, i_continue, n_result_col, reg_result);
            }
            DistinctKind::Noop => {}
        }
        if has_distinct && sort.is_none() {
            code_offset(parse, p.i_offset, i_continue);
        }
    }

    match dest.kind {
        SelectDestKind::Union => {
            let r1 = parse.get_temp_reg();
            parse
                .vdbe
                .add_op(Opcode::MakeRecord, reg_result, n_result_col, r1);
            parse.vdbe.add_op2(Opcode::IdxInsert, dest.parm, r1);
            parse.release_temp_reg(r1);
        }
        SelectDestKind::Except => {
            parse
                .vdbe
                .add_op(Opcode::IdxDelete, dest.parm, reg_result, n_result_col);
        }
        SelectDestKind::EphemTab | SelectDestKind::Table => match sort.as_deref_mut() {
            Some(s) => push_onto_sorter(parse, s, p, reg_result, reg_orig, n_result_col, n_prefix)?,
            None => insert_ephemeral_row(parse, dest.parm, reg_result, n_result_col),
        },
        SelectDestKind::Set => match sort.as_deref_mut() {
            Some(s) => push_onto_sorter(parse, s, p, reg_result, reg_orig, n_result_col, n_prefix)?,
            None => {
                let r1 = parse.get_temp_reg();
                parse.vdbe.add_op4(
                    Opcode::MakeRecord,
                    reg_result,
                    n_result_col,
                    r1,
                    P4::Types(dest.dest_type.clone()),
                );
                parse.cache_affinity_change(reg_result, n_result_col);
                parse.vdbe.add_op2(Opcode::IdxInsert, dest.parm, r1);
                parse.release_temp_reg(r1);
            }
        },
        SelectDestKind::Exists => {
            parse.vdbe.add_op2(Opcode::Bool, 1, dest.parm);
        }
        SelectDestKind::Mem => {
            if let Some(s) = sort.as_deref_mut() {
                push_onto_sorter(parse, s, p, reg_result, reg_orig, n_result_col, n_prefix)?;
            }
        }
        SelectDestKind::Coroutine | SelectDestKind::Output => {
            if let Some(s) = sort.as_deref_mut() {
                push_onto_sorter(parse, s, p, reg_result, reg_orig, n_result_col, n_prefix)?;
            } else if dest.kind == SelectDestKind::Coroutine {
                parse.vdbe.add_op1(Opcode::Yield, dest.parm);
            } else {
                parse
                    .vdbe
                    .add_op2(Opcode::ResultRow, reg_result, n_result_col);
                parse.cache_affinity_change(reg_result, n_result_col);
            }
        }
        SelectDestKind::Fifo
        | SelectDestKind::DistFifo
        | SelectDestKind::Queue
        | SelectDestKind::DistQueue => {
            if sort.is_some() {
                return Err(parse.set_error(Error::internal("sorted rows sent to a queue")));
            }
            code_queue_insert(parse, dest, reg_result, n_result_col)?;
        }
        SelectDestKind::Discard => {}
    }

    if sort.is_none() && p.i_limit != 0 {
        parse.vdbe.add_op2(Opcode::DecrJumpZero, p.i_limit, i_break);
    }
    Ok(())
}

/// Append the `n` registers at `reg` to ephemeral table `cursor`, with a
/// fresh id as the last field
pub(crate) fn insert_ephemeral_row(parse: &mut Parse, cursor: Cursor, reg: Reg, n: i32) {
    let reg_rec = parse.get_temp_reg();
    let reg_copy = parse.get_temp_range(n + 1);
    parse
        .vdbe
        .add_op2(Opcode::NextIdEphemeral, cursor, reg_copy + n);
    parse.vdbe.add_op(Opcode::Copy, reg, reg_copy, n - 1);
    parse
        .vdbe
        .add_op(Opcode::MakeRecord, reg_copy, n + 1, reg_rec);
    parse.vdbe.add_op2(Opcode::IdxInsert, cursor, reg_rec);
    parse.release_temp_reg(reg_rec);
    parse.release_temp_range(reg_copy, n + 1);
}

/// Add the row in `n` registers at `reg` to the queue of a recursive
/// query. A `Queue` entry is the ORDER BY key, a sequence number and the
/// row as a blob; a `Fifo` entry is the row followed by a fresh id. The
/// `Dist*` kinds first look the row up in the index at `dest.parm + 1`
/// and drop it when it was queued before.
pub(crate) fn code_queue_insert(
    parse: &mut Parse,
    dest: &SelectDest,
    reg: Reg,
    n: i32,
) -> Result<()> {
    let distinct = matches!(dest.kind, SelectDestKind::DistFifo | SelectDestKind::DistQueue);
    let addr_seen = if distinct {
        Some(parse.vdbe.add_op4(
            Opcode::Found,
            dest.parm + 1,
            0,
            reg,
            P4::Int64(n as i64),
        ))
    } else {
        None
    };

    if matches!(dest.kind, SelectDestKind::Fifo | SelectDestKind::DistFifo) {
        if distinct {
            let r1 = parse.get_temp_reg();
            parse.vdbe.add_op(Opcode::MakeRecord, reg, n, r1);
            parse.vdbe.add_op2(Opcode::IdxInsert, dest.parm + 1, r1);
            parse.release_temp_reg(r1);
        }
        insert_ephemeral_row(parse, dest.parm, reg, n);
    } else {
        let Some(order_by) = dest.order_by.as_ref() else {
            return Err(parse.set_error(Error::internal("queue destination without a key")));
        };
        let n_key = order_by.len() as i32;
        let r1 = parse.get_temp_reg();
        let r2 = parse.get_temp_range(n_key + 2);
        let r3 = r2 + n_key + 1;
        parse.vdbe.add_op(Opcode::MakeRecord, reg, n, r3);
        if distinct {
            parse.vdbe.add_op2(Opcode::IdxInsert, dest.parm + 1, r3);
        }
        for (i, item) in order_by.items.iter().enumerate() {
            let col = item.order_by_col as i32;
            if col == 0 || col > n {
                return Err(parse.set_error(Error::internal("unresolved queue key term")));
            }
            parse
                .vdbe
                .add_op2(Opcode::SCopy, reg + col - 1, r2 + i as i32);
        }
        parse.vdbe.add_op2(Opcode::Sequence, dest.parm, r2 + n_key);
        parse.vdbe.add_op(Opcode::MakeRecord, r2, n_key + 2, r1);
        parse.vdbe.add_op2(Opcode::IdxInsert, dest.parm, r1);
        parse.release_temp_reg(r1);
        parse.release_temp_range(r2, n_key + 2);
    }
    if let Some(addr) = addr_seen {
        parse.vdbe.jump_here(addr);
    }
    Ok(())
}

/// Read the rows back from the ORDER BY sorter in order and hand them to
/// `dest`
pub(crate) fn generate_sort_tail(
    parse: &mut Parse,
    p: &Select,
    sort: &SortCtx,
    n_column: i32,
    dest: &mut SelectDest,
) -> Result<()> {
    let addr_break = sort.label_done;
    let addr_continue = parse.make_label();
    let i_tab = sort.cursor;
    trace!(cursor = i_tab, use_sorter = sort.use_sorter, "sort tail");

    if sort.label_bk_out != 0 {
        parse
            .vdbe
            .add_op2(Opcode::Gosub, sort.reg_return, sort.label_bk_out);
        parse.vdbe.add_op2(Opcode::Goto, 0, addr_break);
        parse.resolve_label(sort.label_bk_out);
    }

    let direct = matches!(
        dest.kind,
        SelectDestKind::Output | SelectDestKind::Coroutine | SelectDestKind::Mem
    );
    let reg_row = if direct {
        if dest.sdst == 0 {
            dest.sdst = parse.alloc_regs(n_column);
            dest.n_sdst = n_column;
        }
        dest.sdst
    } else {
        parse.get_temp_range(n_column)
    };
    let n_key = (sort.order_by.len() - sort.n_ob_sat) as i32;

    let (addr, i_sort_tab, b_seq) = if sort.use_sorter {
        let reg_sort_out = parse.alloc_reg();
        let i_sort_tab = parse.alloc_cursor();
        let addr_once = if sort.label_bk_out != 0 {
            Some(parse.vdbe.add_op0(Opcode::Once))
        } else {
            None
        };
        parse
            .vdbe
            .add_op(Opcode::OpenPseudo, i_sort_tab, reg_sort_out, n_key + 1 + n_column);
        if let Some(a) = addr_once {
            parse.vdbe.jump_here(a);
        }
        let addr = 1 + parse.vdbe.add_op2(Opcode::SorterSort, i_tab, addr_break);
        code_offset(parse, p.i_offset, addr_continue);
        parse
            .vdbe
            .add_op(Opcode::SorterData, i_tab, reg_sort_out, i_sort_tab);
        (addr, i_sort_tab, 0)
    } else {
        let addr = 1 + parse.vdbe.add_op2(Opcode::Sort, i_tab, addr_break);
        code_offset(parse, p.i_offset, addr_continue);
        (addr, i_tab, 1)
    };

    let mut i_col = n_key + b_seq;
    for (i, item) in p.elist.items.iter().enumerate().take(n_column as usize) {
        let i_read = if item.order_by_col > 0 {
            item.order_by_col as i32 - 1
        } else {
            i_col += 1;
            i_col - 1
        };
        parse
            .vdbe
            .add_op(Opcode::Column, i_sort_tab, i_read, reg_row + i as i32);
        if let Some(name) = item.name.as_ref().or(item.span.as_ref()) {
            parse.vdbe.comment(name.clone());
        }
    }

    match dest.kind {
        SelectDestKind::EphemTab | SelectDestKind::Table => {
            insert_ephemeral_row(parse, dest.parm, reg_row, n_column);
        }
        SelectDestKind::Set => {
            let r1 = parse.get_temp_reg();
            parse.vdbe.add_op4(
                Opcode::MakeRecord,
                reg_row,
                n_column,
                r1,
                P4::Types(dest.dest_type.clone()),
            );
            parse.cache_affinity_change(reg_row, n_column);
            parse.vdbe.add_op2(Opcode::IdxInsert, dest.parm, r1);
            parse.release_temp_reg(r1);
        }
        SelectDestKind::Output => {
            parse.vdbe.add_op2(Opcode::ResultRow, reg_row, n_column);
            parse.cache_affinity_change(reg_row, n_column);
        }
        SelectDestKind::Coroutine => {
            parse.vdbe.add_op1(Opcode::Yield, dest.parm);
        }
        _ => {}
    }
    if !direct {
        parse.release_temp_range(reg_row, n_column);
    }

    parse.resolve_label(addr_continue);
    if sort.use_sorter {
        if p.i_limit != 0 {
            let i_limit = if p.i_offset != 0 {
                p.i_offset + 1
            } else {
                p.i_limit
            };
            parse.vdbe.add_op2(Opcode::DecrJumpZero, i_limit, addr_break);
        }
        parse.vdbe.add_op2(Opcode::SorterNext, i_tab, addr);
    } else {
        parse.vdbe.add_op2(Opcode::Next, i_tab, addr);
    }
    if sort.reg_return != 0 {
        parse.vdbe.add_op1(Opcode::Return, sort.reg_return);
    }
    parse.resolve_label(addr_break);
    Ok(())
}

/// Describe the result columns of the outermost select. Only the first
/// call has an effect.
pub(crate) fn generate_column_metadata(parse: &mut Parse, p: &Select) -> Result<()> {
    if !parse.columns.is_empty() {
        return Ok(());
    }
    let mut columns = Vec::with_capacity(p.elist.len());
    for (i, item) in p.elist.items.iter().enumerate() {
        let expr = &item.expr;
        let col = match &expr.kind {
            ExprKind::Column(c) | ExprKind::AggColumn { col: c, .. } => Some(c),
            _ => None,
        };
        let name = item
            .name
            .clone()
            .or_else(|| col.map(|c| c.name().to_string()))
            .or_else(|| item.span.clone())
            .unwrap_or_else(|| format!("COLUMN_{}", i + 1));
        let decl_type = expr_type(expr);
        let nullable = col
            .and_then(|c| c.def())
            .map_or(true, |d| d.is_nullable);
        let collation = if matches!(decl_type, FieldType::String | FieldType::Scalar) {
            collation_name(expr_coll(expr)?.id)
        } else {
            None
        };
        columns.push(ColumnMeta {
            name,
            decl_type,
            nullable,
            collation,
            span: item.span.clone(),
        });
    }
    parse.columns = columns;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompileConfig;
    use crate::parser::ast::{SrcItem, SrcList};
    use crate::schema::{Column, Table, COLL_UNICODE_CI};

    fn select_with_limit(limit: Expr, offset: Option<Expr>) -> Select {
        let mut s = Select::new(ExprList::from_exprs(vec![Expr::int(1)]), SrcList::new(), None);
        s.limit = Some(Box::new(limit));
        s.offset = offset.map(Box::new);
        s
    }

    #[test]
    fn test_limit_counter_checks_value() {
        let mut parse = Parse::new(CompileConfig::default());
        let mut s = select_with_limit(Expr::int(10), Some(Expr::int(5)));
        let end = parse.make_label();
        compute_limit_registers(&mut parse, &mut s, end).unwrap();
        parse.resolve_label(end);
        assert!(s.i_limit > 0);
        assert!(s.i_offset > s.i_limit);
        // LIMIT+OFFSET lives right after the OFFSET counter
        assert!(parse.n_mem > s.i_offset);
        let program = parse.finish().unwrap();
        assert_eq!(program.count(Opcode::MustBeInt), 2);
        assert_eq!(program.count(Opcode::OffsetLimit), 1);
        let diags: Vec<String> = program
            .ops_with(Opcode::SetDiag)
            .iter()
            .map(|op| match &op.p4 {
                P4::Text(t) => t.clone(),
                _ => String::new(),
            })
            .collect();
        assert!(diags[0].contains("LIMIT clause"));
        assert!(diags[1].contains("OFFSET clause"));
    }

    #[test]
    fn test_collate_in_limit_is_rejected() {
        let mut parse = Parse::new(CompileConfig::default());
        let mut s = select_with_limit(Expr::collate(Expr::int(1), "binary"), None);
        let end = parse.make_label();
        let err = compute_limit_registers(&mut parse, &mut s, end).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Syntax);
        assert!(err.to_string().contains("COLLATE"));
    }

    #[test]
    fn test_system_limit_of_scalar_subquery_reads_two_rows() {
        let mut parse = Parse::new(CompileConfig::default());
        let mut limit = Expr::int(1);
        limit.flags |= ExprFlags::SYSTEM;
        let mut s = select_with_limit(limit, None);
        s.flags |= SelectFlags::SINGLE_ROW;
        let end = parse.make_label();
        compute_limit_registers(&mut parse, &mut s, end).unwrap();
        parse.resolve_label(end);
        assert!(s.has_flag(SelectFlags::SINGLE_ROW));
        let program = parse.finish().unwrap();
        assert!(program
            .ops_with(Opcode::Integer)
            .iter()
            .any(|op| op.p1 == 2 && op.p2 == s.i_limit));
    }

    #[test]
    fn test_key_info_carries_collation_and_order() {
        let t = Arc::new(Table::new(
            "t",
            vec![Column::new("s", FieldType::String).with_collation(COLL_UNICODE_CI)],
        ));
        let mut list = ExprList::new();
        list.push_sorted(Expr::column(&t, 0, 0), SortOrder::Desc);
        let key = key_info_from_expr_list(&list, 0, 1).unwrap();
        assert_eq!(key.len(), 2);
        assert_eq!(key.parts[0].coll_id, COLL_UNICODE_CI);
        assert!(key.parts[0].sort_order.is_desc());
    }

    #[test]
    fn test_inner_loop_output_and_limit() {
        let t = Arc::new(Table::new("t", vec![Column::new("a", FieldType::Integer)]));
        let mut parse = Parse::new(CompileConfig::default());
        let mut s = Select::new(
            ExprList::from_exprs(vec![Expr::column(&t, 0, 0)]),
            SrcList::single(SrcItem::table(t.clone(), 0)),
            None,
        );
        s.i_limit = parse.alloc_reg();
        let mut dest = SelectDest::output();
        let cont = parse.make_label();
        let brk = parse.make_label();
        select_inner_loop(&mut parse, &mut s, -1, None, None, &mut dest, cont, brk).unwrap();
        parse.resolve_label(cont);
        parse.resolve_label(brk);
        assert_eq!(dest.n_sdst, 1);
        let program = parse.finish().unwrap();
        let ops = program.opcodes();
        let row = program.position(Opcode::ResultRow).unwrap();
        assert_eq!(ops[row + 1], Opcode::DecrJumpZero);
    }

    #[test]
    fn test_queue_insert_layouts() {
        let mut parse = Parse::new(CompileConfig::default());
        let reg = parse.alloc_regs(2);
        let dest = SelectDest::new(SelectDestKind::DistFifo, 3);
        code_queue_insert(&mut parse, &dest, reg, 2).unwrap();

        let mut order_by = ExprList::new();
        order_by.push(Expr::int(2));
        order_by.items[0].order_by_col = 2;
        let mut dest = SelectDest::new(SelectDestKind::Queue, 5);
        dest.order_by = Some(order_by);
        code_queue_insert(&mut parse, &dest, reg, 2).unwrap();

        let program = parse.finish().unwrap();
        let found = program.ops_with(Opcode::Found);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].p1, 4);
        assert_eq!(program.count(Opcode::NextIdEphemeral), 1);
        // key term is the second result column
        let copy = program.ops_with(Opcode::SCopy)[0];
        assert_eq!(copy.p1, reg + 1);
        let seq = program.ops_with(Opcode::Sequence)[0];
        assert_eq!(seq.p1, 5);
        assert_eq!(seq.p2, copy.p2 + 1);
        let inserts: Vec<i32> = program.ops_with(Opcode::IdxInsert).iter().map(|op| op.p1).collect();
        assert_eq!(inserts, vec![4, 3, 5]);
    }

    #[test]
    fn test_queue_without_key_is_rejected() {
        let mut parse = Parse::new(CompileConfig::default());
        let reg = parse.alloc_regs(1);
        let dest = SelectDest::new(SelectDestKind::DistQueue, 0);
        let err = code_queue_insert(&mut parse, &dest, reg, 1).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
    }

    #[test]
    fn test_column_metadata_names() {
        let t = Arc::new(Table::new(
            "t",
            vec![Column::new("a", FieldType::Integer).not_null()],
        ));
        let mut elist = ExprList::new();
        elist.push(Expr::column(&t, 0, 0));
        elist.push_named(Expr::int(1), "one");
        elist.push(Expr::int(2));
        let s = Select::new(elist, SrcList::single(SrcItem::table(t, 0)), None);
        let mut parse = Parse::new(CompileConfig::default());
        generate_column_metadata(&mut parse, &s).unwrap();
        let names: Vec<&str> = parse.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["a", "one", "COLUMN_3"]);
        assert!(!parse.columns[0].nullable);
        assert_eq!(parse.columns[0].decl_type, FieldType::Integer);
    }
}
