//! SELECT statement code generation
//!
//! [`sql_select`] compiles one SELECT into the program of a [`Parse`]. The
//! steps, in order:
//!
//! 1. a compound with a COLLATE in its ORDER BY is wrapped into a subquery;
//! 2. FROM-clause subqueries are flattened into the outer query where
//!    possible;
//! 3. a compound is handed to [`compound`] (temp tables) or [`merge`]
//!    (co-routine merge when there is an ORDER BY);
//! 4. the remaining FROM subqueries are run as a co-routine or
//!    materialized into ephemeral tables, after outer WHERE terms were
//!    pushed into them;
//! 5. the loops are opened and the result rows are coded, through the
//!    aggregate machinery when the query aggregates;
//! 6. rows buffered for ORDER BY are read back in order.

mod types;
pub use types::{DistinctCtx, DistinctKind, SelectDest, SelectDestKind, SortCtx};

pub mod aggregate;
mod compound;
mod flatten;
mod inner;
mod merge;
mod recursive;

pub use flatten::{flatten_subquery, push_down_where_terms, substitute_expr};

use std::sync::Arc;

use tracing::{debug, instrument, Level};

use crate::config::CompileConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::executor::expr::analyze::{check_height, expr_compare, expr_list_compare};
use crate::executor::expr::codegen::CodeListFlags;
use crate::executor::parse::Parse;
use crate::executor::wherecode::{where_begin, where_end, WhereFlags};
use crate::parser::ast::{
    Expr, ExprKind, ExprList, JoinType, Select, SelectFlags, SrcItemFlags,
};
use crate::parser::walker::{expr_contains, walk_select, ExprWalker, WalkResult};
use crate::types::{Cursor, SortOrder};
use crate::vdbe::builder::Program;
use crate::vdbe::ops::{cmp_flags, Opcode, P4};

use aggregate::{
    analyze_aggregates, finalize_agg_functions, is_simple_count, min_max_query, reset_accumulator,
    update_accumulator,
};
use compound::{convert_compound_to_subquery, multi_select};
use inner::{
    code_raise_on_multiple_rows, compute_limit_registers, generate_column_metadata,
    generate_sort_tail, key_info_from_expr_list, select_inner_loop,
};

/// Highest cursor number used anywhere in a select tree
struct CursorScan {
    max: Cursor,
}

impl ExprWalker for CursorScan {
    fn walk_expr(&mut self, expr: &Expr) -> WalkResult {
        if let ExprKind::Column(c) | ExprKind::AggColumn { col: c, .. } = &expr.kind {
            self.max = self.max.max(c.cursor);
        }
        WalkResult::Continue
    }

    fn walk_select(&mut self, select: &Select) -> WalkResult {
        for item in &select.src.items {
            self.max = self.max.max(item.cursor);
        }
        WalkResult::Continue
    }
}

/// Make sure cursors allocated from now on do not collide with the ones
/// already assigned in `p`
fn reserve_cursors(parse: &mut Parse, p: &Select) {
    let mut scan = CursorScan { max: -1 };
    walk_select(&mut scan, p);
    parse.n_tab = parse.n_tab.max(scan.max + 1);
}

fn is_agg_call(e: &Expr) -> bool {
    matches!(e.kind, ExprKind::AggFunction { .. })
}

/// `s` computes aggregates: it has a GROUP BY or an aggregate call in its
/// result list, HAVING or ORDER BY
fn has_aggregate(s: &Select) -> bool {
    s.has_flag(SelectFlags::AGGREGATE)
        || s.group_by.is_some()
        || s.elist.exprs().any(|e| expr_contains(e, is_agg_call))
        || s.having.as_deref().is_some_and(|h| expr_contains(h, is_agg_call))
        || s
            .order_by
            .as_ref()
            .is_some_and(|ob| ob.exprs().any(|e| expr_contains(e, is_agg_call)))
}

/// Compile `p`, sending its rows to `dest`. `dest.sdst`/`dest.n_sdst` are
/// set to the result registers the rows were built in.
#[instrument(skip_all, level = Level::DEBUG, fields(select = p.id))]
pub fn sql_select(parse: &mut Parse, p: &mut Select, dest: &mut SelectDest) -> Result<()> {
    parse.check()?;
    parse.nested += 1;
    let res = select_body(parse, p, dest);
    parse.nested -= 1;
    res.map_err(|e| parse.set_error(e))
}

fn select_body(parse: &mut Parse, p: &mut Select, dest: &mut SelectDest) -> Result<()> {
    if p.id == 0 {
        p.id = parse.next_select_id();
    }
    reserve_cursors(parse, p);

    if dest.kind.ignores_order() {
        p.order_by = None;
        p.flags.remove(SelectFlags::DISTINCT);
    }
    if convert_compound_to_subquery(parse, p)? {
        debug!(select = p.id, "compound wrapped into a subquery");
        reserve_cursors(parse, p);
    }
    check_height(p.max_height(), parse.config.max_expr_depth)?;
    if has_aggregate(p) {
        p.flags |= SelectFlags::AGGREGATE;
    }

    flatten_from_subqueries(parse, p)?;

    if p.prior.is_some() {
        let end = parse.make_label();
        multi_select(parse, p, dest)?;
        if p.has_flag(SelectFlags::SINGLE_ROW) && p.i_limit != 0 {
            code_raise_on_multiple_rows(parse, p.i_limit, end);
        }
        parse.resolve_label(end);
        return Ok(());
    }

    code_from_subqueries(parse, p)?;

    let mut sort = SortCtx::default();
    if let Some(ob) = &p.order_by {
        sort.order_by = ob.clone();
    }

    // SELECT DISTINCT a,b ... ORDER BY a,b  ==>  GROUP BY a,b
    if p.flags & (SelectFlags::DISTINCT | SelectFlags::AGGREGATE) == SelectFlags::DISTINCT
        && expr_list_compare(p.order_by.as_ref(), Some(&p.elist), -1) == 0
    {
        p.flags.remove(SelectFlags::DISTINCT);
        p.group_by = Some(p.elist.clone());
        p.flags |= SelectFlags::AGGREGATE;
        debug!(select = p.id, "DISTINCT coded as GROUP BY");
    }

    if !sort.is_empty() {
        let key = key_info_from_expr_list(&sort.order_by, 0, 1)?;
        sort.cursor = parse.alloc_cursor();
        let n_col = (sort.order_by.len() + 1 + p.elist.len()) as i32;
        let key = Arc::new(key);
        sort.addr_open = Some(parse.vdbe.add_op4(
            Opcode::OpenEphemeral,
            sort.cursor,
            n_col,
            0,
            P4::KeyInfo(key.clone()),
        ));
        sort.key_info = Some(key);
        sort.label_done = parse.make_label();
    }

    if dest.kind == SelectDestKind::EphemTab {
        let key = key_info_from_expr_list(&p.elist, 0, 0)?;
        parse.vdbe.add_op4(
            Opcode::OpenEphemeral,
            dest.parm,
            p.elist.len() as i32 + 1,
            0,
            P4::KeyInfo(Arc::new(key)),
        );
    }

    let i_end = parse.make_label();
    compute_limit_registers(parse, p, i_end)?;
    if let Some(addr) = sort.addr_open {
        // an ordered index is only kept to trim the buffer to LIMIT rows
        if p.i_limit == 0 || uniform_direction(&sort.order_by).is_none() {
            if let Some(op) = parse.vdbe.op_at_mut(addr) {
                op.opcode = Opcode::SorterOpen;
            }
            sort.use_sorter = true;
        }
    }

    let mut distinct = DistinctCtx::default();
    if p.has_flag(SelectFlags::DISTINCT) {
        distinct.cursor = parse.alloc_cursor();
        let key = key_info_from_expr_list(&p.elist, 0, 0)?;
        distinct.addr_open = Some(parse.vdbe.add_op4(
            Opcode::OpenEphemeral,
            distinct.cursor,
            0,
            0,
            P4::KeyInfo(Arc::new(key)),
        ));
        distinct.is_distinct = true;
        distinct.kind = DistinctKind::Unordered;
    }

    if !p.has_flag(SelectFlags::AGGREGATE) {
        code_simple_select(parse, p, &mut sort, &mut distinct, dest)?;
    } else if p.group_by.is_some() {
        code_group_by(parse, p, &mut sort, &mut distinct, dest)?;
    } else {
        code_single_row_aggregate(parse, p, &mut sort, &mut distinct, dest)?;
    }

    if !sort.is_empty() {
        generate_sort_tail(parse, p, &sort, p.elist.len() as i32, dest)?;
    }
    if p.has_flag(SelectFlags::SINGLE_ROW) && p.i_limit != 0 {
        code_raise_on_multiple_rows(parse, p.i_limit, i_end);
    }
    parse.resolve_label(i_end);
    if dest.kind == SelectDestKind::Output && parse.nested == 1 {
        generate_column_metadata(parse, p)?;
    }
    Ok(())
}

/// Merge every FROM subquery that allows it into `p`, restarting after each
/// success since the FROM list changed
fn flatten_from_subqueries(parse: &mut Parse, p: &mut Select) -> Result<()> {
    let mut i = 0;
    while p.prior.is_none() && i < p.src.len() {
        let item = &p.src.items[i];
        let Some(sub) = item.select.as_deref() else {
            i += 1;
            continue;
        };
        if let Some(table) = &item.table {
            if table.columns.len() != sub.elist.len() {
                return Err(Error::with_message(
                    ErrorCode::Error,
                    format!(
                        "Failed to create space '{}': number of aliases doesn't match provided columns",
                        item.name()
                    ),
                ));
            }
        }
        let sub_is_agg = has_aggregate(sub);
        let is_agg = p.has_flag(SelectFlags::AGGREGATE);
        if flatten_subquery(parse, p, i, is_agg, sub_is_agg)? {
            if sub_is_agg {
                p.flags |= SelectFlags::AGGREGATE;
            }
            i = 0;
        } else {
            i += 1;
        }
    }
    Ok(())
}

/// Code the FROM subqueries that survived flattening: the first one as a
/// co-routine when its rows are read once in order, the others into
/// ephemeral tables filled once (or on every use, when correlated)
fn code_from_subqueries(parse: &mut Parse, p: &mut Select) -> Result<()> {
    let n_src = p.src.len();
    let second_allows_coroutine = p
        .src
        .items
        .get(1)
        .map_or(true, |it| it.join_type.intersects(JoinType::LEFT | JoinType::CROSS));
    let enable_coroutines = parse.config.enable_coroutines && !p.has_flag(SelectFlags::ALL);

    for i in 0..n_src {
        let where_expr = p.where_clause.as_deref();
        let item = &mut p.src.items[i];
        if item.select.is_none() {
            continue;
        }
        if item.addr_fill_sub != 0 {
            if !item.fg.contains(SrcItemFlags::VIA_COROUTINE) {
                parse
                    .vdbe
                    .add_op2(Opcode::Gosub, item.reg_return, item.addr_fill_sub);
            }
            continue;
        }
        let Some(mut sub) = item.select.take() else {
            continue;
        };
        let cursor = item.cursor;

        if !item.join_type.intersects(JoinType::LEFT | JoinType::OUTER) {
            push_down_where_terms(parse, &mut sub, where_expr, cursor)?;
        }

        let res = if i == 0 && second_allows_coroutine && enable_coroutines {
            let reg_yield = parse.alloc_reg();
            let addr_top = parse.vdbe.current_addr() + 1;
            parse
                .vdbe
                .add_op(Opcode::InitCoroutine, reg_yield, 0, addr_top);
            parse.vdbe.comment(format!("co-routine {}", item.name()));
            item.addr_fill_sub = addr_top;
            let mut sub_dest = SelectDest::new(SelectDestKind::Coroutine, reg_yield);
            let res = sql_select(parse, &mut sub, &mut sub_dest);
            item.reg_return = reg_yield;
            item.reg_result = sub_dest.sdst;
            item.fg |= SrcItemFlags::VIA_COROUTINE;
            parse.vdbe.add_op1(Opcode::EndCoroutine, reg_yield);
            parse.vdbe.jump_here(addr_top - 1);
            parse.clear_temp_reg_cache();
            res
        } else {
            let reg_return = parse.alloc_reg();
            item.reg_return = reg_return;
            let top = parse.vdbe.add_op2(Opcode::Integer, 0, reg_return);
            item.addr_fill_sub = top + 1;
            let once = if item.fg.contains(SrcItemFlags::CORRELATED) {
                None
            } else {
                Some(parse.vdbe.add_op0(Opcode::Once))
            };
            parse.vdbe.comment(format!("materialize {}", item.name()));
            let mut sub_dest = SelectDest::new(SelectDestKind::EphemTab, cursor);
            let res = sql_select(parse, &mut sub, &mut sub_dest);
            if let Some(addr) = once {
                parse.vdbe.jump_here(addr);
            }
            let ret = parse.vdbe.add_op1(Opcode::Return, reg_return);
            parse.vdbe.change_p1(top, ret);
            parse.clear_temp_reg_cache();
            res
        };
        item.select = Some(sub);
        res?;
    }
    Ok(())
}

/// Non-aggregate query: one pass over the loops, each row through the
/// inner loop
fn code_simple_select(
    parse: &mut Parse,
    p: &mut Select,
    sort: &mut SortCtx,
    distinct: &mut DistinctCtx,
    dest: &mut SelectDest,
) -> Result<()> {
    let flags = if distinct.is_distinct {
        WhereFlags::WANT_DISTINCT
    } else {
        WhereFlags::empty()
    };
    let winfo = where_begin(
        parse,
        &p.src,
        p.where_clause.as_deref(),
        (!sort.is_empty()).then_some(&sort.order_by),
        distinct.is_distinct.then_some(&p.elist),
        flags,
    )?;

    if !sort.is_empty() {
        sort.n_ob_sat = winfo.n_ob_sat();
        if sort.n_ob_sat == sort.order_by.len() {
            if let Some(addr) = sort.addr_open.take() {
                parse.vdbe.change_to_noop(addr);
            }
            sort.order_by = ExprList::new();
        }
    }
    if distinct.is_distinct {
        distinct.kind = match winfo.distinct() {
            DistinctKind::Noop => DistinctKind::Unordered,
            kind => kind,
        };
    }

    let i_continue = winfo.continue_label();
    let i_break = winfo.break_label();
    select_inner_loop(
        parse,
        p,
        -1,
        Some(sort),
        Some(distinct),
        dest,
        i_continue,
        i_break,
    )?;
    where_end(parse, winfo)
}

/// Aggregate query with GROUP BY. Rows are sorted on the GROUP BY terms
/// (unless the scan already delivers them in that order) and accumulated
/// one group at a time; a subroutine outputs each finished group.
fn code_group_by(
    parse: &mut Parse,
    p: &mut Select,
    sort: &mut SortCtx,
    distinct: &mut DistinctCtx,
    dest: &mut SelectDest,
) -> Result<()> {
    let Some(mut group_by) = p.group_by.clone() else {
        return Err(Error::internal("GROUP BY coding without GROUP BY"));
    };
    // sort the groups the way the ORDER BY wants them where the terms
    // agree; an ORDER BY equal to the GROUP BY then comes for free
    for (g, o) in group_by.items.iter_mut().zip(&sort.order_by.items) {
        if expr_compare(&g.expr, &o.expr, -1) != 0 {
            break;
        }
        g.sort_order = o.sort_order;
    }
    let order_by_grp =
        !sort.is_empty() && expr_list_compare(Some(&group_by), Some(&sort.order_by), -1) == 0;

    let info = analyze_aggregates(parse, p)?;
    // the ORDER BY now reads the accumulator
    if let (false, Some(ob)) = (sort.is_empty(), &p.order_by) {
        sort.order_by = ob.clone();
    }
    let n_gb = group_by.len() as i32;
    let n_sorting_column = parse
        .aggs
        .get(info)
        .map(|a| a.n_sorting_column)
        .unwrap_or(group_by.len()) as i32;

    let agg_sorter = parse.alloc_cursor();
    let sorter_key = key_info_from_expr_list(&group_by, 0, (n_sorting_column - n_gb) as usize)?;
    let addr_sorter_open = parse.vdbe.add_op4(
        Opcode::SorterOpen,
        agg_sorter,
        n_sorting_column,
        0,
        P4::KeyInfo(Arc::new(sorter_key)),
    );

    let i_use_flag = parse.alloc_reg();
    let i_abort_flag = parse.alloc_reg();
    let reg_output_row = parse.alloc_reg();
    let addr_output_row = parse.make_label();
    let reg_reset = parse.alloc_reg();
    let addr_reset = parse.make_label();
    let addr_end = parse.make_label();
    let i_a_mem = parse.alloc_regs(n_gb);
    let i_b_mem = parse.alloc_regs(n_gb);

    parse.vdbe.add_op2(Opcode::Integer, 0, i_abort_flag);
    parse.vdbe.comment("clear abort flag");
    parse.vdbe.add_op2(Opcode::Integer, 0, i_use_flag);
    parse.vdbe.comment("indicate accumulator empty");
    parse.vdbe.add_op(Opcode::Null, 0, i_a_mem, i_a_mem + n_gb - 1);
    parse.vdbe.add_op2(Opcode::Gosub, reg_reset, addr_reset);

    let winfo = where_begin(
        parse,
        &p.src,
        p.where_clause.as_deref(),
        Some(&group_by),
        None,
        WhereFlags::GROUPBY,
    )?;
    let group_by_sort = winfo.n_ob_sat() < group_by.len();
    debug!(select = p.id, group_by_sort, "GROUP BY");

    let mut sorter = None;
    let winfo = if group_by_sort {
        let columns = parse
            .aggs
            .get(info)
            .map(|a| a.columns.clone())
            .unwrap_or_default();
        let reg_base = parse.get_temp_range(n_sorting_column);
        parse.expr_code_expr_list(&group_by, reg_base, 0, CodeListFlags::empty())?;
        for col in columns.iter().filter(|c| c.i_sorter_column >= group_by.len()) {
            parse.expr_code_get_column_to_reg(
                col.cursor,
                col.column,
                reg_base + col.i_sorter_column as i32,
            );
        }
        let reg_record = parse.get_temp_reg();
        parse
            .vdbe
            .add_op(Opcode::MakeRecord, reg_base, n_sorting_column, reg_record);
        parse.vdbe.add_op2(Opcode::SorterInsert, agg_sorter, reg_record);
        parse.release_temp_reg(reg_record);
        parse.release_temp_range(reg_base, n_sorting_column);
        where_end(parse, winfo)?;

        let sort_ptab = parse.alloc_cursor();
        let sort_out = parse.alloc_reg();
        parse
            .vdbe
            .add_op(Opcode::OpenPseudo, sort_ptab, sort_out, n_sorting_column);
        parse.vdbe.add_op2(Opcode::SorterSort, agg_sorter, addr_end);
        parse.vdbe.comment("GROUP BY sort");
        if let Some(agg) = parse.aggs.get_mut(info) {
            agg.sorting_idx = agg_sorter;
            agg.sorting_idx_ptab = sort_ptab;
            agg.use_sorting_idx = true;
        }
        sorter = Some((sort_ptab, sort_out));
        None
    } else {
        Some(winfo)
    };

    // groups come out in ORDER BY order already
    if order_by_grp {
        if let Some(addr) = sort.addr_open.take() {
            parse.vdbe.change_to_noop(addr);
        }
        sort.order_by = ExprList::new();
    }

    let addr_top_of_loop = parse.vdbe.current_addr();
    if let Some((sort_ptab, sort_out)) = sorter {
        parse
            .vdbe
            .add_op(Opcode::SorterData, agg_sorter, sort_out, sort_ptab);
        for j in 0..n_gb {
            parse
                .vdbe
                .add_op(Opcode::Column, sort_ptab, j, i_b_mem + j);
        }
    } else {
        for (j, item) in group_by.items.iter().enumerate() {
            parse.expr_code(&item.expr, i_b_mem + j as i32)?;
        }
    }
    let compare_key = key_info_from_expr_list(&group_by, 0, 0)?;
    parse.vdbe.add_op4(
        Opcode::Compare,
        i_a_mem,
        i_b_mem,
        n_gb,
        P4::KeyInfo(Arc::new(compare_key)),
    );
    let addr1 = parse.vdbe.current_addr();
    parse.vdbe.add_op(Opcode::Jump, addr1 + 1, 0, addr1 + 1);

    // a new group starts: output the previous one and reset
    parse.expr_code_move(i_b_mem, i_a_mem, n_gb);
    parse.vdbe.add_op2(Opcode::Gosub, reg_output_row, addr_output_row);
    parse.vdbe.comment("output one row");
    parse.vdbe.add_op2(Opcode::IfPos, i_abort_flag, addr_end);
    parse.vdbe.comment("check abort flag");
    parse.vdbe.add_op2(Opcode::Gosub, reg_reset, addr_reset);
    parse.vdbe.comment("reset accumulator");

    parse.vdbe.jump_here(addr1);
    update_accumulator(parse, info)?;
    parse.vdbe.add_op2(Opcode::Integer, 1, i_use_flag);
    parse.vdbe.comment("indicate data in accumulator");

    match winfo {
        None => {
            parse
                .vdbe
                .add_op2(Opcode::SorterNext, agg_sorter, addr_top_of_loop);
        }
        Some(winfo) => {
            where_end(parse, winfo)?;
            parse.vdbe.change_to_noop(addr_sorter_open);
        }
    }

    parse.vdbe.add_op2(Opcode::Gosub, reg_output_row, addr_output_row);
    parse.vdbe.comment("output final row");
    parse.vdbe.add_op2(Opcode::Goto, 0, addr_end);

    // LIMIT reached inside the output subroutine
    let addr_set_abort = parse.vdbe.current_addr();
    parse.vdbe.add_op2(Opcode::Integer, 1, i_abort_flag);
    parse.vdbe.comment("set abort flag");
    parse.vdbe.add_op1(Opcode::Return, reg_output_row);

    parse.resolve_label(addr_output_row);
    let addr_output = parse.vdbe.current_addr();
    parse.vdbe.add_op2(Opcode::IfPos, i_use_flag, addr_output + 2);
    parse.vdbe.comment("GROUP BY result generator entry point");
    parse.vdbe.add_op1(Opcode::Return, reg_output_row);
    finalize_agg_functions(parse, info)?;
    if let Some(having) = p.having.clone() {
        parse.expr_if_false(&having, addr_output + 1, cmp_flags::JUMPIFNULL)?;
    }
    select_inner_loop(
        parse,
        p,
        -1,
        Some(sort),
        Some(distinct),
        dest,
        addr_output + 1,
        addr_set_abort,
    )?;
    parse.vdbe.add_op1(Opcode::Return, reg_output_row);
    parse.vdbe.comment("end GROUP BY result generator");

    parse.resolve_label(addr_reset);
    reset_accumulator(parse, info)?;
    parse.vdbe.add_op1(Opcode::Return, reg_reset);
    parse.resolve_label(addr_end);
    Ok(())
}

/// Aggregate query without GROUP BY: exactly one output row
fn code_single_row_aggregate(
    parse: &mut Parse,
    p: &mut Select,
    sort: &mut SortCtx,
    distinct: &mut DistinctCtx,
    dest: &mut SelectDest,
) -> Result<()> {
    // one row needs neither sorting nor deduplication
    if let Some(addr) = sort.addr_open.take() {
        parse.vdbe.change_to_noop(addr);
    }
    sort.order_by = ExprList::new();
    if let Some(addr) = distinct.addr_open.take() {
        parse.vdbe.change_to_noop(addr);
    }

    let info = analyze_aggregates(parse, p)?;
    let agg = parse
        .aggs
        .get(info)
        .cloned()
        .ok_or_else(|| Error::internal("no aggregate context"))?;
    let addr_end = parse.make_label();

    let count_table = if parse.config.enable_count_fast_path {
        is_simple_count(p, &agg)
    } else {
        None
    };
    if let (Some(table), Some(func)) = (count_table, agg.funcs.first()) {
        let cursor = p.src.items[0].cursor;
        parse
            .vdbe
            .add_op4(Opcode::OpenRead, cursor, 0, 0, P4::Table(table.name.clone()));
        parse.vdbe.add_op2(Opcode::Count, cursor, func.i_mem);
        parse.vdbe.add_op1(Opcode::Close, cursor);
        debug!(table = %table.name, "count(*) from table cardinality");
    } else {
        let hint = if parse.config.enable_min_max_hint && p.having.is_none() {
            min_max_query(&agg)
        } else {
            None
        };
        let (flags, order) = match hint {
            Some((flags, order)) => (flags, Some(order)),
            None => (WhereFlags::empty(), None),
        };
        reset_accumulator(parse, info)?;
        let winfo = where_begin(
            parse,
            &p.src,
            p.where_clause.as_deref(),
            order.as_ref(),
            None,
            flags,
        )?;
        update_accumulator(parse, info)?;
        if order.is_some() && winfo.min_max_single_row() {
            parse.vdbe.add_op2(Opcode::Goto, 0, winfo.break_label());
            parse.vdbe.comment(if flags.contains(WhereFlags::ORDERBY_MIN) {
                "min() by index"
            } else {
                "max() by index"
            });
        }
        where_end(parse, winfo)?;
        finalize_agg_functions(parse, info)?;
    }

    if let Some(having) = p.having.clone() {
        parse.expr_if_false(&having, addr_end, cmp_flags::JUMPIFNULL)?;
    }
    select_inner_loop(parse, p, -1, None, None, dest, addr_end, addr_end)?;
    parse.resolve_label(addr_end);
    Ok(())
}

/// Compile `select` as a complete statement returning its rows
pub fn compile_select(select: &Select, config: CompileConfig) -> Result<Program> {
    let mut parse = Parse::new(config);
    let mut select = select.clone();
    let mut dest = SelectDest::output();
    sql_select(&mut parse, &mut select, &mut dest)?;
    parse.finish()
}

/// Sort direction shared by every term of `list`, if any
fn uniform_direction(list: &ExprList) -> Option<SortOrder> {
    let first = list.items.first()?.sort_order;
    list.items
        .iter()
        .all(|i| i.sort_order == first)
        .then_some(first)
}
