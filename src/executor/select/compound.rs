//! Compound SELECT without ORDER BY
//!
//! UNION ALL runs the branches one after the other into the same
//! destination. UNION and EXCEPT collect the left side into an ephemeral
//! index and insert or delete the right side; INTERSECT fills two indexes
//! and scans the first for keys present in the second. A compound with an
//! ORDER BY is handed to the merge-join in [`super::merge`].

use std::sync::Arc;

use tracing::{debug, instrument, Level};

use crate::error::{Error, ErrorCode, Result};
use crate::executor::expr::analyze::expr_compare;
use crate::executor::expr::collate::{collations_check_compatibility, expr_coll, ExprColl};
use crate::executor::parse::Parse;
use crate::executor::select::inner::{
    compute_limit_registers, generate_column_metadata, key_info_from_expr_list, select_inner_loop,
};
use crate::executor::select::merge::multi_select_order_by;
use crate::executor::select::recursive::generate_with_recursive_query;
use crate::executor::select::sql_select;
use crate::executor::select::types::{SelectDest, SelectDestKind};
use crate::parser::ast::{
    CompoundOp, Expr, ExprFlags, ExprKind, ExprList, Select, SelectFlags, SrcItem, SrcList,
};
use crate::schema::CollId;
use crate::vdbe::ops::{KeyInfo, KeyPart, Opcode, P4};

/// Compile `p` on its own, with its `prior` chain detached for the call
pub(crate) fn compile_detached(
    parse: &mut Parse,
    p: &mut Select,
    dest: &mut SelectDest,
) -> Result<()> {
    let prior = p.prior.take();
    let res = sql_select(parse, p, dest);
    p.prior = prior;
    res
}

fn misplaced_clause(clause: &str, op: CompoundOp) -> Error {
    Error::with_message(
        ErrorCode::Syntax,
        format!("{} clause should come after {} not before", clause, op.name()),
    )
}

/// Reject a compound whose left side cannot be joined to the right one
fn check_compound_prior(parse: &mut Parse, p: &Select) -> Result<()> {
    let Some(prior) = p.prior.as_deref() else {
        return Err(parse.set_error(Error::internal("compound select without a prior")));
    };
    if prior.order_by.is_some() {
        return Err(parse.set_error(misplaced_clause("ORDER BY", p.op)));
    }
    if prior.limit.is_some() {
        return Err(parse.set_error(misplaced_clause("LIMIT", p.op)));
    }
    if prior.elist.len() != p.elist.len() {
        return Err(parse.set_error(Error::with_message(
            ErrorCode::Mismatch,
            format!(
                "SELECTs to the left and right of {} do not have the same number of result columns",
                p.op.name()
            ),
        )));
    }
    Ok(())
}

/// Point every ORDER BY term of a compound at the result column it names.
/// Terms that are not a result column of any branch are an error.
pub(crate) fn resolve_compound_order_by(parse: &mut Parse, p: &mut Select) -> Result<()> {
    let Some(mut order_by) = p.order_by.take() else {
        return Ok(());
    };
    let mut res = Ok(());
    for (i, item) in order_by.items.iter_mut().enumerate() {
        if item.order_by_col != 0 {
            continue;
        }
        let term = item.expr.skip_collate();
        let found = p.branches().iter().rev().find_map(|branch| {
            branch
                .elist
                .exprs()
                .position(|e| expr_compare(e, term, -1) == 0)
        });
        match found {
            Some(k) => item.order_by_col = (k + 1) as u16,
            None => {
                res = Err(Error::with_message(
                    ErrorCode::Syntax,
                    format!(
                        "Error at ORDER BY in place {}: term does not match any column in the result set",
                        i + 1
                    ),
                ));
                break;
            }
        }
    }
    p.order_by = Some(order_by);
    res.map_err(|e| parse.set_error(e))
}

fn compound_column_coll(p: &Select, n: usize) -> Result<ExprColl> {
    let prior = match p.prior.as_deref() {
        Some(prior) => compound_column_coll(prior, n)?,
        None => ExprColl::NONE,
    };
    let current = match p.elist.items.get(n) {
        Some(item) => expr_coll(&item.expr)?,
        None => ExprColl::NONE,
    };
    let id = collations_check_compatibility(prior, current)?;
    Ok(ExprColl {
        id,
        is_explicit: prior.is_explicit || current.is_explicit,
    })
}

/// Collation of result column `n` of a compound: the branches' collations
/// combined left to right
pub(crate) fn multi_select_coll_seq(parse: &mut Parse, p: &Select, n: usize) -> Result<CollId> {
    compound_column_coll(p, n)
        .map(|c| c.id)
        .map_err(|e| parse.set_error(e))
}

/// Key descriptor for the result rows of a compound: one part per column,
/// compared with the compound collation of that column
pub(crate) fn compound_key_info(parse: &mut Parse, p: &Select) -> Result<KeyInfo> {
    let n_col = p.elist.len();
    let mut parts = Vec::with_capacity(n_col);
    for i in 0..n_col {
        parts.push(KeyPart {
            coll_id: multi_select_coll_seq(parse, p, i)?,
            ..KeyPart::default()
        });
    }
    Ok(KeyInfo { parts })
}

/// Code a compound select. The branches are chained through `prior`, the
/// right-most one being `p`.
#[instrument(skip_all, level = Level::DEBUG)]
pub(crate) fn multi_select(parse: &mut Parse, p: &mut Select, dest: &mut SelectDest) -> Result<()> {
    check_compound_prior(parse, p)?;
    let mut local = dest.clone();

    if local.kind == SelectDestKind::EphemTab {
        let key = key_info_from_expr_list(&p.elist, 0, 0)?;
        parse.vdbe.add_op4(
            Opcode::OpenEphemeral,
            local.parm,
            p.elist.len() as i32 + 1,
            0,
            P4::KeyInfo(Arc::new(key)),
        );
        parse.vdbe.comment("Destination temp");
        local.kind = SelectDestKind::Table;
    }

    let res = if p.has_flag(SelectFlags::RECURSIVE) {
        debug!(op = p.op.name(), "compound via recursive queue");
        generate_with_recursive_query(parse, p, &mut local)
    } else if p.order_by.is_some() {
        debug!(op = p.op.name(), "compound via merge");
        multi_select_order_by(parse, p, &mut local)
    } else {
        debug!(op = p.op.name(), "compound via temp tables");
        multi_select_temp(parse, p, &mut local)
    };
    dest.sdst = local.sdst;
    dest.n_sdst = local.n_sdst;
    res
}

fn multi_select_temp(parse: &mut Parse, p: &mut Select, dest: &mut SelectDest) -> Result<()> {
    match p.op {
        CompoundOp::UnionAll | CompoundOp::Select => union_all(parse, p, dest)?,
        CompoundOp::Union | CompoundOp::Except => union_except(parse, p, dest)?,
        CompoundOp::Intersect => intersect(parse, p, dest)?,
    }
    if p.has_flag(SelectFlags::USES_EPHEMERAL) {
        patch_ephemeral_keys(parse, p)?;
    }
    Ok(())
}

fn union_all(parse: &mut Parse, p: &mut Select, dest: &mut SelectDest) -> Result<()> {
    let Some(prior) = p.prior.as_deref_mut() else {
        return Err(Error::internal("compound select without a prior"));
    };
    // the LIMIT counters are shared by both sides
    prior.limit = p.limit.take();
    prior.offset = p.offset.take();
    prior.i_limit = p.i_limit;
    prior.i_offset = p.i_offset;
    let res = sql_select(parse, prior, dest);
    p.i_limit = prior.i_limit;
    p.i_offset = prior.i_offset;
    p.limit = prior.limit.take();
    p.offset = prior.offset.take();
    res?;

    let mut addr = None;
    if p.i_limit != 0 {
        let r1 = parse.get_temp_reg();
        parse.vdbe.add_op2(Opcode::Integer, 0, r1);
        addr = Some(parse.vdbe.add_op(Opcode::Eq, r1, 0, p.i_limit));
        parse.release_temp_reg(r1);
        parse.vdbe.comment("Jump ahead if LIMIT reached");
        if p.i_offset != 0 {
            parse
                .vdbe
                .add_op(Opcode::OffsetLimit, p.i_limit, p.i_offset + 1, p.i_offset);
        }
    }
    let limit = p.limit.take();
    let offset = p.offset.take();
    let res = compile_detached(parse, p, dest);
    p.limit = limit;
    p.offset = offset;
    res?;
    if let Some(addr) = addr {
        parse.vdbe.jump_here(addr);
    }
    Ok(())
}

fn union_except(parse: &mut Parse, p: &mut Select, dest: &mut SelectDest) -> Result<()> {
    let union_tab = if dest.kind == SelectDestKind::Union {
        // the destination already is a union table: fill it directly
        dest.parm
    } else {
        let tab = parse.alloc_cursor();
        let addr = parse.vdbe.add_op2(Opcode::OpenEphemeral, tab, 0);
        p.addr_open_ephm[0] = Some(addr);
        p.flags |= SelectFlags::USES_EPHEMERAL;
        tab
    };

    let Some(prior) = p.prior.as_deref_mut() else {
        return Err(Error::internal("compound select without a prior"));
    };
    let mut union_dest = SelectDest::new(SelectDestKind::Union, union_tab);
    sql_select(parse, prior, &mut union_dest)?;

    let kind = if p.op == CompoundOp::Except {
        SelectDestKind::Except
    } else {
        SelectDestKind::Union
    };
    let mut side_dest = SelectDest::new(kind, union_tab);
    let limit = p.limit.take();
    let offset = p.offset.take();
    let res = compile_detached(parse, p, &mut side_dest);
    p.limit = limit;
    p.offset = offset;
    p.i_limit = 0;
    p.i_offset = 0;
    res?;

    if dest.kind == SelectDestKind::Union {
        return Ok(());
    }
    if dest.kind == SelectDestKind::Output && parse.nested == 1 {
        generate_column_metadata(parse, p.leftmost())?;
    }
    let i_break = parse.make_label();
    let i_cont = parse.make_label();
    compute_limit_registers(parse, p, i_break)?;
    parse.vdbe.add_op2(Opcode::Rewind, union_tab, i_break);
    let i_start = parse.vdbe.current_addr();
    select_inner_loop(parse, p, union_tab, None, None, dest, i_cont, i_break)?;
    parse.resolve_label(i_cont);
    parse.vdbe.add_op2(Opcode::Next, union_tab, i_start);
    parse.resolve_label(i_break);
    parse.vdbe.add_op1(Opcode::Close, union_tab);
    Ok(())
}

fn intersect(parse: &mut Parse, p: &mut Select, dest: &mut SelectDest) -> Result<()> {
    let tab1 = parse.alloc_cursor();
    let tab2 = parse.alloc_cursor();

    let addr = parse.vdbe.add_op2(Opcode::OpenEphemeral, tab1, 0);
    p.addr_open_ephm[0] = Some(addr);
    p.flags |= SelectFlags::USES_EPHEMERAL;
    let Some(prior) = p.prior.as_deref_mut() else {
        return Err(Error::internal("compound select without a prior"));
    };
    let mut left = SelectDest::new(SelectDestKind::Union, tab1);
    sql_select(parse, prior, &mut left)?;

    let addr = parse.vdbe.add_op2(Opcode::OpenEphemeral, tab2, 0);
    p.addr_open_ephm[1] = Some(addr);
    let mut right = SelectDest::new(SelectDestKind::Union, tab2);
    let limit = p.limit.take();
    let offset = p.offset.take();
    let res = compile_detached(parse, p, &mut right);
    p.limit = limit;
    p.offset = offset;
    res?;

    if dest.kind == SelectDestKind::Output && parse.nested == 1 {
        generate_column_metadata(parse, p.leftmost())?;
    }
    let i_break = parse.make_label();
    let i_cont = parse.make_label();
    compute_limit_registers(parse, p, i_break)?;
    parse.vdbe.add_op2(Opcode::Rewind, tab1, i_break);
    let r1 = parse.get_temp_reg();
    let i_start = parse.vdbe.add_op2(Opcode::RowData, tab1, r1);
    parse
        .vdbe
        .add_op4(Opcode::NotFound, tab2, i_cont, r1, P4::Int64(0));
    parse.release_temp_reg(r1);
    select_inner_loop(parse, p, tab1, None, None, dest, i_cont, i_break)?;
    parse.resolve_label(i_cont);
    parse.vdbe.add_op2(Opcode::Next, tab1, i_start);
    parse.resolve_label(i_break);
    parse.vdbe.add_op1(Opcode::Close, tab2);
    parse.vdbe.add_op1(Opcode::Close, tab1);
    Ok(())
}

/// The ephemeral indexes of a compound are opened before the collations
/// of the result columns are known: give every open the final key.
pub(crate) fn patch_ephemeral_keys(parse: &mut Parse, p: &mut Select) -> Result<()> {
    let n_col = p.elist.len() as i32;
    let key = Arc::new(compound_key_info(parse, p)?);
    let mut branch = Some(p);
    while let Some(s) = branch {
        for slot in s.addr_open_ephm.iter_mut() {
            if let Some(addr) = slot.take() {
                parse.vdbe.change_p2(addr, n_col);
                parse.vdbe.change_p4(addr, P4::KeyInfo(key.clone()));
            }
        }
        branch = s.prior.as_deref_mut();
    }
    Ok(())
}

/// A compound with an ORDER BY term carrying COLLATE, and some operator
/// other than UNION ALL, is rewritten into a plain select over the
/// compound as a FROM subquery. Returns true when the rewrite happened.
pub(crate) fn convert_compound_to_subquery(parse: &mut Parse, p: &mut Select) -> Result<bool> {
    if p.prior.is_none() || p.has_flag(SelectFlags::RECURSIVE) {
        return Ok(false);
    }
    let Some(order_by) = p.order_by.as_ref() else {
        return Ok(false);
    };
    let needs_dedup = p
        .branches()
        .iter()
        .any(|s| !matches!(s.op, CompoundOp::UnionAll | CompoundOp::Select));
    if !needs_dedup || !order_by.items.iter().any(|i| i.expr.has_flag(ExprFlags::COLLATE)) {
        return Ok(false);
    }
    resolve_compound_order_by(parse, p)?;

    let mut inner = p.clone();
    inner.order_by = None;
    inner.limit = None;
    inner.offset = None;
    inner.i_limit = 0;
    inner.i_offset = 0;
    let cursor = parse.alloc_cursor();
    let alias = format!("subquery_{}", parse.next_select_id());
    let item = SrcItem::subquery(inner, &alias, cursor);
    let table = item
        .table
        .clone()
        .ok_or_else(|| Error::internal("subquery item without a result table"))?;

    let mut elist = ExprList::new();
    for (i, old) in p.elist.items.iter().enumerate() {
        let entry = elist.push(Expr::column(&table, cursor, i));
        entry.name = old.name.clone().or_else(|| Some(table.columns[i].name.clone()));
        entry.span = old.span.clone();
    }

    let mut order_by = p.order_by.take().unwrap_or_default();
    for item in order_by.items.iter_mut() {
        let k = item.order_by_col as usize;
        if k == 0 || k > elist.len() {
            return Err(parse.set_error(Error::internal("unresolved compound ORDER BY term")));
        }
        let column = Expr::column(&table, cursor, k - 1);
        item.expr = match &item.expr.kind {
            ExprKind::Collate { collation, .. } => Expr::collate(column, collation.clone()),
            _ => column,
        };
    }

    p.src = SrcList::single(item);
    p.elist = elist;
    p.order_by = Some(order_by);
    p.where_clause = None;
    p.group_by = None;
    p.having = None;
    p.prior = None;
    p.op = CompoundOp::Select;
    p.flags.remove(SelectFlags::COMPOUND | SelectFlags::DISTINCT | SelectFlags::AGGREGATE);
    p.flags |= SelectFlags::CONVERTED;
    debug!(cursor, "compound with COLLATE in ORDER BY moved into a subquery");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompileConfig;
    use crate::schema::{Column, Table, COLL_BINARY, COLL_NONE, COLL_UNICODE_CI};
    use crate::types::FieldType;

    fn table(name: &str) -> Arc<Table> {
        Arc::new(Table::new(
            name,
            vec![
                Column::new("a", FieldType::Integer),
                Column::new("s", FieldType::String).with_collation(COLL_UNICODE_CI),
            ],
        ))
    }

    fn branch(t: &Arc<Table>, cursor: i32) -> Select {
        Select::new(
            ExprList::from_exprs(vec![Expr::column(t, cursor, 0), Expr::column(t, cursor, 1)]),
            SrcList::single(SrcItem::table(t.clone(), cursor)),
            None,
        )
    }

    fn compound(op: CompoundOp) -> Select {
        let t1 = table("t1");
        let t2 = table("t2");
        let mut right = branch(&t2, 1);
        right.op = op;
        right.prior = Some(Box::new(branch(&t1, 0)));
        right.flags |= SelectFlags::COMPOUND;
        right
    }

    #[test]
    fn test_coll_seq_combines_branches() {
        let mut parse = Parse::new(CompileConfig::default());
        let p = compound(CompoundOp::Union);
        assert_eq!(multi_select_coll_seq(&mut parse, &p, 0).unwrap(), COLL_NONE);
        assert_eq!(multi_select_coll_seq(&mut parse, &p, 1).unwrap(), COLL_UNICODE_CI);
    }

    #[test]
    fn test_coll_seq_conflicting_explicit_collations() {
        let mut parse = Parse::new(CompileConfig::default());
        let mut p = compound(CompoundOp::Union);
        let e = p.elist.items[1].expr.clone();
        p.elist.items[1].expr = Expr::collate(e, "binary");
        if let Some(prior) = p.prior.as_deref_mut() {
            let e = prior.elist.items[1].expr.clone();
            prior.elist.items[1].expr = Expr::collate(e, "unicode_ci");
        }
        let err = multi_select_coll_seq(&mut parse, &p, 1).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Collation);
    }

    #[test]
    fn test_explicit_collation_wins_over_implicit() {
        let mut parse = Parse::new(CompileConfig::default());
        let mut p = compound(CompoundOp::Union);
        let e = p.elist.items[1].expr.clone();
        p.elist.items[1].expr = Expr::collate(e, "binary");
        assert_eq!(multi_select_coll_seq(&mut parse, &p, 1).unwrap(), COLL_BINARY);
    }

    #[test]
    fn test_order_by_before_compound_operator() {
        let mut parse = Parse::new(CompileConfig::default());
        let mut p = compound(CompoundOp::UnionAll);
        if let Some(prior) = p.prior.as_deref_mut() {
            prior.order_by = Some(ExprList::from_exprs(vec![Expr::int(1)]));
        }
        let mut dest = SelectDest::output();
        let err = multi_select(&mut parse, &mut p, &mut dest).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Syntax);
        assert_eq!(
            err.message(),
            "ORDER BY clause should come after UNION ALL not before"
        );
    }

    #[test]
    fn test_branch_column_count_mismatch() {
        let mut parse = Parse::new(CompileConfig::default());
        let mut p = compound(CompoundOp::Except);
        p.elist.items.pop();
        let mut dest = SelectDest::output();
        let err = multi_select(&mut parse, &mut p, &mut dest).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Mismatch);
        assert!(err.to_string().contains("EXCEPT"));
    }

    #[test]
    fn test_union_patches_key_into_open() {
        let mut parse = Parse::new(CompileConfig::default());
        parse.n_tab = 2;
        let mut p = compound(CompoundOp::Union);
        let mut dest = SelectDest::output();
        multi_select(&mut parse, &mut p, &mut dest).unwrap();
        assert_eq!(p.addr_open_ephm, [None, None]);
        let program = parse.finish().unwrap();
        let opens = program.ops_with(Opcode::OpenEphemeral);
        assert_eq!(opens.len(), 1);
        assert_eq!(opens[0].p2, 2);
        match &opens[0].p4 {
            P4::KeyInfo(key) => assert_eq!(key.parts[1].coll_id, COLL_UNICODE_CI),
            other => panic!("unexpected p4 {:?}", other),
        }
        assert!(program.contains(Opcode::IdxInsert));
        assert!(program.contains(Opcode::ResultRow));
    }

    #[test]
    fn test_except_deletes_right_side() {
        let mut parse = Parse::new(CompileConfig::default());
        parse.n_tab = 2;
        let mut p = compound(CompoundOp::Except);
        let mut dest = SelectDest::output();
        multi_select(&mut parse, &mut p, &mut dest).unwrap();
        let program = parse.finish().unwrap();
        assert_eq!(program.count(Opcode::IdxDelete), 1);
        assert_eq!(program.count(Opcode::IdxInsert), 1);
    }

    #[test]
    fn test_intersect_uses_two_tables() {
        let mut parse = Parse::new(CompileConfig::default());
        parse.n_tab = 2;
        let mut p = compound(CompoundOp::Intersect);
        let mut dest = SelectDest::output();
        multi_select(&mut parse, &mut p, &mut dest).unwrap();
        let program = parse.finish().unwrap();
        assert_eq!(program.count(Opcode::OpenEphemeral), 2);
        assert!(program.contains(Opcode::NotFound));
        assert_eq!(program.count(Opcode::Close), 2);
    }

    #[test]
    fn test_convert_compound_with_collated_order_by() {
        let mut parse = Parse::new(CompileConfig::default());
        parse.n_tab = 2;
        let mut p = compound(CompoundOp::Union);
        let mut ob = ExprList::new();
        ob.push(Expr::collate(Expr::int(2), "binary")).order_by_col = 2;
        p.order_by = Some(ob);
        assert!(convert_compound_to_subquery(&mut parse, &mut p).unwrap());
        assert!(p.prior.is_none());
        assert!(p.has_flag(SelectFlags::CONVERTED));
        assert_eq!(p.src.len(), 1);
        let inner = p.src.items[0].select.as_deref().unwrap();
        assert!(inner.prior.is_some());
        assert!(inner.order_by.is_none());
        let term = &p.order_by.as_ref().unwrap().items[0].expr;
        assert!(matches!(term.kind, ExprKind::Collate { .. }));
        assert_eq!(term.skip_collate().as_column().unwrap().column, 1);
    }

    #[test]
    fn test_union_all_order_by_is_not_converted() {
        let mut parse = Parse::new(CompileConfig::default());
        let mut p = compound(CompoundOp::UnionAll);
        let mut ob = ExprList::new();
        ob.push(Expr::collate(Expr::int(2), "binary")).order_by_col = 2;
        p.order_by = Some(ob);
        assert!(!convert_compound_to_subquery(&mut parse, &mut p).unwrap());
        assert!(p.prior.is_some());
    }

    #[test]
    fn test_order_by_term_not_in_result_set() {
        let mut parse = Parse::new(CompileConfig::default());
        let mut p = compound(CompoundOp::Union);
        p.order_by = Some(ExprList::from_exprs(vec![Expr::int(42)]));
        let err = resolve_compound_order_by(&mut parse, &mut p).unwrap_err();
        assert!(err
            .to_string()
            .contains("Error at ORDER BY in place 1: term does not match any column"));
    }
}
