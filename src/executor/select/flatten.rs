//! Subquery flattening and WHERE push-down
//!
//! A FROM-clause subquery that satisfies the restrictions below is merged
//! into its parent: the subquery's FROM items take its place, its WHERE is
//! ANDed into the parent's, and every reference to the subquery's result
//! columns is replaced by the expression that computes it. A UNION ALL
//! subquery turns the parent into a UNION ALL of one copy per branch.
//!
//! When flattening is not possible, WHERE terms of the parent that only
//! read the subquery are copied into the subquery so it produces fewer
//! rows.

use tracing::{debug, instrument, Level};

use crate::error::{Error, Result};
use crate::executor::expr::analyze::{expr_and, expr_is_table_constant, expr_is_vector, vector_size};
use crate::executor::expr::codegen::column_count_mismatch;
use crate::executor::parse::Parse;
use crate::parser::ast::{
    BinaryOp, CompoundOp, Expr, ExprFlags, ExprKind, ExprList, JoinType, Select, SelectFlags,
    SrcItem,
};
use crate::types::Cursor;

fn list_has_subquery(list: Option<&ExprList>) -> bool {
    list.is_some_and(|l| l.exprs().any(|e| e.has_flag(ExprFlags::SUBQUERY)))
}

/// Whether `sub`, the subquery of FROM item `item` of `p`, may be merged
/// into `p`
fn can_flatten(p: &Select, item: &SrcItem, sub: &Select, is_agg: bool, sub_is_agg: bool) -> bool {
    if sub_is_agg {
        if is_agg || p.src.len() > 1 {
            return false;
        }
        if p
            .where_clause
            .as_deref()
            .is_some_and(|w| w.has_flag(ExprFlags::SUBQUERY))
            || list_has_subquery(Some(&p.elist))
            || list_has_subquery(p.order_by.as_ref())
        {
            return false;
        }
    }
    let sub_limit = sub.limit.is_some();
    if sub_limit && p.limit.is_some() {
        return false;
    }
    if sub.offset.is_some() {
        return false;
    }
    if p.has_flag(SelectFlags::COMPOUND) && sub_limit {
        return false;
    }
    if sub.src.is_empty() || sub.has_flag(SelectFlags::DISTINCT) {
        return false;
    }
    if sub_limit && (p.src.len() > 1 || is_agg) {
        return false;
    }
    if p.has_flag(SelectFlags::DISTINCT) && sub_is_agg {
        return false;
    }
    if p.order_by.is_some() && sub.order_by.is_some() {
        return false;
    }
    if is_agg && sub.order_by.is_some() {
        return false;
    }
    if sub_limit && (p.where_clause.is_some() || p.has_flag(SelectFlags::DISTINCT)) {
        return false;
    }
    if sub.flags.intersects(SelectFlags::RECURSIVE | SelectFlags::MIN_MAX_AGG) {
        return false;
    }
    if p.has_flag(SelectFlags::RECURSIVE) && sub.prior.is_some() {
        return false;
    }
    if item.join_type.intersects(JoinType::LEFT | JoinType::OUTER) {
        return false;
    }

    if sub.prior.is_some() {
        if is_agg || p.has_flag(SelectFlags::DISTINCT) || p.src.len() != 1 {
            return false;
        }
        for branch in sub.branches() {
            if branch.order_by.is_some()
                || branch
                    .flags
                    .intersects(SelectFlags::DISTINCT | SelectFlags::AGGREGATE)
                || (branch.prior.is_some() && branch.op != CompoundOp::UnionAll)
                || branch.src.is_empty()
            {
                return false;
            }
        }
        if let Some(ob) = &p.order_by {
            if ob.items.iter().any(|i| i.order_by_col == 0) {
                return false;
            }
        }
    }
    true
}

/// Try to merge the subquery of FROM item `i_from` into `p`. `is_agg`
/// and `sub_is_agg` tell whether the outer and the inner select are
/// aggregates. Returns true when `p` was rewritten.
#[instrument(skip_all, level = Level::DEBUG)]
pub fn flatten_subquery(
    parse: &mut Parse,
    p: &mut Select,
    i_from: usize,
    is_agg: bool,
    sub_is_agg: bool,
) -> Result<bool> {
    if !parse.config.enable_flattener || p.prior.is_some() {
        return Ok(false);
    }
    let Some(item) = p.src.items.get(i_from) else {
        return Ok(false);
    };
    let Some(sub) = item.select.as_deref() else {
        return Ok(false);
    };
    if !can_flatten(p, item, sub, is_agg, sub_is_agg) {
        return Ok(false);
    }

    let mut item = p.src.items.remove(i_from);
    let cursor = item.cursor;
    let join_type = item.join_type;
    let on = item.on.take().map(|e| *e);
    let Some(sub) = item.select.take() else {
        return Err(parse.set_error(Error::internal("subquery item lost its select")));
    };

    let mut branches = Vec::new();
    let mut next = Some(sub);
    while let Some(mut branch) = next {
        next = branch.prior.take();
        branches.push(*branch);
    }

    // one copy of the outer select per extra branch, chained as UNION ALL
    for _ in 1..branches.len() {
        let prior = p.prior.take();
        let mut copy = p.clone();
        copy.order_by = None;
        copy.limit = None;
        copy.offset = None;
        copy.prior = prior;
        p.prior = Some(Box::new(copy));
        p.op = CompoundOp::UnionAll;
    }

    let n_branches = branches.len();
    let mut parent = Some(&mut *p);
    for branch in branches {
        let Some(par) = parent else {
            break;
        };
        merge_branch(parse, par, i_from, cursor, join_type, on.clone(), branch, sub_is_agg)?;
        parent = par.prior.as_deref_mut();
    }
    debug!(cursor, branches = n_branches, sub_is_agg, "subquery flattened");
    Ok(true)
}

/// Merge one subquery branch into one outer select
#[allow(clippy::too_many_arguments)]
fn merge_branch(
    parse: &mut Parse,
    parent: &mut Select,
    i_from: usize,
    cursor: Cursor,
    join_type: JoinType,
    on: Option<Expr>,
    mut sub: Select,
    sub_is_agg: bool,
) -> Result<()> {
    let mut items = std::mem::take(&mut sub.src.items);
    let mut moved_on = on;
    for it in items.iter_mut() {
        if !it.is_left_join() {
            if let Some(cond) = it.on.take() {
                moved_on = expr_and(moved_on, Some(*cond));
            }
        }
    }
    if let Some(first) = items.first_mut() {
        first.join_type = join_type;
    }
    let at = i_from.min(parent.src.items.len());
    parent.src.items.splice(at..at, items);

    for item in parent.elist.items.iter_mut() {
        if item.name.is_none() {
            item.name = item.span.clone().or_else(|| {
                item.expr
                    .as_column()
                    .filter(|c| c.cursor == cursor)
                    .map(|c| c.name().to_string())
            });
        }
    }

    if let Some(mut ob) = sub.order_by.take() {
        for it in ob.items.iter_mut() {
            it.order_by_col = 0;
        }
        parent.order_by = Some(ob);
    }

    let sub_where = sub.where_clause.take().map(|w| *w);
    let parent_where = expr_and(parent.where_clause.take().map(|w| *w), moved_on);
    if sub_is_agg {
        parent.having = expr_and(sub.having.take().map(|h| *h), parent_where).map(Box::new);
        parent.where_clause = sub_where.map(Box::new);
        parent.group_by = sub.group_by.take();
    } else {
        parent.where_clause = expr_and(sub_where, parent_where).map(Box::new);
    }

    substitute_select(parent, cursor, &sub.elist, false).map_err(|e| parse.set_error(e))?;

    if sub.has_flag(SelectFlags::DISTINCT) {
        parent.flags |= SelectFlags::DISTINCT;
    }
    if let Some(limit) = sub.limit.take() {
        parent.limit = Some(limit);
    }
    Ok(())
}

/// Replace every reference to a result column of the subquery on `cursor`
/// by a copy of the expression in `elist` that computes it
pub fn substitute_expr(expr: &mut Expr, cursor: Cursor, elist: &ExprList) -> Result<()> {
    if let ExprKind::Column(col) = &expr.kind {
        if col.cursor != cursor {
            return Ok(());
        }
        let Some(item) = elist.items.get(col.column) else {
            return Err(Error::internal("reference past the subquery result set"));
        };
        if expr_is_vector(&item.expr) {
            return Err(column_count_mismatch(vector_size(&item.expr), 1));
        }
        let mut copy = item.expr.clone();
        if expr.is_from_join() {
            copy.flags |= ExprFlags::FROM_JOIN;
            copy.right_join_table = expr.right_join_table;
        }
        *expr = copy;
        return Ok(());
    }
    for child in expr.children_mut() {
        substitute_expr(child, cursor, elist)?;
    }
    if let Some(sel) = expr.subselect_mut() {
        substitute_select(sel, cursor, elist, true)?;
    }
    expr.set_height_and_flags();
    Ok(())
}

fn substitute_list(list: Option<&mut ExprList>, cursor: Cursor, elist: &ExprList) -> Result<()> {
    if let Some(list) = list {
        for e in list.exprs_mut() {
            substitute_expr(e, cursor, elist)?;
        }
    }
    Ok(())
}

/// Substitute through every clause of `select`, its FROM subqueries and
/// ON conditions, and with `do_prior` the rest of its compound chain
fn substitute_select(
    select: &mut Select,
    cursor: Cursor,
    elist: &ExprList,
    do_prior: bool,
) -> Result<()> {
    let mut next = Some(select);
    while let Some(s) = next {
        substitute_list(Some(&mut s.elist), cursor, elist)?;
        substitute_list(s.group_by.as_mut(), cursor, elist)?;
        substitute_list(s.order_by.as_mut(), cursor, elist)?;
        if let Some(having) = s.having.as_deref_mut() {
            substitute_expr(having, cursor, elist)?;
        }
        if let Some(w) = s.where_clause.as_deref_mut() {
            substitute_expr(w, cursor, elist)?;
        }
        for item in s.src.items.iter_mut() {
            if let Some(sel) = item.select.as_deref_mut() {
                substitute_select(sel, cursor, elist, true)?;
            }
            if let Some(on) = item.on.as_deref_mut() {
                substitute_expr(on, cursor, elist)?;
            }
        }
        if !do_prior {
            break;
        }
        next = s.prior.as_deref_mut();
    }
    Ok(())
}

/// Copy the terms of `where_expr` that only read the subquery on `cursor`
/// into the WHERE of every branch of `sub`. Returns the number of terms
/// pushed.
pub fn push_down_where_terms(
    parse: &mut Parse,
    sub: &mut Select,
    where_expr: Option<&Expr>,
    cursor: Cursor,
) -> Result<usize> {
    let Some(where_expr) = where_expr else {
        return Ok(0);
    };
    if !parse.config.enable_push_down {
        return Ok(0);
    }
    if sub
        .branches()
        .iter()
        .any(|b| b.flags.intersects(SelectFlags::AGGREGATE | SelectFlags::RECURSIVE))
    {
        return Ok(0);
    }
    if sub.limit.is_some() {
        return Ok(0);
    }
    let n = push_term(sub, where_expr, cursor).map_err(|e| parse.set_error(e))?;
    if n > 0 {
        debug!(cursor, terms = n, "WHERE terms pushed into subquery");
    }
    Ok(n)
}

fn push_term(sub: &mut Select, term: &Expr, cursor: Cursor) -> Result<usize> {
    if let Some((BinaryOp::And, left, right)) = term.binary_parts() {
        return Ok(push_term(sub, right, cursor)? + push_term(sub, left, cursor)?);
    }
    if term.is_from_join() || !expr_is_table_constant(term, cursor) {
        return Ok(0);
    }
    let mut branch = Some(sub);
    while let Some(b) = branch {
        let mut copy = term.clone();
        substitute_expr(&mut copy, cursor, &b.elist)?;
        b.where_clause = expr_and(b.where_clause.take().map(|w| *w), Some(copy)).map(Box::new);
        branch = b.prior.as_deref_mut();
    }
    Ok(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::CompileConfig;
    use crate::error::ErrorCode;
    use crate::parser::ast::SrcList;
    use crate::schema::{Column, Table};
    use crate::types::FieldType;

    fn table() -> Arc<Table> {
        Arc::new(Table::new(
            "t",
            vec![
                Column::new("a", FieldType::Integer),
                Column::new("b", FieldType::Integer),
            ],
        ))
    }

    fn gt(l: Expr, r: Expr) -> Expr {
        Expr::binary(BinaryOp::Gt, l, r)
    }

    /// SELECT x FROM (SELECT a AS x FROM t WHERE a > 1) AS s
    fn outer_over_sub(sub: Select) -> (Select, Arc<Table>) {
        let item = SrcItem::subquery(sub, "s", 1);
        let st = item.table.clone().unwrap();
        let p = Select::new(
            ExprList::from_exprs(vec![Expr::column(&st, 1, 0)]),
            SrcList::single(item),
            None,
        );
        (p, st)
    }

    fn simple_sub(t: &Arc<Table>) -> Select {
        let mut elist = ExprList::new();
        elist.push_named(Expr::column(t, 0, 0), "x");
        Select::new(
            elist,
            SrcList::single(SrcItem::table(t.clone(), 0)),
            Some(gt(Expr::column(t, 0, 0), Expr::int(1))),
        )
    }

    #[test]
    fn test_flatten_simple_subquery() {
        let t = table();
        let (mut p, st) = outer_over_sub(simple_sub(&t));
        p.where_clause = Some(Box::new(Expr::binary(
            BinaryOp::Lt,
            Expr::column(&st, 1, 0),
            Expr::int(5),
        )));
        let mut parse = Parse::new(CompileConfig::default());
        assert!(flatten_subquery(&mut parse, &mut p, 0, false, false).unwrap());
        assert_eq!(p.src.len(), 1);
        assert_eq!(p.src.items[0].cursor, 0);
        let col = p.elist.items[0].expr.as_column().unwrap();
        assert_eq!((col.cursor, col.column), (0, 0));
        assert_eq!(p.elist.items[0].name.as_deref(), Some("x"));
        let w = p.where_clause.as_deref().unwrap();
        let (op, left, right) = w.binary_parts().unwrap();
        assert_eq!(op, BinaryOp::And);
        assert_eq!(left.binary_parts().unwrap().0, BinaryOp::Gt);
        let (op, l, _) = right.binary_parts().unwrap();
        assert_eq!(op, BinaryOp::Lt);
        assert_eq!(l.as_column().unwrap().cursor, 0);
    }

    #[test]
    fn test_limit_in_sub_blocks_outer_where() {
        let t = table();
        let mut sub = simple_sub(&t);
        sub.limit = Some(Box::new(Expr::int(3)));
        let (mut p, _) = outer_over_sub(sub);
        p.where_clause = Some(Box::new(Expr::boolean(true)));
        let mut parse = Parse::new(CompileConfig::default());
        assert!(!flatten_subquery(&mut parse, &mut p, 0, false, false).unwrap());
        assert!(p.src.items[0].select.is_some());
    }

    /// Each refusal must leave the outer select untouched
    fn assert_kept(p: &mut Select, is_agg: bool, sub_is_agg: bool) {
        let before = p.clone();
        let mut parse = Parse::new(CompileConfig::default());
        assert!(!flatten_subquery(&mut parse, p, 0, is_agg, sub_is_agg).unwrap());
        assert_eq!(*p, before);
    }

    fn agg_sub(t: &Arc<Table>) -> Select {
        let mut elist = ExprList::new();
        elist.push_named(Expr::function("count", vec![], false), "n");
        let mut sub = Select::new(elist, SrcList::single(SrcItem::table(t.clone(), 0)), None);
        sub.flags |= SelectFlags::AGGREGATE;
        sub
    }

    /// simple_sub() UNION ALL simple_sub(), with `prior` adjusted by `f`
    fn union_all_sub(t: &Arc<Table>, f: impl FnOnce(&mut Select)) -> Select {
        let mut prior = simple_sub(t);
        f(&mut prior);
        let mut right = simple_sub(t);
        right.op = CompoundOp::UnionAll;
        right.prior = Some(Box::new(prior));
        right
    }

    #[test]
    fn test_distinct_subquery_is_kept() {
        let t = table();
        let mut sub = simple_sub(&t);
        sub.flags |= SelectFlags::DISTINCT;
        let (mut p, _) = outer_over_sub(sub);
        assert_kept(&mut p, false, false);
    }

    #[test]
    fn test_subquery_with_offset_is_kept() {
        let t = table();
        let mut sub = simple_sub(&t);
        sub.limit = Some(Box::new(Expr::int(3)));
        sub.offset = Some(Box::new(Expr::int(1)));
        let (mut p, _) = outer_over_sub(sub);
        assert_kept(&mut p, false, false);
    }

    #[test]
    fn test_limit_on_both_sides_is_kept() {
        let t = table();
        let mut sub = simple_sub(&t);
        sub.limit = Some(Box::new(Expr::int(3)));
        let (mut p, _) = outer_over_sub(sub);
        p.limit = Some(Box::new(Expr::int(2)));
        assert_kept(&mut p, false, false);
    }

    #[test]
    fn test_order_by_on_both_sides_is_kept() {
        let t = table();
        let mut sub = simple_sub(&t);
        sub.order_by = Some(ExprList::from_exprs(vec![Expr::column(&t, 0, 1)]));
        let (mut p, st) = outer_over_sub(sub);
        p.order_by = Some(ExprList::from_exprs(vec![Expr::column(&st, 1, 0)]));
        assert_kept(&mut p, false, false);
    }

    #[test]
    fn test_ordered_subquery_under_aggregate_is_kept() {
        let t = table();
        let mut sub = simple_sub(&t);
        sub.order_by = Some(ExprList::from_exprs(vec![Expr::column(&t, 0, 1)]));
        let (mut p, _) = outer_over_sub(sub);
        assert_kept(&mut p, true, false);
    }

    #[test]
    fn test_recursive_and_min_max_subqueries_are_kept() {
        let t = table();
        for flag in [SelectFlags::RECURSIVE, SelectFlags::MIN_MAX_AGG] {
            let mut sub = simple_sub(&t);
            sub.flags |= flag;
            let (mut p, _) = outer_over_sub(sub);
            assert_kept(&mut p, false, false);
        }
    }

    #[test]
    fn test_compound_with_distinct_or_aggregate_branch_is_kept() {
        let t = table();
        for flag in [SelectFlags::DISTINCT, SelectFlags::AGGREGATE] {
            let (mut p, _) = outer_over_sub(union_all_sub(&t, |b| b.flags |= flag));
            assert_kept(&mut p, false, false);
        }
    }

    #[test]
    fn test_compound_under_distinct_outer_is_kept() {
        let t = table();
        let (mut p, _) = outer_over_sub(union_all_sub(&t, |_| {}));
        p.flags |= SelectFlags::DISTINCT;
        assert_kept(&mut p, false, false);
    }

    #[test]
    fn test_compound_under_join_is_kept() {
        let t = table();
        let (mut p, _) = outer_over_sub(union_all_sub(&t, |_| {}));
        p.src.items.push(SrcItem::table(table(), 2));
        assert_kept(&mut p, false, false);
    }

    #[test]
    fn test_compound_with_unmatched_outer_order_by_is_kept() {
        let t = table();
        let (mut p, st) = outer_over_sub(union_all_sub(&t, |_| {}));
        p.order_by = Some(ExprList::from_exprs(vec![Expr::column(&st, 1, 0)]));
        assert_eq!(p.order_by.as_ref().unwrap().items[0].order_by_col, 0);
        assert_kept(&mut p, false, false);
    }

    #[test]
    fn test_aggregate_subquery_in_join_is_kept() {
        let t = table();
        let (mut p, _) = outer_over_sub(agg_sub(&t));
        p.src.items.push(SrcItem::table(table(), 2));
        assert_kept(&mut p, false, true);
    }

    #[test]
    fn test_aggregate_subquery_under_nested_select_is_kept() {
        let t = table();
        let (mut p, _) = outer_over_sub(agg_sub(&t));
        let nested = Select::new(
            ExprList::from_exprs(vec![Expr::column(&t, 3, 0)]),
            SrcList::single(SrcItem::table(t.clone(), 3)),
            None,
        );
        p.where_clause = Some(Box::new(Expr::exists(nested)));
        assert!(p.where_clause.as_deref().unwrap().has_flag(ExprFlags::SUBQUERY));
        assert_kept(&mut p, false, true);
    }

    #[test]
    fn test_disabled_flattener() {
        let t = table();
        let (mut p, _) = outer_over_sub(simple_sub(&t));
        let mut parse = Parse::new(CompileConfig {
            enable_flattener: false,
            ..CompileConfig::default()
        });
        assert!(!flatten_subquery(&mut parse, &mut p, 0, false, false).unwrap());
    }

    #[test]
    fn test_aggregate_subquery_moves_outer_where_to_having() {
        let t = table();
        let mut elist = ExprList::new();
        elist.push_named(Expr::function("count", vec![], false), "n");
        let mut sub = Select::new(elist, SrcList::single(SrcItem::table(t.clone(), 0)), None);
        sub.flags |= SelectFlags::AGGREGATE;
        sub.group_by = Some(ExprList::from_exprs(vec![Expr::column(&t, 0, 1)]));
        let (mut p, st) = outer_over_sub(sub);
        p.where_clause = Some(Box::new(gt(Expr::column(&st, 1, 0), Expr::int(2))));
        let mut parse = Parse::new(CompileConfig::default());
        assert!(flatten_subquery(&mut parse, &mut p, 0, false, true).unwrap());
        assert!(p.where_clause.is_none());
        assert!(p.group_by.is_some());
        let (op, left, _) = p.having.as_deref().unwrap().binary_parts().unwrap();
        assert_eq!(op, BinaryOp::Gt);
        assert!(left.has_flag(ExprFlags::AGG));
        assert!(matches!(p.elist.items[0].expr.kind, ExprKind::AggFunction { .. }));
    }

    #[test]
    fn test_union_all_subquery_becomes_compound() {
        let t = table();
        let mut right = simple_sub(&t);
        right.op = CompoundOp::UnionAll;
        right.prior = Some(Box::new(simple_sub(&t)));
        let (mut p, _) = outer_over_sub(right);
        let mut parse = Parse::new(CompileConfig::default());
        assert!(flatten_subquery(&mut parse, &mut p, 0, false, false).unwrap());
        assert_eq!(p.op, CompoundOp::UnionAll);
        let prior = p.prior.as_deref().unwrap();
        assert_eq!(prior.op, CompoundOp::Select);
        assert!(prior.prior.is_none());
        for s in p.branches() {
            assert_eq!(s.src.len(), 1);
            assert!(s.src.items[0].select.is_none());
            assert!(s.where_clause.is_some());
        }
    }

    #[test]
    fn test_union_subquery_is_not_flattened() {
        let t = table();
        let mut right = simple_sub(&t);
        right.op = CompoundOp::Union;
        right.prior = Some(Box::new(simple_sub(&t)));
        let (mut p, _) = outer_over_sub(right);
        let mut parse = Parse::new(CompileConfig::default());
        assert!(!flatten_subquery(&mut parse, &mut p, 0, false, false).unwrap());
    }

    #[test]
    fn test_substitute_keeps_join_marker() {
        let t = table();
        let (_, st) = outer_over_sub(simple_sub(&t));
        let mut e = Expr::column(&st, 1, 0);
        e.set_join(7);
        let elist = ExprList::from_exprs(vec![Expr::column(&t, 0, 1)]);
        substitute_expr(&mut e, 1, &elist).unwrap();
        let col = e.as_column().unwrap();
        assert_eq!((col.cursor, col.column), (0, 1));
        assert!(e.is_from_join());
        assert_eq!(e.right_join_table, 7);
    }

    #[test]
    fn test_substitute_vector_is_mismatch() {
        let t = table();
        let (_, st) = outer_over_sub(simple_sub(&t));
        let mut e = gt(Expr::column(&st, 1, 0), Expr::int(1));
        let elist = ExprList::from_exprs(vec![Expr::vector(vec![Expr::int(1), Expr::int(2)])]);
        let err = substitute_expr(&mut e, 1, &elist).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Mismatch);
    }

    #[test]
    fn test_push_down_into_every_branch() {
        let t = table();
        let mut sub = simple_sub(&t);
        sub.op = CompoundOp::UnionAll;
        sub.prior = Some(Box::new(simple_sub(&t)));
        let st = Arc::new(sub.result_table("s"));
        let w = Expr::and(
            gt(Expr::column(&st, 1, 0), Expr::int(10)),
            Expr::binary(BinaryOp::Lt, Expr::column(&st, 1, 0), Expr::int(20)),
        );
        let mut parse = Parse::new(CompileConfig::default());
        let n = push_down_where_terms(&mut parse, &mut sub, Some(&w), 1).unwrap();
        assert_eq!(n, 2);
        for b in sub.branches() {
            let mut and_count = 0;
            let mut cur = b.where_clause.as_deref().unwrap();
            while let Some((BinaryOp::And, l, _)) = cur.binary_parts() {
                and_count += 1;
                cur = l;
            }
            assert_eq!(and_count, 2);
        }
    }

    #[test]
    fn test_push_down_skips_join_terms_and_limited_subqueries() {
        let t = table();
        let mut sub = simple_sub(&t);
        let st = Arc::new(sub.result_table("s"));
        let mut w = gt(Expr::column(&st, 1, 0), Expr::int(10));
        w.set_join(1);
        let mut parse = Parse::new(CompileConfig::default());
        assert_eq!(push_down_where_terms(&mut parse, &mut sub, Some(&w), 1).unwrap(), 0);

        let plain = gt(Expr::column(&st, 1, 0), Expr::int(10));
        sub.limit = Some(Box::new(Expr::int(1)));
        assert_eq!(push_down_where_terms(&mut parse, &mut sub, Some(&plain), 1).unwrap(), 0);
    }
}
