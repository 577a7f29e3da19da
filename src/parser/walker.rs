//! Tree walking for expressions and SELECT statements.

use crate::parser::ast::{Expr, ExprList, Select};

/// Result of a walker callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkResult {
    /// Continue walking.
    Continue,
    /// Do not descend into this node's children.
    Prune,
    /// Abort the walk.
    Abort,
}

/// Callbacks invoked while walking a tree.
pub trait ExprWalker {
    /// Called for each expression node before its children.
    fn walk_expr(&mut self, expr: &Expr) -> WalkResult;

    /// Called for each nested SELECT before its clauses. Nested selects are
    /// skipped unless this returns `Continue`.
    fn walk_select(&mut self, _select: &Select) -> WalkResult {
        WalkResult::Prune
    }
}

/// Walk an expression tree in pre-order.
pub fn walk_expr<W: ExprWalker + ?Sized>(walker: &mut W, expr: &Expr) -> WalkResult {
    match walker.walk_expr(expr) {
        WalkResult::Abort => return WalkResult::Abort,
        WalkResult::Prune => return WalkResult::Continue,
        WalkResult::Continue => {}
    }
    for child in expr.children() {
        if walk_expr(walker, child) == WalkResult::Abort {
            return WalkResult::Abort;
        }
    }
    if let Some(select) = expr.subselect() {
        if walk_select(walker, select) == WalkResult::Abort {
            return WalkResult::Abort;
        }
    }
    WalkResult::Continue
}

pub fn walk_expr_list<W: ExprWalker + ?Sized>(walker: &mut W, list: &ExprList) -> WalkResult {
    for expr in list.exprs() {
        if walk_expr(walker, expr) == WalkResult::Abort {
            return WalkResult::Abort;
        }
    }
    WalkResult::Continue
}

/// Walk every clause of a SELECT, its FROM-clause subqueries and its
/// compound predecessors.
pub fn walk_select<W: ExprWalker + ?Sized>(walker: &mut W, select: &Select) -> WalkResult {
    let mut current = Some(select);
    while let Some(s) = current {
        match walker.walk_select(s) {
            WalkResult::Abort => return WalkResult::Abort,
            WalkResult::Prune => return WalkResult::Continue,
            WalkResult::Continue => {}
        }
        if walk_select_clauses(walker, s) == WalkResult::Abort {
            return WalkResult::Abort;
        }
        current = s.prior.as_deref();
    }
    WalkResult::Continue
}

fn walk_select_clauses<W: ExprWalker + ?Sized>(walker: &mut W, s: &Select) -> WalkResult {
    for list in [Some(&s.elist), s.group_by.as_ref(), s.order_by.as_ref()]
        .into_iter()
        .flatten()
    {
        if walk_expr_list(walker, list) == WalkResult::Abort {
            return WalkResult::Abort;
        }
    }
    for expr in [&s.where_clause, &s.having, &s.limit, &s.offset]
        .into_iter()
        .flatten()
    {
        if walk_expr(walker, expr) == WalkResult::Abort {
            return WalkResult::Abort;
        }
    }
    for item in &s.src.items {
        if let Some(on) = &item.on {
            if walk_expr(walker, on) == WalkResult::Abort {
                return WalkResult::Abort;
            }
        }
        if let Some(sub) = &item.select {
            if walk_select(walker, sub) == WalkResult::Abort {
                return WalkResult::Abort;
            }
        }
    }
    WalkResult::Continue
}

/// Walker that stops at the first node matching a predicate.
struct FindWalker<F> {
    pred: F,
    found: bool,
    into_selects: bool,
}

impl<F: FnMut(&Expr) -> bool> ExprWalker for FindWalker<F> {
    fn walk_expr(&mut self, expr: &Expr) -> WalkResult {
        if (self.pred)(expr) {
            self.found = true;
            return WalkResult::Abort;
        }
        WalkResult::Continue
    }

    fn walk_select(&mut self, _select: &Select) -> WalkResult {
        if self.into_selects {
            WalkResult::Continue
        } else {
            WalkResult::Prune
        }
    }
}

/// Does any node of `expr` (nested selects excluded) satisfy `pred`?
pub fn expr_contains<F: FnMut(&Expr) -> bool>(expr: &Expr, pred: F) -> bool {
    let mut w = FindWalker {
        pred,
        found: false,
        into_selects: false,
    };
    walk_expr(&mut w, expr);
    w.found
}

/// Like [`expr_contains`] but also looks inside nested selects.
pub fn expr_contains_deep<F: FnMut(&Expr) -> bool>(expr: &Expr, pred: F) -> bool {
    let mut w = FindWalker {
        pred,
        found: false,
        into_selects: true,
    };
    walk_expr(&mut w, expr);
    w.found
}

/// Apply `f` to every expression of `select` in post-order, including
/// nested and FROM-clause selects and the compound chain.
pub fn transform_select_exprs<F: FnMut(&mut Expr)>(select: &mut Select, f: &mut F) {
    for list in [Some(&mut select.elist), select.group_by.as_mut(), select.order_by.as_mut()]
        .into_iter()
        .flatten()
    {
        for expr in list.exprs_mut() {
            transform_expr(expr, f);
        }
    }
    for expr in [
        &mut select.where_clause,
        &mut select.having,
        &mut select.limit,
        &mut select.offset,
    ]
    .into_iter()
    .flatten()
    {
        transform_expr(expr, f);
    }
    for item in &mut select.src.items {
        if let Some(on) = &mut item.on {
            transform_expr(on, f);
        }
        if let Some(sub) = &mut item.select {
            transform_select_exprs(sub, f);
        }
    }
    if let Some(prior) = &mut select.prior {
        transform_select_exprs(prior, f);
    }
}

/// Apply `f` to every node of `expr` in post-order, descending into
/// nested selects.
pub fn transform_expr<F: FnMut(&mut Expr)>(expr: &mut Expr, f: &mut F) {
    for child in expr.children_mut() {
        transform_expr(child, f);
    }
    if let Some(sub) = expr.subselect_mut() {
        transform_select_exprs(sub, f);
    }
    f(expr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ast::{ExprKind, SrcItem, SrcList};
    use crate::schema::{Column, Table};
    use crate::types::FieldType;
    use std::sync::Arc;

    struct CountColumns(usize);

    impl ExprWalker for CountColumns {
        fn walk_expr(&mut self, expr: &Expr) -> WalkResult {
            if matches!(expr.kind, ExprKind::Column(_)) {
                self.0 += 1;
            }
            WalkResult::Continue
        }

        fn walk_select(&mut self, _select: &Select) -> WalkResult {
            WalkResult::Continue
        }
    }

    fn table() -> Arc<Table> {
        Arc::new(Table::new("t", vec![Column::new("a", FieldType::Integer)]))
    }

    #[test]
    fn test_walk_counts_nested_columns() {
        let t = table();
        let inner = Select::new(
            ExprList::from_exprs(vec![Expr::column(&t, 1, 0)]),
            SrcList::single(SrcItem::table(Arc::clone(&t), 1)),
            None,
        );
        let e = Expr::and(
            Expr::eq(Expr::column(&t, 0, 0), Expr::int(1)),
            Expr::in_select(Expr::column(&t, 0, 0), inner, false),
        );
        let mut w = CountColumns(0);
        assert_eq!(walk_expr(&mut w, &e), WalkResult::Continue);
        assert_eq!(w.0, 3);
    }

    #[test]
    fn test_expr_contains_stops_at_selects() {
        let t = table();
        let inner = Select::new(
            ExprList::from_exprs(vec![Expr::column(&t, 1, 0)]),
            SrcList::single(SrcItem::table(Arc::clone(&t), 1)),
            None,
        );
        let e = Expr::exists(inner);
        let is_col = |x: &Expr| matches!(x.kind, ExprKind::Column(_));
        assert!(!expr_contains(&e, is_col));
        assert!(expr_contains_deep(&e, is_col));
    }

    #[test]
    fn test_transform_expr_rewrites_leaves() {
        let mut e = Expr::and(Expr::int(1), Expr::int(2));
        transform_expr(&mut e, &mut |x: &mut Expr| {
            if let ExprKind::Integer(v) = &mut x.kind {
                *v *= 10;
            }
        });
        assert_eq!(e.to_string(), "10 AND 20");
    }
}
