//! Structural questions about expression trees
//!
//! Tree equality and implication, constant classification, NULL-ability,
//! row-value shape and the expression depth limit.

use crate::error::{Error, ErrorCode, Result};
use crate::parser::ast::{
    BinaryOp, Expr, ExprFlags, ExprKind, ExprList, InRhs, Select, UnaryOp,
};
use crate::parser::walker::{walk_expr, ExprWalker, WalkResult};
use crate::types::Cursor;

// ============================================================================
// Height
// ============================================================================

/// Fail when `height` exceeds `max_depth` (0 disables the check)
pub fn check_height(height: u32, max_depth: u32) -> Result<()> {
    if max_depth > 0 && height > max_depth {
        return Err(Error::with_message(
            ErrorCode::TooBig,
            format!(
                "Number of nodes in expression tree ({}) exceeds the limit {}",
                height, max_depth
            ),
        ));
    }
    Ok(())
}

/// Recompute the height and propagated flags of `expr` from its
/// children, then apply the depth limit.
pub fn expr_set_height(expr: &mut Expr, max_depth: u32) -> Result<()> {
    expr.set_height_and_flags();
    expr.flags.remove(ExprFlags::HEIGHT_CHECK);
    check_height(expr.height, max_depth)
}

// ============================================================================
// Comparison
// ============================================================================

/// Deep comparison of two trees.
///
/// Returns 0 when identical, 1 when they differ only by a top-level
/// COLLATE, 2 otherwise. A column of `b` with a negative cursor matches a
/// column of `a` on cursor `tab`. A register-bound `a` compares as the
/// expression it holds.
pub fn expr_compare(a: &Expr, b: &Expr, tab: Cursor) -> u8 {
    let a = match &a.kind {
        ExprKind::Register { orig, .. } if !matches!(b.kind, ExprKind::Register { .. }) => {
            orig.as_ref()
        }
        _ => a,
    };
    if std::mem::discriminant(&a.kind) != std::mem::discriminant(&b.kind) {
        if let ExprKind::Collate { expr, .. } = &a.kind {
            if expr_compare(expr, b, tab) < 2 {
                return 1;
            }
        }
        if let ExprKind::Collate { expr, .. } = &b.kind {
            if expr_compare(a, expr, tab) < 2 {
                return 1;
            }
        }
        return 2;
    }
    if a.has_flag(ExprFlags::DISTINCT) != b.has_flag(ExprFlags::DISTINCT) {
        return 2;
    }
    match (&a.kind, &b.kind) {
        (ExprKind::Null, ExprKind::Null) => 0,
        (ExprKind::Integer(x), ExprKind::Integer(y)) => u8::from(x != y) * 2,
        (ExprKind::Float(x), ExprKind::Float(y)) => u8::from(x.to_bits() != y.to_bits()) * 2,
        (ExprKind::String(x), ExprKind::String(y)) => u8::from(x != y) * 2,
        (ExprKind::Blob(x), ExprKind::Blob(y)) => u8::from(x != y) * 2,
        (ExprKind::Bool(x), ExprKind::Bool(y)) => u8::from(x != y) * 2,
        (ExprKind::Variable { index: x, .. }, ExprKind::Variable { index: y, .. }) => {
            u8::from(x != y) * 2
        }
        (ExprKind::Column(x), ExprKind::Column(y))
        | (ExprKind::AggColumn { col: x, .. }, ExprKind::AggColumn { col: y, .. }) => {
            if x.column != y.column {
                return 2;
            }
            if x.cursor != y.cursor && (x.cursor != tab || y.cursor >= 0) {
                return 2;
            }
            0
        }
        (ExprKind::Function(x), ExprKind::Function(y))
        | (ExprKind::AggFunction { call: x, .. }, ExprKind::AggFunction { call: y, .. }) => {
            if !x.name.eq_ignore_ascii_case(&y.name) || x.distinct != y.distinct {
                return 2;
            }
            exprs_compare(&x.args, &y.args, tab)
        }
        (ExprKind::Unary { op: x, expr: ex }, ExprKind::Unary { op: y, expr: ey }) => {
            if x != y {
                return 2;
            }
            u8::from(expr_compare(ex, ey, tab) != 0) * 2
        }
        (
            ExprKind::Binary {
                op: ox,
                left: lx,
                right: rx,
            },
            ExprKind::Binary {
                op: oy,
                left: ly,
                right: ry,
            },
        ) => {
            if ox != oy || expr_compare(lx, ly, tab) != 0 || expr_compare(rx, ry, tab) != 0 {
                return 2;
            }
            0
        }
        (
            ExprKind::Collate {
                expr: ex,
                collation: cx,
            },
            ExprKind::Collate {
                expr: ey,
                collation: cy,
            },
        ) => {
            if expr_compare(ex, ey, tab) != 0 {
                return 2;
            }
            u8::from(!cx.eq_ignore_ascii_case(cy))
        }
        (ExprKind::Cast { expr: ex, ty: tx }, ExprKind::Cast { expr: ey, ty: ty_ }) => {
            if tx != ty_ {
                return 2;
            }
            u8::from(expr_compare(ex, ey, tab) != 0) * 2
        }
        (ExprKind::In { rhs: InRhs::Select(_), .. }, _)
        | (_, ExprKind::In { rhs: InRhs::Select(_), .. })
        | (ExprKind::Subquery(_), _)
        | (ExprKind::Exists(_), _)
        | (ExprKind::Raise { .. }, _) => 2,
        (ExprKind::Register { reg: x, .. }, ExprKind::Register { reg: y, .. }) => {
            u8::from(x != y) * 2
        }
        _ => {
            let ca = a.children();
            let cb = b.children();
            if ca.len() != cb.len() {
                return 2;
            }
            if let (
                ExprKind::In { negated: na, .. },
                ExprKind::In { negated: nb, .. },
            )
            | (
                ExprKind::Between { negated: na, .. },
                ExprKind::Between { negated: nb, .. },
            ) = (&a.kind, &b.kind)
            {
                if na != nb {
                    return 2;
                }
            }
            if let (
                ExprKind::Case { operand: oa, .. },
                ExprKind::Case { operand: ob, .. },
            ) = (&a.kind, &b.kind)
            {
                if oa.is_some() != ob.is_some() {
                    return 2;
                }
            }
            for (x, y) in ca.iter().zip(cb.iter()) {
                if expr_compare(x, y, tab) != 0 {
                    return 2;
                }
            }
            0
        }
    }
}

fn exprs_compare(a: &[Expr], b: &[Expr], tab: Cursor) -> u8 {
    if a.len() != b.len() {
        return 2;
    }
    for (x, y) in a.iter().zip(b) {
        if expr_compare(x, y, tab) != 0 {
            return 2;
        }
    }
    0
}

/// Compare two lists element-wise, sort orders included. Returns 0 when
/// identical, 1 otherwise.
pub fn expr_list_compare(a: Option<&ExprList>, b: Option<&ExprList>, tab: Cursor) -> u8 {
    match (a, b) {
        (None, None) => 0,
        (Some(a), Some(b)) => {
            if a.len() != b.len() {
                return 1;
            }
            for (x, y) in a.items.iter().zip(&b.items) {
                if x.sort_order != y.sort_order || expr_compare(&x.expr, &y.expr, tab) != 0 {
                    return 1;
                }
            }
            0
        }
        _ => 1,
    }
}

/// Can `e2` be proven true whenever `e1` is true? Returns false when in
/// doubt.
pub fn expr_implies_expr(e1: &Expr, e2: &Expr, tab: Cursor) -> bool {
    if expr_compare(e1, e2, tab) == 0 {
        return true;
    }
    if let ExprKind::Binary {
        op: BinaryOp::Or,
        left,
        right,
    } = &e2.kind
    {
        if expr_implies_expr(e1, left, tab) || expr_implies_expr(e1, right, tab) {
            return true;
        }
    }
    if let ExprKind::Unary {
        op: UnaryOp::NotNull,
        expr: x2,
    } = &e2.kind
    {
        let is_null = matches!(
            e1.kind,
            ExprKind::Unary {
                op: UnaryOp::IsNull,
                ..
            }
        );
        if !is_null {
            if let Some(x1) = left_operand(e1) {
                if expr_compare(x1.skip_collate(), x2, tab) == 0 {
                    return true;
                }
            }
        }
    }
    false
}

fn left_operand(e: &Expr) -> Option<&Expr> {
    match &e.kind {
        ExprKind::Binary { left, .. } => Some(left),
        ExprKind::Unary { expr, .. } => Some(expr),
        ExprKind::Between { expr, .. } | ExprKind::In { expr, .. } => Some(expr),
        _ => None,
    }
}

// ============================================================================
// Constant classification
// ============================================================================

/// What "constant" means for a classification walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConstMode {
    /// No column references, only deterministic functions
    Plain,
    /// As `Plain`, and nothing from an outer join's ON clause
    NotJoin,
    /// Columns of this cursor are allowed
    Table(Cursor),
    /// Any function call is allowed
    OrFunction,
}

struct ConstWalker {
    mode: ConstMode,
    is_const: bool,
}

impl ExprWalker for ConstWalker {
    fn walk_expr(&mut self, expr: &Expr) -> WalkResult {
        if self.mode == ConstMode::NotJoin && expr.is_from_join() {
            self.is_const = false;
            return WalkResult::Abort;
        }
        match &expr.kind {
            ExprKind::Function(_) => {
                if self.mode == ConstMode::OrFunction || expr.has_flag(ExprFlags::CONST_FUNC) {
                    WalkResult::Continue
                } else {
                    self.is_const = false;
                    WalkResult::Abort
                }
            }
            ExprKind::Column(c) | ExprKind::AggColumn { col: c, .. } => match self.mode {
                ConstMode::Table(cursor) if c.cursor == cursor => WalkResult::Continue,
                _ => {
                    self.is_const = false;
                    WalkResult::Abort
                }
            },
            ExprKind::AggFunction { .. } | ExprKind::Register { .. } | ExprKind::Raise { .. } => {
                self.is_const = false;
                WalkResult::Abort
            }
            _ => WalkResult::Continue,
        }
    }

    fn walk_select(&mut self, _select: &Select) -> WalkResult {
        self.is_const = false;
        WalkResult::Abort
    }
}

fn expr_is_const(expr: &Expr, mode: ConstMode) -> bool {
    let mut walker = ConstWalker {
        mode,
        is_const: true,
    };
    walk_expr(&mut walker, expr);
    walker.is_const
}

/// Constant: evaluates to the same value for every row
pub fn expr_is_constant(expr: &Expr) -> bool {
    expr_is_const(expr, ConstMode::Plain)
}

/// Constant and not taken from the ON/USING clause of a join
pub fn expr_is_constant_not_join(expr: &Expr) -> bool {
    expr_is_const(expr, ConstMode::NotJoin)
}

/// Constant for any single row of the table on `cursor`
pub fn expr_is_table_constant(expr: &Expr, cursor: Cursor) -> bool {
    expr_is_const(expr, ConstMode::Table(cursor))
}

/// Constant, or a function call over constants
pub fn expr_is_constant_or_function(expr: &Expr) -> bool {
    expr_is_const(expr, ConstMode::OrFunction)
}

// ============================================================================
// Small value questions
// ============================================================================

/// Value of an integer literal that fits in 32 bits
pub fn expr_is_integer(expr: &Expr) -> Option<i32> {
    match &expr.kind {
        ExprKind::Integer(v) => i32::try_from(*v).ok(),
        ExprKind::Unary {
            op: UnaryOp::Plus,
            expr,
        } => expr_is_integer(expr),
        ExprKind::Unary {
            op: UnaryOp::Negate,
            expr,
        } => expr_is_integer(expr).and_then(|v| v.checked_neg()),
        _ => None,
    }
}

/// False only when `expr` provably never evaluates to NULL
pub fn expr_can_be_null(expr: &Expr) -> bool {
    let mut e = expr;
    while let ExprKind::Unary {
        op: UnaryOp::Plus | UnaryOp::Negate,
        expr: child,
    } = &e.kind
    {
        e = child;
    }
    if let ExprKind::Register { orig, .. } = &e.kind {
        e = orig;
    }
    match &e.kind {
        ExprKind::Integer(_) | ExprKind::Float(_) | ExprKind::String(_) | ExprKind::Blob(_) => {
            false
        }
        ExprKind::Column(c) => {
            e.has_flag(ExprFlags::CAN_BE_NULL) || c.def().map_or(true, |d| d.is_nullable)
        }
        _ => true,
    }
}

// ============================================================================
// Row values
// ============================================================================

/// Number of values `expr` produces: list length for a row value, column
/// count for a subquery, 1 otherwise.
pub fn vector_size(expr: &Expr) -> usize {
    match &expr.kind {
        ExprKind::Register { orig, .. } => vector_size(orig),
        ExprKind::Vector(items) => items.len(),
        ExprKind::Subquery(select) => select.elist.len(),
        _ => 1,
    }
}

pub fn expr_is_vector(expr: &Expr) -> bool {
    vector_size(expr) > 1
}

/// The `i`-th component of a row value. A scalar (including a
/// single-column subquery) is its own only component.
pub fn vector_field_subexpr(expr: &Expr, i: usize) -> &Expr {
    if !expr_is_vector(expr) {
        return expr;
    }
    let e = match &expr.kind {
        ExprKind::Register { orig, .. } => orig.as_ref(),
        _ => expr,
    };
    match &e.kind {
        ExprKind::Vector(items) => &items[i],
        ExprKind::Subquery(select) => &select.elist.items[i].expr,
        _ => e,
    }
}

/// Conjunction of two optional terms. A literal FALSE that did not come
/// from a join absorbs the other side.
pub fn expr_and(left: Option<Expr>, right: Option<Expr>) -> Option<Expr> {
    match (left, right) {
        (None, r) => r,
        (l, None) => l,
        (Some(l), Some(r)) => {
            let always_false =
                |e: &Expr| !e.is_from_join() && matches!(e.kind, ExprKind::Bool(false));
            if always_false(&l) || always_false(&r) {
                Some(Expr::boolean(false))
            } else {
                Some(Expr::and(l, r))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, Table};
    use crate::types::FieldType;
    use std::sync::Arc;

    fn table() -> Arc<Table> {
        Arc::new(Table::new(
            "t",
            vec![
                Column::new("a", FieldType::Integer),
                Column::new("b", FieldType::String).not_null(),
            ],
        ))
    }

    #[test]
    fn test_compare_clone_is_equal() {
        let t = table();
        let e = Expr::and(
            Expr::binary(BinaryOp::Lt, Expr::column(&t, 0, 0), Expr::int(5)),
            Expr::function("upper", vec![Expr::column(&t, 0, 1)], false),
        );
        assert_eq!(expr_compare(&e, &e.clone(), -1), 0);
        let other = Expr::binary(BinaryOp::Lt, Expr::column(&t, 0, 0), Expr::int(6));
        assert_eq!(expr_compare(&e, &other, -1), 2);
    }

    #[test]
    fn test_compare_top_level_collate() {
        let t = table();
        let plain = Expr::column(&t, 0, 1);
        let forced = Expr::collate(plain.clone(), "binary");
        assert_eq!(expr_compare(&forced, &plain, -1), 1);
        assert_eq!(expr_compare(&plain, &forced, -1), 1);
        let other = Expr::collate(plain.clone(), "unicode");
        assert_eq!(expr_compare(&forced, &other, -1), 1);
    }

    #[test]
    fn test_compare_register_and_cursor_wildcard() {
        let t = table();
        let col = Expr::column(&t, 3, 0);
        let reg = Expr::register(7, col.clone());
        assert_eq!(expr_compare(&reg, &col, -1), 0);
        let wildcard = Expr::column(&t, -1, 0);
        assert_eq!(expr_compare(&col, &wildcard, 3), 0);
        assert_eq!(expr_compare(&col, &wildcard, 4), 2);
    }

    #[test]
    fn test_implies() {
        let t = table();
        let x = Expr::column(&t, 0, 0);
        let eq = Expr::eq(x.clone(), Expr::int(21));
        let or = Expr::or(eq.clone(), Expr::eq(Expr::column(&t, 0, 1), Expr::string("y")));
        assert!(expr_implies_expr(&eq, &or, -1));
        let ne = Expr::binary(BinaryOp::Ne, x.clone(), Expr::int(1));
        let not_null = Expr::unary(UnaryOp::NotNull, x.clone());
        assert!(expr_implies_expr(&ne, &not_null, -1));
        let is_null = Expr::unary(UnaryOp::IsNull, x);
        assert!(!expr_implies_expr(&is_null, &not_null, -1));
    }

    #[test]
    fn test_constant_modes() {
        let t = table();
        assert!(expr_is_constant(&Expr::binary(BinaryOp::Add, Expr::int(1), Expr::int(2))));
        let col = Expr::column(&t, 2, 0);
        assert!(!expr_is_constant(&col));
        assert!(expr_is_table_constant(&col, 2));
        assert!(!expr_is_table_constant(&col, 1));

        let random = Expr::function("random", vec![], false);
        assert!(!expr_is_constant(&random));
        assert!(expr_is_constant_or_function(&random));
        assert!(expr_is_constant(&Expr::function("abs", vec![Expr::int(-1)], false)));

        let mut joined = Expr::int(1);
        joined.set_join(1);
        assert!(expr_is_constant(&joined));
        assert!(!expr_is_constant_not_join(&joined));

        assert!(!expr_is_constant(&Expr::register(3, Expr::int(1))));
    }

    #[test]
    fn test_null_and_integer_questions() {
        let t = table();
        assert!(expr_can_be_null(&Expr::column(&t, 0, 0)));
        assert!(!expr_can_be_null(&Expr::column(&t, 0, 1)));
        assert!(!expr_can_be_null(&Expr::unary(UnaryOp::Negate, Expr::int(4))));
        assert_eq!(expr_is_integer(&Expr::unary(UnaryOp::Negate, Expr::int(4))), Some(-4));
        assert_eq!(expr_is_integer(&Expr::int(i64::MAX)), None);
    }

    #[test]
    fn test_vector_shape_and_and() {
        let v = Expr::vector(vec![Expr::int(1), Expr::int(2)]);
        assert_eq!(vector_size(&v), 2);
        assert_eq!(vector_field_subexpr(&v, 1), &Expr::int(2));
        let s = Expr::int(9);
        assert_eq!(vector_field_subexpr(&s, 0), &s);

        assert!(expr_and(None, None).is_none());
        let f = expr_and(Some(Expr::int(1)), Some(Expr::boolean(false))).unwrap();
        assert!(matches!(f.kind, ExprKind::Bool(false)));
        let and = expr_and(Some(Expr::int(1)), Some(Expr::int(2))).unwrap();
        assert_eq!(and.to_string(), "1 AND 2");
    }

    #[test]
    fn test_height_limit() {
        let mut e = Expr::int(1);
        for _ in 0..5 {
            e = Expr::unary(UnaryOp::Negate, e);
        }
        assert!(expr_set_height(&mut e, 10).is_ok());
        let err = expr_set_height(&mut e, 3).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TooBig);
        assert!(check_height(100, 0).is_ok());
    }
}
