//! Type inference over expression trees

use crate::parser::ast::{BinaryOp, Expr, ExprKind, InRhs, UnaryOp};
use crate::types::FieldType;

/// Result type of a binary arithmetic operator applied to `lhs` and `rhs`
pub fn type_result(lhs: FieldType, rhs: FieldType) -> FieldType {
    FieldType::result(lhs, rhs)
}

/// Widen `a` so that it also covers the type of `expr`.
///
/// A bound parameter or an `any` side widens to `any`; a NULL literal
/// leaves `a` unchanged; numeric types climb the numeric lattice and any
/// other disagreement gives `scalar`.
pub fn highest_type(a: FieldType, expr: &Expr) -> FieldType {
    if a == FieldType::Any || matches!(expr.kind, ExprKind::Variable { .. }) {
        return FieldType::Any;
    }
    if expr.is_null_literal() {
        return a;
    }
    let b = expr_type(expr);
    if a == b {
        return a;
    }
    let container = |t: FieldType| {
        matches!(t, FieldType::Map | FieldType::Array | FieldType::Interval)
    };
    if b == FieldType::Any || container(a) || container(b) {
        return FieldType::Any;
    }
    if !a.is_numeric() || !b.is_numeric() {
        return FieldType::Scalar;
    }
    for ty in [FieldType::Number, FieldType::Decimal, FieldType::Double] {
        if a == ty || b == ty {
            return ty;
        }
    }
    FieldType::Integer
}

/// Type of the value `expr` evaluates to.
pub fn expr_type(expr: &Expr) -> FieldType {
    let mut e = expr.skip_collate();
    if let ExprKind::Register { orig, .. } = &e.kind {
        e = orig.skip_collate();
    }
    match &e.kind {
        ExprKind::Subquery(select) => match select.elist.items.first() {
            Some(item) => expr_type(&item.expr),
            None => FieldType::Any,
        },
        ExprKind::Cast { ty, .. } => *ty,
        ExprKind::Column(col) | ExprKind::AggColumn { col, .. } => col
            .def()
            .map(|c| c.field_type)
            .unwrap_or(FieldType::Scalar),
        ExprKind::Binary { op, left, right } => match op {
            BinaryOp::Concat => FieldType::String,
            op if op.is_arithmetic() => type_result(expr_type(right), expr_type(left)),
            _ => FieldType::Boolean,
        },
        ExprKind::Case {
            arms, else_expr, ..
        } => case_type(arms.iter().map(|a| &a.then), else_expr.as_deref()),
        ExprKind::Unary { op, expr: child } => match op {
            UnaryOp::Not | UnaryOp::IsNull | UnaryOp::NotNull => FieldType::Boolean,
            UnaryOp::Negate | UnaryOp::Plus | UnaryOp::BitNot => expr_type(child),
        },
        ExprKind::Between { .. } | ExprKind::Exists(_) | ExprKind::In { .. } => {
            FieldType::Boolean
        }
        _ => e.ty,
    }
}

/// Type of a CASE: the widest type over its non-NULL result arms
fn case_type<'a>(
    mut thens: impl Iterator<Item = &'a Expr>,
    else_expr: Option<&Expr>,
) -> FieldType {
    let first = loop {
        match thens.next() {
            Some(then) if then.is_null_literal() => continue,
            Some(then) => break Some(then),
            None => break None,
        }
    };
    let Some(first) = first else {
        return FieldType::Any;
    };
    let mut ty = if matches!(first.kind, ExprKind::Variable { .. }) {
        FieldType::Any
    } else {
        expr_type(first)
    };
    for then in thens {
        ty = highest_type(ty, then);
    }
    match else_expr {
        Some(e) => highest_type(ty, e),
        None => ty,
    }
}

/// Type both operands of a comparison or IN are compared under
pub fn comparison_type(expr: &Expr) -> FieldType {
    match &expr.kind {
        ExprKind::Binary { left, right, .. } => type_result(expr_type(right), expr_type(left)),
        ExprKind::In { expr: lhs, rhs, .. } => {
            let lhs_type = expr_type(lhs);
            match rhs {
                InRhs::Select(select) => match select.elist.items.first() {
                    Some(item) => type_result(expr_type(&item.expr), lhs_type),
                    None => FieldType::Scalar,
                },
                InRhs::List(_) => FieldType::Scalar,
            }
        }
        _ => FieldType::Scalar,
    }
}

/// Type tag placed in the low bits of a comparison's P5 when `left` is
/// compared against `right`
pub fn binary_compare_type(left: &Expr, right: &Expr) -> FieldType {
    type_result(expr_type(right), expr_type(left))
}

/// True when converting the value of `expr` to `ty` never changes it, so
/// an ApplyType for it may be omitted.
pub fn expr_needs_no_type_change(expr: &Expr, ty: FieldType) -> bool {
    if matches!(ty, FieldType::Any | FieldType::Scalar) {
        return true;
    }
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
        ExprKind::Integer(_) => matches!(ty, FieldType::Integer | FieldType::Number),
        ExprKind::Float(_) => matches!(ty, FieldType::Double | FieldType::Number),
        ExprKind::String(_) => ty == FieldType::String,
        ExprKind::Blob(_) => ty == FieldType::Varbinary,
        ExprKind::Bool(_) => ty == FieldType::Boolean,
        ExprKind::Column(col) => col.def().is_some_and(|c| c.field_type == ty),
        _ => false,
    }
}
