//! Collation resolution
//!
//! Every expression yields a collation id and whether it was forced by an
//! explicit COLLATE. Two forced collations that differ cannot be combined.

use crate::error::{Error, ErrorCode, Result};
use crate::executor::expr::types::expr_type;
use crate::functions::FuncFlags;
use crate::parser::ast::{BinaryOp, Expr, ExprFlags, ExprKind, UnaryOp};
use crate::schema::collation::collation_by_name;
use crate::schema::{CollId, COLL_NONE};
use crate::types::FieldType;

/// Collation of an expression and whether it is explicit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExprColl {
    pub id: CollId,
    pub is_explicit: bool,
}

impl ExprColl {
    pub const NONE: ExprColl = ExprColl {
        id: COLL_NONE,
        is_explicit: false,
    };

    fn explicit(id: CollId) -> Self {
        ExprColl {
            id,
            is_explicit: true,
        }
    }

    fn implicit(id: CollId) -> Self {
        ExprColl {
            id,
            is_explicit: false,
        }
    }
}

pub(crate) fn illegal_collation_mix() -> Error {
    Error::with_message(ErrorCode::Collation, "Illegal mix of collations")
}

fn coll_id_by_name(name: &str) -> Result<CollId> {
    collation_by_name(name).map(|c| c.id).ok_or_else(|| {
        Error::with_message(
            ErrorCode::Error,
            format!("Collation '{}' does not exist", name),
        )
    })
}

/// Resolve the collation governing `expr`.
pub fn expr_coll(expr: &Expr) -> Result<ExprColl> {
    let mut p = expr;
    loop {
        match &p.kind {
            ExprKind::Cast { expr, .. }
            | ExprKind::Unary {
                op: UnaryOp::Plus,
                expr,
            } => {
                p = expr;
                continue;
            }
            ExprKind::Collate { collation, .. } => {
                return Ok(ExprColl::explicit(coll_id_by_name(collation)?));
            }
            ExprKind::Register { orig, .. } => match &orig.kind {
                ExprKind::Collate { collation, .. } => {
                    return Ok(ExprColl::explicit(coll_id_by_name(collation)?));
                }
                ExprKind::Column(col) | ExprKind::AggColumn { col, .. } => {
                    return Ok(ExprColl::implicit(
                        col.def().map(|c| c.coll_id).unwrap_or(COLL_NONE),
                    ));
                }
                _ => {
                    p = orig;
                    continue;
                }
            },
            ExprKind::Column(col) | ExprKind::AggColumn { col, .. } => {
                return Ok(ExprColl::implicit(
                    col.def().map(|c| c.coll_id).unwrap_or(COLL_NONE),
                ));
            }
            ExprKind::Binary {
                op: BinaryOp::Concat,
                left,
                right,
            } => {
                let lhs = expr_coll(left)?;
                let rhs = expr_coll(right)?;
                if lhs.is_explicit && rhs.is_explicit && lhs.id != rhs.id {
                    return Err(illegal_collation_mix());
                }
                if lhs.is_explicit {
                    return Ok(lhs);
                }
                if rhs.is_explicit {
                    return Ok(rhs);
                }
                if lhs.id != rhs.id {
                    return Ok(ExprColl::NONE);
                }
                return Ok(ExprColl::implicit(lhs.id));
            }
            ExprKind::Function(call) => {
                if call.has_flag(FuncFlags::DERIVEDCOLL) && p.ty == FieldType::String {
                    if let Some(first) = call.args.first() {
                        p = first;
                        continue;
                    }
                }
                return Ok(ExprColl::NONE);
            }
            _ => {}
        }
        if !p.has_flag(ExprFlags::COLLATE) {
            return Ok(ExprColl::NONE);
        }
        match p
            .children()
            .into_iter()
            .find(|c| c.has_flag(ExprFlags::COLLATE))
        {
            Some(next) => p = next,
            None => return Ok(ExprColl::NONE),
        }
    }
}

/// Combine two collations that meet in one operation.
///
/// Forced collations must agree. A forced collation beats an implicit
/// one. Two different implicit collations combine only when one of them
/// is "none".
pub fn collations_check_compatibility(lhs: ExprColl, rhs: ExprColl) -> Result<CollId> {
    if lhs.is_explicit && rhs.is_explicit && lhs.id != rhs.id {
        return Err(illegal_collation_mix());
    }
    if lhs.is_explicit {
        return Ok(lhs.id);
    }
    if rhs.is_explicit {
        return Ok(rhs.id);
    }
    if lhs.id != rhs.id {
        if lhs.id == COLL_NONE {
            return Ok(rhs.id);
        }
        if rhs.id == COLL_NONE {
            return Ok(lhs.id);
        }
        return Err(illegal_collation_mix());
    }
    Ok(lhs.id)
}

/// Collation used to compare `left` with `right`
pub fn binary_compare_coll(left: &Expr, right: &Expr) -> Result<CollId> {
    let lhs = expr_coll(left)?;
    let rhs = expr_coll(right)?;
    collations_check_compatibility(lhs, rhs)
}

/// COLLATE only applies to values that may be strings
pub fn check_collate_arg(expr: &Expr) -> Result<()> {
    let mut arg = expr;
    while let ExprKind::Collate { expr: inner, .. } = &arg.kind {
        arg = inner;
    }
    if !expr_type(arg).contains(FieldType::String) {
        return Err(Error::with_message(
            ErrorCode::Syntax,
            "COLLATE clause can't be used with non-string arguments",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, Table, COLL_BINARY, COLL_UNICODE, COLL_UNICODE_CI};
    use std::sync::Arc;

    fn table() -> Arc<Table> {
        Arc::new(Table::new(
            "t",
            vec![
                Column::new("a", FieldType::String).with_collation(COLL_UNICODE_CI),
                Column::new("b", FieldType::String),
                Column::new("c", FieldType::String).with_collation(COLL_BINARY),
                Column::new("n", FieldType::Integer),
            ],
        ))
    }

    #[test]
    fn test_column_and_explicit_collation() {
        let t = table();
        let col = Expr::column(&t, 0, 0);
        assert_eq!(expr_coll(&col).unwrap(), ExprColl::implicit(COLL_UNICODE_CI));
        let forced = Expr::collate(col, "binary");
        assert_eq!(expr_coll(&forced).unwrap(), ExprColl::explicit(COLL_BINARY));
        let cast = Expr::cast(Expr::column(&t, 0, 2), FieldType::String);
        assert_eq!(expr_coll(&cast).unwrap().id, COLL_BINARY);
    }

    #[test]
    fn test_concat_collation_mix() {
        let t = table();
        let mixed = Expr::binary(
            BinaryOp::Concat,
            Expr::collate(Expr::column(&t, 0, 1), "unicode"),
            Expr::collate(Expr::column(&t, 0, 1), "binary"),
        );
        let err = expr_coll(&mixed).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Collation);

        let explicit_wins = Expr::binary(
            BinaryOp::Concat,
            Expr::column(&t, 0, 0),
            Expr::collate(Expr::column(&t, 0, 1), "unicode"),
        );
        assert_eq!(expr_coll(&explicit_wins).unwrap(), ExprColl::explicit(COLL_UNICODE));

        let implicit_clash = Expr::binary(
            BinaryOp::Concat,
            Expr::column(&t, 0, 0),
            Expr::column(&t, 0, 2),
        );
        assert_eq!(expr_coll(&implicit_clash).unwrap(), ExprColl::NONE);
    }

    #[test]
    fn test_explicit_beats_implicit_on_either_side() {
        let t = table();
        let forced = Expr::collate(Expr::column(&t, 0, 1), "unicode");
        let implicit = Expr::column(&t, 0, 0);
        assert_eq!(binary_compare_coll(&forced, &implicit).unwrap(), COLL_UNICODE);
        assert_eq!(binary_compare_coll(&implicit, &forced).unwrap(), COLL_UNICODE);
    }

    #[test]
    fn test_compatibility_rules() {
        let none = ExprColl::NONE;
        let ci = ExprColl::implicit(COLL_UNICODE_CI);
        let bin = ExprColl::implicit(COLL_BINARY);
        assert_eq!(collations_check_compatibility(none, ci).unwrap(), COLL_UNICODE_CI);
        assert_eq!(collations_check_compatibility(ci, none).unwrap(), COLL_UNICODE_CI);
        assert!(collations_check_compatibility(ci, bin).is_err());
        let forced = ExprColl::explicit(COLL_BINARY);
        assert_eq!(collations_check_compatibility(ci, forced).unwrap(), COLL_BINARY);
        assert!(collations_check_compatibility(
            ExprColl::explicit(COLL_UNICODE),
            forced
        )
        .is_err());
    }

    #[test]
    fn test_derived_collation_through_function() {
        let t = table();
        let upper = Expr::function("upper", vec![Expr::column(&t, 0, 0)], false);
        assert_eq!(expr_coll(&upper).unwrap().id, COLL_UNICODE_CI);
        let nested = Expr::binary(
            BinaryOp::Eq,
            Expr::collate(Expr::column(&t, 0, 1), "binary"),
            Expr::string("x"),
        );
        assert_eq!(expr_coll(&nested).unwrap(), ExprColl::explicit(COLL_BINARY));
    }

    #[test]
    fn test_unknown_collation_and_non_string_arg() {
        let t = table();
        let bad = Expr::collate(Expr::column(&t, 0, 1), "no_such_collation");
        assert_eq!(expr_coll(&bad).unwrap_err().code(), ErrorCode::Error);
        let num = Expr::collate(Expr::column(&t, 0, 3), "binary");
        assert!(check_collate_arg(&num).is_err());
        assert!(check_collate_arg(&Expr::collate(Expr::column(&t, 0, 1), "binary")).is_ok());
    }
}
