//! WHERE clause analysis
//!
//! Splits a predicate into terms and classifies every term for the
//! access-path code: which (cursor, column) it constrains, with which
//! operators, and which cursors each side depends on. Some shapes get
//! extra virtual terms next to the original:
//!
//! * `x BETWEEN a AND b` adds `x >= a` and `x <= b`
//! * `x = 1 OR x = 2` adds `x IN (1, 2)`
//! * `x < y OR x = y` adds `x <= y`
//! * `col LIKE 'ab%'` adds `col >= 'ab'` and `col < 'ac'`
//! * `x IS NOT NULL` adds `x > NULL`
//!
//! `(a, b) = (x, y)` is replaced by `a = x` and `b = y`. A virtual term is
//! never coded; it only tells the access-path code what an index could do.

use tracing::{debug, instrument, trace, Level};

use crate::config::CompileConfig;
use crate::error::Result;
use crate::executor::expr::analyze::{expr_compare, expr_is_vector, vector_field_subexpr, vector_size};
use crate::executor::expr::codegen::column_count_mismatch;
use crate::executor::expr::collate::{binary_compare_coll, expr_coll};
use crate::executor::expr::in_op::check_in_columns;
use crate::executor::expr::types::expr_type;
use crate::executor::where_clause::{
    MaskSet, OperatorMask, WhereAndInfo, WhereClause, WhereOrInfo, WhereTerm, WhereTermFlags,
};
use crate::functions::FuncFlags;
use crate::parser::ast::{BinaryOp, Expr, ExprFlags, ExprKind, ExprList, InRhs, Select, UnaryOp};
use crate::schema::collation::{collation_by_id, collation_name};
use crate::schema::COLL_NONE;
use crate::types::{Bitmask, Cursor, FieldType, ALLBITS};

/// Inputs shared by every analysis step of one WHERE clause
#[derive(Debug, Clone, Copy)]
pub struct AnalyzeCtx<'a> {
    pub masks: &'a MaskSet,
    pub config: &'a CompileConfig,
}

// ============================================================================
// Cursor usage
// ============================================================================

/// Cursors referenced anywhere in `expr`, nested selects included
pub fn expr_usage(masks: &MaskSet, expr: &Expr) -> Bitmask {
    match &expr.kind {
        ExprKind::Column(col) => return masks.get_mask(col.cursor),
        ExprKind::Register { .. } => return 0,
        _ => {}
    }
    let mut mask = expr
        .children()
        .into_iter()
        .fold(0, |m, child| m | expr_usage(masks, child));
    if let Some(select) = expr.subselect() {
        mask |= select_usage(masks, select);
    }
    mask
}

pub fn expr_list_usage(masks: &MaskSet, list: Option<&ExprList>) -> Bitmask {
    list.map_or(0, |l| l.exprs().fold(0, |m, e| m | expr_usage(masks, e)))
}

/// Outer cursors a (possibly correlated) subquery refers to
pub fn select_usage(masks: &MaskSet, select: &Select) -> Bitmask {
    let mut mask = 0;
    for s in select.branches() {
        mask |= expr_list_usage(masks, Some(&s.elist));
        mask |= expr_list_usage(masks, s.group_by.as_ref());
        mask |= expr_list_usage(masks, s.order_by.as_ref());
        for e in [&s.where_clause, &s.having].into_iter().flatten() {
            mask |= expr_usage(masks, e);
        }
        for item in &s.src.items {
            if let Some(sub) = &item.select {
                mask |= select_usage(masks, sub);
            }
            if let Some(on) = &item.on {
                mask |= expr_usage(masks, on);
            }
        }
    }
    mask
}

// ============================================================================
// Term shape helpers
// ============================================================================

fn left_operand(expr: &Expr) -> Option<&Expr> {
    match &expr.kind {
        ExprKind::Binary { left, .. } => Some(left),
        ExprKind::Unary { expr, .. }
        | ExprKind::Between { expr, .. }
        | ExprKind::In { expr, .. } => Some(expr),
        _ => None,
    }
}

fn right_operand(expr: &Expr) -> Option<&Expr> {
    match &expr.kind {
        ExprKind::Binary { right, .. } => Some(right),
        _ => None,
    }
}

/// Operator bit of a term shape that may drive an index
fn allowed_op(expr: &Expr) -> Option<OperatorMask> {
    match &expr.kind {
        ExprKind::Binary { op, .. } => OperatorMask::from_binary(*op),
        ExprKind::In { negated: false, .. } => Some(OperatorMask::IN),
        ExprKind::Unary {
            op: UnaryOp::IsNull,
            ..
        } => Some(OperatorMask::ISNULL),
        _ => None,
    }
}

/// (cursor, column) of an operand that an index could be built on. A
/// row value next to an inequality stands for its first element.
fn expr_might_be_indexed(inequality: bool, expr: &Expr) -> Option<(Cursor, usize)> {
    let e = match &expr.kind {
        ExprKind::Vector(items) if inequality => items.first()?,
        _ => expr,
    };
    e.as_column().map(|c| (c.cursor, c.column))
}

/// Swap the operands of a comparison
fn commute(expr: &mut Expr) {
    if let ExprKind::Binary { op, left, right } = &mut expr.kind {
        std::mem::swap(left, right);
        *op = op.commuted();
    }
}

fn transfer_join_markings(derived: &mut Expr, base: &Expr) {
    if base.is_from_join() {
        derived.flags |= ExprFlags::FROM_JOIN;
        derived.right_join_table = base.right_join_table;
    }
}

/// Is `expr` an `A = B` whose right side may stand in for the left one
/// everywhere else in the WHERE clause?
pub fn term_is_equivalence(expr: &Expr) -> bool {
    let Some((BinaryOp::Eq, left, right)) = expr.binary_parts() else {
        return false;
    };
    if expr.is_from_join() {
        return false;
    }
    let lhs_ty = expr_type(left);
    let rhs_ty = expr_type(right);
    if lhs_ty != rhs_ty && !(lhs_ty.is_numeric() && rhs_ty.is_numeric()) {
        return false;
    }
    let Ok(id) = binary_compare_coll(left, right) else {
        return false;
    };
    if id == COLL_NONE {
        return true;
    }
    match (expr_coll(left), expr_coll(right)) {
        (Ok(l), Ok(r)) => l.id != COLL_NONE && l.id == r.id,
        _ => false,
    }
}

// ============================================================================
// LIKE
// ============================================================================

/// Range bounds derived from a LIKE pattern
#[derive(Debug, Clone, PartialEq)]
pub struct LikePrefix {
    /// Column the pattern is matched against
    pub subject: Expr,
    /// Literal prefix before the first wildcard
    pub prefix: String,
    /// Prefix with its last character incremented
    pub upper: String,
    /// The only wildcard is a trailing `%`: the range implies the match
    pub is_complete: bool,
}

/// Recognize `subject LIKE 'prefix...'` where the prefix can bound an
/// index scan on `subject`.
pub fn is_like_or_glob(config: &CompileConfig, expr: &Expr) -> Option<LikePrefix> {
    let ExprKind::Function(call) = &expr.kind else {
        return None;
    };
    if !call.has_flag(FuncFlags::LIKE) || call.args.len() != 2 {
        return None;
    }
    let pattern = &call.args[0];
    let subject = &call.args[1];
    let col = subject.as_column()?;
    if expr_type(subject) != FieldType::String {
        return None;
    }
    let coll_id = col.def().map_or(COLL_NONE, |d| d.coll_id);
    let coll_name = collation_name(coll_id);
    if !config.like_collation_allowed(coll_name.as_deref()) {
        return None;
    }
    if config.case_sensitive_like
        && !collation_by_id(coll_id).is_some_and(|c| c.is_byte_order())
    {
        return None;
    }
    let (text, from_param) = match &pattern.kind {
        ExprKind::String(text) => (text.as_str(), false),
        ExprKind::Variable { index, .. } => (config.bound_text(*index)?, true),
        _ => return None,
    };
    let cut = text.find(['%', '_']).unwrap_or(text.len());
    let prefix = &text[..cut];
    let last = prefix.chars().last()?;
    let next = char::from_u32(last as u32 + 1)?;
    let mut upper = prefix[..prefix.len() - last.len_utf8()].to_string();
    upper.push(next);
    // a rebound parameter may stop matching the range, so the LIKE stays
    let is_complete =
        !from_param && cut + 1 == text.len() && text[cut..].starts_with('%');
    Some(LikePrefix {
        subject: subject.clone(),
        prefix: prefix.to_string(),
        upper,
        is_complete,
    })
}

// ============================================================================
// Splitting and analysis
// ============================================================================

/// Append the `op`-separated pieces of `expr` to `wc`
pub fn where_split(wc: &mut WhereClause, expr: &Expr, op: BinaryOp) {
    wc.op = op;
    match expr.skip_collate().binary_parts() {
        Some((o, left, right)) if o == op => {
            where_split(wc, left, op);
            where_split(wc, right, op);
        }
        _ => {
            wc.insert(expr.clone(), WhereTermFlags::empty());
        }
    }
}

/// Analyze every term present when called, last first. Terms added along
/// the way are analyzed by the step that adds them.
pub fn where_expr_analyze_all(ctx: &AnalyzeCtx<'_>, wc: &mut WhereClause) -> Result<()> {
    for idx in (0..wc.len()).rev() {
        where_expr_analyze(ctx, wc, idx)?;
    }
    Ok(())
}

/// Split `where_expr` on AND and analyze the terms
#[instrument(skip_all, level = Level::DEBUG)]
pub fn analyze_where_clause(ctx: &AnalyzeCtx<'_>, where_expr: &Expr) -> Result<WhereClause> {
    let mut wc = WhereClause::new(BinaryOp::And);
    where_split(&mut wc, where_expr, BinaryOp::And);
    let split = wc.len();
    where_expr_analyze_all(ctx, &mut wc)?;
    debug!(split, terms = wc.len(), "analyzed where clause");
    Ok(wc)
}

pub fn where_clause_clear(wc: &mut WhereClause) {
    wc.clear();
}

/// Classify term `idx` of `wc`, adding derived terms where a rewrite
/// applies. A term already analyzed is left alone.
pub fn where_expr_analyze(ctx: &AnalyzeCtx<'_>, wc: &mut WhereClause, idx: usize) -> Result<()> {
    if wc.terms[idx].has_flag(WhereTermFlags::ANALYZED) {
        return Ok(());
    }
    wc.terms[idx].flags |= WhereTermFlags::ANALYZED;
    let masks = ctx.masks;
    let expr = wc.terms[idx].expr.clone();
    let field = wc.terms[idx].field;

    let prereq_left = left_operand(&expr).map_or(0, |l| expr_usage(masks, l));
    let prereq_right = match &expr.kind {
        ExprKind::In { expr: lhs, rhs, .. } => {
            check_in_columns(lhs, rhs)?;
            match rhs {
                InRhs::Select(select) => select_usage(masks, select),
                InRhs::List(list) => list.iter().fold(0, |m, e| m | expr_usage(masks, e)),
            }
        }
        ExprKind::Unary {
            op: UnaryOp::IsNull,
            ..
        } => 0,
        _ => right_operand(&expr).map_or(0, |r| expr_usage(masks, r)),
    };
    let mut prereq_all = expr_usage(masks, &expr);
    let mut extra_right: Bitmask = 0;
    if expr.is_from_join() {
        // ON-clause terms may not drive an index on a table left of the join
        let x = masks.get_mask(expr.right_join_table);
        prereq_all |= x;
        extra_right = x.wrapping_sub(1);
    }
    {
        let term = &mut wc.terms[idx];
        term.prereq_right = prereq_right;
        term.prereq_all = prereq_all;
        term.left_cursor = -1;
        term.parent = None;
        term.operator = OperatorMask::empty();
    }

    if let Some(op_bit) = allowed_op(&expr) {
        let op_mask = if prereq_right & prereq_left == 0 {
            OperatorMask::ALL
        } else {
            OperatorMask::EQUIV
        };
        let inequality = op_bit.intersects(
            OperatorMask::LT | OperatorMask::LE | OperatorMask::GT | OperatorMask::GE,
        );
        let mut left = left_operand(&expr).map(Expr::skip_collate);
        if field > 0 {
            left = left.map(|l| vector_field_subexpr(l, field - 1));
        }
        if let Some((cursor, column)) = left.and_then(|l| expr_might_be_indexed(inequality, l)) {
            let term = &mut wc.terms[idx];
            term.left_cursor = cursor;
            term.left_column = column;
            term.operator = op_bit & op_mask;
        }
        let right = right_operand(&expr).map(Expr::skip_collate);
        if let Some((cursor, column)) = right.and_then(|r| expr_might_be_indexed(inequality, r)) {
            let mut extra_op = OperatorMask::empty();
            let target = if wc.terms[idx].left_cursor >= 0 {
                let mut dup = expr.clone();
                if term_is_equivalence(&dup) {
                    wc.terms[idx].operator |= OperatorMask::EQUIV;
                    extra_op = OperatorMask::EQUIV;
                }
                wc.terms[idx].flags |= WhereTermFlags::COPIED;
                commute(&mut dup);
                let new_idx = wc.insert(
                    dup,
                    WhereTermFlags::VIRTUAL | WhereTermFlags::DYNAMIC | WhereTermFlags::ANALYZED,
                );
                wc.mark_child(new_idx, idx);
                new_idx
            } else {
                commute(&mut wc.terms[idx].expr);
                idx
            };
            let commuted = wc.terms[target]
                .expr
                .binary_parts()
                .and_then(|(op, _, _)| OperatorMask::from_binary(op))
                .unwrap_or_default();
            let term = &mut wc.terms[target];
            term.left_cursor = cursor;
            term.left_column = column;
            term.prereq_right = prereq_left | extra_right;
            term.prereq_all = prereq_all;
            term.operator = (commuted | extra_op) & op_mask;
        }
    } else if let ExprKind::Between {
        expr: operand,
        low,
        high,
        negated: false,
    } = &expr.kind
    {
        if wc.op == BinaryOp::And {
            for (op, bound) in [(BinaryOp::Ge, low), (BinaryOp::Le, high)] {
                let mut new_expr = Expr::binary(op, (**operand).clone(), (**bound).clone());
                transfer_join_markings(&mut new_expr, &expr);
                let new_idx = wc.insert(new_expr, WhereTermFlags::VIRTUAL | WhereTermFlags::DYNAMIC);
                where_expr_analyze(ctx, wc, new_idx)?;
                wc.mark_child(new_idx, idx);
            }
        }
    } else if matches!(
        expr.kind,
        ExprKind::Binary {
            op: BinaryOp::Or,
            ..
        }
    ) {
        analyze_or_term(ctx, wc, idx)?;
    }

    if wc.op == BinaryOp::And && ctx.config.enable_like_opt {
        if let Some(like) = is_like_or_glob(ctx.config, &expr) {
            trace!(prefix = %like.prefix, complete = like.is_complete, "LIKE range");
            let flags =
                WhereTermFlags::LIKE_OPT | WhereTermFlags::VIRTUAL | WhereTermFlags::DYNAMIC;
            let mut bounds = Vec::with_capacity(2);
            for (op, text) in [(BinaryOp::Ge, like.prefix), (BinaryOp::Lt, like.upper)] {
                let mut new_expr = Expr::binary(op, like.subject.clone(), Expr::string(text));
                transfer_join_markings(&mut new_expr, &expr);
                let new_idx = wc.insert(new_expr, flags);
                where_expr_analyze(ctx, wc, new_idx)?;
                bounds.push(new_idx);
            }
            if like.is_complete {
                for new_idx in bounds {
                    wc.mark_child(new_idx, idx);
                }
            }
        }
    }

    if wc.op == BinaryOp::And {
        if let Some((BinaryOp::Eq, left, right)) = expr.binary_parts() {
            if expr_is_vector(left) && left.subselect().is_none() && right.subselect().is_none() {
                let n = vector_size(left);
                if vector_size(right) != n {
                    return Err(column_count_mismatch(n, vector_size(right)));
                }
                for i in 0..n {
                    let mut new_expr = Expr::eq(
                        vector_field_subexpr(left, i).clone(),
                        vector_field_subexpr(right, i).clone(),
                    );
                    transfer_join_markings(&mut new_expr, &expr);
                    let new_idx = wc.insert(new_expr, WhereTermFlags::DYNAMIC);
                    where_expr_analyze(ctx, wc, new_idx)?;
                }
                let term = &mut wc.terms[idx];
                term.flags = WhereTermFlags::CODED | WhereTermFlags::VIRTUAL | WhereTermFlags::ANALYZED;
                term.operator = OperatorMask::empty();
            }
        }
    }

    if wc.op == BinaryOp::And && field == 0 {
        if let ExprKind::In {
            expr: lhs,
            rhs: InRhs::Select(select),
            negated: false,
        } = &expr.kind
        {
            if matches!(lhs.kind, ExprKind::Vector(_)) && select.prior.is_none() {
                for i in 0..vector_size(lhs) {
                    let new_idx = wc.insert(expr.clone(), WhereTermFlags::VIRTUAL);
                    wc.terms[new_idx].field = i + 1;
                    where_expr_analyze(ctx, wc, new_idx)?;
                    wc.mark_child(new_idx, idx);
                }
            }
        }
    }

    if let ExprKind::Unary {
        op: UnaryOp::NotNull,
        expr: operand,
    } = &expr.kind
    {
        if let Some(col) = operand.as_column() {
            let new_expr = Expr::binary(BinaryOp::Gt, (**operand).clone(), Expr::null());
            let new_idx = wc.insert(
                new_expr,
                WhereTermFlags::VIRTUAL
                    | WhereTermFlags::DYNAMIC
                    | WhereTermFlags::VNULL
                    | WhereTermFlags::ANALYZED,
            );
            let prereq_all = wc.terms[idx].prereq_all;
            let term = &mut wc.terms[new_idx];
            term.prereq_right = 0;
            term.prereq_all = prereq_all;
            term.left_cursor = col.cursor;
            term.left_column = col.column;
            term.operator = OperatorMask::GT;
            wc.mark_child(new_idx, idx);
            wc.terms[idx].flags |= WhereTermFlags::COPIED;
        }
    }

    let term = &mut wc.terms[idx];
    term.prereq_right |= extra_right;
    trace!(
        idx,
        expr = %term.expr,
        operator = ?term.operator,
        left_cursor = term.left_cursor,
        prereq_right = term.prereq_right,
        prereq_all = term.prereq_all,
        "classified term"
    );
    Ok(())
}

// ============================================================================
// OR terms
// ============================================================================

fn analyze_or_term(ctx: &AnalyzeCtx<'_>, wc: &mut WhereClause, idx: usize) -> Result<()> {
    let expr = wc.terms[idx].expr.clone();
    let mut or_wc = WhereClause::new(BinaryOp::Or);
    where_split(&mut or_wc, &expr, BinaryOp::Or);
    where_expr_analyze_all(ctx, &mut or_wc)?;

    let (indexable, chng_to_in) = or_indexable_mask(ctx, &mut or_wc)?;
    wc.terms[idx].operator = if indexable == 0 {
        OperatorMask::empty()
    } else {
        OperatorMask::OR
    };

    if indexable != 0 && or_wc.len() == 2 {
        let mut combined = Vec::new();
        for one in nth_subterms(&or_wc.terms[0]) {
            for two in nth_subterms(&or_wc.terms[1]) {
                combined.extend(combine_disjuncts(one, two));
            }
        }
        for new_expr in combined {
            trace!(expr = %new_expr, "combined disjuncts");
            let new_idx = wc.insert(new_expr, WhereTermFlags::VIRTUAL | WhereTermFlags::DYNAMIC);
            where_expr_analyze(ctx, wc, new_idx)?;
        }
    }

    if chng_to_in != 0 && ctx.config.enable_or_to_in {
        if let Some(mut in_expr) = or_to_in(ctx.masks, &mut or_wc, chng_to_in) {
            debug!(expr = %in_expr, "OR terms rewritten as IN");
            transfer_join_markings(&mut in_expr, &expr);
            let new_idx = wc.insert(in_expr, WhereTermFlags::VIRTUAL | WhereTermFlags::DYNAMIC);
            where_expr_analyze(ctx, wc, new_idx)?;
            wc.mark_child(new_idx, idx);
            // the IN term trumps the OR for indexing
            wc.terms[idx].operator = OperatorMask::NOOP;
        }
    }

    let term = &mut wc.terms[idx];
    term.flags |= WhereTermFlags::OR_INFO;
    term.or_info = Some(Box::new(WhereOrInfo {
        wc: or_wc,
        indexable,
    }));
    Ok(())
}

/// The AND-connected pieces of a disjunct, or the disjunct itself
fn nth_subterms(term: &WhereTerm) -> Vec<&WhereTerm> {
    match &term.and_info {
        Some(info) if term.operator == OperatorMask::AND => info.wc.terms.iter().collect(),
        _ => vec![term],
    }
}

/// Cursors that can drive an index for every disjunct of `or_wc`, and the
/// cursors for which every disjunct is an equality. AND-connected
/// disjuncts get their own analyzed sub-clause.
pub fn or_indexable_mask(
    ctx: &AnalyzeCtx<'_>,
    or_wc: &mut WhereClause,
) -> Result<(Bitmask, Bitmask)> {
    let masks = ctx.masks;
    let mut indexable = ALLBITS;
    let mut chng_to_in = ALLBITS;
    for i in 0..or_wc.len() {
        if indexable == 0 {
            break;
        }
        if !or_wc.terms[i].operator.intersects(OperatorMask::SINGLE) {
            chng_to_in = 0;
            let sub = or_wc.terms[i].expr.clone();
            let mut and_wc = WhereClause::new(BinaryOp::And);
            where_split(&mut and_wc, &sub, BinaryOp::And);
            where_expr_analyze_all(ctx, &mut and_wc)?;
            let b = and_wc
                .terms
                .iter()
                .filter(|t| allowed_op(&t.expr).is_some())
                .fold(0, |m, t| m | masks.get_mask(t.left_cursor));
            indexable &= b;
            let term = &mut or_wc.terms[i];
            term.flags |= WhereTermFlags::AND_INFO;
            term.operator = OperatorMask::AND;
            term.and_info = Some(Box::new(WhereAndInfo { wc: and_wc }));
        } else if or_wc.terms[i].has_flag(WhereTermFlags::COPIED) {
            // the virtual twin is examined instead
        } else {
            let term = &or_wc.terms[i];
            let mut b = masks.get_mask(term.left_cursor);
            if term.is_virtual() {
                if let Some(parent) = term.parent {
                    b |= masks.get_mask(or_wc.terms[parent].left_cursor);
                }
            }
            indexable &= b;
            if term.operator.contains(OperatorMask::EQ) {
                chng_to_in &= b;
            } else {
                chng_to_in = 0;
            }
        }
    }
    Ok((indexable, chng_to_in))
}

/// Two disjuncts `A op1 B` and `A op2 B` with compatible operators merge
/// into one weaker comparison: `x<y OR x=y` gives `x<=y`.
pub fn combine_disjuncts(one: &WhereTerm, two: &WhereTerm) -> Option<Expr> {
    let cmp = OperatorMask::EQ | OperatorMask::LT | OperatorMask::LE | OperatorMask::GT | OperatorMask::GE;
    if !one.operator.intersects(cmp) || !two.operator.intersects(cmp) {
        return None;
    }
    let mut e_op = one.operator | two.operator;
    let below = OperatorMask::EQ | OperatorMask::LT | OperatorMask::LE;
    let above = OperatorMask::EQ | OperatorMask::GT | OperatorMask::GE;
    if !below.contains(e_op) && !above.contains(e_op) {
        return None;
    }
    let (_, l1, r1) = one.expr.binary_parts()?;
    let (_, l2, r2) = two.expr.binary_parts()?;
    if expr_compare(l1, l2, -1) != 0 || expr_compare(r1, r2, -1) != 0 {
        return None;
    }
    if e_op.bits().count_ones() > 1 {
        e_op = if e_op.intersects(OperatorMask::LT | OperatorMask::LE) {
            OperatorMask::LE
        } else {
            OperatorMask::GE
        };
    }
    let op = e_op.to_binary()?;
    let mut new_expr = one.expr.clone();
    if let ExprKind::Binary { op: o, .. } = &mut new_expr.kind {
        *o = op;
    }
    Some(new_expr)
}

/// Rewrite `x = A OR x = B ...` as `x IN (A, B, ...)`.
///
/// Each disjunct is a single equality. The column is the first
/// (cursor, column) pair in term order for which every disjunct on that
/// cursor uses the same column; a second pass retries with the next
/// cursor. Disjuncts whose value type differs from the column type block
/// the rewrite. Qualifying disjuncts are tagged OR_OK.
pub fn or_to_in(masks: &MaskSet, or_wc: &mut WhereClause, chng_to_in: Bitmask) -> Option<Expr> {
    let mut ok = false;
    let mut cursor: Cursor = -1;
    let mut column = 0usize;
    for _ in 0..2 {
        if ok {
            break;
        }
        let mut start = None;
        for (i, term) in or_wc.terms.iter_mut().enumerate() {
            term.flags.remove(WhereTermFlags::OR_OK);
            if term.left_cursor == cursor {
                continue;
            }
            if chng_to_in & masks.get_mask(term.left_cursor) == 0 {
                continue;
            }
            cursor = term.left_cursor;
            column = term.left_column;
            start = Some(i);
            break;
        }
        let start = start?;
        ok = true;
        for term in or_wc.terms[start..].iter_mut() {
            if !ok {
                break;
            }
            if term.left_cursor != cursor {
                term.flags.remove(WhereTermFlags::OR_OK);
            } else if term.left_column != column {
                ok = false;
            } else {
                let Some((_, left, right)) = term.expr.binary_parts() else {
                    ok = false;
                    continue;
                };
                let rhs = expr_type(right);
                let lhs = expr_type(left);
                if rhs != FieldType::Scalar && !lhs.contains(rhs) {
                    ok = false;
                } else {
                    term.flags |= WhereTermFlags::OR_OK;
                }
            }
        }
    }
    if !ok {
        return None;
    }
    let mut values = Vec::new();
    let mut lhs = None;
    for term in or_wc.terms.iter().filter(|t| t.has_flag(WhereTermFlags::OR_OK)) {
        if let Some((_, left, right)) = term.expr.binary_parts() {
            values.push(right.clone());
            lhs = Some(left);
        }
    }
    Some(Expr::in_list(lhs?.clone(), values, false))
}
