//! IN operator and subquery materialization
//!
//! `x IN (...)` is implemented one of three ways:
//!
//! - an existing index on the single table of `SELECT col FROM t` is probed
//!   directly;
//! - a short or non-constant value list is expanded into a chain of
//!   comparisons;
//! - otherwise the right-hand side is stored in an ephemeral index which is
//!   probed with the left-hand value.
//!
//! The result of a materialization is kept across executions of the same
//! statement run by a `Once` guard, unless the subquery is correlated.

use std::sync::Arc;

use bitflags::bitflags;
use tracing::debug;

use crate::error::{Error, Result};
use crate::executor::expr::analyze::{
    expr_can_be_null, expr_is_constant, vector_field_subexpr, vector_size,
};
use crate::executor::expr::codegen::column_count_mismatch;
use crate::executor::expr::collate::{binary_compare_coll, expr_coll};
use crate::executor::expr::types::{expr_type, type_result};
use crate::executor::parse::Parse;
use crate::executor::select::{sql_select, SelectDest, SelectDestKind};
use crate::parser::ast::{Expr, ExprFlags, ExprKind, InRhs, Select, SelectFlags};
use crate::types::{Cursor, FieldType, Reg, SortOrder, BMS};
use crate::vdbe::ops::{cmp_flags, opflags, KeyInfo, Opcode, P4};

bitflags! {
    /// What the caller of [`Parse::find_in_index`] will do with the result
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct InIndexFlags: u8 {
        /// Membership test
        const MEMBERSHIP = 0x01;
        /// Iterate over the set; values must be unique
        const LOOP = 0x02;
        /// A comparison chain is acceptable
        const NOOP_OK = 0x04;
    }
}

/// Strategy chosen for an IN operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InIndexKind {
    /// Existing index, ascending
    IndexAsc,
    /// Existing index, descending
    IndexDesc,
    /// Ephemeral index filled from the right-hand side
    Ephemeral,
    /// No index: a chain of comparisons
    Noop,
}

/// Outcome of [`Parse::find_in_index`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InIndex {
    pub kind: InIndexKind,
    /// Cursor opened on the index, unused for `Noop`
    pub cursor: Cursor,
    /// Register set to 1 when the set contains a NULL, 0 if not tracked
    pub rhs_has_null: Reg,
    /// Key column holding each component of the left-hand side
    pub map: Vec<usize>,
}

fn in_parts(in_expr: &Expr) -> Result<(&Expr, &InRhs)> {
    match &in_expr.kind {
        ExprKind::In { expr, rhs, .. } => Ok((expr, rhs)),
        _ => Err(Error::internal("IN strategy requested for a non-IN node")),
    }
}

/// The SELECT on the right of `in_expr` when it is a plain column
/// projection of a single table, eligible for a direct index probe.
pub fn candidate_for_in_opt(in_expr: &Expr) -> Option<&Select> {
    let ExprKind::In {
        rhs: InRhs::Select(select),
        ..
    } = &in_expr.kind
    else {
        return None;
    };
    if in_expr.has_flag(ExprFlags::VAR_SELECT) || select.prior.is_some() {
        return None;
    }
    if select.has_flag(SelectFlags::DISTINCT) || select.has_flag(SelectFlags::AGGREGATE) {
        return None;
    }
    if select.group_by.is_some() || select.limit.is_some() || select.where_clause.is_some() {
        return None;
    }
    if select.src.len() != 1 || select.src.items[0].select.is_some() {
        return None;
    }
    select.src.items[0].table.as_ref()?;
    if !select
        .elist
        .exprs()
        .all(|e| matches!(e.kind, ExprKind::Column(_)))
    {
        return None;
    }
    Some(select)
}

/// Types the left-hand side is converted to before probing the set
fn in_types(lhs: &Expr, rhs: &InRhs) -> Vec<FieldType> {
    let n = vector_size(lhs);
    (0..n)
        .map(|i| {
            let lhs_ty = expr_type(vector_field_subexpr(lhs, i));
            match rhs {
                InRhs::Select(select) => match select.elist.items.get(i) {
                    Some(item) => type_result(expr_type(&item.expr), lhs_ty),
                    None => lhs_ty,
                },
                InRhs::List(_) => lhs_ty,
            }
        })
        .collect()
}

pub(crate) fn check_in_columns(lhs: &Expr, rhs: &InRhs) -> Result<()> {
    let n = vector_size(lhs);
    match rhs {
        InRhs::Select(select) if select.elist.len() != n => {
            Err(column_count_mismatch(n, select.elist.len()))
        }
        InRhs::List(_) if n != 1 => Err(column_count_mismatch(n, 1)),
        _ => Ok(()),
    }
}

impl Parse {
    /// Emit code that sets `reg` to 1 if the first key of `cursor` has a
    /// NULL in column `column`, 0 otherwise.
    fn set_has_null_flag(&mut self, cursor: Cursor, column: usize, reg: Reg) {
        self.vdbe.add_op2(Opcode::Integer, 0, reg);
        let addr = self.vdbe.add_op1(Opcode::Rewind, cursor);
        self.vdbe.add_op(Opcode::Column, cursor, column as i32, reg);
        self.vdbe.change_p5(opflags::TYPEOFARG);
        self.vdbe.comment(format!("first_entry_in({})", cursor));
        self.vdbe.jump_here(addr);
    }

    /// Choose how the IN operator `in_expr` is implemented and emit the
    /// code that prepares it. With `want_null` the returned plan tracks
    /// whether the right-hand side contains a NULL.
    pub fn find_in_index(
        &mut self,
        in_expr: &Expr,
        flags: InIndexFlags,
        mut want_null: bool,
    ) -> Result<InIndex> {
        let (lhs, rhs) = in_parts(in_expr)?;
        let cursor = self.alloc_cursor();
        let must_be_unique = flags.contains(InIndexFlags::LOOP);
        let n = vector_size(lhs);

        if let InRhs::Select(select) = rhs {
            if want_null && !select.elist.exprs().any(expr_can_be_null) {
                want_null = false;
            }
        }

        if let Some(select) = candidate_for_in_opt(in_expr) {
            if let Some(plan) =
                self.find_existing_index(lhs, select, cursor, must_be_unique, want_null)?
            {
                return Ok(plan);
            }
        }

        if flags.contains(InIndexFlags::NOOP_OK) {
            if let InRhs::List(list) = rhs {
                if !list.iter().all(expr_is_constant) || list.len() <= 2 {
                    debug!(items = list.len(), "IN strategy: comparison chain");
                    return Ok(InIndex {
                        kind: InIndexKind::Noop,
                        cursor,
                        rhs_has_null: 0,
                        map: (0..n).collect(),
                    });
                }
            }
        }

        let rhs_has_null = if !must_be_unique && want_null {
            self.alloc_reg()
        } else {
            0
        };
        self.code_rhs_of_in(in_expr, cursor, rhs_has_null)?;
        debug!(cursor, "IN strategy: ephemeral index");
        Ok(InIndex {
            kind: InIndexKind::Ephemeral,
            cursor,
            rhs_has_null,
            map: (0..n).collect(),
        })
    }

    fn find_existing_index(
        &mut self,
        lhs: &Expr,
        select: &Select,
        cursor: Cursor,
        must_be_unique: bool,
        want_null: bool,
    ) -> Result<Option<InIndex>> {
        let Some(table) = select.src.items[0].table.clone() else {
            return Ok(None);
        };
        let n = select.elist.len();
        let mut rhs_columns = Vec::with_capacity(n);
        for (i, e) in select.elist.exprs().enumerate() {
            let ExprKind::Column(col) = &e.kind else {
                return Ok(None);
            };
            let column_type = table
                .column(col.column)
                .map(|c| c.field_type)
                .unwrap_or(FieldType::Scalar);
            if column_type != expr_type(vector_field_subexpr(lhs, i)) {
                return Ok(None);
            }
            rhs_columns.push((col.column, e));
        }

        for index in &table.indexes {
            let parts = index.columns.len();
            if parts < n || parts >= BMS - 1 {
                continue;
            }
            if must_be_unique && (parts > n || !index.unique) {
                continue;
            }
            let mut col_used: u64 = 0;
            let mut map = vec![0usize; n];
            let mut matched = true;
            for (i, (rhs_column, rhs_expr)) in rhs_columns.iter().enumerate() {
                let coll = binary_compare_coll(vector_field_subexpr(lhs, i), rhs_expr)?;
                let Some(j) = index.columns[..n]
                    .iter()
                    .position(|p| p.column == *rhs_column && p.coll_id == coll)
                else {
                    matched = false;
                    break;
                };
                if col_used & (1 << j) != 0 {
                    matched = false;
                    break;
                }
                col_used |= 1 << j;
                map[i] = *rhs_column;
            }
            if !matched || col_used != (1u64 << n) - 1 {
                continue;
            }

            let once = self.vdbe.add_op0(Opcode::Once);
            self.vdbe.add_op4(
                Opcode::OpenRead,
                cursor,
                index.index_no as i32,
                0,
                P4::Table(table.name.clone()),
            );
            self.vdbe.comment(index.name.clone());
            let kind = if index.columns[0].sort_order == SortOrder::Desc {
                InIndexKind::IndexDesc
            } else {
                InIndexKind::IndexAsc
            };
            let rhs_has_null = if want_null {
                let reg = self.alloc_reg();
                if n == 1 {
                    self.set_has_null_flag(cursor, index.columns[0].column, reg);
                }
                reg
            } else {
                0
            };
            self.vdbe.jump_here(once);
            debug!(index = %index.name, table = %table.name, "IN strategy: existing index");
            return Ok(Some(InIndex {
                kind,
                cursor,
                rhs_has_null,
                map,
            }));
        }
        Ok(None)
    }

    /// Fill ephemeral index `cursor` with the right-hand side of `in_expr`.
    /// When `rhs_has_null` is non-zero it is set to 1 if the set holds a
    /// NULL.
    pub fn code_rhs_of_in(
        &mut self,
        in_expr: &Expr,
        cursor: Cursor,
        rhs_has_null: Reg,
    ) -> Result<()> {
        let (lhs, rhs) = in_parts(in_expr)?;
        self.cache_push();
        let mut once = if in_expr.has_flag(ExprFlags::VAR_SELECT) {
            None
        } else {
            Some(self.vdbe.add_op0(Opcode::Once))
        };
        let n = vector_size(lhs);
        let types = in_types(lhs, rhs);
        let mut key_info = KeyInfo::new(n);
        for (part, ty) in key_info.parts.iter_mut().zip(&types) {
            part.field_type = *ty;
        }
        let addr_open = self.vdbe.add_op4(
            Opcode::OpenEphemeral,
            cursor,
            n as i32,
            0,
            P4::KeyInfo(Arc::new(key_info.clone())),
        );

        match rhs {
            InRhs::Select(select) => {
                if select.elist.len() != n {
                    return Err(column_count_mismatch(n, select.elist.len()));
                }
                let mut sel = (**select).clone();
                let mut dest = SelectDest::new(SelectDestKind::Set, cursor);
                dest.dest_type = types.clone();
                sel.i_limit = 0;
                sql_select(self, &mut sel, &mut dest)?;
                for (i, item) in select.elist.items.iter().enumerate() {
                    key_info.parts[i].coll_id =
                        binary_compare_coll(vector_field_subexpr(lhs, i), &item.expr)?;
                }
            }
            InRhs::List(list) => {
                key_info.parts[0].coll_id = expr_coll(lhs)?.id;
                let r1 = self.get_temp_reg();
                let r2 = self.get_temp_reg();
                for item in list {
                    if let Some(addr) = once {
                        if !expr_is_constant(item) {
                            self.vdbe.change_to_noop(addr);
                            once = None;
                        }
                    }
                    let r3 = self.expr_code_target(item, r1)?;
                    self.vdbe
                        .add_op4(Opcode::MakeRecord, r3, 1, r2, P4::Types(vec![types[0]]));
                    self.cache_affinity_change(r3, 1);
                    self.vdbe.add_op2(Opcode::IdxInsert, cursor, r2);
                }
                self.release_temp_reg(r1);
                self.release_temp_reg(r2);
            }
        }
        self.vdbe
            .change_p4(addr_open, P4::KeyInfo(Arc::new(key_info)));
        if rhs_has_null != 0 {
            self.set_has_null_flag(cursor, 0, rhs_has_null);
        }
        if let Some(addr) = once {
            self.vdbe.jump_here(addr);
        }
        self.cache_pop();
        Ok(())
    }

    /// Run the subquery of a scalar-subquery or EXISTS node and return the
    /// first register of its result.
    pub fn code_subselect(&mut self, expr: &Expr) -> Result<Reg> {
        let (select, is_exists) = match &expr.kind {
            ExprKind::Subquery(s) => (s, false),
            ExprKind::Exists(s) => (s, true),
            ExprKind::Register { orig, .. } => return self.code_subselect(orig),
            _ => return Err(Error::internal("code_subselect on a non-subquery")),
        };
        self.cache_push();
        let once = if expr.has_flag(ExprFlags::VAR_SELECT) {
            None
        } else {
            Some(self.vdbe.add_op0(Opcode::Once))
        };
        let mut sel = (**select).clone();
        let n = if is_exists { 1 } else { sel.elist.len() as i32 };
        let base = self.alloc_regs(n);
        let mut dest;
        if is_exists {
            dest = SelectDest::new(SelectDestKind::Exists, base);
            self.vdbe.add_op2(Opcode::Bool, 0, base);
            self.vdbe.comment("Init EXISTS result");
            sel.limit = Some(Box::new(Expr::int(1)));
        } else {
            dest = SelectDest::new(SelectDestKind::Mem, base);
            dest.sdst = base;
            dest.n_sdst = n;
            self.vdbe.add_op(Opcode::Null, 0, base, base + n - 1);
            self.vdbe.comment("Init subquery result");
            if sel.limit.is_none() {
                let mut limit = Expr::int(1);
                limit.flags |= ExprFlags::SYSTEM;
                sel.limit = Some(Box::new(limit));
            }
            sel.flags |= SelectFlags::SINGLE_ROW;
        }
        sel.i_limit = 0;
        sel.flags.remove(SelectFlags::MULTI_VALUE);
        sql_select(self, &mut sel, &mut dest)?;
        if let Some(addr) = once {
            self.vdbe.jump_here(addr);
        }
        self.cache_pop();
        Ok(base)
    }

    /// Emit the membership test of `expr` (an IN node; its NOT is ignored).
    /// Falls through when the left-hand side is in the set, jumps to
    /// `dest_if_false` when it is not and to `dest_if_null` when the answer
    /// is NULL.
    pub fn code_in(&mut self, expr: &Expr, dest_if_false: i32, dest_if_null: i32) -> Result<()> {
        let (lhs, rhs) = in_parts(expr)?;
        check_in_columns(lhs, rhs)?;
        if let InRhs::List(list) = rhs {
            if list.is_empty() {
                self.vdbe.add_op2(Opcode::Goto, 0, dest_if_false);
                return Ok(());
            }
        }
        let types = in_types(lhs, rhs);
        let n = vector_size(lhs);
        let want_null = dest_if_false != dest_if_null;
        let plan = self.find_in_index(
            expr,
            InIndexFlags::MEMBERSHIP | InIndexFlags::NOOP_OK,
            want_null,
        )?;

        self.cache_push();
        let (r_lhs, free) = self.expr_code_vector(lhs)?;

        if plan.kind == InIndexKind::Noop {
            let InRhs::List(list) = rhs else {
                return Err(Error::internal("comparison chain over a subquery"));
            };
            let coll = expr_coll(lhs)?.id;
            let label_ok = self.make_label();
            let mut ck_null = 0;
            if want_null {
                ck_null = self.get_temp_reg();
                self.vdbe.add_op2(Opcode::Integer, 0, ck_null);
                let l = self.make_label();
                self.vdbe.add_op2(Opcode::NotNull, r_lhs, l);
                self.vdbe.add_op2(Opcode::Null, 0, ck_null);
                self.resolve_label(l);
            }
            for (i, item) in list.iter().enumerate() {
                let (r2, free2) = self.expr_code_temp(item)?;
                if ck_null != 0 && expr_can_be_null(item) {
                    let l = self.make_label();
                    self.vdbe.add_op2(Opcode::NotNull, r2, l);
                    self.vdbe.add_op2(Opcode::Null, 0, ck_null);
                    self.resolve_label(l);
                }
                if i + 1 < list.len() || want_null {
                    self.vdbe
                        .add_op4(Opcode::Eq, r_lhs, label_ok, r2, P4::Collation(coll));
                    self.vdbe.change_p5(types[0].code());
                } else {
                    self.vdbe
                        .add_op4(Opcode::Ne, r_lhs, dest_if_false, r2, P4::Collation(coll));
                    self.vdbe
                        .change_p5(types[0].code() | cmp_flags::JUMPIFNULL);
                }
                self.release_temp_reg(free2);
            }
            if ck_null != 0 {
                self.vdbe.add_op2(Opcode::IsNull, ck_null, dest_if_null);
                self.vdbe.add_op2(Opcode::Goto, 0, dest_if_false);
                self.release_temp_reg(ck_null);
            }
            self.resolve_label(label_ok);
        } else {
            let dest_step6 = if want_null { self.make_label() } else { 0 };
            let dest_step2 = if want_null { dest_step6 } else { dest_if_false };
            for i in 0..n {
                if expr_can_be_null(vector_field_subexpr(lhs, i)) {
                    self.vdbe
                        .add_op2(Opcode::IsNull, r_lhs + i as i32, dest_step2);
                }
            }
            self.vdbe
                .add_op4(Opcode::ApplyType, r_lhs, n as i32, 0, P4::Types(types));
            if !want_null {
                self.vdbe.add_op4(
                    Opcode::NotFound,
                    plan.cursor,
                    dest_if_false,
                    r_lhs,
                    P4::Int64(n as i64),
                );
            } else {
                let truth = self.vdbe.add_op4(
                    Opcode::Found,
                    plan.cursor,
                    0,
                    r_lhs,
                    P4::Int64(n as i64),
                );
                if plan.rhs_has_null != 0 && n == 1 {
                    self.vdbe
                        .add_op2(Opcode::NotNull, plan.rhs_has_null, dest_if_false);
                }
                self.resolve_label(dest_step6);
                let top = self.vdbe.add_op2(Opcode::Rewind, plan.cursor, dest_if_false);
                let dest_not_null = if n > 1 {
                    self.make_label()
                } else {
                    dest_if_false
                };
                for i in 0..n {
                    let r3 = self.get_temp_reg();
                    let part = vector_field_subexpr(lhs, i);
                    let coll = expr_coll(part)?.id;
                    self.vdbe
                        .add_op(Opcode::Column, plan.cursor, plan.map[i] as i32, r3);
                    self.vdbe.add_op4(
                        Opcode::Ne,
                        r_lhs + i as i32,
                        dest_not_null,
                        r3,
                        P4::Collation(coll),
                    );
                    self.release_temp_reg(r3);
                }
                self.vdbe.add_op2(Opcode::Goto, 0, dest_if_null);
                if n > 1 {
                    self.resolve_label(dest_not_null);
                    self.vdbe.add_op2(Opcode::Next, plan.cursor, top + 1);
                    self.vdbe.add_op2(Opcode::Goto, 0, dest_if_false);
                }
                self.vdbe.jump_here(truth);
            }
        }
        self.release_temp_reg(free);
        self.cache_pop();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompileConfig;
    use crate::parser::ast::{ExprList, SrcItem, SrcList};
    use crate::schema::{Column, Index, IndexColumn, Table};

    fn unfactored() -> Parse {
        Parse::new(CompileConfig {
            enable_factor_constants: false,
            ..CompileConfig::default()
        })
    }

    fn indexed_table() -> Arc<Table> {
        let mut t = Table::new(
            "t",
            vec![
                Column::new("a", FieldType::Integer),
                Column::new("b", FieldType::String),
            ],
        );
        t.add_index(Index::new("pk", vec![IndexColumn::new(0)], true));
        Arc::new(t)
    }

    fn select_a(t: &Arc<Table>) -> Select {
        Select::new(
            ExprList::from_exprs(vec![Expr::column(t, 5, 0)]),
            SrcList::single(SrcItem::table(Arc::clone(t), 5)),
            None,
        )
    }

    fn count(parse: &Parse, opcode: Opcode) -> usize {
        parse
            .vdbe
            .ops()
            .iter()
            .filter(|op| op.opcode == opcode)
            .count()
    }

    #[test]
    fn test_candidate_for_in_opt() {
        let t = indexed_table();
        let e = Expr::in_select(Expr::int(1), select_a(&t), false);
        assert!(candidate_for_in_opt(&e).is_some());

        let mut filtered = select_a(&t);
        filtered.where_clause = Some(Box::new(Expr::boolean(true)));
        let e = Expr::in_select(Expr::int(1), filtered, false);
        assert!(candidate_for_in_opt(&e).is_none());

        let e = Expr::in_list(Expr::int(1), vec![Expr::int(1)], false);
        assert!(candidate_for_in_opt(&e).is_none());
    }

    #[test]
    fn test_existing_index_is_reused() {
        let t = indexed_table();
        let mut parse = unfactored();
        let e = Expr::in_select(Expr::int(1), select_a(&t), false);
        let plan = parse
            .find_in_index(&e, InIndexFlags::MEMBERSHIP, false)
            .unwrap();
        assert_eq!(plan.kind, InIndexKind::IndexAsc);
        assert_eq!(plan.map, vec![0]);
        assert_eq!(count(&parse, Opcode::OpenRead), 1);
        assert_eq!(count(&parse, Opcode::Once), 1);
        assert_eq!(count(&parse, Opcode::OpenEphemeral), 0);
    }

    #[test]
    fn test_index_skipped_on_type_mismatch() {
        let t = indexed_table();
        let mut parse = unfactored();
        let e = Expr::in_select(Expr::string("x"), select_a(&t), false);
        assert!(parse
            .find_existing_index(
                match &e.kind {
                    ExprKind::In { expr, .. } => expr,
                    _ => unreachable!(),
                },
                candidate_for_in_opt(&e).unwrap(),
                0,
                false,
                false,
            )
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_short_list_uses_comparisons() {
        let mut parse = unfactored();
        let label = parse.make_label();
        let e = Expr::in_list(Expr::int(5), vec![Expr::int(1), Expr::int(2)], false);
        parse.code_in(&e, label, label).unwrap();
        let ops = parse.vdbe.ops();
        let eq = ops.iter().filter(|op| op.opcode == Opcode::Eq).count();
        let ne: Vec<_> = ops.iter().filter(|op| op.opcode == Opcode::Ne).collect();
        assert_eq!(eq, 1);
        assert_eq!(ne.len(), 1);
        assert_ne!(ne[0].p5 & cmp_flags::JUMPIFNULL, 0);
        assert_eq!(count(&parse, Opcode::OpenEphemeral), 0);
    }

    #[test]
    fn test_long_constant_list_builds_ephemeral_set() {
        let mut parse = unfactored();
        let label = parse.make_label();
        let e = Expr::in_list(
            Expr::int(5),
            vec![Expr::int(1), Expr::int(2), Expr::int(3)],
            false,
        );
        parse.code_in(&e, label, label).unwrap();
        assert_eq!(count(&parse, Opcode::OpenEphemeral), 1);
        assert_eq!(count(&parse, Opcode::MakeRecord), 3);
        assert_eq!(count(&parse, Opcode::IdxInsert), 3);
        assert_eq!(count(&parse, Opcode::Once), 1);
        assert_eq!(count(&parse, Opcode::NotFound), 1);
        let open = parse
            .vdbe
            .ops()
            .iter()
            .find(|op| op.opcode == Opcode::OpenEphemeral)
            .unwrap();
        match &open.p4 {
            P4::KeyInfo(k) => assert_eq!(k.parts[0].field_type, FieldType::Integer),
            other => panic!("unexpected p4 {:?}", other),
        }
    }

    #[test]
    fn test_non_constant_list_drops_once_guard() {
        let t = indexed_table();
        let mut parse = unfactored();
        let e = Expr::in_list(
            Expr::int(5),
            vec![Expr::int(1), Expr::column(&t, 0, 0), Expr::int(3)],
            false,
        );
        let cursor = parse.alloc_cursor();
        parse.code_rhs_of_in(&e, cursor, 0).unwrap();
        assert_eq!(count(&parse, Opcode::Once), 0);
        assert_eq!(count(&parse, Opcode::Noop), 1);
    }

    #[test]
    fn test_null_aware_lookup() {
        let t = indexed_table();
        let mut parse = unfactored();
        let if_false = parse.make_label();
        let if_null = parse.make_label();
        let e = Expr::in_list(
            Expr::column(&t, 0, 0),
            vec![Expr::int(1), Expr::int(2), Expr::int(3)],
            false,
        );
        parse.code_in(&e, if_false, if_null).unwrap();
        assert_eq!(count(&parse, Opcode::Found), 1);
        assert_eq!(count(&parse, Opcode::Rewind), 2);
        assert_eq!(count(&parse, Opcode::IsNull), 1);
    }

    #[test]
    fn test_empty_list_is_false() {
        let mut parse = unfactored();
        let label = parse.make_label();
        let e = Expr::in_list(Expr::int(5), vec![], false);
        parse.code_in(&e, label, label).unwrap();
        let last = parse.vdbe.last_op().unwrap();
        assert_eq!((last.opcode, last.p2), (Opcode::Goto, label));
    }

    #[test]
    fn test_row_value_against_list_is_mismatch() {
        let mut parse = unfactored();
        let label = parse.make_label();
        let e = Expr::in_list(
            Expr::vector(vec![Expr::int(1), Expr::int(2)]),
            vec![Expr::int(1)],
            false,
        );
        let err = parse.code_in(&e, label, label).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Mismatch);
    }
}
