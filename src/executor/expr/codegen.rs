//! Scalar expression code generation
//!
//! [`Parse::expr_code_target`] emits the instructions that compute one
//! expression and returns the register holding the result. The result may
//! land somewhere other than the requested target (a column already in the
//! cache, a hoisted constant, an accumulator register). The `expr_code*`
//! wrappers add the stronger guarantees.
//!
//! Boolean expressions used for control flow go through
//! [`Parse::expr_if_true`] / [`Parse::expr_if_false`], which jump instead of
//! materializing a value.

use bitflags::bitflags;
use tracing::trace;

use crate::error::{Error, ErrorCode, Result};
use crate::executor::expr::analyze::{
    expr_is_constant, expr_is_constant_not_join, vector_field_subexpr, vector_size,
};
use crate::executor::expr::collate::{
    binary_compare_coll, check_collate_arg, collations_check_compatibility, expr_coll, ExprColl,
};
use crate::executor::expr::types::{binary_compare_type, expr_type};
use crate::executor::parse::Parse;
use crate::functions::FuncFlags;
use crate::parser::ast::{BinaryOp, Expr, ExprKind, ExprList, FunctionCall, UnaryOp};
use crate::types::Reg;
use crate::vdbe::ops::{cmp_flags, opflags, Opcode, P4};

/// Largest bind parameter number accepted
pub const MAX_VARIABLE_NUMBER: i32 = 65000;

bitflags! {
    /// Options of [`Parse::expr_code_expr_list`]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct CodeListFlags: u8 {
        /// Fill with Copy instead of SCopy
        const DUP = 0x01;
        /// Constant items may be hoisted into the init block
        const FACTOR = 0x02;
        /// Items with `order_by_col > 0` are copied from `src_reg`
        const REF = 0x04;
        /// Items with `order_by_col > 0` are skipped entirely
        const OMITREF = 0x08;
    }
}

/// How a BETWEEN is consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BetweenMode {
    Value,
    IfTrue(u16),
    IfFalse(u16),
}

pub(crate) fn compare_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Eq => Opcode::Eq,
        BinaryOp::Ne => Opcode::Ne,
        BinaryOp::Lt => Opcode::Lt,
        BinaryOp::Le => Opcode::Le,
        BinaryOp::Gt => Opcode::Gt,
        _ => Opcode::Ge,
    }
}

fn arith_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::And => Opcode::And,
        BinaryOp::Or => Opcode::Or,
        BinaryOp::Add => Opcode::Add,
        BinaryOp::Subtract => Opcode::Subtract,
        BinaryOp::Multiply => Opcode::Multiply,
        BinaryOp::Divide => Opcode::Divide,
        BinaryOp::Remainder => Opcode::Remainder,
        BinaryOp::Concat => Opcode::Concat,
        BinaryOp::BitAnd => Opcode::BitAnd,
        BinaryOp::BitOr => Opcode::BitOr,
        BinaryOp::ShiftLeft => Opcode::ShiftLeft,
        _ => Opcode::ShiftRight,
    }
}

fn always_true(expr: &Expr) -> bool {
    !expr.is_from_join() && matches!(expr.kind, ExprKind::Bool(true))
}

fn always_false(expr: &Expr) -> bool {
    !expr.is_from_join() && matches!(expr.kind, ExprKind::Bool(false))
}

fn row_value_misused() -> Error {
    Error::with_message(ErrorCode::Error, "row value misused")
}

pub(crate) fn column_count_mismatch(left: usize, right: usize) -> Error {
    Error::with_message(
        ErrorCode::Mismatch,
        format!(
            "Unequal number of entries in row expression: left side has {}, but right side - {}",
            left, right
        ),
    )
}

impl Parse {
    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// Code `expr`, preferably into `target`. Returns the register that
    /// holds the result.
    pub fn expr_code_target(&mut self, expr: &Expr, target: Reg) -> Result<Reg> {
        let mut free1 = 0;
        let mut free2 = 0;
        let result = self.expr_code_target_inner(expr, target, &mut free1, &mut free2);
        self.release_temp_reg(free1);
        self.release_temp_reg(free2);
        result
    }

    fn expr_code_target_inner(
        &mut self,
        expr: &Expr,
        target: Reg,
        free1: &mut Reg,
        free2: &mut Reg,
    ) -> Result<Reg> {
        match &expr.kind {
            ExprKind::AggColumn { col, info, index } => {
                let agg = self
                    .aggs
                    .get(*info)
                    .ok_or_else(|| Error::internal("aggregate column without context"))?;
                let c = agg
                    .columns
                    .get(*index)
                    .ok_or_else(|| Error::internal("aggregate column out of range"))?;
                if !agg.direct_mode {
                    return Ok(c.i_mem);
                }
                if agg.use_sorting_idx {
                    let (ptab, sorter_col) = (agg.sorting_idx_ptab, c.i_sorter_column);
                    self.vdbe
                        .add_op(Opcode::Column, ptab, sorter_col as i32, target);
                    return Ok(target);
                }
                Ok(self.expr_code_get_column(col.cursor, col.column, target, 0))
            }
            ExprKind::Column(col) => {
                Ok(self.expr_code_get_column(col.cursor, col.column, target, 0))
            }
            ExprKind::Integer(v) => {
                self.vdbe.add_int(*v, target);
                Ok(target)
            }
            ExprKind::Float(v) => {
                self.vdbe
                    .add_op4(Opcode::Real, 0, target, 0, P4::Real(*v));
                Ok(target)
            }
            ExprKind::String(s) => {
                self.vdbe
                    .add_op4(Opcode::String8, 0, target, 0, P4::Text(s.clone()));
                Ok(target)
            }
            ExprKind::Blob(b) => {
                self.vdbe
                    .add_op4(Opcode::Blob, b.len() as i32, target, 0, P4::Blob(b.clone()));
                Ok(target)
            }
            ExprKind::Bool(b) => {
                self.vdbe.add_op2(Opcode::Bool, *b as i32, target);
                Ok(target)
            }
            ExprKind::Null => {
                self.vdbe.add_op2(Opcode::Null, 0, target);
                Ok(target)
            }
            ExprKind::Variable { index, name } => {
                if *index < 1 || *index > MAX_VARIABLE_NUMBER {
                    return Err(Error::with_message(
                        ErrorCode::Range,
                        format!("bind parameter index {} is out of range", index),
                    ));
                }
                self.vdbe.add_op2(Opcode::Variable, *index, target);
                if let Some(n) = name {
                    self.vdbe.comment(n.clone());
                }
                Ok(target)
            }
            ExprKind::Register { reg, .. } => Ok(*reg),
            ExprKind::Cast { expr: child, ty } => {
                let in_reg = self.expr_code_target(child, target)?;
                if in_reg != target {
                    self.vdbe.add_op2(Opcode::SCopy, in_reg, target);
                }
                self.vdbe.add_op2(Opcode::Cast, target, ty.code() as i32);
                self.cache_affinity_change(target, 1);
                Ok(target)
            }
            ExprKind::Binary { op, left, right } if op.is_comparison() => {
                if vector_size(left) > 1 {
                    self.code_vector_compare(expr, target)?;
                } else {
                    let (r1, f1) = self.expr_code_temp(left)?;
                    *free1 = f1;
                    let (r2, f2) = self.expr_code_temp(right)?;
                    *free2 = f2;
                    self.code_compare(left, right, *op, r1, r2, target, cmp_flags::STOREP2)?;
                }
                Ok(target)
            }
            ExprKind::Binary { op, left, right } => {
                let (r1, f1) = self.expr_code_temp(left)?;
                *free1 = f1;
                let (r2, f2) = self.expr_code_temp(right)?;
                *free2 = f2;
                self.vdbe.add_op(arith_opcode(*op), r2, r1, target);
                Ok(target)
            }
            ExprKind::Unary {
                op: UnaryOp::Negate,
                expr: child,
            } => match &child.kind {
                ExprKind::Integer(v) => {
                    let neg = v.checked_neg().ok_or_else(|| {
                        Error::with_message(
                            ErrorCode::Error,
                            format!("Integer literal -{} exceeds the supported range", v),
                        )
                    })?;
                    self.vdbe.add_int(neg, target);
                    Ok(target)
                }
                ExprKind::Float(v) => {
                    self.vdbe
                        .add_op4(Opcode::Real, 0, target, 0, P4::Real(-*v));
                    Ok(target)
                }
                _ => {
                    let (r1, f1) = self.expr_code_temp(&Expr::int(0))?;
                    *free1 = f1;
                    let (r2, f2) = self.expr_code_temp(child)?;
                    *free2 = f2;
                    self.vdbe.add_op(Opcode::Subtract, r2, r1, target);
                    Ok(target)
                }
            },
            ExprKind::Unary {
                op: op @ (UnaryOp::Not | UnaryOp::BitNot),
                expr: child,
            } => {
                let (r1, f1) = self.expr_code_temp(child)?;
                *free1 = f1;
                let opcode = if *op == UnaryOp::Not {
                    Opcode::Not
                } else {
                    Opcode::BitNot
                };
                self.vdbe.add_op2(opcode, r1, target);
                Ok(target)
            }
            ExprKind::Unary {
                op: op @ (UnaryOp::IsNull | UnaryOp::NotNull),
                expr: child,
            } => {
                self.vdbe.add_op2(Opcode::Bool, 1, target);
                let (r1, f1) = self.expr_code_temp(child)?;
                *free1 = f1;
                let opcode = if *op == UnaryOp::IsNull {
                    Opcode::IsNull
                } else {
                    Opcode::NotNull
                };
                let addr = self.vdbe.add_op1(opcode, r1);
                self.vdbe.add_op2(Opcode::Bool, 0, target);
                self.vdbe.jump_here(addr);
                Ok(target)
            }
            ExprKind::Unary {
                op: UnaryOp::Plus,
                expr: child,
            } => self.expr_code_target(child, target),
            ExprKind::AggFunction { call, info, index } => {
                match self.aggs.get(*info).and_then(|a| a.funcs.get(*index)) {
                    Some(f) => Ok(f.i_mem),
                    None => Err(Error::with_message(
                        ErrorCode::Error,
                        format!("misuse of aggregate: {}()", call.name),
                    )),
                }
            }
            ExprKind::Function(call) => self.code_function(call, target),
            ExprKind::Subquery(select) => {
                if select.elist.len() != 1 {
                    return Err(column_count_mismatch(select.elist.len(), 1));
                }
                self.code_subselect(expr)
            }
            ExprKind::Exists(_) => self.code_subselect(expr),
            ExprKind::In { negated, .. } => {
                let dest_if_false = self.make_label();
                let dest_if_null = self.make_label();
                self.vdbe.add_op2(Opcode::Null, 0, target);
                self.code_in(expr, dest_if_false, dest_if_null)?;
                self.vdbe.add_op2(Opcode::Bool, 1, target);
                self.vdbe.add_op2(Opcode::Goto, 0, dest_if_null);
                self.resolve_label(dest_if_false);
                self.vdbe.add_op2(Opcode::Bool, 0, target);
                self.resolve_label(dest_if_null);
                if *negated {
                    self.vdbe.add_op2(Opcode::Not, target, target);
                }
                Ok(target)
            }
            ExprKind::Between { negated, .. } => {
                self.code_between(expr, target, BetweenMode::Value)?;
                if *negated {
                    self.vdbe.add_op2(Opcode::Not, target, target);
                }
                Ok(target)
            }
            ExprKind::Collate { expr: child, .. } => {
                check_collate_arg(expr)?;
                self.expr_code_target(child, target)
            }
            ExprKind::Vector(_) => Err(row_value_misused()),
            ExprKind::Case {
                operand,
                arms,
                else_expr,
            } => {
                let end_label = self.make_label();
                let operand = match operand {
                    Some(x) => {
                        let (reg, _) = self.expr_code_vector(x)?;
                        Some(Expr::register(reg, (**x).clone()))
                    }
                    None => None,
                };
                for arm in arms {
                    self.cache_push();
                    let next_case = self.make_label();
                    match &operand {
                        Some(x) => {
                            let test = Expr::eq(x.clone(), arm.when.clone());
                            self.expr_if_false(&test, next_case, cmp_flags::JUMPIFNULL)?;
                        }
                        None => {
                            self.expr_if_false(&arm.when, next_case, cmp_flags::JUMPIFNULL)?
                        }
                    }
                    self.expr_code(&arm.then, target)?;
                    self.vdbe.add_op2(Opcode::Goto, 0, end_label);
                    self.cache_pop();
                    self.resolve_label(next_case);
                }
                match else_expr {
                    Some(e) => {
                        self.cache_push();
                        self.expr_code(e, target)?;
                        self.cache_pop();
                    }
                    None => {
                        self.vdbe.add_op2(Opcode::Null, 0, target);
                    }
                }
                self.resolve_label(end_label);
                self.vdbe.add_op4(
                    Opcode::ApplyType,
                    target,
                    1,
                    0,
                    P4::Types(vec![expr_type(expr)]),
                );
                Ok(target)
            }
            ExprKind::Raise { message } => {
                if !self.in_trigger {
                    return Err(Error::with_message(
                        ErrorCode::Error,
                        "RAISE() may only be used within a trigger-program",
                    ));
                }
                self.vdbe
                    .add_op4(Opcode::SetDiag, 0, 0, 0, P4::Text(message.clone()));
                self.vdbe.add_op2(Opcode::Halt, 1, 0);
                Ok(target)
            }
        }
    }

    fn code_function(&mut self, call: &FunctionCall, target: Reg) -> Result<Reg> {
        let def = call.def.clone().ok_or_else(|| {
            Error::with_message(ErrorCode::Error, format!("no such function: {}", call.name))
        })?;
        let args = &call.args;
        let n_arg = args.len() as i32;

        if def.flags.contains(FuncFlags::COALESCE) {
            if args.len() < 2 {
                return Err(Error::with_message(
                    ErrorCode::Error,
                    format!(
                        "Wrong number of arguments is passed to {}(): expected at least two, got {}",
                        def.name, n_arg
                    ),
                ));
            }
            let end = self.make_label();
            self.expr_code(&args[0], target)?;
            for arg in &args[1..] {
                self.vdbe.add_op2(Opcode::NotNull, target, end);
                self.cache_remove(target, 1);
                self.cache_push();
                self.expr_code(arg, target)?;
                self.cache_pop();
            }
            self.resolve_label(end);
            return Ok(target);
        }

        if def.flags.contains(FuncFlags::UNLIKELY) {
            let first = args.first().ok_or_else(|| {
                Error::with_message(
                    ErrorCode::Error,
                    format!(
                        "Wrong number of arguments is passed to {}(): expected at least one, got 0",
                        def.name
                    ),
                )
            })?;
            return self.expr_code_target(first, target);
        }

        let has_const_arg = args.iter().take(32).any(expr_is_constant);
        let coll = if def.flags.contains(FuncFlags::NEEDCOLL) && !args.is_empty() {
            let mut curr = expr_coll(&args[0])?;
            for arg in &args[1..] {
                let next = expr_coll(arg)?;
                let id = collations_check_compatibility(curr, next)?;
                curr = ExprColl {
                    id,
                    is_explicit: if id == next.id {
                        next.is_explicit
                    } else {
                        curr.is_explicit
                    },
                };
            }
            Some(curr.id)
        } else {
            None
        };

        let r1 = if args.is_empty() {
            0
        } else if has_const_arg {
            self.alloc_regs(n_arg)
        } else {
            self.get_temp_range(n_arg)
        };
        if !args.is_empty() {
            let partial = if def.flags.contains(FuncFlags::LENGTH) {
                opflags::LENGTHARG
            } else if def.flags.contains(FuncFlags::TYPEOF) {
                opflags::TYPEOFARG
            } else {
                0
            };
            self.cache_push();
            match &args[0].kind {
                ExprKind::Column(col) if partial != 0 && args.len() == 1 => {
                    let r = self.expr_code_get_column(col.cursor, col.column, r1, partial);
                    if r != r1 {
                        self.vdbe.add_op2(Opcode::Copy, r, r1);
                    }
                }
                _ => {
                    let items: Vec<(&Expr, u16)> = args.iter().map(|a| (a, 0)).collect();
                    self.code_expr_items(&items, r1, 0, CodeListFlags::DUP | CodeListFlags::FACTOR)?;
                }
            }
            self.cache_pop();
            if let Some(ty) = def.param_type {
                self.vdbe.add_op4(
                    Opcode::ApplyType,
                    r1,
                    n_arg,
                    0,
                    P4::Types(vec![ty; args.len()]),
                );
            }
        }
        if let Some(id) = coll {
            self.vdbe
                .add_op4(Opcode::CollSeq, 0, 0, 0, P4::Collation(id));
        }
        self.vdbe.add_op4(
            Opcode::Function,
            n_arg,
            r1,
            target,
            P4::FuncDef(def.name.clone(), args.len()),
        );
        if !args.is_empty() && !has_const_arg {
            self.release_temp_range(r1, n_arg);
        }
        Ok(target)
    }

    /// Code `expr` into some register, hoisting it into the init block when
    /// it is constant. Returns the register and the temporary register the
    /// caller must release (0 if none).
    pub fn expr_code_temp(&mut self, expr: &Expr) -> Result<(Reg, Reg)> {
        if self.ok_const_factor
            && !matches!(expr.kind, ExprKind::Register { .. })
            && expr_is_constant_not_join(expr)
        {
            if let Some(reg) = self.find_reusable_const(expr) {
                return Ok((reg, 0));
            }
            let reg = self.alloc_reg();
            self.expr_code_at_init(expr, reg, true);
            return Ok((reg, 0));
        }
        let r1 = self.get_temp_reg();
        let r2 = self.expr_code_target(expr, r1)?;
        if r2 == r1 {
            Ok((r1, r1))
        } else {
            self.release_temp_reg(r1);
            Ok((r2, 0))
        }
    }

    /// Code `expr` so that the result is in exactly `target`
    pub fn expr_code(&mut self, expr: &Expr, target: Reg) -> Result<()> {
        if let ExprKind::Register { reg, .. } = &expr.kind {
            self.vdbe.add_op2(Opcode::Copy, *reg, target);
            return Ok(());
        }
        let in_reg = self.expr_code_target(expr, target)?;
        if in_reg != target {
            self.vdbe.add_op2(Opcode::SCopy, in_reg, target);
        }
        Ok(())
    }

    /// Like [`Parse::expr_code`], but `target` receives a deep copy
    pub fn expr_code_copy(&mut self, expr: &Expr, target: Reg) -> Result<()> {
        let in_reg = self.expr_code_target(expr, target)?;
        if in_reg != target {
            self.vdbe.add_op2(Opcode::Copy, in_reg, target);
        }
        Ok(())
    }

    /// Code `expr` into `target`; a constant goes to the init block
    pub fn expr_code_factorable(&mut self, expr: &Expr, target: Reg) -> Result<()> {
        if self.ok_const_factor && expr_is_constant(expr) {
            self.expr_code_at_init(expr, target, false);
            Ok(())
        } else {
            self.expr_code(expr, target)
        }
    }

    /// Code `expr` into `target`, keep a copy in a fresh register and turn
    /// `expr` into a reference to that copy.
    pub fn expr_code_and_cache(&mut self, expr: &mut Expr, target: Reg) -> Result<()> {
        self.expr_code(expr, target)?;
        let mem = self.alloc_reg();
        self.vdbe.add_op2(Opcode::Copy, target, mem);
        let orig = std::mem::replace(expr, Expr::null());
        *expr = Expr::register(mem, orig);
        Ok(())
    }

    /// Code a scalar or row value. A row value gets one register per
    /// component. Returns the first register and the temporary to release.
    pub fn expr_code_vector(&mut self, expr: &Expr) -> Result<(Reg, Reg)> {
        let n = vector_size(expr);
        if n == 1 {
            return self.expr_code_temp(expr);
        }
        match &expr.kind {
            ExprKind::Subquery(_) => Ok((self.code_subselect(expr)?, 0)),
            ExprKind::Register { reg, .. } => Ok((*reg, 0)),
            ExprKind::Vector(items) => {
                let base = self.alloc_regs(n as i32);
                for (i, item) in items.iter().enumerate() {
                    self.expr_code_factorable(item, base + i as i32)?;
                }
                Ok((base, 0))
            }
            _ => Err(row_value_misused()),
        }
    }

    /// Code every item of `list` into `target..`. Returns the number of
    /// registers filled.
    pub fn expr_code_expr_list(
        &mut self,
        list: &ExprList,
        target: Reg,
        src_reg: Reg,
        flags: CodeListFlags,
    ) -> Result<usize> {
        let items: Vec<(&Expr, u16)> = list
            .items
            .iter()
            .map(|item| (&item.expr, item.order_by_col))
            .collect();
        self.code_expr_items(&items, target, src_reg, flags)
    }

    fn code_expr_items(
        &mut self,
        items: &[(&Expr, u16)],
        target: Reg,
        src_reg: Reg,
        mut flags: CodeListFlags,
    ) -> Result<usize> {
        let copy_op = if flags.contains(CodeListFlags::DUP) {
            Opcode::Copy
        } else {
            Opcode::SCopy
        };
        if !self.ok_const_factor {
            flags.remove(CodeListFlags::FACTOR);
        }
        let mut n = 0;
        for &(expr, order_by_col) in items {
            let dest = target + n as i32;
            if flags.contains(CodeListFlags::REF) && order_by_col > 0 {
                if flags.contains(CodeListFlags::OMITREF) {
                    continue;
                }
                self.vdbe
                    .add_op2(copy_op, src_reg + order_by_col as i32 - 1, dest);
            } else if flags.contains(CodeListFlags::FACTOR) && expr_is_constant(expr) {
                self.expr_code_at_init(expr, dest, false);
            } else {
                let in_reg = self.expr_code_target(expr, dest)?;
                if in_reg != dest {
                    let addr = self.vdbe.current_addr() - 1;
                    let merged = match self.vdbe.op_at_mut(addr) {
                        Some(last)
                            if copy_op == Opcode::Copy
                                && last.opcode == Opcode::Copy
                                && last.p1 + last.p3 + 1 == in_reg
                                && last.p2 + last.p3 + 1 == dest =>
                        {
                            last.p3 += 1;
                            true
                        }
                        _ => false,
                    };
                    if !merged {
                        self.vdbe.add_op2(copy_op, in_reg, dest);
                    }
                }
            }
            n += 1;
        }
        Ok(n)
    }

    // ------------------------------------------------------------------
    // Comparisons
    // ------------------------------------------------------------------

    /// Emit comparison `op` of `left` (in `in1`) with `right` (in `in2`).
    /// With STOREP2 in `flags` the result goes to register `dest`, otherwise
    /// `dest` is the jump target.
    #[allow(clippy::too_many_arguments)]
    pub fn code_compare(
        &mut self,
        left: &Expr,
        right: &Expr,
        op: BinaryOp,
        in1: Reg,
        in2: Reg,
        dest: i32,
        flags: u16,
    ) -> Result<i32> {
        let coll = binary_compare_coll(left, right)?;
        let p5 = binary_compare_type(left, right).code() | flags;
        let addr = self
            .vdbe
            .add_op4(compare_opcode(op), in2, dest, in1, P4::Collation(coll));
        self.vdbe.change_p5(p5);
        Ok(addr)
    }

    /// Register of component `i` of a row value and the component itself
    fn vector_register<'a>(
        &mut self,
        vector: &'a Expr,
        i: usize,
        reg_select: Reg,
        free: &mut Reg,
    ) -> Result<(Reg, &'a Expr)> {
        match &vector.kind {
            ExprKind::Register { reg, .. } => Ok((reg + i as i32, vector_field_subexpr(vector, i))),
            ExprKind::Subquery(select) => Ok((reg_select + i as i32, &select.elist.items[i].expr)),
            ExprKind::Vector(items) => {
                let (reg, f) = self.expr_code_temp(&items[i])?;
                *free = f;
                Ok((reg, &items[i]))
            }
            _ => Err(row_value_misused()),
        }
    }

    /// Compare two row values and store 1, 0 or NULL into `dest`.
    ///
    /// Equality stops at the first unequal pair. Ordering comparisons
    /// decide on the first unequal pair using the strict operator and fall
    /// back to the real operator only for the last pair.
    pub fn code_vector_compare(&mut self, expr: &Expr, dest: Reg) -> Result<()> {
        let Some((op, left, right)) = expr.binary_parts() else {
            return Err(Error::internal("vector compare on a non-comparison"));
        };
        let n = vector_size(left);
        if n != vector_size(right) {
            return Err(column_count_mismatch(n, vector_size(right)));
        }
        let done = self.make_label();
        let mut opx = match op {
            BinaryOp::Le => BinaryOp::Lt,
            BinaryOp::Ge => BinaryOp::Gt,
            other => other,
        };
        let mut p5 = cmp_flags::STOREP2;
        let reg_left = match &left.kind {
            ExprKind::Subquery(_) => self.code_subselect(left)?,
            _ => 0,
        };
        let reg_right = match &right.kind {
            ExprKind::Subquery(_) => self.code_subselect(right)?,
            _ => 0,
        };
        trace!(n, op = op.symbol(), "row value comparison");
        for i in 0..n {
            if i > 0 {
                self.cache_push();
            }
            let mut free1 = 0;
            let mut free2 = 0;
            let (r1, l) = self.vector_register(left, i, reg_left, &mut free1)?;
            let (r2, r) = self.vector_register(right, i, reg_right, &mut free2)?;
            self.code_compare(l, r, opx, r1, r2, dest, p5)?;
            self.release_temp_reg(free1);
            self.release_temp_reg(free2);
            if i > 0 {
                self.cache_pop();
            }
            if i == n - 1 {
                break;
            }
            match opx {
                BinaryOp::Eq => {
                    self.vdbe.add_op2(Opcode::IfNot, dest, done);
                    p5 |= cmp_flags::KEEPNULL;
                }
                BinaryOp::Ne => {
                    self.vdbe.add_op2(Opcode::If, dest, done);
                    p5 |= cmp_flags::KEEPNULL;
                }
                _ => {
                    self.vdbe.add_op2(Opcode::ElseNotEq, 0, done);
                    if i == n - 2 {
                        opx = op;
                    }
                }
            }
        }
        self.resolve_label(done);
        Ok(())
    }

    /// `x BETWEEN lo AND hi` coded as `x>=lo AND x<=hi` with `x` evaluated
    /// once.
    fn code_between(&mut self, expr: &Expr, dest: i32, mode: BetweenMode) -> Result<()> {
        let ExprKind::Between {
            expr: x, low, high, ..
        } = &expr.kind
        else {
            return Err(Error::internal("code_between on a non-BETWEEN"));
        };
        let (reg, free) = self.expr_code_vector(x)?;
        let x_reg = Expr::register(reg, (**x).clone());
        let and = Expr::and(
            Expr::binary(BinaryOp::Ge, x_reg.clone(), (**low).clone()),
            Expr::binary(BinaryOp::Le, x_reg, (**high).clone()),
        );
        match mode {
            BetweenMode::Value => {
                self.expr_code_target(&and, dest)?;
            }
            BetweenMode::IfTrue(jump_if_null) => self.expr_if_true(&and, dest, jump_if_null)?,
            BetweenMode::IfFalse(jump_if_null) => self.expr_if_false(&and, dest, jump_if_null)?,
        }
        self.release_temp_reg(free);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Conditional jumps
    // ------------------------------------------------------------------

    /// Jump to `dest` if `expr` is true. A NULL result jumps only when
    /// `jump_if_null` is JUMPIFNULL.
    pub fn expr_if_true(&mut self, expr: &Expr, dest: i32, jump_if_null: u16) -> Result<()> {
        let mut free1 = 0;
        let mut free2 = 0;
        match &expr.kind {
            ExprKind::Binary {
                op: BinaryOp::And,
                left,
                right,
            } => {
                let d2 = self.make_label();
                self.expr_if_false(left, d2, jump_if_null ^ cmp_flags::JUMPIFNULL)?;
                self.cache_push();
                self.expr_if_true(right, dest, jump_if_null)?;
                self.resolve_label(d2);
                self.cache_pop();
            }
            ExprKind::Binary {
                op: BinaryOp::Or,
                left,
                right,
            } => {
                self.expr_if_true(left, dest, jump_if_null)?;
                self.cache_push();
                self.expr_if_true(right, dest, jump_if_null)?;
                self.cache_pop();
            }
            ExprKind::Unary {
                op: UnaryOp::Not,
                expr: child,
            } => self.expr_if_false(child, dest, jump_if_null)?,
            ExprKind::Binary { op, left, right }
                if op.is_comparison() && vector_size(left) == 1 =>
            {
                let (r1, f1) = self.expr_code_temp(left)?;
                free1 = f1;
                let (r2, f2) = self.expr_code_temp(right)?;
                free2 = f2;
                self.code_compare(left, right, *op, r1, r2, dest, jump_if_null)?;
            }
            ExprKind::Unary {
                op: op @ (UnaryOp::IsNull | UnaryOp::NotNull),
                expr: child,
            } => {
                let (r1, f1) = self.expr_code_temp(child)?;
                free1 = f1;
                let opcode = if *op == UnaryOp::IsNull {
                    Opcode::IsNull
                } else {
                    Opcode::NotNull
                };
                self.vdbe.add_op2(opcode, r1, dest);
            }
            ExprKind::Between { negated, .. } => {
                let mode = if *negated {
                    BetweenMode::IfFalse(jump_if_null)
                } else {
                    BetweenMode::IfTrue(jump_if_null)
                };
                self.code_between(expr, dest, mode)?;
            }
            ExprKind::In { negated: false, .. } => {
                let dest_if_false = self.make_label();
                let dest_if_null = if jump_if_null != 0 {
                    dest
                } else {
                    dest_if_false
                };
                self.code_in(expr, dest_if_false, dest_if_null)?;
                self.vdbe.add_op2(Opcode::Goto, 0, dest);
                self.resolve_label(dest_if_false);
            }
            ExprKind::In { negated: true, .. } => {
                self.code_in_if_false(expr, dest, jump_if_null)?;
            }
            _ => {
                if always_true(expr) {
                    self.vdbe.add_op2(Opcode::Goto, 0, dest);
                } else if !always_false(expr) {
                    let (r1, f1) = self.expr_code_temp(expr)?;
                    free1 = f1;
                    self.vdbe
                        .add_op(Opcode::If, r1, dest, (jump_if_null != 0) as i32);
                }
            }
        }
        self.release_temp_reg(free1);
        self.release_temp_reg(free2);
        Ok(())
    }

    /// Jump to `dest` if `expr` is false. A NULL result jumps only when
    /// `jump_if_null` is JUMPIFNULL.
    pub fn expr_if_false(&mut self, expr: &Expr, dest: i32, jump_if_null: u16) -> Result<()> {
        let mut free1 = 0;
        let mut free2 = 0;
        match &expr.kind {
            ExprKind::Binary {
                op: BinaryOp::And,
                left,
                right,
            } => {
                self.expr_if_false(left, dest, jump_if_null)?;
                self.cache_push();
                self.expr_if_false(right, dest, jump_if_null)?;
                self.cache_pop();
            }
            ExprKind::Binary {
                op: BinaryOp::Or,
                left,
                right,
            } => {
                let d2 = self.make_label();
                self.expr_if_true(left, d2, jump_if_null ^ cmp_flags::JUMPIFNULL)?;
                self.cache_push();
                self.expr_if_false(right, dest, jump_if_null)?;
                self.resolve_label(d2);
                self.cache_pop();
            }
            ExprKind::Unary {
                op: UnaryOp::Not,
                expr: child,
            } => self.expr_if_true(child, dest, jump_if_null)?,
            ExprKind::Binary { op, left, right }
                if op.is_comparison() && vector_size(left) == 1 =>
            {
                let (r1, f1) = self.expr_code_temp(left)?;
                free1 = f1;
                let (r2, f2) = self.expr_code_temp(right)?;
                free2 = f2;
                self.code_compare(left, right, op.negated(), r1, r2, dest, jump_if_null)?;
            }
            ExprKind::Unary {
                op: op @ (UnaryOp::IsNull | UnaryOp::NotNull),
                expr: child,
            } => {
                let (r1, f1) = self.expr_code_temp(child)?;
                free1 = f1;
                let opcode = if *op == UnaryOp::IsNull {
                    Opcode::NotNull
                } else {
                    Opcode::IsNull
                };
                self.vdbe.add_op2(opcode, r1, dest);
            }
            ExprKind::Between { negated, .. } => {
                let mode = if *negated {
                    BetweenMode::IfTrue(jump_if_null)
                } else {
                    BetweenMode::IfFalse(jump_if_null)
                };
                self.code_between(expr, dest, mode)?;
            }
            ExprKind::In { negated: false, .. } => {
                self.code_in_if_false(expr, dest, jump_if_null)?;
            }
            ExprKind::In { negated: true, .. } => {
                let dest_if_false = self.make_label();
                let dest_if_null = if jump_if_null != 0 {
                    dest
                } else {
                    dest_if_false
                };
                self.code_in(expr, dest_if_false, dest_if_null)?;
                self.vdbe.add_op2(Opcode::Goto, 0, dest);
                self.resolve_label(dest_if_false);
            }
            _ => {
                if always_false(expr) {
                    self.vdbe.add_op2(Opcode::Goto, 0, dest);
                } else if !always_true(expr) {
                    let (r1, f1) = self.expr_code_temp(expr)?;
                    free1 = f1;
                    self.vdbe
                        .add_op(Opcode::IfNot, r1, dest, (jump_if_null != 0) as i32);
                }
            }
        }
        self.release_temp_reg(free1);
        self.release_temp_reg(free2);
        Ok(())
    }

    /// Jump to `dest` when the positive IN test of `expr` is false
    fn code_in_if_false(&mut self, expr: &Expr, dest: i32, jump_if_null: u16) -> Result<()> {
        if jump_if_null != 0 {
            self.code_in(expr, dest, dest)
        } else {
            let dest_if_null = self.make_label();
            self.code_in(expr, dest, dest_if_null)?;
            self.resolve_label(dest_if_null);
            Ok(())
        }
    }

    /// Code a WHERE-style condition: fall through when true, jump to `dest`
    /// otherwise (NULL counts as false).
    pub fn expr_code_condition(&mut self, expr: &Expr, dest: i32) -> Result<()> {
        self.expr_if_false(expr, dest, cmp_flags::JUMPIFNULL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompileConfig;
    use crate::schema::{Column, Table};
    use crate::types::FieldType;
    use crate::vdbe::ops::VdbeOp;
    use std::sync::Arc;

    fn table() -> Arc<Table> {
        Arc::new(Table::new(
            "t",
            vec![
                Column::new("a", FieldType::Integer),
                Column::new("b", FieldType::String),
            ],
        ))
    }

    fn unfactored() -> Parse {
        Parse::new(CompileConfig {
            enable_factor_constants: false,
            ..CompileConfig::default()
        })
    }

    fn opcodes(parse: &Parse) -> Vec<Opcode> {
        parse.vdbe.ops().iter().map(|op| op.opcode).collect()
    }

    fn find(parse: &Parse, opcode: Opcode) -> Vec<VdbeOp> {
        parse
            .vdbe
            .ops()
            .iter()
            .filter(|op| op.opcode == opcode)
            .cloned()
            .collect()
    }

    #[test]
    fn test_literals() {
        let mut parse = unfactored();
        let r = parse.alloc_reg();
        assert_eq!(parse.expr_code_target(&Expr::int(7), r).unwrap(), r);
        assert_eq!(parse.expr_code_target(&Expr::string("x"), r).unwrap(), r);
        assert_eq!(
            parse
                .expr_code_target(&Expr::unary(UnaryOp::Negate, Expr::int(3)), r)
                .unwrap(),
            r
        );
        let ops = parse.vdbe.ops();
        assert_eq!(ops[1].opcode, Opcode::Integer);
        assert_eq!(ops[1].p1, 7);
        assert_eq!(ops[2].opcode, Opcode::String8);
        assert_eq!(ops[2].p4, P4::Text("x".to_string()));
        assert_eq!(ops[3].p1, -3);
    }

    #[test]
    fn test_comparison_stores_result() {
        let t = table();
        let mut parse = unfactored();
        let target = parse.alloc_reg();
        let e = Expr::binary(BinaryOp::Lt, Expr::column(&t, 0, 0), Expr::int(5));
        parse.expr_code_target(&e, target).unwrap();
        let lt = find(&parse, Opcode::Lt);
        assert_eq!(lt.len(), 1);
        assert_eq!(lt[0].p2, target);
        assert_ne!(lt[0].p5 & cmp_flags::STOREP2, 0);
        assert!(matches!(lt[0].p4, P4::Collation(_)));
        let column = &find(&parse, Opcode::Column)[0];
        // left operand goes in P3
        assert_eq!(lt[0].p3, column.p3);
    }

    #[test]
    fn test_vector_compare_less_equal() {
        let t = table();
        let mut parse = unfactored();
        let target = parse.alloc_reg();
        let e = Expr::binary(
            BinaryOp::Le,
            Expr::vector(vec![Expr::column(&t, 0, 0), Expr::column(&t, 0, 1)]),
            Expr::vector(vec![Expr::int(1), Expr::string("x")]),
        );
        parse.expr_code_target(&e, target).unwrap();
        let compares: Vec<Opcode> = opcodes(&parse)
            .into_iter()
            .filter(|op| matches!(op, Opcode::Lt | Opcode::Le | Opcode::ElseNotEq))
            .collect();
        assert_eq!(compares, vec![Opcode::Lt, Opcode::ElseNotEq, Opcode::Le]);
    }

    #[test]
    fn test_vector_equality_keeps_null() {
        let t = table();
        let mut parse = unfactored();
        let target = parse.alloc_reg();
        let e = Expr::eq(
            Expr::vector(vec![Expr::column(&t, 0, 0), Expr::column(&t, 0, 1)]),
            Expr::vector(vec![Expr::int(1), Expr::string("x")]),
        );
        parse.expr_code_target(&e, target).unwrap();
        let eqs = find(&parse, Opcode::Eq);
        assert_eq!(eqs.len(), 2);
        assert_eq!(eqs[0].p5 & cmp_flags::KEEPNULL, 0);
        assert_ne!(eqs[1].p5 & cmp_flags::KEEPNULL, 0);
        assert_eq!(find(&parse, Opcode::IfNot).len(), 1);
    }

    #[test]
    fn test_between_codes_operand_once() {
        let t = table();
        let mut parse = unfactored();
        let target = parse.alloc_reg();
        let e = Expr::between(Expr::column(&t, 0, 0), Expr::int(1), Expr::int(5), false);
        parse.expr_code_target(&e, target).unwrap();
        assert_eq!(find(&parse, Opcode::Column).len(), 1);
        assert_eq!(find(&parse, Opcode::Ge).len(), 1);
        assert_eq!(find(&parse, Opcode::Le).len(), 1);
        assert_eq!(parse.vdbe.last_op().unwrap().opcode, Opcode::And);
    }

    #[test]
    fn test_case_with_operand() {
        let t = table();
        let mut parse = unfactored();
        let target = parse.alloc_reg();
        let e = Expr::case(
            Some(Expr::column(&t, 0, 0)),
            vec![(Expr::int(1), Expr::string("one"))],
            Some(Expr::string("other")),
        );
        parse.expr_code_target(&e, target).unwrap();
        let ne = find(&parse, Opcode::Ne);
        assert_eq!(ne.len(), 1);
        assert_ne!(ne[0].p5 & cmp_flags::JUMPIFNULL, 0);
        let last = parse.vdbe.last_op().unwrap();
        assert_eq!(last.opcode, Opcode::ApplyType);
        assert_eq!(last.p4, P4::Types(vec![FieldType::String]));
    }

    #[test]
    fn test_coalesce_short_circuits() {
        let t = table();
        let mut parse = unfactored();
        let target = parse.alloc_reg();
        let e = Expr::function(
            "coalesce",
            vec![Expr::column(&t, 0, 0), Expr::column(&t, 1, 0), Expr::int(0)],
            false,
        );
        parse.expr_code_target(&e, target).unwrap();
        assert_eq!(find(&parse, Opcode::NotNull).len(), 2);
        assert!(find(&parse, Opcode::Function).is_empty());

        let single = Expr::function("coalesce", vec![Expr::int(1)], false);
        let err = parse.expr_code_target(&single, target).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Error);
    }

    #[test]
    fn test_length_reads_partial_column() {
        let t = table();
        let mut parse = unfactored();
        let target = parse.alloc_reg();
        let e = Expr::function("length", vec![Expr::column(&t, 0, 1)], false);
        parse.expr_code_target(&e, target).unwrap();
        let column = &find(&parse, Opcode::Column)[0];
        assert_eq!(column.p5, opflags::LENGTHARG);
        let func = &find(&parse, Opcode::Function)[0];
        assert_eq!(func.p4, P4::FuncDef("LENGTH".to_string(), 1));
        assert_eq!(func.p3, target);
    }

    #[test]
    fn test_constant_factoring_reuses_register() {
        let mut parse = Parse::default();
        let sum = Expr::binary(BinaryOp::Add, Expr::int(1), Expr::int(2));
        let (r1, free1) = parse.expr_code_temp(&sum).unwrap();
        let (r2, _) = parse.expr_code_temp(&sum.clone()).unwrap();
        assert_eq!(r1, r2);
        assert_eq!(free1, 0);
        assert_eq!(parse.const_expr_count(), 1);
        // only Init so far; the constant is coded by finish()
        assert_eq!(parse.vdbe.ops().len(), 1);
    }

    #[test]
    fn test_user_errors() {
        let mut parse = unfactored();
        let r = parse.alloc_reg();
        let raise = Expr::new(ExprKind::Raise {
            message: "boom".to_string(),
        });
        let err = parse.expr_code_target(&raise, r).unwrap_err();
        assert!(err.message().contains("trigger-program"));

        let err = parse
            .expr_code_target(&Expr::vector(vec![Expr::int(1), Expr::int(2)]), r)
            .unwrap_err();
        assert_eq!(err.message(), "row value misused");

        let err = parse
            .expr_code_target(&Expr::function("count", vec![], false), r)
            .unwrap_err();
        assert_eq!(err.message(), "misuse of aggregate: COUNT()");
    }

    #[test]
    fn test_raise_inside_trigger() {
        let mut parse = unfactored();
        parse.in_trigger = true;
        let r = parse.alloc_reg();
        let raise = Expr::new(ExprKind::Raise {
            message: "boom".to_string(),
        });
        parse.expr_code_target(&raise, r).unwrap();
        assert_eq!(
            opcodes(&parse)[1..].to_vec(),
            vec![Opcode::SetDiag, Opcode::Halt]
        );
    }

    #[test]
    fn test_if_true_over_and() {
        let t = table();
        let mut parse = unfactored();
        let dest = parse.make_label();
        let e = Expr::and(
            Expr::binary(BinaryOp::Lt, Expr::column(&t, 0, 0), Expr::int(1)),
            Expr::binary(BinaryOp::Gt, Expr::column(&t, 0, 1), Expr::string("m")),
        );
        parse.expr_if_true(&e, dest, 0).unwrap();
        let compares: Vec<Opcode> = opcodes(&parse)
            .into_iter()
            .filter(|op| op.is_comparison())
            .collect();
        assert_eq!(compares, vec![Opcode::Ge, Opcode::Gt]);
        let ge = &find(&parse, Opcode::Ge)[0];
        // the left conjunct jumps past the right one when NULL
        assert_ne!(ge.p5 & cmp_flags::JUMPIFNULL, 0);
    }

    #[test]
    fn test_if_false_constant_folds() {
        let mut parse = unfactored();
        let dest = parse.make_label();
        parse.expr_if_false(&Expr::boolean(true), dest, 0).unwrap();
        assert_eq!(parse.vdbe.ops().len(), 1);
        parse.expr_if_false(&Expr::boolean(false), dest, 0).unwrap();
        assert_eq!(parse.vdbe.last_op().unwrap().opcode, Opcode::Goto);
    }

    #[test]
    fn test_negated_in_list_value() {
        let t = table();
        let mut parse = unfactored();
        let target = parse.alloc_reg();
        let e = Expr::in_list(Expr::column(&t, 0, 0), vec![Expr::int(1), Expr::int(2)], true);
        parse.expr_code_target(&e, target).unwrap();
        let last = parse.vdbe.last_op().unwrap();
        assert_eq!(last.opcode, Opcode::Not);
        assert_eq!((last.p1, last.p2), (target, target));
    }

    #[test]
    fn test_expr_list_merges_adjacent_copies() {
        let mut parse = unfactored();
        let src = parse.alloc_regs(2);
        let list = ExprList::from_exprs(vec![
            Expr::register(src, Expr::int(1)),
            Expr::register(src + 1, Expr::int(2)),
        ]);
        let target = parse.alloc_regs(2);
        let n = parse
            .expr_code_expr_list(&list, target, 0, CodeListFlags::DUP)
            .unwrap();
        assert_eq!(n, 2);
        let copies = find(&parse, Opcode::Copy);
        assert_eq!(copies.len(), 1);
        assert_eq!((copies[0].p1, copies[0].p2, copies[0].p3), (src, target, 1));
    }

    #[test]
    fn test_expr_code_and_cache_registerizes() {
        let t = table();
        let mut parse = unfactored();
        let target = parse.alloc_reg();
        let mut e = Expr::column(&t, 0, 0);
        parse.expr_code_and_cache(&mut e, target).unwrap();
        assert!(matches!(e.kind, ExprKind::Register { .. }));
        assert_eq!(parse.vdbe.last_op().unwrap().opcode, Opcode::Copy);
    }
}
