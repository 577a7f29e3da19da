//! Program builder
//!
//! Accumulates instructions, hands out jump labels and resolves them once
//! code generation is complete. Labels are negative numbers placed in jump
//! operands; addresses are never exposed to the compiler's caller.

use std::fmt::Write as _;

use crate::error::{Error, Result};
use crate::types::FieldType;
use crate::vdbe::ops::{Opcode, VdbeOp, P4};

/// Result-column description handed to the execution engine
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMeta {
    pub name: String,
    pub decl_type: FieldType,
    pub nullable: bool,
    pub collation: Option<String>,
    /// Original text of the projection expression
    pub span: Option<String>,
}

/// A compiled program
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub ops: Vec<VdbeOp>,
    /// Number of registers used
    pub n_mem: i32,
    /// Number of cursors used
    pub n_cursor: i32,
    /// Result-column metadata, empty unless rows are output
    pub columns: Vec<ColumnMeta>,
}

impl Program {
    /// EXPLAIN-style listing
    pub fn explain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(
            output,
            "{:>4}  {:<14} {:>4} {:>4} {:>4}  p4/comment",
            "addr", "opcode", "p1", "p2", "p3"
        );
        for (i, op) in self.ops.iter().enumerate() {
            let _ = writeln!(output, "{:>4}  {}", i, op);
        }
        output
    }

    pub fn count(&self, opcode: Opcode) -> usize {
        self.ops.iter().filter(|op| op.opcode == opcode).count()
    }

    pub fn contains(&self, opcode: Opcode) -> bool {
        self.ops.iter().any(|op| op.opcode == opcode)
    }

    /// Address of the first instruction with `opcode`
    pub fn position(&self, opcode: Opcode) -> Option<usize> {
        self.ops.iter().position(|op| op.opcode == opcode)
    }

    /// Instructions with `opcode`, in program order
    pub fn ops_with(&self, opcode: Opcode) -> Vec<&VdbeOp> {
        self.ops.iter().filter(|op| op.opcode == opcode).collect()
    }

    pub fn opcodes(&self) -> Vec<Opcode> {
        self.ops.iter().map(|op| op.opcode).collect()
    }
}

/// Helper for building VDBE programs
#[derive(Debug, Default)]
pub struct VdbeBuilder {
    ops: Vec<VdbeOp>,
    /// Resolved address per label, -1 until resolved
    labels: Vec<i32>,
    /// Attach explain comments
    emit_comments: bool,
}

impl VdbeBuilder {
    pub fn new(emit_comments: bool) -> Self {
        Self {
            ops: Vec::new(),
            labels: Vec::new(),
            emit_comments,
        }
    }

    /// Address of the next instruction
    pub fn current_addr(&self) -> i32 {
        self.ops.len() as i32
    }

    /// Allocate a new, unresolved label
    pub fn make_label(&mut self) -> i32 {
        self.labels.push(-1);
        -(self.labels.len() as i32)
    }

    /// Resolve `label` to the address of the next instruction
    pub fn resolve_label(&mut self, label: i32) {
        let idx = (-label - 1) as usize;
        if let Some(slot) = self.labels.get_mut(idx) {
            *slot = self.ops.len() as i32;
        }
    }

    pub fn add_op(&mut self, opcode: Opcode, p1: i32, p2: i32, p3: i32) -> i32 {
        let addr = self.current_addr();
        self.ops.push(VdbeOp::new(opcode, p1, p2, p3));
        addr
    }

    pub fn add_op0(&mut self, opcode: Opcode) -> i32 {
        self.add_op(opcode, 0, 0, 0)
    }

    pub fn add_op1(&mut self, opcode: Opcode, p1: i32) -> i32 {
        self.add_op(opcode, p1, 0, 0)
    }

    pub fn add_op2(&mut self, opcode: Opcode, p1: i32, p2: i32) -> i32 {
        self.add_op(opcode, p1, p2, 0)
    }

    pub fn add_op4(&mut self, opcode: Opcode, p1: i32, p2: i32, p3: i32, p4: P4) -> i32 {
        let addr = self.current_addr();
        self.ops.push(VdbeOp::with_p4(opcode, p1, p2, p3, p4));
        addr
    }

    /// Add an Integer, or an Int64 when the value does not fit P1
    pub fn add_int(&mut self, value: i64, reg: i32) -> i32 {
        match i32::try_from(value) {
            Ok(v) => self.add_op2(Opcode::Integer, v, reg),
            Err(_) => self.add_op4(Opcode::Int64, 0, reg, 0, P4::Int64(value)),
        }
    }

    /// Point P2 of the jump at `addr` to the next instruction
    pub fn jump_here(&mut self, addr: i32) {
        let here = self.current_addr();
        self.change_p2(addr, here);
    }

    pub fn change_p1(&mut self, addr: i32, p1: i32) {
        if let Some(op) = self.op_at_mut(addr) {
            op.p1 = p1;
        }
    }

    pub fn change_p2(&mut self, addr: i32, p2: i32) {
        if let Some(op) = self.op_at_mut(addr) {
            op.p2 = p2;
        }
    }

    pub fn change_p3(&mut self, addr: i32, p3: i32) {
        if let Some(op) = self.op_at_mut(addr) {
            op.p3 = p3;
        }
    }

    pub fn change_p4(&mut self, addr: i32, p4: P4) {
        if let Some(op) = self.op_at_mut(addr) {
            op.p4 = p4;
        }
    }

    pub fn change_p5(&mut self, p5: u16) {
        if let Some(op) = self.ops.last_mut() {
            op.p5 = p5;
        }
    }

    pub fn change_to_noop(&mut self, addr: i32) {
        if let Some(op) = self.op_at_mut(addr) {
            *op = VdbeOp::new(Opcode::Noop, 0, 0, 0);
        }
    }

    /// Attach an explain comment to the last instruction
    pub fn comment(&mut self, text: impl Into<String>) {
        if !self.emit_comments {
            return;
        }
        if let Some(op) = self.ops.last_mut() {
            op.comment = Some(text.into());
        }
    }

    pub fn op_at(&self, addr: i32) -> Option<&VdbeOp> {
        usize::try_from(addr).ok().and_then(|a| self.ops.get(a))
    }

    pub fn op_at_mut(&mut self, addr: i32) -> Option<&mut VdbeOp> {
        usize::try_from(addr).ok().and_then(|a| self.ops.get_mut(a))
    }

    pub fn last_op(&self) -> Option<&VdbeOp> {
        self.ops.last()
    }

    pub fn ops(&self) -> &[VdbeOp] {
        &self.ops
    }

    fn resolve(&self, value: i32) -> Result<i32> {
        if value >= 0 {
            return Ok(value);
        }
        let idx = (-value - 1) as usize;
        match self.labels.get(idx) {
            Some(&addr) if addr >= 0 => Ok(addr),
            _ => Err(Error::internal(format!("unresolved label {}", value))),
        }
    }

    /// Resolve every label and produce the instruction list
    pub fn finish(self) -> Result<Vec<VdbeOp>> {
        let mut ops = self.ops.clone();
        for op in &mut ops {
            if op.opcode == Opcode::Jump {
                op.p1 = self.resolve(op.p1)?;
                op.p3 = self.resolve(op.p3)?;
            }
            if op.opcode.is_jump() && op.p5 & crate::vdbe::ops::cmp_flags::STOREP2 == 0 {
                op.p2 = self.resolve(op.p2)?;
            }
        }
        Ok(ops)
    }
}
