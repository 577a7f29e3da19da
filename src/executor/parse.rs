//! Per-compilation context
//!
//! A [`Parse`] owns everything that changes while one statement is being
//! compiled: the program under construction, the register and cursor
//! high-water marks, the temporary register pool, the column cache, the
//! list of constant expressions hoisted into the init block and the first
//! error raised. Nested selects borrow the same context.

use tracing::debug;

use crate::config::CompileConfig;
use crate::error::{Error, Result};
use crate::executor::select::aggregate::AggInfo;
use crate::parser::ast::Expr;
use crate::types::{Cursor, Reg};
use crate::vdbe::builder::{ColumnMeta, Program, VdbeBuilder};
use crate::vdbe::ops::Opcode;

/// Maximum number of registers kept on the temp-register free list
pub const MAX_TEMP_REGS: usize = 8;

/// An expression evaluated once, in the init block
#[derive(Debug, Clone, PartialEq)]
pub struct ConstExpr {
    pub expr: Expr,
    /// Register the value is stored into
    pub reg: Reg,
    /// Another equal expression may read `reg` instead of recomputing
    pub reusable: bool,
}

/// One column-cache line: (cursor, column) currently held in `reg`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColCacheEntry {
    /// Push level the entry was stored at
    pub level: i32,
    pub cursor: Cursor,
    pub column: usize,
    pub reg: Reg,
    /// Register goes back to the temp pool when the line is cleared
    pub temp_reg: bool,
    /// Least-recently-used stamp
    pub lru: u64,
}

/// Compile context shared by every pass of one statement
#[derive(Debug)]
pub struct Parse {
    pub config: CompileConfig,
    pub vdbe: VdbeBuilder,
    /// Highest register allocated so far
    pub n_mem: i32,
    /// Number of cursors allocated so far
    pub n_tab: i32,
    /// Free temporary registers
    pub(crate) temp_regs: Vec<Reg>,
    /// First register of the free temporary range
    pub(crate) range_reg: Reg,
    /// Size of the free temporary range
    pub(crate) n_range_reg: i32,
    pub(crate) col_cache: Vec<ColCacheEntry>,
    pub(crate) cache_level: i32,
    pub(crate) cache_cnt: u64,
    /// Expressions hoisted into the init block
    pub(crate) const_exprs: Vec<ConstExpr>,
    /// Constant factoring currently allowed
    pub ok_const_factor: bool,
    init_label: i32,
    error: Option<Error>,
    next_select_id: u32,
    /// Aggregate contexts, addressed by the `info` id of aggregate nodes
    pub aggs: Vec<AggInfo>,
    /// Result-column metadata of the outermost select
    pub columns: Vec<ColumnMeta>,
    /// Compiling a trigger body (RAISE allowed)
    pub in_trigger: bool,
    /// Nesting depth of select compilation
    pub nested: u32,
}

impl Parse {
    pub fn new(config: CompileConfig) -> Self {
        let mut vdbe = VdbeBuilder::new(config.emit_comments);
        let init_label = vdbe.make_label();
        vdbe.add_op2(Opcode::Init, 0, init_label);
        let ok_const_factor = config.enable_factor_constants;
        Parse {
            config,
            vdbe,
            n_mem: 0,
            n_tab: 0,
            temp_regs: Vec::new(),
            range_reg: 0,
            n_range_reg: 0,
            col_cache: Vec::new(),
            cache_level: 0,
            cache_cnt: 0,
            const_exprs: Vec::new(),
            ok_const_factor,
            init_label,
            error: None,
            next_select_id: 0,
            aggs: Vec::new(),
            columns: Vec::new(),
            in_trigger: false,
            nested: 0,
        }
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    /// Record `err` unless an earlier error is already recorded. Returns
    /// the recorded (first) error.
    pub fn set_error(&mut self, err: Error) -> Error {
        self.error.get_or_insert(err).clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Fail with the recorded error if there is one
    pub fn check(&self) -> Result<()> {
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    pub fn alloc_reg(&mut self) -> Reg {
        self.n_mem += 1;
        self.n_mem
    }

    /// Allocate `n` consecutive registers, returning the first
    pub fn alloc_regs(&mut self, n: i32) -> Reg {
        let base = self.n_mem + 1;
        self.n_mem += n;
        base
    }

    pub fn alloc_cursor(&mut self) -> Cursor {
        let cursor = self.n_tab;
        self.n_tab += 1;
        cursor
    }

    pub fn make_label(&mut self) -> i32 {
        self.vdbe.make_label()
    }

    pub fn resolve_label(&mut self, label: i32) {
        self.vdbe.resolve_label(label);
    }

    pub fn next_select_id(&mut self) -> u32 {
        self.next_select_id += 1;
        self.next_select_id
    }

    // ------------------------------------------------------------------
    // Constant hoisting
    // ------------------------------------------------------------------

    /// Queue `expr` to be evaluated into `reg` once, in the init block
    pub fn expr_code_at_init(&mut self, expr: &Expr, reg: Reg, reusable: bool) {
        self.const_exprs.push(ConstExpr {
            expr: expr.clone(),
            reg,
            reusable,
        });
    }

    /// Register of an already hoisted expression equal to `expr`
    pub(crate) fn find_reusable_const(&self, expr: &Expr) -> Option<Reg> {
        self.const_exprs
            .iter()
            .find(|c| c.reusable && crate::executor::expr::analyze::expr_compare(&c.expr, expr, -1) == 0)
            .map(|c| c.reg)
    }

    pub fn const_expr_count(&self) -> usize {
        self.const_exprs.len()
    }

    // ------------------------------------------------------------------
    // Finishing
    // ------------------------------------------------------------------

    /// Close the program: Halt, then the init block holding the hoisted
    /// constants, then a jump back to the first instruction after Init.
    pub fn finish(mut self) -> Result<Program> {
        self.check()?;
        self.vdbe.add_op0(Opcode::Halt);
        self.vdbe.resolve_label(self.init_label);
        self.ok_const_factor = false;
        let consts = std::mem::take(&mut self.const_exprs);
        debug!(count = consts.len(), "coding hoisted constants");
        for c in &consts {
            self.expr_code(&c.expr, c.reg)?;
        }
        self.vdbe.add_op2(Opcode::Goto, 0, 1);
        let ops = self.vdbe.finish()?;
        Ok(Program {
            ops,
            n_mem: self.n_mem,
            n_cursor: self.n_tab,
            columns: self.columns,
        })
    }
}

impl Default for Parse {
    fn default() -> Self {
        Parse::new(CompileConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_new_context_emits_init() {
        let parse = Parse::default();
        assert_eq!(parse.vdbe.ops()[0].opcode, Opcode::Init);
        assert!(!parse.is_aborted());
    }

    #[test]
    fn test_first_error_wins() {
        let mut parse = Parse::default();
        let first = parse.set_error(Error::with_message(ErrorCode::Collation, "first"));
        let second = parse.set_error(Error::with_message(ErrorCode::Error, "second"));
        assert_eq!(first.message(), "first");
        assert_eq!(second.message(), "first");
        let err = parse.finish().unwrap_err();
        assert_eq!(err.code(), ErrorCode::Collation);
    }

    #[test]
    fn test_finish_codes_init_block() {
        let mut parse = Parse::default();
        let reg = parse.alloc_reg();
        parse.expr_code_at_init(&Expr::int(42), reg, true);
        let program = parse.finish().unwrap();
        let ops = &program.ops;
        assert_eq!(ops[0].opcode, Opcode::Init);
        assert_eq!(ops[1].opcode, Opcode::Halt);
        // Init jumps over the Halt into the init block
        assert_eq!(ops[0].p2, 2);
        assert_eq!(ops[2].opcode, Opcode::Integer);
        assert_eq!(ops[2].p1, 42);
        assert_eq!(ops[3].opcode, Opcode::Goto);
        assert_eq!(ops[3].p2, 1);
    }

    #[test]
    fn test_allocation_counters() {
        let mut parse = Parse::default();
        assert_eq!(parse.alloc_reg(), 1);
        assert_eq!(parse.alloc_regs(3), 2);
        assert_eq!(parse.n_mem, 4);
        assert_eq!(parse.alloc_cursor(), 0);
        assert_eq!(parse.alloc_cursor(), 1);
    }
}
