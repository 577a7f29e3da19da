//! Resolved syntax tree
//!
//! Expression, expression-list, SELECT and FROM-clause nodes as handed to
//! the compiler by the name resolver: every column reference is already
//! bound to a (cursor, column) pair and every FROM item has a cursor.
//!
//! Trees are exclusively owned (`Box`) and `Clone` is the deep duplicate.
//! The only cross reference, the outer-join origin of a term, is a plain
//! cursor number.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

use crate::functions::{find_function, FuncDef, FuncFlags};
use crate::schema::{Column, Table, COLL_NONE};
use crate::types::{Bitmask, Cursor, FieldType, Reg, SortOrder};

// ============================================================================
// Expression Flags
// ============================================================================

bitflags! {
    /// Properties attached to an expression node
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct ExprFlags: u32 {
        /// Originated in the ON or USING clause of a join
        const FROM_JOIN = 0x0001;
        /// Contains one or more aggregate functions
        const AGG = 0x0002;
        /// Contains a function call
        const HAS_FUNC = 0x0004;
        /// Tree contains an explicit COLLATE
        const COLLATE = 0x0008;
        /// Tree contains a subquery
        const SUBQUERY = 0x0010;
        /// Aggregate called with DISTINCT
        const DISTINCT = 0x0020;
        /// Subquery refers to an outer query (correlated)
        const VAR_SELECT = 0x0040;
        /// Node is skipped by `skip_collate`
        const SKIP = 0x0080;
        /// unlikely()/likelihood() wrapper
        const UNLIKELY = 0x0100;
        /// Function whose value only depends on its arguments
        const CONST_FUNC = 0x0200;
        /// Value may be NULL because of an outer join
        const CAN_BE_NULL = 0x0400;
        /// Height must be recomputed before the depth check
        const HEIGHT_CHECK = 0x0800;
        /// LIMIT synthesized by the compiler rather than written by the user
        const SYSTEM = 0x1000;
        /// Candidate for constant factoring
        const CONST_CANDIDATE = 0x2000;
        /// Result of an earlier evaluation now held in a register
        const REGISTERIZED = 0x4000;
        /// Original column was a GROUP BY alias
        const ALIAS = 0x8000;
    }
}

impl ExprFlags {
    /// Flags inherited by a parent from its children
    pub const PROPAGATE: ExprFlags = ExprFlags::COLLATE
        .union(ExprFlags::SUBQUERY)
        .union(ExprFlags::HAS_FUNC);
}

// ============================================================================
// Operators
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    Negate,
    Plus,
    BitNot,
    IsNull,
    NotNull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
    Concat,
    BitAnd,
    BitOr,
    ShiftLeft,
    ShiftRight,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            BinaryOp::Add
                | BinaryOp::Subtract
                | BinaryOp::Multiply
                | BinaryOp::Divide
                | BinaryOp::Remainder
                | BinaryOp::BitAnd
                | BinaryOp::BitOr
                | BinaryOp::ShiftLeft
                | BinaryOp::ShiftRight
        )
    }

    /// Operator obtained by swapping the operands
    pub fn commuted(&self) -> BinaryOp {
        match self {
            BinaryOp::Lt => BinaryOp::Gt,
            BinaryOp::Le => BinaryOp::Ge,
            BinaryOp::Gt => BinaryOp::Lt,
            BinaryOp::Ge => BinaryOp::Le,
            other => *other,
        }
    }

    /// Logical negation of a comparison
    pub fn negated(&self) -> BinaryOp {
        match self {
            BinaryOp::Eq => BinaryOp::Ne,
            BinaryOp::Ne => BinaryOp::Eq,
            BinaryOp::Lt => BinaryOp::Ge,
            BinaryOp::Le => BinaryOp::Gt,
            BinaryOp::Gt => BinaryOp::Le,
            BinaryOp::Ge => BinaryOp::Lt,
            other => *other,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Remainder => "%",
            BinaryOp::Concat => "||",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::ShiftLeft => "<<",
            BinaryOp::ShiftRight => ">>",
        }
    }
}

// ============================================================================
// Expression Nodes
// ============================================================================

/// Reference to a column of a FROM item
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    /// Cursor of the FROM item
    pub cursor: Cursor,
    /// Column position
    pub column: usize,
    /// Definition of the relation the column belongs to
    pub table: Arc<Table>,
}

impl ColumnRef {
    pub fn def(&self) -> Option<&Column> {
        self.table.columns.get(self.column)
    }

    pub fn name(&self) -> &str {
        self.def().map(|c| c.name.as_str()).unwrap_or("?")
    }
}

/// Function call
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub args: Vec<Expr>,
    pub distinct: bool,
    /// Definition found in the function registry
    pub def: Option<Arc<FuncDef>>,
}

impl FunctionCall {
    pub fn flags(&self) -> FuncFlags {
        self.def.as_ref().map(|d| d.flags).unwrap_or_else(FuncFlags::empty)
    }

    pub fn has_flag(&self, flag: FuncFlags) -> bool {
        self.flags().contains(flag)
    }
}

/// Right-hand side of an IN operator
#[derive(Debug, Clone, PartialEq)]
pub enum InRhs {
    List(Vec<Expr>),
    Select(Box<Select>),
}

/// One arm of a CASE expression
#[derive(Debug, Clone, PartialEq)]
pub struct WhenThen {
    pub when: Expr,
    pub then: Expr,
}

/// Expression node kind. Exactly one child shape per kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Null,
    Integer(i64),
    Float(f64),
    String(String),
    Blob(Vec<u8>),
    Bool(bool),
    /// Bound parameter (1-based)
    Variable { index: i32, name: Option<String> },
    Column(ColumnRef),
    /// Column copied into the aggregate accumulator block: column `index`
    /// of aggregate context `info`
    AggColumn { col: ColumnRef, info: usize, index: usize },
    Function(FunctionCall),
    /// Aggregate function call site: function `index` of aggregate
    /// context `info`
    AggFunction { call: FunctionCall, info: usize, index: usize },
    Unary { op: UnaryOp, expr: Box<Expr> },
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr> },
    Between { expr: Box<Expr>, low: Box<Expr>, high: Box<Expr>, negated: bool },
    In { expr: Box<Expr>, rhs: InRhs, negated: bool },
    Case { operand: Option<Box<Expr>>, arms: Vec<WhenThen>, else_expr: Option<Box<Expr>> },
    Cast { expr: Box<Expr>, ty: FieldType },
    Collate { expr: Box<Expr>, collation: String },
    /// Scalar subquery
    Subquery(Box<Select>),
    Exists(Box<Select>),
    /// Row value
    Vector(Vec<Expr>),
    /// Already evaluated into `reg`; `orig` is what was evaluated
    Register { reg: Reg, orig: Box<Expr> },
    Raise { message: String },
}

/// Expression tree node
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub flags: ExprFlags,
    /// Resolved type
    pub ty: FieldType,
    /// Depth of the tree rooted here
    pub height: u32,
    /// Cursor of the right-hand table of the join this term came from.
    /// Only meaningful with [`ExprFlags::FROM_JOIN`].
    pub right_join_table: Cursor,
}

impl Expr {
    pub fn new(kind: ExprKind) -> Self {
        let mut expr = Expr {
            kind,
            flags: ExprFlags::empty(),
            ty: FieldType::Any,
            height: 1,
            right_join_table: -1,
        };
        expr.ty = expr.initial_type();
        expr.set_height_and_flags();
        expr
    }

    fn initial_type(&self) -> FieldType {
        match &self.kind {
            ExprKind::Integer(_) => FieldType::Integer,
            ExprKind::Float(_) => FieldType::Double,
            ExprKind::String(_) => FieldType::String,
            ExprKind::Blob(_) => FieldType::Varbinary,
            ExprKind::Bool(_) => FieldType::Boolean,
            ExprKind::Column(c) | ExprKind::AggColumn { col: c, .. } => {
                c.def().map(|d| d.field_type).unwrap_or(FieldType::Scalar)
            }
            ExprKind::Function(call) | ExprKind::AggFunction { call, .. } => call
                .def
                .as_ref()
                .map(|d| d.returns)
                .unwrap_or(FieldType::Scalar),
            ExprKind::Cast { ty, .. } => *ty,
            ExprKind::Register { orig, .. } => orig.ty,
            _ => FieldType::Any,
        }
    }

    /// Recompute height and propagated flags from the direct children.
    pub fn set_height_and_flags(&mut self) {
        let mut height = 0;
        let mut flags = ExprFlags::empty();
        for child in self.children() {
            height = height.max(child.height);
            flags |= child.flags & ExprFlags::PROPAGATE;
        }
        if let Some(select) = self.subselect() {
            height = height.max(select.max_height());
            flags |= ExprFlags::SUBQUERY;
        }
        self.height = height + 1;
        self.flags |= flags;
        match &self.kind {
            ExprKind::Collate { .. } => {
                self.flags |= ExprFlags::COLLATE | ExprFlags::SKIP;
            }
            ExprKind::Function(call) => {
                self.flags |= ExprFlags::HAS_FUNC;
                if call.has_flag(FuncFlags::CONSTANT) {
                    self.flags |= ExprFlags::CONST_FUNC;
                }
                if call.has_flag(FuncFlags::UNLIKELY) && !call.args.is_empty() {
                    self.flags |= ExprFlags::UNLIKELY | ExprFlags::SKIP;
                }
            }
            ExprKind::AggFunction { call, .. } => {
                self.flags |= ExprFlags::HAS_FUNC | ExprFlags::AGG;
                if call.distinct {
                    self.flags |= ExprFlags::DISTINCT;
                }
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------

    pub fn null() -> Self {
        Expr::new(ExprKind::Null)
    }

    pub fn int(value: i64) -> Self {
        Expr::new(ExprKind::Integer(value))
    }

    pub fn float(value: f64) -> Self {
        Expr::new(ExprKind::Float(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Expr::new(ExprKind::String(value.into()))
    }

    pub fn blob(value: Vec<u8>) -> Self {
        Expr::new(ExprKind::Blob(value))
    }

    pub fn boolean(value: bool) -> Self {
        Expr::new(ExprKind::Bool(value))
    }

    pub fn variable(index: i32) -> Self {
        Expr::new(ExprKind::Variable { index, name: None })
    }

    pub fn column(table: &Arc<Table>, cursor: Cursor, column: usize) -> Self {
        Expr::new(ExprKind::Column(ColumnRef {
            cursor,
            column,
            table: Arc::clone(table),
        }))
    }

    pub fn unary(op: UnaryOp, expr: Expr) -> Self {
        Expr::new(ExprKind::Unary {
            op,
            expr: Box::new(expr),
        })
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::new(ExprKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    pub fn and(left: Expr, right: Expr) -> Self {
        Expr::binary(BinaryOp::And, left, right)
    }

    pub fn or(left: Expr, right: Expr) -> Self {
        Expr::binary(BinaryOp::Or, left, right)
    }

    pub fn eq(left: Expr, right: Expr) -> Self {
        Expr::binary(BinaryOp::Eq, left, right)
    }

    pub fn between(expr: Expr, low: Expr, high: Expr, negated: bool) -> Self {
        Expr::new(ExprKind::Between {
            expr: Box::new(expr),
            low: Box::new(low),
            high: Box::new(high),
            negated,
        })
    }

    pub fn in_list(expr: Expr, list: Vec<Expr>, negated: bool) -> Self {
        Expr::new(ExprKind::In {
            expr: Box::new(expr),
            rhs: InRhs::List(list),
            negated,
        })
    }

    pub fn in_select(expr: Expr, select: Select, negated: bool) -> Self {
        Expr::new(ExprKind::In {
            expr: Box::new(expr),
            rhs: InRhs::Select(Box::new(select)),
            negated,
        })
    }

    pub fn case(operand: Option<Expr>, arms: Vec<(Expr, Expr)>, else_expr: Option<Expr>) -> Self {
        Expr::new(ExprKind::Case {
            operand: operand.map(Box::new),
            arms: arms
                .into_iter()
                .map(|(when, then)| WhenThen { when, then })
                .collect(),
            else_expr: else_expr.map(Box::new),
        })
    }

    pub fn cast(expr: Expr, ty: FieldType) -> Self {
        Expr::new(ExprKind::Cast {
            expr: Box::new(expr),
            ty,
        })
    }

    pub fn collate(expr: Expr, collation: impl Into<String>) -> Self {
        Expr::new(ExprKind::Collate {
            expr: Box::new(expr),
            collation: collation.into(),
        })
    }

    /// Function call resolved against the function registry. Aggregates
    /// become [`ExprKind::AggFunction`] with an unassigned slot.
    pub fn function(name: &str, args: Vec<Expr>, distinct: bool) -> Self {
        let def = find_function(name, args.len());
        let call = FunctionCall {
            name: name.to_ascii_uppercase(),
            args,
            distinct,
            def: def.clone(),
        };
        match def {
            Some(d) if d.is_aggregate() => Expr::new(ExprKind::AggFunction {
                call,
                info: usize::MAX,
                index: usize::MAX,
            }),
            _ => Expr::new(ExprKind::Function(call)),
        }
    }

    pub fn subquery(select: Select) -> Self {
        Expr::new(ExprKind::Subquery(Box::new(select)))
    }

    pub fn exists(select: Select) -> Self {
        Expr::new(ExprKind::Exists(Box::new(select)))
    }

    pub fn vector(items: Vec<Expr>) -> Self {
        Expr::new(ExprKind::Vector(items))
    }

    pub fn register(reg: Reg, orig: Expr) -> Self {
        let mut e = Expr::new(ExprKind::Register {
            reg,
            orig: Box::new(orig),
        });
        e.flags |= ExprFlags::REGISTERIZED;
        e
    }

    /// Builder-style type override
    pub fn with_type(mut self, ty: FieldType) -> Self {
        self.ty = ty;
        self
    }

    /// Mark as coming from the ON clause of a join whose right table is
    /// `right_table`, recursively.
    pub fn set_join(&mut self, right_table: Cursor) {
        self.flags |= ExprFlags::FROM_JOIN;
        self.right_join_table = right_table;
        if let ExprKind::Function(call) = &mut self.kind {
            for arg in &mut call.args {
                arg.set_join(right_table);
            }
            return;
        }
        for child in self.children_mut() {
            child.set_join(right_table);
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn has_flag(&self, flag: ExprFlags) -> bool {
        self.flags.intersects(flag)
    }

    pub fn is_from_join(&self) -> bool {
        self.flags.contains(ExprFlags::FROM_JOIN)
    }

    /// Skip COLLATE wrappers and unlikely()/likelihood() calls
    pub fn skip_collate(&self) -> &Expr {
        let mut e = self;
        loop {
            match &e.kind {
                ExprKind::Collate { expr, .. } => e = expr,
                ExprKind::Function(call) if e.has_flag(ExprFlags::UNLIKELY) => {
                    match call.args.first() {
                        Some(arg) => e = arg,
                        None => return e,
                    }
                }
                _ => return e,
            }
        }
    }

    pub fn is_null_literal(&self) -> bool {
        matches!(self.kind, ExprKind::Null)
    }

    pub fn as_column(&self) -> Option<&ColumnRef> {
        match &self.kind {
            ExprKind::Column(c) => Some(c),
            _ => None,
        }
    }

    pub fn binary_parts(&self) -> Option<(BinaryOp, &Expr, &Expr)> {
        match &self.kind {
            ExprKind::Binary { op, left, right } => Some((*op, left, right)),
            _ => None,
        }
    }

    /// Nested SELECT carried by this node, if any
    pub fn subselect(&self) -> Option<&Select> {
        match &self.kind {
            ExprKind::Subquery(s) | ExprKind::Exists(s) => Some(s),
            ExprKind::In {
                rhs: InRhs::Select(s),
                ..
            } => Some(s),
            _ => None,
        }
    }

    pub fn subselect_mut(&mut self) -> Option<&mut Select> {
        match &mut self.kind {
            ExprKind::Subquery(s) | ExprKind::Exists(s) => Some(s),
            ExprKind::In {
                rhs: InRhs::Select(s),
                ..
            } => Some(s),
            _ => None,
        }
    }

    /// Direct child expressions (nested SELECTs excluded)
    pub fn children(&self) -> Vec<&Expr> {
        match &self.kind {
            ExprKind::Null
            | ExprKind::Integer(_)
            | ExprKind::Float(_)
            | ExprKind::String(_)
            | ExprKind::Blob(_)
            | ExprKind::Bool(_)
            | ExprKind::Variable { .. }
            | ExprKind::Column(_)
            | ExprKind::AggColumn { .. }
            | ExprKind::Subquery(_)
            | ExprKind::Exists(_)
            | ExprKind::Raise { .. } => Vec::new(),
            ExprKind::Function(call) | ExprKind::AggFunction { call, .. } => {
                call.args.iter().collect()
            }
            ExprKind::Unary { expr, .. }
            | ExprKind::Cast { expr, .. }
            | ExprKind::Collate { expr, .. } => vec![expr.as_ref()],
            ExprKind::Register { orig, .. } => vec![orig.as_ref()],
            ExprKind::Binary { left, right, .. } => vec![left.as_ref(), right.as_ref()],
            ExprKind::Between {
                expr, low, high, ..
            } => vec![expr.as_ref(), low.as_ref(), high.as_ref()],
            ExprKind::In { expr, rhs, .. } => {
                let mut v = vec![expr.as_ref()];
                if let InRhs::List(list) = rhs {
                    v.extend(list.iter());
                }
                v
            }
            ExprKind::Case {
                operand,
                arms,
                else_expr,
            } => {
                let mut v: Vec<&Expr> = Vec::new();
                if let Some(op) = operand {
                    v.push(op);
                }
                for arm in arms {
                    v.push(&arm.when);
                    v.push(&arm.then);
                }
                if let Some(e) = else_expr {
                    v.push(e);
                }
                v
            }
            ExprKind::Vector(items) => items.iter().collect(),
        }
    }

    pub fn children_mut(&mut self) -> Vec<&mut Expr> {
        match &mut self.kind {
            ExprKind::Null
            | ExprKind::Integer(_)
            | ExprKind::Float(_)
            | ExprKind::String(_)
            | ExprKind::Blob(_)
            | ExprKind::Bool(_)
            | ExprKind::Variable { .. }
            | ExprKind::Column(_)
            | ExprKind::AggColumn { .. }
            | ExprKind::Subquery(_)
            | ExprKind::Exists(_)
            | ExprKind::Raise { .. } => Vec::new(),
            ExprKind::Function(call) | ExprKind::AggFunction { call, .. } => {
                call.args.iter_mut().collect()
            }
            ExprKind::Unary { expr, .. }
            | ExprKind::Cast { expr, .. }
            | ExprKind::Collate { expr, .. } => vec![expr.as_mut()],
            ExprKind::Register { orig, .. } => vec![orig.as_mut()],
            ExprKind::Binary { left, right, .. } => vec![left.as_mut(), right.as_mut()],
            ExprKind::Between {
                expr, low, high, ..
            } => vec![expr.as_mut(), low.as_mut(), high.as_mut()],
            ExprKind::In { expr, rhs, .. } => {
                let mut v = vec![expr.as_mut()];
                if let InRhs::List(list) = rhs {
                    v.extend(list.iter_mut());
                }
                v
            }
            ExprKind::Case {
                operand,
                arms,
                else_expr,
            } => {
                let mut v: Vec<&mut Expr> = Vec::new();
                if let Some(op) = operand {
                    v.push(op);
                }
                for arm in arms.iter_mut() {
                    v.push(&mut arm.when);
                    v.push(&mut arm.then);
                }
                if let Some(e) = else_expr {
                    v.push(e);
                }
                v
            }
            ExprKind::Vector(items) => items.iter_mut().collect(),
        }
    }

    /// Short operator name used in comments and diagnostics
    pub fn op_name(&self) -> &'static str {
        match &self.kind {
            ExprKind::Null => "NULL",
            ExprKind::Integer(_) => "INTEGER",
            ExprKind::Float(_) => "FLOAT",
            ExprKind::String(_) => "STRING",
            ExprKind::Blob(_) => "BLOB",
            ExprKind::Bool(_) => "BOOLEAN",
            ExprKind::Variable { .. } => "VARIABLE",
            ExprKind::Column(_) => "COLUMN",
            ExprKind::AggColumn { .. } => "AGG_COLUMN",
            ExprKind::Function(_) => "FUNCTION",
            ExprKind::AggFunction { .. } => "AGG_FUNCTION",
            ExprKind::Unary { .. } => "UNARY",
            ExprKind::Binary { op, .. } => op.symbol(),
            ExprKind::Between { .. } => "BETWEEN",
            ExprKind::In { .. } => "IN",
            ExprKind::Case { .. } => "CASE",
            ExprKind::Cast { .. } => "CAST",
            ExprKind::Collate { .. } => "COLLATE",
            ExprKind::Subquery(_) => "SELECT",
            ExprKind::Exists(_) => "EXISTS",
            ExprKind::Vector(_) => "VECTOR",
            ExprKind::Register { .. } => "REGISTER",
            ExprKind::Raise { .. } => "RAISE",
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::Null => write!(f, "NULL"),
            ExprKind::Integer(v) => write!(f, "{}", v),
            ExprKind::Float(v) => write!(f, "{}", v),
            ExprKind::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
            ExprKind::Blob(b) => write!(f, "X'{}'", hex::encode_upper(b)),
            ExprKind::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            ExprKind::Variable { index, name } => match name {
                Some(n) => write!(f, "{}", n),
                None => write!(f, "?{}", index),
            },
            ExprKind::Column(c) | ExprKind::AggColumn { col: c, .. } => {
                write!(f, "{}.{}", c.table.name, c.name())
            }
            ExprKind::Function(call) | ExprKind::AggFunction { call, .. } => {
                write!(f, "{}(", call.name)?;
                if call.distinct {
                    write!(f, "DISTINCT ")?;
                }
                if call.args.is_empty() && call.def.as_ref().is_some_and(|d| d.is_aggregate()) {
                    write!(f, "*")?;
                }
                for (i, arg) in call.args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            ExprKind::Unary { op, expr } => match op {
                UnaryOp::Not => write!(f, "NOT {}", expr),
                UnaryOp::Negate => write!(f, "-{}", expr),
                UnaryOp::Plus => write!(f, "+{}", expr),
                UnaryOp::BitNot => write!(f, "~{}", expr),
                UnaryOp::IsNull => write!(f, "{} IS NULL", expr),
                UnaryOp::NotNull => write!(f, "{} IS NOT NULL", expr),
            },
            ExprKind::Binary { op, left, right } => {
                write!(f, "{} {} {}", left, op.symbol(), right)
            }
            ExprKind::Between {
                expr,
                low,
                high,
                negated,
            } => {
                let not = if *negated { "NOT " } else { "" };
                write!(f, "{} {}BETWEEN {} AND {}", expr, not, low, high)
            }
            ExprKind::In { expr, rhs, negated } => {
                let not = if *negated { "NOT " } else { "" };
                match rhs {
                    InRhs::List(list) => {
                        write!(f, "{} {}IN (", expr, not)?;
                        for (i, item) in list.iter().enumerate() {
                            if i > 0 {
                                write!(f, ", ")?;
                            }
                            write!(f, "{}", item)?;
                        }
                        write!(f, ")")
                    }
                    InRhs::Select(_) => write!(f, "{} {}IN (SELECT ...)", expr, not),
                }
            }
            ExprKind::Case { .. } => write!(f, "CASE ... END"),
            ExprKind::Cast { expr, ty } => write!(f, "CAST({} AS {})", expr, ty),
            ExprKind::Collate { expr, collation } => write!(f, "{} COLLATE {}", expr, collation),
            ExprKind::Subquery(_) => write!(f, "(SELECT ...)"),
            ExprKind::Exists(_) => write!(f, "EXISTS (SELECT ...)"),
            ExprKind::Vector(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            ExprKind::Register { orig, .. } => write!(f, "{}", orig),
            ExprKind::Raise { message } => write!(f, "RAISE('{}')", message),
        }
    }
}

// ============================================================================
// Expression Lists
// ============================================================================

/// One entry of a projection, ORDER BY or GROUP BY list
#[derive(Debug, Clone, PartialEq)]
pub struct ExprListItem {
    pub expr: Expr,
    /// AS name
    pub name: Option<String>,
    /// Original text of the expression
    pub span: Option<String>,
    pub sort_order: SortOrder,
    /// For ORDER BY/GROUP BY: 1-based projection column this term refers
    /// to, 0 if none
    pub order_by_col: u16,
    /// Register already holding the value (constant factoring), 0 if none
    pub const_reg: Reg,
    /// Already emitted
    pub done: bool,
}

impl ExprListItem {
    pub fn new(expr: Expr) -> Self {
        Self {
            expr,
            name: None,
            span: None,
            sort_order: SortOrder::Asc,
            order_by_col: 0,
            const_reg: 0,
            done: false,
        }
    }
}

/// Ordered list of expressions
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExprList {
    pub items: Vec<ExprListItem>,
}

impl ExprList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_exprs(exprs: Vec<Expr>) -> Self {
        ExprList {
            items: exprs.into_iter().map(ExprListItem::new).collect(),
        }
    }

    pub fn push(&mut self, expr: Expr) -> &mut ExprListItem {
        self.items.push(ExprListItem::new(expr));
        let last = self.items.len() - 1;
        &mut self.items[last]
    }

    /// Append a named entry
    pub fn push_named(&mut self, expr: Expr, name: impl Into<String>) {
        self.push(expr).name = Some(name.into());
    }

    /// Append an ORDER BY style entry
    pub fn push_sorted(&mut self, expr: Expr, order: SortOrder) {
        self.push(expr).sort_order = order;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn exprs(&self) -> impl Iterator<Item = &Expr> {
        self.items.iter().map(|i| &i.expr)
    }

    pub fn exprs_mut(&mut self) -> impl Iterator<Item = &mut Expr> {
        self.items.iter_mut().map(|i| &mut i.expr)
    }

    pub fn max_height(&self) -> u32 {
        self.exprs().map(|e| e.height).max().unwrap_or(0)
    }
}

// ============================================================================
// FROM clause
// ============================================================================

bitflags! {
    /// Join operator bits of a FROM item
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct JoinType: u8 {
        const INNER = 0x01;
        const CROSS = 0x02;
        const NATURAL = 0x04;
        const LEFT = 0x08;
        const RIGHT = 0x10;
        const OUTER = 0x20;
    }
}

bitflags! {
    /// Compile-time state of a FROM item
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct SrcItemFlags: u8 {
        /// Subquery refers to columns of outer queries
        const CORRELATED = 0x01;
        /// Implemented as a co-routine
        const VIA_COROUTINE = 0x02;
        /// Recursive CTE placeholder
        const RECURSIVE = 0x04;
        /// The subquery came from a view
        const FROM_VIEW = 0x08;
    }
}

/// One FROM-clause item
#[derive(Debug, Clone, PartialEq)]
pub struct SrcItem {
    /// Relation definition. For subqueries this describes the result set.
    pub table: Option<Arc<Table>>,
    pub alias: Option<String>,
    /// Nested SELECT, for subqueries and views
    pub select: Option<Box<Select>>,
    pub cursor: Cursor,
    /// Join operator between this item and the previous one
    pub join_type: JoinType,
    pub on: Option<Box<Expr>>,
    pub using: Vec<String>,
    pub fg: SrcItemFlags,
    /// Bit `i` set when column `i` is referenced
    pub col_used: Bitmask,
    /// Address of the subroutine that fills the ephemeral table
    pub addr_fill_sub: i32,
    /// Return register of the fill subroutine or co-routine
    pub reg_return: Reg,
    /// First register of a co-routine result row
    pub reg_result: Reg,
}

impl SrcItem {
    pub fn table(table: Arc<Table>, cursor: Cursor) -> Self {
        Self {
            table: Some(table),
            alias: None,
            select: None,
            cursor,
            join_type: JoinType::empty(),
            on: None,
            using: Vec::new(),
            fg: SrcItemFlags::empty(),
            col_used: 0,
            addr_fill_sub: 0,
            reg_return: 0,
            reg_result: 0,
        }
    }

    /// A subquery item; its result set becomes the item's table definition.
    pub fn subquery(select: Select, alias: &str, cursor: Cursor) -> Self {
        let table = Arc::new(select.result_table(alias));
        let mut item = SrcItem::table(table, cursor);
        item.alias = Some(alias.to_string());
        item.select = Some(Box::new(select));
        item
    }

    pub fn with_join(mut self, join_type: JoinType, on: Option<Expr>) -> Self {
        self.join_type = join_type;
        self.on = on.map(Box::new);
        self
    }

    pub fn name(&self) -> &str {
        if let Some(alias) = &self.alias {
            return alias;
        }
        self.table.as_ref().map(|t| t.name.as_str()).unwrap_or("")
    }

    pub fn is_left_join(&self) -> bool {
        self.join_type.contains(JoinType::LEFT)
    }
}

/// FROM clause
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SrcList {
    pub items: Vec<SrcItem>,
}

impl SrcList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(item: SrcItem) -> Self {
        SrcList { items: vec![item] }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn find_cursor(&self, cursor: Cursor) -> Option<usize> {
        self.items.iter().position(|i| i.cursor == cursor)
    }
}

// ============================================================================
// SELECT
// ============================================================================

bitflags! {
    /// Properties of a SELECT
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct SelectFlags: u32 {
        const DISTINCT = 0x0001;
        const ALL = 0x0002;
        const RESOLVED = 0x0004;
        const AGGREGATE = 0x0008;
        const USES_EPHEMERAL = 0x0010;
        const EXPANDED = 0x0020;
        const HAS_TYPE_INFO = 0x0040;
        const COMPOUND = 0x0080;
        const VALUES = 0x0100;
        const MULTI_VALUE = 0x0200;
        const NESTED_FROM = 0x0400;
        const MIN_MAX_AGG = 0x0800;
        const RECURSIVE = 0x1000;
        const CONVERTED = 0x2000;
        /// Result must contain at most one row (scalar subquery)
        const SINGLE_ROW = 0x4000;
        /// Flattened from a view whose column count must match
        const FROM_VIEW = 0x8000;
    }
}

/// Set operator joining a SELECT with its `prior`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompoundOp {
    #[default]
    Select,
    UnionAll,
    Union,
    Except,
    Intersect,
}

impl CompoundOp {
    pub fn name(&self) -> &'static str {
        match self {
            CompoundOp::Select => "SELECT",
            CompoundOp::UnionAll => "UNION ALL",
            CompoundOp::Union => "UNION",
            CompoundOp::Except => "EXCEPT",
            CompoundOp::Intersect => "INTERSECT",
        }
    }
}

/// SELECT statement. A compound select owns its `prior` chain; the
/// right-most branch is the root.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Select {
    pub op: CompoundOp,
    pub elist: ExprList,
    pub src: SrcList,
    pub where_clause: Option<Box<Expr>>,
    pub group_by: Option<ExprList>,
    pub having: Option<Box<Expr>>,
    pub order_by: Option<ExprList>,
    pub limit: Option<Box<Expr>>,
    pub offset: Option<Box<Expr>>,
    pub prior: Option<Box<Select>>,
    pub flags: SelectFlags,
    /// Identifier for explain comments
    pub id: u32,
    /// Name, for explain comments
    pub name: String,
    /// LIMIT counter register, 0 if none
    pub i_limit: Reg,
    /// OFFSET counter register, 0 if none
    pub i_offset: Reg,
    /// Addresses of ephemeral-table opens patched once the key is known
    pub addr_open_ephm: [Option<i32>; 2],
    /// Estimated number of output rows (log scale)
    pub n_select_row: i16,
}

impl Select {
    pub fn new(elist: ExprList, src: SrcList, where_clause: Option<Expr>) -> Self {
        Select {
            elist,
            src,
            where_clause: where_clause.map(Box::new),
            ..Default::default()
        }
    }

    pub fn has_flag(&self, flag: SelectFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn is_compound(&self) -> bool {
        self.prior.is_some()
    }

    /// Left-most branch of a compound chain
    pub fn leftmost(&self) -> &Select {
        let mut s = self;
        while let Some(p) = &s.prior {
            s = p;
        }
        s
    }

    /// Branches from right to left
    pub fn branches(&self) -> Vec<&Select> {
        let mut out = vec![self];
        let mut s = self;
        while let Some(p) = &s.prior {
            out.push(p);
            s = p;
        }
        out
    }

    pub fn max_height(&self) -> u32 {
        let mut h = self.elist.max_height();
        for e in [&self.where_clause, &self.having, &self.limit, &self.offset]
            .into_iter()
            .flatten()
        {
            h = h.max(e.height);
        }
        if let Some(l) = &self.group_by {
            h = h.max(l.max_height());
        }
        if let Some(l) = &self.order_by {
            h = h.max(l.max_height());
        }
        h
    }

    /// Table definition describing this select's result set
    pub fn result_table(&self, name: &str) -> Table {
        let columns = self
            .elist
            .items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let col_name = item
                    .name
                    .clone()
                    .or_else(|| item.expr.as_column().map(|c| c.name().to_string()))
                    .unwrap_or_else(|| format!("column{}", i + 1));
                let mut col = Column::new(col_name, result_column_type(&item.expr));
                col.coll_id = result_column_coll(&item.expr);
                col
            })
            .collect();
        Table::new(name, columns)
    }
}

fn result_column_type(expr: &Expr) -> FieldType {
    let e = expr.skip_collate();
    match &e.kind {
        ExprKind::Column(_) | ExprKind::Cast { .. } | ExprKind::Function(_) => e.ty,
        ExprKind::Null => FieldType::Any,
        _ if e.ty == FieldType::Any => FieldType::Scalar,
        _ => e.ty,
    }
}

fn result_column_coll(expr: &Expr) -> crate::schema::CollId {
    match &expr.kind {
        ExprKind::Collate { collation, .. } => crate::schema::collation::collation_by_name(collation)
            .map(|c| c.id)
            .unwrap_or(COLL_NONE),
        ExprKind::Column(c) => c.def().map(|d| d.coll_id).unwrap_or(COLL_NONE),
        _ => COLL_NONE,
    }
}
