//! Aggregate bookkeeping
//!
//! Before an aggregate query is coded, every column it reads and every
//! aggregate call it makes is collected into an [`AggInfo`]. The nodes are
//! rewritten in place into [`ExprKind::AggColumn`] and
//! [`ExprKind::AggFunction`] pointing back at their slot, so the expression
//! generator knows to read accumulator registers (or the GROUP BY sorter)
//! instead of the underlying table.

use std::sync::Arc;

use crate::error::{Error, ErrorCode, Result};
use crate::executor::expr::analyze::expr_compare;
use crate::executor::expr::collate::expr_coll;
use crate::executor::expr::codegen::CodeListFlags;
use crate::executor::parse::Parse;
use crate::executor::wherecode::WhereFlags;
use crate::functions::{FuncDef, FuncFlags};
use crate::parser::ast::{ColumnRef, Expr, ExprKind, ExprList, FunctionCall, Select, SrcList};
use crate::schema::{Table, COLL_NONE};
use crate::types::{Cursor, Reg, SortOrder};
use crate::vdbe::ops::{KeyInfo, Opcode, P4};

/// A column read by an aggregate query
#[derive(Debug, Clone, PartialEq)]
pub struct AggInfoCol {
    pub table: Arc<Table>,
    pub cursor: Cursor,
    pub column: usize,
    /// Register holding the value for the current group
    pub i_mem: Reg,
    /// Column of the GROUP BY sorter record holding the value
    pub i_sorter_column: usize,
    /// The rewritten node, coded in direct mode to refresh `i_mem`
    pub expr: Expr,
}

/// An aggregate function call
#[derive(Debug, Clone, PartialEq)]
pub struct AggInfoFunc {
    pub call: FunctionCall,
    pub def: Option<Arc<FuncDef>>,
    /// Accumulator register
    pub i_mem: Reg,
    /// Ephemeral index deduplicating a DISTINCT argument, -1 if none
    pub i_distinct: Cursor,
}

impl AggInfoFunc {
    fn def_name(&self) -> String {
        self.def
            .as_ref()
            .map_or_else(|| self.call.name.clone(), |d| d.name.clone())
    }
}

/// Aggregate context of one select
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggInfo {
    /// Column nodes read the table (or sorter) instead of `i_mem`
    pub direct_mode: bool,
    /// Direct reads come from the sorter pseudo-table
    pub use_sorting_idx: bool,
    /// GROUP BY sorter cursor
    pub sorting_idx: Cursor,
    /// Pseudo-table cursor over the sorter output
    pub sorting_idx_ptab: Cursor,
    /// Number of columns in a GROUP BY sorter record
    pub n_sorting_column: usize,
    /// Columns below this position are copied into `i_mem` on each step
    pub n_accumulator: usize,
    /// First and last accumulator register
    pub mn_reg: Reg,
    pub mx_reg: Reg,
    pub columns: Vec<AggInfoCol>,
    pub funcs: Vec<AggInfoFunc>,
}

struct Collector<'a> {
    info: usize,
    src: &'a SrcList,
    group_by: Option<&'a ExprList>,
    agg: AggInfo,
}

impl Collector<'_> {
    fn add_column(&mut self, col: &ColumnRef) -> usize {
        if let Some(i) = self
            .agg
            .columns
            .iter()
            .position(|c| c.cursor == col.cursor && c.column == col.column)
        {
            return i;
        }
        let index = self.agg.columns.len();
        let sorter_pos = self.group_by.and_then(|gb| {
            gb.exprs().position(|e| {
                e.as_column()
                    .is_some_and(|c| c.cursor == col.cursor && c.column == col.column)
            })
        });
        let i_sorter_column = match sorter_pos {
            Some(j) => j,
            None => {
                self.agg.n_sorting_column += 1;
                self.agg.n_sorting_column - 1
            }
        };
        self.agg.columns.push(AggInfoCol {
            table: col.table.clone(),
            cursor: col.cursor,
            column: col.column,
            i_mem: 0,
            i_sorter_column,
            expr: Expr::new(ExprKind::AggColumn {
                col: col.clone(),
                info: self.info,
                index,
            }),
        });
        index
    }

    fn add_column_node(&mut self, expr: &mut Expr) -> bool {
        let col = match &expr.kind {
            ExprKind::Column(c) if self.src.find_cursor(c.cursor).is_some() => c.clone(),
            _ => return false,
        };
        let index = self.add_column(&col);
        let ty = expr.ty;
        let flags = expr.flags;
        *expr = Expr::new(ExprKind::AggColumn {
            col,
            info: self.info,
            index,
        });
        expr.ty = ty;
        expr.flags |= flags;
        true
    }

    /// First pass: columns outside aggregate calls and the calls themselves
    fn analyze(&mut self, expr: &mut Expr) -> Result<()> {
        if self.add_column_node(expr) {
            return Ok(());
        }
        if matches!(expr.kind, ExprKind::AggFunction { .. }) {
            let existing = self.agg.funcs.iter().position(|f| {
                let stored = Expr::new(ExprKind::AggFunction {
                    call: f.call.clone(),
                    info: self.info,
                    index: 0,
                });
                expr_compare(&stored, expr, -1) == 0
            });
            let info = self.info;
            let n_funcs = self.agg.funcs.len();
            if let ExprKind::AggFunction { call, info: slot_info, index } = &mut expr.kind {
                let slot = match existing {
                    Some(i) => i,
                    None => {
                        if call.distinct && call.args.len() != 1 {
                            return Err(Error::with_message(
                                ErrorCode::Error,
                                "DISTINCT aggregates must have exactly one argument",
                            ));
                        }
                        self.agg.funcs.push(AggInfoFunc {
                            call: call.clone(),
                            def: call.def.clone(),
                            i_mem: 0,
                            i_distinct: -1,
                        });
                        n_funcs
                    }
                };
                *slot_info = info;
                *index = slot;
            }
            return Ok(());
        }
        if expr.subselect().is_some() {
            return Ok(());
        }
        for child in expr.children_mut() {
            self.analyze(child)?;
        }
        Ok(())
    }

    /// Second pass: columns read by aggregate arguments
    fn analyze_args(&mut self, expr: &mut Expr) {
        if let ExprKind::AggFunction { call, info, index } = &mut expr.kind {
            if *info == self.info {
                for arg in &mut call.args {
                    self.columns_only(arg);
                }
                if let Some(f) = self.agg.funcs.get_mut(*index) {
                    f.call = call.clone();
                }
            }
            return;
        }
        if expr.subselect().is_some() {
            return;
        }
        for child in expr.children_mut() {
            self.analyze_args(child);
        }
    }

    fn columns_only(&mut self, expr: &mut Expr) {
        if self.add_column_node(expr) || expr.subselect().is_some() {
            return;
        }
        for child in expr.children_mut() {
            self.columns_only(child);
        }
    }
}

/// Collect the columns and aggregate calls of `select`'s result list,
/// ORDER BY and HAVING into a new aggregate context and assign their
/// registers. Returns the context id.
pub fn analyze_aggregates(parse: &mut Parse, select: &mut Select) -> Result<usize> {
    let info = parse.aggs.len();
    let src = select.src.clone();
    let group_by = select.group_by.clone();
    let mut c = Collector {
        info,
        src: &src,
        group_by: group_by.as_ref(),
        agg: AggInfo {
            n_sorting_column: group_by.as_ref().map_or(0, |g| g.len()),
            sorting_idx: -1,
            sorting_idx_ptab: -1,
            ..AggInfo::default()
        },
    };
    for expr in select.elist.exprs_mut() {
        c.analyze(expr)?;
    }
    if let Some(ob) = select.order_by.as_mut() {
        for expr in ob.exprs_mut() {
            c.analyze(expr)?;
        }
    }
    if let Some(having) = select.having.as_deref_mut() {
        c.analyze(having)?;
    }
    c.agg.n_accumulator = c.agg.columns.len();
    for expr in select.elist.exprs_mut() {
        c.analyze_args(expr);
    }
    if let Some(ob) = select.order_by.as_mut() {
        for expr in ob.exprs_mut() {
            c.analyze_args(expr);
        }
    }
    if let Some(having) = select.having.as_deref_mut() {
        c.analyze_args(having);
    }

    let mut agg = c.agg;
    agg.mn_reg = parse.n_mem + 1;
    for col in &mut agg.columns {
        col.i_mem = parse.alloc_reg();
    }
    for func in &mut agg.funcs {
        func.i_mem = parse.alloc_reg();
        if func.call.distinct {
            func.i_distinct = parse.alloc_cursor();
        }
    }
    agg.mx_reg = parse.n_mem;
    parse.aggs.push(agg);
    Ok(info)
}

/// NULL every accumulator and open the DISTINCT indexes
pub fn reset_accumulator(parse: &mut Parse, info: usize) -> Result<()> {
    let agg = parse
        .aggs
        .get(info)
        .cloned()
        .ok_or_else(|| Error::internal("no aggregate context"))?;
    if agg.mx_reg < agg.mn_reg {
        return Ok(());
    }
    parse.vdbe.add_op(Opcode::Null, 0, agg.mn_reg, agg.mx_reg);
    for func in agg.funcs.iter().filter(|f| f.i_distinct >= 0) {
        let mut key = KeyInfo::new(1);
        if let Some(arg) = func.call.args.first() {
            let coll = expr_coll(arg)?;
            key.parts[0].coll_id = coll.id;
        }
        parse.vdbe.add_op4(
            Opcode::OpenEphemeral,
            func.i_distinct,
            1,
            0,
            P4::KeyInfo(Arc::new(key)),
        );
        parse
            .vdbe
            .comment(format!("distinct {}()", func.def_name()));
    }
    Ok(())
}

/// Feed the current row to every accumulator and refresh the copies of the
/// bare columns
pub fn update_accumulator(parse: &mut Parse, info: usize) -> Result<()> {
    let agg = parse
        .aggs
        .get_mut(info)
        .ok_or_else(|| Error::internal("no aggregate context"))?;
    agg.direct_mode = true;
    let funcs = agg.funcs.clone();
    let columns: Vec<AggInfoCol> = agg.columns[..agg.n_accumulator].to_vec();

    for func in &funcs {
        let args = ExprList::from_exprs(func.call.args.clone());
        let n_arg = args.len() as i32;
        let reg_agg = if n_arg > 0 {
            let r = parse.get_temp_range(n_arg);
            parse.expr_code_expr_list(&args, r, 0, CodeListFlags::DUP)?;
            r
        } else {
            0
        };
        let mut addr_next = None;
        if func.i_distinct >= 0 {
            let label = parse.make_label();
            code_distinct(parse, func.i_distinct, label, 1, reg_agg);
            addr_next = Some(label);
        }
        let needs_coll = func
            .def
            .as_ref()
            .is_some_and(|d| d.flags.contains(FuncFlags::NEEDCOLL));
        if needs_coll {
            let mut coll = COLL_NONE;
            for arg in &func.call.args {
                coll = expr_coll(arg)?.id;
                if coll != COLL_NONE {
                    break;
                }
            }
            parse
                .vdbe
                .add_op4(Opcode::CollSeq, 0, 0, 0, P4::Collation(coll));
        }
        parse.vdbe.add_op4(
            Opcode::AggStep,
            n_arg,
            reg_agg,
            func.i_mem,
            P4::FuncDef(func.def_name(), n_arg as usize),
        );
        if n_arg > 0 {
            parse.release_temp_range(reg_agg, n_arg);
        }
        if let Some(label) = addr_next {
            parse.resolve_label(label);
            parse.cache_clear();
        }
    }

    for col in &columns {
        parse.expr_code(&col.expr, col.i_mem)?;
    }
    if let Some(agg) = parse.aggs.get_mut(info) {
        agg.direct_mode = false;
    }
    parse.cache_clear();
    Ok(())
}

/// Compute the final value of every aggregate
pub fn finalize_agg_functions(parse: &mut Parse, info: usize) -> Result<()> {
    let funcs = parse
        .aggs
        .get(info)
        .map(|a| a.funcs.clone())
        .ok_or_else(|| Error::internal("no aggregate context"))?;
    for func in &funcs {
        parse.vdbe.add_op4(
            Opcode::AggFinal,
            func.i_mem,
            func.call.args.len() as i32,
            0,
            P4::FuncDef(func.def_name(), func.call.args.len()),
        );
    }
    Ok(())
}

/// Skip to `addr_repeat` when the `n` registers at `reg` were already
/// seen by ephemeral index `cursor`; otherwise remember them.
pub fn code_distinct(parse: &mut Parse, cursor: Cursor, addr_repeat: i32, n: i32, reg: Reg) {
    let r1 = parse.get_temp_reg();
    parse
        .vdbe
        .add_op4(Opcode::Found, cursor, addr_repeat, reg, P4::Int64(n as i64));
    parse.vdbe.add_op(Opcode::MakeRecord, reg, n, r1);
    parse.vdbe.add_op2(Opcode::IdxInsert, cursor, r1);
    parse.release_temp_reg(r1);
}

/// `SELECT count(*) FROM t` with nothing else: the table can answer from
/// its primary index without a scan
pub fn is_simple_count(select: &Select, agg: &AggInfo) -> Option<Arc<Table>> {
    if select.where_clause.is_some()
        || select.group_by.is_some()
        || select.elist.len() != 1
        || select.src.len() != 1
    {
        return None;
    }
    let item = &select.src.items[0];
    if item.select.is_some() {
        return None;
    }
    let table = item.table.clone()?;
    if table.is_view {
        return None;
    }
    let func = match &select.elist.items[0].expr.kind {
        ExprKind::AggFunction { call, .. } => call,
        _ => return None,
    };
    if agg.funcs.is_empty() || func.distinct || !func.args.is_empty() {
        return None;
    }
    if !func.name.eq_ignore_ascii_case("count") {
        return None;
    }
    Some(table)
}

/// When the only aggregate is min() or max() of a plain column, the loop
/// can stop at the first row of a suitably ordered scan. Returns the scan
/// hint and the order it asks for.
pub fn min_max_query(agg: &AggInfo) -> Option<(WhereFlags, ExprList)> {
    let [func] = agg.funcs.as_slice() else {
        return None;
    };
    let [arg] = func.call.args.as_slice() else {
        return None;
    };
    let col = match &arg.kind {
        ExprKind::AggColumn { col, .. } => col,
        _ => return None,
    };
    let name = func.call.name.to_ascii_lowercase();
    let (flags, order) = match name.as_str() {
        "min" => (WhereFlags::ORDERBY_MIN, SortOrder::Asc),
        "max" => (WhereFlags::ORDERBY_MAX, SortOrder::Desc),
        _ => return None,
    };
    let mut list = ExprList::new();
    list.push_sorted(Expr::new(ExprKind::Column(col.clone())), order);
    Some((flags, list))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompileConfig;
    use crate::parser::ast::SrcItem;
    use crate::schema::Column;
    use crate::types::FieldType;

    fn table() -> Arc<Table> {
        Arc::new(Table::new(
            "t",
            vec![
                Column::new("a", FieldType::Integer),
                Column::new("b", FieldType::Integer),
            ],
        ))
    }

    fn select(elist: Vec<Expr>) -> Select {
        Select::new(
            ExprList::from_exprs(elist),
            SrcList::single(SrcItem::table(table(), 0)),
            None,
        )
    }

    #[test]
    fn test_analyze_dedups_functions_and_columns() {
        let t = table();
        let sum = Expr::function("sum", vec![Expr::column(&t, 0, 1)], false);
        let mut s = select(vec![Expr::column(&t, 0, 0), sum.clone(), sum]);
        let mut parse = Parse::new(CompileConfig::default());
        let info = analyze_aggregates(&mut parse, &mut s).unwrap();
        let agg = &parse.aggs[info];
        assert_eq!(agg.funcs.len(), 1);
        assert_eq!(agg.columns.len(), 2);
        assert_eq!(agg.n_accumulator, 1);
        assert!(matches!(
            s.elist.items[0].expr.kind,
            ExprKind::AggColumn { index: 0, .. }
        ));
        assert!(matches!(
            s.elist.items[2].expr.kind,
            ExprKind::AggFunction { index: 0, .. }
        ));
        assert_eq!(agg.mx_reg - agg.mn_reg + 1, 3);
    }

    #[test]
    fn test_group_by_column_shares_sorter_slot() {
        let t = table();
        let mut s = select(vec![
            Expr::column(&t, 0, 1),
            Expr::function("count", vec![Expr::column(&t, 0, 0)], false),
        ]);
        s.group_by = Some(ExprList::from_exprs(vec![Expr::column(&t, 0, 1)]));
        let mut parse = Parse::new(CompileConfig::default());
        let info = analyze_aggregates(&mut parse, &mut s).unwrap();
        let agg = &parse.aggs[info];
        assert_eq!(agg.columns[0].i_sorter_column, 0);
        assert_eq!(agg.columns[1].i_sorter_column, 1);
        assert_eq!(agg.n_sorting_column, 2);
    }

    #[test]
    fn test_distinct_aggregate_needs_one_argument() {
        let t = table();
        let mut s = select(vec![Expr::function(
            "group_concat",
            vec![Expr::column(&t, 0, 0), Expr::string(",")],
            true,
        )]);
        assert!(matches!(s.elist.items[0].expr.kind, ExprKind::AggFunction { .. }));
        let mut parse = Parse::new(CompileConfig::default());
        let err = analyze_aggregates(&mut parse, &mut s).unwrap_err();
        assert!(err.to_string().contains("exactly one argument"));
    }

    #[test]
    fn test_simple_count_and_min_max_detection() {
        let t = table();
        let mut s = select(vec![Expr::function("count", vec![], false)]);
        let mut parse = Parse::new(CompileConfig::default());
        let info = analyze_aggregates(&mut parse, &mut s).unwrap();
        assert!(is_simple_count(&s, &parse.aggs[info]).is_some());
        assert!(min_max_query(&parse.aggs[info]).is_none());

        let mut s = select(vec![Expr::function("max", vec![Expr::column(&t, 0, 0)], false)]);
        let info = analyze_aggregates(&mut parse, &mut s).unwrap();
        assert!(is_simple_count(&s, &parse.aggs[info]).is_none());
        let (flags, list) = min_max_query(&parse.aggs[info]).unwrap();
        assert_eq!(flags, WhereFlags::ORDERBY_MAX);
        assert!(list.items[0].sort_order.is_desc());
        assert!(list.items[0].expr.as_column().is_some());
    }

    #[test]
    fn test_update_accumulator_emits_step_per_function() {
        let t = table();
        let mut s = select(vec![
            Expr::function("sum", vec![Expr::column(&t, 0, 0)], false),
            Expr::function("count", vec![Expr::column(&t, 0, 1)], true),
        ]);
        let mut parse = Parse::new(CompileConfig::default());
        let info = analyze_aggregates(&mut parse, &mut s).unwrap();
        reset_accumulator(&mut parse, info).unwrap();
        update_accumulator(&mut parse, info).unwrap();
        finalize_agg_functions(&mut parse, info).unwrap();
        assert!(!parse.aggs[info].direct_mode);
        let program = parse.finish().unwrap();
        assert_eq!(program.count(Opcode::AggStep), 2);
        assert_eq!(program.count(Opcode::AggFinal), 2);
        assert_eq!(program.count(Opcode::Found), 1);
        assert_eq!(program.count(Opcode::OpenEphemeral), 1);
    }
}
