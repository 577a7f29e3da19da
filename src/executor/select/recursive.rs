//! Recursive common table expressions
//!
//! A recursive CTE arrives as a two-branch compound: the setup query on
//! the left and, on the right, the recursive query whose FROM clause holds
//! exactly one item flagged [`SrcItemFlags::RECURSIVE`]. The setup rows
//! seed a queue. Each turn of the loop takes one row off the queue, emits
//! it, and runs the recursive query with that single row standing in for
//! the recursive item; whatever it produces goes back onto the queue. The
//! loop ends when the queue is empty or the LIMIT is reached.
//!
//! Without an ORDER BY the queue is a FIFO. With one, it is an index on the
//! ORDER BY key and the smallest entry is taken first. UNION keeps a second
//! index of every row ever queued so no row is queued twice.

use std::sync::Arc;

use tracing::{debug, instrument, Level};

use crate::error::{Error, ErrorCode, Result};
use crate::executor::expr::collate::expr_coll;
use crate::executor::expr::types::expr_type;
use crate::executor::parse::Parse;
use crate::executor::select::compound::{
    multi_select_coll_seq, patch_ephemeral_keys, resolve_compound_order_by,
};
use crate::executor::select::inner::{
    code_offset, compute_limit_registers, key_info_from_expr_list, select_inner_loop,
};
use crate::executor::select::sql_select;
use crate::executor::select::types::{SelectDest, SelectDestKind};
use crate::parser::ast::{CompoundOp, Expr, ExprFlags, ExprList, Select, SelectFlags, SrcItemFlags};
use crate::schema::collation::collation_name;
use crate::schema::COLL_NONE;
use crate::types::{Cursor, FieldType, Reg};
use crate::vdbe::ops::{KeyInfo, KeyPart, Opcode, P4};

fn key_type(expr: &Expr) -> FieldType {
    match expr_type(expr) {
        FieldType::Any => FieldType::Scalar,
        ty => ty,
    }
}

/// Key of the ordered queue: the ORDER BY terms, then a sequence number
/// and the row blob. Terms without an explicit collation get the compound
/// collation of their column attached.
fn queue_key(parse: &mut Parse, p: &Select, order_by: &mut ExprList) -> Result<KeyInfo> {
    let mut parts = Vec::with_capacity(order_by.len() + 2);
    for item in order_by.items.iter_mut() {
        let coll_id = if item.expr.has_flag(ExprFlags::COLLATE) {
            expr_coll(&item.expr).map_err(|e| parse.set_error(e))?.id
        } else {
            let col = (item.order_by_col as usize).saturating_sub(1);
            let id = multi_select_coll_seq(parse, p, col)?;
            if id != COLL_NONE {
                if let Some(name) = collation_name(id) {
                    let term = std::mem::replace(&mut item.expr, Expr::null());
                    item.expr = Expr::collate(term, name);
                }
            }
            id
        };
        parts.push(KeyPart {
            coll_id,
            sort_order: item.sort_order,
            field_type: key_type(&item.expr),
        });
    }
    for field_type in [FieldType::Integer, FieldType::Varbinary] {
        parts.push(KeyPart {
            field_type,
            ..KeyPart::default()
        });
    }
    Ok(KeyInfo { parts })
}

/// Key of the FIFO queue: the result columns followed by the row id
fn fifo_key(p: &Select) -> Result<KeyInfo> {
    let mut key = key_info_from_expr_list(&p.elist, 0, 1)?;
    for (part, item) in key.parts.iter_mut().zip(p.elist.items.iter()) {
        part.field_type = key_type(&item.expr);
    }
    if let Some(last) = key.parts.last_mut() {
        last.field_type = FieldType::Integer;
    }
    Ok(key)
}

/// Code the recursive compound `p` (the recursive query, with the setup
/// query as its `prior`), sending the rows to `dest`.
#[instrument(skip_all, level = Level::DEBUG, fields(select = p.id))]
pub(crate) fn generate_with_recursive_query(
    parse: &mut Parse,
    p: &mut Select,
    dest: &mut SelectDest,
) -> Result<()> {
    if !matches!(p.op, CompoundOp::Union | CompoundOp::UnionAll) {
        return Err(parse.set_error(Error::internal(
            "recursive query must be a UNION or UNION ALL",
        )));
    }
    if p.has_flag(SelectFlags::AGGREGATE) {
        return Err(parse.set_error(Error::with_message(
            ErrorCode::Error,
            "recursive aggregate queries are not supported",
        )));
    }
    let i_current = p
        .src
        .items
        .iter()
        .find(|item| item.fg.contains(SrcItemFlags::RECURSIVE))
        .map(|item| item.cursor)
        .ok_or_else(|| parse.set_error(Error::internal("recursive query without its table")))?;
    if p.order_by.is_some() {
        resolve_compound_order_by(parse, p)?;
    }

    let addr_break = parse.make_label();
    compute_limit_registers(parse, p, addr_break)?;
    let limit = p.limit.take();
    let offset = p.offset.take();
    let reg_limit = p.i_limit;
    let reg_offset = p.i_offset;
    p.i_limit = 0;
    p.i_offset = 0;
    let order_by = p.order_by.take();

    let res = code_recursive_loop(
        parse,
        p,
        dest,
        RecursiveRegs {
            i_current,
            reg_limit,
            reg_offset,
            addr_break,
        },
        order_by.clone(),
    );

    p.order_by = order_by;
    p.limit = limit;
    p.offset = offset;
    res
}

struct RecursiveRegs {
    i_current: Cursor,
    reg_limit: Reg,
    reg_offset: Reg,
    addr_break: i32,
}

fn code_recursive_loop(
    parse: &mut Parse,
    p: &mut Select,
    dest: &mut SelectDest,
    regs: RecursiveRegs,
    mut order_by: Option<ExprList>,
) -> Result<()> {
    let n_col = p.elist.len() as i32;

    // the distinct index must sit right after the queue
    let i_queue = parse.alloc_cursor();
    let kind = match (p.op, order_by.is_some()) {
        (CompoundOp::Union, true) => SelectDestKind::DistQueue,
        (CompoundOp::Union, false) => SelectDestKind::DistFifo,
        (_, true) => SelectDestKind::Queue,
        (_, false) => SelectDestKind::Fifo,
    };
    let i_distinct = if p.op == CompoundOp::Union {
        Some(parse.alloc_cursor())
    } else {
        None
    };
    debug!(queue = i_queue, ?kind, "recursive query");

    let reg_current = parse.alloc_reg();
    parse
        .vdbe
        .add_op(Opcode::OpenPseudo, regs.i_current, reg_current, n_col);
    let n_key_cols;
    match order_by.as_mut() {
        Some(ob) => {
            let key = queue_key(parse, p, ob)?;
            n_key_cols = ob.len() as i32;
            parse.vdbe.add_op4(
                Opcode::OpenEphemeral,
                i_queue,
                n_key_cols + 2,
                0,
                P4::KeyInfo(Arc::new(key)),
            );
            parse.vdbe.comment("Orderby table");
        }
        None => {
            n_key_cols = 0;
            let key = fifo_key(p)?;
            parse.vdbe.add_op4(
                Opcode::OpenEphemeral,
                i_queue,
                n_col + 1,
                0,
                P4::KeyInfo(Arc::new(key)),
            );
            parse.vdbe.comment("Queue table");
        }
    }
    if let Some(cursor) = i_distinct {
        let addr = parse.vdbe.add_op2(Opcode::OpenEphemeral, cursor, 0);
        parse.vdbe.comment("Distinct table");
        p.addr_open_ephm[0] = Some(addr);
        p.flags |= SelectFlags::USES_EPHEMERAL;
    }
    let mut dest_queue = SelectDest::new(kind, i_queue);
    dest_queue.order_by = order_by;

    // setup rows seed the queue
    let mut setup = p
        .prior
        .take()
        .ok_or_else(|| parse.set_error(Error::internal("recursive query without a setup query")))?;
    let res = sql_select(parse, &mut setup, &mut dest_queue);
    p.prior = Some(setup);
    res?;

    // move the next queued row into the current table and emit it
    let addr_top = parse.vdbe.add_op2(Opcode::Rewind, i_queue, regs.addr_break);
    parse.vdbe.add_op1(Opcode::NullRow, regs.i_current);
    if dest_queue.order_by.is_some() {
        parse
            .vdbe
            .add_op(Opcode::Column, i_queue, n_key_cols + 1, reg_current);
    } else {
        parse.vdbe.add_op2(Opcode::RowData, i_queue, reg_current);
    }
    parse.vdbe.add_op1(Opcode::Delete, i_queue);
    parse.cache_clear();

    let addr_cont = parse.make_label();
    code_offset(parse, regs.reg_offset, addr_cont);
    select_inner_loop(
        parse,
        p,
        regs.i_current,
        None,
        None,
        dest,
        addr_cont,
        regs.addr_break,
    )?;
    if regs.reg_limit != 0 {
        parse
            .vdbe
            .add_op2(Opcode::DecrJumpZero, regs.reg_limit, regs.addr_break);
    }
    parse.resolve_label(addr_cont);

    // the recursive step feeds the queue
    let setup = p.prior.take();
    let res = sql_select(parse, p, &mut dest_queue);
    p.prior = setup;
    res?;

    parse.vdbe.add_op2(Opcode::Goto, 0, addr_top);
    parse.resolve_label(regs.addr_break);
    if p.has_flag(SelectFlags::USES_EPHEMERAL) {
        patch_ephemeral_keys(parse, p)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompileConfig;
    use crate::executor::select::compile_select;
    use crate::parser::ast::{BinaryOp, SrcItem, SrcList};
    use crate::schema::{Column, Table};
    use crate::types::SortOrder;
    use crate::vdbe::builder::Program;

    /// cnt(x) AS (SELECT 1 UNION [ALL] SELECT x+1 FROM cnt WHERE x < 10)
    fn counter(op: CompoundOp) -> (Select, Arc<Table>) {
        let cnt = Arc::new(Table::new("cnt", vec![Column::new("x", FieldType::Integer)]));
        let setup = Select::new(ExprList::from_exprs(vec![Expr::int(1)]), SrcList::new(), None);
        let mut item = SrcItem::table(cnt.clone(), 0);
        item.fg |= SrcItemFlags::RECURSIVE;
        let mut step = Select::new(
            ExprList::from_exprs(vec![Expr::binary(
                BinaryOp::Add,
                Expr::column(&cnt, 0, 0),
                Expr::int(1),
            )]),
            SrcList::single(item),
            Some(Expr::binary(BinaryOp::Lt, Expr::column(&cnt, 0, 0), Expr::int(10))),
        );
        step.op = op;
        step.prior = Some(Box::new(setup));
        step.flags |= SelectFlags::RECURSIVE;
        (step, cnt)
    }

    fn compile(p: &Select) -> Program {
        compile_select(p, CompileConfig::default()).unwrap()
    }

    #[test]
    fn test_union_all_uses_fifo_queue() {
        let (p, _) = counter(CompoundOp::UnionAll);
        let program = compile(&p);
        assert_eq!(program.count(Opcode::OpenPseudo), 1);
        assert_eq!(program.count(Opcode::OpenEphemeral), 1);
        assert!(!program.contains(Opcode::OpenRead));
        assert!(!program.contains(Opcode::Found));
        let top = program.position(Opcode::RowData).unwrap();
        assert_eq!(program.ops[top - 2].opcode, Opcode::Rewind);
        assert_eq!(program.ops[top - 1].opcode, Opcode::NullRow);
        assert_eq!(program.ops[top + 1].opcode, Opcode::Delete);
        // setup row, then one row per turn of the loop
        assert_eq!(program.count(Opcode::NextIdEphemeral), 2);
        assert_eq!(program.count(Opcode::ResultRow), 1);
        let back = program
            .ops
            .iter()
            .rposition(|op| op.opcode == Opcode::Goto && op.p2 == (top - 2) as i32);
        assert!(back.is_some());
    }

    #[test]
    fn test_union_skips_rows_already_queued() {
        let (p, _) = counter(CompoundOp::Union);
        let program = compile(&p);
        assert_eq!(program.count(Opcode::OpenEphemeral), 2);
        assert_eq!(program.count(Opcode::Found), 2);
        let distinct = program.ops_with(Opcode::OpenEphemeral)[1];
        assert_eq!(distinct.p2, 1);
        assert!(matches!(&distinct.p4, P4::KeyInfo(k) if k.len() == 1));
        let queue = program.ops_with(Opcode::OpenEphemeral)[0];
        assert_eq!(distinct.p1, queue.p1 + 1);
    }

    #[test]
    fn test_order_by_keeps_queue_sorted() {
        let (mut p, cnt) = counter(CompoundOp::UnionAll);
        let mut ob = ExprList::new();
        ob.push_sorted(
            Expr::binary(BinaryOp::Add, Expr::column(&cnt, 0, 0), Expr::int(1)),
            SortOrder::Desc,
        );
        p.order_by = Some(ob);
        let program = compile(&p);
        let queue = program.ops_with(Opcode::OpenEphemeral)[0];
        assert_eq!(queue.p2, 3);
        match &queue.p4 {
            P4::KeyInfo(k) => {
                assert!(k.parts[0].sort_order.is_desc());
                assert_eq!(k.parts[1].field_type, FieldType::Integer);
                assert_eq!(k.parts[2].field_type, FieldType::Varbinary);
            }
            other => panic!("unexpected p4 {:?}", other),
        }
        assert_eq!(program.count(Opcode::Sequence), 2);
        assert!(!program.contains(Opcode::RowData));
        assert!(!program.contains(Opcode::InitCoroutine));
        assert!(p.order_by.is_some());
    }

    #[test]
    fn test_limit_and_offset_apply_to_emitted_rows() {
        let (mut p, _) = counter(CompoundOp::UnionAll);
        p.limit = Some(Box::new(Expr::int(5)));
        p.offset = Some(Box::new(Expr::int(2)));
        let program = compile(&p);
        let emit = program.position(Opcode::ResultRow).unwrap();
        assert_eq!(program.ops[emit + 1].opcode, Opcode::DecrJumpZero);
        let offset = program.position(Opcode::IfPos).unwrap();
        assert!(offset < emit);
        assert!(offset > program.position(Opcode::Delete).unwrap());
    }

    #[test]
    fn test_recursive_aggregate_is_rejected() {
        let (mut p, cnt) = counter(CompoundOp::UnionAll);
        p.elist = ExprList::from_exprs(vec![Expr::function(
            "max",
            vec![Expr::column(&cnt, 0, 0)],
            false,
        )]);
        let err = compile_select(&p, CompileConfig::default()).unwrap_err();
        assert!(err.to_string().contains("recursive aggregate"));
    }

    #[test]
    fn test_intersect_is_not_recursive() {
        let (p, _) = counter(CompoundOp::Intersect);
        let err = compile_select(&p, CompileConfig::default()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
    }
}
