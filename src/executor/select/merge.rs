//! Compound SELECT with ORDER BY, coded as a merge of two co-routines
//!
//! Each side of the operator runs as a co-routine producing rows sorted on
//! the ORDER BY. The driver compares the current row of both sides and
//! decides, per operator, which side to output and which to advance:
//!
//! ```text
//!              A < B          A == B         A > B
//! UNION ALL    out A, next A  out A, next A  out B, next B
//! UNION        out A, next A  next A         out B, next B
//! EXCEPT       out A, next A  next A         next B
//! INTERSECT    next A         out A, next A  next B
//! ```
//!
//! Duplicate suppression for the set operators compares every output row
//! with the previous one.

use std::sync::Arc;

use tracing::{debug, instrument, Level};

use crate::error::{Error, ErrorCode, Result};
use crate::executor::expr::collate::expr_coll;
use crate::executor::parse::Parse;
use crate::executor::select::compound::{
    compound_key_info, multi_select_coll_seq, resolve_compound_order_by,
};
use crate::executor::select::inner::{
    code_offset, code_queue_insert, compute_limit_registers, generate_column_metadata,
    insert_ephemeral_row,
};
use crate::executor::select::sql_select;
use crate::executor::select::types::{SelectDest, SelectDestKind};
use crate::parser::ast::{CompoundOp, Expr, ExprFlags, ExprKind, ExprList, Select};
use crate::schema::collation::collation_name;
use crate::schema::COLL_NONE;
use crate::types::Reg;
use crate::vdbe::ops::{cmp_flags, KeyInfo, KeyPart, Opcode, P4};

/// Replace every ORDER BY term that refers to a result column by a copy of
/// that column's expression, keeping an explicit COLLATE on top
fn resolve_order_by_aliases(parse: &mut Parse, s: &mut Select) -> Result<()> {
    let Some(order_by) = s.order_by.as_mut() else {
        return Ok(());
    };
    let n = s.elist.len();
    for (i, item) in order_by.items.iter_mut().enumerate() {
        let k = item.order_by_col as usize;
        if k == 0 {
            continue;
        }
        if k > n {
            return Err(parse.set_error(Error::with_message(
                ErrorCode::Syntax,
                format!(
                    "Error at ORDER BY in place {}: term out of range - should be between 1 and {}",
                    i + 1,
                    n
                ),
            )));
        }
        let dup = s.elist.items[k - 1].expr.clone();
        item.expr = match &item.expr.kind {
            ExprKind::Collate { collation, .. } => Expr::collate(dup, collation.clone()),
            _ => dup,
        };
    }
    Ok(())
}

/// Make the ORDER BY cover every result column and build the key the
/// merge compares rows with. Terms without an explicit collation get the
/// compound collation of their column attached.
fn merge_order_by(parse: &mut Parse, p: &Select) -> Result<(ExprList, KeyInfo)> {
    let n_col = p.elist.len();
    let mut order_by = p.order_by.clone().unwrap_or_default();
    if p.op != CompoundOp::UnionAll {
        for i in 1..=n_col {
            if !order_by.items.iter().any(|t| t.order_by_col as usize == i) {
                order_by.push(Expr::int(i as i64)).order_by_col = i as u16;
            }
        }
    }
    for (i, item) in order_by.items.iter().enumerate() {
        let k = item.order_by_col as usize;
        if k == 0 || k > n_col {
            return Err(parse.set_error(Error::with_message(
                ErrorCode::Syntax,
                format!(
                    "Error at ORDER BY in place {}: term out of range - should be between 1 and {}",
                    i + 1,
                    n_col
                ),
            )));
        }
    }

    let mut parts = Vec::with_capacity(order_by.len() + 1);
    for item in order_by.items.iter_mut() {
        let coll_id = if item.expr.has_flag(ExprFlags::COLLATE) {
            expr_coll(&item.expr).map_err(|e| parse.set_error(e))?.id
        } else {
            let id = multi_select_coll_seq(parse, p, item.order_by_col as usize - 1)?;
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
            ..KeyPart::default()
        });
    }
    Ok((order_by, KeyInfo { parts }.with_extra(1)))
}

/// Code a subroutine that hands the row in `input`'s registers to `dest`.
/// With `reg_prev` non-zero, a row equal to the previous one (compared
/// with `key`) is skipped. Returns the entry address.
#[allow(clippy::too_many_arguments)]
pub(crate) fn generate_output_subroutine(
    parse: &mut Parse,
    p: &Select,
    input: &SelectDest,
    dest: &mut SelectDest,
    reg_ret: Reg,
    reg_prev: Reg,
    key: Option<Arc<KeyInfo>>,
    break_addr: i32,
) -> Result<i32> {
    let addr = parse.vdbe.current_addr();
    let i_continue = parse.make_label();

    if reg_prev != 0 {
        let addr1 = parse.vdbe.add_op1(Opcode::IfNot, reg_prev);
        let p4 = key.map_or(P4::Unused, P4::KeyInfo);
        let addr2 = parse
            .vdbe
            .add_op4(Opcode::Compare, input.sdst, reg_prev + 1, input.n_sdst, p4);
        parse
            .vdbe
            .add_op(Opcode::Jump, addr2 + 2, i_continue, addr2 + 2);
        parse.vdbe.jump_here(addr1);
        parse
            .vdbe
            .add_op(Opcode::Copy, input.sdst, reg_prev + 1, input.n_sdst - 1);
        parse.vdbe.add_op2(Opcode::Bool, 1, reg_prev);
    }

    code_offset(parse, p.i_offset, i_continue);

    match dest.kind {
        SelectDestKind::EphemTab | SelectDestKind::Table => {
            insert_ephemeral_row(parse, dest.parm, input.sdst, input.n_sdst);
        }
        SelectDestKind::Set => {
            let r1 = parse.get_temp_reg();
            parse.vdbe.add_op4(
                Opcode::MakeRecord,
                input.sdst,
                input.n_sdst,
                r1,
                P4::Types(dest.dest_type.clone()),
            );
            parse.cache_affinity_change(input.sdst, input.n_sdst);
            parse.vdbe.add_op2(Opcode::IdxInsert, dest.parm, r1);
            parse.release_temp_reg(r1);
        }
        SelectDestKind::Mem => {
            if dest.sdst == 0 {
                dest.sdst = parse.alloc_regs(input.n_sdst);
                dest.n_sdst = input.n_sdst;
            }
            parse.expr_code_move(input.sdst, dest.sdst, input.n_sdst);
        }
        SelectDestKind::Coroutine => {
            if dest.sdst == 0 {
                dest.sdst = parse.get_temp_range(input.n_sdst);
                dest.n_sdst = input.n_sdst;
            }
            parse.expr_code_move(input.sdst, dest.sdst, input.n_sdst);
            parse.vdbe.add_op1(Opcode::Yield, dest.parm);
        }
        SelectDestKind::Output => {
            parse
                .vdbe
                .add_op2(Opcode::ResultRow, input.sdst, input.n_sdst);
            parse.cache_affinity_change(input.sdst, input.n_sdst);
        }
        SelectDestKind::Exists => {
            parse.vdbe.add_op2(Opcode::Bool, 1, dest.parm);
        }
        SelectDestKind::Discard => {}
        SelectDestKind::Fifo
        | SelectDestKind::DistFifo
        | SelectDestKind::Queue
        | SelectDestKind::DistQueue => {
            code_queue_insert(parse, dest, input.sdst, input.n_sdst)?;
        }
        SelectDestKind::Union | SelectDestKind::Except => {
            return Err(parse.set_error(Error::internal(
                "merge output into a set-operation table",
            )));
        }
    }

    if p.i_limit != 0 {
        parse
            .vdbe
            .add_op2(Opcode::DecrJumpZero, p.i_limit, break_addr);
    }
    parse.resolve_label(i_continue);
    parse.vdbe.add_op1(Opcode::Return, reg_ret);
    Ok(addr)
}

/// Code a compound select that has an ORDER BY as a merge of its two
/// sides. The left side may itself be a compound.
#[instrument(skip_all, level = Level::DEBUG)]
pub(crate) fn multi_select_order_by(
    parse: &mut Parse,
    p: &mut Select,
    dest: &mut SelectDest,
) -> Result<()> {
    let op = p.op;
    let label_end = parse.make_label();
    let label_cmpr = parse.make_label();
    resolve_compound_order_by(parse, p)?;

    let (order_by, key_merge) = merge_order_by(parse, p)?;
    let n_order_by = order_by.len();
    let permute: Vec<u32> = order_by
        .items
        .iter()
        .map(|item| u32::from(item.order_by_col) - 1)
        .collect();
    let key_merge = Arc::new(key_merge);

    let mut prior = p
        .prior
        .take()
        .ok_or_else(|| Error::internal("compound select without a prior"))?;
    prior.order_by = Some(order_by.clone());
    p.order_by = Some(order_by);
    let res = merge_sides(
        parse,
        p,
        &mut prior,
        dest,
        MergeLabels {
            end: label_end,
            cmpr: label_cmpr,
        },
        permute,
        key_merge,
        n_order_by,
    );
    p.prior = Some(prior);
    res?;
    debug!(op = op.name(), n_order_by, "merge compound coded");
    Ok(())
}

struct MergeLabels {
    end: i32,
    cmpr: i32,
}

#[allow(clippy::too_many_arguments)]
fn merge_sides(
    parse: &mut Parse,
    p: &mut Select,
    prior: &mut Select,
    dest: &mut SelectDest,
    labels: MergeLabels,
    permute: Vec<u32>,
    key_merge: Arc<KeyInfo>,
    n_order_by: usize,
) -> Result<()> {
    let op = p.op;
    let n_col = p.elist.len() as i32;

    let (reg_prev, key_dup) = if op == CompoundOp::UnionAll {
        (0, None)
    } else {
        let reg_prev = parse.alloc_regs(n_col + 1);
        parse.vdbe.add_op2(Opcode::Bool, 0, reg_prev);
        (reg_prev, Some(Arc::new(compound_key_info(parse, p)?)))
    };

    resolve_order_by_aliases(parse, p)?;
    if prior.prior.is_none() {
        resolve_order_by_aliases(parse, prior)?;
    }

    compute_limit_registers(parse, p, labels.end)?;
    let (reg_limit_a, reg_limit_b) = if p.i_limit != 0 && op == CompoundOp::UnionAll {
        let a = parse.alloc_reg();
        let b = parse.alloc_reg();
        let src = if p.i_offset != 0 {
            p.i_offset + 1
        } else {
            p.i_limit
        };
        parse.vdbe.add_op2(Opcode::Copy, src, a);
        parse.vdbe.add_op2(Opcode::Copy, a, b);
        (a, b)
    } else {
        (0, 0)
    };
    let limit = p.limit.take();
    let offset = p.offset.take();

    let reg_addr_a = parse.alloc_reg();
    let reg_addr_b = parse.alloc_reg();
    let reg_out_a = parse.alloc_reg();
    let reg_out_b = parse.alloc_reg();
    let mut dest_a = SelectDest::new(SelectDestKind::Coroutine, reg_addr_a);
    let mut dest_b = SelectDest::new(SelectDestKind::Coroutine, reg_addr_b);

    let res = (|| -> Result<()> {
        let top = parse.vdbe.current_addr() + 1;
        let addr1 = parse.vdbe.add_op(Opcode::InitCoroutine, reg_addr_a, 0, top);
        parse.vdbe.comment("left SELECT");
        prior.i_limit = reg_limit_a;
        sql_select(parse, prior, &mut dest_a)?;
        parse.vdbe.add_op1(Opcode::EndCoroutine, reg_addr_a);
        parse.vdbe.jump_here(addr1);

        let top = parse.vdbe.current_addr() + 1;
        let addr_select_b = parse.vdbe.add_op(Opcode::InitCoroutine, reg_addr_b, 0, top);
        parse.vdbe.comment("right SELECT");
        let saved_limit = p.i_limit;
        let saved_offset = p.i_offset;
        p.i_limit = reg_limit_b;
        p.i_offset = 0;
        let res = sql_select(parse, p, &mut dest_b);
        p.i_limit = saved_limit;
        p.i_offset = saved_offset;
        res?;
        parse.vdbe.add_op1(Opcode::EndCoroutine, reg_addr_b);

        let addr_out_a = generate_output_subroutine(
            parse,
            p,
            &dest_a,
            dest,
            reg_out_a,
            reg_prev,
            key_dup.clone(),
            labels.end,
        )?;
        let addr_out_b = if matches!(op, CompoundOp::UnionAll | CompoundOp::Union) {
            generate_output_subroutine(
                parse,
                p,
                &dest_b,
                dest,
                reg_out_b,
                reg_prev,
                key_dup.clone(),
                labels.end,
            )?
        } else {
            0
        };

        // A exhausted
        let (addr_eof_a, addr_eof_a_no_b) =
            if matches!(op, CompoundOp::Except | CompoundOp::Intersect) {
                (labels.end, labels.end)
            } else {
                let eof_a = parse.vdbe.add_op2(Opcode::Gosub, reg_out_b, addr_out_b);
                let no_b = parse.vdbe.add_op2(Opcode::Yield, reg_addr_b, labels.end);
                parse.vdbe.add_op2(Opcode::Goto, 0, eof_a);
                (eof_a, no_b)
            };

        // B exhausted
        let addr_eof_b = if op == CompoundOp::Intersect {
            addr_eof_a
        } else {
            let eof_b = parse.vdbe.add_op2(Opcode::Gosub, reg_out_a, addr_out_a);
            parse.vdbe.add_op2(Opcode::Yield, reg_addr_a, labels.end);
            parse.vdbe.add_op2(Opcode::Goto, 0, eof_b);
            eof_b
        };

        // A < B
        let mut addr_alt_b = parse.vdbe.add_op2(Opcode::Gosub, reg_out_a, addr_out_a);
        parse.vdbe.add_op2(Opcode::Yield, reg_addr_a, addr_eof_a);
        parse.vdbe.add_op2(Opcode::Goto, 0, labels.cmpr);

        // A == B
        let addr_aeq_b = match op {
            CompoundOp::UnionAll | CompoundOp::Select => addr_alt_b,
            CompoundOp::Intersect => {
                let a = addr_alt_b;
                addr_alt_b += 1;
                a
            }
            CompoundOp::Union | CompoundOp::Except => {
                let a = parse.vdbe.add_op2(Opcode::Yield, reg_addr_a, addr_eof_a);
                parse.vdbe.add_op2(Opcode::Goto, 0, labels.cmpr);
                a
            }
        };

        // A > B
        let addr_agt_b = parse.vdbe.current_addr();
        if matches!(op, CompoundOp::UnionAll | CompoundOp::Union) {
            parse.vdbe.add_op2(Opcode::Gosub, reg_out_b, addr_out_b);
        }
        parse.vdbe.add_op2(Opcode::Yield, reg_addr_b, addr_eof_b);
        parse.vdbe.add_op2(Opcode::Goto, 0, labels.cmpr);

        parse.vdbe.jump_here(addr_select_b);
        parse.vdbe.add_op2(Opcode::Yield, reg_addr_a, addr_eof_a_no_b);
        parse.vdbe.add_op2(Opcode::Yield, reg_addr_b, addr_eof_b);

        parse.resolve_label(labels.cmpr);
        parse
            .vdbe
            .add_op4(Opcode::Permutation, 0, 0, 0, P4::IntArray(permute));
        parse.vdbe.add_op4(
            Opcode::Compare,
            dest_a.sdst,
            dest_b.sdst,
            n_order_by as i32,
            P4::KeyInfo(key_merge),
        );
        parse.vdbe.change_p5(cmp_flags::PERMUTE);
        parse
            .vdbe
            .add_op(Opcode::Jump, addr_alt_b, addr_aeq_b, addr_agt_b);
        parse.resolve_label(labels.end);

        if dest.kind == SelectDestKind::Output && parse.nested == 1 {
            generate_column_metadata(parse, prior.leftmost())?;
        }
        Ok(())
    })();
    p.limit = limit;
    p.offset = offset;
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompileConfig;
    use crate::parser::ast::{SelectFlags, SrcItem, SrcList};
    use crate::schema::{Column, Table, COLL_UNICODE_CI};
    use crate::types::{FieldType, SortOrder};

    fn table(name: &str) -> Arc<Table> {
        Arc::new(Table::new(
            name,
            vec![
                Column::new("a", FieldType::Integer),
                Column::new("s", FieldType::String).with_collation(COLL_UNICODE_CI),
            ],
        ))
    }

    fn compound(op: CompoundOp) -> Select {
        let t1 = table("t1");
        let t2 = table("t2");
        let side = |t: &Arc<Table>, cursor| {
            Select::new(
                ExprList::from_exprs(vec![Expr::column(t, cursor, 0), Expr::column(t, cursor, 1)]),
                SrcList::single(SrcItem::table(t.clone(), cursor)),
                None,
            )
        };
        let mut right = side(&t2, 1);
        right.op = op;
        right.prior = Some(Box::new(side(&t1, 0)));
        right.flags |= SelectFlags::COMPOUND;
        let mut ob = ExprList::new();
        ob.push_sorted(Expr::int(1), SortOrder::Desc);
        ob.items[0].order_by_col = 1;
        right.order_by = Some(ob);
        right
    }

    #[test]
    fn test_order_by_extended_for_set_operators() {
        let mut parse = Parse::new(CompileConfig::default());
        let p = compound(CompoundOp::Union);
        let (ob, key) = merge_order_by(&mut parse, &p).unwrap();
        assert_eq!(ob.len(), 2);
        assert_eq!(ob.items[1].order_by_col, 2);
        assert_eq!(key.len(), 3);
        assert!(key.parts[0].sort_order.is_desc());
        assert_eq!(key.parts[1].coll_id, COLL_UNICODE_CI);
        assert!(matches!(ob.items[1].expr.kind, ExprKind::Collate { .. }));
    }

    #[test]
    fn test_union_all_order_by_not_extended() {
        let mut parse = Parse::new(CompileConfig::default());
        let p = compound(CompoundOp::UnionAll);
        let (ob, _) = merge_order_by(&mut parse, &p).unwrap();
        assert_eq!(ob.len(), 1);
    }

    #[test]
    fn test_order_by_term_out_of_range() {
        let mut parse = Parse::new(CompileConfig::default());
        let mut p = compound(CompoundOp::UnionAll);
        if let Some(ob) = p.order_by.as_mut() {
            ob.items[0].order_by_col = 5;
        }
        let err = merge_order_by(&mut parse, &p).unwrap_err();
        assert_eq!(
            err.message(),
            "Error at ORDER BY in place 1: term out of range - should be between 1 and 2"
        );
    }

    #[test]
    fn test_merge_union_program_shape() {
        let mut parse = Parse::new(CompileConfig::default());
        parse.n_tab = 2;
        parse.nested = 1;
        let mut p = compound(CompoundOp::Union);
        let mut dest = SelectDest::output();
        multi_select_order_by(&mut parse, &mut p, &mut dest).unwrap();
        assert!(p.prior.is_some());
        let program = parse.finish().unwrap();
        assert_eq!(program.count(Opcode::InitCoroutine), 2);
        assert_eq!(program.count(Opcode::EndCoroutine), 2);
        assert!(program.contains(Opcode::Permutation));
        let permute = program.position(Opcode::Permutation).unwrap();
        let ops = program.opcodes();
        assert_eq!(ops[permute + 1], Opcode::Compare);
        assert_eq!(ops[permute + 2], Opcode::Jump);
        assert_eq!(program.ops[permute + 1].p5, cmp_flags::PERMUTE);
        // two output subroutines, each with a duplicate check
        assert_eq!(program.count(Opcode::ResultRow), 2);
        assert_eq!(program.count(Opcode::IfNot), 2);
        assert_eq!(program.columns.len(), 2);
    }

    #[test]
    fn test_merge_intersect_has_single_output() {
        let mut parse = Parse::new(CompileConfig::default());
        parse.n_tab = 2;
        let mut p = compound(CompoundOp::Intersect);
        let mut dest = SelectDest::output();
        multi_select_order_by(&mut parse, &mut p, &mut dest).unwrap();
        let program = parse.finish().unwrap();
        assert_eq!(program.count(Opcode::ResultRow), 1);
    }

    #[test]
    fn test_output_subroutine_into_coroutine() {
        let mut parse = Parse::new(CompileConfig::default());
        let p = Select::default();
        let input = SelectDest {
            kind: SelectDestKind::Coroutine,
            parm: 1,
            sdst: 10,
            n_sdst: 2,
            ..SelectDest::default()
        };
        let mut out = SelectDest::new(SelectDestKind::Coroutine, 5);
        let brk = parse.make_label();
        let ret = parse.alloc_reg();
        generate_output_subroutine(&mut parse, &p, &input, &mut out, ret, 0, None, brk).unwrap();
        parse.resolve_label(brk);
        assert_eq!(out.n_sdst, 2);
        assert_ne!(out.sdst, 0);
        let program = parse.finish().unwrap();
        let yields = program.ops_with(Opcode::Yield);
        assert_eq!(yields.len(), 1);
        assert_eq!(yields[0].p1, 5);
        assert!(program.contains(Opcode::Return));
    }
}
