//! Whole-statement compilation: checks on the shape of the produced
//! programs

use std::sync::{Arc, Once};

use rustql_select::parser::ast::{
    BinaryOp, CompoundOp, Expr, ExprList, JoinType, Select, SelectFlags, SrcItem, SrcItemFlags,
    SrcList,
};
use rustql_select::schema::{Column, Index, IndexColumn, Table, COLL_UNICODE_CI};
use rustql_select::types::{FieldType, SortOrder};
use rustql_select::vdbe::{Opcode, P4};
use rustql_select::{compile_select, CompileConfig, ErrorCode, Program};

static INIT: Once = Once::new();

fn init() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn t() -> Arc<Table> {
    let mut t = Table::new(
        "t",
        vec![
            Column::new("id", FieldType::Integer).not_null(),
            Column::new("a", FieldType::Integer),
            Column::new("name", FieldType::String).with_collation(COLL_UNICODE_CI),
        ],
    );
    t.add_index(Index::new("pk", vec![IndexColumn::new(0)], true));
    Arc::new(t)
}

fn u() -> Arc<Table> {
    Arc::new(Table::new(
        "u",
        vec![
            Column::new("x", FieldType::Integer),
            Column::new("y", FieldType::String),
        ],
    ))
}

fn scan(table: &Arc<Table>, cursor: i32, cols: &[usize]) -> Select {
    let elist = ExprList::from_exprs(cols.iter().map(|&c| Expr::column(table, cursor, c)).collect());
    Select::new(elist, SrcList::single(SrcItem::table(table.clone(), cursor)), None)
}

fn compile(p: &Select) -> Program {
    compile_select(p, CompileConfig::default()).unwrap()
}

#[test]
fn test_between_is_coded_as_two_comparisons() {
    init();
    let t = t();
    let mut p = scan(&t, 0, &[1]);
    p.where_clause = Some(Box::new(Expr::between(
        Expr::column(&t, 0, 1),
        Expr::int(1),
        Expr::int(5),
        false,
    )));
    let program = compile(&p);
    let rewind = program.position(Opcode::Rewind).unwrap();
    let row = program.position(Opcode::ResultRow).unwrap();
    let body = &program.opcodes()[rewind..row];
    assert!(body.contains(&Opcode::Lt));
    assert!(body.contains(&Opcode::Gt));
}

#[test]
fn test_program_ends_with_init_block() {
    init();
    let t = t();
    let program = compile(&scan(&t, 0, &[1]));
    let halt = program.position(Opcode::Halt).unwrap();
    let last = program.ops.last().unwrap();
    assert_eq!(last.opcode, Opcode::Goto);
    assert_eq!(last.p2, 1);
    assert_eq!(program.ops[0].opcode, Opcode::Init);
    assert_eq!(program.ops[0].p2 as usize, halt + 1);
}

#[test]
fn test_count_star_reads_cardinality() {
    init();
    let t = t();
    let p = Select::new(
        ExprList::from_exprs(vec![Expr::function("count", vec![], false)]),
        SrcList::single(SrcItem::table(t, 0)),
        None,
    );
    let program = compile(&p);
    assert_eq!(program.count(Opcode::Count), 1);
    assert!(!program.contains(Opcode::Rewind));
}

#[test]
fn test_max_with_index_stops_after_one_row() {
    init();
    let t = t();
    let p = Select::new(
        ExprList::from_exprs(vec![Expr::function("max", vec![Expr::column(&t, 0, 0)], false)]),
        SrcList::single(SrcItem::table(t.clone(), 0)),
        None,
    );
    let program = compile(&p);
    assert!(program.contains(Opcode::Last));
    let step = program.position(Opcode::AggStep).unwrap();
    assert_eq!(program.ops[step + 1].opcode, Opcode::Goto);
}

#[test]
fn test_group_by_output_in_group_order() {
    init();
    let t = t();
    let mut p = Select::new(
        ExprList::from_exprs(vec![
            Expr::column(&t, 0, 2),
            Expr::function("count", vec![], false),
        ]),
        SrcList::single(SrcItem::table(t.clone(), 0)),
        None,
    );
    p.group_by = Some(ExprList::from_exprs(vec![Expr::column(&t, 0, 2)]));
    p.order_by = Some(ExprList::from_exprs(vec![Expr::column(&t, 0, 2)]));
    let program = compile(&p);
    // one sorter for the groups, none for the ORDER BY
    assert_eq!(program.count(Opcode::SorterOpen), 1);
    assert_eq!(program.count(Opcode::SorterSort), 1);
    let sorter = program.ops_with(Opcode::SorterOpen)[0];
    match &sorter.p4 {
        P4::KeyInfo(key) => assert_eq!(key.parts[0].coll_id, COLL_UNICODE_CI),
        other => panic!("unexpected p4 {:?}", other),
    }
}

#[test]
fn test_union_with_order_by_is_a_merge() {
    init();
    let t = t();
    let u = u();
    let mut p = scan(&u, 1, &[0]);
    p.op = CompoundOp::Union;
    p.prior = Some(Box::new(scan(&t, 0, &[1])));
    let mut ob = ExprList::new();
    ob.push_sorted(Expr::column(&u, 1, 0), SortOrder::Desc);
    p.order_by = Some(ob);
    let program = compile(&p);
    assert_eq!(program.count(Opcode::InitCoroutine), 2);
    assert!(program.contains(Opcode::Permutation));
    assert!(program.contains(Opcode::Compare));
    assert_eq!(program.columns.len(), 1);
}

#[test]
fn test_union_without_order_by_uses_temp_index() {
    init();
    let t = t();
    let u = u();
    let mut p = scan(&u, 1, &[0]);
    p.op = CompoundOp::Union;
    p.prior = Some(Box::new(scan(&t, 0, &[1])));
    let program = compile(&p);
    assert!(!program.contains(Opcode::InitCoroutine));
    assert_eq!(program.count(Opcode::OpenEphemeral), 1);
    assert_eq!(program.count(Opcode::IdxInsert), 2);
    assert_eq!(program.count(Opcode::ResultRow), 1);
}

#[test]
fn test_compound_column_count_mismatch() {
    init();
    let t = t();
    let u = u();
    let mut p = scan(&u, 1, &[0, 1]);
    p.op = CompoundOp::Except;
    p.prior = Some(Box::new(scan(&t, 0, &[1])));
    let err = compile_select(&p, CompileConfig::default()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Mismatch);
}

#[test]
fn test_subquery_in_from_is_flattened() {
    init();
    let t = t();
    let mut sub = scan(&t, 0, &[1, 2]);
    sub.where_clause = Some(Box::new(Expr::binary(
        BinaryOp::Gt,
        Expr::column(&t, 0, 1),
        Expr::int(10),
    )));
    let item = SrcItem::subquery(sub, "s", 1);
    let st = item.table.clone().unwrap();
    let p = Select::new(
        ExprList::from_exprs(vec![Expr::column(&st, 1, 1)]),
        SrcList::single(item),
        Some(Expr::binary(BinaryOp::Lt, Expr::column(&st, 1, 0), Expr::int(20))),
    );
    let program = compile(&p);
    assert!(!program.contains(Opcode::InitCoroutine));
    assert!(!program.contains(Opcode::OpenEphemeral));
    assert!(program.ops_with(Opcode::Column).iter().all(|op| op.p1 == 0));
    assert_eq!(program.columns[0].name, "name");
}

#[test]
fn test_left_join_subquery_is_materialized() {
    init();
    let t = t();
    let u = u();
    let mut sub = scan(&u, 1, &[0]);
    sub.flags |= SelectFlags::DISTINCT;
    let item = SrcItem::subquery(sub, "s", 2).with_join(JoinType::LEFT | JoinType::OUTER, None);
    let st = item.table.clone().unwrap();
    let mut src = SrcList::single(SrcItem::table(t.clone(), 0));
    src.items.push(item);
    let p = Select::new(
        ExprList::from_exprs(vec![Expr::column(&t, 0, 1), Expr::column(&st, 2, 0)]),
        src,
        None,
    );
    let program = compile(&p);
    assert!(program.contains(Opcode::Once));
    assert!(program.contains(Opcode::NullRow));
    assert!(program.ops_with(Opcode::OpenEphemeral).iter().any(|op| op.p1 == 2));
}

#[test]
fn test_scalar_subquery_checks_single_row() {
    init();
    let t = t();
    let u = u();
    let sub = scan(&u, 1, &[0]);
    let p = Select::new(
        ExprList::from_exprs(vec![Expr::column(&t, 0, 1), Expr::subquery(sub)]),
        SrcList::single(SrcItem::table(t.clone(), 0)),
        None,
    );
    let program = compile(&p);
    assert!(program.ops.iter().any(|op| matches!(
        &op.p4,
        P4::Text(msg) if msg == "Expression subquery returned more than 1 row"
    )));
}

#[test]
fn test_negative_limit_halts_at_run_time() {
    init();
    let t = t();
    let mut p = scan(&t, 0, &[1]);
    p.limit = Some(Box::new(Expr::variable(1)));
    let program = compile(&p);
    assert!(program.contains(Opcode::MustBeInt));
    assert!(program.ops.iter().any(|op| matches!(
        &op.p4,
        P4::Text(msg) if msg == "Only positive integers are allowed in the LIMIT clause"
    )));
}

#[test]
fn test_recursive_query_seeded_from_table() {
    init();
    let t = t();
    let cnt = Arc::new(Table::new("cnt", vec![Column::new("x", FieldType::Integer)]));
    let setup = scan(&t, 0, &[1]);
    let mut item = SrcItem::table(cnt.clone(), 1);
    item.fg |= SrcItemFlags::RECURSIVE;
    let next = Expr::binary(BinaryOp::Add, Expr::column(&cnt, 1, 0), Expr::int(1));
    let mut p = Select::new(
        ExprList::from_exprs(vec![next.clone()]),
        SrcList::single(item),
        Some(Expr::binary(BinaryOp::Lt, Expr::column(&cnt, 1, 0), Expr::int(5))),
    );
    p.op = CompoundOp::Union;
    p.prior = Some(Box::new(setup));
    p.flags |= SelectFlags::RECURSIVE;
    let mut ob = ExprList::new();
    ob.push_sorted(next, SortOrder::Desc);
    p.order_by = Some(ob);
    p.limit = Some(Box::new(Expr::int(3)));

    let program = compile(&p);
    let reads = program.ops_with(Opcode::OpenRead);
    assert_eq!(reads.len(), 1);
    assert!(matches!(&reads[0].p4, P4::Table(name) if name == "t"));
    assert_eq!(program.count(Opcode::OpenPseudo), 1);
    // queue plus the index of rows already queued
    assert_eq!(program.count(Opcode::OpenEphemeral), 2);
    assert_eq!(program.count(Opcode::Sequence), 2);
    assert_eq!(program.count(Opcode::Found), 2);
    assert_eq!(program.count(Opcode::DecrJumpZero), 1);
    let emit = program.position(Opcode::ResultRow).unwrap();
    assert!(program.position(Opcode::Delete).unwrap() < emit);
}

#[test]
fn test_recursive_aggregate_fails() {
    init();
    let cnt = Arc::new(Table::new("cnt", vec![Column::new("x", FieldType::Integer)]));
    let mut item = SrcItem::table(cnt.clone(), 0);
    item.fg |= SrcItemFlags::RECURSIVE;
    let mut p = Select::new(
        ExprList::from_exprs(vec![Expr::function("count", vec![Expr::column(&cnt, 0, 0)], false)]),
        SrcList::single(item),
        None,
    );
    p.op = CompoundOp::UnionAll;
    p.prior = Some(Box::new(Select::new(
        ExprList::from_exprs(vec![Expr::int(1)]),
        SrcList::new(),
        None,
    )));
    p.flags |= SelectFlags::RECURSIVE;
    let err = compile_select(&p, CompileConfig::default()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Error);
}
