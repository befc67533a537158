mod support;

use fq_common::FqError;
use fq_execution::BatchStream;
use fq_interpreter::InterpreterSelectQuery;
use fq_planner::{
    JoinKind, ProcessingStage, SelectQuery, SelectWithUnionQuery, TableExpr, col, lit_i64, sum,
};
use fq_storage::{AliasColumn, StorageCapabilities};

use support::{
    column_names, context_with, grouped_rows, int_column, int_table, kv_batch, kv_schema,
    kv_table, run, settings, sorted_pairs,
};

fn table(name: &str) -> TableExpr {
    TableExpr::Table {
        database: None,
        name: name.to_string(),
    }
}

#[test]
fn prepared_input_replaces_the_table() {
    let ctx = context_with(Vec::new());
    let input = BatchStream::memory(
        kv_schema(),
        vec![kv_batch(&[(1, 10), (2, 20)]), kv_batch(&[(1, 30)])],
    );
    let query = SelectQuery::new()
        .column(col("k"))
        .column(sum(col("v")))
        .group_by(vec![col("k")]);

    let result = InterpreterSelectQuery::new(
        query,
        ctx,
        ProcessingStage::Complete,
        0,
        Some(input),
        false,
    )
    .expect("interpreter")
    .execute()
    .expect("execute")
    .read_all()
    .expect("read");
    assert_eq!(sorted_pairs(&result.batches, "k", "sum(v)"), vec![(1, 40), (2, 20)]);
}

#[test]
fn subquery_in_from_is_read_as_a_source() {
    let rows = grouped_rows(20, 4);
    let ctx = context_with(vec![kv_table("t", &rows, 2)]).with_settings(settings(2, 100));
    let inner = SelectQuery::new()
        .column(col("k"))
        .column_as(sum(col("v")), "total")
        .from_table("t")
        .group_by(vec![col("k")]);
    let outer = SelectQuery::new()
        .column(col("k"))
        .from_subquery(inner)
        .filter(col("total").gt(lit_i64(45)))
        .order_by(col("k"), false);

    // Totals per key: 40, 45, 50, 55.
    assert_eq!(int_column(&run(outer, &ctx).batches, "k"), vec![2, 3]);
}

#[test]
fn in_subquery_filters_by_a_materialized_set() {
    let rows = grouped_rows(12, 6);
    let ctx = context_with(vec![
        kv_table("t", &rows, 2),
        int_table("keys", &[("k", vec![1, 4, 9])]),
    ]);
    let keys = SelectWithUnionQuery::from(SelectQuery::new().column(col("k")).from_table("keys"));
    let query = SelectQuery::new()
        .column(col("k"))
        .column(col("v"))
        .from_table("t")
        .filter(col("k").in_subquery(keys.clone()));
    assert_eq!(
        sorted_pairs(&run(query, &ctx).batches, "k", "v"),
        vec![(1, 1), (1, 7), (4, 4), (4, 10)]
    );

    let query = SelectQuery::new()
        .column(col("v"))
        .from_table("t")
        .filter(col("k").not_in_subquery(keys));
    assert_eq!(run(query, &ctx).num_rows(), 8);
}

#[test]
fn inner_join_appends_right_columns() {
    let ctx = context_with(vec![
        int_table("l", &[("k", vec![1, 2, 3]), ("v", vec![10, 20, 30])]),
        int_table("r", &[("k", vec![2, 3, 4]), ("w", vec![200, 300, 400])]),
    ]);
    let query = SelectQuery::new()
        .column(col("v"))
        .column(col("w"))
        .from_table("l")
        .join(JoinKind::Inner, table("r"), &["k"]);
    assert_eq!(
        sorted_pairs(&run(query, &ctx).batches, "v", "w"),
        vec![(20, 200), (30, 300)]
    );
}

#[test]
fn right_join_emits_unmatched_rows_after_the_left_side() {
    let ctx = context_with(vec![
        int_table("l", &[("k", vec![1, 2]), ("v", vec![10, 20])]),
        int_table("r", &[("k", vec![2, 5]), ("w", vec![200, 500])]),
    ]);
    let query = SelectQuery::new()
        .column(col("k"))
        .column(col("w"))
        .from_table("l")
        .join(JoinKind::Right, table("r"), &["k"]);

    let result = run(query, &ctx);
    assert_eq!(
        sorted_pairs(&result.batches, "k", "w"),
        vec![(2, 200), (5, 500)]
    );
}

#[test]
fn alias_columns_are_computed_after_fetch() {
    let rows = grouped_rows(5, 5);
    let t = kv_table("t", &rows, 1).with_aliases(vec![AliasColumn {
        name: "double_v".to_string(),
        expr: col("v").multiply(lit_i64(2)),
    }]);
    let ctx = context_with(vec![t]);
    let query = SelectQuery::new()
        .column(col("k"))
        .column(col("double_v"))
        .from_table("t");

    let result = run(query, &ctx);
    assert_eq!(
        column_names(&result.schema),
        vec!["k".to_string(), "double_v".to_string()]
    );
    assert_eq!(
        sorted_pairs(&result.batches, "k", "double_v"),
        vec![(0, 0), (1, 2), (2, 4), (3, 6), (4, 8)]
    );
}

#[test]
fn sample_final_and_prewhere_need_a_capable_storage() {
    let rows = grouped_rows(10, 2);
    let ctx = context_with(vec![kv_table("t", &rows, 1)]);
    for query in [
        SelectQuery::new().column(col("k")).from_table("t").sample(0.5),
        SelectQuery::new().column(col("k")).from_table("t").final_(),
        SelectQuery::new()
            .column(col("k"))
            .from_table("t")
            .prewhere(col("v").gt(lit_i64(3))),
    ] {
        assert!(matches!(
            InterpreterSelectQuery::for_query(query, ctx.clone()),
            Err(FqError::Unsupported(_))
        ));
    }

    let input = BatchStream::memory(kv_schema(), vec![kv_batch(&rows)]);
    assert!(matches!(
        InterpreterSelectQuery::new(
            SelectQuery::new().column(col("k")).sample(0.5),
            ctx,
            ProcessingStage::Complete,
            0,
            Some(input),
            false,
        ),
        Err(FqError::Unsupported(_))
    ));
}

#[test]
fn capable_storage_evaluates_sample_and_prewhere() {
    let rows = grouped_rows(10, 2);
    let t = kv_table("t", &rows, 1).with_capabilities(StorageCapabilities {
        sampling: true,
        final_: false,
        prewhere: true,
    });
    let ctx = context_with(vec![t]);

    let query = SelectQuery::new()
        .column(col("v"))
        .from_table("t")
        .prewhere(col("v").gt(lit_i64(6)));
    let mut v = int_column(&run(query, &ctx).batches, "v");
    v.sort_unstable();
    assert_eq!(v, vec![7, 8, 9]);

    let query = SelectQuery::new().column(col("v")).from_table("t").sample(0.5);
    assert_eq!(run(query, &ctx).num_rows(), 5);
}

#[test]
fn unknown_table_is_a_planning_error() {
    let ctx = context_with(Vec::new());
    let query = SelectQuery::new().column(col("k")).from_table("missing");
    assert!(matches!(
        InterpreterSelectQuery::for_query(query, ctx),
        Err(FqError::Planning(_))
    ));
}

#[test]
fn explain_shows_the_operator_tree() {
    let rows = grouped_rows(40, 4);
    let ctx = context_with(vec![kv_table("t", &rows, 4)]).with_settings(settings(4, 10));
    let query = SelectQuery::new()
        .column(col("k"))
        .column(sum(col("v")))
        .from_table("t")
        .group_by(vec![col("k")])
        .order_by(col("k"), false);

    let io = InterpreterSelectQuery::for_query(query, ctx)
        .expect("interpreter")
        .execute()
        .expect("execute");
    let plan = io.explain();
    assert!(plan.contains("MergeSorting"), "{plan}");
    assert!(plan.contains("ParallelAggregating"), "{plan}");
    assert!(plan.contains("Memory"), "{plan}");
    let sort = plan.find("MergeSorting").expect("sort");
    let agg = plan.find("ParallelAggregating").expect("aggregation");
    assert!(sort < agg, "{plan}");
}
