mod support;

use fq_common::{FqError, OverflowMode, TotalsMode};
use fq_interpreter::InterpreterSelectQuery;
use fq_planner::{ProcessingStage, SelectQuery, col, count, lit_i64, max, min, sum};

use support::{
    column_names, context_with, grouped_rows, int_column, kv_table, run, settings, sorted_pairs,
};

#[test]
fn fetch_columns_stage_returns_required_source_columns_untouched() {
    let rows = grouped_rows(20, 4);
    let ctx = context_with(vec![kv_table("t", &rows, 3)]).with_settings(settings(2, 1000));
    let query = SelectQuery::new()
        .column(col("v"))
        .from_table("t")
        .filter(col("v").gt(lit_i64(100)));

    let io = InterpreterSelectQuery::new(query, ctx, ProcessingStage::FetchColumns, 0, None, false)
        .expect("interpreter")
        .execute()
        .expect("execute");
    let result = io.read_all().expect("read");

    assert_eq!(column_names(&result.schema), vec!["v".to_string()]);
    let mut v = int_column(&result.batches, "v");
    v.sort_unstable();
    assert_eq!(v, (0..20).collect::<Vec<_>>());
}

#[test]
fn limit_without_ordering_never_exceeds_its_length() {
    let rows = grouped_rows(100, 10);
    for threads in [1, 2, 4, 8] {
        for blocks in [1, 3, 8] {
            let ctx = context_with(vec![kv_table("t", &rows, blocks)])
                .with_settings(settings(threads, 7));
            let query = SelectQuery::new().column(col("k")).from_table("t").limit(13);
            let result = run(query, &ctx);
            assert_eq!(result.num_rows(), 13, "threads={threads} blocks={blocks}");

            let query = SelectQuery::new()
                .column(col("k"))
                .from_table("t")
                .limit(5)
                .offset(97);
            assert_eq!(run(query, &ctx).num_rows(), 3);
        }
    }
}

#[test]
fn huge_limit_and_offset_do_not_overflow() {
    let rows = grouped_rows(100, 10);
    let ctx = context_with(vec![kv_table("t", &rows, 4)]).with_settings(settings(4, 16));

    let query = SelectQuery::new()
        .column(col("v"))
        .from_table("t")
        .limit(u64::MAX)
        .offset(95);
    assert_eq!(run(query, &ctx).num_rows(), 5);

    let query = SelectQuery::new()
        .distinct()
        .column(col("k"))
        .from_table("t")
        .order_by(col("k"), true)
        .limit(u64::MAX)
        .offset(8);
    assert_eq!(int_column(&run(query, &ctx).batches, "k"), vec![1, 0]);

    let query = SelectQuery::new()
        .column(col("v"))
        .from_table("t")
        .limit(2)
        .offset(u64::MAX);
    assert_eq!(run(query, &ctx).num_rows(), 0);
}

#[test]
fn small_limit_reads_one_stream() {
    let rows = grouped_rows(100, 10);
    let ctx = context_with(vec![kv_table("t", &rows, 4)]).with_settings(settings(4, 1000));

    let io = InterpreterSelectQuery::for_query(
        SelectQuery::new().column(col("k")).from_table("t").limit(3),
        ctx.clone(),
    )
    .expect("interpreter")
    .execute()
    .expect("execute");
    assert!(!io.explain().contains("Union"), "{}", io.explain());

    let io = InterpreterSelectQuery::for_query(
        SelectQuery::new()
            .column(col("k"))
            .from_table("t")
            .filter(col("k").gt(lit_i64(0)))
            .limit(3),
        ctx,
    )
    .expect("interpreter")
    .execute()
    .expect("execute");
    assert!(io.explain().contains("Union"), "{}", io.explain());
}

#[test]
fn distinct_is_idempotent() {
    let rows = grouped_rows(60, 6);
    let ctx = context_with(vec![kv_table("t", &rows, 4)]).with_settings(settings(4, 8));
    let once = SelectQuery::new().distinct().column(col("k")).from_table("t");
    let twice = SelectQuery::new()
        .distinct()
        .column(col("k"))
        .from_subquery(once.clone());

    let mut a = int_column(&run(once, &ctx).batches, "k");
    let mut b = int_column(&run(twice, &ctx).batches, "k");
    a.sort_unstable();
    b.sort_unstable();
    assert_eq!(a, (0..6).collect::<Vec<_>>());
    assert_eq!(a, b);
}

#[test]
fn totals_cover_rows_cut_by_limit() {
    let rows = grouped_rows(40, 8);
    let ctx = context_with(vec![kv_table("t", &rows, 4)]).with_settings(settings(4, 5));
    let query = SelectQuery::new()
        .column(col("k"))
        .column(sum(col("v")))
        .from_table("t")
        .group_by(vec![col("k")])
        .with_totals()
        .limit(2);

    let result = run(query, &ctx);
    assert_eq!(result.num_rows(), 2);
    let totals = result.totals.expect("totals row");
    assert_eq!(totals.num_rows(), 1);
    assert_eq!(int_column(&[totals], "sum(v)"), vec![(0..40).sum::<i64>()]);
}

#[test]
fn limit_over_a_subquery_with_totals_reads_it_to_the_end() {
    let rows = grouped_rows(40, 8);
    let ctx = context_with(vec![kv_table("t", &rows, 4)]).with_settings(settings(4, 5));
    let inner = SelectQuery::new()
        .column(col("k"))
        .column_as(sum(col("v")), "total")
        .from_table("t")
        .group_by(vec![col("k")])
        .with_totals();
    let outer = SelectQuery::new()
        .column(col("k"))
        .column(col("total"))
        .from_subquery(inner)
        .limit(1);

    let io = InterpreterSelectQuery::for_query(outer, ctx)
        .expect("interpreter")
        .execute()
        .expect("execute");
    assert!(io.explain().contains("read_till_end"), "{}", io.explain());
    let result = io.read_all().expect("read");
    assert_eq!(result.num_rows(), 1);
    let totals = result.totals.expect("totals row");
    assert_eq!(int_column(&[totals], "total"), vec![(0..40).sum::<i64>()]);
}

#[test]
fn overflow_row_keeps_totals_complete() {
    let rows = grouped_rows(40, 8);
    let mut s = settings(2, 5);
    s.max_rows_to_group_by = 2;
    s.group_by_overflow_mode = OverflowMode::Any;
    s.totals_mode = TotalsMode::BeforeHaving;
    let ctx = context_with(vec![kv_table("t", &rows, 2)]).with_settings(s);
    let query = SelectQuery::new()
        .column(col("k"))
        .column(sum(col("v")))
        .from_table("t")
        .group_by(vec![col("k")])
        .with_totals();

    let result = run(query, &ctx);
    assert!(int_column(&result.batches, "k").len() < 8);
    assert_eq!(
        int_column(&[result.totals.expect("totals")], "sum(v)"),
        vec![(0..40).sum::<i64>()]
    );
}

#[test]
fn totals_after_having_follow_the_totals_mode() {
    let rows = grouped_rows(10, 5);
    let base = SelectQuery::new()
        .column(col("k"))
        .column(sum(col("v")))
        .from_table("t")
        .group_by(vec![col("k")])
        .with_totals()
        .having(sum(col("v")).gt(lit_i64(10)));

    let mut exclusive = settings(2, 100);
    exclusive.totals_mode = TotalsMode::AfterHavingExclusive;
    let ctx = context_with(vec![kv_table("t", &rows, 2)]).with_settings(exclusive);
    let result = run(base.clone(), &ctx);
    // Sums per key: 5, 7, 9, 11, 13.
    assert_eq!(int_column(&result.batches, "k").len(), 2);
    assert_eq!(
        int_column(&[result.totals.expect("totals")], "sum(v)"),
        vec![24]
    );

    let mut before = settings(2, 100);
    before.totals_mode = TotalsMode::BeforeHaving;
    let ctx = context_with(vec![kv_table("t", &rows, 2)]).with_settings(before);
    let result = run(base, &ctx);
    assert_eq!(
        int_column(&[result.totals.expect("totals")], "sum(v)"),
        vec![45]
    );
}

#[test]
fn group_having_order_limit_on_one_node() {
    let mut rows = grouped_rows(30, 15);
    rows.push((99, 1));
    let ctx = context_with(vec![kv_table("t", &rows, 3)]).with_settings(settings(3, 4));
    let query = SelectQuery::new()
        .column(col("k"))
        .column(count())
        .from_table("t")
        .group_by(vec![col("k")])
        .having(count().gt(lit_i64(1)))
        .order_by(col("k"), false)
        .limit(10);

    let io = InterpreterSelectQuery::for_query(query, ctx)
        .expect("interpreter")
        .execute()
        .expect("execute");
    let plan = io.explain();
    assert!(plan.contains("MergeSorting"), "{plan}");
    assert!(!plan.contains("MergingSorted"), "{plan}");

    let result = io.read_all().expect("read");
    assert_eq!(
        column_names(&result.schema),
        vec!["k".to_string(), "count()".to_string()]
    );
    assert_eq!(int_column(&result.batches, "k"), (0..10).collect::<Vec<_>>());
    assert!(int_column(&result.batches, "count()").iter().all(|c| *c == 2));
}

#[test]
fn parallel_aggregation_matches_single_stream() {
    let rows = grouped_rows(500, 37);
    let query = SelectQuery::new()
        .column(col("k"))
        .column(sum(col("v")))
        .from_table("t")
        .group_by(vec![col("k")]);

    let single = context_with(vec![kv_table("t", &rows, 1)]).with_settings(settings(1, 64));
    let mut two_level = settings(4, 16);
    two_level.group_by_two_level_threshold = 4;
    let parallel = context_with(vec![kv_table("t", &rows, 8)]).with_settings(two_level);

    let a = sorted_pairs(&run(query.clone(), &single).batches, "k", "sum(v)");
    let b = sorted_pairs(&run(query, &parallel).batches, "k", "sum(v)");
    assert_eq!(a.len(), 37);
    assert_eq!(a, b);
}

#[test]
fn order_by_across_streams_is_sorted_and_complete() {
    let rows = (0..50).map(|i| ((i * 7919) % 50, i)).collect::<Vec<_>>();
    let ctx = context_with(vec![kv_table("t", &rows, 5)]).with_settings(settings(5, 6));
    let query = SelectQuery::new()
        .column(col("k"))
        .from_table("t")
        .order_by(col("k"), true);

    let k = int_column(&run(query, &ctx).batches, "k");
    assert_eq!(k, (0..50).rev().collect::<Vec<_>>());
}

#[test]
fn limit_by_keeps_n_rows_per_key() {
    let rows = grouped_rows(40, 4);
    let ctx = context_with(vec![kv_table("t", &rows, 2)]).with_settings(settings(2, 100));
    let query = SelectQuery::new()
        .column(col("k"))
        .column(col("v"))
        .from_table("t")
        .order_by(col("v"), false)
        .limit_by(2, vec![col("k")]);

    let pairs = sorted_pairs(&run(query, &ctx).batches, "k", "v");
    assert_eq!(
        pairs,
        vec![(0, 0), (0, 4), (1, 1), (1, 5), (2, 2), (2, 6), (3, 3), (3, 7)]
    );
}

#[test]
fn extremes_report_min_and_max_of_the_result() {
    let rows = grouped_rows(30, 3);
    for (threads, blocks) in [(1, 1), (4, 3), (2, 5)] {
        let mut s = settings(threads, 10);
        s.extremes = true;
        let ctx = context_with(vec![kv_table("t", &rows, blocks)]).with_settings(s);
        let query = SelectQuery::new().column(col("v")).from_table("t");

        let result = run(query, &ctx);
        assert_eq!(result.num_rows(), 30);
        let extremes = result.extremes.expect("extremes");
        assert_eq!(
            int_column(&[extremes], "v"),
            vec![0, 29],
            "threads={threads} blocks={blocks}"
        );
    }

    let mut s = settings(4, 10);
    s.extremes = true;
    let ctx = context_with(vec![kv_table("t", &rows, 3)]).with_settings(s);
    let query = SelectQuery::new()
        .column(col("k"))
        .column(sum(col("v")))
        .from_table("t")
        .group_by(vec![col("k")]);
    let extremes = run(query, &ctx).extremes.expect("extremes");
    // Sums per key: 135, 145, 155.
    assert_eq!(int_column(&[extremes], "sum(v)"), vec![135, 155]);
}

#[test]
fn select_without_from_reads_one_row() {
    let ctx = context_with(Vec::new());
    let result = run(SelectQuery::new().column(lit_i64(1)), &ctx);
    assert_eq!(result.num_rows(), 1);
    assert_eq!(int_column(&result.batches, "1"), vec![1]);
}

#[test]
fn settings_clause_overrides_session_settings() {
    let rows = grouped_rows(10, 10);
    let ctx = context_with(vec![kv_table("t", &rows, 1)]);
    let query = SelectQuery::new()
        .column(col("k"))
        .column(col("v"))
        .from_table("t")
        .setting("max_columns_to_read", "1");
    assert!(matches!(
        InterpreterSelectQuery::for_query(query, ctx.clone()).and_then(|i| i.execute()),
        Err(FqError::InvalidConfig(_))
    ));

    let query = SelectQuery::new()
        .column(col("k"))
        .from_table("t")
        .setting("no_such_setting", "1");
    assert!(matches!(
        InterpreterSelectQuery::for_query(query, ctx),
        Err(FqError::InvalidConfig(_))
    ));
}

#[test]
fn result_limits_apply_to_the_top_level_only() {
    let rows = grouped_rows(50, 5);
    let mut s = settings(2, 10);
    s.max_result_rows = 10;
    let ctx = context_with(vec![kv_table("t", &rows, 2)]).with_settings(s);

    let mut io = InterpreterSelectQuery::for_query(
        SelectQuery::new().column(col("k")).from_table("t"),
        ctx.clone(),
    )
    .expect("interpreter")
    .execute()
    .expect("execute");
    assert!(matches!(io.stream.collect(), Err(FqError::LimitExceeded(_))));

    // The subquery returns 50 rows; only the outer 5 count.
    let inner = SelectQuery::new().column(col("k")).from_table("t");
    let outer = SelectQuery::new()
        .distinct()
        .column(col("k"))
        .from_subquery(inner);
    assert_eq!(run(outer, &ctx).num_rows(), 5);
}

#[test]
fn too_deep_subqueries_are_rejected() {
    let rows = grouped_rows(4, 2);
    let mut s = settings(1, 10);
    s.max_subquery_depth = 2;
    let ctx = context_with(vec![kv_table("t", &rows, 1)]).with_settings(s);

    let mut query = SelectQuery::new().column(col("k")).from_table("t");
    for _ in 0..4 {
        query = SelectQuery::new().column(col("k")).from_subquery(query);
    }
    assert!(matches!(
        InterpreterSelectQuery::for_query(query, ctx),
        Err(FqError::InvalidConfig(_))
    ));
}

#[test]
fn sample_block_matches_the_executed_header() {
    let rows = grouped_rows(12, 3);
    let ctx = context_with(vec![kv_table("t", &rows, 2)]);
    let query = SelectQuery::new()
        .column(col("k"))
        .column_as(min(col("v")), "lo")
        .column(max(col("v")))
        .from_table("t")
        .group_by(vec![col("k")]);

    let mut interpreter = InterpreterSelectQuery::for_query(query, ctx).expect("interpreter");
    let header = interpreter.sample_block().expect("sample block");
    assert_eq!(
        column_names(&header),
        vec!["k".to_string(), "lo".to_string(), "max(v)".to_string()]
    );
    let result = interpreter.execute().expect("execute").read_all().expect("read");
    assert_eq!(result.schema, header);
    assert_eq!(result.num_rows(), 3);
}
