//! Interpreter of one SELECT: builds the pipeline of streams that computes
//! the query up to a processing stage.
//!
//! Streams of data: when the query is executed in parallel there are several
//! of them. Without GROUP BY everything up to ORDER BY and LIMIT runs per
//! stream, then streams are glued by a union (and a merge sort with ORDER
//! BY), then LIMIT applies. With GROUP BY everything up to the aggregation
//! runs per stream, the parallel aggregation glues the streams into one, and
//! the rest runs on that single stream.

use std::sync::Arc;

use arrow_schema::SchemaRef;
use fq_common::{FqError, Result};
use fq_execution::{
    AggregatorParams, BatchStream, ExpressionActions, HashJoin, LocalLimits, MergeSortParams,
    Pipeline, PreparedSet, PreparedSets, Set, SetSource, SizeLimits, TotalsHavingParams,
};
use fq_planner::{
    Action, ActionList, AnalysisResult, ExpressionAnalyzer, FilterStep, ProcessingStage,
    SchemaProvider, SelectQuery, SelectWithUnionQuery, SetTarget, SortColumn, SubqueryForSet,
    TableExpr, explain_analysis,
};
use fq_storage::{SYSTEM_ONE, SelectQueryInfo};
use tracing::{debug, info_span, trace};

use crate::block_io::BlockIO;
use crate::context::{Context, qualified_table_name};
use crate::select_with_union::InterpreterSelectWithUnionQuery;
use crate::table_lock::{LockedStorage, get_and_lock_storage};

/// Answers the analyzer's questions about subqueries by analyzing them one
/// level deeper.
struct SubqueryColumns<'a> {
    context: &'a Context,
    depth: usize,
}

impl SchemaProvider for SubqueryColumns<'_> {
    fn subquery_columns(&self, query: &SelectWithUnionQuery) -> Result<Vec<String>> {
        let mut interpreter = InterpreterSelectWithUnionQuery::new(
            query.clone(),
            self.context.clone(),
            ProcessingStage::Complete,
            self.depth + 1,
            true,
        )?;
        Ok(column_names(&interpreter.sample_block()?))
    }
}

fn column_names(schema: &SchemaRef) -> Vec<String> {
    schema.fields().iter().map(|f| f.name().clone()).collect()
}

/// Settings of a subquery whose result is not the result of the query: no
/// result caps, no extremes.
fn subquery_context(context: &Context) -> Context {
    let mut ctx = context.clone();
    let settings = ctx.settings_mut();
    settings.max_result_rows = 0;
    settings.max_result_bytes = 0;
    settings.extremes = false;
    ctx
}

pub struct InterpreterSelectQuery {
    context: Context,
    to_stage: ProcessingStage,
    subquery_depth: usize,
    only_analyze: bool,
    /// Prepared input read instead of a table; consumed by the first execution.
    input: Option<BatchStream>,
    input_header: Option<SchemaRef>,
    storage: Option<LockedStorage>,
    subquery: Option<SelectWithUnionQuery>,
    subquery_header: Option<SchemaRef>,
    analyzer: ExpressionAnalyzer,
    with_totals: bool,
    prepared_sets: PreparedSets,
}

impl std::fmt::Debug for InterpreterSelectQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpreterSelectQuery")
            .field("to_stage", &self.to_stage)
            .field("subquery_depth", &self.subquery_depth)
            .field("only_analyze", &self.only_analyze)
            .field("storage", &self.storage.as_ref().map(|s| s.storage.name().to_string()))
            .finish_non_exhaustive()
    }
}

impl InterpreterSelectQuery {
    /// Resolves the source (prepared input, FROM subquery, table, or
    /// `system.one` without FROM) and analyzes the query against it.
    ///
    /// `only_analyze` skips the checks that only matter when the query will
    /// actually read.
    pub fn new(
        query: SelectQuery,
        mut context: Context,
        to_stage: ProcessingStage,
        subquery_depth: usize,
        input: Option<BatchStream>,
        only_analyze: bool,
    ) -> Result<Self> {
        context.apply_settings_changes(&query.settings)?;
        let max_subquery_depth = context.settings().max_subquery_depth;
        if subquery_depth > max_subquery_depth {
            return Err(FqError::InvalidConfig(format!(
                "too deep subqueries: maximum {max_subquery_depth}"
            )));
        }

        let input_header = input.as_ref().map(BatchStream::schema);
        let mut storage = None;
        let mut subquery = None;
        let mut subquery_header = None;
        let source_columns = if let Some(header) = &input_header {
            column_names(header)
        } else {
            match &query.from {
                Some(TableExpr::Subquery(sub)) => {
                    let mut interpreter = InterpreterSelectWithUnionQuery::new(
                        (**sub).clone(),
                        subquery_context(&context),
                        ProcessingStage::Complete,
                        subquery_depth + 1,
                        true,
                    )?;
                    let header = interpreter.sample_block()?;
                    subquery = Some((**sub).clone());
                    subquery_header = Some(header.clone());
                    column_names(&header)
                }
                from => {
                    let locked = match from.as_ref().and_then(qualified_table_name) {
                        Some(name) => get_and_lock_storage(&context, &name)?,
                        None => {
                            let storage = context.catalog().get(SYSTEM_ONE)?;
                            let lock = storage.table_lock().lock_for_share();
                            LockedStorage { storage, lock }
                        }
                    };
                    let columns = locked.storage.column_names();
                    storage = Some(locked);
                    columns
                }
            }
        };

        let analyzer = ExpressionAnalyzer::new(
            &query,
            source_columns,
            &SubqueryColumns {
                context: &context,
                depth: subquery_depth,
            },
        )?;

        if !only_analyze {
            let source = storage
                .as_ref()
                .filter(|_| input.is_none())
                .map(|s| (s.storage.name().to_string(), s.storage.capabilities()));
            let caps = source.as_ref().map(|(_, caps)| *caps);
            for (requested, supported, clause) in [
                (query.sample.is_some(), caps.is_some_and(|c| c.sampling), "SAMPLE"),
                (query.final_, caps.is_some_and(|c| c.final_), "FINAL"),
                (query.prewhere.is_some(), caps.is_some_and(|c| c.prewhere), "PREWHERE"),
            ] {
                if requested && !supported {
                    return Err(FqError::Unsupported(match &source {
                        Some((name, _)) => format!("storage {name} doesn't support {clause}"),
                        None => format!("illegal {clause}"),
                    }));
                }
            }
        }

        Ok(Self {
            with_totals: query.with_totals,
            context,
            to_stage,
            subquery_depth,
            only_analyze,
            input,
            input_header,
            storage,
            subquery,
            subquery_header,
            analyzer,
            prepared_sets: PreparedSets::new(),
        })
    }

    /// Interpreter of a top-level query run to completion.
    pub fn for_query(query: SelectQuery, context: Context) -> Result<Self> {
        Self::new(query, context, ProcessingStage::Complete, 0, None, false)
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// The query after wildcard expansion and alias substitution.
    pub fn query(&self) -> &SelectQuery {
        self.analyzer.query()
    }

    /// Treats the query as having no WITH TOTALS; used for FROM subqueries of
    /// an aggregating query.
    pub fn ignore_with_totals(&mut self) {
        self.with_totals = false;
    }

    /// Builds and runs the pipeline, gluing it into one stream.
    pub fn execute(mut self) -> Result<BlockIO> {
        let mut pipeline = Pipeline::new();
        self.execute_impl(&mut pipeline, false)?;
        pipeline.union_all()?;
        let mut stream = pipeline.into_stream()?;

        if self.subquery_depth == 0 && self.to_stage == ProcessingStage::Complete {
            let limits = LocalLimits::for_result(self.context.settings());
            if !limits.is_empty() {
                if !stream.limits().is_empty() {
                    stream = BatchStream::union(vec![stream])?;
                }
                stream.set_limits(limits);
            }
        }
        Ok(BlockIO::new(stream))
    }

    /// Builds the pipeline and returns its streams without gluing them.
    pub fn execute_with_multiple_streams(mut self) -> Result<Vec<BatchStream>> {
        let mut pipeline = Pipeline::new();
        self.execute_impl(&mut pipeline, false)?;
        if !pipeline.streams_with_non_joined_data.is_empty() {
            pipeline.union_all()?;
        }
        Ok(pipeline.streams)
    }

    /// Header of the result, computed by building the pipeline over empty
    /// sources.
    pub fn sample_block(&mut self) -> Result<SchemaRef> {
        let mut pipeline = Pipeline::new();
        self.execute_impl(&mut pipeline, true)?;
        pipeline.header()
    }

    fn execute_impl(&mut self, pipeline: &mut Pipeline, dry_run: bool) -> Result<()> {
        let span = info_span!(
            "select_query",
            query_id = %self.context.query_id(),
            depth = self.subquery_depth,
            to_stage = %self.to_stage,
            dry_run
        );
        let _enter = span.enter();

        if dry_run {
            if let Some(header) = &self.input_header {
                pipeline.streams.push(BatchStream::null(header.clone()));
            }
        } else if let Some(input) = self.input.take() {
            pipeline.streams.push(input);
        } else if let Some(header) = &self.input_header {
            // A prepared input is read by one execution only.
            pipeline.streams.push(BatchStream::null(header.clone()));
        }

        let mut from_stage = match &self.storage {
            Some(locked) if pipeline.is_empty() => {
                locked.storage.query_processing_stage(self.context.settings())
            }
            _ => ProcessingStage::FetchColumns,
        };
        check_stages(from_stage, self.to_stage)?;

        let mut expressions = self.analyze(from_stage, dry_run)?;
        let read_stage = self.execute_fetch_columns(
            pipeline,
            &expressions.required_source_columns,
            from_stage,
            dry_run,
        )?;
        if read_stage != from_stage {
            from_stage = read_stage;
            check_stages(from_stage, self.to_stage)?;
            expressions = self.analyze(from_stage, dry_run)?;
        }
        if !dry_run {
            debug!("{} -> {}", from_stage, self.to_stage);
        }

        let settings = self.context.settings().clone();
        if self.to_stage > ProcessingStage::FetchColumns {
            let query_has_limit = self.query().limit.is_some();
            let distinct = self.query().distinct;

            let aggregate_overflow_row = expressions.aggregate_overflow_row;
            let aggregate_final = expressions.aggregate_final;

            if expressions.first_stage {
                if expressions.has_join {
                    self.execute_join(pipeline, &expressions, settings.max_block_size)?;
                }
                if let Some(step) = &expressions.before_where {
                    self.execute_where(pipeline, step)?;
                }
                if expressions.need_aggregate {
                    let actions = required(&expressions.before_aggregation, "before aggregation")?;
                    self.execute_aggregation(
                        pipeline,
                        &expressions,
                        actions,
                        aggregate_overflow_row,
                        aggregate_final,
                    )?;
                } else {
                    let actions =
                        required(&expressions.before_order_and_select, "before order and select")?;
                    self.execute_expression(pipeline, actions)?;
                    self.execute_distinct(pipeline, &expressions, true)?;
                }

                // With no aggregation on a node doing only the first stage,
                // ORDER BY and LIMIT are applied before shipping.
                if !expressions.second_stage && !expressions.need_aggregate && !expressions.has_having {
                    if expressions.has_order_by {
                        self.execute_order(pipeline, &expressions)?;
                    }
                    if expressions.has_order_by && query_has_limit {
                        self.execute_distinct(pipeline, &expressions, false)?;
                    }
                    if query_has_limit {
                        self.execute_pre_limit(pipeline)?;
                    }
                }
            }

            if expressions.second_stage {
                let need_second_distinct_pass;

                if expressions.need_aggregate {
                    if !expressions.first_stage {
                        self.execute_merge_aggregated(
                            pipeline,
                            &expressions,
                            aggregate_overflow_row,
                            aggregate_final,
                        )?;
                    }
                    if !aggregate_final {
                        self.execute_totals_and_having(
                            pipeline,
                            &expressions,
                            expressions.before_having.as_ref().filter(|_| expressions.has_having),
                            aggregate_overflow_row,
                        )?;
                    } else if let Some(step) = &expressions.before_having {
                        self.execute_having(pipeline, step)?;
                    }
                    let actions =
                        required(&expressions.before_order_and_select, "before order and select")?;
                    self.execute_expression(pipeline, actions)?;
                    self.execute_distinct(pipeline, &expressions, true)?;

                    need_second_distinct_pass = distinct && pipeline.has_more_than_one_stream();
                } else {
                    need_second_distinct_pass = distinct && pipeline.has_more_than_one_stream();

                    if self.with_totals && !aggregate_final {
                        self.execute_totals_and_having(
                            pipeline,
                            &expressions,
                            None,
                            aggregate_overflow_row,
                        )?;
                    }
                }

                if expressions.has_order_by {
                    // Without aggregation on a node that did no first-stage
                    // work, the inputs arrive already sorted.
                    if !expressions.first_stage
                        && !expressions.need_aggregate
                        && !(self.with_totals && !aggregate_final)
                    {
                        self.execute_merge_sorted(pipeline, &expressions)?;
                    } else {
                        self.execute_order(pipeline, &expressions)?;
                    }
                }

                if query_has_limit
                    && pipeline.has_more_than_one_stream()
                    && !distinct
                    && !expressions.has_limit_by
                    && !settings.extremes
                {
                    self.execute_pre_limit(pipeline)?;
                }

                let need_merge_streams = need_second_distinct_pass
                    || query_has_limit
                    || self.query().limit_by.is_some()
                    || !pipeline.streams_with_non_joined_data.is_empty();
                if need_merge_streams {
                    trace!("union before final steps");
                    pipeline.union_all()?;
                }

                if need_second_distinct_pass {
                    self.execute_distinct(pipeline, &expressions, false)?;
                }

                if expressions.has_limit_by {
                    let actions = required(&expressions.before_limit_by, "before limit by")?;
                    self.execute_expression(pipeline, actions)?;
                    self.execute_limit_by(pipeline, &expressions)?;
                }

                // Projection goes after DISTINCT, which reads columns the
                // projection may drop.
                if let Some(actions) = &expressions.final_projection {
                    self.execute_expression(pipeline, actions)?;
                }

                // Extremes are computed before LIMIT and after LIMIT BY.
                if settings.extremes {
                    pipeline.for_each_mut(BatchStream::enable_extremes);
                }

                self.execute_limit(pipeline, &expressions)?;
            }
        }

        if !expressions.subqueries_for_sets.is_empty() {
            self.execute_subqueries_in_sets_and_joins(pipeline, &expressions, dry_run)?;
        }
        Ok(())
    }

    fn analyze(&mut self, from_stage: ProcessingStage, dry_run: bool) -> Result<AnalysisResult> {
        let expressions = AnalysisResult::analyze(
            &mut self.analyzer,
            from_stage,
            self.to_stage,
            self.with_totals,
            self.context.settings(),
        )?;
        self.prepared_sets = self.prepare_sets(&expressions.subqueries_for_sets, dry_run)?;
        trace!(
            need_aggregate = expressions.need_aggregate,
            first_stage = expressions.first_stage,
            second_stage = expressions.second_stage,
            sets = expressions.subqueries_for_sets.len(),
            "expressions analyzed"
        );
        trace!(plan = %explain_analysis(&expressions), "analysis");
        Ok(expressions)
    }

    /// Creates the empty set and join objects the actions probe. Their
    /// contents come from the subquery streams wrapped around the pipeline
    /// last.
    fn prepare_sets(
        &self,
        subqueries: &[SubqueryForSet],
        dry_run: bool,
    ) -> Result<PreparedSets> {
        let mut sets = PreparedSets::new();
        for subquery in subqueries.iter() {
            let set = match &subquery.target {
                SetTarget::Set => PreparedSet::Set(Arc::new(Set::new())),
                SetTarget::Join(descriptor) => {
                    let mut interpreter = InterpreterSelectWithUnionQuery::new(
                        subquery.query.clone(),
                        subquery_context(&self.context),
                        ProcessingStage::Complete,
                        self.subquery_depth + 1,
                        dry_run,
                    )?;
                    let header = interpreter.sample_block()?;
                    PreparedSet::Join(Arc::new(HashJoin::new(descriptor.clone(), header)?))
                }
            };
            sets.insert(subquery.name.clone(), set);
        }
        Ok(sets)
    }

    fn execute_fetch_columns(
        &self,
        pipeline: &mut Pipeline,
        required_source_columns: &[String],
        from_stage: ProcessingStage,
        dry_run: bool,
    ) -> Result<ProcessingStage> {
        let settings = self.context.settings().clone();
        let mut required_columns = required_source_columns.to_vec();

        // ALIAS columns are computed from the physical ones right after reading.
        let mut alias_actions = None;
        if let Some(locked) = &self.storage {
            let aliases = locked.storage.alias_columns();
            if required_columns.iter().any(|c| aliases.iter().any(|a| &a.name == c)) {
                let physical = column_names(&locked.storage.schema());
                let mut list = ActionList::new(physical);
                for column in &required_columns {
                    if let Some(alias) = aliases.iter().find(|a| &a.name == column) {
                        list.add(Action::Compute {
                            expr: alias.expr.clone(),
                            name: alias.name.clone(),
                        });
                    }
                }
                let output = required_columns.clone();
                required_columns = list.finalize(&output)?;
                alias_actions = Some(list);
            }
        }

        let max_columns = settings.max_columns_to_read;
        if !dry_run && max_columns > 0 && required_columns.len() > max_columns {
            return Err(FqError::InvalidConfig(format!(
                "limit for number of columns to read exceeded: requested {}, maximum {max_columns}",
                required_columns.len()
            )));
        }

        let (limit_length, limit_offset) = self.query().limit_length_and_offset();
        let mut max_streams = settings.max_threads;
        let is_remote = self.storage.as_ref().is_some_and(|s| s.storage.is_remote());
        if is_remote {
            max_streams = settings.max_distributed_connections;
        }

        // With only LIMIT, and LIMIT smaller than a block, read no more rows
        // than requested and do it in one stream.
        let mut max_block_size = settings.max_block_size;
        let query = self.query();
        let limit_rows =
            usize::try_from(limit_length.saturating_add(limit_offset)).unwrap_or(usize::MAX);
        if !query.distinct
            && query.prewhere.is_none()
            && query.where_clause.is_none()
            && query.group_by.is_empty()
            && query.having.is_none()
            && query.order_by.is_empty()
            && query.limit_by.is_none()
            && query.limit.is_some()
            && !self.analyzer.has_aggregation()
            && limit_rows < max_block_size
        {
            max_block_size = limit_rows.max(1);
            max_streams = 1;
        }

        let mut from_stage = from_stage;
        if !pipeline.streams.is_empty() {
            trace!("reading prepared input");
        } else if let Some(sub) = &self.subquery {
            let mut interpreter = InterpreterSelectWithUnionQuery::new(
                sub.clone(),
                subquery_context(&self.context),
                ProcessingStage::Complete,
                self.subquery_depth + 1,
                dry_run,
            )?;
            if self.analyzer.has_aggregation() {
                interpreter.ignore_with_totals();
            }
            if dry_run {
                let header = match &self.subquery_header {
                    Some(h) => h.clone(),
                    None => interpreter.sample_block()?,
                };
                pipeline.streams.push(BatchStream::null(header));
            } else {
                pipeline.streams = interpreter.execute_with_multiple_streams()?;
            }
            self.retain_columns(pipeline, &required_columns)?;
        } else if let Some(locked) = &self.storage {
            if max_streams == 0 {
                return Err(FqError::Execution(
                    "logical error: zero number of streams requested".to_string(),
                ));
            }
            if max_streams > 1 && !is_remote {
                max_streams =
                    ((max_streams as f64) * settings.max_streams_to_max_threads_ratio) as usize;
                max_streams = max_streams.max(1);
            }

            let query_info = SelectQueryInfo {
                query: self.analyzer.query().clone(),
                sets: self.prepared_sets.clone(),
            };
            if !dry_run {
                let (streams, stage) = locked.storage.read(
                    &required_columns,
                    &query_info,
                    &settings,
                    from_stage,
                    max_block_size,
                    max_streams,
                )?;
                pipeline.streams = streams;
                from_stage = stage;
            }
            if pipeline.streams.is_empty() {
                let header =
                    locked
                        .storage
                        .read_header(&required_columns, &query_info, &settings, from_stage)?;
                pipeline.streams.push(BatchStream::null(header));
            }

            let lock = &locked.lock;
            pipeline.for_each_mut(|stream| stream.add_table_lock(lock.clone()));

            // Quota and minimal speed are checked where the whole query is
            // seen; size and time limits are checked on every node.
            let mut limits = LocalLimits::for_read(&settings);
            let complete = self.to_stage == ProcessingStage::Complete;
            if complete {
                limits.min_execution_speed = settings.min_execution_speed;
            }
            let quota = self.context.quota();
            pipeline.for_each_mut(|stream| {
                stream.set_limits(limits);
                if complete {
                    stream.set_quota(quota.register());
                }
            });
            trace!(
                table = locked.storage.name(),
                streams = pipeline.streams.len(),
                max_block_size,
                "source streams opened"
            );
        } else {
            return Err(FqError::Execution(
                "logical error in select interpreter: nowhere to read".to_string(),
            ));
        }

        if from_stage == ProcessingStage::FetchColumns {
            if let Some(list) = &alias_actions {
                self.execute_expression(pipeline, list)?;
            }
        }
        Ok(from_stage)
    }

    /// Narrows a subquery's output to the columns this query reads.
    fn retain_columns(&self, pipeline: &mut Pipeline, columns: &[String]) -> Result<()> {
        let header = pipeline.header()?;
        if column_names(&header) == columns {
            return Ok(());
        }
        let mut list = ActionList::new(column_names(&header));
        list.add(Action::Retain(columns.to_vec()));
        self.execute_expression(pipeline, &list)
    }

    fn execute_expression(&self, pipeline: &mut Pipeline, actions: &ActionList) -> Result<()> {
        let sets = &self.prepared_sets;
        pipeline.transform(|stream| {
            let compiled = ExpressionActions::compile(actions, stream.schema(), sets)?;
            BatchStream::expression(stream, compiled)
        })
    }

    /// Probes the join on the main streams; RIGHT and FULL joins add a side
    /// stream of right rows nothing matched.
    fn execute_join(
        &self,
        pipeline: &mut Pipeline,
        expressions: &AnalysisResult,
        max_block_size: usize,
    ) -> Result<()> {
        let actions = required(&expressions.before_join, "before join")?;
        let kind = expressions.join.as_ref().map(|j| j.kind);
        if kind.is_some_and(|k| k.is_right_or_full()) {
            let header = pipeline.header()?;
            let compiled = ExpressionActions::compile(actions, header, &self.prepared_sets)?;
            pipeline
                .streams_with_non_joined_data
                .push(BatchStream::non_joined(compiled, max_block_size)?);
        }
        pipeline.streams = std::mem::take(&mut pipeline.streams)
            .into_iter()
            .map(|stream| {
                let compiled =
                    ExpressionActions::compile(actions, stream.schema(), &self.prepared_sets)?;
                BatchStream::expression(stream, compiled)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    fn execute_where(&self, pipeline: &mut Pipeline, step: &FilterStep) -> Result<()> {
        self.execute_filter(pipeline, step)
    }

    fn execute_having(&self, pipeline: &mut Pipeline, step: &FilterStep) -> Result<()> {
        self.execute_filter(pipeline, step)
    }

    fn execute_filter(&self, pipeline: &mut Pipeline, step: &FilterStep) -> Result<()> {
        let sets = &self.prepared_sets;
        pipeline.transform(|stream| {
            let compiled = ExpressionActions::compile(&step.actions, stream.schema(), sets)?;
            BatchStream::filter(stream, compiled, &step.column, step.remove_column)
        })
    }

    fn execute_aggregation(
        &self,
        pipeline: &mut Pipeline,
        expressions: &AnalysisResult,
        actions: &ActionList,
        overflow_row: bool,
        final_: bool,
    ) -> Result<()> {
        self.execute_expression(pipeline, actions)?;

        let settings = self.context.settings();
        // Two-level tables pay off when partial results are merged in
        // parallel or spilled to disk.
        let allow_two_level =
            pipeline.streams.len() > 1 || settings.max_bytes_before_external_group_by != 0;
        let params = AggregatorParams::from_settings(
            expressions.aggregation_keys.clone(),
            expressions.aggregates.clone(),
            overflow_row,
            allow_two_level,
            settings,
        );

        let main = std::mem::take(&mut pipeline.streams);
        let side = std::mem::take(&mut pipeline.streams_with_non_joined_data);
        let stream = if main.len() > 1 || side.len() > 1 {
            trace!(main = main.len(), side = side.len(), "parallel aggregation");
            BatchStream::parallel_aggregating(main, side, params, final_)?
        } else {
            let mut inputs = main.into_iter().chain(side).collect::<Vec<_>>();
            let input = match inputs.len() {
                0 => return Err(FqError::Planning("aggregation over zero streams".to_string())),
                1 => inputs.remove(0),
                _ => BatchStream::concat(inputs)?,
            };
            BatchStream::aggregating(input, params, final_)?
        };
        pipeline.streams = vec![stream];
        Ok(())
    }

    fn execute_merge_aggregated(
        &self,
        pipeline: &mut Pipeline,
        expressions: &AnalysisResult,
        overflow_row: bool,
        final_: bool,
    ) -> Result<()> {
        let params = AggregatorParams::for_merge(
            expressions.aggregation_keys.clone(),
            expressions.aggregates.clone(),
            overflow_row,
        );
        if !self.context.settings().distributed_aggregation_memory_efficient {
            // Glue everything, then merge in memory.
            pipeline.union_all()?;
            pipeline.reduce_to_one(|mut inputs| {
                BatchStream::merging_aggregated(inputs.remove(0), params, final_)
            })
        } else {
            // Merge bucket by bucket while the streams are still separate.
            pipeline.reduce_to_one(|inputs| {
                BatchStream::merging_aggregated_memory_efficient(inputs, params, final_)
            })
        }
    }

    fn execute_totals_and_having(
        &self,
        pipeline: &mut Pipeline,
        expressions: &AnalysisResult,
        having: Option<&FilterStep>,
        overflow_row: bool,
    ) -> Result<()> {
        pipeline.union_all()?;
        let settings = self.context.settings();
        let params = TotalsHavingParams {
            aggregation: expressions.need_aggregate.then(|| {
                AggregatorParams::for_merge(
                    expressions.aggregation_keys.clone(),
                    expressions.aggregates.clone(),
                    overflow_row,
                )
            }),
            having: having.cloned(),
            overflow_row,
            totals_mode: settings.totals_mode,
            totals_auto_threshold: settings.totals_auto_threshold,
        };
        let sets = &self.prepared_sets;
        pipeline.reduce_to_one(|mut inputs| {
            BatchStream::totals_having(inputs.remove(0), params, sets)
        })
    }

    fn execute_distinct(
        &self,
        pipeline: &mut Pipeline,
        expressions: &AnalysisResult,
        before_order: bool,
    ) -> Result<()> {
        let query = self.query();
        if !query.distinct {
            return Ok(());
        }
        let (length, offset) = query.limit_length_and_offset();
        // A following ORDER BY needs every distinct row.
        let limit_hint = if !expressions.has_order_by || !before_order {
            usize::try_from(length.saturating_add(offset)).unwrap_or(usize::MAX)
        } else {
            0
        };
        let settings = self.context.settings();
        let limits = SizeLimits::new(
            settings.max_rows_in_distinct,
            settings.max_bytes_in_distinct,
            settings.distinct_overflow_mode,
        );
        let columns = &expressions.selected_columns;
        pipeline.transform(|stream| BatchStream::distinct(stream, columns, limits, limit_hint))
    }

    /// Rows the sort must produce: `offset + length` unless DISTINCT or
    /// LIMIT BY still drop rows after it.
    fn limit_for_sorting(&self) -> usize {
        let query = self.query();
        if !query.distinct && query.limit_by.is_none() {
            let (length, offset) = query.limit_length_and_offset();
            usize::try_from(length.saturating_add(offset)).unwrap_or(usize::MAX)
        } else {
            0
        }
    }

    fn execute_order(&self, pipeline: &mut Pipeline, expressions: &AnalysisResult) -> Result<()> {
        let description: Vec<SortColumn> = expressions.order_by.clone();
        let limit = self.limit_for_sorting();
        let settings = self.context.settings();

        let sort_limits = LocalLimits {
            size: SizeLimits::new(
                settings.max_rows_to_sort,
                settings.max_bytes_to_sort,
                settings.sort_overflow_mode,
            ),
            ..LocalLimits::default()
        };
        pipeline.transform(|stream| {
            let mut sorting = BatchStream::partial_sorting(stream, description.clone(), limit);
            sorting.set_limits(sort_limits);
            Ok(sorting)
        })?;

        // Glue the sorted blocks, then merge them.
        pipeline.union_all()?;
        let params = MergeSortParams {
            description,
            max_block_size: settings.max_block_size,
            limit,
            max_bytes_before_external_sort: settings.max_bytes_before_external_sort,
            tmp_path: settings.tmp_path.clone().into(),
        };
        pipeline.reduce_to_one(|mut inputs| BatchStream::merge_sorting(inputs.remove(0), params))
    }

    fn execute_merge_sorted(
        &self,
        pipeline: &mut Pipeline,
        expressions: &AnalysisResult,
    ) -> Result<()> {
        if !pipeline.has_more_than_one_stream() {
            return Ok(());
        }
        let description = expressions.order_by.clone();
        let limit = self.limit_for_sorting();
        let max_block_size = self.context.settings().max_block_size;

        // Each input is read ahead on its own thread while the merge runs.
        pipeline.transform(|stream| Ok(BatchStream::prefetch(stream)))?;
        pipeline.reduce_to_one(|inputs| {
            BatchStream::merging_sorted(inputs, description, max_block_size, limit)
        })
    }

    fn execute_pre_limit(&self, pipeline: &mut Pipeline) -> Result<()> {
        let (length, offset) = self.query().limit_length_and_offset();
        let rows = length.saturating_add(offset);
        pipeline.transform(|stream| Ok(BatchStream::limit(stream, rows, 0, false)))
    }

    fn execute_limit_by(&self, pipeline: &mut Pipeline, expressions: &AnalysisResult) -> Result<()> {
        let Some(limit_by) = &expressions.limit_by else {
            return Ok(());
        };
        pipeline.transform(|stream| BatchStream::limit_by(stream, limit_by.length, &limit_by.columns))
    }

    fn execute_limit(&self, pipeline: &mut Pipeline, expressions: &AnalysisResult) -> Result<()> {
        let query = self.query();
        let Some(limit) = query.limit else {
            return Ok(());
        };
        // Totals must cover the rows LIMIT would otherwise leave unread:
        // WITH TOTALS without ORDER BY, or WITH TOTALS anywhere in the FROM
        // subqueries, since the inner totals may depend on how much is read.
        let always_read_till_end = (self.with_totals && !expressions.has_order_by)
            || (!self.with_totals && query.has_with_totals_in_any_subquery_in_from());
        pipeline.transform(|stream| {
            Ok(BatchStream::limit(
                stream,
                limit.length,
                limit.offset,
                always_read_till_end,
            ))
        })
    }

    fn execute_subqueries_in_sets_and_joins(
        &self,
        pipeline: &mut Pipeline,
        expressions: &AnalysisResult,
        dry_run: bool,
    ) -> Result<()> {
        pipeline.union_all()?;
        if dry_run {
            return Ok(());
        }
        let mut sources = Vec::with_capacity(expressions.subqueries_for_sets.len());
        for subquery in &expressions.subqueries_for_sets {
            let target = self.prepared_sets.get(&subquery.name).cloned().ok_or_else(|| {
                FqError::Planning(format!("set {} is not prepared", subquery.name))
            })?;
            let interpreter = InterpreterSelectWithUnionQuery::new(
                subquery.query.clone(),
                subquery_context(&self.context),
                ProcessingStage::Complete,
                self.subquery_depth + 1,
                false,
            )?;
            sources.push(SetSource {
                name: subquery.name.clone(),
                source: interpreter.execute()?.stream,
                target,
            });
        }
        let settings = self.context.settings();
        let transfer = SizeLimits::new(
            settings.max_rows_to_transfer,
            settings.max_bytes_to_transfer,
            settings.transfer_overflow_mode,
        );
        pipeline.reduce_to_one(|mut inputs| {
            Ok(BatchStream::creating_sets(inputs.remove(0), sources, transfer))
        })
    }
}

fn check_stages(from: ProcessingStage, to: ProcessingStage) -> Result<()> {
    if from == ProcessingStage::WithMergeableState && to == ProcessingStage::WithMergeableState {
        return Err(FqError::InvalidConfig(
            "distributed on distributed is not supported".to_string(),
        ));
    }
    Ok(())
}

fn required<'a, T>(step: &'a Option<T>, what: &str) -> Result<&'a T> {
    step.as_ref()
        .ok_or_else(|| FqError::Planning(format!("analysis produced no {what} actions")))
}
