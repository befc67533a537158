//! Hash aggregation over blocks.
//!
//! An [`Aggregator`] is bound to one input header. Built with
//! [`Aggregator::new`] it consumes raw rows (key and argument columns); built
//! with [`Aggregator::for_merge`] it consumes partial-state blocks produced by
//! another aggregator. Either way the accumulated [`AggregatedData`] converts
//! to partial blocks (mergeable later) or final blocks.
//!
//! Partial layout: key columns, one value column per aggregate, then a hidden
//! `__fq_avg_count_<name>` column per `avg`. Final layout: keys then aggregates.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, RecordBatch, UInt32Array};
use arrow::compute::take;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use fq_common::{FqError, OverflowMode, Result, Settings};
use fq_planner::{AggFunc, AggregateDescription};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::block::{Block, BlockInfo, batch_with_columns};
use crate::scalar::{
    ScalarValue, as_f64, default_scalar, encode_group_key, encode_row, hash_encoded_key,
    scalar_from_array, scalar_gt, scalar_lt, scalar_type, scalars_to_array,
};
use crate::spill::SpillFile;

const AVG_COUNT_PREFIX: &str = "__fq_avg_count_";

/// Number of buckets of two-level aggregation output.
pub const TWO_LEVEL_BUCKETS: usize = 256;

/// Name of the hidden row-count column carried next to a partial `avg`.
pub fn avg_count_col_name(name: &str) -> String {
    format!("{AVG_COUNT_PREFIX}{name}")
}

/// Construction parameters of an [`Aggregator`].
#[derive(Debug, Clone)]
pub struct AggregatorParams {
    pub keys: Vec<String>,
    pub aggregates: Vec<AggregateDescription>,
    /// Keep one extra row of states for keys dropped by `max_rows_to_group_by`.
    pub overflow_row: bool,
    pub max_rows_to_group_by: u64,
    pub group_by_overflow_mode: OverflowMode,
    /// Distinct keys before the table converts to two-level; zero disables.
    pub group_by_two_level_threshold: u64,
    pub group_by_two_level_threshold_bytes: u64,
    pub max_bytes_before_external_group_by: u64,
    pub empty_result_for_aggregation_by_empty_set: bool,
    pub tmp_path: PathBuf,
}

impl AggregatorParams {
    /// Parameters of the aggregation step, taken from the query settings.
    pub fn from_settings(
        keys: Vec<String>,
        aggregates: Vec<AggregateDescription>,
        overflow_row: bool,
        allow_two_level: bool,
        settings: &Settings,
    ) -> Self {
        let (rows, bytes) = if allow_two_level {
            (
                settings.group_by_two_level_threshold,
                settings.group_by_two_level_threshold_bytes,
            )
        } else {
            (0, 0)
        };
        Self {
            keys,
            aggregates,
            overflow_row,
            max_rows_to_group_by: settings.max_rows_to_group_by,
            group_by_overflow_mode: settings.group_by_overflow_mode,
            group_by_two_level_threshold: rows,
            group_by_two_level_threshold_bytes: bytes,
            max_bytes_before_external_group_by: settings.max_bytes_before_external_group_by,
            empty_result_for_aggregation_by_empty_set: settings
                .empty_result_for_aggregation_by_empty_set,
            tmp_path: PathBuf::from(&settings.tmp_path),
        }
    }

    /// Parameters for merging partial states: no caps, no spilling.
    pub fn for_merge(
        keys: Vec<String>,
        aggregates: Vec<AggregateDescription>,
        overflow_row: bool,
    ) -> Self {
        Self {
            keys,
            aggregates,
            overflow_row,
            max_rows_to_group_by: 0,
            group_by_overflow_mode: OverflowMode::Throw,
            group_by_two_level_threshold: 0,
            group_by_two_level_threshold_bytes: 0,
            max_bytes_before_external_group_by: 0,
            empty_result_for_aggregation_by_empty_set: false,
            tmp_path: PathBuf::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum AggState {
    Count(i64),
    SumInt(i64),
    SumFloat(f64),
    Min(Option<ScalarValue>),
    Max(Option<ScalarValue>),
    Avg { sum: f64, count: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GroupEntry {
    key: Vec<ScalarValue>,
    states: Vec<AggState>,
}

#[derive(Debug, Clone)]
struct AggSpec {
    func: AggFunc,
    name: String,
    /// Type of the value column in both layouts.
    value_type: DataType,
    /// Argument column (raw input) or value column (partial input).
    input: Option<usize>,
    /// Hidden count column of a partial `avg`.
    avg_count: Option<usize>,
}

/// Accumulated states of one or more aggregated inputs.
#[derive(Debug, Default)]
pub struct AggregatedData {
    groups: HashMap<Vec<u8>, GroupEntry>,
    overflow: Option<Vec<AggState>>,
    no_more_keys: bool,
    two_level: bool,
    spills: Vec<SpillFile>,
    rows: u64,
}

impl AggregatedData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Distinct keys held in memory, not counting the overflow row.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.overflow.is_none() && self.spills.is_empty()
    }

    pub fn is_two_level(&self) -> bool {
        self.two_level
    }

    /// Input rows consumed.
    pub fn rows(&self) -> u64 {
        self.rows
    }
}

/// Aggregate states of a single row, used for totals.
#[derive(Debug, Clone)]
pub struct AggregateStates(Vec<AggState>);

/// Hash aggregator bound to one input header.
#[derive(Debug, Clone)]
pub struct Aggregator {
    params: AggregatorParams,
    key_idx: Vec<usize>,
    key_types: Vec<DataType>,
    specs: Vec<AggSpec>,
    merging: bool,
}

impl Aggregator {
    /// Aggregator over raw rows carrying the key and argument columns.
    pub fn new(input: &SchemaRef, params: AggregatorParams) -> Result<Self> {
        let (key_idx, key_types) = resolve_keys(input, &params.keys)?;
        let mut specs = Vec::with_capacity(params.aggregates.len());
        for desc in &params.aggregates {
            let (input_idx, arg_type) = match &desc.argument {
                Some(arg) => {
                    let idx = column_index(input, arg)?;
                    (Some(idx), scalar_type(input.field(idx).data_type())?)
                }
                None => (None, DataType::Int64),
            };
            let value_type = match desc.func {
                AggFunc::Count => DataType::Int64,
                AggFunc::Sum if arg_type == DataType::Int64 => DataType::Int64,
                AggFunc::Sum | AggFunc::Avg => DataType::Float64,
                AggFunc::Min | AggFunc::Max => arg_type,
            };
            specs.push(AggSpec {
                func: desc.func,
                name: desc.column_name.clone(),
                value_type,
                input: input_idx,
                avg_count: None,
            });
        }
        Ok(Self {
            params,
            key_idx,
            key_types,
            specs,
            merging: false,
        })
    }

    /// Aggregator over blocks in the partial layout.
    pub fn for_merge(input: &SchemaRef, params: AggregatorParams) -> Result<Self> {
        let (key_idx, key_types) = resolve_keys(input, &params.keys)?;
        let mut specs = Vec::with_capacity(params.aggregates.len());
        for desc in &params.aggregates {
            let idx = column_index(input, &desc.column_name)?;
            let avg_count = if desc.func == AggFunc::Avg {
                Some(column_index(input, &avg_count_col_name(&desc.column_name))?)
            } else {
                None
            };
            specs.push(AggSpec {
                func: desc.func,
                name: desc.column_name.clone(),
                value_type: scalar_type(input.field(idx).data_type())?,
                input: Some(idx),
                avg_count,
            });
        }
        Ok(Self {
            params,
            key_idx,
            key_types,
            specs,
            merging: true,
        })
    }

    pub fn params(&self) -> &AggregatorParams {
        &self.params
    }

    /// Header of converted blocks.
    pub fn header(&self, final_: bool) -> SchemaRef {
        let mut fields = Vec::with_capacity(self.key_types.len() + self.specs.len());
        for (name, dt) in self.params.keys.iter().zip(&self.key_types) {
            fields.push(Field::new(name, dt.clone(), true));
        }
        for spec in &self.specs {
            fields.push(Field::new(&spec.name, spec.value_type.clone(), true));
        }
        if !final_ {
            for spec in self.specs.iter().filter(|s| s.func == AggFunc::Avg) {
                fields.push(Field::new(avg_count_col_name(&spec.name), DataType::Int64, true));
            }
        }
        Arc::new(Schema::new(fields))
    }

    fn init_states(&self) -> Vec<AggState> {
        self.specs
            .iter()
            .map(|s| match s.func {
                AggFunc::Count => AggState::Count(0),
                AggFunc::Sum if s.value_type == DataType::Int64 => AggState::SumInt(0),
                AggFunc::Sum => AggState::SumFloat(0.0),
                AggFunc::Min => AggState::Min(None),
                AggFunc::Max => AggState::Max(None),
                AggFunc::Avg => AggState::Avg { sum: 0.0, count: 0 },
            })
            .collect()
    }

    /// Adds one block to `data`.
    ///
    /// Returns `Ok(false)` when `max_rows_to_group_by` was crossed under
    /// [`OverflowMode::Break`]: the caller stops reading its input. Under
    /// [`OverflowMode::Any`] existing keys keep aggregating and new keys go to
    /// the overflow row (or are dropped without one).
    pub fn execute_on_block(&self, data: &mut AggregatedData, batch: &RecordBatch) -> Result<bool> {
        if self.params.overflow_row && data.overflow.is_none() {
            data.overflow = Some(self.init_states());
        }
        let keys = self
            .key_idx
            .iter()
            .map(|&i| batch.column(i).clone())
            .collect::<Vec<_>>();
        let args = self
            .specs
            .iter()
            .map(|s| s.input.map(|i| batch.column(i).clone()))
            .collect::<Vec<_>>();
        let counts = self
            .specs
            .iter()
            .map(|s| s.avg_count.map(|i| batch.column(i).clone()))
            .collect::<Vec<_>>();

        for row in 0..batch.num_rows() {
            let (key, encoded) = encode_row(&keys, row)?;
            let states = if !data.no_more_keys || data.groups.contains_key(&encoded) {
                &mut data
                    .groups
                    .entry(encoded)
                    .or_insert_with(|| GroupEntry {
                        key,
                        states: self.init_states(),
                    })
                    .states
            } else {
                match data.overflow.as_mut() {
                    Some(overflow) => overflow,
                    None => continue,
                }
            };
            self.update_row(states, &args, &counts, row)?;
        }
        data.rows += batch.num_rows() as u64;

        if !self.check_limits(data)? {
            return Ok(false);
        }
        self.maybe_convert_to_two_level(data);
        self.maybe_spill(data)?;
        Ok(true)
    }

    fn update_row(
        &self,
        states: &mut [AggState],
        args: &[Option<ArrayRef>],
        counts: &[Option<ArrayRef>],
        row: usize,
    ) -> Result<()> {
        for (idx, state) in states.iter_mut().enumerate() {
            let value = match &args[idx] {
                Some(a) => Some(scalar_from_array(a, row)?),
                None => None,
            };
            if self.merging {
                let count = match &counts[idx] {
                    Some(a) => match scalar_from_array(a, row)? {
                        ScalarValue::Int64(v) => v,
                        _ => 0,
                    },
                    None => 0,
                };
                merge_partial(state, value.unwrap_or(ScalarValue::Null), count)?;
            } else {
                update_state(state, value)?;
            }
        }
        Ok(())
    }

    fn check_limits(&self, data: &mut AggregatedData) -> Result<bool> {
        let max = self.params.max_rows_to_group_by;
        if data.no_more_keys || max == 0 || (data.groups.len() as u64) <= max {
            return Ok(true);
        }
        match self.params.group_by_overflow_mode {
            OverflowMode::Throw => Err(FqError::LimitExceeded(format!(
                "limit for rows to GROUP BY exceeded: has {} rows, maximum: {max}",
                data.groups.len()
            ))),
            OverflowMode::Break => Ok(false),
            OverflowMode::Any => {
                data.no_more_keys = true;
                Ok(true)
            }
        }
    }

    fn maybe_convert_to_two_level(&self, data: &mut AggregatedData) {
        if data.two_level || self.key_idx.is_empty() {
            return;
        }
        let rows = self.params.group_by_two_level_threshold;
        let bytes = self.params.group_by_two_level_threshold_bytes;
        if (rows != 0 && data.groups.len() as u64 >= rows)
            || (bytes != 0 && estimate_groups_bytes(&data.groups) >= bytes)
        {
            debug!(keys = data.groups.len(), "converting aggregation to two-level");
            data.two_level = true;
        }
    }

    fn maybe_spill(&self, data: &mut AggregatedData) -> Result<()> {
        let threshold = self.params.max_bytes_before_external_group_by;
        if threshold == 0 || data.groups.is_empty() || self.key_idx.is_empty() {
            return Ok(());
        }
        let estimated = estimate_groups_bytes(&data.groups);
        if estimated <= threshold {
            return Ok(());
        }
        let spill = SpillFile::create(&self.params.tmp_path, "agg_spill", "jsonl")?;
        let file = File::create(spill.path())?;
        let mut writer = BufWriter::new(file);
        for (_, entry) in data.groups.drain() {
            let line = serde_json::to_string(&entry)
                .map_err(|e| FqError::Execution(format!("spill serialize failed: {e}")))?;
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        debug!(
            path = %spill.path().display(),
            estimated_bytes = estimated,
            "spilled aggregation state"
        );
        data.two_level = true;
        data.spills.push(spill);
        Ok(())
    }

    /// Merges a partial-state block; blocks flagged `is_overflows` go to the
    /// overflow row.
    pub fn merge_block(&self, data: &mut AggregatedData, block: &Block) -> Result<()> {
        if !block.info.is_overflows {
            self.execute_on_block(data, &block.batch)?;
            return Ok(());
        }
        let args = self
            .specs
            .iter()
            .map(|s| s.input.map(|i| block.batch.column(i).clone()))
            .collect::<Vec<_>>();
        let counts = self
            .specs
            .iter()
            .map(|s| s.avg_count.map(|i| block.batch.column(i).clone()))
            .collect::<Vec<_>>();
        let mut overflow = data.overflow.take().unwrap_or_else(|| self.init_states());
        for row in 0..block.num_rows() {
            self.update_row(&mut overflow, &args, &counts, row)?;
        }
        data.overflow = Some(overflow);
        Ok(())
    }

    /// Moves every state of `other` into `target`.
    pub fn merge_data(&self, target: &mut AggregatedData, other: AggregatedData) -> Result<()> {
        for (encoded, entry) in other.groups {
            match target.groups.get_mut(&encoded) {
                Some(existing) => merge_states(&mut existing.states, &entry.states)?,
                None => {
                    target.groups.insert(encoded, entry);
                }
            }
        }
        if let Some(overflow) = other.overflow {
            match target.overflow.as_mut() {
                Some(existing) => merge_states(existing, &overflow)?,
                None => target.overflow = Some(overflow),
            }
        }
        target.two_level |= other.two_level;
        target.rows += other.rows;
        target.spills.extend(other.spills);
        Ok(())
    }

    /// Converts accumulated data into blocks: the overflow row first (flagged
    /// `is_overflows`), then either one single-level block or one block per
    /// non-empty two-level bucket. Rows are ordered by encoded key.
    pub fn convert_to_blocks(&self, mut data: AggregatedData, final_: bool) -> Result<Vec<Block>> {
        for spill in std::mem::take(&mut data.spills) {
            merge_spill_file(&spill, &mut data.groups)?;
        }
        if self.key_idx.is_empty()
            && data.groups.is_empty()
            && !self.params.empty_result_for_aggregation_by_empty_set
        {
            data.groups.insert(
                encode_group_key(&[]),
                GroupEntry {
                    key: vec![],
                    states: self.init_states(),
                },
            );
        }

        let mut blocks = Vec::new();
        if let Some(overflow) = &data.overflow {
            if !self.key_idx.is_empty() {
                let entry = GroupEntry {
                    key: self.key_types.iter().map(default_scalar).collect(),
                    states: overflow.clone(),
                };
                let batch = self.entries_to_batch(&[&entry], final_)?;
                blocks.push(Block::with_info(
                    batch,
                    BlockInfo {
                        is_overflows: true,
                        bucket_num: -1,
                    },
                ));
            }
        }

        let mut entries = data.groups.iter().collect::<Vec<_>>();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        if data.two_level {
            let mut buckets = vec![Vec::new(); TWO_LEVEL_BUCKETS];
            for (encoded, entry) in entries {
                buckets[bucket_of(encoded)].push(entry);
            }
            for (bucket, entries) in buckets.iter().enumerate() {
                if entries.is_empty() {
                    continue;
                }
                let batch = self.entries_to_batch(entries, final_)?;
                blocks.push(Block::with_info(
                    batch,
                    BlockInfo {
                        is_overflows: false,
                        bucket_num: bucket as i32,
                    },
                ));
            }
        } else if !entries.is_empty() {
            let entries = entries.into_iter().map(|(_, e)| e).collect::<Vec<_>>();
            blocks.push(Block::new(self.entries_to_batch(&entries, final_)?));
        }
        Ok(blocks)
    }

    fn entries_to_batch(&self, entries: &[&GroupEntry], final_: bool) -> Result<RecordBatch> {
        let header = self.header(final_);
        let mut columns = Vec::with_capacity(header.fields().len());
        for (kidx, dt) in self.key_types.iter().enumerate() {
            let values = entries.iter().map(|e| e.key[kidx].clone()).collect::<Vec<_>>();
            columns.push(scalars_to_array(&values, dt)?);
        }
        for (aidx, spec) in self.specs.iter().enumerate() {
            let values = entries
                .iter()
                .map(|e| state_value(&e.states[aidx], final_))
                .collect::<Vec<_>>();
            columns.push(scalars_to_array(&values, &spec.value_type)?);
        }
        if !final_ {
            for (aidx, _) in self.specs.iter().enumerate().filter(|(_, s)| s.func == AggFunc::Avg) {
                let values = entries
                    .iter()
                    .map(|e| match &e.states[aidx] {
                        AggState::Avg { count, .. } => ScalarValue::Int64(*count),
                        _ => ScalarValue::Null,
                    })
                    .collect::<Vec<_>>();
                columns.push(scalars_to_array(&values, &DataType::Int64)?);
            }
        }
        batch_with_columns(header, columns, entries.len())
    }

    /// Converts a partial-layout block (this aggregator's input) to the final layout.
    pub fn finalize_block(&self, batch: &RecordBatch) -> Result<RecordBatch> {
        let header = self.header(true);
        let mut columns = Vec::with_capacity(header.fields().len());
        for &idx in &self.key_idx {
            columns.push(batch.column(idx).clone());
        }
        for spec in &self.specs {
            let Some(idx) = spec.input else {
                return Err(FqError::Execution(
                    "finalize needs a partial-state input".to_string(),
                ));
            };
            let column = batch.column(idx);
            match spec.avg_count {
                Some(count_idx) => {
                    let counts = batch.column(count_idx);
                    let mut values = Vec::with_capacity(batch.num_rows());
                    for row in 0..batch.num_rows() {
                        let count = match scalar_from_array(counts, row)? {
                            ScalarValue::Int64(v) => v,
                            _ => 0,
                        };
                        let sum = as_f64(&scalar_from_array(column, row)?);
                        values.push(match sum {
                            Some(s) if count > 0 => ScalarValue::Float64Bits((s / count as f64).to_bits()),
                            _ => ScalarValue::Null,
                        });
                    }
                    columns.push(scalars_to_array(&values, &DataType::Float64)?);
                }
                None => columns.push(column.clone()),
            }
        }
        let columns = columns
            .into_iter()
            .zip(header.fields())
            .map(|(c, f)| relabel_type(c, f.data_type()))
            .collect::<Result<Vec<_>>>()?;
        batch_with_columns(header, columns, batch.num_rows())
    }

    pub fn new_states(&self) -> AggregateStates {
        AggregateStates(self.init_states())
    }

    /// Merges the partial-layout rows selected by `mask` (all rows when `None`)
    /// into `target`.
    pub fn accumulate_rows(
        &self,
        target: &mut AggregateStates,
        batch: &RecordBatch,
        mask: Option<&BooleanArray>,
    ) -> Result<()> {
        let args = self
            .specs
            .iter()
            .map(|s| s.input.map(|i| batch.column(i).clone()))
            .collect::<Vec<_>>();
        let counts = self
            .specs
            .iter()
            .map(|s| s.avg_count.map(|i| batch.column(i).clone()))
            .collect::<Vec<_>>();
        for row in 0..batch.num_rows() {
            if let Some(mask) = mask {
                if mask.is_null(row) || !mask.value(row) {
                    continue;
                }
            }
            self.update_row(&mut target.0, &args, &counts, row)?;
        }
        Ok(())
    }

    /// One final-layout row: default key values and the finalized `states`.
    pub fn totals_row(&self, states: &AggregateStates) -> Result<RecordBatch> {
        let entry = GroupEntry {
            key: self.key_types.iter().map(default_scalar).collect(),
            states: states.0.clone(),
        };
        self.entries_to_batch(&[&entry], true)
    }

    /// Splits a partial-layout block into two-level buckets by key hash.
    pub fn split_by_bucket(&self, batch: &RecordBatch) -> Result<Vec<(i32, RecordBatch)>> {
        let keys = self
            .key_idx
            .iter()
            .map(|&i| batch.column(i).clone())
            .collect::<Vec<_>>();
        let mut rows_by_bucket = vec![Vec::<u32>::new(); TWO_LEVEL_BUCKETS];
        for row in 0..batch.num_rows() {
            let (_, encoded) = encode_row(&keys, row)?;
            rows_by_bucket[bucket_of(&encoded)].push(row as u32);
        }
        let mut out = Vec::new();
        for (bucket, rows) in rows_by_bucket.into_iter().enumerate() {
            if rows.is_empty() {
                continue;
            }
            let indices = UInt32Array::from(rows);
            let columns = batch
                .columns()
                .iter()
                .map(|c| take(c.as_ref(), &indices, None))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| FqError::Execution(format!("bucket split failed: {e}")))?;
            out.push((
                bucket as i32,
                batch_with_columns(batch.schema(), columns, indices.len())?,
            ));
        }
        Ok(out)
    }
}

fn bucket_of(encoded: &[u8]) -> usize {
    (hash_encoded_key(encoded) % TWO_LEVEL_BUCKETS as u64) as usize
}

fn column_index(schema: &SchemaRef, name: &str) -> Result<usize> {
    schema
        .index_of(name)
        .map_err(|_| FqError::Planning(format!("aggregation input has no column {name}")))
}

fn resolve_keys(input: &SchemaRef, keys: &[String]) -> Result<(Vec<usize>, Vec<DataType>)> {
    let mut idx = Vec::with_capacity(keys.len());
    let mut types = Vec::with_capacity(keys.len());
    for key in keys {
        let i = column_index(input, key)?;
        idx.push(i);
        types.push(scalar_type(input.field(i).data_type())?);
    }
    Ok((idx, types))
}

fn relabel_type(column: ArrayRef, dt: &DataType) -> Result<ArrayRef> {
    if column.data_type() == dt {
        return Ok(column);
    }
    arrow::compute::cast(&column, dt)
        .map_err(|e| FqError::Execution(format!("aggregate column cast failed: {e}")))
}

fn estimate_groups_bytes(groups: &HashMap<Vec<u8>, GroupEntry>) -> u64 {
    groups
        .iter()
        .map(|(encoded, e)| {
            encoded.len()
                + e.key.iter().map(ScalarValue::estimate_bytes).sum::<usize>()
                + e.states.len() * std::mem::size_of::<AggState>()
                + 48
        })
        .sum::<usize>() as u64
}

fn update_state(state: &mut AggState, value: Option<ScalarValue>) -> Result<()> {
    match state {
        AggState::Count(acc) => {
            if !matches!(value, Some(ScalarValue::Null)) {
                *acc += 1;
            }
        }
        AggState::SumInt(acc) => {
            if let Some(ScalarValue::Int64(v)) = value {
                *acc = acc.wrapping_add(v);
            }
        }
        AggState::SumFloat(acc) => {
            if let Some(v) = value.as_ref().and_then(as_f64) {
                *acc += v;
            }
        }
        AggState::Min(cur) => update_min(cur, value.unwrap_or(ScalarValue::Null))?,
        AggState::Max(cur) => update_max(cur, value.unwrap_or(ScalarValue::Null))?,
        AggState::Avg { sum, count } => {
            if let Some(v) = value.as_ref().and_then(as_f64) {
                *sum += v;
                *count += 1;
            }
        }
    }
    Ok(())
}

fn merge_partial(state: &mut AggState, value: ScalarValue, rows: i64) -> Result<()> {
    match state {
        AggState::Count(acc) => {
            if let ScalarValue::Int64(v) = value {
                *acc += v;
            }
        }
        AggState::SumInt(acc) => {
            if let ScalarValue::Int64(v) = value {
                *acc = acc.wrapping_add(v);
            }
        }
        AggState::SumFloat(acc) => {
            if let Some(v) = as_f64(&value) {
                *acc += v;
            }
        }
        AggState::Min(cur) => update_min(cur, value)?,
        AggState::Max(cur) => update_max(cur, value)?,
        AggState::Avg { sum, count } => {
            if let Some(v) = as_f64(&value) {
                *sum += v;
            }
            *count += rows;
        }
    }
    Ok(())
}

fn update_min(cur: &mut Option<ScalarValue>, value: ScalarValue) -> Result<()> {
    if value.is_null() {
        return Ok(());
    }
    match cur {
        Some(existing) if !scalar_lt(&value, existing)? => {}
        _ => *cur = Some(value),
    }
    Ok(())
}

fn update_max(cur: &mut Option<ScalarValue>, value: ScalarValue) -> Result<()> {
    if value.is_null() {
        return Ok(());
    }
    match cur {
        Some(existing) if !scalar_gt(&value, existing)? => {}
        _ => *cur = Some(value),
    }
    Ok(())
}

fn merge_states(target: &mut [AggState], other: &[AggState]) -> Result<()> {
    if target.len() != other.len() {
        return Err(FqError::Execution(
            "aggregate state shape mismatch".to_string(),
        ));
    }
    for (t, o) in target.iter_mut().zip(other.iter()) {
        match (t, o) {
            (AggState::Count(a), AggState::Count(b)) => *a += *b,
            (AggState::SumInt(a), AggState::SumInt(b)) => *a = a.wrapping_add(*b),
            (AggState::SumFloat(a), AggState::SumFloat(b)) => *a += *b,
            (AggState::Min(a), AggState::Min(b)) => {
                if let Some(bv) = b {
                    update_min(a, bv.clone())?;
                }
            }
            (AggState::Max(a), AggState::Max(b)) => {
                if let Some(bv) = b {
                    update_max(a, bv.clone())?;
                }
            }
            (
                AggState::Avg {
                    sum: asum,
                    count: acount,
                },
                AggState::Avg {
                    sum: bsum,
                    count: bcount,
                },
            ) => {
                *asum += *bsum;
                *acount += *bcount;
            }
            _ => {
                return Err(FqError::Execution(
                    "aggregate state type mismatch".to_string(),
                ));
            }
        }
    }
    Ok(())
}

fn state_value(state: &AggState, final_: bool) -> ScalarValue {
    match state {
        AggState::Count(v) | AggState::SumInt(v) => ScalarValue::Int64(*v),
        AggState::SumFloat(v) => ScalarValue::Float64Bits(v.to_bits()),
        AggState::Min(v) | AggState::Max(v) => v.clone().unwrap_or(ScalarValue::Null),
        AggState::Avg { sum, count } => {
            if !final_ {
                ScalarValue::Float64Bits(sum.to_bits())
            } else if *count == 0 {
                ScalarValue::Null
            } else {
                ScalarValue::Float64Bits((sum / (*count as f64)).to_bits())
            }
        }
    }
}

fn merge_spill_file(spill: &SpillFile, groups: &mut HashMap<Vec<u8>, GroupEntry>) -> Result<()> {
    let reader = BufReader::new(File::open(spill.path())?);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: GroupEntry = serde_json::from_str(&line)
            .map_err(|e| FqError::Execution(format!("spill deserialize failed: {e}")))?;
        let encoded = encode_group_key(&entry.key);
        match groups.get_mut(&encoded) {
            Some(existing) => merge_states(&mut existing.states, &entry.states)?,
            None => {
                groups.insert(encoded, entry);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Array, Int64Array, StringArray};

    fn input() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Utf8, false),
            Field::new("v", DataType::Int64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["a", "b", "a", "c"])),
                Arc::new(Int64Array::from(vec![Some(1), Some(2), Some(3), None])),
            ],
        )
        .expect("batch")
    }

    fn aggregates() -> Vec<AggregateDescription> {
        vec![
            AggregateDescription {
                func: AggFunc::Count,
                argument: None,
                column_name: "count()".to_string(),
            },
            AggregateDescription {
                func: AggFunc::Sum,
                argument: Some("v".to_string()),
                column_name: "sum(v)".to_string(),
            },
            AggregateDescription {
                func: AggFunc::Avg,
                argument: Some("v".to_string()),
                column_name: "avg(v)".to_string(),
            },
        ]
    }

    fn params(keys: Vec<&str>) -> AggregatorParams {
        let mut p = AggregatorParams::for_merge(
            keys.into_iter().map(str::to_string).collect(),
            aggregates(),
            false,
        );
        p.tmp_path = std::env::temp_dir().join("fq_agg_test");
        p
    }

    fn i64_col(batch: &RecordBatch, name: &str) -> Vec<Option<i64>> {
        let idx = batch.schema().index_of(name).expect("column");
        let a = batch.column(idx).as_any().downcast_ref::<Int64Array>().expect("i64");
        (0..a.len()).map(|i| (!a.is_null(i)).then(|| a.value(i))).collect()
    }

    #[test]
    fn partial_then_merge_matches_direct_final() {
        let batch = input();
        let agg = Aggregator::new(&batch.schema(), params(vec!["k"])).expect("agg");

        let mut direct = AggregatedData::new();
        agg.execute_on_block(&mut direct, &batch).expect("exec");
        let final_blocks = agg.convert_to_blocks(direct, true).expect("final");
        assert_eq!(final_blocks.len(), 1);
        let expected = &final_blocks[0].batch;
        assert_eq!(i64_col(expected, "count()"), vec![Some(2), Some(1), Some(1)]);
        assert_eq!(i64_col(expected, "sum(v)"), vec![Some(4), Some(2), Some(0)]);

        let mut left = AggregatedData::new();
        let mut right = AggregatedData::new();
        agg.execute_on_block(&mut left, &batch.slice(0, 2)).expect("left");
        agg.execute_on_block(&mut right, &batch.slice(2, 2)).expect("right");
        let partial = [
            agg.convert_to_blocks(left, false).expect("p1"),
            agg.convert_to_blocks(right, false).expect("p2"),
        ];
        let header = agg.header(false);
        assert!(header.index_of(&avg_count_col_name("avg(v)")).is_ok());

        let merger = Aggregator::for_merge(&header, params(vec!["k"])).expect("merge");
        let mut merged = AggregatedData::new();
        for block in partial.iter().flatten() {
            merger.merge_block(&mut merged, block).expect("merge block");
        }
        let out = merger.convert_to_blocks(merged, true).expect("merged final");
        assert_eq!(&out[0].batch, expected);
        let avg = out[0]
            .batch
            .column(3)
            .as_any()
            .downcast_ref::<Float64Array>()
            .expect("f64");
        assert_eq!(avg.value(0), 2.0);
        assert!(avg.is_null(2));
    }

    #[test]
    fn empty_input_without_keys_yields_one_default_row() {
        let batch = input();
        let agg = Aggregator::new(&batch.schema(), params(vec![])).expect("agg");
        let blocks = agg.convert_to_blocks(AggregatedData::new(), true).expect("blocks");
        assert_eq!(blocks.len(), 1);
        assert_eq!(i64_col(&blocks[0].batch, "count()"), vec![Some(0)]);

        let mut p = params(vec![]);
        p.empty_result_for_aggregation_by_empty_set = true;
        let agg = Aggregator::new(&batch.schema(), p).expect("agg");
        assert!(agg.convert_to_blocks(AggregatedData::new(), true).expect("blocks").is_empty());
    }

    #[test]
    fn group_by_limit_any_routes_new_keys_to_overflow() {
        let batch = input();
        let mut p = params(vec!["k"]);
        p.max_rows_to_group_by = 1;
        p.group_by_overflow_mode = OverflowMode::Any;
        p.overflow_row = true;
        let agg = Aggregator::new(&batch.schema(), p).expect("agg");
        let mut data = AggregatedData::new();
        assert!(agg.execute_on_block(&mut data, &batch.slice(0, 2)).expect("first"));
        assert!(agg.execute_on_block(&mut data, &batch.slice(2, 2)).expect("second"));
        let blocks = agg.convert_to_blocks(data, true).expect("blocks");
        assert!(blocks[0].info.is_overflows);
        // "c" arrived after the cap and is counted in the overflow row only.
        assert_eq!(i64_col(&blocks[0].batch, "count()"), vec![Some(1)]);
        assert_eq!(i64_col(&blocks[1].batch, "count()"), vec![Some(2), Some(1)]);

        let mut p = params(vec!["k"]);
        p.max_rows_to_group_by = 1;
        p.group_by_overflow_mode = OverflowMode::Throw;
        let agg = Aggregator::new(&batch.schema(), p).expect("agg");
        assert!(matches!(
            agg.execute_on_block(&mut AggregatedData::new(), &batch),
            Err(FqError::LimitExceeded(_))
        ));
    }

    #[test]
    fn spilled_and_two_level_output_keeps_every_group() {
        let batch = input();
        let mut p = params(vec!["k"]);
        p.max_bytes_before_external_group_by = 1;
        let agg = Aggregator::new(&batch.schema(), p).expect("agg");
        let mut data = AggregatedData::new();
        agg.execute_on_block(&mut data, &batch.slice(0, 2)).expect("first");
        agg.execute_on_block(&mut data, &batch.slice(2, 2)).expect("second");
        assert!(data.is_two_level());
        let blocks = agg.convert_to_blocks(data, true).expect("blocks");
        assert!(blocks.iter().all(|b| b.info.bucket_num >= 0));
        let total: i64 = blocks
            .iter()
            .flat_map(|b| i64_col(&b.batch, "count()"))
            .flatten()
            .sum();
        assert_eq!(total, 4);
    }

    #[test]
    fn totals_accumulate_selected_rows() {
        let batch = input();
        let agg = Aggregator::new(&batch.schema(), params(vec!["k"])).expect("agg");
        let mut data = AggregatedData::new();
        agg.execute_on_block(&mut data, &batch).expect("exec");
        let partial = agg.convert_to_blocks(data, false).expect("partial");
        let merger = Aggregator::for_merge(&agg.header(false), params(vec!["k"])).expect("merge");
        let mut totals = merger.new_states();
        let mask = BooleanArray::from(vec![true, false, true]);
        merger
            .accumulate_rows(&mut totals, &partial[0].batch, Some(&mask))
            .expect("accumulate");
        let row = merger.totals_row(&totals).expect("row");
        assert_eq!(i64_col(&row, "count()"), vec![Some(3)]);
        let keys = row.column(0).as_any().downcast_ref::<StringArray>().expect("utf8");
        assert_eq!(keys.value(0), "");

        let finalized = merger.finalize_block(&partial[0].batch).expect("finalize");
        assert_eq!(finalized.schema(), merger.header(true));
    }
}
