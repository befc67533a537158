//! ORDER BY: per-block partial sort, then a merge of the sorted blocks with
//! optional spilling of runs to Arrow IPC files.

use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use arrow::compute::{SortColumn as ArrowSortColumn, lexsort_to_indices, take};
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use fq_common::{FqError, Result};
use fq_planner::SortColumn;
use tracing::debug;

use crate::block::{Block, batch_bytes, batch_with_columns};
use crate::operators::merge_sorted::{RunSet, SortedMerger, sort_options};
use crate::operators::{Operator, StreamKind};
use crate::spill::SpillFile;
use crate::stream::BatchStream;

pub(crate) struct PartialSortingOp {
    input: Box<BatchStream>,
    description: Vec<SortColumn>,
    limit: usize,
}

impl Operator for PartialSortingOp {
    fn name(&self) -> &'static str {
        "PartialSorting"
    }

    fn read(&mut self) -> Result<Option<Block>> {
        match self.input.next()? {
            Some(block) => {
                let sorted = sort_batch(&block.batch, &self.description, self.limit)?;
                Ok(Some(block.map_batch(sorted)))
            }
            None => Ok(None),
        }
    }

    fn children(&self) -> Vec<&BatchStream> {
        vec![&self.input]
    }

    fn children_mut(&mut self) -> Vec<&mut BatchStream> {
        vec![&mut self.input]
    }

    fn describe(&self) -> String {
        describe_sort(&self.description, self.limit)
    }
}

/// Sorts one batch, keeping the first `limit` rows when non-zero.
pub(crate) fn sort_batch(
    batch: &RecordBatch,
    description: &[SortColumn],
    limit: usize,
) -> Result<RecordBatch> {
    if batch.num_rows() == 0 || description.is_empty() {
        return Ok(batch.clone());
    }
    let schema = batch.schema();
    let keys = description
        .iter()
        .map(|c| {
            let idx = schema.index_of(&c.name).map_err(|_| {
                FqError::Planning(format!("sort column {} is not in the block", c.name))
            })?;
            Ok(ArrowSortColumn {
                values: batch.column(idx).clone(),
                options: Some(sort_options(c)),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let indices = lexsort_to_indices(&keys, (limit > 0).then_some(limit))
        .map_err(|e| FqError::Execution(format!("sort failed: {e}")))?;
    let columns = batch
        .columns()
        .iter()
        .map(|c| take(c.as_ref(), &indices, None))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| FqError::Execution(format!("sort take failed: {e}")))?;
    batch_with_columns(schema, columns, indices.len())
}

fn describe_sort(description: &[SortColumn], limit: usize) -> String {
    let keys = description
        .iter()
        .map(|c| format!("{}{}", c.name, if c.descending { " DESC" } else { "" }))
        .collect::<Vec<_>>()
        .join(", ");
    if limit > 0 {
        format!("{keys}; limit={limit}")
    } else {
        keys
    }
}

/// Parameters of the merge step of a full sort.
#[derive(Debug, Clone)]
pub struct MergeSortParams {
    pub description: Vec<SortColumn>,
    pub max_block_size: usize,
    /// Rows to produce; zero means all.
    pub limit: usize,
    /// Accumulated bytes above which sorted blocks are merged into a run on
    /// disk; zero disables spilling.
    pub max_bytes_before_external_sort: u64,
    pub tmp_path: PathBuf,
}

enum Run {
    Memory(VecDeque<RecordBatch>),
    Spilled {
        reader: StreamReader<BufReader<File>>,
        _file: SpillFile,
    },
}

struct SortRuns(Vec<Run>);

impl RunSet for SortRuns {
    fn run_count(&self) -> usize {
        self.0.len()
    }

    fn next_run_batch(&mut self, run: usize) -> Result<Option<RecordBatch>> {
        match &mut self.0[run] {
            Run::Memory(batches) => Ok(batches.pop_front()),
            Run::Spilled { reader, .. } => reader
                .next()
                .transpose()
                .map_err(|e| FqError::Execution(format!("ipc read failed: {e}"))),
        }
    }
}

enum SortState {
    Accumulating,
    Merging { runs: SortRuns, merger: SortedMerger },
}

pub(crate) struct MergeSortingOp {
    input: Box<BatchStream>,
    params: MergeSortParams,
    blocks: Vec<RecordBatch>,
    blocks_bytes: u64,
    spilled: Vec<Run>,
    state: SortState,
}

impl MergeSortingOp {
    fn merger(&self) -> Result<SortedMerger> {
        SortedMerger::new(
            self.input.schema(),
            &self.params.description,
            self.params.max_block_size,
            self.params.limit,
        )
    }

    fn spill_blocks(&mut self) -> Result<()> {
        let spill = SpillFile::create(&self.params.tmp_path, "sort_spill", "arrows")?;
        let mut runs = SortRuns(
            std::mem::take(&mut self.blocks)
                .into_iter()
                .map(|b| Run::Memory(VecDeque::from([b])))
                .collect(),
        );
        let mut merger = self.merger()?;
        let schema = self.input.schema();
        let mut file = File::create(spill.path())?;
        let mut writer = StreamWriter::try_new(&mut file, &schema)
            .map_err(|e| FqError::Execution(format!("ipc writer init failed: {e}")))?;
        let mut rows = 0;
        while let Some(batch) = merger.next_block(&mut runs)? {
            rows += batch.num_rows();
            writer
                .write(&batch)
                .map_err(|e| FqError::Execution(format!("ipc write failed: {e}")))?;
        }
        writer
            .finish()
            .map_err(|e| FqError::Execution(format!("ipc finish failed: {e}")))?;
        debug!(
            path = %spill.path().display(),
            rows,
            bytes = self.blocks_bytes,
            "spilled sorted run"
        );
        self.blocks_bytes = 0;

        let reader = StreamReader::try_new(BufReader::new(File::open(spill.path())?), None)
            .map_err(|e| FqError::Execution(format!("ipc reader init failed: {e}")))?;
        self.spilled.push(Run::Spilled {
            reader,
            _file: spill,
        });
        Ok(())
    }
}

impl Operator for MergeSortingOp {
    fn name(&self) -> &'static str {
        "MergeSorting"
    }

    fn read(&mut self) -> Result<Option<Block>> {
        if let SortState::Accumulating = self.state {
            while let Some(block) = self.input.next()? {
                if block.num_rows() == 0 {
                    continue;
                }
                self.blocks_bytes += batch_bytes(&block.batch);
                self.blocks.push(block.batch);
                let threshold = self.params.max_bytes_before_external_sort;
                if threshold > 0 && self.blocks_bytes > threshold {
                    self.spill_blocks()?;
                }
            }
            let mut runs = std::mem::take(&mut self.spilled);
            runs.extend(
                std::mem::take(&mut self.blocks)
                    .into_iter()
                    .map(|b| Run::Memory(VecDeque::from([b]))),
            );
            self.state = SortState::Merging {
                runs: SortRuns(runs),
                merger: self.merger()?,
            };
        }
        match &mut self.state {
            SortState::Merging { runs, merger } => Ok(merger.next_block(runs)?.map(Block::new)),
            SortState::Accumulating => Ok(None),
        }
    }

    fn children(&self) -> Vec<&BatchStream> {
        vec![&self.input]
    }

    fn children_mut(&mut self) -> Vec<&mut BatchStream> {
        vec![&mut self.input]
    }

    fn sort_description(&self) -> Option<Vec<SortColumn>> {
        Some(self.params.description.clone())
    }

    fn describe(&self) -> String {
        describe_sort(&self.params.description, self.params.limit)
    }

    fn on_cancel(&mut self, _kill: bool) {
        self.blocks.clear();
        self.spilled.clear();
        self.state = SortState::Accumulating;
    }
}

impl BatchStream {
    /// Sorts every block on its own, keeping at most `limit` rows per block
    /// when non-zero.
    pub fn partial_sorting(input: BatchStream, description: Vec<SortColumn>, limit: usize) -> Self {
        let header = input.schema();
        Self::from_kind(
            StreamKind::PartialSorting(PartialSortingOp {
                input: Box::new(input),
                description,
                limit,
            }),
            header,
        )
    }

    /// Merges the individually sorted blocks of `input` into one sorted stream.
    pub fn merge_sorting(input: BatchStream, params: MergeSortParams) -> Result<Self> {
        let header = input.schema();
        // Validates the description against the header up front.
        SortedMerger::new(header.clone(), &params.description, 1, 0)?;
        Ok(Self::from_kind(
            StreamKind::MergeSorting(MergeSortingOp {
                input: Box::new(input),
                params,
                blocks: Vec::new(),
                blocks_bytes: 0,
                spilled: Vec::new(),
                state: SortState::Accumulating,
            }),
            header,
        ))
    }
}
