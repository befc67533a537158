//! Materializes `IN` sets and JOIN hash tables before the main input reads.

use std::time::Instant;

use arrow::record_batch::RecordBatch;
use fq_common::Result;
use tracing::info;

use crate::block::{Block, batch_bytes};
use crate::limits::SizeLimits;
use crate::operators::{Operator, StreamKind};
use crate::sets::PreparedSet;
use crate::stream::BatchStream;

/// A subquery stream and the prepared object it fills.
pub struct SetSource {
    pub name: String,
    pub source: BatchStream,
    pub target: PreparedSet,
}

impl SetSource {
    /// Reads the whole source into the target. Stops early when `transfer`
    /// is crossed under a non-throwing policy; the object is usable either way.
    fn fill(&mut self, transfer: &SizeLimits) -> Result<()> {
        let started = Instant::now();
        let (mut rows, mut bytes) = (0u64, 0u64);
        let mut truncated = false;
        while let Some(block) = self.source.next()? {
            match &self.target {
                PreparedSet::Set(set) => set.insert_block(&block.batch)?,
                PreparedSet::Join(join) => join.insert_block(&block.batch)?,
            }
            rows += block.num_rows() as u64;
            bytes += batch_bytes(&block.batch);
            if !transfer.check(rows, bytes, "limit for rows or bytes to transfer")? {
                truncated = true;
                self.source.cancel(false);
                break;
            }
        }
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &self.target {
            PreparedSet::Set(set) => {
                set.mark_ready();
                info!(
                    set = %self.name,
                    entries = set.len(),
                    rows,
                    truncated,
                    elapsed_ms,
                    "created set"
                );
            }
            PreparedSet::Join(join) => {
                join.mark_ready();
                info!(
                    join = %self.name,
                    rows = join.rows(),
                    bytes = join.bytes(),
                    truncated,
                    elapsed_ms,
                    "created join"
                );
            }
        }
        Ok(())
    }
}

pub(crate) struct CreatingSetsOp {
    input: Box<BatchStream>,
    sources: Vec<SetSource>,
    transfer: SizeLimits,
    created: bool,
}

impl Operator for CreatingSetsOp {
    fn name(&self) -> &'static str {
        "CreatingSets"
    }

    fn read(&mut self) -> Result<Option<Block>> {
        if !self.created {
            for source in &mut self.sources {
                source.fill(&self.transfer)?;
            }
            self.created = true;
        }
        self.input.next()
    }

    fn children(&self) -> Vec<&BatchStream> {
        let mut out = vec![self.input.as_ref()];
        out.extend(self.sources.iter().map(|s| &s.source));
        out
    }

    fn children_mut(&mut self) -> Vec<&mut BatchStream> {
        let mut out = vec![self.input.as_mut()];
        out.extend(self.sources.iter_mut().map(|s| &mut s.source));
        out
    }

    fn totals(&self) -> Result<Option<RecordBatch>> {
        self.input.totals()
    }

    fn extremes(&self) -> Result<Option<RecordBatch>> {
        self.input.extremes()
    }

    fn sort_description(&self) -> Option<Vec<fq_planner::SortColumn>> {
        self.input.sort_description()
    }

    fn describe(&self) -> String {
        self.sources
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl BatchStream {
    /// Fills every set and join of `sources`, then streams `input` unchanged.
    pub fn creating_sets(input: BatchStream, sources: Vec<SetSource>, transfer: SizeLimits) -> Self {
        let header = input.schema();
        Self::from_kind(
            StreamKind::CreatingSets(CreatingSetsOp {
                input: Box::new(input),
                sources,
                transfer,
                created: false,
            }),
            header,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::array::Int64Array;
    use arrow_schema::{DataType, Field, Schema};
    use fq_common::{FqError, OverflowMode};

    use crate::sets::Set;

    fn source(values: Vec<i64>) -> BatchStream {
        let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, false)]));
        let batches = values
            .chunks(2)
            .map(|c| {
                RecordBatch::try_new(schema.clone(), vec![Arc::new(Int64Array::from(c.to_vec()))])
                    .expect("batch")
            })
            .collect();
        BatchStream::memory(schema, batches)
    }

    #[test]
    fn sets_are_ready_before_the_first_main_block() {
        let set = Arc::new(Set::new());
        let sources = vec![SetSource {
            name: "_subquery1".to_string(),
            source: source(vec![1, 2, 2, 3]),
            target: PreparedSet::Set(set.clone()),
        }];
        let mut s = BatchStream::creating_sets(source(vec![7]), sources, SizeLimits::default());
        assert!(!set.is_ready());
        assert!(s.next().expect("next").is_some());
        assert!(set.is_ready());
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn transfer_limits_break_or_throw() {
        let set = Arc::new(Set::new());
        let sources = vec![SetSource {
            name: "_subquery1".to_string(),
            source: source(vec![1, 2, 3, 4, 5, 6]),
            target: PreparedSet::Set(set.clone()),
        }];
        let mut s = BatchStream::creating_sets(
            source(vec![7]),
            sources,
            SizeLimits::new(3, 0, OverflowMode::Break),
        );
        s.collect().expect("collect");
        assert!(set.is_ready());
        assert_eq!(set.len(), 4);

        let sources = vec![SetSource {
            name: "_subquery1".to_string(),
            source: source(vec![1, 2, 3, 4]),
            target: PreparedSet::Set(Arc::new(Set::new())),
        }];
        let mut s = BatchStream::creating_sets(
            source(vec![7]),
            sources,
            SizeLimits::new(3, 0, OverflowMode::Throw),
        );
        assert!(matches!(s.next(), Err(FqError::LimitExceeded(_))));
    }
}
