//! `SELECT ... UNION ALL SELECT ...`: one select interpreter per branch.

use arrow_schema::SchemaRef;
use fq_common::{FqError, Result};
use fq_execution::{BatchStream, LocalLimits};
use fq_planner::{ProcessingStage, SelectWithUnionQuery};
use tracing::trace;

use crate::block_io::BlockIO;
use crate::context::Context;
use crate::select::InterpreterSelectQuery;

#[derive(Debug)]
pub struct InterpreterSelectWithUnionQuery {
    nested: Vec<InterpreterSelectQuery>,
    to_stage: ProcessingStage,
    subquery_depth: usize,
}

impl InterpreterSelectWithUnionQuery {
    /// Builds every branch and checks they produce the same number of columns.
    pub fn new(
        query: SelectWithUnionQuery,
        context: Context,
        to_stage: ProcessingStage,
        subquery_depth: usize,
        only_analyze: bool,
    ) -> Result<Self> {
        if query.selects.is_empty() {
            return Err(FqError::Planning("UNION ALL of zero selects".to_string()));
        }
        let nested = query
            .selects
            .into_iter()
            .map(|select| {
                InterpreterSelectQuery::new(
                    select,
                    context.clone(),
                    to_stage,
                    subquery_depth,
                    None,
                    only_analyze,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let mut interpreter = Self {
            nested,
            to_stage,
            subquery_depth,
        };
        if interpreter.nested.len() > 1 {
            let headers = interpreter
                .nested
                .iter_mut()
                .map(InterpreterSelectQuery::sample_block)
                .collect::<Result<Vec<_>>>()?;
            let expected = headers[0].fields().len();
            if let Some((i, h)) = headers
                .iter()
                .enumerate()
                .find(|(_, h)| h.fields().len() != expected)
            {
                return Err(FqError::Planning(format!(
                    "different number of columns in UNION ALL elements: {expected} in the first, {} in element {}",
                    h.fields().len(),
                    i + 1
                )));
            }
        }
        Ok(interpreter)
    }

    /// Header of the first branch; the union keeps its names.
    pub fn sample_block(&mut self) -> Result<SchemaRef> {
        self.nested[0].sample_block()
    }

    pub fn ignore_with_totals(&mut self) {
        self.nested
            .iter_mut()
            .for_each(InterpreterSelectQuery::ignore_with_totals);
    }

    /// Streams of every branch, side by side.
    pub fn execute_with_multiple_streams(self) -> Result<Vec<BatchStream>> {
        let mut streams = Vec::new();
        for nested in self.nested {
            streams.extend(nested.execute_with_multiple_streams()?);
        }
        Ok(streams)
    }

    pub fn execute(mut self) -> Result<BlockIO> {
        if self.nested.len() == 1 {
            return self.nested.remove(0).execute();
        }
        trace!(branches = self.nested.len(), to_stage = %self.to_stage, "union all");
        let header = self.sample_block()?;
        let result_limits = (self.subquery_depth == 0 && self.to_stage == ProcessingStage::Complete)
            .then(|| LocalLimits::for_result(self.nested[0].context().settings()))
            .filter(|limits| !limits.is_empty());
        let mut streams = self.execute_with_multiple_streams()?;
        let mut stream = match streams.len() {
            0 => BatchStream::null(header),
            1 => streams.remove(0),
            _ => BatchStream::union(streams)?,
        };
        if let Some(limits) = result_limits {
            if !stream.limits().is_empty() {
                stream = BatchStream::union(vec![stream])?;
            }
            stream.set_limits(limits);
        }
        Ok(BlockIO::new(stream))
    }
}
