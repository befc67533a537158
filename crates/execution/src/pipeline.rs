//! The set of parallel streams a SELECT is being built on.

use arrow_schema::SchemaRef;
use fq_common::{FqError, Result};

use crate::stream::BatchStream;

/// Parallel main streams plus side streams that may only be read after every
/// main stream is exhausted (non-joined rows of RIGHT and FULL joins).
///
/// All streams share one header.
#[derive(Debug, Default)]
pub struct Pipeline {
    pub streams: Vec<BatchStream>,
    pub streams_with_non_joined_data: Vec<BatchStream>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_stream(stream: BatchStream) -> Self {
        Self {
            streams: vec![stream],
            streams_with_non_joined_data: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty() && self.streams_with_non_joined_data.is_empty()
    }

    pub fn has_more_than_one_stream(&self) -> bool {
        self.streams.len() + self.streams_with_non_joined_data.len() > 1
    }

    pub fn first_stream(&self) -> Option<&BatchStream> {
        self.streams
            .first()
            .or_else(|| self.streams_with_non_joined_data.first())
    }

    /// Header shared by every stream.
    pub fn header(&self) -> Result<SchemaRef> {
        self.first_stream()
            .map(BatchStream::schema)
            .ok_or_else(|| FqError::Planning("pipeline has no streams".to_string()))
    }

    /// Replaces every main and side stream by `f(stream)`.
    pub fn transform<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(BatchStream) -> Result<BatchStream>,
    {
        self.streams = std::mem::take(&mut self.streams)
            .into_iter()
            .map(&mut f)
            .collect::<Result<Vec<_>>>()?;
        self.streams_with_non_joined_data = std::mem::take(&mut self.streams_with_non_joined_data)
            .into_iter()
            .map(&mut f)
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    /// Runs `f` on every stream in place.
    pub fn for_each_mut(&mut self, mut f: impl FnMut(&mut BatchStream)) {
        self.streams.iter_mut().for_each(&mut f);
        self.streams_with_non_joined_data.iter_mut().for_each(&mut f);
    }

    /// Replaces the main list by `f(main ++ side)` and clears the side list.
    pub fn reduce_to_one<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(Vec<BatchStream>) -> Result<BatchStream>,
    {
        let mut inputs = std::mem::take(&mut self.streams);
        inputs.append(&mut self.streams_with_non_joined_data);
        if inputs.is_empty() {
            return Err(FqError::Planning("pipeline has no streams".to_string()));
        }
        self.streams = vec![f(inputs)?];
        Ok(())
    }

    /// Collapses main and side streams into one stream: a single main stream
    /// stays as is, a single side stream moves to the main list, several are
    /// merged by [`BatchStream::union`] with side streams last.
    pub fn union_all(&mut self) -> Result<()> {
        let total = self.streams.len() + self.streams_with_non_joined_data.len();
        if total == 0 {
            return Ok(());
        }
        if total == 1 {
            if self.streams.is_empty() {
                self.streams = std::mem::take(&mut self.streams_with_non_joined_data);
            }
            return Ok(());
        }
        self.reduce_to_one(BatchStream::union)
    }

    /// The single resulting stream; fails unless exactly one stream remains.
    pub fn into_stream(mut self) -> Result<BatchStream> {
        if !self.streams_with_non_joined_data.is_empty() || self.streams.len() != 1 {
            return Err(FqError::Planning(format!(
                "pipeline must end with one stream, has {} main and {} side",
                self.streams.len(),
                self.streams_with_non_joined_data.len()
            )));
        }
        self.streams
            .pop()
            .ok_or_else(|| FqError::Planning("pipeline has no streams".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::array::Int64Array;
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema};

    fn source(v: i64) -> BatchStream {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(schema.clone(), vec![Arc::new(Int64Array::from(vec![v]))])
            .expect("batch");
        BatchStream::memory(schema, vec![batch])
    }

    #[test]
    fn union_all_moves_a_lone_side_stream_to_main() {
        let mut p = Pipeline::new();
        p.streams_with_non_joined_data.push(source(1));
        p.union_all().expect("union");
        assert_eq!(p.streams.len(), 1);
        assert!(p.streams_with_non_joined_data.is_empty());
        assert_eq!(p.streams[0].name(), "Memory");
    }

    #[test]
    fn union_all_reads_side_streams_last() {
        let mut p = Pipeline::new();
        p.streams = vec![source(1), source(2)];
        p.streams_with_non_joined_data.push(source(3));
        assert!(p.has_more_than_one_stream());
        p.union_all().expect("union");
        let mut s = p.into_stream().expect("one stream");
        let values = s
            .collect()
            .expect("collect")
            .iter()
            .map(|b| b.column(0).as_any().downcast_ref::<Int64Array>().expect("i64").value(0))
            .collect::<Vec<_>>();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn transform_touches_side_streams_too() {
        let mut p = Pipeline::from_stream(source(1));
        p.streams_with_non_joined_data.push(source(2));
        p.transform(|s| Ok(BatchStream::limit(s, 0, 0, false))).expect("transform");
        assert!(p.streams.iter().chain(&p.streams_with_non_joined_data).all(|s| s.name() == "Limit"));
    }
}
