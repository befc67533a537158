use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use fq_common::Result;
use fq_execution::{BatchStream, SendableRecordBatchStream};

/// Result handle of an interpreted query.
#[derive(Debug)]
pub struct BlockIO {
    pub stream: BatchStream,
}

/// Everything a query returned once its stream was read to the end.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
    pub totals: Option<RecordBatch>,
    pub extremes: Option<RecordBatch>,
}

impl QueryResult {
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }
}

impl BlockIO {
    pub fn new(stream: BatchStream) -> Self {
        Self { stream }
    }

    pub fn schema(&self) -> SchemaRef {
        self.stream.schema()
    }

    /// Operator tree of the result stream.
    pub fn explain(&self) -> String {
        self.stream.explain()
    }

    /// Reads the stream to the end; totals and extremes are only known after.
    pub fn read_all(mut self) -> Result<QueryResult> {
        let batches = self.stream.collect()?;
        Ok(QueryResult {
            schema: self.stream.schema(),
            batches,
            totals: self.stream.totals()?,
            extremes: self.stream.extremes()?,
        })
    }

    pub fn into_record_batch_stream(self) -> SendableRecordBatchStream {
        self.stream.into_record_batch_stream()
    }
}
