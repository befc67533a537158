//! Leaf streams: in-memory batches, the empty stream, and async adapters.

use std::collections::VecDeque;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use fq_common::Result;
use futures::StreamExt;
use futures::executor::block_on;

use crate::block::Block;
use crate::operators::{Operator, StreamKind};
use crate::stream::{BatchStream, SendableRecordBatchStream};

pub(crate) enum SourceOp {
    Memory(VecDeque<RecordBatch>),
    Null,
    Async(SendableRecordBatchStream),
}

impl Operator for SourceOp {
    fn name(&self) -> &'static str {
        match self {
            SourceOp::Memory(_) => "Memory",
            SourceOp::Null => "Null",
            SourceOp::Async(_) => "RecordBatchStream",
        }
    }

    fn read(&mut self) -> Result<Option<Block>> {
        match self {
            SourceOp::Memory(batches) => Ok(batches.pop_front().map(Block::new)),
            SourceOp::Null => Ok(None),
            SourceOp::Async(stream) => match block_on(stream.next()) {
                Some(batch) => Ok(Some(Block::new(batch?))),
                None => Ok(None),
            },
        }
    }

    fn describe(&self) -> String {
        match self {
            SourceOp::Memory(batches) => format!("batches={}", batches.len()),
            _ => String::new(),
        }
    }

    fn on_cancel(&mut self, _kill: bool) {
        if let SourceOp::Memory(batches) = self {
            batches.clear();
        }
    }
}

impl BatchStream {
    /// Stream over batches already in memory.
    pub fn memory(schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        Self::from_kind(StreamKind::Source(SourceOp::Memory(batches.into())), schema)
    }

    /// A stream with a header and no rows.
    pub fn null(schema: SchemaRef) -> Self {
        Self::from_kind(StreamKind::Source(SourceOp::Null), schema)
    }

    /// Pulls an async record-batch stream, blocking on each batch.
    pub fn from_record_batch_stream(stream: SendableRecordBatchStream) -> Self {
        let schema = stream.schema();
        Self::from_kind(StreamKind::Source(SourceOp::Async(stream)), schema)
    }
}
