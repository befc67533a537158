//! Reads an input on a worker thread ahead of the consumer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use fq_common::{FqError, Result};
use fq_planner::SortColumn;
use futures::channel::mpsc;
use futures::executor::block_on;
use futures::{SinkExt, StreamExt};
use tracing::debug;

use crate::block::Block;
use crate::operators::{Operator, StreamKind};
use crate::stream::BatchStream;

/// Blocks read ahead per prefetching stream.
const PREFETCH_CAPACITY: usize = 2;

enum Message {
    Block(Block),
    Error(FqError),
    End {
        totals: Option<RecordBatch>,
        extremes: Option<RecordBatch>,
    },
}

fn run_worker(mut input: BatchStream, mut tx: mpsc::Sender<Message>, cancel: Arc<AtomicBool>) {
    loop {
        if cancel.load(Ordering::Acquire) {
            input.cancel(false);
            return;
        }
        let message = match input.next() {
            Ok(Some(block)) => Message::Block(block),
            Ok(None) => {
                let totals = input.totals();
                let extremes = input.extremes();
                match (totals, extremes) {
                    (Ok(totals), Ok(extremes)) => Message::End { totals, extremes },
                    (Err(e), _) | (_, Err(e)) => Message::Error(e),
                }
            }
            Err(e) => Message::Error(e),
        };
        let last = !matches!(message, Message::Block(_));
        if block_on(tx.send(message)).is_err() || last {
            // The consumer went away or the input is done.
            input.cancel(false);
            return;
        }
    }
}

pub(crate) struct PrefetchOp {
    /// The input until the first read moves it to the worker.
    pending: Option<Box<BatchStream>>,
    rx: Option<mpsc::Receiver<Message>>,
    worker: Option<JoinHandle<()>>,
    cancel: Arc<AtomicBool>,
    totals: Option<RecordBatch>,
    extremes: Option<RecordBatch>,
    sort: Option<Vec<SortColumn>>,
    done: bool,
}

impl PrefetchOp {
    fn start(&mut self) -> Result<()> {
        let Some(input) = self.pending.take() else {
            return Ok(());
        };
        let (tx, rx) = mpsc::channel(PREFETCH_CAPACITY);
        let cancel = self.cancel.clone();
        let worker = std::thread::Builder::new()
            .name("fq-prefetch".to_string())
            .spawn(move || run_worker(*input, tx, cancel))?;
        self.rx = Some(rx);
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        self.cancel.store(true, Ordering::Release);
        self.rx = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                debug!("prefetch worker panicked");
            }
        }
    }
}

impl Operator for PrefetchOp {
    fn name(&self) -> &'static str {
        "Prefetch"
    }

    fn read(&mut self) -> Result<Option<Block>> {
        if self.done {
            return Ok(None);
        }
        self.start()?;
        let Some(rx) = self.rx.as_mut() else {
            return Err(FqError::Cancelled);
        };
        match block_on(rx.next()) {
            Some(Message::Block(block)) => Ok(Some(block)),
            Some(Message::End { totals, extremes }) => {
                self.totals = totals;
                self.extremes = extremes;
                self.done = true;
                self.stop();
                Ok(None)
            }
            Some(Message::Error(e)) => {
                self.done = true;
                self.stop();
                Err(e)
            }
            None => {
                self.stop();
                Err(FqError::Cancelled)
            }
        }
    }

    fn children(&self) -> Vec<&BatchStream> {
        self.pending.iter().map(|b| b.as_ref()).collect()
    }

    fn children_mut(&mut self) -> Vec<&mut BatchStream> {
        self.pending.iter_mut().map(|b| b.as_mut()).collect()
    }

    fn totals(&self) -> Result<Option<RecordBatch>> {
        match &self.pending {
            Some(input) => input.totals(),
            None => Ok(self.totals.clone()),
        }
    }

    fn extremes(&self) -> Result<Option<RecordBatch>> {
        match &self.pending {
            Some(input) => input.extremes(),
            None => Ok(self.extremes.clone()),
        }
    }

    fn sort_description(&self) -> Option<Vec<SortColumn>> {
        self.sort.clone()
    }

    fn on_cancel(&mut self, _kill: bool) {
        self.stop();
    }
}

impl Drop for PrefetchOp {
    fn drop(&mut self) {
        self.stop();
    }
}

impl BatchStream {
    /// Starts reading `input` on a worker thread at the first read, so that
    /// several inputs of a merge make progress at once.
    pub fn prefetch(input: BatchStream) -> Self {
        let header: SchemaRef = input.schema();
        let sort = input.sort_description();
        Self::from_kind(
            StreamKind::Prefetch(PrefetchOp {
                pending: Some(Box::new(input)),
                rx: None,
                worker: None,
                cancel: Arc::new(AtomicBool::new(false)),
                totals: None,
                extremes: None,
                sort,
                done: false,
            }),
            header,
        )
    }
}
