//! Storage over several shards, each interpreted by its own context.
//!
//! A shard runs the query up to the requested stage; with more than one shard
//! that is `WithMergeableState` and the initiating interpreter merges the
//! partial results.

use std::sync::Arc;

use arrow_schema::SchemaRef;
use fq_common::{FqError, Result, Settings, ShardId};
use fq_execution::{BatchStream, TableLock};
use fq_planner::{ProcessingStage, SelectQuery, TableExpr};
use fq_storage::{SelectQueryInfo, Storage};
use tracing::debug;

use crate::context::Context;
use crate::select::InterpreterSelectQuery;

/// One shard: the table a shard query reads, and the context it runs in.
#[derive(Debug, Clone)]
pub struct Shard {
    pub id: ShardId,
    pub context: Context,
    pub table: String,
}

pub struct ClusterStorage {
    name: String,
    schema: SchemaRef,
    shards: Vec<Shard>,
    lock: Arc<TableLock>,
}

impl std::fmt::Debug for ClusterStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterStorage")
            .field("name", &self.name)
            .field("shards", &self.shards.len())
            .finish()
    }
}

impl ClusterStorage {
    pub fn new(name: impl Into<String>, schema: SchemaRef, shards: Vec<Shard>) -> Result<Self> {
        let name = name.into();
        if shards.is_empty() {
            return Err(FqError::InvalidConfig(format!(
                "cluster table {name} has no shards"
            )));
        }
        Ok(Self {
            lock: TableLock::new(name.clone()),
            name,
            schema,
            shards,
        })
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    fn shard_interpreter(
        &self,
        shard: &Shard,
        query: &SelectQuery,
        settings: &Settings,
        stage: ProcessingStage,
        only_analyze: bool,
    ) -> Result<InterpreterSelectQuery> {
        let mut query = query.clone();
        query.from = Some(TableExpr::Table {
            database: None,
            name: shard.table.clone(),
        });
        let context = shard.context.clone().with_settings(settings.clone());
        InterpreterSelectQuery::new(query, context, stage, 0, None, only_analyze)
    }
}

impl Storage for ClusterStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn is_remote(&self) -> bool {
        true
    }

    fn table_lock(&self) -> Arc<TableLock> {
        self.lock.clone()
    }

    fn query_processing_stage(&self, _settings: &Settings) -> ProcessingStage {
        if self.shards.len() == 1 {
            ProcessingStage::Complete
        } else {
            ProcessingStage::WithMergeableState
        }
    }

    fn read_header(
        &self,
        _columns: &[String],
        query_info: &SelectQueryInfo,
        settings: &Settings,
        stage: ProcessingStage,
    ) -> Result<SchemaRef> {
        let mut interpreter =
            self.shard_interpreter(&self.shards[0], &query_info.query, settings, stage, true)?;
        interpreter.sample_block()
    }

    fn read(
        &self,
        _columns: &[String],
        query_info: &SelectQueryInfo,
        settings: &Settings,
        stage: ProcessingStage,
        _max_block_size: usize,
        num_streams: usize,
    ) -> Result<(Vec<BatchStream>, ProcessingStage)> {
        debug!(
            table = %self.name,
            shards = self.shards.len(),
            connections = num_streams,
            %stage,
            "reading from shards"
        );
        let mut streams = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            let interpreter =
                self.shard_interpreter(shard, &query_info.query, settings, stage, false)?;
            let mut shard_streams = interpreter.execute_with_multiple_streams()?;
            let stream = match shard_streams.len() {
                0 => continue,
                1 => shard_streams.remove(0),
                _ => BatchStream::union(shard_streams)?,
            };
            debug!(shard = %shard.id, table = %shard.table, "shard stream opened");
            streams.push(stream);
        }
        Ok((streams, stage))
    }
}
