use serde::{Deserialize, Serialize};
use std::fs;

use crate::error::{FqError, Result};

/// What a stream does when one of its limits is crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowMode {
    /// Raise [`FqError::LimitExceeded`].
    #[default]
    Throw,
    /// Stop producing rows and report end of stream.
    Break,
    /// Grouping only: keep aggregating existing keys, route new keys to the overflow row.
    Any,
}

/// How the WITH TOTALS row is computed relative to HAVING and the overflow row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TotalsMode {
    /// Totals over every aggregated row, HAVING ignored, overflow row included.
    BeforeHaving,
    /// Totals over rows passing HAVING plus the overflow row.
    AfterHavingInclusive,
    /// Totals over rows passing HAVING only.
    #[default]
    AfterHavingExclusive,
    /// Like inclusive when the share of keys passing HAVING reaches `totals_auto_threshold`.
    AfterHavingAuto,
}

/// Per-query execution settings.
///
/// A zero limit means "no limit" everywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub max_threads: usize,
    pub max_block_size: usize,
    pub max_distributed_connections: usize,
    pub max_streams_to_max_threads_ratio: f64,
    pub max_subquery_depth: usize,
    pub max_columns_to_read: usize,

    pub max_rows_to_read: u64,
    pub max_bytes_to_read: u64,
    pub read_overflow_mode: OverflowMode,
    pub max_execution_time_ms: u64,
    pub timeout_overflow_mode: OverflowMode,
    pub min_execution_speed: u64,
    pub timeout_before_checking_execution_speed_ms: u64,

    pub max_rows_to_group_by: u64,
    pub group_by_overflow_mode: OverflowMode,
    pub group_by_two_level_threshold: u64,
    pub group_by_two_level_threshold_bytes: u64,
    pub max_bytes_before_external_group_by: u64,
    pub empty_result_for_aggregation_by_empty_set: bool,
    pub distributed_aggregation_memory_efficient: bool,

    pub totals_mode: TotalsMode,
    pub totals_auto_threshold: f64,

    pub max_rows_to_sort: u64,
    pub max_bytes_to_sort: u64,
    pub sort_overflow_mode: OverflowMode,
    pub max_bytes_before_external_sort: u64,

    pub max_rows_in_distinct: u64,
    pub max_bytes_in_distinct: u64,
    pub distinct_overflow_mode: OverflowMode,

    pub max_rows_to_transfer: u64,
    pub max_bytes_to_transfer: u64,
    pub transfer_overflow_mode: OverflowMode,

    pub max_result_rows: u64,
    pub max_result_bytes: u64,

    pub extremes: bool,
    /// Schema version the query was analyzed against; `None` skips version checks.
    pub schema_version: Option<i64>,
    pub tmp_path: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_threads: 8,
            max_block_size: 65_536,
            max_distributed_connections: 1024,
            max_streams_to_max_threads_ratio: 1.0,
            max_subquery_depth: 100,
            max_columns_to_read: 0,
            max_rows_to_read: 0,
            max_bytes_to_read: 0,
            read_overflow_mode: OverflowMode::Throw,
            max_execution_time_ms: 0,
            timeout_overflow_mode: OverflowMode::Throw,
            min_execution_speed: 0,
            timeout_before_checking_execution_speed_ms: 0,
            max_rows_to_group_by: 0,
            group_by_overflow_mode: OverflowMode::Throw,
            group_by_two_level_threshold: 100_000,
            group_by_two_level_threshold_bytes: 100_000_000,
            max_bytes_before_external_group_by: 0,
            empty_result_for_aggregation_by_empty_set: false,
            distributed_aggregation_memory_efficient: false,
            totals_mode: TotalsMode::AfterHavingExclusive,
            totals_auto_threshold: 0.5,
            max_rows_to_sort: 0,
            max_bytes_to_sort: 0,
            sort_overflow_mode: OverflowMode::Throw,
            max_bytes_before_external_sort: 0,
            max_rows_in_distinct: 0,
            max_bytes_in_distinct: 0,
            distinct_overflow_mode: OverflowMode::Throw,
            max_rows_to_transfer: 0,
            max_bytes_to_transfer: 0,
            transfer_overflow_mode: OverflowMode::Throw,
            max_result_rows: 0,
            max_result_bytes: 0,
            extremes: false,
            schema_version: None,
            tmp_path: ".fq_tmp".to_string(),
        }
    }
}

impl Settings {
    /// Loads settings from a JSON object; missing fields keep their defaults.
    pub fn load_from_json(path: &str) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        serde_json::from_str(&s).map_err(|e| FqError::InvalidConfig(e.to_string()))
    }

    /// Applies one `name = value` pair from a query `SETTINGS` clause.
    ///
    /// `value` is parsed as JSON first (numbers, booleans, `null`) and falls back to a
    /// plain string, so `totals_mode = before_having` works unquoted.
    pub fn apply_change(&mut self, name: &str, value: &str) -> Result<()> {
        let mut current = serde_json::to_value(&*self)
            .map_err(|e| FqError::InvalidConfig(format!("settings encode failed: {e}")))?;
        let obj = current
            .as_object_mut()
            .ok_or_else(|| FqError::InvalidConfig("settings must be an object".to_string()))?;
        if !obj.contains_key(name) {
            return Err(FqError::InvalidConfig(format!("unknown setting: {name}")));
        }
        let parsed = serde_json::from_str::<serde_json::Value>(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        obj.insert(name.to_string(), parsed);
        *self = serde_json::from_value(current)
            .map_err(|e| FqError::InvalidConfig(format!("invalid value for {name}: {e}")))?;
        Ok(())
    }

    /// Applies every pair in order.
    pub fn apply_changes<'a>(
        &mut self,
        changes: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<()> {
        for (name, value) in changes {
            self.apply_change(name, value)?;
        }
        Ok(())
    }
}
