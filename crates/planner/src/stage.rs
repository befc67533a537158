use std::fmt;

use serde::{Deserialize, Serialize};

/// How far a node's local execution has progressed toward a final result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProcessingStage {
    /// Only read the requested columns.
    FetchColumns,
    /// Partial results that other nodes can still merge (aggregate states, pre-sorted runs).
    WithMergeableState,
    /// Final result.
    Complete,
}

impl ProcessingStage {
    /// Partial (pre-merge) work is needed on this node.
    pub fn first_stage(from: Self, to: Self) -> bool {
        from < ProcessingStage::WithMergeableState && ProcessingStage::WithMergeableState <= to
    }

    /// Final (post-merge) work is needed on this node.
    pub fn second_stage(from: Self, to: Self) -> bool {
        from <= ProcessingStage::WithMergeableState && ProcessingStage::WithMergeableState < to
    }
}

impl fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessingStage::FetchColumns => "FetchColumns",
            ProcessingStage::WithMergeableState => "WithMergeableState",
            ProcessingStage::Complete => "Complete",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::ProcessingStage::*;
    use super::*;

    #[test]
    fn stage_intervals() {
        assert!(ProcessingStage::first_stage(FetchColumns, Complete));
        assert!(ProcessingStage::second_stage(FetchColumns, Complete));

        assert!(ProcessingStage::first_stage(FetchColumns, WithMergeableState));
        assert!(!ProcessingStage::second_stage(FetchColumns, WithMergeableState));

        assert!(!ProcessingStage::first_stage(WithMergeableState, Complete));
        assert!(ProcessingStage::second_stage(WithMergeableState, Complete));

        assert!(!ProcessingStage::first_stage(FetchColumns, FetchColumns));
        assert!(!ProcessingStage::second_stage(FetchColumns, FetchColumns));
    }
}
