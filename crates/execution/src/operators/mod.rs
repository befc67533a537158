//! Stream operators.
//!
//! Every operator is one variant of [`StreamKind`]; constructors live on
//! [`BatchStream`] next to each operator's implementation.

use arrow::record_batch::RecordBatch;
use fq_common::Result;
use fq_planner::SortColumn;

use crate::block::Block;
use crate::stream::{BatchStream, first_child_totals, merged_child_extremes};

pub mod aggregating;
pub mod creating_sets;
pub mod distinct;
pub mod expression;
pub mod filter;
pub mod join;
pub mod limit;
pub mod merge_sorted;
pub mod merging_aggregated;
pub mod prefetch;
pub mod sort;
pub mod source;
pub mod totals_having;
pub mod union;

pub use creating_sets::SetSource;
pub use sort::MergeSortParams;
pub use totals_having::TotalsHavingParams;

/// Behaviour behind one [`BatchStream`] variant.
pub(crate) trait Operator: Send {
    fn name(&self) -> &'static str;

    /// Produces the next block, `None` at end.
    fn read(&mut self) -> Result<Option<Block>>;

    fn children(&self) -> Vec<&BatchStream> {
        Vec::new()
    }

    fn children_mut(&mut self) -> Vec<&mut BatchStream> {
        Vec::new()
    }

    fn totals(&self) -> Result<Option<RecordBatch>> {
        first_child_totals(self.children())
    }

    fn extremes(&self) -> Result<Option<RecordBatch>> {
        merged_child_extremes(self.children())
    }

    fn sort_description(&self) -> Option<Vec<SortColumn>> {
        None
    }

    /// Short parameter summary for `explain`.
    fn describe(&self) -> String {
        String::new()
    }

    /// Called once, before the inputs are cancelled.
    fn on_cancel(&mut self, _kill: bool) {}
}

macro_rules! stream_kinds {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        pub(crate) enum StreamKind {
            $($variant($ty)),*
        }

        impl StreamKind {
            pub(crate) fn as_operator(&self) -> &dyn Operator {
                match self {
                    $(Self::$variant(op) => op),*
                }
            }

            pub(crate) fn as_operator_mut(&mut self) -> &mut dyn Operator {
                match self {
                    $(Self::$variant(op) => op),*
                }
            }
        }
    };
}

stream_kinds! {
    Source(source::SourceOp),
    Expression(expression::ExpressionOp),
    Filter(filter::FilterOp),
    PartialSorting(sort::PartialSortingOp),
    MergeSorting(sort::MergeSortingOp),
    MergingSorted(merge_sorted::MergingSortedOp),
    Distinct(distinct::DistinctOp),
    DistinctSorted(distinct::DistinctSortedOp),
    Limit(limit::LimitOp),
    LimitBy(limit::LimitByOp),
    Union(union::UnionOp),
    Aggregating(aggregating::AggregatingOp),
    ParallelAggregating(aggregating::ParallelAggregatingOp),
    MergingAggregated(merging_aggregated::MergingAggregatedOp),
    MergingAggregatedMemoryEfficient(merging_aggregated::MemoryEfficientOp),
    TotalsHaving(totals_having::TotalsHavingOp),
    CreatingSets(creating_sets::CreatingSetsOp),
    Prefetch(prefetch::PrefetchOp),
    NonJoined(join::NonJoinedOp),
}
