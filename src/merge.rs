//! Segment merge: reclaim maps, merge plans, task decomposition and the
//! driver that executes tasks and commits the merged version.
//!
//! A merge runs in two phases. [`meta::MergeMetaCreator`] first computes, for
//! every plan, the reclaim map from old to new doc ids and splits the plans
//! into task items. The resulting [`meta::MergeMeta`] is persisted, then
//! [`merger::IndexPartitionMerger`] runs the items on the resource controlled
//! pool, checkpointing each finished one.

pub mod checkpoint;
pub mod merger;
pub mod meta;
pub mod plan;
pub mod reclaim_map;
pub mod reclaim_map_creator;
pub mod resource;
pub mod task_creator;
pub mod task_item;

pub use checkpoint::CheckpointManager;
pub use merger::{
    FieldMerger, IndexPartitionMerger, MergeContext, PackAttributeFieldMerger, PackAttributeSource,
    StoragePackAttributeSource,
};
pub use meta::{MergeMeta, MergeMetaCreator, MergePlanMeta, SegmentSplitHandlerFactory, SubDocInput};
pub use plan::MergePlan;
pub use reclaim_map::{DocOrder, ReclaimMap, SegmentSlot, SubReclaimMap};
pub use reclaim_map_creator::{
    FnSplitHandler, JoinValueReader, ReclaimMapCreator, SegmentSplitHandler, VecJoinValueReader,
};
pub use resource::{DocRangePartition, MergeTaskResourceManager};
pub use task_creator::{
    MergeCostEstimator, MergeField, MergeTaskItemCreator, SegmentSizeCostEstimator, dispatch_items,
};
pub use task_item::{MergeTaskItem, MergeTaskItems, MergeType, ParallelMergeItem};
