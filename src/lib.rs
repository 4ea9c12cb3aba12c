//! # segmerge
//!
//! Segment merging for an inverted index partition.
//!
//! ## Features
//!
//! - Reclaim maps translating old doc ids to the compacted new doc id space,
//!   with optional split into several target segments and sub documents
//! - Merge plans decomposed into cost weighted, optionally parallel, task items
//! - A thread pool that bounds the memory of concurrently running items
//! - Persisted merge meta and per item checkpoints for resumable merges
//! - Pack attribute merging with pending patches applied on the fly
//! - Replay of deferred operations against merged segments
//! - Pluggable storage backends

pub mod attribute;
pub mod config;
pub mod error;
pub mod index;
pub mod merge;
pub mod operation;
pub mod pool;
pub mod storage;
pub mod util;

// Re-exports for the public API
pub use config::{MergeConfig, MergeConfigBuilder, ThreadPoolConfig};
pub use error::{MergeError, Result};
pub use index::{
    DeletionMapReader, DocId, GlobalId, SegmentId, SegmentInfo, SegmentMergeInfo, SegmentMergeInfos, Version,
};
pub use merge::{
    IndexPartitionMerger, MergeMeta, MergeMetaCreator, MergePlan, MergeTaskItem, MergeTaskItems, ReclaimMap,
    ReclaimMapCreator,
};
pub use pool::{ResourceControlThreadPool, ResourceControlWorkItem};
pub use storage::{Storage, StorageConfig, StorageFactory};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
