//! Segment level data consumed by the merge: segment metadata, deletion maps
//! and index versions.

pub mod deletion;
pub mod segment;
pub mod version;

pub use deletion::{BitmapDeletionMapReader, DeletionBitmap, DeletionMapReader};
pub use segment::{
    DocId, GlobalId, INVALID_DOCID, INVALID_SEGMENT_ID, SegmentId, SegmentInfo, SegmentMergeInfo,
    SegmentMergeInfos,
};
pub use version::Version;
