//! Pack attribute data and the merge of pending attribute patches.

pub mod merger;
pub mod pack;
pub mod patch;

pub use merger::UniqEncodedPackAttributeMerger;
pub use pack::{
    PackAttributeFormat, PackAttributeReader, PackValue, UniqEncodedPackSegment,
    UniqEncodedPackWriter,
};
pub use patch::{AttributePatchFile, PatchBuffer, PatchEntry, PatchedDocInfo};
