//! Deferred document operations replayed against merged segments.
//!
//! Operations are a sum type over the primary key width. Removing a doc,
//! updating some of its fields and operating on its sub documents are the
//! three kinds an operation log can hold.

use std::fmt::Debug;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub mod iterator;
pub mod oplog;
pub mod replay;

pub use iterator::OperationIterator;
pub use oplog::OperationLog;
pub use replay::{OperationReplayer, PrimaryKeyIndex, ReplayResult};

/// Primary key of a document, hashed to 64 or 128 bits.
pub trait PrimaryKey:
    Copy + Debug + Eq + Hash + Ord + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl PrimaryKey for u64 {}
impl PrimaryKey for u128 {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "K: PrimaryKey")]
pub enum Operation<K> {
    Remove {
        pk: K,
    },
    UpdateField {
        pk: K,
        /// `(field_id, value)` pairs.
        fields: Vec<(u16, Vec<u8>)>,
    },
    /// Operations on sub documents of `main_pk`. Their keys are sub doc keys.
    SubDoc {
        main_pk: K,
        sub_ops: Vec<Operation<K>>,
    },
}

impl<K: PrimaryKey> Operation<K> {
    /// Key of the main document the operation targets.
    pub fn pk(&self) -> K {
        match self {
            Operation::Remove { pk } | Operation::UpdateField { pk, .. } => *pk,
            Operation::SubDoc { main_pk, .. } => *main_pk,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Remove { .. } => "remove",
            Operation::UpdateField { .. } => "update_field",
            Operation::SubDoc { .. } => "sub_doc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "K: PrimaryKey")]
pub struct OperationRecord<K> {
    pub timestamp: i64,
    pub op: Operation<K>,
}
