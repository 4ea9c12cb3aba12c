//! Schedulable merge work units and their checkpoint names.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{MergeError, Result};
use crate::storage::{Storage, join_path, read_all, write_atomic};

pub const MERGE_TASK_ITEMS_FILE_NAME: &str = "merge_task_items";
pub const INVALID_PARALLEL_MERGE_ITEM_ID: i32 = -1;
pub const INVALID_TARGET_SEGMENT_IDX: i64 = -1;

/// Kind of index structure a task item merges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MergeType(Cow<'static, str>);

impl MergeType {
    pub const ATTRIBUTE: MergeType = MergeType(Cow::Borrowed("attribute"));
    pub const PACK_ATTRIBUTE: MergeType = MergeType(Cow::Borrowed("pack_attribute"));
    pub const INDEX: MergeType = MergeType(Cow::Borrowed("index"));
    pub const SUMMARY: MergeType = MergeType(Cow::Borrowed("summary"));
    pub const DELETION_MAP: MergeType = MergeType(Cow::Borrowed("deletionmap"));

    pub fn new<S: Into<String>>(name: S) -> Self {
        MergeType(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MergeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One of several cooperating instances of a task item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelMergeItem {
    #[serde(rename = "Id")]
    id: i32,

    #[serde(rename = "DataRatio")]
    data_ratio: f32,

    #[serde(rename = "TaskGroupId")]
    task_group_id: i32,

    #[serde(rename = "TotalParallelCount")]
    total_parallel_count: i32,

    /// Handles of artifacts shared by all instances of the group.
    #[serde(rename = "ResourceIds", default)]
    resource_ids: Vec<i64>,
}

impl Default for ParallelMergeItem {
    fn default() -> Self {
        ParallelMergeItem {
            id: INVALID_PARALLEL_MERGE_ITEM_ID,
            data_ratio: 1.0,
            task_group_id: 0,
            total_parallel_count: 1,
            resource_ids: Vec::new(),
        }
    }
}

impl ParallelMergeItem {
    pub fn new(
        id: i32,
        data_ratio: f32,
        task_group_id: i32,
        total_parallel_count: i32,
    ) -> Result<Self> {
        let item = ParallelMergeItem {
            id,
            data_ratio,
            task_group_id,
            total_parallel_count,
            resource_ids: Vec::new(),
        };
        item.validate()?;
        Ok(item)
    }

    /// Check the ratio and the instance id. An item equal to the default
    /// single instance carries no id.
    pub fn validate(&self) -> Result<()> {
        let data_ratio = self.data_ratio;
        if !(data_ratio > 0.0 && data_ratio <= 1.0) {
            return Err(MergeError::invalid_argument(format!(
                "data ratio {data_ratio} outside (0, 1]"
            )));
        }
        let (id, total) = (self.id, self.total_parallel_count);
        if id == INVALID_PARALLEL_MERGE_ITEM_ID && total == 1 {
            return Ok(());
        }
        if total < 1 || id < 0 || id >= total {
            return Err(MergeError::invalid_argument(format!(
                "parallel id {id} outside [0, {total})"
            )));
        }
        Ok(())
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn data_ratio(&self) -> f32 {
        self.data_ratio
    }

    pub fn task_group_id(&self) -> i32 {
        self.task_group_id
    }

    pub fn total_parallel_count(&self) -> i32 {
        self.total_parallel_count
    }

    pub fn resource_ids(&self) -> &[i64] {
        &self.resource_ids
    }

    pub fn add_resource(&mut self, resource_id: i64) {
        self.resource_ids.push(resource_id);
    }

    pub fn is_valid(&self) -> bool {
        self.id != INVALID_PARALLEL_MERGE_ITEM_ID
    }

    /// Part of the checkpoint name identifying this instance. Empty for
    /// single instance items so their names stay stable.
    pub fn checkpoint_suffix(&self) -> String {
        if self.total_parallel_count <= 1 {
            String::new()
        } else {
            format!("-{}-{}", self.total_parallel_count, self.id)
        }
    }

    /// Sub directory for the output of this instance.
    pub fn instance_dir_name(&self) -> String {
        if self.total_parallel_count <= 1 {
            String::new()
        } else {
            format!("inst_{}_{}", self.total_parallel_count, self.id)
        }
    }

    fn is_invalid(&self) -> bool {
        !self.is_valid()
    }
}

fn invalid_target_segment_idx() -> i64 {
    INVALID_TARGET_SEGMENT_IDX
}

fn is_invalid_target_segment_idx(idx: &i64) -> bool {
    *idx == INVALID_TARGET_SEGMENT_IDX
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeTaskItem {
    #[serde(rename = "MergePlanId")]
    pub merge_plan_idx: u32,

    #[serde(rename = "MergeType")]
    pub merge_type: MergeType,

    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "IsSubItem", default)]
    pub is_sub_item: bool,

    /// Estimated bytes to process.
    #[serde(rename = "Cost", default)]
    pub cost: f64,

    #[serde(
        rename = "ParallelMergeItem",
        default,
        skip_serializing_if = "ParallelMergeItem::is_invalid"
    )]
    pub parallel_merge_item: ParallelMergeItem,

    /// Target segment this item writes, or `-1` for every target of the plan.
    #[serde(
        rename = "TargetSegmentIdx",
        default = "invalid_target_segment_idx",
        skip_serializing_if = "is_invalid_target_segment_idx"
    )]
    pub target_segment_idx: i64,
}

impl MergeTaskItem {
    pub fn new(merge_plan_idx: u32, merge_type: MergeType, name: impl Into<String>, is_sub_item: bool) -> Self {
        MergeTaskItem {
            merge_plan_idx,
            merge_type,
            name: name.into(),
            is_sub_item,
            cost: 0.0,
            parallel_merge_item: ParallelMergeItem::default(),
            target_segment_idx: INVALID_TARGET_SEGMENT_IDX,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_target_segment_idx(mut self, idx: i64) -> Self {
        self.target_segment_idx = idx;
        self
    }

    pub fn with_parallel_merge_item(mut self, item: ParallelMergeItem) -> Self {
        self.parallel_merge_item = item;
        self
    }

    /// Target segment index this item is restricted to.
    pub fn target_segment(&self) -> Option<usize> {
        usize::try_from(self.target_segment_idx).ok()
    }

    pub fn checkpoint_name(&self) -> String {
        let mut name = format!(
            "MergePlan_{}_{}_{}{}_{}",
            self.merge_plan_idx,
            self.merge_type,
            self.name,
            self.parallel_merge_item.checkpoint_suffix(),
            self.target_segment_idx
        );
        if self.is_sub_item {
            name.push_str("_sub");
        }
        name.push_str(".checkpoint");
        name
    }
}

impl fmt::Display for MergeTaskItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MergePlan_{}_{}_{}{}",
            self.merge_plan_idx,
            self.merge_type,
            self.name,
            self.parallel_merge_item.checkpoint_suffix()
        )?;
        if self.target_segment_idx != INVALID_TARGET_SEGMENT_IDX {
            write!(f, "@{}", self.target_segment_idx)?;
        }
        if self.is_sub_item {
            f.write_str("[sub]")?;
        }
        Ok(())
    }
}

/// Ordered list of task items of a merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MergeTaskItems(Vec<MergeTaskItem>);

impl MergeTaskItems {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: MergeTaskItem) {
        self.0.push(item);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MergeTaskItem> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[MergeTaskItem] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<MergeTaskItem> {
        self.0
    }

    pub fn total_cost(&self) -> f64 {
        self.0.iter().map(|item| item.cost).sum()
    }

    pub fn store(&self, storage: &dyn Storage, dir: &str) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(storage, &join_path(dir, MERGE_TASK_ITEMS_FILE_NAME), &bytes)
    }

    pub fn load(storage: &dyn Storage, dir: &str) -> Result<MergeTaskItems> {
        let bytes = read_all(storage, &join_path(dir, MERGE_TASK_ITEMS_FILE_NAME))?;
        let items: MergeTaskItems = serde_json::from_slice(&bytes)?;
        for item in &items {
            item.parallel_merge_item
                .validate()
                .map_err(|e| MergeError::corrupted(format!("task item {item}: {e}")))?;
        }
        Ok(items)
    }
}

impl From<Vec<MergeTaskItem>> for MergeTaskItems {
    fn from(items: Vec<MergeTaskItem>) -> Self {
        MergeTaskItems(items)
    }
}

impl IntoIterator for MergeTaskItems {
    type Item = MergeTaskItem;
    type IntoIter = std::vec::IntoIter<MergeTaskItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a MergeTaskItems {
    type Item = &'a MergeTaskItem;
    type IntoIter = std::slice::Iter<'a, MergeTaskItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};

    #[test]
    fn test_checkpoint_suffix() {
        let single = ParallelMergeItem::new(0, 1.0, 0, 1).unwrap();
        assert_eq!(single.checkpoint_suffix(), "");

        let third = ParallelMergeItem::new(2, 0.25, 7, 4).unwrap();
        assert_eq!(third.checkpoint_suffix(), "-4-2");
    }

    #[test]
    fn test_parallel_item_validation() {
        assert!(ParallelMergeItem::new(0, 0.0, 0, 1).is_err());
        assert!(ParallelMergeItem::new(0, 1.5, 0, 1).is_err());
        assert!(ParallelMergeItem::new(0, f32::NAN, 0, 1).is_err());
        assert!(ParallelMergeItem::new(4, 0.25, 0, 4).is_err());
        assert!(ParallelMergeItem::new(-1, 0.25, 0, 4).is_err());
    }

    #[test]
    fn test_checkpoint_name() {
        let item = MergeTaskItem::new(1, MergeType::ATTRIBUTE, "price", false)
            .with_target_segment_idx(0);
        assert_eq!(item.checkpoint_name(), "MergePlan_1_attribute_price_0.checkpoint");

        let parallel = ParallelMergeItem::new(2, 0.25, 0, 4).unwrap();
        let item = MergeTaskItem::new(0, MergeType::INDEX, "title", true)
            .with_parallel_merge_item(parallel)
            .with_target_segment_idx(1);
        assert_eq!(
            item.checkpoint_name(),
            "MergePlan_0_index_title-4-2_1_sub.checkpoint"
        );
    }

    #[test]
    fn test_json_omits_defaults() {
        let item = MergeTaskItem::new(3, MergeType::SUMMARY, "summary", false).with_cost(12.5);
        let json = serde_json::to_value(&item).unwrap();

        assert_eq!(json["MergePlanId"], 3);
        assert_eq!(json["MergeType"], "summary");
        assert_eq!(json["Cost"], 12.5);
        assert!(json.get("ParallelMergeItem").is_none());
        assert!(json.get("TargetSegmentIdx").is_none());

        let restored: MergeTaskItem = serde_json::from_value(json).unwrap();
        assert_eq!(restored, item);
    }

    #[test]
    fn test_json_round_trip_with_parallel_item() {
        let mut parallel = ParallelMergeItem::new(1, 0.5, 3, 2).unwrap();
        parallel.add_resource(0);
        let item = MergeTaskItem::new(0, MergeType::INDEX, "body", false)
            .with_parallel_merge_item(parallel)
            .with_target_segment_idx(2);
        let json = serde_json::to_string(&item).unwrap();

        assert!(json.contains("\"TargetSegmentIdx\":2"));
        assert!(json.contains("\"ResourceIds\":[0]"));
        assert_eq!(serde_json::from_str::<MergeTaskItem>(&json).unwrap(), item);
    }

    #[test]
    fn test_store_and_load() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let items = MergeTaskItems::from(vec![
            MergeTaskItem::new(0, MergeType::ATTRIBUTE, "price", false).with_cost(1.0),
            MergeTaskItem::new(0, MergeType::DELETION_MAP, "deletionmap", false).with_cost(2.0),
        ]);
        items.store(&storage, "merge_meta").unwrap();

        let loaded = MergeTaskItems::load(&storage, "merge_meta").unwrap();
        assert_eq!(loaded, items);
        assert_eq!(loaded.total_cost(), 3.0);
    }

    #[test]
    fn test_load_rejects_invalid_parallel_items() {
        let storage = MemoryStorage::new(MemoryStorageConfig::default());
        let item = |parallel: &str| {
            format!(
                r#"[{{"MergePlanId":0,"MergeType":"index","Name":"body","IsSubItem":false,"Cost":1.0,"ParallelMergeItem":{parallel}}}]"#
            )
        };
        for parallel in [
            r#"{"Id":0,"DataRatio":0.0,"TaskGroupId":0,"TotalParallelCount":2}"#,
            r#"{"Id":2,"DataRatio":0.5,"TaskGroupId":0,"TotalParallelCount":2}"#,
        ] {
            write_atomic(&storage, "merge_meta/merge_task_items", item(parallel).as_bytes()).unwrap();
            assert!(matches!(
                MergeTaskItems::load(&storage, "merge_meta"),
                Err(MergeError::Corrupted(_))
            ));
        }

        let valid = r#"{"Id":1,"DataRatio":0.5,"TaskGroupId":0,"TotalParallelCount":2}"#;
        write_atomic(&storage, "merge_meta/merge_task_items", item(valid).as_bytes()).unwrap();
        let loaded = MergeTaskItems::load(&storage, "merge_meta").unwrap();
        assert_eq!(loaded.as_slice()[0].parallel_merge_item.id(), 1);
    }
}
