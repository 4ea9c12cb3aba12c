//! Execution of merge task items and commit of the merged version.

use std::sync::Arc;

use ahash::AHashMap;
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::attribute::merger::UniqEncodedPackAttributeMerger;
use crate::attribute::pack::{PackAttributeFormat, PackAttributeReader, UniqEncodedPackSegment};
use crate::attribute::patch::AttributePatchFile;
use crate::config::MergeConfig;
use crate::error::{MergeError, Result};
use crate::index::segment::{GlobalId, INVALID_SEGMENT_ID, SegmentId, SegmentMergeInfos};
use crate::index::version::Version;
use crate::merge::checkpoint::CheckpointManager;
use crate::merge::meta::{MERGE_META_DIR, MergeMeta, MergePlanMeta};
use crate::merge::reclaim_map::ReclaimMap;
use crate::merge::resource::{DocRangePartition, MergeTaskResourceManager};
use crate::merge::task_item::{MergeTaskItem, MergeType};
use crate::pool::{ResourceControlThreadPool, ResourceControlWorkItem};
use crate::storage::{Storage, join_path, write_atomic};

const CHECKPOINT_DIR: &str = "checkpoints";
const SEGMENT_INFO_FILE: &str = "segment_info";
const SUB_SEGMENT_DIR: &str = "sub_segment";

/// Directory of a segment inside the partition.
pub fn segment_dir(segment_id: SegmentId) -> String {
    format!("segment_{segment_id}")
}

/// Everything a field merger sees of the plan an item belongs to.
pub struct MergeContext<'a> {
    pub plan_idx: usize,
    pub plan_meta: &'a MergePlanMeta,
    pub resources: &'a MergeTaskResourceManager,
    pub output: &'a dyn Storage,
}

impl MergeContext<'_> {
    /// Reclaim map and source segments of the main or sub side.
    pub fn side(&self, is_sub: bool) -> Result<(&ReclaimMap, &SegmentMergeInfos)> {
        if !is_sub {
            return Ok((
                self.plan_meta.reclaim_map.as_ref(),
                self.plan_meta.plan.segment_merge_infos(),
            ));
        }
        let sub = self.plan_meta.sub_reclaim_map.as_ref().ok_or_else(|| {
            MergeError::not_found(format!("merge plan {} has no sub reclaim map", self.plan_idx))
        })?;
        Ok((&sub.map, self.plan_meta.plan.sub_segment_merge_infos()))
    }

    /// Output directory of `target_idx`, `sub_segment/` nested for sub items.
    pub fn target_dir(&self, target_idx: usize, is_sub: bool) -> Result<String> {
        let segment_id = self.plan_meta.plan.target_segment_id(target_idx);
        if segment_id == INVALID_SEGMENT_ID {
            return Err(MergeError::invalid_argument(format!(
                "merge plan {} has no segment id for target {target_idx}",
                self.plan_idx
            )));
        }
        let dir = segment_dir(segment_id);
        Ok(if is_sub {
            join_path(&dir, SUB_SEGMENT_DIR)
        } else {
            dir
        })
    }

    /// New doc range `[start, end)` handled by a parallel instance.
    pub fn doc_range(&self, item: &MergeTaskItem) -> Result<Option<(GlobalId, GlobalId)>> {
        let parallel = &item.parallel_merge_item;
        if !parallel.is_valid() || parallel.total_parallel_count() <= 1 {
            return Ok(None);
        }
        let resource_id = parallel.resource_ids().first().copied().ok_or_else(|| {
            MergeError::corrupted(format!("parallel item {item} declares no doc range"))
        })?;
        let partition = DocRangePartition::from_bytes(self.resources.get(resource_id)?)?;
        Ok(Some(partition.range(parallel.id() as usize)?))
    }

    /// Targets an item writes: its own when split, all of them otherwise.
    pub fn item_targets(&self, item: &MergeTaskItem) -> Vec<usize> {
        match item.target_segment() {
            Some(target) => vec![target],
            None => (0..self.plan_meta.reclaim_map.target_segment_count()).collect(),
        }
    }
}

/// Merges the data of one field type.
pub trait FieldMerger: Send + Sync {
    fn merge_type(&self) -> MergeType;

    /// Resource held by the pool while `item` runs.
    fn estimate_memory_use(&self, _ctx: &MergeContext<'_>, item: &MergeTaskItem) -> i64 {
        item.cost.max(0.0) as i64
    }

    fn merge(&self, ctx: &MergeContext<'_>, item: &MergeTaskItem) -> Result<()>;
}

/// Input side of pack attribute merges.
pub trait PackAttributeSource: Send + Sync {
    fn format(&self, name: &str) -> Result<PackAttributeFormat>;

    fn reader(&self, segment_id: SegmentId, name: &str, is_sub: bool) -> Result<Arc<dyn PackAttributeReader>>;

    /// Patches whose target is one of `segment_ids`.
    fn patches(&self, name: &str, is_sub: bool, segment_ids: &[SegmentId]) -> Result<Vec<AttributePatchFile>>;
}

/// Reads pack attributes and their patches from a partition directory:
///
/// ```text
/// segment_<id>/[sub_segment/]attribute/<name>/{data,offset}
/// segment_<p>/[sub_segment/]attribute/<name>/<p>_<t>.patch
/// ```
///
/// Patch files are indexed on first use. Patches written after that are not
/// seen by this source.
#[derive(Debug)]
pub struct StoragePackAttributeSource {
    storage: Arc<dyn Storage>,
    formats: AHashMap<String, PackAttributeFormat>,
    patch_index: Mutex<Option<Arc<PatchIndex>>>,
}

/// Patch paths with their target segment, per `(attribute, is_sub)`.
type PatchIndex = AHashMap<(String, bool), Vec<(SegmentId, String)>>;

impl StoragePackAttributeSource {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        StoragePackAttributeSource {
            storage,
            formats: AHashMap::new(),
            patch_index: Mutex::new(None),
        }
    }

    fn patch_index(&self) -> Result<Arc<PatchIndex>> {
        let mut guard = self.patch_index.lock();
        if let Some(index) = guard.as_ref() {
            return Ok(Arc::clone(index));
        }
        let mut index = PatchIndex::new();
        for file in self.storage.list_files()? {
            let Some((dir, file_name)) = file.rsplit_once('/') else {
                continue;
            };
            let parts: Vec<&str> = dir.split('/').collect();
            let (segment, name, is_sub) = match parts.as_slice() {
                [segment, "attribute", name] => (*segment, *name, false),
                [segment, SUB_SEGMENT_DIR, "attribute", name] => (*segment, *name, true),
                _ => continue,
            };
            if !segment.starts_with("segment_") {
                continue;
            }
            let Some(target) = file_name
                .strip_suffix(".patch")
                .and_then(|stem| stem.split_once('_'))
                .and_then(|(_, target)| target.parse::<SegmentId>().ok())
            else {
                continue;
            };
            index
                .entry((name.to_string(), is_sub))
                .or_default()
                .push((target, file));
        }
        debug!("Indexed patch files of {} pack attributes", index.len());
        let index = Arc::new(index);
        *guard = Some(Arc::clone(&index));
        Ok(index)
    }

    pub fn with_format(mut self, name: impl Into<String>, format: PackAttributeFormat) -> Self {
        self.formats.insert(name.into(), format);
        self
    }
}

/// Directory of a pack attribute inside a segment.
pub fn attribute_dir(segment_id: SegmentId, name: &str, is_sub: bool) -> String {
    let mut dir = segment_dir(segment_id);
    if is_sub {
        dir = join_path(&dir, SUB_SEGMENT_DIR);
    }
    join_path(&join_path(&dir, "attribute"), name)
}

impl PackAttributeSource for StoragePackAttributeSource {
    fn format(&self, name: &str) -> Result<PackAttributeFormat> {
        self.formats
            .get(name)
            .cloned()
            .ok_or_else(|| MergeError::not_found(format!("pack attribute format of {name}")))
    }

    fn reader(&self, segment_id: SegmentId, name: &str, is_sub: bool) -> Result<Arc<dyn PackAttributeReader>> {
        let segment =
            UniqEncodedPackSegment::load(self.storage.as_ref(), &attribute_dir(segment_id, name, is_sub))?;
        Ok(Arc::new(segment))
    }

    fn patches(&self, name: &str, is_sub: bool, segment_ids: &[SegmentId]) -> Result<Vec<AttributePatchFile>> {
        let index = self.patch_index()?;
        let mut patches = Vec::new();
        for (target, path) in index.get(&(name.to_string(), is_sub)).into_iter().flatten() {
            if segment_ids.contains(target) {
                patches.push(AttributePatchFile::load(self.storage.as_ref(), path)?);
            }
        }
        // Write order across patch segments.
        patches.sort_by_key(|p| (p.patch_segment_idx, p.target_segment_id));
        Ok(patches)
    }
}

pub struct PackAttributeFieldMerger {
    source: Arc<dyn PackAttributeSource>,
}

impl PackAttributeFieldMerger {
    pub fn new(source: Arc<dyn PackAttributeSource>) -> Self {
        PackAttributeFieldMerger { source }
    }
}

impl FieldMerger for PackAttributeFieldMerger {
    fn merge_type(&self) -> MergeType {
        MergeType::PACK_ATTRIBUTE
    }

    fn merge(&self, ctx: &MergeContext<'_>, item: &MergeTaskItem) -> Result<()> {
        if ctx.doc_range(item)?.is_some() {
            return Err(MergeError::invalid_argument(format!(
                "pack attribute {} cannot be merged by parallel instances",
                item.name
            )));
        }
        let (reclaim_map, infos) = ctx.side(item.is_sub_item)?;
        let readers = infos
            .iter()
            .map(|info| self.source.reader(info.segment_id, &item.name, item.is_sub_item))
            .collect::<Result<Vec<_>>>()?;
        let reader_refs: Vec<&dyn PackAttributeReader> = readers.iter().map(|r| r.as_ref()).collect();
        let segment_ids: Vec<SegmentId> = infos.iter().map(|info| info.segment_id).collect();
        let patches = self.source.patches(&item.name, item.is_sub_item, &segment_ids)?;

        let mut merger = UniqEncodedPackAttributeMerger::new(self.source.format(&item.name)?);
        let merged = merger.merge(reclaim_map, infos, &reader_refs, &patches)?;
        for target in ctx.item_targets(item) {
            let segment = merged.get(target).ok_or_else(|| {
                MergeError::out_of_range(format!("target {target} of {item} not produced"))
            })?;
            let dir = join_path(
                &join_path(&ctx.target_dir(target, item.is_sub_item)?, "attribute"),
                &item.name,
            );
            segment.store(ctx.output, &dir)?;
            debug!("Wrote pack attribute {} to {dir}", item.name);
        }
        Ok(())
    }
}

struct MergeTaskWorkItem<'a> {
    item: MergeTaskItem,
    merger: Arc<dyn FieldMerger>,
    ctx: MergeContext<'a>,
    resource: i64,
    checkpoints: Option<&'a CheckpointManager>,
}

impl ResourceControlWorkItem for MergeTaskWorkItem<'_> {
    fn required_resource(&self) -> i64 {
        self.resource
    }

    fn process(&mut self) -> Result<()> {
        self.merger.merge(&self.ctx, &self.item)?;
        if let Some(checkpoints) = self.checkpoints {
            checkpoints.mark_done(&self.item)?;
        }
        debug!("Merge task item {} done", self.item);
        Ok(())
    }

    fn name(&self) -> String {
        self.item.to_string()
    }
}

/// Runs the task items of a [`MergeMeta`] and commits the result.
pub struct IndexPartitionMerger {
    config: MergeConfig,
    meta: MergeMeta,
    storage: Arc<dyn Storage>,
    mergers: AHashMap<MergeType, Arc<dyn FieldMerger>>,
    checkpoints: CheckpointManager,
}

impl IndexPartitionMerger {
    pub fn new(config: MergeConfig, meta: MergeMeta, storage: Arc<dyn Storage>) -> Self {
        let checkpoints = CheckpointManager::new(storage.clone(), join_path(MERGE_META_DIR, CHECKPOINT_DIR));
        IndexPartitionMerger {
            config,
            meta,
            storage,
            mergers: AHashMap::new(),
            checkpoints,
        }
    }

    pub fn register(&mut self, merger: Arc<dyn FieldMerger>) {
        self.mergers.insert(merger.merge_type(), merger);
    }

    pub fn meta(&self) -> &MergeMeta {
        &self.meta
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Merge every item of the meta that has no checkpoint yet.
    pub fn merge_all(&self) -> Result<usize> {
        self.merge_items(self.meta.task_items.as_slice())
    }

    /// Merge `items`, skipping checkpointed ones. Returns the number of items
    /// run.
    pub fn merge_items(&self, items: &[MergeTaskItem]) -> Result<usize> {
        self.config.validate()?;
        let pending = if self.config.enable_check_point {
            self.checkpoints.pending_items(items)
        } else {
            items.to_vec()
        };
        if pending.is_empty() {
            info!("All {} merge task items are checkpointed", items.len());
            return Ok(0);
        }

        let checkpoints = self.config.enable_check_point.then_some(&self.checkpoints);
        let mut work_items: Vec<Box<dyn ResourceControlWorkItem + '_>> = Vec::with_capacity(pending.len());
        for item in pending {
            let merger = self.mergers.get(&item.merge_type).cloned().ok_or_else(|| {
                MergeError::not_found(format!("no field merger for merge type {}", item.merge_type))
            })?;
            let plan_idx = item.merge_plan_idx as usize;
            let ctx = MergeContext {
                plan_idx,
                plan_meta: self.meta.plan_meta(plan_idx)?,
                resources: &self.meta.resources,
                output: self.storage.as_ref(),
            };
            // Items above the pool limit are rejected by the pool at init.
            let resource = merger.estimate_memory_use(&ctx, &item).max(0);
            work_items.push(Box::new(MergeTaskWorkItem {
                item,
                merger,
                ctx,
                resource,
                checkpoints,
            }));
        }

        let count = work_items.len();
        let mut pool = ResourceControlThreadPool::new(self.config.thread_pool_config());
        pool.init(work_items)?;
        pool.run("merge")?;
        info!("Merged {count} task items");
        Ok(count)
    }

    /// Write segment infos of all targets and the next version.
    ///
    /// Source segments of every plan leave `version`, targets join it.
    pub fn commit(&self, version: &Version) -> Result<Version> {
        if self.config.enable_check_point {
            let left = self.checkpoints.pending_items(self.meta.task_items.as_slice());
            if let Some(item) = left.first() {
                return Err(MergeError::invalid_argument(format!(
                    "cannot commit, {} task items not merged, first is {item}",
                    left.len()
                )));
            }
        }

        let mut removed = Vec::new();
        let mut added = Vec::new();
        for (plan_idx, meta) in self.meta.plan_metas.iter().enumerate() {
            let plan = &meta.plan;
            removed.extend(plan.segment_ids());
            for target in 0..meta.reclaim_map.target_segment_count() {
                let segment_id = plan.target_segment_id(target);
                if segment_id == INVALID_SEGMENT_ID {
                    return Err(MergeError::invalid_argument(format!(
                        "merge plan {plan_idx} has no segment id for target {target}"
                    )));
                }
                let dir = segment_dir(segment_id);
                write_atomic(
                    self.storage.as_ref(),
                    &join_path(&dir, SEGMENT_INFO_FILE),
                    &serde_json::to_vec_pretty(&plan.target_segment_info(target))?,
                )?;
                if meta.sub_reclaim_map.is_some() {
                    write_atomic(
                        self.storage.as_ref(),
                        &join_path(&join_path(&dir, SUB_SEGMENT_DIR), SEGMENT_INFO_FILE),
                        &serde_json::to_vec_pretty(&plan.sub_target_segment_info(target))?,
                    )?;
                }
                added.push(segment_id);
            }
        }

        let next = version.apply_merge(&removed, &added, self.meta.timestamp)?;
        next.store(self.storage.as_ref())?;
        info!(
            "Committed version {}: removed {removed:?}, added {added:?}",
            next.version_id
        );
        if self.config.enable_check_point {
            if let Err(e) = self.checkpoints.clear() {
                warn!("Failed to clear checkpoints after commit: {e}");
            }
        }
        Ok(next)
    }
}
