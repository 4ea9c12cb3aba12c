//! Merge meta: everything computed before any index data is merged.
//!
//! For each plan the reclaim maps are built on the resource controlled pool,
//! one [`MergeMetaWorkItem`] per plan, then the plans are decomposed into task
//! items. The result is persisted under `merge_meta/` so that a restarted merge
//! resumes from it without recomputation:
//!
//! ```text
//! merge_meta/
//! ├── merge_plan_<i>/{merge_plan, reclaim_map, sub_reclaim_map}
//! ├── merge_task_items
//! ├── merge_resource/resource_<id>
//! └── version            written last, marks the meta complete
//! ```

use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::MergeConfig;
use crate::error::{MergeError, Result};
use crate::index::deletion::DeletionMapReader;
use crate::index::segment::SegmentInfo;
use crate::merge::plan::MergePlan;
use crate::merge::reclaim_map::{ReclaimMap, SubReclaimMap};
use crate::merge::reclaim_map_creator::{JoinValueReader, ReclaimMapCreator, SegmentSplitHandler};
use crate::merge::resource::MergeTaskResourceManager;
use crate::merge::task_creator::{MergeCostEstimator, MergeField, MergeTaskItemCreator};
use crate::merge::task_item::MergeTaskItems;
use crate::pool::{ResourceControlThreadPool, ResourceControlWorkItem};
use crate::storage::{Storage, join_path, read_all, write_atomic};

pub const MERGE_META_DIR: &str = "merge_meta";
const MERGE_META_VERSION_FILE: &str = "version";
const RECLAIM_MAP_FILE: &str = "reclaim_map";
const SUB_RECLAIM_MAP_FILE: &str = "sub_reclaim_map";

/// A plan with its frozen reclaim maps.
#[derive(Debug, Clone)]
pub struct MergePlanMeta {
    pub plan: MergePlan,
    pub reclaim_map: Arc<ReclaimMap>,
    pub sub_reclaim_map: Option<Arc<SubReclaimMap>>,
}

/// Creates the split handler of a plan, if its output is split.
pub trait SegmentSplitHandlerFactory: Send + Sync {
    fn create(&self, plan_idx: usize, plan: &MergePlan) -> Option<Arc<dyn SegmentSplitHandler>>;
}

/// Sub document inputs shared by all plans of a merge.
#[derive(Clone, Copy)]
pub struct SubDocInput<'a> {
    pub join: &'a dyn JoinValueReader,
    pub deletions: &'a dyn DeletionMapReader,
}

type PlanSlots = Mutex<Vec<Option<MergePlanMeta>>>;

/// Builds the reclaim maps of one plan.
pub struct MergeMetaWorkItem<'a> {
    plan_idx: usize,
    plan: Option<MergePlan>,
    creator: ReclaimMapCreator,
    deletion_reader: &'a dyn DeletionMapReader,
    split_handler: Option<Arc<dyn SegmentSplitHandler>>,
    sub_input: Option<SubDocInput<'a>>,
    slots: &'a PlanSlots,
}

impl<'a> MergeMetaWorkItem<'a> {
    fn target_count(&self) -> usize {
        self.split_handler
            .as_ref()
            .map_or(1, |h| h.target_segment_count())
    }
}

impl ResourceControlWorkItem for MergeMetaWorkItem<'_> {
    fn required_resource(&self) -> i64 {
        let Some(plan) = &self.plan else {
            return 0;
        };
        let target_count = self.target_count();
        let main = ReclaimMap::estimate_memory_use(
            plan.segment_merge_infos().total_doc_count(),
            target_count,
            self.creator.with_reverse(),
        );
        let sub = if plan.has_sub_segments() && self.sub_input.is_some() {
            // Join values are kept per target on top of the map itself.
            ReclaimMap::estimate_memory_use(
                plan.sub_segment_merge_infos().total_doc_count(),
                target_count,
                self.creator.with_reverse(),
            )
            .saturating_add(plan.sub_segment_merge_infos().total_doc_count() as i64 * 4)
        } else {
            0
        };
        main.saturating_add(sub)
    }

    fn process(&mut self) -> Result<()> {
        let mut plan = self
            .plan
            .take()
            .ok_or_else(|| MergeError::internal("merge meta work item processed twice"))?;
        let infos = plan.segment_merge_infos();
        let map = self
            .creator
            .create(infos, self.deletion_reader, self.split_handler.as_deref())?;

        // A plan without target ids still names one implicit target.
        let plan_targets = plan.target_segment_count();
        if plan_targets != map.target_segment_count() {
            return Err(MergeError::invalid_argument(format!(
                "plan {} has {plan_targets} target segments, split produces {} targets",
                self.plan_idx,
                map.target_segment_count()
            )));
        }

        let sub_map = match self.sub_input {
            Some(input) if plan.has_sub_segments() => Some(self.creator.create_sub(
                &map,
                plan.segment_merge_infos(),
                plan.sub_segment_merge_infos(),
                input.join,
                input.deletions,
            )?),
            _ => None,
        };

        // Doc counts come from the map; timestamp and ttl from the plan, where
        // explicitly set target infos win over the aggregate.
        for target in 0..map.target_segment_count() {
            let info = plan.target_segment_info(target);
            plan.set_target_segment_info(
                target,
                SegmentInfo::new(map.target_doc_count(target) as u64, info.timestamp, info.max_ttl),
            );
        }
        if let Some(sub) = &sub_map {
            for target in 0..sub.map.target_segment_count() {
                let info = plan.sub_target_segment_info(target);
                plan.set_sub_target_segment_info(
                    target,
                    SegmentInfo::new(sub.map.target_doc_count(target) as u64, info.timestamp, info.max_ttl),
                );
            }
        }

        debug!(
            "Merge plan {} meta ready: {} docs into {} targets",
            self.plan_idx,
            map.new_doc_count(),
            map.target_segment_count()
        );
        let meta = MergePlanMeta {
            plan,
            reclaim_map: Arc::new(map),
            sub_reclaim_map: sub_map.map(Arc::new),
        };
        let mut slots = self.slots.lock();
        slots[self.plan_idx] = Some(meta);
        Ok(())
    }

    fn destroy(&mut self) {
        self.plan = None;
        self.split_handler = None;
    }

    fn name(&self) -> String {
        format!("merge_meta_plan_{}", self.plan_idx)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MergeMetaVersion {
    plan_count: usize,
    timestamp: i64,
    has_sub: Vec<bool>,
}

/// Reclaim maps, task items and shared resources of a whole merge.
#[derive(Debug, Clone)]
pub struct MergeMeta {
    pub plan_metas: Vec<MergePlanMeta>,
    pub task_items: MergeTaskItems,
    pub resources: MergeTaskResourceManager,

    /// Newest timestamp over all targets.
    pub timestamp: i64,
}

impl MergeMeta {
    pub fn plan_count(&self) -> usize {
        self.plan_metas.len()
    }

    pub fn plan_meta(&self, plan_idx: usize) -> Result<&MergePlanMeta> {
        self.plan_metas
            .get(plan_idx)
            .ok_or_else(|| MergeError::not_found(format!("merge plan {plan_idx}")))
    }

    pub fn is_complete(storage: &dyn Storage) -> bool {
        storage.file_exists(&join_path(MERGE_META_DIR, MERGE_META_VERSION_FILE))
    }

    /// Remove a previously stored meta. The version marker goes first so an
    /// interrupted clear never leaves a complete looking meta behind.
    pub fn clear(storage: &dyn Storage) -> Result<()> {
        storage.delete_file(&join_path(MERGE_META_DIR, MERGE_META_VERSION_FILE))?;
        let prefix = format!("{MERGE_META_DIR}/");
        let mut removed = 0usize;
        for file in storage.list_files()? {
            if file.starts_with(&prefix) {
                storage.delete_file(&file)?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Removed {removed} files of a previous merge meta");
        }
        Ok(())
    }

    /// Persist the meta, replacing any meta stored before, checkpoints
    /// included.
    pub fn store(&self, storage: &dyn Storage) -> Result<()> {
        Self::clear(storage)?;
        let mut has_sub = Vec::with_capacity(self.plan_metas.len());
        for (idx, meta) in self.plan_metas.iter().enumerate() {
            let dir = plan_dir(idx);
            meta.plan.store(storage, &dir)?;
            meta.reclaim_map
                .store(storage, &join_path(&dir, RECLAIM_MAP_FILE))?;
            if let Some(sub) = &meta.sub_reclaim_map {
                sub.store(storage, &join_path(&dir, SUB_RECLAIM_MAP_FILE))?;
            }
            has_sub.push(meta.sub_reclaim_map.is_some());
        }
        self.task_items.store(storage, MERGE_META_DIR)?;
        self.resources.store(storage, MERGE_META_DIR)?;

        let version = MergeMetaVersion {
            plan_count: self.plan_metas.len(),
            timestamp: self.timestamp,
            has_sub,
        };
        write_atomic(
            storage,
            &join_path(MERGE_META_DIR, MERGE_META_VERSION_FILE),
            &serde_json::to_vec_pretty(&version)?,
        )?;
        info!(
            "Stored merge meta: {} plans, {} task items",
            self.plan_metas.len(),
            self.task_items.len()
        );
        Ok(())
    }

    /// Load a meta written by [`store`](Self::store). A meta without its
    /// version marker is incomplete and reported as `NotFound`.
    pub fn load(storage: &dyn Storage) -> Result<MergeMeta> {
        let version_path = join_path(MERGE_META_DIR, MERGE_META_VERSION_FILE);
        if !storage.file_exists(&version_path) {
            return Err(MergeError::not_found("merge meta is incomplete"));
        }
        let version: MergeMetaVersion = serde_json::from_slice(&read_all(storage, &version_path)?)?;
        if version.has_sub.len() != version.plan_count {
            return Err(MergeError::corrupted("merge meta version lists inconsistent plans"));
        }

        let mut plan_metas = Vec::with_capacity(version.plan_count);
        for (idx, has_sub) in version.has_sub.iter().enumerate() {
            let dir = plan_dir(idx);
            let plan = MergePlan::load(storage, &dir)?;
            let reclaim_map = Arc::new(ReclaimMap::load(storage, &join_path(&dir, RECLAIM_MAP_FILE))?);
            let sub_reclaim_map = if *has_sub {
                Some(Arc::new(SubReclaimMap::load(
                    storage,
                    &join_path(&dir, SUB_RECLAIM_MAP_FILE),
                )?))
            } else {
                None
            };
            plan_metas.push(MergePlanMeta {
                plan,
                reclaim_map,
                sub_reclaim_map,
            });
        }
        Ok(MergeMeta {
            plan_metas,
            task_items: MergeTaskItems::load(storage, MERGE_META_DIR)?,
            resources: MergeTaskResourceManager::load(storage, MERGE_META_DIR)?,
            timestamp: version.timestamp,
        })
    }
}

fn plan_dir(plan_idx: usize) -> String {
    join_path(MERGE_META_DIR, &format!("merge_plan_{plan_idx}"))
}

pub struct MergeMetaCreator {
    config: MergeConfig,
    creator: ReclaimMapCreator,
}

impl MergeMetaCreator {
    pub fn new(config: MergeConfig) -> Self {
        MergeMetaCreator {
            config,
            creator: ReclaimMapCreator::new(false),
        }
    }

    /// Build reverse lookup tables, needed by truncated indexes.
    pub fn with_reverse(mut self, with_reverse: bool) -> Self {
        self.creator = ReclaimMapCreator::new(with_reverse);
        self
    }

    pub fn create(
        &self,
        plans: Vec<MergePlan>,
        deletion_reader: &dyn DeletionMapReader,
        split_factory: Option<&dyn SegmentSplitHandlerFactory>,
        sub_input: Option<SubDocInput<'_>>,
        fields: &[MergeField],
        estimator: &dyn MergeCostEstimator,
    ) -> Result<MergeMeta> {
        self.config.validate()?;
        let plan_count = plans.len();
        info!("Creating merge meta for {plan_count} plans");

        let slots: PlanSlots = Mutex::new(vec![None; plan_count]);
        let mut items: Vec<Box<dyn ResourceControlWorkItem + '_>> = Vec::with_capacity(plan_count);
        for (plan_idx, plan) in plans.into_iter().enumerate() {
            let split_handler = split_factory.and_then(|f| f.create(plan_idx, &plan));
            items.push(Box::new(MergeMetaWorkItem {
                plan_idx,
                plan: Some(plan),
                creator: self.creator,
                deletion_reader,
                split_handler,
                sub_input,
                slots: &slots,
            }));
        }

        let mut pool = ResourceControlThreadPool::new(self.config.thread_pool_config());
        pool.init(items)?;
        pool.run("merge_meta")?;
        drop(pool);

        let mut plan_metas = Vec::with_capacity(plan_count);
        for (idx, slot) in slots.into_inner().into_iter().enumerate() {
            plan_metas.push(
                slot.ok_or_else(|| MergeError::internal(format!("merge plan {idx} has no meta")))?,
            );
        }

        let plans: Vec<MergePlan> = plan_metas.iter().map(|m| m.plan.clone()).collect();
        let mut resources = MergeTaskResourceManager::new();
        let task_items = MergeTaskItemCreator::new(self.config.clone()).create(
            &plans,
            fields,
            estimator,
            &mut resources,
        )?;
        let timestamp = plans
            .iter()
            .flat_map(|plan| (0..plan.target_segment_count()).map(|t| plan.target_segment_info(t).timestamp))
            .max()
            .unwrap_or(0);

        info!(
            "Merge meta created: {plan_count} plans, {} task items",
            task_items.len()
        );
        Ok(MergeMeta {
            plan_metas,
            task_items,
            resources,
            timestamp,
        })
    }
}
