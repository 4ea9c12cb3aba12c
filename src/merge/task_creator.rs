//! Decomposition of merge plans into costed task items.

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::config::MergeConfig;
use crate::error::{MergeError, Result};
use crate::merge::plan::MergePlan;
use crate::merge::resource::{DocRangePartition, MergeTaskResourceManager};
use crate::merge::task_item::{MergeTaskItem, MergeTaskItems, MergeType, ParallelMergeItem};

/// An index structure that takes part in every merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeField {
    pub merge_type: MergeType,
    pub name: String,

    /// Also present in sub documents.
    #[serde(default)]
    pub has_sub: bool,

    /// Can be merged by several instances over disjoint doc ranges.
    #[serde(default)]
    pub parallel_capable: bool,

    /// Share of a segment's bytes this field accounts for.
    #[serde(default = "default_cost_weight")]
    pub cost_weight: f64,
}

fn default_cost_weight() -> f64 {
    1.0
}

impl MergeField {
    pub fn new(merge_type: MergeType, name: impl Into<String>) -> Self {
        MergeField {
            merge_type,
            name: name.into(),
            has_sub: false,
            parallel_capable: false,
            cost_weight: default_cost_weight(),
        }
    }

    pub fn with_sub(mut self, has_sub: bool) -> Self {
        self.has_sub = has_sub;
        self
    }

    pub fn with_parallel(mut self, parallel_capable: bool) -> Self {
        self.parallel_capable = parallel_capable;
        self
    }

    pub fn with_cost_weight(mut self, cost_weight: f64) -> Self {
        self.cost_weight = cost_weight;
        self
    }
}

/// Estimates how many bytes merging one field of a plan processes.
pub trait MergeCostEstimator: Send + Sync {
    fn estimate(&self, plan: &MergePlan, field: &MergeField, is_sub: bool) -> f64;
}

/// Cost proportional to the live share of each source segment's size.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentSizeCostEstimator;

impl MergeCostEstimator for SegmentSizeCostEstimator {
    fn estimate(&self, plan: &MergePlan, field: &MergeField, is_sub: bool) -> f64 {
        let infos = if is_sub {
            plan.sub_segment_merge_infos()
        } else {
            plan.segment_merge_infos()
        };
        let bytes: f64 = infos
            .iter()
            .filter(|info| info.doc_count() > 0)
            .map(|info| {
                info.segment_size as f64 * info.live_doc_count() as f64 / info.doc_count() as f64
            })
            .sum();
        bytes * field.cost_weight
    }
}

pub struct MergeTaskItemCreator {
    config: MergeConfig,
}

impl MergeTaskItemCreator {
    pub fn new(config: MergeConfig) -> Self {
        MergeTaskItemCreator { config }
    }

    /// Create the task items of all plans.
    ///
    /// Doc range partitions of parallel items are declared in `resources`.
    pub fn create(
        &self,
        plans: &[MergePlan],
        fields: &[MergeField],
        estimator: &dyn MergeCostEstimator,
        resources: &mut MergeTaskResourceManager,
    ) -> Result<MergeTaskItems> {
        self.config.validate()?;
        let mut items = MergeTaskItems::new();
        let mut next_group_id = 0;

        for (plan_idx, plan) in plans.iter().enumerate() {
            let plan_idx = u32::try_from(plan_idx)
                .map_err(|_| MergeError::out_of_range("too many merge plans"))?;
            let target_count = plan.target_segment_count();
            let targets: Vec<Option<usize>> = if self.config.split_segment_items && target_count > 1 {
                (0..target_count).map(Some).collect()
            } else {
                vec![None]
            };

            for field in fields {
                let mut sides = vec![false];
                if field.has_sub && plan.has_sub_segments() {
                    sides.push(true);
                }
                for is_sub in sides {
                    let plan_cost = estimator.estimate(plan, field, is_sub);
                    for target in &targets {
                        let (cost, doc_space) = share_of_target(plan, *target, is_sub, plan_cost);
                        let base = MergeTaskItem::new(plan_idx, field.merge_type.clone(), &field.name, is_sub)
                            .with_target_segment_idx(target.map_or(-1, |t| t as i64));
                        let parallel_count = self.parallel_count(field, cost);
                        if parallel_count <= 1 {
                            items.push(base.with_cost(cost));
                            continue;
                        }

                        let partition = DocRangePartition::even(doc_space, parallel_count)?;
                        let resource_id = resources.declare(partition.to_bytes()?);
                        let group_id = next_group_id;
                        next_group_id += 1;
                        for id in 0..parallel_count {
                            let mut parallel = ParallelMergeItem::new(
                                id as i32,
                                1.0 / parallel_count as f32,
                                group_id,
                                parallel_count as i32,
                            )?;
                            parallel.add_resource(resource_id);
                            items.push(
                                base.clone()
                                    .with_cost(cost / parallel_count as f64)
                                    .with_parallel_merge_item(parallel),
                            );
                        }
                        debug!(
                            "Split {} into {parallel_count} parallel instances (cost {cost:.0})",
                            base
                        );
                    }
                }
            }
        }

        info!(
            "Created {} merge task items for {} plans, total cost {:.0}",
            items.len(),
            plans.len(),
            items.total_cost()
        );
        Ok(items)
    }

    fn parallel_count(&self, field: &MergeField, cost: f64) -> usize {
        let threshold = self.config.parallel_threshold_bytes as f64;
        if !field.parallel_capable || cost <= threshold {
            return 1;
        }
        let wanted = (cost / threshold).ceil() as usize;
        wanted.min(self.config.max_parallel_count as usize).max(1)
    }
}

/// Cost and new doc space of one target of a plan.
fn share_of_target(plan: &MergePlan, target: Option<usize>, is_sub: bool, plan_cost: f64) -> (f64, u64) {
    let target_docs = |idx: usize| {
        if is_sub {
            plan.sub_target_segment_info(idx).doc_count
        } else {
            plan.target_segment_info(idx).doc_count
        }
    };
    let count = plan.target_segment_count();
    match target {
        None if count == 1 => (plan_cost, target_docs(0)),
        None => (plan_cost, (0..count).map(target_docs).sum()),
        Some(idx) => {
            let total: u64 = (0..count).map(target_docs).sum();
            let docs = target_docs(idx);
            let cost = if total == 0 {
                plan_cost / count as f64
            } else {
                plan_cost * docs as f64 / total as f64
            };
            (cost, docs)
        }
    }
}

/// Spread items over `instance_count` workers, largest cost first onto the
/// least loaded worker. Ties go to the lowest worker index.
pub fn dispatch_items(items: &[MergeTaskItem], instance_count: usize) -> Result<Vec<Vec<MergeTaskItem>>> {
    if instance_count == 0 {
        return Err(MergeError::invalid_argument("instance count must be greater than 0"));
    }
    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by(|a, b| items[*b].cost.total_cmp(&items[*a].cost));

    let mut loads = vec![0.0f64; instance_count];
    let mut dispatched = vec![Vec::new(); instance_count];
    for idx in order {
        let mut target = 0;
        for (instance, load) in loads.iter().enumerate() {
            if *load < loads[target] {
                target = instance;
            }
        }
        loads[target] += items[idx].cost;
        dispatched[target].push(items[idx].clone());
    }
    Ok(dispatched)
}
