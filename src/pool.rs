//! A fixed size thread pool that bounds the total resource of running items.
//!
//! Every work item declares how much resource (bytes of memory) it needs.
//! Worker threads take the first pending item that fits into the resource
//! left, run it and give the resource back once it succeeds. When nothing fits
//! a worker sleeps for a short while and retries, so that a small item queued
//! behind a large one still makes progress.
//!
//! The first failure stops the pool: no further items are dispatched, running
//! items finish, threads are joined and the error is returned from
//! [`ResourceControlThreadPool::run`]. The resource of the failed item is not
//! given back.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::config::ThreadPoolConfig;
use crate::error::{MergeError, Result};

const STARVATION_WARN_INTERVAL: Duration = Duration::from_secs(60);

/// A unit of work scheduled under a resource budget.
pub trait ResourceControlWorkItem: Send {
    /// Resource held while the item runs.
    fn required_resource(&self) -> i64;

    fn process(&mut self) -> Result<()>;

    /// Release whatever the item still holds. Called once after `process`,
    /// whether it succeeded or not.
    fn destroy(&mut self) {}

    fn name(&self) -> String {
        String::from("work_item")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItemState {
    Pending,
    Running,
    Done,
    Failed,
}

struct PendingItem<'a> {
    idx: usize,
    resource: i64,
    item: Box<dyn ResourceControlWorkItem + 'a>,
}

struct PoolState<'a> {
    pending: Vec<PendingItem<'a>>,
    states: Vec<WorkItemState>,
    left_resource: i64,
    in_use: i64,
    peak_in_use: i64,
    first_error: Option<MergeError>,
}

impl<'a> PoolState<'a> {
    /// Take the first pending item that fits into the resource left.
    fn take_next(&mut self) -> Option<PendingItem<'a>> {
        let pos = self
            .pending
            .iter()
            .position(|p| p.resource <= self.left_resource)?;
        let next = self.pending.remove(pos);
        self.left_resource -= next.resource;
        self.in_use += next.resource;
        self.peak_in_use = self.peak_in_use.max(self.in_use);
        self.states[next.idx] = WorkItemState::Running;
        Some(next)
    }

    fn should_stop(&self) -> bool {
        self.first_error.is_some() || self.pending.is_empty()
    }
}

pub struct ResourceControlThreadPool<'a> {
    config: ThreadPoolConfig,
    items: Vec<Box<dyn ResourceControlWorkItem + 'a>>,
    states: Vec<WorkItemState>,
    left_resource: i64,
    peak_in_use: i64,
}

impl<'a> ResourceControlThreadPool<'a> {
    pub fn new(config: ThreadPoolConfig) -> Self {
        let left_resource = config.resource_limit;
        ResourceControlThreadPool {
            config,
            items: Vec::new(),
            states: Vec::new(),
            left_resource,
            peak_in_use: 0,
        }
    }

    /// Queue the items of the next run.
    ///
    /// An item that needs more than the whole resource limit could never run
    /// and is rejected here.
    pub fn init(&mut self, items: Vec<Box<dyn ResourceControlWorkItem + 'a>>) -> Result<()> {
        if self.config.thread_num == 0 {
            return Err(MergeError::invalid_config("thread pool needs at least one thread"));
        }
        for item in &items {
            let required = item.required_resource();
            if required < 0 || required > self.config.resource_limit {
                return Err(MergeError::out_of_range(format!(
                    "work item {} requires resource {required}, limit is {}",
                    item.name(),
                    self.config.resource_limit
                )));
            }
        }
        self.states = vec![WorkItemState::Pending; items.len()];
        self.items = items;
        self.left_resource = self.config.resource_limit;
        self.peak_in_use = 0;
        Ok(())
    }

    /// Run every queued item and wait for all of them.
    pub fn run(&mut self, name: &str) -> Result<()> {
        let items = std::mem::take(&mut self.items);
        if items.is_empty() {
            return Ok(());
        }
        let thread_num = self.config.thread_num.min(items.len()).max(1);
        let item_count = items.len();
        info!(
            "Thread pool {name} starts {item_count} work items on {thread_num} threads, resource limit {}",
            self.config.resource_limit
        );

        let pending = items
            .into_iter()
            .enumerate()
            .map(|(idx, item)| PendingItem {
                idx,
                resource: item.required_resource(),
                item,
            })
            .collect();
        let state = Mutex::new(PoolState {
            pending,
            states: std::mem::take(&mut self.states),
            left_resource: self.config.resource_limit,
            in_use: 0,
            peak_in_use: 0,
            first_error: None,
        });

        let sleep = self.config.starvation_sleep;
        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(thread_num);
            let mut spawn_error = None;
            for i in 0..thread_num {
                let state = &state;
                match thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn_scoped(scope, move || worker_loop(state, sleep))
                {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        spawn_error = Some(MergeError::from(e));
                        break;
                    }
                }
            }
            if spawn_error.is_some() {
                // Make running workers stop picking up items.
                let mut guard = state.lock();
                if guard.first_error.is_none() {
                    guard.first_error = spawn_error.take();
                }
            }
            for handle in handles {
                if handle.join().is_err() {
                    let mut guard = state.lock();
                    if guard.first_error.is_none() {
                        guard.first_error = Some(MergeError::internal("worker thread panicked"));
                    }
                }
            }
        });

        let final_state = state.into_inner();
        self.states = final_state.states;
        self.left_resource = final_state.left_resource;
        self.peak_in_use = final_state.peak_in_use;
        for left in final_state.pending {
            debug!("Work item {} was not started", left.item.name());
        }

        match final_state.first_error {
            Some(e) => {
                warn!("Thread pool {name} failed: {e}");
                Err(e)
            }
            None => {
                info!("Thread pool {name} finished {item_count} work items");
                Ok(())
            }
        }
    }

    /// State of each item of the last `init`, in queue order.
    pub fn states(&self) -> &[WorkItemState] {
        &self.states
    }

    /// Largest sum of resources held by running items during the last run.
    pub fn peak_resource_in_use(&self) -> i64 {
        self.peak_in_use
    }

    /// Resource left after the last run. Lower than the limit only when an
    /// item failed.
    pub fn left_resource(&self) -> i64 {
        self.left_resource
    }

    pub fn resource_limit(&self) -> i64 {
        self.config.resource_limit
    }
}

fn worker_loop(state: &Mutex<PoolState<'_>>, sleep: Duration) {
    let mut starving_since: Option<Instant> = None;
    loop {
        let next = {
            let mut guard = state.lock();
            if guard.should_stop() {
                return;
            }
            guard.take_next()
        };
        let Some(mut next) = next else {
            let since = *starving_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= STARVATION_WARN_INTERVAL {
                warn!(
                    "Worker {} starved for {:?} waiting for resource",
                    thread::current().name().unwrap_or("unnamed"),
                    since.elapsed()
                );
                starving_since = Some(Instant::now());
            }
            thread::sleep(sleep);
            continue;
        };
        starving_since = None;

        let name = next.item.name();
        debug!("Work item {name} starts with resource {}", next.resource);
        let result = match catch_unwind(AssertUnwindSafe(|| next.item.process())) {
            Ok(result) => result,
            Err(panic) => Err(MergeError::work_item(format!(
                "{name} panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };
        next.item.destroy();

        let mut guard = state.lock();
        match result {
            Ok(()) => {
                guard.left_resource += next.resource;
                guard.in_use -= next.resource;
                guard.states[next.idx] = WorkItemState::Done;
                debug!("Work item {name} done");
            }
            Err(e) => {
                guard.states[next.idx] = WorkItemState::Failed;
                warn!("Work item {name} failed: {e}");
                if guard.first_error.is_none() {
                    guard.first_error = Some(e);
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    struct CountingItem {
        resource: i64,
        running: Arc<AtomicI64>,
        max_seen: Arc<AtomicI64>,
        done: Arc<AtomicUsize>,
        fail: bool,
    }

    impl ResourceControlWorkItem for CountingItem {
        fn required_resource(&self) -> i64 {
            self.resource
        }

        fn process(&mut self) -> Result<()> {
            let now = self.running.fetch_add(self.resource, Ordering::SeqCst) + self.resource;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            self.running.fetch_sub(self.resource, Ordering::SeqCst);
            if self.fail {
                return Err(MergeError::other("boom"));
            }
            self.done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> String {
            format!("counting({})", self.resource)
        }
    }

    fn config(threads: usize, limit: i64) -> ThreadPoolConfig {
        let mut config = ThreadPoolConfig::new(threads, limit);
        config.starvation_sleep = Duration::from_millis(1);
        config
    }

    fn items(
        resources: &[i64],
        running: &Arc<AtomicI64>,
        max_seen: &Arc<AtomicI64>,
        done: &Arc<AtomicUsize>,
    ) -> Vec<Box<dyn ResourceControlWorkItem>> {
        resources
            .iter()
            .map(|r| {
                Box::new(CountingItem {
                    resource: *r,
                    running: running.clone(),
                    max_seen: max_seen.clone(),
                    done: done.clone(),
                    fail: false,
                }) as Box<dyn ResourceControlWorkItem>
            })
            .collect()
    }

    #[test]
    fn test_runs_all_items_within_limit() {
        let running = Arc::new(AtomicI64::new(0));
        let max_seen = Arc::new(AtomicI64::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        let mut pool = ResourceControlThreadPool::new(config(4, 10));
        pool.init(items(&[6, 5, 4, 3, 7, 1, 2], &running, &max_seen, &done))
            .unwrap();
        pool.run("test").unwrap();

        assert_eq!(done.load(Ordering::SeqCst), 7);
        assert!(max_seen.load(Ordering::SeqCst) <= 10);
        assert!(pool.peak_resource_in_use() <= 10);
        assert_eq!(pool.left_resource(), 10);
        assert!(pool.states().iter().all(|s| *s == WorkItemState::Done));
    }

    #[test]
    fn test_item_over_limit_rejected_at_init() {
        let running = Arc::new(AtomicI64::new(0));
        let max_seen = Arc::new(AtomicI64::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        let mut pool = ResourceControlThreadPool::new(config(2, 10));
        let err = pool
            .init(items(&[3, 11], &running, &max_seen, &done))
            .unwrap_err();
        assert!(matches!(err, MergeError::OutOfRange(_)));
    }

    #[test]
    fn test_failure_is_returned_after_join() {
        let running = Arc::new(AtomicI64::new(0));
        let max_seen = Arc::new(AtomicI64::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        let failing: Box<dyn ResourceControlWorkItem> = Box::new(CountingItem {
            resource: 4,
            running: running.clone(),
            max_seen: max_seen.clone(),
            done: done.clone(),
            fail: true,
        });
        let mut pool = ResourceControlThreadPool::new(config(1, 10));
        let mut queue = vec![failing];
        queue.extend(items(&[1, 1], &running, &max_seen, &done));
        pool.init(queue).unwrap();

        let err = pool.run("failing").unwrap_err();
        assert!(matches!(err, MergeError::Other(_)));
        // One thread: the failure stops the pool before the rest is started.
        assert_eq!(
            pool.states(),
            &[WorkItemState::Failed, WorkItemState::Pending, WorkItemState::Pending]
        );
        assert_eq!(pool.left_resource(), 6);
        assert_eq!(done.load(Ordering::SeqCst), 0);
    }

    struct PanickingItem;

    impl ResourceControlWorkItem for PanickingItem {
        fn required_resource(&self) -> i64 {
            1
        }

        fn process(&mut self) -> Result<()> {
            panic!("bad segment");
        }
    }

    #[test]
    fn test_panic_becomes_error() {
        let mut pool = ResourceControlThreadPool::new(config(2, 10));
        pool.init(vec![Box::new(PanickingItem) as Box<dyn ResourceControlWorkItem>])
            .unwrap();
        let err = pool.run("panicking").unwrap_err();
        match err {
            MergeError::WorkItem(msg) => assert!(msg.contains("bad segment")),
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(pool.states(), &[WorkItemState::Failed]);
    }

    #[test]
    fn test_empty_run() {
        let mut pool = ResourceControlThreadPool::new(config(2, 10));
        pool.init(Vec::new()).unwrap();
        assert!(pool.run("empty").is_ok());
    }
}
