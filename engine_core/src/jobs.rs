use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use serde::Deserialize;

use crate::job::{Job, JobId, JobStatus};
use crate::job_graph::JobGraph;
use crate::logging;
use crate::observability::{self, lock_unpoisoned};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobCategory {
    General,
    Loading,
}

impl fmt::Display for JobCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobCategory::General => "general",
            JobCategory::Loading => "loading",
        };
        write!(f, "{}", label)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobsMode {
    #[default]
    Threaded,
    Inline,
}

#[derive(Clone, Copy, Debug)]
pub struct JobsConfig {
    pub mode: JobsMode,
    pub general_workers: usize,
    pub loading_workers: usize,
}

impl JobsConfig {
    pub fn threaded(general_workers: usize, loading_workers: usize) -> Self {
        Self {
            mode: JobsMode::Threaded,
            general_workers: general_workers.max(1),
            loading_workers: loading_workers.max(1),
        }
    }

    pub fn inline() -> Self {
        Self {
            mode: JobsMode::Inline,
            general_workers: 0,
            loading_workers: 0,
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        let cores = thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(2);
        Self::threaded(cores.saturating_sub(1), 2)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("failed to spawn {category} worker: {source}")]
    SpawnFailed {
        category: JobCategory,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobsTelemetry {
    pub general_queue_depth: usize,
    pub loading_queue_depth: usize,
    pub general_workers_active: usize,
    pub loading_workers_active: usize,
    pub awaiting_complete: usize,
    pub executed: u64,
    pub cancelled: u64,
    pub panicked: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RecordState {
    Queued,
    Running,
    AwaitingComplete,
    Completing,
    Completed,
}

struct JobRecord {
    category: JobCategory,
    state: RecordState,
    job: Option<Box<dyn Job>>,
    needs_complete: bool,
    retain: bool,
}

struct QueuedJob {
    rank: i64,
    id: JobId,
}

// BinaryHeap pops the greatest entry: lowest rank first, then oldest id.
impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .rank
            .cmp(&self.rank)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for QueuedJob {}

#[derive(Default)]
struct CategoryState {
    queue: BinaryHeap<QueuedJob>,
    queued: usize,
    active: usize,
}

/// How many cancelled ids `job_status` keeps reporting as `Null`.
pub const CANCELLED_HISTORY: usize = 1024;

#[derive(Default)]
struct SchedulerState {
    general: CategoryState,
    loading: CategoryState,
    records: HashMap<JobId, JobRecord>,
    // Jobs that are queued or running.
    pending: usize,
    executed: u64,
    cancelled: u64,
    panicked: u64,
    shutdown: bool,
    // Recently cancelled or discarded ids, oldest first.
    cancelled_ids: HashSet<JobId>,
    cancelled_order: VecDeque<JobId>,
}

impl SchedulerState {
    fn remember_cancelled(&mut self, id: JobId) {
        self.cancelled += 1;
        if self.cancelled_ids.insert(id) {
            self.cancelled_order.push_back(id);
        }
        while self.cancelled_order.len() > CANCELLED_HISTORY {
            if let Some(oldest) = self.cancelled_order.pop_front() {
                self.cancelled_ids.remove(&oldest);
            }
        }
    }

    fn category_mut(&mut self, category: JobCategory) -> &mut CategoryState {
        match category {
            JobCategory::General => &mut self.general,
            JobCategory::Loading => &mut self.loading,
        }
    }

    // Moves a queued record to Running and hands its job to the caller. Heap
    // entries are dropped lazily, so a stale id simply yields None.
    fn claim(&mut self, id: JobId) -> Option<(JobCategory, Box<dyn Job>)> {
        let record = self.records.get_mut(&id)?;
        if record.state != RecordState::Queued {
            return None;
        }
        let job = record.job.take()?;
        record.state = RecordState::Running;
        let category = record.category;
        let slot = self.category_mut(category);
        slot.queued = slot.queued.saturating_sub(1);
        slot.active += 1;
        Some((category, job))
    }

    fn is_unfinished(&self, id: &JobId) -> bool {
        self.records.get(id).is_some_and(|record| {
            matches!(
                record.state,
                RecordState::Queued | RecordState::Running | RecordState::Completing
            )
        })
    }
}

struct JobSystemInner {
    mode: JobsMode,
    state: Mutex<SchedulerState>,
    general_wake: Condvar,
    loading_wake: Condvar,
    progress: Condvar,
    next_id: AtomicU64,
}

impl JobSystemInner {
    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        lock_unpoisoned(&self.state)
    }

    fn wait_progress<'a>(
        &self,
        guard: MutexGuard<'a, SchedulerState>,
    ) -> MutexGuard<'a, SchedulerState> {
        self.progress
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self, category: JobCategory) -> &Condvar {
        match category {
            JobCategory::General => &self.general_wake,
            JobCategory::Loading => &self.loading_wake,
        }
    }

    fn run(&self, id: JobId, category: JobCategory, mut job: Box<dyn Job>) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| job.execute()));
        let mut panic_message = None;
        let dropped = {
            let mut state = self.lock_state();
            let slot = state.category_mut(category);
            slot.active = slot.active.saturating_sub(1);
            state.pending = state.pending.saturating_sub(1);
            let panicked = match result {
                Ok(()) => {
                    state.executed += 1;
                    false
                }
                Err(payload) => {
                    state.panicked += 1;
                    panic_message = Some(format!(
                        "{} '{}' panicked in execute ({})",
                        id,
                        job.name(),
                        observability::panic_payload_to_string(payload.as_ref())
                    ));
                    true
                }
            };
            finish_execute(&mut state, id, job, panicked)
        };
        self.progress.notify_all();
        if let Some(message) = panic_message {
            observability::set_sticky_error(message);
        }
        drop(dropped);
    }
}

// Returns the job when nobody keeps it, so it is dropped outside the lock.
fn finish_execute(
    state: &mut SchedulerState,
    id: JobId,
    job: Box<dyn Job>,
    panicked: bool,
) -> Option<Box<dyn Job>> {
    let Some(record) = state.records.get_mut(&id) else {
        return Some(job);
    };
    if record.needs_complete && !panicked {
        record.state = RecordState::AwaitingComplete;
        record.job = Some(job);
        return None;
    }
    if record.retain {
        record.state = RecordState::Completed;
        record.job = Some(job);
        return None;
    }
    state.records.remove(&id);
    Some(job)
}

pub struct JobSystem {
    inner: Arc<JobSystemInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobSystem {
    pub fn new(config: JobsConfig) -> Result<Self, JobError> {
        let inner = Arc::new(JobSystemInner {
            mode: config.mode,
            state: Mutex::new(SchedulerState::default()),
            general_wake: Condvar::new(),
            loading_wake: Condvar::new(),
            progress: Condvar::new(),
            next_id: AtomicU64::new(1),
        });
        let system = Self {
            inner,
            workers: Mutex::new(Vec::new()),
        };
        if config.mode == JobsMode::Threaded {
            system.spawn_workers(JobCategory::General, config.general_workers.max(1))?;
            system.spawn_workers(JobCategory::Loading, config.loading_workers.max(1))?;
        }
        logging::debug(format!(
            "job system started ({:?}, {} general / {} loading workers)",
            config.mode, config.general_workers, config.loading_workers
        ));
        Ok(system)
    }

    pub fn mode(&self) -> JobsMode {
        self.inner.mode
    }

    pub fn post_job(&self, job: Box<dyn Job>) -> JobId {
        self.post(JobCategory::General, job)
    }

    pub fn post_loading_job(&self, job: Box<dyn Job>) -> JobId {
        self.post(JobCategory::Loading, job)
    }

    fn post(&self, category: JobCategory, job: Box<dyn Job>) -> JobId {
        let id = JobId::from_raw(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let rank = job.dependencies().priority_rank();
        {
            let mut state = self.inner.lock_state();
            if state.shutdown {
                drop(state);
                logging::warn(format!(
                    "{} job '{}' posted after shutdown; dropped",
                    category,
                    job.name()
                ));
                return JobId::INVALID;
            }
            let record = JobRecord {
                category,
                state: RecordState::Queued,
                needs_complete: job.needs_complete(),
                retain: !job.delete_after_completion(),
                job: Some(job),
            };
            state.records.insert(id, record);
            state.pending += 1;
            let slot = state.category_mut(category);
            slot.queued += 1;
            if self.inner.mode == JobsMode::Threaded {
                slot.queue.push(QueuedJob { rank, id });
            }
        }
        match self.inner.mode {
            JobsMode::Threaded => self.inner.wake(category).notify_one(),
            JobsMode::Inline => self.run_inline(id),
        }
        id
    }

    fn run_inline(&self, id: JobId) {
        let claimed = self.inner.lock_state().claim(id);
        if let Some((category, job)) = claimed {
            self.inner.run(id, category, job);
        }
    }

    /// Drives a job towards completion from the calling thread.
    ///
    /// Returns true once the job is fully done. A job still waiting in a
    /// queue is executed right here when `blocking` is set.
    pub fn complete_job(&self, id: JobId, blocking: bool) -> bool {
        if !id.is_valid() {
            return true;
        }
        let mut state = self.inner.lock_state();
        let mut job = loop {
            let Some(record) = state.records.get_mut(&id) else {
                return true;
            };
            let current = record.state;
            match current {
                RecordState::Completed => return true,
                RecordState::AwaitingComplete => {
                    let Some(job) = record.job.take() else {
                        return true;
                    };
                    record.state = RecordState::Completing;
                    break job;
                }
                RecordState::Queued => {
                    if !blocking {
                        return false;
                    }
                    if let Some((category, job)) = state.claim(id) {
                        drop(state);
                        self.inner.run(id, category, job);
                        state = self.inner.lock_state();
                    }
                }
                RecordState::Running | RecordState::Completing => {
                    if !blocking {
                        return false;
                    }
                    state = self.inner.wait_progress(state);
                }
            }
        };
        drop(state);

        let result = panic::catch_unwind(AssertUnwindSafe(|| job.complete()));
        let done = match result {
            Ok(done) => done,
            Err(payload) => {
                observability::set_sticky_error(format!(
                    "{} '{}' panicked in complete ({})",
                    id,
                    job.name(),
                    observability::panic_payload_to_string(payload.as_ref())
                ));
                true
            }
        };

        let dropped = {
            let mut state = self.inner.lock_state();
            match state.records.get_mut(&id) {
                Some(record) if !done => {
                    record.state = RecordState::AwaitingComplete;
                    record.job = Some(job);
                    None
                }
                Some(record) if record.retain => {
                    record.state = RecordState::Completed;
                    record.job = Some(job);
                    None
                }
                Some(_) => {
                    state.records.remove(&id);
                    Some(job)
                }
                None => Some(job),
            }
        };
        self.inner.progress.notify_all();
        drop(dropped);
        done
    }

    /// Removes a loading job that no worker has claimed yet.
    pub fn try_cancel_loading_job(&self, id: JobId) -> bool {
        let cancelled = {
            let mut state = self.inner.lock_state();
            let cancellable = state.records.get(&id).is_some_and(|record| {
                record.category == JobCategory::Loading && record.state == RecordState::Queued
            });
            if !cancellable {
                return false;
            }
            let record = state.records.remove(&id);
            state.loading.queued = state.loading.queued.saturating_sub(1);
            state.pending = state.pending.saturating_sub(1);
            state.remember_cancelled(id);
            record
        };
        self.inner.progress.notify_all();
        drop(cancelled);
        true
    }

    /// Blocks until nothing is queued or running, then gives every job that
    /// is waiting on its completion phase one `complete()` call.
    pub fn wait_for_all_jobs(&self) {
        let awaiting = {
            let mut state = self.inner.lock_state();
            while state.pending > 0 {
                state = self.inner.wait_progress(state);
            }
            let mut awaiting: Vec<JobId> = state
                .records
                .iter()
                .filter(|(_, record)| record.state == RecordState::AwaitingComplete)
                .map(|(id, _)| *id)
                .collect();
            awaiting.sort();
            awaiting
        };
        for id in awaiting {
            self.complete_job(id, false);
        }
    }

    /// Ids that ran to the end and were retired report `Completed`. Cancelled
    /// or shutdown-discarded jobs report `Null` while they are among the last
    /// `CANCELLED_HISTORY` such ids; older ones fall back to `Completed`.
    pub fn job_status(&self, id: JobId) -> JobStatus {
        if !id.is_valid() {
            return JobStatus::Null;
        }
        let state = self.inner.lock_state();
        if state.cancelled_ids.contains(&id) {
            return JobStatus::Null;
        }
        match state.records.get(&id).map(|record| record.state) {
            Some(RecordState::Queued) => JobStatus::Posted,
            Some(RecordState::Running)
            | Some(RecordState::AwaitingComplete)
            | Some(RecordState::Completing) => JobStatus::Running,
            Some(RecordState::Completed) => JobStatus::Completed,
            None if id.raw() < self.inner.next_id.load(Ordering::Relaxed) => JobStatus::Completed,
            None => JobStatus::Null,
        }
    }

    /// Hands a finished job back to its owner when it opted out of
    /// `delete_after_completion`.
    pub fn take_job(&self, id: JobId) -> Option<Box<dyn Job>> {
        let mut state = self.inner.lock_state();
        let ready = state
            .records
            .get(&id)
            .is_some_and(|record| record.state == RecordState::Completed && record.retain);
        if !ready {
            return None;
        }
        state.records.remove(&id).and_then(|record| record.job)
    }

    /// Runs a job graph. Blocking calls return once every job is Completed;
    /// non-blocking calls perform one scheduling step.
    pub fn execute_job_graph(&self, graph: &mut JobGraph, blocking: bool) {
        if !graph.is_initialized() {
            graph.initialize();
        }
        loop {
            let progressed = self.step_job_graph(graph);
            if graph.is_complete() || !blocking {
                return;
            }
            let in_flight = graph.in_flight_receipts();
            self.wait_for_any(&in_flight);
            if !progressed {
                thread::yield_now();
            }
        }
    }

    fn step_job_graph(&self, graph: &mut JobGraph) -> bool {
        let mut progressed = false;
        for index in 0..graph.len() {
            let status = graph.status(index);
            if !status.in_flight() {
                continue;
            }
            let receipt = graph.receipt(index);
            if self.complete_job(receipt, false) {
                graph.set_status(index, JobStatus::Completed);
                progressed = true;
            } else if status == JobStatus::Posted && self.job_status(receipt) == JobStatus::Running
            {
                graph.set_status(index, JobStatus::Running);
            }
        }
        for (index, job) in graph.take_ready_jobs() {
            let receipt = self.post_job(job);
            if receipt.is_valid() {
                graph.record_posted(index, receipt);
            } else {
                graph.set_status(index, JobStatus::Completed);
            }
            progressed = true;
        }
        progressed
    }

    fn wait_for_any(&self, ids: &[JobId]) {
        if ids.is_empty() {
            return;
        }
        let mut state = self.inner.lock_state();
        while ids.iter().all(|id| state.is_unfinished(id)) {
            state = self.inner.wait_progress(state);
        }
    }

    pub fn telemetry(&self) -> JobsTelemetry {
        let state = self.inner.lock_state();
        JobsTelemetry {
            general_queue_depth: state.general.queued,
            loading_queue_depth: state.loading.queued,
            general_workers_active: state.general.active,
            loading_workers_active: state.loading.active,
            awaiting_complete: state
                .records
                .values()
                .filter(|record| record.state == RecordState::AwaitingComplete)
                .count(),
            executed: state.executed,
            cancelled: state.cancelled,
            panicked: state.panicked,
        }
    }

    /// Stops the workers. Jobs nobody has claimed are discarded.
    pub fn shutdown(&self) {
        let discarded = {
            let mut state = self.inner.lock_state();
            if state.shutdown {
                Vec::new()
            } else {
                state.shutdown = true;
                state.general.queue.clear();
                state.loading.queue.clear();
                state.general.queued = 0;
                state.loading.queued = 0;
                let queued: Vec<JobId> = state
                    .records
                    .iter()
                    .filter(|(_, record)| record.state == RecordState::Queued)
                    .map(|(id, _)| *id)
                    .collect();
                let mut discarded = Vec::with_capacity(queued.len());
                for id in queued {
                    if let Some(record) = state.records.remove(&id) {
                        discarded.push(record);
                        state.remember_cancelled(id);
                    }
                }
                state.pending = state.pending.saturating_sub(discarded.len());
                discarded
            }
        };
        self.inner.general_wake.notify_all();
        self.inner.loading_wake.notify_all();
        self.inner.progress.notify_all();
        if !discarded.is_empty() {
            logging::debug(format!(
                "job system shutdown discarded {} queued jobs",
                discarded.len()
            ));
        }

        let current = thread::current().id();
        let mut workers = lock_unpoisoned(&self.workers);
        for handle in workers.drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }

    fn spawn_workers(&self, category: JobCategory, count: usize) -> Result<(), JobError> {
        let mut handles = lock_unpoisoned(&self.workers);
        for index in 0..count {
            let inner = Arc::clone(&self.inner);
            let name = format!("jobs-{}-{}", category, index);
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(&inner, category))
                .map_err(|source| JobError::SpawnFailed { category, source })?;
            handles.push(handle);
        }
        Ok(())
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: &JobSystemInner, category: JobCategory) {
    loop {
        let (id, job) = {
            let mut state = inner.lock_state();
            loop {
                if state.shutdown {
                    return;
                }
                if let Some(entry) = state.category_mut(category).queue.pop() {
                    if let Some((_, job)) = state.claim(entry.id) {
                        break (entry.id, job);
                    }
                    continue;
                }
                state = inner
                    .wake(category)
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        inner.run(id, category, job);
    }
}
