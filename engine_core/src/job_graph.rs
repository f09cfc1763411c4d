use crate::job::{Job, JobDependencies, JobId, JobStatus};

/// A one-shot batch of jobs whose ordering is inferred from their declared
/// read/write masks: conflicting jobs never run at the same time, everything
/// else may run in parallel.
#[derive(Default)]
pub struct JobGraph {
    jobs: Vec<Option<Box<dyn Job>>>,
    receipts: Vec<JobId>,
    statuses: Vec<JobStatus>,
    dependencies: Vec<JobDependencies>,
    initialized: bool,
}

impl JobGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a job, keeping the list sorted by priority. Equal priorities keep
    /// insertion order.
    pub fn add_job(&mut self, job: Box<dyn Job>) {
        if self.initialized {
            crate::logging::warn(format!(
                "job '{}' added to a graph that was already initialized; ignored",
                job.name()
            ));
            return;
        }
        self.jobs.push(Some(job));
        self.jobs.sort_by_key(|job| {
            job.as_ref()
                .map(|job| job.dependencies().priority_rank())
                .unwrap_or(i64::MAX)
        });
    }

    pub fn initialize(&mut self) {
        let count = self.jobs.len();
        self.receipts = vec![JobId::INVALID; count];
        self.statuses = vec![JobStatus::Null; count];
        self.dependencies = self
            .jobs
            .iter()
            .map(|job| {
                job.as_ref()
                    .map(|job| job.dependencies())
                    .unwrap_or_default()
            })
            .collect();
        self.initialized = true;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.statuses.len() == self.jobs.len()
            && self
                .statuses
                .iter()
                .all(|status| *status == JobStatus::Completed)
    }

    pub fn status(&self, index: usize) -> JobStatus {
        self.statuses.get(index).copied().unwrap_or(JobStatus::Null)
    }

    pub fn receipt(&self, index: usize) -> JobId {
        self.receipts.get(index).copied().unwrap_or(JobId::INVALID)
    }

    pub fn dependencies(&self, index: usize) -> Option<JobDependencies> {
        self.dependencies.get(index).copied()
    }

    pub(crate) fn set_status(&mut self, index: usize, status: JobStatus) {
        if let Some(slot) = self.statuses.get_mut(index) {
            *slot = status;
        }
    }

    pub(crate) fn record_posted(&mut self, index: usize, receipt: JobId) {
        if let Some(slot) = self.receipts.get_mut(index) {
            *slot = receipt;
        }
    }

    pub(crate) fn in_flight_receipts(&self) -> Vec<JobId> {
        self.statuses
            .iter()
            .zip(&self.receipts)
            .filter(|(status, _)| status.in_flight())
            .map(|(_, receipt)| *receipt)
            .collect()
    }

    /// Picks every Null job that conflicts neither with a job already in
    /// flight nor with one picked earlier in this pass, marks it Posted and
    /// hands it over for posting.
    pub(crate) fn take_ready_jobs(&mut self) -> Vec<(usize, Box<dyn Job>)> {
        let mut blocking: Vec<JobDependencies> = self
            .statuses
            .iter()
            .zip(&self.dependencies)
            .filter(|(status, _)| status.in_flight())
            .map(|(_, dependencies)| *dependencies)
            .collect();

        let mut ready = Vec::new();
        for index in 0..self.jobs.len() {
            if self.statuses[index] != JobStatus::Null {
                continue;
            }
            let candidate = self.dependencies[index];
            if blocking
                .iter()
                .any(|other| other.shares_dependencies(&candidate))
            {
                continue;
            }
            let Some(job) = self.jobs[index].take() else {
                self.statuses[index] = JobStatus::Completed;
                continue;
            };
            self.statuses[index] = JobStatus::Posted;
            blocking.push(candidate);
            ready.push((index, job));
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::FnJob;
    use crate::jobs::{JobSystem, JobsConfig};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc, Mutex};
    use std::time::Duration;

    fn named(name: &str, dependencies: JobDependencies) -> Box<dyn Job> {
        FnJob::new(name, || {})
            .with_dependencies(dependencies)
            .boxed()
    }

    #[test]
    fn add_job_sorts_by_priority() {
        let mut graph = JobGraph::new();
        graph.add_job(named("late", JobDependencies::new().with_priority(5)));
        graph.add_job(named("unordered", JobDependencies::new()));
        graph.add_job(named("early", JobDependencies::new().with_priority(0)));
        graph.add_job(named("late-2", JobDependencies::new().with_priority(5)));
        graph.initialize();
        let priorities: Vec<i32> = (0..graph.len())
            .map(|index| graph.dependencies(index).unwrap().priority)
            .collect();
        assert_eq!(priorities, vec![0, 5, 5, -1]);
    }

    #[test]
    fn initialize_starts_all_null() {
        let mut graph = JobGraph::new();
        graph.add_job(named("a", JobDependencies::new()));
        graph.add_job(named("b", JobDependencies::new()));
        graph.initialize();
        assert_eq!(graph.status(0), JobStatus::Null);
        assert_eq!(graph.status(1), JobStatus::Null);
        assert_eq!(graph.receipt(0), JobId::INVALID);
        assert!(!graph.is_complete());
    }

    #[test]
    fn conflicting_jobs_are_not_released_together() {
        let mut graph = JobGraph::new();
        graph.add_job(named("writer", JobDependencies::new().writes(0b1)));
        graph.add_job(named("reader", JobDependencies::new().reads(0b1)));
        graph.add_job(named("other", JobDependencies::new().writes(0b10)));
        graph.initialize();

        let first: Vec<usize> = graph
            .take_ready_jobs()
            .into_iter()
            .map(|(index, _)| index)
            .collect();
        assert_eq!(first, vec![0, 2]);
        assert!(graph.take_ready_jobs().is_empty());

        graph.set_status(0, JobStatus::Completed);
        let second: Vec<usize> = graph
            .take_ready_jobs()
            .into_iter()
            .map(|(index, _)| index)
            .collect();
        assert_eq!(second, vec![1]);
    }

    #[test]
    fn readers_are_released_together() {
        let mut graph = JobGraph::new();
        for _ in 0..3 {
            graph.add_job(named("reader", JobDependencies::new().reads(0b1)));
        }
        graph.initialize();
        assert_eq!(graph.take_ready_jobs().len(), 3);
    }

    #[test]
    fn is_complete_flips_after_last_job() {
        let jobs = JobSystem::new(JobsConfig::inline()).unwrap();
        let mut graph = JobGraph::new();
        graph.add_job(named("a", JobDependencies::new().writes(1)));
        graph.add_job(named("b", JobDependencies::new().writes(1)));
        graph.initialize();

        jobs.execute_job_graph(&mut graph, false);
        assert!(!graph.is_complete());
        jobs.execute_job_graph(&mut graph, false);
        assert!(!graph.is_complete());
        jobs.execute_job_graph(&mut graph, false);
        assert!(graph.is_complete());
    }

    #[test]
    fn overlapping_writers_never_overlap_in_flight() {
        let jobs = JobSystem::new(JobsConfig::threaded(4, 1)).unwrap();
        let counter = Arc::new(AtomicU64::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let mut graph = JobGraph::new();
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            let active = Arc::clone(&active);
            let max_active = Arc::clone(&max_active);
            let job = FnJob::new("increment", move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                for _ in 0..100 {
                    // Unsynchronized read-modify-write: only safe when serialized.
                    let value = counter.load(Ordering::Relaxed);
                    std::thread::yield_now();
                    counter.store(value + 1, Ordering::Relaxed);
                }
                active.fetch_sub(1, Ordering::SeqCst);
            })
            .with_dependencies(JobDependencies::new().writes(0b1));
            graph.add_job(job.boxed());
        }
        jobs.execute_job_graph(&mut graph, true);
        assert!(graph.is_complete());
        assert_eq!(counter.load(Ordering::Relaxed), 1600);
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disjoint_writers_run_concurrently() {
        let jobs = JobSystem::new(JobsConfig::threaded(2, 1)).unwrap();
        let (a_tx, a_rx) = mpsc::channel::<()>();
        let (b_tx, b_rx) = mpsc::channel::<()>();
        let met = Arc::new(Mutex::new(Vec::new()));

        let met_a = Arc::clone(&met);
        let job_a = FnJob::new("a", move || {
            let _ = a_tx.send(());
            let ok = b_rx.recv_timeout(Duration::from_secs(2)).is_ok();
            met_a.lock().unwrap().push(ok);
        })
        .with_dependencies(JobDependencies::new().writes(0b01));
        let met_b = Arc::clone(&met);
        let job_b = FnJob::new("b", move || {
            let _ = b_tx.send(());
            let ok = a_rx.recv_timeout(Duration::from_secs(2)).is_ok();
            met_b.lock().unwrap().push(ok);
        })
        .with_dependencies(JobDependencies::new().writes(0b10));

        let mut graph = JobGraph::new();
        graph.add_job(job_a.boxed());
        graph.add_job(job_b.boxed());
        jobs.execute_job_graph(&mut graph, true);

        assert!(graph.is_complete());
        assert_eq!(*met.lock().unwrap(), vec![true, true]);
    }

    #[test]
    fn graph_runs_complete_phase_on_driver() {
        let jobs = JobSystem::new(JobsConfig::threaded(2, 1)).unwrap();
        let driver = std::thread::current().id();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut graph = JobGraph::new();
        for priority in 0..3 {
            let seen = Arc::clone(&seen);
            let job = FnJob::new("complete", || {})
                .with_priority(priority)
                .on_complete(move || {
                    seen.lock().unwrap().push(std::thread::current().id());
                    true
                });
            graph.add_job(job.boxed());
        }
        jobs.execute_job_graph(&mut graph, true);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|id| *id == driver));
    }
}
