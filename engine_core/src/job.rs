use std::cmp::Ordering;
use std::fmt;

use crate::downcast::AsAny;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(u64);

impl JobId {
    pub const INVALID: JobId = JobId(0);

    pub(crate) fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "job#{}", self.0)
        } else {
            write!(f, "job#invalid")
        }
    }
}

/// Priority value meaning "no preference".
pub const NO_PRIORITY: i32 = -1;

/// Declares which shared resource categories a job reads and writes, one bit
/// per category, plus its scheduling priority (lower runs first, `-1` means
/// unordered).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct JobDependencies {
    pub read_mask: u64,
    pub write_mask: u64,
    pub priority: i32,
}

impl Default for JobDependencies {
    fn default() -> Self {
        Self {
            read_mask: 0,
            write_mask: 0,
            priority: NO_PRIORITY,
        }
    }
}

impl JobDependencies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reads(mut self, mask: u64) -> Self {
        self.read_mask |= mask;
        self
    }

    pub fn writes(mut self, mask: u64) -> Self {
        self.write_mask |= mask;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn has_priority(&self) -> bool {
        self.priority >= 0
    }

    /// Read/read overlap is allowed; any overlap involving a write is not.
    pub fn shares_dependencies(&self, other: &JobDependencies) -> bool {
        (self.write_mask & other.write_mask) != 0
            || (self.write_mask & other.read_mask) != 0
            || (self.read_mask & other.write_mask) != 0
    }

    pub fn is_lower_priority_than(&self, other: &JobDependencies) -> bool {
        if !self.has_priority() || !other.has_priority() {
            return false;
        }
        self.priority > other.priority
    }

    /// Sort key: explicit priorities ascending, unordered jobs last.
    pub(crate) fn priority_rank(&self) -> i64 {
        if self.has_priority() {
            i64::from(self.priority)
        } else {
            i64::from(i32::MAX) + 1
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Null,
    Posted,
    Running,
    Completed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Null => "null",
            JobStatus::Posted => "posted",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
        }
    }

    pub fn in_flight(self) -> bool {
        matches!(self, JobStatus::Posted | JobStatus::Running)
    }
}

/// One schedulable unit of work.
///
/// `execute` runs on whichever worker claims the job and must not touch
/// thread-affine resources. `complete` runs on the thread that calls
/// [`crate::jobs::JobSystem::complete_job`] and may return `false` to be
/// retried later.
pub trait Job: AsAny + Send {
    fn execute(&mut self);

    fn complete(&mut self) -> bool {
        true
    }

    fn dependencies(&self) -> JobDependencies {
        JobDependencies::default()
    }

    fn priority(&self) -> i32 {
        self.dependencies().priority
    }

    fn needs_complete(&self) -> bool {
        false
    }

    /// When false the system keeps the finished job for
    /// [`crate::jobs::JobSystem::take_job`].
    fn delete_after_completion(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "job"
    }
}

/// Orders jobs by priority rank, unordered jobs last.
pub fn job_priority_order(a: &dyn Job, b: &dyn Job) -> Ordering {
    a.dependencies()
        .priority_rank()
        .cmp(&b.dependencies().priority_rank())
}

type ExecuteFn = Box<dyn FnMut() + Send + 'static>;
type CompleteFn = Box<dyn FnMut() -> bool + Send + 'static>;

/// Closure-backed job.
pub struct FnJob {
    name: String,
    dependencies: JobDependencies,
    execute: ExecuteFn,
    complete: Option<CompleteFn>,
}

impl FnJob {
    pub fn new(name: impl Into<String>, execute: impl FnMut() + Send + 'static) -> Self {
        Self {
            name: name.into(),
            dependencies: JobDependencies::default(),
            execute: Box::new(execute),
            complete: None,
        }
    }

    pub fn with_dependencies(mut self, dependencies: JobDependencies) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.dependencies.priority = priority;
        self
    }

    pub fn on_complete(mut self, complete: impl FnMut() -> bool + Send + 'static) -> Self {
        self.complete = Some(Box::new(complete));
        self
    }

    pub fn boxed(self) -> Box<dyn Job> {
        Box::new(self)
    }
}

impl Job for FnJob {
    fn execute(&mut self) {
        (self.execute)();
    }

    fn complete(&mut self) -> bool {
        match self.complete.as_mut() {
            Some(complete) => complete(),
            None => true,
        }
    }

    fn dependencies(&self) -> JobDependencies {
        self.dependencies
    }

    fn needs_complete(&self) -> bool {
        self.complete.is_some()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_overlap_conflicts() {
        let a = JobDependencies::new().writes(0b01);
        let b = JobDependencies::new().writes(0b01);
        assert!(a.shares_dependencies(&b));
    }

    #[test]
    fn read_write_overlap_conflicts_both_ways() {
        let reader = JobDependencies::new().reads(0b10);
        let writer = JobDependencies::new().writes(0b10);
        assert!(reader.shares_dependencies(&writer));
        assert!(writer.shares_dependencies(&reader));
    }

    #[test]
    fn read_read_overlap_is_shared() {
        let a = JobDependencies::new().reads(0b11);
        let b = JobDependencies::new().reads(0b01).writes(0b100);
        assert!(!a.shares_dependencies(&b));
    }

    #[test]
    fn disjoint_masks_do_not_conflict() {
        let a = JobDependencies::new().reads(0b0001).writes(0b0010);
        let b = JobDependencies::new().reads(0b0100).writes(0b1000);
        assert!(!a.shares_dependencies(&b));
        assert!(!b.shares_dependencies(&a));
    }

    #[test]
    fn priority_comparison_ignores_unordered() {
        let urgent = JobDependencies::new().with_priority(0);
        let lazy = JobDependencies::new().with_priority(5);
        let unordered = JobDependencies::new();
        assert!(lazy.is_lower_priority_than(&urgent));
        assert!(!urgent.is_lower_priority_than(&lazy));
        assert!(!unordered.is_lower_priority_than(&urgent));
        assert!(!urgent.is_lower_priority_than(&unordered));
    }

    #[test]
    fn priority_order_puts_unordered_last() {
        let first = FnJob::new("first", || {}).with_priority(2);
        let unordered = FnJob::new("unordered", || {});
        let urgent = FnJob::new("urgent", || {}).with_priority(0);
        assert_eq!(job_priority_order(&urgent, &first), Ordering::Less);
        assert_eq!(job_priority_order(&unordered, &first), Ordering::Greater);
    }

    #[test]
    fn fn_job_needs_complete_only_with_callback() {
        let plain = FnJob::new("plain", || {});
        assert!(!plain.needs_complete());
        let mut calls = 0;
        let mut with_complete = FnJob::new("complete", || {}).on_complete(move || {
            calls += 1;
            calls > 1
        });
        assert!(with_complete.needs_complete());
        assert!(!with_complete.complete());
        assert!(with_complete.complete());
    }

    #[test]
    fn invalid_job_id_is_not_valid() {
        assert!(!JobId::INVALID.is_valid());
        assert!(JobId::from_raw(3).is_valid());
        assert!(JobId::from_raw(3) < JobId::from_raw(4));
    }
}
