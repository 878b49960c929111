/// Per-thread scheduling-state sampling for a single process.
///
/// A sample is taken from `/proc/<pid>/task/*/stat`. Threads that exit
/// while we scan are skipped; a process that has exited yields `None`.
use std::collections::HashMap;
use std::time::Instant;

/// Coarse scheduling state of one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// On a CPU or ready to run.
    Running,
    /// Sleeping or in uninterruptible (disk) wait.
    Blocked,
    /// Stopped, traced, zombie, or anything else we don't classify.
    Unknown,
}

impl ThreadState {
    /// Map a kernel state letter (third field of `stat`) to a coarse state.
    pub fn from_proc_char(state: char) -> ThreadState {
        match state {
            'R' => ThreadState::Running,
            'S' | 'D' => ThreadState::Blocked,
            _ => ThreadState::Unknown,
        }
    }
}

/// One observation of the thread states of a process.
#[derive(Debug, Clone)]
pub struct Sample {
    pub taken_at: Instant,
    pub threads: HashMap<i32, ThreadState>,
}

impl Sample {
    pub fn new(threads: HashMap<i32, ThreadState>) -> Sample {
        Sample {
            taken_at: Instant::now(),
            threads,
        }
    }

    /// True iff at least one thread was read and every thread is blocked.
    pub fn is_deadlock_candidate(&self) -> bool {
        !self.threads.is_empty()
            && self
                .threads
                .values()
                .all(|s| *s == ThreadState::Blocked)
    }

    /// A sample with no readable threads carries no signal either way.
    pub fn is_inconclusive(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn count(&self, state: ThreadState) -> usize {
        self.threads.values().filter(|s| **s == state).count()
    }
}

/// Process-wide resource usage read alongside a sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    pub num_threads: u64,
    pub rss_mb: Option<f64>,
    /// Accumulated user + system CPU seconds.
    pub cpu_secs: f64,
}

/// Read the current thread states of `pid`. `None` means the process is gone.
#[cfg(target_os = "linux")]
pub fn sample(pid: i32) -> Option<Sample> {
    let process = procfs::process::Process::new(pid).ok()?;
    let tasks = match process.tasks() {
        Ok(t) => t,
        Err(e) => {
            tracing::debug!(pid, error = %e, "task list unavailable, process likely exited");
            return None;
        }
    };

    let mut threads = HashMap::new();
    for task in tasks {
        // Thread exited between listing and reading.
        let Ok(task) = task else { continue };
        let Ok(stat) = task.stat() else { continue };
        threads.insert(task.tid, ThreadState::from_proc_char(stat.state));
    }
    Some(Sample::new(threads))
}

#[cfg(not(target_os = "linux"))]
pub fn sample(_pid: i32) -> Option<Sample> {
    None
}

/// Read thread count, resident memory and CPU time of `pid`.
#[cfg(target_os = "linux")]
pub fn resource_usage(pid: i32) -> Option<ResourceUsage> {
    let process = procfs::process::Process::new(pid).ok()?;
    let stat = process.stat().ok()?;
    let ticks = procfs::ticks_per_second() as f64;
    let rss_mb = process
        .status()
        .ok()
        .and_then(|s| s.vmrss)
        .map(|kb| kb as f64 / 1024.0);
    Some(ResourceUsage {
        num_threads: stat.num_threads.max(0) as u64,
        rss_mb,
        cpu_secs: (stat.utime + stat.stime) as f64 / ticks,
    })
}

#[cfg(not(target_os = "linux"))]
pub fn resource_usage(_pid: i32) -> Option<ResourceUsage> {
    None
}
