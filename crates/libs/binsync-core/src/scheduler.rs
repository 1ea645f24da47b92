//! A single-worker, priority-ordered job queue.
//!
//! Every repository-mutating `Client` operation is submitted here and the
//! caller blocks on [`Scheduler::schedule_and_wait`] until the dedicated
//! worker thread finishes it. Serializing all mutation through one thread
//! is what makes it safe to drive the non-reentrant `git2` repository
//! adapter (see `crate::repo`) from multiple caller threads at once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Priority class for a scheduled job. Ordered `Fast > Average > Slow`
/// while the worker is idle; a running job is never preempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Fast,
    Average,
    Slow,
}

type BoxedTask = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Queues {
    fast: VecDeque<BoxedTask>,
    average: VecDeque<BoxedTask>,
    slow: VecDeque<BoxedTask>,
}

impl Queues {
    fn push(&mut self, priority: Priority, task: BoxedTask) {
        match priority {
            Priority::Fast => self.fast.push_back(task),
            Priority::Average => self.average.push_back(task),
            Priority::Slow => self.slow.push_back(task),
        }
    }

    fn pop(&mut self) -> Option<BoxedTask> {
        self.fast
            .pop_front()
            .or_else(|| self.average.pop_front())
            .or_else(|| self.slow.pop_front())
    }

    fn is_empty(&self) -> bool {
        self.fast.is_empty() && self.average.is_empty() && self.slow.is_empty()
    }
}

struct SchedulerState {
    queues: Mutex<Queues>,
    has_work: Condvar,
    shutdown: AtomicBool,
}

/// A single background-worker job scheduler.
///
/// `schedule_and_wait` is the only way to submit work; there is no
/// cancellation and no per-job timeout (network operations rely on the
/// transport's own timeout, per the repository adapter contract).
pub struct Scheduler {
    state: Arc<SchedulerState>,
    worker: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Constructs a scheduler without starting its worker thread.
    ///
    /// The attach algorithm performs repository setup on the calling
    /// thread first (§4.4.1 steps 1-6) and only starts the worker once
    /// that succeeds (step 7), so construction and startup are split.
    pub fn new() -> Self {
        Self {
            state: Arc::new(SchedulerState {
                queues: Mutex::new(Queues::default()),
                has_work: Condvar::new(),
                shutdown: AtomicBool::new(false),
            }),
            worker: None,
        }
    }

    /// Starts the dedicated worker thread. Idempotent: a second call is a
    /// no-op while a worker is already running.
    pub fn start_worker_thread(&mut self) {
        if self.worker.is_some() {
            return;
        }
        let state = Arc::clone(&self.state);
        self.worker = Some(
            std::thread::Builder::new()
                .name("binsync-scheduler".into())
                .spawn(move || worker_loop(state))
                .expect("failed to spawn binsync scheduler worker thread"),
        );
    }

    /// Enqueues `job` at `priority` and blocks the calling thread until the
    /// worker thread runs it, returning its result.
    ///
    /// Panics if the worker thread has already terminated without running
    /// this job (it should only terminate via `shutdown`, which no live
    /// `Client` ever calls before its own teardown).
    pub fn schedule_and_wait<T, F>(&self, priority: Priority, job: F) -> T
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<T>();
        let task: BoxedTask = Box::new(move || {
            let _ = tx.send(job());
        });

        {
            let mut queues = self
                .state
                .queues
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            queues.push(priority, task);
        }
        self.state.has_work.notify_one();

        rx.recv()
            .expect("binsync scheduler worker terminated before completing job")
    }

    /// Signals the worker to exit once its queue drains and joins it.
    pub fn shutdown(&mut self) {
        self.state.shutdown.store(true, Ordering::SeqCst);
        self.state.has_work.notify_all();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(state: Arc<SchedulerState>) {
    loop {
        let task = {
            let mut queues = state
                .queues
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            loop {
                if let Some(task) = queues.pop() {
                    break Some(task);
                }
                if state.shutdown.load(Ordering::SeqCst) {
                    break None;
                }
                queues = state
                    .has_work
                    .wait(queues)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        };

        match task {
            Some(task) => task(),
            None => {
                // Drain whatever queued up between the shutdown check and
                // the final wake so in-flight callers still get a result.
                let mut queues = state
                    .queues
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                while let Some(task) = queues.pop() {
                    drop(queues);
                    task();
                    queues = state
                        .queues
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn runs_jobs_and_returns_results() {
        let mut sched = Scheduler::new();
        sched.start_worker_thread();

        let result = sched.schedule_and_wait(Priority::Fast, || 2 + 2);
        assert_eq!(result, 4);

        sched.shutdown();
    }

    #[test]
    fn serializes_concurrent_callers() {
        let mut sched = Scheduler::new();
        sched.start_worker_thread();
        let sched = Arc::new(Mutex::new(sched));

        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let sched = Arc::clone(&sched);
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                let sched = sched.lock().unwrap_or_else(|p| p.into_inner());
                sched.schedule_and_wait(Priority::Average, {
                    let counter = Arc::clone(&counter);
                    move || {
                        // Non-atomic read-modify-write: only safe because the
                        // scheduler serializes every job onto one thread.
                        let current = counter.load(Ordering::SeqCst);
                        std::thread::sleep(Duration::from_micros(50));
                        counter.store(current + 1, Ordering::SeqCst);
                    }
                });
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn fast_priority_drains_before_queued_slow_jobs() {
        let mut sched = Scheduler::new();
        sched.start_worker_thread();
        let sched = Arc::new(sched);
        let order = Arc::new(Mutex::new(Vec::new()));

        // Occupy the worker so Slow/Fast jobs submitted next queue up
        // behind it rather than running immediately.
        let busy = {
            let sched = Arc::clone(&sched);
            std::thread::spawn(move || {
                sched.schedule_and_wait(Priority::Average, || {
                    std::thread::sleep(Duration::from_millis(80));
                });
            })
        };
        std::thread::sleep(Duration::from_millis(20));

        let slow = {
            let sched = Arc::clone(&sched);
            let order = Arc::clone(&order);
            std::thread::spawn(move || {
                sched.schedule_and_wait(Priority::Slow, move || {
                    order.lock().unwrap().push("slow");
                });
            })
        };
        std::thread::sleep(Duration::from_millis(10));
        let fast = {
            let sched = Arc::clone(&sched);
            let order = Arc::clone(&order);
            std::thread::spawn(move || {
                sched.schedule_and_wait(Priority::Fast, move || {
                    order.lock().unwrap().push("fast");
                });
            })
        };

        busy.join().unwrap();
        fast.join().unwrap();
        slow.join().unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["fast", "slow"]);
    }
}
