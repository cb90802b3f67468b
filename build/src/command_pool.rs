use crossbeam::{
    deque::{Injector, Steal},
    scope,
    utils::Backoff,
};
use scopeguard::{defer, defer_on_unwind};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc::{sync_channel, Receiver},
    },
    thread,
    time::Duration,
};

pub trait CommandPoolTask: Send {
    type Result: Send;
    fn run(&self) -> Self::Result;
}

enum QueueTask<T: CommandPoolTask> {
    Stop,
    Task(T),
}

impl<T> std::fmt::Debug for QueueTask<T>
where
    T: CommandPoolTask,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            QueueTask::Stop => write!(f, "QueueTask::Stop"),
            QueueTask::Task(_) => write!(f, "QueueTask::Task"),
        }
    }
}

/// A fixed set of worker threads running tasks handed out by a single main thread.
pub struct CommandPool<T: CommandPoolTask> {
    capacity: usize,
    job_queue: Injector<QueueTask<T>>,
    running_jobs: AtomicUsize,
    poisoned: AtomicBool,
}

pub struct Scope<'a, T: CommandPoolTask> {
    command_pool: &'a CommandPool<T>,
    pub rx: Receiver<T::Result>,
}

// Prevents users from enqueueing tasks outside run().
impl<'a, T> Scope<'a, T>
where
    T: CommandPoolTask,
{
    pub fn enqueue(&self, job: T) {
        self.command_pool.enqueue(job);
    }

    /// True once a worker panicked. Its task will never report a result.
    pub fn is_poisoned(&self) -> bool {
        self.command_pool.poisoned.load(Ordering::SeqCst)
    }
}

impl<T> CommandPool<T>
where
    T: CommandPoolTask,
{
    pub fn new() -> Self {
        Self::with_capacity(num_cpus::get())
    }

    pub fn with_capacity(capacity: usize) -> Self {
        CommandPool {
            capacity: capacity.max(1),
            job_queue: Injector::new(),
            running_jobs: AtomicUsize::new(0),
            poisoned: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn run<F, R>(&self, main_thread: F) -> Result<R, Box<dyn core::any::Any + 'static + Send>>
    where
        F: FnOnce(Scope<T>) -> R,
    {
        defer! {self.assert_no_running_jobs();}
        let (tx, rx) = sync_channel(self.capacity);

        scope(|s| {
            for _ in 0..self.capacity {
                let tx = tx.clone();
                // handles will be collected by the scope.
                s.spawn(move |_| {
                    defer_on_unwind! {
                        self.poisoned.store(true, Ordering::SeqCst);
                        for _ in 0..self.capacity {
                            self.job_queue.push(QueueTask::Stop);
                        }
                    }

                    let backoff = Backoff::new();
                    loop {
                        match self.job_queue.steal() {
                            Steal::Success(QueueTask::Stop) => break,
                            Steal::Success(QueueTask::Task(task)) => {
                                backoff.reset();
                                self.running_jobs.fetch_add(1, Ordering::SeqCst);
                                let result = {
                                    defer! {self.running_jobs.fetch_sub(1, Ordering::SeqCst);}
                                    task.run()
                                };
                                // Fails once the main thread returned. Keep draining the
                                // queue until the Stops arrive.
                                let _ = tx.send(result);
                            }
                            Steal::Retry => {}
                            Steal::Empty => {
                                if backoff.is_completed() {
                                    thread::sleep(Duration::from_millis(1));
                                } else {
                                    backoff.snooze();
                                }
                            }
                        }
                    }
                });
            }

            // Drop tx so when threads exit, rx will close.
            drop(tx);

            {
                // shut down the threads even if the main thread panics.
                defer!(for _ in 0..self.capacity {
                    self.job_queue.push(QueueTask::Stop);
                });
                main_thread(Scope {
                    command_pool: &self,
                    rx,
                })
            }
        })
    }

    fn enqueue(&self, job: T) {
        self.job_queue.push(QueueTask::Task(job));
    }

    #[cfg(any(debug, test))]
    fn assert_no_running_jobs(&self) {
        assert_eq!(self.running_jobs.load(Ordering::SeqCst), 0);
    }

    #[cfg(not(any(debug, test)))]
    fn assert_no_running_jobs(&self) {}
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    // Sleeps briefly, then counts itself. Optionally blows up instead.
    struct Probe {
        panics: bool,
        ran: Arc<AtomicUsize>,
    }

    impl CommandPoolTask for Probe {
        type Result = usize;

        fn run(&self) -> usize {
            thread::sleep(Duration::from_millis(5));
            if self.panics {
                panic!("probe exploded");
            }
            self.ran.fetch_add(1, Ordering::SeqCst)
        }
    }

    fn probe(ran: &Arc<AtomicUsize>) -> Probe {
        Probe {
            panics: false,
            ran: ran.clone(),
        }
    }

    #[test]
    fn test_worker_panic_poisons_the_pool() {
        let ran = Arc::new(AtomicUsize::new(0));
        let pool = CommandPool::with_capacity(2);
        let outcome = pool.run(|s| {
            s.enqueue(probe(&ran));
            s.enqueue(Probe {
                panics: true,
                ran: ran.clone(),
            });
            while !s.is_poisoned() {
                thread::sleep(Duration::from_millis(1));
            }
        });
        assert!(outcome.is_err());
    }

    #[test]
    fn test_main_thread_panic_stops_workers() {
        let ran = Arc::new(AtomicUsize::new(0));
        let caught = std::panic::catch_unwind(|| {
            let pool = CommandPool::with_capacity(2);
            let _ = pool.run(|s| {
                s.enqueue(probe(&ran));
                s.enqueue(probe(&ran));
                panic!("scheduler gave up");
            });
        });
        assert!(caught.is_err());
        // Work queued before the Stops still runs.
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unread_results_do_not_block_shutdown() {
        let ran = Arc::new(AtomicUsize::new(0));
        let pool = CommandPool::with_capacity(2);
        pool.run(|s| {
            for _ in 0..12 {
                s.enqueue(probe(&ran));
            }
        })
        .expect("clean shutdown");
        assert_eq!(ran.load(Ordering::SeqCst), 12);
    }

    #[test]
    fn test_every_result_arrives() {
        let ran = Arc::new(AtomicUsize::new(0));
        let pool = CommandPool::with_capacity(3);
        let tasks = 15;
        let mut results = pool
            .run(|s| {
                for _ in 0..tasks {
                    s.enqueue(probe(&ran));
                }
                (0..tasks)
                    .map(|_| s.rx.recv().expect("a result"))
                    .collect::<Vec<_>>()
            })
            .expect("pool succeeded");
        results.sort_unstable();
        assert_eq!(results, (0..tasks).collect::<Vec<_>>());
        assert!(pool.job_queue.is_empty());
    }

    #[test]
    fn test_channel_closes_after_stops() {
        let ran = Arc::new(AtomicUsize::new(0));
        let pool = CommandPool::with_capacity(2);
        pool.run(|s| {
            for _ in 0..6 {
                s.enqueue(probe(&ran));
            }
            for _ in 0..pool.capacity() {
                pool.job_queue.push(QueueTask::Stop);
            }
            assert_eq!(s.rx.iter().count(), 6);
        })
        .expect("pool succeeded");

        // The pool queues its own Stops on the way out and nobody is left to take them.
        let mut leftover = 0;
        while let Steal::Success(task) = pool.job_queue.steal() {
            assert!(matches!(task, QueueTask::Stop));
            leftover += 1;
        }
        assert_eq!(leftover, 2);
    }

    #[test]
    fn test_zero_capacity_still_runs() {
        let ran = Arc::new(AtomicUsize::new(0));
        let pool = CommandPool::with_capacity(0);
        assert_eq!(pool.capacity(), 1);
        pool.run(|s| {
            s.enqueue(probe(&ran));
            s.rx.recv().expect("a result");
        })
        .expect("pool succeeded");
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
