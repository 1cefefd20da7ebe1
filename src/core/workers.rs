//! Work-stealing thread pool for decode jobs.
//!
//! Jobs go to a shared injector; each thread drains its own deque first, then
//! the injector, then steals from its siblings. Idle threads nap for 1ms.

use crossbeam::deque::{Injector, Stealer, Worker};
use log::trace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// How long `drop` waits for running jobs before leaving threads behind.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

pub struct Workers {
    injector: Arc<Injector<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl Workers {
    /// Spawns `num_threads` threads named `{name}-{index}`.
    pub fn new(num_threads: usize, name: &str) -> Self {
        let num_threads = num_threads.max(1);
        let injector: Arc<Injector<Job>> = Arc::new(Injector::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let locals: Vec<Worker<Job>> = (0..num_threads).map(|_| Worker::new_fifo()).collect();
        let stealers: Vec<Stealer<Job>> = locals.iter().map(Worker::stealer).collect();

        let handles = locals
            .into_iter()
            .enumerate()
            .map(|(index, local)| {
                let injector = Arc::clone(&injector);
                let shutdown = Arc::clone(&shutdown);
                let stealers = stealers.clone();
                thread::Builder::new()
                    .name(format!("{}-{}", name, index))
                    .spawn(move || run(index, local, &injector, &stealers, &shutdown))
                    .expect("Failed to spawn worker thread")
            })
            .collect();

        trace!("Workers '{}' initialized: {} threads", name, num_threads);
        Self {
            injector,
            handles,
            shutdown,
        }
    }

    /// Three quarters of the cores, leaving room for the caller and audio.
    pub fn default_size() -> usize {
        (num_cpus::get() * 3 / 4).max(1)
    }

    pub fn thread_count(&self) -> usize {
        self.handles.len()
    }

    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.injector.push(Box::new(f));
    }
}

fn run(
    index: usize,
    local: Worker<Job>,
    injector: &Injector<Job>,
    stealers: &[Stealer<Job>],
    shutdown: &AtomicBool,
) {
    trace!("Worker {} started", index);
    loop {
        let job = local
            .pop()
            .or_else(|| injector.steal_batch_and_pop(&local).success())
            .or_else(|| stealers.iter().find_map(|s| s.steal().success()));
        if let Some(job) = job {
            job();
            continue;
        }
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    trace!("Worker {} stopped", index);
}

impl Drop for Workers {
    fn drop(&mut self) {
        let num_threads = self.handles.len();
        self.shutdown.store(true, Ordering::SeqCst);

        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        for handle in std::mem::take(&mut self.handles) {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    trace!("Workers shutdown timeout reached, leaving threads behind");
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }
        trace!("All {} workers stopped", num_threads);
    }
}
