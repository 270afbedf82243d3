//! A bounded pool of named OS worker threads fed from a channel. The
//! scheduler thread asks how many workers are free before acquiring
//! triggers, so the pool tracks in-flight work from submission (not pickup)
//! to completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

pub(crate) type WorkItem = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    /// Submitted-but-not-finished work items.
    busy: Mutex<usize>,
    changed: Condvar,
}

pub(crate) struct WorkerPool {
    thread_count: usize,
    open: AtomicBool,
    tx: Mutex<Option<Sender<WorkItem>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    state: Arc<PoolState>,
}

impl WorkerPool {
    pub fn start(thread_count: usize) -> Self {
        let (tx, rx) = channel::<WorkItem>();
        let rx = Arc::new(Mutex::new(rx));
        let state = Arc::new(PoolState {
            busy: Mutex::new(0),
            changed: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(thread_count);
        for i in 0..thread_count {
            let rx = rx.clone();
            let state = state.clone();
            let handle = std::thread::Builder::new()
                .name(format!("cronloop-worker-{i}"))
                .spawn(move || worker_loop(rx, state))
                .expect("worker thread failed to start");
            workers.push(handle);
        }
        info!("Worker pool started with {thread_count} threads");

        Self {
            thread_count,
            open: AtomicBool::new(true),
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            state,
        }
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Workers not occupied by submitted work. Zero after shutdown.
    pub fn available_count(&self) -> usize {
        if !self.open.load(Ordering::SeqCst) {
            return 0;
        }
        let busy = *self.state.busy.lock().unwrap();
        self.thread_count.saturating_sub(busy)
    }

    /// Blocks until at least one worker is free (or the pool is shut down)
    /// and returns the free count.
    pub fn block_for_available(&self) -> usize {
        let mut busy = self.state.busy.lock().unwrap();
        loop {
            if !self.open.load(Ordering::SeqCst) {
                return 0;
            }
            if *busy < self.thread_count {
                return self.thread_count - *busy;
            }
            busy = self.state.changed.wait(busy).unwrap();
        }
    }

    /// Hands a work item to the pool. Returns false when the pool has been
    /// shut down.
    pub fn submit(&self, work: WorkItem) -> bool {
        let guard = self.tx.lock().unwrap();
        let Some(tx) = guard.as_ref() else {
            warn!("Work submitted after pool shutdown, dropping");
            return false;
        };
        *self.state.busy.lock().unwrap() += 1;
        if tx.send(work).is_err() {
            *self.state.busy.lock().unwrap() -= 1;
            return false;
        }
        true
    }

    /// Stops accepting work. With `wait`, joins every worker after it drains
    /// the queue; without, workers are left to finish their current item and
    /// exit on their own.
    pub fn shutdown(&self, wait: bool) {
        {
            let mut tx = self.tx.lock().unwrap();
            if tx.take().is_none() {
                return;
            }
        }
        self.open.store(false, Ordering::SeqCst);
        self.state.changed.notify_all();
        if wait {
            let workers: Vec<JoinHandle<()>> =
                self.workers.lock().unwrap().drain(..).collect();
            debug!("Joining {} worker threads", workers.len());
            for handle in workers {
                let _ = handle.join();
            }
        }
        info!("Worker pool shut down (wait={wait})");
    }
}

fn worker_loop(rx: Arc<Mutex<Receiver<WorkItem>>>, state: Arc<PoolState>) {
    loop {
        let work = {
            let rx = rx.lock().unwrap();
            rx.recv()
        };
        match work {
            | Ok(work) => {
                work();
                let mut busy = state.busy.lock().unwrap();
                *busy = busy.saturating_sub(1);
                drop(busy);
                state.changed.notify_all();
            }
            // Channel closed: pool shut down.
            | Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn runs_submitted_work() {
        let pool = WorkerPool::start(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            assert!(pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })));
        }
        pool.shutdown(true);
        assert_eq!(10, counter.load(Ordering::SeqCst));
    }

    #[test]
    fn tracks_availability() {
        let pool = WorkerPool::start(2);
        assert_eq!(2, pool.available_count());

        let (done_tx, done_rx) = channel::<()>();
        let (release_tx, release_rx) = channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));
        for _ in 0..2 {
            let done = done_tx.clone();
            let release = release_rx.clone();
            pool.submit(Box::new(move || {
                done.send(()).unwrap();
                let _ = release.lock().unwrap().recv();
            }));
        }
        // Both workers picked up their items.
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(0, pool.available_count());

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        assert!(pool.block_for_available() >= 1);
        pool.shutdown(true);
        assert_eq!(0, pool.available_count());
    }

    #[test]
    fn rejects_work_after_shutdown() {
        let pool = WorkerPool::start(1);
        pool.shutdown(true);
        assert!(!pool.submit(Box::new(|| {})));
    }
}
