//! Single-worker FIFO job queue.
//!
//! Every protocol client owns one [`JobQueue`] for its asynchronous publishes.
//! The worker thread drains items strictly in submission order, running the
//! queue's processor on each item and then the item's completion callback with
//! the result. [`JobQueue::pause`] freezes the worker between items, which the
//! MQTT client uses to keep publishes out of a reconnect.
//!
//! Items still queued when the queue stops are completed with the value of the
//! [`on_discard`](JobQueue::on_discard) function, if one is set.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::utils::{BrokerError, Result};

pub type Processor<T, R> = Box<dyn Fn(&T) -> R + Send + Sync>;
pub type Completion<T, R> = Box<dyn FnOnce(T, R) + Send>;
pub type Discard<T, R> = Box<dyn Fn(&T) -> R + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Created,
    Running,
    Paused,
    Stopped,
}

struct Job<T, R> {
    item: T,
    completion: Completion<T, R>,
}

struct State<T, R> {
    jobs: VecDeque<Job<T, R>>,
    status: QueueStatus,
    busy: bool,
}

struct Shared<T, R> {
    state: Mutex<State<T, R>>,
    work: Condvar,
    idle: Condvar,
    processor: Processor<T, R>,
}

pub struct JobQueue<T, R> {
    name: String,
    shared: Arc<Shared<T, R>>,
    discard: Option<Discard<T, R>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: Mutex<Option<ThreadId>>,
}

impl<T, R> JobQueue<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Creates a queue in the `Created` state. Items can be enqueued before
    /// [`start`](Self::start); they run once the worker is up.
    pub fn new(name: impl Into<String>, processor: impl Fn(&T) -> R + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    jobs: VecDeque::new(),
                    status: QueueStatus::Created,
                    busy: false,
                }),
                work: Condvar::new(),
                idle: Condvar::new(),
                processor: Box::new(processor),
            }),
            discard: None,
            worker: Mutex::new(None),
            worker_id: Mutex::new(None),
        }
    }

    /// Sets the result handed to the completion of every item that is still
    /// queued when the queue stops. Without it those completions are dropped.
    pub fn on_discard(mut self, discard: impl Fn(&T) -> R + Send + Sync + 'static) -> Self {
        self.discard = Some(Box::new(discard));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> QueueStatus {
        self.shared.state.lock().status
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawns the worker thread. Starting a queue that already has a worker is
    /// a no-op; a stopped queue cannot be restarted. A queue paused before it
    /// was started stays paused.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        {
            let mut state = self.shared.state.lock();
            match state.status {
                QueueStatus::Created => state.status = QueueStatus::Running,
                QueueStatus::Stopped => return Err(BrokerError::QueueStopped(self.name.clone())),
                QueueStatus::Running | QueueStatus::Paused => {}
            }
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("queue-{}", self.name))
            .spawn(move || run_worker(shared))?;
        *self.worker_id.lock() = Some(handle.thread().id());
        *worker = Some(handle);
        debug!("Job queue {} started", self.name);
        Ok(())
    }

    /// Appends an item. On a stopped queue the item is handed back unprocessed
    /// and its completion is dropped without being called.
    pub fn enqueue(
        &self,
        item: T,
        completion: impl FnOnce(T, R) + Send + 'static,
    ) -> std::result::Result<(), T> {
        let mut state = self.shared.state.lock();
        if state.status == QueueStatus::Stopped {
            return Err(item);
        }
        state.jobs.push_back(Job {
            item,
            completion: Box::new(completion),
        });
        self.shared.work.notify_one();
        Ok(())
    }

    /// Holds the worker after its current item until [`resume`](Self::resume).
    ///
    /// Returns once no item is being processed, unless called from the worker
    /// thread itself.
    pub fn pause(&self) {
        self.request_pause();
        if !self.is_worker_thread() {
            let mut state = self.shared.state.lock();
            while state.busy {
                self.shared.idle.wait(&mut state);
            }
        }
    }

    /// Like [`pause`](Self::pause), but returns without waiting for the item
    /// in flight. Safe to call from threads the processor may block on.
    pub fn request_pause(&self) {
        let mut state = self.shared.state.lock();
        if state.status == QueueStatus::Running || state.status == QueueStatus::Created {
            state.status = QueueStatus::Paused;
            debug!("Job queue {} paused", self.name);
        }
    }

    pub fn resume(&self) {
        let started = self.worker.lock().is_some();
        let mut state = self.shared.state.lock();
        if state.status == QueueStatus::Paused {
            state.status = if started {
                QueueStatus::Running
            } else {
                QueueStatus::Created
            };
            debug!("Job queue {} resumed", self.name);
            self.shared.work.notify_all();
        }
    }

    /// Stops accepting work, discards queued items and joins the worker.
    ///
    /// Discarded items are completed with the [`on_discard`](Self::on_discard)
    /// result after the worker has been told to stop.
    pub fn stop(&self) {
        let dropped = {
            let mut state = self.shared.state.lock();
            if state.status == QueueStatus::Stopped {
                return;
            }
            state.status = QueueStatus::Stopped;
            self.shared.work.notify_all();
            std::mem::take(&mut state.jobs)
        };
        if !dropped.is_empty() {
            warn!(
                "Job queue {} stopped with {} unprocessed item(s)",
                self.name,
                dropped.len()
            );
        }
        self.complete_discarded(dropped);

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if self.is_worker_thread() {
                return;
            }
            if handle.join().is_err() {
                warn!("Job queue {} worker panicked", self.name);
            }
        }
        debug!("Job queue {} stopped", self.name);
    }

    fn is_worker_thread(&self) -> bool {
        *self.worker_id.lock() == Some(thread::current().id())
    }
}

impl<T, R> JobQueue<T, R> {
    fn complete_discarded(&self, jobs: VecDeque<Job<T, R>>) {
        let Some(discard) = self.discard.as_ref() else {
            return;
        };
        for job in jobs {
            let result = discard(&job.item);
            (job.completion)(job.item, result);
        }
    }
}

impl<T, R> Drop for JobQueue<T, R> {
    fn drop(&mut self) {
        let dropped = {
            let mut state = self.shared.state.lock();
            state.status = QueueStatus::Stopped;
            self.shared.work.notify_all();
            std::mem::take(&mut state.jobs)
        };
        self.complete_discarded(dropped);
        if let Some(handle) = self.worker.lock().take() {
            if *self.worker_id.lock() != Some(thread::current().id()) {
                let _ = handle.join();
            }
        }
    }
}

fn run_worker<T, R>(shared: Arc<Shared<T, R>>) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                match state.status {
                    QueueStatus::Stopped => return,
                    QueueStatus::Running => {
                        if let Some(job) = state.jobs.pop_front() {
                            state.busy = true;
                            break job;
                        }
                    }
                    QueueStatus::Created | QueueStatus::Paused => {}
                }
                shared.work.wait(&mut state);
            }
        };

        let result = (shared.processor)(&job.item);
        (job.completion)(job.item, result);

        let mut state = shared.state.lock();
        state.busy = false;
        shared.idle.notify_all();
    }
}
