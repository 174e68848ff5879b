//! Bounded worker pool.
//!
//! Each job runs on its own thread named `Test-{id}`; at most `size` run at
//! once. Results arrive in completion order. A job that panics still
//! completes, with a [`JobPanic`] in place of its value.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use lcevc_functest_error::{FunctestError, Result};
use tracing::error;

use crate::cancel::CancellationToken;

type Job<T> = Box<dyn FnOnce() -> T + Send + 'static>;

/// A job that unwound instead of returning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPanic {
    pub message: String,
}

impl JobPanic {
    fn from_payload(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|message| (*message).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        Self { message }
    }
}

impl fmt::Display for JobPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "test panicked: {}", self.message)
    }
}

/// What a finished job produced.
pub type JobOutput<T> = std::result::Result<T, JobPanic>;

pub struct WorkerPool<T: Send + 'static> {
    size: usize,
    pending: VecDeque<(usize, Job<T>)>,
    running: Vec<(usize, JoinHandle<()>)>,
    sender: Sender<(usize, JobOutput<T>)>,
    receiver: Receiver<(usize, JobOutput<T>)>,
    cancel: CancellationToken,
}

impl<T: Send + 'static> WorkerPool<T> {
    #[must_use]
    pub fn new(size: usize, cancel: CancellationToken) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            size: size.max(1),
            pending: VecDeque::new(),
            running: Vec::new(),
            sender,
            receiver,
            cancel,
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a job; it starts once a slot frees up.
    pub fn submit<F>(&mut self, id: usize, job: F)
    where
        F: FnOnce() -> T + Send + 'static,
    {
        self.pending.push_back((id, Box::new(job)));
    }

    /// Jobs neither started nor finished.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.pending.len() + self.running.len()
    }

    fn dispatch(&mut self) -> Result<()> {
        while self.running.len() < self.size && !self.cancel.is_cancelled() {
            let Some((id, job)) = self.pending.pop_front() else {
                break;
            };
            let sender = self.sender.clone();
            let handle = thread::Builder::new()
                .name(format!("Test-{id}"))
                .spawn(move || {
                    let output = panic::catch_unwind(AssertUnwindSafe(job))
                        .map_err(|payload| JobPanic::from_payload(payload.as_ref()));
                    let _ = sender.send((id, output));
                })?;
            self.running.push((id, handle));
        }
        Ok(())
    }

    fn reap(&mut self, id: usize, output: JobOutput<T>) -> (usize, JobOutput<T>) {
        if let Some(index) = self.running.iter().position(|(running, _)| *running == id) {
            let (_, handle) = self.running.swap_remove(index);
            let _ = handle.join();
        }
        if let Err(failure) = &output {
            error!(test_id = id, message = %failure.message, "worker panicked");
        }
        (id, output)
    }

    /// Block until the next job finishes, starting queued jobs as slots free
    /// up. `None` once nothing is left to wait for.
    pub fn next_completed(&mut self) -> Result<Option<(usize, JobOutput<T>)>> {
        self.dispatch()?;
        if self.running.is_empty() {
            return Ok(None);
        }
        let Ok((id, output)) = self.receiver.recv() else {
            return Err(FunctestError::assertion("worker pool lost its result channel"));
        };
        Ok(Some(self.reap(id, output)))
    }

    /// Drop every queued job and signal running ones to stop.
    /// Returns how many queued jobs were dropped.
    pub fn cancel_all_pending(&mut self) -> usize {
        self.cancel.cancel();
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    /// Wait for every started job and return what they produced, in
    /// completion order. Queued jobs are not started.
    pub fn drain_completed(&mut self) -> Vec<(usize, JobOutput<T>)> {
        let mut completed = Vec::new();
        while !self.running.is_empty() {
            let Ok((id, output)) = self.receiver.recv() else {
                break;
            };
            completed.push(self.reap(id, output));
        }
        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn every_job_completes_with_bounded_concurrency() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new(2, CancellationToken::new());
        for id in 0..6 {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            pool.submit(id, move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                active.fetch_sub(1, Ordering::SeqCst);
                (id, thread::current().name().map(str::to_owned))
            });
        }
        let mut seen = Vec::new();
        while let Some((id, output)) = pool.next_completed().unwrap() {
            let (echo, name) = output.unwrap();
            assert_eq!(id, echo);
            assert_eq!(name.as_deref(), Some(format!("Test-{id}").as_str()));
            seen.push(id);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn cancelling_keeps_finished_work_and_drops_the_queue() {
        let cancel = CancellationToken::new();
        let mut pool = WorkerPool::new(1, cancel.clone());
        for id in 0..4 {
            pool.submit(id, move || id * 10);
        }
        let first = pool.next_completed().unwrap();
        assert_eq!(first, Some((0, Ok(0))));
        let dropped = pool.cancel_all_pending();
        assert!(cancel.is_cancelled());
        let drained = pool.drain_completed();
        assert_eq!(dropped + drained.len(), 3);
        assert_eq!(pool.next_completed().unwrap(), None);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn panicking_job_still_completes_with_its_message() {
        let mut pool = WorkerPool::new(2, CancellationToken::new());
        pool.submit(0, || "passed");
        pool.submit(1, || -> &'static str { panic!("plane index out of range") });
        let mut completed = Vec::new();
        while let Some(entry) = pool.next_completed().unwrap() {
            completed.push(entry);
        }
        completed.sort_by_key(|(id, _)| *id);
        assert_eq!(completed.len(), 2);
        assert_eq!(completed[0], (0, Ok("passed")));
        let (id, Err(failure)) = &completed[1] else {
            panic!("expected a panic for job 1, got {:?}", completed[1]);
        };
        assert_eq!(*id, 1);
        assert_eq!(failure.message, "plane index out of range");
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn formatted_panic_messages_are_kept() {
        let mut pool = WorkerPool::new(1, CancellationToken::new());
        pool.submit(7, || -> u8 { panic!("row {} has no hash", 12) });
        let (_, output) = pool.next_completed().unwrap().unwrap();
        assert_eq!(output.unwrap_err().to_string(), "test panicked: row 12 has no hash");
    }
}
