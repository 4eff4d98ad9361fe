//! Background task plumbing: cooperative cancellation and an awaitable handle.

use crate::error::CaptureError;
use std::io;
use std::mem;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Shared cancellation flag. Stages check it between steps; sleeps through
/// [`CancelToken::sleep`] wake up as soon as it is raised.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

#[derive(Default)]
struct CancelState {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *cancelled = true;
        self.inner.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `duration`. Returns `false` if cancellation cut it short.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            cancelled = self
                .inner
                .wake
                .wait_timeout(cancelled, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        false
    }
}

enum TaskState {
    Running(JoinHandle<Result<(), CaptureError>>),
    Joining,
    Finished(Result<(), CaptureError>),
    Closed,
}

/// Handle on the thread running a capture.
pub(crate) struct Task {
    entry: String,
    state: Mutex<TaskState>,
    joined: Condvar,
    cancel: CancelToken,
}

impl Task {
    /// Run `work` on a thread named after `entry`.
    pub(crate) fn spawn<F>(entry: &str, cancel: CancelToken, work: F) -> io::Result<Self>
    where
        F: FnOnce() -> Result<(), CaptureError> + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(format!("loadtrace-{entry}"))
            .spawn(work)?;
        Ok(Self {
            entry: entry.to_string(),
            state: Mutex::new(TaskState::Running(handle)),
            joined: Condvar::new(),
            cancel,
        })
    }

    pub(crate) fn is_finished(&self) -> bool {
        match &*self.lock() {
            TaskState::Running(handle) => handle.is_finished(),
            TaskState::Joining => false,
            TaskState::Finished(_) | TaskState::Closed => true,
        }
    }

    /// Block until the task ends. Every caller sees the same outcome.
    pub(crate) fn join(&self) -> Result<(), CaptureError> {
        let handle = {
            let mut state = self.lock();
            loop {
                match mem::replace(&mut *state, TaskState::Joining) {
                    TaskState::Running(handle) => break handle,
                    TaskState::Joining => {
                        state = self
                            .joined
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                    TaskState::Finished(outcome) => {
                        *state = TaskState::Finished(outcome.clone());
                        return outcome;
                    }
                    TaskState::Closed => {
                        *state = TaskState::Closed;
                        return Err(CaptureError::Closed);
                    }
                }
            }
        };

        let outcome = handle.join().unwrap_or_else(|_| {
            Err(CaptureError::EntryPoint {
                entry: self.entry.clone(),
                message: "capture task panicked".to_string(),
            })
        });

        let mut state = self.lock();
        let outcome = match &*state {
            TaskState::Closed => Err(CaptureError::Closed),
            _ => {
                *state = TaskState::Finished(outcome.clone());
                outcome
            }
        };
        self.joined.notify_all();
        outcome
    }

    /// Cancel and detach. The thread winds down on its own.
    pub(crate) fn close(&self) {
        self.cancel.cancel();
        let mut state = self.lock();
        *state = TaskState::Closed;
        self.joined.notify_all();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
