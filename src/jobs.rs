use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How background work is run. `Inline` executes the closure on the calling
/// thread so completion order is deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobMode {
    #[default]
    Threaded,
    Inline,
}

#[derive(Debug, PartialEq, Eq)]
pub enum JobPoll<T> {
    Pending,
    Ready(T),
    Cancelled,
    Disconnected,
}

/// One unit of background work whose result is picked up by polling from the
/// UI loop. Dropping the job cancels it.
#[derive(Debug)]
pub struct Job<T> {
    label: String,
    receiver: Option<Receiver<T>>,
    cancel: CancelToken,
}

impl<T: Send + 'static> Job<T> {
    pub fn spawn<F>(mode: JobMode, label: impl Into<String>, work: F) -> Self
    where
        F: FnOnce(&CancelToken) -> T + Send + 'static,
    {
        let label = label.into();
        let cancel = CancelToken::default();
        let (tx, rx) = mpsc::channel::<T>();
        match mode {
            JobMode::Inline => {
                let _ = tx.send(work(&cancel));
            }
            JobMode::Threaded => {
                let token = cancel.clone();
                let thread_label = label.clone();
                let spawned = thread::Builder::new()
                    .name(format!("job-{thread_label}"))
                    .spawn(move || {
                        let result = work(&token);
                        if token.is_cancelled() {
                            log::debug!("job {thread_label} finished after cancellation");
                            return;
                        }
                        let _ = tx.send(result);
                    });
                if let Err(err) = spawned {
                    log::error!("could not spawn job {label}: {err}");
                }
            }
        }
        Self {
            label,
            receiver: Some(rx),
            cancel,
        }
    }
}

impl<T> Job<T> {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.receiver = None;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A job yields `Ready` at most once; afterwards it reports `Disconnected`.
    pub fn poll(&mut self) -> JobPoll<T> {
        if self.cancel.is_cancelled() {
            self.receiver = None;
            return JobPoll::Cancelled;
        }
        let Some(receiver) = self.receiver.take() else {
            return JobPoll::Disconnected;
        };
        match receiver.try_recv() {
            Ok(value) => JobPoll::Ready(value),
            Err(TryRecvError::Empty) => {
                self.receiver = Some(receiver);
                JobPoll::Pending
            }
            Err(TryRecvError::Disconnected) => {
                log::warn!("job {} ended without a result", self.label);
                JobPoll::Disconnected
            }
        }
    }
}

impl<T> Drop for Job<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
