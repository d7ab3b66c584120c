//! Background source-separation job
//!
//! The separation call runs on its own thread and reports through a
//! single-slot channel. Exactly one [`JobOutcome`] is produced per job; the
//! caller polls with [`SeparationJob::try_result`] and never blocks.
//! Jobs cannot be cancelled once started.

use super::analysis::{separate_sources, SourceSeparator, StemPair};
use super::audio::{AudioError, Result, SampleBuffer};
use crossbeam::channel::{bounded, Receiver, TryRecvError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// The single message a job produces
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Success(StemPair),
    Error(String),
}

pub struct SeparationJob {
    rx: Receiver<JobOutcome>,
    handle: Option<JoinHandle<()>>,
    started: Instant,
    finished: bool,
}

impl SeparationJob {
    /// Start separating `buffer` on a worker thread
    pub fn spawn(buffer: Arc<SampleBuffer>, separator: Arc<dyn SourceSeparator>) -> Result<Self> {
        let (tx, rx) = bounded(1);
        let handle = thread::Builder::new()
            .name("separation-job".to_string())
            .spawn(move || {
                let result = catch_unwind(AssertUnwindSafe(|| {
                    separate_sources(&buffer, separator.as_ref())
                }));
                let outcome = match result {
                    Ok(Ok(stems)) => JobOutcome::Success(stems),
                    Ok(Err(e)) => {
                        error!(error = %e, "Source separation failed");
                        JobOutcome::Error(e.to_string())
                    }
                    Err(_) => {
                        error!("Source separation worker panicked");
                        JobOutcome::Error("Separation worker panicked".to_string())
                    }
                };
                // Receiver gone means the editor was dropped
                let _ = tx.send(outcome);
            })
            .map_err(|e| AudioError::Job(format!("Cannot spawn separation worker: {}", e)))?;

        debug!("Separation job started");
        Ok(Self {
            rx,
            handle: Some(handle),
            started: Instant::now(),
            finished: false,
        })
    }

    /// Non-blocking poll; `Some` exactly once
    pub fn try_result(&mut self) -> Option<JobOutcome> {
        if self.finished {
            return None;
        }
        let outcome = match self.rx.try_recv() {
            Ok(outcome) => outcome,
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Disconnected) => {
                JobOutcome::Error("Separation worker exited without a result".to_string())
            }
        };

        self.finished = true;
        if let Some(handle) = self.handle.take() {
            // The worker has sent its message and is about to exit
            let _ = handle.join();
        }
        debug!(elapsed_ms = self.elapsed().as_millis() as u64, "Separation job finished");
        Some(outcome)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
