//! Progress state shared between a running sweep and its pollers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Counters, message and log of one probe step.
///
/// Writers are the concurrent per-target tasks; readers are whoever polls the
/// step. Counters are atomics and the log is an append-only vector locked only
/// for a single push or read.
#[derive(Debug, Default)]
pub struct StepProgress {
    total: AtomicUsize,
    processed: AtomicUsize,
    completed: AtomicBool,
    message: Mutex<String>,
    log: Mutex<Vec<String>>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StepProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of work items. Never shrinks, so the percentage cannot go back.
    pub fn set_total(&self, total: usize) {
        self.total.fetch_max(total, Ordering::AcqRel);
    }

    /// Mark one work item processed, successful or not.
    pub fn advance(&self) {
        self.processed.fetch_add(1, Ordering::AcqRel);
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Acquire)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    pub fn set_message(&self, message: impl Into<String>) {
        *guard(&self.message) = message.into();
    }

    pub fn message(&self) -> String {
        guard(&self.message).clone()
    }

    /// Append a line to the step log.
    pub fn log(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::debug!("{}", line);
        guard(&self.log).push(line);
    }

    /// The full log, newest line last.
    pub fn log_text(&self) -> String {
        guard(&self.log).join("\n")
    }

    pub fn log_lines(&self) -> Vec<String> {
        guard(&self.log).clone()
    }

    /// Fraction of work done, exactly 1.0 once completed.
    pub fn percentage(&self) -> f64 {
        if self.is_completed() {
            return 1.0;
        }
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        (self.processed() as f64 / total as f64).min(1.0)
    }

    /// Latch the completed flag. It never resets.
    pub fn finish(&self, message: impl Into<String>) {
        self.set_message(message);
        self.completed.store(true, Ordering::Release);
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}
