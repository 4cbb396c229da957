//! Progress reporting, cancellation and user interaction for long running operations.

use tokio_util::sync::CancellationToken;

use crate::BuildError;

/// Receives progress of long running operations and answers questions that need a decision.
pub trait TaskHandler: Send + Sync {
    /// The token that signals that running operations should stop.
    fn cancellation_token(&self) -> &CancellationToken;

    /// Called when a task starts. `total` is the expected number of units, if known.
    fn start_task(&self, name: &str, total: Option<u64>) -> Box<dyn TaskProgress>;

    /// Asks a yes/no question. Non-interactive handlers return a fixed answer.
    fn ask(&self, question: &str) -> bool;
}

/// Progress of a single task started with [`TaskHandler::start_task`].
pub trait TaskProgress: Send {
    /// Sets the number of completed units.
    fn set_position(&self, position: u64);

    /// Adds to the number of completed units.
    fn inc(&self, delta: u64);

    /// Called once when the task is done, whether it succeeded or not.
    fn finish(&self);
}

/// A [`TaskHandler`] that reports nothing and answers every question with its batch answer.
#[derive(Debug, Clone, Default)]
pub struct SilentTaskHandler {
    cancellation: CancellationToken,
    batch_answer: bool,
}

impl SilentTaskHandler {
    /// Creates a handler that answers every question with "no".
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the answer given to every question.
    pub fn with_batch_answer(self, batch_answer: bool) -> Self {
        Self {
            batch_answer,
            ..self
        }
    }

    /// Uses `token` to signal cancellation.
    pub fn with_cancellation_token(self, cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            ..self
        }
    }
}

struct NoProgress;

impl TaskProgress for NoProgress {
    fn set_position(&self, _position: u64) {}
    fn inc(&self, _delta: u64) {}
    fn finish(&self) {}
}

impl TaskHandler for SilentTaskHandler {
    fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    fn start_task(&self, name: &str, _total: Option<u64>) -> Box<dyn TaskProgress> {
        tracing::debug!("{name}");
        Box::new(NoProgress)
    }

    fn ask(&self, question: &str) -> bool {
        tracing::debug!("{question} ({})", if self.batch_answer { "yes" } else { "no" });
        self.batch_answer
    }
}

/// Runs `work` as a task of `handler`. Fails with [`BuildError::Cancelled`] without running it
/// if cancellation was already requested.
pub fn run_task<T, E: From<BuildError>>(
    handler: &dyn TaskHandler,
    name: &str,
    total: Option<u64>,
    work: impl FnOnce(&dyn TaskProgress) -> Result<T, E>,
) -> Result<T, E> {
    if handler.cancellation_token().is_cancelled() {
        return Err(BuildError::Cancelled.into());
    }
    let progress = handler.start_task(name, total);
    let result = work(progress.as_ref());
    progress.finish();
    result
}
