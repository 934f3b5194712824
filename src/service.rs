use std::{sync::Arc, time::Duration};

use tokio::{
    sync::Semaphore,
    task,
    time::{Instant, timeout_at},
};
use tracing::warn;

use crate::{
    engine::CancelFlag,
    error::ServiceError,
    model::{GenerationDefaults, GenerationRequest, GenerationResult},
    state::ServingState,
};

/// The single entry point both transports use to run a completion.
///
/// Each instance owns a bounded pool of worker slots; a decode holds its
/// slot until the blocking task actually finishes, even if the caller has
/// gone away.
#[derive(Clone)]
pub struct CompletionService {
    state: Arc<ServingState>,
    defaults: GenerationDefaults,
    workers: Arc<Semaphore>,
    timeout: Option<Duration>,
}

impl CompletionService {
    pub fn new(state: Arc<ServingState>, defaults: GenerationDefaults, workers: usize) -> Self {
        Self {
            state,
            defaults,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn state(&self) -> &Arc<ServingState> {
        &self.state
    }

    pub fn available_workers(&self) -> usize {
        self.workers.available_permits()
    }

    /// Runs one completion. When a timeout is configured it covers the
    /// whole request, including the wait for a worker slot.
    pub async fn complete(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResult, ServiceError> {
        let deadline = self.timeout.map(|limit| Instant::now() + limit);
        let params = request.resolve(&self.defaults, self.state.vocab_size())?;

        let acquire = self.workers.clone().acquire_owned();
        let permit = match deadline {
            Some(deadline) => timeout_at(deadline, acquire).await.map_err(|_| {
                warn!(limit = ?self.timeout, "generation timed out waiting for a worker");
                ServiceError::TimedOut
            })?,
            None => acquire.await,
        }
        .map_err(|_| ServiceError::Unavailable)?;

        let cancel = CancelFlag::new();
        // Dropping this future (client gone, deadline hit) stops the decode.
        let guard = cancel.drop_guard();

        let state = self.state.clone();
        let flag = cancel.clone();
        let handle = task::spawn_blocking(move || {
            let _permit = permit;
            state.run(&params, &flag)
        });

        let joined = match deadline {
            Some(deadline) => match timeout_at(deadline, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(limit = ?self.timeout, "generation exceeded its time limit");
                    cancel.cancel();
                    return Err(ServiceError::TimedOut);
                }
            },
            None => handle.await,
        };
        guard.disarm();

        joined.map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))?
    }
}
