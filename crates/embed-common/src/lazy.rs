/// Lazily constructed, process-wide embedding model.
///
/// Construction is expensive (ONNX session setup, possibly a model download) and must happen
/// at most once even when many requests arrive during cold start. `LazyModel` implements
/// double-checked locking:
///
/// 1. Fast path: if the model is ready, return it without touching any lock.
/// 2. Otherwise take the init mutex, re-check, and construct if still not ready.
///
/// The mutex guards only the check-construct-store sequence. Encoding never takes it.
///
/// A failed construction is not cached permanently: the next caller starts a fresh attempt.
/// An optional retry backoff makes callers fail fast for a while after a failure instead of
/// hammering a broken loader under sustained load.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info};

use crate::embedding::{ModelLoader, TextEncoder};
use crate::error::CommonError;

/// Observable lifecycle of the shared model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStatus {
    Uninitialized,
    Initializing,
    Ready,
    /// The last attempt failed. The next `get_or_init` retries (after the backoff, if any).
    Failed,
}

#[derive(Clone)]
pub struct LazyModel {
    inner: Arc<Inner>,
}

struct Inner {
    loader: Arc<dyn ModelLoader>,
    ready: OnceLock<Arc<dyn TextEncoder>>,
    init: Arc<Mutex<InitState>>,
    retry_backoff: Duration,
    attempts: AtomicU64,
}

#[derive(Default)]
struct InitState {
    last_failure: Option<Failure>,
}

struct Failure {
    at: Instant,
    message: String,
}

impl LazyModel {
    pub fn new(loader: impl ModelLoader) -> Self {
        Self::with_retry_backoff(loader, Duration::ZERO)
    }

    pub fn with_retry_backoff(loader: impl ModelLoader, retry_backoff: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                loader: Arc::new(loader),
                ready: OnceLock::new(),
                init: Arc::new(Mutex::new(InitState::default())),
                retry_backoff,
                attempts: AtomicU64::new(0),
            }),
        }
    }

    /// Return the shared model, constructing it on first use.
    ///
    /// The construction attempt runs in its own task holding the init lock, so a caller that
    /// is cancelled mid-construction does not release the lock early. Late arrivals wait on
    /// the lock and then observe the finished model.
    pub async fn get_or_init(&self) -> Result<Arc<dyn TextEncoder>, CommonError> {
        if let Some(model) = self.inner.ready.get() {
            return Ok(Arc::clone(model));
        }

        let guard = Arc::clone(&self.inner.init).lock_owned().await;
        let inner = Arc::clone(&self.inner);
        tokio::spawn(inner.initialize(guard))
            .await
            .map_err(|e| CommonError::ModelInit(format!("initialization task failed: {e}")))?
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.get().is_some()
    }

    pub fn status(&self) -> ModelStatus {
        if self.is_ready() {
            return ModelStatus::Ready;
        }
        match self.inner.init.try_lock() {
            Err(_) => ModelStatus::Initializing,
            Ok(state) if state.last_failure.is_some() => ModelStatus::Failed,
            Ok(_) => ModelStatus::Uninitialized,
        }
    }

    /// Number of construction attempts started so far.
    pub fn attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::SeqCst)
    }
}

impl Inner {
    async fn initialize(
        self: Arc<Self>,
        mut state: OwnedMutexGuard<InitState>,
    ) -> Result<Arc<dyn TextEncoder>, CommonError> {
        // Another caller may have finished while we waited for the lock.
        if let Some(model) = self.ready.get() {
            return Ok(Arc::clone(model));
        }

        if let Some(failure) = &state.last_failure {
            let elapsed = failure.at.elapsed();
            if elapsed < self.retry_backoff {
                let wait = self.retry_backoff - elapsed;
                return Err(CommonError::ModelInit(format!(
                    "{} (next attempt in ~{}ms)",
                    failure.message,
                    wait.as_millis()
                )));
            }
        }

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        info!(attempt, "loading embedding model");
        let started = Instant::now();

        let loader = Arc::clone(&self.loader);
        let result = match tokio::task::spawn_blocking(move || loader.load()).await {
            Ok(result) => result,
            Err(e) => Err(CommonError::ModelInit(format!(
                "spawn_blocking join error: {e}"
            ))),
        };

        match result {
            Ok(model) => {
                info!(
                    attempt,
                    model = model.model_name(),
                    dimension = model.dimension(),
                    elapsed_ms = started.elapsed().as_millis(),
                    "embedding model ready"
                );
                state.last_failure = None;
                let _ = self.ready.set(Arc::clone(&model));
                Ok(model)
            }
            Err(e) => {
                let message = match e {
                    CommonError::ModelInit(message) => message,
                    other => other.to_string(),
                };
                error!(attempt, error = %message, "embedding model failed to load");
                state.last_failure = Some(Failure {
                    at: Instant::now(),
                    message: message.clone(),
                });
                Err(CommonError::ModelInit(message))
            }
        }
    }
}
