//! One-shot values that many tasks can wait on, and lazily derived
//! computations chained off them.
//!
//! A [`Completion`] starts pending and is resolved exactly once through its
//! [`Resolver`]. Waiting never changes the container: a waiter that gives up
//! (cancellation or deadline) leaves it pending for everybody else.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CompletionError {
    #[error("cancelled while waiting")]
    Cancelled,
    #[error("not ready after {0:?}")]
    TimedOut(Duration),
    #[error("producer went away without providing a value")]
    Abandoned,
    #[error("{0:#}")]
    Failed(Arc<anyhow::Error>),
}

impl CompletionError {
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        Self::Failed(Arc::new(err.into()))
    }

    /// True when the waiter gave up, as opposed to the value having failed.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::Cancelled | Self::TimedOut(_))
    }
}

type Outcome<T> = Option<Result<T, CompletionError>>;
type Starter = Box<dyn FnOnce() + Send>;

struct Shared<T> {
    state: watch::Sender<Outcome<T>>,
    starter: Mutex<Option<Starter>>,
}

/// Read side of a one-shot value. Cheap to clone.
pub struct Completion<T> {
    shared: Arc<Shared<T>>,
}

/// Write side of a one-shot value. Dropping it without providing a value
/// resolves the completion as [`CompletionError::Abandoned`].
pub struct Resolver<T> {
    shared: Option<Arc<Shared<T>>>,
}

/// Creates a pending completion and the handle that resolves it.
pub fn pending<T>() -> (Resolver<T>, Completion<T>) {
    let (state, _) = watch::channel(None);
    let shared = Arc::new(Shared {
        state,
        starter: Mutex::new(None),
    });
    (
        Resolver {
            shared: Some(shared.clone()),
        },
        Completion { shared },
    )
}

impl<T> Resolver<T> {
    pub fn provide(self, result: anyhow::Result<T>) {
        self.settle(result.map_err(CompletionError::failed));
    }

    fn settle(mut self, outcome: Result<T, CompletionError>) {
        self.send(outcome);
    }

    fn send(&mut self, outcome: Result<T, CompletionError>) {
        if let Some(shared) = self.shared.take() {
            shared.state.send_replace(Some(outcome));
        }
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        if self.shared.is_some() {
            warn!("Completion resolver dropped without a value");
            self.send(Err(CompletionError::Abandoned));
        }
    }
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.shared.state.borrow() {
            None => "pending",
            Some(Ok(_)) => "ready",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("Completion").field("state", &state).finish()
    }
}

impl<T> Completion<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// A completion that is already resolved.
    pub fn resolved(result: anyhow::Result<T>) -> Self {
        let (resolver, completion) = pending();
        resolver.provide(result);
        completion
    }

    /// Waits for the value with no bound other than the caller dropping the
    /// returned future.
    pub async fn wait(&self) -> Result<T, CompletionError> {
        self.start();

        let mut state = self.shared.state.subscribe();
        let outcome = state
            .wait_for(Option::is_some)
            .await
            .map_err(|_| CompletionError::Abandoned)?;
        match &*outcome {
            Some(result) => result.clone(),
            None => Err(CompletionError::Abandoned),
        }
    }

    /// Waits for the value unless `cancel` fires first.
    pub async fn wait_until(&self, cancel: &CancellationToken) -> Result<T, CompletionError> {
        tokio::select! {
            biased;
            result = self.wait() => result,
            _ = cancel.cancelled() => Err(CompletionError::Cancelled),
        }
    }

    /// Waits for the value for at most `timeout`.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<T, CompletionError> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .unwrap_or(Err(CompletionError::TimedOut(timeout)))
    }

    /// The outcome if already resolved. Does not trigger lazy computations.
    pub fn try_get(&self) -> Option<Result<T, CompletionError>> {
        self.shared.state.borrow().clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.shared.state.borrow().is_some()
    }

    /// Returns a completion resolved with `transform(value)` once this one
    /// succeeds. The transform runs once, on the blocking pool, as soon as the
    /// value is available. Failures are passed through without running it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn derive<U, F>(&self, transform: F) -> Completion<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> anyhow::Result<U> + Send + 'static,
    {
        let (resolver, derived) = pending();
        tokio::spawn(self.clone().feed(resolver, transform));
        derived
    }

    /// Like [`Completion::derive`], but nothing happens until somebody first
    /// waits on the derived completion.
    pub fn derive_lazy<U, F>(&self, transform: F) -> Completion<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> anyhow::Result<U> + Send + 'static,
    {
        let (resolver, derived) = pending();
        let source = self.clone();
        // The starter owns the resolver until first demand.
        *derived
            .shared
            .starter
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(move || {
            tokio::spawn(source.feed(resolver, transform));
        }));
        derived
    }

    fn start(&self) {
        let starter = self
            .shared
            .starter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(start) = starter {
            start();
        }
    }

    async fn feed<U, F>(self, resolver: Resolver<U>, transform: F)
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> anyhow::Result<U> + Send + 'static,
    {
        let outcome = match self.wait().await {
            Ok(value) => match tokio::task::spawn_blocking(move || transform(value)).await {
                Ok(result) => result.map_err(CompletionError::failed),
                Err(err) => Err(CompletionError::failed(anyhow::anyhow!(
                    "derived computation did not finish: {err}"
                ))),
            },
            Err(err) => Err(err),
        };
        resolver.settle(outcome);
    }
}
