use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;

use crate::errors::StateError;

/// Shared, async-friendly handle to a synchronous state manager.
///
/// Store and file I/O are blocking, so `call` moves the work onto a
/// blocking thread and serializes access through a mutex.
pub struct StateHandle<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> Clone for StateHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> StateHandle<T> {
    pub fn new(manager: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(manager)),
        }
    }

    /// Run `f` with exclusive access on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R, StateError>
    where
        F: FnOnce(&mut T) -> Result<R, StateError> + Send + 'static,
        R: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = inner
                .lock()
                .map_err(|e| StateError::Persistence(anyhow!("state lock poisoned: {}", e)))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StateError::Persistence(anyhow!("state task panicked: {}", e)))?
    }

    /// Acquire the lock synchronously. Only for startup, reporting and tests;
    /// never from a hot async path.
    pub fn lock_sync(&self) -> Result<MutexGuard<'_, T>, StateError> {
        self.inner
            .lock()
            .map_err(|e| StateError::Persistence(anyhow!("state lock poisoned: {}", e)))
    }
}
