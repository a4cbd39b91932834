use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task;
use tracing::{debug, trace};

use crate::backend::{MemoryBackend, StorageBackend};
use crate::collections::{Collection, Collections};
use crate::error::StoreError;
use crate::transaction::{Transaction, TxnMode};

/// Transactional store for the device's cryptographic state.
///
/// Read-only transactions share the lock; read-write transactions are
/// exclusive, so a read and its dependent write inside one callback can never
/// interleave with another writer.
pub struct CryptoStore {
    data: RwLock<Collections>,
    backend: Arc<dyn StorageBackend>,
}

impl CryptoStore {
    /// Open a store over `backend`, loading whatever it already holds.
    pub fn open(backend: impl StorageBackend + 'static) -> Result<Self, StoreError> {
        let data = backend.load()?.unwrap_or_default();
        Ok(Self {
            data: RwLock::new(data),
            backend: Arc::new(backend),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            data: RwLock::new(Collections::default()),
            backend: Arc::new(MemoryBackend),
        }
    }

    /// Run `f` inside a transaction over `scope`.
    ///
    /// Writes made through the [`Transaction`] are committed only when `f`
    /// returns `Ok` and the backend has persisted them. Any error, from `f`
    /// or the backend, leaves the store exactly as it was.
    pub async fn transaction<T, E, F>(
        &self,
        mode: TxnMode,
        scope: &[Collection],
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        match mode {
            TxnMode::ReadOnly => {
                let guard = self.data.read().await;
                let mut txn = Transaction::new(mode, scope, &guard);
                f(&mut txn)
            }
            TxnMode::ReadWrite => {
                let mut guard = self.data.write().await;
                let (result, staged) = {
                    let mut txn = Transaction::new(mode, scope, &guard);
                    let result = f(&mut txn);
                    (result, txn.into_staged())
                };

                let value = match result {
                    Ok(value) => value,
                    Err(e) => {
                        trace!(?scope, "transaction aborted");
                        return Err(e);
                    }
                };

                if let Some(next) = staged {
                    // File I/O runs on the blocking pool with the write lock
                    // held. A caller dropped mid-commit may still reach disk.
                    let backend = Arc::clone(&self.backend);
                    let next = task::spawn_blocking(move || backend.persist(&next).map(|()| next))
                        .await
                        .map_err(StoreError::from)??;
                    *guard = next;
                    debug!(?scope, "transaction committed");
                }
                Ok(value)
            }
        }
    }
}
