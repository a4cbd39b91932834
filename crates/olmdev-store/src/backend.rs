use crate::collections::Collections;
use crate::error::StoreError;

/// Durable image of the store.
///
/// `persist` receives the complete snapshot a transaction is about to commit.
/// It must either make the whole snapshot durable or fail without side
/// effects visible to a later `load`.
pub trait StorageBackend: Send + Sync {
    fn load(&self) -> Result<Option<Collections>, StoreError>;
    fn persist(&self, data: &Collections) -> Result<(), StoreError>;
}

/// Keeps nothing beyond the process lifetime.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryBackend;

impl StorageBackend for MemoryBackend {
    fn load(&self) -> Result<Option<Collections>, StoreError> {
        Ok(None)
    }

    fn persist(&self, _data: &Collections) -> Result<(), StoreError> {
        Ok(())
    }
}
