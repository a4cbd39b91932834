use thiserror::Error;

use crate::collections::Collection;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("collection {0} is not part of this transaction")]
    OutOfScope(Collection),

    #[error("cannot write to {0} inside a read-only transaction")]
    ReadOnly(Collection),

    #[error("invalid store file: {0}")]
    Format(&'static str),

    #[error("incorrect passphrase or corrupted store file")]
    Decrypt,

    #[error("store encryption failed")]
    Encrypt,

    #[error("RNG failed")]
    Rng,

    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("commit task failed: {0}")]
    Commit(#[from] tokio::task::JoinError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_scope_names_collection() {
        let e = StoreError::OutOfScope(Collection::InboundGroupSessions);
        assert!(e.to_string().contains("inbound_group_sessions"));
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let store_err: StoreError = io_err.into();
        assert!(store_err.to_string().contains("denied"));
    }
}
