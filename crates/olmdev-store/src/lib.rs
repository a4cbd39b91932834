//! olmdev durable store: transactional collections for device crypto state.
//!
//! This crate provides:
//! - Named collections for the account, pairwise sessions, inbound group
//!   sessions, withheld keys, the shared-history index and session problems
//! - Scoped read-only / read-write transactions with all-or-nothing commits
//! - A volatile backend and an encrypted single-file backend

pub mod backend;
pub mod collections;
pub mod error;
pub mod persistence;
pub mod records;
pub mod store;
pub mod transaction;

pub use backend::{MemoryBackend, StorageBackend};
pub use collections::{Collection, Collections};
pub use error::StoreError;
pub use persistence::EncryptedFileBackend;
pub use records::{
    DeviceRef, InboundGroupSessionRecord, SessionProblem, SessionRecord, WithheldRecord,
};
pub use store::CryptoStore;
pub use transaction::{StoredSession, Transaction, TxnMode};
