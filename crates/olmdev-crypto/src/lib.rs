//! olmdev cryptographic layer: per-device Olm and Megolm session management.
//!
//! This crate provides:
//! - The device account: identity keys, one-time and fallback key lifecycle
//! - Pairwise Olm sessions with per-peer negotiation tracking
//! - Outbound (in-memory) and inbound (persisted) Megolm group sessions
//! - Replay detection and withheld-key bookkeeping for group messages
//! - Export and import of device state and room keys
//!
//! Every mutation of persisted state runs inside one [`olmdev_store`]
//! transaction, so a failed operation never leaves partial state behind.

pub mod error;
pub mod export;
pub mod group;
pub mod identity;
pub mod inbound;
pub mod negotiation;
pub mod pickle;
pub mod session;
pub mod withheld;

use std::time::{SystemTime, UNIX_EPOCH};

pub use error::{Error, Result};
pub use export::{ExportedDevice, ExportedSession, MegolmSessionData};
pub use group::OutboundGroupSessionKey;
pub use identity::{InitOptions, OlmDevice};
pub use inbound::{DecryptedGroupMessage, InboundGroupSessionExtra, InboundGroupSessionKey};
pub use pickle::PickleKey;
pub use session::{select_session, InboundSession, OlmCiphertext, SessionInfo};
pub use withheld::{withheld_message, WithheldCode};

/// Largest plaintext, in UTF-8 bytes, accepted by either encryption path.
pub const MAX_PLAINTEXT_LENGTH: usize = 65536 * 3 / 4;

/// Pickle key used when the caller does not supply one.
pub const DEFAULT_PICKLE_KEY: &str = "DEFAULT_KEY";

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn check_payload_length(plaintext: &str) -> Result<()> {
    if plaintext.len() > MAX_PLAINTEXT_LENGTH {
        return Err(Error::PayloadTooLarge(plaintext.len()));
    }
    Ok(())
}
