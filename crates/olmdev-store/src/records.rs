//! Value types held in the store collections.
//!
//! Cryptographic state is always kept as an opaque pickle string; the store
//! never sees key material in the clear.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A pairwise session as persisted for one peer device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Encrypted session pickle.
    pub pickle: String,
    /// Milliseconds since the epoch of the last successful decryption.
    /// Outbound sessions are stamped at creation so they are selectable at once.
    pub last_received_message_ts: u64,
}

/// An inbound group session together with its room binding and provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundGroupSessionRecord {
    /// Room the session was first stored for. Never rewritten.
    pub room_id: String,
    /// Encrypted session pickle.
    pub pickle: String,
    /// Signing keys the sender claims to own, e.g. `ed25519 -> key`.
    pub keys_claimed: BTreeMap<String, String>,
    /// Curve25519 keys of the devices that forwarded the session, oldest first.
    pub forwarding_curve25519_key_chain: Vec<String>,
    pub untrusted: bool,
    pub shared_history: bool,
}

/// Why a sender chose not to share a group session key with us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithheldRecord {
    pub code: String,
    pub reason: Option<String>,
}

/// One entry of a peer device's session problem history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionProblem {
    /// Free-form problem kind, e.g. `no_olm` or `wedged`.
    pub kind: String,
    pub fixed: bool,
    /// Milliseconds since the epoch.
    pub time: u64,
}

/// A remote device, addressed by owner and device id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceRef {
    pub user_id: String,
    pub device_id: String,
}

impl DeviceRef {
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
        }
    }
}
