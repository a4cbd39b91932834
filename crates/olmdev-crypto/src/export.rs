//! Portable schemas for moving a device or its room keys elsewhere.

use std::collections::BTreeMap;

use olmdev_store::{Collection, TxnMode};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::identity::OlmDevice;

/// Account and pairwise sessions of a device, sealed with `pickle_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedDevice {
    pub pickle_key: String,
    pub pickled_account: String,
    #[serde(default)]
    pub sessions: Vec<ExportedSession>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedSession {
    /// Curve25519 identity key of the peer device.
    pub device_key: String,
    pub session_id: String,
    /// Session pickle.
    pub session: String,
    #[serde(default)]
    pub last_received_message_ts: u64,
}

/// One room key in the portable export format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MegolmSessionData {
    pub sender_key: String,
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
    #[serde(default)]
    pub sender_claimed_keys: BTreeMap<String, String>,
    pub room_id: String,
    pub session_id: String,
    /// Base64 session key in export format.
    pub session_key: String,
    pub first_known_index: u32,
    #[serde(
        default,
        rename = "org.matrix.msc3061.shared_history",
        alias = "shared_history"
    )]
    pub shared_history: bool,
}

impl OlmDevice {
    /// Snapshot the account and every pairwise session for migration to
    /// another device. Pass the result to [`OlmDevice::initialize`] there.
    pub async fn export_device(&self) -> Result<ExportedDevice> {
        let exported = self
            .store
            .transaction(
                TxnMode::ReadOnly,
                &[Collection::Account, Collection::Sessions],
                |txn| -> Result<ExportedDevice> {
                    let pickled_account = txn.account()?.ok_or(Error::MissingAccount)?.to_owned();
                    let sessions = txn
                        .all_sessions()?
                        .into_iter()
                        .map(|stored| ExportedSession {
                            device_key: stored.device_key,
                            session_id: stored.session_id,
                            session: stored.record.pickle,
                            last_received_message_ts: stored.record.last_received_message_ts,
                        })
                        .collect();
                    Ok(ExportedDevice {
                        pickle_key: self.pickle_key.passphrase().to_owned(),
                        pickled_account,
                        sessions,
                    })
                },
            )
            .await?;
        info!(sessions = exported.sessions.len(), "exported device");
        Ok(exported)
    }
}
