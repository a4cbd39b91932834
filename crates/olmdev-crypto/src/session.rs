//! Pairwise Olm sessions with other devices.
//!
//! Sessions are stored per peer identity key. A peer may have several; the
//! one used for sending is the one that most recently received a message.

use olmdev_store::{Collection, DeviceRef, SessionProblem, SessionRecord, TxnMode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use vodozemac::olm::{InboundCreationResult, OlmMessage, SessionConfig};
use vodozemac::{base64_decode, base64_encode, Curve25519PublicKey};

use crate::error::{Error, Result};
use crate::identity::OlmDevice;
use crate::{check_payload_length, now_ms};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    /// Whether the peer has answered, i.e. we are past the pre-key stage.
    pub has_received_message: bool,
    pub last_received_message_ts: u64,
}

/// An encrypted Olm message in its `{ type, body }` wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlmCiphertext {
    #[serde(rename = "type")]
    pub message_type: usize,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundSession {
    pub payload: String,
    pub session_id: String,
}

/// Pick the session to send with: greatest timestamp, ties broken by the
/// smallest session id.
pub fn select_session<'a, I>(candidates: I) -> Option<&'a str>
where
    I: IntoIterator<Item = (&'a str, u64)>,
{
    candidates
        .into_iter()
        .fold(None, |best: Option<(&'a str, u64)>, (id, ts)| match best {
            Some((best_id, best_ts)) if best_ts > ts || (best_ts == ts && best_id <= id) => best,
            _ => Some((id, ts)),
        })
        .map(|(id, _)| id)
}

fn handshake_key(peer: &str, key: &str) -> Result<Curve25519PublicKey> {
    Curve25519PublicKey::from_base64(key).map_err(|e| Error::Handshake {
        peer: peer.to_owned(),
        reason: e.to_string(),
    })
}

/// Olm bodies travel as unpadded base64 of the wire bytes.
fn decode_message(message_type: usize, ciphertext: &str) -> Result<OlmMessage> {
    let body = base64_decode(ciphertext).map_err(|e| Error::MalformedBody(e.to_string()))?;
    Ok(OlmMessage::from_parts(message_type, &body)?)
}

impl OlmDevice {
    /// Start a session toward a peer from its identity key and one of its
    /// one-time keys. The new session counts as just used.
    pub async fn create_outbound_session(
        &self,
        their_identity_key: &str,
        their_one_time_key: &str,
    ) -> Result<String> {
        let identity_key = handshake_key(their_identity_key, their_identity_key)?;
        let one_time_key = handshake_key(their_identity_key, their_one_time_key)?;

        let session_id = self
            .store
            .transaction(
                TxnMode::ReadWrite,
                &[Collection::Account, Collection::Sessions],
                |txn| -> Result<String> {
                    let account = self.load_account(txn)?;
                    let session = account.create_outbound_session(
                        SessionConfig::version_1(),
                        identity_key,
                        one_time_key,
                    );
                    let session_id = session.session_id();
                    self.save_account(txn, &account)?;

                    let record = SessionRecord {
                        pickle: self.pickle_key.pickle_session(&session),
                        last_received_message_ts: now_ms(),
                    };
                    txn.store_session(their_identity_key, &session_id, record)?;
                    Ok(session_id)
                },
            )
            .await?;

        info!(peer = their_identity_key, %session_id, "created outbound olm session");
        Ok(session_id)
    }

    /// Accept a session from a peer's pre-key message. The one-time key the
    /// peer used is removed from the account in the same commit.
    pub async fn create_inbound_session(
        &self,
        their_identity_key: &str,
        message_type: usize,
        ciphertext: &str,
    ) -> Result<InboundSession> {
        if message_type != 0 {
            warn!(
                peer = their_identity_key,
                message_type, "refusing to create inbound session from a non pre-key message"
            );
            return Err(Error::InvalidMessageType(message_type));
        }
        let identity_key = handshake_key(their_identity_key, their_identity_key)?;
        let OlmMessage::PreKey(message) = decode_message(message_type, ciphertext)? else {
            return Err(Error::InvalidMessageType(message_type));
        };

        let inbound = self
            .store
            .transaction(
                TxnMode::ReadWrite,
                &[Collection::Account, Collection::Sessions],
                |txn| -> Result<InboundSession> {
                    let mut account = self.load_account(txn)?;
                    let InboundCreationResult { session, plaintext } = account
                        .create_inbound_session(identity_key, &message)
                        .map_err(|e| Error::Handshake {
                            peer: their_identity_key.to_owned(),
                            reason: e.to_string(),
                        })?;
                    let payload = String::from_utf8(plaintext)?;
                    let session_id = session.session_id();
                    self.save_account(txn, &account)?;

                    let record = SessionRecord {
                        pickle: self.pickle_key.pickle_session(&session),
                        last_received_message_ts: now_ms(),
                    };
                    txn.store_session(their_identity_key, &session_id, record)?;
                    Ok(InboundSession {
                        payload,
                        session_id,
                    })
                },
            )
            .await?;

        info!(
            peer = their_identity_key,
            session_id = %inbound.session_id,
            "created inbound olm session"
        );
        Ok(inbound)
    }

    /// Session ids known for a peer, ascending. Waits for a running
    /// negotiation toward the peer first.
    pub async fn get_session_ids_for_device(&self, their_identity_key: &str) -> Result<Vec<String>> {
        let _ = self.negotiations.wait(their_identity_key).await;
        self.store
            .transaction(TxnMode::ReadOnly, &[Collection::Sessions], |txn| {
                Ok(txn
                    .sessions_for_device(their_identity_key)?
                    .into_iter()
                    .map(|(session_id, _)| session_id.to_owned())
                    .collect())
            })
            .await
    }

    /// Details of every session with a peer, ascending by session id.
    ///
    /// Unless `no_wait` is set, a running negotiation toward the peer is
    /// awaited first; if it fails, the persisted sessions are returned as is.
    /// Only the negotiation owner itself should pass `no_wait`.
    pub async fn get_session_info_for_device(
        &self,
        their_identity_key: &str,
        no_wait: bool,
    ) -> Result<Vec<SessionInfo>> {
        if !no_wait {
            let _ = self.negotiations.wait(their_identity_key).await;
        }
        self.store
            .transaction(TxnMode::ReadOnly, &[Collection::Sessions], |txn| {
                txn.sessions_for_device(their_identity_key)?
                    .into_iter()
                    .map(|(session_id, record)| -> Result<SessionInfo> {
                        let session = self.pickle_key.unpickle_session(&record.pickle)?;
                        Ok(SessionInfo {
                            session_id: session_id.to_owned(),
                            has_received_message: session.has_received_message(),
                            last_received_message_ts: record.last_received_message_ts,
                        })
                    })
                    .collect()
            })
            .await
    }

    /// The session to encrypt with for a peer, if there is one.
    pub async fn get_session_id_for_device(
        &self,
        their_identity_key: &str,
        no_wait: bool,
    ) -> Result<Option<String>> {
        let infos = self
            .get_session_info_for_device(their_identity_key, no_wait)
            .await?;
        Ok(select_session(
            infos
                .iter()
                .map(|info| (info.session_id.as_str(), info.last_received_message_ts)),
        )
        .map(str::to_owned))
    }

    pub async fn encrypt_message(
        &self,
        their_identity_key: &str,
        session_id: &str,
        plaintext: &str,
    ) -> Result<OlmCiphertext> {
        check_payload_length(plaintext)?;

        self.store
            .transaction(TxnMode::ReadWrite, &[Collection::Sessions], |txn| {
                let record = txn
                    .session(their_identity_key, session_id)?
                    .ok_or_else(|| Error::UnknownSession(session_id.to_owned()))?;
                let last_received_message_ts = record.last_received_message_ts;
                let mut session = self.pickle_key.unpickle_session(&record.pickle)?;

                let message = session.encrypt(plaintext);
                debug!(peer = their_identity_key, session_id, "encrypted olm message");

                let record = SessionRecord {
                    pickle: self.pickle_key.pickle_session(&session),
                    last_received_message_ts,
                };
                txn.store_session(their_identity_key, session_id, record)?;

                let (message_type, body) = message.to_parts();
                Ok(OlmCiphertext {
                    message_type,
                    body: base64_encode(body),
                })
            })
            .await
    }

    pub async fn decrypt_message(
        &self,
        their_identity_key: &str,
        session_id: &str,
        message_type: usize,
        ciphertext: &str,
    ) -> Result<String> {
        let message = decode_message(message_type, ciphertext)?;

        self.store
            .transaction(TxnMode::ReadWrite, &[Collection::Sessions], |txn| {
                let record = txn
                    .session(their_identity_key, session_id)?
                    .ok_or_else(|| Error::UnknownSession(session_id.to_owned()))?;
                let mut session = self.pickle_key.unpickle_session(&record.pickle)?;

                let plaintext = String::from_utf8(session.decrypt(&message)?)?;
                debug!(peer = their_identity_key, session_id, "decrypted olm message");

                let record = SessionRecord {
                    pickle: self.pickle_key.pickle_session(&session),
                    last_received_message_ts: now_ms(),
                };
                txn.store_session(their_identity_key, session_id, record)?;
                Ok(plaintext)
            })
            .await
    }

    /// Whether `ciphertext` is a pre-key message belonging to `session_id`.
    /// Never changes any state.
    pub async fn session_matches_message(
        &self,
        their_identity_key: &str,
        session_id: &str,
        message_type: usize,
        ciphertext: &str,
    ) -> Result<bool> {
        if message_type != 0 {
            return Ok(false);
        }
        let Ok(OlmMessage::PreKey(message)) = decode_message(message_type, ciphertext) else {
            return Ok(false);
        };

        self.store
            .transaction(TxnMode::ReadOnly, &[Collection::Sessions], |txn| {
                let Some(record) = txn.session(their_identity_key, session_id)? else {
                    return Ok(false);
                };
                let session = self.pickle_key.unpickle_session(&record.pickle)?;
                Ok(session.session_id() == message.session_id())
            })
            .await
    }

    // ── Session problems ────────────────────────────────────────────────

    pub async fn record_session_problem(
        &self,
        their_identity_key: &str,
        kind: &str,
        fixed: bool,
    ) -> Result<()> {
        let problem = SessionProblem {
            kind: kind.to_owned(),
            fixed,
            time: now_ms(),
        };
        self.store
            .transaction(TxnMode::ReadWrite, &[Collection::SessionProblems], |txn| {
                txn.store_session_problem(their_identity_key, problem)
                    .map_err(Error::from)
            })
            .await?;
        debug!(peer = their_identity_key, kind, fixed, "recorded session problem");
        Ok(())
    }

    /// A problem with the peer's sessions recorded after `since` (ms), or
    /// the latest one if it is still unfixed.
    pub async fn recent_session_problem(
        &self,
        their_identity_key: &str,
        since: u64,
    ) -> Result<Option<SessionProblem>> {
        self.store
            .transaction(TxnMode::ReadOnly, &[Collection::SessionProblems], |txn| {
                txn.session_problem_since(their_identity_key, since)
                    .map_err(Error::from)
            })
            .await
    }

    /// Devices that have not yet been told about a session problem. The
    /// returned devices are marked as told.
    pub async fn filter_devices_with_unresolved_problems(
        &self,
        devices: Vec<DeviceRef>,
    ) -> Result<Vec<DeviceRef>> {
        self.store
            .transaction(TxnMode::ReadWrite, &[Collection::SessionProblems], |txn| {
                txn.filter_out_notified_error_devices(devices)
                    .map_err(Error::from)
            })
            .await
    }
}
