//! Inbound Megolm sessions: storage, upgrades, decryption and key sharing.
//!
//! A stored session is bound to the room it was first received for. Group
//! messages claiming another room are rejected, which stops a server from
//! replaying a session's messages into a different room.

use std::collections::BTreeMap;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use olmdev_store::{
    Collection, InboundGroupSessionRecord, Transaction, TxnMode, WithheldRecord,
};
use serde::Serialize;
use tracing::{debug, info, warn};
use vodozemac::megolm::{
    DecryptionError, ExportedSessionKey, InboundGroupSession, MegolmMessage, SessionConfig,
    SessionKey,
};

use crate::error::{Error, Result};
use crate::export::MegolmSessionData;
use crate::identity::OlmDevice;
use crate::withheld::{withheld_message, WithheldCode};

/// Message indices seen per `(sender key, session id, index)`, with the event
/// id and timestamp they were first decrypted for. Process lifetime only.
pub(crate) type DecryptedIndex = DashMap<(String, String, u32), (String, u64)>;

const INBOUND_SCOPE: &[Collection] = &[
    Collection::InboundGroupSessions,
    Collection::InboundGroupSessionsWithheld,
];

/// Options stored alongside a new inbound group session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboundGroupSessionExtra {
    /// The key did not come straight from its sender, or was not verified.
    pub untrusted: bool,
    /// The sender allows the key to be shared with future room members.
    pub shared_history: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecryptedGroupMessage {
    pub plaintext: String,
    pub sender_key: String,
    pub forwarding_curve25519_key_chain: Vec<String>,
    pub keys_claimed: BTreeMap<String, String>,
    pub untrusted: bool,
}

/// An inbound session key exported for forwarding to another device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundGroupSessionKey {
    pub chain_index: u32,
    /// Base64 Megolm session key in export format.
    pub key: String,
    pub forwarding_curve25519_key_chain: Vec<String>,
    pub sender_claimed_ed25519_key: Option<String>,
    pub shared_history: bool,
}

fn withheld_error(record: &WithheldRecord, sender_key: &str, session_id: &str) -> Error {
    Error::KeyWithheld {
        code: WithheldCode::from_code(&record.code),
        reason: withheld_message(record),
        session: format!("{sender_key}|{session_id}"),
    }
}

/// The session stored for `(sender_key, session_id)`, checked against `room_id`.
fn bound_session<'t>(
    txn: &'t Transaction<'_>,
    room_id: &str,
    sender_key: &str,
    session_id: &str,
) -> Result<Option<&'t InboundGroupSessionRecord>> {
    let Some(record) = txn.inbound_group_session(sender_key, session_id)? else {
        return Ok(None);
    };
    if record.room_id != room_id {
        warn!(
            sender_key,
            session_id,
            expected = %record.room_id,
            actual = room_id,
            "inbound group session used with the wrong room"
        );
        return Err(Error::RoomBindingViolation {
            expected: record.room_id.clone(),
            actual: room_id.to_owned(),
        });
    }
    Ok(Some(record))
}

fn build_session(session_key: &str, export_format: bool) -> Result<InboundGroupSession> {
    let config = SessionConfig::version_1();
    Ok(if export_format {
        InboundGroupSession::import(&ExportedSessionKey::from_base64(session_key)?, config)
    } else {
        InboundGroupSession::new(&SessionKey::from_base64(session_key)?, config)
    })
}

impl OlmDevice {
    /// Store a group session key received for `room_id`.
    ///
    /// An already stored copy is only replaced by one that can decrypt more
    /// messages, or by a trusted copy of an untrusted one at the same index.
    /// Returns whether the key was stored.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_inbound_group_session(
        &self,
        room_id: &str,
        sender_key: &str,
        forwarding_curve25519_key_chain: &[String],
        session_id: &str,
        session_key: &str,
        keys_claimed: &BTreeMap<String, String>,
        export_format: bool,
        extra: InboundGroupSessionExtra,
    ) -> Result<bool> {
        let session = build_session(session_key, export_format)?;
        if session.session_id() != session_id {
            warn!(sender_key, session_id, "mismatched group session id");
            return Err(Error::SessionIdMismatch {
                sender_key: sender_key.to_owned(),
                expected: session_id.to_owned(),
                actual: session.session_id(),
            });
        }
        let first_known_index = session.first_known_index();

        self.store
            .transaction(
                TxnMode::ReadWrite,
                &[
                    Collection::InboundGroupSessions,
                    Collection::InboundGroupSessionsWithheld,
                    Collection::SharedHistoryInboundGroupSessions,
                ],
                |txn| -> Result<bool> {
                    let existing = bound_session(txn, room_id, sender_key, session_id)?.cloned();
                    if let Some(existing) = &existing {
                        let existing_index = self
                            .pickle_key
                            .unpickle_inbound_group_session(&existing.pickle)?
                            .first_known_index();
                        let trust_upgrade = existing_index == first_known_index
                            && !extra.untrusted
                            && existing.untrusted;
                        if existing_index <= first_known_index && !trust_upgrade {
                            debug!(sender_key, session_id, "keeping existing megolm session");
                            return Ok(false);
                        }
                    }

                    info!(
                        room_id,
                        sender_key,
                        session_id,
                        first_known_index,
                        "storing megolm session"
                    );
                    let record = InboundGroupSessionRecord {
                        room_id: room_id.to_owned(),
                        pickle: self.pickle_key.pickle_inbound_group_session(&session),
                        keys_claimed: keys_claimed.clone(),
                        forwarding_curve25519_key_chain: forwarding_curve25519_key_chain.to_vec(),
                        untrusted: extra.untrusted,
                        shared_history: extra.shared_history,
                    };
                    txn.store_inbound_group_session(sender_key, session_id, record)?;

                    if existing.is_none() && extra.shared_history {
                        txn.add_shared_history_session(room_id, sender_key, session_id)?;
                    }
                    Ok(true)
                },
            )
            .await
    }

    /// Remember why the sender did not share a session with us.
    pub async fn add_inbound_group_session_withheld(
        &self,
        room_id: &str,
        sender_key: &str,
        session_id: &str,
        code: &str,
        reason: Option<&str>,
    ) -> Result<()> {
        let record = WithheldRecord {
            code: code.to_owned(),
            reason: reason.map(str::to_owned),
        };
        self.store
            .transaction(
                TxnMode::ReadWrite,
                &[Collection::InboundGroupSessionsWithheld],
                |txn| {
                    txn.store_withheld(room_id, sender_key, session_id, record)
                        .map_err(Error::from)
                },
            )
            .await?;
        debug!(room_id, sender_key, session_id, code, "recorded withheld group session");
        Ok(())
    }

    /// Decrypt a group message. Returns `None` when the session is unknown
    /// and no withheld notice explains why.
    ///
    /// A message index may only be decrypted again for the same event id and
    /// timestamp; anything else is treated as a replay.
    pub async fn decrypt_group_message(
        &self,
        room_id: &str,
        sender_key: &str,
        session_id: &str,
        body: &str,
        event_id: &str,
        timestamp: u64,
    ) -> Result<Option<DecryptedGroupMessage>> {
        self.store
            .transaction(TxnMode::ReadWrite, INBOUND_SCOPE, |txn| {
                let withheld = txn.withheld(room_id, sender_key, session_id)?.cloned();
                let Some(record) = bound_session(txn, room_id, sender_key, session_id)?.cloned()
                else {
                    return match withheld {
                        Some(withheld) => Err(withheld_error(&withheld, sender_key, session_id)),
                        None => Ok(None),
                    };
                };

                let message = MegolmMessage::from_base64(body)?;
                let mut session = self.pickle_key.unpickle_inbound_group_session(&record.pickle)?;
                let decrypted = match (session.decrypt(&message), &withheld) {
                    (Ok(decrypted), _) => decrypted,
                    (Err(DecryptionError::UnknownMessageIndex(..)), Some(withheld)) => {
                        return Err(withheld_error(withheld, sender_key, session_id));
                    }
                    (Err(e), _) => return Err(e.into()),
                };
                let plaintext = String::from_utf8(decrypted.plaintext)?;
                self.check_replay(sender_key, session_id, decrypted.message_index, event_id, timestamp)?;

                let keys_claimed = record.keys_claimed.clone();
                let forwarding_curve25519_key_chain = record.forwarding_curve25519_key_chain.clone();
                let untrusted = record.untrusted;
                txn.store_inbound_group_session(
                    sender_key,
                    session_id,
                    InboundGroupSessionRecord {
                        pickle: self.pickle_key.pickle_inbound_group_session(&session),
                        ..record
                    },
                )?;

                debug!(
                    room_id,
                    sender_key,
                    session_id,
                    message_index = decrypted.message_index,
                    "decrypted group message"
                );
                Ok(Some(DecryptedGroupMessage {
                    plaintext,
                    sender_key: sender_key.to_owned(),
                    forwarding_curve25519_key_chain,
                    keys_claimed,
                    untrusted,
                }))
            })
            .await
    }

    fn check_replay(
        &self,
        sender_key: &str,
        session_id: &str,
        message_index: u32,
        event_id: &str,
        timestamp: u64,
    ) -> Result<()> {
        let key = (sender_key.to_owned(), session_id.to_owned(), message_index);
        match self.decrypted_indices.entry(key) {
            Entry::Occupied(seen) => {
                let (seen_event, seen_timestamp) = seen.get();
                if seen_event != event_id || *seen_timestamp != timestamp {
                    warn!(
                        sender_key,
                        session_id, message_index, event_id, "duplicate megolm message index"
                    );
                    return Err(Error::ReplayDetected {
                        sender_key: sender_key.to_owned(),
                        session_id: session_id.to_owned(),
                        message_index,
                    });
                }
            }
            Entry::Vacant(slot) => {
                slot.insert((event_id.to_owned(), timestamp));
            }
        }
        Ok(())
    }

    /// Whether we hold the key for a session in `room_id`. A session bound to
    /// another room counts as missing.
    pub async fn has_inbound_session_keys(
        &self,
        room_id: &str,
        sender_key: &str,
        session_id: &str,
    ) -> Result<bool> {
        self.store
            .transaction(TxnMode::ReadOnly, INBOUND_SCOPE, |txn| {
                let Some(record) = txn.inbound_group_session(sender_key, session_id)? else {
                    return Ok(false);
                };
                if record.room_id != room_id {
                    warn!(
                        sender_key,
                        session_id,
                        expected = %record.room_id,
                        actual = room_id,
                        "requested keys for inbound group session with incorrect room"
                    );
                    return Ok(false);
                }
                Ok(true)
            })
            .await
    }

    /// Export a session key for sharing, at `chain_index` or by default at
    /// the first index we know.
    pub async fn get_inbound_group_session_key(
        &self,
        room_id: &str,
        sender_key: &str,
        session_id: &str,
        chain_index: Option<u32>,
    ) -> Result<Option<InboundGroupSessionKey>> {
        self.store
            .transaction(TxnMode::ReadOnly, INBOUND_SCOPE, |txn| {
                let Some(record) = bound_session(txn, room_id, sender_key, session_id)? else {
                    return Ok(None);
                };
                let mut session = self.pickle_key.unpickle_inbound_group_session(&record.pickle)?;
                let first_known = session.first_known_index();
                let chain_index = chain_index.unwrap_or(first_known);
                let key = session
                    .export_at(chain_index)
                    .ok_or(Error::ChainIndexTooLow {
                        requested: chain_index,
                        first_known,
                    })?;

                Ok(Some(InboundGroupSessionKey {
                    chain_index,
                    key: key.to_base64(),
                    forwarding_curve25519_key_chain: record
                        .forwarding_curve25519_key_chain
                        .clone(),
                    sender_claimed_ed25519_key: record.keys_claimed.get("ed25519").cloned(),
                    shared_history: record.shared_history,
                }))
            })
            .await
    }

    /// A stored session in the portable room key format.
    pub fn export_inbound_group_session(
        &self,
        sender_key: &str,
        session_id: &str,
        record: &InboundGroupSessionRecord,
    ) -> Result<MegolmSessionData> {
        let mut session = self.pickle_key.unpickle_inbound_group_session(&record.pickle)?;
        let first_known_index = session.first_known_index();
        let session_key = session
            .export_at(first_known_index)
            .ok_or(Error::ChainIndexTooLow {
                requested: first_known_index,
                first_known: first_known_index,
            })?;

        Ok(MegolmSessionData {
            sender_key: sender_key.to_owned(),
            forwarding_curve25519_key_chain: record.forwarding_curve25519_key_chain.clone(),
            sender_claimed_keys: record.keys_claimed.clone(),
            room_id: record.room_id.clone(),
            session_id: session_id.to_owned(),
            session_key: session_key.to_base64(),
            first_known_index,
            shared_history: record.shared_history,
        })
    }

    /// Import a room key exported by [`export_inbound_group_session`]. Keys
    /// that travelled through other devices are always untrusted.
    ///
    /// [`export_inbound_group_session`]: Self::export_inbound_group_session
    pub async fn import_inbound_group_session(
        &self,
        data: &MegolmSessionData,
        untrusted: bool,
    ) -> Result<bool> {
        let extra = InboundGroupSessionExtra {
            untrusted: untrusted || !data.forwarding_curve25519_key_chain.is_empty(),
            shared_history: data.shared_history,
        };
        self.add_inbound_group_session(
            &data.room_id,
            &data.sender_key,
            &data.forwarding_curve25519_key_chain,
            &data.session_id,
            &data.session_key,
            &data.sender_claimed_keys,
            true,
            extra,
        )
        .await
    }

    /// Every stored inbound group session in the portable room key format.
    pub async fn export_room_keys(&self) -> Result<Vec<MegolmSessionData>> {
        self.store
            .transaction(
                TxnMode::ReadOnly,
                &[Collection::InboundGroupSessions],
                |txn| {
                    txn.all_inbound_group_sessions()?
                        .into_iter()
                        .map(|(sender_key, session_id, record)| {
                            self.export_inbound_group_session(sender_key, session_id, record)
                        })
                        .collect()
                },
            )
            .await
    }

    /// Sessions in `room_id` whose keys may be shared with new members, as
    /// `(sender key, session id)`.
    pub async fn get_shared_history_inbound_group_sessions(
        &self,
        room_id: &str,
    ) -> Result<Vec<(String, String)>> {
        self.store
            .transaction(
                TxnMode::ReadOnly,
                &[Collection::SharedHistoryInboundGroupSessions],
                |txn| txn.shared_history_sessions(room_id).map_err(Error::from),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOM: &str = "!room:example.org";

    struct Sender {
        device: OlmDevice,
        session_id: String,
    }

    impl Sender {
        async fn new() -> Self {
            let device = OlmDevice::in_memory().await;
            let session_id = device.create_outbound_group_session();
            Self { device, session_id }
        }

        fn key(&self) -> String {
            self.device
                .get_outbound_group_session_key(&self.session_id)
                .unwrap()
                .key
        }

        fn encrypt(&self, plaintext: &str) -> String {
            self.device
                .encrypt_group_message(&self.session_id, plaintext)
                .unwrap()
        }

        fn sender_key(&self) -> &str {
            self.device.curve25519_key()
        }
    }

    fn claimed(sender: &Sender) -> BTreeMap<String, String> {
        BTreeMap::from([("ed25519".to_string(), sender.device.ed25519_key().to_string())])
    }

    async fn add(
        receiver: &OlmDevice,
        room_id: &str,
        sender: &Sender,
        key: &str,
        extra: InboundGroupSessionExtra,
    ) -> Result<bool> {
        receiver
            .add_inbound_group_session(
                room_id,
                sender.sender_key(),
                &[],
                &sender.session_id,
                key,
                &claimed(sender),
                false,
                extra,
            )
            .await
    }

    async fn first_known_index(receiver: &OlmDevice, sender: &Sender) -> u32 {
        receiver
            .get_inbound_group_session_key(ROOM, sender.sender_key(), &sender.session_id, None)
            .await
            .unwrap()
            .unwrap()
            .chain_index
    }

    #[tokio::test]
    async fn group_message_roundtrip() {
        let sender = Sender::new().await;
        let receiver = OlmDevice::in_memory().await;
        assert!(add(&receiver, ROOM, &sender, &sender.key(), Default::default())
            .await
            .unwrap());

        let body = sender.encrypt("hello room");
        let decrypted = receiver
            .decrypt_group_message(ROOM, sender.sender_key(), &sender.session_id, &body, "$e1", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decrypted.plaintext, "hello room");
        assert_eq!(decrypted.sender_key, sender.sender_key());
        assert_eq!(decrypted.keys_claimed, claimed(&sender));
        assert!(decrypted.forwarding_curve25519_key_chain.is_empty());
        assert!(!decrypted.untrusted);
    }

    #[tokio::test]
    async fn replayed_index_needs_the_same_event() {
        let sender = Sender::new().await;
        let receiver = OlmDevice::in_memory().await;
        add(&receiver, ROOM, &sender, &sender.key(), Default::default())
            .await
            .unwrap();
        let body = sender.encrypt("once");
        let sender_key = sender.sender_key();

        for _ in 0..2 {
            receiver
                .decrypt_group_message(ROOM, sender_key, &sender.session_id, &body, "$e1", 100)
                .await
                .unwrap()
                .unwrap();
        }

        let err = receiver
            .decrypt_group_message(ROOM, sender_key, &sender.session_id, &body, "$e2", 100)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReplayDetected { message_index: 0, .. }));

        let err = receiver
            .decrypt_group_message(ROOM, sender_key, &sender.session_id, &body, "$e1", 101)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReplayDetected { .. }));
    }

    #[tokio::test]
    async fn lower_first_index_upgrades_the_session() {
        let sender = Sender::new().await;
        let receiver = OlmDevice::in_memory().await;
        for _ in 0..5 {
            sender.encrypt("skip");
        }
        let key_at_5 = sender.key();
        for _ in 0..5 {
            sender.encrypt("skip");
        }
        let key_at_10 = sender.key();

        assert!(add(&receiver, ROOM, &sender, &key_at_10, Default::default())
            .await
            .unwrap());
        assert_eq!(first_known_index(&receiver, &sender).await, 10);

        assert!(add(&receiver, ROOM, &sender, &key_at_5, Default::default())
            .await
            .unwrap());
        assert_eq!(first_known_index(&receiver, &sender).await, 5);

        assert!(!add(&receiver, ROOM, &sender, &key_at_10, Default::default())
            .await
            .unwrap());
        assert_eq!(first_known_index(&receiver, &sender).await, 5);
    }

    #[tokio::test]
    async fn trusted_copy_replaces_untrusted_at_same_index() {
        let sender = Sender::new().await;
        let receiver = OlmDevice::in_memory().await;
        let untrusted = InboundGroupSessionExtra {
            untrusted: true,
            ..Default::default()
        };

        assert!(add(&receiver, ROOM, &sender, &sender.key(), untrusted)
            .await
            .unwrap());
        assert!(add(&receiver, ROOM, &sender, &sender.key(), Default::default())
            .await
            .unwrap());
        assert!(!add(&receiver, ROOM, &sender, &sender.key(), untrusted)
            .await
            .unwrap());

        let body = sender.encrypt("trusted?");
        let decrypted = receiver
            .decrypt_group_message(ROOM, sender.sender_key(), &sender.session_id, &body, "$e", 1)
            .await
            .unwrap()
            .unwrap();
        assert!(!decrypted.untrusted);
    }

    #[tokio::test]
    async fn mismatched_session_id_is_rejected() {
        let sender = Sender::new().await;
        let receiver = OlmDevice::in_memory().await;
        let err = receiver
            .add_inbound_group_session(
                ROOM,
                sender.sender_key(),
                &[],
                "not-the-session-id",
                &sender.key(),
                &claimed(&sender),
                false,
                Default::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionIdMismatch { .. }));
        assert!(err.is_protocol_violation());
    }

    #[tokio::test]
    async fn session_is_bound_to_its_room() {
        let sender = Sender::new().await;
        let receiver = OlmDevice::in_memory().await;
        add(&receiver, "!b", &sender, &sender.key(), Default::default())
            .await
            .unwrap();
        let body = sender.encrypt("room b only");
        let sender_key = sender.sender_key();

        let err = receiver
            .decrypt_group_message("!a", sender_key, &sender.session_id, &body, "$e", 1)
            .await
            .unwrap_err();
        assert!(matches!(
            &err,
            Error::RoomBindingViolation { expected, actual } if expected == "!b" && actual == "!a"
        ));

        assert!(!receiver
            .has_inbound_session_keys("!a", sender_key, &sender.session_id)
            .await
            .unwrap());
        assert!(receiver
            .has_inbound_session_keys("!b", sender_key, &sender.session_id)
            .await
            .unwrap());
        assert!(matches!(
            receiver
                .get_inbound_group_session_key("!a", sender_key, &sender.session_id, None)
                .await,
            Err(Error::RoomBindingViolation { .. })
        ));
        assert!(matches!(
            add(&receiver, "!a", &sender, &sender.key(), Default::default()).await,
            Err(Error::RoomBindingViolation { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_session_without_notice_is_none() {
        let receiver = OlmDevice::in_memory().await;
        let sender = Sender::new().await;
        let body = sender.encrypt("lost");
        let result = receiver
            .decrypt_group_message(ROOM, sender.sender_key(), &sender.session_id, &body, "$e", 1)
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(!receiver
            .has_inbound_session_keys(ROOM, sender.sender_key(), &sender.session_id)
            .await
            .unwrap());
        assert!(receiver
            .get_inbound_group_session_key(ROOM, sender.sender_key(), &sender.session_id, None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn withheld_session_explains_why() {
        let receiver = OlmDevice::in_memory().await;
        let sender = Sender::new().await;
        receiver
            .add_inbound_group_session_withheld(
                ROOM,
                sender.sender_key(),
                &sender.session_id,
                "m.blacklisted",
                Some("you know what you did"),
            )
            .await
            .unwrap();

        let body = sender.encrypt("secret");
        let err = receiver
            .decrypt_group_message(ROOM, sender.sender_key(), &sender.session_id, &body, "$e", 1)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "The sender has blocked you.");
        assert_eq!(err.errcode(), Some("MEGOLM_UNKNOWN_INBOUND_SESSION_ID"));
        match err {
            Error::KeyWithheld { code, session, .. } => {
                assert_eq!(code, WithheldCode::Blacklisted);
                assert_eq!(session, format!("{}|{}", sender.sender_key(), sender.session_id));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn session_lookup_comes_before_the_body() {
        let receiver = OlmDevice::in_memory().await;
        let sender = Sender::new().await;
        let sender_key = sender.sender_key();
        let junk = "!!not base64!!";

        let result = receiver
            .decrypt_group_message(ROOM, sender_key, &sender.session_id, junk, "$e", 1)
            .await
            .unwrap();
        assert!(result.is_none());

        receiver
            .add_inbound_group_session_withheld(
                ROOM,
                sender_key,
                &sender.session_id,
                "m.blacklisted",
                None,
            )
            .await
            .unwrap();
        let err = receiver
            .decrypt_group_message(ROOM, sender_key, &sender.session_id, junk, "$e", 1)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "The sender has blocked you.");

        let other = Sender::new().await;
        add(&receiver, "!b", &other, &other.key(), Default::default())
            .await
            .unwrap();
        let err = receiver
            .decrypt_group_message(ROOM, other.sender_key(), &other.session_id, junk, "$e", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RoomBindingViolation { .. }));

        let err = receiver
            .decrypt_group_message("!b", other.sender_key(), &other.session_id, junk, "$e", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[tokio::test]
    async fn unknown_index_with_notice_is_reported_as_withheld() {
        let receiver = OlmDevice::in_memory().await;
        let sender = Sender::new().await;
        let early = sender.encrypt("before our key");
        add(&receiver, ROOM, &sender, &sender.key(), Default::default())
            .await
            .unwrap();

        let err = receiver
            .decrypt_group_message(ROOM, sender.sender_key(), &sender.session_id, &early, "$e", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MegolmDecryption(_)));

        receiver
            .add_inbound_group_session_withheld(
                ROOM,
                sender.sender_key(),
                &sender.session_id,
                "com.example.custom",
                None,
            )
            .await
            .unwrap();
        let err = receiver
            .decrypt_group_message(ROOM, sender.sender_key(), &sender.session_id, &early, "$e", 1)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "decryption key withheld");
    }

    #[tokio::test]
    async fn session_key_export_respects_first_known_index() {
        let sender = Sender::new().await;
        let receiver = OlmDevice::in_memory().await;
        for _ in 0..3 {
            sender.encrypt("skip");
        }
        add(&receiver, ROOM, &sender, &sender.key(), Default::default())
            .await
            .unwrap();
        let sender_key = sender.sender_key();

        let key = receiver
            .get_inbound_group_session_key(ROOM, sender_key, &sender.session_id, Some(7))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key.chain_index, 7);
        assert_eq!(
            key.sender_claimed_ed25519_key.as_deref(),
            Some(sender.device.ed25519_key())
        );

        let err = receiver
            .get_inbound_group_session_key(ROOM, sender_key, &sender.session_id, Some(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ChainIndexTooLow {
                requested: 2,
                first_known: 3
            }
        ));
    }

    #[tokio::test]
    async fn shared_history_is_indexed_on_first_store() {
        let sender = Sender::new().await;
        let receiver = OlmDevice::in_memory().await;
        let shared = InboundGroupSessionExtra {
            shared_history: true,
            ..Default::default()
        };
        add(&receiver, ROOM, &sender, &sender.key(), shared)
            .await
            .unwrap();

        let other = Sender::new().await;
        add(&receiver, ROOM, &other, &other.key(), Default::default())
            .await
            .unwrap();

        assert_eq!(
            receiver
                .get_shared_history_inbound_group_sessions(ROOM)
                .await
                .unwrap(),
            vec![(sender.sender_key().to_string(), sender.session_id.clone())]
        );
        assert!(receiver
            .get_shared_history_inbound_group_sessions("!elsewhere")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn room_keys_move_between_devices() {
        let sender = Sender::new().await;
        let receiver = OlmDevice::in_memory().await;
        let shared = InboundGroupSessionExtra {
            shared_history: true,
            ..Default::default()
        };
        add(&receiver, ROOM, &sender, &sender.key(), shared)
            .await
            .unwrap();

        let exported = receiver.export_room_keys().await.unwrap();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].first_known_index, 0);
        assert_eq!(exported[0].room_id, ROOM);
        assert!(exported[0].shared_history);

        let other = OlmDevice::in_memory().await;
        assert!(other
            .import_inbound_group_session(&exported[0], false)
            .await
            .unwrap());

        let body = sender.encrypt("for everyone");
        let decrypted = other
            .decrypt_group_message(ROOM, sender.sender_key(), &sender.session_id, &body, "$e", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decrypted.plaintext, "for everyone");
        assert_eq!(decrypted.keys_claimed, claimed(&sender));
    }
}
