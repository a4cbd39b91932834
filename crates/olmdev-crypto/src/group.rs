//! Outbound Megolm sessions.
//!
//! Outbound sessions live only in memory, keyed by session id. A restart
//! forgets them and the caller starts a new one for each room.

use serde::Serialize;
use tracing::{debug, info};
use vodozemac::megolm::{GroupSession, SessionConfig};

use crate::check_payload_length;
use crate::error::{Error, Result};
use crate::identity::OlmDevice;

/// The key to share with room members so they can decrypt from `chain_index` on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundGroupSessionKey {
    pub chain_index: u32,
    /// Base64 Megolm session key.
    pub key: String,
}

impl OlmDevice {
    pub fn create_outbound_group_session(&self) -> String {
        let session = GroupSession::new(SessionConfig::version_1());
        let session_id = session.session_id();
        self.outbound_group_sessions
            .insert(session_id.clone(), session);
        info!(%session_id, "created outbound group session");
        session_id
    }

    /// Encrypt with an outbound session and advance its ratchet. Returns the
    /// base64 ciphertext.
    pub fn encrypt_group_message(&self, session_id: &str, plaintext: &str) -> Result<String> {
        check_payload_length(plaintext)?;
        let mut session = self
            .outbound_group_sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::UnknownSession(session_id.to_owned()))?;
        let message = session.encrypt(plaintext);
        debug!(
            session_id,
            message_index = message.message_index(),
            "encrypted group message"
        );
        Ok(message.to_base64())
    }

    pub fn get_outbound_group_session_key(
        &self,
        session_id: &str,
    ) -> Result<OutboundGroupSessionKey> {
        let session = self
            .outbound_group_sessions
            .get(session_id)
            .ok_or_else(|| Error::UnknownSession(session_id.to_owned()))?;
        Ok(OutboundGroupSessionKey {
            chain_index: session.message_index(),
            key: session.session_key().to_base64(),
        })
    }
}
