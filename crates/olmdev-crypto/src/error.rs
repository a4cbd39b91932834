use olmdev_store::StoreError;
use thiserror::Error;

use crate::withheld::WithheldCode;
use crate::MAX_PLAINTEXT_LENGTH;

#[derive(Debug, Error)]
pub enum Error {
    #[error("device initialization failed: {0}")]
    Initialization(#[source] Box<Error>),

    #[error("no account in the store")]
    MissingAccount,

    #[error("handshake with {peer} failed: {reason}")]
    Handshake { peer: String, reason: String },

    #[error("need message type 0 to create an inbound session, got {0}")]
    InvalidMessageType(usize),

    #[error(
        "mismatched group session id from sender {sender_key} (expected {expected}, was {actual})"
    )]
    SessionIdMismatch {
        sender_key: String,
        expected: String,
        actual: String,
    },

    #[error("mismatched room_id for inbound group session (expected {expected}, was {actual})")]
    RoomBindingViolation { expected: String, actual: String },

    #[error(
        "duplicate message index, possible replay attack: {sender_key}|{session_id}|{message_index}"
    )]
    ReplayDetected {
        sender_key: String,
        session_id: String,
        message_index: u32,
    },

    #[error("{reason}")]
    KeyWithheld {
        code: WithheldCode,
        reason: String,
        /// `sender_key|session_id`
        session: String,
    },

    #[error(
        "message too long ({0} bytes), the maximum for an encrypted message is {max} bytes",
        max = MAX_PLAINTEXT_LENGTH
    )]
    PayloadTooLarge(usize),

    #[error("chain index {requested} precedes the first known index {first_known}")]
    ChainIndexTooLow { requested: u32, first_known: u32 },

    #[error("unknown session {0}")]
    UnknownSession(String),

    #[error("session negotiation with {peer} failed: {reason}")]
    NegotiationFailed { peer: String, reason: String },

    #[error("olm decryption failed: {0}")]
    OlmDecryption(#[from] vodozemac::olm::DecryptionError),

    #[error("megolm decryption failed: {0}")]
    MegolmDecryption(#[from] vodozemac::megolm::DecryptionError),

    #[error("malformed message: {0}")]
    Decode(#[from] vodozemac::DecodeError),

    #[error("malformed message body: {0}")]
    MalformedBody(String),

    #[error("malformed session key: {0}")]
    SessionKeyDecode(#[from] vodozemac::megolm::SessionKeyDecodeError),

    #[error("pickle error: {0}")]
    Pickle(#[from] vodozemac::PickleError),

    #[error("invalid key: {0}")]
    Key(#[from] vodozemac::KeyError),

    #[error("signature error: {0}")]
    Signature(#[from] vodozemac::SignatureError),

    #[error("decrypted payload is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Error {
    /// Client-visible error code, where one is defined.
    pub fn errcode(&self) -> Option<&'static str> {
        match self {
            Error::PayloadTooLarge(_) => Some("M_TOO_LARGE"),
            Error::KeyWithheld { .. } => Some("MEGOLM_UNKNOWN_INBOUND_SESSION_ID"),
            _ => None,
        }
    }

    /// Errors that indicate a misbehaving peer or server rather than a local
    /// problem. These are never retried.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::InvalidMessageType(_)
                | Error::SessionIdMismatch { .. }
                | Error::RoomBindingViolation { .. }
                | Error::ReplayDetected { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
