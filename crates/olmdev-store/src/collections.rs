//! The named collections of the device store.
//!
//! All collections are bundled into one [`Collections`] snapshot so a
//! transaction can stage its writes copy-on-write and a backend can persist
//! a consistent image in one go.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::records::{InboundGroupSessionRecord, SessionProblem, SessionRecord, WithheldRecord};

/// Identifies one collection in a transaction scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Account,
    Sessions,
    InboundGroupSessions,
    InboundGroupSessionsWithheld,
    SharedHistoryInboundGroupSessions,
    /// Session problems and the set of devices already notified about them.
    SessionProblems,
}

impl Collection {
    pub fn name(self) -> &'static str {
        match self {
            Collection::Account => "account",
            Collection::Sessions => "sessions",
            Collection::InboundGroupSessions => "inbound_group_sessions",
            Collection::InboundGroupSessionsWithheld => "inbound_group_sessions_withheld",
            Collection::SharedHistoryInboundGroupSessions => {
                "shared_history_inbound_group_sessions"
            }
            Collection::SessionProblems => "session_problems",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Full contents of the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collections {
    /// Encrypted account pickle, absent until the device is provisioned.
    pub account: Option<String>,
    /// peer device curve25519 key -> session id -> session
    pub sessions: BTreeMap<String, BTreeMap<String, SessionRecord>>,
    /// (sender key, session id) -> session
    pub inbound_group_sessions: BTreeMap<(String, String), InboundGroupSessionRecord>,
    /// (room id, sender key, session id) -> withheld reason
    pub withheld: BTreeMap<(String, String, String), WithheldRecord>,
    /// room id -> (sender key, session id), in insertion order
    pub shared_history: BTreeMap<String, Vec<(String, String)>>,
    /// peer device curve25519 key -> problems sorted by time
    pub session_problems: BTreeMap<String, Vec<SessionProblem>>,
    /// user id -> device ids already notified about a session problem
    pub notified_error_devices: BTreeMap<String, BTreeSet<String>>,
}
