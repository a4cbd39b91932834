//! Transaction-scoped accessors over the store collections.

use std::borrow::Cow;

use crate::collections::{Collection, Collections};
use crate::error::StoreError;
use crate::records::{
    DeviceRef, InboundGroupSessionRecord, SessionProblem, SessionRecord, WithheldRecord,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnMode {
    ReadOnly,
    ReadWrite,
}

/// A pairwise session flattened out of the per-device map, as used for export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSession {
    pub device_key: String,
    pub session_id: String,
    pub record: SessionRecord,
}

/// Handle passed to a transaction callback.
///
/// Reads see the committed state plus this transaction's own writes. The first
/// write clones the snapshot; nothing becomes visible to other transactions
/// until the store commits it.
pub struct Transaction<'a> {
    mode: TxnMode,
    scope: &'a [Collection],
    data: Cow<'a, Collections>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(mode: TxnMode, scope: &'a [Collection], data: &'a Collections) -> Self {
        Self {
            mode,
            scope,
            data: Cow::Borrowed(data),
        }
    }

    /// Staged snapshot if anything was written.
    pub(crate) fn into_staged(self) -> Option<Collections> {
        match self.data {
            Cow::Owned(data) => Some(data),
            Cow::Borrowed(_) => None,
        }
    }

    fn read(&self, collection: Collection) -> Result<&Collections, StoreError> {
        if !self.scope.contains(&collection) {
            return Err(StoreError::OutOfScope(collection));
        }
        Ok(&self.data)
    }

    fn write(&mut self, collection: Collection) -> Result<&mut Collections, StoreError> {
        if !self.scope.contains(&collection) {
            return Err(StoreError::OutOfScope(collection));
        }
        if self.mode == TxnMode::ReadOnly {
            return Err(StoreError::ReadOnly(collection));
        }
        Ok(self.data.to_mut())
    }

    // ── Account ─────────────────────────────────────────────────────────

    pub fn account(&self) -> Result<Option<&str>, StoreError> {
        Ok(self.read(Collection::Account)?.account.as_deref())
    }

    pub fn store_account(&mut self, pickle: String) -> Result<(), StoreError> {
        self.write(Collection::Account)?.account = Some(pickle);
        Ok(())
    }

    // ── Pairwise sessions ───────────────────────────────────────────────

    pub fn session(
        &self,
        device_key: &str,
        session_id: &str,
    ) -> Result<Option<&SessionRecord>, StoreError> {
        Ok(self
            .read(Collection::Sessions)?
            .sessions
            .get(device_key)
            .and_then(|sessions| sessions.get(session_id)))
    }

    /// Sessions for one peer device, ordered by ascending session id.
    pub fn sessions_for_device(
        &self,
        device_key: &str,
    ) -> Result<Vec<(&str, &SessionRecord)>, StoreError> {
        Ok(self
            .read(Collection::Sessions)?
            .sessions
            .get(device_key)
            .map(|sessions| {
                sessions
                    .iter()
                    .map(|(id, record)| (id.as_str(), record))
                    .collect()
            })
            .unwrap_or_default())
    }

    pub fn all_sessions(&self) -> Result<Vec<StoredSession>, StoreError> {
        let sessions = &self.read(Collection::Sessions)?.sessions;
        Ok(sessions
            .iter()
            .flat_map(|(device_key, by_id)| {
                by_id.iter().map(move |(session_id, record)| StoredSession {
                    device_key: device_key.clone(),
                    session_id: session_id.clone(),
                    record: record.clone(),
                })
            })
            .collect())
    }

    pub fn store_session(
        &mut self,
        device_key: &str,
        session_id: &str,
        record: SessionRecord,
    ) -> Result<(), StoreError> {
        self.write(Collection::Sessions)?
            .sessions
            .entry(device_key.to_owned())
            .or_default()
            .insert(session_id.to_owned(), record);
        Ok(())
    }

    // ── Inbound group sessions ──────────────────────────────────────────

    pub fn inbound_group_session(
        &self,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<&InboundGroupSessionRecord>, StoreError> {
        Ok(self
            .read(Collection::InboundGroupSessions)?
            .inbound_group_sessions
            .get(&(sender_key.to_owned(), session_id.to_owned())))
    }

    /// Every inbound group session as `(sender key, session id, record)`.
    pub fn all_inbound_group_sessions(
        &self,
    ) -> Result<Vec<(&str, &str, &InboundGroupSessionRecord)>, StoreError> {
        Ok(self
            .read(Collection::InboundGroupSessions)?
            .inbound_group_sessions
            .iter()
            .map(|((sender_key, session_id), record)| {
                (sender_key.as_str(), session_id.as_str(), record)
            })
            .collect())
    }

    pub fn store_inbound_group_session(
        &mut self,
        sender_key: &str,
        session_id: &str,
        record: InboundGroupSessionRecord,
    ) -> Result<(), StoreError> {
        self.write(Collection::InboundGroupSessions)?
            .inbound_group_sessions
            .insert((sender_key.to_owned(), session_id.to_owned()), record);
        Ok(())
    }

    // ── Withheld keys ───────────────────────────────────────────────────

    pub fn withheld(
        &self,
        room_id: &str,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<&WithheldRecord>, StoreError> {
        Ok(self
            .read(Collection::InboundGroupSessionsWithheld)?
            .withheld
            .get(&(
                room_id.to_owned(),
                sender_key.to_owned(),
                session_id.to_owned(),
            )))
    }

    pub fn store_withheld(
        &mut self,
        room_id: &str,
        sender_key: &str,
        session_id: &str,
        record: WithheldRecord,
    ) -> Result<(), StoreError> {
        self.write(Collection::InboundGroupSessionsWithheld)?
            .withheld
            .insert(
                (
                    room_id.to_owned(),
                    sender_key.to_owned(),
                    session_id.to_owned(),
                ),
                record,
            );
        Ok(())
    }

    // ── Shared history index ────────────────────────────────────────────

    pub fn shared_history_sessions(
        &self,
        room_id: &str,
    ) -> Result<Vec<(String, String)>, StoreError> {
        Ok(self
            .read(Collection::SharedHistoryInboundGroupSessions)?
            .shared_history
            .get(room_id)
            .cloned()
            .unwrap_or_default())
    }

    pub fn add_shared_history_session(
        &mut self,
        room_id: &str,
        sender_key: &str,
        session_id: &str,
    ) -> Result<(), StoreError> {
        let entry = (sender_key.to_owned(), session_id.to_owned());
        let sessions = self
            .write(Collection::SharedHistoryInboundGroupSessions)?
            .shared_history
            .entry(room_id.to_owned())
            .or_default();
        if !sessions.contains(&entry) {
            sessions.push(entry);
        }
        Ok(())
    }

    // ── Session problems ────────────────────────────────────────────────

    pub fn store_session_problem(
        &mut self,
        device_key: &str,
        problem: SessionProblem,
    ) -> Result<(), StoreError> {
        let problems = self
            .write(Collection::SessionProblems)?
            .session_problems
            .entry(device_key.to_owned())
            .or_default();
        problems.push(problem);
        problems.sort_by_key(|p| p.time);
        Ok(())
    }

    /// The first problem recorded after `since`, reported with the `fixed`
    /// flag of the latest problem. Without a newer problem, the latest one is
    /// returned unless it has been fixed.
    pub fn session_problem_since(
        &self,
        device_key: &str,
        since: u64,
    ) -> Result<Option<SessionProblem>, StoreError> {
        let Some(problems) = self
            .read(Collection::SessionProblems)?
            .session_problems
            .get(device_key)
        else {
            return Ok(None);
        };
        let Some(latest) = problems.last() else {
            return Ok(None);
        };

        if let Some(problem) = problems.iter().find(|p| p.time > since) {
            return Ok(Some(SessionProblem {
                fixed: latest.fixed,
                ..problem.clone()
            }));
        }

        Ok((!latest.fixed).then(|| latest.clone()))
    }

    /// Drops devices that were already notified about a session problem and
    /// marks the remaining ones as notified.
    pub fn filter_out_notified_error_devices(
        &mut self,
        devices: Vec<DeviceRef>,
    ) -> Result<Vec<DeviceRef>, StoreError> {
        let notified = &mut self
            .write(Collection::SessionProblems)?
            .notified_error_devices;
        Ok(devices
            .into_iter()
            .filter(|device| {
                notified
                    .entry(device.user_id.clone())
                    .or_default()
                    .insert(device.device_id.clone())
            })
            .collect())
    }
}
