//! At most one pairwise session negotiation per peer.
//!
//! The first caller for a peer becomes the owner and runs the handshake.
//! Later callers subscribe to the owner's outcome. The marker is cleared when
//! the owner finishes, fails, or is dropped mid-flight; in the last case the
//! channel closes and waiters see no outcome at all.

use std::future::Future;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{Error, Result};
use crate::identity::OlmDevice;

/// `None` while running, then the new session id or the failure text.
type Outcome = Option<std::result::Result<String, String>>;

#[derive(Default)]
pub(crate) struct Negotiations {
    in_flight: DashMap<String, watch::Sender<Outcome>>,
}

pub(crate) enum Claim<'a> {
    Owner(NegotiationGuard<'a>),
    Waiter(watch::Receiver<Outcome>),
}

/// Held by the owner of a negotiation. Dropping it without calling
/// [`finish`](Self::finish) releases every waiter with no outcome.
pub(crate) struct NegotiationGuard<'a> {
    in_flight: &'a DashMap<String, watch::Sender<Outcome>>,
    peer: String,
    finished: bool,
}

impl NegotiationGuard<'_> {
    pub(crate) fn finish(mut self, outcome: std::result::Result<String, String>) {
        if let Some((_, tx)) = self.in_flight.remove(&self.peer) {
            tx.send_replace(Some(outcome));
        }
        self.finished = true;
    }
}

impl Drop for NegotiationGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(peer = %self.peer, "session negotiation abandoned");
            self.in_flight.remove(&self.peer);
        }
    }
}

impl Negotiations {
    pub(crate) fn claim(&self, peer: &str) -> Claim<'_> {
        match self.in_flight.entry(peer.to_owned()) {
            Entry::Occupied(entry) => Claim::Waiter(entry.get().subscribe()),
            Entry::Vacant(entry) => {
                let (tx, _rx) = watch::channel(None);
                entry.insert(tx);
                Claim::Owner(NegotiationGuard {
                    in_flight: &self.in_flight,
                    peer: peer.to_owned(),
                    finished: false,
                })
            }
        }
    }

    pub(crate) fn is_in_flight(&self, peer: &str) -> bool {
        self.in_flight.contains_key(peer)
    }

    /// Wait for the negotiation toward `peer`, if one is running. Returns
    /// `None` when there is none or its owner gave up.
    pub(crate) async fn wait(&self, peer: &str) -> Outcome {
        let rx = self.in_flight.get(peer).map(|tx| tx.subscribe());
        match rx {
            Some(rx) => {
                debug!(peer, "waiting for olm session to be created");
                wait_on(rx).await
            }
            None => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn waiters(&self, peer: &str) -> usize {
        self.in_flight
            .get(peer)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

async fn wait_on(mut rx: watch::Receiver<Outcome>) -> Outcome {
    match rx.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone(),
        Err(_) => None,
    }
}

impl OlmDevice {
    /// Run `create` as the single session negotiation toward `peer`.
    ///
    /// If another negotiation for `peer` is already running, `create` is not
    /// called and its outcome is shared instead.
    pub async fn negotiate_session<F, Fut>(&self, peer: &str, create: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        match self.negotiations.claim(peer) {
            Claim::Owner(guard) => {
                let result = create().await;
                let shared = match &result {
                    Ok(session_id) => Ok(session_id.clone()),
                    Err(e) => Err(e.to_string()),
                };
                guard.finish(shared);
                result
            }
            Claim::Waiter(rx) => match wait_on(rx).await {
                Some(Ok(session_id)) => Ok(session_id),
                Some(Err(reason)) => Err(Error::NegotiationFailed {
                    peer: peer.to_owned(),
                    reason,
                }),
                None => Err(Error::NegotiationFailed {
                    peer: peer.to_owned(),
                    reason: "negotiation was abandoned".into(),
                }),
            },
        }
    }

    /// Whether a session negotiation toward `peer` is currently running.
    pub fn is_negotiating(&self, peer: &str) -> bool {
        self.negotiations.is_in_flight(peer)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::oneshot;

    use super::*;

    async fn until_waiters(device: &OlmDevice, peer: &str, n: usize) {
        while device.negotiations.waiters(peer) < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn waiters_share_the_owner_outcome() {
        let device = Arc::new(OlmDevice::in_memory().await);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let owner = {
            let device = device.clone();
            tokio::spawn(async move {
                device
                    .negotiate_session("peer", || async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        Ok("session-1".to_string())
                    })
                    .await
            })
        };
        started_rx.await.unwrap();
        assert!(device.is_negotiating("peer"));

        let waiter = {
            let device = device.clone();
            tokio::spawn(async move {
                device
                    .negotiate_session("peer", || async {
                        Err(Error::UnknownSession("second negotiation ran".into()))
                    })
                    .await
            })
        };
        until_waiters(&device, "peer", 1).await;

        release_tx.send(()).unwrap();
        assert_eq!(owner.await.unwrap().unwrap(), "session-1");
        assert_eq!(waiter.await.unwrap().unwrap(), "session-1");
        assert!(!device.is_negotiating("peer"));
    }

    #[tokio::test]
    async fn failure_is_shared_and_clears_the_marker() {
        let device = Arc::new(OlmDevice::in_memory().await);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let owner = {
            let device = device.clone();
            tokio::spawn(async move {
                device
                    .negotiate_session("peer", || async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        Err(Error::Handshake {
                            peer: "peer".into(),
                            reason: "no one-time key".into(),
                        })
                    })
                    .await
            })
        };
        started_rx.await.unwrap();

        let waiter = {
            let device = device.clone();
            tokio::spawn(async move {
                device
                    .negotiate_session("peer", || async { Ok("never".to_string()) })
                    .await
            })
        };
        until_waiters(&device, "peer", 1).await;

        release_tx.send(()).unwrap();
        assert!(matches!(
            owner.await.unwrap(),
            Err(Error::Handshake { .. })
        ));
        match waiter.await.unwrap() {
            Err(Error::NegotiationFailed { peer, reason }) => {
                assert_eq!(peer, "peer");
                assert!(reason.contains("no one-time key"));
            }
            other => panic!("unexpected result: {other:?}"),
        }

        // A fresh negotiation may start once the failed one is cleared.
        let id = device
            .negotiate_session("peer", || async { Ok("session-2".to_string()) })
            .await
            .unwrap();
        assert_eq!(id, "session-2");
    }

    #[tokio::test]
    async fn abandoned_owner_releases_waiters() {
        let device = Arc::new(OlmDevice::in_memory().await);
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let owner = {
            let device = device.clone();
            tokio::spawn(async move {
                device
                    .negotiate_session("peer", || async move {
                        let _ = started_tx.send(());
                        std::future::pending::<Result<String>>().await
                    })
                    .await
            })
        };
        started_rx.await.unwrap();

        let waiter = {
            let device = device.clone();
            tokio::spawn(async move { device.negotiations.wait("peer").await })
        };
        until_waiters(&device, "peer", 1).await;

        owner.abort();
        assert!(owner.await.unwrap_err().is_cancelled());
        assert_eq!(waiter.await.unwrap(), None);
        assert!(!device.is_negotiating("peer"));
    }

    #[tokio::test]
    async fn wait_without_negotiation_returns_immediately() {
        let device = OlmDevice::in_memory().await;
        assert_eq!(device.negotiations.wait("nobody").await, None);
    }
}
