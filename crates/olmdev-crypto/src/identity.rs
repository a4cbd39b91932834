//! The device account: identity keys, signing, one-time and fallback keys.
//!
//! The account is never held across operations. Each call unpickles it inside
//! a store transaction, uses it, and writes the new pickle back before the
//! transaction commits.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use olmdev_store::{Collection, CryptoStore, SessionRecord, Transaction, TxnMode};
use tracing::{debug, info, warn};
use vodozemac::megolm::GroupSession;
use vodozemac::olm::Account;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature, KeyId};

use crate::error::{Error, Result};
use crate::export::ExportedDevice;
use crate::inbound::DecryptedIndex;
use crate::negotiation::Negotiations;
use crate::pickle::PickleKey;

/// Options for [`OlmDevice::initialize`].
#[derive(Debug, Default)]
pub struct InitOptions {
    /// Key used to pickle state in the store. Defaults to `DEFAULT_KEY`.
    pub pickle_key: Option<String>,
    /// Restore the account and pairwise sessions from another device. Its
    /// embedded pickle key wins over `pickle_key`.
    pub exported_device: Option<ExportedDevice>,
}

/// Public facts read off the account once at startup.
struct AccountSummary {
    curve25519_key: String,
    ed25519_key: String,
    max_one_time_keys: usize,
}

impl AccountSummary {
    fn of(account: &Account) -> Self {
        let keys = account.identity_keys();
        Self {
            curve25519_key: keys.curve25519.to_base64(),
            ed25519_key: keys.ed25519.to_base64(),
            max_one_time_keys: account.max_number_of_one_time_keys(),
        }
    }
}

/// One device's end-to-end encryption state.
///
/// A handle only exists once the account has been loaded or created, so
/// every other operation can assume an account is present.
pub struct OlmDevice {
    pub(crate) store: Arc<CryptoStore>,
    pub(crate) pickle_key: PickleKey,
    curve25519_key: String,
    ed25519_key: String,
    max_one_time_keys: usize,
    pub(crate) negotiations: Negotiations,
    pub(crate) outbound_group_sessions: DashMap<String, GroupSession>,
    pub(crate) decrypted_indices: DecryptedIndex,
}

impl OlmDevice {
    /// Load the account from `store`, create one, or restore one from an
    /// exported device.
    pub async fn initialize(store: Arc<CryptoStore>, options: InitOptions) -> Result<Self> {
        Self::init(store, options)
            .await
            .map_err(|e| Error::Initialization(Box::new(e)))
    }

    async fn init(store: Arc<CryptoStore>, options: InitOptions) -> Result<Self> {
        let InitOptions {
            pickle_key,
            exported_device,
        } = options;

        let (pickle_key, summary) = match exported_device {
            Some(exported) => {
                if pickle_key.is_some() {
                    warn!("ignoring pickle_key option because an exported device is present");
                }
                let pickle_key = PickleKey::new(exported.pickle_key.clone());
                let summary = restore_exported_device(&store, &pickle_key, exported).await?;
                (pickle_key, summary)
            }
            None => {
                let pickle_key = pickle_key.map(PickleKey::new).unwrap_or_default();
                let summary = load_or_create_account(&store, &pickle_key).await?;
                (pickle_key, summary)
            }
        };

        info!(curve25519 = %summary.curve25519_key, "olm device ready");
        Ok(Self {
            store,
            pickle_key,
            curve25519_key: summary.curve25519_key,
            ed25519_key: summary.ed25519_key,
            max_one_time_keys: summary.max_one_time_keys,
            negotiations: Negotiations::default(),
            outbound_group_sessions: DashMap::new(),
            decrypted_indices: DecryptedIndex::default(),
        })
    }

    /// Base64 Curve25519 identity key.
    pub fn curve25519_key(&self) -> &str {
        &self.curve25519_key
    }

    /// Base64 Ed25519 fingerprint key.
    pub fn ed25519_key(&self) -> &str {
        &self.ed25519_key
    }

    pub fn max_one_time_keys(&self) -> usize {
        self.max_one_time_keys
    }

    pub fn pickle_key(&self) -> &PickleKey {
        &self.pickle_key
    }

    // ── Account access ──────────────────────────────────────────────────

    pub(crate) fn load_account(&self, txn: &Transaction<'_>) -> Result<Account> {
        let pickle = txn.account()?.ok_or(Error::MissingAccount)?;
        self.pickle_key.unpickle_account(pickle)
    }

    pub(crate) fn save_account(&self, txn: &mut Transaction<'_>, account: &Account) -> Result<()> {
        txn.store_account(self.pickle_key.pickle_account(account))?;
        Ok(())
    }

    async fn read_account<T>(&self, f: impl FnOnce(&Account) -> T) -> Result<T> {
        self.store
            .transaction(TxnMode::ReadOnly, &[Collection::Account], |txn| {
                let account = self.load_account(txn)?;
                Ok(f(&account))
            })
            .await
    }

    async fn update_account<T>(&self, f: impl FnOnce(&mut Account) -> T) -> Result<T> {
        self.store
            .transaction(TxnMode::ReadWrite, &[Collection::Account], |txn| {
                let mut account = self.load_account(txn)?;
                let out = f(&mut account);
                self.save_account(txn, &account)?;
                Ok(out)
            })
            .await
    }

    // ── Signing ─────────────────────────────────────────────────────────

    /// Sign `message` with the account's Ed25519 key. Returns base64.
    pub async fn sign(&self, message: &str) -> Result<String> {
        self.read_account(|account| account.sign(message).to_base64())
            .await
    }

    /// Check an Ed25519 signature made by `key` over `message`.
    pub fn verify_signature(key: &str, message: &str, signature: &str) -> Result<()> {
        let key = Ed25519PublicKey::from_base64(key)?;
        let signature = Ed25519Signature::from_base64(signature)?;
        key.verify(message.as_bytes(), &signature)?;
        Ok(())
    }

    // ── One-time keys ───────────────────────────────────────────────────

    /// Unpublished one-time keys as `key id -> base64 key`.
    pub async fn one_time_keys(&self) -> Result<BTreeMap<String, String>> {
        self.read_account(|account| encode_keys(account.one_time_keys()))
            .await
    }

    pub async fn mark_keys_as_published(&self) -> Result<()> {
        self.update_account(|account| account.mark_keys_as_published())
            .await
    }

    /// Generate `count` new one-time keys. The account keeps at most
    /// [`max_one_time_keys`](Self::max_one_time_keys) and drops the oldest.
    pub async fn generate_one_time_keys(&self, count: usize) -> Result<()> {
        self.update_account(|account| {
            let _ = account.generate_one_time_keys(count);
        })
        .await?;
        debug!(count, "generated one-time keys");
        Ok(())
    }

    // ── Fallback keys ───────────────────────────────────────────────────

    pub async fn generate_fallback_key(&self) -> Result<()> {
        self.update_account(|account| {
            let _ = account.generate_fallback_key();
        })
        .await?;
        debug!("generated fallback key");
        Ok(())
    }

    /// The current unpublished fallback key, if any, as `key id -> base64 key`.
    pub async fn fallback_key(&self) -> Result<BTreeMap<String, String>> {
        self.read_account(|account| encode_keys(account.fallback_key()))
            .await
    }

    /// Forget the previous fallback key. Returns whether there was one.
    pub async fn forget_old_fallback_key(&self) -> Result<bool> {
        self.update_account(|account| account.forget_fallback_key())
            .await
    }
}

fn encode_keys(keys: HashMap<KeyId, Curve25519PublicKey>) -> BTreeMap<String, String> {
    keys.into_iter()
        .map(|(id, key)| (id.to_base64(), key.to_base64()))
        .collect()
}

async fn load_or_create_account(
    store: &CryptoStore,
    pickle_key: &PickleKey,
) -> Result<AccountSummary> {
    store
        .transaction(TxnMode::ReadWrite, &[Collection::Account], |txn| {
            if let Some(pickle) = txn.account()? {
                let account = pickle_key.unpickle_account(pickle)?;
                return Ok(AccountSummary::of(&account));
            }
            let account = Account::new();
            txn.store_account(pickle_key.pickle_account(&account))?;
            info!("created new olm account");
            Ok(AccountSummary::of(&account))
        })
        .await
}

/// Replace the stored account and pairwise sessions with an export. Every
/// pickle is opened before anything is written, so a malformed export fails
/// without touching the store.
async fn restore_exported_device(
    store: &CryptoStore,
    pickle_key: &PickleKey,
    exported: ExportedDevice,
) -> Result<AccountSummary> {
    let ExportedDevice {
        pickled_account,
        sessions,
        ..
    } = exported;

    store
        .transaction(
            TxnMode::ReadWrite,
            &[Collection::Account, Collection::Sessions],
            |txn| {
                let account = pickle_key.unpickle_account(&pickled_account)?;
                for session in &sessions {
                    pickle_key.unpickle_session(&session.session)?;
                }

                txn.store_account(pickled_account)?;
                let restored = sessions.len();
                for session in sessions {
                    let record = SessionRecord {
                        pickle: session.session,
                        last_received_message_ts: session.last_received_message_ts,
                    };
                    txn.store_session(&session.device_key, &session.session_id, record)?;
                }
                info!(sessions = restored, "restored device from export");
                Ok(AccountSummary::of(&account))
            },
        )
        .await
}

#[cfg(test)]
impl OlmDevice {
    pub(crate) async fn in_memory() -> Self {
        Self::initialize(Arc::new(CryptoStore::in_memory()), InitOptions::default())
            .await
            .unwrap()
    }
}
