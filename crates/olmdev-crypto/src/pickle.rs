//! Pickle key handling and (un)pickling of the vodozemac state objects.
//!
//! The pickle key is a caller-chosen string. The 32-byte key that actually
//! seals pickles is derived from it with HKDF-SHA256, so any string works and
//! the same string always opens the same pickles.

use hkdf::Hkdf;
use sha2::Sha256;
use vodozemac::megolm::{InboundGroupSession, InboundGroupSessionPickle};
use vodozemac::olm::{Account, AccountPickle, Session, SessionPickle};
use zeroize::Zeroizing;

use crate::error::Result;
use crate::DEFAULT_PICKLE_KEY;

const HKDF_SALT: &[u8] = b"olmdev-pickle-salt";
const HKDF_INFO: &[u8] = b"olmdev-pickle-key-v1";

pub struct PickleKey {
    passphrase: Zeroizing<String>,
    key: Zeroizing<[u8; 32]>,
}

impl PickleKey {
    pub fn new(passphrase: impl Into<String>) -> Self {
        let passphrase = Zeroizing::new(passphrase.into());
        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), passphrase.as_bytes());
        let mut key = Zeroizing::new([0u8; 32]);
        hk.expand(HKDF_INFO, &mut key[..])
            .expect("32 bytes is a valid HKDF-SHA256 output length");
        Self { passphrase, key }
    }

    /// The pickle key string, as embedded in device exports.
    pub fn passphrase(&self) -> &str {
        &self.passphrase
    }

    fn bytes(&self) -> &[u8; 32] {
        &self.key
    }

    // ── Account ─────────────────────────────────────────────────────────

    pub(crate) fn pickle_account(&self, account: &Account) -> String {
        account.pickle().encrypt(self.bytes())
    }

    pub(crate) fn unpickle_account(&self, pickle: &str) -> Result<Account> {
        let pickle = AccountPickle::from_encrypted(pickle, self.bytes())?;
        Ok(Account::from_pickle(pickle))
    }

    // ── Pairwise sessions ───────────────────────────────────────────────

    pub(crate) fn pickle_session(&self, session: &Session) -> String {
        session.pickle().encrypt(self.bytes())
    }

    pub(crate) fn unpickle_session(&self, pickle: &str) -> Result<Session> {
        let pickle = SessionPickle::from_encrypted(pickle, self.bytes())?;
        Ok(Session::from_pickle(pickle))
    }

    // ── Inbound group sessions ──────────────────────────────────────────

    pub(crate) fn pickle_inbound_group_session(&self, session: &InboundGroupSession) -> String {
        session.pickle().encrypt(self.bytes())
    }

    pub(crate) fn unpickle_inbound_group_session(
        &self,
        pickle: &str,
    ) -> Result<InboundGroupSession> {
        let pickle = InboundGroupSessionPickle::from_encrypted(pickle, self.bytes())?;
        Ok(InboundGroupSession::from_pickle(pickle))
    }
}

impl Default for PickleKey {
    fn default() -> Self {
        Self::new(DEFAULT_PICKLE_KEY)
    }
}

impl std::fmt::Debug for PickleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PickleKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn same_passphrase_opens_account_pickle() {
        let account = Account::new();
        let pickle = PickleKey::new("secret").pickle_account(&account);

        let restored = PickleKey::new("secret").unpickle_account(&pickle).unwrap();
        assert_eq!(
            restored.identity_keys().curve25519,
            account.identity_keys().curve25519
        );
    }

    #[test]
    fn wrong_passphrase_is_rejected() {
        let pickle = PickleKey::new("secret").pickle_account(&Account::new());
        assert!(matches!(
            PickleKey::new("other").unpickle_account(&pickle),
            Err(Error::Pickle(_))
        ));
    }

    #[test]
    fn default_key_matches_named_default() {
        let account = Account::new();
        let pickle = PickleKey::default().pickle_account(&account);
        assert!(PickleKey::new("DEFAULT_KEY").unpickle_account(&pickle).is_ok());
        assert_eq!(PickleKey::default().passphrase(), DEFAULT_PICKLE_KEY);
    }

    #[test]
    fn debug_output_hides_key_material() {
        assert_eq!(format!("{:?}", PickleKey::new("secret")), "PickleKey(..)");
    }
}
