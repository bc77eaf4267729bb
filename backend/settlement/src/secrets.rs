//! In-memory credential vault.
//!
//! Unlock passwords and first-loss credentials are held here, keyed by purpose
//! and index, and never written to the record store. `take` hands the secret
//! out exactly once; dropping a [`SecretString`] zeroes its memory.

use std::collections::HashMap;
use std::sync::Mutex;

use secrecy::{ExposeSecret, SecretString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialSlot {
    /// Recipient password staged by the unlock handshake, keyed by project.
    UnlockSecret,
    /// Password a recipient pre-registers so the raise unlocks automatically.
    OneTimeUnlock,
    /// Guarantor password backing the first-loss pledge, keyed by entity.
    FirstLoss,
}

#[derive(Default)]
pub struct CredentialVault {
    slots: Mutex<HashMap<(CredentialSlot, u64), SecretString>>,
}

impl CredentialVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a secret, replacing (and dropping) any previous one.
    pub fn stage(&self, slot: CredentialSlot, index: u64, secret: SecretString) {
        self.lock().insert((slot, index), secret);
    }

    /// Remove and return the secret.
    pub fn take(&self, slot: CredentialSlot, index: u64) -> Option<SecretString> {
        self.lock().remove(&(slot, index))
    }

    /// Copy of the secret without consuming it; for long-lived pledges.
    pub fn peek(&self, slot: CredentialSlot, index: u64) -> Option<SecretString> {
        self.lock()
            .get(&(slot, index))
            .map(|s| SecretString::from(s.expose_secret().to_owned()))
    }

    pub fn contains(&self, slot: CredentialSlot, index: u64) -> bool {
        self.lock().contains_key(&(slot, index))
    }

    pub fn clear(&self, slot: CredentialSlot, index: u64) {
        self.lock().remove(&(slot, index));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(CredentialSlot, u64), SecretString>> {
        // A poisoned vault still holds valid secrets; keep serving them.
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}
