//! Transient secrets and the credential resolution seam.
//!
//! Recordings only ever hold `{credential_name, field}` references; the
//! value exists in memory for the moment between resolution and input
//! injection, then is overwritten.

use std::fmt;

use zeroize::Zeroize;

use crate::action::CredentialField;
use crate::error::ResolveError;

/// A resolved credential value.
///
/// Usable exactly once by the playback engine: callers clear it immediately
/// after delivering it to input injection. Dropping it zeroizes as a
/// backstop. Never serialized, never printed.
pub struct Secret {
    value: String,
}

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    /// Borrow the value for immediate delivery to input injection.
    pub fn reveal(&self) -> &str {
        &self.value
    }

    /// Overwrite the in-memory value now. Also performed on drop.
    pub fn clear(&mut self) {
        self.value.zeroize();
    }

    pub fn is_cleared(&self) -> bool {
        self.value.is_empty()
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.value.zeroize();
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Capability implemented by the secret-store collaborator.
pub trait SecretStore: Send + Sync {
    fn resolve(&self, name: &str, field: CredentialField) -> Result<Secret, ResolveError>;
}

/// Thin adapter between the playback engine and the secret store.
///
/// Retains no copy of any resolved value; only the reference is ever logged.
pub struct CredentialResolver<S> {
    store: S,
}

impl<S: SecretStore> CredentialResolver<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn resolve(&self, name: &str, field: CredentialField) -> Result<Secret, ResolveError> {
        tracing::debug!(credential = name, field = %field, "resolving credential reference");
        self.store.resolve(name, field)
    }
}
