use keyring::Entry;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum SecretStoreError {
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),
}

/// A restorable sign-in: the service session token and the account it
/// belongs to. Only ever constructed with both halves present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSession {
    pub session_key: String,
    pub username: String,
}

/// Narrow credential persistence seam (allows mocking for tests).
///
/// Implementations store two entries. `remove_credentials` clears both, and
/// removing an absent entry is not an error.
pub trait SecretStore: Send + Sync {
    fn save_session_key(&self, value: &str) -> Result<(), SecretStoreError>;
    fn session_key(&self) -> Result<Option<String>, SecretStoreError>;
    fn save_username(&self, value: &str) -> Result<(), SecretStoreError>;
    fn username(&self) -> Result<Option<String>, SecretStoreError>;
    fn remove_credentials(&self) -> Result<(), SecretStoreError>;

    /// The stored session, if both entries are present.
    ///
    /// A partial pair (token without username, or vice versa) reads as
    /// signed out; callers never observe half a session.
    fn load_session(&self) -> Result<Option<StoredSession>, SecretStoreError> {
        let session_key = self.session_key()?;
        let username = self.username()?;
        Ok(match (session_key, username) {
            (Some(session_key), Some(username)) => Some(StoredSession {
                session_key,
                username,
            }),
            _ => None,
        })
    }

    fn store_session(&self, session: &StoredSession) -> Result<(), SecretStoreError> {
        self.save_session_key(&session.session_key)?;
        self.save_username(&session.username)
    }
}

const SESSION_KEY_ENTRY: &str = "scrobble_session_key";
const USERNAME_ENTRY: &str = "scrobble_username";

/// Credentials in the OS keychain, one keyring entry per value.
#[derive(Debug, Clone)]
pub struct KeyringSecretStore {
    service: String,
}

impl KeyringSecretStore {
    /// `service` namespaces the entries, typically the host app name.
    pub fn new(service: impl Into<String>) -> Self {
        KeyringSecretStore {
            service: service.into(),
        }
    }

    fn entry(&self, name: &str) -> Result<Entry, SecretStoreError> {
        Ok(Entry::new(&self.service, name)?)
    }

    fn read(&self, name: &str) -> Result<Option<String>, SecretStoreError> {
        match self.entry(name)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(SecretStoreError::Keyring(e)),
        }
    }

    fn delete(&self, name: &str) -> Result<(), SecretStoreError> {
        match self.entry(name)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(SecretStoreError::Keyring(e)),
        }
    }
}

impl SecretStore for KeyringSecretStore {
    fn save_session_key(&self, value: &str) -> Result<(), SecretStoreError> {
        self.entry(SESSION_KEY_ENTRY)?.set_password(value)?;
        Ok(())
    }

    fn session_key(&self) -> Result<Option<String>, SecretStoreError> {
        self.read(SESSION_KEY_ENTRY)
    }

    fn save_username(&self, value: &str) -> Result<(), SecretStoreError> {
        self.entry(USERNAME_ENTRY)?.set_password(value)?;
        Ok(())
    }

    fn username(&self) -> Result<Option<String>, SecretStoreError> {
        self.read(USERNAME_ENTRY)
    }

    fn remove_credentials(&self) -> Result<(), SecretStoreError> {
        self.delete(SESSION_KEY_ENTRY)?;
        self.delete(USERNAME_ENTRY)?;
        info!("Cleared stored scrobble credentials");
        Ok(())
    }
}
