//! Session state and its persistence.
//!
//! A session is the client-held record of authentication: an opaque bearer
//! token, an optional absolute expiry (epoch milliseconds) and the role id the
//! backend reported at login. The token is never decoded here.

use crate::storage::KeyValueStorage;
use anyhow::Result;
use tracing::warn;

pub const DEFAULT_TOKEN_KEY: &str = "app_token";
pub const DEFAULT_EXPIRY_KEY: &str = "app_token_exp";
pub const DEFAULT_ROLE_KEY: &str = "app_role_id";

/// Source of "now" in epoch milliseconds
pub trait Clock {
    fn now_millis(&self) -> i64;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Authentication state as seen by the rest of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Anonymous,
    Authenticated,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Authenticated => "authenticated",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub token: Option<String>,
    pub expires_at: Option<i64>,
    pub role_id: Option<u8>,
}

impl Session {
    /// True once `now` has reached a known expiry
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|exp| now_ms >= exp)
    }

    pub fn state(&self, now_ms: i64) -> SessionState {
        if self.active_token(now_ms).is_some() {
            SessionState::Authenticated
        } else {
            SessionState::Anonymous
        }
    }

    /// The token, unless it is absent or past its expiry
    pub fn active_token(&self, now_ms: i64) -> Option<&str> {
        match &self.token {
            Some(token) if !self.is_expired(now_ms) => Some(token.as_str()),
            _ => None,
        }
    }

    /// The role id, only while the token is usable
    pub fn active_role_id(&self, now_ms: i64) -> Option<u8> {
        self.active_token(now_ms).and(self.role_id)
    }

    /// Milliseconds until expiry, if the session has one
    pub fn remaining_millis(&self, now_ms: i64) -> Option<i64> {
        self.expires_at.map(|exp| (exp - now_ms).max(0))
    }
}

/// Storage key names for the persisted session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    pub token: String,
    pub expiry: String,
    pub role: String,
}

impl Default for StorageKeys {
    fn default() -> Self {
        Self {
            token: DEFAULT_TOKEN_KEY.to_string(),
            expiry: DEFAULT_EXPIRY_KEY.to_string(),
            role: DEFAULT_ROLE_KEY.to_string(),
        }
    }
}

/// Durable holder of the session
pub struct SessionStore<S> {
    storage: S,
    keys: StorageKeys,
}

impl<S: KeyValueStorage> SessionStore<S> {
    pub fn new(storage: S, keys: StorageKeys) -> Self {
        Self { storage, keys }
    }

    /// Read the persisted session. Missing or unreadable values become absent.
    pub fn load(&self) -> Session {
        Session {
            token: self.read(&self.keys.token).filter(|t| !t.is_empty()),
            expires_at: self.read(&self.keys.expiry).and_then(|v| parse_number(&v)),
            role_id: self.read(&self.keys.role).and_then(|v| parse_number(&v)),
        }
    }

    /// Persist the session. A session without a token removes every key.
    ///
    /// The token key goes first on removal and last on write, so a failure
    /// part way through leaves no token rather than a token paired with
    /// another session's expiry or role.
    pub fn save(&self, session: &Session) -> Result<()> {
        self.storage.remove(&self.keys.token)?;
        let token = match &session.token {
            Some(token) => token,
            None => {
                self.storage.remove(&self.keys.expiry)?;
                self.storage.remove(&self.keys.role)?;
                return Ok(());
            }
        };

        match session.expires_at {
            Some(exp) => self.storage.set(&self.keys.expiry, &exp.to_string())?,
            None => self.storage.remove(&self.keys.expiry)?,
        }
        match session.role_id {
            Some(role) => self.storage.set(&self.keys.role, &role.to_string())?,
            None => self.storage.remove(&self.keys.role)?,
        }
        self.storage.set(&self.keys.token, token)
    }

    pub fn clear(&self) -> Result<()> {
        self.save(&Session::default())
    }

    fn read(&self, key: &str) -> Option<String> {
        match self.storage.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Failed to read session storage");
                None
            }
        }
    }
}

fn parse_number<T: std::str::FromStr>(value: &str) -> Option<T> {
    value.trim().parse().ok()
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    const NOW: i64 = 1_700_000_000_000;

    fn store(storage: &MemoryStorage) -> SessionStore<&MemoryStorage> {
        SessionStore::new(storage, StorageKeys::default())
    }

    #[test]
    fn test_session_state() {
        let session = Session::default();
        assert_eq!(session.state(NOW), SessionState::Anonymous);

        let session = Session {
            token: Some("abc".to_string()),
            expires_at: None,
            role_id: Some(5),
        };
        assert_eq!(session.state(NOW), SessionState::Authenticated);
        assert_eq!(session.active_role_id(NOW), Some(5));
        assert!(session.remaining_millis(NOW).is_none());

        let session = Session {
            token: Some("abc".to_string()),
            expires_at: Some(NOW),
            role_id: Some(5),
        };
        // Expiry is inclusive
        assert!(session.is_expired(NOW));
        assert_eq!(session.state(NOW), SessionState::Anonymous);
        assert!(session.active_token(NOW).is_none());
        assert!(session.active_role_id(NOW).is_none());
        assert_eq!(session.state(NOW - 1), SessionState::Authenticated);
    }

    #[test]
    fn test_load_empty_storage() {
        let storage = MemoryStorage::new();
        assert_eq!(store(&storage).load(), Session::default());
    }

    #[test]
    fn test_save_and_load() {
        let storage = MemoryStorage::new();
        let session = Session {
            token: Some("tok".to_string()),
            expires_at: Some(NOW + 1000),
            role_id: Some(3),
        };
        store(&storage).save(&session).unwrap();

        assert_eq!(storage.get("app_token").unwrap().as_deref(), Some("tok"));
        assert_eq!(
            storage.get("app_token_exp").unwrap(),
            Some((NOW + 1000).to_string())
        );
        assert_eq!(storage.get("app_role_id").unwrap().as_deref(), Some("3"));
        assert_eq!(store(&storage).load(), session);
    }

    #[test]
    fn test_save_without_expiry_removes_stale_key() {
        let storage = MemoryStorage::new();
        storage.set("app_token_exp", "123").unwrap();

        let session = Session {
            token: Some("tok".to_string()),
            expires_at: None,
            role_id: None,
        };
        store(&storage).save(&session).unwrap();
        assert!(storage.get("app_token_exp").unwrap().is_none());
        assert!(storage.get("app_role_id").unwrap().is_none());
    }

    #[test]
    fn test_save_without_token_clears_all_keys() {
        let storage = MemoryStorage::new();
        storage.set("app_token", "tok").unwrap();
        storage.set("app_token_exp", "123").unwrap();
        storage.set("app_role_id", "1").unwrap();

        store(&storage)
            .save(&Session {
                token: None,
                expires_at: Some(42),
                role_id: Some(1),
            })
            .unwrap();
        assert!(storage.is_empty());
    }

    #[test]
    fn test_load_ignores_garbage_values() {
        let storage = MemoryStorage::new();
        storage.set("app_token", "tok").unwrap();
        storage.set("app_token_exp", "soon").unwrap();
        storage.set("app_role_id", "-7").unwrap();

        let session = store(&storage).load();
        assert_eq!(session.token.as_deref(), Some("tok"));
        assert!(session.expires_at.is_none());
        assert!(session.role_id.is_none());
    }

    /// Memory storage whose `set` starts failing after `allowed` writes
    struct FlakyStorage {
        inner: MemoryStorage,
        allowed: std::cell::Cell<usize>,
    }

    impl KeyValueStorage for FlakyStorage {
        fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<()> {
            if self.allowed.get() == 0 {
                return Err(anyhow::anyhow!("disk full writing {}", key));
            }
            self.allowed.set(self.allowed.get() - 1);
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<()> {
            self.inner.remove(key)
        }
    }

    #[test]
    fn test_failed_save_never_mixes_sessions() {
        let previous = Session {
            token: Some("old".to_string()),
            expires_at: Some(NOW + 60_000),
            role_id: Some(1),
        };
        let next = Session {
            token: Some("new".to_string()),
            expires_at: Some(NOW + 3_600_000),
            role_id: Some(5),
        };

        for allowed in 0..3 {
            let storage = FlakyStorage {
                inner: MemoryStorage::new(),
                allowed: std::cell::Cell::new(usize::MAX),
            };
            let store = SessionStore::new(&storage, StorageKeys::default());
            store.save(&previous).unwrap();

            storage.allowed.set(allowed);
            assert!(store.save(&next).is_err());

            // Anonymous after the failure: no token survives next to stale keys
            let loaded = store.load();
            assert!(loaded.token.is_none(), "token left after {} writes", allowed);
            assert_eq!(loaded.state(NOW), SessionState::Anonymous);
        }
    }

    #[test]
    fn test_custom_keys() {
        let storage = MemoryStorage::new();
        let keys = StorageKeys {
            token: "t".to_string(),
            expiry: "e".to_string(),
            role: "r".to_string(),
        };
        let store = SessionStore::new(&storage, keys);
        store
            .save(&Session {
                token: Some("x".to_string()),
                expires_at: Some(1),
                role_id: Some(2),
            })
            .unwrap();
        assert_eq!(storage.get("t").unwrap().as_deref(), Some("x"));
        assert!(storage.get("app_token").unwrap().is_none());

        store.clear().unwrap();
        assert!(storage.is_empty());
    }
}
