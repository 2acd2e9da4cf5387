// Test support utilities for both unit and integration tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::lastfm::{ScrobbleError, ScrobbleService};
use crate::models::{ScrobbleResult, ScrobbleTrack};
use crate::secrets::{SecretStore, SecretStoreError, StoredSession};

/// In-memory secret store.
///
/// Entries are independently settable so tests can stage half-written
/// sessions.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    session_key: Mutex<Option<String>>,
    username: Mutex<Option<String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn save_session_key(&self, session_key: &str) -> Result<(), SecretStoreError> {
        *self.session_key.lock().unwrap() = Some(session_key.to_string());
        Ok(())
    }

    fn session_key(&self) -> Result<Option<String>, SecretStoreError> {
        Ok(self.session_key.lock().unwrap().clone())
    }

    fn save_username(&self, username: &str) -> Result<(), SecretStoreError> {
        *self.username.lock().unwrap() = Some(username.to_string());
        Ok(())
    }

    fn username(&self) -> Result<Option<String>, SecretStoreError> {
        Ok(self.username.lock().unwrap().clone())
    }

    fn remove_credentials(&self) -> Result<(), SecretStoreError> {
        *self.session_key.lock().unwrap() = None;
        *self.username.lock().unwrap() = None;
        Ok(())
    }
}

/// Failure a [`MockScrobbleService`] fabricates on demand. The real error
/// type wraps transport errors that cannot be built by hand, so the mock
/// works from this reduced set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    ServiceUnavailable,
    SessionExpired,
    InvalidCredentials,
    RateLimited,
}

impl MockFailure {
    pub fn to_error(self) -> ScrobbleError {
        match self {
            MockFailure::ServiceUnavailable => ScrobbleError::ServiceUnavailable,
            MockFailure::SessionExpired => ScrobbleError::SessionExpired,
            MockFailure::InvalidCredentials => ScrobbleError::InvalidCredentials,
            MockFailure::RateLimited => ScrobbleError::RateLimited { retry_after: None },
        }
    }
}

/// Scrobble service double that records every call and can be told to fail
/// or stall on demand.
#[derive(Debug)]
pub struct MockScrobbleService {
    scrobbles: Mutex<Vec<Vec<ScrobbleTrack>>>,
    now_playing: Mutex<Vec<ScrobbleTrack>>,
    authenticated: Mutex<Vec<String>>,
    reject_ids: Mutex<Vec<String>>,
    fail_next: AtomicUsize,
    failure: Mutex<MockFailure>,
    scrobble_calls: AtomicUsize,
    delay: Mutex<Duration>,
}

impl Default for MockScrobbleService {
    fn default() -> Self {
        MockScrobbleService {
            scrobbles: Mutex::new(Vec::new()),
            now_playing: Mutex::new(Vec::new()),
            authenticated: Mutex::new(Vec::new()),
            reject_ids: Mutex::new(Vec::new()),
            fail_next: AtomicUsize::new(0),
            failure: Mutex::new(MockFailure::ServiceUnavailable),
            scrobble_calls: AtomicUsize::new(0),
            delay: Mutex::new(Duration::ZERO),
        }
    }
}

impl MockScrobbleService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` service calls with the given failure, then
    /// recover.
    pub fn fail_next(&self, count: usize, failure: MockFailure) {
        *self.failure.lock().unwrap() = failure;
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Mark these track ids as rejected in subsequent scrobble verdicts.
    pub fn reject_tracks(&self, ids: &[&str]) {
        *self.reject_ids.lock().unwrap() = ids.iter().map(|id| id.to_string()).collect();
    }

    /// Stall each scrobble call for `delay`, to hold a flush open while a
    /// test probes concurrent behavior.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn scrobbled_batches(&self) -> Vec<Vec<ScrobbleTrack>> {
        self.scrobbles.lock().unwrap().clone()
    }

    pub fn now_playing_updates(&self) -> Vec<ScrobbleTrack> {
        self.now_playing.lock().unwrap().clone()
    }

    pub fn authenticated(&self) -> Vec<String> {
        self.authenticated.lock().unwrap().clone()
    }

    /// How many times `scrobble` was invoked, failed calls included.
    pub fn scrobble_calls(&self) -> usize {
        self.scrobble_calls.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> Option<ScrobbleError> {
        if self.fail_next.load(Ordering::SeqCst) == 0 {
            return None;
        }
        self.fail_next.fetch_sub(1, Ordering::SeqCst);
        Some(self.failure.lock().unwrap().to_error())
    }
}

#[async_trait::async_trait]
impl ScrobbleService for MockScrobbleService {
    async fn authenticate(
        &self,
        username: &str,
        _password: &str,
    ) -> Result<StoredSession, ScrobbleError> {
        if let Some(error) = self.take_failure() {
            return Err(error);
        }
        self.authenticated.lock().unwrap().push(username.to_string());
        Ok(StoredSession {
            session_key: "mock-session-key".to_string(),
            username: username.to_string(),
        })
    }

    async fn update_now_playing(&self, track: &ScrobbleTrack) -> Result<(), ScrobbleError> {
        if let Some(error) = self.take_failure() {
            return Err(error);
        }
        self.now_playing.lock().unwrap().push(track.clone());
        Ok(())
    }

    async fn scrobble(
        &self,
        tracks: &[ScrobbleTrack],
    ) -> Result<Vec<ScrobbleResult>, ScrobbleError> {
        self.scrobble_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.take_failure() {
            return Err(error);
        }

        self.scrobbles.lock().unwrap().push(tracks.to_vec());
        let reject_ids = self.reject_ids.lock().unwrap();
        Ok(tracks
            .iter()
            .map(|track| {
                if reject_ids.contains(&track.id) {
                    ScrobbleResult::rejected(&track.id, "rejected by test")
                } else {
                    ScrobbleResult::accepted(&track.id)
                }
            })
            .collect())
    }

    async fn validate_session(&self) -> Result<bool, ScrobbleError> {
        match self.take_failure() {
            None => Ok(true),
            Some(ScrobbleError::SessionExpired | ScrobbleError::InvalidCredentials) => Ok(false),
            Some(error) => Err(error),
        }
    }
}
