// Library exports for host applications and integration tests

pub mod config;
pub mod lastfm;
pub mod models;
pub mod optimistic;
pub mod progress;
pub mod queue;
pub mod retry;
pub mod scrobbler;
pub mod secrets;
pub mod session;

// Re-export the types a host wires together
pub use config::ScrobblerConfig;
pub use lastfm::{LastfmClient, ScrobbleError, ScrobbleService};
pub use models::{ScrobbleResult, ScrobbleTrack};
pub use queue::ScrobbleQueue;
pub use scrobbler::{FlushOutcome, PeriodicFlushHandle, ScrobbleEvent, Scrobbler};
pub use secrets::{KeyringSecretStore, SecretStore, StoredSession};
pub use session::{ScrobbleAuthState, SessionManager};

// Test support (in-crate tests and the test-utils feature)
#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;
