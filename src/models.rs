use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// A play that crossed its scrobble threshold, frozen for submission.
///
/// The `id` is the queue identity: it is minted per play instance, so the
/// same song played twice yields two distinct scrobbles, while re-enqueueing
/// the same instance is idempotent. `source_id` is the playback engine's
/// stable track identifier, kept for host bookkeeping only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrobbleTrack {
    pub id: String,
    pub artist: String,
    pub title: String,
    pub album: Option<String>,
    /// Track length in seconds, when the playback engine knows it.
    pub duration_secs: Option<u32>,
    /// Wall-clock play start, seconds since the Unix epoch.
    pub timestamp: i64,
    pub source_id: Option<String>,
}

impl ScrobbleTrack {
    /// Snapshot a play that starts now, with a fresh queue identity.
    pub fn new(artist: impl Into<String>, title: impl Into<String>) -> Self {
        ScrobbleTrack {
            id: Uuid::new_v4().to_string(),
            artist: artist.into(),
            title: title.into(),
            album: None,
            duration_secs: None,
            timestamp: Utc::now().timestamp(),
            source_id: None,
        }
    }
}

// Identity is the opaque id alone. Two snapshots of the same play compare
// equal even if metadata was edited in between; two plays of the same song
// never compare equal.
impl PartialEq for ScrobbleTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ScrobbleTrack {}

impl Hash for ScrobbleTrack {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// The service's verdict on one submitted scrobble.
///
/// Corrections are the service's fuzzy-matched artist/title. They are
/// surfaced to the host but never written back into local metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScrobbleResult {
    pub track_id: String,
    pub accepted: bool,
    pub corrected_artist: Option<String>,
    pub corrected_title: Option<String>,
    /// Why the service ignored the scrobble, when it did.
    pub ignored_reason: Option<String>,
}

impl ScrobbleResult {
    pub fn accepted(track_id: impl Into<String>) -> Self {
        ScrobbleResult {
            track_id: track_id.into(),
            accepted: true,
            corrected_artist: None,
            corrected_title: None,
            ignored_reason: None,
        }
    }

    pub fn rejected(track_id: impl Into<String>, reason: impl Into<String>) -> Self {
        ScrobbleResult {
            track_id: track_id.into(),
            accepted: false,
            corrected_artist: None,
            corrected_title: None,
            ignored_reason: Some(reason.into()),
        }
    }

    pub fn was_corrected(&self) -> bool {
        self.corrected_artist.is_some() || self.corrected_title.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_keyed_on_id_only() {
        let mut a = ScrobbleTrack::new("Boards of Canada", "Roygbiv");
        let mut b = a.clone();
        b.title = "ROYGBIV".to_string();
        assert_eq!(a, b, "same id must compare equal despite edited metadata");

        a.id = "play-1".to_string();
        b.id = "play-2".to_string();
        b.title = a.title.clone();
        assert_ne!(a, b, "distinct ids are distinct plays");
    }

    #[test]
    fn new_snapshots_get_distinct_ids() {
        let a = ScrobbleTrack::new("Artist", "Title");
        let b = ScrobbleTrack::new("Artist", "Title");
        assert_ne!(a, b);
    }

    #[test]
    fn correction_flag() {
        let mut result = ScrobbleResult::accepted("t1");
        assert!(!result.was_corrected());
        result.corrected_artist = Some("Corrected".to_string());
        assert!(result.was_corrected());
    }
}
