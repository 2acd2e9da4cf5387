use tracing::debug;

use crate::models::ScrobbleTrack;

/// Accumulated play time past which any track may scrobble.
const ABSOLUTE_THRESHOLD_SECS: f64 = 240.0;
/// A position delta at or past this is a seek artifact, not playback.
const MAX_SAMPLE_DELTA_SECS: f64 = 2.0;

/// What one position sample did to the tracked play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    /// Sample recorded (or discarded as a seek); below threshold.
    Accumulating,
    /// This sample pushed the play past its scrobble threshold. Reported
    /// once per tracked play.
    BecameEligible,
    /// No play is being tracked.
    Idle,
}

/// Accumulates genuine listening time for the current play and decides when
/// it becomes scrobble-eligible.
///
/// Position samples arrive periodically from the playback engine. Small
/// forward movement counts as listening; jumps in either direction only move
/// the reference point, so seeking can never earn progress. The eligibility
/// threshold is half the track length, capped at four minutes; a track of
/// unknown length uses the cap alone.
#[derive(Debug, Default)]
pub struct PlayProgressTracker {
    current: Option<TrackedPlay>,
}

#[derive(Debug)]
struct TrackedPlay {
    track: ScrobbleTrack,
    accumulated_secs: f64,
    last_observed_secs: f64,
    eligible_fired: bool,
}

impl TrackedPlay {
    fn threshold_secs(&self) -> f64 {
        match self.track.duration_secs {
            Some(duration) if duration > 0 => {
                (f64::from(duration) / 2.0).min(ABSOLUTE_THRESHOLD_SECS)
            }
            _ => ABSOLUTE_THRESHOLD_SECS,
        }
    }
}

impl PlayProgressTracker {
    pub fn new() -> Self {
        PlayProgressTracker { current: None }
    }

    /// Begin tracking a new play, discarding all prior progress.
    pub fn track_changed(&mut self, track: ScrobbleTrack) {
        debug!("Tracking play progress for {} - {}", track.artist, track.title);
        self.current = Some(TrackedPlay {
            track,
            accumulated_secs: 0.0,
            last_observed_secs: 0.0,
            eligible_fired: false,
        });
    }

    /// Stop tracking without scrobbling.
    pub fn clear(&mut self) {
        self.current = None;
    }

    /// Feed one position sample, in seconds from track start.
    ///
    /// The delta against the previous sample is accumulated only when it is
    /// positive and below the seek cutoff; the reference point advances
    /// either way.
    pub fn record_sample(&mut self, position_secs: f64) -> SampleOutcome {
        let Some(play) = self.current.as_mut() else {
            return SampleOutcome::Idle;
        };

        let delta = position_secs - play.last_observed_secs;
        play.last_observed_secs = position_secs;

        if delta > 0.0 && delta < MAX_SAMPLE_DELTA_SECS {
            play.accumulated_secs += delta;
        }

        if !play.eligible_fired && play.accumulated_secs >= play.threshold_secs() {
            play.eligible_fired = true;
            debug!(
                "{} - {} crossed its scrobble threshold at {:.1}s listened",
                play.track.artist, play.track.title, play.accumulated_secs
            );
            return SampleOutcome::BecameEligible;
        }
        SampleOutcome::Accumulating
    }

    /// The play being tracked, if any.
    pub fn current_track(&self) -> Option<&ScrobbleTrack> {
        self.current.as_ref().map(|play| &play.track)
    }

    /// Seconds of genuine listening recorded for the current play.
    pub fn accumulated_secs(&self) -> f64 {
        self.current
            .as_ref()
            .map(|play| play.accumulated_secs)
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_for(duration_secs: Option<u32>) -> PlayProgressTracker {
        let mut track = ScrobbleTrack::new("Artist", "Title");
        track.duration_secs = duration_secs;
        let mut tracker = PlayProgressTracker::new();
        tracker.track_changed(track);
        tracker
    }

    /// Feed samples advancing by `step` until `until`, returning the
    /// position at which eligibility fired, if it did.
    fn drive(tracker: &mut PlayProgressTracker, step: f64, until: f64) -> Option<f64> {
        let mut position = 0.0;
        while position < until {
            position += step;
            if tracker.record_sample(position) == SampleOutcome::BecameEligible {
                return Some(position);
            }
        }
        None
    }

    #[test]
    fn steady_samples_accumulate() {
        let mut tracker = tracker_for(Some(300));
        for n in 1..=10 {
            tracker.record_sample(n as f64 * 0.5);
        }
        assert!(
            (tracker.accumulated_secs() - 5.0).abs() < 0.1,
            "10 half-second advances should accumulate ~5s, got {}",
            tracker.accumulated_secs()
        );
    }

    #[test]
    fn seeks_in_either_direction_earn_nothing() {
        let mut tracker = tracker_for(Some(300));
        tracker.record_sample(9.5);
        tracker.record_sample(10.0);
        let earned = tracker.accumulated_secs();
        assert!((earned - 0.5).abs() < 1e-9);

        // Forward seek 10s -> 100s.
        tracker.record_sample(100.0);
        assert_eq!(tracker.accumulated_secs(), earned);

        // Backward seek 100s -> 10s.
        tracker.record_sample(10.0);
        assert_eq!(tracker.accumulated_secs(), earned);

        // The reference moved with the rewind, so playback resumes counting.
        tracker.record_sample(10.5);
        assert!((tracker.accumulated_secs() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn paused_playback_earns_nothing() {
        let mut tracker = tracker_for(Some(300));
        tracker.record_sample(1.0);
        tracker.record_sample(1.0);
        tracker.record_sample(1.0);
        assert!((tracker.accumulated_secs() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn short_track_uses_the_half_duration_rule() {
        let mut tracker = tracker_for(Some(180));
        let fired_at = drive(&mut tracker, 0.5, 200.0);
        let position = fired_at.expect("a 180s track must become eligible");
        assert!(
            (89.0..92.0).contains(&position),
            "expected eligibility near 90s, fired at {}",
            position
        );
    }

    #[test]
    fn long_track_is_capped_at_four_minutes() {
        let mut tracker = tracker_for(Some(600));
        let fired_at = drive(&mut tracker, 0.5, 400.0);
        let position = fired_at.expect("a 600s track must become eligible");
        assert!(
            (239.0..242.0).contains(&position),
            "expected eligibility near 240s, fired at {}",
            position
        );
    }

    #[test]
    fn unknown_duration_uses_the_cap_alone() {
        let mut tracker = tracker_for(None);
        let fired_at = drive(&mut tracker, 0.5, 400.0);
        let position = fired_at.expect("unknown-length track must use 240s");
        assert!((239.0..242.0).contains(&position));
    }

    #[test]
    fn eligibility_fires_once_per_play() {
        let mut tracker = tracker_for(Some(10));
        assert!(drive(&mut tracker, 0.5, 10.0).is_some());
        for n in 0..20 {
            assert_eq!(
                tracker.record_sample(10.0 + n as f64 * 0.5),
                SampleOutcome::Accumulating,
                "eligibility must not fire twice for one play"
            );
        }
    }

    #[test]
    fn track_change_resets_progress() {
        let mut tracker = tracker_for(Some(10));
        assert!(drive(&mut tracker, 0.5, 10.0).is_some());

        let mut next = ScrobbleTrack::new("Artist", "Next");
        next.duration_secs = Some(10);
        tracker.track_changed(next);
        assert_eq!(tracker.accumulated_secs(), 0.0);
        // The new play needs its own 5s, and can reach it.
        assert!(drive(&mut tracker, 0.5, 10.0).is_some());
    }

    #[test]
    fn idle_without_a_track() {
        let mut tracker = PlayProgressTracker::new();
        assert_eq!(tracker.record_sample(1.0), SampleOutcome::Idle);
        tracker.track_changed(ScrobbleTrack::new("Artist", "Title"));
        tracker.clear();
        assert_eq!(tracker.record_sample(2.0), SampleOutcome::Idle);
    }
}
