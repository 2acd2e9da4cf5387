use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::config::ScrobblerConfig;
use crate::lastfm::{ScrobbleError, ScrobbleService};
use crate::models::{ScrobbleResult, ScrobbleTrack};
use crate::optimistic::PendingChange;
use crate::progress::{PlayProgressTracker, SampleOutcome};
use crate::queue::{QueueError, ScrobbleQueue};
use crate::session::SessionManager;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Pipeline notifications for a host UI. Lagging subscribers lose old
/// events, never block the pipeline.
#[derive(Debug, Clone)]
pub enum ScrobbleEvent {
    /// A play crossed its threshold and was written to the pending queue.
    Queued { track: ScrobbleTrack },
    /// The service accepted a scrobble; `result` carries any corrected
    /// metadata. Corrections are surfaced, never applied locally.
    Submitted { result: ScrobbleResult },
    /// The service answered but refused this scrobble. Its row stays
    /// pending.
    Rejected { result: ScrobbleResult },
    NowPlayingChanged { track: Option<ScrobbleTrack> },
    /// The stored session is no longer honored; the user needs to sign in
    /// again before queued scrobbles can drain.
    AuthRequired,
    Error { message: String },
}

/// What a single `flush` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Flushed { submitted: usize },
    /// Nothing was pending.
    Idle,
    /// Another flush held the lock; this call coalesced into it.
    AlreadyRunning,
    NotConnected,
    Failed,
}

#[derive(Debug, Default)]
struct TrackerState {
    progress: PlayProgressTracker,
    now_playing: Option<ScrobbleTrack>,
}

/// Ties playback observation, the durable queue, the session, and the wire
/// client into one pipeline.
///
/// Cloning is cheap and shares all state, which is how the flush task and
/// spawned now-playing pushes hold onto it. The tracker lock is synchronous
/// and never held across an await; the flush lock is async and taken with
/// `try_lock` so at most one flush is in flight.
#[derive(Clone)]
pub struct Scrobbler {
    service: Arc<dyn ScrobbleService>,
    session: Arc<SessionManager>,
    queue: ScrobbleQueue,
    state: Arc<Mutex<TrackerState>>,
    flush_lock: Arc<tokio::sync::Mutex<()>>,
    events: broadcast::Sender<ScrobbleEvent>,
    batch_size: u32,
    flush_interval: Duration,
}

impl std::fmt::Debug for Scrobbler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scrobbler")
            .field("batch_size", &self.batch_size)
            .field("flush_interval", &self.flush_interval)
            .finish_non_exhaustive()
    }
}

impl Scrobbler {
    pub fn new(
        config: &ScrobblerConfig,
        service: Arc<dyn ScrobbleService>,
        session: Arc<SessionManager>,
        queue: ScrobbleQueue,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Scrobbler {
            service,
            session,
            queue,
            state: Arc::new(Mutex::new(TrackerState::default())),
            flush_lock: Arc::new(tokio::sync::Mutex::new(())),
            events,
            batch_size: config.batch_size,
            flush_interval: config.flush_interval,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScrobbleEvent> {
        self.events.subscribe()
    }

    /// The locally visible now-playing track. Set optimistically when a
    /// track starts and reverted if the network push fails.
    pub fn now_playing(&self) -> Option<ScrobbleTrack> {
        self.state.lock().unwrap().now_playing.clone()
    }

    pub async fn pending_count(&self) -> Result<u64, QueueError> {
        self.queue.pending_count().await
    }

    /// A new play began. Resets progress tracking to this track and pushes
    /// a best-effort now-playing update in the background.
    pub async fn track_started(&self, track: ScrobbleTrack) {
        debug!("Track started: {} - {}", track.artist, track.title);

        let change = {
            let mut state = self.state.lock().unwrap();
            state.progress.track_changed(track.clone());
            let change = PendingChange::new(state.now_playing.clone(), Some(track.clone()));
            state.now_playing = change.applied().clone();
            change
        };
        self.send_event(ScrobbleEvent::NowPlayingChanged {
            track: change.applied().clone(),
        });

        if !self.session.is_connected().await {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.push_now_playing(track, change).await;
        });
    }

    /// Playback stopped without a successor track.
    pub fn track_stopped(&self) {
        let changed = {
            let mut state = self.state.lock().unwrap();
            state.progress.clear();
            state.now_playing.take().is_some()
        };
        if changed {
            self.send_event(ScrobbleEvent::NowPlayingChanged { track: None });
        }
    }

    /// Feed one playback-position sample. Never fails: queue trouble is
    /// reported on the event stream rather than bubbled into the playback
    /// path.
    pub async fn record_progress(&self, position_secs: f64) {
        let (outcome, track) = {
            let mut state = self.state.lock().unwrap();
            let outcome = state.progress.record_sample(position_secs);
            (outcome, state.progress.current_track().cloned())
        };
        if outcome != SampleOutcome::BecameEligible {
            return;
        }
        let Some(track) = track else {
            return;
        };

        info!(
            "Play reached scrobble threshold: {} - {}",
            track.artist, track.title
        );
        match self.queue.enqueue(&track).await {
            Ok(()) => {
                self.send_event(ScrobbleEvent::Queued { track });
                let this = self.clone();
                tokio::spawn(async move {
                    this.flush().await;
                });
            }
            Err(e) => {
                error!("Failed to queue scrobble: {}", e);
                self.send_event(ScrobbleEvent::Error {
                    message: e.to_string(),
                });
            }
        }
    }

    /// Drain one batch of pending scrobbles to the service.
    ///
    /// Rows leave the queue only for verdicts that confirm acceptance.
    /// Rejected verdicts and call-level failures leave their rows pending
    /// for a later attempt; fatal auth failures additionally flip the
    /// session state so the flush cycle stops until the next sign-in.
    pub async fn flush(&self) -> FlushOutcome {
        let Ok(_guard) = self.flush_lock.try_lock() else {
            debug!("Flush already in flight, coalescing");
            return FlushOutcome::AlreadyRunning;
        };
        if !self.session.is_connected().await {
            return FlushOutcome::NotConnected;
        }

        let batch = match self.queue.dequeue(self.batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                error!("Failed to read pending scrobbles: {}", e);
                self.send_event(ScrobbleEvent::Error {
                    message: e.to_string(),
                });
                return FlushOutcome::Failed;
            }
        };
        if batch.is_empty() {
            return FlushOutcome::Idle;
        }

        info!("Flushing {} pending scrobbles", batch.len());
        let results = match self.service.scrobble(&batch).await {
            Ok(results) => results,
            Err(
                e @ (ScrobbleError::SessionExpired | ScrobbleError::InvalidCredentials),
            ) => {
                warn!("Flush refused by the service: {}", e);
                self.session.session_expired().await;
                self.send_event(ScrobbleEvent::AuthRequired);
                return FlushOutcome::Failed;
            }
            Err(e) => {
                warn!("Flush failed, scrobbles stay queued: {}", e);
                self.send_event(ScrobbleEvent::Error {
                    message: e.to_string(),
                });
                return FlushOutcome::Failed;
            }
        };

        let accepted: Vec<String> = results
            .iter()
            .filter(|result| result.accepted)
            .map(|result| result.track_id.clone())
            .collect();
        let submitted = accepted.len();
        if let Err(e) = self.queue.mark_completed(&accepted).await {
            error!("Failed to clear submitted scrobbles: {}", e);
            self.send_event(ScrobbleEvent::Error {
                message: e.to_string(),
            });
            return FlushOutcome::Failed;
        }

        for result in results {
            if result.accepted {
                self.send_event(ScrobbleEvent::Submitted { result });
            } else {
                warn!(
                    "Scrobble rejected by the service: {}",
                    result.ignored_reason.as_deref().unwrap_or("no reason given")
                );
                self.send_event(ScrobbleEvent::Rejected { result });
            }
        }
        FlushOutcome::Flushed { submitted }
    }

    /// Spawn the background drain loop. The task stops when `stop` is
    /// called on the handle or the handle is dropped.
    pub fn spawn_periodic_flush(&self) -> PeriodicFlushHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let this = self.clone();
        let interval = self.flush_interval;

        tokio::spawn(async move {
            debug!("Periodic flush every {:?}", interval);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        this.flush().await;
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Periodic flush stopped");
        });
        PeriodicFlushHandle { stop: stop_tx }
    }

    async fn push_now_playing(
        &self,
        track: ScrobbleTrack,
        change: PendingChange<Option<ScrobbleTrack>>,
    ) {
        match self.service.update_now_playing(&track).await {
            Ok(()) => {
                debug!("Now playing: {} - {}", track.artist, track.title);
                change.commit();
            }
            Err(e) => {
                warn!("Now-playing update failed: {}", e);
                let fatal = matches!(
                    e,
                    ScrobbleError::SessionExpired | ScrobbleError::InvalidCredentials
                );

                // Only roll back if no newer play has replaced our value.
                let reverted = {
                    let mut state = self.state.lock().unwrap();
                    if state.now_playing == *change.applied() {
                        state.now_playing = change.revert();
                        Some(state.now_playing.clone())
                    } else {
                        None
                    }
                };
                if let Some(current) = reverted {
                    self.send_event(ScrobbleEvent::NowPlayingChanged { track: current });
                }

                if fatal {
                    self.session.session_expired().await;
                    self.send_event(ScrobbleEvent::AuthRequired);
                }
            }
        }
    }

    fn send_event(&self, event: ScrobbleEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}

/// Keepalive for the periodic flush task. Dropping it stops the task.
#[derive(Debug)]
pub struct PeriodicFlushHandle {
    stop: watch::Sender<bool>,
}

impl PeriodicFlushHandle {
    pub fn stop(self) {
        let _ = self.stop.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MemorySecretStore, MockFailure, MockScrobbleService};
    use tempfile::TempDir;

    struct Harness {
        scrobbler: Scrobbler,
        service: Arc<MockScrobbleService>,
        session: Arc<SessionManager>,
        queue: ScrobbleQueue,
        _dir: TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let queue = ScrobbleQueue::open(dir.path()).await.unwrap();
        let service = Arc::new(MockScrobbleService::new());
        let session = Arc::new(SessionManager::new(Arc::new(MemorySecretStore::new())));
        let scrobbler = Scrobbler::new(
            &ScrobblerConfig::new("key", "secret"),
            service.clone(),
            session.clone(),
            queue.clone(),
        );
        Harness {
            scrobbler,
            service,
            session,
            queue,
            _dir: dir,
        }
    }

    async fn connected_harness() -> Harness {
        let h = harness().await;
        h.session
            .sign_in(h.service.as_ref(), "alice", "hunter2")
            .await
            .unwrap();
        h
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn flush_removes_only_accepted_rows() {
        let h = connected_harness().await;
        let kept = ScrobbleTrack::new("Artist", "Accepted");
        let refused = ScrobbleTrack::new("Artist", "Refused");
        h.queue.enqueue(&kept).await.unwrap();
        h.queue.enqueue(&refused).await.unwrap();
        h.service.reject_tracks(&[&refused.id]);

        let outcome = h.scrobbler.flush().await;
        assert_eq!(outcome, FlushOutcome::Flushed { submitted: 1 });

        let remaining = h.queue.dequeue(10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, refused.id);
    }

    #[tokio::test]
    async fn transport_failure_keeps_the_batch_queued() {
        let h = connected_harness().await;
        let track = ScrobbleTrack::new("Artist", "Song");
        h.queue.enqueue(&track).await.unwrap();
        h.service.fail_next(1, MockFailure::ServiceUnavailable);

        assert_eq!(h.scrobbler.flush().await, FlushOutcome::Failed);
        assert_eq!(h.queue.pending_count().await.unwrap(), 1);

        // The next flush retries the same row and succeeds.
        assert_eq!(
            h.scrobbler.flush().await,
            FlushOutcome::Flushed { submitted: 1 }
        );
        assert_eq!(h.queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn flush_without_a_session_makes_no_network_call() {
        let h = harness().await;
        let track = ScrobbleTrack::new("Artist", "Song");
        h.queue.enqueue(&track).await.unwrap();

        assert_eq!(h.scrobbler.flush().await, FlushOutcome::NotConnected);
        assert_eq!(h.service.scrobble_calls(), 0);
        assert_eq!(h.queue.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_queue_flush_is_idle_without_network() {
        let h = connected_harness().await;
        assert_eq!(h.scrobbler.flush().await, FlushOutcome::Idle);
        assert_eq!(h.service.scrobble_calls(), 0);
    }

    #[tokio::test]
    async fn expired_session_surfaces_auth_required_and_keeps_rows() {
        let h = connected_harness().await;
        let mut events = h.scrobbler.subscribe();
        let track = ScrobbleTrack::new("Artist", "Song");
        h.queue.enqueue(&track).await.unwrap();
        h.service.fail_next(1, MockFailure::SessionExpired);

        assert_eq!(h.scrobbler.flush().await, FlushOutcome::Failed);
        assert!(!h.session.is_connected().await);
        assert_eq!(h.queue.pending_count().await.unwrap(), 1);

        let mut saw_auth_required = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ScrobbleEvent::AuthRequired) {
                saw_auth_required = true;
            }
        }
        assert!(saw_auth_required);

        // The dead session now gates the cycle; nothing reaches the wire.
        assert_eq!(h.scrobbler.flush().await, FlushOutcome::NotConnected);
        assert_eq!(h.service.scrobble_calls(), 1);
    }

    #[tokio::test]
    async fn eligible_play_is_queued_and_eagerly_flushed() {
        let h = connected_harness().await;
        let mut events = h.scrobbler.subscribe();
        let mut track = ScrobbleTrack::new("Artist", "Song");
        track.duration_secs = Some(180);
        let track_id = track.id.clone();

        h.scrobbler.track_started(track).await;
        // Steady half-second samples up to half the duration.
        for i in 1..=182 {
            h.scrobbler.record_progress(f64::from(i) * 0.5).await;
        }

        let service = h.service.clone();
        wait_until(move || !service.scrobbled_batches().is_empty()).await;
        let batches = h.service.scrobbled_batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].id, track_id);

        let mut seen = Vec::new();
        for _ in 0..200 {
            while let Ok(event) = events.try_recv() {
                seen.push(event);
            }
            if seen
                .iter()
                .any(|event| matches!(event, ScrobbleEvent::Submitted { .. }))
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen
            .iter()
            .any(|event| matches!(event, ScrobbleEvent::Queued { track } if track.id == track_id)));
        assert!(seen.iter().any(|event| matches!(
            event,
            ScrobbleEvent::Submitted { result } if result.track_id == track_id && result.accepted
        )));
        assert_eq!(h.queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_now_playing_push_reverts_the_optimistic_state() {
        let h = connected_harness().await;
        h.service.fail_next(1, MockFailure::ServiceUnavailable);
        let track = ScrobbleTrack::new("Artist", "Song");

        h.scrobbler.track_started(track.clone()).await;
        assert_eq!(
            h.scrobbler.now_playing().map(|t| t.id),
            Some(track.id.clone())
        );

        let scrobbler = h.scrobbler.clone();
        wait_until(move || scrobbler.now_playing().is_none()).await;
        assert!(h.service.now_playing_updates().is_empty());
    }

    #[tokio::test]
    async fn successful_now_playing_push_sticks() {
        let h = connected_harness().await;
        let track = ScrobbleTrack::new("Artist", "Song");

        h.scrobbler.track_started(track.clone()).await;
        let service = h.service.clone();
        wait_until(move || !service.now_playing_updates().is_empty()).await;

        assert_eq!(h.service.now_playing_updates()[0].id, track.id);
        assert_eq!(h.scrobbler.now_playing().map(|t| t.id), Some(track.id));
    }

    #[tokio::test]
    async fn concurrent_flushes_coalesce_to_one_submission() {
        let h = connected_harness().await;
        let track = ScrobbleTrack::new("Artist", "Song");
        h.queue.enqueue(&track).await.unwrap();
        h.service.set_delay(Duration::from_millis(100));

        let first = h.scrobbler.clone();
        let second = h.scrobbler.clone();
        let (a, b) = tokio::join!(first.flush(), second.flush());

        let outcomes = [a, b];
        assert!(outcomes.contains(&FlushOutcome::AlreadyRunning));
        assert!(outcomes.contains(&FlushOutcome::Flushed { submitted: 1 }));
        assert_eq!(h.service.scrobble_calls(), 1);
    }

    #[tokio::test]
    async fn track_stopped_clears_now_playing() {
        let h = harness().await;
        let track = ScrobbleTrack::new("Artist", "Song");
        h.scrobbler.track_started(track).await;
        assert!(h.scrobbler.now_playing().is_some());

        h.scrobbler.track_stopped();
        assert!(h.scrobbler.now_playing().is_none());
        // Progress samples after a stop are ignored.
        h.scrobbler.record_progress(10.0).await;
        assert_eq!(h.queue.pending_count().await.unwrap(), 0);
    }
}
