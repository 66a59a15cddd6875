//! ManifestUpdater: periodic or on-demand refresh of the presentation
//! (spec §4.5).

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::bus::{BusSink, DemuxErrorReport, Notification};
use crate::collaborators::{DemuxerFormat, ManifestOutcome};
use crate::error::{DemuxError, MAX_MANIFEST_FAILURE_COUNT};
use crate::presentation::TracksLock;

pub struct ManifestUpdater {
    format: Arc<dyn DemuxerFormat>,
    bus: Arc<dyn BusSink>,
    tracks: Arc<TracksLock>,
    consecutive_failures: u32,
}

impl ManifestUpdater {
    pub fn new(
        format: Arc<dyn DemuxerFormat>,
        bus: Arc<dyn BusSink>,
        tracks: Arc<TracksLock>,
    ) -> Self {
        Self {
            format,
            bus,
            tracks,
            consecutive_failures: 0,
        }
    }

    /// `initial_parse(bytes)` (spec §4.5): on success with at least one
    /// stream, marks `have_manifest`.
    pub fn initial_parse(&mut self, bytes: &[u8]) -> Result<ManifestOutcome, DemuxError> {
        let outcome = self.format.process_manifest(bytes)?;
        if outcome.streams.is_empty() {
            return Err(DemuxError::NoPlayableStreams);
        }
        self.tracks.lock().have_manifest = true;
        Ok(outcome)
    }

    /// `refresh()`: fetches are performed by the caller (this crate's
    /// scope ends at the `DemuxerFormat` trait boundary per spec §1); this
    /// applies the fetched bytes and tracks the consecutive-failure count,
    /// raising `ManifestUnreachable` once `MAX_MANIFEST_FAILURE_COUNT` is
    /// reached (spec §7).
    pub fn apply_refresh(&mut self, bytes: Result<Vec<u8>, DemuxError>) -> Result<(), DemuxError> {
        let bytes = match bytes {
            Ok(b) => b,
            Err(_) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= MAX_MANIFEST_FAILURE_COUNT {
                    let err = DemuxError::manifest_unreachable(
                        self.consecutive_failures,
                        "manifest fetch failed repeatedly",
                    );
                    self.bus.post(Notification::Error(DemuxErrorReport::from(&err)));
                    return Err(err);
                }
                warn!(
                    failures = self.consecutive_failures,
                    "transient manifest refresh failure"
                );
                return Ok(());
            }
        };

        match self.format.update_manifest_data(&bytes) {
            Ok(_) => {
                self.consecutive_failures = 0;
                self.wake_waiting_streams();
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= MAX_MANIFEST_FAILURE_COUNT {
                    self.bus.post(Notification::Error(DemuxErrorReport::from(&e)));
                    return Err(e);
                }
                warn!(error = %e, failures = self.consecutive_failures, "transient manifest update failure");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "fatal manifest update failure");
                self.bus.post(Notification::Error(DemuxErrorReport::from(&e)));
                Err(e)
            }
        }
    }

    /// One-shot refresh requested by a Stream when periodic updates are
    /// off (spec §4.5 `manual_refresh`). Caller supplies the already-fetched
    /// bytes (fetching itself is the `DownloadHelper`'s job, out of this
    /// module's scope).
    pub fn manual_refresh(&mut self, bytes: Result<Vec<u8>, DemuxError>) -> Result<(), DemuxError> {
        self.apply_refresh(bytes)
    }

    fn wake_waiting_streams(&self) {
        let mut guard = self.tracks.lock();
        for stream in guard.streams_iter_mut() {
            stream.manifest_refreshed();
        }
        drop(guard);
        self.tracks.notify_tracks_added();
    }

    /// Whether the periodic refresh loop should be running at all (spec
    /// §4.5 "Periodic cadence applies only when the presentation is live
    /// and the format requires periodic updates").
    pub fn wants_periodic_updates(&self) -> bool {
        self.format.is_live() && self.format.requires_periodical_playlist_update()
    }

    pub fn update_interval(&self) -> Duration {
        self.format.manifest_update_interval()
    }
}

/// Drive the periodic refresh loop until `token` is cancelled. Each tick,
/// `fetch` is called to retrieve the latest manifest bytes (this is the
/// caller's `DownloadHelper` usage, outside this crate's scope); the
/// interval is re-read from the collaborator every cycle so a live
/// presentation's cadence can change between refreshes.
pub async fn run_periodic_updates<F, Fut>(
    updater: Arc<tokio::sync::Mutex<ManifestUpdater>>,
    token: tokio_util::sync::CancellationToken,
    fetch: F,
) where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<Vec<u8>, DemuxError>>,
{
    loop {
        let (wants_updates, interval) = {
            let guard = updater.lock().await;
            (guard.wants_periodic_updates(), guard.update_interval())
        };
        if !wants_updates {
            return;
        }

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep_until(Instant::now() + interval) => {}
        }

        if token.is_cancelled() {
            return;
        }

        let bytes = fetch().await;
        let mut guard = updater.lock().await;
        if guard.apply_refresh(bytes).is_err() {
            info!("manifest updater stopping after fatal refresh failure");
            return;
        }
    }
}
