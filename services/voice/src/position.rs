//! Playback position notifications.
//!
//! Positions are derived from the number of delivered frames, not wall clock:
//! every [`REPORT_EVERY_FRAMES`] delivered frames the callback receives
//! `count × FRAME_DURATION`.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Playback time covered by one frame.
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// A position is reported once per this many delivered frames.
pub const REPORT_EVERY_FRAMES: u64 = 50;

/// Elapsed playback time after `frames` delivered frames.
pub fn position_for(frames: u64) -> Duration {
    Duration::from_millis(frames.saturating_mul(FRAME_DURATION.as_millis() as u64))
}

/// Forwards positions to a callback running on its own blocking thread.
///
/// Enqueueing never waits on the callback, so a slow callback only grows the
/// notification queue (by one entry per report) instead of stalling delivery.
/// Dropping the reporter closes the queue; the notifier then works through
/// what is left and exits without anyone waiting on it.
pub struct PositionReporter {
    tx: mpsc::UnboundedSender<Duration>,
}

/// Handle on a reporter's notifier thread.
pub struct Notifier {
    handle: JoinHandle<()>,
}

impl PositionReporter {
    /// Must be called from within a tokio runtime.
    pub fn new<F>(callback: F) -> Self
    where
        F: FnMut(Duration) + Send + 'static,
    {
        Self::with_notifier(callback).0
    }

    /// Like [`PositionReporter::new`], also returning the notifier so the
    /// caller can wait for queued reports once the reporter is dropped.
    pub fn with_notifier<F>(mut callback: F) -> (Self, Notifier)
    where
        F: FnMut(Duration) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Duration>();

        let handle = tokio::task::spawn_blocking(move || {
            while let Some(position) = rx.blocking_recv() {
                callback(position);
            }
        });

        (Self { tx }, Notifier { handle })
    }

    /// Record that `count` frames have been delivered so far.
    pub fn frame_delivered(&self, count: u64) {
        if count == 0 || count % REPORT_EVERY_FRAMES != 0 {
            return;
        }

        let position = position_for(count);
        if self.tx.send(position).is_err() {
            warn!(?position, "Position notifier is gone, dropping report");
        }
    }
}

impl Notifier {
    /// Wait until every queued report has been handed to the callback.
    ///
    /// Only returns after the matching [`PositionReporter`] is dropped.
    pub async fn drained(self) {
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                std::panic::resume_unwind(e.into_panic());
            }
            debug!(error = %e, "Position notifier did not complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recording_reporter() -> (PositionReporter, Notifier, Arc<Mutex<Vec<Duration>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let (reporter, notifier) =
            PositionReporter::with_notifier(move |position| sink.lock().unwrap().push(position));
        (reporter, notifier, seen)
    }

    #[test]
    fn test_position_for() {
        assert_eq!(position_for(0), Duration::ZERO);
        assert_eq!(position_for(50), Duration::from_secs(1));
        assert_eq!(position_for(125), Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn test_reports_every_fiftieth_frame() {
        let (reporter, notifier, seen) = recording_reporter();

        for count in 1..=149 {
            reporter.frame_delivered(count);
        }
        drop(reporter);
        notifier.drained().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[tokio::test]
    async fn test_no_report_below_cadence() {
        let (reporter, notifier, seen) = recording_reporter();
        for count in 0..50 {
            reporter.frame_delivered(count);
        }
        drop(reporter);
        notifier.drained().await;

        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_slow_callback_does_not_block_enqueue() {
        let reporter = PositionReporter::new(|_| std::thread::sleep(Duration::from_millis(20)));

        let started = std::time::Instant::now();
        for count in 1..=500 {
            reporter.frame_delivered(count);
        }
        assert!(started.elapsed() < Duration::from_millis(100));

        let dropped = std::time::Instant::now();
        drop(reporter);
        assert!(dropped.elapsed() < Duration::from_millis(10));
    }
}
