//! Backpressured, cancellable delivery of frames to a real-time consumer.

use crate::demux::{FrameReader, StreamReadError};
use crate::position::{position_for, PositionReporter};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

fn default_channel_capacity() -> usize {
    16
}

/// Tuning for a single playback stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Frames buffered between the reader and the consumer.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl StreamSettings {
    /// Channel capacity, never zero.
    pub fn capacity(&self) -> usize {
        self.channel_capacity.max(1)
    }
}

/// How a stream ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub frames_delivered: u64,
    /// Playback time covered by the delivered frames.
    pub elapsed: Duration,
    pub cancelled: bool,
    pub receiver_closed: bool,
}

/// Read frames from `source` and push them into `sink` in order.
///
/// Each read and each send races `cancel`, with cancellation winning ties.
/// Cancellation and a dropped receiver both end the stream with `Ok`; only a
/// malformed or failing source is an error. The reporter is released on
/// return without waiting for its callback.
pub async fn stream_frames<R>(
    cancel: CancellationToken,
    source: R,
    sink: mpsc::Sender<Bytes>,
    reporter: Option<PositionReporter>,
) -> Result<StreamSummary, StreamReadError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = FrameReader::new(source);
    let mut summary = StreamSummary::default();

    let result = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                summary.cancelled = true;
                break Ok(());
            }
            next = reader.next_frame() => next,
        };

        let frame = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                summary.cancelled = true;
                break Ok(());
            }
            sent = sink.send(frame) => {
                if sent.is_err() {
                    summary.receiver_closed = true;
                    break Ok(());
                }
            }
        }

        summary.frames_delivered += 1;
        if let Some(reporter) = &reporter {
            reporter.frame_delivered(summary.frames_delivered);
        }
    };

    drop(sink);
    // Queued reports keep flowing to the callback after we return.
    drop(reporter);

    summary.elapsed = position_for(summary.frames_delivered);

    match result {
        Ok(()) => {
            info!(
                frames = summary.frames_delivered,
                elapsed_ms = summary.elapsed.as_millis() as u64,
                cancelled = summary.cancelled,
                receiver_closed = summary.receiver_closed,
                "Stream finished"
            );
            Ok(summary)
        }
        Err(e) => {
            warn!(
                frames = summary.frames_delivered,
                phase = %e.phase,
                error = %e,
                "Stream aborted"
            );
            Err(e)
        }
    }
}

/// A delivery task plus the receiving end of its channel.
pub struct FrameStream {
    frames: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    task: JoinHandle<Result<StreamSummary, StreamReadError>>,
}

impl FrameStream {
    /// Start delivering `source` on its own task.
    ///
    /// The stream stops when `cancel` (or a token derived from it via
    /// [`FrameStream::cancel`]) fires.
    pub fn spawn<R>(
        source: R,
        settings: &StreamSettings,
        reporter: Option<PositionReporter>,
        cancel: CancellationToken,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, frames) = mpsc::channel(settings.capacity());
        let cancel = cancel.child_token();
        debug!(capacity = settings.capacity(), "Spawning frame stream");

        let task = tokio::spawn(stream_frames(cancel.clone(), source, tx, reporter));

        Self {
            frames,
            cancel,
            task,
        }
    }

    /// Next frame, `None` once delivery has stopped and the buffer is empty.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.frames.recv().await
    }

    /// Stop this stream only; the parent token is unaffected.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drop the receiver and wait for the delivery task to end.
    pub async fn join(self) -> Result<StreamSummary, StreamReadError> {
        let Self { frames, task, .. } = self;
        drop(frames);

        match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => {
                warn!(error = %e, "Delivery task aborted");
                Ok(StreamSummary {
                    cancelled: true,
                    ..StreamSummary::default()
                })
            }
        }
    }
}
