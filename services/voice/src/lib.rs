//! Encore Voice - real-time delivery of stored audio frames
//!
//! Stored tracks are a sequence of `{u16 LE length}{payload}` records. This
//! crate turns such a byte source into frames on a bounded channel:
//!
//! - [`FrameReader`]: lazy, non-restartable demultiplexer
//! - [`stream_frames`] / [`FrameStream`]: backpressured delivery that stops
//!   promptly on cancellation
//! - [`PositionReporter`]: elapsed playback time every
//!   [`REPORT_EVERY_FRAMES`] frames, off the delivery path
//!
//! # Example
//!
//! ```rust,no_run
//! use encore_voice::{FrameStream, PositionReporter, StreamSettings};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn play(track: Vec<u8>) {
//! let reporter = PositionReporter::new(|position| println!("at {position:?}"));
//! let mut stream = FrameStream::spawn(
//!     std::io::Cursor::new(track),
//!     &StreamSettings::default(),
//!     Some(reporter),
//!     CancellationToken::new(),
//! );
//!
//! while let Some(frame) = stream.recv().await {
//!     // hand `frame` to the voice connection
//!     let _ = frame;
//! }
//! let summary = stream.join().await;
//! # let _ = summary;
//! # }
//! ```

pub mod delivery;
pub mod demux;
pub mod position;

pub use delivery::{stream_frames, FrameStream, StreamSettings, StreamSummary};
pub use demux::{encode_frame, FrameReader, ReadPhase, StreamReadError, LENGTH_PREFIX_BYTES};
pub use position::{position_for, Notifier, PositionReporter, FRAME_DURATION, REPORT_EVERY_FRAMES};
