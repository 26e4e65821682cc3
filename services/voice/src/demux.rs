//! Length-prefixed frame demultiplexing.
//!
//! The stored audio format is a flat sequence of records:
//!
//! ```text
//! +----------------+------------------+
//! | len: u16 (LE)  | payload: len B   |  ... repeated until EOF
//! +----------------+------------------+
//! ```
//!
//! EOF exactly between records ends the stream cleanly. EOF anywhere else is
//! an error, and a partially read frame is never emitted.

use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;
use std::fmt;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

/// Size of the little-endian length prefix in front of every frame.
pub const LENGTH_PREFIX_BYTES: usize = 2;

/// Which part of a record was being read when the stream failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPhase {
    Length,
    Payload,
}

impl fmt::Display for ReadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadPhase::Length => f.write_str("length prefix"),
            ReadPhase::Payload => f.write_str("payload"),
        }
    }
}

/// Fatal read failure for the current stream.
#[derive(Debug, Error)]
#[error("Failed to read frame {phase}: {source}")]
pub struct StreamReadError {
    pub phase: ReadPhase,
    #[source]
    pub source: io::Error,
}

impl StreamReadError {
    fn new(phase: ReadPhase, source: io::Error) -> Self {
        Self { phase, source }
    }
}

/// Lazily splits a byte stream into frame payloads.
///
/// Non-restartable: after the first `Ok(None)` or error every further call
/// returns `Ok(None)`.
pub struct FrameReader<R> {
    reader: R,
    finished: bool,
    frames_read: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            finished: false,
            frames_read: 0,
        }
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Read the next frame, `Ok(None)` at a clean end of stream.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>, StreamReadError> {
        if self.finished {
            return Ok(None);
        }

        let result = self.read_frame().await;
        if !matches!(result, Ok(Some(_))) {
            self.finished = true;
        }
        result
    }

    async fn read_frame(&mut self) -> Result<Option<Bytes>, StreamReadError> {
        let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
        let mut filled = 0;

        while filled < prefix.len() {
            match self.reader.read(&mut prefix[filled..]).await {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(StreamReadError::new(
                        ReadPhase::Length,
                        io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "stream ended inside a length prefix",
                        ),
                    ))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(StreamReadError::new(ReadPhase::Length, e)),
            }
        }

        let len = u16::from_le_bytes(prefix) as usize;
        let mut payload = BytesMut::zeroed(len);
        self.reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| StreamReadError::new(ReadPhase::Payload, e))?;

        self.frames_read += 1;
        trace!(frame = self.frames_read, len, "Frame read");

        Ok(Some(payload.freeze()))
    }

    /// Adapt the reader into a `Stream` of frames.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, StreamReadError>> {
        futures::stream::try_unfold(self, |mut reader| async move {
            let frame = reader.next_frame().await?;
            Ok::<_, StreamReadError>(frame.map(|frame| (frame, reader)))
        })
    }
}

/// Append one record to `out`. Payloads longer than `u16::MAX` are rejected.
pub fn encode_frame(out: &mut BytesMut, payload: &[u8]) -> io::Result<()> {
    let len = u16::try_from(payload.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds the u16 length prefix", payload.len()),
        )
    })?;
    out.reserve(LENGTH_PREFIX_BYTES + payload.len());
    out.put_u16_le(len);
    out.put_slice(payload);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    const SIXTEEN_BYTE_FRAME: [u8; 18] = [
        0x10, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c,
        0x0d, 0x0e, 0x0f, 0x10,
    ];

    #[tokio::test]
    async fn test_reads_single_frame() {
        let mut reader = FrameReader::new(&SIXTEEN_BYTE_FRAME[..]);

        let frame = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(&frame[..], &SIXTEEN_BYTE_FRAME[2..]);
        assert!(reader.next_frame().await.unwrap().is_none());
        assert_eq!(reader.frames_read(), 1);
    }

    #[tokio::test]
    async fn test_empty_input_yields_no_frames() {
        let mut reader = FrameReader::new(&b""[..]);
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_payload_is_an_error() {
        let mut reader = FrameReader::new(&b"\x04\x00\x01\x02"[..]);

        let err = reader.next_frame().await.unwrap_err();
        assert_eq!(err.phase, ReadPhase::Payload);
        assert_eq!(err.source.kind(), io::ErrorKind::UnexpectedEof);

        // Not restartable after a failure.
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_length_prefix_is_an_error() {
        let mut input = SIXTEEN_BYTE_FRAME.to_vec();
        input.push(0x05);
        let mut reader = FrameReader::new(&input[..]);

        assert!(reader.next_frame().await.unwrap().is_some());
        let err = reader.next_frame().await.unwrap_err();
        assert_eq!(err.phase, ReadPhase::Length);
    }

    #[tokio::test]
    async fn test_zero_length_frame() {
        let mut reader = FrameReader::new(&b"\x00\x00"[..]);
        let frame = reader.next_frame().await.unwrap().unwrap();
        assert!(frame.is_empty());
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_error_carries_phase_and_cause() {
        let mock = tokio_test::io::Builder::new()
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "test error"))
            .build();
        let mut reader = FrameReader::new(mock);

        let err = reader.next_frame().await.unwrap_err();
        assert_eq!(err.phase, ReadPhase::Length);
        assert_eq!(err.source.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_prefix_split_across_reads() {
        let mock = tokio_test::io::Builder::new()
            .read(&[0x03])
            .read(&[0x00, 0xaa])
            .read(&[0xbb, 0xcc])
            .build();
        let mut reader = FrameReader::new(mock);

        let frame = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(&frame[..], &b"\xaa\xbb\xcc"[..]);
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stream_preserves_order() {
        let mut encoded = BytesMut::new();
        let payloads: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i; i as usize * 7]).collect();
        for payload in &payloads {
            encode_frame(&mut encoded, payload).unwrap();
        }

        let frames: Vec<Bytes> = FrameReader::new(&encoded[..])
            .into_stream()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(frames.len(), payloads.len());
        for (frame, payload) in frames.iter().zip(&payloads) {
            assert_eq!(&frame[..], &payload[..]);
        }
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let mut out = BytesMut::new();
        let payload = vec![0u8; u16::MAX as usize + 1];
        assert!(encode_frame(&mut out, &payload).is_err());
        assert!(out.is_empty());

        encode_frame(&mut out, &payload[..u16::MAX as usize]).unwrap();
        assert_eq!(&out[..2], &b"\xff\xff"[..]);
    }
}
