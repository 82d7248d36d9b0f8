//! HTTP/3 frame encoding/decoding
//!
//! Frame format:
//! ```text
//! +----------------------+
//! |   Type (varint)      |
//! +----------------------+
//! |   Length (varint)    |
//! +----------------------+
//! |   Payload (Length)   |
//! +----------------------+
//! ```
//!
//! Only SETTINGS is decoded here. Every other frame type comes back as
//! [`Frame::Unknown`] with its payload already skipped, so callers choose
//! between ignoring it and treating it as a protocol error.

mod settings;

pub use settings::{read_settings_frame, Setting, Settings, MAX_SETTINGS_FRAME_SIZE};

use crate::error::{FrameLengthError, FrameTypeError};
use crate::varint::{self, VarintError};
use bytes::BytesMut;
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame decoding errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Type(#[from] FrameTypeError),

    #[error(transparent)]
    Length(#[from] FrameLengthError),

    #[error("duplicate setting: {0}")]
    DuplicateSetting(Setting),

    /// Input ended in the middle of a field
    #[error("unexpected end of frame")]
    Truncated,

    /// Input ended cleanly before the next frame started
    #[error("end of stream")]
    Eof,

    #[error("value {0} exceeds the varint range")]
    Overflow(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<VarintError> for FrameError {
    fn from(err: VarintError) -> Self {
        match err {
            VarintError::Eof => FrameError::Eof,
            VarintError::Truncated => FrameError::Truncated,
            VarintError::Overflow(v) => FrameError::Overflow(v),
            VarintError::Io(e) => FrameError::Io(e),
        }
    }
}

/// HTTP/3 frame type identifier (RFC 9114 Section 7.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameType(pub u64);

impl FrameType {
    pub const DATA: Self = Self(0x00);
    pub const HEADERS: Self = Self(0x01);
    pub const CANCEL_PUSH: Self = Self(0x03);
    pub const SETTINGS: Self = Self(0x04);
    pub const PUSH_PROMISE: Self = Self(0x05);
    pub const GOAWAY: Self = Self(0x07);
    pub const MAX_PUSH_ID: Self = Self(0x0d);
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::DATA => f.write_str("DATA"),
            Self::HEADERS => f.write_str("HEADERS"),
            Self::CANCEL_PUSH => f.write_str("CANCEL_PUSH"),
            Self::SETTINGS => f.write_str("SETTINGS"),
            Self::PUSH_PROMISE => f.write_str("PUSH_PROMISE"),
            Self::GOAWAY => f.write_str("GOAWAY"),
            Self::MAX_PUSH_ID => f.write_str("MAX_PUSH_ID"),
            Self(t) => write!(f, "H3 frame type {:#x}", t),
        }
    }
}

/// A frame that can be written to a stream
pub trait EncodeFrame {
    fn frame_type(&self) -> FrameType;

    /// Length of the encoded payload in bytes
    fn frame_length(&self) -> u64;

    /// Append the payload (without type and length) to `buf`
    fn encode_payload(&self, buf: &mut BytesMut) -> Result<(), VarintError>;

    /// Append type, length and payload to `buf`
    fn encode_frame(&self, buf: &mut BytesMut) -> Result<(), VarintError> {
        varint::encode(buf, self.frame_type().0)?;
        varint::encode(buf, self.frame_length())?;
        self.encode_payload(buf)
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Settings(Settings),
    /// Any frame type this layer does not decode; the payload was skipped
    Unknown { frame_type: FrameType, length: u64 },
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Settings(_) => FrameType::SETTINGS,
            Frame::Unknown { frame_type, .. } => *frame_type,
        }
    }

    pub fn frame_length(&self) -> u64 {
        match self {
            Frame::Settings(s) => s.frame_length(),
            Frame::Unknown { length, .. } => *length,
        }
    }

    /// Unwrap a SETTINGS frame, or report which frame came instead
    pub fn into_settings(self) -> Result<Settings, FrameTypeError> {
        match self {
            Frame::Settings(s) => Ok(s),
            Frame::Unknown { frame_type, length } => Err(FrameTypeError {
                want: FrameType::SETTINGS,
                got: frame_type,
                len: length,
            }),
        }
    }
}

/// Write a complete frame to `w`
pub async fn write_frame<W, F>(w: &mut W, frame: &F) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
    F: EncodeFrame + ?Sized,
{
    let mut buf = BytesMut::new();
    frame.encode_frame(&mut buf)?;
    w.write_all(&buf).await?;
    Ok(())
}

/// Read the next frame from `r`
///
/// A stream that ends before the frame type yields [`FrameError::Eof`]; one
/// that ends anywhere after it yields [`FrameError::Truncated`].
pub async fn read_frame<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<Frame, FrameError> {
    let frame_type = FrameType(varint::read(r).await?);
    let length = varint::read(r).await.map_err(mid_frame)?;

    match frame_type {
        FrameType::SETTINGS => {
            let settings = read_settings_frame(r, length).await.map_err(mid_frame)?;
            Ok(Frame::Settings(settings))
        }
        _ => {
            let skipped = tokio::io::copy(&mut (&mut *r).take(length), &mut tokio::io::sink()).await?;
            if skipped < length {
                return Err(FrameError::Truncated);
            }
            Ok(Frame::Unknown { frame_type, length })
        }
    }
}

fn mid_frame<E: Into<FrameError>>(err: E) -> FrameError {
    match err.into() {
        FrameError::Eof => FrameError::Truncated,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_settings_frame_through_reader() {
        let mut settings = Settings::new();
        settings.enable_datagrams();

        let mut buf = Vec::new();
        write_frame(&mut buf, &settings).await.unwrap();

        let mut r = &buf[..];
        let frame = read_frame(&mut r).await.unwrap();
        assert_eq!(frame, Frame::Settings(settings));
        assert!(r.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_frame_skipped() {
        let mut buf = BytesMut::new();
        varint::encode(&mut buf, 0x21).unwrap();
        varint::encode(&mut buf, 3).unwrap();
        buf.extend_from_slice(b"abc");
        Settings::new().encode_frame(&mut buf).unwrap();

        let mut r = &buf[..];
        let frame = read_frame(&mut r).await.unwrap();
        assert_eq!(
            frame,
            Frame::Unknown {
                frame_type: FrameType(0x21),
                length: 3
            }
        );

        // The next frame is still readable
        let frame = read_frame(&mut r).await.unwrap();
        assert_eq!(frame, Frame::Settings(Settings::new()));
    }

    #[tokio::test]
    async fn test_eof_between_frames() {
        let mut r: &[u8] = &[];
        assert!(matches!(read_frame(&mut r).await, Err(FrameError::Eof)));
    }

    #[tokio::test]
    async fn test_truncated_frames() {
        // Type only
        let mut r: &[u8] = &[0x04];
        assert!(matches!(read_frame(&mut r).await, Err(FrameError::Truncated)));

        // SETTINGS promising 4 bytes with none present
        let mut r: &[u8] = &[0x04, 0x04];
        assert!(matches!(read_frame(&mut r).await, Err(FrameError::Truncated)));

        // Unknown frame promising 5 bytes with 2 present
        let mut r: &[u8] = &[0x21, 0x05, 0xaa, 0xbb];
        assert!(matches!(read_frame(&mut r).await, Err(FrameError::Truncated)));
    }

    #[tokio::test]
    async fn test_oversized_settings_rejected_by_reader() {
        let mut buf = BytesMut::new();
        varint::encode(&mut buf, FrameType::SETTINGS.0).unwrap();
        varint::encode(&mut buf, MAX_SETTINGS_FRAME_SIZE + 1).unwrap();

        let mut r = &buf[..];
        match read_frame(&mut r).await {
            Err(FrameError::Length(err)) => {
                assert_eq!(err.frame_type, FrameType::SETTINGS);
                assert_eq!(err.length, MAX_SETTINGS_FRAME_SIZE + 1);
            }
            other => panic!("expected length error, got {:?}", other),
        }
    }

    #[test]
    fn test_into_settings_type_mismatch() {
        let frame = Frame::Unknown {
            frame_type: FrameType::HEADERS,
            length: 12,
        };
        let err = frame.into_settings().unwrap_err();
        assert_eq!(err.want, FrameType::SETTINGS);
        assert_eq!(err.got, FrameType::HEADERS);
        assert_eq!(err.len, 12);
    }

    #[test]
    fn test_frame_type_display() {
        assert_eq!(FrameType::SETTINGS.to_string(), "SETTINGS");
        assert_eq!(FrameType(0x21).to_string(), "H3 frame type 0x21");
    }
}
