//! QUIC variable-length integers (RFC 9000 Section 16)
//!
//! The two most significant bits of the first byte select the encoded
//! length: 1, 2, 4 or 8 bytes, carrying 6, 14, 30 or 62 bits of value.
//! Every wire field of the HTTP/3 layer (stream types, frame types, frame
//! lengths, setting ids and values) uses this encoding.

use bytes::BufMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest value representable as a varint (2^62 - 1)
pub const MAX: u64 = (1 << 62) - 1;

/// Varint codec errors
#[derive(Debug, Error)]
pub enum VarintError {
    /// The source ended before the first byte of the integer
    #[error("end of stream")]
    Eof,

    /// The source ended in the middle of the integer
    #[error("truncated variable-length integer")]
    Truncated,

    #[error("value {0} exceeds the varint range")]
    Overflow(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encoded length of `value` in bytes (1, 2, 4 or 8)
pub fn len(value: u64) -> usize {
    if value < (1 << 6) {
        1
    } else if value < (1 << 14) {
        2
    } else if value < (1 << 30) {
        4
    } else {
        8
    }
}

/// Append `value` to `buf`
pub fn encode<B: BufMut>(buf: &mut B, value: u64) -> Result<(), VarintError> {
    if value > MAX {
        return Err(VarintError::Overflow(value));
    }
    match len(value) {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16(0x4000 | value as u16),
        4 => buf.put_u32(0x8000_0000 | value as u32),
        _ => buf.put_u64(0xc000_0000_0000_0000 | value),
    }
    Ok(())
}

/// Decode a varint from the start of `buf`
///
/// Returns `(value, bytes_consumed)`, or `None` if `buf` does not hold a
/// complete integer.
pub fn decode(buf: &[u8]) -> Option<(u64, usize)> {
    let first = *buf.first()?;
    let len = 1usize << (first >> 6);
    if buf.len() < len {
        return None;
    }
    let mut value = u64::from(first & 0x3f);
    for &b in &buf[1..len] {
        value = (value << 8) | u64::from(b);
    }
    Some((value, len))
}

/// Read one varint from an async byte source
///
/// A source that is already at end of stream yields [`VarintError::Eof`];
/// one that ends after the first byte yields [`VarintError::Truncated`].
pub async fn read<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<u64, VarintError> {
    let mut buf = [0u8; 8];
    if r.read(&mut buf[..1]).await? == 0 {
        return Err(VarintError::Eof);
    }
    let len = 1usize << (buf[0] >> 6);

    let mut filled = 1;
    while filled < len {
        let n = r.read(&mut buf[filled..len]).await?;
        if n == 0 {
            return Err(VarintError::Truncated);
        }
        filled += n;
    }

    decode(&buf[..len])
        .map(|(value, _)| value)
        .ok_or(VarintError::Truncated)
}

/// Write one varint to an async byte sink
pub async fn write<W: AsyncWrite + Unpin + ?Sized>(
    w: &mut W,
    value: u64,
) -> Result<(), VarintError> {
    let mut buf = Vec::with_capacity(8);
    encode(&mut buf, value)?;
    w.write_all(&buf).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_lengths() {
        assert_eq!(len(0), 1);
        assert_eq!(len(63), 1);
        assert_eq!(len(64), 2);
        assert_eq!(len(16383), 2);
        assert_eq!(len(16384), 4);
        assert_eq!(len(1073741823), 4);
        assert_eq!(len(1073741824), 8);
        assert_eq!(len(MAX), 8);
    }

    #[test]
    fn test_rfc9000_sample_encodings() {
        // Appendix A.1 of RFC 9000
        let mut buf = Vec::new();
        encode(&mut buf, 151_288_809_941_952_652).unwrap();
        assert_eq!(buf, [0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c]);

        buf.clear();
        encode(&mut buf, 494_878_333).unwrap();
        assert_eq!(buf, [0x9d, 0x7f, 0x3e, 0x7d]);

        buf.clear();
        encode(&mut buf, 15_293).unwrap();
        assert_eq!(buf, [0x7b, 0xbd]);

        assert_eq!(decode(&[0x25]), Some((37, 1)));
        assert_eq!(decode(&[0x40, 0x25]), Some((37, 2)));
    }

    #[test]
    fn test_overflow_rejected() {
        let mut buf = Vec::new();
        assert!(matches!(
            encode(&mut buf, MAX + 1),
            Err(VarintError::Overflow(_))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_incomplete() {
        assert_eq!(decode(&[]), None);
        assert_eq!(decode(&[0x80, 0x01]), None);
    }

    #[tokio::test]
    async fn test_async_read_write() {
        let mut buf = Vec::new();
        write(&mut buf, 0xffd276).await.unwrap();
        write(&mut buf, 7).await.unwrap();

        let mut r = &buf[..];
        assert_eq!(read(&mut r).await.unwrap(), 0xffd276);
        assert_eq!(read(&mut r).await.unwrap(), 7);
        assert!(matches!(read(&mut r).await, Err(VarintError::Eof)));
    }

    #[tokio::test]
    async fn test_async_read_truncated() {
        let mut r: &[u8] = &[0x80, 0x00];
        assert!(matches!(read(&mut r).await, Err(VarintError::Truncated)));
    }
}
