//! SETTINGS frame (RFC 9114 Section 7.2.4)
//!
//! The payload is a sequence of `(identifier, value)` varint pairs. Pairs are
//! written in ascending identifier order so the encoding is deterministic.

use super::{EncodeFrame, FrameError, FrameType};
use crate::error::FrameLengthError;
use crate::varint::{self, VarintError};
use bytes::BytesMut;
use std::collections::btree_map::{self, BTreeMap};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest SETTINGS payload accepted on decode (8 KiB)
pub const MAX_SETTINGS_FRAME_SIZE: u64 = 8 * 1024;

/// HTTP/3 setting identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Setting(pub u64);

impl Setting {
    pub const QPACK_MAX_TABLE_CAPACITY: Self = Self(0x01);
    pub const MAX_FIELD_SECTION_SIZE: Self = Self(0x06);
    pub const QPACK_BLOCKED_STREAMS: Self = Self(0x07);

    /// draft-ietf-masque-h3-datagram-02
    pub const DATAGRAM: Self = Self(0xffd276);

    /// draft-ietf-masque-h3-datagram-00
    pub const DATAGRAM_DRAFT00: Self = Self(0x276);
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::QPACK_MAX_TABLE_CAPACITY => f.write_str("SETTINGS_QPACK_MAX_TABLE_CAPACITY"),
            Self::MAX_FIELD_SECTION_SIZE => f.write_str("SETTINGS_MAX_FIELD_SECTION_SIZE"),
            Self::QPACK_BLOCKED_STREAMS => f.write_str("SETTINGS_QPACK_BLOCKED_STREAMS"),
            Self::DATAGRAM => f.write_str("H3_DATAGRAM"),
            Self::DATAGRAM_DRAFT00 => f.write_str("H3_DATAGRAM_DRAFT00"),
            Self(id) => write!(f, "H3 SETTING {:#x}", id),
        }
    }
}

/// A set of HTTP/3 settings, keyed by identifier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    values: BTreeMap<Setting, u64>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: Setting) -> Option<u64> {
        self.values.get(&id).copied()
    }

    /// Set `id`, returning the previous value
    pub fn insert(&mut self, id: Setting, value: u64) -> Option<u64> {
        self.values.insert(id, value)
    }

    pub fn remove(&mut self, id: Setting) -> Option<u64> {
        self.values.remove(&id)
    }

    pub fn contains(&self, id: Setting) -> bool {
        self.values.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate in ascending identifier order
    pub fn iter(&self) -> btree_map::Iter<'_, Setting, u64> {
        self.values.iter()
    }

    /// Announce HTTP datagram support
    pub fn enable_datagrams(&mut self) {
        self.values.insert(Setting::DATAGRAM, 1);
    }

    /// Whether either datagram setting is present with a nonzero value
    pub fn datagrams_enabled(&self) -> bool {
        [Setting::DATAGRAM, Setting::DATAGRAM_DRAFT00]
            .iter()
            .any(|id| matches!(self.get(*id), Some(v) if v != 0))
    }

    /// Parse a SETTINGS payload
    pub fn unmarshal_frame(payload: &[u8]) -> Result<Self, FrameError> {
        let length = payload.len() as u64;
        if length > MAX_SETTINGS_FRAME_SIZE {
            return Err(too_large(length).into());
        }

        let mut settings = Settings::new();
        let mut rest = payload;
        while !rest.is_empty() {
            let id = Setting(next_varint(&mut rest)?);
            let value = next_varint(&mut rest)?;
            if settings.values.insert(id, value).is_some() {
                return Err(FrameError::DuplicateSetting(id));
            }
        }
        Ok(settings)
    }
}

impl EncodeFrame for Settings {
    fn frame_type(&self) -> FrameType {
        FrameType::SETTINGS
    }

    fn frame_length(&self) -> u64 {
        self.values
            .iter()
            .map(|(id, value)| (varint::len(id.0) + varint::len(*value)) as u64)
            .sum()
    }

    fn encode_payload(&self, buf: &mut BytesMut) -> Result<(), VarintError> {
        for (id, value) in &self.values {
            varint::encode(buf, id.0)?;
            varint::encode(buf, *value)?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Settings {
    type Item = (&'a Setting, &'a u64);
    type IntoIter = btree_map::Iter<'a, Setting, u64>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

impl FromIterator<(Setting, u64)> for Settings {
    fn from_iter<I: IntoIterator<Item = (Setting, u64)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (id, value)) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", id, value)?;
        }
        f.write_str("}")
    }
}

/// Read a SETTINGS payload of `length` bytes whose frame header has already
/// been consumed
///
/// Exactly `length` bytes are allocated and read before parsing. A source
/// that is already at end of stream yields [`FrameError::Eof`]; a partial
/// payload yields [`FrameError::Truncated`].
pub async fn read_settings_frame<R: AsyncRead + Unpin + ?Sized>(
    r: &mut R,
    length: u64,
) -> Result<Settings, FrameError> {
    if length > MAX_SETTINGS_FRAME_SIZE {
        return Err(too_large(length).into());
    }

    let mut buf = vec![0u8; length as usize];
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(if filled == 0 {
                FrameError::Eof
            } else {
                FrameError::Truncated
            });
        }
        filled += n;
    }

    Settings::unmarshal_frame(&buf)
}

fn too_large(length: u64) -> FrameLengthError {
    FrameLengthError {
        frame_type: FrameType::SETTINGS,
        length,
        max: MAX_SETTINGS_FRAME_SIZE,
    }
}

// The payload is fully buffered, so running out here is always mid-field.
fn next_varint(rest: &mut &[u8]) -> Result<u64, FrameError> {
    let (value, n) = varint::decode(rest).ok_or(FrameError::Truncated)?;
    *rest = &rest[n..];
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_of(settings: &Settings) -> BytesMut {
        let mut buf = BytesMut::new();
        settings.encode_payload(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_settings_round_trip() {
        let settings: Settings = [
            (Setting::DATAGRAM, 1),
            (Setting::QPACK_MAX_TABLE_CAPACITY, 4096),
            (Setting::MAX_FIELD_SECTION_SIZE, 1 << 40),
            (Setting(0x21), 0),
        ]
        .into_iter()
        .collect();

        let payload = payload_of(&settings);
        assert_eq!(payload.len() as u64, settings.frame_length());

        let decoded = Settings::unmarshal_frame(&payload).unwrap();
        assert_eq!(decoded, settings);
    }

    #[test]
    fn test_encoding_is_sorted_by_id() {
        let mut settings = Settings::new();
        settings.insert(Setting(0x07), 2);
        settings.insert(Setting(0x01), 1);

        let mut buf = BytesMut::new();
        settings.encode_frame(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0x04, 0x04, 0x01, 0x01, 0x07, 0x02]);
    }

    #[test]
    fn test_empty_settings_frame() {
        let mut buf = BytesMut::new();
        Settings::new().encode_frame(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0x04, 0x00]);
        assert!(Settings::unmarshal_frame(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_setting_rejected() {
        // id 0x06 appears twice with different values
        let payload = [0x06, 0x01, 0x06, 0x02];
        match Settings::unmarshal_frame(&payload) {
            Err(FrameError::DuplicateSetting(id)) => assert_eq!(id, Setting(0x06)),
            other => panic!("expected duplicate setting error, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let payload = vec![0u8; MAX_SETTINGS_FRAME_SIZE as usize + 1];
        assert!(matches!(
            Settings::unmarshal_frame(&payload),
            Err(FrameError::Length(_))
        ));

        // Exactly at the cap is accepted: 4096 pairs of single-byte varints
        let mut payload = BytesMut::new();
        for id in 0..4096u64 {
            varint::encode(&mut payload, 0x40 + id).unwrap();
        }
        assert_eq!(payload.len() as u64, MAX_SETTINGS_FRAME_SIZE);
        assert_eq!(Settings::unmarshal_frame(&payload).unwrap().len(), 2048);
    }

    #[test]
    fn test_truncated_pair() {
        // id without a value
        assert!(matches!(
            Settings::unmarshal_frame(&[0x06]),
            Err(FrameError::Truncated)
        ));
        // value cut inside a two-byte varint
        assert!(matches!(
            Settings::unmarshal_frame(&[0x06, 0x40]),
            Err(FrameError::Truncated)
        ));
    }

    #[tokio::test]
    async fn test_read_settings_frame_with_known_length() {
        let mut settings = Settings::new();
        settings.enable_datagrams();
        let payload = payload_of(&settings);

        let mut r = &payload[..];
        let decoded = read_settings_frame(&mut r, payload.len() as u64)
            .await
            .unwrap();
        assert_eq!(decoded, settings);
    }

    #[tokio::test]
    async fn test_read_settings_frame_size_cap_before_read() {
        let mut r: &[u8] = &[0x01, 0x01];
        assert!(matches!(
            read_settings_frame(&mut r, MAX_SETTINGS_FRAME_SIZE + 1).await,
            Err(FrameError::Length(_))
        ));
        // Nothing was consumed
        assert_eq!(r.len(), 2);
    }

    #[tokio::test]
    async fn test_read_settings_frame_short_input() {
        let mut r: &[u8] = &[];
        assert!(matches!(
            read_settings_frame(&mut r, 4).await,
            Err(FrameError::Eof)
        ));

        let mut r: &[u8] = &[0x01, 0x01];
        assert!(matches!(
            read_settings_frame(&mut r, 4).await,
            Err(FrameError::Truncated)
        ));
    }

    #[test]
    fn test_datagram_detection() {
        let mut settings = Settings::new();
        assert!(!settings.datagrams_enabled());

        settings.insert(Setting::DATAGRAM_DRAFT00, 1);
        assert!(settings.datagrams_enabled());

        settings.insert(Setting::DATAGRAM_DRAFT00, 0);
        assert!(!settings.datagrams_enabled());

        settings.enable_datagrams();
        assert_eq!(settings.get(Setting::DATAGRAM), Some(1));
        assert!(settings.datagrams_enabled());
    }

    #[test]
    fn test_settings_display() {
        let mut settings = Settings::new();
        settings.enable_datagrams();
        settings.insert(Setting(0x33), 5);
        assert_eq!(settings.to_string(), "{H3 SETTING 0x33: 5, H3_DATAGRAM: 1}");
    }
}
