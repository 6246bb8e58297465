//! JSON framing with transparent gzip for large payloads.

use std::borrow::Cow;
use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use super::StateEvent;
use crate::error::{Result, SyncError};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Level used when a configured level is outside 1..=9
pub const DEFAULT_LEVEL: u32 = 6;

/// True if `bytes` starts with the gzip magic number
pub fn is_compressed(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[..2] == GZIP_MAGIC
}

pub fn compress(bytes: &[u8], level: u32) -> Result<Vec<u8>> {
    let level = if (1..=9).contains(&level) {
        level
    } else {
        DEFAULT_LEVEL
    };
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::new(level));
    encoder
        .write_all(bytes)
        .map_err(|e| SyncError::CodecError(format!("gzip write failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| SyncError::CodecError(format!("gzip finish failed: {}", e)))
}

pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(bytes.len() * 4);
    GzDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(|e| SyncError::CodecError(format!("gzip read failed: {}", e)))?;
    Ok(out)
}

/// Serialize `event` as JSON, gzip-compressed when it exceeds `threshold`
/// bytes
pub fn encode_event(event: &StateEvent, threshold: usize, level: u32) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(event)?;
    if json.len() <= threshold {
        return Ok(json);
    }
    compress(&json, level)
}

/// Decode a payload produced by [`encode_event`], compressed or not
pub fn decode_event(bytes: &[u8]) -> Result<StateEvent> {
    let json = if is_compressed(bytes) {
        Cow::Owned(decompress(bytes)?)
    } else {
        Cow::Borrowed(bytes)
    };
    let event: StateEvent = serde_json::from_slice(&json)?;
    event.validate()?;
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{StateDeltaEvent, StateSnapshotEvent};
    use crate::patch::{Patch, PatchOperation};
    use crate::value::Value;

    fn large_snapshot() -> StateEvent {
        let mut map = crate::value::Map::new();
        for i in 0..200 {
            map.insert(format!("key-{i}"), Value::from("a fairly repetitive value"));
        }
        StateSnapshotEvent::new(3, Value::Object(map)).into()
    }

    #[test]
    fn test_small_payload_stays_plain() {
        let event: StateEvent =
            StateDeltaEvent::new(1, Patch::from(vec![PatchOperation::add("/a", 1)])).into();
        let bytes = encode_event(&event, 1024, 6).unwrap();

        assert!(!is_compressed(&bytes));
        assert_eq!(decode_event(&bytes).unwrap(), event);
    }

    #[test]
    fn test_large_payload_is_compressed() {
        let event = large_snapshot();
        let plain = serde_json::to_vec(&event).unwrap();
        let bytes = encode_event(&event, 1024, 6).unwrap();

        assert!(is_compressed(&bytes));
        assert!(bytes.len() < plain.len());
        assert_eq!(decode_event(&bytes).unwrap(), event);
    }

    #[test]
    fn test_out_of_range_level_falls_back() {
        let event = large_snapshot();
        let bytes = encode_event(&event, 0, 42).unwrap();
        assert_eq!(decode_event(&bytes).unwrap(), event);
    }

    #[test]
    fn test_corrupt_gzip_is_codec_error() {
        let mut bytes = encode_event(&large_snapshot(), 0, 6).unwrap();
        bytes.truncate(bytes.len() / 2);
        assert!(matches!(decode_event(&bytes), Err(SyncError::CodecError(_))));
    }
}
