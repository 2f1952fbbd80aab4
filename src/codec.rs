//! Binary Codec (C5): compact, versioned, little-endian wire encoding for
//! [`MeshFrame`]s.
//!
//! ```text
//! version:u8 | type:u8 | ttl:u8 | hop_count:u8
//! id:[u8;16]
//! timestamp:u32
//! source_len:u8  source:[u8;source_len]
//! has_target:u8  (target_len:u8  target:[u8;target_len])?
//! path_count:u8  (path_entry_len:u8 path_entry:[u8;..])*path_count
//! payload_len:u16  payload:[u8;payload_len]
//! ```

use crate::error::CodecError;
use crate::frame::{FrameType, MeshFrame};

pub const WIRE_VERSION: u8 = 2;
pub const MAX_PATH_ENTRIES: usize = 32;

pub fn encode(frame: &MeshFrame) -> Result<Vec<u8>, CodecError> {
    if frame.route_path.len() > MAX_PATH_ENTRIES {
        return Err(CodecError::PathTooLong(frame.route_path.len()));
    }

    let mut out = Vec::with_capacity(64 + frame.payload.len());
    out.push(WIRE_VERSION);
    out.push(frame.frame_type as u8);
    out.push(frame.ttl);
    out.push(frame.hop_count);
    out.extend_from_slice(&frame.id);
    out.extend_from_slice(&frame.timestamp.to_le_bytes());

    let source = frame.source_id.as_bytes();
    out.push(source.len() as u8);
    out.extend_from_slice(source);

    match &frame.target_id {
        Some(target) => {
            out.push(1);
            let bytes = target.as_bytes();
            out.push(bytes.len() as u8);
            out.extend_from_slice(bytes);
        }
        None => out.push(0),
    }

    out.push(frame.route_path.len() as u8);
    for entry in &frame.route_path {
        let bytes = entry.as_bytes();
        out.push(bytes.len() as u8);
        out.extend_from_slice(bytes);
    }

    out.extend_from_slice(&(frame.payload.len() as u16).to_le_bytes());
    out.extend_from_slice(&frame.payload);

    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<MeshFrame, CodecError> {
    let mut cursor = Cursor::new(bytes);

    let version = cursor.u8()?;
    if version != WIRE_VERSION {
        return Err(CodecError::UnknownVersion(version));
    }

    let type_byte = cursor.u8()?;
    let frame_type = FrameType::from_u8(type_byte).ok_or(CodecError::UnknownType(type_byte))?;
    let ttl = cursor.u8()?;
    let hop_count = cursor.u8()?;
    let id = cursor.bytes(16)?.try_into().expect("exactly 16 bytes");
    let timestamp = u32::from_le_bytes(cursor.bytes(4)?.try_into().expect("exactly 4 bytes"));

    let source_len = cursor.u8()? as usize;
    let source_id = cursor.string(source_len)?;

    let has_target = cursor.u8()?;
    let target_id = if has_target != 0 {
        let target_len = cursor.u8()? as usize;
        Some(cursor.string(target_len)?)
    } else {
        None
    };

    let path_count = cursor.u8()? as usize;
    if path_count > MAX_PATH_ENTRIES {
        return Err(CodecError::PathTooLong(path_count));
    }
    let mut route_path = Vec::with_capacity(path_count);
    for _ in 0..path_count {
        let entry_len = cursor.u8()? as usize;
        route_path.push(cursor.string(entry_len)?);
    }

    let payload_len = u16::from_le_bytes(cursor.bytes(2)?.try_into().expect("exactly 2 bytes")) as usize;
    let payload = cursor.bytes(payload_len)?.to_vec();

    Ok(MeshFrame {
        id,
        frame_type,
        source_id,
        target_id,
        payload,
        timestamp,
        ttl,
        hop_count,
        route_path,
    })
}

/// Minimal forward-only byte cursor; keeps [`decode`] free of manual offset
/// bookkeeping.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + n > self.buf.len() {
            return Err(CodecError::TruncatedInput {
                needed: self.pos + n,
                have: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.bytes(1)?[0])
    }

    fn string(&mut self, len: usize) -> Result<String, CodecError> {
        Ok(String::from_utf8_lossy(self.bytes(len)?).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_broadcast_frame() {
        let frame = MeshFrame::new(FrameType::Chat, "alice".into(), None, b"hello".to_vec());
        let encoded = encode(&frame).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn round_trips_a_targeted_frame_with_route_path() {
        let mut frame = MeshFrame::new(FrameType::EmergencyDanger, "alice".into(), Some("bob".into()), vec![1, 2, 3]);
        frame.route_path.push("carol".into());
        let encoded = encode(&frame).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = encode(&MeshFrame::new(FrameType::Chat, "a".into(), None, vec![])).unwrap();
        bytes[0] = 99;
        assert!(matches!(decode(&bytes), Err(CodecError::UnknownVersion(99))));
    }

    #[test]
    fn rejects_truncated_input() {
        let bytes = encode(&MeshFrame::new(FrameType::Chat, "a".into(), None, vec![1, 2, 3])).unwrap();
        let err = decode(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, CodecError::TruncatedInput { .. }));
    }

    #[test]
    fn rejects_path_too_long() {
        let mut frame = MeshFrame::new(FrameType::Chat, "a".into(), None, vec![]);
        frame.route_path = (0..40).map(|i| format!("p{i}")).collect();
        assert!(matches!(encode(&frame), Err(CodecError::PathTooLong(40))));
    }
}
