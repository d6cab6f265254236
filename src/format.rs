use std::fmt;

use crate::{
    codec::{NumberDecoder, NumberEncoder},
    types::{SequenceNumber, ValueType, MAX_SEQUENCE_NUMBER},
};

// An internal key is the user key followed by an 8-byte little-endian tag
// of (sequence << 8 | type).

pub fn pack_sequence_and_type(seq: SequenceNumber, t: ValueType) -> u64 {
    assert!(seq <= MAX_SEQUENCE_NUMBER);
    (seq << 8) | t as u64
}

pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    assert!(internal_key.len() >= 8);
    &internal_key[..internal_key.len() - 8]
}

pub fn extract_tag(internal_key: &[u8]) -> u64 {
    assert!(internal_key.len() >= 8);
    let mut buf = &internal_key[internal_key.len() - 8..];
    buf.decode_u64_le().unwrap()
}

#[derive(Default, Clone, PartialEq, Eq)]
pub struct InternalKey {
    rep: Vec<u8>,
}

impl InternalKey {
    pub fn empty() -> Self {
        InternalKey { rep: Vec::new() }
    }

    pub fn new(user_key: &[u8], s: SequenceNumber, t: ValueType) -> Self {
        let mut rep = Vec::with_capacity(user_key.len() + 8);
        ParsedInternalKey {
            user_key,
            sequence: s,
            val_type: t,
        }
        .append(&mut rep);
        InternalKey { rep }
    }

    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.rep)
    }

    pub fn encode(&self) -> &[u8] {
        &self.rep
    }

    pub fn decode(&mut self, data: &[u8]) -> bool {
        if data.len() < 8 {
            return false;
        }
        self.rep.clear();
        self.rep.extend_from_slice(data);
        true
    }
}

impl fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rep.len() < 8 {
            return write!(f, "InternalKey(invalid {:?})", self.rep);
        }
        let tag = extract_tag(&self.rep);
        write!(
            f,
            "InternalKey({:?} seq={} type={})",
            String::from_utf8_lossy(self.user_key()),
            tag >> 8,
            tag & 0xff,
        )
    }
}

pub struct ParsedInternalKey<'a> {
    pub user_key: &'a [u8],
    pub sequence: SequenceNumber,
    pub val_type: ValueType,
}

impl<'a> ParsedInternalKey<'a> {
    pub fn append(&self, result: &mut Vec<u8>) {
        result.extend_from_slice(self.user_key);
        result
            .encode_u64_le(pack_sequence_and_type(self.sequence, self.val_type))
            .unwrap();
    }

    // None when the trailer is missing or carries an unknown tag.
    pub fn try_parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }
        let tag = extract_tag(data);
        let val_type = ValueType::try_from((tag & 0xff) as u8).ok()?;
        Some(ParsedInternalKey {
            user_key: &data[..data.len() - 8],
            sequence: tag >> 8,
            val_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_key_round_trip() {
        let key = InternalKey::new(b"raven", 42, ValueType::Value);
        let mut decoded = InternalKey::empty();
        assert!(decoded.decode(key.encode()));
        assert_eq!(decoded, key);
        assert_eq!(decoded.user_key(), b"raven");

        let parsed = ParsedInternalKey::try_parse(decoded.encode()).unwrap();
        assert_eq!(parsed.user_key, b"raven");
        assert_eq!(parsed.sequence, 42);
        assert_eq!(parsed.val_type, ValueType::Value);
    }

    #[test]
    fn test_empty_user_key() {
        let key = InternalKey::new(b"", 1, ValueType::Deletion);
        assert_eq!(key.encode().len(), 8);
        let parsed = ParsedInternalKey::try_parse(key.encode()).unwrap();
        assert_eq!(parsed.user_key, b"");
        assert_eq!(parsed.val_type, ValueType::Deletion);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ParsedInternalKey::try_parse(b"short").is_none());
        let mut raw = Vec::from(&b"key"[..]);
        raw.extend_from_slice(&[0x7f, 0, 0, 0, 0, 0, 0, 0]);
        assert!(ParsedInternalKey::try_parse(&raw).is_none());
    }
}
