use bytes::{Bytes, BytesMut};

/// What a producer hands to [`crate::broker::Broker::produce`]. Payloads are
/// opaque; the broker never decodes them (spec.md §3, §9).
#[derive(Debug, Clone)]
pub struct Record {
    pub key: Option<Bytes>,
    pub value: Bytes,
}

impl Record {
    pub fn new(key: Option<Bytes>, value: Bytes) -> Self {
        Self { key, value }
    }

    pub fn without_key(value: impl Into<Bytes>) -> Self {
        Self {
            key: None,
            value: value.into(),
        }
    }

    pub fn with_key(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: Some(key.into()),
            value: value.into(),
        }
    }
}

/// What `read_from`/`subscribe` hand back: a broker-assigned offset plus the
/// bytes originally appended (spec.md §3).
#[derive(Debug, Clone)]
pub struct PolledRecord {
    pub offset: u64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub timestamp_micros: u64,
}

/// A segment frame's payload (spec.md §4.1: `[u32_be len][len bytes payload]`)
/// holds one record's key and value together, since the data model allows an
/// optional key alongside the value but the on-disk format defines only a
/// single opaque payload per frame. The key, if any, gets its own
/// length-prefixed sub-field ahead of the value.
pub(crate) fn encode_frame_payload(key: Option<&[u8]>, value: &[u8]) -> Bytes {
    let key_len = key.map(|k| k.len()).unwrap_or(0) as u32;
    let mut buf = BytesMut::with_capacity(4 + key_len as usize + value.len());
    buf.extend_from_slice(&key_len.to_be_bytes());
    if let Some(k) = key {
        buf.extend_from_slice(k);
    }
    buf.extend_from_slice(value);
    buf.freeze()
}

pub(crate) fn decode_frame_payload(payload: Bytes) -> (Option<Bytes>, Bytes) {
    let key_len = u32::from_be_bytes(payload[0..4].try_into().unwrap()) as usize;
    let key = if key_len > 0 {
        Some(payload.slice(4..4 + key_len))
    } else {
        None
    };
    let value = payload.slice(4 + key_len..);
    (key, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_key_and_value() {
        let payload = encode_frame_payload(Some(b"AAPL"), b"price=1");
        let (key, value) = decode_frame_payload(payload);
        assert_eq!(key.unwrap(), Bytes::from_static(b"AAPL"));
        assert_eq!(value, Bytes::from_static(b"price=1"));
    }

    #[test]
    fn round_trips_without_key() {
        let payload = encode_frame_payload(None, b"value");
        let (key, value) = decode_frame_payload(payload);
        assert!(key.is_none());
        assert_eq!(value, Bytes::from_static(b"value"));
    }
}
