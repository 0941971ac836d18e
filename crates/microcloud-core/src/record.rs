//! mDNS service record payload.
//!
//! A broadcasting initiator advertises itself under [`SERVICE_NAME`] with a
//! TXT record holding a JSON-encoded [`ServerInfo`]. DNS TXT character
//! strings cap out at 255 bytes, so the JSON is split into segments and
//! re-joined on the receiving side.
//!
//! Discovery is best-effort only: nothing in the record is trusted, every
//! subsequent message is authenticated by HMAC and mTLS.

use serde::{Deserialize, Serialize};

/// mDNS service queried and advertised during trust establishment.
pub const SERVICE_NAME: &str = "_microcloud._tcp.local.";

/// Maximum length of a single DNS TXT character string.
const TXT_SEGMENT_LEN: usize = 255;

/// Contents of the TXT record advertised by a broadcasting initiator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Protocol version tag; lookups ignore responders with another version.
    pub version: String,
    /// Initiator's node name.
    pub name: String,
    /// Address the initiator listens on.
    pub address: String,
}

impl ServerInfo {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION.to_string(),
            name: name.into(),
            address: address.into(),
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("ServerInfo serialization should not fail")
    }

    /// Try to parse from JSON bytes.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }

    /// TXT segments carrying the JSON encoding.
    pub fn to_txt(&self) -> Vec<Vec<u8>> {
        txt_segments(&self.to_json())
    }

    /// Reassemble from TXT segments.
    pub fn from_txt<'a>(segments: impl IntoIterator<Item = &'a [u8]>) -> Option<Self> {
        Self::from_json(&join_segments(segments))
    }
}

/// Split bytes into DNS TXT character strings of at most 255 bytes.
pub fn txt_segments(data: &[u8]) -> Vec<Vec<u8>> {
    if data.is_empty() {
        return vec![Vec::new()];
    }

    data.chunks(TXT_SEGMENT_LEN).map(<[u8]>::to_vec).collect()
}

/// Concatenate TXT character strings back into the original bytes.
pub fn join_segments<'a>(segments: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    segments.into_iter().flatten().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Chunking ====================

    #[test]
    fn test_short_payload_is_single_segment() {
        let segments = txt_segments(b"hello");
        assert_eq!(segments, vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_segments_never_exceed_255_bytes() {
        let data = vec![b'x'; 1000];
        let segments = txt_segments(&data);

        assert_eq!(segments.len(), 4);
        assert!(segments.iter().all(|s| s.len() <= 255));
        assert_eq!(segments[3].len(), 1000 - 3 * 255);
    }

    #[test]
    fn test_join_restores_original() {
        for len in [0, 1, 254, 255, 256, 510, 511, 1000] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let segments = txt_segments(&data);
            let joined = join_segments(segments.iter().map(Vec::as_slice));
            assert_eq!(joined, data, "length {len}");
        }
    }

    // ==================== ServerInfo ====================

    #[test]
    fn test_server_info_round_trip() {
        let info = ServerInfo::new("node-a", "10.0.0.1:9444");
        let parsed = ServerInfo::from_txt(info.to_txt().iter().map(Vec::as_slice)).unwrap();

        assert_eq!(parsed, info);
        assert_eq!(parsed.version, crate::PROTOCOL_VERSION);
    }

    #[test]
    fn test_wire_format() {
        let info = ServerInfo::new("node-a", "10.0.0.1:9444");
        let json = String::from_utf8(info.to_json()).unwrap();

        assert!(json.contains("\"version\":"));
        assert!(json.contains("\"name\":\"node-a\""));
        assert!(json.contains("\"address\":\"10.0.0.1:9444\""));
    }

    #[test]
    fn test_from_txt_rejects_garbage() {
        assert!(ServerInfo::from_txt([b"not json".as_slice()]).is_none());
    }
}
