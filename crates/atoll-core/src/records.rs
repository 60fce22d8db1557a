//! Versioned, checksummed envelope for persisted records.
//!
//! Layout: `struct_version: u8`, `compat_version: u8`, `len: u32 LE`, the
//! bincode body, then a CRC32 of everything preceding it. A reader accepts
//! any record whose `compat_version` it supports; fields appended by newer
//! writers sit past what the reader decodes and are skipped via the length
//! preamble.

use serde::de::DeserializeOwned;
use serde::Serialize;

const HEADER_LEN: usize = 6;
const CRC_LEN: usize = 4;

/// Failure to decode a persisted record. Corruption of a PG's log or info
/// record is fatal for that PG.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("record truncated ({0})")]
    Truncated(&'static str),
    #[error("record checksum mismatch")]
    Corrupt,
    #[error("record requires compat version {required}, reader supports {supported}")]
    VersionTooNew { required: u8, supported: u8 },
    #[error("record body malformed: {0}")]
    Body(#[from] bincode::Error),
}

/// A decoded record and the version it was written with.
#[derive(Debug, PartialEq, Eq)]
pub struct Decoded<T> {
    pub struct_version: u8,
    pub value: T,
}

/// Encodes `value` into the versioned envelope.
pub fn encode_record<T: Serialize>(struct_version: u8, compat_version: u8, value: &T) -> Vec<u8> {
    debug_assert!(compat_version <= struct_version);
    let body = bincode::serialize(value).expect("serializing to memory cannot fail");
    let len = u32::try_from(body.len()).expect("record bodies are far below 4 GiB");
    let mut out = Vec::with_capacity(HEADER_LEN + body.len() + CRC_LEN);
    out.push(struct_version);
    out.push(compat_version);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&body);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&out);
    out.extend_from_slice(&hasher.finalize().to_le_bytes());
    out
}

/// Decodes a record, verifying the checksum and the version gate.
///
/// `supported_version` is the newest `struct_version` this reader
/// understands; records from newer writers decode as long as their
/// `compat_version` does not exceed it.
pub fn decode_record<T: DeserializeOwned>(
    supported_version: u8,
    bytes: &[u8],
) -> Result<Decoded<T>, RecordError> {
    if bytes.len() < HEADER_LEN + CRC_LEN {
        return Err(RecordError::Truncated("header"));
    }
    let struct_version = bytes[0];
    let compat_version = bytes[1];
    let len = u32::from_le_bytes(
        bytes[2..6]
            .try_into()
            .expect("slice length checked above"),
    ) as usize;
    let total = HEADER_LEN + len + CRC_LEN;
    if bytes.len() < total {
        return Err(RecordError::Truncated("body"));
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes[..HEADER_LEN + len]);
    let expected = u32::from_le_bytes(
        bytes[HEADER_LEN + len..total]
            .try_into()
            .expect("slice length checked above"),
    );
    if hasher.finalize() != expected {
        return Err(RecordError::Corrupt);
    }

    if compat_version > supported_version {
        return Err(RecordError::VersionTooNew {
            required: compat_version,
            supported: supported_version,
        });
    }

    // bincode's legacy entry point tolerates trailing bytes, which is what
    // lets an old reader skip fields appended by a newer writer.
    let value = bincode::deserialize(&bytes[HEADER_LEN..HEADER_LEN + len])?;
    Ok(Decoded {
        struct_version,
        value,
    })
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::info::PgInfo;
    use crate::{Eversion, PgId};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct RecordV1 {
        a: u64,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct RecordV2 {
        a: u64,
        b: String,
    }

    #[test]
    fn round_trips_pg_info() {
        let mut info = PgInfo::new(PgId(42));
        info.last_update = Eversion::new(5, 100);
        info.last_complete = Eversion::new(5, 90);

        let bytes = encode_record(3, 1, &info);
        let decoded: Decoded<PgInfo> = decode_record(3, &bytes).expect("decode");
        assert_eq!(decoded.struct_version, 3);
        assert_eq!(decoded.value, info);
    }

    #[test]
    fn flipped_bit_is_detected() {
        let mut bytes = encode_record(1, 1, &RecordV1 { a: 7 });
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x40;
        let result: Result<Decoded<RecordV1>, _> = decode_record(1, &bytes);
        assert!(matches!(result, Err(RecordError::Corrupt)));
    }

    atoll_test_utils::param_test! {
        version_gate: [
            same_version_ok: (3, 3, 3, true),
            older_compat_ok: (5, 2, 3, true),
            newer_compat_rejected: (5, 4, 3, false),
            ancient_reader_rejected: (2, 2, 1, false),
        ]
    }
    fn version_gate(struct_version: u8, compat_version: u8, supported: u8, ok: bool) {
        let bytes = encode_record(struct_version, compat_version, &RecordV1 { a: 7 });
        let result: Result<Decoded<RecordV1>, _> = decode_record(supported, &bytes);
        assert_eq!(result.is_ok(), ok);
        if !ok {
            assert!(matches!(result, Err(RecordError::VersionTooNew { .. })));
        }
    }

    #[test]
    fn old_reader_skips_appended_fields() {
        // A v2 writer appends a field; a v1 reader decodes the prefix and
        // skips the rest via the length preamble.
        let bytes = encode_record(
            2,
            1,
            &RecordV2 {
                a: 11,
                b: "appended".to_owned(),
            },
        );
        let decoded: Decoded<RecordV1> = decode_record(1, &bytes).expect("decode");
        assert_eq!(decoded.value, RecordV1 { a: 11 });
        assert_eq!(decoded.struct_version, 2);
    }

    #[test]
    fn truncated_record_is_rejected() {
        let bytes = encode_record(1, 1, &RecordV1 { a: 7 });
        let result: Result<Decoded<RecordV1>, _> = decode_record(1, &bytes[..bytes.len() - 2]);
        assert!(matches!(result, Err(RecordError::Truncated(_))));
    }
}
