//! On-disk record format (§6.3): a length-prefixed, checksummed record per
//! key. A value length of `u32::MAX` marks a tombstone (a logged delete)
//! rather than storing a zero-length value, so deletes round-trip through
//! the same append-only log as writes.

use rarf_core::error::RarfError;

const TOMBSTONE: u32 = u32::MAX;

pub struct Record {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub expires_at_epoch_ms: Option<i64>,
}

/// `i64::MIN` in the on-disk field means "no expiry"; real wall-clock
/// timestamps this far in the past never legitimately occur.
const NO_EXPIRY: i64 = i64::MIN;

pub fn encode(record: &Record) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + record.key.len() + 4 + record.value.as_ref().map_or(0, Vec::len) + 8 + 4);

    buf.extend_from_slice(&(record.key.len() as u32).to_le_bytes());
    buf.extend_from_slice(&record.key);

    match &record.value {
        Some(value) => {
            buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
            buf.extend_from_slice(value);
        }
        None => buf.extend_from_slice(&TOMBSTONE.to_le_bytes()),
    }

    let expires_at = record.expires_at_epoch_ms.unwrap_or(NO_EXPIRY);
    buf.extend_from_slice(&expires_at.to_le_bytes());

    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

/// Decode one record from the front of `bytes`, returning it plus the number
/// of bytes consumed so the caller can advance a cursor or stop at EOF.
pub fn decode(bytes: &[u8]) -> Result<(Record, usize), RarfError> {
    let mut pos = 0usize;
    let read_u32 = |bytes: &[u8], pos: &mut usize| -> Result<u32, RarfError> {
        let slice = bytes.get(*pos..*pos + 4).ok_or_else(truncated)?;
        *pos += 4;
        Ok(u32::from_le_bytes(slice.try_into().expect("slice is exactly 4 bytes")))
    };

    let key_len = read_u32(bytes, &mut pos)? as usize;
    let key = bytes.get(pos..pos + key_len).ok_or_else(truncated)?.to_vec();
    pos += key_len;

    let val_len = read_u32(bytes, &mut pos)?;
    let value = if val_len == TOMBSTONE {
        None
    } else {
        let val_len = val_len as usize;
        let value = bytes.get(pos..pos + val_len).ok_or_else(truncated)?.to_vec();
        pos += val_len;
        Some(value)
    };

    let expires_slice = bytes.get(pos..pos + 8).ok_or_else(truncated)?;
    let expires_at = i64::from_le_bytes(expires_slice.try_into().expect("slice is exactly 8 bytes"));
    pos += 8;

    let crc_slice = bytes.get(pos..pos + 4).ok_or_else(truncated)?;
    let expected_crc = u32::from_le_bytes(crc_slice.try_into().expect("slice is exactly 4 bytes"));
    let actual_crc = crc32fast::hash(&bytes[..pos]);
    if actual_crc != expected_crc {
        return Err(RarfError::internal(std::io::Error::other("l2 record checksum mismatch")));
    }
    pos += 4;

    Ok((
        Record { key, value, expires_at_epoch_ms: if expires_at == NO_EXPIRY { None } else { Some(expires_at) } },
        pos,
    ))
}

fn truncated() -> RarfError {
    RarfError::internal(std::io::Error::other("l2 record truncated"))
}

/// One row of a snapshot's index (§6.3): where `key` lives in the segment
/// log as of the snapshot, so `StoreState::open` can skip replaying
/// everything before it.
pub struct IndexSnapshotEntry {
    pub key: Vec<u8>,
    pub segment_id: u32,
    pub offset: u64,
    pub length: u32,
    pub expires_at_epoch_ms: Option<i64>,
}

pub fn encode_index_entry(entry: &IndexSnapshotEntry) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + entry.key.len() + 4 + 8 + 4 + 8 + 4);

    buf.extend_from_slice(&(entry.key.len() as u32).to_le_bytes());
    buf.extend_from_slice(&entry.key);
    buf.extend_from_slice(&entry.segment_id.to_le_bytes());
    buf.extend_from_slice(&entry.offset.to_le_bytes());
    buf.extend_from_slice(&entry.length.to_le_bytes());

    let expires_at = entry.expires_at_epoch_ms.unwrap_or(NO_EXPIRY);
    buf.extend_from_slice(&expires_at.to_le_bytes());

    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

pub fn decode_index_entry(bytes: &[u8]) -> Result<(IndexSnapshotEntry, usize), RarfError> {
    let mut pos = 0usize;
    let read_u32 = |bytes: &[u8], pos: &mut usize| -> Result<u32, RarfError> {
        let slice = bytes.get(*pos..*pos + 4).ok_or_else(truncated)?;
        *pos += 4;
        Ok(u32::from_le_bytes(slice.try_into().expect("slice is exactly 4 bytes")))
    };
    let read_u64 = |bytes: &[u8], pos: &mut usize| -> Result<u64, RarfError> {
        let slice = bytes.get(*pos..*pos + 8).ok_or_else(truncated)?;
        *pos += 8;
        Ok(u64::from_le_bytes(slice.try_into().expect("slice is exactly 8 bytes")))
    };

    let key_len = read_u32(bytes, &mut pos)? as usize;
    let key = bytes.get(pos..pos + key_len).ok_or_else(truncated)?.to_vec();
    pos += key_len;

    let segment_id = read_u32(bytes, &mut pos)?;
    let offset = read_u64(bytes, &mut pos)?;
    let length = read_u32(bytes, &mut pos)?;
    let expires_at = read_u64(bytes, &mut pos)? as i64;

    let crc_slice = bytes.get(pos..pos + 4).ok_or_else(truncated)?;
    let expected_crc = u32::from_le_bytes(crc_slice.try_into().expect("slice is exactly 4 bytes"));
    let actual_crc = crc32fast::hash(&bytes[..pos]);
    if actual_crc != expected_crc {
        return Err(RarfError::internal(std::io::Error::other("l2 snapshot entry checksum mismatch")));
    }
    pos += 4;

    Ok((
        IndexSnapshotEntry {
            key,
            segment_id,
            offset,
            length,
            expires_at_epoch_ms: if expires_at == NO_EXPIRY { None } else { Some(expires_at) },
        },
        pos,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_value_with_expiry() {
        let record = Record { key: b"k1".to_vec(), value: Some(b"v1".to_vec()), expires_at_epoch_ms: Some(1_700_000_000_000) };
        let encoded = encode(&record);
        let (decoded, consumed) = decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.key, record.key);
        assert_eq!(decoded.value, record.value);
        assert_eq!(decoded.expires_at_epoch_ms, record.expires_at_epoch_ms);
    }

    #[test]
    fn round_trips_a_tombstone() {
        let record = Record { key: b"k1".to_vec(), value: None, expires_at_epoch_ms: None };
        let encoded = encode(&record);
        let (decoded, _) = decode(&encoded).unwrap();
        assert!(decoded.value.is_none());
        assert!(decoded.expires_at_epoch_ms.is_none());
    }

    #[test]
    fn two_concatenated_records_decode_in_sequence() {
        let first = Record { key: b"a".to_vec(), value: Some(b"1".to_vec()), expires_at_epoch_ms: None };
        let second = Record { key: b"b".to_vec(), value: Some(b"2".to_vec()), expires_at_epoch_ms: None };
        let mut buf = encode(&first);
        buf.extend_from_slice(&encode(&second));

        let (decoded_first, consumed) = decode(&buf).unwrap();
        assert_eq!(decoded_first.key, b"a");
        let (decoded_second, _) = decode(&buf[consumed..]).unwrap();
        assert_eq!(decoded_second.key, b"b");
    }

    #[test]
    fn corrupted_bytes_fail_the_checksum() {
        let record = Record { key: b"k1".to_vec(), value: Some(b"v1".to_vec()), expires_at_epoch_ms: None };
        let mut encoded = encode(&record);
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        assert!(decode(&encoded).is_err());
    }

    #[test]
    fn index_entry_round_trips_with_expiry() {
        let entry = IndexSnapshotEntry { key: b"k1".to_vec(), segment_id: 3, offset: 512, length: 64, expires_at_epoch_ms: Some(1_700_000_000_000) };
        let encoded = encode_index_entry(&entry);
        let (decoded, consumed) = decode_index_entry(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.key, entry.key);
        assert_eq!(decoded.segment_id, entry.segment_id);
        assert_eq!(decoded.offset, entry.offset);
        assert_eq!(decoded.length, entry.length);
        assert_eq!(decoded.expires_at_epoch_ms, entry.expires_at_epoch_ms);
    }

    #[test]
    fn two_concatenated_index_entries_decode_in_sequence() {
        let first = IndexSnapshotEntry { key: b"a".to_vec(), segment_id: 0, offset: 0, length: 10, expires_at_epoch_ms: None };
        let second = IndexSnapshotEntry { key: b"b".to_vec(), segment_id: 1, offset: 20, length: 30, expires_at_epoch_ms: None };
        let mut buf = encode_index_entry(&first);
        buf.extend_from_slice(&encode_index_entry(&second));

        let (decoded_first, consumed) = decode_index_entry(&buf).unwrap();
        assert_eq!(decoded_first.key, b"a");
        let (decoded_second, _) = decode_index_entry(&buf[consumed..]).unwrap();
        assert_eq!(decoded_second.key, b"b");
    }
}
