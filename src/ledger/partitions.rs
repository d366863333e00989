/// Key layout for the index's Fjall partitions
///
/// Partition structure:
/// - `locations`: {ledger_id BE}{entry_id BE} -> EntryLocation (20 bytes)
/// - `ledgers`: {ledger_id BE} -> LedgerMetadata (JSON)
/// - `metadata`: meta:{key} -> value (JSON)
///
/// Big-endian ids keep a ledger's entries contiguous and ordered, so a
/// prefix scan walks them by entry id.
use super::types::{EntryId, LedgerId};

pub const LOCATIONS_PARTITION: &str = "locations";
pub const LEDGERS_PARTITION: &str = "ledgers";
pub const METADATA_PARTITION: &str = "metadata";

/// Metadata key holding the last completed checkpoint mark.
pub const LAST_MARK: &str = "last_mark";

/// Encode a location key: {ledger_id}{entry_id}
pub fn encode_location_key(ledger_id: LedgerId, entry_id: EntryId) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&ledger_id.to_be_bytes());
    key.extend_from_slice(&entry_id.to_be_bytes());
    key
}

/// Decode a location key -> (ledger_id, entry_id)
pub fn decode_location_key(key: &[u8]) -> Option<(LedgerId, EntryId)> {
    if key.len() != 16 {
        return None;
    }
    let ledger_id = LedgerId::from_be_bytes(key[..8].try_into().ok()?);
    let entry_id = EntryId::from_be_bytes(key[8..].try_into().ok()?);
    Some((ledger_id, entry_id))
}

/// Encode a ledger key, which is also the prefix of its location keys
pub fn encode_ledger_key(ledger_id: LedgerId) -> Vec<u8> {
    ledger_id.to_be_bytes().to_vec()
}

pub fn decode_ledger_key(key: &[u8]) -> Option<LedgerId> {
    Some(LedgerId::from_be_bytes(key.try_into().ok()?))
}

/// Encode a metadata key: meta:{key}
pub fn encode_meta_key(key: &str) -> Vec<u8> {
    format!("meta:{}", key).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_key_encoding() {
        let key = encode_location_key(42, 7);
        assert_eq!(&key[..8], &encode_ledger_key(42)[..]);
        assert_eq!(decode_location_key(&key), Some((42, 7)));
        assert_eq!(decode_location_key(b"short"), None);
    }

    #[test]
    fn test_location_keys_sort_by_entry() {
        let mut keys = vec![
            encode_location_key(1, 256),
            encode_location_key(2, 0),
            encode_location_key(1, 3),
        ];
        keys.sort();
        let decoded: Vec<_> = keys.iter().filter_map(|k| decode_location_key(k)).collect();
        assert_eq!(decoded, vec![(1, 3), (1, 256), (2, 0)]);
    }

    #[test]
    fn test_ledger_key_encoding() {
        assert_eq!(decode_ledger_key(&encode_ledger_key(u64::MAX)), Some(u64::MAX));
        assert_eq!(decode_ledger_key(b"abc"), None);
    }

    #[test]
    fn test_meta_key_encoding() {
        assert_eq!(encode_meta_key(LAST_MARK), b"meta:last_mark");
    }
}
