use sha2::{Digest, Sha256};

/// SHA-256 of the record content, hex-encoded.
pub fn content_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Chain hash for a record:
/// `sha256(previousHash || contentHash || userId || timestampMs)` over the
/// hex/string concatenation, hex-encoded. The first record of a stream uses
/// an empty string in place of the previous hash.
pub fn chain_hash(
    previous_hash: Option<&str>,
    content_hash: &str,
    user_id: &str,
    timestamp_ms: i64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(previous_hash.unwrap_or("").as_bytes());
    hasher.update(content_hash.as_bytes());
    hasher.update(user_id.as_bytes());
    hasher.update(timestamp_ms.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_sha256_hex() {
        let h = content_hash(b"hello");
        assert_eq!(h.len(), 64);
        assert_eq!(
            h,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_chain_hash_reproducible_from_stored_fields() {
        let ch = content_hash(b"hello");
        let first = chain_hash(None, &ch, "user-1", 1700000000000);
        // Recomputing from the same stored fields yields the same hash.
        assert_eq!(first, chain_hash(None, &ch, "user-1", 1700000000000));
        // None and empty string are the same genesis input.
        assert_eq!(first, chain_hash(Some(""), &ch, "user-1", 1700000000000));
    }

    #[test]
    fn test_chain_hash_links_records() {
        let ch1 = content_hash(b"v1");
        let h1 = chain_hash(None, &ch1, "user-1", 1);
        let ch2 = content_hash(b"v2");
        let h2 = chain_hash(Some(&h1), &ch2, "user-1", 2);
        assert_ne!(h1, h2);
        // Any change to a chained field changes the hash.
        assert_ne!(h2, chain_hash(Some(&h1), &ch2, "user-2", 2));
        assert_ne!(h2, chain_hash(Some(&h1), &ch2, "user-1", 3));
        assert_ne!(h2, chain_hash(Some(&ch1), &ch2, "user-1", 2));
    }
}
