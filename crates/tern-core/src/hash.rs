use crate::types::MessageId;

/// Computes BLAKE3 and returns the first-class 32-byte digest value.
pub fn blake3_32(input: &[u8]) -> [u8; 32] {
    *blake3::hash(input).as_bytes()
}

/// Mints an opaque message id from a broker sequence number and payload.
///
/// The id is the hex encoding of the first 16 digest bytes.
pub fn derive_message_id(seq: u64, payload: &[u8]) -> MessageId {
    let mut input = Vec::with_capacity(8 + payload.len());
    input.extend_from_slice(&seq.to_be_bytes());
    input.extend_from_slice(payload);
    let digest = blake3_32(&input);
    MessageId(hex::encode(&digest[..16]))
}

#[cfg(test)]
mod tests {
    use super::{blake3_32, derive_message_id};

    #[test]
    fn hash_is_deterministic() {
        let input = b"tern";
        assert_eq!(blake3_32(input), blake3_32(input));
    }

    #[test]
    fn same_payload_with_different_seq_gets_distinct_ids() {
        let a = derive_message_id(1, b"The hail in Wales");
        let b = derive_message_id(2, b"The hail in Wales");
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert_eq!(a, derive_message_id(1, b"The hail in Wales"));
    }
}
