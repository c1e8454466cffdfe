//! Random transaction identifiers.

use rand::RngCore;

use crate::types::TransactionId;

/// Generate a fresh transaction id: 16 random bytes, hex-encoded (32 chars).
pub fn new_transaction_id() -> TransactionId {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    TransactionId::new(hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_32_hex_chars() {
        let id = new_transaction_id();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn ids_are_unique_in_practice() {
        let a = new_transaction_id();
        let b = new_transaction_id();
        assert_ne!(a, b);
    }
}
