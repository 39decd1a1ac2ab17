//! Unique identifiers and random nonces.
//!
//! Holder ids for leader leases, event ids for the outbox, and the salt
//! appended to replayed idempotency keys all come from here.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// A fresh v4 UUID as a lowercase hyphenated string.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Identity of this process for lease acquisition.
///
/// Unique per construction; two electors in one process are two holders.
pub fn holder_id() -> String {
    format!("{}-{}", std::process::id(), new_id())
}

/// Random alphanumeric nonce of the given length.
pub fn nonce(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn holder_ids_embed_the_pid() {
        let id = holder_id();
        assert!(id.starts_with(&std::process::id().to_string()));
    }

    #[test]
    fn nonce_has_requested_length_and_charset() {
        let n = nonce(16);
        assert_eq!(n.len(), 16);
        assert!(n.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn nonces_differ() {
        assert_ne!(nonce(12), nonce(12));
    }
}
