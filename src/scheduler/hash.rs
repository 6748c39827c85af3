//! Session-hash derivation (§6, wire-stable). Produces the opaque
//! `SessionHash` consumed by every other module purely as a string; no
//! consumer outside this file may depend on its internal structure.

use crate::ids::SessionHash;
use sha2::{Digest, Sha256};

/// Derives a session hash from whatever stable request fields are
/// available. Callers pass the most specific identifier they have — e.g. a
/// metadata user-id field carried in the request body — falling back to a
/// composite of less specific fields when absent. The result must be
/// deterministic across retries of the same logical conversation turn.
pub fn derive_session_hash(parts: &[&str]) -> SessionHash {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b"\0");
        }
        hasher.update(part.as_bytes());
    }
    SessionHash::from(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_across_calls() {
        let a = derive_session_hash(&["user-42", "conversation-7"]);
        let b = derive_session_hash(&["user-42", "conversation-7"]);
        assert_eq!(a, b);
    }

    #[test]
    fn differs_for_unrelated_sessions() {
        let a = derive_session_hash(&["user-42", "conversation-7"]);
        let b = derive_session_hash(&["user-43", "conversation-7"]);
        assert_ne!(a, b);
    }

    #[test]
    fn field_boundary_is_not_ambiguous() {
        // "ab" + "c" must not hash the same as "a" + "bc".
        let a = derive_session_hash(&["ab", "c"]);
        let b = derive_session_hash(&["a", "bc"]);
        assert_ne!(a, b);
    }
}
