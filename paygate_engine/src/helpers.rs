//! Small helpers shared across the engine.
use rand::{thread_rng, Rng};

use crate::db_types::SessionId;

/// Generates a random lowercase-hex string of `len` characters.
pub fn random_hex(len: usize) -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = thread_rng();
    (0..len).map(|_| HEX[rng.gen_range(0..16)] as char).collect()
}

/// A fresh, unguessable session identifier.
pub fn new_session_id() -> SessionId {
    SessionId(format!("ps_{}", random_hex(24)))
}

/// A fresh callback token. Bound to a single session and carried as a query parameter by the
/// provider when it calls back, so it must be unguessable but need not be memorable.
pub fn new_callback_token() -> String {
    random_hex(32)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn random_hex_has_requested_length_and_charset() {
        let s = random_hex(64);
        assert_eq!(s.len(), 64);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn session_ids_are_unique() {
        let a = new_session_id();
        let b = new_session_id();
        assert_ne!(a, b);
    }
}
