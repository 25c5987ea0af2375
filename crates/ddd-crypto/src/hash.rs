//! BLAKE3 hashing and key derivation.
//!
//! Every derived key in the protocol goes through this module with its own
//! context string, so keys for the ratchet, the id cipher and identity
//! wrapping can never collide even when fed the same secret.

/// BLAKE3 hash output (32 bytes).
pub type HashOutput = [u8; 32];

/// Context for the handshake root key.
pub const CONTEXT_HANDSHAKE: &str = "ddd 2024 x3dh root key";
/// Context for DH ratchet root/chain splits.
pub const CONTEXT_ROOT_RATCHET: &[u8] = b"ddd ratchet root";
/// Context for the id cipher Argon2 salt.
pub const CONTEXT_ID_SALT: &str = "ddd 2024 bundle id salt";
/// Context for the deterministic id cipher nonce key.
pub const CONTEXT_ID_SIV: &str = "ddd 2024 bundle id siv";
/// Context for identity key wrapping.
pub const CONTEXT_WRAP: &str = "ddd 2024 identity wrap";

/// Compute BLAKE3 hash of input data.
#[must_use]
pub fn hash(data: &[u8]) -> HashOutput {
    *blake3::hash(data).as_bytes()
}

/// Keyed BLAKE3 (a MAC when the key is secret).
#[must_use]
pub fn keyed_hash(key: &[u8; 32], data: &[u8]) -> HashOutput {
    *blake3::keyed_hash(key, data).as_bytes()
}

/// BLAKE3 Key Derivation Function with context.
pub struct Kdf {
    context: &'static str,
}

impl Kdf {
    /// Create a KDF with a specific context string.
    #[must_use]
    pub fn new(context: &'static str) -> Self {
        Self { context }
    }

    /// Derive output of any length from input key material.
    pub fn derive(&self, ikm: &[u8], output: &mut [u8]) {
        let mut hasher = blake3::Hasher::new_derive_key(self.context);
        hasher.update(ikm);
        hasher.finalize_xof().fill(output);
    }

    /// Derive a 32-byte key.
    #[must_use]
    pub fn derive_key(&self, ikm: &[u8]) -> [u8; 32] {
        blake3::derive_key(self.context, ikm)
    }
}

/// HKDF-Extract over keyed BLAKE3.
#[must_use]
pub fn hkdf_extract(salt: &[u8], ikm: &[u8]) -> [u8; 32] {
    if salt.is_empty() {
        hash(ikm)
    } else {
        keyed_hash(&hash(salt), ikm)
    }
}

/// HKDF-Expand over keyed BLAKE3 in XOF mode.
pub fn hkdf_expand(prk: &[u8; 32], info: &[u8], output: &mut [u8]) {
    let mut hasher = blake3::Hasher::new_keyed(prk);
    hasher.update(info);
    hasher.finalize_xof().fill(output);
}

/// HKDF: combined extract-then-expand.
pub fn hkdf(salt: &[u8], ikm: &[u8], info: &[u8], output: &mut [u8]) {
    let prk = hkdf_extract(salt, ikm);
    hkdf_expand(&prk, info, output);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kdf_contexts_separate() {
        let ikm = b"same input";
        assert_ne!(
            Kdf::new(CONTEXT_ID_SALT).derive_key(ikm),
            Kdf::new(CONTEXT_WRAP).derive_key(ikm)
        );
    }

    #[test]
    fn test_kdf_derive_matches_derive_key_prefix() {
        let kdf = Kdf::new(CONTEXT_HANDSHAKE);
        let mut long = [0u8; 64];
        kdf.derive(b"ikm", &mut long);
        assert_eq!(&long[..32], &kdf.derive_key(b"ikm"));
    }

    #[test]
    fn test_hkdf_salt_changes_output() {
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        hkdf(b"salt-a", b"ikm", CONTEXT_ROOT_RATCHET, &mut a);
        hkdf(b"salt-b", b"ikm", CONTEXT_ROOT_RATCHET, &mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_keyed_hash_depends_on_key() {
        assert_ne!(keyed_hash(&[1; 32], b"x"), keyed_hash(&[2; 32], b"x"));
        assert_eq!(keyed_hash(&[1; 32], b"x"), keyed_hash(&[1; 32], b"x"));
    }
}
