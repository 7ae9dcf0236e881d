// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Key-validation nonce derivation (§4.3 handshake).
//!
//! §1 scopes key-derivation cryptography out as "a black-box primitive
//! suite"; this module is that boundary — a trait the connection core calls
//! through, plus a deterministic placeholder implementation. A production
//! deployment would swap in the teacher's `mls-assist`/`openmls`-backed HPKE
//! key agreement (see `backend/src/crypto/hpke.rs`) behind the same trait.

use sha2::{Digest, Sha256};

/// Derives a per-handshake validation nonce from a user's public key, and
/// encrypts it so that only the holder of the matching private key can
/// recover the plaintext the server retains for comparison.
pub trait KeyAgreement: Send + Sync + 'static {
    /// Returns `(plaintext_nonce, encrypted_validation_message)`.
    fn generate_validation_challenge(&self, public_key: &[u8], connection_nonce: &[u8]) -> (Vec<u8>, Vec<u8>);
}

/// A deterministic stand-in suitable for tests and for driving the
/// connection state machine end to end without a real asymmetric key
/// agreement primitive wired in. Not suitable for production: it is
/// trivially invertible by anyone who can compute SHA-256.
#[derive(Default)]
pub struct PlaceholderKeyAgreement;

impl KeyAgreement for PlaceholderKeyAgreement {
    fn generate_validation_challenge(
        &self,
        public_key: &[u8],
        connection_nonce: &[u8],
    ) -> (Vec<u8>, Vec<u8>) {
        let mut hasher = Sha256::new();
        hasher.update(public_key);
        hasher.update(connection_nonce);
        let plaintext: Vec<u8> = hasher.finalize().to_vec();
        // Stand-in "encryption": XOR with the public key, repeated to
        // length. A real implementation seals this under the user's public
        // key via HPKE so only the matching private key recovers it.
        let encrypted = plaintext
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ public_key.get(i % public_key.len().max(1)).copied().unwrap_or(0))
            .collect();
        (plaintext, encrypted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_is_deterministic_for_the_same_inputs() {
        let ka = PlaceholderKeyAgreement;
        let (p1, e1) = ka.generate_validation_challenge(b"pubkey", b"nonce");
        let (p2, e2) = ka.generate_validation_challenge(b"pubkey", b"nonce");
        assert_eq!(p1, p2);
        assert_eq!(e1, e2);
    }

    #[test]
    fn different_connection_nonces_yield_different_challenges() {
        let ka = PlaceholderKeyAgreement;
        let (p1, _) = ka.generate_validation_challenge(b"pubkey", b"nonce-a");
        let (p2, _) = ka.generate_validation_challenge(b"pubkey", b"nonce-b");
        assert_ne!(p1, p2);
    }
}
