//! Packet encryption
//!
//! The connection only sequences encryption around framing: payloads are
//! encrypted after encoding and decrypted before decoding, headers travel in
//! the clear. The cipher itself is a collaborator behind [`PacketCipher`].
//!
//! Two implementations ship with the crate:
//! - [`NullCipher`] passes bytes through (encryption disabled)
//! - [`FeedbackXorCipher`] is the keyed xor scheme the stock client expects.
//!   It obfuscates, it does not authenticate.

use std::sync::Arc;

use thiserror::Error;

use crate::protocol::ConnectionType;

/// Default key seed for auth gateway connections
pub const AUTH_KEY_SEED: u64 = 0x0E9B_3F26_D41C_7A55;

/// Default key seed for world gateway connections
pub const WORLD_KEY_SEED: u64 = 0x6C21_D8A0_93F7_4B1E;

/// Cipher errors. All of them are fatal for the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("Key state is empty")]
    EmptyKey,

    #[error("Decryption failed: {0}")]
    Decrypt(String),
}

pub type CipherResult<T> = Result<T, CipherError>;

/// Connection-local key material. Opaque to everything but the cipher that
/// derived it.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyState {
    material: Vec<u8>,
}

impl KeyState {
    pub fn new(material: Vec<u8>) -> Self {
        Self { material }
    }

    pub fn material(&self) -> &[u8] {
        &self.material
    }

    pub fn material_mut(&mut self) -> &mut Vec<u8> {
        &mut self.material
    }
}

impl std::fmt::Debug for KeyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyState")
            .field("len", &self.material.len())
            .finish_non_exhaustive()
    }
}

/// Encryption collaborator. One instance is shared by every connection;
/// per-connection state lives in the [`KeyState`] it derives.
pub trait PacketCipher: Send + Sync {
    fn derive_key(&self, seed: u64) -> KeyState;

    fn encrypt(&self, plaintext: &[u8], key: &mut KeyState) -> Vec<u8>;

    fn decrypt(&self, ciphertext: &[u8], key: &mut KeyState) -> CipherResult<Vec<u8>>;
}

/// Passthrough cipher
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCipher;

impl PacketCipher for NullCipher {
    fn derive_key(&self, _seed: u64) -> KeyState {
        KeyState::new(Vec::new())
    }

    fn encrypt(&self, plaintext: &[u8], _key: &mut KeyState) -> Vec<u8> {
        plaintext.to_vec()
    }

    fn decrypt(&self, ciphertext: &[u8], _key: &mut KeyState) -> CipherResult<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}

/// Keyed xor with ciphertext feedback, restarted for every packet
#[derive(Debug, Default, Clone, Copy)]
pub struct FeedbackXorCipher;

impl FeedbackXorCipher {
    /// Bytes of key material derived from a seed
    pub const KEY_LEN: usize = 64;

    fn next_word(state: &mut u64) -> u64 {
        // splitmix64
        *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = *state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}

impl PacketCipher for FeedbackXorCipher {
    fn derive_key(&self, seed: u64) -> KeyState {
        let mut state = seed;
        let material = (0..Self::KEY_LEN / 8)
            .flat_map(|_| Self::next_word(&mut state).to_le_bytes())
            .collect();
        KeyState::new(material)
    }

    fn encrypt(&self, plaintext: &[u8], key: &mut KeyState) -> Vec<u8> {
        let material = key.material();
        if material.is_empty() {
            return plaintext.to_vec();
        }

        let mut feedback = material[material.len() - 1];
        plaintext
            .iter()
            .enumerate()
            .map(|(i, &byte)| {
                let out = byte ^ material[i % material.len()] ^ feedback;
                feedback = out;
                out
            })
            .collect()
    }

    fn decrypt(&self, ciphertext: &[u8], key: &mut KeyState) -> CipherResult<Vec<u8>> {
        let material = key.material();
        if material.is_empty() {
            return Err(CipherError::EmptyKey);
        }

        let mut feedback = material[material.len() - 1];
        Ok(ciphertext
            .iter()
            .enumerate()
            .map(|(i, &byte)| {
                let out = byte ^ material[i % material.len()] ^ feedback;
                feedback = byte;
                out
            })
            .collect())
    }
}

/// Seeds used to derive per-connection keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySeeds {
    pub auth: u64,
    pub world: u64,
}

impl KeySeeds {
    pub fn for_connection(&self, connection_type: ConnectionType) -> u64 {
        match connection_type {
            ConnectionType::Auth => self.auth,
            ConnectionType::World => self.world,
        }
    }
}

impl Default for KeySeeds {
    fn default() -> Self {
        Self {
            auth: AUTH_KEY_SEED,
            world: WORLD_KEY_SEED,
        }
    }
}

/// Cipher selected by the `encryption.enabled` setting
pub fn default_cipher(enabled: bool) -> Arc<dyn PacketCipher> {
    if enabled {
        Arc::new(FeedbackXorCipher)
    } else {
        Arc::new(NullCipher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feedback_xor_roundtrip() {
        let cipher = FeedbackXorCipher;
        let mut key = cipher.derive_key(AUTH_KEY_SEED);
        let plaintext = b"ClientHelloAuth payload with enough bytes to wrap the key schedule \
                          more than once, because it is longer than sixty-four bytes";

        let ciphertext = cipher.encrypt(plaintext, &mut key);
        assert_ne!(&ciphertext[..], &plaintext[..]);
        assert_eq!(ciphertext.len(), plaintext.len());

        let decrypted = cipher.decrypt(&ciphertext, &mut key).unwrap();
        assert_eq!(&decrypted[..], &plaintext[..]);
    }

    #[test]
    fn test_keys_depend_on_seed() {
        let cipher = FeedbackXorCipher;
        let auth = cipher.derive_key(AUTH_KEY_SEED);
        let world = cipher.derive_key(WORLD_KEY_SEED);
        assert_eq!(auth.material().len(), FeedbackXorCipher::KEY_LEN);
        assert_ne!(auth, world);
        assert_eq!(auth, cipher.derive_key(AUTH_KEY_SEED));
    }

    #[test]
    fn test_wrong_key_garbles() {
        let cipher = FeedbackXorCipher;
        let mut auth = cipher.derive_key(AUTH_KEY_SEED);
        let mut world = cipher.derive_key(WORLD_KEY_SEED);

        let ciphertext = cipher.encrypt(b"secret", &mut auth);
        let decrypted = cipher.decrypt(&ciphertext, &mut world).unwrap();
        assert_ne!(&decrypted[..], b"secret");
    }

    #[test]
    fn test_empty_key_rejected() {
        let cipher = FeedbackXorCipher;
        let mut key = KeyState::new(Vec::new());
        assert_eq!(cipher.decrypt(&[1, 2, 3], &mut key), Err(CipherError::EmptyKey));
    }

    #[test]
    fn test_null_cipher_passthrough() {
        let cipher = NullCipher;
        let mut key = cipher.derive_key(0);
        assert_eq!(cipher.encrypt(b"abc", &mut key), b"abc".to_vec());
        assert_eq!(cipher.decrypt(b"abc", &mut key).unwrap(), b"abc".to_vec());
    }

    #[test]
    fn test_seed_selection() {
        let seeds = KeySeeds::default();
        assert_eq!(seeds.for_connection(ConnectionType::Auth), AUTH_KEY_SEED);
        assert_eq!(seeds.for_connection(ConnectionType::World), WORLD_KEY_SEED);
    }
}
