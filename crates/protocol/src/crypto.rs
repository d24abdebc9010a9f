//! Hybrid RSA / AES-GCM encryption for WScp sessions.
//!
//! A [`CryptoContext`] starts out asymmetric: RSA-OAEP with SHA-512, used only
//! for the handshake. Once a 256-bit session key is installed, every
//! [`CryptoContext::encrypt`] and [`CryptoContext::decrypt`] call switches to
//! AES-256-GCM with a random 96-bit nonce prepended to each ciphertext. The
//! `force_asymmetric_*` methods bypass that switch; they exist to protect the
//! session key itself while it is being delivered.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use crate::error::{ProtocolError, Result};

/// Default RSA modulus size in bits.
pub const DEFAULT_KEY_BITS: usize = 4096;

/// Smallest accepted RSA modulus. Below this the handshake response no
/// longer fits under OAEP-SHA-512.
pub const MIN_KEY_BITS: usize = 2048;

/// Largest accepted RSA modulus.
pub const MAX_KEY_BITS: usize = 4096;

/// Size of the AES-256-GCM session key in bytes.
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Size of the AES-GCM nonce prepended to every symmetric ciphertext.
pub const NONCE_SIZE: usize = 12;

/// Size of the AES-GCM authentication tag.
pub const TAG_SIZE: usize = 16;

/// Bytes added to a plaintext by symmetric encryption.
pub const SYMMETRIC_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// SHA-512 output size, used to compute the OAEP plaintext limit.
const OAEP_HASH_SIZE: usize = 64;

/// Installed session key and its AEAD instance.
struct SymmetricState {
    key: Zeroizing<[u8; SYMMETRIC_KEY_SIZE]>,
    cipher: Aes256Gcm,
}

/// Cryptographic state of one side of a session.
///
/// A context either owns a full RSA keypair (created with
/// [`CryptoContext::generate`]) or only a peer's public key (created with
/// [`CryptoContext::import_public_key`]), in which case it can encrypt but
/// not decrypt asymmetrically. Key material is zeroed when the context is
/// dropped.
pub struct CryptoContext {
    private_key: Option<RsaPrivateKey>,
    public_key: RsaPublicKey,
    symmetric: Option<SymmetricState>,
}

impl CryptoContext {
    /// Generates a fresh RSA keypair of the given modulus size.
    pub fn generate(bits: usize) -> Result<Self> {
        if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&bits) {
            return Err(ProtocolError::KeyGeneration(format!(
                "key size must be between {} and {} bits, got {}",
                MIN_KEY_BITS, MAX_KEY_BITS, bits
            )));
        }

        let private_key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| ProtocolError::KeyGeneration(e.to_string()))?;
        let public_key = RsaPublicKey::from(&private_key);

        Ok(Self {
            private_key: Some(private_key),
            public_key,
            symmetric: None,
        })
    }

    /// Builds an encrypt-only context from a DER-encoded (PKIX) public key.
    pub fn import_public_key(der: &[u8]) -> Result<Self> {
        let public_key = RsaPublicKey::from_public_key_der(der)
            .map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()))?;

        let bits = public_key.size() * 8;
        if bits < MIN_KEY_BITS {
            return Err(ProtocolError::InvalidPublicKey(format!(
                "key size of {} bits is below the minimum of {} bits",
                bits, MIN_KEY_BITS
            )));
        }

        Ok(Self {
            private_key: None,
            public_key,
            symmetric: None,
        })
    }

    /// Returns the public key as PKIX DER bytes, for a `Handshake` message.
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        self.public_key
            .to_public_key_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()))
    }

    /// Returns the RSA modulus size in bits.
    pub fn key_bits(&self) -> usize {
        self.public_key.size() * 8
    }

    /// Returns whether this context can decrypt asymmetrically.
    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }

    /// Returns whether a session key is installed.
    pub fn has_symmetric_key(&self) -> bool {
        self.symmetric.is_some()
    }

    /// Largest plaintext accepted by the asymmetric path.
    pub fn max_asymmetric_plaintext(&self) -> usize {
        self.public_key.size().saturating_sub(2 * OAEP_HASH_SIZE + 2)
    }

    /// Generates a random 256-bit session key, installs it and returns it.
    pub fn generate_symmetric_key(&mut self) -> Result<Vec<u8>> {
        let mut key = Zeroizing::new([0u8; SYMMETRIC_KEY_SIZE]);
        OsRng.fill_bytes(key.as_mut());
        self.set_symmetric_key(key.as_ref())?;
        Ok(key.to_vec())
    }

    /// Installs a session key and initializes the AEAD instance.
    ///
    /// A context accepts exactly one session key.
    pub fn set_symmetric_key(&mut self, key: &[u8]) -> Result<()> {
        if self.symmetric.is_some() {
            return Err(ProtocolError::InvalidSymmetricKey(
                "a session key is already installed".to_string(),
            ));
        }
        if key.len() != SYMMETRIC_KEY_SIZE {
            return Err(ProtocolError::InvalidSymmetricKey(format!(
                "expected {} bytes, got {}",
                SYMMETRIC_KEY_SIZE,
                key.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| ProtocolError::InvalidSymmetricKey(e.to_string()))?;
        let mut stored = Zeroizing::new([0u8; SYMMETRIC_KEY_SIZE]);
        stored.copy_from_slice(key);

        self.symmetric = Some(SymmetricState {
            key: stored,
            cipher,
        });
        Ok(())
    }

    /// Hex SHA-256 of the installed session key.
    ///
    /// Lets two peers (or a log line) compare keys without revealing them.
    pub fn symmetric_key_fingerprint(&self) -> Option<String> {
        self.symmetric
            .as_ref()
            .map(|state| hex::encode(Sha256::digest(state.key.as_ref())))
    }

    /// Encrypts with the session key if one is installed, RSA-OAEP otherwise.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        match &self.symmetric {
            Some(state) => Self::symmetric_encrypt(state, plaintext),
            None => self.force_asymmetric_encrypt(plaintext),
        }
    }

    /// Decrypts with the session key if one is installed, RSA-OAEP otherwise.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        match &self.symmetric {
            Some(state) => Self::symmetric_decrypt(state, ciphertext),
            None => self.force_asymmetric_decrypt(ciphertext),
        }
    }

    /// Encrypts with RSA-OAEP (SHA-512) regardless of any installed session key.
    pub fn force_asymmetric_encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let limit = self.max_asymmetric_plaintext();
        if plaintext.len() > limit {
            return Err(ProtocolError::Encryption(format!(
                "plaintext too large for RSA-OAEP: {} bytes exceeds maximum of {} bytes",
                plaintext.len(),
                limit
            )));
        }

        self.public_key
            .encrypt(&mut OsRng, Oaep::new::<Sha512>(), plaintext)
            .map_err(|e| ProtocolError::Encryption(e.to_string()))
    }

    /// Decrypts with RSA-OAEP (SHA-512) regardless of any installed session key.
    pub fn force_asymmetric_decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let private_key = self.private_key.as_ref().ok_or_else(|| {
            ProtocolError::Decryption("context holds no private key".to_string())
        })?;

        private_key
            .decrypt(Oaep::new::<Sha512>(), ciphertext)
            .map_err(|e| ProtocolError::Decryption(e.to_string()))
    }

    fn symmetric_encrypt(state: &SymmetricState, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = state
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| ProtocolError::Encryption(format!("AES-256-GCM: {}", e)))?;

        let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        output.extend_from_slice(&nonce);
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }

    fn symmetric_decrypt(state: &SymmetricState, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < SYMMETRIC_OVERHEAD {
            return Err(ProtocolError::Decryption(format!(
                "ciphertext too short: {} bytes, need at least {}",
                data.len(),
                SYMMETRIC_OVERHEAD
            )));
        }

        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
        state
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| ProtocolError::Decryption(format!("AES-256-GCM: {}", e)))
    }
}

impl std::fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoContext")
            .field("key_bits", &self.key_bits())
            .field("private_key", &self.private_key.as_ref().map(|_| "[REDACTED]"))
            .field("symmetric_key", &self.symmetric.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}
