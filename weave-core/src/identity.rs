//! Node identity and crypto: RSA keypair, public key encoding, hybrid message encryption.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

/// Modulus size used for node keys.
pub const DEFAULT_KEY_BITS: usize = 2048;

const NONCE_LEN: usize = 12;

/// RSA public key plus its SPKI DER encoding (the form sent in handshakes).
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    key: RsaPublicKey,
    der: Vec<u8>,
}

impl PublicKey {
    /// Parse a SPKI DER encoded RSA public key.
    pub fn from_der(der: &[u8]) -> Result<Self, CryptoError> {
        let key = RsaPublicKey::from_public_key_der(der).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(PublicKey {
            key,
            der: der.to_vec(),
        })
    }

    fn from_rsa(key: RsaPublicKey) -> Result<Self, CryptoError> {
        let der = key
            .to_public_key_der()
            .map_err(|_| CryptoError::InvalidPublicKey)?
            .as_bytes()
            .to_vec();
        Ok(PublicKey { key, der })
    }

    pub fn as_der(&self) -> &[u8] {
        &self.der
    }

    /// Size in bytes of an RSA ciphertext under this key.
    pub fn size(&self) -> usize {
        self.key.size()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("bits", &(self.size() * 8))
            .field("der_len", &self.der.len())
            .finish()
    }
}

/// RSA keypair. Keep secret key private; expose only the public key.
pub struct Keypair {
    secret: RsaPrivateKey,
    public: PublicKey,
}

impl Keypair {
    /// Generate a new random keypair with [`DEFAULT_KEY_BITS`].
    pub fn generate() -> Result<Self, CryptoError> {
        Self::generate_with_bits(DEFAULT_KEY_BITS)
    }

    pub fn generate_with_bits(bits: usize) -> Result<Self, CryptoError> {
        let secret = RsaPrivateKey::new(&mut OsRng, bits)?;
        let public = PublicKey::from_rsa(RsaPublicKey::from(&secret))?;
        Ok(Self { secret, public })
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Reverse [`seal`]: unwrap the symmetric key with our private key and decrypt.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let wrapped_len = self.secret.size();
        if sealed.len() < wrapped_len + NONCE_LEN {
            return Err(CryptoError::TooShort {
                min: wrapped_len + NONCE_LEN,
                actual: sealed.len(),
            });
        }
        let (wrapped, rest) = sealed.split_at(wrapped_len);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        let key = self.secret.decrypt(Oaep::new::<Sha256>(), wrapped)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::Key)?;
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Hybrid encryption to `recipient`.
///
/// Output: `rsa_oaep(key) || nonce (12 bytes) || aes_gcm(plaintext)`.
/// The AES-256 key is the SHA-256 of the plaintext itself.
pub fn seal(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let key: [u8; 32] = Sha256::digest(plaintext).into();
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::Key)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    let wrapped = recipient
        .key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &key)?;
    debug_assert_eq!(wrapped.len(), recipient.size());

    let mut out = Vec::with_capacity(wrapped.len() + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&wrapped);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("rsa: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("invalid public key encoding")]
    InvalidPublicKey,
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("ciphertext too short: need at least {min} bytes, got {actual}")]
    TooShort { min: usize, actual: usize },
}
