//! Authenticated-encryption primitives.
//!
//! Thin, stateless wrappers over NaCl-compatible constructions: `box`
//! (X25519 + XSalsa20-Poly1305) for key wrapping, `secretbox`
//! (XSalsa20-Poly1305) for payloads, SHA-512 for hashing, and the OS CSPRNG.
//! Every `open` failure is reported as `CryptoError::AuthenticationFailure`;
//! no function ever hands back partially decrypted bytes.

use base64::Engine;
use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::Aead;
use crypto_box::SalsaBox;
use crypto_secretbox::aead::KeyInit;
use crypto_secretbox::XSalsa20Poly1305;
use rand::rngs::OsRng;
use rand::TryRngCore;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

pub const KEY_SIZE: usize = veilbox_shared::constants::KEY_LENGTH;
pub const NONCE_SIZE: usize = veilbox_shared::constants::NONCE_LENGTH;
/// Poly1305 tag appended by both box and secretbox.
pub const MAC_SIZE: usize = 16;
pub const DIGEST_SIZE: usize = 64;

pub type Nonce = [u8; NONCE_SIZE];
pub type Digest512 = [u8; DIGEST_SIZE];

/// An X25519 public key. Freely shareable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "public key must be {KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::InvalidKey(format!("public key base64: {e}")))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// X25519 ignores bit 255, so two encodings map to one point. Keys we
    /// generate always have it clear.
    pub fn is_canonical(&self) -> bool {
        self.0[KEY_SIZE - 1] & 0x80 == 0
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

/// An X25519 private key, wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    bytes: [u8; KEY_SIZE],
}

impl SecretKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "private key must be {KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self { bytes: arr })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl PartialEq for SecretKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes.ct_eq(&other.bytes).into()
    }
}

impl Eq for SecretKey {}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A long-term or ephemeral X25519 keypair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyPair {
    pub public: PublicKey,
    pub secret: SecretKey,
}

impl KeyPair {
    /// Generate a keypair from the OS CSPRNG.
    pub fn generate() -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(random_array::<KEY_SIZE>()?);
        let secret = SecretKey::from_bytes(*bytes);
        let public = derive_public_key(&secret);
        Ok(Self { public, secret })
    }

    /// Rebuild a keypair from a stored private key.
    pub fn from_secret(secret: SecretKey) -> Self {
        let public = derive_public_key(&secret);
        Self { public, secret }
    }
}

/// A 32-byte symmetric key used for exactly one payload.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ContentKey {
    bytes: [u8; KEY_SIZE],
}

impl ContentKey {
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self {
            bytes: random_array::<KEY_SIZE>()?,
        })
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("content key must be 32 bytes".into()))?;
        Ok(Self { bytes: arr })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Recompute the X25519 public key for a private key.
pub fn derive_public_key(secret: &SecretKey) -> PublicKey {
    let static_secret = x25519_dalek::StaticSecret::from(*secret.as_bytes());
    PublicKey(x25519_dalek::PublicKey::from(&static_secret).to_bytes())
}

/// Asymmetric box: seal `plaintext` to `recipient` using `sender`'s private key.
pub fn seal(
    plaintext: &[u8],
    nonce: &Nonce,
    recipient: &PublicKey,
    sender: &SecretKey,
) -> Result<Vec<u8>, CryptoError> {
    let salsa_box = salsa_box(recipient, sender);
    salsa_box
        .encrypt(GenericArray::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::InvalidKey("box seal rejected input".into()))
}

/// Asymmetric box: open `ciphertext` from `sender` using `recipient`'s private key.
pub fn open(
    ciphertext: &[u8],
    nonce: &Nonce,
    sender: &PublicKey,
    recipient: &SecretKey,
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < MAC_SIZE {
        return Err(CryptoError::AuthenticationFailure);
    }
    let salsa_box = salsa_box(sender, recipient);
    salsa_box
        .decrypt(GenericArray::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailure)
}

/// Secretbox: seal `plaintext` under a symmetric key.
pub fn symmetric_seal(
    plaintext: &[u8],
    nonce: &Nonce,
    key: &ContentKey,
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XSalsa20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    cipher
        .encrypt(GenericArray::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::InvalidKey("secretbox seal rejected input".into()))
}

/// Secretbox: open `ciphertext` under a symmetric key.
pub fn symmetric_open(
    ciphertext: &[u8],
    nonce: &Nonce,
    key: &ContentKey,
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < MAC_SIZE {
        return Err(CryptoError::AuthenticationFailure);
    }
    let cipher = XSalsa20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    cipher
        .decrypt(GenericArray::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailure)
}

/// SHA-512 digest.
pub fn hash(bytes: &[u8]) -> Digest512 {
    let mut out = [0u8; DIGEST_SIZE];
    out.copy_from_slice(&Sha512::digest(bytes));
    out
}

/// `n` bytes from the OS CSPRNG.
pub fn random_bytes(n: usize) -> Result<Vec<u8>, CryptoError> {
    let mut buf = vec![0u8; n];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| CryptoError::EntropyUnavailable(e.to_string()))?;
    Ok(buf)
}

/// Fixed-size variant of [`random_bytes`].
pub fn random_array<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut buf = [0u8; N];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| CryptoError::EntropyUnavailable(e.to_string()))?;
    Ok(buf)
}

pub fn random_nonce() -> Result<Nonce, CryptoError> {
    random_array::<NONCE_SIZE>()
}

fn salsa_box(public: &PublicKey, secret: &SecretKey) -> SalsaBox {
    let public = crypto_box::PublicKey::from(*public.as_bytes());
    let secret = crypto_box::SecretKey::from(*secret.as_bytes());
    SalsaBox::new(&public, &secret)
}
