use crate::Error;
use aes_gcm_siv::aead::{Aead, Payload};
use aes_gcm_siv::{Aes256GcmSiv, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::TryRngCore;
use rand::rngs::OsRng;
use std::fmt;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of symmetric keys in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Size of AEAD nonces in bytes (96 bits).
pub const IV_SIZE: usize = 12;

/// Fills a buffer from the operating system CSPRNG.
pub(crate) fn fill_random(buf: &mut [u8]) -> Result<(), Error> {
    OsRng.try_fill_bytes(buf).map_err(|_| Error::Random)
}

/// Generates a cryptographically secure random 32-byte seed.
pub(crate) fn generate_random_seed() -> Result<Box<[u8; 32]>, Error> {
    let mut seed = Box::new([0u8; 32]);
    fill_random(seed.as_mut_slice())?;
    Ok(seed)
}

/// A 256-bit symmetric key.
///
/// Used both for password-derived wrapping keys and for conversation keys.
/// The bytes are zeroized on drop, hidden from `Debug` and compared in
/// constant time.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey(Box<[u8; KEY_SIZE]>);

impl SymmetricKey {
    /// Generates a fresh random key.
    pub fn generate() -> Result<Self, Error> {
        Ok(Self(generate_random_seed()?))
    }

    /// Wraps raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(Box::new(bytes))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    fn cipher(&self) -> Aes256GcmSiv {
        Aes256GcmSiv::new(self.0.as_slice().into())
    }
}

impl PartialEq for SymmetricKey {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.0.as_slice().ct_eq(other.0.as_slice()))
    }
}

impl Eq for SymmetricKey {}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(***)")
    }
}

/// A 96-bit AEAD nonce. A new one is drawn for every encryption.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Iv([u8; IV_SIZE]);

impl Iv {
    /// Draws a random IV from the OS CSPRNG.
    pub fn random() -> Result<Self, Error> {
        let mut bytes = [0u8; IV_SIZE];
        fill_random(&mut bytes)?;
        Ok(Self(bytes))
    }

    /// Returns the raw IV bytes.
    pub fn as_bytes(&self) -> &[u8; IV_SIZE] {
        &self.0
    }

    /// Encodes the IV as standard base64.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Decodes a base64 IV.
    pub fn from_base64(encoded: &str) -> Result<Self, Error> {
        let bytes = STANDARD.decode(encoded)?;
        Self::try_from(bytes.as_slice())
    }
}

impl From<[u8; IV_SIZE]> for Iv {
    fn from(bytes: [u8; IV_SIZE]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for Iv {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; IV_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::Serde(format!("IV must be {IV_SIZE} bytes")))?;
        Ok(Self(bytes))
    }
}

/// Encrypts `plaintext` under `key` with a fresh random IV.
pub(crate) fn aead_seal(
    key: &SymmetricKey,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<(Iv, Vec<u8>), Error> {
    let iv = Iv::random()?;
    let ciphertext = key
        .cipher()
        .encrypt(
            Nonce::from_slice(iv.as_bytes()),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| Error::Protocol("AEAD encryption failed".to_string()))?;

    Ok((iv, ciphertext))
}

/// Decrypts and authenticates. Every failure is [`Error::Decryption`].
pub(crate) fn aead_open(
    key: &SymmetricKey,
    iv: &Iv,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, Error> {
    let plaintext = key.cipher().decrypt(
        Nonce::from_slice(iv.as_bytes()),
        Payload {
            msg: ciphertext,
            aad,
        },
    )?;

    Ok(plaintext)
}

/// An X25519 public key used as the encryption half of an identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct X25519PublicKey(PublicKey);

impl X25519PublicKey {
    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Returns a copy of the raw key bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }
}

impl From<[u8; 32]> for X25519PublicKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(PublicKey::from(bytes))
    }
}

/// An X25519 static secret. Zeroized on drop by `x25519-dalek`.
pub(crate) struct X25519Secret(StaticSecret);

impl X25519Secret {
    /// Diffie-Hellman that refuses low-order peer keys.
    pub(crate) fn dh(&self, public_key: &X25519PublicKey) -> Result<SharedSecret, Error> {
        let shared = self.0.diffie_hellman(&public_key.0);
        if !shared.was_contributory() {
            return Err(Error::Protocol("Non-contributory key agreement".to_string()));
        }
        Ok(shared)
    }

    pub(crate) fn public_key(&self) -> X25519PublicKey {
        X25519PublicKey(PublicKey::from(&self.0))
    }
}

impl From<Box<[u8; 32]>> for X25519Secret {
    fn from(mut bytes: Box<[u8; 32]>) -> Self {
        let secret = StaticSecret::from(*bytes);
        bytes.zeroize();
        Self(secret)
    }
}
