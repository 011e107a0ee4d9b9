use crate::crypto::{Iv, SymmetricKey, aead_open, aead_seal};
use crate::kdf::{KdfAlgorithm, KdfParams, derive_key, random_salt};
use crate::proto::WIRE_VERSION;
use crate::{Error, ExportedPrivateKey, IdentityKeyPair};
use zeroize::Zeroizing;

const VAULT_CONTEXT: &[u8] = b"chatlock-private-key-vault";

/// A private key sealed under a password-derived key.
///
/// This is what the server stores for an account. Without the password it is
/// opaque: the KDF parameters and salt are public, the ciphertext is not.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WrappedPrivateKey {
    /// Parameters the wrapping key was derived with.
    pub kdf: KdfParams,
    /// Per-account random salt.
    pub salt: Vec<u8>,
    /// Fresh 96-bit nonce of this sealing.
    pub iv: Iv,
    /// AEAD ciphertext of the exported private key.
    pub ciphertext: Vec<u8>,
}

impl WrappedPrivateKey {
    /// Checks the stored KDF parameters before any derivation runs.
    ///
    /// Parameters out of range mean the record was tampered with, which is
    /// reported like any other failed unlock.
    pub fn check_kdf(&self) -> Result<(), Error> {
        self.kdf.validate().map_err(|err| {
            tracing::warn!(%err, "sealed private key carries out-of-range KDF parameters");
            Error::Decryption
        })
    }
}

/// Associated data binding the record version, KDF parameters and salt.
///
/// A server that rewrites the stored parameters to weaker ones makes the
/// record fail to open instead of silently downgrading it.
fn associated_data(kdf: &KdfParams, salt: &[u8]) -> Vec<u8> {
    let algorithm: u8 = match kdf.algorithm {
        KdfAlgorithm::Pbkdf2Sha256 => 1,
        KdfAlgorithm::Argon2id => 2,
    };

    let mut aad = Vec::with_capacity(VAULT_CONTEXT.len() + 17 + salt.len());
    aad.extend_from_slice(VAULT_CONTEXT);
    aad.extend_from_slice(&WIRE_VERSION.to_be_bytes());
    aad.push(algorithm);
    aad.extend_from_slice(&kdf.iterations.to_be_bytes());
    aad.extend_from_slice(&kdf.memory_kib.to_be_bytes());
    aad.extend_from_slice(&kdf.parallelism.to_be_bytes());
    aad.extend_from_slice(salt);
    aad
}

/// Seals a private key under `wrapping_key`.
///
/// Draws a new IV on every call.
pub fn seal(
    identity: &IdentityKeyPair,
    wrapping_key: &SymmetricKey,
    kdf: KdfParams,
    salt: Vec<u8>,
) -> Result<WrappedPrivateKey, Error> {
    let plaintext = identity.export_private().to_bytes();
    let (iv, ciphertext) = aead_seal(wrapping_key, &plaintext, &associated_data(&kdf, &salt))?;

    Ok(WrappedPrivateKey {
        kdf,
        salt,
        iv,
        ciphertext,
    })
}

/// Opens a sealed private key.
///
/// A wrong password, a tampered record and a corrupted ciphertext all yield
/// the same [`Error::Decryption`].
pub fn open(
    record: &WrappedPrivateKey,
    wrapping_key: &SymmetricKey,
) -> Result<IdentityKeyPair, Error> {
    let plaintext = Zeroizing::new(aead_open(
        wrapping_key,
        &record.iv,
        &record.ciphertext,
        &associated_data(&record.kdf, &record.salt),
    )?);

    let exported =
        ExportedPrivateKey::from_bytes(&plaintext).map_err(|_| Error::Decryption)?;
    IdentityKeyPair::import_private(&exported).map_err(|_| Error::Decryption)
}

/// Derives a wrapping key from `password` with a fresh salt and seals.
pub fn seal_with_password(
    identity: &IdentityKeyPair,
    password: &str,
    kdf: KdfParams,
    salt_len: usize,
) -> Result<WrappedPrivateKey, Error> {
    let salt = random_salt(salt_len)?;
    let wrapping_key = derive_key(password, &salt, &kdf)?;
    seal(identity, &wrapping_key, kdf, salt)
}

/// Re-derives the wrapping key from `password` and the stored salt, then opens.
pub fn open_with_password(
    record: &WrappedPrivateKey,
    password: &str,
) -> Result<IdentityKeyPair, Error> {
    record.check_kdf()?;
    let wrapping_key = derive_key(password, &record.salt, &record.kdf)?;
    open(record, &wrapping_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::MIN_SALT_LEN;
    use std::collections::HashSet;

    fn sealed_fixture() -> (IdentityKeyPair, SymmetricKey, WrappedPrivateKey) {
        let identity = IdentityKeyPair::generate().unwrap();
        let key = SymmetricKey::generate().unwrap();
        let record = seal(&identity, &key, KdfParams::default(), vec![5u8; 16]).unwrap();
        (identity, key, record)
    }

    #[test]
    fn test_seal_open_round_trip() {
        let (identity, key, record) = sealed_fixture();

        let opened = open(&record, &key).unwrap();
        assert_eq!(opened.public_key(), identity.public_key());
    }

    #[test]
    fn test_wrong_key_is_a_decryption_error() {
        let (_, _, record) = sealed_fixture();
        let other = SymmetricKey::generate().unwrap();

        assert_eq!(open(&record, &other).unwrap_err(), Error::Decryption);
    }

    #[test]
    fn test_password_round_trip_and_wrong_password() {
        let identity = IdentityKeyPair::generate().unwrap();
        let record =
            seal_with_password(&identity, "correct-horse", KdfParams::default(), MIN_SALT_LEN)
                .unwrap();

        let opened = open_with_password(&record, "correct-horse").unwrap();
        assert_eq!(opened.public_key(), identity.public_key());

        assert_eq!(
            open_with_password(&record, "wrong-password").unwrap_err(),
            Error::Decryption
        );
    }

    #[test]
    fn test_every_seal_uses_a_new_iv() {
        let identity = IdentityKeyPair::generate().unwrap();
        let key = SymmetricKey::generate().unwrap();

        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let record = seal(&identity, &key, KdfParams::default(), vec![0u8; 16]).unwrap();
            assert!(seen.insert(record.iv));
        }
    }

    #[test]
    fn test_any_flipped_bit_fails_authentication() {
        let (_, key, record) = sealed_fixture();

        for byte in 0..record.ciphertext.len() {
            for bit in 0..8 {
                let mut tampered = record.clone();
                tampered.ciphertext[byte] ^= 1 << bit;
                assert_eq!(open(&tampered, &key).unwrap_err(), Error::Decryption);
            }
        }

        for byte in 0..12 {
            for bit in 0..8 {
                let mut iv = *record.iv.as_bytes();
                iv[byte] ^= 1 << bit;
                let mut tampered = record.clone();
                tampered.iv = Iv::from(iv);
                assert_eq!(open(&tampered, &key).unwrap_err(), Error::Decryption);
            }
        }
    }

    #[test]
    fn test_rewritten_kdf_parameters_fail_to_open() {
        let (_, key, record) = sealed_fixture();

        let mut downgraded = record.clone();
        downgraded.kdf = KdfParams::pbkdf2(1);
        assert_eq!(open(&downgraded, &key).unwrap_err(), Error::Decryption);

        let mut resalted = record;
        resalted.salt = vec![6u8; 16];
        assert_eq!(open(&resalted, &key).unwrap_err(), Error::Decryption);
    }

    #[test]
    fn test_inflated_kdf_costs_fail_before_derivation() {
        let identity = IdentityKeyPair::generate().unwrap();
        let record =
            seal_with_password(&identity, "correct-horse", KdfParams::default(), MIN_SALT_LEN)
                .unwrap();

        for inflated in [
            KdfParams::argon2id(u32::MAX / 2, 2, 1),
            KdfParams::pbkdf2(u32::MAX),
        ] {
            let mut tampered = record.clone();
            tampered.kdf = inflated;
            let stored = WrappedPrivateKey::from_bytes(&tampered.to_bytes()).unwrap();

            assert_eq!(
                open_with_password(&stored, "correct-horse").unwrap_err(),
                Error::Decryption
            );
        }
    }
}
