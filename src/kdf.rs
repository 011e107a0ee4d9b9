use crate::Error;
use crate::crypto::{KEY_SIZE, SymmetricKey, fill_random};
use argon2::{Algorithm, Argon2, Params, Version};
use hmac::Hmac;
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

/// Shortest salt accepted for password derivation.
pub const MIN_SALT_LEN: usize = 16;

/// Fewest PBKDF2-HMAC-SHA256 rounds accepted.
pub const MIN_PBKDF2_ITERATIONS: u32 = 150_000;

/// Smallest Argon2id memory cost accepted, in KiB.
pub const MIN_ARGON2_MEMORY_KIB: u32 = 19 * 1024;

/// Fewest Argon2id passes accepted.
pub const MIN_ARGON2_ITERATIONS: u32 = 2;

/// Most PBKDF2-HMAC-SHA256 rounds accepted from a stored record.
pub const MAX_PBKDF2_ITERATIONS: u32 = 10_000_000;

/// Largest Argon2id memory cost accepted, in KiB.
pub const MAX_ARGON2_MEMORY_KIB: u32 = 1024 * 1024;

/// Most Argon2id passes accepted.
pub const MAX_ARGON2_ITERATIONS: u32 = 16;

/// Most Argon2id lanes accepted.
pub const MAX_ARGON2_PARALLELISM: u32 = 16;

/// Password hashing function used to derive a wrapping key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KdfAlgorithm {
    /// PBKDF2 with HMAC-SHA256.
    Pbkdf2Sha256,
    /// Argon2id, version 0x13.
    Argon2id,
}

/// Cost parameters stored next to the salt in a sealed private key record.
///
/// These are never secret. `memory_kib` and `parallelism` only apply to
/// Argon2id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KdfParams {
    pub algorithm: KdfAlgorithm,
    pub iterations: u32,
    pub memory_kib: u32,
    pub parallelism: u32,
}

impl KdfParams {
    /// PBKDF2-HMAC-SHA256 with the given round count.
    pub fn pbkdf2(iterations: u32) -> Self {
        Self {
            algorithm: KdfAlgorithm::Pbkdf2Sha256,
            iterations,
            memory_kib: 0,
            parallelism: 0,
        }
    }

    /// Argon2id with the given costs.
    pub fn argon2id(memory_kib: u32, iterations: u32, parallelism: u32) -> Self {
        Self {
            algorithm: KdfAlgorithm::Argon2id,
            iterations,
            memory_kib,
            parallelism,
        }
    }

    /// Rejects parameters outside the accepted range, in either direction.
    pub fn validate(&self) -> Result<(), Error> {
        match self.algorithm {
            KdfAlgorithm::Pbkdf2Sha256 => {
                if !(MIN_PBKDF2_ITERATIONS..=MAX_PBKDF2_ITERATIONS).contains(&self.iterations) {
                    return Err(Error::Kdf(format!(
                        "PBKDF2 iterations must be within \
                         {MIN_PBKDF2_ITERATIONS}..={MAX_PBKDF2_ITERATIONS}, got {}",
                        self.iterations
                    )));
                }
            }
            KdfAlgorithm::Argon2id => {
                if self.memory_kib < MIN_ARGON2_MEMORY_KIB
                    || self.iterations < MIN_ARGON2_ITERATIONS
                    || self.parallelism == 0
                {
                    return Err(Error::Kdf("Argon2id parameters are too weak".to_string()));
                }
                if self.memory_kib > MAX_ARGON2_MEMORY_KIB
                    || self.iterations > MAX_ARGON2_ITERATIONS
                    || self.parallelism > MAX_ARGON2_PARALLELISM
                {
                    return Err(Error::Kdf("Argon2id parameters are too costly".to_string()));
                }
            }
        }
        Ok(())
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::pbkdf2(MIN_PBKDF2_ITERATIONS)
    }
}

/// Draws a fresh salt. Never reuse one across accounts.
pub fn random_salt(len: usize) -> Result<Vec<u8>, Error> {
    if len < MIN_SALT_LEN {
        return Err(Error::Kdf(format!(
            "Salt must be at least {MIN_SALT_LEN} bytes"
        )));
    }

    let mut salt = vec![0u8; len];
    fill_random(&mut salt)?;
    Ok(salt)
}

/// Derives a 256-bit wrapping key from a password.
///
/// A pure function of its inputs. This is CPU-bound on purpose; async callers
/// should use [`derive_key_in_background`].
pub fn derive_key(password: &str, salt: &[u8], params: &KdfParams) -> Result<SymmetricKey, Error> {
    if password.is_empty() {
        return Err(Error::Kdf("Password must not be empty".to_string()));
    }
    if salt.len() < MIN_SALT_LEN {
        return Err(Error::Kdf(format!(
            "Salt must be at least {MIN_SALT_LEN} bytes"
        )));
    }
    params.validate()?;

    let mut output = [0u8; KEY_SIZE];
    match params.algorithm {
        KdfAlgorithm::Pbkdf2Sha256 => {
            pbkdf2::pbkdf2::<Hmac<Sha256>>(
                password.as_bytes(),
                salt,
                params.iterations,
                &mut output,
            )
            .map_err(|_| Error::Kdf("PBKDF2 output length rejected".to_string()))?;
        }
        KdfAlgorithm::Argon2id => {
            let argon_params = Params::new(
                params.memory_kib,
                params.iterations,
                params.parallelism,
                Some(KEY_SIZE),
            )
            .map_err(|err| Error::Kdf(err.to_string()))?;

            Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params)
                .hash_password_into(password.as_bytes(), salt, &mut output)
                .map_err(|err| Error::Kdf(err.to_string()))?;
        }
    }

    let key = SymmetricKey::from_bytes(output);
    output.zeroize();
    Ok(key)
}

/// Runs [`derive_key`] on tokio's blocking pool.
pub async fn derive_key_in_background(
    password: Zeroizing<String>,
    salt: Vec<u8>,
    params: KdfParams,
) -> Result<SymmetricKey, Error> {
    tokio::task::spawn_blocking(move || derive_key(&password, &salt, &params))
        .await
        .map_err(|_| Error::Kdf("Background key derivation was aborted".to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let salt = [9u8; 16];
        let params = KdfParams::default();

        let first = derive_key("correct-horse", &salt, &params).unwrap();
        let second = derive_key("correct-horse", &salt, &params).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_salt_and_password_change_the_key() {
        let params = KdfParams::default();
        let base = derive_key("correct-horse", &[1u8; 16], &params).unwrap();

        assert_ne!(base, derive_key("correct-horse", &[2u8; 16], &params).unwrap());
        assert_ne!(base, derive_key("wrong-password", &[1u8; 16], &params).unwrap());
    }

    #[test]
    fn test_rejects_empty_password() {
        let result = derive_key("", &[0u8; 16], &KdfParams::default());
        assert!(matches!(result, Err(Error::Kdf(_))));
    }

    #[test]
    fn test_rejects_short_salt() {
        let result = derive_key("password", &[0u8; 15], &KdfParams::default());
        assert!(matches!(result, Err(Error::Kdf(_))));
        assert!(matches!(random_salt(8), Err(Error::Kdf(_))));
    }

    #[test]
    fn test_rejects_weak_parameters() {
        let weak_pbkdf2 = KdfParams::pbkdf2(1_000);
        assert!(matches!(
            derive_key("password", &[0u8; 16], &weak_pbkdf2),
            Err(Error::Kdf(_))
        ));

        let weak_argon = KdfParams::argon2id(1024, 1, 1);
        assert!(weak_argon.validate().is_err());
        assert!(KdfParams::argon2id(MIN_ARGON2_MEMORY_KIB, 2, 1).validate().is_ok());
    }

    #[test]
    fn test_rejects_inflated_parameters() {
        assert!(KdfParams::pbkdf2(MAX_PBKDF2_ITERATIONS).validate().is_ok());
        assert!(matches!(
            derive_key("password", &[0u8; 16], &KdfParams::pbkdf2(u32::MAX)),
            Err(Error::Kdf(_))
        ));

        let huge_memory = KdfParams::argon2id(u32::MAX / 2, 2, 1);
        assert!(matches!(
            derive_key("password", &[0u8; 16], &huge_memory),
            Err(Error::Kdf(_))
        ));
        assert!(KdfParams::argon2id(MIN_ARGON2_MEMORY_KIB, u32::MAX, 1).validate().is_err());
        assert!(KdfParams::argon2id(MIN_ARGON2_MEMORY_KIB, 2, 255).validate().is_err());
        assert!(KdfParams::argon2id(MAX_ARGON2_MEMORY_KIB, 2, 1).validate().is_ok());
    }

    #[test]
    fn test_argon2id_derivation() {
        let params = KdfParams::argon2id(MIN_ARGON2_MEMORY_KIB, MIN_ARGON2_ITERATIONS, 1);
        let salt = random_salt(16).unwrap();

        let first = derive_key("correct-horse", &salt, &params).unwrap();
        let second = derive_key("correct-horse", &salt, &params).unwrap();
        assert_eq!(first, second);
        assert_ne!(first, derive_key("correct-horse", &salt, &KdfParams::default()).unwrap());
    }

    #[test]
    fn test_random_salts_are_unique() {
        let a = random_salt(16).unwrap();
        let b = random_salt(16).unwrap();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_background_derivation_matches_inline() {
        let salt = vec![3u8; 16];
        let params = KdfParams::default();

        let inline = derive_key("pw", &salt, &params).unwrap();
        let background =
            derive_key_in_background(Zeroizing::new("pw".to_string()), salt, params)
                .await
                .unwrap();
        assert_eq!(inline, background);
    }
}
