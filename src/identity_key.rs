use crate::crypto::{X25519PublicKey, X25519Secret, generate_random_seed};
use crate::Error;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use std::fmt;
use x25519_dalek::SharedSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

const DH_KEY_INFO: &[u8] = b"chatlock-identity-x25519-v1";
const SIGNING_KEY_INFO: &[u8] = b"chatlock-identity-ed25519-v1";

/// Long-term identity of one account.
///
/// Both halves are expanded from a single 32-byte seed with HKDF-SHA256 under
/// distinct info strings: an X25519 key that receives wrapped conversation
/// keys, and an Ed25519 key that proves possession of the identity (used when
/// resetting a password from the recovery phrase).
///
/// The seed is what gets exported, sealed and stored. It never leaves the
/// client unencrypted.
pub struct IdentityKeyPair {
    seed: Box<[u8; 32]>,
    signing_key: Box<SigningKey>,
    dh_key: X25519Secret,
}

impl IdentityKeyPair {
    /// Creates a fresh identity from the OS CSPRNG.
    pub fn generate() -> Result<Self, Error> {
        let seed = generate_random_seed()
            .map_err(|_| Error::KeyGeneration("Random source unavailable".to_string()))?;
        Self::from_seed(seed)
    }

    fn from_seed(seed: Box<[u8; 32]>) -> Result<Self, Error> {
        let hkdf = Hkdf::<Sha256>::new(None, seed.as_slice());

        let mut dh_bytes = Box::new([0u8; 32]);
        hkdf.expand(DH_KEY_INFO, dh_bytes.as_mut_slice())
            .map_err(|_| Error::KeyGeneration("HKDF expansion failed".to_string()))?;

        let mut signing_bytes = Box::new([0u8; 32]);
        hkdf.expand(SIGNING_KEY_INFO, signing_bytes.as_mut_slice())
            .map_err(|_| Error::KeyGeneration("HKDF expansion failed".to_string()))?;
        let signing_key = Box::new(SigningKey::from_bytes(&signing_bytes));
        signing_bytes.zeroize();

        Ok(Self {
            seed,
            signing_key,
            dh_key: X25519Secret::from(dh_bytes),
        })
    }

    /// Returns the shareable half of this identity.
    pub fn public_key(&self) -> IdentityPublicKey {
        IdentityPublicKey {
            dh_key: self.dh_key.public_key(),
            signing_key: self.signing_key.verifying_key(),
        }
    }

    /// Signs a message with the Ed25519 identity key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Key agreement against another party's X25519 key.
    pub(crate) fn dh(&self, public_key: &X25519PublicKey) -> Result<SharedSecret, Error> {
        self.dh_key.dh(public_key)
    }

    /// Exports the private half. Treat the result as secret.
    pub fn export_private(&self) -> ExportedPrivateKey {
        ExportedPrivateKey(self.seed.clone())
    }

    /// Rebuilds an identity from its exported private half.
    pub fn import_private(exported: &ExportedPrivateKey) -> Result<Self, Error> {
        Self::from_seed(exported.0.clone())
    }
}

impl Zeroize for IdentityKeyPair {
    fn zeroize(&mut self) {
        self.seed.zeroize();
    }
}

impl Drop for IdentityKeyPair {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("fingerprint", &self.public_key().fingerprint())
            .finish_non_exhaustive()
    }
}

/// Serialized private half of an identity.
///
/// Encoded with [`ExportedPrivateKey::to_bytes`] before it is sealed by the
/// vault; zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ExportedPrivateKey(pub(crate) Box<[u8; 32]>);

impl fmt::Debug for ExportedPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExportedPrivateKey(***)")
    }
}

/// Public half of an identity: the X25519 key used to wrap conversation keys
/// for this account, and the Ed25519 key that verifies its signatures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdentityPublicKey {
    pub(crate) dh_key: X25519PublicKey,
    pub(crate) signing_key: VerifyingKey,
}

impl IdentityPublicKey {
    /// Assembles a public identity from its two raw keys.
    pub fn new(dh_key: X25519PublicKey, signing_key: VerifyingKey) -> Self {
        Self {
            dh_key,
            signing_key,
        }
    }

    /// Returns the X25519 encryption key.
    pub fn dh_key(&self) -> X25519PublicKey {
        self.dh_key
    }

    /// Returns the Ed25519 verification key.
    pub fn signing_key(&self) -> VerifyingKey {
        self.signing_key
    }

    /// Verifies a signature made with [`IdentityKeyPair::sign`].
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), Error> {
        self.signing_key
            .verify_strict(message, signature)
            .map_err(|_| Error::Protocol("Invalid identity signature".to_string()))
    }

    /// Short, loggable identifier of this public identity.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.dh_key.as_bytes());
        hasher.update(self.signing_key.as_bytes());
        URL_SAFE_NO_PAD.encode(&hasher.finalize()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation_key::{unwrap, wrap_for_participant};
    use crate::{ConversationId, SymmetricKey};

    #[test]
    fn test_generated_identities_differ() {
        let a = IdentityKeyPair::generate().unwrap();
        let b = IdentityKeyPair::generate().unwrap();

        assert_ne!(a.public_key(), b.public_key());
        assert_ne!(a.export_private(), b.export_private());
    }

    #[test]
    fn test_signing_and_verification() {
        let identity = IdentityKeyPair::generate().unwrap();
        let message = b"This is a test message";

        let signature = identity.sign(message);
        assert!(identity.public_key().verify(message, &signature).is_ok());
        assert!(
            identity
                .public_key()
                .verify(b"This is a modified message", &signature)
                .is_err()
        );
    }

    #[test]
    fn test_private_export_import_reproduces_identity() {
        let original = IdentityKeyPair::generate().unwrap();
        let restored = IdentityKeyPair::import_private(&original.export_private()).unwrap();

        assert_eq!(original.public_key(), restored.public_key());
    }

    #[test]
    fn test_reimported_public_key_wraps_for_original_private_key() {
        let identity = IdentityKeyPair::generate().unwrap();
        let exported = identity.public_key().to_base64();
        let reimported = IdentityPublicKey::from_base64(&exported).unwrap();

        let conversation = ConversationId::from("c-1");
        let key = SymmetricKey::generate().unwrap();
        let wrapped = wrap_for_participant(&key, &conversation, &reimported).unwrap();

        assert_eq!(unwrap(&wrapped, &identity).unwrap(), key);
    }

    #[test]
    fn test_debug_hides_private_material() {
        let identity = IdentityKeyPair::generate().unwrap();
        let debug = format!("{identity:?} {:?}", identity.export_private());

        assert!(debug.contains(&identity.public_key().fingerprint()));
        assert!(debug.contains("ExportedPrivateKey(***)"));
    }
}
