/// Errors that can occur while managing chat key material.
///
/// Cryptographic failures that could tell an attacker *why* an unlock failed
/// are collapsed into [`Error::Decryption`], which carries no detail.
#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// The random source or key algorithm was unavailable.
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// Password-based key derivation rejected its input.
    #[error("Key derivation failed: {0}")]
    Kdf(String),

    /// Wrong password, tampered record, wrong key or corrupted ciphertext.
    #[error("Could not unlock encrypted data")]
    Decryption,

    /// A wrapped conversation key could not be recovered.
    #[error("Conversation key unavailable: {0}")]
    Unwrap(String),

    /// The conversation key has not been loaded yet.
    #[error("Conversation key is not ready")]
    KeyNotReady,

    /// Transport failure while talking to the key server. Retryable.
    #[error("Network failure: {0}")]
    Network(String),

    /// The key server refused the request.
    #[error("Server rejected request: {0}")]
    Server(String),

    /// The recovery phrase is not a valid 24-word phrase.
    #[error("Invalid recovery phrase")]
    RecoveryPhrase,

    /// A protocol rule was violated.
    #[error("Protocol Violation: {0}")]
    Protocol(String),

    /// Random number generation failed.
    #[error("Random number generation failed")]
    Random,

    /// Serialization or deserialization failed.
    #[error("Serialization/deserialization failed: {0}")]
    Serde(String),
}

impl Error {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl From<aes_gcm_siv::Error> for Error {
    fn from(_: aes_gcm_siv::Error) -> Self {
        Self::Decryption
    }
}

impl From<prost::DecodeError> for Error {
    fn from(value: prost::DecodeError) -> Self {
        Self::Serde(value.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(value: base64::DecodeError) -> Self {
        Self::Serde(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decryption_error_reveals_nothing() {
        let err = Error::from(aes_gcm_siv::Error);
        assert_eq!(err, Error::Decryption);
        assert_eq!(err.to_string(), "Could not unlock encrypted data");
    }

    #[test]
    fn test_only_network_errors_are_retryable() {
        assert!(Error::Network("connection reset".to_string()).is_retryable());
        assert!(!Error::Server("username taken".to_string()).is_retryable());
        assert!(!Error::Decryption.is_retryable());
        assert!(!Error::KeyNotReady.is_retryable());
    }
}
