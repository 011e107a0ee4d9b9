use crate::kdf::{KdfParams, MIN_SALT_LEN};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Parameters used when sealing a private key. Opening always uses the
    /// parameters stored in the record.
    pub kdf: KdfParams,
    pub salt_len: usize,
    /// Extra attempts after a network failure while fetching history.
    pub history_retries: u32,
    pub retry_delay: Duration,
    /// Whether registration also creates a recovery phrase record.
    pub recovery_phrase: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            kdf: KdfParams::default(),
            salt_len: MIN_SALT_LEN,
            history_retries: 3,
            retry_delay: Duration::from_secs(1),
            recovery_phrase: true,
        }
    }
}
