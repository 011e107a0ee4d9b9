use crate::conversation_key::{ConversationId, ParticipantKey, WrappedConversationKey};
use crate::message::EncryptedMessage;
use crate::vault::WrappedPrivateKey;
use crate::{Error, IdentityKeyPair, IdentityPublicKey};
use async_trait::async_trait;
use ed25519_dalek::Signature;
use sha2::{Digest, Sha256};
use std::fmt;
use tokio::sync::broadcast;
use zeroize::Zeroizing;

pub mod memory;

const RESET_CONTEXT: &[u8] = b"chatlock-credential-reset-v1";

/// Bearer token returned by [`KeyServer::authenticate`].
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(***)")
    }
}

/// Key material the server stores for an account. All of it is public or
/// sealed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountKeys {
    pub public_key: IdentityPublicKey,
    pub wrapped_private_key: WrappedPrivateKey,
    /// The same private key sealed under the recovery phrase.
    pub recovery: Option<WrappedPrivateKey>,
}

/// What an unauthenticated client may fetch to recover an account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveryRecord {
    pub public_key: IdentityPublicKey,
    pub wrapped_private_key: WrappedPrivateKey,
    /// Number of resets accepted so far. The next reset must sign this value.
    pub reset_counter: u64,
}

/// A password reset authorized by the identity key instead of the old
/// password.
pub struct CredentialReset {
    pub username: String,
    pub new_password: Zeroizing<String>,
    pub wrapped_private_key: WrappedPrivateKey,
    /// The account's [`RecoveryRecord::reset_counter`] at signing time.
    pub reset_counter: u64,
    /// Signature over [`CredentialReset::signed_payload`].
    pub signature: Signature,
}

impl CredentialReset {
    /// Bytes the identity signs.
    ///
    /// Covers the username, the reset counter, a digest of the new password
    /// and the newly sealed record. A signed reset is therefore good for one
    /// password and one use.
    pub fn signed_payload(
        username: &str,
        new_password: &str,
        reset_counter: u64,
        wrapped_private_key: &WrappedPrivateKey,
    ) -> Vec<u8> {
        let password_digest = Sha256::new()
            .chain_update(RESET_CONTEXT)
            .chain_update(username.as_bytes())
            .chain_update(new_password.as_bytes())
            .finalize();
        let record = wrapped_private_key.to_bytes();

        let mut payload = Vec::with_capacity(
            RESET_CONTEXT.len() + 16 + username.len() + password_digest.len() + record.len(),
        );
        payload.extend_from_slice(RESET_CONTEXT);
        payload.extend_from_slice(&(username.len() as u32).to_be_bytes());
        payload.extend_from_slice(username.as_bytes());
        payload.extend_from_slice(&reset_counter.to_be_bytes());
        payload.extend_from_slice(&password_digest);
        payload.extend_from_slice(&(record.len() as u32).to_be_bytes());
        payload.extend_from_slice(&record);
        payload
    }

    /// Signs a reset for `username` with the account identity.
    pub fn sign(
        identity: &IdentityKeyPair,
        username: &str,
        new_password: &str,
        reset_counter: u64,
        wrapped_private_key: WrappedPrivateKey,
    ) -> Self {
        let signature = identity.sign(&Self::signed_payload(
            username,
            new_password,
            reset_counter,
            &wrapped_private_key,
        ));
        Self {
            username: username.to_string(),
            new_password: Zeroizing::new(new_password.to_string()),
            wrapped_private_key,
            reset_counter,
            signature,
        }
    }

    /// Checks the signature against the account's public key.
    pub fn verify(&self, public_key: &IdentityPublicKey) -> Result<(), Error> {
        let payload = Self::signed_payload(
            &self.username,
            &self.new_password,
            self.reset_counter,
            &self.wrapped_private_key,
        );
        public_key.verify(&payload, &self.signature)
    }
}

impl fmt::Debug for CredentialReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialReset")
            .field("username", &self.username)
            .field("wrapped_private_key", &self.wrapped_private_key)
            .field("reset_counter", &self.reset_counter)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub participants: Vec<String>,
}

/// The backend holding accounts, wrapped keys and ciphertext.
///
/// It never sees a private key, a conversation key or a plaintext. Transport
/// failures are reported as [`Error::Network`]; refusals as
/// [`Error::Server`].
#[async_trait]
pub trait KeyServer: Send + Sync {
    async fn register(&self, username: &str, password: &str, keys: AccountKeys)
    -> Result<(), Error>;

    async fn authenticate(&self, username: &str, password: &str) -> Result<AuthToken, Error>;

    async fn fetch_account_keys(&self, token: &AuthToken) -> Result<AccountKeys, Error>;

    async fn fetch_public_key(
        &self,
        token: &AuthToken,
        username: &str,
    ) -> Result<IdentityPublicKey, Error>;

    async fn fetch_recovery_record(&self, username: &str) -> Result<RecoveryRecord, Error>;

    /// Replaces the password and the sealed private key. The server checks
    /// the signature against the account's public key and accepts each
    /// reset counter once.
    async fn reset_credentials(&self, reset: CredentialReset) -> Result<(), Error>;

    /// Stores one wrapped key per participant. Participants are the
    /// usernames of `keys`.
    async fn create_conversation(
        &self,
        token: &AuthToken,
        conversation_id: &ConversationId,
        keys: Vec<ParticipantKey>,
    ) -> Result<(), Error>;

    async fn list_conversations(&self, token: &AuthToken)
    -> Result<Vec<ConversationSummary>, Error>;

    /// The caller's own wrapped copy.
    async fn fetch_conversation_key(
        &self,
        token: &AuthToken,
        conversation_id: &ConversationId,
    ) -> Result<WrappedConversationKey, Error>;

    /// Stored messages, oldest first.
    async fn fetch_history(
        &self,
        token: &AuthToken,
        conversation_id: &ConversationId,
    ) -> Result<Vec<EncryptedMessage>, Error>;

    async fn send_message(
        &self,
        token: &AuthToken,
        conversation_id: &ConversationId,
        message: EncryptedMessage,
    ) -> Result<(), Error>;

    /// Push channel of messages sent to the conversation from now on.
    async fn subscribe(
        &self,
        token: &AuthToken,
        conversation_id: &ConversationId,
    ) -> Result<broadcast::Receiver<EncryptedMessage>, Error>;
}
