use crate::conversation_key::{
    self, ConversationId, WrappedConversationKey, create_conversation_key,
    wrap_for_participants,
};
use crate::kdf::{KdfParams, derive_key_in_background, random_salt};
use crate::key_cache::{LoadOutcome, LoadStart, SessionKeyCache};
use crate::message::{DecryptedMessage, EncryptedMessage, now_millis};
use crate::server::{AccountKeys, AuthToken, ConversationSummary, CredentialReset, KeyServer};
use crate::vault::{self, WrappedPrivateKey};
use crate::{
    Error, IdentityKeyPair, IdentityPublicKey, RecoveryPhrase, SessionConfig, SymmetricKey,
};
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use zeroize::Zeroizing;

/// Derives the wrapping key off the async runtime.
async fn password_key(
    password: &str,
    salt: Vec<u8>,
    params: KdfParams,
) -> Result<SymmetricKey, Error> {
    derive_key_in_background(Zeroizing::new(password.to_string()), salt, params).await
}

async fn seal_identity(
    identity: &IdentityKeyPair,
    password: &str,
    config: &SessionConfig,
) -> Result<WrappedPrivateKey, Error> {
    let salt = random_salt(config.salt_len)?;
    let key = password_key(password, salt.clone(), config.kdf).await?;
    vault::seal(identity, &key, config.kdf, salt)
}

async fn open_identity(
    record: &WrappedPrivateKey,
    password: &str,
    expected: &IdentityPublicKey,
) -> Result<IdentityKeyPair, Error> {
    record.check_kdf()?;
    let key = password_key(password, record.salt.clone(), record.kdf).await?;
    let identity = vault::open(record, &key)?;

    if identity.public_key() != *expected {
        return Err(Error::Protocol(
            "Sealed private key does not match the published public key".to_string(),
        ));
    }
    Ok(identity)
}

/// An authenticated user with an unlocked identity.
///
/// Holds the private key and loaded conversation keys in memory only.
/// [`Session::logout`] or dropping the session wipes them.
pub struct Session<S: KeyServer> {
    server: Arc<S>,
    config: SessionConfig,
    username: String,
    token: AuthToken,
    identity: IdentityKeyPair,
    keys: Arc<SessionKeyCache>,
    active: Mutex<Option<ConversationId>>,
}

impl<S: KeyServer> Session<S> {
    fn new(
        server: Arc<S>,
        config: SessionConfig,
        username: &str,
        token: AuthToken,
        identity: IdentityKeyPair,
    ) -> Self {
        Self {
            server,
            config,
            username: username.to_string(),
            token,
            identity,
            keys: Arc::new(SessionKeyCache::new()),
            active: Mutex::new(None),
        }
    }

    /// Creates an account and signs in.
    ///
    /// Generates the identity, seals it under `password`, and, when enabled in
    /// `config`, under a fresh recovery phrase too. The phrase is returned once
    /// and not kept.
    pub async fn register(
        server: Arc<S>,
        config: SessionConfig,
        username: &str,
        password: &str,
    ) -> Result<(Self, Option<RecoveryPhrase>), Error> {
        let identity = IdentityKeyPair::generate()?;
        let wrapped_private_key = seal_identity(&identity, password, &config).await?;

        let (recovery, phrase) = if config.recovery_phrase {
            let phrase = RecoveryPhrase::generate()?;
            let record = seal_identity(&identity, phrase.phrase(), &config).await?;
            (Some(record), Some(phrase))
        } else {
            (None, None)
        };

        let keys = AccountKeys {
            public_key: identity.public_key(),
            wrapped_private_key,
            recovery,
        };
        server.register(username, password, keys).await?;
        let token = server.authenticate(username, password).await?;

        tracing::info!(
            username,
            fingerprint = %identity.public_key().fingerprint(),
            "registered new identity"
        );
        Ok((Self::new(server, config, username, token, identity), phrase))
    }

    /// Signs in and unlocks the stored private key with `password`.
    pub async fn login(
        server: Arc<S>,
        config: SessionConfig,
        username: &str,
        password: &str,
    ) -> Result<Self, Error> {
        let token = server.authenticate(username, password).await?;
        let keys = server.fetch_account_keys(&token).await?;
        let identity =
            open_identity(&keys.wrapped_private_key, password, &keys.public_key).await?;

        tracing::info!(
            username,
            fingerprint = %keys.public_key.fingerprint(),
            "identity unlocked"
        );
        Ok(Self::new(server, config, username, token, identity))
    }

    /// Sets a new password using the recovery phrase, then signs in.
    ///
    /// The phrase unlocks the recovery record; the private key is resealed
    /// under `new_password` and the reset is signed with the identity key.
    pub async fn recover(
        server: Arc<S>,
        config: SessionConfig,
        username: &str,
        phrase: &RecoveryPhrase,
        new_password: &str,
    ) -> Result<Self, Error> {
        let record = server.fetch_recovery_record(username).await?;
        let identity =
            open_identity(&record.wrapped_private_key, phrase.phrase(), &record.public_key)
                .await?;

        let wrapped_private_key = seal_identity(&identity, new_password, &config).await?;
        server
            .reset_credentials(CredentialReset::sign(
                &identity,
                username,
                new_password,
                record.reset_counter,
                wrapped_private_key,
            ))
            .await?;

        let token = server.authenticate(username, new_password).await?;

        tracing::info!(
            username,
            fingerprint = %record.public_key.fingerprint(),
            "password reset from recovery phrase"
        );
        Ok(Self::new(server, config, username, token, identity))
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn public_key(&self) -> IdentityPublicKey {
        self.identity.public_key()
    }

    /// The loaded conversation keys of this session.
    pub fn keys(&self) -> &SessionKeyCache {
        &self.keys
    }

    pub fn active_conversation(&self) -> Option<ConversationId> {
        self.active.lock().clone()
    }

    /// Starts a conversation with `others`.
    ///
    /// The new key is wrapped for every participant, this user included, and
    /// is ready for use on return.
    pub async fn create_conversation(&self, others: &[&str]) -> Result<ConversationId, Error> {
        let mut participants = vec![(self.username.clone(), self.identity.public_key())];
        for username in others {
            let public_key = self.server.fetch_public_key(&self.token, username).await?;
            participants.push((username.to_string(), public_key));
        }

        let conversation_id = ConversationId::random()?;
        let key = create_conversation_key()?;
        let wrapped = wrap_for_participants(&key, &conversation_id, &participants)?;
        self.server
            .create_conversation(&self.token, &conversation_id, wrapped)
            .await?;

        if let LoadStart::Started(ticket) = self.keys.begin_load(&conversation_id) {
            self.keys.finish_load(ticket, Ok(key))?;
        }

        tracing::info!(
            conversation = %conversation_id,
            participants = participants.len(),
            "conversation created"
        );
        Ok(conversation_id)
    }

    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, Error> {
        self.server.list_conversations(&self.token).await
    }

    async fn fetch_and_unwrap(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<SymmetricKey, Error> {
        let wrapped: WrappedConversationKey = self
            .server
            .fetch_conversation_key(&self.token, conversation_id)
            .await?;
        if wrapped.conversation_id != *conversation_id {
            return Err(Error::Unwrap(
                "Wrapped key belongs to another conversation".to_string(),
            ));
        }
        conversation_key::unwrap(&wrapped, &self.identity)
    }

    /// Fetches and unwraps a conversation key unless it is loaded or loading.
    ///
    /// Returns [`LoadOutcome::Stale`] if the conversation was unloaded while
    /// the key was in flight.
    pub async fn load_conversation_key(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<LoadOutcome, Error> {
        match self.keys.begin_load(conversation_id) {
            LoadStart::AlreadyReady => Ok(LoadOutcome::Ready),
            LoadStart::AlreadyLoading => {
                self.keys.wait_ready(conversation_id).await?;
                Ok(LoadOutcome::Ready)
            }
            LoadStart::Started(ticket) => {
                let result = self.fetch_and_unwrap(conversation_id).await;
                if let Err(err) = &result {
                    tracing::warn!(conversation = %conversation_id, %err, "key load failed");
                }
                self.keys.finish_load(ticket, result)
            }
        }
    }

    /// Loads several conversation keys concurrently.
    pub async fn prefetch_conversation_keys(
        &self,
        conversation_ids: &[ConversationId],
    ) -> Vec<Result<LoadOutcome, Error>> {
        join_all(
            conversation_ids
                .iter()
                .map(|conversation_id| self.load_conversation_key(conversation_id)),
        )
        .await
    }

    /// Makes `conversation_id` the active conversation and returns its history.
    ///
    /// The key of the previously active conversation is unloaded.
    pub async fn open_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<DecryptedMessage>, Error> {
        let previous = self.active.lock().replace(conversation_id.clone());
        if let Some(previous) = previous.filter(|previous| previous != conversation_id) {
            self.keys.unload(&previous);
        }

        match self.load_conversation_key(conversation_id).await? {
            LoadOutcome::Ready => self.history(conversation_id).await,
            LoadOutcome::Stale => Err(Error::KeyNotReady),
        }
    }

    /// Unloads the active conversation's key.
    pub fn close_conversation(&self) {
        if let Some(conversation_id) = self.active.lock().take() {
            self.keys.unload(&conversation_id);
        }
    }

    /// Encrypts and sends `text`. Fails with [`Error::KeyNotReady`] until the
    /// conversation key is loaded.
    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        text: &str,
    ) -> Result<EncryptedMessage, Error> {
        let message = self.keys.with_key(conversation_id, |key| {
            EncryptedMessage::seal(text, key, &self.username, now_millis())
        })??;

        self.server
            .send_message(&self.token, conversation_id, message.clone())
            .await?;

        tracing::debug!(conversation = %conversation_id, "message sent");
        Ok(message)
    }

    async fn fetch_history_with_retry(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<EncryptedMessage>, Error> {
        let mut attempt = 0;
        loop {
            match self
                .server
                .fetch_history(&self.token, conversation_id)
                .await
            {
                Err(err) if err.is_retryable() && attempt < self.config.history_retries => {
                    attempt += 1;
                    tracing::warn!(
                        conversation = %conversation_id,
                        attempt,
                        %err,
                        "history fetch failed, retrying"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                result => return result,
            }
        }
    }

    /// Fetches and decrypts the stored messages of a loaded conversation.
    ///
    /// Network failures are retried as configured. Messages that fail to
    /// decrypt are returned as [`MessageBody::Undecryptable`].
    ///
    /// [`MessageBody::Undecryptable`]: crate::MessageBody::Undecryptable
    pub async fn history(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<DecryptedMessage>, Error> {
        let messages = self.fetch_history_with_retry(conversation_id).await?;
        self.keys.with_key(conversation_id, |key| {
            messages.iter().map(|message| message.read(key)).collect()
        })
    }

    /// Live messages of a conversation from other participants.
    pub async fn subscribe(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<LiveMessages, Error> {
        let receiver = self.server.subscribe(&self.token, conversation_id).await?;
        Ok(LiveMessages {
            receiver,
            keys: self.keys.clone(),
            conversation_id: conversation_id.clone(),
            username: self.username.clone(),
        })
    }

    /// Ends the session. Every key held in memory is wiped.
    pub fn logout(self) {
        self.keys.clear();
        tracing::info!(username = %self.username, "logged out");
    }
}

/// Stream of decrypted messages pushed by the server.
pub struct LiveMessages {
    receiver: broadcast::Receiver<EncryptedMessage>,
    keys: Arc<SessionKeyCache>,
    conversation_id: ConversationId,
    username: String,
}

impl LiveMessages {
    /// Waits for the next message from someone else.
    ///
    /// Returns `None` once the channel closes or the conversation key is
    /// unloaded.
    pub async fn next(&mut self) -> Option<DecryptedMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) if message.sender_id == self.username => continue,
                Ok(message) => {
                    return self
                        .keys
                        .with_key(&self.conversation_id, |key| message.read(key))
                        .ok();
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        conversation = %self.conversation_id,
                        skipped,
                        "live receiver lagged; reload history"
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
