use super::{
    AccountKeys, AuthToken, ConversationSummary, CredentialReset, KeyServer, RecoveryRecord,
};
use crate::conversation_key::{ConversationId, ParticipantKey, WrappedConversationKey};
use crate::crypto::fill_random;
use crate::message::EncryptedMessage;
use crate::vault::WrappedPrivateKey;
use crate::{Error, IdentityPublicKey};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::broadcast;

const PUSH_CAPACITY: usize = 64;

struct Account {
    password_salt: [u8; 16],
    password_hash: [u8; 32],
    public_key: Vec<u8>,
    wrapped_private_key: Vec<u8>,
    recovery: Option<Vec<u8>>,
    reset_counter: u64,
}

struct Conversation {
    participants: BTreeSet<String>,
    keys: HashMap<String, Vec<u8>>,
    messages: Vec<Vec<u8>>,
    live: broadcast::Sender<EncryptedMessage>,
}

#[derive(Default)]
struct State {
    accounts: HashMap<String, Account>,
    tokens: HashMap<String, String>,
    conversations: HashMap<ConversationId, Conversation>,
    failures_pending: u32,
    key_fetch_delay: Option<Duration>,
}

/// A [`KeyServer`] kept in process memory.
///
/// Records are held in their encoded wire form, the way a real backend would
/// hold opaque blobs. Passwords are stored as salted SHA-256 hashes.
#[derive(Default)]
pub struct InMemoryKeyServer {
    state: Mutex<State>,
}

fn hash_password(salt: &[u8; 16], password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

fn rejected(reason: &str) -> Error {
    Error::Server(reason.to_string())
}

impl State {
    /// Consumes one injected failure, if any is pending.
    fn transport(&mut self) -> Result<(), Error> {
        if self.failures_pending > 0 {
            self.failures_pending -= 1;
            return Err(Error::Network("Connection reset".to_string()));
        }
        Ok(())
    }

    fn user(&self, token: &AuthToken) -> Result<String, Error> {
        self.tokens
            .get(token.as_str())
            .cloned()
            .ok_or_else(|| rejected("Invalid or expired token"))
    }

    fn account(&self, username: &str) -> Result<&Account, Error> {
        self.accounts
            .get(username)
            .ok_or_else(|| rejected("Unknown user"))
    }

    fn conversation(
        &self,
        username: &str,
        conversation_id: &ConversationId,
    ) -> Result<&Conversation, Error> {
        self.conversations
            .get(conversation_id)
            .filter(|conversation| conversation.participants.contains(username))
            .ok_or_else(|| rejected("No such conversation"))
    }
}

impl InMemoryKeyServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` requests fail with [`Error::Network`].
    pub fn fail_next_requests(&self, count: u32) {
        self.state.lock().failures_pending = count;
    }

    /// Holds every conversation key fetch for `delay` before answering.
    pub fn delay_key_fetches(&self, delay: Duration) {
        self.state.lock().key_fetch_delay = Some(delay);
    }

    /// Number of messages stored for a conversation.
    pub fn stored_messages(&self, conversation_id: &ConversationId) -> usize {
        self.state
            .lock()
            .conversations
            .get(conversation_id)
            .map_or(0, |conversation| conversation.messages.len())
    }

    /// Flips the first ciphertext byte of one stored message.
    pub fn corrupt_message(&self, conversation_id: &ConversationId, index: usize) {
        let mut state = self.state.lock();
        if let Some(message) = state
            .conversations
            .get_mut(conversation_id)
            .and_then(|conversation| conversation.messages.get_mut(index))
        {
            if let Ok(mut decoded) = EncryptedMessage::from_bytes(message) {
                if let Some(byte) = decoded.ciphertext.first_mut() {
                    *byte ^= 0xff;
                }
                *message = decoded.to_bytes();
            }
        }
    }
}

#[async_trait]
impl KeyServer for InMemoryKeyServer {
    async fn register(
        &self,
        username: &str,
        password: &str,
        keys: AccountKeys,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.transport()?;

        if username.is_empty() || password.is_empty() {
            return Err(rejected("Username and password are required"));
        }
        if state.accounts.contains_key(username) {
            return Err(rejected("Username is taken"));
        }

        let mut password_salt = [0u8; 16];
        fill_random(&mut password_salt)?;
        state.accounts.insert(
            username.to_string(),
            Account {
                password_hash: hash_password(&password_salt, password),
                password_salt,
                public_key: keys.public_key.to_bytes(),
                wrapped_private_key: keys.wrapped_private_key.to_bytes(),
                recovery: keys.recovery.as_ref().map(WrappedPrivateKey::to_bytes),
                reset_counter: 0,
            },
        );

        tracing::info!(username, "account registered");
        Ok(())
    }

    async fn authenticate(&self, username: &str, password: &str) -> Result<AuthToken, Error> {
        let mut state = self.state.lock();
        state.transport()?;

        let valid = state.accounts.get(username).is_some_and(|account| {
            let hash = hash_password(&account.password_salt, password);
            bool::from(hash.as_slice().ct_eq(account.password_hash.as_slice()))
        });
        if !valid {
            return Err(rejected("Invalid username or password"));
        }

        let mut raw = [0u8; 32];
        fill_random(&mut raw)?;
        let token = URL_SAFE_NO_PAD.encode(raw);
        state.tokens.insert(token.clone(), username.to_string());

        Ok(AuthToken::new(token))
    }

    async fn fetch_account_keys(&self, token: &AuthToken) -> Result<AccountKeys, Error> {
        let mut state = self.state.lock();
        state.transport()?;

        let username = state.user(token)?;
        let account = state.account(&username)?;

        Ok(AccountKeys {
            public_key: IdentityPublicKey::from_bytes(&account.public_key)?,
            wrapped_private_key: WrappedPrivateKey::from_bytes(&account.wrapped_private_key)?,
            recovery: account
                .recovery
                .as_deref()
                .map(WrappedPrivateKey::from_bytes)
                .transpose()?,
        })
    }

    async fn fetch_public_key(
        &self,
        token: &AuthToken,
        username: &str,
    ) -> Result<IdentityPublicKey, Error> {
        let mut state = self.state.lock();
        state.transport()?;

        state.user(token)?;
        IdentityPublicKey::from_bytes(&state.account(username)?.public_key)
    }

    async fn fetch_recovery_record(&self, username: &str) -> Result<RecoveryRecord, Error> {
        let mut state = self.state.lock();
        state.transport()?;

        let account = state.account(username)?;
        let recovery = account
            .recovery
            .as_deref()
            .ok_or_else(|| rejected("Account has no recovery phrase"))?;

        Ok(RecoveryRecord {
            public_key: IdentityPublicKey::from_bytes(&account.public_key)?,
            wrapped_private_key: WrappedPrivateKey::from_bytes(recovery)?,
            reset_counter: account.reset_counter,
        })
    }

    async fn reset_credentials(&self, reset: CredentialReset) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.transport()?;

        if reset.new_password.is_empty() {
            return Err(rejected("Password is required"));
        }

        let account = state.account(&reset.username)?;
        let public_key = IdentityPublicKey::from_bytes(&account.public_key)?;
        reset
            .verify(&public_key)
            .map_err(|_| rejected("Reset is not signed by the account identity"))?;
        if reset.reset_counter != account.reset_counter {
            return Err(rejected("Reset was already used"));
        }

        let mut password_salt = [0u8; 16];
        fill_random(&mut password_salt)?;
        let password_hash = hash_password(&password_salt, &reset.new_password);

        let username = reset.username;
        if let Some(account) = state.accounts.get_mut(&username) {
            account.password_salt = password_salt;
            account.password_hash = password_hash;
            account.wrapped_private_key = reset.wrapped_private_key.to_bytes();
            account.reset_counter += 1;
        }
        state.tokens.retain(|_, owner| *owner != username);

        tracing::info!(username = %username, "credentials reset");
        Ok(())
    }

    async fn create_conversation(
        &self,
        token: &AuthToken,
        conversation_id: &ConversationId,
        keys: Vec<ParticipantKey>,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.transport()?;

        let creator = state.user(token)?;
        let participants: BTreeSet<String> =
            keys.iter().map(|key| key.username.clone()).collect();

        if participants.len() != keys.len() {
            return Err(rejected("Duplicate participant"));
        }
        if participants.len() < 2 || !participants.contains(&creator) {
            return Err(rejected(
                "A conversation needs the creator and at least one other user",
            ));
        }
        if let Some(unknown) = participants
            .iter()
            .find(|username| !state.accounts.contains_key(*username))
        {
            return Err(Error::Server(format!("Unknown user: {unknown}")));
        }
        if keys
            .iter()
            .any(|key| key.wrapped.conversation_id != *conversation_id)
        {
            return Err(rejected("Wrapped key is bound to another conversation"));
        }
        if state.conversations.contains_key(conversation_id) {
            return Err(rejected("Conversation id is taken"));
        }
        if state
            .conversations
            .values()
            .any(|conversation| conversation.participants == participants)
        {
            return Err(rejected("These users already share a conversation"));
        }

        let (live, _) = broadcast::channel(PUSH_CAPACITY);
        state.conversations.insert(
            conversation_id.clone(),
            Conversation {
                participants,
                keys: keys
                    .into_iter()
                    .map(|key| (key.username, key.wrapped.to_bytes()))
                    .collect(),
                messages: Vec::new(),
                live,
            },
        );

        tracing::info!(
            conversation = %conversation_id,
            creator = %creator,
            "conversation created"
        );
        Ok(())
    }

    async fn list_conversations(
        &self,
        token: &AuthToken,
    ) -> Result<Vec<ConversationSummary>, Error> {
        let mut state = self.state.lock();
        state.transport()?;

        let username = state.user(token)?;
        let mut summaries: Vec<_> = state
            .conversations
            .iter()
            .filter(|(_, conversation)| conversation.participants.contains(&username))
            .map(|(id, conversation)| ConversationSummary {
                id: id.clone(),
                participants: conversation.participants.iter().cloned().collect(),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(summaries)
    }

    async fn fetch_conversation_key(
        &self,
        token: &AuthToken,
        conversation_id: &ConversationId,
    ) -> Result<WrappedConversationKey, Error> {
        let delay = self.state.lock().key_fetch_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.transport()?;

        let username = state.user(token)?;
        let wrapped = state
            .conversation(&username, conversation_id)?
            .keys
            .get(&username)
            .ok_or_else(|| rejected("No key for this participant"))?;

        WrappedConversationKey::from_bytes(wrapped)
    }

    async fn fetch_history(
        &self,
        token: &AuthToken,
        conversation_id: &ConversationId,
    ) -> Result<Vec<EncryptedMessage>, Error> {
        let mut state = self.state.lock();
        state.transport()?;

        let username = state.user(token)?;
        state
            .conversation(&username, conversation_id)?
            .messages
            .iter()
            .map(|message| EncryptedMessage::from_bytes(message))
            .collect()
    }

    async fn send_message(
        &self,
        token: &AuthToken,
        conversation_id: &ConversationId,
        message: EncryptedMessage,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.transport()?;

        let username = state.user(token)?;
        if message.sender_id != username {
            return Err(rejected("Sender does not match the authenticated user"));
        }
        state.conversation(&username, conversation_id)?;

        if let Some(conversation) = state.conversations.get_mut(conversation_id) {
            conversation.messages.push(message.to_bytes());
            // No live subscribers is not an error.
            conversation.live.send(message).ok();
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        token: &AuthToken,
        conversation_id: &ConversationId,
    ) -> Result<broadcast::Receiver<EncryptedMessage>, Error> {
        let mut state = self.state.lock();
        state.transport()?;

        let username = state.user(token)?;
        Ok(state.conversation(&username, conversation_id)?.live.subscribe())
    }
}
