use crate::crypto::{Iv, SymmetricKey, aead_open, aead_seal};
use crate::Error;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::time::{SystemTime, UNIX_EPOCH};

const MESSAGE_CONTEXT: &[u8] = b"chatlock-message-v1";

/// AEAD output of one message body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ciphertext {
    pub ciphertext: Vec<u8>,
    pub iv: Iv,
}

/// Encrypts a message body under the conversation key with a fresh IV.
///
/// Callers must hold a loaded conversation key; there is no fallback to an
/// absent key.
pub fn encrypt(plaintext: &[u8], key: &SymmetricKey) -> Result<Ciphertext, Error> {
    let (iv, ciphertext) = aead_seal(key, plaintext, MESSAGE_CONTEXT)?;
    Ok(Ciphertext { ciphertext, iv })
}

/// Decrypts and authenticates a message body.
pub fn decrypt(ciphertext: &[u8], iv: &Iv, key: &SymmetricKey) -> Result<Vec<u8>, Error> {
    aead_open(key, iv, ciphertext, MESSAGE_CONTEXT)
}

/// Associated data of a stored message: the context, sender and timestamp.
fn envelope_aad(sender_id: &str, timestamp_ms: u64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(MESSAGE_CONTEXT.len() + 12 + sender_id.len());
    aad.extend_from_slice(MESSAGE_CONTEXT);
    aad.extend_from_slice(&(sender_id.len() as u32).to_be_bytes());
    aad.extend_from_slice(sender_id.as_bytes());
    aad.extend_from_slice(&timestamp_ms.to_be_bytes());
    aad
}

/// Milliseconds since the UNIX epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A message as the server stores and relays it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedMessage {
    pub ciphertext: Vec<u8>,
    pub iv: Iv,
    pub sender_id: String,
    pub timestamp_ms: u64,
}

impl EncryptedMessage {
    /// Encrypts `text` for sending. The sender and timestamp are
    /// authenticated along with the body.
    pub fn seal(
        text: &str,
        key: &SymmetricKey,
        sender_id: &str,
        timestamp_ms: u64,
    ) -> Result<Self, Error> {
        let (iv, ciphertext) =
            aead_seal(key, text.as_bytes(), &envelope_aad(sender_id, timestamp_ms))?;
        Ok(Self {
            ciphertext,
            iv,
            sender_id: sender_id.to_string(),
            timestamp_ms,
        })
    }

    /// Decrypts for display.
    ///
    /// On failure the raw ciphertext is kept as the body so one bad message does
    /// not hide the rest of a conversation. Only for rendering.
    pub fn read(&self, key: &SymmetricKey) -> DecryptedMessage {
        let aad = envelope_aad(&self.sender_id, self.timestamp_ms);
        let body = match aead_open(key, &self.iv, &self.ciphertext, &aad)
            .ok()
            .and_then(|plaintext| String::from_utf8(plaintext).ok())
        {
            Some(text) => MessageBody::Text(text),
            None => {
                tracing::warn!(
                    sender = %self.sender_id,
                    timestamp_ms = self.timestamp_ms,
                    "message failed to decrypt, showing raw ciphertext"
                );
                MessageBody::Undecryptable(STANDARD.encode(&self.ciphertext))
            }
        };

        DecryptedMessage {
            sender_id: self.sender_id.clone(),
            timestamp_ms: self.timestamp_ms,
            body,
        }
    }
}

/// Displayable body of a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageBody {
    /// Authenticated plaintext.
    Text(String),
    /// Base64 of a ciphertext that failed to authenticate.
    Undecryptable(String),
}

impl MessageBody {
    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecryptedMessage {
    pub sender_id: String,
    pub timestamp_ms: u64,
    pub body: MessageBody,
}
