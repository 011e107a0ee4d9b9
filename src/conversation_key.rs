use crate::crypto::{
    Iv, KEY_SIZE, SymmetricKey, X25519PublicKey, X25519Secret, aead_open, aead_seal,
    fill_random, generate_random_seed,
};
use crate::proto::WIRE_VERSION;
use crate::{Error, IdentityKeyPair, IdentityPublicKey};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hkdf::Hkdf;
use sha2::Sha256;
use std::fmt;
use x25519_dalek::SharedSecret;
use zeroize::Zeroize;

const WRAP_INFO: &[u8] = b"chatlock-conversation-key-wrap-v1";

/// Identifier of a conversation.
///
/// Generated by the client that creates the conversation so every wrapped copy
/// of its key can be bound to it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationId(String);

impl ConversationId {
    /// 16 random bytes, URL-safe base64.
    pub fn random() -> Result<Self, Error> {
        let mut bytes = [0u8; 16];
        fill_random(&mut bytes)?;
        Ok(Self(URL_SAFE_NO_PAD.encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One participant's copy of a conversation key.
///
/// Sealed to the participant's X25519 identity key with a one-off ephemeral
/// key, so only that participant can open it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WrappedConversationKey {
    pub conversation_id: ConversationId,
    pub ephemeral_public: X25519PublicKey,
    pub iv: Iv,
    pub ciphertext: Vec<u8>,
}

/// A wrapped copy addressed to a named participant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParticipantKey {
    pub username: String,
    pub wrapped: WrappedConversationKey,
}

/// Generates the symmetric key of a new conversation.
pub fn create_conversation_key() -> Result<SymmetricKey, Error> {
    SymmetricKey::generate()
        .map_err(|_| Error::KeyGeneration("Random source unavailable".to_string()))
}

fn associated_data(conversation_id: &ConversationId, recipient: &X25519PublicKey) -> Vec<u8> {
    let id = conversation_id.as_str().as_bytes();
    let mut aad = Vec::with_capacity(4 + 4 + id.len() + 32);
    aad.extend_from_slice(&WIRE_VERSION.to_be_bytes());
    aad.extend_from_slice(&(id.len() as u32).to_be_bytes());
    aad.extend_from_slice(id);
    aad.extend_from_slice(recipient.as_bytes());
    aad
}

fn derive_wrapping_key(
    shared_secret: &SharedSecret,
    ephemeral_public: &X25519PublicKey,
    recipient: &X25519PublicKey,
) -> Result<SymmetricKey, Error> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral_public.as_bytes());
    salt[32..].copy_from_slice(recipient.as_bytes());

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared_secret.as_bytes());
    let mut output = [0u8; KEY_SIZE];
    hkdf.expand(WRAP_INFO, &mut output)
        .map_err(|_| Error::Protocol("HKDF expansion failed".to_string()))?;

    let key = SymmetricKey::from_bytes(output);
    output.zeroize();
    Ok(key)
}

/// Wraps `key` for one participant of `conversation_id`.
///
/// Call once per participant, the creator included.
pub fn wrap_for_participant(
    key: &SymmetricKey,
    conversation_id: &ConversationId,
    participant: &IdentityPublicKey,
) -> Result<WrappedConversationKey, Error> {
    let ephemeral = X25519Secret::from(generate_random_seed()?);
    let ephemeral_public = ephemeral.public_key();
    let recipient = participant.dh_key();

    let shared_secret = ephemeral.dh(&recipient)?;
    let wrapping_key = derive_wrapping_key(&shared_secret, &ephemeral_public, &recipient)?;
    let (iv, ciphertext) = aead_seal(
        &wrapping_key,
        key.as_bytes(),
        &associated_data(conversation_id, &recipient),
    )?;

    Ok(WrappedConversationKey {
        conversation_id: conversation_id.clone(),
        ephemeral_public,
        iv,
        ciphertext,
    })
}

/// Wraps `key` for every named participant.
pub fn wrap_for_participants(
    key: &SymmetricKey,
    conversation_id: &ConversationId,
    participants: &[(String, IdentityPublicKey)],
) -> Result<Vec<ParticipantKey>, Error> {
    participants
        .iter()
        .map(|(username, public_key)| {
            Ok(ParticipantKey {
                username: username.clone(),
                wrapped: wrap_for_participant(key, conversation_id, public_key)?,
            })
        })
        .collect()
}

/// Recovers the conversation key from this identity's wrapped copy.
pub fn unwrap(
    wrapped: &WrappedConversationKey,
    identity: &IdentityKeyPair,
) -> Result<SymmetricKey, Error> {
    let recipient = identity.public_key().dh_key();
    let shared_secret = identity
        .dh(&wrapped.ephemeral_public)
        .map_err(|_| Error::Unwrap("Malformed ephemeral key".to_string()))?;
    let wrapping_key =
        derive_wrapping_key(&shared_secret, &wrapped.ephemeral_public, &recipient)?;

    let mut raw = aead_open(
        &wrapping_key,
        &wrapped.iv,
        &wrapped.ciphertext,
        &associated_data(&wrapped.conversation_id, &recipient),
    )
    .map_err(|_| Error::Unwrap("Wrapped key could not be opened".to_string()))?;

    let bytes: Result<[u8; KEY_SIZE], _> = raw.as_slice().try_into();
    raw.zeroize();
    let mut bytes =
        bytes.map_err(|_| Error::Unwrap("Wrapped key has the wrong length".to_string()))?;
    let key = SymmetricKey::from_bytes(bytes);
    bytes.zeroize();

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_participants_recover_the_same_key() {
        let alice = IdentityKeyPair::generate().unwrap();
        let bob = IdentityKeyPair::generate().unwrap();
        let conversation = ConversationId::random().unwrap();
        let key = create_conversation_key().unwrap();

        let copies = wrap_for_participants(
            &key,
            &conversation,
            &[
                ("alice".to_string(), alice.public_key()),
                ("bob".to_string(), bob.public_key()),
            ],
        )
        .unwrap();

        assert_eq!(copies.len(), 2);
        assert_ne!(copies[0].wrapped.ciphertext, copies[1].wrapped.ciphertext);
        assert_eq!(unwrap(&copies[0].wrapped, &alice).unwrap(), key);
        assert_eq!(unwrap(&copies[1].wrapped, &bob).unwrap(), key);
    }

    #[test]
    fn test_wrong_identity_cannot_unwrap() {
        let alice = IdentityKeyPair::generate().unwrap();
        let mallory = IdentityKeyPair::generate().unwrap();
        let conversation = ConversationId::from("c-1");
        let key = create_conversation_key().unwrap();

        let wrapped = wrap_for_participant(&key, &conversation, &alice.public_key()).unwrap();
        assert!(matches!(unwrap(&wrapped, &mallory), Err(Error::Unwrap(_))));
    }

    #[test]
    fn test_copy_is_bound_to_its_conversation() {
        let alice = IdentityKeyPair::generate().unwrap();
        let key = create_conversation_key().unwrap();

        let mut wrapped =
            wrap_for_participant(&key, &ConversationId::from("c-1"), &alice.public_key())
                .unwrap();
        wrapped.conversation_id = ConversationId::from("c-2");

        assert!(matches!(unwrap(&wrapped, &alice), Err(Error::Unwrap(_))));
    }

    #[test]
    fn test_tampered_copy_is_rejected() {
        let alice = IdentityKeyPair::generate().unwrap();
        let conversation = ConversationId::from("c-1");
        let key = create_conversation_key().unwrap();
        let wrapped = wrap_for_participant(&key, &conversation, &alice.public_key()).unwrap();

        for byte in 0..wrapped.ciphertext.len() {
            let mut tampered = wrapped.clone();
            tampered.ciphertext[byte] ^= 0x80;
            assert!(matches!(unwrap(&tampered, &alice), Err(Error::Unwrap(_))));
        }

        let mut low_order = wrapped;
        low_order.ephemeral_public = X25519PublicKey::from([0u8; 32]);
        assert!(matches!(unwrap(&low_order, &alice), Err(Error::Unwrap(_))));
    }

    #[test]
    fn test_random_conversation_ids_differ() {
        let a = ConversationId::random().unwrap();
        let b = ConversationId::random().unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 22);
    }
}
