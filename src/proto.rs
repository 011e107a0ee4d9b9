use crate::conversation_key::{ConversationId, WrappedConversationKey};
use crate::crypto::{Iv, X25519PublicKey};
use crate::kdf::{KdfAlgorithm, KdfParams};
use crate::message::EncryptedMessage;
use crate::vault::WrappedPrivateKey;
use crate::{Error, ExportedPrivateKey, IdentityPublicKey};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::VerifyingKey;
use prost::Message;
use zeroize::{Zeroize, Zeroizing};

/// Version of every record this crate writes. Records carrying any other
/// version are rejected on read.
pub(crate) const WIRE_VERSION: u32 = 1;

#[derive(Clone, PartialEq, Message)]
struct PublicKeyProto {
    #[prost(uint32, tag = "1")]
    version: u32,
    #[prost(bytes = "vec", tag = "2")]
    dh_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    signing_key: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
struct PrivateKeyProto {
    #[prost(uint32, tag = "1")]
    version: u32,
    #[prost(bytes = "vec", tag = "2")]
    seed: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
struct KdfParamsProto {
    #[prost(uint32, tag = "1")]
    algorithm: u32,
    #[prost(uint32, tag = "2")]
    iterations: u32,
    #[prost(uint32, tag = "3")]
    memory_kib: u32,
    #[prost(uint32, tag = "4")]
    parallelism: u32,
}

#[derive(Clone, PartialEq, Message)]
struct WrappedPrivateKeyProto {
    #[prost(uint32, tag = "1")]
    version: u32,
    #[prost(message, optional, tag = "2")]
    kdf: Option<KdfParamsProto>,
    #[prost(bytes = "vec", tag = "3")]
    salt: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    iv: Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    ciphertext: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
struct WrappedConversationKeyProto {
    #[prost(uint32, tag = "1")]
    version: u32,
    #[prost(string, tag = "2")]
    conversation_id: String,
    #[prost(bytes = "vec", tag = "3")]
    ephemeral_public: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    iv: Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    ciphertext: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
struct EncryptedMessageProto {
    #[prost(uint32, tag = "1")]
    version: u32,
    #[prost(bytes = "vec", tag = "2")]
    ciphertext: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    iv: Vec<u8>,
    #[prost(string, tag = "4")]
    sender_id: String,
    #[prost(uint64, tag = "5")]
    timestamp_ms: u64,
}

fn check_version(version: u32) -> Result<(), Error> {
    if version != WIRE_VERSION {
        return Err(Error::Protocol(format!(
            "Unsupported record version: {version}"
        )));
    }
    Ok(())
}

fn key_bytes(bytes: &[u8], what: &str) -> Result<[u8; 32], Error> {
    bytes
        .try_into()
        .map_err(|_| Error::Serde(format!("Invalid {what} length")))
}

impl IdentityPublicKey {
    pub fn to_bytes(&self) -> Vec<u8> {
        PublicKeyProto {
            version: WIRE_VERSION,
            dh_key: self.dh_key.to_bytes().to_vec(),
            signing_key: self.signing_key.to_bytes().to_vec(),
        }
        .encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let proto = PublicKeyProto::decode(bytes)?;
        check_version(proto.version)?;

        let dh_key = X25519PublicKey::from(key_bytes(&proto.dh_key, "X25519 public key")?);
        let signing_key =
            VerifyingKey::from_bytes(&key_bytes(&proto.signing_key, "Ed25519 public key")?)
                .map_err(|err| Error::Serde(err.to_string()))?;

        Ok(Self::new(dh_key, signing_key))
    }

    /// Standard base64 of [`IdentityPublicKey::to_bytes`], as published to
    /// the key server.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    pub fn from_base64(encoded: &str) -> Result<Self, Error> {
        Self::from_bytes(&STANDARD.decode(encoded)?)
    }
}

impl ExportedPrivateKey {
    /// Encodes the private key for sealing. The buffer is wiped on drop.
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut proto = PrivateKeyProto {
            version: WIRE_VERSION,
            seed: self.0.to_vec(),
        };
        let encoded = Zeroizing::new(proto.encode_to_vec());
        proto.seed.zeroize();
        encoded
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut proto = PrivateKeyProto::decode(bytes)?;
        let parsed = check_version(proto.version).and_then(|()| {
            key_bytes(&proto.seed, "private key").map(|mut seed| {
                let exported = Self(Box::new(seed));
                seed.zeroize();
                exported
            })
        });
        proto.seed.zeroize();
        parsed
    }
}

impl From<KdfParams> for KdfParamsProto {
    fn from(params: KdfParams) -> Self {
        Self {
            algorithm: match params.algorithm {
                KdfAlgorithm::Pbkdf2Sha256 => 1,
                KdfAlgorithm::Argon2id => 2,
            },
            iterations: params.iterations,
            memory_kib: params.memory_kib,
            parallelism: params.parallelism,
        }
    }
}

impl TryFrom<KdfParamsProto> for KdfParams {
    type Error = Error;

    fn try_from(proto: KdfParamsProto) -> Result<Self, Error> {
        let algorithm = match proto.algorithm {
            1 => KdfAlgorithm::Pbkdf2Sha256,
            2 => KdfAlgorithm::Argon2id,
            other => return Err(Error::Serde(format!("Unknown KDF algorithm: {other}"))),
        };

        Ok(Self {
            algorithm,
            iterations: proto.iterations,
            memory_kib: proto.memory_kib,
            parallelism: proto.parallelism,
        })
    }
}

impl WrappedPrivateKey {
    pub fn to_bytes(&self) -> Vec<u8> {
        WrappedPrivateKeyProto {
            version: WIRE_VERSION,
            kdf: Some(self.kdf.into()),
            salt: self.salt.clone(),
            iv: self.iv.as_bytes().to_vec(),
            ciphertext: self.ciphertext.clone(),
        }
        .encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let proto = WrappedPrivateKeyProto::decode(bytes)?;
        check_version(proto.version)?;

        let kdf: KdfParams = proto
            .kdf
            .ok_or_else(|| Error::Serde("Missing KDF parameters".to_string()))?
            .try_into()?;

        Ok(Self {
            kdf,
            salt: proto.salt,
            iv: Iv::try_from(proto.iv.as_slice())?,
            ciphertext: proto.ciphertext,
        })
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    pub fn from_base64(encoded: &str) -> Result<Self, Error> {
        Self::from_bytes(&STANDARD.decode(encoded)?)
    }
}

impl WrappedConversationKey {
    pub fn to_bytes(&self) -> Vec<u8> {
        WrappedConversationKeyProto {
            version: WIRE_VERSION,
            conversation_id: self.conversation_id.as_str().to_string(),
            ephemeral_public: self.ephemeral_public.to_bytes().to_vec(),
            iv: self.iv.as_bytes().to_vec(),
            ciphertext: self.ciphertext.clone(),
        }
        .encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let proto = WrappedConversationKeyProto::decode(bytes)?;
        check_version(proto.version)?;

        Ok(Self {
            conversation_id: ConversationId::from(proto.conversation_id),
            ephemeral_public: X25519PublicKey::from(key_bytes(
                &proto.ephemeral_public,
                "ephemeral public key",
            )?),
            iv: Iv::try_from(proto.iv.as_slice())?,
            ciphertext: proto.ciphertext,
        })
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    pub fn from_base64(encoded: &str) -> Result<Self, Error> {
        Self::from_bytes(&STANDARD.decode(encoded)?)
    }
}

impl EncryptedMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        EncryptedMessageProto {
            version: WIRE_VERSION,
            ciphertext: self.ciphertext.clone(),
            iv: self.iv.as_bytes().to_vec(),
            sender_id: self.sender_id.clone(),
            timestamp_ms: self.timestamp_ms,
        }
        .encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let proto = EncryptedMessageProto::decode(bytes)?;
        check_version(proto.version)?;

        Ok(Self {
            ciphertext: proto.ciphertext,
            iv: Iv::try_from(proto.iv.as_slice())?,
            sender_id: proto.sender_id,
            timestamp_ms: proto.timestamp_ms,
        })
    }
}
