mod crypto;
pub use crypto::{IV_SIZE, Iv, KEY_SIZE, SymmetricKey, X25519PublicKey};

mod identity_key;
pub use identity_key::*;

pub mod kdf;
pub use kdf::{KdfAlgorithm, KdfParams};

pub mod vault;
pub use vault::WrappedPrivateKey;

pub mod conversation_key;
pub use conversation_key::{ConversationId, ParticipantKey, WrappedConversationKey};

pub mod message;
pub use message::{DecryptedMessage, EncryptedMessage, MessageBody};

mod key_cache;
pub use key_cache::*;

mod recovery;
pub use recovery::*;

mod proto;

mod error;
pub use error::Error;

mod config;
pub use config::SessionConfig;

pub mod server;
pub use server::memory::InMemoryKeyServer;
pub use server::{AccountKeys, AuthToken, KeyServer};

mod session;
pub use session::*;
