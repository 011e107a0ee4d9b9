#[macro_use]
extern crate afl;
use chatlock::{EncryptedMessage, IdentityPublicKey, WrappedConversationKey, WrappedPrivateKey};

fn main() {
    fuzz!(|data: &[u8]| {
        let _ = IdentityPublicKey::from_bytes(data);
        let _ = WrappedPrivateKey::from_bytes(data);
        let _ = WrappedConversationKey::from_bytes(data);
        let _ = EncryptedMessage::from_bytes(data);
    });
}
