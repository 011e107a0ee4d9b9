#[macro_use]
extern crate afl;
use chatlock::conversation_key::unwrap;
use chatlock::vault::open;
use chatlock::{IdentityKeyPair, SymmetricKey, WrappedConversationKey, WrappedPrivateKey};

fn main() {
    // The victim's long-term identity and the key its vault record is sealed under.
    let identity = IdentityKeyPair::generate().expect("Setup failed");
    let vault_key = SymmetricKey::generate().expect("Setup failed");

    fuzz!(|data: &[u8]| {
        if let Ok(wrapped) = WrappedConversationKey::from_bytes(data) {
            let _ = unwrap(&wrapped, &identity);
        }
        if let Ok(record) = WrappedPrivateKey::from_bytes(data) {
            let _ = open(&record, &vault_key);
        }
    });
}
