#[cfg(test)]
mod integration_tests {
    use chatlock::conversation_key::{create_conversation_key, unwrap, wrap_for_participants};
    use chatlock::message::{decrypt, encrypt};
    use chatlock::vault::{open_with_password, seal_with_password};
    use chatlock::{
        ConversationId, Error, IdentityKeyPair, IdentityPublicKey, InMemoryKeyServer, KdfParams,
        KeyServer, KeyState, LoadOutcome, LoadStart, LoadTicket, MessageBody, RecoveryPhrase,
        Session, SessionConfig, SessionKeyCache, SymmetricKey,
    };
    use std::sync::Arc;
    use std::time::Duration;

    fn started(start: LoadStart) -> LoadTicket {
        match start {
            LoadStart::Started(ticket) => Some(ticket),
            _ => None,
        }
        .expect("load was not started")
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            retry_delay: Duration::from_millis(10),
            ..SessionConfig::default()
        }
    }

    #[test]
    fn test_key_primitives_end_to_end() {
        println!("Step 1: Generating identities for Alice and Bob...");
        let alice = IdentityKeyPair::generate().unwrap();
        let bob = IdentityKeyPair::generate().unwrap();

        println!("Step 2: Publishing Bob's public key and reading it back...");
        let bob_public = IdentityPublicKey::from_base64(&bob.public_key().to_base64()).unwrap();
        assert_eq!(bob_public, bob.public_key());

        println!("Step 3: Sealing Alice's private key under her password...");
        let record =
            seal_with_password(&alice, "alice-password", KdfParams::default(), 16).unwrap();

        println!("Step 4: Unlocking with the right and wrong passwords...");
        let unlocked = open_with_password(&record, "alice-password").unwrap();
        assert_eq!(unlocked.public_key(), alice.public_key());
        assert_eq!(
            open_with_password(&record, "not-alices-password").unwrap_err(),
            Error::Decryption
        );

        println!("Step 5: Alice creates a conversation key for both of them...");
        let conversation = ConversationId::random().unwrap();
        let key = create_conversation_key().unwrap();
        let copies = wrap_for_participants(
            &key,
            &conversation,
            &[
                ("alice".to_string(), alice.public_key()),
                ("bob".to_string(), bob_public),
            ],
        )
        .unwrap();

        println!("Step 6: Both participants unwrap identical keys...");
        let alice_key = unwrap(&copies[0].wrapped, &unlocked).unwrap();
        let bob_key = unwrap(&copies[1].wrapped, &bob).unwrap();
        assert_eq!(alice_key, bob_key);

        println!("Step 7: Alice encrypts \"hello\" and Bob decrypts it...");
        let sealed = encrypt(b"hello", &alice_key).unwrap();
        assert_eq!(decrypt(&sealed.ciphertext, &sealed.iv, &bob_key).unwrap(), b"hello");

        println!("Step 8: A third party's key cannot read it...");
        let outsider = SymmetricKey::generate().unwrap();
        assert_eq!(
            decrypt(&sealed.ciphertext, &sealed.iv, &outsider).unwrap_err(),
            Error::Decryption
        );
    }

    #[tokio::test]
    async fn test_full_chat_flow() {
        let server = Arc::new(InMemoryKeyServer::new());

        println!("Step 1: Registering Alice and Bob...");
        let (alice, alice_phrase) =
            Session::register(server.clone(), test_config(), "alice", "alice-password")
                .await
                .unwrap();
        let (bob, _) = Session::register(server.clone(), test_config(), "bob", "bob-password")
            .await
            .unwrap();
        assert!(alice_phrase.is_some());

        println!("Step 2: Logging in again with the wrong password fails...");
        let result =
            Session::login(server.clone(), test_config(), "alice", "wrong-password").await;
        assert!(result.is_err());

        println!("Step 3: Alice starts a conversation with Bob...");
        let conversation = alice.create_conversation(&["bob"]).await.unwrap();
        assert_eq!(alice.keys().state(&conversation), KeyState::Ready);

        println!("Step 4: Alice sends \"hello\"...");
        let sent = alice.send_message(&conversation, "hello").await.unwrap();
        assert_ne!(sent.ciphertext, b"hello".to_vec());

        println!("Step 5: Bob opens the conversation and reads it...");
        let history = bob.open_conversation(&conversation).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].sender_id, "alice");
        assert_eq!(history[0].body, MessageBody::Text("hello".to_string()));

        println!("Step 6: Bob listens live while Alice replies...");
        let mut live = bob.subscribe(&conversation).await.unwrap();
        alice.send_message(&conversation, "are you there?").await.unwrap();
        let pushed = tokio::time::timeout(Duration::from_secs(5), live.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pushed.body, MessageBody::Text("are you there?".to_string()));

        println!("Step 7: The server only ever saw ciphertext...");
        assert_eq!(server.stored_messages(&conversation), 2);
        let stored = server
            .fetch_history(
                &server.authenticate("bob", "bob-password").await.unwrap(),
                &conversation,
            )
            .await
            .unwrap();
        assert!(stored.iter().all(|message| message.ciphertext != b"hello".to_vec()));

        println!("Step 8: A fresh login restores access to the conversation...");
        bob.logout();
        let bob = Session::login(server.clone(), test_config(), "bob", "bob-password")
            .await
            .unwrap();
        assert_eq!(bob.keys().state(&conversation), KeyState::Unloaded);
        let history = bob.open_conversation(&conversation).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_password_reset_from_recovery_phrase() {
        let server = Arc::new(InMemoryKeyServer::new());

        println!("Step 1: Alice registers and writes down her phrase...");
        let (alice, phrase) =
            Session::register(server.clone(), test_config(), "alice", "old-password")
                .await
                .unwrap();
        let written_down = phrase.unwrap().phrase().to_string();
        let fingerprint = alice.public_key().fingerprint();
        alice.logout();

        println!("Step 2: A wrong phrase does not unlock the account...");
        let wrong = RecoveryPhrase::generate().unwrap();
        let result = Session::recover(
            server.clone(),
            test_config(),
            "alice",
            &wrong,
            "new-password",
        )
        .await;
        assert_eq!(result.err(), Some(Error::Decryption));

        println!("Step 3: Alice recovers with her phrase and sets a new password...");
        let typed = RecoveryPhrase::parse(&written_down.to_uppercase()).unwrap();
        let recovered =
            Session::recover(server.clone(), test_config(), "alice", &typed, "new-password")
                .await
                .unwrap();
        assert_eq!(recovered.public_key().fingerprint(), fingerprint);

        println!("Step 4: Only the new password works from now on...");
        assert!(
            Session::login(server.clone(), test_config(), "alice", "old-password")
                .await
                .is_err()
        );
        let relogged = Session::login(server.clone(), test_config(), "alice", "new-password")
            .await
            .unwrap();
        assert_eq!(relogged.public_key().fingerprint(), fingerprint);
    }

    #[tokio::test]
    async fn test_history_survives_flaky_network() {
        let server = Arc::new(InMemoryKeyServer::new());
        let (alice, _) = Session::register(server.clone(), test_config(), "alice", "pw-alice")
            .await
            .unwrap();
        let (bob, _) = Session::register(server.clone(), test_config(), "bob", "pw-bob")
            .await
            .unwrap();

        println!("Step 1: Alice sends a message...");
        let conversation = alice.create_conversation(&["bob"]).await.unwrap();
        alice.send_message(&conversation, "hello").await.unwrap();

        println!("Step 2: Bob loads the key, then history fails twice in a row...");
        assert_eq!(
            bob.load_conversation_key(&conversation).await.unwrap(),
            LoadOutcome::Ready
        );
        server.fail_next_requests(2);

        println!("Step 3: The retries hide the outage...");
        let history = bob.history(&conversation).await.unwrap();
        assert_eq!(history[0].body, MessageBody::Text("hello".to_string()));
    }

    #[test]
    fn test_stale_key_load_is_discarded() {
        let cache = SessionKeyCache::new();
        let first = ConversationId::from("first");
        let second = ConversationId::from("second");

        println!("Step 1: The user opens the first conversation...");
        let slow_ticket = started(cache.begin_load(&first));

        println!("Step 2: ...and switches away before its key arrives...");
        cache.unload(&first);
        let ticket = started(cache.begin_load(&second));
        cache
            .finish_load(ticket, Ok(SymmetricKey::generate().unwrap()))
            .unwrap();

        println!("Step 3: The late key for the first conversation is dropped...");
        let late = cache.finish_load(slow_ticket, Ok(SymmetricKey::generate().unwrap()));
        assert_eq!(late, Ok(LoadOutcome::Stale));
        assert_eq!(cache.state(&first), KeyState::Unloaded);
        assert_eq!(cache.state(&second), KeyState::Ready);
    }
}
