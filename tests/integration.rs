#[cfg(test)]
mod integration_tests {
    use murmur::{
        Envelope, Error, IdentityKeyManager, MemoryKeyStore, PeerAddress, ProtocolConfig,
        PublicBundle, SessionEstablisher,
    };
    use std::sync::Arc;

    struct Party {
        store: Arc<MemoryKeyStore>,
        establisher: SessionEstablisher,
    }

    fn provision(config: ProtocolConfig) -> Party {
        let store = Arc::new(MemoryKeyStore::new());
        let identity = IdentityKeyManager::new(store.clone())
            .ensure_identity()
            .unwrap();
        let establisher = SessionEstablisher::new(store.clone(), identity, config);
        establisher.pre_keys().generate_signed_pre_key(1).unwrap();
        establisher
            .pre_keys()
            .generate_one_time_pre_keys(1, 1)
            .unwrap();

        Party {
            store,
            establisher,
        }
    }

    #[test]
    fn test_full_protocol_flow() {
        println!("Step 1: Provisioning Alice and Bob...");
        let alice = provision(ProtocolConfig::default());
        let bob = provision(ProtocolConfig::default());
        let alice_addr = PeerAddress::new("alice", 1);
        let bob_addr = PeerAddress::new("bob", 1);

        println!("Step 2: Bob publishes his bundle as an opaque blob...");
        let bundle_blob = bob.establisher.pre_keys().public_bundle().unwrap().to_bytes();

        println!("Step 3: Alice fetches and verifies the bundle...");
        let bundle = PublicBundle::from_bytes(&bundle_blob).unwrap();
        assert!(bundle.verify().is_ok());

        println!("Step 4: Alice initiates a session carrying \"hello\"...");
        let (mut alice_session, handshake) = alice
            .establisher
            .initiate_session(&bob_addr, &bundle, b"hello")
            .unwrap();
        let wire = handshake.encode();

        println!("Step 5: Bob processes the handshake...");
        let delivered = Envelope::decode(&wire).unwrap();
        let (mut bob_session, first) = bob
            .establisher
            .process_handshake(&alice_addr, &delivered)
            .unwrap();
        assert_eq!(first, b"hello");
        assert_eq!(alice_session.session_id(), bob_session.session_id());

        println!("Step 6: Alice sends the second message...");
        let envelope = alice_session.encrypt(b"second message").unwrap();
        match &envelope {
            Envelope::Ratchet(message) => assert_eq!(message.message_number, 1),
            Envelope::Handshake(_) => panic!("expected a ratchet envelope"),
        }

        println!("Step 7: Bob decrypts the second message...");
        let delivered = Envelope::decode(&envelope.encode()).unwrap();
        assert_eq!(bob_session.decrypt(&delivered).unwrap(), b"second message");
        assert_eq!(bob_session.receiving_message_number(), 2);

        println!("Step 8: Bob replies, completing Alice's pending handshake...");
        assert!(alice_session.is_pending());
        let reply = bob_session.encrypt(b"hello alice").unwrap();
        assert_eq!(alice_session.decrypt(&reply).unwrap(), b"hello alice");
        assert!(!alice_session.is_pending());

        println!("Step 9: A few rounds to turn the DH ratchet...");
        for i in 0..3 {
            let msg = format!("from alice {i}");
            let envelope = alice_session.encrypt(msg.as_bytes()).unwrap();
            assert_eq!(bob_session.decrypt(&envelope).unwrap(), msg.as_bytes());

            let msg = format!("from bob {i}");
            let envelope = bob_session.encrypt(msg.as_bytes()).unwrap();
            assert_eq!(alice_session.decrypt(&envelope).unwrap(), msg.as_bytes());
        }

        println!("Full protocol flow passed!");
    }

    #[test]
    fn test_out_of_order_delivery_and_replay() {
        let alice = provision(ProtocolConfig::default());
        let bob = provision(ProtocolConfig::default());
        let alice_addr = PeerAddress::new("alice", 1);
        let bob_addr = PeerAddress::new("bob", 1);

        let bundle = bob.establisher.pre_keys().public_bundle().unwrap();
        let (mut alice_session, handshake) = alice
            .establisher
            .initiate_session(&bob_addr, &bundle, b"")
            .unwrap();
        let (mut bob_session, first) = bob
            .establisher
            .process_handshake(&alice_addr, &handshake)
            .unwrap();
        assert_eq!(first, b"", "pure handshake carries an empty message");

        let m1 = alice_session.encrypt(b"M1").unwrap();
        let m2 = alice_session.encrypt(b"M2").unwrap();
        let m3 = alice_session.encrypt(b"M3").unwrap();

        // Delivered as M2, M3, M1
        assert_eq!(bob_session.decrypt(&m2).unwrap(), b"M2");
        assert_eq!(bob_session.decrypt(&m3).unwrap(), b"M3");
        assert_eq!(bob_session.decrypt(&m1).unwrap(), b"M1");

        // Replaying M2 must fail without touching the session
        assert_eq!(bob_session.decrypt(&m2), Err(Error::ReplayedMessage));

        // The session still works afterwards
        let m4 = alice_session.encrypt(b"M4").unwrap();
        assert_eq!(bob_session.decrypt(&m4).unwrap(), b"M4");
    }

    #[test]
    fn test_bundle_tampering_creates_no_session() {
        let alice = provision(ProtocolConfig::default());
        let bob = provision(ProtocolConfig::default());
        let bob_addr = PeerAddress::new("bob", 1);

        let mut blob = bob.establisher.pre_keys().public_bundle().unwrap().to_bytes();
        // The signature spans bytes 104..168 of the bundle layout
        blob[110] ^= 0x01;
        let tampered = PublicBundle::from_bytes(&blob).unwrap();

        assert_eq!(
            alice
                .establisher
                .initiate_session(&bob_addr, &tampered, b"hi")
                .err(),
            Some(Error::InvalidSignature)
        );
        assert!(alice.establisher.session(&bob_addr).unwrap().is_none());
    }

    #[test]
    fn test_one_time_pre_key_exhaustion() {
        let alice = provision(ProtocolConfig::default());
        let carol = provision(ProtocolConfig::default());
        let bob = provision(ProtocolConfig::default());
        let alice_addr = PeerAddress::new("alice", 1);
        let carol_addr = PeerAddress::new("carol", 1);
        let bob_addr = PeerAddress::new("bob", 1);

        // Both initiators fetched the same stale bundle referencing one-time
        // pre-key 1.
        let bundle_blob = bob.establisher.pre_keys().public_bundle().unwrap().to_bytes();

        let (_, first_handshake) = alice
            .establisher
            .initiate_session(&bob_addr, &PublicBundle::from_bytes(&bundle_blob).unwrap(), b"a")
            .unwrap();
        let (_, second_handshake) = carol
            .establisher
            .initiate_session(&bob_addr, &PublicBundle::from_bytes(&bundle_blob).unwrap(), b"c")
            .unwrap();

        let (_, plaintext) = bob
            .establisher
            .process_handshake(&alice_addr, &first_handshake)
            .unwrap();
        assert_eq!(plaintext, b"a");

        // The one-time pre-key is gone; the second handshake must not fall
        // back to a weaker agreement.
        assert_eq!(
            bob.establisher
                .process_handshake(&carol_addr, &second_handshake)
                .err(),
            Some(Error::PreKeyNotFound(1))
        );
    }

    #[test]
    fn test_skipped_cache_bound() {
        let alice = provision(ProtocolConfig::default());
        let bob = provision(ProtocolConfig::default());
        let alice_addr = PeerAddress::new("alice", 1);
        let bob_addr = PeerAddress::new("bob", 1);

        let bundle = bob.establisher.pre_keys().public_bundle().unwrap();
        let (mut alice_session, handshake) = alice
            .establisher
            .initiate_session(&bob_addr, &bundle, b"start")
            .unwrap();
        let (mut bob_session, _) = bob
            .establisher
            .process_handshake(&alice_addr, &handshake)
            .unwrap();

        // Messages 1..=1002 are sent but only the last is delivered; the gap
        // of 1001 exceeds the cap of 1000.
        let mut undelivered = Vec::with_capacity(1002);
        for i in 1..=1002u32 {
            undelivered.push(alice_session.encrypt(format!("msg {i}").as_bytes()).unwrap());
        }

        assert!(matches!(
            bob_session.decrypt(&undelivered[1001]),
            Err(Error::TooManySkippedMessages {
                gap: 1001,
                limit: 1000
            })
        ));

        // A gap of exactly 1000 is still within the cap.
        assert_eq!(
            bob_session.decrypt(&undelivered[1000]).unwrap(),
            b"msg 1001"
        );
    }

    #[test]
    fn test_state_survives_process_restart() {
        let alice = provision(ProtocolConfig::default());
        let bob = provision(ProtocolConfig::default());
        let alice_addr = PeerAddress::new("alice", 1);
        let bob_addr = PeerAddress::new("bob", 1);

        let bundle = bob.establisher.pre_keys().public_bundle().unwrap();
        let (mut alice_session, handshake) = alice
            .establisher
            .initiate_session(&bob_addr, &bundle, b"before restart")
            .unwrap();
        let (mut bob_session, _) = bob
            .establisher
            .process_handshake(&alice_addr, &handshake)
            .unwrap();

        let reply = bob_session.encrypt(b"ack").unwrap();
        alice_session.decrypt(&reply).unwrap();

        // "Restart" both processes: everything is rebuilt from the stores.
        drop(alice_session);
        drop(bob_session);
        let alice_identity = IdentityKeyManager::new(alice.store.clone())
            .ensure_identity()
            .unwrap();
        let bob_identity = IdentityKeyManager::new(bob.store.clone())
            .ensure_identity()
            .unwrap();
        let alice_restarted = SessionEstablisher::new(
            alice.store.clone(),
            alice_identity,
            ProtocolConfig::default(),
        );
        let bob_restarted = SessionEstablisher::new(
            bob.store.clone(),
            bob_identity,
            ProtocolConfig::default(),
        );

        let mut alice_session = alice_restarted.session(&bob_addr).unwrap().unwrap();
        let mut bob_session = bob_restarted.session(&alice_addr).unwrap().unwrap();

        let envelope = alice_session.encrypt(b"after restart").unwrap();
        assert_eq!(bob_session.decrypt(&envelope).unwrap(), b"after restart");

        let envelope = bob_session.encrypt(b"still here").unwrap();
        assert_eq!(alice_session.decrypt(&envelope).unwrap(), b"still here");
    }

    #[test]
    fn test_identity_change_requires_explicit_re_trust() {
        let alice = provision(ProtocolConfig::default());
        let bob = provision(ProtocolConfig::default());
        let alice_addr = PeerAddress::new("alice", 1);
        let bob_addr = PeerAddress::new("bob", 1);

        let bundle = bob.establisher.pre_keys().public_bundle().unwrap();
        let (_, handshake) = alice
            .establisher
            .initiate_session(&bob_addr, &bundle, b"hi bob")
            .unwrap();
        bob.establisher
            .process_handshake(&alice_addr, &handshake)
            .unwrap();

        // Bob loses his device and provisions a fresh identity.
        let new_bob = provision(ProtocolConfig::default());
        let new_bundle = new_bob.establisher.pre_keys().public_bundle().unwrap();

        assert_eq!(
            alice
                .establisher
                .initiate_session(&bob_addr, &new_bundle, b"hi again")
                .err(),
            Some(Error::IdentityKeyChanged)
        );

        // The collaborator re-verifies out of band, then accepts the key.
        alice
            .establisher
            .trust_identity(&bob_addr, &new_bundle.identity_key)
            .unwrap();

        let (mut alice_session, handshake) = alice
            .establisher
            .initiate_session(&bob_addr, &new_bundle, b"hi again")
            .unwrap();
        let (mut new_bob_session, plaintext) = new_bob
            .establisher
            .process_handshake(&alice_addr, &handshake)
            .unwrap();
        assert_eq!(plaintext, b"hi again");

        let reply = new_bob_session.encrypt(b"back online").unwrap();
        assert_eq!(alice_session.decrypt(&reply).unwrap(), b"back online");
    }

    #[test]
    fn test_sessions_with_different_peers_are_independent() {
        let alice = provision(ProtocolConfig::default());
        let bob = provision(ProtocolConfig::default());
        let carol = provision(ProtocolConfig::default());
        let alice_addr = PeerAddress::new("alice", 1);
        let bob_addr = PeerAddress::new("bob", 1);
        let carol_addr = PeerAddress::new("carol", 1);

        let bob_bundle = bob.establisher.pre_keys().public_bundle().unwrap();
        let carol_bundle = carol.establisher.pre_keys().public_bundle().unwrap();

        let (mut alice_bob, bob_handshake) = alice
            .establisher
            .initiate_session(&bob_addr, &bob_bundle, b"hey bob")
            .unwrap();
        let (mut alice_carol, carol_handshake) = alice
            .establisher
            .initiate_session(&carol_addr, &carol_bundle, b"hey carol")
            .unwrap();

        let (mut bob_session, bob_first) = bob
            .establisher
            .process_handshake(&alice_addr, &bob_handshake)
            .unwrap();
        let (mut carol_session, carol_first) = carol
            .establisher
            .process_handshake(&alice_addr, &carol_handshake)
            .unwrap();

        assert_eq!(bob_first, b"hey bob");
        assert_eq!(carol_first, b"hey carol");
        assert_ne!(alice_bob.session_id(), alice_carol.session_id());

        let bob_reply = bob_session.encrypt(b"bob here").unwrap();
        let carol_reply = carol_session.encrypt(b"carol here").unwrap();

        assert_eq!(alice_bob.decrypt(&bob_reply).unwrap(), b"bob here");
        assert_eq!(alice_carol.decrypt(&carol_reply).unwrap(), b"carol here");
    }
}
