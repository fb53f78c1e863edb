//! Full roundtrip integration smoke test for veilbox-crypto.
//!
//! Exercises the complete flow between two parties: device key provisioning
//! in encrypted databases, key publication, hybrid encryption of text and
//! media, tamper detection, and SAS verification.

use std::sync::Arc;

use veilbox_crypto::device_keys::{DeviceKeyStore, KeyConsistency, KeyProvisioning};
use veilbox_crypto::directory::{InMemoryKeyDirectory, KeyDirectoryClient, KeySelector};
use veilbox_crypto::engine;
use veilbox_crypto::envelope::{Envelope, WireEnvelope};
use veilbox_crypto::error::CryptoError;
use veilbox_crypto::media::{MediaAdapter, ObjectBlobStore, TextAdapter};
use veilbox_crypto::sas::{self, EMOJI_ALPHABET};
use veilbox_crypto::storage::peer_keys::PeerKeyCache;
use veilbox_crypto::storage::unlock::{generate_salt, open_key_database, Unlock};
use veilbox_crypto::storage::SharedConnection;
use veilbox_crypto::verification::VerificationState;
use veilbox_shared::ids::{DeviceId, UserId};

/// An encrypted on-disk key database unlocked with a passphrase.
fn open_db(dir: &tempfile::TempDir, name: &str) -> SharedConnection {
    let salt = generate_salt().unwrap();
    open_key_database(
        &dir.path().join(name),
        Unlock::Passphrase {
            passphrase: "correct horse battery staple",
            salt: &salt,
        },
    )
    .unwrap()
}

#[tokio::test]
async fn full_roundtrip_alice_bob() {
    let dir = tempfile::tempdir().unwrap();
    let directory = Arc::new(InMemoryKeyDirectory::new());

    // -- Setup: two devices, each with its own database --
    let (alice, alice_device) = (UserId::new(), DeviceId::new());
    let (bob, bob_device) = (UserId::new(), DeviceId::new());
    let alice_db = open_db(&dir, "alice.db");
    let alice_store = DeviceKeyStore::new(alice_db.clone());
    let bob_store = DeviceKeyStore::new(open_db(&dir, "bob.db"));

    let (alice_keys, outcome) = alice_store
        .get_or_create_key_pair_with_outcome(&alice_device)
        .unwrap();
    assert_eq!(outcome, KeyProvisioning::Created);
    let bob_keys = bob_store.get_or_create_key_pair(&bob_device).unwrap();
    assert_eq!(
        bob_store.verify_consistency(&bob_device).unwrap(),
        KeyConsistency::Consistent
    );

    // -- Bob publishes; Alice fetches and tracks --
    let bob_client = KeyDirectoryClient::new(directory.clone(), bob);
    bob_client.publish_device_key(&bob_store, &bob_device).await.unwrap();

    let alice_client =
        KeyDirectoryClient::new(directory, alice).with_cache(PeerKeyCache::new(alice_db));
    let tracked = alice_client
        .fetch_and_track(&bob, KeySelector::Latest, &alice_keys.public)
        .await
        .unwrap();
    assert_eq!(tracked.record.public_key, bob_keys.public);

    // -- Alice encrypts "hello"; Bob decrypts it --
    let envelope = Envelope::from(engine::encrypt(b"hello", &tracked.record.public_key).unwrap());
    let plaintext = engine::decrypt(&envelope, &bob_keys.secret).unwrap();
    assert_eq!(plaintext.as_slice(), b"hello");

    // -- A third party alters the last ciphertext byte --
    let mut wire = WireEnvelope::try_from(&envelope).unwrap();
    let mut ciphertext = base64_decode(&wire.ciphertext);
    let last = ciphertext.len() - 1;
    ciphertext[last] ^= 0xFF;
    wire.ciphertext = base64_encode(&ciphertext);
    let tampered = Envelope::try_from(wire).unwrap();
    assert!(matches!(
        engine::decrypt(&tampered, &bob_keys.secret),
        Err(CryptoError::ContentAuthenticationFailed)
    ));

    // -- Text and audio through the adapters --
    let text = TextAdapter::encrypt("see you at 8", &tracked.record).unwrap();
    assert_eq!(text.recipient_key_record_id, Some(tracked.record.record_id));
    assert_eq!(
        TextAdapter::decrypt(&text, &bob_keys.secret).unwrap().as_str(),
        "see you at 8"
    );

    let audio = MediaAdapter::audio(Arc::new(ObjectBlobStore::in_memory()));
    let clip = vec![0xA5u8; 64 * 1024];
    let metadata = audio.encrypt_bytes(&clip, &tracked.record).await.unwrap();
    let sink = dir.path().join("clip.opus");
    assert_eq!(
        audio.decrypt_to_file(&metadata, &bob_keys.secret, &sink).await.unwrap(),
        clip.len() as u64
    );
    assert_eq!(std::fs::read(&sink).unwrap(), clip);

    // -- Both sides derive the same SAS and Alice marks Bob verified --
    let alice_view = sas::derive_fingerprint(&alice_keys.public, &bob_keys.public, Some("session-42"));
    let bob_view = sas::derive_fingerprint(&bob_keys.public, &alice_keys.public, Some("session-42"));
    assert_eq!(alice_view.symbols(), bob_view.symbols());
    assert_eq!(alice_view.len(), 5);
    assert!(alice_view.symbols().iter().all(|s| EMOJI_ALPHABET.contains(s)));

    let cache = PeerKeyCache::new(
        SharedConnection::new(rusqlite::Connection::open_in_memory().unwrap()).unwrap(),
    );
    cache.observe(&tracked.record, &alice_keys.public).unwrap();
    assert_eq!(
        cache
            .confirm_verification(&bob, &bob_device, &alice_view)
            .unwrap(),
        VerificationState::Verified
    );
}

#[test]
fn legacy_envelope_from_wire_is_rejected() {
    let bob = veilbox_crypto::primitives::KeyPair::generate().unwrap();
    let json = r#"{"ciphertext":"AAAAAAAAAAAAAAAAAAAAAA==","wrappedKey":"","version":2}"#;
    let envelope = Envelope::from_json(json).unwrap();
    assert!(matches!(
        engine::decrypt(&envelope, &bob.secret),
        Err(CryptoError::UnsupportedLegacyVersion { version: 2 })
    ));
}

#[test]
fn device_keys_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys.db");
    let salt = generate_salt().unwrap();
    let device = DeviceId::new();
    let unlock = || Unlock::Passphrase {
        passphrase: "pw",
        salt: &salt,
    };

    let first = DeviceKeyStore::new(open_key_database(&path, unlock()).unwrap())
        .get_or_create_key_pair(&device)
        .unwrap();
    let (second, outcome) = DeviceKeyStore::new(open_key_database(&path, unlock()).unwrap())
        .get_or_create_key_pair_with_outcome(&device)
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(outcome, KeyProvisioning::Existing);
}

fn base64_decode(s: &str) -> Vec<u8> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(s).unwrap()
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
