//! Tests for the shard cipher and the log token hash

use shardkv::crypto::{keyed_hash, Cipher, Envelope};

#[test]
fn test_encrypt_decrypt() {
    let cipher = Cipher::new("secret").unwrap();

    let envelope = cipher.encrypt(r#"{"a":1}"#).unwrap();

    assert_eq!(envelope.iv.len(), 24);
    assert_ne!(envelope.data, r#"{"a":1}"#);
    assert_eq!(cipher.decrypt(&envelope).unwrap(), r#"{"a":1}"#);
}

#[test]
fn test_nonce_differs_per_envelope() {
    let cipher = Cipher::new("secret").unwrap();

    let first = cipher.encrypt("same").unwrap();
    let second = cipher.encrypt("same").unwrap();

    assert_ne!(first.iv, second.iv);
    assert_ne!(first.data, second.data);
}

#[test]
fn test_wrong_key_fails() {
    let sealed = Cipher::new("secret").unwrap().seal("payload").unwrap();

    assert!(Cipher::new("other").unwrap().open(&sealed).is_err());
}

#[test]
fn test_tampered_envelope_fails() {
    let cipher = Cipher::new("secret").unwrap();
    let mut envelope = cipher.encrypt("payload").unwrap();
    envelope.iv = "00".to_string();

    assert!(cipher.decrypt(&envelope).is_err());
    assert!(cipher.open("not json").is_err());
}

#[test]
fn test_seal_writes_json_envelope() {
    let cipher = Cipher::new("secret").unwrap();

    let sealed = cipher.seal("payload").unwrap();
    let envelope: Envelope = serde_json::from_str(&sealed).unwrap();

    assert!(hex::decode(&envelope.data).is_ok());
    assert_eq!(cipher.open(&sealed).unwrap(), "payload");
}

#[test]
fn test_keyed_hash() {
    let key = b"hash-key";
    let iv = [7_u8; 16];

    let token = keyed_hash("SET a", key, &iv).unwrap();

    assert_eq!(token.len(), 64);
    assert_eq!(token, keyed_hash("SET a", key, &iv).unwrap());
    assert_ne!(token, keyed_hash("SET b", key, &iv).unwrap());
    assert_ne!(token, keyed_hash("SET a", b"other-key", &iv).unwrap());
    assert_ne!(token, keyed_hash("SET a", key, &[8_u8; 16]).unwrap());
}
