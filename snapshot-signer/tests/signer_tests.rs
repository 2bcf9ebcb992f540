//! 快照簽名庫集成測試

use snapshot_signer::{verifier_for, Dilithium3Signer, HmacSha256Signer, SignatureAlgorithm, Signer};

#[test]
fn test_peer_verifies_with_public_key_only() {
    // 1. 節點 A 簽名快照 ID
    let node_a = Dilithium3Signer::generate();
    let snapshot_id = b"9b74c9897bac770ffc029102a200c5de6b5a8f5f1c0e6c0b4a3f2e1d0c9b8a79";
    let signature = node_a.sign(snapshot_id).unwrap();

    // 2. 節點 B 只持有 A 的公鑰
    let verifier = verifier_for(
        SignatureAlgorithm::Dilithium3,
        Some(node_a.public_key_bytes()),
        None,
    )
    .unwrap();

    assert!(verifier.verify(snapshot_id, &signature).unwrap());

    // 3. 篡改檢測
    assert!(!verifier.verify(b"another-snapshot-id", &signature).unwrap());
}

#[test]
fn test_foreign_key_rejects_signature() {
    let node_a = Dilithium3Signer::generate();
    let node_b = Dilithium3Signer::generate();

    let signature = node_a.sign(b"id").unwrap();
    assert!(!node_b.verify(b"id", &signature).unwrap());
}

#[test]
fn test_shared_key_verification() {
    let signer = HmacSha256Signer::generate();
    let signature = signer.sign(b"id").unwrap();

    let verifier = verifier_for(SignatureAlgorithm::HmacSha256, None, Some(signer.key_bytes())).unwrap();
    assert!(verifier.verify(b"id", &signature).unwrap());
    assert!(verifier.public_key().is_none());
}

#[test]
fn test_algorithm_serialization() {
    let json = serde_json::to_string(&SignatureAlgorithm::HmacSha256).unwrap();
    assert_eq!(json, "\"HMAC_SHA256\"");

    let parsed: SignatureAlgorithm = serde_json::from_str("\"DILITHIUM3\"").unwrap();
    assert_eq!(parsed, SignatureAlgorithm::Dilithium3);
}
