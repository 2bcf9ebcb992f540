//! 跨節點快照比對
//!
//! 比對是諮詢性的，不構成分佈式共識。步驟：
//!
//! 1. 從原始 `snapshot` 對象重新計算快照 ID，與聲明的 `snapshotId` 比對
//! 2. 用文檔聲明的公鑰（非對稱）或配置的共享密鑰（HMAC）驗證簽名
//! 3. 檢查簽名密鑰是否屬於受信任的對等節點
//! 4. 按主體策略比對指紋：
//!    - 代碼集 `SHOULD_MATCH`：運行同一版本的節點應當一致，不一致一律標記
//!    - 賬本、報告集 `EXPECTED_TO_DIVERGE`：各節點歷史不同，只報告不標記

use crate::error::{IntegrityError, Result};
use crate::snapshot::{recompute_snapshot_id, SignedSnapshot};
use crate::types::{ComparisonPolicy, Digest, Fingerprint, Subject};
use serde::Serialize;
use serde_json::Value;
use snapshot_signer::SignatureAlgorithm;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// 受信任的對等節點
#[derive(Debug, Clone, Default)]
pub struct TrustedPeer {
    pub node_identity: String,
    /// Dilithium3 公鑰
    pub public_key: Option<Vec<u8>>,
    /// HMAC 共享密鑰
    pub shared_key: Option<Vec<u8>>,
}

/// 單個主體的比對結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectComparison {
    pub subject: Subject,
    pub policy: ComparisonPolicy,
    pub local_digest: Option<Digest>,
    pub peer_digest: Option<Digest>,
    pub equal: bool,
    /// 策略要求一致但不一致
    pub flagged: bool,
}

/// 比對結果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonResult {
    pub peer_node_identity: String,
    pub peer_snapshot_id: String,
    /// 快照 ID 與主體一致
    pub id_valid: bool,
    pub signature_valid: bool,
    /// 簽名密鑰屬於受信任的對等節點
    pub peer_trusted: bool,
    pub subjects: Vec<SubjectComparison>,
    /// ID 與簽名有效、對方受信任且沒有被標記的主體
    pub consistent: bool,
    pub issues: Vec<String>,
}

/// 比對對等節點的快照文檔與本地基線
///
/// # 錯誤
///
/// - `InvalidSnapshot`: 文檔結構無法解析
pub fn compare_snapshots(
    local: &BTreeMap<Subject, Fingerprint>,
    peer_document: &Value,
    trusted_peers: &[TrustedPeer],
) -> Result<ComparisonResult> {
    let mut issues = Vec::new();

    // 步驟 1: 快照 ID
    let block = peer_document
        .get("snapshot")
        .filter(|b| b.is_object())
        .ok_or_else(|| IntegrityError::InvalidSnapshot("missing snapshot object".to_string()))?;
    let recomputed = recompute_snapshot_id(block)?;

    let peer: SignedSnapshot = serde_json::from_value(peer_document.clone())
        .map_err(|e| IntegrityError::InvalidSnapshot(format!("Failed to parse peer snapshot: {}", e)))?;

    let id_valid = recomputed == peer.snapshot_id;
    if !id_valid {
        issues.push(format!(
            "snapshotId {} does not match recomputed {}",
            peer.snapshot_id, recomputed
        ));
    }

    // 步驟 2 & 3: 簽名與信任
    let trusted = trusted_peers
        .iter()
        .find(|p| p.node_identity == peer.snapshot.node_identity);
    if trusted.is_none() {
        issues.push(format!("node {} is not a trusted peer", peer.snapshot.node_identity));
    }

    let shared_key = trusted.and_then(|p| p.shared_key.as_deref());
    let signature_valid = match peer.verify_signature(shared_key) {
        Ok(valid) => valid,
        Err(e) => {
            issues.push(format!("signature could not be verified: {}", e));
            false
        }
    };
    if !signature_valid {
        issues.push("signature is not valid".to_string());
    }

    let peer_trusted = match (trusted, peer.signature.algorithm) {
        (Some(entry), SignatureAlgorithm::Dilithium3) => {
            let declared = peer.signature.public_key_bytes()?;
            let matches = declared.is_some() && entry.public_key.as_ref() == declared.as_ref();
            if !matches {
                issues.push("declared public key is not the trusted key for this node".to_string());
            }
            matches
        }
        (Some(entry), SignatureAlgorithm::HmacSha256) => entry.shared_key.is_some() && signature_valid,
        (None, _) => false,
    };

    // 步驟 4: 按主體比對
    let subjects: Vec<SubjectComparison> = Subject::ALL
        .into_iter()
        .map(|subject| {
            let local_digest = local.get(&subject).map(|f| f.digest);
            let peer_digest = peer.snapshot.fingerprints.get(&subject).map(|f| f.digest);
            let equal = local_digest.is_some() && local_digest == peer_digest;
            let policy = subject.peer_policy();
            SubjectComparison {
                subject,
                policy,
                local_digest,
                peer_digest,
                equal,
                flagged: policy == ComparisonPolicy::ShouldMatch && !equal,
            }
        })
        .collect();

    for s in subjects.iter().filter(|s| s.flagged) {
        issues.push(format!("{} differs from local baseline", s.subject));
    }

    let consistent = id_valid && signature_valid && peer_trusted && !subjects.iter().any(|s| s.flagged);

    if consistent {
        info!(
            peer = %peer.snapshot.node_identity,
            snapshot_id = %peer.snapshot_id,
            "Peer snapshot consistent with local baseline"
        );
    } else {
        warn!(
            peer = %peer.snapshot.node_identity,
            snapshot_id = %peer.snapshot_id,
            issues = ?issues,
            "Peer snapshot inconsistent"
        );
    }

    Ok(ComparisonResult {
        peer_node_identity: peer.snapshot.node_identity.clone(),
        peer_snapshot_id: peer.snapshot_id.clone(),
        id_valid,
        signature_valid,
        peer_trusted,
        subjects,
        consistent,
        issues,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::Keystore;
    use crate::snapshot::{ReportSigner, SnapshotBody};
    use crate::types::now;
    use tempfile::TempDir;

    fn fingerprints(code: u8, ledger: u8) -> BTreeMap<Subject, Fingerprint> {
        [(Subject::CodeSet, code), (Subject::Ledger, ledger), (Subject::ReportSet, 0)]
            .into_iter()
            .map(|(subject, byte)| {
                (
                    subject,
                    Fingerprint {
                        subject,
                        digest: Digest([byte; 32]),
                        computed_at: now(),
                        input_size: 1,
                    },
                )
            })
            .collect()
    }

    struct Peer {
        _dir: TempDir,
        signer: ReportSigner,
        trusted: TrustedPeer,
    }

    fn dilithium_peer() -> Peer {
        let dir = TempDir::new().unwrap();
        let keystore = Keystore::generate_and_save(dir.path(), SignatureAlgorithm::Dilithium3).unwrap();
        let trusted = TrustedPeer {
            node_identity: "peer-b".to_string(),
            public_key: keystore.public_key_bytes(),
            shared_key: None,
        };
        Peer {
            _dir: dir,
            signer: ReportSigner::new(keystore),
            trusted,
        }
    }

    fn document(peer: &Peer, fps: BTreeMap<Subject, Fingerprint>) -> Value {
        let signed = peer.signer.sign(SnapshotBody::compose("peer-b", fps, Vec::new())).unwrap();
        serde_json::to_value(&signed).unwrap()
    }

    #[test]
    fn test_matching_code_with_diverging_ledger_is_consistent() {
        let peer = dilithium_peer();
        let doc = document(&peer, fingerprints(1, 9));

        let result = compare_snapshots(&fingerprints(1, 2), &doc, &[peer.trusted.clone()]).unwrap();

        assert!(result.id_valid && result.signature_valid && result.peer_trusted);
        assert!(result.consistent, "issues: {:?}", result.issues);
        let ledger = result.subjects.iter().find(|s| s.subject == Subject::Ledger).unwrap();
        assert!(!ledger.equal);
        assert!(!ledger.flagged);
    }

    #[test]
    fn test_code_mismatch_is_flagged() {
        let peer = dilithium_peer();
        let doc = document(&peer, fingerprints(7, 2));

        let result = compare_snapshots(&fingerprints(1, 2), &doc, &[peer.trusted.clone()]).unwrap();

        assert!(!result.consistent);
        let code = result.subjects.iter().find(|s| s.subject == Subject::CodeSet).unwrap();
        assert!(code.flagged);
        assert_eq!(code.policy, ComparisonPolicy::ShouldMatch);
    }

    #[test]
    fn test_tampered_body_invalidates_id() {
        let peer = dilithium_peer();
        let mut doc = document(&peer, fingerprints(1, 2));
        doc["snapshot"]["fingerprints"]["CODE_SET"]["digest"] = Value::String("ab".repeat(32));

        let result = compare_snapshots(&fingerprints(1, 2), &doc, &[peer.trusted.clone()]).unwrap();

        assert!(!result.id_valid);
        assert!(!result.consistent);
    }

    #[test]
    fn test_untrusted_key_is_reported() {
        let peer = dilithium_peer();
        let impostor = dilithium_peer();
        let doc = document(&impostor, fingerprints(1, 2));

        let result = compare_snapshots(&fingerprints(1, 2), &doc, &[peer.trusted.clone()]).unwrap();

        assert!(result.signature_valid);
        assert!(!result.peer_trusted);
        assert!(!result.consistent);
    }

    #[test]
    fn test_hmac_peer_uses_shared_key() {
        let dir = TempDir::new().unwrap();
        let keystore = Keystore::generate_and_save(dir.path(), SignatureAlgorithm::HmacSha256).unwrap();
        let key = std::fs::read(dir.path().join("node_hmac.key")).unwrap();
        let signed = ReportSigner::new(keystore)
            .sign(SnapshotBody::compose("peer-b", fingerprints(1, 2), Vec::new()))
            .unwrap();
        let doc = serde_json::to_value(&signed).unwrap();

        let trusted = TrustedPeer {
            node_identity: "peer-b".to_string(),
            public_key: None,
            shared_key: Some(key),
        };
        let result = compare_snapshots(&fingerprints(1, 2), &doc, &[trusted]).unwrap();
        assert!(result.consistent, "issues: {:?}", result.issues);

        let unknown = compare_snapshots(&fingerprints(1, 2), &doc, &[]).unwrap();
        assert!(!unknown.signature_valid);
        assert!(!unknown.consistent);
    }

    #[test]
    fn test_malformed_document() {
        let result = compare_snapshots(&BTreeMap::new(), &serde_json::json!({"snapshotId": "x"}), &[]);
        assert!(matches!(result, Err(IntegrityError::InvalidSnapshot(_))));
    }
}
