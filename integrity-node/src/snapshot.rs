//! 審計快照組裝與簽名模組
//!
//! # 文檔結構
//!
//! ```text
//! {
//!   "snapshotId": hex(SHA256(canonical(snapshot))),
//!   "snapshot":  { fingerprints, openAlerts, nodeIdentity, generatedAt },
//!   "signature": { algorithm, signature, publicKey, signedAt }
//! }
//! ```
//!
//! # 簽名流程
//!
//! ```text
//! Baseline 指紋 + 打開的告警（鎖內複製）
//!     ↓
//! SnapshotBody（鎖外）
//!     ↓
//! 規範化 JSON（鍵排序、無空白）→ SHA-256 → snapshotId
//!     ↓
//! 對 snapshotId 的 UTF-8 字節簽名
//!     ↓
//! SignedSnapshot
//! ```
//!
//! 任何審計方都可以取出 `snapshot` 對象，按相同規則序列化並哈希，
//! 與 `snapshotId` 比對，無需信任本節點。

use crate::alerts::Alert;
use crate::crypto::{canonical_json, sha256, sha256_parts};
use crate::error::{IntegrityError, Result};
use crate::keystore::Keystore;
use crate::types::{now, Digest, Fingerprint, Subject};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snapshot_signer::{verifier_for, SignatureAlgorithm};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// 快照主體（被哈希的部分）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotBody {
    pub fingerprints: BTreeMap<Subject, Fingerprint>,
    /// 按告警 ID 排序
    pub open_alerts: Vec<Alert>,
    pub node_identity: String,
    pub generated_at: DateTime<Utc>,
}

impl SnapshotBody {
    /// 組裝快照主體
    ///
    /// 調用方在狀態鎖內複製基線指紋和打開的告警，鎖外調用本函數
    pub fn compose(
        node_identity: &str,
        fingerprints: BTreeMap<Subject, Fingerprint>,
        mut open_alerts: Vec<Alert>,
    ) -> Self {
        open_alerts.sort_by_key(|a| a.id);
        Self {
            fingerprints,
            open_alerts,
            node_identity: node_identity.to_string(),
            generated_at: now(),
        }
    }

    /// 計算快照 ID
    pub fn snapshot_id(&self) -> Result<String> {
        Ok(sha256(canonical_json(self)?.as_bytes()).to_hex())
    }
}

/// 從原始 `snapshot` JSON 對象重新計算快照 ID
///
/// 驗證對等節點文檔時使用原始值，不經過本地類型的重新序列化
pub fn recompute_snapshot_id(snapshot_block: &Value) -> Result<String> {
    Ok(sha256(canonical_json(snapshot_block)?.as_bytes()).to_hex())
}

/// 簽名塊
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureBlock {
    pub algorithm: SignatureAlgorithm,
    /// Base64 編碼的分離式簽名
    pub signature: String,
    /// Base64 編碼的公鑰（僅非對稱算法）
    pub public_key: Option<String>,
    pub signed_at: DateTime<Utc>,
}

impl SignatureBlock {
    pub fn signature_bytes(&self) -> Result<Vec<u8>> {
        general_purpose::STANDARD
            .decode(&self.signature)
            .map_err(|e| IntegrityError::InvalidSnapshot(format!("Failed to decode signature: {}", e)))
    }

    pub fn public_key_bytes(&self) -> Result<Option<Vec<u8>>> {
        self.public_key
            .as_ref()
            .map(|pk| {
                general_purpose::STANDARD.decode(pk).map_err(|e| {
                    IntegrityError::InvalidSnapshot(format!("Failed to decode public key: {}", e))
                })
            })
            .transpose()
    }
}

/// 已簽名的審計快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedSnapshot {
    pub snapshot_id: String,
    pub snapshot: SnapshotBody,
    pub signature: SignatureBlock,
}

impl SignedSnapshot {
    /// 快照 ID 是否與主體一致
    pub fn verify_id(&self) -> Result<bool> {
        Ok(self.snapshot.snapshot_id()? == self.snapshot_id)
    }

    /// 驗證簽名
    ///
    /// # 參數
    ///
    /// - `shared_key`: HMAC 快照需要的共享密鑰；非對稱算法使用文檔中的公鑰
    ///
    /// # 返回
    ///
    /// - `Ok(true)`: 簽名有效
    /// - `Ok(false)`: 簽名無效
    /// - `Err`: 缺少密鑰材料或編碼錯誤
    pub fn verify_signature(&self, shared_key: Option<&[u8]>) -> Result<bool> {
        let signature = self.signature.signature_bytes()?;
        let public_key = self.signature.public_key_bytes()?;
        let verifier = verifier_for(self.signature.algorithm, public_key.as_deref(), shared_key)?;
        Ok(verifier.verify(self.snapshot_id.as_bytes(), &signature)?)
    }

    /// 報告集滾動摘要的條目：`SHA256(snapshotId || signature)`
    pub fn item_digest(&self) -> Digest {
        sha256_parts(&[self.snapshot_id.as_bytes(), self.signature.signature.as_bytes()])
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| IntegrityError::Serialization(format!("Failed to serialize snapshot: {}", e)))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| IntegrityError::InvalidSnapshot(format!("Failed to parse snapshot: {}", e)))
    }
}

/// 報告簽名器
///
/// 密鑰不可用時仍可構造，此時每次簽名都返回 `SigningFailure`，
/// 監控與告警照常運行，只是不發布新快照。
pub struct ReportSigner {
    keystore: std::result::Result<Keystore, String>,
}

impl ReportSigner {
    pub fn new(keystore: Keystore) -> Self {
        Self { keystore: Ok(keystore) }
    }

    /// 沒有可用密鑰的簽名器
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            keystore: Err(reason.into()),
        }
    }

    pub fn is_available(&self) -> bool {
        self.keystore.is_ok()
    }

    pub fn algorithm(&self) -> Option<SignatureAlgorithm> {
        self.keystore.as_ref().ok().map(|k| k.algorithm())
    }

    /// Base64 公鑰（僅非對稱算法）
    pub fn public_key_base64(&self) -> Option<String> {
        self.keystore
            .as_ref()
            .ok()
            .and_then(|k| k.public_key_bytes())
            .map(|pk| general_purpose::STANDARD.encode(pk))
    }

    /// 本節點簽名的驗證材料；密鑰不可用時為 `None`
    pub fn trust(&self) -> Option<NodeTrust> {
        self.keystore.as_ref().ok().map(NodeTrust::from_keystore)
    }

    /// 計算快照 ID 並附加分離式簽名
    pub fn sign(&self, body: SnapshotBody) -> Result<SignedSnapshot> {
        let keystore = self
            .keystore
            .as_ref()
            .map_err(|reason| IntegrityError::SigningFailure(format!("signing key unavailable: {}", reason)))?;

        let snapshot_id = body.snapshot_id()?;
        debug!(snapshot_id = %snapshot_id, "Computed snapshot id");

        let signer = keystore.signer();
        let signature = signer.sign(snapshot_id.as_bytes())?;

        info!(
            snapshot_id = %snapshot_id,
            algorithm = %signer.algorithm(),
            signature_len = signature.len(),
            "Snapshot signed"
        );

        Ok(SignedSnapshot {
            snapshot_id,
            snapshot: body,
            signature: SignatureBlock {
                algorithm: signer.algorithm(),
                signature: general_purpose::STANDARD.encode(&signature),
                public_key: signer.public_key().map(|pk| general_purpose::STANDARD.encode(pk)),
                signed_at: now(),
            },
        })
    }
}

/// 本節點的驗證密鑰
///
/// 與 `SignedSnapshot::verify_signature` 不同，這裡不信任文檔自帶的公鑰：
/// 只有用本節點密鑰簽名的快照才算有效
#[derive(Clone)]
pub struct NodeTrust {
    algorithm: SignatureAlgorithm,
    public_key: Option<Vec<u8>>,
    shared_key: Option<Vec<u8>>,
}

impl NodeTrust {
    pub fn from_keystore(keystore: &Keystore) -> Self {
        Self {
            algorithm: keystore.algorithm(),
            public_key: keystore.public_key_bytes(),
            shared_key: keystore.shared_key_bytes(),
        }
    }

    /// 快照是否由本節點密鑰簽名
    pub fn verify(&self, snapshot: &SignedSnapshot) -> Result<bool> {
        if snapshot.signature.algorithm != self.algorithm {
            return Ok(false);
        }
        if self.algorithm.is_asymmetric() && snapshot.signature.public_key_bytes()? != self.public_key {
            return Ok(false);
        }
        snapshot.verify_signature(self.shared_key.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Digest;
    use tempfile::TempDir;

    fn body() -> SnapshotBody {
        let mut fingerprints = BTreeMap::new();
        for (i, subject) in Subject::ALL.into_iter().enumerate() {
            fingerprints.insert(
                subject,
                Fingerprint {
                    subject,
                    digest: Digest([i as u8; 32]),
                    computed_at: now(),
                    input_size: i as u64,
                },
            );
        }
        SnapshotBody::compose("node-a", fingerprints, Vec::new())
    }

    fn signer(algorithm: SignatureAlgorithm) -> (TempDir, ReportSigner) {
        let temp_dir = TempDir::new().unwrap();
        let keystore = Keystore::generate_and_save(temp_dir.path(), algorithm).unwrap();
        (temp_dir, ReportSigner::new(keystore))
    }

    #[test]
    fn test_snapshot_id_reproducible_from_raw_document() {
        let (_dir, signer) = signer(SignatureAlgorithm::Dilithium3);
        let signed = signer.sign(body()).unwrap();

        // 1. 序列化為文檔
        let json = signed.to_json().unwrap();

        // 2. 審計方只處理原始 JSON
        let raw: Value = serde_json::from_str(&json).unwrap();
        let recomputed = recompute_snapshot_id(&raw["snapshot"]).unwrap();
        assert_eq!(recomputed, signed.snapshot_id);

        // 3. 類型化解析後結果相同
        let parsed = SignedSnapshot::from_json(&json).unwrap();
        assert!(parsed.verify_id().unwrap());
        assert!(parsed.verify_signature(None).unwrap());
    }

    #[test]
    fn test_tampered_body_fails_id_check() {
        let (_dir, signer) = signer(SignatureAlgorithm::Dilithium3);
        let mut signed = signer.sign(body()).unwrap();

        signed.snapshot.node_identity = "node-b".to_string();
        assert!(!signed.verify_id().unwrap());
    }

    #[test]
    fn test_hmac_snapshot_requires_shared_key() {
        let temp_dir = TempDir::new().unwrap();
        let keystore = Keystore::generate_and_save(temp_dir.path(), SignatureAlgorithm::HmacSha256).unwrap();
        let key = std::fs::read(temp_dir.path().join("node_hmac.key")).unwrap();
        let signed = ReportSigner::new(keystore).sign(body()).unwrap();

        assert!(signed.signature.public_key.is_none());
        assert!(signed.verify_signature(None).is_err());
        assert!(signed.verify_signature(Some(key.as_slice())).unwrap());
        assert!(!signed.verify_signature(Some(&[7u8; 32][..])).unwrap());
    }

    #[test]
    fn test_node_trust_rejects_foreign_key() {
        let (_own_dir, own) = signer(SignatureAlgorithm::Dilithium3);
        let (_other_dir, other) = signer(SignatureAlgorithm::Dilithium3);
        let trust = own.trust().unwrap();

        assert!(trust.verify(&own.sign(body()).unwrap()).unwrap());

        // 自洽的外來快照：ID 與簽名都對得上自帶的公鑰
        let foreign = other.sign(body()).unwrap();
        assert!(foreign.verify_id().unwrap());
        assert!(foreign.verify_signature(None).unwrap());
        assert!(!trust.verify(&foreign).unwrap());
    }

    #[test]
    fn test_node_trust_with_shared_key() {
        let (_own_dir, own) = signer(SignatureAlgorithm::HmacSha256);
        let (_other_dir, other) = signer(SignatureAlgorithm::HmacSha256);
        let trust = own.trust().unwrap();

        assert!(trust.verify(&own.sign(body()).unwrap()).unwrap());
        assert!(!trust.verify(&other.sign(body()).unwrap()).unwrap());
        assert!(ReportSigner::unavailable("none").trust().is_none());
    }

    #[test]
    fn test_unavailable_signer() {
        let signer = ReportSigner::unavailable("no key material");
        assert!(!signer.is_available());
        assert!(matches!(
            signer.sign(body()),
            Err(IntegrityError::SigningFailure(msg)) if msg.contains("no key material")
        ));
    }

    #[test]
    fn test_open_alerts_sorted_by_id() {
        use crate::alerts::AlertBook;

        let mut book = AlertBook::new();
        book.apply(&book.plan_mismatch(Subject::Ledger, Digest([1; 32]), Digest([2; 32]), now()));
        book.apply(&book.plan_mismatch(Subject::CodeSet, Digest([1; 32]), Digest([3; 32]), now()));

        let mut alerts = book.open_alerts();
        alerts.reverse();
        let composed = SnapshotBody::compose("node-a", BTreeMap::new(), alerts);
        let ids: Vec<_> = composed.open_alerts.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }
}
