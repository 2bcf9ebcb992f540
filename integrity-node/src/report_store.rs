//! 快照歷史存儲
//!
//! 每次生成的簽名快照都以新文件追加，從不覆蓋或刪除：
//!
//! ```text
//! {state_dir}/reports/
//!   ├── 00000001-<snapshotId>.json
//!   ├── 00000002-<snapshotId>.json
//!   └── ...
//! ```
//!
//! 內存中保留已發布快照供並發讀取；報告集指紋則直接從磁盤讀取，
//! 所以對文件的改寫、刪除或插入都會在採集時被發現。
//!
//! 從磁盤讀出的每份報告都要通過 ID 校驗，並且必須由本節點密鑰簽名。

use crate::crypto::AppendOnlyLog;
use crate::error::{IntegrityError, Result};
use crate::snapshot::{NodeTrust, SignedSnapshot};
use crate::types::{Digest, Subject};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::info;

/// 只追加的快照歷史
pub struct SnapshotStore {
    history: RwLock<Vec<Arc<SignedSnapshot>>>,
    dir: Option<PathBuf>,
    trust: Option<NodeTrust>,
}

impl SnapshotStore {
    /// 內存存儲（不持久化）
    pub fn in_memory() -> Self {
        Self {
            history: RwLock::new(Vec::new()),
            dir: None,
            trust: None,
        }
    }

    /// 打開報告目錄並加載已有快照
    ///
    /// # 參數
    ///
    /// - `trust`: 本節點的驗證密鑰；`None`（密鑰不可用）時只校驗 ID
    ///
    /// # 錯誤
    ///
    /// 任何一份報告與其 ID 不符或不是本節點簽名時返回 `Journal`
    pub fn open(dir: &Path, trust: Option<NodeTrust>) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let mut history = Vec::new();
        for (position, path) in list_reports(dir)?.into_iter().enumerate() {
            let snapshot = read_report(&path, position as u64)?;
            verify_stored(&snapshot, &path, trust.as_ref())
                .map_err(|reason| IntegrityError::Journal(format!("Refusing snapshot history: {}", reason)))?;
            history.push(Arc::new(snapshot));
        }

        info!(dir = ?dir, snapshots = history.len(), "Snapshot history loaded");

        Ok(Self {
            history: RwLock::new(history),
            dir: Some(dir.to_path_buf()),
            trust,
        })
    }

    /// 發布新快照（追加到歷史末尾）
    pub fn publish(&self, snapshot: SignedSnapshot) -> Result<Arc<SignedSnapshot>> {
        let mut history = self
            .history
            .write()
            .map_err(|_| IntegrityError::Journal("snapshot history lock poisoned".to_string()))?;

        let seq = history.len() as u64 + 1;
        if let Some(dir) = &self.dir {
            let path = dir.join(report_file_name(seq, &snapshot.snapshot_id));
            let json = snapshot.to_json()?;
            // create_new: 已存在的報告絕不覆蓋
            let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
            file.write_all(json.as_bytes())?;
            file.sync_data()?;
        }

        let snapshot = Arc::new(snapshot);
        history.push(snapshot.clone());
        info!(seq, snapshot_id = %snapshot.snapshot_id, "Snapshot published");
        Ok(snapshot)
    }

    /// 最新快照
    pub fn latest(&self) -> Option<Arc<SignedSnapshot>> {
        self.history.read().ok().and_then(|h| h.last().cloned())
    }

    /// 已發布快照數
    pub fn count(&self) -> usize {
        self.history.read().map(|h| h.len()).unwrap_or(0)
    }

    /// 全部歷史（按發布順序）
    pub fn history(&self) -> Vec<Arc<SignedSnapshot>> {
        self.history.read().map(|h| h.clone()).unwrap_or_default()
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }
}

impl AppendOnlyLog for SnapshotStore {
    fn len(&self) -> Result<u64> {
        match &self.dir {
            Some(dir) => Ok(list_reports(dir).map_err(collection_error)?.len() as u64),
            None => Ok(self.count() as u64),
        }
    }

    fn item_digests(&self, start: u64, end: u64) -> Result<Vec<Digest>> {
        match &self.dir {
            Some(dir) => {
                let files = list_reports(dir).map_err(collection_error)?;
                let end = (end as usize).min(files.len());
                let start = (start as usize).min(end);

                files[start..end]
                    .iter()
                    .enumerate()
                    .map(|(offset, path)| {
                        let snapshot =
                            read_report(path, (start + offset) as u64).map_err(collection_error)?;
                        verify_stored(&snapshot, path, self.trust.as_ref()).map_err(|reason| {
                            IntegrityError::Collection {
                                subject: Subject::ReportSet,
                                reason,
                            }
                        })?;
                        Ok(snapshot.item_digest())
                    })
                    .collect()
            }
            None => {
                let history = self
                    .history
                    .read()
                    .map_err(|_| IntegrityError::Journal("snapshot history lock poisoned".to_string()))?;
                let end = (end as usize).min(history.len());
                let start = (start as usize).min(end);
                Ok(history[start..end].iter().map(|s| s.item_digest()).collect())
            }
        }
    }
}

fn collection_error(err: IntegrityError) -> IntegrityError {
    match err {
        IntegrityError::Collection { .. } => err,
        other => IntegrityError::Collection {
            subject: Subject::ReportSet,
            reason: other.to_string(),
        },
    }
}

/// 校驗磁盤上的報告：ID 與主體一致，且由本節點密鑰簽名
fn verify_stored(
    snapshot: &SignedSnapshot,
    path: &Path,
    trust: Option<&NodeTrust>,
) -> std::result::Result<(), String> {
    match snapshot.verify_id() {
        Ok(true) => {}
        Ok(false) => return Err(format!("report {:?} does not match its snapshot id", path)),
        Err(e) => return Err(format!("report {:?}: {}", path, e)),
    }
    match trust.map(|t| t.verify(snapshot)) {
        None | Some(Ok(true)) => Ok(()),
        Some(Ok(false)) => Err(format!("report {:?} is not signed by this node", path)),
        Some(Err(e)) => Err(format!("report {:?}: {}", path, e)),
    }
}

fn report_file_name(seq: u64, snapshot_id: &str) -> String {
    format!("{:08}-{}.json", seq, snapshot_id)
}

/// 按文件名排序的報告文件
fn list_reports(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// 讀取位置 `position`（從 0 開始）上的報告並校驗文件名
fn read_report(path: &Path, position: u64) -> Result<SignedSnapshot> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| IntegrityError::Journal(format!("invalid report file name: {:?}", path)))?;
    let json = fs::read_to_string(path)?;
    let snapshot = SignedSnapshot::from_json(&json)?;

    let expected = report_file_name(position + 1, &snapshot.snapshot_id);
    if name != expected {
        return Err(IntegrityError::Journal(format!(
            "report {} is out of sequence (expected {})",
            name, expected
        )));
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::RollingDigest;
    use crate::keystore::Keystore;
    use crate::snapshot::{ReportSigner, SnapshotBody};
    use snapshot_signer::SignatureAlgorithm;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn signed(signer: &ReportSigner, node: &str) -> SignedSnapshot {
        signer
            .sign(SnapshotBody::compose(node, BTreeMap::new(), Vec::new()))
            .unwrap()
    }

    fn hmac_signer(dir: &Path) -> ReportSigner {
        ReportSigner::new(Keystore::generate_and_save(dir, SignatureAlgorithm::HmacSha256).unwrap())
    }

    #[test]
    fn test_publish_appends_and_reloads() {
        let temp_dir = TempDir::new().unwrap();
        let signer = hmac_signer(&temp_dir.path().join("keys"));
        let reports = temp_dir.path().join("reports");

        let store = SnapshotStore::open(&reports, signer.trust()).unwrap();
        let first = store.publish(signed(&signer, "a")).unwrap();
        let second = store.publish(signed(&signer, "b")).unwrap();
        assert_eq!(store.latest().unwrap().snapshot_id, second.snapshot_id);

        let reopened = SnapshotStore::open(&reports, signer.trust()).unwrap();
        let ids: Vec<_> = reopened.history().iter().map(|s| s.snapshot_id.clone()).collect();
        assert_eq!(ids, vec![first.snapshot_id.clone(), second.snapshot_id.clone()]);
    }

    #[test]
    fn test_history_growth_keeps_anchor() {
        let temp_dir = TempDir::new().unwrap();
        let signer = hmac_signer(&temp_dir.path().join("keys"));
        let store = SnapshotStore::open(&temp_dir.path().join("reports"), signer.trust()).unwrap();
        let mut rolling = RollingDigest::new(0);

        store.publish(signed(&signer, "a")).unwrap();
        let before = rolling.observe(&store, Some(1)).unwrap();

        store.publish(signed(&signer, "b")).unwrap();
        let after = rolling.observe(&store, Some(1)).unwrap();

        assert_eq!(after.len, 2);
        assert_eq!(after.anchor, before.anchor);
    }

    #[test]
    fn test_tampered_report_is_collection_error() {
        let temp_dir = TempDir::new().unwrap();
        let signer = hmac_signer(&temp_dir.path().join("keys"));
        let reports = temp_dir.path().join("reports");
        let store = SnapshotStore::open(&reports, signer.trust()).unwrap();
        let published = store.publish(signed(&signer, "a")).unwrap();

        // 改寫報告主體但保留文件名
        let path = reports.join(report_file_name(1, &published.snapshot_id));
        let tampered = fs::read_to_string(&path).unwrap().replace("\"a\"", "\"z\"");
        fs::write(&path, tampered).unwrap();

        let mut rolling = RollingDigest::new(0);
        assert!(matches!(
            rolling.observe(&store, Some(1)),
            Err(IntegrityError::Collection { subject: Subject::ReportSet, .. })
        ));
    }

    #[test]
    fn test_deleted_report_changes_anchor() {
        let temp_dir = TempDir::new().unwrap();
        let signer = hmac_signer(&temp_dir.path().join("keys"));
        let reports = temp_dir.path().join("reports");
        let store = SnapshotStore::open(&reports, signer.trust()).unwrap();
        let mut rolling = RollingDigest::new(0);

        store.publish(signed(&signer, "a")).unwrap();
        let last = store.publish(signed(&signer, "b")).unwrap();
        let before = rolling.observe(&store, Some(2)).unwrap();

        fs::remove_file(reports.join(report_file_name(2, &last.snapshot_id))).unwrap();
        let after = rolling.observe(&store, Some(2)).unwrap();

        assert_ne!(after.anchor, before.anchor);
    }

    #[test]
    fn test_reopen_rejects_tampered_report() {
        let temp_dir = TempDir::new().unwrap();
        let signer = hmac_signer(&temp_dir.path().join("keys"));
        let reports = temp_dir.path().join("reports");
        let store = SnapshotStore::open(&reports, signer.trust()).unwrap();
        let published = store.publish(signed(&signer, "a")).unwrap();

        let path = reports.join(report_file_name(1, &published.snapshot_id));
        let tampered = fs::read_to_string(&path).unwrap().replace("\"a\"", "\"z\"");
        fs::write(&path, tampered).unwrap();

        assert!(matches!(
            SnapshotStore::open(&reports, signer.trust()),
            Err(IntegrityError::Journal(_))
        ));
    }

    #[test]
    fn test_report_signed_by_other_key_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let signer = hmac_signer(&temp_dir.path().join("keys"));
        let forger = hmac_signer(&temp_dir.path().join("forged-keys"));
        let reports = temp_dir.path().join("reports");
        let store = SnapshotStore::open(&reports, signer.trust()).unwrap();
        let genuine = store.publish(signed(&signer, "a")).unwrap();

        let mut rolling = RollingDigest::new(0);
        rolling.observe(&store, Some(1)).unwrap();

        // 用另一把密鑰生成自洽的報告並替換原文件
        let forged = signed(&forger, "a");
        assert!(forged.verify_id().unwrap());
        fs::remove_file(reports.join(report_file_name(1, &genuine.snapshot_id))).unwrap();
        fs::write(
            reports.join(report_file_name(1, &forged.snapshot_id)),
            forged.to_json().unwrap(),
        )
        .unwrap();

        let mut rebuilt = RollingDigest::new(0);
        assert!(matches!(
            rebuilt.observe(&store, Some(1)),
            Err(IntegrityError::Collection { subject: Subject::ReportSet, .. })
        ));
        assert!(matches!(
            SnapshotStore::open(&reports, signer.trust()),
            Err(IntegrityError::Journal(_))
        ));
    }
}
