//! 審計日誌持久化
//!
//! ```text
//! {state_dir}/
//!   ├── baseline.json     當前基線（臨時文件 + rename 原子替換）
//!   ├── checkpoints.json  只追加主體最近驗證通過的指紋（同上）
//!   ├── alerts.jsonl      告警事件（只追加）
//!   └── approvals.jsonl   審批記錄（只追加）
//! ```
//!
//! 未配置 `state_dir` 時只在內存中運行，所有寫入都是空操作。

use crate::alerts::{AlertBook, AlertEvent};
use crate::approval::Approval;
use crate::baseline::Baseline;
use crate::error::{IntegrityError, Result};
use crate::types::{Fingerprint, Subject};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const BASELINE_FILE: &str = "baseline.json";
const CHECKPOINTS_FILE: &str = "checkpoints.json";
const ALERTS_FILE: &str = "alerts.jsonl";
const APPROVALS_FILE: &str = "approvals.jsonl";

/// 重放日誌得到的狀態
#[derive(Debug, Default)]
pub struct ReplayedState {
    pub baseline: Baseline,
    pub checkpoints: BTreeMap<Subject, Fingerprint>,
    pub alerts: AlertBook,
    pub approvals: Vec<Approval>,
    /// 日誌中出現過的最大審批 ID
    pub last_approval_id: u64,
}

/// 審批日誌寫入前的長度，用於回滾
#[derive(Debug, Clone, Copy)]
pub struct JournalMark(Option<u64>);

/// 審計日誌
#[derive(Debug, Clone, Default)]
pub struct AuditJournal {
    dir: Option<PathBuf>,
}

impl AuditJournal {
    /// 僅內存
    pub fn in_memory() -> Self {
        Self { dir: None }
    }

    /// 打開（必要時創建）日誌目錄
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            IntegrityError::Journal(format!("Failed to create state directory {:?}: {}", dir, e))
        })?;
        Ok(Self {
            dir: Some(dir.to_path_buf()),
        })
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn append_alert_event(&self, event: &AlertEvent) -> Result<()> {
        self.append_line(ALERTS_FILE, event)
    }

    pub fn append_approval(&self, approval: &Approval) -> Result<()> {
        self.append_line(APPROVALS_FILE, approval)
    }

    /// 原子替換基線文件
    pub fn save_baseline(&self, baseline: &Baseline) -> Result<()> {
        self.save_atomic(BASELINE_FILE, baseline)
            .map_err(|e| IntegrityError::Journal(format!("Failed to save baseline: {}", e)))
    }

    /// 原子替換檢查點文件
    pub fn save_checkpoints(&self, checkpoints: &BTreeMap<Subject, Fingerprint>) -> Result<()> {
        self.save_atomic(CHECKPOINTS_FILE, checkpoints)
            .map_err(|e| IntegrityError::Journal(format!("Failed to save checkpoints: {}", e)))
    }

    /// 記錄審批日誌當前長度
    pub fn approvals_mark(&self) -> Result<JournalMark> {
        let Some(dir) = &self.dir else {
            return Ok(JournalMark(None));
        };
        let path = dir.join(APPROVALS_FILE);
        let len = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => {
                return Err(IntegrityError::Journal(format!("Failed to stat {:?}: {}", path, e)))
            }
        };
        Ok(JournalMark(Some(len)))
    }

    /// 把審批日誌截斷回 `mark` 時的長度
    pub fn rollback_approvals(&self, mark: JournalMark) -> Result<()> {
        let (Some(dir), JournalMark(Some(len))) = (&self.dir, mark) else {
            return Ok(());
        };
        let path = dir.join(APPROVALS_FILE);
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| IntegrityError::Journal(format!("Failed to open {:?}: {}", path, e)))?;
        file.set_len(len)
            .and_then(|_| file.sync_data())
            .map_err(|e| IntegrityError::Journal(format!("Failed to truncate {:?}: {}", path, e)))?;
        warn!(path = ?path, len, "Approval record rolled back");
        Ok(())
    }

    fn save_atomic<T: Serialize>(&self, file_name: &str, value: &T) -> std::io::Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        let path = dir.join(file_name);
        let tmp = dir.join(format!("{}.tmp", file_name));
        let json = serde_json::to_string_pretty(value)?;

        let mut file = fs::File::create(&tmp)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, &path)
    }

    /// 重放日誌恢復狀態
    pub fn replay(&self) -> Result<ReplayedState> {
        let Some(dir) = &self.dir else {
            return Ok(ReplayedState::default());
        };

        let baseline: Baseline = read_json(&dir.join(BASELINE_FILE))?.unwrap_or_default();
        let checkpoints: BTreeMap<Subject, Fingerprint> =
            read_json(&dir.join(CHECKPOINTS_FILE))?.unwrap_or_default();

        let mut alerts = AlertBook::new();
        for event in read_lines::<AlertEvent>(&dir.join(ALERTS_FILE))? {
            alerts.apply(&event);
        }

        let approvals = read_lines::<Approval>(&dir.join(APPROVALS_FILE))?;

        let last_approval_id = approvals.iter().map(|a| a.id).max().unwrap_or(0);

        // 審批先於 Resolved 事件寫入；基線已指向該審批時補回缺失的解決記錄
        for approval in &approvals {
            let Some(alert_id) = approval.resolved_alert else {
                continue;
            };
            let applied = baseline
                .get(approval.subject)
                .map(|e| e.approval_ref == Some(approval.id))
                .unwrap_or(false);
            if applied && alerts.get(alert_id).map(|a| a.is_open()).unwrap_or(false) {
                warn!(alert_id, approval_id = approval.id, "Recovering unrecorded alert resolution");
                alerts.apply(&AlertEvent::Resolved {
                    id: alert_id,
                    approval_id: approval.id,
                    at: approval.approved_at,
                });
            }
        }

        info!(
            subjects = baseline.entries.len(),
            checkpoints = checkpoints.len(),
            alerts = alerts.all().len(),
            open_alerts = alerts.open_alerts().len(),
            approvals = approvals.len(),
            "Integrity state restored from journal"
        );

        Ok(ReplayedState {
            baseline,
            checkpoints,
            alerts,
            approvals,
            last_approval_id,
        })
    }

    fn append_line<T: Serialize>(&self, file_name: &str, record: &T) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        let path = dir.join(file_name);
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| IntegrityError::Journal(format!("Failed to open {:?}: {}", path, e)))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(|e| IntegrityError::Journal(format!("Failed to append to {:?}: {}", path, e)))
    }
}

/// 讀取整個 JSON 文件，不存在時為 `None`
fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let json = fs::read_to_string(path)?;
    serde_json::from_str(&json)
        .map(Some)
        .map_err(|e| IntegrityError::Journal(format!("Corrupt state file {:?}: {}", path, e)))
}

/// 讀取 JSON Lines 文件
///
/// 只容忍最後一行不完整（寫入中途崩潰），其他解析錯誤都視為日誌損壞
fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path)?;
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    let mut records = Vec::with_capacity(lines.len());

    for (i, line) in lines.iter().enumerate() {
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(e) if i + 1 == lines.len() && !content.ends_with('\n') => {
                warn!(path = ?path, error = %e, "Ignoring truncated last journal line");
            }
            Err(e) => {
                return Err(IntegrityError::Journal(format!(
                    "Corrupt record at {:?} line {}: {}",
                    path,
                    i + 1,
                    e
                )))
            }
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::Correspondence;
    use crate::types::{now, Digest, Fingerprint, OperatorIdentity, Subject};
    use tempfile::TempDir;

    #[test]
    fn test_replay_restores_baseline_and_alerts() {
        let temp_dir = TempDir::new().unwrap();
        let journal = AuditJournal::open(temp_dir.path()).unwrap();

        // 1. 寫入基線
        let mut baseline = Baseline::new();
        baseline
            .bootstrap(
                Fingerprint {
                    subject: Subject::CodeSet,
                    digest: Digest([1; 32]),
                    computed_at: now(),
                    input_size: 3,
                },
                now(),
            )
            .unwrap();
        journal.save_baseline(&baseline).unwrap();

        // 2. 寫入告警事件
        let mut book = AlertBook::new();
        for observed in [2u8, 3] {
            let event = book.plan_mismatch(Subject::CodeSet, Digest([1; 32]), Digest([observed; 32]), now());
            journal.append_alert_event(&event).unwrap();
            book.apply(&event);
        }

        // 3. 重放
        let replayed = journal.replay().unwrap();
        assert_eq!(replayed.baseline, baseline);
        assert_eq!(replayed.alerts.open_alerts(), book.open_alerts());
        assert_eq!(replayed.alerts.open_alerts()[0].observation_count, 2);
    }

    #[test]
    fn test_truncated_last_line_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let journal = AuditJournal::open(temp_dir.path()).unwrap();

        let book = AlertBook::new();
        let event = book.plan_mismatch(Subject::Ledger, Digest([1; 32]), Digest([2; 32]), now());
        journal.append_alert_event(&event).unwrap();

        let path = temp_dir.path().join(ALERTS_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"event\":\"RAIS").unwrap();

        let replayed = journal.replay().unwrap();
        assert_eq!(replayed.alerts.open_alerts().len(), 1);
    }

    #[test]
    fn test_corrupt_middle_line_is_error() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(APPROVALS_FILE), "garbage\n{}\n").unwrap();

        let journal = AuditJournal::open(temp_dir.path()).unwrap();
        assert!(matches!(journal.replay(), Err(IntegrityError::Journal(_))));
    }

    fn fingerprint(subject: Subject, byte: u8, input_size: u64) -> Fingerprint {
        Fingerprint {
            subject,
            digest: Digest([byte; 32]),
            computed_at: now(),
            input_size,
        }
    }

    /// 打開一個告警並寫入引用它的審批，但不寫 Resolved 事件
    fn interrupted_approval(journal: &AuditJournal) -> (u64, Approval) {
        let book = AlertBook::new();
        let raised = book.plan_mismatch(Subject::CodeSet, Digest([1; 32]), Digest([2; 32]), now());
        journal.append_alert_event(&raised).unwrap();
        let alert_id = match &raised {
            AlertEvent::Raised { alert } => alert.id,
            other => panic!("unexpected event {:?}", other),
        };

        let approval = Approval {
            id: 1,
            subject: Subject::CodeSet,
            new_digest: Digest([2; 32]),
            approved_by: OperatorIdentity::parse("ops-lead").unwrap(),
            approved_at: now(),
            justification: "release".to_string(),
            resolved_alert: Some(alert_id),
            correspondence: Correspondence::Reactive,
        };
        journal.append_approval(&approval).unwrap();
        (alert_id, approval)
    }

    #[test]
    fn test_replay_recovers_resolution_after_interrupted_approval() {
        let temp_dir = TempDir::new().unwrap();
        let journal = AuditJournal::open(temp_dir.path()).unwrap();
        let (alert_id, approval) = interrupted_approval(&journal);

        // 基線已按審批保存
        let mut baseline = Baseline::new();
        baseline.bootstrap(fingerprint(Subject::CodeSet, 1, 3), now()).unwrap();
        baseline
            .accept(
                fingerprint(Subject::CodeSet, 2, 3),
                approval.approved_by.clone(),
                approval.id,
                approval.approved_at,
            )
            .unwrap();
        journal.save_baseline(&baseline).unwrap();

        let replayed = journal.replay().unwrap();
        assert!(replayed.alerts.open_alerts().is_empty());
        assert_eq!(replayed.alerts.get(alert_id).unwrap().resolution_approval_ref, Some(1));
    }

    #[test]
    fn test_replay_keeps_alert_open_when_baseline_was_not_saved() {
        let temp_dir = TempDir::new().unwrap();
        let journal = AuditJournal::open(temp_dir.path()).unwrap();

        let mut baseline = Baseline::new();
        baseline.bootstrap(fingerprint(Subject::CodeSet, 1, 3), now()).unwrap();
        journal.save_baseline(&baseline).unwrap();
        let (alert_id, _) = interrupted_approval(&journal);

        let replayed = journal.replay().unwrap();
        assert!(replayed.alerts.get(alert_id).unwrap().is_open());
        assert_eq!(replayed.last_approval_id, 1);
    }

    #[test]
    fn test_rollback_truncates_approval_record() {
        let temp_dir = TempDir::new().unwrap();
        let journal = AuditJournal::open(temp_dir.path()).unwrap();
        interrupted_approval(&journal);

        let mark = journal.approvals_mark().unwrap();
        let mut second = journal.replay().unwrap().approvals.remove(0);
        second.id = 2;
        journal.append_approval(&second).unwrap();
        journal.rollback_approvals(mark).unwrap();

        let replayed = journal.replay().unwrap();
        assert_eq!(replayed.approvals.len(), 1);
        assert_eq!(replayed.last_approval_id, 1);
    }

    #[test]
    fn test_checkpoints_survive_replay() {
        let temp_dir = TempDir::new().unwrap();
        let journal = AuditJournal::open(temp_dir.path()).unwrap();

        let mut checkpoints = BTreeMap::new();
        checkpoints.insert(Subject::Ledger, fingerprint(Subject::Ledger, 9, 4));
        journal.save_checkpoints(&checkpoints).unwrap();

        let replayed = journal.replay().unwrap();
        assert_eq!(replayed.checkpoints, checkpoints);
    }

    #[test]
    fn test_in_memory_journal_is_noop() {
        let journal = AuditJournal::in_memory();
        journal.save_baseline(&Baseline::new()).unwrap();
        let replayed = journal.replay().unwrap();
        assert!(replayed.baseline.is_empty());
    }
}
