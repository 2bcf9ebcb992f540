//! 共享完整性狀態
//!
//! 基線、告警與審批記錄由同一把 `tokio::sync::Mutex` 保護，
//! 監控週期和審批閘門在構造時拿到同一個 `SharedState` 句柄。
//!
//! 每次變更都先寫日誌再改內存：日誌寫入失敗時內存狀態保持不變。
//!
//! 只追加主體另有「檢查點」：最近一次驗證通過的 `(長度, 頭摘要)`。
//! 基線只記錄被接受的狀態，檢查點隨每次一致的觀測前移，
//! 引導之後追加的條目被改寫時也能被發現。

use crate::alerts::{AlertBook, AlertEvent};
use crate::approval::Approval;
use crate::baseline::Baseline;
use crate::error::Result;
use crate::journal::AuditJournal;
use crate::types::{now, Fingerprint, Subject};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::error;

/// 共享狀態句柄
pub type SharedState = Arc<Mutex<IntegrityState>>;

/// 基線 + 檢查點 + 告警 + 審批記錄
#[derive(Debug)]
pub struct IntegrityState {
    baseline: Baseline,
    checkpoints: BTreeMap<Subject, Fingerprint>,
    alerts: AlertBook,
    approvals: Vec<Approval>,
    next_approval: u64,
    journal: AuditJournal,
}

impl IntegrityState {
    /// 空狀態
    pub fn new(journal: AuditJournal) -> Self {
        Self {
            baseline: Baseline::new(),
            checkpoints: BTreeMap::new(),
            alerts: AlertBook::new(),
            approvals: Vec::new(),
            next_approval: 1,
            journal,
        }
    }

    /// 從日誌恢復
    pub fn restore(journal: AuditJournal) -> Result<Self> {
        let replayed = journal.replay()?;
        Ok(Self {
            baseline: replayed.baseline,
            checkpoints: replayed.checkpoints,
            alerts: replayed.alerts,
            approvals: replayed.approvals,
            next_approval: replayed.last_approval_id + 1,
            journal,
        })
    }

    pub fn into_shared(self) -> SharedState {
        Arc::new(Mutex::new(self))
    }

    pub fn baseline(&self) -> &Baseline {
        &self.baseline
    }

    pub fn alerts(&self) -> &AlertBook {
        &self.alerts
    }

    pub fn approvals(&self) -> &[Approval] {
        &self.approvals
    }

    /// 下一個審批 ID
    ///
    /// 已寫入過日誌的 ID 不再重用，即使該審批最終回滾
    pub fn next_approval_id(&self) -> u64 {
        self.next_approval
    }

    /// 觀測應當比對的參照指紋
    ///
    /// 只追加主體取最近的檢查點（缺失時退回基線），代碼集取基線
    pub fn reference(&self, subject: Subject) -> Option<Fingerprint> {
        let accepted = self.baseline.get(subject).map(|e| &e.fingerprint);
        if subject.is_append_only() {
            self.checkpoints.get(&subject).or(accepted).cloned()
        } else {
            accepted.cloned()
        }
    }

    /// 只追加主體的錨點位置（檢查點記錄的條目數）
    pub fn anchors(&self) -> BTreeMap<Subject, u64> {
        Subject::ALL
            .into_iter()
            .filter(|subject| subject.is_append_only())
            .filter_map(|subject| self.reference(subject).map(|f| (subject, f.input_size)))
            .collect()
    }

    /// 主體首次引導進基線
    pub fn bootstrap(&mut self, fingerprint: Fingerprint) -> Result<()> {
        let mut next = self.baseline.clone();
        next.bootstrap(fingerprint.clone(), now())?;
        self.journal.save_baseline(&next)?;
        self.baseline = next;
        self.set_checkpoint(fingerprint)
    }

    /// 一致的觀測前移檢查點
    ///
    /// 代碼集沒有檢查點；摘要未變時不寫盤
    pub fn advance_checkpoint(&mut self, fingerprint: Fingerprint) -> Result<()> {
        let unchanged = self
            .checkpoints
            .get(&fingerprint.subject)
            .map(|c| c.digest == fingerprint.digest && c.input_size == fingerprint.input_size)
            .unwrap_or(false);
        if unchanged {
            return Ok(());
        }
        self.set_checkpoint(fingerprint)
    }

    fn set_checkpoint(&mut self, fingerprint: Fingerprint) -> Result<()> {
        if !fingerprint.subject.is_append_only() {
            return Ok(());
        }
        let mut next = self.checkpoints.clone();
        next.insert(fingerprint.subject, fingerprint);
        self.journal.save_checkpoints(&next)?;
        self.checkpoints = next;
        Ok(())
    }

    /// 記錄告警事件
    pub fn record_alert(&mut self, event: AlertEvent) -> Result<()> {
        self.journal.append_alert_event(&event)?;
        self.alerts.apply(&event);
        Ok(())
    }

    /// 提交審批：寫審批日誌、更新基線、解決對應告警
    ///
    /// 基線保存失敗時截斷剛寫入的審批記錄，內存狀態不變
    pub fn commit_approval(&mut self, approval: Approval, fingerprint: Fingerprint) -> Result<()> {
        let mut next = self.baseline.clone();
        next.accept(
            fingerprint.clone(),
            approval.approved_by.clone(),
            approval.id,
            approval.approved_at,
        )?;

        let mark = self.journal.approvals_mark()?;
        self.journal.append_approval(&approval)?;
        self.next_approval = self.next_approval.max(approval.id + 1);

        if let Err(e) = self.journal.save_baseline(&next) {
            if let Err(rollback) = self.journal.rollback_approvals(mark) {
                error!(
                    approval_id = approval.id,
                    error = %rollback,
                    "Failed to roll back approval record"
                );
            }
            return Err(e);
        }
        self.baseline = next;

        // 基線已落盤，檢查點寫入失敗不再撤銷審批
        let subject = fingerprint.subject;
        if let Err(e) = self.set_checkpoint(fingerprint.clone()) {
            error!(subject = %subject, error = %e, "Failed to persist checkpoint after approval");
            if subject.is_append_only() {
                self.checkpoints.insert(subject, fingerprint);
            }
        }

        if let Some(alert_id) = approval.resolved_alert {
            self.record_alert(AlertEvent::Resolved {
                id: alert_id,
                approval_id: approval.id,
                at: approval.approved_at,
            })?;
        }

        self.approvals.push(approval);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::Correspondence;
    use crate::error::IntegrityError;
    use crate::types::{Digest, OperatorIdentity};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn fingerprint(subject: Subject, byte: u8, input_size: u64) -> Fingerprint {
        Fingerprint {
            subject,
            digest: Digest([byte; 32]),
            computed_at: now(),
            input_size,
        }
    }

    fn approval(id: u64, digest: Digest, resolved_alert: Option<u64>) -> Approval {
        Approval {
            id,
            subject: Subject::CodeSet,
            new_digest: digest,
            approved_by: OperatorIdentity::parse("ops-lead").unwrap(),
            approved_at: now(),
            justification: "release".to_string(),
            resolved_alert,
            correspondence: Correspondence::Reactive,
        }
    }

    fn restore(dir: &Path) -> IntegrityState {
        IntegrityState::restore(AuditJournal::open(dir).unwrap()).unwrap()
    }

    #[test]
    fn test_failed_baseline_save_rolls_back_approval() {
        let dir = TempDir::new().unwrap();
        let mut state = restore(dir.path());
        state.bootstrap(fingerprint(Subject::CodeSet, 1, 1)).unwrap();
        let raised = state
            .alerts()
            .plan_mismatch(Subject::CodeSet, Digest([1; 32]), Digest([2; 32]), now());
        state.record_alert(raised).unwrap();
        let alert_id = state.alerts().open_alerts()[0].id;

        // 臨時文件路徑被目錄佔用，基線保存失敗
        let blocker = dir.path().join("baseline.json.tmp");
        fs::create_dir(&blocker).unwrap();

        let failed_id = state.next_approval_id();
        let result = state.commit_approval(
            approval(failed_id, Digest([2; 32]), Some(alert_id)),
            fingerprint(Subject::CodeSet, 2, 1),
        );
        assert!(matches!(result, Err(IntegrityError::Journal(_))));
        assert!(state.approvals().is_empty());
        assert!(state.alerts().get(alert_id).unwrap().is_open());
        assert_eq!(
            state.baseline().get(Subject::CodeSet).unwrap().fingerprint.digest,
            Digest([1; 32])
        );
        assert!(state.next_approval_id() > failed_id);

        let restored = restore(dir.path());
        assert!(restored.approvals().is_empty());
        assert!(restored.alerts().get(alert_id).unwrap().is_open());

        // 故障排除後重試
        fs::remove_dir(&blocker).unwrap();
        let retry_id = state.next_approval_id();
        state
            .commit_approval(
                approval(retry_id, Digest([2; 32]), Some(alert_id)),
                fingerprint(Subject::CodeSet, 2, 1),
            )
            .unwrap();

        let restored = restore(dir.path());
        let ids: Vec<u64> = restored.approvals().iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![retry_id]);
        assert!(!restored.alerts().get(alert_id).unwrap().is_open());
        assert_eq!(restored.next_approval_id(), retry_id + 1);
    }

    #[test]
    fn test_checkpoint_tracks_append_only_subjects() {
        let mut state = IntegrityState::new(AuditJournal::in_memory());
        state.bootstrap(fingerprint(Subject::CodeSet, 1, 2)).unwrap();
        state.bootstrap(fingerprint(Subject::Ledger, 0, 0)).unwrap();

        state.advance_checkpoint(fingerprint(Subject::Ledger, 5, 3)).unwrap();
        state.advance_checkpoint(fingerprint(Subject::CodeSet, 9, 2)).unwrap();

        assert_eq!(state.reference(Subject::Ledger).unwrap().digest, Digest([5; 32]));
        assert_eq!(state.reference(Subject::CodeSet).unwrap().digest, Digest([1; 32]));
        assert_eq!(state.anchors().get(&Subject::Ledger), Some(&3));
        assert!(!state.anchors().contains_key(&Subject::CodeSet));
    }
}
