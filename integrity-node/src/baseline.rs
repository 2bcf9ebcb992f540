//! 基線存儲
//!
//! 基線是節點當前接受為「未修改」的指紋集合。同一時間只有一個基線，
//! 修改路徑只有兩條：主體首次引導（`accepted_by = None`），或一次完成的審批。
//! 更新主體 S 只替換 S 的條目，其他主體原樣保留。

use crate::error::{IntegrityError, Result};
use crate::types::{Fingerprint, OperatorIdentity, Subject};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 單個主體的基線條目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaselineEntry {
    pub fingerprint: Fingerprint,
    pub accepted_at: DateTime<Utc>,
    /// `None` 表示引導時接受，沒有明確的審批人
    pub accepted_by: Option<OperatorIdentity>,
    pub approval_ref: Option<u64>,
}

/// 基線
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Baseline {
    pub entries: BTreeMap<Subject, BaselineEntry>,
    /// 最近一次變更的時間
    pub accepted_at: Option<DateTime<Utc>>,
    /// 最近一次變更的審批人
    pub accepted_by: Option<OperatorIdentity>,
}

impl Baseline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, subject: Subject) -> Option<&BaselineEntry> {
        self.entries.get(&subject)
    }

    pub fn contains(&self, subject: Subject) -> bool {
        self.entries.contains_key(&subject)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 主體首次引導
    ///
    /// 已存在條目時拒絕：引導不能用來繞過審批
    pub fn bootstrap(&mut self, fingerprint: Fingerprint, at: DateTime<Utc>) -> Result<()> {
        let subject = fingerprint.subject;
        if self.entries.contains_key(&subject) {
            return Err(IntegrityError::InvalidApproval(format!(
                "{} already has a baseline; changes require an approval",
                subject
            )));
        }
        self.entries.insert(
            subject,
            BaselineEntry {
                fingerprint,
                accepted_at: at,
                accepted_by: None,
                approval_ref: None,
            },
        );
        self.accepted_at = Some(at);
        self.accepted_by = None;
        Ok(())
    }

    /// 按審批接受新指紋，只替換該主體
    pub fn accept(
        &mut self,
        fingerprint: Fingerprint,
        by: OperatorIdentity,
        approval_id: u64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let subject = fingerprint.subject;
        if !self.entries.contains_key(&subject) {
            return Err(IntegrityError::UnknownSubject(subject));
        }
        self.entries.insert(
            subject,
            BaselineEntry {
                fingerprint,
                accepted_at: at,
                accepted_by: Some(by.clone()),
                approval_ref: Some(approval_id),
            },
        );
        self.accepted_at = Some(at);
        self.accepted_by = Some(by);
        Ok(())
    }

    /// 主體 → 指紋映射（快照使用）
    pub fn fingerprints(&self) -> BTreeMap<Subject, Fingerprint> {
        self.entries
            .iter()
            .map(|(subject, entry)| (*subject, entry.fingerprint.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{now, Digest};

    fn fp(subject: Subject, byte: u8) -> Fingerprint {
        Fingerprint {
            subject,
            digest: Digest([byte; 32]),
            computed_at: now(),
            input_size: 1,
        }
    }

    #[test]
    fn test_bootstrap_only_once() {
        let mut baseline = Baseline::new();
        baseline.bootstrap(fp(Subject::CodeSet, 1), now()).unwrap();

        assert!(baseline.bootstrap(fp(Subject::CodeSet, 2), now()).is_err());
        assert_eq!(baseline.get(Subject::CodeSet).unwrap().fingerprint.digest, Digest([1; 32]));
        assert!(baseline.get(Subject::CodeSet).unwrap().accepted_by.is_none());
    }

    #[test]
    fn test_accept_replaces_only_one_subject() {
        let mut baseline = Baseline::new();
        baseline.bootstrap(fp(Subject::CodeSet, 1), now()).unwrap();
        baseline.bootstrap(fp(Subject::Ledger, 5), now()).unwrap();
        let ledger_before = baseline.get(Subject::Ledger).cloned();

        let approver = OperatorIdentity::parse("ops-lead").unwrap();
        baseline
            .accept(fp(Subject::CodeSet, 2), approver.clone(), 1, now())
            .unwrap();

        assert_eq!(baseline.get(Subject::CodeSet).unwrap().fingerprint.digest, Digest([2; 32]));
        assert_eq!(baseline.get(Subject::CodeSet).unwrap().accepted_by, Some(approver));
        assert_eq!(baseline.get(Subject::Ledger).cloned(), ledger_before);
    }

    #[test]
    fn test_accept_unknown_subject() {
        let mut baseline = Baseline::new();
        let approver = OperatorIdentity::parse("ops").unwrap();
        assert!(matches!(
            baseline.accept(fp(Subject::ReportSet, 1), approver, 1, now()),
            Err(IntegrityError::UnknownSubject(Subject::ReportSet))
        ));
    }
}
