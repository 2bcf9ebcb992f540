//! 告警記錄
//!
//! 告警生命週期只有 `open → resolved` 一條路徑，且只能由匹配的審批觸發。
//! 告警從不自動清除：即使之後的採集重新與基線一致，告警依然保持打開。
//!
//! 所有變更都以 `AlertEvent` 表示：先寫入只追加日誌，再應用到內存，
//! 重啟時按順序重放事件即可恢復完整的告警歷史。

use crate::types::{Digest, Severity, Subject};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 告警類型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    /// 觀測摘要與基線不符
    DigestMismatch,
    /// 主體無法採集（不可讀或損壞）
    CollectionFailed,
}

/// 告警
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: u64,
    pub subject: Subject,
    pub kind: AlertKind,
    /// 基線摘要
    pub expected_digest: Digest,
    /// 最近一次觀測到的摘要；採集失敗時為 `None`
    pub observed_digest: Option<Digest>,
    /// 採集失敗原因
    pub failure_reason: Option<String>,
    pub raised_at: DateTime<Utc>,
    pub last_observed_at: DateTime<Utc>,
    pub observation_count: u64,
    pub severity: Severity,
    pub resolved: bool,
    pub resolution_approval_ref: Option<u64>,
}

impl Alert {
    pub fn is_open(&self) -> bool {
        !self.resolved
    }
}

/// 告警事件（只追加日誌的記錄單位）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertEvent {
    /// 新告警
    Raised { alert: Alert },
    /// 已打開告警的再次觀測
    #[serde(rename_all = "camelCase")]
    Observed {
        id: u64,
        observed_digest: Option<Digest>,
        failure_reason: Option<String>,
        at: DateTime<Utc>,
    },
    /// 告警被審批解決
    #[serde(rename_all = "camelCase")]
    Resolved {
        id: u64,
        approval_id: u64,
        at: DateTime<Utc>,
    },
}

/// 所有告警（打開與已解決），按 ID 遞增排列
#[derive(Debug, Clone, Default)]
pub struct AlertBook {
    alerts: Vec<Alert>,
}

impl AlertBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.alerts.last().map(|a| a.id + 1).unwrap_or(1)
    }

    pub fn get(&self, id: u64) -> Option<&Alert> {
        self.alerts.iter().find(|a| a.id == id)
    }

    /// 主體某類型的打開告警（每個主體每種類型至多一個）
    pub fn open_for(&self, subject: Subject, kind: AlertKind) -> Option<&Alert> {
        self.alerts
            .iter()
            .find(|a| a.is_open() && a.subject == subject && a.kind == kind)
    }

    /// 所有打開的告警，按 ID 排序
    pub fn open_alerts(&self) -> Vec<Alert> {
        self.alerts.iter().filter(|a| a.is_open()).cloned().collect()
    }

    pub fn all(&self) -> &[Alert] {
        &self.alerts
    }

    /// 為摘要不符生成事件：沒有打開的告警時新建，否則只更新觀測記錄
    pub fn plan_mismatch(
        &self,
        subject: Subject,
        expected: Digest,
        observed: Digest,
        at: DateTime<Utc>,
    ) -> AlertEvent {
        match self.open_for(subject, AlertKind::DigestMismatch) {
            Some(existing) => AlertEvent::Observed {
                id: existing.id,
                observed_digest: Some(observed),
                failure_reason: None,
                at,
            },
            None => AlertEvent::Raised {
                alert: Alert {
                    id: self.next_id(),
                    subject,
                    kind: AlertKind::DigestMismatch,
                    expected_digest: expected,
                    observed_digest: Some(observed),
                    failure_reason: None,
                    raised_at: at,
                    last_observed_at: at,
                    observation_count: 1,
                    severity: subject.mismatch_severity(),
                    resolved: false,
                    resolution_approval_ref: None,
                },
            },
        }
    }

    /// 為採集失敗生成事件（嚴重度固定為高）
    pub fn plan_collection_failure(
        &self,
        subject: Subject,
        expected: Digest,
        reason: &str,
        at: DateTime<Utc>,
    ) -> AlertEvent {
        match self.open_for(subject, AlertKind::CollectionFailed) {
            Some(existing) => AlertEvent::Observed {
                id: existing.id,
                observed_digest: None,
                failure_reason: Some(reason.to_string()),
                at,
            },
            None => AlertEvent::Raised {
                alert: Alert {
                    id: self.next_id(),
                    subject,
                    kind: AlertKind::CollectionFailed,
                    expected_digest: expected,
                    observed_digest: None,
                    failure_reason: Some(reason.to_string()),
                    raised_at: at,
                    last_observed_at: at,
                    observation_count: 1,
                    severity: Severity::High,
                    resolved: false,
                    resolution_approval_ref: None,
                },
            },
        }
    }

    /// 選出審批應解決的告警
    ///
    /// 優先選擇最近觀測摘要等於 `new_digest` 的摘要不符告警，
    /// 其次是該主體打開的採集失敗告警。
    pub fn match_for_approval(&self, subject: Subject, new_digest: &Digest) -> Option<u64> {
        self.open_for(subject, AlertKind::DigestMismatch)
            .filter(|a| a.observed_digest.as_ref() == Some(new_digest))
            .or_else(|| self.open_for(subject, AlertKind::CollectionFailed))
            .map(|a| a.id)
    }

    /// 應用事件到內存狀態
    pub fn apply(&mut self, event: &AlertEvent) {
        match event {
            AlertEvent::Raised { alert } => self.alerts.push(alert.clone()),
            AlertEvent::Observed {
                id,
                observed_digest,
                failure_reason,
                at,
            } => {
                if let Some(alert) = self.alerts.iter_mut().find(|a| a.id == *id) {
                    if observed_digest.is_some() {
                        alert.observed_digest = *observed_digest;
                    }
                    if failure_reason.is_some() {
                        alert.failure_reason = failure_reason.clone();
                    }
                    alert.last_observed_at = *at;
                    alert.observation_count += 1;
                }
            }
            AlertEvent::Resolved { id, approval_id, .. } => {
                if let Some(alert) = self.alerts.iter_mut().find(|a| a.id == *id) {
                    alert.resolved = true;
                    alert.resolution_approval_ref = Some(*approval_id);
                }
            }
        }
    }
}
