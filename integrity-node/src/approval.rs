//! 審批閘門
//!
//! 基線變更的唯一入口（除首次引導外）。一次審批在狀態鎖內原子地完成：
//!
//! 1. 校驗審批人身份與理由
//! 2. 重新採集該主體，審批的摘要必須等於當前實際觀測到的摘要
//! 3. 寫入審批記錄，更新基線中該主體的條目
//! 4. 解決至多一個對應告警；沒有對應告警時標記為 `PROACTIVE`
//!
//! 被拒絕的審批不改變任何狀態。

use crate::collector::FingerprintCollector;
use crate::error::{IntegrityError, Result};
use crate::state::SharedState;
use crate::types::{now, Digest, OperatorIdentity, Subject};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// 審批與告警的對應關係
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Correspondence {
    /// 解決了一個打開的告警
    Reactive,
    /// 沒有對應的告警（提前批准的變更）
    Proactive,
}

/// 審批記錄
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub id: u64,
    pub subject: Subject,
    pub new_digest: Digest,
    pub approved_by: OperatorIdentity,
    pub approved_at: DateTime<Utc>,
    pub justification: String,
    pub resolved_alert: Option<u64>,
    pub correspondence: Correspondence,
}

/// 審批請求
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub subject: Subject,
    pub new_digest: Digest,
    pub approved_by: String,
    pub justification: String,
}

/// 審批閘門
pub struct ApprovalGate {
    state: SharedState,
    collector: Arc<FingerprintCollector>,
    /// 為空表示接受任何有效身份
    authorized_approvers: Vec<OperatorIdentity>,
}

impl ApprovalGate {
    pub fn new(
        state: SharedState,
        collector: Arc<FingerprintCollector>,
        authorized_approvers: Vec<OperatorIdentity>,
    ) -> Self {
        Self {
            state,
            collector,
            authorized_approvers,
        }
    }

    /// 批准主體的新摘要
    ///
    /// # 錯誤
    ///
    /// - `InvalidIdentity` / `UnauthorizedApprover`: 審批人無效或未授權
    /// - `InvalidApproval`: 理由為空
    /// - `UnknownSubject`: 主體從未進入基線
    /// - `Collection`: 重新採集失敗
    /// - `ApprovedDigestMismatch`: 摘要與當前觀測不符
    pub async fn approve(&self, request: ApprovalRequest) -> Result<Approval> {
        // 步驟 1: 校驗請求
        let approver = self.authorize(&request.approved_by)?;
        let justification = request.justification.trim();
        if justification.is_empty() {
            return Err(IntegrityError::InvalidApproval(
                "justification must not be empty".to_string(),
            ));
        }

        let subject = request.subject;
        let mut state = self.state.lock().await;

        let anchor = state
            .reference(subject)
            .map(|fingerprint| fingerprint.input_size)
            .ok_or(IntegrityError::UnknownSubject(subject))?;

        // 步驟 2: 重新採集
        let collector = Arc::clone(&self.collector);
        let observation = tokio::task::spawn_blocking(move || collector.observe(subject, Some(anchor)))
            .await
            .map_err(|e| IntegrityError::Collection {
                subject,
                reason: format!("collection task failed: {}", e),
            })??;

        let observed = observation.fingerprint.digest;
        if observed != request.new_digest {
            warn!(
                subject = %subject,
                observed = %observed.short(),
                provided = %request.new_digest.short(),
                approver = %approver,
                "Approval rejected: digest does not match live state"
            );
            return Err(IntegrityError::ApprovedDigestMismatch {
                subject,
                observed,
                provided: request.new_digest,
            });
        }

        // 步驟 3 & 4: 記錄審批，更新基線，解決告警
        let resolved_alert = state.alerts().match_for_approval(subject, &observed);
        let approval = Approval {
            id: state.next_approval_id(),
            subject,
            new_digest: observed,
            approved_by: approver,
            approved_at: now(),
            justification: justification.to_string(),
            resolved_alert,
            correspondence: if resolved_alert.is_some() {
                Correspondence::Reactive
            } else {
                Correspondence::Proactive
            },
        };

        state.commit_approval(approval.clone(), observation.fingerprint)?;

        info!(
            approval_id = approval.id,
            subject = %subject,
            digest = %observed.short(),
            approver = %approval.approved_by,
            resolved_alert = ?approval.resolved_alert,
            correspondence = ?approval.correspondence,
            "Baseline change approved"
        );

        Ok(approval)
    }

    fn authorize(&self, raw: &str) -> Result<OperatorIdentity> {
        let identity = OperatorIdentity::parse(raw)?;
        if !self.authorized_approvers.is_empty() && !self.authorized_approvers.contains(&identity) {
            warn!(approver = %identity, "Approval attempted by unauthorized operator");
            return Err(IntegrityError::UnauthorizedApprover(identity.to_string()));
        }
        Ok(identity)
    }
}
