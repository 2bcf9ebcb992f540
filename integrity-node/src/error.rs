//! 完整性節點統一錯誤類型定義
//!
//! 本模塊定義了完整性監控、審批與快照簽名過程中可能遇到的所有錯誤，
//! 使用 thiserror crate 提供錯誤鏈和上下文信息。

use crate::types::{Digest, Subject};
use thiserror::Error;

/// 完整性節點錯誤類型
///
/// 涵蓋所有子系統的錯誤情況：
/// - 指紋採集（代碼、賬本、報告集）
/// - 審批閘門（摘要不符、未知主體、身份無效）
/// - 快照簽名與驗證
/// - 日誌持久化與配置
#[derive(Error, Debug)]
pub enum IntegrityError {
    /// 指紋採集失敗
    ///
    /// 主體無法讀取或內容損壞。失敗的採集絕不以舊摘要或零摘要代替
    #[error("Collection of {subject} failed: {reason}")]
    Collection { subject: Subject, reason: String },

    /// 審批的摘要與當前觀測到的摘要不符
    ///
    /// 審批只能接受當前實際存在的指紋，不能預先放行任意摘要
    #[error("Approved digest {provided} for {subject} does not match observed digest {observed}")]
    ApprovedDigestMismatch {
        subject: Subject,
        observed: Digest,
        provided: Digest,
    },

    /// 主體從未進入基線
    #[error("Subject {0} is not part of the baseline")]
    UnknownSubject(Subject),

    /// 審批人身份無效（空、過長或含控制字符）
    #[error("Invalid operator identity: {0}")]
    InvalidIdentity(String),

    /// 審批人不在授權名單中
    #[error("Operator {0} is not an authorized approver")]
    UnauthorizedApprover(String),

    /// 審批請求的其他欄位無效
    #[error("Invalid approval: {0}")]
    InvalidApproval(String),

    /// 簽名失敗（密鑰不可用等）
    ///
    /// 本輪的指紋與告警狀態仍然有效，只是不發布新的快照
    #[error("Snapshot signing failed: {0}")]
    SigningFailure(String),

    /// 審計週期中有主體採集失敗，未發布快照
    #[error("Audit incomplete: collection failed for {}", format_subjects(.failed))]
    AuditIncomplete { failed: Vec<Subject> },

    /// 尚未生成任何審計快照
    #[error("No audit snapshot has been generated yet")]
    NoAuditYet,

    /// 查詢參數無效（分頁範圍等）
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// 快照文檔格式錯誤或無法驗證
    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),

    /// 配置錯誤
    #[error("Configuration error: {0}")]
    Config(String),

    /// 審計日誌（告警、審批、基線）讀寫錯誤
    #[error("Journal error: {0}")]
    Journal(String),

    /// 拉取對等節點報告失敗
    #[error("Peer fetch error: {0}")]
    PeerFetch(String),

    /// 序列化/反序列化錯誤
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O 錯誤
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_subjects(subjects: &[Subject]) -> String {
    subjects
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result 類型別名
pub type Result<T> = std::result::Result<T, IntegrityError>;

/// 從 JSON 錯誤轉換
impl From<serde_json::Error> for IntegrityError {
    fn from(err: serde_json::Error) -> Self {
        IntegrityError::Serialization(err.to_string())
    }
}

/// 從簽名庫錯誤轉換
impl From<snapshot_signer::SignerError> for IntegrityError {
    fn from(err: snapshot_signer::SignerError) -> Self {
        IntegrityError::SigningFailure(err.to_string())
    }
}

impl From<reqwest::Error> for IntegrityError {
    fn from(err: reqwest::Error) -> Self {
        IntegrityError::PeerFetch(err.to_string())
    }
}
