//! 共享數據類型定義
//!
//! 本模塊定義完整性節點中各個子系統共享的數據結構：
//! 受監控主體、SHA-256 摘要、指紋、告警嚴重度以及審批人身份。

use crate::error::{IntegrityError, Result};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// 受監控的主體
///
/// 每個主體對應一類需要防篡改的內容
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Subject {
    /// 正在運行的源代碼集合
    CodeSet,
    /// 只追加的決策賬本
    Ledger,
    /// 已發布的簽名快照集合
    ReportSet,
}

impl Subject {
    /// 所有主體（固定順序）
    pub const ALL: [Subject; 3] = [Subject::CodeSet, Subject::Ledger, Subject::ReportSet];

    pub fn as_str(&self) -> &'static str {
        match self {
            Subject::CodeSet => "CODE_SET",
            Subject::Ledger => "LEDGER",
            Subject::ReportSet => "REPORT_SET",
        }
    }

    /// 摘要不符時的告警嚴重度
    ///
    /// - 賬本：最高（意味著歷史決策被追溯篡改）
    /// - 代碼：高
    /// - 報告集：中
    pub fn mismatch_severity(&self) -> Severity {
        match self {
            Subject::Ledger => Severity::Critical,
            Subject::CodeSet => Severity::High,
            Subject::ReportSet => Severity::Medium,
        }
    }

    /// 是否為只追加主體（比對基線位置的錨點摘要，而非尾部摘要）
    pub fn is_append_only(&self) -> bool {
        matches!(self, Subject::Ledger | Subject::ReportSet)
    }

    /// 跨節點比對策略
    pub fn peer_policy(&self) -> ComparisonPolicy {
        match self {
            Subject::CodeSet => ComparisonPolicy::ShouldMatch,
            Subject::Ledger | Subject::ReportSet => ComparisonPolicy::ExpectedToDiverge,
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Subject {
    type Err = IntegrityError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "CODE_SET" | "CODESET" => Ok(Subject::CodeSet),
            "LEDGER" => Ok(Subject::Ledger),
            "REPORT_SET" | "REPORTSET" => Ok(Subject::ReportSet),
            _ => Err(IntegrityError::InvalidApproval(format!("unknown subject: {}", s))),
        }
    }
}

/// 跨節點比對策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComparisonPolicy {
    /// 運行同一版本的節點應當一致
    ShouldMatch,
    /// 每個節點的歷史不同，合理地分歧
    ExpectedToDiverge,
}

/// 告警嚴重度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

/// SHA-256 摘要（256 位）
///
/// 序列化為 64 個小寫十六進制字符
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// 滾動摘要的創世值（32 個零字節）
    pub const ZERO: Digest = Digest([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// 日誌用的短格式（前 16 個十六進制字符）
    pub fn short(&self) -> String {
        self.to_hex()[..16].to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}

impl FromStr for Digest {
    type Err = IntegrityError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| IntegrityError::Serialization(format!("Invalid digest hex: {}", e)))?;
        let array: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            IntegrityError::Serialization(format!("Invalid digest length: {} bytes", v.len()))
        })?;
        Ok(Digest(array))
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// 主體指紋
///
/// 每個監控週期重新計算，計算後不可變
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    pub subject: Subject,
    pub digest: Digest,
    pub computed_at: DateTime<Utc>,
    /// 折疊進摘要的輸入項數量（文件數、賬本條目數或快照數）
    pub input_size: u64,
}

/// 審批人身份
///
/// 帶驗證契約的標記值：去除首尾空白後非空、不超過 128 字符、不含控制字符
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OperatorIdentity(String);

impl OperatorIdentity {
    pub const MAX_LEN: usize = 128;

    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(IntegrityError::InvalidIdentity(
                "approver identity must not be empty".to_string(),
            ));
        }
        if trimmed.chars().count() > Self::MAX_LEN {
            return Err(IntegrityError::InvalidIdentity(format!(
                "approver identity longer than {} characters",
                Self::MAX_LEN
            )));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(IntegrityError::InvalidIdentity(
                "approver identity contains control characters".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OperatorIdentity {
    type Error = IntegrityError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<OperatorIdentity> for String {
    fn from(value: OperatorIdentity) -> Self {
        value.0
    }
}

impl fmt::Display for OperatorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 當前時間（截斷到毫秒，保持文檔中的時間戳整齊）
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}
