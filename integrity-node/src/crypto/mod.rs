//! 密碼學模塊
//!
//! 包含所有摘要相關功能:
//! - SHA-256 輔助函數與規範化 JSON
//! - 只追加日誌的滾動摘要

pub mod digest;
pub mod rolling;

// Re-export commonly used types
pub use digest::{canonical_json, sha256, sha256_parts};
pub use rolling::{fold, AppendOnlyLog, RollingDigest, RollingObservation};
