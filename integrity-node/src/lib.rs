//! 推理節點完整性與審計子系統
//!
//! 本 crate 監控三個受保護主體的完整性，並發布可驗證的簽名快照:
//! 1. 代碼集（CODE_SET）：決策代碼目錄的內容指紋
//! 2. 賬本（LEDGER）：只追加的推理記錄，滾動摘要
//! 3. 報告集（REPORT_SET）：已發布的簽名快照歷史
//!
//! 指紋與基線不符時產生告警，只有經過授權的審批才能更新基線。
//!
//! # 架構
//!
//! ```text
//!              ┌──────────────────┐
//!              │ IntegrityService │  ← HTTP 接口與週期任務共用
//!              └────────┬─────────┘
//!        ┌──────────────┼──────────────┬───────────────┐
//!        ▼              ▼              ▼               ▼
//! IntegrityMonitor ApprovalGate  ReportSigner   compare_snapshots
//!        │              │              │
//!        └──────┬───────┘              ▼
//!               ▼                SnapshotStore
//!      FingerprintCollector
//!   (CodeSet / Ledger / ReportSet)
//! ```
//!
//! # 示例用法
//!
//! ```no_run
//! use integrity_node::{config::load_config, IntegrityService};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = load_config("config.toml")?;
//!     let service = IntegrityService::from_config(&config)?;
//!
//!     let snapshot = service.generate_audit().await?;
//!     println!("Published snapshot {}", snapshot.snapshot_id);
//!
//!     Ok(())
//! }
//! ```

pub mod alerts;
pub mod api;
pub mod approval;
pub mod baseline;
pub mod collector;
pub mod comparison;
pub mod config;
pub mod crypto;
pub mod error;
pub mod journal;
pub mod keystore;
pub mod ledger;
pub mod monitor;
pub mod peer_client;
pub mod report_store;
pub mod retry;
pub mod service;
pub mod snapshot;
pub mod state;
pub mod types;

// Re-export 常用類型
pub use alerts::{Alert, AlertKind};
pub use approval::{Approval, ApprovalRequest, Correspondence};
pub use baseline::Baseline;
pub use config::NodeConfig;
pub use error::{IntegrityError, Result};
pub use service::IntegrityService;
pub use snapshot::SignedSnapshot;
pub use types::{Digest, Fingerprint, OperatorIdentity, Severity, Subject};
