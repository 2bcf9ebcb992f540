//! 完整性服務
//!
//! 把採集器、監控、審批閘門、簽名器與快照歷史組裝成一個句柄，
//! 供 HTTP 接口與週期任務共用。
//!
//! # 審計週期合併
//!
//! `generate_audit` 與週期任務共用一個合併閘門：已有週期在執行時，
//! 調用方等待該週期的結果，而不是啟動第二個週期。週期以獨立任務運行，
//! 調用方（例如斷開的 HTTP 請求）被丟棄不會中斷進行中的週期。

use crate::alerts::Alert;
use crate::approval::{Approval, ApprovalGate, ApprovalRequest};
use crate::baseline::Baseline;
use crate::collector::{CodeSetSource, FingerprintCollector};
use crate::comparison::{compare_snapshots, ComparisonResult, TrustedPeer};
use crate::config::NodeConfig;
use crate::error::{IntegrityError, Result};
use crate::journal::AuditJournal;
use crate::keystore::Keystore;
use crate::ledger::{record_inference, JsonlLedger, LedgerEntry, LedgerStore, MemoryLedger};
use crate::monitor::IntegrityMonitor;
use crate::report_store::SnapshotStore;
use crate::snapshot::{ReportSigner, SignedSnapshot, SnapshotBody};
use crate::state::{IntegrityState, SharedState};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// 賬本分頁的最大條目數
pub const MAX_LEDGER_PAGE: u64 = 100;

/// 審計週期的結果（可在多個等待者之間共享）
pub type AuditOutcome = std::result::Result<Arc<SignedSnapshot>, Arc<IntegrityError>>;

type InFlight = watch::Receiver<Option<AuditOutcome>>;

/// 賬本分頁（最新條目在前）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerPage {
    pub items: Vec<LedgerEntry>,
    pub limit: u64,
    pub offset: u64,
    pub total: u64,
}

/// 狀態視圖
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub node_identity: String,
    pub baseline_summary: Baseline,
    pub open_alerts: Vec<Alert>,
    pub latest_snapshot_id: Option<String>,
}

/// 組裝服務所需的部件
pub struct ServiceParts {
    pub node_identity: String,
    pub state: SharedState,
    pub collector: Arc<FingerprintCollector>,
    pub ledger: Arc<dyn LedgerStore>,
    pub reports: Arc<SnapshotStore>,
    pub signer: ReportSigner,
    pub gate: ApprovalGate,
    pub trusted_peers: Vec<TrustedPeer>,
}

/// 完整性服務
pub struct IntegrityService {
    node_identity: String,
    state: SharedState,
    ledger: Arc<dyn LedgerStore>,
    reports: Arc<SnapshotStore>,
    monitor: IntegrityMonitor,
    gate: ApprovalGate,
    signer: ReportSigner,
    trusted_peers: Vec<TrustedPeer>,
    in_flight: Mutex<Option<InFlight>>,
}

impl IntegrityService {
    pub fn new(parts: ServiceParts) -> Arc<Self> {
        Arc::new(Self {
            monitor: IntegrityMonitor::new(parts.state.clone(), parts.collector),
            node_identity: parts.node_identity,
            state: parts.state,
            ledger: parts.ledger,
            reports: parts.reports,
            gate: parts.gate,
            signer: parts.signer,
            trusted_peers: parts.trusted_peers,
            in_flight: Mutex::new(None),
        })
    }

    /// 按配置組裝服務
    ///
    /// # 文件操作
    ///
    /// 1. 打開狀態目錄並重放日誌（未配置時只在內存中運行）
    /// 2. 加載或生成簽名密鑰；失敗時簽名器不可用，監控照常運行
    /// 3. 打開賬本與快照歷史，已有報告用本節點密鑰校驗
    pub fn from_config(config: &NodeConfig) -> Result<Arc<Self>> {
        // 步驟 1: 狀態
        let journal = match &config.state_dir {
            Some(dir) => AuditJournal::open(dir)?,
            None => {
                warn!("No state_dir configured; baseline, alerts and reports are kept in memory only");
                AuditJournal::in_memory()
            }
        };
        let state = IntegrityState::restore(journal)?.into_shared();

        // 步驟 2: 簽名密鑰
        let signer = match Keystore::load_or_generate(
            &config.keystore_path,
            config.signature_algorithm,
            config.generate_keys_if_missing,
        ) {
            Ok(keystore) => ReportSigner::new(keystore),
            Err(e) => {
                error!(error = %e, "Signing key unavailable; snapshots will not be published");
                ReportSigner::unavailable(e.to_string())
            }
        };

        // 步驟 3: 賬本與快照歷史（報告必須由本節點密鑰簽名）
        let ledger: Arc<dyn LedgerStore> = match &config.ledger_path {
            Some(path) => Arc::new(JsonlLedger::open(path)?),
            None => Arc::new(MemoryLedger::new()),
        };
        let reports = Arc::new(match &config.state_dir {
            Some(dir) => SnapshotStore::open(&dir.join("reports"), signer.trust())?,
            None => SnapshotStore::in_memory(),
        });

        let collector = Arc::new(FingerprintCollector::new(
            CodeSetSource::new(
                &config.code_root,
                config.code_extensions.clone(),
                config.code_exclude_dirs.clone(),
            ),
            ledger.clone(),
            reports.clone(),
            config.ledger_rescan_every,
        ));

        let gate = ApprovalGate::new(state.clone(), collector.clone(), config.approver_identities()?);

        info!(
            node = %config.node_identity,
            code_root = ?config.code_root,
            algorithm = ?signer.algorithm(),
            trusted_peers = config.trusted_peers.len(),
            "Integrity service assembled"
        );

        Ok(Self::new(ServiceParts {
            node_identity: config.node_identity.clone(),
            state,
            collector,
            ledger,
            reports,
            signer,
            gate,
            trusted_peers: config.trusted_peers()?,
        }))
    }

    pub fn node_identity(&self) -> &str {
        &self.node_identity
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn reports(&self) -> &Arc<SnapshotStore> {
        &self.reports
    }

    pub fn signer(&self) -> &ReportSigner {
        &self.signer
    }

    /// 當前基線、打開的告警與最新快照 ID
    pub async fn get_status(&self) -> StatusView {
        let state = self.state.lock().await;
        StatusView {
            node_identity: self.node_identity.clone(),
            baseline_summary: state.baseline().clone(),
            open_alerts: state.alerts().open_alerts(),
            latest_snapshot_id: self.reports.latest().map(|s| s.snapshot_id.clone()),
        }
    }

    /// 最新的簽名快照
    pub fn latest_report(&self) -> Option<Arc<SignedSnapshot>> {
        self.reports.latest()
    }

    /// 審批基線變更
    pub async fn approve(&self, request: ApprovalRequest) -> Result<Approval> {
        self.gate.approve(request).await
    }

    /// 記錄一次推理到賬本
    pub fn record_inference(&self, query: &str, response: &str) -> Result<LedgerEntry> {
        record_inference(self.ledger.as_ref(), query, response)
    }

    /// 分頁讀取賬本，最新條目在前
    ///
    /// # 參數
    ///
    /// - `limit`: 1 到 `MAX_LEDGER_PAGE`
    /// - `offset`: 跳過的最新條目數
    ///
    /// # 錯誤
    ///
    /// - `InvalidQuery`: `limit` 超出範圍
    pub fn ledger_entries(&self, limit: u64, offset: u64) -> Result<LedgerPage> {
        if limit == 0 || limit > MAX_LEDGER_PAGE {
            return Err(IntegrityError::InvalidQuery(format!(
                "limit must be between 1 and {}",
                MAX_LEDGER_PAGE
            )));
        }

        let total = self.ledger.len()?;
        let end = total.saturating_sub(offset);
        let start = end.saturating_sub(limit);
        let mut items = self.ledger.read_range(start, end)?;
        items.reverse();

        Ok(LedgerPage {
            items,
            limit,
            offset,
            total,
        })
    }

    /// 比對對等節點的快照文檔與本地基線
    pub async fn compare_with(&self, peer_document: &Value) -> Result<ComparisonResult> {
        let local = self.state.lock().await.baseline().fingerprints();
        compare_snapshots(&local, peer_document, &self.trusted_peers)
    }

    /// 生成審計快照（與進行中的週期合併）
    pub async fn generate_audit(self: &Arc<Self>) -> AuditOutcome {
        let mut rx = match self.join_or_start() {
            Ok(rx) => rx,
            Err(e) => return Err(Arc::new(e)),
        };

        loop {
            let current = rx.borrow().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if rx.changed().await.is_err() {
                let last = rx.borrow().clone();
                return last.unwrap_or_else(|| {
                    Err(Arc::new(IntegrityError::Journal("audit cycle aborted".to_string())))
                });
            }
        }
    }

    fn join_or_start(self: &Arc<Self>) -> Result<InFlight> {
        let mut slot = self
            .in_flight
            .lock()
            .map_err(|_| IntegrityError::Journal("audit gate lock poisoned".to_string()))?;

        if let Some(rx) = slot.as_ref() {
            info!("Audit cycle already in flight; joining it");
            return Ok(rx.clone());
        }

        let (tx, rx) = watch::channel(None);
        *slot = Some(rx.clone());

        let service = Arc::clone(self);
        tokio::spawn(async move {
            let guard = InFlightGuard(Arc::clone(&service));
            let outcome = service.run_audit_cycle().await.map_err(Arc::new);
            // 先清空閘門再發布結果，之後的調用會啟動新週期
            drop(guard);
            let _ = tx.send(Some(outcome));
        });

        Ok(rx)
    }

    /// 採集、監控、組裝、簽名、發布
    async fn run_audit_cycle(&self) -> Result<Arc<SignedSnapshot>> {
        let report = self.monitor.run_cycle().await?;
        if !report.is_complete() {
            let failed = report.failed_subjects();
            warn!(failed = ?failed, "Audit incomplete; no snapshot published");
            return Err(IntegrityError::AuditIncomplete { failed });
        }

        // 鎖內複製，鎖外簽名
        let body = {
            let state = self.state.lock().await;
            SnapshotBody::compose(
                &self.node_identity,
                state.baseline().fingerprints(),
                state.alerts().open_alerts(),
            )
        };

        let signed = self.signer.sign(body).map_err(|e| {
            error!(error = %e, "Snapshot signing failed; previous snapshot remains latest");
            e
        })?;
        self.reports.publish(signed)
    }

    /// 週期性審計任務，收到關閉信號後退出
    pub fn spawn_periodic(self: &Arc<Self>, period: Duration, shutdown: Arc<Notify>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        info!("Executing periodic audit...");
                        match service.generate_audit().await {
                            Ok(snapshot) => info!(
                                snapshot_id = %snapshot.snapshot_id,
                                open_alerts = snapshot.snapshot.open_alerts.len(),
                                "Periodic audit complete"
                            ),
                            Err(e) => error!(error = %e, "Periodic audit failed"),
                        }
                    }
                    _ = shutdown.notified() => {
                        info!("Received shutdown signal, stopping periodic audits");
                        break;
                    }
                }
            }
        })
    }
}

/// 週期結束（包括 panic）時清空合併閘門
struct InFlightGuard(Arc<IntegrityService>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.0.in_flight.lock() {
            *slot = None;
        }
    }
}
