//! 完整性監控
//!
//! 每個週期為所有主體採集指紋並與基線比對：
//!
//! | 情況 | 動作 |
//! |------|------|
//! | 主體尚無基線 | 引導（`acceptedBy = null`） |
//! | 與參照一致 | 只追加主體前移檢查點 |
//! | 與參照不符 | 打開摘要不符告警，已打開則只更新觀測記錄 |
//! | 採集失敗 | 打開採集失敗告警（高），已打開則只更新觀測記錄 |
//!
//! 參照指紋：代碼集為基線，只追加主體為最近的檢查點。
//! 監控從不修改已有的基線條目。

use crate::alerts::{AlertEvent, AlertKind};
use crate::collector::FingerprintCollector;
use crate::error::Result;
use crate::state::SharedState;
use crate::types::{now, Digest, Fingerprint, Subject};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// 一個監控週期的結果
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    /// 成功採集的指紋
    pub fingerprints: BTreeMap<Subject, Fingerprint>,
    /// 採集失敗的主體及原因
    pub failures: BTreeMap<Subject, String>,
    /// 本週期引導進基線的主體
    pub bootstrapped: Vec<Subject>,
    /// 新打開的告警 ID
    pub raised: Vec<u64>,
    /// 更新了觀測記錄的告警 ID
    pub updated: Vec<u64>,
}

impl CycleReport {
    /// 所有主體都採集成功
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_subjects(&self) -> Vec<Subject> {
        self.failures.keys().copied().collect()
    }
}

/// 完整性監控器
pub struct IntegrityMonitor {
    state: SharedState,
    collector: Arc<FingerprintCollector>,
}

impl IntegrityMonitor {
    pub fn new(state: SharedState, collector: Arc<FingerprintCollector>) -> Self {
        Self { state, collector }
    }

    /// 執行一個監控週期
    ///
    /// 整個週期持有狀態鎖，與審批串行執行。
    /// 只有日誌寫入失敗才返回錯誤；採集失敗記錄在 `CycleReport` 中。
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let mut state = self.state.lock().await;
        let anchors = state.anchors();
        let observations = self.collector.collect_all(&anchors).await;

        let mut report = CycleReport::default();
        let at = now();

        for (subject, result) in observations {
            let expected = state.reference(subject);

            match result {
                Ok(observation) => {
                    let fingerprint = observation.fingerprint.clone();
                    match expected {
                        None => {
                            state.bootstrap(fingerprint.clone())?;
                            info!(
                                subject = %subject,
                                digest = %fingerprint.digest.short(),
                                "Subject bootstrapped into baseline"
                            );
                            report.bootstrapped.push(subject);
                        }
                        Some(baseline) if observation.matches(&baseline) => {
                            state.advance_checkpoint(fingerprint.clone())?;

                            // 告警不會自動清除，但觀測記錄保持最新
                            if state
                                .alerts()
                                .open_for(subject, AlertKind::DigestMismatch)
                                .is_some()
                            {
                                let event =
                                    state.alerts().plan_mismatch(subject, baseline.digest, fingerprint.digest, at);
                                record(&mut report, &event);
                                state.record_alert(event)?;
                            }
                        }
                        Some(baseline) => {
                            let event =
                                state.alerts().plan_mismatch(subject, baseline.digest, fingerprint.digest, at);
                            if let AlertEvent::Raised { alert } = &event {
                                warn!(
                                    alert_id = alert.id,
                                    subject = %subject,
                                    severity = ?alert.severity,
                                    expected = %baseline.digest.short(),
                                    observed = %fingerprint.digest.short(),
                                    "Integrity violation: digest does not match last verified state"
                                );
                            }
                            record(&mut report, &event);
                            state.record_alert(event)?;
                        }
                    }
                    report.fingerprints.insert(subject, fingerprint);
                }
                Err(e) => {
                    let reason = e.to_string();
                    let expected_digest = expected.map(|f| f.digest).unwrap_or(Digest::ZERO);
                    let event = state
                        .alerts()
                        .plan_collection_failure(subject, expected_digest, &reason, at);
                    if let AlertEvent::Raised { alert } = &event {
                        warn!(alert_id = alert.id, subject = %subject, reason = %reason, "Collection failure alert raised");
                    }
                    record(&mut report, &event);
                    state.record_alert(event)?;
                    report.failures.insert(subject, reason);
                }
            }
        }

        info!(
            collected = report.fingerprints.len(),
            failed = report.failures.len(),
            raised = report.raised.len(),
            updated = report.updated.len(),
            open_alerts = state.alerts().open_alerts().len(),
            "Monitor cycle complete"
        );

        Ok(report)
    }
}

fn record(report: &mut CycleReport, event: &AlertEvent) {
    match event {
        AlertEvent::Raised { alert } => report.raised.push(alert.id),
        AlertEvent::Observed { id, .. } => report.updated.push(*id),
        AlertEvent::Resolved { .. } => {}
    }
}
