//! 指紋採集模組
//!
//! 本模組為三類主體計算確定性的 SHA-256 指紋。
//!
//! # 採集策略
//!
//! 1. **代碼集**（`CODE_SET`）：
//!    - 遞歸遍歷代碼根目錄（不跟隨符號鏈接），按擴展名過濾
//!    - 每個文件單獨哈希，按 `/` 分隔的相對路徑排序
//!    - `SHA256( Σ path || 0x00 || file_digest )`
//!    - 目錄列舉順序不影響結果；內容或路徑變化則改變結果
//!
//! 2. **賬本**（`LEDGER`）與 **報告集**（`REPORT_SET`）：
//!    - 從創世到尾部的滾動摘要，每個週期只折疊新條目
//!    - 同時返回檢查點位置上的錨點摘要，正常追加不會造成不符
//!
//! 採集失敗一律返回錯誤，絕不以舊摘要或零摘要代替。

use crate::crypto::{AppendOnlyLog, RollingDigest};
use crate::error::{IntegrityError, Result};
use crate::ledger::{LedgerLog, LedgerStore};
use crate::report_store::SnapshotStore;
use crate::types::{now, Digest, Fingerprint, Subject};
use sha2::{Digest as _, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// 代碼集的採集範圍
#[derive(Debug, Clone)]
pub struct CodeSetSource {
    pub root: PathBuf,
    /// 納入的文件擴展名（不含點）
    pub extensions: Vec<String>,
    /// 排除的目錄名
    pub exclude_dirs: Vec<String>,
}

impl CodeSetSource {
    pub fn new(root: impl Into<PathBuf>, extensions: Vec<String>, exclude_dirs: Vec<String>) -> Self {
        Self {
            root: root.into(),
            extensions,
            exclude_dirs,
        }
    }

    /// 計算代碼集摘要，返回 `(digest, 文件數)`
    pub fn digest(&self) -> Result<(Digest, u64)> {
        if !self.root.is_dir() {
            return Err(code_error(format!("code root {:?} is not a directory", self.root)));
        }

        let mut files: Vec<(String, Digest)> = Vec::new();
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !self.is_excluded(e));

        for entry in walker {
            let entry = entry.map_err(|e| code_error(format!("failed to walk code root: {}", e)))?;
            if !entry.file_type().is_file() || !self.has_tracked_extension(entry.path()) {
                continue;
            }

            let relative = relative_path(&self.root, entry.path())?;
            let digest = file_digest(entry.path())
                .map_err(|e| code_error(format!("failed to read {}: {}", relative, e)))?;
            files.push((relative, digest));
        }

        files.sort_by(|a, b| a.0.cmp(&b.0));

        let mut hasher = Sha256::new();
        for (path, digest) in &files {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(digest.as_bytes());
        }

        Ok((Digest(hasher.finalize().into()), files.len() as u64))
    }

    fn is_excluded(&self, entry: &DirEntry) -> bool {
        entry.depth() > 0
            && entry.file_type().is_dir()
            && entry
                .file_name()
                .to_str()
                .map(|name| self.exclude_dirs.iter().any(|d| d == name))
                .unwrap_or(false)
    }

    fn has_tracked_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| self.extensions.iter().any(|allowed| allowed == ext))
            .unwrap_or(false)
    }
}

fn code_error(reason: String) -> IntegrityError {
    IntegrityError::Collection {
        subject: Subject::CodeSet,
        reason,
    }
}

/// 根目錄相對路徑，統一使用 `/` 分隔
fn relative_path(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| code_error(format!("{:?} is outside the code root", path)))?;

    let mut parts = Vec::new();
    for component in relative.components() {
        let part = component
            .as_os_str()
            .to_str()
            .ok_or_else(|| code_error(format!("non UTF-8 path: {:?}", relative)))?;
        parts.push(part);
    }
    Ok(parts.join("/"))
}

fn file_digest(path: &Path) -> io::Result<Digest> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(Digest(hasher.finalize().into()))
}

/// 一次採集的結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub fingerprint: Fingerprint,
    /// 只追加主體在檢查點位置上的前綴摘要
    ///
    /// 代碼集沒有錨點；只追加主體的位置超出當前長度（歷史被截斷）時為 `None`
    pub anchor_digest: Option<Digest>,
}

impl Observation {
    /// 是否與參照指紋（基線或檢查點）一致
    ///
    /// - 代碼集：摘要相等
    /// - 只追加主體：錨點摘要等於參照摘要，且長度沒有縮短
    pub fn matches(&self, reference: &Fingerprint) -> bool {
        if self.fingerprint.subject.is_append_only() {
            self.anchor_digest.as_ref() == Some(&reference.digest)
                && self.fingerprint.input_size >= reference.input_size
        } else {
            self.fingerprint.digest == reference.digest
        }
    }
}

/// 指紋採集器
///
/// 每個只追加主體的滾動摘要狀態有自己的鎖，不同主體可並發採集
pub struct FingerprintCollector {
    code: CodeSetSource,
    ledger: LedgerLog,
    reports: Arc<SnapshotStore>,
    ledger_rolling: Mutex<RollingDigest>,
    report_rolling: Mutex<RollingDigest>,
}

impl FingerprintCollector {
    /// 創建採集器
    ///
    /// # 參數
    ///
    /// - `code`: 代碼集範圍
    /// - `ledger`: 賬本存儲
    /// - `reports`: 快照歷史
    /// - `rescan_every`: 每隔多少次採集全量重掃只追加主體（0 表示從不）
    pub fn new(
        code: CodeSetSource,
        ledger: Arc<dyn LedgerStore>,
        reports: Arc<SnapshotStore>,
        rescan_every: u32,
    ) -> Self {
        Self {
            code,
            ledger: LedgerLog(ledger),
            reports,
            ledger_rolling: Mutex::new(RollingDigest::new(rescan_every)),
            report_rolling: Mutex::new(RollingDigest::new(rescan_every)),
        }
    }

    /// 採集單個主體的指紋
    pub fn collect(&self, subject: Subject) -> Result<Fingerprint> {
        self.observe(subject, None).map(|o| o.fingerprint)
    }

    /// 採集並計算錨點摘要
    ///
    /// # 參數
    ///
    /// - `anchor`: 檢查點記錄的條目數（僅對只追加主體有意義）
    pub fn observe(&self, subject: Subject, anchor: Option<u64>) -> Result<Observation> {
        let observation = match subject {
            Subject::CodeSet => {
                let (digest, files) = self.code.digest()?;
                Observation {
                    fingerprint: Fingerprint {
                        subject,
                        digest,
                        computed_at: now(),
                        input_size: files,
                    },
                    anchor_digest: None,
                }
            }
            Subject::Ledger => observe_log(subject, &self.ledger_rolling, &self.ledger, anchor)?,
            Subject::ReportSet => {
                observe_log(subject, &self.report_rolling, self.reports.as_ref(), anchor)?
            }
        };

        debug!(
            subject = %subject,
            digest = %observation.fingerprint.digest.short(),
            input_size = observation.fingerprint.input_size,
            "Fingerprint collected"
        );
        Ok(observation)
    }

    /// 並發採集所有主體，每個主體在阻塞工作線程上執行
    ///
    /// 單個主體失敗不影響其他主體
    pub async fn collect_all(
        self: &Arc<Self>,
        anchors: &BTreeMap<Subject, u64>,
    ) -> BTreeMap<Subject, Result<Observation>> {
        let handles: Vec<_> = Subject::ALL
            .into_iter()
            .map(|subject| {
                let collector = Arc::clone(self);
                let anchor = anchors.get(&subject).copied();
                (
                    subject,
                    tokio::task::spawn_blocking(move || collector.observe(subject, anchor)),
                )
            })
            .collect();

        let mut results = BTreeMap::new();
        for (subject, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(IntegrityError::Collection {
                    subject,
                    reason: format!("collection task failed: {}", e),
                }),
            };
            if let Err(e) = &result {
                warn!(subject = %subject, error = %e, "Fingerprint collection failed");
            }
            results.insert(subject, result);
        }
        results
    }
}

fn observe_log(
    subject: Subject,
    rolling: &Mutex<RollingDigest>,
    log: &dyn AppendOnlyLog,
    anchor: Option<u64>,
) -> Result<Observation> {
    let mut rolling = rolling.lock().map_err(|_| IntegrityError::Collection {
        subject,
        reason: "rolling digest lock poisoned".to_string(),
    })?;

    let observed = rolling.observe(log, anchor).map_err(|e| match e {
        IntegrityError::Collection { .. } => e,
        other => IntegrityError::Collection {
            subject,
            reason: other.to_string(),
        },
    })?;

    Ok(Observation {
        fingerprint: Fingerprint {
            subject,
            digest: observed.head,
            computed_at: now(),
            input_size: observed.len,
        },
        anchor_digest: observed.anchor,
    })
}
