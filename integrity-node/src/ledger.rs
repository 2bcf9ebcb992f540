//! 決策賬本接口
//!
//! 賬本的物理存儲引擎不屬於本子系統，這裡只把它建模為
//! 「按鍵有序的只追加日誌 + 範圍查詢接口」（`LedgerStore`）。
//! 推理引擎的輸出被當作不透明的 `(query, response)` 工件追加並取指紋。
//!
//! 提供兩個參考實現：
//! - `MemoryLedger`：內存存儲（測試與無狀態部署）
//! - `JsonlLedger`：JSON Lines 文件，每行一個條目，按字節偏移索引

use crate::crypto::{sha256, AppendOnlyLog};
use crate::error::{IntegrityError, Result};
use crate::types::{now, Digest, Subject};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

/// 賬本條目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// 從 0 開始的位置
    pub index: u64,
    pub timestamp: DateTime<Utc>,
    pub query: String,
    pub response: String,
    /// 寫入時計算的內容摘要
    pub hash: Digest,
}

impl LedgerEntry {
    /// 創建條目並計算其內容摘要
    pub fn new(index: u64, timestamp: DateTime<Utc>, query: &str, response: &str) -> Self {
        let hash = content_digest(&timestamp, query, response);
        Self {
            index,
            timestamp,
            query: query.to_string(),
            response: response.to_string(),
            hash,
        }
    }

    /// 重新計算內容摘要：`SHA256("{timestamp}::{query}::{response}")`
    pub fn content_digest(&self) -> Digest {
        content_digest(&self.timestamp, &self.query, &self.response)
    }

    /// 存儲的摘要是否與內容一致
    pub fn is_intact(&self) -> bool {
        self.hash == self.content_digest()
    }
}

fn content_digest(timestamp: &DateTime<Utc>, query: &str, response: &str) -> Digest {
    let payload = format!(
        "{}::{}::{}",
        timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        query,
        response
    );
    sha256(payload.as_bytes())
}

/// 賬本存儲接口
pub trait LedgerStore: Send + Sync {
    /// 當前條目數
    fn len(&self) -> Result<u64>;

    /// 讀取位置 `[start, end)` 的條目
    fn read_range(&self, start: u64, end: u64) -> Result<Vec<LedgerEntry>>;

    /// 追加條目，返回其位置
    fn append(&self, query: &str, response: &str) -> Result<LedgerEntry>;
}

/// 記錄一次推理（不透明工件）到賬本
pub fn record_inference(store: &dyn LedgerStore, query: &str, response: &str) -> Result<LedgerEntry> {
    let entry = store.append(query, response)?;
    debug!(index = entry.index, hash = %entry.hash.short(), "Inference recorded in ledger");
    Ok(entry)
}

/// 把賬本適配為滾動摘要的輸入
///
/// 每個條目在折疊前都會校驗：位置必須連續，存儲摘要必須與內容一致，
/// 否則採集以 `CollectionError` 失敗（賬本損壞）。
pub struct LedgerLog(pub Arc<dyn LedgerStore>);

impl AppendOnlyLog for LedgerLog {
    fn len(&self) -> Result<u64> {
        self.0.len()
    }

    fn item_digests(&self, start: u64, end: u64) -> Result<Vec<Digest>> {
        let entries = self.0.read_range(start, end)?;
        entries
            .iter()
            .enumerate()
            .map(|(offset, entry)| {
                let expected_index = start + offset as u64;
                if entry.index != expected_index {
                    return Err(corrupt(format!(
                        "entry at position {} claims index {}",
                        expected_index, entry.index
                    )));
                }
                if !entry.is_intact() {
                    return Err(corrupt(format!(
                        "entry {} stored hash does not match its content",
                        entry.index
                    )));
                }
                Ok(entry.content_digest())
            })
            .collect()
    }
}

fn corrupt(reason: String) -> IntegrityError {
    IntegrityError::Collection {
        subject: Subject::Ledger,
        reason,
    }
}

/// 內存賬本
#[derive(Default)]
pub struct MemoryLedger {
    entries: RwLock<Vec<LedgerEntry>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryLedger {
    fn len(&self) -> Result<u64> {
        let entries = self
            .entries
            .read()
            .map_err(|_| IntegrityError::Journal("ledger lock poisoned".to_string()))?;
        Ok(entries.len() as u64)
    }

    fn read_range(&self, start: u64, end: u64) -> Result<Vec<LedgerEntry>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| IntegrityError::Journal("ledger lock poisoned".to_string()))?;
        let end = (end as usize).min(entries.len());
        let start = (start as usize).min(end);
        Ok(entries[start..end].to_vec())
    }

    fn append(&self, query: &str, response: &str) -> Result<LedgerEntry> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| IntegrityError::Journal("ledger lock poisoned".to_string()))?;
        let entry = LedgerEntry::new(entries.len() as u64, now(), query, response);
        entries.push(entry.clone());
        Ok(entry)
    }
}

/// 行偏移索引
#[derive(Debug, Default)]
struct LineIndex {
    /// 每個完整行的起始字節偏移
    offsets: Vec<u64>,
    /// 已建立索引的字節數
    indexed_bytes: u64,
}

/// JSON Lines 文件賬本
///
/// 文件只追加；讀取時按已知行偏移直接定位，不重新解析整個文件。
/// 文件變短時索引從頭重建。
pub struct JsonlLedger {
    path: PathBuf,
    index: Mutex<LineIndex>,
}

impl JsonlLedger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        info!("Opening JSONL ledger at {:?}", path);

        let ledger = Self {
            path,
            index: Mutex::new(LineIndex::default()),
        };
        let count = ledger.len()?;
        info!("Ledger contains {} entries", count);
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_index(&self) -> Result<std::sync::MutexGuard<'_, LineIndex>> {
        self.index
            .lock()
            .map_err(|_| IntegrityError::Journal("ledger index lock poisoned".to_string()))
    }

    /// 把新追加的完整行加入索引
    fn refresh(&self, index: &mut LineIndex) -> Result<()> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                *index = LineIndex::default();
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let size = file.metadata()?.len();
        if size < index.indexed_bytes {
            debug!("Ledger file shrank ({} < {}), rebuilding index", size, index.indexed_bytes);
            *index = LineIndex::default();
        }

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(index.indexed_bytes))?;

        let mut position = index.indexed_bytes;
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = reader.read_until(b'\n', &mut line)?;
            // 未以換行結尾的行視為仍在寫入
            if read == 0 || line.last() != Some(&b'\n') {
                break;
            }
            if !line.iter().all(|b| b.is_ascii_whitespace()) {
                index.offsets.push(position);
            }
            position += read as u64;
        }
        index.indexed_bytes = position;
        Ok(())
    }
}

impl LedgerStore for JsonlLedger {
    fn len(&self) -> Result<u64> {
        let mut index = self.lock_index()?;
        self.refresh(&mut index)?;
        Ok(index.offsets.len() as u64)
    }

    fn read_range(&self, start: u64, end: u64) -> Result<Vec<LedgerEntry>> {
        let mut index = self.lock_index()?;
        self.refresh(&mut index)?;

        let end = (end as usize).min(index.offsets.len());
        let start = start as usize;
        if start >= end {
            return Ok(Vec::new());
        }

        let mut reader = BufReader::new(File::open(&self.path)?);
        reader.seek(SeekFrom::Start(index.offsets[start]))?;

        let mut entries = Vec::with_capacity(end - start);
        let mut line = String::new();
        while entries.len() < end - start {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Err(corrupt("ledger file ended before indexed entries".to_string()));
            }
            if line.trim().is_empty() {
                continue;
            }
            let entry: LedgerEntry = serde_json::from_str(line.trim_end())
                .map_err(|e| corrupt(format!("unparseable ledger line: {}", e)))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    fn append(&self, query: &str, response: &str) -> Result<LedgerEntry> {
        let mut index = self.lock_index()?;
        self.refresh(&mut index)?;

        let entry = LedgerEntry::new(index.offsets.len() as u64, now(), query, response);
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;

        self.refresh(&mut index)?;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::rolling::digest_items;
    use tempfile::tempdir;

    #[test]
    fn test_entry_hash_covers_content() {
        let entry = LedgerEntry::new(0, now(), "query A", "response");
        assert!(entry.is_intact());

        let mut tampered = entry.clone();
        tampered.response = "other".to_string();
        assert!(!tampered.is_intact());
    }

    #[test]
    fn test_memory_ledger_append_and_read() {
        let ledger = MemoryLedger::new();
        record_inference(&ledger, "q1", "r1").unwrap();
        record_inference(&ledger, "q2", "r2").unwrap();

        assert_eq!(ledger.len().unwrap(), 2);
        let entries = ledger.read_range(1, 5).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].query, "q2");
        assert_eq!(entries[0].index, 1);
    }

    #[test]
    fn test_jsonl_ledger_persists_and_reads_by_offset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");

        let ledger = JsonlLedger::open(&path).unwrap();
        for i in 0..5 {
            ledger.append(&format!("query {}", i), "ok").unwrap();
        }

        let reopened = JsonlLedger::open(&path).unwrap();
        assert_eq!(reopened.len().unwrap(), 5);

        let middle = reopened.read_range(2, 4).unwrap();
        assert_eq!(middle.len(), 2);
        assert_eq!(middle[0].query, "query 2");
        assert_eq!(middle[1].index, 3);
    }

    #[test]
    fn test_ledger_log_digests_match_content() {
        let store = Arc::new(MemoryLedger::new());
        record_inference(store.as_ref(), "a", "1").unwrap();
        record_inference(store.as_ref(), "b", "2").unwrap();

        let log = LedgerLog(store.clone());
        let digests = log.item_digests(0, 2).unwrap();
        let entries = store.read_range(0, 2).unwrap();

        assert_eq!(digests[0], entries[0].content_digest());
        assert_ne!(digest_items(digests.iter()), Digest::ZERO);
    }

    #[test]
    fn test_ledger_log_rejects_corrupt_entry() {
        let store = Arc::new(MemoryLedger::new());
        record_inference(store.as_ref(), "a", "1").unwrap();
        store.entries.write().unwrap()[0].query = "rewritten".to_string();

        let log = LedgerLog(store);
        match log.item_digests(0, 1) {
            Err(IntegrityError::Collection { subject, .. }) => assert_eq!(subject, Subject::Ledger),
            other => panic!("Expected collection error, got {:?}", other),
        }
    }
}
