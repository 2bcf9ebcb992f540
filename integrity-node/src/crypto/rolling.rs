//! 只追加日誌的滾動摘要
//!
//! ```text
//! d_0 = 0x00 * 32
//! d_n = SHA256(d_{n-1} || item_n)
//! ```
//!
//! 每個監控週期只折疊新追加的條目（O(新條目數)），不重新掃描整個歷史。
//! 為了仍能發現對歷史的追溯篡改：
//! 1. 每次觀測重新讀取最後一個已折疊條目，發現尾部原地改寫
//! 2. 日誌長度變短時強制全量重掃
//! 3. 每 `rescan_every` 次觀測執行一次全量重掃，深處的篡改在有限週期內被發現
//!
//! 另外維護一個**錨點**：最近一次驗證通過的位置上的前綴摘要。正常追加不會改變錨點摘要，
//! 改寫或截斷歷史則會改變。

use crate::error::Result;
use crate::types::Digest;
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::digest::sha256_parts;

/// 每批從日誌讀取的條目數
const FOLD_BATCH: u64 = 1024;

/// 滾動摘要的一步
pub fn fold(prev: &Digest, item: &Digest) -> Digest {
    sha256_parts(&[prev.as_bytes(), item.as_bytes()])
}

/// 從創世值開始折疊整個序列
pub fn digest_items<'a, I>(items: I) -> Digest
where
    I: IntoIterator<Item = &'a Digest>,
{
    items.into_iter().fold(Digest::ZERO, |acc, item| fold(&acc, item))
}

/// 可被滾動摘要的只追加日誌
///
/// 賬本與快照歷史都實現此 trait
pub trait AppendOnlyLog: Send + Sync {
    /// 當前條目數
    fn len(&self) -> Result<u64>;

    /// 位置 `[start, end)` 上每個條目的內容摘要
    fn item_digests(&self, start: u64, end: u64) -> Result<Vec<Digest>>;
}

/// 一次觀測的結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollingObservation {
    /// 尾部摘要（整個日誌）
    pub head: Digest,
    /// 日誌長度
    pub len: u64,
    /// 請求的錨點位置上的前綴摘要；位置超出日誌長度（被截斷）時為 `None`
    pub anchor: Option<Digest>,
}

/// 增量滾動摘要狀態
#[derive(Debug, Clone)]
pub struct RollingDigest {
    count: u64,
    head: Digest,
    last_item: Option<Digest>,
    anchors: BTreeMap<u64, Digest>,
    observations_since_rescan: u32,
    rescan_every: u32,
}

impl RollingDigest {
    /// `rescan_every = 0` 表示從不定期全量重掃
    pub fn new(rescan_every: u32) -> Self {
        Self {
            count: 0,
            head: Digest::ZERO,
            last_item: None,
            anchors: BTreeMap::new(),
            observations_since_rescan: 0,
            rescan_every,
        }
    }

    /// 已折疊的條目數
    pub fn folded(&self) -> u64 {
        self.count
    }

    fn reset(&mut self) {
        self.count = 0;
        self.head = Digest::ZERO;
        self.last_item = None;
        self.anchors.clear();
        self.observations_since_rescan = 0;
    }

    /// 觀測日誌當前狀態，只折疊新條目
    ///
    /// 讀取失敗時狀態保持不變（不會部分應用）
    pub fn observe(&mut self, log: &dyn AppendOnlyLog, anchor: Option<u64>) -> Result<RollingObservation> {
        let len = log.len()?;

        let reset_reason = if self.rescan_every > 0 && self.observations_since_rescan >= self.rescan_every {
            Some("periodic full rescan")
        } else if len < self.count {
            Some("log shrank")
        } else if self.count > 0 && self.tail_rewritten(log)? {
            Some("last folded entry rewritten")
        } else if matches!(anchor, Some(a) if a > 0 && a < self.count && !self.anchors.contains_key(&a)) {
            Some("anchor behind cached position")
        } else {
            None
        };

        // 在副本上折疊，成功後再提交，避免讀取錯誤導致半更新
        let mut next = self.clone();
        if let Some(reason) = reset_reason {
            debug!(reason, folded = self.count, "Rolling digest reset");
            next.reset();
        }

        if let Some(a) = anchor {
            if a == next.count {
                next.anchors.entry(a).or_insert(next.head);
            }
        }

        let start = next.count;
        while next.count < len {
            let end = (next.count + FOLD_BATCH).min(len);
            let items = log.item_digests(next.count, end)?;
            if items.len() as u64 != end - next.count {
                return Err(crate::error::IntegrityError::Journal(format!(
                    "log returned {} items for range {}..{}",
                    items.len(),
                    next.count,
                    end
                )));
            }
            for item in items {
                next.head = fold(&next.head, &item);
                next.count += 1;
                next.last_item = Some(item);
                if anchor == Some(next.count) {
                    next.anchors.insert(next.count, next.head);
                }
            }
        }

        if next.count > start {
            debug!(from = start, to = next.count, "Folded new log entries");
        }
        if reset_reason.is_some() {
            info!(entries = next.count, "Rolling digest rebuilt from genesis");
        }

        next.anchors.retain(|k, _| Some(*k) == anchor);
        next.observations_since_rescan += 1;

        // 位置 0 的前綴摘要恆為創世值
        let anchor_digest = anchor.and_then(|a| match a {
            0 => Some(Digest::ZERO),
            a => next.anchors.get(&a).copied(),
        });
        *self = next;

        Ok(RollingObservation {
            head: self.head,
            len,
            anchor: anchor_digest,
        })
    }

    fn tail_rewritten(&self, log: &dyn AppendOnlyLog) -> Result<bool> {
        let current = log.item_digests(self.count - 1, self.count)?;
        Ok(current.first() != self.last_item.as_ref())
    }
}
