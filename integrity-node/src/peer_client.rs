//! 對等節點報告拉取
//!
//! 通過 HTTP 獲取其他節點的 `GET /audit/report`，交給比對模組驗證。

use crate::error::{IntegrityError, Result};
use crate::retry::{retry_with_exponential_backoff, RetryConfig};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::info;

/// 對等節點 HTTP 客戶端
#[derive(Clone)]
pub struct PeerClient {
    http_client: Client,
    retry: RetryConfig,
}

impl PeerClient {
    /// 創建客戶端
    ///
    /// # 參數
    ///
    /// - `timeout`: 單次請求超時
    /// - `retry`: 重試配置
    pub fn new(timeout: Duration, retry: RetryConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IntegrityError::PeerFetch(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http_client, retry })
    }

    /// 拉取對等節點最新的簽名快照文檔（原始 JSON）
    ///
    /// 對方尚未生成快照（404）時返回 `NoAuditYet`，不重試
    pub async fn fetch_latest_report(&self, base_url: &str) -> Result<Value> {
        let url = format!("{}/audit/report", base_url.trim_end_matches('/'));
        info!(url = %url, "Fetching peer audit report");

        let document = retry_with_exponential_backoff("fetch_peer_report", &self.retry, || async {
            let response = self.http_client.get(&url).send().await?;
            let document: Result<Option<Value>> = match response.status() {
                StatusCode::NOT_FOUND => Ok(None),
                status if status.is_success() => Ok(Some(response.json::<Value>().await?)),
                status => Err(IntegrityError::PeerFetch(format!("{} returned {}", url, status))),
            };
            document
        })
        .await?;

        document.ok_or(IntegrityError::NoAuditYet)
    }
}
