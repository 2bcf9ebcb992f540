//! 網絡請求重試機制模組
//!
//! 實現指數退避（Exponential Backoff）策略，用於拉取對等節點報告時處理臨時網絡故障。

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// 重試配置
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// 最大重試次數
    pub max_retries: u32,
    /// 初始延遲時間（毫秒）
    pub initial_delay_ms: u64,
    /// 延遲增長倍數
    pub multiplier: f64,
    /// 最大延遲時間（毫秒）
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 10000,
        }
    }
}

impl RetryConfig {
    /// 保守的重試配置（命令行一次性比對）
    pub fn conservative() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 30000,
        }
    }

    /// 不重試
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// 使用指數退避策略重試操作
///
/// # 參數
///
/// * `operation_name` - 操作名稱（用於日誌）
/// * `config` - 重試配置
/// * `operation` - 要重試的異步操作
///
/// # 重試策略
///
/// 1. 初始延遲：`initial_delay_ms`
/// 2. 每次失敗後延遲乘以 `multiplier`
/// 3. 延遲上限：`max_delay_ms`
/// 4. 最大重試次數：`max_retries`
///
/// 不應重試的結果（例如對方明確返回 404）應由操作本身以 `Ok` 表達。
pub async fn retry_with_exponential_backoff<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;
    let mut delay_ms = config.initial_delay_ms;

    loop {
        attempt += 1;

        debug!(
            operation = operation_name,
            attempt = attempt,
            max_retries = config.max_retries + 1,
            "Executing operation"
        );

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if attempt > config.max_retries {
                    warn!(
                        operation = operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after all retries"
                    );
                    return Err(e);
                }

                warn!(
                    operation = operation_name,
                    attempt = attempt,
                    delay_ms = delay_ms,
                    error = %e,
                    "Operation failed, retrying..."
                );

                sleep(Duration::from_millis(delay_ms)).await;

                // 計算下次延遲（指數退避）
                delay_ms = ((delay_ms as f64) * config.multiplier) as u64;
                delay_ms = delay_ms.min(config.max_delay_ms);
            }
        }
    }
}
