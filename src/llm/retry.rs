//! 传输层重试：指数退避 + 抖动
//!
//! 可重试：HTTP 408 / 429 / 5xx 以及请求超时；其余 4xx 与网络错误立即返回。
//! 响应带 Retry-After 时取其与退避时长的较大值（受 max_delay 限制）。

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::llm::LlmError;

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大重试次数（首次请求不计入）
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 抖动比例，0.2 表示 ±20%
    pub jitter: f64,
    /// 单次请求超时
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: 0.2,
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// 不重试（测试与一次性调用）
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// 第 attempt 次重试前的期望等待（不含抖动）：min(max_delay, base_delay * 2^attempt)
    pub fn expected_delay(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(31) as i32);
        let base = self.base_delay.as_millis() as f64 * factor;
        Duration::from_millis(base.min(self.max_delay.as_millis() as f64) as u64)
    }

    /// 带抖动的实际等待
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let expected = self.expected_delay(attempt).as_millis() as f64;
        if self.jitter <= 0.0 {
            return Duration::from_millis(expected as u64);
        }
        let range = expected * self.jitter;
        let offset = rand::random::<f64>() * range * 2.0 - range;
        Duration::from_millis((expected + offset).max(0.0) as u64)
    }

    pub fn is_retryable_status(status: u16) -> bool {
        status == 408 || status == 429 || status >= 500
    }
}

/// 成功请求的结果
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub status: u16,
    pub body: String,
    pub retries: u32,
}

/// 发送请求并按策略重试
///
/// `build` 每次尝试都会被调用，以便重新构造请求体。取消会中断等待与在途请求。
pub async fn fetch_with_retry<F>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut build: F,
) -> Result<FetchOutcome, LlmError>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    let mut attempt: u32 = 0;
    loop {
        let request = build();
        let send = async {
            let response = request.send().await?;
            let status = response.status().as_u16();
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await?;
            Ok::<_, reqwest::Error>((status, retry_after, body))
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            res = tokio::time::timeout(policy.request_timeout, send) => res,
        };

        let retry_after = match result {
            Ok(Ok((status, retry_after, body))) => {
                if (200..300).contains(&status) {
                    return Ok(FetchOutcome {
                        status,
                        body,
                        retries: attempt,
                    });
                }
                if !RetryPolicy::is_retryable_status(status) || attempt >= policy.max_retries {
                    return Err(status_error(status, &body, attempt + 1));
                }
                tracing::warn!(status, attempt = attempt + 1, "llm request failed, retrying");
                retry_after
            }
            Ok(Err(e)) if e.is_timeout() => {
                if attempt >= policy.max_retries {
                    return Err(LlmError::Timeout { attempts: attempt + 1 });
                }
                tracing::warn!(attempt = attempt + 1, "llm request timed out, retrying");
                None
            }
            Ok(Err(e)) => return Err(LlmError::Network(e.to_string())),
            Err(_) => {
                if attempt >= policy.max_retries {
                    return Err(LlmError::Timeout { attempts: attempt + 1 });
                }
                tracing::warn!(attempt = attempt + 1, "llm request timed out, retrying");
                None
            }
        };

        let mut delay = policy.delay_for(attempt);
        if let Some(hint) = retry_after {
            delay = delay.max(hint.min(policy.max_delay));
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

/// 非 2xx 状态映射为 LlmError
pub fn status_error(status: u16, body: &str, attempts: u32) -> LlmError {
    match status {
        401 => LlmError::InvalidApiKey,
        429 => LlmError::RateLimited { attempts },
        408 => LlmError::Timeout { attempts },
        s if s >= 500 => LlmError::ProviderError { status: s, attempts },
        s => LlmError::RequestFailed {
            status: s,
            message: error_message(body),
        },
    }
}

/// 两种线上格式都使用 {"error": {"message": ...}}；否则截断原文
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.chars().take(200).collect())
}
