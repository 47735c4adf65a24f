//! LLM 客户端抽象
//!
//! 所有后端（Anthropic / OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient::call：
//! 输入统一的 Message 列表与可选工具 schema，输出文本与工具调用。线上格式差异留在各适配器内部。

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::memory::Message;
use crate::tools::{ToolCall, ToolSpec};

/// Token 使用量（单次调用）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// 一次 LLM 调用的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
    /// 本次调用在传输层发生的重试次数
    pub retries: u32,
}

impl LlmResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Default::default()
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// 机器可读的错误码，编排器据此决定短路与提示文案
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LlmErrorCode {
    #[serde(rename = "llm_request_failed")]
    RequestFailed,
    #[serde(rename = "llm_timeout")]
    Timeout,
    #[serde(rename = "llm_network_error")]
    NetworkError,
    #[serde(rename = "llm_cancelled")]
    Cancelled,
}

impl LlmErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmErrorCode::RequestFailed => "llm_request_failed",
            LlmErrorCode::Timeout => "llm_timeout",
            LlmErrorCode::NetworkError => "llm_network_error",
            LlmErrorCode::Cancelled => "llm_cancelled",
        }
    }
}

impl std::fmt::Display for LlmErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// LLM 调用错误（重试耗尽后才会出现）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("Rate limited by provider after {attempts} attempt(s)")]
    RateLimited { attempts: u32 },

    #[error("Provider error (HTTP {status}) after {attempts} attempt(s)")]
    ProviderError { status: u16, attempts: u32 },

    #[error("Request failed (HTTP {status}): {message}")]
    RequestFailed { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Request timed out after {attempts} attempt(s)")]
    Timeout { attempts: u32 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl LlmError {
    pub fn code(&self) -> LlmErrorCode {
        match self {
            LlmError::InvalidApiKey
            | LlmError::RateLimited { .. }
            | LlmError::ProviderError { .. }
            | LlmError::RequestFailed { .. }
            | LlmError::InvalidResponse(_) => LlmErrorCode::RequestFailed,
            LlmError::Timeout { .. } => LlmErrorCode::Timeout,
            LlmError::Network(_) => LlmErrorCode::NetworkError,
            LlmError::Cancelled => LlmErrorCode::Cancelled,
        }
    }

    /// 放弃前发出的请求次数；不重试的错误为 1
    pub fn attempts(&self) -> u32 {
        match self {
            LlmError::RateLimited { attempts }
            | LlmError::ProviderError { attempts, .. }
            | LlmError::Timeout { attempts } => (*attempts).max(1),
            _ => 1,
        }
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 单次完成；tools 为 None 时不向模型暴露工具
    async fn call(
        &self,
        messages: &[Message],
        tools: Option<&[ToolSpec]>,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, LlmError>;

    /// 后端名称（日志与遥测用）
    fn provider(&self) -> &str;

    fn model(&self) -> &str {
        ""
    }
}
