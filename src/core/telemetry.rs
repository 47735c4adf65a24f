//! 单轮遥测：计数器 + 只追加的事件日志，轮次结束时 seal
//!
//! MeteredLlm 包装本轮使用的 LLM 客户端，自动记录调用次数、重试、错误与 token 估算。

use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::llm::{LlmClient, LlmError, LlmResponse};
use crate::memory::{Message, TokenEstimator};
use crate::tools::ToolSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryEventKind {
    RunStart,
    Iteration,
    LlmCall,
    LlmRetry,
    ToolCallStart,
    ToolCallEnd,
    Guardrail,
    Error,
    RunEnd,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    #[serde(rename = "type")]
    pub kind: TelemetryEventKind,
    /// 距 run_start 的毫秒数
    pub offset_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTelemetry {
    pub run_id: String,
    pub start_ms: i64,
    pub duration_ms: u64,
    pub llm_calls: u32,
    pub tool_calls: u32,
    pub retries: u32,
    pub errors: u32,
    pub token_estimate_in: usize,
    pub token_estimate_out: usize,
    pub events: Vec<TelemetryEvent>,
    #[serde(skip)]
    started: Instant,
    #[serde(skip)]
    sealed: bool,
}

impl AgentTelemetry {
    pub fn new(run_id: impl Into<String>) -> Self {
        let mut telemetry = Self {
            run_id: run_id.into(),
            start_ms: chrono::Utc::now().timestamp_millis(),
            duration_ms: 0,
            llm_calls: 0,
            tool_calls: 0,
            retries: 0,
            errors: 0,
            token_estimate_in: 0,
            token_estimate_out: 0,
            events: Vec::new(),
            started: Instant::now(),
            sealed: false,
        };
        telemetry.record(TelemetryEventKind::RunStart, None);
        telemetry
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// 追加事件；seal 之后忽略
    pub fn record(&mut self, kind: TelemetryEventKind, detail: Option<String>) {
        if self.sealed {
            return;
        }
        self.events.push(TelemetryEvent {
            kind,
            offset_ms: self.started.elapsed().as_millis() as u64,
            detail,
        });
    }

    pub fn iteration(&mut self, n: u32) {
        self.record(TelemetryEventKind::Iteration, Some(n.to_string()));
    }

    pub fn llm_call(&mut self, tokens_in: usize) {
        if self.sealed {
            return;
        }
        self.llm_calls += 1;
        self.token_estimate_in += tokens_in;
        self.record(TelemetryEventKind::LlmCall, None);
    }

    pub fn llm_result(&mut self, retries: u32, tokens_out: usize) {
        if self.sealed {
            return;
        }
        self.token_estimate_out += tokens_out;
        self.add_retries(retries);
    }

    pub fn add_retries(&mut self, retries: u32) {
        if self.sealed || retries == 0 {
            return;
        }
        self.retries += retries;
        self.record(TelemetryEventKind::LlmRetry, Some(retries.to_string()));
    }

    pub fn tool_start(&mut self, tool: &str) {
        if self.sealed {
            return;
        }
        self.tool_calls += 1;
        self.record(TelemetryEventKind::ToolCallStart, Some(tool.to_string()));
    }

    pub fn tool_end(&mut self, tool: &str, success: bool, duration_ms: u64) {
        self.record(
            TelemetryEventKind::ToolCallEnd,
            Some(format!("{tool} ok={success} {duration_ms}ms")),
        );
    }

    pub fn guardrail(&mut self, reason: &str) {
        self.record(TelemetryEventKind::Guardrail, Some(reason.to_string()));
    }

    pub fn error(&mut self, detail: impl Into<String>) {
        if self.sealed {
            return;
        }
        self.errors += 1;
        self.record(TelemetryEventKind::Error, Some(detail.into()));
    }

    /// 结束本轮：写入 duration 与 run_end；重复调用无效
    pub fn seal(&mut self) {
        if self.sealed {
            return;
        }
        self.duration_ms = self.started.elapsed().as_millis() as u64;
        self.record(TelemetryEventKind::RunEnd, None);
        self.sealed = true;
    }
}

/// 带计量的 LLM 包装
pub struct MeteredLlm<'a> {
    inner: &'a dyn LlmClient,
    telemetry: &'a Mutex<AgentTelemetry>,
}

impl<'a> MeteredLlm<'a> {
    pub fn new(inner: &'a dyn LlmClient, telemetry: &'a Mutex<AgentTelemetry>) -> Self {
        Self { inner, telemetry }
    }

    fn with<R>(&self, f: impl FnOnce(&mut AgentTelemetry) -> R) -> R {
        let mut guard = self.telemetry.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

#[async_trait]
impl<'a> LlmClient for MeteredLlm<'a> {
    async fn call(
        &self,
        messages: &[Message],
        tools: Option<&[ToolSpec]>,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, LlmError> {
        let tokens_in = TokenEstimator::estimate_messages(messages);
        self.with(|t| t.llm_call(tokens_in));

        let result = self.inner.call(messages, tools, cancel).await;
        match &result {
            Ok(response) => {
                let tokens_out = response
                    .usage
                    .map(|u| u.output_tokens as usize)
                    .unwrap_or_else(|| TokenEstimator::estimate(&response.content));
                self.with(|t| t.llm_result(response.retries, tokens_out));
            }
            Err(e) => {
                tracing::warn!(provider = self.inner.provider(), error = %e, code = %e.code(), "llm call failed");
                self.with(|t| {
                    t.add_retries(e.attempts() - 1);
                    t.error(format!("{}: {}", e.code(), e));
                });
            }
        }
        result
    }

    fn provider(&self) -> &str {
        self.inner.provider()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }
}
