//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按脚本顺序返回预置的回复或错误；脚本耗尽后回显最后一条 User 消息。
//! 每次调用都会记录收到的消息与工具列表，便于断言。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::llm::{LlmClient, LlmError, LlmResponse};
use crate::memory::{Message, Role};
use crate::tools::{ToolCall, ToolSpec};

/// 一次被记录的调用
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub messages: Vec<Message>,
    /// None 表示调用时未暴露工具
    pub tool_names: Option<Vec<String>>,
}

#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.push_response(LlmResponse::text(text));
        self
    }

    pub fn with_tool_calls(self, calls: Vec<ToolCall>) -> Self {
        self.push_response(LlmResponse::with_tool_calls(calls));
        self
    }

    pub fn with_error(self, error: LlmError) -> Self {
        self.push_error(error);
        self
    }

    pub fn push_response(&self, response: LlmResponse) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Ok(response));
    }

    pub fn push_error(&self, error: LlmError) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Err(error));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn call(
        &self,
        messages: &[Message],
        tools: Option<&[ToolSpec]>,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, LlmError> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedCall {
                messages: messages.to_vec(),
                tool_names: tools.map(|t| t.iter().map(|s| s.name.clone()).collect()),
            });

        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match next {
            Some(scripted) => scripted,
            None => {
                let last_user = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or("(no input)");
                Ok(LlmResponse::text(format!("Echo from Mock: {last_user}")))
            }
        }
    }

    fn provider(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_script_then_echo() {
        let mock = MockLlmClient::new()
            .with_tool_calls(vec![ToolCall::new("get_tasks", json!({}))])
            .with_error(LlmError::RateLimited { attempts: 4 });
        let cancel = CancellationToken::new();
        let msgs = [Message::user("hello")];

        let first = mock.call(&msgs, None, &cancel).await.unwrap();
        assert_eq!(first.tool_calls[0].name, "get_tasks");
        assert_eq!(mock.call(&msgs, None, &cancel).await, Err(LlmError::RateLimited { attempts: 4 }));
        let echo = mock.call(&msgs, None, &cancel).await.unwrap();
        assert_eq!(echo.content, "Echo from Mock: hello");
        assert_eq!(mock.call_count(), 3);
    }
}
