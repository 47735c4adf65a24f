//! OpenAI 兼容 Chat Completions 客户端（线上格式 B）
//!
//! 适用于 OpenAI、DeepSeek 及任意兼容端点（可配置 base_url）。
//! - 认证：`Authorization: Bearer`
//! - 工具调用位于 `choices[0].message.tool_calls`，arguments 为 JSON 字符串
//! - 工具结果以 `role: "tool"` + `tool_call_id` 回传

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::llm::retry::{fetch_with_retry, RetryPolicy};
use crate::llm::{LlmClient, LlmError, LlmResponse, TokenUsage};
use crate::memory::{Message, Role};
use crate::tools::{ToolCall, ToolSpec};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

/// OpenAI 兼容客户端：持有 reqwest Client、端点与 model 名
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: Option<u32>,
    retry: RetryPolicy,
    provider: String,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();
        Self {
            http: reqwest::Client::new(),
            base_url: base_url
                .unwrap_or(OPENAI_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: model.to_string(),
            max_tokens: None,
            retry: RetryPolicy::default(),
            provider: "openai".to_string(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// 兼容端点的展示名（如 "deepseek"）
    pub fn with_provider_name(mut self, name: impl Into<String>) -> Self {
        self.provider = name.into();
        self
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn call(
        &self,
        messages: &[Message],
        tools: Option<&[ToolSpec]>,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, LlmError> {
        let body = build_request_body(&self.model, self.max_tokens, messages, tools);
        let url = format!("{}/chat/completions", self.base_url);
        tracing::debug!(
            provider = %self.provider,
            model = %self.model,
            messages = messages.len(),
            "sending chat completion request"
        );

        let outcome = fetch_with_retry(&self.retry, cancel, || {
            self.http
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
        })
        .await?;

        let mut response = parse_response(&outcome.body)?;
        response.retries = outcome.retries;
        Ok(response)
    }

    fn provider(&self) -> &str {
        &self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// 构造请求体（纯函数）
pub fn build_request_body(
    model: &str,
    max_tokens: Option<u32>,
    messages: &[Message],
    tools: Option<&[ToolSpec]>,
) -> Value {
    let wire: Vec<Value> = messages.iter().map(to_wire_message).collect();
    let mut body = json!({
        "model": model,
        "messages": wire,
    });
    if let Some(max) = max_tokens {
        body["max_tokens"] = json!(max);
    }
    if let Some(tools) = tools.filter(|t| !t.is_empty()) {
        body["tools"] = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
        body["tool_choice"] = json!("auto");
    }
    body
}

fn to_wire_message(m: &Message) -> Value {
    match m.role {
        Role::System => json!({"role": "system", "content": m.content}),
        Role::User => json!({"role": "user", "content": m.content}),
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": m.tool_call_id.clone().unwrap_or_default(),
            "content": m.content,
        }),
        Role::Assistant if m.tool_calls.is_empty() => {
            json!({"role": "assistant", "content": m.content})
        }
        Role::Assistant => {
            let content = if m.content.is_empty() {
                Value::Null
            } else {
                Value::String(m.content.clone())
            };
            let calls: Vec<Value> = m
                .tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": {"name": c.name, "arguments": c.parameters.to_string()},
                    })
                })
                .collect();
            json!({"role": "assistant", "content": content, "tool_calls": calls})
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: Option<String>,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// 解析响应体（纯函数）
pub fn parse_response(body: &str) -> Result<LlmResponse, LlmError> {
    let parsed: ChatResponse =
        serde_json::from_str(body).map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
    let message = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message)
        .ok_or_else(|| LlmError::InvalidResponse("missing choices[0].message".to_string()))?;

    let tool_calls = message
        .tool_calls
        .into_iter()
        .map(|c| {
            let call = ToolCall::new(c.function.name, parse_arguments(&c.function.arguments));
            match c.id {
                Some(id) if !id.is_empty() => call.with_id(id),
                _ => call,
            }
        })
        .collect();

    Ok(LlmResponse {
        content: message.content.unwrap_or_default(),
        tool_calls,
        usage: parsed.usage.map(|u| TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }),
        retries: 0,
    })
}

/// arguments 通常是 JSON 字符串；部分兼容端点直接给对象，或在字符串外包裹多余文本
pub fn parse_arguments(raw: &Value) -> Value {
    match raw {
        Value::Object(_) => raw.clone(),
        Value::String(s) => {
            if s.trim().is_empty() {
                return json!({});
            }
            if let Ok(v) = serde_json::from_str::<Value>(s) {
                return if v.is_object() { v } else { json!({}) };
            }
            let embedded = match (s.find('{'), s.rfind('}')) {
                (Some(start), Some(end)) if end > start => {
                    serde_json::from_str::<Value>(&s[start..=end]).ok()
                }
                _ => None,
            };
            embedded.unwrap_or_else(|| {
                tracing::warn!(arguments = %s, "unparseable tool arguments, using {{}}");
                json!({})
            })
        }
        _ => json!({}),
    }
}
