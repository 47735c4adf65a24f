//! Anthropic Messages API 客户端（线上格式 A）
//!
//! - 认证：`x-api-key` + `anthropic-version`
//! - system 消息合并进顶层 `system` 字段
//! - 工具调用为 assistant 的 `tool_use` 内容块，工具结果为 user 的 `tool_result` 内容块
//! - 相邻同角色消息合并（API 要求 user / assistant 交替）

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::llm::retry::{fetch_with_retry, RetryPolicy};
use crate::llm::{LlmClient, LlmError, LlmResponse, TokenUsage};
use crate::memory::{Message, Role};
use crate::tools::{ToolCall, ToolSpec};

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-5-sonnet-latest";

pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    retry: RetryPolicy,
}

impl AnthropicClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
            .unwrap_or_default();
        Self {
            http: reqwest::Client::new(),
            base_url: base_url
                .unwrap_or(ANTHROPIC_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: model.to_string(),
            max_tokens: 1024,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn call(
        &self,
        messages: &[Message],
        tools: Option<&[ToolSpec]>,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, LlmError> {
        let body = build_request_body(&self.model, self.max_tokens, messages, tools);
        let url = format!("{}/v1/messages", self.base_url);
        tracing::debug!(model = %self.model, messages = messages.len(), "sending anthropic request");

        let outcome = fetch_with_retry(&self.retry, cancel, || {
            self.http
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(&body)
        })
        .await?;

        let mut response = parse_response(&outcome.body)?;
        response.retries = outcome.retries;
        Ok(response)
    }

    fn provider(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// 构造请求体（纯函数）
pub fn build_request_body(
    model: &str,
    max_tokens: u32,
    messages: &[Message],
    tools: Option<&[ToolSpec]>,
) -> Value {
    let system = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut body = json!({
        "model": model,
        "max_tokens": max_tokens,
        "messages": to_wire_messages(messages),
    });
    if !system.is_empty() {
        body["system"] = Value::String(system);
    }
    if let Some(tools) = tools.filter(|t| !t.is_empty()) {
        body["tools"] = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();
    }
    body
}

fn to_wire_messages(messages: &[Message]) -> Vec<Value> {
    let mut out: Vec<(&'static str, Vec<Value>)> = Vec::new();
    for m in messages {
        let (role, blocks) = match m.role {
            Role::System => continue,
            Role::User => ("user", text_block(&m.content)),
            Role::Tool => (
                "user",
                vec![json!({
                    "type": "tool_result",
                    "tool_use_id": m.tool_call_id.clone().unwrap_or_default(),
                    "content": m.content,
                })],
            ),
            Role::Assistant => {
                let mut blocks = text_block(&m.content);
                blocks.extend(m.tool_calls.iter().map(|c| {
                    let input = if c.parameters.is_object() {
                        c.parameters.clone()
                    } else {
                        json!({})
                    };
                    json!({"type": "tool_use", "id": c.id, "name": c.name, "input": input})
                }));
                ("assistant", blocks)
            }
        };
        if blocks.is_empty() {
            continue;
        }
        match out.last_mut() {
            Some((last_role, last_blocks)) if *last_role == role => last_blocks.extend(blocks),
            _ => out.push((role, blocks)),
        }
    }
    out.into_iter()
        .map(|(role, content)| json!({"role": role, "content": content}))
        .collect()
}

fn text_block(text: &str) -> Vec<Value> {
    if text.trim().is_empty() {
        Vec::new()
    } else {
        vec![json!({"type": "text", "text": text})]
    }
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// 解析响应体（纯函数）
pub fn parse_response(body: &str) -> Result<LlmResponse, LlmError> {
    let parsed: MessagesResponse =
        serde_json::from_str(body).map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

    let mut texts = Vec::new();
    let mut tool_calls = Vec::new();
    for block in parsed.content {
        match block {
            ContentBlock::Text { text } => texts.push(text),
            ContentBlock::ToolUse { id, name, input } => {
                let input = if input.is_null() { json!({}) } else { input };
                tool_calls.push(ToolCall::new(name, input).with_id(id));
            }
            ContentBlock::Other => {}
        }
    }

    Ok(LlmResponse {
        content: texts.join("\n"),
        tool_calls,
        usage: parsed.usage.map(|u| TokenUsage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
        }),
        retries: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_lifted_and_roles_merged() {
        let call = ToolCall::new("get_tasks", json!({"status": "done"})).with_id("toolu_1");
        let messages = vec![
            Message::system("be brief"),
            Message::system("use tools"),
            Message::user("list tasks"),
            Message::assistant_with_tool_calls("", vec![call]),
            Message::tool_result("toolu_1", "{\"count\":0}"),
            Message::user("thanks"),
        ];
        let body = build_request_body("m", 512, &messages, None);

        assert_eq!(body["system"], "be brief\n\nuse tools");
        let wire = body["messages"].as_array().unwrap();
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[1]["content"][0]["type"], "tool_use");
        assert_eq!(wire[1]["content"][0]["input"]["status"], "done");
        assert_eq!(wire[2]["role"], "user");
        assert_eq!(wire[2]["content"][0]["type"], "tool_result");
        assert_eq!(wire[2]["content"][0]["tool_use_id"], "toolu_1");
        assert_eq!(wire[2]["content"][1]["text"], "thanks");
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn test_tools_use_input_schema() {
        let spec = ToolSpec {
            name: "get_tasks".into(),
            description: "list".into(),
            parameters: json!({"type": "object"}),
        };
        let body = build_request_body("m", 512, &[Message::user("hi")], Some(&[spec]));
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
    }

    #[test]
    fn test_parse_text_and_tool_use() {
        let body = r#"{
            "content": [
                {"type": "text", "text": "Looking up."},
                {"type": "tool_use", "id": "toolu_9", "name": "get_tasks", "input": {"limit": 5}},
                {"type": "thinking", "thinking": "..."}
            ],
            "usage": {"input_tokens": 12, "output_tokens": 7}
        }"#;
        let resp = parse_response(body).unwrap();
        assert_eq!(resp.content, "Looking up.");
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].id, "toolu_9");
        assert_eq!(resp.tool_calls[0].parameters["limit"], 5);
        assert_eq!(resp.usage.unwrap().output_tokens, 7);
    }

    #[test]
    fn test_parse_garbage_is_invalid_response() {
        assert!(matches!(parse_response("not json"), Err(LlmError::InvalidResponse(_))));
    }
}
