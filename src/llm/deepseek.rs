//! DeepSeek 预设（OpenAI 兼容格式）
//!
//! - Base URL: https://api.deepseek.com
//! - 模型: deepseek-chat (常规对话), deepseek-reasoner (思考模式)

use crate::llm::OpenAiClient;

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";
pub const DEEPSEEK_REASONER: &str = "deepseek-reasoner";

/// 创建 DeepSeek 客户端
///
/// api_key 缺省时读取 `DEEPSEEK_API_KEY`；model 缺省时读取 `DEEPSEEK_MODEL`，再回落到 deepseek-chat。
/// base_url 缺省时使用官方端点（代理或私有部署时覆盖）。
pub fn create_deepseek_client(
    base_url: Option<&str>,
    model: Option<&str>,
    api_key: Option<&str>,
) -> OpenAiClient {
    let api_key = api_key
        .map(String::from)
        .or_else(|| std::env::var("DEEPSEEK_API_KEY").ok())
        .unwrap_or_default();

    let model = model
        .map(String::from)
        .or_else(|| std::env::var("DEEPSEEK_MODEL").ok())
        .unwrap_or_else(|| DEEPSEEK_CHAT.to_string());

    OpenAiClient::new(Some(base_url.unwrap_or(DEEPSEEK_BASE_URL)), &model, Some(api_key.as_str()))
        .with_provider_name("deepseek")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmClient;

    #[test]
    fn test_deepseek_preset() {
        let client = create_deepseek_client(None, Some(DEEPSEEK_REASONER), Some("sk-test"));
        assert_eq!(client.provider(), "deepseek");
        assert_eq!(client.model(), DEEPSEEK_REASONER);
        assert_eq!(client.base_url(), DEEPSEEK_BASE_URL);
    }

    #[test]
    fn test_deepseek_base_url_override() {
        let client = create_deepseek_client(Some("http://proxy.local/v1/"), None, Some("sk-test"));
        assert_eq!(client.base_url(), "http://proxy.local/v1");
        assert_eq!(client.provider(), "deepseek");
    }
}
