//! 按配置创建 LLM 客户端

use std::str::FromStr;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::llm::anthropic::{AnthropicClient, DEFAULT_ANTHROPIC_MODEL};
use crate::llm::deepseek::{create_deepseek_client, DEEPSEEK_CHAT};
use crate::llm::openai::DEFAULT_OPENAI_MODEL;
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    Anthropic,
    OpenAi,
    DeepSeek,
    Mock,
}

impl FromStr for LlmProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "anthropic" | "claude" => Ok(LlmProvider::Anthropic),
            "openai" | "openai-compatible" | "openai_compatible" => Ok(LlmProvider::OpenAi),
            "deepseek" => Ok(LlmProvider::DeepSeek),
            "mock" => Ok(LlmProvider::Mock),
            other => Err(format!("unknown llm provider: {other}")),
        }
    }
}

impl LlmProvider {
    pub fn default_api_key_env(&self) -> Option<&'static str> {
        match self {
            LlmProvider::Anthropic => Some("ANTHROPIC_API_KEY"),
            LlmProvider::OpenAi => Some("OPENAI_API_KEY"),
            LlmProvider::DeepSeek => Some("DEEPSEEK_API_KEY"),
            LlmProvider::Mock => None,
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::Anthropic => DEFAULT_ANTHROPIC_MODEL,
            LlmProvider::OpenAi => DEFAULT_OPENAI_MODEL,
            LlmProvider::DeepSeek => DEEPSEEK_CHAT,
            LlmProvider::Mock => "mock",
        }
    }
}

/// 根据 [llm] 配置与环境变量中的 API Key 创建客户端；缺 Key 或 provider 未知时回落到 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = match cfg.llm.provider.parse::<LlmProvider>() {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!("{}, using Mock LLM", e);
            return Arc::new(MockLlmClient::new());
        }
    };

    let key_env = cfg
        .llm
        .api_key_env
        .clone()
        .or_else(|| provider.default_api_key_env().map(String::from));
    let api_key = key_env
        .as_deref()
        .and_then(|name| std::env::var(name).ok())
        .filter(|k| !k.trim().is_empty());

    let model = cfg
        .llm
        .model
        .clone()
        .unwrap_or_else(|| provider.default_model().to_string());
    let retry = cfg.llm.retry.to_policy();
    let base_url = cfg.llm.base_url.as_deref();

    match (provider, api_key) {
        (LlmProvider::Mock, _) => {
            tracing::info!("Using Mock LLM");
            Arc::new(MockLlmClient::new())
        }
        (_, None) => {
            tracing::warn!(
                "No API key in {} for provider {:?}, using Mock LLM",
                key_env.unwrap_or_default(),
                provider
            );
            Arc::new(MockLlmClient::new())
        }
        (LlmProvider::Anthropic, Some(key)) => {
            tracing::info!("Using Anthropic LLM ({})", model);
            Arc::new(
                AnthropicClient::new(base_url, &model, Some(&key))
                    .with_max_tokens(cfg.llm.max_tokens)
                    .with_retry_policy(retry),
            )
        }
        (LlmProvider::OpenAi, Some(key)) => {
            tracing::info!("Using OpenAI-compatible LLM ({})", model);
            Arc::new(
                OpenAiClient::new(base_url, &model, Some(&key))
                    .with_max_tokens(cfg.llm.max_tokens)
                    .with_retry_policy(retry),
            )
        }
        (LlmProvider::DeepSeek, Some(key)) => {
            tracing::info!("Using DeepSeek LLM ({})", model);
            Arc::new(
                create_deepseek_client(base_url, Some(&model), Some(&key))
                    .with_max_tokens(cfg.llm.max_tokens)
                    .with_retry_policy(retry),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_provider() {
        assert_eq!("Claude".parse::<LlmProvider>(), Ok(LlmProvider::Anthropic));
        assert_eq!("openai-compatible".parse::<LlmProvider>(), Ok(LlmProvider::OpenAi));
        assert!("gemini".parse::<LlmProvider>().is_err());
    }

    #[test]
    fn test_missing_key_falls_back_to_mock() {
        let mut cfg = AppConfig::default();
        cfg.llm.api_key_env = Some("PILOT_TEST_KEY_THAT_IS_NEVER_SET".to_string());
        let client = create_llm_from_config(&cfg);
        assert_eq!(client.provider(), "mock");
    }
}
