//! Token 预算控制
//!
//! 用字符数近似估算 token，并在调用 LLM 前按预算从最旧的非 system 消息开始剪枝。

use crate::memory::Message;

/// 剪枝后至少保留的消息条数
pub const MIN_RETAINED_MESSAGES: usize = 3;

/// 每条消息的固定开销（角色、分隔符等）
const PER_MESSAGE_OVERHEAD: usize = 4;

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量
    /// 使用简单的启发式规则：英文约 4 字符/token，中文约 1.5 字符/token
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0;
        let mut non_ascii_chars = 0;

        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }

    /// 估算单条消息（含工具调用参数）
    pub fn estimate_message(message: &Message) -> usize {
        let calls: usize = message
            .tool_calls
            .iter()
            .map(|c| Self::estimate(&c.name) + Self::estimate(&c.parameters.to_string()))
            .sum();
        Self::estimate(&message.content) + calls + PER_MESSAGE_OVERHEAD
    }

    pub fn estimate_messages(messages: &[Message]) -> usize {
        messages.iter().map(Self::estimate_message).sum()
    }
}

/// 按预算剪枝：从最旧的非 system 消息开始删除，直到低于预算或只剩 MIN_RETAINED_MESSAGES 条。
/// 返回被删除的条数。
pub fn trim_to_budget(messages: &mut Vec<Message>, budget: usize) -> usize {
    let mut removed = 0;
    let mut total = TokenEstimator::estimate_messages(messages);

    while total > budget && messages.len() > MIN_RETAINED_MESSAGES {
        let Some(idx) = messages.iter().position(|m| !m.is_system()) else {
            break;
        };
        let dropped = messages.remove(idx);
        total = total.saturating_sub(TokenEstimator::estimate_message(&dropped));
        removed += 1;
    }

    if removed > 0 {
        tracing::debug!(removed, remaining_tokens = total, budget, "history trimmed");
    }
    removed
}
