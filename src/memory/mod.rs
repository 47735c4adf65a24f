//! 记忆层：对话消息、Token 预算、外部对话存储接口

pub mod conversation;
pub mod store;
pub mod token_budget;

pub use conversation::{Message, Role};
pub use store::{ConversationStore, InMemoryConversationStore, StoreError};
pub use token_budget::{trim_to_budget, TokenEstimator};
