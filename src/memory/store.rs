//! 对话存储（外部协作者接口）
//!
//! 引擎只依赖 ConversationStore trait：按会话读写消息、按用户读写设置。
//! 持久化后端由宿主提供；InMemoryConversationStore 供 CLI 与测试使用。

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::memory::Message;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid settings payload: {0}")]
    InvalidSettings(String),
}

/// 对话历史与用户设置存储
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// 返回会话最近的 limit 条消息（按时间正序）
    async fn get_messages(&self, session_id: &str, limit: usize) -> Result<Vec<Message>, StoreError>;

    async fn add_message(&self, session_id: &str, message: Message) -> Result<(), StoreError>;

    /// 用户设置（JSON 对象）；未设置时返回空对象
    async fn get_settings(&self, user_id: &str) -> Result<Map<String, Value>, StoreError>;

    /// 合并更新用户设置
    async fn update_settings(&self, user_id: &str, settings: Value) -> Result<(), StoreError>;
}

/// 内存实现
#[derive(Default)]
pub struct InMemoryConversationStore {
    messages: RwLock<HashMap<String, Vec<Message>>>,
    settings: RwLock<HashMap<String, Map<String, Value>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn get_messages(&self, session_id: &str, limit: usize) -> Result<Vec<Message>, StoreError> {
        let guard = self.messages.read().await;
        let all = guard.get(session_id).map(Vec::as_slice).unwrap_or(&[]);
        let start = all.len().saturating_sub(limit);
        Ok(all[start..].to_vec())
    }

    async fn add_message(&self, session_id: &str, message: Message) -> Result<(), StoreError> {
        self.messages
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn get_settings(&self, user_id: &str) -> Result<Map<String, Value>, StoreError> {
        Ok(self
            .settings
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_settings(&self, user_id: &str, settings: Value) -> Result<(), StoreError> {
        let Value::Object(patch) = settings else {
            return Err(StoreError::InvalidSettings(
                "settings must be a JSON object".to_string(),
            ));
        };
        let mut guard = self.settings.write().await;
        let entry = guard.entry(user_id.to_string()).or_default();
        for (k, v) in patch {
            entry.insert(k, v);
        }
        Ok(())
    }
}
