//! 任务看板演示工具（CLI 与场景测试使用）
//!
//! get_tasks 为 Read 工具；create_task / update_task / delete_task 按命名约定归为 Write 工具，需用户确认后执行。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::tools::{Tool, ToolRegistry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    pub title: String,
    pub status: String,
}

/// 共享的内存任务看板
#[derive(Debug, Clone, Default)]
pub struct TaskBoard {
    inner: Arc<RwLock<BoardState>>,
}

#[derive(Debug, Default)]
struct BoardState {
    tasks: Vec<Task>,
    next_id: u64,
}

impl TaskBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置若干任务
    pub async fn with_tasks(titles: &[(&str, &str)]) -> Self {
        let board = Self::new();
        for (title, status) in titles {
            board.insert(title, status).await;
        }
        board
    }

    pub async fn insert(&self, title: &str, status: &str) -> Task {
        let mut state = self.inner.write().await;
        state.next_id += 1;
        let task = Task {
            id: state.next_id,
            title: title.to_string(),
            status: status.to_string(),
        };
        state.tasks.push(task.clone());
        task
    }

    pub async fn tasks(&self) -> Vec<Task> {
        self.inner.read().await.tasks.clone()
    }

    pub async fn get(&self, id: u64) -> Option<Task> {
        self.inner.read().await.tasks.iter().find(|t| t.id == id).cloned()
    }

    /// 注册全部看板工具
    pub fn register_tools(&self, registry: &mut ToolRegistry) {
        registry.register(GetTasksTool { board: self.clone() });
        registry.register(CreateTaskTool { board: self.clone() });
        registry.register(UpdateTaskTool { board: self.clone() });
        registry.register(DeleteTaskTool { board: self.clone() });
    }
}

fn id_param(args: &Value) -> Result<u64, String> {
    match args.get("id") {
        Some(Value::Number(n)) => n.as_u64().ok_or_else(|| "id must be a positive integer".to_string()),
        Some(Value::String(s)) => s.trim().parse().map_err(|_| format!("invalid id: {s}")),
        _ => Err("id is required".to_string()),
    }
}

pub struct GetTasksTool {
    board: TaskBoard,
}

#[async_trait]
impl Tool for GetTasksTool {
    fn name(&self) -> &str {
        "get_tasks"
    }

    fn description(&self) -> &str {
        "List the user's tasks, optionally filtered by status."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "status": {"type": "string", "enum": ["to_do", "in_progress", "done"]},
                "limit": {"type": "number"}
            },
            "required": []
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let status = args.get("status").and_then(Value::as_str);
        let limit = args.get("limit").and_then(Value::as_u64).map(|l| l as usize);
        let tasks: Vec<Task> = self
            .board
            .tasks()
            .await
            .into_iter()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        Ok(json!({"count": tasks.len(), "tasks": tasks}))
    }
}

pub struct CreateTaskTool {
    board: TaskBoard,
}

#[async_trait]
impl Tool for CreateTaskTool {
    fn name(&self) -> &str {
        "create_task"
    }

    fn description(&self) -> &str {
        "Create a new task with a title."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": {"type": "string"},
                "status": {"type": "string", "enum": ["to_do", "in_progress", "done"]}
            },
            "required": ["title"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let title = args
            .get("title")
            .and_then(Value::as_str)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| "title must be a non-empty string".to_string())?;
        let status = args.get("status").and_then(Value::as_str).unwrap_or("to_do");
        let task = self.board.insert(title.trim(), status).await;
        Ok(json!({"task": task}))
    }
}

pub struct UpdateTaskTool {
    board: TaskBoard,
}

#[async_trait]
impl Tool for UpdateTaskTool {
    fn name(&self) -> &str {
        "update_task"
    }

    fn description(&self) -> &str {
        "Update a task's title or status by id."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": {"type": "number"},
                "title": {"type": "string"},
                "status": {"type": "string", "enum": ["to_do", "in_progress", "done"]}
            },
            "required": ["id"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let id = id_param(&args)?;
        let mut state = self.board.inner.write().await;
        let task = state
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| format!("task {id} not found"))?;
        if let Some(title) = args.get("title").and_then(Value::as_str) {
            task.title = title.to_string();
        }
        if let Some(status) = args.get("status").and_then(Value::as_str) {
            task.status = status.to_string();
        }
        Ok(json!({"task": task.clone()}))
    }
}

pub struct DeleteTaskTool {
    board: TaskBoard,
}

#[async_trait]
impl Tool for DeleteTaskTool {
    fn name(&self) -> &str {
        "delete_task"
    }

    fn description(&self) -> &str {
        "Delete a task by id."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"id": {"type": "number"}},
            "required": ["id"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let id = id_param(&args)?;
        let mut state = self.board.inner.write().await;
        let before = state.tasks.len();
        state.tasks.retain(|t| t.id != id);
        if state.tasks.len() == before {
            return Err(format!("task {id} not found"));
        }
        Ok(json!({"deleted": id}))
    }
}
