//! 中间件上下文：每个请求创建一次，在各阶段之间按值传递
//!
//! 所有修改都通过 `with_*` 返回新值，原值保持不变；钩子拿到的是快照，返回的是下一阶段的上下文。

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::llm::{Message, ModelResponse};
use crate::react::events::ProgressEvent;
use crate::tools::ToolSpec;

/// 生命周期阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    BeforeAgent,
    BeforeModel,
    AfterModel,
    AfterAgent,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::BeforeAgent => "before_agent",
            LifecycleState::BeforeModel => "before_model",
            LifecycleState::AfterModel => "after_model",
            LifecycleState::AfterAgent => "after_agent",
        }
    }

    /// 旧版钩子名
    pub fn legacy_name(&self) -> &'static str {
        match self {
            LifecycleState::BeforeAgent => "on_request",
            LifecycleState::BeforeModel => "before_llm",
            LifecycleState::AfterModel => "after_llm",
            LifecycleState::AfterAgent => "on_response",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "before_agent" | "on_request" => Ok(LifecycleState::BeforeAgent),
            "before_model" | "before_llm" => Ok(LifecycleState::BeforeModel),
            "after_model" | "after_llm" => Ok(LifecycleState::AfterModel),
            "after_agent" | "on_response" => Ok(LifecycleState::AfterAgent),
            other => Err(format!("unknown lifecycle state: {}", other)),
        }
    }
}

/// 对话模式：ask 为只读
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatMode {
    #[default]
    Agent,
    Ask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    pub content: String,
    pub status: TodoStatus,
}

/// 运行期协作方：取消令牌与事件通道
#[derive(Debug, Clone, Default)]
pub struct RuntimeHandles {
    pub cancel: CancellationToken,
    pub events: Option<UnboundedSender<ProgressEvent>>,
}

#[derive(Debug, Clone)]
pub struct MiddlewareContext {
    session_id: String,
    task_id: String,
    conversation_id: Option<String>,
    workspace_path: PathBuf,
    messages: Vec<Message>,
    tools: Vec<ToolSpec>,
    metadata: Map<String, Value>,
    state: LifecycleState,
    llm_response: Option<ModelResponse>,
    final_response: Option<String>,
    chat_mode: ChatMode,
    todos: Vec<Todo>,
    runtime: RuntimeHandles,
}

impl MiddlewareContext {
    pub fn new(session_id: impl Into<String>, workspace_path: impl Into<PathBuf>) -> Self {
        Self {
            session_id: session_id.into(),
            task_id: Uuid::new_v4().to_string(),
            conversation_id: None,
            workspace_path: workspace_path.into(),
            messages: Vec::new(),
            tools: Vec::new(),
            metadata: Map::new(),
            state: LifecycleState::BeforeAgent,
            llm_response: None,
            final_response: None,
            chat_mode: ChatMode::Agent,
            todos: Vec::new(),
            runtime: RuntimeHandles::default(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn workspace_path(&self) -> &Path {
        &self.workspace_path
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn tools(&self) -> &[ToolSpec] {
        &self.tools
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name == name)
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn llm_response(&self) -> Option<&ModelResponse> {
        self.llm_response.as_ref()
    }

    pub fn final_response(&self) -> Option<&str> {
        self.final_response.as_deref()
    }

    pub fn chat_mode(&self) -> ChatMode {
        self.chat_mode
    }

    pub fn todos(&self) -> &[Todo] {
        &self.todos
    }

    pub fn runtime(&self) -> &RuntimeHandles {
        &self.runtime
    }

    #[must_use]
    pub fn with_conversation_id(&self, id: impl Into<String>) -> Self {
        Self {
            conversation_id: Some(id.into()),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_messages(&self, messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_message(&self, message: Message) -> Self {
        let mut next = self.clone();
        next.messages.push(message);
        next
    }

    #[must_use]
    pub fn with_tools(&self, tools: Vec<ToolSpec>) -> Self {
        Self {
            tools,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_metadata(&self, key: impl Into<String>, value: Value) -> Self {
        let mut next = self.clone();
        next.metadata.insert(key.into(), value);
        next
    }

    #[must_use]
    pub fn with_state(&self, state: LifecycleState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_llm_response(&self, response: ModelResponse) -> Self {
        Self {
            llm_response: Some(response),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_final_response(&self, text: impl Into<String>) -> Self {
        Self {
            final_response: Some(text.into()),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_chat_mode(&self, chat_mode: ChatMode) -> Self {
        Self {
            chat_mode,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_todos(&self, todos: Vec<Todo>) -> Self {
        Self {
            todos,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_runtime(&self, runtime: RuntimeHandles) -> Self {
        Self {
            runtime,
            ..self.clone()
        }
    }
}
