//! 工具调用与观察结果
//!
//! Planner 解析出的 ToolCall 经过 Middleware 洋葱后落到 ToolExecutor，
//! 无论成功失败，出口都只有 ToolObservation 一种形状。

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const LIST_DIR: &str = "list_dir";
pub const READ_FILE: &str = "read_file";
pub const WRITE_FILE: &str = "write_file";
pub const EXEC: &str = "exec";
pub const WEB_SEARCH: &str = "web_search";
pub const WEB_FETCH: &str = "web_fetch";
pub const GITHUB_SEARCH: &str = "github_search";
pub const MEMORY_SEARCH: &str = "memory_search";
pub const ASK_CLARIFICATION: &str = "ask_clarification";
pub const DELEGATE_SUB_TASKS: &str = "delegate_sub_tasks";
pub const WRITE_TODOS: &str = "write_todos";
pub const TASK: &str = "task";

/// 会修改工作区或派生子任务的工具（ask 模式下不可用）
pub const MUTATING_TOOLS: &[&str] = &[WRITE_FILE, EXEC, DELEGATE_SUB_TASKS, TASK];

/// 由宿主通过 ToolRegistry 注入的协作方工具
pub const COLLABORATOR_TOOLS: &[&str] = &[WEB_SEARCH, WEB_FETCH, GITHUB_SEARCH, MEMORY_SEARCH];

/// 工具目录条目（写入 system prompt）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// 内置工具目录
pub fn builtin_tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec::new(LIST_DIR, r#"List a directory. input: {"path": string, "depth"?: 1-5}"#),
        ToolSpec::new(READ_FILE, r#"Read a UTF-8 text file. input: {"path": string}"#),
        ToolSpec::new(
            WRITE_FILE,
            r#"Write a file under output/. input: {"path": string, "content": string, "overwrite"?: bool}"#,
        ),
        ToolSpec::new(EXEC, r#"Run an allowlisted shell command. input: {"command": string, "cwd"?: string}"#),
        ToolSpec::new(WEB_SEARCH, r#"Search the web. input: {"query": string}"#),
        ToolSpec::new(WEB_FETCH, r#"Fetch a web page as text. input: {"url": string}"#),
        ToolSpec::new(GITHUB_SEARCH, r#"Search GitHub repositories and code. input: {"query": string}"#),
        ToolSpec::new(MEMORY_SEARCH, r#"Search long-term memory. input: {"query": string}"#),
        ToolSpec::new(
            ASK_CLARIFICATION,
            r#"Ask the user a question when the request is ambiguous. input: {"question": string}"#,
        ),
        ToolSpec::new(
            DELEGATE_SUB_TASKS,
            r#"Run a dependency-ordered plan of sub-agents. input: {"tasks": [{"subTaskId", "agentRole": "researcher"|"bash_operator"|"writer", "prompt", "dependencies": [], "writePath"?}]}"#,
        ),
        ToolSpec::new(
            WRITE_TODOS,
            r#"Replace the todo list. input: {"todos": [{"content": string, "status": "pending"|"in_progress"|"completed"}]}"#,
        ),
        ToolSpec::new(
            TASK,
            r#"Run one sub-agent. input: {"agentRole": string, "prompt": string, "writePath"?: string}"#,
        ),
    ]
}

/// 解析后的工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ToolCall {
    pub fn new(tool: impl Into<String>, input: Value) -> Self {
        Self {
            tool: tool.into(),
            input,
            reason: None,
        }
    }

    /// 去重签名：tool + JSON(input)
    pub fn signature(&self) -> String {
        format!("{}:{}", self.tool, self.input)
    }

    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.input.get(key).and_then(Value::as_str)
    }

    pub fn bool_arg(&self, key: &str) -> Option<bool> {
        self.input.get(key).and_then(Value::as_bool)
    }
}

/// 工具观察结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolObservation {
    pub tool: String,
    pub input: Value,
    pub ok: bool,
    pub output: String,
}

impl ToolObservation {
    pub fn success(call: &ToolCall, output: impl Into<String>) -> Self {
        Self {
            tool: call.tool.clone(),
            input: call.input.clone(),
            ok: true,
            output: output.into(),
        }
    }

    pub fn failure(call: &ToolCall, output: impl Into<String>) -> Self {
        Self {
            tool: call.tool.clone(),
            input: call.input.clone(),
            ok: false,
            output: output.into(),
        }
    }

    /// 失败输出开头的错误码（形如 `FILE_EXISTS: ...`）
    pub fn error_code(&self) -> Option<&str> {
        if self.ok {
            return None;
        }
        let (head, _) = self.output.split_once(':')?;
        let head = head.trim();
        let is_code = !head.is_empty()
            && head
                .chars()
                .all(|c| c.is_ascii_uppercase() || c == '_' || c.is_ascii_digit());
        is_code.then_some(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signature_is_stable_for_same_input() {
        let a = ToolCall::new("read_file", json!({"path": "a.md"}));
        let b = ToolCall::new("read_file", json!({"path": "a.md"}));
        let c = ToolCall::new("read_file", json!({"path": "b.md"}));
        assert_eq!(a.signature(), b.signature());
        assert_ne!(a.signature(), c.signature());
    }

    #[test]
    fn test_error_code() {
        let call = ToolCall::new("write_file", json!({}));
        let obs = ToolObservation::failure(&call, "FILE_EXISTS: /mnt/workspace/output/a.md already exists");
        assert_eq!(obs.error_code(), Some("FILE_EXISTS"));

        let obs = ToolObservation::failure(&call, "tool not available: web_search");
        assert_eq!(obs.error_code(), None);

        let obs = ToolObservation::success(&call, "DONE: ok");
        assert_eq!(obs.error_code(), None);
    }
}
