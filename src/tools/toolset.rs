//! 沙箱工具集：把 list_dir / read_file / write_file / exec 与协作方工具的调用映射为 ToolObservation
//!
//! 主循环的 ToolExecutor 与各子 Agent 共用这一层，保证两边走同一套路径守卫与落盘约束。

use std::path::Path;
use std::sync::Arc;

use serde_json::json;

use crate::react::persist::check_output_target;
use crate::sandbox::{SandboxService, WriteOptions};
use crate::tools::types::{
    ToolCall, ToolObservation, COLLABORATOR_TOOLS, EXEC, LIST_DIR, READ_FILE, WRITE_FILE,
};
use crate::tools::ToolRegistry;

#[derive(Clone)]
pub struct SandboxToolset {
    sandbox: Arc<SandboxService>,
    registry: Arc<ToolRegistry>,
}

impl SandboxToolset {
    pub fn new(sandbox: Arc<SandboxService>, registry: Arc<ToolRegistry>) -> Self {
        Self { sandbox, registry }
    }

    pub fn sandbox(&self) -> &Arc<SandboxService> {
        &self.sandbox
    }

    pub fn virtual_root(&self) -> &str {
        self.sandbox.virtual_root()
    }

    /// 本层能处理的工具名
    pub fn handles(name: &str) -> bool {
        matches!(name, LIST_DIR | READ_FILE | WRITE_FILE | EXEC) || COLLABORATOR_TOOLS.contains(&name)
    }

    pub async fn run(&self, call: &ToolCall, workspace_override: Option<&Path>) -> ToolObservation {
        match call.tool.as_str() {
            LIST_DIR => self.list_dir(call, workspace_override).await,
            READ_FILE => self.read_file(call, workspace_override).await,
            WRITE_FILE => self.write_file(call, workspace_override).await,
            EXEC => self.exec(call, workspace_override).await,
            name if COLLABORATOR_TOOLS.contains(&name) => self.collaborator(call).await,
            other => ToolObservation::failure(call, format!("Unknown tool: {}", other)),
        }
    }

    async fn list_dir(&self, call: &ToolCall, ws: Option<&Path>) -> ToolObservation {
        let path = call.str_arg("path").unwrap_or(".");
        let depth = call.input.get("depth").and_then(|v| v.as_u64()).unwrap_or(1) as usize;
        match self.sandbox.list_dir(path, depth, ws).await {
            Ok(entries) if entries.is_empty() => ToolObservation::success(call, "(empty directory)"),
            Ok(entries) => {
                let lines: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
                ToolObservation::success(call, lines.join("\n"))
            }
            Err(e) => ToolObservation::failure(call, e.to_string()),
        }
    }

    async fn read_file(&self, call: &ToolCall, ws: Option<&Path>) -> ToolObservation {
        let Some(path) = call.str_arg("path") else {
            return missing_field(call, "path");
        };
        match self.sandbox.read_file(path, ws).await {
            Ok(content) => ToolObservation::success(call, content),
            Err(e) => ToolObservation::failure(call, e.to_string()),
        }
    }

    async fn write_file(&self, call: &ToolCall, ws: Option<&Path>) -> ToolObservation {
        let Some(path) = call.str_arg("path") else {
            return missing_field(call, "path");
        };
        let Some(content) = call.str_arg("content") else {
            return missing_field(call, "content");
        };
        let target = match check_output_target(self.virtual_root(), path, content.len()) {
            Ok(target) => target,
            Err(e) => return ToolObservation::failure(call, e.to_string()),
        };
        let options = WriteOptions {
            create_dirs: true,
            overwrite: call.bool_arg("overwrite").unwrap_or(false),
        };
        match self.sandbox.write_file(&target, content, options, ws).await {
            Ok(outcome) => ToolObservation::success(
                call,
                json!({
                    "path": outcome.path,
                    "bytes": outcome.bytes,
                    "overwritten": outcome.overwritten,
                })
                .to_string(),
            ),
            Err(e) => ToolObservation::failure(call, e.to_string()),
        }
    }

    async fn exec(&self, call: &ToolCall, ws: Option<&Path>) -> ToolObservation {
        let Some(command) = call.str_arg("command") else {
            return missing_field(call, "command");
        };
        match self.sandbox.exec(command, call.str_arg("cwd"), ws).await {
            Ok(outcome) => {
                let ok = outcome.success();
                let output = serde_json::to_string(&outcome).unwrap_or_else(|_| outcome.stdout.clone());
                if ok {
                    ToolObservation::success(call, output)
                } else {
                    ToolObservation::failure(call, output)
                }
            }
            Err(e) => ToolObservation::failure(call, e.to_string()),
        }
    }

    async fn collaborator(&self, call: &ToolCall) -> ToolObservation {
        let Some(tool) = self.registry.get(&call.tool) else {
            return ToolObservation::failure(call, format!("tool not available: {}", call.tool));
        };
        match tool.execute(call.input.clone()).await {
            Ok(out) => ToolObservation::success(call, out),
            Err(e) => ToolObservation::failure(call, e),
        }
    }
}

fn missing_field(call: &ToolCall, field: &str) -> ToolObservation {
    ToolObservation::failure(
        call,
        format!("INVALID_INPUT: missing required string field '{}'", field),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{PathGuard, SandboxSettings, DEFAULT_VIRTUAL_ROOT};
    use tempfile::TempDir;

    fn toolset(dir: &TempDir) -> SandboxToolset {
        let guard = PathGuard::new(DEFAULT_VIRTUAL_ROOT, dir.path()).unwrap();
        let sandbox = Arc::new(SandboxService::new(guard, SandboxSettings::default()));
        SandboxToolset::new(sandbox, Arc::new(ToolRegistry::new()))
    }

    #[tokio::test]
    async fn test_write_file_reports_json_and_file_exists() {
        let dir = TempDir::new().unwrap();
        let tools = toolset(&dir);
        let call = ToolCall::new(WRITE_FILE, json!({"path": "output/a.md", "content": "# hi"}));

        let obs = tools.run(&call, None).await;
        assert!(obs.ok, "{}", obs.output);
        let v: serde_json::Value = serde_json::from_str(&obs.output).unwrap();
        assert_eq!(v["path"], "/mnt/workspace/output/a.md");
        assert_eq!(v["bytes"], 4);
        assert_eq!(v["overwritten"], false);

        let obs = tools.run(&call, None).await;
        assert!(!obs.ok);
        assert_eq!(obs.error_code(), Some("FILE_EXISTS"));
    }

    #[tokio::test]
    async fn test_write_file_outside_output_rejected() {
        let dir = TempDir::new().unwrap();
        let tools = toolset(&dir);
        let call = ToolCall::new(WRITE_FILE, json!({"path": "src/main.rs", "content": "x"}));
        let obs = tools.run(&call, None).await;
        assert!(!obs.ok);
        assert_eq!(obs.error_code(), Some("PATH_NOT_ALLOWED"));
        assert!(!dir.path().join("src/main.rs").exists());
    }

    #[tokio::test]
    async fn test_read_missing_is_invalid_path() {
        let dir = TempDir::new().unwrap();
        let tools = toolset(&dir);
        let obs = tools
            .run(&ToolCall::new(READ_FILE, json!({"path": "nope.md"})), None)
            .await;
        assert_eq!(obs.error_code(), Some("INVALID_PATH"));

        let obs = tools.run(&ToolCall::new(READ_FILE, json!({})), None).await;
        assert_eq!(obs.error_code(), Some("INVALID_INPUT"));
    }

    #[tokio::test]
    async fn test_unregistered_collaborator_tool() {
        let dir = TempDir::new().unwrap();
        let tools = toolset(&dir);
        let obs = tools
            .run(&ToolCall::new("web_search", json!({"query": "tokio"})), None)
            .await;
        assert!(!obs.ok);
        assert_eq!(obs.output, "tool not available: web_search");
    }
}
