//! 待办中间件：拦截 write_todos，并在每次模型调用前附上当前待办摘要

use async_trait::async_trait;
use serde::Deserialize;

use crate::llm::Message;
use crate::middleware::{
    HookError, HookResult, Middleware, MiddlewareContext, Next, Todo, TodoStatus,
};
use crate::tools::{ToolCall, ToolObservation, WRITE_TODOS};

#[derive(Debug, Default, Clone, Copy)]
pub struct TodoMiddleware;

#[derive(Deserialize)]
struct WriteTodosInput {
    todos: Vec<Todo>,
}

/// 校验并规范化 write_todos 的输入：去掉首尾空白，丢弃空条目
pub fn parse_todos(input: &serde_json::Value) -> Result<Vec<Todo>, String> {
    let parsed: WriteTodosInput =
        serde_json::from_value(input.clone()).map_err(|e| format!("INVALID_INPUT: {}", e))?;
    Ok(parsed
        .todos
        .into_iter()
        .filter_map(|t| {
            let content = t.content.trim().to_string();
            (!content.is_empty()).then_some(Todo {
                content,
                status: t.status,
            })
        })
        .collect())
}

fn summary(todos: &[Todo]) -> String {
    let mut out = String::from("Current todo list:");
    for t in todos {
        let mark = match t.status {
            TodoStatus::Pending => "[ ]",
            TodoStatus::InProgress => "[~]",
            TodoStatus::Completed => "[x]",
        };
        out.push_str(&format!("\n- {} {}", mark, t.content));
    }
    out
}

#[async_trait]
impl Middleware for TodoMiddleware {
    fn name(&self) -> &str {
        "todo"
    }

    async fn before_model(&self, ctx: &MiddlewareContext) -> HookResult {
        if ctx.todos().is_empty() {
            return Ok(ctx.clone());
        }
        Ok(ctx.with_message(Message::system(summary(ctx.todos()))))
    }

    async fn wrap_tool_call(
        &self,
        ctx: &MiddlewareContext,
        call: ToolCall,
        next: Next<'_>,
    ) -> Result<ToolObservation, HookError> {
        if call.tool != WRITE_TODOS {
            return next.run(ctx, call).await;
        }
        let obs = match parse_todos(&call.input) {
            Ok(todos) => {
                let output = serde_json::to_string(&todos).map_err(|e| HookError::new(e.to_string()))?;
                ToolObservation::success(&call, output)
            }
            Err(e) => ToolObservation::failure(&call, e),
        };
        Ok(obs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{MiddlewarePipeline, ToolHandler};
    use serde_json::json;

    struct Unreachable;

    #[async_trait]
    impl ToolHandler for Unreachable {
        async fn handle(&self, _ctx: &MiddlewareContext, call: ToolCall) -> ToolObservation {
            ToolObservation::failure(&call, "handler should not run")
        }
    }

    #[tokio::test]
    async fn test_write_todos_is_answered_by_middleware() {
        let mut p = MiddlewarePipeline::new();
        p.register(TodoMiddleware);
        let ctx = MiddlewareContext::new("s", "/tmp");
        let call = ToolCall::new(
            WRITE_TODOS,
            json!({"todos": [
                {"content": " scan repo ", "status": "completed"},
                {"content": "", "status": "pending"},
                {"content": "write report", "status": "in_progress"}
            ]}),
        );
        let obs = p.execute_tool_call(&ctx, call, &Unreachable).await.unwrap();
        assert!(obs.ok, "{}", obs.output);
        let todos: Vec<Todo> = serde_json::from_str(&obs.output).unwrap();
        assert_eq!(todos.len(), 2);
        assert_eq!(todos[0].content, "scan repo");
        assert_eq!(todos[1].status, TodoStatus::InProgress);
    }

    #[tokio::test]
    async fn test_invalid_todos() {
        let mut p = MiddlewarePipeline::new();
        p.register(TodoMiddleware);
        let ctx = MiddlewareContext::new("s", "/tmp");
        let call = ToolCall::new(WRITE_TODOS, json!({"todos": [{"content": "x", "status": "later"}]}));
        let obs = p.execute_tool_call(&ctx, call, &Unreachable).await.unwrap();
        assert!(!obs.ok);
        assert_eq!(obs.error_code(), Some("INVALID_INPUT"));
    }

    #[tokio::test]
    async fn test_summary_appended_before_model() {
        let mw = TodoMiddleware;
        let ctx = MiddlewareContext::new("s", "/tmp").with_todos(vec![Todo {
            content: "scan repo".into(),
            status: TodoStatus::Completed,
        }]);
        let out = mw.before_model(&ctx).await.unwrap();
        let last = out.messages().last().unwrap();
        assert!(last.content.contains("[x] scan repo"));
    }
}
