//! 日志中间件：各阶段输出 tracing 事件，工具调用输出一行结构化审计

use std::time::Instant;

use async_trait::async_trait;

use crate::middleware::{HookError, HookResult, Middleware, MiddlewareContext, Next};
use crate::tools::{ToolCall, ToolObservation};

const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    async fn before_agent(&self, ctx: &MiddlewareContext) -> HookResult {
        tracing::info!(
            session_id = %ctx.session_id(),
            task_id = %ctx.task_id(),
            chat_mode = ?ctx.chat_mode(),
            "agent request started"
        );
        Ok(ctx.clone())
    }

    async fn before_model(&self, ctx: &MiddlewareContext) -> HookResult {
        tracing::debug!(
            task_id = %ctx.task_id(),
            messages = ctx.messages().len(),
            tools = ctx.tools().len(),
            "model call"
        );
        Ok(ctx.clone())
    }

    async fn after_model(&self, ctx: &MiddlewareContext) -> HookResult {
        if let Some(resp) = ctx.llm_response() {
            tracing::debug!(
                task_id = %ctx.task_id(),
                provider = %resp.provider,
                model = %resp.model,
                latency_ms = resp.latency_ms,
                chars = resp.text.chars().count(),
                "model response"
            );
        }
        Ok(ctx.clone())
    }

    async fn after_agent(&self, ctx: &MiddlewareContext) -> HookResult {
        tracing::info!(
            task_id = %ctx.task_id(),
            answered = ctx.final_response().is_some(),
            "agent request finished"
        );
        Ok(ctx.clone())
    }

    async fn wrap_tool_call(
        &self,
        ctx: &MiddlewareContext,
        call: ToolCall,
        next: Next<'_>,
    ) -> Result<ToolObservation, HookError> {
        let start = Instant::now();
        let tool = call.tool.clone();
        let input_preview = preview(&call.input.to_string());
        let result = next.run(ctx, call).await;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "task_id": ctx.task_id(),
            "tool": tool,
            "ok": result.as_ref().map(|o| o.ok).unwrap_or(false),
            "duration_ms": start.elapsed().as_millis() as u64,
            "input_preview": input_preview,
        });
        tracing::info!(audit = %audit, "tool");
        result
    }
}

fn preview(s: &str) -> String {
    if s.chars().count() > PREVIEW_CHARS {
        format!("{}...", s.chars().take(PREVIEW_CHARS).collect::<String>())
    } else {
        s.to_string()
    }
}
