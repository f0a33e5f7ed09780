//! ask 模式只读：从工具目录中去掉会修改工作区的工具，并拒绝这类调用

use async_trait::async_trait;

use crate::middleware::{ChatMode, HookError, HookResult, Middleware, MiddlewareContext, Next};
use crate::tools::{ToolCall, ToolObservation, MUTATING_TOOLS};

#[derive(Debug, Default, Clone, Copy)]
pub struct ChatModeMiddleware;

#[async_trait]
impl Middleware for ChatModeMiddleware {
    fn name(&self) -> &str {
        "chat_mode"
    }

    async fn before_model(&self, ctx: &MiddlewareContext) -> HookResult {
        if ctx.chat_mode() != ChatMode::Ask {
            return Ok(ctx.clone());
        }
        let tools = ctx
            .tools()
            .iter()
            .filter(|t| !MUTATING_TOOLS.contains(&t.name.as_str()))
            .cloned()
            .collect();
        Ok(ctx.with_tools(tools))
    }

    async fn wrap_tool_call(
        &self,
        ctx: &MiddlewareContext,
        call: ToolCall,
        next: Next<'_>,
    ) -> Result<ToolObservation, HookError> {
        if ctx.chat_mode() == ChatMode::Ask && MUTATING_TOOLS.contains(&call.tool.as_str()) {
            tracing::warn!(tool = %call.tool, "mutating tool refused in ask mode");
            return Ok(ToolObservation::failure(
                &call,
                format!("MODE_RESTRICTED: '{}' is not available in ask mode", call.tool),
            ));
        }
        next.run(ctx, call).await
    }
}
