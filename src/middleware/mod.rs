//! 中间件层：上下文、生命周期管线与内置中间件

pub mod builtin;
pub mod context;
pub mod pipeline;

pub use builtin::{ChatModeMiddleware, LoggingMiddleware, TodoMiddleware};
pub use context::{ChatMode, LifecycleState, MiddlewareContext, RuntimeHandles, Todo, TodoStatus};
pub use pipeline::{
    HookError, HookResult, Middleware, MiddlewarePipeline, Next, PipelineError, PipelineFailure,
    ToolHandler,
};

/// 默认管线：logging → chat_mode → todo
pub fn default_pipeline() -> MiddlewarePipeline {
    let mut pipeline = MiddlewarePipeline::new();
    pipeline
        .register(LoggingMiddleware)
        .register(ChatModeMiddleware)
        .register(TodoMiddleware);
    pipeline
}
