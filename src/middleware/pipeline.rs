//! 中间件管线
//!
//! 生命周期：before_agent → (before_model → 模型调用 → after_model)* → after_agent，
//! 每个阶段对每个中间件先调新名钩子、再调旧名钩子。
//! 工具调用按洋葱模型组合：先注册者在最外层，原始 ToolHandler 在最内层。

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::llm::{LlmError, ModelResponse};
use crate::middleware::{LifecycleState, MiddlewareContext};
use crate::tools::{ToolCall, ToolObservation};

/// 钩子失败；middleware 为最先出错的中间件名
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HookError {
    pub message: String,
    pub middleware: Option<String>,
}

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            middleware: None,
        }
    }

    /// 只在尚未归属时记录中间件名（内层错误保留原归属）
    pub fn attributed(mut self, middleware: &str) -> Self {
        if self.middleware.is_none() {
            self.middleware = Some(middleware.to_string());
        }
        self
    }
}

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("middleware '{middleware}' failed in {hook}: {source}")]
    Hook {
        middleware: String,
        hook: String,
        #[source]
        source: HookError,
    },

    #[error(transparent)]
    Model(#[from] LlmError),
}

impl PipelineError {
    fn hook(middleware: &str, hook: &str, source: HookError) -> Self {
        PipelineError::Hook {
            middleware: middleware.to_string(),
            hook: hook.to_string(),
            source,
        }
    }

    pub fn middleware(&self) -> Option<&str> {
        match self {
            PipelineError::Hook { middleware, .. } => Some(middleware),
            PipelineError::Model(_) => None,
        }
    }
}

/// execute() 失败时同时带回出错时的上下文（metadata.error 已写入）
#[derive(Debug, Error)]
#[error("{error}")]
pub struct PipelineFailure {
    pub error: PipelineError,
    pub context: MiddlewareContext,
}

pub type HookResult = Result<MiddlewareContext, HookError>;

/// 工具调用最内层的执行者
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn handle(&self, ctx: &MiddlewareContext, call: ToolCall) -> ToolObservation;
}

/// 中间件：所有钩子默认原样返回上下文
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    async fn before_agent(&self, ctx: &MiddlewareContext) -> HookResult {
        Ok(ctx.clone())
    }

    /// before_agent 的旧名
    async fn on_request(&self, ctx: &MiddlewareContext) -> HookResult {
        Ok(ctx.clone())
    }

    async fn before_model(&self, ctx: &MiddlewareContext) -> HookResult {
        Ok(ctx.clone())
    }

    /// before_model 的旧名
    async fn before_llm(&self, ctx: &MiddlewareContext) -> HookResult {
        Ok(ctx.clone())
    }

    async fn after_model(&self, ctx: &MiddlewareContext) -> HookResult {
        Ok(ctx.clone())
    }

    /// after_model 的旧名
    async fn after_llm(&self, ctx: &MiddlewareContext) -> HookResult {
        Ok(ctx.clone())
    }

    async fn after_agent(&self, ctx: &MiddlewareContext) -> HookResult {
        Ok(ctx.clone())
    }

    /// after_agent 的旧名
    async fn on_response(&self, ctx: &MiddlewareContext) -> HookResult {
        Ok(ctx.clone())
    }

    /// 包裹一次工具调用：可检查/改写 call，决定是否调用 next，并对结果做后处理
    async fn wrap_tool_call(
        &self,
        ctx: &MiddlewareContext,
        call: ToolCall,
        next: Next<'_>,
    ) -> Result<ToolObservation, HookError> {
        next.run(ctx, call).await
    }
}

/// 洋葱中剩余的层
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
    handler: &'a dyn ToolHandler,
}

impl<'a> Next<'a> {
    pub async fn run(self, ctx: &MiddlewareContext, call: ToolCall) -> Result<ToolObservation, HookError> {
        match self.rest.split_first() {
            Some((outer, rest)) => {
                let next = Next {
                    rest,
                    handler: self.handler,
                };
                outer
                    .wrap_tool_call(ctx, call, next)
                    .await
                    .map_err(|e| e.attributed(outer.name()))
            }
            None => Ok(self.handler.handle(ctx, call).await),
        }
    }
}

#[derive(Default, Clone)]
pub struct MiddlewarePipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewarePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按注册顺序追加
    pub fn register(&mut self, middleware: impl Middleware + 'static) -> &mut Self {
        self.register_arc(Arc::new(middleware))
    }

    pub fn register_arc(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    async fn run_phase(
        &self,
        ctx: &MiddlewareContext,
        state: LifecycleState,
    ) -> Result<MiddlewareContext, PipelineError> {
        let mut ctx = ctx.with_state(state);
        for mw in &self.middlewares {
            let primary = match state {
                LifecycleState::BeforeAgent => mw.before_agent(&ctx).await,
                LifecycleState::BeforeModel => mw.before_model(&ctx).await,
                LifecycleState::AfterModel => mw.after_model(&ctx).await,
                LifecycleState::AfterAgent => mw.after_agent(&ctx).await,
            };
            ctx = primary.map_err(|e| PipelineError::hook(mw.name(), state.as_str(), e))?;

            let legacy = match state {
                LifecycleState::BeforeAgent => mw.on_request(&ctx).await,
                LifecycleState::BeforeModel => mw.before_llm(&ctx).await,
                LifecycleState::AfterModel => mw.after_llm(&ctx).await,
                LifecycleState::AfterAgent => mw.on_response(&ctx).await,
            };
            ctx = legacy.map_err(|e| PipelineError::hook(mw.name(), state.legacy_name(), e))?;
        }
        Ok(ctx)
    }

    pub async fn run_before_agent(&self, ctx: &MiddlewareContext) -> Result<MiddlewareContext, PipelineError> {
        self.run_phase(ctx, LifecycleState::BeforeAgent).await
    }

    pub async fn run_after_agent(&self, ctx: &MiddlewareContext) -> Result<MiddlewareContext, PipelineError> {
        self.run_phase(ctx, LifecycleState::AfterAgent).await
    }

    /// before_model → executor → after_model；模型结果写入 ctx.llm_response
    pub async fn execute_model<F, Fut>(
        &self,
        ctx: &MiddlewareContext,
        executor: F,
    ) -> Result<MiddlewareContext, PipelineError>
    where
        F: FnOnce(MiddlewareContext) -> Fut + Send,
        Fut: Future<Output = Result<ModelResponse, LlmError>> + Send,
    {
        let ctx = self.run_phase(ctx, LifecycleState::BeforeModel).await?;
        let response = executor(ctx.clone()).await?;
        let ctx = ctx.with_llm_response(response);
        self.run_phase(&ctx, LifecycleState::AfterModel).await
    }

    /// 按洋葱顺序执行一次工具调用
    pub async fn execute_tool_call(
        &self,
        ctx: &MiddlewareContext,
        call: ToolCall,
        handler: &dyn ToolHandler,
    ) -> Result<ToolObservation, PipelineError> {
        let next = Next {
            rest: &self.middlewares,
            handler,
        };
        next.run(ctx, call).await.map_err(|e| {
            let middleware = e.middleware.clone().unwrap_or_default();
            PipelineError::hook(&middleware, "wrap_tool_call", e)
        })
    }

    /// before_agent → execute_model → after_agent；失败时把错误记入 metadata.error
    pub async fn execute<F, Fut>(
        &self,
        ctx: &MiddlewareContext,
        executor: F,
    ) -> Result<MiddlewareContext, PipelineFailure>
    where
        F: FnOnce(MiddlewareContext) -> Fut + Send,
        Fut: Future<Output = Result<ModelResponse, LlmError>> + Send,
    {
        let fail = |error: PipelineError, at: &MiddlewareContext| {
            let record = serde_json::json!({
                "message": error.to_string(),
                "middleware": error.middleware(),
            });
            PipelineFailure {
                context: at.with_metadata("error", record),
                error,
            }
        };

        let started = self.run_before_agent(ctx).await.map_err(|e| fail(e, ctx))?;
        let modeled = self
            .execute_model(&started, executor)
            .await
            .map_err(|e| fail(e, &started))?;
        self.run_after_agent(&modeled)
            .await
            .map_err(|e| fail(e, &modeled))
    }
}
