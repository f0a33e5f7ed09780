//! Agent 错误类型
//!
//! 工具与协作方的失败只以 ToolObservation 的形式进入循环；这里只收会终止请求的错误。

use thiserror::Error;

use crate::delegation::DelegationError;
use crate::llm::{LlmError, ModelRole};
use crate::middleware::PipelineError;
use crate::sandbox::SandboxError;

#[derive(Error, Debug)]
pub enum AgentError {
    /// 模型调用失败，带上调用方角色
    #[error("model call failed for {role}: {message}")]
    Model { role: ModelRole, message: String },

    #[error(transparent)]
    Pipeline(PipelineError),

    #[error("PERSIST_FALLBACK_FAILED: {0}")]
    PersistFallbackFailed(String),

    /// 协作式取消；由循环出口转换为 AgentOutcome::Cancelled
    #[error("request cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Delegation(#[from] DelegationError),
}

impl AgentError {
    /// 把管线错误归到具体角色；取消单独识别
    pub fn from_pipeline(role: ModelRole, error: PipelineError) -> Self {
        match error {
            PipelineError::Model(LlmError::Cancelled) => AgentError::Cancelled,
            PipelineError::Model(e) => AgentError::Model {
                role,
                message: e.to_string(),
            },
            other => AgentError::Pipeline(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::HookError;

    #[test]
    fn test_pipeline_errors_are_classified() {
        let e = AgentError::from_pipeline(ModelRole::Synthesizer, PipelineError::Model(LlmError::Provider("boom".into())));
        assert_eq!(e.to_string(), "model call failed for synthesizer: provider error: boom");

        let e = AgentError::from_pipeline(ModelRole::Planner, PipelineError::Model(LlmError::Cancelled));
        assert!(matches!(e, AgentError::Cancelled));

        let hook = PipelineError::Hook {
            middleware: "audit".into(),
            hook: "before_model".into(),
            source: HookError::new("denied"),
        };
        let e = AgentError::from_pipeline(ModelRole::Planner, hook);
        assert!(e.to_string().contains("middleware 'audit' failed in before_model"));
    }
}
