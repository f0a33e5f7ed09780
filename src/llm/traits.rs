//! Model Service 抽象
//!
//! 真正的 HTTP 客户端在宿主进程中实现；核心只依赖 ModelService：
//! generate_text（非流式）与 generate_text_stream（增量回调），两者都接受取消令牌。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::llm::Message;

const DEFAULT_TEMPERATURE: f32 = 0.2;
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// 单个角色的模型路由配置（provider / model / 采样参数）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// 单次调用超时（秒），None 表示交给 Model Service 自己的默认值
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl RuntimeConfig {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            temperature: None,
            max_tokens: None,
            timeout_secs: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// 一次模型调用请求
#[derive(Debug, Clone, Serialize)]
pub struct ModelRequest {
    pub runtime_config: RuntimeConfig,
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ModelRequest {
    /// 采样参数优先取 runtime_config，缺省时用保守默认值
    pub fn new(runtime_config: RuntimeConfig, messages: Vec<Message>) -> Self {
        let temperature = runtime_config.temperature.unwrap_or(DEFAULT_TEMPERATURE);
        let max_tokens = runtime_config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        Self {
            runtime_config,
            messages,
            temperature,
            max_tokens,
        }
    }
}

/// Token 使用统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// 模型调用结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub provider: String,
    pub model: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    pub latency_ms: u64,
}

/// 模型调用错误
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("request cancelled")]
    Cancelled,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("provider error: {0}")]
    Provider(String),
}

/// Model Service trait：所有 LLM 后端由宿主实现
#[async_trait]
pub trait ModelService: Send + Sync {
    /// 非流式完成
    async fn generate_text(
        &self,
        request: ModelRequest,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, LlmError>;

    /// 流式完成：每个增量片段回调一次 on_delta，结束后返回完整结果。
    /// 默认实现退化为一次非流式调用 + 单次回调。
    async fn generate_text_stream(
        &self,
        request: ModelRequest,
        on_delta: &(dyn for<'a> Fn(&'a str) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, LlmError> {
        let response = self.generate_text(request, cancel).await?;
        on_delta(&response.text);
        Ok(response)
    }
}
