//! Mock Model Service（用于测试与离线运行，无需 API）
//!
//! 按脚本顺序返回预设回复；脚本耗尽后按 fallback 策略处理（报错 / 固定文本 / 回显最后一条 User 消息）。
//! 所有收到的请求都会被记录，测试可据此断言调用次数与使用的模型。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::llm::{LlmError, Message, ModelRequest, ModelResponse, ModelService, Role};

/// 流式输出时每段字符数
const CHUNK_CHARS: usize = 16;

#[derive(Debug, Clone)]
enum Fallback {
    Fail,
    Fixed(String),
    EchoLastUser,
}

/// Mock 客户端：脚本化回复
#[derive(Debug)]
pub struct MockModelService {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    requests: Mutex<Vec<ModelRequest>>,
    fallback: Fallback,
}

impl Default for MockModelService {
    fn default() -> Self {
        Self::scripted(Vec::<String>::new())
    }
}

impl MockModelService {
    /// 按顺序返回给定文本
    pub fn scripted<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(responses.into_iter().map(|s| Ok(s.into())).collect()),
            requests: Mutex::new(Vec::new()),
            fallback: Fallback::Fail,
        }
    }

    /// 离线模式：把最后一条 User 消息包装成 answer 动作返回
    pub fn echo() -> Self {
        Self {
            fallback: Fallback::EchoLastUser,
            ..Self::default()
        }
    }

    /// 脚本耗尽后始终返回 text
    pub fn with_fallback(mut self, text: impl Into<String>) -> Self {
        self.fallback = Fallback::Fixed(text.into());
        self
    }

    /// 在脚本末尾追加一次失败
    pub fn then_fail(self, error: LlmError) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Err(error));
        }
        self
    }

    /// 已收到的请求（按时间顺序）
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    fn next_reply(&self, messages: &[Message]) -> Result<String, LlmError> {
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        if let Some(reply) = scripted {
            return reply;
        }
        match &self.fallback {
            Fallback::Fail => Err(LlmError::Provider("mock script exhausted".to_string())),
            Fallback::Fixed(text) => Ok(text.clone()),
            Fallback::EchoLastUser => {
                let last_user = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or("(no input)");
                Ok(serde_json::json!({
                    "action": "answer",
                    "answer": format!("Echo from Mock: {}", last_user),
                })
                .to_string())
            }
        }
    }
}

#[async_trait]
impl ModelService for MockModelService {
    async fn generate_text(
        &self,
        request: ModelRequest,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, LlmError> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        let start = Instant::now();
        let text = self.next_reply(&request.messages)?;
        let provider = request.runtime_config.provider.clone();
        let model = request.runtime_config.model.clone();
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        Ok(ModelResponse {
            provider,
            model,
            text,
            usage: None,
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn generate_text_stream(
        &self,
        request: ModelRequest,
        on_delta: &(dyn for<'a> Fn(&'a str) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, LlmError> {
        let response = self.generate_text(request, cancel).await?;
        let chars: Vec<char> = response.text.chars().collect();
        for chunk in chars.chunks(CHUNK_CHARS) {
            if cancel.is_cancelled() {
                return Err(LlmError::Cancelled);
            }
            on_delta(&chunk.iter().collect::<String>());
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::RuntimeConfig;

    fn request(text: &str) -> ModelRequest {
        ModelRequest::new(RuntimeConfig::new("mock", "m"), vec![Message::user(text)])
    }

    #[tokio::test]
    async fn test_scripted_then_exhausted() {
        let mock = MockModelService::scripted(["one"]);
        let cancel = CancellationToken::new();
        let first = mock.generate_text(request("a"), &cancel).await.unwrap();
        assert_eq!(first.text, "one");
        assert!(mock.generate_text(request("b"), &cancel).await.is_err());
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_echo_fallback_wraps_answer() {
        let mock = MockModelService::echo();
        let resp = mock
            .generate_text(request("hello"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(resp.text.contains("\"action\":\"answer\""));
        assert!(resp.text.contains("hello"));
    }

    #[tokio::test]
    async fn test_stream_emits_all_chunks() {
        let mock = MockModelService::scripted(["abcdefghijklmnopqrstuvwxyz"]);
        let collected = Mutex::new(String::new());
        let sink = |d: &str| collected.lock().unwrap().push_str(d);
        let resp = mock
            .generate_text_stream(request("x"), &sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(*collected.lock().unwrap(), resp.text);
    }

    #[tokio::test]
    async fn test_cancelled_before_call() {
        let mock = MockModelService::scripted(["never"]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            mock.generate_text(request("x"), &cancel).await,
            Err(LlmError::Cancelled)
        ));
    }
}
