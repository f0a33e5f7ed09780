//! Planner 主循环
//!
//! 预分析（落盘需求）→ Plan → Act (Tool) → Observe → … → 合成最终回复（流式）。
//! 支持澄清暂停、重复调用去重、不可恢复失败的提前停止、兜底落盘与协作式取消。

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, AgentOutcome};
use crate::llm::{Message, ModelRequest, ModelRole, ModelRouting, ModelService};
use crate::middleware::{ChatMode, MiddlewareContext, MiddlewarePipeline, RuntimeHandles, Todo};
use crate::react::clarification::{ClarificationGenerator, ClarificationKind};
use crate::react::events::{send_event, ProgressEvent};
use crate::react::persist::{
    default_output_path, resolve_persist_path, HeuristicPersistPolicy, PersistPolicy,
    PersistRequirement,
};
use crate::react::planner::{
    build_system_prompt, observation_message, parse_planner_output, unwrap_answer_envelope,
    PlannerAction, PlannerPrompt,
};
use crate::sandbox::SandboxErrorCode;
use crate::tools::{
    builtin_tool_specs, ToolCall, ToolExecutor, ToolObservation, ASK_CLARIFICATION, WRITE_FILE,
    WRITE_TODOS,
};

/// 兜底落盘时尝试的最大后缀序号（name-1.md … name-N.md）
const MAX_FALLBACK_SUFFIX: usize = 20;
/// 事件里的工具输出预览字符数
const TOOL_PREVIEW_CHARS: usize = 200;

const SYNTHESIS_PROMPT: &str = "Write the final answer for the user based on the conversation and the tool \
observations below. Reply with the answer text only (markdown allowed), not JSON.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannerSettings {
    pub max_tool_steps: usize,
    /// 失败次数达到该值且至今全部失败时提前停止
    pub failure_stop_threshold: usize,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            max_tool_steps: 12,
            failure_stop_threshold: 2,
        }
    }
}

/// 一次用户请求
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub session_id: String,
    pub conversation_id: Option<String>,
    pub message: String,
    pub history: Vec<Message>,
    pub chat_mode: ChatMode,
    pub workspace_path: PathBuf,
}

impl AgentRequest {
    pub fn new(session_id: impl Into<String>, message: impl Into<String>, workspace_path: impl Into<PathBuf>) -> Self {
        Self {
            session_id: session_id.into(),
            conversation_id: None,
            message: message.into(),
            history: Vec::new(),
            chat_mode: ChatMode::Agent,
            workspace_path: workspace_path.into(),
        }
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn with_chat_mode(mut self, chat_mode: ChatMode) -> Self {
        self.chat_mode = chat_mode;
        self
    }

    pub fn with_conversation_id(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }
}

/// 落盘目标
#[derive(Debug, Clone)]
struct PersistTarget {
    path: String,
    explicit: bool,
}

/// 单次请求的循环状态
#[derive(Default)]
struct LoopState {
    transcript: Vec<Message>,
    observations: Vec<ToolObservation>,
    seen: HashSet<String>,
    failures: usize,
    steps: usize,
    saved_path: Option<String>,
    draft: Option<String>,
}

impl LoopState {
    fn observe(&mut self, obs: ToolObservation) {
        self.transcript.push(observation_message(&obs));
        self.observations.push(obs);
    }
}

enum StepFlow {
    Continue,
    Synthesize,
    Halt(AgentOutcome),
}

pub struct PlannerLoop {
    model: Arc<dyn ModelService>,
    routing: ModelRouting,
    pipeline: Arc<MiddlewarePipeline>,
    executor: Arc<ToolExecutor>,
    clarifier: ClarificationGenerator,
    persist_policy: Arc<dyn PersistPolicy>,
    settings: PlannerSettings,
}

impl PlannerLoop {
    pub fn new(
        model: Arc<dyn ModelService>,
        routing: ModelRouting,
        pipeline: Arc<MiddlewarePipeline>,
        executor: Arc<ToolExecutor>,
        settings: PlannerSettings,
    ) -> Self {
        let clarifier = ClarificationGenerator::new(model.clone(), routing.clarifier.clone());
        Self {
            model,
            routing,
            pipeline,
            executor,
            clarifier,
            persist_policy: Arc::new(HeuristicPersistPolicy),
            settings,
        }
    }

    /// 替换落盘判定策略
    pub fn with_persist_policy(mut self, policy: Arc<dyn PersistPolicy>) -> Self {
        self.persist_policy = policy;
        self
    }

    pub fn settings(&self) -> PlannerSettings {
        self.settings
    }

    fn virtual_root(&self) -> &str {
        self.executor.toolset().virtual_root()
    }

    /// 执行一次请求；取消返回 Ok(Cancelled)，其余失败发 error 事件后返回 Err
    pub async fn run(
        &self,
        request: AgentRequest,
        events: Option<UnboundedSender<ProgressEvent>>,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome, AgentError> {
        let session_id = request.session_id.clone();
        match self.run_request(request, events.clone(), cancel).await {
            Err(AgentError::Cancelled) => {
                tracing::info!(session_id = %session_id, "request cancelled");
                Ok(AgentOutcome::Cancelled)
            }
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "request failed");
                send_event(events.as_ref(), ProgressEvent::error(e.to_string()));
                Err(e)
            }
            Ok(outcome) => Ok(outcome),
        }
    }

    async fn run_request(
        &self,
        request: AgentRequest,
        events: Option<UnboundedSender<ProgressEvent>>,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome, AgentError> {
        let mut ctx = MiddlewareContext::new(request.session_id.clone(), request.workspace_path.clone())
            .with_chat_mode(request.chat_mode)
            .with_tools(builtin_tool_specs())
            .with_runtime(RuntimeHandles {
                cancel: cancel.clone(),
                events,
            });
        if let Some(id) = &request.conversation_id {
            ctx = ctx.with_conversation_id(id.clone());
        }
        ctx = self
            .pipeline
            .run_before_agent(&ctx)
            .await
            .map_err(|e| AgentError::from_pipeline(ModelRole::Planner, e))?;
        tracing::info!(session_id = %ctx.session_id(), task_id = %ctx.task_id(), mode = ?ctx.chat_mode(), "request started");

        // ask 模式只读，不做落盘判定
        let requirement = match ctx.chat_mode() {
            ChatMode::Agent => self.persist_policy.classify(&request.message),
            ChatMode::Ask => PersistRequirement::not_required(),
        };
        let target = if requirement.required {
            let resolution = resolve_persist_path(requirement.requested_path.as_deref(), self.virtual_root());
            if !resolution.ok {
                let path = resolution.requested_path.unwrap_or_default();
                let reason = resolution
                    .message
                    .or_else(|| resolution.code.map(|c| c.as_str().to_string()))
                    .unwrap_or_default();
                tracing::info!(path = %path, reason = %reason, "requested save path rejected");
                let kind = ClarificationKind::InvalidPersistPath { path, reason };
                return self.clarify(&ctx, kind, None, &request.message).await;
            }
            let target = match resolution.virtual_path {
                Some(path) => PersistTarget { path, explicit: true },
                None => PersistTarget {
                    path: default_output_path(self.virtual_root(), &request.message, Local::now()),
                    explicit: false,
                },
            };
            tracing::info!(reason = ?requirement.reason, target = %target.path, explicit = target.explicit, "persistence required");
            Some(target)
        } else {
            None
        };
        send_event(
            ctx.runtime().events.as_ref(),
            ProgressEvent::planning(match &target {
                Some(t) => format!("planning (result will be saved to {})", t.path),
                None => "planning".to_string(),
            }),
        );

        let mut state = LoopState::default();
        for step in 1..=self.settings.max_tool_steps {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let (next_ctx, flow) = self.plan_step(ctx, &request, target.as_ref(), &mut state, step).await?;
            ctx = next_ctx;
            match flow {
                StepFlow::Continue => continue,
                StepFlow::Synthesize => break,
                StepFlow::Halt(outcome) => return Ok(outcome),
            }
        }

        self.synthesize(ctx, &request, target.as_ref(), state).await
    }

    /// 一轮 Plan → Act → Observe
    async fn plan_step(
        &self,
        ctx: MiddlewareContext,
        request: &AgentRequest,
        target: Option<&PersistTarget>,
        state: &mut LoopState,
        step: usize,
    ) -> Result<(MiddlewareContext, StepFlow), AgentError> {
        let cancel = ctx.runtime().cancel.clone();
        let mut base = request.history.clone();
        base.push(Message::user(request.message.clone()));
        base.extend(state.transcript.iter().cloned());

        let model = self.model.clone();
        let profile = self.routing.planner.clone();
        let root = self.virtual_root().to_string();
        let persist_target = target.filter(|_| state.saved_path.is_none()).map(|t| t.path.clone());
        let call_cancel = cancel.clone();
        let ctx = self
            .pipeline
            .execute_model(&ctx.with_messages(base), move |ctx: MiddlewareContext| async move {
                let system = build_system_prompt(&PlannerPrompt {
                    tools: ctx.tools(),
                    chat_mode: ctx.chat_mode(),
                    virtual_root: &root,
                    persist_target: persist_target.as_deref(),
                });
                let mut messages = vec![Message::system(system)];
                messages.extend(ctx.messages().iter().cloned());
                model.generate_text(ModelRequest::new(profile, messages), &call_cancel).await
            })
            .await
            .map_err(|e| AgentError::from_pipeline(ModelRole::Planner, e))?;

        let text = ctx.llm_response().map(|r| r.text.clone()).unwrap_or_default();
        tracing::debug!(step, preview = %preview(&text, TOOL_PREVIEW_CHARS), "planner reply");
        send_event(ctx.runtime().events.as_ref(), ProgressEvent::model(format!("planner step {}", step)));
        state.transcript.push(Message::assistant(text.clone()));

        let mut call = match parse_planner_output(&text) {
            Ok(PlannerAction::Answer { text }) => {
                if let Some(t) = target.filter(|_| state.saved_path.is_none()) {
                    tracing::info!(step, target = %t.path, "answer held as draft until it is saved");
                    state.draft = Some(text);
                    let forced = ToolCall::new(WRITE_FILE, serde_json::json!({ "path": t.path }));
                    state.observe(ToolObservation::failure(
                        &forced,
                        format!(
                            "PERSIST_REQUIRED: the user asked for a saved file; call write_file with path {} before answering",
                            t.path
                        ),
                    ));
                    return Ok((ctx, StepFlow::Continue));
                }
                state.draft = Some(text);
                return Ok((ctx, StepFlow::Synthesize));
            }
            Ok(PlannerAction::ToolCall(call)) => call,
            Err(e) => {
                tracing::warn!(step, error = %e, "planner reply could not be parsed");
                state.observe(ToolObservation::failure(
                    &ToolCall::new("planner", serde_json::json!({})),
                    format!("INVALID_ACTION: {}", e),
                ));
                return Ok((ctx, StepFlow::Continue));
            }
        };

        if call.tool == ASK_CLARIFICATION {
            let question = call.str_arg("question").map(str::to_string);
            let outcome = self
                .clarify(&ctx, ClarificationKind::General, question, &request.message)
                .await?;
            return Ok((ctx, StepFlow::Halt(outcome)));
        }

        if call.tool == WRITE_FILE {
            if let Some(t) = target {
                let has_path = call.str_arg("path").is_some_and(|p| !p.trim().is_empty());
                if !has_path {
                    if let Some(input) = call.input.as_object_mut() {
                        input.insert("path".to_string(), serde_json::Value::String(t.path.clone()));
                    }
                }
            }
        }

        if !state.seen.insert(call.signature()) {
            tracing::info!(step, tool = %call.tool, "repeated tool call, moving to the answer");
            send_event(
                ctx.runtime().events.as_ref(),
                ProgressEvent::planning(format!("repeated {} call, finishing", call.tool)),
            );
            return Ok((ctx, StepFlow::Synthesize));
        }

        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let obs = self
            .pipeline
            .execute_tool_call(&ctx, call.clone(), self.executor.as_ref())
            .await
            .map_err(AgentError::Pipeline)?;
        state.steps += 1;
        send_event(
            ctx.runtime().events.as_ref(),
            ProgressEvent::tool(&obs.tool, obs.ok, &preview(&obs.output, TOOL_PREVIEW_CHARS)),
        );

        let mut ctx = ctx;
        if obs.ok {
            if obs.tool == WRITE_TODOS {
                if let Ok(todos) = serde_json::from_str::<Vec<Todo>>(&obs.output) {
                    ctx = ctx.with_todos(todos);
                }
            }
            if obs.tool == WRITE_FILE {
                let path = serde_json::from_str::<serde_json::Value>(&obs.output)
                    .ok()
                    .and_then(|v| v.get("path").and_then(|p| p.as_str()).map(str::to_string));
                if let Some(path) = path {
                    tracing::info!(path = %path, "result saved");
                    state.saved_path = Some(path);
                }
            }
            state.observe(obs);
            return Ok((ctx, StepFlow::Continue));
        }

        state.failures += 1;
        let code = obs.error_code().map(str::to_string);
        if obs.tool == WRITE_FILE && code.as_deref() == Some(SandboxErrorCode::FileExists.as_str()) {
            // 只有写向用户指定目标本身的冲突才需要用户确认
            let same_target = |t: &PersistTarget| {
                call.str_arg("path").map_or(true, |p| {
                    p == t.path
                        || resolve_persist_path(Some(p), self.virtual_root()).virtual_path.as_deref()
                            == Some(t.path.as_str())
                })
            };
            if let Some(t) = target.filter(|t| t.explicit && same_target(*t)) {
                let kind = ClarificationKind::FileExists { path: t.path.clone() };
                let outcome = self.clarify(&ctx, kind, None, &request.message).await?;
                return Ok((ctx, StepFlow::Halt(outcome)));
            }
        }
        state.observe(obs);

        let path_error = code
            .as_deref()
            .and_then(SandboxErrorCode::parse)
            .is_some_and(|c| c.is_path_error());
        let all_failed = state.failures >= self.settings.failure_stop_threshold
            && state.observations.iter().all(|o| !o.ok);
        if path_error || all_failed {
            tracing::info!(step, failures = state.failures, path_error, "stopping planning early");
            return Ok((ctx, StepFlow::Synthesize));
        }
        Ok((ctx, StepFlow::Continue))
    }

    /// 生成恰好 3 个选项并暂停请求
    async fn clarify(
        &self,
        ctx: &MiddlewareContext,
        kind: ClarificationKind,
        question: Option<String>,
        user_message: &str,
    ) -> Result<AgentOutcome, AgentError> {
        let question = question
            .filter(|q| !q.trim().is_empty())
            .unwrap_or_else(|| kind.default_question());
        let options = self
            .clarifier
            .generate_options(&kind, &question, user_message, &ctx.runtime().cancel)
            .await;
        tracing::info!(kind = kind.as_str(), question = %question, "clarification required");
        send_event(
            ctx.runtime().events.as_ref(),
            ProgressEvent::clarification(&question, &options),
        );
        self.pipeline
            .run_after_agent(&ctx.with_final_response(question.clone()))
            .await
            .map_err(|e| AgentError::from_pipeline(ModelRole::Clarifier, e))?;
        Ok(AgentOutcome::ClarificationRequired { question, options })
    }

    /// 合成阶段：流式生成最终回复，必要时兜底落盘
    async fn synthesize(
        &self,
        ctx: MiddlewareContext,
        request: &AgentRequest,
        target: Option<&PersistTarget>,
        state: LoopState,
    ) -> Result<AgentOutcome, AgentError> {
        let cancel = ctx.runtime().cancel.clone();
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let mut base = request.history.clone();
        base.push(Message::user(request.message.clone()));
        base.extend(state.transcript.iter().cloned());
        if let Some(draft) = &state.draft {
            base.push(Message::user(format!("Draft answer:\n{}", draft)));
        }

        let model = self.model.clone();
        let profile = self.routing.synthesizer.clone();
        let events = ctx.runtime().events.clone();
        let call_cancel = cancel.clone();
        let ctx = self
            .pipeline
            .execute_model(&ctx.with_messages(base), move |ctx: MiddlewareContext| async move {
                let on_delta = move |delta: &str| send_event(events.as_ref(), ProgressEvent::final_delta(delta));
                let mut messages = vec![Message::system(SYNTHESIS_PROMPT)];
                messages.extend(ctx.messages().iter().cloned());
                model
                    .generate_text_stream(ModelRequest::new(profile, messages), &on_delta, &call_cancel)
                    .await
            })
            .await
            .map_err(|e| AgentError::from_pipeline(ModelRole::Synthesizer, e))?;

        let mut text = ctx
            .llm_response()
            .map(|r| unwrap_answer_envelope(&r.text))
            .unwrap_or_default();
        if text.is_empty() {
            text = state.draft.clone().unwrap_or_default();
        }

        let mut saved_path = state.saved_path.clone();
        if let Some(t) = target.filter(|_| saved_path.is_none()) {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let path = self.fallback_write(&ctx, &t.path, &text).await?;
            let note = format!("\n\nSaved to `{}`", path);
            send_event(ctx.runtime().events.as_ref(), ProgressEvent::final_delta(&note));
            text.push_str(&note);
            saved_path = Some(path);
        }

        let ctx = self
            .pipeline
            .run_after_agent(&ctx.with_final_response(text.clone()))
            .await
            .map_err(|e| AgentError::from_pipeline(ModelRole::Synthesizer, e))?;
        send_event(
            ctx.runtime().events.as_ref(),
            ProgressEvent::final_done(&text, saved_path.as_deref()),
        );
        tracing::info!(session_id = %ctx.session_id(), steps = state.steps, saved = ?saved_path, "request answered");
        Ok(AgentOutcome::Answered {
            text,
            saved_path,
            steps: state.steps,
        })
    }

    /// 不覆盖的兜底写入：目标已存在时依次尝试 -1、-2 … 后缀
    async fn fallback_write(&self, ctx: &MiddlewareContext, target: &str, content: &str) -> Result<String, AgentError> {
        for attempt in 0..=MAX_FALLBACK_SUFFIX {
            let path = with_suffix(target, attempt);
            let call = ToolCall::new(
                WRITE_FILE,
                serde_json::json!({ "path": &path, "content": content, "overwrite": false }),
            );
            let obs = self
                .executor
                .toolset()
                .run(&call, Some(ctx.workspace_path()))
                .await;
            if obs.ok {
                let written = serde_json::from_str::<serde_json::Value>(&obs.output)
                    .ok()
                    .and_then(|v| v.get("path").and_then(|p| p.as_str()).map(str::to_string))
                    .unwrap_or(path);
                tracing::info!(path = %written, "fallback write succeeded");
                return Ok(written);
            }
            if obs.error_code() != Some(SandboxErrorCode::FileExists.as_str()) {
                tracing::warn!(path = %path, error = %obs.output, "fallback write failed");
                return Err(AgentError::PersistFallbackFailed(obs.output));
            }
        }
        Err(AgentError::PersistFallbackFailed(format!(
            "no free file name for {} after {} attempts",
            target, MAX_FALLBACK_SUFFIX
        )))
    }
}

/// report.md + 2 → report-2.md
fn with_suffix(path: &str, n: usize) -> String {
    if n == 0 {
        return path.to_string();
    }
    let (dir, file) = match path.rsplit_once('/') {
        Some((dir, file)) => (format!("{}/", dir), file),
        None => (String::new(), path),
    };
    match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}{}-{}.{}", dir, stem, n, ext),
        _ => format!("{}{}-{}", dir, file, n),
    }
}

fn preview(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}...", s.chars().take(max).collect::<String>())
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_suffix() {
        assert_eq!(with_suffix("/mnt/workspace/output/report.md", 0), "/mnt/workspace/output/report.md");
        assert_eq!(with_suffix("/mnt/workspace/output/report.md", 2), "/mnt/workspace/output/report-2.md");
        assert_eq!(with_suffix("output/notes", 1), "output/notes-1");
    }

    #[test]
    fn test_default_settings() {
        let s = PlannerSettings::default();
        assert_eq!(s.max_tool_steps, 12);
        assert_eq!(s.failure_stop_threshold, 2);
    }
}
