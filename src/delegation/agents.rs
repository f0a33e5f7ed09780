//! 子 Agent：researcher（只读调研）、bash_operator（沙箱命令）、writer（汇总成文件）
//!
//! 三者共用一个简短的 plan → act 循环，各自限定可用工具，并绑定自己的模型路由配置。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::delegation::pool::{ProgressReporter, TaskRunner, WorkerTask};
use crate::delegation::types::{AgentResult, AgentRole};
use crate::llm::{Message, ModelRequest, ModelRole, ModelRouting, ModelService, RuntimeConfig};
use crate::react::persist::check_output_target;
use crate::react::planner::{observation_message, parse_planner_output, PlannerAction};
use crate::tools::{
    builtin_tool_specs, SandboxToolset, ToolCall, ToolObservation, EXEC, GITHUB_SEARCH, LIST_DIR,
    MEMORY_SEARCH, READ_FILE, WEB_FETCH, WEB_SEARCH, WRITE_FILE,
};

pub const RESEARCHER_TOOLS: &[&str] = &[LIST_DIR, READ_FILE, WEB_SEARCH, WEB_FETCH, GITHUB_SEARCH, MEMORY_SEARCH];
pub const BASH_OPERATOR_TOOLS: &[&str] = &[EXEC, LIST_DIR, READ_FILE];
pub const WRITER_TOOLS: &[&str] = &[READ_FILE, LIST_DIR, WRITE_FILE];

/// 依赖输出写进提示词时的最大字符数
const DEPENDENCY_OUTPUT_MAX_CHARS: usize = 6000;

pub fn allowed_tools(role: AgentRole) -> &'static [&'static str] {
    match role {
        AgentRole::Researcher => RESEARCHER_TOOLS,
        AgentRole::BashOperator => BASH_OPERATOR_TOOLS,
        AgentRole::Writer => WRITER_TOOLS,
    }
}

pub struct SubAgentInput {
    pub task: WorkerTask,
    pub progress: Option<ProgressReporter>,
}

impl SubAgentInput {
    fn report(&self, message: impl Into<String>) {
        if let Some(p) = &self.progress {
            p.report(message);
        }
    }
}

#[async_trait]
pub trait SubAgent: Send + Sync {
    fn role(&self) -> AgentRole;

    async fn execute(&self, input: SubAgentInput) -> AgentResult;
}

/// 一次角色循环的记录
struct RoleRun {
    answer: Option<String>,
    writes: Vec<String>,
}

/// 角色共用的 plan → act 循环
struct RoleLoop {
    role: AgentRole,
    model: Arc<dyn ModelService>,
    profile: RuntimeConfig,
    toolset: SandboxToolset,
    max_steps: usize,
}

impl RoleLoop {
    fn system_prompt(&self, instructions: &str) -> String {
        let allowed = allowed_tools(self.role);
        let mut s = format!(
            "You are the {} sub-agent. {}\nReply with exactly one JSON object per turn:\n\
             {{\"action\": \"tool\", \"tool\": \"<name>\", \"input\": {{...}}}} or {{\"action\": \"answer\", \"answer\": \"<result>\"}}\n\
             Tools:\n",
            self.role, instructions
        );
        for spec in builtin_tool_specs().into_iter().filter(|t| allowed.contains(&t.name.as_str())) {
            s.push_str(&format!("- {}: {}\n", spec.name, spec.description));
        }
        s.push_str(&format!("Paths are virtual and rooted at {}.\n", self.toolset.virtual_root()));
        s
    }

    fn task_message(task: &WorkerTask) -> String {
        let mut s = format!("Task {}: {}", task.task_id, task.prompt);
        for dep in &task.dependency_outputs {
            let output: String = dep.output.chars().take(DEPENDENCY_OUTPUT_MAX_CHARS).collect();
            s.push_str(&format!("\n\nOutput of {}:\n{}", dep.task_id, output));
            if !dep.artifacts.is_empty() {
                s.push_str(&format!("\nFiles: {}", dep.artifacts.join(", ")));
            }
        }
        if let Some(path) = &task.write_path {
            s.push_str(&format!("\n\nWrite the final document to {}.", path));
        }
        s
    }

    async fn run(&self, input: &SubAgentInput, instructions: &str) -> Result<RoleRun, String> {
        let allowed = allowed_tools(self.role);
        let ws = input.task.workspace_override.as_deref();
        let cancel = CancellationToken::new();
        let mut messages = vec![
            Message::system(self.system_prompt(instructions)),
            Message::user(Self::task_message(&input.task)),
        ];
        let mut writes = Vec::new();

        for step in 1..=self.max_steps {
            let request = ModelRequest::new(self.profile.clone(), messages.clone());
            let response = self
                .model
                .generate_text(request, &cancel)
                .await
                .map_err(|e| format!("model call failed for {}: {}", self.role, e))?;
            messages.push(Message::assistant(response.text.clone()));

            let call = match parse_planner_output(&response.text) {
                Ok(PlannerAction::Answer { text }) => {
                    return Ok(RoleRun {
                        answer: Some(text),
                        writes,
                    })
                }
                Ok(PlannerAction::ToolCall(call)) => call,
                Err(e) => {
                    let obs = ToolObservation::failure(&ToolCall::new("planner", serde_json::json!({})), e.to_string());
                    messages.push(observation_message(&obs));
                    continue;
                }
            };

            let obs = if allowed.contains(&call.tool.as_str()) {
                self.toolset.run(&call, ws).await
            } else {
                ToolObservation::failure(
                    &call,
                    format!("TOOL_NOT_ALLOWED: '{}' is not available to the {} agent", call.tool, self.role),
                )
            };
            tracing::debug!(role = %self.role, step, tool = %obs.tool, ok = obs.ok, "sub-agent tool call");
            input.report(format!("step {}: {} {}", step, obs.tool, if obs.ok { "ok" } else { "failed" }));
            if obs.ok && obs.tool == WRITE_FILE {
                if let Some(path) = written_path(&obs) {
                    writes.push(path);
                }
            }
            messages.push(observation_message(&obs));
        }

        Ok(RoleRun { answer: None, writes })
    }
}

fn written_path(obs: &ToolObservation) -> Option<String> {
    let v: serde_json::Value = serde_json::from_str(&obs.output).ok()?;
    v.get("path")?.as_str().map(str::to_string)
}

fn finish(role: AgentRole, run: RoleRun, max_steps: usize) -> AgentResult {
    match run.answer {
        Some(answer) => AgentResult::ok(answer).with_artifacts(run.writes),
        None => AgentResult::failed(format!(
            "{} did not produce an answer within {} steps",
            role, max_steps
        ))
        .with_artifacts(run.writes),
    }
}

pub struct ResearcherAgent {
    inner: RoleLoop,
}

#[async_trait]
impl SubAgent for ResearcherAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Researcher
    }

    async fn execute(&self, input: SubAgentInput) -> AgentResult {
        let instructions = "Gather facts by reading files and searching. Do not modify anything. \
                            Answer with a concise summary of what you found.";
        match self.inner.run(&input, instructions).await {
            Ok(run) => finish(self.role(), run, self.inner.max_steps),
            Err(e) => AgentResult::failed(e),
        }
    }
}

pub struct BashOperatorAgent {
    inner: RoleLoop,
}

#[async_trait]
impl SubAgent for BashOperatorAgent {
    fn role(&self) -> AgentRole {
        AgentRole::BashOperator
    }

    async fn execute(&self, input: SubAgentInput) -> AgentResult {
        let instructions = "Run the shell commands needed for the task inside the workspace. \
                            Answer with the relevant command output and what it means.";
        match self.inner.run(&input, instructions).await {
            Ok(run) => finish(self.role(), run, self.inner.max_steps),
            Err(e) => AgentResult::failed(e),
        }
    }
}

pub struct WriterAgent {
    inner: RoleLoop,
}

impl WriterAgent {
    /// 循环结束仍未写到 write_path 时，把回答（或依赖输出）以不覆盖方式写入
    async fn ensure_written(&self, input: &SubAgentInput, run: &RoleRun, target: &str) -> Result<(), String> {
        let content = match &run.answer {
            Some(answer) if !answer.trim().is_empty() => answer.clone(),
            _ => input
                .task
                .dependency_outputs
                .iter()
                .map(|d| format!("## {}\n\n{}", d.task_id, d.output))
                .collect::<Vec<_>>()
                .join("\n\n"),
        };
        if content.trim().is_empty() {
            return Err("writer has no content to write".to_string());
        }
        let call = ToolCall::new(
            WRITE_FILE,
            serde_json::json!({ "path": target, "content": content, "overwrite": false }),
        );
        let obs = self
            .inner
            .toolset
            .run(&call, input.task.workspace_override.as_deref())
            .await;
        if obs.ok {
            Ok(())
        } else {
            Err(obs.output)
        }
    }
}

#[async_trait]
impl SubAgent for WriterAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Writer
    }

    async fn execute(&self, input: SubAgentInput) -> AgentResult {
        let instructions = "Consolidate the provided material into a well structured document. \
                            Use write_file to save it, then answer with a short summary.";
        let mut run = match self.inner.run(&input, instructions).await {
            Ok(run) => run,
            Err(e) => return AgentResult::failed(e),
        };

        let Some(write_path) = input.task.write_path.clone() else {
            return finish(self.role(), run, self.inner.max_steps);
        };
        let target = match check_output_target(self.inner.toolset.virtual_root(), &write_path, 0) {
            Ok(target) => target,
            Err(e) => return AgentResult::failed(e.to_string()),
        };
        if !run.writes.contains(&target) {
            if let Err(e) = self.ensure_written(&input, &run, &target).await {
                return AgentResult::failed(format!("failed to write {}: {}", target, e)).with_artifacts(run.writes);
            }
            input.report(format!("wrote {}", target));
            run.writes.push(target.clone());
        }
        let summary = run.answer.take().unwrap_or_else(|| format!("Wrote {}", target));
        AgentResult::ok(summary).with_artifacts(run.writes)
    }
}

/// 按角色分派的子 Agent 运行时（Worker Pool 的 TaskRunner）
pub struct AgentRuntime {
    agents: HashMap<AgentRole, Arc<dyn SubAgent>>,
}

impl AgentRuntime {
    pub fn new(model: Arc<dyn ModelService>, routing: &ModelRouting, toolset: SandboxToolset, max_steps: usize) -> Self {
        let role_loop = |role: AgentRole, model_role: ModelRole| RoleLoop {
            role,
            model: model.clone(),
            profile: routing.profile(model_role).clone(),
            toolset: toolset.clone(),
            max_steps: max_steps.max(1),
        };
        let mut runtime = Self::empty();
        runtime.register(Arc::new(ResearcherAgent {
            inner: role_loop(AgentRole::Researcher, ModelRole::Researcher),
        }));
        runtime.register(Arc::new(BashOperatorAgent {
            inner: role_loop(AgentRole::BashOperator, ModelRole::BashOperator),
        }));
        runtime.register(Arc::new(WriterAgent {
            inner: role_loop(AgentRole::Writer, ModelRole::Writer),
        }));
        runtime
    }

    pub fn empty() -> Self {
        Self {
            agents: HashMap::new(),
        }
    }

    /// 同角色后注册者覆盖先注册者
    pub fn register(&mut self, agent: Arc<dyn SubAgent>) {
        self.agents.insert(agent.role(), agent);
    }
}

#[async_trait]
impl TaskRunner for AgentRuntime {
    async fn run(&self, task: WorkerTask, progress: ProgressReporter) -> AgentResult {
        let Some(agent) = self.agents.get(&task.agent_role).cloned() else {
            return AgentResult::failed(format!("no agent registered for role {}", task.agent_role));
        };
        agent
            .execute(SubAgentInput {
                task,
                progress: Some(progress),
            })
            .await
    }
}
