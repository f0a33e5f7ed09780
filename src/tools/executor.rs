//! 工具执行器
//!
//! 工具调用洋葱的最内层：沙箱与协作方工具在全局超时内执行，委派类工具交给 DelegationEngine；
//! 每次调用输出结构化审计日志（JSON）。失败一律转成 ok=false 的 ToolObservation，不向上抛错。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::timeout;
use uuid::Uuid;

use crate::delegation::{
    AgentRole, DelegationEngine, DelegationEvent, DelegationPlan, SubTask,
};
use crate::middleware::builtin::parse_todos;
use crate::middleware::{MiddlewareContext, ToolHandler};
use crate::react::events::{send_event, ProgressEvent, SubagentPayload};
use crate::tools::toolset::SandboxToolset;
use crate::tools::types::{
    ToolCall, ToolObservation, ASK_CLARIFICATION, DELEGATE_SUB_TASKS, TASK, WRITE_TODOS,
};

pub struct ToolExecutor {
    toolset: SandboxToolset,
    delegation: Option<Arc<DelegationEngine>>,
    timeout: Duration,
}

/// task 工具的输入；兼容 subagent_type / description 旧字段名
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SingleTaskInput {
    #[serde(alias = "subagent_type")]
    agent_role: String,
    #[serde(alias = "description")]
    prompt: String,
    #[serde(default)]
    write_path: Option<String>,
}

impl ToolExecutor {
    pub fn new(toolset: SandboxToolset, timeout_secs: u64) -> Self {
        Self {
            toolset,
            delegation: None,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    pub fn with_delegation(mut self, engine: Arc<DelegationEngine>) -> Self {
        self.delegation = Some(engine);
        self
    }

    pub fn toolset(&self) -> &SandboxToolset {
        &self.toolset
    }

    pub async fn execute(&self, ctx: &MiddlewareContext, call: ToolCall) -> ToolObservation {
        let start = Instant::now();
        let (obs, outcome) = match call.tool.as_str() {
            DELEGATE_SUB_TASKS => {
                let obs = match serde_json::from_value::<DelegationPlan>(call.input.clone()) {
                    Ok(plan) => self.delegate(ctx, &call, plan).await,
                    Err(e) => ToolObservation::failure(&call, format!("INVALID_INPUT: {}", e)),
                };
                (obs, "delegated")
            }
            TASK => {
                let obs = match single_task_plan(&call) {
                    Ok(plan) => self.delegate(ctx, &call, plan).await,
                    Err(e) => ToolObservation::failure(&call, e),
                };
                (obs, "delegated")
            }
            WRITE_TODOS => {
                let obs = match parse_todos(&call.input).and_then(|t| {
                    serde_json::to_string(&t).map_err(|e| e.to_string())
                }) {
                    Ok(out) => ToolObservation::success(&call, out),
                    Err(e) => ToolObservation::failure(&call, e),
                };
                (obs, "local")
            }
            ASK_CLARIFICATION => (
                ToolObservation::failure(&call, "ask_clarification is handled by the planner loop"),
                "local",
            ),
            name if SandboxToolset::handles(name) => {
                match timeout(self.timeout, self.toolset.run(&call, Some(ctx.workspace_path()))).await {
                    Ok(obs) => (obs, "sandbox"),
                    Err(_) => (
                        ToolObservation::failure(
                            &call,
                            format!("TOOL_TIMEOUT: {} exceeded {}s", call.tool, self.timeout.as_secs()),
                        ),
                        "timeout",
                    ),
                }
            }
            other => (
                ToolObservation::failure(&call, format!("Unknown tool: {}", other)),
                "unknown",
            ),
        };

        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.tool,
            "ok": obs.ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&call.input),
        });
        tracing::info!(audit = %audit.to_string(), "tool");
        obs
    }

    /// 执行计划，并把委派事件按 run_id 转成 subagent 进度事件
    async fn delegate(&self, ctx: &MiddlewareContext, call: &ToolCall, plan: DelegationPlan) -> ToolObservation {
        let Some(engine) = &self.delegation else {
            return ToolObservation::failure(call, format!("tool not available: {}", call.tool));
        };
        let run_id = Uuid::new_v4().to_string();
        let listener = ctx.runtime().events.clone().map(|tx| {
            let wanted = run_id.clone();
            engine.events().on(move |event: &DelegationEvent| {
                if event.run_id() != wanted {
                    return;
                }
                if let Some(payload) = subagent_payload(event) {
                    send_event(Some(&tx), ProgressEvent::subagent(&payload));
                }
            })
        });

        let result = engine
            .run_with_id(&run_id, plan, Some(ctx.workspace_path()), &ctx.runtime().cancel)
            .await;
        if let Some(id) = listener {
            engine.events().off(id);
        }

        match result {
            Ok(report) => {
                let output = serde_json::to_string(&report).unwrap_or_else(|e| e.to_string());
                if report.aborted {
                    ToolObservation::failure(call, output)
                } else {
                    ToolObservation::success(call, output)
                }
            }
            Err(e) => ToolObservation::failure(call, e.to_string()),
        }
    }
}

#[async_trait]
impl ToolHandler for ToolExecutor {
    async fn handle(&self, ctx: &MiddlewareContext, call: ToolCall) -> ToolObservation {
        self.execute(ctx, call).await
    }
}

fn single_task_plan(call: &ToolCall) -> Result<DelegationPlan, String> {
    let input: SingleTaskInput =
        serde_json::from_value(call.input.clone()).map_err(|e| format!("INVALID_INPUT: {}", e))?;
    let role = AgentRole::parse(&input.agent_role)
        .ok_or_else(|| format!("INVALID_INPUT: unknown agent role '{}'", input.agent_role))?;
    let mut task = SubTask::new("task-1", role, input.prompt);
    if let Some(path) = input.write_path {
        task = task.with_write_path(path);
    }
    Ok(DelegationPlan { tasks: vec![task] })
}

fn subagent_payload(event: &DelegationEvent) -> Option<SubagentPayload> {
    let (task_id, role, status, progress) = match event {
        DelegationEvent::TaskStarted { task_id, role, .. } => (task_id, role, "running", None),
        DelegationEvent::TaskProgress {
            task_id, role, message, ..
        } => (task_id, role, "running", Some(message.clone())),
        DelegationEvent::TaskCompleted { task_id, role, .. } => (task_id, role, "completed", None),
        DelegationEvent::TaskFailed {
            task_id, role, error, ..
        } => (task_id, role, "failed", Some(error.clone())),
        _ => return None,
    };
    Some(SubagentPayload {
        task_id: task_id.clone(),
        agent_type: role.as_str().to_string(),
        status: status.to_string(),
        progress,
    })
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
