//! 进度事件：规划 / 模型 / 工具 / 澄清 / 子 Agent / 最终回复 / 错误，供前端流式展示

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Planning,
    Model,
    Tool,
    Clarification,
    Subagent,
    Final,
    Error,
}

/// 单条进度事件（可序列化为 JSON）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ProgressEvent {
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn planning(message: impl Into<String>) -> Self {
        Self::new(Stage::Planning, message)
    }

    pub fn model(message: impl Into<String>) -> Self {
        Self::new(Stage::Model, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Stage::Error, message)
    }

    /// 工具调用结束
    pub fn tool(tool: &str, ok: bool, preview: &str) -> Self {
        Self::new(Stage::Tool, format!("{} {}", tool, if ok { "ok" } else { "failed" }))
            .with_payload(json!({ "tool": tool, "ok": ok, "preview": preview }))
    }

    pub fn clarification(question: &str, options: &[ClarificationOption]) -> Self {
        Self::new(Stage::Clarification, question)
            .with_payload(json!({ "question": question, "options": options }))
    }

    pub fn subagent(payload: &SubagentPayload) -> Self {
        Self::new(
            Stage::Subagent,
            format!("{} {}", payload.task_id, payload.status),
        )
        .with_payload(serde_json::to_value(payload).unwrap_or(Value::Null))
    }

    /// 合成阶段的增量文本
    pub fn final_delta(delta: &str) -> Self {
        Self::new(Stage::Final, "delta").with_payload(json!({ "delta": delta }))
    }

    pub fn final_done(text: &str, saved_path: Option<&str>) -> Self {
        let mut payload = json!({ "text": text });
        if let Some(path) = saved_path {
            payload["savedPath"] = json!(path);
        }
        Self::new(Stage::Final, "done").with_payload(payload)
    }
}

/// 澄清选项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationOption {
    pub label: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended: Option<bool>,
}

impl ClarificationOption {
    pub fn new(label: impl Into<String>, value: impl Into<String>, recommended: bool) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
            recommended: recommended.then_some(true),
        }
    }
}

/// 子 Agent 进度
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentPayload {
    pub task_id: String,
    pub agent_type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
}

pub fn send_event(tx: Option<&UnboundedSender<ProgressEvent>>, ev: ProgressEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let ev = ProgressEvent::final_done("hello", Some("/mnt/workspace/output/a.md"));
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["stage"], "final");
        assert_eq!(v["payload"]["savedPath"], "/mnt/workspace/output/a.md");

        let ev = ProgressEvent::subagent(&SubagentPayload {
            task_id: "A".into(),
            agent_type: "researcher".into(),
            status: "running".into(),
            progress: None,
        });
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["stage"], "subagent");
        assert_eq!(v["payload"]["taskId"], "A");
        assert_eq!(v["payload"]["agentType"], "researcher");
        assert!(v["payload"].get("progress").is_none());
    }

    #[test]
    fn test_clarification_payload() {
        let opts = vec![
            ClarificationOption::new("Overwrite", "overwrite", true),
            ClarificationOption::new("Rename", "rename", false),
        ];
        let v = serde_json::to_value(ProgressEvent::clarification("Which?", &opts)).unwrap();
        assert_eq!(v["payload"]["options"][0]["recommended"], true);
        assert!(v["payload"]["options"][1].get("recommended").is_none());
    }
}
