use serde::Serialize;

use crate::react::events::ClarificationOption;

/// 一次请求的终态（失败走 Err(AgentError)）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AgentOutcome {
    Answered {
        text: String,
        #[serde(rename = "savedPath", skip_serializing_if = "Option::is_none")]
        saved_path: Option<String>,
        steps: usize,
    },
    /// 暂停，等待用户回答
    ClarificationRequired {
        question: String,
        options: Vec<ClarificationOption>,
    },
    Cancelled,
}

impl AgentOutcome {
    pub fn text(&self) -> Option<&str> {
        match self {
            AgentOutcome::Answered { text, .. } => Some(text),
            _ => None,
        }
    }
}
