//! Planner 输出解析与提示词构造
//!
//! 模型输出是自由文本，这里把它严格解析为 PlannerAction：
//! 依次尝试 ```json 代码块、普通 ``` 代码块、文本中所有括号配平的 `{...}` 对象，
//! 第一个带 `action`（或旧格式 `tool`）字段的对象胜出。

use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::llm::Message;
use crate::middleware::ChatMode;
use crate::tools::{ToolCall, ToolObservation, ToolSpec};

/// Observation 写回对话时的最大字符数
const OBSERVATION_MAX_CHARS: usize = 4000;

#[derive(Debug, Clone, PartialEq)]
pub enum PlannerAction {
    Answer { text: String },
    ToolCall(ToolCall),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlannerParseError {
    #[error("response contains JSON but no planner action: {0}")]
    NoAction(String),

    #[error("malformed planner JSON: {0}")]
    Malformed(String),

    #[error("unknown action '{0}', expected \"tool\" or \"answer\"")]
    UnknownAction(String),

    #[error("tool action is missing a non-empty 'tool' field")]
    MissingTool,

    #[error("answer action is missing the 'answer' text")]
    MissingAnswer,

    #[error("tool input must be a JSON object")]
    InvalidInput,
}

/// 解析模型输出；完全没有 JSON 时整段文本就是回答
pub fn parse_planner_output(text: &str) -> Result<PlannerAction, PlannerParseError> {
    let trimmed = text.trim();

    let mut candidates: Vec<&str> = Vec::new();
    candidates.extend(extract_fenced(trimmed, true));
    candidates.extend(extract_fenced(trimmed, false));
    candidates.extend(extract_balanced(trimmed, '{', '}'));

    let mut first_problem: Option<PlannerParseError> = None;
    for candidate in candidates {
        let candidate = candidate.trim();
        match serde_json::from_str::<Value>(candidate) {
            Ok(Value::Object(obj)) => {
                if obj.contains_key("action") || obj.contains_key("tool") {
                    return interpret(obj);
                }
                first_problem.get_or_insert(PlannerParseError::NoAction(preview(candidate)));
            }
            Ok(_) => {}
            Err(e) => {
                if candidate.starts_with('{') && (candidate.contains("\"action\"") || candidate.contains("\"tool\"")) {
                    first_problem.get_or_insert(PlannerParseError::Malformed(e.to_string()));
                }
            }
        }
    }

    match first_problem {
        Some(err) => Err(err),
        None => Ok(PlannerAction::Answer {
            text: trimmed.to_string(),
        }),
    }
}

fn interpret(obj: Map<String, Value>) -> Result<PlannerAction, PlannerParseError> {
    let action = obj.get("action").and_then(Value::as_str);
    match action {
        Some("answer") => {
            let text = obj
                .get("answer")
                .and_then(Value::as_str)
                .ok_or(PlannerParseError::MissingAnswer)?;
            Ok(PlannerAction::Answer {
                text: text.trim().to_string(),
            })
        }
        Some("tool") | None => {
            let tool = obj
                .get("tool")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .ok_or(PlannerParseError::MissingTool)?;
            // 新格式用 input，旧格式用 args
            let input = match obj.get("input").or_else(|| obj.get("args")) {
                None | Some(Value::Null) => json!({}),
                Some(v @ Value::Object(_)) => v.clone(),
                Some(_) => return Err(PlannerParseError::InvalidInput),
            };
            let reason = obj
                .get("reason")
                .and_then(Value::as_str)
                .map(str::to_string);
            Ok(PlannerAction::ToolCall(ToolCall {
                tool: tool.to_string(),
                input,
                reason,
            }))
        }
        Some(other) => Err(PlannerParseError::UnknownAction(other.to_string())),
    }
}

/// 取出 ``` 代码块内容；json_only 为 true 时只取 ```json 块，否则只取其余代码块
pub fn extract_fenced(text: &str, json_only: bool) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("```") {
        let after = &rest[start + 3..];
        let Some(info_end) = after.find('\n') else {
            break;
        };
        let info = after[..info_end].trim();
        let body = &after[info_end + 1..];
        let Some(end) = body.find("```") else {
            break;
        };
        let is_json = info.eq_ignore_ascii_case("json");
        if is_json == json_only {
            out.push(&body[..end]);
        }
        rest = &body[end + 3..];
    }
    out
}

/// 找出文本中所有顶层括号配平的片段（感知 JSON 字符串与转义）
pub fn extract_balanced(text: &str, open: char, close: char) -> Vec<&str> {
    let mut out = Vec::new();
    let mut from = 0;
    while let Some(rel) = text[from..].find(open) {
        let start = from + rel;
        match matching_close(&text[start..], open, close) {
            Some(len) => {
                out.push(&text[start..start + len]);
                from = start + len;
            }
            None => from = start + open.len_utf8(),
        }
    }
    out
}

fn matching_close(s: &str, open: char, close: char) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        if c == '"' {
            in_string = true;
        } else if c == open {
            depth += 1;
        } else if c == close {
            depth = depth.saturating_sub(1);
            if depth == 0 {
                return Some(i + c.len_utf8());
            }
        }
    }
    None
}

/// 合成模型偶尔仍用 answer 动作格式回复，此时取出其中的文本
pub fn unwrap_answer_envelope(text: &str) -> String {
    match parse_planner_output(text) {
        Ok(PlannerAction::Answer { text }) => text,
        _ => text.trim().to_string(),
    }
}

/// 构造 system prompt 所需的信息
pub struct PlannerPrompt<'a> {
    pub tools: &'a [ToolSpec],
    pub chat_mode: ChatMode,
    pub virtual_root: &'a str,
    /// 需要落盘时的目标路径
    pub persist_target: Option<&'a str>,
}

pub fn build_system_prompt(p: &PlannerPrompt<'_>) -> String {
    let mut s = String::from(
        "You are an engineering assistant working inside a sandboxed workspace. \
         Decide the next step and reply with exactly one JSON object.\n\n",
    );
    s.push_str("To call a tool:\n{\"action\": \"tool\", \"tool\": \"<name>\", \"input\": {...}, \"reason\": \"<why>\"}\n");
    s.push_str("To finish:\n{\"action\": \"answer\", \"answer\": \"<final answer>\"}\n\n");

    s.push_str("Available tools:\n");
    for t in p.tools {
        s.push_str(&format!("- {}: {}\n", t.name, t.description));
    }

    s.push_str(&format!(
        "\nAll paths are virtual and rooted at {}. Files you create must go under {}/output/.\n",
        p.virtual_root,
        p.virtual_root.trim_end_matches('/')
    ));
    match p.chat_mode {
        ChatMode::Ask => s.push_str("Mode: ask. The workspace is read-only; do not try to modify it.\n"),
        ChatMode::Agent => s.push_str("Mode: agent. You may modify the workspace with the tools above.\n"),
    }
    if let Some(target) = p.persist_target {
        s.push_str(&format!(
            "The user expects the result saved as a file. Call write_file with path \"{}\" before answering.\n",
            target
        ));
    }
    s.push_str("Never repeat a tool call with identical input.\n");
    s
}

/// 把一次观察结果写回对话
pub fn observation_message(obs: &ToolObservation) -> Message {
    let output = if obs.output.chars().count() > OBSERVATION_MAX_CHARS {
        format!(
            "{}...(truncated)",
            obs.output.chars().take(OBSERVATION_MAX_CHARS).collect::<String>()
        )
    } else {
        obs.output.clone()
    };
    Message::user(format!(
        "Observation from {} (ok={}):\n{}",
        obs.tool, obs.ok, output
    ))
}

fn preview(s: &str) -> String {
    s.chars().take(120).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_answer() {
        let action = parse_planner_output("  The answer is 42.  ").unwrap();
        assert_eq!(action, PlannerAction::Answer { text: "The answer is 42.".into() });
    }

    #[test]
    fn test_fenced_json_tool_call() {
        let text = "Let me look.\n```json\n{\"action\": \"tool\", \"tool\": \"read_file\", \"input\": {\"path\": \"README.md\"}, \"reason\": \"need context\"}\n```\nthanks";
        match parse_planner_output(text).unwrap() {
            PlannerAction::ToolCall(call) => {
                assert_eq!(call.tool, "read_file");
                assert_eq!(call.input["path"], "README.md");
                assert_eq!(call.reason.as_deref(), Some("need context"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_embedded_object_with_braces_in_strings() {
        let text = r#"Sure: {"action":"answer","answer":"use {braces} and \"quotes\""} done"#;
        assert_eq!(
            parse_planner_output(text).unwrap(),
            PlannerAction::Answer { text: "use {braces} and \"quotes\"".into() }
        );
    }

    #[test]
    fn test_first_action_object_wins() {
        let text = r#"{"note": 1} then {"action":"tool","tool":"list_dir"} then {"action":"answer","answer":"x"}"#;
        match parse_planner_output(text).unwrap() {
            PlannerAction::ToolCall(call) => {
                assert_eq!(call.tool, "list_dir");
                assert_eq!(call.input, json!({}));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_legacy_tool_args() {
        let text = r#"{"tool": "exec", "args": {"command": "ls"}}"#;
        match parse_planner_output(text).unwrap() {
            PlannerAction::ToolCall(call) => {
                assert_eq!(call.tool, "exec");
                assert_eq!(call.input["command"], "ls");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_json_without_action_is_error() {
        let err = parse_planner_output(r#"{"path": "a.md"}"#).unwrap_err();
        assert!(matches!(err, PlannerParseError::NoAction(_)));

        let err = parse_planner_output(r#"{"action": "dance"}"#).unwrap_err();
        assert_eq!(err, PlannerParseError::UnknownAction("dance".into()));

        let err = parse_planner_output(r#"{"action": "tool", "input": {}}"#).unwrap_err();
        assert_eq!(err, PlannerParseError::MissingTool);

        let err = parse_planner_output(r#"{"action": "tool", "tool": "x", "input": [1]}"#).unwrap_err();
        assert_eq!(err, PlannerParseError::InvalidInput);
    }

    #[test]
    fn test_malformed_action_json() {
        let err = parse_planner_output(r#"{"action": "tool", "tool": read_file}"#).unwrap_err();
        assert!(matches!(err, PlannerParseError::Malformed(_)));
    }

    #[test]
    fn test_unbalanced_prefix_is_skipped() {
        let text = r#"open { here, then {"action":"answer","answer":"ok"}"#;
        assert_eq!(
            parse_planner_output(text).unwrap(),
            PlannerAction::Answer { text: "ok".into() }
        );
    }

    #[test]
    fn test_extract_balanced_arrays() {
        let found = extract_balanced(r#"options: [{"label":"a]"}, [1]] tail"#, '[', ']');
        assert_eq!(found, vec![r#"[{"label":"a]"}, [1]]"#]);
    }

    #[test]
    fn test_unwrap_answer_envelope() {
        assert_eq!(unwrap_answer_envelope(r#"{"action":"answer","answer":"hi"}"#), "hi");
        assert_eq!(unwrap_answer_envelope("plain"), "plain");
    }

    #[test]
    fn test_prompt_mentions_persist_target_and_mode() {
        let tools = vec![ToolSpec::new("read_file", "Read a file")];
        let prompt = build_system_prompt(&PlannerPrompt {
            tools: &tools,
            chat_mode: ChatMode::Ask,
            virtual_root: "/mnt/workspace",
            persist_target: Some("/mnt/workspace/output/r.md"),
        });
        assert!(prompt.contains("- read_file: Read a file"));
        assert!(prompt.contains("Mode: ask"));
        assert!(prompt.contains("/mnt/workspace/output/r.md"));
    }
}
