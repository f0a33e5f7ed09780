//! 澄清子流程：为一个问题生成恰好 3 个回复选项
//!
//! 先请 clarifier 模型返回 JSON 数组；模型失败、数量不对或无法解析时，按澄清类型退回固定模板。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::llm::{Message, ModelRequest, ModelService, RuntimeConfig};
use crate::react::events::ClarificationOption;
use crate::react::planner::{extract_balanced, extract_fenced};

const OPTION_COUNT: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClarificationKind {
    General,
    FileExists { path: String },
    InvalidPersistPath { path: String, reason: String },
}

impl ClarificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClarificationKind::General => "general",
            ClarificationKind::FileExists { .. } => "file_exists",
            ClarificationKind::InvalidPersistPath { .. } => "invalid_persist_path",
        }
    }

    /// 该类型的默认提问
    pub fn default_question(&self) -> String {
        match self {
            ClarificationKind::General => "Could you clarify what you would like me to do?".to_string(),
            ClarificationKind::FileExists { path } => {
                format!("{} already exists. What should I do?", path)
            }
            ClarificationKind::InvalidPersistPath { path, reason } => {
                format!("I can't save to {} ({}). Where should the result go?", path, reason)
            }
        }
    }
}

pub struct ClarificationGenerator {
    model: Arc<dyn ModelService>,
    profile: RuntimeConfig,
}

impl ClarificationGenerator {
    pub fn new(model: Arc<dyn ModelService>, profile: RuntimeConfig) -> Self {
        Self { model, profile }
    }

    /// 始终返回恰好 3 个选项
    pub async fn generate_options(
        &self,
        kind: &ClarificationKind,
        question: &str,
        user_message: &str,
        cancel: &CancellationToken,
    ) -> Vec<ClarificationOption> {
        let messages = vec![
            Message::system(
                "Suggest replies the user could give to the question below. \
                 Reply with only a JSON array of exactly 3 objects: \
                 [{\"label\": \"short button text\", \"value\": \"reply text\", \"recommended\": true|false}]. \
                 Mark the single best option as recommended.",
            ),
            Message::user(format!(
                "User request: {}\nQuestion: {}\nSituation: {}",
                user_message,
                question,
                kind.as_str()
            )),
        ];
        let request = ModelRequest::new(self.profile.clone(), messages);
        match self.model.generate_text(request, cancel).await {
            Ok(resp) => match parse_options(&resp.text) {
                Some(options) => return options,
                None => tracing::warn!(kind = kind.as_str(), "clarifier reply unusable, using template options"),
            },
            Err(e) => tracing::warn!(kind = kind.as_str(), error = %e, "clarifier call failed, using template options"),
        }
        fallback_options(kind)
    }
}

fn parse_options(text: &str) -> Option<Vec<ClarificationOption>> {
    let mut candidates: Vec<&str> = extract_fenced(text, true);
    candidates.extend(extract_balanced(text, '[', ']'));
    candidates.into_iter().find_map(|c| {
        let options: Vec<ClarificationOption> = serde_json::from_str(c.trim()).ok()?;
        let valid = options.len() == OPTION_COUNT
            && options
                .iter()
                .all(|o| !o.label.trim().is_empty() && !o.value.trim().is_empty());
        valid.then_some(options)
    })
}

/// 模板选项：恰好一个 recommended
pub fn fallback_options(kind: &ClarificationKind) -> Vec<ClarificationOption> {
    match kind {
        ClarificationKind::General => vec![
            ClarificationOption::new("Go ahead with your best judgement", "Proceed with your best judgement.", true),
            ClarificationOption::new("I'll add more detail", "Let me describe the request in more detail.", false),
            ClarificationOption::new("Cancel", "Cancel this request.", false),
        ],
        ClarificationKind::FileExists { path } => vec![
            ClarificationOption::new("Save under a new name", format!("Save it next to {} under a new file name.", path), true),
            ClarificationOption::new("Overwrite", format!("Overwrite {}.", path), false),
            ClarificationOption::new("Don't save", "Don't save a file, just answer in chat.", false),
        ],
        ClarificationKind::InvalidPersistPath { path, .. } => {
            let suggested = suggest_output_path(path);
            vec![
                ClarificationOption::new(format!("Save to {}", suggested), format!("Save it to {}.", suggested), true),
                ClarificationOption::new("Choose another path", "I'll give you another path under output/.", false),
                ClarificationOption::new("Don't save", "Don't save a file, just answer in chat.", false),
            ]
        }
    }
}

/// 取原路径的文件名，换成 output/ 下的 .md
fn suggest_output_path(path: &str) -> String {
    let file = path
        .replace('\\', "/")
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("result")
        .to_string();
    let stem = file.split('.').next().filter(|s| !s.is_empty()).unwrap_or("result");
    format!("output/{}.md", stem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockModelService};

    fn generator(mock: MockModelService) -> ClarificationGenerator {
        ClarificationGenerator::new(Arc::new(mock), RuntimeConfig::new("mock", "clarifier"))
    }

    #[tokio::test]
    async fn test_uses_model_options_when_valid() {
        let reply = r#"Here you go:
```json
[{"label":"A","value":"a","recommended":true},{"label":"B","value":"b"},{"label":"C","value":"c"}]
```"#;
        let g = generator(MockModelService::scripted([reply]));
        let opts = g
            .generate_options(&ClarificationKind::General, "Which?", "do it", &CancellationToken::new())
            .await;
        assert_eq!(opts.len(), 3);
        assert_eq!(opts[0].label, "A");
        assert_eq!(opts[0].recommended, Some(true));
    }

    #[tokio::test]
    async fn test_wrong_count_falls_back() {
        let g = generator(MockModelService::scripted([r#"[{"label":"A","value":"a"}]"#]));
        let kind = ClarificationKind::FileExists {
            path: "/mnt/workspace/output/r.md".into(),
        };
        let opts = g.generate_options(&kind, "Exists", "save", &CancellationToken::new()).await;
        assert_eq!(opts, fallback_options(&kind));
    }

    #[tokio::test]
    async fn test_model_error_falls_back() {
        let g = generator(MockModelService::default().then_fail(LlmError::Provider("down".into())));
        let opts = g
            .generate_options(&ClarificationKind::General, "?", "x", &CancellationToken::new())
            .await;
        assert_eq!(opts.len(), 3);
    }

    #[test]
    fn test_fallback_has_exactly_one_recommended() {
        let kinds = [
            ClarificationKind::General,
            ClarificationKind::FileExists { path: "a.md".into() },
            ClarificationKind::InvalidPersistPath {
                path: "/etc/passwd".into(),
                reason: "PATH_NOT_ALLOWED".into(),
            },
        ];
        for kind in kinds {
            let opts = fallback_options(&kind);
            assert_eq!(opts.len(), 3);
            assert_eq!(opts.iter().filter(|o| o.recommended == Some(true)).count(), 1);
        }
    }

    #[test]
    fn test_suggested_path() {
        let opts = fallback_options(&ClarificationKind::InvalidPersistPath {
            path: "/etc/passwd".into(),
            reason: "x".into(),
        });
        assert_eq!(opts[0].label, "Save to output/passwd.md");
    }
}
