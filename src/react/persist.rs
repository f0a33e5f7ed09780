//! 落盘策略：判断请求是否要求把结果写成文件，并约束写入目标
//!
//! 目标只能位于 `<virtualRoot>/output/` 之下，扩展名限定为 md/txt/json/yaml/yml/csv，内容不超过 1 MiB。

use std::sync::OnceLock;

use chrono::{DateTime, Local};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::sandbox::{is_within_virtual, normalize_posix};

pub const OUTPUT_DIR: &str = "output";
pub const ALLOWED_EXTENSIONS: &[&str] = &["md", "txt", "json", "yaml", "yml", "csv"];
pub const MAX_PERSIST_BYTES: usize = 1024 * 1024;

/// 在消息中识别「像路径」的词时认可的扩展名（比允许写入的集合宽）
const PATH_LIKE_EXTENSIONS: &[&str] = &[
    "md", "txt", "json", "yaml", "yml", "csv", "rs", "py", "js", "ts", "toml", "html", "xml", "log",
    "sh", "pdf", "docx",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistReason {
    None,
    ExplicitSave,
    MarkdownGeneration,
}

/// 落盘需求
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistRequirement {
    pub required: bool,
    pub reason: PersistReason,
    pub requested_path: Option<String>,
}

impl PersistRequirement {
    pub fn not_required() -> Self {
        Self {
            required: false,
            reason: PersistReason::None,
            requested_path: None,
        }
    }
}

/// 可替换的落盘判定策略
pub trait PersistPolicy: Send + Sync {
    fn classify(&self, message: &str) -> PersistRequirement;
}

/// 默认策略：保存类关键词 + 路径/文档引用，或「生成 Markdown」意图且无阅读意图
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicPersistPolicy;

static SAVE_RE: OnceLock<Option<Regex>> = OnceLock::new();
static DOC_RE: OnceLock<Option<Regex>> = OnceLock::new();
static MARKDOWN_RE: OnceLock<Option<Regex>> = OnceLock::new();
static READ_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn pattern_hit(cell: &'static OnceLock<Option<Regex>>, pattern: &str, text: &str) -> bool {
    cell.get_or_init(|| Regex::new(pattern).ok())
        .as_ref()
        .is_some_and(|re| re.is_match(text))
}

fn save_position(text: &str) -> Option<usize> {
    SAVE_RE
        .get_or_init(|| Regex::new(SAVE_PATTERN).ok())
        .as_ref()?
        .find(text)
        .map(|m| m.start())
}

const SAVE_PATTERN: &str = r"(?i)\b(save|saving|write|persist|export|store)\b|保存|写入|导出|存到|存为";
const DOC_PATTERN: &str = r"(?i)\b(file|document|doc|report|markdown|readme)s?\b|文件|文档|报告";
const MARKDOWN_PATTERN: &str = r"(?i)\b(generate|create|draft|produce|compose|prepare)\b.*\b(markdown|report|document|readme|write-?up)\b|生成.*(文档|报告|markdown)";
const READ_PATTERN: &str = r"(?i)\b(read|open|show|explain|summari[sz]e|look at|what does)\b|读取|查看|解释|总结";

impl PersistPolicy for HeuristicPersistPolicy {
    fn classify(&self, message: &str) -> PersistRequirement {
        let paths = extract_path_candidates(message);
        let has_save = pattern_hit(&SAVE_RE, SAVE_PATTERN, message);
        let has_doc_ref = !paths.is_empty() || pattern_hit(&DOC_RE, DOC_PATTERN, message);

        if has_save && has_doc_ref {
            return PersistRequirement {
                required: true,
                reason: PersistReason::ExplicitSave,
                requested_path: pick_requested_path(message, &paths),
            };
        }

        let markdown_intent = pattern_hit(&MARKDOWN_RE, MARKDOWN_PATTERN, message);
        let read_intent = pattern_hit(&READ_RE, READ_PATTERN, message);
        if markdown_intent && !read_intent {
            return PersistRequirement {
                required: true,
                reason: PersistReason::MarkdownGeneration,
                requested_path: None,
            };
        }
        PersistRequirement::not_required()
    }
}

/// 取保存关键词之后的第一个候选；关键词之前的只有已在 output/ 下的才算（其余多半是要读的源文件）
fn pick_requested_path(message: &str, paths: &[(usize, String)]) -> Option<String> {
    let pos = save_position(message).unwrap_or(0);
    if let Some((_, p)) = paths.iter().find(|(offset, _)| *offset > pos) {
        return Some(p.clone());
    }
    paths
        .iter()
        .rev()
        .find(|(_, p)| names_output_dir(p))
        .map(|(_, p)| p.clone())
}

fn names_output_dir(path: &str) -> bool {
    let unified = path.replace('\\', "/");
    let trimmed = unified.trim_start_matches("./");
    trimmed.starts_with(&format!("{}/", OUTPUT_DIR)) || trimmed.contains(&format!("/{}/", OUTPUT_DIR))
}

const TOKEN_PUNCT: &str = "'\"`()[]{}<>,;:!?，。：；！？“”‘’（）";

/// 提取消息中像路径的词：按空白切分、去掉两侧标点、跳过 URL
pub fn extract_path_candidates(message: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut offset = 0;
    for raw in message.split_whitespace() {
        let start = message[offset..].find(raw).map(|i| i + offset).unwrap_or(offset);
        offset = start + raw.len();

        let token = raw
            .trim_start_matches(|c: char| TOKEN_PUNCT.contains(c))
            .trim_end_matches(|c: char| TOKEN_PUNCT.contains(c) || c == '.');
        if token.is_empty() || token.contains("://") {
            continue;
        }
        if looks_like_path(token) {
            out.push((start, token.to_string()));
        }
    }
    out
}

fn looks_like_path(token: &str) -> bool {
    if token.starts_with('/') && token.len() > 1 || token.starts_with("./") || token.starts_with("~/") {
        return true;
    }
    extension_of(token).is_some_and(|ext| PATH_LIKE_EXTENSIONS.contains(&ext.as_str()))
}

fn extension_of(path: &str) -> Option<String> {
    let file = path.rsplit('/').next()?;
    let (stem, ext) = file.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 5 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PersistPathCode {
    PathNotAllowed,
    ExtensionNotAllowed,
    InvalidPath,
    FileTooLarge,
}

impl PersistPathCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PersistPathCode::PathNotAllowed => "PATH_NOT_ALLOWED",
            PersistPathCode::ExtensionNotAllowed => "EXTENSION_NOT_ALLOWED",
            PersistPathCode::InvalidPath => "INVALID_PATH",
            PersistPathCode::FileTooLarge => "FILE_TOO_LARGE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}: {message}", code.as_str())]
pub struct PersistPathError {
    pub code: PersistPathCode,
    pub message: String,
}

impl PersistPathError {
    fn new(code: PersistPathCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// 请求路径的解析结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistPathResolution {
    pub ok: bool,
    pub requested_path: Option<String>,
    pub virtual_path: Option<String>,
    pub explicit: bool,
    pub code: Option<PersistPathCode>,
    pub message: Option<String>,
}

/// 解析用户显式给出的落盘路径；None 表示未指定（由调用方生成默认路径）
pub fn resolve_persist_path(requested: Option<&str>, virtual_root: &str) -> PersistPathResolution {
    let Some(requested) = requested else {
        return PersistPathResolution {
            ok: true,
            requested_path: None,
            virtual_path: None,
            explicit: false,
            code: None,
            message: None,
        };
    };
    match check_output_path(virtual_root, requested) {
        Ok(virtual_path) => PersistPathResolution {
            ok: true,
            requested_path: Some(requested.to_string()),
            virtual_path: Some(virtual_path),
            explicit: true,
            code: None,
            message: None,
        },
        Err(e) => PersistPathResolution {
            ok: false,
            requested_path: Some(requested.to_string()),
            virtual_path: None,
            explicit: true,
            code: Some(e.code),
            message: Some(e.message),
        },
    }
}

/// 校验 write_file 目标与内容大小，返回规范化后的虚拟路径
pub fn check_output_target(virtual_root: &str, path: &str, content_len: usize) -> Result<String, PersistPathError> {
    let virtual_path = check_output_path(virtual_root, path)?;
    if content_len > MAX_PERSIST_BYTES {
        return Err(PersistPathError::new(
            PersistPathCode::FileTooLarge,
            format!("content is {} bytes (max {})", content_len, MAX_PERSIST_BYTES),
        ));
    }
    Ok(virtual_path)
}

fn check_output_path(virtual_root: &str, path: &str) -> Result<String, PersistPathError> {
    let path = path.trim().replace('\\', "/");
    if path.is_empty() || path.contains('\0') {
        return Err(PersistPathError::new(PersistPathCode::InvalidPath, "empty or malformed path"));
    }
    if path.starts_with('~') || path.split('/').any(|seg| seg == "..") {
        return Err(PersistPathError::new(
            PersistPathCode::PathNotAllowed,
            format!("{} is outside {}/{}", path, virtual_root, OUTPUT_DIR),
        ));
    }

    let root = normalize_posix(virtual_root);
    let joined = if path.starts_with('/') {
        normalize_posix(&path)
    } else {
        normalize_posix(&format!("{}/{}", root, path))
    };
    let output_root = normalize_posix(&format!("{}/{}", root, OUTPUT_DIR));
    if joined == output_root || !is_within_virtual(&output_root, &joined) {
        return Err(PersistPathError::new(
            PersistPathCode::PathNotAllowed,
            format!("{} is outside {}", joined, output_root),
        ));
    }

    match extension_of(&joined) {
        Some(ext) if ALLOWED_EXTENSIONS.contains(&ext.as_str()) => Ok(joined),
        _ => Err(PersistPathError::new(
            PersistPathCode::ExtensionNotAllowed,
            format!("extension must be one of {}", ALLOWED_EXTENSIONS.join(", ")),
        )),
    }
}

/// 默认落盘路径：`<root>/output/<slug>-<YYYYmmdd-HHMMSS>.md`
pub fn default_output_path(virtual_root: &str, hint: &str, now: DateTime<Local>) -> String {
    let slug = slugify(hint);
    format!(
        "{}/{}/{}-{}.md",
        normalize_posix(virtual_root).trim_end_matches('/'),
        OUTPUT_DIR,
        slug,
        now.format("%Y%m%d-%H%M%S")
    )
}

fn slugify(hint: &str) -> String {
    let words: Vec<String> = hint
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .take(6)
        .map(|w| w.to_ascii_lowercase())
        .collect();
    let mut slug = words.join("-");
    slug.truncate(40);
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "answer".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const ROOT: &str = "/mnt/workspace";

    #[test]
    fn test_explicit_save_with_path() {
        let req = HeuristicPersistPolicy.classify("please generate a report and save it to output/report.md");
        assert!(req.required);
        assert_eq!(req.reason, PersistReason::ExplicitSave);
        assert_eq!(req.requested_path.as_deref(), Some("output/report.md"));

        let res = resolve_persist_path(req.requested_path.as_deref(), ROOT);
        assert!(res.ok);
        assert!(res.explicit);
        assert_eq!(res.virtual_path.as_deref(), Some("/mnt/workspace/output/report.md"));
    }

    #[test]
    fn test_save_path_after_keyword_wins() {
        let req = HeuristicPersistPolicy.classify("summarize notes.txt and save the result to output/summary.md");
        assert_eq!(req.requested_path.as_deref(), Some("output/summary.md"));
    }

    #[test]
    fn test_source_file_before_keyword_is_not_the_target() {
        let req = HeuristicPersistPolicy.classify("summarize src/main.rs and save it as a report");
        assert!(req.required);
        assert_eq!(req.reason, PersistReason::ExplicitSave);
        assert_eq!(req.requested_path, None);

        let req = HeuristicPersistPolicy.classify("output/notes.md: please save the meeting notes there");
        assert_eq!(req.requested_path.as_deref(), Some("output/notes.md"));
    }

    #[test]
    fn test_markdown_generation_without_read_intent() {
        let req = HeuristicPersistPolicy.classify("Generate a markdown report about the release plan");
        assert!(req.required);
        assert_eq!(req.reason, PersistReason::MarkdownGeneration);
        assert_eq!(req.requested_path, None);

        let req = HeuristicPersistPolicy.classify("read the design document and explain it");
        assert!(!req.required);
    }

    #[test]
    fn test_plain_question_not_required() {
        let req = HeuristicPersistPolicy.classify("what is a borrow checker?");
        assert_eq!(req, PersistRequirement::not_required());
    }

    #[test]
    fn test_urls_are_not_paths() {
        let paths = extract_path_candidates("see https://example.com/a.md and (./notes.txt).");
        let names: Vec<&str> = paths.iter().map(|(_, p)| p.as_str()).collect();
        assert_eq!(names, vec!["./notes.txt"]);
    }

    #[test]
    fn test_rejects_paths_outside_output() {
        let res = resolve_persist_path(Some("/etc/passwd"), ROOT);
        assert!(!res.ok);
        assert_eq!(res.code, Some(PersistPathCode::PathNotAllowed));

        let res = resolve_persist_path(Some("output/../secret.md"), ROOT);
        assert_eq!(res.code, Some(PersistPathCode::PathNotAllowed));

        let res = resolve_persist_path(Some("notes.md"), ROOT);
        assert_eq!(res.code, Some(PersistPathCode::PathNotAllowed));

        let res = resolve_persist_path(Some("output/run.sh"), ROOT);
        assert_eq!(res.code, Some(PersistPathCode::ExtensionNotAllowed));
    }

    #[test]
    fn test_absolute_virtual_output_path_accepted() {
        let res = resolve_persist_path(Some("/mnt/workspace/output/data.CSV"), ROOT);
        assert!(res.ok);
        assert_eq!(res.virtual_path.as_deref(), Some("/mnt/workspace/output/data.CSV"));
    }

    #[test]
    fn test_size_limit() {
        let err = check_output_target(ROOT, "output/a.md", MAX_PERSIST_BYTES + 1).unwrap_err();
        assert_eq!(err.code, PersistPathCode::FileTooLarge);
        assert!(check_output_target(ROOT, "output/a.md", 10).is_ok());
    }

    #[test]
    fn test_default_output_path() {
        let now = Local.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        let p = default_output_path(ROOT, "Generate a Markdown report!", now);
        assert_eq!(p, "/mnt/workspace/output/generate-a-markdown-report-20240305-140709.md");
        let p = default_output_path(ROOT, "生成文档", now);
        assert_eq!(p, "/mnt/workspace/output/answer-20240305-140709.md");
    }
}
