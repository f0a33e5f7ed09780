//! 沙箱服务：list_dir / read_file / write_file / exec
//!
//! 所有操作只接受虚拟路径，内部一律先经 PathGuard::resolve 得到 SandboxResolvedPath 再访问文件系统。
//! exec 沿用白名单 + 禁用子串的做法，并把工作目录也纳入路径守卫。

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use walkdir::WalkDir;

use crate::sandbox::{is_within_virtual, AccessMode, PathGuard, SandboxError, SandboxErrorCode};

/// 禁止的命令/子串（即使白名单中有同名，也不允许带这些参数）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:",
];

/// list_dir 最大递归深度
const MAX_LIST_DEPTH: usize = 5;
/// list_dir 最多返回条目数
const MAX_LIST_ENTRIES: usize = 500;
/// exec 输出保留的最大字符数
const MAX_EXEC_OUTPUT_CHARS: usize = 16_000;

/// 沙箱服务的运行参数
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub max_read_bytes: u64,
    pub exec_timeout: Duration,
    pub allowed_commands: HashSet<String>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            max_read_bytes: 1024 * 1024,
            exec_timeout: Duration::from_secs(30),
            allowed_commands: [
                "ls", "grep", "cat", "head", "tail", "wc", "find", "echo", "pwd", "cargo", "rustc", "git",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

/// 写入选项
#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    pub create_dirs: bool,
    pub overwrite: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            create_dirs: true,
            overwrite: false,
        }
    }
}

/// 目录条目（虚拟路径，目录以 `/` 结尾）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub path: String,
    pub is_dir: bool,
}

/// 写入结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    pub path: String,
    pub bytes: usize,
    pub overwritten: bool,
}

/// 命令执行结果；非零退出码不算沙箱错误，由调用方决定如何呈现
#[derive(Debug, Clone, Serialize)]
pub struct ExecOutcome {
    pub command: String,
    pub cwd: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// 沙箱服务：PathGuard + 运行参数
#[derive(Debug, Clone)]
pub struct SandboxService {
    guard: PathGuard,
    settings: SandboxSettings,
}

impl SandboxService {
    pub fn new(guard: PathGuard, settings: SandboxSettings) -> Self {
        let allowed_commands = settings
            .allowed_commands
            .iter()
            .map(|s| s.to_lowercase())
            .collect();
        Self {
            guard,
            settings: SandboxSettings {
                allowed_commands,
                ..settings
            },
        }
    }

    pub fn guard(&self) -> &PathGuard {
        &self.guard
    }

    pub fn virtual_root(&self) -> &str {
        self.guard.virtual_root()
    }

    /// 列目录（跳过隐藏项，不跟随符号链接），depth 取值 1..=5
    pub async fn list_dir(
        &self,
        path: &str,
        depth: usize,
        workspace_override: Option<&Path>,
    ) -> Result<Vec<DirEntry>, SandboxError> {
        let resolved = self.guard.resolve(path, AccessMode::List, workspace_override)?;
        if !resolved.real_path().is_dir() {
            return Err(SandboxError::invalid_path(format!(
                "not a directory: {}",
                resolved.virtual_path()
            )));
        }
        let guard = self.guard.clone();
        let depth = depth.clamp(1, MAX_LIST_DEPTH);
        tokio::task::spawn_blocking(move || {
            let mut entries = Vec::new();
            let walker = WalkDir::new(resolved.real_path())
                .min_depth(1)
                .max_depth(depth)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.'));
            for entry in walker {
                let entry = entry.map_err(|e| {
                    SandboxError::new(SandboxErrorCode::Io, format!("list failed: {}", e))
                })?;
                if let Some(mut virtual_path) = guard.virtual_child(&resolved, entry.path()) {
                    let is_dir = entry.file_type().is_dir();
                    if is_dir {
                        virtual_path.push('/');
                    }
                    entries.push(DirEntry {
                        path: virtual_path,
                        is_dir,
                    });
                }
                if entries.len() >= MAX_LIST_ENTRIES {
                    break;
                }
            }
            Ok(entries)
        })
        .await
        .map_err(|e| SandboxError::new(SandboxErrorCode::Io, format!("list task failed: {}", e)))?
    }

    /// 读取文本文件（超过 max_read_bytes 拒绝；非 UTF-8 字节做有损转换）
    pub async fn read_file(
        &self,
        path: &str,
        workspace_override: Option<&Path>,
    ) -> Result<String, SandboxError> {
        let resolved = self.guard.resolve(path, AccessMode::Read, workspace_override)?;
        let meta = tokio::fs::metadata(resolved.real_path())
            .await
            .map_err(|e| SandboxError::io("stat failed", e))?;
        if meta.is_dir() {
            return Err(SandboxError::invalid_path(format!(
                "is a directory: {}",
                resolved.virtual_path()
            )));
        }
        if meta.len() > self.settings.max_read_bytes {
            return Err(SandboxError::new(
                SandboxErrorCode::FileTooLarge,
                format!(
                    "{} is {} bytes (max {})",
                    resolved.virtual_path(),
                    meta.len(),
                    self.settings.max_read_bytes
                ),
            ));
        }
        let bytes = tokio::fs::read(resolved.real_path())
            .await
            .map_err(|e| SandboxError::io("read failed", e))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// 写文件；目标已存在且 overwrite=false 时返回 FILE_EXISTS（create_new 语义，不存在检查-写入竞态）
    pub async fn write_file(
        &self,
        path: &str,
        content: &str,
        options: WriteOptions,
        workspace_override: Option<&Path>,
    ) -> Result<WriteOutcome, SandboxError> {
        let resolved = self.guard.resolve(path, AccessMode::Write, workspace_override)?;
        let real = resolved.real_path();
        if let Some(parent) = real.parent() {
            if options.create_dirs {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| SandboxError::io("create parent directory failed", e))?;
            } else if !parent.is_dir() {
                return Err(SandboxError::invalid_path(format!(
                    "parent directory does not exist for {}",
                    resolved.virtual_path()
                )));
            }
        }

        let existed = tokio::fs::symlink_metadata(real).await.is_ok();
        if existed && real.is_dir() {
            return Err(SandboxError::invalid_path(format!(
                "is a directory: {}",
                resolved.virtual_path()
            )));
        }
        let mut open = tokio::fs::OpenOptions::new();
        open.write(true);
        if options.overwrite {
            open.create(true).truncate(true);
        } else {
            open.create_new(true);
        }
        let mut file = open.open(real).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                SandboxError::new(
                    SandboxErrorCode::FileExists,
                    format!(
                        "{} already exists; pass overwrite=true to replace it",
                        resolved.virtual_path()
                    ),
                )
            } else {
                SandboxError::io("open for write failed", e)
            }
        })?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| SandboxError::io("write failed", e))?;
        file.flush()
            .await
            .map_err(|e| SandboxError::io("flush failed", e))?;

        tracing::info!(path = %resolved.virtual_path(), bytes = content.len(), overwritten = existed, "sandbox write");
        Ok(WriteOutcome {
            path: resolved.virtual_path().to_string(),
            bytes: content.len(),
            overwritten: existed,
        })
    }

    /// 在沙箱工作目录中执行白名单命令
    pub async fn exec(
        &self,
        command: &str,
        cwd: Option<&str>,
        workspace_override: Option<&Path>,
    ) -> Result<ExecOutcome, SandboxError> {
        let command = command.trim();
        self.check_command(command)?;
        self.check_command_paths(command)?;
        let cwd_path = cwd.unwrap_or(".");
        let resolved = self.guard.resolve(cwd_path, AccessMode::Cwd, workspace_override)?;
        if !resolved.real_path().is_dir() {
            return Err(SandboxError::invalid_path(format!(
                "cwd is not a directory: {}",
                resolved.virtual_path()
            )));
        }

        tracing::info!(command = %command, cwd = %resolved.virtual_path(), "sandbox exec");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.current_dir(resolved.real_path()).kill_on_drop(true);

        let output = tokio::time::timeout(self.settings.exec_timeout, cmd.output())
            .await
            .map_err(|_| {
                SandboxError::new(
                    SandboxErrorCode::CommandTimeout,
                    format!("command timed out after {:?}", self.settings.exec_timeout),
                )
            })?
            .map_err(|e| SandboxError::io("spawn failed", e))?;

        Ok(ExecOutcome {
            command: command.to_string(),
            cwd: resolved.virtual_path().to_string(),
            exit_code: output.status.code(),
            stdout: truncate_chars(&String::from_utf8_lossy(&output.stdout), MAX_EXEC_OUTPUT_CHARS),
            stderr: truncate_chars(&String::from_utf8_lossy(&output.stderr), MAX_EXEC_OUTPUT_CHARS),
        })
    }

    fn check_command(&self, raw: &str) -> Result<(), SandboxError> {
        let lower = raw.to_lowercase();
        for forbidden in FORBIDDEN_SUBSTR {
            if lower.contains(forbidden) {
                return Err(SandboxError::new(
                    SandboxErrorCode::CommandNotAllowed,
                    format!("forbidden pattern: {}", forbidden),
                ));
            }
        }
        let name = lower.split_whitespace().next().unwrap_or("");
        if name.is_empty() {
            return Err(SandboxError::new(SandboxErrorCode::CommandNotAllowed, "empty command"));
        }
        if self.settings.allowed_commands.contains(name) {
            Ok(())
        } else {
            Err(SandboxError::new(
                SandboxErrorCode::CommandNotAllowed,
                format!("command '{}' not in allowlist", name),
            ))
        }
    }

    /// 参数里的路径也必须留在工作区内：拒绝 `..` 与 `~`，绝对路径需落在允许根之下（虚拟根下的路径放行）
    fn check_command_paths(&self, raw: &str) -> Result<(), SandboxError> {
        for word in raw.split_whitespace() {
            let word = word.trim_matches(|c| matches!(c, '"' | '\'' | '`' | ',' | '(' | ')' | '[' | ']' | '<' | '>' | ';' | '|' | '&'));
            // --file=/etc/passwd 之类取等号右侧
            let token = match word.split_once('=') {
                Some((flag, value)) if flag.starts_with('-') => value,
                _ => word,
            };
            if token.is_empty() || token.starts_with('-') {
                continue;
            }
            let unified = token.replace('\\', "/");
            if unified.split('/').any(|seg| seg == "..") {
                return Err(SandboxError::outside_workspace(format!(
                    "parent traversal in command argument: {}",
                    token
                )));
            }
            if unified.starts_with('~') {
                return Err(SandboxError::outside_workspace(format!(
                    "home directory reference in command argument: {}",
                    token
                )));
            }
            let candidate = Path::new(&unified);
            let root = self.guard.virtual_root();
            if !candidate.is_absolute() || (root != "/" && is_within_virtual(root, &unified)) {
                continue;
            }
            let real = std::fs::canonicalize(candidate).unwrap_or_else(|_| candidate.to_path_buf());
            if !self.guard.allowed_roots().iter().any(|root| real.starts_with(root)) {
                return Err(SandboxError::outside_workspace(format!(
                    "command argument points outside the workspace: {}",
                    token
                )));
            }
        }
        Ok(())
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}...", s.chars().take(max).collect::<String>())
    } else {
        s.to_string()
    }
}
