//! 沙箱路径守卫
//!
//! 两套坐标：模型只看得到虚拟路径（默认以 /mnt/workspace 开头），真实路径由规范化后的工作区根推导。
//! 每次检查都对真实路径做 canonicalize，同时挡住 `..` 穿越与符号链接逃逸；
//! 写模式沿父目录向上找到最近的已存在祖先再校验，使尚未创建的文件也能写入。

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::sandbox::{SandboxError, SandboxErrorCode};

/// 默认虚拟根
pub const DEFAULT_VIRTUAL_ROOT: &str = "/mnt/workspace";

/// 访问模式：write 不要求目标存在；其余模式要求目标存在
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Read,
    List,
    Cwd,
    Write,
}

/// 经守卫校验后的路径：只能由 PathGuard::resolve 构造
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxResolvedPath {
    virtual_path: String,
    real_path: PathBuf,
}

impl SandboxResolvedPath {
    pub fn virtual_path(&self) -> &str {
        &self.virtual_path
    }

    pub fn real_path(&self) -> &Path {
        &self.real_path
    }
}

/// 路径守卫：虚拟根 + 规范化工作区根 + 允许访问的真实根列表
#[derive(Debug, Clone)]
pub struct PathGuard {
    virtual_root: String,
    workspace_root: PathBuf,
    allowed_roots: Vec<PathBuf>,
}

impl PathGuard {
    /// 允许根只有工作区本身
    pub fn new(virtual_root: &str, workspace_root: impl AsRef<Path>) -> Result<Self, SandboxError> {
        Self::with_allowed_roots(virtual_root, workspace_root, Vec::<PathBuf>::new())
    }

    /// 额外指定允许根；为空时退化为只允许工作区根
    pub fn with_allowed_roots<I, P>(
        virtual_root: &str,
        workspace_root: impl AsRef<Path>,
        allowed_roots: I,
    ) -> Result<Self, SandboxError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let virtual_root = normalize_virtual_root(virtual_root)?;
        let workspace_root = canonical_dir(workspace_root.as_ref())?;
        let mut roots = Vec::new();
        for root in allowed_roots {
            roots.push(canonical_dir(root.as_ref())?);
        }
        if roots.is_empty() {
            roots.push(workspace_root.clone());
        }
        Ok(Self {
            virtual_root,
            workspace_root,
            allowed_roots: roots,
        })
    }

    pub fn virtual_root(&self) -> &str {
        &self.virtual_root
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn allowed_roots(&self) -> &[PathBuf] {
        &self.allowed_roots
    }

    /// 第一步：规范化为虚拟路径并校验仍在虚拟根内（不访问文件系统）
    pub fn to_virtual_path(&self, input: &str) -> Result<String, SandboxError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(SandboxError::invalid_path("path must be a non-empty string"));
        }
        if trimmed.contains('\0') {
            return Err(SandboxError::invalid_path("path contains a NUL byte"));
        }
        let unified = trimmed.replace('\\', "/");
        if unified.split('/').any(|seg| seg == "..") {
            return Err(SandboxError::outside_virtual_root(format!(
                "parent traversal is not allowed: {}",
                input
            )));
        }
        if has_drive_prefix(&unified) {
            return Err(SandboxError::outside_virtual_root(format!(
                "host paths are not addressable: {}",
                input
            )));
        }
        let absolute = if unified.starts_with('/') {
            unified
        } else {
            format!("{}/{}", self.virtual_root, unified)
        };
        let normalized = normalize_posix(&absolute);
        if !is_within_virtual(&self.virtual_root, &normalized) {
            return Err(SandboxError::outside_virtual_root(format!(
                "{} is outside {}",
                normalized, self.virtual_root
            )));
        }
        Ok(normalized)
    }

    /// 把输入路径解析为 SandboxResolvedPath。
    ///
    /// workspace_override 为本次调用的真实工作区根（例如会话级工作目录），同样会被 canonicalize，
    /// 并且解析结果仍必须落在 allowed_roots 之内。
    pub fn resolve(
        &self,
        input: &str,
        mode: AccessMode,
        workspace_override: Option<&Path>,
    ) -> Result<SandboxResolvedPath, SandboxError> {
        let virtual_path = self.to_virtual_path(input)?;
        let base = match workspace_override {
            Some(root) => canonical_dir(root)?,
            None => self.workspace_root.clone(),
        };
        let offset = virtual_path
            .strip_prefix(self.virtual_root.as_str())
            .unwrap_or("");
        let candidate = offset
            .split('/')
            .filter(|seg| !seg.is_empty())
            .fold(base, |acc, seg| acc.join(seg));

        let real_path = match mode {
            AccessMode::Write => self.authorize_write(&candidate, &virtual_path)?,
            AccessMode::Read | AccessMode::List | AccessMode::Cwd => {
                self.authorize_existing(&candidate, &virtual_path)?
            }
        };
        tracing::debug!(virtual_path = %virtual_path, real_path = %real_path.display(), ?mode, "sandbox path resolved");
        Ok(SandboxResolvedPath {
            virtual_path,
            real_path,
        })
    }

    /// 真实路径 -> 虚拟路径（仅用于展示，real 必须位于 base 之下）
    pub fn virtual_child(&self, parent: &SandboxResolvedPath, real: &Path) -> Option<String> {
        let rel = real.strip_prefix(&parent.real_path).ok()?;
        let mut out = parent.virtual_path.clone();
        for comp in rel.components() {
            out.push('/');
            out.push_str(&comp.as_os_str().to_string_lossy());
        }
        Some(out)
    }

    fn authorize_existing(&self, candidate: &Path, virtual_path: &str) -> Result<PathBuf, SandboxError> {
        let canonical = std::fs::canonicalize(candidate).map_err(|_| {
            SandboxError::invalid_path(format!("path does not exist: {}", virtual_path))
        })?;
        self.ensure_allowed(&canonical, virtual_path)?;
        Ok(canonical)
    }

    fn authorize_write(&self, candidate: &Path, virtual_path: &str) -> Result<PathBuf, SandboxError> {
        if let Ok(meta) = std::fs::symlink_metadata(candidate) {
            if meta.file_type().is_symlink() {
                return Err(SandboxError::outside_workspace(format!(
                    "refusing to write through a symbolic link: {}",
                    virtual_path
                )));
            }
        }

        // 向上找最近的已存在祖先；悬空的符号链接也算「存在」，随后 canonicalize 会失败
        let mut ancestor = candidate;
        let mut tail: Vec<OsString> = Vec::new();
        while std::fs::symlink_metadata(ancestor).is_err() {
            let name = ancestor.file_name().ok_or_else(|| {
                SandboxError::invalid_path(format!("no existing ancestor for {}", virtual_path))
            })?;
            tail.push(name.to_os_string());
            ancestor = ancestor.parent().ok_or_else(|| {
                SandboxError::invalid_path(format!("no existing ancestor for {}", virtual_path))
            })?;
        }
        let canonical = std::fs::canonicalize(ancestor).map_err(|_| {
            SandboxError::invalid_path(format!("cannot resolve parent of {}", virtual_path))
        })?;
        self.ensure_allowed(&canonical, virtual_path)?;
        Ok(tail.iter().rev().fold(canonical, |acc, name| acc.join(name)))
    }

    fn ensure_allowed(&self, canonical: &Path, virtual_path: &str) -> Result<(), SandboxError> {
        if self.allowed_roots.iter().any(|root| canonical.starts_with(root)) {
            Ok(())
        } else {
            Err(SandboxError::new(
                SandboxErrorCode::PathOutsideWorkspace,
                format!("{} resolves outside the allowed workspace roots", virtual_path),
            ))
        }
    }
}

/// posix 规范化：合并重复分隔符，去掉 `.`，按词法处理 `..`（不会越过根）
pub fn normalize_posix(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// virtual 是否等于 root 或位于 root 之下
pub fn is_within_virtual(root: &str, virtual_path: &str) -> bool {
    root == "/"
        || virtual_path == root
        || virtual_path
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn normalize_virtual_root(root: &str) -> Result<String, SandboxError> {
    let unified = root.trim().replace('\\', "/");
    if !unified.starts_with('/') {
        return Err(SandboxError::invalid_path(format!(
            "virtual root must be absolute: {}",
            root
        )));
    }
    Ok(normalize_posix(&unified))
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn canonical_dir(path: &Path) -> Result<PathBuf, SandboxError> {
    let canonical = std::fs::canonicalize(path).map_err(|e| {
        SandboxError::invalid_path(format!("workspace root {} is not accessible: {}", path.display(), e))
    })?;
    if !canonical.is_dir() {
        return Err(SandboxError::invalid_path(format!(
            "workspace root {} is not a directory",
            path.display()
        )));
    }
    Ok(canonical)
}
