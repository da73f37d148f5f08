//! Tool calls and the tool surface agents act through.
//!
//! Agents ask for tools by emitting a JSON object in their reply:
//!
//! ```json
//! {"tool": "read_file", "arguments": {"path": "src/lib.rs"}}
//! ```
//!
//! `{"name": ..., "parameters": ...}` is accepted as well. Tool failures are
//! returned to the model as text; they never end the run.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;

use super::error::ToolError;
use crate::utils::json_extraction::extract_json_objects;

/// Maximum file size read or searched (1MB).
const MAX_FILE_SIZE: u64 = 1_048_576;
/// Maximum entries returned by `list_files`.
const MAX_LIST_ENTRIES: usize = 500;
/// Maximum matches returned by `search`.
const MAX_SEARCH_RESULTS: usize = 100;
/// Directories never listed or searched.
const SKIPPED_DIRS: &[&str] = &[".git", "target", "node_modules"];

/// A tool call extracted from model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }

    fn str_arg(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(Value::as_str)
    }

    fn required(&self, key: &str) -> Result<&str, ToolError> {
        self.str_arg(key).ok_or_else(|| {
            ToolError::InvalidParameters(format!("'{}' requires a string '{}'", self.name, key))
        })
    }
}

/// First tool call in `response`, if any.
pub fn parse_tool_call(response: &str) -> Option<ToolCall> {
    extract_json_objects(response).into_iter().find_map(|value| {
        let empty = || Value::Object(Map::new());
        if let Some(name) = value.get("tool").and_then(Value::as_str) {
            let arguments = value.get("arguments").cloned().unwrap_or_else(empty);
            return Some(ToolCall::new(name, arguments));
        }
        let name = value.get("name").and_then(Value::as_str)?;
        let arguments = value
            .get("parameters")
            .or_else(|| value.get("arguments"))?
            .clone();
        Some(ToolCall::new(name, arguments))
    })
}

/// Result of a tool execution, as fed back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
        }
    }

    /// Message appended to the conversation after the call.
    pub fn to_message(&self, tool: &str) -> String {
        if self.success {
            format!("Tool '{}' succeeded:\n{}", tool, self.output)
        } else {
            format!(
                "Tool '{}' failed:\n{}",
                tool,
                self.error.as_deref().unwrap_or("Unknown error")
            )
        }
    }
}

/// The set of tools one agent run may call.
#[async_trait]
pub trait ToolSurface: Send + Sync {
    /// Names of the callable tools.
    fn tool_names(&self) -> Vec<String>;

    /// JSON descriptions of the callable tools, for the system prompt.
    fn describe(&self) -> Value;

    /// Executes one call.
    async fn call(&self, call: &ToolCall) -> Result<String, ToolError>;

    /// Executes one call, folding errors into a failed [`ToolResult`].
    async fn invoke(&self, call: &ToolCall) -> ToolResult {
        match self.call(call).await {
            Ok(output) => ToolResult::success(output),
            Err(err) => ToolResult::failure(err.to_string()),
        }
    }
}

/// Surface with no tools at all.
pub struct NoTools;

#[async_trait]
impl ToolSurface for NoTools {
    fn tool_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn describe(&self) -> Value {
        Value::Array(Vec::new())
    }

    async fn call(&self, call: &ToolCall) -> Result<String, ToolError> {
        Err(ToolError::NotAvailable(call.name.clone()))
    }
}

/// File tools confined to one worktree.
///
/// Paths are relative to the worktree root. Any path that resolves outside of
/// it, lexically or through a symlink, is refused with [`ToolError::PathEscape`].
pub struct WorktreeTools {
    root: PathBuf,
    allowed: Vec<String>,
}

const ALL_TOOLS: &[&str] = &["read_file", "write_file", "list_files", "search"];

impl WorktreeTools {
    /// All four tools over `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            allowed: ALL_TOOLS.iter().map(|t| t.to_string()).collect(),
        }
    }

    /// Keeps only the tools named in `names`.
    pub fn restricted_to(mut self, names: &[String]) -> Self {
        self.allowed.retain(|tool| names.contains(tool));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn resolve(&self, raw: &str) -> Result<PathBuf, ToolError> {
        let trimmed = raw.trim();
        if trimmed.contains('\0') {
            return Err(ToolError::InvalidParameters(
                "Path contains invalid null character".to_string(),
            ));
        }

        let requested = Path::new(if trimmed.is_empty() { "." } else { trimmed });
        let relative = if requested.is_absolute() {
            requested
                .strip_prefix(&self.root)
                .map_err(|_| ToolError::PathEscape(raw.to_string()))?
        } else {
            requested
        };
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(ToolError::PathEscape(raw.to_string()));
        }

        let mut joined = self.root.clone();
        for component in relative.components() {
            if let Component::Normal(part) = component {
                joined.push(part);
            }
        }

        // Symlinks inside the tree may still point out of it.
        let canonical_root = fs::canonicalize(&self.root).await?;
        let mut ancestor = joined.as_path();
        while !ancestor.exists() {
            match ancestor.parent() {
                Some(parent) => ancestor = parent,
                None => break,
            }
        }
        let canonical_ancestor = fs::canonicalize(ancestor).await?;
        if !canonical_ancestor.starts_with(&canonical_root) {
            return Err(ToolError::PathEscape(raw.to_string()));
        }

        Ok(joined)
    }

    fn display(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    async fn walk(&self, start: &Path, limit: usize) -> Result<Vec<PathBuf>, ToolError> {
        let mut files = Vec::new();
        let mut stack = vec![start.to_path_buf()];

        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_dir() {
                    let skipped = entry
                        .file_name()
                        .to_str()
                        .map(|name| SKIPPED_DIRS.contains(&name))
                        .unwrap_or(false);
                    if !skipped {
                        stack.push(path);
                    }
                } else if file_type.is_file() {
                    files.push(path);
                    if files.len() >= limit {
                        files.sort();
                        return Ok(files);
                    }
                }
            }
        }

        files.sort();
        Ok(files)
    }

    async fn read_file(&self, call: &ToolCall) -> Result<String, ToolError> {
        let path = self.resolve(call.required("path")?).await?;
        let size = fs::metadata(&path).await?.len();
        if size > MAX_FILE_SIZE {
            return Err(ToolError::InvalidParameters(format!(
                "{} is {} bytes, larger than the {} byte limit",
                self.display(&path),
                size,
                MAX_FILE_SIZE
            )));
        }
        Ok(fs::read_to_string(&path).await?)
    }

    async fn write_file(&self, call: &ToolCall) -> Result<String, ToolError> {
        let path = self.resolve(call.required("path")?).await?;
        let content = call.required("content")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, content).await?;
        Ok(format!("Wrote {} bytes to {}", content.len(), self.display(&path)))
    }

    async fn list_files(&self, call: &ToolCall) -> Result<String, ToolError> {
        let start = self.resolve(call.str_arg("path").unwrap_or(".")).await?;
        let files = self.walk(&start, MAX_LIST_ENTRIES).await?;
        let mut listing: Vec<String> = files.iter().map(|p| self.display(p)).collect();
        if listing.len() >= MAX_LIST_ENTRIES {
            listing.push(format!("... truncated at {} entries", MAX_LIST_ENTRIES));
        }
        Ok(listing.join("\n"))
    }

    async fn search(&self, call: &ToolCall) -> Result<String, ToolError> {
        let pattern = Regex::new(call.required("pattern")?)
            .map_err(|e| ToolError::InvalidParameters(format!("Invalid pattern: {}", e)))?;
        let start = self.resolve(call.str_arg("path").unwrap_or(".")).await?;

        let mut matches = Vec::new();
        for file in self.walk(&start, usize::MAX).await? {
            if fs::metadata(&file).await?.len() > MAX_FILE_SIZE {
                continue;
            }
            // Binary files are skipped.
            let Ok(contents) = fs::read_to_string(&file).await else {
                continue;
            };
            for (index, line) in contents.lines().enumerate() {
                if pattern.is_match(line) {
                    matches.push(format!("{}:{}: {}", self.display(&file), index + 1, line.trim()));
                    if matches.len() >= MAX_SEARCH_RESULTS {
                        matches.push(format!("... truncated at {} matches", MAX_SEARCH_RESULTS));
                        return Ok(matches.join("\n"));
                    }
                }
            }
        }

        if matches.is_empty() {
            Ok("No matches".to_string())
        } else {
            Ok(matches.join("\n"))
        }
    }
}

#[async_trait]
impl ToolSurface for WorktreeTools {
    fn tool_names(&self) -> Vec<String> {
        self.allowed.clone()
    }

    fn describe(&self) -> Value {
        let describe = |name: &str| match name {
            "read_file" => json!({
                "name": "read_file",
                "description": "Read a file relative to the worktree root",
                "arguments": {"path": "string"}
            }),
            "write_file" => json!({
                "name": "write_file",
                "description": "Create or overwrite a file relative to the worktree root",
                "arguments": {"path": "string", "content": "string"}
            }),
            "list_files" => json!({
                "name": "list_files",
                "description": "List files under a directory (default: the whole worktree)",
                "arguments": {"path": "string, optional"}
            }),
            _ => json!({
                "name": "search",
                "description": "Search file contents with a regular expression",
                "arguments": {"pattern": "string", "path": "string, optional"}
            }),
        };
        Value::Array(self.allowed.iter().map(|n| describe(n.as_str())).collect())
    }

    async fn call(&self, call: &ToolCall) -> Result<String, ToolError> {
        if !self.allowed.contains(&call.name) {
            return Err(ToolError::NotAvailable(call.name.clone()));
        }
        match call.name.as_str() {
            "read_file" => self.read_file(call).await,
            "write_file" => self.write_file(call).await,
            "list_files" => self.list_files(call).await,
            "search" => self.search(call).await,
            other => Err(ToolError::NotAvailable(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tools(dir: &tempfile::TempDir) -> WorktreeTools {
        WorktreeTools::new(dir.path())
    }

    #[test]
    fn test_parse_tool_call_formats() {
        let call = parse_tool_call(
            r#"Let me look. {"tool": "read_file", "arguments": {"path": "src/main.rs"}}"#,
        )
        .unwrap();
        assert_eq!(call.name, "read_file");
        assert_eq!(call.arguments["path"], "src/main.rs");

        let call = parse_tool_call(r#"{"name": "search", "parameters": {"pattern": "TODO"}}"#)
            .unwrap();
        assert_eq!(call.name, "search");

        let call = parse_tool_call(r#"{"tool": "list_files"}"#).unwrap();
        assert!(call.arguments.as_object().unwrap().is_empty());

        assert!(parse_tool_call(r#"{"summary": "done", "findings": []}"#).is_none());
        assert!(parse_tool_call("no json here").is_none());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let tools = tools(&dir);

        let written = tools
            .invoke(&ToolCall::new(
                "write_file",
                json!({"path": "src/new.rs", "content": "fn main() {}\n"}),
            ))
            .await;
        assert!(written.success, "{:?}", written.error);

        let read = tools
            .invoke(&ToolCall::new("read_file", json!({"path": "src/new.rs"})))
            .await;
        assert_eq!(read.output, "fn main() {}\n");
    }

    #[tokio::test]
    async fn test_escaping_paths_are_tool_errors() {
        let dir = tempfile::tempdir().unwrap();
        let tools = tools(&dir);

        for path in ["../outside.txt", "a/../../b", "/etc/passwd"] {
            let result = tools
                .call(&ToolCall::new("read_file", json!({"path": path})))
                .await;
            assert!(
                matches!(result, Err(ToolError::PathEscape(_))),
                "{} should be refused",
                path
            );
        }
    }

    #[tokio::test]
    async fn test_list_and_search_skip_git() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/config"), "needle").unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "// needle here\nfn x() {}\n").unwrap();

        let tools = tools(&dir);
        let listing = tools
            .call(&ToolCall::new("list_files", json!({})))
            .await
            .unwrap();
        assert_eq!(listing, "src/lib.rs");

        let found = tools
            .call(&ToolCall::new("search", json!({"pattern": "needle"})))
            .await
            .unwrap();
        assert_eq!(found, "src/lib.rs:1: // needle here");
    }

    #[tokio::test]
    async fn test_restricted_surface_refuses_other_tools() {
        let dir = tempfile::tempdir().unwrap();
        let tools = tools(&dir).restricted_to(&["read_file".to_string()]);
        assert_eq!(tools.tool_names(), vec!["read_file".to_string()]);

        let result = tools
            .call(&ToolCall::new("write_file", json!({"path": "x", "content": "y"})))
            .await;
        assert!(matches!(result, Err(ToolError::NotAvailable(_))));
    }
}
