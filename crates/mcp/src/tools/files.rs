// Workspace file tools: read and write files, list a directory

use crate::tools::{json_schema_boolean, json_schema_object, json_schema_string, Tool};
use crate::workspace::Workspace;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tether_core::protocol::{Tool as ToolDefinition, ToolCallResult};
use walkdir::WalkDir;

/// Upper bound on entries returned by one `list_files` call
const MAX_LISTED: usize = 1000;

/// Tool to read a text file from the workspace
pub struct ReadFileTool {
    workspace: Workspace,
}

impl ReadFileTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[derive(Debug, Deserialize)]
struct ReadFileArgs {
    path: String,
}

#[async_trait::async_trait]
impl Tool for ReadFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "read_file".to_string(),
            title: Some("Read file".to_string()),
            description: Some(
                "Read a text file from the workspace. Cannot read secret files (.env, credentials, private keys, etc.)"
                    .to_string(),
            ),
            input_schema: json_schema_object(
                json!({
                    "path": json_schema_string("Path to the file, relative to the workspace root")
                }),
                vec!["path"],
            ),
            output_schema: None,
        }
    }

    async fn execute(&self, arguments: Value) -> Result<ToolCallResult> {
        let args: ReadFileArgs =
            serde_json::from_value(arguments).context("Invalid arguments for read_file")?;

        let path = match self.workspace.resolve(&args.path) {
            Ok(path) => path,
            Err(e) => return Ok(ToolCallResult::error(format!("{:#}", e))),
        };

        if path.is_dir() {
            return Ok(ToolCallResult::error(format!(
                "{} is a directory; use list_files",
                args.path
            )));
        }

        match tokio::fs::read(&path).await {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(content) => Ok(ToolCallResult::text(content)),
                Err(e) => Ok(ToolCallResult::error(format!(
                    "{} is binary ({} bytes) and cannot be shown as text",
                    args.path,
                    e.as_bytes().len()
                ))),
            },
            Err(e) => Ok(ToolCallResult::error(format!(
                "Failed to read {}: {}",
                args.path, e
            ))),
        }
    }
}

/// Tool to create or overwrite a text file in the workspace
pub struct WriteFileTool {
    workspace: Workspace,
}

impl WriteFileTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[derive(Debug, Deserialize)]
struct WriteFileArgs {
    path: String,
    #[serde(alias = "contents")]
    content: String,
}

#[async_trait::async_trait]
impl Tool for WriteFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "write_file".to_string(),
            title: Some("Write file".to_string()),
            description: Some(
                "Create or overwrite a text file in the workspace. The parent directory must exist"
                    .to_string(),
            ),
            input_schema: json_schema_object(
                json!({
                    "path": json_schema_string("Path to the file, relative to the workspace root"),
                    "content": json_schema_string("Text to write")
                }),
                vec!["path", "content"],
            ),
            output_schema: None,
        }
    }

    async fn execute(&self, arguments: Value) -> Result<ToolCallResult> {
        let args: WriteFileArgs =
            serde_json::from_value(arguments).context("Invalid arguments for write_file")?;

        let path = match self.workspace.resolve_for_write(&args.path) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(path = %args.path, error = %e, "Refused file write");
                return Ok(ToolCallResult::error(format!("{:#}", e)));
            }
        };

        if path.is_dir() {
            return Ok(ToolCallResult::error(format!(
                "{} is a directory",
                args.path
            )));
        }

        match tokio::fs::write(&path, args.content.as_bytes()).await {
            Ok(()) => {
                let mut result = ToolCallResult::text(format!(
                    "Wrote {} bytes to {}",
                    args.content.len(),
                    args.path
                ));
                result.structured_content = Some(json!({
                    "path": self.workspace.relative(&path),
                    "bytes": args.content.len(),
                }));
                Ok(result)
            }
            Err(e) => Ok(ToolCallResult::error(format!(
                "Failed to write {}: {}",
                args.path, e
            ))),
        }
    }
}

/// Tool to list files under a workspace directory
pub struct ListFilesTool {
    workspace: Workspace,
}

impl ListFilesTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[derive(Debug, Deserialize)]
struct ListFilesArgs {
    #[serde(default = "default_dir")]
    path: String,
    #[serde(default)]
    recursive: bool,
}

fn default_dir() -> String {
    ".".to_string()
}

#[async_trait::async_trait]
impl Tool for ListFilesTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "list_files".to_string(),
            title: Some("List files".to_string()),
            description: Some("List files in a workspace directory".to_string()),
            input_schema: json_schema_object(
                json!({
                    "path": json_schema_string("Directory relative to the workspace root (default: root)"),
                    "recursive": json_schema_boolean("Descend into subdirectories")
                }),
                vec![],
            ),
            output_schema: None,
        }
    }

    async fn execute(&self, arguments: Value) -> Result<ToolCallResult> {
        let args: ListFilesArgs = if arguments.is_null() {
            ListFilesArgs {
                path: default_dir(),
                recursive: false,
            }
        } else {
            serde_json::from_value(arguments).context("Invalid arguments for list_files")?
        };

        let dir = match self.workspace.resolve(&args.path) {
            Ok(dir) if dir.is_dir() => dir,
            Ok(_) => {
                return Ok(ToolCallResult::error(format!(
                    "{} is not a directory",
                    args.path
                )))
            }
            Err(e) => return Ok(ToolCallResult::error(format!("{:#}", e))),
        };

        let workspace = self.workspace.clone();
        let recursive = args.recursive;
        let (files, truncated) = tokio::task::spawn_blocking(move || {
            let walker = WalkDir::new(&dir)
                .min_depth(1)
                .max_depth(if recursive { usize::MAX } else { 1 })
                .sort_by_file_name();

            let mut files = Vec::new();
            for entry in walker.into_iter().filter_map(|e| e.ok()) {
                let relative = workspace.relative(entry.path());
                if Workspace::is_denied(&relative) {
                    continue;
                }
                if files.len() == MAX_LISTED {
                    return (files, true);
                }
                if entry.file_type().is_dir() {
                    files.push(format!("{}/", relative));
                } else {
                    files.push(relative);
                }
            }
            (files, false)
        })
        .await
        .context("File listing task failed")?;

        let mut text = files.join("\n");
        if truncated {
            text.push_str(&format!("\n... truncated after {} entries", MAX_LISTED));
        }

        let mut result = ToolCallResult::text(text);
        result.structured_content = Some(json!({ "files": files, "truncated": truncated }));
        Ok(result)
    }
}
