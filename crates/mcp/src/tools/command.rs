// Allow-listed command execution inside the workspace

use crate::tools::{json_schema_array, json_schema_object, json_schema_string, Tool};
use crate::workspace::Workspace;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::path::{Component, Path};
use std::time::Duration;
use tether_core::protocol::{Tool as ToolDefinition, ToolCallResult};
use tokio::process::Command;
use tracing::{debug, warn};

const DEFAULT_ALLOWED: &[&str] = &[
    "ls", "pwd", "whoami", "date", "uname", "git", "npm", "cargo", "python", "node",
];

const SHELL_METACHARACTERS: &[char] = &['|', '&', ';', '<', '>', '`', '$', '(', ')', '{', '}'];

/// Tool to run an allow-listed program with the workspace as working directory
pub struct ExecuteCommandTool {
    workspace: Workspace,
    allowed: BTreeSet<String>,
    timeout: Duration,
}

impl ExecuteCommandTool {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            workspace,
            allowed: DEFAULT_ALLOWED.iter().map(|c| c.to_string()).collect(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Replace the allow-list.
    pub fn with_allowed<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed = commands.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_allowed(&self, command: &str) -> bool {
        self.allowed.contains(command)
    }

    /// Refuse arguments that point outside the workspace or at secret files.
    /// For `--flag=value` arguments the value is checked.
    pub fn check_arg(arg: &str) -> Result<(), String> {
        let value = match arg.split_once('=') {
            Some((flag, value)) if flag.starts_with('-') => value,
            _ => arg,
        };
        let path = Path::new(value);
        if value.starts_with('~')
            || path.is_absolute()
            || path.components().any(|c| matches!(c, Component::ParentDir))
        {
            return Err(format!("Access denied: {} is outside the workspace", value));
        }
        if Workspace::is_denied(value) {
            return Err(format!("Access denied: {} appears to be a secret file", value));
        }
        Ok(())
    }

    /// Strip shell metacharacters and drop arguments left empty.
    pub fn sanitize_args(args: &[String]) -> Vec<String> {
        args.iter()
            .map(|arg| arg.chars().filter(|c| !SHELL_METACHARACTERS.contains(c)).collect::<String>())
            .filter(|arg| !arg.is_empty())
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct ExecuteCommandArgs {
    command: String,
    #[serde(default)]
    args: Vec<String>,
}

#[async_trait::async_trait]
impl Tool for ExecuteCommandTool {
    fn definition(&self) -> ToolDefinition {
        let allowed: Vec<&str> = self.allowed.iter().map(String::as_str).collect();
        ToolDefinition {
            name: "execute_command".to_string(),
            title: Some("Execute command".to_string()),
            description: Some(format!(
                "Run a program in the workspace. Allowed: {}",
                allowed.join(", ")
            )),
            input_schema: json_schema_object(
                json!({
                    "command": json_schema_string("Program name"),
                    "args": json_schema_array(json!({ "type": "string" }), "Arguments")
                }),
                vec!["command"],
            ),
            output_schema: None,
        }
    }

    async fn execute(&self, arguments: Value) -> Result<ToolCallResult> {
        let args: ExecuteCommandArgs =
            serde_json::from_value(arguments).context("Invalid arguments for execute_command")?;

        if !self.is_allowed(&args.command) {
            warn!(command = %args.command, "Command not in allow-list");
            return Ok(ToolCallResult::error(format!(
                "Command not allowed: {}",
                args.command
            )));
        }

        let argv = Self::sanitize_args(&args.args);
        if let Some(denied) = argv.iter().find_map(|arg| Self::check_arg(arg).err()) {
            warn!(command = %args.command, reason = %denied, "Command argument refused");
            return Ok(ToolCallResult::error(denied));
        }
        debug!(command = %args.command, args = ?argv, "Executing command");

        let child = Command::new(&args.command)
            .args(&argv)
            .current_dir(self.workspace.root())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Ok(ToolCallResult::error(format!(
                    "Failed to execute {}: {}",
                    args.command, e
                )))
            }
            Err(_) => {
                return Ok(ToolCallResult::error(format!(
                    "{} timed out after {}s",
                    args.command,
                    self.timeout.as_secs()
                )))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let mut result = if output.status.success() {
            ToolCallResult::text(stdout.clone())
        } else {
            ToolCallResult::error(if stderr.is_empty() { stdout.clone() } else { stderr.clone() })
        };
        result.structured_content = Some(json!({
            "exitCode": output.status.code(),
            "stdout": stdout,
            "stderr": stderr,
        }));
        Ok(result)
    }
}
