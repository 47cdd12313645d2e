//! Shell script task runner.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tether_core::ids::TaskId;
use tether_core::ports::TaskRunner;
use tether_core::secrets::{ExpressionContext, LogSanitizer};
use tether_core::task::{ScriptParameters, TaskOutcome, TaskPackage};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Upper bound on output kept for the task result.
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Runs `SCRIPT` and `SHELL_SCRIPT_TASK_NG` tasks with `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct ShellScriptRunner {
    workspace_dir: Option<PathBuf>,
}

impl ShellScriptRunner {
    pub fn new(workspace_dir: Option<PathBuf>) -> Self {
        Self { workspace_dir }
    }

    fn parameters(package: &TaskPackage) -> Result<ScriptParameters, String> {
        let data = package
            .data
            .as_ref()
            .ok_or_else(|| "task has no data".to_string())?;
        let params: ScriptParameters = serde_json::from_value(data.parameters.clone())
            .map_err(|e| format!("invalid script parameters: {e}"))?;
        if params.script.trim().is_empty() {
            return Err("script is empty".to_string());
        }
        Ok(params)
    }
}

#[async_trait]
impl TaskRunner for ShellScriptRunner {
    async fn run(
        &self,
        package: &TaskPackage,
        context: &ExpressionContext,
        sanitizer: &LogSanitizer,
    ) -> TaskOutcome {
        let params = match Self::parameters(package) {
            Ok(params) => params,
            Err(message) => {
                return TaskOutcome::ParametersFailure {
                    message: sanitizer.sanitize(&message),
                };
            }
        };

        let script = context.substitute(&params.script);
        let env: HashMap<String, String> = params
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), context.substitute(v)))
            .collect();

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&script)
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = params
            .working_directory
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| self.workspace_dir.clone())
        {
            command.current_dir(dir);
        }

        info!(task_id = %package.task_id, "Executing shell script");

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return TaskOutcome::StartupScriptFailure {
                    message: sanitizer.sanitize(&format!("Failed to start script: {e}")),
                };
            }
        };

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return TaskOutcome::StartupScriptFailure {
                message: "Failed to capture script output".to_string(),
            };
        };

        let (stdout_lines, stderr_lines, status) = tokio::join!(
            read_lines(stdout, &package.task_id, "stdout", sanitizer),
            read_lines(stderr, &package.task_id, "stderr", sanitizer),
            child.wait(),
        );

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                return TaskOutcome::StepException {
                    message: sanitizer.sanitize(&format!("Failed to wait for script: {e}")),
                    exit_code: None,
                };
            }
        };

        let output = truncate(stdout_lines.join("\n"));
        match status.code() {
            Some(0) => {
                debug!(task_id = %package.task_id, "Script completed");
                TaskOutcome::Success {
                    output,
                    exit_code: 0,
                }
            }
            code => {
                let detail = stderr_lines.last().cloned().unwrap_or_default();
                let message = match code {
                    Some(code) => format!("Script exited with code {code}"),
                    None => "Script terminated by signal".to_string(),
                };
                warn!(task_id = %package.task_id, exit_code = ?code, "Script failed");
                TaskOutcome::StepException {
                    message: if detail.is_empty() {
                        message
                    } else {
                        format!("{message}: {detail}")
                    },
                    exit_code: code,
                }
            }
        }
    }
}

async fn read_lines<R>(
    reader: R,
    task_id: &TaskId,
    stream: &'static str,
    sanitizer: &LogSanitizer,
) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut collected = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                // Invalid UTF-8 is replaced, not fatal: the pipe must keep draining.
                let line = sanitizer.sanitize(&String::from_utf8_lossy(&buf));
                info!(task_id = %task_id, stream, "{line}");
                collected.push(line);
            }
            Err(e) => {
                warn!(task_id = %task_id, stream, error = %e, "Failed to read script output");
                break;
            }
        }
    }
    collected
}

fn truncate(mut output: String) -> String {
    if output.len() > MAX_OUTPUT_BYTES {
        let mut cut = output.len() - MAX_OUTPUT_BYTES;
        while !output.is_char_boundary(cut) {
            cut += 1;
        }
        output = output.split_off(cut);
    }
    output
}
