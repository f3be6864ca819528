use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;
use tracing::{debug, warn};

use strand_core::config::CodeConfig;
use strand_core::error::{Result, StrandError};

use crate::graph::config::CodeLanguage;

/// Environment variable carrying the program inputs.
pub const INPUTS_ENV: &str = "STRAND_INPUTS";

const MAX_OUTPUT_BYTES: usize = 30_000;

/// A program to run.
#[derive(Debug, Clone)]
pub struct CodeRequest {
    pub language: CodeLanguage,
    pub code: String,
    pub inputs: serde_json::Value,
}

/// What a finished program left behind.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeRun {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl CodeRun {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Where code nodes run. Inputs reach the program as JSON in `STRAND_INPUTS`.
///
/// `Err` means the program could not be run at all (spawn failure, daemon
/// unreachable, timeout); a program that ran and failed is an `Ok` run with
/// a non-zero exit code.
pub trait CodeSandbox: Send + Sync + 'static {
    fn run(&self, request: CodeRequest) -> BoxFuture<'_, Result<CodeRun>>;
}

/// Pick the sandbox named by `config.sandbox`.
pub fn from_config(config: &CodeConfig) -> Arc<dyn CodeSandbox> {
    match config.sandbox.as_str() {
        "docker" => Arc::new(DockerSandbox::new(config)),
        "process" => Arc::new(ProcessSandbox::new(config)),
        other => {
            warn!(sandbox = %other, "Unknown code sandbox, using local process");
            Arc::new(ProcessSandbox::new(config))
        }
    }
}

fn truncate_output(mut text: String) -> String {
    if text.len() > MAX_OUTPUT_BYTES {
        let mut cut = MAX_OUTPUT_BYTES;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("\n... (output truncated)");
    }
    text
}

/// Runs code with a local interpreter.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    python: String,
    node: String,
    timeout: Duration,
}

impl ProcessSandbox {
    pub fn new(config: &CodeConfig) -> Self {
        Self {
            python: config.python.clone(),
            node: config.node.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    fn command_for(&self, language: CodeLanguage) -> (&str, &'static str) {
        match language {
            CodeLanguage::Python => (self.python.as_str(), "-c"),
            CodeLanguage::Javascript => (self.node.as_str(), "-e"),
            CodeLanguage::Bash => ("bash", "-c"),
        }
    }
}

impl Default for ProcessSandbox {
    fn default() -> Self {
        Self::new(&CodeConfig::default())
    }
}

impl CodeSandbox for ProcessSandbox {
    fn run(&self, request: CodeRequest) -> BoxFuture<'_, Result<CodeRun>> {
        Box::pin(async move {
            let (program, flag) = self.command_for(request.language);
            debug!(language = request.language.as_str(), program, "Running code in local process");

            let result = tokio::time::timeout(self.timeout, async {
                tokio::process::Command::new(program)
                    .arg(flag)
                    .arg(&request.code)
                    .env(INPUTS_ENV, request.inputs.to_string())
                    .kill_on_drop(true)
                    .output()
                    .await
            })
            .await;

            match result {
                Ok(Ok(output)) => Ok(CodeRun {
                    stdout: truncate_output(String::from_utf8_lossy(&output.stdout).into_owned()),
                    stderr: truncate_output(String::from_utf8_lossy(&output.stderr).into_owned()),
                    exit_code: output.status.code().map(i64::from).unwrap_or(-1),
                }),
                Ok(Err(e)) => Err(StrandError::Sandbox(format!("failed to start {}: {}", program, e))),
                Err(_) => Err(StrandError::Sandbox(format!(
                    "code timed out after {}s",
                    self.timeout.as_secs()
                ))),
            }
        })
    }
}

/// Runs code in a fresh, network-less Docker container that is removed
/// afterwards.
#[derive(Debug, Clone)]
pub struct DockerSandbox {
    image: String,
    memory_mb: u64,
    timeout_secs: u64,
}

impl DockerSandbox {
    pub fn new(config: &CodeConfig) -> Self {
        Self {
            image: config.image.clone(),
            memory_mb: config.memory_mb,
            timeout_secs: config.timeout_secs,
        }
    }

    fn command_for(language: CodeLanguage, code: &str) -> Vec<String> {
        let (program, flag) = match language {
            CodeLanguage::Python => ("python", "-c"),
            CodeLanguage::Javascript => ("node", "-e"),
            CodeLanguage::Bash => ("bash", "-c"),
        };
        vec![program.to_string(), flag.to_string(), code.to_string()]
    }

    async fn run_container(&self, request: CodeRequest) -> Result<CodeRun> {
        let docker = bollard::Docker::connect_with_local_defaults()
            .map_err(|e| StrandError::Sandbox(format!("Docker connect failed: {}", e)))?;

        let container_config = bollard::container::Config {
            image: Some(self.image.clone()),
            cmd: Some(Self::command_for(request.language, &request.code)),
            env: Some(vec![format!("{}={}", INPUTS_ENV, request.inputs)]),
            working_dir: Some("/tmp".to_string()),
            host_config: Some(bollard::models::HostConfig {
                memory: Some((self.memory_mb as i64) * 1024 * 1024),
                network_mode: Some("none".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container = docker
            .create_container::<&str, String>(None, container_config)
            .await
            .map_err(|e| StrandError::Sandbox(format!("Docker create failed: {}", e)))?;

        if let Err(e) = docker.start_container::<String>(&container.id, None).await {
            remove(&docker, &container.id).await;
            return Err(StrandError::Sandbox(format!("Docker start failed: {}", e)));
        }

        let timeout = Duration::from_secs(self.timeout_secs);
        let wait_result = tokio::time::timeout(timeout, async {
            let mut stream = docker.wait_container::<String>(
                &container.id,
                None::<bollard::container::WaitContainerOptions<String>>,
            );
            stream.next().await
        })
        .await;

        let exit_code = match wait_result {
            Ok(Some(Ok(exit))) => exit.status_code,
            // Non-zero exits surface as a wait error carrying the code.
            Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => code,
            Ok(Some(Err(e))) => {
                remove(&docker, &container.id).await;
                return Err(StrandError::Sandbox(format!("Docker wait failed: {}", e)));
            }
            Ok(None) => 0,
            Err(_) => {
                docker
                    .kill_container::<String>(&container.id, None)
                    .await
                    .ok();
                remove(&docker, &container.id).await;
                return Err(StrandError::Sandbox(format!(
                    "code timed out after {}s",
                    self.timeout_secs
                )));
            }
        };

        let log_options = bollard::container::LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut log_stream = docker.logs(&container.id, Some(log_options));
        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(Ok(log)) = log_stream.next().await {
            match log {
                bollard::container::LogOutput::StdErr { message } => {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
                other => stdout.push_str(&other.to_string()),
            }
        }

        remove(&docker, &container.id).await;

        Ok(CodeRun {
            stdout: truncate_output(stdout),
            stderr: truncate_output(stderr),
            exit_code,
        })
    }
}

async fn remove(docker: &bollard::Docker, id: &str) {
    let remove_options = bollard::container::RemoveContainerOptions {
        force: true,
        ..Default::default()
    };
    if let Err(e) = docker.remove_container(id, Some(remove_options)).await {
        debug!(container = %id, error = %e, "Container cleanup failed");
    }
}

impl CodeSandbox for DockerSandbox {
    fn run(&self, request: CodeRequest) -> BoxFuture<'_, Result<CodeRun>> {
        Box::pin(self.run_container(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bash(code: &str, inputs: serde_json::Value) -> CodeRequest {
        CodeRequest {
            language: CodeLanguage::Bash,
            code: code.to_string(),
            inputs,
        }
    }

    #[tokio::test]
    async fn test_process_captures_stdout() {
        let run = ProcessSandbox::default()
            .run(bash("echo hello", json!({})))
            .await
            .unwrap();
        assert!(run.success());
        assert_eq!(run.stdout, "hello\n");
    }

    #[tokio::test]
    async fn test_process_passes_inputs_as_json() {
        let run = ProcessSandbox::default()
            .run(bash("printf '%s' \"$STRAND_INPUTS\"", json!({"x": 1})))
            .await
            .unwrap();
        assert_eq!(run.stdout, r#"{"x":1}"#);
    }

    #[tokio::test]
    async fn test_process_nonzero_exit_is_a_run() {
        let run = ProcessSandbox::default()
            .run(bash("echo oops >&2; exit 3", json!({})))
            .await
            .unwrap();
        assert_eq!(run.exit_code, 3);
        assert_eq!(run.stderr, "oops\n");
        assert!(!run.success());
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_an_error() {
        let config = CodeConfig {
            python: "strand-no-such-python".into(),
            ..CodeConfig::default()
        };
        let err = ProcessSandbox::new(&config)
            .run(CodeRequest {
                language: CodeLanguage::Python,
                code: "print(1)".into(),
                inputs: json!({}),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StrandError::Sandbox(_)));
    }

    #[test]
    fn test_truncate_output_is_char_safe() {
        let long = "é".repeat(MAX_OUTPUT_BYTES);
        let cut = truncate_output(long);
        assert!(cut.ends_with("(output truncated)"));
        assert!(cut.len() <= MAX_OUTPUT_BYTES + 30);
    }

    #[test]
    fn test_docker_command_per_language() {
        assert_eq!(
            DockerSandbox::command_for(CodeLanguage::Javascript, "1"),
            vec!["node", "-e", "1"]
        );
        assert_eq!(DockerSandbox::command_for(CodeLanguage::Python, "x")[0], "python");
    }
}
