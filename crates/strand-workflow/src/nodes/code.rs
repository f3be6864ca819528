use serde_json::{json, Map, Value};
use tracing::debug;

use strand_core::error::Result;

use crate::graph::config::CodeNodeConfig;
use crate::resolver::{resolve_deep, resolve_value};
use crate::sandbox::CodeRequest;
use crate::state::ExecutionState;

use super::{NodeContext, NodeOutcome};

/// A program that ran and exited non-zero is a completed node with
/// `success: false`; a sandbox that could not run it at all fails the node.
pub(super) async fn execute(
    ctx: &NodeContext<'_>,
    config: &CodeNodeConfig,
    state: &ExecutionState,
) -> Result<NodeOutcome> {
    let inputs: Map<String, Value> = config
        .inputs
        .iter()
        .map(|(name, value)| {
            let resolved = match value {
                Value::String(template) => resolve_value(template, state),
                other => resolve_deep(other, state),
            };
            (name.clone(), resolved)
        })
        .collect();

    debug!(node_id = %ctx.node.id, language = config.language.as_str(), "Running code node");
    let run = ctx
        .services
        .sandbox
        .run(CodeRequest {
            language: config.language,
            code: config.code.clone(),
            inputs: Value::Object(inputs),
        })
        .await?;

    let output = run.stdout.trim_end().to_string();
    if run.success() {
        return Ok(NodeOutcome::new(json!({"output": output, "success": true})));
    }

    let stderr = run.stderr.trim();
    let error = if stderr.is_empty() {
        format!("exit code {}", run.exit_code)
    } else {
        stderr.to_string()
    };
    Ok(NodeOutcome::new(json!({
        "error": error,
        "output": output,
        "exit_code": run.exit_code,
        "success": false,
    })))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use futures::future::BoxFuture;
    use serde_json::json;
    use strand_core::error::{Result, StrandError};

    use crate::sandbox::{CodeRequest, CodeRun, CodeSandbox};

    use super::super::test_support::{no_llm, state_with, Harness};

    /// Returns a canned run and remembers what it was asked to run.
    struct CannedSandbox {
        run: Option<CodeRun>,
        seen: Mutex<Vec<CodeRequest>>,
    }

    impl CannedSandbox {
        fn new(run: Option<CodeRun>) -> Arc<Self> {
            Arc::new(Self {
                run,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl CodeSandbox for CannedSandbox {
        fn run(&self, request: CodeRequest) -> BoxFuture<'_, Result<CodeRun>> {
            self.seen.lock().unwrap().push(request);
            let run = self.run.clone();
            Box::pin(async move { run.ok_or_else(|| StrandError::Sandbox("daemon down".into())) })
        }
    }

    fn harness(sandbox: Arc<CannedSandbox>) -> Harness {
        let mut h = Harness::new(
            "code",
            json!({
                "language": "python",
                "code": "print(1)",
                "inputs": {"n": "{{count}}", "label": "x-{{count}}", "fixed": [1, "{{count}}"]}
            }),
            no_llm(),
        );
        h.services = h.services.clone().with_sandbox(sandbox);
        h
    }

    #[tokio::test]
    async fn test_inputs_resolved_and_stdout_returned() {
        let sandbox = CannedSandbox::new(Some(CodeRun {
            stdout: "42\n".into(),
            stderr: String::new(),
            exit_code: 0,
        }));
        let h = harness(sandbox.clone());
        let out = h.run("n", &state_with(json!({"count": 7}))).await.unwrap().output;
        assert_eq!(out, json!({"output": "42", "success": true}));

        let seen = sandbox.seen.lock().unwrap();
        assert_eq!(seen[0].inputs, json!({"n": 7, "label": "x-7", "fixed": [1, "7"]}));
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_failure() {
        let sandbox = CannedSandbox::new(Some(CodeRun {
            stdout: String::new(),
            stderr: "Traceback: boom\n".into(),
            exit_code: 1,
        }));
        let out = harness(sandbox).run("n", &state_with(json!({}))).await.unwrap().output;
        assert_eq!(out["success"], false);
        assert_eq!(out["error"], "Traceback: boom");
        assert_eq!(out["exit_code"], 1);
    }

    #[tokio::test]
    async fn test_silent_failure_names_exit_code() {
        let sandbox = CannedSandbox::new(Some(CodeRun {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 2,
        }));
        let out = harness(sandbox).run("n", &state_with(json!({}))).await.unwrap().output;
        assert_eq!(out["error"], "exit code 2");
    }

    #[tokio::test]
    async fn test_sandbox_error_fails_node() {
        let err = harness(CannedSandbox::new(None))
            .run("n", &state_with(json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, StrandError::Sandbox(_)));
    }

    #[tokio::test]
    async fn test_bash_in_local_process() {
        let h = Harness::new(
            "code",
            json!({"language": "bash", "code": "echo \"$STRAND_INPUTS\"", "inputs": {"q": "{{q}}"}}),
            no_llm(),
        );
        let out = h.run("n", &state_with(json!({"q": "hi"}))).await.unwrap().output;
        assert_eq!(out["output"], r#"{"q":"hi"}"#);
    }
}
