use std::sync::Arc;

use futures::StreamExt;
use serde_json::{json, Value};

use strand_agent::{AgentLoop, AgentRequest};
use strand_core::config::ModelConfig;
use strand_test_utils::{ScriptedLlm, ScriptedTurn};
use strand_tools::ToolRegistry;
use strand_workflow::{agent_frames, DONE_SENTINEL};

fn payload(frame: &str) -> Value {
    serde_json::from_str(frame.trim_start_matches("data: ").trim_end()).expect("json frame")
}

#[tokio::test]
async fn test_agent_stream_frames_tool_use() {
    let llm = Arc::new(ScriptedLlm::new(vec![
        ScriptedTurn::tool_call("call-1", "calc", json!({"expression": "6 * 7"})),
        ScriptedTurn::text("It is 42."),
    ]));
    let agent = Arc::new(AgentLoop::new(llm.clone(), ToolRegistry::with_builtins()));
    let mut request = AgentRequest::new(ModelConfig::new("test-model"), "What is 6 times 7?");
    request.max_iterations = 4;

    let frames: Vec<String> = agent_frames(agent.stream(request)).collect().await;

    assert_eq!(frames.last().map(String::as_str), Some(DONE_SENTINEL));
    let events: Vec<Value> = frames[..frames.len() - 1].iter().map(|f| payload(f)).collect();
    let names: Vec<&str> = events.iter().filter_map(|e| e["event"].as_str()).collect();

    assert!(!names.contains(&"message"));
    assert_eq!(names.first(), Some(&"trace"));
    assert_eq!(names.last(), Some(&"done"));
    assert_eq!(events[0]["name"], "calc");

    let result = events
        .iter()
        .find(|e| e["event"] == "trace_result")
        .expect("trace_result frame");
    assert_eq!(result["result"], "42");

    let text: String = events
        .iter()
        .filter(|e| e["event"] == "text")
        .filter_map(|e| e["content"].as_str())
        .collect();
    assert_eq!(text, "It is 42.");
    assert_eq!(llm.call_count(), 2);
}

#[tokio::test]
async fn test_agent_stream_ends_with_error_frame_on_llm_failure() {
    let llm = Arc::new(ScriptedLlm::new(vec![ScriptedTurn::fail("HTTP 401")]));
    let agent = Arc::new(AgentLoop::new(llm, ToolRegistry::new()));
    let request = AgentRequest::new(ModelConfig::new("test-model"), "hi");

    let frames: Vec<String> = agent_frames(agent.stream(request)).collect().await;

    let n = frames.len();
    assert!(n >= 2);
    let error = payload(&frames[n - 2]);
    assert_eq!(error["event"], "error");
    assert!(error["content"].as_str().unwrap().contains("HTTP 401"));
    assert_eq!(frames[n - 1], DONE_SENTINEL);
    assert!(!frames.iter().any(|f| f.contains("\"event\":\"done\"")));
}
