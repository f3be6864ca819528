use serde_json::{json, Value};

/// A node entry in the `{id, type, data}` payload shape.
pub fn node(id: &str, node_type: &str, data: Value) -> Value {
    json!({"id": id, "type": node_type, "data": data})
}

/// An unconditional edge.
pub fn edge(source: &str, target: &str) -> Value {
    json!({"id": format!("{}-{}", source, target), "source": source, "target": target})
}

/// An edge taken only when the source selects `handle`.
pub fn handle_edge(source: &str, target: &str, handle: &str) -> Value {
    json!({
        "id": format!("{}-{}-{}", source, handle, target),
        "source": source,
        "target": target,
        "sourceHandle": handle,
    })
}

/// A full graph payload.
pub fn graph(nodes: Vec<Value>, edges: Vec<Value>) -> Value {
    json!({"nodes": nodes, "edges": edges})
}
