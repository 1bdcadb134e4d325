//! `POST /mcp`: a JSON-RPC 2.0 surface speaking the handful of Model
//! Context Protocol methods this server implements, dispatched directly
//! against the JSON-RPC wire types rather than any server framework's
//! object model (per the design notes on `FastMCP` framework dependence).

use std::time::Duration;

use axum::extract::State;
use axum::Json;
use sandbox_core::aggregate;
use sandbox_core::execute;
use sandbox_core::ExecuteRequest;
use sandbox_protocol::jsonrpc::JsonRpcBody;
use sandbox_protocol::jsonrpc::JsonRpcError;
use sandbox_protocol::jsonrpc::JsonRpcReply;
use sandbox_protocol::jsonrpc::JsonRpcRequest;
use sandbox_protocol::jsonrpc::JsonRpcResponse;
use sandbox_protocol::jsonrpc::RequestId;
use sandbox_protocol::mcp::CallToolRequestParams;
use sandbox_protocol::mcp::CallToolResult;
use sandbox_protocol::mcp::GetPromptRequestParams;
use sandbox_protocol::mcp::GetPromptResult;
use sandbox_protocol::mcp::Implementation;
use sandbox_protocol::mcp::InitializeResult;
use sandbox_protocol::mcp::ListPromptsResult;
use sandbox_protocol::mcp::ListToolsResult;
use sandbox_protocol::mcp::Prompt;
use sandbox_protocol::mcp::PromptMessage;
use sandbox_protocol::mcp::PromptMessageContent;
use sandbox_protocol::mcp::ReadResourceRequestParams;
use sandbox_protocol::mcp::ReadResourceResult;
use sandbox_protocol::mcp::ResourceContents;
use sandbox_protocol::mcp::ServerCapabilities;
use sandbox_protocol::mcp::ServerCapabilitiesTools;
use sandbox_protocol::mcp::Tool;
use sandbox_protocol::mcp::ToolInputSchema;
use sandbox_protocol::mcp::MCP_PROTOCOL_VERSION;
use serde_json::json;
use serde_json::Value;
use tracing::warn;

use crate::state::AppState;

pub async fn handle(
    State(state): State<AppState>,
    Json(body): Json<JsonRpcBody>,
) -> Json<JsonRpcReply> {
    match body {
        JsonRpcBody::Single(request) => Json(JsonRpcReply::Single(dispatch(&state, request).await)),
        JsonRpcBody::Batch(requests) => {
            let mut replies = Vec::with_capacity(requests.len());
            for request in requests {
                replies.push(dispatch(&state, request).await);
            }
            Json(JsonRpcReply::Batch(replies))
        }
    }
}

async fn dispatch(state: &AppState, request: JsonRpcRequest) -> JsonRpcResponse {
    let Some(id) = request.id.clone() else {
        // Notifications get no reply; synthesize an id-less ack so this
        // helper always returns one response per request received.
        return JsonRpcResponse::success(RequestId::Number(0), Value::Null);
    };

    let result = match request.method.as_str() {
        "initialize" => Ok(initialize_result()),
        "tools/list" => Ok(serde_json::to_value(list_tools()).unwrap()),
        "tools/call" => call_tool(state, request.params).await,
        "resources/list" => Ok(json!({ "resources": [] })),
        "resources/templates/list" | "resources/list_templates" => {
            Ok(serde_json::to_value(list_resource_templates()).unwrap())
        }
        "resources/read" => read_resource(state, request.params).await,
        "prompts/list" => Ok(serde_json::to_value(list_prompts()).unwrap()),
        "prompts/get" => get_prompt(request.params),
        other => Err(JsonRpcError::method_not_found(other)),
    };

    match result {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::failure(id, e),
    }
}

fn initialize_result() -> Value {
    serde_json::to_value(InitializeResult {
        protocol_version: MCP_PROTOCOL_VERSION.to_string(),
        capabilities: ServerCapabilities {
            tools: Some(ServerCapabilitiesTools { list_changed: Some(false) }),
            resources: Some(json!({})),
            prompts: Some(json!({})),
        },
        server_info: Implementation {
            name: "sandbox-gateway".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    })
    .unwrap()
}

fn list_tools() -> ListToolsResult {
    ListToolsResult {
        tools: vec![
            Tool {
                name: "execute_python_code".to_string(),
                description: Some("Execute a Python code fragment in a sandboxed session".to_string()),
                input_schema: ToolInputSchema {
                    schema_type: "object".to_string(),
                    properties: json!({
                        "code": { "type": "string" },
                        "session_id": { "type": "string" },
                        "timeout": { "type": "integer" },
                    }),
                    required: vec!["code".to_string()],
                },
            },
            Tool {
                name: "list_active_sessions".to_string(),
                description: Some("List active sandbox sessions".to_string()),
                input_schema: ToolInputSchema {
                    schema_type: "object".to_string(),
                    properties: json!({}),
                    required: vec![],
                },
            },
            Tool {
                name: "terminate_session".to_string(),
                description: Some("Terminate a sandbox session".to_string()),
                input_schema: ToolInputSchema {
                    schema_type: "object".to_string(),
                    properties: json!({ "session_id": { "type": "string" } }),
                    required: vec!["session_id".to_string()],
                },
            },
        ],
    }
}

fn list_resource_templates() -> sandbox_protocol::mcp::ListResourceTemplatesResult {
    sandbox_protocol::mcp::ListResourceTemplatesResult {
        resource_templates: vec![sandbox_protocol::mcp::ResourceTemplate {
            uri_template: "session://{id}".to_string(),
            name: "session".to_string(),
            description: Some("A sandbox session's metadata and file manifest".to_string()),
            mime_type: Some("application/json".to_string()),
        }],
    }
}

fn list_prompts() -> ListPromptsResult {
    ListPromptsResult {
        prompts: vec![Prompt {
            name: "code_execution_prompt".to_string(),
            description: Some("A prompt template for asking the sandbox to run code".to_string()),
            arguments: vec![sandbox_protocol::mcp::PromptArgument {
                name: "task".to_string(),
                description: Some("What the code should accomplish".to_string()),
                required: Some(true),
            }],
        }],
    }
}

async fn call_tool(state: &AppState, params: Option<Value>) -> Result<Value, JsonRpcError> {
    let params: CallToolRequestParams = params
        .ok_or_else(|| JsonRpcError::invalid_params("missing params"))
        .and_then(|v| serde_json::from_value(v).map_err(|e| JsonRpcError::invalid_params(e.to_string())))?;

    let result = match params.name.as_str() {
        "execute_python_code" => execute_python_code(state, params.arguments).await,
        "list_active_sessions" => list_active_sessions(state).await,
        "terminate_session" => terminate_session(state, params.arguments).await,
        other => CallToolResult::error(format!("unknown tool: {other}")),
    };
    Ok(serde_json::to_value(result).unwrap())
}

async fn execute_python_code(state: &AppState, arguments: Value) -> CallToolResult {
    let code = match arguments.get("code").and_then(Value::as_str) {
        Some(code) => code.to_string(),
        None => return CallToolResult::error("missing required argument: code"),
    };
    let session_id = arguments
        .get("session_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    let timeout = arguments
        .get("timeout")
        .and_then(Value::as_u64)
        .map(Duration::from_secs);

    match execute(&state.manager, ExecuteRequest { code, session_id, timeout }).await {
        Ok(stream) => {
            let aggregated = aggregate(Box::pin(stream)).await;
            CallToolResult::ok(&serde_json::to_value(aggregated).unwrap())
        }
        Err(e) => CallToolResult::error(e.to_string()),
    }
}

async fn list_active_sessions(state: &AppState) -> CallToolResult {
    let sessions = state.manager.list().await;
    CallToolResult::ok(&serde_json::to_value(sessions.iter().map(|s| &s.id).collect::<Vec<_>>()).unwrap())
}

async fn terminate_session(state: &AppState, arguments: Value) -> CallToolResult {
    let Some(session_id) = arguments.get("session_id").and_then(Value::as_str) else {
        return CallToolResult::error("missing required argument: session_id");
    };
    match state.manager.terminate(session_id).await {
        Ok(()) => CallToolResult::ok(&json!({ "terminated": session_id })),
        Err(e) => CallToolResult::error(e.to_string()),
    }
}

async fn read_resource(state: &AppState, params: Option<Value>) -> Result<Value, JsonRpcError> {
    let params: ReadResourceRequestParams = params
        .ok_or_else(|| JsonRpcError::invalid_params("missing params"))
        .and_then(|v| serde_json::from_value(v).map_err(|e| JsonRpcError::invalid_params(e.to_string())))?;

    let Some(id) = params.uri.strip_prefix("session://") else {
        return Err(JsonRpcError::invalid_params(format!("unrecognized resource uri: {}", params.uri)));
    };
    let session = state
        .manager
        .get(id)
        .await
        .ok_or_else(|| JsonRpcError::invalid_params(format!("no such session: {id}")))?;
    let manifest = session.manifest.lock().await.all().clone();
    let text = serde_json::to_string(&json!({
        "session_id": session.id,
        "working_directory": session.workdir.display().to_string(),
        "busy": session.is_busy(),
        "exec_count": session.exec_count_snapshot(),
        "files": manifest,
    }))
    .unwrap();

    Ok(serde_json::to_value(ReadResourceResult {
        contents: vec![ResourceContents {
            uri: params.uri,
            mime_type: "application/json".to_string(),
            text,
        }],
    })
    .unwrap())
}

fn get_prompt(params: Option<Value>) -> Result<Value, JsonRpcError> {
    let params: GetPromptRequestParams = params
        .ok_or_else(|| JsonRpcError::invalid_params("missing params"))
        .and_then(|v| serde_json::from_value(v).map_err(|e| JsonRpcError::invalid_params(e.to_string())))?;

    if params.name != "code_execution_prompt" {
        warn!(name = %params.name, "unknown prompt requested");
        return Err(JsonRpcError::invalid_params(format!("unknown prompt: {}", params.name)));
    }

    let task = params
        .arguments
        .get("task")
        .and_then(Value::as_str)
        .unwrap_or("the given task");

    Ok(serde_json::to_value(GetPromptResult {
        description: Some("Run Python code in the sandbox to accomplish a task".to_string()),
        messages: vec![PromptMessage {
            role: "user".to_string(),
            content: PromptMessageContent {
                content_type: "text".to_string(),
                text: format!(
                    "Write and execute Python code using the execute_python_code tool to accomplish: {task}"
                ),
            },
        }],
    })
    .unwrap())
}
