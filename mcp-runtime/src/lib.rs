use std::collections::BTreeMap;

use regex::{Regex, RegexBuilder};
use reqwest::Method;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use magicapi_client::{ApiResponse, ClientError, HttpClient};
use magicapi_core::error::codes;
use magicapi_core::knowledge;
use magicapi_core::settings::MagicApiSettings;

pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
pub const MCP_SERVER_NAME: &str = "magicapi-mcp";

const RESOURCE_KINDS: [&str; 4] = ["api", "function", "task", "datasource"];
const TREE_FORMATS: [&str; 3] = ["tree", "list", "csv"];
const CSV_HEADER: &str = "id,name,method,path,kind";
/// Detail fetches per path_detail call; fuzzy queries can fan out wide.
const MAX_PATH_DETAIL_MATCHES: usize = 5;

/// Explicit tool identifiers. Unknown names are rejected with
/// `not_implemented` before any handler runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolId {
    Syntax,
    Examples,
    Docs,
    BestPractices,
    Pitfalls,
    Workflow,
    ResourceTree,
    PathToId,
    PathDetail,
    ApiDetail,
    Call,
    Meta,
}

impl ToolId {
    pub const ALL: [ToolId; 12] = [
        ToolId::Syntax,
        ToolId::Examples,
        ToolId::Docs,
        ToolId::BestPractices,
        ToolId::Pitfalls,
        ToolId::Workflow,
        ToolId::ResourceTree,
        ToolId::PathToId,
        ToolId::PathDetail,
        ToolId::ApiDetail,
        ToolId::Call,
        ToolId::Meta,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ToolId::Syntax => "magicapi_syntax",
            ToolId::Examples => "magicapi_examples",
            ToolId::Docs => "magicapi_docs",
            ToolId::BestPractices => "magicapi_best_practices",
            ToolId::Pitfalls => "magicapi_pitfalls",
            ToolId::Workflow => "magicapi_workflow",
            ToolId::ResourceTree => "magicapi_resource_tree",
            ToolId::PathToId => "magicapi_path_to_id",
            ToolId::PathDetail => "magicapi_path_detail",
            ToolId::ApiDetail => "magicapi_api_detail",
            ToolId::Call => "magicapi_call",
            ToolId::Meta => "magicapi_meta",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.name() == name)
    }
}

/// Tool-boundary error. Serialized as the uniform envelope
/// `{"error": {"code", "message", "detail"?}}`, the only failure shape a
/// tool call can produce.
#[derive(Debug, Clone)]
pub struct ToolError {
    pub code: String,
    pub message: String,
    pub detail: Option<Value>,
}

impl ToolError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            detail: None,
        }
    }

    pub fn validation(message: impl Into<String>, field: &str) -> Self {
        Self::new(codes::VALIDATION_ERROR, message).with_detail(json!({ "field": field }))
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn to_value(&self) -> Value {
        let mut inner = json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(detail) = &self.detail {
            inner["detail"] = detail.clone();
        }
        json!({ "error": inner })
    }
}

impl From<ClientError> for ToolError {
    fn from(error: ClientError) -> Self {
        ToolError::new(error.code(), error.to_string())
    }
}

#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
        }
    }

    fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {method}"),
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
        }
    }
}

#[derive(Debug)]
struct ToolDefinition {
    name: &'static str,
    description: &'static str,
    input_schema: Value,
}

fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "magicapi_syntax",
            description: "Magic-Script syntax notes for one topic (basic, db, http, response, module).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "topic": { "type": "string" },
                    "locale": { "type": "string", "default": "en" }
                },
                "required": ["topic"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "magicapi_examples",
            description: "Script examples for a kind, optionally filtered by keyword.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "kind": { "type": "string" },
                    "keyword": { "type": "string" }
                },
                "required": ["kind"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "magicapi_docs",
            description: "Documentation index, with an overview summary unless index_only.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "index_only": { "type": "boolean", "default": true }
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "magicapi_best_practices",
            description: "Best practices for writing Magic-API interfaces.",
            input_schema: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "magicapi_pitfalls",
            description: "Common Magic-Script mistakes and how they bite.",
            input_schema: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "magicapi_workflow",
            description: "Step-by-step workflow for a named task (create_api, debug_api, query_db).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "task": { "type": "string" },
                    "with_commands": { "type": "boolean", "default": false }
                },
                "required": ["task"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "magicapi_resource_tree",
            description: "Resource tree of the connected service, as nested tree, flat list, or CSV.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "kind": { "type": "string", "enum": ["all", "api", "function", "task", "datasource"], "default": "api" },
                    "format": { "type": "string", "enum": ["tree", "list", "csv"], "default": "tree" },
                    "search": { "type": "string", "description": "Regex over node names and full paths" },
                    "depth": { "type": "integer", "minimum": 1 }
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "magicapi_path_to_id",
            description: "Resolve a request path to script file ids; fuzzy matches on substrings.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "fuzzy": { "type": "boolean", "default": false }
                },
                "required": ["path"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "magicapi_path_detail",
            description: "Resolve a path and fetch the script detail for each match.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "fuzzy": { "type": "boolean", "default": false }
                },
                "required": ["path"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "magicapi_api_detail",
            description: "Script file detail (name, path, method, script body) by file id.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "file_id": { "type": "string" }
                },
                "required": ["file_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "magicapi_call",
            description: "Call an interface on the connected service; status, headers, and body are returned verbatim.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "method": { "type": "string", "enum": ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"] },
                    "path": { "type": "string" },
                    "params": {
                        "description": "Query parameters: object map or [{key, value}] entries.",
                        "oneOf": [
                            { "type": "object", "additionalProperties": { "type": ["string", "number", "boolean"] } },
                            {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "properties": {
                                        "key": { "type": "string" },
                                        "value": { "type": ["string", "number", "boolean"] }
                                    },
                                    "required": ["key", "value"],
                                    "additionalProperties": false
                                }
                            }
                        ]
                    },
                    "data": {},
                    "headers": { "type": "object", "additionalProperties": { "type": "string" } }
                },
                "required": ["method", "path"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "magicapi_meta",
            description: "Assistant system prompt and connection environment.",
            input_schema: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        },
    ]
}

pub struct McpServer {
    settings: MagicApiSettings,
    client: HttpClient,
}

impl McpServer {
    pub fn new(settings: MagicApiSettings) -> Self {
        Self {
            client: HttpClient::new(settings.clone()),
            settings,
        }
    }

    pub async fn serve_stdio(&self) -> Result<(), String> {
        tracing::info!(
            base_url = %self.settings.base_url,
            auth_enabled = self.settings.auth_enabled,
            "serving MCP over stdio"
        );

        let stdin = tokio::io::stdin();
        let mut reader = BufReader::new(stdin);
        let mut stdout = tokio::io::stdout();

        loop {
            let incoming = read_framed_json(&mut reader)
                .await
                .map_err(|e| format!("Failed to read MCP message: {e}"))?;
            let Some(incoming) = incoming else {
                break;
            };

            let responses = self.handle_incoming_message(incoming).await;
            for response in responses {
                write_framed_json(&mut stdout, &response)
                    .await
                    .map_err(|e| format!("Failed to write MCP response: {e}"))?;
            }
        }

        Ok(())
    }

    pub async fn handle_incoming_message(&self, incoming: Value) -> Vec<Value> {
        let mut responses = Vec::new();

        if let Some(batch) = incoming.as_array() {
            if batch.is_empty() {
                responses.push(error_response(
                    Value::Null,
                    RpcError::invalid_request("Batch request must not be empty"),
                ));
                return responses;
            }
            for item in batch {
                if let Some(response) = self.handle_single_message(item.clone()).await {
                    responses.push(response);
                }
            }
            return responses;
        }

        if let Some(response) = self.handle_single_message(incoming).await {
            responses.push(response);
        }
        responses
    }

    async fn handle_single_message(&self, incoming: Value) -> Option<Value> {
        let Some(obj) = incoming.as_object() else {
            return Some(error_response(
                Value::Null,
                RpcError::invalid_request("Request must be a JSON object"),
            ));
        };

        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            let id = obj.get("id").cloned().unwrap_or(Value::Null);
            return Some(error_response(
                id,
                RpcError::invalid_request("jsonrpc must be '2.0'"),
            ));
        }

        let Some(method) = obj.get("method").and_then(Value::as_str) else {
            // Most likely a client response; this server issues no outbound requests.
            return None;
        };

        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        if let Some(id) = obj.get("id").cloned() {
            let result = self.handle_request(method, params).await;
            Some(match result {
                Ok(payload) => success_response(id, payload),
                Err(err) => error_response(id, err),
            })
        } else {
            self.handle_notification(method);
            None
        }
    }

    fn handle_notification(&self, method: &str) {
        if !matches!(
            method,
            "notifications/initialized" | "notifications/cancelled"
        ) {
            tracing::debug!(%method, "ignoring unknown notification");
        }
    }

    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(self.initialize_payload()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(tools_list_payload()),
            "tools/call" => self.handle_tools_call(params).await,
            "resources/list" => Ok(json!({ "resources": [] })),
            "prompts/list" => Ok(json!({ "prompts": [] })),
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    fn initialize_payload(&self) -> Value {
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": false },
                "resources": { "listChanged": false },
                "prompts": { "listChanged": false }
            },
            "serverInfo": {
                "name": MCP_SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION")
            },
            "instructions": "Assistant for one Magic-API service. Use magicapi_syntax, magicapi_examples, magicapi_best_practices, and magicapi_pitfalls for Magic-Script authoring guidance (SQL values bind with #{ } placeholders, never ${ }). Locate interfaces with magicapi_resource_tree and magicapi_path_to_id, read scripts with magicapi_api_detail, and exercise them with magicapi_call."
        })
    }

    async fn handle_tools_call(&self, params: Value) -> Result<Value, RpcError> {
        let params = params
            .as_object()
            .ok_or_else(|| RpcError::invalid_params("tools/call params must be an object"))?;

        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("tools/call requires string field 'name'"))?;

        let args = match params.get("arguments") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(_) => {
                return Err(RpcError::invalid_params(
                    "tools/call 'arguments' must be an object",
                ));
            }
        };

        let result = match ToolId::from_name(name) {
            Some(tool) => self.execute_tool(tool, &args).await,
            None => Err(ToolError::new(
                codes::NOT_IMPLEMENTED,
                format!("Unknown tool '{name}'"),
            )
            .with_detail(json!({
                "known_tools": ToolId::ALL.iter().map(|tool| tool.name()).collect::<Vec<_>>()
            }))),
        };

        Ok(match result {
            Ok(payload) => tool_call_response(payload, false),
            Err(err) => {
                tracing::debug!(tool = name, code = %err.code, message = %err.message, "tool call failed");
                tool_call_response(err.to_value(), true)
            }
        })
    }

    async fn execute_tool(
        &self,
        tool: ToolId,
        args: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        match tool {
            ToolId::Syntax => self.tool_syntax(args),
            ToolId::Examples => self.tool_examples(args),
            ToolId::Docs => self.tool_docs(args),
            ToolId::BestPractices => Ok(json!({ "items": knowledge::best_practices() })),
            ToolId::Pitfalls => Ok(json!({ "items": knowledge::pitfalls() })),
            ToolId::Workflow => self.tool_workflow(args),
            ToolId::ResourceTree => self.tool_resource_tree(args).await,
            ToolId::PathToId => self.tool_path_to_id(args).await,
            ToolId::PathDetail => self.tool_path_detail(args).await,
            ToolId::ApiDetail => self.tool_api_detail(args).await,
            ToolId::Call => self.tool_call(args).await,
            ToolId::Meta => self.tool_meta(),
        }
    }

    fn tool_syntax(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let topic = required_string(args, "topic")?;
        // Content is English-only; the locale is accepted for compatibility.
        let _locale = arg_string(args, "locale", "en")?;
        let entry = knowledge::syntax_entry(&topic).ok_or_else(|| {
            ToolError::new(codes::NOT_FOUND, format!("No syntax topic named '{topic}'"))
                .with_detail(json!({ "available_topics": knowledge::syntax_topics() }))
        })?;
        Ok(json!({
            "topic": entry.topic,
            "title": entry.title,
            "summary": entry.summary,
            "sections": entry.sections,
            "doc": entry.source_doc,
        }))
    }

    fn tool_examples(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let kind = required_string(args, "kind")?;
        let keyword = optional_string(args, "keyword")?;
        if !knowledge::example_kinds().contains(&kind.as_str()) {
            return Err(ToolError::new(
                codes::NOT_FOUND,
                format!("No example kind named '{kind}'"),
            )
            .with_detail(json!({ "available_kinds": knowledge::example_kinds() })));
        }
        let examples = knowledge::examples(&kind, keyword.as_deref());
        Ok(json!({ "kind": kind, "examples": examples }))
    }

    fn tool_docs(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let index_only = arg_bool(args, "index_only", true)?;
        let mut payload = json!({ "index": knowledge::docs_index() });
        if !index_only {
            payload["summary"] = json!(knowledge::docs_summary());
        }
        Ok(payload)
    }

    fn tool_workflow(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let task = required_string(args, "task")?;
        let with_commands = arg_bool(args, "with_commands", false)?;
        let workflow = knowledge::workflow(&task).ok_or_else(|| {
            ToolError::new(codes::NOT_FOUND, format!("No workflow named '{task}'"))
                .with_detail(json!({ "available_tasks": knowledge::workflow_tasks() }))
        })?;
        let mut payload = json!({
            "task": workflow.task,
            "description": workflow.description,
            "steps": workflow.steps,
        });
        if with_commands {
            payload["commands"] = json!(workflow.commands);
        }
        Ok(payload)
    }

    async fn tool_resource_tree(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let kind = arg_string(args, "kind", "api")?;
        if kind != "all" && !RESOURCE_KINDS.contains(&kind.as_str()) {
            return Err(ToolError::validation(
                format!("kind must be one of: all, {}", RESOURCE_KINDS.join(", ")),
                "kind",
            ));
        }
        let format = arg_string(args, "format", "tree")?;
        if !TREE_FORMATS.contains(&format.as_str()) {
            return Err(ToolError::validation(
                format!("format must be one of: {}", TREE_FORMATS.join(", ")),
                "format",
            ));
        }
        let search_pattern = optional_string(args, "search")?;
        let search = search_pattern
            .as_deref()
            .map(compile_search)
            .transpose()?;
        let depth = optional_depth(args)?;

        let data = self.fetch_resource_tree().await?;
        let forest = build_forest(&data, &kind, search.as_ref(), depth);

        let mut payload = json!({
            "format": format,
            "kind": kind,
            "filters_applied": {
                "search": search_pattern,
                "depth": depth,
            },
        });
        match format.as_str() {
            "tree" => payload["tree"] = json!(forest),
            "list" => payload["nodes"] = json!(flatten_forest(&forest)),
            _ => payload["csv"] = json!(render_csv(&flatten_forest(&forest))),
        }
        Ok(payload)
    }

    async fn tool_path_to_id(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let path = required_string(args, "path")?;
        let fuzzy = arg_bool(args, "fuzzy", false)?;

        let rows = self.fetch_script_rows().await?;
        let matches = match_script_rows(&rows, &path, fuzzy);
        Ok(json!({
            "path": path,
            "matches": matches
                .into_iter()
                .map(|(row, score)| match_payload(row, score))
                .collect::<Vec<_>>(),
        }))
    }

    async fn tool_path_detail(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let path = required_string(args, "path")?;
        let fuzzy = arg_bool(args, "fuzzy", false)?;

        let rows = self.fetch_script_rows().await?;
        let matches = match_script_rows(&rows, &path, fuzzy);
        if matches.len() > MAX_PATH_DETAIL_MATCHES {
            tracing::debug!(
                total = matches.len(),
                kept = MAX_PATH_DETAIL_MATCHES,
                "truncating path_detail matches"
            );
        }

        // One detail fetch per match, sequentially.
        let mut results = Vec::new();
        for (row, score) in matches.into_iter().take(MAX_PATH_DETAIL_MATCHES) {
            let meta = match_payload(row, score);
            match self.fetch_file_detail(&row.id).await {
                Ok(detail) => results.push(json!({ "meta": meta, "detail": detail })),
                Err(err) => {
                    let envelope = err.to_value();
                    results.push(json!({ "meta": meta, "error": envelope["error"] }));
                }
            }
        }
        Ok(json!({
            "path": path,
            "fuzzy": fuzzy,
            "results": results,
        }))
    }

    async fn tool_api_detail(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let file_id = required_string(args, "file_id")?;
        let detail = self.fetch_file_detail(&file_id).await?;
        let field = |key: &str| {
            detail
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Ok(json!({
            "id": detail.get("id").and_then(Value::as_str).unwrap_or(&file_id),
            "name": field("name"),
            "path": field("path"),
            "method": field("method"),
            "script": field("script"),
            "meta_raw": detail,
        }))
    }

    async fn tool_call(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let method_raw = required_string(args, "method")?;
        let method = parse_http_method(&method_raw)?;
        let path = required_string(args, "path")?;
        let query = parse_query_pairs(args.get("params"))?;
        let body = args.get("data").cloned();
        let headers = parse_header_pairs(args.get("headers"))?;

        let response = self
            .client
            .request(method, &path, &query, body.as_ref(), &headers)
            .await?;
        Ok(response.to_value())
    }

    fn tool_meta(&self) -> Result<Value, ToolError> {
        Ok(json!({
            "system_prompt": knowledge::system_prompt(),
            "environment": {
                "server": {
                    "name": MCP_SERVER_NAME,
                    "version": env!("CARGO_PKG_VERSION"),
                    "protocol_version": MCP_PROTOCOL_VERSION,
                },
                "base_url": self.settings.base_url,
                "ws_url": self.settings.ws_url,
                "auth_enabled": self.settings.auth_enabled,
                "timeout_seconds": self.settings.timeout_seconds,
                "transport": self.settings.transport,
                "client_id": self.client.client_id(),
            },
        }))
    }

    async fn fetch_resource_tree(&self) -> Result<Value, ToolError> {
        let response = self
            .client
            .request(Method::GET, "/resource", &[], None, &[])
            .await?;
        unwrap_envelope(&response)
    }

    async fn fetch_file_detail(&self, file_id: &str) -> Result<Value, ToolError> {
        let response = self
            .client
            .request(
                Method::GET,
                &format!("/resource/file/{file_id}"),
                &[],
                None,
                &[],
            )
            .await?;
        if response.status == 404 {
            return Err(ToolError::new(
                codes::NOT_FOUND,
                format!("No script file with id '{file_id}'"),
            ));
        }
        let data = unwrap_envelope(&response)?;
        if data.is_null() {
            return Err(ToolError::new(
                codes::NOT_FOUND,
                format!("No script file with id '{file_id}'"),
            ));
        }
        Ok(data)
    }

    /// Flat script-file rows (method-bearing leaves of the api tree).
    async fn fetch_script_rows(&self) -> Result<Vec<ResourceRow>, ToolError> {
        let data = self.fetch_resource_tree().await?;
        let forest = build_forest(&data, "api", None, None);
        Ok(flatten_forest(&forest)
            .into_iter()
            .filter(|row| !row.method.is_empty())
            .collect())
    }
}

/// Handle one JSON-RPC message (or batch) for the HTTP transport. Each
/// request builds a fresh server; sessions are re-established lazily.
pub async fn handle_http_jsonrpc(settings: &MagicApiSettings, incoming: Value) -> Vec<Value> {
    let server = McpServer::new(settings.clone());
    server.handle_incoming_message(incoming).await
}

fn tools_list_payload() -> Value {
    let tools: Vec<Value> = tool_definitions()
        .into_iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "inputSchema": tool.input_schema,
            })
        })
        .collect();
    json!({ "tools": tools })
}

fn tool_call_response(payload: Value, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": to_pretty_json(&payload) }],
        "isError": is_error,
    })
}

fn unwrap_envelope(response: &ApiResponse) -> Result<Value, ToolError> {
    response.envelope_data().map_err(ToolError::from)
}

// ---- resource tree shaping ----

#[derive(Clone, Debug, Serialize)]
struct TreeNode {
    id: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    path: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    children: Vec<TreeNode>,
}

#[derive(Clone, Debug, Serialize)]
struct ResourceRow {
    id: String,
    name: String,
    method: String,
    path: String,
    kind: String,
    depth: usize,
}

/// Kind → pruned roots. The nested tree is the single source: list and CSV
/// renderings flatten it, so every format describes the same node set.
fn build_forest(
    data: &Value,
    kind: &str,
    search: Option<&Regex>,
    depth: Option<u64>,
) -> BTreeMap<String, Vec<TreeNode>> {
    let mut forest = BTreeMap::new();
    for resource_kind in RESOURCE_KINDS {
        if kind != "all" && kind != resource_kind {
            continue;
        }
        let Some(children) = data
            .get(resource_kind)
            .and_then(|root| root.get("children"))
            .and_then(Value::as_array)
        else {
            continue;
        };
        let roots: Vec<TreeNode> = children
            .iter()
            .filter_map(|child| convert_node(child, "", 1, search, depth))
            .collect();
        forest.insert(resource_kind.to_string(), roots);
    }
    forest
}

fn convert_node(
    value: &Value,
    prefix: &str,
    level: u64,
    search: Option<&Regex>,
    depth: Option<u64>,
) -> Option<TreeNode> {
    if depth.is_some_and(|limit| level > limit) {
        return None;
    }
    let node = value.get("node")?;
    let name = node.get("name").and_then(Value::as_str).unwrap_or_default();
    let segment = node.get("path").and_then(Value::as_str).unwrap_or_default();
    let full_path = join_path(prefix, segment);
    let children: Vec<TreeNode> = value
        .get("children")
        .and_then(Value::as_array)
        .map(|children| {
            children
                .iter()
                .filter_map(|child| convert_node(child, &full_path, level + 1, search, depth))
                .collect()
        })
        .unwrap_or_default();

    // A search keeps matching nodes and the ancestors leading to them.
    let self_matches = match search {
        Some(regex) => regex.is_match(name) || regex.is_match(&full_path),
        None => true,
    };
    if !self_matches && children.is_empty() {
        return None;
    }

    Some(TreeNode {
        id: node
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        name: name.to_string(),
        method: node
            .get("method")
            .and_then(Value::as_str)
            .filter(|method| !method.is_empty())
            .map(str::to_string),
        path: full_path,
        children,
    })
}

fn flatten_forest(forest: &BTreeMap<String, Vec<TreeNode>>) -> Vec<ResourceRow> {
    let mut rows = Vec::new();
    for (kind, roots) in forest {
        for root in roots {
            flatten_node(root, kind, 1, &mut rows);
        }
    }
    rows
}

fn flatten_node(node: &TreeNode, kind: &str, depth: usize, rows: &mut Vec<ResourceRow>) {
    rows.push(ResourceRow {
        id: node.id.clone(),
        name: node.name.clone(),
        method: node.method.clone().unwrap_or_default(),
        path: node.path.clone(),
        kind: kind.to_string(),
        depth,
    });
    for child in &node.children {
        flatten_node(child, kind, depth + 1, rows);
    }
}

fn render_csv(rows: &[ResourceRow]) -> String {
    let mut csv = String::from(CSV_HEADER);
    for row in rows {
        csv.push('\n');
        csv.push_str(
            &[
                csv_escape(&row.id),
                csv_escape(&row.name),
                csv_escape(&row.method),
                csv_escape(&row.path),
                csv_escape(&row.kind),
            ]
            .join(","),
        );
    }
    csv
}

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn join_path(prefix: &str, segment: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let segment = segment.trim_matches('/');
    match (prefix.is_empty(), segment.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{segment}"),
        (false, true) => format!("/{prefix}"),
        (false, false) => format!("/{prefix}/{segment}"),
    }
}

fn compile_search(pattern: &str) -> Result<Regex, ToolError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| ToolError::validation(format!("Invalid search pattern: {e}"), "search"))
}

// ---- path matching ----

fn normalize_match_key(path: &str) -> String {
    path.trim().trim_matches('/').to_ascii_lowercase()
}

/// Exact mode compares normalized paths; fuzzy mode keeps substring hits
/// ranked by similarity to the query.
fn match_script_rows<'a>(
    rows: &'a [ResourceRow],
    query: &str,
    fuzzy: bool,
) -> Vec<(&'a ResourceRow, f64)> {
    let target = normalize_match_key(query);
    let mut matches: Vec<(&ResourceRow, f64)> = rows
        .iter()
        .filter_map(|row| {
            let key = normalize_match_key(&row.path);
            if fuzzy {
                key.contains(&target)
                    .then(|| (row, strsim::jaro_winkler(&key, &target)))
            } else {
                (key == target).then_some((row, 1.0))
            }
        })
        .collect();
    matches.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.path.cmp(&b.0.path))
    });
    matches
}

fn match_payload(row: &ResourceRow, score: f64) -> Value {
    json!({
        "id": row.id,
        "name": row.name,
        "method": row.method,
        "path": row.path,
        "score": score,
    })
}

// ---- argument helpers ----

fn required_string(args: &Map<String, Value>, key: &str) -> Result<String, ToolError> {
    match args.get(key) {
        Some(Value::String(value)) if !value.trim().is_empty() => Ok(value.clone()),
        Some(Value::String(_)) => Err(ToolError::validation(
            format!("'{key}' must not be empty"),
            key,
        )),
        Some(_) => Err(ToolError::validation(
            format!("'{key}' must be a string"),
            key,
        )),
        None => Err(ToolError::validation(
            format!("Missing required field '{key}'"),
            key,
        )),
    }
}

fn optional_string(args: &Map<String, Value>, key: &str) -> Result<Option<String>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(ToolError::validation(
            format!("'{key}' must be a string"),
            key,
        )),
    }
}

fn arg_string(args: &Map<String, Value>, key: &str, default: &str) -> Result<String, ToolError> {
    Ok(optional_string(args, key)?.unwrap_or_else(|| default.to_string()))
}

fn arg_bool(args: &Map<String, Value>, key: &str, default: bool) -> Result<bool, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(value)) => Ok(*value),
        Some(_) => Err(ToolError::validation(
            format!("'{key}' must be a boolean"),
            key,
        )),
    }
}

fn optional_depth(args: &Map<String, Value>) -> Result<Option<u64>, ToolError> {
    match args.get("depth") {
        None | Some(Value::Null) => Ok(None),
        Some(value) => match value.as_u64() {
            Some(depth) if depth >= 1 => Ok(Some(depth)),
            _ => Err(ToolError::validation(
                "'depth' must be a positive integer",
                "depth",
            )),
        },
    }
}

fn parse_http_method(raw: &str) -> Result<Method, ToolError> {
    match raw.to_ascii_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "PATCH" => Ok(Method::PATCH),
        "DELETE" => Ok(Method::DELETE),
        "HEAD" => Ok(Method::HEAD),
        "OPTIONS" => Ok(Method::OPTIONS),
        other => Err(ToolError::validation(
            format!("Unsupported HTTP method '{other}'"),
            "method",
        )),
    }
}

/// Query parameters: object map of scalars, or `[{key, value}]` entries.
fn parse_query_pairs(value: Option<&Value>) -> Result<Vec<(String, String)>, ToolError> {
    let mut pairs = Vec::new();
    match value {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => {
            for (key, value) in map {
                pairs.push((key.clone(), scalar_to_string(value, "params")?));
            }
        }
        Some(Value::Array(entries)) => {
            for entry in entries {
                let (Some(key), Some(value)) = (entry.get("key"), entry.get("value")) else {
                    return Err(ToolError::validation(
                        "'params' entries must have 'key' and 'value'",
                        "params",
                    ));
                };
                let key = key.as_str().ok_or_else(|| {
                    ToolError::validation("'params' entry keys must be strings", "params")
                })?;
                pairs.push((key.to_string(), scalar_to_string(value, "params")?));
            }
        }
        Some(_) => {
            return Err(ToolError::validation(
                "'params' must be an object or an array of {key, value} entries",
                "params",
            ));
        }
    }
    Ok(pairs)
}

fn parse_header_pairs(value: Option<&Value>) -> Result<Vec<(String, String)>, ToolError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Object(map)) => {
            let mut pairs = Vec::new();
            for (key, value) in map {
                let value = value.as_str().ok_or_else(|| {
                    ToolError::validation("'headers' values must be strings", "headers")
                })?;
                pairs.push((key.clone(), value.to_string()));
            }
            Ok(pairs)
        }
        Some(_) => Err(ToolError::validation(
            "'headers' must be an object of string values",
            "headers",
        )),
    }
}

fn scalar_to_string(value: &Value, field: &str) -> Result<String, ToolError> {
    match value {
        Value::String(text) => Ok(text.clone()),
        Value::Number(number) => Ok(number.to_string()),
        Value::Bool(flag) => Ok(flag.to_string()),
        _ => Err(ToolError::validation(
            format!("'{field}' values must be strings, numbers, or booleans"),
            field,
        )),
    }
}

// ---- JSON-RPC plumbing ----

fn success_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

fn error_response(id: Value, error: RpcError) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": error.code,
            "message": error.message,
        },
    })
}

async fn read_framed_json<R>(reader: &mut BufReader<R>) -> Result<Option<Value>, std::io::Error>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            if content_length.is_none() {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Unexpected EOF while reading MCP headers",
            ));
        }

        if line == "\r\n" || line == "\n" {
            break;
        }

        let line = line.trim_end_matches(['\r', '\n']);
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                let parsed = value.trim().parse::<usize>().map_err(|_| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "Invalid Content-Length header",
                    )
                })?;
                content_length = Some(parsed);
            }
        }
    }

    let content_length = content_length.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Missing Content-Length header",
        )
    })?;
    let mut payload = vec![0_u8; content_length];
    reader.read_exact(&mut payload).await?;

    let json: Value = serde_json::from_slice(&payload).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Invalid JSON payload: {e}"),
        )
    })?;
    Ok(Some(json))
}

async fn write_framed_json<W>(writer: &mut W, value: &Value) -> Result<(), std::io::Error>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(value).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to serialize JSON: {e}"),
        )
    })?;
    let header = format!(
        "Content-Length: {}\r\nContent-Type: application/json\r\n\r\n",
        body.len()
    );
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

fn to_pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_settings(base_url: String) -> MagicApiSettings {
        MagicApiSettings {
            base_url,
            auth_enabled: false,
            ..MagicApiSettings::default()
        }
    }

    fn offline_server() -> McpServer {
        // Nothing listens on port 9; knowledge tools never touch it.
        McpServer::new(test_settings("http://127.0.0.1:9".to_string()))
    }

    fn fixture_tree() -> Value {
        json!({
            "api": {
                "node": { "id": "0", "name": "root", "path": "" },
                "children": [
                    {
                        "node": { "id": "g1", "name": "order", "path": "/order" },
                        "children": [
                            { "node": { "id": "f1", "name": "create order", "path": "/create", "method": "POST" }, "children": [] },
                            { "node": { "id": "f2", "name": "order detail", "path": "/detail", "method": "GET" }, "children": [] }
                        ]
                    },
                    {
                        "node": { "id": "g2", "name": "user", "path": "/user" },
                        "children": [
                            { "node": { "id": "f3", "name": "list users", "path": "/list", "method": "GET" }, "children": [] }
                        ]
                    }
                ]
            },
            "function": {
                "node": { "id": "0", "name": "root", "path": "" },
                "children": [
                    { "node": { "id": "fn1", "name": "sum", "path": "/sum" }, "children": [] }
                ]
            }
        })
    }

    async fn mock_service_with_tree() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/resource"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 1,
                "message": "success",
                "data": fixture_tree(),
            })))
            .mount(&server)
            .await;
        server
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn tool_definitions_cover_every_tool_id() {
        let definitions = tool_definitions();
        assert_eq!(definitions.len(), ToolId::ALL.len());
        for tool in ToolId::ALL {
            assert!(
                definitions.iter().any(|def| def.name == tool.name()),
                "missing definition for {}",
                tool.name()
            );
            assert_eq!(ToolId::from_name(tool.name()), Some(tool));
        }
        assert_eq!(ToolId::from_name("magicapi_unknown"), None);
    }

    #[test]
    fn initialize_payload_reports_protocol_and_server() {
        let server = offline_server();
        let payload = server.initialize_payload();
        assert_eq!(payload["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert_eq!(payload["serverInfo"]["name"], MCP_SERVER_NAME);
        assert!(
            payload["instructions"]
                .as_str()
                .is_some_and(|text| text.contains("#{ }"))
        );
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected_with_not_implemented() {
        let server = offline_server();
        let response = server
            .handle_tools_call(json!({ "name": "magicapi_nope", "arguments": {} }))
            .await
            .expect("tools/call itself succeeds");
        assert_eq!(response["isError"], true);
        let text = response["content"][0]["text"].as_str().unwrap_or_default();
        assert!(text.contains(codes::NOT_IMPLEMENTED));
    }

    #[tokio::test]
    async fn missing_required_parameter_is_validation_error() {
        let server = offline_server();
        let err = server
            .execute_tool(ToolId::Syntax, &Map::new())
            .await
            .expect_err("missing topic must fail");
        assert_eq!(err.code, codes::VALIDATION_ERROR);

        let err = server
            .execute_tool(
                ToolId::Call,
                &args(json!({ "method": "FETCH", "path": "/x" })),
            )
            .await
            .expect_err("bad method must fail");
        assert_eq!(err.code, codes::VALIDATION_ERROR);
    }

    #[tokio::test]
    async fn syntax_db_documents_hash_placeholders() {
        let server = offline_server();
        let payload = server
            .execute_tool(ToolId::Syntax, &args(json!({ "topic": "db" })))
            .await
            .expect("db topic exists");
        let sections = payload["sections"].as_object().expect("sections object");
        let placeholder_section = sections
            .get("parameter_placeholders")
            .and_then(Value::as_str)
            .expect("placeholder guidance present");
        assert!(placeholder_section.contains("#{ }"));
        assert!(placeholder_section.contains("${ }"));
    }

    #[tokio::test]
    async fn unknown_topic_lists_alternatives() {
        let server = offline_server();
        let err = server
            .execute_tool(ToolId::Syntax, &args(json!({ "topic": "nope" })))
            .await
            .expect_err("unknown topic must fail");
        assert_eq!(err.code, codes::NOT_FOUND);
        let detail = err.detail.expect("detail present");
        assert!(detail["available_topics"].as_array().is_some());
    }

    #[tokio::test]
    async fn docs_summary_is_gated_by_index_only() {
        let server = offline_server();
        let index_only = server
            .execute_tool(ToolId::Docs, &Map::new())
            .await
            .expect("docs");
        assert!(index_only.get("summary").is_none());

        let full = server
            .execute_tool(ToolId::Docs, &args(json!({ "index_only": false })))
            .await
            .expect("docs");
        assert!(full["summary"].as_str().is_some());
    }

    #[tokio::test]
    async fn workflow_commands_are_opt_in() {
        let server = offline_server();
        let bare = server
            .execute_tool(ToolId::Workflow, &args(json!({ "task": "debug_api" })))
            .await
            .expect("workflow");
        assert!(bare.get("commands").is_none());
        assert!(
            bare["steps"]
                .as_array()
                .is_some_and(|steps| !steps.is_empty())
        );

        let with_commands = server
            .execute_tool(
                ToolId::Workflow,
                &args(json!({ "task": "debug_api", "with_commands": true })),
            )
            .await
            .expect("workflow");
        assert!(with_commands["commands"].as_array().is_some());
    }

    #[tokio::test]
    async fn resource_tree_rejects_bad_filters() {
        let server = offline_server();
        for bad in [
            json!({ "kind": "widget" }),
            json!({ "format": "xml" }),
            json!({ "depth": 0 }),
            json!({ "search": "(" }),
        ] {
            let err = server
                .execute_tool(ToolId::ResourceTree, &args(bad.clone()))
                .await
                .expect_err("invalid filter must fail before any network call");
            assert_eq!(err.code, codes::VALIDATION_ERROR, "case {bad}");
        }
    }

    #[tokio::test]
    async fn resource_tree_csv_and_tree_describe_the_same_nodes() {
        let service = mock_service_with_tree().await;
        let server = McpServer::new(test_settings(service.uri()));

        let tree = server
            .execute_tool(
                ToolId::ResourceTree,
                &args(json!({ "kind": "api", "format": "tree" })),
            )
            .await
            .expect("tree format");
        let csv = server
            .execute_tool(
                ToolId::ResourceTree,
                &args(json!({ "kind": "api", "format": "csv" })),
            )
            .await
            .expect("csv format");

        let mut tree_ids = BTreeSet::new();
        collect_ids(&tree["tree"]["api"], &mut tree_ids);

        let csv_text = csv["csv"].as_str().expect("csv string");
        let mut lines = csv_text.lines();
        assert_eq!(lines.next(), Some(CSV_HEADER));
        let csv_ids: BTreeSet<String> = lines
            .map(|line| line.split(',').next().unwrap_or_default().to_string())
            .collect();

        assert_eq!(tree_ids, csv_ids);
        assert!(tree_ids.contains("f1"));
        assert!(tree_ids.contains("g2"));
    }

    fn collect_ids(nodes: &Value, out: &mut BTreeSet<String>) {
        let Some(nodes) = nodes.as_array() else {
            return;
        };
        for node in nodes {
            if let Some(id) = node["id"].as_str() {
                out.insert(id.to_string());
            }
            collect_ids(&node["children"], out);
        }
    }

    #[tokio::test]
    async fn resource_tree_search_keeps_matches_and_ancestors() {
        let service = mock_service_with_tree().await;
        let server = McpServer::new(test_settings(service.uri()));

        let payload = server
            .execute_tool(
                ToolId::ResourceTree,
                &args(json!({ "kind": "api", "format": "list", "search": "create" })),
            )
            .await
            .expect("filtered list");
        let nodes = payload["nodes"].as_array().expect("nodes array");
        let ids: Vec<&str> = nodes
            .iter()
            .filter_map(|node| node["id"].as_str())
            .collect();
        // The matching file plus the group leading to it; nothing else.
        assert_eq!(ids, vec!["g1", "f1"]);
    }

    #[tokio::test]
    async fn path_to_id_exact_and_fuzzy_and_empty() {
        let service = mock_service_with_tree().await;
        let server = McpServer::new(test_settings(service.uri()));

        let exact = server
            .execute_tool(ToolId::PathToId, &args(json!({ "path": "/order/create" })))
            .await
            .expect("exact match");
        let matches = exact["matches"].as_array().expect("matches");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0]["id"], "f1");

        let fuzzy = server
            .execute_tool(
                ToolId::PathToId,
                &args(json!({ "path": "create", "fuzzy": true })),
            )
            .await
            .expect("fuzzy match");
        let matches = fuzzy["matches"].as_array().expect("matches");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0]["id"], "f1");

        let none = server
            .execute_tool(
                ToolId::PathToId,
                &args(json!({ "path": "/no/such/path", "fuzzy": true })),
            )
            .await
            .expect("no match is still success");
        assert_eq!(none["matches"].as_array().map(Vec::len), Some(0));
    }

    #[tokio::test]
    async fn path_detail_attaches_script_detail_per_match() {
        let service = mock_service_with_tree().await;
        Mock::given(method("GET"))
            .and(path("/resource/file/f1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 1,
                "data": {
                    "id": "f1",
                    "name": "create order",
                    "path": "/order/create",
                    "method": "POST",
                    "script": "return db.insert('insert into orders(id) values(#{body.id})');"
                }
            })))
            .mount(&service)
            .await;
        let server = McpServer::new(test_settings(service.uri()));

        let payload = server
            .execute_tool(ToolId::PathDetail, &args(json!({ "path": "/order/create" })))
            .await
            .expect("path detail");
        let results = payload["results"].as_array().expect("results");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["meta"]["id"], "f1");
        assert!(
            results[0]["detail"]["script"]
                .as_str()
                .is_some_and(|script| script.contains("#{body.id}"))
        );
    }

    #[tokio::test]
    async fn api_detail_maps_missing_file_to_error_envelope() {
        let service = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/resource/file/missing"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0,
                "message": "file not found"
            })))
            .mount(&service)
            .await;
        let server = McpServer::new(test_settings(service.uri()));

        let err = server
            .execute_tool(ToolId::ApiDetail, &args(json!({ "file_id": "missing" })))
            .await
            .expect_err("missing file must fail");
        assert!(err.message.contains("file not found"));
    }

    #[tokio::test]
    async fn call_returns_status_headers_body_verbatim() {
        let service = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/order/create"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .mount(&service)
            .await;
        let server = McpServer::new(test_settings(service.uri()));

        let payload = server
            .execute_tool(
                ToolId::Call,
                &args(json!({
                    "method": "POST",
                    "path": "/order/create",
                    "data": { "id": 1 }
                })),
            )
            .await
            .expect("call");
        assert_eq!(payload["status"], 200);
        assert_eq!(payload["body"], json!({ "ok": true }));
        assert!(payload["headers"].as_object().is_some());
    }

    #[tokio::test]
    async fn network_failure_surfaces_as_error_envelope_not_crash() {
        let server = offline_server();
        let response = server
            .handle_tools_call(json!({
                "name": "magicapi_resource_tree",
                "arguments": { "kind": "api" }
            }))
            .await
            .expect("tools/call itself succeeds");
        assert_eq!(response["isError"], true);
        let text = response["content"][0]["text"].as_str().unwrap_or_default();
        assert!(text.contains(codes::NETWORK_ERROR));
    }

    #[tokio::test]
    async fn meta_exposes_prompt_and_environment() {
        let server = offline_server();
        let payload = server
            .execute_tool(ToolId::Meta, &Map::new())
            .await
            .expect("meta");
        assert!(
            payload["system_prompt"]
                .as_str()
                .is_some_and(|prompt| prompt.contains("#{ }"))
        );
        assert_eq!(payload["environment"]["server"]["name"], MCP_SERVER_NAME);
        assert_eq!(payload["environment"]["transport"], "stdio");
    }

    #[test]
    fn join_path_handles_slashes_and_empty_segments() {
        assert_eq!(join_path("", "/order"), "/order");
        assert_eq!(join_path("/order", "/create"), "/order/create");
        assert_eq!(join_path("order/", "create"), "/order/create");
        assert_eq!(join_path("", ""), "/");
        assert_eq!(join_path("/order", ""), "/order");
    }

    #[test]
    fn csv_escaping_quotes_only_when_needed() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn query_pairs_accept_object_and_array_forms() {
        let from_object =
            parse_query_pairs(Some(&json!({ "keyword": "order", "limit": 10 }))).expect("object");
        assert_eq!(from_object.len(), 2);

        let from_array = parse_query_pairs(Some(&json!([
            { "key": "keyword", "value": "order" },
            { "key": "limit", "value": 10 }
        ])))
        .expect("array");
        assert_eq!(from_array.len(), 2);

        assert!(parse_query_pairs(Some(&json!("nope"))).is_err());
    }

    #[tokio::test]
    async fn jsonrpc_envelope_rules_are_enforced() {
        let server = offline_server();

        let bad_version = server
            .handle_incoming_message(json!({ "jsonrpc": "1.0", "id": 1, "method": "ping" }))
            .await;
        assert_eq!(bad_version[0]["error"]["code"], -32600);

        let unknown_method = server
            .handle_incoming_message(json!({ "jsonrpc": "2.0", "id": 2, "method": "shutdown" }))
            .await;
        assert_eq!(unknown_method[0]["error"]["code"], -32601);

        let notification = server
            .handle_incoming_message(
                json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }),
            )
            .await;
        assert!(notification.is_empty());

        let batch = server
            .handle_incoming_message(json!([
                { "jsonrpc": "2.0", "id": 3, "method": "ping" },
                { "jsonrpc": "2.0", "id": 4, "method": "tools/list" }
            ]))
            .await;
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0]["id"], 3);
        assert!(batch[1]["result"]["tools"].as_array().is_some());
    }

    #[tokio::test]
    async fn framed_json_round_trips() {
        let message = json!({ "jsonrpc": "2.0", "id": 1, "result": { "ok": true } });
        let mut buffer = Vec::new();
        write_framed_json(&mut buffer, &message)
            .await
            .expect("write");

        let mut reader = BufReader::new(buffer.as_slice());
        let decoded = read_framed_json(&mut reader)
            .await
            .expect("read")
            .expect("one message");
        assert_eq!(decoded, message);

        // Clean EOF between messages means the peer closed the channel.
        assert!(read_framed_json(&mut reader).await.expect("eof").is_none());
    }
}
