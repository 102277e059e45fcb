//! MCP server exposing Instantly list and read endpoints as tools.
//!
//! One [`McpServer`] serves one client: the stdio transport keeps it for the
//! life of the process, the HTTP transport builds one per request.

use clap::{Args, Subcommand};
use instantly_core::error::codes;
use instantly_core::profile::{ClientBudgetRegistry, ClientProfile, UNKNOWN_CLIENT};
use serde_json::{Map, Value, json};
use tokio::io::{self, BufReader};
use uuid::Uuid;

pub mod args;
pub mod assemble;
pub mod error;
pub mod pagination;
pub mod retry;
pub mod rpc;
pub mod tools;
pub mod upstream;
mod util;

pub use util::{budget_overrides_from_env, config_path, resolve_api_key, resolve_api_url};

use args::{arg_optional_string, required_string};
use error::ToolError;
use retry::{DEFAULT_MAX_ATTEMPTS, RetryPolicy};
use rpc::{
    Frame, FrameMode, RpcError, error_response, read_frame, success_response, to_pretty_json,
    write_frame,
};
use tools::{
    CAMPAIGN_ANALYTICS_TOOL, GetTool, ListTool, STATUS_TOOL, build_tool_call_response,
    error_envelope, get_tool, list_completion_status, list_request, list_tool, run_list,
    success_envelope, tool_definitions, upstream_request_timeout,
};
use upstream::{CollectionSource, InstantlyApi};
use util::{API_KEY_ENV, client};

pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
pub const MCP_SERVER_NAME: &str = "instantly-mcp";
pub const DEFAULT_API_URL: &str = "https://api.instantly.ai/api/v2";

#[derive(Subcommand)]
pub enum McpCommands {
    /// Run the Instantly MCP server over stdio
    Serve(McpServeArgs),
    /// Print the client budget table, or the profile a client name resolves to
    Profiles(McpProfilesArgs),
}

#[derive(Args, Clone, Debug)]
pub struct McpServeArgs {
    /// Instantly API key (otherwise ~/.config/instantly-mcp/config.json)
    #[arg(long, env = "INSTANTLY_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
    /// Force the client identity used to pick a retrieval budget
    #[arg(long, env = "INSTANTLY_MCP_CLIENT")]
    pub client: Option<String>,
    /// Attempts per upstream request, including the first (clamped to 3-5)
    #[arg(long, env = "INSTANTLY_MCP_MAX_RETRY_ATTEMPTS", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub max_retry_attempts: u32,
}

#[derive(Args, Clone, Debug)]
pub struct McpProfilesArgs {
    /// Client name to resolve (as sent in clientInfo.name or x-mcp-client)
    #[arg(long)]
    pub client: Option<String>,
}

pub async fn run(api_url: &str, command: McpCommands) -> i32 {
    match command {
        McpCommands::Serve(args) => {
            let mut server = McpServer::new(RuntimeConfig::from_serve_args(api_url, &args));
            match server.serve_stdio().await {
                Ok(()) => 0,
                Err(err) => {
                    tracing::error!(event = "mcp_server_error", error = %err, "MCP server stopped");
                    let payload = json!({
                        "error": "mcp_server_error",
                        "message": err,
                    });
                    eprintln!("{}", to_pretty_json(&payload));
                    1
                }
            }
        }
        McpCommands::Profiles(args) => {
            let registry = ClientBudgetRegistry::builtin().with_overrides(budget_overrides_from_env());
            let report = match args.client {
                Some(client) => json!({
                    "client": client,
                    "profile": registry.resolve(Some(&client)),
                }),
                None => profiles_report(&registry),
            };
            println!("{}", to_pretty_json(&report));
            0
        }
    }
}

fn profiles_report(registry: &ClientBudgetRegistry) -> Value {
    let rules: Vec<Value> = registry
        .rules()
        .iter()
        .map(|rule| {
            json!({
                "patterns": rule.patterns,
                "profile": rule.profile,
            })
        })
        .collect();
    json!({
        "rules": rules,
        "fallback": registry.most_conservative(),
    })
}

/// Process-wide settings shared by every server instance.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    /// Overrides any identity the client announces.
    pub forced_client: Option<String>,
    pub retry: RetryPolicy,
    pub registry: ClientBudgetRegistry,
}

impl RuntimeConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            api_key: None,
            forced_client: None,
            retry: RetryPolicy::default(),
            registry: ClientBudgetRegistry::builtin(),
        }
    }

    pub fn from_serve_args(api_url: &str, args: &McpServeArgs) -> Self {
        Self {
            api_url: api_url.to_string(),
            api_key: resolve_api_key(args.api_key.as_deref()),
            forced_client: args
                .client
                .as_deref()
                .map(str::trim)
                .filter(|client| !client.is_empty())
                .map(str::to_string),
            retry: RetryPolicy::new(args.max_retry_attempts),
            registry: ClientBudgetRegistry::builtin().with_overrides(budget_overrides_from_env()),
        }
    }
}

/// Per-request inputs of the HTTP transport.
#[derive(Clone, Debug, Default)]
pub struct HttpMcpRequestConfig {
    /// Key sent by the caller; the server's own key is used when absent.
    pub api_key: Option<String>,
    /// Identity from `x-mcp-client` or `user-agent`.
    pub client_hint: Option<String>,
}

pub async fn handle_http_jsonrpc(
    config: &RuntimeConfig,
    request: HttpMcpRequestConfig,
    incoming: Value,
) -> Vec<Value> {
    let mut server = McpServer::new(config.clone());
    server.session_id = format!("http-{}", Uuid::now_v7());
    if let Some(api_key) = request.api_key.filter(|key| !key.trim().is_empty()) {
        server.api_key = Some(api_key);
    }
    server.client_hint = request.client_hint;
    server.handle_incoming_message(incoming).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdentitySource {
    Forced,
    Initialize,
    Header,
    Unknown,
}

impl IdentitySource {
    fn as_str(self) -> &'static str {
        match self {
            IdentitySource::Forced => "forced",
            IdentitySource::Initialize => "initialize",
            IdentitySource::Header => "header",
            IdentitySource::Unknown => "unknown",
        }
    }
}

pub struct McpServer {
    config: RuntimeConfig,
    api: InstantlyApi,
    api_key: Option<String>,
    client_info: Option<String>,
    client_hint: Option<String>,
    session_id: String,
    started_at: chrono::DateTime<chrono::Utc>,
}

impl McpServer {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            api: InstantlyApi::new(client(), config.api_url.clone()),
            api_key: config.api_key.clone(),
            config,
            client_info: None,
            client_hint: None,
            session_id: format!("stdio-{}", Uuid::now_v7()),
            started_at: chrono::Utc::now(),
        }
    }

    async fn serve_stdio(&mut self) -> Result<(), String> {
        tracing::info!(
            event = "mcp_server_started",
            server = MCP_SERVER_NAME,
            version = env!("CARGO_PKG_VERSION"),
            api_url = %self.config.api_url,
            api_key_configured = self.api_key.is_some(),
            session_id = %self.session_id,
            "Serving MCP over stdio"
        );

        let stdin = io::stdin();
        let mut reader = BufReader::new(stdin);
        let mut stdout = io::stdout();
        let mut mode = FrameMode::default();

        loop {
            let frame = read_frame(&mut reader)
                .await
                .map_err(|e| format!("Failed to read MCP message: {e}"))?;
            let responses = match frame {
                None => break,
                Some(Frame::Message(incoming, frame_mode)) => {
                    mode = frame_mode;
                    self.handle_incoming_message(incoming).await
                }
                Some(Frame::Invalid(message, frame_mode)) => {
                    mode = frame_mode;
                    tracing::warn!(event = "mcp_parse_error", error = %message, "Discarding unparseable message");
                    vec![error_response(Value::Null, RpcError::parse_error(message))]
                }
            };
            for response in responses {
                write_frame(&mut stdout, &response, mode)
                    .await
                    .map_err(|e| format!("Failed to write MCP response: {e}"))?;
            }
        }

        tracing::info!(event = "mcp_server_stopped", session_id = %self.session_id, "stdin closed");
        Ok(())
    }

    pub async fn handle_incoming_message(&mut self, incoming: Value) -> Vec<Value> {
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

    async fn handle_single_message(&mut self, incoming: Value) -> Option<Value> {
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
            // a client response; this server never issues requests
            return None;
        };

        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        match obj.get("id").cloned() {
            Some(id) => {
                let result = self.handle_request(method, params).await;
                Some(match result {
                    Ok(payload) => success_response(id, payload),
                    Err(err) => error_response(id, err),
                })
            }
            None => {
                tracing::debug!(event = "mcp_notification", method, "Notification ignored");
                None
            }
        }
    }

    async fn handle_request(&mut self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(self.initialize(&params)),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.tools_list_payload()),
            "tools/call" => self.handle_tools_call(params).await,
            "resources/list" => Ok(json!({ "resources": [] })),
            "prompts/list" => Ok(json!({ "prompts": [] })),
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    fn initialize(&mut self, params: &Value) -> Value {
        self.client_info = params
            .pointer("/clientInfo/name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string);
        let (identity, source) = self.client_identity();
        let profile = self.resolve_profile();
        tracing::info!(
            event = "mcp_client_identified",
            session_id = %self.session_id,
            identity = identity.unwrap_or(UNKNOWN_CLIENT),
            source = source.as_str(),
            profile = %profile.name,
            max_pages = profile.max_pages,
            soft_timeout_ms = profile.soft_timeout_ms,
            "Resolved client budget"
        );

        let instructions = format!(
            "List tools return one page by default. Pass get_all=true to retrieve a whole collection; \
             retrieval stops after {} page(s) or {} ms for this client (profile '{}'). When \
             pagination.has_more is true, call the same tool again with starting_after set to \
             pagination.next_cursor and the same filters.",
            profile.max_pages, profile.soft_timeout_ms, profile.name
        );
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
            "instructions": instructions,
            "capabilityStatus": {
                "client_identity": identity,
                "identity_source": source.as_str(),
                "profile": profile
            }
        })
    }

    fn tools_list_payload(&self) -> Value {
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

        let started = std::time::Instant::now();
        let result = self.execute_tool(name, &args).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(match result {
            Ok((status, data)) => {
                tracing::info!(
                    event = "tool_call_finished",
                    session_id = %self.session_id,
                    tool = name,
                    status,
                    elapsed_ms,
                    "Tool call finished"
                );
                build_tool_call_response(success_envelope(name, status, data), false)
            }
            Err(err) => {
                tracing::warn!(
                    event = "tool_call_failed",
                    session_id = %self.session_id,
                    tool = name,
                    error_code = %err.code,
                    error = %err.message,
                    elapsed_ms,
                    "Tool call failed"
                );
                build_tool_call_response(error_envelope(name, &err), true)
            }
        })
    }

    async fn execute_tool(
        &self,
        name: &str,
        args: &Map<String, Value>,
    ) -> Result<(&'static str, Value), ToolError> {
        if name == STATUS_TOOL {
            return Ok(("complete", self.status_payload()));
        }
        if let Some(tool) = list_tool(name) {
            return self.tool_list(tool, args).await;
        }
        if let Some(tool) = get_tool(name) {
            return self.tool_get(tool, args).await.map(|data| ("complete", data));
        }
        if name == CAMPAIGN_ANALYTICS_TOOL {
            return self
                .tool_campaign_analytics(args)
                .await
                .map(|data| ("complete", data));
        }
        Err(ToolError::new(codes::UNKNOWN_TOOL, format!("Unknown tool '{name}'"))
            .with_field("name")
            .with_docs_hint("Call tools/list for the available tools."))
    }

    async fn tool_list(
        &self,
        tool: &ListTool,
        args: &Map<String, Value>,
    ) -> Result<(&'static str, Value), ToolError> {
        let (mode, request) = list_request(tool, args)?;
        let api_key = self.require_upstream()?;
        let profile = self.resolve_profile();
        let source = CollectionSource::new(
            &self.api,
            tool.collection,
            api_key,
            upstream_request_timeout(&profile),
        );
        let result = run_list(&source, &self.config.retry, &profile, mode, request).await?;
        let status = list_completion_status(mode, &result);
        let data = serde_json::to_value(&result).map_err(|e| {
            ToolError::new(
                codes::INTERNAL_ERROR,
                format!("Failed to serialize result: {e}"),
            )
        })?;
        Ok((status, data))
    }

    async fn tool_get(&self, tool: &GetTool, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let id = required_string(args, tool.id_arg)?;
        let segments: &[&str] = &[tool.collection, id.as_str()];
        self.get_with_retry(segments, &[]).await
    }

    async fn tool_campaign_analytics(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let mut query = Vec::new();
        if let Some(campaign_id) = arg_optional_string(args, "campaign_id")? {
            query.push(("id".to_string(), campaign_id));
        }
        for key in ["start_date", "end_date"] {
            if let Some(date) = arg_optional_string(args, key)? {
                if chrono::NaiveDate::parse_from_str(&date, "%Y-%m-%d").is_err() {
                    return Err(ToolError::validation(
                        key,
                        format!("'{key}' must be a date in YYYY-MM-DD format"),
                    ));
                }
                query.push((key.to_string(), date));
            }
        }
        self.get_with_retry(&["campaigns", "analytics"], &query).await
    }

    async fn get_with_retry(
        &self,
        segments: &[&str],
        query: &[(String, String)],
    ) -> Result<Value, ToolError> {
        let api_key = self.require_upstream()?;
        let profile = self.resolve_profile();
        let timeout = Some(upstream_request_timeout(&profile));
        let deadline = tokio::time::Instant::now() + profile.soft_timeout();
        let api = &self.api;
        self.config
            .retry
            .fetch_page_with_retry(deadline, move || api.get_json(segments, query, api_key, timeout))
            .await
            .map_err(ToolError::from)
    }

    /// The API key to use, after checking the base URL is usable.
    fn require_upstream(&self) -> Result<&str, ToolError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            ToolError::new(codes::AUTH_MISSING, "No Instantly API key configured").with_docs_hint(
                format!(
                    "Set {API_KEY_ENV}, pass --api-key, or send 'Authorization: Bearer <key>' to the HTTP endpoint."
                ),
            )
        })?;
        self.api.url_for(&[]).map_err(|e| {
            ToolError::new(codes::INVALID_URL, e.to_string())
                .with_field("api_url")
                .with_docs_hint("Set INSTANTLY_API_URL to an absolute http(s) URL.")
        })?;
        Ok(api_key)
    }

    fn client_identity(&self) -> (Option<&str>, IdentitySource) {
        if let Some(forced) = self.config.forced_client.as_deref() {
            return (Some(forced), IdentitySource::Forced);
        }
        if let Some(name) = self.client_info.as_deref() {
            return (Some(name), IdentitySource::Initialize);
        }
        if let Some(hint) = self.client_hint.as_deref() {
            return (Some(hint), IdentitySource::Header);
        }
        (None, IdentitySource::Unknown)
    }

    fn resolve_profile(&self) -> ClientProfile {
        let (identity, _) = self.client_identity();
        self.config.registry.resolve(identity)
    }

    fn status_payload(&self) -> Value {
        let (identity, source) = self.client_identity();
        json!({
            "server": {
                "name": MCP_SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": MCP_PROTOCOL_VERSION,
                "started_at": self.started_at,
                "session_id": self.session_id,
            },
            "upstream": {
                "api_url": self.config.api_url,
                "api_key_configured": self.api_key.is_some(),
            },
            "client": {
                "identity": identity,
                "identity_source": source.as_str(),
            },
            "profile": self.resolve_profile(),
            "retry_policy": self.config.retry,
        })
    }
}
