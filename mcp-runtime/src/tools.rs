//! Tool catalogue and the collection-independent parts of tool execution.
//!
//! List tools are data: a [`ListTool`] names an upstream [`Collection`] and
//! the filters it forwards. Every list tool shares the same pagination
//! arguments (`limit`, `get_all`, `starting_after`) and the same engine.

use std::time::Duration;

use instantly_core::profile::ClientProfile;
use instantly_core::result::{AggregateResult, RetrievalMode, StopReason};
use serde_json::{Map, Value, json};

use crate::args::{
    arg_optional_bool, arg_optional_i64, arg_optional_string, arg_optional_string_array,
    arg_starting_after, retrieval_mode_from_args,
};
use crate::assemble::{RetrievalFailure, assemble};
use crate::error::ToolError;
use crate::pagination::retrieve_all;
use crate::retry::RetryPolicy;
use crate::rpc::to_pretty_json;
use crate::upstream::{
    ACCOUNTS, CAMPAIGNS, Collection, EMAILS, LEAD_LISTS, LEADS, PageRequest, PageSource,
};

pub const STATUS_TOOL: &str = "instantly_mcp_status";

/// Floor for a single upstream request timeout.
const MIN_UPSTREAM_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    String,
    Integer,
    Boolean,
    StringArray,
}

/// A tool argument forwarded upstream as a list filter.
#[derive(Debug, Clone, Copy)]
pub struct Filter {
    pub arg: &'static str,
    /// Upstream parameter name, when it differs from `arg`.
    pub upstream: Option<&'static str>,
    pub kind: FilterKind,
    pub description: &'static str,
}

impl Filter {
    const fn new(arg: &'static str, kind: FilterKind, description: &'static str) -> Self {
        Self {
            arg,
            upstream: None,
            kind,
            description,
        }
    }

    const fn renamed(self, upstream: &'static str) -> Self {
        Self {
            upstream: Some(upstream),
            ..self
        }
    }

    fn upstream_name(&self) -> &'static str {
        self.upstream.unwrap_or(self.arg)
    }

    fn schema(&self) -> Value {
        let ty = match self.kind {
            FilterKind::String => json!({ "type": "string" }),
            FilterKind::Integer => json!({ "type": "integer" }),
            FilterKind::Boolean => json!({ "type": "boolean" }),
            FilterKind::StringArray => json!({ "type": "array", "items": { "type": "string" } }),
        };
        let mut schema = ty;
        schema["description"] = Value::String(self.description.to_string());
        schema
    }

    fn extract(&self, args: &Map<String, Value>) -> Result<Option<Value>, ToolError> {
        Ok(match self.kind {
            FilterKind::String => arg_optional_string(args, self.arg)?.map(Value::String),
            FilterKind::Integer => arg_optional_i64(args, self.arg)?.map(Value::from),
            FilterKind::Boolean => arg_optional_bool(args, self.arg)?.map(Value::Bool),
            FilterKind::StringArray => arg_optional_string_array(args, self.arg)?
                .filter(|items| !items.is_empty())
                .map(|items| Value::Array(items.into_iter().map(Value::String).collect())),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ListTool {
    pub name: &'static str,
    pub summary: &'static str,
    pub collection: Collection,
    pub filters: &'static [Filter],
}

pub const LIST_TOOLS: &[ListTool] = &[
    ListTool {
        name: "list_campaigns",
        summary: "List campaigns",
        collection: CAMPAIGNS,
        filters: &[
            Filter::new("search", FilterKind::String, "Match campaign names"),
            Filter::new(
                "status",
                FilterKind::Integer,
                "Campaign status code (0 draft, 1 active, 2 paused, 3 completed)",
            ),
            Filter::new("tag_ids", FilterKind::StringArray, "Only campaigns with these tags"),
        ],
    },
    ListTool {
        name: "list_accounts",
        summary: "List sending email accounts",
        collection: ACCOUNTS,
        filters: &[
            Filter::new("search", FilterKind::String, "Match account email addresses"),
            Filter::new("status", FilterKind::Integer, "Account status code"),
            Filter::new(
                "provider_code",
                FilterKind::Integer,
                "Provider code (1 custom IMAP/SMTP, 2 Google, 3 Microsoft, 4 AWS)",
            ),
            Filter::new("tag_ids", FilterKind::StringArray, "Only accounts with these tags"),
        ],
    },
    ListTool {
        name: "list_leads",
        summary: "List leads",
        collection: LEADS,
        filters: &[
            Filter::new("campaign_id", FilterKind::String, "Only leads in this campaign")
                .renamed("campaign"),
            Filter::new("list_id", FilterKind::String, "Only leads in this lead list"),
            Filter::new("search", FilterKind::String, "Match lead name or email"),
            Filter::new(
                "filter",
                FilterKind::String,
                "Lead segment filter, e.g. FILTER_VAL_CONTACTED",
            ),
        ],
    },
    ListTool {
        name: "list_emails",
        summary: "List sent and received emails",
        collection: EMAILS,
        filters: &[
            Filter::new("campaign_id", FilterKind::String, "Only emails of this campaign"),
            Filter::new("search", FilterKind::String, "Full-text search"),
            Filter::new("eaccount", FilterKind::String, "Only emails of this sending account"),
            Filter::new("lead", FilterKind::String, "Only emails exchanged with this lead email"),
            Filter::new("i_status", FilterKind::Integer, "Interest status code"),
            Filter::new(
                "email_type",
                FilterKind::String,
                "received, sent or manual",
            ),
        ],
    },
    ListTool {
        name: "list_lead_lists",
        summary: "List lead lists",
        collection: LEAD_LISTS,
        filters: &[
            Filter::new("search", FilterKind::String, "Match lead list names"),
            Filter::new(
                "has_enrichment_task",
                FilterKind::Boolean,
                "Only lists with (or without) an enrichment task",
            ),
        ],
    },
];

pub fn list_tool(name: &str) -> Option<&'static ListTool> {
    LIST_TOOLS.iter().find(|tool| tool.name == name)
}

/// A tool reading one upstream resource by id.
#[derive(Debug, Clone, Copy)]
pub struct GetTool {
    pub name: &'static str,
    pub description: &'static str,
    pub collection: &'static str,
    pub id_arg: &'static str,
    pub id_description: &'static str,
}

pub const GET_TOOLS: &[GetTool] = &[
    GetTool {
        name: "get_campaign",
        description: "Fetch one campaign with its schedule and sequences.",
        collection: "campaigns",
        id_arg: "campaign_id",
        id_description: "Campaign id",
    },
    GetTool {
        name: "get_account",
        description: "Fetch one sending account and its warmup/health settings.",
        collection: "accounts",
        id_arg: "email",
        id_description: "Account email address",
    },
    GetTool {
        name: "get_lead",
        description: "Fetch one lead.",
        collection: "leads",
        id_arg: "lead_id",
        id_description: "Lead id",
    },
    GetTool {
        name: "get_email",
        description: "Fetch one email.",
        collection: "emails",
        id_arg: "email_id",
        id_description: "Email id",
    },
];

pub fn get_tool(name: &str) -> Option<&'static GetTool> {
    GET_TOOLS.iter().find(|tool| tool.name == name)
}

pub const CAMPAIGN_ANALYTICS_TOOL: &str = "get_campaign_analytics";

fn list_tool_description(tool: &ListTool) -> String {
    format!(
        "{}. Returns one page by default (limit 1-100). Set get_all=true (or limit=\"all\") to \
         retrieve every record within this client's time budget; if the budget runs out the result \
         has pagination.has_more=true and a next_cursor to pass back as starting_after with the same filters.",
        tool.summary
    )
}

fn list_tool_schema(tool: &ListTool) -> Value {
    let mut properties = Map::new();
    for filter in tool.filters {
        properties.insert(filter.arg.to_string(), filter.schema());
    }
    properties.insert(
        "limit".to_string(),
        json!({
            "description": "Page size 1-100, or \"all\" / a number above 100 for a complete retrieval",
            "oneOf": [
                { "type": "integer", "minimum": 1 },
                { "type": "string" }
            ]
        }),
    );
    properties.insert(
        "get_all".to_string(),
        json!({
            "type": "boolean",
            "default": false,
            "description": "Retrieve all pages within the client's time budget"
        }),
    );
    properties.insert(
        "starting_after".to_string(),
        json!({
            "type": "string",
            "description": "Resume cursor: pagination.next_cursor of a previous call with identical filters"
        }),
    );
    json!({
        "type": "object",
        "properties": properties
    })
}

pub fn tool_definitions() -> Vec<ToolDefinition> {
    let mut tools: Vec<ToolDefinition> = LIST_TOOLS
        .iter()
        .map(|tool| ToolDefinition {
            name: tool.name,
            description: list_tool_description(tool),
            input_schema: list_tool_schema(tool),
        })
        .collect();

    tools.extend(GET_TOOLS.iter().map(|tool| ToolDefinition {
        name: tool.name,
        description: tool.description.to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                tool.id_arg: { "type": "string", "description": tool.id_description }
            },
            "required": [tool.id_arg]
        }),
    }));

    tools.push(ToolDefinition {
        name: CAMPAIGN_ANALYTICS_TOOL,
        description: "Campaign analytics (sent, opened, replied, bounced) for one campaign or all campaigns, optionally within a date range.".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "campaign_id": { "type": "string", "description": "Restrict to one campaign" },
                "start_date": { "type": "string", "description": "YYYY-MM-DD" },
                "end_date": { "type": "string", "description": "YYYY-MM-DD" }
            }
        }),
    });

    tools.push(ToolDefinition {
        name: STATUS_TOOL,
        description: "Show server version, the detected client identity, its retrieval budget and the retry policy.".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {}
        }),
    });

    tools
}

/// Parses a list tool call into the retrieval mode and first page request.
pub fn list_request(
    tool: &ListTool,
    args: &Map<String, Value>,
) -> Result<(RetrievalMode, PageRequest), ToolError> {
    let mode = retrieval_mode_from_args(args)?;
    let starting_after = arg_starting_after(args)?;
    let mut filters = Map::new();
    for filter in tool.filters {
        if let Some(value) = filter.extract(args)? {
            filters.insert(filter.upstream_name().to_string(), value);
        }
    }
    let limit = match mode {
        RetrievalMode::SinglePage { limit } => limit,
        RetrievalMode::CompleteRetrieval => instantly_core::profile::MAX_PAGE_SIZE,
    };
    Ok((mode, PageRequest::new(limit, starting_after, filters)))
}

/// Runs the engine under the caller's budget. A single page is a one-page
/// budget at the requested size.
pub async fn run_list<S: PageSource>(
    source: &S,
    retry: &RetryPolicy,
    profile: &ClientProfile,
    mode: RetrievalMode,
    request: PageRequest,
) -> Result<AggregateResult, ToolError> {
    let budget = match mode {
        RetrievalMode::SinglePage { limit } => profile.single_page(limit),
        RetrievalMode::CompleteRetrieval => profile.clone(),
    };
    let session = retrieve_all(source, retry, &budget, request).await;
    assemble(session, &budget, mode).map_err(failure_to_tool_error)
}

fn failure_to_tool_error(failure: RetrievalFailure) -> ToolError {
    let pages_fetched = failure.pages_fetched;
    let mut err = ToolError::from(failure.error);
    let mut details = err.details.take().unwrap_or_else(|| json!({}));
    details["pages_fetched"] = json!(pages_fetched);
    err.with_details(details)
}

/// Timeout for one upstream request: what remains of the hard budget after
/// the soft threshold, never below a floor.
pub fn upstream_request_timeout(profile: &ClientProfile) -> Duration {
    profile
        .hard_timeout()
        .saturating_sub(profile.soft_timeout())
        .max(MIN_UPSTREAM_REQUEST_TIMEOUT)
}

/// `partial` only when a complete retrieval was asked for and not delivered.
pub fn list_completion_status(mode: RetrievalMode, result: &AggregateResult) -> &'static str {
    match (mode, result.pagination.stopped_reason) {
        (_, StopReason::Error) => "partial",
        (RetrievalMode::CompleteRetrieval, reason) if reason.is_budget_stop() => "partial",
        _ => "complete",
    }
}

pub fn success_envelope(tool: &str, status: &str, data: Value) -> Value {
    json!({
        "status": status,
        "phase": "final",
        "tool": tool,
        "data": data
    })
}

pub fn error_envelope(tool: &str, err: &ToolError) -> Value {
    json!({
        "status": "error",
        "phase": "final",
        "tool": tool,
        "error": err.to_value()
    })
}

/// MCP `tools/call` result. The envelope is inlined as text as well, since
/// many clients only read the text content block.
pub fn build_tool_call_response(envelope: Value, is_error: bool) -> Value {
    let text = to_pretty_json(&envelope);
    if is_error {
        json!({
            "isError": true,
            "content": [{ "type": "text", "text": text }],
            "structuredContent": envelope
        })
    } else {
        json!({
            "content": [{ "type": "text", "text": text }],
            "structuredContent": envelope
        })
    }
}
