use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use instantly_mcp_runtime::{
    McpCommands, McpServeArgs, RuntimeConfig, resolve_api_url, run as run_mcp,
};

mod http;

#[derive(Parser)]
#[command(
    name = "instantly-mcp",
    version,
    about = "Instantly MCP server: paginated Instantly API tools with client-aware time budgets"
)]
struct Cli {
    /// Instantly API base URL [default: config file, then https://api.instantly.ai/api/v2]
    #[arg(long, env = "INSTANTLY_API_URL")]
    api_url: Option<String>,

    /// Log as JSON lines (stderr)
    #[arg(long, env = "INSTANTLY_MCP_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(flatten)]
    Mcp(McpCommands),
    /// Serve MCP over HTTP (POST /mcp)
    ServeHttp(ServeHttpArgs),
}

#[derive(Args, Clone, Debug)]
struct ServeHttpArgs {
    #[command(flatten)]
    serve: McpServeArgs,
    /// Listen address
    #[arg(long, env = "INSTANTLY_MCP_BIND", default_value = "127.0.0.1:8787")]
    bind: SocketAddr,
}

/// stdout carries the stdio protocol, so logs always go to stderr.
fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "instantly_mcp=info,instantly_mcp_runtime=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let api_url = resolve_api_url(cli.api_url.as_deref());

    let code = match cli.command {
        Command::Mcp(command) => run_mcp(&api_url, command).await,
        Command::ServeHttp(args) => {
            let config = RuntimeConfig::from_serve_args(&api_url, &args.serve);
            match http::serve(args.bind, config).await {
                Ok(()) => 0,
                Err(err) => {
                    tracing::error!(event = "http_server_error", error = %err, bind = %args.bind, "HTTP server failed");
                    1
                }
            }
        }
    };
    std::process::exit(code);
}
