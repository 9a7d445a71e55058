use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use clap::Parser;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

use magicapi_core::settings::{MagicApiSettings, Transport};
use magicapi_mcp_runtime::{McpServer, handle_http_jsonrpc};

#[derive(Parser)]
#[command(
    name = "magicapi-mcp",
    version,
    about = "Magic-API assistant MCP server (stdio by default, HTTP optional)"
)]
struct Cli {
    /// Service base URL (overrides MAGIC_API_BASE_URL)
    #[arg(long)]
    base_url: Option<String>,

    /// Skip login even when credentials are configured
    #[arg(long)]
    no_auth: bool,

    /// Serve JSON-RPC over HTTP instead of stdio
    #[arg(long)]
    http: bool,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut settings = MagicApiSettings::from_env();
    if let Some(base_url) = cli.base_url {
        settings.base_url = base_url.trim_end_matches('/').to_string();
    }
    if cli.no_auth {
        settings.auth_enabled = false;
    }
    if cli.http {
        settings.transport = Transport::Http;
    }

    init_tracing(&settings);

    let code = match settings.transport {
        Transport::Stdio => serve_stdio(settings).await,
        Transport::Http => serve_http(settings).await,
    };
    std::process::exit(code);
}

fn init_tracing(settings: &MagicApiSettings) {
    let filter =
        EnvFilter::try_new(&settings.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        // stdout carries the protocol; logs must stay on stderr
        .with_writer(std::io::stderr)
        .init();
}

async fn serve_stdio(settings: MagicApiSettings) -> i32 {
    let server = McpServer::new(settings);
    match server.serve_stdio().await {
        Ok(()) => 0,
        Err(err) => {
            let payload = json!({
                "error": "mcp_server_error",
                "message": err,
            });
            eprintln!(
                "{}",
                serde_json::to_string_pretty(&payload).unwrap_or_default()
            );
            1
        }
    }
}

async fn serve_http(settings: MagicApiSettings) -> i32 {
    let address = format!("{}:{}", settings.http_host, settings.http_port);
    let app = Router::new()
        .route("/mcp", post(mcp_post))
        .with_state(settings);

    let listener = match tokio::net::TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%address, %err, "failed to bind HTTP transport");
            return 1;
        }
    };
    tracing::info!(%address, "serving MCP over HTTP at /mcp");

    match axum::serve(listener, app).await {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!(%err, "HTTP transport failed");
            1
        }
    }
}

async fn mcp_post(
    State(settings): State<MagicApiSettings>,
    Json(incoming): Json<Value>,
) -> Json<Value> {
    let mut responses = handle_http_jsonrpc(&settings, incoming).await;
    // Single requests answer with a single object, batches with an array.
    Json(if responses.len() == 1 {
        responses.remove(0)
    } else {
        Value::Array(responses)
    })
}
