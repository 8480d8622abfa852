//! A small MCP server speaking line-delimited JSON-RPC on stdio.
//!
//! Used by the integration tests and for trying the CLI without a real
//! server. Requests are handled concurrently; replies go out through a
//! single writer so frames never interleave.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use mcp_stdio::logging::{init_tracing, LogOptions};
use mcp_stdio::mcp_client::types::{error_codes, methods, JsonRpcError, JsonRpcResponse};

/// First line written to stderr, so callers can check stderr capture.
const STDERR_BANNER: &str = "mcp-stub-server: listening on stdio";

/// How the stub answers `initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum InitReply {
    /// Protocol version, capabilities and server info.
    Full,
    /// Only `{"tools": []}`.
    Minimal,
    /// A result that is not an object.
    Malformed,
    /// A JSON-RPC error.
    Error,
    /// A reply with neither `result` nor `error`.
    None,
    /// No reply at all.
    Silent,
}

#[derive(Debug, Parser)]
#[command(name = "mcp-stub-server", version, about = "Stub MCP server for tests and demos")]
struct Args {
    #[arg(long, value_enum, default_value_t = InitReply::Full)]
    init_reply: InitReply,

    /// Advertise no tools and no resources.
    #[arg(long)]
    empty: bool,

    /// Paginate listings with this many entries per page.
    #[arg(long)]
    page_size: Option<usize>,

    /// Mix non-protocol lines, stray replies and server requests into stdout.
    #[arg(long)]
    noise: bool,
}

type Reply = Result<Value, JsonRpcError>;

struct Stub {
    args: Args,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&LogOptions {
        default_filter: "mcp_stub_server=info,warn".into(),
        ..LogOptions::default()
    })?;
    eprintln!("{STDERR_BANNER}");

    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(write_lines(rx, args.noise));

    if args.noise {
        for line in [
            "stub server booting (this line is not JSON)".to_string(),
            json!({"jsonrpc": "2.0", "id": 999_999, "result": {"stray": true}}).to_string(),
            json!({"jsonrpc": "2.0", "method": "notifications/message", "params": {"level": "info"}}).to_string(),
            json!({"jsonrpc": "2.0", "id": "stub-ping", "method": "ping"}).to_string(),
        ] {
            let _ = tx.send(line);
        }
    }

    let stub = Arc::new(Stub { args });
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let frame: Value = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable request");
                let error = JsonRpcError::new(error_codes::PARSE_ERROR, e.to_string());
                if let Some(out) = encode(JsonRpcResponse::failure(Value::Null, error)) {
                    let _ = tx.send(out);
                }
                continue;
            }
        };

        let stub = Arc::clone(&stub);
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Some(out) = stub.handle(frame).await {
                let _ = tx.send(out);
            }
        });
    }

    tracing::info!("stdin closed, shutting down");
    drop(tx);
    writer.await?;
    Ok(())
}

/// The only task that touches stdout.
async fn write_lines(mut rx: mpsc::UnboundedReceiver<String>, noise: bool) {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = rx.recv().await {
        let mut out = String::new();
        if noise {
            out.push_str("# noise between frames\n\n");
        }
        out.push_str(&line);
        out.push('\n');
        if stdout.write_all(out.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
            break;
        }
    }
}

impl Stub {
    async fn handle(&self, frame: Value) -> Option<String> {
        // Replies to our own server-initiated requests carry no method.
        let method = frame.get("method")?.as_str()?.to_string();
        let Some(id) = frame.get("id").cloned() else {
            tracing::debug!(method, "notification");
            return None;
        };
        let params = frame.get("params").cloned().unwrap_or_else(|| json!({}));

        let reply = match method.as_str() {
            methods::INITIALIZE => return self.initialize(id),
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => Ok(self.page("tools", self.tools(), &params)),
            methods::RESOURCES_LIST => Ok(self.page("resources", self.resources(), &params)),
            methods::RESOURCES_READ => read_resource(&params),
            methods::TOOLS_CALL => call_tool(&params).await,
            other => Err(JsonRpcError::new(
                error_codes::METHOD_NOT_FOUND,
                format!("method not found: {other}"),
            )),
        };

        respond(id, reply)
    }

    fn initialize(&self, id: Value) -> Option<String> {
        let reply = match self.args.init_reply {
            InitReply::Full => Ok(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": { "tools": {}, "resources": {} },
                "serverInfo": { "name": "mcp-stub-server", "version": env!("CARGO_PKG_VERSION") },
            })),
            InitReply::Minimal => Ok(json!({ "tools": [] })),
            InitReply::Malformed => Ok(json!("not an initialize result")),
            InitReply::Error => Err(JsonRpcError::new(
                error_codes::INTERNAL_ERROR,
                "initialization refused",
            )),
            InitReply::None => return Some(json!({ "jsonrpc": "2.0", "id": id }).to_string()),
            InitReply::Silent => return None,
        };
        respond(id, reply)
    }

    fn tools(&self) -> Vec<Value> {
        if self.args.empty {
            return Vec::new();
        }
        vec![
            tool("echo", "Return the arguments as JSON text", json!([])),
            tool("text", "Return a plain-text greeting", json!([])),
            tool("slow", "Sleep for `ms` milliseconds, then answer", json!(["ms"])),
            tool("env", "Report an environment variable", json!(["name"])),
            tool("fail", "Report a tool-level failure", json!([])),
            tool("crash", "Exit the server without answering", json!([])),
        ]
    }

    fn resources(&self) -> Vec<Value> {
        if self.args.empty {
            return Vec::new();
        }
        vec![
            json!({ "uri": "stub://readme", "name": "readme", "mimeType": "text/markdown" }),
            json!({ "uri": "stub://empty", "name": "empty", "mimeType": "text/plain" }),
        ]
    }

    /// Slice `items` by the numeric cursor in `params`.
    fn page(&self, key: &str, items: Vec<Value>, params: &Value) -> Value {
        let Some(size) = self.args.page_size.filter(|n| *n > 0) else {
            return json!({ key: items });
        };

        let start = params
            .get("cursor")
            .and_then(Value::as_str)
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0)
            .min(items.len());
        let end = (start + size).min(items.len());

        let mut page = json!({ key: items[start..end] });
        if end < items.len() {
            page["nextCursor"] = json!(end.to_string());
        }
        page
    }
}

fn tool(name: &str, description: &str, required: Value) -> Value {
    json!({
        "name": name,
        "description": description,
        "inputSchema": { "type": "object", "required": required },
    })
}

fn text_content(text: impl Into<String>) -> Value {
    json!({ "content": [{ "type": "text", "text": text.into() }] })
}

fn read_resource(params: &Value) -> Reply {
    match params.get("uri").and_then(Value::as_str) {
        Some("stub://readme") => Ok(json!({
            "contents": [{
                "uri": "stub://readme",
                "mimeType": "text/markdown",
                "text": "# Stub server\n\nServes fixed content for tests.\n",
            }]
        })),
        Some("stub://empty") => Ok(json!({ "contents": [] })),
        _ => Err(JsonRpcError::new(error_codes::RESOURCE_NOT_FOUND, "not found")),
    }
}

async fn call_tool(params: &Value) -> Reply {
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    match name {
        "echo" => Ok(text_content(args.to_string())),
        "text" => {
            let who = args.get("name").and_then(Value::as_str).unwrap_or("world");
            Ok(text_content(format!("hello, {who}")))
        }
        "slow" => {
            let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(1_000);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            let tag = args.get("tag").cloned().unwrap_or(Value::Null);
            Ok(text_content(json!({ "slept_ms": ms, "tag": tag }).to_string()))
        }
        "env" => {
            let var = args.get("name").and_then(Value::as_str).unwrap_or_default();
            let value = std::env::var(var).ok();
            let mut result = text_content(value.clone().unwrap_or_default());
            result["structuredContent"] = json!({ "name": var, "value": value });
            Ok(result)
        }
        "fail" => {
            let reason = args.get("reason").and_then(Value::as_str).unwrap_or("requested");
            let mut result = text_content(format!("tool failed: {reason}"));
            result["isError"] = json!(true);
            Ok(result)
        }
        "crash" => {
            eprintln!("mcp-stub-server: crashing on request");
            std::process::exit(3);
        }
        other => Err(JsonRpcError::new(
            error_codes::INVALID_PARAMS,
            format!("unknown tool: {other}"),
        )),
    }
}

fn respond(id: Value, reply: Reply) -> Option<String> {
    match reply {
        Ok(result) => encode(JsonRpcResponse::success(id, result)),
        Err(error) => encode(JsonRpcResponse::failure(id, error)),
    }
}

fn encode(response: JsonRpcResponse) -> Option<String> {
    match serde_json::to_string(&response) {
        Ok(line) => Some(line),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode reply");
            None
        }
    }
}
