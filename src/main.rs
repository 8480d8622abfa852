//! mcp-stdio CLI entry point.
//!
//! Connects to one MCP server (from a config file or an explicit command
//! line), runs a single operation, prints the outcome envelope as JSON on
//! stdout and exits 0 on success, 1 on failure. Logs go to stderr or a file.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};

use mcp_stdio::logging::{init_tracing, LogOptions};
use mcp_stdio::mcp_client::config::{find_config_path, load_config};
use mcp_stdio::mcp_client::{
    ClientOptions, McpClient, McpError, McpServersConfig, Outcome, ServerConfig, Session,
};

// ─── CLI Definitions ─────────────────────────────────────────────────────────

/// Talk to an MCP server over stdio.
#[derive(Debug, Parser)]
#[command(name = "mcp-stdio", version)]
struct Cli {
    /// Config file with an `mcpServers` map (JSON or YAML).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Configured server to use. Optional when the config names only one.
    #[arg(long, short)]
    server: Option<String>,

    /// Launch this executable instead of a configured server.
    #[arg(long = "command", conflicts_with = "server")]
    spawn: Option<String>,

    /// Argument for `--command`. Repeatable.
    #[arg(long = "arg", requires = "spawn", allow_hyphen_values = true)]
    spawn_args: Vec<String>,

    /// KEY=VALUE environment overlay for `--command`. Repeatable.
    #[arg(long = "env", requires = "spawn", value_parser = parse_key_val)]
    spawn_env: Vec<(String, String)>,

    /// Per-request timeout in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Write logs to this file (rotated on startup) instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Log as JSON lines.
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    #[command(flatten)]
    Op(Operation),
    /// Connect to every configured server and report which come up.
    Check,
}

/// Operations that run against one server.
#[derive(Debug, Subcommand)]
enum Operation {
    /// Handshake result, process id and cached capabilities.
    Info,
    /// List tools.
    Tools,
    /// List resources.
    Resources,
    /// Read one resource.
    Read { uri: String },
    /// Invoke a tool.
    Call {
        name: String,
        /// Tool arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// Protocol-level liveness probe.
    Ping,
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))
}

// ─── Entry Point ─────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    init_tracing(&LogOptions {
        file: cli.log_file.clone(),
        json: cli.log_json,
        ..LogOptions::default()
    })?;

    let ok = match cli.action {
        Action::Check => check_all(&cli).await,
        Action::Op(ref op) => match resolve_target(&cli) {
            Ok((name, server, options)) => run_once(op, name, server, options).await,
            Err(e) => emit(&Outcome::<()>::from(Err(e))),
        },
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Connect, run one operation, close.
async fn run_once(op: &Operation, name: String, server: ServerConfig, options: ClientOptions) -> bool {
    let session = Session::new(name, server, options);

    let opened = session.open().await;
    if !opened.is_ok() {
        session.close().await;
        return emit(&opened);
    }

    let ok = match op {
        Operation::Info => emit(&Outcome::Success(describe(&session))),
        Operation::Tools => emit(&session.list_tools().await),
        Operation::Resources => emit(&session.list_resources().await),
        Operation::Read { uri } => emit(&session.read_resource(uri).await),
        Operation::Call { name, args } => match serde_json::from_str::<Value>(args) {
            Ok(arguments) => {
                warn_on_missing_arguments(&session, name, &arguments).await;
                emit(&session.call_tool(name, arguments).await)
            }
            Err(e) => emit(&Outcome::<()>::from(Err(McpError::Config {
                reason: format!("--args is not valid JSON: {e}"),
            }))),
        },
        Operation::Ping => emit(&session.ping().await),
    };

    session.close().await;
    ok
}

async fn warn_on_missing_arguments(session: &Session, tool: &str, arguments: &Value) {
    if !session.list_tools().await.is_ok() {
        return;
    }
    let missing = session.catalog().missing_arguments(tool, arguments);
    if !missing.is_empty() {
        tracing::warn!(tool, missing = ?missing, "tool arguments lack required fields");
    }
}

/// Open every configured server, report each, close them all.
async fn check_all(cli: &Cli) -> bool {
    let client = match load_named_config(cli) {
        Ok((_, config)) => McpClient::new(config),
        Err(e) => return emit(&Outcome::<()>::from(Err(e))),
    };

    let mut report = serde_json::Map::new();
    let mut all_ok = true;
    for (name, result) in client.connect_all().await {
        let entry = match result {
            Ok(session) => {
                let info = describe(&session);
                session.close().await;
                Outcome::Success(info)
            }
            Err(e) => {
                all_ok = false;
                Outcome::from(Err(e))
            }
        };
        report.insert(name, serde_json::to_value(&entry).unwrap_or(Value::Null));
    }

    emit(&Outcome::Success(Value::Object(report))) && all_ok
}

fn describe(session: &Session) -> Value {
    json!({
        "server": session.name(),
        "pid": session.pid(),
        "state": session.state(),
        "serverInfo": session.server_info(),
        "catalog": session.catalog().summary(),
    })
}

/// Print the envelope. Returns its `ok` flag.
fn emit<T: Serialize>(outcome: &Outcome<T>) -> bool {
    match serde_json::to_string_pretty(outcome) {
        Ok(text) => println!("{text}"),
        Err(e) => {
            tracing::error!(error = %e, "failed to render outcome");
            println!(r#"{{"ok": false, "kind": "ProtocolError", "message": "unrenderable outcome"}}"#);
            return false;
        }
    }
    outcome.is_ok()
}

// ─── Target Resolution ───────────────────────────────────────────────────────

fn resolve_target(cli: &Cli) -> Result<(String, ServerConfig, ClientOptions), McpError> {
    if let Some(ref command) = cli.spawn {
        let mut server = ServerConfig::new(command.clone()).with_args(cli.spawn_args.clone());
        for (key, value) in &cli.spawn_env {
            server = server.with_env(key.clone(), value.clone());
        }
        let name = PathBuf::from(command)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| command.clone());
        return Ok((name, server, with_timeout(ClientOptions::default(), cli)));
    }

    let (path, config) = load_named_config(cli)?;
    let name = match cli.server {
        Some(ref name) => name.clone(),
        None => {
            let names = config.server_names();
            match names.as_slice() {
                [only] => only.clone(),
                _ => {
                    return Err(McpError::Config {
                        reason: format!(
                            "{} configures {} servers; pick one with --server ({})",
                            path.display(),
                            names.len(),
                            names.join(", ")
                        ),
                    })
                }
            }
        }
    };

    let server = config.server(&name)?.clone();
    Ok((name, server, config.client))
}

fn load_named_config(cli: &Cli) -> Result<(PathBuf, McpServersConfig), McpError> {
    let path = match cli.config {
        Some(ref path) => path.clone(),
        None => {
            let cwd = std::env::current_dir().map_err(|e| McpError::Config {
                reason: format!("cannot determine working directory: {e}"),
            })?;
            find_config_path(&cwd)?
        }
    };

    let mut config = load_config(&path)?;
    config.client = with_timeout(config.client, cli);
    Ok((path, config))
}

fn with_timeout(mut options: ClientOptions, cli: &Cli) -> ClientOptions {
    if let Some(ms) = cli.timeout_ms {
        options.request_timeout_ms = ms;
    }
    options
}
