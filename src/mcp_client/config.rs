//! Server and client configuration.
//!
//! Reads `mcp_config.json` (or a YAML equivalent), resolves `${VAR}`
//! references against the ambient environment, and hands out one
//! [`ServerConfig`] per named server.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::McpError;
use super::types::PROTOCOL_VERSION;

/// Environment variable pointing at an explicit config file.
pub const CONFIG_ENV_VAR: &str = "MCP_STDIO_CONFIG";

/// File name searched for when no explicit path is given.
pub const DEFAULT_CONFIG_FILE: &str = "mcp_config.json";

// ─── Public Types ────────────────────────────────────────────────────────────

/// How to launch one server process.
///
/// `env` is an overlay: the child inherits the ambient environment and these
/// entries win on key collision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the child. Relative paths are resolved against
    /// the config file's directory at load time.
    #[serde(default)]
    pub cwd: Option<String>,
}

impl ServerConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// `command arg1 arg2 ...`, for logs.
    pub fn display_command(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Client-side knobs shared by every session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Per-call deadline for ordinary requests.
    pub request_timeout_ms: u64,
    /// Deadline for the `initialize` exchange.
    ///
    /// Generous by default: servers that import heavy frameworks at startup
    /// can take tens of seconds to answer.
    pub init_timeout_ms: u64,
    /// How long `close` waits after asking the child to exit before killing it.
    pub shutdown_grace_ms: u64,
    /// Maximum concurrent in-flight requests. `None` is unlimited; `Some(1)`
    /// serializes calls one at a time.
    pub max_in_flight: Option<usize>,
    pub client_name: String,
    pub client_version: String,
    pub protocol_version: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            init_timeout_ms: 30_000,
            shutdown_grace_ms: 5_000,
            max_in_flight: None,
            client_name: env!("CARGO_PKG_NAME").to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }
}

impl ClientOptions {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServersConfig {
    #[serde(default, alias = "servers")]
    pub mcp_servers: HashMap<String, ServerConfig>,
    #[serde(default)]
    pub client: ClientOptions,
}

impl McpServersConfig {
    /// Look up a server by name.
    pub fn server(&self, name: &str) -> Result<&ServerConfig, McpError> {
        self.mcp_servers.get(name).ok_or_else(|| McpError::Config {
            reason: format!("no configuration for server '{name}'"),
        })
    }

    /// Configured server names, sorted.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.mcp_servers.keys().cloned().collect();
        names.sort();
        names
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Supported config file encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    /// Pick the format from a file extension; anything but `.yaml`/`.yml` is JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Json,
        }
    }
}

/// Locate the config file.
///
/// Checks `MCP_STDIO_CONFIG` first, then searches upward from `start` for
/// `mcp_config.json`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, McpError> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&explicit));
        if candidate.exists() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} points at a missing file");
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(DEFAULT_CONFIG_FILE);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(McpError::Config {
        reason: format!("could not find {DEFAULT_CONFIG_FILE}"),
    })
}

/// Load and parse a config file.
pub fn load_config(path: &Path) -> Result<McpServersConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::Config {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let mut config = parse_config(&raw, ConfigFormat::from_path(path))?;

    if let Some(base) = path.parent() {
        resolve_relative_cwds(&mut config, base);
    }

    tracing::info!(
        path = %path.display(),
        servers = ?config.server_names(),
        "loaded MCP server config"
    );

    Ok(config)
}

/// Parse config text after environment interpolation.
pub fn parse_config(raw: &str, format: ConfigFormat) -> Result<McpServersConfig, McpError> {
    let interpolated = interpolate_env_vars(raw);

    let parsed = match format {
        ConfigFormat::Json => serde_json::from_str(&interpolated).map_err(|e| e.to_string()),
        ConfigFormat::Yaml => serde_yaml::from_str(&interpolated).map_err(|e| e.to_string()),
    };

    parsed.map_err(|reason| McpError::Config {
        reason: format!("failed to parse config: {reason}"),
    })
}

fn resolve_relative_cwds(config: &mut McpServersConfig, base: &Path) {
    for server in config.mcp_servers.values_mut() {
        if let Some(ref cwd) = server.cwd {
            if !Path::new(cwd).is_absolute() {
                server.cwd = Some(base.join(cwd).to_string_lossy().into_owned());
            }
        }
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some(idx) = expr.find(":-") {
        let var_name = &expr[..idx];
        let default = &expr[idx + 2..];
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE_JSON: &str = r#"{
        "mcpServers": {
            "terraform": {
                "command": "python3.10",
                "args": ["-m", "awslabs.terraform_mcp_server.server"],
                "env": {"FASTMCP_LOG_LEVEL": "ERROR"}
            },
            "aws-diagram": {
                "command": "python",
                "args": ["-m", "aws_diagram_mcp_server"],
                "env": {"PYTHONPATH": "."},
                "cwd": "servers/diagram"
            }
        }
    }"#;

    #[test]
    fn test_parse_mcp_servers_json() {
        let config = parse_config(SAMPLE_JSON, ConfigFormat::Json).unwrap();
        assert_eq!(config.server_names(), vec!["aws-diagram", "terraform"]);

        let tf = config.server("terraform").unwrap();
        assert_eq!(tf.command, "python3.10");
        assert_eq!(tf.args, vec!["-m", "awslabs.terraform_mcp_server.server"]);
        assert_eq!(tf.env["FASTMCP_LOG_LEVEL"], "ERROR");
        assert_eq!(tf.cwd, None);

        // No client block → defaults
        assert_eq!(config.client, ClientOptions::default());
    }

    #[test]
    fn test_servers_alias_and_client_block() {
        let yaml = r#"
            servers:
              stub:
                command: mcp-stub-server
            client:
              request_timeout_ms: 1500
              max_in_flight: 1
        "#;
        let config = parse_config(yaml, ConfigFormat::Yaml).unwrap();
        assert_eq!(config.server("stub").unwrap().command, "mcp-stub-server");
        assert_eq!(config.client.request_timeout(), Duration::from_millis(1500));
        assert_eq!(config.client.max_in_flight, Some(1));
        // Unspecified fields keep their defaults
        assert_eq!(config.client.init_timeout_ms, 30_000);
        assert_eq!(config.client.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_unknown_server_is_config_error() {
        let config = parse_config(SAMPLE_JSON, ConfigFormat::Json).unwrap();
        let err = config.server("missing").unwrap_err();
        assert!(matches!(err, McpError::Config { .. }));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_malformed_config() {
        let err = parse_config("{\"mcpServers\": [", ConfigFormat::Json).unwrap_err();
        assert!(matches!(err, McpError::Config { .. }));
    }

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__MCP_STDIO_NONEXISTENT__");
        let input = "${__MCP_STDIO_NONEXISTENT__:-/fallback/path}";
        assert_eq!(interpolate_env_vars(input), "/fallback/path");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__MCP_STDIO_TEST_REGION__", "eu-west-1");
        let raw = r#"{"mcpServers": {"tf": {"command": "tf", "env": {"AWS_REGION": "${__MCP_STDIO_TEST_REGION__:-us-east-1}"}}}}"#;
        let config = parse_config(raw, ConfigFormat::Json).unwrap();
        assert_eq!(config.server("tf").unwrap().env["AWS_REGION"], "eu-west-1");
        std::env::remove_var("__MCP_STDIO_TEST_REGION__");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain text with no variables";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/servers");
        assert!(!result.starts_with('~'), "tilde should be expanded");
        assert!(result.ends_with("/servers"));
    }

    #[test]
    fn test_load_config_resolves_relative_cwd() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, SAMPLE_JSON).unwrap();

        let config = load_config(&path).unwrap();
        let cwd = config.server("aws-diagram").unwrap().cwd.clone().unwrap();
        assert!(Path::new(&cwd).is_absolute());
        assert!(cwd.ends_with("servers/diagram"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_config(Path::new("/nonexistent/mcp_config.json")).unwrap_err();
        assert!(matches!(err, McpError::Config { .. }));
    }

    #[test]
    fn test_find_config_walks_upward() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(DEFAULT_CONFIG_FILE), SAMPLE_JSON).unwrap();
        let nested = tmp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_path(&nested).unwrap();
        assert_eq!(found, tmp.path().join(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(ConfigFormat::from_path(Path::new("x.yaml")), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("x.yml")), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("mcp_config.json")), ConfigFormat::Json);
    }

    #[test]
    fn test_display_command() {
        let cfg = ServerConfig::new("python3").with_args(["-m", "server"]);
        assert_eq!(cfg.display_command(), "python3 -m server");
    }
}
