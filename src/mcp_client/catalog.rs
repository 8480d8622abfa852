//! Capability catalog: the tools and resources a session last listed.
//!
//! Provides:
//! - Tool lookup by name, resource lookup by URI
//! - Wholesale replacement on every successful listing
//! - A structural check of tool arguments against the advertised schema
//! - A compact summary for status output

use std::collections::HashMap;

use serde_json::Value;

use super::types::{ResourceDescriptor, ToolDescriptor};

/// Snapshot of one server's capabilities.
///
/// Descriptors are never edited in place. A new listing replaces the whole
/// set for its kind.
#[derive(Debug, Clone, Default)]
pub struct CapabilityCatalog {
    tools: HashMap<String, ToolDescriptor>,
    resources: HashMap<String, ResourceDescriptor>,
}

impl CapabilityCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every cached tool.
    pub fn replace_tools(&mut self, tools: Vec<ToolDescriptor>) {
        self.tools = tools.into_iter().map(|t| (t.name.clone(), t)).collect();
    }

    /// Replace every cached resource.
    pub fn replace_resources(&mut self, resources: Vec<ResourceDescriptor>) {
        self.resources = resources
            .into_iter()
            .map(|r| (r.uri.clone(), r))
            .collect();
    }

    pub fn tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    pub fn resource(&self, uri: &str) -> Option<&ResourceDescriptor> {
        self.resources.get(uri)
    }

    /// All tools, sorted by name.
    pub fn tools(&self) -> Vec<&ToolDescriptor> {
        let mut tools: Vec<_> = self.tools.values().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// All resources, sorted by URI.
    pub fn resources(&self) -> Vec<&ResourceDescriptor> {
        let mut resources: Vec<_> = self.resources.values().collect();
        resources.sort_by(|a, b| a.uri.cmp(&b.uri));
        resources
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools().into_iter().map(|t| t.name.as_str()).collect()
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.resources.is_empty()
    }

    /// Required top-level argument fields missing from `arguments`.
    ///
    /// Empty when the tool is unknown or declares no `required` list. Full
    /// schema validation is left to the server.
    pub fn missing_arguments(&self, tool_name: &str, arguments: &Value) -> Vec<String> {
        let Some(required) = self
            .tool(tool_name)
            .and_then(|t| t.input_schema.get("required"))
            .and_then(Value::as_array)
        else {
            return Vec::new();
        };

        let provided = arguments.as_object();
        required
            .iter()
            .filter_map(Value::as_str)
            .filter(|field| !provided.is_some_and(|obj| obj.contains_key(*field)))
            .map(str::to_string)
            .collect()
    }

    /// Counts plus tool names, for status output.
    pub fn summary(&self) -> Value {
        serde_json::json!({
            "tools": self.tool_count(),
            "resources": self.resource_count(),
            "toolNames": self.tool_names(),
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_tool(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: format!("Test tool: {name}"),
            input_schema: json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            }),
        }
    }

    fn sample_resource(uri: &str) -> ResourceDescriptor {
        ResourceDescriptor {
            uri: uri.to_string(),
            name: uri.rsplit('/').next().unwrap_or_default().to_string(),
            description: None,
            mime_type: Some("text/plain".into()),
        }
    }

    #[test]
    fn test_replace_and_lookup() {
        let mut catalog = CapabilityCatalog::new();
        assert!(catalog.is_empty());

        catalog.replace_tools(vec![sample_tool("read_file"), sample_tool("list_dir")]);
        catalog.replace_resources(vec![sample_resource("file:///tmp/a.txt")]);

        assert_eq!(catalog.tool_count(), 2);
        assert!(catalog.tool("read_file").is_some());
        assert!(catalog.tool("write_file").is_none());
        assert!(catalog.resource("file:///tmp/a.txt").is_some());
        assert_eq!(catalog.tool_names(), vec!["list_dir", "read_file"]);
    }

    #[test]
    fn test_replace_is_wholesale() {
        let mut catalog = CapabilityCatalog::new();
        catalog.replace_tools(vec![sample_tool("old")]);
        catalog.replace_tools(vec![sample_tool("new")]);

        assert!(catalog.tool("old").is_none());
        assert!(catalog.tool("new").is_some());

        catalog.replace_tools(Vec::new());
        assert_eq!(catalog.tool_count(), 0);
    }

    #[test]
    fn test_missing_arguments() {
        let mut catalog = CapabilityCatalog::new();
        catalog.replace_tools(vec![sample_tool("read_file")]);

        assert!(catalog
            .missing_arguments("read_file", &json!({"path": "/tmp"}))
            .is_empty());
        assert_eq!(
            catalog.missing_arguments("read_file", &json!({})),
            vec!["path".to_string()]
        );
        assert_eq!(
            catalog.missing_arguments("read_file", &Value::Null),
            vec!["path".to_string()]
        );
        assert!(catalog.missing_arguments("unknown", &json!({})).is_empty());
    }

    #[test]
    fn test_summary() {
        let mut catalog = CapabilityCatalog::new();
        catalog.replace_tools(vec![sample_tool("b"), sample_tool("a")]);

        let summary = catalog.summary();
        assert_eq!(summary["tools"], 2);
        assert_eq!(summary["resources"], 0);
        assert_eq!(summary["toolNames"], json!(["a", "b"]));
    }
}
