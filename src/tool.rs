//! Host-side tool catalogue.
//!
//! Tools are declared with [`ToolDefinition`], validated and normalized into
//! [`NormalizedTool`]s, and collected in a [`ToolRegistry`]. A tool with a
//! local source runs inside the sandbox; every other tool is called back on
//! the host through its [`ToolHandler`].

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{RelayError, Result};
use crate::router::{LOCAL_SERVER, REMOTE_SERVER};
use crate::transport::protocol::is_valid_tool_name;

/// Host implementation of a tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run the tool. An error becomes a failed `tool_result` whose message
    /// is the error's display form.
    async fn call(&self, args: Map<String, Value>) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn call(&self, args: Map<String, Value>) -> anyhow::Result<Value> {
        self(args).await
    }
}

/// JSON type of a parameter, used only for the catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Any,
}

impl ParamKind {
    /// Type as written in the catalogue signatures.
    const fn hint(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number | Self::Integer => "number",
            Self::Boolean => "boolean",
            Self::Array => "any[]",
            Self::Object => "object",
            Self::Any => "any",
        }
    }
}

/// One named argument of a tool. Arguments are not validated against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParamKind,
    #[serde(default)]
    pub description: String,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl Parameter {
    /// A parameter the caller must pass.
    pub fn required(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: String::new(),
            required: true,
            default: None,
        }
    }

    /// A parameter the caller may omit.
    pub fn optional(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind)
        }
    }

    /// Set the description shown in the catalogue.
    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Optional parameter with a default value.
    #[must_use]
    pub fn with_default(mut self, default: Value) -> Self {
        self.required = false;
        self.default = Some(default);
        self
    }
}

/// A tool as declared by the embedding application.
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Vec<Parameter>,
    handler: Option<Arc<dyn ToolHandler>>,
    local_source: Option<String>,
}

impl ToolDefinition {
    /// A tool executed on the host.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: impl ToolHandler + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
            handler: Some(Arc::new(handler)),
            local_source: None,
        }
    }

    /// A tool executed inside the sandbox from a function literal such as
    /// `({ a, b }) => a + b`.
    pub fn local(
        name: impl Into<String>,
        description: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
            handler: None,
            local_source: Some(source.into()),
        }
    }

    /// Append a parameter; declaration order is kept within the required
    /// and optional groups.
    #[must_use]
    pub fn param(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Validate and normalize the definition.
    pub fn normalize(self) -> Result<NormalizedTool> {
        if self.name.is_empty() {
            return Err(RelayError::tool(self.name, "Tool name is required"));
        }
        if !is_valid_tool_name(&self.name) {
            let message = format!(
                "Invalid tool name \"{}\": must start with a letter and contain only alphanumeric characters and underscores",
                self.name
            );
            return Err(RelayError::tool(self.name, message));
        }
        if self.description.trim().is_empty() {
            return Err(RelayError::tool(self.name, "Tool description is required"));
        }
        if self.description.chars().count() < 5 {
            return Err(RelayError::tool(
                self.name,
                "Tool description must be at least 5 characters",
            ));
        }

        Ok(NormalizedTool {
            name: to_snake_case(&self.name),
            description: self.description,
            parameters: self.parameters,
            handler: self.handler,
            local_source: self.local_source,
        })
    }
}

impl fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("local", &self.local_source.is_some())
            .finish_non_exhaustive()
    }
}

/// A validated tool with a snake_case name.
#[derive(Clone)]
pub struct NormalizedTool {
    pub name: String,
    pub description: String,
    pub parameters: Vec<Parameter>,
    handler: Option<Arc<dyn ToolHandler>>,
    pub local_source: Option<String>,
}

impl NormalizedTool {
    /// Whether the tool runs inside the sandbox.
    pub const fn is_local(&self) -> bool {
        self.local_source.is_some()
    }

    /// Run the host implementation.
    pub async fn execute(&self, args: Map<String, Value>) -> anyhow::Result<Value> {
        match &self.handler {
            Some(handler) => handler.call(args).await,
            None => anyhow::bail!("Tool {} only runs inside the sandbox", self.name),
        }
    }

    fn qualified_name(&self) -> String {
        let server = if self.is_local() {
            LOCAL_SERVER
        } else {
            REMOTE_SERVER
        };
        format!("{server}.{}", self.name)
    }
}

impl fmt::Debug for NormalizedTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NormalizedTool")
            .field("name", &self.name)
            .field("parameters", &self.parameters)
            .field("local", &self.is_local())
            .finish_non_exhaustive()
    }
}

/// All tools available to one orchestrator, keyed by normalized name.
#[derive(Debug, Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, NormalizedTool>,
}

impl ToolRegistry {
    /// Normalize every definition. Fails on the first invalid definition or
    /// on two definitions that normalize to the same name.
    pub fn new(definitions: impl IntoIterator<Item = ToolDefinition>) -> Result<Self> {
        let mut tools = BTreeMap::new();
        for definition in definitions {
            let tool = definition.normalize()?;
            if tools.contains_key(&tool.name) {
                return Err(RelayError::Configuration(format!(
                    "Duplicate tool name: {}",
                    tool.name
                )));
            }
            tools.insert(tool.name.clone(), tool);
        }
        Ok(Self { tools })
    }

    /// Look up a tool by normalized name, local or not.
    pub fn get(&self, name: &str) -> Option<&NormalizedTool> {
        self.tools.get(name)
    }

    /// Look up a tool the sandbox may call back on the host.
    pub fn remote(&self, name: &str) -> Option<&NormalizedTool> {
        self.get(name).filter(|tool| !tool.is_local())
    }

    /// All tools in name order.
    pub fn tools(&self) -> impl Iterator<Item = &NormalizedTool> {
        self.tools.values()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Names to send as an `execute` message's `remoteTools`.
    pub fn remote_names(&self) -> Vec<String> {
        self.tools()
            .filter(|tool| !tool.is_local())
            .map(|tool| tool.name.clone())
            .collect()
    }

    /// Sources to send as an `execute` message's `localTools`.
    pub fn local_sources(&self) -> BTreeMap<String, String> {
        self.tools()
            .filter_map(|tool| {
                tool.local_source
                    .as_ref()
                    .map(|source| (tool.name.clone(), source.clone()))
            })
            .collect()
    }

    /// Catalogue documentation embedded in the code-generation prompt.
    pub fn catalogue_doc(&self) -> String {
        catalogue_doc(self.tools())
    }
}

/// `camelCase`, `PascalCase` and `kebab-case` to `snake_case`.
pub fn to_snake_case(name: &str) -> String {
    static PATTERNS: OnceLock<(Regex, Regex)> = OnceLock::new();
    let (acronym, boundary) = PATTERNS.get_or_init(|| {
        (
            Regex::new(r"([A-Z]+)([A-Z][a-z])").expect("valid regex"),
            Regex::new(r"([a-z\d])([A-Z])").expect("valid regex"),
        )
    });
    let name = acronym.replace_all(name, "${1}_${2}");
    let name = boundary.replace_all(&name, "${1}_${2}");
    name.replace('-', "_").to_lowercase()
}

/// Render the catalogue as commented call signatures in script syntax.
pub fn catalogue_doc<'a>(tools: impl IntoIterator<Item = &'a NormalizedTool>) -> String {
    let signatures: Vec<String> = tools.into_iter().map(signature).collect();
    if signatures.is_empty() {
        return "// No tools available".to_string();
    }
    let mut out = vec![
        "// Available tools".to_string(),
        "// Call these as: const result = await call(\"server.tool_name\", { args })".to_string(),
        String::new(),
    ];
    out.extend(signatures);
    out.join("\n")
}

fn signature(tool: &NormalizedTool) -> String {
    let mut lines = vec!["/**".to_string(), format!(" * {}", tool.description)];
    if !tool.parameters.is_empty() {
        lines.push(" *".to_string());
        for p in &tool.parameters {
            let description = if p.description.is_empty() {
                "No description"
            } else {
                &p.description
            };
            let optional = if p.required { "" } else { " (optional)" };
            let default = p
                .default
                .as_ref()
                .map(|d| format!(" (default: {d})"))
                .unwrap_or_default();
            lines.push(format!(
                " * @param {} - {description}{optional}{default}",
                p.name
            ));
        }
    }
    lines.push(" */".to_string());

    // Required parameters first, like a function signature.
    let (required, optional): (Vec<&Parameter>, Vec<&Parameter>) =
        tool.parameters.iter().partition(|p| p.required);
    let fields: Vec<String> = required
        .iter()
        .map(|p| format!("{}: {}", p.name, p.kind.hint()))
        .chain(
            optional
                .iter()
                .map(|p| format!("{}?: {}", p.name, p.kind.hint())),
        )
        .collect();
    let args = if fields.is_empty() {
        String::new()
    } else {
        format!(", {{ {} }}", fields.join(", "))
    };
    lines.push(format!("call(\"{}\"{args})", tool.qualified_name()));
    lines.push(String::new());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn add(args: Map<String, Value>) -> anyhow::Result<Value> {
        let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
        let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
        Ok(json!(a + b))
    }

    #[test]
    fn snake_case_conversion() {
        for (input, expected) in [
            ("camelCase", "camel_case"),
            ("getUserById", "get_user_by_id"),
            ("parseJSON", "parse_json"),
            ("HTTPServer", "http_server"),
            ("getAPIKey", "get_api_key"),
            ("my-tool", "my_tool"),
            ("get_user_by_id", "get_user_by_id"),
            ("API", "api"),
            ("parse_XMLData", "parse_xml_data"),
            ("getV2Users", "get_v2_users"),
            ("oauth2Token", "oauth2_token"),
            ("", ""),
        ] {
            assert_eq!(to_snake_case(input), expected, "{input}");
        }
    }

    #[test]
    fn validation_rules() {
        let err = ToolDefinition::new("123bad", "A valid description", add)
            .normalize()
            .unwrap_err();
        assert!(err.to_string().starts_with("Invalid tool name"));

        let err = ToolDefinition::new("has-hyphen", "A valid description", add)
            .normalize()
            .unwrap_err();
        assert!(err.to_string().starts_with("Invalid tool name"));

        let err = ToolDefinition::new("", "A valid description", add)
            .normalize()
            .unwrap_err();
        assert_eq!(err.to_string(), "Tool name is required");

        let err = ToolDefinition::new("ok", "", add).normalize().unwrap_err();
        assert_eq!(err.to_string(), "Tool description is required");

        let err = ToolDefinition::new("ok", "tiny", add).normalize().unwrap_err();
        assert_eq!(err.code(), "TOOL_ERROR");
    }

    #[tokio::test]
    async fn normalized_tool_executes_handler() {
        let tool = ToolDefinition::new("addNumbers", "Add two numbers", add)
            .param(Parameter::required("a", ParamKind::Number))
            .param(Parameter::required("b", ParamKind::Number))
            .normalize()
            .unwrap();
        assert_eq!(tool.name, "add_numbers");
        assert!(!tool.is_local());
        let args = json!({"a": 2, "b": 3}).as_object().cloned().unwrap();
        assert_eq!(tool.execute(args).await.unwrap(), json!(5));
    }

    #[test]
    fn registry_partitions_remote_and_local() {
        let registry = ToolRegistry::new([
            ToolDefinition::new("getUsers", "List all users", add),
            ToolDefinition::local("double", "Double a number", "({ n }) => n * 2"),
        ])
        .unwrap();
        assert_eq!(registry.remote_names(), vec!["get_users".to_string()]);
        assert_eq!(
            registry.local_sources(),
            BTreeMap::from([("double".to_string(), "({ n }) => n * 2".to_string())])
        );
        assert!(registry.remote("double").is_none());
        assert!(registry.remote("get_users").is_some());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = ToolRegistry::new([
            ToolDefinition::new("getUsers", "List all users", add),
            ToolDefinition::new("get_users", "List all users", add),
        ])
        .unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn catalogue_renders_signatures() {
        let registry = ToolRegistry::new([
            ToolDefinition::new("search", "Search users by name", add)
                .param(Parameter::required("query", ParamKind::String).describe("Search query"))
                .param(Parameter::optional("limit", ParamKind::Integer).with_default(json!(10))),
            ToolDefinition::local("double", "Double a number", "({ n }) => n * 2")
                .param(Parameter::required("n", ParamKind::Number)),
        ])
        .unwrap();
        let doc = registry.catalogue_doc();
        assert!(doc.starts_with("// Available tools"));
        assert!(doc.contains("call(\"host.search\", { query: string, limit?: number })"));
        assert!(doc.contains(" * @param query - Search query"));
        assert!(doc.contains(" * @param limit - No description (optional) (default: 10)"));
        assert!(doc.contains("call(\"local.double\", { n: number })"));
    }

    #[test]
    fn empty_catalogue() {
        assert_eq!(ToolRegistry::default().catalogue_doc(), "// No tools available");
    }
}
