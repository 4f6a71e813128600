use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Separator between the connection name and a peer's raw identifier.
pub const NAMESPACE_SEPARATOR: char = '.';

/// `"{connection}.{raw}"`
pub fn add_prefix(connection_name: &str, raw: &str) -> String {
    format!("{connection_name}{NAMESPACE_SEPARATOR}{raw}")
}

/// Remove `"{connection}."` only when it sits at the very start of `name`.
/// Names carrying some other connection's prefix are returned unchanged.
pub fn strip_prefix<'a>(connection_name: &str, name: &'a str) -> &'a str {
    name.strip_prefix(connection_name)
        .and_then(|rest| rest.strip_prefix(NAMESPACE_SEPARATOR))
        .unwrap_or(name)
}

/// A callable tool as exposed to consumers; `name` is always namespaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the arguments object.
    #[serde(rename = "inputSchema", alias = "parameters", default = "empty_object_schema")]
    pub parameters: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    pub(crate) fn namespaced(mut self, connection_name: &str) -> Self {
        self.name = add_prefix(connection_name, &self.name);
        self
    }

    /// Split a namespaced name into `(connection, raw)` at the first separator.
    pub fn split_name(&self) -> Option<(&str, &str)> {
        self.name.split_once(NAMESPACE_SEPARATOR)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl ResourceDescriptor {
    pub(crate) fn namespaced(mut self, connection_name: &str) -> Self {
        self.uri = add_prefix(connection_name, &self.uri);
        self.name = add_prefix(connection_name, &self.name);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

impl PromptDescriptor {
    pub(crate) fn namespaced(mut self, connection_name: &str) -> Self {
        self.name = add_prefix(connection_name, &self.name);
        self
    }
}

/// Body of a `resources/read` reply; either `text` or base64 `blob` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceContents {
    pub uri: String,
    #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: Content,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PromptResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub messages: Vec<PromptMessage>,
}

/// One content block of a tool result, resource or prompt message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Audio {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: Value,
    },
    ResourceLink {
        uri: String,
        #[serde(default)]
        name: String,
    },
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Content::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Text blocks verbatim, anything else as compact JSON.
    pub fn render(&self) -> String {
        match self {
            Content::Text { text } => text.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }
}

/// Join content blocks the way tool results are handed back to a model.
pub fn render_contents(contents: &[Content]) -> String {
    contents
        .iter()
        .map(Content::render)
        .collect::<Vec<_>>()
        .join("\n")
}

/// A model-issued request to run one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub tool_call_id: String,
    /// Namespaced tool name.
    pub tool_name: String,
    #[serde(default = "empty_arguments")]
    pub arguments: Value,
}

fn empty_arguments() -> Value {
    Value::Object(Map::new())
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolCallResult {
    #[serde(rename = "content", default)]
    pub contents: Vec<Content>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
    /// Token to resume this call after an interruption, if the peer issued one.
    #[serde(skip)]
    pub resumption_token: Option<String>,
}

impl ToolCallResult {
    pub fn rendered(&self) -> String {
        render_contents(&self.contents)
    }

    /// The first text block, used as the failure message for `isError` results.
    pub fn first_error_content(&self) -> String {
        self.contents
            .iter()
            .find_map(|c| c.as_text().map(str::to_string))
            .or_else(|| self.contents.first().map(Content::render))
            .unwrap_or_else(|| "tool reported an error without content".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn namespace_round_trips_raw_names() {
        for raw in ["add", "a.b", "calc", "calcx", ".leading", ""] {
            assert_eq!(strip_prefix("calc", &add_prefix("calc", raw)), raw);
        }
    }

    #[test]
    fn strip_prefix_leaves_foreign_prefixes_alone() {
        assert_eq!(strip_prefix("calc", "calculator.add"), "calculator.add");
        assert_eq!(strip_prefix("calc", "other.calc.add"), "other.calc.add");
        assert_eq!(strip_prefix("calc", "add"), "add");
    }

    #[test]
    fn tool_descriptor_reads_mcp_wire_shape() {
        let tool: ToolDescriptor = serde_json::from_value(json!({
            "name": "add",
            "description": "Add two numbers",
            "inputSchema": { "type": "object", "properties": { "a": { "type": "number" } } }
        }))
        .unwrap();
        let tool = tool.namespaced("calc");
        assert_eq!(tool.name, "calc.add");
        assert_eq!(tool.split_name(), Some(("calc", "add")));
        assert_eq!(tool.parameters["properties"]["a"]["type"], "number");

        let bare: ToolDescriptor = serde_json::from_value(json!({ "name": "ping" })).unwrap();
        assert_eq!(bare.parameters, json!({ "type": "object" }));
    }

    #[test]
    fn tool_result_parses_and_renders() {
        let result: ToolCallResult = serde_json::from_value(json!({
            "content": [
                { "type": "text", "text": "5" },
                { "type": "image", "data": "AAAA", "mimeType": "image/png" }
            ],
            "isError": false
        }))
        .unwrap();
        assert!(!result.is_error);
        assert_eq!(
            result.rendered(),
            "5\n{\"type\":\"image\",\"data\":\"AAAA\",\"mimeType\":\"image/png\"}"
        );
    }

    #[test]
    fn first_error_content_prefers_text() {
        let result = ToolCallResult {
            contents: vec![
                Content::ResourceLink {
                    uri: "file:///log".into(),
                    name: "log".into(),
                },
                Content::text("boom"),
            ],
            is_error: true,
            resumption_token: None,
        };
        assert_eq!(result.first_error_content(), "boom");
        assert_eq!(
            ToolCallResult::default().first_error_content(),
            "tool reported an error without content"
        );
    }
}
