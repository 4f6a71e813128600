// Connection loading from JSON files
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

use crate::config::{ConnectionConfig, RuntimeConfig, TransportConfig};

/// Parse a connections JSON file
/// Supports multiple formats:
/// - Array: [{"name": "calc", "transport": {...}}, ...]
/// - Object with connections array: {"connections": [{...}, ...]}
/// - Object with single connection: {"connections": {...}}
/// - Single connection: {"name": "calc", "transport": {...}}
pub async fn load_connections_from_file(
    path: impl AsRef<Path>,
    config: &RuntimeConfig,
) -> Result<Vec<ConnectionConfig>> {
    let contents = tokio::fs::read_to_string(path).await?;
    let json: Value = serde_json::from_str(&contents)?;

    let variables = resolve_variables(&json, config).await;

    let mut connections = Vec::new();
    for (index, mut connection_value) in parse_connections_json(json)?.into_iter().enumerate() {
        substitute_variables(&mut connection_value, &variables);
        connections.push(connection_from_value(connection_value, index)?);
    }

    Ok(connections)
}

fn parse_connections_json(json: Value) -> Result<Vec<Value>> {
    match json {
        Value::Array(arr) => Ok(arr),

        Value::Object(obj) => {
            if let Some(connections_value) = obj.get("connections") {
                match connections_value {
                    Value::Array(arr) => Ok(arr.clone()),
                    Value::Object(_) => Ok(vec![connections_value.clone()]),
                    _ => Err(anyhow!("'connections' field must be an array or object")),
                }
            } else {
                Ok(vec![Value::Object(obj)])
            }
        }

        _ => Err(anyhow!("JSON root must be array or object")),
    }
}

fn connection_from_value(mut value: Value, index: usize) -> Result<ConnectionConfig> {
    let obj = value
        .as_object_mut()
        .ok_or_else(|| anyhow!("Connection must be an object"))?;

    // Flat form: transport fields next to the name, tagged by "type".
    let transport = match obj.remove("transport") {
        Some(transport) => transport,
        None => {
            let mut transport = obj.clone();
            for key in ["name", "version", "timeout_ms", "max_total_timeout_ms"] {
                transport.remove(key);
            }
            obj.retain(|key, _| {
                matches!(
                    key.as_str(),
                    "name" | "version" | "timeout_ms" | "max_total_timeout_ms"
                )
            });
            Value::Object(transport)
        }
    };
    let transport = TransportConfig::from_value(transport)?;

    if !obj.contains_key("name") {
        obj.insert(
            "name".to_string(),
            Value::String(format!("{}_{}", transport.kind(), index)),
        );
    }
    obj.insert("transport".to_string(), serde_json::to_value(&transport)?);

    Ok(serde_json::from_value(value)?)
}

/// Every variable a `${VAR}` or `$VAR` in the document could name, resolved
/// inline first, then through the configured loaders, then the environment.
async fn resolve_variables(json: &Value, config: &RuntimeConfig) -> HashMap<String, String> {
    let mut names = Vec::new();
    collect_variable_names(json, &mut names);

    let mut variables = HashMap::new();
    for name in names {
        if variables.contains_key(&name) {
            continue;
        }
        if let Some(value) = config.get_variable(&name).await {
            variables.insert(name, value);
        }
    }
    variables
}

fn collect_variable_names(value: &Value, names: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            let mut rest = s.as_str();
            while let Some(pos) = rest.find('$') {
                rest = &rest[pos + 1..];
                let braced = rest.starts_with('{');
                let body = if braced { &rest[1..] } else { rest };
                let len = body
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .unwrap_or(body.len());
                if len > 0 {
                    names.push(body[..len].to_string());
                }
            }
        }
        Value::Object(obj) => {
            for v in obj.values() {
                collect_variable_names(v, names);
            }
        }
        Value::Array(arr) => {
            for item in arr {
                collect_variable_names(item, names);
            }
        }
        _ => {}
    }
}

fn substitute_variables(value: &mut Value, variables: &HashMap<String, String>) {
    match value {
        Value::String(s) => {
            // Longest names first so $TOKEN does not clobber $TOKEN_URL.
            let mut keys: Vec<&String> = variables.keys().collect();
            keys.sort_by_key(|k| std::cmp::Reverse(k.len()));

            let mut result = s.clone();
            for key in keys {
                let val = &variables[key];
                result = result.replace(&format!("${{{}}}", key), val);
                result = result.replace(&format!("${}", key), val);
            }
            *s = result;
        }
        Value::Object(obj) => {
            for (_, v) in obj.iter_mut() {
                substitute_variables(v, variables);
            }
        }
        Value::Array(arr) => {
            for item in arr.iter_mut() {
                substitute_variables(item, variables);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_connections_array() {
        let json = serde_json::json!([
            {"name": "calc", "transport": {"type": "stdio", "command": "mcp-calc"}},
            {"name": "docs", "transport": {"type": "sse", "url": "http://example.com/sse"}}
        ]);

        let result = parse_connections_json(json).unwrap();
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_parse_connections_object_with_array() {
        let json = serde_json::json!({
            "connections": [
                {"name": "calc", "transport": {"type": "stdio", "command": "mcp-calc"}}
            ]
        });

        let result = parse_connections_json(json).unwrap();
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn test_parse_single_connection() {
        let json = serde_json::json!({
            "name": "calc",
            "transport": {"type": "stdio", "command": "mcp-calc"}
        });

        let result = parse_connections_json(json).unwrap();
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn flat_connections_and_default_names() {
        let flat = connection_from_value(
            serde_json::json!({
                "name": "search",
                "type": "http",
                "url": "http://example.com/mcp",
                "timeout_ms": 5000
            }),
            0,
        )
        .unwrap();
        assert_eq!(flat.name, "search");
        assert_eq!(flat.timeout_ms, Some(5000));
        assert_eq!(flat.transport, TransportConfig::http_streaming("http://example.com/mcp"));

        let unnamed = connection_from_value(
            serde_json::json!({ "transport": { "type": "websocket", "url": "ws://example.com" } }),
            3,
        )
        .unwrap();
        assert_eq!(unnamed.name, "web_socket_3");
    }

    #[test]
    fn unknown_transport_types_are_rejected() {
        let err = connection_from_value(
            serde_json::json!({ "name": "x", "transport": { "type": "grpc", "url": "x" } }),
            0,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unsupported transport kind: grpc"));
    }

    #[test]
    fn variable_names_are_collected_from_both_forms() {
        let mut names = Vec::new();
        collect_variable_names(
            &serde_json::json!({ "a": "Bearer ${API_TOKEN}", "b": ["$HOME/bin", "$"] }),
            &mut names,
        );
        assert_eq!(names, vec!["API_TOKEN".to_string(), "HOME".to_string()]);
    }

    #[tokio::test]
    async fn load_connections_substitutes_variables() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "connections": [
                    {{
                        "name": "calc",
                        "transport": {{ "type": "stdio", "command": "$CALC_BIN", "args": ["--root", "${{CALC_ROOT}}/data"] }}
                    }},
                    {{
                        "name": "search",
                        "version": "2.0.0",
                        "transport": {{
                            "type": "streamable_http",
                            "url": "http://example.com/mcp",
                            "headers": {{ "Authorization": "Bearer ${{SEARCH_TOKEN}}" }}
                        }}
                    }}
                ]
            }}"#
        )
        .unwrap();

        let config = RuntimeConfig::new()
            .with_variable("CALC_BIN".into(), "mcp-calc".into())
            .with_variable("CALC_ROOT".into(), "/srv".into())
            .with_variable("SEARCH_TOKEN".into(), "s3cr3t".into());
        let connections = load_connections_from_file(file.path(), &config)
            .await
            .unwrap();

        assert_eq!(connections.len(), 2);
        assert_eq!(
            connections[0].transport,
            TransportConfig::process_pipe("mcp-calc", vec!["--root".into(), "/srv/data".into()])
        );
        assert_eq!(connections[1].version, "2.0.0");
        match &connections[1].transport {
            TransportConfig::HttpStreaming { headers, .. } => {
                assert_eq!(headers["Authorization"], "Bearer s3cr3t");
            }
            other => panic!("unexpected transport {other:?}"),
        }
    }
}
