use serde_json::Map;
use serde_json::Value;

/// One unit of application behavior, still in wire form: the verb name and
/// its unparsed parameters. The task registry turns these into tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct VerbNode {
    pub name: String,
    pub data: Value,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ApplicationError {
    #[error("application payload is not an array of verbs")]
    NotAnArray,
    #[error("verb at position {index} is not an object")]
    InvalidNode { index: usize },
    #[error("verb at position {index} names no verb")]
    MissingVerb { index: usize },
}

/// Parse an application payload: a JSON array of verb nodes. Each node is
/// either a single-key object (`{"say": {...}}`) or the spelled-out form
/// carrying a `verb` field (`{"verb": "say", ...}`).
pub fn parse_application(value: &Value) -> Result<Vec<VerbNode>, ApplicationError> {
    let Some(nodes) = value.as_array() else {
        return Err(ApplicationError::NotAnArray);
    };

    nodes
        .iter()
        .enumerate()
        .map(|(index, node)| parse_node(index, node))
        .collect()
}

fn parse_node(index: usize, node: &Value) -> Result<VerbNode, ApplicationError> {
    let Some(object) = node.as_object() else {
        return Err(ApplicationError::InvalidNode { index });
    };

    if let Some(name) = object.get("verb").and_then(Value::as_str) {
        let data: Map<String, Value> = object
            .iter()
            .filter(|(key, _)| key.as_str() != "verb")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        return Ok(VerbNode {
            name: name.to_string(),
            data: Value::Object(data),
        });
    }

    if object.len() == 1 {
        if let Some((name, data)) = object.iter().next() {
            return Ok(VerbNode {
                name: name.clone(),
                data: data.clone(),
            });
        }
    }

    Err(ApplicationError::MissingVerb { index })
}
