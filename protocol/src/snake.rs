use serde_json::Map;
use serde_json::Value;

/// Keys whose entries are copied verbatim: the key itself is not re-cased
/// and the subtree below it is left untouched. These carry
/// customer-authored or protocol-mandated shapes.
const VERBATIM_KEYS: &[&str] = &["customerData", "sip", "env_vars", "args"];

/// Deep snake-case transform over webhook payloads. Object keys are
/// converted from camelCase; array elements are transformed recursively.
pub fn snake_case_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, entry) in map {
                if VERBATIM_KEYS.contains(&key.as_str()) {
                    out.insert(key.clone(), entry.clone());
                } else {
                    out.insert(to_snake(key), snake_case_keys(entry));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(snake_case_keys).collect()),
        other => other.clone(),
    }
}

fn to_snake(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, ch) in key.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn converts_nested_camel_case_keys() {
        let body = json!({
            "callSid": "c1",
            "callerName": {"displayName": "Alice"},
            "statusCallbackEvents": ["callStatus"]
        });
        assert_eq!(
            snake_case_keys(&body),
            json!({
                "call_sid": "c1",
                "caller_name": {"display_name": "Alice"},
                "status_callback_events": ["callStatus"]
            })
        );
    }

    #[test]
    fn leaves_already_snake_keys_alone() {
        let body = json!({"call_sid": "c1", "sip_status": 200});
        assert_eq!(snake_case_keys(&body), body);
    }

    #[test]
    fn exception_set_subtrees_are_verbatim() {
        let body = json!({
            "callSid": "c1",
            "customerData": {"myKey": {"innerKey": 1}},
            "sip": {"headerValue": "X"},
            "env_vars": {"MY_VAR": "1"},
            "args": {"toolArg": true}
        });
        let out = snake_case_keys(&body);
        assert_eq!(out["call_sid"], json!("c1"));
        assert_eq!(out["customerData"], json!({"myKey": {"innerKey": 1}}));
        assert_eq!(out["sip"], json!({"headerValue": "X"}));
        assert_eq!(out["env_vars"], json!({"MY_VAR": "1"}));
        assert_eq!(out["args"], json!({"toolArg": true}));
    }

    #[test]
    fn round_trips_through_wire_encoding() {
        let body = json!({
            "callSid": "c1",
            "customerData": {"keepMe": [1, 2, 3]}
        });
        let encoded = serde_json::to_string(&snake_case_keys(&body)).unwrap();
        let decoded: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded["call_sid"], json!("c1"));
        assert_eq!(decoded["customerData"], body["customerData"]);
    }
}
