use serde::Deserialize;

/// HTTP method used to invoke a webhook. Only GET and POST are part of the
/// protocol contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HookMethod {
    Get,
    #[default]
    Post,
}

/// A webhook target: either a bare URL or an object carrying the URL plus
/// optional method override and Basic-auth credentials. URLs may be relative;
/// the requestor resolves them against the session's base URL.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "HookSpec")]
pub struct Hook {
    pub url: String,
    pub method: HookMethod,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Hook {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: HookMethod::default(),
            username: None,
            password: None,
        }
    }

    pub fn with_basic_auth(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn basic_auth(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(username), Some(password)) if !username.is_empty() => {
                Some((username, password))
            }
            _ => None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HookSpec {
    Url(String),
    Object {
        url: String,
        #[serde(default)]
        method: Option<String>,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
}

impl From<HookSpec> for Hook {
    fn from(spec: HookSpec) -> Self {
        match spec {
            HookSpec::Url(url) => Hook::new(url),
            HookSpec::Object {
                url,
                method,
                username,
                password,
            } => {
                let method = match method.as_deref() {
                    Some(m) if m.eq_ignore_ascii_case("get") => HookMethod::Get,
                    _ => HookMethod::Post,
                };
                Hook {
                    url,
                    method,
                    username,
                    password,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn bare_url_parses_as_post_hook() {
        let hook: Hook = serde_json::from_value(json!("https://app.example/status")).unwrap();
        assert_eq!(hook.url, "https://app.example/status");
        assert_eq!(hook.method, HookMethod::Post);
        assert_eq!(hook.basic_auth(), None);
    }

    #[test]
    fn object_hook_parses_method_and_credentials() {
        let hook: Hook = serde_json::from_value(json!({
            "url": "/action",
            "method": "GET",
            "username": "acct",
            "password": "s3cret"
        }))
        .unwrap();
        assert_eq!(hook.url, "/action");
        assert_eq!(hook.method, HookMethod::Get);
        assert_eq!(hook.basic_auth(), Some(("acct", "s3cret")));
    }

    #[test]
    fn credentials_require_both_halves() {
        let hook: Hook = serde_json::from_value(json!({
            "url": "https://app.example/a",
            "username": "acct"
        }))
        .unwrap();
        assert_eq!(hook.basic_auth(), None);
    }
}
