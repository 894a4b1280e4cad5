use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use jambonz_protocol::Hook;
use jambonz_protocol::HookMethod;
use url::Url;

use crate::config::HttpConfig;
use crate::config::WsConfig;
use crate::error::RequestorError;
use crate::retry::RetryDirective;
use crate::retry::clamp_attempts;
use crate::retry::parse_tokens;
use crate::signer;

/// A hook resolved against the session's base URL, with its fragment
/// options stripped out into a retry directive.
#[derive(Debug, Clone)]
pub struct ResolvedHook {
    pub url: Url,
    pub method: HookMethod,
    pub basic_auth: Option<(String, String)>,
    pub retry: RetryDirective,
}

impl ResolvedHook {
    pub fn is_websocket(&self) -> bool {
        matches!(self.url.scheme(), "ws" | "wss")
    }
}

/// Configuration and behavior shared by both transports: credentials, base
/// URL resolution, fragment parsing, and payload signing. Fixed at
/// construction.
#[derive(Clone)]
pub struct BaseRequestor {
    account_sid: String,
    base_url: Url,
    secret: Option<String>,
    http_config: HttpConfig,
    ws_config: WsConfig,
}

impl BaseRequestor {
    pub fn new(
        account_sid: impl Into<String>,
        base_url: &str,
        secret: Option<String>,
    ) -> Result<Self, RequestorError> {
        let base_url = parse_absolute(base_url)?;
        Ok(Self {
            account_sid: account_sid.into(),
            base_url,
            secret: secret.filter(|s| !s.is_empty()),
            http_config: HttpConfig::from_env(),
            ws_config: WsConfig::from_env(),
        })
    }

    pub fn with_http_config(mut self, config: HttpConfig) -> Self {
        self.http_config = config;
        self
    }

    pub fn with_ws_config(mut self, config: WsConfig) -> Self {
        self.ws_config = config;
        self
    }

    pub fn account_sid(&self) -> &str {
        &self.account_sid
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn http_config(&self) -> &HttpConfig {
        &self.http_config
    }

    pub fn ws_config(&self) -> &WsConfig {
        &self.ws_config
    }

    /// Resolve a hook to an absolute URL. Relative URLs resolve against the
    /// base URL; the `#` fragment is parsed for `rp`/`rc` overrides and
    /// removed from the resolved URL.
    pub fn resolve(&self, hook: &Hook) -> Result<ResolvedHook, RequestorError> {
        let mut url = if hook.url.starts_with("http://")
            || hook.url.starts_with("https://")
            || hook.url.starts_with("ws://")
            || hook.url.starts_with("wss://")
        {
            parse_absolute(&hook.url)?
        } else {
            self.base_url
                .join(&hook.url)
                .map_err(|err| RequestorError::InvalidUrl(format!("{}: {err}", hook.url)))?
        };

        let retry = url
            .fragment()
            .map(parse_fragment)
            .unwrap_or_default();
        url.set_fragment(None);

        let basic_auth = hook
            .basic_auth()
            .map(|(username, password)| (username.to_string(), password.to_string()));

        Ok(ResolvedHook {
            url,
            method: hook.method,
            basic_auth,
            retry,
        })
    }

    /// The `JB-Signature` header value for an outbound body, when a webhook
    /// secret is configured and the body is non-empty.
    pub fn signature_for(&self, body: &str) -> Result<Option<String>, RequestorError> {
        let Some(secret) = self.secret.as_deref() else {
            return Ok(None);
        };
        if body.is_empty() {
            return Ok(None);
        }
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        signer::signature(secret, timestamp, body).map(Some)
    }
}

fn parse_absolute(value: &str) -> Result<Url, RequestorError> {
    let url =
        Url::parse(value).map_err(|err| RequestorError::InvalidUrl(format!("{value}: {err}")))?;
    match url.scheme() {
        "http" | "https" | "ws" | "wss" => Ok(url),
        scheme => Err(RequestorError::InvalidUrl(format!(
            "unsupported scheme {scheme}"
        ))),
    }
}

/// Parse `rp`/`rc` options out of a URL fragment. Unknown options are
/// ignored.
fn parse_fragment(fragment: &str) -> RetryDirective {
    let mut directive = RetryDirective::default();
    for pair in fragment.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        match key {
            "rp" => directive.tokens = Some(parse_tokens(value)),
            "rc" => {
                if let Ok(count) = value.parse::<i64>() {
                    directive.attempts = Some(clamp_attempts(count));
                }
            }
            _ => {}
        }
    }
    directive
}
