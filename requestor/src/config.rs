use std::env;
use std::time::Duration;

/// Settings for the HTTP webhook client. Every knob has a default so
/// `from_env` never fails; unset or unparsable variables fall back.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// `HTTP_POOL`: keep-alive pooling is opt-in (`1` enables).
    pub pool_enabled: bool,
    /// `HTTP_POOLSIZE`: bound on pooled origins.
    pub pool_size: usize,
    /// `HTTP_PIPELINING`: idle connections retained per origin.
    pub pipelining: usize,
    /// `HTTP_TIMEOUT`: total request timeout, milliseconds.
    pub timeout: Duration,
    /// `HTTP_PROXY_IP` / `HTTP_PROXY_PORT` / `HTTP_PROXY_PROTOCOL`.
    pub proxy: Option<ProxyConfig>,
    /// `HTTP_USER_AGENT_HEADER`.
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub protocol: String,
    pub ip: String,
    pub port: u16,
}

impl ProxyConfig {
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.ip, self.port)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            pool_enabled: false,
            pool_size: 8,
            pipelining: 1,
            timeout: Duration::from_millis(10_000),
            proxy: None,
            user_agent: None,
        }
    }
}

impl HttpConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let proxy = match (env::var("HTTP_PROXY_IP").ok(), env_u64("HTTP_PROXY_PORT")) {
            (Some(ip), Some(port)) if !ip.is_empty() => Some(ProxyConfig {
                protocol: env::var("HTTP_PROXY_PROTOCOL").unwrap_or_else(|_| "http".to_string()),
                ip,
                port: port.min(u16::MAX as u64) as u16,
            }),
            _ => None,
        };
        Self {
            pool_enabled: env::var("HTTP_POOL").map(|v| v == "1").unwrap_or(false),
            pool_size: env_usize("HTTP_POOLSIZE").unwrap_or(defaults.pool_size),
            pipelining: env_usize("HTTP_PIPELINING").unwrap_or(defaults.pipelining),
            timeout: env_u64("HTTP_TIMEOUT")
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout),
            proxy,
            user_agent: env::var("HTTP_USER_AGENT_HEADER")
                .ok()
                .filter(|v| !v.is_empty()),
        }
    }
}

/// Settings for the WebSocket channel.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// `RESPONSE_TIMEOUT_MS`: how long an ack-expecting send waits.
    pub response_timeout: Duration,
    /// `JAMBONES_WS_PING_INTERVAL_MS`: keepalive pings, honored only when
    /// configured above 15 000 ms.
    pub ping_interval: Option<Duration>,
    /// `MAX_RECONNECTS`.
    pub max_reconnects: u32,
    /// `JAMBONES_WS_HANDSHAKE_TIMEOUT_MS`.
    pub handshake_timeout: Duration,
    /// `JAMBONES_WS_MAX_PAYLOAD`: inbound frame cap, bytes.
    pub max_payload: usize,
    /// Bound on frames parked while a (re)connect is in progress.
    pub queue_high_water: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(5_000),
            ping_interval: None,
            max_reconnects: 5,
            handshake_timeout: Duration::from_millis(1_500),
            max_payload: 24 * 1024,
            queue_high_water: 512,
        }
    }
}

impl WsConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let ping_interval = env_u64("JAMBONES_WS_PING_INTERVAL_MS")
            .filter(|ms| *ms > 15_000)
            .map(Duration::from_millis);
        Self {
            response_timeout: env_u64("RESPONSE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.response_timeout),
            ping_interval,
            max_reconnects: env_u64("MAX_RECONNECTS")
                .map(|v| v.min(u32::MAX as u64) as u32)
                .unwrap_or(defaults.max_reconnects),
            handshake_timeout: env_u64("JAMBONES_WS_HANDSHAKE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.handshake_timeout),
            max_payload: env_usize("JAMBONES_WS_MAX_PAYLOAD").unwrap_or(defaults.max_payload),
            queue_high_water: defaults.queue_high_water,
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_protocol_contract() {
        let ws = WsConfig::default();
        assert_eq!(ws.handshake_timeout, Duration::from_millis(1_500));
        assert_eq!(ws.max_payload, 24 * 1024);
        assert_eq!(ws.ping_interval, None);

        let http = HttpConfig::default();
        assert!(!http.pool_enabled);
        assert_eq!(http.timeout, Duration::from_millis(10_000));
    }

    #[test]
    fn proxy_url_is_well_formed() {
        let proxy = ProxyConfig {
            protocol: "http".to_string(),
            ip: "10.0.0.2".to_string(),
            port: 3128,
        };
        assert_eq!(proxy.url(), "http://10.0.0.2:3128");
    }
}
