use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use url::Url;

use crate::config::HttpConfig;
use crate::error::RequestorError;

/// How long an origin's pooled client survives without use.
const POOL_IDLE_TTL: Duration = Duration::from_secs(120);

/// Process-wide registry of keep-alive HTTP clients, one per origin
/// (scheme + host + port). Entries are evicted after an idle TTL. When
/// pooling is disabled every request gets a throwaway client that keeps no
/// idle connections.
#[derive(Clone)]
pub struct HttpClientPool {
    config: HttpConfig,
    clients: Arc<Mutex<HashMap<String, PooledClient>>>,
}

struct PooledClient {
    client: reqwest::Client,
    last_used: Instant,
}

impl HttpClientPool {
    pub fn new(config: HttpConfig) -> Self {
        Self {
            config,
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    pub fn client_for(&self, url: &Url) -> Result<reqwest::Client, RequestorError> {
        if !self.config.pool_enabled {
            return self.build_client(0);
        }

        let origin = origin_key(url);
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| RequestorError::Transport("http pool poisoned".to_string()))?;

        let now = Instant::now();
        clients.retain(|_, entry| now.duration_since(entry.last_used) < POOL_IDLE_TTL);

        if let Some(entry) = clients.get_mut(&origin) {
            entry.last_used = now;
            return Ok(entry.client.clone());
        }

        // Bound the registry itself; beyond the cap fall back to an
        // unpooled client rather than evicting a live origin.
        if clients.len() >= self.config.pool_size {
            drop(clients);
            return self.build_client(0);
        }

        let client = self.build_client(self.config.pipelining.max(1))?;
        clients.insert(
            origin,
            PooledClient {
                client: client.clone(),
                last_used: now,
            },
        );
        Ok(client)
    }

    fn build_client(&self, idle_per_host: usize) -> Result<reqwest::Client, RequestorError> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.config.timeout)
            .pool_max_idle_per_host(idle_per_host)
            .pool_idle_timeout(POOL_IDLE_TTL)
            // Webhook responses are terminal; redirects are a status error.
            .redirect(reqwest::redirect::Policy::none());

        if let Some(user_agent) = self.config.user_agent.as_deref() {
            builder = builder.user_agent(user_agent.to_string());
        }
        if let Some(proxy) = self.config.proxy.as_ref() {
            let proxy = reqwest::Proxy::all(proxy.url())
                .map_err(|err| RequestorError::Transport(format!("invalid proxy: {err}")))?;
            builder = builder.proxy(proxy);
        }

        builder
            .build()
            .map_err(|err| RequestorError::Transport(format!("http client build: {err}")))
    }
}

fn origin_key(url: &Url) -> String {
    let scheme = url.scheme();
    let host = url.host_str().unwrap_or_default();
    let port = url.port_or_known_default().unwrap_or(0);
    format!("{scheme}://{host}:{port}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn origin_key_folds_default_ports() {
        let a = origin_key(&Url::parse("https://app.example/a").unwrap());
        let b = origin_key(&Url::parse("https://app.example:443/b").unwrap());
        assert_eq!(a, b);
        let c = origin_key(&Url::parse("http://app.example/a").unwrap());
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn pooled_origins_share_a_client() {
        let pool = HttpClientPool::new(HttpConfig {
            pool_enabled: true,
            ..HttpConfig::default()
        });
        let url = Url::parse("https://app.example/a").unwrap();
        let _first = pool.client_for(&url).unwrap();
        let registry = pool.clients.lock().unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn disabled_pool_keeps_no_registry() {
        let pool = HttpClientPool::new(HttpConfig::default());
        let url = Url::parse("https://app.example/a").unwrap();
        let _client = pool.client_for(&url).unwrap();
        assert!(pool.clients.lock().unwrap().is_empty());
    }
}
