//! Egress proxy selection for outbound provider traffic.
//!
//! Supports a static proxy, a per-credential override, and a pool URL that
//! returns one proxy string per GET. The pool is polled lazily: the first
//! caller refreshes immediately, later callers refresh once the configured
//! interval has elapsed or when `force_refresh` is invoked after an
//! upstream block.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use reqwest::Client;
use tokio::sync::{Mutex, RwLock};

const ACCEPTED_SCHEMES: [&str; 6] = [
    "socks5h://",
    "socks5://",
    "socks4://",
    "socks://",
    "http://",
    "https://",
];

/// Normalizes a proxy URL to an accepted scheme. `sock5://`/`sock5h://`
/// typos and plain `socks5://` all become `socks5h://` so DNS resolution
/// happens on the remote side.
pub fn normalize_proxy_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lowered = trimmed.to_ascii_lowercase();
    let candidate = 'scheme: {
        for prefix in ["sock5h://", "sock5://", "socks5://"] {
            if lowered.starts_with(prefix) {
                break 'scheme Some(format!("socks5h://{}", &trimmed[prefix.len()..]));
            }
        }
        if ACCEPTED_SCHEMES.iter().any(|s| lowered.starts_with(s)) {
            break 'scheme Some(trimmed.to_string());
        }
        None
    }?;
    if url::Url::parse(&candidate).is_err() {
        return None;
    }
    Some(candidate)
}

pub fn looks_like_proxy_url(value: &str) -> bool {
    let lowered = value.trim().to_ascii_lowercase();
    ACCEPTED_SCHEMES.iter().any(|s| lowered.starts_with(s))
        || lowered.starts_with("sock5://")
        || lowered.starts_with("sock5h://")
}

pub struct EgressProxy {
    static_proxy: Option<String>,
    pool_url: Option<String>,
    interval: Duration,
    current: RwLock<Option<String>>,
    /// Also serves as the at-most-one-refresh-in-flight guard.
    last_fetch: Mutex<Option<Instant>>,
    fetch_client: Client,
    client_cache: DashMap<String, Client>,
    direct_client: Client,
}

impl EgressProxy {
    pub fn new(proxy_url: &str, proxy_pool_url: &str, interval_seconds: u64) -> Self {
        let mut static_proxy = normalize_proxy_url(proxy_url);
        if !proxy_url.trim().is_empty() && static_proxy.is_none() {
            tracing::warn!("[Egress] Ignoring invalid proxy_url: {}", proxy_url);
        }

        let mut pool_url = None;
        let trimmed_pool = proxy_pool_url.trim();
        if !trimmed_pool.is_empty() {
            if looks_like_proxy_url(trimmed_pool) {
                // A pool URL that is itself a proxy URL cannot be polled;
                // treat it as the static proxy instead.
                tracing::warn!(
                    "[Egress] proxy_pool_url looks like a proxy URL; using it as static proxy and disabling pool polling"
                );
                static_proxy = normalize_proxy_url(trimmed_pool).or(static_proxy);
            } else {
                pool_url = Some(trimmed_pool.to_string());
            }
        }

        let fetch_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(crate::constants::USER_AGENT.as_str())
            .build()
            .unwrap_or_else(|_| Client::new());
        let direct_client = Self::build_client(None, Duration::from_secs(600))
            .unwrap_or_else(|_| Client::new());

        Self {
            static_proxy,
            pool_url,
            interval: Duration::from_secs(interval_seconds.max(1)),
            current: RwLock::new(None),
            last_fetch: Mutex::new(None),
            fetch_client,
            client_cache: DashMap::new(),
            direct_client,
        }
    }

    pub fn pool_enabled(&self) -> bool {
        self.pool_url.is_some()
    }

    pub fn static_proxy(&self) -> Option<&str> {
        self.static_proxy.as_deref()
    }

    /// The proxy URL the next outbound call should use, refreshing the pool
    /// when due.
    pub async fn current_proxy(&self) -> Option<String> {
        if self.pool_url.is_some() {
            let due = {
                let last = self.last_fetch.lock().await;
                match *last {
                    None => true,
                    Some(at) => at.elapsed() >= self.interval,
                }
            };
            if due {
                self.refresh().await;
            }
            let current = self.current.read().await.clone();
            if current.is_some() {
                return current;
            }
        }
        self.static_proxy.clone()
    }

    /// Invoked after an upstream 403: the next call must use a fresh proxy.
    pub async fn force_refresh(&self) {
        if self.pool_url.is_none() {
            return;
        }
        self.refresh().await;
    }

    async fn refresh(&self) {
        let Some(pool_url) = self.pool_url.as_deref() else {
            return;
        };
        // Single refresh in flight; concurrent callers wait and reuse.
        let mut last = self.last_fetch.lock().await;
        let fetched = match self.fetch_client.get(pool_url).send().await {
            Ok(resp) if resp.status().is_success() => resp.text().await.ok(),
            Ok(resp) => {
                tracing::warn!("[Egress] Proxy pool returned status {}", resp.status());
                None
            }
            Err(e) => {
                tracing::warn!("[Egress] Proxy pool fetch failed: {}", e);
                None
            }
        };
        *last = Some(Instant::now());
        drop(last);

        match fetched.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => match normalize_proxy_url(raw) {
                Some(normalized) => {
                    tracing::info!("[Egress] Proxy pool rotated to {}", normalized);
                    *self.current.write().await = Some(normalized);
                }
                None => {
                    tracing::warn!(
                        "[Egress] Proxy pool returned invalid proxy '{}'; keeping previous",
                        raw
                    );
                }
            },
            _ => {}
        }
    }

    fn build_client(proxy: Option<&str>, timeout: Duration) -> Result<Client, reqwest::Error> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(timeout)
            .user_agent(crate::constants::USER_AGENT.as_str());
        if let Some(url) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(url)?);
        }
        builder.build()
    }

    /// Builds (or reuses) the HTTP client for one outbound request. The
    /// per-credential override wins over the pool/static selection; no
    /// proxy at all means a shared direct client.
    pub async fn client_for(
        &self,
        credential_proxy: Option<&str>,
        timeout: Duration,
    ) -> Result<Client, String> {
        let selected = match credential_proxy {
            Some(raw) => match normalize_proxy_url(raw) {
                Some(url) => Some(url),
                None => {
                    tracing::warn!("[Egress] Invalid per-credential proxy '{}'; using default route", raw);
                    self.current_proxy().await
                }
            },
            None => self.current_proxy().await,
        };

        let Some(proxy_url) = selected else {
            if timeout == Duration::from_secs(600) {
                return Ok(self.direct_client.clone());
            }
            return Self::build_client(None, timeout)
                .map_err(|e| format!("Failed to build direct HTTP client: {}", e));
        };

        let cache_key = format!("{}|{}", proxy_url, timeout.as_secs());
        if let Some(client) = self.client_cache.get(&cache_key) {
            return Ok(client.clone());
        }
        let client = Self::build_client(Some(&proxy_url), timeout)
            .map_err(|e| format!("Failed to build proxied HTTP client: {}", e))?;
        self.client_cache.insert(cache_key, client.clone());
        Ok(client)
    }
}
