// Feed client: reaches the upstream XML feed through an ordered list of access paths

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::ttc_api_models::{FeedError, Result, RouteTag};

// ============================================================================
// Feed Commands
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedCommand {
    RouteList,
    VehicleLocations { since: i64, cache_buster: i64 },
    RouteConfig { route: RouteTag },
    Predictions { route: RouteTag, stop: String },
}

impl FeedCommand {
    pub fn url(&self, base: &str) -> String {
        match self {
            FeedCommand::RouteList => format!("{}&command=routeList", base),
            FeedCommand::VehicleLocations { since, cache_buster } => format!(
                "{}&command=vehicleLocations&t={}&cb={}",
                base, since, cache_buster
            ),
            FeedCommand::RouteConfig { route } => format!(
                "{}&command=routeConfig&r={}",
                base,
                urlencoding::encode(route)
            ),
            FeedCommand::Predictions { route, stop } => format!(
                "{}&command=predictions&r={}&s={}",
                base,
                urlencoding::encode(route),
                urlencoding::encode(stop)
            ),
        }
    }
}

// ============================================================================
// Access Paths
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessPath {
    /// Prefix that receives the percent-encoded target URL
    Wrapped(String),
    Direct,
}

impl AccessPath {
    pub fn apply(&self, target: &str) -> String {
        match self {
            AccessPath::Wrapped(prefix) => format!("{}{}", prefix, urlencoding::encode(target)),
            AccessPath::Direct => target.to_string(),
        }
    }

    /// Comma-separated templates; an empty entry or "direct" is a pass-through
    pub fn parse_list(raw: &str) -> Vec<AccessPath> {
        raw.split(',')
            .map(str::trim)
            .map(|entry| {
                if entry.is_empty() || entry.eq_ignore_ascii_case("direct") {
                    AccessPath::Direct
                } else {
                    AccessPath::Wrapped(entry.to_string())
                }
            })
            .collect()
    }
}

// ============================================================================
// Transport
// ============================================================================

pub trait FeedTransport: Send + Sync + 'static {
    /// GET the URL; a non-success status is an error
    fn get(&self, url: &str) -> impl Future<Output = Result<String>> + Send;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FeedError::Transport(format!("Failed to create HTTP client: {}", e)))?;
        Ok(HttpTransport { client })
    }
}

impl FeedTransport for HttpTransport {
    async fn get(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::CACHE_CONTROL, "no-store")
            .send()
            .await
            .map_err(|e| FeedError::Transport(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(FeedError::Transport(format!("HTTP {}", response.status())));
        }

        response
            .text()
            .await
            .map_err(|e| FeedError::Transport(format!("Failed to read body: {}", e)))
    }
}

// ============================================================================
// Client
// ============================================================================

pub struct FeedClient<T: FeedTransport = HttpTransport> {
    transport: T,
    base_url: String,
    access_paths: Vec<AccessPath>,
}

impl<T: FeedTransport> FeedClient<T> {
    pub fn new(transport: T, base_url: impl Into<String>, access_paths: Vec<AccessPath>) -> Self {
        let access_paths = if access_paths.is_empty() {
            vec![AccessPath::Direct]
        } else {
            access_paths
        };

        FeedClient {
            transport,
            base_url: base_url.into(),
            access_paths,
        }
    }

    #[cfg(test)]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn fetch_command(&self, command: &FeedCommand) -> Result<String> {
        self.fetch(&command.url(&self.base_url)).await
    }

    /// Try each access path in order, returning the first successful body
    pub async fn fetch(&self, target: &str) -> Result<String> {
        for (i, path) in self.access_paths.iter().enumerate() {
            let url = path.apply(target);
            match self.transport.get(&url).await {
                Ok(body) => {
                    debug!("📡 Fetched {} via access path #{}", target, i);
                    return Ok(body);
                }
                Err(e) => {
                    debug!("Access path #{} failed for {}: {}", i, target, e);
                }
            }
        }

        warn!("⚠️  All access paths exhausted for {}", target);
        Err(FeedError::AllPathsExhausted {
            url: target.to_string(),
            attempts: self.access_paths.len(),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory transport answering from a URL-substring table, counting every request
    #[derive(Default)]
    pub struct ScriptedTransport {
        responses: Mutex<HashMap<String, String>>,
        requests: Mutex<Vec<String>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl ScriptedTransport {
        pub fn with_delay(delay: Duration) -> Self {
            ScriptedTransport {
                delay: Some(delay),
                ..Default::default()
            }
        }

        pub fn respond(&self, needle: &str, body: &str) {
            if let Ok(mut responses) = self.responses.lock() {
                responses.insert(needle.to_string(), body.to_string());
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn calls_matching(&self, needle: &str) -> usize {
            self.requests
                .lock()
                .map(|r| r.iter().filter(|u| u.contains(needle)).count())
                .unwrap_or(0)
        }

        pub fn requests(&self) -> Vec<String> {
            self.requests.lock().map(|r| r.clone()).unwrap_or_default()
        }
    }

    impl FeedTransport for ScriptedTransport {
        async fn get(&self, url: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut requests) = self.requests.lock() {
                requests.push(url.to_string());
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let found = self.responses.lock().ok().and_then(|responses| {
                responses
                    .iter()
                    .find(|(needle, _)| url.contains(needle.as_str()))
                    .map(|(_, body)| body.clone())
            });
            found.ok_or_else(|| FeedError::Transport(format!("HTTP 404 for {}", url)))
        }
    }
}
