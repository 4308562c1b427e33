// Per-route metadata cache (directions, stops, geometry), loaded at most once per session

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::feed_client::{FeedClient, FeedCommand, FeedTransport};
use crate::feed_parser;
use crate::ttc_api_models::{FeedError, Result, RouteMetadata, RouteTag};

type LoadFuture = Shared<BoxFuture<'static, Result<Arc<RouteMetadata>>>>;
type Slots = Arc<Mutex<HashMap<RouteTag, Slot>>>;

/// A tag with no entry is Empty. Failed loads return the slot to Empty.
enum Slot {
    Loading { id: u64, result: LoadFuture },
    Loaded(Arc<RouteMetadata>),
}

pub struct RouteMetadataCache<T: FeedTransport> {
    client: Arc<FeedClient<T>>,
    slots: Slots,
    next_load: AtomicU64,
}

impl<T: FeedTransport> RouteMetadataCache<T> {
    pub fn new(client: Arc<FeedClient<T>>) -> Self {
        RouteMetadataCache {
            client,
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_load: AtomicU64::new(0),
        }
    }

    /// Cached metadata for a tag, without triggering a fetch
    pub async fn get(&self, route: &str) -> Option<Arc<RouteMetadata>> {
        match self.slots.lock().await.get(route) {
            Some(Slot::Loaded(meta)) => Some(meta.clone()),
            _ => None,
        }
    }

    pub async fn loaded_count(&self) -> usize {
        self.slots
            .lock()
            .await
            .values()
            .filter(|s| matches!(s, Slot::Loaded(_)))
            .count()
    }

    /// Return cached metadata, or fetch and cache it. A caller arriving while a
    /// load for the same tag is in flight awaits that load instead of fetching again.
    /// The load runs as its own task, so it still fills the cache if every caller
    /// stops waiting.
    pub async fn ensure_loaded(&self, route: &str) -> Result<Arc<RouteMetadata>> {
        let pending = {
            let mut slots = self.slots.lock().await;
            match slots.get(route) {
                Some(Slot::Loaded(meta)) => return Ok(meta.clone()),
                Some(Slot::Loading { result, .. }) => result.clone(),
                None => {
                    let id = self.next_load.fetch_add(1, Ordering::Relaxed);
                    let result = self.spawn_load(id, route.to_string());
                    slots.insert(
                        route.to_string(),
                        Slot::Loading {
                            id,
                            result: result.clone(),
                        },
                    );
                    result
                }
            }
        };

        pending.await
    }

    /// The spawned task blocks on the slot lock until the caller has recorded
    /// the Loading slot, then settles that slot itself.
    fn spawn_load(&self, id: u64, route: RouteTag) -> LoadFuture {
        let client = self.client.clone();
        let slots = self.slots.clone();
        let task_route = route.clone();

        let handle = tokio::spawn(async move {
            let result = Self::load(client, &task_route).await;
            settle(&slots, &task_route, id, result.as_ref().ok().cloned()).await;
            result
        });

        let slots = self.slots.clone();
        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    settle(&slots, &route, id, None).await;
                    Err(FeedError::MetadataLoadFailed {
                        route,
                        source: Box::new(FeedError::Transport(format!("load task failed: {}", e))),
                    })
                }
            }
        }
        .boxed()
        .shared()
    }

    async fn load(client: Arc<FeedClient<T>>, route: &str) -> Result<Arc<RouteMetadata>> {
        let command = FeedCommand::RouteConfig {
            route: route.to_string(),
        };
        let loaded = client
            .fetch_command(&command)
            .await
            .and_then(|text| feed_parser::parse_route_config(&text));

        let meta = match loaded {
            Ok(meta) => meta,
            Err(e) => {
                warn!("⚠️  Route {} config failed: {}", route, e);
                return Err(FeedError::MetadataLoadFailed {
                    route: route.to_string(),
                    source: Box::new(e),
                });
            }
        };

        info!(
            "🗺️  Route {} config cached: {} directions, {} stops, {} path segments",
            route,
            meta.direction_table.len(),
            meta.stops.len(),
            meta.geometry_segments.len()
        );
        Ok(Arc::new(meta))
    }
}

/// Replace the Loading slot of load `id` with the outcome; a newer load keeps its slot
async fn settle(slots: &Slots, route: &str, id: u64, loaded: Option<Arc<RouteMetadata>>) {
    let mut slots = slots.lock().await;
    let still_ours = matches!(
        slots.get(route),
        Some(Slot::Loading { id: current, .. }) if *current == id
    );
    if !still_ours {
        return;
    }
    match loaded {
        Some(meta) => {
            slots.insert(route.to_string(), Slot::Loaded(meta));
        }
        None => {
            slots.remove(route);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed_client::AccessPath;
    use crate::feed_client::testing::ScriptedTransport;
    use std::time::Duration;

    const CONFIG_504: &str = r#"<body><route tag="504" title="504-King">
        <stop tag="1" title="King St West At Spadina Ave" lat="43.645" lon="-79.395"/>
        <direction tag="504_0_504A" title="East - 504a King towards Broadview Station" name="East"/>
        <path><point lat="43.1" lon="-79.1"/></path>
    </route></body>"#;

    fn cache_with(transport: ScriptedTransport) -> RouteMetadataCache<ScriptedTransport> {
        let client = FeedClient::new(transport, "https://feed.test/x?a=ttc", vec![AccessPath::Direct]);
        RouteMetadataCache::new(Arc::new(client))
    }

    #[tokio::test]
    async fn second_call_after_load_does_not_fetch() {
        let transport = ScriptedTransport::default();
        transport.respond("command=routeConfig&r=504", CONFIG_504);
        let cache = cache_with(transport);

        let first = cache.ensure_loaded("504").await.unwrap();
        let second = cache.ensure_loaded("504").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.client.transport().calls(), 1);
        assert_eq!(first.stops.len(), 1);
        assert!(cache.get("504").await.is_some());
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let transport = ScriptedTransport::with_delay(Duration::from_millis(20));
        transport.respond("command=routeConfig&r=504", CONFIG_504);
        let cache = cache_with(transport);

        let (a, b) = tokio::join!(cache.ensure_loaded("504"), cache.ensure_loaded("504"));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(cache.client.transport().calls(), 1);
        assert_eq!(cache.loaded_count().await, 1);
    }

    #[tokio::test]
    async fn failed_load_leaves_slot_empty_and_allows_retry() {
        let cache = cache_with(ScriptedTransport::default());

        match cache.ensure_loaded("504").await {
            Err(FeedError::MetadataLoadFailed { route, source }) => {
                assert_eq!(route, "504");
                assert!(matches!(*source, FeedError::AllPathsExhausted { .. }));
            }
            other => panic!("expected metadata failure, got {:?}", other.map(|_| ())),
        }
        assert!(cache.get("504").await.is_none());
        assert_eq!(cache.loaded_count().await, 0);

        cache.client.transport().respond("command=routeConfig&r=504", CONFIG_504);
        assert!(cache.ensure_loaded("504").await.is_ok());
        assert_eq!(cache.client.transport().calls(), 2);
    }

    #[tokio::test]
    async fn abandoned_load_still_fills_the_cache() {
        let transport = ScriptedTransport::with_delay(Duration::from_millis(50));
        transport.respond("command=routeConfig&r=504", CONFIG_504);
        let cache = cache_with(transport);

        let waited = tokio::time::timeout(Duration::from_millis(10), cache.ensure_loaded("504")).await;
        assert!(waited.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(cache.get("504").await.is_some());
        assert_eq!(cache.loaded_count().await, 1);

        // later activations reuse the result without fetching again
        assert!(cache.ensure_loaded("504").await.is_ok());
        assert_eq!(cache.client.transport().calls(), 1);
    }

    #[tokio::test]
    async fn malformed_config_is_not_cached() {
        let transport = ScriptedTransport::default();
        transport.respond("command=routeConfig&r=504", "<body><route");
        let cache = cache_with(transport);

        assert!(cache.ensure_loaded("504").await.is_err());
        assert!(cache.get("504").await.is_none());
    }
}
