// Reconciliation engine: owns all session state and runs poll cycles

use chrono::{Timelike, Utc};
use chrono_tz::Tz;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::direction::{DirectionResolver, MemoryPolicy};
use crate::feed_client::{FeedClient, FeedCommand, FeedTransport, HttpTransport};
use crate::feed_parser;
use crate::reconciler;
use crate::route_cache::RouteMetadataCache;
use crate::stats::StatsTracker;
use crate::ttc_api_models::{
    AggregateMap, FeedError, FeedStatus, FleetMode, GlobalSummary, Prediction, Result,
    RouteAggregate, RouteMetadata, RouteTag, VehicleSnapshot, get_current_timestamp,
};
use crate::view_model::{self, RouteListing, VehicleDetail};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Updated { routes: usize, vehicles: usize },
    /// Another cycle was already running
    Skipped,
}

struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct TransitEngine<T: FeedTransport = HttpTransport> {
    client: Arc<FeedClient<T>>,
    metadata: RouteMetadataCache<T>,
    route_names: RwLock<HashMap<RouteTag, String>>,
    aggregates: RwLock<Arc<AggregateMap>>,
    resolver: Mutex<DirectionResolver>,
    stats: Mutex<StatsTracker>,
    status: RwLock<FeedStatus>,
    refreshing: AtomicBool,
    timezone: Tz,
}

impl<T: FeedTransport> TransitEngine<T> {
    pub fn new(client: FeedClient<T>, timezone: Tz, memory_policy: MemoryPolicy) -> Self {
        let client = Arc::new(client);
        TransitEngine {
            metadata: RouteMetadataCache::new(client.clone()),
            client,
            route_names: RwLock::new(HashMap::new()),
            aggregates: RwLock::new(Arc::new(AggregateMap::new())),
            resolver: Mutex::new(DirectionResolver::new(memory_policy)),
            stats: Mutex::new(StatsTracker::new(FleetMode::default())),
            status: RwLock::new(FeedStatus::Pending),
            refreshing: AtomicBool::new(false),
            timezone,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn local_hour(&self) -> u32 {
        Utc::now().with_timezone(&self.timezone).hour()
    }

    // ========================================================================
    // Feed Ingestion
    // ========================================================================

    /// Fetch the route list once; friendly names are display-only so failure is tolerated by callers
    pub async fn load_route_names(&self) -> Result<usize> {
        let text = self.client.fetch_command(&FeedCommand::RouteList).await?;
        let routes = feed_parser::parse_route_list(&text)?;

        let mut names = self.route_names.write().await;
        for route in routes {
            names.insert(route.tag, route.name);
        }
        info!("🚏 Loaded {} route names", names.len());
        Ok(names.len())
    }

    /// One fetch-and-reconcile cycle. Overlapping calls are skipped, not queued.
    pub async fn poll(&self) -> Result<PollOutcome> {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Poll cycle already running, skipping tick");
            return Ok(PollOutcome::Skipped);
        }
        let _guard = RefreshGuard(&self.refreshing);

        let command = FeedCommand::VehicleLocations {
            since: 0,
            cache_buster: Utc::now().timestamp_millis(),
        };
        let fetched = self
            .client
            .fetch_command(&command)
            .await
            .and_then(|text| feed_parser::parse_vehicle_locations(&text));

        match fetched {
            Ok(snapshot) => Ok(self.apply_snapshot(snapshot, self.local_hour()).await),
            Err(e) => {
                warn!("⚠️  Poll cycle failed, keeping last good state: {}", e);
                *self.status.write().await = FeedStatus::Stale {
                    since: get_current_timestamp(),
                    error: e.to_string(),
                };
                Err(e)
            }
        }
    }

    /// Synchronous completion step of a poll cycle: reconcile, summarize, publish
    pub async fn apply_snapshot(&self, snapshot: VehicleSnapshot, local_hour: u32) -> PollOutcome {
        let present: HashSet<String> = snapshot.vehicles.iter().map(|v| v.id.clone()).collect();
        let names = self.route_names.read().await;
        let mut aggregates = self.aggregates.write().await;
        let mut stats = self.stats.lock().await;
        let mut resolver = self.resolver.lock().await;

        let next = reconciler::reconcile(snapshot.vehicles, &aggregates, local_hour);
        let vehicles = next.values().map(|a| a.vehicle_count).sum();
        let routes = next.len();

        *aggregates = Arc::new(next);
        let summary = stats.summarize(&aggregates, &names);

        let evicted = resolver.observe_cycle(&present.iter().map(String::as_str).collect());
        if evicted > 0 {
            debug!("Evicted {} stale destination entries", evicted);
        }

        *self.status.write().await = FeedStatus::Live {
            updated_at: get_current_timestamp(),
            feed_time: snapshot.last_time,
        };

        debug!(
            "✓ Cycle reconciled: {} routes, {} vehicles ({} dropped), {} km/h fleet average",
            routes, vehicles, snapshot.dropped, summary.stats.speed
        );
        PollOutcome::Updated { routes, vehicles }
    }

    // ========================================================================
    // Route Metadata
    // ========================================================================

    pub async fn ensure_route_loaded(&self, route: &str) -> Result<Arc<RouteMetadata>> {
        self.metadata.ensure_loaded(route).await
    }

    /// Cached metadata only; never triggers a fetch
    pub async fn cached_metadata(&self, route: &str) -> Result<Arc<RouteMetadata>> {
        self.metadata
            .get(route)
            .await
            .ok_or_else(|| FeedError::MetadataNotCached(route.to_string()))
    }

    pub async fn predictions(&self, route: &str, stop: &str) -> Result<Vec<Prediction>> {
        let command = FeedCommand::Predictions {
            route: route.to_string(),
            stop: stop.to_string(),
        };
        let text = self.client.fetch_command(&command).await?;
        feed_parser::parse_predictions(&text, route)
    }

    // ========================================================================
    // Read Access
    // ========================================================================

    pub async fn aggregates(&self) -> Arc<AggregateMap> {
        self.aggregates.read().await.clone()
    }

    pub async fn route(&self, route: &str) -> Result<RouteAggregate> {
        self.aggregates()
            .await
            .get(route)
            .cloned()
            .ok_or_else(|| FeedError::UnknownRoute(route.to_string()))
    }

    pub async fn status(&self) -> FeedStatus {
        self.status.read().await.clone()
    }

    pub async fn summary(&self) -> Option<GlobalSummary> {
        self.stats.lock().await.latest().cloned()
    }

    pub async fn mode(&self) -> FleetMode {
        self.stats.lock().await.mode()
    }

    /// Switch the hero-stat fleet mode and re-summarize immediately
    pub async fn set_mode(&self, mode: FleetMode) -> GlobalSummary {
        let names = self.route_names.read().await;
        let aggregates = self.aggregates.read().await;
        let mut stats = self.stats.lock().await;
        stats.set_mode(mode);
        stats.summarize(&aggregates, &names)
    }

    pub async fn route_listing(&self, mode: FleetMode, query: &str) -> Vec<RouteListing> {
        self.route_listing_at(mode, query, self.local_hour()).await
    }

    pub async fn route_listing_at(&self, mode: FleetMode, query: &str, local_hour: u32) -> Vec<RouteListing> {
        let names = self.route_names.read().await;
        let aggregates = self.aggregates.read().await;
        view_model::route_listing(&aggregates, &names, mode, query, local_hour)
    }

    pub async fn resolve_destination(&self, vehicle_id: &str, route: &str, heading: Option<f64>) -> String {
        let metadata = self.metadata.get(route).await;
        self.resolver
            .lock()
            .await
            .resolve(vehicle_id, metadata.as_deref().map(|m| &m.direction_table), heading)
    }

    /// Destination label of one reporting vehicle, from its current heading
    pub async fn vehicle_destination(&self, route: &str, vehicle_id: &str) -> Result<String> {
        let aggregate = self.route(route).await?;
        let vehicle = aggregate
            .vehicles
            .iter()
            .find(|v| v.id == vehicle_id)
            .ok_or_else(|| FeedError::UnknownVehicle {
                route: route.to_string(),
                vehicle: vehicle_id.to_string(),
            })?;
        Ok(self.resolve_destination(&vehicle.id, route, vehicle.heading).await)
    }

    pub async fn vehicle_details(&self, route: &str, branch: Option<&str>) -> Result<Vec<VehicleDetail>> {
        let aggregate = self.route(route).await?;
        let metadata = self.metadata.get(route).await;
        let mut resolver = self.resolver.lock().await;
        Ok(view_model::vehicle_details(
            &aggregate,
            branch,
            metadata.as_deref(),
            &mut resolver,
        ))
    }

    pub async fn remembered_destinations(&self) -> usize {
        self.resolver.lock().await.len()
    }

    pub async fn cached_route_count(&self) -> usize {
        self.metadata.loaded_count().await
    }
}
