// Read-only view structures handed to the renderer

use serde::Serialize;
use std::collections::HashMap;

use crate::direction::DirectionResolver;
use crate::reconciler::{is_night_route, is_visible};
use crate::ttc_api_models::{
    AggregateMap, FleetClass, FleetMode, RouteAggregate, RouteMetadata, RouteTag, natural_cmp,
};

/// Speed deltas at or below this are not worth showing on a route card
pub const ROUTE_SPEED_TREND_THRESHOLD: f64 = 0.1;
/// Vehicles at or below this speed are shown as stopped
pub const STOPPED_SPEED: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteListing {
    pub tag: RouteTag,
    pub name: String,
    pub night: bool,
    pub fleet_class: FleetClass,
    pub vehicle_count: usize,
    pub moving_count: usize,
    pub average_speed: f64,
    /// Vehicles joined (+) or left (-) since the last cycle; None when unchanged
    pub fleet_trend: Option<i64>,
    /// None when the change is within the display threshold
    pub speed_trend: Option<f64>,
    pub sub_routes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleDetail {
    pub id: String,
    pub label: String,
    pub lat: f64,
    pub lon: f64,
    pub speed: f64,
    pub stopped: bool,
    pub sub_route: Option<String>,
    pub destination: String,
    /// Nearest stop of the route; None until the route's metadata is cached
    pub next_stop: Option<String>,
}

pub fn display_name(tag: &str, class: FleetClass, route_names: &HashMap<RouteTag, String>) -> String {
    route_names
        .get(tag)
        .cloned()
        .unwrap_or_else(|| class.fallback_name().to_string())
}

fn matches_query(tag: &str, name: Option<&String>, query: &str) -> bool {
    if query.is_empty() {
        return true;
    }
    tag.to_lowercase().contains(query)
        || name.map(|n| n.to_lowercase().contains(query)).unwrap_or(false)
}

fn listing(tag: &str, agg: &RouteAggregate, route_names: &HashMap<RouteTag, String>) -> RouteListing {
    let fleet_delta = agg.fleet_delta();
    let speed_delta = agg.speed_delta();

    RouteListing {
        tag: tag.to_string(),
        name: display_name(tag, agg.fleet_class, route_names),
        night: is_night_route(tag),
        fleet_class: agg.fleet_class,
        vehicle_count: agg.vehicle_count,
        moving_count: agg.moving_count(),
        average_speed: agg.average_speed,
        fleet_trend: (fleet_delta != 0).then_some(fleet_delta),
        speed_trend: (speed_delta.abs() > ROUTE_SPEED_TREND_THRESHOLD).then_some(speed_delta),
        sub_routes: agg.sub_routes.iter().cloned().collect(),
    }
}

/// Routes for the list view: visible at `local_hour`, in the fleet mode,
/// matching the search query, in numeric-aware tag order
pub fn route_listing(
    aggregates: &AggregateMap,
    route_names: &HashMap<RouteTag, String>,
    mode: FleetMode,
    query: &str,
    local_hour: u32,
) -> Vec<RouteListing> {
    let query = query.trim().to_lowercase();

    let mut rows: Vec<RouteListing> = aggregates
        .iter()
        .filter(|(tag, _)| is_visible(tag, local_hour))
        .filter(|(tag, _)| matches_query(tag, route_names.get(*tag), &query))
        .filter(|(_, agg)| mode.includes(agg.fleet_class))
        .map(|(tag, agg)| listing(tag, agg, route_names))
        .collect();

    rows.sort_by(|a, b| natural_cmp(&a.tag, &b.tag));
    rows
}

/// Vehicles of one route, optionally restricted to a branch code
pub fn vehicle_details(
    aggregate: &RouteAggregate,
    branch: Option<&str>,
    metadata: Option<&RouteMetadata>,
    resolver: &mut DirectionResolver,
) -> Vec<VehicleDetail> {
    aggregate
        .vehicles
        .iter()
        .filter(|v| branch.is_none_or(|b| v.sub_route.as_deref() == Some(b)))
        .map(|v| VehicleDetail {
            id: v.id.clone(),
            label: v.display_label(),
            lat: v.lat,
            lon: v.lon,
            speed: v.speed,
            stopped: v.speed <= STOPPED_SPEED,
            sub_route: v.sub_route.clone(),
            destination: resolver.resolve(&v.id, metadata.map(|m| &m.direction_table), v.heading),
            next_stop: metadata
                .filter(|_| v.has_position())
                .and_then(|m| m.nearest_stop(v.lat, v.lon))
                .map(|s| s.short_title.clone()),
        })
        .collect()
}
