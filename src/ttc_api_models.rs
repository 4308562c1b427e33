// Data structures and error handling for the TTC live board
// Upstream feed: Umo IQ (formerly NextBus) public XML feed, agency "ttc"
//
// Feed commands used:
// - routeList:        every route tag with its display title
// - vehicleLocations: live position/speed/heading of every reporting vehicle
// - routeConfig:      directions, stops and path geometry of one route
// - predictions:      arrival predictions for one stop of one route

use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

pub type RouteTag = String;

// ============================================================================
// Feed Records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSummary {
    pub tag: RouteTag,
    pub title: String,
    /// Friendly name derived from the title (text after the first hyphen)
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleRecord {
    pub id: String,
    pub route_tag: RouteTag,
    pub lat: f64,
    pub lon: f64,
    pub speed: f64,
    pub sub_route: Option<String>,
    pub heading: Option<f64>,
}

impl VehicleRecord {
    pub fn has_position(&self) -> bool {
        self.lat.is_finite() && self.lon.is_finite()
    }

    pub fn is_moving(&self) -> bool {
        self.speed > 0.0
    }

    /// Route tag plus branch code, e.g. "504A"
    pub fn display_label(&self) -> String {
        match &self.sub_route {
            Some(sub) => format!("{}{}", self.route_tag, sub),
            None => self.route_tag.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VehicleSnapshot {
    pub vehicles: Vec<VehicleRecord>,
    pub last_time: Option<i64>,
    pub dropped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub tag: String,
    pub external_id: Option<String>,
    pub short_title: String,
    pub full_title: String,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteMetadata {
    /// Direction name ("East", "West", ...) to human title
    pub direction_table: HashMap<String, String>,
    pub stops: Vec<Stop>,
    /// Each segment is an ordered list of [lat, lon] pairs
    pub geometry_segments: Vec<Vec<[f64; 2]>>,
}

impl RouteMetadata {
    pub fn nearest_stop(&self, lat: f64, lon: f64) -> Option<&Stop> {
        self.stops
            .iter()
            .map(|s| (s, ((s.lat - lat).powi(2) + (s.lon - lon).powi(2)).sqrt()))
            .filter(|(_, d)| d.is_finite())
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
            .map(|(s, _)| s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub epoch_ms: Option<i64>,
    pub minutes: i64,
    pub branch: String,
    pub destination: String,
    pub vehicle: Option<String>,
}

// ============================================================================
// Reconciled State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FleetClass {
    Streetcar,
    Bus,
    Express,
}

impl FleetClass {
    /// Display name used when the route list has no friendly name for a tag
    pub fn fallback_name(self) -> &'static str {
        match self {
            FleetClass::Express => "Express Bus",
            FleetClass::Streetcar | FleetClass::Bus => "Bus",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FleetMode {
    #[default]
    Streetcar,
    Bus,
    All,
}

impl FleetMode {
    pub fn includes(self, class: FleetClass) -> bool {
        match self {
            FleetMode::Streetcar => class == FleetClass::Streetcar,
            FleetMode::Bus => class != FleetClass::Streetcar,
            FleetMode::All => true,
        }
    }
}

impl FromStr for FleetMode {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "streetcar" => Ok(FleetMode::Streetcar),
            "bus" => Ok(FleetMode::Bus),
            "all" | "network" => Ok(FleetMode::All),
            other => Err(FeedError::InvalidRequest(format!("unknown fleet mode '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteAggregate {
    pub average_speed: f64,
    pub previous_average_speed: f64,
    pub vehicle_count: usize,
    pub previous_vehicle_count: usize,
    pub fleet_class: FleetClass,
    pub vehicles: Vec<VehicleRecord>,
    pub sub_routes: BTreeSet<String>,
}

impl RouteAggregate {
    pub fn moving_count(&self) -> usize {
        self.vehicles.iter().filter(|v| v.is_moving()).count()
    }

    pub fn fleet_delta(&self) -> i64 {
        self.vehicle_count as i64 - self.previous_vehicle_count as i64
    }

    pub fn speed_delta(&self) -> f64 {
        self.average_speed - self.previous_average_speed
    }
}

pub type AggregateMap = HashMap<RouteTag, RouteAggregate>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalStats {
    pub speed: f64,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "direction", content = "delta", rename_all = "lowercase")]
pub enum Trend {
    Up(f64),
    Down(f64),
    Stable,
}

impl Trend {
    pub const EPSILON: f64 = 0.001;

    pub fn from_delta(delta: f64) -> Self {
        if delta.abs() < Self::EPSILON {
            Trend::Stable
        } else if delta > 0.0 {
            Trend::Up(delta)
        } else {
            Trend::Down(delta.abs())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSummary {
    pub mode: FleetMode,
    pub stats: GlobalStats,
    pub speed_trend: Trend,
    pub count_trend: Trend,
    /// None when no route passes the fleet filter
    pub top_route: Option<RouteTag>,
    pub top_route_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum FeedStatus {
    Pending,
    /// `feed_time` is the upstream report time in epoch milliseconds, when the feed sends one
    Live { updated_at: i64, feed_time: Option<i64> },
    Stale { since: i64, error: String },
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum FeedError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("All {attempts} access paths exhausted for {url}")]
    AllPathsExhausted { url: String, attempts: usize },

    #[error("Malformed feed: {0}")]
    MalformedFeed(String),

    #[error("Metadata load failed for route {route}: {source}")]
    MetadataLoadFailed {
        route: RouteTag,
        #[source]
        source: Box<FeedError>,
    },

    #[error("Unknown route: {0}")]
    UnknownRoute(RouteTag),

    #[error("Vehicle {vehicle} is not reporting on route {route}")]
    UnknownVehicle { route: RouteTag, vehicle: String },

    #[error("Route {0} metadata is not cached")]
    MetadataNotCached(RouteTag),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

pub type Result<T> = std::result::Result<T, FeedError>;

// ============================================================================
// Helpers
// ============================================================================

/// Leading integer of a route tag ("504" -> 504, "510A" -> 510, "N1" -> None)
pub fn route_number(tag: &str) -> Option<u32> {
    let trimmed = tag.trim_start();
    let end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    trimmed[..end].parse().ok()
}

/// Numeric-aware string ordering: digit runs compare by value, so "7" < "29" < "504"
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();

    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) if l.is_ascii_digit() && r.is_ascii_digit() => {
                let mut ln = String::new();
                while let Some(c) = left.next_if(|c| c.is_ascii_digit()) {
                    ln.push(c);
                }
                let mut rn = String::new();
                while let Some(c) = right.next_if(|c| c.is_ascii_digit()) {
                    rn.push(c);
                }
                let lv = ln.trim_start_matches('0');
                let rv = rn.trim_start_matches('0');
                let ord = lv.len().cmp(&rv.len()).then_with(|| lv.cmp(rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(l), Some(r)) => {
                let ord = l.to_lowercase().cmp(r.to_lowercase());
                if ord != Ordering::Equal {
                    return ord;
                }
                left.next();
                right.next();
            }
        }
    }
}

pub fn format_timestamp_full(timestamp: i64, tz: Tz) -> String {
    match Utc.timestamp_opt(timestamp, 0).single() {
        Some(dt) => dt.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S").to_string(),
        None => format!("Invalid timestamp: {}", timestamp),
    }
}

pub fn get_current_timestamp() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_number_reads_leading_digits() {
        assert_eq!(route_number("504"), Some(504));
        assert_eq!(route_number("510A"), Some(510));
        assert_eq!(route_number("N1"), None);
        assert_eq!(route_number(""), None);
    }

    #[test]
    fn natural_order_sorts_tags_by_value() {
        let mut tags = vec!["504", "29", "7", "1000", "501", "29A"];
        tags.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(tags, vec!["7", "29", "29A", "501", "504", "1000"]);
    }

    #[test]
    fn trend_below_epsilon_is_stable() {
        assert_eq!(Trend::from_delta(20.0005 - 20.0), Trend::Stable);
        match Trend::from_delta(20.15 - 20.0) {
            Trend::Up(d) => assert!((d - 0.15).abs() < 1e-9),
            other => panic!("expected up trend, got {:?}", other),
        }
        assert_eq!(Trend::from_delta(-2.0), Trend::Down(2.0));
    }

    #[test]
    fn fleet_mode_filters_classes() {
        assert!(FleetMode::Streetcar.includes(FleetClass::Streetcar));
        assert!(!FleetMode::Streetcar.includes(FleetClass::Express));
        assert!(FleetMode::Bus.includes(FleetClass::Express));
        assert!(!FleetMode::Bus.includes(FleetClass::Streetcar));
        assert!(FleetMode::All.includes(FleetClass::Bus));
        assert_eq!("BUS".parse::<FleetMode>().ok(), Some(FleetMode::Bus));
        assert!("tram".parse::<FleetMode>().is_err());
    }

    #[test]
    fn nearest_stop_uses_planar_distance() {
        let stop = |tag: &str, lat: f64, lon: f64| Stop {
            tag: tag.to_string(),
            external_id: None,
            short_title: tag.to_string(),
            full_title: tag.to_string(),
            lat,
            lon,
        };
        let meta = RouteMetadata {
            stops: vec![stop("a", 43.60, -79.40), stop("b", 43.65, -79.38)],
            ..Default::default()
        };
        assert_eq!(meta.nearest_stop(43.649, -79.381).map(|s| s.tag.as_str()), Some("b"));
        assert!(RouteMetadata::default().nearest_stop(43.0, -79.0).is_none());
    }
}
