// Aggregate statistics across routes, trended against the previous cycle

use std::collections::HashMap;

use crate::ttc_api_models::{
    AggregateMap, FleetMode, GlobalStats, GlobalSummary, RouteTag, Trend, natural_cmp,
};

/// Retains the last emitted figures so the next summary can trend against them
#[derive(Debug, Default)]
pub struct StatsTracker {
    previous: GlobalStats,
    mode: FleetMode,
    latest: Option<GlobalSummary>,
}

impl StatsTracker {
    pub fn new(mode: FleetMode) -> Self {
        StatsTracker {
            mode,
            ..Default::default()
        }
    }

    pub fn mode(&self) -> FleetMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: FleetMode) {
        self.mode = mode;
    }

    pub fn latest(&self) -> Option<&GlobalSummary> {
        self.latest.as_ref()
    }

    /// Compute the summary for the active fleet mode and retain it as "previous"
    pub fn summarize(
        &mut self,
        aggregates: &AggregateMap,
        route_names: &HashMap<RouteTag, String>,
    ) -> GlobalSummary {
        let summary = summarize(aggregates, self.mode, self.previous, route_names);
        self.previous = summary.stats;
        self.latest = Some(summary.clone());
        summary
    }
}

pub fn summarize(
    aggregates: &AggregateMap,
    mode: FleetMode,
    previous: GlobalStats,
    route_names: &HashMap<RouteTag, String>,
) -> GlobalSummary {
    let mut tags: Vec<&RouteTag> = aggregates
        .iter()
        .filter(|(_, agg)| mode.includes(agg.fleet_class))
        .map(|(tag, _)| tag)
        .collect();
    tags.sort_by(|a, b| natural_cmp(a, b));

    let mut weighted_speed = 0.0;
    let mut count = 0usize;
    let mut top: Option<(&RouteTag, f64)> = None;

    for &tag in &tags {
        let agg = &aggregates[tag];
        weighted_speed += agg.average_speed * agg.vehicle_count as f64;
        count += agg.vehicle_count;
        if top.is_none_or(|(_, best)| agg.average_speed > best) {
            top = Some((tag, agg.average_speed));
        }
    }

    let speed = if count > 0 { weighted_speed / count as f64 } else { 0.0 };
    let stats = GlobalStats { speed, count };

    let top_route = top.map(|(tag, _)| tag.clone());
    let top_route_name = top_route.as_ref().map(|tag| {
        route_names
            .get(tag)
            .cloned()
            .unwrap_or_else(|| aggregates[tag].fleet_class.fallback_name().to_string())
    });

    GlobalSummary {
        mode,
        stats,
        speed_trend: Trend::from_delta(speed - previous.speed),
        count_trend: Trend::from_delta(count as f64 - previous.count as f64),
        top_route,
        top_route_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ttc_api_models::{FleetClass, RouteAggregate};
    use approx::assert_relative_eq;
    use std::collections::BTreeSet;

    fn aggregate(avg: f64, count: usize, class: FleetClass) -> RouteAggregate {
        RouteAggregate {
            average_speed: avg,
            previous_average_speed: avg,
            vehicle_count: count,
            previous_vehicle_count: count,
            fleet_class: class,
            vehicles: Vec::new(),
            sub_routes: BTreeSet::new(),
        }
    }

    #[test]
    fn fleet_weighted_average() {
        let map = AggregateMap::from([
            ("A".to_string(), aggregate(10.0, 2, FleetClass::Bus)),
            ("B".to_string(), aggregate(20.0, 1, FleetClass::Bus)),
        ]);
        let summary = summarize(&map, FleetMode::All, GlobalStats::default(), &HashMap::new());
        assert_relative_eq!(summary.stats.speed, 40.0 / 3.0, epsilon = 1e-9);
        assert_eq!(summary.stats.count, 3);
        assert_eq!(summary.top_route.as_deref(), Some("B"));
        assert_eq!(summary.top_route_name.as_deref(), Some("Bus"));
    }

    #[test]
    fn empty_filter_reports_no_top_route() {
        let map = AggregateMap::from([("29".to_string(), aggregate(18.0, 4, FleetClass::Bus))]);
        let summary = summarize(
            &map,
            FleetMode::Streetcar,
            GlobalStats { speed: 12.0, count: 5 },
            &HashMap::new(),
        );
        assert_eq!(summary.stats, GlobalStats { speed: 0.0, count: 0 });
        assert_eq!(summary.top_route, None);
        assert_eq!(summary.top_route_name, None);
        assert_eq!(summary.speed_trend, Trend::Down(12.0));
        assert_eq!(summary.count_trend, Trend::Down(5.0));
    }

    #[test]
    fn ties_keep_first_route_in_numeric_order() {
        let map = AggregateMap::from([
            ("504".to_string(), aggregate(15.0, 3, FleetClass::Streetcar)),
            ("1000".to_string(), aggregate(15.0, 1, FleetClass::Streetcar)),
            ("501".to_string(), aggregate(15.0, 2, FleetClass::Streetcar)),
        ]);
        let names = HashMap::from([("501".to_string(), "Queen".to_string())]);
        let summary = summarize(&map, FleetMode::Streetcar, GlobalStats::default(), &names);
        assert_eq!(summary.top_route.as_deref(), Some("501"));
        assert_eq!(summary.top_route_name.as_deref(), Some("Queen"));
    }

    #[test]
    fn bus_mode_includes_express() {
        let map = AggregateMap::from([
            ("504".to_string(), aggregate(10.0, 3, FleetClass::Streetcar)),
            ("927".to_string(), aggregate(30.0, 1, FleetClass::Express)),
            ("29".to_string(), aggregate(20.0, 1, FleetClass::Bus)),
        ]);
        let summary = summarize(&map, FleetMode::Bus, GlobalStats::default(), &HashMap::new());
        assert_eq!(summary.stats.count, 2);
        assert_eq!(summary.top_route.as_deref(), Some("927"));
        assert_eq!(summary.top_route_name.as_deref(), Some("Express Bus"));
    }

    #[test]
    fn tracker_trends_against_last_emission() {
        let mut tracker = StatsTracker::new(FleetMode::All);
        let names = HashMap::new();

        let at = |speed: f64| {
            AggregateMap::from([("29".to_string(), aggregate(speed, 1, FleetClass::Bus))])
        };

        tracker.summarize(&at(20.0), &names);
        assert_eq!(tracker.previous, GlobalStats { speed: 20.0, count: 1 });

        let stable = tracker.summarize(&at(20.0005), &names);
        assert_eq!(stable.speed_trend, Trend::Stable);
        assert_eq!(stable.count_trend, Trend::Stable);

        let up = tracker.summarize(&at(20.15), &names);
        match up.speed_trend {
            Trend::Up(delta) => assert_relative_eq!(delta, 0.1495, epsilon = 1e-9),
            other => panic!("expected up trend, got {:?}", other),
        }
        assert_eq!(tracker.latest(), Some(&up));
    }
}
