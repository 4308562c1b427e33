// Snapshot reconciliation: latest vehicle snapshot + previous aggregates -> new aggregates

use std::collections::{BTreeSet, HashMap};

use crate::ttc_api_models::{AggregateMap, FleetClass, RouteAggregate, VehicleRecord, route_number};

const NIGHT_WINDOW_END_HOUR: u32 = 6;

pub fn fleet_class(route_tag: &str) -> FleetClass {
    match route_number(route_tag) {
        Some(300..=399) | Some(500..=599) => FleetClass::Streetcar,
        Some(900..=999) => FleetClass::Express,
        _ => FleetClass::Bus,
    }
}

pub fn is_night_route(route_tag: &str) -> bool {
    matches!(route_number(route_tag), Some(300..=399))
}

/// Night routes are only visible during [00:00, 06:00) local time
pub fn is_visible(route_tag: &str, local_hour: u32) -> bool {
    !is_night_route(route_tag) || local_hour < NIGHT_WINDOW_END_HOUR
}

#[derive(Default)]
struct RouteBatch {
    speed_total: f64,
    vehicles: Vec<VehicleRecord>,
    sub_routes: BTreeSet<String>,
}

/// Build this cycle's aggregates. Routes absent from `vehicles` get no entry,
/// and only the previous aggregate of the same tag feeds the trend fields.
pub fn reconcile(
    vehicles: Vec<VehicleRecord>,
    previous: &AggregateMap,
    local_hour: u32,
) -> AggregateMap {
    let mut batches: HashMap<String, RouteBatch> = HashMap::new();

    for vehicle in vehicles {
        if !is_visible(&vehicle.route_tag, local_hour) {
            continue;
        }
        let batch = batches.entry(vehicle.route_tag.clone()).or_default();
        batch.speed_total += vehicle.speed;
        if let Some(sub) = &vehicle.sub_route {
            batch.sub_routes.insert(sub.clone());
        }
        batch.vehicles.push(vehicle);
    }

    batches
        .into_iter()
        .map(|(tag, batch)| {
            let vehicle_count = batch.vehicles.len();
            let average_speed = batch.speed_total / vehicle_count as f64;

            let (previous_average_speed, previous_vehicle_count) = previous
                .get(&tag)
                .map(|prev| (prev.average_speed, prev.vehicle_count))
                .unwrap_or((average_speed, vehicle_count));

            let aggregate = RouteAggregate {
                average_speed,
                previous_average_speed,
                vehicle_count,
                previous_vehicle_count,
                fleet_class: fleet_class(&tag),
                vehicles: batch.vehicles,
                sub_routes: batch.sub_routes,
            };
            (tag, aggregate)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn vehicle(id: &str, route: &str, speed: f64, sub: Option<&str>) -> VehicleRecord {
        VehicleRecord {
            id: id.to_string(),
            route_tag: route.to_string(),
            lat: 43.65,
            lon: -79.38,
            speed,
            sub_route: sub.map(str::to_string),
            heading: None,
        }
    }

    #[test]
    fn classifies_fleet_by_numeric_range() {
        assert_eq!(fleet_class("504"), FleetClass::Streetcar);
        assert_eq!(fleet_class("301"), FleetClass::Streetcar);
        assert_eq!(fleet_class("927"), FleetClass::Express);
        assert_eq!(fleet_class("29"), FleetClass::Bus);
        assert_eq!(fleet_class("600"), FleetClass::Bus);
        assert_eq!(fleet_class("N1"), FleetClass::Bus);
    }

    #[test]
    fn empty_snapshot_yields_empty_map() {
        assert!(reconcile(Vec::new(), &AggregateMap::new(), 12).is_empty());
    }

    #[test]
    fn averages_speed_and_collects_branches() {
        let vehicles = vec![
            vehicle("1", "504", 10.0, Some("B")),
            vehicle("2", "504", 20.0, Some("A")),
            vehicle("3", "504", 0.0, Some("B")),
            vehicle("4", "29", 30.0, None),
        ];
        let map = reconcile(vehicles, &AggregateMap::new(), 12);

        let king = &map["504"];
        assert_relative_eq!(king.average_speed, 10.0);
        assert_eq!(king.vehicle_count, 3);
        assert_eq!(king.moving_count(), 2);
        assert_eq!(king.fleet_class, FleetClass::Streetcar);
        assert_eq!(king.sub_routes.iter().cloned().collect::<Vec<_>>(), vec!["A", "B"]);

        let dufferin = &map["29"];
        assert!(dufferin.sub_routes.is_empty());
        assert_eq!(dufferin.fleet_class, FleetClass::Bus);
    }

    #[test]
    fn first_appearance_shows_zero_trend() {
        let map = reconcile(vec![vehicle("1", "504", 12.0, None)], &AggregateMap::new(), 12);
        let king = &map["504"];
        assert_eq!(king.previous_average_speed, 12.0);
        assert_eq!(king.previous_vehicle_count, 1);
        assert_eq!(king.fleet_delta(), 0);
        assert_eq!(king.speed_delta(), 0.0);
    }

    #[test]
    fn previous_values_come_from_prior_cycle_only() {
        let first = reconcile(
            vec![vehicle("1", "504", 10.0, Some("A")), vehicle("2", "501", 5.0, None)],
            &AggregateMap::new(),
            12,
        );
        let second = reconcile(
            vec![vehicle("3", "504", 20.0, Some("B")), vehicle("4", "504", 30.0, None)],
            &first,
            12,
        );

        assert!(!second.contains_key("501"));
        let king = &second["504"];
        assert_relative_eq!(king.average_speed, 25.0);
        assert_relative_eq!(king.previous_average_speed, 10.0);
        assert_eq!(king.previous_vehicle_count, 1);
        assert_eq!(king.fleet_delta(), 1);
        let ids: Vec<_> = king.vehicles.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["3", "4"]);
        assert_eq!(king.sub_routes.iter().cloned().collect::<Vec<_>>(), vec!["B"]);
    }

    #[test]
    fn night_routes_follow_the_hour_window() {
        let vehicles = || vec![vehicle("1", "304", 15.0, None)];
        assert!(reconcile(vehicles(), &AggregateMap::new(), 10).is_empty());
        assert!(reconcile(vehicles(), &AggregateMap::new(), 2).contains_key("304"));
        assert!(!is_visible("320", 6));
        assert!(is_visible("320", 0));
        assert!(is_visible("504", 13));
    }
}
