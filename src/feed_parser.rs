// Parsing of the upstream XML feed into typed records
//
// Records missing a mandatory identity attribute are skipped individually; only a
// document that is not well-formed (or an upstream <Error> body) fails the batch.

use regex::Regex;
use roxmltree::{Document, Node};
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::debug;

use crate::ttc_api_models::{
    FeedError, Prediction, Result, RouteMetadata, RouteSummary, Stop, VehicleRecord,
    VehicleSnapshot,
};

static BRANCH_CODE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_(\d+)([A-Z])").expect("valid branch code pattern"));
static TOWARDS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)towards (.*)").expect("valid destination pattern"));

fn parse_document(text: &str) -> Result<Document<'_>> {
    let doc = Document::parse(text)
        .map_err(|e| FeedError::MalformedFeed(format!("Invalid XML: {}", e)))?;

    if let Some(err) = doc.descendants().find(|n| n.has_tag_name("Error")) {
        let message = err.text().map(str::trim).unwrap_or("unspecified");
        return Err(FeedError::MalformedFeed(format!("Upstream error: {}", message)));
    }

    Ok(doc)
}

fn elements<'a, 'input>(
    doc: &'a Document<'input>,
    name: &'static str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    doc.descendants().filter(move |n| n.has_tag_name(name))
}

fn attr_f64(node: &Node, name: &str) -> Option<f64> {
    node.attribute(name)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

fn non_empty<'a>(node: &Node<'a, '_>, name: &str) -> Option<&'a str> {
    node.attribute(name).filter(|v| !v.trim().is_empty())
}

// ============================================================================
// Field Rules
// ============================================================================

/// "511-Bathurst" -> "Bathurst"; titles without a hyphen are kept whole
pub fn friendly_route_name(title: &str) -> String {
    match title.split_once('-') {
        Some((_, rest)) => rest.trim().to_string(),
        None => title.to_string(),
    }
}

/// Branch letter from a direction tag: first `_<digits><A-Z>` match, "504_0_504A" -> "A"
pub fn branch_code(dir_tag: &str) -> Option<String> {
    BRANCH_CODE_REGEX
        .captures(dir_tag)
        .and_then(|c| c.get(2))
        .map(|m| m.as_str().to_string())
}

/// "Queen St West At Bathurst St" -> "Bathurst St"
pub fn stop_short_title(title: &str) -> String {
    match title.split(" At ").nth(1) {
        Some(cross) => cross.trim().to_string(),
        None => title.to_string(),
    }
}

/// Destination from a direction title: text after "towards " (any case),
/// otherwise the title's last word
pub fn prediction_destination(direction_title: &str) -> String {
    if let Some(dest) = TOWARDS_REGEX.captures(direction_title).and_then(|c| c.get(1)) {
        return dest.as_str().trim().to_string();
    }
    direction_title
        .split_whitespace()
        .last()
        .unwrap_or_default()
        .to_string()
}

/// Segment after the first underscore when longer than two characters, else the route tag
pub fn prediction_branch(dir_tag: Option<&str>, route_tag: &str) -> String {
    dir_tag
        .and_then(|tag| tag.split('_').nth(1))
        .filter(|code| code.chars().count() > 2)
        .unwrap_or(route_tag)
        .to_string()
}

// ============================================================================
// Commands
// ============================================================================

pub fn parse_route_list(text: &str) -> Result<Vec<RouteSummary>> {
    let doc = parse_document(text)?;
    let mut dropped = 0usize;

    let routes: Vec<RouteSummary> = elements(&doc, "route")
        .filter_map(|r| {
            let Some(tag) = non_empty(&r, "tag") else {
                dropped += 1;
                return None;
            };
            let title = r.attribute("title").unwrap_or(tag);
            Some(RouteSummary {
                tag: tag.to_string(),
                title: title.to_string(),
                name: friendly_route_name(title),
            })
        })
        .collect();

    if dropped > 0 {
        debug!("Dropped {} route records without a tag", dropped);
    }
    Ok(routes)
}

pub fn parse_vehicle_locations(text: &str) -> Result<VehicleSnapshot> {
    let doc = parse_document(text)?;
    let mut dropped = 0usize;

    let vehicles: Vec<VehicleRecord> = elements(&doc, "vehicle")
        .filter_map(|v| {
            let (Some(id), Some(route_tag)) = (non_empty(&v, "id"), non_empty(&v, "routeTag"))
            else {
                dropped += 1;
                return None;
            };

            Some(VehicleRecord {
                id: id.to_string(),
                route_tag: route_tag.to_string(),
                lat: attr_f64(&v, "lat").unwrap_or(f64::NAN),
                lon: attr_f64(&v, "lon").unwrap_or(f64::NAN),
                speed: attr_f64(&v, "speedKmHr").unwrap_or(0.0).max(0.0),
                sub_route: v.attribute("dirTag").and_then(branch_code),
                heading: attr_f64(&v, "heading"),
            })
        })
        .collect();

    let last_time = elements(&doc, "lastTime")
        .next()
        .and_then(|n| n.attribute("time"))
        .and_then(|t| t.parse().ok());

    if dropped > 0 {
        debug!("Dropped {} vehicle records missing id or routeTag", dropped);
    }

    Ok(VehicleSnapshot {
        vehicles,
        last_time,
        dropped,
    })
}

pub fn parse_route_config(text: &str) -> Result<RouteMetadata> {
    let doc = parse_document(text)?;

    let direction_table: HashMap<String, String> = elements(&doc, "direction")
        .filter_map(|d| {
            let name = non_empty(&d, "name")?;
            let title = non_empty(&d, "title")?;
            Some((name.to_string(), title.to_string()))
        })
        .collect();

    let stops: Vec<Stop> = elements(&doc, "stop")
        .filter_map(|s| {
            let tag = non_empty(&s, "tag")?;
            let lat = attr_f64(&s, "lat")?;
            let lon = attr_f64(&s, "lon")?;
            let title = s.attribute("title").unwrap_or_default();
            Some(Stop {
                tag: tag.to_string(),
                external_id: s.attribute("stopId").map(str::to_string),
                short_title: stop_short_title(title),
                full_title: title.to_string(),
                lat,
                lon,
            })
        })
        .collect();

    let geometry_segments: Vec<Vec<[f64; 2]>> = elements(&doc, "path")
        .map(|p| {
            p.children()
                .filter(|n| n.has_tag_name("point"))
                .filter_map(|pt| Some([attr_f64(&pt, "lat")?, attr_f64(&pt, "lon")?]))
                .collect::<Vec<_>>()
        })
        .filter(|points| !points.is_empty())
        .collect();

    Ok(RouteMetadata {
        direction_table,
        stops,
        geometry_segments,
    })
}

pub fn parse_predictions(text: &str, route_tag: &str) -> Result<Vec<Prediction>> {
    let doc = parse_document(text)?;

    let mut predictions: Vec<Prediction> = elements(&doc, "prediction")
        .filter_map(|p| {
            let minutes = p.attribute("minutes")?.trim().parse::<i64>().ok()?;
            let direction_title = p
                .parent_element()
                .and_then(|d| d.attribute("title"))
                .unwrap_or_default();

            Some(Prediction {
                epoch_ms: p.attribute("epochTime").and_then(|t| t.parse().ok()),
                minutes,
                branch: prediction_branch(p.attribute("dirTag"), route_tag),
                destination: prediction_destination(direction_title),
                vehicle: p.attribute("vehicle").map(str::to_string),
            })
        })
        .collect();

    predictions.sort_by_key(|p| p.minutes);
    Ok(predictions)
}
