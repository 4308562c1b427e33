// Direction resolution: compass heading + route direction table -> destination label

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cardinal {
    North,
    East,
    South,
    West,
}

impl Cardinal {
    /// [315,360)∪[0,45) North, [45,135) East, [135,225) South, [225,315) West
    pub fn from_heading(heading: Option<f64>) -> Option<Cardinal> {
        let deg = heading?;
        if deg.is_nan() {
            return None;
        }
        if deg >= 315.0 || deg < 45.0 {
            Some(Cardinal::North)
        } else if deg < 135.0 {
            Some(Cardinal::East)
        } else if deg < 225.0 {
            Some(Cardinal::South)
        } else {
            Some(Cardinal::West)
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Cardinal::North => "North",
            Cardinal::East => "East",
            Cardinal::South => "South",
            Cardinal::West => "West",
        }
    }
}

impl fmt::Display for Cardinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const MOVING_PLACEHOLDER: &str = "Moving";

/// "East - 504a King towards Broadview Station" -> "East towards Broadview Station"
pub fn destination_label(entry: &str) -> String {
    match entry.find("towards") {
        Some(idx) => {
            let first = entry.split(' ').next().unwrap_or_default();
            format!("{} {}", first, &entry[idx..])
        }
        None => entry.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryPolicy {
    /// Remember every vehicle's last destination for the whole session
    #[default]
    Retain,
    /// Forget a vehicle after it is absent from this many consecutive cycles
    EvictAfterMissedCycles(u32),
}

#[derive(Debug, Clone)]
struct Remembered {
    label: String,
    missed_cycles: u32,
}

/// Per-vehicle sticky destination memory
#[derive(Debug, Default)]
pub struct DirectionResolver {
    memory: HashMap<String, Remembered>,
    policy: MemoryPolicy,
}

impl DirectionResolver {
    pub fn new(policy: MemoryPolicy) -> Self {
        DirectionResolver {
            memory: HashMap::new(),
            policy,
        }
    }

    /// Fresh label, else remembered label, else "<Cardinal>bound", else "Moving"
    pub fn resolve(
        &mut self,
        vehicle_id: &str,
        direction_table: Option<&HashMap<String, String>>,
        heading: Option<f64>,
    ) -> String {
        let cardinal = Cardinal::from_heading(heading);

        let fresh = match (direction_table, cardinal) {
            (Some(table), Some(c)) => table
                .get(c.as_str())
                .map(|entry| destination_label(entry.as_str())),
            _ => None,
        };

        if let Some(label) = fresh {
            self.memory.insert(
                vehicle_id.to_string(),
                Remembered {
                    label: label.clone(),
                    missed_cycles: 0,
                },
            );
            return label;
        }

        if let Some(remembered) = self.memory.get(vehicle_id) {
            return remembered.label.clone();
        }

        match cardinal {
            Some(c) => format!("{}bound", c),
            None => MOVING_PLACEHOLDER.to_string(),
        }
    }

    /// Record which vehicles reported this cycle, applying the eviction policy
    pub fn observe_cycle(&mut self, present: &HashSet<&str>) -> usize {
        let MemoryPolicy::EvictAfterMissedCycles(limit) = self.policy else {
            return 0;
        };

        let before = self.memory.len();
        self.memory.retain(|id, entry| {
            if present.contains(id.as_str()) {
                entry.missed_cycles = 0;
                true
            } else {
                entry.missed_cycles += 1;
                entry.missed_cycles < limit
            }
        });
        before - self.memory.len()
    }

    #[cfg(test)]
    pub fn remembered(&self, vehicle_id: &str) -> Option<&str> {
        self.memory.get(vehicle_id).map(|r| r.label.as_str())
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }
}
