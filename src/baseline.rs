use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::error::PipelineError;
use crate::models::{ActivityType, Baseline, EntityKey};
use crate::table::EventTable;

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    total_minutes: f64,
    count: usize,
}

impl Tally {
    fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.total_minutes / self.count as f64)
    }
}

/// Per-entity planned/unplanned duration baselines.
///
/// Entities missing either activity type, or whose unplanned mean is zero,
/// are left out of the result rather than reported as errors.
pub fn compute(events: &EventTable) -> BTreeMap<EntityKey, Baseline> {
    let mut tallies: BTreeMap<&EntityKey, [Tally; 2]> = BTreeMap::new();

    for event in events.events() {
        let slot = match event.activity_type {
            ActivityType::Planned => 0,
            ActivityType::Unplanned => 1,
        };
        let entry = tallies.entry(&event.key).or_default();
        entry[slot].total_minutes += event.duration_minutes;
        entry[slot].count += 1;
    }

    let mut baselines = BTreeMap::new();
    for (key, [planned, unplanned]) in tallies {
        let (Some(avg_planned), Some(avg_unplanned)) = (planned.mean(), unplanned.mean()) else {
            debug!(%key, planned = planned.count, unplanned = unplanned.count, "Skipping entity without both activity types");
            continue;
        };
        if avg_unplanned <= 0.0 {
            debug!(%key, "Skipping entity with zero unplanned duration");
            continue;
        }

        baselines.insert(
            key.clone(),
            Baseline {
                key: key.clone(),
                avg_minutes_planned: avg_planned,
                avg_minutes_unplanned: avg_unplanned,
                count_planned: planned.count,
                count_unplanned: unplanned.count,
                time_saved_pct: (avg_unplanned - avg_planned) / avg_unplanned * 100.0,
            },
        );
    }

    baselines
}

impl Baseline {
    pub fn check_eligible(&self, threshold: usize) -> Result<(), PipelineError> {
        if self.count_planned <= threshold && self.count_unplanned <= threshold {
            return Err(PipelineError::IneligibleBaseline {
                key: self.key.clone(),
                reason: format!(
                    "too few samples ({} planned, {} unplanned; need more than {threshold})",
                    self.count_planned, self.count_unplanned
                ),
            });
        }
        if self.time_saved_pct <= 0.0 {
            return Err(PipelineError::IneligibleBaseline {
                key: self.key.clone(),
                reason: format!("no time savings ({:.1}%)", self.time_saved_pct),
            });
        }
        Ok(())
    }

    pub fn is_eligible(&self, threshold: usize) -> bool {
        self.check_eligible(threshold).is_ok()
    }
}

pub fn eligible(baselines: &BTreeMap<EntityKey, Baseline>, threshold: usize) -> Vec<&Baseline> {
    baselines
        .values()
        .filter(|baseline| baseline.is_eligible(threshold))
        .collect()
}

/// Cascading filter options: location -> functional area -> equipment ids.
pub type SelectionTree = BTreeMap<String, BTreeMap<String, BTreeSet<String>>>;

pub fn selection_tree(baselines: &BTreeMap<EntityKey, Baseline>, threshold: usize) -> SelectionTree {
    let mut tree = SelectionTree::new();
    for baseline in eligible(baselines, threshold) {
        let key = &baseline.key;
        tree.entry(key.location.clone())
            .or_default()
            .entry(key.functional_area.clone())
            .or_default()
            .insert(key.equipment_id.clone());
    }
    tree
}
