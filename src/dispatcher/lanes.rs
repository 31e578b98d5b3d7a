//! Per-site concurrency slots
//!
//! A lane binds one site to one slot of the global concurrency budget. While
//! a site holds a lane, its tasks drain in registry order; the lane is only
//! released once the site has nothing ready. A lane may be *reserved* (site
//! bound, no task in flight) between two tasks of the same site; it still
//! counts against the budget, which is what keeps a half-drained site from
//! being preempted.

use std::collections::{BTreeMap, HashMap};

/// Lane table: site → currently-assigned task id (None while reserved)
#[derive(Debug)]
pub struct LaneMap {
    max_lanes: usize,
    lanes: HashMap<String, Option<String>>,
}

impl LaneMap {
    pub fn new(max_lanes: usize) -> Self {
        Self {
            max_lanes,
            lanes: HashMap::new(),
        }
    }

    /// Lanes currently bound to a site, running or reserved
    pub fn occupied(&self) -> usize {
        self.lanes.len()
    }

    /// Lanes with a task actually in flight
    pub fn running(&self) -> usize {
        self.lanes.values().filter(|t| t.is_some()).count()
    }

    pub fn free_lanes(&self) -> usize {
        self.max_lanes.saturating_sub(self.lanes.len())
    }

    pub fn has_lane(&self, site: &str) -> bool {
        self.lanes.contains_key(site)
    }

    /// Task currently assigned to `site`'s lane, if any
    pub fn task_for(&self, site: &str) -> Option<&str> {
        self.lanes.get(site).and_then(|t| t.as_deref())
    }

    /// Bind a lane to `site` with `task` in flight. Refused when the budget
    /// is exhausted or the site already holds a lane: at most one running
    /// task per site, ever.
    pub fn assign(&mut self, site: &str, task_id: &str) -> bool {
        if self.has_lane(site) || self.free_lanes() == 0 {
            return false;
        }
        self.lanes
            .insert(site.to_string(), Some(task_id.to_string()));
        true
    }

    /// Put the next task of a site into its already-reserved lane
    pub fn set_task(&mut self, site: &str, task_id: &str) -> bool {
        match self.lanes.get_mut(site) {
            Some(slot @ None) => {
                *slot = Some(task_id.to_string());
                true
            }
            _ => false,
        }
    }

    /// Mark `site`'s lane reserved-but-idle (task finished, site may have
    /// more work). Returns the task id that was in flight.
    pub fn clear_task(&mut self, site: &str) -> Option<String> {
        self.lanes.get_mut(site).and_then(|slot| slot.take())
    }

    /// Release `site`'s lane entirely
    pub fn release(&mut self, site: &str) {
        self.lanes.remove(site);
    }

    /// Sites holding a reserved lane with no task in flight
    pub fn idle_sites(&self) -> Vec<String> {
        let mut sites: Vec<String> = self
            .lanes
            .iter()
            .filter(|(_, task)| task.is_none())
            .map(|(site, _)| site.clone())
            .collect();
        sites.sort();
        sites
    }

    /// Occupancy snapshot for checkpointing: site → running task id
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.lanes
            .iter()
            .filter_map(|(site, task)| task.as_ref().map(|t| (site.clone(), t.clone())))
            .collect()
    }

    /// Drop every lane (shutdown)
    pub fn clear(&mut self) {
        self.lanes.clear();
    }
}
