//! Hub-capacity admission control
//!
//! Each hub group may run at most `capacity` jobs at once; the `"direct"`
//! group is unbounded. The controller is owned by the session controller and
//! only ever touched from its task, so a `&mut self` call is the critical
//! section: [`try_admit`](AdmissionController::try_admit) checks and
//! occupies a slot in one step and two admissions can never both observe the
//! last free slot.

use std::collections::{BTreeSet, HashMap};

use crate::topology::{Port, DIRECT_GROUP};

/// Default concurrent jobs per hub group
pub const DEFAULT_HUB_CAPACITY: usize = 2;

/// Admission bucket for ports sharing a hub
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubGroup {
    active: BTreeSet<String>,
}

impl HubGroup {
    /// Ports currently holding a slot
    pub fn active_ports(&self) -> impl Iterator<Item = &str> {
        self.active.iter().map(String::as_str)
    }

    /// Number of occupied slots
    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// Per-hub-group concurrency limiter
#[derive(Debug, Clone)]
pub struct AdmissionController {
    capacity: usize,
    groups: HashMap<String, HubGroup>,
    /// port id -> group it occupies a slot in
    occupied: HashMap<String, String>,
    tightened: bool,
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(DEFAULT_HUB_CAPACITY)
    }
}

impl AdmissionController {
    /// Create a controller with the given per-hub capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            groups: HashMap::new(),
            occupied: HashMap::new(),
            tightened: false,
        }
    }

    /// Capacity of a group, `None` meaning unbounded
    pub fn group_capacity(&self, group: &str) -> Option<usize> {
        if group == DIRECT_GROUP {
            None
        } else {
            Some(self.capacity)
        }
    }

    /// Current per-hub capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Try to occupy a slot for `port` in its hub group
    ///
    /// Returns `false` when the group is full or the port already holds a
    /// slot.
    pub fn try_admit(&mut self, port: &Port) -> bool {
        if self.occupied.contains_key(&port.id) {
            log::trace!("{} already holds a slot", port.id);
            return false;
        }

        let limit = self.group_capacity(&port.hub_group);
        let group = self.groups.entry(port.hub_group.clone()).or_default();

        if let Some(limit) = limit {
            if group.active.len() >= limit {
                return false;
            }
        }

        group.active.insert(port.id.clone());
        self.occupied
            .insert(port.id.clone(), port.hub_group.clone());
        true
    }

    /// Free the slot held by `port_id`, if any
    ///
    /// Idempotent: releasing a port without a slot is a no-op. Returns
    /// whether a slot was actually freed.
    pub fn release(&mut self, port_id: &str) -> bool {
        let Some(group_id) = self.occupied.remove(port_id) else {
            return false;
        };
        if let Some(group) = self.groups.get_mut(&group_id) {
            group.active.remove(port_id);
        }
        true
    }

    /// Whether `port_id` currently holds a slot
    pub fn is_active(&self, port_id: &str) -> bool {
        self.occupied.contains_key(port_id)
    }

    /// Occupied slots in one group
    pub fn active_count(&self, group: &str) -> usize {
        self.groups.get(group).map_or(0, HubGroup::active_count)
    }

    /// Occupied slots across all groups
    pub fn total_active(&self) -> usize {
        self.occupied.len()
    }

    /// All groups seen so far
    pub fn groups(&self) -> impl Iterator<Item = (&str, &HubGroup)> {
        self.groups.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Clamp hub capacity to one for the rest of the session
    ///
    /// Monotonic: later calls do nothing. Slots already occupied are kept.
    /// Returns `true` only on the call that actually tightened.
    pub fn tighten_for_nested_hubs(&mut self) -> bool {
        if self.tightened {
            return false;
        }
        self.tightened = true;
        if self.capacity > 1 {
            log::warn!(
                "Hub capacity reduced from {} to 1 for the rest of the session",
                self.capacity
            );
        }
        self.capacity = 1;
        true
    }

    /// Whether nested-hub tightening has happened
    pub fn is_tightened(&self) -> bool {
        self.tightened
    }
}
