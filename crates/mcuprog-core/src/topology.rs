//! Hub topology resolution
//!
//! Turns the raw `(port, hardware id)` pairs produced by a serial enumerator
//! into [`Port`]s carrying a hub group and a nesting depth. The hub group is
//! the admission-control bucket: ports believed to share a USB hub share a
//! group and therefore share its concurrency budget.
//!
//! Hardware ids follow the common `USB VID:PID=2341:0043 SER=... LOCATION=1-1.4.2:1.0`
//! shape. The resolution rules, in order:
//!
//! 1. `LOCATION=bus-port[.port...]` present: the group is the location with
//!    its last `.` segment stripped (the parent hub address) and the depth is
//!    the number of `.` segments minus one. A single segment means the device
//!    sits on a root port: group `"direct"`, depth 0.
//! 2. Otherwise `VID:PID=vvvv:pppp` present: every port sharing the
//!    identifier lands in the synthetic group `usb-VVVV:PPPP`, depth 1.
//! 3. Otherwise the port is `"direct"`, depth 0.
//!
//! The grouping is a heuristic. Over-grouping unrelated devices only costs
//! throughput; it never lets a hub run more jobs than its capacity.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::EnumerationError;

/// Hub group of ports that are not behind a (known) hub
pub const DIRECT_GROUP: &str = "direct";

/// One entry of a raw enumerator snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPort {
    /// Platform device path (`/dev/ttyUSB0`, `COM3`, ...)
    pub id: String,
    /// Opaque hardware descriptor string
    pub hardware_id: String,
}

impl RawPort {
    /// Create a raw port entry
    pub fn new(id: impl Into<String>, hardware_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hardware_id: hardware_id.into(),
        }
    }
}

/// A discovered serial endpoint with its inferred hub placement
///
/// Re-derived on every scan; a port that disappears and reappears is a new
/// value even if the id is the same.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    /// Platform device path, unique within a scan
    pub id: String,
    /// Opaque hardware descriptor string
    pub hardware_id: String,
    /// Admission-control bucket, [`DIRECT_GROUP`] if not behind a hub
    pub hub_group: String,
    /// Hub nesting level (0 = root port)
    pub hub_depth: u32,
}

impl Port {
    /// Whether the port is outside any hub group
    pub fn is_direct(&self) -> bool {
        self.hub_group == DIRECT_GROUP
    }

    /// Build a port that bypasses topology inference
    pub fn direct(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hardware_id: String::new(),
            hub_group: DIRECT_GROUP.to_string(),
            hub_depth: 0,
        }
    }
}

/// Source of raw serial port snapshots
///
/// Called once per discovery tick, so implementations must be cheap and
/// safe to call repeatedly.
pub trait PortEnumerator: Send + Sync {
    /// Return the currently attached serial ports
    fn scan(&self) -> Result<Vec<RawPort>, EnumerationError>;
}

impl<E: PortEnumerator + ?Sized> PortEnumerator for std::sync::Arc<E> {
    fn scan(&self) -> Result<Vec<RawPort>, EnumerationError> {
        (**self).scan()
    }
}

impl<E: PortEnumerator + ?Sized> PortEnumerator for Box<E> {
    fn scan(&self) -> Result<Vec<RawPort>, EnumerationError> {
        (**self).scan()
    }
}

/// Resolves enumerator snapshots into hub-annotated ports
pub struct HubTopologyResolver<E> {
    enumerator: E,
}

impl<E: PortEnumerator> HubTopologyResolver<E> {
    /// Wrap an enumerator
    pub fn new(enumerator: E) -> Self {
        Self { enumerator }
    }

    /// Take a snapshot and resolve it
    pub fn resolve(&self) -> Result<Vec<Port>, EnumerationError> {
        let raw = self.enumerator.scan()?;
        Ok(resolve_ports(&raw))
    }
}

/// Resolve a raw snapshot; pure function of its input
pub fn resolve_ports(raw: &[RawPort]) -> Vec<Port> {
    raw.iter().map(resolve_port).collect()
}

/// Resolve a single raw port
pub fn resolve_port(raw: &RawPort) -> Port {
    let (hub_group, hub_depth) = classify(&raw.hardware_id);
    Port {
        id: raw.id.clone(),
        hardware_id: raw.hardware_id.clone(),
        hub_group,
        hub_depth,
    }
}

fn classify(hardware_id: &str) -> (String, u32) {
    if let Some(location) = find_location(hardware_id) {
        let segments: Vec<&str> = location.split('.').collect();
        if segments.len() > 1 {
            let parent = segments[..segments.len() - 1].join(".");
            return (parent, (segments.len() - 1) as u32);
        }
        return (DIRECT_GROUP.to_string(), 0);
    }

    if let Some((vid, pid)) = find_vid_pid(hardware_id) {
        return (format!("usb-{}:{}", vid, pid), 1);
    }

    (DIRECT_GROUP.to_string(), 0)
}

fn location_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // bus, dash, then a dotted port path that ends on a digit
    PATTERN.get_or_init(|| {
        Regex::new(r"LOCATION=(\d+-[\d.]*\d)").expect("valid LOCATION pattern")
    })
}

fn vid_pid_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"VID:PID=([[:xdigit:]]{4}):([[:xdigit:]]{4})").expect("valid VID:PID pattern")
    })
}

/// Find a `LOCATION=bus-port[.port...]` pattern, returning the path part
///
/// Anything after the path (the `:config.interface` suffix) is dropped.
pub fn find_location(hardware_id: &str) -> Option<&str> {
    location_pattern()
        .captures(hardware_id)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Find a `VID:PID=vvvv:pppp` pattern, returning upper-cased hex ids
pub fn find_vid_pid(hardware_id: &str) -> Option<(String, String)> {
    let caps = vid_pid_pattern().captures(hardware_id)?;
    Some((caps[1].to_ascii_uppercase(), caps[2].to_ascii_uppercase()))
}
