//! mcuprog-serial - Serial port enumeration
//!
//! Lists the host's serial ports through the `serialport` crate and renders
//! each one's hardware id in the common
//! `USB VID:PID=vvvv:pppp SER=... LOCATION=bus-port.port:cfg.intf` shape
//! understood by the hub topology resolver.
//!
//! The USB location is only available on Linux, where it is read from the
//! port's sysfs device link. Elsewhere ports fall back to VID/PID grouping.

#![warn(missing_docs)]

pub mod error;

use std::path::Path;

use mcuprog_core::{EnumerationError, PortEnumerator, RawPort};
use serialport::SerialPortType;

pub use error::{Result, SerialError};

/// USB identity of a port, as far as it is known
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsbIdentity {
    /// Vendor id
    pub vid: u16,
    /// Product id
    pub pid: u16,
    /// Serial number string
    pub serial_number: Option<String>,
    /// `bus-port[.port...]:config.interface`
    pub location: Option<String>,
}

impl UsbIdentity {
    /// Render the hardware id string
    pub fn hardware_id(&self) -> String {
        let mut hwid = format!("USB VID:PID={:04X}:{:04X}", self.vid, self.pid);
        if let Some(sn) = self.serial_number.as_deref().filter(|s| !s.is_empty()) {
            hwid.push_str(" SER=");
            hwid.push_str(sn);
        }
        if let Some(loc) = &self.location {
            hwid.push_str(" LOCATION=");
            hwid.push_str(loc);
        }
        hwid
    }
}

/// Whether a sysfs path component names a USB interface (`1-1.4.2:1.0`)
fn is_usb_interface(component: &str) -> bool {
    let Some((dev, intf)) = component.split_once(':') else {
        return false;
    };
    let Some((bus, path)) = dev.split_once('-') else {
        return false;
    };
    let digits_dots = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit() || c == '.');
    !bus.is_empty()
        && bus.chars().all(|c| c.is_ascii_digit())
        && digits_dots(path)
        && digits_dots(intf)
}

/// USB location from a resolved sysfs device path
///
/// The deepest interface component wins, e.g.
/// `/sys/devices/.../usb1/1-1/1-1.4/1-1.4.2/1-1.4.2:1.0/ttyUSB0` gives
/// `1-1.4.2:1.0`.
pub fn location_from_sysfs_path(path: &Path) -> Option<String> {
    path.components()
        .rev()
        .filter_map(|c| c.as_os_str().to_str())
        .find(|c| is_usb_interface(c))
        .map(str::to_string)
}

#[cfg(target_os = "linux")]
fn usb_location(port_name: &str) -> Option<String> {
    let name = Path::new(port_name).file_name()?;
    let link = Path::new("/sys/class/tty").join(name).join("device");
    match std::fs::canonicalize(&link) {
        Ok(real) => location_from_sysfs_path(&real),
        Err(e) => {
            log::trace!("No sysfs device for {}: {}", port_name, e);
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn usb_location(_port_name: &str) -> Option<String> {
    None
}

fn hardware_id(info: &serialport::SerialPortInfo) -> String {
    match &info.port_type {
        SerialPortType::UsbPort(usb) => UsbIdentity {
            vid: usb.vid,
            pid: usb.pid,
            serial_number: usb.serial_number.clone(),
            location: usb_location(&info.port_name),
        }
        .hardware_id(),
        SerialPortType::PciPort => "PCI".into(),
        SerialPortType::BluetoothPort => "BTH".into(),
        SerialPortType::Unknown => "n/a".into(),
    }
}

/// Port enumerator backed by the operating system's serial port listing
#[derive(Debug, Clone, Default)]
pub struct SerialEnumerator {
    usb_only: bool,
}

impl SerialEnumerator {
    /// Enumerate every serial port
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip ports that are not USB devices (built-in UARTs, Bluetooth)
    pub fn usb_only(mut self, usb_only: bool) -> Self {
        self.usb_only = usb_only;
        self
    }

    /// One snapshot of the serial ports
    pub fn list(&self) -> Result<Vec<RawPort>> {
        let ports = serialport::available_ports()?;
        let mut raw: Vec<RawPort> = ports
            .iter()
            .filter(|p| !self.usb_only || matches!(p.port_type, SerialPortType::UsbPort(_)))
            .map(|p| RawPort::new(p.port_name.clone(), hardware_id(p)))
            .collect();
        raw.sort_by(|a, b| a.id.cmp(&b.id));
        log::trace!("Serial scan: {} port(s)", raw.len());
        Ok(raw)
    }
}

impl PortEnumerator for SerialEnumerator {
    fn scan(&self) -> std::result::Result<Vec<RawPort>, EnumerationError> {
        Ok(self.list()?)
    }
}
