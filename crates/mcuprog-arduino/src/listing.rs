//! Parsers for arduino-cli's JSON output
//!
//! Listings are requested with `--format json`. Since arduino-cli 1.0 both
//! `board list` and `core list` wrap their entries in an object
//! (`detected_ports`, `platforms`); older releases print a bare array. Both
//! shapes are accepted.

use serde::Deserialize;

use crate::error::Result;

/// A board reported by `arduino-cli board list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedBoard {
    /// Port address
    pub port: String,
    /// Discovery protocol (`serial`, `network`, ...)
    pub protocol: String,
    /// Board name, `"Unknown"` when not identified
    pub name: String,
    /// Fully-qualified board name, if identified
    pub fqbn: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BoardListing {
    Wrapped {
        #[serde(default)]
        detected_ports: Vec<DetectedPort>,
    },
    Bare(Vec<DetectedPort>),
}

#[derive(Debug, Deserialize)]
struct DetectedPort {
    #[serde(default)]
    matching_boards: Vec<MatchingBoard>,
    port: PortEntry,
}

#[derive(Debug, Deserialize)]
struct MatchingBoard {
    #[serde(default)]
    name: String,
    #[serde(default)]
    fqbn: String,
}

#[derive(Debug, Deserialize)]
struct PortEntry {
    address: String,
    #[serde(default)]
    protocol: String,
}

impl From<DetectedPort> for DetectedBoard {
    fn from(detected: DetectedPort) -> Self {
        let matched = detected.matching_boards.into_iter().next();
        let name = matched
            .as_ref()
            .map(|b| b.name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "Unknown".to_string());
        let fqbn = matched.map(|b| b.fqbn).filter(|f| !f.is_empty());

        DetectedBoard {
            port: detected.port.address,
            protocol: detected.port.protocol,
            name,
            fqbn,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CoreListing {
    Wrapped {
        #[serde(default)]
        platforms: Vec<Platform>,
    },
    Bare(Vec<Platform>),
}

#[derive(Debug, Deserialize)]
struct Platform {
    id: String,
}

/// Parse `arduino-cli board list --format json` output
pub fn parse_board_list(output: &str) -> Result<Vec<DetectedBoard>> {
    if output.trim().is_empty() {
        return Ok(Vec::new());
    }
    let ports = match serde_json::from_str(output)? {
        BoardListing::Wrapped { detected_ports } => detected_ports,
        BoardListing::Bare(ports) => ports,
    };
    Ok(ports.into_iter().map(DetectedBoard::from).collect())
}

/// Installed core ids from `arduino-cli core list --format json`
pub fn parse_core_list(output: &str) -> Result<Vec<String>> {
    if output.trim().is_empty() {
        return Ok(Vec::new());
    }
    let platforms = match serde_json::from_str(output)? {
        CoreListing::Wrapped { platforms } => platforms,
        CoreListing::Bare(platforms) => platforms,
    };
    Ok(platforms.into_iter().map(|p| p.id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ArduinoError;

    const BOARD_LIST: &str = r#"{
  "detected_ports": [
    {
      "matching_boards": [{ "name": "Arduino Uno", "fqbn": "arduino:avr:uno" }],
      "port": {
        "address": "/dev/ttyACM0",
        "label": "/dev/ttyACM0",
        "protocol": "serial",
        "protocol_label": "Serial Port (USB)",
        "properties": { "pid": "0x0043", "vid": "0x2341" },
        "hardware_id": "85736323838351F0B1E1"
      }
    },
    {
      "matching_boards": [
        { "name": "Arduino Mega or Mega 2560", "fqbn": "arduino:avr:mega" },
        { "name": "Arduino Mega ADK", "fqbn": "arduino:avr:megaADK" }
      ],
      "port": { "address": "/dev/ttyACM1", "protocol": "serial" }
    },
    {
      "port": {
        "address": "/dev/ttyS0",
        "label": "/dev/ttyS0",
        "protocol": "serial",
        "protocol_label": "Serial Port"
      }
    }
  ]
}"#;

    #[test]
    fn test_board_list() {
        let boards = parse_board_list(BOARD_LIST).unwrap();
        assert_eq!(boards.len(), 3);

        assert_eq!(boards[0].port, "/dev/ttyACM0");
        assert_eq!(boards[0].protocol, "serial");
        assert_eq!(boards[0].name, "Arduino Uno");
        assert_eq!(boards[0].fqbn.as_deref(), Some("arduino:avr:uno"));

        // first match wins
        assert_eq!(boards[1].name, "Arduino Mega or Mega 2560");
        assert_eq!(boards[1].fqbn.as_deref(), Some("arduino:avr:mega"));

        assert_eq!(boards[2].port, "/dev/ttyS0");
        assert_eq!(boards[2].name, "Unknown");
        assert_eq!(boards[2].fqbn, None);
    }

    #[test]
    fn test_board_list_bare_array() {
        let out = r#"[
  { "matching_boards": [{ "name": "Arduino Nano", "fqbn": "arduino:avr:nano" }],
    "port": { "address": "COM3", "protocol": "serial" } },
  { "port": { "address": "COM4", "protocol": "serial" } }
]"#;
        let boards = parse_board_list(out).unwrap();
        assert_eq!(boards.len(), 2);
        assert_eq!(boards[0].fqbn.as_deref(), Some("arduino:avr:nano"));
        assert_eq!(boards[1].name, "Unknown");
    }

    #[test]
    fn test_board_list_empty() {
        assert!(parse_board_list("").unwrap().is_empty());
        assert!(parse_board_list("{}").unwrap().is_empty());
        assert!(parse_board_list(r#"{"detected_ports": []}"#).unwrap().is_empty());
    }

    #[test]
    fn test_board_list_rejects_tabular_output() {
        let err = parse_board_list("Port Protocol Type Board Name FQBN Core\n").unwrap_err();
        assert!(matches!(err, ArduinoError::Json(_)));
    }

    #[test]
    fn test_core_list() {
        let out = r#"{
  "platforms": [
    { "id": "arduino:avr", "installed_version": "1.8.6", "latest_version": "1.8.6" },
    { "id": "esp32:esp32", "installed_version": "2.0.14", "latest_version": "3.0.1" }
  ]
}"#;
        assert_eq!(parse_core_list(out).unwrap(), ["arduino:avr", "esp32:esp32"]);
        assert_eq!(
            parse_core_list(r#"[{ "id": "rp2040:rp2040", "installed": "3.9.2" }]"#).unwrap(),
            ["rp2040:rp2040"]
        );
        assert!(parse_core_list("{}").unwrap().is_empty());
    }
}
