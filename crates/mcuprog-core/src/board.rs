//! Board database for runtime loading and lookup
//!
//! A board maps a human-readable name to the fully-qualified board name
//! (FQBN) understood by the flashing tool, plus the core package the tool
//! needs installed to program it. The database is built once before a
//! session starts and never changes while the session runs.
//!
//! Extra boards are loaded from RON files:
//!
//! ```ron
//! (
//!     vendor: "Espressif",
//!     boards: [
//!         (name: "ESP32-S3", fqbn: "esp32:esp32:esp32s3"),
//!         (name: "Custom S3", fqbn: "esp32:esp32:esp32s3:PSRAM=opi", core: Some("esp32:esp32")),
//!     ],
//! )
//! ```

use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;

/// Error type for board database operations
#[derive(Debug, Error)]
pub enum BoardDbError {
    /// I/O error reading files
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// RON parsing error
    #[error("Parse error: {0}")]
    Parse(#[from] ron::error::SpannedError),
    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

/// A programmable board definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Board {
    /// Vendor or family, used for grouping in listings
    pub vendor: String,
    /// Display name, unique within the database
    pub name: String,
    /// Fully-qualified board name (`vendor:arch:board[:options]`)
    pub fqbn: String,
    /// Core package providing the board (`vendor:arch`)
    pub core: String,
}

impl Board {
    /// Create a board, deriving the core from the first two FQBN segments
    pub fn new(vendor: &str, name: &str, fqbn: &str) -> Self {
        Self {
            vendor: vendor.to_string(),
            name: name.to_string(),
            fqbn: fqbn.to_string(),
            core: core_of(fqbn),
        }
    }
}

/// Extract the core package (`vendor:arch`) from an FQBN
pub fn core_of(fqbn: &str) -> String {
    fqbn.split(':').take(2).collect::<Vec<_>>().join(":")
}

// ============================================================================
// RON deserialization types (intermediate format)
// ============================================================================

#[derive(Debug, serde::Deserialize)]
struct BoardDef {
    name: String,
    fqbn: String,
    #[serde(default)]
    core: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct VendorDef {
    vendor: String,
    boards: Vec<BoardDef>,
}

/// Boards known without any database file
const BUILTIN_BOARDS: &[(&str, &str, &str)] = &[
    ("Arduino", "Arduino Uno", "arduino:avr:uno"),
    (
        "Arduino",
        "Arduino Nano (Old Bootloader)",
        "arduino:avr:nano:cpu=atmega328old",
    ),
    (
        "Arduino",
        "Arduino Nano (New Bootloader)",
        "arduino:avr:nano:cpu=atmega328",
    ),
    ("Arduino", "Arduino Mega", "arduino:avr:mega:cpu=atmega2560"),
    ("Arduino", "Arduino Leonardo", "arduino:avr:leonardo"),
    ("Arduino", "Arduino Micro", "arduino:avr:micro"),
    ("Arduino", "Arduino MKR WiFi 1010", "arduino:samd:mkrwifi1010"),
    ("Espressif", "ESP32 Dev Module", "esp32:esp32:esp32"),
    ("Espressif", "ESP32-S2", "esp32:esp32:esp32s2"),
    ("Espressif", "ESP32-S3", "esp32:esp32:esp32s3"),
    ("Espressif", "ESP32-C3", "esp32:esp32:esp32c3"),
    ("Espressif", "ESP8266 NodeMCU", "esp8266:esp8266:nodemcuv2"),
    ("Espressif", "ESP8266 Wemos D1", "esp8266:esp8266:d1_mini"),
    ("Raspberry Pi", "Raspberry Pi Pico", "rp2040:rp2040:rpipico"),
    ("Adafruit", "Adafruit Feather M0", "adafruit:samd:adafruit_feather_m0"),
    ("PJRC", "Teensy 3.2", "teensy:avr:teensy31"),
    ("PJRC", "Teensy 4.0", "teensy:avr:teensy40"),
];

/// Runtime board database
#[derive(Debug, Clone, Default)]
pub struct BoardDatabase {
    boards: Vec<Board>,
}

impl BoardDatabase {
    /// Create an empty database
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a database holding the built-in boards
    pub fn builtin() -> Self {
        let boards = BUILTIN_BOARDS
            .iter()
            .map(|(vendor, name, fqbn)| Board::new(vendor, name, fqbn))
            .collect();
        Self { boards }
    }

    /// Load boards from a RON string, returning how many were added
    ///
    /// A board whose name already exists replaces the earlier definition,
    /// so custom files can override the built-in table.
    pub fn load_ron(&mut self, s: &str) -> Result<usize, BoardDbError> {
        let def: VendorDef = ron::from_str(s)?;
        let mut count = 0;

        for b in def.boards {
            if b.name.trim().is_empty() {
                return Err(BoardDbError::Validation(format!(
                    "board with empty name in vendor {}",
                    def.vendor
                )));
            }
            if b.fqbn.split(':').count() < 3 {
                return Err(BoardDbError::Validation(format!(
                    "board '{}' has malformed FQBN '{}'",
                    b.name, b.fqbn
                )));
            }

            let core = b.core.unwrap_or_else(|| core_of(&b.fqbn));
            let board = Board {
                vendor: def.vendor.clone(),
                name: b.name,
                fqbn: b.fqbn,
                core,
            };

            if let Some(existing) = self.boards.iter_mut().find(|e| e.name == board.name) {
                log::debug!("Overriding board definition for {}", board.name);
                *existing = board;
            } else {
                self.boards.push(board);
            }
            count += 1;
        }

        Ok(count)
    }

    /// Load boards from a single RON file
    pub fn load_file(&mut self, path: &Path) -> Result<usize, BoardDbError> {
        let content = fs::read_to_string(path)?;
        self.load_ron(&content)
    }

    /// Load every `.ron` file in a directory (non-recursive)
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, BoardDbError> {
        let mut entries: Vec<_> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "ron"))
            .collect();
        entries.sort();

        let mut total = 0;
        for path in entries {
            let count = self.load_file(&path)?;
            log::debug!("Loaded {} boards from {}", count, path.display());
            total += count;
        }
        Ok(total)
    }

    /// Look up a board by display name (case-insensitive)
    pub fn find(&self, name: &str) -> Option<&Board> {
        self.boards
            .iter()
            .find(|b| b.name.eq_ignore_ascii_case(name))
    }

    /// Look up a board by FQBN
    pub fn find_by_fqbn(&self, fqbn: &str) -> Option<&Board> {
        self.boards.iter().find(|b| b.fqbn == fqbn)
    }

    /// Resolve a selection that may be either a board name or a raw FQBN
    ///
    /// Unknown strings that look like an FQBN are accepted as ad-hoc boards.
    pub fn resolve(&self, selection: &str) -> Option<Board> {
        if let Some(board) = self.find(selection).or_else(|| self.find_by_fqbn(selection)) {
            return Some(board.clone());
        }
        if selection.split(':').count() >= 3 {
            return Some(Board::new("Custom", selection, selection));
        }
        None
    }

    /// Number of boards in the database
    pub fn len(&self) -> usize {
        self.boards.len()
    }

    /// Whether the database is empty
    pub fn is_empty(&self) -> bool {
        self.boards.is_empty()
    }

    /// Iterate over all boards
    pub fn iter(&self) -> impl Iterator<Item = &Board> {
        self.boards.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_boards() {
        let db = BoardDatabase::builtin();
        assert_eq!(db.len(), BUILTIN_BOARDS.len());

        let uno = db.find("arduino uno").unwrap();
        assert_eq!(uno.fqbn, "arduino:avr:uno");
        assert_eq!(uno.core, "arduino:avr");
    }

    #[test]
    fn test_load_ron() {
        let ron = r#"
        (
            vendor: "Espressif",
            boards: [
                (name: "ESP32-S3", fqbn: "esp32:esp32:esp32s3:PSRAM=opi"),
                (name: "Lab Board", fqbn: "lab:avr:proto", core: Some("lab:avr-extra")),
            ],
        )
        "#;

        let mut db = BoardDatabase::builtin();
        let before = db.len();
        let count = db.load_ron(ron).unwrap();

        assert_eq!(count, 2);
        // ESP32-S3 overrides the built-in entry, Lab Board is new
        assert_eq!(db.len(), before + 1);
        assert_eq!(db.find("ESP32-S3").unwrap().fqbn, "esp32:esp32:esp32s3:PSRAM=opi");
        assert_eq!(db.find("Lab Board").unwrap().core, "lab:avr-extra");
    }

    #[test]
    fn test_rejects_malformed_fqbn() {
        let ron = r#"(vendor: "X", boards: [(name: "Bad", fqbn: "nocolons")])"#;
        let mut db = BoardDatabase::new();
        assert!(matches!(db.load_ron(ron), Err(BoardDbError::Validation(_))));
    }

    #[test]
    fn test_resolve_accepts_raw_fqbn() {
        let db = BoardDatabase::builtin();
        assert_eq!(db.resolve("Teensy 4.0").unwrap().fqbn, "teensy:avr:teensy40");
        assert_eq!(db.resolve("arduino:avr:uno").unwrap().name, "Arduino Uno");

        let custom = db.resolve("acme:samd:widget").unwrap();
        assert_eq!(custom.core, "acme:samd");
        assert!(db.resolve("not a board").is_none());
    }

    #[test]
    fn test_core_of() {
        assert_eq!(core_of("arduino:avr:nano:cpu=atmega328"), "arduino:avr");
        assert_eq!(core_of("esp32:esp32:esp32"), "esp32:esp32");
    }
}
