//! Firmware kinds and the arduino-cli argument lists built for them

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use mcuprog_core::FlashRequest;

use crate::error::{ArduinoError, Result};

/// How a firmware file is handed to arduino-cli
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareKind {
    /// Sketch source, compiled and uploaded in one step
    Sketch,
    /// Pre-built image, uploaded as is
    Image,
}

impl FirmwareKind {
    /// Classify by file extension (case-insensitive)
    pub fn detect(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "ino" | "pde" => Ok(FirmwareKind::Sketch),
            "hex" | "bin" | "elf" => Ok(FirmwareKind::Image),
            "" => Err(ArduinoError::UnsupportedFirmware("(none)".into())),
            other => Err(ArduinoError::UnsupportedFirmware(format!(".{}", other))),
        }
    }
}

/// Arguments programming one device
pub fn program_args(kind: FirmwareKind, request: &FlashRequest) -> Vec<OsString> {
    let mut args: Vec<OsString> = match kind {
        FirmwareKind::Sketch => vec!["compile".into(), "--upload".into()],
        FirmwareKind::Image => vec!["upload".into()],
    };
    args.extend([
        OsString::from("--fqbn"),
        OsString::from(&request.fqbn),
        OsString::from("--port"),
        OsString::from(&request.port),
    ]);
    if kind == FirmwareKind::Image {
        args.push("--input-file".into());
        args.push(request.firmware.clone().into_os_string());
    }
    if request.verify {
        args.push("--verify".into());
    }
    if request.verbose {
        args.push("--verbose".into());
    }
    if kind == FirmwareKind::Sketch {
        args.push(request.firmware.clone().into_os_string());
    }
    args
}

/// Arguments compiling a sketch into `output_dir` without uploading
pub fn compile_args(sketch: &Path, fqbn: &str, output_dir: &Path, verbose: bool) -> Vec<OsString> {
    vec![
        "compile".into(),
        "--fqbn".into(),
        fqbn.into(),
        "--output-dir".into(),
        output_dir.as_os_str().to_os_string(),
        (if verbose { "--verbose" } else { "--quiet" }).into(),
        sketch.as_os_str().to_os_string(),
    ]
}

/// `<sketch dir>/<sketch name>_compiled`
pub fn default_output_dir(sketch: &Path) -> PathBuf {
    let stem = sketch
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sketch".into());
    sketch
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!("{}_compiled", stem))
}

/// Uploadable images in a compile output directory, `.bin` first
pub fn find_images(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut images: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .filter(|p| matches!(FirmwareKind::detect(p), Ok(FirmwareKind::Image)))
        .collect();
    images.sort_by_key(|p| {
        let is_bin = p.extension().is_some_and(|e| e.eq_ignore_ascii_case("bin"));
        (!is_bin, p.clone())
    });
    Ok(images)
}
