//! List commands implementation

use mcuprog_core::topology::HubTopologyResolver;
use mcuprog_core::{Board, BoardDatabase};

use crate::cli::BackendArgs;
use crate::tools;

fn board_matches(board: &Board, filter: &str) -> bool {
    let filter = filter.to_lowercase();
    [&board.vendor, &board.name, &board.fqbn]
        .iter()
        .any(|field| field.to_lowercase().contains(&filter))
}

/// List known boards, optionally filtered
pub fn list_boards(db: &BoardDatabase, filter: Option<&str>) {
    println!("Known boards:");
    println!();
    println!("{:<12} {:<28} {:<36}", "Vendor", "Name", "FQBN");
    println!("{}", "-".repeat(78));

    let mut shown = 0;
    for board in db.iter() {
        if let Some(filter) = filter {
            if !board_matches(board, filter) {
                continue;
            }
        }
        println!("{:<12} {:<28} {:<36}", board.vendor, board.name, board.fqbn);
        shown += 1;
    }

    println!();
    println!("{} board(s); any other FQBN can be passed with --board", shown);
}

/// List compiled-in flashing tool backends
pub fn list_tools() {
    println!("Flashing tools:");
    println!();
    for tool in tools::available_tools() {
        let aliases = if tool.aliases.is_empty() {
            String::new()
        } else {
            format!(" (alias: {})", tool.aliases.join(", "))
        };
        println!("  {:<12} - {}{}", tool.name, tool.description, aliases);
    }
}

/// Scan ports once and show how they group behind hubs
pub fn list_ports(backend: &BackendArgs) -> Result<(), Box<dyn std::error::Error>> {
    let resolver = HubTopologyResolver::new(tools::open_enumerator(backend)?);
    let ports = resolver.resolve()?;

    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }

    println!("{:<24} {:<16} {:>5}  {}", "Port", "Hub group", "Depth", "Hardware id");
    println!("{}", "-".repeat(78));
    for port in &ports {
        println!(
            "{:<24} {:<16} {:>5}  {}",
            port.id, port.hub_group, port.hub_depth, port.hardware_id
        );
    }

    let max_depth = ports.iter().map(|p| p.hub_depth).max().unwrap_or(0);
    if max_depth >= 2 {
        println!();
        println!(
            "Nested hubs detected (depth {}); sessions will program one board per hub",
            max_depth
        );
    }
    Ok(())
}
