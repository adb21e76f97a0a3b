//! Man page generator for mcuprog
//!
//! Writes `mcuprog.1` plus one `mcuprog-<command>.1` page per subcommand.
//!
//! Usage: cargo run --bin gen-manpage -- [output-dir]

use clap::CommandFactory;
use std::fs;
use std::path::{Path, PathBuf};

#[path = "../cli.rs"]
#[allow(dead_code)]
mod cli;

fn render(cmd: clap::Command, dir: &Path, name: &str) -> std::io::Result<PathBuf> {
    let mut buffer = Vec::new();
    clap_mangen::Man::new(cmd).render(&mut buffer)?;
    let path = dir.join(format!("{}.1", name));
    fs::write(&path, buffer)?;
    Ok(path)
}

fn main() -> std::io::Result<()> {
    let output_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("man"));
    fs::create_dir_all(&output_dir)?;

    let cmd = cli::Cli::command();
    let main_page = render(cmd.clone(), &output_dir, "mcuprog")?;
    println!("Generated {}", main_page.display());

    for sub in cmd.get_subcommands() {
        let name = format!("mcuprog-{}", sub.get_name());
        let page = render(sub.clone().name(name.clone()), &output_dir, &name)?;
        println!("Generated {}", page.display());
    }

    println!("\nTo view:");
    println!("  man -l {}", main_page.display());
    println!("\nTo install system-wide (requires sudo):");
    println!(
        "  sudo cp {}/mcuprog*.1 /usr/local/share/man/man1/ && sudo mandb",
        output_dir.display()
    );

    Ok(())
}
