//! Catalog listing (`zeule phases`).

use std::path::Path;

use anyhow::Result;

use zeule::config::ZeuleConfig;

pub fn cmd_phases(config_path: &Path) -> Result<()> {
    let config = ZeuleConfig::resolve(config_path)?;
    let catalog = config.catalog()?;

    println!();
    println!("Phase Catalog");
    println!("=============");
    if config.phases.is_empty() {
        println!("(built-in default; add [[phases]] to {} to customize)", config_path.display());
    }
    println!();
    println!("{:>3}  {:>4}  {:<28} {:<9} {}", "#", "seq", "name", "approval", "enabled");
    for (index, phase) in catalog.phases().iter().enumerate() {
        println!(
            "{:>3}  {:>4}  {:<28} {:<9} {}",
            index,
            phase.sequence_index,
            phase.name,
            if phase.requires_approval { "required" } else { "-" },
            if phase.enabled { "yes" } else { "no" },
        );
    }
    println!();
    Ok(())
}
