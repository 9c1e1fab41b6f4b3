//! Inspect command implementation for Vigil CLI.

use std::path::Path;

use vigil_core::ModulePackage;

use crate::colors;

/// Print the manifest and file listing of a package.
pub fn execute(path: &Path) -> anyhow::Result<()> {
    let package = ModulePackage::open(path).map_err(vigil_core::Error::from)?;
    let manifest = package.manifest();

    println!("{}{}{} {}", colors::BOLD, manifest.name, colors::RESET, manifest.version);
    println!("  id:             {}", manifest.id);
    if !manifest.description.is_empty() {
        println!("  description:    {}", manifest.description);
    }
    println!("  main unit:      {}", manifest.main_code_unit_name);
    println!("  entry type:     {}", manifest.entry_type_name);
    println!(
        "  resource types: {}",
        manifest
            .supported_resource_types
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!(
        "  cadences (min): {}",
        manifest
            .supported_cadences
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let main_entry = package.main_unit_entry();
    println!("\n{}Contents:{}", colors::BOLD, colors::RESET);
    for (name, bytes) in package.content() {
        let marker = if Some(name.as_str()) == main_entry { " (main)" } else { "" };
        println!(
            "  {:<40} {}{:>10} bytes{}{}",
            name,
            colors::DIM,
            bytes.len(),
            colors::RESET,
            marker
        );
    }
    Ok(())
}
