//! Work-unit listing: `phosim-pipeline partition`.

use anyhow::{Context, Result};
use phosim_pipeline::config::Config;
use std::path::Path;

use super::super::UnitArgs;

pub fn cmd_partition(
    config: &Config,
    trimfile: &Path,
    trim_dir: &Path,
    extra_commands: Option<&Path>,
    units: &UnitArgs,
    json: bool,
) -> Result<()> {
    use phosim_pipeline::focalplane::FocalPlaneLayout;
    use phosim_pipeline::observation::ObservationContext;
    use phosim_pipeline::partition::{Partitioner, TrimCatalogCounts};

    let obs = ObservationContext::load(trimfile, extra_commands)
        .with_context(|| format!("Failed to read trimfile {}", trimfile.display()))?;
    let layout = FocalPlaneLayout::load(config.toml.focalplane.layout_file.as_deref(), obs.camstr()?)?;
    let filter = super::unit_filter(units)?;
    let counts = TrimCatalogCounts::new(trim_dir, &obs.observation_id);
    let partitioner = Partitioner::for_observation(&obs, &layout, filter, counts)?;
    let units = partitioner.units()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&units)?);
        return Ok(());
    }

    println!();
    println!(
        "Observation {}: {} unit(s) from {} candidate chip(s), threshold > {}",
        obs.observation_id,
        units.len(),
        partitioner.candidate_chips().len(),
        partitioner.threshold()
    );
    println!();
    println!("{:<16} {:<8} Seed", "Unit", "Chip");
    println!("{:<16} {:<8} ----", "----------------", "-------");
    for unit in &units {
        println!("{:<16} {:<8} {}", unit.unit_id(), unit.chip_id(), unit.seed);
    }
    println!();
    Ok(())
}
