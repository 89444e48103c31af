//! Stage commands: `phosim-pipeline preprocess` and `phosim-pipeline raytrace`.

use anyhow::{Context, Result};
use phosim_pipeline::config::Config;
use std::path::Path;

use super::super::UnitArgs;

pub async fn cmd_preprocess(
    config: &Config,
    trimfile: &Path,
    extra_commands: Option<&Path>,
    skip_atmoscreens: bool,
    no_e2adc: bool,
    units: &UnitArgs,
) -> Result<()> {
    use phosim_pipeline::backend::ExecutionBackend;
    use phosim_pipeline::process::ProcessExecutor;
    use phosim_pipeline::stage::{PreprocessOptions, PreprocessStage};

    let program = std::env::current_exe().context("Failed to locate the pipeline binary")?;
    let backend = ExecutionBackend::from_config(config)?;
    let executor = ProcessExecutor::new(config.timeout());

    let mut options = PreprocessOptions::new(config, trimfile, program);
    options.extra_commands = extra_commands.map(Path::to_path_buf);
    options.skip_atmoscreens |= skip_atmoscreens;
    options.run_e2adc &= !no_e2adc;
    options.filter = super::unit_filter(units)?;

    let summary = PreprocessStage::new(config, &backend, &executor)
        .run(&options)
        .await
        .with_context(|| format!("Preprocessing {} failed", trimfile.display()))?;

    println!();
    println!(
        "{} Observation {} staged: {} unit(s)",
        console::style("✓").green().bold(),
        summary.observation_id,
        summary.units.len()
    );
    println!("  Stage dir:    {}", summary.stage_dir.display());
    println!("  Manifest:     {}", summary.manifest.display());
    println!("  Pars archive: {}", summary.pars_archive.display());
    println!();
    Ok(())
}

pub async fn cmd_raytrace(
    config: &Config,
    observation_id: &str,
    chip_id: &str,
    exposure_id: &str,
    pars_archive: Option<String>,
    no_e2adc: bool,
) -> Result<()> {
    use phosim_pipeline::identifier::{ChipCoord, parse_exposure_tag};
    use phosim_pipeline::process::ProcessExecutor;
    use phosim_pipeline::stage::{RaytraceOptions, RaytraceStage};

    let options = RaytraceOptions {
        observation_id: observation_id.to_string(),
        chip: chip_id.parse::<ChipCoord>()?,
        exposure_index: parse_exposure_tag(exposure_id)?,
        pars_archive,
        run_e2adc: no_e2adc.then_some(false),
    };
    let executor = ProcessExecutor::new(config.timeout());

    let summary = RaytraceStage::new(config, &executor)
        .run(&options)
        .await
        .with_context(|| format!("Raytrace of {}_{}_{} failed", observation_id, chip_id, exposure_id))?;

    println!();
    println!(
        "{} {} finished{}",
        console::style("✓").green().bold(),
        summary.unit_id,
        if summary.regenerated_screens {
            " (atmosphere screens regenerated)"
        } else {
            ""
        }
    );
    println!("  eimage: {}", summary.eimage.display());
    println!("  raw images: {}", summary.raw_images.len());
    println!();
    Ok(())
}
