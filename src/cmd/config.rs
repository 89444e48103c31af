//! Configuration view and validation commands: `phosim-pipeline config`.

use anyhow::Result;
use std::path::Path;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    use phosim_pipeline::config::PipelineToml;

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("PhoSim Pipeline Configuration");
            println!("=============================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                PipelineToml::load(config_path)?
            } else {
                println!("No config file at {}; using defaults.", config_path.display());
                PipelineToml::default()
            };
            println!();

            println!("[general]");
            println!("  scratch_exec_path = \"{}\"", toml.general.scratch_exec_path.display());
            println!("  stage_path = \"{}\"", toml.general.stage_path.display());
            println!("  save_path = \"{}\"", toml.general.save_path.display());
            if let Some(dir) = &toml.general.data_dir {
                println!("  data_dir = \"{}\"", dir.display());
            }
            if let Some(dir) = &toml.general.log_dir {
                println!("  log_dir = \"{}\"", dir.display());
            }
            println!("  instrument = \"{}\"", toml.general.instrument);
            println!();

            println!("[scheduler]");
            println!("  backend = \"{}\"", toml.scheduler.backend);
            println!("  exec_script_base = \"{}\"", toml.scheduler.exec_script_base);
            println!();

            if toml.pbs.email.is_some() || toml.pbs.job_name.is_some() || toml.pbs.walltime.is_some() {
                println!("[pbs]");
                if let Some(email) = &toml.pbs.email {
                    println!("  email = \"{}\"", email);
                }
                if let Some(name) = &toml.pbs.job_name {
                    println!("  job_name = \"{}\"", name);
                }
                if let Some(walltime) = &toml.pbs.walltime {
                    println!("  walltime = \"{}\"", walltime);
                }
                println!("  cores_per_node = {}", toml.pbs.cores_per_node);
                println!();
            }

            println!("[tools]");
            println!("  bin_dir = \"{}\"", toml.tools.bin_dir.display());
            match toml.tools.timeout_secs {
                Some(secs) => println!("  timeout_secs = {}", secs),
                None => println!("  timeout_secs = (none)"),
            }
            println!("  fitsverify = \"{}\"", toml.tools.fitsverify);
            println!();

            println!("[preprocess]");
            println!("  run_e2adc = {}", toml.preprocess.run_e2adc);
            println!("  skip_atmoscreens = {}", toml.preprocess.skip_atmoscreens);
            println!();

            if !config_path.exists() {
                println!("Run 'phosim-pipeline config init' to create {}.", config_path.display());
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No config file found. Using defaults (valid).");
                return Ok(());
            }

            let toml = PipelineToml::load(config_path)?;
            let problems = toml.problems();
            if problems.is_empty() {
                println!("Configuration is valid.");
                println!();
            } else {
                println!("Configuration problems:");
                for problem in &problems {
                    println!("  - {}", problem);
                }
                println!();
                anyhow::bail!("{} configuration problem(s)", problems.len());
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists.", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }

            PipelineToml::default().save(config_path)?;

            println!("Created {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [general] scratch_exec_path, stage_path, save_path, data_dir");
            println!("  - [scheduler] backend (local or batch_queue) and [pbs] header values");
            println!("  - [tools] bin_dir, timeout_secs");
            println!();
        }
    }

    Ok(())
}
