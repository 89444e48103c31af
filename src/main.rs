use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use phosim_pipeline::config::{Config, DEFAULT_CONFIG_FILE};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "phosim-pipeline")]
#[command(version, about = "Distributed PhoSim visit pipeline: preprocess, raytrace, verify")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Pipeline configuration file
    #[arg(long, global = true, env = "PHOSIM_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

/// `--raft 22 --sensor 11 --exposure 1`: restricts a run to part of the focal plane.
#[derive(clap::Args, Clone, Debug, Default)]
pub struct UnitArgs {
    /// Raft coordinates, e.g. 22 or R22
    #[arg(long)]
    pub raft: Option<String>,
    /// Sensor coordinates within the raft, e.g. 11 or S11
    #[arg(long)]
    pub sensor: Option<String>,
    /// Exposure index, 0 or 1
    #[arg(long)]
    pub exposure: Option<u8>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the work units of a visit from its trim catalogs
    Partition {
        trimfile: PathBuf,
        /// Directory holding trimcatalog_<obs>_<chip>.pars files
        #[arg(long)]
        trim_dir: PathBuf,
        /// Extra raytrace commands appended to every chip pars
        #[arg(long)]
        extra_commands: Option<PathBuf>,
        #[command(flatten)]
        units: UnitArgs,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Query manifest records
    Manifest {
        path: PathBuf,
        #[arg(long)]
        major: Option<String>,
        #[arg(long)]
        minor: Option<String>,
        /// Only the last matching value
        #[arg(long)]
        last: bool,
    },
    /// Prepare a visit: visit pars, trim, unit pars, exec scripts, staging
    Preprocess {
        trimfile: PathBuf,
        #[arg(long)]
        extra_commands: Option<PathBuf>,
        /// Leave atmosphere screens to the raytrace nodes
        #[arg(long)]
        skip_atmoscreens: bool,
        /// Stop after cosmic rays; no amplifier images
        #[arg(long)]
        no_e2adc: bool,
        #[command(flatten)]
        units: UnitArgs,
    },
    /// Raytrace one unit of a staged visit
    Raytrace {
        observation_id: String,
        /// e.g. R22_S11
        chip_id: String,
        /// e.g. E000
        exposure_id: String,
        /// Archive name inside the visit's stage dir
        #[arg(long)]
        pars_archive: Option<String>,
        #[arg(long)]
        no_e2adc: bool,
    },
    /// Submit every exec script of a staged visit
    Submit {
        observation_id: String,
        /// Print the submit commands without running them
        #[arg(long)]
        dry_run: bool,
    },
    /// Check pipeline artifacts; exit code 2 = missing, 4 = corrupt, 6 = both
    Verify {
        #[arg(short, long, value_enum)]
        stage: VerifyStage,
        observation_id: String,
        /// Filter number or letter
        filter: String,
        /// Stage, exec or save root, depending on the stage
        path: PathBuf,
        /// Comma-separated unit ids, e.g. R22_S11_E000
        #[arg(short, long, default_value = "")]
        idlist: String,
        /// Comma-separated exposure ids for raytrace_output
        #[arg(short, long, default_value = "E000,E001")]
        explist: String,
        /// Focal-plane group for raytrace_output
        #[arg(short, long, default_value = "Group0")]
        camstr: String,
        /// Also write the findings to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Don't repeat the findings on stderr
        #[arg(long, alias = "no_stderr")]
        no_stderr: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
#[value(rename_all = "snake_case")]
pub enum VerifyStage {
    PreprocessOutput,
    RaytraceInput,
    RaytraceExec,
    RaytraceOutput,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and list every problem
    Validate,
    /// Write a default phosim.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // `config` must work on a broken file, so it loads on its own.
    if let Commands::Config { command } = &cli.command {
        let _guard = phosim_pipeline::logging::init(cli.verbose, None);
        return cmd::cmd_config(&cli.config, command.clone());
    }

    let config = Config::load(&cli.config, cli.verbose)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    let guard = phosim_pipeline::logging::init(cli.verbose, config.toml.general.log_dir.as_deref());

    match &cli.command {
        Commands::Partition {
            trimfile,
            trim_dir,
            extra_commands,
            units,
            json,
        } => cmd::cmd_partition(&config, trimfile, trim_dir, extra_commands.as_deref(), units, *json)?,
        Commands::Manifest {
            path,
            major,
            minor,
            last,
        } => cmd::cmd_manifest(path, major.as_deref(), minor.as_deref(), *last)?,
        Commands::Preprocess {
            trimfile,
            extra_commands,
            skip_atmoscreens,
            no_e2adc,
            units,
        } => {
            cmd::cmd_preprocess(
                &config,
                trimfile,
                extra_commands.as_deref(),
                *skip_atmoscreens,
                *no_e2adc,
                units,
            )
            .await?
        }
        Commands::Raytrace {
            observation_id,
            chip_id,
            exposure_id,
            pars_archive,
            no_e2adc,
        } => {
            cmd::cmd_raytrace(
                &config,
                observation_id,
                chip_id,
                exposure_id,
                pars_archive.clone(),
                *no_e2adc,
            )
            .await?
        }
        Commands::Submit {
            observation_id,
            dry_run,
        } => cmd::cmd_submit(&config, observation_id, *dry_run).await?,
        Commands::Verify {
            stage,
            observation_id,
            filter,
            path,
            idlist,
            explist,
            camstr,
            output,
            no_stderr,
        } => {
            let args = cmd::VerifyArgs {
                stage: *stage,
                observation_id,
                filter,
                path,
                idlist,
                explist,
                camstr,
                output: output.as_deref(),
                no_stderr: *no_stderr,
            };
            let code = cmd::cmd_verify(&config, &args).await?;
            if code != 0 {
                drop(guard);
                std::process::exit(code);
            }
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}
