//! Visit preprocessing: everything that runs once per observation.
//!
//! 1. Parse the trimfile and reset the visit's scratch and stage dirs.
//! 2. Write visit pars; run create_atmosphere, the screen generators (unless
//!    skipped), optics_parameters and tracking.
//! 3. Run trim per raft; append the sentinel to each chip's catalog.
//! 4. Partition, then write every unit's pars and exec script.
//! 5. Record visit params and exposure ids in the manifest.
//! 6. Archive the pars and stage archive, scripts and config.

use super::atmosphere::{self, ScreenSettings};
use super::pars::{self, TRIM_SENTINEL};
use super::{copy_into, read_file, require_output, reset_dir, run_with_pars, tools, write_file};
use crate::archive;
use crate::backend::{ExecJob, ExecutionBackend};
use crate::config::{Config, DEFAULT_CONFIG_FILE};
use crate::errors::StageError;
use crate::focalplane::FocalPlaneLayout;
use crate::identifier::{ChipCoord, ParsFilenames};
use crate::manifest::{MANIFEST_FILE, ManifestRecord, ManifestStore, OpenMode, format_flag, params};
use crate::observation::ObservationContext;
use crate::partition::{ExposureUnit, Partitioner, TrimCatalogCounts, UnitFilter};
use crate::process::ToolExecutor;
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct PreprocessOptions {
    pub trimfile: PathBuf,
    pub extra_commands: Option<PathBuf>,
    pub skip_atmoscreens: bool,
    pub run_e2adc: bool,
    pub filter: UnitFilter,
    /// Pipeline binary the exec scripts call back into
    pub program: PathBuf,
}

impl PreprocessOptions {
    /// Options with `[preprocess]` defaults and no unit filter.
    pub fn new(config: &Config, trimfile: impl Into<PathBuf>, program: impl Into<PathBuf>) -> Self {
        Self {
            trimfile: trimfile.into(),
            extra_commands: None,
            skip_atmoscreens: config.toml.preprocess.skip_atmoscreens,
            run_e2adc: config.toml.preprocess.run_e2adc,
            filter: UnitFilter::default(),
            program: program.into(),
        }
    }
}

/// What a preprocessing run staged.
#[derive(Debug, Clone, Serialize)]
pub struct PreprocessSummary {
    pub observation_id: String,
    pub units: Vec<ExposureUnit>,
    pub stage_dir: PathBuf,
    pub manifest: PathBuf,
    pub pars_archive: PathBuf,
    pub exec_scripts: Vec<PathBuf>,
}

/// Visit directories under scratch.
struct VisitDirs {
    /// Tool working directory; every pars file lives here
    work: PathBuf,
    /// Archive and exec scripts, before staging
    output: PathBuf,
    stage: PathBuf,
}

pub struct PreprocessStage<'a> {
    config: &'a Config,
    backend: &'a ExecutionBackend,
    executor: &'a dyn ToolExecutor,
}

impl<'a> PreprocessStage<'a> {
    pub fn new(config: &'a Config, backend: &'a ExecutionBackend, executor: &'a dyn ToolExecutor) -> Self {
        Self {
            config,
            backend,
            executor,
        }
    }

    pub async fn run(&self, options: &PreprocessOptions) -> Result<PreprocessSummary, StageError> {
        let obs = ObservationContext::load(&options.trimfile, options.extra_commands.as_deref())?;
        let names = ParsFilenames::new(&obs.observation_id);
        tracing::info!(
            observation_id = %obs.observation_id,
            trimfile = %options.trimfile.display(),
            skip_atmoscreens = options.skip_atmoscreens,
            run_e2adc = options.run_e2adc,
            "Starting preprocessing"
        );

        let dirs = self.init_dirs(&obs.observation_id)?;
        self.visit_pars(&obs, &names, &dirs.work, options.skip_atmoscreens)
            .await?;

        let layout = FocalPlaneLayout::load(self.config.toml.focalplane.layout_file.as_deref(), obs.camstr()?)?;
        self.trim(&obs, &names, &layout, &options.filter, &dirs.work)
            .await?;

        let counts = TrimCatalogCounts::new(&dirs.work, &obs.observation_id);
        let units = Partitioner::for_observation(&obs, &layout, options.filter, counts)?.units()?;
        tracing::info!(units = units.len(), "Partitioned visit");

        let manifest_path = dirs.stage.join(MANIFEST_FILE);
        let mut manifest = ManifestStore::open(&manifest_path, OpenMode::Write)?;
        manifest.write(&self.visit_params(&obs, &names, options)?)?;

        let staged_config = self.stage_config(&dirs.stage)?;
        let mut exec_scripts = Vec::with_capacity(units.len());
        self.unit_pars(&obs, &names, &units, options.run_e2adc, &dirs.work)?;
        for unit in &units {
            let script = self.exec_script(&obs, &names, unit, options, &dirs, &staged_config)?;
            manifest.write(&[ManifestRecord::exposure(&unit.unit_id())?])?;
            exec_scripts.push(script);
        }

        let keys: Vec<(ChipCoord, u8)> = units.iter().map(|u| (u.chip, u.exposure_index)).collect();
        let members = names.pars_archive_members(&keys, options.run_e2adc, options.skip_atmoscreens);
        let archive_path = dirs.output.join(names.pars_archive());
        archive::create(&archive_path, &dirs.work, &members)?;
        tracing::info!(archive = %archive_path.display(), members = members.len(), "Archived pars");

        let mut staged = Vec::with_capacity(exec_scripts.len() + 2);
        let pars_archive = stage_file(&archive_path, &dirs.stage)?;
        staged.push(pars_archive.clone());
        let mut staged_scripts = Vec::with_capacity(exec_scripts.len());
        for script in &exec_scripts {
            let path = stage_file(script, &dirs.stage)?;
            staged.push(path.clone());
            staged_scripts.push(path);
        }
        staged.push(staged_config);

        let records = staged
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| ManifestRecord::file(&n.to_string_lossy()))
            .collect::<Result<Vec<_>, _>>()?;
        manifest.write(&records)?;
        tracing::info!(
            stage_dir = %dirs.stage.display(),
            files = records.len(),
            "Staged preprocessing output"
        );

        Ok(PreprocessSummary {
            observation_id: obs.observation_id.clone(),
            units,
            stage_dir: dirs.stage,
            manifest: manifest_path,
            pars_archive,
            exec_scripts: staged_scripts,
        })
    }

    fn init_dirs(&self, observation_id: &str) -> Result<VisitDirs, StageError> {
        let scratch = self.config.visit_scratch_dir(observation_id);
        reset_dir(&scratch)?;
        let dirs = VisitDirs {
            work: scratch.join("work"),
            output: scratch.join("output"),
            stage: self.config.visit_stage_dir(observation_id),
        };
        for dir in [&dirs.work, &dirs.output] {
            std::fs::create_dir_all(dir).map_err(|e| StageError::io(dir, e))?;
        }
        reset_dir(&dirs.stage)?;
        Ok(dirs)
    }

    async fn visit_pars(
        &self,
        obs: &ObservationContext,
        names: &ParsFilenames,
        work: &Path,
        skip_atmoscreens: bool,
    ) -> Result<(), StageError> {
        let catalogs = pars::catalog_list(obs, names);
        write_file(&work.join(names.objectcatalog()), &pars::object_catalog(obs))?;
        write_file(&work.join(names.catlist()), &catalogs.body)?;
        write_file(&work.join(names.obs()), &pars::obs_pars(obs))?;
        write_file(&work.join(names.atmosphere()), &pars::atmosphere_pars(obs, names))?;
        write_file(&work.join(names.control()), &pars::control_pars(obs, names))?;
        write_file(&work.join(names.track()), &pars::track_pars(obs, names))?;

        self.run_tool(tools::CREATE_ATMOSPHERE, work, &names.atmosphere())
            .await?;
        let atmosphere_raytrace = work.join(names.atmosphere_raytrace());
        require_output(&atmosphere_raytrace)?;

        if skip_atmoscreens {
            tracing::info!("Skipping atmosphere screens");
        } else {
            let settings = ScreenSettings::from_observation(obs);
            atmosphere::generate_screens(self.executor, self.config, names, &settings, work).await?;
        }
        append(&atmosphere_raytrace, &pars::atmosphere_screen_references(names))?;
        write_file(&work.join(names.cloud_raytrace()), &pars::cloud_screen_references(names))?;

        self.run_tool(tools::OPTICS_PARAMETERS, work, &names.control())
            .await?;
        require_output(&work.join(names.optics()))?;
        self.run_tool(tools::TRACKING, work, &names.track()).await?;
        require_output(&work.join(names.tracking()))?;
        Ok(())
    }

    /// One trim run per raft over the chips `filter` keeps.
    async fn trim(
        &self,
        obs: &ObservationContext,
        names: &ParsFilenames,
        layout: &FocalPlaneLayout,
        filter: &UnitFilter,
        work: &Path,
    ) -> Result<(), StageError> {
        let catalogs = pars::catalog_list(obs, names);
        for chips in layout.rafts().into_values() {
            let chips: Vec<ChipCoord> = chips.into_iter().filter(|c| filter.matches_chip(c)).collect();
            let Some(first) = chips.first() else { continue };
            let raft_id = first.raft_id();
            tracing::info!(raft = %raft_id, chips = chips.len(), "Running trim");

            let trim_pars = names.trim_pars(&raft_id);
            write_file(&work.join(&trim_pars), &pars::trim_pars(obs, names, &catalogs, &chips))?;
            self.run_tool(tools::TRIM, work, &trim_pars).await?;

            for chip in &chips {
                let catalog = work.join(names.trim_output(&chip.chip_id()));
                require_output(&catalog)?;
                append(&catalog, &format!("{}\n", TRIM_SENTINEL))?;
            }
        }
        Ok(())
    }

    fn visit_params(
        &self,
        obs: &ObservationContext,
        names: &ParsFilenames,
        options: &PreprocessOptions,
    ) -> Result<Vec<ManifestRecord>, StageError> {
        Ok(vec![
            ManifestRecord::param(params::OBSERVATION_ID, &obs.observation_id)?,
            ManifestRecord::param(params::FILTER_NUM, obs.filter.index().to_string())?,
            ManifestRecord::param(params::INSTRUMENT, &self.config.toml.general.instrument)?,
            ManifestRecord::param(params::EXEC_SCRIPT_BASE, self.config.exec_script_base())?,
            ManifestRecord::param(params::PARS_ARCHIVE_NAME, names.pars_archive())?,
            ManifestRecord::param(params::RUN_E2ADC, format_flag(options.run_e2adc))?,
            ManifestRecord::param(params::SKIP_ATMOSCREENS, format_flag(options.skip_atmoscreens))?,
            ManifestRecord::param(params::BACKEND, self.backend.kind().to_string())?,
        ])
    }

    /// Per-unit pars, plus the per-exposure time pars and per-chip sedlist
    /// each written once.
    fn unit_pars(
        &self,
        obs: &ObservationContext,
        names: &ParsFilenames,
        units: &[ExposureUnit],
        run_e2adc: bool,
        work: &Path,
    ) -> Result<(), StageError> {
        let obs_pars = read_file(&work.join(names.obs()))?;
        let atmosphere_raytrace = read_file(&work.join(names.atmosphere_raytrace()))?;
        let optics = read_file(&work.join(names.optics()))?;
        let cloud_raytrace = read_file(&work.join(names.cloud_raytrace()))?;

        let mut sed_chips = BTreeSet::new();
        for unit in units {
            let unit_id = unit.unit_id();
            let chip_id = unit.chip_id();
            tracing::debug!(unit = %unit_id, seed = unit.seed, "Writing unit pars");

            let time = pars::time_pars(obs, unit.exposure_index);
            write_file(&work.join(names.time(&unit.exposure_tag())), &time)?;

            let offsets = self.data_table("offsets", &format!("pars_{}", chip_id))?;
            let chip = pars::chip_pars(obs, names, unit, offsets.as_deref());
            write_file(&work.join(names.chip(&unit_id)), &chip)?;

            let commands =
                pars::raytrace_commands(&[&obs_pars, &atmosphere_raytrace, &optics, &time, &cloud_raytrace, &chip]);
            write_file(&work.join(names.raytrace(&unit_id)), &commands)?;
            write_file(
                &work.join(names.background(&unit_id)),
                &pars::background_pars(obs, names, unit, &atmosphere_raytrace)?,
            )?;
            write_file(&work.join(names.cosmic(&unit_id)), &pars::cosmic_pars(obs, names, unit))?;
            if run_e2adc {
                let readout = self.data_table("readout", &format!("readoutpars_{}", chip_id))?;
                write_file(
                    &work.join(names.e2adc(&unit_id)),
                    &pars::e2adc_pars(obs, names, unit, readout.as_deref()),
                )?;
            }

            let catalog = work.join(names.trim_output(&chip_id));
            archive::gzip_file(&catalog, &work.join(names.trimcatalog(&unit_id)))?;
            if sed_chips.insert(chip_id.clone()) {
                let seds = pars::sed_list(&read_file(&catalog)?);
                write_file(&work.join(names.sedlist(&chip_id)), &seds)?;
            }
        }
        Ok(())
    }

    fn exec_script(
        &self,
        obs: &ObservationContext,
        names: &ParsFilenames,
        unit: &ExposureUnit,
        options: &PreprocessOptions,
        dirs: &VisitDirs,
        staged_config: &Path,
    ) -> Result<PathBuf, StageError> {
        let unit_id = unit.unit_id();
        let chip_id = unit.chip_id();
        let exposure_tag = unit.exposure_tag();
        let archive = names.pars_archive();
        let job = ExecJob {
            observation_id: &obs.observation_id,
            chip_id: &chip_id,
            exposure_tag: &exposure_tag,
            filter: obs.filter,
            instrument: &self.config.toml.general.instrument,
            run_e2adc: options.run_e2adc,
            pars_archive: Some(&archive),
            program: &options.program,
            config_file: Some(staged_config),
            log_path: dirs
                .stage
                .join(names.exec_script(self.config.exec_script_base(), &unit_id, "log")),
        };
        self.backend
            .write_script(&dirs.output, self.config.exec_script_base(), &job)
    }

    /// The run's config file, copied into the stage dir; the effective
    /// settings are written out when none was loaded.
    fn stage_config(&self, stage: &Path) -> Result<PathBuf, StageError> {
        match &self.config.source {
            Some(source) => stage_file(source, stage),
            None => {
                let path = stage.join(DEFAULT_CONFIG_FILE);
                let content = toml::to_string_pretty(&self.config.toml).map_err(|e| {
                    StageError::io(&path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
                })?;
                write_file(&path, &content)?;
                Ok(path)
            }
        }
    }

    /// `<data_dir>/focal_plane/sta_misalignments/<table>/<name>`, when a
    /// data tree is configured and has it.
    fn data_table(&self, table: &str, name: &str) -> Result<Option<String>, StageError> {
        let Some(data_dir) = &self.config.toml.general.data_dir else {
            return Ok(None);
        };
        let path = data_dir
            .join("focal_plane/sta_misalignments")
            .join(table)
            .join(name);
        if path.is_file() {
            read_file(&path).map(Some)
        } else {
            tracing::debug!(path = %path.display(), "No data table");
            Ok(None)
        }
    }

    async fn run_tool(&self, tool: &str, work: &Path, pars: &str) -> Result<(), StageError> {
        run_with_pars(self.executor, self.config, tool, work, &work.join(pars)).await?;
        Ok(())
    }
}

fn stage_file(source: &Path, stage: &Path) -> Result<PathBuf, StageError> {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| StageError::MissingOutput(source.to_path_buf()))?;
    copy_into(source, stage, &name)
}

fn append(path: &Path, text: &str) -> Result<(), StageError> {
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|e| StageError::io(path, e))?;
    file.write_all(text.as_bytes())
        .map_err(|e| StageError::io(path, e))
}
