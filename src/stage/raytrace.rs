//! Per-unit raytrace: runs on an exec node from a staged visit.
//!
//! Tools run in a fixed tree under the unit's work dir, the layout the
//! relative paths inside the pars files expect:
//!
//! ```text
//! work/                       extracted pars archive, screens
//! work/raytrace/              raytrace
//! work/ancillary/Add_Background/fits_files/
//! work/ancillary/cosmic_rays/ create_rays
//! work/ancillary/e2adc/       e2adc
//! ```

use super::atmosphere::{self, ScreenSettings};
use super::{copy_into, read_file, require_output, reset_dir, run_with_pars, tools, write_file};
use crate::archive;
use crate::config::Config;
use crate::errors::StageError;
use crate::focalplane::Segmentation;
use crate::identifier::{ChipCoord, FilterBand, ParsFilenames, amp_id, exposure_tag};
use crate::manifest::{MANIFEST_FILE, Manifest, params};
use crate::process::ToolExecutor;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct RaytraceOptions {
    pub observation_id: String,
    pub chip: ChipCoord,
    pub exposure_index: u8,
    /// Overrides the manifest's `pars_archive_name`
    pub pars_archive: Option<String>,
    /// Overrides the manifest's `run_e2adc`
    pub run_e2adc: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RaytraceSummary {
    pub unit_id: String,
    pub eimage: PathBuf,
    pub raw_images: Vec<PathBuf>,
    /// Screens were missing from the archive and generated here
    pub regenerated_screens: bool,
}

/// Tool working directories of one unit.
struct UnitDirs {
    work: PathBuf,
    raytrace: PathBuf,
    background: PathBuf,
    cosmic: PathBuf,
    e2adc: PathBuf,
    /// Gzipped eimage and raw images, before saving
    output: PathBuf,
}

impl UnitDirs {
    fn create(unit_dir: &Path) -> Result<Self, StageError> {
        reset_dir(unit_dir)?;
        let work = unit_dir.join("work");
        let ancillary = work.join("ancillary");
        let dirs = Self {
            raytrace: work.join("raytrace"),
            background: ancillary.join("Add_Background"),
            cosmic: ancillary.join("cosmic_rays"),
            e2adc: ancillary.join("e2adc"),
            output: unit_dir.join("output"),
            work,
        };
        for dir in [
            &dirs.raytrace,
            &dirs.background.join("fits_files"),
            &dirs.cosmic,
            &dirs.e2adc,
            &dirs.output,
        ] {
            std::fs::create_dir_all(dir).map_err(|e| StageError::io(dir, e))?;
        }
        Ok(dirs)
    }
}

pub struct RaytraceStage<'a> {
    config: &'a Config,
    executor: &'a dyn ToolExecutor,
}

impl<'a> RaytraceStage<'a> {
    pub fn new(config: &'a Config, executor: &'a dyn ToolExecutor) -> Self {
        Self { config, executor }
    }

    pub async fn run(&self, options: &RaytraceOptions) -> Result<RaytraceSummary, StageError> {
        let obs_id = &options.observation_id;
        let names = ParsFilenames::new(obs_id);
        let chip_id = options.chip.chip_id();
        let tag = exposure_tag(options.exposure_index);
        let unit_id = options.chip.unit_id(options.exposure_index);

        let stage_dir = self.config.visit_stage_dir(obs_id);
        let manifest = Manifest::load(stage_dir.join(MANIFEST_FILE))?;
        let recorded = manifest.param(params::OBSERVATION_ID)?;
        if recorded != obs_id {
            return Err(StageError::ObservationMismatch {
                expected: obs_id.clone(),
                found: recorded.to_string(),
            });
        }
        let filter: FilterBand = manifest.param(params::FILTER_NUM)?.parse()?;
        let run_e2adc = options
            .run_e2adc
            .unwrap_or_else(|| manifest.flag(params::RUN_E2ADC));
        let archive_name = match &options.pars_archive {
            Some(name) => name.clone(),
            None => manifest.param(params::PARS_ARCHIVE_NAME)?.to_string(),
        };
        tracing::info!(
            observation_id = %obs_id,
            unit = %unit_id,
            filter = %filter.letter(),
            run_e2adc,
            "Starting raytrace"
        );

        let unit_dir = self.config.unit_scratch_dir(obs_id, &unit_id);
        let dirs = UnitDirs::create(&unit_dir)?;
        let archive_path = stage_dir.join(&archive_name);
        if !archive_path.is_file() {
            return Err(StageError::MissingInput(archive_path));
        }
        archive::extract(&archive_path, &dirs.work)?;
        for name in names
            .visit_files()
            .into_iter()
            .chain(names.unit_files(&options.chip, options.exposure_index, run_e2adc))
        {
            let path = dirs.work.join(name);
            if !path.is_file() {
                return Err(StageError::MissingInput(path));
            }
        }
        self.link_data_dir(&dirs)?;

        let regenerated_screens = !atmosphere::screens_present(&names, &dirs.work);
        if regenerated_screens {
            let settings = ScreenSettings::from_pars(
                &names,
                &read_file(&dirs.work.join(names.obs()))?,
                &read_file(&dirs.work.join(names.atmosphere()))?,
            )?;
            atmosphere::generate_screens(self.executor, self.config, &names, &settings, &dirs.work).await?;
        }

        // raytrace reads its commands with the unit's object list appended.
        let input = dirs.work.join(names.raytrace_input(&unit_id));
        let mut commands = read_file(&dirs.work.join(names.raytrace(&unit_id)))?;
        commands.push_str(&archive::read_gzip(&dirs.work.join(names.trimcatalog(&unit_id)))?);
        write_file(&input, &commands)?;
        run_with_pars(self.executor, self.config, tools::RAYTRACE, &dirs.raytrace, &input).await?;

        let image = dirs.raytrace.join(format!("{}.fits", names.image_base(&unit_id)));
        require_output(&image)?;
        let eimage = archive::gzip_file(&image, &dirs.output.join(names.eimage(&chip_id, &tag)))?;

        let background_image = dirs
            .background
            .join("fits_files")
            .join(names.background_image(&unit_id));
        std::fs::rename(&image, &background_image).map_err(|e| StageError::io(&image, e))?;
        run_with_pars(
            self.executor,
            self.config,
            tools::ADD_BACKGROUND,
            &dirs.background,
            &dirs.work.join(names.background(&unit_id)),
        )
        .await?;
        require_output(&background_image)?;

        run_with_pars(
            self.executor,
            self.config,
            tools::CREATE_RAYS,
            &dirs.cosmic,
            &dirs.work.join(names.cosmic(&unit_id)),
        )
        .await?;
        require_output(&dirs.cosmic.join(names.cosmic_image(&unit_id)))?;

        let mut raw_images = Vec::new();
        if run_e2adc {
            run_with_pars(
                self.executor,
                self.config,
                tools::E2ADC,
                &dirs.e2adc,
                &dirs.work.join(names.e2adc(&unit_id)),
            )
            .await?;
            let segmentation = Segmentation::load(self.config.toml.focalplane.segmentation_file.as_deref())?;
            for amp in segmentation.amps(&options.chip) {
                let raw = names.raw(&amp_id(&options.chip, &amp), &tag);
                let written = dirs.e2adc.join(raw.trim_end_matches(".gz"));
                require_output(&written)?;
                raw_images.push(archive::gzip_file(&written, &dirs.output.join(&raw))?);
            }
        }

        let summary = self.save(&names, filter, options, &eimage, &raw_images)?;
        tracing::info!(
            unit = %unit_id,
            eimage = %summary.eimage.display(),
            raw_images = summary.raw_images.len(),
            "Raytrace finished"
        );
        Ok(RaytraceSummary {
            regenerated_screens,
            ..summary
        })
    }

    /// Copies the unit's images into the save tree.
    fn save(
        &self,
        names: &ParsFilenames,
        filter: FilterBand,
        options: &RaytraceOptions,
        eimage: &Path,
        raw_images: &[PathBuf],
    ) -> Result<RaytraceSummary, StageError> {
        let save_path = self.config.save_path();
        let eimage_dir = save_path.join(names.eimage_output_dir(filter, &options.chip, options.exposure_index));
        let raw_dir = save_path.join(names.raw_output_dir(filter, &options.chip, options.exposure_index));

        let saved_eimage = copy_into(eimage, &eimage_dir, &file_name(eimage))?;
        let saved_raw = raw_images
            .iter()
            .map(|raw| copy_into(raw, &raw_dir, &file_name(raw)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RaytraceSummary {
            unit_id: options.chip.unit_id(options.exposure_index),
            eimage: saved_eimage,
            raw_images: saved_raw,
            regenerated_screens: false,
        })
    }

    /// `work/data` points at the configured data tree, where the pars files
    /// look for height and QE maps.
    fn link_data_dir(&self, dirs: &UnitDirs) -> Result<(), StageError> {
        let Some(data_dir) = &self.config.toml.general.data_dir else {
            return Ok(());
        };
        let link = dirs.work.join("data");
        #[cfg(unix)]
        std::os::unix::fs::symlink(data_dir, &link).map_err(|e| StageError::io(&link, e))?;
        #[cfg(not(unix))]
        tracing::warn!(data_dir = %data_dir.display(), link = %link.display(), "Cannot link data dir on this platform");
        Ok(())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
