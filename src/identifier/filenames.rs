//! Filename and path templates for every artifact the pipeline produces.
//!
//! External native tools find their inputs by these exact names, and the
//! verifier recomputes them to check completeness. Both sides must call into
//! this module; nothing else in the crate formats an artifact name.

use super::{AmpCoord, ChipCoord, FilterBand, amp_id, exposure_tag};
use std::collections::HashSet;
use std::path::PathBuf;

/// Per-unit (or per-chip) parameter file kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParsStage {
    Time,
    Chip,
    Raytrace,
    Background,
    Cosmic,
    E2adc,
    Sedlist,
    Trimcatalog,
}

impl ParsStage {
    pub const ALL: [ParsStage; 8] = [
        ParsStage::Time,
        ParsStage::Chip,
        ParsStage::Raytrace,
        ParsStage::Background,
        ParsStage::Cosmic,
        ParsStage::E2adc,
        ParsStage::Sedlist,
        ParsStage::Trimcatalog,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ParsStage::Time => "time",
            ParsStage::Chip => "chip",
            ParsStage::Raytrace => "raytrace",
            ParsStage::Background => "background",
            ParsStage::Cosmic => "cosmic",
            ParsStage::E2adc => "e2adc",
            ParsStage::Sedlist => "sedlist",
            ParsStage::Trimcatalog => "trimcatalog",
        }
    }

    /// Template keyed by stage. `id` is the exposure tag for `Time`, the chip
    /// id for `Sedlist`, and the full unit id for everything else.
    pub fn filename(self, observation_id: &str, id: &str) -> String {
        match self {
            ParsStage::Time => format!("time_{}_{}.pars", observation_id, id),
            ParsStage::Chip => format!("chip_{}_{}.pars", observation_id, id),
            ParsStage::Raytrace => format!("raytracecommands_{}_{}.pars", observation_id, id),
            ParsStage::Background => format!("background_{}_{}.pars", observation_id, id),
            ParsStage::Cosmic => format!("cosmic_{}_{}.pars", observation_id, id),
            ParsStage::E2adc => format!("e2adc_{}_{}.pars", observation_id, id),
            ParsStage::Sedlist => format!("sedlist_{}_{}.txt", observation_id, id),
            ParsStage::Trimcatalog => format!("trimcatalog_{}_{}.pars.gz", observation_id, id),
        }
    }
}

/// Atmosphere screen suffixes written by the turbulence generator.
pub const ATMOSPHERE_SCREEN_SUFFIXES: [&str; 10] = [
    "coarsex",
    "coarsey",
    "density_coarse",
    "density_diff",
    "density_fine",
    "density_medium",
    "finex",
    "finey",
    "mediumx",
    "mediumy",
];

/// Number of turbulence layers.
pub const ATMOSPHERE_LAYERS: u8 = 7;

/// Layers that carry a cloud screen.
pub const CLOUD_LAYERS: [u8; 2] = [0, 3];

/// All artifact names for one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsFilenames {
    observation_id: String,
}

impl ParsFilenames {
    pub fn new(observation_id: impl Into<String>) -> Self {
        Self {
            observation_id: observation_id.into(),
        }
    }

    pub fn observation_id(&self) -> &str {
        &self.observation_id
    }

    fn stage(&self, stage: ParsStage, id: &str) -> String {
        stage.filename(&self.observation_id, id)
    }

    pub fn time(&self, exposure_tag: &str) -> String {
        self.stage(ParsStage::Time, exposure_tag)
    }

    pub fn chip(&self, unit_id: &str) -> String {
        self.stage(ParsStage::Chip, unit_id)
    }

    pub fn raytrace(&self, unit_id: &str) -> String {
        self.stage(ParsStage::Raytrace, unit_id)
    }

    pub fn background(&self, unit_id: &str) -> String {
        self.stage(ParsStage::Background, unit_id)
    }

    pub fn cosmic(&self, unit_id: &str) -> String {
        self.stage(ParsStage::Cosmic, unit_id)
    }

    pub fn e2adc(&self, unit_id: &str) -> String {
        self.stage(ParsStage::E2adc, unit_id)
    }

    pub fn sedlist(&self, chip_id: &str) -> String {
        self.stage(ParsStage::Sedlist, chip_id)
    }

    pub fn trimcatalog(&self, unit_id: &str) -> String {
        self.stage(ParsStage::Trimcatalog, unit_id)
    }

    /// Every per-unit file in the order the verifier checks them. `e2adc` is
    /// included only when that stage is enabled.
    pub fn unit_files(&self, chip: &ChipCoord, exposure_index: u8, e2adc: bool) -> Vec<String> {
        let unit = chip.unit_id(exposure_index);
        let mut names = vec![
            self.time(&exposure_tag(exposure_index)),
            self.chip(&unit),
            self.raytrace(&unit),
            self.background(&unit),
            self.cosmic(&unit),
        ];
        if e2adc {
            names.push(self.e2adc(&unit));
        }
        names.push(self.sedlist(&chip.chip_id()));
        names.push(self.trimcatalog(&unit));
        names
    }

    // Visit-level parameter files.

    pub fn objectcatalog(&self) -> String {
        format!("objectcatalog_{}.pars", self.observation_id)
    }

    pub fn obs(&self) -> String {
        format!("obs_{}.pars", self.observation_id)
    }

    pub fn atmosphere(&self) -> String {
        format!("atmosphere_{}.pars", self.observation_id)
    }

    pub fn atmosphere_raytrace(&self) -> String {
        format!("atmosphereraytrace_{}.pars", self.observation_id)
    }

    pub fn cloud_raytrace(&self) -> String {
        format!("cloudraytrace_{}.pars", self.observation_id)
    }

    pub fn control(&self) -> String {
        format!("control_{}.pars", self.observation_id)
    }

    pub fn optics(&self) -> String {
        format!("optics_{}.pars", self.observation_id)
    }

    pub fn catlist(&self) -> String {
        format!("catlist_{}.pars", self.observation_id)
    }

    pub fn tracking(&self) -> String {
        format!("tracking_{}.pars", self.observation_id)
    }

    pub fn track(&self) -> String {
        format!("track_{}.pars", self.observation_id)
    }

    /// Visit pars the raytrace stage reads regardless of atmosphere settings.
    pub fn visit_files(&self) -> Vec<String> {
        vec![
            self.objectcatalog(),
            self.obs(),
            self.atmosphere(),
            self.atmosphere_raytrace(),
            self.cloud_raytrace(),
            self.control(),
            self.optics(),
            self.catlist(),
            self.tracking(),
            self.track(),
        ]
    }

    /// Per-raft input to the trim tool.
    pub fn trim_pars(&self, raft_id: &str) -> String {
        format!("trim_{}_{}.pars", self.observation_id, raft_id)
    }

    /// Per-chip trim tool output; the line count drives partitioning.
    pub fn trim_output(&self, chip_id: &str) -> String {
        format!("trimcatalog_{}_{}.pars", self.observation_id, chip_id)
    }

    // Atmosphere-stage artifacts.

    /// Base name handed to the airglow generator via `-name`.
    pub fn airglow_screen_base(&self) -> String {
        format!("airglowscreen_{}", self.observation_id)
    }

    pub fn airglow_screen(&self) -> String {
        format!("{}.fits", self.airglow_screen_base())
    }

    /// Base name handed to the cloud generator via `-name`.
    pub fn cloud_screen_base(&self, layer: u8) -> String {
        format!("cloudscreen_{}_{}", self.observation_id, layer)
    }

    pub fn cloud_screen(&self, layer: u8) -> String {
        format!("{}.fits", self.cloud_screen_base(layer))
    }

    /// Base name handed to the turbulence generator via `-name`.
    pub fn atmosphere_screen_base(&self, layer: u8) -> String {
        format!("atmospherescreen_{}_{}", self.observation_id, layer)
    }

    pub fn atmosphere_screen(&self, layer: u8, suffix: &str) -> String {
        format!("{}_{}.fits", self.atmosphere_screen_base(layer), suffix)
    }

    /// Every file the atmosphere step must leave behind.
    pub fn atmosphere_artifacts(&self) -> Vec<String> {
        let mut names = vec![self.airglow_screen()];
        names.extend(CLOUD_LAYERS.iter().map(|&l| self.cloud_screen(l)));
        for layer in 0..ATMOSPHERE_LAYERS {
            names.extend(
                ATMOSPHERE_SCREEN_SUFFIXES
                    .iter()
                    .map(|s| self.atmosphere_screen(layer, s)),
            );
        }
        names
    }

    /// Contents of the pars archive for the given units: visit pars, then
    /// atmosphere artifacts unless skipped, then per-unit files. Names shared
    /// between units (time pars, sedlists) appear once.
    pub fn pars_archive_members(
        &self,
        units: &[(ChipCoord, u8)],
        run_e2adc: bool,
        skip_atmoscreens: bool,
    ) -> Vec<String> {
        let mut names = self.visit_files();
        if !skip_atmoscreens {
            names.extend(self.atmosphere_artifacts());
        }
        let mut seen: HashSet<String> = names.iter().cloned().collect();
        for (chip, exposure_index) in units {
            for name in self.unit_files(chip, *exposure_index, run_e2adc) {
                if seen.insert(name.clone()) {
                    names.push(name);
                }
            }
        }
        names
    }

    // Intermediate images, named inside the pars files.

    /// `outputfilename` of the raytrace step.
    pub fn image_base(&self, unit_id: &str) -> String {
        format!("imsim_{}_{}", self.observation_id, unit_id)
    }

    /// Background-adder output, input of the cosmic-ray step.
    pub fn background_image(&self, unit_id: &str) -> String {
        format!("{}.fits", self.image_base(unit_id))
    }

    pub fn cosmic_image(&self, unit_id: &str) -> String {
        format!("output_{}_{}.fits", self.observation_id, unit_id)
    }

    /// Raytrace commands followed by the unit's trim catalog; assembled on
    /// the exec node, never archived.
    pub fn raytrace_input(&self, unit_id: &str) -> String {
        format!("raytrace_{}_{}.pars", self.observation_id, unit_id)
    }

    // Archives, scripts, outputs.

    pub fn pars_archive(&self) -> String {
        format!("pars_{}.tar.gz", self.observation_id)
    }

    pub fn exec_script(&self, base: &str, unit_id: &str, extension: &str) -> String {
        format!("{}_{}_{}.{}", base, self.observation_id, unit_id, extension)
    }

    pub fn eimage(&self, chip_id: &str, exposure_tag: &str) -> String {
        format!("eimage_{}_{}_{}.fits.gz", self.observation_id, chip_id, exposure_tag)
    }

    pub fn raw(&self, amp_id: &str, exposure_tag: &str) -> String {
        format!("imsim_{}_{}_{}.fits.gz", self.observation_id, amp_id, exposure_tag)
    }

    /// Raw image names for every amplifier of one unit.
    pub fn raw_images(&self, chip: &ChipCoord, amps: &[AmpCoord], exposure_index: u8) -> Vec<String> {
        let tag = exposure_tag(exposure_index);
        amps.iter()
            .map(|amp| self.raw(&amp_id(chip, amp), &tag))
            .collect()
    }

    /// `eimage/v%08d-f<letter>/<expId>/<raftId>` under the save path.
    pub fn eimage_output_dir(&self, filter: FilterBand, chip: &ChipCoord, exposure_index: u8) -> PathBuf {
        PathBuf::from("eimage")
            .join(self.visit_dir_name(filter))
            .join(exposure_tag(exposure_index))
            .join(chip.raft_id())
    }

    /// `raw/v%08d-f<letter>/<expId>/<raftId>/<sensorId>` under the save path.
    pub fn raw_output_dir(&self, filter: FilterBand, chip: &ChipCoord, exposure_index: u8) -> PathBuf {
        PathBuf::from("raw")
            .join(self.visit_dir_name(filter))
            .join(exposure_tag(exposure_index))
            .join(chip.raft_id())
            .join(chip.sensor_id())
    }

    fn visit_dir_name(&self, filter: FilterBand) -> String {
        // Observation ids are digit strings by construction; zero-pad as text
        // so ids wider than u64 still format.
        format!("v{:0>8}-f{}", self.observation_id, filter.letter())
    }
}

/// `<obsid>-f<letter>`, the per-visit directory name on staging storage.
pub fn visit_dir(observation_id: &str, filter: FilterBand) -> String {
    format!("{}-f{}", observation_id, filter.letter())
}

/// Extracts the unit id from an exec script filename
/// `{base}_{obs}_{Rxx}_{Sxx}_{Exxx}.{ext}`. Returns `None` for anything that
/// does not match that shape.
pub fn unit_id_from_exec_script(filename: &str, base: &str, observation_id: &str) -> Option<String> {
    let stem = filename.rsplit_once('.').map(|(stem, _)| stem)?;
    let rest = stem
        .strip_prefix(base)?
        .strip_prefix('_')?
        .strip_prefix(observation_id)?
        .strip_prefix('_')?;
    super::parse_unit_id(rest).ok().map(|_| rest.to_string())
}
