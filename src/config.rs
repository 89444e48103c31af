//! Pipeline configuration read from `phosim.toml`.
//!
//! # Configuration File Format
//!
//! ```toml
//! [general]
//! scratch_exec_path = "/scratch/phosim"
//! stage_path = "/share/phosim/staging"
//! save_path = "/share/phosim/output"
//! data_dir = "/opt/phosim/data"
//! log_dir = "/var/log/phosim"
//! instrument = "lsst"
//!
//! [scheduler]
//! backend = "batch_queue"
//! exec_script_base = "exec"
//!
//! [pbs]
//! email = "ops@example.org"
//! job_name = "phosim"
//! walltime = "24:00:00"
//! cores_per_node = 8
//!
//! [tools]
//! bin_dir = "/opt/phosim/bin"
//! timeout_secs = 7200
//!
//! [preprocess]
//! run_e2adc = true
//! skip_atmoscreens = false
//!
//! [focalplane]
//! layout_file = "/opt/phosim/data/lsst/focalplanelayout.txt"
//! segmentation_file = "/opt/phosim/data/lsst/segmentation.txt"
//! ```
//!
//! The file is located once in `main` (`--config` / `PHOSIM_CONFIG`) and the
//! resulting [`Config`] is passed by reference to every component.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default config file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "phosim.toml";

/// Where exec scripts run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// csh scripts run directly on the node
    #[default]
    Local,
    /// PBS job scripts handed to qsub
    BatchQueue,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::BatchQueue => write!(f, "batch_queue"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(BackendKind::Local),
            "batch_queue" | "pbs" => Ok(BackendKind::BatchQueue),
            _ => Err(ConfigError::Invalid {
                field: "scheduler.backend".into(),
                message: format!("'{}' is not one of: local, batch_queue", s),
            }),
        }
    }
}

/// Filesystem layout and visit-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralSection {
    /// Node-local scratch space; per-visit and per-unit dirs are created here
    #[serde(default = "default_scratch_exec_path")]
    pub scratch_exec_path: PathBuf,
    /// Shared staging area the exec nodes pull from
    #[serde(default = "default_stage_path")]
    pub stage_path: PathBuf,
    /// Final resting place of eimage/raw outputs
    #[serde(default = "default_save_path")]
    pub save_path: PathBuf,
    /// Simulation data tree (per-chip offsets etc.)
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Enables the rolling file log when set
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_instrument")]
    pub instrument: String,
}

fn default_scratch_exec_path() -> PathBuf {
    PathBuf::from("scratch")
}

fn default_stage_path() -> PathBuf {
    PathBuf::from("staging")
}

fn default_save_path() -> PathBuf {
    PathBuf::from("output")
}

fn default_instrument() -> String {
    "lsst".to_string()
}

impl Default for GeneralSection {
    fn default() -> Self {
        Self {
            scratch_exec_path: default_scratch_exec_path(),
            stage_path: default_stage_path(),
            save_path: default_save_path(),
            data_dir: None,
            log_dir: None,
            instrument: default_instrument(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    #[serde(default)]
    pub backend: BackendKind,
    /// Prefix of every exec script name
    #[serde(default = "default_exec_script_base")]
    pub exec_script_base: String,
}

fn default_exec_script_base() -> String {
    "exec".to_string()
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            exec_script_base: default_exec_script_base(),
        }
    }
}

/// PBS header values; required only for the batch_queue backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PbsSection {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub job_name: Option<String>,
    #[serde(default)]
    pub walltime: Option<String>,
    #[serde(default = "default_cores_per_node")]
    pub cores_per_node: u32,
}

fn default_cores_per_node() -> u32 {
    1
}

impl Default for PbsSection {
    fn default() -> Self {
        Self {
            email: None,
            job_name: None,
            walltime: None,
            cores_per_node: default_cores_per_node(),
        }
    }
}

/// External executables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsSection {
    /// Directory holding the native simulation binaries
    #[serde(default = "default_bin_dir")]
    pub bin_dir: PathBuf,
    /// Per-invocation timeout; unlimited when unset
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_fitsverify")]
    pub fitsverify: String,
    #[serde(default = "default_csh")]
    pub csh: String,
    #[serde(default = "default_qsub")]
    pub qsub: String,
}

fn default_bin_dir() -> PathBuf {
    PathBuf::from("bin")
}

fn default_fitsverify() -> String {
    "fitsverify".to_string()
}

fn default_csh() -> String {
    "csh".to_string()
}

fn default_qsub() -> String {
    "qsub".to_string()
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            bin_dir: default_bin_dir(),
            timeout_secs: None,
            fitsverify: default_fitsverify(),
            csh: default_csh(),
            qsub: default_qsub(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessSection {
    #[serde(default = "default_run_e2adc")]
    pub run_e2adc: bool,
    #[serde(default)]
    pub skip_atmoscreens: bool,
}

fn default_run_e2adc() -> bool {
    true
}

impl Default for PreprocessSection {
    fn default() -> Self {
        Self {
            run_e2adc: default_run_e2adc(),
            skip_atmoscreens: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FocalplaneSection {
    /// Whitespace-column layout file; first column is the chip id
    #[serde(default)]
    pub layout_file: Option<PathBuf>,
    /// Amplifier segmentation file; first column is the amp id
    #[serde(default)]
    pub segmentation_file: Option<PathBuf>,
}

/// Root of `phosim.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineToml {
    #[serde(default)]
    pub general: GeneralSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub pbs: PbsSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub preprocess: PreprocessSection,
    #[serde(default)]
    pub focalplane: FocalplaneSection,
}

impl PipelineToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from(DEFAULT_CONFIG_FILE),
            message: e.to_string(),
        })
    }

    /// Returns the default configuration if `path` doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Every problem with the configuration, in file order. Empty means valid.
    pub fn problems(&self) -> Vec<ConfigError> {
        let mut problems = Vec::new();
        let invalid = |field: &str, message: &str| ConfigError::Invalid {
            field: field.to_string(),
            message: message.to_string(),
        };

        for (field, path) in [
            ("general.scratch_exec_path", &self.general.scratch_exec_path),
            ("general.stage_path", &self.general.stage_path),
            ("general.save_path", &self.general.save_path),
        ] {
            if path.as_os_str().is_empty() {
                problems.push(invalid(field, "must not be empty"));
            }
        }

        let base = &self.scheduler.exec_script_base;
        if base.is_empty() || base.contains('/') || base.chars().any(char::is_whitespace) {
            problems.push(invalid(
                "scheduler.exec_script_base",
                "must be non-empty with no whitespace or '/'",
            ));
        }

        if self.scheduler.backend == BackendKind::BatchQueue {
            for (field, value) in [
                ("pbs.email", &self.pbs.email),
                ("pbs.job_name", &self.pbs.job_name),
                ("pbs.walltime", &self.pbs.walltime),
            ] {
                if value.as_deref().is_none_or(str::is_empty) {
                    problems.push(invalid(field, "required for the batch_queue backend"));
                }
            }
        }

        if self.pbs.cores_per_node == 0 {
            problems.push(invalid("pbs.cores_per_node", "must be at least 1"));
        }

        problems
    }

    /// Fails fast with the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.problems().into_iter().next() {
            Some(problem) => Err(problem),
            None => Ok(()),
        }
    }
}

/// Validated, immutable runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// File the settings came from, if any
    pub source: Option<PathBuf>,
    pub toml: PipelineToml,
    pub verbose: bool,
}

impl Config {
    /// Load and validate. A missing file yields the defaults.
    pub fn load(path: &Path, verbose: bool) -> Result<Self, ConfigError> {
        let toml = PipelineToml::load_or_default(path)?;
        toml.validate()?;
        Ok(Self {
            source: path.exists().then(|| path.to_path_buf()),
            toml,
            verbose,
        })
    }

    pub fn from_toml(toml: PipelineToml) -> Result<Self, ConfigError> {
        toml.validate()?;
        Ok(Self {
            source: None,
            toml,
            verbose: false,
        })
    }

    pub fn backend(&self) -> BackendKind {
        self.toml.scheduler.backend
    }

    pub fn exec_script_base(&self) -> &str {
        &self.toml.scheduler.exec_script_base
    }

    /// Absolute-or-relative path of a native tool binary.
    pub fn tool_path(&self, name: &str) -> PathBuf {
        self.toml.tools.bin_dir.join(name)
    }

    /// `<scratch>/<obsid>`
    pub fn visit_scratch_dir(&self, observation_id: &str) -> PathBuf {
        self.toml.general.scratch_exec_path.join(observation_id)
    }

    /// `<scratch>/<obsid>_<unit>`
    pub fn unit_scratch_dir(&self, observation_id: &str, unit_id: &str) -> PathBuf {
        self.toml
            .general
            .scratch_exec_path
            .join(format!("{}_{}", observation_id, unit_id))
    }

    /// `<stage>/<obsid>`
    pub fn visit_stage_dir(&self, observation_id: &str) -> PathBuf {
        self.toml.general.stage_path.join(observation_id)
    }

    pub fn manifest_path(&self, observation_id: &str) -> PathBuf {
        self.visit_stage_dir(observation_id)
            .join(crate::manifest::MANIFEST_FILE)
    }

    pub fn save_path(&self) -> &Path {
        &self.toml.general.save_path
    }

    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.toml.tools.timeout_secs.map(std::time::Duration::from_secs)
    }
}
