//! Completeness checks for pipeline artifacts.
//!
//! Missing and corrupt files are findings, collected and returned; nothing
//! is deleted or repaired. Only caller mistakes (wrong manifest, malformed
//! manifest, ambiguous config records) abort a run.
//!
//! - [`PreprocVerifier`] checks a visit's staged preprocessing output
//!   against its manifest.
//! - [`exposure::RaytraceVerifier`] checks raytrace inputs, node-local
//!   outputs and saved outputs for a list of units.

pub mod exposure;
pub mod report;

pub use exposure::{ExternalFitsverify, FitsCheck, FitsChecker, RaytraceVerifier};
pub use report::{CorruptFile, EXIT_CORRUPT, EXIT_MISSING, VerificationReport};

use crate::archive;
use crate::config::{BackendKind, Config};
use crate::errors::VerifyError;
use crate::identifier::{ParsFilenames, parse_unit_id};
use crate::manifest::{FileType, Manifest, params};
use std::path::{Path, PathBuf};

/// Reported when a manifest records no config file at all.
pub const MISSING_CONFIG_DESCRIPTOR: &str = "config_file";

/// `dir/name` when that is not a regular file.
pub(crate) fn missing_in_dir(dir: &Path, name: &str) -> Option<String> {
    let path = dir.join(name);
    if path.is_file() {
        None
    } else {
        tracing::warn!(file = name, dir = %dir.display(), "Verification failure: file not in directory");
        Some(path.display().to_string())
    }
}

/// `name` when absent from `list`; otherwise the directory check, if any.
fn missing_in_list_and_dir(name: &str, list: &[&str], dir: Option<&Path>) -> Option<String> {
    if !list.contains(&name) {
        tracing::warn!(file = name, "Verification failure: file not listed");
        return Some(name.to_string());
    }
    dir.and_then(|dir| missing_in_dir(dir, name))
}

/// Checks one visit's staging directory against its manifest.
#[derive(Debug, Clone)]
pub struct PreprocVerifier {
    observation_id: String,
    output_dir: PathBuf,
}

impl PreprocVerifier {
    pub fn new(observation_id: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            observation_id: observation_id.into(),
            output_dir: output_dir.into(),
        }
    }

    /// Verifier for `<stage_path>/<obsid>`.
    pub fn for_config(config: &Config, observation_id: &str) -> Self {
        Self::new(observation_id, config.visit_stage_dir(observation_id))
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn default_manifest_path(&self) -> PathBuf {
        self.output_dir.join(crate::manifest::MANIFEST_FILE)
    }

    /// Every missing artifact, as a path or name. A missing manifest is the
    /// sole finding.
    pub fn verify_output(&self, manifest_path: &Path) -> Result<Vec<String>, VerifyError> {
        if !manifest_path.is_file() {
            tracing::warn!(manifest = %manifest_path.display(), "Manifest not found");
            return Ok(vec![manifest_path.display().to_string()]);
        }
        let manifest = Manifest::load(manifest_path)?;

        let recorded = manifest.param(params::OBSERVATION_ID)?;
        if recorded != self.observation_id {
            return Err(VerifyError::ObservationMismatch {
                expected: self.observation_id.clone(),
                found: recorded.to_string(),
            });
        }

        let exposure_ids = manifest.exposure_ids();
        tracing::debug!(manifest = %manifest_path.display(), units = exposure_ids.len(), "Verifying preprocessing output");

        let mut missing = self.verify_exec_scripts(&manifest, &exposure_ids)?;
        missing.extend(self.verify_pars_files(&manifest, &exposure_ids)?);
        missing.extend(self.verify_config_files(&manifest)?);
        tracing::info!(missing = missing.len(), "Preprocessing verification finished");
        Ok(missing)
    }

    fn verify_exec_scripts(&self, manifest: &Manifest, exposure_ids: &[&str]) -> Result<Vec<String>, VerifyError> {
        let base = manifest.param(params::EXEC_SCRIPT_BASE)?;
        // Manifests written before the backend param existed are local.
        let backend = match manifest.find_last(crate::manifest::MAJOR_PARAM, params::BACKEND) {
            Some(value) => value.parse::<BackendKind>().map_err(|_| VerifyError::InvalidParam {
                key: params::BACKEND.to_string(),
                value: value.to_string(),
            })?,
            None => BackendKind::default(),
        };
        let extension = backend.script_extension();
        let names = ParsFilenames::new(&self.observation_id);
        let listed = manifest.files(FileType::Exec);

        Ok(exposure_ids
            .iter()
            .filter_map(|id| {
                let script = names.exec_script(base, id, extension);
                missing_in_list_and_dir(&script, &listed, Some(&self.output_dir))
            })
            .collect())
    }

    fn verify_pars_files(&self, manifest: &Manifest, exposure_ids: &[&str]) -> Result<Vec<String>, VerifyError> {
        let archive_name = manifest.param(params::PARS_ARCHIVE_NAME)?;
        let archive_path = self.output_dir.join(archive_name);
        if !manifest.files(FileType::Archive).contains(&archive_name) || !archive_path.is_file() {
            return Ok(vec![archive_name.to_string()]);
        }
        let listing = archive::list(&archive_path)?;

        let units = exposure_ids
            .iter()
            .map(|id| parse_unit_id(id))
            .collect::<Result<Vec<_>, _>>()?;
        let expected = ParsFilenames::new(&self.observation_id).pars_archive_members(
            &units,
            manifest.flag(params::RUN_E2ADC),
            manifest.flag(params::SKIP_ATMOSCREENS),
        );
        Ok(expected
            .into_iter()
            .filter(|name| !listing.contains(name))
            .inspect(|name| tracing::warn!(file = %name, "Verification failure: file not in pars archive"))
            .collect())
    }

    fn verify_config_files(&self, manifest: &Manifest) -> Result<Vec<String>, VerifyError> {
        let configs = manifest.files(FileType::Config);
        match configs.as_slice() {
            [] => Ok(vec![MISSING_CONFIG_DESCRIPTOR.to_string()]),
            [config] => Ok(missing_in_dir(&self.output_dir, config).into_iter().collect()),
            many => Err(VerifyError::DuplicateConfig(many.len())),
        }
    }
}
