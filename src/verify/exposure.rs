//! Per-unit raytrace verification: staged inputs, node-local outputs and
//! saved outputs.

use super::missing_in_dir;
use super::report::VerificationReport;
use crate::errors::VerifyError;
use crate::focalplane::{FocalPlaneLayout, Segmentation};
use crate::identifier::filenames::{unit_id_from_exec_script, visit_dir};
use crate::identifier::{FilterBand, ParsFilenames, parse_exposure_tag, parse_unit_id};
use crate::process::{ProcessExecutor, ToolExecutor, ToolInvocation};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Outcome of a FITS self-check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FitsCheck {
    Ok,
    /// The checker's diagnostic
    Corrupt(String),
}

#[async_trait]
pub trait FitsChecker: Send + Sync {
    async fn check(&self, path: &Path) -> Result<FitsCheck, VerifyError>;
}

/// Runs `fitsverify -q -e <path>`; a first output line starting with
/// "verification OK" means the file is sound.
pub struct ExternalFitsverify<E = ProcessExecutor> {
    program: PathBuf,
    executor: E,
}

impl ExternalFitsverify<ProcessExecutor> {
    pub fn new(program: impl Into<PathBuf>, timeout: Option<Duration>) -> Self {
        Self::with_executor(program, ProcessExecutor::new(timeout))
    }
}

impl<E: ToolExecutor> ExternalFitsverify<E> {
    pub fn with_executor(program: impl Into<PathBuf>, executor: E) -> Self {
        Self {
            program: program.into(),
            executor,
        }
    }
}

#[async_trait]
impl<E: ToolExecutor> FitsChecker for ExternalFitsverify<E> {
    async fn check(&self, path: &Path) -> Result<FitsCheck, VerifyError> {
        let invocation = ToolInvocation::new(&self.program)
            .args(["-q", "-e"])
            .arg(path.display().to_string());
        let output = self.executor.run(&invocation).await?;
        let first = output.stdout.lines().next().unwrap_or("").trim();
        if first.starts_with("verification OK") {
            Ok(FitsCheck::Ok)
        } else if first.is_empty() {
            Ok(FitsCheck::Corrupt(format!(
                "fitsverify exited with code {} and no output",
                output.exit_code
            )))
        } else {
            Ok(FitsCheck::Corrupt(first.to_string()))
        }
    }
}

/// Checks raytrace artifacts for one visit.
#[derive(Debug, Clone)]
pub struct RaytraceVerifier {
    observation_id: String,
    filter: FilterBand,
    names: ParsFilenames,
    segmentation: Segmentation,
}

impl RaytraceVerifier {
    pub fn new(observation_id: impl Into<String>, filter: FilterBand, segmentation: Segmentation) -> Self {
        let observation_id = observation_id.into();
        Self {
            names: ParsFilenames::new(&observation_id),
            observation_id,
            filter,
            segmentation,
        }
    }

    /// `<root>/<obsid>-f<letter>`
    pub fn visit_dir(&self, root: &Path) -> PathBuf {
        root.join(visit_dir(&self.observation_id, self.filter))
    }

    /// `<root>/<obsid>-f<letter>/run<obsid>`
    pub fn param_dir(&self, root: &Path) -> PathBuf {
        self.visit_dir(root).join(format!("run{}", self.observation_id))
    }

    /// Unit ids with an exec script in `param_dir`, sorted. A non-empty
    /// `restrict` keeps only those ids.
    pub fn ids_from_exec_scripts(
        &self,
        param_dir: &Path,
        exec_script_base: &str,
        restrict: &[String],
    ) -> Result<Vec<String>, VerifyError> {
        let entries = std::fs::read_dir(param_dir).map_err(|source| VerifyError::Io {
            path: param_dir.to_path_buf(),
            source,
        })?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| VerifyError::Io {
                path: param_dir.to_path_buf(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(id) = unit_id_from_exec_script(&name, exec_script_base, &self.observation_id) else {
                continue;
            };
            if restrict.is_empty() || restrict.contains(&id) {
                ids.push(id);
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Staged inputs: the pars archive, visit pars, and every per-unit file
    /// for each unit that has an exec script.
    pub fn verify_input(
        &self,
        root: &Path,
        ids: &[String],
        exec_script_base: &str,
    ) -> Result<VerificationReport, VerifyError> {
        let stage_dir = self.visit_dir(root);
        let param_dir = self.param_dir(root);
        let mut report = VerificationReport::new();
        report.missing.extend(missing_in_dir(&stage_dir, &self.names.pars_archive()));
        for name in self.names.visit_files() {
            report.missing.extend(missing_in_dir(&param_dir, &name));
        }
        if !param_dir.is_dir() {
            return Ok(report);
        }

        for id in self.ids_from_exec_scripts(&param_dir, exec_script_base, ids)? {
            tracing::debug!(id = %id, "Checking raytrace inputs");
            let (chip, exposure_index) = parse_unit_id(&id)?;
            for name in self.names.unit_files(&chip, exposure_index, true) {
                report.missing.extend(missing_in_dir(&param_dir, &name));
            }
        }
        Ok(report)
    }

    /// Node-local outputs of exactly one unit: existence, then the FITS
    /// self-check for each file that exists.
    pub async fn verify_exec(
        &self,
        output_dir: &Path,
        ids: &[String],
        checker: &dyn FitsChecker,
    ) -> Result<VerificationReport, VerifyError> {
        let [id] = ids else {
            return Err(VerifyError::ExecIdCount(ids.len()));
        };
        let (chip, exposure_index) = parse_unit_id(id)?;
        let tag = crate::identifier::exposure_tag(exposure_index);

        let mut names = vec![self.names.eimage(&chip.chip_id(), &tag)];
        names.extend(
            self.names
                .raw_images(&chip, &self.segmentation.amps(&chip), exposure_index),
        );

        let mut report = VerificationReport::new();
        for name in names {
            if let Some(missing) = missing_in_dir(output_dir, &name) {
                report.add_missing(missing);
                continue;
            }
            let path = output_dir.join(&name);
            if let FitsCheck::Corrupt(diagnostic) = checker.check(&path).await? {
                tracing::error!(file = %path.display(), %diagnostic, "FITS verification failed");
                report.add_corrupt(path.display().to_string(), diagnostic);
            }
        }
        Ok(report)
    }

    /// Saved outputs under `save_path` for each unit.
    pub fn verify_output(&self, save_path: &Path, ids: &[String]) -> Result<VerificationReport, VerifyError> {
        let mut report = VerificationReport::new();
        for id in ids {
            let (chip, exposure_index) = parse_unit_id(id)?;
            let tag = crate::identifier::exposure_tag(exposure_index);
            let eimage_dir = save_path.join(self.names.eimage_output_dir(self.filter, &chip, exposure_index));
            report
                .missing
                .extend(missing_in_dir(&eimage_dir, &self.names.eimage(&chip.chip_id(), &tag)));

            let raw_dir = save_path.join(self.names.raw_output_dir(self.filter, &chip, exposure_index));
            for name in self
                .names
                .raw_images(&chip, &self.segmentation.amps(&chip), exposure_index)
            {
                report.missing.extend(missing_in_dir(&raw_dir, &name));
            }
        }
        Ok(report)
    }
}

/// Every layout chip crossed with `explist` (e.g. `E000,E001`).
pub fn output_ids(layout: &FocalPlaneLayout, explist: &[String]) -> Result<Vec<String>, VerifyError> {
    for tag in explist {
        parse_exposure_tag(tag)?;
    }
    Ok(layout
        .chips()
        .flat_map(|chip| explist.iter().map(move |tag| format!("{}_{}", chip.chip_id(), tag)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::{AmpCoord, ChipCoord};
    use std::sync::Mutex;
    use tempfile::tempdir;

    const OBS: &str = "12345";

    fn verifier() -> RaytraceVerifier {
        RaytraceVerifier::new(OBS, FilterBand::R, Segmentation::standard())
    }

    fn touch(dir: &Path, name: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(name), "SIMPLE  =                    T").unwrap();
    }

    /// Flags any file whose name contains `bad`.
    struct NameChecker {
        bad: &'static str,
        seen: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl FitsChecker for NameChecker {
        async fn check(&self, path: &Path) -> Result<FitsCheck, VerifyError> {
            self.seen.lock().unwrap().push(path.to_path_buf());
            if path.to_string_lossy().contains(self.bad) {
                Ok(FitsCheck::Corrupt("*** Error: checksum".into()))
            } else {
                Ok(FitsCheck::Ok)
            }
        }
    }

    fn create_test_script(dir: &Path, name: &str, content: &str) -> PathBuf {
        let script_path = dir.join(name);
        std::fs::write(&script_path, content).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script_path, perms).unwrap();
        }
        script_path
    }

    #[test]
    fn test_verify_input_complete_and_missing() {
        let root = tempdir().unwrap();
        let v = verifier();
        let names = ParsFilenames::new(OBS);
        let param_dir = v.param_dir(root.path());
        assert!(param_dir.ends_with("12345-fr/run12345"));

        touch(&v.visit_dir(root.path()), &names.pars_archive());
        for name in names.visit_files() {
            touch(&param_dir, &name);
        }
        let chip = ChipCoord::new(2, 2, 1, 1).unwrap();
        for e in 0..2 {
            touch(&param_dir, &names.exec_script("exec", &chip.unit_id(e), "csh"));
            for name in names.unit_files(&chip, e, true) {
                touch(&param_dir, &name);
            }
        }
        assert!(v.verify_input(root.path(), &[], "exec").unwrap().is_clean());

        std::fs::remove_file(param_dir.join("cosmic_12345_R22_S11_E001.pars")).unwrap();
        let report = v.verify_input(root.path(), &[], "exec").unwrap();
        assert_eq!(report.missing.len(), 1);
        assert_eq!(report.exit_code(), 2);

        // Restricting to E000 hides the E001 gap.
        let only = vec!["R22_S11_E000".to_string()];
        assert!(v.verify_input(root.path(), &only, "exec").unwrap().is_clean());
    }

    #[test]
    fn test_verify_input_without_param_dir() {
        let root = tempdir().unwrap();
        let report = verifier().verify_input(root.path(), &[], "exec").unwrap();
        // archive plus ten visit pars
        assert_eq!(report.missing.len(), 11);
    }

    #[test]
    fn test_ids_from_exec_scripts_sorted_and_filtered() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "exec_12345_R22_S11_E001.pbs");
        touch(dir.path(), "exec_12345_R01_S00_E000.csh");
        touch(dir.path(), "exec_99999_R01_S00_E000.csh");
        touch(dir.path(), "chip_12345_R01_S00_E000.pars");
        let ids = verifier().ids_from_exec_scripts(dir.path(), "exec", &[]).unwrap();
        assert_eq!(ids, vec!["R01_S00_E000", "R22_S11_E001"]);
    }

    #[tokio::test]
    async fn test_verify_exec_requires_one_id() {
        let dir = tempdir().unwrap();
        let checker = NameChecker {
            bad: "none",
            seen: Mutex::new(vec![]),
        };
        let err = verifier().verify_exec(dir.path(), &[], &checker).await.unwrap_err();
        assert!(matches!(err, VerifyError::ExecIdCount(0)));
        let two = vec!["R22_S11_E000".to_string(), "R22_S11_E001".to_string()];
        let err = verifier().verify_exec(dir.path(), &two, &checker).await.unwrap_err();
        assert!(matches!(err, VerifyError::ExecIdCount(2)));
    }

    #[tokio::test]
    async fn test_verify_exec_missing_and_corrupt() {
        let dir = tempdir().unwrap();
        let names = ParsFilenames::new(OBS);
        let chip = ChipCoord::new(2, 2, 1, 1).unwrap();
        touch(dir.path(), &names.eimage("R22_S11", "E000"));
        let amps = AmpCoord::standard_grid();
        // All amps but the last
        for name in names.raw_images(&chip, &amps[..15], 0) {
            touch(dir.path(), &name);
        }
        let checker = NameChecker {
            bad: "_C07_",
            seen: Mutex::new(vec![]),
        };
        let report = verifier()
            .verify_exec(dir.path(), &["R22_S11_E000".to_string()], &checker)
            .await
            .unwrap();
        assert_eq!(report.missing.len(), 1);
        assert!(report.missing[0].ends_with("imsim_12345_R22_S11_C17_E000.fits.gz"));
        assert_eq!(report.corrupt.len(), 1);
        assert!(report.corrupt[0].path.ends_with("imsim_12345_R22_S11_C07_E000.fits.gz"));
        assert_eq!(report.exit_code(), 6);
        // Missing files are never handed to the checker
        assert_eq!(checker.seen.lock().unwrap().len(), 16);
    }

    #[test]
    fn test_verify_output_uses_save_layout() {
        let save = tempdir().unwrap();
        let names = ParsFilenames::new(OBS);
        let chip = ChipCoord::new(2, 2, 1, 1).unwrap();
        touch(
            &save.path().join("eimage/v00012345-fr/E001/R22"),
            &names.eimage("R22_S11", "E001"),
        );
        let raw_dir = save.path().join("raw/v00012345-fr/E001/R22/S11");
        for name in names.raw_images(&chip, &AmpCoord::standard_grid(), 1) {
            touch(&raw_dir, &name);
        }
        let ids = vec!["R22_S11_E001".to_string()];
        assert!(verifier().verify_output(save.path(), &ids).unwrap().is_clean());

        let ids = vec!["R22_S11_E000".to_string()];
        assert_eq!(verifier().verify_output(save.path(), &ids).unwrap().missing.len(), 17);
    }

    #[test]
    fn test_output_ids_cross_layout_and_explist() {
        let layout = FocalPlaneLayout::science_grid();
        let explist = vec!["E000".to_string(), "E001".to_string()];
        let ids = output_ids(&layout, &explist).unwrap();
        assert_eq!(ids.len(), 378);
        assert_eq!(ids[0], "R01_S00_E000");
        assert_eq!(ids[1], "R01_S00_E001");
        assert!(output_ids(&layout, &["E005".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_external_fitsverify_parses_first_line() {
        let dir = tempdir().unwrap();
        let script = create_test_script(
            dir.path(),
            "fitsverify",
            "#!/bin/sh\ncase \"$3\" in\n  *good*) echo 'verification OK: 0 warnings, 0 errors' ;;\n  *) echo '*** Error: bad checksum'; exit 1 ;;\nesac\n",
        );
        let checker = ExternalFitsverify::new(&script, None);
        let ok = checker.check(&dir.path().join("good.fits.gz")).await.unwrap();
        assert_eq!(ok, FitsCheck::Ok);
        let bad = checker.check(&dir.path().join("bad.fits.gz")).await.unwrap();
        assert_eq!(bad, FitsCheck::Corrupt("*** Error: bad checksum".into()));
    }

    #[tokio::test]
    async fn test_external_fitsverify_missing_binary_is_fatal() {
        let checker = ExternalFitsverify::new("/nonexistent/fitsverify", None);
        let err = checker.check(Path::new("x.fits")).await.unwrap_err();
        assert!(matches!(err, VerifyError::Checker(_)));
    }
}
