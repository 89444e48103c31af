//! Execution backends for per-unit raytrace jobs.
//!
//! A backend decides three things: the exec script's extension, any
//! scheduler header on top of the common csh body, and the command that
//! submits the script. Everything else in the pipeline is backend-agnostic.

use crate::config::{BackendKind, Config, ToolsSection};
use crate::errors::{ConfigError, StageError};
use crate::identifier::{FilterBand, ParsFilenames};
use crate::process::ToolInvocation;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

impl BackendKind {
    pub fn script_extension(self) -> &'static str {
        match self {
            BackendKind::Local => "csh",
            BackendKind::BatchQueue => "pbs",
        }
    }
}

/// `#PBS` header values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbsSettings {
    pub email: String,
    pub job_name: String,
    pub walltime: String,
    pub cores_per_node: u32,
}

/// Selected once at startup from `[scheduler] backend`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionBackend {
    Local,
    BatchQueue(PbsSettings),
}

/// What one exec script must run.
#[derive(Debug, Clone)]
pub struct ExecJob<'a> {
    pub observation_id: &'a str,
    pub chip_id: &'a str,
    pub exposure_tag: &'a str,
    pub filter: FilterBand,
    pub instrument: &'a str,
    pub run_e2adc: bool,
    pub pars_archive: Option<&'a str>,
    /// Pipeline binary the script calls back into
    pub program: &'a Path,
    pub config_file: Option<&'a Path>,
    /// Scheduler log for the job
    pub log_path: PathBuf,
}

impl ExecJob<'_> {
    pub fn unit_id(&self) -> String {
        format!("{}_{}", self.chip_id, self.exposure_tag)
    }

    /// The `raytrace` command line the script executes. Every interpolated
    /// value is quoted for csh.
    pub fn command_line(&self) -> String {
        let mut cmd = csh_quote(&self.program.display().to_string());
        if let Some(config) = self.config_file {
            let _ = write!(cmd, " --config {}", csh_quote(&config.display().to_string()));
        }
        let _ = write!(
            cmd,
            " raytrace {} {} {}",
            csh_quote(self.observation_id),
            csh_quote(self.chip_id),
            csh_quote(self.exposure_tag)
        );
        if !self.run_e2adc {
            cmd.push_str(" --no-e2adc");
        }
        if let Some(archive) = self.pars_archive {
            let _ = write!(cmd, " --pars-archive {}", csh_quote(archive));
        }
        cmd.push_str(" $extra_args");
        cmd
    }
}

/// Single-quotes `value` for a csh word unless it is made only of
/// characters csh passes through literally. An embedded `'` becomes `'\''`.
pub fn csh_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:=,@%".contains(c));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

impl ExecutionBackend {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        match config.backend() {
            BackendKind::Local => Ok(ExecutionBackend::Local),
            BackendKind::BatchQueue => {
                let pbs = &config.toml.pbs;
                let required = |field: &str, value: &Option<String>| {
                    value
                        .clone()
                        .filter(|v| !v.is_empty())
                        .ok_or_else(|| ConfigError::Invalid {
                            field: field.to_string(),
                            message: "required for the batch_queue backend".into(),
                        })
                };
                Ok(ExecutionBackend::BatchQueue(PbsSettings {
                    email: required("pbs.email", &pbs.email)?,
                    job_name: required("pbs.job_name", &pbs.job_name)?,
                    walltime: required("pbs.walltime", &pbs.walltime)?,
                    cores_per_node: pbs.cores_per_node,
                }))
            }
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            ExecutionBackend::Local => BackendKind::Local,
            ExecutionBackend::BatchQueue(_) => BackendKind::BatchQueue,
        }
    }

    pub fn script_extension(&self) -> &'static str {
        self.kind().script_extension()
    }

    pub fn render_script(&self, job: &ExecJob<'_>) -> String {
        let mut out = String::new();
        out.push_str("#!/bin/csh\n");
        out.push_str("### -------------------------------------------------------------\n");
        let _ = writeln!(out, "### Created on:      {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
        let _ = writeln!(out, "### Observation ID:  {}", job.observation_id);
        let _ = writeln!(out, "### Chip ID:         {}", job.chip_id);
        let _ = writeln!(out, "### Exposure ID:     {}", job.exposure_tag);
        let _ = writeln!(out, "### Filter:          {}", job.filter.letter());
        let _ = writeln!(out, "### Instrument:      {}", job.instrument);
        out.push_str("### -------------------------------------------------------------\n\n");

        if let ExecutionBackend::BatchQueue(pbs) = self {
            let _ = writeln!(out, "#PBS -N {}", pbs.job_name);
            let _ = writeln!(out, "#PBS -M {}", pbs.email);
            out.push_str("#PBS -j oe\n");
            out.push_str("#PBS -m a\n");
            let _ = writeln!(out, "#PBS -o {}", job.log_path.display());
            let _ = writeln!(out, "#PBS -l walltime={}", pbs.walltime);
            let _ = writeln!(out, "#PBS -l nodes=1:ppn={}", pbs.cores_per_node);
            out.push('\n');
        }

        out.push_str("if ($#argv == 1) then\n");
        out.push_str("   set extra_args = \"$1\"\n");
        out.push_str("else\n");
        out.push_str("   set extra_args = \"\"\n");
        out.push_str("endif\n\n");
        out.push_str(&job.command_line());
        out.push('\n');
        out
    }

    /// Writes the unit's exec script into `dir` and returns its path.
    pub fn write_script(
        &self,
        dir: &Path,
        exec_script_base: &str,
        job: &ExecJob<'_>,
    ) -> Result<PathBuf, StageError> {
        let names = ParsFilenames::new(job.observation_id);
        let path = dir.join(names.exec_script(exec_script_base, &job.unit_id(), self.script_extension()));
        std::fs::write(&path, self.render_script(job)).map_err(|e| StageError::io(&path, e))?;
        tracing::debug!(script = %path.display(), backend = %self.kind(), "Wrote exec script");
        Ok(path)
    }

    /// `csh <script>` or `qsub <script>`.
    pub fn submit_invocation(&self, tools: &ToolsSection, script: &Path) -> ToolInvocation {
        let program = match self {
            ExecutionBackend::Local => &tools.csh,
            ExecutionBackend::BatchQueue(_) => &tools.qsub,
        };
        let mut invocation = ToolInvocation::new(program).arg(script.display().to_string());
        if let Some(dir) = script.parent().filter(|d| !d.as_os_str().is_empty()) {
            invocation = invocation.current_dir(dir);
        }
        invocation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineToml;
    use tempfile::tempdir;

    fn job<'a>(program: &'a Path) -> ExecJob<'a> {
        ExecJob {
            observation_id: "85748128",
            chip_id: "R22_S11",
            exposure_tag: "E001",
            filter: FilterBand::R,
            instrument: "lsst",
            run_e2adc: false,
            pars_archive: Some("pars_85748128.tar.gz"),
            program,
            config_file: Some(Path::new("/etc/phosim.toml")),
            log_path: PathBuf::from("/stage/85748128/exec_85748128_R22_S11_E001.log"),
        }
    }

    fn pbs() -> PbsSettings {
        PbsSettings {
            email: "ops@example.org".into(),
            job_name: "phosim".into(),
            walltime: "24:00:00".into(),
            cores_per_node: 8,
        }
    }

    #[test]
    fn test_extensions() {
        assert_eq!(ExecutionBackend::Local.script_extension(), "csh");
        assert_eq!(ExecutionBackend::BatchQueue(pbs()).script_extension(), "pbs");
        assert_eq!(BackendKind::BatchQueue.script_extension(), "pbs");
    }

    #[test]
    fn test_command_line() {
        let program = PathBuf::from("/opt/bin/phosim-pipeline");
        assert_eq!(
            job(&program).command_line(),
            "/opt/bin/phosim-pipeline --config /etc/phosim.toml raytrace 85748128 R22_S11 E001 \
             --no-e2adc --pars-archive pars_85748128.tar.gz $extra_args"
        );
    }

    #[test]
    fn test_csh_quote() {
        assert_eq!(csh_quote("/opt/bin/phosim-pipeline"), "/opt/bin/phosim-pipeline");
        assert_eq!(csh_quote("my runs/phosim.toml"), "'my runs/phosim.toml'");
        assert_eq!(csh_quote("it's"), "'it'\\''s'");
        assert_eq!(csh_quote("$HOME"), "'$HOME'");
        assert_eq!(csh_quote(""), "''");
    }

    #[test]
    fn test_script_quotes_paths_with_spaces() {
        let program = PathBuf::from("/opt/phosim tools/phosim-pipeline");
        let mut job = job(&program);
        job.config_file = Some(Path::new("/home/ops/my runs/phosim.toml"));
        job.pars_archive = Some("pars 85748128.tar.gz");
        let script = ExecutionBackend::Local.render_script(&job);
        assert!(script.ends_with(
            "'/opt/phosim tools/phosim-pipeline' --config '/home/ops/my runs/phosim.toml' \
             raytrace 85748128 R22_S11 E001 --no-e2adc --pars-archive 'pars 85748128.tar.gz' $extra_args\n"
        ));
    }

    #[test]
    fn test_local_script_has_no_pbs_header() {
        let program = PathBuf::from("phosim-pipeline");
        let script = ExecutionBackend::Local.render_script(&job(&program));
        assert!(script.starts_with("#!/bin/csh\n"));
        assert!(!script.contains("#PBS"));
        assert!(script.contains("### Chip ID:         R22_S11"));
        assert!(script.ends_with("$extra_args\n"));
    }

    #[test]
    fn test_batch_script_header() {
        let program = PathBuf::from("phosim-pipeline");
        let script = ExecutionBackend::BatchQueue(pbs()).render_script(&job(&program));
        assert!(script.contains("#PBS -N phosim\n"));
        assert!(script.contains("#PBS -M ops@example.org\n"));
        assert!(script.contains("#PBS -l walltime=24:00:00\n"));
        assert!(script.contains("#PBS -l nodes=1:ppn=8\n"));
        assert!(script.contains("#PBS -o /stage/85748128/exec_85748128_R22_S11_E001.log\n"));
    }

    #[test]
    fn test_write_script_uses_shared_template() {
        let dir = tempdir().unwrap();
        let program = PathBuf::from("phosim-pipeline");
        let path = ExecutionBackend::Local
            .write_script(dir.path(), "exec", &job(&program))
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "exec_85748128_R22_S11_E001.csh");
        assert!(path.exists());
    }

    #[test]
    fn test_submit_invocation() {
        let tools = crate::config::ToolsSection::default();
        let script = Path::new("/stage/1/exec_1_R22_S11_E000.pbs");
        let inv = ExecutionBackend::BatchQueue(pbs()).submit_invocation(&tools, script);
        assert_eq!(inv.tool_name(), "qsub");
        assert_eq!(inv.args, vec!["/stage/1/exec_1_R22_S11_E000.pbs"]);
        assert_eq!(inv.cwd.as_deref(), Some(Path::new("/stage/1")));

        let inv = ExecutionBackend::Local.submit_invocation(&tools, script);
        assert_eq!(inv.tool_name(), "csh");
    }

    #[test]
    fn test_from_config() {
        let config = Config::from_toml(PipelineToml::default()).unwrap();
        assert_eq!(ExecutionBackend::from_config(&config).unwrap(), ExecutionBackend::Local);

        let toml = PipelineToml::parse(
            "[scheduler]\nbackend = \"batch_queue\"\n[pbs]\nemail = \"a@b\"\njob_name = \"j\"\nwalltime = \"1:00:00\"\ncores_per_node = 4\n",
        )
        .unwrap();
        let config = Config::from_toml(toml).unwrap();
        match ExecutionBackend::from_config(&config).unwrap() {
            ExecutionBackend::BatchQueue(pbs) => assert_eq!(pbs.cores_per_node, 4),
            other => panic!("Expected BatchQueue, got {other:?}"),
        }
    }
}
