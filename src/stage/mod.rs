//! Stage runner: drives the native simulation tools.
//!
//! | Stage        | Runs on        | Module         |
//! |--------------|----------------|----------------|
//! | preprocess   | one node/visit | [`preprocess`] |
//! | raytrace     | one node/unit  | [`raytrace`]   |
//!
//! Tools are opaque binaries under `[tools] bin_dir`. Each reads a pars file
//! on stdin and writes into its working directory; the stages check that
//! the expected files appeared before moving on.

pub mod atmosphere;
pub mod pars;
pub mod preprocess;
pub mod raytrace;

pub use atmosphere::ScreenSettings;
pub use preprocess::{PreprocessOptions, PreprocessStage, PreprocessSummary};
pub use raytrace::{RaytraceOptions, RaytraceStage, RaytraceSummary};

use crate::config::Config;
use crate::errors::StageError;
use crate::process::{ToolExecutor, ToolInvocation, ToolOutput};
use std::path::{Path, PathBuf};

/// Native tool binary names.
pub mod tools {
    pub const CREATE_ATMOSPHERE: &str = "create_atmosphere";
    pub const TURB2D: &str = "turb2d";
    pub const CLOUD: &str = "cloud";
    pub const AIRGLOW: &str = "airglow";
    pub const OPTICS_PARAMETERS: &str = "optics_parameters";
    pub const TRACKING: &str = "tracking";
    pub const TRIM: &str = "trim";
    pub const RAYTRACE: &str = "raytrace";
    pub const ADD_BACKGROUND: &str = "add_background";
    pub const CREATE_RAYS: &str = "create_rays";
    pub const E2ADC: &str = "e2adc";
}

/// Runs `tool` in `cwd` with the `pars` file on stdin.
pub(crate) async fn run_with_pars(
    executor: &dyn ToolExecutor,
    config: &Config,
    tool: &str,
    cwd: &Path,
    pars: &Path,
) -> Result<ToolOutput, StageError> {
    let invocation = ToolInvocation::new(config.tool_path(tool))
        .current_dir(cwd)
        .stdin_file(pars);
    executor.run_checked(&invocation).await
}

pub(crate) fn write_file(path: &Path, contents: &str) -> Result<(), StageError> {
    std::fs::write(path, contents).map_err(|e| StageError::io(path, e))
}

pub(crate) fn read_file(path: &Path) -> Result<String, StageError> {
    std::fs::read_to_string(path).map_err(|e| StageError::io(path, e))
}

/// Errors with [`StageError::MissingOutput`] unless a tool left `path` behind.
pub(crate) fn require_output(path: &Path) -> Result<(), StageError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(StageError::MissingOutput(path.to_path_buf()))
    }
}

/// Copies `source` into `dest_dir` under `name`, creating the directory.
pub(crate) fn copy_into(source: &Path, dest_dir: &Path, name: &str) -> Result<PathBuf, StageError> {
    std::fs::create_dir_all(dest_dir).map_err(|e| StageError::io(dest_dir, e))?;
    let dest = dest_dir.join(name);
    std::fs::copy(source, &dest).map_err(|e| StageError::io(source, e))?;
    tracing::debug!(from = %source.display(), to = %dest.display(), "Copied");
    Ok(dest)
}

/// Removes and recreates `dir`.
pub(crate) fn reset_dir(dir: &Path) -> Result<(), StageError> {
    if dir.exists() {
        std::fs::remove_dir_all(dir).map_err(|e| StageError::io(dir, e))?;
    }
    std::fs::create_dir_all(dir).map_err(|e| StageError::io(dir, e))
}

#[cfg(test)]
pub(crate) mod testing {
    //! Stand-ins for the native tools.

    use super::pars::last_value;
    use super::tools;
    use crate::identifier::filenames::ATMOSPHERE_SCREEN_SUFFIXES;
    use crate::identifier::{AmpCoord, ChipCoord, amp_id};
    use crate::process::ToolInvocation;
    use crate::process::testing::{ScriptedExecutor, ok_output};
    use std::path::{Path, PathBuf};

    /// Atmosphere raytrace pars as `create_atmosphere` would write them.
    pub(crate) const ATMOSPHERE_RAYTRACE: &str = "\
outerscale 0 20.1
outerscale 1 22.2
outerscale 2 18.3
outerscale 3 30.4
outerscale 4 25.5
outerscale 5 21.6
outerscale 6 19.7
height 0 16.0
height 3 8.0
relh2o 1.1
cloudmean0 0.12
cloudmean1 0.03
";

    /// Object lines trim writes for chip R22_S11; every other chip gets one.
    pub(crate) const BUSY_CHIP: &str = "R22_S11";
    pub(crate) const BUSY_CHIP_OBJECTS: usize = 5;

    fn cwd(invocation: &ToolInvocation) -> PathBuf {
        invocation.cwd.clone().unwrap_or_default()
    }

    fn arg_after<'a>(invocation: &'a ToolInvocation, flag: &str) -> &'a str {
        let i = invocation.args.iter().position(|a| a == flag).unwrap();
        &invocation.args[i + 1]
    }

    fn stdin(invocation: &ToolInvocation) -> String {
        std::fs::read_to_string(invocation.stdin_file.as_ref().unwrap()).unwrap()
    }

    /// `outputfilename` of the pars on stdin.
    fn output_name(invocation: &ToolInvocation) -> String {
        last_value(&stdin(invocation), &["outputfilename"])
            .unwrap()
            .to_string()
    }

    fn write(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(name), contents).unwrap();
    }

    /// Every tool of both stages, each writing what the real one would
    /// into its working directory.
    pub(crate) fn fake_tools() -> ScriptedExecutor {
        ScriptedExecutor::new(|invocation| {
            let dir = cwd(invocation);
            match invocation.tool_name().as_str() {
                tools::CREATE_ATMOSPHERE => write(&dir, &output_name(invocation), ATMOSPHERE_RAYTRACE),
                tools::TURB2D => {
                    let base = arg_after(invocation, "-name");
                    for suffix in ATMOSPHERE_SCREEN_SUFFIXES {
                        write(&dir, &format!("{}_{}.fits", base, suffix), "SIMPLE");
                    }
                }
                tools::CLOUD | tools::AIRGLOW => {
                    let base = arg_after(invocation, "-name");
                    write(&dir, &format!("{}.fits", base), "SIMPLE");
                }
                tools::OPTICS_PARAMETERS => write(&dir, &output_name(invocation), "surface 0 1.0\n"),
                tools::TRACKING => write(&dir, &output_name(invocation), "tracking 0 0.0\n"),
                tools::TRIM => {
                    let pars = stdin(invocation);
                    for line in pars.lines().filter(|l| l.starts_with("out_file ")) {
                        let name = line.split_whitespace().nth(2).unwrap();
                        let objects = if name.contains(BUSY_CHIP) { BUSY_CHIP_OBJECTS } else { 1 };
                        let body: String = (0..objects)
                            .map(|i| format!("object {} 0 0 20 starSED/kurucz/k{}.fits.gz 0\n", i, i % 2))
                            .collect();
                        write(&dir, name, &body);
                    }
                }
                tools::RAYTRACE => write(&dir, &format!("{}.fits", output_name(invocation)), "SIMPLE"),
                tools::CREATE_RAYS => write(&dir, &output_name(invocation), "SIMPLE"),
                tools::E2ADC => {
                    let pars = stdin(invocation);
                    let value = |key: &str| last_value(&pars, &[key]).unwrap().to_string();
                    let chip: ChipCoord = value("chipid").parse().unwrap();
                    for amp in AmpCoord::standard_grid() {
                        let name = format!(
                            "{}{}{}.fits",
                            value("outputprefilename"),
                            amp_id(&chip, &amp),
                            value("outputpostfilename")
                        );
                        write(&dir, &name, "SIMPLE");
                    }
                }
                _ => {}
            }
            ok_output()
        })
    }
}
