//! Atmosphere and cloud screen generation.
//!
//! Screens are large FITS files. When preprocessing skips them, each
//! raytrace node regenerates them from the visit pars in its pars archive.

use super::pars::last_value;
use super::{read_file, require_output, tools};
use crate::config::Config;
use crate::errors::StageError;
use crate::identifier::filenames::{ATMOSPHERE_LAYERS, CLOUD_LAYERS};
use crate::identifier::{FilterBand, ParsFilenames};
use crate::observation::{FWHM_PER_SIGMA, ObservationContext};
use crate::process::{ToolExecutor, ToolInvocation};
use std::path::Path;
use std::str::FromStr;

/// Outer scale of the fine turbulence grid, cm.
const OUTER_X: &str = "50000.0";
/// Cloud screen resolution.
const CLOUD_PIXELS: &str = "100";

/// Inputs the screen generators need beyond the atmosphere raytrace pars.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenSettings {
    pub seed: u64,
    pub raw_seeing: f64,
    pub zenith: f64,
    pub wavelength: f64,
}

impl ScreenSettings {
    pub fn from_observation(obs: &ObservationContext) -> Self {
        Self {
            seed: obs.base_seed(),
            raw_seeing: obs.raw_seeing,
            zenith: obs.zenith(),
            wavelength: obs.wavelength(),
        }
    }

    /// Recovers the settings from a staged obs pars and atmosphere pars.
    pub fn from_pars(names: &ParsFilenames, obs_pars: &str, atmosphere_pars: &str) -> Result<Self, StageError> {
        let filter = FilterBand::from_index(pars_value(obs_pars, names.obs(), "filter")?)?;
        Ok(Self {
            seed: pars_value(atmosphere_pars, names.atmosphere(), "seed")?,
            raw_seeing: pars_value::<f64>(atmosphere_pars, names.atmosphere(), "constrainseeing")? * FWHM_PER_SIGMA,
            zenith: pars_value(obs_pars, names.obs(), "zenith")?,
            wavelength: filter.wavelength_microns(),
        })
    }

    /// Layer seeds are the base seed with the layer number appended.
    fn layer_seed(&self, layer: u8) -> String {
        format!("{}{}", self.seed, layer)
    }
}

/// Last `key` value in a pars file, parsed as `T`.
fn pars_value<T: FromStr>(content: &str, file: String, key: &str) -> Result<T, StageError> {
    let Some(raw) = last_value(content, &[key]) else {
        return Err(StageError::MissingParameter {
            file,
            key: key.to_string(),
        });
    };
    raw.parse().map_err(|_| StageError::MalformedParameter {
        file,
        key: key.to_string(),
        value: raw.to_string(),
    })
}

/// True when every screen file is already in `work_dir`.
pub fn screens_present(names: &ParsFilenames, work_dir: &Path) -> bool {
    names
        .atmosphere_artifacts()
        .iter()
        .all(|name| work_dir.join(name).is_file())
}

fn layer_value(content: &str, names: &ParsFilenames, key: &str, layer: u8) -> Result<f64, StageError> {
    let layer_key = layer.to_string();
    last_value(content, &[key, &layer_key])
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| StageError::MissingParameter {
            file: names.atmosphere_raytrace(),
            key: format!("{} {}", key, layer),
        })
}

pub fn turb2d_invocation(
    config: &Config,
    names: &ParsFilenames,
    settings: &ScreenSettings,
    layer: u8,
    outer_scale: f64,
) -> ToolInvocation {
    ToolInvocation::new(config.tool_path(tools::TURB2D))
        .arg("-seed")
        .arg(settings.layer_seed(layer))
        .arg("-see5")
        .arg(settings.raw_seeing.to_string())
        .arg("-outerx")
        .arg(OUTER_X)
        .arg("-outers")
        .arg((outer_scale * 100.0).to_string())
        .arg("-zenith")
        .arg(settings.zenith.to_string())
        .arg("-wavelength")
        .arg(settings.wavelength.to_string())
        .arg("-name")
        .arg(names.atmosphere_screen_base(layer))
}

pub fn cloud_invocation(
    config: &Config,
    names: &ParsFilenames,
    settings: &ScreenSettings,
    layer: u8,
    height: f64,
) -> ToolInvocation {
    ToolInvocation::new(config.tool_path(tools::CLOUD))
        .arg("-seed")
        .arg(settings.layer_seed(layer))
        .arg("-height")
        .arg(height.to_string())
        .arg("-name")
        .arg(names.cloud_screen_base(layer))
        .arg("-pix")
        .arg(CLOUD_PIXELS)
}

pub fn airglow_invocation(config: &Config, names: &ParsFilenames, settings: &ScreenSettings) -> ToolInvocation {
    ToolInvocation::new(config.tool_path(tools::AIRGLOW))
        .arg("-seed")
        .arg(settings.seed.to_string())
        .arg("-name")
        .arg(names.airglow_screen_base())
}

/// Runs turb2d per layer, cloud per cloud layer, then airglow, all in
/// `work_dir`, and checks every screen file was written. Layer outer scales
/// and cloud heights come from the atmosphere raytrace pars in `work_dir`.
pub async fn generate_screens(
    executor: &dyn ToolExecutor,
    config: &Config,
    names: &ParsFilenames,
    settings: &ScreenSettings,
    work_dir: &Path,
) -> Result<(), StageError> {
    let atmosphere = read_file(&work_dir.join(names.atmosphere_raytrace()))?;
    tracing::info!(observation_id = names.observation_id(), "Generating atmosphere screens");

    for layer in 0..ATMOSPHERE_LAYERS {
        let outer_scale = layer_value(&atmosphere, names, "outerscale", layer)?;
        let invocation = turb2d_invocation(config, names, settings, layer, outer_scale).current_dir(work_dir);
        executor.run_checked(&invocation).await?;
    }
    for layer in CLOUD_LAYERS {
        let height = layer_value(&atmosphere, names, "height", layer)?;
        let invocation = cloud_invocation(config, names, settings, layer, height).current_dir(work_dir);
        executor.run_checked(&invocation).await?;
    }
    executor
        .run_checked(&airglow_invocation(config, names, settings).current_dir(work_dir))
        .await?;

    for name in names.atmosphere_artifacts() {
        require_output(&work_dir.join(name))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineToml;
    use crate::stage::testing::{ATMOSPHERE_RAYTRACE, fake_tools};
    use tempfile::tempdir;

    fn config() -> Config {
        let mut toml = PipelineToml::default();
        toml.tools.bin_dir = "/opt/phosim/bin".into();
        Config::from_toml(toml).unwrap()
    }

    fn settings() -> ScreenSettings {
        ScreenSettings {
            seed: 1000,
            raw_seeing: 0.7,
            zenith: 30.0,
            wavelength: 0.62,
        }
    }

    #[test]
    fn test_turb2d_arguments() {
        let names = ParsFilenames::new("42");
        let inv = turb2d_invocation(&config(), &names, &settings(), 3, 20.5);
        assert_eq!(inv.program, Path::new("/opt/phosim/bin/turb2d"));
        assert_eq!(
            inv.args,
            vec![
                "-seed", "10003", "-see5", "0.7", "-outerx", "50000.0", "-outers", "2050", "-zenith", "30",
                "-wavelength", "0.62", "-name", "atmospherescreen_42_3",
            ]
        );
    }

    #[test]
    fn test_cloud_arguments() {
        let names = ParsFilenames::new("42");
        let inv = cloud_invocation(&config(), &names, &settings(), 0, 16.0);
        assert_eq!(
            inv.args,
            vec!["-seed", "10000", "-height", "16", "-name", "cloudscreen_42_0", "-pix", "100"]
        );
    }

    #[test]
    fn test_settings_from_pars() {
        let names = ParsFilenames::new("42");
        let obs_pars = "pointingra 1\nfilter 3\nzenith 25.5\n";
        let atmosphere_pars = format!(
            "outputfilename atmosphereraytrace_42.pars\nconstrainseeing {}\nseed 77\ncreateatmosphere\n",
            0.7 / FWHM_PER_SIGMA
        );
        let settings = ScreenSettings::from_pars(&names, obs_pars, &atmosphere_pars).unwrap();
        assert_eq!(settings.seed, 77);
        assert_eq!(settings.zenith, 25.5);
        assert_eq!(settings.wavelength, 0.76);
        assert!((settings.raw_seeing - 0.7).abs() < 1e-9);

        let err = ScreenSettings::from_pars(&names, "zenith 1\n", &atmosphere_pars).unwrap_err();
        match err {
            StageError::MissingParameter { file, key } => {
                assert_eq!(file, "obs_42.pars");
                assert_eq!(key, "filter");
            }
            other => panic!("Expected MissingParameter, got {other:?}"),
        }
    }

    #[test]
    fn test_settings_reject_non_integer_filter_and_seed() {
        let names = ParsFilenames::new("42");
        let atmosphere_pars = "constrainseeing 0.3
seed 77
";
        for filter in ["-1", "2.5", "NaN"] {
            let obs_pars = format!("filter {}
zenith 25.5
", filter);
            match ScreenSettings::from_pars(&names, &obs_pars, atmosphere_pars).unwrap_err() {
                StageError::MalformedParameter { file, key, value } => {
                    assert_eq!(file, "obs_42.pars");
                    assert_eq!(key, "filter");
                    assert_eq!(value, filter);
                }
                other => panic!("Expected MalformedParameter, got {other:?}"),
            }
        }

        let err = ScreenSettings::from_pars(&names, "filter 2
zenith 1
", "constrainseeing 0.3
seed -5
")
            .unwrap_err();
        assert!(matches!(err, StageError::MalformedParameter { ref key, .. } if key == "seed"));

        let err = ScreenSettings::from_pars(&names, "filter 9
zenith 1
", atmosphere_pars).unwrap_err();
        assert!(matches!(err, StageError::Identifier(_)));
    }

    #[tokio::test]
    async fn test_generate_screens_runs_every_layer() {
        let dir = tempdir().unwrap();
        let names = ParsFilenames::new("42");
        std::fs::write(dir.path().join(names.atmosphere_raytrace()), ATMOSPHERE_RAYTRACE).unwrap();
        assert!(!screens_present(&names, dir.path()));

        let executor = fake_tools();
        generate_screens(&executor, &config(), &names, &settings(), dir.path())
            .await
            .unwrap();

        let tools = executor.tool_names();
        assert_eq!(tools.iter().filter(|t| *t == "turb2d").count(), 7);
        assert_eq!(tools.iter().filter(|t| *t == "cloud").count(), 2);
        assert_eq!(tools.last().map(String::as_str), Some("airglow"));
        assert!(screens_present(&names, dir.path()));
    }

    #[tokio::test]
    async fn test_missing_outer_scale_is_reported() {
        let dir = tempdir().unwrap();
        let names = ParsFilenames::new("42");
        std::fs::write(dir.path().join(names.atmosphere_raytrace()), "outerscale 0 20\n").unwrap();
        let executor = fake_tools();
        let err = generate_screens(&executor, &config(), &names, &settings(), dir.path())
            .await
            .unwrap_err();
        match err {
            StageError::MissingParameter { key, .. } => assert_eq!(key, "outerscale 1"),
            other => panic!("Expected MissingParameter, got {other:?}"),
        }
        assert_eq!(executor.tool_names(), vec!["turb2d"]);
    }
}
