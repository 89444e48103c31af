//! Artifact verification: `phosim-pipeline verify`.

use anyhow::{Context, Result};
use phosim_pipeline::config::Config;
use std::path::Path;

use super::super::VerifyStage;

pub struct VerifyArgs<'a> {
    pub stage: VerifyStage,
    pub observation_id: &'a str,
    pub filter: &'a str,
    pub path: &'a Path,
    pub idlist: &'a str,
    pub explist: &'a str,
    pub camstr: &'a str,
    pub output: Option<&'a Path>,
    pub no_stderr: bool,
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Runs one verification stage, prints its findings and returns the
/// process exit code (0 when clean).
pub async fn cmd_verify(config: &Config, args: &VerifyArgs<'_>) -> Result<i32> {
    use phosim_pipeline::focalplane::{FocalPlaneLayout, Segmentation};
    use phosim_pipeline::identifier::FilterBand;
    use phosim_pipeline::manifest::MANIFEST_FILE;
    use phosim_pipeline::verify::{
        ExternalFitsverify, PreprocVerifier, RaytraceVerifier, VerificationReport, exposure::output_ids,
    };

    let ids = split_list(args.idlist);
    let report = match args.stage {
        VerifyStage::PreprocessOutput => {
            let verifier = PreprocVerifier::new(args.observation_id, args.path.join(args.observation_id));
            let manifest = verifier.output_dir().join(MANIFEST_FILE);
            VerificationReport::from_missing(verifier.verify_output(&manifest)?)
        }
        stage => {
            let filter: FilterBand = args
                .filter
                .parse()
                .with_context(|| format!("Invalid filter '{}'", args.filter))?;
            let segmentation = Segmentation::load(config.toml.focalplane.segmentation_file.as_deref())?;
            let verifier = RaytraceVerifier::new(args.observation_id, filter, segmentation);
            match stage {
                VerifyStage::RaytraceInput => verifier.verify_input(args.path, &ids, config.exec_script_base())?,
                VerifyStage::RaytraceExec => {
                    let checker = ExternalFitsverify::new(&config.toml.tools.fitsverify, config.timeout());
                    verifier.verify_exec(args.path, &ids, &checker).await?
                }
                _ => {
                    let ids = if ids.is_empty() {
                        let layout = FocalPlaneLayout::load(config.toml.focalplane.layout_file.as_deref(), args.camstr)?;
                        output_ids(&layout, &split_list(args.explist))?
                    } else {
                        ids
                    };
                    verifier.verify_output(args.path, &ids)?
                }
            }
        }
    };

    for line in report.lines() {
        println!("{}", line);
    }
    if let Some(output) = args.output {
        let file = std::fs::File::create(output).with_context(|| format!("Failed to create {}", output.display()))?;
        report.write_to(file)?;
    }
    if !report.is_clean() && !args.no_stderr {
        eprintln!("{} verification returned errors:", console::style("WARNING").yellow().bold());
        for line in report.lines() {
            eprintln!("-- {}", line);
        }
    }
    if report.is_clean() {
        tracing::info!(stage = ?args.stage, observation_id = args.observation_id, "Verification passed");
    } else {
        tracing::warn!(
            stage = ?args.stage,
            missing = report.missing.len(),
            corrupt = report.corrupt.len(),
            "Verification failed"
        );
    }
    Ok(report.exit_code())
}
