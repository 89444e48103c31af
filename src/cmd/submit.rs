//! Job submission: `phosim-pipeline submit`.

use anyhow::{Context, Result};
use phosim_pipeline::config::Config;

/// Hands every exec script recorded in the visit's manifest to the
/// configured backend (`csh` or `qsub`), in manifest order.
pub async fn cmd_submit(config: &Config, observation_id: &str, dry_run: bool) -> Result<()> {
    use phosim_pipeline::backend::ExecutionBackend;
    use phosim_pipeline::manifest::{FileType, MAJOR_PARAM, Manifest, params};
    use phosim_pipeline::process::{ProcessExecutor, ToolExecutor};

    let manifest_path = config.manifest_path(observation_id);
    let manifest = Manifest::load(&manifest_path)
        .with_context(|| format!("Failed to read manifest {}", manifest_path.display()))?;
    let recorded = manifest.param(params::OBSERVATION_ID)?;
    if recorded != observation_id {
        anyhow::bail!(
            "Manifest {} is for observation {}, not {}",
            manifest_path.display(),
            recorded,
            observation_id
        );
    }

    let backend = ExecutionBackend::from_config(config)?;
    if let Some(staged) = manifest.find_last(MAJOR_PARAM, params::BACKEND)
        && staged != backend.kind().to_string()
    {
        anyhow::bail!(
            "Visit {} was staged for the {} backend but {} is configured",
            observation_id,
            staged,
            backend.kind()
        );
    }

    let stage_dir = config.visit_stage_dir(observation_id);
    let scripts = manifest.files(FileType::Exec);
    if scripts.is_empty() {
        println!("No exec scripts recorded in {}", manifest_path.display());
        return Ok(());
    }

    let executor = ProcessExecutor::new(config.timeout());
    for name in &scripts {
        let invocation = backend.submit_invocation(&config.toml.tools, &stage_dir.join(name));
        if dry_run {
            println!("{}", invocation);
            continue;
        }
        let output = executor
            .run_checked(&invocation)
            .await
            .with_context(|| format!("Failed to submit {}", name))?;
        let job = output.stdout.trim();
        if job.is_empty() {
            println!("{} {}", console::style("submitted").green(), name);
        } else {
            println!("{} {} ({})", console::style("submitted").green(), name, job);
        }
    }
    if !dry_run {
        println!();
        println!("{} script(s) submitted for observation {}", scripts.len(), observation_id);
    }
    Ok(())
}
