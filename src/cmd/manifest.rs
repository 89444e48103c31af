//! Manifest queries: `phosim-pipeline manifest`.

use anyhow::{Context, Result};
use std::path::Path;

/// Prints records filtered by major and/or minor tag, one per line. With
/// `last`, prints only the value of the last `major`/`minor` match.
pub fn cmd_manifest(path: &Path, major: Option<&str>, minor: Option<&str>, last: bool) -> Result<()> {
    use phosim_pipeline::manifest::Manifest;

    let manifest = Manifest::load(path).with_context(|| format!("Failed to read manifest {}", path.display()))?;

    if last {
        let (Some(major), Some(minor)) = (major, minor) else {
            anyhow::bail!("--last needs both --major and --minor");
        };
        println!("{}", manifest.last_by_tags(major, minor)?);
        return Ok(());
    }

    for record in manifest.records().iter().filter(|r| {
        major.is_none_or(|m| r.major == m) && minor.is_none_or(|m| r.minor == m)
    }) {
        println!("{}", record.to_line());
    }
    Ok(())
}
