//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module       | Commands handled        |
//! |--------------|-------------------------|
//! | `partition`  | `Partition`             |
//! | `manifest`   | `Manifest`              |
//! | `stage`      | `Preprocess`, `Raytrace`|
//! | `submit`     | `Submit`                |
//! | `verify`     | `Verify`                |
//! | `config`     | `Config`                |

pub mod config;
pub mod manifest;
pub mod partition;
pub mod stage;
pub mod submit;
pub mod verify;

pub use config::cmd_config;
pub use manifest::cmd_manifest;
pub use partition::cmd_partition;
pub use stage::{cmd_preprocess, cmd_raytrace};
pub use submit::cmd_submit;
pub use verify::{VerifyArgs, cmd_verify};

use super::UnitArgs;
use phosim_pipeline::partition::UnitFilter;

/// `--raft/--sensor/--exposure` as a partition filter.
pub(crate) fn unit_filter(args: &UnitArgs) -> anyhow::Result<UnitFilter> {
    Ok(UnitFilter::from_args(
        args.raft.as_deref(),
        args.sensor.as_deref(),
        args.exposure,
    )?)
}
