//! Typed error hierarchy for the PhoSim pipeline.
//!
//! One enum per subsystem:
//! - `IdentifierError`: filter/coordinate/id parsing
//! - `ObservationError`: trimfile parsing
//! - `ManifestError`: manifest I/O and tag queries
//! - `PartitionError`: work-unit enumeration
//! - `VerifyError`: fatal verification failures (soft findings are data, not errors)
//! - `StageError`: external tool execution and stage glue
//! - `ConfigError`: configuration loading and validation

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the naming/seeding scheme.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("Invalid filter '{0}'. Valid values: 0-5 or u, g, r, i, z, y")]
    InvalidFilter(String),

    #[error("Coordinate {name}={value} out of range 0..={max}")]
    InvalidCoordinate {
        name: &'static str,
        value: u8,
        max: u8,
    },

    #[error("Malformed identifier '{0}'")]
    MalformedId(String),
}

/// Errors from reading a trimfile / extra-commands file.
#[derive(Debug, Error)]
pub enum ObservationError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Trimfile {path} is missing required key {key}")]
    MissingKey { path: PathBuf, key: &'static str },

    #[error("Observation id '{0}' is not numeric")]
    NonNumericId(String),

    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },

    #[error(transparent)]
    Identifier(#[from] IdentifierError),
}

/// Errors from the manifest store.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Manifest I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed manifest line {line}: '{content}'")]
    MalformedLine { line: usize, content: String },

    #[error("Invalid manifest tag '{0}': tags must be non-empty and contain no whitespace")]
    InvalidTag(String),

    #[error("Invalid manifest value for {major}/{minor}: values must be a single line")]
    InvalidValue { major: String, minor: String },

    #[error("Manifest opened in {actual} mode, {wanted} required")]
    WrongMode {
        wanted: &'static str,
        actual: &'static str,
    },

    #[error("No manifest record tagged {major}/{minor}")]
    TagNotFound { major: String, minor: String },
}

/// Errors from work-unit partitioning.
#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("Missing artifact required for partitioning: {0}")]
    MissingArtifact(PathBuf),

    #[error("Raft R{rx}{ry} is a corner raft and holds no sensors")]
    CornerRaft { rx: u8, ry: u8 },

    #[error("Invalid camera group pattern '{pattern}': {message}")]
    InvalidCamstr { pattern: String, message: String },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Identifier(#[from] IdentifierError),
}

/// Errors from archive creation or index reads.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Unsupported archive extension for {0}")]
    UnsupportedFormat(PathBuf),

    #[error("Archive I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Fatal verification errors. Missing or corrupt artifacts are reported as
/// findings, never through this type.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("Manifest observation_id={found} does not equal {expected}")]
    ObservationMismatch { expected: String, found: String },

    #[error("Manifest lists {0} config files, expected exactly one")]
    DuplicateConfig(usize),

    #[error("raytrace_exec verification requires exactly one id, got {0}")]
    ExecIdCount(usize),

    #[error("Manifest param {key} has unrecognised value '{value}'")]
    InvalidParam { key: String, value: String },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Identifier(#[from] IdentifierError),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error("FITS checker could not run: {0}")]
    Checker(#[from] StageError),

    #[error("Verification I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from running a pipeline stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("{tool} exited with code {code}: {stderr}")]
    ToolFailed {
        tool: String,
        code: i32,
        stderr: String,
    },

    #[error("Failed to spawn {tool}: {source}")]
    SpawnFailed {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} timed out after {secs} seconds")]
    TimedOut { tool: String, secs: u64 },

    #[error("Stage I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Expected tool output {0} was not produced")]
    MissingOutput(PathBuf),

    #[error("Required input {0} is missing")]
    MissingInput(PathBuf),

    #[error("{file} has no '{key}' line")]
    MissingParameter { file: String, key: String },

    #[error("{file} has malformed '{key}' value '{value}'")]
    MalformedParameter { file: String, key: String, value: String },

    #[error("Manifest observation_id={found} does not equal {expected}")]
    ObservationMismatch { expected: String, found: String },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Observation(#[from] ObservationError),

    #[error(transparent)]
    Identifier(#[from] IdentifierError),
}

impl StageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors from loading or validating the pipeline configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration value for {field}: {message}")]
    Invalid { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_error_invalid_filter_names_value() {
        let err = IdentifierError::InvalidFilter("q".to_string());
        assert!(err.to_string().contains("'q'"));
    }

    #[test]
    fn manifest_error_tag_not_found_carries_tags() {
        let err = ManifestError::TagNotFound {
            major: "param".into(),
            minor: "observation_id".into(),
        };
        match &err {
            ManifestError::TagNotFound { major, minor } => {
                assert_eq!(major, "param");
                assert_eq!(minor, "observation_id");
            }
            _ => panic!("Expected TagNotFound"),
        }
        assert!(err.to_string().contains("param/observation_id"));
    }

    #[test]
    fn verify_error_converts_from_manifest_error() {
        let inner = ManifestError::MalformedLine {
            line: 3,
            content: "param".into(),
        };
        let err: VerifyError = inner.into();
        assert!(matches!(
            err,
            VerifyError::Manifest(ManifestError::MalformedLine { line: 3, .. })
        ));
    }

    #[test]
    fn stage_error_tool_failed_reports_exit_code() {
        let err = StageError::ToolFailed {
            tool: "trim".into(),
            code: 3,
            stderr: "bad catalog".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("trim"));
        assert!(msg.contains('3'));
        assert!(msg.contains("bad catalog"));
    }

    #[test]
    fn stage_error_converts_from_partition_error() {
        let inner = PartitionError::CornerRaft { rx: 0, ry: 4 };
        let err: StageError = inner.into();
        assert!(matches!(
            err,
            StageError::Partition(PartitionError::CornerRaft { rx: 0, ry: 4 })
        ));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&IdentifierError::MalformedId("x".into()));
        assert_std_error(&ManifestError::InvalidTag("a b".into()));
        assert_std_error(&VerifyError::DuplicateConfig(2));
        assert_std_error(&ConfigError::Invalid {
            field: "general.stage_path".into(),
            message: "empty".into(),
        });
    }
}
