//! Append-only ledger of what preprocessing produced for a visit.
//!
//! Each line is `major minor value`. Records are never rewritten; a changed
//! parameter is modelled by appending a new record and reading the last one.
//!
//! ```text
//! param observation_id 85748128
//! set exposure_id R22_S11_E000
//! file exec exec_85748128_R22_S11_E000.csh
//! ```

mod record;

pub use record::{
    EXPOSURE_ID, FileType, MAJOR_FILE, MAJOR_PARAM, MAJOR_SET, ManifestRecord, format_flag,
    params, parse_flag,
};

use crate::errors::ManifestError;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// File name of a visit's manifest inside its stage directory.
pub const MANIFEST_FILE: &str = "manifest.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Create or truncate
    Write,
    /// Create or extend
    Append,
}

impl OpenMode {
    fn name(self) -> &'static str {
        match self {
            OpenMode::Read => "read",
            OpenMode::Write => "write",
            OpenMode::Append => "append",
        }
    }
}

/// An open manifest file. The handle is released when the store is dropped,
/// including on early return through `?`.
#[derive(Debug)]
pub struct ManifestStore {
    path: PathBuf,
    mode: OpenMode,
    file: File,
}

impl ManifestStore {
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self, ManifestError> {
        let path = path.as_ref().to_path_buf();
        let mut options = OpenOptions::new();
        match mode {
            OpenMode::Read => options.read(true),
            OpenMode::Write => options.write(true).create(true).truncate(true),
            OpenMode::Append => options.append(true).create(true),
        };
        let file = options.open(&path).map_err(|source| ManifestError::Io {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(path = %path.display(), mode = mode.name(), "Opened manifest");
        Ok(Self { path, mode, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one line per record and flushes before returning.
    pub fn write(&mut self, records: &[ManifestRecord]) -> Result<(), ManifestError> {
        if self.mode == OpenMode::Read {
            return Err(ManifestError::WrongMode {
                wanted: "write or append",
                actual: self.mode.name(),
            });
        }
        let io_err = |source| ManifestError::Io {
            path: self.path.clone(),
            source,
        };
        let mut writer = BufWriter::new(&self.file);
        for record in records {
            writeln!(writer, "{}", record.to_line()).map_err(io_err)?;
        }
        writer.flush().map_err(io_err)?;
        Ok(())
    }

    /// Whole file, in write order.
    pub fn read(&mut self) -> Result<Manifest, ManifestError> {
        if self.mode != OpenMode::Read {
            return Err(ManifestError::WrongMode {
                wanted: "read",
                actual: self.mode.name(),
            });
        }
        let mut content = String::new();
        self.file
            .read_to_string(&mut content)
            .map_err(|source| ManifestError::Io {
                path: self.path.clone(),
                source,
            })?;
        Manifest::parse(&content)
    }
}

/// In-memory manifest with tag queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    records: Vec<ManifestRecord>,
}

impl Manifest {
    /// Open, read and release in one call.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        ManifestStore::open(path, OpenMode::Read)?.read()
    }

    /// Any malformed line fails the whole parse.
    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        let mut records = Vec::new();
        for (i, line) in content.lines().enumerate() {
            if let Some(record) = ManifestRecord::parse_line(i + 1, line)? {
                records.push(record);
            }
        }
        Ok(Self { records })
    }

    pub fn from_records(records: Vec<ManifestRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[ManifestRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Every value tagged `(major, minor)`, in write order.
    pub fn all_by_tags(&self, major: &str, minor: &str) -> Vec<&str> {
        self.records
            .iter()
            .filter(|r| r.major == major && r.minor == minor)
            .map(|r| r.value.as_str())
            .collect()
    }

    /// Every record with the given major tag, in write order.
    pub fn by_major(&self, major: &str) -> Vec<&ManifestRecord> {
        self.records.iter().filter(|r| r.major == major).collect()
    }

    /// Most recently written value tagged `(major, minor)`.
    pub fn last_by_tags(&self, major: &str, minor: &str) -> Result<&str, ManifestError> {
        self.find_last(major, minor)
            .ok_or_else(|| ManifestError::TagNotFound {
                major: major.to_string(),
                minor: minor.to_string(),
            })
    }

    pub fn find_last(&self, major: &str, minor: &str) -> Option<&str> {
        self.records
            .iter()
            .rfind(|r| r.major == major && r.minor == minor)
            .map(|r| r.value.as_str())
    }

    /// Last `param` value for `key`.
    pub fn param(&self, key: &str) -> Result<&str, ManifestError> {
        self.last_by_tags(MAJOR_PARAM, key)
    }

    /// Boolean `param`; absent counts as false.
    pub fn flag(&self, key: &str) -> bool {
        self.find_last(MAJOR_PARAM, key).is_some_and(parse_flag)
    }

    /// Units preprocessing actually emitted.
    pub fn exposure_ids(&self) -> Vec<&str> {
        self.all_by_tags(MAJOR_SET, EXPOSURE_ID)
    }

    pub fn files(&self, kind: FileType) -> Vec<&str> {
        self.all_by_tags(MAJOR_FILE, kind.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn rec(major: &str, minor: &str, value: &str) -> ManifestRecord {
        ManifestRecord::new(major, minor, value).unwrap()
    }

    fn write_manifest(path: &Path, records: &[ManifestRecord]) {
        let mut store = ManifestStore::open(path, OpenMode::Write).unwrap();
        store.write(records).unwrap();
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE);
        let records = vec![
            rec("file", "exec", "a.csh"),
            rec("param", "observation_id", "12345"),
        ];
        write_manifest(&path, &records);

        let manifest = Manifest::load(&path).unwrap();
        assert_eq!(manifest.records(), records.as_slice());
        assert_eq!(manifest.last_by_tags("param", "observation_id").unwrap(), "12345");
        assert_eq!(manifest.all_by_tags("file", "exec"), vec!["a.csh"]);
    }

    #[test]
    fn test_last_write_wins() {
        let manifest = Manifest::from_records(vec![rec("param", "x", "1"), rec("param", "x", "2")]);
        assert_eq!(manifest.last_by_tags("param", "x").unwrap(), "2");
        let values: Vec<&str> = manifest
            .by_major("param")
            .iter()
            .map(|r| r.value.as_str())
            .collect();
        assert_eq!(values, vec!["1", "2"]);
    }

    #[test]
    fn test_last_by_tags_not_found() {
        let manifest = Manifest::default();
        match manifest.last_by_tags("param", "observation_id") {
            Err(ManifestError::TagNotFound { major, minor }) => {
                assert_eq!(major, "param");
                assert_eq!(minor, "observation_id");
            }
            other => panic!("Expected TagNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_append_mode_extends_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE);
        write_manifest(&path, &[rec("param", "x", "1")]);
        {
            let mut store = ManifestStore::open(&path, OpenMode::Append).unwrap();
            store.write(&[rec("param", "x", "2")]).unwrap();
            store.write(&[rec("set", "exposure_id", "R22_S11_E000")]).unwrap();
        }
        let manifest = Manifest::load(&path).unwrap();
        assert_eq!(manifest.len(), 3);
        assert_eq!(manifest.param("x").unwrap(), "2");
        assert_eq!(manifest.exposure_ids(), vec!["R22_S11_E000"]);
    }

    #[test]
    fn test_write_mode_truncates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE);
        write_manifest(&path, &[rec("param", "x", "1"), rec("param", "y", "2")]);
        write_manifest(&path, &[rec("param", "z", "3")]);
        assert_eq!(Manifest::load(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_wrong_mode_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE);
        let mut store = ManifestStore::open(&path, OpenMode::Append).unwrap();
        assert!(matches!(store.read(), Err(ManifestError::WrongMode { .. })));
        drop(store);

        let mut store = ManifestStore::open(&path, OpenMode::Read).unwrap();
        assert!(matches!(
            store.write(&[rec("param", "x", "1")]),
            Err(ManifestError::WrongMode { wanted: "write or append", actual: "read" })
        ));
    }

    #[test]
    fn test_open_missing_file_for_read_is_io_error() {
        let dir = tempdir().unwrap();
        let err = Manifest::load(dir.path().join("absent.txt")).unwrap_err();
        assert!(matches!(err, ManifestError::Io { .. }));
    }

    #[test]
    fn test_malformed_line_aborts_parse() {
        let err = Manifest::parse("param observation_id 1\nparam broken\n").unwrap_err();
        match err {
            ManifestError::MalformedLine { line, content } => {
                assert_eq!(line, 2);
                assert_eq!(content, "param broken");
            }
            other => panic!("Expected MalformedLine, got {other:?}"),
        }
    }

    #[test]
    fn test_typed_helpers() {
        let manifest = Manifest::parse(
            "param run_e2adc True\nparam skip_atmoscreens False\nfile exec a.csh\nfile config imsim.cfg\n",
        )
        .unwrap();
        assert!(manifest.flag(params::RUN_E2ADC));
        assert!(!manifest.flag(params::SKIP_ATMOSCREENS));
        assert!(!manifest.flag("absent"));
        assert_eq!(manifest.files(FileType::Config), vec!["imsim.cfg"]);
        assert_eq!(manifest.files(FileType::Exec), vec!["a.csh"]);
    }
}
