use crate::errors::ManifestError;
use serde::Serialize;

pub const MAJOR_FILE: &str = "file";
pub const MAJOR_PARAM: &str = "param";
pub const MAJOR_SET: &str = "set";

/// Minor tags of `param` records written by preprocessing.
pub mod params {
    pub const OBSERVATION_ID: &str = "observation_id";
    pub const FILTER_NUM: &str = "filter_num";
    pub const INSTRUMENT: &str = "instrument";
    pub const EXEC_SCRIPT_BASE: &str = "exec_script_base";
    pub const PARS_ARCHIVE_NAME: &str = "pars_archive_name";
    pub const RUN_E2ADC: &str = "run_e2adc";
    pub const SKIP_ATMOSCREENS: &str = "skip_atmoscreens";
    pub const BACKEND: &str = "backend";
}

/// Minor tag of the per-unit `set` records.
pub const EXPOSURE_ID: &str = "exposure_id";

/// Boolean as stored in a manifest value.
pub fn format_flag(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

pub fn parse_flag(value: &str) -> bool {
    value == "True"
}

/// Minor tag of a `file` record, chosen from the file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    Exec,
    Archive,
    Config,
    Pars,
    Data,
}

impl FileType {
    pub fn from_filename(name: &str) -> Self {
        const BY_SUFFIX: [(&str, FileType); 11] = [
            (".csh", FileType::Exec),
            (".pbs", FileType::Exec),
            (".tar.gz", FileType::Archive),
            (".tgz", FileType::Archive),
            (".tar", FileType::Archive),
            (".zip", FileType::Archive),
            (".ear", FileType::Archive),
            (".cfg", FileType::Config),
            (".toml", FileType::Config),
            (".pars.gz", FileType::Pars),
            (".pars", FileType::Pars),
        ];
        BY_SUFFIX
            .iter()
            .find(|(suffix, _)| name.ends_with(suffix))
            .map(|(_, kind)| *kind)
            .unwrap_or(FileType::Data)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Exec => "exec",
            FileType::Archive => "archive",
            FileType::Config => "config",
            FileType::Pars => "pars",
            FileType::Data => "data",
        }
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `(major, minor, value)` line of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestRecord {
    pub major: String,
    pub minor: String,
    pub value: String,
}

impl ManifestRecord {
    /// Tags must be single non-empty tokens; the value must fit on one line.
    pub fn new(
        major: impl Into<String>,
        minor: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, ManifestError> {
        let record = Self {
            major: major.into(),
            minor: minor.into(),
            value: value.into(),
        };
        record.validate()?;
        Ok(record)
    }

    pub fn param(key: &str, value: impl Into<String>) -> Result<Self, ManifestError> {
        Self::new(MAJOR_PARAM, key, value)
    }

    /// `file <type> <name>`, type derived from the extension.
    pub fn file(name: &str) -> Result<Self, ManifestError> {
        Self::new(MAJOR_FILE, FileType::from_filename(name).as_str(), name)
    }

    pub fn exposure(unit_id: &str) -> Result<Self, ManifestError> {
        Self::new(MAJOR_SET, EXPOSURE_ID, unit_id)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        for tag in [&self.major, &self.minor] {
            if tag.is_empty() || tag.chars().any(char::is_whitespace) {
                return Err(ManifestError::InvalidTag(tag.clone()));
            }
        }
        if self.value.contains(['\n', '\r']) {
            return Err(ManifestError::InvalidValue {
                major: self.major.clone(),
                minor: self.minor.clone(),
            });
        }
        Ok(())
    }

    /// `major minor value`, single-space separated, no newline.
    pub fn to_line(&self) -> String {
        format!("{} {} {}", self.major, self.minor, self.value)
    }

    /// Parses one line. Blank lines give `Ok(None)`. The value is everything
    /// after the single separator following the minor tag, so it may be empty
    /// or contain spaces.
    pub fn parse_line(line_no: usize, line: &str) -> Result<Option<Self>, ManifestError> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.trim().is_empty() {
            return Ok(None);
        }
        let malformed = || ManifestError::MalformedLine {
            line: line_no,
            content: line.to_string(),
        };

        let (major, rest) = split_token(line.trim_start()).ok_or_else(malformed)?;
        let (minor, rest) = split_token(rest.trim_start()).ok_or_else(malformed)?;
        // `rest` starts at the separator after minor
        let mut chars = rest.chars();
        match chars.next() {
            Some(c) if c.is_whitespace() => {}
            _ => return Err(malformed()),
        }

        Ok(Some(Self {
            major: major.to_string(),
            minor: minor.to_string(),
            value: chars.as_str().to_string(),
        }))
    }
}

/// First whitespace-delimited token and the text after it.
fn split_token(s: &str) -> Option<(&str, &str)> {
    let end = s.find(char::is_whitespace).unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    Some(s.split_at(end))
}
