use serde::Serialize;
use std::io::{self, Write};

/// Exit-code bit for missing files.
pub const EXIT_MISSING: i32 = 2;
/// Exit-code bit for files that failed the FITS self-check.
pub const EXIT_CORRUPT: i32 = 4;

/// A file that exists but failed its self-check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorruptFile {
    pub path: String,
    /// First line of the checker's output
    pub diagnostic: String,
}

/// Collected findings of one verification run. Never fatal on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub missing: Vec<String>,
    pub corrupt: Vec<CorruptFile>,
}

impl VerificationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_missing(missing: Vec<String>) -> Self {
        Self {
            missing,
            corrupt: Vec::new(),
        }
    }

    pub fn add_missing(&mut self, path: impl Into<String>) {
        self.missing.push(path.into());
    }

    pub fn add_corrupt(&mut self, path: impl Into<String>, diagnostic: impl Into<String>) {
        self.corrupt.push(CorruptFile {
            path: path.into(),
            diagnostic: diagnostic.into(),
        });
    }

    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.corrupt.is_empty()
    }

    /// 0 when clean; otherwise 2 for missing and 4 for corrupt, summed.
    pub fn exit_code(&self) -> i32 {
        let mut code = 0;
        if !self.missing.is_empty() {
            code += EXIT_MISSING;
        }
        if !self.corrupt.is_empty() {
            code += EXIT_CORRUPT;
        }
        code
    }

    /// One line per finding, missing files first.
    pub fn lines(&self) -> Vec<String> {
        let missing = self.missing.iter().map(|p| format!("FileNotFound: {}", p));
        let corrupt = self
            .corrupt
            .iter()
            .map(|c| format!("FitsverifyFailure: {}: {}", c.path, c.diagnostic));
        missing.chain(corrupt).collect()
    }

    pub fn write_to<W: Write>(&self, mut out: W) -> io::Result<()> {
        for line in self.lines() {
            writeln!(out, "{}", line)?;
        }
        out.flush()
    }
}
