//! Focal-plane layout: which chips exist and which amplifiers each carries.

use crate::errors::PartitionError;
use crate::identifier::{AmpCoord, ChipCoord, RAFTS_PER_AXIS, SENSORS_PER_AXIS, is_corner_raft};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;

/// One row of a focal-plane layout file.
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutEntry {
    pub chip: ChipCoord,
    pub device_type: Option<String>,
    pub device_value: Option<f64>,
}

/// Ordered list of science chips in partition order.
#[derive(Debug, Clone, PartialEq)]
pub struct FocalPlaneLayout {
    entries: Vec<LayoutEntry>,
}

impl FocalPlaneLayout {
    /// The 21 science rafts by 9 sensors, row-major.
    pub fn science_grid() -> Self {
        let mut entries = Vec::with_capacity(189);
        for rx in 0..RAFTS_PER_AXIS {
            for ry in 0..RAFTS_PER_AXIS {
                if is_corner_raft(rx, ry) {
                    continue;
                }
                for sx in 0..SENSORS_PER_AXIS {
                    for sy in 0..SENSORS_PER_AXIS {
                        entries.push(LayoutEntry {
                            chip: ChipCoord { rx, ry, sx, sy },
                            device_type: None,
                            device_value: None,
                        });
                    }
                }
            }
        }
        Self { entries }
    }

    /// Lines of a layout file whose text matches `camstr`. Column 0 is the
    /// chip id; columns 6 and 7, when present, are device type and value.
    /// Chips on corner rafts and rows whose first column is not a chip id
    /// (wavefront sensors, comments) are skipped.
    pub fn parse(content: &str, camstr: &str) -> Result<Self, PartitionError> {
        let pattern = Regex::new(camstr)
            .map_err(|e| PartitionError::InvalidCamstr {
                pattern: camstr.to_string(),
                message: e.to_string(),
            })?;
        let mut entries = Vec::new();
        for line in content.lines().filter(|l| pattern.is_match(l)) {
            let columns: Vec<&str> = line.split_whitespace().collect();
            let Some(chip) = columns.first().and_then(|c| c.parse::<ChipCoord>().ok()) else {
                continue;
            };
            if chip.is_corner_raft() {
                continue;
            }
            entries.push(LayoutEntry {
                chip,
                device_type: columns.get(6).map(|s| s.to_string()),
                device_value: columns.get(7).and_then(|v| v.parse().ok()),
            });
        }
        entries.sort_by_key(|e| e.chip);
        entries.dedup_by_key(|e| e.chip);
        Ok(Self { entries })
    }

    /// Layout file when configured, science grid otherwise.
    pub fn load(path: Option<&Path>, camstr: &str) -> Result<Self, PartitionError> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|source| PartitionError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::parse(&content, camstr)
            }
            None => Ok(Self::science_grid()),
        }
    }

    pub fn entries(&self) -> &[LayoutEntry] {
        &self.entries
    }

    pub fn chips(&self) -> impl Iterator<Item = ChipCoord> + '_ {
        self.entries.iter().map(|e| e.chip)
    }

    pub fn contains(&self, chip: &ChipCoord) -> bool {
        self.entries.iter().any(|e| e.chip == *chip)
    }

    /// Chips grouped by raft, in partition order.
    pub fn rafts(&self) -> BTreeMap<(u8, u8), Vec<ChipCoord>> {
        let mut rafts: BTreeMap<(u8, u8), Vec<ChipCoord>> = BTreeMap::new();
        for chip in self.chips() {
            rafts.entry((chip.rx, chip.ry)).or_default().push(chip);
        }
        rafts
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-chip amplifier lists.
#[derive(Debug, Clone, Default)]
pub struct Segmentation {
    amps: BTreeMap<ChipCoord, Vec<AmpCoord>>,
}

impl Segmentation {
    /// Standard 2x8 grid for every chip.
    pub fn standard() -> Self {
        Self::default()
    }

    /// Lines starting with `{chipId}_C{ax}{ay}`; first token is the amp id.
    pub fn parse(content: &str) -> Self {
        let mut amps: BTreeMap<ChipCoord, Vec<AmpCoord>> = BTreeMap::new();
        for line in content.lines() {
            let Some(token) = line.split_whitespace().next() else {
                continue;
            };
            if let Some((chip, amp)) = parse_amp_id(token) {
                amps.entry(chip).or_default().push(amp);
            }
        }
        Self { amps }
    }

    pub fn load(path: Option<&Path>) -> Result<Self, PartitionError> {
        match path {
            Some(path) => std::fs::read_to_string(path)
                .map(|content| Self::parse(&content))
                .map_err(|source| PartitionError::Read {
                    path: path.to_path_buf(),
                    source,
                }),
            None => Ok(Self::standard()),
        }
    }

    /// Amplifiers of `chip`; the standard grid when the file lists none.
    pub fn amps(&self, chip: &ChipCoord) -> Vec<AmpCoord> {
        self.amps
            .get(chip)
            .cloned()
            .unwrap_or_else(AmpCoord::standard_grid)
    }
}

fn parse_amp_id(token: &str) -> Option<(ChipCoord, AmpCoord)> {
    let (chip, amp) = token.rsplit_once('_')?;
    let digits = amp.strip_prefix('C')?;
    let mut chars = digits.chars().map(|c| c.to_digit(10));
    let (ax, ay) = match (chars.next(), chars.next(), chars.next()) {
        (Some(Some(ax)), Some(Some(ay)), None) => (ax as u8, ay as u8),
        _ => return None,
    };
    Some((chip.parse().ok()?, AmpCoord::new(ax, ay).ok()?))
}
