//! Naming and seeding scheme for focal-plane work units.
//!
//! Every raft/sensor/exposure/amplifier identifier and every per-unit random
//! seed is derived here from a handful of integer coordinates. Nothing in this
//! module performs I/O; producer and verifier both go through it.
//!
//! | Identifier | Form                     | Example            |
//! |------------|--------------------------|--------------------|
//! | raft       | `R{rx}{ry}`              | `R22`              |
//! | sensor     | `S{sx}{sy}`              | `S11`              |
//! | chip       | `R{rx}{ry}_S{sx}{sy}`    | `R22_S11`          |
//! | exposure   | `E00{e}`                 | `E001`             |
//! | unit       | `{chip}_E00{e}`          | `R22_S11_E001`     |
//! | amplifier  | `{chip}_C{ax}{ay}`       | `R22_S11_C17`      |

pub mod filenames;

pub use filenames::{ParsFilenames, ParsStage};

use crate::errors::IdentifierError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Rafts per focal-plane axis.
pub const RAFTS_PER_AXIS: u8 = 5;
/// Sensors per raft axis.
pub const SENSORS_PER_AXIS: u8 = 3;
/// Exposures (snaps) per visit.
pub const EXPOSURES_PER_VISIT: u8 = 2;
/// Amplifier columns per sensor.
pub const AMP_COLUMNS: u8 = 2;
/// Amplifier rows per sensor.
pub const AMP_ROWS: u8 = 8;

/// Rafts with no sensors; never part of a partition.
pub const CORNER_RAFTS: [(u8, u8); 4] = [(0, 0), (0, 4), (4, 0), (4, 4)];

/// Fixed filter table, index order.
const FILTER_LETTERS: [char; 6] = ['u', 'g', 'r', 'i', 'z', 'y'];

/// Photometric filter of an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterBand {
    U,
    G,
    R,
    I,
    Z,
    Y,
}

impl FilterBand {
    pub const ALL: [FilterBand; 6] = [
        FilterBand::U,
        FilterBand::G,
        FilterBand::R,
        FilterBand::I,
        FilterBand::Z,
        FilterBand::Y,
    ];

    pub fn from_index(index: u8) -> Result<Self, IdentifierError> {
        Self::ALL
            .get(usize::from(index))
            .copied()
            .ok_or_else(|| IdentifierError::InvalidFilter(index.to_string()))
    }

    pub fn from_letter(letter: char) -> Result<Self, IdentifierError> {
        FILTER_LETTERS
            .iter()
            .position(|&c| c == letter)
            .map(|i| Self::ALL[i])
            .ok_or_else(|| IdentifierError::InvalidFilter(letter.to_string()))
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn letter(self) -> char {
        FILTER_LETTERS[usize::from(self.index())]
    }

    /// Effective wavelength in microns handed to the turbulence generator.
    pub fn wavelength_microns(self) -> f64 {
        match self {
            FilterBand::U => 0.36,
            FilterBand::G => 0.48,
            FilterBand::R => 0.62,
            FilterBand::I => 0.76,
            FilterBand::Z => 0.87,
            FilterBand::Y => 0.97,
        }
    }
}

impl fmt::Display for FilterBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// Accepts either the numeric index (`"3"`) or the letter (`"i"`).
impl FromStr for FilterBand {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(index) = s.parse::<u8>() {
            return Self::from_index(index);
        }
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Self::from_letter(c.to_ascii_lowercase()),
            _ => Err(IdentifierError::InvalidFilter(s.to_string())),
        }
    }
}

/// Filter letter for a numeric filter index.
pub fn filter_letter(index: u8) -> Result<char, IdentifierError> {
    FilterBand::from_index(index).map(FilterBand::letter)
}

/// Numeric filter index for a filter letter.
pub fn filter_index(letter: char) -> Result<u8, IdentifierError> {
    FilterBand::from_letter(letter).map(FilterBand::index)
}

fn check_range(name: &'static str, value: u8, limit: u8) -> Result<u8, IdentifierError> {
    if value < limit {
        Ok(value)
    } else {
        Err(IdentifierError::InvalidCoordinate {
            name,
            value,
            max: limit - 1,
        })
    }
}

/// True for the four rafts that carry no sensors.
pub fn is_corner_raft(rx: u8, ry: u8) -> bool {
    CORNER_RAFTS.contains(&(rx, ry))
}

/// Raft/sensor position of one chip on the focal plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChipCoord {
    pub rx: u8,
    pub ry: u8,
    pub sx: u8,
    pub sy: u8,
}

impl ChipCoord {
    /// Validated constructor. Corner rafts are accepted here; excluding them
    /// is the partitioner's job.
    pub fn new(rx: u8, ry: u8, sx: u8, sy: u8) -> Result<Self, IdentifierError> {
        Ok(Self {
            rx: check_range("rx", rx, RAFTS_PER_AXIS)?,
            ry: check_range("ry", ry, RAFTS_PER_AXIS)?,
            sx: check_range("sx", sx, SENSORS_PER_AXIS)?,
            sy: check_range("sy", sy, SENSORS_PER_AXIS)?,
        })
    }

    pub fn is_corner_raft(&self) -> bool {
        is_corner_raft(self.rx, self.ry)
    }

    pub fn raft_id(&self) -> String {
        format!("R{}{}", self.rx, self.ry)
    }

    pub fn sensor_id(&self) -> String {
        format!("S{}{}", self.sx, self.sy)
    }

    pub fn chip_id(&self) -> String {
        chip_id(self.rx, self.ry, self.sx, self.sy)
    }

    pub fn unit_id(&self, exposure_index: u8) -> String {
        exposure_id(&self.chip_id(), exposure_index)
    }
}

impl fmt::Display for ChipCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.chip_id())
    }
}

/// Parses `R{rx}{ry}_S{sx}{sy}`.
impl FromStr for ChipCoord {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || IdentifierError::MalformedId(s.to_string());
        let (raft, sensor) = s.split_once('_').ok_or_else(malformed)?;
        let (rx, ry) = parse_digit_pair(raft, 'R').ok_or_else(malformed)?;
        let (sx, sy) = parse_digit_pair(sensor, 'S').ok_or_else(malformed)?;
        ChipCoord::new(rx, ry, sx, sy)
    }
}

fn parse_digit_pair(token: &str, prefix: char) -> Option<(u8, u8)> {
    let rest = token.strip_prefix(prefix)?;
    let mut digits = rest.chars().map(|c| c.to_digit(10));
    match (digits.next(), digits.next(), digits.next()) {
        (Some(Some(a)), Some(Some(b)), None) => Some((a as u8, b as u8)),
        _ => None,
    }
}

/// `R{rx}{ry}_S{sx}{sy}`
pub fn chip_id(rx: u8, ry: u8, sx: u8, sy: u8) -> String {
    format!("R{}{}_S{}{}", rx, ry, sx, sy)
}

/// `E00{e}`
pub fn exposure_tag(exposure_index: u8) -> String {
    format!("E00{}", exposure_index)
}

/// `{chip_id}_E00{e}`
pub fn exposure_id(chip_id: &str, exposure_index: u8) -> String {
    format!("{}_{}", chip_id, exposure_tag(exposure_index))
}

/// Parses an `E00{e}` tag back into the exposure index.
pub fn parse_exposure_tag(tag: &str) -> Result<u8, IdentifierError> {
    let index = tag
        .strip_prefix("E00")
        .and_then(|d| d.parse::<u8>().ok())
        .filter(|d| *d < 10)
        .ok_or_else(|| IdentifierError::MalformedId(tag.to_string()))?;
    check_range("exposure", index, EXPOSURES_PER_VISIT)
}

/// Splits a unit id `R22_S11_E001` into its chip and exposure index.
pub fn parse_unit_id(unit_id: &str) -> Result<(ChipCoord, u8), IdentifierError> {
    let (chip, exposure) = unit_id
        .rsplit_once('_')
        .ok_or_else(|| IdentifierError::MalformedId(unit_id.to_string()))?;
    Ok((chip.parse()?, parse_exposure_tag(exposure)?))
}

/// Per-unit random seed.
///
/// Coefficients form a mixed-radix encoding of (rx, ry, sx, sy, e), so seeds
/// never collide within one visit for a fixed base.
pub fn seed(base: u64, rx: u8, ry: u8, sx: u8, sy: u8, exposure_index: u8) -> u64 {
    let offset = 90 * u64::from(rx)
        + 18 * u64::from(ry)
        + 6 * u64::from(sx)
        + 2 * u64::from(sy)
        + u64::from(exposure_index);
    base.wrapping_add(offset)
}

/// Readout amplifier position within a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AmpCoord {
    pub ax: u8,
    pub ay: u8,
}

impl AmpCoord {
    pub fn new(ax: u8, ay: u8) -> Result<Self, IdentifierError> {
        Ok(Self {
            ax: check_range("ax", ax, AMP_COLUMNS)?,
            ay: check_range("ay", ay, AMP_ROWS)?,
        })
    }

    /// The 16 amplifiers of a standard sensor, row-major.
    pub fn standard_grid() -> Vec<AmpCoord> {
        (0..AMP_COLUMNS)
            .flat_map(|ax| (0..AMP_ROWS).map(move |ay| AmpCoord { ax, ay }))
            .collect()
    }
}

/// `{chip_id}_C{ax}{ay}`
pub fn amp_id(chip: &ChipCoord, amp: &AmpCoord) -> String {
    format!("{}_C{}{}", chip.chip_id(), amp.ax, amp.ay)
}

/// Per-amplifier seed used by the e2adc stage; same mixed-radix idea as
/// [`seed`] one level deeper.
pub fn amp_seed(base: u64, chip: &ChipCoord, amp: &AmpCoord, exposure_index: u8) -> u64 {
    let offset = 1440 * u64::from(chip.rx)
        + 288 * u64::from(chip.ry)
        + 96 * u64::from(chip.sx)
        + 32 * u64::from(chip.sy)
        + 16 * u64::from(amp.ax)
        + 2 * u64::from(amp.ay)
        + u64::from(exposure_index);
    base.wrapping_add(offset)
}
