//! Observation metadata parsed from a trimfile.
//!
//! A trimfile is a line-oriented `key value` header followed by object lines.
//! [`ObservationContext`] is parsed once at visit start and never mutated.

use crate::errors::ObservationError;
use crate::identifier::FilterBand;
use std::collections::HashMap;
use std::f64::consts::PI;
use std::path::{Path, PathBuf};

/// Readout time per exposure, seconds.
pub const READ_TIME: f64 = 3.0;

/// Gaussian FWHM over sigma.
pub const FWHM_PER_SIGMA: f64 = 2.35482;

/// Keys without which a visit cannot be simulated.
const REQUIRED_KEYS: [&str; 9] = [
    "Opsim_obshistid",
    "Opsim_filter",
    "Unrefracted_RA",
    "Unrefracted_Dec",
    "Opsim_rotskypos",
    "Unrefracted_Altitude",
    "Unrefracted_Azimuth",
    "Opsim_rawseeing",
    "SIM_VISTIME",
];

/// Telescope pointing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pointing {
    pub ra: f64,
    pub dec: f64,
    /// Rotator angle on the sky (`Opsim_rotskypos`)
    pub rotation: f64,
    /// Rotator angle relative to the telescope (`Opsim_rottelpos`)
    pub spider_angle: f64,
}

/// Sun and moon geometry feeding the background model.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SkyGeometry {
    pub sun_alt: f64,
    pub moon_alt: f64,
    pub moon_ra: f64,
    pub moon_dec: f64,
    pub moon_distance: f64,
    /// Percent illuminated, 0-100
    pub moon_phase: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObservationContext {
    /// Trimfile obshistid with any extra-commands `extraid` digits appended
    pub observation_id: String,
    pub filter: FilterBand,
    pub pointing: Pointing,
    pub altitude: f64,
    pub azimuth: f64,
    pub raw_seeing: f64,
    pub sky: SkyGeometry,
    /// `Opsim_expmjd`
    pub exp_mjd: f64,
    /// Month taken from `Slalib_date` (`YYYY/MM/DD/time`)
    pub month: Option<u32>,
    pub sim_seed: Option<u64>,
    /// `SIM_MINSOURCE` as written; see [`ObservationContext::effective_min_source`]
    pub min_source: u32,
    pub tel_config: u8,
    pub cam_config: Option<u8>,
    pub vis_time: f64,
    pub nsnap: Option<u32>,
    pub dithered: bool,
    pub dither_ra_offset: f64,
    pub dither_dec_offset: f64,
    /// `object ...` lines, verbatim
    pub object_lines: Vec<String>,
    /// Catalogs named by `includeobj` lines
    pub include_catalogs: Vec<String>,
    /// Extra-commands lines appended to every chip pars file
    pub extra_commands: Vec<String>,
    pub trimfile: PathBuf,
}

impl ObservationContext {
    /// Parse a trimfile and an optional extra-commands file.
    pub fn load(trimfile: &Path, extra_commands: Option<&Path>) -> Result<Self, ObservationError> {
        let content = read(trimfile)?;
        let extra = match extra_commands {
            Some(path) => Some(read(path)?),
            None => None,
        };
        Self::parse(trimfile, &content, extra.as_deref())
    }

    /// Parse from already-read contents. `trimfile` is used for error
    /// messages and recorded on the context.
    pub fn parse(trimfile: &Path, content: &str, extra_commands: Option<&str>) -> Result<Self, ObservationError> {
        let mut values: HashMap<&str, &str> = HashMap::new();
        let mut object_lines = Vec::new();
        let mut include_catalogs = Vec::new();

        for line in content.lines() {
            let mut tokens = line.split_whitespace();
            let Some(key) = tokens.next() else { continue };
            match key {
                "object" => object_lines.push(line.trim_end().to_string()),
                "includeobj" => {
                    if let Some(catalog) = tokens.next() {
                        include_catalogs.push(catalog.to_string());
                    }
                }
                _ => {
                    if let Some(value) = tokens.next() {
                        values.insert(key, value);
                    }
                }
            }
        }

        for key in REQUIRED_KEYS {
            if !values.contains_key(key) {
                return Err(ObservationError::MissingKey {
                    path: trimfile.to_path_buf(),
                    key,
                });
            }
        }

        let get = |key: &str| values.get(key).copied();
        let float = |key: &str| -> Result<f64, ObservationError> {
            match get(key) {
                Some(v) => parse_value(key, v),
                None => Ok(0.0),
            }
        };

        let obshistid = get("Opsim_obshistid").unwrap_or_default();
        require_digits(obshistid)?;

        let mut observation_id = obshistid.to_string();
        let mut extra_lines = Vec::new();
        if let Some(extra) = extra_commands {
            for line in extra.lines().filter(|l| !l.trim().is_empty()) {
                let mut tokens = line.split_whitespace();
                if tokens.next() == Some("extraid") {
                    if let Some(extraid) = tokens.next() {
                        require_digits(extraid)?;
                        observation_id.push_str(extraid);
                    }
                }
                extra_lines.push(line.trim_end().to_string());
            }
        }

        let filter: FilterBand = get("Opsim_filter").unwrap_or_default().parse()?;

        let month = match get("Slalib_date") {
            Some(date) => Some(
                date.split('/')
                    .nth(1)
                    .and_then(|m| m.parse::<u32>().ok())
                    .ok_or_else(|| invalid("Slalib_date", date))?,
            ),
            None => None,
        };

        let context = Self {
            observation_id,
            filter,
            pointing: Pointing {
                ra: float("Unrefracted_RA")?,
                dec: float("Unrefracted_Dec")?,
                rotation: float("Opsim_rotskypos")?,
                spider_angle: float("Opsim_rottelpos")?,
            },
            altitude: float("Unrefracted_Altitude")?,
            azimuth: float("Unrefracted_Azimuth")?,
            raw_seeing: float("Opsim_rawseeing")?,
            sky: SkyGeometry {
                sun_alt: float("Opsim_sunalt")?,
                moon_alt: float("Opsim_moonalt")?,
                moon_ra: float("Opsim_moonra")?,
                moon_dec: float("Opsim_moondec")?,
                moon_distance: float("Opsim_dist2moon")?,
                moon_phase: float("Opsim_moonphase")?,
            },
            exp_mjd: float("Opsim_expmjd")?,
            month,
            sim_seed: optional(get("SIM_SEED"), "SIM_SEED")?,
            min_source: optional(get("SIM_MINSOURCE"), "SIM_MINSOURCE")?.unwrap_or(0),
            tel_config: optional(get("SIM_TELCONFIG"), "SIM_TELCONFIG")?.unwrap_or(0),
            cam_config: optional(get("SIM_CAMCONFIG"), "SIM_CAMCONFIG")?,
            vis_time: float("SIM_VISTIME")?,
            nsnap: optional(get("SIM_NSNAP"), "SIM_NSNAP")?,
            dithered: get("isDithered").is_some_and(|v| v != "0"),
            dither_ra_offset: float("ditherRaOffset")?,
            dither_dec_offset: float("ditherDecOffset")?,
            object_lines,
            include_catalogs,
            extra_commands: extra_lines,
            trimfile: trimfile.to_path_buf(),
        };

        tracing::debug!(
            observation_id = %context.observation_id,
            filter = %context.filter,
            vis_time = context.vis_time,
            min_source = context.min_source,
            objects = context.object_lines.len(),
            "Parsed trimfile"
        );
        Ok(context)
    }

    /// Seed every per-unit seed is offset from.
    pub fn base_seed(&self) -> u64 {
        match self.sim_seed {
            Some(seed) => seed,
            // Digits were checked at parse time; an id too wide for u64 folds
            // back through wrapping arithmetic.
            None => self.observation_id.bytes().fold(0u64, |acc, b| {
                acc.wrapping_mul(10).wrapping_add(u64::from(b - b'0'))
            }),
        }
    }

    /// Threshold handed to the partitioner. Each trim catalog carries one
    /// extra sentinel line, so the raw `SIM_MINSOURCE` is raised by one.
    pub fn effective_min_source(&self) -> u32 {
        effective_min_source(self.min_source)
    }

    pub fn read_time(&self) -> f64 {
        READ_TIME
    }

    /// Open-shutter time per snap.
    pub fn exposure_time(&self) -> f64 {
        0.5 * self.vis_time - 0.5 * READ_TIME
    }

    /// Offset of each snap's midpoint from the visit midpoint.
    pub fn time_offset(&self) -> f64 {
        0.5 * self.exposure_time() + 0.5 * READ_TIME
    }

    pub fn start_time(&self) -> f64 {
        -0.5 * self.vis_time
    }

    pub fn end_time(&self) -> f64 {
        0.5 * self.vis_time
    }

    pub fn zenith(&self) -> f64 {
        90.0 - self.altitude
    }

    pub fn sun_zenith(&self) -> f64 {
        90.0 - self.sky.sun_alt
    }

    pub fn moon_phase_radians(&self) -> f64 {
        PI - PI * self.sky.moon_phase / 100.0
    }

    pub fn sigma_seeing(&self) -> f64 {
        self.raw_seeing / FWHM_PER_SIGMA
    }

    /// Field rotation rate at the site latitude.
    pub fn rotation_rate(&self) -> f64 {
        let rad = PI / 180.0;
        15.04 * (30.66 * rad).cos() * (self.azimuth * rad).cos() / (self.altitude * rad).cos()
    }

    pub fn wavelength(&self) -> f64 {
        self.filter.wavelength_microns()
    }

    /// Camera-group regex selected by `SIM_CAMCONFIG`.
    pub fn camstr(&self) -> Result<&'static str, ObservationError> {
        match self.cam_config {
            Some(config) => camstr(config),
            None => Ok(DEFAULT_CAMSTR),
        }
    }
}

/// Camera group used when `SIM_CAMCONFIG` is absent.
pub const DEFAULT_CAMSTR: &str = "Group0";

/// `SIM_CAMCONFIG` bitmask to layout-group regex.
pub fn camstr(cam_config: u8) -> Result<&'static str, ObservationError> {
    match cam_config {
        1 => Ok("Group0"),
        2 => Ok("Group1"),
        3 => Ok("Group0|Group1"),
        4 => Ok("Group2"),
        5 => Ok("Group0|Group2"),
        6 => Ok("Group1|Group2"),
        7 => Ok("Group0|Group1|Group2"),
        other => Err(invalid("SIM_CAMCONFIG", &other.to_string())),
    }
}

pub fn effective_min_source(raw: u32) -> u32 {
    raw.saturating_add(1)
}

fn read(path: &Path) -> Result<String, ObservationError> {
    std::fs::read_to_string(path).map_err(|source| ObservationError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn require_digits(id: &str) -> Result<(), ObservationError> {
    if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(ObservationError::NonNumericId(id.to_string()))
    }
}

fn invalid(key: &str, value: &str) -> ObservationError {
    ObservationError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ObservationError> {
    value.parse().map_err(|_| invalid(key, value))
}

fn optional<T: std::str::FromStr>(value: Option<&str>, key: &str) -> Result<Option<T>, ObservationError> {
    value.map(|v| parse_value(key, v)).transpose()
}
