//! Work-unit decomposition of a visit.
//!
//! A visit is split into (chip, exposure) units: rafts row-major, then
//! sensors row-major, then exposure index. Corner rafts never appear. A chip
//! contributes units only when its source count strictly exceeds the
//! threshold. Counts are looked up lazily, one chip at a time, as the
//! iterator advances.

use crate::errors::{IdentifierError, PartitionError};
use crate::focalplane::FocalPlaneLayout;
use crate::identifier::{self, ChipCoord, EXPOSURES_PER_VISIT, ParsFilenames, is_corner_raft};
use crate::observation::ObservationContext;
use serde::Serialize;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// One ray-trace job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExposureUnit {
    pub chip: ChipCoord,
    pub exposure_index: u8,
    pub seed: u64,
}

impl ExposureUnit {
    pub fn unit_id(&self) -> String {
        self.chip.unit_id(self.exposure_index)
    }

    pub fn chip_id(&self) -> String {
        self.chip.chip_id()
    }

    pub fn exposure_tag(&self) -> String {
        identifier::exposure_tag(self.exposure_index)
    }
}

/// Source of per-chip object counts.
pub trait SourceCounts {
    fn count(&self, chip: &ChipCoord) -> Result<usize, PartitionError>;
}

impl<F> SourceCounts for F
where
    F: Fn(&ChipCoord) -> Result<usize, PartitionError>,
{
    fn count(&self, chip: &ChipCoord) -> Result<usize, PartitionError> {
        self(chip)
    }
}

/// Counts lines of the trim tool's per-chip output catalog.
#[derive(Debug, Clone)]
pub struct TrimCatalogCounts {
    dir: PathBuf,
    names: ParsFilenames,
}

impl TrimCatalogCounts {
    pub fn new(dir: impl Into<PathBuf>, observation_id: &str) -> Self {
        Self {
            dir: dir.into(),
            names: ParsFilenames::new(observation_id),
        }
    }

    pub fn path(&self, chip: &ChipCoord) -> PathBuf {
        self.dir.join(self.names.trim_output(&chip.chip_id()))
    }
}

impl SourceCounts for TrimCatalogCounts {
    fn count(&self, chip: &ChipCoord) -> Result<usize, PartitionError> {
        let path = self.path(chip);
        count_lines(&path)
    }
}

fn count_lines(path: &Path) -> Result<usize, PartitionError> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PartitionError::MissingArtifact(path.to_path_buf()));
        }
        Err(source) => {
            return Err(PartitionError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let mut count = 0;
    for line in BufReader::new(file).lines() {
        line.map_err(|source| PartitionError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        count += 1;
    }
    Ok(count)
}

/// Restricts a partition to one raft, sensor or exposure ("run just one
/// unit" mode). Unset fields match everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitFilter {
    pub raft: Option<(u8, u8)>,
    pub sensor: Option<(u8, u8)>,
    pub exposure: Option<u8>,
}

impl UnitFilter {
    /// Exactly one unit.
    pub fn single(chip: ChipCoord, exposure_index: u8) -> Self {
        Self {
            raft: Some((chip.rx, chip.ry)),
            sensor: Some((chip.sx, chip.sy)),
            exposure: Some(exposure_index),
        }
    }

    /// Parses the CLI forms `--raft 22 --sensor 11 --exposure 1`.
    pub fn from_args(raft: Option<&str>, sensor: Option<&str>, exposure: Option<u8>) -> Result<Self, PartitionError> {
        let pair = |s: &str| -> Result<(u8, u8), IdentifierError> {
            let digits: Vec<u8> = s
                .trim_start_matches(['R', 'S'])
                .chars()
                .filter_map(|c| c.to_digit(10).map(|d| d as u8))
                .collect();
            match digits.as_slice() {
                [a, b] if s.trim_start_matches(['R', 'S']).len() == 2 => Ok((*a, *b)),
                _ => Err(IdentifierError::MalformedId(s.to_string())),
            }
        };
        let filter = Self {
            raft: raft.map(pair).transpose()?,
            sensor: sensor.map(pair).transpose()?,
            exposure,
        };
        filter.validate()?;
        Ok(filter)
    }

    pub fn validate(&self) -> Result<(), PartitionError> {
        if let Some((rx, ry)) = self.raft {
            if is_corner_raft(rx, ry) {
                return Err(PartitionError::CornerRaft { rx, ry });
            }
            ChipCoord::new(rx, ry, 0, 0)?;
        }
        if let Some((sx, sy)) = self.sensor {
            ChipCoord::new(0, 0, sx, sy)?;
        }
        if let Some(e) = self.exposure
            && e >= EXPOSURES_PER_VISIT
        {
            return Err(IdentifierError::InvalidCoordinate {
                name: "exposure",
                value: e,
                max: EXPOSURES_PER_VISIT - 1,
            }
            .into());
        }
        Ok(())
    }

    pub fn is_single_unit(&self) -> bool {
        self.raft.is_some() && self.sensor.is_some() && self.exposure.is_some()
    }

    pub fn matches_chip(&self, chip: &ChipCoord) -> bool {
        self.raft.is_none_or(|r| r == (chip.rx, chip.ry))
            && self.sensor.is_none_or(|s| s == (chip.sx, chip.sy))
    }

    pub fn matches_exposure(&self, exposure_index: u8) -> bool {
        self.exposure.is_none_or(|e| e == exposure_index)
    }
}

/// A visit's work units, enumerated on demand.
#[derive(Debug, Clone)]
pub struct Partitioner<C> {
    chips: Vec<ChipCoord>,
    base_seed: u64,
    threshold: u32,
    filter: UnitFilter,
    counts: C,
}

impl<C: SourceCounts> Partitioner<C> {
    /// `threshold` is compared with `count > threshold`; callers working from
    /// a raw `SIM_MINSOURCE` go through [`Partitioner::for_observation`].
    pub fn new(
        layout: &FocalPlaneLayout,
        base_seed: u64,
        threshold: u32,
        filter: UnitFilter,
        counts: C,
    ) -> Result<Self, PartitionError> {
        filter.validate()?;
        let chips = layout
            .chips()
            .filter(|c| !c.is_corner_raft() && filter.matches_chip(c))
            .collect();
        Ok(Self {
            chips,
            base_seed,
            threshold,
            filter,
            counts,
        })
    }

    /// Seeds from the observation's base seed; threshold is the
    /// sentinel-compensated `SIM_MINSOURCE`.
    pub fn for_observation(
        observation: &ObservationContext,
        layout: &FocalPlaneLayout,
        filter: UnitFilter,
        counts: C,
    ) -> Result<Self, PartitionError> {
        Self::new(
            layout,
            observation.base_seed(),
            observation.effective_min_source(),
            filter,
            counts,
        )
    }

    /// Fresh iterator from the first chip. Each call restarts the sequence.
    pub fn iter(&self) -> PartitionIter<'_, C> {
        PartitionIter {
            partitioner: self,
            next_chip: 0,
            pending: VecDeque::new(),
            done: false,
        }
    }

    /// Drain into a vector, stopping at the first error.
    pub fn units(&self) -> Result<Vec<ExposureUnit>, PartitionError> {
        self.iter().collect()
    }

    /// Chips considered before count filtering.
    pub fn candidate_chips(&self) -> &[ChipCoord] {
        &self.chips
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

/// Yields `Err` at most once, then ends.
pub struct PartitionIter<'a, C> {
    partitioner: &'a Partitioner<C>,
    next_chip: usize,
    pending: VecDeque<ExposureUnit>,
    done: bool,
}

impl<C: SourceCounts> Iterator for PartitionIter<'_, C> {
    type Item = Result<ExposureUnit, PartitionError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(unit) = self.pending.pop_front() {
                return Some(Ok(unit));
            }
            if self.done {
                return None;
            }
            let p = self.partitioner;
            let Some(chip) = p.chips.get(self.next_chip).copied() else {
                self.done = true;
                return None;
            };
            self.next_chip += 1;

            let count = match p.counts.count(&chip) {
                Ok(count) => count,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            if count <= p.threshold as usize {
                tracing::debug!(chip = %chip, count, threshold = p.threshold, "Skipping chip below source threshold");
                continue;
            }
            for e in (0..EXPOSURES_PER_VISIT).filter(|e| p.filter.matches_exposure(*e)) {
                self.pending.push_back(ExposureUnit {
                    chip,
                    exposure_index: e,
                    seed: identifier::seed(p.base_seed, chip.rx, chip.ry, chip.sx, chip.sy, e),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::CORNER_RAFTS;
    use std::cell::Cell;
    use tempfile::tempdir;

    fn ones(_: &ChipCoord) -> Result<usize, PartitionError> {
        Ok(1)
    }

    fn grid() -> FocalPlaneLayout {
        FocalPlaneLayout::science_grid()
    }

    #[test]
    fn test_full_partition_yields_378_units_in_order() {
        let p = Partitioner::new(&grid(), 500, 0, UnitFilter::default(), ones).unwrap();
        let units = p.units().unwrap();
        assert_eq!(units.len(), 378);

        assert_eq!(units[0].unit_id(), "R01_S00_E000");
        assert_eq!(units[1].unit_id(), "R01_S00_E001");
        assert_eq!(units[2].unit_id(), "R01_S01_E000");
        assert_eq!(units[377].unit_id(), "R43_S22_E001");

        let keys: Vec<(ChipCoord, u8)> = units.iter().map(|u| (u.chip, u.exposure_index)).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_partition_never_emits_corner_rafts() {
        let p = Partitioner::new(&grid(), 0, 0, UnitFilter::default(), ones).unwrap();
        for unit in p.iter() {
            let unit = unit.unwrap();
            assert!(!CORNER_RAFTS.contains(&(unit.chip.rx, unit.chip.ry)));
        }
    }

    #[test]
    fn test_seeds_follow_identifier_scheme() {
        let p = Partitioner::new(&grid(), 1000, 0, UnitFilter::default(), ones).unwrap();
        let unit = p
            .iter()
            .map(Result::unwrap)
            .find(|u| u.unit_id() == "R12_S21_E001")
            .unwrap();
        assert_eq!(unit.seed, 1000 + 90 + 36 + 12 + 2 + 1);
    }

    #[test]
    fn test_threshold_is_strict() {
        let counts = |chip: &ChipCoord| -> Result<usize, PartitionError> {
            Ok(if chip.chip_id() == "R22_S11" { 4 } else { 3 })
        };
        let p = Partitioner::new(&grid(), 0, 3, UnitFilter::default(), counts).unwrap();
        let ids: Vec<String> = p.iter().map(|u| u.unwrap().unit_id()).collect();
        assert_eq!(ids, vec!["R22_S11_E000", "R22_S11_E001"]);
    }

    #[test]
    fn test_sentinel_only_catalog_is_dropped_at_min_source_zero() {
        // trim catalog with just the sentinel line: 1 line, threshold 0 + 1
        let p = Partitioner::new(&grid(), 0, crate::observation::effective_min_source(0), UnitFilter::default(), ones)
            .unwrap();
        assert_eq!(p.units().unwrap().len(), 0);
    }

    #[test]
    fn test_single_unit_override() {
        let chip = ChipCoord::new(2, 2, 1, 1).unwrap();
        let p = Partitioner::new(&grid(), 0, 0, UnitFilter::single(chip, 1), ones).unwrap();
        let units = p.units().unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].unit_id(), "R22_S11_E001");
    }

    #[test]
    fn test_raft_only_filter() {
        let filter = UnitFilter::from_args(Some("R31"), None, None).unwrap();
        let p = Partitioner::new(&grid(), 0, 0, filter, ones).unwrap();
        assert_eq!(p.units().unwrap().len(), 18);
    }

    #[test]
    fn test_corner_raft_override_is_rejected() {
        let filter = UnitFilter {
            raft: Some((4, 0)),
            ..Default::default()
        };
        let err = Partitioner::new(&grid(), 0, 0, filter, ones as fn(&ChipCoord) -> Result<usize, PartitionError>).unwrap_err();
        assert!(matches!(err, PartitionError::CornerRaft { rx: 4, ry: 0 }));
    }

    #[test]
    fn test_filter_from_args_rejects_garbage() {
        assert!(UnitFilter::from_args(Some("R2"), None, None).is_err());
        assert!(UnitFilter::from_args(None, Some("S33"), None).is_err());
        assert!(UnitFilter::from_args(None, None, Some(2)).is_err());
        assert!(UnitFilter::from_args(Some("22"), Some("S11"), Some(0)).unwrap().is_single_unit());
    }

    #[test]
    fn test_counts_are_lazy_and_iteration_restarts() {
        let calls = Cell::new(0usize);
        let counting = |_: &ChipCoord| -> Result<usize, PartitionError> {
            calls.set(calls.get() + 1);
            Ok(5)
        };
        let p = Partitioner::new(&grid(), 0, 0, UnitFilter::default(), &counting).unwrap();

        let first: Vec<_> = p.iter().take(3).map(Result::unwrap).collect();
        assert_eq!(calls.get(), 2);
        let again: Vec<_> = p.iter().take(3).map(Result::unwrap).collect();
        assert_eq!(first, again);
    }

    #[test]
    fn test_trim_catalog_counts_and_missing_artifact() {
        let dir = tempdir().unwrap();
        let counts = TrimCatalogCounts::new(dir.path(), "8571");
        let chip = ChipCoord::new(0, 1, 0, 0).unwrap();
        std::fs::write(counts.path(&chip), "object a\nobject b\nlsst\n").unwrap();
        assert_eq!(counts.count(&chip).unwrap(), 3);

        let p = Partitioner::new(&grid(), 0, 1, UnitFilter::default(), counts).unwrap();
        let results: Vec<_> = p.iter().collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok() && results[1].is_ok());
        match &results[2] {
            Err(PartitionError::MissingArtifact(path)) => {
                assert!(path.ends_with("trimcatalog_8571_R01_S01.pars"));
            }
            other => panic!("Expected MissingArtifact, got {other:?}"),
        }
    }
}
