//! Parameter-file bodies for the native simulation tools.
//!
//! Each builder returns the file's text; the stages decide where it is
//! written. Values are formatted with `Display`, one `key value` per line,
//! and each file ends with the tool's command word.

use crate::errors::StageError;
use crate::identifier::filenames::{ATMOSPHERE_LAYERS, CLOUD_LAYERS};
use crate::identifier::{ChipCoord, ParsFilenames};
use crate::observation::ObservationContext;
use crate::partition::ExposureUnit;
use std::collections::BTreeSet;
use std::fmt::{Display, Write as _};

/// Line the pipeline appends to every trim catalog.
pub const TRIM_SENTINEL: &str = "lsst";

/// Catalog lines carrying an SED path in their sixth column.
const SED_MARKERS: [&str; 6] = ["starSED", "galaxySED", "ssmSED", "agnSED", "flatSED", "sky"];

/// Line-oriented pars builder.
#[derive(Debug, Default)]
struct Pars(String);

impl Pars {
    fn new() -> Self {
        Self::default()
    }

    fn set(mut self, key: &str, value: impl Display) -> Self {
        let _ = writeln!(self.0, "{} {}", key, value);
        self
    }

    fn indexed(mut self, key: &str, index: impl Display, value: impl Display) -> Self {
        let _ = writeln!(self.0, "{} {} {}", key, index, value);
        self
    }

    /// Verbatim text, newline-terminated.
    fn text(mut self, text: &str) -> Self {
        if !text.is_empty() {
            self.0.push_str(text);
            if !text.ends_with('\n') {
                self.0.push('\n');
            }
        }
        self
    }

    fn command(mut self, word: &str) -> String {
        self.0.push_str(word);
        self.0.push('\n');
        self.0
    }

    fn finish(self) -> String {
        self.0
    }
}

/// Trimfile `object` lines, one per line.
pub fn object_catalog(obs: &ObservationContext) -> String {
    obs.object_lines
        .iter()
        .fold(Pars::new(), |pars, line| pars.text(line))
        .finish()
}

/// `catalog <n> <path>` lines handed to trim, and how many there are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogList {
    pub body: String,
    pub count: usize,
}

/// The object catalog (when the trimfile has objects) followed by every
/// `includeobj` catalog.
pub fn catalog_list(obs: &ObservationContext, names: &ParsFilenames) -> CatalogList {
    let mut pars = Pars::new();
    let mut count = 0;
    if !obs.object_lines.is_empty() {
        pars = pars.indexed("catalog", count, format!("../../{}", names.objectcatalog()));
        count += 1;
    }
    for catalog in &obs.include_catalogs {
        pars = pars.indexed("catalog", count, format!("../../{}", catalog));
        count += 1;
    }
    CatalogList {
        body: pars.finish(),
        count,
    }
}

pub fn obs_pars(obs: &ObservationContext) -> String {
    Pars::new()
        .set("pointingra", obs.pointing.ra)
        .set("pointingdec", obs.pointing.dec)
        .set("rotationangle", obs.pointing.rotation)
        .set("spiderangle", obs.pointing.spider_angle)
        .set("filter", obs.filter.index())
        .set("zenith", obs.zenith())
        .set("azimuth", obs.azimuth)
        .set("rotationrate", obs.rotation_rate())
        .set("seddir", "../data/")
        .set("obshistid", &obs.observation_id)
        .set("tai", obs.exp_mjd)
        .set("exptime", obs.exposure_time())
        .set("dithered", u8::from(obs.dithered))
        .set("ditherra", obs.dither_ra_offset)
        .set("ditherdec", obs.dither_dec_offset)
        .finish()
}

/// Input of `create_atmosphere`, which writes the atmosphere raytrace pars.
pub fn atmosphere_pars(obs: &ObservationContext, names: &ParsFilenames) -> String {
    let mut pars = Pars::new().set("outputfilename", names.atmosphere_raytrace());
    if let Some(month) = obs.month {
        pars = pars.set("monthnum", month);
    }
    pars.set("numlevel", 6)
        .set("constrainseeing", obs.sigma_seeing())
        .set("seed", obs.base_seed())
        .command("createatmosphere")
}

/// `atmospherefile` lines appended to the atmosphere raytrace pars.
pub fn atmosphere_screen_references(names: &ParsFilenames) -> String {
    (0..ATMOSPHERE_LAYERS)
        .fold(Pars::new(), |pars, layer| {
            pars.indexed(
                "atmospherefile",
                layer,
                format!("../{}", names.atmosphere_screen_base(layer)),
            )
        })
        .finish()
}

/// Body of the cloud raytrace pars.
pub fn cloud_screen_references(names: &ParsFilenames) -> String {
    CLOUD_LAYERS
        .iter()
        .fold(Pars::new(), |pars, &layer| {
            pars.indexed("cloudfile", layer, format!("../{}", names.cloud_screen_base(layer)))
        })
        .finish()
}

/// Input of `optics_parameters`.
pub fn control_pars(obs: &ObservationContext, names: &ParsFilenames) -> String {
    Pars::new()
        .set("outputfilename", names.optics())
        .set("zenith", obs.zenith())
        .set("ranseed", obs.base_seed())
        .command("optics_parameters")
}

/// Input of `tracking`.
pub fn track_pars(obs: &ObservationContext, names: &ParsFilenames) -> String {
    Pars::new()
        .set("outputfilename", names.tracking())
        .set("seed", obs.base_seed())
        .set("starttime", obs.start_time())
        .set("endtime", obs.end_time())
        .command("tracking")
}

/// Input of `trim` for the chips of one raft.
pub fn trim_pars(
    obs: &ObservationContext,
    names: &ParsFilenames,
    catalogs: &CatalogList,
    chips: &[ChipCoord],
) -> String {
    let mut pars = Pars::new().set("ncatalog", catalogs.count).text(&catalogs.body);
    for (i, chip) in chips.iter().enumerate() {
        let chip_id = chip.chip_id();
        pars = pars
            .indexed("out_file", i, names.trim_output(&chip_id))
            .indexed("chip_id", i, chip_id);
    }
    pars.set("ntrim", chips.len())
        .set("point_ra", obs.pointing.ra)
        .set("point_dec", obs.pointing.dec)
        .set("rot_ang", obs.pointing.rotation)
        .set("buffer", 100)
        .set("straylight", 0)
        .command("trim")
}

/// Snap timing; the first exposure sits before the visit midpoint.
pub fn time_pars(obs: &ObservationContext, exposure_index: u8) -> String {
    let offset = obs.time_offset();
    let offset = if exposure_index == 0 { -offset } else { offset };
    Pars::new()
        .set("timeoffset", offset)
        .set("pairid", exposure_index)
        .finish()
}

/// Per-unit raytrace settings. `offsets` is the chip's misalignment table,
/// when the data tree provides one.
pub fn chip_pars(
    obs: &ObservationContext,
    names: &ParsFilenames,
    unit: &ExposureUnit,
    offsets: Option<&str>,
) -> String {
    let chip_id = unit.chip_id();
    let mut pars = Pars::new()
        .text(offsets.unwrap_or_default())
        .set("chipid", &chip_id)
        .set(
            "chipheightfile",
            format!("../data/focal_plane/sta_misalignments/height_maps/{}.fits.gz", chip_id),
        )
        .set("outputfilename", names.image_base(&unit.unit_id()))
        .set("seed", unit.seed)
        .set("trackingfile", format!("../{}", names.tracking()));
    for line in &obs.extra_commands {
        pars = pars.text(line);
    }
    pars.finish()
}

/// Concatenation of the raytrace inputs in the order the raytracer reads
/// them: obs, atmosphere raytrace, optics, time, cloud raytrace, chip.
pub fn raytrace_commands(parts: &[&str]) -> String {
    parts
        .iter()
        .fold(Pars::new(), |pars, part| pars.text(part))
        .set("straylight", 0)
        .finish()
}

/// Input of `add_background`. `atmosphere_raytrace` is the text written by
/// `create_atmosphere`, which supplies water vapour and cloud means.
pub fn background_pars(
    obs: &ObservationContext,
    names: &ParsFilenames,
    unit: &ExposureUnit,
    atmosphere_raytrace: &str,
) -> Result<String, StageError> {
    let mut pars = Pars::new()
        .set("out_file", names.background_image(&unit.unit_id()))
        .set("point_alt", obs.altitude)
        .set("point_az", obs.azimuth)
        .set("filter", obs.filter.index())
        .set("spiderangle", obs.pointing.spider_angle)
        .set("rot_ang", obs.pointing.rotation)
        .set("chip_id", unit.chip_id())
        .set("solar_zen", obs.sun_zenith());

    pars = match obs.tel_config {
        0 => {
            let watervar = last_value(atmosphere_raytrace, &["relh2o"]).ok_or_else(|| {
                StageError::MissingParameter {
                    file: names.atmosphere_raytrace(),
                    key: "relh2o".into(),
                }
            })?;
            pars.set("zenith_v", "22.09").set("watervar", watervar)
        }
        1 => pars.set("zenith_v", "10000.0"),
        2 => pars
            .set("zenith_v", "18.00")
            .set("fc_file", "filter_constants_dome"),
        _ => pars
            .set("zenith_v", "21.00")
            .set("fc_file", "filter_constants_dome"),
    };

    pars = pars
        .set("moon_alt", obs.sky.moon_alt)
        .set("moon_ra", obs.sky.moon_ra)
        .set("moon_dec", obs.sky.moon_dec)
        .set("point_ra", obs.pointing.ra)
        .set("point_dec", obs.pointing.dec)
        .set("moon_dist", obs.sky.moon_distance)
        .set("phase_ang", obs.moon_phase_radians())
        .set("seed", unit.seed)
        .set("wavelength", obs.wavelength());
    for line in atmosphere_raytrace.lines().filter(|l| l.contains("cloudmean")) {
        pars = pars.text(line.trim_end());
    }
    Ok(pars.command("add_background"))
}

/// Input of `create_rays`.
pub fn cosmic_pars(obs: &ObservationContext, names: &ParsFilenames, unit: &ExposureUnit) -> String {
    let unit_id = unit.unit_id();
    Pars::new()
        .set(
            "inputfilename",
            format!("../Add_Background/fits_files/{}", names.background_image(&unit_id)),
        )
        .set("outputfilename", names.cosmic_image(&unit_id))
        .set("pixsize", "10.0")
        .set("exposuretime", obs.exposure_time())
        .set("raydensity", "0.6")
        .set("scalenumber", "8.0")
        .set("seed", unit.seed)
        .command("createrays")
}

/// Input of `e2adc`. `readout` is the chip's readout table, when the data
/// tree provides one.
pub fn e2adc_pars(
    obs: &ObservationContext,
    names: &ParsFilenames,
    unit: &ExposureUnit,
    readout: Option<&str>,
) -> String {
    let chip_id = unit.chip_id();
    Pars::new()
        .text(readout.unwrap_or_default())
        .set(
            "inputfilename",
            format!("../cosmic_rays/{}", names.cosmic_image(&unit.unit_id())),
        )
        .set("outputprefilename", format!("imsim_{}_", names.observation_id()))
        .set("outputpostfilename", format!("_{}", unit.exposure_tag()))
        .set("chipid", &chip_id)
        .set(
            "qemapfilename",
            format!("../../data/focal_plane/sta_misalignments/qe_maps/QE_{}.fits.gz", chip_id),
        )
        .set("exptime", obs.exposure_time())
        .set("seed", unit.seed)
        .command("e2adc")
}

/// SED files a chip's trim catalog refers to, sorted and unique.
pub fn sed_list(trim_catalog: &str) -> String {
    let seds: BTreeSet<&str> = trim_catalog
        .lines()
        .filter(|line| SED_MARKERS.iter().any(|m| line.contains(m)))
        .filter_map(|line| line.split_whitespace().nth(5))
        .collect();
    seds.into_iter()
        .fold(Pars::new(), |pars, sed| pars.text(sed))
        .finish()
}

/// Value of the last line whose leading tokens equal `keys`.
pub fn last_value<'a>(content: &'a str, keys: &[&str]) -> Option<&'a str> {
    content
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            keys.iter()
                .all(|key| tokens.next() == Some(*key))
                .then(|| tokens.next())
                .flatten()
        })
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::tests::TRIMFILE;
    use std::path::Path;

    fn obs() -> ObservationContext {
        ObservationContext::parse(Path::new("trim.txt"), TRIMFILE, None).unwrap()
    }

    fn unit(e: u8) -> ExposureUnit {
        let chip = ChipCoord::new(2, 2, 1, 1).unwrap();
        ExposureUnit {
            chip,
            exposure_index: e,
            seed: crate::identifier::seed(1000, 2, 2, 1, 1, e),
        }
    }

    const ATMOSPHERE_RAYTRACE: &str = "\
outerscale 0 12.5
height 0 20.0
height 3 7.5
relh2o 1.2
cloudmean0 0.1
cloudmean1 0.05
";

    #[test]
    fn test_catalog_list_numbers_catalogs() {
        let mut obs = obs();
        obs.include_catalogs = vec!["extra_a.pars".into(), "extra_b.pars".into()];
        let names = ParsFilenames::new(&obs.observation_id);
        let list = catalog_list(&obs, &names);
        assert_eq!(list.count, 3);
        assert_eq!(
            list.body,
            "catalog 0 ../../objectcatalog_85748128.pars\n\
             catalog 1 ../../extra_a.pars\n\
             catalog 2 ../../extra_b.pars\n"
        );

        obs.object_lines.clear();
        let list = catalog_list(&obs, &names);
        assert_eq!(list.count, 2);
        assert!(list.body.starts_with("catalog 0 ../../extra_a.pars\n"));
    }

    #[test]
    fn test_object_catalog_copies_object_lines() {
        let catalog = object_catalog(&obs());
        assert_eq!(catalog.lines().count(), 2);
        assert!(catalog.lines().all(|l| l.starts_with("object ")));
    }

    #[test]
    fn test_trim_pars_layout() {
        let obs = obs();
        let names = ParsFilenames::new(&obs.observation_id);
        let catalogs = catalog_list(&obs, &names);
        let chips = [
            ChipCoord::new(2, 2, 0, 0).unwrap(),
            ChipCoord::new(2, 2, 0, 1).unwrap(),
        ];
        let pars = trim_pars(&obs, &names, &catalogs, &chips);
        let lines: Vec<&str> = pars.lines().collect();
        assert_eq!(lines[0], "ncatalog 1");
        assert_eq!(lines[1], "catalog 0 ../../objectcatalog_85748128.pars");
        assert_eq!(lines[2], "out_file 0 trimcatalog_85748128_R22_S00.pars");
        assert_eq!(lines[3], "chip_id 0 R22_S00");
        assert_eq!(lines[4], "out_file 1 trimcatalog_85748128_R22_S01.pars");
        assert_eq!(lines[6], "ntrim 2");
        assert_eq!(lines.last(), Some(&"trim"));
    }

    #[test]
    fn test_time_pars_sign_by_exposure() {
        let obs = obs();
        assert_eq!(time_pars(&obs, 0), "timeoffset -9\npairid 0\n");
        assert_eq!(time_pars(&obs, 1), "timeoffset 9\npairid 1\n");
    }

    #[test]
    fn test_chip_pars_appends_extra_commands() {
        let mut obs = obs();
        obs.extra_commands = vec!["clearclouds".into()];
        let names = ParsFilenames::new(&obs.observation_id);
        let pars = chip_pars(&obs, &names, &unit(1), Some("body 0 0.0"));
        let lines: Vec<&str> = pars.lines().collect();
        assert_eq!(
            lines,
            vec![
                "body 0 0.0",
                "chipid R22_S11",
                "chipheightfile ../data/focal_plane/sta_misalignments/height_maps/R22_S11.fits.gz",
                "outputfilename imsim_85748128_R22_S11_E001",
                "seed 1225",
                "trackingfile ../tracking_85748128.pars",
                "clearclouds",
            ]
        );
    }

    #[test]
    fn test_raytrace_commands_concatenates_in_order() {
        let body = raytrace_commands(&["a 1\n", "b 2", "", "c 3\n"]);
        assert_eq!(body, "a 1\nb 2\nc 3\nstraylight 0\n");
    }

    #[test]
    fn test_background_pars_by_telescope_config() {
        let mut obs = obs();
        let names = ParsFilenames::new(&obs.observation_id);
        let pars = background_pars(&obs, &names, &unit(0), ATMOSPHERE_RAYTRACE).unwrap();
        assert!(pars.starts_with("out_file imsim_85748128_R22_S11_E000.fits\n"));
        assert!(pars.contains("zenith_v 22.09\nwatervar 1.2\n"));
        assert!(pars.contains("cloudmean0 0.1\ncloudmean1 0.05\nadd_background\n"));
        assert!(pars.contains("wavelength 0.62\n"));

        obs.tel_config = 2;
        let pars = background_pars(&obs, &names, &unit(0), "").unwrap();
        assert!(pars.contains("zenith_v 18.00\nfc_file filter_constants_dome\n"));

        obs.tel_config = 0;
        let err = background_pars(&obs, &names, &unit(0), "").unwrap_err();
        assert!(matches!(err, StageError::MissingParameter { .. }));
    }

    #[test]
    fn test_cosmic_and_e2adc_pars_chain_filenames() {
        let obs = obs();
        let names = ParsFilenames::new(&obs.observation_id);
        let cosmic = cosmic_pars(&obs, &names, &unit(0));
        assert!(cosmic.starts_with(
            "inputfilename ../Add_Background/fits_files/imsim_85748128_R22_S11_E000.fits\n\
             outputfilename output_85748128_R22_S11_E000.fits\n"
        ));
        assert!(cosmic.ends_with("createrays\n"));

        let e2adc = e2adc_pars(&obs, &names, &unit(0), None);
        assert!(e2adc.starts_with("inputfilename ../cosmic_rays/output_85748128_R22_S11_E000.fits\n"));
        assert!(e2adc.contains("outputpostfilename _E000\n"));
        assert!(e2adc.contains("qemapfilename ../../data/focal_plane/sta_misalignments/qe_maps/QE_R22_S11.fits.gz\n"));
        assert!(e2adc.ends_with("e2adc\n"));
    }

    #[test]
    fn test_visit_pars_end_with_command_word() {
        let obs = obs();
        let names = ParsFilenames::new(&obs.observation_id);
        let atmosphere = atmosphere_pars(&obs, &names);
        assert!(atmosphere.starts_with("outputfilename atmosphereraytrace_85748128.pars\nmonthnum 7\n"));
        assert!(atmosphere.ends_with("seed 1000\ncreateatmosphere\n"));
        assert!(control_pars(&obs, &names).ends_with("ranseed 1000\noptics_parameters\n"));
        assert_eq!(
            track_pars(&obs, &names),
            "outputfilename tracking_85748128.pars\nseed 1000\nstarttime -16.5\nendtime 16.5\ntracking\n"
        );
        let obs_body = obs_pars(&obs);
        assert!(obs_body.contains("filter 2\n"));
        assert!(obs_body.contains("obshistid 85748128\n"));
        assert!(obs_body.contains("seddir ../data/\n"));
    }

    #[test]
    fn test_screen_references() {
        let names = ParsFilenames::new("42");
        let atmosphere = atmosphere_screen_references(&names);
        assert_eq!(atmosphere.lines().count(), ATMOSPHERE_LAYERS as usize);
        assert!(atmosphere.starts_with("atmospherefile 0 ../atmospherescreen_42_0\n"));
        assert_eq!(
            cloud_screen_references(&names),
            "cloudfile 0 ../cloudscreen_42_0\ncloudfile 3 ../cloudscreen_42_3\n"
        );
    }

    #[test]
    fn test_sed_list_is_sorted_and_unique() {
        let catalog = "\
object 1 0 0 20 starSED/b.fits.gz 0
object 2 0 0 20 galaxySED/a.spec.gz 0
object 3 0 0 20 starSED/b.fits.gz 0
object 4 0 0 20 other/c.gz 0
lsst
";
        assert_eq!(sed_list(catalog), "galaxySED/a.spec.gz\nstarSED/b.fits.gz\n");
    }

    #[test]
    fn test_last_value() {
        assert_eq!(last_value(ATMOSPHERE_RAYTRACE, &["height", "3"]), Some("7.5"));
        assert_eq!(last_value(ATMOSPHERE_RAYTRACE, &["relh2o"]), Some("1.2"));
        assert_eq!(last_value(ATMOSPHERE_RAYTRACE, &["height", "5"]), None);
        assert_eq!(last_value("outerscale 1 2\nouterscale 1 4\n", &["outerscale", "1"]), Some("4"));
    }
}
