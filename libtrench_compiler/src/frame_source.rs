use ndarray::Array3;
use regex::Regex;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;
use tiff::ColorType;
use time::macros::format_description;
use time::PrimitiveDateTime;

use super::config::{name_planes, Config};
use super::error::{ConfigError, FrameReadError};
use super::frame::{Frame, FrameMetadata, StagePosition};

/// Julian date of the unix epoch
const UNIX_EPOCH_JD: f64 = 2_440_587.5;
const SECONDS_PER_DAY: f64 = 86_400.0;

/// Anything which can turn a file path into a canonical (plane, row, column) frame.
///
/// Implementations must be safe to call from several workers at once.
pub trait FrameSource: Sync {
    fn read_frame(&self, path: &Path) -> Result<Frame, FrameReadError>;
}

/// Reads per-frame TIFF files where every page is one imaging plane.
///
/// The FOV and time point are encoded in the file name as `<experiment>_t<NNNN>xy<FOV>`.
#[derive(Debug, Clone)]
pub struct TiffFrameSource {
    name_pattern: Regex,
    plane_names: Vec<String>,
}

impl TiffFrameSource {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let name_pattern = Regex::new(&format!(
            r"^{}.*_t(\d+)xy(\d+)",
            regex::escape(&config.experiment_name)
        ))?;
        Ok(Self {
            name_pattern,
            plane_names: config.plane_names.clone(),
        })
    }

    /// Pull the (fov, time) pair out of a frame file name
    pub fn parse_file_name(&self, path: &Path) -> Result<(u32, u32), FrameReadError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let bad_name = || FrameReadError::BadFileName(name.clone());
        let captures = self.name_pattern.captures(&name).ok_or_else(bad_name)?;
        let time = captures[1].parse::<u32>().map_err(|_| bad_name())?;
        let fov = captures[2].parse::<u32>().map_err(|_| bad_name())?;
        Ok((fov, time))
    }
}

impl FrameSource for TiffFrameSource {
    fn read_frame(&self, path: &Path) -> Result<Frame, FrameReadError> {
        if !path.exists() {
            return Err(FrameReadError::BadFilePath(path.to_path_buf()));
        }
        let (fov, time) = self.parse_file_name(path)?;

        let mut decoder = Decoder::new(BufReader::new(File::open(path)?))?;
        let timestamp = decoder
            .get_tag_ascii_string(Tag::DateTime)
            .ok()
            .and_then(|s| parse_julian_date(&s));
        let stage = decoder
            .get_tag_ascii_string(Tag::ImageDescription)
            .ok()
            .and_then(|s| parse_stage_position(&s));

        let mut planes: Vec<u16> = Vec::new();
        let mut n_planes = 0;
        let mut expected: Option<(usize, usize)> = None;
        loop {
            let (width, height) = decoder.dimensions()?;
            let shape = (height as usize, width as usize);
            match expected {
                Some(exp) if exp != shape => {
                    return Err(FrameReadError::InconsistentPlanes {
                        plane: n_planes,
                        found: shape,
                        expected: exp,
                    })
                }
                _ => expected = Some(shape),
            }

            let color = decoder.colortype()?;
            match (color, decoder.read_image()?) {
                (ColorType::Gray(8), DecodingResult::U8(data)) => {
                    planes.extend(data.into_iter().map(u16::from))
                }
                (ColorType::Gray(16), DecodingResult::U16(data)) => planes.extend(data),
                (color, _) => return Err(FrameReadError::UnsupportedFormat(format!("{color:?}"))),
            }
            n_planes += 1;

            if !decoder.more_images() {
                break;
            }
            decoder.next_image()?;
        }

        let (height, width) = expected.ok_or(FrameReadError::EmptyFrame)?;
        if height == 0 || width == 0 {
            return Err(FrameReadError::EmptyFrame);
        }
        let pixels = Array3::from_shape_vec((n_planes, height, width), planes)?;

        Ok(Frame {
            metadata: FrameMetadata {
                path: path.to_path_buf(),
                fov,
                time,
                timestamp,
                stage,
                planes: name_planes(&self.plane_names, n_planes),
                shape: (n_planes, height, width),
            },
            pixels,
        })
    }
}

/// Convert a TIFF DateTime string (`YYYY:MM:DD HH:MM:SS`) into a Julian date
pub fn parse_julian_date(value: &str) -> Option<f64> {
    let format = format_description!("[year]:[month]:[day] [hour]:[minute]:[second]");
    let datetime = PrimitiveDateTime::parse(value.trim_end_matches('\0').trim(), &format).ok()?;
    Some(datetime.assume_utc().unix_timestamp() as f64 / SECONDS_PER_DAY + UNIX_EPOCH_JD)
}

/// Look for `x=<um>` and `y=<um>` tokens in an image description
pub fn parse_stage_position(description: &str) -> Option<StagePosition> {
    let mut x = None;
    let mut y = None;
    for token in description.split(|c: char| c.is_whitespace() || c == ',' || c == ';') {
        if let Some(value) = token.strip_prefix("x=") {
            x = value.parse::<f64>().ok();
        } else if let Some(value) = token.strip_prefix("y=") {
            y = value.parse::<f64>().ok();
        }
    }
    Some(StagePosition { x: x?, y: y? })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiff::encoder::{colortype, TiffEncoder};

    fn write_test_tiff(path: &Path, planes: &[Vec<u16>], width: u32, height: u32) {
        let mut file = File::create(path).unwrap();
        let mut encoder = TiffEncoder::new(&mut file).unwrap();
        for (idx, plane) in planes.iter().enumerate() {
            let mut image = encoder
                .new_image::<colortype::Gray16>(width, height)
                .unwrap();
            if idx == 0 {
                image
                    .encoder()
                    .write_tag(Tag::DateTime, "2000:01:01 12:00:00")
                    .unwrap();
                image
                    .encoder()
                    .write_tag(Tag::ImageDescription, "x=1520.5 y=-33.25")
                    .unwrap();
            }
            image.write_data(plane).unwrap();
        }
    }

    fn test_source(name: &str) -> TiffFrameSource {
        let config = Config {
            experiment_name: String::from(name),
            plane_names: vec![String::from("phase")],
            ..Default::default()
        };
        TiffFrameSource::new(&config).unwrap()
    }

    #[test]
    fn test_parse_file_name() {
        let source = test_source("exp");
        assert_eq!(
            source
                .parse_file_name(Path::new("/data/exp_t0012xy003.tif"))
                .unwrap(),
            (3, 12)
        );
        assert!(matches!(
            source.parse_file_name(Path::new("/data/exp_0012.tif")),
            Err(FrameReadError::BadFileName(_))
        ));
        assert!(source
            .parse_file_name(Path::new("/data/other_t0001xy01.tif"))
            .is_err());
    }

    #[test]
    fn test_julian_date() {
        // J2000.0 epoch
        let jd = parse_julian_date("2000:01:01 12:00:00").unwrap();
        assert!((jd - 2_451_545.0).abs() < 1e-9);
        assert!(parse_julian_date("not a date").is_none());
    }

    #[test]
    fn test_stage_position() {
        let stage = parse_stage_position("x=10.5, y=-2").unwrap();
        assert_eq!(stage, StagePosition { x: 10.5, y: -2.0 });
        assert!(parse_stage_position("x=10.5").is_none());
    }

    #[test]
    fn test_read_multi_plane_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exp_t0004xy02.tif");
        let phase: Vec<u16> = (0..12).collect();
        let fluor: Vec<u16> = (100..112).collect();
        write_test_tiff(&path, &[phase, fluor], 4, 3);

        let frame = test_source("exp").read_frame(&path).unwrap();
        assert_eq!(frame.metadata.fov, 2);
        assert_eq!(frame.metadata.time, 4);
        assert_eq!(frame.metadata.shape, (2, 3, 4));
        assert_eq!(frame.metadata.planes, vec!["phase", "c2"]);
        assert_eq!(
            frame.metadata.stage,
            Some(StagePosition {
                x: 1520.5,
                y: -33.25
            })
        );
        assert!((frame.metadata.timestamp.unwrap() - 2_451_545.0).abs() < 1e-9);
        assert_eq!(frame.pixels[[0, 1, 2]], 6);
        assert_eq!(frame.pixels[[1, 2, 3]], 111);
    }

    #[test]
    fn test_unreadable_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exp_t0001xy01.tif");
        std::fs::write(&path, b"definitely not a tiff").unwrap();
        let source = test_source("exp");
        assert!(source.read_frame(&path).is_err());
        assert!(matches!(
            source.read_frame(&dir.path().join("exp_t0002xy01.tif")),
            Err(FrameReadError::BadFilePath(_))
        ));
    }
}
