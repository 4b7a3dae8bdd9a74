use ndarray::{s, stack, Array3, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

use super::error::SinkError;
use super::lane::BoundingBox;
use super::stack_sink::{CroppedStack, LaneAttributes, StackSink, StoredLane};

/// Lane attributes kept as yaml in the ImageDescription of the first page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StackDescription {
    fov_id: u32,
    lane_id: u32,
    bbox: BoundingBox,
    plane: String,
    planes: Vec<String>,
    times: Vec<u32>,
}

/// The new content of one plane file, keyed by time index
#[derive(Debug)]
struct PlaneUpdate {
    path: PathBuf,
    description: StackDescription,
    pages: BTreeMap<u32, Vec<u16>>,
}

/// Writes one multi-page TIFF per (FOV, lane, plane), one page per time point.
///
/// Every commit reads the existing stacks, merges in the new time points, and rewrites
/// the files through temporary files. Pages are always stored in time order. The
/// temporary files of every plane are written before any of them is renamed into
/// place, so a commit which fails while writing leaves every plane as it was.
///
/// This costs O(n^2) in time points per lane over a run, but holds no file open
/// between commits and survives restarts: time points already on disk are skipped
/// plane by plane, and an unreadable leftover file is replaced.
#[derive(Debug, Clone)]
pub struct IncrementalSink {
    output_dir: PathBuf,
    experiment: String,
    fov: u32,
}

impl IncrementalSink {
    pub fn new(output_dir: &Path, experiment: &str, fov: u32) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            experiment: experiment.to_string(),
            fov,
        }
    }

    /// Path of the stack for one plane of one lane
    pub fn lane_path(&self, lane_id: u32, plane: usize) -> PathBuf {
        self.output_dir.join(format!(
            "{}_xy{:03}_p{:04}_c{}.tif",
            self.experiment,
            self.fov,
            lane_id,
            plane + 1
        ))
    }

    /// Read every plane of a lane back into one stack ordered by time.
    ///
    /// Fails with [`SinkError::PlaneTimesDiffer`] if the plane files do not hold the
    /// same time points.
    pub fn read_lane_stack(&self, lane_id: u32) -> Result<StoredLane, SinkError> {
        let (description, first) = read_plane_stack(&self.lane_path(lane_id, 0))?;
        let (times, first) = in_time_order(&description.times, first);
        let mut planes = vec![first];
        for idx in 1..description.planes.len() {
            let (other, pixels) = read_plane_stack(&self.lane_path(lane_id, idx))?;
            let (other_times, pixels) = in_time_order(&other.times, pixels);
            if other_times != times {
                return Err(SinkError::PlaneTimesDiffer {
                    lane: lane_id,
                    plane: idx,
                });
            }
            planes.push(pixels);
        }
        let views: Vec<_> = planes.iter().map(|p| p.view()).collect();
        let pixels = stack(Axis(3), &views)?;
        Ok(StoredLane {
            lane_id: description.lane_id,
            bbox: description.bbox,
            planes: description.planes,
            times,
            pixels,
        })
    }

    /// Merge the new time points of one plane into what is on disk. Returns `None`
    /// when the file already holds all of them.
    fn prepare_plane(
        &self,
        lane_id: u32,
        plane: usize,
        stack: &CroppedStack,
        attributes: &LaneAttributes,
    ) -> Result<Option<PlaneUpdate>, SinkError> {
        let path = self.lane_path(lane_id, plane);
        let previous = if path.exists() {
            match read_plane_stack(&path) {
                Ok(previous) => Some(previous),
                Err(e) => {
                    spdlog::warn!("Replacing unreadable stack {}: {}", path.display(), e);
                    None
                }
            }
        } else {
            None
        };

        let (description, mut pages) = match previous {
            Some((description, pixels)) => {
                let (_, rows, cols) = pixels.dim();
                if rows != stack.n_rows() || cols != stack.n_cols() {
                    return Err(SinkError::ShapeMismatch {
                        lane: lane_id,
                        found: vec![stack.n_rows(), stack.n_cols()],
                        expected: vec![rows, cols],
                    });
                }
                let pages: BTreeMap<u32, Vec<u16>> = description
                    .times
                    .iter()
                    .copied()
                    .zip(pixels.outer_iter().map(page_data))
                    .collect();
                (description, pages)
            }
            None => (
                StackDescription {
                    fov_id: self.fov,
                    lane_id,
                    bbox: attributes.bbox,
                    plane: attributes
                        .planes
                        .get(plane)
                        .cloned()
                        .unwrap_or_else(|| format!("c{}", plane + 1)),
                    planes: attributes.planes.clone(),
                    times: Vec::new(),
                },
                BTreeMap::new(),
            ),
        };

        let new_pixels = stack.plane(plane);
        let mut added = 0;
        for (idx, time) in stack.times.iter().enumerate() {
            if pages.contains_key(time) {
                continue;
            }
            pages.insert(*time, page_data(new_pixels.slice(s![idx, .., ..])));
            added += 1;
        }
        if added == 0 {
            spdlog::debug!("{} already holds every time point given", path.display());
            return Ok(None);
        }

        Ok(Some(PlaneUpdate {
            path,
            description: StackDescription {
                times: pages.keys().copied().collect(),
                ..description
            },
            pages,
        }))
    }
}

impl StackSink for IncrementalSink {
    fn commit(
        &mut self,
        fov_id: u32,
        lane_id: u32,
        stack: &CroppedStack,
        attributes: &LaneAttributes,
    ) -> Result<(), SinkError> {
        if fov_id != self.fov {
            return Err(SinkError::WrongFov {
                expected: self.fov,
                found: fov_id,
            });
        }
        let mut updates = Vec::with_capacity(stack.n_planes());
        for plane in 0..stack.n_planes() {
            if let Some(update) = self.prepare_plane(lane_id, plane, stack, attributes)? {
                updates.push(update);
            }
        }

        for (idx, update) in updates.iter().enumerate() {
            if let Err(e) = write_plane_tmp(update, stack.n_cols(), stack.n_rows()) {
                for written in updates[..=idx].iter() {
                    // The failed plane's temporary path may not be a file at all
                    std::fs::remove_file(tmp_path(&written.path)).ok();
                }
                return Err(e);
            }
        }
        for update in updates.iter() {
            std::fs::rename(tmp_path(&update.path), &update.path)?;
            let size = std::fs::metadata(&update.path)?.len();
            spdlog::debug!(
                "Wrote {} pages to {} ({})",
                update.pages.len(),
                update.path.display(),
                human_bytes::human_bytes(size as f64)
            );
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), SinkError> {
        Ok(())
    }

    /// Every commit is already in place, so there is nothing to hold back
    fn abandon(self: Box<Self>) -> Result<(), SinkError> {
        Ok(())
    }
}

fn page_data(page: ArrayView2<u16>) -> Vec<u16> {
    page.iter().copied().collect()
}

fn tmp_path(path: &Path) -> PathBuf {
    path.with_extension("tif.tmp")
}

/// Write the full new content of a plane stack next to it, ready to be renamed over it
fn write_plane_tmp(update: &PlaneUpdate, width: usize, height: usize) -> Result<(), SinkError> {
    let description_str = serde_yaml::to_string(&update.description)?;
    let mut file = File::create(tmp_path(&update.path))?;
    let mut encoder = TiffEncoder::new(&mut file)?;
    for (idx, page) in update.pages.values().enumerate() {
        let mut image = encoder.new_image::<colortype::Gray16>(width as u32, height as u32)?;
        if idx == 0 {
            image
                .encoder()
                .write_tag(Tag::ImageDescription, description_str.as_str())?;
        }
        image.write_data(page)?;
    }
    drop(encoder);
    file.sync_all()?;
    Ok(())
}

/// Read a plane stack as (page, row, column) along with its description
fn read_plane_stack(path: &Path) -> Result<(StackDescription, Array3<u16>), SinkError> {
    let mut decoder = Decoder::new(BufReader::new(File::open(path)?))?;
    let description: StackDescription = match decoder.get_tag_ascii_string(Tag::ImageDescription)
    {
        Ok(yaml_str) => serde_yaml::from_str(&yaml_str)?,
        Err(_) => return Err(SinkError::MissingAttributes(path.to_path_buf())),
    };

    let (width, height) = decoder.dimensions()?;
    let mut data: Vec<u16> = Vec::new();
    let mut n_pages = 0;
    loop {
        match decoder.read_image()? {
            DecodingResult::U16(page) => data.extend(page),
            _ => return Err(SinkError::MissingAttributes(path.to_path_buf())),
        }
        n_pages += 1;
        if !decoder.more_images() {
            break;
        }
        decoder.next_image()?;
    }
    // Every page needs exactly one time index
    if description.times.len() != n_pages {
        return Err(SinkError::MissingAttributes(path.to_path_buf()));
    }
    let pixels = Array3::from_shape_vec((n_pages, height as usize, width as usize), data)?;
    Ok((description, pixels))
}

/// Reorder pages so their time indices ascend
fn in_time_order(times: &[u32], pixels: Array3<u16>) -> (Vec<u32>, Array3<u16>) {
    let mut order: Vec<usize> = (0..times.len()).collect();
    order.sort_by_key(|&idx| times[idx]);
    if order.iter().enumerate().all(|(pos, &idx)| pos == idx) {
        return (times.to_vec(), pixels);
    }
    let sorted = order.iter().map(|&idx| times[idx]).collect();
    (sorted, pixels.select(Axis(0), &order))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3 as Frame3;

    fn attributes() -> LaneAttributes {
        LaneAttributes {
            bbox: BoundingBox::new(0, 4, 10, 13),
            planes: vec![String::from("phase"), String::from("gfp")],
        }
    }

    fn frame_stack(time: u32) -> CroppedStack {
        let cropped = Frame3::from_shape_fn((2, 4, 3), |(p, r, c)| {
            (time as usize * 1000 + p * 100 + r * 10 + c) as u16
        });
        CroppedStack::from_frame(time, cropped)
    }

    #[test]
    fn test_three_commits_append_one_stack() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = IncrementalSink::new(dir.path(), "exp", 1);
        for time in 0..3 {
            sink.commit(1, 42, &frame_stack(time), &attributes()).unwrap();
        }

        let tifs: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(tifs.len(), 2);
        assert!(sink.lane_path(42, 0).ends_with("exp_xy001_p0042_c1.tif"));

        let stored = sink.read_lane_stack(42).unwrap();
        assert_eq!(stored.times, vec![0, 1, 2]);
        assert_eq!(stored.pixels.dim(), (3, 4, 3, 2));
        assert_eq!(stored.lane_id, 42);
        assert_eq!(stored.bbox, attributes().bbox);
        assert_eq!(stored.planes, attributes().planes);
        for time in 0..3u32 {
            let expected = frame_stack(time);
            assert_eq!(
                stored.pixels.slice(s![time as usize..time as usize + 1, .., .., ..]),
                expected.pixels
            );
        }
    }

    #[test]
    fn test_recommit_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = IncrementalSink::new(dir.path(), "exp", 1);
        sink.commit(1, 7, &frame_stack(0), &attributes()).unwrap();
        sink.commit(1, 7, &frame_stack(0), &attributes()).unwrap();
        let stored = sink.read_lane_stack(7).unwrap();
        assert_eq!(stored.times, vec![0]);
    }

    #[test]
    fn test_partial_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = IncrementalSink::new(dir.path(), "exp", 1);
        std::fs::write(sink.lane_path(7, 0), b"half a tiff").unwrap();
        sink.commit(1, 7, &frame_stack(3), &attributes()).unwrap();
        let stored = sink.read_lane_stack(7).unwrap();
        assert_eq!(stored.times, vec![3]);
    }

    fn assert_matches_frames(stored: &StoredLane, times: &[u32]) {
        assert_eq!(stored.times, times);
        for (idx, time) in times.iter().enumerate() {
            assert_eq!(
                stored.pixels.slice(s![idx..idx + 1, .., .., ..]),
                frame_stack(*time).pixels
            );
        }
    }

    #[test]
    fn test_out_of_order_commits_are_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = IncrementalSink::new(dir.path(), "exp", 1);
        for time in [2, 0, 1] {
            sink.commit(1, 7, &frame_stack(time), &attributes()).unwrap();
        }
        let stored = sink.read_lane_stack(7).unwrap();
        assert_matches_frames(&stored, &[0, 1, 2]);
    }

    #[test]
    fn test_failed_plane_write_keeps_planes_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = IncrementalSink::new(dir.path(), "exp", 1);
        sink.commit(1, 7, &frame_stack(0), &attributes()).unwrap();

        // Block the second plane's temporary file so only the first plane can be written
        let blocker = tmp_path(&sink.lane_path(7, 1));
        std::fs::create_dir(&blocker).unwrap();
        assert!(sink.commit(1, 7, &frame_stack(1), &attributes()).is_err());
        assert!(!tmp_path(&sink.lane_path(7, 0)).exists());
        assert_matches_frames(&sink.read_lane_stack(7).unwrap(), &[0]);
        std::fs::remove_dir(&blocker).unwrap();

        sink.commit(1, 7, &frame_stack(2), &attributes()).unwrap();
        sink.commit(1, 7, &frame_stack(1), &attributes()).unwrap();
        assert_matches_frames(&sink.read_lane_stack(7).unwrap(), &[0, 1, 2]);
    }

    /// Write a plane file with pages in the given order
    fn write_plane_as(sink: &IncrementalSink, plane: usize, times: &[u32]) {
        let path = sink.lane_path(7, plane);
        let pages = times
            .iter()
            .enumerate()
            .map(|(pos, time)| {
                let pixels = frame_stack(*time).plane(plane).slice(s![0, .., ..]).to_owned();
                (pos as u32, page_data(pixels.view()))
            })
            .collect();
        let update = PlaneUpdate {
            path: path.clone(),
            description: StackDescription {
                fov_id: 1,
                lane_id: 7,
                bbox: attributes().bbox,
                plane: attributes().planes[plane].clone(),
                planes: attributes().planes,
                times: times.to_vec(),
            },
            pages,
        };
        write_plane_tmp(&update, 3, 4).unwrap();
        std::fs::rename(tmp_path(&path), &path).unwrap();
    }

    #[test]
    fn test_planes_are_matched_by_time_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let sink = IncrementalSink::new(dir.path(), "exp", 1);
        write_plane_as(&sink, 0, &[0, 1]);
        write_plane_as(&sink, 1, &[1, 0]);
        assert_matches_frames(&sink.read_lane_stack(7).unwrap(), &[0, 1]);

        write_plane_as(&sink, 1, &[1]);
        assert!(matches!(
            sink.read_lane_stack(7),
            Err(SinkError::PlaneTimesDiffer { lane: 7, plane: 1 })
        ));
    }

    #[test]
    fn test_rejects_other_fov_and_shape() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = IncrementalSink::new(dir.path(), "exp", 1);
        assert!(matches!(
            sink.commit(2, 7, &frame_stack(0), &attributes()),
            Err(SinkError::WrongFov { .. })
        ));
        sink.commit(1, 7, &frame_stack(0), &attributes()).unwrap();
        let wider = CroppedStack::from_frame(1, Frame3::zeros((2, 4, 5)));
        assert!(matches!(
            sink.commit(1, 7, &wider, &attributes()),
            Err(SinkError::ShapeMismatch { .. })
        ));
    }
}
