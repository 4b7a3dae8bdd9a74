use hdf5::types::VarLenUnicode;
use hdf5::{Dataset, File};
use ndarray::{s, stack, Array3, Axis};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::error::SinkError;
use super::frame::StagePosition;
use super::lane::BoundingBox;
use super::stack_sink::{CroppedStack, FovHeader, LaneAttributes, StackSink, StoredLane};

const PARTIAL_EXTENSION: &str = "h5.partial";
const TIMES_NAME: &str = "times";

/// The datasets of one lane, created on its first commit
#[derive(Debug)]
struct LaneDatasets {
    planes: Vec<Dataset>,
    times: Dataset,
    rows: usize,
    cols: usize,
    length: usize,
}

impl LaneDatasets {
    fn resize(&self, length: usize) -> Result<(), SinkError> {
        for plane in self.planes.iter() {
            plane.resize((length, self.rows, self.cols))?;
        }
        self.times.resize((length,))?;
        Ok(())
    }
}

/// Writes every lane of one FOV into a single HDF5 file.
///
/// The file is written under a `.h5.partial` name and only renamed to its final
/// name by [`StackSink::finish`]. [`StackSink::abandon`] keeps the partial name, so an
/// interrupted run never leaves a file which looks complete or replaces one which is.
/// A lane's datasets are extended along time on every commit.
#[derive(Debug)]
pub struct MonolithicSink {
    file_handle: File,
    partial_path: PathBuf,
    final_path: PathBuf,
    fov: u32,
    compression_level: u8,
    lanes: BTreeMap<u32, LaneDatasets>,
}
// Structure
// <experiment>_xy<FOV>.h5 - fov_id, stage_x, stage_y, frame_shape, planes, lane_ids
// |---- lane_<id> - lane_id, bbox
// |    |---- c1(dset) - plane
// |    |---- c2(dset) - plane
// |    |---- times(dset)

impl MonolithicSink {
    pub fn file_name(experiment: &str, fov: u32) -> String {
        format!("{}_xy{:03}.h5", experiment, fov)
    }

    /// Create the partial file at `<path>.partial` and write the FOV attributes
    pub fn create(path: &Path, header: &FovHeader, compression_level: u8) -> Result<Self, SinkError> {
        let partial_path = path.with_extension(PARTIAL_EXTENSION);
        // A stale partial file from an earlier run is simply truncated
        let file_handle = File::create(&partial_path)?;

        let (stage_x, stage_y) = match header.stage {
            Some(StagePosition { x, y }) => (x, y),
            None => (f64::NAN, f64::NAN),
        };
        file_handle
            .new_attr::<u32>()
            .create("fov_id")?
            .write_scalar(&header.fov)?;
        file_handle
            .new_attr::<f64>()
            .create("stage_x")?
            .write_scalar(&stage_x)?;
        file_handle
            .new_attr::<f64>()
            .create("stage_y")?
            .write_scalar(&stage_y)?;
        let frame_shape = [header.frame_shape.0 as u64, header.frame_shape.1 as u64];
        file_handle
            .new_attr::<u64>()
            .shape(2)
            .create("frame_shape")?
            .write_raw(&frame_shape)?;
        let planes = header
            .planes
            .iter()
            .map(|p| VarLenUnicode::from_str(p))
            .collect::<Result<Vec<_>, _>>()?;
        file_handle
            .new_attr::<VarLenUnicode>()
            .shape(planes.len())
            .create("planes")?
            .write_raw(&planes)?;
        let mut lane_ids = header.lane_ids.clone();
        lane_ids.sort_unstable();
        file_handle
            .new_attr::<u32>()
            .shape(lane_ids.len())
            .create("lane_ids")?
            .write_raw(&lane_ids)?;

        spdlog::info!("Opened {} for FOV {}", partial_path.display(), header.fov);
        Ok(Self {
            file_handle,
            partial_path,
            final_path: path.to_path_buf(),
            fov: header.fov,
            compression_level,
            lanes: BTreeMap::new(),
        })
    }

    fn create_lane(
        &self,
        lane_id: u32,
        stack: &CroppedStack,
        attributes: &LaneAttributes,
    ) -> Result<LaneDatasets, SinkError> {
        let (rows, cols) = (stack.n_rows(), stack.n_cols());
        let group = self.file_handle.create_group(&lane_group_name(lane_id))?;
        group
            .new_attr::<u32>()
            .create("lane_id")?
            .write_scalar(&lane_id)?;
        group
            .new_attr::<i32>()
            .shape(4)
            .create("bbox")?
            .write_raw(&attributes.bbox.as_array())?;

        let mut planes = Vec::with_capacity(stack.n_planes());
        for idx in 0..stack.n_planes() {
            let dset = group
                .new_dataset::<u16>()
                .shape((0.., rows, cols))
                .chunk((1, rows, cols))
                .deflate(self.compression_level)
                .fletcher32()
                .create(plane_dataset_name(idx).as_str())?;
            let name = match attributes.planes.get(idx) {
                Some(name) => name.clone(),
                None => plane_dataset_name(idx),
            };
            dset.new_attr::<VarLenUnicode>()
                .create("plane")?
                .write_scalar(&VarLenUnicode::from_str(&name)?)?;
            planes.push(dset);
        }
        let times = group
            .new_dataset::<u32>()
            .shape(0..)
            .chunk(1024)
            .create(TIMES_NAME)?;

        Ok(LaneDatasets {
            planes,
            times,
            rows,
            cols,
            length: 0,
        })
    }

    fn append(lane: &LaneDatasets, stack: &CroppedStack) -> Result<(), SinkError> {
        let start = lane.length;
        let end = start + stack.n_times();
        lane.resize(end)?;
        for (idx, dset) in lane.planes.iter().enumerate() {
            let plane = stack.plane(idx).as_standard_layout().into_owned();
            dset.write_slice(&plane, s![start..end, .., ..])?;
        }
        lane.times.write_slice(&stack.times, s![start..end])?;
        Ok(())
    }

    /// Read one lane back as a (time, row, column, plane) stack
    pub fn read_lane_stack(path: &Path, lane_id: u32) -> Result<StoredLane, SinkError> {
        let file = File::open(path)?;
        let group = file
            .group(&lane_group_name(lane_id))
            .map_err(|_| SinkError::MissingLane(path.to_path_buf(), lane_id))?;
        let bbox = BoundingBox::from_array(&group.attr("bbox")?.read_raw::<i32>()?)
            .ok_or_else(|| SinkError::MissingAttributes(path.to_path_buf()))?;
        let stored_id = group.attr("lane_id")?.read_scalar::<u32>()?;
        let times = group.dataset(TIMES_NAME)?.read_raw::<u32>()?;

        let mut planes: Vec<String> = Vec::new();
        let mut data: Vec<Array3<u16>> = Vec::new();
        for idx in 0.. {
            let Ok(dset) = group.dataset(&plane_dataset_name(idx)) else {
                break;
            };
            let name = dset.attr("plane")?.read_scalar::<VarLenUnicode>()?;
            planes.push(name.as_str().to_string());
            data.push(dset.read::<u16, ndarray::Ix3>()?);
        }
        if data.is_empty() {
            return Err(SinkError::MissingLane(path.to_path_buf(), lane_id));
        }
        let views: Vec<_> = data.iter().map(|d| d.view()).collect();
        let pixels = stack(Axis(3), &views)?;
        Ok(StoredLane {
            lane_id: stored_id,
            bbox,
            planes,
            times,
            pixels,
        })
    }

    /// Read the FOV-level attributes of a finished file
    pub fn read_fov_header(path: &Path) -> Result<FovHeader, SinkError> {
        let file = File::open(path)?;
        let fov = file.attr("fov_id")?.read_scalar::<u32>()?;
        let stage_x = file.attr("stage_x")?.read_scalar::<f64>()?;
        let stage_y = file.attr("stage_y")?.read_scalar::<f64>()?;
        let frame_shape = file.attr("frame_shape")?.read_raw::<u64>()?;
        if frame_shape.len() != 2 {
            return Err(SinkError::MissingAttributes(path.to_path_buf()));
        }
        let planes = file
            .attr("planes")?
            .read_raw::<VarLenUnicode>()?
            .iter()
            .map(|p| p.as_str().to_string())
            .collect();
        let lane_ids = file.attr("lane_ids")?.read_raw::<u32>()?;
        let stage = if stage_x.is_nan() || stage_y.is_nan() {
            None
        } else {
            Some(StagePosition {
                x: stage_x,
                y: stage_y,
            })
        };
        Ok(FovHeader {
            fov,
            stage,
            frame_shape: (frame_shape[0] as usize, frame_shape[1] as usize),
            planes,
            lane_ids,
        })
    }
}

impl StackSink for MonolithicSink {
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
        if !self.lanes.contains_key(&lane_id) {
            match self.create_lane(lane_id, stack, attributes) {
                Ok(lane) => {
                    self.lanes.insert(lane_id, lane);
                }
                Err(e) => {
                    // Drop the half-built group so the next commit can start over
                    let name = lane_group_name(lane_id);
                    if self.file_handle.link_exists(&name) {
                        if let Err(unlink) = self.file_handle.unlink(&name) {
                            spdlog::error!(
                                "FOV {} lane {}: could not remove incomplete lane group: {}",
                                self.fov,
                                lane_id,
                                unlink
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }
        let Some(lane) = self.lanes.get_mut(&lane_id) else {
            return Err(SinkError::MissingLane(self.partial_path.clone(), lane_id));
        };
        if lane.rows != stack.n_rows()
            || lane.cols != stack.n_cols()
            || lane.planes.len() != stack.n_planes()
        {
            return Err(SinkError::ShapeMismatch {
                lane: lane_id,
                found: vec![stack.n_rows(), stack.n_cols(), stack.n_planes()],
                expected: vec![lane.rows, lane.cols, lane.planes.len()],
            });
        }

        match Self::append(lane, stack) {
            Ok(()) => {
                lane.length += stack.n_times();
                Ok(())
            }
            Err(e) => {
                // Drop whatever part of the commit landed
                if let Err(rollback) = lane.resize(lane.length) {
                    spdlog::error!(
                        "FOV {} lane {}: could not roll back failed commit: {}",
                        self.fov,
                        lane_id,
                        rollback
                    );
                }
                Err(e)
            }
        }
    }

    fn abandon(self: Box<Self>) -> Result<(), SinkError> {
        let Self {
            file_handle,
            partial_path,
            fov,
            lanes,
            ..
        } = *self;
        let n_slices: usize = lanes.values().map(|l| l.length).sum();
        drop(lanes);
        file_handle.flush()?;
        file_handle.close()?;
        spdlog::warn!(
            "FOV {}: left {} lane slices in incomplete file {}",
            fov,
            n_slices,
            partial_path.display()
        );
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), SinkError> {
        let Self {
            file_handle,
            partial_path,
            final_path,
            fov,
            lanes,
            ..
        } = *self;
        let n_slices: usize = lanes.values().map(|l| l.length).sum();
        drop(lanes);
        file_handle.flush()?;
        file_handle.close()?;
        std::fs::rename(&partial_path, &final_path)?;
        let size = std::fs::metadata(&final_path)?.len();
        spdlog::info!(
            "FOV {}: wrote {} lane slices to {} ({})",
            fov,
            n_slices,
            final_path.display(),
            human_bytes::human_bytes(size as f64)
        );
        Ok(())
    }
}

fn lane_group_name(lane_id: u32) -> String {
    format!("lane_{:04}", lane_id)
}

fn plane_dataset_name(idx: usize) -> String {
    format!("c{}", idx + 1)
}
