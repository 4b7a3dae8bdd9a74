use ndarray::{Array3, Array4, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

use super::config::{Config, OutputMode};
use super::error::SinkError;
use super::frame::StagePosition;
use super::hdf_writer::MonolithicSink;
use super::lane::BoundingBox;
use super::tiff_writer::IncrementalSink;

/// Cropped pixels of one lane, (time, row, column, plane), with the time index of each slice
#[derive(Debug, Clone, PartialEq)]
pub struct CroppedStack {
    pub times: Vec<u32>,
    pub pixels: Array4<u16>,
}

impl CroppedStack {
    /// Wrap a single cropped (plane, row, column) frame as a one-slice stack
    pub fn from_frame(time: u32, cropped: Array3<u16>) -> Self {
        let pixels = cropped.permuted_axes([1, 2, 0]).insert_axis(Axis(0));
        Self {
            times: vec![time],
            pixels: pixels.as_standard_layout().into_owned(),
        }
    }

    pub fn n_times(&self) -> usize {
        self.pixels.len_of(Axis(0))
    }

    pub fn n_rows(&self) -> usize {
        self.pixels.len_of(Axis(1))
    }

    pub fn n_cols(&self) -> usize {
        self.pixels.len_of(Axis(2))
    }

    pub fn n_planes(&self) -> usize {
        self.pixels.len_of(Axis(3))
    }

    /// The (time, row, column) stack of one plane
    pub fn plane(&self, index: usize) -> ArrayView3<u16> {
        self.pixels.index_axis(Axis(3), index)
    }
}

/// Attributes recorded once per lane alongside its stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneAttributes {
    pub bbox: BoundingBox,
    pub planes: Vec<String>,
}

/// FOV-wide information written when an FOV output is created
#[derive(Debug, Clone, PartialEq)]
pub struct FovHeader {
    pub fov: u32,
    pub stage: Option<StagePosition>,
    pub frame_shape: (usize, usize),
    pub planes: Vec<String>,
    pub lane_ids: Vec<u32>,
}

/// A lane stack as read back from either output format
#[derive(Debug, Clone, PartialEq)]
pub struct StoredLane {
    pub lane_id: u32,
    pub bbox: BoundingBox,
    pub planes: Vec<String>,
    pub times: Vec<u32>,
    /// (time, row, column, plane)
    pub pixels: Array4<u16>,
}

/// Persists cropped lane stacks.
///
/// Both output formats implement this; which one is used is decided once per run
/// by [`OutputMode`]. A sink is owned by a single writer, so `commit` takes `&mut self`.
pub trait StackSink: Send {
    /// Append the stack of one lane. A failed commit leaves no partial time slices behind.
    fn commit(
        &mut self,
        fov_id: u32,
        lane_id: u32,
        stack: &CroppedStack,
        attributes: &LaneAttributes,
    ) -> Result<(), SinkError>;

    /// Flush and close whatever the sink holds open, publishing the output as complete
    fn finish(self: Box<Self>) -> Result<(), SinkError>;

    /// Flush and close without publishing, for a run which stopped before every
    /// frame was committed. Output of an earlier complete run is left untouched.
    fn abandon(self: Box<Self>) -> Result<(), SinkError>;
}

/// Open the sink for one FOV according to the configured output mode
pub fn open_sink(config: &Config, header: &FovHeader) -> Result<Box<dyn StackSink>, SinkError> {
    let output_dir = config.get_output_directory();
    match config.output_mode {
        OutputMode::Incremental => Ok(Box::new(IncrementalSink::new(
            &output_dir,
            &config.experiment_name,
            header.fov,
        ))),
        OutputMode::Monolithic => {
            let path = output_dir.join(MonolithicSink::file_name(
                &config.experiment_name,
                header.fov,
            ));
            Ok(Box::new(MonolithicSink::create(
                &path,
                header,
                config.compression_level,
            )?))
        }
    }
}
