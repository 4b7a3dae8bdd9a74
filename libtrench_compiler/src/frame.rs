use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Stage position of an FOV in micrometers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StagePosition {
    pub x: f64,
    pub y: f64,
}

/// Everything known about a frame besides its pixels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    pub path: PathBuf,
    pub fov: u32,
    pub time: u32,
    /// Acquisition time as a Julian date
    pub timestamp: Option<f64>,
    pub stage: Option<StagePosition>,
    pub planes: Vec<String>,
    /// (planes, height, width)
    pub shape: (usize, usize, usize),
}

impl FrameMetadata {
    pub fn height(&self) -> usize {
        self.shape.1
    }

    pub fn width(&self) -> usize {
        self.shape.2
    }
}

/// A canonical frame: pixels are (plane, row, column)
#[derive(Debug, Clone)]
pub struct Frame {
    pub metadata: FrameMetadata,
    pub pixels: Array3<u16>,
}
