use std::path::PathBuf;
use thiserror::Error;

use super::worker_status::WorkerStatus;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config produced an invalid file name pattern: {0}")]
    PatternError(#[from] regex::Error),
    #[error("Config has an invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

#[derive(Debug, Error)]
pub enum FrameReadError {
    #[error("Could not read frame because file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Frame file name {0} does not encode a time point and FOV")]
    BadFileName(String),
    #[error("Frame read failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Frame read failed due to TIFF error: {0}")]
    TiffError(#[from] tiff::TiffError),
    #[error("Frame has unsupported sample format {0}")]
    UnsupportedFormat(String),
    #[error("Frame plane {plane} has shape {found:?}; expected {expected:?}")]
    InconsistentPlanes {
        plane: usize,
        found: (usize, usize),
        expected: (usize, usize),
    },
    #[error("Frame contains no image data")]
    EmptyFrame,
    #[error("Frame data could not be shaped into planes: {0}")]
    ShapeError(#[from] ndarray::ShapeError),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("StackSink failed due to HDF5 error: {0}")]
    HDF5Error(#[from] hdf5::Error),
    #[error("StackSink failed due to TIFF error: {0}")]
    TiffError(#[from] tiff::TiffError),
    #[error("StackSink failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("StackSink failed to convert lane attributes to yaml: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("StackSink failed to encode a string attribute: {0}")]
    StringError(#[from] hdf5::types::StringError),
    #[error("StackSink failed to shape stack data: {0}")]
    ShapeError(#[from] ndarray::ShapeError),
    #[error("Stack for lane {lane} has shape {found:?}, but the stored stack has shape {expected:?}")]
    ShapeMismatch {
        lane: u32,
        found: Vec<usize>,
        expected: Vec<usize>,
    },
    #[error("Sink for FOV {expected} received a commit for FOV {found}")]
    WrongFov { expected: u32, found: u32 },
    #[error("Stack file {0:?} is missing its lane attributes")]
    MissingAttributes(PathBuf),
    #[error("Plane {plane} of lane {lane} holds other time points than the first plane")]
    PlaneTimesDiffer { lane: u32, plane: usize },
    #[error("Stack file {0:?} does not contain lane {1}")]
    MissingLane(PathBuf, u32),
    #[error("Writer for FOV {0} stopped before the commit was applied")]
    WriterGone(u32),
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Could not load snapshot because file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Snapshot failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Snapshot failed to convert yaml: {0}")]
    ParsingError(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Processor failed due to Snapshot error: {0}")]
    SnapshotError(#[from] SnapshotError),
    #[error("Processor failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<WorkerStatus>),
    #[error("Processor failed due to IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Processor failed to join a {0} worker")]
    WorkerPanic(&'static str),
}
