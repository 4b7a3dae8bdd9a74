use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::error::ConfigError;

const CHANNELS_DIR: &str = "channels";
const HDF_DIR: &str = "hdf5";
const METADATA_SNAPSHOT: &str = "frame_metadata.yml";
const MASKS_SNAPSHOT: &str = "channel_masks.yml";

/// Name `n_planes` planes from a configured list, falling back to c1, c2, ...
pub fn name_planes(configured: &[String], n_planes: usize) -> Vec<String> {
    (0..n_planes)
        .map(|idx| match configured.get(idx) {
            Some(name) => name.clone(),
            None => format!("c{}", idx + 1),
        })
        .collect()
}

/// Which persistent representation the sliced stacks are written to.
///
/// Chosen once per run; the two are never mixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// One TIFF stack per (FOV, lane, plane), grown by read-append-rewrite
    Incremental,
    /// One HDF5 file per FOV with appendable per-lane datasets
    Monolithic,
}

/// Whether lanes appear brighter or darker than the background in the reference plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    Bright,
    Dark,
}

/// Parameters of the per-frame lane detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneParams {
    pub min_width: usize,
    pub max_width: usize,
    pub threshold_fraction: f64,
    pub min_contrast: f64,
    pub spacing_tolerance: f64,
    pub id_grid: u32,
    pub polarity: Polarity,
}

impl Default for LaneParams {
    fn default() -> Self {
        Self {
            min_width: 8,
            max_width: 40,
            threshold_fraction: 0.5,
            min_contrast: 10.0,
            spacing_tolerance: 0.5,
            id_grid: 1,
            polarity: Polarity::Bright,
        }
    }
}

/// Parameters of the per-FOV consensus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusParams {
    pub tolerance: u32,
    pub min_observation_fraction: f64,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            tolerance: 5,
            min_observation_fraction: 0.5,
        }
    }
}

/// Structure representing the application configuration. Contains pathing and detection parameters.
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub experiment_name: String,
    pub image_path: PathBuf,
    pub analysis_path: PathBuf,
    pub output_mode: OutputMode,
    #[serde(default)]
    pub plane_names: Vec<String>,
    #[serde(default)]
    pub lanes: LaneParams,
    #[serde(default)]
    pub consensus: ConsensusParams,
    pub compression_level: u8,
    pub n_threads: Option<usize>,
    #[serde(default)]
    pub reuse_metadata: bool,
    #[serde(default)]
    pub reuse_masks: bool,
}

impl Default for Config {
    /// Generate a new Config object. Paths will be empty/invalid
    fn default() -> Self {
        Self {
            experiment_name: String::from(""),
            image_path: PathBuf::from("None"),
            analysis_path: PathBuf::from("None"),
            output_mode: OutputMode::Monolithic,
            plane_names: vec![String::from("c1")],
            lanes: LaneParams::default(),
            consensus: ConsensusParams::default(),
            compression_level: 4,
            n_threads: None,
            reuse_metadata: false,
            reuse_masks: false,
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Check the values which would otherwise fail deep inside a run
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.image_path.exists() {
            return Err(ConfigError::BadFilePath(self.image_path.clone()));
        }
        if self.n_threads == Some(0) {
            return Err(ConfigError::InvalidValue(
                "n_threads",
                String::from("must be at least 1"),
            ));
        }
        if self.lanes.min_width == 0 || self.lanes.min_width > self.lanes.max_width {
            return Err(ConfigError::InvalidValue(
                "lanes",
                format!(
                    "min_width {} must be nonzero and no larger than max_width {}",
                    self.lanes.min_width, self.lanes.max_width
                ),
            ));
        }
        if self.lanes.id_grid == 0 {
            return Err(ConfigError::InvalidValue(
                "lanes.id_grid",
                String::from("must be at least 1"),
            ));
        }
        let fraction = self.consensus.min_observation_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(ConfigError::InvalidValue(
                "consensus.min_observation_fraction",
                format!("{fraction} is outside (0, 1]"),
            ));
        }
        if self.compression_level > 9 {
            return Err(ConfigError::InvalidValue(
                "compression_level",
                format!("{} is larger than 9", self.compression_level),
            ));
        }
        Ok(())
    }

    /// Create the analysis directory and the output directory of the selected mode
    pub fn create_output_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.analysis_path)?;
        std::fs::create_dir_all(self.get_output_directory())?;
        Ok(())
    }

    /// Get the directory the sliced stacks are written to
    pub fn get_output_directory(&self) -> PathBuf {
        match self.output_mode {
            OutputMode::Incremental => self.analysis_path.join(CHANNELS_DIR),
            OutputMode::Monolithic => self.analysis_path.join(HDF_DIR),
        }
    }

    pub fn get_metadata_snapshot_path(&self) -> PathBuf {
        self.analysis_path.join(METADATA_SNAPSHOT)
    }

    pub fn get_masks_snapshot_path(&self) -> PathBuf {
        self.analysis_path.join(MASKS_SNAPSHOT)
    }

    /// Name the planes of a frame, falling back to c1, c2, ... where the config has no name
    pub fn get_plane_names(&self, n_planes: usize) -> Vec<String> {
        name_planes(&self.plane_names, n_planes)
    }

    /// Number of workers to use for each phase.
    ///
    /// Without an override one core is left free for the writer threads.
    pub fn get_n_workers(&self) -> usize {
        if let Some(n) = self.n_threads {
            return n.max(1);
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        cores.saturating_sub(1).max(1)
    }

    /// Find the frame files belonging to this experiment, sorted by name
    pub fn get_frame_files(&self) -> Result<Vec<PathBuf>, ConfigError> {
        if !self.image_path.exists() {
            return Err(ConfigError::BadFilePath(self.image_path.clone()));
        }
        let mut file_list: Vec<PathBuf> = Vec::new();
        for item in self.image_path.read_dir()? {
            let item_path = item?.path();
            let Some(name) = item_path.file_name().map(|n| n.to_string_lossy().to_string())
            else {
                continue;
            };
            let is_tiff = name.ends_with(".tif") || name.ends_with(".tiff");
            if is_tiff && name.starts_with(&self.experiment_name) {
                file_list.push(item_path);
            }
        }
        file_list.sort();
        Ok(file_list)
    }
}
