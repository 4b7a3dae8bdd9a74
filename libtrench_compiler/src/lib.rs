//! # trench_compiler
//!
//! trench_compiler turns a time series of multi-plane microscopy images of mother machine
//! style devices into per-lane time stacks. Every field of view (FOV) contains many parallel
//! trenches ("lanes"). trench_compiler finds the lanes in every frame, agrees on one stable
//! lane layout per FOV, and slices every frame of the FOV against that layout, writing one
//! stack per lane.
//!
//! ## Installation
//!
//! Currently the only method of install is from source, which is laid out below.
//!
//! ### HDF5
//!
//! Before building and running trench_compiler, HDF5 must be installed. Typically this will
//! be installed using a package manager (homebrew, apt, etc), and the Rust libraries will
//! auto detect the location of the HDF install. If HDF5 is installed to a custom location,
//! write the following snippet into the file `.cargo/config.toml` in the repository:
//!
//! ```toml
//! [env]
//! HDF5_DIR="/path/to/my/hdf5/install/"
//!
//! [build]
//! rustflags="-C link-args=-Wl,-rpath,/path/to/my/hdf5/install/lib"
//! ```
//!
//! ### Building & Install
//!
//! To build and install the CLI use `cargo install --path ./trench_compiler_cli` from the
//! top level of the repository.
//!
//! ## Configuration
//!
//! A template configuration can be made with `trench_compiler_cli new -p config.yml`. The
//! YAML format of a configuration file is as follows:
//!
//! ```yml
//! experiment_name: ''
//! image_path: None
//! analysis_path: None
//! output_mode: monolithic
//! plane_names:
//! - c1
//! lanes:
//!   min_width: 8
//!   max_width: 40
//!   threshold_fraction: 0.5
//!   min_contrast: 10.0
//!   spacing_tolerance: 0.5
//!   id_grid: 1
//!   polarity: bright
//! consensus:
//!   tolerance: 5
//!   min_observation_fraction: 0.5
//! compression_level: 4
//! n_threads: null
//! reuse_metadata: false
//! reuse_masks: false
//! ```
//!
//! - `image_path`: directory of per-frame TIFF files named `<experiment>_t<NNNN>xy<FOV>.tif`.
//! Every page of a file is one imaging plane.
//! - `analysis_path`: directory receiving the outputs and the snapshots
//! (`frame_metadata.yml`, `channel_masks.yml`).
//! - `output_mode`: `incremental` or `monolithic`, see below.
//! - `n_threads`: number of workers. If `null`, one less than the number of cores.
//! - `reuse_metadata`/`reuse_masks`: load the snapshots of an earlier run instead of
//! detecting lanes/building masks again.
//!
//! ## Output
//!
//! ### Incremental
//!
//! One multi-page TIFF per lane and plane, written to `<analysis_path>/channels`, named
//! `<experiment>_xy<FOV>_p<lane>_c<plane>.tif`. Each page is one time point. The lane
//! attributes are kept as YAML in the description of the first page.
//!
//! ### Monolithic
//!
//! One HDF5 file per FOV, written to `<analysis_path>/hdf5`:
//!
//! ```text
//! <experiment>_xy001.h5 - fov_id, stage_x, stage_y, frame_shape, planes, lane_ids
//! |---- lane_<id> - lane_id, bbox
//! |    |---- c1(dset) - plane
//! |    |---- c2(dset) - plane
//! |    |---- times(dset)
//! ```
pub mod channel_locator;
pub mod config;
pub mod consensus;
pub mod error;
pub mod fov_writer;
pub mod frame;
pub mod frame_source;
pub mod hdf_writer;
pub mod lane;
pub mod process;
pub mod slicer;
pub mod snapshot;
pub mod stack_sink;
pub mod tiff_writer;
pub mod worker_status;
