use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use super::channel_locator::ChannelLocator;
use super::config::Config;
use super::consensus::{ConsensusMask, MaskConsolidator};
use super::error::ProcessorError;
use super::fov_writer::{FovWriter, LaneFailure, WriteOutcome, WriteRequest, WrittenFiles};
use super::frame::FrameMetadata;
use super::frame_source::{FrameSource, TiffFrameSource};
use super::lane::LaneMap;
use super::slicer::cut_frame;
use super::snapshot::{load_snapshot, save_snapshot};
use super::stack_sink::{open_sink, CroppedStack, FovHeader, LaneAttributes};
use super::worker_status::{Phase, WorkerStatus};

/// Detection result of one frame which could be read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzedFrame {
    pub metadata: FrameMetadata,
    pub lanes: LaneMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FrameOutcome {
    Analyzed(AnalyzedFrame),
    Failed(String),
}

/// Phase 1 results keyed by source file
pub type AnalyzedFrames = BTreeMap<PathBuf, FrameOutcome>;
/// Phase 2 results keyed by FOV
pub type ChannelMasks = BTreeMap<u32, ConsensusMask>;

/// How far an FOV got
#[derive(Debug, Clone, PartialEq)]
pub enum FovOutcome {
    Written { frames: usize, lanes: usize },
    NoLanesConsolidated,
    /// A mask exists but none of the FOV's frames were analyzed
    NoFrames,
    /// Frames were analyzed but no mask was available
    NoMask,
    Failed(String),
    Aborted,
}

/// Everything a caller needs to know about a finished run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub frames_analyzed: usize,
    pub frames_failed: usize,
    pub fovs: BTreeMap<u32, FovOutcome>,
    pub written: WrittenFiles,
}

impl RunSummary {
    pub fn frames_written(&self) -> usize {
        self.written
            .values()
            .filter(|o| o.lanes_written > 0 && o.failures.is_empty())
            .count()
    }

    pub fn lane_failures(&self) -> usize {
        self.written.values().map(|o| o.failures.len()).sum()
    }

    pub fn log(&self) {
        spdlog::info!(
            "Analyzed {} frames, {} could not be read.",
            self.frames_analyzed,
            self.frames_failed
        );
        for (fov, outcome) in self.fovs.iter() {
            match outcome {
                FovOutcome::Written { frames, lanes } => {
                    spdlog::info!("FOV {}: wrote {} lanes over {} frames", fov, lanes, frames)
                }
                FovOutcome::NoLanesConsolidated => {
                    spdlog::warn!("FOV {}: no lanes survived consolidation, skipped", fov)
                }
                FovOutcome::NoFrames => spdlog::warn!("FOV {}: no readable frames, skipped", fov),
                FovOutcome::NoMask => spdlog::warn!("FOV {}: no channel mask, skipped", fov),
                FovOutcome::Failed(reason) => spdlog::error!("FOV {}: failed: {}", fov, reason),
                FovOutcome::Aborted => spdlog::warn!("FOV {}: aborted", fov),
            }
        }
        spdlog::info!(
            "{} frames fully written, {} lane writes failed.",
            self.frames_written(),
            self.lane_failures()
        );
    }
}

/// Divide work into a set of subsets (per thread/worker), round robin.
///
/// Only as many subsets as there are items are made, so no worker is started idle.
pub fn create_subsets<T: Clone>(items: &[T], n_workers: usize) -> Vec<Vec<T>> {
    let n_subsets = n_workers.max(1).min(items.len());
    let mut subsets: Vec<Vec<T>> = vec![Vec::new(); n_subsets];
    for (idx, item) in items.iter().enumerate() {
        subsets[idx % n_subsets].push(item.clone())
    }
    subsets
}

/// Phase 1: read every frame and locate its lanes.
///
/// A frame which cannot be read is recorded as [`FrameOutcome::Failed`]. Frames not
/// yet started when the abort flag is raised are left out of the result.
pub fn detect_frames<S: FrameSource>(
    source: &S,
    locator: &ChannelLocator,
    files: &[PathBuf],
    n_workers: usize,
    tx: &Sender<WorkerStatus>,
    abort: &AtomicBool,
) -> Result<AnalyzedFrames, ProcessorError> {
    let subsets = create_subsets(files, n_workers);
    spdlog::info!(
        "Detecting lanes in {} frames with {} workers...",
        files.len(),
        subsets.len()
    );

    let mut analyzed = AnalyzedFrames::new();
    std::thread::scope(|s| -> Result<(), ProcessorError> {
        let mut handles = Vec::new();
        for (worker_id, subset) in subsets.into_iter().enumerate() {
            let tx = tx.clone();
            handles.push(s.spawn(move || {
                detect_subset(source, locator, subset, worker_id, &tx, abort)
            }));
        }
        for handle in handles {
            match handle.join() {
                Ok(result) => analyzed.extend(result?),
                Err(_) => return Err(ProcessorError::WorkerPanic("detection")),
            }
        }
        Ok(())
    })?;
    Ok(analyzed)
}

fn detect_subset<S: FrameSource>(
    source: &S,
    locator: &ChannelLocator,
    subset: Vec<PathBuf>,
    worker_id: usize,
    tx: &Sender<WorkerStatus>,
    abort: &AtomicBool,
) -> Result<Vec<(PathBuf, FrameOutcome)>, ProcessorError> {
    let total = subset.len();
    let mut results = Vec::with_capacity(total);
    for (idx, path) in subset.into_iter().enumerate() {
        if abort.load(Ordering::Relaxed) {
            break;
        }
        let (fov, outcome) = match source.read_frame(&path) {
            Ok(frame) => {
                let lanes = locator.locate(frame.pixels.view());
                if lanes.is_empty() {
                    spdlog::debug!("No lanes detected in {}", path.display());
                }
                (
                    frame.metadata.fov,
                    FrameOutcome::Analyzed(AnalyzedFrame {
                        metadata: frame.metadata,
                        lanes,
                    }),
                )
            }
            Err(e) => {
                spdlog::warn!("Could not read {}: {}", path.display(), e);
                (0, FrameOutcome::Failed(e.to_string()))
            }
        };
        results.push((path, outcome));
        tx.send(WorkerStatus::new(
            (idx + 1) as f32 / total as f32,
            fov,
            worker_id,
            Phase::Detecting,
        ))?;
    }
    Ok(results)
}

/// The readable frames of each FOV, in acquisition order
pub fn group_by_fov(analyzed: &AnalyzedFrames) -> BTreeMap<u32, Vec<&AnalyzedFrame>> {
    let mut groups: BTreeMap<u32, Vec<&AnalyzedFrame>> = BTreeMap::new();
    for outcome in analyzed.values() {
        if let FrameOutcome::Analyzed(frame) = outcome {
            groups.entry(frame.metadata.fov).or_default().push(frame);
        }
    }
    for frames in groups.values_mut() {
        frames.sort_by(|a, b| {
            let a_ts = a.metadata.timestamp.unwrap_or(f64::INFINITY);
            let b_ts = b.metadata.timestamp.unwrap_or(f64::INFINITY);
            a_ts.total_cmp(&b_ts)
                .then(a.metadata.time.cmp(&b.metadata.time))
        });
    }
    groups
}

/// Phase 2: one consensus mask per FOV.
///
/// The frame extent of an FOV is that of its first frame; frames of any other
/// extent are left out of the consensus.
pub fn build_masks(analyzed: &AnalyzedFrames, consolidator: &MaskConsolidator) -> ChannelMasks {
    let mut masks = ChannelMasks::new();
    for (fov, frames) in group_by_fov(analyzed) {
        let Some(first) = frames.first() else {
            continue;
        };
        let shape = (first.metadata.height(), first.metadata.width());
        let mut lane_maps: Vec<&LaneMap> = Vec::with_capacity(frames.len());
        for frame in frames.iter() {
            if (frame.metadata.height(), frame.metadata.width()) != shape {
                spdlog::warn!(
                    "FOV {}: {} has extent {:?} instead of {:?}, left out of the mask",
                    fov,
                    frame.metadata.path.display(),
                    (frame.metadata.height(), frame.metadata.width()),
                    shape
                );
                continue;
            }
            lane_maps.push(&frame.lanes);
        }
        let mask = consolidator.consolidate(fov, shape, &lane_maps);
        spdlog::info!(
            "FOV {}: {} lanes from {} frames",
            fov,
            mask.lanes.len(),
            lane_maps.len()
        );
        masks.insert(fov, mask);
    }
    masks
}

/// Phase 3: slice every frame of every FOV and write the lanes.
///
/// FOVs are divided among the workers; each FOV gets its own writer thread.
pub fn write_stacks<S: FrameSource>(
    config: &Config,
    source: &S,
    analyzed: &AnalyzedFrames,
    masks: &ChannelMasks,
    n_workers: usize,
    tx: &Sender<WorkerStatus>,
    abort: &AtomicBool,
) -> Result<(BTreeMap<u32, FovOutcome>, WrittenFiles), ProcessorError> {
    let groups = group_by_fov(analyzed);
    let mut outcomes: BTreeMap<u32, FovOutcome> = BTreeMap::new();
    for fov in groups.keys() {
        if !masks.contains_key(fov) {
            outcomes.insert(*fov, FovOutcome::NoMask);
        }
    }
    let fovs: Vec<u32> = masks.keys().copied().collect();
    let subsets = create_subsets(&fovs, n_workers);
    spdlog::info!(
        "Writing {} FOVs with {} workers...",
        fovs.len(),
        subsets.len()
    );

    let mut written = WrittenFiles::new();
    std::thread::scope(|s| -> Result<(), ProcessorError> {
        let mut handles = Vec::new();
        for (worker_id, subset) in subsets.into_iter().enumerate() {
            let tx = tx.clone();
            let groups = &groups;
            handles.push(s.spawn(move || -> Result<_, ProcessorError> {
                let mut results = Vec::new();
                for fov in subset {
                    let frames = groups.get(&fov).map(|f| f.as_slice()).unwrap_or(&[]);
                    let Some(mask) = masks.get(&fov) else {
                        continue;
                    };
                    let result = write_fov(config, source, mask, frames, worker_id, &tx, abort)?;
                    results.push((fov, result));
                }
                Ok(results)
            }));
        }
        for handle in handles {
            match handle.join() {
                Ok(result) => {
                    for (fov, (outcome, files)) in result? {
                        outcomes.insert(fov, outcome);
                        written.extend(files);
                    }
                }
                Err(_) => return Err(ProcessorError::WorkerPanic("writing")),
            }
        }
        Ok(())
    })?;
    Ok((outcomes, written))
}

/// Slice and write the frames of one FOV through its writer
fn write_fov<S: FrameSource>(
    config: &Config,
    source: &S,
    mask: &ConsensusMask,
    frames: &[&AnalyzedFrame],
    worker_id: usize,
    tx: &Sender<WorkerStatus>,
    abort: &AtomicBool,
) -> Result<(FovOutcome, WrittenFiles), ProcessorError> {
    let fov = mask.fov;
    if mask.is_empty() {
        return Ok((FovOutcome::NoLanesConsolidated, WrittenFiles::new()));
    }
    if abort.load(Ordering::Relaxed) {
        return Ok((FovOutcome::Aborted, WrittenFiles::new()));
    }
    let Some(first) = frames.first() else {
        return Ok((FovOutcome::NoFrames, WrittenFiles::new()));
    };

    let planes = first.metadata.planes.clone();
    let header = FovHeader {
        fov,
        stage: frames.iter().find_map(|f| f.metadata.stage),
        frame_shape: (mask.height, mask.width),
        planes: planes.clone(),
        lane_ids: mask.lane_ids(),
    };
    let sink = match open_sink(config, &header) {
        Ok(sink) => sink,
        Err(e) => {
            spdlog::error!("FOV {}: could not open output: {}", fov, e);
            return Ok((FovOutcome::Failed(e.to_string()), WrittenFiles::new()));
        }
    };
    let writer = FovWriter::spawn(fov, sink);

    // The writer is drained even when feeding stops early, but only a complete FOV is published
    let fed = feed_writer(source, mask, frames, &planes, &writer, worker_id, tx, abort);
    let finished = match fed {
        Ok((_, false, _)) => writer.finish(),
        _ => writer.abandon(),
    };
    let (n_frames, aborted, mut unread) = fed?;

    match finished {
        Ok(mut written) => {
            written.append(&mut unread);
            let outcome = if aborted {
                FovOutcome::Aborted
            } else {
                FovOutcome::Written {
                    frames: n_frames,
                    lanes: mask.lanes.len(),
                }
            };
            Ok((outcome, written))
        }
        Err(e) => {
            spdlog::error!("FOV {}: writer failed: {}", fov, e);
            Ok((FovOutcome::Failed(e.to_string()), unread))
        }
    }
}

/// Read, cut, and submit every frame. Returns the number of frames submitted,
/// whether the run was aborted, and the frames which could not be re-read.
#[allow(clippy::too_many_arguments)]
fn feed_writer<S: FrameSource>(
    source: &S,
    mask: &ConsensusMask,
    frames: &[&AnalyzedFrame],
    planes: &[String],
    writer: &FovWriter,
    worker_id: usize,
    tx: &Sender<WorkerStatus>,
    abort: &AtomicBool,
) -> Result<(usize, bool, WrittenFiles), ProcessorError> {
    let fov = mask.fov;
    let mut unread = WrittenFiles::new();
    let mut n_submitted = 0;
    tx.send(WorkerStatus::new(0.0, fov, worker_id, Phase::Writing))?;
    for (idx, analyzed) in frames.iter().enumerate() {
        if abort.load(Ordering::Relaxed) {
            spdlog::warn!("FOV {}: aborted after {} frames", fov, n_submitted);
            return Ok((n_submitted, true, unread));
        }
        let path = &analyzed.metadata.path;
        let frame = match source.read_frame(path) {
            Ok(frame) if (frame.metadata.height(), frame.metadata.width()) == (mask.height, mask.width) => {
                frame
            }
            Ok(frame) => {
                let reason = format!(
                    "frame extent {:?} differs from the FOV extent {:?}",
                    (frame.metadata.height(), frame.metadata.width()),
                    (mask.height, mask.width)
                );
                spdlog::warn!("FOV {}: skipping {}: {}", fov, path.display(), reason);
                unread.insert(path.clone(), every_lane_failed(mask, &reason));
                continue;
            }
            Err(e) => {
                spdlog::warn!("FOV {}: could not re-read {}: {}", fov, path.display(), e);
                unread.insert(path.clone(), every_lane_failed(mask, &e.to_string()));
                continue;
            }
        };

        for (lane_id, lane) in mask.lanes.iter() {
            let cropped = cut_frame(frame.pixels.view(), &lane.bbox);
            let request = WriteRequest {
                source: path.clone(),
                fov,
                lane_id: *lane_id,
                stack: CroppedStack::from_frame(frame.metadata.time, cropped),
                attributes: LaneAttributes {
                    bbox: lane.bbox,
                    planes: planes.to_vec(),
                },
            };
            if let Err(e) = writer.submit(request) {
                spdlog::error!("FOV {}: {}", fov, e);
                return Ok((n_submitted, false, unread));
            }
        }
        n_submitted += 1;
        tx.send(WorkerStatus::new(
            (idx + 1) as f32 / frames.len() as f32,
            fov,
            worker_id,
            Phase::Writing,
        ))?;
    }
    Ok((n_submitted, false, unread))
}

fn every_lane_failed(mask: &ConsensusMask, reason: &str) -> WriteOutcome {
    WriteOutcome {
        lanes_written: 0,
        failures: mask
            .lanes
            .keys()
            .map(|lane_id| LaneFailure {
                lane_id: *lane_id,
                reason: reason.to_string(),
            })
            .collect(),
    }
}

/// Run all three phases over a set of frame files with any frame source
pub fn run_pipeline<S: FrameSource>(
    config: &Config,
    source: &S,
    files: &[PathBuf],
    tx: &Sender<WorkerStatus>,
    abort: &AtomicBool,
) -> Result<RunSummary, ProcessorError> {
    config.create_output_directories()?;
    let n_workers = config.get_n_workers();

    let metadata_path = config.get_metadata_snapshot_path();
    let analyzed: AnalyzedFrames = if config.reuse_metadata {
        spdlog::info!("Loading frame metadata from {}...", metadata_path.display());
        load_snapshot(&metadata_path)?
    } else {
        let locator = ChannelLocator::new(config.lanes.clone());
        let analyzed = detect_frames(source, &locator, files, n_workers, tx, abort)?;
        if !abort.load(Ordering::Relaxed) {
            save_snapshot(&metadata_path, &analyzed)?;
        }
        analyzed
    };

    let masks_path = config.get_masks_snapshot_path();
    let masks: ChannelMasks = if config.reuse_masks {
        spdlog::info!("Loading channel masks from {}...", masks_path.display());
        load_snapshot(&masks_path)?
    } else {
        let consolidator = MaskConsolidator::new(config.consensus.clone());
        let masks = build_masks(&analyzed, &consolidator);
        if !abort.load(Ordering::Relaxed) {
            save_snapshot(&masks_path, &masks)?;
        }
        masks
    };

    let (fovs, written) = write_stacks(config, source, &analyzed, &masks, n_workers, tx, abort)?;

    let frames_failed = analyzed
        .values()
        .filter(|o| matches!(o, FrameOutcome::Failed(_)))
        .count();
    let summary = RunSummary {
        frames_analyzed: analyzed.len() - frames_failed,
        frames_failed,
        fovs,
        written,
    };
    summary.log();
    Ok(summary)
}

/// The main loop of trench_compiler.
///
/// Validates the config, finds the frame files, and runs the pipeline with the TIFF
/// frame source. Meant to be called by a separate thread (typically the UI), which can
/// raise `abort` to stop the run early. An FOV stopped part way keeps its monolithic
/// output under the partial name.
pub fn process(
    config: Config,
    tx: Sender<WorkerStatus>,
    abort: Arc<AtomicBool>,
) -> Result<RunSummary, ProcessorError> {
    config.validate()?;
    let source = TiffFrameSource::new(&config)?;
    let files = if config.reuse_metadata {
        Vec::new()
    } else {
        config.get_frame_files()?
    };
    spdlog::info!(
        "Found {} frame files for experiment {}",
        files.len(),
        config.experiment_name
    );
    run_pipeline(&config, &source, &files, &tx, &abort)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputMode;
    use crate::error::FrameReadError;
    use crate::frame::{Frame, StagePosition};
    use crate::hdf_writer::MonolithicSink;
    use crate::tiff_writer::IncrementalSink;
    use ndarray::{s, Array3};
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc::channel;

    const HEIGHT: usize = 40;
    const WIDTH: usize = 120;

    /// Frames generated from their file name: `t<time>_xy<fov>`, and `bad` for unreadable files
    struct SyntheticSource;

    impl SyntheticSource {
        fn pixels(fov: u32, time: u32) -> Array3<u16> {
            let mut pixels = Array3::<u16>::from_elem((2, HEIGHT, WIDTH), 100);
            // two lanes, shifting one column back and forth
            let jitter = (time % 2) as usize;
            for start in [20, 70] {
                pixels
                    .slice_mut(s![0, 4..36, start + jitter..start + jitter + 10])
                    .fill(1000);
            }
            pixels
                .slice_mut(s![1, .., ..])
                .fill((fov * 10 + time) as u16);
            pixels
        }
    }

    impl FrameSource for SyntheticSource {
        fn read_frame(&self, path: &Path) -> Result<Frame, FrameReadError> {
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            if name.contains("bad") {
                return Err(FrameReadError::EmptyFrame);
            }
            let (time, fov) = name
                .trim_end_matches(".tif")
                .trim_start_matches('t')
                .split_once("_xy")
                .unwrap();
            let (time, fov) = (time.parse::<u32>().unwrap(), fov.parse::<u32>().unwrap());
            Ok(Frame {
                metadata: FrameMetadata {
                    path: path.to_path_buf(),
                    fov,
                    time,
                    timestamp: Some(2_460_000.0 + time as f64),
                    stage: Some(StagePosition { x: 10.0, y: 20.0 }),
                    planes: vec![String::from("phase"), String::from("gfp")],
                    shape: (2, HEIGHT, WIDTH),
                },
                pixels: Self::pixels(fov, time),
            })
        }
    }

    /// Raises `abort` once `limit` frames have been read
    struct AbortingSource<'a> {
        abort: &'a AtomicBool,
        reads: AtomicUsize,
        limit: usize,
    }

    impl FrameSource for AbortingSource<'_> {
        fn read_frame(&self, path: &Path) -> Result<Frame, FrameReadError> {
            if self.reads.fetch_add(1, Ordering::SeqCst) + 1 >= self.limit {
                self.abort.store(true, Ordering::SeqCst);
            }
            SyntheticSource.read_frame(path)
        }
    }

    fn files() -> Vec<PathBuf> {
        let mut files = Vec::new();
        for fov in [1, 2] {
            for time in 0..4 {
                files.push(PathBuf::from(format!("t{:04}_xy{:03}.tif", time, fov)));
            }
        }
        files.push(PathBuf::from("bad_xy001.tif"));
        files
    }

    fn config(analysis_path: &Path, output_mode: OutputMode) -> Config {
        Config {
            experiment_name: String::from("exp"),
            analysis_path: analysis_path.to_path_buf(),
            output_mode,
            plane_names: vec![String::from("phase"), String::from("gfp")],
            n_threads: Some(2),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_subsets() {
        let subsets = create_subsets(&[1, 2, 3, 4, 5], 2);
        assert_eq!(subsets, vec![vec![1, 3, 5], vec![2, 4]]);
        let subsets = create_subsets(&[1, 2], 4);
        assert_eq!(subsets.len(), 2);
        assert!(create_subsets::<u32>(&[], 4).is_empty());
    }

    #[test]
    fn test_monolithic_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), OutputMode::Monolithic);
        let (tx, rx) = channel();
        let abort = AtomicBool::new(false);
        let summary = run_pipeline(&config, &SyntheticSource, &files(), &tx, &abort).unwrap();
        drop(tx);

        assert_eq!(summary.frames_analyzed, 8);
        assert_eq!(summary.frames_failed, 1);
        assert_eq!(summary.frames_written(), 8);
        assert_eq!(summary.lane_failures(), 0);
        assert_eq!(
            summary.fovs[&1],
            FovOutcome::Written {
                frames: 4,
                lanes: 2
            }
        );
        assert!(rx.iter().any(|status| status.phase == Phase::Writing));

        let path = config
            .get_output_directory()
            .join(MonolithicSink::file_name("exp", 2));
        let header = MonolithicSink::read_fov_header(&path).unwrap();
        assert_eq!(header.lane_ids.len(), 2);
        let lane = MonolithicSink::read_lane_stack(&path, header.lane_ids[0]).unwrap();
        assert_eq!(lane.times, vec![0, 1, 2, 3]);
        assert_eq!(lane.planes, vec![String::from("phase"), String::from("gfp")]);
        // the fluorescence plane carries fov * 10 + time everywhere
        assert_eq!(lane.pixels[[3, 0, 0, 1]], 23);

        assert!(config.get_metadata_snapshot_path().exists());
        assert!(config.get_masks_snapshot_path().exists());
    }

    #[test]
    fn test_incremental_run_and_rerun_from_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), OutputMode::Incremental);
        let (tx, _rx) = channel();
        let abort = AtomicBool::new(false);
        let first = run_pipeline(&config, &SyntheticSource, &files(), &tx, &abort).unwrap();
        assert_eq!(first.frames_written(), 8);

        config.reuse_metadata = true;
        config.reuse_masks = true;
        let second = run_pipeline(&config, &SyntheticSource, &[], &tx, &abort).unwrap();
        assert_eq!(second.frames_analyzed, 8);
        assert_eq!(second.fovs, first.fovs);

        let masks: ChannelMasks = load_snapshot(&config.get_masks_snapshot_path()).unwrap();
        let lane_id = masks[&1].lane_ids()[0];
        let sink = IncrementalSink::new(&config.get_output_directory(), "exp", 1);
        let lane = sink.read_lane_stack(lane_id).unwrap();
        // the rerun found every time point already written
        assert_eq!(lane.times, vec![0, 1, 2, 3]);
        assert_eq!(lane.pixels.dim().0, 4);
    }

    #[test]
    fn test_abort_stops_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), OutputMode::Monolithic);
        let (tx, _rx) = channel();
        let abort = AtomicBool::new(true);
        let summary = run_pipeline(&config, &SyntheticSource, &files(), &tx, &abort).unwrap();
        assert_eq!(summary.frames_analyzed, 0);
        assert!(summary.fovs.is_empty());
        assert!(summary.written.is_empty());
        assert!(!config.get_metadata_snapshot_path().exists());
    }

    #[test]
    fn test_abort_while_writing_keeps_earlier_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), OutputMode::Monolithic);
        let (tx, _rx) = channel();
        let abort = AtomicBool::new(false);
        run_pipeline(&config, &SyntheticSource, &files(), &tx, &abort).unwrap();

        config.reuse_metadata = true;
        config.reuse_masks = true;
        let source = AbortingSource {
            abort: &abort,
            reads: AtomicUsize::new(0),
            limit: 1,
        };
        let summary = run_pipeline(&config, &source, &[], &tx, &abort).unwrap();
        assert!(summary.fovs.values().all(|o| *o == FovOutcome::Aborted));

        let output = config.get_output_directory();
        let mut partial_files = 0;
        for fov in [1, 2] {
            let path = output.join(MonolithicSink::file_name("exp", fov));
            let header = MonolithicSink::read_fov_header(&path).unwrap();
            let lane = MonolithicSink::read_lane_stack(&path, header.lane_ids[0]).unwrap();
            assert_eq!(lane.times, vec![0, 1, 2, 3]);
            if path.with_extension("h5.partial").exists() {
                partial_files += 1;
            }
        }
        assert!(partial_files > 0);
    }

    #[test]
    fn test_empty_mask_skips_fov() {
        let mut analyzed = AnalyzedFrames::new();
        let frame = SyntheticSource
            .read_frame(Path::new("t0000_xy005.tif"))
            .unwrap();
        analyzed.insert(
            frame.metadata.path.clone(),
            FrameOutcome::Analyzed(AnalyzedFrame {
                metadata: frame.metadata,
                lanes: LaneMap::new(),
            }),
        );
        let masks = build_masks(&analyzed, &MaskConsolidator::new(Default::default()));
        assert!(masks[&5].is_empty());

        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), OutputMode::Monolithic);
        config.create_output_directories().unwrap();
        let (tx, _rx) = channel();
        let abort = AtomicBool::new(false);
        let (fovs, written) =
            write_stacks(&config, &SyntheticSource, &analyzed, &masks, 1, &tx, &abort).unwrap();
        assert_eq!(fovs[&5], FovOutcome::NoLanesConsolidated);
        assert!(written.is_empty());
    }
}
