//! Per-frame lane detection.
//!
//! Lanes (trenches) show up as vertical bands in the structural plane. The plane is
//! collapsed along rows into a column profile, the profile is thresholded between its
//! background and peak levels, and each run of foreground columns of plausible width
//! becomes a lane candidate. Candidates crowding a neighbour much closer than the
//! typical lane spacing are dropped in favour of the stronger one.
use ndarray::{s, Array1, Array2, ArrayView2, ArrayView3, Axis};

use super::config::{LaneParams, Polarity};
use super::lane::{BoundingBox, LaneCandidate, LaneMap};

/// Percentile of the column profile taken as the background level
const BACKGROUND_PERCENTILE: f64 = 0.1;
/// Minimum number of lanes before spacing is trusted
const MIN_LANES_FOR_SPACING: usize = 3;

/// Finds lanes in a single frame. Holds only parameters, so one locator can be shared by all workers.
#[derive(Debug, Clone)]
pub struct ChannelLocator {
    params: LaneParams,
}

impl ChannelLocator {
    pub fn new(params: LaneParams) -> Self {
        Self { params }
    }

    /// Locate the lanes of a (plane, row, column) frame.
    ///
    /// A frame without any acceptable lane yields an empty map.
    pub fn locate(&self, pixels: ArrayView3<u16>) -> LaneMap {
        let (n_planes, height, width) = pixels.dim();
        if n_planes == 0 || height == 0 || width == 0 {
            return LaneMap::new();
        }

        let reference = self.oriented(pixels.index_axis(Axis(0), reference_plane(pixels)));
        let Some(profile) = reference.mean_axis(Axis(0)) else {
            return LaneMap::new();
        };

        let background = percentile(&profile, BACKGROUND_PERCENTILE);
        let peak = profile.fold(f64::MIN, |acc, &v| acc.max(v));
        let contrast = peak - background;
        if contrast <= 0.0 || contrast < self.params.min_contrast {
            return LaneMap::new();
        }
        let threshold = background + self.params.threshold_fraction * contrast;

        let mut candidates: Vec<LaneCandidate> = Vec::new();
        for (start, end) in foreground_runs(profile.iter().copied(), threshold) {
            let run_width = end - start;
            if run_width < self.params.min_width || run_width > self.params.max_width {
                continue;
            }
            let band = reference.slice(s![.., start..end]);
            let (row_start, row_end) = match band.mean_axis(Axis(1)) {
                Some(rows) => foreground_extent(&rows, threshold).unwrap_or((0, height)),
                None => (0, height),
            };
            let lane_contrast =
                profile.slice(s![start..end]).sum() / run_width as f64 - background;
            candidates.push(LaneCandidate {
                lane_id: self.lane_id(start, end),
                bbox: BoundingBox::new(
                    row_start as i32,
                    row_end as i32,
                    start as i32,
                    end as i32,
                ),
                width: run_width,
                contrast: lane_contrast,
            });
        }

        self.filter_spacing(candidates)
            .into_iter()
            .map(|candidate| (candidate.lane_id, candidate))
            .collect()
    }

    /// Convert the reference plane to floats with lanes on the high side
    fn oriented(&self, plane: ArrayView2<u16>) -> Array2<f64> {
        match self.params.polarity {
            Polarity::Bright => plane.mapv(f64::from),
            Polarity::Dark => {
                let max = plane.iter().copied().max().unwrap_or(0) as f64;
                plane.mapv(|v| max - v as f64)
            }
        }
    }

    /// Column midpoint snapped to the id grid so small jitter keeps the same id
    fn lane_id(&self, start: usize, end: usize) -> u32 {
        let midpoint = (start + end) as f64 / 2.0 - 0.5;
        let grid = self.params.id_grid.max(1) as f64;
        ((midpoint / grid).round() * grid) as u32
    }

    /// Drop the weaker of any two lanes sitting much closer than the median spacing
    fn filter_spacing(&self, mut candidates: Vec<LaneCandidate>) -> Vec<LaneCandidate> {
        candidates.sort_by_key(|c| c.lane_id);
        let min_gap = if candidates.len() >= MIN_LANES_FOR_SPACING {
            let gaps: Vec<f64> = candidates
                .windows(2)
                .map(|pair| (pair[1].lane_id - pair[0].lane_id) as f64)
                .collect();
            (1.0 - self.params.spacing_tolerance) * median(&gaps)
        } else {
            0.0
        };

        let mut accepted: Vec<LaneCandidate> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if let Some(last) = accepted.last_mut() {
                let gap = candidate.lane_id - last.lane_id;
                if gap == 0 || (gap as f64) < min_gap {
                    spdlog::debug!(
                        "Lanes {} and {} are closer than the lane spacing allows",
                        last.lane_id,
                        candidate.lane_id
                    );
                    if candidate.contrast > last.contrast {
                        *last = candidate;
                    }
                    continue;
                }
            }
            accepted.push(candidate);
        }
        accepted
    }
}

/// The plane with the highest mean intensity is the structural one
fn reference_plane(pixels: ArrayView3<u16>) -> usize {
    let mut best = 0;
    let mut best_mean = f64::MIN;
    for (idx, plane) in pixels.outer_iter().enumerate() {
        let mean = plane.iter().map(|&v| v as f64).sum::<f64>() / plane.len() as f64;
        if mean > best_mean {
            best = idx;
            best_mean = mean;
        }
    }
    best
}

/// Half-open runs of consecutive values above the threshold
fn foreground_runs(values: impl Iterator<Item = f64>, threshold: f64) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut start: Option<usize> = None;
    let mut len = 0;
    for (idx, value) in values.enumerate() {
        len = idx + 1;
        match (value > threshold, start) {
            (true, None) => start = Some(idx),
            (false, Some(s)) => {
                runs.push((s, idx));
                start = None;
            }
            _ => (),
        }
    }
    if let Some(s) = start {
        runs.push((s, len));
    }
    runs
}

/// First and one-past-last index above the threshold
fn foreground_extent(values: &Array1<f64>, threshold: f64) -> Option<(usize, usize)> {
    let first = values.iter().position(|&v| v > threshold)?;
    let last = values.iter().rposition(|&v| v > threshold)?;
    Some((first, last + 1))
}

fn percentile(values: &Array1<f64>, fraction: f64) -> f64 {
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let idx = ((sorted.len() - 1) as f64 * fraction).round() as usize;
    sorted[idx]
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted[sorted.len() / 2]
}
