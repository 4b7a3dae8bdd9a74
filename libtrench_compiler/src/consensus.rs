use fxhash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::config::ConsensusParams;
use super::lane::{BoundingBox, LaneCandidate, LaneMap};

/// The agreed-upon box for one lane of an FOV
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneMask {
    pub bbox: BoundingBox,
    /// Number of frames the lane was seen in
    pub observations: usize,
}

/// The single lane layout used to slice every frame of an FOV.
///
/// Exactly one box per lane id, every box inside the frame extent, and no two boxes
/// sharing a column. Never mutated once built (or loaded).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusMask {
    pub fov: u32,
    pub height: usize,
    pub width: usize,
    pub n_frames: usize,
    pub lanes: BTreeMap<u32, LaneMask>,
}

impl ConsensusMask {
    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    pub fn lane_ids(&self) -> Vec<u32> {
        self.lanes.keys().copied().collect()
    }
}

/// Candidates of nearby ids from several frames, believed to be one physical lane
#[derive(Debug)]
struct Cluster {
    anchor: u32,
    ids: Vec<u32>,
    frames: FxHashSet<usize>,
    envelope: BoundingBox,
}

impl Cluster {
    fn new(frame: usize, candidate: &LaneCandidate) -> Self {
        let mut frames = FxHashSet::default();
        frames.insert(frame);
        Self {
            anchor: candidate.lane_id,
            ids: vec![candidate.lane_id],
            frames,
            envelope: candidate.bbox,
        }
    }

    fn push(&mut self, frame: usize, candidate: &LaneCandidate) {
        self.ids.push(candidate.lane_id);
        self.frames.insert(frame);
        self.envelope = self.envelope.union(&candidate.bbox);
    }

    /// Lower median of the member ids
    fn lane_id(&self) -> u32 {
        self.ids[(self.ids.len() - 1) / 2]
    }
}

/// Reconciles the noisy per-frame detections of one FOV into a [`ConsensusMask`]
#[derive(Debug, Clone)]
pub struct MaskConsolidator {
    params: ConsensusParams,
}

impl MaskConsolidator {
    pub fn new(params: ConsensusParams) -> Self {
        Self { params }
    }

    /// Build the consensus for an FOV from the lane maps of all its successfully read frames.
    ///
    /// Frames which found no lanes still count toward the observation fraction.
    pub fn consolidate(
        &self,
        fov: u32,
        frame_shape: (usize, usize),
        candidates_by_frame: &[&LaneMap],
    ) -> ConsensusMask {
        let (height, width) = frame_shape;
        let n_frames = candidates_by_frame.len();

        let mut entries: Vec<(u32, usize, &LaneCandidate)> = candidates_by_frame
            .iter()
            .enumerate()
            .flat_map(|(frame, lanes)| lanes.values().map(move |c| (c.lane_id, frame, c)))
            .collect();
        entries.sort_by_key(|(id, frame, _)| (*id, *frame));

        let mut clusters: Vec<Cluster> = Vec::new();
        for (id, frame, candidate) in entries {
            match clusters.last_mut() {
                Some(cluster) if id - cluster.anchor <= self.params.tolerance => {
                    cluster.push(frame, candidate)
                }
                _ => clusters.push(Cluster::new(frame, candidate)),
            }
        }

        let min_observations = self.params.min_observation_fraction * n_frames as f64;
        let mut survivors: Vec<(u32, LaneMask)> = clusters
            .iter()
            .filter(|cluster| cluster.frames.len() as f64 >= min_observations)
            .map(|cluster| {
                (
                    cluster.lane_id(),
                    LaneMask {
                        bbox: cluster.envelope.clamp(height, width),
                        observations: cluster.frames.len(),
                    },
                )
            })
            .filter(|(_, mask)| mask.bbox.n_rows() > 0 && mask.bbox.n_cols() > 0)
            .collect();

        // Collisions go to the better observed lane, then to the lower column
        survivors.sort_by(|(id_a, a), (id_b, b)| {
            b.observations.cmp(&a.observations).then(id_a.cmp(id_b))
        });
        let mut lanes: BTreeMap<u32, LaneMask> = BTreeMap::new();
        for (id, mask) in survivors {
            if let Some((other, _)) = lanes
                .iter()
                .find(|(_, kept)| kept.bbox.overlaps_columns(&mask.bbox))
            {
                spdlog::warn!(
                    "FOV {}: lane {} collides with lane {} and was dropped",
                    fov,
                    id,
                    other
                );
                continue;
            }
            lanes.insert(id, mask);
        }

        ConsensusMask {
            fov,
            height,
            width,
            n_frames,
            lanes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHAPE: (usize, usize) = (60, 600);

    fn candidate(lane_id: u32, bbox: BoundingBox) -> LaneCandidate {
        LaneCandidate {
            lane_id,
            bbox,
            width: bbox.n_cols(),
            contrast: 100.0,
        }
    }

    fn lanes_at(ids: &[u32]) -> LaneMap {
        ids.iter()
            .map(|&id| {
                let col = id as i32;
                (id, candidate(id, BoundingBox::new(5, 55, col - 5, col + 5)))
            })
            .collect()
    }

    fn consolidator() -> MaskConsolidator {
        MaskConsolidator::new(ConsensusParams {
            tolerance: 5,
            min_observation_fraction: 0.5,
        })
    }

    #[test]
    fn test_jittered_lane_merges_and_transient_drops() {
        let frames = [lanes_at(&[100, 500]), lanes_at(&[101]), lanes_at(&[99])];
        let refs: Vec<&LaneMap> = frames.iter().collect();
        let mask = consolidator().consolidate(1, SHAPE, &refs);
        assert_eq!(mask.lane_ids(), vec![100]);
        let lane = mask.lanes[&100];
        assert_eq!(lane.observations, 3);
        assert_eq!(lane.bbox, BoundingBox::new(5, 55, 94, 106));
        assert_eq!(mask.n_frames, 3);
    }

    #[test]
    fn test_envelope_contains_every_candidate() {
        let mut first = LaneMap::new();
        first.insert(200, candidate(200, BoundingBox::new(3, 50, 195, 205)));
        let mut second = LaneMap::new();
        second.insert(202, candidate(202, BoundingBox::new(8, 57, 197, 208)));
        let frames = [first, second];
        let refs: Vec<&LaneMap> = frames.iter().collect();
        let mask = consolidator().consolidate(0, SHAPE, &refs);
        let lane = mask.lanes[&200];
        for frame in frames.iter() {
            for c in frame.values() {
                assert!(lane.bbox.contains(&c.bbox));
            }
        }
    }

    #[test]
    fn test_boxes_are_clamped_to_frame() {
        let mut frame = LaneMap::new();
        frame.insert(2, candidate(2, BoundingBox::new(-3, 70, -4, 8)));
        frame.insert(597, candidate(597, BoundingBox::new(0, 60, 590, 604)));
        let frames = [frame];
        let refs: Vec<&LaneMap> = frames.iter().collect();
        let mask = consolidator().consolidate(0, SHAPE, &refs);
        assert_eq!(mask.lanes.len(), 2);
        for lane in mask.lanes.values() {
            assert!(lane.bbox.is_within(SHAPE.0, SHAPE.1));
        }
    }

    #[test]
    fn test_consolidation_is_idempotent() {
        let frames = [
            lanes_at(&[50, 100, 150]),
            lanes_at(&[52, 99, 151, 300]),
            lanes_at(&[49, 148]),
        ];
        let refs: Vec<&LaneMap> = frames.iter().collect();
        let first = consolidator().consolidate(4, SHAPE, &refs);
        let second = consolidator().consolidate(4, SHAPE, &refs);
        assert_eq!(first, second);
        assert_eq!(first.lane_ids(), second.lane_ids());
        assert_eq!(first.lane_ids(), vec![50, 99, 150]);
    }

    #[test]
    fn test_collisions_prefer_observations_then_lower_id() {
        let mut busy = LaneMap::new();
        busy.insert(100, candidate(100, BoundingBox::new(0, 50, 95, 108)));
        busy.insert(110, candidate(110, BoundingBox::new(0, 50, 104, 116)));
        let mut sparse = LaneMap::new();
        sparse.insert(110, candidate(110, BoundingBox::new(0, 50, 104, 116)));
        let frames = [busy.clone(), busy.clone(), sparse];
        let refs: Vec<&LaneMap> = frames.iter().collect();
        let mask = consolidator().consolidate(0, SHAPE, &refs);
        assert_eq!(mask.lane_ids(), vec![110]);

        let frames = [busy.clone(), busy];
        let refs: Vec<&LaneMap> = frames.iter().collect();
        let mask = consolidator().consolidate(0, SHAPE, &refs);
        assert_eq!(mask.lane_ids(), vec![100]);
    }

    #[test]
    fn test_no_surviving_lanes() {
        let frames = [LaneMap::new(), LaneMap::new(), lanes_at(&[300])];
        let refs: Vec<&LaneMap> = frames.iter().collect();
        let mask = consolidator().consolidate(2, SHAPE, &refs);
        assert!(mask.is_empty());
        assert!(consolidator().consolidate(2, SHAPE, &[]).is_empty());
    }
}
