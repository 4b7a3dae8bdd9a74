use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A rectangle in image space, as half-open row and column ranges.
///
/// Coordinates are signed so that a request reaching past the frame edge can be
/// expressed (and padded) rather than silently wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub row_start: i32,
    pub row_end: i32,
    pub col_start: i32,
    pub col_end: i32,
}

impl BoundingBox {
    pub fn new(row_start: i32, row_end: i32, col_start: i32, col_end: i32) -> Self {
        Self {
            row_start,
            row_end,
            col_start,
            col_end,
        }
    }

    pub fn n_rows(&self) -> usize {
        (self.row_end - self.row_start).max(0) as usize
    }

    pub fn n_cols(&self) -> usize {
        (self.col_end - self.col_start).max(0) as usize
    }

    /// The outer envelope of two boxes
    pub fn union(&self, other: &Self) -> Self {
        Self {
            row_start: self.row_start.min(other.row_start),
            row_end: self.row_end.max(other.row_end),
            col_start: self.col_start.min(other.col_start),
            col_end: self.col_end.max(other.col_end),
        }
    }

    /// Restrict the box to a frame of the given extent
    pub fn clamp(&self, height: usize, width: usize) -> Self {
        let height = height as i32;
        let width = width as i32;
        let row_start = self.row_start.clamp(0, height);
        let col_start = self.col_start.clamp(0, width);
        Self {
            row_start,
            row_end: self.row_end.clamp(row_start, height),
            col_start,
            col_end: self.col_end.clamp(col_start, width),
        }
    }

    pub fn contains(&self, other: &Self) -> bool {
        self.row_start <= other.row_start
            && self.row_end >= other.row_end
            && self.col_start <= other.col_start
            && self.col_end >= other.col_end
    }

    pub fn is_within(&self, height: usize, width: usize) -> bool {
        self.row_start >= 0
            && self.col_start >= 0
            && self.row_end <= height as i32
            && self.col_end <= width as i32
    }

    pub fn overlaps_columns(&self, other: &Self) -> bool {
        self.col_start < other.col_end && other.col_start < self.col_end
    }

    pub fn as_array(&self) -> [i32; 4] {
        [self.row_start, self.row_end, self.col_start, self.col_end]
    }

    pub fn from_array(values: &[i32]) -> Option<Self> {
        match values {
            [row_start, row_end, col_start, col_end] => {
                Some(Self::new(*row_start, *row_end, *col_start, *col_end))
            }
            _ => None,
        }
    }
}

/// One lane seen in one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneCandidate {
    pub lane_id: u32,
    pub bbox: BoundingBox,
    pub width: usize,
    pub contrast: f64,
}

/// The lanes of a single frame keyed by lane id (column midpoint)
pub type LaneMap = BTreeMap<u32, LaneCandidate>;
