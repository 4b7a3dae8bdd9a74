use ndarray::{Array, Array3, Array4, ArrayView, ArrayView3, ArrayView4, Axis, Dimension, Slice};
use std::ops::Range;

use super::lane::BoundingBox;

/// Value written where a requested box reaches past the frame
pub const FILL_VALUE: u16 = 0;

/// Cut a lane out of a single (plane, row, column) frame
pub fn cut_frame(frame: ArrayView3<u16>, bbox: &BoundingBox) -> Array3<u16> {
    cut_axes(frame, Axis(1), Axis(2), bbox)
}

/// Cut a lane out of a (time, row, column, plane) stack
pub fn cut_stack(stack: ArrayView4<u16>, bbox: &BoundingBox) -> Array4<u16> {
    cut_axes(stack, Axis(1), Axis(2), bbox)
}

/// Crop the row and column axes of an array of any dimension to `bbox`.
///
/// Every other axis keeps its length. Parts of the box outside the array are
/// filled with [`FILL_VALUE`] so lanes of one FOV always share a shape.
pub fn cut_axes<D: Dimension>(
    array: ArrayView<u16, D>,
    row_axis: Axis,
    col_axis: Axis,
    bbox: &BoundingBox,
) -> Array<u16, D> {
    let mut shape = array.raw_dim();
    shape[row_axis.index()] = bbox.n_rows();
    shape[col_axis.index()] = bbox.n_cols();
    let mut cropped = Array::from_elem(shape, FILL_VALUE);

    let rows = overlap(bbox.row_start, bbox.row_end, array.len_of(row_axis));
    let cols = overlap(bbox.col_start, bbox.col_end, array.len_of(col_axis));
    if let (Some((src_rows, dst_rows)), Some((src_cols, dst_cols))) = (rows, cols) {
        let mut src = array.view();
        src.slice_axis_inplace(row_axis, Slice::from(src_rows));
        src.slice_axis_inplace(col_axis, Slice::from(src_cols));
        let mut dst = cropped.view_mut();
        dst.slice_axis_inplace(row_axis, Slice::from(dst_rows));
        dst.slice_axis_inplace(col_axis, Slice::from(dst_cols));
        dst.assign(&src);
    }
    cropped
}

/// The source and destination ranges of the part of `start..end` inside `0..len`
fn overlap(start: i32, end: i32, len: usize) -> Option<(Range<usize>, Range<usize>)> {
    let src_start = start.max(0) as i64;
    let src_end = (end as i64).min(len as i64);
    if src_start >= src_end {
        return None;
    }
    let dst_start = src_start - start as i64;
    let dst_end = dst_start + (src_end - src_start);
    Some((
        src_start as usize..src_end as usize,
        dst_start as usize..dst_end as usize,
    ))
}
