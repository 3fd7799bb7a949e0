use log::debug;
use ndarray::{Array2, Array3, ArrayView3, ArrayView4, ArrayViewMut2, Axis};
use num_complex::Complex32;

use crate::math::geometry::Uvw;
use crate::prelude::{StageError, StageResult};

/// Grid cell for every `(bl, chan)`, or `None` where the baseline falls
/// outside the grid. Coordinates are rounded to the nearest cell and wrapped
/// so that negative spacings land in the upper half.
pub fn grid_cells(
    uvw: &Uvw,
    npixx: usize,
    npixy: usize,
    uvres: f64,
) -> Array2<Option<(usize, usize)>> {
    let half_x = (npixx / 2) as i64;
    let half_y = (npixy / 2) as i64;
    Array2::from_shape_fn((uvw.nbl(), uvw.nchan()), |(j, k)| {
        let ubl = (uvw.u[[j, k]] as f64 / uvres).round() as i64;
        let vbl = (uvw.v[[j, k]] as f64 / uvres).round() as i64;
        if ubl.abs() < half_x && vbl.abs() < half_y {
            Some((
                ubl.rem_euclid(npixx as i64) as usize,
                vbl.rem_euclid(npixy as i64) as usize,
            ))
        } else {
            None
        }
    })
}

/// Adds one integration `(nbl, nchan, npol)` into `grid`, summing polarisations.
pub fn grid_integration(
    data: ArrayView3<Complex32>,
    cells: &Array2<Option<(usize, usize)>>,
    mut grid: ArrayViewMut2<Complex32>,
) -> StageResult<()> {
    let (nbl, nchan, _) = data.dim();
    if cells.dim() != (nbl, nchan) {
        return Err(StageError::ShapeMismatch(format!(
            "grid cells {:?} do not match data ({}, {})",
            cells.dim(),
            nbl,
            nchan
        )));
    }
    for ((j, k), cell) in cells.indexed_iter() {
        if let Some(cell) = cell {
            let pols = data.index_axis(Axis(0), j);
            grid[*cell] += pols.index_axis(Axis(0), k).sum();
        }
    }
    Ok(())
}

/// Grids every integration of `data` onto `(nint, npixx, npixy)` uv planes.
pub fn grid_visibilities(
    data: ArrayView4<Complex32>,
    uvw: &Uvw,
    npixx: usize,
    npixy: usize,
    uvres: f64,
) -> StageResult<Array3<Complex32>> {
    debug!(
        "Gridding {} ints at ({}, {}) pix and {} resolution",
        data.len_of(Axis(0)),
        npixx,
        npixy,
        uvres
    );
    let cells = grid_cells(uvw, npixx, npixy, uvres);
    let mut grids = Array3::<Complex32>::zeros((data.len_of(Axis(0)), npixx, npixy));
    for (integration, grid) in data.outer_iter().zip(grids.outer_iter_mut()) {
        grid_integration(integration, &cells, grid)?;
    }
    Ok(grids)
}
