//! Array geometry: sidereal time, antenna frames and baseline uvw.

use std::f64::consts::TAU;

use ndarray::{array, Array2};

use crate::math::matrix::MatrixHelper;

pub const SPEED_OF_LIGHT: f64 = 2.997_924_58e8;

/// Greenwich mean sidereal time in radians for a UTC MJD.
pub fn gmst(mjd: f64) -> f64 {
    let days = mjd - 51_544.5;
    let degrees = 280.460_618_37 + 360.985_647_366_29 * days;
    degrees.rem_euclid(360.0).to_radians()
}

/// Hour angle of `ra` seen from `longitude` (east positive), in `[0, 2π)`.
pub fn hour_angle(mjd: f64, longitude: f64, ra: f64) -> f64 {
    (gmst(mjd) + longitude - ra).rem_euclid(TAU)
}

/// Local east/north/up offsets to the equatorial XYZ frame at `latitude`.
pub fn enu_to_xyz(latitude: f64, enu: [f64; 3]) -> [f64; 3] {
    let [east, north, up] = enu;
    let (sin_lat, cos_lat) = latitude.sin_cos();
    [
        -sin_lat * north + cos_lat * up,
        east,
        cos_lat * north + sin_lat * up,
    ]
}

/// Baseline order used by the correlator output: `(i, j)` with `i < j`,
/// grouped by the second antenna.
pub fn baseline_order(nants: usize) -> Vec<(usize, usize)> {
    (0..nants)
        .flat_map(|j| (0..j).map(move |i| (i, j)))
        .collect()
}

/// Baseline uvw in metres for every baseline in [`baseline_order`].
pub fn calc_uvw(
    mjd: f64,
    radec: (f64, f64),
    antpos: &[[f64; 3]],
    latitude: f64,
    longitude: f64,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let ha = hour_angle(mjd, longitude, radec.0);
    let (sin_h, cos_h) = ha.sin_cos();
    let (sin_d, cos_d) = radec.1.sin_cos();

    let xyz: Vec<[f64; 3]> = antpos
        .iter()
        .map(|&pos| enu_to_xyz(latitude, pos))
        .collect();
    let order = baseline_order(antpos.len());

    let mut baselines = Array2::<f64>::zeros((order.len(), 3));
    for (row, &(i, j)) in order.iter().enumerate() {
        for axis in 0..3 {
            baselines[[row, axis]] = xyz[j][axis] - xyz[i][axis];
        }
    }

    let rotation = array![
        [sin_h, cos_h, 0.0],
        [-sin_d * cos_h, sin_d * sin_h, cos_d],
        [cos_d * cos_h, -cos_d * sin_h, sin_d],
    ];
    let uvw = MatrixHelper::multiply(baselines.view(), rotation.t());

    (
        uvw.column(0).to_vec(),
        uvw.column(1).to_vec(),
        uvw.column(2).to_vec(),
    )
}

/// Baseline coordinates in wavelengths, each of shape `(nbl, nchan)`.
#[derive(Debug, Clone)]
pub struct Uvw {
    pub u: Array2<f32>,
    pub v: Array2<f32>,
    pub w: Array2<f32>,
}

impl Uvw {
    /// Scales per-baseline metres by each channel frequency (GHz). The sign
    /// is flipped to match the correlator's conjugation convention.
    pub fn from_metres(ur: &[f64], vr: &[f64], wr: &[f64], freq_ghz: &[f64]) -> Self {
        let scale = |metres: &[f64]| {
            Array2::from_shape_fn((metres.len(), freq_ghz.len()), |(bl, ch)| {
                (-metres[bl] * freq_ghz[ch] * 1e9 / SPEED_OF_LIGHT) as f32
            })
        };
        Self {
            u: scale(ur),
            v: scale(vr),
            w: scale(wr),
        }
    }

    pub fn nbl(&self) -> usize {
        self.u.nrows()
    }

    pub fn nchan(&self) -> usize {
        self.u.ncols()
    }

    /// Largest `|u|` and `|v|` over all baselines and channels.
    pub fn max_extent(&self) -> (f32, f32) {
        let max_abs = |values: &Array2<f32>| values.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
        (max_abs(&self.u), max_abs(&self.v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LATITUDE: f64 = 0.594_796;

    fn transit_ra(mjd: f64, longitude: f64) -> f64 {
        gmst(mjd) + longitude
    }

    #[test]
    fn baseline_order_groups_by_second_antenna() {
        assert_eq!(baseline_order(3), vec![(0, 1), (0, 2), (1, 2)]);
        assert_eq!(baseline_order(4).len(), 6);
    }

    #[test]
    fn zenith_source_projects_east_baseline_onto_u() {
        let mjd = 58_000.25;
        let ra = transit_ra(mjd, 0.0);
        let antpos = [[0.0, 0.0, 0.0], [100.0, 0.0, 0.0]];
        let (u, v, w) = calc_uvw(mjd, (ra, LATITUDE), &antpos, LATITUDE, 0.0);
        assert!((u[0] - 100.0).abs() < 1e-6);
        assert!(v[0].abs() < 1e-6);
        assert!(w[0].abs() < 1e-6);
    }

    #[test]
    fn zenith_source_projects_north_baseline_onto_v() {
        let mjd = 58_000.25;
        let ra = transit_ra(mjd, 0.0);
        let antpos = [[0.0, 0.0, 0.0], [0.0, 100.0, 0.0]];
        let (u, v, w) = calc_uvw(mjd, (ra, LATITUDE), &antpos, LATITUDE, 0.0);
        assert!(u[0].abs() < 1e-6);
        assert!((v[0] - 100.0).abs() < 1e-6);
        assert!(w[0].abs() < 1e-6);
    }

    #[test]
    fn uvw_in_wavelengths_scales_with_frequency() {
        let uvw = Uvw::from_metres(&[SPEED_OF_LIGHT / 1e9], &[0.0], &[0.0], &[1.0, 2.0]);
        assert!((uvw.u[[0, 0]] + 1.0).abs() < 1e-6);
        assert!((uvw.u[[0, 1]] + 2.0).abs() < 1e-6);
        assert_eq!(uvw.max_extent(), (uvw.u[[0, 1]].abs(), 0.0));
    }
}
