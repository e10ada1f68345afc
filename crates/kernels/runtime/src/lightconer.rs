//! Lightcone geometries.
//!
//! A [`Lightconer`] owns the comoving-distance axis of a lightcone and knows
//! how to cut slices out of a pair of coeval bundles. Slices between two
//! nodes are linearly interpolated in comoving distance.

use std::ops::Range;

use ndarray::{Array2, Array3, ArrayD, ArrayView3, Axis, Ix3, Zip};
use reionize_params::{CosmoParams, FlagOptions, ParamError, UserParams};
use serde::{Deserialize, Serialize};

use crate::coeval::Coeval;
use crate::registry::{lightcone_field_kind, OutputKind};
use crate::{Error, Result};

/// Name of the line-of-sight velocity lightcone.
pub const LOS_VELOCITY: &str = "los_velocity";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Geometry {
    Rectilinear,
    Angular,
}

/// A block of consecutive slices for one quantity. The last axis of `data`
/// runs over `indices`.
#[derive(Debug, Clone)]
pub struct LightconeSlab {
    pub quantity: String,
    pub indices: Range<usize>,
    pub data: ArrayD<f32>,
}

pub trait Lightconer {
    fn geometry(&self) -> Geometry;

    /// Quantities to slice, as registry field names.
    fn quantities(&self) -> &[String];

    /// Comoving distance of every slice, ascending, in Mpc.
    fn lc_distances(&self) -> &[f64];

    fn lc_redshifts(&self) -> &[f64];

    /// Shape of one lightcone array; the last axis is the slice axis.
    fn shape(&self, user: &UserParams) -> Vec<usize>;

    /// Also track the line-of-sight velocity, for redshift-space distortions.
    fn get_los_velocity(&self) -> bool {
        false
    }

    /// Slices lying between `previous` (higher redshift) and `current`.
    fn make_lightcone_slices(&self, current: &Coeval, previous: &Coeval)
        -> Result<Vec<LightconeSlab>>;

    /// Every quantity must exist and be produced under `flags`.
    fn validate_options(&self, _user: &UserParams, flags: &FlagOptions) -> Result<()> {
        for quantity in self.quantities() {
            let kind = lightcone_field_kind(quantity).ok_or_else(|| {
                ParamError::validation(
                    quantity,
                    "not a lightcone quantity (see get_all_fieldnames(true, true))",
                )
            })?;
            let produced = match kind {
                OutputKind::TsBox => flags.use_ts_fluct,
                OutputKind::HaloBox => flags.use_halo_field,
                _ => true,
            };
            if !produced {
                return Err(ParamError::validation(
                    quantity,
                    format!("{kind} is not computed with these flag options"),
                )
                .into());
            }
        }
        Ok(())
    }
}

fn distance_axis(
    min_z: f64,
    max_z: f64,
    resolution: f64,
    cosmo: &CosmoParams,
) -> Result<(Vec<f64>, Vec<f64>)> {
    if !(resolution > 0.0) || !(max_z > min_z) || min_z < 0.0 {
        return Err(Error::Redshift(format!(
            "cannot build lightcone slices over z in [{min_z}, {max_z}] at resolution {resolution}"
        )));
    }
    let d_min = cosmo.comoving_distance(min_z);
    let d_max = cosmo.comoving_distance(max_z);
    let n = ((d_max - d_min) / resolution).floor() as usize + 1;
    let distances: Vec<f64> = (0..n).map(|i| d_min + i as f64 * resolution).collect();
    let redshifts = distances
        .iter()
        .map(|&d| cosmo.z_at_comoving_distance(d))
        .collect();
    Ok((distances, redshifts))
}

/// Indices of `distances` within `[d_lo, d_hi]`.
fn slab_range(distances: &[f64], d_lo: f64, d_hi: f64) -> Range<usize> {
    let start = distances.partition_point(|&d| d < d_lo);
    let end = distances.partition_point(|&d| d <= d_hi);
    start..end.max(start)
}

/// Comoving distances of the two bracketing coevals, low then high.
fn bracket(current: &Coeval, previous: &Coeval) -> Result<(f64, f64, CosmoParams, UserParams)> {
    if previous.redshift <= current.redshift {
        return Err(Error::Redshift(format!(
            "previous coeval at z={} is not above the current one at z={}",
            previous.redshift, current.redshift
        )));
    }
    let inputs = current.inputs();
    let d_cur = inputs.cosmo_params.comoving_distance(current.redshift);
    let d_prev = inputs.cosmo_params.comoving_distance(previous.redshift);
    Ok((d_cur, d_prev, inputs.cosmo_params, inputs.user_params))
}

fn field_of<'c>(coeval: &'c Coeval, quantity: &str) -> Result<ArrayView3<'c, f32>> {
    let array = coeval.get(quantity).ok_or_else(|| Error::NotComputed {
        kind: lightcone_field_kind(quantity).unwrap_or(OutputKind::BrightnessTemp),
        message: format!("coeval at z={} has no {quantity}", coeval.redshift),
    })?;
    array
        .view()
        .into_dimensionality::<Ix3>()
        .map_err(|e| Error::Serialization(format!("{quantity}: {e}")))
}

/// Regular grid of slices along the box's last axis, tiling the box
/// periodically.
#[derive(Debug, Clone)]
pub struct RectilinearLightconer {
    quantities: Vec<String>,
    distances: Vec<f64>,
    redshifts: Vec<f64>,
    index_offset: isize,
    get_los_velocity: bool,
}

impl RectilinearLightconer {
    /// Slices `resolution` Mpc apart from `min_z` up to `max_z`.
    ///
    /// `index_offset` shifts which box slice the first lightcone slice is
    /// cut from.
    pub fn with_equal_cdist_slices(
        min_z: f64,
        max_z: f64,
        resolution: f64,
        cosmo: &CosmoParams,
        quantities: &[&str],
        index_offset: Option<isize>,
        get_los_velocity: bool,
    ) -> Result<Self> {
        let (distances, redshifts) = distance_axis(min_z, max_z, resolution, cosmo)?;
        Ok(Self {
            quantities: quantities.iter().map(|q| q.to_string()).collect(),
            distances,
            redshifts,
            index_offset: index_offset.unwrap_or(0),
            get_los_velocity,
        })
    }

    fn box_index(&self, i: usize, cell: f64, n_para: usize) -> usize {
        let steps = ((self.distances[i] - self.distances[0]) / cell).floor() as isize;
        (steps + self.index_offset).rem_euclid(n_para as isize) as usize
    }

    fn interpolate(
        &self,
        cur: ArrayView3<'_, f32>,
        prev: ArrayView3<'_, f32>,
        range: &Range<usize>,
        d_cur: f64,
        d_prev: f64,
        cell: f64,
    ) -> ArrayD<f32> {
        let (nx, ny, n_para) = cur.dim();
        let mut out = Array3::<f32>::zeros((nx, ny, range.len()));
        for (k, i) in range.clone().enumerate() {
            let t = ((self.distances[i] - d_cur) / (d_prev - d_cur)) as f32;
            let j = self.box_index(i, cell, n_para);
            let a = cur.index_axis(Axis(2), j);
            let b = prev.index_axis(Axis(2), j);
            let mut slot = out.index_axis_mut(Axis(2), k);
            Zip::from(&mut slot)
                .and(&a)
                .and(&b)
                .for_each(|o, &x, &y| *o = x * (1.0 - t) + y * t);
        }
        out.into_dyn()
    }
}

impl Lightconer for RectilinearLightconer {
    fn geometry(&self) -> Geometry {
        Geometry::Rectilinear
    }

    fn quantities(&self) -> &[String] {
        &self.quantities
    }

    fn lc_distances(&self) -> &[f64] {
        &self.distances
    }

    fn lc_redshifts(&self) -> &[f64] {
        &self.redshifts
    }

    fn shape(&self, user: &UserParams) -> Vec<usize> {
        let n = user.hii_dim as usize;
        vec![n, n, self.distances.len()]
    }

    fn get_los_velocity(&self) -> bool {
        self.get_los_velocity
    }

    fn make_lightcone_slices(
        &self,
        current: &Coeval,
        previous: &Coeval,
    ) -> Result<Vec<LightconeSlab>> {
        let (d_cur, d_prev, _, user) = bracket(current, previous)?;
        let range = slab_range(&self.distances, d_cur, d_prev);
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let cell = user.cell_size();
        let mut slabs = Vec::with_capacity(self.quantities.len() + 1);
        for quantity in &self.quantities {
            let cur = field_of(current, quantity)?;
            let prev = field_of(previous, quantity)?;
            slabs.push(LightconeSlab {
                quantity: quantity.clone(),
                indices: range.clone(),
                data: self.interpolate(cur, prev, &range, d_cur, d_prev, cell),
            });
        }
        if self.get_los_velocity {
            let cur = field_of(current, "velocity_z")?;
            let prev = field_of(previous, "velocity_z")?;
            slabs.push(LightconeSlab {
                quantity: LOS_VELOCITY.to_string(),
                indices: range.clone(),
                data: self.interpolate(cur, prev, &range, d_cur, d_prev, cell),
            });
        }
        Ok(slabs)
    }
}

/// Slices along a set of sky directions from an observer inside the box.
#[derive(Debug, Clone)]
pub struct AngularLightconer {
    quantities: Vec<String>,
    distances: Vec<f64>,
    redshifts: Vec<f64>,
    /// Unit vectors of every direction.
    directions: Vec<[f64; 3]>,
    /// Observer position in Mpc.
    origin: [f64; 3],
    get_los_velocity: bool,
}

impl AngularLightconer {
    /// One ray per `(latitude, longitude)` pair (radians), sampled every
    /// `resolution` Mpc from `min_z` to `max_z`.
    #[allow(clippy::too_many_arguments)]
    pub fn with_equal_cdist_slices(
        min_z: f64,
        max_z: f64,
        resolution: f64,
        cosmo: &CosmoParams,
        latitude: &[f64],
        longitude: &[f64],
        quantities: &[&str],
        get_los_velocity: bool,
    ) -> Result<Self> {
        if latitude.len() != longitude.len() || latitude.is_empty() {
            return Err(ParamError::validation(
                "latitude",
                "latitude and longitude must be non-empty and of equal length",
            )
            .into());
        }
        let (distances, redshifts) = distance_axis(min_z, max_z, resolution, cosmo)?;
        let directions = latitude
            .iter()
            .zip(longitude)
            .map(|(&lat, &lon)| [lat.cos() * lon.cos(), lat.cos() * lon.sin(), lat.sin()])
            .collect();
        Ok(Self {
            quantities: quantities.iter().map(|q| q.to_string()).collect(),
            distances,
            redshifts,
            directions,
            origin: [0.0; 3],
            get_los_velocity,
        })
    }

    pub fn with_origin(mut self, origin: [f64; 3]) -> Self {
        self.origin = origin;
        self
    }

    pub fn directions(&self) -> &[[f64; 3]] {
        &self.directions
    }

    fn cell_of(&self, dir: [f64; 3], d: f64, cell: f64, dims: (usize, usize, usize)) -> [usize; 3] {
        let n = [dims.0, dims.1, dims.2];
        let mut idx = [0usize; 3];
        for a in 0..3 {
            let pos = self.origin[a] + d * dir[a];
            idx[a] = ((pos / cell).floor() as isize).rem_euclid(n[a] as isize) as usize;
        }
        idx
    }

    fn sample(
        &self,
        cur: ArrayView3<'_, f32>,
        prev: ArrayView3<'_, f32>,
        range: &Range<usize>,
        d_cur: f64,
        d_prev: f64,
        cell: f64,
    ) -> ArrayD<f32> {
        let dims = cur.dim();
        let mut out = Array2::<f32>::zeros((self.directions.len(), range.len()));
        for (k, i) in range.clone().enumerate() {
            let d = self.distances[i];
            let t = ((d - d_cur) / (d_prev - d_cur)) as f32;
            for (r, dir) in self.directions.iter().enumerate() {
                let [x, y, z] = self.cell_of(*dir, d, cell, dims);
                out[[r, k]] = cur[[x, y, z]] * (1.0 - t) + prev[[x, y, z]] * t;
            }
        }
        out.into_dyn()
    }
}

impl Lightconer for AngularLightconer {
    fn geometry(&self) -> Geometry {
        Geometry::Angular
    }

    fn quantities(&self) -> &[String] {
        &self.quantities
    }

    fn lc_distances(&self) -> &[f64] {
        &self.distances
    }

    fn lc_redshifts(&self) -> &[f64] {
        &self.redshifts
    }

    fn shape(&self, _user: &UserParams) -> Vec<usize> {
        vec![self.directions.len(), self.distances.len()]
    }

    fn get_los_velocity(&self) -> bool {
        self.get_los_velocity
    }

    fn validate_options(&self, user: &UserParams, flags: &FlagOptions) -> Result<()> {
        if self.get_los_velocity && flags.apply_rsds && !user.keep_3d_velocities {
            return Err(ParamError::validation(
                "UserParams.KEEP_3D_VELOCITIES",
                "angular lightcones need all three velocity components to track the \
                 line-of-sight velocity",
            )
            .into());
        }
        for quantity in &self.quantities {
            if lightcone_field_kind(quantity).is_none() {
                return Err(ParamError::validation(quantity, "not a lightcone quantity").into());
            }
        }
        Ok(())
    }

    fn make_lightcone_slices(
        &self,
        current: &Coeval,
        previous: &Coeval,
    ) -> Result<Vec<LightconeSlab>> {
        let (d_cur, d_prev, _, user) = bracket(current, previous)?;
        let range = slab_range(&self.distances, d_cur, d_prev);
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let cell = user.cell_size();
        let mut slabs = Vec::with_capacity(self.quantities.len() + 1);
        for quantity in &self.quantities {
            let cur = field_of(current, quantity)?;
            let prev = field_of(previous, quantity)?;
            slabs.push(LightconeSlab {
                quantity: quantity.clone(),
                indices: range.clone(),
                data: self.sample(cur, prev, &range, d_cur, d_prev, cell),
            });
        }
        if self.get_los_velocity {
            // Each ray has its own line of sight.
            let cur = [
                field_of(current, "velocity_x")?,
                field_of(current, "velocity_y")?,
                field_of(current, "velocity_z")?,
            ];
            let prev = [
                field_of(previous, "velocity_x")?,
                field_of(previous, "velocity_y")?,
                field_of(previous, "velocity_z")?,
            ];
            let dims = cur[0].dim();
            let mut data = Array2::<f32>::zeros((self.directions.len(), range.len()));
            for (k, i) in range.clone().enumerate() {
                let d = self.distances[i];
                let t = (d - d_cur) / (d_prev - d_cur);
                for (r, dir) in self.directions.iter().enumerate() {
                    let [x, y, z] = self.cell_of(*dir, d, cell, dims);
                    let project = |v: &[ArrayView3<'_, f32>; 3]| {
                        (0..3).map(|a| v[a][[x, y, z]] as f64 * dir[a]).sum::<f64>()
                    };
                    data[[r, k]] = (project(&cur) * (1.0 - t) + project(&prev) * t) as f32;
                }
            }
            slabs.push(LightconeSlab {
                quantity: LOS_VELOCITY.to_string(),
                indices: range.clone(),
                data: data.into_dyn(),
            });
        }
        Ok(slabs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_cdist_slices() {
        let cosmo = CosmoParams::default();
        let lc = RectilinearLightconer::with_equal_cdist_slices(
            6.0,
            8.0,
            5.0,
            &cosmo,
            &["brightness_temp"],
            None,
            false,
        )
        .unwrap();
        let d = lc.lc_distances();
        assert!(d.windows(2).all(|w| (w[1] - w[0] - 5.0).abs() < 1e-9));
        assert!((lc.lc_redshifts()[0] - 6.0).abs() < 1e-4);
        assert!(*lc.lc_redshifts().last().unwrap() <= 8.0 + 1e-4);
        assert!(lc.lc_redshifts().windows(2).all(|w| w[1] > w[0]));

        let user = UserParams {
            hii_dim: 8,
            ..Default::default()
        };
        assert_eq!(lc.shape(&user), vec![8, 8, d.len()]);
    }

    #[test]
    fn test_slab_range_inclusive() {
        let d = [0.0, 1.0, 2.0, 3.0, 4.0];
        assert_eq!(slab_range(&d, 1.0, 3.0), 1..4);
        assert_eq!(slab_range(&d, 0.5, 0.9), 1..1);
        assert_eq!(slab_range(&d, -1.0, 10.0), 0..5);
    }

    #[test]
    fn test_validate_rejects_unknown_quantity() {
        let cosmo = CosmoParams::default();
        let lc = RectilinearLightconer::with_equal_cdist_slices(
            6.0,
            7.0,
            10.0,
            &cosmo,
            &["not_a_field"],
            None,
            false,
        )
        .unwrap();
        assert!(lc
            .validate_options(&UserParams::default(), &FlagOptions::default())
            .is_err());

        let ts = RectilinearLightconer::with_equal_cdist_slices(
            6.0,
            7.0,
            10.0,
            &cosmo,
            &["spin_temperature"],
            None,
            false,
        )
        .unwrap();
        assert!(ts
            .validate_options(&UserParams::default(), &FlagOptions::default())
            .is_err());
        let flags = FlagOptions {
            use_ts_fluct: true,
            ..Default::default()
        };
        assert!(ts.validate_options(&UserParams::default(), &flags).is_ok());
    }

    #[test]
    fn test_angular_directions_are_unit() {
        let cosmo = CosmoParams::default();
        let lc = AngularLightconer::with_equal_cdist_slices(
            6.0,
            7.0,
            10.0,
            &cosmo,
            &[0.0, 0.5, -1.0],
            &[0.0, 1.0, 2.0],
            &["brightness_temp"],
            true,
        )
        .unwrap();
        for dir in lc.directions() {
            let norm: f64 = dir.iter().map(|c| c * c).sum();
            assert!((norm - 1.0).abs() < 1e-12);
        }
        assert_eq!(lc.shape(&UserParams::default()), vec![3, lc.lc_distances().len()]);
        assert!(AngularLightconer::with_equal_cdist_slices(
            6.0, 7.0, 10.0, &cosmo, &[0.0], &[], &["brightness_temp"], false
        )
        .is_err());
    }
}
