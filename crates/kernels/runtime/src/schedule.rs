//! Redshift schedules walked by the drivers.

use reionize_foundation::redshifts_match;
use reionize_params::{FlagOptions, GlobalParams};

use crate::{Error, Result};

/// Log-spaced redshifts from `min_z` until the first value at or above
/// `max_z`, in descending order.
///
/// Every element but the highest is exactly one step below its neighbour:
/// `z[i] = (1 + z[i + 1]) * step_factor - 1`.
pub fn logscroll(min_z: f64, max_z: f64, step_factor: f64) -> Result<Vec<f64>> {
    if step_factor <= 1.0 || !step_factor.is_finite() {
        return Err(Error::Redshift(format!(
            "step factor must be > 1, got {step_factor}"
        )));
    }
    if !(min_z.is_finite() && max_z.is_finite()) || min_z < 0.0 {
        return Err(Error::Redshift(format!(
            "cannot scroll from {min_z} to {max_z}"
        )));
    }
    let mut zs = vec![min_z];
    let mut z = min_z;
    while z < max_z {
        z = (1.0 + z) * step_factor - 1.0;
        zs.push(z);
    }
    zs.reverse();
    Ok(zs)
}

/// Merge `targets` into `scroll`, descending, collapsing near-duplicates onto
/// the target value.
pub fn merge_targets(scroll: &[f64], targets: &[f64]) -> Vec<f64> {
    let mut merged: Vec<f64> = Vec::with_capacity(scroll.len() + targets.len());
    for &z in targets {
        if !merged.iter().any(|&m| redshifts_match(m, z)) {
            merged.push(z);
        }
    }
    for &z in scroll {
        if !merged.iter().any(|&m| redshifts_match(m, z)) {
            merged.push(z);
        }
    }
    merged.sort_by(|a, b| b.total_cmp(a));
    merged
}

/// The log scroll from `min_z` up to `Z_HEAT_MAX`, descending, with its top
/// entry clamped onto the ceiling.
pub fn heating_scroll(min_z: f64, globals: &GlobalParams) -> Result<Vec<f64>> {
    let mut scroll = logscroll(min_z, globals.z_heat_max, globals.zprime_step_factor)?;
    for z in &mut scroll {
        *z = z.min(globals.z_heat_max);
    }
    scroll.dedup_by(|a, b| redshifts_match(*a, *b));
    Ok(scroll)
}

/// Every redshift a coeval run has to visit to reach `targets`.
///
/// The log scroll up to `Z_HEAT_MAX` is only walked when the flags need
/// evolutionary history and the lowest target is below the ceiling. The walk
/// starts exactly at the ceiling, from an initial placeholder.
pub fn coeval_required_redshifts(
    targets: &[f64],
    flags: &FlagOptions,
    globals: &GlobalParams,
) -> Result<Vec<f64>> {
    let Some(min_z) = targets.iter().copied().reduce(f64::min) else {
        return Err(Error::Redshift("no redshifts requested".into()));
    };
    let scroll = if flags.needs_history() && min_z < globals.z_heat_max {
        heating_scroll(min_z, globals)?
    } else {
        Vec::new()
    };
    Ok(merge_targets(&scroll, targets))
}

/// Node redshifts for a lightcone spanning `[min_z, max_z]`.
pub fn lightcone_node_redshifts(
    min_z: f64,
    max_z: f64,
    flags: &FlagOptions,
    globals: &GlobalParams,
) -> Result<Vec<f64>> {
    let top = if flags.needs_history() {
        max_z.max(globals.z_heat_max)
    } else {
        max_z
    };
    logscroll(min_z, top, globals.zprime_step_factor)
}
