//! Boundary to the numerical engine.
//!
//! The orchestration layer never does physics itself. Each stage builds a
//! [`ComputeRequest`] naming its loaded predecessors and hands it, together
//! with the allocated output box, to an [`Engine`]. The integer status is the
//! only error signal that comes back.

use indexmap::IndexMap;
use reionize_params::{GlobalParams, InputParameters};
use serde::{Deserialize, Serialize};

use crate::outputs::{BoxData, Identity};
use crate::registry::OutputKind;

/// Engine status for a successful compute.
pub const STATUS_SUCCESS: i32 = 0;
/// The request was malformed (wrong kind, bad scalar).
pub const STATUS_BAD_REQUEST: i32 = 1;
/// A required predecessor or one of its fields was not supplied.
pub const STATUS_MISSING_INPUT: i32 = 2;
/// More halos than the allocated buffer holds.
pub const STATUS_HALO_OVERFLOW: i32 = 3;

/// Everything one compute call may read.
#[derive(Debug)]
pub struct ComputeRequest<'a> {
    pub identity: &'a Identity,
    pub inputs: &'a InputParameters,
    pub globals: &'a GlobalParams,
    /// Predecessors by role (`"init_boxes"`, `"previous_ionize_box"`, ...).
    /// Placeholders are passed as-is.
    pub predecessors: IndexMap<&'static str, &'a BoxData>,
    /// Extra per-call scalars, e.g. shell radii for the X-ray source stage.
    pub scalars: IndexMap<&'static str, f64>,
    /// Capacity of the halo list buffer, for the halo-list stages.
    pub halo_buffer: Option<usize>,
}

impl<'a> ComputeRequest<'a> {
    pub fn new(
        identity: &'a Identity,
        inputs: &'a InputParameters,
        globals: &'a GlobalParams,
    ) -> Self {
        Self {
            identity,
            inputs,
            globals,
            predecessors: IndexMap::new(),
            scalars: IndexMap::new(),
            halo_buffer: None,
        }
    }

    pub fn kind(&self) -> OutputKind {
        self.identity.kind
    }

    pub fn redshift(&self) -> f64 {
        self.identity.redshift.unwrap_or(0.0)
    }

    pub fn with(mut self, role: &'static str, data: &'a BoxData) -> Self {
        self.predecessors.insert(role, data);
        self
    }

    pub fn with_scalar(mut self, name: &'static str, value: f64) -> Self {
        self.scalars.insert(name, value);
        self
    }

    /// A predecessor holding computed arrays (not a placeholder).
    pub fn computed(&self, role: &str) -> Option<&'a BoxData> {
        self.predecessors
            .get(role)
            .copied()
            .filter(|d| d.is_computed() && !d.is_placeholder())
    }

    /// A predecessor that is computed or an initial placeholder.
    pub fn available(&self, role: &str) -> Option<&'a BoxData> {
        self.predecessors
            .get(role)
            .copied()
            .filter(|d| d.is_computed())
    }

    /// Short `role=Kind(z)` list for error messages.
    pub fn summary(&self) -> String {
        let roles: Vec<String> = self
            .predecessors
            .iter()
            .map(|(role, d)| match d.redshift() {
                Some(z) => format!("{role}={}(z={z})", d.kind()),
                None => format!("{role}={}", d.kind()),
            })
            .collect();
        format!("{} <- [{}]", self.identity, roles.join(", "))
    }
}

/// Photon-conservation calibration series, attached to driver outputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhotonConsData {
    pub z_analytic: Vec<f64>,
    pub q_analytic: Vec<f64>,
    pub z_calibration: Vec<f64>,
    pub nf_calibration: Vec<f64>,
    pub delta_z_photon_cons: Vec<f64>,
}

impl PhotonConsData {
    /// Redshift shift at `z`, linearly interpolated over the calibration.
    pub fn delta_z(&self, z: f64) -> f64 {
        let zs = &self.z_calibration;
        let dz = &self.delta_z_photon_cons;
        if zs.is_empty() || zs.len() != dz.len() {
            return 0.0;
        }
        if z <= zs[0] {
            return dz[0];
        }
        for i in 1..zs.len() {
            if z <= zs[i] {
                let t = (z - zs[i - 1]) / (zs[i] - zs[i - 1]);
                return dz[i - 1] + t * (dz[i] - dz[i - 1]);
            }
        }
        dz[dz.len() - 1]
    }
}

/// The numerical engine.
pub trait Engine {
    /// Fill `out` (already allocated) for the request. Returns a status code.
    fn compute(&mut self, request: &ComputeRequest<'_>, out: &mut BoxData) -> i32;

    /// Expected number of halos in the box at `redshift`.
    fn expected_n_halos(
        &self,
        redshift: f64,
        inputs: &InputParameters,
        globals: &GlobalParams,
    ) -> f64;

    /// Run the photon-conservation calibration. Returns a status code.
    fn setup_photon_cons(&mut self, inputs: &InputParameters, globals: &GlobalParams) -> i32;

    fn photon_cons_data(&self) -> Option<PhotonConsData>;

    fn free_photon_cons_memory(&mut self);

    /// Release engine-side scratch (interpolation tables, FFT plans).
    fn free_scratch(&mut self);
}

impl<E: Engine + ?Sized> Engine for Box<E> {
    fn compute(&mut self, request: &ComputeRequest<'_>, out: &mut BoxData) -> i32 {
        (**self).compute(request, out)
    }

    fn expected_n_halos(
        &self,
        redshift: f64,
        inputs: &InputParameters,
        globals: &GlobalParams,
    ) -> f64 {
        (**self).expected_n_halos(redshift, inputs, globals)
    }

    fn setup_photon_cons(&mut self, inputs: &InputParameters, globals: &GlobalParams) -> i32 {
        (**self).setup_photon_cons(inputs, globals)
    }

    fn photon_cons_data(&self) -> Option<PhotonConsData> {
        (**self).photon_cons_data()
    }

    fn free_photon_cons_memory(&mut self) {
        (**self).free_photon_cons_memory()
    }

    fn free_scratch(&mut self) {
        (**self).free_scratch()
    }
}
