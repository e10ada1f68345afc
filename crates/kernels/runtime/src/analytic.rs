//! Closed-form stand-in for the numerical engine.
//!
//! Every kernel here is a cheap, deterministic approximation: Gaussian random
//! fields from the identity seed, linear growth, a logistic collapsed
//! fraction, and local (per-cell) ionisation and heating. It honours the same
//! inputs, outputs and status codes as the real engine, so the whole
//! orchestration layer runs on it end to end.

use ndarray::{ArrayD, Axis, IxDyn, Zip};
use reionize_foundation::RngStream;
use reionize_params::{GlobalParams, InputParameters, PhotonConsType};

use crate::engine::{
    ComputeRequest, Engine, PhotonConsData, STATUS_BAD_REQUEST, STATUS_HALO_OVERFLOW,
    STATUS_MISSING_INPUT, STATUS_SUCCESS,
};
use crate::outputs::BoxData;
use crate::registry::OutputKind;

/// Velocity dispersion of the initial field, Mpc/s (about 300 km/s).
const VELOCITY_SIGMA: f64 = 1e-17;
/// km per Mpc.
pub(crate) const MPC_KM: f64 = 3.085_677_581e19;
/// Critical density over h^2, Msun / Mpc^3.
const RHO_CRIT_H2: f64 = 2.775e11;
const T_CMB0: f64 = 2.728;
/// Redshift of thermal decoupling from the CMB.
const Z_DECOUPLE: f64 = 150.0;
/// Fully ionised gas temperature, K.
const T_IONISED: f32 = 1e4;

type KernelResult = std::result::Result<(), i32>;

/// Deterministic closed-form engine.
#[derive(Debug, Default)]
pub struct AnalyticEngine {
    photon_cons: Option<PhotonConsData>,
}

impl AnalyticEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

fn growth(z: f64) -> f64 {
    1.0 / (1.0 + z)
}

/// Mean collapsed fraction in star-forming halos.
fn collapsed_fraction(z: f64, inputs: &InputParameters) -> f64 {
    let f_star = 10f64.powf(inputs.astro_params.f_star10).min(1.0);
    4.0 * f_star / (1.0 + ((z - 7.0) / 1.2).exp())
}

fn adiabatic_temperature(z: f64) -> f64 {
    T_CMB0 * (1.0 + z).powi(2) / (1.0 + Z_DECOUPLE)
}

fn input<'a>(req: &ComputeRequest<'a>, role: &str, field: &str) -> Result<&'a ArrayD<f32>, i32> {
    req.computed(role)
        .and_then(|d| d.array(field))
        .ok_or(STATUS_MISSING_INPUT)
}

fn output<'a>(out: &'a mut BoxData, field: &str) -> Result<&'a mut ArrayD<f32>, i32> {
    out.array_mut(field).ok_or(STATUS_BAD_REQUEST)
}

fn mean(a: &ArrayD<f32>) -> f64 {
    if a.is_empty() {
        return 0.0;
    }
    a.iter().map(|v| *v as f64).sum::<f64>() / a.len() as f64
}

/// Block-average `src` onto a grid of `shape`.
fn downsample(src: &ArrayD<f32>, shape: &[usize]) -> ArrayD<f32> {
    let mut sum = ArrayD::<f64>::zeros(IxDyn(shape));
    let mut count = ArrayD::<f64>::zeros(IxDyn(shape));
    let src_shape = src.shape().to_vec();
    for (idx, v) in src.indexed_iter() {
        let target = [
            idx[0] * shape[0] / src_shape[0],
            idx[1] * shape[1] / src_shape[1],
            idx[2] * shape[2] / src_shape[2],
        ];
        sum[IxDyn(&target)] += *v as f64;
        count[IxDyn(&target)] += 1.0;
    }
    Zip::from(&sum)
        .and(&count)
        .map_collect(|s, c| if *c > 0.0 { (s / c) as f32 } else { 0.0 })
}

fn cell_of(coord: f32, n: usize) -> usize {
    (coord.floor() as i64).rem_euclid(n as i64) as usize
}

impl AnalyticEngine {
    fn initial_conditions(&self, req: &ComputeRequest<'_>, out: &mut BoxData) -> KernelResult {
        let seed = req.identity.random_seed.ok_or(STATUS_BAD_REQUEST)?;
        let root = RngStream::derive(seed, "initial_conditions");
        let sigma = req.inputs.cosmo_params.sigma_8;
        for (name, sd) in [
            ("hires_density", sigma),
            ("hires_vx", VELOCITY_SIGMA),
            ("hires_vy", VELOCITY_SIGMA),
            ("hires_vz", VELOCITY_SIGMA),
        ] {
            let mut stream = root.substream(name);
            let slice = output(out, name)?
                .as_slice_mut()
                .ok_or(STATUS_BAD_REQUEST)?;
            stream.fill_normal(slice, 0.0, sd);
        }

        let low = req.inputs.user_params.hii_shape();
        for (hi, lo) in [
            ("hires_density", "lowres_density"),
            ("hires_vx", "lowres_vx"),
            ("hires_vy", "lowres_vy"),
            ("hires_vz", "lowres_vz"),
        ] {
            let averaged = downsample(output(out, hi)?, &low);
            out.set_array(lo, averaged);
        }

        if req.inputs.user_params.use_relative_velocities {
            let vx = output(out, "lowres_vx")?.clone();
            let vy = output(out, "lowres_vy")?.clone();
            let vz = output(out, "lowres_vz")?.clone();
            let vcb = Zip::from(&vx).and(&vy).and(&vz).map_collect(|x, y, z| {
                let v = ((*x as f64).powi(2) + (*y as f64).powi(2) + (*z as f64).powi(2)).sqrt();
                (0.1 * v * MPC_KM) as f32
            });
            out.set_array("lowres_vcb", vcb);
        }
        Ok(())
    }

    fn perturb_field(&self, req: &ComputeRequest<'_>, out: &mut BoxData) -> KernelResult {
        let d = growth(req.redshift()) as f32;
        let low = req.inputs.user_params.hii_shape();
        let high_res = req.inputs.user_params.perturb_on_high_res;
        for (field, lowres, hires) in [
            ("density", "lowres_density", "hires_density"),
            ("velocity_x", "lowres_vx", "hires_vx"),
            ("velocity_y", "lowres_vy", "hires_vy"),
            ("velocity_z", "lowres_vz", "hires_vz"),
        ] {
            let source = if high_res {
                downsample(input(req, "init_boxes", hires)?, &low)
            } else {
                input(req, "init_boxes", lowres)?.clone()
            };
            out.set_array(field, source.mapv(|v| v * d));
        }
        Ok(())
    }

    fn halo_list(&self, req: &ComputeRequest<'_>, out: &mut BoxData) -> KernelResult {
        let z = req.redshift();
        let seed = req.identity.random_seed.ok_or(STATUS_BAD_REQUEST)?;
        let n = self
            .expected_n_halos(z, req.inputs, req.globals)
            .round()
            .max(0.0) as usize;
        if req.halo_buffer.is_some_and(|cap| n > cap) {
            return Err(STATUS_HALO_OVERFLOW);
        }

        let user = &req.inputs.user_params;
        let dims = user.hii_shape();
        let mut rng = RngStream::derive(seed, &format!("halo_field:{z:.6}"));
        let descendants = req
            .computed("halos_desc")
            .and_then(|d| d.array("halo_masses"));

        let mut masses = Vec::with_capacity(n);
        for i in 0..n {
            let sampled = rng.power_law(user.sampler_min_mass, 0.9);
            let m = match descendants {
                Some(desc) if i < desc.len() => 0.8 * desc[IxDyn(&[i])] as f64,
                _ => sampled,
            };
            masses.push(m.clamp(user.sampler_min_mass, 1e15) as f32);
        }
        let mut coords = Vec::with_capacity(3 * n);
        for _ in 0..n {
            for d in dims {
                coords.push(rng.uniform_range(0.0, d as f64) as f32);
            }
        }
        let draws = |label: &str| {
            let mut stream = rng.substream(label);
            let mut v = vec![0.0f32; n];
            stream.fill_normal(&mut v, 0.0, 1.0);
            v
        };
        let star = draws("star_rng");
        let sfr = draws("sfr_rng");
        let xray = draws("xray_rng");

        let vec1 = |v: Vec<f32>| ArrayD::from_shape_vec(IxDyn(&[n]), v).map_err(|_| STATUS_BAD_REQUEST);
        out.set_array("halo_masses", vec1(masses)?);
        out.set_array(
            "halo_coords",
            ArrayD::from_shape_vec(IxDyn(&[n, 3]), coords).map_err(|_| STATUS_BAD_REQUEST)?,
        );
        out.set_array("star_rng", vec1(star)?);
        out.set_array("sfr_rng", vec1(sfr)?);
        out.set_array("xray_rng", vec1(xray)?);
        out.set_scalar("n_halos", n as f64);
        Ok(())
    }

    fn perturb_halo_list(&self, req: &ComputeRequest<'_>, out: &mut BoxData) -> KernelResult {
        let shift = (0.5 * growth(req.redshift())) as f32;
        let dims = req.inputs.user_params.hii_shape();
        let n = input(req, "halo_field", "halo_masses")?.len();
        if req.halo_buffer.is_some_and(|cap| n > cap) {
            return Err(STATUS_HALO_OVERFLOW);
        }
        for name in ["halo_masses", "star_rng", "sfr_rng", "xray_rng"] {
            out.set_array(name, input(req, "halo_field", name)?.clone());
        }
        let mut coords = input(req, "halo_field", "halo_coords")?.clone();
        for mut row in coords.axis_iter_mut(Axis(0)) {
            for (axis, c) in row.iter_mut().enumerate() {
                *c = (*c + shift).rem_euclid(dims[axis] as f32);
            }
        }
        out.set_array("halo_coords", coords);
        out.set_scalar("n_halos", n as f64);
        Ok(())
    }

    fn halo_box(&self, req: &ComputeRequest<'_>, out: &mut BoxData) -> KernelResult {
        let z = req.redshift();
        let inputs = req.inputs;
        let astro = &inputs.astro_params;
        let cosmo = &inputs.cosmo_params;
        let user = &inputs.user_params;
        let dims = user.hii_shape();
        let mini = inputs.flag_options.use_mini_halos;

        let baryon_fraction = cosmo.omb / cosmo.omm;
        let hubble_time = MPC_KM / cosmo.hubble(z);
        let f_star = |m: f64| (10f64.powf(astro.f_star10) * (m / 1e10).powf(astro.alpha_star)).min(1.0);
        let f_esc = 10f64.powf(astro.f_esc10).min(1.0);
        let xray_per_sfr = 10f64.powf(astro.l_x - 40.0);

        let mut mass = ArrayD::<f32>::zeros(IxDyn(&dims));
        let mut count = ArrayD::<f32>::zeros(IxDyn(&dims));
        let mut stars = ArrayD::<f32>::zeros(IxDyn(&dims));

        match req.computed("pt_halos") {
            Some(halos) => {
                let masses = halos.array("halo_masses").ok_or(STATUS_MISSING_INPUT)?;
                let coords = halos.array("halo_coords").ok_or(STATUS_MISSING_INPUT)?;
                let star_rng = halos.array("star_rng").ok_or(STATUS_MISSING_INPUT)?;
                for (i, row) in coords.axis_iter(Axis(0)).enumerate() {
                    let cell = [
                        cell_of(row[0], dims[0]),
                        cell_of(row[1], dims[1]),
                        cell_of(row[2], dims[2]),
                    ];
                    let m = masses[IxDyn(&[i])] as f64;
                    let scatter = (astro.sigma_star * star_rng[IxDyn(&[i])] as f64).exp();
                    mass[IxDyn(&cell)] += m as f32;
                    count[IxDyn(&cell)] += 1.0;
                    stars[IxDyn(&cell)] += (f_star(m) * m * baryon_fraction * scatter) as f32;
                }
            }
            None if inputs.flag_options.fixed_halo_grids => {}
            None => return Err(STATUS_MISSING_INPUT),
        }

        // Mass below the sampler resolution, or the whole grid when fixed.
        if inputs.flag_options.fixed_halo_grids || req.globals.avg_below_sampler {
            let density = input(req, "perturbed_field", "density")?;
            let cell_mass = RHO_CRIT_H2 * cosmo.hlittle.powi(2) * cosmo.omm * user.cell_size().powi(3);
            let fcoll = collapsed_fraction(z, inputs);
            let m_typical = user.sampler_min_mass;
            Zip::from(&mut mass)
                .and(&mut stars)
                .and(density)
                .for_each(|m, s, d| {
                    let extra = cell_mass * fcoll * (1.0 + *d as f64).max(0.0);
                    *m += extra as f32;
                    *s += (f_star(m_typical) * extra * baryon_fraction) as f32;
                });
        }

        let sfr = stars.mapv(|s| (s as f64 / (astro.t_star * hubble_time)) as f32);
        let mini_scale = if mini { 10f64.powf(astro.f_star7_mini) } else { 0.0 };
        let stars_mini = stars.mapv(|s| (s as f64 * mini_scale) as f32);
        let sfr_mini = sfr.mapv(|s| (s as f64 * mini_scale) as f32);
        let n_ion = stars.mapv(|s| (s as f64 * req.globals.pop2_ion * f_esc) as f32);
        let xray = sfr.mapv(|s| (s as f64 * xray_per_sfr) as f32);
        let whalo = Zip::from(&sfr)
            .and(&mass)
            .map_collect(|s, m| if *m > 0.0 { s * (*m).log10() } else { 0.0 });

        let log10_mcrit = if mini {
            let j21 = req
                .computed("previous_spin_temp")
                .and_then(|d| d.array("J_21_LW"))
                .map(mean)
                .unwrap_or(0.0);
            5.0 + astro.a_lw * (1.0 + j21).log10()
        } else {
            0.0
        };

        out.set_array("halo_mass", mass);
        out.set_array("count", count);
        out.set_array("halo_stars", stars);
        out.set_array("halo_stars_mini", stars_mini);
        out.set_array("halo_sfr", sfr);
        out.set_array("halo_sfr_mini", sfr_mini);
        out.set_array("n_ion", n_ion);
        out.set_array("halo_xray", xray);
        out.set_array("whalo_sfr", whalo);
        out.set_scalar("log10_Mcrit_LW_ave", log10_mcrit);
        Ok(())
    }

    fn xray_source(&self, req: &ComputeRequest<'_>, out: &mut BoxData) -> KernelResult {
        let shell = *req.scalars.get("R_ct").ok_or(STATUS_BAD_REQUEST)? as usize;
        let r_outer = *req.scalars.get("R_outer").ok_or(STATUS_BAD_REQUEST)?;
        if shell >= req.globals.num_filter_steps_for_ts {
            return Err(STATUS_BAD_REQUEST);
        }
        let smoothing = (-r_outer / (4.0 * req.inputs.user_params.cell_size())).exp() as f32;
        let halobox = req.computed("halobox").ok_or(STATUS_MISSING_INPUT)?;

        let mut means = [0.0f64; 2];
        for (i, (src, dst)) in [
            ("halo_sfr", "filtered_sfr"),
            ("halo_sfr_mini", "filtered_sfr_mini"),
            ("halo_xray", "filtered_xray"),
        ]
        .into_iter()
        .enumerate()
        {
            let field = halobox.array(src).ok_or(STATUS_MISSING_INPUT)?;
            let m = mean(field) as f32;
            let filtered = field.mapv(|v| m + (v - m) * smoothing);
            if i < 2 {
                means[i] = mean(&filtered);
            }
            output(out, dst)?
                .index_axis_mut(Axis(0), shell)
                .assign(&filtered);
        }
        output(out, "mean_sfr")?[IxDyn(&[shell])] = means[0] as f32;
        output(out, "mean_sfr_mini")?[IxDyn(&[shell])] = means[1] as f32;
        output(out, "mean_log10_Mcrit_LW")?[IxDyn(&[shell])] =
            halobox.scalar("log10_Mcrit_LW_ave").unwrap_or(0.0) as f32;
        Ok(())
    }

    fn spin_temperature(&self, req: &ComputeRequest<'_>, out: &mut BoxData) -> KernelResult {
        let z = req.redshift();
        let inputs = req.inputs;
        let density = input(req, "perturbed_field", "density")?;
        let t_cmb = T_CMB0 * (1.0 + z);
        let fcoll = collapsed_fraction(z, inputs);

        let mut heating = 1e3 * fcoll * 10f64.powf(inputs.astro_params.l_x - 40.0);
        if let Some(xray) = req.computed("xray_source_box") {
            let total: f64 = xray
                .array("mean_sfr")
                .map(|a| a.iter().map(|v| *v as f64).sum())
                .unwrap_or(0.0);
            heating *= 1.0 + total.max(0.0).min(1e3);
        }
        let t_ad = adiabatic_temperature(z);

        let mut t_k = density.mapv(|d| {
            let contrast = (1.0 + d as f64).max(0.0);
            (t_ad * contrast.powf(2.0 / 3.0) + heating * contrast) as f32
        });
        if let Some(prev) = req.computed("previous_spin_temp") {
            let prev_z = prev.redshift().unwrap_or(z);
            let cooling = (((1.0 + z) / (1.0 + prev_z)).powi(2)) as f32;
            let prev_tk = prev.array("kinetic_temp_neutral").ok_or(STATUS_MISSING_INPUT)?;
            Zip::from(&mut t_k)
                .and(prev_tk)
                .for_each(|t, p| *t = t.max(p * cooling));
        }

        let x_alpha = 10.0 * fcoll * (1.0 + z) / 10.0;
        let x_e = 1e-4 + 0.01 * fcoll;
        let t_s = t_k.mapv(|tk| {
            let tk = (tk as f64).max(1e-3);
            ((1.0 + x_alpha) / (1.0 / t_cmb + x_alpha / tk)) as f32
        });

        out.set_array("kinetic_temp_neutral", t_k);
        out.set_array("spin_temperature", t_s);
        output(out, "xray_ionised_fraction")?.fill(x_e as f32);
        output(out, "J_21_LW")?.fill((0.1 * x_alpha) as f32);
        Ok(())
    }

    fn ionize(&self, req: &ComputeRequest<'_>, out: &mut BoxData) -> KernelResult {
        let mut z = req.redshift();
        let inputs = req.inputs;
        if inputs.flag_options.photon_cons_type == PhotonConsType::Redshift {
            if let Some(data) = &self.photon_cons {
                z -= data.delta_z(z);
            }
        }
        let density = input(req, "perturbed_field", "density")?;
        let zeta = inputs.astro_params.hii_eff_factor;
        let fcoll_mean = collapsed_fraction(z, inputs);
        let mini = inputs.flag_options.use_mini_halos;

        let mut fcoll = density.mapv(|d| (fcoll_mean * (1.0 + d as f64).max(0.0)) as f32);
        if let Some(hb) = req.computed("halobox") {
            let n_ion = hb.array("n_ion").ok_or(STATUS_MISSING_INPUT)?;
            let scale = mean(n_ion);
            if scale > 0.0 {
                Zip::from(&mut fcoll)
                    .and(n_ion)
                    .for_each(|f, n| *f *= (*n as f64 / scale).clamp(0.0, 10.0) as f32);
            }
        }
        let mut xh = fcoll.mapv(|f| (1.0 - zeta as f32 * f).clamp(0.0, 1.0));

        let prev = req.computed("previous_ionize_box");
        if let Some(prev) = prev {
            let prev_xh = prev.array("xH_box").ok_or(STATUS_MISSING_INPUT)?;
            Zip::from(&mut xh).and(prev_xh).for_each(|x, p| *x = x.min(*p));
        }

        let prev_z = prev.and_then(|p| p.redshift()).unwrap_or(z);
        let mut dnrec = ArrayD::<f32>::zeros(xh.raw_dim());
        if inputs.flag_options.inhomo_reco {
            if let Some(prev_rec) = req.available("previous_ionize_box").and_then(|p| p.array("dNrec_box")) {
                dnrec.assign(prev_rec);
            }
            let dz = (prev_z - z).max(0.0) as f32;
            Zip::from(&mut dnrec)
                .and(&xh)
                .and(density)
                .for_each(|r, x, d| *r += (1.0 - x) * 0.01 * (1.0 + d).powi(2) * dz);
            Zip::from(&mut xh)
                .and(&dnrec)
                .for_each(|x, r| *x = (*x + 0.1 * r).min(1.0));
        }

        let mut z_re = ArrayD::<f32>::zeros(xh.raw_dim());
        if let Some(prev_zre) = req.available("previous_ionize_box").and_then(|p| p.array("z_re_box")) {
            z_re.assign(prev_zre);
        }
        let this_z = req.redshift() as f32;
        Zip::from(&mut z_re).and(&xh).for_each(|r, x| {
            if *r <= 0.0 && *x < 0.5 {
                *r = this_z;
            }
        });

        let t_neutral = match req.computed("spin_temp") {
            Some(st) => st.array("kinetic_temp_neutral").ok_or(STATUS_MISSING_INPUT)?.clone(),
            None => ArrayD::from_elem(xh.raw_dim(), adiabatic_temperature(z) as f32),
        };
        let temp = Zip::from(&xh)
            .and(&t_neutral)
            .map_collect(|x, t| x * t + (1.0 - x) * T_IONISED);

        let r_max = inputs.astro_params.r_bubble_max(&inputs.flag_options) as f32;
        let gamma = xh.mapv(|x| (1.0 - x) * zeta as f32 * 0.01);
        let mfp = xh.mapv(|x| (1.0 - x) * r_max);
        let fcoll_mini = if mini { fcoll.mapv(|f| 0.1 * f) } else { ArrayD::zeros(xh.raw_dim()) };

        let m_turn = if inputs.flag_options.use_mass_dependent_zeta {
            inputs.astro_params.m_turn
        } else {
            8.5
        };

        out.set_scalar("mean_f_coll", mean(&fcoll));
        out.set_scalar("mean_f_coll_MINI", mean(&fcoll_mini));
        out.set_scalar("log10_Mturnover_ave", m_turn);
        out.set_scalar("log10_Mturnover_MINI_ave", if mini { m_turn - 1.0 } else { 0.0 });
        out.set_array("xH_box", xh);
        out.set_array("Gamma12_box", gamma);
        out.set_array("MFP_box", mfp);
        out.set_array("z_re_box", z_re);
        out.set_array("dNrec_box", dnrec);
        out.set_array("temp_kinetic_all_gas", temp);
        out.set_array("Fcoll", fcoll);
        out.set_array("Fcoll_MINI", fcoll_mini);
        Ok(())
    }

    fn brightness_temperature(&self, req: &ComputeRequest<'_>, out: &mut BoxData) -> KernelResult {
        let z = req.redshift();
        let cosmo = &req.inputs.cosmo_params;
        let xh = input(req, "ionized_box", "xH_box")?;
        let density = input(req, "perturbed_field", "density")?;
        let h2 = cosmo.hlittle.powi(2);
        let t0 = 27.0
            * (cosmo.omb * h2 / 0.023)
            * ((0.15 / (cosmo.omm * h2)) * (1.0 + z) / 10.0).sqrt();
        let t_cmb = T_CMB0 * (1.0 + z);

        let mut tb = Zip::from(xh)
            .and(density)
            .map_collect(|x, d| (t0 * *x as f64 * (1.0 + *d as f64)) as f32);
        if let Some(st) = req.computed("spin_temp") {
            let ts = st.array("spin_temperature").ok_or(STATUS_MISSING_INPUT)?;
            Zip::from(&mut tb).and(ts).for_each(|t, s| {
                let s = (*s as f64).max(1e-3);
                *t *= (1.0 - t_cmb / s) as f32;
            });
        }
        out.set_array("brightness_temp", tb);
        Ok(())
    }
}

impl Engine for AnalyticEngine {
    fn compute(&mut self, request: &ComputeRequest<'_>, out: &mut BoxData) -> i32 {
        if out.kind() != request.kind() {
            return STATUS_BAD_REQUEST;
        }
        let result = match request.kind() {
            OutputKind::InitialConditions => self.initial_conditions(request, out),
            OutputKind::PerturbedField => self.perturb_field(request, out),
            OutputKind::HaloField => self.halo_list(request, out),
            OutputKind::PerturbHaloField => self.perturb_halo_list(request, out),
            OutputKind::HaloBox => self.halo_box(request, out),
            OutputKind::XraySourceBox => self.xray_source(request, out),
            OutputKind::TsBox => self.spin_temperature(request, out),
            OutputKind::IonizedBox => self.ionize(request, out),
            OutputKind::BrightnessTemp => self.brightness_temperature(request, out),
        };
        match result {
            Ok(()) => STATUS_SUCCESS,
            Err(status) => status,
        }
    }

    fn expected_n_halos(
        &self,
        redshift: f64,
        inputs: &InputParameters,
        _globals: &GlobalParams,
    ) -> f64 {
        let user = &inputs.user_params;
        let volume = user.box_len.powi(3) * user.non_cubic_factor;
        let number_density = 1e-2 * (-redshift / 4.0).exp() * (5e7 / user.sampler_min_mass);
        volume * number_density
    }

    fn setup_photon_cons(&mut self, inputs: &InputParameters, globals: &GlobalParams) -> i32 {
        let z_end = globals.photon_cons_end_calibz;
        let z_start = globals.z_heat_max;
        if z_start <= z_end {
            return STATUS_BAD_REQUEST;
        }
        let steps = 20;
        let zeta = inputs.astro_params.hii_eff_factor;
        let mut data = PhotonConsData::default();
        for i in 0..=steps {
            let z = z_end + (z_start - z_end) * i as f64 / steps as f64;
            let q = (zeta * collapsed_fraction(z, inputs)).min(1.0);
            data.z_analytic.push(z);
            data.q_analytic.push(q);
            data.z_calibration.push(z);
            data.nf_calibration.push(1.0 - q);
            data.delta_z_photon_cons.push(0.02 * (z - z_end));
        }
        self.photon_cons = Some(data);
        STATUS_SUCCESS
    }

    fn photon_cons_data(&self) -> Option<PhotonConsData> {
        self.photon_cons.clone()
    }

    fn free_photon_cons_memory(&mut self) {
        self.photon_cons = None;
    }

    fn free_scratch(&mut self) {}
}
