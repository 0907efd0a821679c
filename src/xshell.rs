//! X-shell optimization: a linkage assembled flat and deployed into a
//! curved shape.
//!
//! The flat and deployed linkages share the rest lengths and rest kappas.
//! The objective is evaluated on the deployed equilibrium (held at the
//! target average joint angle); the flat equilibrium carries the
//! constraints:
//!
//!   c(p)                = ½ Σ_v z_v²                (flatness, = 0)
//!   angle_constraints(p) = α_j − ε  for every joint j   (≥ 0)
//!
//! The minimum-angle bound is imposed joint by joint so that each
//! constraint stays smooth when two joints tie for the smallest angle.

use crate::equilibrium::Equilibrium;
use crate::fitter::TargetSurfaceFitter;
use crate::gradients::{adjoint_solve, hessian_vector, pushforward, total_gradient, DesignVariables, ScalarFunctional};
use crate::linkage::RodLinkage;
use crate::linkage_optimization::{Configuration, DesignProblem, HessianCoefficients, LinkageOptimization, LinkageOptimizationSettings};
use crate::optimizer::{optimize, OptimizationReport, OptimizeOptions};
use crate::target_surface::TargetSurface;
use crate::types::{check_len, ElasticObject, ErodError, ErodResult, OptEnergyType};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct XShellSettings {
    pub linkage: LinkageOptimizationSettings,
    /// Margin ε of the minimum-angle constraint.
    pub min_angle_eps: f64,
    /// Hold the flat assembly at its initial average angle with an
    /// actuation torque instead of leaving the hinges free.
    pub allow_flat_actuation: bool,
    /// Append the deployed target angle to the design parameters.
    pub optimize_target_angle: bool,
}

impl Default for XShellSettings {
    fn default() -> Self {
        Self {
            linkage: LinkageOptimizationSettings::default(),
            min_angle_eps: 0.01,
            allow_flat_actuation: true,
            optimize_target_angle: false,
        }
    }
}

/// ½ Σ z² over the vertices.
#[derive(Debug, Clone, Copy, Default)]
struct Flatness;

impl ScalarFunctional<RodLinkage> for Flatness {
    fn value(&self, object: &RodLinkage) -> ErodResult<f64> {
        Ok(object.network().positions().chunks_exact(3).map(|p| 0.5 * p[2] * p[2]).sum())
    }
    fn grad(&self, object: &RodLinkage) -> ErodResult<Vec<f64>> {
        let mut g = vec![0.0; object.num_extended_dof()];
        for (v, p) in object.network().positions().chunks_exact(3).enumerate() {
            g[3 * v + 2] = p[2];
        }
        Ok(g)
    }
    fn delta_grad(&self, object: &RodLinkage, dz: &[f64]) -> ErodResult<Vec<f64>> {
        check_len("flatness direction", object.num_extended_dof(), dz.len())?;
        let mut out = vec![0.0; dz.len()];
        for v in 0..object.network().num_vertices() {
            out[3 * v + 2] = dz[3 * v + 2];
        }
        Ok(out)
    }
}

/// Opening angle of one joint.
#[derive(Debug, Clone, Copy)]
struct JointAngle(usize);

impl ScalarFunctional<RodLinkage> for JointAngle {
    fn value(&self, object: &RodLinkage) -> ErodResult<f64> {
        Ok(object.joint_angle_stencil(self.0).value)
    }
    fn grad(&self, object: &RodLinkage) -> ErodResult<Vec<f64>> {
        let mut g = vec![0.0; object.num_extended_dof()];
        object.joint_angle_stencil(self.0).scatter_gradient(&mut g, 1.0);
        Ok(g)
    }
    fn delta_grad(&self, object: &RodLinkage, dz: &[f64]) -> ErodResult<Vec<f64>> {
        check_len("joint angle direction", object.num_extended_dof(), dz.len())?;
        let mut out = vec![0.0; dz.len()];
        object.joint_angle_stencil(self.0).scatter_hessian_product(dz, &mut out, 1.0);
        Ok(out)
    }
}

#[derive(Debug)]
pub struct XShellOptimization {
    deployed: LinkageOptimization<RodLinkage>,
    flat: Configuration<RodLinkage>,
    flat_version: Option<u64>,
    flat_vars: DesignVariables,
    settings: XShellSettings,
    last_valid_grad: Option<Vec<f64>>,
}

impl XShellOptimization {
    /// `flat` and `deployed` must share topology; `target_angle` is the
    /// average joint angle the deployed linkage is held at.
    pub fn new(
        flat: RodLinkage,
        deployed: RodLinkage,
        flat_fixed: Vec<usize>,
        deployed_fixed: Vec<usize>,
        target_angle: f64,
        settings: XShellSettings,
    ) -> ErodResult<Self> {
        if flat.layout() != deployed.layout() || flat.joint_vertices() != deployed.joint_vertices() {
            return Err(ErodError::InvalidInput("flat and deployed linkages differ in topology".into()));
        }
        let flat_vars = DesignVariables::rest_quantities(&flat.layout());
        let deployed_vars = DesignVariables { angle: settings.optimize_target_angle, ..flat_vars.clone() };
        let fitter = TargetSurfaceFitter::new(&deployed);
        let deployed_opt = LinkageOptimization::with_design_variables(
            deployed,
            deployed_fixed,
            Some(target_angle),
            fitter,
            settings.linkage.clone(),
            deployed_vars,
        )?;
        let flat_angle = if settings.allow_flat_actuation { Some(flat.average_joint_angle()?) } else { None };
        let mut me = Self {
            deployed: deployed_opt,
            flat: Configuration::new(flat, flat_fixed, flat_angle),
            flat_version: None,
            flat_vars,
            settings,
            last_valid_grad: None,
        };
        if !me.update_flat()? {
            warn!("initial flat equilibrium solve failed");
        }
        me.flat.commit();
        Ok(me)
    }

    pub fn deployed_optimization(&self) -> &LinkageOptimization<RodLinkage> {
        &self.deployed
    }
    pub fn deployed_optimization_mut(&mut self) -> &mut LinkageOptimization<RodLinkage> {
        &mut self.deployed
    }
    pub fn flat_linkage(&self) -> &RodLinkage {
        self.flat.object()
    }
    pub fn deployed_linkage(&self) -> &RodLinkage {
        self.deployed.object()
    }
    pub fn fixed_flat_vars(&self) -> &[usize] {
        self.flat.fixed()
    }
    pub fn fixed_deployed_vars(&self) -> &[usize] {
        self.deployed.configuration().fixed()
    }
    pub fn target_angle(&self) -> Option<f64> {
        self.deployed.configuration().angle()
    }
    pub fn settings(&self) -> &XShellSettings {
        &self.settings
    }
    pub fn is_valid(&self) -> bool {
        self.deployed.is_valid() && self.flat.is_valid()
    }

    // ── Target surface ────────────────────────────────────

    pub fn set_target_surface(&mut self, surface: TargetSurface) {
        self.deployed
            .with_fitter(|f, o| f.set_target_surface(o.network().positions(), surface));
    }

    pub fn load_target_surface<P: AsRef<Path>>(&mut self, path: P) -> ErodResult<()> {
        self.set_target_surface(TargetSurface::load_obj(path)?);
        Ok(())
    }

    pub fn save_target_surface<P: AsRef<Path>>(&self, path: P) -> ErodResult<()> {
        self.deployed.fitter().save_target_surface(path)
    }

    pub fn scale_joint_weights(&mut self, joint_pos_weight: f64, feature_multiplier: f64, additional_feature_pts: &[usize]) {
        self.deployed
            .with_fitter(|f, _| f.scale_joint_weights(joint_pos_weight, feature_multiplier, additional_feature_pts));
    }

    pub fn set_target_joint_pos_vs_target_surface_tradeoff(&mut self, joint_pos_weight: f64) {
        self.deployed
            .with_fitter(|f, _| f.set_target_joint_pos_vs_target_surface_tradeoff(joint_pos_weight));
    }

    pub fn set_target_joints_position(&mut self, targets: ndarray::Array2<f64>) -> ErodResult<()> {
        self.deployed.with_fitter(|f, _| f.set_target_joints_position(targets))
    }

    // ── Flat equilibrium ──────────────────────────────────

    fn flat_params<'a>(&self, p: &'a [f64]) -> &'a [f64] {
        &p[..self.flat_vars.len()]
    }

    fn update_flat(&mut self) -> ErodResult<bool> {
        let p = self.deployed.params().to_vec();
        let valid = match self.flat.set_design(&self.flat_vars, &p[..self.flat_vars.len()]) {
            Ok(()) => self.flat.update(self.deployed.strategy(), self.deployed.newton_options())?,
            Err(e) => {
                warn!(error = %e, "design rejected by the flat linkage");
                self.flat.invalidate();
                false
            }
        };
        self.flat_version = Some(self.deployed.param_version());
        Ok(valid)
    }

    fn flat_equilibrium(&self) -> ErodResult<&Equilibrium> {
        self.flat.equilibrium().ok_or(ErodError::MissingFactorization)
    }

    /// Parameter gradient of a functional of the flat equilibrium.
    fn flat_gradient<F: ScalarFunctional<RodLinkage>>(&self, functional: &F) -> ErodResult<Vec<f64>> {
        let object = self.flat.object();
        let g = functional.grad(object)?;
        let adjoint = adjoint_solve(self.flat_equilibrium()?, &g)?;
        let mut grad = total_gradient(object, &self.flat_vars, &g, &adjoint)?;
        if self.settings.optimize_target_angle {
            grad.push(0.0);
        }
        Ok(grad)
    }

    fn flat_hessian_vector<F: ScalarFunctional<RodLinkage>>(&self, functional: &F, dp: &[f64]) -> ErodResult<Vec<f64>> {
        let object = self.flat.object();
        let eq = self.flat_equilibrium()?;
        let g = functional.grad(object)?;
        let adjoint = adjoint_solve(eq, &g)?;
        let push = pushforward(object, eq, &self.flat_vars, self.flat_params(dp))?;
        let mut hv = hessian_vector(object, eq, &self.flat_vars, functional, &adjoint, &push)?.delta_grad;
        if self.settings.optimize_target_angle {
            hv.push(0.0);
        }
        Ok(hv)
    }

    fn num_joints(&self) -> usize {
        self.flat.object().num_joints()
    }

    pub fn optimize(&mut self, options: &OptimizeOptions) -> ErodResult<OptimizationReport> {
        optimize(self, options)
    }
}

impl DesignProblem for XShellOptimization {
    fn num_params(&self) -> usize {
        self.deployed.design_variables().len()
    }

    fn params(&self) -> Vec<f64> {
        self.deployed.params().to_vec()
    }

    fn new_pt(&mut self, p: &[f64]) -> ErodResult<bool> {
        let deployed_valid = self.deployed.new_pt(p)?;
        if self.flat_version != Some(self.deployed.param_version()) {
            self.update_flat()?;
        }
        Ok(deployed_valid && self.flat.is_valid())
    }

    fn j(&mut self, p: &[f64], ty: OptEnergyType) -> ErodResult<f64> {
        if !self.new_pt(p)? {
            return Ok(f64::INFINITY);
        }
        self.deployed.j(p, ty)
    }

    fn gradp_j(&mut self, p: &[f64], ty: OptEnergyType) -> ErodResult<Vec<f64>> {
        if !self.new_pt(p)? {
            return self
                .last_valid_grad
                .clone()
                .ok_or_else(|| ErodError::Solver("no valid equilibrium has been reached; gradient undefined".into()));
        }
        let g = self.deployed.gradp_j(p, ty)?;
        self.last_valid_grad = Some(g.clone());
        Ok(g)
    }

    fn apply_hess(&mut self, p: &[f64], dp: &[f64], coeffs: &HessianCoefficients, ty: OptEnergyType) -> ErodResult<Vec<f64>> {
        check_len("parameter perturbation", self.num_params(), dp.len())?;
        if !self.new_pt(p)? {
            return Ok(vec![0.0; dp.len()]);
        }
        let mut out = self.deployed.apply_hess(p, dp, coeffs, ty)?;
        if coeffs.c != 0.0 {
            let hc = self.flat_hessian_vector(&Flatness, dp)?;
            out.iter_mut().zip(&hc).for_each(|(o, h)| *o += coeffs.c * h);
        }
        let mut joint_coeffs = coeffs.joint_angle_constraints.clone();
        if coeffs.angle_constraint != 0.0 {
            if let Some((j, _)) = self.flat.object().min_joint_angle() {
                joint_coeffs.resize(joint_coeffs.len().max(j + 1), 0.0);
                joint_coeffs[j] += coeffs.angle_constraint;
            }
        }
        for (j, &w) in joint_coeffs.iter().enumerate().take(self.num_joints()) {
            if w != 0.0 {
                let ha = self.flat_hessian_vector(&JointAngle(j), dp)?;
                out.iter_mut().zip(&ha).for_each(|(o, h)| *o += w * h);
            }
        }
        Ok(out)
    }

    fn has_equality_constraint(&self) -> bool {
        true
    }

    fn c(&mut self, p: &[f64]) -> ErodResult<f64> {
        if !self.new_pt(p)? {
            return Ok(f64::INFINITY);
        }
        Flatness.value(self.flat.object())
    }

    fn gradp_c(&mut self, p: &[f64]) -> ErodResult<Vec<f64>> {
        if !self.new_pt(p)? {
            return Err(ErodError::Solver("no flat equilibrium at this design; flatness has no gradient".into()));
        }
        self.flat_gradient(&Flatness)
    }

    fn num_angle_constraints(&self) -> usize {
        self.num_joints()
    }

    fn angle_constraints(&mut self, p: &[f64]) -> ErodResult<Vec<f64>> {
        if !self.new_pt(p)? {
            return Ok(vec![f64::NEG_INFINITY; self.num_joints()]);
        }
        let eps = self.settings.min_angle_eps;
        Ok(self.flat.object().joint_angles().into_iter().map(|a| a - eps).collect())
    }

    fn gradp_angle_constraints(&mut self, p: &[f64]) -> ErodResult<Vec<Vec<f64>>> {
        if !self.new_pt(p)? {
            return Err(ErodError::Solver("no flat equilibrium at this design; angle constraints have no gradient".into()));
        }
        (0..self.num_joints()).map(|j| self.flat_gradient(&JointAngle(j))).collect()
    }

    fn commit_linesearch_linkage(&mut self) {
        self.deployed.commit_linesearch_linkage();
        self.flat.commit();
    }

    fn min_rest_length_indices(&self) -> Vec<usize> {
        self.deployed.min_rest_length_indices()
    }
}
