//! Equilibrium-constrained design optimization of a linkage.
//!
//! The design parameters p are the segment rest lengths and rest kappas
//! (plus, for some specializations, a deployment angle).  Every query at a
//! parameter point runs the state machine
//!
//!   1. `new_pt(p)`: apply p to the line-search object, re-solve equilibrium
//!   2. refresh the fitter's closest points
//!   3. solve the adjoint system for the requested objective type
//!   4. evaluate J, ∇J or the Hessian-vector product
//!
//! Derived state is keyed to a parameter version counter and recomputed on
//! demand, so no accessor ever sees stale data.

use crate::equilibrium::{Equilibrium, EquilibriumProblem};
use crate::fitter::TargetSurfaceFitter;
use crate::gradients::{
    adjoint_solve, hessian_vector, pushforward, total_gradient, Adjoint, DesignVariables, Pushforward,
    ScalarFunctional,
};
use crate::objectives::{
    ContactForceObjective, ContactForceWeights, DesignOptimizationObjective, ElasticEnergyObjective, EvalContext,
    ObjectiveTerm, ObjectiveWeights, RestCurvatureSmoothing, RestLengthMinimization, TargetFittingObjective,
};
use crate::types::{check_len, ConvergenceReport, ErodError, ErodResult, LinkageObject, NewtonOptions, OptEnergyType};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use tracing::{debug, info, warn};

pub const ELASTIC_ENERGY: &str = "ElasticEnergy";
pub const TARGET_FITTING: &str = "TargetFitting";
pub const REST_CURVATURE_SMOOTHING: &str = "RestCurvatureSmoothing";
pub const REST_LENGTH_MINIMIZATION: &str = "RestLengthMinimization";
pub const CONTACT_FORCE: &str = "ContactForce";

// ─────────────────────────────────────────────────────────────
//  Outer-optimizer interface
// ─────────────────────────────────────────────────────────────

/// Which term groups contribute to [`DesignProblem::apply_hess`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HessianCoefficients {
    pub objective: f64,
    /// Equality (flatness) constraint.
    pub c: f64,
    /// Minimum-angle constraint, through the joint attaining the minimum.
    pub angle_constraint: f64,
    /// One coefficient per joint-angle constraint; empty when unused.
    pub joint_angle_constraints: Vec<f64>,
}

impl Default for HessianCoefficients {
    fn default() -> Self {
        Self { objective: 1.0, c: 0.0, angle_constraint: 0.0, joint_angle_constraints: Vec::new() }
    }
}

/// What the outer optimizer drives.
pub trait DesignProblem {
    fn num_params(&self) -> usize;
    fn params(&self) -> Vec<f64>;
    /// Move to `p`; returns whether the equilibria there are valid.
    fn new_pt(&mut self, p: &[f64]) -> ErodResult<bool>;
    /// Objective value, `+∞` where the equilibrium could not be computed.
    fn j(&mut self, p: &[f64], ty: OptEnergyType) -> ErodResult<f64>;
    fn gradp_j(&mut self, p: &[f64], ty: OptEnergyType) -> ErodResult<Vec<f64>>;
    fn apply_hess(
        &mut self,
        p: &[f64],
        dp: &[f64],
        coeffs: &HessianCoefficients,
        ty: OptEnergyType,
    ) -> ErodResult<Vec<f64>>;

    /// Equality constraint c(p) = 0, if the problem has one.
    fn has_equality_constraint(&self) -> bool {
        false
    }
    fn c(&mut self, _p: &[f64]) -> ErodResult<f64> {
        Ok(0.0)
    }
    fn gradp_c(&mut self, p: &[f64]) -> ErodResult<Vec<f64>> {
        Ok(vec![0.0; p.len()])
    }

    /// Inequality constraints α_j(p) − ε ≥ 0, one per joint.
    fn num_angle_constraints(&self) -> usize {
        0
    }
    fn has_angle_constraint(&self) -> bool {
        self.num_angle_constraints() > 0
    }
    fn angle_constraints(&mut self, _p: &[f64]) -> ErodResult<Vec<f64>> {
        Ok(Vec::new())
    }
    fn gradp_angle_constraints(&mut self, _p: &[f64]) -> ErodResult<Vec<Vec<f64>>> {
        Ok(Vec::new())
    }
    /// The smallest joint-angle constraint value (`+∞` without joints).
    fn angle_constraint(&mut self, p: &[f64]) -> ErodResult<f64> {
        Ok(self.angle_constraints(p)?.into_iter().fold(f64::INFINITY, f64::min))
    }
    /// Gradient of [`Self::angle_constraint`]; only defined where the
    /// minimizing joint is unique.
    fn gradp_angle_constraint(&mut self, p: &[f64]) -> ErodResult<Vec<f64>> {
        let values = self.angle_constraints(p)?;
        let Some((j, _)) = values.iter().enumerate().min_by(|a, b| a.1.total_cmp(b.1)) else {
            return Ok(vec![0.0; p.len()]);
        };
        Ok(self.gradp_angle_constraints(p)?.into_iter().nth(j).unwrap_or_else(|| vec![0.0; p.len()]))
    }

    /// Promote the current line-search state to the committed state.
    fn commit_linesearch_linkage(&mut self);
    /// Parameter indices holding rest lengths (bounded below).
    fn min_rest_length_indices(&self) -> Vec<usize>;
}

// ─────────────────────────────────────────────────────────────
//  Equilibrium strategy
// ─────────────────────────────────────────────────────────────

/// What an equilibrium update must reach.
#[derive(Debug, Clone, Copy)]
pub struct EquilibriumTarget<'a> {
    pub fixed: &'a [usize],
    /// Deployment angle, when the average joint angle is prescribed.
    pub angle: Option<f64>,
    /// Warm-start actuation multiplier.
    pub lambda: Option<f64>,
    /// Fallback initial guess (the committed DoFs).
    pub fresh_start: &'a [f64],
}

#[derive(Debug, Default)]
pub struct EquilibriumSolve {
    pub report: ConvergenceReport,
    /// Factored KKT system; `None` when the solve failed.
    pub equilibrium: Option<Equilibrium>,
}

/// Hook that recomputes an equilibrium after the design changed.
pub trait EquilibriumStrategy<O: LinkageObject>: Debug {
    fn solve(&self, object: &mut O, target: &EquilibriumTarget<'_>, opts: &NewtonOptions) -> ErodResult<EquilibriumSolve>;
}

/// Newton from the current DoFs, retried once from the fresh start.
#[derive(Debug, Default, Clone, Copy)]
pub struct NewtonEquilibrium;

fn solve_once<O: LinkageObject>(object: &mut O, target: &EquilibriumTarget<'_>, opts: &NewtonOptions) -> ErodResult<EquilibriumSolve> {
    let mut problem = match target.angle {
        Some(angle) => {
            let p = EquilibriumProblem::with_deployment_angle(object, angle, target.fixed)?;
            match target.lambda {
                Some(l) => p.with_initial_multiplier(l),
                None => p,
            }
        }
        None => EquilibriumProblem::new(object, target.fixed)?,
    };
    let report = problem.solve(opts)?;
    let equilibrium = if report.success {
        match problem.factor_kkt() {
            Ok(eq) => Some(eq),
            Err(e) => {
                warn!(error = %e, "equilibrium KKT system could not be factored");
                None
            }
        }
    } else {
        None
    };
    Ok(EquilibriumSolve { report, equilibrium })
}

impl<O: LinkageObject> EquilibriumStrategy<O> for NewtonEquilibrium {
    fn solve(&self, object: &mut O, target: &EquilibriumTarget<'_>, opts: &NewtonOptions) -> ErodResult<EquilibriumSolve> {
        let attempt = |object: &mut O| match solve_once(object, target, opts) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "equilibrium solve aborted");
                EquilibriumSolve::default()
            }
        };
        let warm = attempt(object);
        if warm.equilibrium.is_some() {
            return Ok(warm);
        }
        debug!("warm-started equilibrium failed; retrying from the committed state");
        object.set_dofs(target.fresh_start)?;
        Ok(attempt(object))
    }
}

// ─────────────────────────────────────────────────────────────
//  One equilibrium configuration
// ─────────────────────────────────────────────────────────────

/// A committed object, its line-search copy, and the equilibrium of the
/// line-search copy.
#[derive(Debug)]
pub struct Configuration<O: LinkageObject> {
    committed: O,
    linesearch: O,
    fixed: Vec<usize>,
    angle: Option<f64>,
    solve: EquilibriumSolve,
}

impl<O: LinkageObject> Configuration<O> {
    pub fn new(object: O, fixed: Vec<usize>, angle: Option<f64>) -> Self {
        Self { committed: object.clone(), linesearch: object, fixed, angle, solve: EquilibriumSolve::default() }
    }

    /// The object at the current parameter point.
    pub fn object(&self) -> &O {
        &self.linesearch
    }
    pub fn committed(&self) -> &O {
        &self.committed
    }
    pub fn fixed(&self) -> &[usize] {
        &self.fixed
    }
    pub fn angle(&self) -> Option<f64> {
        self.angle
    }
    pub fn set_angle(&mut self, angle: Option<f64>) {
        self.angle = angle;
    }
    pub fn report(&self) -> &ConvergenceReport {
        &self.solve.report
    }
    pub fn equilibrium(&self) -> Option<&Equilibrium> {
        self.solve.equilibrium.as_ref()
    }
    pub fn is_valid(&self) -> bool {
        self.solve.equilibrium.is_some()
    }

    /// Write design values into the line-search object.  Fails only for
    /// rejected design values (e.g. non-positive rest lengths).
    pub(crate) fn set_design(&mut self, vars: &DesignVariables, p: &[f64]) -> ErodResult<()> {
        if !self.is_valid() {
            self.linesearch.set_dofs(&self.committed.get_dofs())?;
        }
        let mut z = self.linesearch.get_extended_dofs();
        for (&i, &v) in vars.extended.iter().zip(p) {
            z[i] = v;
        }
        self.linesearch.set_extended_dofs(&z)
    }

    pub(crate) fn update(&mut self, strategy: &dyn EquilibriumStrategy<O>, opts: &NewtonOptions) -> ErodResult<bool> {
        let lambda = self.solve.equilibrium.as_ref().and_then(|e| e.lambda());
        let fresh = self.committed.get_dofs();
        let target = EquilibriumTarget { fixed: &self.fixed, angle: self.angle, lambda, fresh_start: &fresh };
        self.solve = strategy.solve(&mut self.linesearch, &target, opts)?;
        Ok(self.is_valid())
    }

    pub(crate) fn invalidate(&mut self) {
        self.solve = EquilibriumSolve::default();
    }

    pub fn commit(&mut self) {
        self.committed = self.linesearch.clone();
    }

    pub(crate) fn modify(&mut self, f: impl Fn(&mut O) -> ErodResult<()>) -> ErodResult<()> {
        f(&mut self.committed)?;
        f(&mut self.linesearch)
    }
}

// ─────────────────────────────────────────────────────────────
//  Objective as a scalar functional
// ─────────────────────────────────────────────────────────────

pub(crate) struct ObjectiveFunctional<'a, O: LinkageObject> {
    pub objective: &'a DesignOptimizationObjective<O>,
    pub fitter: &'a TargetSurfaceFitter,
    pub ty: OptEnergyType,
}

impl<'a, O: LinkageObject> ScalarFunctional<O> for ObjectiveFunctional<'a, O> {
    fn value(&self, object: &O) -> ErodResult<f64> {
        self.objective.value(EvalContext { object, fitter: self.fitter }, self.ty)
    }
    fn grad(&self, object: &O) -> ErodResult<Vec<f64>> {
        self.objective.grad(EvalContext { object, fitter: self.fitter }, self.ty)
    }
    fn delta_grad(&self, object: &O, dz: &[f64]) -> ErodResult<Vec<f64>> {
        self.objective.delta_grad(EvalContext { object, fitter: self.fitter }, dz, self.ty)
    }
}

// ─────────────────────────────────────────────────────────────
//  Orchestrator
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkageOptimizationSettings {
    pub weights: ObjectiveWeights,
    pub contact_force_weights: ContactForceWeights,
    pub newton: NewtonOptions,
    /// Skip the adjoint solve of the elastic-energy term.
    pub use_envelope_theorem: bool,
}

impl Default for LinkageOptimizationSettings {
    fn default() -> Self {
        Self {
            weights: ObjectiveWeights::default(),
            contact_force_weights: ContactForceWeights::default(),
            newton: NewtonOptions { niter: 50, ..NewtonOptions::default() },
            use_envelope_theorem: true,
        }
    }
}

/// Scales that make the objective weights dimensionless.
#[derive(Debug, Clone, Copy)]
struct Normalization {
    energy: f64,
    length_sq: f64,
    rest_length: f64,
}

#[derive(Debug)]
struct AdjointCache {
    version: u64,
    ty: OptEnergyType,
    adjoint: Adjoint,
}

#[derive(Debug)]
struct DeltaCache {
    version: u64,
    dp: Vec<f64>,
    push: Pushforward,
    delta_w: Adjoint,
}

#[derive(Debug)]
pub struct LinkageOptimization<O: LinkageObject> {
    config: Configuration<O>,
    fitter: TargetSurfaceFitter,
    objective: DesignOptimizationObjective<O>,
    settings: LinkageOptimizationSettings,
    vars: DesignVariables,
    norm: Normalization,
    strategy: Box<dyn EquilibriumStrategy<O>>,

    params: Vec<f64>,
    param_version: u64,
    equilibrium_version: u64,
    closest_point_version: u64,
    adjoint: Option<AdjointCache>,
    delta: Option<DeltaCache>,
    last_valid_grad: Option<Vec<f64>>,
}

impl<O: LinkageObject> LinkageOptimization<O> {
    /// Optimize the rest quantities of `object`, equilibrated with the
    /// `fixed` DoFs pinned and, if given, at deployment angle `angle`.
    pub fn new(
        object: O,
        fixed: Vec<usize>,
        angle: Option<f64>,
        fitter: TargetSurfaceFitter,
        settings: LinkageOptimizationSettings,
    ) -> ErodResult<Self> {
        let vars = DesignVariables::rest_quantities(&object.layout());
        Self::with_design_variables(object, fixed, angle, fitter, settings, vars)
    }

    pub(crate) fn with_design_variables(
        object: O,
        fixed: Vec<usize>,
        angle: Option<f64>,
        fitter: TargetSurfaceFitter,
        settings: LinkageOptimizationSettings,
        vars: DesignVariables,
    ) -> ErodResult<Self> {
        let n_ext = object.num_extended_dof();
        if let Some(&bad) = vars.extended.iter().find(|&&i| i < object.num_dof() || i >= n_ext) {
            return Err(ErodError::IndexOutOfRange { what: "design variable", index: bad, len: n_ext });
        }
        let z = object.get_extended_dofs();
        let mut params: Vec<f64> = vars.extended.iter().map(|&i| z[i]).collect();
        if vars.angle {
            params.push(angle.unwrap_or(0.0));
        }
        let mut me = Self {
            config: Configuration::new(object, fixed, angle),
            fitter,
            objective: DesignOptimizationObjective::new(),
            settings,
            vars,
            norm: Normalization { energy: 1.0, length_sq: 1.0, rest_length: 1.0 },
            strategy: Box::new(NewtonEquilibrium),
            params,
            param_version: 0,
            equilibrium_version: u64::MAX,
            closest_point_version: u64::MAX,
            adjoint: None,
            delta: None,
            last_valid_grad: None,
        };
        if !me.update_equilibria()? {
            warn!("initial equilibrium solve failed");
        }
        me.config.commit();

        // normalizations from the initial equilibrium
        let obj = me.config.object();
        let e0 = obj.energy();
        let l0 = obj.characteristic_length();
        let rl0: f64 = obj.linkage().network().rest_lengths().iter().sum();
        me.norm = Normalization {
            energy: if e0 > 0.0 && e0.is_finite() { e0 } else { 1.0 },
            length_sq: l0 * l0,
            rest_length: if rl0 > 0.0 { rl0 } else { 1.0 },
        };
        me.build_objective()?;
        Ok(me)
    }

    fn build_objective(&mut self) -> ErodResult<()> {
        let w = self.settings.weights.clone();
        let n = self.norm;
        let mut objective = DesignOptimizationObjective::new();
        objective.add(
            ELASTIC_ENERGY,
            OptEnergyType::Elastic,
            ElasticEnergyObjective::new(self.settings.use_envelope_theorem && !self.vars.angle),
            w.gamma / n.energy,
        )?;
        objective.add(TARGET_FITTING, OptEnergyType::Target, TargetFittingObjective, w.beta / n.length_sq)?;
        objective.add(REST_CURVATURE_SMOOTHING, OptEnergyType::Smoothing, RestCurvatureSmoothing, w.smoothing_weight)?;
        objective.add(
            REST_LENGTH_MINIMIZATION,
            OptEnergyType::Regularization,
            RestLengthMinimization,
            w.rl_regularization_weight / n.rest_length,
        )?;
        objective.add(
            CONTACT_FORCE,
            OptEnergyType::ContactForce,
            ContactForceObjective::new(self.settings.contact_force_weights.clone()),
            w.contact_force_weight,
        )?;
        self.objective = objective;
        Ok(())
    }
}

impl<O: LinkageObject> LinkageOptimization<O> {
    // ── Accessors ─────────────────────────────────────────

    pub fn object(&self) -> &O {
        self.config.object()
    }
    pub fn committed_object(&self) -> &O {
        self.config.committed()
    }
    pub fn configuration(&self) -> &Configuration<O> {
        &self.config
    }
    pub fn fitter(&self) -> &TargetSurfaceFitter {
        &self.fitter
    }
    pub fn objective(&self) -> &DesignOptimizationObjective<O> {
        &self.objective
    }
    pub fn design_variables(&self) -> &DesignVariables {
        &self.vars
    }
    pub fn settings(&self) -> &LinkageOptimizationSettings {
        &self.settings
    }
    pub fn newton_options(&self) -> &NewtonOptions {
        &self.settings.newton
    }
    pub fn set_newton_options(&mut self, opts: NewtonOptions) {
        self.settings.newton = opts;
    }
    pub fn param_version(&self) -> u64 {
        self.param_version
    }
    pub(crate) fn strategy(&self) -> &dyn EquilibriumStrategy<O> {
        self.strategy.as_ref()
    }

    /// Replace the equilibrium-update hook.
    pub fn set_equilibrium_strategy(&mut self, strategy: Box<dyn EquilibriumStrategy<O>>) {
        self.strategy = strategy;
    }

    /// Whether the equilibrium at the current parameters is usable.
    pub fn is_valid(&self) -> bool {
        self.config.is_valid()
    }

    pub fn equilibrium_report(&self) -> &ConvergenceReport {
        self.config.report()
    }

    // ── Fitter configuration ──────────────────────────────

    /// Mutate the fitter; its cache is refreshed for the current state.
    pub fn with_fitter<R>(&mut self, f: impl FnOnce(&mut TargetSurfaceFitter, &O) -> R) -> R {
        let r = f(&mut self.fitter, self.config.object());
        self.fitter.force_update_closest_points(self.config.object().linkage().network().positions());
        self.closest_point_version = self.equilibrium_version;
        self.invalidate_adjoint_state();
        r
    }

    /// Apply `f` to both the committed and the line-search object, then
    /// re-solve the equilibrium at the current parameters.
    pub fn modify_object(&mut self, f: impl Fn(&mut O) -> ErodResult<()>) -> ErodResult<bool> {
        self.config.modify(f)?;
        self.param_version = self.param_version.wrapping_add(1);
        self.update_equilibria()
    }

    // ── Weights ───────────────────────────────────────────

    pub fn weights(&self) -> &ObjectiveWeights {
        &self.settings.weights
    }

    fn set_term_weight(&mut self, name: &str, weight: f64) -> ErodResult<()> {
        self.objective.set_weight(name, weight)?;
        self.invalidate_adjoint_state();
        Ok(())
    }

    pub fn set_gamma(&mut self, gamma: f64) -> ErodResult<()> {
        self.settings.weights.gamma = gamma;
        self.set_term_weight(ELASTIC_ENERGY, gamma / self.norm.energy)
    }
    pub fn set_beta(&mut self, beta: f64) -> ErodResult<()> {
        self.settings.weights.beta = beta;
        self.set_term_weight(TARGET_FITTING, beta / self.norm.length_sq)
    }
    pub fn set_smoothing_weight(&mut self, w: f64) -> ErodResult<()> {
        self.settings.weights.smoothing_weight = w;
        self.set_term_weight(REST_CURVATURE_SMOOTHING, w)
    }
    pub fn set_rest_length_minimization_weight(&mut self, w: f64) -> ErodResult<()> {
        self.settings.weights.rl_regularization_weight = w;
        self.set_term_weight(REST_LENGTH_MINIMIZATION, w / self.norm.rest_length)
    }
    pub fn set_contact_force_weight(&mut self, w: f64) -> ErodResult<()> {
        self.settings.weights.contact_force_weight = w;
        self.set_term_weight(CONTACT_FORCE, w)
    }

    /// Unweighted rest-kappa smoothness of the current design.
    pub fn rest_kappa_smoothness(&self) -> ErodResult<f64> {
        RestCurvatureSmoothing.value(EvalContext { object: self.config.object(), fitter: &self.fitter })
    }

    /// Per-term values at the current state.
    pub fn objective_values(&self) -> ErodResult<Vec<(String, f64)>> {
        self.objective.values(EvalContext { object: self.config.object(), fitter: &self.fitter })
    }

    // ── State machine ─────────────────────────────────────

    pub fn invalidate_adjoint_state(&mut self) {
        self.adjoint = None;
        self.delta = None;
    }

    fn update_equilibria(&mut self) -> ErodResult<bool> {
        let vars = self.vars.clone();
        if vars.angle {
            self.config.set_angle(self.params.last().copied());
        }
        let valid = match self.config.set_design(&vars, &self.params) {
            Ok(()) => self.config.update(self.strategy.as_ref(), &self.settings.newton)?,
            Err(e) => {
                warn!(error = %e, "design rejected");
                self.config.invalidate();
                false
            }
        };
        self.equilibrium_version = self.param_version;
        self.invalidate_adjoint_state();
        if valid {
            self.update_closest_points();
        }
        Ok(valid)
    }

    fn update_closest_points(&mut self) {
        if self.closest_point_version != self.equilibrium_version {
            self.fitter.update_closest_points(self.config.object().linkage().network().positions());
            self.closest_point_version = self.equilibrium_version;
        }
    }

    pub fn params(&self) -> &[f64] {
        &self.params
    }

    pub fn new_pt(&mut self, p: &[f64]) -> ErodResult<bool> {
        check_len("design parameters", self.vars.len(), p.len())?;
        if p == self.params.as_slice() && self.equilibrium_version == self.param_version {
            return Ok(self.is_valid());
        }
        self.params.copy_from_slice(p);
        self.param_version = self.param_version.wrapping_add(1);
        let valid = self.update_equilibria()?;
        info!(version = self.param_version, valid, "new design point");
        Ok(valid)
    }

    fn ensure_adjoint(&mut self, ty: OptEnergyType) -> ErodResult<()> {
        if matches!(&self.adjoint, Some(a) if a.version == self.param_version && a.ty == ty) {
            return Ok(());
        }
        let eq = self.config.equilibrium().ok_or(ErodError::MissingFactorization)?;
        let functional = ObjectiveFunctional { objective: &self.objective, fitter: &self.fitter, ty };
        let g = functional.grad(self.config.object())?;
        let adjoint = adjoint_solve(eq, &g)?;
        self.adjoint = Some(AdjointCache { version: self.param_version, ty, adjoint });
        Ok(())
    }

    pub fn j(&mut self, p: &[f64], ty: OptEnergyType) -> ErodResult<f64> {
        if !self.new_pt(p)? {
            return Ok(f64::INFINITY);
        }
        self.objective.value(EvalContext { object: self.config.object(), fitter: &self.fitter }, ty)
    }

    pub fn gradp_j(&mut self, p: &[f64], ty: OptEnergyType) -> ErodResult<Vec<f64>> {
        if !self.new_pt(p)? {
            warn!("gradient requested at an invalid equilibrium; returning the last valid gradient");
            return self
                .last_valid_grad
                .clone()
                .ok_or_else(|| ErodError::Solver("no valid equilibrium has been reached; gradient undefined".into()));
        }
        self.ensure_adjoint(ty)?;
        let functional = ObjectiveFunctional { objective: &self.objective, fitter: &self.fitter, ty };
        let g = functional.grad(self.config.object())?;
        let adjoint = self.adjoint.as_ref().map(|a| &a.adjoint).ok_or(ErodError::MissingFactorization)?;
        let grad = total_gradient(self.config.object(), &self.vars, &g, adjoint)?;
        self.last_valid_grad = Some(grad.clone());
        Ok(grad)
    }

    /// Hessian of the objective applied to `dp` (only `coeffs.objective`
    /// applies here; constraint groups belong to the specializations).
    pub fn apply_hess(&mut self, p: &[f64], dp: &[f64], coeffs: &HessianCoefficients, ty: OptEnergyType) -> ErodResult<Vec<f64>> {
        check_len("parameter perturbation", self.vars.len(), dp.len())?;
        if !self.new_pt(p)? || coeffs.objective == 0.0 {
            return Ok(vec![0.0; dp.len()]);
        }
        self.ensure_adjoint(ty)?;
        let object = self.config.object();
        let eq = self.config.equilibrium().ok_or(ErodError::MissingFactorization)?;
        let adjoint = self.adjoint.as_ref().map(|a| &a.adjoint).ok_or(ErodError::MissingFactorization)?;
        let push = pushforward(object, eq, &self.vars, dp)?;
        let functional = ObjectiveFunctional { objective: &self.objective, fitter: &self.fitter, ty };
        let hv = hessian_vector(object, eq, &self.vars, &functional, adjoint, &push)?;
        let out = hv.delta_grad.iter().map(|v| coeffs.objective * v).collect();
        self.delta = Some(DeltaCache { version: self.param_version, dp: dp.to_vec(), push, delta_w: hv.delta_w });
        Ok(out)
    }

    /// Adjoint state w_x of the last gradient evaluation at the current point.
    pub fn get_w_x(&self) -> Option<&[f64]> {
        self.adjoint.as_ref().filter(|a| a.version == self.param_version).map(|a| a.adjoint.w_x.as_slice())
    }

    /// Equilibrium response δx of the last Hessian-vector product.
    pub fn get_delta_x(&self) -> Option<&[f64]> {
        let n = self.config.object().num_dof();
        self.delta.as_ref().filter(|d| d.version == self.param_version).map(|d| &d.push.delta_z[..n])
    }

    pub fn get_delta_w_x(&self) -> Option<&[f64]> {
        self.delta.as_ref().filter(|d| d.version == self.param_version).map(|d| d.delta_w.w_x.as_slice())
    }

    /// Perturbation `dp` the cached δx and δw belong to.
    pub fn get_delta_p(&self) -> Option<&[f64]> {
        self.delta.as_ref().filter(|d| d.version == self.param_version).map(|d| d.dp.as_slice())
    }

    pub fn commit_linesearch_linkage(&mut self) {
        self.config.commit();
    }

    pub fn min_rest_length_indices(&self) -> Vec<usize> {
        let l = self.config.object().layout();
        self.vars
            .extended
            .iter()
            .enumerate()
            .filter(|(_, &i)| i >= l.rest_len_offset() && i < l.rest_kappa_offset())
            .map(|(k, _)| k)
            .collect()
    }
}

impl<O: LinkageObject> DesignProblem for LinkageOptimization<O> {
    fn num_params(&self) -> usize {
        self.vars.len()
    }
    fn params(&self) -> Vec<f64> {
        self.params.clone()
    }
    fn new_pt(&mut self, p: &[f64]) -> ErodResult<bool> {
        LinkageOptimization::new_pt(self, p)
    }
    fn j(&mut self, p: &[f64], ty: OptEnergyType) -> ErodResult<f64> {
        LinkageOptimization::j(self, p, ty)
    }
    fn gradp_j(&mut self, p: &[f64], ty: OptEnergyType) -> ErodResult<Vec<f64>> {
        LinkageOptimization::gradp_j(self, p, ty)
    }
    fn apply_hess(&mut self, p: &[f64], dp: &[f64], coeffs: &HessianCoefficients, ty: OptEnergyType) -> ErodResult<Vec<f64>> {
        LinkageOptimization::apply_hess(self, p, dp, coeffs, ty)
    }
    fn commit_linesearch_linkage(&mut self) {
        LinkageOptimization::commit_linesearch_linkage(self)
    }
    fn min_rest_length_indices(&self) -> Vec<usize> {
        LinkageOptimization::min_rest_length_indices(self)
    }
}
