//! Outer design-optimization driver via the `argmin` crate.
//!
//! Wraps a [`DesignProblem`] into argmin's `CostFunction` + `Gradient`
//! (+ `Hessian` for the trust-region method) traits and runs either L-BFGS
//! with a backtracking Armijo line search or a Steihaug trust-region
//! method.  Constraints (flatness, minimum angle, minimum rest length) are
//! handled by an augmented Lagrangian outer loop.
//!
//! Points where the equilibrium cannot be computed evaluate to `+∞`, which
//! both line search and trust region reject by shrinking the step.  Each
//! inner solve has an evaluation budget and stops once its steps shrink to
//! round-off; it then returns the best point evaluated.

use crate::linkage_optimization::{DesignProblem, HessianCoefficients};
use crate::types::{check_len, ALSettings, ALState, ConstraintKind, ErodError, ErodResult, OptEnergyType};
use argmin::core::{CostFunction, Executor, Gradient, Hessian, State, TerminationReason};
use argmin::solver::linesearch::condition::ArmijoCondition;
use argmin::solver::linesearch::BacktrackingLineSearch;
use argmin::solver::quasinewton::LBFGS;
use argmin::solver::trustregion::{Steihaug, TrustRegion};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OptAlgorithm {
    #[default]
    Lbfgs,
    TrustRegion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizeOptions {
    pub algorithm: OptAlgorithm,
    /// Iterations per inner solve.
    pub num_steps: usize,
    /// Initial trust-region radius.
    pub trust_region_scale: f64,
    /// Gradient-norm tolerance of the inner solve.
    pub optimality_tol: f64,
    /// Lower bound on segment rest lengths (`None` disables the bound).
    pub min_rest_len: Option<f64>,
    pub apply_angle_constraint: bool,
    pub apply_flatness_constraint: bool,
    pub energy_type: OptEnergyType,
    pub al: ALSettings,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            algorithm: OptAlgorithm::Lbfgs,
            num_steps: 100,
            trust_region_scale: 1.0,
            optimality_tol: 1e-6,
            min_rest_len: None,
            apply_angle_constraint: true,
            apply_flatness_constraint: true,
            energy_type: OptEnergyType::Full,
            al: ALSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub params: Vec<f64>,
    /// Objective value (without penalties) at `params`.
    pub objective: f64,
    pub constraint_max_violation: f64,
    pub iterations: usize,
    pub outer_iterations: usize,
    pub converged: bool,
    /// Objective value after every outer iteration.
    pub objective_history: Vec<f64>,
}

// ─────────────────────────────────────────────────────────────
//  Constraint bookkeeping
// ─────────────────────────────────────────────────────────────

/// Which constraints are active, in the order of the AL multipliers.
#[derive(Debug, Clone)]
struct ConstraintSet {
    flatness: bool,
    /// Number of per-joint angle constraints.
    angles: usize,
    rest_len: Option<(f64, Vec<usize>)>,
}

impl ConstraintSet {
    fn new<P: DesignProblem>(problem: &P, opts: &OptimizeOptions) -> Self {
        Self {
            flatness: opts.apply_flatness_constraint && problem.has_equality_constraint(),
            angles: if opts.apply_angle_constraint { problem.num_angle_constraints() } else { 0 },
            rest_len: opts.min_rest_len.map(|l| (l, problem.min_rest_length_indices())),
        }
    }

    fn kinds(&self) -> Vec<ConstraintKind> {
        let mut k = Vec::new();
        if self.flatness {
            k.push(ConstraintKind::Equality);
        }
        k.extend((0..self.angles).map(|_| ConstraintKind::Inequality));
        if let Some((_, idx)) = &self.rest_len {
            k.extend(idx.iter().map(|_| ConstraintKind::Inequality));
        }
        k
    }

    fn is_empty(&self) -> bool {
        self.kinds().is_empty()
    }

    fn angle_offset(&self) -> usize {
        usize::from(self.flatness)
    }

    /// Constraint values in AL form (equalities = 0, inequalities ≤ 0).
    fn values<P: DesignProblem>(&self, problem: &mut P, p: &[f64]) -> ErodResult<Vec<f64>> {
        let mut g = Vec::new();
        if self.flatness {
            g.push(problem.c(p)?);
        }
        if self.angles > 0 {
            let a = problem.angle_constraints(p)?;
            check_len("angle constraint values", self.angles, a.len())?;
            g.extend(a.into_iter().map(|v| -v));
        }
        if let Some((l, idx)) = &self.rest_len {
            g.extend(idx.iter().map(|&i| l - p[i]));
        }
        Ok(g)
    }

    fn gradients<P: DesignProblem>(&self, problem: &mut P, p: &[f64]) -> ErodResult<Vec<Vec<f64>>> {
        let mut out = Vec::new();
        if self.flatness {
            out.push(problem.gradp_c(p)?);
        }
        if self.angles > 0 {
            let da = problem.gradp_angle_constraints(p)?;
            check_len("angle constraint gradients", self.angles, da.len())?;
            out.extend(da.into_iter().map(|g| g.into_iter().map(|v| -v).collect()));
        }
        if let Some((_, idx)) = &self.rest_len {
            for &i in idx {
                let mut e = vec![0.0; p.len()];
                e[i] = -1.0;
                out.push(e);
            }
        }
        Ok(out)
    }
}

// ─────────────────────────────────────────────────────────────
//  argmin problem wrapper
// ─────────────────────────────────────────────────────────────

/// Evaluations allowed per requested inner step.
const EVALS_PER_STEP: usize = 20;
/// Steps shorter than this (relative to 1 + ‖p‖) count as a stalled search.
const STALL_STEP: f64 = 1e-12;

/// Bookkeeping of one inner solve that outlives the argmin executor.
#[derive(Debug, Default)]
struct EvalLog {
    evals: usize,
    /// Number of times the best value improved after the first evaluation.
    improvements: usize,
    best: Option<(f64, Vec<f64>)>,
    /// Why the solve was stopped from inside the cost function.
    stop: Option<String>,
}

/// argmin takes `&self`; the design problem mutates its equilibrium
/// caches, hence the `RefCell`.
struct PenalizedProblem<'a, P: DesignProblem> {
    problem: RefCell<&'a mut P>,
    constraints: &'a ConstraintSet,
    al: Option<&'a ALState>,
    ty: OptEnergyType,
    /// Cached (p, value, gradient) from the last evaluation.
    last_eval: RefCell<Option<(Vec<f64>, f64, Vec<f64>)>>,
    log: &'a RefCell<EvalLog>,
    max_evals: usize,
}

impl<'a, P: DesignProblem> PenalizedProblem<'a, P> {
    fn new(
        problem: &'a mut P,
        constraints: &'a ConstraintSet,
        al: Option<&'a ALState>,
        ty: OptEnergyType,
        log: &'a RefCell<EvalLog>,
        max_evals: usize,
    ) -> Self {
        Self { problem: RefCell::new(problem), constraints, al, ty, last_eval: RefCell::new(None), log, max_evals }
    }

    fn ensure_evaluated(&self, p: &[f64]) -> Result<(f64, Vec<f64>), argmin::core::Error> {
        if let Some((cp, v, g)) = self.last_eval.borrow().as_ref() {
            if cp.as_slice() == p {
                return Ok((*v, g.clone()));
            }
        }
        self.check_progress(p)?;
        let (value, grad) = self.evaluate(p).map_err(|e| argmin::core::Error::msg(e.to_string()))?;
        *self.last_eval.borrow_mut() = Some((p.to_vec(), value, grad.clone()));
        Ok((value, grad))
    }

    /// Stop the solve once the evaluation budget is spent or the search
    /// keeps probing points indistinguishable from the previous one.
    fn check_progress(&self, p: &[f64]) -> Result<(), argmin::core::Error> {
        let mut log = self.log.borrow_mut();
        log.evals += 1;
        let reason = if log.evals > self.max_evals {
            Some(format!("evaluation budget of {} exhausted", self.max_evals))
        } else {
            self.last_eval.borrow().as_ref().and_then(|(q, _, _)| {
                let step = p.iter().zip(q).map(|(a, b)| (a - b) * (a - b)).sum::<f64>().sqrt();
                let scale = 1.0 + q.iter().map(|v| v * v).sum::<f64>().sqrt();
                (step <= STALL_STEP * scale).then(|| format!("step {step:.3e} below the stall threshold"))
            })
        };
        match reason {
            Some(r) => {
                log.stop = Some(r.clone());
                Err(argmin::core::Error::msg(r))
            }
            None => Ok(()),
        }
    }

    fn evaluate(&self, p: &[f64]) -> ErodResult<(f64, Vec<f64>)> {
        let mut guard = self.problem.borrow_mut();
        let problem = &mut **guard;
        let mut value = problem.j(p, self.ty)?;
        if !value.is_finite() {
            return Ok((f64::INFINITY, vec![0.0; p.len()]));
        }
        let mut grad = problem.gradp_j(p, self.ty)?;
        if let Some(al) = self.al {
            let g = self.constraints.values(problem, p)?;
            let (pen, dpen) = al.penalty(&g);
            value += pen;
            let dg = self.constraints.gradients(problem, p)?;
            for (k, gk) in dg.iter().enumerate() {
                grad.iter_mut().zip(gk).for_each(|(a, b)| *a += dpen[k] * b);
            }
        }
        let mut log = self.log.borrow_mut();
        if log.best.as_ref().map_or(true, |(b, _)| value < *b) {
            if log.best.is_some() {
                log.improvements += 1;
            }
            log.best = Some((value, p.to_vec()));
            problem.commit_linesearch_linkage();
        }
        Ok((value, grad))
    }

    /// Dense Hessian of the penalized objective from Hessian-vector
    /// products, plus the Gauss–Newton part of the penalty.
    fn dense_hessian(&self, p: &[f64]) -> ErodResult<Vec<Vec<f64>>> {
        let mut guard = self.problem.borrow_mut();
        let problem = &mut **guard;
        let n = p.len();
        let mut coeffs = HessianCoefficients::default();
        let mut gn: Vec<(f64, Vec<f64>)> = Vec::new();
        if let Some(al) = self.al {
            let g = self.constraints.values(problem, p)?;
            let (_, dpen) = al.penalty(&g);
            let dg = self.constraints.gradients(problem, p)?;
            if self.constraints.flatness {
                coeffs.c = dpen[0];
            }
            let offset = self.constraints.angle_offset();
            coeffs.joint_angle_constraints =
                dpen[offset..offset + self.constraints.angles].iter().map(|d| -d).collect();
            for (k, gk) in dg.into_iter().enumerate() {
                let active = match al.kinds[k] {
                    ConstraintKind::Equality => true,
                    ConstraintKind::Inequality => dpen[k] > 0.0,
                };
                if active {
                    gn.push((al.mu, gk));
                }
            }
        }
        let mut h = vec![vec![0.0; n]; n];
        for col in 0..n {
            let mut e = vec![0.0; n];
            e[col] = 1.0;
            let hc = problem.apply_hess(p, &e, &coeffs, self.ty)?;
            for row in 0..n {
                h[row][col] = hc[row];
            }
        }
        for (mu, g) in &gn {
            for row in 0..n {
                for col in 0..n {
                    h[row][col] += mu * g[row] * g[col];
                }
            }
        }
        // symmetrize away finite-difference noise
        for row in 0..n {
            for col in row + 1..n {
                let avg = 0.5 * (h[row][col] + h[col][row]);
                h[row][col] = avg;
                h[col][row] = avg;
            }
        }
        Ok(h)
    }
}

impl<'a, P: DesignProblem> CostFunction for PenalizedProblem<'a, P> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, p: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        Ok(self.ensure_evaluated(p)?.0)
    }
}

impl<'a, P: DesignProblem> Gradient for PenalizedProblem<'a, P> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, p: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
        Ok(self.ensure_evaluated(p)?.1)
    }
}

impl<'a, P: DesignProblem> Hessian for PenalizedProblem<'a, P> {
    type Param = Vec<f64>;
    type Hessian = Vec<Vec<f64>>;

    fn hessian(&self, p: &Self::Param) -> Result<Self::Hessian, argmin::core::Error> {
        self.dense_hessian(p).map_err(|e| argmin::core::Error::msg(e.to_string()))
    }
}

// ─────────────────────────────────────────────────────────────
//  Inner solve
// ─────────────────────────────────────────────────────────────

type RunOutcome = (Option<Vec<f64>>, u64, Option<TerminationReason>);

/// One inner unconstrained solve.  Returns the best parameters, the
/// iteration count and whether the solver converged.
///
/// A solve stopped by the evaluation budget, a stalled line search or a
/// failing evaluation falls back to the best point evaluated so far.
fn inner_solve<P: DesignProblem>(
    problem: &mut P,
    constraints: &ConstraintSet,
    al: Option<&ALState>,
    init: Vec<f64>,
    opts: &OptimizeOptions,
) -> ErodResult<(Vec<f64>, usize, bool)> {
    let log = RefCell::new(EvalLog::default());
    let max_evals = EVALS_PER_STEP * opts.num_steps.max(1) + 2 * EVALS_PER_STEP;
    let outcome: Result<RunOutcome, argmin::core::Error> = {
        let wrapped = PenalizedProblem::new(problem, constraints, al, opts.energy_type, &log, max_evals);
        let start = init.clone();
        match opts.algorithm {
            OptAlgorithm::Lbfgs => {
                let linesearch = BacktrackingLineSearch::new(ArmijoCondition::new(1e-4)?).rho(0.5)?;
                let solver = LBFGS::new(linesearch, 10)
                    .with_tolerance_grad(opts.optimality_tol)?
                    .with_tolerance_cost(f64::EPSILON)?;
                Executor::new(wrapped, solver)
                    .configure(|config| {
                        config.param(start).max_iters(opts.num_steps as u64).target_cost(f64::NEG_INFINITY)
                    })
                    .run()
                    .map(|result| {
                        let state = result.state();
                        (state.get_best_param().cloned(), state.get_iter(), state.get_termination_reason().cloned())
                    })
            }
            OptAlgorithm::TrustRegion => {
                let subproblem = Steihaug::new().with_max_iters(opts.num_steps.max(1) as u64);
                let solver = TrustRegion::new(subproblem).with_radius(opts.trust_region_scale)?;
                Executor::new(wrapped, solver)
                    .configure(|config| {
                        config.param(start).max_iters(opts.num_steps as u64).target_cost(f64::NEG_INFINITY)
                    })
                    .run()
                    .map(|result| {
                        let state = result.state();
                        (state.get_best_param().cloned(), state.get_iter(), state.get_termination_reason().cloned())
                    })
            }
        }
    };
    let log = log.into_inner();
    match outcome {
        Ok((best, iters, reason)) => {
            let best = best
                .or_else(|| log.best.map(|(_, p)| p))
                .ok_or_else(|| ErodError::Solver("optimizer returned no best parameters".into()))?;
            let converged = matches!(reason, Some(TerminationReason::SolverConverged));
            Ok((best, iters as usize, converged))
        }
        Err(e) => {
            match &log.stop {
                Some(why) => debug!(evals = log.evals, reason = %why, "inner solve stopped"),
                None => warn!(error = %e, evals = log.evals, "inner solve aborted; keeping the best evaluated point"),
            }
            let best = log.best.map_or(init, |(_, p)| p);
            Ok((best, log.improvements, false))
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Top-level entry point
// ─────────────────────────────────────────────────────────────

/// An outer iterate considered for the returned design.
#[derive(Debug, Clone)]
struct Candidate {
    params: Vec<f64>,
    objective: f64,
    violation: f64,
}

impl Candidate {
    fn feasible(&self, tol: f64) -> bool {
        self.violation < tol
    }

    /// Feasible beats infeasible; then the lower objective, or the lower
    /// violation among infeasible iterates.
    fn better_than(&self, other: &Self, tol: f64) -> bool {
        match (self.feasible(tol), other.feasible(tol)) {
            (true, false) => true,
            (false, true) => false,
            (true, true) => self.objective < other.objective,
            (false, false) => self.violation < other.violation,
        }
    }
}

/// Optimize the design of `problem`, starting from its current parameters.
///
/// Without active constraints this is a single inner solve.  Otherwise an
/// augmented Lagrangian loop wraps the inner solves:
///
///   λ_k ← λ_k + μ g_k   (projected onto λ_k ≥ 0 for inequalities)
///   μ   ← min(μ_max, α μ)
///
/// until the worst violation drops below `constraint_tol`.  The starting
/// point and every outer iterate compete for the returned design, which
/// is the feasible one with the lowest objective (or the least violating
/// one when none is feasible).  That design is committed.
pub fn optimize<P: DesignProblem>(problem: &mut P, opts: &OptimizeOptions) -> ErodResult<OptimizationReport> {
    let constraints = ConstraintSet::new(problem, opts);
    let mut params = problem.params();
    let mut report = OptimizationReport::default();
    let tol = opts.al.constraint_tol;
    let violation_of = |problem: &mut P, p: &[f64]| -> ErodResult<f64> {
        let g = constraints.values(problem, p)?;
        Ok(ALState::new(constraints.kinds(), &opts.al).max_violation(&g))
    };

    if constraints.is_empty() {
        let (best, iters, converged) = inner_solve(problem, &constraints, None, params, opts)?;
        params = best;
        report.iterations = iters;
        report.converged = converged;
        report.outer_iterations = 1;
    } else {
        let mut best = Candidate {
            objective: problem.j(&params, opts.energy_type)?,
            violation: violation_of(problem, &params)?,
            params: params.clone(),
        };
        let mut al = ALState::new(constraints.kinds(), &opts.al);
        for outer in 0..opts.al.max_outer_iters {
            let (inner_best, iters, _) = inner_solve(problem, &constraints, Some(&al), params.clone(), opts)?;
            params = inner_best;
            report.iterations += iters;
            report.outer_iterations = outer + 1;

            let g = constraints.values(problem, &params)?;
            let viol = al.max_violation(&g);
            let objective = problem.j(&params, opts.energy_type)?;
            report.objective_history.push(objective);
            info!(
                outer = outer + 1,
                mu = al.mu,
                max_violation = viol,
                objective,
                "augmented Lagrangian outer iteration"
            );
            let candidate = Candidate { params: params.clone(), objective, violation: viol };
            if candidate.better_than(&best, tol) {
                best = candidate;
            }
            if viol < tol {
                debug!(viol, "constraints satisfied");
                report.converged = true;
                break;
            }
            al.update_multipliers(&g);
            al.mu = (al.mu * opts.al.mu_factor).min(opts.al.mu_max);
        }
        if best.params != params {
            debug!(objective = best.objective, violation = best.violation, "returning an earlier iterate");
        }
        params = best.params;
    }

    problem.new_pt(&params)?;
    problem.commit_linesearch_linkage();
    report.objective = problem.j(&params, opts.energy_type)?;
    report.constraint_max_violation = violation_of(problem, &params)?;
    report.converged &= report.constraint_max_violation < tol || constraints.is_empty();
    if report.objective_history.is_empty() {
        report.objective_history.push(report.objective);
    }
    report.params = params;
    Ok(report)
}
