//! Damped Newton solver for equilibrium problems.
//!
//! Per iteration:
//!   1. Gradient on the free variables → convergence test.
//!   2. Sparse LDLᵀ of the free Hessian (augmented by ρ a aᵀ when a scalar
//!      equality constraint is present).  A non-positive pivot flags the
//!      iteration indefinite; τ M is added and τ grows ×10 until the
//!      factorization is positive definite.
//!   3. Newton direction (plus an optional negative-curvature direction),
//!      then Armijo backtracking.
//!
//! Numerical failure never produces `Err`: it is recorded in the returned
//! [`ConvergenceReport`].

use crate::types::{
    ConvergenceReport, ErodError, ErodResult, Factorization, FactorizationStrategy, NewtonOptions,
    ARMIJO_C1,
};
use sprs::{CsMat, TriMat};
use tracing::{debug, warn};

/// Maximum number of shift increases before a step is abandoned.
const MAX_SHIFT_ATTEMPTS: usize = 40;
const INVERSE_ITERATIONS: usize = 10;
/// Relative energy increase accepted as roundoff near convergence.
const ENERGY_ROUNDOFF: f64 = 64.0 * f64::EPSILON;

// ─────────────────────────────────────────────────────────────
//  Problem interface
// ─────────────────────────────────────────────────────────────

/// A smooth minimization over a variable vector with pinned entries and an
/// optional scalar equality constraint h(x) = 0 enforced through the
/// Lagrangian ℒ = E − λ h.
pub trait NewtonProblem {
    fn num_vars(&self) -> usize;
    fn get_vars(&self) -> Vec<f64>;
    fn set_vars(&mut self, vars: &[f64]) -> ErodResult<()>;
    /// Sorted, deduplicated pinned indices.
    fn fixed_vars(&self) -> &[usize];

    /// Objective value (energy minus external work).
    fn energy(&self) -> f64;
    /// Gradient of the Lagrangian over all variables.
    fn gradient(&self) -> Vec<f64>;
    /// Hessian of the Lagrangian over all variables.
    fn hessian(&self) -> TriMat<f64>;

    /// Value and gradient of the equality constraint, if any.
    fn constraint(&self) -> ErodResult<Option<(f64, Vec<f64>)>> {
        Ok(None)
    }
    fn multiplier(&self) -> f64 {
        0.0
    }
    fn set_multiplier(&mut self, _lambda: f64) {}
}

// ─────────────────────────────────────────────────────────────
//  Free-variable bookkeeping
// ─────────────────────────────────────────────────────────────

/// Map between the full variable vector and its free entries.
#[derive(Debug, Clone)]
pub struct FreeVariables {
    free: Vec<usize>,
    map: Vec<Option<usize>>,
}

impl FreeVariables {
    pub fn new(n: usize, fixed: &[usize]) -> Self {
        let mut map = vec![Some(0); n];
        for &f in fixed {
            if f < n {
                map[f] = None;
            }
        }
        let mut free = Vec::with_capacity(n);
        for (i, m) in map.iter_mut().enumerate() {
            if m.is_some() {
                *m = Some(free.len());
                free.push(i);
            }
        }
        Self { free, map }
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }
    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }
    pub fn indices(&self) -> &[usize] {
        &self.free
    }
    pub fn reduced_index(&self, i: usize) -> Option<usize> {
        self.map.get(i).copied().flatten()
    }

    pub fn restrict(&self, full: &[f64]) -> Vec<f64> {
        self.free.iter().map(|&i| full[i]).collect()
    }

    /// Scatter free entries into a zero vector of length `n`.
    pub fn extend(&self, reduced: &[f64], n: usize) -> Vec<f64> {
        let mut out = vec![0.0; n];
        for (k, &i) in self.free.iter().enumerate() {
            out[i] = reduced[k];
        }
        out
    }

    /// Rows and columns of `tri` belonging to free variables.
    pub fn restrict_matrix(&self, tri: &TriMat<f64>) -> TriMat<f64> {
        let n = self.free.len();
        let mut out = TriMat::new((n, n));
        for ((&r, &c), &v) in tri.row_inds().iter().zip(tri.col_inds()).zip(tri.data()) {
            if let (Some(rr), Some(cc)) = (self.reduced_index(r), self.reduced_index(c)) {
                out.add_triplet(rr, cc, v);
            }
        }
        out
    }
}

fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Summed diagonal entries of a triplet matrix.
fn diagonal(tri: &TriMat<f64>) -> Vec<f64> {
    let mut d = vec![0.0; tri.rows()];
    for ((&r, &c), &v) in tri.row_inds().iter().zip(tri.col_inds()).zip(tri.data()) {
        if r == c {
            d[r] += v;
        }
    }
    d
}

fn quadratic_form(tri: &TriMat<f64>, v: &[f64]) -> f64 {
    tri.row_inds()
        .iter()
        .zip(tri.col_inds())
        .zip(tri.data())
        .map(|((&r, &c), &h)| h * v[r] * v[c])
        .sum()
}

// ─────────────────────────────────────────────────────────────
//  KKT system
// ─────────────────────────────────────────────────────────────

/// Factored (possibly bordered) system on the free variables:
///
///   K = [ H  −a ]
///       [ −aᵀ 0 ]
///
/// The border is eliminated by factoring Ĥ = H + ρ a aᵀ (+ τ M) and a
/// Schur complement on λ.  Without a constraint K = H.
pub struct KktSystem {
    factor: Factorization,
    constraint: Option<Border>,
}

struct Border {
    a: Vec<f64>,
    rho: f64,
    /// Ĥ⁻¹ a
    v: Vec<f64>,
    /// aᵀ Ĥ⁻¹ a
    a_v: f64,
}

impl std::fmt::Debug for KktSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KktSystem")
            .field("factor", &self.factor)
            .field("bordered", &self.constraint.is_some())
            .finish()
    }
}

impl KktSystem {
    /// Factor `h` (free-variable Hessian) with an optional border `a` and
    /// diagonal shift `shift`.
    pub fn new(
        h: &TriMat<f64>,
        a: Option<&[f64]>,
        shift: Option<&[f64]>,
        strategy: FactorizationStrategy,
    ) -> ErodResult<Self> {
        let n = h.rows();
        let diag = diagonal(h);
        let border_nnz = a.map_or(0, |a| a.iter().filter(|&&ai| ai != 0.0).count().pow(2));
        let mut aug = TriMat::with_capacity((n, n), h.nnz() + border_nnz + n);
        for ((&r, &c), &v) in h.row_inds().iter().zip(h.col_inds()).zip(h.data()) {
            aug.add_triplet(r, c, v);
        }
        let rho = if n > 0 { diag.iter().map(|d| d.abs()).sum::<f64>() / n as f64 } else { 0.0 };
        let rho = if rho > 0.0 { rho } else { 1.0 };
        if let Some(a) = a {
            if a.len() != n {
                return Err(ErodError::Dimension { what: "constraint gradient", expected: n, got: a.len() });
            }
            let support: Vec<usize> = (0..n).filter(|&i| a[i] != 0.0).collect();
            for &i in &support {
                for &j in &support {
                    aug.add_triplet(i, j, rho * a[i] * a[j]);
                }
            }
        }
        if let Some(s) = shift {
            for (i, &si) in s.iter().enumerate() {
                if si != 0.0 {
                    aug.add_triplet(i, i, si);
                }
            }
        }
        let csc: CsMat<f64> = aug.to_csc();
        let factor = Factorization::new(csc.view(), strategy)?;
        let constraint = match a {
            Some(a) => {
                let v = factor.solve(a);
                let a_v = dot(a, &v);
                if a_v == 0.0 || !a_v.is_finite() {
                    return Err(ErodError::Linalg(sprs::errors::LinalgError::SingularMatrix(
                        sprs::errors::SingularMatrixInfo { index: n, reason: "degenerate constraint border" },
                    )));
                }
                Some(Border { a: a.to_vec(), rho, v, a_v })
            }
            None => None,
        };
        Ok(Self { factor, constraint })
    }

    pub fn is_bordered(&self) -> bool {
        self.constraint.is_some()
    }

    pub fn is_positive_definite(&self) -> bool {
        self.factor.is_positive_definite()
    }

    /// Solve K [w_x; w_λ] = [b_x; b_λ].  `b_lambda` is ignored (and w_λ = 0)
    /// for an unbordered system.
    pub fn solve(&self, b_x: &[f64], b_lambda: f64) -> (Vec<f64>, f64) {
        match &self.constraint {
            None => (self.factor.solve(b_x), 0.0),
            Some(b) => {
                let rhs: Vec<f64> = b_x.iter().zip(&b.a).map(|(bx, ai)| bx - b.rho * ai * b_lambda).collect();
                let u = self.factor.solve(&rhs);
                let w_lambda = -(b_lambda + dot(&b.a, &u)) / b.a_v;
                let w_x = u.iter().zip(&b.v).map(|(ui, vi)| ui + vi * w_lambda).collect();
                (w_x, w_lambda)
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Solver
// ─────────────────────────────────────────────────────────────

struct Iterate {
    energy: f64,
    grad_free: Vec<f64>,
    h: f64,
}

impl Iterate {
    fn merit(&self) -> f64 {
        0.5 * (dot(&self.grad_free, &self.grad_free) + self.h * self.h)
    }
}

fn evaluate<P: NewtonProblem>(problem: &P, free: &FreeVariables) -> ErodResult<(Iterate, Vec<f64>, Option<Vec<f64>>)> {
    let g = problem.gradient();
    let (h, a) = match problem.constraint()? {
        Some((h, a)) => (h, Some(free.restrict(&a))),
        None => (0.0, None),
    };
    Ok((Iterate { energy: problem.energy(), grad_free: free.restrict(&g), h }, g, a))
}

/// Factor the free Hessian, shifting until positive definite.  Returns the
/// system and whether a shift was needed, or `None` when every attempt
/// failed.
fn factor_with_shift(
    h_free: &TriMat<f64>,
    a: Option<&[f64]>,
    opts: &NewtonOptions,
) -> Option<(KktSystem, bool)> {
    if let Ok(k) = KktSystem::new(h_free, a, None, FactorizationStrategy::Cholesky) {
        return Some((k, false));
    }
    let diag = diagonal(h_free);
    let n = diag.len().max(1);
    let mean = diag.iter().map(|d| d.abs()).sum::<f64>() / n as f64;
    let metric: Vec<f64> = if opts.use_identity_metric {
        vec![1.0; diag.len()]
    } else {
        diag.iter().map(|d| if d.abs() > 0.0 { d.abs() } else { mean.max(1.0) }).collect()
    };
    let mut tau = if opts.hessian_scaled_beta { opts.beta * mean.max(f64::MIN_POSITIVE) } else { opts.beta };
    if tau <= 0.0 {
        tau = 1e-8;
    }
    for _ in 0..MAX_SHIFT_ATTEMPTS {
        let shift: Vec<f64> = metric.iter().map(|m| tau * m).collect();
        if opts.verbose_non_pos_def {
            debug!(tau, "Hessian not positive definite; shifting");
        }
        if let Ok(k) = KktSystem::new(h_free, a, Some(&shift), FactorizationStrategy::Cholesky) {
            return Some((k, true));
        }
        tau *= 10.0;
    }
    None
}

/// Direction of most negative curvature of `h_free` by inverse iteration
/// on the shifted factorization, if the curvature is negative.
fn negative_curvature_direction(kkt: &KktSystem, h_free: &TriMat<f64>) -> Option<Vec<f64>> {
    let n = h_free.rows();
    if n == 0 {
        return None;
    }
    let mut v = vec![1.0 / (n as f64).sqrt(); n];
    for _ in 0..INVERSE_ITERATIONS {
        let (w, _) = kkt.solve(&v, 0.0);
        let nw = norm(&w);
        if nw == 0.0 || !nw.is_finite() {
            return None;
        }
        v = w.into_iter().map(|x| x / nw).collect();
    }
    (quadratic_form(h_free, &v) < 0.0).then_some(v)
}

/// Minimize `problem` by damped Newton iteration, mutating its variables.
pub fn newton<P: NewtonProblem>(problem: &mut P, opts: &NewtonOptions) -> ErodResult<ConvergenceReport> {
    let n = problem.num_vars();
    let free = FreeVariables::new(n, problem.fixed_vars());
    let mut report = ConvergenceReport::default();

    for it in 0..=opts.niter {
        let (cur, g_full, a) = evaluate(problem, &free)?;
        let free_norm = norm(&cur.grad_free);
        report.record(cur.energy, norm(&g_full), free_norm);
        if opts.verbose {
            debug!(it, energy = cur.energy, free_grad = free_norm, constraint = cur.h, "newton iterate");
        }
        if free_norm <= opts.grad_tol && cur.h.abs() <= opts.grad_tol {
            report.success = true;
            break;
        }
        if it == opts.niter || free.is_empty() {
            break;
        }

        // Factor
        let h_free = free.restrict_matrix(&problem.hessian());
        let Some((kkt, indefinite)) = factor_with_shift(&h_free, a.as_deref(), opts) else {
            warn!(it, "could not factor the Hessian at any shift");
            break;
        };
        let last = report.num_iterations() - 1;
        report.indefinite[last] = indefinite;

        // Direction
        let neg_g: Vec<f64> = cur.grad_free.iter().map(|g| -g).collect();
        let (mut dx, dlambda) = kkt.solve(&neg_g, cur.h);
        if indefinite && opts.use_negative_curvature_direction && !kkt.is_bordered() {
            if let Some(mut v) = negative_curvature_direction(&kkt, &h_free) {
                if dot(&v, &cur.grad_free) > 0.0 {
                    v.iter_mut().for_each(|x| *x = -*x);
                }
                let scale = norm(&dx);
                dx.iter_mut().zip(&v).for_each(|(d, vi)| *d += scale * vi);
            }
        }

        // Line search
        let x0 = problem.get_vars();
        let lambda0 = problem.multiplier();
        let constrained = kkt.is_bordered();
        let mut slope = dot(&cur.grad_free, &dx);
        if !constrained && slope >= 0.0 {
            dx = neg_g;
            slope = -dot(&dx, &dx);
        }
        let merit0 = cur.merit();
        let mut step = 1.0;
        loop {
            let mut x = x0.clone();
            for (k, &i) in free.indices().iter().enumerate() {
                x[i] += step * dx[k];
            }
            let accepted = match problem.set_vars(&x) {
                Ok(()) => {
                    problem.set_multiplier(lambda0 + step * dlambda);
                    if opts.feasibility_solve {
                        true
                    } else if constrained {
                        let (trial, _, _) = evaluate(problem, &free)?;
                        let m = trial.merit();
                        m.is_finite() && m <= (1.0 - 2.0 * ARMIJO_C1 * step) * merit0
                    } else {
                        let e = problem.energy();
                        e.is_finite() && e <= cur.energy + ARMIJO_C1 * step * slope + ENERGY_ROUNDOFF * cur.energy.abs()
                    }
                }
                Err(ErodError::InvalidInput(_)) => false,
                Err(e) => return Err(e),
            };
            if accepted {
                break;
            }
            step *= 0.5;
            if step < opts.min_step {
                problem.set_vars(&x0)?;
                problem.set_multiplier(lambda0);
                report.backtracking_failure = true;
                break;
            }
        }
        if report.backtracking_failure {
            warn!(it, "line search failed to find a decrease");
            break;
        }
        report.step_length[last] = step;
    }

    if !report.success {
        warn!(
            iterations = report.num_iterations(),
            free_grad = report.free_gradient_norm.last().copied().unwrap_or(f64::NAN),
            "newton solve did not converge"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// E = ¼ x⁴ − ½ x² + ½ y² + ½ (z − 3)², z pinned.
    struct DoubleWell {
        x: Vec<f64>,
        fixed: Vec<usize>,
    }

    impl NewtonProblem for DoubleWell {
        fn num_vars(&self) -> usize {
            3
        }
        fn get_vars(&self) -> Vec<f64> {
            self.x.clone()
        }
        fn set_vars(&mut self, vars: &[f64]) -> ErodResult<()> {
            self.x.copy_from_slice(vars);
            Ok(())
        }
        fn fixed_vars(&self) -> &[usize] {
            &self.fixed
        }
        fn energy(&self) -> f64 {
            let [x, y, z] = [self.x[0], self.x[1], self.x[2]];
            0.25 * x.powi(4) - 0.5 * x * x + 0.5 * y * y + 0.5 * (z - 3.0).powi(2)
        }
        fn gradient(&self) -> Vec<f64> {
            let [x, y, z] = [self.x[0], self.x[1], self.x[2]];
            vec![x.powi(3) - x, y, z - 3.0]
        }
        fn hessian(&self) -> TriMat<f64> {
            let mut t = TriMat::new((3, 3));
            t.add_triplet(0, 0, 3.0 * self.x[0].powi(2) - 1.0);
            t.add_triplet(1, 1, 1.0);
            t.add_triplet(2, 2, 1.0);
            t
        }
    }

    #[test]
    fn escapes_saddle_and_keeps_pins() {
        let mut p = DoubleWell { x: vec![0.1, 0.5, 0.0], fixed: vec![2] };
        let report = newton(&mut p, &NewtonOptions { niter: 50, ..Default::default() }).unwrap();
        assert!(report.success);
        assert!(report.indefinite[0]);
        assert!((p.x[0].abs() - 1.0).abs() < 1e-8);
        assert_eq!(p.x[2], 0.0);
        assert!(*report.free_gradient_norm.last().unwrap() <= 1e-8);
    }

    #[test]
    fn bordered_solve_satisfies_both_rows() {
        let mut h = TriMat::new((2, 2));
        h.add_triplet(0, 0, 2.0);
        h.add_triplet(1, 1, 3.0);
        let a = [1.0, 1.0];
        let kkt = KktSystem::new(&h, Some(&a), None, FactorizationStrategy::Ldl).unwrap();
        let (w, wl) = kkt.solve(&[1.0, -2.0], 0.5);
        // H w − a w_λ = b_x,  −aᵀ w = b_λ
        assert!((2.0 * w[0] - wl - 1.0).abs() < 1e-12);
        assert!((3.0 * w[1] - wl + 2.0).abs() < 1e-12);
        assert!((-(w[0] + w[1]) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn shifted_factor_leaves_input_untouched() {
        let mut h = TriMat::new((2, 2));
        h.add_triplet(0, 0, -1.0);
        h.add_triplet(0, 1, 0.5);
        h.add_triplet(1, 0, 0.5);
        h.add_triplet(1, 1, 2.0);
        let kkt = KktSystem::new(&h, None, Some(&[3.0, 0.0]), FactorizationStrategy::Ldl).unwrap();
        assert!(kkt.is_positive_definite());
        // (H + diag(3, 0)) w = b
        let (w, wl) = kkt.solve(&[1.0, 1.0], 0.0);
        assert_eq!(wl, 0.0);
        assert!((2.0 * w[0] + 0.5 * w[1] - 1.0).abs() < 1e-12);
        assert!((0.5 * w[0] + 2.0 * w[1] - 1.0).abs() < 1e-12);
        assert_eq!(h.nnz(), 4);
        assert_eq!(diagonal(&h), vec![-1.0, 2.0]);
    }
}
