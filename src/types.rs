use crate::linkage::RodLinkage;
use serde::{Deserialize, Serialize};
use sprs::{CsMatView, FillInReduction, SymmetryCheck, TriMat};
use sprs_ldl::{Ldl, LdlNumeric};
use std::fmt::Debug;
use thiserror::Error;

// ─────────────────────────────────────────────────────────────
//  Error type
// ─────────────────────────────────────────────────────────────

/// Unified error type for all fallible operations in the crate.
///
/// Only malformed input, I/O and linear-algebra breakdowns are errors.
/// Numerical non-convergence of an equilibrium solve is reported as data
/// in [`ConvergenceReport`], never through this type.  The FFI layer
/// translates these into integer return codes + a thread-local message.
#[derive(Debug, Error)]
pub enum ErodError {
    /// Linear algebra failure (singular matrix, zero pivot, ...).
    #[error("linear algebra error: {0}")]
    Linalg(#[from] sprs::errors::LinalgError),
    /// A vector or matrix argument has the wrong length.
    #[error("dimension mismatch for {what}: expected {expected}, got {got}")]
    Dimension { what: &'static str, expected: usize, got: usize },
    /// An index argument points outside its container.
    #[error("{what} index {index} out of range (len {len})")]
    IndexOutOfRange { what: &'static str, index: usize, len: usize },
    /// Geometrically or logically invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed mesh file.
    #[error("mesh format error on line {line}: {msg}")]
    MeshFormat { line: usize, msg: String },
    /// The outer optimizer (argmin) returned an error.
    #[error("solver error: {0}")]
    Solver(String),
    /// A cached factorization was requested before one was computed.
    #[error("factorization not computed (solve the equilibrium first)")]
    MissingFactorization,
}

impl From<argmin::core::Error> for ErodError {
    fn from(e: argmin::core::Error) -> Self {
        Self::Solver(e.to_string())
    }
}

pub type ErodResult<T> = Result<T, ErodError>;

/// Check a slice length, producing a [`ErodError::Dimension`] on mismatch.
pub(crate) fn check_len(what: &'static str, expected: usize, got: usize) -> ErodResult<()> {
    if expected != got {
        return Err(ErodError::Dimension { what, expected, got });
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────
//  Constants
// ─────────────────────────────────────────────────────────────

/// Sufficient-decrease constant of the Newton backtracking line search.
pub const ARMIJO_C1: f64 = 1e-4;

/// Relative step used for central differences of analytic Hessian-vector
/// products (third-derivative contractions).
pub const HESSIAN_FD_EPS: f64 = 1e-6;

/// Edges shorter than this are treated as degenerate.
pub const MIN_EDGE_LENGTH: f64 = 1e-14;

// ─────────────────────────────────────────────────────────────
//  Energy-type tags
// ─────────────────────────────────────────────────────────────

/// Which part of the elastic energy to evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum EnergyType {
    #[default]
    Full,
    Bend,
    Twist,
    Stretch,
}

/// Tag attached to each design-objective term; `Full` selects every term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OptEnergyType {
    #[default]
    Full,
    Elastic,
    Target,
    Regularization,
    Smoothing,
    ContactForce,
}

impl OptEnergyType {
    /// Whether a term tagged `term` contributes when evaluating `self`.
    pub fn selects(self, term: OptEnergyType) -> bool {
        self == OptEnergyType::Full || self == term
    }
}

// ─────────────────────────────────────────────────────────────
//  Newton options / convergence report
// ─────────────────────────────────────────────────────────────

/// Configuration of the damped Newton equilibrium solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtonOptions {
    /// Converged once the free-variable gradient norm drops to this value.
    pub grad_tol: f64,
    /// Maximum number of Newton iterations.
    pub niter: usize,
    /// Initial damping shift τ added to an indefinite Hessian.
    pub beta: f64,
    /// Scale `beta` by the mean magnitude of the Hessian diagonal.
    pub hessian_scaled_beta: bool,
    /// Shift with the identity instead of the Hessian diagonal.
    pub use_identity_metric: bool,
    /// Augment the step with a negative-curvature direction when indefinite.
    pub use_negative_curvature_direction: bool,
    /// Take full steps without a line search.
    pub feasibility_solve: bool,
    pub verbose: bool,
    pub verbose_non_pos_def: bool,
    /// Smallest line-search step before declaring a backtracking failure.
    pub min_step: f64,
}

impl Default for NewtonOptions {
    fn default() -> Self {
        Self {
            grad_tol: 1e-8,
            niter: 20,
            beta: 1e-8,
            hessian_scaled_beta: true,
            use_identity_metric: false,
            use_negative_curvature_direction: true,
            feasibility_solve: false,
            verbose: false,
            verbose_non_pos_def: false,
            min_step: 1e-9,
        }
    }
}

/// Per-iteration history of one Newton solve.
///
/// Produced fresh by every solve and read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceReport {
    pub success: bool,
    pub backtracking_failure: bool,
    pub energy: Vec<f64>,
    pub gradient_norm: Vec<f64>,
    pub free_gradient_norm: Vec<f64>,
    pub step_length: Vec<f64>,
    pub indefinite: Vec<bool>,
}

impl ConvergenceReport {
    pub fn num_iterations(&self) -> usize {
        self.energy.len()
    }

    pub(crate) fn record(&mut self, energy: f64, grad_norm: f64, free_grad_norm: f64) {
        self.energy.push(energy);
        self.gradient_norm.push(grad_norm);
        self.free_gradient_norm.push(free_grad_norm);
        self.step_length.push(0.0);
        self.indefinite.push(false);
    }

    /// Flatten into `[success, backtracking_failure, energy…, gradient_norm…,
    /// free_gradient_norm…, step_length…, indefinite…]`.
    pub fn flatten(&self) -> Vec<f64> {
        let n = self.num_iterations();
        let mut out = Vec::with_capacity(2 + 5 * n);
        out.push(if self.success { 1.0 } else { 0.0 });
        out.push(if self.backtracking_failure { 1.0 } else { 0.0 });
        out.extend_from_slice(&self.energy);
        out.extend_from_slice(&self.gradient_norm);
        out.extend_from_slice(&self.free_gradient_norm);
        out.extend_from_slice(&self.step_length);
        out.extend(self.indefinite.iter().map(|&b| if b { 1.0 } else { 0.0 }));
        out
    }

    /// Inverse of [`flatten`](Self::flatten).
    pub fn unflatten(data: &[f64]) -> ErodResult<Self> {
        if data.len() < 2 || (data.len() - 2) % 5 != 0 {
            return Err(ErodError::InvalidInput(format!(
                "flattened report has length {}, expected 2 + 5n", data.len()
            )));
        }
        let n = (data.len() - 2) / 5;
        let block = |k: usize| data[2 + k * n..2 + (k + 1) * n].to_vec();
        Ok(Self {
            success: data[0] != 0.0,
            backtracking_failure: data[1] != 0.0,
            energy: block(0),
            gradient_norm: block(1),
            free_gradient_norm: block(2),
            step_length: block(3),
            indefinite: block(4).into_iter().map(|v| v != 0.0).collect(),
        })
    }
}

// ─────────────────────────────────────────────────────────────
//  DoF layout
// ─────────────────────────────────────────────────────────────

/// Offsets of the contiguous blocks of the (extended) DoF vector:
///
///   [ x (3·nv) | θ (ne) | rest lengths (nseg) | rest kappas (nbend) ]
///
/// The first two blocks are the equilibrium DoFs; the last two are the
/// design variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DofLayout {
    pub num_vertices: usize,
    pub num_edges: usize,
    pub num_segments: usize,
    pub num_bends: usize,
}

impl DofLayout {
    pub fn theta_offset(&self) -> usize {
        3 * self.num_vertices
    }
    pub fn num_dof(&self) -> usize {
        self.theta_offset() + self.num_edges
    }
    pub fn rest_len_offset(&self) -> usize {
        self.num_dof()
    }
    pub fn rest_kappa_offset(&self) -> usize {
        self.rest_len_offset() + self.num_segments
    }
    pub fn num_extended_dof(&self) -> usize {
        self.rest_kappa_offset() + self.num_bends
    }
    pub fn num_design_dof(&self) -> usize {
        self.num_segments + self.num_bends
    }
}

// ─────────────────────────────────────────────────────────────
//  Elastic object capability traits
// ─────────────────────────────────────────────────────────────

/// Capability interface shared by every rod / linkage variant.
///
/// Vectors are laid out per [`DofLayout`].  `variable_design = true`
/// selects the extended DoF vector (equilibrium DoFs followed by rest
/// lengths and rest kappas); otherwise only the first `num_dof()` entries.
/// Hessians are returned as full symmetric triplet matrices (both
/// triangles, duplicates summed on conversion).
pub trait ElasticObject: Clone + Debug {
    fn layout(&self) -> DofLayout;

    fn num_dof(&self) -> usize {
        self.layout().num_dof()
    }
    fn num_extended_dof(&self) -> usize {
        self.layout().num_extended_dof()
    }

    fn get_dofs(&self) -> Vec<f64>;
    fn set_dofs(&mut self, dofs: &[f64]) -> ErodResult<()>;
    fn get_extended_dofs(&self) -> Vec<f64>;
    fn set_extended_dofs(&mut self, dofs: &[f64]) -> ErodResult<()>;

    fn energy(&self) -> f64 {
        self.energy_of(EnergyType::Full)
    }
    fn energy_of(&self, ty: EnergyType) -> f64;

    fn gradient(&self, variable_design: bool) -> Vec<f64>;
    fn hessian(&self, variable_design: bool) -> TriMat<f64>;
    fn apply_hessian(&self, v: &[f64], variable_design: bool) -> ErodResult<Vec<f64>>;

    /// DoFs that carry no elastic stiffness and must always be pinned
    /// (one material-frame angle per rod).
    fn gauge_vars(&self) -> Vec<usize>;

    /// Length scale used to normalize fitting objectives.
    fn characteristic_length(&self) -> f64;
}

/// An elastic object built on a [`RodLinkage`] (joints, rods, segments).
pub trait LinkageObject: ElasticObject {
    fn linkage(&self) -> &RodLinkage;
}

// ─────────────────────────────────────────────────────────────
//  Factorisation strategy
// ─────────────────────────────────────────────────────────────

/// How a symmetric sparse system is factored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactorizationStrategy {
    /// The matrix must be positive definite; validated through D > 0.
    Cholesky,
    /// Symmetric indefinite: no sign constraint on D.
    Ldl,
}

/// Holds a numeric LDLᵀ factorization from `sprs-ldl`.
///
/// Both variants use reverse Cuthill–McKee fill-in reduction.  The
/// Cholesky path rejects matrices with a non-positive pivot, which is how
/// the Newton solver detects indefinite Hessians.
pub enum Factorization {
    Cholesky(LdlNumeric<f64, usize>),
    Ldl(LdlNumeric<f64, usize>),
}

impl Debug for Factorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cholesky(_) => write!(f, "Factorization::Cholesky(...)"),
            Self::Ldl(_) => write!(f, "Factorization::Ldl(...)"),
        }
    }
}

impl Factorization {
    pub fn new(a: CsMatView<f64>, strategy: FactorizationStrategy) -> ErodResult<Self> {
        let ldl = Ldl::new()
            .fill_in_reduction(FillInReduction::ReverseCuthillMcKee)
            .check_symmetry(SymmetryCheck::DontCheckSymmetry)
            .numeric(a)?;
        match strategy {
            FactorizationStrategy::Cholesky => {
                for (i, &di) in ldl.d().iter().enumerate() {
                    if di <= 0.0 || !di.is_finite() {
                        return Err(ErodError::Linalg(sprs::errors::LinalgError::SingularMatrix(
                            sprs::errors::SingularMatrixInfo {
                                index: i,
                                reason: "D <= 0 in Cholesky factorization (not SPD)",
                            },
                        )));
                    }
                }
                Ok(Self::Cholesky(ldl))
            }
            FactorizationStrategy::Ldl => {
                if ldl.d().iter().any(|d| !d.is_finite() || *d == 0.0) {
                    return Err(ErodError::Linalg(sprs::errors::LinalgError::SingularMatrix(
                        sprs::errors::SingularMatrixInfo {
                            index: 0,
                            reason: "zero pivot in LDL factorization",
                        },
                    )));
                }
                Ok(Self::Ldl(ldl))
            }
        }
    }

    /// Solve A x = rhs using the stored factorization.
    pub fn solve(&self, rhs: &[f64]) -> Vec<f64> {
        match self {
            Self::Cholesky(ldl) | Self::Ldl(ldl) => ldl.solve(rhs),
        }
    }

    pub fn strategy(&self) -> FactorizationStrategy {
        match self {
            Self::Cholesky(_) => FactorizationStrategy::Cholesky,
            Self::Ldl(_) => FactorizationStrategy::Ldl,
        }
    }

    /// Whether every pivot is positive.
    pub fn is_positive_definite(&self) -> bool {
        match self {
            Self::Cholesky(_) => true,
            Self::Ldl(ldl) => ldl.d().iter().all(|&d| d > 0.0),
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Augmented Lagrangian  (outer design-optimization constraints)
// ─────────────────────────────────────────────────────────────

/// Settings for the augmented Lagrangian outer loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ALSettings {
    /// Initial penalty parameter μ.
    pub mu_init: f64,
    /// Multiplicative growth factor for μ each outer iteration.
    pub mu_factor: f64,
    /// Maximum value of μ (prevents ill-conditioning).
    pub mu_max: f64,
    /// Maximum number of outer AL iterations.
    pub max_outer_iters: usize,
    /// Constraint feasibility tolerance: stop when the worst violation < tol.
    pub constraint_tol: f64,
}

impl Default for ALSettings {
    fn default() -> Self {
        Self {
            mu_init: 10.0,
            mu_factor: 10.0,
            mu_max: 1e8,
            max_outer_iters: 10,
            constraint_tol: 1e-6,
        }
    }
}

/// Kind of a scalar outer constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintKind {
    /// g(p) = 0
    Equality,
    /// g(p) ≤ 0
    Inequality,
}

/// Mutable multiplier state of the augmented Lagrangian.
#[derive(Debug, Clone)]
pub struct ALState {
    pub kinds: Vec<ConstraintKind>,
    /// Multiplier estimates (λ_k ≥ 0 for inequalities).
    pub lambdas: Vec<f64>,
    /// Current penalty parameter μ.
    pub mu: f64,
}

impl ALState {
    pub fn new(kinds: Vec<ConstraintKind>, settings: &ALSettings) -> Self {
        let n = kinds.len();
        Self { kinds, lambdas: vec![0.0; n], mu: settings.mu_init }
    }

    /// Penalty value and its derivative w.r.t. each constraint value.
    ///
    ///   equality:    λ g + (μ/2) g²
    ///   inequality:  (μ/2) [max(0, λ/μ + g)]² − λ²/(2μ)
    pub fn penalty(&self, g: &[f64]) -> (f64, Vec<f64>) {
        let mut value = 0.0;
        let mut dg = vec![0.0; g.len()];
        for (k, (&gk, &lk)) in g.iter().zip(&self.lambdas).enumerate() {
            match self.kinds[k] {
                ConstraintKind::Equality => {
                    value += lk * gk + 0.5 * self.mu * gk * gk;
                    dg[k] = lk + self.mu * gk;
                }
                ConstraintKind::Inequality => {
                    let s = (lk / self.mu + gk).max(0.0);
                    value += 0.5 * self.mu * s * s - lk * lk / (2.0 * self.mu);
                    dg[k] = self.mu * s;
                }
            }
        }
        (value, dg)
    }

    /// Worst violation: |g| for equalities, max(0, g) for inequalities.
    pub fn max_violation(&self, g: &[f64]) -> f64 {
        g.iter()
            .zip(&self.kinds)
            .map(|(&gk, kind)| match kind {
                ConstraintKind::Equality => gk.abs(),
                ConstraintKind::Inequality => gk.max(0.0),
            })
            .fold(0.0, f64::max)
    }

    /// λ ← λ + μ g  (projected onto λ ≥ 0 for inequalities).
    pub fn update_multipliers(&mut self, g: &[f64]) {
        for (k, &gk) in g.iter().enumerate() {
            let l = self.lambdas[k] + self.mu * gk;
            self.lambdas[k] = match self.kinds[k] {
                ConstraintKind::Equality => l,
                ConstraintKind::Inequality => l.max(0.0),
            };
        }
    }
}
