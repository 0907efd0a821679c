//! Finite-difference checks of the adjoint design gradients and the
//! Hessian-vector products of equilibrium-constrained objectives.
//!
//! Every evaluation re-solves the equilibrium, so the checks compare
//!
//!     dJ/dp_i  ≈  [ J(p + h eᵢ) − J(p − h eᵢ) ] / 2h
//!     H δp     ≈  [ ∇J(p + h δp) − ∇J(p − h δp) ] / 2h
//!
//! on a planar lens linkage (two curved rods sharing both end joints)
//! with every z pinned.  The linkage is deployed to a prescribed average
//! joint angle, so the bordered KKT system is exercised; the flat
//! configuration of the X-shell runs the unbordered path.

use approx::assert_relative_eq;
use erod::fitter::TargetSurfaceFitter;
use erod::linkage::RodLinkage;
use erod::linkage_optimization::{DesignProblem, HessianCoefficients, LinkageOptimization, LinkageOptimizationSettings};
use erod::rod::RodMaterial;
use erod::types::*;
use erod::xshell::{XShellOptimization, XShellSettings};
use ndarray::array;

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

fn lens() -> RodLinkage {
    let pts = vec![
        0.0, 0.0, 0.0, // J0
        0.8, 0.6, 0.0, //
        1.8, 0.6, 0.0, //
        2.6, 0.0, 0.0, // J1
        3.2, -0.8, 0.0, //
        0.8, -0.6, 0.0, //
        1.8, -0.6, 0.0, //
        3.2, 0.8, 0.0,
    ];
    let rods = vec![vec![0, 1, 2, 3, 4], vec![0, 5, 6, 3, 7]];
    let m = RodMaterial { stretch_stiffness: 100.0, bend_stiffness: 1.0, twist_stiffness: 1.0 };
    RodLinkage::new(pts, &rods, vec![m; 2]).unwrap()
}

fn lens_fixed_vars() -> Vec<usize> {
    let mut fixed = vec![0, 1, 2, 10];
    fixed.extend((0..8).map(|v| 3 * v + 2));
    fixed
}

fn settings() -> LinkageOptimizationSettings {
    let mut s = LinkageOptimizationSettings::default();
    s.newton.grad_tol = 1e-10;
    s.weights.smoothing_weight = 0.1;
    s.weights.rl_regularization_weight = 0.1;
    s
}

/// Joint targets pull J1 along the x axis.
fn fitter_for(l: &RodLinkage) -> TargetSurfaceFitter {
    let mut f = TargetSurfaceFitter::new(l);
    f.set_target_joint_pos_vs_target_surface_tradeoff(1.0);
    f.set_target_joints_position(array![[0.0, 0.0, 0.0], [2.45, 0.0, 0.0]]).unwrap();
    f
}

fn deployed_optimization(settings: LinkageOptimizationSettings) -> LinkageOptimization<RodLinkage> {
    let l = lens();
    let angle = l.average_joint_angle().unwrap() + 0.05;
    let fitter = fitter_for(&l);
    LinkageOptimization::new(l, lens_fixed_vars(), Some(angle), fitter, settings).unwrap()
}

fn xshell(settings: XShellSettings) -> XShellOptimization {
    let flat = lens();
    let deployed = lens();
    let angle = deployed.average_joint_angle().unwrap() + 0.05;
    let mut x = XShellOptimization::new(flat, deployed, lens_fixed_vars(), lens_fixed_vars(), angle, settings).unwrap();
    x.set_target_joint_pos_vs_target_surface_tradeoff(1.0);
    x.set_target_joints_position(array![[0.0, 0.0, 0.0], [2.45, 0.0, 0.0]]).unwrap();
    x
}

fn xshell_settings() -> XShellSettings {
    XShellSettings { linkage: settings(), allow_flat_actuation: false, ..XShellSettings::default() }
}

fn central_difference(f: &mut dyn FnMut(&[f64]) -> f64, p: &[f64], i: usize, h: f64) -> f64 {
    let mut pp = p.to_vec();
    let mut pm = p.to_vec();
    pp[i] += h;
    pm[i] -= h;
    (f(&pp) - f(&pm)) / (2.0 * h)
}

fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Deterministic perturbation direction with mixed signs.
fn direction(n: usize) -> Vec<f64> {
    (0..n).map(|i| ((i * 5 % 7) as f64 - 3.0) / 3.0).collect()
}

fn assert_vectors_close(a: &[f64], b: &[f64], rel: f64, abs: f64) {
    assert_eq!(a.len(), b.len());
    let diff: Vec<f64> = a.iter().zip(b).map(|(x, y)| x - y).collect();
    assert!(
        norm(&diff) <= rel * norm(b) + abs,
        "vectors differ: |a − b| = {}, |b| = {}\n a = {a:?}\n b = {b:?}",
        norm(&diff),
        norm(b)
    );
}

// ─────────────────────────────────────────────────────────────
//  Linkage optimization
// ─────────────────────────────────────────────────────────────

#[test]
fn objective_gradient_matches_finite_difference() {
    let mut opt = deployed_optimization(settings());
    assert!(opt.is_valid());
    let p = opt.params().to_vec();
    assert_eq!(p.len(), 4 + 6);

    let g = opt.gradp_j(&p, OptEnergyType::Full).unwrap();
    assert!(norm(&g) > 1e-4, "gradient should not vanish");
    for i in 0..p.len() {
        let fd = central_difference(&mut |q| opt.j(q, OptEnergyType::Full).unwrap(), &p, i, 1e-4);
        assert_relative_eq!(g[i], fd, epsilon = 1e-5, max_relative = 1e-3);
    }
}

#[test]
fn per_term_gradients_match_finite_difference() {
    let mut opt = deployed_optimization(settings());
    let p = opt.params().to_vec();
    for ty in [OptEnergyType::Elastic, OptEnergyType::Target, OptEnergyType::Smoothing, OptEnergyType::Regularization] {
        let g = opt.gradp_j(&p, ty).unwrap();
        for i in 0..p.len() {
            let fd = central_difference(&mut |q| opt.j(q, ty).unwrap(), &p, i, 1e-4);
            assert_relative_eq!(g[i], fd, epsilon = 1e-5, max_relative = 1e-3);
        }
    }
}

#[test]
fn envelope_theorem_agrees_with_full_adjoint() {
    let mut with_envelope = deployed_optimization(settings());
    let mut without = deployed_optimization(LinkageOptimizationSettings { use_envelope_theorem: false, ..settings() });
    let p = with_envelope.params().to_vec();
    let a = with_envelope.gradp_j(&p, OptEnergyType::Elastic).unwrap();
    let b = without.gradp_j(&p, OptEnergyType::Elastic).unwrap();
    assert_vectors_close(&a, &b, 1e-6, 1e-9);
}

#[test]
fn hessian_vector_product_matches_finite_difference_of_gradient() {
    let mut opt = deployed_optimization(settings());
    let p = opt.params().to_vec();
    let dp = direction(p.len());
    let coeffs = HessianCoefficients::default();

    let hv = opt.apply_hess(&p, &dp, &coeffs, OptEnergyType::Full).unwrap();
    assert_eq!(opt.get_delta_p(), Some(dp.as_slice()));
    assert!(opt.get_delta_x().is_some());

    let h = 1e-4;
    let shifted = |s: f64| p.iter().zip(&dp).map(|(x, d)| x + s * d).collect::<Vec<_>>();
    let gp = opt.gradp_j(&shifted(h), OptEnergyType::Full).unwrap();
    let gm = opt.gradp_j(&shifted(-h), OptEnergyType::Full).unwrap();
    let fd: Vec<f64> = gp.iter().zip(&gm).map(|(a, b)| (a - b) / (2.0 * h)).collect();
    assert_vectors_close(&hv, &fd, 2e-3, 1e-6);
}

#[test]
fn hessian_vector_product_scales_with_objective_coefficient() {
    let mut opt = deployed_optimization(settings());
    let p = opt.params().to_vec();
    let dp = direction(p.len());
    let one = opt.apply_hess(&p, &dp, &HessianCoefficients::default(), OptEnergyType::Full).unwrap();
    let half = HessianCoefficients { objective: 0.5, ..HessianCoefficients::default() };
    let scaled = opt.apply_hess(&p, &dp, &half, OptEnergyType::Full).unwrap();
    for (a, b) in one.iter().zip(&scaled) {
        assert_relative_eq!(0.5 * a, b, epsilon = 1e-12, max_relative = 1e-9);
    }
}

#[test]
fn new_pt_is_idempotent_and_caches_the_adjoint() {
    let mut opt = deployed_optimization(settings());
    let p = opt.params().to_vec();
    let v0 = opt.param_version();
    assert!(opt.new_pt(&p).unwrap());
    assert!(opt.new_pt(&p).unwrap());
    assert_eq!(opt.param_version(), v0);

    let j0 = opt.j(&p, OptEnergyType::Full).unwrap();
    opt.gradp_j(&p, OptEnergyType::Full).unwrap();
    assert!(opt.get_w_x().is_some());

    let mut q = p.clone();
    q[0] *= 1.001;
    assert!(opt.new_pt(&q).unwrap());
    assert_eq!(opt.param_version(), v0 + 1);
    assert!(opt.get_w_x().is_none());

    // returning to p re-solves and reproduces the objective
    let j1 = opt.j(&p, OptEnergyType::Full).unwrap();
    assert_relative_eq!(j0, j1, epsilon = 1e-10, max_relative = 1e-8);
}

#[test]
fn invalid_design_evaluates_to_infinity() {
    let mut opt = deployed_optimization(settings());
    let p = opt.params().to_vec();
    let g = opt.gradp_j(&p, OptEnergyType::Full).unwrap();

    let mut bad = p.clone();
    bad[0] = -1.0; // negative rest length
    assert!(!opt.new_pt(&bad).unwrap());
    assert_eq!(opt.j(&bad, OptEnergyType::Full).unwrap(), f64::INFINITY);
    assert_eq!(opt.gradp_j(&bad, OptEnergyType::Full).unwrap(), g);

    // the committed state is untouched and the next valid point recovers
    assert!(opt.new_pt(&p).unwrap());
    assert!(opt.j(&p, OptEnergyType::Full).unwrap().is_finite());
}

#[test]
fn gradient_without_any_valid_equilibrium_is_an_error() {
    let mut opt = deployed_optimization(settings());
    let mut bad = opt.params().to_vec();
    bad[0] = -1.0;
    assert_eq!(opt.j(&bad, OptEnergyType::Full).unwrap(), f64::INFINITY);
    assert!(matches!(opt.gradp_j(&bad, OptEnergyType::Full), Err(ErodError::Solver(_))));

    let mut x = xshell(xshell_settings());
    let mut bad = x.params();
    bad[0] = -1.0;
    assert!(matches!(x.gradp_j(&bad, OptEnergyType::Full), Err(ErodError::Solver(_))));
    assert!(matches!(x.gradp_angle_constraints(&bad), Err(ErodError::Solver(_))));
    assert!(x.angle_constraints(&bad).unwrap().iter().all(|v| *v == f64::NEG_INFINITY));
}

// ─────────────────────────────────────────────────────────────
//  X-shell constraints
// ─────────────────────────────────────────────────────────────

#[test]
fn xshell_objective_gradient_matches_finite_difference() {
    let mut x = xshell(xshell_settings());
    assert!(x.is_valid());
    let p = x.params();
    let g = x.gradp_j(&p, OptEnergyType::Full).unwrap();
    for i in 0..p.len() {
        let fd = central_difference(&mut |q| x.j(q, OptEnergyType::Full).unwrap(), &p, i, 1e-4);
        assert_relative_eq!(g[i], fd, epsilon = 1e-5, max_relative = 1e-3);
    }
}

#[test]
fn xshell_angle_constraint_gradient_matches_finite_difference() {
    let mut x = xshell(xshell_settings());
    let p = x.params();
    let eps = x.settings().min_angle_eps;
    assert_eq!(x.num_angle_constraints(), 2);
    let values = x.angle_constraints(&p).unwrap();
    assert_relative_eq!(values[0], 2.0 * 0.75f64.atan() - eps, epsilon = 1e-8);
    assert_relative_eq!(values[1], 2.0 * (4.0f64 / 3.0).atan() - eps, epsilon = 1e-8);
    assert_relative_eq!(x.angle_constraint(&p).unwrap(), values[0], epsilon = 1e-14);

    let grads = x.gradp_angle_constraints(&p).unwrap();
    assert_eq!(grads.len(), 2);
    for (j, g) in grads.iter().enumerate() {
        assert!(norm(g) > 1e-6);
        for i in 0..p.len() {
            let fd = central_difference(&mut |q| x.angle_constraints(q).unwrap()[j], &p, i, 1e-4);
            assert_relative_eq!(g[i], fd, epsilon = 1e-6, max_relative = 1e-3);
        }
    }
    // the minimum is attained by joint 0 alone
    assert_eq!(x.gradp_angle_constraint(&p).unwrap(), grads[0]);
}

#[test]
fn xshell_angle_constraint_hessian_matches_finite_difference() {
    let mut x = xshell(xshell_settings());
    let p = x.params();
    let dp = direction(p.len());
    let w = [1.0, -0.5];
    let coeffs = HessianCoefficients { objective: 0.0, joint_angle_constraints: w.to_vec(), ..HessianCoefficients::default() };
    let hv = x.apply_hess(&p, &dp, &coeffs, OptEnergyType::Full).unwrap();

    let h = 1e-4;
    let shifted = |s: f64| p.iter().zip(&dp).map(|(a, d)| a + s * d).collect::<Vec<_>>();
    let combine = |grads: Vec<Vec<f64>>| -> Vec<f64> {
        (0..p.len()).map(|i| grads.iter().zip(&w).map(|(g, wj)| wj * g[i]).sum()).collect()
    };
    let gp = combine(x.gradp_angle_constraints(&shifted(h)).unwrap());
    let gm = combine(x.gradp_angle_constraints(&shifted(-h)).unwrap());
    let fd: Vec<f64> = gp.iter().zip(&gm).map(|(a, b)| (a - b) / (2.0 * h)).collect();
    assert_vectors_close(&hv, &fd, 2e-3, 1e-6);

    // the scalar coefficient acts through the minimizing joint
    let min_only = HessianCoefficients { objective: 0.0, angle_constraint: 1.0, ..HessianCoefficients::default() };
    let first = HessianCoefficients { objective: 0.0, joint_angle_constraints: vec![1.0], ..HessianCoefficients::default() };
    assert_eq!(
        x.apply_hess(&p, &dp, &min_only, OptEnergyType::Full).unwrap(),
        x.apply_hess(&p, &dp, &first, OptEnergyType::Full).unwrap()
    );
}

/// Lens whose far ends mirror the near ones, so both joints open to the
/// same angle.
fn symmetric_lens() -> RodLinkage {
    let pts = vec![
        0.0, 0.0, 0.0, // J0
        0.8, 0.6, 0.0, //
        1.8, 0.6, 0.0, //
        2.6, 0.0, 0.0, // J1
        3.4, 0.6, 0.0, //
        0.8, -0.6, 0.0, //
        1.8, -0.6, 0.0, //
        3.4, -0.6, 0.0,
    ];
    let rods = vec![vec![0, 1, 2, 3, 4], vec![0, 5, 6, 3, 7]];
    let m = RodMaterial { stretch_stiffness: 100.0, bend_stiffness: 1.0, twist_stiffness: 1.0 };
    RodLinkage::new(pts, &rods, vec![m; 2]).unwrap()
}

#[test]
fn tied_joint_angles_have_smooth_per_joint_gradients() {
    let flat = symmetric_lens();
    let deployed = symmetric_lens();
    let angle = deployed.average_joint_angle().unwrap() + 0.05;
    let mut x =
        XShellOptimization::new(flat, deployed, lens_fixed_vars(), lens_fixed_vars(), angle, xshell_settings()).unwrap();
    let p = x.params();
    let values = x.angle_constraints(&p).unwrap();
    assert_relative_eq!(values[0], values[1], epsilon = 1e-12);
    assert_relative_eq!(x.angle_constraint(&p).unwrap(), values[0].min(values[1]), epsilon = 1e-14);

    let grads = x.gradp_angle_constraints(&p).unwrap();
    for (j, g) in grads.iter().enumerate() {
        for i in 0..p.len() {
            let fd = central_difference(&mut |q| x.angle_constraints(q).unwrap()[j], &p, i, 1e-4);
            assert_relative_eq!(g[i], fd, epsilon = 1e-6, max_relative = 1e-3);
        }
    }
    // the min-angle gradient picks one joint; the per-joint ones stay smooth
    assert!(grads.contains(&x.gradp_angle_constraint(&p).unwrap()));
}

#[test]
fn planar_pins_keep_the_flat_linkage_flat() {
    let mut x = xshell(xshell_settings());
    let p = x.params();
    assert_eq!(x.c(&p).unwrap(), 0.0);
    assert!(x.gradp_c(&p).unwrap().iter().all(|g| g.abs() < 1e-14));
    assert!(x.has_equality_constraint());
    assert!(x.has_angle_constraint());
}

#[test]
fn optimizing_target_angle_appends_a_parameter() {
    let settings = XShellSettings { optimize_target_angle: true, ..xshell_settings() };
    let mut x = xshell(settings);
    let p = x.params();
    assert_eq!(p.len(), 4 + 6 + 1);
    assert_relative_eq!(p[10], x.target_angle().unwrap(), epsilon = 1e-14);

    let g = x.gradp_j(&p, OptEnergyType::Full).unwrap();
    let fd = central_difference(&mut |q| x.j(q, OptEnergyType::Full).unwrap(), &p, 10, 1e-4);
    assert_relative_eq!(g[10], fd, epsilon = 1e-5, max_relative = 1e-3);
    // flat-linkage constraints do not depend on the deployed angle
    assert_eq!(x.gradp_angle_constraint(&p).unwrap()[10], 0.0);
}
