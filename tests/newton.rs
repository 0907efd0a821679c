//! Equilibrium solves end to end: pinned rods under load, and a planar
//! lens linkage deployed to a prescribed average opening angle.
//!
//! All configurations lie in the xy plane with every z pinned.

use approx::assert_relative_eq;
use erod::equilibrium::{compute_equilibrium, EquilibriumProblem};
use erod::linkage::RodLinkage;
use erod::rod::{ElasticRod, RodMaterial};
use erod::types::*;

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

fn material() -> RodMaterial {
    RodMaterial { stretch_stiffness: 100.0, bend_stiffness: 1.0, twist_stiffness: 1.0 }
}

fn z_dofs(num_vertices: usize) -> impl Iterator<Item = usize> {
    (0..num_vertices).map(|v| 3 * v + 2)
}

/// Planar zigzag rod clamped at its first two vertices.
fn cantilever() -> (ElasticRod, Vec<usize>) {
    let pts = vec![
        0.0, 0.0, 0.0, //
        1.0, 0.2, 0.0, //
        2.0, 0.0, 0.0, //
        3.0, 0.3, 0.0,
    ];
    let rod = ElasticRod::new(pts, material()).unwrap();
    let mut fixed: Vec<usize> = (0..6).collect();
    fixed.extend(z_dofs(4));
    (rod, fixed)
}

/// Two curved rods meeting at joints J0 (vertex 0) and J1 (vertex 3),
/// mirror-symmetric about the x axis.
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
    RodLinkage::new(pts, &rods, vec![material(); 2]).unwrap()
}

/// Rod A vertices paired with their mirror images on rod B.
const MIRROR: [(usize, usize); 3] = [(1, 5), (2, 6), (4, 7)];

/// J0 fully pinned, J1 held on the x axis, everything in plane.
fn lens_fixed_vars() -> Vec<usize> {
    let mut fixed = vec![0, 1, 2, 10];
    fixed.extend(z_dofs(8));
    fixed
}

fn free_residual(g: &[f64], forces: &[f64], fixed: &[usize]) -> f64 {
    g.iter()
        .zip(forces)
        .enumerate()
        .filter(|(i, _)| !fixed.contains(i))
        .map(|(_, (gi, fi))| (gi - fi).powi(2))
        .sum::<f64>()
        .sqrt()
}

// ─────────────────────────────────────────────────────────────
//  Rods
// ─────────────────────────────────────────────────────────────

#[test]
fn rest_configuration_converges_immediately() {
    let (mut rod, fixed) = cantilever();
    let before = rod.get_dofs();
    let report = compute_equilibrium(&mut rod, &fixed, &NewtonOptions::default()).unwrap();
    assert!(report.success);
    assert_eq!(report.num_iterations(), 1);
    assert_eq!(rod.get_dofs(), before);
}

#[test]
fn loaded_cantilever_balances_external_force() {
    let (mut rod, fixed) = cantilever();
    let before = rod.get_dofs();
    let n = rod.num_dof();
    let mut forces = vec![0.0; n];
    forces[10] = -0.02; // tip, −y

    let opts = NewtonOptions { niter: 50, ..NewtonOptions::default() };
    let report = EquilibriumProblem::new(&mut rod, &fixed)
        .unwrap()
        .with_external_forces(forces.clone())
        .unwrap()
        .solve(&opts)
        .unwrap();

    assert!(report.success, "newton failed: {report:?}");
    assert!(!report.backtracking_failure);
    assert!(report.num_iterations() > 1);
    assert!(*report.free_gradient_norm.last().unwrap() <= opts.grad_tol);
    // energy report is monotone for an unconstrained solve
    for w in report.energy.windows(2) {
        assert!(w[1] <= w[0] + 1e-12);
    }

    let after = rod.get_dofs();
    for &i in &fixed {
        assert_eq!(after[i], before[i], "fixed dof {i} moved");
    }
    assert!(after[10] < before[10], "tip should deflect along the load");
    assert!(free_residual(&rod.gradient(false), &forces, &fixed) < 1e-7);
}

#[test]
fn report_flattening_is_invertible() {
    let (mut rod, fixed) = cantilever();
    let mut forces = vec![0.0; rod.num_dof()];
    forces[9] = 0.5;
    let report = EquilibriumProblem::new(&mut rod, &fixed)
        .unwrap()
        .with_external_forces(forces)
        .unwrap()
        .solve(&NewtonOptions::default())
        .unwrap();
    let flat = report.flatten();
    assert_eq!(flat.len(), 2 + 5 * report.num_iterations());
    assert_eq!(ConvergenceReport::unflatten(&flat).unwrap(), report);
}

#[test]
fn wrong_force_length_is_rejected() {
    let (mut rod, fixed) = cantilever();
    let err = EquilibriumProblem::new(&mut rod, &fixed).unwrap().with_external_forces(vec![0.0; 3]);
    assert!(matches!(err, Err(ErodError::Dimension { .. })));
}

// ─────────────────────────────────────────────────────────────
//  Lens deployment
// ─────────────────────────────────────────────────────────────

#[test]
fn lens_joint_angles() {
    let l = lens();
    assert_eq!(l.num_joints(), 2);
    let angles = l.joint_angles();
    assert_relative_eq!(angles[0], 2.0 * 0.75f64.atan(), epsilon = 1e-12);
    assert_relative_eq!(angles[1], 2.0 * (4.0f64 / 3.0).atan(), epsilon = 1e-12);
    assert_eq!(l.min_joint_angle().unwrap().0, 0);
    assert!(l.energy() < 1e-20);
}

#[test]
fn lens_deploys_to_target_angle_symmetrically() {
    let mut l = lens();
    let fixed = lens_fixed_vars();
    let before = l.get_dofs();
    let target = l.average_joint_angle().unwrap() + 0.05;

    let opts = NewtonOptions { niter: 50, ..NewtonOptions::default() };
    let mut problem = EquilibriumProblem::with_deployment_angle(&mut l, target, &fixed).unwrap();
    let report = problem.solve(&opts).unwrap();
    let lambda = problem.lambda().unwrap();
    let kkt = problem.factor_kkt().unwrap();

    assert!(report.success, "deployment failed: {report:?}");
    assert!(!report.backtracking_failure);
    assert!(kkt.is_deployed());
    assert_relative_eq!(kkt.lambda().unwrap(), lambda, epsilon = 1e-14);
    // holding the lens open takes an actuation torque
    assert!(lambda.abs() > 1e-6);

    assert_relative_eq!(l.average_joint_angle().unwrap(), target, epsilon = 1e-7);
    assert!(l.energy() > 0.0);

    let x = l.get_dofs();
    for &i in &fixed {
        assert_eq!(x[i], before[i], "fixed dof {i} moved");
    }
    for (a, b) in MIRROR {
        assert_relative_eq!(x[3 * a], x[3 * b], epsilon = 1e-7);
        assert_relative_eq!(x[3 * a + 1], -x[3 * b + 1], epsilon = 1e-7);
    }
}

#[test]
fn deployed_kkt_solve_satisfies_constraint_row() {
    let mut l = lens();
    let fixed = lens_fixed_vars();
    let target = l.average_joint_angle().unwrap() + 0.03;
    let mut problem = EquilibriumProblem::with_deployment_angle(&mut l, target, &fixed).unwrap();
    assert!(problem.solve(&NewtonOptions::default()).unwrap().success);
    let kkt = problem.factor_kkt().unwrap();

    let n = kkt.num_dof();
    let b: Vec<f64> = (0..n).map(|i| if fixed.contains(&i) { 0.0 } else { ((i % 5) as f64 - 2.0) * 0.1 }).collect();
    let (w, _) = kkt.solve(&b, 0.25).unwrap();
    // −aᵀ w = b_λ
    let a = l.average_joint_angle_gradient().unwrap();
    let aw: f64 = a.iter().zip(&w).map(|(x, y)| x * y).sum();
    assert_relative_eq!(-aw, 0.25, epsilon = 1e-8);
    for &i in &fixed {
        assert_eq!(w[i], 0.0);
    }
}
