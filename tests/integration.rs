//! Integration tests: end-to-end design optimization of a lens linkage.
//!
//! These tests verify that the full pipeline (equilibrium → adjoint
//! gradients → argmin outer solve → committed design) reduces the
//! objective, and that the X-shell and weaving drivers run through the
//! augmented Lagrangian loop.

use approx::assert_relative_eq;
use erod::fitter::TargetSurfaceFitter;
use erod::linkage::RodLinkage;
use erod::linkage_optimization::{DesignProblem, LinkageOptimization, LinkageOptimizationSettings};
use erod::optimizer::{optimize, OptAlgorithm, OptimizeOptions};
use erod::rod::RodMaterial;
use erod::target_surface::TargetSurface;
use erod::types::*;
use erod::weaving::WeavingOptimization;
use erod::xshell::{XShellOptimization, XShellSettings};
use ndarray::array;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

// ─────────────────────────────────────────────────────────────
//  Helpers (shared lens construction)
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

/// Lens with mirrored far ends: both joints open to the same angle.
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

/// Run `f` on a worker thread; panics if it has not returned after `secs`.
fn within<T: Send + 'static>(secs: u64, f: impl FnOnce() -> T + Send + 'static) -> T {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(Duration::from_secs(secs)).expect("optimization panicked or did not return in time")
}

fn joint_targets() -> ndarray::Array2<f64> {
    array![[0.0, 0.0, 0.0], [2.45, 0.0, 0.0]]
}

fn deployed_lens_optimization() -> LinkageOptimization<RodLinkage> {
    let l = lens();
    let angle = l.average_joint_angle().unwrap() + 0.05;
    let mut fitter = TargetSurfaceFitter::new(&l);
    fitter.set_target_joint_pos_vs_target_surface_tradeoff(1.0);
    fitter.set_target_joints_position(joint_targets()).unwrap();
    let mut settings = LinkageOptimizationSettings::default();
    settings.weights.smoothing_weight = 0.01;
    LinkageOptimization::new(l, lens_fixed_vars(), Some(angle), fitter, settings).unwrap()
}

/// z = 0.3 + 0.2 x over [-5, 5]².
fn tilted_plane() -> TargetSurface {
    let z = |x: f64| 0.3 + 0.2 * x;
    TargetSurface::from_flat(
        &[-5.0, -5.0, z(-5.0), 5.0, -5.0, z(5.0), 5.0, 5.0, z(5.0), -5.0, 5.0, z(-5.0)],
        &[0, 1, 2, 0, 2, 3],
    )
    .unwrap()
}

// ─────────────────────────────────────────────────────────────
//  Linkage optimization
// ─────────────────────────────────────────────────────────────

#[test]
fn lbfgs_reduces_the_objective() {
    let mut opt = deployed_lens_optimization();
    let p0 = opt.params().to_vec();
    let j0 = opt.j(&p0, OptEnergyType::Full).unwrap();
    let target0 = opt.j(&p0, OptEnergyType::Target).unwrap();
    assert!(target0 > 0.0);

    let report = optimize(&mut opt, &OptimizeOptions { num_steps: 15, ..OptimizeOptions::default() }).unwrap();

    assert_eq!(report.params.len(), p0.len());
    assert_eq!(report.outer_iterations, 1);
    assert!(report.iterations >= 1);
    assert!(report.objective < j0, "objective {} did not drop below {j0}", report.objective);
    assert!(report.params.iter().zip(&p0).any(|(a, b)| a != b));

    // the committed design is the reported one
    assert!(opt.is_valid());
    assert_eq!(opt.params(), report.params.as_slice());
    assert_relative_eq!(opt.j(&report.params, OptEnergyType::Full).unwrap(), report.objective, epsilon = 1e-12);
    assert_relative_eq!(
        opt.committed_object().average_joint_angle().unwrap(),
        opt.configuration().angle().unwrap(),
        epsilon = 1e-7
    );
}

#[test]
fn trust_region_never_worsens_the_objective() {
    let mut opt = deployed_lens_optimization();
    let p0 = opt.params().to_vec();
    let j0 = opt.j(&p0, OptEnergyType::Full).unwrap();
    let options = OptimizeOptions {
        algorithm: OptAlgorithm::TrustRegion,
        num_steps: 3,
        trust_region_scale: 0.05,
        ..OptimizeOptions::default()
    };
    let report = optimize(&mut opt, &options).unwrap();
    assert!(report.objective <= j0 + 1e-12);
    assert!(opt.is_valid());
}

#[test]
fn objective_terms_are_reported_by_name() {
    let opt = deployed_lens_optimization();
    let values = opt.objective_values().unwrap();
    let names: Vec<&str> = values.iter().map(|(n, _)| n.as_str()).collect();
    assert!(names.len() >= 2);
    assert!(values.iter().all(|(_, v)| v.is_finite() && *v >= 0.0));
    assert!(opt.rest_kappa_smoothness().unwrap() >= 0.0);
    assert_eq!(opt.min_rest_length_indices(), vec![0, 1, 2, 3]);
}

// ─────────────────────────────────────────────────────────────
//  X-shell
// ─────────────────────────────────────────────────────────────

fn lens_xshell(flat: RodLinkage, deployed: RodLinkage, settings: XShellSettings) -> XShellOptimization {
    let angle = deployed.average_joint_angle().unwrap() + 0.05;
    let mut x = XShellOptimization::new(flat, deployed, lens_fixed_vars(), lens_fixed_vars(), angle, settings).unwrap();
    x.set_target_joint_pos_vs_target_surface_tradeoff(1.0);
    x.set_target_joints_position(joint_targets()).unwrap();
    x
}

#[test]
fn xshell_optimization_keeps_constraints_satisfied() {
    let (report, j0, committed, same_design) = within(120, || {
        let settings = XShellSettings { allow_flat_actuation: false, ..XShellSettings::default() };
        let mut x = lens_xshell(lens(), lens(), settings);
        let p0 = x.params();
        let j0 = x.j(&p0, OptEnergyType::Full).unwrap();
        let options = OptimizeOptions { num_steps: 5, min_rest_len: Some(0.1), ..OptimizeOptions::default() };
        let report = x.optimize(&options).unwrap();
        assert!(x.is_valid());
        let committed = x.j(&report.params, OptEnergyType::Full).unwrap();
        // both linkages carry the optimized rest quantities
        let l = x.flat_linkage().layout();
        let flat_design = x.flat_linkage().get_extended_dofs()[l.rest_len_offset()..].to_vec();
        let deployed_design = x.deployed_linkage().get_extended_dofs()[l.rest_len_offset()..].to_vec();
        (report, j0, committed, flat_design == deployed_design)
    });

    assert!(report.outer_iterations >= 1);
    assert_eq!(report.objective_history.len(), report.outer_iterations);
    assert!(report.constraint_max_violation < 1e-6);
    assert!(report.objective <= j0 + 1e-9 * j0.abs().max(1.0), "objective rose from {j0} to {}", report.objective);
    assert_relative_eq!(committed, report.objective, epsilon = 1e-9, max_relative = 1e-9);
    assert_eq!(report.params.len(), 4 + 6);
    assert!(report.params[..4].iter().all(|&l| l >= 0.1 - 1e-6));
    assert!(same_design);
}

#[test]
fn xshell_optimization_with_tied_joint_angles_terminates() {
    let (report, j0, angles) = within(120, || {
        let a0 = symmetric_lens().joint_angles();
        assert_relative_eq!(a0[0], a0[1], epsilon = 1e-12);
        // the bound sits just below the tied angles so it can become active
        let settings =
            XShellSettings { min_angle_eps: a0[0] - 0.01, allow_flat_actuation: false, ..XShellSettings::default() };
        let mut x = lens_xshell(symmetric_lens(), symmetric_lens(), settings);
        let p0 = x.params();
        let j0 = x.j(&p0, OptEnergyType::Full).unwrap();
        let report = x.optimize(&OptimizeOptions { num_steps: 5, ..OptimizeOptions::default() }).unwrap();
        let angles = x.angle_constraints(&report.params).unwrap();
        (report, j0, angles)
    });

    assert!(report.outer_iterations >= 1);
    assert!(report.objective <= j0 + 1e-9 * j0.abs().max(1.0), "objective rose from {j0} to {}", report.objective);
    assert!(report.constraint_max_violation < 1e-6);
    assert_eq!(angles.len(), 2);
    assert!(angles.iter().all(|&a| a > -1e-6), "angle constraints violated: {angles:?}");
}

#[test]
fn xshell_rejects_mismatched_topology() {
    let single_rod = lens().network().positions()[..15].to_vec();
    let other = RodLinkage::new(single_rod, &[vec![0, 1, 2, 3, 4]], vec![RodMaterial::default()]).unwrap();
    let err = XShellOptimization::new(lens(), other, vec![], vec![], 1.0, XShellSettings::default());
    assert!(matches!(err, Err(ErodError::InvalidInput(_))));
}

// ─────────────────────────────────────────────────────────────
//  Weaving
// ─────────────────────────────────────────────────────────────

#[test]
fn weaving_attracts_joints_and_optimizes() {
    let settings = LinkageOptimizationSettings::default();
    let mut w = WeavingOptimization::new(lens(), tilted_plane(), lens_fixed_vars(), 1.0, settings).unwrap();
    assert!(w.optimization().is_valid());
    assert!(w.linkage().attraction_energy() > 0.0);
    // J1 (vertex 3) lies below the plane and is pulled towards −x
    assert!(w.linkage().get_dofs()[9] < 2.6);

    let p0 = w.params();
    let j0 = w.j(&p0, OptEnergyType::Full).unwrap();
    let report = w.optimize(&OptimizeOptions { num_steps: 3, ..OptimizeOptions::default() }).unwrap();
    assert!(report.objective <= j0 + 1e-12);
    assert!(w.optimization().is_valid());
}

// ─────────────────────────────────────────────────────────────
//  Settings
// ─────────────────────────────────────────────────────────────

#[test]
fn partial_json_settings_fill_in_defaults() {
    let opts: OptimizeOptions =
        serde_json::from_str(r#"{ "num_steps": 7, "algorithm": "TrustRegion", "min_rest_len": 0.2, "al": { "mu_max": 1e4 } }"#)
            .unwrap();
    assert_eq!(opts.num_steps, 7);
    assert_eq!(opts.algorithm, OptAlgorithm::TrustRegion);
    assert_eq!(opts.min_rest_len, Some(0.2));
    assert_eq!(opts.optimality_tol, 1e-6);
    assert_eq!(opts.al.mu_max, 1e4);
    assert_eq!(opts.al.mu_init, 10.0);

    let s: XShellSettings =
        serde_json::from_str(r#"{ "min_angle_eps": 0.02, "linkage": { "use_envelope_theorem": false, "weights": { "beta": 5.0 } } }"#)
            .unwrap();
    assert_eq!(s.min_angle_eps, 0.02);
    assert!(s.allow_flat_actuation);
    assert!(!s.linkage.use_envelope_theorem);
    assert_eq!(s.linkage.weights.beta, 5.0);
    assert_eq!(s.linkage.weights.gamma, 1.0);
    assert_eq!(s.linkage.newton.niter, 50);
}
