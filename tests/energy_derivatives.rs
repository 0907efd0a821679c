//! Finite-difference checks of the elastic energy derivatives over the
//! extended DoFs (positions, material angles, rest lengths, rest kappas).
//!
//!     ∂E/∂z_i  ≈  [ E(z + h eᵢ) − E(z − h eᵢ) ] / 2h
//!     H eᵢ     ≈  [ ∇E(z + h eᵢ) − ∇E(z − h eᵢ) ] / 2h
//!
//! Configurations are perturbed away from their rest state so every
//! energy term (stretching, bending, twisting) contributes.

use approx::assert_relative_eq;
use erod::linkage::RodLinkage;
use erod::rod::{ElasticRod, RodMaterial};
use erod::types::*;
use sprs::CsMat;

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

fn material() -> RodMaterial {
    RodMaterial { stretch_stiffness: 50.0, bend_stiffness: 1.0, twist_stiffness: 0.7 }
}

/// A non-planar zigzag rod, displaced and twisted away from rest.
fn deformed_rod() -> ElasticRod {
    let pts = vec![
        0.0, 0.0, 0.0, //
        1.0, 0.2, 0.0, //
        2.0, 0.0, 0.1, //
        3.0, 0.3, 0.0, //
        4.1, 0.1, -0.2,
    ];
    let mut rod = ElasticRod::new(pts, material()).unwrap();
    let mut d = rod.get_dofs();
    d[6] += 0.05;
    d[7] -= 0.1;
    d[8] += 0.07;
    d[13] -= 0.04;
    let t = rod.layout().theta_offset();
    d[t + 1] = 0.3;
    d[t + 2] = -0.2;
    d[t + 3] = 0.15;
    rod.set_dofs(&d).unwrap();
    rod
}

/// Two curved rods joined at both ends of a lens, with tails past the
/// second joint; all edges of the lens segments have unit length.
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

fn deformed_lens() -> RodLinkage {
    let mut l = lens();
    let mut d = l.get_dofs();
    d[4] += 0.05; // vertex 1, y
    d[6] -= 0.03; // vertex 2, x
    d[20] += 0.02; // vertex 6, z
    d[13] -= 0.1; // vertex 4, y
    let t = l.layout().theta_offset();
    d[t + 2] = 0.1;
    d[t + 6] = -0.25;
    l.set_dofs(&d).unwrap();
    l
}

fn perturbed<O: ElasticObject>(obj: &O, i: usize, h: f64) -> O {
    let mut o = obj.clone();
    let mut z = o.get_extended_dofs();
    z[i] += h;
    o.set_extended_dofs(&z).unwrap();
    o
}

/// Dense copy built from the stored entries, independent of the sparse crate's own ndarray.
fn to_dense(m: &CsMat<f64>) -> ndarray::Array2<f64> {
    let mut d = ndarray::Array2::zeros((m.rows(), m.cols()));
    for (&v, (r, c)) in m.iter() {
        d[[r, c]] += v;
    }
    d
}

fn dense_hessian<O: ElasticObject>(obj: &O) -> ndarray::Array2<f64> {
    to_dense(&obj.hessian(true).to_csr())
}

fn check_gradient<O: ElasticObject>(obj: &O) {
    let g = obj.gradient(true);
    assert_eq!(g.len(), obj.num_extended_dof());
    let h = 1e-6;
    for i in 0..g.len() {
        let fd = (perturbed(obj, i, h).energy() - perturbed(obj, i, -h).energy()) / (2.0 * h);
        assert_relative_eq!(g[i], fd, epsilon = 1e-6, max_relative = 1e-5);
    }
}

fn check_hessian<O: ElasticObject>(obj: &O) {
    let hess = dense_hessian(obj);
    let n = obj.num_extended_dof();
    let h = 1e-6;
    for i in 0..n {
        let gp = perturbed(obj, i, h).gradient(true);
        let gm = perturbed(obj, i, -h).gradient(true);
        for r in 0..n {
            let fd = (gp[r] - gm[r]) / (2.0 * h);
            assert_relative_eq!(hess[[r, i]], fd, epsilon = 1e-4, max_relative = 1e-4);
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────

#[test]
fn rod_gradient_matches_finite_difference() {
    check_gradient(&deformed_rod());
}

#[test]
fn rod_hessian_matches_finite_difference() {
    check_hessian(&deformed_rod());
}

#[test]
fn linkage_gradient_matches_finite_difference() {
    check_gradient(&deformed_lens());
}

#[test]
fn linkage_hessian_matches_finite_difference() {
    check_hessian(&deformed_lens());
}

#[test]
fn hessian_is_symmetric_and_apply_matches_assembly() {
    let l = deformed_lens();
    let hess = dense_hessian(&l);
    let n = l.num_extended_dof();
    let v: Vec<f64> = (0..n).map(|i| ((i * 7 % 11) as f64 - 5.0) / 5.0).collect();
    let hv = l.apply_hessian(&v, true).unwrap();
    for r in 0..n {
        let dense: f64 = (0..n).map(|c| hess[[r, c]] * v[c]).sum();
        assert_relative_eq!(hv[r], dense, epsilon = 1e-10, max_relative = 1e-10);
        for c in 0..n {
            assert_relative_eq!(hess[[r, c]], hess[[c, r]], epsilon = 1e-10, max_relative = 1e-10);
        }
    }
}

#[test]
fn equilibrium_hessian_is_the_leading_block() {
    let rod = deformed_rod();
    let n = rod.num_dof();
    let full = dense_hessian(&rod);
    let small: CsMat<f64> = rod.hessian(false).to_csr();
    let small = to_dense(&small);
    assert_eq!(small.dim(), (n, n));
    for r in 0..n {
        for c in 0..n {
            assert_relative_eq!(small[[r, c]], full[[r, c]], epsilon = 1e-12);
        }
    }
    // design rows of the equilibrium gradient are dropped, not zeroed
    assert_eq!(rod.gradient(false).len(), n);
}

#[test]
fn energy_split_sums_to_full() {
    let l = deformed_lens();
    let parts = l.energy_of(EnergyType::Stretch) + l.energy_of(EnergyType::Bend) + l.energy_of(EnergyType::Twist);
    assert_relative_eq!(parts, l.energy(), max_relative = 1e-12);
    assert!(l.energy_of(EnergyType::Twist) > 0.0);
}
