//! Target surface queries and the fitter's closest-point cache.

use approx::assert_relative_eq;
use erod::fitter::TargetSurfaceFitter;
use erod::linkage::RodLinkage;
use erod::rod::RodMaterial;
use erod::target_surface::{ClosestRegion, TargetSurface};
use erod::types::*;
use nalgebra::Vector3;
use ndarray::array;

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

/// A bent four-triangle "roof" over [-2, 2]².
fn roof() -> TargetSurface {
    let v = array![
        [-2.0, -2.0, 0.0],
        [2.0, -2.0, 0.0],
        [2.0, 2.0, 0.0],
        [-2.0, 2.0, 0.0],
        [0.0, 0.0, 1.0],
    ];
    TargetSurface::new(v, vec![[0, 1, 4], [1, 2, 4], [2, 3, 4], [3, 0, 4]]).unwrap()
}

/// Tilted plane z = 0.3 + 0.2 x over [-5, 5]².
fn tilted_plane() -> TargetSurface {
    let z = |x: f64| 0.3 + 0.2 * x;
    TargetSurface::from_flat(
        &[-5.0, -5.0, z(-5.0), 5.0, -5.0, z(5.0), 5.0, 5.0, z(5.0), -5.0, 5.0, z(-5.0)],
        &[0, 1, 2, 0, 2, 3],
    )
    .unwrap()
}

fn cross() -> RodLinkage {
    let pts = vec![
        -1.0, 0.0, 0.0, //
        0.0, 0.0, 0.0, //
        1.0, 0.0, 0.0, //
        0.0, -1.0, 0.0, //
        0.0, 1.0, 0.0,
    ];
    RodLinkage::new(pts, &[vec![0, 1, 2], vec![3, 1, 4]], vec![RodMaterial::default(); 2]).unwrap()
}

fn temp_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("erod-{}-{name}", std::process::id()))
}

// ─────────────────────────────────────────────────────────────
//  Closest points
// ─────────────────────────────────────────────────────────────

#[test]
fn closest_point_beats_every_sampled_surface_point() {
    let s = roof();
    let queries = [
        Vector3::new(0.3, 0.1, 2.0),
        Vector3::new(-1.7, 0.4, -0.5),
        Vector3::new(3.0, 3.0, 0.2),
        Vector3::new(0.0, -2.5, 0.7),
    ];
    for p in &queries {
        let cp = s.closest_point(p);
        assert_relative_eq!(cp.distance, (p - cp.point).norm(), epsilon = 1e-14);
        for t in 0..s.triangles().len() {
            let [a, b, c] = s.triangle_corners(t);
            for i in 0..=10 {
                for j in 0..=(10 - i) {
                    let (u, v) = (i as f64 / 10.0, j as f64 / 10.0);
                    let q = a + (b - a) * u + (c - a) * v;
                    assert!(cp.distance <= (p - q).norm() + 1e-12);
                }
            }
        }
    }
}

#[test]
fn far_corner_query_snaps_to_vertex() {
    let s = roof();
    let cp = s.closest_point(&Vector3::new(5.0, 5.0, -1.0));
    assert!(matches!(cp.region, ClosestRegion::Vertex(_)));
    assert_relative_eq!((cp.point - Vector3::new(2.0, 2.0, 0.0)).norm(), 0.0, epsilon = 1e-14);
    assert_eq!(s.closest_point_sensitivity(&cp), nalgebra::Matrix3::zeros());
}

#[test]
fn face_sensitivity_projects_onto_tangent_plane() {
    let s = tilted_plane();
    let cp = s.closest_point(&Vector3::new(0.5, 0.5, 2.0));
    assert_eq!(cp.region, ClosestRegion::Face);
    let n = Vector3::new(-0.2, 0.0, 1.0).normalize();
    let t = Vector3::new(1.0, 0.0, 0.2);
    let p = s.closest_point_sensitivity(&cp);
    assert_relative_eq!((p * n).norm(), 0.0, epsilon = 1e-12);
    assert_relative_eq!((p * t - t).norm(), 0.0, epsilon = 1e-12);
}

// ─────────────────────────────────────────────────────────────
//  OBJ I/O
// ─────────────────────────────────────────────────────────────

#[test]
fn obj_file_round_trip() {
    let path = temp_path("roof.obj");
    let s = roof();
    s.save_obj(&path).unwrap();
    let loaded = TargetSurface::load_obj(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(loaded.triangles(), s.triangles());
    for (a, b) in loaded.vertices().iter().zip(s.vertices().iter()) {
        assert_relative_eq!(a, b, epsilon = 1e-12);
    }
}

#[test]
fn obj_negative_indices_and_missing_file() {
    let s = TargetSurface::read_obj("v 0 0 0\nv 1 0 0\nv 0 1 0\nf -3 -2 -1\n".as_bytes()).unwrap();
    assert_eq!(s.triangles(), &[[0, 1, 2]]);
    let err = TargetSurface::load_obj(temp_path("does-not-exist.obj")).unwrap_err();
    assert!(matches!(err, ErodError::Io(_)));
}

// ─────────────────────────────────────────────────────────────
//  Fitter
// ─────────────────────────────────────────────────────────────

#[test]
fn fitter_gradient_matches_finite_difference_with_fresh_projection() {
    let l = cross();
    let mut fitter = TargetSurfaceFitter::new(&l);
    fitter.set_use_centerline(&l, true);
    fitter.set_target_joint_pos_vs_target_surface_tradeoff(0.3);
    let mut x = l.network().positions().to_vec();
    x[1] += 0.2;
    x[8] -= 0.1;
    x[14] += 0.4;
    fitter.set_target_surface(&x, tilted_plane());

    let g = fitter.gradient(&x);
    let h = 1e-6;
    for i in 0..x.len() {
        let eval = |d: f64| {
            let mut y = x.clone();
            y[i] += d;
            let mut f = fitter.clone();
            f.force_update_closest_points(&y);
            f.objective(&y)
        };
        let fd = (eval(h) - eval(-h)) / (2.0 * h);
        assert_relative_eq!(g[i], fd, epsilon = 1e-8, max_relative = 1e-6);
    }
}

#[test]
fn held_closest_points_ignore_updates_until_released() {
    let l = cross();
    let mut fitter = TargetSurfaceFitter::new(&l);
    fitter.set_target_joint_pos_vs_target_surface_tradeoff(0.0);
    let x0 = l.network().positions().to_vec();
    fitter.set_target_surface(&x0, tilted_plane());
    let before = fitter.closest_points().clone();

    let mut x1 = x0.clone();
    x1[3] += 0.7; // joint vertex 1 moves in x
    fitter.set_hold_closest_points_fixed(true);
    fitter.update_closest_points(&x1);
    assert_eq!(fitter.closest_points(), &before);

    fitter.set_hold_closest_points_fixed(false);
    fitter.update_closest_points(&x1);
    assert!((fitter.closest_points()[[0, 0]] - before[[0, 0]]).abs() > 0.1);
}

#[test]
fn joint_targets_and_weights() {
    let l = cross();
    let mut fitter = TargetSurfaceFitter::new(&l);
    assert_eq!(fitter.joint_pos_weights(), &[0.0]);
    fitter.set_target_joint_pos_vs_target_surface_tradeoff(1.0);
    assert_eq!(fitter.joint_pos_weights(), &[1.0]);
    assert_eq!(fitter.surface_weights(), &[0.0]);

    assert!(fitter.set_target_joints_position(array![[0.0, 0.0]]).is_err());
    fitter.set_target_joints_position(array![[0.0, 0.0, 0.5]]).unwrap();
    let x = l.network().positions();
    assert_relative_eq!(fitter.objective(x), 0.125, epsilon = 1e-14);
    let g = fitter.gradient(x);
    assert_relative_eq!(g[5], -0.5, epsilon = 1e-14);
}
