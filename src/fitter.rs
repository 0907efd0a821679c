//! Fitting a linkage to a target surface.
//!
//! The fitting energy combines a joint-position term and a surface term
//! over sample points (the joints, or every centerline vertex):
//!
//!   E_fit = ½ Σ_j W_j ‖x_j − x̂_j‖²  +  ½ Σ_q S_q ‖x_q − cp(x_q)‖²
//!
//! cp(x) is the closest surface point.  Because cp minimizes the distance,
//! ∂E/∂x_q = S_q (x_q − cp) holds exactly and no closest-point derivative
//! enters the gradient.  The Hessian block is S_q (I − ∂cp/∂x), with the
//! sensitivity taken from the cache (zero when the points are held fixed).

use crate::energy::vertex_dofs;
use crate::linkage::RodLinkage;
use crate::target_surface::TargetSurface;
use crate::types::{check_len, ErodResult};
use nalgebra::{Matrix3, Vector3};
use ndarray::Array2;
use sprs::TriMat;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct TargetSurfaceFitter {
    surface: Option<TargetSurface>,

    joint_vertices: Vec<usize>,
    joint_valence: Vec<usize>,
    joint_pos_targets: Array2<f64>,
    /// Normalized per-joint emphasis (sums to 1).
    joint_emphasis: Vec<f64>,
    joint_pos_weight: f64,
    joint_pos_weights: Vec<f64>,

    use_centerline: bool,
    num_vertices: usize,
    query_vertices: Vec<usize>,
    surface_weights: Vec<f64>,

    hold_closest_points_fixed: bool,
    cache_valid: bool,
    closest_points: Array2<f64>,
    closest_triangles: Vec<usize>,
    sensitivities: Vec<Matrix3<f64>>,
}

impl TargetSurfaceFitter {
    /// Fitter with the current joint positions as joint targets, uniform
    /// joint emphasis, and no target surface yet.
    pub fn new(linkage: &RodLinkage) -> Self {
        let joint_vertices = linkage.joint_vertices();
        let nj = joint_vertices.len();
        let mut joint_pos_targets = Array2::zeros((nj, 3));
        for j in 0..nj {
            let p = linkage.joint_position(j);
            for c in 0..3 {
                joint_pos_targets[[j, c]] = p[c];
            }
        }
        let mut fitter = Self {
            surface: None,
            joint_valence: linkage.joints().iter().map(|j| j.valence).collect(),
            joint_vertices,
            joint_pos_targets,
            joint_emphasis: vec![1.0 / nj.max(1) as f64; nj],
            joint_pos_weight: 0.0,
            joint_pos_weights: vec![0.0; nj],
            use_centerline: false,
            num_vertices: linkage.network().num_vertices(),
            query_vertices: Vec::new(),
            surface_weights: Vec::new(),
            hold_closest_points_fixed: false,
            cache_valid: false,
            closest_points: Array2::zeros((0, 3)),
            closest_triangles: Vec::new(),
            sensitivities: Vec::new(),
        };
        fitter.rebuild_queries();
        fitter
    }

    // ── Configuration ─────────────────────────────────────

    pub fn surface(&self) -> Option<&TargetSurface> {
        self.surface.as_ref()
    }

    pub fn set_target_surface(&mut self, positions: &[f64], surface: TargetSurface) {
        self.surface = Some(surface);
        self.force_update_closest_points(positions);
    }

    pub fn load_target_surface<P: AsRef<Path>>(&mut self, positions: &[f64], path: P) -> ErodResult<()> {
        let surface = TargetSurface::load_obj(path)?;
        self.set_target_surface(positions, surface);
        Ok(())
    }

    /// Write the target surface; a fitter without one writes nothing.
    pub fn save_target_surface<P: AsRef<Path>>(&self, path: P) -> ErodResult<()> {
        match &self.surface {
            Some(s) => s.save_obj(path),
            None => Ok(()),
        }
    }

    pub fn use_centerline(&self) -> bool {
        self.use_centerline
    }

    /// Sample every centerline vertex instead of only the joints.
    pub fn set_use_centerline(&mut self, linkage: &RodLinkage, use_centerline: bool) {
        self.use_centerline = use_centerline;
        self.num_vertices = linkage.network().num_vertices();
        self.rebuild_queries();
    }

    pub fn hold_closest_points_fixed(&self) -> bool {
        self.hold_closest_points_fixed
    }
    pub fn set_hold_closest_points_fixed(&mut self, hold: bool) {
        self.hold_closest_points_fixed = hold;
    }

    pub fn joint_pos_targets(&self) -> &Array2<f64> {
        &self.joint_pos_targets
    }

    pub fn set_target_joints_position(&mut self, targets: Array2<f64>) -> ErodResult<()> {
        check_len("joint target rows", self.joint_vertices.len(), targets.nrows())?;
        check_len("joint target columns", 3, targets.ncols())?;
        self.joint_pos_targets = targets;
        Ok(())
    }

    pub fn joint_pos_weights(&self) -> &[f64] {
        &self.joint_pos_weights
    }
    pub fn surface_weights(&self) -> &[f64] {
        &self.surface_weights
    }
    pub fn query_vertices(&self) -> &[usize] {
        &self.query_vertices
    }

    /// Split each joint's emphasis between the joint-position term
    /// (fraction `joint_pos_weight`) and the surface term (the rest).
    pub fn set_target_joint_pos_vs_target_surface_tradeoff(&mut self, joint_pos_weight: f64) {
        self.joint_pos_weight = joint_pos_weight.clamp(0.0, 1.0);
        self.rebuild_queries();
    }

    /// Emphasize feature joints: valence-2 joints and the joints listed in
    /// `additional_feature_pts` are weighted `feature_multiplier` times the
    /// others before normalizing.
    pub fn scale_joint_weights(&mut self, joint_pos_weight: f64, feature_multiplier: f64, additional_feature_pts: &[usize]) {
        let raw: Vec<f64> = (0..self.joint_vertices.len())
            .map(|j| {
                if self.joint_valence[j] == 2 || additional_feature_pts.contains(&j) {
                    feature_multiplier
                } else {
                    1.0
                }
            })
            .collect();
        let total: f64 = raw.iter().sum();
        self.joint_emphasis = if total > 0.0 { raw.iter().map(|w| w / total).collect() } else { raw };
        self.set_target_joint_pos_vs_target_surface_tradeoff(joint_pos_weight);
    }

    fn rebuild_queries(&mut self) {
        let surf = 1.0 - self.joint_pos_weight;
        self.joint_pos_weights = self.joint_emphasis.iter().map(|w| self.joint_pos_weight * w).collect();
        if self.use_centerline {
            let uniform = surf / self.num_vertices.max(1) as f64;
            self.query_vertices = (0..self.num_vertices).collect();
            self.surface_weights = vec![uniform; self.num_vertices];
            for (j, &v) in self.joint_vertices.iter().enumerate() {
                self.surface_weights[v] = surf * self.joint_emphasis[j];
            }
        } else {
            self.query_vertices = self.joint_vertices.clone();
            self.surface_weights = self.joint_emphasis.iter().map(|w| surf * w).collect();
        }
        self.cache_valid = false;
    }

    // ── Closest points ────────────────────────────────────

    /// Refresh the closest-point cache unless it is held fixed.
    pub fn update_closest_points(&mut self, positions: &[f64]) {
        if self.hold_closest_points_fixed && self.cache_valid {
            return;
        }
        self.force_update_closest_points(positions);
    }

    pub fn force_update_closest_points(&mut self, positions: &[f64]) {
        let Some(surface) = &self.surface else {
            self.cache_valid = false;
            return;
        };
        let nq = self.query_vertices.len();
        let mut points = Array2::zeros((nq, 3));
        let mut tris = Vec::with_capacity(nq);
        let mut sens = Vec::with_capacity(nq);
        for (q, &v) in self.query_vertices.iter().enumerate() {
            let cp = surface.closest_point(&Self::sample(positions, v));
            for c in 0..3 {
                points[[q, c]] = cp.point[c];
            }
            tris.push(cp.triangle);
            sens.push(surface.closest_point_sensitivity(&cp));
        }
        self.closest_points = points;
        self.closest_triangles = tris;
        self.sensitivities = sens;
        self.cache_valid = true;
    }

    pub fn closest_points(&self) -> &Array2<f64> {
        &self.closest_points
    }
    pub fn closest_triangles(&self) -> &[usize] {
        &self.closest_triangles
    }

    fn sample(positions: &[f64], v: usize) -> Vector3<f64> {
        Vector3::new(positions[3 * v], positions[3 * v + 1], positions[3 * v + 2])
    }

    fn closest(&self, q: usize) -> Vector3<f64> {
        Vector3::new(self.closest_points[[q, 0]], self.closest_points[[q, 1]], self.closest_points[[q, 2]])
    }

    fn target(&self, j: usize) -> Vector3<f64> {
        Vector3::new(self.joint_pos_targets[[j, 0]], self.joint_pos_targets[[j, 1]], self.joint_pos_targets[[j, 2]])
    }

    fn surface_active(&self) -> bool {
        self.surface.is_some() && self.cache_valid
    }

    // ── Energy and derivatives ────────────────────────────

    pub fn objective(&self, positions: &[f64]) -> f64 {
        let mut e = 0.0;
        for (j, &v) in self.joint_vertices.iter().enumerate() {
            e += 0.5 * self.joint_pos_weights[j] * (Self::sample(positions, v) - self.target(j)).norm_squared();
        }
        if self.surface_active() {
            for (q, &v) in self.query_vertices.iter().enumerate() {
                e += 0.5 * self.surface_weights[q] * (Self::sample(positions, v) - self.closest(q)).norm_squared();
            }
        }
        e
    }

    /// Gradient over the position DoFs (`positions.len()` entries).
    pub fn gradient(&self, positions: &[f64]) -> Vec<f64> {
        let mut g = vec![0.0; positions.len()];
        let mut add = |v: usize, d: Vector3<f64>| {
            for (c, i) in vertex_dofs(v).into_iter().enumerate() {
                g[i] += d[c];
            }
        };
        for (j, &v) in self.joint_vertices.iter().enumerate() {
            add(v, (Self::sample(positions, v) - self.target(j)) * self.joint_pos_weights[j]);
        }
        if self.surface_active() {
            for (q, &v) in self.query_vertices.iter().enumerate() {
                add(v, (Self::sample(positions, v) - self.closest(q)) * self.surface_weights[q]);
            }
        }
        g
    }

    /// 3×3 Hessian blocks keyed by vertex.
    fn hessian_blocks(&self) -> Vec<(usize, Matrix3<f64>)> {
        let mut blocks: Vec<(usize, Matrix3<f64>)> = self
            .joint_vertices
            .iter()
            .enumerate()
            .map(|(j, &v)| (v, Matrix3::identity() * self.joint_pos_weights[j]))
            .collect();
        if self.surface_active() {
            for (q, &v) in self.query_vertices.iter().enumerate() {
                let s = if self.hold_closest_points_fixed { Matrix3::zeros() } else { self.sensitivities[q] };
                blocks.push((v, (Matrix3::identity() - s) * self.surface_weights[q]));
            }
        }
        blocks
    }

    /// Hessian applied to `v`; only position rows of the result are filled,
    /// so `v` may be an equilibrium or extended DoF vector.
    pub fn apply_hessian(&self, v: &[f64]) -> ErodResult<Vec<f64>> {
        if v.len() < 3 * self.num_vertices {
            return Err(crate::types::ErodError::Dimension {
                what: "fitter hessian operand",
                expected: 3 * self.num_vertices,
                got: v.len(),
            });
        }
        let mut out = vec![0.0; v.len()];
        for (vert, block) in self.hessian_blocks() {
            let idx = vertex_dofs(vert);
            let x = Vector3::new(v[idx[0]], v[idx[1]], v[idx[2]]);
            let hx = block * x;
            for c in 0..3 {
                out[idx[c]] += hx[c];
            }
        }
        Ok(out)
    }

    /// Append `scale ·` Hessian triplets.
    pub fn hessian_triplets(&self, tri: &mut TriMat<f64>, scale: f64) {
        for (vert, block) in self.hessian_blocks() {
            let idx = vertex_dofs(vert);
            for r in 0..3 {
                for c in 0..3 {
                    let h = scale * block[(r, c)];
                    if h != 0.0 {
                        tri.add_triplet(idx[r], idx[c], h);
                    }
                }
            }
        }
    }
}
