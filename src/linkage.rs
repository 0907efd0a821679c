//! Rod linkages: rods coupled at shared joint vertices.
//!
//! A joint is a vertex visited by exactly two rods.  The hinge between the
//! rods is free; the only coupling is the shared position.  The opening
//! angle of each joint is measured between the two rods' edges leaving the
//! joint, and the average opening angle drives deployment.

use crate::energy::{self, vertex_dofs, Tangent};
use crate::fitter::TargetSurfaceFitter;
use crate::rod::{RodMaterial, RodNetwork, SegmentMode};
use crate::target_surface::TargetSurface;
use crate::types::{DofLayout, ElasticObject, EnergyType, ErodError, ErodResult, LinkageObject};
use nalgebra::Vector3;
use sprs::TriMat;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Joint {
    pub vertex: usize,
    pub rod_a: usize,
    pub rod_b: usize,
    /// Edge of rod A used for the opening angle and the joint torque.
    pub edge_a: usize,
    pub edge_b: usize,
    /// Number of rod edges incident to the joint (2..=4).
    pub valence: usize,
    /// A joint where either rod terminates.
    pub boundary: bool,
}

#[derive(Debug, Clone)]
pub struct RodLinkage {
    network: RodNetwork,
    joints: Vec<Joint>,
}

impl RodLinkage {
    /// Build a linkage from rod vertex sequences over a shared point array.
    /// Vertices visited by two rods become joints; rest-length segments run
    /// between joints.
    pub fn new(positions: Vec<f64>, rods: &[Vec<usize>], materials: Vec<RodMaterial>) -> ErodResult<Self> {
        let nv = positions.len() / 3;
        let mut visits: Vec<Vec<(usize, usize)>> = vec![Vec::new(); nv];
        for (r, verts) in rods.iter().enumerate() {
            for (i, &v) in verts.iter().enumerate() {
                if v >= nv {
                    return Err(ErodError::IndexOutOfRange { what: "rod vertex", index: v, len: nv });
                }
                if visits[v].iter().any(|&(other, _)| other == r) {
                    return Err(ErodError::InvalidInput(format!("rod {r} visits vertex {v} twice")));
                }
                visits[v].push((r, i));
            }
        }
        if let Some(v) = visits.iter().position(|vis| vis.len() > 2) {
            return Err(ErodError::InvalidInput(format!("vertex {v} is shared by more than two rods")));
        }
        let is_joint: Vec<bool> = visits.iter().map(|vis| vis.len() == 2).collect();
        let network = RodNetwork::new(positions, rods, materials, SegmentMode::BetweenJoints(&is_joint))?;

        let mut joints = Vec::new();
        for (v, vis) in visits.iter().enumerate() {
            if vis.len() != 2 {
                continue;
            }
            let (ra, ia) = vis[0];
            let (rb, ib) = vis[1];
            let side = |r: usize, i: usize| {
                let rod = &network.rods()[r];
                let last = rod.vertices.len() - 1;
                let edge = if i < last { rod.edges[i] } else { rod.edges[i - 1] };
                let incident = usize::from(i > 0) + usize::from(i < last);
                (edge, incident, i == 0 || i == last)
            };
            let (edge_a, na, end_a) = side(ra, ia);
            let (edge_b, nb, end_b) = side(rb, ib);
            joints.push(Joint {
                vertex: v,
                rod_a: ra,
                rod_b: rb,
                edge_a,
                edge_b,
                valence: na + nb,
                boundary: end_a || end_b,
            });
        }
        Ok(Self { network, joints })
    }

    pub fn network(&self) -> &RodNetwork {
        &self.network
    }
    pub fn network_mut(&mut self) -> &mut RodNetwork {
        &mut self.network
    }
    pub fn joints(&self) -> &[Joint] {
        &self.joints
    }
    pub fn num_joints(&self) -> usize {
        self.joints.len()
    }
    pub fn joint_vertices(&self) -> Vec<usize> {
        self.joints.iter().map(|j| j.vertex).collect()
    }
    pub fn joint_position(&self, j: usize) -> Vector3<f64> {
        self.network.vertex(self.joints[j].vertex)
    }

    /// Unit tangents of the two edges defining joint `j`.
    pub fn joint_tangents(&self, j: usize) -> (Tangent, Tangent) {
        let jt = self.joints[j];
        let tangent = |e: usize| {
            let ed = self.network.edges()[e];
            Tangent::new(self.network.vertex(ed.head) - self.network.vertex(ed.tail))
        };
        (tangent(jt.edge_a), tangent(jt.edge_b))
    }

    // ── Joint angles ──────────────────────────────────────

    pub fn joint_angle_stencil(&self, j: usize) -> energy::Stencil {
        let jt = self.joints[j];
        let ea = self.network.edges()[jt.edge_a];
        let eb = self.network.edges()[jt.edge_b];
        let verts = [ea.tail, ea.head, eb.tail, eb.head];
        let dofs = verts.iter().flat_map(|&v| vertex_dofs(v)).collect();
        energy::joint_angle(verts.map(|v| self.network.vertex(v)), dofs)
    }

    pub fn joint_angles(&self) -> Vec<f64> {
        (0..self.joints.len()).map(|j| self.joint_angle_stencil(j).value).collect()
    }

    /// Smallest joint opening angle and the joint attaining it.
    pub fn min_joint_angle(&self) -> Option<(usize, f64)> {
        self.joint_angles()
            .into_iter()
            .enumerate()
            .fold(None, |best, (j, a)| match best {
                Some((_, b)) if b <= a => best,
                _ => Some((j, a)),
            })
    }

    fn require_joints(&self) -> ErodResult<f64> {
        if self.joints.is_empty() {
            return Err(ErodError::InvalidInput("linkage has no joints".into()));
        }
        Ok(1.0 / self.joints.len() as f64)
    }

    pub fn average_joint_angle(&self) -> ErodResult<f64> {
        let w = self.require_joints()?;
        Ok(self.joint_angles().iter().sum::<f64>() * w)
    }

    /// Gradient of the average joint angle over the equilibrium DoFs.
    pub fn average_joint_angle_gradient(&self) -> ErodResult<Vec<f64>> {
        let w = self.require_joints()?;
        let mut g = vec![0.0; self.network.layout().num_dof()];
        for j in 0..self.joints.len() {
            self.joint_angle_stencil(j).scatter_gradient(&mut g, w);
        }
        Ok(g)
    }

    pub fn average_joint_angle_hessian(&self) -> ErodResult<TriMat<f64>> {
        let w = self.require_joints()?;
        let n = self.network.layout().num_dof();
        let mut tri = TriMat::new((n, n));
        for j in 0..self.joints.len() {
            self.joint_angle_stencil(j).scatter_hessian(&mut tri, n, w);
        }
        Ok(tri)
    }

    /// Hessian of the average joint angle applied to `v`; `v` may be an
    /// equilibrium or extended DoF vector (design rows stay zero).
    pub fn average_joint_angle_apply_hessian(&self, v: &[f64]) -> ErodResult<Vec<f64>> {
        let w = self.require_joints()?;
        let mut out = vec![0.0; v.len()];
        for j in 0..self.joints.len() {
            self.joint_angle_stencil(j).scatter_hessian_product(v, &mut out, w);
        }
        Ok(out)
    }

    // ── Joint generalized forces ─────────────────────────

    /// Force and torque rod A exerts through joint `j`: the gradient of rod
    /// A's energy with respect to the joint position and to the material
    /// angle of its joint edge.
    pub fn joint_forces(&self, j: usize) -> (Vector3<f64>, f64) {
        let jt = self.joints[j];
        let g = self.network.rod_gradient(jt.rod_a);
        let [i0, i1, i2] = vertex_dofs(jt.vertex);
        let torque = g[self.network.layout().theta_offset() + jt.edge_a];
        (Vector3::new(g[i0], g[i1], g[i2]), torque)
    }

    pub fn max_strain(&self) -> f64 {
        self.network.max_strain()
    }
}

impl ElasticObject for RodLinkage {
    fn layout(&self) -> DofLayout {
        self.network.layout()
    }
    fn get_dofs(&self) -> Vec<f64> {
        self.network.get_dofs()
    }
    fn set_dofs(&mut self, dofs: &[f64]) -> ErodResult<()> {
        self.network.set_dofs(dofs)
    }
    fn get_extended_dofs(&self) -> Vec<f64> {
        self.network.get_extended_dofs()
    }
    fn set_extended_dofs(&mut self, dofs: &[f64]) -> ErodResult<()> {
        self.network.set_extended_dofs(dofs)
    }
    fn energy_of(&self, ty: EnergyType) -> f64 {
        self.network.energy(ty)
    }
    fn gradient(&self, variable_design: bool) -> Vec<f64> {
        self.network.gradient(variable_design)
    }
    fn hessian(&self, variable_design: bool) -> TriMat<f64> {
        self.network.hessian(variable_design)
    }
    fn apply_hessian(&self, v: &[f64], variable_design: bool) -> ErodResult<Vec<f64>> {
        self.network.apply_hessian(v, variable_design)
    }
    fn gauge_vars(&self) -> Vec<usize> {
        self.network.gauge_vars()
    }
    fn characteristic_length(&self) -> f64 {
        self.network.characteristic_length()
    }
}

impl LinkageObject for RodLinkage {
    fn linkage(&self) -> &RodLinkage {
        self
    }
}

// ─────────────────────────────────────────────────────────────
//  Surface-attracted linkage
// ─────────────────────────────────────────────────────────────

/// A linkage whose energy includes an attraction of its joints (or its
/// whole centerline) towards a target surface:
///
///   E = E_elastic + w · E_fit
///
/// Closest points are refreshed on every `set_dofs` unless the fitter
/// holds them fixed.
#[derive(Debug, Clone)]
pub struct SurfaceAttractedLinkage {
    linkage: RodLinkage,
    fitter: TargetSurfaceFitter,
    attraction_weight: f64,
}

impl SurfaceAttractedLinkage {
    pub fn new(linkage: RodLinkage, fitter: TargetSurfaceFitter, attraction_weight: f64) -> ErodResult<Self> {
        if attraction_weight < 0.0 || !attraction_weight.is_finite() {
            return Err(ErodError::InvalidInput("attraction weight must be non-negative".into()));
        }
        let mut s = Self { linkage, fitter, attraction_weight };
        s.fitter.update_closest_points(s.linkage.network().positions());
        Ok(s)
    }

    pub fn fitter(&self) -> &TargetSurfaceFitter {
        &self.fitter
    }

    pub fn attraction_weight(&self) -> f64 {
        self.attraction_weight
    }
    pub fn set_attraction_weight(&mut self, w: f64) -> ErodResult<()> {
        if w < 0.0 || !w.is_finite() {
            return Err(ErodError::InvalidInput("attraction weight must be non-negative".into()));
        }
        self.attraction_weight = w;
        Ok(())
    }

    pub fn set_target_surface(&mut self, surface: TargetSurface) {
        self.fitter.set_target_surface(self.linkage.network().positions(), surface);
    }

    pub fn set_use_centerline(&mut self, use_centerline: bool) {
        self.fitter.set_use_centerline(&self.linkage, use_centerline);
        self.fitter.force_update_closest_points(self.linkage.network().positions());
    }

    pub fn set_hold_closest_points_fixed(&mut self, hold: bool) {
        self.fitter.set_hold_closest_points_fixed(hold);
    }

    pub fn attraction_energy(&self) -> f64 {
        self.attraction_weight * self.fitter.objective(self.linkage.network().positions())
    }
}

impl ElasticObject for SurfaceAttractedLinkage {
    fn layout(&self) -> DofLayout {
        self.linkage.layout()
    }
    fn get_dofs(&self) -> Vec<f64> {
        self.linkage.get_dofs()
    }
    fn set_dofs(&mut self, dofs: &[f64]) -> ErodResult<()> {
        self.linkage.set_dofs(dofs)?;
        self.fitter.update_closest_points(self.linkage.network().positions());
        Ok(())
    }
    fn get_extended_dofs(&self) -> Vec<f64> {
        self.linkage.get_extended_dofs()
    }
    fn set_extended_dofs(&mut self, dofs: &[f64]) -> ErodResult<()> {
        self.linkage.set_extended_dofs(dofs)?;
        self.fitter.update_closest_points(self.linkage.network().positions());
        Ok(())
    }
    fn energy_of(&self, ty: EnergyType) -> f64 {
        let e = self.linkage.energy_of(ty);
        match ty {
            EnergyType::Full => e + self.attraction_energy(),
            _ => e,
        }
    }
    fn gradient(&self, variable_design: bool) -> Vec<f64> {
        let mut g = self.linkage.gradient(variable_design);
        let gf = self.fitter.gradient(self.linkage.network().positions());
        for (gi, fi) in g.iter_mut().zip(&gf) {
            *gi += self.attraction_weight * fi;
        }
        g
    }
    fn hessian(&self, variable_design: bool) -> TriMat<f64> {
        let mut tri = self.linkage.hessian(variable_design);
        self.fitter.hessian_triplets(&mut tri, self.attraction_weight);
        tri
    }
    fn apply_hessian(&self, v: &[f64], variable_design: bool) -> ErodResult<Vec<f64>> {
        let mut out = self.linkage.apply_hessian(v, variable_design)?;
        let hv = self.fitter.apply_hessian(v)?;
        for (o, h) in out.iter_mut().zip(&hv) {
            *o += self.attraction_weight * h;
        }
        Ok(out)
    }
    fn gauge_vars(&self) -> Vec<usize> {
        self.linkage.gauge_vars()
    }
    fn characteristic_length(&self) -> f64 {
        self.linkage.characteristic_length()
    }
}

impl LinkageObject for SurfaceAttractedLinkage {
    fn linkage(&self) -> &RodLinkage {
        &self.linkage
    }
}
