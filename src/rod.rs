//! Rod networks: topology, state and assembly of the elastic energy.
//!
//! A [`RodNetwork`] is a set of polyline rods over a shared vertex array.
//! It owns the equilibrium DoFs (positions, material-frame angles) and the
//! design DoFs (segment rest lengths, rest kappas) and assembles the
//! element kernels of [`crate::energy`] into global energies, gradients,
//! Hessians and Hessian-vector products.  [`ElasticRod`] is the single-rod
//! variant; linkages live in [`crate::linkage`].

use crate::energy::{self, vertex_dofs, vertex_position, BendParams, Stencil};
use crate::types::{
    check_len, DofLayout, ElasticObject, EnergyType, ErodError, ErodResult, MIN_EDGE_LENGTH,
};
use serde::{Deserialize, Serialize};
use sprs::TriMat;

// ─────────────────────────────────────────────────────────────
//  Material
// ─────────────────────────────────────────────────────────────

/// Stiffness constants of a rod (products of modulus and section moment).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RodMaterial {
    /// E·A
    pub stretch_stiffness: f64,
    /// E·I
    pub bend_stiffness: f64,
    /// G·J
    pub twist_stiffness: f64,
}

impl Default for RodMaterial {
    fn default() -> Self {
        Self { stretch_stiffness: 1.0e3, bend_stiffness: 1.0, twist_stiffness: 1.0 }
    }
}

// ─────────────────────────────────────────────────────────────
//  Topology
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub tail: usize,
    pub head: usize,
    pub rod: usize,
    pub segment: usize,
}

/// Interior rod vertex carrying bending and twisting energy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bend {
    pub verts: [usize; 3],
    pub edges: [usize; 2],
    pub rod: usize,
}

/// Global vertex, edge, bend and segment ids of one rod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rod {
    pub vertices: Vec<usize>,
    pub edges: Vec<usize>,
    pub bends: Vec<usize>,
    pub segments: Vec<usize>,
}

/// How rod edges are grouped into rest-length segments.
#[derive(Debug, Clone, Copy)]
pub enum SegmentMode<'a> {
    /// Every edge is its own segment.
    PerEdge,
    /// Segments break at the flagged vertices (joints).
    BetweenJoints(&'a [bool]),
}

// ─────────────────────────────────────────────────────────────
//  Network
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RodNetwork {
    num_vertices: usize,
    rods: Vec<Rod>,
    edges: Vec<Edge>,
    bends: Vec<Bend>,
    segment_edge_count: Vec<usize>,
    materials: Vec<RodMaterial>,

    positions: Vec<f64>,
    thetas: Vec<f64>,
    rest_lengths: Vec<f64>,
    rest_kappas: Vec<f64>,
}

impl RodNetwork {
    /// Build a network from rod vertex sequences.
    ///
    /// Segment rest lengths start at the summed edge lengths and rest
    /// kappas at the current curvature, so the input configuration is
    /// bending-stress free.
    pub fn new(
        positions: Vec<f64>,
        rods: &[Vec<usize>],
        materials: Vec<RodMaterial>,
        mode: SegmentMode<'_>,
    ) -> ErodResult<Self> {
        if positions.len() % 3 != 0 {
            return Err(ErodError::InvalidInput(format!(
                "position array length {} is not a multiple of 3", positions.len()
            )));
        }
        let num_vertices = positions.len() / 3;
        check_len("rod materials", rods.len(), materials.len())?;
        if let SegmentMode::BetweenJoints(flags) = mode {
            check_len("joint flags", num_vertices, flags.len())?;
        }

        let mut used = vec![false; num_vertices];
        let mut out_rods = Vec::with_capacity(rods.len());
        let mut edges = Vec::new();
        let mut bends = Vec::new();
        let mut segment_edge_count = Vec::new();

        for (r, verts) in rods.iter().enumerate() {
            if verts.len() < 2 {
                return Err(ErodError::InvalidInput(format!("rod {r} has fewer than two vertices")));
            }
            let mut rod = Rod { vertices: verts.clone(), edges: Vec::new(), bends: Vec::new(), segments: Vec::new() };
            for (i, w) in verts.windows(2).enumerate() {
                for &v in w {
                    if v >= num_vertices {
                        return Err(ErodError::IndexOutOfRange { what: "rod vertex", index: v, len: num_vertices });
                    }
                    used[v] = true;
                }
                let len = (vertex_position(&positions, w[1]) - vertex_position(&positions, w[0])).norm();
                if len <= MIN_EDGE_LENGTH {
                    return Err(ErodError::InvalidInput(format!("rod {r} has a zero-length edge at {i}")));
                }
                let new_segment = match mode {
                    SegmentMode::PerEdge => true,
                    SegmentMode::BetweenJoints(flags) => i == 0 || flags[w[0]],
                };
                if new_segment {
                    rod.segments.push(segment_edge_count.len());
                    segment_edge_count.push(0);
                }
                let segment = segment_edge_count.len() - 1;
                segment_edge_count[segment] += 1;
                rod.edges.push(edges.len());
                edges.push(Edge { tail: w[0], head: w[1], rod: r, segment });
            }
            for i in 1..verts.len() - 1 {
                rod.bends.push(bends.len());
                bends.push(Bend {
                    verts: [verts[i - 1], verts[i], verts[i + 1]],
                    edges: [rod.edges[i - 1], rod.edges[i]],
                    rod: r,
                });
            }
            out_rods.push(rod);
        }
        if let Some(v) = used.iter().position(|u| !u) {
            return Err(ErodError::InvalidInput(format!("vertex {v} belongs to no rod")));
        }

        let mut rest_lengths = vec![0.0; segment_edge_count.len()];
        for e in &edges {
            rest_lengths[e.segment] +=
                (vertex_position(&positions, e.head) - vertex_position(&positions, e.tail)).norm();
        }
        let rest_kappas = bends
            .iter()
            .map(|b| energy::curvature(b.verts.map(|v| vertex_position(&positions, v))))
            .collect();

        Ok(Self {
            num_vertices,
            thetas: vec![0.0; edges.len()],
            rods: out_rods,
            edges,
            bends,
            segment_edge_count,
            materials,
            positions,
            rest_lengths,
            rest_kappas,
        })
    }

    // ── Accessors ─────────────────────────────────────────

    pub fn layout(&self) -> DofLayout {
        DofLayout {
            num_vertices: self.num_vertices,
            num_edges: self.edges.len(),
            num_segments: self.rest_lengths.len(),
            num_bends: self.bends.len(),
        }
    }

    pub fn num_vertices(&self) -> usize {
        self.num_vertices
    }
    pub fn rods(&self) -> &[Rod] {
        &self.rods
    }
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }
    pub fn bends(&self) -> &[Bend] {
        &self.bends
    }
    pub fn positions(&self) -> &[f64] {
        &self.positions
    }
    pub fn thetas(&self) -> &[f64] {
        &self.thetas
    }
    pub fn rest_lengths(&self) -> &[f64] {
        &self.rest_lengths
    }
    pub fn rest_kappas(&self) -> &[f64] {
        &self.rest_kappas
    }
    pub fn segment_edge_count(&self, s: usize) -> usize {
        self.segment_edge_count[s]
    }

    pub fn set_rest_lengths(&mut self, rest_lengths: &[f64]) -> ErodResult<()> {
        check_len("segment rest lengths", self.rest_lengths.len(), rest_lengths.len())?;
        if let Some(s) = rest_lengths.iter().position(|&l| l <= 0.0 || !l.is_finite()) {
            return Err(ErodError::InvalidInput(format!("segment {s} rest length must be positive")));
        }
        self.rest_lengths.copy_from_slice(rest_lengths);
        Ok(())
    }

    pub fn set_rest_kappas(&mut self, rest_kappas: &[f64]) -> ErodResult<()> {
        check_len("rest kappas", self.rest_kappas.len(), rest_kappas.len())?;
        self.rest_kappas.copy_from_slice(rest_kappas);
        Ok(())
    }

    pub fn vertex(&self, v: usize) -> nalgebra::Vector3<f64> {
        vertex_position(&self.positions, v)
    }

    /// Rest length of one edge (its share of the segment rest length).
    pub fn edge_rest_length(&self, e: usize) -> f64 {
        let s = self.edges[e].segment;
        self.rest_lengths[s] / self.segment_edge_count[s] as f64
    }

    pub fn edge_length(&self, e: usize) -> f64 {
        let ed = self.edges[e];
        (self.vertex(ed.head) - self.vertex(ed.tail)).norm()
    }

    // ── DoF access ────────────────────────────────────────

    pub fn get_dofs(&self) -> Vec<f64> {
        let mut d = Vec::with_capacity(self.layout().num_dof());
        d.extend_from_slice(&self.positions);
        d.extend_from_slice(&self.thetas);
        d
    }

    pub fn set_dofs(&mut self, dofs: &[f64]) -> ErodResult<()> {
        let l = self.layout();
        check_len("dofs", l.num_dof(), dofs.len())?;
        if dofs.iter().any(|v| !v.is_finite()) {
            return Err(ErodError::InvalidInput("non-finite DoF value".into()));
        }
        self.positions.copy_from_slice(&dofs[..l.theta_offset()]);
        self.thetas.copy_from_slice(&dofs[l.theta_offset()..]);
        Ok(())
    }

    pub fn get_extended_dofs(&self) -> Vec<f64> {
        let mut d = self.get_dofs();
        d.extend_from_slice(&self.rest_lengths);
        d.extend_from_slice(&self.rest_kappas);
        d
    }

    pub fn set_extended_dofs(&mut self, dofs: &[f64]) -> ErodResult<()> {
        let l = self.layout();
        check_len("extended dofs", l.num_extended_dof(), dofs.len())?;
        self.set_rest_lengths(&dofs[l.rest_len_offset()..l.rest_kappa_offset()])?;
        self.set_rest_kappas(&dofs[l.rest_kappa_offset()..])?;
        self.set_dofs(&dofs[..l.num_dof()])
    }

    /// First material angle of every rod: twisting only sees angle
    /// differences, so one angle per rod is a free gauge.
    pub fn gauge_vars(&self) -> Vec<usize> {
        let off = self.layout().theta_offset();
        self.rods.iter().map(|r| off + r.edges[0]).collect()
    }

    // ── Element stencils ──────────────────────────────────

    fn stretch_stencil(&self, e: usize) -> Stencil {
        let l = self.layout();
        let ed = self.edges[e];
        let mut dofs = Vec::with_capacity(7);
        dofs.extend(vertex_dofs(ed.tail));
        dofs.extend(vertex_dofs(ed.head));
        dofs.push(l.rest_len_offset() + ed.segment);
        energy::stretch(
            self.vertex(ed.tail),
            self.vertex(ed.head),
            self.rest_lengths[ed.segment],
            1.0 / self.segment_edge_count[ed.segment] as f64,
            self.materials[ed.rod].stretch_stiffness,
            dofs,
        )
    }

    fn bend_segments(&self, b: &Bend) -> ([f64; 2], [f64; 2], [usize; 2]) {
        let s = b.edges.map(|e| self.edges[e].segment);
        (
            s.map(|s| self.rest_lengths[s]),
            s.map(|s| 1.0 / self.segment_edge_count[s] as f64),
            s,
        )
    }

    fn bend_stencil(&self, bi: usize) -> Stencil {
        let l = self.layout();
        let b = self.bends[bi];
        let (seg_rest_len, seg_to_edge, segs) = self.bend_segments(&b);
        let mut dofs = Vec::with_capacity(12);
        for v in b.verts {
            dofs.extend(vertex_dofs(v));
        }
        dofs.push(l.rest_len_offset() + segs[0]);
        dofs.push(l.rest_len_offset() + segs[1]);
        dofs.push(l.rest_kappa_offset() + bi);
        let params = BendParams {
            seg_rest_len,
            seg_to_edge,
            rest_kappa: self.rest_kappas[bi],
            stiffness: self.materials[b.rod].bend_stiffness,
        };
        energy::bend(b.verts.map(|v| self.vertex(v)), &params, dofs)
    }

    fn twist_stencil(&self, bi: usize) -> Stencil {
        let l = self.layout();
        let b = self.bends[bi];
        let (seg_rest_len, seg_to_edge, segs) = self.bend_segments(&b);
        let dofs = vec![
            l.theta_offset() + b.edges[0],
            l.theta_offset() + b.edges[1],
            l.rest_len_offset() + segs[0],
            l.rest_len_offset() + segs[1],
        ];
        energy::twist(
            b.edges.map(|e| self.thetas[e]),
            seg_rest_len,
            seg_to_edge,
            self.materials[b.rod].twist_stiffness,
            dofs,
        )
    }

    /// Visit the element stencils of the requested energy type, optionally
    /// restricted to one rod.
    pub fn for_each_stencil(&self, ty: EnergyType, rod: Option<usize>, mut f: impl FnMut(&Stencil)) {
        let keep = |r: usize| rod.map_or(true, |want| want == r);
        if matches!(ty, EnergyType::Full | EnergyType::Stretch) {
            for (e, ed) in self.edges.iter().enumerate() {
                if keep(ed.rod) {
                    f(&self.stretch_stencil(e));
                }
            }
        }
        if matches!(ty, EnergyType::Full | EnergyType::Bend) {
            for (b, bend) in self.bends.iter().enumerate() {
                if keep(bend.rod) {
                    f(&self.bend_stencil(b));
                }
            }
        }
        if matches!(ty, EnergyType::Full | EnergyType::Twist) {
            for (b, bend) in self.bends.iter().enumerate() {
                if keep(bend.rod) {
                    f(&self.twist_stencil(b));
                }
            }
        }
    }

    // ── Assembly ──────────────────────────────────────────

    pub fn energy(&self, ty: EnergyType) -> f64 {
        let mut e = 0.0;
        self.for_each_stencil(ty, None, |st| e += st.value);
        e
    }

    fn dof_limit(&self, variable_design: bool) -> usize {
        let l = self.layout();
        if variable_design { l.num_extended_dof() } else { l.num_dof() }
    }

    pub fn gradient(&self, variable_design: bool) -> Vec<f64> {
        let mut g = vec![0.0; self.dof_limit(variable_design)];
        self.for_each_stencil(EnergyType::Full, None, |st| st.scatter_gradient(&mut g, 1.0));
        g
    }

    pub fn hessian(&self, variable_design: bool) -> TriMat<f64> {
        let n = self.dof_limit(variable_design);
        let mut tri = TriMat::new((n, n));
        self.for_each_stencil(EnergyType::Full, None, |st| st.scatter_hessian(&mut tri, n, 1.0));
        tri
    }

    pub fn apply_hessian(&self, v: &[f64], variable_design: bool) -> ErodResult<Vec<f64>> {
        let n = self.dof_limit(variable_design);
        check_len("hessian-vector operand", n, v.len())?;
        let mut out = vec![0.0; n];
        self.for_each_stencil(EnergyType::Full, None, |st| st.scatter_hessian_product(v, &mut out, 1.0));
        Ok(out)
    }

    /// Gradient of one rod's energy over the extended DoFs.
    pub fn rod_gradient(&self, rod: usize) -> Vec<f64> {
        let mut g = vec![0.0; self.dof_limit(true)];
        self.for_each_stencil(EnergyType::Full, Some(rod), |st| st.scatter_gradient(&mut g, 1.0));
        g
    }

    /// Hessian of one rod's energy applied to an extended-DoF vector.
    pub fn rod_apply_hessian(&self, rod: usize, v: &[f64]) -> ErodResult<Vec<f64>> {
        let n = self.dof_limit(true);
        check_len("hessian-vector operand", n, v.len())?;
        let mut out = vec![0.0; n];
        self.for_each_stencil(EnergyType::Full, Some(rod), |st| st.scatter_hessian_product(v, &mut out, 1.0));
        Ok(out)
    }

    // ── Diagnostics ───────────────────────────────────────

    /// Signed strain of largest magnitude over all edges.
    pub fn max_strain(&self) -> f64 {
        (0..self.edges.len())
            .map(|e| {
                let ed = self.edges[e];
                energy::strain(self.vertex(ed.tail), self.vertex(ed.head), self.edge_rest_length(e))
            })
            .fold(0.0, |best: f64, s| if s.abs() > best.abs() { s } else { best })
    }

    /// Diagonal of the deformed bounding box.
    pub fn characteristic_length(&self) -> f64 {
        let mut lo = [f64::INFINITY; 3];
        let mut hi = [f64::NEG_INFINITY; 3];
        for p in self.positions.chunks_exact(3) {
            for c in 0..3 {
                lo[c] = lo[c].min(p[c]);
                hi[c] = hi[c].max(p[c]);
            }
        }
        let d2: f64 = (0..3).map(|c| (hi[c] - lo[c]).powi(2)).sum();
        d2.sqrt().max(MIN_EDGE_LENGTH)
    }
}

// ─────────────────────────────────────────────────────────────
//  Single rod
// ─────────────────────────────────────────────────────────────

/// An open polyline rod; every edge has its own rest-length variable.
#[derive(Debug, Clone)]
pub struct ElasticRod {
    network: RodNetwork,
}

impl ElasticRod {
    /// `points` is the packed (x, y, z) centerline.
    pub fn new(points: Vec<f64>, material: RodMaterial) -> ErodResult<Self> {
        if points.len() < 6 {
            return Err(ErodError::InvalidInput("a rod needs at least two points".into()));
        }
        let nv = points.len() / 3;
        let network = RodNetwork::new(points, &[(0..nv).collect()], vec![material], SegmentMode::PerEdge)?;
        Ok(Self { network })
    }

    pub fn network(&self) -> &RodNetwork {
        &self.network
    }
    pub fn network_mut(&mut self) -> &mut RodNetwork {
        &mut self.network
    }

    pub fn num_vertices(&self) -> usize {
        self.network.num_vertices()
    }
    pub fn deformed_points(&self) -> &[f64] {
        self.network.positions()
    }
    pub fn rest_lengths(&self) -> &[f64] {
        self.network.rest_lengths()
    }
    pub fn set_rest_lengths(&mut self, rest_lengths: &[f64]) -> ErodResult<()> {
        self.network.set_rest_lengths(rest_lengths)
    }
    pub fn set_rest_kappas(&mut self, rest_kappas: &[f64]) -> ErodResult<()> {
        self.network.set_rest_kappas(rest_kappas)
    }
    pub fn max_strain(&self) -> f64 {
        self.network.max_strain()
    }
}

impl ElasticObject for ElasticRod {
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
