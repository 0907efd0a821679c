//! Element kernels of the discrete elastic-rod energy.
//!
//! Every kernel returns a [`Stencil`]: the element value together with its
//! dense local gradient and Hessian over a short list of global DoF
//! indices.  Kernels are written in *edge space* first (derivatives with
//! respect to edge vectors e = x_head − x_tail and a few scalar design
//! variables) and then mapped to vertex positions through the local
//! incidence.
//!
//! Unit-tangent calculus used throughout (t = e/l, P = I − t tᵀ):
//!
//!   ∂t/∂e = P / l
//!   Σ_k g_k ∂²t_k/∂e∂e = −(1/l²) [ t (Pg)ᵀ + (Pg) tᵀ + (t·g) P ]
//!
//! All derivatives are closed form; no automatic differentiation.

use crate::types::MIN_EDGE_LENGTH;
use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use sprs::TriMat;

// ─────────────────────────────────────────────────────────────
//  Local stencil
// ─────────────────────────────────────────────────────────────

/// Value, gradient and Hessian of one element over its local DoFs.
///
/// `dofs` may contain repeated indices (e.g. a joint vertex shared by two
/// edges); scattering accumulates, which is exactly the chain rule.
#[derive(Debug, Clone)]
pub struct Stencil {
    pub dofs: Vec<usize>,
    pub value: f64,
    pub grad: DVector<f64>,
    pub hess: DMatrix<f64>,
}

impl Stencil {
    pub fn zeros(dofs: Vec<usize>) -> Self {
        let n = dofs.len();
        Self { dofs, value: 0.0, grad: DVector::zeros(n), hess: DMatrix::zeros(n, n) }
    }

    /// `out[dof] += scale · grad`, skipping DoFs beyond `out.len()`.
    pub fn scatter_gradient(&self, out: &mut [f64], scale: f64) {
        for (a, &i) in self.dofs.iter().enumerate() {
            if i < out.len() {
                out[i] += scale * self.grad[a];
            }
        }
    }

    /// Append Hessian triplets for DoFs below `limit`.
    pub fn scatter_hessian(&self, tri: &mut TriMat<f64>, limit: usize, scale: f64) {
        for (a, &i) in self.dofs.iter().enumerate() {
            if i >= limit {
                continue;
            }
            for (b, &j) in self.dofs.iter().enumerate() {
                if j >= limit {
                    continue;
                }
                let h = self.hess[(a, b)];
                if h != 0.0 {
                    tri.add_triplet(i, j, scale * h);
                }
            }
        }
    }

    /// `out += scale · H v` restricted to DoFs below `out.len()`.
    pub fn scatter_hessian_product(&self, v: &[f64], out: &mut [f64], scale: f64) {
        let limit = out.len().min(v.len());
        for (a, &i) in self.dofs.iter().enumerate() {
            if i >= limit {
                continue;
            }
            let mut acc = 0.0;
            for (b, &j) in self.dofs.iter().enumerate() {
                if j < limit {
                    acc += self.hess[(a, b)] * v[j];
                }
            }
            out[i] += scale * acc;
        }
    }
}

/// Global position DoFs of vertex `v`.
#[inline]
pub fn vertex_dofs(v: usize) -> [usize; 3] {
    [3 * v, 3 * v + 1, 3 * v + 2]
}

#[inline]
pub fn vertex_position(x: &[f64], v: usize) -> Vector3<f64> {
    Vector3::new(x[3 * v], x[3 * v + 1], x[3 * v + 2])
}

// ─────────────────────────────────────────────────────────────
//  Unit tangent helpers
// ─────────────────────────────────────────────────────────────

/// Unit tangent of an edge vector with its length and projector.
#[derive(Debug, Clone, Copy)]
pub struct Tangent {
    pub t: Vector3<f64>,
    pub len: f64,
    /// P / l  (the Jacobian ∂t/∂e)
    pub jac: Matrix3<f64>,
    pub proj: Matrix3<f64>,
}

impl Tangent {
    pub fn new(e: Vector3<f64>) -> Self {
        let len = e.norm().max(MIN_EDGE_LENGTH);
        let t = e / len;
        let proj = Matrix3::identity() - t * t.transpose();
        Self { t, len, jac: proj / len, proj }
    }

    /// Σ_k g_k ∂²t_k/∂e∂e
    pub fn second_derivative_contraction(&self, g: &Vector3<f64>) -> Matrix3<f64> {
        let pg = self.proj * g;
        let m = self.t * pg.transpose() + pg * self.t.transpose() + self.proj * self.t.dot(g);
        -m / (self.len * self.len)
    }
}

// ─────────────────────────────────────────────────────────────
//  Edge-space form  →  vertex-space stencil
// ─────────────────────────────────────────────────────────────

/// Derivatives of an element with respect to its edge vectors and scalar
/// variables, before mapping to vertex positions.
struct EdgeForm {
    /// (tail slot, head slot) of each local edge
    edge_verts: Vec<(usize, usize)>,
    num_verts: usize,
    g_e: Vec<Vector3<f64>>,
    h_ee: Vec<Vec<Matrix3<f64>>>,
    g_s: Vec<f64>,
    h_ss: DMatrix<f64>,
    /// h_es[k][s] = ∂²E / ∂e_k ∂s
    h_es: Vec<Vec<Vector3<f64>>>,
}

impl EdgeForm {
    fn new(edge_verts: Vec<(usize, usize)>, num_verts: usize, num_scalars: usize) -> Self {
        let ne = edge_verts.len();
        Self {
            edge_verts,
            num_verts,
            g_e: vec![Vector3::zeros(); ne],
            h_ee: vec![vec![Matrix3::zeros(); ne]; ne],
            g_s: vec![0.0; num_scalars],
            h_ss: DMatrix::zeros(num_scalars, num_scalars),
            h_es: vec![vec![Vector3::zeros(); num_scalars]; ne],
        }
    }

    /// Signed incidence of vertex slot `v` in edge `k`.
    fn incidence(&self, k: usize, v: usize) -> f64 {
        let (tail, head) = self.edge_verts[k];
        let mut b = 0.0;
        if head == v {
            b += 1.0;
        }
        if tail == v {
            b -= 1.0;
        }
        b
    }

    /// `dofs` = 3 position DoFs per vertex slot followed by one per scalar.
    fn into_stencil(self, value: f64, dofs: Vec<usize>) -> Stencil {
        let nv = self.num_verts;
        let ns = self.g_s.len();
        debug_assert_eq!(dofs.len(), 3 * nv + ns);
        let mut st = Stencil::zeros(dofs);
        st.value = value;
        let ne = self.edge_verts.len();

        for v in 0..nv {
            for k in 0..ne {
                let bkv = self.incidence(k, v);
                if bkv == 0.0 {
                    continue;
                }
                for c in 0..3 {
                    st.grad[3 * v + c] += bkv * self.g_e[k][c];
                }
                for w in 0..nv {
                    for l in 0..ne {
                        let blw = self.incidence(l, w);
                        if blw == 0.0 {
                            continue;
                        }
                        let blk = &self.h_ee[k][l];
                        for r in 0..3 {
                            for c in 0..3 {
                                st.hess[(3 * v + r, 3 * w + c)] += bkv * blw * blk[(r, c)];
                            }
                        }
                    }
                }
                for s in 0..ns {
                    for r in 0..3 {
                        let h = bkv * self.h_es[k][s][r];
                        st.hess[(3 * v + r, 3 * nv + s)] += h;
                        st.hess[(3 * nv + s, 3 * v + r)] += h;
                    }
                }
            }
        }
        for s in 0..ns {
            st.grad[3 * nv + s] = self.g_s[s];
            for u in 0..ns {
                st.hess[(3 * nv + s, 3 * nv + u)] = self.h_ss[(s, u)];
            }
        }
        st
    }
}

// ─────────────────────────────────────────────────────────────
//  Stretching
// ─────────────────────────────────────────────────────────────

/// Stretching energy of one edge, E = ½ k (l − L)² / L, with the edge rest
/// length L = c · L_seg driven by a segment rest-length variable.
///
/// Local DoFs: `[x_tail (3), x_head (3), L_seg]`.
pub fn stretch(
    x_tail: Vector3<f64>,
    x_head: Vector3<f64>,
    seg_rest_len: f64,
    seg_to_edge: f64,
    k: f64,
    dofs: Vec<usize>,
) -> Stencil {
    let tan = Tangent::new(x_head - x_tail);
    let l = tan.len;
    let rl = seg_to_edge * seg_rest_len;
    let c = seg_to_edge;
    let value = 0.5 * k * (l - rl) * (l - rl) / rl;

    let mut form = EdgeForm::new(vec![(0, 1)], 2, 1);
    form.g_e[0] = tan.t * (k * (l - rl) / rl);
    form.h_ee[0][0] = tan.t * tan.t.transpose() * (k / rl) + tan.proj * (k * (l - rl) / (rl * l));
    form.g_s[0] = c * 0.5 * k * (1.0 - l * l / (rl * rl));
    form.h_ss[(0, 0)] = c * c * k * l * l / (rl * rl * rl);
    form.h_es[0][0] = tan.t * (-c * k * l / (rl * rl));
    form.into_stencil(value, dofs)
}

/// Signed strain l / L − 1 of an edge.
pub fn strain(x_tail: Vector3<f64>, x_head: Vector3<f64>, rest_len: f64) -> f64 {
    (x_head - x_tail).norm() / rest_len - 1.0
}

// ─────────────────────────────────────────────────────────────
//  Bending
// ─────────────────────────────────────────────────────────────

/// Rest quantities and stiffness of one bending element.
#[derive(Debug, Clone, Copy)]
pub struct BendParams {
    pub seg_rest_len: [f64; 2],
    pub seg_to_edge: [f64; 2],
    pub rest_kappa: f64,
    pub stiffness: f64,
}

/// Bending energy at an interior rod vertex:
///
///   κ = |t1 − t0|,   l̄ = (L0 + L1) / 2,   E = k (κ − κ̄)² / (2 l̄)
///
/// Local DoFs: `[x0 (3), x1 (3), x2 (3), L_seg0, L_seg1, κ̄]`.
pub fn bend(x: [Vector3<f64>; 3], p: &BendParams, dofs: Vec<usize>) -> Stencil {
    let k = p.stiffness;
    let ta = Tangent::new(x[1] - x[0]);
    let tb = Tangent::new(x[2] - x[1]);
    let d = tb.t - ta.t;
    let nd = d.norm();
    let lbar = 0.5 * (p.seg_to_edge[0] * p.seg_rest_len[0] + p.seg_to_edge[1] * p.seg_rest_len[1]);
    let diff = nd - p.rest_kappa;
    let value = 0.5 * k * diff * diff / lbar;
    let kl = k / lbar;

    // Derivatives with respect to d = t1 − t0
    let (dhat, g_d, h_d) = if nd > 1e-12 {
        let dhat = d / nd;
        let ddt = dhat * dhat.transpose();
        let h = ((Matrix3::identity() - ddt) * (diff / nd) + ddt) * kl;
        (dhat, dhat * (kl * diff), h)
    } else {
        (Vector3::zeros(), d * kl, Matrix3::identity() * kl)
    };

    let mut form = EdgeForm::new(vec![(0, 1), (1, 2)], 3, 3);
    form.g_e[0] = -(ta.jac * g_d);
    form.g_e[1] = tb.jac * g_d;
    form.h_ee[0][0] = ta.jac * h_d * ta.jac - ta.second_derivative_contraction(&g_d);
    form.h_ee[1][1] = tb.jac * h_d * tb.jac + tb.second_derivative_contraction(&g_d);
    form.h_ee[0][1] = -(ta.jac * h_d * tb.jac);
    form.h_ee[1][0] = form.h_ee[0][1].transpose();

    // Scalars in l̄ and κ̄ first, then chained to the segment variables.
    let de_dl = -value / lbar;
    let de_dk = -kl * diff;
    let h_ll = 2.0 * value / (lbar * lbar);
    let h_kk = kl;
    let h_lk = k * diff / (lbar * lbar);
    let h_dl = -g_d / lbar;
    let h_dk = -dhat * kl;
    let dl = [0.5 * p.seg_to_edge[0], 0.5 * p.seg_to_edge[1]];

    for s in 0..2 {
        form.g_s[s] = dl[s] * de_dl;
        for u in 0..2 {
            form.h_ss[(s, u)] = dl[s] * dl[u] * h_ll;
        }
        form.h_ss[(s, 2)] = dl[s] * h_lk;
        form.h_ss[(2, s)] = dl[s] * h_lk;
        form.h_es[0][s] = -(ta.jac * h_dl) * dl[s];
        form.h_es[1][s] = (tb.jac * h_dl) * dl[s];
    }
    form.g_s[2] = de_dk;
    form.h_ss[(2, 2)] = h_kk;
    form.h_es[0][2] = -(ta.jac * h_dk);
    form.h_es[1][2] = tb.jac * h_dk;
    form.into_stencil(value, dofs)
}

/// Curvature measure κ = |t1 − t0| at an interior vertex.
pub fn curvature(x: [Vector3<f64>; 3]) -> f64 {
    let t0 = Tangent::new(x[1] - x[0]).t;
    let t1 = Tangent::new(x[2] - x[1]).t;
    (t1 - t0).norm()
}

// ─────────────────────────────────────────────────────────────
//  Twisting
// ─────────────────────────────────────────────────────────────

/// Twisting energy E = k (θ1 − θ0)² / (2 l̄).
///
/// Local DoFs: `[θ0, θ1, L_seg0, L_seg1]`.
pub fn twist(theta: [f64; 2], seg_rest_len: [f64; 2], seg_to_edge: [f64; 2], k: f64, dofs: Vec<usize>) -> Stencil {
    let lbar = 0.5 * (seg_to_edge[0] * seg_rest_len[0] + seg_to_edge[1] * seg_rest_len[1]);
    let delta = theta[1] - theta[0];
    let value = 0.5 * k * delta * delta / lbar;
    let dl = [0.5 * seg_to_edge[0], 0.5 * seg_to_edge[1]];

    let mut st = Stencil::zeros(dofs);
    st.value = value;
    let g = k * delta / lbar;
    st.grad[0] = -g;
    st.grad[1] = g;
    st.hess[(0, 0)] = k / lbar;
    st.hess[(1, 1)] = k / lbar;
    st.hess[(0, 1)] = -k / lbar;
    st.hess[(1, 0)] = -k / lbar;
    let h_tl = k * delta / (lbar * lbar);
    for s in 0..2 {
        st.grad[2 + s] = -dl[s] * value / lbar;
        st.hess[(0, 2 + s)] = dl[s] * h_tl;
        st.hess[(2 + s, 0)] = dl[s] * h_tl;
        st.hess[(1, 2 + s)] = -dl[s] * h_tl;
        st.hess[(2 + s, 1)] = -dl[s] * h_tl;
        for u in 0..2 {
            st.hess[(2 + s, 2 + u)] = dl[s] * dl[u] * 2.0 * value / (lbar * lbar);
        }
    }
    st
}

// ─────────────────────────────────────────────────────────────
//  Joint angle
// ─────────────────────────────────────────────────────────────

/// Opening angle between two edges, α = atan2(|tA × tB|, tA · tB).
///
/// `verts` holds the four edge endpoints `[a_tail, a_head, b_tail, b_head]`
/// (the joint vertex appears twice).  Local DoFs: 3 per endpoint.
pub fn joint_angle(verts: [Vector3<f64>; 4], dofs: Vec<usize>) -> Stencil {
    let ta = Tangent::new(verts[1] - verts[0]);
    let tb = Tangent::new(verts[3] - verts[2]);
    let c = ta.t.dot(&tb.t);
    let s = ta.t.cross(&tb.t).norm().max(1e-12);
    let value = s.atan2(c);

    // dα = −dc / s,  d²α = −d²c / s − (c / s³) dc dcᵀ
    let dc_a = ta.jac * tb.t;
    let dc_b = tb.jac * ta.t;
    let s3 = s * s * s;

    let mut form = EdgeForm::new(vec![(0, 1), (2, 3)], 4, 0);
    form.g_e[0] = -dc_a / s;
    form.g_e[1] = -dc_b / s;
    form.h_ee[0][0] = -ta.second_derivative_contraction(&tb.t) / s - dc_a * dc_a.transpose() * (c / s3);
    form.h_ee[1][1] = -tb.second_derivative_contraction(&ta.t) / s - dc_b * dc_b.transpose() * (c / s3);
    form.h_ee[0][1] = -(ta.jac * tb.jac) / s - dc_a * dc_b.transpose() * (c / s3);
    form.h_ee[1][0] = form.h_ee[0][1].transpose();
    form.into_stencil(value, dofs)
}
