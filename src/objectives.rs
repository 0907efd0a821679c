//! Design-objective terms and their weighted sum.
//!
//! Every term is a scalar function of the extended DoF vector
//! z = [x | θ | L_seg | κ̄] of one elastic object, exposing its value, its
//! gradient over z, and its Hessian applied to a direction dz.  The
//! adjoint machinery in `gradients.rs` turns these partial derivatives into
//! total derivatives through the equilibrium.

use crate::energy::vertex_dofs;
use crate::fitter::TargetSurfaceFitter;
use crate::gradients::central_difference;
use crate::types::{check_len, ErodError, ErodResult, LinkageObject, OptEnergyType};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// What a term sees: the (equilibrated) object and the fitter whose
/// closest points match the object's current positions.
pub struct EvalContext<'a, O> {
    pub object: &'a O,
    pub fitter: &'a TargetSurfaceFitter,
}

impl<'a, O> Clone for EvalContext<'a, O> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<'a, O> Copy for EvalContext<'a, O> {}

pub trait ObjectiveTerm<O: LinkageObject>: Debug {
    fn value(&self, ctx: EvalContext<'_, O>) -> ErodResult<f64>;
    /// Gradient over the extended DoFs.
    fn grad(&self, ctx: EvalContext<'_, O>) -> ErodResult<Vec<f64>>;
    /// Hessian over the extended DoFs applied to `dz`.
    fn delta_grad(&self, ctx: EvalContext<'_, O>, dz: &[f64]) -> ErodResult<Vec<f64>>;
}

// ─────────────────────────────────────────────────────────────
//  Configuration
// ─────────────────────────────────────────────────────────────

/// Weights of the standard design objective.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectiveWeights {
    /// Elastic energy (normalized by the initial energy).
    pub gamma: f64,
    /// Target fitting (normalized by the squared characteristic length).
    pub beta: f64,
    pub smoothing_weight: f64,
    /// Total rest length (normalized by its initial value).
    pub rl_regularization_weight: f64,
    pub contact_force_weight: f64,
}

impl Default for ObjectiveWeights {
    fn default() -> Self {
        Self {
            gamma: 1.0,
            beta: 1.0,
            smoothing_weight: 0.0,
            rl_regularization_weight: 0.0,
            contact_force_weight: 0.0,
        }
    }
}

/// Component weights of the joint contact-force penalty.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactForceWeights {
    pub normal: f64,
    pub tangential: f64,
    pub torque: f64,
    pub boundary_normal: f64,
    pub boundary_tangential: f64,
    pub boundary_torque: f64,
    /// Normal forces below this value are not penalized.
    pub normal_activation_threshold: f64,
}

impl Default for ContactForceWeights {
    fn default() -> Self {
        Self {
            normal: 1.0,
            tangential: 1.0,
            torque: 1.0,
            boundary_normal: 1.0,
            boundary_tangential: 1.0,
            boundary_torque: 1.0,
            normal_activation_threshold: 0.0,
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Elastic energy
// ─────────────────────────────────────────────────────────────

/// The object's total energy.
///
/// With `use_envelope_theorem` the equilibrium-DoF rows of the gradient and
/// of the Hessian product are dropped: at an equilibrium (with the
/// deployment angle held fixed) they contribute nothing to the total
/// derivative, so the adjoint solve becomes trivial.
#[derive(Debug, Clone)]
pub struct ElasticEnergyObjective {
    pub use_envelope_theorem: bool,
}

impl ElasticEnergyObjective {
    pub fn new(use_envelope_theorem: bool) -> Self {
        Self { use_envelope_theorem }
    }

    fn strip<O: LinkageObject>(&self, obj: &O, mut v: Vec<f64>) -> Vec<f64> {
        if self.use_envelope_theorem {
            v[..obj.num_dof()].iter_mut().for_each(|x| *x = 0.0);
        }
        v
    }
}

impl<O: LinkageObject> ObjectiveTerm<O> for ElasticEnergyObjective {
    fn value(&self, ctx: EvalContext<'_, O>) -> ErodResult<f64> {
        Ok(ctx.object.energy())
    }
    fn grad(&self, ctx: EvalContext<'_, O>) -> ErodResult<Vec<f64>> {
        Ok(self.strip(ctx.object, ctx.object.gradient(true)))
    }
    fn delta_grad(&self, ctx: EvalContext<'_, O>, dz: &[f64]) -> ErodResult<Vec<f64>> {
        let hv = ctx.object.apply_hessian(dz, true)?;
        Ok(self.strip(ctx.object, hv))
    }
}

// ─────────────────────────────────────────────────────────────
//  Target fitting
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct TargetFittingObjective;

impl<O: LinkageObject> ObjectiveTerm<O> for TargetFittingObjective {
    fn value(&self, ctx: EvalContext<'_, O>) -> ErodResult<f64> {
        Ok(ctx.fitter.objective(ctx.object.linkage().network().positions()))
    }
    fn grad(&self, ctx: EvalContext<'_, O>) -> ErodResult<Vec<f64>> {
        let mut g = vec![0.0; ctx.object.num_extended_dof()];
        let gx = ctx.fitter.gradient(ctx.object.linkage().network().positions());
        g[..gx.len()].copy_from_slice(&gx);
        Ok(g)
    }
    fn delta_grad(&self, ctx: EvalContext<'_, O>, dz: &[f64]) -> ErodResult<Vec<f64>> {
        check_len("objective direction", ctx.object.num_extended_dof(), dz.len())?;
        ctx.fitter.apply_hessian(dz)
    }
}

// ─────────────────────────────────────────────────────────────
//  Rest-quantity regularization
// ─────────────────────────────────────────────────────────────

/// ½ Σ (κ̄_{i−1} − 2 κ̄_i + κ̄_{i+1})² over consecutive bends of each rod.
#[derive(Debug, Clone, Default)]
pub struct RestCurvatureSmoothing;

impl RestCurvatureSmoothing {
    /// Stencils (three extended-DoF indices) of every second difference.
    fn stencils<O: LinkageObject>(obj: &O) -> Vec<[usize; 3]> {
        let net = obj.linkage().network();
        let off = net.layout().rest_kappa_offset();
        net.rods()
            .iter()
            .flat_map(|r| r.bends.windows(3).map(move |w| [off + w[0], off + w[1], off + w[2]]))
            .collect()
    }

    fn apply<O: LinkageObject>(obj: &O, z: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; obj.num_extended_dof()];
        for s in Self::stencils(obj) {
            let d = z[s[0]] - 2.0 * z[s[1]] + z[s[2]];
            out[s[0]] += d;
            out[s[1]] -= 2.0 * d;
            out[s[2]] += d;
        }
        out
    }
}

impl<O: LinkageObject> ObjectiveTerm<O> for RestCurvatureSmoothing {
    fn value(&self, ctx: EvalContext<'_, O>) -> ErodResult<f64> {
        let z = ctx.object.get_extended_dofs();
        Ok(Self::stencils(ctx.object)
            .iter()
            .map(|s| 0.5 * (z[s[0]] - 2.0 * z[s[1]] + z[s[2]]).powi(2))
            .sum())
    }
    fn grad(&self, ctx: EvalContext<'_, O>) -> ErodResult<Vec<f64>> {
        Ok(Self::apply(ctx.object, &ctx.object.get_extended_dofs()))
    }
    fn delta_grad(&self, ctx: EvalContext<'_, O>, dz: &[f64]) -> ErodResult<Vec<f64>> {
        check_len("objective direction", ctx.object.num_extended_dof(), dz.len())?;
        Ok(Self::apply(ctx.object, dz))
    }
}

/// Σ segment rest lengths.
#[derive(Debug, Clone, Default)]
pub struct RestLengthMinimization;

impl<O: LinkageObject> ObjectiveTerm<O> for RestLengthMinimization {
    fn value(&self, ctx: EvalContext<'_, O>) -> ErodResult<f64> {
        Ok(ctx.object.linkage().network().rest_lengths().iter().sum())
    }
    fn grad(&self, ctx: EvalContext<'_, O>) -> ErodResult<Vec<f64>> {
        let l = ctx.object.layout();
        let mut g = vec![0.0; l.num_extended_dof()];
        g[l.rest_len_offset()..l.rest_kappa_offset()].iter_mut().for_each(|x| *x = 1.0);
        Ok(g)
    }
    fn delta_grad(&self, ctx: EvalContext<'_, O>, dz: &[f64]) -> ErodResult<Vec<f64>> {
        check_len("objective direction", ctx.object.num_extended_dof(), dz.len())?;
        Ok(vec![0.0; dz.len()])
    }
}

// ─────────────────────────────────────────────────────────────
//  Joint contact forces
// ─────────────────────────────────────────────────────────────

/// Penalty on the generalized forces transmitted through the joints:
///
///   J = Σ_j ½ w_n max(0, f_n − f̄)² + ½ w_t ‖f_t‖² + ½ w_τ τ²
///
/// f is rod A's force on the joint, split along the joint normal
/// n = tA × tB / ‖tA × tB‖; τ is rod A's torque about its joint edge.
#[derive(Debug, Clone, Default)]
pub struct ContactForceObjective {
    pub weights: ContactForceWeights,
}

struct JointTerms {
    value: f64,
    /// ∂J/∂f
    d_force: Vector3<f64>,
    /// ∂J/∂τ
    d_torque: f64,
    /// ∂J/∂tA, ∂J/∂tB through the normal
    d_ta: Vector3<f64>,
    d_tb: Vector3<f64>,
}

impl ContactForceObjective {
    pub fn new(weights: ContactForceWeights) -> Self {
        Self { weights }
    }

    fn joint_terms(&self, f: Vector3<f64>, torque: f64, ta: &Vector3<f64>, tb: &Vector3<f64>, boundary: bool) -> JointTerms {
        let w = &self.weights;
        let (wn, wt, wtau) = if boundary {
            (w.boundary_normal, w.boundary_tangential, w.boundary_torque)
        } else {
            (w.normal, w.tangential, w.torque)
        };
        let m = ta.cross(tb);
        let mn = m.norm();
        let n = if mn > 1e-12 { m / mn } else { Vector3::zeros() };
        let fnorm = f.dot(&n);
        let active = (fnorm - w.normal_activation_threshold).max(0.0);
        let ft = f - n * fnorm;
        let value = 0.5 * wn * active * active + 0.5 * wt * ft.norm_squared() + 0.5 * wtau * torque * torque;

        let d_force = n * (wn * active) + ft * wt;
        let (d_ta, d_tb) = if mn > 1e-12 {
            let d_n = f * (wn * active - wt * fnorm);
            let q = (Matrix3::identity() - n * n.transpose()) * d_n / mn;
            (tb.cross(&q), q.cross(ta))
        } else {
            (Vector3::zeros(), Vector3::zeros())
        };
        JointTerms { value, d_force, d_torque: wtau * torque, d_ta, d_tb }
    }

    fn evaluate<O: LinkageObject>(&self, obj: &O, with_grad: bool) -> ErodResult<(f64, Vec<f64>)> {
        let linkage = obj.linkage();
        let net = linkage.network();
        let layout = net.layout();
        let n = layout.num_extended_dof();
        let mut value = 0.0;
        let mut grad = vec![0.0; if with_grad { n } else { 0 }];
        for (j, joint) in linkage.joints().iter().enumerate() {
            let (f, torque) = linkage.joint_forces(j);
            let (ta, tb) = linkage.joint_tangents(j);
            let t = self.joint_terms(f, torque, &ta.t, &tb.t, joint.boundary);
            value += t.value;
            if !with_grad {
                continue;
            }
            // through the forces: Hᴬ u with u = (∂J/∂f, ∂J/∂τ) placed on the joint DoFs
            let mut u = vec![0.0; n];
            for (c, i) in vertex_dofs(joint.vertex).into_iter().enumerate() {
                u[i] = t.d_force[c];
            }
            u[layout.theta_offset() + joint.edge_a] = t.d_torque;
            let hu = net.rod_apply_hessian(joint.rod_a, &u)?;
            grad.iter_mut().zip(&hu).for_each(|(g, h)| *g += h);

            // through the normal
            for (edge, tan, d_t) in [(joint.edge_a, &ta, t.d_ta), (joint.edge_b, &tb, t.d_tb)] {
                let d_e = tan.jac * d_t;
                let ed = net.edges()[edge];
                for (c, (it, ih)) in vertex_dofs(ed.tail).into_iter().zip(vertex_dofs(ed.head)).enumerate() {
                    grad[it] -= d_e[c];
                    grad[ih] += d_e[c];
                }
            }
        }
        Ok((value, grad))
    }
}

impl<O: LinkageObject> ObjectiveTerm<O> for ContactForceObjective {
    fn value(&self, ctx: EvalContext<'_, O>) -> ErodResult<f64> {
        self.evaluate(ctx.object, false).map(|(v, _)| v)
    }
    fn grad(&self, ctx: EvalContext<'_, O>) -> ErodResult<Vec<f64>> {
        self.evaluate(ctx.object, true).map(|(_, g)| g)
    }
    fn delta_grad(&self, ctx: EvalContext<'_, O>, dz: &[f64]) -> ErodResult<Vec<f64>> {
        check_len("objective direction", ctx.object.num_extended_dof(), dz.len())?;
        central_difference(ctx.object, dz, |o| self.evaluate(o, true).map(|(_, g)| g))
    }
}

// ─────────────────────────────────────────────────────────────
//  Weighted collection
// ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct TermRecord<O: LinkageObject> {
    name: String,
    ty: OptEnergyType,
    weight: f64,
    term: Box<dyn ObjectiveTerm<O>>,
}

/// Named, weighted sum of objective terms.
#[derive(Debug)]
pub struct DesignOptimizationObjective<O: LinkageObject> {
    terms: Vec<TermRecord<O>>,
}

impl<O: LinkageObject> Default for DesignOptimizationObjective<O> {
    fn default() -> Self {
        Self { terms: Vec::new() }
    }
}

impl<O: LinkageObject> DesignOptimizationObjective<O> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        name: &str,
        ty: OptEnergyType,
        term: impl ObjectiveTerm<O> + 'static,
        weight: f64,
    ) -> ErodResult<()> {
        if self.terms.iter().any(|t| t.name == name) {
            return Err(ErodError::InvalidInput(format!("objective term '{name}' already exists")));
        }
        self.terms.push(TermRecord { name: name.to_string(), ty, weight, term: Box::new(term) });
        Ok(())
    }

    pub fn names(&self) -> Vec<&str> {
        self.terms.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn weight(&self, name: &str) -> Option<f64> {
        self.terms.iter().find(|t| t.name == name).map(|t| t.weight)
    }

    pub fn set_weight(&mut self, name: &str, weight: f64) -> ErodResult<()> {
        let t = self
            .terms
            .iter_mut()
            .find(|t| t.name == name)
            .ok_or_else(|| ErodError::InvalidInput(format!("no objective term '{name}'")))?;
        t.weight = weight;
        Ok(())
    }

    fn selected(&self, ty: OptEnergyType) -> impl Iterator<Item = &TermRecord<O>> {
        self.terms.iter().filter(move |t| ty.selects(t.ty) && t.weight != 0.0)
    }

    pub fn value(&self, ctx: EvalContext<'_, O>, ty: OptEnergyType) -> ErodResult<f64> {
        self.selected(ty).map(|t| t.term.value(ctx).map(|v| t.weight * v)).sum()
    }

    pub fn grad(&self, ctx: EvalContext<'_, O>, ty: OptEnergyType) -> ErodResult<Vec<f64>> {
        let mut g = vec![0.0; ctx.object.num_extended_dof()];
        for t in self.selected(ty) {
            let tg = t.term.grad(ctx)?;
            g.iter_mut().zip(&tg).for_each(|(gi, ti)| *gi += t.weight * ti);
        }
        Ok(g)
    }

    pub fn delta_grad(&self, ctx: EvalContext<'_, O>, dz: &[f64], ty: OptEnergyType) -> ErodResult<Vec<f64>> {
        let mut out = vec![0.0; ctx.object.num_extended_dof()];
        for t in self.selected(ty) {
            let tv = t.term.delta_grad(ctx, dz)?;
            out.iter_mut().zip(&tv).for_each(|(o, v)| *o += t.weight * v);
        }
        Ok(out)
    }

    /// Unweighted value of every term.
    pub fn values(&self, ctx: EvalContext<'_, O>) -> ErodResult<Vec<(String, f64)>> {
        self.terms.iter().map(|t| t.term.value(ctx).map(|v| (t.name.clone(), v))).collect()
    }

    pub fn weighted_values(&self, ctx: EvalContext<'_, O>) -> ErodResult<Vec<(String, f64)>> {
        self.terms.iter().map(|t| t.term.value(ctx).map(|v| (t.name.clone(), t.weight * v))).collect()
    }
}
