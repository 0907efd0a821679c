//! Adjoint sensitivities of scalar functionals of an equilibrium.
//!
//! The equilibrium state is y = (x_F, λ) (free DoFs plus, in deployment
//! mode, the actuation multiplier), parameterized by q = (d, α): design
//! DoFs d (rest lengths, rest kappas) and optionally the deployment angle α.
//! It satisfies
//!
//!   R(y, q) = [ ∇ₓE(x, d) − λ ∇ā(x) ]_F = 0
//!             [ −(ā(x) − α)          ]
//!
//! with the KKT matrix K = ∂R/∂y = [H_L −a; −aᵀ 0], H_L = H − λ∇²ā.
//! For a functional J(x, d):
//!
//!   1. Adjoint:      K w = [∂J/∂x_F; 0]
//!   2. Gradient:     dJ/dd = ∂J/∂d − H_dF w_x,   dJ/dα = −w_λ
//!   3. Pushforward:  δy = −K⁻¹ [H_Fd δd; δα]
//!   4. Hessian-vector:
//!        K δw = [(∇²J δz)_F; 0] − (δK) w
//!        δ(dJ/dd) = (∇²J δz)_d − H_dF δw_x − w_xᵀ δH_Fd
//!        δ(dJ/dα) = −δw_λ
//!
//! δz = (δx, δd) is the full extended-DoF perturbation.  The third-order
//! contractions (δK) w and w_xᵀ δH_Fd are central differences of the
//! analytic Lagrangian Hessian-vector product along δz.

use crate::equilibrium::Equilibrium;
use crate::types::{check_len, DofLayout, ElasticObject, ErodResult, LinkageObject, HESSIAN_FD_EPS};

/// A scalar function of an object's extended DoFs with analytic first and
/// second derivatives.
pub trait ScalarFunctional<O> {
    fn value(&self, object: &O) -> ErodResult<f64>;
    /// Gradient over the extended DoFs.
    fn grad(&self, object: &O) -> ErodResult<Vec<f64>>;
    /// Extended Hessian applied to `dz`.
    fn delta_grad(&self, object: &O, dz: &[f64]) -> ErodResult<Vec<f64>>;
}

/// Map from a flat parameter vector to the extended DoFs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesignVariables {
    /// Extended-DoF index of each design parameter.
    pub extended: Vec<usize>,
    /// Whether a trailing parameter drives the deployment angle.
    pub angle: bool,
}

impl DesignVariables {
    /// Every rest length and rest kappa.
    pub fn rest_quantities(layout: &DofLayout) -> Self {
        Self { extended: (layout.rest_len_offset()..layout.num_extended_dof()).collect(), angle: false }
    }

    pub fn len(&self) -> usize {
        self.extended.len() + usize::from(self.angle)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Extended-DoF perturbation and angle perturbation of `dp`.
    pub fn scatter(&self, num_extended_dof: usize, dp: &[f64]) -> ErodResult<(Vec<f64>, f64)> {
        check_len("parameter perturbation", self.len(), dp.len())?;
        let mut dz = vec![0.0; num_extended_dof];
        for (&i, &v) in self.extended.iter().zip(dp) {
            dz[i] += v;
        }
        let dalpha = if self.angle { dp[self.extended.len()] } else { 0.0 };
        Ok((dz, dalpha))
    }

    fn gather(&self, z: &[f64], angle_entry: f64) -> Vec<f64> {
        let mut out: Vec<f64> = self.extended.iter().map(|&i| z[i]).collect();
        if self.angle {
            out.push(angle_entry);
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct Adjoint {
    /// Over all equilibrium DoFs, zero on fixed ones.
    pub w_x: Vec<f64>,
    pub w_lambda: f64,
}

impl Adjoint {
    fn extended(&self, num_extended_dof: usize) -> Vec<f64> {
        let mut w = self.w_x.clone();
        w.resize(num_extended_dof, 0.0);
        w
    }
}

/// Linearized equilibrium response to a parameter perturbation.
#[derive(Debug, Clone, Default)]
pub struct Pushforward {
    /// (δx, δd) over the extended DoFs.
    pub delta_z: Vec<f64>,
    pub delta_lambda: f64,
    pub delta_alpha: f64,
}

#[derive(Debug, Clone, Default)]
pub struct HessianVector {
    pub delta_grad: Vec<f64>,
    pub delta_w: Adjoint,
}

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

/// Central difference of `f` along `dz` through the extended DoFs of a
/// copy of `object`.
pub(crate) fn central_difference<O: ElasticObject>(
    object: &O,
    dz: &[f64],
    f: impl Fn(&O) -> ErodResult<Vec<f64>>,
) -> ErodResult<Vec<f64>> {
    check_len("difference direction", object.num_extended_dof(), dz.len())?;
    let scale = dz.iter().map(|v| v * v).sum::<f64>().sqrt();
    if scale == 0.0 {
        return Ok(vec![0.0; f(object)?.len()]);
    }
    let h = HESSIAN_FD_EPS / scale;
    let z = object.get_extended_dofs();
    let mut probe = object.clone();
    let step = |sign: f64| z.iter().zip(dz).map(|(zi, di)| zi + sign * h * di).collect::<Vec<f64>>();
    probe.set_extended_dofs(&step(1.0))?;
    let plus = f(&probe)?;
    probe.set_extended_dofs(&step(-1.0))?;
    let minus = f(&probe)?;
    Ok(plus.iter().zip(&minus).map(|(p, m)| (p - m) / (2.0 * h)).collect())
}

/// (H − λ∇²ā) v over the extended DoFs.
fn lagrangian_apply_hessian<O: LinkageObject>(object: &O, lambda: Option<f64>, v: &[f64]) -> ErodResult<Vec<f64>> {
    let mut hv = object.apply_hessian(v, true)?;
    if let Some(l) = lambda {
        let av = object.linkage().average_joint_angle_apply_hessian(v)?;
        hv.iter_mut().zip(&av).for_each(|(h, a)| *h -= l * a);
    }
    Ok(hv)
}

// ─────────────────────────────────────────────────────────────
//  Adjoint solve and gradient
// ─────────────────────────────────────────────────────────────

/// Solve K w = [∂J/∂x_F; 0] for an extended-DoF objective gradient.
pub fn adjoint_solve(equilibrium: &Equilibrium, j_grad: &[f64]) -> ErodResult<Adjoint> {
    let n = equilibrium.num_dof();
    if j_grad.len() < n {
        check_len("objective gradient", n, j_grad.len())?;
    }
    let (w_x, w_lambda) = equilibrium.solve(&j_grad[..n], 0.0)?;
    Ok(Adjoint { w_x, w_lambda })
}

/// Total derivative of J with respect to the design parameters.
pub fn total_gradient<O: ElasticObject>(
    object: &O,
    vars: &DesignVariables,
    j_grad: &[f64],
    adjoint: &Adjoint,
) -> ErodResult<Vec<f64>> {
    let ne = object.num_extended_dof();
    check_len("objective gradient", ne, j_grad.len())?;
    // H_dF w_x from the d-rows of H [w_x; 0]; ∇²ā has no design rows
    let hw = object.apply_hessian(&adjoint.extended(ne), true)?;
    let implicit: Vec<f64> = j_grad.iter().zip(&hw).map(|(j, h)| j - h).collect();
    Ok(vars.gather(&implicit, -adjoint.w_lambda))
}

/// δy = −K⁻¹ [H_Fd δd; δα].
pub fn pushforward<O: ElasticObject>(
    object: &O,
    equilibrium: &Equilibrium,
    vars: &DesignVariables,
    dp: &[f64],
) -> ErodResult<Pushforward> {
    let n = object.num_dof();
    let ne = object.num_extended_dof();
    let (mut delta_z, delta_alpha) = vars.scatter(ne, dp)?;
    delta_z[..n].iter_mut().for_each(|v| *v = 0.0);
    let hd = object.apply_hessian(&delta_z, true)?;
    let rhs: Vec<f64> = hd[..n].iter().map(|v| -v).collect();
    let (dx, dl) = equilibrium.solve(&rhs, -delta_alpha)?;
    delta_z[..n].copy_from_slice(&dx);
    Ok(Pushforward { delta_z, delta_lambda: dl, delta_alpha })
}

/// Second-order adjoint: the derivative of [`total_gradient`] along the
/// parameter perturbation that produced `push`.
pub fn hessian_vector<O: LinkageObject, F: ScalarFunctional<O>>(
    object: &O,
    equilibrium: &Equilibrium,
    vars: &DesignVariables,
    functional: &F,
    adjoint: &Adjoint,
    push: &Pushforward,
) -> ErodResult<HessianVector> {
    let n = object.num_dof();
    let ne = object.num_extended_dof();
    let lambda = equilibrium.lambda();
    let w_ext = adjoint.extended(ne);

    let j_hvp = functional.delta_grad(object, &push.delta_z)?;
    check_len("objective Hessian-vector product", ne, j_hvp.len())?;

    // D[(H − λ∇²ā) w̃][δz] at fixed λ
    let d_psi = central_difference(object, &push.delta_z, |o| lagrangian_apply_hessian(o, lambda, &w_ext))?;

    let mut rhs_x: Vec<f64> = j_hvp[..n].iter().zip(&d_psi[..n]).map(|(j, d)| j - d).collect();
    let mut rhs_lambda = 0.0;
    if equilibrium.is_deployed() {
        // δλ ∇²ā w_x + w_λ ∇²ā δx, and the border term wₓᵀ ∇²ā δx
        let linkage = object.linkage();
        let a_w = linkage.average_joint_angle_apply_hessian(&adjoint.w_x)?;
        let a_dx = linkage.average_joint_angle_apply_hessian(&push.delta_z[..n])?;
        for i in 0..n {
            rhs_x[i] += push.delta_lambda * a_w[i] + adjoint.w_lambda * a_dx[i];
        }
        rhs_lambda = adjoint.w_x.iter().zip(&a_dx).map(|(w, a)| w * a).sum::<f64>();
    }
    let (dw_x, dw_lambda) = equilibrium.solve(&rhs_x, rhs_lambda)?;
    let delta_w = Adjoint { w_x: dw_x, w_lambda: dw_lambda };

    let h_dw = object.apply_hessian(&delta_w.extended(ne), true)?;
    let dg: Vec<f64> = (0..ne).map(|i| j_hvp[i] - h_dw[i] - d_psi[i]).collect();
    Ok(HessianVector { delta_grad: vars.gather(&dg, -dw_lambda), delta_w })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rod::{ElasticRod, RodMaterial};

    #[test]
    fn central_difference_of_gradient_matches_hessian() {
        let mut rod = ElasticRod::new(
            vec![0.0, 0.0, 0.0, 1.0, 0.2, 0.0, 2.0, 0.1, 0.3, 3.0, -0.2, 0.1],
            RodMaterial::default(),
        )
        .unwrap();
        let mut z = rod.get_extended_dofs();
        for (i, zi) in z.iter_mut().enumerate() {
            *zi += 0.01 * ((i * 7 % 5) as f64 - 2.0);
        }
        rod.set_extended_dofs(&z).unwrap();
        let dz: Vec<f64> = (0..z.len()).map(|i| ((i * 3 % 7) as f64 - 3.0) * 0.1).collect();
        let fd = central_difference(&rod, &dz, |o| Ok(o.gradient(true))).unwrap();
        let hv = rod.apply_hessian(&dz, true).unwrap();
        for (a, b) in fd.iter().zip(&hv) {
            approx::assert_abs_diff_eq!(a, b, epsilon = 1e-4 * (1.0 + b.abs()));
        }
    }

    #[test]
    fn design_variables_scatter_and_gather() {
        let vars = DesignVariables { extended: vec![4, 6], angle: true };
        let (dz, da) = vars.scatter(8, &[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(dz, vec![0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 2.0, 0.0]);
        assert_eq!(da, 3.0);
        assert_eq!(vars.gather(&dz, -1.0), vec![1.0, 2.0, -1.0]);
        assert!(vars.scatter(8, &[1.0]).is_err());
    }
}
