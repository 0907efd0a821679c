//! Equilibrium problems: an elastic object with pinned DoFs, optional
//! external forces and an optional prescribed deployment angle.
//!
//! In deployment mode the average joint angle ā(x) is held at α through the
//! Lagrangian
//!
//!   ℒ(x, λ) = E(x) − fᵀx − λ (ā(x) − α)
//!
//! and λ (the actuation torque) is solved for together with x.

use crate::linkage::RodLinkage;
use crate::newton::{newton, FreeVariables, KktSystem, NewtonProblem};
use crate::types::{
    check_len, ConvergenceReport, ElasticObject, ErodError, ErodResult, FactorizationStrategy,
    LinkageObject, NewtonOptions,
};
use sprs::TriMat;

struct Deployment<O> {
    angle: f64,
    lambda: Option<f64>,
    linkage: fn(&O) -> &RodLinkage,
}

pub struct EquilibriumProblem<'a, O: ElasticObject> {
    object: &'a mut O,
    fixed: Vec<usize>,
    external_forces: Option<Vec<f64>>,
    deployment: Option<Deployment<O>>,
}

/// Validate, deduplicate and add the gauge variables.
fn normalize_fixed_vars<O: ElasticObject>(object: &O, fixed_vars: &[usize]) -> ErodResult<Vec<usize>> {
    let n = object.num_dof();
    if let Some(&bad) = fixed_vars.iter().find(|&&i| i >= n) {
        return Err(ErodError::IndexOutOfRange { what: "fixed variable", index: bad, len: n });
    }
    let mut fixed: Vec<usize> = fixed_vars.iter().copied().chain(object.gauge_vars()).collect();
    fixed.sort_unstable();
    fixed.dedup();
    Ok(fixed)
}

impl<'a, O: ElasticObject> EquilibriumProblem<'a, O> {
    pub fn new(object: &'a mut O, fixed_vars: &[usize]) -> ErodResult<Self> {
        let fixed = normalize_fixed_vars(object, fixed_vars)?;
        Ok(Self { object, fixed, external_forces: None, deployment: None })
    }

    /// Apply constant external forces (one entry per equilibrium DoF).
    pub fn with_external_forces(mut self, forces: Vec<f64>) -> ErodResult<Self> {
        check_len("external forces", self.object.num_dof(), forces.len())?;
        self.external_forces = Some(forces);
        Ok(self)
    }

    /// Warm-start the actuation multiplier (deployment mode only).
    pub fn with_initial_multiplier(mut self, lambda: f64) -> Self {
        if let Some(d) = &mut self.deployment {
            d.lambda = Some(lambda);
        }
        self
    }

    pub fn object(&self) -> &O {
        &*self.object
    }

    pub fn fixed(&self) -> &[usize] {
        &self.fixed
    }

    pub fn deployment_angle(&self) -> Option<f64> {
        self.deployment.as_ref().map(|d| d.angle)
    }

    /// Actuation torque λ after a deployment solve.
    pub fn lambda(&self) -> Option<f64> {
        self.deployment.as_ref().map(|d| d.lambda.unwrap_or(0.0))
    }

    fn deployment_terms(&self) -> ErodResult<Option<(f64, Vec<f64>)>> {
        match &self.deployment {
            None => Ok(None),
            Some(d) => {
                let l = (d.linkage)(&*self.object);
                Ok(Some((l.average_joint_angle()? - d.angle, l.average_joint_angle_gradient()?)))
            }
        }
    }

    /// Run damped Newton from the object's current DoFs.
    pub fn solve(&mut self, opts: &NewtonOptions) -> ErodResult<ConvergenceReport> {
        let needs_estimate = matches!(&self.deployment, Some(d) if d.lambda.is_none());
        if needs_estimate {
            // least-squares multiplier: argmin_λ ‖(g − f − λ a)_free‖
            let free = FreeVariables::new(self.object.num_dof(), &self.fixed);
            let mut g = self.object.gradient(false);
            if let Some(f) = &self.external_forces {
                g.iter_mut().zip(f).for_each(|(gi, fi)| *gi -= fi);
            }
            let lambda = match self.deployment_terms()? {
                Some((_, a)) => {
                    let (gf, af) = (free.restrict(&g), free.restrict(&a));
                    let aa: f64 = af.iter().map(|x| x * x).sum();
                    if aa > 0.0 { gf.iter().zip(&af).map(|(x, y)| x * y).sum::<f64>() / aa } else { 0.0 }
                }
                None => 0.0,
            };
            if let Some(d) = &mut self.deployment {
                d.lambda = Some(lambda);
            }
        }
        newton(self, opts)
    }

    /// Factor the KKT system at the current state for sensitivity solves.
    pub fn factor_kkt(&self) -> ErodResult<Equilibrium> {
        let n = self.object.num_dof();
        let free = FreeVariables::new(n, &self.fixed);
        let h_free = free.restrict_matrix(&NewtonProblem::hessian(self));
        let a_free = self.deployment_terms()?.map(|(_, a)| free.restrict(&a));
        let kkt = KktSystem::new(&h_free, a_free.as_deref(), None, FactorizationStrategy::Ldl)?;
        Ok(Equilibrium { free, kkt, num_dof: n, lambda: self.lambda() })
    }
}

impl<'a, O: LinkageObject> EquilibriumProblem<'a, O> {
    /// Equilibrium with the average joint angle held at `angle`.
    pub fn with_deployment_angle(object: &'a mut O, angle: f64, fixed_vars: &[usize]) -> ErodResult<Self> {
        if !angle.is_finite() {
            return Err(ErodError::InvalidInput("deployment angle must be finite".into()));
        }
        if object.linkage().num_joints() == 0 {
            return Err(ErodError::InvalidInput("deployment requires at least one joint".into()));
        }
        let fixed = normalize_fixed_vars(object, fixed_vars)?;
        Ok(Self {
            object,
            fixed,
            external_forces: None,
            deployment: Some(Deployment { angle, lambda: None, linkage: O::linkage }),
        })
    }
}

impl<'a, O: ElasticObject> NewtonProblem for EquilibriumProblem<'a, O> {
    fn num_vars(&self) -> usize {
        self.object.num_dof()
    }
    fn get_vars(&self) -> Vec<f64> {
        self.object.get_dofs()
    }
    fn set_vars(&mut self, vars: &[f64]) -> ErodResult<()> {
        self.object.set_dofs(vars)
    }
    fn fixed_vars(&self) -> &[usize] {
        &self.fixed
    }

    fn energy(&self) -> f64 {
        let e = self.object.energy();
        match &self.external_forces {
            Some(f) => e - f.iter().zip(self.object.get_dofs()).map(|(fi, xi)| fi * xi).sum::<f64>(),
            None => e,
        }
    }

    fn gradient(&self) -> Vec<f64> {
        let mut g = self.object.gradient(false);
        if let Some(f) = &self.external_forces {
            g.iter_mut().zip(f).for_each(|(gi, fi)| *gi -= fi);
        }
        if let Some(d) = &self.deployment {
            let lambda = d.lambda.unwrap_or(0.0);
            if let Ok(a) = (d.linkage)(&*self.object).average_joint_angle_gradient() {
                g.iter_mut().zip(&a).for_each(|(gi, ai)| *gi -= lambda * ai);
            }
        }
        g
    }

    fn hessian(&self) -> TriMat<f64> {
        let mut h = self.object.hessian(false);
        if let Some(d) = &self.deployment {
            let lambda = d.lambda.unwrap_or(0.0);
            if let Ok(abar) = (d.linkage)(&*self.object).average_joint_angle_hessian() {
                for ((&r, &c), &v) in abar.row_inds().iter().zip(abar.col_inds()).zip(abar.data()) {
                    h.add_triplet(r, c, -lambda * v);
                }
            }
        }
        h
    }

    fn constraint(&self) -> ErodResult<Option<(f64, Vec<f64>)>> {
        self.deployment_terms()
    }
    fn multiplier(&self) -> f64 {
        self.deployment.as_ref().and_then(|d| d.lambda).unwrap_or(0.0)
    }
    fn set_multiplier(&mut self, lambda: f64) {
        if let Some(d) = &mut self.deployment {
            d.lambda = Some(lambda);
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Factored equilibrium
// ─────────────────────────────────────────────────────────────

/// KKT factorization at a solved equilibrium, keyed to the free variables
/// of the problem that produced it.
#[derive(Debug)]
pub struct Equilibrium {
    free: FreeVariables,
    kkt: KktSystem,
    num_dof: usize,
    lambda: Option<f64>,
}

impl Equilibrium {
    pub fn free(&self) -> &FreeVariables {
        &self.free
    }
    pub fn num_dof(&self) -> usize {
        self.num_dof
    }
    /// Actuation multiplier, present in deployment mode.
    pub fn lambda(&self) -> Option<f64> {
        self.lambda
    }
    pub fn is_deployed(&self) -> bool {
        self.kkt.is_bordered()
    }

    /// Solve K [w_x; w_λ] = [b_x; b_λ] with `b_x` over all equilibrium DoFs
    /// (fixed entries ignored).  Returns `w_x` with zeros on fixed DoFs.
    pub fn solve(&self, b_x: &[f64], b_lambda: f64) -> ErodResult<(Vec<f64>, f64)> {
        check_len("KKT right-hand side", self.num_dof, b_x.len())?;
        let (w, wl) = self.kkt.solve(&self.free.restrict(b_x), b_lambda);
        Ok((self.free.extend(&w, self.num_dof), wl))
    }
}

/// Solve for the equilibrium of `object` with the given pins.
pub fn compute_equilibrium<O: ElasticObject>(
    object: &mut O,
    fixed_vars: &[usize],
    opts: &NewtonOptions,
) -> ErodResult<ConvergenceReport> {
    EquilibriumProblem::new(object, fixed_vars)?.solve(opts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rod::{ElasticRod, RodMaterial};

    #[test]
    fn fixed_vars_are_deduplicated_and_include_gauge() {
        let mut rod = ElasticRod::new(vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 2.0, 0.0, 0.0], RodMaterial::default()).unwrap();
        let p = EquilibriumProblem::new(&mut rod, &[2, 0, 2, 1]).unwrap();
        assert_eq!(p.fixed(), &[0, 1, 2, 9]);
    }

    #[test]
    fn out_of_range_fixed_var_is_an_error() {
        let mut rod = ElasticRod::new(vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0], RodMaterial::default()).unwrap();
        let n = rod.num_dof();
        assert!(matches!(
            EquilibriumProblem::new(&mut rod, &[n]),
            Err(ErodError::IndexOutOfRange { .. })
        ));
    }
}
