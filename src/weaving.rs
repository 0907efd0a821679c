//! Weaving optimization: a single woven linkage held near a target surface
//! by an attraction energy instead of a flat/deployed pair.

use crate::fitter::TargetSurfaceFitter;
use crate::linkage::{RodLinkage, SurfaceAttractedLinkage};
use crate::linkage_optimization::{DesignProblem, HessianCoefficients, LinkageOptimization, LinkageOptimizationSettings};
use crate::optimizer::{optimize, OptimizationReport, OptimizeOptions};
use crate::target_surface::TargetSurface;
use crate::types::{ErodResult, LinkageObject, OptEnergyType};
use std::path::Path;

#[derive(Debug)]
pub struct WeavingOptimization {
    inner: LinkageOptimization<SurfaceAttractedLinkage>,
}

impl WeavingOptimization {
    /// Attract `linkage` to `surface` with weight `attraction_weight`; the
    /// same surface is the fitting target of the objective.
    pub fn new(
        linkage: RodLinkage,
        surface: TargetSurface,
        fixed: Vec<usize>,
        attraction_weight: f64,
        settings: LinkageOptimizationSettings,
    ) -> ErodResult<Self> {
        let mut fitter = TargetSurfaceFitter::new(&linkage);
        fitter.set_target_surface(linkage.network().positions(), surface);
        let attracted = SurfaceAttractedLinkage::new(linkage, fitter.clone(), attraction_weight)?;
        let inner = LinkageOptimization::new(attracted, fixed, None, fitter, settings)?;
        Ok(Self { inner })
    }

    pub fn optimization(&self) -> &LinkageOptimization<SurfaceAttractedLinkage> {
        &self.inner
    }
    pub fn optimization_mut(&mut self) -> &mut LinkageOptimization<SurfaceAttractedLinkage> {
        &mut self.inner
    }
    pub fn linkage(&self) -> &SurfaceAttractedLinkage {
        self.inner.object()
    }

    /// Sample the whole centerline (not just the joints) in both the
    /// attraction energy and the fitting objective.
    pub fn set_use_centerline(&mut self, use_centerline: bool) -> ErodResult<bool> {
        self.inner.with_fitter(|f, o| f.set_use_centerline(o.linkage(), use_centerline));
        self.inner.modify_object(|o| {
            o.set_use_centerline(use_centerline);
            Ok(())
        })
    }

    pub fn set_linkage_attraction_weight(&mut self, weight: f64) -> ErodResult<bool> {
        self.inner.modify_object(|o| o.set_attraction_weight(weight))
    }

    pub fn set_hold_closest_points_fixed(&mut self, hold: bool) -> ErodResult<()> {
        self.inner.with_fitter(|f, _| f.set_hold_closest_points_fixed(hold));
        self.inner.modify_object(|o| {
            o.set_hold_closest_points_fixed(hold);
            Ok(())
        })?;
        Ok(())
    }

    pub fn set_target_surface(&mut self, surface: TargetSurface) -> ErodResult<bool> {
        let s = surface.clone();
        self.inner.with_fitter(|f, o| f.set_target_surface(o.linkage().network().positions(), s));
        self.inner.modify_object(|o| {
            o.set_target_surface(surface.clone());
            Ok(())
        })
    }

    pub fn load_target_surface<P: AsRef<Path>>(&mut self, path: P) -> ErodResult<bool> {
        self.set_target_surface(TargetSurface::load_obj(path)?)
    }

    pub fn save_target_surface<P: AsRef<Path>>(&self, path: P) -> ErodResult<()> {
        self.inner.fitter().save_target_surface(path)
    }

    pub fn optimize(&mut self, options: &OptimizeOptions) -> ErodResult<OptimizationReport> {
        optimize(self, options)
    }
}

impl DesignProblem for WeavingOptimization {
    fn num_params(&self) -> usize {
        self.inner.design_variables().len()
    }
    fn params(&self) -> Vec<f64> {
        self.inner.params().to_vec()
    }
    fn new_pt(&mut self, p: &[f64]) -> ErodResult<bool> {
        self.inner.new_pt(p)
    }
    fn j(&mut self, p: &[f64], ty: OptEnergyType) -> ErodResult<f64> {
        self.inner.j(p, ty)
    }
    fn gradp_j(&mut self, p: &[f64], ty: OptEnergyType) -> ErodResult<Vec<f64>> {
        self.inner.gradp_j(p, ty)
    }
    fn apply_hess(&mut self, p: &[f64], dp: &[f64], coeffs: &HessianCoefficients, ty: OptEnergyType) -> ErodResult<Vec<f64>> {
        self.inner.apply_hess(p, dp, coeffs, ty)
    }
    fn commit_linesearch_linkage(&mut self) {
        self.inner.commit_linesearch_linkage()
    }
    fn min_rest_length_indices(&self) -> Vec<usize> {
        self.inner.min_rest_length_indices()
    }
}
