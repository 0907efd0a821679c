//! **erod**: discrete elastic rods, rod linkages and equilibrium-constrained
//! design optimization with adjoint sensitivities.
//!
//! Pipeline:
//!
//! 1. **Mechanics** (`energy`, `rod`, `linkage`): stretching, bending and
//!    twisting energies of rod networks with analytic gradients/Hessians.
//! 2. **Equilibrium** (`newton`, `equilibrium`): damped Newton with fixed
//!    variables and an optional deployment-angle constraint.
//! 3. **Targets** (`target_surface`, `fitter`): closest-point fitting of
//!    joints / centerlines to a triangle mesh.
//! 4. **Sensitivities** (`objectives`, `gradients`, `linkage_optimization`):
//!    adjoint gradients and Hessian-vector products of design objectives.
//! 5. **Drivers** (`xshell`, `weaving`, `optimizer`): flat/deployed pairs,
//!    surface-attracted weaves, and the augmented-Lagrangian outer loop
//!    over `argmin`.
//! 6. **FFI** (`ffi`): C-compatible API.

pub mod types;
pub mod energy;
pub mod rod;
pub mod linkage;
pub mod target_surface;
pub mod fitter;
pub mod newton;
pub mod equilibrium;
pub mod objectives;
pub mod gradients;
pub mod linkage_optimization;
pub mod xshell;
pub mod weaving;
pub mod optimizer;
pub mod ffi;
