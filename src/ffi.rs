//! C-compatible FFI over rods and linkages.
//!
//! All functions are `#[no_mangle] extern "C"`.
//!
//! Memory convention:
//!   - Caller allocates input arrays and passes pointers + lengths.
//!   - Opaque handles (`*mut ElasticRod`, `*mut RodLinkage`) are created by
//!     Rust and freed by Rust via explicit `_free` functions.
//!   - Variable-length outputs (convergence reports, sparse matrices) are
//!     Rust-allocated and returned with their length; release them with
//!     `erod_free_buffer` / `erod_free_index_buffer`.
//!   - Failures return a null handle or a negative status; the message is
//!     kept per thread and read with `erod_last_error`.

use crate::equilibrium::EquilibriumProblem;
use crate::linkage::RodLinkage;
use crate::rod::{ElasticRod, RodMaterial};
use crate::types::{ConvergenceReport, ElasticObject, ErodError, ErodResult, NewtonOptions};
use sprs::CsMat;
use std::cell::RefCell;
use std::os::raw::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::slice;

thread_local! {
    static LAST_ERROR: RefCell<String> = const { RefCell::new(String::new()) };
}

fn set_last_error(msg: String) {
    LAST_ERROR.with(|e| *e.borrow_mut() = msg);
}

/// Run `f`, turning errors and panics into `fallback` plus a stored message.
fn guarded<T>(fallback: T, f: impl FnOnce() -> ErodResult<T>) -> T {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(v)) => v,
        Ok(Err(e)) => {
            set_last_error(e.to_string());
            fallback
        }
        Err(_) => {
            set_last_error("internal error".into());
            fallback
        }
    }
}

unsafe fn input<'a, T>(ptr: *const T, len: usize, what: &'static str) -> ErodResult<&'a [T]> {
    if len == 0 {
        return Ok(&[]);
    }
    if ptr.is_null() {
        return Err(ErodError::InvalidInput(format!("null pointer for {what}")));
    }
    Ok(slice::from_raw_parts(ptr, len))
}

unsafe fn handle<'a, T>(ptr: *const T) -> ErodResult<&'a T> {
    ptr.as_ref().ok_or_else(|| ErodError::InvalidInput("null handle".into()))
}

unsafe fn handle_mut<'a, T>(ptr: *mut T) -> ErodResult<&'a mut T> {
    ptr.as_mut().ok_or_else(|| ErodError::InvalidInput("null handle".into()))
}

fn into_raw_buffer<T>(data: Vec<T>) -> (*mut T, usize) {
    let len = data.len();
    (Box::into_raw(data.into_boxed_slice()) as *mut T, len)
}

/// Copy the last error message (nul-terminated, truncated to `len`).
/// Returns the full message length in bytes.
///
/// # Safety
/// `buf` must be valid for `len` bytes or null.
#[no_mangle]
pub unsafe extern "C" fn erod_last_error(buf: *mut c_char, len: usize) -> usize {
    LAST_ERROR.with(|e| {
        let msg = e.borrow();
        if !buf.is_null() && len > 0 {
            let n = msg.len().min(len - 1);
            let out = slice::from_raw_parts_mut(buf as *mut u8, len);
            out[..n].copy_from_slice(&msg.as_bytes()[..n]);
            out[n] = 0;
        }
        msg.len()
    })
}

/// # Safety
/// `ptr`/`len` must come from an erod function returning an `f64` buffer.
#[no_mangle]
pub unsafe extern "C" fn erod_free_buffer(ptr: *mut f64, len: usize) {
    if !ptr.is_null() {
        drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, len)));
    }
}

/// # Safety
/// `ptr`/`len` must come from an erod function returning an index buffer.
#[no_mangle]
pub unsafe extern "C" fn erod_free_index_buffer(ptr: *mut usize, len: usize) {
    if !ptr.is_null() {
        drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, len)));
    }
}

// ─────────────────────────────────────────────────────────────
//  Options
// ─────────────────────────────────────────────────────────────

/// Newton options as passed over the boundary.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ErodNewtonOptions {
    pub grad_tol: f64,
    pub niter: usize,
    pub beta: f64,
    pub use_identity_metric: bool,
    pub use_negative_curvature_direction: bool,
    pub feasibility_solve: bool,
    pub verbose: bool,
}

impl From<ErodNewtonOptions> for NewtonOptions {
    fn from(o: ErodNewtonOptions) -> Self {
        NewtonOptions {
            grad_tol: o.grad_tol,
            niter: o.niter,
            beta: o.beta,
            use_identity_metric: o.use_identity_metric,
            use_negative_curvature_direction: o.use_negative_curvature_direction,
            feasibility_solve: o.feasibility_solve,
            verbose: o.verbose,
            ..NewtonOptions::default()
        }
    }
}

/// Fill `out` with the default Newton options.
///
/// # Safety
/// `out` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn erod_default_newton_options(out: *mut ErodNewtonOptions) {
    if let Some(o) = out.as_mut() {
        let d = NewtonOptions::default();
        *o = ErodNewtonOptions {
            grad_tol: d.grad_tol,
            niter: d.niter,
            beta: d.beta,
            use_identity_metric: d.use_identity_metric,
            use_negative_curvature_direction: d.use_negative_curvature_direction,
            feasibility_solve: d.feasibility_solve,
            verbose: d.verbose,
        };
    }
}

// ─────────────────────────────────────────────────────────────
//  Construction
// ─────────────────────────────────────────────────────────────

fn material(stretch: f64, bend: f64, twist: f64) -> RodMaterial {
    RodMaterial { stretch_stiffness: stretch, bend_stiffness: bend, twist_stiffness: twist }
}

/// Create a rod through `num_points` points (packed xyz triples).
/// Returns null on malformed input.
///
/// # Safety
/// `points` must be valid for `3 * num_points` values.
#[no_mangle]
pub unsafe extern "C" fn erod_rod_create(
    points: *const f64,
    num_points: usize,
    stretch_stiffness: f64,
    bend_stiffness: f64,
    twist_stiffness: f64,
) -> *mut ElasticRod {
    guarded(std::ptr::null_mut(), || {
        let pts = input(points, 3 * num_points, "rod points")?.to_vec();
        let rod = ElasticRod::new(pts, material(stretch_stiffness, bend_stiffness, twist_stiffness))?;
        Ok(Box::into_raw(Box::new(rod)))
    })
}

/// # Safety
/// `rod` must be null or a pointer returned by `erod_rod_create`.
#[no_mangle]
pub unsafe extern "C" fn erod_rod_free(rod: *mut ElasticRod) {
    if !rod.is_null() {
        drop(Box::from_raw(rod));
    }
}

/// Create a linkage.  Rod `r` visits the vertices
/// `rod_vertices[rod_offsets[r]..rod_offsets[r + 1]]`; every rod shares
/// one material.  Returns null on malformed input.
///
/// # Safety
/// `points` must be valid for `3 * num_points` values, `rod_offsets` for
/// `num_rods + 1` values and `rod_vertices` for `rod_offsets[num_rods]`.
#[no_mangle]
pub unsafe extern "C" fn erod_linkage_create(
    points: *const f64,
    num_points: usize,
    rod_vertices: *const usize,
    rod_offsets: *const usize,
    num_rods: usize,
    stretch_stiffness: f64,
    bend_stiffness: f64,
    twist_stiffness: f64,
) -> *mut RodLinkage {
    guarded(std::ptr::null_mut(), || {
        let pts = input(points, 3 * num_points, "linkage points")?.to_vec();
        let offsets = input(rod_offsets, num_rods + 1, "rod offsets")?;
        let total = offsets.last().copied().unwrap_or(0);
        let verts = input(rod_vertices, total, "rod vertices")?;
        let mut rods = Vec::with_capacity(num_rods);
        for w in offsets.windows(2) {
            if w[0] > w[1] || w[1] > total {
                return Err(ErodError::InvalidInput("rod offsets must be non-decreasing".into()));
            }
            rods.push(verts[w[0]..w[1]].to_vec());
        }
        let materials = vec![material(stretch_stiffness, bend_stiffness, twist_stiffness); num_rods];
        Ok(Box::into_raw(Box::new(RodLinkage::new(pts, &rods, materials)?)))
    })
}

/// # Safety
/// `linkage` must be null or a pointer returned by `erod_linkage_create`.
#[no_mangle]
pub unsafe extern "C" fn erod_linkage_free(linkage: *mut RodLinkage) {
    if !linkage.is_null() {
        drop(Box::from_raw(linkage));
    }
}

// ─────────────────────────────────────────────────────────────
//  DoF access and queries (shared by both handle types)
// ─────────────────────────────────────────────────────────────

unsafe fn num_dofs<O: ElasticObject>(obj: *const O) -> usize {
    guarded(0, || Ok(handle(obj)?.num_dof()))
}

unsafe fn get_dofs<O: ElasticObject>(obj: *const O, out: *mut f64, len: usize) -> i32 {
    guarded(-1, || {
        let o = handle(obj)?;
        let dofs = o.get_dofs();
        if len != dofs.len() || out.is_null() {
            return Err(ErodError::Dimension { what: "dof buffer", expected: dofs.len(), got: len });
        }
        slice::from_raw_parts_mut(out, len).copy_from_slice(&dofs);
        Ok(0)
    })
}

unsafe fn set_dofs<O: ElasticObject>(obj: *mut O, dofs: *const f64, len: usize) -> i32 {
    guarded(-1, || {
        let o = handle_mut(obj)?;
        o.set_dofs(input(dofs, len, "dofs")?)?;
        Ok(0)
    })
}

unsafe fn energy<O: ElasticObject>(obj: *const O) -> f64 {
    guarded(f64::NAN, || Ok(handle(obj)?.energy()))
}

/// Flatten `report` into a Rust-allocated buffer; returns 1 if converged.
unsafe fn emit_report(report: &ConvergenceReport, out: *mut *mut f64, out_len: *mut usize) -> i32 {
    if !out.is_null() && !out_len.is_null() {
        let (ptr, len) = into_raw_buffer(report.flatten());
        *out = ptr;
        *out_len = len;
    }
    i32::from(report.success)
}

unsafe fn options(opts: *const ErodNewtonOptions) -> NewtonOptions {
    opts.as_ref().map(|o| NewtonOptions::from(*o)).unwrap_or_default()
}

/// # Safety
/// Valid handle.
#[no_mangle]
pub unsafe extern "C" fn erod_rod_num_dofs(rod: *const ElasticRod) -> usize {
    num_dofs(rod)
}

/// # Safety
/// Valid handle; `out` valid for `len` values.
#[no_mangle]
pub unsafe extern "C" fn erod_rod_get_dofs(rod: *const ElasticRod, out: *mut f64, len: usize) -> i32 {
    get_dofs(rod, out, len)
}

/// # Safety
/// Valid handle; `dofs` valid for `len` values.
#[no_mangle]
pub unsafe extern "C" fn erod_rod_set_dofs(rod: *mut ElasticRod, dofs: *const f64, len: usize) -> i32 {
    set_dofs(rod, dofs, len)
}

/// # Safety
/// Valid handle.
#[no_mangle]
pub unsafe extern "C" fn erod_rod_energy(rod: *const ElasticRod) -> f64 {
    energy(rod)
}

/// # Safety
/// Valid handle.
#[no_mangle]
pub unsafe extern "C" fn erod_rod_max_strain(rod: *const ElasticRod) -> f64 {
    guarded(f64::NAN, || Ok(handle(rod)?.max_strain()))
}

/// Solve the rod's equilibrium with `fixed` DoFs pinned.
///
/// Returns 1 if converged, 0 if not, −1 on error.  The flattened
/// convergence report is written to `out_report`/`out_len`.
///
/// # Safety
/// Valid handle; `fixed` valid for `num_fixed` values; `opts` null or
/// valid; output pointers null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn erod_rod_newton(
    rod: *mut ElasticRod,
    fixed: *const usize,
    num_fixed: usize,
    opts: *const ErodNewtonOptions,
    out_report: *mut *mut f64,
    out_len: *mut usize,
) -> i32 {
    guarded(-1, || {
        let r = handle_mut(rod)?;
        let fixed = input(fixed, num_fixed, "fixed variables")?;
        let report = EquilibriumProblem::new(r, fixed)?.solve(&options(opts))?;
        Ok(emit_report(&report, out_report, out_len))
    })
}

/// # Safety
/// Valid handle.
#[no_mangle]
pub unsafe extern "C" fn erod_linkage_num_dofs(linkage: *const RodLinkage) -> usize {
    num_dofs(linkage)
}

/// # Safety
/// Valid handle; `out` valid for `len` values.
#[no_mangle]
pub unsafe extern "C" fn erod_linkage_get_dofs(linkage: *const RodLinkage, out: *mut f64, len: usize) -> i32 {
    get_dofs(linkage, out, len)
}

/// # Safety
/// Valid handle; `dofs` valid for `len` values.
#[no_mangle]
pub unsafe extern "C" fn erod_linkage_set_dofs(linkage: *mut RodLinkage, dofs: *const f64, len: usize) -> i32 {
    set_dofs(linkage, dofs, len)
}

/// # Safety
/// Valid handle.
#[no_mangle]
pub unsafe extern "C" fn erod_linkage_energy(linkage: *const RodLinkage) -> f64 {
    energy(linkage)
}

/// # Safety
/// Valid handle.
#[no_mangle]
pub unsafe extern "C" fn erod_linkage_max_strain(linkage: *const RodLinkage) -> f64 {
    guarded(f64::NAN, || Ok(handle(linkage)?.max_strain()))
}

/// # Safety
/// Valid handle.
#[no_mangle]
pub unsafe extern "C" fn erod_linkage_average_joint_angle(linkage: *const RodLinkage) -> f64 {
    guarded(f64::NAN, || handle(linkage)?.average_joint_angle())
}

/// Solve the linkage's equilibrium.  A finite `deployment_angle` holds the
/// average joint angle at that value; `external_forces` may be null or
/// hold one value per DoF.
///
/// Returns 1 if converged, 0 if not, −1 on error.
///
/// # Safety
/// Valid handle; array arguments valid for their lengths; `opts` null or
/// valid; output pointers null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn erod_linkage_newton(
    linkage: *mut RodLinkage,
    fixed: *const usize,
    num_fixed: usize,
    deployment_angle: f64,
    external_forces: *const f64,
    opts: *const ErodNewtonOptions,
    out_report: *mut *mut f64,
    out_len: *mut usize,
) -> i32 {
    guarded(-1, || {
        let l = handle_mut(linkage)?;
        let n = l.num_dof();
        let fixed = input(fixed, num_fixed, "fixed variables")?;
        let forces = if external_forces.is_null() { None } else { Some(input(external_forces, n, "external forces")?.to_vec()) };
        let mut problem = if deployment_angle.is_finite() {
            EquilibriumProblem::with_deployment_angle(l, deployment_angle, fixed)?
        } else {
            EquilibriumProblem::new(l, fixed)?
        };
        if let Some(f) = forces {
            problem = problem.with_external_forces(f)?;
        }
        let report = problem.solve(&options(opts))?;
        Ok(emit_report(&report, out_report, out_len))
    })
}

/// Equilibrium Hessian in compressed-column form (values, row indices,
/// column pointers), each a Rust-allocated buffer.
///
/// # Safety
/// Valid handle; every output pointer valid for writes.
#[no_mangle]
pub unsafe extern "C" fn erod_linkage_hessian(
    linkage: *const RodLinkage,
    out_values: *mut *mut f64,
    out_row_indices: *mut *mut usize,
    out_col_ptrs: *mut *mut usize,
    out_nnz: *mut usize,
    out_dim: *mut usize,
) -> i32 {
    guarded(-1, || {
        let l = handle(linkage)?;
        if out_values.is_null() || out_row_indices.is_null() || out_col_ptrs.is_null() || out_nnz.is_null() || out_dim.is_null() {
            return Err(ErodError::InvalidInput("null output pointer".into()));
        }
        let csc: CsMat<f64> = l.hessian(false).to_csc();
        let (indptr, indices, data) = csc.into_raw_storage();
        *out_nnz = data.len();
        *out_dim = indptr.len() - 1;
        *out_values = into_raw_buffer(data).0;
        *out_row_indices = into_raw_buffer(indices).0;
        *out_col_ptrs = into_raw_buffer(indptr).0;
        Ok(0)
    })
}
