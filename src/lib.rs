//! Mixed-precision Krylov solvers for lattice fields.
//!
//! The crate is layered bottom-up:
//!
//! - [`field`]: color-spinor fields in half, single or double precision.
//! - [`blas`]: fused reduction/update kernels over one or more fields,
//!   dispatched through a registry of supported layouts.
//! - [`solver`]: minimum-residual and BiCGstab solvers, the latter with
//!   reliable updates between a sloppy and a precise precision.
//! - [`inverse`]: batched inversion of small dense complex matrices.

pub mod blas;
pub mod comm;
pub mod error;
pub mod field;
pub mod inverse;
pub mod operator;
pub mod profile;
pub mod solver;

pub use blas::{Blas, BlasEngine};
pub use error::{Result, SolverError};
pub use field::{ColorSpinorField, FieldLayout, FieldParam, Location, Precision};
pub use solver::{Convergence, Solver, SolverParam};
