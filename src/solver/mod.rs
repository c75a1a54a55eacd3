//! Krylov solvers over lattice fields.
//!
//! A solver borrows the kernel engine and the operator(s), allocates its
//! workspace on the first call and reuses it afterwards. Reaching the
//! iteration limit is not an error: `solve` returns
//! `Convergence::MaxIterReached` with the best solution found.

pub mod bicgstab;
pub mod mr;
pub mod param;
pub mod reliable;

pub use bicgstab::BiCgStab;
pub use mr::Mr;
pub use param::{InverterType, PreserveSource, SolverParam, SolverRole, Verbosity};
pub use reliable::{ReliableEvent, ReliableUpdates, UpdateTrigger};

use crate::blas::BlasEngine;
use crate::comm::ReduceScope;
use crate::error::{Result, SolverError};
use crate::field::{ColorSpinorField, FieldCreate, FieldLayout, FieldParam, Location, Precision};
use crate::operator::DiracMatrix;
use crate::profile::{Phase, TimeProfile};

/// Outcome of a solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    Converged,
    MaxIterReached,
}

/// An iterative solver for `A x = b`.
pub trait Solver {
    /// Solve into `x`. `b` is left intact unless the parameters allow the
    /// source to be overwritten.
    fn solve(&mut self, x: &mut ColorSpinorField, b: &mut ColorSpinorField) -> Result<Convergence>;

    fn param(&self) -> &SolverParam;

    fn param_mut(&mut self) -> &mut SolverParam;
}

/// Build the solver selected by `param.inv_type`.
///
/// `mat` is the precise operator; `mat_sloppy` is applied every iteration
/// by solvers that distinguish the two. MR uses `mat` only.
pub fn create<'a>(
    param: SolverParam,
    engine: &'a BlasEngine,
    mat: &'a dyn DiracMatrix,
    mat_sloppy: &'a dyn DiracMatrix,
) -> Result<Box<dyn Solver + 'a>> {
    param.validate()?;
    Ok(match param.inv_type {
        InverterType::Mr => Box::new(Mr::new(param, engine, mat)),
        InverterType::BiCgStab => Box::new(BiCgStab::new(param, engine, mat, mat_sloppy)),
    })
}

/// Allocate a workspace field shaped like `like` in `precision`. Its
/// contents are always written before they are read.
pub(crate) fn workspace_field(like: &ColorSpinorField, precision: Precision) -> ColorSpinorField {
    ColorSpinorField::new(
        &FieldParam::like(like)
            .with_precision(precision)
            .with_location(Location::Device)
            .with_create(FieldCreate::Null),
    )
}

/// Shape and precisions a solver workspace was allocated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WorkspaceKey {
    pub(crate) layout: FieldLayout,
    pub(crate) precision: Precision,
    pub(crate) precision_sloppy: Precision,
}

/// Workspace is sized on the first call; later calls must match it.
pub(crate) fn check_workspace(allocated: WorkspaceKey, wanted: WorkspaceKey) -> Result<()> {
    if allocated.layout != wanted.layout {
        return Err(SolverError::Shape(format!(
            "solver workspace was allocated for {:?}, called with {:?}",
            allocated.layout, wanted.layout
        )));
    }
    if allocated != wanted {
        return Err(SolverError::Config(format!(
            "solver workspace was allocated for {:?}/{:?} precision, now asked for {:?}/{:?}",
            allocated.precision,
            allocated.precision_sloppy,
            wanted.precision,
            wanted.precision_sloppy
        )));
    }
    Ok(())
}

/// Reject a solution/source pair the solver cannot run on, before
/// anything is written to `x`. `precision` is the precision the solver
/// was configured for, if it fixes one.
pub(crate) fn check_fields(
    x: &ColorSpinorField,
    b: &ColorSpinorField,
    precision: Option<Precision>,
) -> Result<()> {
    if x.layout() != b.layout() {
        return Err(SolverError::Shape(format!(
            "solution layout {:?} differs from source layout {:?}",
            x.layout(),
            b.layout()
        )));
    }
    if x.location() != Location::Device || b.location() != Location::Device {
        return Err(SolverError::Location(
            "solver fields must be device fields".into(),
        ));
    }
    if x.precision() != b.precision() {
        return Err(SolverError::Config(format!(
            "solution precision {:?} differs from source precision {:?}",
            x.precision(),
            b.precision()
        )));
    }
    match precision {
        Some(p) if p != b.precision() => Err(SolverError::Config(format!(
            "fields are {:?} but the solver runs in {:?} precision",
            b.precision(),
            p
        ))),
        _ => Ok(()),
    }
}

/// Timers and flop counters for one solve.
///
/// An outer solve owns the shared counters: it zeroes them when the compute
/// phase begins and reads them when it ends. A solve running as a
/// preconditioner does neither, so whatever it does is counted once by the
/// enclosing solve.
pub(crate) struct Accounting<'a> {
    engine: &'a BlasEngine,
    outer: bool,
    scope: ReduceScope,
    profile: TimeProfile,
}

impl<'a> Accounting<'a> {
    pub(crate) fn new(engine: &'a BlasEngine, param: &SolverParam) -> Self {
        Self {
            engine,
            outer: !param.is_preconditioner(),
            scope: param.reduction_scope,
            profile: TimeProfile::new(),
        }
    }

    pub(crate) fn start(&mut self, phase: Phase) {
        if self.outer {
            self.profile.start(phase);
        }
    }

    pub(crate) fn stop(&mut self, phase: Phase) {
        if self.outer {
            self.profile.stop(phase);
        }
    }

    /// Zero the engine counters and drain the operators' counts.
    pub(crate) fn reset(&self, mats: &[&dyn DiracMatrix]) {
        if self.outer {
            self.engine.reset_counters();
            for mat in mats {
                mat.flops();
            }
        }
    }

    /// Gflops since `reset`, kernels and operators together, summed over
    /// ranks for a global solve. Zero for a preconditioner.
    pub(crate) fn gflops(&self, mats: &[&dyn DiracMatrix]) -> f64 {
        if !self.outer {
            return 0.0;
        }
        let flops = self.engine.flops() + mats.iter().map(|m| m.flops()).sum::<u64>();
        let gflops = flops as f64 * 1e-9;
        match self.scope {
            ReduceScope::Global => self.engine.comm().all_reduce_sum(gflops),
            ReduceScope::Local => gflops,
        }
    }

    /// Seconds spent in the compute phase, on the slowest rank for a
    /// global solve.
    pub(crate) fn compute_secs(&self) -> f64 {
        let secs = self.profile.last(Phase::Compute).as_secs_f64();
        match self.scope {
            ReduceScope::Global => self.engine.comm().all_reduce_max(secs),
            ReduceScope::Local => secs,
        }
    }

    pub(crate) fn finish(&self, solver: &'static str, param: &SolverParam) {
        if self.outer && param.verbose(Verbosity::DebugVerbose) && self.engine.comm().rank() == 0 {
            self.profile.log_summary(solver);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::DenseOperator;
    use approx::assert_relative_eq;

    #[test]
    fn create_validates_and_dispatches() {
        let engine = BlasEngine::new();
        let a = DenseOperator::identity(3);
        let bad = SolverParam {
            tol: -1.0,
            ..SolverParam::new(InverterType::Mr)
        };
        assert!(matches!(
            create(bad, &engine, &a, &a).map(|_| ()),
            Err(SolverError::Config(_))
        ));

        let preconditioned = SolverParam {
            inv_type_precondition: Some(InverterType::Mr),
            ..SolverParam::new(InverterType::BiCgStab)
        };
        assert!(matches!(
            create(preconditioned, &engine, &a, &a).map(|_| ()),
            Err(SolverError::Config(_))
        ));

        let s = create(SolverParam::new(InverterType::BiCgStab), &engine, &a, &a).unwrap();
        assert_eq!(s.param().inv_type, InverterType::BiCgStab);
    }

    #[test]
    fn workspace_key_and_fields_are_checked() {
        let f = ColorSpinorField::new(&FieldParam::new(
            FieldLayout::new(2, 1, 3),
            Precision::Double,
            Location::Device,
        ));
        let key = WorkspaceKey {
            layout: f.layout(),
            precision: Precision::Double,
            precision_sloppy: Precision::Half,
        };
        assert!(check_workspace(key, key).is_ok());
        let wider = WorkspaceKey {
            layout: FieldLayout::new(3, 1, 3),
            ..key
        };
        assert!(matches!(check_workspace(key, wider), Err(SolverError::Shape(_))));
        let single = WorkspaceKey {
            precision_sloppy: Precision::Single,
            ..key
        };
        assert!(matches!(check_workspace(key, single), Err(SolverError::Config(_))));

        assert!(check_fields(&f, &f, Some(Precision::Double)).is_ok());
        assert!(matches!(
            check_fields(&f, &f, Some(Precision::Single)),
            Err(SolverError::Config(_))
        ));
        let host = f.to_location(Location::Host);
        assert!(matches!(check_fields(&host, &f, None), Err(SolverError::Location(_))));

        let w = workspace_field(&host, Precision::Half);
        assert_eq!(w.precision(), Precision::Half);
        assert_eq!(w.location(), Location::Device);
        assert_eq!(w.layout(), f.layout());
    }

    #[test]
    fn preconditioner_accounting_leaves_counters_alone() {
        let engine = BlasEngine::new();
        engine.add_flops(1_000);
        let inner = SolverParam::default().preconditioner(InverterType::Mr);
        let acct = Accounting::new(&engine, &inner);
        acct.reset(&[]);
        assert_eq!(engine.flops(), 1_000);
        assert_eq!(acct.gflops(&[]), 0.0);

        let outer = Accounting::new(&engine, &SolverParam::default());
        assert_relative_eq!(outer.gflops(&[]), 1e-6, max_relative = 1e-12);
        outer.reset(&[]);
        assert_eq!(engine.flops(), 0);
    }
}
