//! Minimal-residual solver.
//!
//! Each iteration picks the step `alpha = <Ar, r> / |Ar|^2` that minimises
//! the next residual along `r`, then updates solution and residual in one
//! fused pass. The residual is normalised to unit norm before iterating and
//! the solution rescaled afterwards, which keeps squared norms in range when
//! the fields are stored in reduced precision.

use crate::blas::BlasEngine;
use crate::error::Result;
use crate::field::ColorSpinorField;
use crate::operator::DiracMatrix;
use crate::profile::Phase;

use super::param::{PreserveSource, SolverParam, Verbosity};
use super::{
    check_fields, check_workspace, workspace_field, Accounting, Convergence, Solver, WorkspaceKey,
};

struct Workspace {
    key: WorkspaceKey,
    r: ColorSpinorField,
    ar: ColorSpinorField,
    tmp: ColorSpinorField,
}

impl Workspace {
    fn new(b: &ColorSpinorField) -> Self {
        Self {
            key: Self::key(b),
            r: workspace_field(b, b.precision()),
            ar: workspace_field(b, b.precision()),
            tmp: workspace_field(b, b.precision()),
        }
    }

    fn key(b: &ColorSpinorField) -> WorkspaceKey {
        WorkspaceKey {
            layout: b.layout(),
            precision: b.precision(),
            precision_sloppy: b.precision(),
        }
    }
}

pub struct Mr<'a> {
    param: SolverParam,
    engine: &'a BlasEngine,
    mat: &'a dyn DiracMatrix,
    workspace: Option<Workspace>,
}

impl<'a> Mr<'a> {
    pub fn new(param: SolverParam, engine: &'a BlasEngine, mat: &'a dyn DiracMatrix) -> Self {
        Self {
            param,
            engine,
            mat,
            workspace: None,
        }
    }
}

impl Solver for Mr<'_> {
    fn solve(&mut self, x: &mut ColorSpinorField, b: &mut ColorSpinorField) -> Result<Convergence> {
        self.param.validate()?;
        let _span =
            tracing::debug_span!("mr", n = b.length(), maxiter = self.param.maxiter).entered();
        let blas = self.engine.blas(self.param.reduction_scope);
        let mat = self.mat;
        let mut acct = Accounting::new(self.engine, &self.param);

        acct.start(Phase::Init);
        check_fields(x, b, None)?;
        if let Some(ws) = &self.workspace {
            check_workspace(ws.key, Workspace::key(b))?;
        }
        let ws = self.workspace.get_or_insert_with(|| Workspace::new(b));
        acct.stop(Phase::Init);

        acct.start(Phase::Preamble);
        blas.zero(x)?;
        let b2 = blas.norm2(b)?;
        if b2 == 0.0 {
            acct.stop(Phase::Preamble);
            self.param.true_res = 0.0;
            if self.param.verbose(Verbosity::Verbose) {
                tracing::info!("MR: source is zero, returning zero solution");
            }
            return Ok(Convergence::Converged);
        }

        let preserve = self.param.preserve_source;
        let r: &mut ColorSpinorField = match preserve {
            PreserveSource::Yes => {
                blas.copy(&mut ws.r, b)?;
                &mut ws.r
            }
            PreserveSource::No => &mut *b,
        };
        let b_norm = b2.sqrt();
        blas.ax(1.0 / b_norm, r)?;

        let stop = self.param.tol * self.param.tol;
        let omega = self.param.omega;
        let mut r2 = 1.0;
        acct.reset(&[mat]);
        acct.stop(Phase::Preamble);

        acct.start(Phase::Compute);
        let mut k = 0;
        while k < self.param.maxiter && r2 > stop {
            mat.apply(&mut ws.ar, r, &mut ws.tmp)?;
            let ar3 = blas.cdot_norm_a(&ws.ar, r)?;
            let alpha = ar3.xy() / ar3.z;
            r2 = blas.caxpy_xmaz_norm_x(alpha * omega, r, x, &ws.ar)?;
            k += 1;
            if self.param.verbose(Verbosity::DebugVerbose) {
                tracing::debug!(iter = k, r2, "MR iteration");
            }
        }
        acct.stop(Phase::Compute);
        self.param.gflops += acct.gflops(&[mat]);
        self.param.secs += acct.compute_secs();
        self.param.iter += k;

        acct.start(Phase::Epilogue);
        blas.ax(b_norm, x)?;
        let converged = r2 <= stop;
        if !converged && self.param.verbose(Verbosity::Summarize) {
            tracing::warn!(maxiter = self.param.maxiter, r2, "MR: exceeded maximum iterations");
        }

        match preserve {
            PreserveSource::No => {
                // The source now holds the final residual at its original scale.
                blas.ax(b_norm, r)?;
                self.param.true_res = r2.sqrt();
            }
            PreserveSource::Yes if !self.param.is_preconditioner() => {
                mat.apply(&mut ws.ar, x, &mut ws.tmp)?;
                let true_r2 = blas.xmy_norm(b, &mut ws.ar)?;
                self.param.true_res = (true_r2 / b2).sqrt();
            }
            PreserveSource::Yes => self.param.true_res = r2.sqrt(),
        }
        acct.stop(Phase::Epilogue);

        if self.param.verbose(Verbosity::Summarize) {
            tracing::info!(
                iterations = k,
                r2,
                true_res = self.param.true_res,
                gflops = self.param.gflops,
                "MR finished"
            );
        }
        acct.start(Phase::Free);
        acct.stop(Phase::Free);
        acct.finish("mr", &self.param);

        Ok(if converged {
            Convergence::Converged
        } else {
            Convergence::MaxIterReached
        })
    }

    fn param(&self) -> &SolverParam {
        &self.param
    }

    fn param_mut(&mut self) -> &mut SolverParam {
        &mut self.param
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ReduceScope;
    use crate::error::SolverError;
    use crate::field::{FieldLayout, FieldParam, Location, Precision};
    use crate::operator::DenseOperator;
    use crate::solver::InverterType;
    use approx::assert_abs_diff_eq;
    use num_complex::Complex64;

    fn vec3() -> FieldLayout {
        FieldLayout::new(1, 1, 3)
    }

    fn source(values: &[f64]) -> ColorSpinorField {
        let v: Vec<Complex64> = values.iter().map(|&a| Complex64::new(a, 0.0)).collect();
        ColorSpinorField::from_complex(vec3(), Precision::Double, Location::Device, &v).unwrap()
    }

    fn spd3() -> DenseOperator {
        DenseOperator::from_real(3, &[4.0, 1.0, 0.0, 1.0, 4.0, 1.0, 0.0, 1.0, 4.0]).unwrap()
    }

    fn param() -> SolverParam {
        SolverParam {
            tol: 1e-10,
            maxiter: 50,
            verbosity: Verbosity::Silent,
            ..SolverParam::new(InverterType::Mr)
        }
    }

    #[test]
    fn identity_converges_in_one_step() {
        let engine = BlasEngine::new();
        let a = DenseOperator::identity(3);
        let mut b = source(&[1.0, -2.0, 0.5]);
        let mut x = ColorSpinorField::new(&FieldParam::like(&b));
        let mut mr = Mr::new(param(), &engine, &a);
        assert_eq!(mr.solve(&mut x, &mut b).unwrap(), Convergence::Converged);
        assert_eq!(mr.param().iter, 1);
        assert!(mr.param().true_res < 1e-15);
        for (xi, bi) in x.to_complex().iter().zip(b.to_complex()) {
            assert_abs_diff_eq!(xi.re, bi.re, epsilon = 1e-15);
        }
    }

    #[test]
    fn relaxation_scales_first_step() {
        let engine = BlasEngine::new();
        let a = DenseOperator::identity(3);
        let mut b = source(&[1.0, 2.0, 3.0]);
        let mut x = ColorSpinorField::new(&FieldParam::like(&b));
        let p = SolverParam {
            omega: 0.5,
            maxiter: 1,
            ..param()
        };
        let mut mr = Mr::new(p, &engine, &a);
        assert_eq!(mr.solve(&mut x, &mut b).unwrap(), Convergence::MaxIterReached);
        for (xi, bi) in x.to_complex().iter().zip(b.to_complex()) {
            assert_abs_diff_eq!(xi.re, 0.5 * bi.re, epsilon = 1e-15);
        }
        assert_abs_diff_eq!(mr.param().true_res, 0.5, epsilon = 1e-15);
    }

    #[test]
    fn unpreserved_source_holds_final_residual() {
        let engine = BlasEngine::new();
        let a = spd3();
        let mut b = source(&[1.0, 0.0, 0.0]);
        let mut x = ColorSpinorField::new(&FieldParam::like(&b));
        let p = SolverParam {
            maxiter: 3,
            preserve_source: PreserveSource::No,
            ..param()
        };
        let mut mr = Mr::new(p, &engine, &a);
        mr.solve(&mut x, &mut b).unwrap();
        let ax = a.mul_vec(&x.to_complex());
        let r = b.to_complex();
        let expect = [1.0 - ax[0].re, -ax[1].re, -ax[2].re];
        for (ri, ei) in r.iter().zip(expect) {
            assert_abs_diff_eq!(ri.re, ei, epsilon = 1e-12);
        }
        let r_norm: f64 = r.iter().map(|z| z.norm_sqr()).sum::<f64>().sqrt();
        assert_abs_diff_eq!(mr.param().true_res, r_norm, epsilon = 1e-12);
    }

    #[test]
    fn preconditioner_role_reports_iterated_residual() {
        let engine = BlasEngine::new();
        let a = spd3();
        let mut b = source(&[1.0, 0.0, 0.0]);
        let mut x = ColorSpinorField::new(&FieldParam::like(&b));
        let p = SolverParam {
            maxiter: 4,
            ..param()
        }
        .preconditioner(InverterType::Mr);
        let mut mr = Mr::new(p, &engine, &a);
        mr.solve(&mut x, &mut b).unwrap();
        assert_eq!(mr.param().reduction_scope, ReduceScope::Local);
        assert_eq!(mr.param().gflops, 0.0);
        assert_eq!(mr.param().iter, 4);
        // Four operator applications; no extra true-residual apply.
        assert_eq!(a.applications(), 4);
        assert!(mr.param().true_res > 0.0);
    }

    #[test]
    fn workspace_shape_fixed_after_first_call() {
        let engine = BlasEngine::new();
        let a = DenseOperator::identity(3);
        let mut b = source(&[1.0, 0.0, 0.0]);
        let mut x = ColorSpinorField::new(&FieldParam::like(&b));
        let mut mr = Mr::new(param(), &engine, &a);
        mr.solve(&mut x, &mut b).unwrap();

        let layout = FieldLayout::new(2, 1, 3);
        let p = FieldParam::new(layout, Precision::Double, Location::Device);
        let mut b6 = ColorSpinorField::new(&p);
        let mut x6 = ColorSpinorField::new(&p);
        assert!(mr.solve(&mut x6, &mut b6).is_err());
    }

    #[test]
    fn mismatched_fields_rejected_before_touching_x() {
        let engine = BlasEngine::new();
        let a = DenseOperator::identity(3);
        let mut b = source(&[1.0, 0.0, 0.0]);
        let mut x = ColorSpinorField::from_complex(
            vec3(),
            Precision::Single,
            Location::Device,
            &[Complex64::new(7.0, 0.0); 3],
        )
        .unwrap();
        let mut mr = Mr::new(param(), &engine, &a);
        assert!(matches!(mr.solve(&mut x, &mut b), Err(SolverError::Config(_))));
        assert!(x.to_complex().iter().all(|z| z.re == 7.0));
        assert_eq!(a.applications(), 0);

        let mut host_x = x.to_location(Location::Host);
        assert!(matches!(mr.solve(&mut host_x, &mut b), Err(SolverError::Location(_))));

        // The first good call fixes the workspace precision.
        let mut x = ColorSpinorField::new(&FieldParam::like(&b));
        mr.solve(&mut x, &mut b).unwrap();
        let values = b.to_complex();
        let mut b_single =
            ColorSpinorField::from_complex(vec3(), Precision::Single, Location::Device, &values)
                .unwrap();
        let mut x_single = ColorSpinorField::new(&FieldParam::like(&b_single));
        assert!(matches!(
            mr.solve(&mut x_single, &mut b_single),
            Err(SolverError::Config(_))
        ));
    }
}
