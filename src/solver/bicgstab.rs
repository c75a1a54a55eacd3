//! BiCGstab with mixed-precision reliable updates.
//!
//! The recurrence runs entirely on sloppy-precision vectors with the sloppy
//! operator. Whenever the iterated residual has dropped by `delta` relative
//! to a reference point, the residual is recomputed from the precise
//! operator and the accumulated solution, and (for the larger drops) the
//! sloppy solution is folded into a precise accumulator `y` and restarted
//! from zero. The shadow vector in the inner products stays the original
//! source for the whole solve.

use num_complex::Complex64;

use crate::blas::BlasEngine;
use crate::error::Result;
use crate::field::ColorSpinorField;
use crate::operator::DiracMatrix;
use crate::profile::Phase;

use super::param::{SolverParam, Verbosity};
use super::reliable::{ReliableEvent, ReliableUpdates};
use super::{
    check_fields, check_workspace, workspace_field, Accounting, Convergence, Solver, WorkspaceKey,
};

/// Vectors in the precise precision.
struct Precise {
    /// Solution accumulated at each solution update.
    y: ColorSpinorField,
    /// Residual recomputed at each reliable update.
    r: ColorSpinorField,
    /// Source of the current restart: `b - A y`.
    b_ref: ColorSpinorField,
    /// Sloppy solution promoted for the recomputation.
    x_full: ColorSpinorField,
    tmp: ColorSpinorField,
}

/// Vectors in the sloppy precision.
struct Sloppy {
    r: ColorSpinorField,
    x: ColorSpinorField,
    p: ColorSpinorField,
    v: ColorSpinorField,
    t: ColorSpinorField,
    /// Shadow residual, the original source.
    r0: ColorSpinorField,
    tmp: ColorSpinorField,
}

struct Workspace {
    key: WorkspaceKey,
    precise: Precise,
    sloppy: Sloppy,
}

impl Workspace {
    fn new(b: &ColorSpinorField, param: &SolverParam) -> Self {
        let hi = param.precision;
        let lo = param.precision_sloppy;
        Self {
            key: Self::key(b, param),
            precise: Precise {
                y: workspace_field(b, hi),
                r: workspace_field(b, hi),
                b_ref: workspace_field(b, hi),
                x_full: workspace_field(b, hi),
                tmp: workspace_field(b, hi),
            },
            sloppy: Sloppy {
                r: workspace_field(b, lo),
                x: workspace_field(b, lo),
                p: workspace_field(b, lo),
                v: workspace_field(b, lo),
                t: workspace_field(b, lo),
                r0: workspace_field(b, lo),
                tmp: workspace_field(b, lo),
            },
        }
    }

    fn key(b: &ColorSpinorField, param: &SolverParam) -> WorkspaceKey {
        WorkspaceKey {
            layout: b.layout(),
            precision: param.precision,
            precision_sloppy: param.precision_sloppy,
        }
    }
}

pub struct BiCgStab<'a> {
    param: SolverParam,
    engine: &'a BlasEngine,
    mat: &'a dyn DiracMatrix,
    mat_sloppy: &'a dyn DiracMatrix,
    workspace: Option<Workspace>,
    history: Vec<ReliableEvent>,
}

impl<'a> BiCgStab<'a> {
    pub fn new(
        param: SolverParam,
        engine: &'a BlasEngine,
        mat: &'a dyn DiracMatrix,
        mat_sloppy: &'a dyn DiracMatrix,
    ) -> Self {
        Self {
            param,
            engine,
            mat,
            mat_sloppy,
            workspace: None,
            history: Vec::new(),
        }
    }

    /// Reliable updates fired during the most recent solve.
    pub fn history(&self) -> &[ReliableEvent] {
        &self.history
    }
}

impl Solver for BiCgStab<'_> {
    fn solve(&mut self, x: &mut ColorSpinorField, b: &mut ColorSpinorField) -> Result<Convergence> {
        self.param.validate()?;
        let _span = tracing::debug_span!(
            "bicgstab",
            n = b.length(),
            maxiter = self.param.maxiter,
            delta = self.param.delta
        )
        .entered();
        let blas = self.engine.blas(self.param.reduction_scope);
        let (mat, mat_sloppy) = (self.mat, self.mat_sloppy);
        let mut acct = Accounting::new(self.engine, &self.param);

        acct.start(Phase::Init);
        check_fields(x, b, Some(self.param.precision))?;
        if let Some(ws) = &self.workspace {
            check_workspace(ws.key, Workspace::key(b, &self.param))?;
        }
        let param = &self.param;
        let ws = self.workspace.get_or_insert_with(|| Workspace::new(b, param));
        let Workspace { precise, sloppy, .. } = ws;
        self.history.clear();
        acct.stop(Phase::Init);

        acct.start(Phase::Preamble);
        blas.zero(x)?;
        let b2 = blas.norm2(b)?;
        if b2 == 0.0 {
            acct.stop(Phase::Preamble);
            self.param.true_res = 0.0;
            if self.param.verbose(Verbosity::Verbose) {
                tracing::info!("BiCGstab: source is zero, returning zero solution");
            }
            return Ok(Convergence::Converged);
        }

        blas.copy(&mut precise.b_ref, b)?;
        blas.zero(&mut precise.y)?;
        blas.copy(&mut sloppy.r, b)?;
        blas.copy(&mut sloppy.r0, b)?;
        blas.zero(&mut sloppy.x)?;

        let stop = b2 * self.param.tol * self.param.tol;
        let mut r2 = b2;
        let one = Complex64::new(1.0, 0.0);
        let (mut rho, mut rho0, mut alpha, mut omega) = (one, one, one, one);
        let mut reliable = ReliableUpdates::new(self.param.delta, r2.sqrt());
        acct.reset(&[mat, mat_sloppy]);
        acct.stop(Phase::Preamble);

        acct.start(Phase::Compute);
        let mut k = 0;
        while r2 > stop && k < self.param.maxiter {
            if k == 0 {
                rho = Complex64::new(r2, 0.0);
                blas.copy(&mut sloppy.p, &sloppy.r)?;
            } else {
                let beta = (rho / rho0) * (alpha / omega);
                // p = r - beta omega v + beta p
                blas.cxpaypbz(&sloppy.r, -beta * omega, &sloppy.v, beta, &mut sloppy.p)?;
            }

            mat_sloppy.apply(&mut sloppy.v, &sloppy.p, &mut sloppy.tmp)?;
            let r0v = blas.cdot(&sloppy.r0, &sloppy.v)?;
            alpha = rho / r0v;
            blas.caxpy(-alpha, &sloppy.v, &mut sloppy.r)?;

            mat_sloppy.apply(&mut sloppy.t, &sloppy.r, &mut sloppy.tmp)?;
            let omega_t2 = blas.cdot_norm_a(&sloppy.t, &sloppy.r)?;
            omega = omega_t2.xy() / omega_t2.z;

            // x += alpha p + omega r, r -= omega t, rho = <r0, r>, r2 = |r|^2
            let rho_r2 = blas.caxpbypz_ymbw_cdot_wy_norm_y(
                alpha,
                &sloppy.p,
                omega,
                &mut sloppy.r,
                &mut sloppy.x,
                &sloppy.t,
                &sloppy.r0,
            )?;
            rho0 = rho;
            rho = rho_r2.xy();
            r2 = rho_r2.z;
            k += 1;

            let trigger = reliable.observe(r2.sqrt());
            if trigger.update_r {
                let iterated_r2 = r2;
                blas.copy(&mut precise.x_full, &sloppy.x)?;
                mat.apply(&mut precise.r, &precise.x_full, &mut precise.tmp)?;
                r2 = blas.xmy_norm(&precise.b_ref, &mut precise.r)?;
                blas.copy(&mut sloppy.r, &precise.r)?;
                reliable.residual_updated(r2.sqrt());

                if trigger.update_x {
                    blas.xpy(&precise.x_full, &mut precise.y)?;
                    blas.zero(&mut sloppy.x)?;
                    blas.copy(&mut precise.b_ref, &precise.r)?;
                    reliable.solution_updated(r2.sqrt());
                }

                self.history.push(ReliableEvent {
                    iteration: k,
                    iterated_r2,
                    recomputed_r2: r2,
                    solution_update: trigger.update_x,
                });
                if self.param.verbose(Verbosity::Verbose) {
                    tracing::debug!(
                        iter = k,
                        iterated_r2,
                        recomputed_r2 = r2,
                        update_x = trigger.update_x,
                        "BiCGstab reliable update"
                    );
                }
            }

            if self.param.verbose(Verbosity::DebugVerbose) {
                tracing::debug!(iter = k, r2, "BiCGstab iteration");
            }
        }

        blas.copy(x, &sloppy.x)?;
        blas.xpy(&precise.y, x)?;
        acct.stop(Phase::Compute);

        self.param.gflops += acct.gflops(&[mat, mat_sloppy]);
        self.param.secs += acct.compute_secs();
        self.param.iter += k;
        self.param.residual_updates += reliable.residual_updates();
        self.param.solution_updates += reliable.solution_updates();

        acct.start(Phase::Epilogue);
        let converged = r2 <= stop;
        if !converged && self.param.verbose(Verbosity::Summarize) {
            tracing::warn!(
                maxiter = self.param.maxiter,
                r2,
                stop,
                "BiCGstab: exceeded maximum iterations"
            );
        }
        if self.param.is_preconditioner() {
            self.param.true_res = (r2 / b2).sqrt();
        } else {
            mat.apply(&mut precise.r, x, &mut precise.tmp)?;
            let true_r2 = blas.xmy_norm(b, &mut precise.r)?;
            self.param.true_res = (true_r2 / b2).sqrt();
        }
        acct.stop(Phase::Epilogue);

        if self.param.verbose(Verbosity::Summarize) {
            tracing::info!(
                iterations = k,
                residual_updates = reliable.residual_updates(),
                solution_updates = reliable.solution_updates(),
                true_res = self.param.true_res,
                gflops = self.param.gflops,
                "BiCGstab finished"
            );
        }
        acct.start(Phase::Free);
        acct.stop(Phase::Free);
        acct.finish("bicgstab", &self.param);

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
