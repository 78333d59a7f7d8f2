use tch::Tensor;

use super::{effective_order, History, Solver, SolverError, StepContext};
use crate::denoiser::ThresholdFn;

pub const MAX_ORDER: usize = 3;

#[derive(Debug, Clone)]
pub struct DpmPpSolverConfig {
    /// Maximum order of the solver, `1..=3`.
    pub max_order: usize,
    /// Whether the multistep history holds data-space estimates
    /// (`predict_x0`) or noise-space estimates.
    pub predict_x0: bool,
    /// Whether to drop to lower orders over the final steps, which
    /// stabilizes the tail of short schedules.
    pub lower_order_final: bool,
    /// Optional clamp applied to data-space estimates before they enter
    /// the update and the history, e.g.
    /// [`dynamic_threshold`](crate::denoiser::dynamic_threshold). Only
    /// meaningful with `predict_x0`.
    pub threshold: Option<ThresholdFn>,
}

impl Default for DpmPpSolverConfig {
    fn default() -> Self {
        Self { max_order: 3, predict_x0: true, lower_order_final: true, threshold: None }
    }
}

/// Multistep DPM-Solver++ (https://arxiv.org/abs/2211.01095): an
/// exponential integrator that solves the linear part of the ODE in closed
/// form and extrapolates the denoiser output from past estimates. One
/// denoiser evaluation per step.
pub struct DpmPpSolver {
    config: DpmPpSolverConfig,
    history: History,
}

impl DpmPpSolver {
    pub fn new(config: DpmPpSolverConfig) -> Result<Self, SolverError> {
        if config.max_order < 1 || config.max_order > MAX_ORDER {
            return Err(SolverError::UnsupportedOrder { order: config.max_order, max: MAX_ORDER });
        }
        let history = History::new(config.max_order);
        Ok(Self { config, history })
    }

    fn first_order(&self, ctx: &StepContext<'_>, x: &Tensor) -> Tensor {
        let (s0, t) = (ctx.t_cur(), ctx.t_next());
        let h = (s0 / t).ln();
        let (m0, _) = self.history.recent(0);
        if self.config.predict_x0 {
            (t / s0) * x - (-h).exp_m1() * m0
        } else {
            x - t * h.exp_m1() * m0
        }
    }

    fn second_order(&self, ctx: &StepContext<'_>, x: &Tensor) -> Tensor {
        let (s0, t) = (ctx.t_cur(), ctx.t_next());
        let (m0, _) = self.history.recent(0);
        let (m1, s1) = self.history.recent(1);
        let h = (s0 / t).ln();
        let r0 = (s1 / s0).ln() / h;
        let d1_0 = (1. / r0) * (m0 - m1);
        if self.config.predict_x0 {
            let phi_1 = (-h).exp_m1();
            (t / s0) * x - phi_1 * m0 - 0.5 * phi_1 * &d1_0
        } else {
            let phi_1 = h.exp_m1();
            x - t * phi_1 * m0 - 0.5 * t * phi_1 * &d1_0
        }
    }

    fn third_order(&self, ctx: &StepContext<'_>, x: &Tensor) -> Tensor {
        let (s0, t) = (ctx.t_cur(), ctx.t_next());
        let (m0, _) = self.history.recent(0);
        let (m1, s1) = self.history.recent(1);
        let (m2, s2) = self.history.recent(2);
        let h = (s0 / t).ln();
        let r0 = (s1 / s0).ln() / h;
        let r1 = (s2 / s1).ln() / h;
        let d1_0 = (1. / r0) * (m0 - m1);
        let d1_1 = (1. / r1) * (m1 - m2);
        let d1 = &d1_0 + (r0 / (r0 + r1)) * (&d1_0 - &d1_1);
        let d2 = (1. / (r0 + r1)) * (&d1_0 - &d1_1);
        if self.config.predict_x0 {
            let phi_1 = (-h).exp_m1();
            let phi_2 = phi_1 / h + 1.;
            let phi_3 = phi_2 / h - 0.5;
            (t / s0) * x - phi_1 * m0 + phi_2 * &d1 - phi_3 * &d2
        } else {
            let phi_1 = h.exp_m1();
            let phi_2 = phi_1 / h - 1.;
            let phi_3 = phi_2 / h - 0.5;
            x - t * (phi_1 * m0 + phi_2 * &d1 + phi_3 * &d2)
        }
    }
}

impl Solver for DpmPpSolver {
    fn prepare(&mut self, _num_steps: usize) -> Result<(), SolverError> {
        self.history.clear();
        Ok(())
    }

    fn step(&mut self, ctx: &StepContext<'_>, x_cur: &Tensor) -> Tensor {
        let (denoised, d_cur) = ctx.anchor_denoised_and_slope(x_cur);
        let est = if self.config.predict_x0 {
            match self.config.threshold {
                Some(threshold) => threshold(&denoised),
                None => denoised,
            }
        } else {
            d_cur
        };
        // The current estimate joins the history first, so `recent(0)` is
        // always the anchor of the update below.
        self.history.push(est, ctx.t_cur());

        let order = effective_order(
            ctx.step_index(),
            ctx.num_steps(),
            self.config.max_order,
            self.config.lower_order_final,
        );
        match order {
            1 => self.first_order(ctx, x_cur),
            2 => self.second_order(ctx, x_cur),
            _ => self.third_order(ctx, x_cur),
        }
    }
}
