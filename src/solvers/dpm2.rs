use tch::Tensor;

use super::{Solver, SolverError, StepContext};

#[derive(Debug, Clone)]
pub struct Dpm2SolverConfig {
    /// Location of the intermediate noise level, as the geometric
    /// interpolation weight `t_mid = t_next^r * t_cur^(1-r)`. `r = 0.5`
    /// recovers the original DPM-Solver-2.
    pub r: f64,
}

impl Default for Dpm2SolverConfig {
    fn default() -> Self {
        Self { r: 0.5 }
    }
}

/// DPM-Solver-2 (https://arxiv.org/abs/2206.00927): a single-step
/// second-order solver with one intermediate evaluation point. Two denoiser
/// evaluations per step.
pub struct Dpm2Solver {
    config: Dpm2SolverConfig,
}

impl Dpm2Solver {
    pub fn new(config: Dpm2SolverConfig) -> Result<Self, SolverError> {
        if !(config.r > 0. && config.r <= 1.) {
            return Err(SolverError::InvalidMidpointRatio(config.r));
        }
        Ok(Self { config })
    }
}

impl Solver for Dpm2Solver {
    fn step(&mut self, ctx: &StepContext<'_>, x_cur: &Tensor) -> Tensor {
        let (t_cur, t_next) = (ctx.t_cur(), ctx.t_next());
        let r = self.config.r;
        let d_cur = ctx.anchor_slope(x_cur);

        // Euler step to the intermediate point.
        let t_mid = t_next.powf(r) * t_cur.powf(1. - r);
        let x_mid = x_cur + (t_mid - t_cur) * &d_cur;

        // 2nd order correction.
        let d_mid = ctx.slope(&x_mid, t_mid);
        x_cur + (t_next - t_cur) * ((1. / (2. * r)) * d_mid + (1. - 1. / (2. * r)) * d_cur)
    }
}
