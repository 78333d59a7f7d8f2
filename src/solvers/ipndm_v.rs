use tch::Tensor;

use super::{
    effective_order, lagrange_integral, weighted_sum, History, Solver, SolverError, StepContext,
};

pub const MAX_ORDER: usize = 4;

/// Weights for the current slope and the `order - 1` most recent history
/// slopes, re-derived from the actual local step sizes: the slope history
/// is extrapolated by its Lagrange polynomial and integrated exactly over
/// the step. Under uniform spacing these reduce to the classical
/// Adams-Bashforth constants; the order-2 weights have the closed form
/// `[1 + r/2, -r/2]` with `r = h_n / h_{n-1}`.
pub(crate) fn variable_step_coefficients(sigmas: &[f64], i: usize, order: usize) -> Vec<f64> {
    if order == 1 {
        return vec![1.];
    }
    let nodes: Vec<f64> = (0..order).map(|k| sigmas[i - k]).collect();
    let h_n = sigmas[i + 1] - sigmas[i];
    (0..order).map(|j| lagrange_integral(&nodes, j, sigmas[i], sigmas[i + 1]) / h_n).collect()
}

#[derive(Debug, Clone)]
pub struct IpndmVSolverConfig {
    /// Maximum order of the solver, `1..=4`.
    pub max_order: usize,
}

impl Default for IpndmVSolverConfig {
    fn default() -> Self {
        Self { max_order: 4 }
    }
}

/// The variable-step version of [`super::ipndm`]: identical evaluation
/// cost, but the multistep weights are re-derived every step from the
/// actual step-size ratios, so non-uniform schedules are integrated
/// correctly.
pub struct IpndmVSolver {
    config: IpndmVSolverConfig,
    history: History,
}

impl IpndmVSolver {
    pub fn new(config: IpndmVSolverConfig) -> Result<Self, SolverError> {
        if config.max_order < 1 || config.max_order > MAX_ORDER {
            return Err(SolverError::UnsupportedOrder { order: config.max_order, max: MAX_ORDER });
        }
        let history = History::new(config.max_order - 1);
        Ok(Self { config, history })
    }
}

impl Solver for IpndmVSolver {
    fn prepare(&mut self, _num_steps: usize) -> Result<(), SolverError> {
        self.history.clear();
        Ok(())
    }

    fn step(&mut self, ctx: &StepContext<'_>, x_cur: &Tensor) -> Tensor {
        let i = ctx.step_index();
        let d_cur = ctx.anchor_slope(x_cur);
        let order = effective_order(i, ctx.num_steps(), self.config.max_order, false);
        let coeffs = variable_step_coefficients(ctx.sigmas(), i, order);
        let x_next =
            x_cur + (ctx.t_next() - ctx.t_cur()) * weighted_sum(&coeffs, &d_cur, &self.history);
        self.history.push(d_cur, ctx.t_cur());
        x_next
    }
}
