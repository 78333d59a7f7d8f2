use tch::Tensor;

use super::{effective_order, weighted_sum, History, Solver, SolverError, StepContext};

pub const MAX_ORDER: usize = 4;

/// Classical Adams-Bashforth weights for orders 1 to 4, as numerators over
/// a common divisor. Applied as-is regardless of the actual spacing, which
/// assumes locally uniform steps; see [`super::ipndm_v`] for the
/// variable-step correction.
const AB_COEFFS: [(&[f64], f64); MAX_ORDER] = [
    (&[1.], 1.),
    (&[3., -1.], 2.),
    (&[23., -16., 5.], 12.),
    (&[55., -59., 37., -9.], 24.),
];

pub(crate) fn adams_bashforth(order: usize) -> Vec<f64> {
    let (numer, denom) = AB_COEFFS[order - 1];
    numer.iter().map(|n| n / denom).collect()
}

#[derive(Debug, Clone)]
pub struct IpndmSolverConfig {
    /// Maximum order of the solver, `1..=4`.
    pub max_order: usize,
}

impl Default for IpndmSolverConfig {
    fn default() -> Self {
        Self { max_order: 4 }
    }
}

/// Improved PNDM (https://arxiv.org/abs/2204.13902): a linear multistep
/// solver with constant Adams-Bashforth coefficients. One denoiser
/// evaluation per step; order `k` additionally reuses the `k - 1` most
/// recent slopes.
pub struct IpndmSolver {
    config: IpndmSolverConfig,
    history: History,
}

impl IpndmSolver {
    pub fn new(config: IpndmSolverConfig) -> Result<Self, SolverError> {
        if config.max_order < 1 || config.max_order > MAX_ORDER {
            return Err(SolverError::UnsupportedOrder { order: config.max_order, max: MAX_ORDER });
        }
        let history = History::new(config.max_order - 1);
        Ok(Self { config, history })
    }
}

impl Solver for IpndmSolver {
    fn prepare(&mut self, _num_steps: usize) -> Result<(), SolverError> {
        self.history.clear();
        Ok(())
    }

    fn step(&mut self, ctx: &StepContext<'_>, x_cur: &Tensor) -> Tensor {
        let d_cur = ctx.anchor_slope(x_cur);
        let order = effective_order(ctx.step_index(), ctx.num_steps(), self.config.max_order, false);
        let coeffs = adams_bashforth(order);
        let x_next =
            x_cur + (ctx.t_next() - ctx.t_cur()) * weighted_sum(&coeffs, &d_cur, &self.history);
        self.history.push(d_cur, ctx.t_cur());
        x_next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solvers::testing::{assert_linear_exact, run_linear};

    #[test]
    fn coefficients_sum_to_one() {
        for order in 1..=MAX_ORDER {
            let sum: f64 = adams_bashforth(order).iter().sum();
            assert!((sum - 1.0).abs() < 1e-12, "order {order}: sum {sum}");
        }
    }

    #[test]
    fn exact_on_linear_ode_at_every_order() {
        for max_order in 1..=MAX_ORDER {
            let mut solver = IpndmSolver::new(IpndmSolverConfig { max_order }).unwrap();
            assert_linear_exact(&mut solver);
        }
    }

    #[test]
    fn history_never_exceeds_capacity() {
        let mut solver = IpndmSolver::new(IpndmSolverConfig { max_order: 3 }).unwrap();
        run_linear(&mut solver);
        assert!(solver.history.len() <= 2);
    }

    #[test]
    fn rejects_unsupported_orders() {
        for max_order in [0, 5] {
            assert!(matches!(
                IpndmSolver::new(IpndmSolverConfig { max_order }),
                Err(SolverError::UnsupportedOrder { .. })
            ));
        }
    }
}
