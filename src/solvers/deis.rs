use tch::Tensor;

use super::{effective_order, lagrange_integral, History, Solver, SolverError, StepContext};

pub const MAX_ORDER: usize = 4;

#[derive(Debug, Clone)]
pub struct DeisSolverConfig {
    /// Maximum order of the solver, `1..=4`.
    pub max_order: usize,
    /// Precomputed per-step weights: `coefficients[i]` holds one weight for
    /// the current slope followed by one per history slope, newest first.
    /// The weights absorb the step size, so the update is
    /// `x + c_0 * d_cur + c_1 * d_prev + ...`. How the table was derived is
    /// the caller's business; see [`tab_coefficients`] for the time-space
    /// Adams-Bashforth flavor.
    pub coefficients: Vec<Vec<f64>>,
}

/// DEIS (https://arxiv.org/abs/2204.13902): a semi-linear multistep solver
/// whose coefficients are precomputed from the schedule outside the engine
/// and simply indexed per step. One denoiser evaluation per step.
pub struct DeisSolver {
    config: DeisSolverConfig,
    history: History,
}

impl DeisSolver {
    pub fn new(config: DeisSolverConfig) -> Result<Self, SolverError> {
        if config.max_order < 1 || config.max_order > MAX_ORDER {
            return Err(SolverError::UnsupportedOrder { order: config.max_order, max: MAX_ORDER });
        }
        let history = History::new(config.max_order - 1);
        Ok(Self { config, history })
    }
}

impl Solver for DeisSolver {
    fn prepare(&mut self, num_steps: usize) -> Result<(), SolverError> {
        let rows = self.config.coefficients.len();
        if rows < num_steps {
            return Err(SolverError::MissingCoefficients { got: rows, required: num_steps });
        }
        for (step, row) in self.config.coefficients.iter().enumerate().take(num_steps).skip(1) {
            let order = effective_order(step, num_steps, self.config.max_order, false);
            if row.len() < order {
                return Err(SolverError::BadCoefficientRow { step, got: row.len(), order });
            }
        }
        self.history.clear();
        Ok(())
    }

    fn step(&mut self, ctx: &StepContext<'_>, x_cur: &Tensor) -> Tensor {
        let i = ctx.step_index();
        let d_cur = ctx.anchor_slope(x_cur);
        let order = effective_order(i, ctx.num_steps(), self.config.max_order, false);
        let x_next = if order == 1 {
            // First Euler step.
            x_cur + (ctx.t_next() - ctx.t_cur()) * &d_cur
        } else {
            let row = &self.config.coefficients[i];
            let mut acc = x_cur + row[0] * &d_cur;
            for (back, c) in row[1..order].iter().enumerate() {
                let (d, _) = self.history.recent(back);
                acc = acc + *c * d;
            }
            acc
        };
        self.history.push(d_cur, ctx.t_cur());
        x_next
    }
}

/// Builds the time-space Adams-Bashforth ("tAB") coefficient table for a
/// schedule: at each step the Lagrange basis through the current and
/// retained noise levels is integrated exactly from `t_i` to `t_{i+1}`.
pub fn tab_coefficients(sigmas: &[f64], max_order: usize) -> Vec<Vec<f64>> {
    let num_steps = sigmas.len() - 1;
    (0..num_steps)
        .map(|i| {
            let order = max_order.min(i + 1);
            let nodes: Vec<f64> = (0..order).map(|k| sigmas[i - k]).collect();
            (0..order).map(|j| lagrange_integral(&nodes, j, sigmas[i], sigmas[i + 1])).collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use tch::Tensor;

    use super::*;
    use crate::schedule::{time_steps, TimeScheduleConfig};
    use crate::solvers::testing::{scenario_config, LinearSlope};
    use crate::solvers::{sample, Solver, SolverError};
    use crate::solvers::ipndm::{adams_bashforth, IpndmSolver, IpndmSolverConfig};

    #[test]
    fn requires_enough_coefficient_rows() {
        let mut solver = DeisSolver::new(DeisSolverConfig {
            max_order: 2,
            coefficients: vec![vec![1.0]; 3],
        })
        .unwrap();
        assert!(matches!(solver.prepare(5), Err(SolverError::MissingCoefficients { .. })));
    }

    #[test]
    fn requires_full_rows() {
        let mut solver = DeisSolver::new(DeisSolverConfig {
            max_order: 3,
            coefficients: vec![vec![1.0]; 5],
        })
        .unwrap();
        assert!(matches!(solver.prepare(5), Err(SolverError::BadCoefficientRow { .. })));
    }

    #[test]
    fn tab_rows_sum_to_the_step_size() {
        let sigmas = time_steps(&TimeScheduleConfig::default(), 6, 0.002, 80.0).unwrap();
        let table = tab_coefficients(&sigmas, 4);
        assert_eq!(table.len(), 6);
        for (i, row) in table.iter().enumerate() {
            let sum: f64 = row.iter().sum();
            let h = sigmas[i + 1] - sigmas[i];
            assert!((sum - h).abs() < 1e-9 * h.abs(), "row {i}: {sum} vs {h}");
        }
    }

    #[test]
    fn classical_weight_table_reproduces_ipndm() {
        let config = scenario_config(5);
        let sigmas =
            time_steps(&config.schedule, config.num_steps, config.sigma_min, config.sigma_max)
                .unwrap();
        let table: Vec<Vec<f64>> = (0..config.num_steps)
            .map(|i| {
                let order = 4.min(i + 1);
                let h = sigmas[i + 1] - sigmas[i];
                adams_bashforth(order).iter().map(|c| c * h).collect()
            })
            .collect();

        let mut deis =
            DeisSolver::new(DeisSolverConfig { max_order: 4, coefficients: table }).unwrap();
        let mut ipndm = IpndmSolver::new(IpndmSolverConfig { max_order: 4 }).unwrap();

        let latents = Tensor::from_slice(&[0.4, -0.9]);
        let denoiser = LinearSlope::unit2();
        let a = sample(&mut deis as &mut dyn Solver, &denoiser, &latents, &config).unwrap();
        let b = sample(&mut ipndm as &mut dyn Solver, &denoiser, &latents, &config).unwrap();
        let (a, b): (Vec<f64>, Vec<f64>) = ((&a).try_into().unwrap(), (&b).try_into().unwrap());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-9, "{x} vs {y}");
        }
    }
}
