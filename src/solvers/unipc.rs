use tch::Tensor;

use super::{effective_order, History, Solver, SolverError, StepContext};
use crate::denoiser::{slope_from, ThresholdFn};

pub const MAX_ORDER: usize = 3;

/// Choice of the B(h) factor in the UniPC update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UniPcVariant {
    /// `B(h) = h`.
    Bh1,
    /// `B(h) = expm1(h)`, the recommended default.
    #[default]
    Bh2,
}

#[derive(Debug, Clone)]
pub struct UniPcSolverConfig {
    /// Maximum order of the solver, `1..=3`.
    pub max_order: usize,
    /// Whether the multistep history holds data-space estimates
    /// (`predict_x0`) or noise-space estimates.
    pub predict_x0: bool,
    /// Whether to drop to lower orders over the final steps.
    pub lower_order_final: bool,
    pub variant: UniPcVariant,
    /// Whether to run the corrector. When disabled the solver is
    /// predictor-only, but the accepted points are still evaluated so the
    /// history stays populated; the evaluation cost is unchanged.
    pub corrector: bool,
    /// Optional clamp applied to data-space estimates before they enter
    /// the update and the history. Only meaningful with `predict_x0`.
    pub threshold: Option<ThresholdFn>,
}

impl Default for UniPcSolverConfig {
    fn default() -> Self {
        Self {
            max_order: 3,
            predict_x0: true,
            lower_order_final: true,
            variant: UniPcVariant::default(),
            corrector: true,
            threshold: None,
        }
    }
}

/// UniPC (https://arxiv.org/abs/2302.04867): a unified
/// predictor-corrector built on the same exponential integrator as
/// [`super::dpmpp`]. The order-`k` predictor extrapolates from `k - 1`
/// history differences; the corrector reuses the evaluation at the
/// accepted point to refine the step at no extra cost, raising the
/// effective order by one. One denoiser evaluation per step.
pub struct UniPcSolver {
    config: UniPcSolverConfig,
    history: History,
}

/// Gaussian elimination with partial pivoting; the systems here are at most
/// 3x3 Vandermonde matrices in the step-size ratios.
fn solve_linear_system(a: &[Vec<f64>], b: &[f64]) -> Vec<f64> {
    let n = b.len();
    let mut m: Vec<Vec<f64>> = a.iter().take(n).map(|row| row[..n].to_vec()).collect();
    let mut rhs = b.to_vec();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))
            .unwrap();
        m.swap(col, pivot);
        rhs.swap(col, pivot);
        for row in col + 1..n {
            let f = m[row][col] / m[col][col];
            for k in col..n {
                m[row][k] -= f * m[col][k];
            }
            rhs[row] -= f * rhs[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let mut acc = rhs[row];
        for k in row + 1..n {
            acc -= m[row][k] * x[k];
        }
        x[row] = acc / m[row][row];
    }
    x
}

impl UniPcSolver {
    pub fn new(config: UniPcSolverConfig) -> Result<Self, SolverError> {
        if config.max_order < 1 || config.max_order > MAX_ORDER {
            return Err(SolverError::UnsupportedOrder { order: config.max_order, max: MAX_ORDER });
        }
        let history = History::new(config.max_order);
        Ok(Self { config, history })
    }

    fn estimate(&self, denoised: Tensor, slope: Tensor) -> Tensor {
        if self.config.predict_x0 {
            match self.config.threshold {
                Some(threshold) => threshold(&denoised),
                None => denoised,
            }
        } else {
            slope
        }
    }

    /// One predictor step, plus the corrector when enabled. Returns the new
    /// state and, unless this is the last step, the estimate at the
    /// accepted point for the history.
    fn update(&self, ctx: &StepContext<'_>, x: &Tensor, order: usize) -> (Tensor, Option<Tensor>) {
        let predict_x0 = self.config.predict_x0;
        let (s0, t) = (ctx.t_cur(), ctx.t_next());
        let (m0, _) = self.history.recent(0);
        let h = (s0 / t).ln();

        // Step-size ratios and scaled history differences, newest first.
        let mut rks: Vec<f64> = Vec::with_capacity(order);
        let mut d1s: Vec<Tensor> = Vec::with_capacity(order - 1);
        for k in 1..order {
            let (mk, sk) = self.history.recent(k);
            let rk = (s0 / sk).ln() / h;
            d1s.push((1. / rk) * (mk - m0));
            rks.push(rk);
        }
        rks.push(1.0);

        let hh = if predict_x0 { -h } else { h };
        let h_phi_1 = hh.exp_m1();
        let b_h = match self.config.variant {
            UniPcVariant::Bh1 => hh,
            UniPcVariant::Bh2 => h_phi_1,
        };

        // Vandermonde system in the ratios; the right-hand side follows the
        // recurrence phi_{k+1} = phi_k / hh - 1 / (k+1)!.
        let mut r = vec![vec![0.0; order]; order];
        let mut b = vec![0.0; order];
        let mut h_phi_k = h_phi_1 / hh - 1.;
        let mut factorial = 1.0;
        for i in 0..order {
            for (j, rk) in rks.iter().enumerate() {
                r[i][j] = rk.powi(i as i32);
            }
            b[i] = h_phi_k * factorial / b_h;
            factorial *= (i + 2) as f64;
            h_phi_k = h_phi_k / hh - 1. / factorial;
        }

        let x_t_ = if predict_x0 { (t / s0) * x - h_phi_1 * m0 } else { x - t * h_phi_1 * m0 };

        let x_pred = if d1s.is_empty() {
            x_t_.shallow_clone()
        } else {
            let rhos_p = if order == 2 {
                vec![0.5]
            } else {
                solve_linear_system(&r, &b[..order - 1])
            };
            let mut res = rhos_p[0] * &d1s[0];
            for (rho, d1) in rhos_p[1..].iter().zip(&d1s[1..]) {
                res = res + *rho * d1;
            }
            if predict_x0 {
                &x_t_ - b_h * res
            } else {
                &x_t_ - t * b_h * res
            }
        };

        if ctx.is_last() {
            return (x_pred, None);
        }

        // Evaluate at the accepted point; the corrector reuses this
        // evaluation and the history inherits it either way.
        let denoised = ctx.denoised(&x_pred, t);
        let d_t = slope_from(&x_pred, &denoised, t);
        let est = self.estimate(denoised, d_t);
        if !self.config.corrector {
            return (x_pred, Some(est));
        }

        let rhos_c = if order == 1 { vec![0.5] } else { solve_linear_system(&r, &b) };
        let d1_t = &est - m0;
        let mut corr = rhos_c[order - 1] * &d1_t;
        for (rho, d1) in rhos_c[..order - 1].iter().zip(&d1s) {
            corr = corr + *rho * d1;
        }
        let x_t = if predict_x0 { &x_t_ - b_h * corr } else { &x_t_ - t * b_h * corr };
        (x_t, Some(est))
    }
}

impl Solver for UniPcSolver {
    fn prepare(&mut self, _num_steps: usize) -> Result<(), SolverError> {
        self.history.clear();
        Ok(())
    }

    fn step(&mut self, ctx: &StepContext<'_>, x_cur: &Tensor) -> Tensor {
        if ctx.step_index() == 0 {
            let (denoised, d_cur) = ctx.anchor_denoised_and_slope(x_cur);
            let est = self.estimate(denoised, d_cur);
            self.history.push(est, ctx.t_cur());
        }
        let order = effective_order(
            ctx.step_index(),
            ctx.num_steps(),
            self.config.max_order,
            self.config.lower_order_final,
        );
        let (x_next, est) = self.update(ctx, x_cur, order);
        if let Some(est) = est {
            self.history.push(est, ctx.t_next());
        }
        x_next
    }
}

#[cfg(test)]
mod tests {
    use tch::Tensor;

    use super::*;
    use crate::solvers::testing::{assert_linear_exact, scenario_config, LinearSlope};
    use crate::solvers::{sample, SolverError};

    #[test]
    fn exact_on_linear_ode_in_every_configuration() {
        for predict_x0 in [true, false] {
            for variant in [UniPcVariant::Bh1, UniPcVariant::Bh2] {
                for corrector in [true, false] {
                    for max_order in 1..=MAX_ORDER {
                        let mut solver = UniPcSolver::new(UniPcSolverConfig {
                            max_order,
                            predict_x0,
                            variant,
                            corrector,
                            ..Default::default()
                        })
                        .unwrap();
                        assert_linear_exact(&mut solver);
                    }
                }
            }
        }
    }

    #[test]
    fn solves_vandermonde_systems() {
        // R = [[1, 1], [r, 1]] with b = [b0, b1] has the closed-form
        // solution ((b0 - b1) / (1 - r), (b1 - r b0) / (1 - r)).
        let r = vec![vec![1.0, 1.0], vec![-2.0, 1.0]];
        let b = vec![1.0, 4.0];
        let x = solve_linear_system(&r, &b);
        assert!((x[0] + 1.0).abs() < 1e-12);
        assert!((x[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn corrector_changes_nonlinear_trajectories() {
        // denoised = sigma^2 makes the slope state-dependent, so predictor
        // and predictor-corrector must genuinely disagree.
        let denoiser = |sample: &Tensor, sigma: f64| sample * 0. + sigma * sigma;
        let latents = Tensor::from_slice(&[0.0, 0.0]);
        let config = scenario_config(5);

        let mut pc = UniPcSolver::new(Default::default()).unwrap();
        let corrected = sample(&mut pc, &denoiser, &latents, &config).unwrap();

        let mut p = UniPcSolver::new(UniPcSolverConfig { corrector: false, ..Default::default() })
            .unwrap();
        let predicted = sample(&mut p, &denoiser, &latents, &config).unwrap();

        assert!(!corrected.equal(&predicted));
    }

    #[test]
    fn predictor_only_mode_costs_the_same_evaluations() {
        let denoiser = LinearSlope::unit2();
        let latents = Tensor::from_slice(&[0.0, 0.0]);
        let config = scenario_config(5);
        let mut solver =
            UniPcSolver::new(UniPcSolverConfig { corrector: false, ..Default::default() })
                .unwrap();
        sample(&mut solver, &denoiser, &latents, &config).unwrap();
        assert_eq!(denoiser.calls.get(), 5);
    }

    #[test]
    fn rejects_unsupported_orders() {
        for max_order in [0, 4] {
            assert!(matches!(
                UniPcSolver::new(UniPcSolverConfig { max_order, ..Default::default() }),
                Err(SolverError::UnsupportedOrder { .. })
            ));
        }
    }
}
