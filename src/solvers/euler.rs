use tch::Tensor;

use super::{Solver, StepContext};

/// First-order Euler solver, equivalent to the DDIM sampler
/// (https://arxiv.org/abs/2010.02502). One denoiser evaluation per step.
pub struct EulerSolver;

impl EulerSolver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for EulerSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Solver for EulerSolver {
    fn step(&mut self, ctx: &StepContext<'_>, x_cur: &Tensor) -> Tensor {
        let d_cur = ctx.anchor_slope(x_cur);
        x_cur + (ctx.t_next() - ctx.t_cur()) * d_cur
    }
}

#[cfg(test)]
mod tests {
    use tch::Tensor;

    use super::*;
    use crate::solvers::testing::assert_linear_exact;
    use crate::solvers::{sample, SamplingConfig};

    #[test]
    fn exact_on_linear_ode() {
        assert_linear_exact(&mut EulerSolver::new());
    }

    #[test]
    fn single_step_is_one_euler_update() {
        let v = Tensor::from_slice(&[2.0, -1.0]);
        let denoiser = move |x: &Tensor, sigma: f64| x - sigma * &v;
        let latents = Tensor::from_slice(&[1.0, 1.0]);
        let config = SamplingConfig { num_steps: 1, ..Default::default() };
        let out = sample(&mut EulerSolver::new(), &denoiser, &latents, &config).unwrap();
        let out: Vec<f64> = (&out).try_into().unwrap();
        // x = 80 * latents + (0.002 - 80) * v
        assert!((out[0] - (80.0 + (0.002 - 80.0) * 2.0)).abs() < 1e-9);
        assert!((out[1] - (80.0 - (0.002 - 80.0))).abs() < 1e-9);
    }
}
