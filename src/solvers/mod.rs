//! # ODE solvers for diffusion sampling
//!
//! Every solver advances the sample through the same strictly sequential
//! loop: at step `i` it moves the state from noise level `t_i` to `t_i+1`,
//! spending one or two denoiser evaluations, and optionally reusing a short
//! history of previous estimates. Solvers differ only in the update rule,
//! so they all implement the [`Solver`] trait and share the [`sample`]
//! driver.

use tch::Tensor;

use crate::denoiser::{afs_slope, slope_from, Denoiser};
use crate::schedule::{time_steps, ScheduleError, TimeScheduleConfig};

pub mod deis;
pub mod dpm2;
pub mod dpmpp;
pub mod euler;
pub mod heun;
pub mod ipndm;
pub mod ipndm_v;
pub mod unipc;

#[derive(Debug, thiserror::Error)]
pub enum SolverError {
    #[error("solver order must lie in 1..={max}, got {order}")]
    UnsupportedOrder { order: usize, max: usize },
    #[error("midpoint ratio r must lie in (0, 1], got {0}")]
    InvalidMidpointRatio(f64),
    #[error("coefficient table provides {got} rows but {required} steps were requested")]
    MissingCoefficients { got: usize, required: usize },
    #[error("coefficient row {step} holds {got} weights, fewer than order {order}")]
    BadCoefficientRow { step: usize, got: usize, order: usize },
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// Everything a solver may consult while taking one step.
pub struct StepContext<'a> {
    denoiser: &'a dyn Denoiser,
    sigmas: &'a [f64],
    step_index: usize,
    afs: bool,
}

impl<'a> StepContext<'a> {
    pub fn t_cur(&self) -> f64 {
        self.sigmas[self.step_index]
    }

    pub fn t_next(&self) -> f64 {
        self.sigmas[self.step_index + 1]
    }

    pub fn sigmas(&self) -> &[f64] {
        self.sigmas
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }

    pub fn num_steps(&self) -> usize {
        self.sigmas.len() - 1
    }

    pub fn is_last(&self) -> bool {
        self.step_index + 1 == self.num_steps()
    }

    pub fn denoised(&self, sample: &Tensor, sigma: f64) -> Tensor {
        self.denoiser.denoise(sample, sigma)
    }

    /// ODE slope at an arbitrary point, always spending an evaluation.
    pub fn slope(&self, sample: &Tensor, sigma: f64) -> Tensor {
        let denoised = self.denoised(sample, sigma);
        slope_from(sample, &denoised, sigma)
    }

    /// ODE slope at the anchor point `(x_cur, t_cur)`. Uses the analytical
    /// first step instead of an evaluation when enabled and `step_index == 0`.
    pub fn anchor_slope(&self, x_cur: &Tensor) -> Tensor {
        if self.afs && self.step_index == 0 {
            afs_slope(x_cur, self.t_cur())
        } else {
            self.slope(x_cur, self.t_cur())
        }
    }

    /// Denoised estimate and slope at the anchor point, for methods that
    /// keep data-space history. Under the analytical first step the
    /// denoised estimate is reconstructed from the slope.
    pub fn anchor_denoised_and_slope(&self, x_cur: &Tensor) -> (Tensor, Tensor) {
        let t_cur = self.t_cur();
        if self.afs && self.step_index == 0 {
            let d_cur = afs_slope(x_cur, t_cur);
            (x_cur - t_cur * &d_cur, d_cur)
        } else {
            let denoised = self.denoised(x_cur, t_cur);
            let d_cur = slope_from(x_cur, &denoised, t_cur);
            (denoised, d_cur)
        }
    }
}

/// A fixed-capacity ring of past estimates and their noise levels,
/// addressed by recency.
pub struct History {
    capacity: usize,
    entries: Vec<(Tensor, f64)>,
    head: usize,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: Vec::with_capacity(capacity), head: 0 }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends an estimate, evicting the oldest entry once at capacity.
    /// Entries are detached: sampling never retains gradient state.
    pub fn push(&mut self, estimate: Tensor, sigma: f64) {
        if self.capacity == 0 {
            return;
        }
        let estimate = estimate.detach();
        if self.entries.len() < self.capacity {
            self.entries.push((estimate, sigma));
        } else {
            self.entries[self.head] = (estimate, sigma);
            self.head = (self.head + 1) % self.capacity;
        }
    }

    /// The entry `back` steps behind the most recent one; `recent(0)` is
    /// the newest. Requesting beyond `len()` is a caller bug: the order
    /// policy never asks for more history than exists.
    pub fn recent(&self, back: usize) -> (&Tensor, f64) {
        assert!(back < self.entries.len(), "history holds {} entries", self.entries.len());
        let idx = (self.head + self.entries.len() - 1 - back) % self.capacity;
        let (estimate, sigma) = &self.entries[idx];
        (estimate, *sigma)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.head = 0;
    }
}

/// Effective order at step `i` of `num_steps`: ramp up from 1 while the
/// history is short, and with `lower_order_final` ramp down so the last
/// steps never extrapolate from more points than remain useful.
pub(crate) fn effective_order(
    step_index: usize,
    num_steps: usize,
    max_order: usize,
    lower_order_final: bool,
) -> usize {
    let order = max_order.min(step_index + 1);
    if lower_order_final {
        order.min(num_steps - step_index)
    } else {
        order
    }
}

/// Integral over `[a, b]` of the `j`-th Lagrange basis polynomial through
/// `nodes`, via monomial expansion. The workhorse behind every
/// polynomial-extrapolation coefficient in this crate; exact for the orders
/// in use (up to cubic bases).
pub(crate) fn lagrange_integral(nodes: &[f64], j: usize, a: f64, b: f64) -> f64 {
    // expand prod_{l != j} (tau - nodes[l]), lowest degree first
    let mut poly = vec![1.0];
    let mut denom = 1.0;
    for (l, &node) in nodes.iter().enumerate() {
        if l == j {
            continue;
        }
        let mut next = vec![0.0; poly.len() + 1];
        for (k, &c) in poly.iter().enumerate() {
            next[k] -= c * node;
            next[k + 1] += c;
        }
        poly = next;
        denom *= nodes[j] - node;
    }
    let antiderivative = |x: f64| -> f64 {
        poly.iter()
            .enumerate()
            .map(|(k, &c)| c * x.powi(k as i32 + 1) / (k as f64 + 1.))
            .sum()
    };
    (antiderivative(b) - antiderivative(a)) / denom
}

/// `coeffs[0] * d_cur + coeffs[1] * history[newest] + ...`
pub(crate) fn weighted_sum(coeffs: &[f64], d_cur: &Tensor, history: &History) -> Tensor {
    let mut acc = coeffs[0] * d_cur;
    for (back, c) in coeffs[1..].iter().enumerate() {
        let (d, _) = history.recent(back);
        acc = acc + *c * d;
    }
    acc
}

/// One integration method, driven by [`sample`].
pub trait Solver {
    /// Validates per-run configuration and clears any state left over from
    /// a previous run. Called once before the loop; configuration problems
    /// never surface mid-run.
    fn prepare(&mut self, num_steps: usize) -> Result<(), SolverError> {
        let _ = num_steps;
        Ok(())
    }

    /// Advances the sample from `ctx.t_cur()` to `ctx.t_next()`.
    fn step(&mut self, ctx: &StepContext<'_>, x_cur: &Tensor) -> Tensor;
}

#[derive(Debug, Clone)]
pub struct SamplingConfig {
    /// Number of integration steps; the schedule holds `num_steps + 1`
    /// noise levels.
    pub num_steps: usize,
    /// The ending sigma during sampling.
    pub sigma_min: f64,
    /// The starting sigma during sampling.
    pub sigma_max: f64,
    pub schedule: TimeScheduleConfig,
    /// Whether to use the analytical first step at the beginning of
    /// sampling, saving one network evaluation.
    pub afs: bool,
    /// Whether to replace the final state with one last denoiser evaluation
    /// at `sigma_min`.
    pub denoise_to_zero: bool,
    /// Whether to return the whole sampling trajectory instead of just the
    /// final state.
    pub return_trajectory: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            num_steps: 35,
            sigma_min: 0.002,
            sigma_max: 80.0,
            schedule: TimeScheduleConfig::default(),
            afs: false,
            denoise_to_zero: false,
            return_trajectory: false,
        }
    }
}

/// Runs the sampling loop.
///
/// `latents` is the unit-variance input sample; it is scaled by `t_0` before
/// the first step. Returns the final state, or the stacked trajectory of
/// `num_steps + 1` states (`+ 1` more with `denoise_to_zero`) when
/// `return_trajectory` is set.
pub fn sample(
    solver: &mut dyn Solver,
    denoiser: &dyn Denoiser,
    latents: &Tensor,
    config: &SamplingConfig,
) -> anyhow::Result<Tensor> {
    let sigmas =
        time_steps(&config.schedule, config.num_steps, config.sigma_min, config.sigma_max)?;
    solver.prepare(config.num_steps)?;

    let out = tch::no_grad(|| {
        let mut x_next = latents * sigmas[0];
        let mut inters = vec![x_next.copy()];
        for i in 0..config.num_steps {
            let x_cur = x_next;
            let ctx =
                StepContext { denoiser, sigmas: &sigmas, step_index: i, afs: config.afs };
            x_next = solver.step(&ctx, &x_cur);
            if config.return_trajectory {
                inters.push(x_next.copy());
            }
        }
        if config.denoise_to_zero {
            x_next = denoiser.denoise(&x_next, sigmas[config.num_steps]);
            if config.return_trajectory {
                inters.push(x_next.copy());
            }
        }
        if config.return_trajectory {
            Tensor::stack(&inters, 0)
        } else {
            x_next
        }
    });
    Ok(out)
}
