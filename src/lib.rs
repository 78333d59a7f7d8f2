//! # Diffusion ODE solvers
//!
//! Training-free samplers for diffusion generative models, using Torch via
//! the [tch-rs](https://github.com/LaurentMazare/tch-rs) bindings.
//!
//! A sampler advances a noisy sample towards a clean one by integrating the
//! reverse-time probability-flow ODE over a short sequence of noise levels.
//! This library includes:
//! - Single-step solvers: Euler (equivalent to DDIM), Heun, and
//!   DPM-Solver-2.
//! - Linear multistep solvers that reuse past network evaluations: iPNDM,
//!   its variable-step variant, and DEIS with precomputed coefficients.
//! - Exponential-integrator multistep solvers: DPM-Solver++ and UniPC.
//!
//! The denoising network is opaque to the solvers and plugs in through the
//! [`denoiser::Denoiser`] trait.

pub mod denoiser;
pub mod schedule;
pub mod solvers;
