//! Adapters around the denoising network.
//!
//! The solvers only ever consume the [`Denoiser`] trait: given a noisy
//! sample and a noise level, produce an estimate of the clean sample.
//! Conditioning is bound into the adapter once at construction, so the
//! integration loop never has to know how a particular model is guided.

use tch::Tensor;

/// An estimate of the clean sample at a given noise level.
///
/// Implementations must be pure functions of their arguments: for a fixed
/// `(sample, sigma)` the same tensor comes back, which is what makes
/// sampling runs reproducible.
pub trait Denoiser {
    fn denoise(&self, sample: &Tensor, sigma: f64) -> Tensor;
}

impl<F: Fn(&Tensor, f64) -> Tensor> Denoiser for F {
    fn denoise(&self, sample: &Tensor, sigma: f64) -> Tensor {
        self(sample, sigma)
    }
}

/// A network guided by an optional class label (EDM-style models).
pub trait LabelNet {
    fn forward(&self, sample: &Tensor, sigma: f64, class_labels: Option<&Tensor>) -> Tensor;
}

/// A network guided by an embedding, with an optional unconditional
/// embedding for classifier-free guidance (LDM / Stable Diffusion style).
pub trait GuidedNet {
    fn forward(
        &self,
        sample: &Tensor,
        sigma: f64,
        condition: &Tensor,
        unconditional_condition: Option<&Tensor>,
    ) -> Tensor;
}

/// Binds a class label to a [`LabelNet`].
pub struct LabelConditioned<N: LabelNet> {
    net: N,
    class_labels: Option<Tensor>,
}

impl<N: LabelNet> LabelConditioned<N> {
    pub fn new(net: N, class_labels: Option<Tensor>) -> Self {
        Self { net, class_labels }
    }
}

impl<N: LabelNet> Denoiser for LabelConditioned<N> {
    fn denoise(&self, sample: &Tensor, sigma: f64) -> Tensor {
        self.net.forward(sample, sigma, self.class_labels.as_ref())
    }
}

/// Binds a conditioning embedding to a [`GuidedNet`].
pub struct EmbeddingConditioned<N: GuidedNet> {
    net: N,
    condition: Tensor,
    unconditional_condition: Option<Tensor>,
}

impl<N: GuidedNet> EmbeddingConditioned<N> {
    pub fn new(net: N, condition: Tensor, unconditional_condition: Option<Tensor>) -> Self {
        Self { net, condition, unconditional_condition }
    }
}

impl<N: GuidedNet> Denoiser for EmbeddingConditioned<N> {
    fn denoise(&self, sample: &Tensor, sigma: f64) -> Tensor {
        self.net.forward(sample, sigma, &self.condition, self.unconditional_condition.as_ref())
    }
}

/// Slope of the probability-flow ODE derived from a denoised estimate.
pub(crate) fn slope_from(sample: &Tensor, denoised: &Tensor, sigma: f64) -> Tensor {
    (sample - denoised) / sigma
}

/// Analytical first step: the exact slope at the start of sampling under a
/// standard-normal prior, saving one network evaluation. Only valid for the
/// very first step of a run.
pub(crate) fn afs_slope(sample: &Tensor, sigma: f64) -> Tensor {
    sample / (1.0 + sigma * sigma).sqrt()
}

/// Elementwise hook applied to data-space history entries.
pub type ThresholdFn = fn(&Tensor) -> Tensor;

/// Dynamic thresholding introduced by Imagen (https://arxiv.org/abs/2205.11487):
/// clamp each sample to its 99.5% absolute-value quantile (floored at 1.0)
/// and renormalize. Suitable for pixel-space models; latent-space models
/// should leave the hook unset.
pub fn dynamic_threshold(x0: &Tensor) -> Tensor {
    let dynamic_max_val =
        x0.abs().reshape([x0.size()[0], -1]).quantile_scalar(0.995, 1, false, "linear");
    // (...,) + (None,) * (x0.ndim - 1)
    let shape = [dynamic_max_val.size(), vec![1; x0.dim() - 1]].concat();
    let dynamic_max_val = dynamic_max_val
        .maximum(&(dynamic_max_val.ones_like().to(dynamic_max_val.device())))
        .view(shape.as_slice());

    x0.clamp_tensor(Some(-dynamic_max_val.shallow_clone()), Some(dynamic_max_val.shallow_clone()))
        / dynamic_max_val
}
