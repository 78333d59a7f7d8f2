//! Noise-level schedules.
//!
//! A schedule is a strictly decreasing sequence of `num_steps + 1` positive
//! noise levels running from `sigma_max` down to `sigma_min`. The solvers
//! consume it as-is; picking a spacing policy is entirely a caller concern.

/// How the noise levels are spaced between `sigma_max` and `sigma_min`.
#[derive(Debug, Clone)]
pub enum TimeScheduleType {
    /// Polynomial spacing in `sigma^(1/rho)`. Recommended in EDM
    /// (https://arxiv.org/abs/2206.00364).
    Polynomial,
    /// Uniform log-SNR spacing. Recommended in DPM-Solver for
    /// small-resolution datasets.
    LogSnr,
    /// Uniform spacing in the VP diffusion time, with the index raised to
    /// `rho`. Recommended in DPM-Solver for high-resolution datasets.
    TimeUniform,
    /// Spacing through the discrete sigmas a model was trained on (LDM and
    /// Stable Diffusion). The table must be ascending and positive.
    Discrete { sigmas: Vec<f64> },
}

#[derive(Debug, Clone)]
pub struct TimeScheduleConfig {
    pub schedule_type: TimeScheduleType,
    /// Spacing exponent, used by the `Polynomial`, `TimeUniform` and
    /// `Discrete` policies.
    pub rho: f64,
}

impl Default for TimeScheduleConfig {
    fn default() -> Self {
        Self { schedule_type: TimeScheduleType::Polynomial, rho: 7.0 }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("num_steps must be at least 1")]
    NoSteps,
    #[error("sigma range must satisfy 0 < sigma_min < sigma_max, got [{sigma_min}, {sigma_max}]")]
    InvalidSigmaRange { sigma_min: f64, sigma_max: f64 },
    #[error("discrete schedule requires an ascending table of at least two positive sigmas")]
    InvalidSigmaTable,
    #[error("sigma {0} lies outside the discrete sigma table")]
    SigmaOutsideTable(f64),
    #[error("schedule is not strictly decreasing and positive")]
    NotDecreasing,
}

/// Builds the noise-level sequence `t_0 = sigma_max > ... > t_N = sigma_min`
/// with `N = num_steps` spacings.
pub fn time_steps(
    config: &TimeScheduleConfig,
    num_steps: usize,
    sigma_min: f64,
    sigma_max: f64,
) -> Result<Vec<f64>, ScheduleError> {
    if num_steps == 0 {
        return Err(ScheduleError::NoSteps);
    }
    if !(sigma_min > 0. && sigma_min < sigma_max) {
        return Err(ScheduleError::InvalidSigmaRange { sigma_min, sigma_max });
    }

    let n = num_steps as f64;
    let steps: Vec<f64> = match &config.schedule_type {
        TimeScheduleType::Polynomial => {
            let inv_rho = 1.0 / config.rho;
            let (lo, hi) = (sigma_min.powf(inv_rho), sigma_max.powf(inv_rho));
            (0..=num_steps).map(|i| (hi + i as f64 / n * (lo - hi)).powf(config.rho)).collect()
        }
        TimeScheduleType::LogSnr => {
            let (lo, hi) = (sigma_min.ln(), sigma_max.ln());
            (0..=num_steps).map(|i| (hi + i as f64 / n * (lo - hi)).exp()).collect()
        }
        TimeScheduleType::TimeUniform => {
            // VP parameterization with beta_d/beta_min solved so that the
            // endpoints land exactly on sigma_max and sigma_min.
            let epsilon_s = 1e-3;
            let (log_min, log_max) =
                ((sigma_min * sigma_min + 1.).ln(), (sigma_max * sigma_max + 1.).ln());
            let beta_d = 2. * (log_min / epsilon_s - log_max) / (epsilon_s - 1.);
            let beta_min = log_max - 0.5 * beta_d;
            let vp_sigma = |t: f64| ((0.5 * beta_d * t * t + beta_min * t).exp() - 1.).sqrt();
            (0..=num_steps)
                .map(|i| {
                    let t = (1. + i as f64 / n * (epsilon_s.powf(1. / config.rho) - 1.))
                        .powf(config.rho);
                    vp_sigma(t)
                })
                .collect()
        }
        TimeScheduleType::Discrete { sigmas } => {
            if sigmas.len() < 2 || sigmas[0] <= 0. || sigmas.windows(2).any(|w| w[0] >= w[1]) {
                return Err(ScheduleError::InvalidSigmaTable);
            }
            let u_max = fractional_index(sigmas, sigma_max)?;
            let u_min = fractional_index(sigmas, sigma_min)?;
            let inv_rho = 1.0 / config.rho;
            let (lo, hi) = (u_min.powf(inv_rho), u_max.powf(inv_rho));
            (0..=num_steps)
                .map(|i| table_lookup(sigmas, (hi + i as f64 / n * (lo - hi)).powf(config.rho)))
                .collect()
        }
    };

    if steps.iter().any(|t| !t.is_finite()) || steps.windows(2).any(|w| w[0] <= w[1]) || steps[num_steps] <= 0. {
        return Err(ScheduleError::NotDecreasing);
    }
    Ok(steps)
}

/// Position of `sigma` in an ascending table, as a fractional index.
fn fractional_index(table: &[f64], sigma: f64) -> Result<f64, ScheduleError> {
    let last = table.len() - 1;
    if sigma < table[0] || sigma > table[last] {
        return Err(ScheduleError::SigmaOutsideTable(sigma));
    }
    let k = table.partition_point(|&s| s < sigma).min(last).max(1);
    Ok((k - 1) as f64 + (sigma - table[k - 1]) / (table[k] - table[k - 1]))
}

/// Linear interpolation at a fractional index, mimicking np.interp().
fn table_lookup(table: &[f64], u: f64) -> f64 {
    let k = (u.floor() as usize).min(table.len() - 2);
    table[k] + (u - k as f64) * (table[k + 1] - table[k])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(steps: &[f64], sigma_min: f64, sigma_max: f64) {
        assert!((steps[0] - sigma_max).abs() < 1e-9 * sigma_max);
        assert!((steps[steps.len() - 1] - sigma_min).abs() < 1e-9);
        assert!(steps.windows(2).all(|w| w[0] > w[1] && w[1] > 0.));
    }

    #[test]
    fn polynomial_schedule() {
        let config = TimeScheduleConfig::default();
        let steps = time_steps(&config, 10, 0.002, 80.0).unwrap();
        assert_eq!(steps.len(), 11);
        endpoints(&steps, 0.002, 80.0);
    }

    #[test]
    fn logsnr_schedule() {
        let config =
            TimeScheduleConfig { schedule_type: TimeScheduleType::LogSnr, rho: 7.0 };
        let steps = time_steps(&config, 8, 0.01, 50.0).unwrap();
        assert_eq!(steps.len(), 9);
        endpoints(&steps, 0.01, 50.0);
        // uniform in log sigma
        let ratios: Vec<f64> = steps.windows(2).map(|w| w[1] / w[0]).collect();
        for r in &ratios[1..] {
            assert!((r - ratios[0]).abs() < 1e-12);
        }
    }

    #[test]
    fn time_uniform_schedule() {
        let config =
            TimeScheduleConfig { schedule_type: TimeScheduleType::TimeUniform, rho: 1.0 };
        let steps = time_steps(&config, 12, 0.002, 80.0).unwrap();
        assert_eq!(steps.len(), 13);
        endpoints(&steps, 0.002, 80.0);
    }

    #[test]
    fn discrete_schedule() {
        let table: Vec<f64> = (1..=1000).map(|i| i as f64 * 0.1).collect();
        let config = TimeScheduleConfig {
            schedule_type: TimeScheduleType::Discrete { sigmas: table },
            rho: 1.0,
        };
        let steps = time_steps(&config, 5, 0.5, 90.0).unwrap();
        assert_eq!(steps.len(), 6);
        endpoints(&steps, 0.5, 90.0);
    }

    #[test]
    fn rejects_bad_configurations() {
        let config = TimeScheduleConfig::default();
        assert!(matches!(time_steps(&config, 0, 0.002, 80.0), Err(ScheduleError::NoSteps)));
        assert!(matches!(
            time_steps(&config, 5, 80.0, 0.002),
            Err(ScheduleError::InvalidSigmaRange { .. })
        ));
        let config = TimeScheduleConfig {
            schedule_type: TimeScheduleType::Discrete { sigmas: vec![1.0, 0.5] },
            rho: 1.0,
        };
        assert!(matches!(time_steps(&config, 5, 0.6, 0.9), Err(ScheduleError::InvalidSigmaTable)));
    }
}
