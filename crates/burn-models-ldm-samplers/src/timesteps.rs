//! Fast-step timestep plans
//!
//! Maps a step budget onto a subsequence of the training timesteps and
//! yields the reverse traversal order used by the sampling loop.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SamplerError};

/// Spacing of the fast steps over the training timesteps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Discretization {
    /// Evenly spaced: round(linspace(0, T - 1, n))
    #[default]
    Uniform,
    /// Quadratically spaced, denser near t = 0: int(linspace(0, sqrt(0.8 T), n)^2)
    Quad,
}

impl Discretization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uniform => "uniform",
            Self::Quad => "quad",
        }
    }
}

/// `n` evenly spaced values over `[start, stop]`, endpoint included
fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    let step = (stop - start) / (n - 1) as f64;
    let mut values: Vec<f64> = (0..n).map(|i| i as f64 * step + start).collect();
    values[n - 1] = stop;
    values
}

/// One iteration of the reverse traversal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedStep {
    /// Loop iteration, 0 = first (noisiest) step
    pub step: usize,
    /// Row of the fast-schedule tables, counting down to 0
    pub index: usize,
    /// Timestep handed to the models
    pub timestep: usize,
    /// Timestep of the following iteration (the last step repeats its own)
    pub next_timestep: usize,
}

/// Ascending sequence of timesteps visited by a sampling run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepPlan {
    timesteps: Vec<usize>,
}

impl StepPlan {
    /// Plan `steps` fast steps over `num_train_timesteps`
    ///
    /// Timesteps are deduplicated and shifted by one, so uniform plans lie in
    /// `[1, num_train_timesteps]`.
    pub fn new(
        steps: usize,
        discretization: Discretization,
        num_train_timesteps: usize,
    ) -> Result<Self> {
        if steps == 0 || steps > num_train_timesteps {
            return Err(SamplerError::InvalidStepCount {
                steps,
                max: num_train_timesteps,
            });
        }

        let mut timesteps: Vec<usize> = match discretization {
            Discretization::Uniform => linspace(0.0, (num_train_timesteps - 1) as f64, steps)
                .into_iter()
                .map(|v| v.round_ties_even() as usize)
                .collect(),
            Discretization::Quad => {
                linspace(0.0, (num_train_timesteps as f64 * 0.8).sqrt(), steps)
                    .into_iter()
                    .map(|v| (v * v) as usize)
                    .collect()
            }
        };
        timesteps.dedup();

        Ok(Self {
            timesteps: timesteps.into_iter().map(|t| t + 1).collect(),
        })
    }

    /// Plan covering the first `num_timesteps` training timesteps one by one
    pub fn original(num_timesteps: usize) -> Self {
        Self {
            timesteps: (0..num_timesteps).collect(),
        }
    }

    /// Cut the plan down to a proportional prefix for a shorter run
    ///
    /// Slices the already-built plan instead of planning again, so the prefix
    /// keeps the table rows of the full plan. The end index is computed as
    /// `int(min(n / len, 1) * len) - 1` with Python slice semantics, which
    /// drops one more step than requested and wraps for very small `n`.
    pub fn truncated(&self, timesteps: usize) -> Self {
        let len = self.timesteps.len();
        let ratio = (timesteps as f64 / len as f64).min(1.0);
        let end = (ratio * len as f64) as i64 - 1;
        let end = if end < 0 {
            (len as i64 + end).max(0) as usize
        } else {
            end as usize
        };

        Self {
            timesteps: self.timesteps[..end].to_vec(),
        }
    }

    /// Ascending timesteps
    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    pub fn len(&self) -> usize {
        self.timesteps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timesteps.is_empty()
    }

    /// Iterate from the noisiest timestep down to the least noisy one
    pub fn traversal(&self) -> impl Iterator<Item = PlannedStep> + '_ {
        let total = self.timesteps.len();
        (0..total).map(move |i| {
            let next = (i + 1).min(total - 1);
            PlannedStep {
                step: i,
                index: total - i - 1,
                timestep: self.timesteps[total - i - 1],
                next_timestep: self.timesteps[total - next - 1],
            }
        })
    }
}
