#[cfg(test)]
#[path = "../tests/unit/sampler_test.rs"]
mod sampler_test;

use crate::error::LlamaError;
use crate::layers::softmax;
use anyhow::Result;

/// Replaces a zero seed, which would keep the xorshift state at zero forever.
const FALLBACK_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

/// Stores a probability and its associated index (token id).
#[derive(Clone, Debug)]
pub struct ProbIndex {
    pub prob: f32,
    pub index: usize,
}

/// How a [`Sampler`] picks the next token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplingStrategy {
    /// Highest logit, lowest index on ties.
    Greedy,
    /// Draw from the full temperature-scaled distribution.
    Categorical,
    /// Draw from the smallest high-probability prefix reaching the given mass.
    TopP(f32),
}

/// Top-p/temperature sampler for language model logits.
///
/// This struct implements temperature scaling, top-p (nucleus) sampling,
/// and multinomial sampling, using a simple xorshift RNG for reproducibility.
#[derive(Debug)]
pub struct Sampler {
    probindex: Vec<ProbIndex>,
    temperature: f32,
    topp: f32,
    rng_state: u64,
}

impl Sampler {
    /// Creates a new sampler with the given vocabulary size, temperature, top-p, and RNG seed.
    ///
    /// # Arguments
    /// * `vocab_size` - Size of the vocabulary
    /// * `temperature` - Temperature for sampling (typical range: 0.1-2.0, 0.0 for greedy)
    /// * `topp` - Top-p threshold (0.0-1.0; values at either end disable top-p)
    /// * `rng_seed` - Random seed for reproducibility
    pub fn new(vocab_size: usize, temperature: f32, topp: f32, rng_seed: u64) -> Result<Self> {
        if vocab_size == 0 {
            anyhow::bail!(LlamaError::InvalidRequest("Vocab size must be positive".to_string()));
        }
        if !(temperature >= 0.0) || !temperature.is_finite() {
            anyhow::bail!(LlamaError::InvalidRequest(format!("Temperature must be non-negative, got {temperature}")));
        }
        if !(0.0..=1.0).contains(&topp) {
            anyhow::bail!(LlamaError::InvalidRequest(format!("Top-p must be between 0.0 and 1.0, got {topp}")));
        }

        Ok(Self {
            probindex: vec![ProbIndex { prob: 0.0, index: 0 }; vocab_size],
            temperature,
            topp,
            rng_state: if rng_seed == 0 { FALLBACK_SEED } else { rng_seed },
        })
    }

    pub fn strategy(&self) -> SamplingStrategy {
        if self.temperature == 0.0 {
            SamplingStrategy::Greedy
        } else if self.topp <= 0.0 || self.topp >= 1.0 {
            SamplingStrategy::Categorical
        } else {
            SamplingStrategy::TopP(self.topp)
        }
    }

    /// Xorshift-based random number generator.
    fn random_u32(&mut self) -> u32 {
        self.rng_state ^= self.rng_state >> 12;
        self.rng_state ^= self.rng_state << 25;
        self.rng_state ^= self.rng_state >> 27;
        ((self.rng_state.wrapping_mul(0x2545F4914F6CDD1D)) >> 32) as u32
    }

    /// Returns a random float in [0, 1).
    fn random_f32(&mut self) -> f32 {
        (self.random_u32() >> 8) as f32 / 16777216.0
    }

    /// Samples a token index from logits using temperature and top-p.
    ///
    /// - If temperature is 0, returns the argmax (greedy).
    /// - Otherwise, scales by temperature and applies softmax in place, then
    ///   draws with top-p or multinomial sampling.
    pub fn sample(&mut self, logits: &mut [f32]) -> usize {
        match self.strategy() {
            SamplingStrategy::Greedy => sample_argmax(logits),
            strategy => {
                for logit in logits.iter_mut() {
                    *logit /= self.temperature;
                }
                softmax(logits);

                let coin = self.random_f32();
                match strategy {
                    SamplingStrategy::TopP(topp) => sample_topp(logits, topp, coin, &mut self.probindex),
                    _ => sample_mult(logits, coin),
                }
            }
        }
    }
}

/// Returns the index of the maximum logit, the lowest index among equal maxima.
pub fn sample_argmax(logits: &[f32]) -> usize {
    logits
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
            Some((_, best_v)) if v <= best_v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
        .unwrap_or_default()
}

/// Multinomial sampling: the first index whose cumulative probability exceeds `coin`.
pub fn sample_mult(probabilities: &[f32], coin: f32) -> usize {
    let mut cdf = 0.0;
    for (i, &prob) in probabilities.iter().enumerate() {
        cdf += prob;
        if coin < cdf {
            return i;
        }
    }
    probabilities.len().saturating_sub(1)
}

/// Top-p (nucleus) sampling: sample from the smallest set of most likely
/// tokens whose cumulative probability reaches `topp`.
///
/// `probindex` is scratch space with room for every token.
pub fn sample_topp(probabilities: &[f32], topp: f32, coin: f32, probindex: &mut [ProbIndex]) -> usize {
    // tokens below the cutoff can never be part of the nucleus
    let cutoff = (1.0 - topp) / (probabilities.len().saturating_sub(1).max(1)) as f32;
    let mut n0 = 0;

    for (i, &prob) in probabilities.iter().enumerate() {
        if prob >= cutoff {
            probindex[n0] = ProbIndex { prob, index: i };
            n0 += 1;
        }
    }

    if n0 == 0 {
        return sample_argmax(probabilities);
    }

    // Sort by probability (descending), stable on index
    probindex[..n0].sort_by(|a, b| b.prob.total_cmp(&a.prob));

    // Find truncation point
    let mut cumulative_prob = 0.0;
    let mut last_idx = n0.saturating_sub(1);
    for (i, entry) in probindex[..n0].iter().enumerate() {
        cumulative_prob += entry.prob;
        if cumulative_prob >= topp {
            last_idx = i;
            break;
        }
    }

    // Sample from truncated list
    let r = coin * cumulative_prob;
    let mut cdf = 0.0;
    for entry in &probindex[..=last_idx] {
        cdf += entry.prob;
        if r < cdf {
            return entry.index;
        }
    }
    probindex[last_idx].index
}
