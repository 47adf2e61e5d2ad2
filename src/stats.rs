//! Tracking of per-chain and per-run sampling statistics: acceptance
//! probability, divergence counts and tree depth.

use core::fmt;
use num_traits::ToPrimitive;
use std::error::Error;

/// Exponential-moving-average weight for the state-based acceptance estimate.
const ALPHA: f32 = 0.01;

/// Snapshot of one chain's statistics, sent to the progress aggregator.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainStats {
    /// Number of steps taken.
    pub n: u64,
    /// Estimated acceptance probability.
    pub p_accept: f32,
    /// Number of divergent transitions (zero for samplers without a
    /// divergence notion).
    pub n_divergent: u64,
    /// Mean tree depth (zero for samplers without trajectory doubling).
    pub mean_depth: f32,
}

/// Tracks acceptance for a generic Markov chain by watching state changes.
///
/// Knows nothing about the sampler; a step whose state differs from the
/// previous one counts as an acceptance. Samplers that report their own
/// acceptance statistic should use [`NutsTracker`] instead.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainTracker {
    n_params: usize,
    n: u64,
    p_accept: f32,
    last_state: Vec<f32>,
}

impl ChainTracker {
    pub fn new<T>(n_params: usize, initial_state: &[T]) -> Self
    where
        T: ToPrimitive + Clone,
    {
        let last_state = initial_state
            .iter()
            .map(|x| {
                x.to_f32()
                    .expect("expected conversion of state elements to f32 to succeed")
            })
            .collect();
        Self {
            n_params,
            n: 0,
            p_accept: -1.0,
            last_state,
        }
    }

    /// Updates the tracker with the chain's new state.
    pub fn step<T>(&mut self, x: &[T]) -> Result<(), Box<dyn Error>>
    where
        T: ToPrimitive + Clone,
    {
        if x.len() != self.n_params {
            return Err(format!(
                "expected state of length {}, got {}",
                self.n_params,
                x.len()
            )
            .into());
        }
        self.n += 1;

        let mut moved = false;
        for (a, b) in x.iter().zip(self.last_state.iter()) {
            let a = a
                .to_f32()
                .expect("expected conversion of state elements to f32 to succeed");
            if a != *b {
                moved = true;
                break;
            }
        }
        let accepted = moved as i32 as f32;

        // Seed the average with the first observation, then decay.
        if self.p_accept < 0.0 {
            self.p_accept = accepted;
        } else {
            self.p_accept = (1.0 - ALPHA) * self.p_accept + ALPHA * accepted;
        }

        for (b, a) in self.last_state.iter_mut().zip(x.iter()) {
            *b = a
                .to_f32()
                .expect("expected conversion of state elements to f32 to succeed");
        }
        Ok(())
    }

    pub fn stats(&self) -> ChainStats {
        ChainStats {
            n: self.n,
            p_accept: self.p_accept.max(0.0),
            n_divergent: 0,
            mean_depth: 0.0,
        }
    }
}

/// Tracks the diagnostics a NUTS transition reports directly: acceptance
/// statistic, tree depth, divergence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NutsTracker {
    n: u64,
    sum_accept: f64,
    n_divergent: u64,
    sum_depth: u64,
}

impl NutsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, accept_prob: f64, depth: usize, divergent: bool) {
        self.n += 1;
        self.sum_accept += accept_prob;
        self.sum_depth += depth as u64;
        if divergent {
            self.n_divergent += 1;
        }
    }

    pub fn stats(&self) -> ChainStats {
        let n = self.n.max(1) as f64;
        ChainStats {
            n: self.n,
            p_accept: (self.sum_accept / n) as f32,
            n_divergent: self.n_divergent,
            mean_depth: (self.sum_depth as f64 / n) as f32,
        }
    }
}

/// Aggregated statistics of one sampling run across all chains.
#[derive(Debug, Clone, PartialEq)]
pub struct RunStats {
    /// Total steps across chains.
    pub n: u64,
    /// Mean acceptance probability across chains.
    pub p_accept: f32,
    /// Total number of divergent transitions.
    pub n_divergent: u64,
    /// Mean tree depth across chains.
    pub mean_depth: f32,
}

impl RunStats {
    pub fn from_chain_stats(stats: &[ChainStats]) -> Self {
        let k = stats.len().max(1) as f32;
        Self {
            n: stats.iter().map(|s| s.n).sum(),
            p_accept: stats.iter().map(|s| s.p_accept).sum::<f32>() / k,
            n_divergent: stats.iter().map(|s| s.n_divergent).sum(),
            mean_depth: stats.iter().map(|s| s.mean_depth).sum::<f32>() / k,
        }
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "n={} p(accept)≈{:.3} divergent={} mean(depth)≈{:.2}",
            self.n, self.p_accept, self.n_divergent, self.mean_depth
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_tracker_counts_moves() {
        let mut tracker = ChainTracker::new(2, &[0.0_f64, 0.0]);
        tracker.step(&[1.0_f64, 0.0]).unwrap();
        assert_eq!(tracker.stats().p_accept, 1.0);
        // A long run of rejections decays the estimate.
        for _ in 0..500 {
            tracker.step(&[1.0_f64, 0.0]).unwrap();
        }
        let p = tracker.stats().p_accept;
        assert!(p < 0.05, "estimate failed to decay: {p}");
    }

    #[test]
    fn chain_tracker_rejects_wrong_length() {
        let mut tracker = ChainTracker::new(2, &[0.0_f64, 0.0]);
        assert!(tracker.step(&[0.0_f64]).is_err());
    }

    #[test]
    fn nuts_tracker_averages_reports() {
        let mut tracker = NutsTracker::new();
        tracker.record(0.8, 3, false);
        tracker.record(0.6, 5, true);
        let stats = tracker.stats();
        assert_eq!(stats.n, 2);
        assert!((stats.p_accept - 0.7).abs() < 1e-6);
        assert_eq!(stats.n_divergent, 1);
        assert!((stats.mean_depth - 4.0).abs() < 1e-6);
    }

    #[test]
    fn run_stats_aggregate_across_chains() {
        let a = ChainStats {
            n: 10,
            p_accept: 0.9,
            n_divergent: 1,
            mean_depth: 3.0,
        };
        let b = ChainStats {
            n: 20,
            p_accept: 0.7,
            n_divergent: 2,
            mean_depth: 5.0,
        };
        let run = RunStats::from_chain_stats(&[a, b]);
        assert_eq!(run.n, 30);
        assert!((run.p_accept - 0.8).abs() < 1e-6);
        assert_eq!(run.n_divergent, 3);
        assert!((run.mean_depth - 4.0).abs() < 1e-6);
        let text = run.to_string();
        assert!(text.contains("divergent=3"));
    }
}
