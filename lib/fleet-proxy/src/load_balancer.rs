//! Load balancing strategies for distributing traffic across route targets

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Upper bound on the precomputed weighted schedule
const MAX_WHEEL_SIZE: usize = 1024;

/// Load balancing strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Round-robin: distribute requests evenly across targets
    RoundRobin,
    /// Weighted: distribute requests in proportion to target weights
    Weighted,
}

impl Default for LoadBalancingStrategy {
    fn default() -> Self {
        LoadBalancingStrategy::RoundRobin
    }
}

/// Selects target indices for one route.
///
/// Selection is a single atomic increment plus a table lookup, so it is safe
/// under concurrent dispatch and constant time.
#[derive(Debug)]
pub struct LoadBalancer {
    len: usize,
    /// Smooth weighted round-robin schedule; empty for plain round-robin
    wheel: Vec<usize>,
    counter: AtomicUsize,
}

impl LoadBalancer {
    /// Create a balancer for targets with the given weights
    pub fn new(strategy: LoadBalancingStrategy, weights: &[u32]) -> Self {
        let wheel = match strategy {
            LoadBalancingStrategy::Weighted if weights.len() > 1 => Self::build_wheel(weights),
            _ => Vec::new(),
        };
        Self {
            len: weights.len(),
            wheel,
            counter: AtomicUsize::new(0),
        }
    }

    /// Index of the next target, `None` when there are no targets
    pub fn next_index(&self) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        let current = self.counter.fetch_add(1, Ordering::Relaxed);
        if self.wheel.is_empty() {
            Some(current % self.len)
        } else {
            Some(self.wheel[current % self.wheel.len()])
        }
    }

    /// Precompute one full cycle of smooth weighted round-robin.
    ///
    /// Weights are reduced by their gcd and scaled down if the cycle would
    /// exceed `MAX_WHEEL_SIZE`. A zero weight is treated as one.
    fn build_wheel(weights: &[u32]) -> Vec<usize> {
        let mut effective: Vec<u64> = weights.iter().map(|w| u64::from((*w).max(1))).collect();

        let divisor = effective.iter().copied().fold(0, gcd);
        for w in effective.iter_mut() {
            *w /= divisor;
        }

        let total: u64 = effective.iter().sum();
        if total > MAX_WHEEL_SIZE as u64 {
            for w in effective.iter_mut() {
                *w = (*w * MAX_WHEEL_SIZE as u64 / total).max(1);
            }
        }
        let total: u64 = effective.iter().sum();

        let mut current = vec![0i64; effective.len()];
        let mut wheel = Vec::with_capacity(total as usize);
        for _ in 0..total {
            for (c, w) in current.iter_mut().zip(&effective) {
                *c += *w as i64;
            }
            let (pick, _) = current
                .iter()
                .enumerate()
                .max_by(|(ia, a), (ib, b)| a.cmp(b).then(ib.cmp(ia)))
                .unwrap_or((0, &0));
            current[pick] -= total as i64;
            wheel.push(pick);
        }
        wheel
    }
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}
