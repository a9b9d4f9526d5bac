// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::kernel::DEFAULT_TILE;

/// What a [`crate::LinearContext`] does when a device stage fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log the failing stage and terminate the process.
    #[default]
    Abort,
    /// Hand the error back to the caller.
    Propagate,
}

impl FailurePolicy {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "abort" | "exit" | "fatal" => Some(FailurePolicy::Abort),
            "propagate" | "return" | "error" => Some(FailurePolicy::Propagate),
            _ => None,
        }
    }
}

/// Runtime knobs for the affine forward/backward pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinearConfig {
    /// Edge of the square workgroup tile used by the forward kernel.
    pub tile_size: u32,
    /// Size of a dedicated backward pool; `None` uses the global rayon pool.
    pub worker_threads: Option<usize>,
    /// Run the backward passes sequentially in a fixed order.
    pub deterministic: bool,
    pub failure_policy: FailurePolicy,
}

impl Default for LinearConfig {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE,
            worker_threads: None,
            deterministic: false,
            failure_policy: FailurePolicy::Abort,
        }
    }
}

impl LinearConfig {
    /// Builds a configuration snapshot from the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary variable lookup.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let tile_size = lookup("SPIRAL_LINEAR_TILE")
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|tile| *tile > 0)
            .unwrap_or(defaults.tile_size);

        let worker_threads = lookup("SPIRAL_LINEAR_THREADS")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|threads| *threads > 0);

        let enabled = lookup("SPIRAL_DETERMINISTIC")
            .map(|v| enabled_flag(&v))
            .unwrap_or(false);
        let deterministic = lookup("SPIRAL_DETERMINISTIC_REDUCTION")
            .map(|v| enabled_flag(&v))
            .unwrap_or(enabled);

        let failure_policy = lookup("SPIRAL_LINEAR_ON_DEVICE_ERROR")
            .and_then(|v| FailurePolicy::parse(&v))
            .unwrap_or(defaults.failure_policy);

        Self {
            tile_size,
            worker_threads,
            deterministic,
            failure_policy,
        }
    }

    pub fn with_tile_size(mut self, tile_size: u32) -> Self {
        self.tile_size = tile_size;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads);
        self
    }

    pub fn with_deterministic(mut self, deterministic: bool) -> Self {
        self.deterministic = deterministic;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }
}

fn enabled_flag(raw: &str) -> bool {
    matches!(raw.trim(), "1" | "true" | "True" | "TRUE" | "on" | "ON")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_matches_defaults() {
        let cfg = LinearConfig::from_vars(lookup(&[]));
        assert_eq!(cfg, LinearConfig::default());
        assert_eq!(cfg.tile_size, DEFAULT_TILE);
        assert_eq!(cfg.failure_policy, FailurePolicy::Abort);
    }

    #[test]
    fn explicit_values_override_defaults() {
        let cfg = LinearConfig::from_vars(lookup(&[
            ("SPIRAL_LINEAR_TILE", "8"),
            ("SPIRAL_LINEAR_THREADS", "3"),
            ("SPIRAL_DETERMINISTIC_REDUCTION", "on"),
            ("SPIRAL_LINEAR_ON_DEVICE_ERROR", "Propagate"),
        ]));
        assert_eq!(cfg.tile_size, 8);
        assert_eq!(cfg.worker_threads, Some(3));
        assert!(cfg.deterministic);
        assert_eq!(cfg.failure_policy, FailurePolicy::Propagate);
    }

    #[test]
    fn global_determinism_implies_sequential_reduction() {
        let cfg = LinearConfig::from_vars(lookup(&[("SPIRAL_DETERMINISTIC", "1")]));
        assert!(cfg.deterministic);

        let cfg = LinearConfig::from_vars(lookup(&[
            ("SPIRAL_DETERMINISTIC", "1"),
            ("SPIRAL_DETERMINISTIC_REDUCTION", "off"),
        ]));
        assert!(!cfg.deterministic);
    }

    #[test]
    fn malformed_values_fall_back() {
        let cfg = LinearConfig::from_vars(lookup(&[
            ("SPIRAL_LINEAR_TILE", "0"),
            ("SPIRAL_LINEAR_THREADS", "many"),
            ("SPIRAL_LINEAR_ON_DEVICE_ERROR", "shrug"),
        ]));
        assert_eq!(cfg.tile_size, DEFAULT_TILE);
        assert_eq!(cfg.worker_threads, None);
        assert_eq!(cfg.failure_policy, FailurePolicy::Abort);
    }
}
