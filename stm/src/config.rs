// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Configuration of the transactional memory: which contention manager every worker runs, how
//! the managers are tuned, how failed atomic blocks are retried and how many workers run them.
//!
//! ```
//! use ofree_stm::{Policy, StmConfig};
//!
//! let config = StmConfig::default().with_policy(Policy::Greedy).with_threads(2);
//! assert_eq!(config.policy, Policy::Greedy);
//! ```

use crate::{
    BackoffManager, ConfigError, ContentionManager, EruptionManager, GreedyManager, KarmaManager,
    KindergartenManager, SeniorityManager,
};
use std::{fmt, str::FromStr, sync::Arc, time::Duration};

pub const ENV_CONTENTION_MANAGER: &str = "STM_CONTENTION_MANAGER";
pub const ENV_THREADS: &str = "STM_THREADS";
pub const ENV_MAX_NESTING_DEPTH: &str = "STM_MAX_NESTING_DEPTH";
pub const ENV_STRATEGY: &str = "STM_STRATEGY";

pub const DEFAULT_MAX_NESTING_DEPTH: usize = 100;

/// Available contention management policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Policy {
    Backoff,
    Karma,
    Eruption,
    Greedy,
    Kindergarten,
    Seniority,
}

impl Policy {
    pub const ALL: [Policy; 6] = [
        Policy::Backoff,
        Policy::Karma,
        Policy::Eruption,
        Policy::Greedy,
        Policy::Kindergarten,
        Policy::Seniority,
    ];

    /// Creates a fresh manager running this policy. Every worker needs its own.
    pub fn build(&self, tuning: &ManagerTuning) -> Arc<dyn ContentionManager> {
        match self {
            Policy::Backoff => Arc::new(BackoffManager::new(tuning)),
            Policy::Karma => Arc::new(KarmaManager::new(tuning)),
            Policy::Eruption => Arc::new(EruptionManager::new(tuning)),
            Policy::Greedy => Arc::new(GreedyManager::new(tuning)),
            Policy::Kindergarten => Arc::new(KindergartenManager::new(tuning)),
            Policy::Seniority => Arc::new(SeniorityManager::new(tuning)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Policy::Backoff => "backoff",
            Policy::Karma => "karma",
            Policy::Eruption => "eruption",
            Policy::Greedy => "greedy",
            Policy::Kindergarten => "kindergarten",
            Policy::Seniority => "seniority",
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Policy::Backoff
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Policy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Policy::ALL
            .iter()
            .find(|p| p.name() == wanted)
            .copied()
            .ok_or_else(|| ConfigError::UnknownPolicy(s.to_string()))
    }
}

/// What to do when an atomic block has been aborted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Give up on the first abort
    Abort,

    /// Run the atomic block again until it commits
    Retry,

    /// Run the atomic block again, spinning on a fresh [`crate::BusyBreaker`] between attempts.
    /// Gives up once the breaker trips.
    RetryWithBreaker,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::Retry
    }
}

impl FromStr for Strategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(Strategy::Abort),
            "retry" => Ok(Strategy::Retry),
            "breaker" | "retry-with-breaker" => Ok(Strategy::RetryWithBreaker),
            _ => Err(ConfigError::InvalidValue {
                key: ENV_STRATEGY,
                value: s.to_string(),
            }),
        }
    }
}

/// Tunables of the contention management policies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerTuning {
    /// Backoff sleeps for a random fraction of `2^k` microseconds, `k` starting here
    pub backoff_min_log: u32,

    /// Upper bound for the backoff exponent
    pub backoff_max_log: u32,

    /// Number of consecutive conflicts after which Backoff aborts the other transaction
    pub backoff_max_retries: u32,

    /// Karma and Eruption sleep this long between attempts
    pub karma_interval: Duration,

    /// Hard bound on the attempts of Karma and Eruption, whatever the priority gap
    pub karma_max_attempts: i64,

    pub kindergarten_tries: u32,
    pub kindergarten_interval: Duration,

    /// Greedy blocks on the other transaction in slices of this length, re-checking its own status in between
    pub greedy_wait_slice: Duration,

    /// Seniority backs off for at most `2^seniority_max_steps` units
    pub seniority_max_steps: u32,
    pub seniority_unit: Duration,
}

impl Default for ManagerTuning {
    fn default() -> Self {
        Self {
            backoff_min_log: 4,
            backoff_max_log: 20,
            backoff_max_retries: 22,
            karma_interval: Duration::from_micros(16),
            karma_max_attempts: 4096,
            kindergarten_tries: 8,
            kindergarten_interval: Duration::from_micros(16),
            greedy_wait_slice: Duration::from_millis(1),
            seniority_max_steps: 10,
            seniority_unit: Duration::from_micros(10),
        }
    }
}

/// Top level configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StmConfig {
    pub policy: Policy,
    pub tuning: ManagerTuning,
    pub strategy: Strategy,
    pub max_nesting_depth: usize,

    /// Number of worker threads of a [`crate::TaskRunner`]
    pub threads: usize,
}

impl Default for StmConfig {
    fn default() -> Self {
        Self {
            policy: Policy::default(),
            tuning: ManagerTuning::default(),
            strategy: Strategy::default(),
            max_nesting_depth: DEFAULT_MAX_NESTING_DEPTH,
            threads: num_cpus::get(),
        }
    }
}

impl StmConfig {
    /// Default configuration, overridden by the `STM_*` environment variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides looked up by environment variable name.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_CONTENTION_MANAGER) {
            self.policy = value.parse()?;
        }
        if let Some(value) = lookup(ENV_STRATEGY) {
            self.strategy = value.parse()?;
        }
        if let Some(value) = lookup(ENV_THREADS) {
            self.threads = parse_positive(ENV_THREADS, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_NESTING_DEPTH) {
            self.max_nesting_depth = parse_positive(ENV_MAX_NESTING_DEPTH, &value)?;
        }
        Ok(self)
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_tuning(mut self, tuning: ManagerTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_nesting_depth(mut self, depth: usize) -> Self {
        self.max_nesting_depth = depth;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Creates a manager for one worker
    pub fn build_manager(&self) -> Arc<dyn ContentionManager> {
        self.policy.build(&self.tuning)
    }
}

fn parse_positive(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(parsed) if parsed > 0 => Ok(parsed),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_policy_names() {
        for policy in Policy::ALL {
            assert_eq!(policy.to_string().parse::<Policy>(), Ok(policy));
        }
        assert_eq!(" Greedy ".parse::<Policy>(), Ok(Policy::Greedy));
        assert!(matches!("polite".parse::<Policy>(), Err(ConfigError::UnknownPolicy(_))));
    }

    #[test]
    fn test_build_runs_the_requested_policy() {
        let tuning = ManagerTuning::default();
        for policy in Policy::ALL {
            assert_eq!(policy.build(&tuning).policy(), policy);
        }
    }

    #[test]
    fn test_defaults() {
        let config = StmConfig::default();
        assert_eq!(config.policy, Policy::Backoff);
        assert_eq!(config.strategy, Strategy::Retry);
        assert_eq!(config.max_nesting_depth, 100);
        assert!(config.threads > 0);
        assert_eq!(config.tuning.backoff_max_retries, 22);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_CONTENTION_MANAGER, "kindergarten"),
            (ENV_THREADS, "3"),
            (ENV_MAX_NESTING_DEPTH, "12"),
            (ENV_STRATEGY, "breaker"),
        ]
        .into_iter()
        .collect();

        let config = StmConfig::default()
            .with_overrides(|key| env.get(key).map(|v| v.to_string()))
            .expect("Failed to apply overrides");

        assert_eq!(config.policy, Policy::Kindergarten);
        assert_eq!(config.threads, 3);
        assert_eq!(config.max_nesting_depth, 12);
        assert_eq!(config.strategy, Strategy::RetryWithBreaker);
    }

    #[test]
    fn test_invalid_overrides() {
        let result = StmConfig::default().with_overrides(|key| (key == ENV_THREADS).then(|| "0".to_string()));
        assert_eq!(
            result,
            Err(ConfigError::InvalidValue {
                key: ENV_THREADS,
                value: "0".to_string()
            })
        );

        let result =
            StmConfig::default().with_overrides(|key| (key == ENV_CONTENTION_MANAGER).then(|| "polite".to_string()));
        assert!(result.is_err());
    }
}
