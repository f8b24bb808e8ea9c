//! Processor configuration.
//!
//! ## Environment Variables
//!
//! [`ProcessorOptions::from_env`] reads:
//!
//! - `PROCESSOR_STRATEGY`: `balanced` or `greedy` (default: balanced)
//! - `PROCESSOR_UPDATE_INTERVAL_MS`: milliseconds between load balancing cycles (default: 10000)
//! - `PROCESSOR_PARTITION_EXPIRATION_MS`: milliseconds before an unrenewed ownership
//!   is up for grabs (default: 60000)
//! - `PROCESSOR_PREFETCH`: events to prefetch per partition (default: 300)
//! - `PROCESSOR_MAX_PARTITIONS`: only balance the first N partitions, 0 = all (default: 0)
//! - `PROCESSOR_START_POSITION`: `earliest` or `latest`, used for partitions without
//!   a checkpoint (default: latest)
//!
//! Unknown strategy or start position names and malformed numbers are
//! configuration errors, never silently replaced by a default.

use crate::error::{ProcessorError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default time between load balancing cycles
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

/// Default time before an unrenewed ownership expires
pub const DEFAULT_PARTITION_EXPIRATION: Duration = Duration::from_secs(60);

/// Default number of events to prefetch per partition
pub const DEFAULT_PREFETCH: u32 = 300;

/// How aggressively a processor takes partitions when it is below its fair share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessorStrategy {
    /// At most one free partition and one stolen partition per cycle.
    #[default]
    Balanced,

    /// Everything needed to reach the fair share in a single cycle.
    Greedy,
}

impl FromStr for ProcessorStrategy {
    type Err = ProcessorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "balanced" => Ok(ProcessorStrategy::Balanced),
            "greedy" => Ok(ProcessorStrategy::Greedy),
            other => Err(ProcessorError::Configuration(format!(
                "unknown load balancing strategy '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for ProcessorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessorStrategy::Balanced => write!(f, "balanced"),
            ProcessorStrategy::Greedy => write!(f, "greedy"),
        }
    }
}

/// Where reading starts in a partition.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StartPosition {
    /// Oldest retained event
    Earliest,

    /// Only events enqueued after the receiver opens
    #[default]
    Latest,

    Offset {
        offset: i64,
        inclusive: bool,
    },

    SequenceNumber {
        sequence_number: i64,
        inclusive: bool,
    },

    EnqueuedTime {
        time: DateTime<Utc>,
        inclusive: bool,
    },
}

impl FromStr for StartPosition {
    type Err = ProcessorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" => Ok(StartPosition::Earliest),
            "latest" => Ok(StartPosition::Latest),
            other => Err(ProcessorError::Configuration(format!(
                "unknown start position '{}'",
                other
            ))),
        }
    }
}

/// Start positions for partitions that have no checkpoint yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartPositions {
    /// Overrides for individual partitions
    pub per_partition: HashMap<String, StartPosition>,

    /// Used for every partition without an override
    pub default: StartPosition,
}

impl StartPositions {
    /// Start position for a partition that has no checkpoint.
    pub fn for_partition(&self, partition_id: &str) -> StartPosition {
        self.per_partition
            .get(partition_id)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// Processor configuration
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    /// Partition selection strategy (default: Balanced)
    pub load_balancing_strategy: ProcessorStrategy,

    /// Time between load balancing cycles (default: 10s)
    pub update_interval: Duration,

    /// Ownerships not renewed within this duration are considered abandoned (default: 60s)
    pub partition_expiration_duration: Duration,

    /// Start positions for partitions without a checkpoint
    pub start_positions: StartPositions,

    /// Events to prefetch per partition, handed to partition clients (default: 300)
    pub prefetch: u32,

    /// Only balance the first N partitions of the event hub, 0 = all (default: 0)
    pub maximum_number_of_partitions: usize,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            load_balancing_strategy: ProcessorStrategy::Balanced,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            partition_expiration_duration: DEFAULT_PARTITION_EXPIRATION,
            start_positions: StartPositions::default(),
            prefetch: DEFAULT_PREFETCH,
            maximum_number_of_partitions: 0,
        }
    }
}

impl ProcessorOptions {
    /// Options from `PROCESSOR_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Options from an arbitrary key lookup, missing keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = Self::default();

        if let Some(strategy) = lookup("PROCESSOR_STRATEGY") {
            options.load_balancing_strategy = strategy.parse()?;
        }

        if let Some(ms) = parse_key::<u64, _>(&lookup, "PROCESSOR_UPDATE_INTERVAL_MS")? {
            options.update_interval = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_key::<u64, _>(&lookup, "PROCESSOR_PARTITION_EXPIRATION_MS")? {
            options.partition_expiration_duration = Duration::from_millis(ms);
        }

        if let Some(prefetch) = parse_key::<u32, _>(&lookup, "PROCESSOR_PREFETCH")? {
            options.prefetch = prefetch;
        }

        if let Some(max) = parse_key::<usize, _>(&lookup, "PROCESSOR_MAX_PARTITIONS")? {
            options.maximum_number_of_partitions = max;
        }

        if let Some(position) = lookup("PROCESSOR_START_POSITION") {
            options.start_positions.default = position.parse()?;
        }

        Ok(options)
    }
}

/// Parse a numeric key; a present but malformed value is an error
fn parse_key<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr<Err = std::num::ParseIntError>,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| {
                ProcessorError::Configuration(format!("invalid {} '{}': {}", key, raw, e))
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let options = ProcessorOptions::default();
        assert_eq!(options.load_balancing_strategy, ProcessorStrategy::Balanced);
        assert_eq!(options.update_interval, Duration::from_secs(10));
        assert_eq!(options.partition_expiration_duration, Duration::from_secs(60));
        assert_eq!(options.prefetch, 300);
        assert_eq!(options.maximum_number_of_partitions, 0);
        assert_eq!(options.start_positions.default, StartPosition::Latest);
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("Greedy".parse::<ProcessorStrategy>().unwrap(), ProcessorStrategy::Greedy);
        assert_eq!(" balanced ".parse::<ProcessorStrategy>().unwrap(), ProcessorStrategy::Balanced);

        let err = "round-robin".parse::<ProcessorStrategy>().unwrap_err();
        assert!(err.is_fatal(), "unknown strategy must be a configuration error");
    }

    #[test]
    fn test_from_lookup() {
        let options = ProcessorOptions::from_lookup(lookup_from(&[
            ("PROCESSOR_STRATEGY", "greedy"),
            ("PROCESSOR_UPDATE_INTERVAL_MS", "250"),
            ("PROCESSOR_PARTITION_EXPIRATION_MS", "5000"),
            ("PROCESSOR_MAX_PARTITIONS", "4"),
            ("PROCESSOR_START_POSITION", "earliest"),
        ]))
        .unwrap();

        assert_eq!(options.load_balancing_strategy, ProcessorStrategy::Greedy);
        assert_eq!(options.update_interval, Duration::from_millis(250));
        assert_eq!(options.partition_expiration_duration, Duration::from_secs(5));
        assert_eq!(options.maximum_number_of_partitions, 4);
        assert_eq!(options.prefetch, 300);
        assert_eq!(options.start_positions.default, StartPosition::Earliest);
    }

    #[test]
    fn test_from_lookup_rejects_unknown_strategy() {
        let result = ProcessorOptions::from_lookup(lookup_from(&[("PROCESSOR_STRATEGY", "sticky")]));
        assert!(matches!(result, Err(ProcessorError::Configuration(_))));
    }

    #[test]
    fn test_from_lookup_rejects_bad_number() {
        for key in [
            "PROCESSOR_UPDATE_INTERVAL_MS",
            "PROCESSOR_PARTITION_EXPIRATION_MS",
            "PROCESSOR_PREFETCH",
            "PROCESSOR_MAX_PARTITIONS",
        ] {
            let result = ProcessorOptions::from_lookup(lookup_from(&[(key, "10s")]));
            match result {
                Err(ProcessorError::Configuration(msg)) => {
                    assert!(msg.contains(key), "{}", msg);
                    assert!(msg.contains("10s"), "{}", msg);
                }
                other => panic!("{} accepted a malformed value: {:?}", key, other),
            }
        }

        let result =
            ProcessorOptions::from_lookup(lookup_from(&[("PROCESSOR_PREFETCH", "-1")]));
        assert!(matches!(result, Err(ProcessorError::Configuration(_))));
    }

    #[test]
    fn test_start_position_overrides() {
        let mut positions = StartPositions {
            default: StartPosition::Earliest,
            ..Default::default()
        };
        positions.per_partition.insert(
            "1".to_string(),
            StartPosition::SequenceNumber {
                sequence_number: 7,
                inclusive: true,
            },
        );

        assert_eq!(positions.for_partition("0"), StartPosition::Earliest);
        assert_eq!(
            positions.for_partition("1"),
            StartPosition::SequenceNumber {
                sequence_number: 7,
                inclusive: true
            }
        );
    }
}
