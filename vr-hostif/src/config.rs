//! Datapath tunables.
//!
//! Loaded from JSON; every field has a default so an empty object is a valid
//! configuration. The running datapath holds the config in an `ArcSwap` and
//! it can be replaced while traffic flows.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default GRO input queue bound per virtual interface.
pub const DEFAULT_GRO_QUEUE_LIMIT: usize = 1024;

/// Default poll budget (NAPI weight).
pub const DEFAULT_POLL_BUDGET: usize = 64;

/// Default per-core mailbox depth.
pub const DEFAULT_CORE_BACKLOG: usize = 4096;

/// Default label table size for routers created by the binary.
pub const DEFAULT_MAX_LABELS: usize = 1024;

/// Default interface table size for routers created by the binary.
pub const DEFAULT_MAX_INTERFACES: usize = 256;

/// Complete datapath configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatapathConfig {
    /// Receive packet steering points
    pub steering: SteeringConfig,
    /// GRO queue settings
    pub gro: GroConfig,
    /// Depth of each core's mailbox
    pub core_backlog: usize,
    /// Pin each worker thread to its core
    pub pin_cores: bool,
}

impl Default for DatapathConfig {
    fn default() -> Self {
        Self {
            steering: SteeringConfig::default(),
            gro: GroConfig::default(),
            core_backlog: DEFAULT_CORE_BACKLOG,
            pin_cores: false,
        }
    }
}

/// The three points at which receive work may move to another core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SteeringConfig {
    /// Ingress on physical interfaces, before the forwarding engine.
    pub ingress: SteeringPoint,
    /// After forwarding, before GRO enqueue.
    pub post_forward: SteeringPoint,
    /// GRO stage: records the receive queue used for reinjection.
    pub gro: SteeringPoint,
}

/// A single steering point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SteeringPoint {
    pub enabled: bool,
    /// Always steer to this core instead of hashing.
    pub fixed_core: Option<usize>,
}

impl SteeringPoint {
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            fixed_core: None,
        }
    }

    pub const fn hashed() -> Self {
        Self {
            enabled: true,
            fixed_core: None,
        }
    }

    pub const fn fixed(core: usize) -> Self {
        Self {
            enabled: true,
            fixed_core: Some(core),
        }
    }
}

/// What to do when a GRO input queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Reject the arriving frame.
    #[default]
    DropNewest,
    /// Evict the oldest queued frame to make room.
    DropOldest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroConfig {
    pub queue_limit: usize,
    pub overflow: OverflowPolicy,
    pub poll_budget: usize,
}

impl Default for GroConfig {
    fn default() -> Self {
        Self {
            queue_limit: DEFAULT_GRO_QUEUE_LIMIT,
            overflow: OverflowPolicy::default(),
            poll_budget: DEFAULT_POLL_BUDGET,
        }
    }
}

impl DatapathConfig {
    /// Load and validate a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
        let config: DatapathConfig = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check ranges. `cores` is only known once the topology is.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gro.queue_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "gro.queue_limit",
                reason: "must be greater than zero".into(),
            });
        }
        if self.gro.poll_budget == 0 {
            return Err(ConfigError::Invalid {
                field: "gro.poll_budget",
                reason: "must be greater than zero".into(),
            });
        }
        if self.core_backlog == 0 {
            return Err(ConfigError::Invalid {
                field: "core_backlog",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    /// Check that fixed-core overrides name existing cores.
    pub fn validate_for_cores(&self, cores: usize) -> Result<(), ConfigError> {
        self.validate()?;
        let points = [
            ("steering.ingress.fixed_core", &self.steering.ingress),
            ("steering.post_forward.fixed_core", &self.steering.post_forward),
            ("steering.gro.fixed_core", &self.steering.gro),
        ];
        for (field, point) in points {
            if let Some(core) = point.fixed_core
                && core >= cores
            {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("core {core} out of range ({cores} cores)"),
                });
            }
        }
        Ok(())
    }
}
