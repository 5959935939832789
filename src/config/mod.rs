//! Configuration for the messaging core
//!
//! All tunables in one place with production defaults. The surrounding
//! application owns loading and validation; the core only consumes the
//! structs at construction time.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::ClientConfig;
use crate::scheduler::SchedulerConfig;

/// Pre-key store tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKeyConfig {
    /// Lifetime of a bundle before cleanup removes it
    pub bundle_ttl: Duration,
}

impl Default for PreKeyConfig {
    fn default() -> Self {
        Self {
            bundle_ttl: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

/// Storage node tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Cadence of the expiry/epoch maintenance task
    pub maintenance_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            maintenance_interval: Duration::from_secs(600),
        }
    }
}

/// Long-term key rotation policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    /// How often the rotation ticker scans
    pub check_interval: Duration,
    /// Rotate the identity key once it is older than this
    pub max_key_age: Duration,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(24 * 3600),
            max_key_age: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Aggregate configuration for one peer's messaging core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NightdropConfig {
    pub client: ClientConfig,
    pub scheduler: SchedulerConfig,
    pub prekey: PreKeyConfig,
    pub storage: StorageConfig,
    pub rotation: RotationConfig,
}
