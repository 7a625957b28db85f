//! Tunables for every layer.
//!
//! All structs deserialize from JSON with missing fields falling back to
//! their defaults, so a host can ship a partial options document.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Per-port settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// Deadline applied by [`NanoPort::request`](crate::NanoPort::request).
    pub request_timeout_ms: u64,
}

impl PortConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
        }
    }
}

/// How the KVS client retries requests that failed in transit.
///
/// Attempt `n` (1-based) that fails with a transport error is followed by
/// a pause of `n * backoff_step_ms` before the next attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_step_ms: u64,
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_step_ms.saturating_mul(u64::from(attempt)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_step_ms: 100,
        }
    }
}

/// KVS service settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Keys removed (and broadcast) per step of `delete_all`.
    pub delete_batch_size: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            delete_batch_size: 100,
        }
    }
}

/// KVS cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Keys per fetch or flush request.
    pub batch_size: usize,
    /// Consecutive failed I/O cycles before the cache goes memory-only.
    pub max_io_crashes: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            max_io_crashes: 3,
        }
    }
}

/// Everything above in one document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub port: PortConfig,
    pub retry: RetryPolicy,
    pub service: ServiceConfig,
    pub cache: CacheConfig,
}

impl SyncConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
