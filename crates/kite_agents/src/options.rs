//! Agent options.
//!
//! Options are built once, wrapped in an `Arc` and shared read-only with the
//! agent. Several prefix pairs may be configured, but only the first (the
//! *active* one) is ever used; the rest are kept as standby entries and
//! reported at start.

use std::time::Duration;

use kite_network::Name;
use kite_network::serde_helpers::duration_ms;
use serde::{Deserialize, Serialize};

use crate::error::OptionsError;
use crate::messages::PrefixPair;

/// Default period between automatic update requests.
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_millis(3000);

/// Default lifetime of an update request, also used as the requested
/// announcement expiration.
pub const DEFAULT_REQUEST_LIFETIME: Duration = Duration::from_millis(4000);

/// Exponential backoff applied to failed automatic updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Consecutive failures retried before falling back to the regular
    /// update interval. Zero disables retries.
    pub max_retries: u32,
    #[serde(rename = "initial_backoff_ms", with = "duration_ms")]
    pub initial_backoff: Duration,
    #[serde(rename = "max_backoff_ms", with = "duration_ms")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), or `None` once the
    /// retry budget is spent.
    pub fn backoff(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_retries {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        Some(self.initial_backoff.saturating_mul(factor).min(self.max_backoff))
    }
}

/// Options for a [`crate::MobileProducerAgent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerOptions {
    active_pair: PrefixPair,
    standby_pairs: Vec<PrefixPair>,
    update_interval: Duration,
    request_lifetime: Duration,
    auto_renew: bool,
    retry: RetryPolicy,
}

impl ProducerOptions {
    pub fn new(active_pair: PrefixPair) -> Self {
        Self {
            active_pair,
            standby_pairs: Vec::new(),
            update_interval: DEFAULT_UPDATE_INTERVAL,
            request_lifetime: DEFAULT_REQUEST_LIFETIME,
            auto_renew: false,
            retry: RetryPolicy::default(),
        }
    }

    /// Build from an ordered list of pairs; the first becomes active.
    pub fn from_pairs(pairs: impl IntoIterator<Item = PrefixPair>) -> Result<Self, OptionsError> {
        let mut pairs = pairs.into_iter();
        let active = pairs.next().ok_or(OptionsError::NoPrefixPair)?;
        let mut options = Self::new(active);
        options.standby_pairs = pairs.collect();
        Ok(options)
    }

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn with_request_lifetime(mut self, lifetime: Duration) -> Self {
        self.request_lifetime = lifetime;
        self
    }

    pub fn with_auto_renew(mut self, auto_renew: bool) -> Self {
        self.auto_renew = auto_renew;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.update_interval.is_zero() {
            return Err(OptionsError::ZeroDuration("update interval"));
        }
        if self.request_lifetime.is_zero() {
            return Err(OptionsError::ZeroDuration("request lifetime"));
        }
        Ok(())
    }

    pub fn active_pair(&self) -> &PrefixPair {
        &self.active_pair
    }

    pub fn standby_pairs(&self) -> &[PrefixPair] {
        &self.standby_pairs
    }

    /// Name the producer registers and signs under.
    pub fn producer_prefix(&self) -> Name {
        self.active_pair.producer_prefix()
    }

    pub fn update_interval(&self) -> Duration {
        self.update_interval
    }

    pub fn request_lifetime(&self) -> Duration {
        self.request_lifetime
    }

    pub fn auto_renew(&self) -> bool {
        self.auto_renew
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }
}

/// Options for a [`crate::RendezvousAgent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousOptions {
    active_prefix: Name,
    standby_prefixes: Vec<Name>,
}

impl RendezvousOptions {
    pub fn new(active_prefix: Name) -> Self {
        Self {
            active_prefix,
            standby_prefixes: Vec::new(),
        }
    }

    pub fn from_prefixes(prefixes: impl IntoIterator<Item = Name>) -> Result<Self, OptionsError> {
        let mut prefixes = prefixes.into_iter();
        let active = prefixes.next().ok_or(OptionsError::NoPrefix)?;
        Ok(Self {
            active_prefix: active,
            standby_prefixes: prefixes.collect(),
        })
    }

    pub fn active_prefix(&self) -> &Name {
        &self.active_prefix
    }

    pub fn standby_prefixes(&self) -> &[Name] {
        &self.standby_prefixes
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
