//! Breaker options and their resolution into concrete settings.

use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Predicate selecting errors that must not count as failures.
///
/// The error is passed as a trait object so one filter can serve breakers of
/// any error type; use `downcast_ref` to inspect a concrete type.
pub type ErrorFilter = Arc<dyn Fn(&(dyn Error + 'static)) -> bool + Send + Sync + 'static>;

/// Partial breaker configuration.
///
/// Every field is optional so that options from several sources can be
/// layered with [`BreakerOptions::merge`]; unset fields fall back to the
/// engine defaults when the breaker is built (see [`BreakerSettings`]).
#[derive(Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(default))]
pub struct BreakerOptions {
    /// Group half of the breaker identity.
    pub group: Option<String>,
    /// Name half of the breaker identity.
    pub name: Option<String>,
    /// Call timeout. `Duration::ZERO` disables it.
    #[cfg_attr(feature = "serde", serde(deserialize_with = "duration_ms::deserialize"))]
    pub timeout: Option<Duration>,
    /// Error percentage above which the circuit opens.
    pub error_threshold_percentage: Option<f64>,
    /// Time the circuit stays open before a trial call is allowed.
    #[cfg_attr(feature = "serde", serde(deserialize_with = "duration_ms::deserialize"))]
    pub reset_timeout: Option<Duration>,
    /// Minimum calls in the window before the circuit may open.
    pub volume_threshold: Option<u64>,
    /// Length of the rolling statistics window.
    #[cfg_attr(feature = "serde", serde(deserialize_with = "duration_ms::deserialize"))]
    pub rolling_count_timeout: Option<Duration>,
    /// Number of buckets the rolling window is split into.
    pub rolling_count_buckets: Option<u32>,
    /// Maximum concurrent calls.
    pub capacity: Option<usize>,
    /// Whether successful responses are cached.
    pub cache: Option<bool>,
    /// Lifetime of a cache entry. `Duration::ZERO` keeps entries forever.
    #[cfg_attr(feature = "serde", serde(deserialize_with = "duration_ms::deserialize"))]
    pub cache_ttl: Option<Duration>,
    /// Whether the breaker is active. A disabled breaker passes calls straight through.
    pub enabled: Option<bool>,
    /// Whether failures during the first rolling window are ignored for tripping.
    pub allow_warm_up: Option<bool>,
    /// Errors matching this predicate are not counted as failures.
    #[cfg_attr(feature = "serde", serde(skip))]
    pub error_filter: Option<ErrorFilter>,
}

impl BreakerOptions {
    /// Creates an empty set of options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the identity group.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Sets the identity name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the call timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the error percentage that trips the circuit.
    pub fn error_threshold_percentage(mut self, percentage: f64) -> Self {
        self.error_threshold_percentage = Some(percentage);
        self
    }

    /// Sets how long the circuit stays open before a trial call.
    pub fn reset_timeout(mut self, reset_timeout: Duration) -> Self {
        self.reset_timeout = Some(reset_timeout);
        self
    }

    /// Sets the minimum number of calls before the circuit may open.
    pub fn volume_threshold(mut self, volume: u64) -> Self {
        self.volume_threshold = Some(volume);
        self
    }

    /// Sets the rolling window length and bucket count.
    pub fn rolling_window(mut self, length: Duration, buckets: u32) -> Self {
        self.rolling_count_timeout = Some(length);
        self.rolling_count_buckets = Some(buckets);
        self
    }

    /// Limits the number of concurrent calls.
    ///
    /// Values above [`tokio::sync::Semaphore::MAX_PERMITS`] are clamped to it.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Enables response caching with the given entry lifetime.
    pub fn cache(mut self, ttl: Duration) -> Self {
        self.cache = Some(true);
        self.cache_ttl = Some(ttl);
        self
    }

    /// Enables or disables the breaker.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Ignores failures during the first rolling window.
    pub fn allow_warm_up(mut self, allow: bool) -> Self {
        self.allow_warm_up = Some(allow);
        self
    }

    /// Sets the error filter.
    pub fn error_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&(dyn Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.error_filter = Some(Arc::new(filter));
        self
    }

    /// Layers `overrides` on top of `self`, field by field.
    ///
    /// Neither input is modified; fields set in `overrides` win.
    pub fn merge(&self, overrides: &BreakerOptions) -> BreakerOptions {
        BreakerOptions {
            group: overrides.group.clone().or_else(|| self.group.clone()),
            name: overrides.name.clone().or_else(|| self.name.clone()),
            timeout: overrides.timeout.or(self.timeout),
            error_threshold_percentage: overrides
                .error_threshold_percentage
                .or(self.error_threshold_percentage),
            reset_timeout: overrides.reset_timeout.or(self.reset_timeout),
            volume_threshold: overrides.volume_threshold.or(self.volume_threshold),
            rolling_count_timeout: overrides.rolling_count_timeout.or(self.rolling_count_timeout),
            rolling_count_buckets: overrides.rolling_count_buckets.or(self.rolling_count_buckets),
            capacity: overrides.capacity.or(self.capacity),
            cache: overrides.cache.or(self.cache),
            cache_ttl: overrides.cache_ttl.or(self.cache_ttl),
            enabled: overrides.enabled.or(self.enabled),
            allow_warm_up: overrides.allow_warm_up.or(self.allow_warm_up),
            error_filter: overrides
                .error_filter
                .clone()
                .or_else(|| self.error_filter.clone()),
        }
    }
}

impl fmt::Debug for BreakerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerOptions")
            .field("group", &self.group)
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("error_threshold_percentage", &self.error_threshold_percentage)
            .field("reset_timeout", &self.reset_timeout)
            .field("volume_threshold", &self.volume_threshold)
            .field("rolling_count_timeout", &self.rolling_count_timeout)
            .field("rolling_count_buckets", &self.rolling_count_buckets)
            .field("capacity", &self.capacity)
            .field("cache", &self.cache)
            .field("cache_ttl", &self.cache_ttl)
            .field("enabled", &self.enabled)
            .field("allow_warm_up", &self.allow_warm_up)
            .field("error_filter", &self.error_filter.is_some())
            .finish()
    }
}

/// Options resolved against the engine defaults.
#[derive(Clone)]
pub struct BreakerSettings {
    /// Call timeout, `None` when disabled. Default 10 s.
    pub timeout: Option<Duration>,
    /// Default 50 %.
    pub error_threshold_percentage: f64,
    /// Default 30 s.
    pub reset_timeout: Duration,
    /// Default 0.
    pub volume_threshold: u64,
    /// Default 10 s.
    pub rolling_count_timeout: Duration,
    /// Default 10.
    pub rolling_count_buckets: u32,
    /// Default unlimited.
    pub capacity: Option<usize>,
    /// Default off.
    pub cache: bool,
    /// Cache entry lifetime, `None` for no expiry.
    pub cache_ttl: Option<Duration>,
    /// Default on.
    pub enabled: bool,
    /// Default off.
    pub allow_warm_up: bool,
    /// Error filter, if any.
    pub error_filter: Option<ErrorFilter>,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from(&BreakerOptions::default())
    }
}

impl From<&BreakerOptions> for BreakerSettings {
    fn from(options: &BreakerOptions) -> Self {
        Self {
            timeout: options
                .timeout
                .or(Some(Duration::from_secs(10)))
                .filter(|timeout| !timeout.is_zero()),
            error_threshold_percentage: options.error_threshold_percentage.unwrap_or(50.0),
            reset_timeout: options.reset_timeout.unwrap_or(Duration::from_secs(30)),
            volume_threshold: options.volume_threshold.unwrap_or(0),
            rolling_count_timeout: options
                .rolling_count_timeout
                .unwrap_or(Duration::from_secs(10)),
            rolling_count_buckets: options.rolling_count_buckets.unwrap_or(10).max(1),
            capacity: options.capacity,
            cache: options.cache.unwrap_or(false),
            cache_ttl: options.cache_ttl.filter(|ttl| !ttl.is_zero()),
            enabled: options.enabled.unwrap_or(true),
            allow_warm_up: options.allow_warm_up.unwrap_or(false),
            error_filter: options.error_filter.clone(),
        }
    }
}

impl fmt::Debug for BreakerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerSettings")
            .field("timeout", &self.timeout)
            .field("error_threshold_percentage", &self.error_threshold_percentage)
            .field("reset_timeout", &self.reset_timeout)
            .field("volume_threshold", &self.volume_threshold)
            .field("rolling_count_timeout", &self.rolling_count_timeout)
            .field("rolling_count_buckets", &self.rolling_count_buckets)
            .field("capacity", &self.capacity)
            .field("cache", &self.cache)
            .field("cache_ttl", &self.cache_ttl)
            .field("enabled", &self.enabled)
            .field("allow_warm_up", &self.allow_warm_up)
            .field("error_filter", &self.error_filter.is_some())
            .finish()
    }
}

#[cfg(feature = "serde")]
mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn overrides_win_field_by_field() {
        let defaults = BreakerOptions::new()
            .timeout(Duration::from_millis(1000))
            .volume_threshold(5);
        let per_call = BreakerOptions::new().timeout(Duration::from_millis(500));

        let merged = defaults.merge(&per_call);
        assert_eq!(merged.timeout, Some(Duration::from_millis(500)));
        assert_eq!(merged.volume_threshold, Some(5));

        // inputs untouched
        assert_eq!(defaults.timeout, Some(Duration::from_millis(1000)));
        assert_eq!(per_call.volume_threshold, None);
    }

    #[test]
    fn settings_fill_engine_defaults() {
        let settings = BreakerSettings::default();
        assert_eq!(settings.timeout, Some(Duration::from_secs(10)));
        assert_eq!(settings.error_threshold_percentage, 50.0);
        assert_eq!(settings.reset_timeout, Duration::from_secs(30));
        assert_eq!(settings.rolling_count_buckets, 10);
        assert!(settings.enabled);
        assert!(!settings.cache);
    }

    #[test]
    fn zero_timeout_disables_it() {
        let settings = BreakerSettings::from(&BreakerOptions::new().timeout(Duration::ZERO));
        assert_eq!(settings.timeout, None);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn deserializes_milliseconds() {
        let options: BreakerOptions = serde_json::from_str(
            r#"{"group":"billing","timeout":250,"error_threshold_percentage":20.0}"#,
        )
        .unwrap();
        assert_eq!(options.group.as_deref(), Some("billing"));
        assert_eq!(options.timeout, Some(Duration::from_millis(250)));
        assert_eq!(options.reset_timeout, None);
    }

    proptest! {
        #[test]
        fn merged_timeout_prefers_override(
            default_ms in proptest::option::of(1u64..10_000),
            call_ms in proptest::option::of(1u64..10_000),
        ) {
            let defaults = BreakerOptions {
                timeout: default_ms.map(Duration::from_millis),
                ..BreakerOptions::default()
            };
            let per_call = BreakerOptions {
                timeout: call_ms.map(Duration::from_millis),
                ..BreakerOptions::default()
            };

            let merged = defaults.merge(&per_call);
            prop_assert_eq!(merged.timeout, call_ms.or(default_ms).map(Duration::from_millis));
        }
    }
}
