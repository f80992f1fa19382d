//! Process-wide store of breakers keyed by identity.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use ahash::AHashMap;
use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use futures::FutureExt;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{BoxError, ConfigurationError};
use crate::events::Listener;
use crate::metrics::{BreakerStats, MetricSink, NullMetricSink};
use crate::options::{BreakerOptions, BreakerSettings};
use crate::state::State;

/// The `(group, name)` pair a breaker is registered under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BreakerIdentity {
    group: String,
    name: String,
}

impl BreakerIdentity {
    /// Creates an identity; both halves must be non-empty.
    pub fn new(
        group: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self, ConfigurationError> {
        let identity = Self {
            group: group.into(),
            name: name.into(),
        };
        if identity.group.is_empty() || identity.name.is_empty() {
            return Err(ConfigurationError::InvalidIdentity);
        }
        Ok(identity)
    }

    /// Both halves must already be known to be non-empty.
    pub(crate) fn from_parts(group: String, name: String) -> Self {
        Self { group, name }
    }

    /// The group half.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// The name half.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The registry key, `group:name`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.group, self.name)
    }
}

impl fmt::Display for BreakerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.name)
    }
}

/// Type-erased view of a registered breaker.
///
/// The registry stores breakers of every call signature side by side; this
/// is the part of a breaker that does not depend on that signature. Use
/// [`BreakerHandle::as_any`] to get the typed breaker back.
pub trait BreakerHandle: Send + Sync + 'static {
    /// The breaker's identity.
    fn identity(&self) -> BreakerIdentity;

    /// The current circuit state.
    fn state(&self) -> State;

    /// Counters for the current rolling window.
    fn stats(&self) -> BreakerStats;

    /// The settings the breaker was built with.
    fn settings(&self) -> BreakerSettings;

    /// Subscribes to the breaker's events.
    fn subscribe(&self, listener: Listener);

    /// Whether a fallback is attached.
    fn has_fallback(&self) -> bool;

    /// Forces the circuit open.
    fn force_open(&self) -> bool;

    /// Forces the circuit closed.
    fn force_closed(&self) -> bool;

    /// Permanently stops the breaker.
    fn shutdown(&self);

    /// Whether the breaker was shut down.
    fn is_shutdown(&self) -> bool;

    /// Upcasts for downcasting to the concrete breaker type.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Process-wide setup hook, run once for every breaker the interceptor creates.
pub type GlobalSetupHook =
    Arc<dyn Fn(Arc<dyn BreakerHandle>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Configuration applied to every breaker created after it is set.
#[derive(Clone, Default)]
pub struct DefaultConfiguration {
    /// Options every call site's options are layered on.
    ///
    /// `group` and `name` set here are ignored. A breaker's identity comes
    /// from the call site: its options, then the receiver type name and
    /// method name.
    pub options: BreakerOptions,
    /// Hook run before the call site's own setup hook.
    pub setup: Option<GlobalSetupHook>,
    /// Resolve filtered errors through the fallback unless a call site says otherwise.
    pub return_fallback_when_error_is_filtered: bool,
}

impl DefaultConfiguration {
    /// Creates a configuration with the given default options.
    pub fn new(options: BreakerOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    /// Sets the process-wide setup hook.
    pub fn setup<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<dyn BreakerHandle>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let hook: GlobalSetupHook =
            Arc::new(move |handle: Arc<dyn BreakerHandle>| f(handle).boxed());
        self.setup = Some(hook);
        self
    }

    /// Sets the default filtered-error policy.
    pub fn return_fallback_when_error_is_filtered(mut self, enabled: bool) -> Self {
        self.return_fallback_when_error_is_filtered = enabled;
        self
    }
}

impl fmt::Debug for DefaultConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultConfiguration")
            .field("options", &self.options)
            .field("setup", &self.setup.is_some())
            .field(
                "return_fallback_when_error_is_filtered",
                &self.return_fallback_when_error_is_filtered,
            )
            .finish()
    }
}

/// A registry entry.
#[derive(Clone)]
pub struct RegisteredBreaker {
    /// The key the breaker is registered under.
    pub key: String,
    /// The breaker.
    pub handle: Arc<dyn BreakerHandle>,
}

impl fmt::Debug for RegisteredBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredBreaker")
            .field("key", &self.key)
            .field("state", &self.handle.state())
            .finish()
    }
}

/// Keyed store of breakers with create-once semantics.
///
/// Entries are never replaced. The default configuration is swapped
/// atomically and read as a snapshot, so readers never see a half-written
/// configuration.
pub struct BreakerRegistry {
    breakers: RwLock<AHashMap<String, Arc<dyn BreakerHandle>>>,
    defaults: ArcSwap<DefaultConfiguration>,
    metric_sink: Arc<dyn MetricSink>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakerRegistry {
    /// Creates an empty registry with an empty default configuration.
    pub fn new() -> Self {
        Self {
            breakers: RwLock::new(AHashMap::new()),
            defaults: ArcSwap::from_pointee(DefaultConfiguration::default()),
            metric_sink: Arc::new(NullMetricSink),
        }
    }

    /// Sets the metric sink handed to the breakers created through this registry.
    pub fn with_metric_sink<M: MetricSink>(mut self, sink: M) -> Self {
        self.metric_sink = Arc::new(sink);
        self
    }

    /// The metric sink for breakers created through this registry.
    pub fn metric_sink(&self) -> Arc<dyn MetricSink> {
        Arc::clone(&self.metric_sink)
    }

    /// The process-wide registry, created on first access.
    pub fn global() -> Arc<BreakerRegistry> {
        Arc::clone(&GLOBAL_REGISTRY)
    }

    /// Stores `handle` under `key`.
    ///
    /// Fails when the key is empty, when the handle was already shut down, or
    /// when the key is taken; an existing entry is never overwritten.
    pub fn register(
        &self,
        key: &str,
        handle: Arc<dyn BreakerHandle>,
    ) -> Result<(), ConfigurationError> {
        Self::validate(key, handle.as_ref())?;

        let mut breakers = self.breakers.write();
        if breakers.contains_key(key) {
            warn!(key, "rejected duplicate circuit breaker registration");
            return Err(ConfigurationError::DuplicateIdentity(key.to_string()));
        }

        breakers.insert(key.to_string(), handle);
        debug!(key, "registered circuit breaker");
        Ok(())
    }

    /// Returns the breaker under `key`, creating and registering it with
    /// `create` when there is none.
    ///
    /// `create` runs under the registry's write lock, so for any key it runs
    /// at most once no matter how many callers race. The flag is true for the
    /// caller whose `create` ran.
    pub fn get_or_register_with<F>(
        &self,
        key: &str,
        create: F,
    ) -> Result<(Arc<dyn BreakerHandle>, bool), ConfigurationError>
    where
        F: FnOnce() -> Result<Arc<dyn BreakerHandle>, ConfigurationError>,
    {
        if let Some(existing) = self.get(key) {
            return Ok((existing, false));
        }

        let mut breakers = self.breakers.write();
        if let Some(existing) = breakers.get(key) {
            return Ok((Arc::clone(existing), false));
        }

        let handle = create()?;
        Self::validate(key, handle.as_ref())?;
        breakers.insert(key.to_string(), Arc::clone(&handle));
        debug!(key, "registered circuit breaker");
        Ok((handle, true))
    }

    /// Looks up a breaker. Never creates one.
    pub fn get(&self, key: &str) -> Option<Arc<dyn BreakerHandle>> {
        self.breakers.read().get(key).cloned()
    }

    /// Whether a breaker is registered under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.breakers.read().contains_key(key)
    }

    /// Number of registered breakers.
    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    /// Whether no breaker is registered.
    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }

    /// A snapshot of every registered breaker.
    pub fn all_breakers(&self) -> Vec<RegisteredBreaker> {
        self.breakers
            .read()
            .iter()
            .map(|(key, handle)| RegisteredBreaker {
                key: key.clone(),
                handle: Arc::clone(handle),
            })
            .collect()
    }

    /// Replaces the default configuration wholesale.
    ///
    /// Breakers that already exist keep the configuration they were created with.
    pub fn set_default_configuration(&self, config: DefaultConfiguration) {
        self.defaults.store(Arc::new(config));
    }

    /// A copy of the current default configuration.
    pub fn default_configuration(&self) -> DefaultConfiguration {
        DefaultConfiguration::clone(&self.defaults.load())
    }

    /// Removes `key` if it still maps to `handle`.
    pub(crate) fn evict(&self, key: &str, handle: &Arc<dyn BreakerHandle>) -> bool {
        let mut breakers = self.breakers.write();
        let same = breakers
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, handle));
        if same {
            breakers.remove(key);
            debug!(key, "evicted circuit breaker");
        }
        same
    }

    /// Tracks a freshly registered breaker until its setup completes.
    pub(crate) fn pending<'a>(
        &'a self,
        key: &'a str,
        handle: Arc<dyn BreakerHandle>,
    ) -> PendingRegistration<'a> {
        PendingRegistration {
            registry: self,
            key,
            handle: Some(handle),
        }
    }

    fn validate(key: &str, handle: &dyn BreakerHandle) -> Result<(), ConfigurationError> {
        if key.is_empty() {
            return Err(ConfigurationError::InvalidIdentity);
        }
        if handle.is_shutdown() {
            return Err(ConfigurationError::InvalidBreaker(key.to_string()));
        }
        Ok(())
    }
}

static GLOBAL_REGISTRY: Lazy<Arc<BreakerRegistry>> = Lazy::new(|| Arc::new(BreakerRegistry::new()));

/// The process-wide registry.
pub fn registry() -> Arc<BreakerRegistry> {
    BreakerRegistry::global()
}

/// Replaces the process-wide default configuration.
///
/// Only breakers created afterwards see the new configuration, so call this
/// before the first intercepted call.
pub fn set_default_configuration(config: DefaultConfiguration) {
    GLOBAL_REGISTRY.set_default_configuration(config);
}

/// Every breaker in the process-wide registry.
pub fn list_all_breakers() -> Vec<RegisteredBreaker> {
    GLOBAL_REGISTRY.all_breakers()
}

/// Evicts a breaker whose setup never completed.
///
/// Dropped without [`PendingRegistration::commit`], for example when setup
/// fails or the creating call is cancelled, it removes the breaker so the
/// next call creates and configures a new one.
pub(crate) struct PendingRegistration<'a> {
    registry: &'a BreakerRegistry,
    key: &'a str,
    handle: Option<Arc<dyn BreakerHandle>>,
}

impl PendingRegistration<'_> {
    pub(crate) fn commit(mut self) {
        self.handle = None;
    }
}

impl Drop for PendingRegistration<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.registry.evict(self.key, &handle);
        }
    }
}
