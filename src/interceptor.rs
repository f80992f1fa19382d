//! Method interception.
//!
//! An [`Interceptor`] stands in for one method of a receiver type `R`. Each
//! call resolves the breaker identity for that call, finds the breaker in the
//! registry or creates it (exactly once per identity), and fires it.
//!
//! ```text
//! invoke ─► resolve options ─► identity ─► registry hit? ── yes ─► fire
//!                                               │
//!                                               no
//!                                               ▼
//!                          merge defaults ─► create + register ─► setup hooks
//!                                                                     │
//!                                          fire ◄─ fallback method ◄──┘
//! ```

use std::cell::Cell;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::breaker::{Action, CacheKeyFn, CircuitBreaker, Fallback};
use crate::config::BreakerBuilder;
use crate::error::{BoxError, BreakerError, BreakerResult, CallError, ConfigurationError};
use crate::events::Listener;
use crate::metrics::BreakerStats;
use crate::options::{BreakerOptions, BreakerSettings, ErrorFilter};
use crate::registry::{BreakerHandle, BreakerIdentity, BreakerRegistry, DefaultConfiguration};
use crate::resolver::{self, OptionSource};
use crate::state::State;

tokio::task_local! {
    // Set by the wrapped error filter when it excludes the current call's error.
    static FILTERED: Cell<bool>;
}

static ANONYMOUS_GROUPS: AtomicU64 = AtomicU64::new(0);

/// One intercepted call: the receiver and the method arguments.
pub struct Invocation<R, A> {
    /// The object the method was called on.
    pub receiver: Arc<R>,
    /// The method arguments.
    pub args: A,
}

impl<R, A> Invocation<R, A> {
    /// Creates an invocation.
    pub fn new(receiver: Arc<R>, args: A) -> Self {
        Self { receiver, args }
    }
}

impl<R, A: Clone> Clone for Invocation<R, A> {
    fn clone(&self) -> Self {
        Self {
            receiver: Arc::clone(&self.receiver),
            args: self.args.clone(),
        }
    }
}

/// The breaker type created for an intercepted method.
pub type InterceptedBreaker<R, A, T, E> = CircuitBreaker<Invocation<R, A>, T, E>;

/// The intercepted method's implementation.
pub type Method<R, A, T, E> =
    Arc<dyn Fn(Arc<R>, A) -> BoxFuture<'static, Result<T, E>> + Send + Sync + 'static>;

/// Call-site setup hook, run once when the breaker is created.
pub type SetupHook<R, A, T, E> = Arc<
    dyn Fn(InterceptedBreaker<R, A, T, E>, Arc<R>, A) -> BoxFuture<'static, Result<(), BoxError>>
        + Send
        + Sync
        + 'static,
>;

/// Named fallback lookup on a receiver type.
///
/// The interceptor consults this when a call site names a fallback method.
/// Types without fallback methods can rely on the default, which finds none.
pub trait FallbackMethods<A, T, E>: Send + Sync + Sized + 'static {
    /// Returns the fallback registered under `name`, if the receiver has one.
    fn fallback_method(&self, name: &str) -> Option<Fallback<Invocation<Self, A>, T, E>> {
        let _ = name;
        None
    }
}

/// Wraps a receiver method as a fallback.
///
/// The method is called with the receiver of the failing call, its arguments
/// and the error that triggered the fallback.
pub fn fallback_method<R, A, T, E, F, Fut>(f: F) -> Fallback<Invocation<R, A>, T, E>
where
    R: Send + Sync + 'static,
    A: Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
    F: Fn(Arc<R>, A, BreakerError<E>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    Arc::new(move |call: Invocation<R, A>, error: BreakerError<E>| {
        f(call.receiver, call.args, error).boxed()
    })
}

/// A breaker created by an interceptor, with the filtered-error policy frozen
/// at creation.
pub struct ManagedBreaker<R, A, T, E> {
    breaker: InterceptedBreaker<R, A, T, E>,
    return_fallback_when_error_is_filtered: bool,
}

impl<R, A, T, E> ManagedBreaker<R, A, T, E>
where
    R: Send + Sync + 'static,
    A: Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: Error + Send + 'static,
{
    /// The underlying breaker.
    pub fn breaker(&self) -> &InterceptedBreaker<R, A, T, E> {
        &self.breaker
    }

    /// Whether filtered errors are resolved through the fallback.
    pub fn returns_fallback_when_error_is_filtered(&self) -> bool {
        self.return_fallback_when_error_is_filtered
    }

    /// Fires the breaker.
    ///
    /// When the breaker rejects with an error its filter excluded, and the
    /// policy is on and a fallback is attached, the fallback's result is
    /// returned instead of the error.
    pub async fn fire(&self, call: Invocation<R, A>) -> BreakerResult<T, E> {
        let retry = self
            .return_fallback_when_error_is_filtered
            .then(|| call.clone());

        let (result, filtered) = FILTERED
            .scope(Cell::new(false), async {
                let result = self.breaker.fire(call).await;
                (result, FILTERED.with(|flag| flag.get()))
            })
            .await;

        match (result, retry) {
            (Err(error), Some(retry)) if filtered && self.breaker.has_fallback() => {
                debug!(breaker = %self.breaker.key(), "resolving filtered error through fallback");
                self.breaker.call_fallback(retry, error).await
            }
            (result, _) => result,
        }
    }
}

impl<R, A, T, E> fmt::Debug for ManagedBreaker<R, A, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedBreaker")
            .field("breaker", &self.breaker)
            .field(
                "return_fallback_when_error_is_filtered",
                &self.return_fallback_when_error_is_filtered,
            )
            .finish()
    }
}

impl<R, A, T, E> BreakerHandle for ManagedBreaker<R, A, T, E>
where
    R: Send + Sync + 'static,
    A: Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: Error + Send + 'static,
{
    fn identity(&self) -> BreakerIdentity {
        self.breaker.identity().clone()
    }

    fn state(&self) -> State {
        self.breaker.current_state()
    }

    fn stats(&self) -> BreakerStats {
        self.breaker.stats()
    }

    fn settings(&self) -> BreakerSettings {
        self.breaker.settings().clone()
    }

    fn subscribe(&self, listener: Listener) {
        self.breaker.subscribe(listener);
    }

    fn has_fallback(&self) -> bool {
        self.breaker.has_fallback()
    }

    fn force_open(&self) -> bool {
        self.breaker.force_open()
    }

    fn force_closed(&self) -> bool {
        self.breaker.force_closed()
    }

    fn shutdown(&self) {
        self.breaker.shutdown();
    }

    fn is_shutdown(&self) -> bool {
        self.breaker.is_shutdown()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

struct InterceptorInner<R, A, T, E> {
    registry: Arc<BreakerRegistry>,
    owner: Option<String>,
    method_name: String,
    options: Option<OptionSource<R>>,
    fallback_method: Option<String>,
    return_fallback_when_error_is_filtered: Option<bool>,
    setup: Option<SetupHook<R, A, T, E>>,
    cache_key: Option<CacheKeyFn<A>>,
    target: Method<R, A, T, E>,
}

/// A method wrapped in a lazily created circuit breaker.
///
/// Cloning is cheap; clones share the call-site configuration.
pub struct Interceptor<R, A, T, E> {
    inner: Arc<InterceptorInner<R, A, T, E>>,
}

impl<R, A, T, E> Clone for Interceptor<R, A, T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R, A, T, E> fmt::Debug for Interceptor<R, A, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptor")
            .field("owner", &self.inner.owner)
            .field("method_name", &self.inner.method_name)
            .field("options", &self.inner.options)
            .field("fallback_method", &self.inner.fallback_method)
            .finish_non_exhaustive()
    }
}

impl<R, A, T, E> Interceptor<R, A, T, E>
where
    R: FallbackMethods<A, T, E>,
    A: Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: Error + Send + 'static,
{
    /// Starts configuring an interceptor for `method_name` on `R`.
    pub fn builder(
        registry: Arc<BreakerRegistry>,
        method_name: impl Into<String>,
    ) -> InterceptorBuilder<R, A, T, E> {
        InterceptorBuilder::new(registry, method_name)
    }

    /// The registry breakers are created in.
    pub fn registry(&self) -> &Arc<BreakerRegistry> {
        &self.inner.registry
    }

    /// Calls the method on `receiver` through its breaker.
    pub async fn invoke(&self, receiver: &Arc<R>, args: A) -> Result<T, CallError<E>> {
        let per_call = resolver::resolve(receiver.as_ref(), self.inner.options.as_ref());
        let identity = self.identity(&per_call)?;
        let key = identity.key();
        let call = Invocation::new(Arc::clone(receiver), args);

        if let Some(existing) = self.inner.registry.get(&key) {
            let managed = Self::downcast(&key, existing)?;
            return Ok(managed.fire(call).await?);
        }

        let defaults = self.inner.registry.default_configuration();
        let (handle, created) = self.inner.registry.get_or_register_with(&key, || {
            Ok(self.create(&defaults, &per_call, identity) as Arc<dyn BreakerHandle>)
        })?;
        let managed = Self::downcast(&key, Arc::clone(&handle))?;

        if created {
            let pending = self.inner.registry.pending(&key, Arc::clone(&handle));
            if let Err(error) = self.configure(&defaults, &managed, handle, &call).await {
                warn!(breaker = %key, error = %error, "breaker setup failed, discarding breaker");
                return Err(CallError::Setup(error));
            }
            pending.commit();
        }

        Ok(managed.fire(call).await?)
    }

    /// The identity a call on `receiver` resolves to.
    ///
    /// Without a configured group or owner type name every resolution yields
    /// a fresh anonymous group, so such breakers are never reused.
    pub fn identity_for(&self, receiver: &R) -> Result<BreakerIdentity, ConfigurationError> {
        let per_call = resolver::resolve(receiver, self.inner.options.as_ref());
        self.identity(&per_call)
    }

    /// The breaker a call on `receiver` would use, if it exists yet.
    pub fn breaker_for(
        &self,
        receiver: &R,
    ) -> Result<Option<Arc<ManagedBreaker<R, A, T, E>>>, ConfigurationError> {
        let key = self.identity_for(receiver)?.key();
        self.inner
            .registry
            .get(&key)
            .map(|handle| Self::downcast(&key, handle))
            .transpose()
    }

    fn identity(&self, per_call: &BreakerOptions) -> Result<BreakerIdentity, ConfigurationError> {
        let group = per_call
            .group
            .clone()
            .or_else(|| self.inner.owner.clone())
            .unwrap_or_else(|| {
                format!(
                    "anonymous-{}",
                    ANONYMOUS_GROUPS.fetch_add(1, Ordering::Relaxed)
                )
            });
        let name = per_call
            .name
            .clone()
            .unwrap_or_else(|| self.inner.method_name.clone());

        BreakerIdentity::new(group, name)
    }

    fn create(
        &self,
        defaults: &DefaultConfiguration,
        per_call: &BreakerOptions,
        identity: BreakerIdentity,
    ) -> Arc<ManagedBreaker<R, A, T, E>> {
        let mut options = defaults.options.merge(per_call);
        // Identity always wins over any group or name in the defaults
        options.group = Some(identity.group().to_string());
        options.name = Some(identity.name().to_string());
        options.error_filter = options.error_filter.take().map(recording_filter);

        let target = Arc::clone(&self.inner.target);
        let action: Action<Invocation<R, A>, T, E> =
            Arc::new(move |call: Invocation<R, A>| target(call.receiver, call.args));

        let breaker = BreakerBuilder::new()
            .options(options)
            .shared_metric_sink(self.inner.registry.metric_sink())
            .shared_cache_key(self.inner.cache_key.clone().map(invocation_cache_key))
            .build_with_action(action);

        let return_fallback_when_error_is_filtered = self
            .inner
            .return_fallback_when_error_is_filtered
            .unwrap_or(defaults.return_fallback_when_error_is_filtered);

        debug!(breaker = %identity, "created circuit breaker for intercepted method");
        Arc::new(ManagedBreaker {
            breaker,
            return_fallback_when_error_is_filtered,
        })
    }

    /// Runs the setup hooks and binds the named fallback method.
    async fn configure(
        &self,
        defaults: &DefaultConfiguration,
        managed: &ManagedBreaker<R, A, T, E>,
        handle: Arc<dyn BreakerHandle>,
        call: &Invocation<R, A>,
    ) -> Result<(), BoxError> {
        if let Some(hook) = &defaults.setup {
            hook(handle).await?;
        }

        if let Some(hook) = &self.inner.setup {
            hook(
                managed.breaker.clone(),
                Arc::clone(&call.receiver),
                call.args.clone(),
            )
            .await?;
        }

        if let Some(name) = &self.inner.fallback_method {
            match call.receiver.fallback_method(name) {
                Some(fallback) => managed.breaker.set_fallback(fallback),
                None => debug!(
                    breaker = %managed.breaker.key(),
                    method = %name,
                    "receiver has no such fallback method"
                ),
            }
        }

        Ok(())
    }

    fn downcast(
        key: &str,
        handle: Arc<dyn BreakerHandle>,
    ) -> Result<Arc<ManagedBreaker<R, A, T, E>>, ConfigurationError> {
        handle
            .as_any()
            .downcast::<ManagedBreaker<R, A, T, E>>()
            .map_err(|_| ConfigurationError::IncompatibleBreaker(key.to_string()))
    }
}

fn recording_filter(filter: ErrorFilter) -> ErrorFilter {
    Arc::new(move |error: &(dyn Error + 'static)| {
        let filtered = filter(error);
        if filtered {
            // Outside a managed fire there is no slot to record into.
            let _ = FILTERED.try_with(|flag| flag.set(true));
        }
        filtered
    })
}

fn invocation_cache_key<R, A>(key: CacheKeyFn<A>) -> CacheKeyFn<Invocation<R, A>>
where
    R: 'static,
    A: 'static,
{
    Arc::new(move |call: &Invocation<R, A>| key(&call.args))
}

fn owner_type_name<R>() -> Option<String> {
    let full = std::any::type_name::<R>();
    let path = full.split('<').next().unwrap_or(full);
    let short = path.rsplit("::").next().unwrap_or(path);
    (!short.is_empty()).then(|| short.to_string())
}

/// Configures an [`Interceptor`].
pub struct InterceptorBuilder<R, A, T, E> {
    registry: Arc<BreakerRegistry>,
    owner: Option<String>,
    method_name: String,
    options: Option<OptionSource<R>>,
    fallback_method: Option<String>,
    return_fallback_when_error_is_filtered: Option<bool>,
    setup: Option<SetupHook<R, A, T, E>>,
    cache_key: Option<CacheKeyFn<A>>,
    target: Option<Method<R, A, T, E>>,
}

impl<R, A, T, E> InterceptorBuilder<R, A, T, E>
where
    R: FallbackMethods<A, T, E>,
    A: Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: Error + Send + 'static,
{
    /// Starts configuring `method_name` on `R`.
    ///
    /// The owner name used as the default group is `R`'s type name without
    /// its module path.
    pub fn new(registry: Arc<BreakerRegistry>, method_name: impl Into<String>) -> Self {
        Self {
            registry,
            owner: owner_type_name::<R>(),
            method_name: method_name.into(),
            options: None,
            fallback_method: None,
            return_fallback_when_error_is_filtered: None,
            setup: None,
            cache_key: None,
            target: None,
        }
    }

    /// Overrides the owner name used as the default group.
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Clears the owner name.
    ///
    /// Unless the options name a group, each call then gets its own
    /// anonymous breaker. Every such call registers a new breaker, so the
    /// registry grows by one entry per call.
    pub fn detached(mut self) -> Self {
        self.owner = None;
        self
    }

    /// Sets fixed per-call options.
    pub fn options(mut self, options: BreakerOptions) -> Self {
        self.options = Some(OptionSource::Static(options));
        self
    }

    /// Computes per-call options from the receiver of each call.
    pub fn options_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&R) -> BreakerOptions + Send + Sync + 'static,
    {
        self.options = Some(OptionSource::computed(f));
        self
    }

    /// Names the receiver's fallback method, see [`FallbackMethods`].
    pub fn fallback_method(mut self, name: impl Into<String>) -> Self {
        self.fallback_method = Some(name.into());
        self
    }

    /// Resolves filtered errors through the fallback, overriding the
    /// process-wide default.
    pub fn return_fallback_when_error_is_filtered(mut self, enabled: bool) -> Self {
        self.return_fallback_when_error_is_filtered = Some(enabled);
        self
    }

    /// Sets the hook run once when the breaker is created.
    ///
    /// It receives the new breaker, the receiver and the arguments of the
    /// call that created it.
    pub fn setup<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(InterceptedBreaker<R, A, T, E>, Arc<R>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let hook: SetupHook<R, A, T, E> = Arc::new(
            move |breaker: InterceptedBreaker<R, A, T, E>, receiver: Arc<R>, args: A| {
                f(breaker, receiver, args).boxed()
            },
        );
        self.setup = Some(hook);
        self
    }

    /// Derives response cache keys from the method arguments.
    pub fn cache_key<F>(mut self, key: F) -> Self
    where
        F: Fn(&A) -> String + Send + Sync + 'static,
    {
        self.cache_key = Some(Arc::new(key));
        self
    }

    /// Sets the method implementation being intercepted.
    pub fn target<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<R>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let target: Method<R, A, T, E> =
            Arc::new(move |receiver: Arc<R>, args: A| f(receiver, args).boxed());
        self.target = Some(target);
        self
    }

    /// Finishes the configuration.
    ///
    /// Fails with [`ConfigurationError::NotAFunction`] when no target was set.
    pub fn build(self) -> Result<Interceptor<R, A, T, E>, ConfigurationError> {
        let Some(target) = self.target else {
            let owner = self.owner.as_deref().unwrap_or("<anonymous>");
            return Err(ConfigurationError::NotAFunction(format!(
                "{owner}.{}",
                self.method_name
            )));
        };

        Ok(Interceptor {
            inner: Arc::new(InterceptorInner {
                registry: self.registry,
                owner: self.owner,
                method_name: self.method_name,
                options: self.options,
                fallback_method: self.fallback_method,
                return_fallback_when_error_is_filtered: self.return_fallback_when_error_is_filtered,
                setup: self.setup,
                cache_key: self.cache_key,
                target,
            }),
        })
    }
}
