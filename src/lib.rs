//! # circuitbreaker-facade
//!
//! Circuit breakers wired around methods, created lazily on first call and
//! shared by identity.
//!
//! A method is wrapped in an [`Interceptor`]. Every call resolves a
//! `group:name` identity for itself, looks the breaker up in a
//! [`BreakerRegistry`], and creates it the first time the identity is seen.
//! Creation merges the registry's [`DefaultConfiguration`] under the call
//! site's [`BreakerOptions`], runs the setup hooks and binds the receiver's
//! named fallback method. Later calls with the same identity share the
//! breaker, whatever call site they come from.
//!
//! The breaker itself ([`CircuitBreaker`]) follows the familiar three states:
//!
//! - **Closed**: calls pass through; failures are counted in a rolling window.
//! - **Open**: calls are rejected and go straight to the fallback.
//! - **Half-Open**: once the reset timeout has passed a single trial call is
//!   let through. Success closes the circuit, failure re-opens it.
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use std::io;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use circuitbreaker_facade::{registry, BreakerOptions, FallbackMethods, Interceptor};
//!
//! struct Inventory;
//!
//! impl FallbackMethods<u32, u32, io::Error> for Inventory {}
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let lookup = Interceptor::<Inventory, u32, u32, io::Error>::builder(registry(), "lookup")
//!     .options(BreakerOptions::new().timeout(Duration::from_millis(500)))
//!     .target(|_inventory, sku| async move { Ok(sku * 2) })
//!     .build()?;
//!
//! let inventory = Arc::new(Inventory);
//! let stock = lookup.invoke(&inventory, 21).await?;
//! assert_eq!(stock, 42);
//! # Ok(())
//! # }
//! ```
//!
//! ## Standalone breakers
//!
//! ```rust,no_run
//! use std::io;
//! use circuitbreaker_facade::CircuitBreaker;
//!
//! # async fn run() {
//! let breaker = CircuitBreaker::builder()
//!     .name("ping")
//!     .build(|host: String| async move { Ok::<_, io::Error>(host.len()) });
//!
//! let _ = breaker.fire("localhost".to_string()).await;
//! # }
//! ```
//!
//! ## Features
//!
//! - `serde` - Deserialize [`BreakerOptions`] from configuration files
//! - `prometheus` - Prometheus metric sink

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod breaker;
mod cache;
mod config;
mod error;
mod events;
mod interceptor;
mod metrics;
mod options;
mod policy;
pub mod prelude;
#[cfg(feature = "prometheus")]
#[cfg_attr(docsrs, doc(cfg(feature = "prometheus")))]
mod prometheus;
mod registry;
mod resolver;
mod state;

// Re-exports
pub use breaker::{Action, CacheKeyFn, CircuitBreaker, Fallback};
pub use config::BreakerBuilder;
pub use error::{BoxError, BreakerError, BreakerResult, CallError, ConfigurationError};
pub use events::{BreakerEvent, EventKind, Listener};
pub use interceptor::{
    fallback_method, FallbackMethods, InterceptedBreaker, Interceptor, InterceptorBuilder,
    Invocation, ManagedBreaker, Method, SetupHook,
};
pub use metrics::{BreakerStats, CallOutcome, MetricSink, NullMetricSink, RollingWindow};
pub use options::{BreakerOptions, BreakerSettings, ErrorFilter};
pub use policy::{BreakerPolicy, ThresholdPolicy};
#[cfg(feature = "prometheus")]
pub use prometheus::PrometheusMetricSink;
pub use registry::{
    list_all_breakers, registry, set_default_configuration, BreakerHandle, BreakerIdentity,
    BreakerRegistry, DefaultConfiguration, GlobalSetupHook, RegisteredBreaker,
};
pub use resolver::{resolve, OptionSource};
pub use state::State;
