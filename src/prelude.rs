//! Re-exports the types most call sites need.
//!
//! # Example
//! ```rust,no_run
//! use circuitbreaker_facade::prelude::*;
//! ```

pub use crate::breaker::CircuitBreaker;
pub use crate::error::{BreakerError, CallError, ConfigurationError};
pub use crate::events::{BreakerEvent, EventKind};
pub use crate::interceptor::{fallback_method, FallbackMethods, Interceptor, Invocation};
pub use crate::options::BreakerOptions;
pub use crate::registry::{registry, BreakerHandle, BreakerRegistry, DefaultConfiguration};
pub use crate::state::State;
