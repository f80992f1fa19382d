//! Intercepted Service Example
//!
//! This example demonstrates:
//! 1. Wrapping a method of a service type in an interceptor
//! 2. Process-wide defaults and a global setup hook
//! 3. Resolving rejections through a named fallback method
//! 4. Watching the circuit open and recover

use circuitbreaker_facade::prelude::*;
use circuitbreaker_facade::{set_default_configuration, Fallback};
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct ServiceError(String);

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Service error: {}", self.0)
    }
}

impl Error for ServiceError {}

struct QuoteService {
    calls: AtomicU32,
}

impl QuoteService {
    // Calls 4 through 8 fail, everything else succeeds.
    async fn quote(&self, symbol: String) -> Result<String, ServiceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if (4..=8).contains(&call) {
            Err(ServiceError(format!("quote feed unavailable (call {call})")))
        } else {
            Ok(format!("{symbol}: 101.{call:02}"))
        }
    }
}

impl FallbackMethods<String, String, ServiceError> for QuoteService {
    fn fallback_method(
        &self,
        name: &str,
    ) -> Option<Fallback<Invocation<Self, String>, String, ServiceError>> {
        (name == "stale_quote").then(|| {
            fallback_method(
                |_service: Arc<QuoteService>, symbol: String, cause: BreakerError<ServiceError>| async move {
                    Ok(format!("{symbol}: stale ({cause})"))
                },
            )
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    set_default_configuration(
        DefaultConfiguration::new(
            BreakerOptions::new()
                .timeout(Duration::from_millis(200))
                .reset_timeout(Duration::from_secs(1))
                .volume_threshold(3),
        )
        .setup(|handle| async move {
            let key = handle.identity().key();
            handle.subscribe(Arc::new(move |event: &BreakerEvent| {
                if let BreakerEvent::StateChange { from, to } = event {
                    println!("  [{key}] {from} -> {to}");
                }
            }));
            Ok(())
        }),
    );

    let quote = Interceptor::builder(registry(), "quote")
        .fallback_method("stale_quote")
        .target(|service: Arc<QuoteService>, symbol: String| async move {
            service.quote(symbol).await
        })
        .build()?;

    let service = Arc::new(QuoteService {
        calls: AtomicU32::new(0),
    });

    for attempt in 1..=14 {
        match quote.invoke(&service, "ACME".to_string()).await {
            Ok(price) => println!("Attempt {attempt}: {price}"),
            Err(err) => println!("Attempt {attempt}: failed: {err}"),
        }

        if let Some(breaker) = quote.breaker_for(&service)? {
            let stats = breaker.breaker().stats();
            println!(
                "  state: {}, error rate: {:.1}%, fallbacks: {}",
                breaker.breaker().current_state(),
                stats.error_percentage(),
                stats.fallbacks
            );
        }

        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    for registered in circuitbreaker_facade::list_all_breakers() {
        println!("{} -> {}", registered.key, registered.handle.state());
    }

    Ok(())
}
