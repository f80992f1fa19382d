use circuitbreaker_facade::{
    BreakerError, BreakerEvent, BreakerOptions, CircuitBreaker, EventKind, State,
};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn failure() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionRefused, "upstream down")
}

/// A breaker whose operation fails while `healthy` is false.
fn switchable(
    name: &str,
    healthy: Arc<AtomicBool>,
    options: BreakerOptions,
) -> CircuitBreaker<u32, u32, io::Error> {
    CircuitBreaker::builder()
        .group("integration")
        .name(name)
        .options(options)
        .build(move |n: u32| {
            let healthy = healthy.load(Ordering::SeqCst);
            async move {
                if healthy {
                    Ok(n)
                } else {
                    Err(failure())
                }
            }
        })
}

fn record_kinds(breaker: &CircuitBreaker<u32, u32, io::Error>) -> Arc<Mutex<Vec<EventKind>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    breaker.on_event(move |event: &BreakerEvent| sink.lock().push(event.kind()));
    seen
}

#[tokio::test]
async fn test_trips_open_after_error_threshold() {
    let healthy = Arc::new(AtomicBool::new(false));
    let breaker = switchable(
        "trip",
        healthy,
        BreakerOptions::new().volume_threshold(2).error_threshold_percentage(50.0),
    );

    // Below the volume threshold the circuit stays closed
    assert_err!(breaker.fire(1).await);
    assert_eq!(breaker.current_state(), State::Closed);

    assert_err!(breaker.fire(2).await);
    assert_eq!(breaker.current_state(), State::Open);

    let rejected = breaker.fire(3).await;
    assert!(matches!(rejected, Err(BreakerError::Open)));
    assert_eq!(breaker.stats().rejects, 1);
}

#[tokio::test]
async fn test_half_open_trial_closes_circuit() {
    let healthy = Arc::new(AtomicBool::new(false));
    let breaker = switchable(
        "recover",
        healthy.clone(),
        BreakerOptions::new().reset_timeout(Duration::from_millis(50)),
    );
    let seen = record_kinds(&breaker);

    assert_err!(breaker.fire(1).await);
    assert_eq!(breaker.current_state(), State::Open);

    // Still inside the reset timeout
    assert!(matches!(breaker.fire(1).await, Err(BreakerError::Open)));

    tokio::time::sleep(Duration::from_millis(80)).await;
    healthy.store(true, Ordering::SeqCst);

    assert_eq!(assert_ok!(breaker.fire(7).await), 7);
    assert_eq!(breaker.current_state(), State::Closed);

    let kinds = seen.lock().clone();
    let open = kinds.iter().position(|k| *k == EventKind::Open).unwrap();
    let half_open = kinds.iter().position(|k| *k == EventKind::HalfOpen).unwrap();
    let close = kinds.iter().position(|k| *k == EventKind::Close).unwrap();
    assert!(open < half_open && half_open < close);
}

#[tokio::test]
async fn test_failed_trial_reopens_circuit() {
    let healthy = Arc::new(AtomicBool::new(false));
    let breaker = switchable(
        "relapse",
        healthy,
        BreakerOptions::new().reset_timeout(Duration::from_millis(30)),
    );

    assert_err!(breaker.fire(1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let trial = breaker.fire(1).await;
    assert!(matches!(trial, Err(BreakerError::Operation(_))));
    assert_eq!(breaker.current_state(), State::Open);
    assert!(matches!(breaker.fire(1).await, Err(BreakerError::Open)));
}

#[tokio::test]
async fn test_fallback_sees_the_triggering_error() {
    let healthy = Arc::new(AtomicBool::new(false));
    let breaker = switchable("fallback", healthy, BreakerOptions::new());
    breaker.fallback(|n: u32, err: BreakerError<io::Error>| async move {
        match err {
            BreakerError::Open => Ok(n + 1000),
            _ => Ok(n + 500),
        }
    });
    let seen = record_kinds(&breaker);

    assert_eq!(assert_ok!(breaker.fire(1).await), 501);
    assert_eq!(breaker.current_state(), State::Open);
    assert_eq!(assert_ok!(breaker.fire(2).await), 1002);

    let fallbacks = seen
        .lock()
        .iter()
        .filter(|k| **k == EventKind::Fallback)
        .count();
    assert_eq!(fallbacks, 2);
    assert_eq!(breaker.stats().fallbacks, 2);
}

#[tokio::test]
async fn test_timeout_counts_as_failure() {
    let breaker = CircuitBreaker::builder()
        .name("slow")
        .timeout(Duration::from_millis(20))
        .volume_threshold(5)
        .build(|n: u32| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, io::Error>(n)
        });

    let result = breaker.fire(1).await;
    assert!(matches!(result, Err(BreakerError::Timeout(after)) if after == Duration::from_millis(20)));

    let stats = breaker.stats();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.failures, 1);
    assert_eq!(breaker.current_state(), State::Closed);
}

#[tokio::test]
async fn test_filtered_errors_do_not_trip() {
    let breaker = CircuitBreaker::builder()
        .name("filtered")
        .error_filter(|err| {
            err.downcast_ref::<io::Error>()
                .is_some_and(|err| err.kind() == io::ErrorKind::NotFound)
        })
        .build(|_: u32| async move {
            Err::<u32, _>(io::Error::new(io::ErrorKind::NotFound, "no such row"))
        });
    breaker.fallback(|_, _| async move { Ok(0) });

    for _ in 0..5 {
        let result = breaker.fire(1).await;
        let err = assert_err!(result);
        assert_eq!(err.operation().map(|e| e.kind()), Some(io::ErrorKind::NotFound));
    }

    let stats = breaker.stats();
    assert_eq!(stats.filtered, 5);
    assert_eq!(stats.failures, 0);
    assert_eq!(stats.fallbacks, 0);
    assert_eq!(breaker.current_state(), State::Closed);
}

#[tokio::test]
async fn test_cache_serves_repeated_arguments() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let breaker = CircuitBreaker::builder()
        .name("cached")
        .options(BreakerOptions::new().cache(Duration::ZERO))
        .cache_key(|n: &u32| n.to_string())
        .build(move |n: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, io::Error>(n * 10) }
        });

    assert_eq!(assert_ok!(breaker.fire(4).await), 40);
    assert_eq!(assert_ok!(breaker.fire(4).await), 40);
    assert_eq!(assert_ok!(breaker.fire(5).await), 50);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(breaker.stats().cache_hits, 1);

    breaker.clear_cache();
    assert_ok!(breaker.fire(4).await);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_capacity_rejects_excess_calls() {
    let breaker = CircuitBreaker::builder()
        .name("narrow")
        .options(BreakerOptions::new().capacity(1))
        .build(|n: u32| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, io::Error>(n)
        });

    let busy = breaker.clone();
    let first = tokio::spawn(async move { busy.fire(1).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(matches!(
        breaker.fire(2).await,
        Err(BreakerError::CapacityExceeded)
    ));
    assert_eq!(assert_ok!(first.await.unwrap()), 1);
    assert_eq!(breaker.stats().semaphore_rejections, 1);
}

#[tokio::test]
async fn test_force_open_and_closed() {
    let breaker = switchable("forced", Arc::new(AtomicBool::new(true)), BreakerOptions::new());

    assert!(breaker.force_open());
    assert!(!breaker.force_open());
    assert!(matches!(breaker.fire(1).await, Err(BreakerError::Open)));

    assert!(breaker.force_closed());
    assert_eq!(assert_ok!(breaker.fire(1).await), 1);
}

#[tokio::test]
async fn test_disabled_breaker_passes_through() {
    let breaker = switchable(
        "disabled",
        Arc::new(AtomicBool::new(false)),
        BreakerOptions::new().enabled(false),
    );

    for _ in 0..3 {
        assert!(matches!(breaker.fire(1).await, Err(BreakerError::Operation(_))));
    }
    assert_eq!(breaker.current_state(), State::Closed);
    assert_eq!(breaker.stats().fires, 0);

    breaker.enable();
    assert_err!(breaker.fire(1).await);
    assert_eq!(breaker.current_state(), State::Open);
}

#[tokio::test]
async fn test_warm_up_ignores_early_failures() {
    let breaker = switchable(
        "warm",
        Arc::new(AtomicBool::new(false)),
        BreakerOptions::new()
            .allow_warm_up(true)
            .rolling_window(Duration::from_secs(5), 5),
    );

    for _ in 0..4 {
        assert_err!(breaker.fire(1).await);
    }
    assert_eq!(breaker.current_state(), State::Closed);
    assert_eq!(breaker.stats().failures, 4);
}

#[tokio::test]
async fn test_shutdown_rejects_calls() {
    let breaker = switchable("stopped", Arc::new(AtomicBool::new(true)), BreakerOptions::new());
    let seen = record_kinds(&breaker);

    breaker.shutdown();
    assert!(breaker.is_shutdown());
    assert!(matches!(breaker.fire(1).await, Err(BreakerError::Shutdown)));
    assert_eq!(seen.lock().as_slice(), &[EventKind::Shutdown]);
}

#[tokio::test]
async fn test_state_change_events_carry_both_states() {
    let breaker = switchable("transitions", Arc::new(AtomicBool::new(false)), BreakerOptions::new());
    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = changes.clone();
    breaker.on(EventKind::Open, move |event| {
        if let BreakerEvent::StateChange { from, to } = event {
            sink.lock().push((*from, *to));
        }
    });

    assert_err!(breaker.fire(1).await);
    assert_eq!(changes.lock().as_slice(), &[(State::Closed, State::Open)]);
}

#[tokio::test]
async fn test_cancelled_trial_frees_the_half_open_slot() {
    let breaker = CircuitBreaker::builder()
        .group("integration")
        .name("cancelled-trial")
        .reset_timeout(Duration::from_millis(30))
        .build(|delay_ms: u64| async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            Ok::<_, io::Error>(delay_ms)
        });

    assert!(breaker.force_open());
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The caller gives up while the trial call is still running
    let abandoned = tokio::time::timeout(Duration::from_millis(10), breaker.fire(500)).await;
    assert!(abandoned.is_err());
    assert_eq!(breaker.current_state(), State::HalfOpen);

    assert_eq!(assert_ok!(breaker.fire(1).await), 1);
    assert_eq!(breaker.current_state(), State::Closed);
}

#[tokio::test]
async fn test_unbounded_capacity_is_clamped() {
    let breaker = switchable(
        "wide",
        Arc::new(AtomicBool::new(true)),
        BreakerOptions::new().capacity(usize::MAX),
    );

    for n in 0..3 {
        assert_eq!(assert_ok!(breaker.fire(n).await), n);
    }
    assert_eq!(breaker.stats().semaphore_rejections, 0);
}
