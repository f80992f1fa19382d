//! Per-call option resolution.

use std::fmt;
use std::sync::Arc;

use crate::options::BreakerOptions;

/// Where a call site's options come from.
pub enum OptionSource<R> {
    /// Fixed options.
    Static(BreakerOptions),
    /// Options computed from the receiver of each call.
    Computed(Arc<dyn Fn(&R) -> BreakerOptions + Send + Sync + 'static>),
}

impl<R> OptionSource<R> {
    /// Wraps a function computing options from the receiver.
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&R) -> BreakerOptions + Send + Sync + 'static,
    {
        OptionSource::Computed(Arc::new(f))
    }

    /// Produces this source's options for `receiver`.
    ///
    /// The result is always a fresh copy; the source itself is never modified.
    pub fn resolve(&self, receiver: &R) -> BreakerOptions {
        match self {
            OptionSource::Static(options) => options.clone(),
            OptionSource::Computed(f) => f(receiver),
        }
    }
}

impl<R> Clone for OptionSource<R> {
    fn clone(&self) -> Self {
        match self {
            OptionSource::Static(options) => OptionSource::Static(options.clone()),
            OptionSource::Computed(f) => OptionSource::Computed(Arc::clone(f)),
        }
    }
}

impl<R> From<BreakerOptions> for OptionSource<R> {
    fn from(options: BreakerOptions) -> Self {
        OptionSource::Static(options)
    }
}

impl<R> fmt::Debug for OptionSource<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionSource::Static(options) => f.debug_tuple("Static").field(options).finish(),
            OptionSource::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// Normalizes a call site's option source into plain options.
///
/// No process-wide defaults are merged here; a call site without a source
/// resolves to empty options.
pub fn resolve<R>(receiver: &R, source: Option<&OptionSource<R>>) -> BreakerOptions {
    source
        .map(|source| source.resolve(receiver))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Client {
        timeout_ms: u64,
    }

    #[test]
    fn computed_options_see_the_receiver() {
        let source = OptionSource::computed(|client: &Client| {
            BreakerOptions::new().timeout(Duration::from_millis(client.timeout_ms))
        });

        let fast = resolve(&Client { timeout_ms: 50 }, Some(&source));
        let slow = resolve(&Client { timeout_ms: 900 }, Some(&source));
        assert_eq!(fast.timeout, Some(Duration::from_millis(50)));
        assert_eq!(slow.timeout, Some(Duration::from_millis(900)));
    }

    #[test]
    fn static_options_are_copied() {
        let source: OptionSource<Client> = BreakerOptions::new().name("lookup").into();
        let mut resolved = resolve(&Client { timeout_ms: 0 }, Some(&source));
        resolved.name = Some("changed".into());

        match &source {
            OptionSource::Static(options) => assert_eq!(options.name.as_deref(), Some("lookup")),
            OptionSource::Computed(_) => unreachable!(),
        }
    }

    #[test]
    fn missing_source_resolves_to_empty_options() {
        let resolved = resolve::<Client>(&Client { timeout_ms: 1 }, None);
        assert!(resolved.timeout.is_none());
        assert!(resolved.group.is_none());
    }
}
