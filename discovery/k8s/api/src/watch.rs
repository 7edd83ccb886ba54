use futures::prelude::*;
pub use kube::runtime::watcher::{Event, Result};
use std::pin::Pin;
use tokio::time;
use tracing::{info, Instrument};

/// Wraps a watch event stream, absorbing stream errors.
pub struct Watch<T> {
    initialized: bool,
    span: tracing::Span,
    backoff: time::Duration,
    rx: Pin<Box<dyn Stream<Item = Result<Event<T>>> + Send + 'static>>,
}

// === impl Watch ===

impl<T, W> From<W> for Watch<T>
where
    W: Stream<Item = Result<Event<T>>> + Send + 'static,
{
    fn from(watch: W) -> Self {
        Self::new(watch.boxed())
    }
}

impl<T> Watch<T> {
    const DEFAULT_BACKOFF: time::Duration = time::Duration::from_secs(1);

    pub fn new(rx: Pin<Box<dyn Stream<Item = Result<Event<T>>> + Send + 'static>>) -> Watch<T> {
        Self {
            rx,
            initialized: false,
            backoff: Self::DEFAULT_BACKOFF,
            span: tracing::Span::current(),
        }
    }

    pub fn instrument(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn with_backoff(mut self, backoff: time::Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// True once the first event has been received.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Receive the next event in the stream.
    ///
    /// If the stream fails, log the error and sleep before polling for the next event. Returns
    /// `None` only if the underlying stream terminates.
    pub async fn recv(&mut self) -> Option<Event<T>> {
        loop {
            let ev = self.rx.next().instrument(self.span.clone()).await?;

            match ev {
                Ok(ev) => {
                    self.initialized = true;
                    return Some(ev);
                }
                Err(error) => {
                    info!(parent: &self.span, %error, "Watch failed");
                    time::sleep(self.backoff).await;
                    info!(parent: &self.span, "Restarting");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recv_skips_errors() {
        let events: Vec<Result<Event<u32>>> = vec![
            Err(kube::runtime::watcher::Error::NoResourceVersion),
            Ok(Event::Apply(7)),
        ];
        let mut watch =
            Watch::from(futures::stream::iter(events)).with_backoff(time::Duration::ZERO);
        assert!(!watch.is_initialized());
        match watch.recv().await {
            Some(Event::Apply(n)) => assert_eq!(n, 7),
            _ => panic!("expected an apply event"),
        }
        assert!(watch.is_initialized());
        assert!(watch.recv().await.is_none());
    }
}
