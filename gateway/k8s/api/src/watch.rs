use futures::prelude::*;
pub use kube::runtime::watcher::{Event, Result};
use std::pin::Pin;
use tokio::time;
use tracing::{info, Instrument};

const MIN_BACKOFF: time::Duration = time::Duration::from_secs(1);
const MAX_BACKOFF: time::Duration = time::Duration::from_secs(30);

/// Wraps a watcher event stream so that it never terminates.
///
/// Stream errors are logged and followed by a backoff before the stream is
/// polled again. The pending backoff is held on the `Watch`, so it is still
/// honored when a call to `recv` is canceled.
pub struct Watch<T> {
    span: tracing::Span,
    backoff: time::Duration,
    sleep: Option<Pin<Box<time::Sleep>>>,
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
    pub fn new(rx: Pin<Box<dyn Stream<Item = Result<Event<T>>> + Send + 'static>>) -> Watch<T> {
        Self {
            rx,
            span: tracing::Span::current(),
            backoff: MIN_BACKOFF,
            sleep: None,
        }
    }

    pub fn instrument(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// Receive the next event in the stream.
    ///
    /// Returns `None` only if the underlying stream ends.
    pub async fn recv(&mut self) -> Option<Event<T>> {
        loop {
            if let Some(sleep) = self.sleep.as_mut() {
                sleep.await;
                self.sleep = None;
                info!(parent: &self.span, "Restarting");
            }

            match self.rx.next().instrument(self.span.clone()).await? {
                Ok(ev) => {
                    self.backoff = MIN_BACKOFF;
                    return Some(ev);
                }
                Err(error) => {
                    info!(parent: &self.span, %error, backoff = ?self.backoff, "Failed");
                    self.sleep = Some(Box::pin(time::sleep(self.backoff)));
                    self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}
