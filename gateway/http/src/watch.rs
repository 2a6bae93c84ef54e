use crate::{metrics::StreamGuard, Body, HttpMetrics};
use bytes::Bytes;
use futures::prelude::*;
use http_body_util::{BodyExt, StreamBody};
use hyper::{body::Frame, header, Response, StatusCode};
use kube_gateway_core::{
    watch::{DeregisterBackoff, Filter, Subscribe, SubscriptionHandler, SubscriptionId, WakeSignal},
    ClusterClient, Error, ListOptions, ResourceDescriptor, Result,
};
use std::{convert::Infallible, sync::Arc};
use tokio::time::{self, Duration};
use tracing::{debug, info_span, trace, warn, Instrument};

/// The frame that ends a stream whose object was deleted.
const TERMINAL_EVENT: &[u8] = b"event:message\ndata:\n\n";

/// Serves a single watch request as a stream of server-sent events.
pub(crate) struct WatchStream {
    pub(crate) client: Arc<dyn ClusterClient>,
    pub(crate) subscriptions: Arc<dyn Subscribe>,
    pub(crate) resource: ResourceDescriptor,
    pub(crate) options: ListOptions,
    pub(crate) idle: Duration,
    pub(crate) metrics: HttpMetrics,
    pub(crate) drain: drain::Watch,
}

/// Owns a handler registration. Dropping it deregisters the handler in the
/// background.
struct Registration {
    id: SubscriptionId,
    subscriptions: Arc<dyn Subscribe>,
    backoff: DeregisterBackoff,
}

// === impl WatchStream ===

impl WatchStream {
    /// Registers a notification handler for the resource and returns the
    /// streaming response.
    pub(crate) async fn start(self) -> Result<Response<Body>> {
        let wake = Arc::new(WakeSignal::default());
        let handler = SubscriptionHandler::new(Filter::for_resource(&self.resource), wake.clone());
        let id = self
            .subscriptions
            .subscribe(&self.resource, Arc::new(handler))
            .await?;
        debug!(id = id.0, resource = %self.resource.reference(), "Subscribed");

        let registration = Registration {
            id,
            subscriptions: self.subscriptions.clone(),
            backoff: DeregisterBackoff::default(),
        };
        let guard = self.metrics.stream_opened();
        let events = self.events(wake, registration, guard);

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, "keep-alive")
            .body(StreamBody::new(events).boxed_unsync())
            .expect("watch response must be valid"))
    }

    fn events(
        self,
        wake: Arc<WakeSignal>,
        registration: Registration,
        guard: StreamGuard,
    ) -> impl Stream<Item = Result<Frame<Bytes>, Infallible>> + Send + 'static {
        let Self {
            client,
            resource,
            options,
            idle,
            metrics,
            drain,
            ..
        } = self;

        async_stream::stream! {
            // Both are released when the stream is dropped.
            let _registration = registration;
            let _guard = guard;

            tokio::pin! {
                let shutdown = drain.signaled();
            }

            loop {
                if wake.take() {
                    match snapshot(&*client, &resource, &options).await {
                        Ok(data) => {
                            trace!(bytes = data.len(), "Sending event");
                            metrics.event_sent();
                            yield Ok::<_, Infallible>(Frame::data(event(&data)));
                        }
                        Err(error) if error.is_not_found() => {
                            debug!(resource = %resource.reference(), "Watched resource deleted");
                            metrics.event_sent();
                            yield Ok::<_, Infallible>(Frame::data(Bytes::from_static(TERMINAL_EVENT)));
                            break;
                        }
                        Err(error) => {
                            warn!(%error, "Failed to fetch watched resource");
                            break;
                        }
                    }
                    continue;
                }

                tokio::select! {
                    _ = wake.wait(idle) => {}
                    _ = &mut shutdown => {
                        debug!("Shutting down watch stream");
                        break;
                    }
                }
            }
        }
    }
}

/// Fetches the current state of the watched object or collection.
async fn snapshot(
    client: &dyn ClusterClient,
    resource: &ResourceDescriptor,
    options: &ListOptions,
) -> Result<Vec<u8>> {
    let data = if resource.name.is_some() {
        serde_json::to_vec(&client.get(resource).await?)
    } else {
        serde_json::to_vec(&client.list(resource, options).await?)
    };
    data.map_err(|error| Error::Server(error.into()))
}

fn event(data: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(data.len() + 22);
    buf.extend_from_slice(b"event:message\ndata:");
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\n\n");
    buf.into()
}

// === impl Registration ===

impl Drop for Registration {
    fn drop(&mut self) {
        let id = self.id;
        let subscriptions = self.subscriptions.clone();
        let backoff = self.backoff;
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let span = info_span!("deregister", id = id.0);
                rt.spawn(deregister(subscriptions, id, backoff).instrument(span));
            }
            Err(_) => warn!(id = id.0, "No runtime to deregister the watch handler"),
        }
    }
}

/// Deregisters a handler, retrying failures with a bounded backoff.
///
/// Failures are only logged; they never reach the client.
pub(crate) async fn deregister(
    subscriptions: Arc<dyn Subscribe>,
    id: SubscriptionId,
    backoff: DeregisterBackoff,
) {
    let mut delays = backoff.delays();
    let mut attempts = 0;
    loop {
        attempts += 1;
        let error = match subscriptions.deregister(id).await {
            Ok(()) => {
                debug!(attempts, "Deregistered");
                return;
            }
            Err(error) if error.is_not_found() => {
                debug!(%error, "Handler already deregistered");
                return;
            }
            Err(error) => error,
        };

        match delays.next() {
            Some(delay) => {
                debug!(%error, attempts, ?delay, "Failed to deregister; retrying");
                time::sleep(delay).await;
            }
            None => {
                warn!(%error, attempts, "Failed to deregister; giving up");
                return;
            }
        }
    }
}
