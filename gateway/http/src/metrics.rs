use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

/// Request and watch-stream metrics for the gateway's HTTP surface.
#[derive(Clone, Debug, Default)]
pub struct HttpMetrics {
    requests: Family<RequestLabels, Counter>,
    watch_streams: Gauge,
    watch_events: Counter,
}

/// Decrements the open-stream gauge when a watch stream is dropped.
#[derive(Debug)]
pub(crate) struct StreamGuard(Gauge);

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RequestLabels {
    verb: &'static str,
    status: String,
}

// === impl HttpMetrics ===

impl HttpMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let requests = Family::<RequestLabels, Counter>::default();
        reg.register(
            "requests",
            "Total number of requests completed by the gateway",
            requests.clone(),
        );

        let watch_streams = Gauge::default();
        reg.register(
            "watch_streams",
            "Number of watch streams currently open",
            watch_streams.clone(),
        );

        let watch_events = Counter::default();
        reg.register(
            "watch_events",
            "Total number of events pushed to watch streams",
            watch_events.clone(),
        );

        Self {
            requests,
            watch_streams,
            watch_events,
        }
    }

    pub(crate) fn request(&self, verb: &'static str, status: http::StatusCode) {
        self.requests
            .get_or_create(&RequestLabels {
                verb,
                status: status.as_u16().to_string(),
            })
            .inc();
    }

    pub(crate) fn stream_opened(&self) -> StreamGuard {
        self.watch_streams.inc();
        StreamGuard(self.watch_streams.clone())
    }

    pub(crate) fn event_sent(&self) {
        self.watch_events.inc();
    }

    pub fn open_streams(&self) -> i64 {
        self.watch_streams.get()
    }

    pub fn events_sent(&self) -> u64 {
        self.watch_events.get()
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}
