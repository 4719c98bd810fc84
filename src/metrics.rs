/// Outcome recorded for every logical request.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RequestStatus {
    Success,
    Failure,
}

impl RequestStatus {
    /// Label value, `success` or `failure`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// Fire-and-forget observability sink. Calls must not block.
pub trait MetricsSink: Send + Sync {
    fn record_request(&self, name: &str, duration_ms: u64, status: RequestStatus);
    fn record_cache_hit(&self, name: &str, count: u64);
}

/// Sink that discards everything; the engine default.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_request(&self, _name: &str, _duration_ms: u64, _status: RequestStatus) {}

    fn record_cache_hit(&self, _name: &str, _count: u64) {}
}
