use std::convert::Infallible;

use biometrics::{Collector, Counter, Emitter, Gauge, Histogram, Moments, Sensor};
use time::OffsetDateTime;

pub(crate) static CLIENT_REQUESTS: Counter = Counter::new("lectern.client.requests");
pub(crate) static CLIENT_REQUEST_ERRORS: Counter = Counter::new("lectern.client.request_errors");
pub(crate) static CLIENT_REQUEST_RETRIES: Counter = Counter::new("lectern.client.retries");
pub(crate) static CLIENT_REQUEST_DURATION: Moments =
    Moments::new("lectern.client.request_duration_seconds");
pub(crate) static CLIENT_RETRY_BACKOFF: Moments =
    Moments::new("lectern.client.retry_backoff_seconds");

pub(crate) static STREAM_EVENTS: Counter = Counter::new("lectern.stream.events");
pub(crate) static STREAM_ERRORS: Counter = Counter::new("lectern.stream.errors");
pub(crate) static STREAM_BYTES: Counter = Counter::new("lectern.stream.bytes");
pub(crate) static STREAM_MALFORMED_FRAMES: Counter =
    Counter::new("lectern.stream.malformed_frames");
pub(crate) static STREAM_RELEASES: Counter = Counter::new("lectern.stream.releases");

pub(crate) static CHAT_QUERIES: Counter = Counter::new("lectern.chat.queries");
pub(crate) static CHAT_RATE_LIMITED: Counter = Counter::new("lectern.chat.rate_limited");
pub(crate) static CHAT_CANCELLATIONS: Counter = Counter::new("lectern.chat.cancellations");
pub(crate) static CHAT_FAILURES: Counter = Counter::new("lectern.chat.failures");
pub(crate) static SESSION_PERSIST_ERRORS: Counter =
    Counter::new("lectern.session.persist_errors");

pub(crate) static SELECTION_EVALUATIONS: Counter = Counter::new("lectern.selection.evaluations");

/// Register this crate's biometrics with the provided collector.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&CLIENT_REQUESTS);
    collector.register_counter(&CLIENT_REQUEST_ERRORS);
    collector.register_counter(&CLIENT_REQUEST_RETRIES);
    collector.register_moments(&CLIENT_REQUEST_DURATION);
    collector.register_moments(&CLIENT_RETRY_BACKOFF);

    collector.register_counter(&STREAM_EVENTS);
    collector.register_counter(&STREAM_ERRORS);
    collector.register_counter(&STREAM_BYTES);
    collector.register_counter(&STREAM_MALFORMED_FRAMES);
    collector.register_counter(&STREAM_RELEASES);

    collector.register_counter(&CHAT_QUERIES);
    collector.register_counter(&CHAT_RATE_LIMITED);
    collector.register_counter(&CHAT_CANCELLATIONS);
    collector.register_counter(&CHAT_FAILURES);
    collector.register_counter(&SESSION_PERSIST_ERRORS);

    collector.register_counter(&SELECTION_EVALUATIONS);
}

/// Collects one line per registered sensor, for display.
#[derive(Debug, Default)]
pub struct SnapshotEmitter {
    lines: Vec<String>,
}

impl SnapshotEmitter {
    /// Returns the lines gathered so far.
    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }
}

impl Emitter for SnapshotEmitter {
    type Error = Infallible;

    fn emit_counter(&mut self, counter: &Counter, _: u64) -> Result<(), Infallible> {
        self.lines.push(format!("{} {}", counter.label(), counter.read()));
        Ok(())
    }

    fn emit_gauge(&mut self, gauge: &Gauge, _: u64) -> Result<(), Infallible> {
        self.lines.push(format!("{} {}", gauge.label(), gauge.read()));
        Ok(())
    }

    fn emit_moments(&mut self, moments: &Moments, _: u64) -> Result<(), Infallible> {
        let reading = moments.read();
        self.lines.push(format!(
            "{} n={} mean={:.3}",
            moments.label(),
            reading.n(),
            reading.mean()
        ));
        Ok(())
    }

    fn emit_histogram(&mut self, histogram: &Histogram, _: u64) -> Result<(), Infallible> {
        let label = histogram.label();
        for (bucket, count) in histogram.read().iter() {
            self.lines.push(format!("{label} {{approx={bucket}}} {count}"));
        }
        Ok(())
    }
}

/// Reads every sensor registered with `collector`.
pub fn snapshot(collector: &Collector) -> Vec<String> {
    let mut emitter = SnapshotEmitter::default();
    let now = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64;
    match collector.emit(&mut emitter, now) {
        Ok(()) => {}
        Err(never) => match never {},
    }
    emitter.into_lines()
}
