use crate::syncer::Side;

use prometheus::{
    exponential_buckets, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec,
    IntGauge, IntGaugeVec, Opts, Registry,
};

use std::fmt::{self, Debug};

const SYNCER: &[&str] = &["syncer"];
const SYNCER_AND_CLUSTER: &[&str] = &["syncer", "cluster"];
const CLUSTER: &[&str] = &["cluster"];

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    api_server_request_times: HistogramVec,
    total_watch_events_received: IntCounter,
    sync_passes_by_syncer: IntCounterVec,
    sync_errors_by_syncer: IntCounterVec,
    writes_by_syncer: IntCounterVec,
    resources_by_syncer: IntGaugeVec,
    watcher_requests_by_syncer: IntCounterVec,
    watcher_errors_by_syncer: IntCounterVec,
    watch_events_by_syncer: IntCounterVec,
}

impl Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Metrics")
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let counter = IntCounterVec::new(Opts::new(name, help), labels).unwrap();
    registry.register(Box::new(counter.clone())).unwrap();
    counter
}

impl Metrics {
    pub fn new() -> Metrics {
        let registry = Registry::new();

        // 5ms, 10, 20, 40, 80, 160, 320, 640, 1280, 2560, 5120, 10240
        let request_time_opts = HistogramOpts::new(
            "api_server_request_time",
            "Total time from sending the request to receiving the response headers",
        )
        .subsystem("client")
        .buckets(exponential_buckets(0.005, 2.0, 12).unwrap());
        let api_server_request_times = HistogramVec::new(request_time_opts, CLUSTER).unwrap();
        registry
            .register(Box::new(api_server_request_times.clone()))
            .unwrap();

        let watch_events_opts = Opts::new(
            "events_received",
            "total number of events processed by the plugin, including from watches and initial lists",
        );
        let total_watch_events_received = IntCounter::with_opts(watch_events_opts).unwrap();
        registry
            .register(Box::new(total_watch_events_received.clone()))
            .unwrap();

        let sync_passes_by_syncer = counter_vec(
            &registry,
            "sync_passes",
            "the number of sync passes run by each syncer",
            SYNCER,
        );
        let sync_errors_by_syncer = counter_vec(
            &registry,
            "sync_errors",
            "the number of sync passes that failed, by syncer",
            SYNCER,
        );
        let writes_by_syncer = counter_vec(
            &registry,
            "sync_writes",
            "the number of writes issued by each syncer against each cluster",
            SYNCER_AND_CLUSTER,
        );

        let resource_count_opts = Opts::new(
            "cached_resources",
            "number of resources in the in-memory cache",
        );
        let resources_by_syncer = IntGaugeVec::new(resource_count_opts, SYNCER_AND_CLUSTER).unwrap();
        registry
            .register(Box::new(resources_by_syncer.clone()))
            .unwrap();

        let watcher_requests_by_syncer = counter_vec(
            &registry,
            "watcher_requests",
            "number of list and watch requests from informers",
            SYNCER_AND_CLUSTER,
        );
        let watcher_errors_by_syncer = counter_vec(
            &registry,
            "watcher_errors",
            "number of errors from informers",
            SYNCER_AND_CLUSTER,
        );
        let watch_events_by_syncer = counter_vec(
            &registry,
            "watch_events",
            "number of watch events received by informers",
            SYNCER_AND_CLUSTER,
        );

        Metrics {
            registry,
            api_server_request_times,
            total_watch_events_received,
            sync_passes_by_syncer,
            sync_errors_by_syncer,
            writes_by_syncer,
            resources_by_syncer,
            watcher_requests_by_syncer,
            watcher_errors_by_syncer,
            watch_events_by_syncer,
        }
    }

    pub fn client_metrics(&self, side: Side) -> ClientMetrics {
        ClientMetrics {
            api_server_request_times: self
                .api_server_request_times
                .with_label_values(&[side.as_str()]),
        }
    }

    pub fn watcher_metrics(&self, syncer: &str, side: Side) -> WatcherMetrics {
        let labels = &[syncer, side.as_str()];
        WatcherMetrics {
            watcher_requests: self.watcher_requests_by_syncer.with_label_values(labels),
            watcher_errors: self.watcher_errors_by_syncer.with_label_values(labels),
            watch_events: self.watch_events_by_syncer.with_label_values(labels),
            resource_count: self.resources_by_syncer.with_label_values(labels),
            total_watch_events_received: self.total_watch_events_received.clone(),
        }
    }

    pub fn syncer_metrics(&self, syncer: &str) -> SyncerMetrics {
        SyncerMetrics {
            passes: self.sync_passes_by_syncer.with_label_values(&[syncer]),
            errors: self.sync_errors_by_syncer.with_label_values(&[syncer]),
            virtual_writes: self
                .writes_by_syncer
                .with_label_values(&[syncer, Side::Virtual.as_str()]),
            host_writes: self
                .writes_by_syncer
                .with_label_values(&[syncer, Side::Host.as_str()]),
        }
    }

    pub fn encode_as_text(&self) -> Result<Vec<u8>, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::with_capacity(4096);
        encoder.encode(self.registry.gather().as_slice(), &mut buffer)?;
        Ok(buffer)
    }
}

impl Default for Metrics {
    fn default() -> Metrics {
        Metrics::new()
    }
}

#[derive(Clone)]
pub struct ClientMetrics {
    api_server_request_times: Histogram,
}

impl Debug for ClientMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("ClientMetrics")
    }
}

impl ClientMetrics {
    pub fn request_started(&self) -> prometheus::HistogramTimer {
        self.api_server_request_times.start_timer()
    }
}

#[derive(Clone)]
pub struct WatcherMetrics {
    watcher_requests: IntCounter,
    watcher_errors: IntCounter,
    watch_events: IntCounter,
    resource_count: IntGauge,
    total_watch_events_received: IntCounter,
}

impl Debug for WatcherMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("WatcherMetrics")
    }
}

impl WatcherMetrics {
    pub fn set_resource_count(&self, count: usize) {
        self.resource_count.set(count as i64);
    }

    pub fn request_started(&self) {
        self.watcher_requests.inc();
    }

    pub fn event_received(&self) {
        self.watch_events.inc();
        self.total_watch_events_received.inc();
    }

    pub fn error(&self) {
        self.watcher_errors.inc();
    }
}

#[derive(Clone)]
pub struct SyncerMetrics {
    passes: IntCounter,
    errors: IntCounter,
    virtual_writes: IntCounter,
    host_writes: IntCounter,
}

impl Debug for SyncerMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("SyncerMetrics")
    }
}

impl SyncerMetrics {
    pub fn pass_started(&self) {
        self.passes.inc();
    }

    pub fn pass_failed(&self) {
        self.errors.inc();
    }

    pub fn write(&self, side: Side) {
        match side {
            Side::Virtual => self.virtual_writes.inc(),
            Side::Host => self.host_writes.inc(),
        }
    }

    pub fn pass_count(&self) -> u64 {
        self.passes.get()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn metrics_are_created_and_encoded() {
        let metrics = Metrics::new();
        let syncer = metrics.syncer_metrics("secrets");
        syncer.pass_started();
        syncer.write(Side::Host);
        metrics.watcher_metrics("secrets", Side::Virtual).event_received();

        let text = String::from_utf8(metrics.encode_as_text().unwrap()).unwrap();
        assert!(text.contains("sync_passes{syncer=\"secrets\"} 1"));
        assert!(text.contains("sync_writes{cluster=\"host\",syncer=\"secrets\"} 1"));
        assert!(text.contains("events_received 1"));
        assert_eq!(1, syncer.pass_count());
    }
}
