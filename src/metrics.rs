// metrics.rs - Prometheus instrumentation for the transport and engines.

use prometheus::{IntCounter, IntGauge, Registry};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    pub datagrams_sent: IntCounter,
    pub datagrams_received: IntCounter,
    pub bytes_sent: IntCounter,
    pub bytes_received: IntCounter,
    pub send_errors: IntCounter,
    pub recv_errors: IntCounter,
    pub packets_skipped_no_destination: IntCounter,
    pub malformed_frames: IntCounter,
    pub negotiation_requests: IntCounter,
    pub negotiation_responses: IntCounter,
    pub samples_up: IntCounter,
    pub samples_down: IntCounter,
    pub negotiation_timeouts: IntCounter,
    pub peers_tracked: IntGauge,
    pub peers_evicted: IntCounter,
    pub send_queue_depth: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new_custom(Some("samplink".into()), None)?;

        macro_rules! register_counter {
            ($name:expr, $help:expr) => {{
                let counter = IntCounter::new($name, $help)?;
                registry.register(Box::new(counter.clone()))?;
                counter
            }};
        }

        macro_rules! register_gauge {
            ($name:expr, $help:expr) => {{
                let gauge = IntGauge::new($name, $help)?;
                registry.register(Box::new(gauge.clone()))?;
                gauge
            }};
        }

        let datagrams_sent =
            register_counter!("datagrams_sent_total", "Datagrams written to the socket");
        let datagrams_received =
            register_counter!("datagrams_received_total", "Datagrams read from the socket");
        let bytes_sent =
            register_counter!("bytes_sent_total", "Payload bytes written to the socket");
        let bytes_received =
            register_counter!("bytes_received_total", "Payload bytes read from the socket");
        let send_errors = register_counter!("send_errors_total", "Transient socket send failures");
        let recv_errors =
            register_counter!("recv_errors_total", "Transient socket receive failures");
        let packets_skipped_no_destination = register_counter!(
            "packets_skipped_no_destination_total",
            "Outbound packets dropped for lack of a destination endpoint"
        );
        let malformed_frames = register_counter!(
            "malformed_frames_total",
            "Inbound datagrams dropped as malformed or of unknown type"
        );
        let negotiation_requests = register_counter!(
            "negotiation_requests_total",
            "Negotiation requests processed"
        );
        let negotiation_responses = register_counter!(
            "negotiation_responses_total",
            "Negotiation responses processed"
        );
        let samples_up = register_counter!("samples_up_total", "SampleUp messages delivered");
        let samples_down = register_counter!("samples_down_total", "SampleDown messages delivered");
        let negotiation_timeouts = register_counter!(
            "negotiation_timeouts_total",
            "Negotiation ticks that fired while a response was still pending"
        );
        let peers_tracked =
            register_gauge!("peers_tracked", "Peer records currently in the registry");
        let peers_evicted =
            register_counter!("peers_evicted_total", "Peer records removed by the sweeper");
        let send_queue_depth =
            register_gauge!("send_queue_depth", "Packets waiting in the outbound queue");

        Ok(Self {
            registry,
            datagrams_sent,
            datagrams_received,
            bytes_sent,
            bytes_received,
            send_errors,
            recv_errors,
            packets_skipped_no_destination,
            malformed_frames,
            negotiation_requests,
            negotiation_responses,
            samples_up,
            samples_down,
            negotiation_timeouts,
            peers_tracked,
            peers_evicted,
            send_queue_depth,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}
