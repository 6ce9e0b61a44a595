use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use log::{info, warn};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TEXT_FORMAT, TextEncoder,
};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

use crate::model::{CounterKey, Delta};

pub const DEFAULT_METRICS_ADDR: &str = "127.0.0.1:9464";

/// Frame sizes from minimum Ethernet up to jumbo and GSO aggregates.
const BYTES_BUCKETS: &[f64] = &[
    64.0, 128.0, 256.0, 512.0, 1024.0, 1500.0, 9000.0, 65536.0, 262144.0, 1048576.0,
];

// Label names are kept in sorted order, the order they are exposed in.
const LABELS: &[&str] = &["ifindex", "proto"];

/// `bpf_packets_total` and `bpf_bytes`, labelled by protocol and interface.
/// Global counters carry an empty `ifindex`.
#[derive(Clone)]
pub struct ProtoMetrics {
    registry: Arc<Registry>,
    packets: IntCounterVec,
    bytes: HistogramVec,
}

impl ProtoMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let packets = IntCounterVec::new(
            Opts::new("bpf_packets_total", "Packets observed by the ingress classifier"),
            LABELS,
        )?;
        registry.register(Box::new(packets.clone()))?;

        let bytes = HistogramVec::new(
            HistogramOpts::new("bpf_bytes", "Bytes observed by the ingress classifier per scrape")
                .buckets(BYTES_BUCKETS.to_vec()),
            LABELS,
        )?;
        registry.register(Box::new(bytes.clone()))?;

        Ok(Self {
            registry,
            packets,
            bytes,
        })
    }

    /// Keys that did not move leave both series untouched.
    pub fn record(&self, deltas: &[Delta]) {
        for delta in deltas {
            let (ifindex, proto) = match delta.key {
                CounterKey::Global(tag) => (String::new(), tag.name()),
                CounterKey::Interface(key) => (key.ifindex.to_string(), key.tag().name()),
            };
            let labels = [ifindex.as_str(), proto];
            if delta.change.packets > 0 {
                let packets = u64::try_from(delta.change.packets).unwrap_or(u64::MAX);
                self.packets.with_label_values(&labels).inc_by(packets);
            }
            if delta.change.bytes > 0 {
                self.bytes
                    .with_label_values(&labels)
                    .observe(delta.change.bytes as f64);
            }
        }
    }

    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("failed to encode metrics")?;
        String::from_utf8(buffer).context("metrics are not valid UTF-8")
    }
}

pub struct MetricsServer {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl MetricsServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(err) = self.task.await {
            warn!("metrics server task failed: {err}");
        }
    }
}

/// Serves `/metrics` and `/healthz` until [`MetricsServer::shutdown`].
pub async fn serve(metrics: ProtoMetrics, addr: SocketAddr) -> Result<MetricsServer> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
    let addr = listener.local_addr().context("metrics listener has no address")?;

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz))
        .with_state(metrics);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await;
        if let Err(err) = served {
            warn!("metrics server stopped: {err}");
        }
    });
    info!("serving metrics on http://{addr}/metrics");

    Ok(MetricsServer {
        addr,
        shutdown_tx,
        task,
    })
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn metrics_handler(State(metrics): State<ProtoMetrics>) -> Response {
    match metrics.render() {
        Ok(body) => ([(header::CONTENT_TYPE, TEXT_FORMAT)], body).into_response(),
        Err(err) => {
            warn!("{err:#}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use proto_counter_common::{IfProtoKey, ProtoTag};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;
    use crate::model::Totals;

    fn delta(key: CounterKey, packets: u128, bytes: u128) -> Delta {
        let change = Totals { packets, bytes };
        Delta {
            key,
            change,
            total: change,
        }
    }

    #[test]
    fn records_packets_and_bytes_per_label_set() {
        let metrics = ProtoMetrics::new().expect("metrics");
        let iface = CounterKey::Interface(IfProtoKey::new(3, ProtoTag::Ipv4));
        metrics.record(&[
            delta(CounterKey::Global(ProtoTag::Ipv4), 2, 128),
            delta(iface, 2, 128),
        ]);
        metrics.record(&[delta(iface, 1, 1500)]);

        assert_eq!(metrics.packets.with_label_values(&["", "ipv4"]).get(), 2);
        assert_eq!(metrics.packets.with_label_values(&["3", "ipv4"]).get(), 3);
        let hist = metrics.bytes.with_label_values(&["3", "ipv4"]);
        assert_eq!(hist.get_sample_count(), 2);
        assert_eq!(hist.get_sample_sum(), 1628.0);
    }

    #[test]
    fn unchanged_keys_are_not_exported() {
        let metrics = ProtoMetrics::new().expect("metrics");
        metrics.record(&[delta(CounterKey::Global(ProtoTag::Other), 0, 0)]);

        let text = metrics.render().expect("render");
        assert!(!text.contains("proto=\"other\""));
    }

    #[test]
    fn render_uses_icmp6_label() {
        let metrics = ProtoMetrics::new().expect("metrics");
        metrics.record(&[delta(CounterKey::Global(ProtoTag::Icmpv6), 1, 70)]);

        let text = metrics.render().expect("render");
        assert!(text.contains("bpf_packets_total{ifindex=\"\",proto=\"icmp6\"} 1"));
        assert!(text.contains("bpf_bytes_bucket{ifindex=\"\",proto=\"icmp6\",le=\"128\"} 1"));
    }

    #[tokio::test]
    async fn serves_metrics_over_http() {
        let metrics = ProtoMetrics::new().expect("metrics");
        metrics.record(&[delta(CounterKey::Global(ProtoTag::Ipv6), 4, 360)]);
        let server = serve(metrics, "127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("serve");

        let mut stream = TcpStream::connect(server.local_addr()).await.expect("connect");
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .expect("write request");
        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("read response");

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("bpf_packets_total{ifindex=\"\",proto=\"ipv6\"} 4"));
        server.shutdown().await;
    }
}
