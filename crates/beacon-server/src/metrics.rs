use prometheus::{register_counter, Counter};
use std::net::SocketAddr;
use warp::Filter;

lazy_static::lazy_static! {
    pub static ref TRACES_INGESTED_TOTAL: Counter = register_counter!(
        "beacon_traces_ingested_total",
        "Total number of trace beacons accepted"
    ).unwrap();

    pub static ref INGEST_ERRORS_TOTAL: Counter = register_counter!(
        "beacon_ingest_errors_total",
        "Total number of trace beacons rejected"
    ).unwrap();

    pub static ref READ_QUERIES_TOTAL: Counter = register_counter!(
        "beacon_read_queries_total",
        "Total number of read-back queries served"
    ).unwrap();
}

pub async fn start_metrics_server(host: String, port: u16) {
    let metrics_route = warp::path("metrics").map(|| {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = prometheus::gather();
        let mut buffer = vec![];
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    });

    let addr: SocketAddr = match format!("{}:{}", host, port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!("Invalid metrics listen address: {}", e);
            return;
        }
    };
    println!("Starting metrics server on http://{}/metrics", addr);
    warp::serve(metrics_route).run(addr).await;
}
