use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec, register_int_gauge, register_int_gauge_vec, Encoder, IntCounterVec, IntGauge,
    IntGaugeVec, TextEncoder,
};

lazy_static! {
    pub static ref REFRESH_TOTAL: IntCounterVec = register_int_counter_vec!(
        "iptv_refresh_total",
        "Refresh attempts by kind (channels, epg) and outcome (ok, error)",
        &["kind", "outcome"]
    )
    .unwrap();
    pub static ref CHANNELS: IntGauge = register_int_gauge!(
        "iptv_channels",
        "Number of channels in the current snapshot"
    )
    .unwrap();
    pub static ref EPG_CHANNELS: IntGauge = register_int_gauge!(
        "iptv_epg_channels",
        "Number of channels with a programme guide in the current snapshot"
    )
    .unwrap();
    pub static ref LAST_SUCCESS: IntGaugeVec = register_int_gauge_vec!(
        "iptv_last_success_timestamp_seconds",
        "Unix time of the last successful refresh by kind",
        &["kind"]
    )
    .unwrap();
}

pub fn record_refresh(kind: &str, ok: bool, at_unix: i64) {
    let outcome = if ok { "ok" } else { "error" };
    REFRESH_TOTAL.with_label_values(&[kind, outcome]).inc();
    if ok {
        LAST_SUCCESS.with_label_values(&[kind]).set(at_unix);
    }
}

pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: err={}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
