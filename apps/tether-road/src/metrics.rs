use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static REGISTRATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "tether_road_registrations_total",
            "Register messages accepted by the registry",
        ),
        &["role"],
    )
    .expect("registrations metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static PAIRINGS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("tether_road_pairings_total", "Pairings established"),
        &["method"],
    )
    .expect("pairings metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static ROUTED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "tether_road_routed_total",
            "Peer envelopes forwarded to a partner",
        ),
        &["kind"],
    )
    .expect("routed metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "tether_road_dropped_total",
            "Envelopes dropped before reaching a connection",
        ),
        &["reason"],
    )
    .expect("dropped metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("tether_road_connections", "Open websocket connections")
        .expect("connections metric");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub fn export_prometheus() -> String {
    // Touch lazies so every family shows up even before first use.
    Lazy::force(&REGISTRATIONS);
    Lazy::force(&PAIRINGS);
    Lazy::force(&ROUTED);
    Lazy::force(&DROPPED);
    Lazy::force(&CONNECTIONS);

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!(error = %err, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
