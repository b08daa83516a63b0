//! Prometheus collectors, registered with the default registry and served
//! over the debug HTTP endpoint.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};

pub static CONNECTIONS_ACCEPTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "quokkadb_connections_accepted_total",
        "Accepted TCP connections."
    )
    .unwrap()
});

pub static CONNECTIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "quokkadb_connections_active",
        "Currently open client connections."
    )
    .unwrap()
});

pub static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "quokkadb_requests_total",
        "Requests read from clients.",
        &["opcode"]
    )
    .unwrap()
});

pub static COMMANDS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "quokkadb_commands_total",
        "Dispatched commands by outcome.",
        &["command", "result"]
    )
    .unwrap()
});
