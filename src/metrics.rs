use prometheus::{
    register_histogram, register_int_counter_vec, register_int_gauge, Histogram, IntCounterVec, IntGauge,
};

lazy_static! {
    pub static ref CLIENTS_TOTAL: IntGauge =
        register_int_gauge!("mumbled_clients_total", "Number of connected clients").unwrap();
    pub static ref MESSAGES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "mumbled_messages_total",
        "Number of messages processed",
        &["protocol", "direction", "kind"]
    )
    .unwrap();
    pub static ref MESSAGES_BYTES: IntCounterVec = register_int_counter_vec!(
        "mumbled_messages_bytes",
        "Number of message bytes processed",
        &["protocol", "direction", "kind"]
    )
    .unwrap();
    pub static ref MESSAGE_PROCESS_SECONDS: Histogram = register_histogram!(
        "mumbled_message_process_seconds",
        "Time spent handling one control message"
    )
    .unwrap();
}
