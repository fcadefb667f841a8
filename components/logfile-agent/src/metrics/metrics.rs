use lazy_static::lazy_static;
use prometheus::{
    Gauge, IntCounter, IntCounterVec, register_gauge, register_int_counter,
    register_int_counter_vec,
};

lazy_static! {
    pub static ref DROPPED_EVENTS: IntCounterVec = register_int_counter_vec!(
        "logfile_dropped_events_total",
        "Events dropped by the include/exclude filter chain",
        &["group", "stream"]
    )
    .unwrap();
    pub static ref TRUNCATED_EVENTS: IntCounter = register_int_counter!(
        "logfile_truncated_events_total",
        "Events truncated to the configured maximum event size"
    )
    .unwrap();
    pub static ref OPEN_FILE_HANDLES: Gauge = register_gauge!(
        "logfile_open_file_handles",
        "File handles currently held by active tailers"
    )
    .unwrap();
    pub static ref STATE_FLUSHES: IntCounter = register_int_counter!(
        "logfile_state_flushes_total",
        "Offset state files written to disk"
    )
    .unwrap();
    pub static ref DECODE_ERRORS: IntCounter = register_int_counter!(
        "logfile_decode_errors_total",
        "Lines dropped because they failed to decode"
    )
    .unwrap();
}
