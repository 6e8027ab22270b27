//! Replay-aware logging macros for orchestration code.
//!
//! Plain `tracing` calls inside an orchestration would fire again on
//! every replay. These variants consult the context and stay silent
//! until replay has caught up with recorded history, so each message is
//! emitted once per logical decision.

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::info!(turn_idx = $ctx.turn_index(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::warn!(turn_idx = $ctx.turn_index(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::error!(turn_idx = $ctx.turn_index(), $($arg)+);
        }
    }};
}
