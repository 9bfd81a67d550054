//! Replay-aware logging for workflow code.
//!
//! Workflow functions are re-executed from the top on every pass, so a plain
//! `tracing::info!` inside one would repeat once per pass. These macros only
//! emit while the context is executing new logic (`!ctx.is_replaying()`).

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::info!(instance = %$ctx.instance_id(), turn_idx = $ctx.turn_index(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::warn!(instance = %$ctx.instance_id(), turn_idx = $ctx.turn_index(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::error!(instance = %$ctx.instance_id(), turn_idx = $ctx.turn_index(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_debug {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::debug!(instance = %$ctx.instance_id(), turn_idx = $ctx.turn_index(), $($arg)+);
        }
    }};
}

/// Install a `tracing` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Safe to call repeatedly; only the first call installs a subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
