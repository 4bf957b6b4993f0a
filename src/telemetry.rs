//! Tracing backend init, guarded so it only ever runs once per process.
//! Native target installs `tracing_subscriber::fmt` with an `EnvFilter`;
//! wasm32 installs `tracing_wasm`, mirroring the teacher's `telemetry.rs`.

use std::sync::Once;

use tracing::Level;

static INIT: Once = Once::new();

/// Install the tracing backend at `level`. Safe to call more than once;
/// only the first call takes effect.
pub fn init(level: Level) {
    INIT.call_once(|| {
        init_once(level);
    });
}

#[cfg(not(target_arch = "wasm32"))]
fn init_once(level: Level) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    tracing_subscriber::fmt().with_env_filter(filter).init();
    tracing::info!("tracing initialized at level = {level}");
}

#[cfg(target_arch = "wasm32")]
fn init_once(level: Level) {
    console_error_panic_hook::set_once();

    let config = tracing_wasm::WASMLayerConfigBuilder::new()
        .set_max_level(level)
        .build();
    tracing_wasm::set_as_global_default_with_config(config);
    tracing::info!("tracing initialized at level = {level}");
}

/// Parse a level from a string, defaulting to `info` for anything
/// unrecognized (hosts may surface a free-text log-level preference).
pub fn parse_level(s: &str) -> Level {
    match s.to_ascii_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" | "warning" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_level_defaults_to_info() {
        assert_eq!(parse_level("bogus"), Level::INFO);
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
    }
}
