//! Thin logging setup. Metall itself only emits `log` records; it is
//! the embedding application's job to install a subscriber (env_logger
//! in our tests). This module just honours the `METALL_LOGGER_LEVEL`
//! knob mentioned in spec §6 by raising the crate-wide max level filter
//! the first time any kernel entry point runs.
use std::sync::Once;

static INIT: Once = Once::new();

/// Reads `METALL_LOGGER_LEVEL` (one of `silent`, `critical`, `error`,
/// `warning`, `info`, `debug`, `verbose`, case-insensitive) and applies
/// it as the process-wide `log` max level filter. A no-op after the
/// first call.
pub fn init_from_env() {
    INIT.call_once(|| {
        let level = std::env::var("METALL_LOGGER_LEVEL").unwrap_or_default();
        let filter = match level.to_ascii_lowercase().as_str() {
            "silent" => log::LevelFilter::Off,
            "critical" | "error" => log::LevelFilter::Error,
            "warning" | "warn" => log::LevelFilter::Warn,
            "info" => log::LevelFilter::Info,
            "debug" => log::LevelFilter::Debug,
            "verbose" | "trace" => log::LevelFilter::Trace,
            _ => log::LevelFilter::Warn,
        };
        log::set_max_level(filter);
    });
}
