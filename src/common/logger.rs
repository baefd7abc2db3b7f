use std::sync::Once;

use env_logger::Builder;
use log::LevelFilter;

static INIT: Once = Once::new();

/// Installs the process-wide logger: `warn` for foreign crates, `debug`
/// for this one, both overridable through `RUST_LOG`. Callable from every
/// test; only the first call installs anything.
pub fn initialize_logger() {
    INIT.call_once(|| {
        Builder::new()
            .filter_level(LevelFilter::Warn)
            .filter_module("petra", LevelFilter::Debug)
            .format_timestamp_millis()
            .parse_default_env()
            .try_init()
            .ok();
    });
}
