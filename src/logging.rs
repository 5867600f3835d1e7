use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;
use once_cell::sync::OnceCell;

static RUST_LOG_ONCE: Once = Once::new();
static INSTALLED_LEVEL: OnceCell<LevelFilter> = OnceCell::new();

fn env_level() -> LevelFilter {
    parse_level(
        std::env::var("EEGDAQ_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .ok()
            .as_deref(),
    )
    .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.parse::<LevelFilter>().ok())
}

/// Initialize logging (stderr formatter) based on `EEGDAQ_LOG`/`RUST_LOG`.
///
/// An explicit `level` overrides the environment. Safe to call multiple times;
/// only the first call installs the logger, and every call returns the level
/// that is actually in effect.
pub fn init_logging(level: Option<&str>) -> LevelFilter {
    let level = parse_level(level).unwrap_or_else(env_level);
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level_to_str(level));
        let installed = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init()
            .is_ok();
        if installed {
            let _ = INSTALLED_LEVEL.set(level);
        }
    });
    INSTALLED_LEVEL.get().copied().unwrap_or(level)
}
