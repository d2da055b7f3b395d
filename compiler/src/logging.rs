//! Logging configuration for the middle tier
//!
//! Built on `log` and `env_logger`. Passes log through the `log` macros and
//! open `tracing` spans around per-function work; both end up in the same
//! output when a subscriber is not installed.
//!
//! # Log Levels
//!
//! - `error!` - failures that abort a function
//! - `warn!` - recovered failures (fallback types, poisoned variables)
//! - `info!` - pipeline phases (build, link, resolve)
//! - `debug!` - per-function summaries (block, phi and SCC counts)
//! - `trace!` - per-node detail (fixpoint rounds, renaming steps)
//!
//! # Environment Variable
//!
//! ```bash
//! RUST_LOG=midend=info cargo test
//! RUST_LOG=midend::typegraph::resolve=trace cargo test
//! ```

use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize logging at `Warn`. Subsequent calls are no-ops.
pub fn init() {
    init_with_level(LevelFilter::Warn);
}

/// Initialize logging with a specific level. Subsequent calls are no-ops.
pub fn init_with_level(level: LevelFilter) {
    init_with_filters(level, &[]);
}

/// Initialize logging with a default level plus per-module overrides,
/// e.g. `[("midend::ssa", LevelFilter::Trace)]`.
pub fn init_with_filters(level: LevelFilter, modules: &[(&str, LevelFilter)]) {
    INIT.call_once(|| {
        let mut builder = Builder::new();
        builder.filter_level(level);
        for (module, filter) in modules {
            builder.filter_module(module, *filter);
        }
        builder
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{:5}] {} - {}",
                    record.level(),
                    record.target(),
                    record.args()
                )
            })
            .init();
    });
}

/// Initialize logging from `RUST_LOG`, defaulting to `warn`.
pub fn init_from_env() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    });
}

/// Initialize logging for tests.
///
/// Output is captured by the test harness; safe to call from every test.
pub fn init_test() {
    let _ = env_logger::builder()
        .filter_level(LevelFilter::Warn)
        .parse_env("RUST_LOG")
        .is_test(true)
        .try_init();
}

pub fn is_initialized() -> bool {
    INIT.is_completed()
}
