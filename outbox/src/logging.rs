use std::str::FromStr;

use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::FilterFn, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

#[macro_export]
macro_rules! log {
    ($level:expr, $span:expr, $($msg:expr),*) => {{
        let span = $crate::tracing::span!($level, $span);
        let _enter = span.enter();

        $crate::tracing::event!($level, $($msg),*)
    }};
}

/// Trace-level (by default) event inside an `internal` span, for the
/// dispatcher's own bookkeeping.
#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "internal", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::internal!(level = TRACE, $($msg),*)
    };
}

/// Installs a compact stdout subscriber for the `outbox` crates.
///
/// The level comes from `LOG_LEVEL`, defaulting to TRACE in debug builds and
/// INFO in release builds. Panics if a global subscriber is already set; use
/// [`try_init`] where that may happen.
pub fn init() {
    subscriber().init();
}

/// Like [`init`], but returns an error instead of panicking when a global
/// subscriber has already been installed.
pub fn try_init() -> Result<(), tracing_subscriber::util::TryInitError> {
    subscriber().try_init()
}

fn level() -> LevelFilter {
    let default = if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };

    std::env::var("LOG_LEVEL").map_or(default, |level| {
        LevelFilter::from_str(level.as_str()).unwrap_or_else(|_| {
            eprintln!("Invalid log level specified {level}, defaulting to {default}");
            default
        })
    })
}

fn subscriber() -> impl SubscriberInitExt {
    tracing_subscriber::Registry::default().with(
        tracing_subscriber::fmt::layer()
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_ansi(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .with_filter(level())
            .with_filter(FilterFn::new(|metadata| {
                metadata.target().starts_with("outbox")
            })),
    )
}
