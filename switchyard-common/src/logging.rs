use std::str::FromStr;

use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::FilterFn, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

#[macro_export]
macro_rules! log {
    ($level:expr, $span:expr, $($msg:tt)*) => {{
        let span = $crate::tracing::span!($level, $span);
        let _enter = span.enter();

        $crate::tracing::event!($level, $($msg)*)
    }};
}

/// Daemon lifecycle: startup, scans, triggers, shutdown.
#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "internal", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::internal!(level = TRACE, $($msg)*)
    };
}

/// Moving messages into and out of the active queue.
#[macro_export]
macro_rules! admission {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "admission", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::admission!(level = TRACE, $($msg)*)
    };
}

/// Scheduling decisions and delivery session traffic.
#[macro_export]
macro_rules! delivery {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "delivery", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::delivery!(level = TRACE, $($msg)*)
    };
}

fn level_from_env(default: LevelFilter) -> LevelFilter {
    std::env::var("LOG_LEVEL").map_or(default, |level| {
        LevelFilter::from_str(level.as_str()).unwrap_or_else(|_| {
            eprintln!("Invalid log level specified {level}, defaulting to {default}");
            default
        })
    })
}

/// Install the global subscriber. Only events from `switchyard*` targets are
/// emitted; the level comes from `LOG_LEVEL`.
pub fn init() {
    let default = if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };

    tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(false)
                .with_line_number(false)
                .with_target(false)
                .compact()
                .with_ansi(true)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                .with_filter(level_from_env(default))
                .with_filter(FilterFn::new(|metadata| {
                    metadata.target().starts_with("switchyard")
                })),
        )
        .init();
}
