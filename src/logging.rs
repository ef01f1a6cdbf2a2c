// src/logging.rs

//! Diagnostics for `dynbuild`.
//!
//! Worker threads are named `<thread_name_prefix>-N`, so each line shows
//! which thread ran the task body that logged it. At `debug` the engine logs
//! task starts and completions along with cache hits; `trace` adds every
//! accounting transition and registry lookup.
//!
//! `--log-level` sets one level for everything. Without it, `DYNBUILD_LOG`
//! takes either a bare level (`warning` is accepted) or `tracing` filter
//! directives such as `info,dynbuild::engine=trace`. The default is `info`.
//! Output goes to stderr; stdout only carries the build result.

use anyhow::{Context, Result, anyhow};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogLevel;

pub const LOG_ENV: &str = "DYNBUILD_LOG";

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let env = std::env::var(LOG_ENV).ok();
    let filter = build_filter(cli_level, env.as_deref())?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!("installing log subscriber: {err}"))
}

/// The filter for a CLI level and a raw `DYNBUILD_LOG` value.
pub fn build_filter(cli_level: Option<LogLevel>, env: Option<&str>) -> Result<EnvFilter> {
    if let Some(level) = cli_level {
        return Ok(EnvFilter::default().add_directive(level_filter(level).into()));
    }
    let Some(raw) = env.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(EnvFilter::default().add_directive(LevelFilter::INFO.into()));
    };
    if let Some(level) = parse_level_str(raw) {
        return Ok(EnvFilter::default().add_directive(LevelFilter::from_level(level).into()));
    }
    EnvFilter::try_new(raw).with_context(|| format!("invalid {LOG_ENV} value {raw:?}"))
}

fn level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Error => LevelFilter::ERROR,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Trace => LevelFilter::TRACE,
    }
}

pub fn parse_level_str(s: &str) -> Option<tracing::Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(tracing::Level::ERROR),
        "warn" | "warning" => Some(tracing::Level::WARN),
        "info" => Some(tracing::Level::INFO),
        "debug" => Some(tracing::Level::DEBUG),
        "trace" => Some(tracing::Level::TRACE),
        _ => None,
    }
}
