//! Tracing setup.
//!
//! `MUXBEE_LOG` overrides the filter (e.g. `debug`, `muxbee=trace`). When unset
//! `RUST_LOG` is honoured, then a per-target default. The dashboard owns the
//! terminal, so it logs to a daily file instead of stderr.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::EnvFilter;

const LOG_ENV: &str = "MUXBEE_LOG";

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn filter(default: &str) -> EnvFilter {
    match std::env::var(LOG_ENV) {
        Ok(directive) => EnvFilter::try_new(&directive).unwrap_or_else(|err| {
            eprintln!("invalid {LOG_ENV} directive ({err}); using {default}");
            EnvFilter::new(default)
        }),
        Err(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
    }
}

/// One-shot commands: warnings and above on stderr.
pub fn init_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(filter("warn"))
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .try_init()
        .ok();
}

/// Dashboard: everything at info and above into `<dir>/muxbee.log.<date>`.
pub fn init_file(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("create log dir {}", dir.display()))?;
    let appender = tracing_appender::rolling::daily(dir, "muxbee.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = FILE_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(filter("info"))
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .try_init()
        .ok();
    tracing::info!(log_dir = %dir.display(), "tracing initialised");
    Ok(())
}
