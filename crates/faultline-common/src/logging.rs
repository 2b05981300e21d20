//! ---
//! fl_section: "01-core-functionality"
//! fl_subsection: "module"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Structured logging bootstrap."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
//! Logging for harness runs.
//!
//! Every engine module logs under `faultline::resilience::<module>`:
//!
//! * `orchestrator` and `runner` report scenario start, classification and
//!   escalation at `info`, and hard-timeout cut-offs at `error`.
//! * `circuit_breaker` reports state transitions at `info` and trial recycling
//!   at `warn`.
//! * `fault` reports each scenario fault layered onto or lifted from a stub.
//!   Individual injected failures are `debug` so soak runs stay readable.
//! * `queue` reports rejected and dropped work at `warn`.
//!
//! A filter such as `FAULTLINE_LOG=info,faultline::resilience::fault=debug`
//! follows one dependency's injected calls without the rest of the noise.
use std::path::PathBuf;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "FAULTLINE_LOG";
const DEFAULT_DIRECTIVE: &str = "info";

/// Writer guards for the run; dropping them would lose buffered records.
#[derive(Debug)]
struct WriterGuards {
    _file: WorkerGuard,
    _stdout: WorkerGuard,
}

static GUARDS: OnceCell<WriterGuards> = OnceCell::new();

/// Console format for harness output. The run log file is always JSON.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    /// One JSON object per event, for CI collectors.
    #[default]
    StructuredJson,
    /// Human-readable lines for local scenario debugging.
    Pretty,
}

/// Filter from `FAULTLINE_LOG`, then `RUST_LOG`, then `info`.
///
/// An unparsable `FAULTLINE_LOG` falls back to `info` with a note on stderr
/// rather than failing the run.
fn filter_from(directive: Option<String>) -> EnvFilter {
    match directive {
        Some(directive) => EnvFilter::try_new(&directive).unwrap_or_else(|err| {
            eprintln!(
                "invalid {LOG_ENV} directive {directive:?} ({err}); using {DEFAULT_DIRECTIVE}"
            );
            EnvFilter::new(DEFAULT_DIRECTIVE)
        }),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE)),
    }
}

fn env_filter() -> EnvFilter {
    filter_from(std::env::var(LOG_ENV).ok())
}

/// Daily-rolled run log, e.g. `ci-faultline.log.2026-10-19`.
fn run_log_name(service_name: &str, config: &LoggingConfig) -> String {
    let prefix = config.file_prefix.as_deref().unwrap_or(service_name);
    format!("{prefix}-{service_name}.log")
}

/// Install the harness subscriber: console output in `config.format` plus a
/// JSON run log under `config.directory` that CI keeps as an artifact.
///
/// Only the first call in a process installs anything.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<PathBuf> {
    std::fs::create_dir_all(&config.directory).with_context(|| {
        format!("unable to create log directory {}", config.directory.display())
    })?;
    let file_name = run_log_name(service_name, config);
    let (file_writer, file_guard) =
        tracing_appender::non_blocking(daily(&config.directory, &file_name));
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let console = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };
    let run_log = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(file_writer)
        .boxed();

    let installed = tracing_subscriber::registry()
        .with(env_filter())
        .with(console)
        .with(run_log)
        .try_init()
        .is_ok();
    if installed {
        let _ = GUARDS.set(WriterGuards {
            _file: file_guard,
            _stdout: stdout_guard,
        });
        info!(
            target: "faultline::common",
            service = %service_name,
            run_log = %config.directory.join(&file_name).display(),
            format = ?config.format,
            "harness logging ready",
        );
    }
    Ok(config.directory.join(file_name))
}

/// Plain subscriber for tests; captured by the test harness and idempotent.
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_test_writer())
        .try_init();
}
