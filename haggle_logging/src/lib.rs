// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Tracing initialization for the Haggle binaries.
//!
//! Log output goes to stdout or to hourly-rotated files in a directory; the
//! level per target comes from `HAGGLE_LOG` (same CSV form the
//! `tracing_subscriber` targets filter understands) with a sensible default
//! over the workspace crates.

#[macro_use]
extern crate tracing;

mod error;

pub use error::{Error, Result};

use std::fmt::Write as _;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_core::{Event, Level, Subscriber};
use tracing_subscriber::{
    filter::Targets,
    fmt as tracing_fmt,
    fmt::{
        format::Writer,
        time::{FormatTime, SystemTime},
        FmtContext, FormatEvent, FormatFields,
    },
    prelude::*,
    registry::LookupSpan,
};

/// Env var selecting per-target log levels, e.g.
/// `HAGGLE_LOG=haggle_kernel=trace,haggle_protocol=debug`.
pub const LOG_ENV_VAR: &str = "HAGGLE_LOG";

const DEFAULT_LEVEL: Level = Level::DEBUG;
const WORKSPACE_TARGETS: &[&str] = &[
    "haggle_protocol",
    "haggle_kernel",
    "haggle_logging",
    "haggle_node",
];

/// Where log lines end up.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum LogOutputDest {
    #[default]
    Stdout,
    /// Hourly-rotated files in this directory.
    Dir(PathBuf),
}

/// Compact formatter: `[timestamp LEVEL module/span] message`.
#[derive(Default)]
struct LogFormatter;

impl<S, N> FormatEvent<S, N> for LogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let level = *event.metadata().level();
        let module = event.metadata().module_path().unwrap_or("<unknown module>");
        let time = SystemTime;

        write!(writer, "[")?;
        time.format_time(&mut writer)?;
        write!(writer, " {level} {module}")?;
        ctx.visit_spans(|span| write!(writer, "/{}", span.name()))?;
        write!(writer, "] ")?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Initializes the global subscriber. The returned guard must stay alive for
/// the process lifetime when logging to files; dropping it flushes the
/// appender.
pub fn init_logging(dest: LogOutputDest) -> Result<Option<WorkerGuard>> {
    let targets = targets_from_env()?;

    let (layer, guard) = match &dest {
        LogOutputDest::Stdout => {
            let layer = tracing_fmt::layer()
                .with_ansi(false)
                .event_format(LogFormatter)
                .boxed();
            (layer, None)
        }
        LogOutputDest::Dir(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::hourly(dir, "haggle.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking)
                .event_format(LogFormatter)
                .boxed();
            (layer, Some(guard))
        }
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(targets))
        .try_init()
        .map_err(|err| Error::LoggingConfiguration(err.to_string()))?;

    if let LogOutputDest::Dir(dir) = &dest {
        info!("logging to {dir:?}");
    }
    Ok(guard)
}

fn targets_from_env() -> Result<Targets> {
    match std::env::var(LOG_ENV_VAR) {
        Ok(value) => parse_targets(&value),
        Err(_) => Ok(Targets::new().with_targets(
            WORKSPACE_TARGETS
                .iter()
                .map(|target| (target.to_string(), DEFAULT_LEVEL)),
        )),
    }
}

/// Parses `target=level` CSV; a bare `all` entry turns every workspace
/// target up to trace.
fn parse_targets(value: &str) -> Result<Targets> {
    let mut targets: Vec<(String, Level)> = Vec::new();
    for entry in value.split(',').filter(|e| !e.is_empty()) {
        if entry == "all" {
            for target in WORKSPACE_TARGETS {
                targets.push((target.to_string(), Level::TRACE));
            }
            continue;
        }
        match entry.split_once('=') {
            Some((target, level)) => {
                let level = level.parse().map_err(|_| {
                    let mut msg = String::new();
                    let _ = write!(msg, "unknown log level {level:?} for target {target:?}");
                    Error::LoggingConfiguration(msg)
                })?;
                targets.push((target.to_string(), level));
            }
            None => targets.push((entry.to_string(), DEFAULT_LEVEL)),
        }
    }
    Ok(Targets::new().with_targets(targets))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_target_level_csv() {
        assert!(parse_targets("haggle_kernel=trace,tokio=info").is_ok());
        assert!(parse_targets("all").is_ok());
        assert!(parse_targets("haggle_kernel=chatty").is_err());
    }
}
