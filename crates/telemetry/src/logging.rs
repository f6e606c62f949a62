// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    env,
    io::IsTerminal,
    sync::{Arc, Mutex, Once},
};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, Registry, filter, layer::SubscriberExt, prelude::*};

/// Configuration options for the logging system.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingOptions {
    /// Directory for log files. Empty means stdout only. Created on demand
    /// with hourly rotation when set.
    pub dir: String,

    /// Log level filter string ("info", "debug,queued_store=trace", ...).
    /// Falls back to `RUST_LOG`, then "info".
    pub level: Option<String>,

    /// Output format for log lines.
    pub log_format: LogFormat,

    /// Maximum number of rotated log files to retain.
    pub max_log_files: usize,

    /// Whether to log to stdout in addition to files.
    pub append_stdout: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            dir:           String::new(),
            level:         None,
            log_format:    LogFormat::Text,
            max_log_files: 720,
            append_stdout: true,
        }
    }
}

/// Available log output formats.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Machine-parseable JSON lines.
    Json,
    /// Human-readable text.
    #[default]
    Text,
}

/// Default filter when neither `LoggingOptions.level` nor `RUST_LOG` is set.
const DEFAULT_LOG_TARGETS: &str = "info";

/// Initialize tracing with default options for simple embedders.
///
/// The returned guards must be kept alive for logging to function.
#[must_use]
pub fn init_tracing_subscriber(app_name: &str) -> Vec<WorkerGuard> {
    init_global_logging(app_name, &LoggingOptions::default())
}

/// Global storage for unit test logging worker guards, kept alive for the
/// whole test process.
static GLOBAL_UT_LOG_GUARD: Lazy<Arc<Mutex<Option<Vec<WorkerGuard>>>>> =
    Lazy::new(|| Arc::new(Mutex::new(None)));

/// Initialize logging for unit tests.
///
/// Safe to call from any number of tests; only the first call takes effect.
/// `UNITTEST_LOG_DIR` and `UNITTEST_LOG_LEVEL` override the defaults.
pub fn init_default_ut_logging() {
    static START: Once = Once::new();

    START.call_once(|| {
        let mut g = GLOBAL_UT_LOG_GUARD.as_ref().lock().unwrap();

        let dir = env::var("UNITTEST_LOG_DIR").unwrap_or_default();
        let level = env::var("UNITTEST_LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());

        let opts = LoggingOptions {
            dir,
            level: Some(level),
            ..Default::default()
        };
        *g = Some(init_global_logging("unittest", &opts));
    });
}

/// Initialize the global tracing subscriber.
///
/// Sets up a stdout layer (if `append_stdout`) and an hourly-rotated file
/// layer (if `dir` is non-empty). Can only take effect once per process;
/// later calls return no guards.
///
/// # Panics
///
/// Panics when the log directory cannot be prepared or the level string does
/// not parse. Observability failures should be caught at startup, not
/// swallowed.
pub fn init_global_logging(app_name: &str, opts: &LoggingOptions) -> Vec<WorkerGuard> {
    static START: Once = Once::new();
    let mut guards = vec![];

    START.call_once(|| {
        let stdout_layer = if opts.append_stdout {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
            guards.push(guard);

            if opts.log_format == LogFormat::Json {
                Some(
                    tracing_subscriber::fmt::Layer::new()
                        .json()
                        .with_writer(writer)
                        .with_ansi(std::io::stdout().is_terminal())
                        .boxed(),
                )
            } else {
                Some(
                    tracing_subscriber::fmt::Layer::new()
                        .with_writer(writer)
                        .with_ansi(std::io::stdout().is_terminal())
                        .boxed(),
                )
            }
        } else {
            None
        };

        let file_layer = if opts.dir.is_empty() {
            None
        } else {
            let rolling_appender = RollingFileAppender::builder()
                .rotation(Rotation::HOURLY)
                .filename_prefix(app_name.to_string())
                .max_log_files(opts.max_log_files)
                .build(&opts.dir)
                .unwrap_or_else(|e| {
                    panic!(
                        "initializing rolling file appender at {} failed: {}",
                        &opts.dir, e
                    )
                });
            let (writer, guard) = tracing_appender::non_blocking(rolling_appender);
            guards.push(guard);

            if opts.log_format == LogFormat::Json {
                Some(
                    tracing_subscriber::fmt::Layer::new()
                        .json()
                        .with_writer(writer)
                        .with_ansi(false)
                        .boxed(),
                )
            } else {
                Some(
                    tracing_subscriber::fmt::Layer::new()
                        .with_writer(writer)
                        .with_ansi(false)
                        .boxed(),
                )
            }
        };

        let targets = opts
            .level
            .as_deref()
            .or(env::var(EnvFilter::DEFAULT_ENV).ok().as_deref())
            .unwrap_or(DEFAULT_LOG_TARGETS)
            .parse::<filter::Targets>()
            .expect("error parsing log level string");

        let subscriber = Registry::default()
            .with(targets)
            .with(stdout_layer)
            .with(file_layer);

        tracing::subscriber::set_global_default(subscriber)
            .expect("error setting global tracing subscriber");
    });

    guards
}
