/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::fs::OpenOptions;

use slog::{Drain, Logger, slog_o};
use slog_scope::GlobalLoggerGuard;

use crate::config::{LogConfig, LogLevel};

const LOG_THREAD_NAME: &str = "log-process";
const ASYNC_CHAN_SIZE: usize = 4096;

/// Set up the process logger: an async console drain, duplicated into an
/// append-mode file when one is configured, bridged to the `log` facade.
/// The returned guard has to stay alive for the lifetime of the process.
pub fn setup(config: &LogConfig) -> anyhow::Result<GlobalLoggerGuard> {
    let decorator = slog_term::TermDecorator::new().build();
    let console = slog_term::FullFormat::new(decorator).build().fuse();

    let logger = match open_log_file(config) {
        Some(file) => {
            let decorator = slog_term::PlainDecorator::new(file);
            let file_drain = slog_term::FullFormat::new(decorator).build().fuse();
            let both = slog::Duplicate::new(console, file_drain).fuse();
            let drain = slog_async::Async::new(both)
                .thread_name(LOG_THREAD_NAME.to_string())
                .chan_size(ASYNC_CHAN_SIZE)
                .build()
                .fuse();
            Logger::root(drain, slog_o!())
        }
        None => {
            let drain = slog_async::Async::new(console)
                .thread_name(LOG_THREAD_NAME.to_string())
                .chan_size(ASYNC_CHAN_SIZE)
                .build()
                .fuse();
            Logger::root(drain, slog_o!())
        }
    };

    let guard = slog_scope::set_global_logger(logger);

    let level = match config.level {
        LogLevel::Info => log::Level::Info,
        LogLevel::Debug => log::Level::Debug,
    };
    slog_stdlog::init_with_level(level)?;
    Ok(guard)
}

fn open_log_file(config: &LogConfig) -> Option<std::fs::File> {
    let path = config.file.as_ref()?;
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(e) => {
            // keep going with the console only
            eprintln!("failed to open log file {}: {e}", path.display());
            None
        }
    }
}
