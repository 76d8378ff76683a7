// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A logger for use by wifid and the daemon library.
//!
//! Uses the env_logger crate that allows control of logging through
//! the RUST_LOG environment variable.

use chrono::Local;
use env_logger::{Builder, Env};
use log::{Level, Record};
use std::{ffi::OsStr, io::Write, path::Path};

/// Initiating the environment for logging with given prefix.
///
/// Verbose raises the default filter from `info` to `debug`; an explicit
/// RUST_LOG always wins.
pub fn init(prefix: &'static str, verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let mut builder = Builder::from_env(Env::default().default_filter_or(default_filter));
    builder.format(move |buf, record| {
        let message = format!(
            "{} {} {} {}:{} - {}",
            prefix,
            level_to_string(record.level()),
            current_time(),
            format_file(record),
            record.line().unwrap_or(0),
            record.args()
        );
        writeln!(buf, "{}", message)
    });
    builder.init();
}

/// Initiating the environment for logging in Rust unit tests.
///
/// Safe to call from every test; only the first call installs the logger.
pub fn init_for_test() {
    let mut binding = Builder::from_env(Env::default().default_filter_or("info"));
    let builder = binding.is_test(true);
    builder.format(move |buf, record| {
        let message = format!(
            "{} {} \t| wifi-test: {}",
            level_to_string(record.level()),
            current_time(),
            record.args()
        );
        writeln!(buf, "{}", message)
    });
    let _ = builder.try_init();
}

/// Local wall clock time as HH:MM:SS.mmm
fn current_time() -> String {
    Local::now().format("%H:%M:%S%.3f").to_string()
}

/// Helper function for parsing the file name from given record file path
fn format_file<'a>(record: &'a Record<'a>) -> &'a str {
    match record.file() {
        Some(filepath) => {
            Path::new(filepath).file_name().and_then(OsStr::to_str).unwrap_or("N/A")
        }
        None => "N/A",
    }
}

/// Helper function for translating log levels to string.
fn level_to_string(level: Level) -> &'static str {
    match level {
        Level::Error => "E",
        Level::Warn => "W",
        Level::Info => "I",
        Level::Debug => "D",
        Level::Trace => "T",
    }
}
