// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fs, io, sync::Mutex};

use anyhow::Context;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::format::FmtSpan,
    layer::SubscriberExt as _,
    reload,
    util::SubscriberInitExt as _,
};

pub type LevelHandle =
    reload::Handle<LevelFilter, tracing_subscriber::registry::Registry>;

/// Installs a global `tracing` subscriber, writing to `log_file` if given
/// and stderr otherwise, with a reload handle so `protocol::Protocol` can
/// be told to change verbosity at runtime (e.g. in response to a SIGUSR1,
/// or an admin command in a wrapping binary).
pub fn init(verbose: u8, log_file: Option<&str>) -> anyhow::Result<LevelHandle> {
    let level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let (filter, handle) = reload::Layer::new(level);

    let registry = tracing_subscriber::registry().with(filter);

    if let Some(path) = log_file {
        let file = fs::File::create(path).context("creating log file")?;
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_thread_ids(true)
                    .with_target(false)
                    .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                    .with_writer(Mutex::new(file)),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_thread_ids(true)
                    .with_target(false)
                    .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                    .with_writer(io::stderr),
            )
            .init();
    }

    Ok(handle)
}

/// Changes the installed log level at runtime.
pub fn set_level(handle: &LevelHandle, level: LevelFilter) -> anyhow::Result<()> {
    handle.modify(|filter| *filter = level).context("modifying log level")
}
