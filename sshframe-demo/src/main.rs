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

//! Reference binary for `sshframe`: parses a TOML config file, builds a
//! `Protocol` in local or proxy mode depending on what it says, and runs
//! it until a term signal arrives. A password-only demo auth predicate is
//! installed so the binary is runnable out of the box; anything wanting a
//! real authentication backend links `sshframe` as a library instead.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use futures::stream::StreamExt;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook_tokio::Signals;
use sshframe::{
    auth::{Auth, ConnMeta, PassAuth, PassAuthResult, Permissions},
    config, logging,
    protocol::{Protocol, ProtocolBuilder},
};
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[clap(author, about, version = VERSION)]
struct Args {
    #[clap(short, long, action, help = "a toml file containing configuration")]
    config_file: String,

    #[clap(short, long, action, help = "the file to write logs to; stderr if unset")]
    log_file: Option<String>,

    #[clap(short, long, action = clap::ArgAction::Count, help = "show more in logs, may be given multiple times")]
    verbose: u8,
}

/// Accepts any username/password pair and stashes the password on the
/// session so proxy mode can pass it through to the upstream host (spec
/// §6's password predicate). Not meant for anything beyond a demo: a real
/// deployment supplies its own `PassAuth`/`KeyAuth` via `ProtocolBuilder`.
struct DemoPassAuth;

impl PassAuth for DemoPassAuth {
    fn check(&self, _protocol: &Arc<Protocol>, meta: &ConnMeta, password: &str) -> PassAuthResult {
        info!(user = %meta.user, addr = %meta.addr, "demo auth accepting login");
        Ok(Permissions { session_pass: Some(password.to_string()) })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_handle = logging::init(args.verbose, args.log_file.as_deref())?;

    let settings = config::read_config(std::path::Path::new(&args.config_file))
        .with_context(|| format!("reading config file {}", args.config_file))?;

    let auth = Auth::Password(Arc::new(DemoPassAuth));
    let builder = ProtocolBuilder::from_settings(&settings, "sshframe-demo", auth)
        .context("building protocol from config")?;
    let protocol = builder.build().await.context("starting protocol")?;

    spawn_signal_handler(Arc::clone(&protocol))?;

    info!(mode = ?protocol.mode(), "sshframe-demo listening");
    protocol.serve().await.context("acceptor loop failed")
}

/// Watches `TERM_SIGNALS` on their own task and calls `Protocol::shutdown`
/// on the first one, letting in-flight connections finish rather than
/// tearing the process down immediately, mirroring the graceful half of
/// `daemon::signals::Handler` (minus the "exit hard on a second signal"
/// escape hatch, since there's no listening socket file here to clean up).
fn spawn_signal_handler(protocol: Arc<Protocol>) -> anyhow::Result<()> {
    let mut signals = Signals::new(TERM_SIGNALS).context("registering term signal handler")?;
    tokio::spawn(async move {
        if signals.next().await.is_some() {
            info!("term signal received, shutting down acceptor");
            protocol.shutdown();
        }
    });
    Ok(())
}
