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

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::Duration,
};

use serde_derive::Deserialize;
use tracing::{info, instrument, warn};

use crate::errors::ConfigError;

#[instrument(skip_all)]
pub fn read_config(path: &Path) -> Result<Settings, ConfigError> {
    let config_str = fs::read_to_string(path).map_err(|source| ConfigError::ConfigUnreadable {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&config_str).map_err(|source| ConfigError::ConfigUnparseable {
        path: path.display().to_string(),
        source,
    })
}

/// `sshframe`'s on-disk configuration. Every field beyond `host_key` and
/// `listen_addr` has a sensible default so a bare `[listen_addr = "..."]`
/// file is already valid, the same contract `libshpool`'s `Config` makes
/// with its all-`Option` fields.
#[derive(Deserialize, Debug, Clone)]
pub struct Settings {
    /// Path to the host private key, OpenSSH or PEM format.
    pub host_key: PathBuf,

    /// Address the acceptor binds, e.g. `"0.0.0.0:2222"`.
    pub listen_addr: String,

    /// `"local"` (spawn shells/commands locally) or `"proxy"` (bridge to
    /// `upstream`). Mirrors spec.md §6's two `Protocol` modes.
    #[serde(default)]
    pub mode: Mode,

    /// Required when `mode = "proxy"`: the upstream host to dial for every
    /// forwarded channel.
    pub upstream: Option<UpstreamConfig>,

    /// Default timeout applied to payload racks created for behaviors that
    /// don't specify one explicitly. Spec.md §4.1's "reasonable default."
    #[serde(default = "default_rack_timeout_secs")]
    pub rack_timeout_secs: u64,

    /// Shell used to satisfy a bare `shell` request in local mode. Mirrors
    /// the `shell` config override, minus the login-shell dash convention
    /// which `behaviors::shell` applies unconditionally.
    #[serde(default)]
    pub shell: Option<String>,

    /// Environment variables injected into spawned shells/commands.
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
}

impl Settings {
    pub fn rack_timeout(&self) -> Duration {
        Duration::from_secs(self.rack_timeout_secs)
    }
}

fn default_rack_timeout_secs() -> u64 {
    30
}

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Local,
    Proxy,
}

#[derive(Deserialize, Debug, Clone)]
pub struct UpstreamConfig {
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
}

/// Watches the config file on disk and exposes the most recently parsed
/// `Settings` behind a lock, modeled on `libshpool`'s `config_watcher.rs`:
/// a `notify` watcher feeding a callback that re-reads and re-parses,
/// logging and keeping the old settings on any failure rather than
/// poisoning the running server with a half-applied edit.
pub struct Watcher {
    current: Arc<RwLock<Settings>>,
    // Keeping the watcher alive for the lifetime of `Watcher` is what keeps
    // the underlying OS watch descriptors open; it is never read again.
    _inner: notify::RecommendedWatcher,
}

impl Watcher {
    pub fn spawn(path: PathBuf) -> Result<Self, ConfigError> {
        use notify::Watcher as _;

        let initial = read_config(&path)?;
        let current = Arc::new(RwLock::new(initial));

        let watched = Arc::clone(&current);
        let watched_path = path.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) => event,
                Err(err) => {
                    warn!(error = %err, "config watcher error");
                    return;
                }
            };
            if !event.kind.is_modify() && !event.kind.is_create() {
                return;
            }
            match read_config(&watched_path) {
                Ok(settings) => {
                    info!(path = %watched_path.display(), "reloaded config");
                    *watched.write().expect("config lock poisoned") = settings;
                }
                Err(err) => {
                    warn!(error = %err, "failed to reload config, keeping previous settings");
                }
            }
        })
        .map_err(|err| ConfigError::ConfigUnreadable {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, err),
        })?;

        watcher
            .watch(&path, notify::RecursiveMode::NonRecursive)
            .map_err(|err| ConfigError::ConfigUnreadable {
                path: path.display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, err),
            })?;

        Ok(Self { current, _inner: watcher })
    }

    pub fn current(&self) -> Settings {
        self.current.read().expect("config lock poisoned").clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ntest::timeout;

    #[test]
    #[timeout(30000)]
    fn parse_minimal() -> anyhow::Result<()> {
        let cases = vec![
            r#"
            host_key = "/etc/sshframe/host_key"
            listen_addr = "0.0.0.0:2222"
            "#,
            r#"
            host_key = "/etc/sshframe/host_key"
            listen_addr = "0.0.0.0:2222"
            mode = "proxy"

            [upstream]
            address = "10.0.0.5"
            port = 22
            "#,
            r#"
            host_key = "/etc/sshframe/host_key"
            listen_addr = "127.0.0.1:2022"
            rack_timeout_secs = 5
            shell = "/bin/bash"

            [env]
            TERM = "xterm-256color"
            "#,
        ];

        for case in cases.into_iter() {
            let _: Settings = toml::from_str(case)?;
        }

        Ok(())
    }

    #[test]
    #[timeout(30000)]
    fn proxy_mode_round_trips_upstream() -> anyhow::Result<()> {
        let settings: Settings = toml::from_str(
            r#"
            host_key = "/etc/sshframe/host_key"
            listen_addr = "0.0.0.0:2222"
            mode = "proxy"

            [upstream]
            address = "upstream.example.com"
            port = 2200
            user = "svc"
            "#,
        )?;
        assert_eq!(settings.mode, Mode::Proxy);
        let upstream = settings.upstream.expect("upstream config present");
        assert_eq!(upstream.address, "upstream.example.com");
        assert_eq!(upstream.port, 2200);
        assert_eq!(upstream.user.as_deref(), Some("svc"));
        Ok(())
    }

    #[test]
    #[timeout(30000)]
    fn default_rack_timeout_is_thirty_seconds() -> anyhow::Result<()> {
        let settings: Settings = toml::from_str(
            r#"
            host_key = "/etc/sshframe/host_key"
            listen_addr = "0.0.0.0:2222"
            "#,
        )?;
        assert_eq!(settings.rack_timeout(), Duration::from_secs(30));
        Ok(())
    }
}
