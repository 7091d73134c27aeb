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

//! The composition root (spec §2/§6 "Protocol"): binds a `Descriptor`, the
//! route tree, the session manager, the SSH acceptor, and the internal
//! pub/sub pipes into one running server, and owns the local ↔ proxy mode
//! switch (spec §4.5). Mirrors `daemon::run` + `daemon::server::Server::new`:
//! one constructor wires every subsystem together, one `serve` call hands
//! control to the acceptor loop.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock as StdRwLock,
    },
};

use anyhow::Context;
use russh_keys::key::KeyPair;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument};

pub use sshframe_types::Descriptor;

use crate::{
    acceptor::Acceptor,
    auth::Auth,
    behaviors,
    channel::{
        local::{self, LocalChannelManager},
        proxy::{ProxyChannelManager, UpstreamHandler},
        ChannelClosed, ChannelNetwork, ChannelPayload, ChannelsPacket, OutboundsPacket,
    },
    config::{Mode, Settings, UpstreamConfig},
    consts,
    errors::ConfigError,
    hooks::{Hooks, NoopHooks},
    pipe::Topic,
    proxy_broker::{ChannelMaker, ProxyBroker},
    route::Route,
    session::{Session, SessionManager, Upstream},
};

/// Where proxy mode dials for every forwarded channel. Separate from
/// `config::UpstreamConfig` because the username actually used to
/// authenticate comes from whoever is logging in, not a config file.
#[derive(Clone)]
pub struct UpstreamTarget {
    pub address: String,
    pub port: u16,
}

impl From<&UpstreamConfig> for UpstreamTarget {
    fn from(c: &UpstreamConfig) -> Self {
        UpstreamTarget { address: c.address.clone(), port: c.port }
    }
}

/// Loads an RSA/Ed25519 private key from disk (spec §6 "Host keys").
/// Unparseable or unreadable keys are a configuration fault: fatal at
/// construction, per spec §7.
fn load_host_key(path: &Path) -> Result<KeyPair, ConfigError> {
    russh_keys::load_secret_key(path, None).map_err(|source| ConfigError::HostKeyUnparseable {
        path: path.display().to_string(),
        source,
    })
}

/// Builds a `Protocol`. Every subsystem besides `auth` has a workable
/// default, the same bare-minimum-required-fields contract
/// `config::Settings` makes for a TOML file.
pub struct ProtocolBuilder {
    descriptor: Descriptor,
    listen_addr: SocketAddr,
    host_key_path: PathBuf,
    auth: Option<Auth>,
    hooks: Arc<dyn Hooks + Send + Sync>,
    upstream: Option<UpstreamTarget>,
    mode: Mode,
    default_timeout_ms: i64,
    channel_maker: Option<Arc<dyn ChannelMaker>>,
    shell_config: behaviors::ShellConfig,
}

impl ProtocolBuilder {
    pub fn new(descriptor: Descriptor, listen_addr: SocketAddr, host_key_path: impl Into<PathBuf>) -> Self {
        ProtocolBuilder {
            descriptor,
            listen_addr,
            host_key_path: host_key_path.into(),
            auth: None,
            hooks: Arc::new(NoopHooks),
            upstream: None,
            mode: Mode::Local,
            default_timeout_ms: 30_000,
            channel_maker: None,
            shell_config: behaviors::ShellConfig::default(),
        }
    }

    /// Builds a descriptor from `settings` (the listen address doubles as
    /// the descriptor's address/port) and carries over its mode, upstream,
    /// and rack timeout.
    pub fn from_settings(settings: &Settings, service: impl Into<String>, auth: Auth) -> anyhow::Result<Self> {
        let listen_addr: SocketAddr = settings.listen_addr.parse().context("parsing listen_addr")?;
        let descriptor = Descriptor::new(
            "tcp",
            service,
            listen_addr.ip().to_string(),
            listen_addr.port(),
            "default",
            "ssh",
        );

        let mut builder = Self::new(descriptor, listen_addr, settings.host_key.clone())
            .with_auth(auth)
            .with_mode(settings.mode)
            .with_default_timeout_ms(settings.rack_timeout().as_millis() as i64)
            .with_shell_config(behaviors::ShellConfig {
                shell_override: settings.shell.clone(),
                extra_env: settings.env.clone(),
            });
        if let Some(upstream) = &settings.upstream {
            builder = builder.with_upstream(UpstreamTarget::from(upstream));
        }
        Ok(builder)
    }

    pub fn with_auth(mut self, auth: Auth) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn Hooks + Send + Sync>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_upstream(mut self, upstream: UpstreamTarget) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn with_default_timeout_ms(mut self, ms: i64) -> Self {
        self.default_timeout_ms = ms;
        self
    }

    pub fn with_channel_maker(mut self, maker: Arc<dyn ChannelMaker>) -> Self {
        self.channel_maker = Some(maker);
        self
    }

    pub fn with_shell_config(mut self, shell_config: behaviors::ShellConfig) -> Self {
        self.shell_config = shell_config;
        self
    }

    /// Wires up the route tree (`service/session/{pty-req,shell,exec,
    /// window-change}`, each subscribed to its spec §4.7 behavior, plus a
    /// default refusal for anything else), the session manager, the four
    /// internal pipes, and the acceptor; installs the local channel
    /// manager; and, if `mode` is `Proxy`, immediately switches it over to
    /// proxy mode before returning.
    #[instrument(skip_all, fields(service = %self.descriptor.service))]
    pub async fn build(self) -> anyhow::Result<Arc<Protocol>> {
        let route_root = Route::new(&self.descriptor.service, self.default_timeout_ms, None);
        // Patch the root so every request below it gets wrapped in a
        // payload rack (spec §4.2's "payload wrapping policy"); behaviors
        // always `release()`/`failed()` rather than handling raw payloads.
        route_root.patch_route();

        let session_route = Route::from_route(&route_root, consts::CHANNEL_TYPE_SESSION).await;

        let pty_route = Route::from_route(&session_route, consts::REQ_PTY).await;
        pty_route.sub(behaviors::pty_req);

        let shell_config = Arc::new(self.shell_config);

        let shell_route = Route::from_route(&session_route, consts::REQ_SHELL).await;
        let shell_cfg = Arc::clone(&shell_config);
        shell_route.sub(move |req| behaviors::shell(req, Arc::clone(&shell_cfg)));

        let exec_route = Route::from_route(&session_route, consts::REQ_EXEC).await;
        let exec_cfg = Arc::clone(&shell_config);
        exec_route.sub(move |req| behaviors::exec(req, Arc::clone(&exec_cfg)));

        let window_route = Route::from_route(&session_route, consts::REQ_WINDOW_CHANGE).await;
        window_route.sub(behaviors::window_change);

        local::install_default_refusal(&[pty_route, shell_route, exec_route, window_route]);

        let sessions = Arc::new(SessionManager::new());
        let network_channels = Topic::new();
        let network_outbounds = Topic::new();
        let network_open = Arc::new(Topic::new());
        let network_close = Arc::new(Topic::new());

        let host_key = load_host_key(&self.host_key_path)?;
        let acceptor = Arc::new(Acceptor::new(self.listen_addr, host_key, Arc::clone(&self.hooks)));

        let local_manager = LocalChannelManager::new(Arc::clone(&route_root), self.descriptor.service.clone());
        local_manager.install(&network_channels);

        let protocol = Arc::new(Protocol {
            descriptor: self.descriptor,
            route_root,
            session_route,
            sessions,
            auth: self.auth,
            hooks: self.hooks,
            network_channels,
            network_outbounds,
            network_open,
            network_close,
            acceptor,
            upstream: self.upstream,
            mode: StdRwLock::new(self.mode),
            proxy_installed: AtomicBool::new(false),
            channel_maker: AsyncMutex::new(self.channel_maker),
        });

        if matches!(protocol.mode(), Mode::Proxy) {
            protocol.install_proxy_mode().await?;
        }

        Ok(protocol)
    }
}

/// The running server: every subsystem spec.md §2 lists, bound together.
/// Always held behind an `Arc`, since the acceptor, channel managers, and
/// proxy broker all need to outlive the call that constructed them.
pub struct Protocol {
    pub descriptor: Descriptor,
    pub route_root: Arc<Route<ChannelPayload>>,
    pub session_route: Arc<Route<ChannelPayload>>,
    pub sessions: Arc<SessionManager>,
    pub auth: Option<Auth>,
    pub hooks: Arc<dyn Hooks + Send + Sync>,
    pub network_channels: Topic<ChannelsPacket>,
    pub network_outbounds: Topic<OutboundsPacket>,
    pub network_open: Arc<Topic<ChannelNetwork>>,
    pub network_close: Arc<Topic<ChannelClosed>>,
    pub acceptor: Arc<Acceptor>,
    upstream: Option<UpstreamTarget>,
    mode: StdRwLock<Mode>,
    proxy_installed: AtomicBool,
    channel_maker: AsyncMutex<Option<Arc<dyn ChannelMaker>>>,
}

impl Protocol {
    pub fn mode(&self) -> Mode {
        *self.mode.read().expect("protocol mode lock poisoned")
    }

    /// Runs the acceptor loop. Returns once `shutdown()` has been called
    /// and every in-flight `Accept` has drained.
    pub async fn serve(self: &Arc<Self>) -> anyhow::Result<()> {
        Arc::clone(&self.acceptor).serve(Arc::clone(self)).await
    }

    /// The protocol-wide cancellation source (spec §5): propagates into
    /// the accept loop and, through it, every per-connection task that
    /// selects on the acceptor's closer.
    pub fn shutdown(&self) {
        self.acceptor.shutdown();
    }

    /// Replaces the local channel manager with the proxy one (spec §4.5):
    /// clears `network_channels`' subscribers (ending the local manager's
    /// drain loop once its sender is dropped), then installs
    /// `ProxyChannelManager` on `network_channels` and `ProxyBroker` on
    /// `network_open`. Idempotent: a second call is a silent no-op, so a
    /// protocol built with `mode = proxy` and a caller that also invokes
    /// this explicitly don't double-install.
    #[instrument(skip_all)]
    pub async fn install_proxy_mode(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.proxy_installed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.mode.write().expect("protocol mode lock poisoned") = Mode::Proxy;

        self.network_channels.clear_listeners();

        let proxy_manager = ProxyChannelManager::new(Arc::clone(&self.network_open));
        proxy_manager.install(&self.network_channels);

        let maker = self.channel_maker.lock().await.clone();
        let broker = ProxyBroker::new(Arc::clone(&self.sessions), Arc::clone(&self.network_close), maker);
        broker.install(&self.network_open);

        info!("installed proxy channel manager and broker");
        Ok(())
    }

    /// Creates and registers the `Session` for a newly authenticated
    /// connection (spec §3 "Session... created by authentication callback
    /// on new SSH connection"). In proxy mode this also dials the
    /// configured upstream host and blocks until that connection and its
    /// own authentication complete, so the session is never registered
    /// with a half-open upstream.
    pub async fn create_session(&self, addr: SocketAddr, user: String, pass: Option<String>) -> anyhow::Result<Arc<Session>> {
        let session = match self.mode() {
            Mode::Local => Session::new_local(addr, user, pass),
            Mode::Proxy => {
                let target = self.upstream.as_ref().context("proxy mode configured with no upstream target")?;
                let session = Session::new_proxy(addr, user.clone(), pass.clone());
                let upstream = dial_upstream(target, &user, pass.as_deref()).await?;
                if let Some(slot) = &session.upstream {
                    *slot.lock().await = Some(upstream);
                }
                session
            }
        };
        self.sessions.insert(Arc::clone(&session));
        Ok(session)
    }
}

/// Dials the upstream SSH host and authenticates as `user`, reusing the
/// downstream password (password-auth pass-through is the common bastion
/// use case this crate targets). A downstream public-key login has no
/// password to forward upstream, so proxy mode only supports password
/// auth today; a caller whose fleet needs upstream credentials derived
/// some other way should dial manually and populate `Session::upstream`
/// itself rather than go through this path.
async fn dial_upstream(target: &UpstreamTarget, user: &str, pass: Option<&str>) -> anyhow::Result<Upstream> {
    let pass = pass.context("proxy mode requires a password to pass through to the upstream host")?;

    let (data_tx, _data_rx) = tokio::sync::mpsc::unbounded_channel();
    let handler = UpstreamHandler { data_tx };
    let config = Arc::new(russh::client::Config::default());

    let mut handle = russh::client::connect(config, (target.address.as_str(), target.port), handler)
        .await
        .context("dialing upstream ssh host")?;

    let authenticated = handle.authenticate_password(user, pass).await.context("upstream password auth")?;
    if !authenticated {
        anyhow::bail!("upstream rejected authentication for user {user}");
    }

    Ok(Upstream { handle, container_ref: None })
}

// Re-exported so callers don't need to depend on `proxy_broker` just to
// name the hook type `ProtocolBuilder::with_channel_maker` accepts.
pub use crate::proxy_broker::ChannelMaker as UpstreamChannelMaker;
