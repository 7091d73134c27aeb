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

//! The data that flows between the acceptor, the two channel managers, and
//! the proxy broker over the pipes owned by `protocol::Protocol` (spec
//! §2's data-flow diagram, §3's "Channel Network").
//!
//! `russh`'s server side is callback-driven (`Handler::channel_open_session`,
//! `Handler::pty_request`, ...) rather than exposing the raw
//! `<-chan ssh.NewChannel` / `<-chan *ssh.Request` streams the original Go
//! library does. `acceptor::SshHandler` is the adapter: every callback it
//! receives from `russh` is translated into one of the types below and
//! fed into a per-connection `mpsc` channel, so everything downstream
//! (route tree, channel managers, proxy broker) still sees the
//! stream-of-events shape spec.md describes.

use std::{net::SocketAddr, sync::Arc};

use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, Notify};

use crate::pty::Pty;

pub mod local;
pub mod proxy;

/// Identifies the SSH connection an event belongs to.
#[derive(Debug, Clone)]
pub struct ConnMeta {
    pub addr: SocketAddr,
    pub conn_id: u64,
    pub user: String,
}

/// One out-of-band session-channel-request (spec §4.7's `pty-req`,
/// `shell`, `exec`, `window-change`, `exit-status`, plus `env`), decoupled
/// from `russh`'s own callback shape so behaviors never see a transport
/// type directly.
pub struct OobRequest {
    pub request_type: String,
    pub payload: Vec<u8>,
    pub want_reply: bool,
    reply: Option<oneshot::Sender<bool>>,
}

impl OobRequest {
    pub fn new(request_type: impl Into<String>, payload: Vec<u8>, want_reply: bool) -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (OobRequest { request_type: request_type.into(), payload, want_reply, reply: Some(tx) }, rx)
    }

    /// Answers the request at most once, matching spec §4.4's `once`
    /// guard: a second call (or a dropped guard with a reply still
    /// pending) is a silent no-op rather than a panic or protocol error.
    pub fn reply(&mut self, ok: bool) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(ok);
        }
    }

    pub fn already_replied(&self) -> bool {
        self.reply.is_none()
    }
}

/// A newly opened channel, handed from `acceptor::SshHandler` to whichever
/// channel manager (local or proxy) is currently subscribed to
/// `NetworkChannels`.
pub struct NewChannel {
    pub channel_id: russh::ChannelId,
    pub channel_type: String,
    pub extra: Vec<u8>,
    pub handle: russh::server::Handle,
    pub requests: mpsc::UnboundedReceiver<OobRequest>,
    pub data: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Published on `NetworkChannels` (spec §2): the connection's out-of-band
/// new-channel stream, shared via a lockable handle. In practice exactly
/// one side drains it, because `Protocol::install_proxy_mode` clears the
/// local channel manager's subscription before installing the proxy one
/// (spec §4.5, "by clearing local NetworkChannels subscribers").
#[derive(Clone)]
pub struct ChannelsPacket {
    pub conn: ConnMeta,
    pub new_channels: Arc<AsyncMutex<mpsc::UnboundedReceiver<NewChannel>>>,
    /// Fires when this one connection is torn down (client hangup only).
    pub closer: Arc<Notify>,
    /// The protocol-wide shutdown notifier (spec §5's root cancellation
    /// source), carried alongside `closer` so every per-connection loop can
    /// select on both rather than only the narrower per-connection one.
    pub protocol_closer: Arc<Notify>,
}

/// Published on `NetworkOutbounds` (spec §4.3): the connection-wide global
/// request stream (keepalives and the like). Discarded by default.
#[derive(Clone)]
pub struct OutboundsPacket {
    pub conn: ConnMeta,
    pub requests: Arc<AsyncMutex<mpsc::UnboundedReceiver<OobRequest>>>,
}

/// Per-channel record published on `NetworkOpen` (spec §3 "Channel
/// Network"): everything the proxy broker needs to bridge this channel to
/// an upstream peer. `requests`/`data` are lockable, like
/// `ChannelsPacket::new_channels`, so the record stays `Clone` even though
/// only one subscriber ever actually drains them in practice (spec §4.5:
/// the local manager never serves a proxy-mode channel's requests itself).
#[derive(Clone)]
pub struct ChannelNetwork {
    pub conn: ConnMeta,
    pub channel_id: russh::ChannelId,
    pub channel_type: String,
    pub extra: Vec<u8>,
    pub handle: russh::server::Handle,
    pub requests: Arc<AsyncMutex<mpsc::UnboundedReceiver<OobRequest>>>,
    pub data: Arc<AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    pub local_closer: Arc<Notify>,
    pub protocol_closer: Arc<Notify>,
    pub pty: Option<Arc<Pty>>,
}

/// Published on `NetworkClose` once the proxy broker (or, in local mode,
/// the per-channel request loop) tears a channel down.
#[derive(Debug, Clone)]
pub struct ChannelClosed {
    pub conn: ConnMeta,
    pub channel_id: russh::ChannelId,
}

/// What a behavior (spec §4.7) actually receives once the route tree
/// serves a request to it: the channel to reply/write on, the specific
/// request (racked, so `Release`/`Failed` apply per spec §4.2's payload-
/// wrapping policy), and the pty if one was allocated for this channel.
#[derive(Clone)]
pub struct ChannelPayload {
    pub handle: russh::server::Handle,
    pub channel_id: russh::ChannelId,
    pub request: Arc<AsyncMutex<OobRequest>>,
    /// Shared with the channel's `ChannelNetwork.data`, so a `shell`/`exec`
    /// behavior can drain client-sent bytes into the spawned process's
    /// stdin once it starts one.
    pub data: Arc<AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    pub pty: Option<Arc<Pty>>,
}
