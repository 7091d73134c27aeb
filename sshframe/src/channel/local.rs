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

//! The local channel manager (spec §4.4): subscribes to `NetworkChannels`,
//! allocates a pty per accepted channel, serves every out-of-band request
//! through the route tree, and runs whatever behavior (shell, exec, ...)
//! is subscribed there.

use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, instrument, warn};

use crate::{
    channel::{ChannelNetwork, ChannelPayload, ChannelsPacket, NewChannel},
    consts,
    pty::Pty,
    route::{Payload, Route},
};

pub struct LocalChannelManager {
    route_root: Arc<Route<ChannelPayload>>,
    service: String,
}

impl LocalChannelManager {
    pub fn new(route_root: Arc<Route<ChannelPayload>>, service: String) -> Arc<Self> {
        Arc::new(LocalChannelManager { route_root, service })
    }

    /// Subscribes this manager to `protocol.network_channels` and spawns
    /// the loop that drains it. The loop ends on its own once
    /// `Protocol::install_proxy_mode` calls `clear_listeners()` on that
    /// topic (spec §4.5: proxy mode "replaces the local channel manager by
    /// clearing local `NetworkChannels` subscribers"), since that drops
    /// the sender this receiver was reading from.
    pub fn install(self: &Arc<Self>, network_channels: &crate::pipe::Topic<ChannelsPacket>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        let mut rx = network_channels.subscribe();
        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                let this = Arc::clone(&this);
                tokio::spawn(async move { this.handle_connection(packet).await });
            }
        })
    }

    #[instrument(skip_all, fields(conn_id = packet.conn.conn_id))]
    async fn handle_connection(self: Arc<Self>, packet: ChannelsPacket) {
        loop {
            let next = {
                let mut rx = packet.new_channels.lock().await;
                tokio::select! {
                    biased;
                    _ = packet.protocol_closer.notified() => None,
                    _ = packet.closer.notified() => None,
                    new_channel = rx.recv() => new_channel,
                }
            };
            let Some(new_channel) = next else { break };

            let this = Arc::clone(&self);
            let conn = packet.conn.clone();
            let closer = Arc::clone(&packet.closer);
            let protocol_closer = Arc::clone(&packet.protocol_closer);
            tokio::spawn(async move {
                if let Err(err) = this.handle_channel(conn, new_channel, closer, protocol_closer).await {
                    error!(error = ?err, "local channel handling failed");
                }
            });
        }
        info!("connection's new-channel stream ended, local manager done");
    }

    #[instrument(skip_all)]
    async fn handle_channel(
        self: Arc<Self>,
        conn: crate::channel::ConnMeta,
        mut new_channel: NewChannel,
        local_closer: Arc<tokio::sync::Notify>,
        protocol_closer: Arc<tokio::sync::Notify>,
    ) -> anyhow::Result<()> {
        if new_channel.channel_type != consts::CHANNEL_TYPE_SESSION {
            warn!(channel_type = %new_channel.channel_type, "rejecting unknown channel type");
            let _ = new_channel.handle.close(new_channel.channel_id).await;
            return Err(crate::errors::ChannelError::UnknownChannelType(new_channel.channel_type).into());
        }

        let pty = match Pty::open() {
            Ok(pty) => Arc::new(pty),
            Err(err) => {
                error!(error = ?err, "failed to allocate pty, closing channel");
                let _ = new_channel.handle.close(new_channel.channel_id).await;
                return Err(crate::errors::ChannelError::PtyAllocation(err).into());
            }
        };

        // Spec §4.4 step 5: emit the ChannelNetwork record for observers,
        // even though in local mode this manager also serves the channel's
        // requests itself rather than handing them to the proxy broker.
        let network = ChannelNetwork {
            conn: conn.clone(),
            channel_id: new_channel.channel_id,
            channel_type: new_channel.channel_type.clone(),
            extra: new_channel.extra.clone(),
            handle: new_channel.handle.clone(),
            requests: Arc::new(AsyncMutex::new(new_channel.requests)),
            data: Arc::new(AsyncMutex::new(new_channel.data)),
            local_closer: Arc::clone(&local_closer),
            protocol_closer: Arc::clone(&protocol_closer),
            pty: Some(Arc::clone(&pty)),
        };

        self.serve_requests(conn, network, Some(pty)).await
    }

    /// Step 6: for each out-of-band request on this channel, build
    /// `service/channelType/requestType` and serve it through the route
    /// tree immediately (`timeout = -1`). `exit-status` ends the loop.
    async fn serve_requests(
        &self,
        conn: crate::channel::ConnMeta,
        network: ChannelNetwork,
        pty: Option<Arc<Pty>>,
    ) -> anyhow::Result<()> {
        loop {
            let next = {
                let mut rx = network.requests.lock().await;
                tokio::select! {
                    biased;
                    _ = network.protocol_closer.notified() => None,
                    _ = network.local_closer.notified() => None,
                    req = rx.recv() => req,
                }
            };
            let Some(request) = next else { break };

            let is_exit = request.request_type == consts::REQ_EXIT_STATUS;
            let path = format!("{}/{}/{}", self.service, network.channel_type, request.request_type);
            let payload = ChannelPayload {
                handle: network.handle.clone(),
                channel_id: network.channel_id,
                request: Arc::new(AsyncMutex::new(request)),
                data: Arc::clone(&network.data),
                pty: pty.clone(),
            };

            self.route_root.serve(&path, payload, -1).await;

            if is_exit {
                break;
            }
        }

        let _ = network.handle.close(network.channel_id).await;
        info!(channel_id = ?network.channel_id, conn_id = conn.conn_id, "local channel closed");
        Ok(())
    }
}

/// Installs a default `refuse` invalid-sink on each of `session`'s known
/// request-type children (`pty-req`, `shell`, `exec`, `window-change`),
/// so a request type this crate doesn't implement gets a clean `false`
/// reply instead of silence (spec §4.7 "Refuse"). A request whose type
/// matches none of the leaf patterns fails validation at every leaf and
/// is refused by whichever one fires first; the shared payload rack's
/// once-guard makes the other leaves' invalid sinks no-ops.
///
/// `session.not_sub` itself only fires when the `session` segment fails
/// to validate, which never happens on a `service/session/<reqtype>`
/// path — so the refusal has to live on the leaves, not on `session`.
pub fn install_default_refusal(leaf_routes: &[Arc<Route<ChannelPayload>>]) {
    for route in leaf_routes {
        route.not_sub(|req| async move {
            if let Payload::Racked(rack) = &req.payload {
                if let Some(payload) = rack.release().await {
                    let mut request = payload.request.lock().await;
                    if request.want_reply {
                        request.reply(false);
                    }
                }
            }
        });
    }
}
