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

//! The proxy channel manager (spec §4.5): in proxy mode this replaces the
//! local channel manager as the subscriber to `NetworkChannels`. It does
//! not serve out-of-band requests through the route tree itself — it just
//! repackages every accepted channel into a `ChannelNetwork` (with no pty,
//! since proxy mode never runs a process locally) and publishes it on
//! `NetworkOpen`, where `proxy_broker::ProxyBroker` picks it up.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tracing::{error, info, instrument};

use crate::{
    channel::{ChannelNetwork, ChannelsPacket, NewChannel},
    pipe::Topic,
};

/// Client-side `russh` handler for the connection this crate opens to the
/// upstream SSH host on behalf of a proxy-mode session. Nothing here
/// inspects application data; every callback exists only so `russh`'s
/// client handshake has somewhere to deliver host-key verification and
/// inbound channel data for the one upstream channel the broker opened.
pub struct UpstreamHandler {
    /// Channel data arriving from upstream, forwarded to whichever proxy
    /// broker copy task is reading it.
    pub data_tx: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl russh::client::Handler for UpstreamHandler {
    type Error = russh::Error;

    /// Accept whatever host key the upstream presents. `sshframe` has no
    /// opinion on upstream host identity verification (spec's Non-goals
    /// exclude an access-control engine); a caller wanting strict checking
    /// installs its own `Handler` via a future hook rather than this one.
    async fn check_server_key(&mut self, _server_public_key: &russh_keys::key::PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn data(
        &mut self,
        _channel: russh::ChannelId,
        data: &russh::CryptoVec,
        _session: &mut russh::client::Session,
    ) -> Result<(), Self::Error> {
        let _ = self.data_tx.send(data.to_vec());
        Ok(())
    }
}

pub struct ProxyChannelManager {
    network_open: Arc<Topic<ChannelNetwork>>,
}

impl ProxyChannelManager {
    pub fn new(network_open: Arc<Topic<ChannelNetwork>>) -> Arc<Self> {
        Arc::new(ProxyChannelManager { network_open })
    }

    /// Subscribes to `network_channels` and spawns the drain loop. Mirrors
    /// `local::LocalChannelManager::install`'s shape, but every accepted
    /// channel is published straight to `network_open` with no pty and no
    /// route-tree dispatch of its own — forwarding happens in the broker.
    pub fn install(self: &Arc<Self>, network_channels: &Topic<ChannelsPacket>) -> tokio::task::JoinHandle<()> {
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
            self.publish_channel(
                packet.conn.clone(),
                new_channel,
                Arc::clone(&packet.closer),
                Arc::clone(&packet.protocol_closer),
            );
        }
        info!("connection's new-channel stream ended, proxy manager done");
    }

    fn publish_channel(
        &self,
        conn: crate::channel::ConnMeta,
        new_channel: NewChannel,
        closer: Arc<Notify>,
        protocol_closer: Arc<Notify>,
    ) {
        let network = ChannelNetwork {
            conn,
            channel_id: new_channel.channel_id,
            channel_type: new_channel.channel_type,
            extra: new_channel.extra,
            handle: new_channel.handle,
            requests: Arc::new(AsyncMutex::new(new_channel.requests)),
            data: Arc::new(AsyncMutex::new(new_channel.data)),
            local_closer: closer,
            protocol_closer,
            pty: None,
        };
        if self.network_open.subscriber_count() == 0 {
            error!("no proxy broker subscribed to network_open, dropping channel");
        }
        self.network_open.publish(network);
    }
}
